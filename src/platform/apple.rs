// Copyright The m1hv Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Platform support for Apple silicon SoCs (M1 and M2 families).
//!
//! Everything configurable is discovered at runtime from the Apple Device
//! Tree: the chip identifier selects the static power topology and the
//! per-chip PMGR layout, the `/cpus` children describe where each core sits,
//! and the MMIO bases come from `/arm-io`.

use crate::{
    aarch64::{clean_invalidate_range, dsb_sy, isb, sev, wfi},
    adt::Adt,
    logger::LogSink,
    platform::{CoresImpl, MAX_CORE_COUNT},
    services::psci::{CompositePowerState, LocalState, PsciPlatform},
};
#[cfg(not(test))]
use crate::{
    logger::{self, LockedWriter},
    platform::Platform,
    uart::Uart,
};
use arm_psci::{EntryPoint, ErrorCode, MemProtectRange, Mpidr, PowerState};
use arrayvec::ArrayVec;
use core::ops::Range;
use log::error;
use percore::Cores;
#[cfg(not(test))]
use spin::mutex::SpinMutex;

/// Stride between the per-die PMGR register blocks on two-die parts.
const PMGR_DIE_STRIDE: u64 = 0x20_0000_0000;

/// Watchdog register block: the count ticks towards the alarm, and bit 2 of
/// the control register arms the system reset.
const WDT_SYS_RST_COUNT: u64 = 0x10;
const WDT_SYS_RST_ALARM: u64 = 0x14;
const WDT_SYS_RST_CTL: u64 = 0x1c;
const WDT_SYS_RST_CTL_ENABLE: u32 = 1 << 2;

/// MPIDR bit 31 is RES1 on these cores.
const MPIDR_RES1: u64 = 1 << 31;
/// Synthetic MPIDR bit marking a performance core.
const MPIDR_PCORE: u64 = 1 << 16;

/// The supported chip identifiers, as reported by the `chip-id` property of
/// `/chosen`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChipId {
    T8103,
    T8112,
    T6000,
    T6001,
    T6002,
    T6020,
    T6021,
}

impl ChipId {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0x8103 => Some(Self::T8103),
            0x8112 => Some(Self::T8112),
            0x6000 => Some(Self::T6000),
            0x6001 => Some(Self::T6001),
            0x6002 => Some(Self::T6002),
            0x6020 => Some(Self::T6020),
            0x6021 => Some(Self::T6021),
            _ => None,
        }
    }

    /// The power domain topology of the chip: the count of child nodes of
    /// each domain in BFS order from the root. E-core clusters come first;
    /// the two-die T6002 doubles the cluster list of the single-die part
    /// under the one root.
    pub fn topology(self) -> &'static [usize] {
        match self {
            Self::T8103 | Self::T8112 => &[1, 2, 4, 4],
            Self::T6000 | Self::T6001 => &[1, 3, 2, 4, 4],
            Self::T6002 => &[1, 6, 2, 4, 4, 2, 4, 4],
            Self::T6020 | Self::T6021 => &[1, 3, 4, 4, 4],
        }
    }

    /// Offset of the "CPU start" register block within the PMGR region.
    pub fn cpu_start_offset(self) -> u64 {
        match self {
            Self::T8103 | Self::T6000 | Self::T6001 | Self::T6002 => 0x54000,
            Self::T8112 => 0x34000,
            Self::T6020 | Self::T6021 => 0x28000,
        }
    }
}

/// Static placement of one logical CPU, cached from its `/cpus` node.
#[derive(Clone, Copy, Debug)]
pub struct CpuEntry {
    /// The low 16 MPIDR bits, the SoC "reg" identifier.
    pub reg: u32,
    /// Cluster index local to the die.
    pub cluster: u8,
    /// Die the cluster sits on.
    pub die: u8,
    /// Core number within the cluster.
    pub core: u8,
    /// Synthesised MPIDR value for the guest-facing interface.
    pub mpidr: u64,
}

/// Hand-off from the boot stage, passed in `x0` to `hv_main`.
#[repr(C)]
pub struct BootArgs {
    pub adt_base: u64,
    pub adt_size: u64,
    pub uart_base: u64,
    pub spin_table_base: u64,
    pub guest_ram_base: u64,
    pub guest_ram_size: u64,
    pub guest_entry: u64,
    pub guest_dtb: u64,
}

/// The Apple silicon platform.
#[cfg(not(test))]
pub struct Apple;

#[cfg(not(test))]
static PSCI_PLATFORM: SpinMutex<Option<AppleSoc>> = SpinMutex::new(None);

/// Discovers the SoC and brings up the console. Called once on the boot CPU
/// before anything else uses the platform.
#[cfg(not(test))]
pub fn init(args: &BootArgs) {
    // SAFETY: The boot stage passes the base of the UART it has already
    // configured, and nothing else accesses it.
    let uart = unsafe { Uart::new(args.uart_base as *mut u32) };
    logger::init(LockedWriter::new(uart)).expect("Failed to initialise logger");

    // SAFETY: The boot stage guarantees the ADT blob stays mapped and
    // untouched for the lifetime of the hypervisor.
    let data =
        unsafe { core::slice::from_raw_parts(args.adt_base as *const u8, args.adt_size as usize) };
    let adt = Adt::new(data).expect("malformed device tree");

    let soc = AppleSoc::from_adt(
        &adt,
        args.spin_table_base,
        args.guest_ram_base..args.guest_ram_base + args.guest_ram_size,
    )
    .expect("unsupported SoC");

    log::info!(
        "{:?}: {} cores, pmgr at {:#x}",
        soc.chip,
        soc.cpus.len(),
        soc.pmgr_base
    );

    *PSCI_PLATFORM.lock() = Some(soc);
}

#[cfg(not(test))]
impl Platform for Apple {
    type LogSinkImpl = LockedWriter<Uart>;
    type PsciPlatformImpl = AppleSoc;

    fn psci_platform() -> Option<AppleSoc> {
        PSCI_PLATFORM.lock().take()
    }
}

/// PSCI platform implementation for one discovered SoC.
pub struct AppleSoc {
    chip: ChipId,
    pmgr_base: u64,
    wdt_base: u64,
    spin_table_base: u64,
    guest_ram: Range<u64>,
    cpus: ArrayVec<CpuEntry, MAX_CORE_COUNT>,
}

impl AppleSoc {
    /// Builds the platform description from the device tree. Returns `None`
    /// for unknown chips, missing devices or a CPU list that does not match
    /// the chip's topology.
    pub fn from_adt(adt: &Adt, spin_table_base: u64, guest_ram: Range<u64>) -> Option<Self> {
        let chip = ChipId::from_raw(adt.node_by_path("/chosen")?.property_u32("chip-id")?)?;
        let pmgr_base = adt.device_base("/arm-io/pmgr")?;
        let wdt_base = adt.device_base("/arm-io/wdt")?;

        let mut slots: [Option<CpuEntry>; MAX_CORE_COUNT] = [None; MAX_CORE_COUNT];
        let mut found = 0;
        for node in adt.node_by_path("/cpus")?.children() {
            let Some(cpu_id) = node.property_u32("cpu-id") else {
                continue;
            };
            let reg = node.property_u32("reg")?;
            let cluster = node.property_u32("die-cluster-id")? as u8;
            let die = node.property_u32("die-id")? as u8;
            let core = node.property_u32("cluster-core-id")? as u8;
            let cluster_type = *node.property("cluster-type")?.first()?;

            let mut mpidr = MPIDR_RES1 | u64::from(reg) & 0xffff;
            if cluster_type == b'P' {
                mpidr |= MPIDR_PCORE;
            }

            *slots.get_mut(cpu_id as usize)? = Some(CpuEntry {
                reg,
                cluster,
                die,
                core,
                mpidr,
            });
            found += 1;
        }

        // Logical CPU ids must be dense: entry N lives at index N.
        let mut cpus = ArrayVec::new();
        for slot in slots.iter().take(found) {
            cpus.push((*slot)?);
        }

        let expected: usize = chip.topology()[2..].iter().sum();
        if cpus.len() != expected {
            return None;
        }

        Some(Self {
            chip,
            pmgr_base,
            wdt_base,
            spin_table_base,
            guest_ram,
            cpus,
        })
    }

    /// The chip this platform was built for.
    pub fn chip(&self) -> ChipId {
        self.chip
    }

    /// The synthesised MPIDR of a logical CPU.
    pub fn mpidr_value(&self, cpu_index: usize) -> u64 {
        self.cpus[cpu_index].mpidr
    }

    /// Address of the per-die "CPU start" register.
    pub fn cpu_start_register(&self, die: u8) -> u64 {
        self.pmgr_base + self.chip.cpu_start_offset() + u64::from(die) * PMGR_DIE_STRIDE
    }

    /// Bitmap value selecting one core in a "CPU start" register.
    pub fn cpu_start_bit(cluster: u8, core: u8) -> u32 {
        1 << (4 * u32::from(cluster) + u32::from(core))
    }

    /// Flushes the console and reboots through the watchdog. The closest
    /// thing to a power-off reachable from EL2 is a reset that never hands
    /// control back to the guest.
    fn watchdog_reset(&self) -> ! {
        if let Some(sink) = crate::logger::get_log_sink() {
            sink.flush();
        }

        write_mmio_u32(self.wdt_base + WDT_SYS_RST_COUNT, 0);
        write_mmio_u32(self.wdt_base + WDT_SYS_RST_ALARM, 0x10_0000);
        write_mmio_u32(self.wdt_base + WDT_SYS_RST_CTL, WDT_SYS_RST_CTL_ENABLE);

        loop {
            wfi();
        }
    }
}

impl PsciPlatform for AppleSoc {
    fn core_count(&self) -> usize {
        self.cpus.len()
    }

    fn topology(&self) -> &'static [usize] {
        self.chip.topology()
    }

    fn core_index_by_mpidr(&self, mpidr: Mpidr) -> Option<usize> {
        // Every "reg" value is unique across dies, so the low 16 bits
        // identify the core.
        let reg = (u64::from(mpidr) & 0xffff) as u32;
        self.cpus.iter().position(|cpu| cpu.reg == reg)
    }

    fn try_parse_power_state(&self, power_state: PowerState) -> Option<CompositePowerState> {
        parse_idle_state(power_state)
    }

    fn is_valid_entry_point(&self, entry: &EntryPoint) -> bool {
        let pc = entry.entry_point_address();
        pc % 4 == 0 && self.guest_ram.contains(&pc)
    }

    fn cpu_standby(&self, _cpu_state: LocalState) {
        isb();
        wfi();
    }

    fn power_domain_suspend(&self, _target_state: &CompositePowerState) {
        // Nothing to program up front: the PMGR acts when the core enters
        // its next deep sleep.
    }

    fn power_domain_suspend_finish(&self, previous_state: &CompositePowerState) {
        if previous_state.cpu_level_state() == LocalState::Off {
            // The core kept running with caching off because the power-down
            // was cancelled by a wake-up.
            crate::aarch64::enable_data_cache();
        }
    }

    fn power_domain_off(&self, _target_state: &CompositePowerState) {
        let cpu = &self.cpus[CoresImpl::core_index()];
        write_mmio_u32(
            self.cpu_start_register(cpu.die),
            Self::cpu_start_bit(cpu.cluster, cpu.core),
        );
    }

    fn power_domain_power_down_wfi(&self, _target_state: &CompositePowerState) -> ! {
        arm_deep_sleep();
        dsb_sy();
        loop {
            wfi();
        }
    }

    fn power_domain_on(&self, cpu_index: usize, entry: &EntryPoint) -> Result<(), ErrorCode> {
        // The target core spins on its release slot; write the entry point
        // there, push it to memory and wake the spinners.
        let slot = (self.spin_table_base + cpu_index as u64 * 8) as *mut u64;
        // SAFETY: The boot stage reserved one 8-byte release slot per core at
        // `spin_table_base`; `cpu_index` is bounded by the CPU table.
        unsafe {
            slot.write_volatile(entry.entry_point_address());
        }
        clean_invalidate_range(slot as *const (), size_of::<u64>());
        dsb_sy();
        sev();
        Ok(())
    }

    fn power_domain_on_finish(&self, _previous_state: &CompositePowerState) {}

    fn system_off(&self) -> ! {
        // There is no way to cut power from EL2; park the machine through a
        // reset instead.
        error!("SYSTEM_OFF requested, resetting instead");
        self.watchdog_reset();
    }

    fn system_reset(&self) -> ! {
        self.watchdog_reset();
    }

    fn mem_protect(&self, _enabled: bool) -> Result<bool, ErrorCode> {
        // Nothing is persisted across boots, so protection is never active.
        Ok(false)
    }

    fn mem_protect_check_range(&self, _range: MemProtectRange) -> Result<(), ErrorCode> {
        Ok(())
    }
}

fn write_mmio_u32(address: u64, value: u32) {
    // SAFETY: The addresses written through here come from the device tree
    // regions reserved to the hypervisor.
    unsafe {
        (address as *mut u32).write_volatile(value);
    }
}

/// Keeps the core from returning out of its next WFI, so the PMGR can take
/// the power domain down.
fn arm_deep_sleep() {
    #[cfg(all(target_arch = "aarch64", not(test)))]
    {
        const CYC_OVRD_DISABLE_WFI_RET: u64 = 1 << 0;

        let mut cyc_ovrd: u64;
        // SAFETY: Setting the WFI-return disable bit of the IMP-DEF cycle
        // override register is the documented way to make the next WFI
        // terminal on these cores.
        unsafe {
            core::arch::asm!(
                "mrs {cyc_ovrd}, s3_5_c15_c5_0",
                cyc_ovrd = out(reg) cyc_ovrd,
                options(nostack),
            );
            cyc_ovrd |= CYC_OVRD_DISABLE_WFI_RET;
            core::arch::asm!(
                "msr s3_5_c15_c5_0, {cyc_ovrd}",
                cyc_ovrd = in(reg) cyc_ovrd,
                options(nostack),
            );
        }
    }
}

/// The idle states the guest may request, as extended power-state values
/// holding one 4-bit local state per level.
///
/// * core standby: the calling core clock-gates in WFI;
/// * cluster standby: the cluster may fall into retention with its cores;
/// * system sleep: everything powers down.
///
/// Cluster power-off exists in the hardware but is not accepted until the
/// wake path for it is understood.
fn parse_idle_state(power_state: PowerState) -> Option<CompositePowerState> {
    const CORE_STANDBY: u32 = 0x001;
    const CLUSTER_STANDBY: u32 = 0x011;
    const SYSTEM_SLEEP: u32 = 0x222;

    let state_id = match power_state {
        PowerState::StandbyOrRetention(id @ (CORE_STANDBY | CLUSTER_STANDBY)) => id,
        PowerState::PowerDown(id @ SYSTEM_SLEEP) => id,
        _ => return None,
    };
    CompositePowerState::from_state_id(state_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adt::test_blob::{node, property};

    fn cpu_node(
        name: &str,
        cpu_id: u32,
        reg: u32,
        cluster: u32,
        die: u32,
        core: u32,
        cluster_type: u8,
    ) -> Vec<u8> {
        node(
            name,
            vec![
                property("cpu-id", &cpu_id.to_le_bytes()),
                property("reg", &reg.to_le_bytes()),
                property("die-cluster-id", &cluster.to_le_bytes()),
                property("die-id", &die.to_le_bytes()),
                property("cluster-core-id", &core.to_le_bytes()),
                property("cluster-type", &[cluster_type, 0, 0, 0]),
            ],
            &[],
        )
    }

    /// A T8103-shaped tree: one E and one P cluster of four cores each.
    fn sample_adt_blob() -> Vec<u8> {
        let mut cpus = Vec::new();
        for core in 0..4 {
            cpus.push(cpu_node(
                &format!("cpu{core}"),
                core,
                core,
                0,
                0,
                core,
                b'E',
            ));
        }
        for core in 0..4 {
            cpus.push(cpu_node(
                &format!("cpu{}", core + 4),
                core + 4,
                0x100 | core,
                1,
                0,
                core,
                b'P',
            ));
        }

        let arm_io = node(
            "arm-io",
            vec![property(
                "ranges",
                &[
                    0u64.to_le_bytes(),
                    0x2_0000_0000u64.to_le_bytes(),
                    0x4_0000_0000u64.to_le_bytes(),
                ]
                .concat(),
            )],
            &[
                node(
                    "pmgr",
                    vec![property(
                        "reg",
                        &[0x3b70_0000u64.to_le_bytes(), 0x14000u64.to_le_bytes()].concat(),
                    )],
                    &[],
                ),
                node(
                    "wdt",
                    vec![property(
                        "reg",
                        &[0x2b70_0000u64.to_le_bytes(), 0x4000u64.to_le_bytes()].concat(),
                    )],
                    &[],
                ),
            ],
        );
        let chosen = node(
            "chosen",
            vec![property("chip-id", &0x8103u32.to_le_bytes())],
            &[],
        );
        node(
            "device-tree",
            vec![],
            &[chosen, node("cpus", vec![], &cpus), arm_io],
        )
    }

    fn sample_soc() -> AppleSoc {
        let blob = sample_adt_blob();
        // The blob is only read during construction, so the leak keeps the
        // test simple.
        let data: &'static [u8] = Box::leak(blob.into_boxed_slice());
        let adt = Adt::new(data).unwrap();
        AppleSoc::from_adt(&adt, 0x8_0000, 0x1_0000_0000..0x2_0000_0000).unwrap()
    }

    #[test]
    fn chip_topologies_match_core_counts() {
        // Descriptor shape: root, cluster count, cores per cluster.
        for (chip, cores) in [
            (ChipId::T8103, 8),
            (ChipId::T8112, 8),
            (ChipId::T6000, 10),
            (ChipId::T6001, 10),
            (ChipId::T6002, 20),
            (ChipId::T6020, 12),
            (ChipId::T6021, 12),
        ] {
            let topology = chip.topology();
            assert_eq!(topology[0], 1, "{chip:?}");
            assert_eq!(topology[1], topology.len() - 2, "{chip:?}");
            assert_eq!(topology[2..].iter().sum::<usize>(), cores, "{chip:?}");
        }

        // The two-die part doubles the single-die cluster list.
        let single = ChipId::T6000.topology();
        let double = ChipId::T6002.topology();
        assert_eq!(double[1], single[1] * 2);
        assert_eq!(&double[2..5], &single[2..]);
        assert_eq!(&double[5..], &single[2..]);
    }

    #[test]
    fn unknown_chip_rejected() {
        assert_eq!(ChipId::from_raw(0x7000), None);
        assert_eq!(ChipId::from_raw(0x8103), Some(ChipId::T8103));
    }

    #[test]
    fn soc_from_adt() {
        let soc = sample_soc();

        assert_eq!(soc.chip(), ChipId::T8103);
        assert_eq!(soc.core_count(), 8);
        assert_eq!(soc.pmgr_base, 0x2_0000_0000 + 0x3b70_0000);
        assert_eq!(soc.wdt_base, 0x2_0000_0000 + 0x2b70_0000);

        // E-cores carry only the RES1 bit; P-cores get the type bit too.
        assert_eq!(soc.mpidr_value(0), MPIDR_RES1);
        assert_eq!(soc.mpidr_value(4), MPIDR_RES1 | MPIDR_PCORE | 0x100);
    }

    #[test]
    fn mpidr_translation() {
        let soc = sample_soc();

        assert_eq!(
            soc.core_index_by_mpidr(Mpidr::from_aff3210(0, 0, 0, 2)),
            Some(2)
        );
        assert_eq!(
            soc.core_index_by_mpidr(Mpidr::from_aff3210(0, 0, 1, 3)),
            Some(7)
        );
        assert_eq!(soc.core_index_by_mpidr(Mpidr::from_aff3210(0, 0, 4, 0)), None);
    }

    #[test]
    fn cpu_start_register_addressing() {
        let soc = sample_soc();

        // Die 0 register sits at the chip's offset within the PMGR; the
        // second die is one PMGR stride away.
        assert_eq!(
            soc.cpu_start_register(0),
            0x2_0000_0000 + 0x3b70_0000 + 0x54000
        );
        assert_eq!(
            soc.cpu_start_register(1),
            soc.cpu_start_register(0) + PMGR_DIE_STRIDE
        );

        assert_eq!(AppleSoc::cpu_start_bit(0, 0), 0x1);
        assert_eq!(AppleSoc::cpu_start_bit(1, 2), 1 << 6);
    }

    #[test]
    fn entry_point_validation() {
        let soc = sample_soc();
        let valid = EntryPoint::Entry64 {
            entry_point_address: 0x1_0000_0000,
            context_id: 0,
        };
        let unaligned = EntryPoint::Entry64 {
            entry_point_address: 0x1_0000_0002,
            context_id: 0,
        };
        let outside = EntryPoint::Entry64 {
            entry_point_address: 0x2_0000_0000,
            context_id: 0,
        };

        assert!(soc.is_valid_entry_point(&valid));
        assert!(!soc.is_valid_entry_point(&unaligned));
        assert!(!soc.is_valid_entry_point(&outside));
    }

    #[test]
    fn idle_state_whitelist() {
        assert!(parse_idle_state(PowerState::StandbyOrRetention(0x001)).is_some());
        assert!(parse_idle_state(PowerState::StandbyOrRetention(0x011)).is_some());
        assert!(parse_idle_state(PowerState::PowerDown(0x222)).is_some());

        // Anything else is refused, including well-formed states that are
        // not on the list.
        assert!(parse_idle_state(PowerState::StandbyOrRetention(0x111)).is_none());
        assert!(parse_idle_state(PowerState::PowerDown(0x002)).is_none());
        assert!(parse_idle_state(PowerState::StandbyOrRetention(0xf)).is_none());
    }
}
