// Copyright The m1hv Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The Power State Coordination Interface service.
//!
//! Apple platforms expose no EL3 and no secure firmware, so the hypervisor
//! itself answers the PSCI calls the guest kernel makes to start, stop and
//! suspend CPUs. The implementation coordinates per-CPU requests across the
//! power domain tree: a cluster or the system may only reach a power state as
//! deep as the shallowest state any core below it asks for.

mod power_domain_tree;

use crate::{
    aarch64::{isb, prepare_cpu_power_down, wfi},
    platform::{CoresImpl, PsciPlatformImpl},
    services::{Service, owns},
    smccc::OwningEntityNumber,
    sysregs::read_isr_el1,
};
use arm_psci::{
    AffinityInfo, EntryPoint, ErrorCode, Function, FunctionId, MemProtectRange, Mpidr, PowerState,
    PsciFeature, Version,
};
use bitflags::bitflags;
use core::fmt::{self, Debug, Formatter};
use log::info;
use percore::Cores;
use power_domain_tree::{AncestorPowerDomains, CpuPowerNode, PowerDomainTree};

const FUNCTION_NUMBER_MIN: u16 = 0x0000;
const FUNCTION_NUMBER_MAX: u16 = 0x001f;

/// The power level of the CPU nodes.
pub const CPU_POWER_LEVEL: usize = 0;

/// The highest power level in the system: 0 is a CPU, 1 a cluster, 2 the
/// system domain.
pub const MAX_POWER_LEVEL: usize = 2;

/// Width in bits of one per-level local state field within an extended
/// power-state value.
pub const LOCAL_PSTATE_WIDTH: u32 = 4;

bitflags! {
    /// The set of implemented PSCI functions, one bit per function number.
    /// Queried by `PSCI_FEATURES`.
    #[derive(Debug, Eq, PartialEq, Clone, Copy)]
    #[repr(transparent)]
    pub struct PsciCapabilities: u32 {
        const VERSION = 1 << 0;
        const CPU_SUSPEND = 1 << 1;
        const CPU_OFF = 1 << 2;
        const CPU_ON = 1 << 3;
        const AFFINITY_INFO = 1 << 4;
        const SYSTEM_OFF = 1 << 8;
        const SYSTEM_RESET = 1 << 9;
        const FEATURES = 1 << 10;
        const MEM_PROTECT = 1 << 19;
        const MEM_CHECK_RANGE = 1 << 20;
    }
}

impl PsciCapabilities {
    /// The functions that also exist with SMC64 function IDs.
    const SMC64_CAPABLE: Self = Self::CPU_SUSPEND
        .union(Self::CPU_ON)
        .union(Self::AFFINITY_INFO)
        .union(Self::MEM_CHECK_RANGE);
}

/// Local power state of a single power domain node.
///
/// The ordering runs from running to powered down; the coordinated state of
/// a non-CPU node is the numeric minimum of its children's requests.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum LocalState {
    /// The domain is running.
    On = 0,
    /// Shallow retention, the WFI clock-gated state.
    IdleStandby = 1,
    /// The domain is powered down.
    Off = 2,
}

impl LocalState {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::On),
            1 => Some(Self::IdleStandby),
            2 => Some(Self::Off),
            _ => None,
        }
    }

    /// Categorises the state for suspend-request validation.
    pub fn state_type(self) -> PowerStateType {
        match self {
            Self::On => PowerStateType::Run,
            Self::IdleStandby => PowerStateType::StandbyOrRetention,
            Self::Off => PowerStateType::PowerDown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerStateType {
    PowerDown,
    StandbyOrRetention,
    Run,
}

/// The reason a core re-entered the hypervisor through the warm boot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeUpReason {
    CpuOn(EntryPoint),
    SuspendFinished(EntryPoint),
}

/// One local power state per level, from the CPU up to the system domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositePowerState {
    pub states: [LocalState; MAX_POWER_LEVEL + 1],
}

impl CompositePowerState {
    /// States set to OFF on all levels.
    pub const OFF: Self = Self {
        states: [LocalState::Off; MAX_POWER_LEVEL + 1],
    };

    /// States set to ON on all levels.
    pub const RUN: Self = Self {
        states: [LocalState::On; MAX_POWER_LEVEL + 1],
    };

    /// Unpacks an extended power-state ID: one 4-bit local state per level,
    /// level 0 in the least significant bits. Returns `None` for reserved
    /// bits or undefined per-level values.
    pub fn from_state_id(state_id: u32) -> Option<Self> {
        if state_id >> (LOCAL_PSTATE_WIDTH * (MAX_POWER_LEVEL as u32 + 1)) != 0 {
            return None;
        }

        let mut states = [LocalState::On; MAX_POWER_LEVEL + 1];
        for (level, state) in states.iter_mut().enumerate() {
            let field = (state_id >> (LOCAL_PSTATE_WIDTH * level as u32))
                & ((1 << LOCAL_PSTATE_WIDTH) - 1);
            *state = LocalState::from_raw(field)?;
        }
        Some(Self { states })
    }

    /// Returns the power state of the CPU level.
    pub fn cpu_level_state(&self) -> LocalState {
        self.states[CPU_POWER_LEVEL]
    }

    /// Finds the highest power level which is not in the running state.
    pub fn find_highest_non_run_level(&self) -> Option<usize> {
        self.states
            .iter()
            .rposition(|state| state.state_type() != PowerStateType::Run)
    }

    /// Finds the highest power level which is set to a power down state.
    pub fn find_highest_power_down_level(&self) -> Option<usize> {
        self.states
            .iter()
            .rposition(|state| state.state_type() == PowerStateType::PowerDown)
    }

    /// Fills the structure with the current local states of the given CPU
    /// node and its locked ancestors.
    pub fn set_local_states_from_nodes(
        &mut self,
        cpu: &CpuPowerNode,
        ancestors: &AncestorPowerDomains,
    ) {
        self.states[CPU_POWER_LEVEL] = cpu.local_state();

        for (node, state) in ancestors
            .iter()
            .zip(&mut self.states[CPU_POWER_LEVEL + 1..])
        {
            *state = node.local_state();
        }
    }

    /// Coordinates the requested state with the other CPUs at every ancestor
    /// level. Each node records the calling CPU's request, then settles on
    /// the minimum of all requests below it; once a level coordinates to ON,
    /// every higher level stays ON. The per-level requests are recorded as
    /// asked for even above that point, so a later last-core-down
    /// coordination still sees this CPU's vote.
    pub fn coordinate_state(&mut self, cpu_index: usize, ancestors: &mut AncestorPowerDomains) {
        let mut higher_levels_run = false;

        for (node, state) in ancestors
            .iter_mut()
            .zip(&mut self.states[CPU_POWER_LEVEL + 1..])
        {
            node.set_requested_power_state(cpu_index, *state);

            if !higher_levels_run {
                node.set_minimal_allowed_state();
                *state = node.local_state();

                if state.state_type() == PowerStateType::Run {
                    // A running level keeps everything above it running, so
                    // there is no minimum left to compute.
                    higher_levels_run = true;
                }
            } else {
                *state = LocalState::On;
            }
        }
    }

    /// Checks that the composite state does not violate any PSCI rules.
    pub fn is_valid_suspend_request(&self, is_power_down_state: bool) -> bool {
        // There should be a non-run level.
        if self.find_highest_non_run_level().is_none() {
            return false;
        }

        // Higher levels must be in a state no deeper than lower ones.
        if !self.states.is_sorted_by(|a, b| a >= b) {
            return false;
        }

        if is_power_down_state {
            // There must be a power down state.
            self.find_highest_power_down_level().is_some()
        } else {
            // Retention request: no level may be powered down.
            self.find_highest_power_down_level().is_none()
        }
    }
}

/// The hooks a platform provides under the PSCI service.
pub trait PsciPlatform {
    /// Number of CPU cores actually present.
    fn core_count(&self) -> usize;

    /// The power domain topology as the count of child nodes in BFS
    /// traversal order.
    fn topology(&self) -> &'static [usize];

    /// Maps a PSCI MPIDR value onto a logical CPU index.
    fn core_index_by_mpidr(&self, mpidr: Mpidr) -> Option<usize>;

    /// Converts a guest power-state value into a composite state, rejecting
    /// anything outside the platform's whitelist of idle states.
    fn try_parse_power_state(&self, power_state: PowerState) -> Option<CompositePowerState>;

    /// Checks a guest entry point for alignment and residence in guest
    /// memory.
    fn is_valid_entry_point(&self, entry: &EntryPoint) -> bool;

    /// Checks if the CPU has pending interrupts.
    fn has_pending_interrupts(&self) -> bool {
        read_isr_el1() != 0
    }

    /// Places the current CPU into standby and continues on interrupt.
    fn cpu_standby(&self, cpu_state: LocalState);

    /// Requests the coordinated suspend state from the hardware. Does not
    /// itself stop the CPU.
    fn power_domain_suspend(&self, target_state: &CompositePowerState);

    /// Restores the hardware after a wake-up from a suspend state.
    fn power_domain_suspend_finish(&self, previous_state: &CompositePowerState);

    /// Arms the power controller to take the current CPU offline at its next
    /// deep sleep.
    fn power_domain_off(&self, target_state: &CompositePowerState);

    /// Enters the sleep that completes a power-off. Does not return.
    fn power_domain_power_down_wfi(&self, target_state: &CompositePowerState) -> !;

    /// Releases the identified CPU towards the given entry point.
    fn power_domain_on(&self, cpu_index: usize, entry: &EntryPoint) -> Result<(), ErrorCode>;

    /// Performs platform-specific actions after a CPU has been turned on.
    fn power_domain_on_finish(&self, previous_state: &CompositePowerState);

    /// Shuts down the system. Does not return.
    fn system_off(&self) -> !;

    /// Resets the whole system. Does not return.
    fn system_reset(&self) -> !;

    /// Enables or disables memory protection, returning the previous state.
    fn mem_protect(&self, enabled: bool) -> Result<bool, ErrorCode>;

    /// Checks whether the given range is covered by memory protection.
    fn mem_protect_check_range(&self, range: MemProtectRange) -> Result<(), ErrorCode>;
}

/// The PSCI service: the power domain tree plus the platform hooks that act
/// on the coordinated states.
pub struct Psci {
    platform: PsciPlatformImpl,
    power_domain_tree: PowerDomainTree,
    capabilities: PsciCapabilities,
}

impl Psci {
    /// Initialises the PSCI state.
    ///
    /// This must be called exactly once, before any other PSCI method runs
    /// and before any secondary CPU is released.
    pub(super) fn new(platform: PsciPlatformImpl) -> Self {
        info!("Initializing PSCI");

        let power_domain_tree = PowerDomainTree::new(platform.topology());
        assert_eq!(power_domain_tree.cpu_count(), platform.core_count());

        let capabilities = PsciCapabilities::VERSION
            | PsciCapabilities::CPU_SUSPEND
            | PsciCapabilities::CPU_OFF
            | PsciCapabilities::CPU_ON
            | PsciCapabilities::AFFINITY_INFO
            | PsciCapabilities::SYSTEM_OFF
            | PsciCapabilities::SYSTEM_RESET
            | PsciCapabilities::FEATURES
            | PsciCapabilities::MEM_PROTECT
            | PsciCapabilities::MEM_CHECK_RANGE;

        {
            // The boot CPU is running; walk its path to the root and vote it
            // on everywhere.
            let cpu_index = CoresImpl::core_index();
            let mut cpu = power_domain_tree.locked_cpu_node(cpu_index);

            power_domain_tree.with_ancestors_locked(&mut cpu, |cpu, mut ancestors| {
                cpu.set_affinity_info(AffinityInfo::On);
                cpu.set_local_state(LocalState::On);

                for node in ancestors.iter_mut() {
                    node.set_requested_power_state(cpu_index, LocalState::On);
                    node.set_local_state(LocalState::On);
                }
            });
        }

        Self {
            platform,
            power_domain_tree,
            capabilities,
        }
    }

    /// Handles a `CPU_SUSPEND` call.
    ///
    /// A standby request affecting only the CPU level short-circuits into
    /// WFI; everything else goes through coordination in
    /// [`Self::cpu_suspend_start`].
    fn cpu_suspend(&self, power_state: PowerState, entry: EntryPoint) -> Result<(), ErrorCode> {
        let cpu_index = CoresImpl::core_index();
        let composite_state = self
            .platform
            .try_parse_power_state(power_state)
            .ok_or(ErrorCode::InvalidParameters)?;

        let is_power_down_state = matches!(power_state, PowerState::PowerDown(_));

        assert!(composite_state.is_valid_suspend_request(is_power_down_state));

        let target_level = composite_state
            .find_highest_non_run_level()
            .expect("Invalid target power level for suspend operation");

        if !is_power_down_state && target_level == CPU_POWER_LEVEL {
            // CPU standby, which does not affect parent nodes.
            let cpu_state = composite_state.cpu_level_state();
            self.power_domain_tree
                .locked_cpu_node(cpu_index)
                .set_local_state(cpu_state);

            // Wait for an interrupt, then run again.
            self.platform.cpu_standby(cpu_state);

            self.power_domain_tree
                .locked_cpu_node(cpu_index)
                .set_local_state(LocalState::On);

            return Ok(());
        }

        if is_power_down_state && !self.platform.is_valid_entry_point(&entry) {
            return Err(ErrorCode::InvalidAddress);
        }

        self.cpu_suspend_start(cpu_index, entry, target_level, composite_state, is_power_down_state)
    }

    /// Coordinates and enters a suspend that affects levels above the CPU.
    ///
    /// An interrupt already pending when the locks are held cancels the
    /// transition: the call returns successfully without executing WFI and
    /// without having touched the tree.
    fn cpu_suspend_start(
        &self,
        cpu_index: usize,
        entry: EntryPoint,
        target_level: usize,
        mut composite_state: CompositePowerState,
        is_power_down_state: bool,
    ) -> Result<(), ErrorCode> {
        let mut cpu = self.power_domain_tree.locked_cpu_node(cpu_index);
        let skip_wfi = self.power_domain_tree.with_ancestors_locked_to_max_level(
            &mut cpu,
            target_level,
            |cpu, mut ancestors| {
                if self.platform.has_pending_interrupts() {
                    return true;
                }

                composite_state.coordinate_state(cpu_index, &mut ancestors);
                cpu.set_local_state(composite_state.cpu_level_state());

                if is_power_down_state {
                    cpu.set_entry_point(entry);
                    cpu.set_suspend_level(target_level);
                    self.platform.power_domain_suspend(&composite_state);
                    prepare_cpu_power_down();
                } else {
                    self.platform.power_domain_suspend(&composite_state);
                }

                false
            },
        );
        drop(cpu); // Unlock the CPU before stopping.

        if skip_wfi {
            return Ok(());
        }

        isb();
        wfi();

        // Execution continues here when an interrupt wakes the core without
        // the power controller having taken it down.
        self.finish_cpu_suspend(cpu_index, target_level);
        Ok(())
    }

    /// Puts the path from the CPU up to `end_level` back into the running
    /// state after a wake-up.
    fn finish_cpu_suspend(&self, cpu_index: usize, end_level: usize) {
        let mut cpu = self.power_domain_tree.locked_cpu_node(cpu_index);
        self.power_domain_tree.with_ancestors_locked_to_max_level(
            &mut cpu,
            end_level,
            |cpu, mut ancestors| {
                let mut previous_state = CompositePowerState::RUN;
                previous_state.set_local_states_from_nodes(cpu, &ancestors);

                self.platform.power_domain_suspend_finish(&previous_state);

                let _ = cpu.pop_entry_point();
                cpu.clear_suspend_level();
                Self::set_power_domains_to_on_state(cpu_index, cpu, &mut ancestors);
            },
        );
    }

    /// Marks the CPU and its locked ancestors as running, both locally and
    /// in the requested-state bookkeeping.
    fn set_power_domains_to_on_state(
        cpu_index: usize,
        cpu: &mut CpuPowerNode,
        ancestors: &mut AncestorPowerDomains,
    ) {
        cpu.set_affinity_info(AffinityInfo::On);
        cpu.set_local_state(LocalState::On);

        for node in ancestors.iter_mut() {
            node.set_requested_power_state(cpu_index, LocalState::On);
            node.set_local_state(LocalState::On);
        }
    }

    /// Handles a `CPU_OFF` call. On success the current CPU is taken down
    /// and the call does not return.
    fn cpu_off(&self) -> Result<(), ErrorCode> {
        let cpu_index = CoresImpl::core_index();
        let mut cpu = self.power_domain_tree.locked_cpu_node(cpu_index);
        let mut composite_state = CompositePowerState::OFF;

        self.power_domain_tree
            .with_ancestors_locked(&mut cpu, |cpu, mut ancestors| {
                cpu.set_local_state(LocalState::Off);
                composite_state.coordinate_state(cpu_index, &mut ancestors);

                // From here on this core reads and writes the bookkeeping
                // without data caching.
                prepare_cpu_power_down();

                self.platform.power_domain_off(&composite_state);
            });

        cpu.set_affinity_info(AffinityInfo::Off);

        // Unlock the CPU before actually turning it off.
        drop(cpu);

        self.platform.power_domain_power_down_wfi(&composite_state);
        // Does not return.
    }

    /// Handles a `CPU_ON` call by releasing the CPU identified by
    /// `target_cpu` towards the given guest entry point.
    fn cpu_on(&self, target_cpu: Mpidr, entry: EntryPoint) -> Result<(), ErrorCode> {
        let cpu_index = self
            .platform
            .core_index_by_mpidr(target_cpu)
            .ok_or(ErrorCode::InvalidParameters)?;

        if !self.platform.is_valid_entry_point(&entry) {
            return Err(ErrorCode::InvalidAddress);
        }

        let mut cpu = self.power_domain_tree.locked_cpu_node(cpu_index);
        match cpu.affinity_info() {
            AffinityInfo::On => return Err(ErrorCode::AlreadyOn),
            AffinityInfo::OnPending => return Err(ErrorCode::OnPending),
            // The CPU was off, continue the power on.
            AffinityInfo::Off => {}
        }

        cpu.set_affinity_info(AffinityInfo::OnPending);

        match self.platform.power_domain_on(cpu_index, &entry) {
            Ok(()) => {
                cpu.set_entry_point(entry);
                Ok(())
            }
            Err(error) => {
                cpu.set_affinity_info(AffinityInfo::Off);
                Err(error)
            }
        }
    }

    /// Completes a power transition when a core re-enters the hypervisor
    /// through the warm boot path. Returns the guest entry point and the
    /// reason the core is up.
    pub fn handle_cpu_boot(&self) -> WakeUpReason {
        let cpu_index = CoresImpl::core_index();
        let mut cpu = self.power_domain_tree.locked_cpu_node(cpu_index);
        let mut wake_from_suspend = false;

        let affinity_info = cpu.affinity_info();
        assert_ne!(
            affinity_info,
            AffinityInfo::Off,
            "boot of a core that was never released"
        );

        let end_level = cpu.suspend_level().unwrap_or(MAX_POWER_LEVEL);

        self.power_domain_tree.with_ancestors_locked_to_max_level(
            &mut cpu,
            end_level,
            |cpu, mut ancestors| {
                let mut previous_state = CompositePowerState::RUN;
                previous_state.set_local_states_from_nodes(cpu, &ancestors);

                if affinity_info == AffinityInfo::OnPending {
                    // Finishing CPU_ON.
                    self.platform.power_domain_on_finish(&previous_state);
                } else {
                    // Waking up from a power-down suspend.
                    assert_eq!(
                        previous_state.cpu_level_state().state_type(),
                        PowerStateType::PowerDown
                    );
                    self.platform.power_domain_suspend_finish(&previous_state);
                    cpu.clear_suspend_level();
                    wake_from_suspend = true;
                }

                Self::set_power_domains_to_on_state(cpu_index, cpu, &mut ancestors);
            },
        );

        let entry_point = cpu.pop_entry_point();
        drop(cpu); // Unlock before a possible panic.

        let entry_point = entry_point.expect("entry point not set for booting CPU");

        if wake_from_suspend {
            WakeUpReason::SuspendFinished(entry_point)
        } else {
            WakeUpReason::CpuOn(entry_point)
        }
    }

    /// Handles an `AFFINITY_INFO` call.
    fn affinity_info(
        &self,
        target_affinity: Mpidr,
        lowest_affinity_level: u32,
    ) -> Result<AffinityInfo, ErrorCode> {
        let cpu_index = self
            .platform
            .core_index_by_mpidr(target_affinity)
            .ok_or(ErrorCode::InvalidParameters)?;

        if lowest_affinity_level as usize > CPU_POWER_LEVEL {
            // Levels above the CPU are not supported.
            return Err(ErrorCode::InvalidParameters);
        }

        Ok(self
            .power_domain_tree
            .locked_cpu_node(cpu_index)
            .affinity_info())
    }

    /// Handles a `SYSTEM_OFF` call. Does not return.
    fn system_off(&self) -> ! {
        self.platform.system_off();
    }

    /// Handles a `SYSTEM_RESET` call. Does not return.
    fn system_reset(&self) -> ! {
        self.platform.system_reset();
    }

    /// Handles a `PSCI_FEATURES` call against the capability mask.
    fn features(&self, feature: PsciFeature) -> Result<u64, ErrorCode> {
        const SUCCESS: u64 = 0;

        let function_id = match feature {
            // Querying the SMCCC version always succeeds.
            PsciFeature::SmcccVersion => return Ok(SUCCESS),
            PsciFeature::PsciFunction(function_id) => function_id,
        };

        let (capability, smc64) = match function_id {
            FunctionId::PsciVersion => (PsciCapabilities::VERSION, false),
            FunctionId::CpuSuspend32 => (PsciCapabilities::CPU_SUSPEND, false),
            FunctionId::CpuSuspend64 => (PsciCapabilities::CPU_SUSPEND, true),
            FunctionId::CpuOff => (PsciCapabilities::CPU_OFF, false),
            FunctionId::CpuOn32 => (PsciCapabilities::CPU_ON, false),
            FunctionId::CpuOn64 => (PsciCapabilities::CPU_ON, true),
            FunctionId::AffinityInfo32 => (PsciCapabilities::AFFINITY_INFO, false),
            FunctionId::AffinityInfo64 => (PsciCapabilities::AFFINITY_INFO, true),
            FunctionId::SystemOff => (PsciCapabilities::SYSTEM_OFF, false),
            FunctionId::SystemReset => (PsciCapabilities::SYSTEM_RESET, false),
            FunctionId::PsciFeatures => (PsciCapabilities::FEATURES, false),
            FunctionId::MemProtect => (PsciCapabilities::MEM_PROTECT, false),
            FunctionId::MemProtectCheckRange32 => (PsciCapabilities::MEM_CHECK_RANGE, false),
            FunctionId::MemProtectCheckRange64 => (PsciCapabilities::MEM_CHECK_RANGE, true),
            _ => return Err(ErrorCode::NotSupported),
        };

        if !self.capabilities.contains(capability) {
            return Err(ErrorCode::NotSupported);
        }
        if smc64 && !PsciCapabilities::SMC64_CAPABLE.contains(capability) {
            return Err(ErrorCode::NotSupported);
        }
        Ok(SUCCESS)
    }

    /// Handles a `MEM_PROTECT` call.
    fn mem_protect(&self, enabled: bool) -> Result<bool, ErrorCode> {
        self.platform.mem_protect(enabled)
    }

    /// Handles a `MEM_PROTECT_CHECK_RANGE` call.
    fn mem_protect_check_range(&self, range: MemProtectRange) -> Result<(), ErrorCode> {
        self.platform.mem_protect_check_range(range)
    }

    fn handle_smc_inner(&self, regs: &[u64; 4]) -> Result<u64, ErrorCode> {
        const SUCCESS: u64 = 0;
        let function = Function::try_from(regs)?;

        match function {
            Function::Version => {
                let version = Version { major: 1, minor: 1 };
                Ok(u32::from(version).into())
            }
            Function::CpuSuspend { state, entry } => {
                self.cpu_suspend(state, entry)?;
                Ok(SUCCESS)
            }
            Function::CpuOff => {
                self.cpu_off()?;
                Ok(SUCCESS)
            }
            Function::CpuOn { target_cpu, entry } => {
                self.cpu_on(target_cpu, entry)?;
                Ok(SUCCESS)
            }
            Function::AffinityInfo {
                mpidr,
                lowest_affinity_level,
            } => {
                let affinity_info = self.affinity_info(mpidr, lowest_affinity_level)?;
                Ok(u32::from(affinity_info).into())
            }
            Function::SystemOff => self.system_off(),
            Function::SystemReset => self.system_reset(),
            Function::MemProtect { enabled } => {
                let previous_state = self.mem_protect(enabled)?;
                Ok(if previous_state { 1 } else { 0 })
            }
            Function::MemProtectCheckRange { range } => {
                self.mem_protect_check_range(range)?;
                Ok(SUCCESS)
            }
            Function::Features { psci_func_id } => self.features(psci_func_id),
            _ => Err(ErrorCode::NotSupported),
        }
    }
}

impl Service for Psci {
    owns!(
        OwningEntityNumber::STANDARD_SECURE,
        FUNCTION_NUMBER_MIN..=FUNCTION_NUMBER_MAX
    );

    fn handle_smc(&self, regs: &[u64; 4]) -> u64 {
        match self.handle_smc_inner(regs) {
            Ok(result) => result,
            Err(return_code) => return_code.into(),
        }
    }
}

impl Debug for Psci {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.power_domain_tree.fmt(f)
    }
}
