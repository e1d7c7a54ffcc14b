// Copyright The m1hv Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Barrier, hint and cache-maintenance instructions.
//!
//! Cache maintenance is part of the PSCI state-machine contract here: the
//! power-domain bookkeeping is read by cores whose data caches are disabled,
//! so every shared field is cleaned and invalidated to the point of coherency
//! after it is written.

#[cfg(all(target_arch = "aarch64", not(test)))]
use core::arch::asm;

use crate::sysregs::{read_sctlr_el2, write_sctlr_el2};

/// Cacheability control bit of SCTLR_EL2.
const SCTLR_C: u64 = 1 << 2;

/// The largest data cache line size across the supported SoCs.
pub const CACHE_WRITEBACK_GRANULE: usize = 1 << 6;

/// Issues a full system (`sy`) data synchronization barrier.
pub fn dsb_sy() {
    // SAFETY: `dsb` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("dsb sy", options(nostack));
    }
}

/// Issues a data synchronization barrier limited to the inner shareable
/// domain.
pub fn dsb_ish() {
    // SAFETY: `dsb` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("dsb ish", options(nostack));
    }
}

/// Issues an instruction synchronization barrier.
pub fn isb() {
    // SAFETY: `isb` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("isb", options(nostack));
    }
}

/// Signals an event to all cores, waking any that wait in WFE.
pub fn sev() {
    // SAFETY: `sev` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("sev");
    }
}

/// Waits for an interrupt, the architectural standby state.
pub fn wfi() {
    // SAFETY: `wfi` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        asm!("wfi", options(nostack));
    }
}

/// Cleans and invalidates every data cache line covering `size` bytes from
/// `address` (`dc civac`), then completes with a barrier.
pub fn clean_invalidate_range(address: *const (), size: usize) {
    #[cfg(all(target_arch = "aarch64", not(test)))]
    {
        let start = address as usize & !(CACHE_WRITEBACK_GRANULE - 1);
        let end = address as usize + size;
        let mut line = start;
        while line < end {
            // SAFETY: `dc civac` performs cache maintenance only; it does not
            // modify the memory contents at `line`.
            unsafe {
                asm!("dc civac, {line}", line = in(reg) line, options(nostack));
            }
            line += CACHE_WRITEBACK_GRANULE;
        }
        dsb_ish();
    }
    #[cfg(not(all(target_arch = "aarch64", not(test))))]
    let _ = (address, size);
}

/// Cleans and invalidates the cache lines holding `object`.
///
/// Other cores read the power-domain records through main memory once their
/// caches are off, so shared records are pushed out after every write.
pub fn clean_invalidate_object<T>(object: &T) {
    clean_invalidate_range(object as *const T as *const (), size_of::<T>());
}

/// Turns off data caching at EL2 by clearing SCTLR_EL2.C.
pub fn disable_data_cache() {
    write_sctlr_el2(read_sctlr_el2() & !SCTLR_C);
    isb();
}

/// Turns data caching at EL2 back on.
pub fn enable_data_cache() {
    write_sctlr_el2(read_sctlr_el2() | SCTLR_C);
    isb();
}

/// Cleans and invalidates the entire data cache by set/way, walking every
/// level of cache reported by CLIDR_EL1.
pub fn clean_invalidate_all_data_cache() {
    #[cfg(all(target_arch = "aarch64", not(test)))]
    {
        const CLIDR_CTYPE_WIDTH: u64 = 3;
        // Cache types below this hold no data (none or instruction only).
        const CTYPE_DATA: u64 = 2;

        let clidr: u64;
        // SAFETY: CLIDR_EL1 is a read-only identification register.
        unsafe {
            asm!("mrs {clidr}, clidr_el1", clidr = out(reg) clidr, options(nostack));
        }

        for level in 0..7u64 {
            let cache_type = (clidr >> (CLIDR_CTYPE_WIDTH * level)) & 0b111;
            if cache_type < CTYPE_DATA {
                if cache_type == 0 {
                    break;
                }
                continue;
            }

            let ccsidr: u64;
            // SAFETY: Selecting a cache level in CSSELR_EL1 and reading the
            // matching CCSIDR_EL1 has no side effects beyond the selection
            // register itself.
            unsafe {
                asm!(
                    "msr csselr_el1, {selector}",
                    "isb",
                    "mrs {ccsidr}, ccsidr_el1",
                    selector = in(reg) level << 1,
                    ccsidr = out(reg) ccsidr,
                    options(nostack),
                );
            }

            let line_shift = (ccsidr & 0x7) + 4;
            let last_way = (ccsidr >> 3) & 0x3ff;
            let last_set = (ccsidr >> 13) & 0x7fff;
            let way_shift = (last_way as u32).leading_zeros();

            for way in 0..=last_way {
                for set in 0..=last_set {
                    let operand = (way << way_shift) | (set << line_shift) | (level << 1);
                    // SAFETY: `dc cisw` performs cache maintenance only.
                    unsafe {
                        asm!("dc cisw, {operand}", operand = in(reg) operand, options(nostack));
                    }
                }
            }
        }

        dsb_sy();
        isb();
    }
}

/// Architectural preparation for taking this core towards power-off: data
/// caching is turned off and everything dirty is pushed to memory, so the
/// bookkeeping written afterwards is visible to the other cores.
pub fn prepare_cpu_power_down() {
    disable_data_cache();
    clean_invalidate_all_data_cache();
}
