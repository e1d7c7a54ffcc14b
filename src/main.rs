// Copyright The m1hv Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! m1hv: a minimal EL2 hypervisor for Apple silicon hosting a single AArch64
//! guest, providing the PSCI firmware interface the platform lacks.

#![cfg_attr(not(test), no_main)]
#![cfg_attr(not(test), no_std)]

mod aarch64;
mod adt;
mod debug;
mod exceptions;
mod logger;
mod platform;
mod services;
mod smccc;
mod sysregs;
mod uart;

#[cfg(not(test))]
mod boot {
    use crate::{
        exceptions::{enter_guest, install_vectors},
        platform::{CoresImpl, MAX_CORE_COUNT, apple},
        services::{Services, psci::WakeUpReason},
    };
    use log::info;
    use percore::Cores;

    const BOOT_STACK_SIZE: usize = 0x4000;

    /// One boot stack per core, used until each core drops into the guest.
    #[repr(C, align(16))]
    struct BootStacks([[u8; BOOT_STACK_SIZE]; MAX_CORE_COUNT]);

    static mut BOOT_STACKS: BootStacks = BootStacks([[0; BOOT_STACK_SIZE]; MAX_CORE_COUNT]);

    /// Cold boot entry for the primary CPU. `args` comes from the boot stage
    /// in x0.
    #[unsafe(no_mangle)]
    extern "C" fn hv_main(args: &'static apple::BootArgs) -> ! {
        apple::init(args);
        info!("m1hv starting on core #{}", CoresImpl::core_index());

        install_vectors();

        // Builds the PSCI service; after this point secondary cores may
        // enter through the warm boot path.
        let _ = Services::get();
        info!("PSCI service ready, entering guest");

        enter_guest(args.guest_entry, args.guest_dtb)
    }

    /// Warm entry for a core the PSCI service brought (back) up: completes
    /// the pending power transition and drops into the guest.
    #[unsafe(no_mangle)]
    extern "C" fn hv_secondary_main() -> ! {
        install_vectors();

        let entry_point = match Services::get().psci.handle_cpu_boot() {
            WakeUpReason::CpuOn(entry_point) => {
                info!("core #{} up after CPU_ON", CoresImpl::core_index());
                entry_point
            }
            WakeUpReason::SuspendFinished(entry_point) => {
                info!("core #{} resumed from suspend", CoresImpl::core_index());
                entry_point
            }
        };

        enter_guest(entry_point.entry_point_address(), entry_point.context_id())
    }

    #[cfg(target_arch = "aarch64")]
    mod asm {
        use super::{BOOT_STACK_SIZE, BOOT_STACKS};
        use core::arch::global_asm;

        // `_start` is entered once on the primary core with x0 pointing at
        // the boot arguments. `hv_secondary_entry` is entered with x0 holding
        // the core's logical index, both by released secondaries and by cores
        // rebooting out of a PSCI power-down.
        global_asm!(
            r#"
            .section .text.boot, "ax"
            .global _start
            _start:
                msr tpidr_el2, xzr
                adrp x9, {stacks}
                add x9, x9, :lo12:{stacks}
                mov x10, {stack_size}
                add sp, x9, x10
                b hv_main

            .global hv_secondary_entry
            hv_secondary_entry:
                msr tpidr_el2, x0
                adrp x9, {stacks}
                add x9, x9, :lo12:{stacks}
                mov x10, {stack_size}
                add x11, x0, 1
                madd x9, x11, x10, x9
                mov sp, x9
                b hv_secondary_main
            "#,
            stacks = sym BOOT_STACKS,
            stack_size = const BOOT_STACK_SIZE,
        );
    }
}
