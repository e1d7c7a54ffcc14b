// Copyright The m1hv Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! EL2 exception entry: the vector table, the trap frame, and the routing of
//! guest SMCs into the service dispatcher.
//!
//! PSCI carries its own per-node locks, so SMC handling deliberately runs
//! outside any global hypervisor serialisation. Exception classes other than
//! SMC belong to subsystems that are not part of this build and end in a
//! diagnostic panic.

use crate::{
    aarch64::isb,
    services::Services,
    sysregs::{
        Esr, ExceptionClass, read_elr_el2, read_esr_el2, read_far_el2, read_sp_el0, read_sp_el1,
        read_spsr_el2, write_elr_el2, write_spsr_el2, write_vbar_el2,
    },
};
use log::error;

/// Size of an SMC instruction, for stepping ELR past a completed call.
const SMC_INSTRUCTION_SIZE: u64 = 4;

/// SPSR value for the first entry into the guest: AArch64 EL1 with SP_EL1,
/// all exceptions masked.
const SPSR_GUEST_ENTRY: u64 = 0x3c5;

/// Saved state of the interrupted guest context.
///
/// The general purpose registers are stored by the vector stubs; the system
/// register snapshot is captured by the Rust handler on top. `regs` has a
/// 32nd slot so the stubs can store X30 with a paired instruction.
#[derive(Clone, Debug, Default)]
#[repr(C)]
pub struct TrapFrame {
    /// X0-X30, plus one zero slot.
    pub regs: [u64; 32],
    pub spsr: u64,
    pub elr: u64,
    pub esr: u64,
    pub far: u64,
    pub sp_el0: u64,
    pub sp_el1: u64,
}

impl TrapFrame {
    /// Captures the syndrome and return state of the trapped context.
    fn capture_system_state(&mut self) {
        self.spsr = read_spsr_el2();
        self.elr = read_elr_el2();
        self.esr = read_esr_el2().0;
        self.far = read_far_el2();
        self.sp_el0 = read_sp_el0();
        self.sp_el1 = read_sp_el1();
        isb();
    }

    /// Writes the (possibly updated) return state back for the ERET.
    fn restore_system_state(&self) {
        write_spsr_el2(self.spsr);
        write_elr_el2(self.elr);
    }
}

/// Handler for synchronous exceptions from the guest.
///
/// An SMC is dispatched to the owning service, the result lands in the
/// frame's X0 and ELR steps past the instruction. Everything else is outside
/// this hypervisor's scope.
#[unsafe(no_mangle)]
extern "C-unwind" fn hv_exc_sync(frame: &mut TrapFrame) {
    frame.capture_system_state();

    match Esr(frame.esr).exception_class() {
        ExceptionClass::Smc64 => {
            Services::get().handle_smc(frame);
            frame.elr += SMC_INSTRUCTION_SIZE;
            frame.restore_system_state();
        }
        class => unhandled_guest_exception("synchronous exception", frame, class),
    }
}

#[unsafe(no_mangle)]
extern "C-unwind" fn hv_exc_irq(frame: &mut TrapFrame) {
    frame.capture_system_state();
    unhandled_guest_exception("IRQ", frame, Esr(frame.esr).exception_class());
}

#[unsafe(no_mangle)]
extern "C-unwind" fn hv_exc_fiq(frame: &mut TrapFrame) {
    frame.capture_system_state();
    unhandled_guest_exception("FIQ", frame, Esr(frame.esr).exception_class());
}

#[unsafe(no_mangle)]
extern "C-unwind" fn hv_exc_serror(frame: &mut TrapFrame) {
    frame.capture_system_state();
    unhandled_guest_exception("SError", frame, Esr(frame.esr).exception_class());
}

#[unsafe(no_mangle)]
extern "C-unwind" fn hv_exc_invalid(frame: &mut TrapFrame) {
    frame.capture_system_state();
    unhandled_guest_exception("exception from EL2", frame, Esr(frame.esr).exception_class());
}

fn unhandled_guest_exception(kind: &str, frame: &TrapFrame, class: ExceptionClass) -> ! {
    error!(
        "Unhandled guest {kind} ({class:?}): esr={:#x} elr={:#x} far={:#x} spsr={:#x}",
        frame.esr, frame.elr, frame.far, frame.spsr
    );
    panic!("unhandled guest {kind}");
}

/// Points VBAR_EL2 at the vector table. Must run on every core before it
/// enters the guest.
#[cfg(all(target_arch = "aarch64", not(test)))]
pub fn install_vectors() {
    unsafe extern "C" {
        static hv_exception_vectors: u8;
    }
    // SAFETY: Only the address of the table is taken; the symbol is defined
    // by the assembly below.
    let vectors = unsafe { &raw const hv_exception_vectors };
    write_vbar_el2(vectors as u64);
    isb();
}

#[cfg(not(all(target_arch = "aarch64", not(test))))]
pub fn install_vectors() {
    write_vbar_el2(0);
}

/// Drops to EL1 at the given entry point with `arg0` in X0. The rest of the
/// guest register state starts zeroed.
pub fn enter_guest(entry: u64, arg0: u64) -> ! {
    write_spsr_el2(SPSR_GUEST_ENTRY);
    write_elr_el2(entry);

    #[cfg(all(target_arch = "aarch64", not(test)))]
    // SAFETY: SPSR and ELR select EL1 and a validated guest entry point;
    // nothing in EL2 state is live across the ERET.
    unsafe {
        core::arch::asm!(
            "mov x0, {arg0}",
            "mov x1, xzr",
            "mov x2, xzr",
            "mov x3, xzr",
            "dsb ish",
            "isb",
            "eret",
            arg0 = in(reg) arg0,
            options(noreturn),
        );
    }

    #[cfg(not(all(target_arch = "aarch64", not(test))))]
    {
        let _ = arg0;
        unreachable!("enter_guest is only meaningful on hardware");
    }
}

#[cfg(all(target_arch = "aarch64", not(test)))]
mod vectors {
    use core::arch::global_asm;

    // Each of the 16 vector slots branches to a shared stub that builds a
    // `TrapFrame` on the stack and hands it to the matching Rust handler.
    // The frame layout must stay in sync with the struct above: 32 GP slots
    // followed by the system register snapshot the handler fills in.
    global_asm!(
        r#"
        .macro frame_call handler
            sub sp, sp, {frame_size}
            stp x0, x1, [sp, #0x00]
            stp x2, x3, [sp, #0x10]
            stp x4, x5, [sp, #0x20]
            stp x6, x7, [sp, #0x30]
            stp x8, x9, [sp, #0x40]
            stp x10, x11, [sp, #0x50]
            stp x12, x13, [sp, #0x60]
            stp x14, x15, [sp, #0x70]
            stp x16, x17, [sp, #0x80]
            stp x18, x19, [sp, #0x90]
            stp x20, x21, [sp, #0xa0]
            stp x22, x23, [sp, #0xb0]
            stp x24, x25, [sp, #0xc0]
            stp x26, x27, [sp, #0xd0]
            stp x28, x29, [sp, #0xe0]
            stp x30, xzr, [sp, #0xf0]
            mov x0, sp
            bl \handler
            ldp x2, x3, [sp, #0x10]
            ldp x4, x5, [sp, #0x20]
            ldp x6, x7, [sp, #0x30]
            ldp x8, x9, [sp, #0x40]
            ldp x10, x11, [sp, #0x50]
            ldp x12, x13, [sp, #0x60]
            ldp x14, x15, [sp, #0x70]
            ldp x16, x17, [sp, #0x80]
            ldp x18, x19, [sp, #0x90]
            ldp x20, x21, [sp, #0xa0]
            ldp x22, x23, [sp, #0xb0]
            ldp x24, x25, [sp, #0xc0]
            ldp x26, x27, [sp, #0xd0]
            ldp x28, x29, [sp, #0xe0]
            ldr x30, [sp, #0xf0]
            ldp x0, x1, [sp, #0x00]
            add sp, sp, {frame_size}
            eret
        .endm

        .macro vector_slot target
            .balign 0x80
            b \target
        .endm

        .section .text.hv_exception_vectors, "ax"
        .balign 0x800
        .global hv_exception_vectors
        hv_exception_vectors:
        /* Current EL with SP_EL0 */
        vector_slot vector_invalid
        vector_slot vector_invalid
        vector_slot vector_invalid
        vector_slot vector_invalid
        /* Current EL with SP_ELx */
        vector_slot vector_invalid
        vector_slot vector_invalid
        vector_slot vector_invalid
        vector_slot vector_invalid
        /* Lower EL, AArch64 */
        vector_slot vector_sync_lower
        vector_slot vector_irq_lower
        vector_slot vector_fiq_lower
        vector_slot vector_serror_lower
        /* Lower EL, AArch32: unused on these SoCs */
        vector_slot vector_invalid
        vector_slot vector_invalid
        vector_slot vector_invalid
        vector_slot vector_invalid

        .balign 0x80
        vector_sync_lower:
            frame_call hv_exc_sync
        vector_irq_lower:
            frame_call hv_exc_irq
        vector_fiq_lower:
            frame_call hv_exc_fiq
        vector_serror_lower:
            frame_call hv_exc_serror
        vector_invalid:
            frame_call hv_exc_invalid
        "#,
        frame_size = const size_of::<super::TrapFrame>(),
    );
}
