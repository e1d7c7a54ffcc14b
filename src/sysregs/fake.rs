// Copyright The m1hv Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Fake system registers backing the accessors in unit tests.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Values of the fake system registers.
pub static SYSREGS: Mutex<SystemRegisters> = Mutex::new(SystemRegisters::new());

static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serialises tests that depend on the fake registers. The registers are
/// process-wide state, so tests touching them take this guard first; a
/// panicking test (several tests unwind through power-down hooks on purpose)
/// must not wedge the rest.
pub fn exclusive() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A set of fake system registers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SystemRegisters {
    pub isr_el1: u64,
    pub esr_el2: u64,
    pub elr_el2: u64,
    pub spsr_el2: u64,
    pub far_el2: u64,
    pub sctlr_el2: u64,
    pub tpidr_el2: u64,
    pub sp_el0: u64,
    pub sp_el1: u64,
    pub vbar_el2: u64,
}

impl SystemRegisters {
    const fn new() -> Self {
        Self {
            isr_el1: 0,
            esr_el2: 0,
            elr_el2: 0,
            spsr_el2: 0,
            far_el2: 0,
            sctlr_el2: 0,
            tpidr_el2: 0,
            sp_el0: 0,
            sp_el1: 0,
            vbar_el2: 0,
        }
    }

    /// Resets the fake system registers to their initial state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
