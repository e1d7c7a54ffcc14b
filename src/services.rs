// Copyright The m1hv Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

pub mod psci;

use crate::{
    exceptions::TrapFrame,
    platform::{Platform, PlatformImpl},
    smccc::{FunctionId, NOT_SUPPORTED},
};
use spin::Lazy;

/// Helper macro to define the range of SMC function ID values covered by a
/// service.
macro_rules! owns {
    // range refers to the lower 16 bits [15:0] of the SMC FunctionId
    ($owning_entity:expr, $range:expr) => {
        #[inline(always)]
        fn owns(&self, function: $crate::smccc::FunctionId) -> bool {
            function.oen() == $owning_entity
                && $range.contains(&function.number())
                && matches!(
                    function.call_type(),
                    $crate::smccc::SmcccCallType::Fast32 | $crate::smccc::SmcccCallType::Fast64
                )
        }
    };
}
pub(crate) use owns;

/// A service which handles some range of SMC calls.
///
/// According to SMCCC v1.3+ the implementation must disregard the SVE hint
/// bit in the function ID and consider it to be 0 for the purpose of function
/// identification.
pub trait Service {
    /// Returns whether this service is intended to handle the given function
    /// ID.
    fn owns(&self, function: FunctionId) -> bool;

    /// Handles an SMC call from the guest. `regs` holds the function ID and
    /// the three argument registers; the return value goes back in X0.
    fn handle_smc(&self, regs: &[u64; 4]) -> u64;
}

static SERVICES: Lazy<Services> = Lazy::new(Services::new);

/// Contains an instance of all of the currently implemented services.
pub struct Services {
    pub psci: psci::Psci,
}

impl Services {
    /// Returns a reference to the global Services instance, initializing it
    /// if it hasn't been initialized yet.
    pub fn get() -> &'static Self {
        &SERVICES
    }

    fn new() -> Self {
        Self {
            psci: psci::Psci::new(
                PlatformImpl::psci_platform().expect("PSCI platform already taken"),
            ),
        }
    }

    /// Demultiplexes a trapped SMC and writes the result into X0 of the trap
    /// frame. Calls that no service owns complete with `NOT_SUPPORTED`.
    pub fn handle_smc(&self, frame: &mut TrapFrame) {
        let mut function = FunctionId(frame.regs[0] as u32);

        if !function.valid() {
            frame.regs[0] = NOT_SUPPORTED as u64;
            return;
        }
        function.clear_sve_hint();

        if self.psci.owns(function) {
            let mut regs = [0; 4];
            regs.copy_from_slice(&frame.regs[..4]);
            regs[0] = function.0.into();
            frame.regs[0] = self.psci.handle_smc(&regs);
        } else {
            frame.regs[0] = NOT_SUPPORTED as u64;
        }
    }
}
