// Copyright The m1hv Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

pub mod apple;

#[cfg(not(test))]
pub use apple::Apple as PlatformImpl;
#[cfg(test)]
pub use test::TestPlatform as PlatformImpl;

use crate::{logger::LogSink, services::psci::PsciPlatform, sysregs::read_tpidr_el2};
use percore::Cores;

/// Core count of the widest supported configuration (two-die Ultra parts).
pub const MAX_CORE_COUNT: usize = 24;

/// Cluster count of the widest supported configuration.
pub const MAX_CLUSTER_COUNT: usize = 6;

/// Cluster domains plus the one system domain.
pub const MAX_NON_CPU_DOMAIN_COUNT: usize = MAX_CLUSTER_COUNT + 1;

/// Type aliases for convenience, to avoid the associated-type paths
/// everywhere.
pub type LogSinkImpl = <PlatformImpl as Platform>::LogSinkImpl;
pub type PsciPlatformImpl = <PlatformImpl as Platform>::PsciPlatformImpl;

/// The hooks implemented by all platforms.
pub trait Platform {
    /// Platform dependent LogSink implementation type for the logger.
    type LogSinkImpl: LogSink;

    /// Platform dependent PSCI implementation type.
    type PsciPlatformImpl: PsciPlatform;

    /// Returns the PSCI platform implementation handle. The function returns
    /// `Some` exactly once; the PSCI service takes ownership of it.
    fn psci_platform() -> Option<Self::PsciPlatformImpl>;
}

/// Implementation of the `Cores` trait to get the index of the current CPU
/// core. The boot path stores the logical CPU index in TPIDR_EL2 before any
/// of this code runs on a core.
pub struct CoresImpl;

// SAFETY: Each core's TPIDR_EL2 is assigned its unique logical index at
// boot and never changed afterwards.
unsafe impl Cores for CoresImpl {
    fn core_index() -> usize {
        read_tpidr_el2() as usize
    }
}
