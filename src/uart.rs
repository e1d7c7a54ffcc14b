// Copyright The m1hv Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Driver for the Samsung-style serial port found on Apple SoCs.
//!
//! The boot stage has already configured the line settings and baud rate;
//! this driver only transmits.

use bitflags::bitflags;
use core::fmt::{self, Write};
use core::ptr::{addr_of, addr_of_mut};

bitflags! {
    /// Flags from the Tx/Rx status register (UTRSTAT).
    #[repr(transparent)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    struct Status: u32 {
        /// Receive buffer has data.
        const RX_DATA = 1 << 0;
        /// Transmit buffer can accept a byte.
        const TX_BUFFER_EMPTY = 1 << 1;
        /// Transmitter is completely idle.
        const TX_IDLE = 1 << 2;
    }
}

#[repr(C, align(4))]
struct Registers {
    ulcon: u32,
    ucon: u32,
    ufcon: u32,
    umcon: u32,
    utrstat: Status,
    uerstat: u32,
    ufstat: u32,
    umstat: u32,
    utxh: u32,
    urxh: u32,
    ubrdiv: u32,
}

/// Driver for one Apple SoC UART.
#[derive(Debug)]
pub struct Uart {
    registers: *mut Registers,
}

impl Uart {
    /// Constructs a new instance of the UART driver for a device at the given
    /// base address.
    ///
    /// # Safety
    ///
    /// The given base address must point to the MMIO control registers of an
    /// Apple SoC UART, mapped as device memory and not aliased anywhere else.
    pub unsafe fn new(base_address: *mut u32) -> Self {
        Self {
            registers: base_address as *mut Registers,
        }
    }

    fn status(&self) -> Status {
        // SAFETY: `self.registers` points to valid device registers per the
        // `new` contract.
        unsafe { addr_of!((*self.registers).utrstat).read_volatile() }
    }

    /// Writes a single byte, blocking until the transmit buffer has room.
    pub fn write_byte(&mut self, byte: u8) {
        while !self.status().contains(Status::TX_BUFFER_EMPTY) {
            core::hint::spin_loop();
        }
        // SAFETY: `self.registers` points to valid device registers per the
        // `new` contract.
        unsafe {
            addr_of_mut!((*self.registers).utxh).write_volatile(byte.into());
        }
    }

    /// Blocks until the transmitter has drained completely.
    pub fn wait_idle(&mut self) {
        while !self.status().contains(Status::TX_IDLE) {
            core::hint::spin_loop();
        }
    }
}

impl Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

// SAFETY: The driver is only a pointer to device registers, and every access
// goes through a volatile read or write; `LockedWriter` serialises callers.
unsafe impl Send for Uart {}
