// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Nested vectored interrupt controller and the SysTick timer.

use crate::{Reg, RegisterBus};

const NVIC_BASE: u32 = 0xE000_E100;

const ISER: u32 = 0x000;
const ICER: u32 = 0x080;
const ICPR: u32 = 0x180;
const IPR: u32 = 0x300;

const SYST_CSR: u32 = 0xE000_E010;

/// Number of 32-channel groups implemented on this part. Connectivity-line
/// devices stop at 68 channels, but the boot ROM only ever uses the first 64.
pub const NVIC_GROUPS: usize = 2;

pub mod bits {
    /// Four priority bits are implemented, in the top nibble of each byte.
    pub const PRIORITY_BITS: u32 = 4;
    pub const PRIORITY_SHIFT: u32 = 8 - PRIORITY_BITS;

    // SYST_CSR
    pub const SYST_CSR_ENABLE: u32 = 1 << 0;
    pub const SYST_CSR_TICKINT: u32 = 1 << 1;
    pub const SYST_CSR_CLKSOURCE: u32 = 1 << 2;
}

pub struct Nvic<'a, B: ?Sized> {
    bus: &'a B,
}

impl<'a, B: RegisterBus + ?Sized> Nvic<'a, B> {
    pub fn new(bus: &'a B) -> Self {
        Self { bus }
    }

    /// Set-enable register for channels `32 * group ..`. Write-one-to-set.
    pub fn iser(&self, group: usize) -> Reg<'a, B> {
        Reg::at(self.bus, NVIC_BASE + ISER + 4 * group as u32)
    }

    /// Clear-enable register. Write-one-to-clear.
    pub fn icer(&self, group: usize) -> Reg<'a, B> {
        Reg::at(self.bus, NVIC_BASE + ICER + 4 * group as u32)
    }

    /// Clear-pending register. Write-one-to-clear.
    pub fn icpr(&self, group: usize) -> Reg<'a, B> {
        Reg::at(self.bus, NVIC_BASE + ICPR + 4 * group as u32)
    }

    /// Priority word holding the four byte-wide fields for channels
    /// `4 * word .. 4 * word + 4`.
    pub fn ipr(&self, word: usize) -> Reg<'a, B> {
        Reg::at(self.bus, NVIC_BASE + IPR + 4 * word as u32)
    }
}

pub struct SysTick<'a, B: ?Sized> {
    bus: &'a B,
}

impl<'a, B: RegisterBus + ?Sized> SysTick<'a, B> {
    pub fn new(bus: &'a B) -> Self {
        Self { bus }
    }

    pub fn csr(&self) -> Reg<'a, B> {
        Reg::at(self.bus, SYST_CSR)
    }
}
