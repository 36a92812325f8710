// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{Reg, RegisterBus};

const AFIO_BASE: u32 = 0x4001_0000;
const MAPR: u32 = 0x04;

pub mod bits {
    /// SWJ_CFG = 0b010: JTAG-DP off, SW-DP on. Frees PA15, PB3 and PB4.
    pub const MAPR_SWJ_CFG_NO_JTAG_SW: u32 = 0b010 << 24;
}

/// Alternate-function I/O. Its clock (APB2ENR.AFIOEN) must be on before
/// writes stick.
pub struct Afio<'a, B: ?Sized> {
    bus: &'a B,
}

impl<'a, B: RegisterBus + ?Sized> Afio<'a, B> {
    pub fn new(bus: &'a B) -> Self {
        Self { bus }
    }

    pub fn mapr(&self) -> Reg<'a, B> {
        Reg::at(self.bus, AFIO_BASE + MAPR)
    }
}
