// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reset and Clock Control.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::{Reg, RegisterBus};

const RCC_BASE: u32 = 0x4002_1000;

const CR: u32 = 0x00;
const CFGR: u32 = 0x04;
const CIR: u32 = 0x08;
const APB2ENR: u32 = 0x18;

pub mod bits {
    // RCC_CR
    pub const CR_HSION: u32 = 1 << 0;
    pub const CR_HSIRDY: u32 = 1 << 1;
    pub const CR_HSEON: u32 = 1 << 16;
    pub const CR_HSERDY: u32 = 1 << 17;
    pub const CR_HSEBYP: u32 = 1 << 18;
    pub const CR_CSSON: u32 = 1 << 19;
    pub const CR_PLLON: u32 = 1 << 24;
    pub const CR_PLLRDY: u32 = 1 << 25;

    // RCC_CFGR
    pub const CFGR_SW_MASK: u32 = 0b11;
    pub const CFGR_SW_PLL: u32 = 0b10;
    pub const CFGR_SWS_SHIFT: u32 = 2;
    pub const CFGR_SWS_MASK: u32 = 0b11 << CFGR_SWS_SHIFT;
    pub const CFGR_SWS_PLL: u32 = CFGR_SW_PLL << CFGR_SWS_SHIFT;
    pub const CFGR_PPRE1_DIV2: u32 = 0b100 << 8;
    pub const CFGR_PLLSRC_HSE: u32 = 1 << 16;
    pub const CFGR_PLLMUL_SHIFT: u32 = 18;

    /// Encodes a PLL multiplication factor (2..=16) into CFGR.PLLMUL.
    pub const fn cfgr_pllmul(factor: u32) -> u32 {
        (factor - 2) << CFGR_PLLMUL_SHIFT
    }

    // Reset-state masks, applied with AND so reserved bits are preserved.
    /// Clears SW, HPRE, PPRE1, PPRE2, ADCPRE and MCO.
    pub const CFGR_KEEP_BUS_RESET: u32 = 0xF8FF_0000;
    /// Clears HSEON, CSSON and PLLON.
    pub const CR_KEEP_OSC_RESET: u32 = 0xFEF6_FFFF;
    /// Clears HSEBYP; only legal once HSE is off.
    pub const CR_KEEP_BYPASS_RESET: u32 = 0xFFFB_FFFF;
    /// Clears PLLSRC, PLLXTPRE, PLLMUL and USBPRE.
    pub const CFGR_KEEP_PLL_RESET: u32 = 0xFF80_FFFF;

    // RCC_APB2ENR
    pub const APB2ENR_AFIOEN: u32 = 1 << 0;
    pub const APB2ENR_IOPAEN: u32 = 1 << 2;
    pub const APB2ENR_IOPBEN: u32 = 1 << 3;
    pub const APB2ENR_IOPCEN: u32 = 1 << 4;
    pub const APB2ENR_IOPDEN: u32 = 1 << 5;
    pub const APB2ENR_IOPEEN: u32 = 1 << 6;
}

/// Clock source currently driving SYSCLK, as reported by CFGR.SWS.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum SysclkSource {
    Hsi = 0b00,
    Hse = 0b01,
    Pll = 0b10,
}

pub struct Rcc<'a, B: ?Sized> {
    bus: &'a B,
}

impl<'a, B: RegisterBus + ?Sized> Rcc<'a, B> {
    pub fn new(bus: &'a B) -> Self {
        Self { bus }
    }

    pub fn cr(&self) -> Reg<'a, B> {
        Reg::at(self.bus, RCC_BASE + CR)
    }

    pub fn cfgr(&self) -> Reg<'a, B> {
        Reg::at(self.bus, RCC_BASE + CFGR)
    }

    pub fn cir(&self) -> Reg<'a, B> {
        Reg::at(self.bus, RCC_BASE + CIR)
    }

    pub fn apb2enr(&self) -> Reg<'a, B> {
        Reg::at(self.bus, RCC_BASE + APB2ENR)
    }

    /// Decodes CFGR.SWS. The fourth encoding is reserved and reads as `None`.
    pub fn sysclk_source(&self) -> Option<SysclkSource> {
        let sws = (self.cfgr().read() & bits::CFGR_SWS_MASK)
            >> bits::CFGR_SWS_SHIFT;
        SysclkSource::from_u32(sws)
    }
}
