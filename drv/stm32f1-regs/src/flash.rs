// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash program/erase controller (FPEC) and the factory flash-size word.

use crate::{Reg, RegisterBus};

const FLASH_R_BASE: u32 = 0x4002_2000;

const ACR: u32 = 0x00;
const KEYR: u32 = 0x04;
const SR: u32 = 0x0C;
const CR: u32 = 0x10;
const AR: u32 = 0x14;

/// Factory-programmed flash capacity, in KiB, as a half-word.
const FLASH_SIZE_REG: u32 = 0x1FFF_F7E0;

pub mod bits {
    // FLASH_ACR
    pub const ACR_LATENCY_2: u32 = 0b010;
    pub const ACR_PRFTBE: u32 = 1 << 4;

    // FLASH_KEYR
    pub const KEY1: u32 = 0x4567_0123;
    pub const KEY2: u32 = 0xCDEF_89AB;

    // FLASH_SR
    pub const SR_BSY: u32 = 1 << 0;
    pub const SR_PGERR: u32 = 1 << 2;
    pub const SR_WRPRTERR: u32 = 1 << 4;
    pub const SR_EOP: u32 = 1 << 5;

    // FLASH_CR
    pub const CR_PG: u32 = 1 << 0;
    pub const CR_PER: u32 = 1 << 1;
    pub const CR_MER: u32 = 1 << 2;
    pub const CR_STRT: u32 = 1 << 6;
    pub const CR_LOCK: u32 = 1 << 7;
}

pub struct FlashCtl<'a, B: ?Sized> {
    bus: &'a B,
}

impl<'a, B: RegisterBus + ?Sized> FlashCtl<'a, B> {
    pub fn new(bus: &'a B) -> Self {
        Self { bus }
    }

    pub fn acr(&self) -> Reg<'a, B> {
        Reg::at(self.bus, FLASH_R_BASE + ACR)
    }

    /// Write-only key register.
    pub fn keyr(&self) -> Reg<'a, B> {
        Reg::at(self.bus, FLASH_R_BASE + KEYR)
    }

    pub fn sr(&self) -> Reg<'a, B> {
        Reg::at(self.bus, FLASH_R_BASE + SR)
    }

    pub fn cr(&self) -> Reg<'a, B> {
        Reg::at(self.bus, FLASH_R_BASE + CR)
    }

    pub fn ar(&self) -> Reg<'a, B> {
        Reg::at(self.bus, FLASH_R_BASE + AR)
    }
}

/// The device electronic signature word holding total flash size.
pub struct FlashSize<'a, B: ?Sized> {
    bus: &'a B,
}

impl<'a, B: RegisterBus + ?Sized> FlashSize<'a, B> {
    pub fn new(bus: &'a B) -> Self {
        Self { bus }
    }

    pub fn kib(&self) -> u16 {
        self.bus.read16(FLASH_SIZE_REG)
    }
}
