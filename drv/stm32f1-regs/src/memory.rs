// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::RegisterBus;

/// Direct access to ordinary memory (flash array, SRAM) at addresses chosen
/// by the caller.
///
/// This is where physical addresses supplied by the transport layer are
/// dereferenced. Reading an address that is not backed by anything will
/// bus-fault on hardware.
pub struct Memory<'a, B: ?Sized> {
    bus: &'a B,
}

impl<'a, B: RegisterBus + ?Sized> Memory<'a, B> {
    pub fn new(bus: &'a B) -> Self {
        Self { bus }
    }

    pub fn read_word(&self, addr: u32) -> u32 {
        self.bus.read32(addr)
    }

    pub fn read_half(&self, addr: u32) -> u16 {
        self.bus.read16(addr)
    }

    /// A single half-word store. In flash program mode this is what
    /// triggers programming.
    pub fn write_half(&self, addr: u32, value: u16) {
        self.bus.write16(addr, value)
    }
}
