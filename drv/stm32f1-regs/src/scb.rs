// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{Reg, RegisterBus};

const AIRCR: u32 = 0xE000_ED0C;

pub mod bits {
    pub const AIRCR_VECTKEY: u32 = 0x05FA << 16;
    pub const AIRCR_SYSRESETREQ: u32 = 1 << 2;
    pub const AIRCR_RESET_REQ: u32 = AIRCR_VECTKEY | AIRCR_SYSRESETREQ;
    pub const AIRCR_PRIGROUP_SHIFT: u32 = 8;
    pub const AIRCR_PRIGROUP_MASK: u32 = 0b111 << AIRCR_PRIGROUP_SHIFT;
}

/// System control block.
pub struct Scb<'a, B: ?Sized> {
    bus: &'a B,
}

impl<'a, B: RegisterBus + ?Sized> Scb<'a, B> {
    pub fn new(bus: &'a B) -> Self {
        Self { bus }
    }

    pub fn aircr(&self) -> Reg<'a, B> {
        Reg::at(self.bus, AIRCR)
    }

    /// Current PRIGROUP field of AIRCR.
    pub fn priority_grouping(&self) -> u32 {
        (self.aircr().read() & bits::AIRCR_PRIGROUP_MASK)
            >> bits::AIRCR_PRIGROUP_SHIFT
    }

    /// Requests a full system reset and waits for it to take effect.
    ///
    /// This resets the core and every peripheral; execution restarts at the
    /// reset vector as if from power-on. It does not return.
    pub fn system_reset(&self) -> ! {
        #[cfg(target_os = "none")]
        cortex_m::asm::dsb();

        // Writing AIRCR without the vector key is ignored, and doing so
        // would also zero PRIGROUP, so this is a plain write of the full
        // request value.
        self.aircr().write(bits::AIRCR_RESET_REQ);

        loop {
            #[cfg(target_os = "none")]
            cortex_m::asm::nop();
            #[cfg(not(target_os = "none"))]
            core::hint::spin_loop();
        }
    }
}
