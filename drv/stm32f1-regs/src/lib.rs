// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register-level access to the STM32F1 blocks the boot ROM touches.
//!
//! Everything in this crate is mechanism. The clock tree, the flash
//! controller, the NVIC and the system control block are exposed as typed
//! register blocks layered over a [`RegisterBus`]; nothing here decides what
//! to write or when. The policy lives in the `startup`, `flash` and `handoff`
//! drivers.
//!
//! # Why a bus trait?
//!
//! On hardware every access is a volatile load or store to a fixed physical
//! address, provided by [`Mmio`]. For host tests the same drivers run against
//! a simulated controller that implements [`RegisterBus`] and reacts to the
//! accesses the way the silicon would (ready bits flipping, BSY clearing,
//! pages erasing). Raw addresses never leave this crate: drivers name
//! registers through the block types, and the only addresses they pass around
//! are the physical flash and image addresses handed to them by the transport
//! layer, which go through [`Memory`].
//!
//! None of the hardware state is mirrored in software. Each read observes the
//! hardware as it is right now, which may differ from the last read because
//! the oscillators, PLL and flash controller all run on their own.

#![cfg_attr(target_os = "none", no_std)]

use core::marker::PhantomData;

mod afio;
mod flash;
mod memory;
mod nvic;
mod rcc;
mod scb;

pub use afio::Afio;
pub use flash::{FlashCtl, FlashSize};
pub use memory::Memory;
pub use nvic::{Nvic, SysTick, NVIC_GROUPS};
pub use rcc::{Rcc, SysclkSource};
pub use scb::Scb;

/// Bit definitions, grouped by block. These mirror the reference manual's
/// names so they can be looked up there.
pub mod bits {
    pub use crate::afio::bits as afio;
    pub use crate::flash::bits as flash;
    pub use crate::nvic::bits as nvic;
    pub use crate::rcc::bits as rcc;
    pub use crate::scb::bits as scb;
}

/// Base of the on-chip flash in the system address map.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Base of on-chip SRAM.
pub const SRAM_BASE: u32 = 0x2000_0000;

/// Unsigned, fixed-width, volatile access to the physical address space.
///
/// Implementations must not cache, merge, split or reorder accesses: a
/// `write16` is exactly one half-word store, and a `read32` is exactly one word
/// load. Callers are responsible for using the width the hardware expects.
pub trait RegisterBus {
    fn read32(&self, addr: u32) -> u32;
    fn write32(&self, addr: u32, value: u32);
    fn read16(&self, addr: u32) -> u16;
    fn write16(&self, addr: u32, value: u16);
}

impl<B: RegisterBus + ?Sized> RegisterBus for &B {
    fn read32(&self, addr: u32) -> u32 {
        (**self).read32(addr)
    }
    fn write32(&self, addr: u32, value: u32) {
        (**self).write32(addr, value)
    }
    fn read16(&self, addr: u32) -> u16 {
        (**self).read16(addr)
    }
    fn write16(&self, addr: u32, value: u16) {
        (**self).write16(addr, value)
    }
}

/// A single 32-bit register at a fixed address on some bus.
///
/// There is no validation of masks or values. Every write lands immediately.
pub struct Reg<'a, B: ?Sized> {
    bus: &'a B,
    addr: u32,
}

impl<'a, B: RegisterBus + ?Sized> Reg<'a, B> {
    pub(crate) fn at(bus: &'a B, addr: u32) -> Self {
        Self { bus, addr }
    }

    #[inline]
    pub fn read(&self) -> u32 {
        self.bus.read32(self.addr)
    }

    #[inline]
    pub fn write(&self, value: u32) {
        self.bus.write32(self.addr, value)
    }

    /// Read-modify-write. Not atomic with respect to the hardware.
    #[inline]
    pub fn modify(&self, f: impl FnOnce(u32) -> u32) {
        let r = self.read();
        self.write(f(r));
    }

    #[inline]
    pub fn set_bits(&self, mask: u32) {
        self.modify(|r| r | mask)
    }

    #[inline]
    pub fn clear_bits(&self, mask: u32) {
        self.modify(|r| r & !mask)
    }

    /// Clears every bit *not* in `keep`. The reset masks in the reference
    /// manual are written this way so reserved bits survive.
    #[inline]
    pub fn retain_bits(&self, keep: u32) {
        self.modify(|r| r & keep)
    }

    /// True if any bit of `mask` is currently set.
    #[inline]
    pub fn any_set(&self, mask: u32) -> bool {
        self.read() & mask != 0
    }
}

/// The real memory-mapped bus.
///
/// There is one physical address space, so there is at most one `Mmio` handed
/// out by [`Mmio::take`]. It is deliberately `!Sync`: the flash controller and
/// the clock tree are sequential hardware state, and overlapping use from an
/// interrupt handler or another core would corrupt them.
pub struct Mmio {
    _not_sync: PhantomData<*const ()>,
}

static MMIO_TAKEN: core::sync::atomic::AtomicBool =
    core::sync::atomic::AtomicBool::new(false);

impl Mmio {
    /// Claims the bus. Returns `None` if it has already been claimed.
    pub fn take() -> Option<Self> {
        use core::sync::atomic::Ordering;
        if MMIO_TAKEN.swap(true, Ordering::AcqRel) {
            None
        } else {
            // Safety: the flag above ensures this is the only handle.
            Some(unsafe { Self::steal() })
        }
    }

    /// Produces a bus handle without checking whether one exists.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other `Mmio` is in use, and that the code
    /// runs on an STM32F1 where the addresses used by this crate are mapped.
    pub unsafe fn steal() -> Self {
        Self {
            _not_sync: PhantomData,
        }
    }
}

impl RegisterBus for Mmio {
    #[inline]
    fn read32(&self, addr: u32) -> u32 {
        // Safety: an `Mmio` only exists on hardware where the register map
        // of this crate is valid.
        unsafe { core::ptr::read_volatile(addr as usize as *const u32) }
    }

    #[inline]
    fn write32(&self, addr: u32, value: u32) {
        unsafe { core::ptr::write_volatile(addr as usize as *mut u32, value) }
    }

    #[inline]
    fn read16(&self, addr: u32) -> u16 {
        unsafe { core::ptr::read_volatile(addr as usize as *const u16) }
    }

    #[inline]
    fn write16(&self, addr: u32, value: u16) {
        unsafe { core::ptr::write_volatile(addr as usize as *mut u16, value) }
    }
}

/// The processor core operations that cannot be expressed as a register
/// write: loading the main stack pointer and branching away.
pub trait Cpu {
    /// Loads `sp` into MSP and branches to `entry`. Never returns.
    ///
    /// # Safety
    ///
    /// Everything the current program still relies on (its stack, its
    /// clocks, its interrupt handlers) stops being valid here. The caller
    /// must have torn all of it down, and `entry` must be code that expects to
    /// start on a fresh stack at `sp`.
    unsafe fn launch(&self, sp: u32, entry: u32) -> !;
}

/// The real Cortex-M3 core.
#[cfg(target_os = "none")]
pub struct CortexM;

#[cfg(target_os = "none")]
impl Cpu for CortexM {
    unsafe fn launch(&self, sp: u32, entry: u32) -> ! {
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
        // `entry` comes straight from the application's vector table, so the
        // Thumb bit is already set.
        core::arch::asm!("
                msr MSP, {stack}
                bx {entry}",
            stack = in(reg) sp,
            entry = in(reg) entry,
            options(noreturn),
        );
    }
}
