// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handing the processor over to the resident application.
//!
//! This is a one-way trip: `validate → teardown → clock reset → jump`. The
//! only step that can fail is validation, and it is also the only step that
//! returns. Its success is represented by a [`ValidatedImage`], which
//! [`handoff`] consumes; there is no other way to get to the jump. The token
//! holds the flash handle, and [`handoff`] re-reads the stack pointer word
//! once flash is locked, so an image rewritten after validation resets the
//! part instead of being entered.
//!
//! # What validation checks
//!
//! The first word of an image is its initial stack pointer. We accept it if
//! masking it with [`RAM_MASK`] leaves exactly [`SRAM_BASE`]. That is a sanity
//! check for "someone wrote a vector table here", not a bounds check against
//! the RAM actually fitted: some values outside populated RAM pass too
//! (anything in the `0x3000_0000` alias, for instance).

#![cfg_attr(target_os = "none", no_std)]

use drv_stm32f1_flash::Flash;
use drv_stm32f1_regs::{Cpu, Memory, RegisterBus, Scb, SRAM_BASE};
use drv_stm32f1_startup::{nvic, reset_clock_tree};
use ringbuf::{ringbuf, ringbuf_entry};

/// Bits of a stack pointer that must match [`SRAM_BASE`].
pub const RAM_MASK: u32 = 0x2FFE_0000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Accepted { addr: u32, sp: u32 },
    Rejected { addr: u32, sp: u32 },
    FlashLocked,
    ImageChanged { expected: u32, found: u32 },
    InterruptsOff,
    TransportDetached,
    ClocksReset,
    Launch { sp: u32, entry: u32 },
}

ringbuf!(Trace, 16, Trace::None);

/// Proof that the image at [`base`](Self::base) had a plausible stack
/// pointer when it was checked.
///
/// Only [`validate`] makes these, and [`handoff`] consumes one. The token
/// owns the [`Flash`] handle it was made from, so nothing can erase or
/// program through that handle between validation and the jump.
#[must_use]
pub struct ValidatedImage<'a, B: ?Sized> {
    flash: Flash<'a, B>,
    base: u32,
    sp: u32,
}

impl<'a, B: RegisterBus + ?Sized> ValidatedImage<'a, B> {
    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn stack_pointer(&self) -> u32 {
        self.sp
    }
}

/// Hooks into the transport that brought the image in (USB, typically).
///
/// Both default to doing nothing.
pub trait Transport {
    /// Stop the transport's interrupt sources. Called after flash is locked,
    /// before the NVIC is cleared.
    fn disable_interrupts(&mut self) {}

    /// Let go of the bus, e.g. drop the USB pull-up so the host sees a
    /// disconnect. Called after the NVIC is cleared.
    fn detach(&mut self) {}
}

/// For boards with nothing to shut down.
impl Transport for () {}

pub const fn plausible_stack_pointer(sp: u32) -> bool {
    sp & RAM_MASK == SRAM_BASE
}

fn read_stack_pointer<B: RegisterBus + ?Sized>(bus: &B, addr: u32) -> u32 {
    Memory::new(bus).read_word(addr)
}

/// Reads the stack pointer word at `addr` and checks it.
///
/// On success `flash` moves into the returned token. On failure it is
/// handed back so the caller can stay in the boot ROM and keep using it.
pub fn validate<'a, B: RegisterBus + ?Sized>(
    flash: Flash<'a, B>,
    addr: u32,
) -> Result<ValidatedImage<'a, B>, Flash<'a, B>> {
    let sp = read_stack_pointer(flash.bus(), addr);
    if plausible_stack_pointer(sp) {
        ringbuf_entry!(Trace::Accepted { addr, sp });
        Ok(ValidatedImage {
            flash,
            base: addr,
            sp,
        })
    } else {
        ringbuf_entry!(Trace::Rejected { addr, sp });
        Err(flash)
    }
}

/// Checks the image at `addr` without taking anything. This is a snapshot:
/// use [`validate`] to get something [`handoff`] will accept.
pub fn is_valid_application<B: RegisterBus + ?Sized>(
    bus: &B,
    addr: u32,
) -> bool {
    plausible_stack_pointer(read_stack_pointer(bus, addr))
}

/// Tears the boot ROM down and jumps into `image`.
///
/// In order:
///
/// 1. lock the flash controller;
/// 2. check the image's stack pointer word still holds the validated value,
///    and request a system reset if it doesn't;
/// 3. [`Transport::disable_interrupts`];
/// 4. disable and un-pend every NVIC channel, and stop SysTick;
/// 5. [`Transport::detach`];
/// 6. put the clock tree back to its reset state;
/// 7. load the image's stack pointer and branch to its reset vector.
///
/// Nothing here returns.
pub fn handoff<B, C, T>(
    image: ValidatedImage<'_, B>,
    cpu: &C,
    transport: &mut T,
) -> !
where
    B: RegisterBus + ?Sized,
    C: Cpu + ?Sized,
    T: Transport + ?Sized,
{
    let ValidatedImage {
        mut flash,
        base,
        sp,
    } = image;
    let bus = flash.bus();

    flash.lock();
    ringbuf_entry!(Trace::FlashLocked);

    // Another handle on the same bus could still have rewritten the image.
    // Past this point there is no way back to the caller, so start over.
    let current = read_stack_pointer(bus, base);
    if current != sp {
        ringbuf_entry!(Trace::ImageChanged {
            expected: sp,
            found: current
        });
        Scb::new(bus).system_reset();
    }

    transport.disable_interrupts();
    nvic::disable_all(bus);
    ringbuf_entry!(Trace::InterruptsOff);

    transport.detach();
    ringbuf_entry!(Trace::TransportDetached);

    reset_clock_tree(bus);
    ringbuf_entry!(Trace::ClocksReset);

    let entry = Memory::new(bus).read_word(base.wrapping_add(4));
    ringbuf_entry!(Trace::Launch { sp, entry });

    // Safety: everything the boot ROM set up has been torn down above, and
    // `image` vouches that the stack pointer at least points at RAM. The
    // application is trusted from here on.
    unsafe { cpu.launch(sp, entry) }
}
