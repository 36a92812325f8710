// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A busy-waiting driver for the STM32F1 flash program/erase controller.
//!
//! See the [`Flash`] type for the procedure.
//!
//! # Waiting
//!
//! Every wait in this driver polls FLASH_SR.BSY with no timeout. A controller
//! that never clears BSY hangs the caller; there is nothing sensible to do in
//! that case anyway, since the program or erase state of the page is unknown.
//!
//! # Where the code runs from
//!
//! Reads from the flash bank stall while that bank is being programmed or
//! erased. That is fine for code executing from the same bank (it just
//! waits), but anything that *modifies* the bank the caller is executing
//! from will corrupt it. Callers must only point this driver at pages they
//! are not running from.

#![cfg_attr(target_os = "none", no_std)]

use drv_stm32f1_regs::bits::{flash as fbits, rcc as rbits};
use drv_stm32f1_regs::{
    FlashCtl, FlashSize, Memory, Rcc, RegisterBus, FLASH_BASE,
};
use ringbuf::{ringbuf, ringbuf_entry};
use static_assertions::const_assert;

/// Page size on parts with at most [`LARGE_PAGE_THRESHOLD_KIB`] of flash.
pub const SMALL_PAGE: u32 = 0x400;
/// Page size on larger (high-density and connectivity-line) parts.
pub const LARGE_PAGE: u32 = 0x800;
/// Capacities above this many KiB use [`LARGE_PAGE`].
pub const LARGE_PAGE_THRESHOLD_KIB: u16 = 128;

const_assert!(SMALL_PAGE.is_power_of_two());
const_assert!(LARGE_PAGE.is_power_of_two());
const_assert!(FLASH_BASE % LARGE_PAGE == 0);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashError {
    /// The controller is locked; call [`Flash::unlock`] first.
    Locked,
    /// Address outside the flash array.
    OutOfRange,
    /// Erase address not on a page boundary, or write address not on a word
    /// boundary.
    Unaligned,
    /// The controller reported the page as write-protected.
    WriteProtected,
    /// The word read back after programming is not what was written. This is
    /// what programming over a location that wasn't erased looks like.
    Verify { expected: u32, found: u32 },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Unlocked,
    Locked,
    OscillatorOn,
    Erase(u32),
    EraseFailed(u32, FlashError),
    WriteFailed(u32, FlashError),
}

ringbuf!(Trace, 32, Trace::None);

/// Flash driver handle.
///
/// # Procedure for writing to flash
///
/// 1. Make sure HSI is running; [`Flash::enable_oscillator`] does this.
/// 2. [`Flash::unlock`]. The controller stays unlocked until
///    [`Flash::lock`] or reset, so one unlock can cover any number of
///    operations.
/// 3. Erase the target pages with [`Flash::erase_page`] or
///    [`Flash::erase_pages`].
/// 4. Program with [`Flash::write_word`]. Only erased (all-ones) locations
///    can be programmed; anything else fails verification.
/// 5. [`Flash::lock`].
///
/// Operations block until the controller is done.
pub struct Flash<'a, B: ?Sized> {
    bus: &'a B,
}

impl<'a, B: RegisterBus + ?Sized> Flash<'a, B> {
    pub fn new(bus: &'a B) -> Self {
        Self { bus }
    }

    /// The bus this handle drives.
    pub fn bus(&self) -> &'a B {
        self.bus
    }

    fn ctl(&self) -> FlashCtl<'a, B> {
        FlashCtl::new(self.bus)
    }

    /// The program/erase controller is clocked from HSI regardless of what
    /// SYSCLK is running from. Turns HSI on if needed and waits for it.
    pub fn enable_oscillator(&self) {
        let rcc = Rcc::new(self.bus);
        if !rcc.cr().any_set(rbits::CR_HSION) {
            rcc.cr().set_bits(rbits::CR_HSION);
        }
        while !rcc.cr().any_set(rbits::CR_HSIRDY) {
            // spin
        }
        ringbuf_entry!(Trace::OscillatorOn);
    }

    /// Writes the two-key unlock sequence.
    ///
    /// The keys must arrive back to back and in order. Anything else locks
    /// the controller up until the next reset, so don't call this with
    /// interrupts that might touch FLASH_KEYR enabled.
    pub fn unlock(&mut self) {
        let keyr = self.ctl().keyr();
        keyr.write(fbits::KEY1);
        keyr.write(fbits::KEY2);
        ringbuf_entry!(Trace::Unlocked);
    }

    /// Cancels any program/erase mode and locks the controller.
    pub fn lock(&mut self) {
        self.ctl().cr().write(fbits::CR_LOCK);
        ringbuf_entry!(Trace::Locked);
    }

    pub fn is_locked(&self) -> bool {
        self.ctl().cr().any_set(fbits::CR_LOCK)
    }

    /// Total flash size in bytes, from the factory-programmed size word.
    pub fn capacity(&self) -> u32 {
        u32::from(FlashSize::new(self.bus).kib()) * 1024
    }

    /// Erase granularity in bytes.
    pub fn page_size(&self) -> u32 {
        if FlashSize::new(self.bus).kib() > LARGE_PAGE_THRESHOLD_KIB {
            LARGE_PAGE
        } else {
            SMALL_PAGE
        }
    }

    /// One past the last flash address.
    pub fn flash_end(&self) -> u32 {
        FLASH_BASE + self.capacity()
    }

    fn wait_not_busy(&self) {
        let sr = self.ctl().sr();
        while sr.any_set(fbits::SR_BSY) {
            // spin
        }
    }

    fn check_unlocked(&self) -> Result<(), FlashError> {
        if self.is_locked() {
            Err(FlashError::Locked)
        } else {
            Ok(())
        }
    }

    /// Erases the page starting at `addr` to all ones.
    ///
    /// The page is not read back afterwards. The only failure reported from
    /// the operation itself is write protection.
    pub fn erase_page(&mut self, addr: u32) -> Result<(), FlashError> {
        let r = self.erase_page_inner(addr);
        match r {
            Ok(()) => ringbuf_entry!(Trace::Erase(addr)),
            Err(e) => ringbuf_entry!(Trace::EraseFailed(addr, e)),
        }
        r
    }

    fn erase_page_inner(&mut self, addr: u32) -> Result<(), FlashError> {
        if addr < FLASH_BASE || addr >= self.flash_end() {
            return Err(FlashError::OutOfRange);
        }
        if addr & (self.page_size() - 1) != 0 {
            return Err(FlashError::Unaligned);
        }
        self.check_unlocked()?;

        let ctl = self.ctl();
        ctl.cr().write(fbits::CR_PER);
        self.wait_not_busy();
        ctl.ar().write(addr);
        ctl.cr().write(fbits::CR_STRT | fbits::CR_PER);
        self.wait_not_busy();

        let status = ctl.sr().read();
        ctl.cr().write(0);

        if status & fbits::SR_WRPRTERR != 0 {
            // Write-one-to-clear, so it doesn't linger into the next
            // operation.
            ctl.sr().write(fbits::SR_WRPRTERR | fbits::SR_EOP);
            return Err(FlashError::WriteProtected);
        }
        Ok(())
    }

    /// Erases `count` consecutive pages starting at `addr`.
    ///
    /// Pages are erased from the highest address down, and the first failure
    /// stops the sequence: pages below the failing one are left untouched.
    pub fn erase_pages(
        &mut self,
        addr: u32,
        count: u16,
    ) -> Result<(), FlashError> {
        let page = self.page_size();
        for n in (0..u32::from(count)).rev() {
            let target = page
                .checked_mul(n)
                .and_then(|off| addr.checked_add(off))
                .ok_or(FlashError::OutOfRange)?;
            self.erase_page(target)?;
        }
        Ok(())
    }

    /// Programs `value` into the erased word at `addr`, then reads it back.
    ///
    /// The controller only takes half-word writes. The upper half-word goes
    /// first, then the lower, with BSY polled around each one. There is no
    /// retry on a verify failure.
    pub fn write_word(
        &mut self,
        addr: u32,
        value: u32,
    ) -> Result<(), FlashError> {
        let r = self.write_word_inner(addr, value);
        if let Err(e) = r {
            ringbuf_entry!(Trace::WriteFailed(addr, e));
        }
        r
    }

    fn write_word_inner(
        &mut self,
        addr: u32,
        value: u32,
    ) -> Result<(), FlashError> {
        let in_range = addr >= FLASH_BASE
            && addr
                .checked_add(4)
                .map_or(false, |end| end <= self.flash_end());
        if !in_range {
            return Err(FlashError::OutOfRange);
        }
        if addr & 0b11 != 0 {
            return Err(FlashError::Unaligned);
        }
        self.check_unlocked()?;

        let ctl = self.ctl();
        let mem = Memory::new(self.bus);

        ctl.cr().write(fbits::CR_PG);

        self.wait_not_busy();
        mem.write_half(addr + 2, (value >> 16) as u16);
        self.wait_not_busy();
        mem.write_half(addr, value as u16);
        self.wait_not_busy();

        ctl.cr().clear_bits(fbits::CR_PG);

        let status = ctl.sr().read();
        let errors = status & (fbits::SR_PGERR | fbits::SR_WRPRTERR);
        if errors != 0 {
            ctl.sr().write(errors | fbits::SR_EOP);
            if errors & fbits::SR_WRPRTERR != 0 {
                return Err(FlashError::WriteProtected);
            }
        }

        // PGERR alone is what programming over a non-erased cell looks like,
        // which the read-back reports in more detail.
        let found = mem.read_word(addr);
        if found != value {
            return Err(FlashError::Verify {
                expected: value,
                found,
            });
        }
        Ok(())
    }
}
