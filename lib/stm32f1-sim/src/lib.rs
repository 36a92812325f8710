// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated STM32F1 for exercising the boot ROM drivers on a host.
//!
//! [`Sim`] implements [`RegisterBus`] and [`Cpu`] and models just enough of
//! the chip for the drivers to be meaningfully tested:
//!
//! - HSI and HSE report ready as soon as they are switched on; the PLL
//!   reports lock after a configurable number of polls, or never.
//! - CFGR.SWS follows CFGR.SW.
//! - The flash controller comes out of reset locked. KEY1 followed by KEY2
//!   unlocks it; any other sequence locks it up until the next reset, as on
//!   the real part.
//! - After every erase or program operation BSY reads as set for a
//!   configurable number of SR reads. Touching the controller or the flash
//!   array while BSY is set is recorded so tests can check for it.
//! - Page erase fills with `0xFF`. Half-word programming behaves like NOR:
//!   programming anything but zero over a non-erased half-word raises PGERR
//!   and leaves the cell alone. Write-protected pages raise WRPRTERR.
//! - NVIC enable and pending bits, SysTick and SCB.AIRCR.
//!
//! Operations that never return on hardware (a reset request, the final
//! branch into an application, an injected power loss) unwind out of the
//! driver with an [`Event`] payload. Wrap the code under test in [`Sim::run`]
//! to get them back as an [`Outcome`].

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};

use drv_stm32f1_regs::bits::{flash as fbits, rcc as rbits, scb as sbits};
use drv_stm32f1_regs::{Cpu, RegisterBus, FLASH_BASE};

const RCC_CR: u32 = 0x4002_1000;
const RCC_CFGR: u32 = 0x4002_1004;

const FLASH_ACR: u32 = 0x4002_2000;
const FLASH_KEYR: u32 = 0x4002_2004;
const FLASH_SR: u32 = 0x4002_200C;
const FLASH_CR: u32 = 0x4002_2010;
const FLASH_AR: u32 = 0x4002_2014;
const FLASH_SIZE: u32 = 0x1FFF_F7E0;

const NVIC_ISER: u32 = 0xE000_E100;
const NVIC_ICER: u32 = 0xE000_E180;
const NVIC_ISPR: u32 = 0xE000_E200;
const NVIC_ICPR: u32 = 0xE000_E280;
const NVIC_GROUPS: u32 = 2;

const SCB_AIRCR: u32 = 0xE000_ED0C;
const AIRCR_VECTKEYSTAT: u32 = 0xFA05 << 16;

/// Diverging hardware events, carried as the unwind payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Reset,
    Launch { sp: u32, entry: u32 },
    PowerLoss,
}

/// How a call into driver code ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Outcome<T> {
    Returned(T),
    Reset,
    Launched { sp: u32, entry: u32 },
    PowerLoss,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum KeyStage {
    Idle,
    Key1,
    /// Wrong key order. Locked until reset.
    Faulted,
}

struct State {
    /// Anything without modelled behavior: plain word storage.
    words: BTreeMap<u32, u32>,

    flash: Vec<u16>,
    flash_kib: u16,

    rcc_cr: u32,
    pll_lock_after: Option<u32>,
    pll_polls: u32,
    pll_locked: bool,

    flash_locked: bool,
    key_stage: KeyStage,
    flash_cr: u32,
    flash_sr: u32,
    flash_ar: u32,
    busy_reads: u32,
    busy_remaining: u32,
    touched_while_busy: bool,
    protected: BTreeSet<u32>,

    half_writes: Vec<(u32, u16)>,
    power_loss_after: Option<usize>,

    nvic_enabled: [u32; NVIC_GROUPS as usize],
    nvic_pending: [u32; NVIC_GROUPS as usize],

    writes: Vec<(u32, u32)>,
    reset_requests: u32,
    launched: Option<(u32, u32)>,
}

pub struct Sim {
    state: RefCell<State>,
}

impl Default for Sim {
    fn default() -> Self {
        Self::new()
    }
}

impl Sim {
    /// A 64 KiB medium-density part straight out of reset.
    pub fn new() -> Self {
        Self::with_flash_kib(64)
    }

    pub fn with_flash_kib(kib: u16) -> Self {
        let mut words = BTreeMap::new();
        words.insert(FLASH_ACR, 0x30);
        Self {
            state: RefCell::new(State {
                words,
                flash: vec![0xFFFF; usize::from(kib) * 512],
                flash_kib: kib,
                // HSION, HSIRDY and the default HSITRIM.
                rcc_cr: 0x0000_0083,
                pll_lock_after: Some(3),
                pll_polls: 0,
                pll_locked: false,
                flash_locked: true,
                key_stage: KeyStage::Idle,
                flash_cr: 0,
                flash_sr: 0,
                flash_ar: 0,
                busy_reads: 2,
                busy_remaining: 0,
                touched_while_busy: false,
                protected: BTreeSet::new(),
                half_writes: Vec::new(),
                power_loss_after: None,
                nvic_enabled: [0; NVIC_GROUPS as usize],
                nvic_pending: [0; NVIC_GROUPS as usize],
                writes: Vec::new(),
                reset_requests: 0,
                launched: None,
            }),
        }
    }

    /// Runs `f`, turning simulated diverging events back into values. Any
    /// other panic (a failed assertion, say) is propagated.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> Outcome<T> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(v) => Outcome::Returned(v),
            Err(payload) => match payload.downcast_ref::<Event>() {
                Some(Event::Reset) => Outcome::Reset,
                Some(&Event::Launch { sp, entry }) => {
                    Outcome::Launched { sp, entry }
                }
                Some(Event::PowerLoss) => Outcome::PowerLoss,
                None => panic::resume_unwind(payload),
            },
        }
    }

    //
    // Configuration and fault injection.
    //

    /// PLL reports lock after `polls` unsuccessful reads of RCC_CR, or never
    /// if `None`.
    pub fn set_pll_lock_after(&self, polls: Option<u32>) {
        self.state.borrow_mut().pll_lock_after = polls;
    }

    /// Number of SR reads for which BSY stays set after each operation.
    pub fn set_busy_reads(&self, reads: u32) {
        self.state.borrow_mut().busy_reads = reads;
    }

    /// Write-protects the page containing `addr`.
    pub fn protect_page(&self, addr: u32) {
        let mut s = self.state.borrow_mut();
        let base = s.page_base(addr);
        s.protected.insert(base);
    }

    /// Cuts power right after the `n`th half-word program operation lands.
    pub fn power_loss_after_half_writes(&self, n: usize) {
        self.state.borrow_mut().power_loss_after = Some(n);
    }

    /// Stores a word without going through any controller: for planting
    /// images in flash, or stack-pointer words elsewhere in the map.
    pub fn poke32(&self, addr: u32, value: u32) {
        let mut s = self.state.borrow_mut();
        if let Some(i) = s.flash_index(addr) {
            s.flash[i] = value as u16;
            s.flash[i + 1] = (value >> 16) as u16;
        } else {
            s.words.insert(addr, value);
        }
    }

    pub fn set_pending(&self, group: usize, mask: u32) {
        self.state.borrow_mut().nvic_pending[group] |= mask;
    }

    //
    // Inspection.
    //

    pub fn peek32(&self, addr: u32) -> u32 {
        self.state.borrow().load32(addr)
    }

    pub fn reset_requests(&self) -> u32 {
        self.state.borrow().reset_requests
    }

    pub fn launched(&self) -> Option<(u32, u32)> {
        self.state.borrow().launched
    }

    /// Every half-word program attempt, in order, as `(address, value)`.
    pub fn half_writes(&self) -> Vec<(u32, u16)> {
        self.state.borrow().half_writes.clone()
    }

    /// Every 32-bit register write, in order, as `(address, value)`.
    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.state.borrow().writes.clone()
    }

    pub fn touched_while_busy(&self) -> bool {
        self.state.borrow().touched_while_busy
    }

    pub fn flash_locked(&self) -> bool {
        self.state.borrow().flash_locked
    }

    pub fn nvic_enabled(&self, group: usize) -> u32 {
        self.state.borrow().nvic_enabled[group]
    }

    pub fn nvic_pending(&self, group: usize) -> u32 {
        self.state.borrow().nvic_pending[group]
    }

    /// Raw register value as the hardware would report it, without side
    /// effects such as PLL poll counting or BSY countdown.
    pub fn register(&self, addr: u32) -> u32 {
        let s = self.state.borrow();
        match addr {
            RCC_CR => s.rcc_cr_value(),
            FLASH_SR => s.flash_sr,
            FLASH_CR => s.flash_cr_value(),
            FLASH_AR => s.flash_ar,
            _ => s.load32(addr),
        }
    }
}

impl State {
    fn flash_bytes(&self) -> u32 {
        u32::from(self.flash_kib) * 1024
    }

    fn page_size(&self) -> u32 {
        if self.flash_kib > 128 {
            0x800
        } else {
            0x400
        }
    }

    fn page_base(&self, addr: u32) -> u32 {
        addr & !(self.page_size() - 1)
    }

    /// Index of the half-word at `addr`, if it is in the flash array.
    fn flash_index(&self, addr: u32) -> Option<usize> {
        let off = addr.checked_sub(FLASH_BASE)?;
        if off < self.flash_bytes() {
            Some((off / 2) as usize)
        } else {
            None
        }
    }

    fn load32(&self, addr: u32) -> u32 {
        match self.flash_index(addr) {
            Some(i) if i + 1 < self.flash.len() => {
                u32::from(self.flash[i]) | u32::from(self.flash[i + 1]) << 16
            }
            _ => self.words.get(&addr).copied().unwrap_or(0),
        }
    }

    fn rcc_cr_value(&self) -> u32 {
        let mut v = self.rcc_cr & !(rbits::CR_HSIRDY | rbits::CR_HSERDY);
        v &= !rbits::CR_PLLRDY;
        if v & rbits::CR_HSION != 0 {
            v |= rbits::CR_HSIRDY;
        }
        if v & rbits::CR_HSEON != 0 {
            v |= rbits::CR_HSERDY;
        }
        if self.pll_locked {
            v |= rbits::CR_PLLRDY;
        }
        v
    }

    fn flash_cr_value(&self) -> u32 {
        if self.flash_locked {
            self.flash_cr | fbits::CR_LOCK
        } else {
            self.flash_cr
        }
    }

    fn note_busy_access(&mut self) {
        if self.busy_remaining > 0 {
            self.touched_while_busy = true;
        }
    }

    fn start_operation(&mut self) {
        self.flash_sr |= fbits::SR_EOP;
        self.busy_remaining = self.busy_reads;
    }

    fn read32(&mut self, addr: u32) -> u32 {
        match addr {
            RCC_CR => {
                if self.rcc_cr & rbits::CR_PLLON != 0 && !self.pll_locked {
                    match self.pll_lock_after {
                        Some(n) if self.pll_polls >= n => self.pll_locked = true,
                        _ => self.pll_polls += 1,
                    }
                }
                self.rcc_cr_value()
            }
            FLASH_SR => {
                if self.busy_remaining > 0 {
                    self.busy_remaining -= 1;
                    self.flash_sr | fbits::SR_BSY
                } else {
                    self.flash_sr
                }
            }
            FLASH_CR => self.flash_cr_value(),
            FLASH_AR => self.flash_ar,
            a if (NVIC_ISER..NVIC_ISER + 4 * NVIC_GROUPS).contains(&a) => {
                self.nvic_enabled[((a - NVIC_ISER) / 4) as usize]
            }
            a if (NVIC_ICER..NVIC_ICER + 4 * NVIC_GROUPS).contains(&a) => {
                self.nvic_enabled[((a - NVIC_ICER) / 4) as usize]
            }
            a if (NVIC_ISPR..NVIC_ISPR + 4 * NVIC_GROUPS).contains(&a) => {
                self.nvic_pending[((a - NVIC_ISPR) / 4) as usize]
            }
            a if (NVIC_ICPR..NVIC_ICPR + 4 * NVIC_GROUPS).contains(&a) => {
                self.nvic_pending[((a - NVIC_ICPR) / 4) as usize]
            }
            SCB_AIRCR => AIRCR_VECTKEYSTAT | self.load32(SCB_AIRCR),
            _ => self.load32(addr),
        }
    }

    /// Applies a register write. Returns an event if the write diverges.
    fn write32(&mut self, addr: u32, value: u32) -> Option<Event> {
        self.writes.push((addr, value));
        match addr {
            RCC_CR => {
                let ro = rbits::CR_HSIRDY | rbits::CR_HSERDY | rbits::CR_PLLRDY;
                self.rcc_cr = value & !ro;
                if value & rbits::CR_PLLON == 0 {
                    self.pll_locked = false;
                    self.pll_polls = 0;
                }
            }
            RCC_CFGR => {
                let sw = value & rbits::CFGR_SW_MASK;
                let v = (value & !rbits::CFGR_SWS_MASK)
                    | (sw << rbits::CFGR_SWS_SHIFT);
                self.words.insert(RCC_CFGR, v);
            }
            FLASH_KEYR => {
                if self.flash_locked {
                    self.key_stage = match (self.key_stage, value) {
                        (KeyStage::Idle, fbits::KEY1) => KeyStage::Key1,
                        (KeyStage::Key1, fbits::KEY2) => {
                            self.flash_locked = false;
                            KeyStage::Idle
                        }
                        _ => KeyStage::Faulted,
                    };
                }
            }
            FLASH_SR => {
                let w1c = fbits::SR_EOP | fbits::SR_PGERR | fbits::SR_WRPRTERR;
                self.flash_sr &= !(value & w1c);
            }
            FLASH_CR => {
                self.note_busy_access();
                if self.flash_locked {
                    return None;
                }
                if value & fbits::CR_LOCK != 0 {
                    self.flash_locked = true;
                }
                self.flash_cr = value & !(fbits::CR_LOCK | fbits::CR_STRT);
                if value & fbits::CR_STRT != 0 {
                    if value & fbits::CR_PER != 0 {
                        self.erase_page(self.flash_ar);
                    } else if value & fbits::CR_MER != 0 {
                        self.flash.iter_mut().for_each(|h| *h = 0xFFFF);
                    }
                    self.start_operation();
                }
            }
            FLASH_AR => {
                self.note_busy_access();
                self.flash_ar = value;
            }
            a if (NVIC_ISER..NVIC_ISER + 4 * NVIC_GROUPS).contains(&a) => {
                self.nvic_enabled[((a - NVIC_ISER) / 4) as usize] |= value;
            }
            a if (NVIC_ICER..NVIC_ICER + 4 * NVIC_GROUPS).contains(&a) => {
                self.nvic_enabled[((a - NVIC_ICER) / 4) as usize] &= !value;
            }
            a if (NVIC_ISPR..NVIC_ISPR + 4 * NVIC_GROUPS).contains(&a) => {
                self.nvic_pending[((a - NVIC_ISPR) / 4) as usize] |= value;
            }
            a if (NVIC_ICPR..NVIC_ICPR + 4 * NVIC_GROUPS).contains(&a) => {
                self.nvic_pending[((a - NVIC_ICPR) / 4) as usize] &= !value;
            }
            SCB_AIRCR => {
                if value & 0xFFFF_0000 != sbits::AIRCR_VECTKEY {
                    return None;
                }
                if value & sbits::AIRCR_SYSRESETREQ != 0 {
                    self.reset_requests += 1;
                    return Some(Event::Reset);
                }
                self.words.insert(SCB_AIRCR, value & 0x0000_FFFF);
            }
            a if self.flash_index(a).is_some() => {
                panic!("word store to flash array at {a:#010x}");
            }
            _ => {
                self.words.insert(addr, value);
            }
        }
        None
    }

    fn erase_page(&mut self, addr: u32) {
        let base = self.page_base(addr);
        if self.protected.contains(&base) {
            self.flash_sr |= fbits::SR_WRPRTERR;
            return;
        }
        if let Some(start) = self.flash_index(base) {
            let halves = (self.page_size() / 2) as usize;
            self.flash[start..start + halves]
                .iter_mut()
                .for_each(|h| *h = 0xFFFF);
        }
    }

    fn write16(&mut self, addr: u32, value: u16) -> Option<Event> {
        let Some(i) = self.flash_index(addr) else {
            let word = addr & !3;
            let shift = (addr & 2) * 8;
            let old = self.load32(word);
            let new = (old & !(0xFFFF << shift)) | (u32::from(value) << shift);
            self.words.insert(word, new);
            return None;
        };

        self.note_busy_access();
        self.half_writes.push((addr, value));

        if self.flash_locked || self.flash_cr & fbits::CR_PG == 0 {
            self.flash_sr |= fbits::SR_PGERR;
            return None;
        }

        if self.protected.contains(&self.page_base(addr)) {
            self.flash_sr |= fbits::SR_WRPRTERR;
        } else if self.flash[i] != 0xFFFF && value != 0 {
            self.flash_sr |= fbits::SR_PGERR;
        } else {
            self.flash[i] &= value;
        }
        self.start_operation();

        match self.power_loss_after {
            Some(n) if self.half_writes.len() >= n => Some(Event::PowerLoss),
            _ => None,
        }
    }

    fn read16(&mut self, addr: u32) -> u16 {
        if addr == FLASH_SIZE {
            return self.flash_kib;
        }
        match self.flash_index(addr) {
            Some(i) => self.flash[i],
            None => {
                let shift = (addr & 2) * 8;
                (self.load32(addr & !3) >> shift) as u16
            }
        }
    }
}

impl RegisterBus for Sim {
    fn read32(&self, addr: u32) -> u32 {
        self.state.borrow_mut().read32(addr)
    }

    fn write32(&self, addr: u32, value: u32) {
        // The borrow must end before unwinding.
        let event = self.state.borrow_mut().write32(addr, value);
        if let Some(e) = event {
            panic::panic_any(e);
        }
    }

    fn read16(&self, addr: u32) -> u16 {
        self.state.borrow_mut().read16(addr)
    }

    fn write16(&self, addr: u32, value: u16) {
        let event = self.state.borrow_mut().write16(addr, value);
        if let Some(e) = event {
            panic::panic_any(e);
        }
    }
}

impl Cpu for Sim {
    unsafe fn launch(&self, sp: u32, entry: u32) -> ! {
        self.state.borrow_mut().launched = Some((sp, entry));
        panic::panic_any(Event::Launch { sp, entry })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flash_starts_erased_and_locked() {
        let sim = Sim::new();
        assert!(sim.flash_locked());
        assert_eq!(sim.peek32(FLASH_BASE), 0xFFFF_FFFF);
        assert_eq!(sim.read16(FLASH_SIZE), 64);
    }

    #[test]
    fn wrong_key_order_locks_until_reset() {
        let sim = Sim::new();
        sim.write32(FLASH_KEYR, fbits::KEY2);
        sim.write32(FLASH_KEYR, fbits::KEY1);
        sim.write32(FLASH_KEYR, fbits::KEY2);
        assert!(sim.flash_locked());
    }

    #[test]
    fn pll_locks_after_configured_polls() {
        let sim = Sim::new();
        sim.set_pll_lock_after(Some(2));
        sim.write32(RCC_CR, rbits::CR_PLLON);
        assert_eq!(sim.read32(RCC_CR) & rbits::CR_PLLRDY, 0);
        assert_eq!(sim.read32(RCC_CR) & rbits::CR_PLLRDY, 0);
        assert_ne!(sim.read32(RCC_CR) & rbits::CR_PLLRDY, 0);
    }

    #[test]
    fn reset_request_is_reported() {
        let sim = Sim::new();
        let out = sim.run(|| sim.write32(SCB_AIRCR, sbits::AIRCR_RESET_REQ));
        assert_eq!(out, Outcome::Reset);
        assert_eq!(sim.reset_requests(), 1);
    }

    #[test]
    fn ordinary_panics_propagate() {
        let sim = Sim::new();
        let r = panic::catch_unwind(AssertUnwindSafe(|| {
            sim.run(|| panic!("not a hardware event"))
        }));
        assert!(r.is_err());
    }
}
