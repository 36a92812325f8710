// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use drv_stm32f1_flash::Flash;
use drv_stm32f1_handoff::{
    handoff, is_valid_application, validate, Transport, ValidatedImage,
};
use drv_stm32f1_regs::bits::{flash as fbits, rcc as rbits};
use drv_stm32f1_regs::{Rcc, SysclkSource};
use drv_stm32f1_startup::{bring_up, nvic};
use stm32f1_sim::{Outcome, Sim};

const APP: u32 = 0x0800_4000;
const APP_SP: u32 = 0x2000_5000;
const APP_ENTRY: u32 = 0x0800_4101;

const RCC_CR: u32 = 0x4002_1000;
const RCC_CFGR: u32 = 0x4002_1004;
const FLASH_CR: u32 = 0x4002_2010;
const NVIC_ICER: u32 = 0xE000_E180;
const SYST_CSR: u32 = 0xE000_E010;

/// Records where in the register write log each hook was called.
struct Recorder<'a> {
    sim: &'a Sim,
    disabled_at: Option<usize>,
    detached_at: Option<usize>,
}

impl<'a> Recorder<'a> {
    fn new(sim: &'a Sim) -> Self {
        Self {
            sim,
            disabled_at: None,
            detached_at: None,
        }
    }
}

impl Transport for Recorder<'_> {
    fn disable_interrupts(&mut self) {
        self.disabled_at = Some(self.sim.writes().len());
    }

    fn detach(&mut self) {
        self.detached_at = Some(self.sim.writes().len());
    }
}

/// A booted bootloader that has just written an application at `APP`.
fn booted_with_app() -> Sim {
    let sim = Sim::new();
    sim.run(|| bring_up(&sim));

    let mut flash = Flash::new(&sim);
    flash.unlock();
    flash.erase_page(APP).unwrap();
    flash.write_word(APP, APP_SP).unwrap();
    flash.write_word(APP + 4, APP_ENTRY).unwrap();

    nvic::configure(&sim, 20, 1, 0).unwrap();
    sim.set_pending(0, 1 << 20);
    sim
}

fn validated(sim: &Sim) -> ValidatedImage<'_, Sim> {
    match validate(Flash::new(sim), APP) {
        Ok(image) => image,
        Err(_) => panic!("image at {APP:#010x} should validate"),
    }
}

#[test]
fn written_image_is_launched_with_its_own_stack() {
    let sim = booted_with_app();

    let image = validated(&sim);
    assert_eq!(image.base(), APP);
    assert_eq!(image.stack_pointer(), APP_SP);

    let out: Outcome<()> = sim.run(|| handoff(image, &sim, &mut ()));

    assert_eq!(
        out,
        Outcome::Launched {
            sp: APP_SP,
            entry: APP_ENTRY
        }
    );
    assert_eq!(sim.launched(), Some((APP_SP, APP_ENTRY)));
}

#[test]
fn nothing_of_the_boot_rom_survives_the_jump() {
    let sim = booted_with_app();
    let image = validated(&sim);

    let _: Outcome<()> = sim.run(|| handoff(image, &sim, &mut ()));

    assert!(sim.flash_locked());
    for group in 0..2 {
        assert_eq!(sim.nvic_enabled(group), 0);
        assert_eq!(sim.nvic_pending(group), 0);
    }
    assert_eq!(sim.register(SYST_CSR), 0b100);

    assert_eq!(Rcc::new(&sim).sysclk_source(), Some(SysclkSource::Hsi));
    assert_eq!(sim.register(RCC_CFGR), 0);
    let cr = sim.register(RCC_CR);
    assert_eq!(cr & (rbits::CR_HSEON | rbits::CR_PLLON), 0);
    assert_eq!(sim.reset_requests(), 0);
}

#[test]
fn teardown_happens_in_order() {
    let sim = booted_with_app();
    let image = validated(&sim);
    let start = sim.writes().len();
    let mut transport = Recorder::new(&sim);

    let _: Outcome<()> = sim.run(|| handoff(image, &sim, &mut transport));

    let writes = sim.writes();
    let find = |pred: &dyn Fn(u32, u32) -> bool| {
        writes[start..]
            .iter()
            .position(|&(a, v)| pred(a, v))
            .map(|i| i + start)
            .expect("write not found")
    };

    let lock = find(&|a, v| a == FLASH_CR && v & fbits::CR_LOCK != 0);
    let icer = find(&|a, _| a == NVIC_ICER);
    let clocks = find(&|a, _| a == RCC_CFGR);
    let disabled = transport.disabled_at.expect("interrupts not disabled");
    let detached = transport.detached_at.expect("transport not detached");

    assert!(lock < disabled);
    assert!(disabled <= icer);
    assert!(icer < detached);
    assert!(detached <= clocks);
}

#[test]
fn image_erased_after_validation_is_not_entered() {
    let sim = booted_with_app();
    let image = validated(&sim);

    // The token holds the handle it was validated with, so the only way to
    // touch the image now is a second handle on the same bus.
    let mut other = Flash::new(&sim);
    other.erase_page(APP).unwrap();
    assert!(!is_valid_application(&sim, APP));

    let out: Outcome<()> = sim.run(|| handoff(image, &sim, &mut ()));

    assert_eq!(out, Outcome::Reset);
    assert_eq!(sim.reset_requests(), 1);
    assert_eq!(sim.launched(), None);
}

#[test]
fn image_rewritten_after_validation_is_not_entered() {
    let sim = Sim::new();
    sim.poke32(APP, APP_SP);
    sim.poke32(APP + 4, APP_ENTRY);
    let image = validated(&sim);

    sim.poke32(APP, 0x2000_4000);
    let out: Outcome<()> = sim.run(|| handoff(image, &sim, &mut ()));

    assert_eq!(out, Outcome::Reset);
    assert_eq!(sim.launched(), None);
}

#[test]
fn rejected_image_hands_flash_back() {
    let sim = Sim::new();
    let Err(mut flash) = validate(Flash::new(&sim), APP) else {
        panic!("blank flash should not validate");
    };

    // Still usable for another download attempt.
    flash.unlock();
    assert_eq!(flash.write_word(APP, APP_SP), Ok(()));
    assert_eq!(flash.write_word(APP + 4, APP_ENTRY), Ok(()));
    assert!(validate(flash, APP).is_ok());
}

#[test]
fn blank_flash_is_not_an_application() {
    let sim = Sim::new();
    assert!(!is_valid_application(&sim, APP));
    assert!(validate(Flash::new(&sim), APP).is_err());
}

#[test]
fn stack_pointer_into_flash_is_rejected() {
    let sim = Sim::new();
    sim.poke32(APP, 0x0800_8000);
    assert!(!is_valid_application(&sim, APP));
}

#[test]
fn stack_pointer_into_peripherals_is_rejected() {
    let sim = Sim::new();
    sim.poke32(APP, 0x4001_3800);
    assert!(!is_valid_application(&sim, APP));
}

#[test]
fn null_stack_pointer_is_rejected() {
    let sim = Sim::new();
    sim.poke32(APP, 0);
    assert!(!is_valid_application(&sim, APP));
}

#[test]
fn image_in_ram_can_be_validated() {
    // The transport may stage an image in RAM; validation only looks at the
    // stack pointer word, wherever it is.
    let sim = Sim::new();
    sim.poke32(0x2000_1000, 0x2000_4000);
    assert!(is_valid_application(&sim, 0x2000_1000));
}
