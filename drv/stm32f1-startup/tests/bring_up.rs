// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use drv_stm32f1_regs::bits::rcc as rbits;
use drv_stm32f1_regs::{Rcc, SysclkSource};
use drv_stm32f1_startup::{
    bring_up, bring_up_with, nvic, reset_clock_tree, ClockConfig,
    PLL_LOCK_BUDGET,
};
use stm32f1_sim::{Outcome, Sim};

const RCC_CR: u32 = 0x4002_1000;
const RCC_CFGR: u32 = 0x4002_1004;
const RCC_CIR: u32 = 0x4002_1008;
const RCC_APB2ENR: u32 = 0x4002_1018;
const FLASH_ACR: u32 = 0x4002_2000;
const AFIO_MAPR: u32 = 0x4001_0004;
const NVIC_IPR: u32 = 0xE000_E400;
const SYST_CSR: u32 = 0xE000_E010;

fn position(sim: &Sim, pred: impl Fn(u32, u32) -> bool) -> usize {
    sim.writes()
        .iter()
        .position(|&(a, v)| pred(a, v))
        .expect("expected register write never happened")
}

#[test]
fn default_bring_up_runs_from_pll() {
    let sim = Sim::new();
    assert_eq!(sim.run(|| bring_up(&sim)), Outcome::Returned(()));

    assert_eq!(Rcc::new(&sim).sysclk_source(), Some(SysclkSource::Pll));
    let cfgr = sim.register(RCC_CFGR);
    assert_eq!(cfgr & 0x003F_0700, 0x001D_0400);
    assert_eq!(cfgr & rbits::CFGR_SW_MASK, rbits::CFGR_SW_PLL);

    let cr = sim.register(RCC_CR);
    assert_ne!(cr & rbits::CR_HSERDY, 0);
    assert_ne!(cr & rbits::CR_PLLRDY, 0);
    assert_ne!(cr & rbits::CR_HSION, 0);

    assert_eq!(sim.register(FLASH_ACR), 0x12);
    assert_eq!(sim.register(RCC_APB2ENR), 0x7D);
    assert_eq!(sim.register(AFIO_MAPR), 0x0200_0000);
    assert_eq!(sim.register(RCC_CIR), 0);
    assert_eq!(sim.reset_requests(), 0);
}

#[test]
fn twelve_mhz_crystal_uses_x6() {
    let sim = Sim::new();
    let out = sim.run(|| bring_up_with(&sim, &ClockConfig::XTAL_12MHZ));
    assert_eq!(out, Outcome::Returned(()));
    assert_eq!(sim.register(RCC_CFGR) & 0x003F_0700, 0x0011_0400);
}

#[test]
fn wait_states_are_set_before_sysclk_switch() {
    let sim = Sim::new();
    sim.run(|| bring_up(&sim));

    let hse_on =
        position(&sim, |a, v| a == RCC_CR && v & rbits::CR_HSEON != 0);
    let acr = position(&sim, |a, _| a == FLASH_ACR);
    let pll_on =
        position(&sim, |a, v| a == RCC_CR && v & rbits::CR_PLLON != 0);
    let switch = position(&sim, |a, v| {
        a == RCC_CFGR && v & rbits::CFGR_SW_MASK == rbits::CFGR_SW_PLL
    });
    let gpio = position(&sim, |a, _| a == RCC_APB2ENR);

    assert!(hse_on < acr);
    assert!(acr < pll_on);
    assert!(pll_on < switch);
    assert!(switch < gpio);
}

#[test]
fn pll_that_never_locks_resets_exactly_once() {
    let sim = Sim::new();
    sim.set_pll_lock_after(None);

    assert_eq!(sim.run(|| bring_up(&sim)), Outcome::Reset);
    assert_eq!(sim.reset_requests(), 1);

    // Never got as far as switching over or enabling GPIO.
    assert_eq!(sim.register(RCC_CFGR) & rbits::CFGR_SW_MASK, 0);
    assert_eq!(sim.register(RCC_APB2ENR), 0);
}

#[test]
fn pll_lock_on_final_poll_is_accepted() {
    let sim = Sim::new();
    sim.set_pll_lock_after(Some(PLL_LOCK_BUDGET - 1));
    assert_eq!(sim.run(|| bring_up(&sim)), Outcome::Returned(()));
    assert_eq!(sim.reset_requests(), 0);
}

#[test]
fn pll_lock_one_poll_late_resets() {
    let sim = Sim::new();
    sim.set_pll_lock_after(Some(PLL_LOCK_BUDGET));
    assert_eq!(sim.run(|| bring_up(&sim)), Outcome::Reset);
    assert_eq!(sim.reset_requests(), 1);
}

#[test]
fn clock_tree_reset_returns_to_hsi() {
    let sim = Sim::new();
    sim.run(|| bring_up(&sim));
    reset_clock_tree(&sim);

    let cr = sim.register(RCC_CR);
    assert_ne!(cr & rbits::CR_HSION, 0);
    let off = rbits::CR_HSEON
        | rbits::CR_HSEBYP
        | rbits::CR_CSSON
        | rbits::CR_PLLON
        | rbits::CR_PLLRDY;
    assert_eq!(cr & off, 0);
    assert_eq!(sim.register(RCC_CFGR), 0);
    assert_eq!(sim.register(RCC_CIR), 0);
    assert_eq!(Rcc::new(&sim).sysclk_source(), Some(SysclkSource::Hsi));

    // Peripheral clock enables survive.
    assert_eq!(sim.register(RCC_APB2ENR), 0x7D);
}

#[test]
fn configure_sets_priority_and_enables() {
    let sim = Sim::new();

    assert_eq!(nvic::configure(&sim, 20, 1, 0), Ok(()));
    assert_eq!(nvic::configure(&sim, 42, 3, 0), Ok(()));

    assert_eq!(sim.nvic_enabled(0), 1 << 20);
    assert_eq!(sim.nvic_enabled(1), 1 << 10);
    // Channel 20 is byte 0 of IPR5; channel 42 is byte 2 of IPR10.
    assert_eq!(sim.register(NVIC_IPR + 4 * 5), 0x10);
    assert_eq!(sim.register(NVIC_IPR + 4 * 10), 0x30 << 16);
}

#[test]
fn configure_leaves_neighbouring_priorities_alone() {
    let sim = Sim::new();
    sim.poke32(NVIC_IPR + 4 * 5, 0xAABB_CCDD);
    nvic::configure(&sim, 21, 2, 0).unwrap();
    assert_eq!(sim.register(NVIC_IPR + 4 * 5), 0xAABB_20DD);
}

#[test]
fn configure_rejects_missing_channel() {
    let sim = Sim::new();
    assert_eq!(
        nvic::configure(&sim, nvic::CHANNELS, 0, 0),
        Err(nvic::IrqError::NoSuchChannel)
    );
    assert!(sim.writes().is_empty());
}

#[test]
fn disable_all_clears_every_group_and_systick() {
    let sim = Sim::new();
    nvic::configure(&sim, 3, 0, 0).unwrap();
    nvic::configure(&sim, 60, 0, 0).unwrap();
    sim.set_pending(0, 0x8000_0001);
    sim.set_pending(1, 0x0000_0100);
    sim.poke32(SYST_CSR, 0b111);

    nvic::disable_all(&sim);

    for group in 0..2 {
        assert_eq!(sim.nvic_enabled(group), 0);
        assert_eq!(sim.nvic_pending(group), 0);
    }
    assert_eq!(sim.register(SYST_CSR), 0b100);
}
