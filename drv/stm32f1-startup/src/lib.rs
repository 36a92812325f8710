// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clock tree bring-up for the STM32F1 boot ROM.
//!
//! Out of reset the part runs from the 8 MHz internal RC oscillator (HSI).
//! [`bring_up`] moves it to the external crystal (HSE) multiplied up to
//! 72 MHz by the PLL, sets the bus dividers and flash wait states to match,
//! and turns on the GPIO banks. [`reset_clock_tree`] is the inverse: it puts
//! the clock configuration back to its reset values, and is what the handoff
//! path uses so the application can do its own bring-up from a known state.
//!
//! The bring-up states (see [`ClockState`]) are not stored anywhere. The
//! hardware's ready bits are the only record of where we are; the states are
//! only named here so they can be traced.
//!
//! Every wait except PLL lock is unbounded. If the crystal never starts or
//! the clock switch never completes, the board is not functional and we
//! hang. The PLL gets a fixed poll budget, and if it runs out we request a
//! full system reset rather than run on an unstable clock.

#![cfg_attr(target_os = "none", no_std)]

pub mod nvic;

use drv_stm32f1_regs::bits::{afio as abits, flash as fbits, rcc as rbits};
use drv_stm32f1_regs::{Afio, FlashCtl, Rcc, RegisterBus, Scb};
use ringbuf::{ringbuf, ringbuf_entry};

/// Number of RCC_CR polls we'll spend waiting for PLL lock before giving up
/// and resetting the system.
pub const PLL_LOCK_BUDGET: u32 = 0x0500;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClockState {
    Reset,
    HseWaiting,
    PllConfiguring,
    PllWaiting,
    SysclkSwitching,
    Ready,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    State(ClockState),
    PllLockPolls(u32),
    PllLockTimeout,
}

ringbuf!(Trace, 16, Trace::None);

/// Static clock configuration. The crystal is fixed per board, so in practice
/// this is always [`ClockConfig::DEFAULT`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ClockConfig {
    /// HSE frequency in Hz. Informational; the hardware never sees it.
    pub hse_hz: u32,
    /// PLL multiplication factor applied to HSE.
    pub pll_multiplier: u32,
}

impl ClockConfig {
    /// 8 MHz crystal, PLL x9.
    pub const XTAL_8MHZ: Self = Self {
        hse_hz: 8_000_000,
        pll_multiplier: 9,
    };

    /// 12 MHz crystal, PLL x6.
    pub const XTAL_12MHZ: Self = Self {
        hse_hz: 12_000_000,
        pll_multiplier: 6,
    };

    cfg_if::cfg_if! {
        if #[cfg(feature = "xtal-12mhz")] {
            pub const DEFAULT: Self = Self::XTAL_12MHZ;
        } else {
            pub const DEFAULT: Self = Self::XTAL_8MHZ;
        }
    }

    pub const fn sysclk_hz(&self) -> u32 {
        self.hse_hz * self.pll_multiplier
    }

    /// CFGR bits for this configuration: PLL fed from HSE at the chosen
    /// multiplier, AHB undivided, APB1 at half speed.
    const fn cfgr(&self) -> u32 {
        rbits::CFGR_PLLSRC_HSE
            | rbits::cfgr_pllmul(self.pll_multiplier)
            | rbits::CFGR_PPRE1_DIV2
    }
}

/// Puts the clock configuration back to its reset state.
///
/// HSI is switched on and selected as SYSCLK; HSE, the clock security system
/// and the PLL are switched off and the PLL configuration is cleared. All
/// RCC interrupts are disabled. Peripheral clock enables are left alone.
pub fn reset_clock_tree<B: RegisterBus + ?Sized>(bus: &B) {
    let rcc = Rcc::new(bus);

    rcc.cr().set_bits(rbits::CR_HSION);
    rcc.cfgr().retain_bits(rbits::CFGR_KEEP_BUS_RESET);
    rcc.cr().retain_bits(rbits::CR_KEEP_OSC_RESET);
    // HSEBYP can only be written with HSE off, so this is a separate step.
    rcc.cr().retain_bits(rbits::CR_KEEP_BYPASS_RESET);
    rcc.cfgr().retain_bits(rbits::CFGR_KEEP_PLL_RESET);

    rcc.cir().write(0);

    ringbuf_entry!(Trace::State(ClockState::Reset));
}

/// Brings the clock tree up using the board's compile-time configuration.
pub fn bring_up<B: RegisterBus + ?Sized>(bus: &B) {
    bring_up_with(bus, &ClockConfig::DEFAULT)
}

/// Brings the clock tree up to `config`, starting from whatever state it is
/// in. Intended to run once, at boot.
///
/// If the PLL fails to lock within [`PLL_LOCK_BUDGET`] polls, this requests a
/// system reset and does not return.
pub fn bring_up_with<B: RegisterBus + ?Sized>(bus: &B, config: &ClockConfig) {
    let rcc = Rcc::new(bus);
    let flash = FlashCtl::new(bus);

    reset_clock_tree(bus);

    // HSI stays on alongside HSE; the flash controller needs it.
    rcc.cr().set_bits(rbits::CR_HSEON | rbits::CR_HSION);
    ringbuf_entry!(Trace::State(ClockState::HseWaiting));
    while !rcc.cr().any_set(rbits::CR_HSERDY) {
        // spin
    }

    // 72 MHz needs two wait states, and prefetch keeps that from hurting.
    // This must be in place before SYSCLK moves off HSI.
    ringbuf_entry!(Trace::State(ClockState::PllConfiguring));
    flash.acr().write(fbits::ACR_PRFTBE | fbits::ACR_LATENCY_2);
    rcc.cfgr().set_bits(config.cfgr());
    rcc.cr().set_bits(rbits::CR_PLLON);

    ringbuf_entry!(Trace::State(ClockState::PllWaiting));
    let mut budget = PLL_LOCK_BUDGET;
    while !rcc.cr().any_set(rbits::CR_PLLRDY) {
        budget -= 1;
        if budget == 0 {
            ringbuf_entry!(Trace::PllLockTimeout);
            Scb::new(bus).system_reset();
        }
    }
    ringbuf_entry!(Trace::PllLockPolls(PLL_LOCK_BUDGET - budget));

    ringbuf_entry!(Trace::State(ClockState::SysclkSwitching));
    rcc.cfgr().set_bits(rbits::CFGR_SW_PLL);
    while rcc.cfgr().read() & rbits::CFGR_SWS_MASK != rbits::CFGR_SWS_PLL {
        // spin
    }

    // GPIOA..GPIOE and AFIO on; everything else on APB2 off.
    rcc.apb2enr().write(
        rbits::APB2ENR_AFIOEN
            | rbits::APB2ENR_IOPAEN
            | rbits::APB2ENR_IOPBEN
            | rbits::APB2ENR_IOPCEN
            | rbits::APB2ENR_IOPDEN
            | rbits::APB2ENR_IOPEEN,
    );

    // Release the JTAG-only pins for use as GPIO, keeping SWD.
    Afio::new(bus).mapr().write(abits::MAPR_SWJ_CFG_NO_JTAG_SW);

    ringbuf_entry!(Trace::State(ClockState::Ready));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_crystals_reach_72mhz() {
        assert_eq!(ClockConfig::XTAL_8MHZ.sysclk_hz(), 72_000_000);
        assert_eq!(ClockConfig::XTAL_12MHZ.sysclk_hz(), 72_000_000);
    }

    #[test]
    fn cfgr_encodings_match_reference_values() {
        assert_eq!(ClockConfig::XTAL_8MHZ.cfgr(), 0x001D_0400);
        assert_eq!(ClockConfig::XTAL_12MHZ.cfgr(), 0x0011_0400);
    }
}
