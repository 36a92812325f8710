// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt channel setup and teardown.
//!
//! The boot ROM enables only the channels its transport needs, and on the
//! way out it disables and un-pends every channel. Teardown is all or
//! nothing: [`disable_all`] always covers every implemented group.

use drv_stm32f1_regs::bits::nvic as nbits;
use drv_stm32f1_regs::{Nvic, RegisterBus, Scb, SysTick, NVIC_GROUPS};
use ringbuf::{ringbuf, ringbuf_entry};

/// Highest channel number the boot ROM will configure, plus one.
pub const CHANNELS: u8 = (NVIC_GROUPS * 32) as u8;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IrqError {
    NoSuchChannel,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Configured { channel: u8, priority: u8 },
    AllDisabled,
}

ringbuf!(Trace, 8, Trace::None);

/// Packs a preemption priority and sub-priority into the 8-bit priority
/// field for the given AIRCR.PRIGROUP value.
///
/// Only the top four bits of the field exist. PRIGROUP decides how many of
/// them are preemption priority; groupings that would ask for more than four
/// preemption bits get all four. Out-of-range priorities are truncated, the
/// same way the hardware would truncate them.
pub fn encode_priority(prigroup: u32, preemption: u8, sub: u8) -> u8 {
    let preempt_bits = (7 - (prigroup & 0b111)).min(nbits::PRIORITY_BITS);
    let sub_bits = nbits::PRIORITY_BITS - preempt_bits;
    let sub_mask = (1u32 << sub_bits) - 1;

    let p = (u32::from(preemption) << sub_bits) | (u32::from(sub) & sub_mask);
    (p << nbits::PRIORITY_SHIFT) as u8
}

/// Sets the priority of `channel` and enables it.
pub fn configure<B: RegisterBus + ?Sized>(
    bus: &B,
    channel: u8,
    preemption: u8,
    sub: u8,
) -> Result<(), IrqError> {
    if channel >= CHANNELS {
        return Err(IrqError::NoSuchChannel);
    }

    let nvic = Nvic::new(bus);
    let priority =
        encode_priority(Scb::new(bus).priority_grouping(), preemption, sub);

    let shift = u32::from(channel & 0b11) * 8;
    let mask = 0xFFu32 << shift;
    nvic.ipr(usize::from(channel >> 2))
        .modify(|r| (r & !mask) | ((u32::from(priority) << shift) & mask));

    nvic.iser(usize::from(channel >> 5))
        .write(1u32 << (channel & 0x1F));

    ringbuf_entry!(Trace::Configured { channel, priority });
    Ok(())
}

/// Disables every interrupt channel, clears every pending flag, and stops
/// SysTick, which the NVIC does not control.
pub fn disable_all<B: RegisterBus + ?Sized>(bus: &B) {
    let nvic = Nvic::new(bus);
    for group in 0..NVIC_GROUPS {
        nvic.icer(group).write(0xFFFF_FFFF);
    }
    for group in 0..NVIC_GROUPS {
        nvic.icpr(group).write(0xFFFF_FFFF);
    }

    // Counter off, tick interrupt off, processor clock selected.
    SysTick::new(bus).csr().write(nbits::SYST_CSR_CLKSOURCE);

    ringbuf_entry!(Trace::AllDisabled);
}
