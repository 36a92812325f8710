// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing boot ROM drivers.
//!
//! The boot ROM has no console. What it does have is RAM that a debugger can
//! read, so each driver module keeps a small static ring of recent events
//! that can be dumped after the fact, e.g. from GDB:
//!
//! ```console
//! (gdb) set print pretty on
//! (gdb) print drv_stm32f1_flash::__RINGBUF
//! ```
//!
//! ## Constraints
//!
//! The entry type must implement both `Copy` and `PartialEq`. Consecutive
//! identical entries from the same source line are coalesced by bumping a
//! count instead of taking a new slot.
//!
//! If you use the variants of the `ringbuf!` macro that leave the name of the
//! data structure implicit, you can only have one per module. (You can lift
//! this constraint by providing a name.)
//!
//! ## Creating a ring buffer
//!
//! ```
//! ringbuf!(Trace, 16, Trace::None);
//! ```
//!
//! and adding to it:
//!
//! ```
//! ringbuf_entry!(Trace::ErasePage(addr));
//! ```
//!
//! Recording never panics. If the buffer is already borrowed when an entry
//! arrives (a fault handler tracing on top of a driver, or two host test
//! threads sharing a static) the new entry is dropped.

#![cfg_attr(target_os = "none", no_std)]

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// Declares a ringbuffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ringbuffer named `NAME`,
/// containing entries of type `Type`, with room for `N` such entries, all of
/// which are initialized to `expr`.
///
/// To support the common case of having one ringbuffer per module, if you
/// omit the name, it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::StaticCell<$crate::Ringbuf<$t, $n>> =
            $crate::StaticCell::new($crate::Ringbuf {
                last: None,
                buffer: [$crate::RingbufEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: $init,
                }; $n],
            });
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
}

/// Inserts data into a named ringbuffer (which should have been declared with
/// the `ringbuf!` macro).
///
/// If you declared your ringbuffer without a name, you can also use this
/// without a name, and it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate both buf and payload, without letting them access each
        // other.
        let (p, buf) = ($payload, &$buf);
        if let Some(mut rb) = $crate::StaticCell::try_borrow_mut(buf) {
            $crate::Ringbuf::entry(&mut *rb, line!() as u16, p);
        }
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

/// A single ring buffer slot. `count` is the number of consecutive times the
/// same `payload` was recorded from the same `line`.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// A ring buffer of parametrized type and size. In practice, instantiating
/// this directly is strange -- see the [`ringbuf!`] macro.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub fn entry(&mut self, line: u16, payload: T) {
        // `None` is treated as an out-of-range index so the first entry lands
        // in slot 0 and is never coalesced.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        // No hardware divide on M0 parts, and a corrupted `last` must still
        // land somewhere valid, so wrap by comparison rather than remainder.
        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        if let Some(ent) = self.buffer.get_mut(ndx) {
            *ent = RingbufEntry {
                line,
                payload,
                count: 1,
                generation: ent.generation.wrapping_add(1),
            };
            self.last = Some(ndx);
        }
    }

    /// The most recently recorded entry, if any.
    pub fn latest(&self) -> Option<&RingbufEntry<T>> {
        self.last.and_then(|i| self.buffer.get(i))
    }
}

/// A `RefCell`-like container usable in a `static`, offering only exclusive
/// access and only by `try`.
pub struct StaticCell<T> {
    borrowed: AtomicBool,
    cell: UnsafeCell<T>,
}

impl<T> StaticCell<T> {
    pub const fn new(contents: T) -> Self {
        Self {
            borrowed: AtomicBool::new(false),
            cell: UnsafeCell::new(contents),
        }
    }

    /// Gets exclusive access to the contents, or `None` if a `StaticRef` to
    /// them is still alive.
    pub fn try_borrow_mut(&self) -> Option<StaticRef<'_, T>> {
        if self
            .borrowed
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        // Safety: the flag above ensures we are not producing an aliasing
        // &mut to our contents.
        Some(StaticRef {
            contents: unsafe { &mut *self.cell.get() },
            borrow: &self.borrowed,
        })
    }
}

unsafe impl<T: Send> Sync for StaticCell<T> {}

pub struct StaticRef<'a, T> {
    contents: &'a mut T,
    borrow: &'a AtomicBool,
}

impl<T> Drop for StaticRef<'_, T> {
    fn drop(&mut self) {
        self.borrow.store(false, Ordering::Release);
    }
}

impl<T> core::ops::Deref for StaticRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.contents
    }
}

impl<T> core::ops::DerefMut for StaticRef<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.contents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty<const N: usize>() -> Ringbuf<u32, N> {
        Ringbuf {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: 0,
            }; N],
        }
    }

    #[test]
    fn first_entry_lands_in_slot_zero() {
        let mut rb = empty::<4>();
        rb.entry(10, 7);
        assert_eq!(rb.last, Some(0));
        assert_eq!(rb.buffer[0].payload, 7);
        assert_eq!(rb.buffer[0].count, 1);
        assert_eq!(rb.buffer[0].generation, 1);
    }

    #[test]
    fn repeats_are_coalesced() {
        let mut rb = empty::<4>();
        rb.entry(10, 7);
        rb.entry(10, 7);
        rb.entry(10, 7);
        assert_eq!(rb.last, Some(0));
        assert_eq!(rb.buffer[0].count, 3);

        // Same payload from a different line is a new event.
        rb.entry(11, 7);
        assert_eq!(rb.last, Some(1));
    }

    #[test]
    fn wraps_and_bumps_generation() {
        let mut rb = empty::<2>();
        for p in 0..5 {
            rb.entry(1, p);
        }
        assert_eq!(rb.last, Some(0));
        assert_eq!(rb.latest().map(|e| e.payload), Some(4));
        assert_eq!(rb.buffer[0].generation, 3);
        assert_eq!(rb.buffer[1].generation, 2);
    }

    #[test]
    fn corrupted_last_restarts_at_zero() {
        let mut rb = empty::<4>();
        rb.last = Some(99);
        rb.entry(1, 5);
        assert_eq!(rb.last, Some(0));
    }

    #[test]
    fn nested_borrow_is_refused() {
        let cell = StaticCell::new(0u32);
        let guard = cell.try_borrow_mut();
        assert!(guard.is_some());
        assert!(cell.try_borrow_mut().is_none());
        drop(guard);
        assert!(cell.try_borrow_mut().is_some());
    }

    ringbuf!(TEST_RINGBUF, u32, 4, 0);

    #[test]
    fn macro_records_into_static() {
        ringbuf_entry!(TEST_RINGBUF, 42);
        let rb = TEST_RINGBUF.try_borrow_mut().unwrap();
        assert_eq!(rb.latest().map(|e| e.payload), Some(42));
    }
}
