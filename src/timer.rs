//! Monotonic clock and sorted one-shot callback list, grounded on
//! `original_source/kernel/timer.c`.
//!
//! The original's intrusive `timer_t` embedded in owning structs becomes
//! an opaque [`TimerId`] handle plus a boxed `FnMut`, since Rust has no
//! analogue of `container_of` for getting back from a list node to its
//! owner. Callbacks run with the timer subsystem's lock held, exactly as
//! the original runs them from inside `timer_tick`'s list walk (with
//! interrupts already disabled) — keep callbacks short.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

/// Opaque handle returned by [`schedule`], usable with [`cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

struct Entry {
    id: u64,
    deadline_ms: u64,
    callback: Box<dyn FnMut() + Send>,
}

struct TimerState {
    entries: Vec<Entry>,
    next_id: u64,
}

impl TimerState {
    const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Keeps `entries` sorted ascending by deadline, nearest-expiry last
    /// so expired timers can be popped off the back in O(1), mirroring
    /// the original's "insert before the first later entry" ordering.
    fn insert_sorted(&mut self, entry: Entry) {
        let pos = self
            .entries
            .iter()
            .position(|e| e.deadline_ms < entry.deadline_ms)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
    }

    fn schedule_abs(&mut self, when_ms: u64, callback: impl FnMut() + Send + 'static) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.insert_sorted(Entry {
            id,
            deadline_ms: when_ms,
            callback: Box::new(callback),
        });
        TimerId(id)
    }

    fn cancel(&mut self, id: TimerId) {
        self.entries.retain(|e| e.id != id.0);
    }

    fn is_active(&self, id: TimerId) -> bool {
        self.entries.iter().any(|e| e.id == id.0)
    }

    /// Runs every callback whose deadline is `<= now`.
    fn tick_to(&mut self, now: u64) {
        loop {
            let callback = match self.entries.last() {
                Some(e) if e.deadline_ms <= now => self.entries.pop().map(|e| e.callback),
                _ => None,
            };
            match callback {
                Some(mut cb) => cb(),
                None => break,
            }
        }
    }
}

static NOW_MS: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref STATE: Mutex<TimerState> = Mutex::new(TimerState::new());
}

/// Current monotonic time in milliseconds since boot.
#[must_use]
pub fn now_ms() -> u64 {
    NOW_MS.load(Ordering::Acquire)
}

/// Advances the monotonic clock by `elapsed_ms` and runs every callback
/// whose deadline has passed. Called from the PIT interrupt handler.
pub fn tick(elapsed_ms: u64) {
    let now = NOW_MS.fetch_add(elapsed_ms, Ordering::AcqRel) + elapsed_ms;
    STATE.lock().tick_to(now);
}

/// Schedules `callback` to run once, `delay_ms` from now.
pub fn schedule(delay_ms: u64, callback: impl FnMut() + Send + 'static) -> TimerId {
    schedule_abs(now_ms() + delay_ms, callback)
}

/// Schedules `callback` to run once at absolute time `when_ms`.
pub fn schedule_abs(when_ms: u64, callback: impl FnMut() + Send + 'static) -> TimerId {
    STATE.lock().schedule_abs(when_ms, callback)
}

/// Cancels a scheduled timer. No-op if it already fired or doesn't exist.
pub fn cancel(id: TimerId) {
    STATE.lock().cancel(id);
}

/// Whether a timer is still pending.
#[must_use]
pub fn is_active(id: TimerId) -> bool {
    STATE.lock().is_active(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicUsize;

    #[test_case]
    fn tick_runs_callbacks_in_deadline_order() {
        let mut state = TimerState::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&fired);
        state.schedule_abs(10, move || a.lock().push(1));
        let b = Arc::clone(&fired);
        state.schedule_abs(5, move || b.lock().push(2));
        state.tick_to(20);
        assert_eq!(&*fired.lock(), &[2, 1]);
    }

    #[test_case]
    fn cancel_prevents_callback() {
        let mut state = TimerState::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = state.schedule_abs(5, move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        state.cancel(id);
        state.tick_to(10);
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test_case]
    fn future_timer_does_not_fire_early() {
        let mut state = TimerState::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        state.schedule_abs(100, move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        state.tick_to(1);
        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert!(state.is_active(TimerId(1)));
    }
}
