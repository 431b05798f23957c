// Copyright (c) 2025 Katana contributors. Licensed under Apache License, Version 2.0.

//! Single-level hashed timing wheel. O(1) insert and cancel, bucketed
//! expiry, bounded by `NUM_SLOTS * SLOT_MS` per rotation.

use std::collections::HashMap;
use std::time::Duration;

/// Opaque handle returned by [`WheelTimer::add`]. `0` is reserved to mean
/// "no timer" and is never handed out.
pub type TimeoutId = u64;

struct Entry<F> {
    id: TimeoutId,
    remaining_ticks: u32,
    callback: Option<F>,
}

/// A hashed timing wheel with `NUM_SLOTS` buckets of `SLOT_MS` milliseconds
/// each. The default construction matches the original's epoll variant (512
/// slots x 100ms = 51.2s horizon); [`WheelTimer::io_uring_default`] gives the
/// finer-grained 2048 x 8ms variant.
pub struct WheelTimer<F> {
    slots: Vec<Vec<Entry<F>>>,
    /// `id -> slot index`, so cancel is an O(1) slot lookup plus a linear
    /// scan of that slot's (typically tiny) bucket.
    id_to_slot: HashMap<TimeoutId, usize>,
    current_slot: usize,
    next_id: TimeoutId,
    slot_ms: u64,
}

impl<F> WheelTimer<F> {
    pub fn new(num_slots: usize, slot_ms: u64) -> Self {
        assert!(num_slots > 0, "wheel must have at least one slot");
        assert!(slot_ms > 0, "slot width must be positive");
        Self {
            slots: (0..num_slots).map(|_| Vec::new()).collect(),
            id_to_slot: HashMap::new(),
            current_slot: 0,
            next_id: 1,
            slot_ms,
        }
    }

    /// 512 slots x 100ms, the epoll-backend default from the original.
    pub fn epoll_default() -> Self {
        Self::new(512, 100)
    }

    /// 2048 slots x 8ms, the io_uring-backend default from the original —
    /// finer granularity at the cost of rotation horizon (~16s vs ~51.2s).
    pub fn io_uring_default() -> Self {
        Self::new(2048, 8)
    }

    pub fn slot_ms(&self) -> u64 {
        self.slot_ms
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn pending_count(&self) -> usize {
        self.id_to_slot.len()
    }

    /// Schedule `callback` to fire after `timeout_ms`. Ticks are rounded up
    /// (`ceil`) and clamped to the wheel's maximum single-rotation horizon.
    pub fn add(&mut self, timeout_ms: u64, callback: F) -> TimeoutId {
        let num_slots = self.slots.len() as u64;
        let ticks = timeout_ms.div_ceil(self.slot_ms).clamp(1, num_slots - 1);

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1; // 0 is reserved as "no timer"; skip it on wrap.
        }

        let slot = (self.current_slot + ticks as usize) % self.slots.len();
        self.slots[slot].push(Entry {
            id,
            remaining_ticks: ticks as u32,
            callback: Some(callback),
        });
        self.id_to_slot.insert(id, slot);
        id
    }

    /// Cancels a pending timer. Returns whether it was actually pending.
    /// Best-effort: if the entry has already been dequeued by `tick()` (i.e.
    /// fired in this same `tick()` call before `cancel` observes it), this
    /// returns `false` and the callback still runs — cancellation never
    /// races with `tick()` since both happen on the same reactor thread.
    pub fn cancel(&mut self, id: TimeoutId) -> bool {
        let Some(slot) = self.id_to_slot.remove(&id) else {
            return false;
        };
        let bucket = &mut self.slots[slot];
        if let Some(pos) = bucket.iter().position(|e| e.id == id) {
            bucket.remove(pos);
            true
        } else {
            false
        }
    }

    /// Advances the wheel by one slot and returns the payloads of every
    /// entry that came due, without invoking anything. Useful when `F` is
    /// plain data (e.g. an fd) rather than a callback, and the caller needs
    /// `&mut` access to state the wheel itself can't borrow (the reactor's
    /// fd table) while processing expirations. Re-links everything else
    /// exactly like [`Self::tick`].
    pub fn tick_collect_due(&mut self) -> Vec<F> {
        let current = self.current_slot;
        let due: Vec<Entry<F>> = {
            let bucket = &mut self.slots[current];
            let mut due = Vec::new();
            let mut retained = Vec::with_capacity(bucket.len());
            for mut entry in bucket.drain(..) {
                if entry.remaining_ticks <= 1 {
                    due.push(entry);
                } else {
                    entry.remaining_ticks -= 1;
                    retained.push(entry);
                }
            }
            *bucket = retained;
            due
        };

        let relinked: Vec<(usize, Entry<F>)> = self.slots[current]
            .drain(..)
            .map(|entry| {
                let num_slots = self.slots.len();
                let target = (current + entry.remaining_ticks as usize) % num_slots;
                (target, entry)
            })
            .collect();
        for (target, entry) in relinked {
            self.id_to_slot.insert(entry.id, target);
            self.slots[target].push(entry);
        }

        self.current_slot = (self.current_slot + 1) % self.slots.len();

        due.into_iter()
            .filter_map(|mut entry| {
                self.id_to_slot.remove(&entry.id);
                entry.callback.take()
            })
            .collect()
    }

    /// Time until the next entry would be due, scanning forward from the
    /// current slot. `None` means no timer is pending anywhere in the
    /// wheel.
    pub fn time_until_next_expiration(&self) -> Option<Duration> {
        if self.id_to_slot.is_empty() {
            return None;
        }
        if !self.slots[self.current_slot].is_empty() {
            return Some(Duration::ZERO);
        }
        for k in 1..self.slots.len() {
            let idx = (self.current_slot + k) % self.slots.len();
            if !self.slots[idx].is_empty() {
                return Some(Duration::from_millis(k as u64 * self.slot_ms));
            }
        }
        None
    }
}

impl<F: FnOnce()> WheelTimer<F> {
    /// Advances the wheel by one slot, firing every entry whose
    /// `remaining_ticks` has reached zero and re-linking the rest into a
    /// later slot of the same wheel. Entries within a slot fire in
    /// insertion order.
    pub fn tick(&mut self) {
        let current = self.current_slot;
        let due: Vec<Entry<F>> = {
            let bucket = &mut self.slots[current];
            let mut due = Vec::new();
            let mut retained = Vec::with_capacity(bucket.len());
            for mut entry in bucket.drain(..) {
                if entry.remaining_ticks <= 1 {
                    due.push(entry);
                } else {
                    entry.remaining_ticks -= 1;
                    retained.push(entry);
                }
            }
            *bucket = retained;
            due
        };

        // Re-link entries that still have time left: they stay logically
        // "in the current slot's bucket" conceptually in the original, but
        // since slots are indexed by absolute position we recompute their
        // target slot from the decremented remaining_ticks.
        let relinked: Vec<(usize, Entry<F>)> = self.slots[current]
            .drain(..)
            .map(|entry| {
                let num_slots = self.slots.len();
                let target = (current + entry.remaining_ticks as usize) % num_slots;
                (target, entry)
            })
            .collect();
        for (target, entry) in relinked {
            self.id_to_slot.insert(entry.id, target);
            self.slots[target].push(entry);
        }

        for mut entry in due {
            self.id_to_slot.remove(&entry.id);
            if let Some(callback) = entry.callback.take() {
                callback();
            }
        }

        self.current_slot = (self.current_slot + 1) % self.slots.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn does_not_fire_before_deadline_fires_exactly_once_after() {
        // add(100ms) on a 100ms/slot wheel lands the entry one slot ahead of
        // current_slot. The first tick() (modeling ~50-100ms elapsed) only
        // drains the *current* slot, which is still empty, so nothing
        // fires; the second tick() reaches the entry's slot and fires it
        // exactly once (spec end-to-end scenario 6).
        let fired = Rc::new(RefCell::new(0));
        let mut wheel: WheelTimer<Box<dyn FnOnce()>> = WheelTimer::new(512, 100);
        let f = fired.clone();
        wheel.add(100, Box::new(move || *f.borrow_mut() += 1));

        wheel.tick();
        assert_eq!(*fired.borrow(), 0, "must not fire before its deadline");
        wheel.tick();
        assert_eq!(*fired.borrow(), 1, "must fire exactly once at its deadline");
        wheel.tick();
        assert_eq!(*fired.borrow(), 1, "must not fire again");
    }

    #[test]
    fn cancel_prevents_firing() {
        let fired = Rc::new(RefCell::new(false));
        let mut wheel: WheelTimer<Box<dyn FnOnce()>> = WheelTimer::new(16, 10);
        let f = fired.clone();
        let id = wheel.add(50, Box::new(move || *f.borrow_mut() = true));
        assert!(wheel.cancel(id));
        for _ in 0..10 {
            wheel.tick();
        }
        assert!(!*fired.borrow());
    }

    #[test]
    fn cancel_twice_returns_false_second_time() {
        let mut wheel: WheelTimer<Box<dyn FnOnce()>> = WheelTimer::new(16, 10);
        let id = wheel.add(20, Box::new(|| {}));
        assert!(wheel.cancel(id));
        assert!(!wheel.cancel(id));
    }

    #[test]
    fn fires_in_insertion_order_within_a_slot() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut wheel: WheelTimer<Box<dyn FnOnce()>> = WheelTimer::new(16, 10);
        for i in 0..5 {
            let o = order.clone();
            wheel.add(10, Box::new(move || o.borrow_mut().push(i)));
        }
        wheel.tick();
        wheel.tick();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn time_until_next_expiration_tracks_slot_distance() {
        let mut wheel: WheelTimer<Box<dyn FnOnce()>> = WheelTimer::new(16, 10);
        assert_eq!(wheel.time_until_next_expiration(), None);
        wheel.add(30, Box::new(|| {}));
        let remaining = wheel.time_until_next_expiration().unwrap();
        assert!(remaining.as_millis() > 0);
    }

    #[test]
    fn tick_collect_due_returns_payloads_without_invoking() {
        let mut wheel: WheelTimer<i32> = WheelTimer::new(16, 10);
        wheel.add(10, 42);
        assert!(wheel.tick_collect_due().is_empty(), "not due after only one tick");
        let due = wheel.tick_collect_due();
        assert_eq!(due, vec![42]);
        assert_eq!(wheel.pending_count(), 0);
    }

    #[test]
    fn ticks_are_clamped_to_wheel_horizon() {
        let mut wheel: WheelTimer<Box<dyn FnOnce()>> = WheelTimer::new(4, 10);
        // 1000ms would need 100 ticks on a 10ms wheel; clamp to num_slots-1.
        let id = wheel.add(1000, Box::new(|| {}));
        let slot = *wheel.id_to_slot.get(&id).unwrap();
        assert_eq!(slot, 3);
    }
}
