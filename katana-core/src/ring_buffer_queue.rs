// Copyright (c) 2025 Katana contributors. Licensed under Apache License, Version 2.0.

//! Lock-free bounded MPMC ring buffer with an opportunistic SPSC fast path.
//!
//! Capacity is rounded up to a power of two. Each slot carries an atomic
//! sequence counter, initially equal to its index. A producer reserves a
//! slot with `CAS(head, head+1)`, writes the payload, then publishes with
//! `store(seq = head+1, release)`. A consumer waits for `seq == tail+1`,
//! reads the payload, then republishes the slot for the next lap with
//! `store(seq = tail + capacity, release)`.
//!
//! The SPSC fast path tracks the identity of the last thread to push and
//! the last thread to pop. While exactly one thread has ever pushed and
//! exactly one thread has ever popped, push/pop skip the CAS and use a
//! plain load-acquire + store-release instead. The first time a *second*
//! distinct thread appears on either side, that side's `multi_seen` flag
//! latches permanently — the fast path degrades monotonically into the
//! general MPMC path and never re-latches.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Duration;

use crate::error::QueueError;

/// A process-unique, never-reused thread identifier, used by the SPSC fast
/// path in place of the OS thread id (which on some platforms can be
/// reused after a thread exits). This sidesteps the open question the
/// original leaves undocumented: reuse cannot happen here by construction.
fn current_thread_id() -> u64 {
    thread_local! {
        static ID: u64 = next_thread_id();
    }
    ID.with(|id| *id)
}

fn next_thread_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

struct Slot<T> {
    sequence: AtomicU64,
    value: UnsafeCell<Option<T>>,
}

struct Inner<T> {
    buffer: Box<[Slot<T>]>,
    mask: u64,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    last_producer: CachePadded<AtomicU64>,
    last_consumer: CachePadded<AtomicU64>,
    multi_producer_seen: CachePadded<std::sync::atomic::AtomicBool>,
    multi_consumer_seen: CachePadded<std::sync::atomic::AtomicBool>,
    push_waiters: CachePadded<AtomicUsize>,
    pop_waiters: CachePadded<AtomicUsize>,
    parked_consumers: std::sync::Mutex<Vec<Thread>>,
    parked_producers: std::sync::Mutex<Vec<Thread>>,
}

// SAFETY: access to each slot's `value` is gated by the sequence-counter
// protocol below, which ensures exactly one side (producer xor consumer)
// observes a given slot's memory at a time.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

/// A bounded multi-producer multi-consumer queue. Cloning a handle is cheap
/// (it's an `Arc` to shared state); producers and consumers are not
/// distinguished by type, matching the original's single `ring_buffer_queue`
/// type used from both ends.
pub struct RingBufferQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RingBufferQueue<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

// SAFETY: `Inner<T>` is `Send + Sync` for `T: Send` as justified above.
unsafe impl<T: Send> Send for RingBufferQueue<T> {}
unsafe impl<T: Send> Sync for RingBufferQueue<T> {}

impl<T> RingBufferQueue<T> {
    /// Creates a queue whose capacity is the next power of two `>= capacity`
    /// (minimum 2).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let buffer: Box<[Slot<T>]> = (0..capacity)
            .map(|i| Slot { sequence: AtomicU64::new(i as u64), value: UnsafeCell::new(None) })
            .collect();

        Self {
            inner: Arc::new(Inner {
                buffer,
                mask: capacity as u64 - 1,
                head: CachePadded::new(AtomicU64::new(0)),
                tail: CachePadded::new(AtomicU64::new(0)),
                last_producer: CachePadded::new(AtomicU64::new(0)),
                last_consumer: CachePadded::new(AtomicU64::new(0)),
                multi_producer_seen: CachePadded::new(std::sync::atomic::AtomicBool::new(false)),
                multi_consumer_seen: CachePadded::new(std::sync::atomic::AtomicBool::new(false)),
                push_waiters: CachePadded::new(AtomicUsize::new(0)),
                pop_waiters: CachePadded::new(AtomicUsize::new(0)),
                parked_consumers: std::sync::Mutex::new(Vec::new()),
                parked_producers: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        (self.inner.mask + 1) as usize
    }

    /// A racy "probably empty" check: compares head/tail without claiming
    /// a slot. Safe to use for scheduling decisions (e.g. "is there work
    /// ready so the reactor shouldn't block"); never use it to skip a real
    /// `try_pop`, since a concurrent push can invalidate the answer
    /// immediately.
    pub fn is_empty_hint(&self) -> bool {
        self.inner.head.load(Ordering::Acquire) == self.inner.tail.load(Ordering::Acquire)
    }

    /// `Ok(())`: pushed via the SPSC fast path. `Err(value)`: fast-path
    /// preconditions don't hold (yet, or anymore); the caller still owns
    /// `value` and falls through to the general CAS path.
    fn try_fast_path_push(&self, value: T) -> Result<(), T> {
        let inner = &*self.inner;
        let tid = current_thread_id();

        if inner.multi_producer_seen.load(Ordering::Acquire) {
            return Err(value);
        }
        let recorded = inner.last_producer.load(Ordering::Acquire);
        if recorded == 0 {
            // First producer ever: latch identity, fall through to the
            // general (CAS) path for this call only.
            inner.last_producer.store(tid, Ordering::Release);
            return Err(value);
        }
        if recorded != tid {
            inner.multi_producer_seen.store(true, Ordering::Release);
            return Err(value);
        }
        if inner.multi_consumer_seen.load(Ordering::Acquire)
            || inner.last_consumer.load(Ordering::Acquire) == 0
        {
            // Either the consumer side has already degraded to MPMC, or the
            // opposite side has never been observed yet; either way SPSC
            // invariants aren't established, so use the general path.
            return Err(value);
        }

        let head = inner.head.load(Ordering::Relaxed);
        let slot = &inner.buffer[(head & inner.mask) as usize];
        if slot.sequence.load(Ordering::Acquire) != head {
            return Err(value);
        }
        // SAFETY: single producer has exclusive write access to this slot;
        // the sequence check above established that no consumer currently
        // holds it.
        unsafe { *slot.value.get() = Some(value) };
        inner.head.store(head + 1, Ordering::Relaxed);
        slot.sequence.store(head + 1, Ordering::Release);
        self.wake_one_consumer();
        Ok(())
    }

    /// Attempts to push without blocking. Returns `Err(QueueError::Full)` if
    /// the queue is at capacity, dropping `value` — this matches
    /// `schedule()`'s "returns false on a full queue" contract. Callers that
    /// need the value back on failure (e.g. [`RingBufferQueue::push_wait`])
    /// use [`RingBufferQueue::try_push_keep`] instead.
    pub fn try_push(&self, value: T) -> Result<(), QueueError> {
        self.try_push_keep(value).map_err(|(err, _)| err)
    }

    /// Same as [`RingBufferQueue::try_push`], but on failure hands `value`
    /// back instead of dropping it.
    pub fn try_push_keep(&self, value: T) -> Result<(), (QueueError, T)> {
        match self.try_fast_path_push(value) {
            Ok(()) => Ok(()),
            Err(v) => self.try_push_general(v),
        }
    }

    fn try_push_general(&self, value: T) -> Result<(), (QueueError, T)> {
        let inner = &*self.inner;
        loop {
            let head = inner.head.load(Ordering::Relaxed);
            let slot = &inner.buffer[(head & inner.mask) as usize];
            let seq = slot.sequence.load(Ordering::Acquire);

            if seq == head {
                if inner
                    .head
                    .compare_exchange_weak(head, head + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    // SAFETY: the CAS above gave this thread exclusive
                    // ownership of the slot for this lap.
                    unsafe { *slot.value.get() = Some(value) };
                    slot.sequence.store(head + 1, Ordering::Release);
                    self.record_producer(current_thread_id());
                    self.wake_one_consumer();
                    return Ok(());
                }
                // Lost the race; retry with the value still owned locally.
            } else if seq < head {
                // Buffer is full: the slot hasn't been vacated for this lap.
                return Err((QueueError::Full, value));
            } else {
                // Another producer has already moved head past us; retry
                // with a fresh read.
                std::hint::spin_loop();
            }
        }
    }

    fn record_producer(&self, tid: u64) {
        let inner = &*self.inner;
        let recorded = inner.last_producer.load(Ordering::Acquire);
        if recorded == 0 {
            inner.last_producer.store(tid, Ordering::Release);
        } else if recorded != tid {
            inner.multi_producer_seen.store(true, Ordering::Release);
        }
    }

    fn record_consumer(&self, tid: u64) {
        let inner = &*self.inner;
        let recorded = inner.last_consumer.load(Ordering::Acquire);
        if recorded == 0 {
            inner.last_consumer.store(tid, Ordering::Release);
        } else if recorded != tid {
            inner.multi_consumer_seen.store(true, Ordering::Release);
        }
    }

    fn try_fast_path_pop(&self) -> Result<Option<T>, ()> {
        let inner = &*self.inner;
        let tid = current_thread_id();

        if inner.multi_consumer_seen.load(Ordering::Acquire) {
            return Err(());
        }
        let recorded = inner.last_consumer.load(Ordering::Acquire);
        if recorded == 0 {
            inner.last_consumer.store(tid, Ordering::Release);
            return Err(());
        }
        if recorded != tid {
            inner.multi_consumer_seen.store(true, Ordering::Release);
            return Err(());
        }
        if inner.multi_producer_seen.load(Ordering::Acquire)
            || inner.last_producer.load(Ordering::Acquire) == 0
        {
            // Either the producer side has already degraded to MPMC, or the
            // opposite side has never been observed yet; either way SPSC
            // invariants aren't established, so use the general path.
            return Err(());
        }

        let tail = inner.tail.load(Ordering::Relaxed);
        let slot = &inner.buffer[(tail & inner.mask) as usize];
        if slot.sequence.load(Ordering::Acquire) != tail + 1 {
            return Ok(None);
        }
        // SAFETY: single consumer has exclusive read access; the sequence
        // check established the producer has finished publishing.
        let value = unsafe { (*slot.value.get()).take() };
        inner.tail.store(tail + 1, Ordering::Relaxed);
        slot.sequence.store(tail + inner.mask + 1, Ordering::Release);
        Ok(value)
    }

    /// Attempts to pop without blocking. Returns `Ok(None)` if the queue is
    /// currently empty.
    pub fn try_pop(&self) -> Option<T> {
        match self.try_fast_path_pop() {
            Ok(v) => return v,
            Err(()) => {}
        }
        self.try_pop_general()
    }

    fn try_pop_general(&self) -> Option<T> {
        let inner = &*self.inner;
        loop {
            let tail = inner.tail.load(Ordering::Relaxed);
            let slot = &inner.buffer[(tail & inner.mask) as usize];
            let seq = slot.sequence.load(Ordering::Acquire);
            let expected = tail + 1;

            if seq == expected {
                if inner
                    .tail
                    .compare_exchange_weak(tail, tail + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    // SAFETY: the CAS gave this thread exclusive ownership
                    // of the slot for this lap.
                    let value = unsafe { (*slot.value.get()).take() };
                    slot.sequence.store(tail + inner.mask + 1, Ordering::Release);
                    self.record_consumer(current_thread_id());
                    self.wake_one_producer();
                    return value;
                }
            } else if seq < expected {
                return None; // queue empty for this consumer's view
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Pushes `range` into the queue as a contiguous batch, in order.
    /// Returns the number of items actually pushed (fewer than
    /// `values.len()` if the queue filled up mid-batch).
    pub fn push_batch(&self, values: impl IntoIterator<Item = T>) -> usize {
        let mut n = 0;
        for v in values {
            if self.try_push(v).is_err() {
                break;
            }
            n += 1;
        }
        n
    }

    /// Pops up to `max` items, preserving order. Returns fewer than `max`
    /// if the queue emptied mid-batch.
    pub fn pop_batch(&self, max: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(max.min(self.capacity()));
        for _ in 0..max {
            match self.try_pop() {
                Some(v) => out.push(v),
                None => break,
            }
        }
        out
    }

    /// Pushes, spinning briefly and then parking the calling thread if the
    /// queue stays full, until either the push succeeds or `timeout`
    /// elapses.
    pub fn push_wait(&self, value: T, timeout: Duration) -> Result<(), QueueError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut spins = 0;
        let mut value = value;
        loop {
            match self.try_push_keep(value) {
                Ok(()) => return Ok(()),
                Err((QueueError::Full, v)) => value = v,
                Err((other, _)) => return Err(other),
            }
            if spins < 64 {
                std::hint::spin_loop();
                spins += 1;
                continue;
            }
            if std::time::Instant::now() >= deadline {
                return Err(QueueError::Full);
            }
            self.inner.push_waiters.fetch_add(1, Ordering::SeqCst);
            {
                let mut parked = self.inner.parked_producers.lock().unwrap();
                parked.push(thread::current());
            }
            thread::park_timeout(Duration::from_millis(1));
            self.inner.push_waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Pops, spinning briefly and then parking, until an item is available
    /// or `timeout` elapses.
    pub fn pop_wait(&self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut spins = 0;
        loop {
            if let Some(v) = self.try_pop() {
                return Some(v);
            }
            if spins < 64 {
                std::hint::spin_loop();
                spins += 1;
                continue;
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            self.inner.pop_waiters.fetch_add(1, Ordering::SeqCst);
            {
                let mut parked = self.inner.parked_consumers.lock().unwrap();
                parked.push(thread::current());
            }
            thread::park_timeout(Duration::from_millis(1));
            self.inner.pop_waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn wake_one_consumer(&self) {
        if self.inner.pop_waiters.load(Ordering::SeqCst) == 0 {
            return;
        }
        let mut parked = self.inner.parked_consumers.lock().unwrap();
        if let Some(t) = parked.pop() {
            t.unpark();
        }
    }

    fn wake_one_producer(&self) {
        if self.inner.push_waiters.load(Ordering::SeqCst) == 0 {
            return;
        }
        let mut parked = self.inner.parked_producers.lock().unwrap();
        if let Some(t) = parked.pop() {
            t.unpark();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc as StdArc;
    use std::thread;

    #[test]
    fn try_push_pop_round_trip() {
        let q = RingBufferQueue::new(4);
        assert!(q.try_push(1).is_ok());
        assert!(q.try_push(2).is_ok());
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn try_push_on_full_queue_returns_full_and_does_not_advance_head() {
        let q = RingBufferQueue::new(2);
        assert!(q.try_push(1).is_ok());
        assert!(q.try_push(2).is_ok());
        assert_eq!(q.try_push(3), Err(QueueError::Full));
        // head did not advance: draining still yields exactly the first two.
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let q: RingBufferQueue<u8> = RingBufferQueue::new(5);
        assert_eq!(q.capacity(), 8);
    }

    #[test]
    fn batch_push_and_pop_preserve_order() {
        let q = RingBufferQueue::new(16);
        let pushed = q.push_batch(0..10);
        assert_eq!(pushed, 10);
        let popped = q.pop_batch(10);
        assert_eq!(popped, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn batch_push_shrinks_when_queue_fills_mid_stream() {
        let q = RingBufferQueue::new(4);
        let pushed = q.push_batch(0..10);
        assert_eq!(pushed, 4);
    }

    #[test]
    fn mpmc_multiset_equals_after_drain() {
        // producers=4, consumers=2: multiset pushed == multiset popped.
        let q: RingBufferQueue<u64> = RingBufferQueue::new(1024);
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..1000u64 {
                        let v = p * 10_000 + i;
                        while q.try_push(v).is_err() {
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();

        let results = StdArc::new(std::sync::Mutex::new(Vec::new()));
        let done = StdArc::new(std::sync::atomic::AtomicBool::new(false));
        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let q = q.clone();
                let results = results.clone();
                let done = done.clone();
                thread::spawn(move || loop {
                    if let Some(v) = q.try_pop() {
                        results.lock().unwrap().push(v);
                    } else if done.load(Ordering::SeqCst) {
                        // Drain any stragglers after producers finished.
                        while let Some(v) = q.try_pop() {
                            results.lock().unwrap().push(v);
                        }
                        break;
                    }
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        for c in consumers {
            c.join().unwrap();
        }

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 4000);
        let expected: HashSet<u64> =
            (0..4u64).flat_map(|p| (0..1000u64).map(move |i| p * 10_000 + i)).collect();
        let actual: HashSet<u64> = results.iter().copied().collect();
        assert_eq!(expected, actual);
    }

    #[test]
    fn spsc_fast_path_fifo_single_thread_pair() {
        let q: RingBufferQueue<u32> = RingBufferQueue::new(64);
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..500u32 {
                    while q.try_push(i).is_err() {
                        std::hint::spin_loop();
                    }
                }
            })
        };
        let consumer_q = q.clone();
        let consumer = thread::spawn(move || {
            let mut out = Vec::with_capacity(500);
            while out.len() < 500 {
                if let Some(v) = consumer_q.try_pop() {
                    out.push(v);
                }
            }
            out
        });
        producer.join().unwrap();
        let out = consumer.join().unwrap();
        assert_eq!(out, (0..500u32).collect::<Vec<_>>());
    }

    /// Regression for the fast-path guard missing the opposite side's
    /// `multi_*_seen` check: once a second producer thread appears, the
    /// *established* consumer's fast path must degrade too, even though
    /// nothing on the consumer side itself changed.
    #[test]
    fn second_producer_disables_established_consumers_fast_path() {
        use std::sync::mpsc;

        let q: RingBufferQueue<u32> = RingBufferQueue::new(64);

        // Consumer B is kept alive for the whole test via a command channel
        // so "current thread" identity stays stable across both probes.
        let qb = q.clone();
        let (cmd_tx, cmd_rx) = mpsc::channel::<()>();
        let (pop_tx, pop_rx) = mpsc::channel::<Option<u32>>();
        let (probe_tx, probe_rx) = mpsc::channel::<bool>();
        let consumer = thread::spawn(move || {
            // First command: an ordinary pop, which records this thread as
            // the established consumer.
            cmd_rx.recv().unwrap();
            pop_tx.send(qb.try_pop()).unwrap();
            // Second command: probe the fast path directly, from the same
            // thread, after a second producer has appeared.
            cmd_rx.recv().unwrap();
            probe_tx.send(qb.try_fast_path_pop().is_ok()).unwrap();
        });

        // Producer A (this thread) pushes once: first push ever, so it
        // records this thread as the established producer and falls
        // through to the general path.
        assert!(q.try_push(1).is_ok());

        // Consumer B's first pop: last_consumer is still unset, so this
        // also falls through to the general path and records B's identity.
        cmd_tx.send(()).unwrap();
        assert_eq!(pop_rx.recv().unwrap(), Some(1));

        // Both identities are now established with no multi-seen flags set;
        // producer A's fast path should engage.
        assert!(q.try_fast_path_push(2).is_ok());

        // A second, distinct producer thread appears and must latch
        // `multi_producer_seen`, falling back to the general push path.
        let qc = q.clone();
        thread::spawn(move || assert!(qc.try_push(3).is_ok())).join().unwrap();
        assert!(q.inner.multi_producer_seen.load(Ordering::Acquire));

        // Consumer B, unchanged, probes its fast path again: per the
        // original's `spsc_pop_available`, it must now report unavailable
        // because the *producer* side has degraded, not because anything
        // changed on the consumer side.
        cmd_tx.send(()).unwrap();
        assert!(
            !probe_rx.recv().unwrap(),
            "consumer fast path must degrade once the producer side latches multi_producer_seen"
        );

        consumer.join().unwrap();
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), None);
    }
}
