// Copyright (c) 2025 Katana contributors. Licensed under Apache License, Version 2.0.

//! Michael–Scott style unbounded singly-linked MPSC queue. Simpler than the
//! bounded ring buffer; used where producers are numerous but the consumer
//! is strictly single (the owning reactor).

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    data: Option<T>,
}

impl<T> Node<T> {
    fn sentinel() -> *mut Node<T> {
        Box::into_raw(Box::new(Node { next: AtomicPtr::new(ptr::null_mut()), data: None }))
    }
}

/// An unbounded MPSC queue with an optional soft capacity (`max_size`). Only
/// the consumer side is required to be single-threaded; any number of
/// threads may hold a cloned producer handle.
pub struct MpscQueue<T> {
    head: AtomicPtr<Node<T>>,
    tail: std::sync::Mutex<*mut Node<T>>,
    len: AtomicUsize,
    max_size: Option<usize>,
}

// SAFETY: all cross-thread access goes through the atomic head exchange and
// a mutex-guarded tail pointer; `Node<T>` ownership transfers exactly once
// per push/pop.
unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

impl<T> MpscQueue<T> {
    pub fn new() -> Self {
        let sentinel = Node::sentinel();
        Self {
            head: AtomicPtr::new(sentinel),
            tail: std::sync::Mutex::new(sentinel),
            len: AtomicUsize::new(0),
            max_size: None,
        }
    }

    pub fn with_max_size(max_size: usize) -> Self {
        let mut q = Self::new();
        q.max_size = Some(max_size);
        q
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unconditionally pushes, ignoring `max_size`.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node { next: AtomicPtr::new(ptr::null_mut()), data: Some(value) }));
        let prev = self.head.swap(node, Ordering::AcqRel);
        // SAFETY: `prev` was the head of the list and is never freed while
        // reachable; `next` is only ever written once per node, here.
        unsafe { (*prev).next.store(node, Ordering::Release) };
        self.len.fetch_add(1, Ordering::AcqRel);
    }

    /// Pushes only if doing so would not exceed `max_size` (when set).
    /// Returns `false` if rejected.
    pub fn try_push(&self, value: T) -> bool {
        if let Some(max) = self.max_size {
            loop {
                let current = self.len.load(Ordering::Acquire);
                if current >= max {
                    return false;
                }
                if self
                    .len
                    .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
            let node = Box::into_raw(Box::new(Node {
                next: AtomicPtr::new(ptr::null_mut()),
                data: Some(value),
            }));
            let prev = self.head.swap(node, Ordering::AcqRel);
            // SAFETY: same as `push`.
            unsafe { (*prev).next.store(node, Ordering::Release) };
            true
        } else {
            self.push(value);
            true
        }
    }

    /// Pops the oldest value. Must only be called from a single consumer at
    /// a time (enforced by the `&mut self` / single-owner-in-practice
    /// convention; the reactor holds its consumer handle privately).
    pub fn pop(&self) -> Option<T> {
        let mut tail = self.tail.lock().unwrap();
        // SAFETY: `*tail` always points at a live sentinel-or-consumed node
        // owned by this queue.
        let next = unsafe { (**tail).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        // SAFETY: `next` was published by `push`'s `swap`+`store` sequence
        // and is not freed until this pop consumes it.
        let data = unsafe { (*next).data.take() };
        let old_tail = *tail;
        *tail = next;
        drop(tail);
        // SAFETY: `old_tail` is no longer reachable from any future pop
        // (the tail mutex serializes consumers, and there is exactly one
        // consumer by contract) and was heap-allocated by `push`/`new`.
        unsafe { drop(Box::from_raw(old_tail)) };
        self.len.fetch_sub(1, Ordering::AcqRel);
        data
    }
}

impl<T> Default for MpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        let tail = *self.tail.lock().unwrap();
        // SAFETY: the final sentinel node is never freed by `pop` (it only
        // frees the *old* tail after advancing), so it must be reclaimed
        // here exactly once.
        unsafe { drop(Box::from_raw(tail)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_single_producer() {
        let q = MpscQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn try_push_respects_max_size() {
        let q: MpscQueue<u32> = MpscQueue::with_max_size(2);
        assert!(q.try_push(1));
        assert!(q.try_push(2));
        assert!(!q.try_push(3));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn multi_producer_fifo_per_producer_preserved() {
        let q = Arc::new(MpscQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        q.push((p, i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut last_seen = [-1i32; 4];
        let mut total = 0;
        while let Some((p, i)) = q.pop() {
            assert!(i as i32 > last_seen[p]);
            last_seen[p] = i as i32;
            total += 1;
        }
        assert_eq!(total, 800);
    }

    #[test]
    fn len_tracks_pushes_and_pops() {
        let q = MpscQueue::new();
        assert_eq!(q.len(), 0);
        q.push(1);
        q.push(2);
        assert_eq!(q.len(), 2);
        q.pop();
        assert_eq!(q.len(), 1);
    }
}
