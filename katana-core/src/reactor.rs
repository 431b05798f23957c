// Copyright (c) 2025 Katana contributors. Licensed under Apache License, Version 2.0.

//! The single-threaded-per-core event reactor: owns one [`Multiplexer`], a
//! fd registration table, a hashed wheel for per-fd timeouts, and a
//! deadline min-heap for `schedule_after`. Everything but the bounded
//! queues and the atomic run/shutdown flags is touched exclusively by the
//! thread that calls [`EventReactor::run`] — that thread also registers new
//! fds (e.g. from inside an accept callback), so `register_fd` and friends
//! take `&mut self` rather than needing their own synchronization.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{default_exception_handler, ExceptionContext, ExceptionHandler, KatanaResult, ReactorError};
use crate::fd_event::{EventCallback, EventType};
use crate::multiplexer::{Multiplexer, Wakeup};
use crate::ring_buffer_queue::RingBufferQueue;
use crate::task::Task;
use crate::wheel_timer::WheelTimer;

/// Per-fd deadline configuration. The effective timeout used is
/// `min(idle, read-if-subscribed, write-if-subscribed)`, clamped to at
/// least 1ms.
#[derive(Debug, Clone, Copy)]
pub struct FdTimeoutConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for FdTimeoutConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl FdTimeoutConfig {
    fn effective_ms(&self, events: EventType) -> u64 {
        let mut candidate = self.idle_timeout;
        if events.has(EventType::READABLE) {
            candidate = candidate.min(self.read_timeout);
        }
        if events.has(EventType::WRITABLE) {
            candidate = candidate.min(self.write_timeout);
        }
        candidate.as_millis().max(1) as u64
    }
}

struct FdState {
    callback: EventCallback,
    events: EventType,
    timeout: Option<FdTimeoutConfig>,
    timeout_id: Option<crate::wheel_timer::TimeoutId>,
}

/// A task deferred until a future deadline, merged from the pending-timer
/// queue into the reactor's internal min-heap. Ordered by deadline only
/// (earliest first), so two entries with the same deadline are considered
/// equal for heap purposes — ties break in merge order.
struct TimerEntry {
    deadline: Instant,
    task: Task,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the earliest deadline.
        other.deadline.cmp(&self.deadline)
    }
}

/// In-process counters only; no exporter wiring. `tasks_rejected` is
/// carried even though it's easy to omit, since a saturated queue silently
/// dropping work without a counter is a real operability gap.
#[derive(Debug, Default)]
pub struct ReactorMetrics {
    tasks_executed: AtomicU64,
    tasks_scheduled: AtomicU64,
    tasks_rejected: AtomicU64,
    fd_events_processed: AtomicU64,
    exceptions_caught: AtomicU64,
    timers_fired: AtomicU64,
}

/// Point-in-time copy of [`ReactorMetrics`], cheap to compare in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactorMetricsSnapshot {
    pub tasks_executed: u64,
    pub tasks_scheduled: u64,
    pub tasks_rejected: u64,
    pub fd_events_processed: u64,
    pub exceptions_caught: u64,
    pub timers_fired: u64,
}

impl ReactorMetrics {
    fn snapshot(&self) -> ReactorMetricsSnapshot {
        ReactorMetricsSnapshot {
            tasks_executed: self.tasks_executed.load(AtomicOrdering::Relaxed),
            tasks_scheduled: self.tasks_scheduled.load(AtomicOrdering::Relaxed),
            tasks_rejected: self.tasks_rejected.load(AtomicOrdering::Relaxed),
            fd_events_processed: self.fd_events_processed.load(AtomicOrdering::Relaxed),
            exceptions_caught: self.exceptions_caught.load(AtomicOrdering::Relaxed),
            timers_fired: self.timers_fired.load(AtomicOrdering::Relaxed),
        }
    }
}

/// A cloneable, `Send + Sync` handle to a reactor's cross-thread surface —
/// everything `EventReactor`'s exclusive-ownership thread doesn't need sole
/// access to. Obtained with [`EventReactor::handle`] before the reactor is
/// moved onto its own thread.
#[derive(Clone)]
pub struct ReactorHandle {
    pending_tasks: RingBufferQueue<Task>,
    pending_timers: RingBufferQueue<TimerEntry>,
    wakeup: Arc<dyn Wakeup>,
    metrics: Arc<ReactorMetrics>,
    running: Arc<AtomicBool>,
    graceful_shutdown: Arc<AtomicBool>,
}

impl ReactorHandle {
    /// Enqueues `task` onto the bounded MPMC queue; wakes the reactor if it
    /// is blocked in its multiplexer. Returns `false` if the queue is
    /// saturated (the task is dropped).
    pub fn schedule(&self, task: Task) -> bool {
        match self.pending_tasks.try_push(task) {
            Ok(()) => {
                self.metrics.tasks_scheduled.fetch_add(1, AtomicOrdering::Relaxed);
                let _ = self.wakeup.wake();
                true
            }
            Err(_) => {
                self.metrics.tasks_rejected.fetch_add(1, AtomicOrdering::Relaxed);
                false
            }
        }
    }

    /// Enqueues `task` to run after `delay`; the reactor merges it into its
    /// deadline heap on its own thread at the start of its next loop
    /// iteration.
    pub fn schedule_after(&self, delay: Duration, task: Task) -> bool {
        let deadline = Instant::now() + delay;
        match self.pending_timers.try_push(TimerEntry { deadline, task }) {
            Ok(()) => {
                self.metrics.tasks_scheduled.fetch_add(1, AtomicOrdering::Relaxed);
                let _ = self.wakeup.wake();
                true
            }
            Err(_) => {
                self.metrics.tasks_rejected.fetch_add(1, AtomicOrdering::Relaxed);
                false
            }
        }
    }

    pub fn stop(&self) {
        self.running.store(false, AtomicOrdering::Relaxed);
        let _ = self.wakeup.wake();
    }

    pub fn metrics(&self) -> ReactorMetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Tunables for one reactor. Every field has a spec-derived default; none
/// is parsed from a file or environment.
#[derive(Debug, Clone, Copy)]
pub struct ReactorConfig {
    pub max_pending_tasks: usize,
    pub max_pending_timers: usize,
    pub wheel_num_slots: usize,
    pub wheel_slot_ms: u64,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self { max_pending_tasks: 10_000, max_pending_timers: 10_000, wheel_num_slots: 512, wheel_slot_ms: 100 }
    }
}

impl ReactorConfig {
    /// Matches the io_uring backend's finer-grained wheel (2048 x 8ms).
    pub fn io_uring_defaults() -> Self {
        Self { wheel_num_slots: 2048, wheel_slot_ms: 8, ..Default::default() }
    }
}

pub struct EventReactor<M: Multiplexer> {
    multiplexer: M,
    fd_states: HashMap<RawFd, FdState>,
    pending_tasks: RingBufferQueue<Task>,
    pending_timers: RingBufferQueue<TimerEntry>,
    timer_heap: BinaryHeap<TimerEntry>,
    fd_timeout_wheel: WheelTimer<RawFd>,
    last_wheel_tick: Instant,
    running: Arc<AtomicBool>,
    graceful_shutdown: Arc<AtomicBool>,
    graceful_deadline: Mutex<Option<Instant>>,
    exception_handler: ExceptionHandler,
    metrics: Arc<ReactorMetrics>,
    wakeup: Arc<dyn Wakeup>,
}

impl<M: Multiplexer> EventReactor<M> {
    pub fn new(multiplexer: M, config: ReactorConfig) -> Self {
        let wakeup = multiplexer.wakeup_handle();
        Self {
            fd_states: HashMap::new(),
            pending_tasks: RingBufferQueue::new(config.max_pending_tasks),
            pending_timers: RingBufferQueue::new(config.max_pending_timers),
            timer_heap: BinaryHeap::new(),
            fd_timeout_wheel: WheelTimer::new(config.wheel_num_slots, config.wheel_slot_ms),
            last_wheel_tick: Instant::now(),
            running: Arc::new(AtomicBool::new(false)),
            graceful_shutdown: Arc::new(AtomicBool::new(false)),
            graceful_deadline: Mutex::new(None),
            exception_handler: default_exception_handler(),
            metrics: Arc::new(ReactorMetrics::default()),
            wakeup,
            multiplexer,
        }
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            pending_tasks: self.pending_tasks.clone(),
            pending_timers: self.pending_timers.clone(),
            wakeup: self.wakeup.clone(),
            metrics: self.metrics.clone(),
            running: self.running.clone(),
            graceful_shutdown: self.graceful_shutdown.clone(),
        }
    }

    pub fn metrics(&self) -> ReactorMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn set_exception_handler(&mut self, handler: ExceptionHandler) {
        self.exception_handler = handler;
    }

    pub fn register_fd(&mut self, fd: RawFd, events: EventType, callback: EventCallback) -> KatanaResult<()> {
        self.register_fd_with_timeout(fd, events, callback, None)
    }

    pub fn register_fd_with_timeout(
        &mut self,
        fd: RawFd,
        events: EventType,
        callback: EventCallback,
        timeout: Option<FdTimeoutConfig>,
    ) -> KatanaResult<()> {
        if fd < 0 {
            return Err(ReactorError::InvalidFd(fd));
        }
        if self.fd_states.contains_key(&fd) {
            return Err(ReactorError::AlreadyRegistered(fd));
        }
        self.multiplexer.register(fd, events)?;
        let timeout_id = timeout.map(|cfg| self.fd_timeout_wheel.add(cfg.effective_ms(events), fd));
        self.fd_states.insert(fd, FdState { callback, events, timeout, timeout_id });
        Ok(())
    }

    pub fn modify_fd(&mut self, fd: RawFd, events: EventType) -> KatanaResult<()> {
        if fd < 0 {
            return Err(ReactorError::InvalidFd(fd));
        }
        let state = self.fd_states.get_mut(&fd).ok_or(ReactorError::NotRegistered(fd))?;
        self.multiplexer.modify(fd, events)?;
        state.events = events;
        Ok(())
    }

    pub fn unregister_fd(&mut self, fd: RawFd) -> KatanaResult<()> {
        if fd < 0 {
            return Err(ReactorError::InvalidFd(fd));
        }
        let state = self.fd_states.remove(&fd).ok_or(ReactorError::NotRegistered(fd))?;
        if let Some(id) = state.timeout_id {
            self.fd_timeout_wheel.cancel(id);
        }
        self.multiplexer.deregister(fd)
    }

    /// Resets `fd`'s timeout deadline to `now + configured`. Called by user
    /// code whenever the fd saw observable activity (a successful read or
    /// write).
    pub fn refresh_fd_timeout(&mut self, fd: RawFd) {
        let Some(state) = self.fd_states.get_mut(&fd) else { return };
        let Some(cfg) = state.timeout else { return };
        if let Some(id) = state.timeout_id {
            self.fd_timeout_wheel.cancel(id);
        }
        state.timeout_id = Some(self.fd_timeout_wheel.add(cfg.effective_ms(state.events), fd));
    }

    pub fn stop(&self) {
        self.running.store(false, AtomicOrdering::Relaxed);
    }

    pub fn graceful_stop(&self, timeout: Duration) {
        *self.graceful_deadline.lock().unwrap() = Some(Instant::now() + timeout);
        self.graceful_shutdown.store(true, AtomicOrdering::Relaxed);
    }

    fn handle_panic(&mut self, location: &'static str, fd: Option<RawFd>, payload: Box<dyn std::any::Any + Send>) {
        self.metrics.exceptions_caught.fetch_add(1, AtomicOrdering::Relaxed);
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        let ctx = ExceptionContext { location, message, fd };
        let handler_result = catch_unwind(AssertUnwindSafe(|| (self.exception_handler)(&ctx)));
        if handler_result.is_err() {
            tracing::error!("exception handler itself panicked while handling {}", location);
        }
    }

    fn force_close_due_fd(&mut self, fd: RawFd) {
        let Some(mut state) = self.fd_states.remove(&fd) else { return };
        let result = catch_unwind(AssertUnwindSafe(|| (state.callback)(EventType::ERROR)));
        if let Err(payload) = result {
            self.handle_panic("fd_timeout", Some(fd), payload);
        }
        let _ = self.multiplexer.deregister(fd);
        state.timeout_id = None;
    }

    fn drain_due_fd_timeouts(&mut self) {
        let now = Instant::now();
        let slot_ms = self.fd_timeout_wheel.slot_ms();
        let mut elapsed = now.duration_since(self.last_wheel_tick).as_millis() as u64;
        // Cap the catch-up to one full rotation: a reactor that was starved
        // for longer than that has bigger problems than a late timeout.
        let max_ticks = self.fd_timeout_wheel.num_slots() as u64;
        let mut ticks = 0u64;
        while elapsed >= slot_ms && ticks < max_ticks {
            let due = self.fd_timeout_wheel.tick_collect_due();
            for fd in due {
                self.force_close_due_fd(fd);
                self.metrics.timers_fired.fetch_add(1, AtomicOrdering::Relaxed);
            }
            elapsed -= slot_ms;
            ticks += 1;
        }
        if ticks > 0 {
            self.last_wheel_tick = now;
        }
    }

    fn merge_pending_timers(&mut self) {
        while let Some(entry) = self.pending_timers.try_pop() {
            self.timer_heap.push(entry);
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while matches!(self.timer_heap.peek(), Some(entry) if entry.deadline <= now) {
            let entry = self.timer_heap.pop().expect("peek just confirmed Some");
            let result = catch_unwind(AssertUnwindSafe(|| entry.task.call()));
            match result {
                Ok(()) => {
                    self.metrics.tasks_executed.fetch_add(1, AtomicOrdering::Relaxed);
                    self.metrics.timers_fired.fetch_add(1, AtomicOrdering::Relaxed);
                }
                Err(payload) => self.handle_panic("delayed_task", None, payload),
            }
        }
    }

    fn drain_pending_tasks(&mut self) {
        while let Some(task) = self.pending_tasks.try_pop() {
            let result = catch_unwind(AssertUnwindSafe(|| task.call()));
            match result {
                Ok(()) => {
                    self.metrics.tasks_executed.fetch_add(1, AtomicOrdering::Relaxed);
                }
                Err(payload) => self.handle_panic("scheduled_task", None, payload),
            }
        }
    }

    fn force_close_all_remaining(&mut self) {
        let fds: Vec<RawFd> = self.fd_states.keys().copied().collect();
        for fd in fds {
            self.force_close_due_fd(fd);
        }
    }

    fn calculate_timeout(&self) -> Option<Duration> {
        if !self.pending_tasks.is_empty_hint() {
            return Some(Duration::ZERO);
        }
        let mut candidate = self.fd_timeout_wheel.time_until_next_expiration().unwrap_or(Duration::from_millis(self.fd_timeout_wheel.slot_ms()));
        if let Some(entry) = self.timer_heap.peek() {
            let until = entry.deadline.saturating_duration_since(Instant::now());
            candidate = candidate.min(until);
        }
        if let Some(deadline) = *self.graceful_deadline.lock().unwrap() {
            let until = deadline.saturating_duration_since(Instant::now());
            candidate = candidate.min(until);
        }
        Some(candidate)
    }

    /// Runs until [`Self::stop`]/[`ReactorHandle::stop`] is called, or a
    /// graceful-shutdown deadline elapses. Returns an error only on a fatal
    /// multiplexer failure.
    pub fn run(&mut self) -> KatanaResult<()> {
        if self.running.swap(true, AtomicOrdering::Relaxed) {
            return Err(ReactorError::AlreadyRunning);
        }

        while self.running.load(AtomicOrdering::Relaxed) {
            self.drain_due_fd_timeouts();
            self.merge_pending_timers();
            self.fire_due_timers();
            self.drain_pending_tasks();

            if self.graceful_shutdown.load(AtomicOrdering::Relaxed) {
                if self.fd_states.is_empty() {
                    break;
                }
                let past_deadline = self
                    .graceful_deadline
                    .lock()
                    .unwrap()
                    .is_some_and(|deadline| Instant::now() >= deadline);
                if past_deadline {
                    self.force_close_all_remaining();
                    break;
                }
            }

            let timeout = self.calculate_timeout();
            let completions = self.multiplexer.poll(timeout)?;
            for (fd, event) in completions {
                let Some(state) = self.fd_states.get_mut(&fd) else { continue };
                let result = catch_unwind(AssertUnwindSafe(|| (state.callback)(event)));
                match result {
                    Ok(()) => {
                        self.metrics.fd_events_processed.fetch_add(1, AtomicOrdering::Relaxed);
                        if let Some(id) = state.timeout_id {
                            let cfg = state.timeout.expect("timeout_id implies timeout config");
                            self.fd_timeout_wheel.cancel(id);
                            let new_id = self.fd_timeout_wheel.add(cfg.effective_ms(state.events), fd);
                            if let Some(s) = self.fd_states.get_mut(&fd) {
                                s.timeout_id = Some(new_id);
                            }
                        }
                    }
                    Err(payload) => self.handle_panic("fd_callback", Some(fd), payload),
                }
            }
        }

        self.running.store(false, AtomicOrdering::Relaxed);
        Ok(())
    }
}
