// Copyright (c) 2025 Katana contributors. Licensed under Apache License, Version 2.0.

//! Per-core event reactor and its supporting concurrency primitives: a
//! hashed-wheel timer, a lock-free MPMC ring-buffer queue with an
//! opportunistic SPSC fast path, an unbounded MPSC linked queue, a
//! per-request bump arena, and the reactor itself.
//!
//! `katana-http` builds the HTTP/1.1 parser and router on top of this
//! crate's [`arena::MonotonicArena`] and [`reactor`] types; nothing in here
//! knows about HTTP.

pub mod arena;
pub mod error;
pub mod fd_event;
pub mod mpsc_queue;
pub mod multiplexer;
pub mod reactor;
pub mod reactor_pool;
pub mod ring_buffer_queue;
pub mod task;
pub mod wheel_timer;

pub use arena::MonotonicArena;
pub use error::{ExceptionContext, ExceptionHandler, KatanaResult, QueueError, ReactorError};
pub use fd_event::{EventCallback, EventType};
pub use reactor::{EventReactor, FdTimeoutConfig, ReactorConfig, ReactorHandle, ReactorMetricsSnapshot};
pub use reactor_pool::{ReactorPool, ReactorPoolConfig};
pub use task::Task;
pub use wheel_timer::{TimeoutId, WheelTimer};
