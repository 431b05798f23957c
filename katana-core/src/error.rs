// Copyright (c) 2025 Katana contributors. Licensed under Apache License, Version 2.0.

//! Typed error model for the reactor core, mirroring the granularity of the
//! original `result.hpp`'s `error_code` enum rather than collapsing everything
//! into one opaque string.

use std::io;

/// Errors the reactor itself can produce.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("failed to create the readiness multiplexer: {0}")]
    MultiplexerCreateFailed(#[source] io::Error),

    #[error("multiplexer registration failed for fd {fd}: {source}")]
    MultiplexerCtlFailed { fd: i32, #[source] source: io::Error },

    #[error("multiplexer wait failed: {0}")]
    MultiplexerWaitFailed(#[source] io::Error),

    #[error("fd {0} is invalid (negative)")]
    InvalidFd(i32),

    #[error("fd {0} is already registered")]
    AlreadyRegistered(i32),

    #[error("fd {0} is not registered")]
    NotRegistered(i32),

    #[error("reactor has been stopped")]
    Stopped,

    #[error("reactor is already running")]
    AlreadyRunning,

    #[error("operation timed out")]
    Timeout,
}

/// Errors the bounded queues can produce.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is empty")]
    Empty,
    #[error("queue is closed")]
    Closed,
}

/// Errors the HTTP parser can produce. Lives here (rather than in
/// `katana-http`) only if shared with the arena; the parser's own crate
/// defines `ParserError` — this alias exists so reactor-level code that
/// funnels exceptions can speak of "a protocol error" generically.
pub type KatanaResult<T> = Result<T, ReactorError>;

/// The context funneled to an installed exception handler when a user
/// callback unwinds inside the reactor. Mirrors `reactor.hpp`'s
/// `exception_context`.
#[derive(Debug)]
pub struct ExceptionContext {
    /// A short static description of where the panic was caught, e.g.
    /// `"fd callback"`, `"task"`, `"timer"`.
    pub location: &'static str,
    /// The payload carried by the unwind, downcast to a displayable message
    /// where possible.
    pub message: String,
    /// The fd associated with the callback, if any.
    pub fd: Option<i32>,
}

/// Sink for panics caught at the reactor boundary. Boxed so a reactor can be
/// constructed without a generic parameter for this callback.
pub type ExceptionHandler = Box<dyn Fn(&ExceptionContext) + Send>;

/// Default handler: mirrors the original's default, which prints location
/// and exception to stderr. Here it goes through `tracing::error!` instead,
/// consistent with the rest of this crate never writing directly to stderr.
pub fn default_exception_handler() -> ExceptionHandler {
    Box::new(|ctx: &ExceptionContext| {
        tracing::error!(
            location = ctx.location,
            fd = ?ctx.fd,
            message = %ctx.message,
            "unhandled panic caught at reactor boundary"
        );
    })
}
