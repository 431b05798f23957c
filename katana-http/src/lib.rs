// Copyright (c) 2025 Katana contributors. Licensed under Apache License, Version 2.0.

//! HTTP/1.1 wire format and routing on top of `katana-core`'s reactor and
//! arena: a strict request parser, a header multimap, a response builder
//! with RFC 7807 problem+json bodies, and a startup-validated route table
//! with middleware dispatch.
//!
//! Nothing in here touches sockets or the event loop directly — a caller
//! feeds bytes read off a `katana-core` reactor's fd into [`parser::RequestParser`]
//! and hands the resulting [`request::Request`] to a [`router::Router`].

pub mod error;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod router;

pub use error::{ParserError, RouteBuildError};
pub use headers::HeaderMap;
pub use parser::{ParserConfig, ParserState, RequestParser};
pub use request::{Method, Request};
pub use response::{ProblemDetails, Response, DEFAULT_CHUNK_SIZE};
pub use router::{
    DispatchOutcome, HandlerFn, HandlerResult, MiddlewareChain, MiddlewareFn, NextFn, PathParams,
    RequestContext, RoutePattern, Router, RouterBuilder, RouterError, SegmentKind,
};
