// Copyright (c) 2025 Katana contributors. Licensed under Apache License, Version 2.0.

//! Route table, path-pattern matching, and middleware dispatch (§4.6), a
//! port of `path_pattern`/`path_params`/`router`/`middleware_chain` from the
//! original `router.hpp`.
//!
//! The original builds every [`RoutePattern`] at compile time via a C++
//! `consteval` constructor, so a malformed route pattern is a build error.
//! Rust has no equivalent of `consteval` for this kind of string parsing, so
//! [`RoutePattern::parse`] runs at router-construction time instead and
//! [`RouterBuilder::route`] surfaces its [`RouteBuildError`] to the caller —
//! a route table is still fully validated before the first request is ever
//! dispatched, just one phase later than in the original.

use std::sync::Arc;

use katana_core::MonotonicArena;
use smallvec::SmallVec;

use crate::error::RouteBuildError;
use crate::request::{Method, Request};
use crate::response::{ProblemDetails, Response};

pub const MAX_ROUTE_SEGMENTS: usize = 16;
pub const MAX_PATH_PARAMS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Literal,
    Parameter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    pub kind: SegmentKind,
    pub value: String,
}

/// Bounded, stack-allocated `(name, value)` pairs captured from a matched
/// route's `{param}` segments — `smallvec` instead of `Vec` because the
/// count is capped at [`MAX_PATH_PARAMS`] and every dispatch allocates one
/// of these, just like the original's fixed `std::array`-backed
/// `path_params`.
#[derive(Debug, Clone, Default)]
pub struct PathParams {
    entries: SmallVec<[(String, String); MAX_PATH_PARAMS]>,
}

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, name: &str, value: &str) {
        if self.entries.len() < MAX_PATH_PARAMS {
            self.entries.push((name.to_string(), value.to_string()));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Per-dispatch state handed to handlers and middleware: the request-scoped
/// arena (§4.4) and whatever path parameters this route matched.
#[allow(missing_debug_implementations)]
pub struct RequestContext<'a> {
    pub arena: &'a MonotonicArena,
    pub params: PathParams,
}

impl<'a> RequestContext<'a> {
    pub fn new(arena: &'a MonotonicArena) -> Self {
        Self { arena, params: PathParams::new() }
    }
}

/// A parsed and validated `/users/{id}` style route path.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    segments: SmallVec<[PathSegment; MAX_ROUTE_SEGMENTS]>,
    param_names: SmallVec<[String; MAX_PATH_PARAMS]>,
    param_count: usize,
    literal_count: usize,
}

impl RoutePattern {
    /// Parses and validates a route path, matching the original's
    /// `path_pattern::from_literal` checks exactly (leading `/`, no empty
    /// segments, `{name}` parameters with a non-empty name, segment/param
    /// count ceilings).
    pub fn parse(path: &str) -> Result<Self, RouteBuildError> {
        if path.is_empty() {
            return Err(RouteBuildError::EmptyPath);
        }
        if !path.starts_with('/') {
            return Err(RouteBuildError::MissingLeadingSlash);
        }

        let mut segments = SmallVec::new();
        let mut param_names = SmallVec::new();
        let mut literal_count = 0usize;

        for raw_segment in path[1..].split('/') {
            if raw_segment.is_empty() {
                return Err(RouteBuildError::EmptySegment);
            }
            if segments.len() >= MAX_ROUTE_SEGMENTS {
                return Err(RouteBuildError::TooManySegments { max: MAX_ROUTE_SEGMENTS });
            }

            if let Some(stripped) = raw_segment.strip_prefix('{') {
                if !stripped.ends_with('}') {
                    return Err(RouteBuildError::MalformedParameter("missing closing '}'"));
                }
                let name = &stripped[..stripped.len() - 1];
                if name.is_empty() {
                    return Err(RouteBuildError::MalformedParameter("empty parameter name"));
                }
                if param_names.len() >= MAX_PATH_PARAMS {
                    return Err(RouteBuildError::TooManyParams { max: MAX_PATH_PARAMS });
                }
                param_names.push(name.to_string());
                segments.push(PathSegment { kind: SegmentKind::Parameter, value: name.to_string() });
            } else {
                segments.push(PathSegment { kind: SegmentKind::Literal, value: raw_segment.to_string() });
                literal_count += 1;
            }
        }

        let param_count = param_names.len();
        Ok(Self { segments, param_names, param_count, literal_count })
    }

    fn split_path(path: &str) -> Option<SmallVec<[&str; MAX_ROUTE_SEGMENTS]>> {
        let mut parts: SmallVec<[&str; MAX_ROUTE_SEGMENTS]> = SmallVec::new();
        for part in path.split('/') {
            if part.is_empty() {
                continue;
            }
            if parts.len() >= MAX_ROUTE_SEGMENTS {
                return None;
            }
            parts.push(part);
        }
        Some(parts)
    }

    fn match_segments(&self, parts: &[&str]) -> Option<PathParams> {
        if self.segments.is_empty() && parts.is_empty() {
            return Some(PathParams::new());
        }
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = PathParams::new();
        let mut param_index = 0;
        for (segment, actual) in self.segments.iter().zip(parts) {
            match segment.kind {
                SegmentKind::Literal => {
                    if segment.value != *actual {
                        return None;
                    }
                }
                SegmentKind::Parameter => {
                    if actual.is_empty() {
                        return None;
                    }
                    params.add(&self.param_names[param_index], actual);
                    param_index += 1;
                }
            }
        }
        Some(params)
    }

    /// Specificity tie-break: more literal segments beats fewer, and among
    /// equal literal counts, fewer parameters beats more — an exact literal
    /// match always outranks a route with a `{param}` in the same position.
    fn specificity_score(&self) -> i64 {
        (self.literal_count * 16 + (MAX_ROUTE_SEGMENTS - self.param_count)) as i64
    }
}

/// Outcome of running a handler or middleware: either a response, or a
/// failure the caller surfaces to the client as a 500 (§4.6's
/// `map_dispatch_error` default branch).
pub type HandlerResult = Result<Response, String>;

pub type HandlerFn = Arc<dyn Fn(&Request, &mut RequestContext) -> HandlerResult + Send + Sync>;

/// The remaining link in a middleware chain. Unlike the original's
/// reference-capturing `function_ref`, this takes `req`/`ctx` as explicit
/// arguments rather than closing over them — Rust's borrow checker won't
/// let a boxed continuation alias the same `&mut RequestContext` a
/// currently-running middleware still holds, so the continuation is handed
/// the references back instead of capturing them.
pub type NextFn<'a> = Box<dyn FnOnce(&Request, &mut RequestContext) -> HandlerResult + 'a>;

pub type MiddlewareFn = Arc<dyn Fn(&Request, &mut RequestContext, NextFn) -> HandlerResult + Send + Sync>;

/// An ordered sequence of middleware wrapping a terminal handler, run via
/// continuation passing exactly like the original's `middleware_chain::run`.
#[derive(Clone, Default)]
#[allow(missing_debug_implementations)]
pub struct MiddlewareChain {
    middlewares: Vec<MiddlewareFn>,
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<MiddlewareFn>) -> Self {
        Self { middlewares }
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn run(&self, req: &Request, ctx: &mut RequestContext, handler: &HandlerFn) -> HandlerResult {
        Self::call(&self.middlewares, 0, req, ctx, handler)
    }

    fn call(
        middlewares: &[MiddlewareFn],
        index: usize,
        req: &Request,
        ctx: &mut RequestContext,
        handler: &HandlerFn,
    ) -> HandlerResult {
        let Some(mw) = middlewares.get(index) else {
            return handler(req, ctx);
        };
        let handler = handler.clone();
        let rest = middlewares.to_vec();
        let next: NextFn = Box::new(move |req, ctx| Self::call(&rest, index + 1, req, ctx, &handler));
        mw(req, ctx, next)
    }
}

#[allow(missing_debug_implementations)]
pub struct RouteEntry {
    method: Method,
    pattern: RoutePattern,
    handler: HandlerFn,
    middleware: MiddlewareChain,
}

/// Bitmask over [`Method::CANONICAL_ORDER`], used to accumulate which
/// methods matched a path so a 405 response can report them in its `Allow`
/// header (§4.6 step 4). The original computes this bit from the method
/// enum's own ordinal; this port keys it off `CANONICAL_ORDER` instead,
/// since that ordering is this port's only canonical one.
fn method_bit(method: Method) -> u32 {
    let index = Method::CANONICAL_ORDER.iter().position(|&m| m == method).expect("every Method is in CANONICAL_ORDER");
    1 << index
}

fn allow_header_from_mask(mask: u32) -> String {
    let mut allow = String::new();
    for &method in &Method::CANONICAL_ORDER {
        if mask & method_bit(method) == 0 {
            continue;
        }
        if !allow.is_empty() {
            allow.push_str(", ");
        }
        allow.push_str(method.as_str());
    }
    allow
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterError {
    NotFound,
    MethodNotAllowed,
    /// The matched handler or a middleware in its chain returned an error
    /// (§4.6's `map_dispatch_error` default branch, mapped to a 500).
    Internal,
}

#[derive(Debug)]
pub struct DispatchOutcome {
    pub result: Result<Response, RouterError>,
    pub path_matched: bool,
    pub allowed_methods_mask: u32,
}

fn strip_query(uri: &str) -> &str {
    let cut = uri.find('?').or_else(|| uri.find('#'));
    match cut {
        Some(pos) => &uri[..pos],
        None => uri,
    }
}

/// The route table itself. Built once via [`RouterBuilder`] and shared
/// (immutably) across every reactor thread — §5's "N reactors pinned
/// one-per-core" model needs every reactor dispatching against the same
/// table without locking, which an `Arc<Router>` gives for free since
/// nothing here is mutated after `build()`.
#[allow(missing_debug_implementations)]
pub struct Router {
    routes: Vec<RouteEntry>,
}

impl Router {
    /// Finds the best-matching route, running its middleware chain and
    /// handler, while also reporting whether the path matched at all and
    /// (for a 405) the mask of methods that did match it.
    pub fn dispatch_with_info(&self, req: &Request, ctx: &mut RequestContext) -> DispatchOutcome {
        let path = strip_query(&req.uri);
        let Some(path_segments) = RoutePattern::split_path(path) else {
            return DispatchOutcome { result: Err(RouterError::NotFound), path_matched: false, allowed_methods_mask: 0 };
        };

        let mut best_index: Option<usize> = None;
        let mut best_params = PathParams::new();
        let mut best_score = -1i64;
        let mut path_matched = false;
        let mut allowed_methods_mask = 0u32;

        for (index, entry) in self.routes.iter().enumerate() {
            let Some(candidate_params) = entry.pattern.match_segments(&path_segments) else {
                continue;
            };

            path_matched = true;
            allowed_methods_mask |= method_bit(entry.method);
            if entry.method != req.method {
                continue;
            }

            let score = entry.pattern.specificity_score();
            if best_index.is_none() || score > best_score {
                best_index = Some(index);
                best_score = score;
                best_params = candidate_params;
            }
        }

        let Some(best_index) = best_index else {
            return if path_matched {
                DispatchOutcome { result: Err(RouterError::MethodNotAllowed), path_matched: true, allowed_methods_mask }
            } else {
                DispatchOutcome { result: Err(RouterError::NotFound), path_matched: false, allowed_methods_mask: 0 }
            };
        };

        ctx.params = best_params;
        let entry = &self.routes[best_index];
        let result = entry.middleware.run(req, ctx, &entry.handler).map_err(|_| RouterError::Internal);
        DispatchOutcome { result, path_matched: true, allowed_methods_mask }
    }

    /// Dispatches and always returns a response: routing failures and
    /// handler failures both become RFC 7807 problem+json bodies, matching
    /// the original's `dispatch_or_problem`/`map_dispatch_error`.
    pub fn dispatch(&self, req: &Request, ctx: &mut RequestContext) -> Response {
        map_dispatch_error(self.dispatch_with_info(req, ctx))
    }
}

fn map_dispatch_error(outcome: DispatchOutcome) -> Response {
    match outcome.result {
        Ok(response) => response,
        Err(RouterError::NotFound) => Response::error(&ProblemDetails::not_found()),
        Err(RouterError::MethodNotAllowed) => {
            let mut res = Response::error(&ProblemDetails::method_not_allowed());
            let allow = allow_header_from_mask(outcome.allowed_methods_mask);
            if !allow.is_empty() {
                res.set_header("Allow", allow);
            }
            res
        }
        Err(RouterError::Internal) => Response::error(&ProblemDetails::internal_server_error()),
    }
}

/// Builds a [`Router`], validating every route's path pattern as it is
/// added (§4.6, §9: route patterns are "fully validated at construction,
/// not at runtime").
#[derive(Default)]
#[allow(missing_debug_implementations)]
pub struct RouterBuilder {
    routes: Vec<RouteEntry>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(
        mut self,
        method: Method,
        path: &str,
        handler: HandlerFn,
    ) -> Result<Self, RouteBuildError> {
        let pattern = RoutePattern::parse(path)?;
        self.routes.push(RouteEntry { method, pattern, handler, middleware: MiddlewareChain::default() });
        Ok(self)
    }

    pub fn route_with_middleware(
        mut self,
        method: Method,
        path: &str,
        handler: HandlerFn,
        middleware: MiddlewareChain,
    ) -> Result<Self, RouteBuildError> {
        let pattern = RoutePattern::parse(path)?;
        self.routes.push(RouteEntry { method, pattern, handler, middleware });
        Ok(self)
    }

    pub fn build(self) -> Router {
        Router { routes: self.routes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_handler() -> HandlerFn {
        Arc::new(|_req, _ctx| Ok(Response::ok(b"ok".to_vec(), "text/plain")))
    }

    fn arena() -> MonotonicArena {
        MonotonicArena::new()
    }

    #[test]
    fn exact_literal_route_matches() {
        let router = RouterBuilder::new().route(Method::Get, "/health", ok_handler()).unwrap().build();
        let arena = arena();
        let mut ctx = RequestContext::new(&arena);
        let req = Request {
            method: Method::Get,
            uri: "/health".to_string(),
            version: "HTTP/1.1",
            headers: crate::headers::HeaderMap::new(),
            body: Vec::new(),
        };
        let outcome = router.dispatch_with_info(&req, &mut ctx);
        assert!(outcome.result.is_ok());
        assert!(outcome.path_matched);
    }

    #[test]
    fn literal_route_outranks_parameter_route_at_same_position() {
        let router = RouterBuilder::new()
            .route(Method::Get, "/users/{id}", ok_handler())
            .unwrap()
            .route(Method::Get, "/users/me", ok_handler())
            .unwrap()
            .build();
        let arena = arena();
        let mut ctx = RequestContext::new(&arena);
        let req = Request {
            method: Method::Get,
            uri: "/users/me".to_string(),
            version: "HTTP/1.1",
            headers: crate::headers::HeaderMap::new(),
            body: Vec::new(),
        };
        router.dispatch_with_info(&req, &mut ctx);
        assert!(ctx.params.is_empty(), "the literal /users/me route should win, leaving no {{id}} param");
    }

    #[test]
    fn path_param_is_captured() {
        let router = RouterBuilder::new().route(Method::Get, "/users/{id}", ok_handler()).unwrap().build();
        let arena = arena();
        let mut ctx = RequestContext::new(&arena);
        let req = Request {
            method: Method::Get,
            uri: "/users/42".to_string(),
            version: "HTTP/1.1",
            headers: crate::headers::HeaderMap::new(),
            body: Vec::new(),
        };
        router.dispatch_with_info(&req, &mut ctx);
        assert_eq!(ctx.params.get("id"), Some("42"));
    }

    #[test]
    fn unmatched_path_is_not_found() {
        let router = RouterBuilder::new().route(Method::Get, "/health", ok_handler()).unwrap().build();
        let arena = arena();
        let mut ctx = RequestContext::new(&arena);
        let req = Request {
            method: Method::Get,
            uri: "/nope".to_string(),
            version: "HTTP/1.1",
            headers: crate::headers::HeaderMap::new(),
            body: Vec::new(),
        };
        let response = router.dispatch(&req, &mut ctx);
        assert_eq!(response.status, 404);
    }

    #[test]
    fn wrong_method_on_matched_path_is_method_not_allowed_with_non_empty_allow() {
        let router = RouterBuilder::new().route(Method::Get, "/widgets", ok_handler()).unwrap().build();
        let arena = arena();
        let mut ctx = RequestContext::new(&arena);
        let req = Request {
            method: Method::Post,
            uri: "/widgets".to_string(),
            version: "HTTP/1.1",
            headers: crate::headers::HeaderMap::new(),
            body: Vec::new(),
        };
        let response = router.dispatch(&req, &mut ctx);
        assert_eq!(response.status, 405);
        let allow = response.headers.iter().find(|(n, _)| n == "Allow").map(|(_, v)| v.clone());
        assert_eq!(allow, Some("GET".to_string()));
    }

    #[test]
    fn query_string_is_stripped_before_matching() {
        let router = RouterBuilder::new().route(Method::Get, "/search", ok_handler()).unwrap().build();
        let arena = arena();
        let mut ctx = RequestContext::new(&arena);
        let req = Request {
            method: Method::Get,
            uri: "/search?q=rust".to_string(),
            version: "HTTP/1.1",
            headers: crate::headers::HeaderMap::new(),
            body: Vec::new(),
        };
        let response = router.dispatch(&req, &mut ctx);
        assert_eq!(response.status, 200);
    }

    #[test]
    fn middleware_chain_runs_in_order_and_can_short_circuit() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order_a = order.clone();
        let order_b = order.clone();
        let mw_a: MiddlewareFn = Arc::new(move |req, ctx, next| {
            order_a.lock().unwrap().push("a");
            next(req, ctx)
        });
        let mw_b: MiddlewareFn = Arc::new(move |req, ctx, next| {
            order_b.lock().unwrap().push("b");
            next(req, ctx)
        });
        let chain = MiddlewareChain::new(vec![mw_a, mw_b]);
        let handler = ok_handler();
        let arena = arena();
        let mut ctx = RequestContext::new(&arena);
        let req = Request {
            method: Method::Get,
            uri: "/x".to_string(),
            version: "HTTP/1.1",
            headers: crate::headers::HeaderMap::new(),
            body: Vec::new(),
        };
        let result = chain.run(&req, &mut ctx, &handler);
        assert!(result.is_ok());
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn empty_path_is_rejected_at_build_time() {
        let err = RoutePattern::parse("").unwrap_err();
        assert_eq!(err, RouteBuildError::EmptyPath);
    }

    #[test]
    fn missing_leading_slash_is_rejected_at_build_time() {
        let err = RoutePattern::parse("users").unwrap_err();
        assert_eq!(err, RouteBuildError::MissingLeadingSlash);
    }

    #[test]
    fn empty_parameter_name_is_rejected_at_build_time() {
        let err = RoutePattern::parse("/users/{}").unwrap_err();
        assert_eq!(err, RouteBuildError::MalformedParameter("empty parameter name"));
    }
}
