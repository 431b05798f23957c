// Copyright (c) 2025 Katana contributors. Licensed under Apache License, Version 2.0.

//! Typed errors for the parser and router, kept separate from
//! `katana-core`'s `ReactorError` (§4.5/§4.6 each report "a generic
//! protocol-level failure", but a caller composing results still benefits
//! from matching on the precise variant, as the original's single
//! `error_code::invalid_fd` sentinel does not).

/// A parse failure. The parser itself collapses every violation to one
/// generic outcome at the wire level (§4.5: "reports a generic
/// protocol-level failure on any violation; it never throws"), but each
/// variant records which check failed for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParserError {
    #[error("request line, header block, or aggregate buffer exceeds configured limits")]
    BufferOverflow,
    #[error("invalid byte in request line or header block")]
    InvalidByte,
    #[error("unsupported or malformed HTTP method")]
    InvalidMethod,
    #[error("URI exceeds the configured maximum length or contains a disallowed byte")]
    InvalidUri,
    #[error("HTTP version is not exactly \"HTTP/1.1\"")]
    InvalidVersion,
    #[error("header line is missing a ':' separator or has an empty name")]
    MalformedHeaderLine,
    #[error("header name contains a non-token character")]
    InvalidHeaderName,
    #[error("header value contains a disallowed control byte")]
    InvalidHeaderValue,
    #[error("obsolete line folding continuation with no preceding header")]
    DanglingContinuation,
    #[error("Content-Length is not a valid decimal or exceeds the configured maximum body size")]
    InvalidContentLength,
    #[error("chunk size line is not valid hexadecimal or exceeds the configured maximum body size")]
    InvalidChunkSize,
    #[error("chunk data is not terminated by CRLF at the expected offset")]
    MalformedChunkTerminator,
    #[error("header count exceeds the configured maximum")]
    TooManyHeaders,
}

/// Errors from building the compile-time-equivalent route table (§4.6,
/// §9: "patterns are fully validated at construction, not at runtime").
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteBuildError {
    #[error("route path must not be empty")]
    EmptyPath,
    #[error("route path must start with '/'")]
    MissingLeadingSlash,
    #[error("route path contains an empty segment")]
    EmptySegment,
    #[error("parameter segment is malformed: {0}")]
    MalformedParameter(&'static str),
    #[error("route path exceeds the maximum of {max} segments")]
    TooManySegments { max: usize },
    #[error("route path exceeds the maximum of {max} parameters")]
    TooManyParams { max: usize },
}
