// Copyright (c) 2025 Katana contributors. Licensed under Apache License, Version 2.0.

//! Outbound response, wire serialization (§6), and RFC 7807 problem+json
//! bodies — a direct port of `response::serialize`/`serialize_chunked`/
//! `response::error` from the original `http.cpp`.

use serde::Serialize;

/// Default chunk size for [`Response::serialize_chunked`] (§6: "Chunk size
/// is configurable (default 8 KiB)").
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub chunked: bool,
}

impl Response {
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn ok(body: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        let body = body.into();
        let mut res = Self { status: 200, reason: "OK".to_string(), ..Default::default() };
        res.set_header("Content-Length", body.len().to_string());
        res.set_header("Content-Type", content_type.into());
        res.body = body;
        res
    }

    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        Self::ok(body, "application/json")
    }

    pub fn error(problem: &ProblemDetails) -> Self {
        let body = problem.to_json();
        let mut res = Self { status: problem.status, reason: problem.title.clone(), ..Default::default() };
        res.set_header("Content-Length", body.len().to_string());
        res.set_header("Content-Type", "application/problem+json");
        res.body = body;
        res
    }

    /// Serializes per §6's outbound wire contract. Dispatches to
    /// [`Self::serialize_chunked`] when `self.chunked` is set.
    pub fn serialize(&self) -> Vec<u8> {
        if self.chunked {
            return self.serialize_chunked(DEFAULT_CHUNK_SIZE);
        }

        let headers_size: usize = self.headers.iter().map(|(n, v)| n.len() + 2 + v.len() + 2).sum();
        let mut out = Vec::with_capacity(32 + self.reason.len() + headers_size + self.body.len());

        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// Serializes with `Transfer-Encoding: chunked`, omitting any
    /// `Content-Length` header and framing the body into
    /// `chunk_size`-byte (or smaller, for the last chunk) hex-length chunks
    /// terminated by `0\r\n\r\n`.
    pub fn serialize_chunked(&self, chunk_size: usize) -> Vec<u8> {
        let chunk_size = chunk_size.max(1);
        let headers_size: usize = self
            .headers
            .iter()
            .filter(|(n, _)| !n.eq_ignore_ascii_case("Content-Length"))
            .map(|(n, v)| n.len() + 2 + v.len() + 2)
            .sum();
        let mut out = Vec::with_capacity(64 + self.reason.len() + headers_size + self.body.len() + 32);

        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"Transfer-Encoding: chunked\r\n\r\n");

        for chunk in self.body.chunks(chunk_size) {
            out.extend_from_slice(format!("{:x}", chunk.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(chunk);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"0\r\n\r\n");
        out
    }
}

/// RFC 7807 problem+json body (§6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
}

impl ProblemDetails {
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("ProblemDetails is always representable as JSON")
    }

    pub fn not_found() -> Self {
        Self {
            problem_type: "about:blank".to_string(),
            title: "Not Found".to_string(),
            status: 404,
            detail: "The requested resource was not found.".to_string(),
        }
    }

    pub fn method_not_allowed() -> Self {
        Self {
            problem_type: "about:blank".to_string(),
            title: "Method Not Allowed".to_string(),
            status: 405,
            detail: "The requested method is not allowed for this resource.".to_string(),
        }
    }

    pub fn internal_server_error() -> Self {
        Self {
            problem_type: "about:blank".to_string(),
            title: "Internal Server Error".to_string(),
            status: 500,
            detail: "An unexpected error occurred while handling the request.".to_string(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            problem_type: "about:blank".to_string(),
            title: "Bad Request".to_string(),
            status: 400,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_produces_status_line_headers_and_body() {
        let res = Response::ok(b"hi".to_vec(), "text/plain");
        let wire = res.serialize();
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn serialize_chunked_omits_content_length_and_frames_body() {
        let mut res = Response::ok(b"hello world".to_vec(), "text/plain");
        res.chunked = true;
        let wire = res.serialize_chunked(5);
        let text = String::from_utf8(wire).unwrap();
        assert!(!text.contains("Content-Length"));
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.contains("5\r\nhello\r\n"));
        assert!(text.contains("6\r\n world\r\n"));
        assert!(text.ends_with("0\r\n\r\n"));
    }

    #[test]
    fn problem_details_serializes_rfc7807_fields() {
        let problem = ProblemDetails::not_found();
        let json = String::from_utf8(problem.to_json()).unwrap();
        assert!(json.contains("\"status\":404"));
        assert!(json.contains("\"title\":\"Not Found\""));
    }

    #[test]
    fn error_response_sets_problem_json_content_type() {
        let res = Response::error(&ProblemDetails::method_not_allowed());
        assert_eq!(res.status, 405);
        assert!(res.headers.iter().any(|(n, v)| n == "Content-Type" && v == "application/problem+json"));
    }
}
