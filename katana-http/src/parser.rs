// Copyright (c) 2025 Katana contributors. Licensed under Apache License, Version 2.0.

//! Strict byte-exact HTTP/1.1 parser (§4.5): request-line → headers →
//! body|chunked → complete, a direct port of the original's
//! `parser::parse`/`parse_request_line_state`/`parse_headers_state`/
//! `parse_body_state`/`parse_chunk_size_state`/`parse_chunk_data_state`/
//! `parse_chunk_trailer_state` state machine from `http.cpp`.
//!
//! The parser never throws; every violation collapses to a [`ParserError`]
//! and the caller is expected to close the connection (§4.5: "a strict
//! parser; a client that sends something ambiguous gets disconnected, not
//! guessed at").

use crate::error::ParserError;
use crate::headers::HeaderMap;
use crate::request::{Method, Request};

/// Lookup table for RFC 7230 `token` characters, ported byte-for-byte from
/// `http.cpp`'s `TOKEN_CHARS`.
const TOKEN_CHARS: [bool; 256] = build_token_chars();

const fn build_token_chars() -> [bool; 256] {
    let mut table = [false; 256];
    let mut i = 0;
    while i < 256 {
        let c = i as u8;
        let is_token = c.is_ascii_alphanumeric()
            || matches!(
                c,
                b'!' | b'#'
                    | b'$'
                    | b'%'
                    | b'&'
                    | b'\''
                    | b'*'
                    | b'+'
                    | b'-'
                    | b'.'
                    | b'^'
                    | b'_'
                    | b'`'
                    | b'|'
                    | b'~'
            );
        table[i] = is_token;
        i += 1;
    }
    table
}

fn is_token_char(c: u8) -> bool {
    TOKEN_CHARS[c as usize]
}

fn is_ctl(c: u8) -> bool {
    c < 0x20 || c == 0x7f
}

fn trim_ows(value: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = value.len();
    while start < end && (value[start] == b' ' || value[start] == b'\t') {
        start += 1;
    }
    while end > start && (value[end - 1] == b' ' || value[end - 1] == b'\t') {
        end -= 1;
    }
    &value[start..end]
}

fn contains_invalid_header_value(value: &[u8]) -> bool {
    value.iter().any(|&c| (c < 0x20 && c != b'\t') || c >= 0x7f)
}

fn contains_invalid_uri_char(uri: &[u8]) -> bool {
    uri.iter().any(|&c| c == b' ' || c == b'\r' || c == b'\n' || is_ctl(c) || c >= 0x80)
}

fn find_crlf(haystack: &[u8]) -> Option<usize> {
    if haystack.len() < 2 {
        return None;
    }
    haystack.windows(2).position(|w| w == b"\r\n")
}

/// Hard limits enforced by the parser (§4.5). Defaults match the spec's
/// stated ceilings; `compact_threshold` is not named by the spec at all —
/// the original's `COMPACT_THRESHOLD` is defined in a header this exercise's
/// reference material does not include, so this port picks a value equal
/// to the default header-size ceiling (documented in DESIGN.md).
#[derive(Debug, Clone, Copy)]
pub struct ParserConfig {
    pub max_uri_length: usize,
    pub max_header_count: usize,
    pub max_header_size: usize,
    pub max_body_size: usize,
    pub compact_threshold: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_uri_length: 8 * 1024,
            max_header_count: 100,
            max_header_size: 8 * 1024,
            max_body_size: 10 * 1024 * 1024,
            compact_threshold: 8 * 1024,
        }
    }
}

impl ParserConfig {
    fn max_buffer_size(&self) -> usize {
        self.max_header_size + self.max_body_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    RequestLine,
    Headers,
    Body,
    ChunkSize,
    ChunkData,
    ChunkTrailer,
    Complete,
}

/// Incremental HTTP/1.1 request parser. One instance is owned per
/// connection; bytes arrive via repeated [`Self::feed`] calls (any framing
/// the transport happens to deliver — the parser places no requirement on
/// chunk boundaries, per §4.5's segmentation-invariance property), and a
/// fully parsed request is taken out with [`Self::take_request`], which
/// also resets per-request state so the same parser keeps working on the
/// next pipelined request sharing this connection (§4.5, §7 scenario 4).
#[derive(Debug)]
pub struct RequestParser {
    config: ParserConfig,
    buffer: Vec<u8>,
    parse_pos: usize,
    state: ParserState,
    method: Option<Method>,
    uri: String,
    version: &'static str,
    headers: HeaderMap,
    last_header_name: String,
    header_count: usize,
    content_length: usize,
    is_chunked: bool,
    current_chunk_size: usize,
    chunked_body: Vec<u8>,
    body: Vec<u8>,
}

impl RequestParser {
    pub fn new(config: ParserConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            parse_pos: 0,
            state: ParserState::RequestLine,
            method: None,
            uri: String::new(),
            version: "",
            headers: HeaderMap::new(),
            last_header_name: String::new(),
            header_count: 0,
            content_length: 0,
            is_chunked: false,
            current_chunk_size: 0,
            chunked_body: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Feeds newly received bytes and advances the state machine as far as
    /// the buffered data allows. Returns the resulting state; a caller sees
    /// `Ok(ParserState::Complete)` exactly when [`Self::take_request`] is
    /// ready to be called, and any other `Ok` state means "need more bytes".
    pub fn feed(&mut self, data: &[u8]) -> Result<ParserState, ParserError> {
        let max_safe_size = self.config.max_buffer_size();
        if data.len() > max_safe_size || self.buffer.len() > max_safe_size - data.len() {
            return Err(ParserError::BufferOverflow);
        }

        if matches!(self.state, ParserState::RequestLine | ParserState::Headers) {
            for (i, &byte) in data.iter().enumerate() {
                if byte == 0 || byte >= 0x80 {
                    return Err(ParserError::InvalidByte);
                }
                if byte == b'\n' {
                    let buf_pos = self.buffer.len() + i;
                    let prev = if buf_pos == 0 {
                        None
                    } else if buf_pos - 1 < self.buffer.len() {
                        Some(self.buffer[buf_pos - 1])
                    } else {
                        Some(data[i - 1])
                    };
                    if prev != Some(b'\r') {
                        return Err(ParserError::InvalidByte);
                    }
                }
            }
        }

        self.buffer.extend_from_slice(data);

        if !matches!(self.state, ParserState::Body | ParserState::ChunkData) {
            if self.buffer.len() > self.config.max_header_size {
                let header_end = find_double_crlf(&self.buffer);
                match header_end {
                    Some(pos) if pos + 4 <= self.config.max_header_size => {}
                    _ => return Err(ParserError::BufferOverflow),
                }
            }

            let mut crlf_pairs = 0usize;
            for i in 0..self.buffer.len().saturating_sub(1) {
                if self.buffer[i] == b'\r' && self.buffer[i + 1] == b'\n' {
                    crlf_pairs += 1;
                }
            }
            if crlf_pairs > self.config.max_header_count + 2 {
                return Err(ParserError::TooManyHeaders);
            }
        } else if self.buffer.len() > self.config.max_header_size + self.config.max_body_size {
            return Err(ParserError::BufferOverflow);
        }

        while self.state != ParserState::Complete {
            let old_parse_pos = self.parse_pos;
            let next_state = match self.state {
                ParserState::RequestLine => self.parse_request_line_state()?,
                ParserState::Headers => self.parse_headers_state()?,
                ParserState::Body => self.parse_body_state(),
                ParserState::ChunkSize => self.parse_chunk_size_state()?,
                ParserState::ChunkData => self.parse_chunk_data_state()?,
                ParserState::ChunkTrailer => self.parse_chunk_trailer_state(),
                ParserState::Complete => self.state,
            };
            self.state = next_state;

            if self.parse_pos == old_parse_pos && self.state != ParserState::Complete {
                self.maybe_compact();
                return Ok(self.state);
            }
        }

        self.maybe_compact();
        Ok(self.state)
    }

    fn parse_request_line_state(&mut self) -> Result<ParserState, ParserError> {
        let Some(pos) = self.find_line_end()? else {
            return Ok(ParserState::RequestLine);
        };

        let line = self.buffer[self.parse_pos..pos].to_vec();
        self.parse_pos = pos + 2;
        self.process_request_line(&line)?;
        Ok(ParserState::Headers)
    }

    fn parse_headers_state(&mut self) -> Result<ParserState, ParserError> {
        let Some(pos) = self.find_line_end()? else {
            return Ok(ParserState::Headers);
        };

        let line = self.buffer[self.parse_pos..pos].to_vec();
        self.parse_pos = pos + 2;

        if line.is_empty() {
            if let Some(te) = self.headers.get("Transfer-Encoding") {
                if te.eq_ignore_ascii_case("chunked") {
                    self.is_chunked = true;
                    return Ok(ParserState::ChunkSize);
                }
            }

            if let Some(cl) = self.headers.get("Content-Length") {
                let trimmed = cl.trim_end_matches([' ', '\t']);
                let val: u64 =
                    trimmed.parse().map_err(|_| ParserError::InvalidContentLength)?;
                if val > self.config.max_body_size as u64 {
                    return Err(ParserError::InvalidContentLength);
                }
                self.content_length = val as usize;
                return Ok(ParserState::Body);
            }

            return Ok(ParserState::Complete);
        }

        if line[0] == b' ' || line[0] == b'\t' {
            if self.last_header_name.is_empty() {
                return Err(ParserError::DanglingContinuation);
            }
            let current_value =
                self.headers.get(&self.last_header_name).ok_or(ParserError::DanglingContinuation)?.to_string();
            let folded = trim_ows(&line);
            if contains_invalid_header_value(folded) {
                return Err(ParserError::InvalidHeaderValue);
            }
            let folded_str = std::str::from_utf8(folded).map_err(|_| ParserError::InvalidHeaderValue)?;
            let mut new_value = String::with_capacity(current_value.len() + 1 + folded_str.len());
            new_value.push_str(&current_value);
            new_value.push(' ');
            new_value.push_str(folded_str);
            self.headers.replace_last(&self.last_header_name, new_value);
        } else {
            self.process_header_line(&line)?;
        }

        Ok(ParserState::Headers)
    }

    fn parse_body_state(&mut self) -> ParserState {
        let remaining = self.buffer.len() - self.parse_pos;
        if remaining >= self.content_length {
            self.body = self.buffer[self.parse_pos..self.parse_pos + self.content_length].to_vec();
            self.parse_pos += self.content_length;
            ParserState::Complete
        } else {
            ParserState::Body
        }
    }

    fn parse_chunk_size_state(&mut self) -> Result<ParserState, ParserError> {
        let Some(pos) = self.find_line_end_raw() else {
            return Ok(ParserState::ChunkSize);
        };

        let mut chunk_line = &self.buffer[self.parse_pos..pos];
        self.parse_pos = pos + 2;

        if let Some(semicolon) = chunk_line.iter().position(|&b| b == b';') {
            chunk_line = &chunk_line[..semicolon];
        }
        chunk_line = trim_ows(chunk_line);

        let text = std::str::from_utf8(chunk_line).map_err(|_| ParserError::InvalidChunkSize)?;
        let chunk_val = u64::from_str_radix(text, 16).map_err(|_| ParserError::InvalidChunkSize)?;
        if chunk_val > self.config.max_body_size as u64 {
            return Err(ParserError::InvalidChunkSize);
        }
        self.current_chunk_size = chunk_val as usize;

        if self.current_chunk_size == 0 {
            return Ok(ParserState::ChunkTrailer);
        }

        if self.current_chunk_size > self.config.max_body_size
            || self.chunked_body.len() > self.config.max_body_size - self.current_chunk_size
        {
            return Err(ParserError::InvalidChunkSize);
        }

        Ok(ParserState::ChunkData)
    }

    fn parse_chunk_data_state(&mut self) -> Result<ParserState, ParserError> {
        let remaining = self.buffer.len() - self.parse_pos;
        if remaining >= self.current_chunk_size + 2 {
            let start = self.parse_pos;
            let term = &self.buffer[start + self.current_chunk_size..start + self.current_chunk_size + 2];
            if term != b"\r\n" {
                return Err(ParserError::MalformedChunkTerminator);
            }
            self.chunked_body.extend_from_slice(&self.buffer[start..start + self.current_chunk_size]);
            self.parse_pos += self.current_chunk_size + 2;
            Ok(ParserState::ChunkSize)
        } else {
            Ok(ParserState::ChunkData)
        }
    }

    fn parse_chunk_trailer_state(&mut self) -> ParserState {
        let Some(pos) = self.find_line_end_raw() else {
            return ParserState::ChunkTrailer;
        };
        self.parse_pos = pos + 2;
        self.body = std::mem::take(&mut self.chunked_body);
        ParserState::Complete
    }

    fn process_request_line(&mut self, line: &[u8]) -> Result<(), ParserError> {
        if line.is_empty() || line[0] == b' ' || line[0] == b'\t' || *line.last().unwrap() == b' '
            || *line.last().unwrap() == b'\t'
        {
            return Err(ParserError::InvalidMethod);
        }

        let method_end = line.iter().position(|&b| b == b' ').ok_or(ParserError::InvalidMethod)?;
        let method_str = std::str::from_utf8(&line[..method_end]).map_err(|_| ParserError::InvalidMethod)?;
        self.method = Some(Method::parse(method_str).ok_or(ParserError::InvalidMethod)?);

        let uri_start = method_end + 1;
        let uri_end = line[uri_start..].iter().position(|&b| b == b' ').map(|p| uri_start + p)
            .ok_or(ParserError::InvalidUri)?;
        let uri = &line[uri_start..uri_end];
        if uri.len() > self.config.max_uri_length || contains_invalid_uri_char(uri) {
            return Err(ParserError::InvalidUri);
        }
        self.uri = std::str::from_utf8(uri).map_err(|_| ParserError::InvalidUri)?.to_string();

        let version = &line[uri_end + 1..];
        if version != b"HTTP/1.1" {
            return Err(ParserError::InvalidVersion);
        }
        self.version = "HTTP/1.1";

        Ok(())
    }

    fn process_header_line(&mut self, line: &[u8]) -> Result<(), ParserError> {
        if self.header_count >= self.config.max_header_count {
            return Err(ParserError::TooManyHeaders);
        }

        let colon = line.iter().position(|&b| b == b':').ok_or(ParserError::MalformedHeaderLine)?;
        let name = &line[..colon];
        let value = trim_ows(&line[colon + 1..]);

        if name.is_empty() {
            return Err(ParserError::MalformedHeaderLine);
        }
        if !name.iter().all(|&c| is_token_char(c)) {
            return Err(ParserError::InvalidHeaderName);
        }
        if contains_invalid_header_value(value) {
            return Err(ParserError::InvalidHeaderValue);
        }

        let name_str = std::str::from_utf8(name).map_err(|_| ParserError::InvalidHeaderName)?.to_string();
        let value_str = std::str::from_utf8(value).map_err(|_| ParserError::InvalidHeaderValue)?.to_string();

        self.last_header_name = name_str.clone();
        self.headers.append(name_str, value_str);
        self.header_count += 1;
        Ok(())
    }

    /// Finds the next CRLF-terminated line starting at `parse_pos`,
    /// validating every byte up to and including it the way the request-line
    /// and header states do (request lines and headers share the same
    /// per-byte validation; chunk framing lines do not, see
    /// [`Self::find_line_end_raw`]).
    fn find_line_end(&self) -> Result<Option<usize>, ParserError> {
        let Some(offset) = find_crlf(&self.buffer[self.parse_pos..]) else {
            return Ok(None);
        };
        let pos = self.parse_pos + offset;
        for i in self.parse_pos..=pos {
            let c = self.buffer[i];
            if c == 0 || c >= 0x80 {
                return Err(ParserError::InvalidByte);
            }
            if c == b'\n' && (i == 0 || self.buffer[i - 1] != b'\r') {
                return Err(ParserError::InvalidByte);
            }
        }
        Ok(Some(pos))
    }

    fn find_line_end_raw(&self) -> Option<usize> {
        find_crlf(&self.buffer[self.parse_pos..]).map(|offset| self.parse_pos + offset)
    }

    fn maybe_compact(&mut self) {
        if self.parse_pos > self.config.compact_threshold || self.buffer.len() > self.config.max_header_size * 2 {
            self.compact_buffer();
        }
    }

    fn compact_buffer(&mut self) {
        if self.parse_pos >= self.buffer.len() {
            self.buffer.clear();
            self.parse_pos = 0;
        } else if self.parse_pos > self.config.compact_threshold / 2 {
            self.buffer.drain(..self.parse_pos);
            self.parse_pos = 0;
            if self.buffer.capacity() > self.buffer.len() * 2 && self.buffer.capacity() > 8192 {
                self.buffer.shrink_to_fit();
            }
        }
    }

    /// Consumes the request built by a completed parse and resets per-request
    /// state so the same connection can keep being parsed for the next
    /// pipelined request, without losing any bytes already buffered past the
    /// consumed request. Panics if called before `feed` returns
    /// `ParserState::Complete` — a programmer error, not a protocol one.
    pub fn take_request(&mut self) -> Request {
        assert_eq!(self.state, ParserState::Complete, "take_request called before parse completed");

        let request = Request {
            method: self.method.take().expect("method set by a completed parse"),
            uri: std::mem::take(&mut self.uri),
            version: self.version,
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body),
        };

        self.last_header_name.clear();
        self.header_count = 0;
        self.content_length = 0;
        self.is_chunked = false;
        self.current_chunk_size = 0;
        self.chunked_body.clear();
        self.state = ParserState::RequestLine;

        request
    }
}

fn find_double_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(parser: &mut RequestParser, data: &[u8]) -> ParserState {
        parser.feed(data).unwrap()
    }

    #[test]
    fn parses_simple_get_request_in_one_feed() {
        let mut parser = RequestParser::new(ParserConfig::default());
        let state = parse_all(&mut parser, b"GET /hello HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(state, ParserState::Complete);
        let req = parser.take_request();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.uri, "/hello");
        assert_eq!(req.header("Host"), Some("example.com"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn parsing_is_segmentation_invariant() {
        let whole = b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let mut one_shot = RequestParser::new(ParserConfig::default());
        one_shot.feed(whole).unwrap();
        let expected = one_shot.take_request();

        let mut byte_at_a_time = RequestParser::new(ParserConfig::default());
        let mut last_state = ParserState::RequestLine;
        for byte in whole {
            last_state = byte_at_a_time.feed(std::slice::from_ref(byte)).unwrap();
        }
        assert_eq!(last_state, ParserState::Complete);
        let actual = byte_at_a_time.take_request();
        assert_eq!(actual, expected);
    }

    #[test]
    fn content_length_body_is_read_exactly() {
        let mut parser = RequestParser::new(ParserConfig::default());
        let state = parse_all(
            &mut parser,
            b"POST /items HTTP/1.1\r\nHost: h\r\nContent-Length: 11\r\n\r\nhello world",
        );
        assert_eq!(state, ParserState::Complete);
        let req = parser.take_request();
        assert_eq!(req.body, b"hello world");
    }

    #[test]
    fn chunked_body_is_decoded_across_chunks() {
        let mut parser = RequestParser::new(ParserConfig::default());
        let state = parse_all(
            &mut parser,
            b"POST /up HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        );
        assert_eq!(state, ParserState::Complete);
        let req = parser.take_request();
        assert_eq!(req.body, b"hello world");
    }

    #[test]
    fn pipelined_requests_share_one_parser() {
        let mut parser = RequestParser::new(ParserConfig::default());
        let both = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n";
        assert_eq!(parser.feed(both).unwrap(), ParserState::Complete);
        let first = parser.take_request();
        assert_eq!(first.uri, "/a");

        assert_eq!(parser.state(), ParserState::RequestLine);
        assert_eq!(parser.feed(b"").unwrap(), ParserState::Complete);
        let second = parser.take_request();
        assert_eq!(second.uri, "/b");
    }

    #[test]
    fn byte_outside_allowed_set_is_rejected() {
        let mut parser = RequestParser::new(ParserConfig::default());
        let err = parser.feed(b"GET /\x01 HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err, ParserError::InvalidByte);
    }

    #[test]
    fn unknown_method_is_rejected() {
        let mut parser = RequestParser::new(ParserConfig::default());
        let err = parser.feed(b"FROB / HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err, ParserError::InvalidMethod);
    }

    #[test]
    fn non_http_1_1_version_is_rejected() {
        let mut parser = RequestParser::new(ParserConfig::default());
        let err = parser.feed(b"GET / HTTP/1.0\r\n\r\n").unwrap_err();
        assert_eq!(err, ParserError::InvalidVersion);
    }

    #[test]
    fn obsolete_line_folding_extends_previous_header_value() {
        let mut parser = RequestParser::new(ParserConfig::default());
        let state = parse_all(&mut parser, b"GET / HTTP/1.1\r\nX-Long: first\r\n continued\r\n\r\n");
        assert_eq!(state, ParserState::Complete);
        let req = parser.take_request();
        assert_eq!(req.header("X-Long"), Some("first continued"));
    }

    #[test]
    fn dangling_continuation_with_no_preceding_header_is_rejected() {
        let mut parser = RequestParser::new(ParserConfig::default());
        let err = parser.feed(b"GET / HTTP/1.1\r\n continued\r\n\r\n").unwrap_err();
        assert_eq!(err, ParserError::DanglingContinuation);
    }

    #[test]
    fn uri_over_max_length_is_rejected() {
        let config = ParserConfig { max_uri_length: 8, ..Default::default() };
        let mut parser = RequestParser::new(config);
        let err = parser.feed(b"GET /this-uri-is-too-long HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err, ParserError::InvalidUri);
    }

    #[test]
    fn too_many_headers_is_rejected() {
        let config = ParserConfig { max_header_count: 2, ..Default::default() };
        let mut parser = RequestParser::new(config);
        let err = parser
            .feed(b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n")
            .unwrap_err();
        assert_eq!(err, ParserError::TooManyHeaders);
    }

    #[test]
    fn content_length_over_max_body_size_is_rejected() {
        let config = ParserConfig { max_body_size: 4, ..Default::default() };
        let mut parser = RequestParser::new(config);
        let err = parser
            .feed(b"POST / HTTP/1.1\r\nContent-Length: 1000\r\n\r\n")
            .unwrap_err();
        assert_eq!(err, ParserError::InvalidContentLength);
    }

    #[test]
    fn incomplete_request_keeps_returning_non_complete_state() {
        let mut parser = RequestParser::new(ParserConfig::default());
        let state = parser.feed(b"GET / HTTP/1.1\r\nHost: h\r\n").unwrap();
        assert_eq!(state, ParserState::Headers);
    }
}
