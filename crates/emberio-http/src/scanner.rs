//! Streaming HTTP/1.x request tokenizer.
//!
//! The scanner consumes raw bytes in whatever slices the transport hands it
//! and reports tokens through the [`ScanSink`] callback table. Tokens that
//! span feed boundaries are delivered as multiple segments; joining them is
//! the sink's job. Obs-folded header values are delivered with each folded
//! segment's leading whitespace intact and the CRLF dropped.
//!
//! `scan` returns the count of bytes consumed. A short count means the
//! scanner paused at a message boundary; parse failures and sink aborts
//! come back as [`ScanError`].
//!
//! Framing (Content-Length vs chunked) is tracked by the scanner itself so
//! the sink never has to second-guess where a body ends. Chunk boundaries,
//! terminator included, are reported through `on_chunk_header`.

use std::fmt;

const MAX_METHOD: usize = 24;
const MAX_VERSION: usize = 10;
const MAX_CAPTURE_FIELD: usize = 32;
const MAX_CAPTURE_VALUE: usize = 256;
const MAX_CHUNK_SIZE: u64 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanError {
    BadRequestLine,
    BadVersion,
    BadHeader,
    BadChunk,
    BodyTooLarge,
    /// A new message began while the previous exchange was still active.
    Pipelined,
    /// Sink-driven abort; carries the collaborator's result code.
    Aborted(i32),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::BadRequestLine => write!(f, "malformed request line"),
            ScanError::BadVersion => write!(f, "unsupported HTTP version"),
            ScanError::BadHeader => write!(f, "malformed header"),
            ScanError::BadChunk => write!(f, "malformed chunk framing"),
            ScanError::BodyTooLarge => write!(f, "body exceeds configured maximum"),
            ScanError::Pipelined => write!(f, "pipelined request overlap"),
            ScanError::Aborted(rc) => write!(f, "aborted by sink (rc={})", rc),
        }
    }
}

impl std::error::Error for ScanError {}

pub type ScanResult = std::result::Result<(), ScanError>;

/// Request-line and framing summary, handed to `on_headers_complete`.
#[derive(Debug, Clone)]
pub struct ScanHead {
    pub method: String,
    pub major: u8,
    pub minor: u8,
    /// Connection header if present, else the version default.
    pub keep_alive: bool,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

/// Callback table the scanner drives. Byte-carrying callbacks may fire
/// multiple times per token; an `Err` return aborts the scan.
pub trait ScanSink {
    fn on_message_begin(&mut self) -> ScanResult;
    fn on_path(&mut self, bytes: &[u8]) -> ScanResult;
    fn on_header_field(&mut self, bytes: &[u8]) -> ScanResult;
    fn on_header_value(&mut self, bytes: &[u8]) -> ScanResult;
    fn on_headers_complete(&mut self, head: &ScanHead) -> ScanResult;
    fn on_body(&mut self, bytes: &[u8]) -> ScanResult;
    fn on_chunk_header(&mut self, size: u64) -> ScanResult;
    fn on_chunk_complete(&mut self) -> ScanResult;
    fn on_message_complete(&mut self) -> ScanResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Method,
    Path,
    VersionTail,
    ReqLineLf,
    HeaderStart,
    HeaderField,
    HeaderColonSp,
    HeaderValue,
    HeaderLineLf,
    HeadersEndLf,
    Body,
    ChunkSize,
    ChunkExt,
    ChunkSizeLf,
    ChunkData,
    ChunkDataCr,
    ChunkDataLf,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    None,
    ContentLength,
    TransferEncoding,
    Connection,
}

pub struct Scanner {
    state: State,
    method: Vec<u8>,
    version_buf: Vec<u8>,
    major: u8,
    minor: u8,
    /// Lowercased current field name, for framing-header capture only.
    field_lc: Vec<u8>,
    field_overflow: bool,
    capture: Capture,
    cap_value: Vec<u8>,
    content_length: Option<u64>,
    chunked: bool,
    keep_alive_override: Option<bool>,
    /// Body or chunk-data bytes still expected.
    remaining: u64,
    chunk_size: u64,
    chunk_digits: bool,
    in_trailers: bool,
    value_pending: bool,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            state: State::Start,
            method: Vec::new(),
            version_buf: Vec::new(),
            major: 0,
            minor: 0,
            field_lc: Vec::new(),
            field_overflow: false,
            capture: Capture::None,
            cap_value: Vec::new(),
            content_length: None,
            chunked: false,
            keep_alive_override: None,
            remaining: 0,
            chunk_size: 0,
            chunk_digits: false,
            in_trailers: false,
            value_pending: false,
        }
    }

    /// Ready the scanner for the next message on the same connection.
    pub fn reset(&mut self) {
        let mut fresh = Self::new();
        std::mem::swap(self, &mut fresh);
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// True once the request line has been consumed.
    pub fn message_started(&self) -> bool {
        !matches!(self.state, State::Start)
    }

    /// Feed bytes, driving the sink. Returns bytes consumed; short when the
    /// scanner paused at message end. Calling in `Done` consumes nothing —
    /// the caller resets (keep-alive) or treats leftover input as overlap.
    pub fn scan(&mut self, sink: &mut dyn ScanSink, data: &[u8]) -> Result<usize, ScanError> {
        let mut i = 0;
        while i < data.len() {
            match self.state {
                State::Done => return Ok(i),

                State::Start => {
                    // tolerate stray CRLF between messages
                    if data[i] == b'\r' || data[i] == b'\n' {
                        i += 1;
                        continue;
                    }
                    sink.on_message_begin()?;
                    self.state = State::Method;
                }

                State::Method => {
                    let b = data[i];
                    if b == b' ' {
                        if self.method.is_empty() {
                            return Err(ScanError::BadRequestLine);
                        }
                        self.state = State::Path;
                        i += 1;
                    } else if is_token_byte(b) {
                        if self.method.len() >= MAX_METHOD {
                            return Err(ScanError::BadRequestLine);
                        }
                        self.method.push(b);
                        i += 1;
                    } else {
                        return Err(ScanError::BadRequestLine);
                    }
                }

                State::Path => {
                    let start = i;
                    while i < data.len() && data[i] != b' ' && data[i] != b'\r' && data[i] != b'\n'
                    {
                        i += 1;
                    }
                    if i > start {
                        sink.on_path(&data[start..i])?;
                    }
                    if i < data.len() {
                        if data[i] != b' ' {
                            return Err(ScanError::BadRequestLine);
                        }
                        self.state = State::VersionTail;
                        i += 1;
                    }
                }

                State::VersionTail => {
                    let b = data[i];
                    if b == b'\r' {
                        self.parse_version()?;
                        self.state = State::ReqLineLf;
                    } else {
                        if self.version_buf.len() >= MAX_VERSION {
                            return Err(ScanError::BadRequestLine);
                        }
                        self.version_buf.push(b);
                    }
                    i += 1;
                }

                State::ReqLineLf => {
                    if data[i] != b'\n' {
                        return Err(ScanError::BadRequestLine);
                    }
                    self.state = State::HeaderStart;
                    i += 1;
                }

                State::HeaderStart => {
                    let b = data[i];
                    if b == b'\r' {
                        self.state = State::HeadersEndLf;
                        i += 1;
                    } else if b == b' ' || b == b'\t' {
                        // obs-fold: continuation of the previous value with
                        // its leading whitespace kept
                        if !self.value_pending {
                            return Err(ScanError::BadHeader);
                        }
                        self.state = State::HeaderValue;
                    } else {
                        self.finish_captured_header()?;
                        self.field_lc.clear();
                        self.field_overflow = false;
                        self.value_pending = false;
                        self.state = State::HeaderField;
                    }
                }

                State::HeaderField => {
                    let start = i;
                    while i < data.len() && is_token_byte(data[i]) {
                        i += 1;
                    }
                    if i > start {
                        sink.on_header_field(&data[start..i])?;
                        for &b in &data[start..i] {
                            if self.field_lc.len() < MAX_CAPTURE_FIELD {
                                self.field_lc.push(b.to_ascii_lowercase());
                            } else {
                                self.field_overflow = true;
                            }
                        }
                    }
                    if i < data.len() {
                        if data[i] != b':' || (i == start && self.field_lc.is_empty()) {
                            return Err(ScanError::BadHeader);
                        }
                        self.capture = self.classify_field();
                        self.cap_value.clear();
                        self.state = State::HeaderColonSp;
                        i += 1;
                    }
                }

                State::HeaderColonSp => {
                    let b = data[i];
                    if b == b' ' || b == b'\t' {
                        i += 1;
                    } else if b == b'\r' {
                        // empty value
                        self.value_pending = true;
                        self.state = State::HeaderLineLf;
                        i += 1;
                    } else {
                        self.state = State::HeaderValue;
                    }
                }

                State::HeaderValue => {
                    let start = i;
                    while i < data.len() && data[i] != b'\r' && data[i] != b'\n' {
                        i += 1;
                    }
                    if i > start {
                        sink.on_header_value(&data[start..i])?;
                        if self.capture != Capture::None
                            && self.cap_value.len() < MAX_CAPTURE_VALUE
                        {
                            let room = MAX_CAPTURE_VALUE - self.cap_value.len();
                            let take = (i - start).min(room);
                            self.cap_value.extend_from_slice(&data[start..start + take]);
                        }
                    }
                    if i < data.len() {
                        if data[i] != b'\r' {
                            return Err(ScanError::BadHeader);
                        }
                        self.value_pending = true;
                        self.state = State::HeaderLineLf;
                        i += 1;
                    }
                }

                State::HeaderLineLf => {
                    if data[i] != b'\n' {
                        return Err(ScanError::BadHeader);
                    }
                    self.state = State::HeaderStart;
                    i += 1;
                }

                State::HeadersEndLf => {
                    if data[i] != b'\n' {
                        return Err(ScanError::BadHeader);
                    }
                    i += 1;
                    self.finish_captured_header()?;
                    if self.in_trailers {
                        sink.on_chunk_complete()?;
                        sink.on_message_complete()?;
                        self.state = State::Done;
                        return Ok(i);
                    }
                    let head = self.head();
                    sink.on_headers_complete(&head)?;
                    if self.chunked {
                        self.chunk_size = 0;
                        self.chunk_digits = false;
                        self.state = State::ChunkSize;
                    } else {
                        match self.content_length {
                            Some(n) if n > 0 => {
                                self.remaining = n;
                                self.state = State::Body;
                            }
                            _ => {
                                sink.on_message_complete()?;
                                self.state = State::Done;
                                return Ok(i);
                            }
                        }
                    }
                }

                State::Body => {
                    let avail = (data.len() - i) as u64;
                    let take = self.remaining.min(avail) as usize;
                    sink.on_body(&data[i..i + take])?;
                    self.remaining -= take as u64;
                    i += take;
                    if self.remaining == 0 {
                        sink.on_message_complete()?;
                        self.state = State::Done;
                        return Ok(i);
                    }
                }

                State::ChunkSize => {
                    let b = data[i];
                    if let Some(d) = hex_digit(b) {
                        self.chunk_size = self
                            .chunk_size
                            .checked_mul(16)
                            .and_then(|v| v.checked_add(d as u64))
                            .filter(|&v| v <= MAX_CHUNK_SIZE)
                            .ok_or(ScanError::BadChunk)?;
                        self.chunk_digits = true;
                        i += 1;
                    } else if b == b';' {
                        if !self.chunk_digits {
                            return Err(ScanError::BadChunk);
                        }
                        self.state = State::ChunkExt;
                        i += 1;
                    } else if b == b'\r' {
                        if !self.chunk_digits {
                            return Err(ScanError::BadChunk);
                        }
                        self.state = State::ChunkSizeLf;
                        i += 1;
                    } else {
                        return Err(ScanError::BadChunk);
                    }
                }

                State::ChunkExt => {
                    if data[i] == b'\r' {
                        self.state = State::ChunkSizeLf;
                    }
                    i += 1;
                }

                State::ChunkSizeLf => {
                    if data[i] != b'\n' {
                        return Err(ScanError::BadChunk);
                    }
                    i += 1;
                    sink.on_chunk_header(self.chunk_size)?;
                    if self.chunk_size == 0 {
                        self.in_trailers = true;
                        self.state = State::HeaderStart;
                    } else {
                        self.remaining = self.chunk_size;
                        self.state = State::ChunkData;
                    }
                }

                State::ChunkData => {
                    let avail = (data.len() - i) as u64;
                    let take = self.remaining.min(avail) as usize;
                    sink.on_body(&data[i..i + take])?;
                    self.remaining -= take as u64;
                    i += take;
                    if self.remaining == 0 {
                        self.state = State::ChunkDataCr;
                    }
                }

                State::ChunkDataCr => {
                    if data[i] != b'\r' {
                        return Err(ScanError::BadChunk);
                    }
                    self.state = State::ChunkDataLf;
                    i += 1;
                }

                State::ChunkDataLf => {
                    if data[i] != b'\n' {
                        return Err(ScanError::BadChunk);
                    }
                    sink.on_chunk_complete()?;
                    self.chunk_size = 0;
                    self.chunk_digits = false;
                    self.state = State::ChunkSize;
                    i += 1;
                }
            }
        }
        Ok(i)
    }

    fn head(&self) -> ScanHead {
        let keep_alive = self
            .keep_alive_override
            .unwrap_or(self.major == 1 && self.minor >= 1);
        ScanHead {
            method: String::from_utf8_lossy(&self.method).into_owned(),
            major: self.major,
            minor: self.minor,
            keep_alive,
            content_length: self.content_length,
            chunked: self.chunked,
        }
    }

    fn parse_version(&mut self) -> ScanResult {
        let v = self.version_buf.as_slice();
        if v.len() != 8 || &v[..5] != b"HTTP/" || v[6] != b'.' {
            return Err(ScanError::BadVersion);
        }
        let major = v[5].wrapping_sub(b'0');
        let minor = v[7].wrapping_sub(b'0');
        if major != 1 || minor > 1 {
            return Err(ScanError::BadVersion);
        }
        self.major = major;
        self.minor = minor;
        Ok(())
    }

    fn classify_field(&self) -> Capture {
        if self.field_overflow {
            return Capture::None;
        }
        match self.field_lc.as_slice() {
            b"content-length" => Capture::ContentLength,
            b"transfer-encoding" => Capture::TransferEncoding,
            b"connection" => Capture::Connection,
            _ => Capture::None,
        }
    }

    /// Runs when a header line (plus any folds) has fully ended.
    fn finish_captured_header(&mut self) -> ScanResult {
        let capture = self.capture;
        self.capture = Capture::None;
        if !self.value_pending {
            return Ok(());
        }
        self.value_pending = false;
        match capture {
            Capture::None => Ok(()),
            Capture::ContentLength => {
                let s = trim_ows(&self.cap_value);
                let parsed: u64 = std::str::from_utf8(s)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(ScanError::BadHeader)?;
                match self.content_length {
                    Some(prev) if prev != parsed => Err(ScanError::BadHeader),
                    _ => {
                        self.content_length = Some(parsed);
                        Ok(())
                    }
                }
            }
            Capture::TransferEncoding => {
                if contains_token(&self.cap_value, b"chunked") {
                    self.chunked = true;
                }
                Ok(())
            }
            Capture::Connection => {
                if contains_token(&self.cap_value, b"close") {
                    self.keep_alive_override = Some(false);
                } else if contains_token(&self.cap_value, b"keep-alive") {
                    self.keep_alive_override = Some(true);
                }
                Ok(())
            }
        }
    }
}

#[inline]
fn is_token_byte(b: u8) -> bool {
    matches!(b,
        b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9'
        | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-'
        | b'.' | b'^' | b'_' | b'`' | b'|' | b'~')
}

#[inline]
fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn trim_ows(v: &[u8]) -> &[u8] {
    let start = v.iter().position(|&b| b != b' ' && b != b'\t').unwrap_or(v.len());
    let end = v.iter().rposition(|&b| b != b' ' && b != b'\t').map_or(start, |p| p + 1);
    &v[start..end]
}

/// Case-insensitive comma-list membership.
fn contains_token(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|part| trim_ows(part).eq_ignore_ascii_case(token))
}
