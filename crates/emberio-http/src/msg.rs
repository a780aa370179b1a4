//! One request/response exchange.
//!
//! An `HttpMsg` accumulates the parsed request (method, target, headers,
//! bounded body) and serializes the response into an outbound byte cache.
//! Header names keep their wire case and order; obs-folded values arrive
//! already joined by the scanner.

use emberio_core::cache::ByteCache;

/// Parse/emit state of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Station {
    Init,
    Path,
    Head,
    Body,
    BodyDone,
    Error,
    Close,
}

pub struct HttpMsg {
    station: Station,
    method: String,
    target: String,
    version: (u8, u8),
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    max_body: usize,
    keep_alive: bool,
    status: u16,
    out: ByteCache,
    resp_sent: bool,
    chunked_out: bool,
}

impl HttpMsg {
    pub fn new(max_body: usize) -> Self {
        Self {
            station: Station::Init,
            method: String::new(),
            target: String::new(),
            version: (1, 1),
            headers: Vec::new(),
            body: Vec::new(),
            max_body,
            keep_alive: true,
            status: 0,
            out: ByteCache::new(),
            resp_sent: false,
            chunked_out: false,
        }
    }

    // ---- parsed request ---------------------------------------------------

    #[inline]
    pub fn station(&self) -> Station {
        self.station
    }

    pub fn set_station(&mut self, s: Station) {
        self.station = s;
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn set_method(&mut self, m: &str) {
        self.method = m.to_owned();
    }

    /// Request target as received, query and fragment included.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn push_target(&mut self, bytes: &[u8]) {
        self.target.push_str(&String::from_utf8_lossy(bytes));
    }

    /// Path component of the target, query/fragment stripped.
    pub fn path(&self) -> &str {
        let end = self
            .target
            .find(|c| c == '?' || c == '#')
            .unwrap_or(self.target.len());
        &self.target[..end]
    }

    pub fn version(&self) -> (u8, u8) {
        self.version
    }

    pub fn set_version(&mut self, major: u8, minor: u8) {
        self.version = (major, minor);
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Begin a new header pair; subsequent `append_*` calls extend it.
    pub fn open_header(&mut self) {
        self.headers.push((String::new(), String::new()));
    }

    pub fn append_header_field(&mut self, bytes: &[u8]) {
        if let Some((f, _)) = self.headers.last_mut() {
            f.push_str(&String::from_utf8_lossy(bytes));
        }
    }

    pub fn append_header_value(&mut self, bytes: &[u8]) {
        if let Some((_, v)) = self.headers.last_mut() {
            v.push_str(&String::from_utf8_lossy(bytes));
        }
    }

    /// Case-insensitive header lookup, first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(f, _)| f.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// False when the configured cap would be exceeded; the caller turns
    /// that into a parse error.
    #[must_use]
    pub fn append_body(&mut self, bytes: &[u8]) -> bool {
        if self.body.len() + bytes.len() > self.max_body {
            return false;
        }
        self.body.extend_from_slice(bytes);
        true
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, ka: bool) {
        self.keep_alive = ka;
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    // ---- response emission ------------------------------------------------

    pub fn resp_sent(&self) -> bool {
        self.resp_sent
    }

    pub fn mark_resp_sent(&mut self) {
        self.resp_sent = true;
    }

    /// `HTTP/1.1 <code> <reason>\r\n`
    pub fn write_status(&mut self, code: u16, reason: &str) {
        self.status = code;
        let (maj, min) = self.version;
        self.out
            .write(format!("HTTP/{}.{} {} {}\r\n", maj, min, code, reason).as_bytes());
    }

    pub fn write_head(&mut self, name: &str, value: &str) {
        self.out.write(name.as_bytes());
        self.out.write(b": ");
        self.out.write(value.as_bytes());
        self.out.write(b"\r\n");
    }

    /// Finish the head with a `Content-Length` and append the body.
    pub fn write_body(&mut self, body: &[u8]) {
        self.write_head("Content-Length", &body.len().to_string());
        self.out.write(b"\r\n");
        self.out.write(body);
    }

    /// Finish the head for a chunked body; follow with `write_chunk` calls
    /// and one `end_chunks`.
    pub fn begin_chunked(&mut self) {
        self.write_head("Transfer-Encoding", "chunked");
        self.out.write(b"\r\n");
        self.chunked_out = true;
    }

    pub fn write_chunk(&mut self, data: &[u8]) {
        self.out.write(format!("{:x}\r\n", data.len()).as_bytes());
        self.out.write(data);
        self.out.write(b"\r\n");
    }

    /// Zero-length terminator plus optional trailer headers.
    pub fn end_chunks(&mut self, trailers: &[(&str, &str)]) {
        self.out.write(b"0\r\n");
        for (name, value) in trailers {
            self.out.write(name.as_bytes());
            self.out.write(b": ");
            self.out.write(value.as_bytes());
            self.out.write(b"\r\n");
        }
        self.out.write(b"\r\n");
        self.chunked_out = false;
    }

    /// Client-side request line, for loopback exercises and tests.
    pub fn write_request(&mut self, method: &str, target: &str) {
        let (maj, min) = self.version;
        self.out
            .write(format!("{} {} HTTP/{}.{}\r\n", method, target, maj, min).as_bytes());
    }

    pub fn write_get(&mut self, target: &str) {
        self.write_request("GET", target);
    }

    /// End the head with no body (requests without payload).
    pub fn end_head(&mut self) {
        self.out.write(b"\r\n");
    }

    pub fn output_len(&self) -> usize {
        self.out.size()
    }

    /// Drain everything serialized so far.
    pub fn take_output(&mut self) -> Vec<u8> {
        let bytes = self.out.peek_head().to_vec();
        let n = bytes.len();
        self.out.commit_head(n);
        bytes
    }
}

/// MIME type from a path's extension, `application/octet-stream` otherwise.
pub fn mime_of(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}
