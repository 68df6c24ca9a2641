/// Minimal multipart codec for the replication protocol.
///
/// Covers the subset CouchDB emits and accepts: `multipart/mixed` responses
/// from `open_revs` (whose parts may themselves be `multipart/related`) and
/// `multipart/related` document PUTs with attachment bodies. Boundaries are
/// plain tokens or quoted strings; header names are matched
/// case-insensitively.
use satchel_core::error::{Result, SatchelError};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Part {
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Part {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }
}

/// Extract the boundary parameter from a Content-Type header value.
pub fn boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        Some(value.trim().trim_matches('"').to_string())
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Split a multipart body into its parts.
pub fn split(body: &[u8], boundary: &str) -> Result<Vec<Part>> {
    let delim = format!("--{boundary}");
    let delim = delim.as_bytes();

    let mut starts = Vec::new();
    let mut pos = 0;
    while let Some(at) = find(body, delim, pos) {
        // a real delimiter sits at the start of a line
        if at == 0 || body.get(at - 1) == Some(&b'\n') {
            starts.push(at);
        }
        pos = at + delim.len();
    }
    if starts.is_empty() {
        return Err(SatchelError::Protocol("multipart boundary not found".into()));
    }

    let mut parts = Vec::new();
    for window in starts.windows(2) {
        let after_delim = window[0] + delim.len();
        let raw = &body[after_delim..window[1]];
        // the closing delimiter of this part owns the preceding CRLF
        let raw = raw.strip_suffix(b"\r\n").unwrap_or(raw);
        // skip the CRLF that terminates the delimiter line
        let raw = raw
            .strip_prefix(b"\r\n")
            .or_else(|| raw.strip_prefix(b"\n"))
            .unwrap_or(raw);
        parts.push(parse_part(raw)?);
    }
    Ok(parts)
}

fn parse_part(raw: &[u8]) -> Result<Part> {
    // a leading blank line means the header block is empty
    if let Some(body) = raw.strip_prefix(b"\r\n") {
        return Ok(Part {
            headers: Vec::new(),
            body: body.to_vec(),
        });
    }
    let (header_bytes, body) = match find(raw, b"\r\n\r\n", 0) {
        Some(at) => (&raw[..at], &raw[at + 4..]),
        None => match find(raw, b"\n\n", 0) {
            Some(at) => (&raw[..at], &raw[at + 2..]),
            // headerless part: everything is body
            None => (&raw[..0], raw),
        },
    };

    let header_text = std::str::from_utf8(header_bytes)
        .map_err(|_| SatchelError::Protocol("non-utf8 multipart headers".into()))?;
    let headers = header_text
        .lines()
        .filter_map(|line| {
            let (k, v) = line.split_once(':')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect();

    Ok(Part {
        headers,
        body: body.to_vec(),
    })
}

// ---------------------------------------------------------------------------
// Writer — multipart/related document PUT
// ---------------------------------------------------------------------------

pub struct MultipartWriter {
    boundary: String,
    buf: Vec<u8>,
}

impl MultipartWriter {
    pub fn new() -> Self {
        Self {
            boundary: Uuid::new_v4().simple().to_string(),
            buf: Vec::new(),
        }
    }

    pub fn content_type(&self) -> String {
        format!("multipart/related; boundary=\"{}\"", self.boundary)
    }

    pub fn add(&mut self, content_type: &str, body: &[u8]) {
        self.buf
            .extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        self.buf
            .extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        self.buf
            .extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        self.buf.extend_from_slice(body);
        self.buf.extend_from_slice(b"\r\n");
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        self.buf
    }
}

impl Default for MultipartWriter {
    fn default() -> Self {
        Self::new()
    }
}
