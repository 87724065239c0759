use std::borrow::Cow;
use std::io::Write as _;

use bytes::{BufMut, Bytes, BytesMut};
use flate2::{write::GzEncoder, Compression};

/// First line of an HTTP/1.x message.
///
/// A message is structurally either a request or a response, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: String,
        target: String,
        version: String,
    },
    Response {
        version: String,
        status: u16,
        reason: String,
    },
}

/// Ordered multimap of header fields.
///
/// Names are stored lower-cased. Insertion order is preserved, including
/// between repeated names, so multi-valued headers round-trip in arrival
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All values for `name`, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.fields
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append a value, keeping any existing values for the same name.
    pub fn append(&mut self, name: &str, value: &str) {
        self.fields
            .push((name.to_ascii_lowercase(), value.to_string()));
    }

    /// Replace all values for `name` with a single value.
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.append(name, value);
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A complete HTTP request or response.
///
/// The body holds decoded bytes; if the message arrived gzip-encoded, the
/// parser has already run it through the streaming decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    pub start: StartLine,
    pub headers: Headers,
    pub body: BytesMut,
}

impl HttpMessage {
    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start, StartLine::Response { .. })
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { target, .. } => Some(target),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Request { .. } => None,
            StartLine::Response { status, .. } => Some(*status),
        }
    }

    /// Whether the message arrived with a gzip content encoding.
    pub fn gzipped(&self) -> bool {
        self.headers
            .get("content-encoding")
            .map_or(false, |value| value.eq_ignore_ascii_case("gzip"))
    }

    /// Serialize to canonical wire form.
    ///
    /// `Transfer-Encoding` is stripped and `Content-Length` recomputed from
    /// the final body. If `recompress` is set and the message arrived
    /// gzip-encoded, the body is re-gzipped and `Content-Encoding: gzip`
    /// kept; otherwise `Content-Encoding` is dropped along with the decoded
    /// body's original framing.
    pub fn to_wire(&self, recompress: bool) -> Bytes {
        let gzip_out = recompress && self.gzipped() && !self.body.is_empty();
        let body: Cow<[u8]> = if gzip_out {
            Cow::Owned(gzip_compress(&self.body))
        } else {
            Cow::Borrowed(&self.body)
        };

        let mut out = BytesMut::with_capacity(body.len() + 256);
        match &self.start {
            StartLine::Request {
                method,
                target,
                version,
            } => {
                out.put(method.as_bytes());
                out.put_u8(b' ');
                out.put(target.as_bytes());
                out.put_u8(b' ');
                out.put(version.as_bytes());
            }
            StartLine::Response {
                version,
                status,
                reason,
            } => {
                out.put(version.as_bytes());
                out.put(format!(" {status} {reason}").as_bytes());
            }
        }
        out.put(&b"\r\n"[..]);

        for (name, value) in self.headers.iter() {
            if matches!(
                name,
                "transfer-encoding" | "content-length" | "content-encoding"
            ) {
                continue;
            }
            out.put(title_case(name).as_bytes());
            out.put(&b": "[..]);
            out.put(value.as_bytes());
            out.put(&b"\r\n"[..]);
        }

        if gzip_out {
            out.put(&b"Content-Encoding: gzip\r\n"[..]);
        }
        out.put(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        out.put(&body[..]);

        out.freeze()
    }
}

/// `content-length` -> `Content-Length`.
fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper {
            out.extend(ch.to_uppercase());
        } else {
            out.push(ch);
        }
        upper = ch == '-';
    }
    out
}

/// Gzip-compress a buffer in one shot.
pub fn gzip_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len()), Compression::default());
    // Writing to a Vec cannot fail
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

/// Parse a `Keep-Alive: timeout=N, max=M` header value.
///
/// Returns `(timeout_secs, max_requests)`; either may be absent.
pub fn parse_keep_alive(value: &str) -> (Option<u64>, Option<u32>) {
    let mut timeout = None;
    let mut max = None;
    for part in value.split(',') {
        let mut kv = part.splitn(2, '=');
        let key = kv.next().unwrap_or("").trim();
        let val = kv.next().unwrap_or("").trim();
        if key.eq_ignore_ascii_case("timeout") {
            timeout = val.parse().ok();
        } else if key.eq_ignore_ascii_case("max") {
            max = val.parse().ok();
        }
    }
    (timeout, max)
}
