use std::io::Write as _;

use bytes::BytesMut;
use flate2::write::GzDecoder;
use thiserror::Error;

use crate::{Headers, HttpMessage, StartLine};

/// Violation of the HTTP/1.x message grammar.
///
/// The connection that produced the bytes can no longer be trusted and must
/// be torn down by the caller; no partial message is surfaced.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed start line: {0:?}")]
    StartLine(String),
    #[error("malformed header line: {0:?}")]
    Header(String),
    #[error("malformed chunk size line: {0:?}")]
    ChunkSize(String),
    #[error("chunk data not followed by CRLF")]
    ChunkDelimiter,
    #[error("chunked trailers are not supported")]
    Trailers,
    #[error("gzip decode failed: {0}")]
    Gzip(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StartLine,
    Headers,
    FixedBody { remaining: usize },
    ChunkSize,
    ChunkData { remaining: usize },
    ChunkDataEnd,
    ChunkEnd,
    Complete,
}

/// Incremental parser for one HTTP request or response.
///
/// Feed byte slices as they arrive; the parser consumes what it can fully
/// interpret and never reads past the end of the current message, so
/// leftover bytes belong to the next message on the same connection. One
/// parser produces exactly one message.
pub struct MessageParser {
    state: State,
    buf: BytesMut,
    start: Option<StartLine>,
    headers: Headers,
    body: BytesMut,
    decoder: Option<GzDecoder<Vec<u8>>>,
}

impl Default for MessageParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageParser {
    pub fn new() -> Self {
        Self {
            state: State::StartLine,
            buf: BytesMut::new(),
            start: None,
            headers: Headers::default(),
            body: BytesMut::new(),
            decoder: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    pub fn headers_complete(&self) -> bool {
        !matches!(self.state, State::StartLine | State::Headers)
    }

    /// The parsed message, once complete.
    pub fn into_message(self) -> Option<HttpMessage> {
        if self.state != State::Complete {
            return None;
        }
        Some(HttpMessage {
            start: self.start?,
            headers: self.headers,
            body: self.body,
        })
    }

    /// Consume bytes, returning how many were used.
    ///
    /// Call again with the unconsumed remainder until [`is_complete`]
    /// reports true; a complete parser consumes nothing further.
    ///
    /// [`is_complete`]: Self::is_complete
    pub fn feed(&mut self, data: &[u8]) -> Result<usize, ParseError> {
        let mut consumed = 0;

        loop {
            if self.state == State::Complete {
                return Ok(consumed);
            }
            let rest = &data[consumed..];
            if rest.is_empty() {
                return Ok(consumed);
            }

            match self.state {
                State::StartLine => {
                    let Some((line, used)) = self.buffer_until(rest, b"\r\n") else {
                        return Ok(data.len());
                    };
                    consumed += used;
                    self.start = Some(parse_start_line(&line)?);
                    self.state = State::Headers;
                }
                State::Headers => {
                    let Some((block, used)) = self.buffer_until(rest, b"\r\n\r\n") else {
                        return Ok(data.len());
                    };
                    consumed += used;
                    self.parse_header_block(&block)?;
                    self.select_body()?;
                }
                State::FixedBody { remaining } => {
                    let take = remaining.min(rest.len());
                    self.push_body(&rest[..take])?;
                    consumed += take;
                    if remaining == take {
                        self.finish_body()?;
                        self.state = State::Complete;
                    } else {
                        self.state = State::FixedBody {
                            remaining: remaining - take,
                        };
                    }
                }
                State::ChunkSize => {
                    let Some((line, used)) = self.buffer_until(rest, b"\r\n") else {
                        return Ok(data.len());
                    };
                    consumed += used;
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        State::ChunkEnd
                    } else {
                        State::ChunkData { remaining: size }
                    };
                }
                State::ChunkData { remaining } => {
                    let take = remaining.min(rest.len());
                    self.push_body(&rest[..take])?;
                    consumed += take;
                    if remaining == take {
                        self.state = State::ChunkDataEnd;
                    } else {
                        self.state = State::ChunkData {
                            remaining: remaining - take,
                        };
                    }
                }
                State::ChunkDataEnd => {
                    let (take, matched) = self.take_crlf(rest);
                    consumed += take;
                    match matched {
                        None => return Ok(consumed),
                        Some(false) => return Err(ParseError::ChunkDelimiter),
                        Some(true) => self.state = State::ChunkSize,
                    }
                }
                State::ChunkEnd => {
                    // The terminating CRLF must be present and consumed
                    // before the message counts as complete; anything else
                    // after the zero chunk is a trailer field.
                    let (take, matched) = self.take_crlf(rest);
                    consumed += take;
                    match matched {
                        None => return Ok(consumed),
                        Some(false) => return Err(ParseError::Trailers),
                        Some(true) => {
                            self.finish_body()?;
                            self.state = State::Complete;
                        }
                    }
                }
                State::Complete => unreachable!(),
            }
        }
    }

    /// Accumulate bytes until `delim` is seen across all feeds so far.
    ///
    /// Returns the bytes before the delimiter and how many of `rest` were
    /// used, or `None` (buffering everything) if the delimiter has not
    /// arrived yet.
    fn buffer_until(&mut self, rest: &[u8], delim: &[u8]) -> Option<(Vec<u8>, usize)> {
        let prev = self.buf.len();
        self.buf.extend_from_slice(rest);
        let idx = find(&self.buf, delim)?;
        let block = self.buf[..idx].to_vec();
        let used = (idx + delim.len()).saturating_sub(prev);
        self.buf.clear();
        Some((block, used))
    }

    /// Accumulate up to two bytes and check them against CRLF.
    fn take_crlf(&mut self, rest: &[u8]) -> (usize, Option<bool>) {
        let need = 2usize.saturating_sub(self.buf.len());
        let take = need.min(rest.len());
        self.buf.extend_from_slice(&rest[..take]);
        if self.buf.len() < 2 {
            return (take, None);
        }
        let matched = &self.buf[..2] == b"\r\n";
        self.buf.clear();
        (take, Some(matched))
    }

    fn parse_header_block(&mut self, block: &[u8]) -> Result<(), ParseError> {
        if block.is_empty() {
            return Ok(());
        }
        for line in block.split_crlf() {
            let text = String::from_utf8_lossy(line);
            let Some(colon) = line.iter().position(|byte| *byte == b':') else {
                return Err(ParseError::Header(text.into_owned()));
            };
            if colon == 0 {
                return Err(ParseError::Header(text.into_owned()));
            }
            let name = String::from_utf8_lossy(&line[..colon]);
            let value = String::from_utf8_lossy(&line[colon + 1..]);
            self.headers.append(&name, value.trim_start());
        }
        Ok(())
    }

    /// Decide how the body is framed, right after the header blank line.
    fn select_body(&mut self) -> Result<(), ParseError> {
        // GET/HEAD carry no body, even with a stray Content-Length
        if let Some(StartLine::Request { method, .. }) = &self.start {
            if method == "GET" || method == "HEAD" {
                self.state = State::Complete;
                return Ok(());
            }
        }

        let chunked = self
            .headers
            .get("transfer-encoding")
            .map_or(false, |value| value.eq_ignore_ascii_case("chunked"));
        if chunked {
            self.setup_decoder();
            self.state = State::ChunkSize;
            return Ok(());
        }

        let length = match self.headers.get("content-length") {
            None => 0,
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ParseError::Header(format!("content-length: {value}")))?,
        };
        if length == 0 {
            self.state = State::Complete;
        } else {
            self.setup_decoder();
            self.state = State::FixedBody { remaining: length };
        }
        Ok(())
    }

    fn setup_decoder(&mut self) {
        let gzip = self
            .headers
            .get("content-encoding")
            .map_or(false, |value| value.eq_ignore_ascii_case("gzip"));
        if gzip {
            // Persistent across feeds, gzip state can span chunk boundaries
            self.decoder = Some(GzDecoder::new(Vec::new()));
        }
    }

    fn push_body(&mut self, data: &[u8]) -> Result<(), ParseError> {
        match &mut self.decoder {
            Some(decoder) => decoder.write_all(data).map_err(ParseError::Gzip)?,
            None => self.body.extend_from_slice(data),
        }
        Ok(())
    }

    fn finish_body(&mut self) -> Result<(), ParseError> {
        if let Some(decoder) = self.decoder.take() {
            let decoded = decoder.finish().map_err(ParseError::Gzip)?;
            self.body.extend_from_slice(&decoded);
        }
        Ok(())
    }
}

fn parse_start_line(line: &[u8]) -> Result<StartLine, ParseError> {
    let text = String::from_utf8_lossy(line);

    if text.starts_with("HTTP/") {
        let mut parts = text.splitn(3, ' ');
        let version = parts
            .next()
            .ok_or_else(|| ParseError::StartLine(text.to_string()))?;
        let status = parts
            .next()
            .and_then(|token| token.parse().ok())
            .ok_or_else(|| ParseError::StartLine(text.to_string()))?;
        let reason = parts.next().unwrap_or("");
        return Ok(StartLine::Response {
            version: version.to_string(),
            status,
            reason: reason.to_string(),
        });
    }

    let parts: Vec<&str> = text.split(' ').collect();
    let [method, target, version] = parts[..] else {
        return Err(ParseError::StartLine(text.to_string()));
    };
    if method.is_empty() || target.is_empty() || version.is_empty() {
        return Err(ParseError::StartLine(text.to_string()));
    }
    Ok(StartLine::Request {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
    })
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let text = String::from_utf8_lossy(line);
    // Extension text after ';' is skipped, not interpreted
    let size = text.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size, 16).map_err(|_| ParseError::ChunkSize(text.to_string()))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Split a header block on CRLF line boundaries.
trait SplitCrlf {
    fn split_crlf(&self) -> SplitCrlfIter<'_>;
}

impl SplitCrlf for [u8] {
    fn split_crlf(&self) -> SplitCrlfIter<'_> {
        SplitCrlfIter { rest: Some(self) }
    }
}

struct SplitCrlfIter<'a> {
    rest: Option<&'a [u8]>,
}

impl<'a> Iterator for SplitCrlfIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let rest = self.rest?;
        match find(rest, b"\r\n") {
            Some(idx) => {
                self.rest = Some(&rest[idx + 2..]);
                Some(&rest[..idx])
            }
            None => {
                self.rest = None;
                Some(rest)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> HttpMessage {
        let mut parser = MessageParser::new();
        let mut rest = input;
        while !parser.is_complete() {
            let used = parser.feed(rest).unwrap();
            assert!(used > 0, "parser stalled with {} bytes left", rest.len());
            rest = &rest[used..];
        }
        parser.into_message().unwrap()
    }

    #[test]
    fn simple_get_request() {
        let message = parse_all(b"GET /index.html HTTP/1.1\r\nHost: example.org\r\n\r\n");
        assert_eq!(message.method(), Some("GET"));
        assert_eq!(message.target(), Some("/index.html"));
        assert_eq!(message.headers.get("host"), Some("example.org"));
        assert!(message.body.is_empty());
    }

    #[test]
    fn response_with_fixed_body() {
        let message = parse_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        assert!(message.is_response());
        assert_eq!(message.status(), Some(200));
        assert_eq!(&message.body[..], b"hello");
    }

    #[test]
    fn reason_with_spaces() {
        let message = parse_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n");
        let StartLine::Response { reason, .. } = &message.start else {
            panic!("expected response");
        };
        assert_eq!(reason, "Internal Server Error");
    }

    #[test]
    fn repeated_headers_collect_in_order() {
        let message = parse_all(
            b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nContent-Length: 0\r\n\r\n",
        );
        let cookies: Vec<_> = message.headers.get_all("set-cookie").collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    #[test]
    fn never_consumes_into_next_message() {
        let input = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabcHTTP/1.1 204 No Content\r\n";
        let mut parser = MessageParser::new();
        let mut total = 0;
        while !parser.is_complete() {
            total += parser.feed(&input[total..]).unwrap();
        }
        assert_eq!(&input[total..], b"HTTP/1.1 204 No Content\r\n");
        // A complete parser refuses further input
        assert_eq!(parser.feed(&input[total..]).unwrap(), 0);
    }

    #[test]
    fn zero_chunk_requires_trailing_crlf() {
        let mut parser = MessageParser::new();
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n";
        let mut rest: &[u8] = head;
        while !rest.is_empty() {
            let used = parser.feed(rest).unwrap();
            rest = &rest[used..];
        }
        // Not complete until the final CRLF is consumed
        assert!(!parser.is_complete());
        assert_eq!(parser.feed(b"\r\n").unwrap(), 2);
        assert!(parser.is_complete());
    }

    #[test]
    fn trailers_are_a_parse_failure() {
        let mut parser = MessageParser::new();
        let input = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let mut rest: &[u8] = input;
        let error = loop {
            match parser.feed(rest) {
                Ok(used) => rest = &rest[used..],
                Err(error) => break error,
            }
        };
        assert!(matches!(error, ParseError::Trailers));
    }

    #[test]
    fn malformed_start_line_fails() {
        let mut parser = MessageParser::new();
        let result = parser.feed(b"GET /nowhere\r\n");
        assert!(matches!(result, Err(ParseError::StartLine(_))));
    }

    #[test]
    fn header_without_colon_fails() {
        let mut parser = MessageParser::new();
        let result = parser.feed(b"GET / HTTP/1.1\r\nbroken header\r\n\r\n");
        assert!(matches!(result, Err(ParseError::Header(_))));
    }

    #[test]
    fn bad_chunk_size_fails() {
        let mut parser = MessageParser::new();
        let result =
            parser.feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nxyz\r\n");
        assert!(matches!(result, Err(ParseError::ChunkSize(_))));
    }
}
