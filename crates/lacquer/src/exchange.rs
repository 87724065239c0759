use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Write};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use lacquer_http::{parse_keep_alive, HttpMessage, MessageParser};
use mio::Token;

use crate::buffer::StreamBuffer;

pub const SERVER_ID: &str = concat!("lacquer/", env!("CARGO_PKG_VERSION"));

/// The live correlation between one client request and its eventual
/// response.
///
/// Shared between exactly one slot in the client's reply queue and, when
/// proxied, exactly one slot in an upstream's pending queue; both queues
/// agree on FIFO order. Dropped when the reply buffer fully drains to the
/// client or when either endpoint dies.
pub struct Exchange {
    /// Canonical request target URL, used as the cache key.
    pub cache_key: String,
    /// Client-bound response bytes.
    pub reply: StreamBuffer,
    /// Response parser, present until the upstream response completes.
    pub parser: Option<MessageParser>,
    /// False when the reply was served straight from cache.
    pub proxied: bool,
    pub client: Token,
    pub upstream: Option<Token>,
}

impl Exchange {
    /// An exchange that will be satisfied by an upstream response.
    pub fn proxied(client: Token, cache_key: String) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            cache_key,
            reply: StreamBuffer::new(),
            parser: Some(MessageParser::new()),
            proxied: true,
            client,
            upstream: None,
        }))
    }

    /// An exchange satisfied immediately from the cache; the upstream pool
    /// is never touched.
    pub fn cached(client: Token, cache_key: String, payload: &[u8]) -> Rc<RefCell<Self>> {
        let mut reply = StreamBuffer::new();
        reply.write(payload);
        reply.close();
        Rc::new(RefCell::new(Self {
            cache_key,
            reply,
            parser: None,
            proxied: false,
            client,
            upstream: None,
        }))
    }
}

/// Cache key for a request: its target URL.
pub fn cache_key(request: &HttpMessage) -> String {
    request.target().unwrap_or_default().to_string()
}

/// Serialize a client request into the form sent upstream.
///
/// Upstreams are always asked for gzip so bodies cross the backhaul
/// compressed.
pub fn serialize_request(request: &mut HttpMessage) -> Bytes {
    request.headers.set("accept-encoding", "gzip");
    request.to_wire(true)
}

/// Keep-alive budget advertised by an upstream response, as
/// `(idle_timeout, max_requests)`.
pub fn keep_alive_budget(response: &HttpMessage) -> (Option<Duration>, Option<u32>) {
    match response.headers.get("keep-alive") {
        Some(value) => {
            let (timeout, max) = parse_keep_alive(value);
            (timeout.map(Duration::from_secs), max)
        }
        None => (None, None),
    }
}

/// Whether the upstream asked for its connection to be closed after this
/// response.
pub fn wants_close(response: &HttpMessage) -> bool {
    response
        .headers
        .get("connection")
        .map_or(false, |value| value.eq_ignore_ascii_case("close"))
}

/// Rewrite response headers before relaying to the client: stamp our server
/// identity, normalize connection handling, and drop range advertisements
/// we will not honor.
pub fn finalize_response(response: &mut HttpMessage) {
    response.headers.set("server", SERVER_ID);
    response.headers.remove("keep-alive");
    response.headers.set("connection", "keep-alive");
    response.headers.remove("accept-ranges");
}

/// Drain the client's reply queue into `writer`, head first.
///
/// Only ever sends the head exchange, even when later replies are already
/// buffered, so responses reach the client strictly in request order. The
/// head is popped once its buffer is complete; returns how many exchanges
/// were finished. `WouldBlock` stops the drain without error, the caller
/// retries on the next writable edge.
pub fn pump_replies<W: Write>(
    replies: &mut VecDeque<Rc<RefCell<Exchange>>>,
    writer: &mut W,
) -> io::Result<usize> {
    let mut finished = 0;

    loop {
        let Some(head) = replies.front().cloned() else {
            break;
        };
        {
            let mut exchange = head.borrow_mut();
            if !exchange.reply.ready() {
                break;
            }

            while !exchange.reply.read().is_empty() {
                match writer.write(exchange.reply.read()) {
                    Ok(0) => return Err(ErrorKind::WriteZero.into()),
                    Ok(sent) => exchange.reply.ack(sent),
                    Err(error) if error.kind() == ErrorKind::WouldBlock => return Ok(finished),
                    Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                    Err(error) => return Err(error),
                }
            }

            if !exchange.reply.complete() {
                break;
            }
        }

        replies.pop_front();
        finished += 1;
    }

    Ok(finished)
}

#[cfg(test)]
mod tests {
    use lacquer_http::StartLine;

    use super::*;

    fn parse(input: &[u8]) -> HttpMessage {
        let mut parser = MessageParser::new();
        let mut rest = input;
        while !parser.is_complete() {
            let used = parser.feed(rest).unwrap();
            rest = &rest[used..];
        }
        parser.into_message().unwrap()
    }

    #[test]
    fn request_serialization_forces_gzip_upstream() {
        let mut request =
            parse(b"GET /page HTTP/1.1\r\nHost: example.org\r\nAccept-Encoding: br\r\n\r\n");
        let wire = serialize_request(&mut request);
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.contains("Accept-Encoding: gzip\r\n"));
        assert!(!text.contains("br"));
    }

    #[test]
    fn response_rewrite() {
        let mut response = parse(
            b"HTTP/1.1 200 OK\r\nServer: origin/9\r\nKeep-Alive: timeout=5, max=10\r\n\
              Connection: close\r\nAccept-Ranges: bytes\r\nContent-Length: 2\r\n\r\nhi",
        );

        assert_eq!(
            keep_alive_budget(&response),
            (Some(Duration::from_secs(5)), Some(10))
        );
        assert!(wants_close(&response));

        finalize_response(&mut response);
        assert_eq!(response.headers.get("server"), Some(SERVER_ID));
        assert_eq!(response.headers.get("connection"), Some("keep-alive"));
        assert!(!response.headers.contains("keep-alive"));
        assert!(!response.headers.contains("accept-ranges"));
    }

    #[test]
    fn cache_key_is_request_target() {
        let request = parse(b"GET /a/b?q=1 HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(cache_key(&request), "/a/b?q=1");
    }

    fn reply_bytes(tag: &str) -> Vec<u8> {
        let message = HttpMessage {
            start: StartLine::Response {
                version: "HTTP/1.1".into(),
                status: 200,
                reason: "OK".into(),
            },
            headers: Default::default(),
            body: tag.as_bytes().into(),
        };
        message.to_wire(false).to_vec()
    }

    #[test]
    fn replies_drain_in_request_order() {
        let client = Token(1);
        let mut replies = VecDeque::new();
        let first = Exchange::proxied(client, "/r1".into());
        let second = Exchange::proxied(client, "/r2".into());
        let third = Exchange::proxied(client, "/r3".into());
        replies.push_back(first.clone());
        replies.push_back(second.clone());
        replies.push_back(third.clone());

        let mut sink = Vec::new();

        // R3's upstream responds first; nothing may reach the client yet
        {
            let mut exchange = third.borrow_mut();
            let bytes = reply_bytes("r3");
            exchange.reply.write(&bytes);
            exchange.reply.close();
        }
        assert_eq!(pump_replies(&mut replies, &mut sink).unwrap(), 0);
        assert!(sink.is_empty());
        assert_eq!(replies.len(), 3);

        // R1 arrives, unblocking the head; R2 still blocks R3
        {
            let mut exchange = first.borrow_mut();
            let bytes = reply_bytes("r1");
            exchange.reply.write(&bytes);
            exchange.reply.close();
        }
        assert_eq!(pump_replies(&mut replies, &mut sink).unwrap(), 1);
        assert_eq!(replies.len(), 2);
        let first_pos = find(&sink, b"r1").unwrap();
        assert!(!contains(&sink, b"r3"));

        // R2 arrives and the rest drains in order
        {
            let mut exchange = second.borrow_mut();
            let bytes = reply_bytes("r2");
            exchange.reply.write(&bytes);
            exchange.reply.close();
        }
        assert_eq!(pump_replies(&mut replies, &mut sink).unwrap(), 2);
        assert!(replies.is_empty());
        let second_pos = find(&sink, b"r2").unwrap();
        let third_pos = find(&sink, b"r3").unwrap();
        assert!(first_pos < second_pos && second_pos < third_pos);
    }

    #[test]
    fn cached_exchange_is_ready_immediately() {
        let exchange = Exchange::cached(Token(9), "/hit".into(), b"payload");
        let exchange = exchange.borrow();
        assert!(!exchange.proxied);
        assert!(exchange.reply.ready());
        assert!(exchange.reply.closed());
        assert_eq!(exchange.reply.read(), b"payload");
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        find(haystack, needle).is_some()
    }
}
