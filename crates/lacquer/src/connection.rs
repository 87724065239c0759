use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use lacquer_http::MessageParser;
use mio::net::TcpStream;

use crate::{buffer::StreamBuffer, exchange::Exchange};

/// Clients that stall mid-request are only ever cleaned up by the idle
/// sweep, so they get a fixed timeout from the start.
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Reuse accounting carried by every connection, either role.
///
/// Upstreams start unbounded and learn their budget from the origin's own
/// `Keep-Alive` response header.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionMeta {
    pub created: Instant,
    pub last_active: Instant,
    pub idle_timeout: Option<Duration>,
    pub max_requests: Option<u32>,
    pub served: u32,
}

impl ConnectionMeta {
    pub fn new(now: Instant, idle_timeout: Option<Duration>) -> Self {
        Self {
            created: now,
            last_active: now,
            idle_timeout,
            max_requests: None,
            served: 0,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_active = now;
    }

    /// Idle longer than the advertised timeout.
    pub fn expired(&self, now: Instant) -> bool {
        self.idle_timeout
            .map_or(false, |timeout| {
                now.saturating_duration_since(self.last_active) > timeout
            })
    }

    /// Served as many requests as the advertised maximum.
    pub fn exhausted(&self) -> bool {
        self.max_requests.map_or(false, |max| self.served >= max)
    }

    /// Apply a learned `Keep-Alive` budget.
    pub fn learn(&mut self, timeout: Option<Duration>, max_requests: Option<u32>) {
        if let Some(timeout) = timeout {
            self.idle_timeout = Some(timeout);
        }
        if let Some(max) = max_requests {
            self.max_requests = Some(max);
        }
    }
}

/// An accepted client socket.
///
/// Owns the in-progress request parser and the FIFO queue of replies still
/// owed to this client, in request-arrival order.
pub struct ClientConnection {
    pub stream: TcpStream,
    pub meta: ConnectionMeta,
    pub parser: MessageParser,
    pub replies: VecDeque<Rc<RefCell<Exchange>>>,
}

impl ClientConnection {
    pub fn new(stream: TcpStream, now: Instant) -> Self {
        Self {
            stream,
            meta: ConnectionMeta::new(now, Some(CLIENT_IDLE_TIMEOUT)),
            parser: MessageParser::new(),
            replies: VecDeque::new(),
        }
    }
}

/// A pooled connection to one origin server.
///
/// `outbox` queues serialized requests; `pending` mirrors their dispatch
/// order, so responses are matched to exchanges strictly FIFO.
pub struct UpstreamConnection {
    pub stream: TcpStream,
    pub origin: String,
    pub meta: ConnectionMeta,
    pub outbox: StreamBuffer,
    pub pending: VecDeque<Rc<RefCell<Exchange>>>,
}

impl UpstreamConnection {
    pub fn new(stream: TcpStream, origin: String, now: Instant) -> Self {
        Self {
            stream,
            origin,
            meta: ConnectionMeta::new(now, None),
            outbox: StreamBuffer::new(),
            pending: VecDeque::new(),
        }
    }
}

/// Per-socket state, keyed by mio token in the reactor's connection table.
pub enum Connection {
    Client(ClientConnection),
    Upstream(UpstreamConnection),
}

impl Connection {
    pub fn meta(&self) -> &ConnectionMeta {
        match self {
            Connection::Client(client) => &client.meta,
            Connection::Upstream(upstream) => &upstream.meta,
        }
    }
}
