use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Error};
use lacquer_http::HttpMessage;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{event, Level};

use crate::buffer::StreamBuffer;
use crate::cache::CacheGateway;
use crate::config::Config;
use crate::connection::{ClientConnection, Connection, ConnectionMeta, UpstreamConnection};
use crate::exchange::{self, Exchange};
use crate::pool::{Action, UpstreamPool};

const LISTENER: Token = Token(0);

/// Poll timeout, so sweeps happen even on a quiet proxy.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);
/// One-in-N chance per wakeup that the idle sweep runs.
const SWEEP_CHANCE: u8 = 8;

/// Outcome of feeding freshly read bytes into a parser.
enum Feed {
    Fail,
    Progress { used: usize, complete: bool },
}

/// The event loop and owner of all per-socket state.
///
/// Everything lives on one thread: the connection table, the upstream pool,
/// the per-connection queues and the cache gateway are only ever touched
/// from the poll loop, so no locking is involved anywhere.
pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    config: Config,
    cache: Option<CacheGateway>,
    connections: HashMap<Token, Connection>,
    pool: UpstreamPool,
    next_token: usize,
}

impl Reactor {
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let poll = Poll::new()?;
        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let mut listener = TcpListener::bind(addr).with_context(|| format!("binding {addr}"))?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        event!(Level::INFO, %addr, "listening");

        let cache = (!config.cache_servers.is_empty()).then(|| {
            CacheGateway::new(
                config.cache_servers.clone(),
                config.cache_ttl,
                config.compress_cache,
            )
        });

        let pool = UpstreamPool::new(config.pool_cap);
        Ok(Self {
            poll,
            listener,
            config,
            cache,
            connections: HashMap::new(),
            pool,
            next_token: LISTENER.0 + 1,
        })
    }

    /// Run the poll loop forever.
    pub fn run(&mut self) -> Result<(), Error> {
        let mut events = Events::with_capacity(128);
        loop {
            self.poll.poll(&mut events, Some(SWEEP_INTERVAL))?;

            for io_event in events.iter() {
                let token = io_event.token();
                if token == LISTENER {
                    self.accept()?;
                    continue;
                }
                if io_event.is_error() {
                    self.teardown(token);
                    continue;
                }
                if io_event.is_readable() {
                    self.readable(token);
                }
                if io_event.is_writable() {
                    self.writable(token);
                }
            }

            // Probabilistic, not a deterministic timer
            if fastrand::u8(..SWEEP_CHANCE) == 0 {
                self.sweep(Instant::now());
            }
        }
    }

    fn token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn accept(&mut self) -> Result<(), Error> {
        while let Some((mut stream, remote_addr)) = check_io(self.listener.accept())? {
            let token = self.token();
            self.poll.registry().register(
                &mut stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            )?;
            event!(Level::DEBUG, ?token, ?remote_addr, "client accepted");

            let client = ClientConnection::new(stream, Instant::now());
            self.connections.insert(token, Connection::Client(client));
        }
        Ok(())
    }

    fn readable(&mut self, token: Token) {
        match self.connections.get(&token) {
            Some(Connection::Client(_)) => self.client_readable(token),
            Some(Connection::Upstream(_)) => self.upstream_readable(token),
            None => {}
        }
    }

    fn writable(&mut self, token: Token) {
        match self.connections.get(&token) {
            Some(Connection::Client(_)) => self.flush_client(token),
            Some(Connection::Upstream(_)) => self.flush_upstream(token),
            None => {}
        }
    }

    fn client_readable(&mut self, token: Token) {
        let (data, closed) = {
            let Some(Connection::Client(client)) = self.connections.get_mut(&token) else {
                return;
            };
            match read_available(&mut client.stream) {
                Ok(result) => result,
                Err(error) => {
                    event!(Level::DEBUG, ?token, "client read failed: {error}");
                    self.teardown(token);
                    return;
                }
            }
        };

        if !data.is_empty() {
            self.client_bytes(token, &data);
        }
        if closed {
            self.teardown(token);
        }
    }

    /// Feed client bytes through the current request parser, dispatching
    /// each completed request and starting a fresh parser for the next
    /// pipelined one.
    fn client_bytes(&mut self, token: Token, data: &[u8]) {
        let mut rest = data;
        while !rest.is_empty() {
            let feed = {
                let Some(Connection::Client(client)) = self.connections.get_mut(&token) else {
                    return;
                };
                client.meta.touch(Instant::now());
                match client.parser.feed(rest) {
                    Err(error) => {
                        event!(Level::DEBUG, ?token, "request parse failed: {error}");
                        Feed::Fail
                    }
                    Ok(used) => Feed::Progress {
                        used,
                        complete: client.parser.is_complete(),
                    },
                }
            };

            match feed {
                Feed::Fail => {
                    self.teardown(token);
                    return;
                }
                Feed::Progress { used, complete } => {
                    rest = &rest[used..];
                    if !complete {
                        if used == 0 {
                            // No progress and no completion, give up
                            self.teardown(token);
                            return;
                        }
                        continue;
                    }

                    let request = {
                        let Some(Connection::Client(client)) = self.connections.get_mut(&token)
                        else {
                            return;
                        };
                        std::mem::take(&mut client.parser).into_message()
                    };
                    match request {
                        Some(request) => self.dispatch(token, request),
                        None => {
                            self.teardown(token);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Route one complete client request: cache first, then the pool.
    fn dispatch(&mut self, client_token: Token, mut request: HttpMessage) {
        let key = exchange::cache_key(&request);
        event!(
            Level::DEBUG,
            ?client_token,
            method = ?request.method(),
            target = %key,
            "request"
        );

        if let Some(cache) = self.cache.as_mut() {
            if let Some(payload) = cache.lookup(&key) {
                event!(Level::DEBUG, target = %key, "cache hit");
                let hit = Exchange::cached(client_token, key, &payload);
                if let Some(Connection::Client(client)) = self.connections.get_mut(&client_token) {
                    client.replies.push_back(hit);
                }
                self.flush_client(client_token);
                return;
            }
        }

        let wire = exchange::serialize_request(&mut request);
        let upstream_token = match self.select_upstream() {
            Ok(token) => token,
            Err(error) => {
                event!(Level::WARN, "upstream selection failed: {error}");
                self.teardown(client_token);
                return;
            }
        };

        let pending = Exchange::proxied(client_token, key);
        pending.borrow_mut().upstream = Some(upstream_token);

        let Some(Connection::Client(client)) = self.connections.get_mut(&client_token) else {
            return;
        };
        client.replies.push_back(pending.clone());

        if let Some(Connection::Upstream(upstream)) = self.connections.get_mut(&upstream_token) {
            upstream.outbox.write(&wire);
            upstream.pending.push_back(pending);
            upstream.meta.touch(Instant::now());
        }
        self.flush_upstream(upstream_token);
    }

    /// Pick an origin at random, reap its stale connections, and return a
    /// connection to use.
    fn select_upstream(&mut self) -> Result<Token, Error> {
        let pick = fastrand::usize(..self.config.upstreams.len());
        let origin_key = self.config.upstreams[pick].endpoint();
        let now = Instant::now();

        let entries: Vec<(Token, ConnectionMeta)> = self
            .pool
            .tokens(&origin_key)
            .iter()
            .filter_map(|token| {
                self.connections
                    .get(token)
                    .map(|connection| (*token, *connection.meta()))
            })
            .collect();

        let plan = self.pool.plan(&entries, now);
        for token in plan.reap {
            event!(Level::DEBUG, ?token, origin = %origin_key, "reaping upstream");
            self.teardown(token);
        }

        match plan.action {
            Action::Reuse(token) => Ok(token),
            Action::Open => self.open_upstream(&origin_key),
        }
    }

    fn open_upstream(&mut self, origin_key: &str) -> Result<Token, Error> {
        let addr = origin_key
            .to_socket_addrs()
            .with_context(|| format!("resolving {origin_key}"))?
            .next()
            .with_context(|| format!("no address for {origin_key}"))?;
        let mut stream = TcpStream::connect(addr)?;

        let token = self.token();
        self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        event!(Level::DEBUG, ?token, origin = %origin_key, "upstream opened");

        let upstream = UpstreamConnection::new(stream, origin_key.to_string(), Instant::now());
        self.connections.insert(token, Connection::Upstream(upstream));
        self.pool.insert(origin_key, token);
        Ok(token)
    }

    fn upstream_readable(&mut self, token: Token) {
        let (data, closed) = {
            let Some(Connection::Upstream(upstream)) = self.connections.get_mut(&token) else {
                return;
            };
            match read_available(&mut upstream.stream) {
                Ok(result) => result,
                Err(error) => {
                    event!(Level::DEBUG, ?token, "upstream read failed: {error}");
                    self.teardown(token);
                    return;
                }
            }
        };

        if !data.is_empty() {
            self.upstream_bytes(token, &data);
        }
        if closed {
            self.teardown(token);
        }
    }

    /// Feed upstream bytes into the head pending exchange's response
    /// parser; responses on one upstream connection arrive strictly FIFO.
    fn upstream_bytes(&mut self, token: Token, data: &[u8]) {
        let mut rest = data;
        while !rest.is_empty() {
            let head = {
                let Some(Connection::Upstream(upstream)) = self.connections.get_mut(&token) else {
                    return;
                };
                upstream.meta.touch(Instant::now());
                upstream.pending.front().cloned()
            };
            let Some(pending) = head else {
                event!(Level::DEBUG, ?token, "bytes from upstream with no pending exchange");
                self.teardown(token);
                return;
            };

            let feed = {
                let mut pending = pending.borrow_mut();
                match pending.parser.as_mut() {
                    None => Feed::Fail,
                    Some(parser) => match parser.feed(rest) {
                        Err(error) => {
                            event!(Level::DEBUG, ?token, "response parse failed: {error}");
                            Feed::Fail
                        }
                        Ok(used) => Feed::Progress {
                            used,
                            complete: parser.is_complete(),
                        },
                    },
                }
            };

            match feed {
                Feed::Fail => {
                    self.teardown(token);
                    return;
                }
                Feed::Progress { used, complete } => {
                    rest = &rest[used..];
                    if !complete {
                        if used == 0 {
                            self.teardown(token);
                            return;
                        }
                        continue;
                    }
                    if !self.complete_exchange(token, &pending) {
                        return;
                    }
                }
            }
        }
    }

    /// Finish the head exchange of an upstream connection: rewrite and
    /// serialize the response, hand it to the client queue, store it in the
    /// cache. Returns false when the upstream was torn down.
    fn complete_exchange(&mut self, token: Token, pending: &Rc<RefCell<Exchange>>) -> bool {
        let done = {
            let mut pending = pending.borrow_mut();
            let response = pending.parser.take().and_then(|parser| parser.into_message());
            let Some(mut response) = response else {
                drop(pending);
                self.teardown(token);
                return false;
            };

            let budget = exchange::keep_alive_budget(&response);
            let close = exchange::wants_close(&response);
            let status = response.status();
            exchange::finalize_response(&mut response);

            let wire = response.to_wire(true);
            pending.reply.write(&wire);
            pending.reply.close();

            event!(Level::DEBUG, ?token, ?status, bytes = wire.len(), "response relayed");
            (
                pending.client,
                pending.cache_key.clone(),
                pending.proxied,
                wire,
                budget,
                close,
            )
        };
        let (client_token, cache_key, proxied, wire, budget, close) = done;

        {
            let Some(Connection::Upstream(upstream)) = self.connections.get_mut(&token) else {
                return false;
            };
            upstream.pending.pop_front();
            upstream.meta.served += 1;
            upstream.meta.touch(Instant::now());
            upstream.meta.learn(budget.0, budget.1);
        }

        if proxied {
            if let Some(cache) = self.cache.as_mut() {
                cache.store(&cache_key, &wire);
            }
        }

        // The client may be long gone; an orphaned exchange just drains
        // nowhere and the upstream stays in sync.
        self.flush_client(client_token);

        if close {
            event!(Level::DEBUG, ?token, "upstream requested close");
            self.teardown(token);
            return false;
        }
        true
    }

    /// Send pending replies to a client, strictly head-of-queue first.
    fn flush_client(&mut self, token: Token) {
        let result = {
            let Some(Connection::Client(client)) = self.connections.get_mut(&token) else {
                return;
            };
            exchange::pump_replies(&mut client.replies, &mut client.stream).map(|finished| {
                client.meta.served += finished as u32;
                if finished > 0 {
                    client.meta.touch(Instant::now());
                }
            })
        };
        if let Err(error) = result {
            event!(Level::DEBUG, ?token, "client write failed: {error}");
            self.teardown(token);
        }
    }

    /// Drain an upstream's outbox of serialized requests.
    fn flush_upstream(&mut self, token: Token) {
        let result = {
            let Some(Connection::Upstream(upstream)) = self.connections.get_mut(&token) else {
                return;
            };
            write_buffer(&mut upstream.outbox, &mut upstream.stream)
        };
        if let Err(error) = result {
            event!(Level::DEBUG, ?token, "upstream write failed: {error}");
            self.teardown(token);
        }
    }

    /// Close a connection and everything that depends on it.
    ///
    /// Iterative worklist rather than recursion: closing an upstream queues
    /// every client still waiting on its pending exchanges, and those
    /// closures cannot re-enter. Closing a client does not touch its
    /// upstreams; orphaned exchanges drain nowhere and the connection is
    /// reaped later.
    fn teardown(&mut self, token: Token) {
        let mut worklist = VecDeque::from([token]);
        while let Some(token) = worklist.pop_front() {
            let Some(connection) = self.connections.remove(&token) else {
                continue;
            };
            match connection {
                Connection::Client(mut client) => {
                    let _ = self.poll.registry().deregister(&mut client.stream);
                    event!(Level::DEBUG, ?token, "client closed");
                }
                Connection::Upstream(mut upstream) => {
                    let _ = self.poll.registry().deregister(&mut upstream.stream);
                    self.pool.remove(token);
                    event!(Level::DEBUG, ?token, origin = %upstream.origin, "upstream closed");

                    // Their responses can never arrive now
                    for pending in upstream.pending.drain(..) {
                        worklist.push_back(pending.borrow().client);
                    }
                }
            }
        }
    }

    /// Reap connections past their idle timeout, and upstreams that spent
    /// their request budget while sitting idle in the pool.
    fn sweep(&mut self, now: Instant) {
        let stale: Vec<Token> = self
            .connections
            .iter()
            .filter_map(|(token, connection)| {
                let expired = connection.meta().expired(now);
                let spent = match connection {
                    Connection::Upstream(upstream) => {
                        upstream.meta.exhausted() && upstream.pending.is_empty()
                    }
                    Connection::Client(_) => false,
                };
                (expired || spent).then_some(*token)
            })
            .collect();

        for token in stale {
            event!(Level::DEBUG, ?token, "sweeping stale connection");
            self.teardown(token);
        }
    }
}

/// WouldBlock just means we've run out of things to handle.
fn check_io<T>(value: io::Result<T>) -> Result<Option<T>, Error> {
    match value {
        Ok(value) => Ok(Some(value)),
        Err(error) if error.kind() == ErrorKind::WouldBlock => Ok(None),
        Err(error) => Err(error.into()),
    }
}

/// Read everything currently available on a non-blocking stream.
///
/// Returns the bytes and whether the peer closed the connection.
fn read_available(stream: &mut TcpStream) -> io::Result<(Vec<u8>, bool)> {
    let mut closed = false;
    let mut buffer = vec![0; 4096];
    let mut bytes_read = 0;

    loop {
        match stream.read(&mut buffer[bytes_read..]) {
            Ok(0) => {
                closed = true;
                break;
            }
            Ok(count) => {
                bytes_read += count;
                if bytes_read == buffer.len() {
                    buffer.resize(buffer.len() + 4096, 0);
                }
            }
            Err(error) if error.kind() == ErrorKind::WouldBlock => break,
            Err(error) if error.kind() == ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }

    buffer.truncate(bytes_read);
    Ok((buffer, closed))
}

/// Drain a StreamBuffer into a non-blocking stream, acking exactly what the
/// transport accepted.
fn write_buffer(buffer: &mut StreamBuffer, stream: &mut TcpStream) -> io::Result<()> {
    while !buffer.read().is_empty() {
        match stream.write(buffer.read()) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(sent) => buffer.ack(sent),
            Err(error) if error.kind() == ErrorKind::WouldBlock => return Ok(()),
            // Connect still in progress; the writable edge will retry
            Err(error) if error.kind() == ErrorKind::NotConnected => return Ok(()),
            Err(error) if error.kind() == ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
    Ok(())
}
