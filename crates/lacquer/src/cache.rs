use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{bail, Context as _, Error};
use bytes::Bytes;
use flate2::write::GzDecoder;
use lacquer_http::gzip_compress;
use tracing::{event, Level};

use crate::config::Origin;

const IO_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_KEY_LEN: usize = 250;

/// Side-channel to external memcached servers.
///
/// Calls are issued synchronously from inside the event loop, stalling every
/// other connection for the round-trip; kept for parity with the original
/// design, bounded by a short socket timeout. Every failure degrades to a
/// miss so the proxy path always works without the cache.
pub struct CacheGateway {
    servers: Vec<Origin>,
    streams: Vec<Option<TcpStream>>,
    ttl: u64,
    compress: bool,
}

impl CacheGateway {
    pub fn new(servers: Vec<Origin>, ttl: u64, compress: bool) -> Self {
        let streams = servers.iter().map(|_| None).collect();
        Self {
            servers,
            streams,
            ttl,
            compress,
        }
    }

    /// Fetch a serialized response for `key`, or `None` on miss or any
    /// cache failure.
    pub fn lookup(&mut self, key: &str) -> Option<Bytes> {
        if !usable_key(key) {
            return None;
        }
        let shard = self.shard(key);
        match self.try_get(shard, key) {
            Ok(value) => {
                let payload = value?;
                if self.compress {
                    match gzip_decompress(&payload) {
                        Ok(decoded) => Some(Bytes::from(decoded)),
                        Err(error) => {
                            event!(Level::WARN, key, "corrupt cache payload: {error}");
                            None
                        }
                    }
                } else {
                    Some(Bytes::from(payload))
                }
            }
            Err(error) => {
                event!(Level::DEBUG, key, "cache lookup failed: {error}");
                self.streams[shard] = None;
                None
            }
        }
    }

    /// Store a serialized response under `key` with the configured TTL.
    /// Failures are logged and dropped.
    pub fn store(&mut self, key: &str, value: &[u8]) {
        if !usable_key(key) {
            return;
        }
        let payload = if self.compress {
            gzip_compress(value)
        } else {
            value.to_vec()
        };
        let shard = self.shard(key);
        if let Err(error) = self.try_set(shard, key, &payload) {
            event!(Level::DEBUG, key, "cache store failed: {error}");
            self.streams[shard] = None;
        }
    }

    fn shard(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.servers.len()
    }

    fn stream(&mut self, shard: usize) -> Result<&mut TcpStream, Error> {
        if self.streams[shard].is_none() {
            let server = &self.servers[shard];
            let stream = TcpStream::connect((server.host.as_str(), server.port))
                .with_context(|| format!("connecting to cache {}", server.endpoint()))?;
            stream.set_read_timeout(Some(IO_TIMEOUT))?;
            stream.set_write_timeout(Some(IO_TIMEOUT))?;
            event!(Level::DEBUG, server = %server.endpoint(), "cache connected");
            self.streams[shard] = Some(stream);
        }
        self.streams[shard]
            .as_mut()
            .context("cache stream unavailable")
    }

    fn try_get(&mut self, shard: usize, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let stream = self.stream(shard)?;
        stream.write_all(get_command(key).as_bytes())?;

        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let count = stream.read(&mut chunk)?;
            if count == 0 {
                bail!("cache connection closed mid-reply");
            }
            buf.extend_from_slice(&chunk[..count]);
            if let Some(reply) = parse_get_reply(&buf)? {
                return Ok(reply);
            }
        }
    }

    fn try_set(&mut self, shard: usize, key: &str, payload: &[u8]) -> Result<(), Error> {
        let ttl = self.ttl;
        let stream = self.stream(shard)?;
        stream.write_all(set_command(key, ttl, payload.len()).as_bytes())?;
        stream.write_all(payload)?;
        stream.write_all(b"\r\n")?;

        let mut buf = Vec::new();
        let mut chunk = [0u8; 128];
        loop {
            let count = stream.read(&mut chunk)?;
            if count == 0 {
                bail!("cache connection closed mid-reply");
            }
            buf.extend_from_slice(&chunk[..count]);
            if buf.ends_with(b"\r\n") {
                break;
            }
        }
        if buf != b"STORED\r\n" {
            bail!("unexpected set reply: {:?}", String::from_utf8_lossy(&buf));
        }
        Ok(())
    }
}

/// Memcached keys cannot contain whitespace or control bytes and are capped
/// in length; anything else is treated as uncacheable.
fn usable_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.bytes().all(|byte| byte > 0x20 && byte != 0x7f)
}

fn get_command(key: &str) -> String {
    format!("get {key}\r\n")
}

fn set_command(key: &str, ttl: u64, len: usize) -> String {
    format!("set {key} 0 {ttl} {len}\r\n")
}

/// Interpret an accumulating `get` reply.
///
/// `Ok(None)` means the frame is still incomplete; `Ok(Some(None))` is a
/// miss; `Ok(Some(Some(_)))` is a hit.
#[allow(clippy::type_complexity)]
fn parse_get_reply(buf: &[u8]) -> Result<Option<Option<Vec<u8>>>, Error> {
    if buf.starts_with(b"END\r\n") {
        return Ok(Some(None));
    }
    let Some(line_end) = find(buf, b"\r\n") else {
        return Ok(None);
    };

    let line = String::from_utf8_lossy(&buf[..line_end]);
    let mut parts = line.split(' ');
    if parts.next() != Some("VALUE") {
        bail!("unexpected get reply: {line:?}");
    }
    let length: usize = parts
        .nth(2)
        .and_then(|token| token.parse().ok())
        .with_context(|| format!("bad VALUE line: {line:?}"))?;

    let data_start = line_end + 2;
    let frame_end = data_start + length + 2 + 5;
    if buf.len() < frame_end {
        return Ok(None);
    }
    if &buf[data_start + length..frame_end] != b"\r\nEND\r\n" {
        bail!("malformed get reply framing");
    }
    Ok(Some(Some(buf[data_start..data_start + length].to_vec())))
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut decoder = GzDecoder::new(Vec::new());
    decoder.write_all(data)?;
    Ok(decoder.finish()?)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_framing() {
        assert_eq!(get_command("/page"), "get /page\r\n");
        assert_eq!(set_command("/page", 170, 12), "set /page 0 170 12\r\n");
    }

    #[test]
    fn get_reply_parsing() {
        // Incomplete frames keep reading
        assert!(parse_get_reply(b"VALUE /k 0 5\r\nhel").unwrap().is_none());
        assert!(parse_get_reply(b"EN").unwrap().is_none());

        // Miss
        assert_eq!(parse_get_reply(b"END\r\n").unwrap(), Some(None));

        // Hit
        let reply = parse_get_reply(b"VALUE /k 0 5\r\nhello\r\nEND\r\n").unwrap();
        assert_eq!(reply, Some(Some(b"hello".to_vec())));

        // Server errors surface as failures, not hits
        assert!(parse_get_reply(b"SERVER_ERROR out of memory\r\n").is_err());
    }

    #[test]
    fn keys_with_whitespace_are_uncacheable() {
        assert!(usable_key("/a/b?q=1"));
        assert!(!usable_key("/a b"));
        assert!(!usable_key(""));
        assert!(!usable_key(&"x".repeat(251)));
    }

    #[test]
    fn payload_compression_round_trip() {
        let body = b"A certain kind of magic.".repeat(16);
        let packed = gzip_compress(&body);
        assert_eq!(gzip_decompress(&packed).unwrap(), body);
    }
}
