use anyhow::{bail, Error};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_ORIGIN_PORT: u16 = 80;
pub const DEFAULT_CACHE_PORT: u16 = 11211;
pub const DEFAULT_CACHE_TTL: u64 = 170;
pub const DEFAULT_POOL_CAP: usize = 4;

/// A `host:port` endpoint, for upstream origins and cache servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub host: String,
    pub port: u16,
}

impl Origin {
    /// Parse `host[:port]`, falling back to `default_port`.
    pub fn parse(text: &str, default_port: u16) -> Result<Self, Error> {
        let (host, port) = match text.rsplit_once(':') {
            Some((host, port)) => {
                let port = match port.parse() {
                    Ok(port) => port,
                    Err(_) => bail!("invalid port in {text:?}"),
                };
                (host, port)
            }
            None => (text, default_port),
        };
        if host.is_empty() {
            bail!("empty host in {text:?}");
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// The `host:port` form used for pool keys and address resolution.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to accept client connections on.
    pub port: u16,
    /// Upstream origin servers; requests are spread uniformly at random.
    pub upstreams: Vec<Origin>,
    /// Cache servers; empty disables the cache side-channel.
    pub cache_servers: Vec<Origin>,
    /// Seconds before a cache entry expires.
    pub cache_ttl: u64,
    /// Gzip cache payloads before storing.
    pub compress_cache: bool,
    /// Maximum concurrent connections per origin.
    pub pool_cap: usize,
}

impl Config {
    pub fn new(upstreams: Vec<Origin>) -> Self {
        Self {
            port: DEFAULT_PORT,
            upstreams,
            cache_servers: Vec::new(),
            cache_ttl: DEFAULT_CACHE_TTL,
            compress_cache: false,
            pool_cap: DEFAULT_POOL_CAP,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.upstreams.is_empty() {
            bail!("at least one upstream origin is required");
        }
        if self.pool_cap == 0 {
            bail!("pool capacity must be at least 1");
        }
        Ok(())
    }
}
