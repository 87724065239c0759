use anyhow::Error;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use lacquer::config::{
    Config, Origin, DEFAULT_CACHE_PORT, DEFAULT_CACHE_TTL, DEFAULT_ORIGIN_PORT, DEFAULT_POOL_CAP,
    DEFAULT_PORT,
};
use lacquer::reactor::Reactor;

/// Reverse-proxying web accelerator.
#[derive(Parser)]
#[command(name = "lacquer", version)]
struct Args {
    /// Port to listen for client connections on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Upstream origin server, host[:port]; repeat for multiple origins
    #[arg(short = 's', long = "server", required = true)]
    servers: Vec<String>,

    /// Cache server, host[:port]; repeat for multiple, omit to disable
    #[arg(short = 'c', long = "cache")]
    caches: Vec<String>,

    /// Seconds before a cache entry expires
    #[arg(long, default_value_t = DEFAULT_CACHE_TTL)]
    cache_ttl: u64,

    /// Gzip cache payloads before storing
    #[arg(long)]
    compress_cache: bool,

    /// Maximum concurrent connections per origin
    #[arg(long, default_value_t = DEFAULT_POOL_CAP)]
    pool_cap: usize,
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let upstreams = args
        .servers
        .iter()
        .map(|server| Origin::parse(server, DEFAULT_ORIGIN_PORT))
        .collect::<Result<_, _>>()?;
    let cache_servers = args
        .caches
        .iter()
        .map(|cache| Origin::parse(cache, DEFAULT_CACHE_PORT))
        .collect::<Result<_, _>>()?;

    let mut config = Config::new(upstreams);
    config.port = args.port;
    config.cache_servers = cache_servers;
    config.cache_ttl = args.cache_ttl;
    config.compress_cache = args.compress_cache;
    config.pool_cap = args.pool_cap;

    let mut reactor = Reactor::new(config)?;
    reactor.run()
}
