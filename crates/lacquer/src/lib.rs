//! Reverse-proxying web accelerator.
//!
//! Terminates client HTTP/1.x connections, forwards requests to a pool of
//! upstream origins, optionally serves and saves responses through an
//! external memcached-style cache, and relays bytes back to clients, all on
//! a single-threaded mio event loop.

pub mod buffer;
pub mod cache;
pub mod config;
pub mod connection;
pub mod exchange;
pub mod pool;
pub mod reactor;
