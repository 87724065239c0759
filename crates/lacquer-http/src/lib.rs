//! HTTP/1.x message model and incremental parsing.
//!
//! Messages are parsed from a byte stream fed in arbitrary slices, so a
//! caller can pump partial socket reads straight into [`MessageParser`] and
//! keep whatever the parser did not consume for the next message on the same
//! connection.

mod message;
mod parser;

pub use self::{
    message::{gzip_compress, parse_keep_alive, Headers, HttpMessage, StartLine},
    parser::{MessageParser, ParseError},
};
