//! User-request control plane of a TCP stack.
//!
//! Translates socket-layer requests (bind, listen, connect, send, shutdown,
//! options, ...) into operations on per-connection protocol state, under a
//! per-connection lock, and lets a connection switch its behavior and
//! congestion modules while it is live.
//!
//! Segment processing is out of scope; the stack drives it through the
//! [`protocol::ProtocolEngine`] trait.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod config;
pub mod epoch;
pub mod error;
pub mod log;
pub mod module;
pub mod protocol;
pub mod usrreq;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use protocol::{Cred, Domain};
pub use usrreq::{Message, SendFlags, Shutdown, Socket, Stack};
