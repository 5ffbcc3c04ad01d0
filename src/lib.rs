//! Transport layer for an anonymizing remailer node: a single-threaded
//! reactor, the MTP connection state machines for both directions, and the
//! outbound dispatcher that drives packets to their destinations.
//!
//! ## Architecture
//!
//! ```text
//! mtpd-core
//! ├── reactor     single-threaded poll loop, bandwidth token bucket
//! ├── listener    passive acceptor, hands sockets to the reactor
//! ├── server      inbound MTP connection state machine
//! ├── client      outbound MTP connection state machine
//! ├── dispatcher  per-destination coalescing + admission control
//! ├── dns         single-threaded cache, worker-thread resolution
//! ├── frame       wire format: control tags, digests, greeting parsing
//! ├── tls         certificate pinning (client) / open acceptance (server)
//! └── config      on-disk configuration surface
//! ```
//!
//! Everything above runs on one thread. The only cross-thread boundary is
//! the DNS worker threads posting completions back through a channel that
//! [`dns::DnsCache::process`] drains once per reactor tick.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![allow(clippy::type_complexity)]

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod dns;
pub mod error;
pub mod frame;
pub mod listener;
pub mod reactor;
pub mod runtime;
pub mod server;
pub mod tls;

pub use config::TransportConfig;
pub use error::{Error, Result};
pub use reactor::Reactor;
pub use runtime::Node;
