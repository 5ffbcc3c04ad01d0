//! Error types for the reactor, MTP engines, and outbound dispatcher.

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the reactor and its connections.
///
/// Variants map to the dispositions in the error handling design: most are
/// either retried locally (transport-transient, surfaced via `std::io::Error`
/// kinds) or terminate a single connection (`Protocol`, `Tls`) without
/// aborting the reactor loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O errors from sockets, listeners, or TLS transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A peer violated the MTP wire format: bad greeting, unknown control
    /// tag, or digest mismatch. Fatal to the connection, not the reactor.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// TLS handshake or record-layer failure.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// DNS resolution failed for a hostname routing target.
    #[error("DNS resolution failed for {name}: {reason}")]
    Dns {
        /// The hostname that failed to resolve.
        name: String,
        /// Resolver-reported reason.
        reason: String,
    },

    /// Configuration could not be loaded or was invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// An invariant that should be impossible was violated. These are never
    /// recovered; callers should treat them as fatal to the whole node.
    #[error("internal invariant violation: {0}")]
    Invariant(String),
}

impl Error {
    /// Construct a [`Error::Protocol`] error.
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }

    /// Construct a [`Error::Config`] error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Construct a [`Error::Invariant`] error.
    pub fn invariant<S: Into<String>>(message: S) -> Self {
        Self::Invariant(message.into())
    }

    /// True if the underlying I/O error is a transient would-block/interrupt
    /// condition that a non-blocking engine should simply retry later.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::WouldBlock)
    }
}
