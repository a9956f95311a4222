use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Everything that can go wrong on a tunnel.
///
/// Apart from `Timeout` on a receive, `TooLarge` and `NotOwner`, every
/// variant is fatal: the connection terminates and all pending receivers
/// observe the same value. The i/o cause is reference-counted so the value
/// stays cloneable for that fan-out.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The peer or the local side closed the transport, or the connection
    /// no longer exists.
    #[error("connection closed")]
    Closed,
    /// The underlying byte-stream failed.
    #[error("transport error: {0}")]
    Io(Arc<io::Error>),
    /// No recent minute key opens the presented cookie.
    #[error("cookie rejected")]
    Cookie,
    /// A box failed to authenticate.
    #[error("box verification failed")]
    Verify,
    /// The registry refused the client's long-term key.
    #[error("client key rejected")]
    Rejected,
    /// A frame arrived whose type is not the one the current state expects.
    #[error("unexpected {got} packet in state {state}")]
    Unexpected {
        got: &'static str,
        state: &'static str,
    },
    /// A frame or metadata list failed to decode.
    #[error("malformed packet")]
    Codec,
    /// The handshake deadline or a receive deadline expired.
    #[error("timed out")]
    Timeout,
    /// An inbound message carried a counter other than the expected one.
    #[error("message counter out of sequence")]
    BadCount,
    /// A nonce counter reached its ceiling.
    #[error("nonce counter exhausted")]
    CountLimit,
    /// The message, key or value does not fit its length field.
    #[error("message too large")]
    TooLarge,
    /// The caller is not the controlling process of the connection.
    #[error("not the controlling process")]
    NotOwner,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        // read_exact reports a vanished peer as an unexpected EOF
        match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::Closed,
            _ => Error::Io(Arc::new(e)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
