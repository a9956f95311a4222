//! A CurveCP-style encrypted message tunnel over TCP.
//!
//! Two endpoints holding long-term Curve25519 keys run a mutually
//! authenticated handshake (Hello → Cookie → Vouch/Initiate → Ready) built
//! from NaCl boxes, then exchange length-prefixed, authenticated,
//! strictly-ordered application messages under per-connection ephemeral
//! keys.
//!
//! ```no_run
//! use std::sync::Arc;
//! use curvetun::{KeyVault, Options, Vault};
//!
//! # async fn demo() -> curvetun::Result<()> {
//! let server_vault = Arc::new(KeyVault::gen());
//! let server_key = server_vault.public_key();
//!
//! let listener = curvetun::listen(4433, Options::server(server_vault)).await?;
//! let client_vault: Arc<dyn Vault> = Arc::new(KeyVault::gen());
//!
//! let conn = curvetun::connect(
//!     ("127.0.0.1", 4433),
//!     Options::client(client_vault, server_key),
//! )
//! .await?;
//! conn.send(b"hello").await?;
//! # let _ = listener;
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod errors;
pub mod handshake;
pub mod inout;
pub mod keys;
pub mod nonce;
pub mod proto;
pub mod registry;
pub mod session;
pub mod vault;

mod conn;
mod listener;
mod options;

use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::{timeout_at, Instant};

pub use conn::{AsyncRef, Connection, Controller, Event, Events};
pub use crypto::{PublicKey, SecretKey};
pub use errors::{Error, Result};
pub use keys::{CookieKeys, MinuteKeys};
pub use listener::{listen, listen_on, Listener};
pub use options::Options;
pub use proto::Metadata;
pub use registry::{AllowAny, Keyring, Registry};
pub use vault::{KeyVault, Vault};

/// Which end of the tunnel we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Dial `addr` and run the client handshake. The options' timeout covers
/// the TCP connect and the handshake together.
pub async fn connect(addr: impl ToSocketAddrs, opts: Options) -> Result<Connection> {
    let deadline = opts.timeout.map(|t| Instant::now() + t);
    let stream = match deadline {
        Some(d) => timeout_at(d, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)??,
        None => TcpStream::connect(addr).await?,
    };
    conn::establish(stream, opts, deadline).await
}

/// Run the handshake over an already-connected byte stream; the options
/// decide which side we play.
pub async fn start(stream: TcpStream, opts: Options) -> Result<Connection> {
    let deadline = opts.timeout.map(|t| Instant::now() + t);
    conn::establish(stream, opts, deadline).await
}
