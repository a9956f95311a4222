//! The listening endpoint.

use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, trace};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout_at, Instant};

use crate::conn::{establish, Connection};
use crate::errors::{Error, Result};
use crate::options::Options;

/// A listening endpoint handing out secured connections.
pub struct Listener {
    inner: TcpListener,
    opts: Options,
}

/// Bind `port` on all interfaces.
pub async fn listen(port: u16, opts: Options) -> Result<Listener> {
    let inner = TcpListener::bind(("0.0.0.0", port)).await?;
    debug!("listening on {:?}", inner.local_addr());
    Ok(Listener { inner, opts })
}

/// Listen on an explicit address, `127.0.0.1:0` included.
pub async fn listen_on(addr: SocketAddr, opts: Options) -> Result<Listener> {
    let inner = TcpListener::bind(addr).await?;
    debug!("listening on {:?}", inner.local_addr());
    Ok(Listener { inner, opts })
}

impl Listener {
    /// Accept one connection and run the server handshake on it. The
    /// timeout (falling back to the listener options' timeout) covers both
    /// the wait for a peer and its handshake.
    pub async fn accept(&self, timeout: Option<Duration>) -> Result<Connection> {
        let deadline = timeout
            .or(self.opts.timeout)
            .map(|t| Instant::now() + t);
        let (stream, peer) = self.wait(deadline).await?;
        trace!("accepted {peer}");
        establish(stream, self.opts.clone(), deadline).await
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    async fn wait(&self, deadline: Option<Instant>) -> Result<(TcpStream, SocketAddr)> {
        let accepted = match deadline {
            Some(d) => timeout_at(d, self.inner.accept())
                .await
                .map_err(|_| Error::Timeout)?,
            None => self.inner.accept().await,
        };
        Ok(accepted?)
    }
}
