//! Per-connection configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::conn::Controller;
use crate::crypto::PublicKey;
use crate::keys::{CookieKeys, MinuteKeys};
use crate::proto::Metadata;
use crate::registry::{AllowAny, Registry};
use crate::vault::Vault;

const DEFAULT_MINUTE_KEY_PERIOD: Duration = Duration::from_secs(60);

/// Which end of the tunnel a connection plays, with everything that side
/// needs. Only [`Options::client`] and [`Options::server`] build this, so
/// side-specific collaborators are always present.
#[derive(Clone)]
pub(crate) enum ModeConfig {
    Client {
        server_key: PublicKey,
    },
    Server {
        cookie_keys: Arc<dyn CookieKeys>,
        registry: Arc<dyn Registry>,
    },
}

#[derive(Clone)]
pub struct Options {
    pub(crate) mode: ModeConfig,
    pub(crate) vault: Arc<dyn Vault>,
    pub(crate) metadata: Metadata,
    pub(crate) timeout: Option<Duration>,
    pub(crate) controller: Option<Controller>,
}

impl Options {
    /// Client-side options for dialling a server known by `server_key`.
    pub fn client(vault: Arc<dyn Vault>, server_key: PublicKey) -> Self {
        Self {
            mode: ModeConfig::Client { server_key },
            vault,
            metadata: Metadata::new(),
            timeout: None,
            controller: None,
        }
    }

    /// Server-side options. Cookies rotate on fresh minute keys and every
    /// client key is admitted until [`Options::cookie_keys`] and
    /// [`Options::registry`] say otherwise.
    pub fn server(vault: Arc<dyn Vault>) -> Self {
        Self {
            mode: ModeConfig::Server {
                cookie_keys: Arc::new(MinuteKeys::new(DEFAULT_MINUTE_KEY_PERIOD)),
                registry: Arc::new(AllowAny),
            },
            vault,
            metadata: Metadata::new(),
            timeout: None,
            controller: None,
        }
    }

    /// Metadata to offer the peer during the handshake.
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Deadline for connection establishment, handshake included.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Deliver asynchronous notifications to this controller instead of a
    /// per-connection default mailbox.
    pub fn controller(mut self, controller: Controller) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Cookie key source to share between connections (server side only).
    pub fn cookie_keys(mut self, keys: Arc<dyn CookieKeys>) -> Self {
        if let ModeConfig::Server { cookie_keys, .. } = &mut self.mode {
            *cookie_keys = keys;
        }
        self
    }

    /// Client-key admission policy (server side only).
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        if let ModeConfig::Server { registry: slot, .. } = &mut self.mode {
            *slot = registry;
        }
        self
    }
}
