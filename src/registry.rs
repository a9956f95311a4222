//! Admission control for presenting client keys.

use std::net::SocketAddr;

use rustc_hash::FxHashSet;

use crate::crypto::PublicKey;

/// Decides whether a client long-term key may establish a connection on a
/// given local endpoint. A `false` answer aborts the handshake.
pub trait Registry: Send + Sync {
    fn verify(&self, local: SocketAddr, client: &PublicKey) -> bool;
}

/// Accepts every presenting key.
pub struct AllowAny;

impl Registry for AllowAny {
    fn verify(&self, _local: SocketAddr, _client: &PublicKey) -> bool {
        true
    }
}

/// Accepts exactly the keys it was loaded with.
pub struct Keyring {
    keys: FxHashSet<PublicKey>,
}

impl Keyring {
    pub fn new(keys: impl IntoIterator<Item = PublicKey>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }
}

impl Registry for Keyring {
    fn verify(&self, _local: SocketAddr, client: &PublicKey) -> bool {
        self.keys.contains(client)
    }
}
