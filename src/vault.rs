//! The vault holds an endpoint's long-term secret key and performs every
//! box operation that touches it. Each connection is handed a vault as a
//! capability; the secret itself never enters connection state.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::RngCore;
use rand_core::OsRng;

use crate::crypto::{self, PublicKey, SecretKey};
use crate::errors::Result;
use crate::nonce::NONCE_SIZE;

/// Length of the random tail of a long-term nonce.
pub const TAIL_SIZE: usize = 16;

pub trait Vault: Send + Sync {
    /// Box `plaintext` to `peer` under the long-term secret.
    fn seal(&self, plaintext: &[u8], nonce: &[u8; NONCE_SIZE], peer: &PublicKey)
        -> Result<Vec<u8>>;

    /// Open a box from `peer` addressed to the long-term key.
    fn open(&self, sealed: &[u8], nonce: &[u8; NONCE_SIZE], peer: &PublicKey) -> Result<Vec<u8>>;

    /// The long-term public key.
    fn public_key(&self) -> PublicKey;

    /// A 16-byte nonce tail that never repeats for the vault's lifetime.
    fn safe_nonce(&self) -> [u8; TAIL_SIZE];
}

/// In-process vault over a single long-term keypair.
pub struct KeyVault {
    secret: SecretKey,
    public: PublicKey,
    counter: AtomicU64,
}

impl KeyVault {
    pub fn new(secret: SecretKey) -> Self {
        let public = secret.public();
        Self {
            secret,
            public,
            counter: AtomicU64::new(0),
        }
    }

    /// Vault with a freshly generated long-term keypair.
    pub fn gen() -> Self {
        Self::new(SecretKey::gen())
    }
}

impl Vault for KeyVault {
    fn seal(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
        peer: &PublicKey,
    ) -> Result<Vec<u8>> {
        crypto::seal(&crypto::salsa_box(peer, &self.secret), nonce, plaintext)
    }

    fn open(&self, sealed: &[u8], nonce: &[u8; NONCE_SIZE], peer: &PublicKey) -> Result<Vec<u8>> {
        crypto::open(&crypto::salsa_box(peer, &self.secret), nonce, sealed)
    }

    fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Monotonic 8-byte counter followed by 8 random bytes. The counter
    /// half alone makes the tail non-repeating for this vault's lifetime.
    fn safe_nonce(&self) -> [u8; TAIL_SIZE] {
        let mut tail = [0u8; TAIL_SIZE];
        tail[..8].copy_from_slice(&self.counter.fetch_add(1, Ordering::Relaxed).to_be_bytes());
        OsRng.fill_bytes(&mut tail[8..]);
        tail
    }
}
