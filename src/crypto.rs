//! Curve25519 key material and the two NaCl primitives the wire uses:
//! `box` (Curve25519-XSalsa20-Poly1305) and `secretbox` (XSalsa20-Poly1305).

use std::fmt;

use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::SalsaBox;
use rand::RngCore;
use rand_core::OsRng;
use xsalsa20poly1305::aead::KeyInit;
use xsalsa20poly1305::XSalsa20Poly1305;

use crate::errors::{Error, Result};
use crate::nonce::NONCE_SIZE;

pub const KEY_SIZE: usize = 32;

/// A Curve25519 public key, long-term or ephemeral.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    pub const fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl From<[u8; KEY_SIZE]> for PublicKey {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", hex::encode(&self.0[..6]))
    }
}

/// A Curve25519 secret key. `Debug` never prints the scalar.
#[derive(Clone)]
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
    inner: crypto_box::SecretKey,
}

impl SecretKey {
    /// Fresh key from the system RNG.
    pub fn gen() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self {
            bytes,
            inner: crypto_box::SecretKey::from(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.bytes
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(*self.inner.public_key().as_bytes())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([redacted])")
    }
}

/// Precompute the box shared between `peer` and `secret`.
pub fn salsa_box(peer: &PublicKey, secret: &SecretKey) -> SalsaBox {
    SalsaBox::new(&crypto_box::PublicKey::from(peer.0), &secret.inner)
}

pub fn seal(boxer: &SalsaBox, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    boxer
        .encrypt(GenericArray::from_slice(nonce), plaintext)
        .map_err(|_| Error::Verify)
}

pub fn open(boxer: &SalsaBox, nonce: &[u8; NONCE_SIZE], sealed: &[u8]) -> Result<Vec<u8>> {
    boxer
        .decrypt(GenericArray::from_slice(nonce), sealed)
        .map_err(|_| Error::Verify)
}

pub fn secretbox_seal(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    XSalsa20Poly1305::new(GenericArray::from_slice(key))
        .encrypt(GenericArray::from_slice(nonce), plaintext)
        .map_err(|_| Error::Verify)
}

pub fn secretbox_open(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    sealed: &[u8],
) -> Result<Vec<u8>> {
    XSalsa20Poly1305::new(GenericArray::from_slice(key))
        .decrypt(GenericArray::from_slice(nonce), sealed)
        .map_err(|_| Error::Verify)
}
