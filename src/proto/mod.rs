//! Wire protocol: the five frames and the metadata list codec.

use crate::errors::{Error, Result};

pub mod data;

/// Ordered key/value byte-string pairs exchanged once during the handshake.
pub type Metadata = Vec<(Vec<u8>, Vec<u8>)>;

pub const MAX_METADATA_ENTRIES: usize = 255;
pub const MAX_KEY_LEN: usize = 255;
pub const MAX_VALUE_LEN: usize = 65535;

/// Encode a metadata list as `count(u8) ‖ {klen(u8) ‖ key ‖ vlen(u16 BE) ‖ value}*`.
///
/// The encoding always carries the count byte; the Initiate packet omits the
/// whole block instead when a client has nothing to send, which is what the
/// server keys its Ready suppression on.
pub fn encode_metadata(md: &Metadata) -> Result<Vec<u8>> {
    if md.len() > MAX_METADATA_ENTRIES {
        return Err(Error::TooLarge);
    }
    let mut out = vec![md.len() as u8];
    for (key, value) in md {
        if key.len() > MAX_KEY_LEN || value.len() > MAX_VALUE_LEN {
            return Err(Error::TooLarge);
        }
        out.push(key.len() as u8);
        out.extend_from_slice(key);
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value);
    }
    Ok(out)
}

/// Decode a metadata list; no bytes at all decode to the empty list.
pub fn decode_metadata(buf: &[u8]) -> Result<Metadata> {
    if buf.is_empty() {
        return Ok(Metadata::new());
    }
    let mut buf = buf;
    let count = take(&mut buf, 1)?[0];
    let mut md = Metadata::with_capacity(count as usize);
    for _ in 0..count {
        let klen = take(&mut buf, 1)?[0] as usize;
        let key = take(&mut buf, klen)?.to_vec();
        let vlen = take(&mut buf, 2)?;
        let vlen = u16::from_be_bytes([vlen[0], vlen[1]]) as usize;
        let value = take(&mut buf, vlen)?.to_vec();
        md.push((key, value));
    }
    if !buf.is_empty() {
        return Err(Error::Codec);
    }
    Ok(md)
}

pub(crate) fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(Error::Codec);
    }
    let (head, rest) = buf.split_at(n);
    *buf = rest;
    Ok(head)
}
