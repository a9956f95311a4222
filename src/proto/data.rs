//! The five wire frames, each tagged by an 8-byte magic prefix.
//!
//! | Frame  | Body |
//! |--------|------|
//! | Hello  | `EC(32) ‖ N(u64 BE) ‖ box(80)` |
//! | Cookie | `tail(16) ‖ box(144)` |
//! | Vouch  | `kookie(96) ‖ N(u64 BE) ‖ box(≥112)` |
//! | Ready  | `N(u64 BE) ‖ box` |
//! | Msg    | `N(u64 BE) ‖ box` |
//!
//! Frames with an unknown prefix do not decode; the state machines treat
//! that as fatal in every state.

use crate::crypto::PublicKey;
use crate::errors::{Error, Result};
use crate::proto::take;

pub mod magic {
    pub const HELLO: [u8; 8] = [0x6C, 0x09, 0xAF, 0xB2, 0x8A, 0xA9, 0xFA, 0xFC];
    pub const COOKIE: [u8; 8] = [0x1C, 0x45, 0xDC, 0xB9, 0x41, 0xC0, 0xE3, 0xF6];
    pub const VOUCH: [u8; 8] = [0x6C, 0x09, 0xAF, 0xB2, 0x8A, 0xA9, 0xFA, 0xFD];
    pub const READY: [u8; 8] = [0x6D, 0x09, 0xAF, 0xB2, 0x8A, 0xA9, 0xFA, 0xFD];
    pub const MSG: [u8; 8] = [0x6D, 0x1B, 0x39, 0xCB, 0xF6, 0x5A, 0x11, 0xB4];
}

/// Poly1305 tag length.
pub const BOX_OVERHEAD: usize = 16;
/// The opaque cookie: 16-byte minute nonce tail plus a secretbox over
/// `EC(32) ‖ ESs(32)`.
pub const KOOKIE_SIZE: usize = 96;
/// Magic, counter and tag bytes around an application payload.
pub const MSG_OVERHEAD: usize = 8 + 8 + BOX_OVERHEAD;

const HELLO_BOX_SIZE: usize = 64 + BOX_OVERHEAD;
const COOKIE_BOX_SIZE: usize = 32 + KOOKIE_SIZE + BOX_OVERHEAD;
const MIN_VOUCH_BOX_SIZE: usize = 32 + 16 + 48 + BOX_OVERHEAD;

#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Packet {
    Hello {
        eph: PublicKey,
        n: u64,
        sealed: Vec<u8>,
    },
    Cookie {
        tail: [u8; 16],
        sealed: Vec<u8>,
    },
    Vouch {
        kookie: [u8; KOOKIE_SIZE],
        n: u64,
        sealed: Vec<u8>,
    },
    Ready {
        n: u64,
        sealed: Vec<u8>,
    },
    Msg {
        n: u64,
        sealed: Vec<u8>,
    },
}

impl Packet {
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Hello { eph, n, sealed } => {
                let mut out = Vec::with_capacity(8 + 32 + 8 + sealed.len());
                out.extend_from_slice(&magic::HELLO);
                out.extend_from_slice(eph.as_bytes());
                out.extend_from_slice(&n.to_be_bytes());
                out.extend_from_slice(sealed);
                out
            }
            Packet::Cookie { tail, sealed } => {
                let mut out = Vec::with_capacity(8 + 16 + sealed.len());
                out.extend_from_slice(&magic::COOKIE);
                out.extend_from_slice(tail);
                out.extend_from_slice(sealed);
                out
            }
            Packet::Vouch { kookie, n, sealed } => {
                let mut out = Vec::with_capacity(8 + KOOKIE_SIZE + 8 + sealed.len());
                out.extend_from_slice(&magic::VOUCH);
                out.extend_from_slice(kookie);
                out.extend_from_slice(&n.to_be_bytes());
                out.extend_from_slice(sealed);
                out
            }
            Packet::Ready { n, sealed } | Packet::Msg { n, sealed } => {
                let mut out = Vec::with_capacity(8 + 8 + sealed.len());
                out.extend_from_slice(match self {
                    Packet::Ready { .. } => &magic::READY,
                    _ => &magic::MSG,
                });
                out.extend_from_slice(&n.to_be_bytes());
                out.extend_from_slice(sealed);
                out
            }
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Packet> {
        let mut buf = frame;
        let mut tag = [0u8; 8];
        tag.copy_from_slice(take(&mut buf, 8)?);

        match tag {
            magic::HELLO => {
                let eph = take_key(&mut buf)?;
                let n = take_u64(&mut buf)?;
                let sealed = buf.to_vec();
                if sealed.len() != HELLO_BOX_SIZE {
                    return Err(Error::Codec);
                }
                Ok(Packet::Hello { eph, n, sealed })
            }
            magic::COOKIE => {
                let mut tail = [0u8; 16];
                tail.copy_from_slice(take(&mut buf, 16)?);
                let sealed = buf.to_vec();
                if sealed.len() != COOKIE_BOX_SIZE {
                    return Err(Error::Codec);
                }
                Ok(Packet::Cookie { tail, sealed })
            }
            magic::VOUCH => {
                let mut kookie = [0u8; KOOKIE_SIZE];
                kookie.copy_from_slice(take(&mut buf, KOOKIE_SIZE)?);
                let n = take_u64(&mut buf)?;
                let sealed = buf.to_vec();
                if sealed.len() < MIN_VOUCH_BOX_SIZE {
                    return Err(Error::Codec);
                }
                Ok(Packet::Vouch { kookie, n, sealed })
            }
            magic::READY | magic::MSG => {
                let n = take_u64(&mut buf)?;
                let sealed = buf.to_vec();
                if sealed.len() < BOX_OVERHEAD {
                    return Err(Error::Codec);
                }
                match tag {
                    magic::READY => Ok(Packet::Ready { n, sealed }),
                    _ => Ok(Packet::Msg { n, sealed }),
                }
            }
            _ => Err(Error::Codec),
        }
    }
}

fn take_u64(buf: &mut &[u8]) -> Result<u64> {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(take(buf, 8)?);
    Ok(u64::from_be_bytes(bytes))
}

fn take_key(buf: &mut &[u8]) -> Result<PublicKey> {
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(take(buf, 32)?);
    Ok(PublicKey::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn hello_golden() {
        let packet = Packet::Hello {
            eph: PublicKey::new([5; 32]),
            n: 0,
            sealed: vec![0xAA; HELLO_BOX_SIZE],
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 8 + 32 + 8 + 80);
        assert_eq!(bytes[..8], [0x6C, 0x09, 0xAF, 0xB2, 0x8A, 0xA9, 0xFA, 0xFC]);
        assert_eq!(bytes[8..40], [5; 32]);
        assert_eq!(bytes[40..48], [0; 8]);
        assert_eq!(bytes[48..], [0xAA; 80]);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[rstest]
    #[case::hello(Packet::Hello { eph: PublicKey::new([1; 32]), n: 0, sealed: vec![2; HELLO_BOX_SIZE] })]
    #[case::cookie(Packet::Cookie { tail: [3; 16], sealed: vec![4; COOKIE_BOX_SIZE] })]
    #[case::vouch(Packet::Vouch { kookie: [5; KOOKIE_SIZE], n: 1, sealed: vec![6; MIN_VOUCH_BOX_SIZE + 13] })]
    #[case::ready(Packet::Ready { n: 2, sealed: vec![7; 17] })]
    #[case::msg(Packet::Msg { n: 3, sealed: vec![8; 21] })]
    fn round_trip(#[case] packet: Packet) {
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn unknown_magic_is_an_error() {
        let mut bytes = Packet::Msg {
            n: 3,
            sealed: vec![0; 17],
        }
        .encode();
        bytes[0] = 0xFF;
        assert!(matches!(Packet::decode(&bytes), Err(Error::Codec)));
    }

    #[rstest]
    #[case::empty(&[][..])]
    #[case::short_magic(&magic::MSG[..4])]
    #[case::hello_box_too_short(&Packet::Hello { eph: PublicKey::new([0; 32]), n: 0, sealed: vec![0; 79] }.encode())]
    #[case::cookie_box_wrong_size(&Packet::Cookie { tail: [0; 16], sealed: vec![0; 100] }.encode())]
    #[case::vouch_box_below_floor(&Packet::Vouch { kookie: [0; KOOKIE_SIZE], n: 1, sealed: vec![0; 111] }.encode())]
    #[case::msg_below_tag(&Packet::Msg { n: 2, sealed: vec![0; 15] }.encode())]
    fn malformed_frames_rejected(#[case] bytes: &[u8]) {
        assert!(matches!(Packet::decode(bytes), Err(Error::Codec)));
    }

    #[test]
    fn vouch_and_ready_magics_differ_by_first_byte() {
        // the two 0xFD-suffixed prefixes must stay distinct
        assert_ne!(magic::VOUCH, magic::READY);
        assert_eq!(magic::VOUCH[1..], magic::READY[1..]);
    }
}
