//! Wire nonce construction.
//!
//! Two families, both 24 bytes. Short-term nonces pair a 16-byte packet
//! prefix with a big-endian message counter; long-term nonces pair an
//! 8-byte prefix with a 16-byte single-use tail obtained from the vault.
//! The exact byte sequences are part of the wire contract.

use crate::Side;

pub const NONCE_SIZE: usize = 24;

/// Nonce for the Hello box at counter `n` (always 0 on the wire).
pub fn hello(side: Side, n: u64) -> [u8; NONCE_SIZE] {
    match side {
        Side::Client => short_term(b"CurveCP-client-H", n),
        Side::Server => short_term(b"CurveCP-server-H", n),
    }
}

/// Nonce for the Initiate box at counter `n` (always 1 on the wire).
pub fn initiate(side: Side, n: u64) -> [u8; NONCE_SIZE] {
    match side {
        Side::Client => short_term(b"CurveCP-client-I", n),
        Side::Server => short_term(b"CurveCP-server-I", n),
    }
}

/// Nonce for an application message box at counter `n`.
pub fn msg(side: Side, n: u64) -> [u8; NONCE_SIZE] {
    match side {
        Side::Client => short_term(b"CurveCP-client-M", n),
        Side::Server => short_term(b"CurveCP-server-M", n),
    }
}

/// Nonce for the Ready box; the server is the only sender of Ready frames.
pub fn ready(n: u64) -> [u8; NONCE_SIZE] {
    short_term(b"CurveCP-server-R", n)
}

/// Nonce sealing the minute-key cookie interior.
pub fn minute_key(tail: &[u8; 16]) -> [u8; NONCE_SIZE] {
    long_term(b"minute-k", tail)
}

/// Nonce for the client's long-term vouch over its ephemeral key.
pub fn vouch(tail: &[u8; 16]) -> [u8; NONCE_SIZE] {
    long_term(b"CurveCPV", tail)
}

/// Nonce for the server's long-term box around the cookie.
pub fn cookie(tail: &[u8; 16]) -> [u8; NONCE_SIZE] {
    long_term(b"CurveCPK", tail)
}

fn short_term(prefix: &[u8; 16], n: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..16].copy_from_slice(prefix);
    nonce[16..].copy_from_slice(&n.to_be_bytes());
    nonce
}

fn long_term(prefix: &[u8; 8], tail: &[u8; 16]) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(prefix);
    nonce[8..].copy_from_slice(tail);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::client_hello(hello(Side::Client, 0), *b"CurveCP-client-H", 0)]
    #[case::server_hello(hello(Side::Server, 0), *b"CurveCP-server-H", 0)]
    #[case::client_initiate(initiate(Side::Client, 1), *b"CurveCP-client-I", 1)]
    #[case::server_initiate(initiate(Side::Server, 1), *b"CurveCP-server-I", 1)]
    #[case::client_msg(msg(Side::Client, 2), *b"CurveCP-client-M", 2)]
    #[case::server_msg(msg(Side::Server, 3), *b"CurveCP-server-M", 3)]
    #[case::ready(ready(2), *b"CurveCP-server-R", 2)]
    fn short_term_layout(#[case] nonce: [u8; NONCE_SIZE], #[case] prefix: [u8; 16], #[case] n: u64) {
        assert_eq!(nonce[..16], prefix);
        assert_eq!(nonce[16..], n.to_be_bytes());
    }

    #[rstest]
    #[case::minute(minute_key(&[0xAB; 16]), *b"minute-k")]
    #[case::vouch(vouch(&[0xAB; 16]), *b"CurveCPV")]
    #[case::cookie(cookie(&[0xAB; 16]), *b"CurveCPK")]
    fn long_term_layout(#[case] nonce: [u8; NONCE_SIZE], #[case] prefix: [u8; 8]) {
        assert_eq!(nonce[..8], prefix);
        assert_eq!(nonce[8..], [0xAB; 16]);
    }

    #[test]
    fn counter_is_big_endian() {
        let nonce = msg(Side::Client, 0x0102_0304_0506_0708);
        assert_eq!(nonce[16..], [1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
