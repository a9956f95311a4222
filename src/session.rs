//! Post-handshake data plane: authenticated message sealing with strictly
//! monotonic nonce counters.

use crypto_box::SalsaBox;

use crate::crypto::{self, PublicKey};
use crate::errors::{Error, Result};
use crate::nonce;
use crate::proto::data::Packet;
use crate::proto::Metadata;
use crate::Side;

/// A counter may never reach this value; hitting it is fatal.
const COUNT_LIMIT: u64 = u64::MAX;

/// The encrypted channel both handshakes converge on.
///
/// `c` is the next outbound message counter, `rc` the exact counter the next
/// inbound message must carry; a mismatch or a reused counter is fatal, which
/// is what gives the transport its strict in-order delivery.
pub struct Session {
    side: Side,
    boxer: SalsaBox,
    peer_key: PublicKey,
    c: u64,
    rc: u64,
    peer_metadata: Metadata,
}

impl Session {
    pub(crate) fn new(
        side: Side,
        boxer: SalsaBox,
        peer_key: PublicKey,
        c: u64,
        rc: u64,
        peer_metadata: Metadata,
    ) -> Self {
        Self {
            side,
            boxer,
            peer_key,
            c,
            rc,
            peer_metadata,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// The peer's long-term public key: the vouched client key on the
    /// server side, the dialled server key on the client side.
    pub fn peer_key(&self) -> &PublicKey {
        &self.peer_key
    }

    pub fn peer_metadata(&self) -> &Metadata {
        &self.peer_metadata
    }

    /// Seal one application message into a Msg packet.
    pub fn seal(&mut self, payload: &[u8]) -> Result<Packet> {
        if self.c == COUNT_LIMIT {
            return Err(Error::CountLimit);
        }
        let n = self.c;
        let sealed = crypto::seal(&self.boxer, &nonce::msg(self.side, n), payload)?;
        self.c += 1;
        Ok(Packet::Msg { n, sealed })
    }

    /// Open one inbound Msg packet; `n` must be exactly the expected
    /// counter.
    pub fn open(&mut self, n: u64, sealed: &[u8]) -> Result<Vec<u8>> {
        if self.rc == COUNT_LIMIT {
            return Err(Error::CountLimit);
        }
        if n != self.rc {
            return Err(Error::BadCount);
        }
        let payload = crypto::open(&self.boxer, &nonce::msg(self.side.opposite(), n), sealed)?;
        self.rc += 1;
        Ok(payload)
    }
}
