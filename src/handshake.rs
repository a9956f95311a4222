//! The handshake, expressed as two I/O-free state machines.
//!
//! Decoded packets go in, frames to transmit come out; sockets, timers and
//! the starter's reply all stay with the connection actor. The exchange has
//! no i/o of its own and can run against itself in tests.
//!
//! ```text
//! Client                                 Server
//!   |-- Hello (EC, box[64 zeroes]) ------->|
//!   |<-- Cookie (ES, kookie) --------------|   (no per-connection state kept)
//!   |-- Vouch (kookie, C, vouch, md) ----->|
//!   |<-- Ready (md) -- only if the client sent metadata
//!   |<============ Msg frames ============>|
//! ```

use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, trace};

use crate::crypto::{self, PublicKey, SecretKey};
use crate::errors::{Error, Result};
use crate::inout::MAX_FRAME_SIZE;
use crate::keys::CookieKeys;
use crate::nonce;
use crate::proto::data::{Packet, KOOKIE_SIZE};
use crate::proto::{self, Metadata};
use crate::registry::Registry;
use crate::session::Session;
use crate::vault::Vault;
use crate::Side;

/// What a state machine wants done after absorbing one packet.
pub enum Step {
    /// Transmit this frame and keep waiting.
    Send(Vec<u8>),
    /// Handshake complete.
    Done(Complete),
}

pub struct Complete {
    pub session: Session,
    /// Final frame to transmit before the session goes live, when the
    /// choreography ends on our own turn.
    pub reply: Option<Vec<u8>>,
}

/// Client side: Hello out, Cookie in, Vouch out, maybe Ready in.
pub struct ClientHandshake {
    vault: Arc<dyn Vault>,
    server_key: PublicKey,
    eph_public: PublicKey,
    eph_secret: SecretKey,
    metadata: Metadata,
    state: ClientState,
}

#[derive(strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
enum ClientState {
    AwaitingCookie,
    AwaitingReady { boxer: crypto_box::SalsaBox },
    Done,
}

impl ClientHandshake {
    /// Start a handshake towards a server we know by `server_key`; returns
    /// the machine and the Hello frame to transmit.
    pub fn new(
        vault: Arc<dyn Vault>,
        server_key: PublicKey,
        metadata: Metadata,
    ) -> Result<(Self, Vec<u8>)> {
        let eph_secret = SecretKey::gen();
        let eph_public = eph_secret.public();

        let sealed = crypto::seal(
            &crypto::salsa_box(&server_key, &eph_secret),
            &nonce::hello(Side::Client, 0),
            &[0u8; 64],
        )?;
        let hello = Packet::Hello {
            eph: eph_public,
            n: 0,
            sealed,
        }
        .encode();
        trace!("[{eph_public:?}] hello -> {server_key:?}");

        Ok((
            Self {
                vault,
                server_key,
                eph_public,
                eph_secret,
                metadata,
                state: ClientState::AwaitingCookie,
            },
            hello,
        ))
    }

    pub fn step(&mut self, packet: Packet) -> Result<Step> {
        match (mem::replace(&mut self.state, ClientState::Done), packet) {
            (ClientState::AwaitingCookie, Packet::Cookie { tail, sealed }) => {
                self.on_cookie(tail, sealed)
            }
            (ClientState::AwaitingReady { boxer }, Packet::Ready { n, sealed }) => {
                self.on_ready(boxer, n, sealed)
            }
            (state, packet) => Err(Error::Unexpected {
                got: packet.kind(),
                state: (&state).into(),
            }),
        }
    }

    fn on_cookie(&mut self, tail: [u8; 16], sealed: Vec<u8>) -> Result<Step> {
        // plaintext: ES(32) ‖ kookie(96), boxed from the server's long-term key
        let plain = crypto::open(
            &crypto::salsa_box(&self.server_key, &self.eph_secret),
            &nonce::cookie(&tail),
            &sealed,
        )?;
        if plain.len() != 32 + KOOKIE_SIZE {
            return Err(Error::Codec);
        }
        let mut server_eph = [0u8; 32];
        server_eph.copy_from_slice(&plain[..32]);
        let server_eph = PublicKey::new(server_eph);
        let mut kookie = [0u8; KOOKIE_SIZE];
        kookie.copy_from_slice(&plain[32..]);

        // our long-term key endorses the ephemeral one
        let vouch_tail = self.vault.safe_nonce();
        let vouch = self.vault.seal(
            self.eph_public.as_bytes(),
            &nonce::vouch(&vouch_tail),
            &self.server_key,
        )?;

        let mut initiate_plain = Vec::with_capacity(32 + 16 + vouch.len());
        initiate_plain.extend_from_slice(self.vault.public_key().as_bytes());
        initiate_plain.extend_from_slice(&vouch_tail);
        initiate_plain.extend_from_slice(&vouch);
        if !self.metadata.is_empty() {
            initiate_plain.extend_from_slice(&proto::encode_metadata(&self.metadata)?);
        }

        let boxer = crypto::salsa_box(&server_eph, &self.eph_secret);
        let sealed = crypto::seal(&boxer, &nonce::initiate(Side::Client, 1), &initiate_plain)?;
        let frame = Packet::Vouch {
            kookie,
            n: 1,
            sealed,
        }
        .encode();
        if frame.len() > MAX_FRAME_SIZE {
            return Err(Error::TooLarge);
        }
        trace!("[{:?}] vouch -> {:?}", self.eph_public, self.server_key);

        if self.metadata.is_empty() {
            // the server answers an empty metadata list with silence, not
            // Ready; its first message will arrive at counter 3 as if the
            // Ready slot had been used
            let session = Session::new(
                Side::Client,
                boxer,
                self.server_key,
                2,
                3,
                Metadata::new(),
            );
            Ok(Step::Done(Complete {
                session,
                reply: Some(frame),
            }))
        } else {
            self.state = ClientState::AwaitingReady { boxer };
            Ok(Step::Send(frame))
        }
    }

    fn on_ready(&mut self, boxer: crypto_box::SalsaBox, n: u64, sealed: Vec<u8>) -> Result<Step> {
        if n != 2 {
            return Err(Error::BadCount);
        }
        let plain = crypto::open(&boxer, &nonce::ready(2), &sealed)?;
        let peer_metadata = proto::decode_metadata(&plain)?;
        debug!("[{:?}] ready, {} metadata entries", self.eph_public, peer_metadata.len());

        let session = Session::new(Side::Client, boxer, self.server_key, 2, 3, peer_metadata);
        Ok(Step::Done(Complete {
            session,
            reply: None,
        }))
    }
}

/// Server side: Hello in, Cookie out, Vouch in, maybe Ready out.
///
/// Between Cookie and Vouch the machine deliberately holds no key material;
/// the ephemeral pair exists only inside the cookie the client must return.
pub struct ServerHandshake {
    vault: Arc<dyn Vault>,
    cookie_keys: Arc<dyn CookieKeys>,
    registry: Arc<dyn Registry>,
    local: SocketAddr,
    metadata: Metadata,
    state: ServerState,
}

#[derive(strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
enum ServerState {
    AwaitingHello,
    AwaitingVouch,
    Done,
}

impl ServerHandshake {
    pub fn new(
        vault: Arc<dyn Vault>,
        cookie_keys: Arc<dyn CookieKeys>,
        registry: Arc<dyn Registry>,
        local: SocketAddr,
        metadata: Metadata,
    ) -> Self {
        Self {
            vault,
            cookie_keys,
            registry,
            local,
            metadata,
            state: ServerState::AwaitingHello,
        }
    }

    pub fn step(&mut self, packet: Packet) -> Result<Step> {
        match (mem::replace(&mut self.state, ServerState::Done), packet) {
            (ServerState::AwaitingHello, Packet::Hello { eph, n, sealed }) => {
                self.on_hello(eph, n, sealed)
            }
            (ServerState::AwaitingVouch, Packet::Vouch { kookie, n, sealed }) => {
                self.on_vouch(kookie, n, sealed)
            }
            (state, packet) => Err(Error::Unexpected {
                got: packet.kind(),
                state: (&state).into(),
            }),
        }
    }

    fn on_hello(&mut self, client_eph: PublicKey, n: u64, sealed: Vec<u8>) -> Result<Step> {
        if n != 0 {
            return Err(Error::BadCount);
        }
        let plain = self
            .vault
            .open(&sealed, &nonce::hello(Side::Client, 0), &client_eph)?;
        if plain[..] != [0u8; 64][..] {
            return Err(Error::Verify);
        }
        trace!("[{client_eph:?}] hello accepted");

        let eph_secret = SecretKey::gen();
        let eph_public = eph_secret.public();

        // seal (EC ‖ ESs) to ourselves under the current minute key; the
        // pair survives only inside this kookie
        let mut cookie_plain = Vec::with_capacity(64);
        cookie_plain.extend_from_slice(client_eph.as_bytes());
        cookie_plain.extend_from_slice(&eph_secret.to_bytes());

        let minute_tail = self.vault.safe_nonce();
        let inner = crypto::secretbox_seal(
            &self.cookie_keys.current_key(),
            &nonce::minute_key(&minute_tail),
            &cookie_plain,
        )?;
        let mut kookie = Vec::with_capacity(KOOKIE_SIZE);
        kookie.extend_from_slice(&minute_tail);
        kookie.extend_from_slice(&inner);

        let mut box_plain = Vec::with_capacity(32 + KOOKIE_SIZE);
        box_plain.extend_from_slice(eph_public.as_bytes());
        box_plain.extend_from_slice(&kookie);

        let tail = self.vault.safe_nonce();
        let sealed = self
            .vault
            .seal(&box_plain, &nonce::cookie(&tail), &client_eph)?;

        self.state = ServerState::AwaitingVouch;
        Ok(Step::Send(Packet::Cookie { tail, sealed }.encode()))
    }

    fn on_vouch(&mut self, kookie: [u8; KOOKIE_SIZE], n: u64, sealed: Vec<u8>) -> Result<Step> {
        if n != 1 {
            return Err(Error::BadCount);
        }

        // recover our ephemeral pair from the kookie, trying every minute
        // key still considered valid
        let mut minute_tail = [0u8; 16];
        minute_tail.copy_from_slice(&kookie[..16]);
        let minute_nonce = nonce::minute_key(&minute_tail);
        let cookie_plain = self
            .cookie_keys
            .recent_keys()
            .iter()
            .find_map(|key| crypto::secretbox_open(key, &minute_nonce, &kookie[16..]).ok())
            .ok_or(Error::Cookie)?;
        if cookie_plain.len() != 64 {
            return Err(Error::Cookie);
        }
        let mut client_eph = [0u8; 32];
        client_eph.copy_from_slice(&cookie_plain[..32]);
        let client_eph = PublicKey::new(client_eph);
        let mut eph_secret = [0u8; 32];
        eph_secret.copy_from_slice(&cookie_plain[32..]);
        let eph_secret = SecretKey::from_bytes(eph_secret);

        let boxer = crypto::salsa_box(&client_eph, &eph_secret);
        let plain = crypto::open(&boxer, &nonce::initiate(Side::Client, 1), &sealed)?;
        if plain.len() < 32 + 16 + 48 {
            return Err(Error::Codec);
        }
        let mut client_key = [0u8; 32];
        client_key.copy_from_slice(&plain[..32]);
        let client_key = PublicKey::new(client_key);
        let mut vouch_tail = [0u8; 16];
        vouch_tail.copy_from_slice(&plain[32..48]);
        let metadata_bytes = &plain[96..];

        if !self.registry.verify(self.local, &client_key) {
            debug!("[{client_key:?}] refused by registry on {}", self.local);
            return Err(Error::Rejected);
        }

        // the long-term vouch must endorse exactly the ephemeral key the
        // kookie carries
        let vouched = self
            .vault
            .open(&plain[48..96], &nonce::vouch(&vouch_tail), &client_key)?;
        if vouched != client_eph.as_bytes() {
            return Err(Error::Verify);
        }
        trace!("[{client_key:?}] vouch bound to {client_eph:?}");

        if metadata_bytes.is_empty() {
            // no metadata from the client means no Ready frame; counters
            // advance as if the Ready slot had been used
            let session = Session::new(
                Side::Server,
                boxer,
                client_key,
                3,
                2,
                Metadata::new(),
            );
            Ok(Step::Done(Complete {
                session,
                reply: None,
            }))
        } else {
            let peer_metadata = proto::decode_metadata(metadata_bytes)?;
            let sealed = crypto::seal(
                &boxer,
                &nonce::ready(2),
                &proto::encode_metadata(&self.metadata)?,
            )?;
            let reply = Packet::Ready { n: 2, sealed }.encode();
            if reply.len() > MAX_FRAME_SIZE {
                return Err(Error::TooLarge);
            }
            let session = Session::new(Side::Server, boxer, client_key, 3, 2, peer_metadata);
            Ok(Step::Done(Complete {
                session,
                reply: Some(reply),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MinuteKeys;
    use crate::proto::data::Packet;
    use crate::registry::{AllowAny, Keyring};
    use crate::vault::KeyVault;
    use std::time::Duration;

    fn local() -> SocketAddr {
        "127.0.0.1:4433".parse().unwrap()
    }

    struct Rig {
        client_vault: Arc<KeyVault>,
        server_vault: Arc<KeyVault>,
        keys: Arc<MinuteKeys>,
    }

    fn rig() -> Rig {
        Rig {
            client_vault: Arc::new(KeyVault::gen()),
            server_vault: Arc::new(KeyVault::gen()),
            keys: Arc::new(MinuteKeys::new(Duration::from_secs(3600))),
        }
    }

    fn sent(step: Step) -> Vec<u8> {
        match step {
            Step::Send(frame) => frame,
            Step::Done(_) => panic!("handshake finished early"),
        }
    }

    fn done(step: Step) -> Complete {
        match step {
            Step::Done(complete) => complete,
            Step::Send(_) => panic!("handshake still in progress"),
        }
    }

    fn decode(frame: &[u8]) -> Packet {
        Packet::decode(frame).unwrap()
    }

    fn unwrap_msg(packet: Packet) -> (u64, Vec<u8>) {
        match packet {
            Packet::Msg { n, sealed } => (n, sealed),
            other => panic!("not a msg packet: {other:?}"),
        }
    }

    #[test]
    fn empty_metadata_handshake_skips_ready() {
        let rig = rig();
        let (mut client, hello) = ClientHandshake::new(
            rig.client_vault.clone(),
            rig.server_vault.public_key(),
            Metadata::new(),
        )
        .unwrap();
        let mut server = ServerHandshake::new(
            rig.server_vault.clone(),
            rig.keys.clone(),
            Arc::new(AllowAny),
            local(),
            Metadata::new(),
        );

        let cookie = sent(server.step(decode(&hello)).unwrap());
        let client_done = done(client.step(decode(&cookie)).unwrap());
        let initiate = client_done.reply.expect("initiate still to transmit");
        let server_done = done(server.step(decode(&initiate)).unwrap());

        // no Ready frame in this branch
        assert!(server_done.reply.is_none());

        let mut c = client_done.session;
        let mut s = server_done.session;
        assert!(c.peer_metadata().is_empty());
        assert!(s.peer_metadata().is_empty());
        assert_eq!(*s.peer_key(), rig.client_vault.public_key());
        assert_eq!(*c.peer_key(), rig.server_vault.public_key());

        // first counters: 2 client->server, 3 server->client
        let (n, sealed) = unwrap_msg(c.seal(b"hi").unwrap());
        assert_eq!(n, 2);
        assert_eq!(s.open(n, &sealed).unwrap(), b"hi");
        let (n, sealed) = unwrap_msg(s.seal(b"yo").unwrap());
        assert_eq!(n, 3);
        assert_eq!(c.open(n, &sealed).unwrap(), b"yo");
    }

    #[test]
    fn metadata_travels_both_ways() {
        let rig = rig();
        let client_md = vec![(b"user".to_vec(), b"alice".to_vec())];
        let server_md = vec![(b"role".to_vec(), b"svr".to_vec())];

        let (mut client, hello) = ClientHandshake::new(
            rig.client_vault.clone(),
            rig.server_vault.public_key(),
            client_md.clone(),
        )
        .unwrap();
        let mut server = ServerHandshake::new(
            rig.server_vault.clone(),
            rig.keys.clone(),
            Arc::new(AllowAny),
            local(),
            server_md.clone(),
        );

        let cookie = sent(server.step(decode(&hello)).unwrap());
        let initiate = sent(client.step(decode(&cookie)).unwrap());
        let server_done = done(server.step(decode(&initiate)).unwrap());
        let ready = server_done.reply.expect("ready frame");
        let client_done = done(client.step(decode(&ready)).unwrap());
        assert!(client_done.reply.is_none());

        assert_eq!(*server_done.session.peer_metadata(), client_md);
        assert_eq!(*client_done.session.peer_metadata(), server_md);
    }

    #[test]
    fn server_metadata_alone_still_skips_ready() {
        // the branch is keyed on the client's metadata, not the server's
        let rig = rig();
        let (mut client, hello) = ClientHandshake::new(
            rig.client_vault.clone(),
            rig.server_vault.public_key(),
            Metadata::new(),
        )
        .unwrap();
        let mut server = ServerHandshake::new(
            rig.server_vault.clone(),
            rig.keys.clone(),
            Arc::new(AllowAny),
            local(),
            vec![(b"role".to_vec(), b"svr".to_vec())],
        );

        let cookie = sent(server.step(decode(&hello)).unwrap());
        let initiate = done(client.step(decode(&cookie)).unwrap())
            .reply
            .unwrap();
        let server_done = done(server.step(decode(&initiate)).unwrap());
        assert!(server_done.reply.is_none());
        assert!(server_done.session.peer_metadata().is_empty());
    }

    #[test]
    fn cookie_survives_one_rotation() {
        let rig = rig();
        let (mut client, hello) = ClientHandshake::new(
            rig.client_vault.clone(),
            rig.server_vault.public_key(),
            Metadata::new(),
        )
        .unwrap();
        let mut server = ServerHandshake::new(
            rig.server_vault.clone(),
            rig.keys.clone(),
            Arc::new(AllowAny),
            local(),
            Metadata::new(),
        );

        let cookie = sent(server.step(decode(&hello)).unwrap());
        rig.keys.rotate();
        let initiate = done(client.step(decode(&cookie)).unwrap())
            .reply
            .unwrap();
        assert!(done(server.step(decode(&initiate)).unwrap()).reply.is_none());
    }

    #[test]
    fn stale_cookie_is_rejected() {
        let rig = rig();
        let (mut client, hello) = ClientHandshake::new(
            rig.client_vault.clone(),
            rig.server_vault.public_key(),
            Metadata::new(),
        )
        .unwrap();
        let mut server = ServerHandshake::new(
            rig.server_vault.clone(),
            rig.keys.clone(),
            Arc::new(AllowAny),
            local(),
            Metadata::new(),
        );

        let cookie = sent(server.step(decode(&hello)).unwrap());
        rig.keys.rotate();
        rig.keys.rotate();
        let initiate = done(client.step(decode(&cookie)).unwrap())
            .reply
            .unwrap();
        assert!(matches!(
            server.step(decode(&initiate)),
            Err(Error::Cookie)
        ));
    }

    #[test]
    fn registry_rejection_is_fatal() {
        let rig = rig();
        let (mut client, hello) = ClientHandshake::new(
            rig.client_vault.clone(),
            rig.server_vault.public_key(),
            Metadata::new(),
        )
        .unwrap();
        let mut server = ServerHandshake::new(
            rig.server_vault.clone(),
            rig.keys.clone(),
            Arc::new(Keyring::new([])),
            local(),
            Metadata::new(),
        );

        let cookie = sent(server.step(decode(&hello)).unwrap());
        let initiate = done(client.step(decode(&cookie)).unwrap())
            .reply
            .unwrap();
        assert!(matches!(
            server.step(decode(&initiate)),
            Err(Error::Rejected)
        ));
    }

    #[test]
    fn hello_with_nonzero_plaintext_is_fatal() {
        let rig = rig();
        let mut server = ServerHandshake::new(
            rig.server_vault.clone(),
            rig.keys.clone(),
            Arc::new(AllowAny),
            local(),
            Metadata::new(),
        );

        let eph = SecretKey::gen();
        let sealed = crypto::seal(
            &crypto::salsa_box(&rig.server_vault.public_key(), &eph),
            &nonce::hello(Side::Client, 0),
            &[1u8; 64],
        )
        .unwrap();
        let hello = Packet::Hello {
            eph: eph.public(),
            n: 0,
            sealed,
        };
        assert!(matches!(server.step(hello), Err(Error::Verify)));
    }

    #[test]
    fn vouch_over_foreign_ephemeral_is_fatal() {
        let rig = rig();
        let mut server = ServerHandshake::new(
            rig.server_vault.clone(),
            rig.keys.clone(),
            Arc::new(AllowAny),
            local(),
            Metadata::new(),
        );

        // honest hello from our ephemeral
        let eph = SecretKey::gen();
        let sealed = crypto::seal(
            &crypto::salsa_box(&rig.server_vault.public_key(), &eph),
            &nonce::hello(Side::Client, 0),
            &[0u8; 64],
        )
        .unwrap();
        let cookie_frame = sent(
            server
                .step(Packet::Hello {
                    eph: eph.public(),
                    n: 0,
                    sealed,
                })
                .unwrap(),
        );

        // open the cookie by hand to learn the server ephemeral
        let (tail, sealed) = match decode(&cookie_frame) {
            Packet::Cookie { tail, sealed } => (tail, sealed),
            other => panic!("expected cookie, got {other:?}"),
        };
        let plain = crypto::open(
            &crypto::salsa_box(&rig.server_vault.public_key(), &eph),
            &nonce::cookie(&tail),
            &sealed,
        )
        .unwrap();
        let mut server_eph = [0u8; 32];
        server_eph.copy_from_slice(&plain[..32]);
        let server_eph = PublicKey::new(server_eph);
        let mut kookie = [0u8; KOOKIE_SIZE];
        kookie.copy_from_slice(&plain[32..]);

        // build an initiate whose vouch endorses a different ephemeral
        let vouch_tail = rig.client_vault.safe_nonce();
        let foreign = SecretKey::gen().public();
        let vouch = rig
            .client_vault
            .seal(
                foreign.as_bytes(),
                &nonce::vouch(&vouch_tail),
                &rig.server_vault.public_key(),
            )
            .unwrap();
        let mut initiate_plain = Vec::new();
        initiate_plain.extend_from_slice(rig.client_vault.public_key().as_bytes());
        initiate_plain.extend_from_slice(&vouch_tail);
        initiate_plain.extend_from_slice(&vouch);
        let sealed = crypto::seal(
            &crypto::salsa_box(&server_eph, &eph),
            &nonce::initiate(Side::Client, 1),
            &initiate_plain,
        )
        .unwrap();

        assert!(matches!(
            server.step(Packet::Vouch {
                kookie,
                n: 1,
                sealed,
            }),
            Err(Error::Verify)
        ));
    }

    #[test]
    fn unexpected_frames_are_fatal_in_every_state() {
        let rig = rig();
        let mut server = ServerHandshake::new(
            rig.server_vault.clone(),
            rig.keys.clone(),
            Arc::new(AllowAny),
            local(),
            Metadata::new(),
        );
        assert!(matches!(
            server.step(Packet::Msg {
                n: 0,
                sealed: vec![0; 17],
            }),
            Err(Error::Unexpected {
                got: "msg",
                state: "awaiting_hello",
            })
        ));

        let (mut client, _hello) = ClientHandshake::new(
            rig.client_vault.clone(),
            rig.server_vault.public_key(),
            Metadata::new(),
        )
        .unwrap();
        assert!(matches!(
            client.step(Packet::Ready {
                n: 2,
                sealed: vec![0; 17],
            }),
            Err(Error::Unexpected {
                got: "ready",
                state: "awaiting_cookie",
            })
        ));
    }
}
