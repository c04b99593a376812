//! Session key negotiation and frame sealing
//!
//! The client wraps a fresh AES-256-GCM key for the server: an ephemeral
//! X25519 agreement with the server's static public key feeds HKDF-SHA256,
//! and the derived key seals the session key into a `SESSION_KEY` frame.
//! Every later frame payload is sealed under the session key.

use crate::error::{Error, Result};
use crate::protocol::{frame, MAX_FRAME_SIZE};
use crate::protocol_core::write_frame;
use ring::rand::{SecureRandom, SystemRandom};
use ring::{aead, agreement, hkdf};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Write;
use std::path::Path;

pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
/// Largest sealed payload on the wire: a full plaintext frame plus its tag.
pub const MAX_SEALED_FRAME_SIZE: usize = MAX_FRAME_SIZE + TAG_LEN;
const WRAP_INFO: &[u8] = b"bininja session key wrap v1";

/// Nonce prefixes, one per direction so both sides can count from zero.
pub const CLIENT_TO_SERVER: u32 = 1;
pub const SERVER_TO_CLIENT: u32 = 2;

/// Server's static X25519 public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        let raw = hex::decode(text.trim())
            .map_err(|e| Error::Crypto(format!("public key is not valid hex: {}", e)))?;
        let bytes: [u8; KEY_LEN] = raw.try_into().map_err(|raw: Vec<u8>| {
            Error::Crypto(format!(
                "public key must be {} bytes, got {}",
                KEY_LEN,
                raw.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Read a hex encoded key file (surrounding whitespace ignored).
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read public key {}: {}", path.display(), e))
        })?;
        Self::from_hex(&text)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// SHA-256 of the key, hex encoded, for display.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.fingerprint()[..16])
    }
}

/// Negotiated symmetric key. Never printed.
#[derive(Clone)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    fn generate(rng: &SystemRandom) -> Result<Self> {
        let mut bytes = [0u8; KEY_LEN];
        rng.fill(&mut bytes)
            .map_err(|_| Error::Crypto("random source failed".into()))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    fn less_safe_key(&self) -> Result<aead::LessSafeKey> {
        let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &self.0)
            .map_err(|_| Error::Crypto("invalid session key".into()))?;
        Ok(aead::LessSafeKey::new(unbound))
    }

    pub fn sealer(&self, direction: u32) -> Result<FrameSealer> {
        Ok(FrameSealer {
            key: self.less_safe_key()?,
            counter: NonceCounter::new(direction),
        })
    }

    pub fn opener(&self, direction: u32) -> Result<FrameOpener> {
        Ok(FrameOpener {
            key: self.less_safe_key()?,
            counter: NonceCounter::new(direction),
        })
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

struct NonceCounter {
    prefix: [u8; 4],
    next: u64,
}

impl NonceCounter {
    fn new(direction: u32) -> Self {
        Self {
            prefix: direction.to_be_bytes(),
            next: 0,
        }
    }

    fn advance(&mut self) -> Result<aead::Nonce> {
        let n = self.next;
        self.next = n
            .checked_add(1)
            .ok_or_else(|| Error::Crypto("nonce space exhausted".into()))?;
        let mut nonce = [0u8; aead::NONCE_LEN];
        nonce[..4].copy_from_slice(&self.prefix);
        nonce[4..].copy_from_slice(&n.to_be_bytes());
        Ok(aead::Nonce::assume_unique_for_key(nonce))
    }
}

/// Seals outbound frame payloads in order.
pub struct FrameSealer {
    key: aead::LessSafeKey,
    counter: NonceCounter,
}

impl FrameSealer {
    /// The frame type is bound as associated data.
    pub fn seal(&mut self, frame_type: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.counter.advance()?;
        let mut buf = Vec::with_capacity(payload.len() + TAG_LEN);
        buf.extend_from_slice(payload);
        self.key
            .seal_in_place_append_tag(nonce, aead::Aad::from([frame_type]), &mut buf)
            .map_err(|_| Error::Crypto("sealing frame failed".into()))?;
        Ok(buf)
    }
}

/// Opens inbound frame payloads in order. Any failure means the stream was
/// tampered with or desynchronized.
pub struct FrameOpener {
    key: aead::LessSafeKey,
    counter: NonceCounter,
}

impl FrameOpener {
    pub fn open(&mut self, frame_type: u8, mut payload: Vec<u8>) -> Result<Vec<u8>> {
        let nonce = self.counter.advance()?;
        let plain_len = self
            .key
            .open_in_place(nonce, aead::Aad::from([frame_type]), &mut payload)
            .map_err(|_| Error::MaliciousInput("frame failed authentication".into()))?
            .len();
        payload.truncate(plain_len);
        Ok(payload)
    }
}

/// Callback consulted by the transport during the handshake.
///
/// `Ok(None)` means no encryption for this connection.
pub trait SessionKeyBuilder: Send + Sync {
    fn build_session_key(
        &self,
        arrangement: &mut SessionKeyArrangement<'_>,
    ) -> Result<Option<SessionKey>>;
}

/// Handshake-time handle through which a [`SessionKeyBuilder`] produces the
/// session key. Bound to the connection's output stream.
pub struct SessionKeyArrangement<'a> {
    out: &'a mut dyn Write,
    generate: bool,
    public_key: Option<PublicKey>,
}

impl<'a> SessionKeyArrangement<'a> {
    pub fn new(out: &'a mut dyn Write) -> Self {
        Self {
            out,
            generate: false,
            public_key: None,
        }
    }

    pub fn set_generate_session_key(&mut self, generate: bool) -> &mut Self {
        self.generate = generate;
        self
    }

    pub fn set_public_key(&mut self, key: PublicKey) -> &mut Self {
        self.public_key = Some(key);
        self
    }

    /// Generate the session key, wrap it for the server and send it.
    pub fn arrange(&mut self) -> Result<SessionKey> {
        if !self.generate {
            return Err(Error::Crypto("no session key requested".into()));
        }
        let server_key = self
            .public_key
            .clone()
            .ok_or_else(|| Error::Crypto("no public key to wrap the session key".into()))?;

        let rng = SystemRandom::new();
        let session_key = SessionKey::generate(&rng)?;

        let ephemeral = agreement::EphemeralPrivateKey::generate(&agreement::X25519, &rng)
            .map_err(|_| Error::Crypto("ephemeral key generation failed".into()))?;
        let ephemeral_public = ephemeral
            .compute_public_key()
            .map_err(|_| Error::Crypto("ephemeral public key failed".into()))?;

        let wrap_key = agreement::agree_ephemeral(
            ephemeral,
            &agreement::UnparsedPublicKey::new(&agreement::X25519, server_key.as_bytes()),
            |shared| derive_wrap_key(shared, ephemeral_public.as_ref(), server_key.as_bytes()),
        )
        .map_err(|_| Error::Crypto("key agreement with server key failed".into()))??;

        let mut sealed = session_key.0.to_vec();
        wrap_key
            .seal_in_place_append_tag(
                aead::Nonce::assume_unique_for_key([0u8; aead::NONCE_LEN]),
                aead::Aad::empty(),
                &mut sealed,
            )
            .map_err(|_| Error::Crypto("wrapping session key failed".into()))?;

        let mut payload = Vec::with_capacity(KEY_LEN + sealed.len());
        payload.extend_from_slice(ephemeral_public.as_ref());
        payload.extend_from_slice(&sealed);
        write_frame(&mut *self.out, frame::SESSION_KEY, &payload)?;

        tracing::debug!(server_key = ?server_key, "session key sent");
        Ok(session_key)
    }
}

/// Key encryption key: HKDF-SHA256 over the shared secret, salted with both
/// public keys. The wrap key is used exactly once, so a zero nonce is fine.
fn derive_wrap_key(
    shared: &[u8],
    ephemeral_public: &[u8],
    server_public: &[u8],
) -> Result<aead::LessSafeKey> {
    let mut salt = Vec::with_capacity(2 * KEY_LEN);
    salt.extend_from_slice(ephemeral_public);
    salt.extend_from_slice(server_public);
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &salt).extract(shared);
    let okm = prk
        .expand(&[WRAP_INFO], &aead::AES_256_GCM)
        .map_err(|_| Error::Crypto("key derivation failed".into()))?;
    Ok(aead::LessSafeKey::new(aead::UnboundKey::from(okm)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_core::read_frame;
    use std::io::Cursor;

    /// Server half of the exchange.
    fn unwrap_session_key(
        server: agreement::EphemeralPrivateKey,
        server_public: &[u8],
        payload: &[u8],
    ) -> SessionKey {
        let (eph, sealed) = payload.split_at(KEY_LEN);
        let wrap = agreement::agree_ephemeral(
            server,
            &agreement::UnparsedPublicKey::new(&agreement::X25519, eph),
            |shared| derive_wrap_key(shared, eph, server_public),
        )
        .unwrap()
        .unwrap();
        let mut sealed = sealed.to_vec();
        let plain = wrap
            .open_in_place(
                aead::Nonce::assume_unique_for_key([0u8; aead::NONCE_LEN]),
                aead::Aad::empty(),
                &mut sealed,
            )
            .unwrap();
        SessionKey::from_bytes(plain.try_into().unwrap())
    }

    #[test]
    fn arrangement_sends_a_key_the_server_can_unwrap() {
        let rng = SystemRandom::new();
        let server = agreement::EphemeralPrivateKey::generate(&agreement::X25519, &rng).unwrap();
        let server_public = server.compute_public_key().unwrap();
        let public_key = PublicKey::from_bytes(server_public.as_ref().try_into().unwrap());

        let mut wire = Vec::new();
        let client_key = {
            let mut arrangement = SessionKeyArrangement::new(&mut wire);
            arrangement
                .set_generate_session_key(true)
                .set_public_key(public_key.clone());
            arrangement.arrange().unwrap()
        };

        let (frame_type, payload) = read_frame(&mut Cursor::new(wire)).unwrap();
        assert_eq!(frame_type, frame::SESSION_KEY);
        assert_eq!(payload.len(), KEY_LEN + KEY_LEN + TAG_LEN);

        let server_key = unwrap_session_key(server, public_key.as_bytes(), &payload);
        assert_eq!(server_key.0, client_key.0);
    }

    #[test]
    fn arrange_requires_generation_and_public_key() {
        let mut wire = Vec::new();
        let mut arrangement = SessionKeyArrangement::new(&mut wire);
        assert!(matches!(arrangement.arrange(), Err(Error::Crypto(_))));
        arrangement.set_generate_session_key(true);
        assert!(matches!(arrangement.arrange(), Err(Error::Crypto(_))));
        assert!(wire.is_empty());
    }

    #[test]
    fn sealed_frames_open_in_order_only() {
        let key = SessionKey::from_bytes([7u8; KEY_LEN]);
        let mut sealer = key.sealer(CLIENT_TO_SERVER).unwrap();
        let mut opener = key.opener(CLIENT_TO_SERVER).unwrap();

        let first = sealer.seal(frame::CHANNEL_DATA, b"first").unwrap();
        let second = sealer.seal(frame::CHANNEL_DATA, b"second").unwrap();
        assert_ne!(&first[..5], b"first");

        assert_eq!(opener.open(frame::CHANNEL_DATA, first).unwrap(), b"first");
        assert_eq!(opener.open(frame::CHANNEL_DATA, second).unwrap(), b"second");

        // Replay is rejected: the counter moved on
        let mut replay_sealer = key.sealer(CLIENT_TO_SERVER).unwrap();
        let replay = replay_sealer.seal(frame::CHANNEL_DATA, b"first").unwrap();
        assert!(matches!(
            opener.open(frame::CHANNEL_DATA, replay),
            Err(Error::MaliciousInput(_))
        ));
    }

    #[test]
    fn frame_type_is_authenticated() {
        let key = SessionKey::from_bytes([1u8; KEY_LEN]);
        let mut sealer = key.sealer(SERVER_TO_CLIENT).unwrap();
        let mut opener = key.opener(SERVER_TO_CLIENT).unwrap();
        let sealed = sealer.seal(frame::CHANNEL_DATA, b"x").unwrap();
        assert!(opener.open(frame::CHANNEL_CLOSE, sealed).is_err());
    }

    #[test]
    fn directions_do_not_share_nonces() {
        let key = SessionKey::from_bytes([3u8; KEY_LEN]);
        let mut c2s = key.sealer(CLIENT_TO_SERVER).unwrap();
        let mut opener = key.opener(SERVER_TO_CLIENT).unwrap();
        let sealed = c2s.seal(frame::CLOSE, b"").unwrap();
        assert!(opener.open(frame::CLOSE, sealed).is_err());
    }

    #[test]
    fn public_key_hex_parsing() {
        let hex_key = "11".repeat(KEY_LEN);
        let key = PublicKey::from_hex(&format!("  {}\n", hex_key)).unwrap();
        assert_eq!(key.as_bytes(), &[0x11u8; KEY_LEN]);
        assert_eq!(key.fingerprint().len(), 64);

        assert!(PublicKey::from_hex("zz").is_err());
        assert!(PublicKey::from_hex("1122").is_err());
    }

    #[test]
    fn session_key_debug_is_redacted() {
        let key = SessionKey::from_bytes([0xAB; KEY_LEN]);
        assert!(!format!("{:?}", key).contains("ab"));
    }
}
