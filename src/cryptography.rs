use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};
use sha2::Sha256;
use spake2::{Ed25519Group, Identity, Password, Spake2};

use crate::error::{Error, Result};
use crate::signalling::Signalling;
use crate::{KEY_SIZE, NONCE_SIZE};

/// Session key shared by both peers after the PAKE round trip.
pub type Key = [u8; KEY_SIZE];

// The identity arguments bind endpoint identities in the PAKE. We have no
// ahead-of-time information on the identity of the remote party, only the
// slot number, so both are left empty. That's okay, since the password is
// randomly generated, ephemeral, and a peer only gets one guess: an
// unintended destination will fail the exchange.
fn pake_identity() -> Identity {
    Identity::new(b"")
}

/// Run the joiner's side of the key exchange: send our message first,
/// then finish with the one the peer sends back.
///
/// # Arguments
/// * `ws` - The signalling connection, right after the init message
/// * `pass` - The low-entropy password decoded from the wormhole code
///
/// # Returns
/// The 32-byte session key all further signalling frames are sealed
/// under, or an error if the exchange could not complete.
pub async fn exchange_key_joiner(ws: &mut Signalling, pass: &[u8]) -> Result<Key> {
    let (state, msg_a) =
        Spake2::<Ed25519Group>::start_a(&Password::new(pass), &pake_identity(), &pake_identity());
    ws.write_frame(&msg_a).await?;
    log::debug!("sent pake msg A ({} bytes)", msg_a.len());

    let msg_b = ws.read_frame().await?;
    let shared = state
        .finish(&msg_b)
        .map_err(|e| Error::Pake(format!("{:?}", e)))?;
    log::debug!("have key, got pake msg B ({} bytes)", msg_b.len());

    Ok(derive_session_key(&shared))
}

/// Run the originator's side of the key exchange: wait for the joiner's
/// message, then answer with ours.
pub async fn exchange_key_originator(ws: &mut Signalling, pass: &[u8]) -> Result<Key> {
    let msg_a = ws.read_frame().await?;
    log::debug!("got pake msg A ({} bytes)", msg_a.len());

    let (state, msg_b) =
        Spake2::<Ed25519Group>::start_b(&Password::new(pass), &pake_identity(), &pake_identity());
    let shared = state
        .finish(&msg_a)
        .map_err(|e| Error::Pake(format!("{:?}", e)))?;
    ws.write_frame(&msg_b).await?;
    log::debug!("have key, sent pake msg B ({} bytes)", msg_b.len());

    Ok(derive_session_key(&shared))
}

/// Derives the 32-byte session key from the PAKE shared secret.
///
/// The raw shared secret is a group element and not uniformly random, so
/// it is run through HKDF-SHA-256 with empty salt and info before use as
/// a cipher key.
pub fn derive_session_key(shared: &[u8]) -> Key {
    let hkdf = Hkdf::<Sha256>::new(None, shared);
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(&[], &mut key)
        .expect("32 bytes is a valid length for HKDF");
    key
}

/// Authenticated-encrypt a signalling payload.
///
/// Output layout is the secretbox convention: a random 24-byte nonce
/// followed by the ciphertext and tag. Nonces are drawn fresh from the
/// OS rng for every frame; the session key never outlives the
/// signalling connection, so the collision space is tiny.
///
/// # Arguments
/// * `key` - The PAKE-derived session key
/// * `plaintext` - The JSON payload to protect
pub fn seal(key: &Key, plaintext: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .expect("encryption is infallible for in-memory buffers");

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

/// Open a sealed signalling payload.
///
/// Any failure is reported as `BadKey`: the only way a well-formed frame
/// fails to open is the peer deriving a different session key, i.e. a
/// wrong password.
pub fn open(key: &Key, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_SIZE {
        return Err(Error::BadKey);
    }
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(&data[..NONCE_SIZE]);
    cipher
        .decrypt(nonce, &data[NONCE_SIZE..])
        .map_err(|_| Error::BadKey)
}

/// Serialize a value to JSON, seal it, and send it as a signalling frame.
pub async fn write_enc_json<T: Serialize>(ws: &Signalling, key: &Key, v: &T) -> Result<()> {
    let json = serde_json::to_vec(v)?;
    ws.write_frame(&seal(key, &json)).await
}

/// Read one signalling frame, open it, and deserialize the JSON payload.
pub async fn read_enc_json<T: DeserializeOwned>(ws: &mut Signalling, key: &Key) -> Result<T> {
    let sealed = ws.read_frame().await?;
    let json = open(key, &sealed)?;
    Ok(serde_json::from_slice(&json)?)
}

// Testing Suite:
// - seal/open round trip, tamper and wrong-key detection
// - key derivation from a PAKE exchange on both sides
// - wrong passwords must surface as BadKey at the frame layer

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(pass_a: &[u8], pass_b: &[u8]) -> (Key, Key) {
        let (sa, msg_a) = Spake2::<Ed25519Group>::start_a(
            &Password::new(pass_a),
            &pake_identity(),
            &pake_identity(),
        );
        let (sb, msg_b) = Spake2::<Ed25519Group>::start_b(
            &Password::new(pass_b),
            &pake_identity(),
            &pake_identity(),
        );
        let shared_a = sa.finish(&msg_b).expect("side A finish");
        let shared_b = sb.finish(&msg_a).expect("side B finish");
        (derive_session_key(&shared_a), derive_session_key(&shared_b))
    }

    // ============================================================================
    // PAKE and Key Derivation Tests
    // ============================================================================

    #[test]
    fn test_same_password_same_key() {
        let (ka, kb) = exchange(b"\x01\x02", b"\x01\x02");
        assert_eq!(ka, kb, "both parties should derive identical session keys");
        assert_eq!(ka.len(), KEY_SIZE);
    }

    #[test]
    fn test_different_password_different_key() {
        let (ka, kb) = exchange(b"\x01\x02", b"\x01\x03");
        assert_ne!(ka, kb);
    }

    #[test]
    fn test_mismatched_keys_fail_at_frame_layer() {
        let (ka, kb) = exchange(b"aa", b"bb");
        let sealed = seal(&ka, b"{\"type\":\"offer\"}");
        match open(&kb, &sealed) {
            Err(Error::BadKey) => {}
            other => panic!("expected BadKey, got {:?}", other),
        }
    }

    #[test]
    fn test_derive_session_key_deterministic() {
        let shared = b"some shared secret material";
        assert_eq!(derive_session_key(shared), derive_session_key(shared));
    }

    // ============================================================================
    // Seal/Open Tests
    // ============================================================================

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [7u8; KEY_SIZE];
        let plaintext = b"{\"candidate\":\"candidate:0 1 UDP ...\"}";
        let sealed = seal(&key, plaintext);
        assert_eq!(sealed.len(), NONCE_SIZE + plaintext.len() + 16);
        let opened = open(&key, &sealed).expect("open should succeed");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_seal_uses_random_nonces() {
        let key = [9u8; KEY_SIZE];
        assert_ne!(seal(&key, b"same"), seal(&key, b"same"));
    }

    #[test]
    fn test_open_rejects_tampering() {
        let key = [1u8; KEY_SIZE];
        let mut sealed = seal(&key, b"payload");
        let n = sealed.len();
        sealed[n - 1] ^= 0x01;
        assert!(matches!(open(&key, &sealed), Err(Error::BadKey)));
    }

    #[test]
    fn test_open_rejects_truncated_frames() {
        let key = [2u8; KEY_SIZE];
        let sealed = seal(&key, b"payload");
        assert!(matches!(open(&key, &sealed[..10]), Err(Error::BadKey)));
        assert!(matches!(open(&key, b""), Err(Error::BadKey)));
    }

    #[test]
    fn test_seal_empty_payload() {
        let key = [3u8; KEY_SIZE];
        let sealed = seal(&key, b"");
        assert_eq!(open(&key, &sealed).unwrap(), b"");
    }
}
