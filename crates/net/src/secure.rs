//! The secure envelope: P-256 ECDH session establishment and AES-256-GCM
//! message encryption.
//!
//! During a secure handshake both peers exchange ephemeral public keys
//! and derive the session key through HKDF-SHA256. Every message after
//! the handshake travels as a [`SecureEnv`]: the inner
//! `[type][flags][payload]` is AEAD-encrypted with a fresh random nonce
//! and the tag is carried alongside the ciphertext.

use crate::message::SecureEnv;
use crate::NetError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HKDF_SALT: &[u8] = b"meshdb-secure-v1";
const HKDF_INFO: &[u8] = b"meshdb-session-key";

/// One side's ephemeral ECDH keypair, alive only for the handshake.
pub struct EphemeralKeys {
    secret: EphemeralSecret,
    public: Vec<u8>,
}

impl EphemeralKeys {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = secret.public_key().to_sec1_bytes().to_vec();
        Self { secret, public }
    }

    /// SEC1-encoded public key to send in the handshake.
    pub fn public_bytes(&self) -> &[u8] {
        &self.public
    }

    /// Derive the session channel from the peer's public key.
    pub fn agree(self, peer_public: &[u8]) -> Result<SecureChannel, NetError> {
        let peer = PublicKey::from_sec1_bytes(peer_public)
            .map_err(|e| NetError::Crypto(format!("invalid peer public key: {}", e)))?;
        let shared = self.secret.diffie_hellman(&peer);

        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared.raw_secret_bytes().as_slice());
        let mut key = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key)
            .map_err(|e| NetError::Crypto(format!("HKDF expand failed: {}", e)))?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| NetError::Crypto(format!("AES key setup failed: {}", e)))?;
        Ok(SecureChannel { cipher })
    }
}

impl std::fmt::Debug for EphemeralKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeys").finish_non_exhaustive()
    }
}

/// An established AEAD channel; both directions share one key.
pub struct SecureChannel {
    cipher: Aes256Gcm,
}

impl SecureChannel {
    /// Encrypt one inner message (`[type][flags][payload]`).
    pub fn seal(&self, msg_type: u8, flags: u8, payload: &[u8]) -> Result<SecureEnv, NetError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut plaintext = Vec::with_capacity(2 + payload.len());
        plaintext.push(msg_type);
        plaintext.push(flags);
        plaintext.extend_from_slice(payload);

        let mut sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| NetError::Crypto("AEAD encrypt failed".into()))?;

        // aes-gcm appends the tag; the wire carries it as its own field.
        let auth_tag = sealed.split_off(sealed.len() - TAG_LEN);
        Ok(SecureEnv {
            ciphertext: sealed,
            nonce: nonce.to_vec(),
            auth_tag,
        })
    }

    /// Decrypt an envelope back to `(type, flags, payload)`.
    pub fn open(&self, env: &SecureEnv) -> Result<(u8, u8, Vec<u8>), NetError> {
        if env.nonce.len() != NONCE_LEN || env.auth_tag.len() != TAG_LEN {
            return Err(NetError::Crypto("malformed secure envelope".into()));
        }

        let mut sealed = Vec::with_capacity(env.ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(&env.ciphertext);
        sealed.extend_from_slice(&env.auth_tag);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&env.nonce), sealed.as_slice())
            .map_err(|_| NetError::Crypto("AEAD decrypt failed".into()))?;

        if plaintext.len() < 2 {
            return Err(NetError::Crypto("secure envelope too short".into()));
        }
        Ok((plaintext[0], plaintext[1], plaintext[2..].to_vec()))
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel").finish_non_exhaustive()
    }
}
