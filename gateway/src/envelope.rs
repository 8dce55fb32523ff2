//! Encrypted request envelope.
//!
//! Devices wrap every request body as
//! `IV (16) || AES-256-CBC(PKCS#7(plaintext)) || HMAC-SHA256(IV || ciphertext) (32)`.
//! The AES key is `SHA256(secret)` and the MAC key is `SHA256("HMAC" || secret)`.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const IV_LEN: usize = 16;
const MAC_LEN: usize = 32;
const BLOCK_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope")]
    Malformed,

    #[error("envelope authentication failed")]
    Authentication,
}

/// Turns a raw request body into plaintext.
///
/// Implementations must be deterministic and free of side effects.
pub trait EnvelopeCodec: Send + Sync + std::fmt::Debug {
    fn decode(&self, blob: &[u8]) -> Result<Vec<u8>, EnvelopeError>;
}

/// The firmware's AES-256-CBC + HMAC-SHA256 envelope.
#[derive(Clone)]
pub struct AesCbcHmacCodec {
    aes_key: [u8; 32],
    hmac_key: [u8; 32],
}

impl AesCbcHmacCodec {
    pub fn new(secret: &str) -> Self {
        let aes_key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();

        let mut hasher = Sha256::new();
        hasher.update(b"HMAC");
        hasher.update(secret.as_bytes());
        let hmac_key: [u8; 32] = hasher.finalize().into();

        Self { aes_key, hmac_key }
    }

    /// Seals `plaintext` with a fresh random IV. Used by device tooling.
    pub fn encode(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        self.encode_with_iv(plaintext, &iv)
    }

    pub fn encode_with_iv(&self, plaintext: &[u8], iv: &[u8; IV_LEN]) -> Vec<u8> {
        let ciphertext = Aes256CbcEnc::new(&self.aes_key.into(), &(*iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len() + MAC_LEN);
        blob.extend_from_slice(iv);
        blob.extend_from_slice(&ciphertext);

        let tag = self.mac().chain_update(&blob).finalize().into_bytes();
        blob.extend_from_slice(&tag);
        blob
    }

    fn mac(&self) -> HmacSha256 {
        <HmacSha256 as Mac>::new_from_slice(&self.hmac_key)
            .expect("HMAC accepts keys of any length")
    }
}

impl EnvelopeCodec for AesCbcHmacCodec {
    fn decode(&self, blob: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        if blob.len() < IV_LEN + MAC_LEN {
            return Err(EnvelopeError::Malformed);
        }

        let cipher_len = blob.len() - IV_LEN - MAC_LEN;
        if cipher_len % BLOCK_LEN != 0 {
            return Err(EnvelopeError::Malformed);
        }

        let (signed, tag) = blob.split_at(IV_LEN + cipher_len);
        self.mac()
            .chain_update(signed)
            .verify_slice(tag)
            .map_err(|_| EnvelopeError::Authentication)?;

        let (iv, ciphertext) = signed.split_at(IV_LEN);
        Aes256CbcDec::new_from_slices(&self.aes_key, iv)
            .map_err(|_| EnvelopeError::Malformed)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| EnvelopeError::Malformed)
    }
}

impl std::fmt::Debug for AesCbcHmacCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCbcHmacCodec").finish_non_exhaustive()
    }
}
