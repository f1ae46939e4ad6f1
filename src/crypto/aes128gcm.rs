//! Web Push message encryption (RFC 8291).
//!
//! Encrypts a payload for a browser push subscription using:
//! - ECDH key agreement on P-256 against the subscription's `p256dh` key
//! - HKDF-SHA256 key derivation mixed with the subscription's auth secret
//! - AES-128-GCM authenticated encryption in `aes128gcm` framing (RFC 8188)
//!
//! # Security
//!
//! Derived key material is zeroed from memory when dropped using the
//! `zeroize` crate. A fresh sender key pair and salt are generated per
//! message.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use hkdf::Hkdf;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey, ecdh};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Record size written to the content-coding header. Everything is sent as a
/// single record.
const RECORD_SIZE: u32 = 4096;

/// Salt length in the content-coding header.
const SALT_SIZE: usize = 16;

/// Length of an uncompressed P-256 public key.
const PUBKEY_SIZE: usize = 65;

/// Expected length of the subscription auth secret.
const AUTH_SECRET_SIZE: usize = 16;

/// AES-GCM tag length plus the last-record delimiter octet.
const RECORD_OVERHEAD: usize = 17;

/// Encrypt `plaintext` for the subscription identified by `ua_public`
/// (uncompressed P-256 point) and `auth_secret` (16 bytes).
///
/// Returns the complete `aes128gcm` message body:
/// `salt(16) || record_size(4) || keyid_len(1) || sender_public(65) || ciphertext`.
pub fn encrypt(ua_public: &[u8], auth_secret: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    let sender = SecretKey::random(&mut OsRng);
    encrypt_with(ua_public, auth_secret, plaintext, &sender, &salt)
}

/// Encrypt with a caller-supplied sender key and salt.
fn encrypt_with(
    ua_public: &[u8],
    auth_secret: &[u8],
    plaintext: &[u8],
    sender: &SecretKey,
    salt: &[u8; SALT_SIZE],
) -> Result<Vec<u8>> {
    if auth_secret.len() != AUTH_SECRET_SIZE {
        return Err(Error::Crypto(format!(
            "Invalid auth secret length: expected {AUTH_SECRET_SIZE}, got {}",
            auth_secret.len()
        )));
    }
    if plaintext.len() + RECORD_OVERHEAD > RECORD_SIZE as usize {
        return Err(Error::Crypto(format!(
            "Payload too large for a single record: {} bytes",
            plaintext.len()
        )));
    }

    let ua_key = PublicKey::from_sec1_bytes(ua_public)
        .map_err(|e| Error::Crypto(format!("Invalid subscription public key: {e}")))?;
    let ua_point = ua_key.to_encoded_point(false);
    let sender_point = sender.public_key().to_encoded_point(false);

    let shared = ecdh::diffie_hellman(sender.to_nonzero_scalar(), ua_key.as_affine());

    // IKM = HKDF(salt=auth_secret, ikm=ecdh_secret,
    //            info="WebPush: info" || 0x00 || ua_public || sender_public)
    let mut key_info = Vec::with_capacity(14 + 2 * PUBKEY_SIZE);
    key_info.extend_from_slice(b"WebPush: info\0");
    key_info.extend_from_slice(ua_point.as_bytes());
    key_info.extend_from_slice(sender_point.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(auth_secret), shared.raw_secret_bytes().as_slice());
    let mut ikm = Zeroizing::new([0u8; 32]);
    hk.expand(&key_info, ikm.as_mut_slice())
        .map_err(|_| Error::Crypto("HKDF expand failed for IKM".to_string()))?;

    let hk = Hkdf::<Sha256>::new(Some(salt), ikm.as_slice());
    let mut cek = Zeroizing::new([0u8; 16]);
    hk.expand(b"Content-Encoding: aes128gcm\0", cek.as_mut_slice())
        .map_err(|_| Error::Crypto("HKDF expand failed for CEK".to_string()))?;
    let mut nonce = [0u8; 12];
    hk.expand(b"Content-Encoding: nonce\0", &mut nonce)
        .map_err(|_| Error::Crypto("HKDF expand failed for nonce".to_string()))?;

    // Single record: plaintext followed by the last-record delimiter.
    let mut record = Vec::with_capacity(plaintext.len() + 1);
    record.extend_from_slice(plaintext);
    record.push(0x02);

    let cipher = Aes128Gcm::new_from_slice(cek.as_slice())
        .map_err(|_| Error::Crypto("Invalid content encryption key length".to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), record.as_slice())
        .map_err(|_| Error::Crypto("AEAD encryption failed".to_string()))?;

    let mut body =
        Vec::with_capacity(SALT_SIZE + 4 + 1 + PUBKEY_SIZE + ciphertext.len());
    body.extend_from_slice(salt);
    body.extend_from_slice(&RECORD_SIZE.to_be_bytes());
    body.push(PUBKEY_SIZE as u8);
    body.extend_from_slice(sender_point.as_bytes());
    body.extend_from_slice(&ciphertext);

    Ok(body)
}
