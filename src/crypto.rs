//! Cryptographic primitives consumed by the pipelines.
//!
//! Wire format for every encrypted payload: `nonce (12 B) || ciphertext`.
//! The IV is generated fresh per encryption and prepended; decryption splits
//! it back off the front. Byte comparisons of MACs and nonces are
//! constant-time.

use crate::error::{Result, WsSecurityError};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Length of the IV prefix on encrypted payloads.
pub const IV_LEN: usize = 12;

/// Required symmetric key length in bytes.
pub const KEY_LEN: usize = 32;

/// Algorithm URIs understood by the engine.
pub mod algorithms {
    /// HMAC-SHA1 signature MAC.
    pub const HMAC_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#hmac-sha1";
    /// HMAC-SHA256 signature MAC.
    pub const HMAC_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#hmac-sha256";
    /// P-SHA1 key derivation (WS-SecureConversation Feb 2005).
    pub const P_SHA1: &str = "http://schemas.xmlsoap.org/ws/2005/02/sc/dk/p_sha1";
    /// P-SHA256 key derivation.
    pub const P_SHA256: &str = "http://docs.oasis-open.org/ws-sx/ws-secureconversation/200512/dk/p_sha256";
    /// AES-256-GCM body encryption.
    pub const AES256_GCM: &str = "http://www.w3.org/2009/xmlenc11#aes256-gcm";
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key).map_err(|_| {
        WsSecurityError::Usage(format!(
            "symmetric key must be {} bytes, got {}",
            KEY_LEN,
            key.len()
        ))
    })
}

/// Encrypt `plaintext` under `key`, prepending a fresh random IV.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    let iv_bytes: [u8; IV_LEN] = rand::random();
    let nonce = Nonce::from_slice(&iv_bytes);
    let ct = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| WsSecurityError::Validation("encryption failed"))?;
    let mut out = Vec::with_capacity(IV_LEN + ct.len());
    out.extend_from_slice(&iv_bytes);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Decrypt `data` (`iv || ciphertext`) under `key`.
pub fn decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < IV_LEN {
        return Err(WsSecurityError::Validation("ciphertext too short"));
    }
    let cipher = cipher_for(key)?;
    let nonce = Nonce::from_slice(&data[..IV_LEN]);
    cipher
        .decrypt(nonce, &data[IV_LEN..])
        .map_err(|_| WsSecurityError::Validation("decryption failed"))
}

/// Whether `uri` names a supported signature MAC algorithm.
pub fn is_supported_mac(uri: &str) -> bool {
    matches!(uri, algorithms::HMAC_SHA1 | algorithms::HMAC_SHA256)
}

/// Whether `uri` names a supported key derivation algorithm.
pub fn is_supported_derivation(uri: &str) -> bool {
    matches!(uri, algorithms::P_SHA1 | algorithms::P_SHA256)
}

/// Compute a MAC over `data`, selecting the hash by algorithm URI.
pub fn mac(algorithm: &str, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        algorithms::HMAC_SHA1 => Ok(hmac_sha1(key, data)),
        algorithms::HMAC_SHA256 => Ok(hmac_sha256(key, data)),
        other => Err(WsSecurityError::Usage(format!(
            "unsupported signature algorithm: {other}"
        ))),
    }
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts any key length
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!());
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!());
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derive key material with the P_hash construction used by
/// WS-SecureConversation: `seed = label || nonce`, expanded to
/// `offset + length` bytes, returning the `length` bytes at `offset`.
pub fn derive_key(
    algorithm: &str,
    source_key: &[u8],
    label: &[u8],
    nonce: &[u8],
    offset: usize,
    length: usize,
) -> Result<Vec<u8>> {
    if length == 0 {
        return Err(WsSecurityError::Usage(
            "derived key length must be non-zero".to_string(),
        ));
    }
    let mut seed = Vec::with_capacity(label.len() + nonce.len());
    seed.extend_from_slice(label);
    seed.extend_from_slice(nonce);

    let needed = offset + length;
    let stream = match algorithm {
        algorithms::P_SHA1 => p_hash(hmac_sha1, source_key, &seed, needed),
        algorithms::P_SHA256 => p_hash(hmac_sha256, source_key, &seed, needed),
        other => {
            return Err(WsSecurityError::Usage(format!(
                "unsupported derivation algorithm: {other}"
            )))
        }
    };
    Ok(stream[offset..needed].to_vec())
}

/// TLS-style P_hash expansion: A(0) = seed, A(i) = HMAC(secret, A(i-1)),
/// output = HMAC(secret, A(1) || seed) || HMAC(secret, A(2) || seed) || ...
fn p_hash(
    hmac: fn(&[u8], &[u8]) -> Vec<u8>,
    secret: &[u8],
    seed: &[u8],
    needed: usize,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(needed);
    let mut a = hmac(secret, seed);
    while out.len() < needed {
        let mut input = a.clone();
        input.extend_from_slice(seed);
        out.extend_from_slice(&hmac(secret, &input));
        a = hmac(secret, &a);
    }
    out.truncate(needed);
    out
}

/// Constant-time byte equality for MAC and nonce comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// SHA-256 fingerprint of key material, used as a cache identity for
/// source keys without retaining the key bytes themselves.
pub fn fingerprint(key: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.finalize().into()
}
