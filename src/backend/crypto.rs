// ============================================================================
// CRYPTO.RS - WI-FI SETUP PAYLOAD CIPHER
// RC4 keyed with the constant the vendor app ships, wrapped in base64
// ============================================================================

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::Value;

use crate::error::DecodeError;

/// Key string used by the vendor app. A compatibility constant, not a secret.
pub const KEY_STR: &str = "MTlCaWppbmdTaGFuZ2hhaVdpU2VuZ2xlZEZpMjBBQUJBU0U2NA==";

/// Stream cipher codec for the setup protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct WifiCrypto;

impl WifiCrypto {
    pub fn new() -> Self {
        Self
    }

    /// Encrypt raw bytes, returning base64(ciphertext)
    pub fn encode_bytes(&self, data: &[u8]) -> String {
        STANDARD.encode(rc4(KEY_STR.as_bytes(), data))
    }

    /// Serialize a value to JSON and encrypt it
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<String, DecodeError> {
        let json = serde_json::to_vec(value).map_err(|e| DecodeError::Json(e.to_string()))?;
        Ok(self.encode_bytes(&json))
    }

    /// Decrypt base64(ciphertext) back to the plaintext bytes
    pub fn decode_bytes(&self, b64: &str) -> Result<Vec<u8>, DecodeError> {
        let ciphertext = STANDARD
            .decode(b64.trim())
            .map_err(|e| DecodeError::Base64(e.to_string()))?;
        Ok(rc4(KEY_STR.as_bytes(), &ciphertext))
    }

    /// Decrypt and parse the plaintext as JSON
    pub fn decode(&self, b64: &str) -> Result<Value, DecodeError> {
        let plain = self.decode_bytes(b64)?;
        let text = std::str::from_utf8(&plain).map_err(|_| DecodeError::Utf8)?;
        serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))
    }
}

/// RC4 keystream XOR. Applying it twice with the same key is the identity.
fn rc4(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut s: [u8; 256] = [0; 256];
    for (i, slot) in s.iter_mut().enumerate() {
        *slot = i as u8;
    }

    let mut j: u8 = 0;
    for i in 0..256 {
        j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
        s.swap(i, j as usize);
    }

    let mut i: u8 = 0;
    j = 0;
    data.iter()
        .map(|byte| {
            i = i.wrapping_add(1);
            j = j.wrapping_add(s[i as usize]);
            s.swap(i as usize, j as usize);
            let k = s[s[i as usize].wrapping_add(s[j as usize]) as usize];
            byte ^ k
        })
        .collect()
}
