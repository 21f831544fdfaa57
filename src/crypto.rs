//! Encryption of provider config blobs at rest.
//!
//! Blob format: `base64(iv || ciphertext)` with AES-256-CTR, a random 16 byte
//! IV per blob, and the key derived as SHA-256 of the configured secret.

use aes::Aes256;
use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const IV_LEN: usize = 16;

#[derive(Clone)]
pub struct ConfigCipher {
    key: [u8; 32],
}

impl ConfigCipher {
    pub fn new(secret: &str) -> Self {
        Self {
            key: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let mut data = plaintext.to_vec();
        let mut cipher = Aes256Ctr::new(&self.key.into(), &iv.into());
        cipher.apply_keystream(&mut data);

        let mut blob = Vec::with_capacity(IV_LEN + data.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&data);
        STANDARD.encode(blob)
    }

    pub fn decrypt(&self, blob: &str) -> Result<Vec<u8>> {
        let raw = STANDARD
            .decode(blob.trim())
            .context("Encrypted config is not valid base64")?;
        if raw.len() < IV_LEN {
            bail!("Encrypted config is too short");
        }

        let (iv, ciphertext) = raw.split_at(IV_LEN);
        let iv: [u8; IV_LEN] = iv.try_into().context("Invalid IV length")?;
        let mut data = ciphertext.to_vec();
        let mut cipher = Aes256Ctr::new(&self.key.into(), &iv.into());
        cipher.apply_keystream(&mut data);
        Ok(data)
    }

    pub fn encrypt_json(&self, value: &serde_json::Value) -> Result<String> {
        let plaintext = serde_json::to_vec(value).context("Failed to encode provider config")?;
        Ok(self.encrypt(&plaintext))
    }

    /// An empty blob decodes to an empty config object
    pub fn decrypt_json(&self, blob: &str) -> Result<serde_json::Value> {
        if blob.is_empty() {
            return Ok(serde_json::Value::Object(Default::default()));
        }
        let plaintext = self.decrypt(blob)?;
        serde_json::from_slice(&plaintext)
            .context("Failed to decode provider config, is the config secret correct?")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_survives_encryption() {
        let cipher = ConfigCipher::new("secret");
        let config = json!({"url": "https://dav.example.com", "password": "hunter2"});

        let blob = cipher.encrypt_json(&config).unwrap();
        assert!(!blob.contains("hunter2"));
        assert_eq!(cipher.decrypt_json(&blob).unwrap(), config);
    }

    #[test]
    fn test_iv_differs_per_blob() {
        let cipher = ConfigCipher::new("secret");
        assert_ne!(cipher.encrypt(b"same"), cipher.encrypt(b"same"));
    }

    #[test]
    fn test_iv_uses_all_bits() {
        let cipher = ConfigCipher::new("secret");
        let ivs: Vec<Vec<u8>> = (0..64)
            .map(|_| STANDARD.decode(cipher.encrypt(b"x")).unwrap()[..IV_LEN].to_vec())
            .collect();
        // UUID v4 bytes would pin the version nibble and the variant bits
        let uuid_shaped = ivs.iter().all(|iv| iv[6] >> 4 == 4 && iv[8] >> 6 == 0b10);
        assert!(!uuid_shaped);
    }

    #[test]
    fn test_wrong_secret_fails_to_decode() {
        let blob = ConfigCipher::new("one").encrypt_json(&json!({"a": 1})).unwrap();
        assert!(ConfigCipher::new("two").decrypt_json(&blob).is_err());
        assert!(ConfigCipher::new("one").decrypt("AAAA").is_err());
    }

    #[test]
    fn test_empty_blob_is_empty_config() {
        let cipher = ConfigCipher::new("secret");
        assert_eq!(cipher.decrypt_json("").unwrap(), json!({}));
    }
}
