// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Encryption
//!
//! Message bodies travel encrypted. Producer and consumer share a key out of
//! band; the key string is stretched with SHA-256 into a ChaCha20-Poly1305
//! key. Each payload gets a fresh random nonce and the wire text is the hex
//! encoding of `nonce || ciphertext`.

use crate::errors::AmqpError;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::error;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct Cryptographer {
    cipher: ChaCha20Poly1305,
}

impl Cryptographer {
    pub fn new(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        Cryptographer {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&digest)),
        }
    }

    /// Encrypts `plaintext` into hex text.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, AmqpError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|err| {
                error!(error = %err, "failure to encrypt payload");
                AmqpError::EncryptionError
            })?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        Ok(hex::encode(sealed))
    }

    /// Decrypts hex text produced by [`Cryptographer::encrypt`] with the same key.
    pub fn decrypt(&self, input: &str) -> Result<Vec<u8>, AmqpError> {
        let sealed = hex::decode(input.trim()).map_err(|_| {
            AmqpError::DecryptionError("trying to decrypt non encrypted string".to_owned())
        })?;

        if sealed.len() < NONCE_LEN {
            return Err(AmqpError::DecryptionError(
                "trying to decrypt non encrypted string".to_owned(),
            ));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AmqpError::DecryptionError("authentication failed".to_owned()))
    }

    /// Decrypts and interprets the plaintext as UTF-8.
    pub fn decrypt_to_string(&self, input: &str) -> Result<String, AmqpError> {
        let plaintext = self.decrypt(input)?;
        String::from_utf8(plaintext).map_err(|err| AmqpError::DecryptionError(err.to_string()))
    }
}

impl fmt::Debug for Cryptographer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cryptographer(<redacted>)")
    }
}
