// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Authenticated encryption of individual blocks.
//!
//! A sealed block is laid out as
//! `nonce (12 bytes) || metadata length (u16, little endian) || metadata || AES-256-GCM ciphertext and tag`.
//! The metadata travels in the clear but is authenticated as associated data.

use crate::OramError;
use aes_gcm::aead::{generic_array::GenericArray, Aead, NewAead, Payload};
use aes_gcm::Aes256Gcm;
use rand::{CryptoRng, RngCore};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;
use zeroize::Zeroizing;

/// The length of an encryption key in bytes.
pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const METADATA_LENGTH_LEN: usize = 2;

/// A sealed block was tampered with, truncated, or sealed under a different key.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("Ciphertext failed authentication")]
pub struct AuthenticationError;

/// A 256-bit key. The key bytes are wiped from memory when the key is dropped.
pub struct EncryptionKey(Zeroizing<[u8; KEY_LEN]>);

impl EncryptionKey {
    /// Generates a fresh key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        rng.fill_bytes(&mut key[..]);
        Self(key)
    }

    /// Wraps existing key material.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Loads a hex-encoded key from `path`.
    pub fn load(path: &Path) -> Result<Self, OramError> {
        let encoded = Zeroizing::new(fs::read_to_string(path)?);
        let decoded = Zeroizing::new(hex::decode(encoded.trim()).map_err(|_| {
            OramError::InvalidConfigurationError {
                parameter_name: "key_file".to_string(),
                parameter_value: path.display().to_string(),
            }
        })?);

        if decoded.len() != KEY_LEN {
            return Err(OramError::InvalidConfigurationError {
                parameter_name: "key_length".to_string(),
                parameter_value: decoded.len().to_string(),
            });
        }

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&decoded);
        Ok(Self(key))
    }

    /// Loads the key at `path`, or generates one and writes it there if the file does not exist.
    ///
    /// A new key file is readable by its owner only. It is written to a temporary file in the
    /// same directory and moved into place, so `path` never holds a partial key.
    pub fn load_or_generate<R: RngCore + CryptoRng>(
        path: &Path,
        rng: &mut R,
    ) -> Result<Self, OramError> {
        if path.exists() {
            return Self::load(path);
        }

        log::info!("Generating a new encryption key at {}", path.display());
        let key = Self::generate(rng);
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(directory)?;
        file.write_all(Zeroizing::new(hex::encode(&key.0[..])).as_bytes())?;
        file.as_file().sync_all()?;
        // Another process may have created the key meanwhile; never replace it.
        file.persist_noclobber(path).map_err(|error| error.error)?;
        Ok(key)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey(..)")
    }
}

// AES-GCM encryption only fails for inputs larger than 64 GiB.
fn encryption_failed(error: aes_gcm::aead::Error) -> OramError {
    log::error!("AES-GCM encryption failed: {:?}", error);
    OramError::EncryptionError
}

/// Seals and opens blocks under a single process-wide key.
pub struct BlockCipher {
    cipher: Aes256Gcm,
}

impl BlockCipher {
    /// Returns a cipher using `key`.
    pub fn new(key: &EncryptionKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(GenericArray::from_slice(&key.0[..])),
        }
    }

    /// The length of a sealed block with the given plaintext and metadata lengths.
    pub fn sealed_len(plaintext_len: usize, metadata_len: usize) -> usize {
        NONCE_LEN + METADATA_LENGTH_LEN + metadata_len + plaintext_len + TAG_LEN
    }

    /// Encrypts `plaintext` under a fresh random nonce, authenticating `associated_metadata` alongside it.
    pub fn encrypt_block<R: RngCore + CryptoRng>(
        &self,
        plaintext: &[u8],
        associated_metadata: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>, OramError> {
        let metadata_length = u16::try_from(associated_metadata.len())?;

        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);

        let payload = Payload {
            msg: plaintext,
            aad: associated_metadata,
        };
        let ciphertext = self
            .cipher
            .encrypt(GenericArray::from_slice(&nonce), payload)
            .map_err(encryption_failed)?;

        let mut result = Vec::with_capacity(Self::sealed_len(
            plaintext.len(),
            associated_metadata.len(),
        ));
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&metadata_length.to_le_bytes());
        result.extend_from_slice(associated_metadata);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypts a block sealed by `encrypt_block`, returning the plaintext and the associated metadata.
    pub fn decrypt_block(
        &self,
        sealed: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), AuthenticationError> {
        if sealed.len() < Self::sealed_len(0, 0) {
            return Err(AuthenticationError);
        }

        let (nonce, rest) = sealed.split_at(NONCE_LEN);
        let (metadata_length, rest) = rest.split_at(METADATA_LENGTH_LEN);
        let metadata_length = usize::from(u16::from_le_bytes([
            metadata_length[0],
            metadata_length[1],
        ]));
        if rest.len() < metadata_length + TAG_LEN {
            return Err(AuthenticationError);
        }
        let (metadata, ciphertext) = rest.split_at(metadata_length);

        let payload = Payload {
            msg: ciphertext,
            aad: metadata,
        };
        let plaintext = self
            .cipher
            .decrypt(GenericArray::from_slice(nonce), payload)
            .map_err(|_| AuthenticationError)?;

        Ok((plaintext, metadata.to_vec()))
    }
}

impl fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockCipher(AES-256-GCM)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn cipher(seed: u64) -> BlockCipher {
        let mut rng = StdRng::seed_from_u64(seed);
        BlockCipher::new(&EncryptionKey::generate(&mut rng))
    }

    #[test]
    fn decrypt_recovers_plaintext_and_metadata() {
        let mut rng = StdRng::seed_from_u64(1);
        let cipher = cipher(0);
        let sealed = cipher
            .encrypt_block(b"ABC", b"slot-7", &mut rng)
            .unwrap();
        assert_eq!(sealed.len(), BlockCipher::sealed_len(3, 6));

        let (plaintext, metadata) = cipher.decrypt_block(&sealed).unwrap();
        assert_eq!(plaintext, b"ABC");
        assert_eq!(metadata, b"slot-7");
    }

    #[test]
    fn sealing_twice_gives_different_ciphertexts() {
        let mut rng = StdRng::seed_from_u64(1);
        let cipher = cipher(0);
        let first = cipher.encrypt_block(b"same", b"", &mut rng).unwrap();
        let second = cipher.encrypt_block(b"same", b"", &mut rng).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn tampering_is_detected() {
        let mut rng = StdRng::seed_from_u64(1);
        let cipher = cipher(0);
        let sealed = cipher.encrypt_block(b"payload", b"meta", &mut rng).unwrap();

        for position in [0, 13, 15, sealed.len() - 1] {
            let mut tampered = sealed.clone();
            tampered[position] ^= 1;
            assert_eq!(cipher.decrypt_block(&tampered), Err(AuthenticationError));
        }

        assert_eq!(
            cipher.decrypt_block(&sealed[..sealed.len() - 1]),
            Err(AuthenticationError)
        );
        assert_eq!(cipher.decrypt_block(&[]), Err(AuthenticationError));
    }

    #[test]
    fn wrong_key_is_detected() {
        let mut rng = StdRng::seed_from_u64(1);
        let sealed = cipher(0).encrypt_block(b"payload", b"", &mut rng).unwrap();
        assert_eq!(cipher(1).decrypt_block(&sealed), Err(AuthenticationError));
    }

    #[test]
    fn key_files_round_trip() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("oram.key");
        let mut rng = StdRng::seed_from_u64(3);

        let generated = EncryptionKey::load_or_generate(&path, &mut rng).unwrap();
        let loaded = EncryptionKey::load_or_generate(&path, &mut rng).unwrap();
        assert_eq!(&generated.0[..], &loaded.0[..]);

        std::fs::write(&path, "not hex").unwrap();
        assert!(EncryptionKey::load(&path).is_err());
    }

    #[test]
    fn generated_key_file_is_private_and_complete() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("oram.key");
        let mut rng = StdRng::seed_from_u64(4);
        EncryptionKey::load_or_generate(&path, &mut rng).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.len(), 2 * KEY_LEN);
        let entries: Vec<_> = std::fs::read_dir(directory.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("oram.key")]);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o077, 0, "key file mode is {mode:o}");
        }
    }

    #[test]
    fn encryption_failure_has_its_own_error() {
        let error = encryption_failed(aes_gcm::aead::Error);
        assert!(matches!(error, OramError::EncryptionError));
        assert!(!error.is_transient());
        assert_eq!(error.to_string(), "Block encryption failed");
    }
}
