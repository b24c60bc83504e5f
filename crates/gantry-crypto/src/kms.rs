use std::collections::HashMap;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use gantry_common::types::EncryptionInfo;
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::key::{DataKey, MasterKey};
use crate::stream::{CipherStream, StreamTransform};
use crate::{CryptoError, Result};

pub const CRYPTO_SCHEME_AES256_CTR: u8 = 1;
pub const BLOB_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SseAlgorithm {
    #[serde(rename = "AES256")]
    Aes256,
    #[serde(rename = "aws:kms")]
    AwsKms,
}

/// Server-side encryption settings of a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub algorithm: SseAlgorithm,
    pub master_key_id: String,
}

/// Encrypt side of a put: the live transform plus what must be persisted to
/// rebuild the matching decrypt transform later.
#[derive(Debug)]
pub struct CipherBundle {
    pub crypto_scheme: u8,
    pub master_key_id: String,
    pub ciphered_data_key: Vec<u8>,
    transform: StreamTransform,
}

impl CipherBundle {
    pub fn encryption_info(&self) -> EncryptionInfo {
        EncryptionInfo {
            crypto_scheme: self.crypto_scheme,
            master_key_id: self.master_key_id.clone(),
            ciphered_data_key: BASE64_STANDARD.encode(&self.ciphered_data_key),
            blob_version: BLOB_VERSION,
        }
    }

    pub fn encrypt<S>(self, stream: S) -> CipherStream<S> {
        CipherStream::new(stream, self.transform)
    }
}

#[derive(Debug)]
pub struct DecipherBundle {
    transform: StreamTransform,
}

impl DecipherBundle {
    pub fn decrypt<S>(self, stream: S) -> CipherStream<S> {
        CipherStream::new(stream, self.transform)
    }
}

/// Key management collaborator. Errors carry remediation detail and are
/// handed to callers unchanged.
#[async_trait]
pub trait KeyManager: std::fmt::Debug + Send + Sync {
    async fn create_cipher_bundle(
        &self,
        config: &EncryptionConfig,
        request_id: &str,
    ) -> Result<CipherBundle>;

    /// `offset` is the first plaintext byte the caller will read.
    async fn create_decipher_bundle(
        &self,
        info: &EncryptionInfo,
        offset: u64,
        request_id: &str,
    ) -> Result<DecipherBundle>;
}

/// In-process key manager holding named master keys.
#[derive(Debug, Clone, Default)]
pub struct LocalKms {
    keys: HashMap<String, MasterKey>,
}

impl LocalKms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_master_key(mut self, id: impl Into<String>, key: MasterKey) -> Self {
        self.keys.insert(id.into(), key);
        self
    }

    /// Creates a fresh master key, as done when encryption is enabled on a
    /// bucket, and returns its id.
    pub fn create_master_key(&mut self) -> String {
        let mut raw = [0_u8; 16];
        OsRng.fill_bytes(&mut raw);
        let id = hex::encode(raw);
        self.keys.insert(id.clone(), MasterKey::generate());
        id
    }

    pub fn contains(&self, id: &str) -> bool {
        self.keys.contains_key(id)
    }

    fn master_key(&self, id: &str) -> Result<&MasterKey> {
        self.keys
            .get(id)
            .ok_or_else(|| CryptoError::UnknownMasterKey(id.to_string()))
    }
}

#[async_trait]
impl KeyManager for LocalKms {
    async fn create_cipher_bundle(
        &self,
        config: &EncryptionConfig,
        request_id: &str,
    ) -> Result<CipherBundle> {
        let master = self.master_key(&config.master_key_id)?;
        let data_key = DataKey::generate();
        let ciphered_data_key = master.wrap_data_key(&config.master_key_id, &data_key)?;
        let transform = StreamTransform::new(&data_key, 0)?;
        debug!(
            request_id,
            master_key_id = %config.master_key_id,
            algorithm = ?config.algorithm,
            "created cipher bundle"
        );

        Ok(CipherBundle {
            crypto_scheme: CRYPTO_SCHEME_AES256_CTR,
            master_key_id: config.master_key_id.clone(),
            ciphered_data_key,
            transform,
        })
    }

    async fn create_decipher_bundle(
        &self,
        info: &EncryptionInfo,
        offset: u64,
        request_id: &str,
    ) -> Result<DecipherBundle> {
        if info.crypto_scheme != CRYPTO_SCHEME_AES256_CTR {
            return Err(CryptoError::UnsupportedScheme(info.crypto_scheme));
        }
        let master = self.master_key(&info.master_key_id)?;
        let ciphered = BASE64_STANDARD.decode(&info.ciphered_data_key)?;
        let data_key = master.unwrap_data_key(&info.master_key_id, &ciphered)?;
        debug!(request_id, master_key_id = %info.master_key_id, offset, "created decipher bundle");

        Ok(DecipherBundle {
            transform: StreamTransform::new(&data_key, offset)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::{TryStreamExt, stream};

    use super::{EncryptionConfig, KeyManager, LocalKms, SseAlgorithm};
    use crate::CryptoError;

    #[tokio::test]
    async fn bundle_round_trip_with_offset() {
        let mut kms = LocalKms::new();
        let key_id = kms.create_master_key();
        let config = EncryptionConfig {
            algorithm: SseAlgorithm::Aes256,
            master_key_id: key_id,
        };

        let bundle = kms.create_cipher_bundle(&config, "req-1").await.unwrap();
        let info = bundle.encryption_info();
        let plain = Bytes::from_static(b"the quick brown fox jumps over the lazy dog");
        let cipher: Vec<Bytes> = bundle
            .encrypt(stream::iter(vec![Ok::<_, std::io::Error>(plain.clone())]))
            .try_collect()
            .await
            .unwrap();
        let cipher = cipher.concat();

        let decipher = kms.create_decipher_bundle(&info, 10, "req-2").await.unwrap();
        let out: Vec<Bytes> = decipher
            .decrypt(stream::iter(vec![Ok::<_, std::io::Error>(Bytes::copy_from_slice(&cipher[10..]))]))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(out.concat(), &plain[10..]);
    }

    #[tokio::test]
    async fn unknown_master_key_is_reported() {
        let kms = LocalKms::new();
        let config = EncryptionConfig {
            algorithm: SseAlgorithm::AwsKms,
            master_key_id: "missing".to_string(),
        };
        let err = kms.create_cipher_bundle(&config, "req").await.unwrap_err();
        assert!(matches!(err, CryptoError::UnknownMasterKey(id) if id == "missing"));
    }
}
