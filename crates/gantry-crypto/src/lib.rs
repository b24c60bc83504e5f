pub mod cipher;
pub mod key;
pub mod kms;
pub mod stream;

pub use key::{DataKey, MasterKey};
pub use kms::{CipherBundle, DecipherBundle, EncryptionConfig, KeyManager, LocalKms, SseAlgorithm};
pub use stream::CipherStream;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(&'static str),
    #[error("encryption failure")]
    Encrypt,
    #[error("decryption failure")]
    Decrypt,
    #[error("key derivation failure")]
    KeyDerivation,
    #[error("unknown master key: {0}")]
    UnknownMasterKey(String),
    #[error("unsupported crypto scheme: {0}")]
    UnsupportedScheme(u8),
    #[error("malformed ciphered data key: {0}")]
    MalformedDataKey(#[from] base64::DecodeError),
    #[error("cipher offset out of range: {0}")]
    OffsetOutOfRange(u64),
}

impl From<CryptoError> for gantry_common::GantryError {
    fn from(err: CryptoError) -> Self {
        Self::KeyManagement(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CryptoError>;
