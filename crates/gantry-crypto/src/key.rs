use hkdf::Hkdf;
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;

use crate::cipher;
use crate::{CryptoError, Result};

const KEY_SIZE: usize = 32;
const STREAM_IV_SIZE: usize = 16;
const HKDF_SALT: &[u8] = b"gantry-sse-v1";
const STREAM_KEY_INFO: &[u8] = b"aes-256-ctr key";
const STREAM_IV_INFO: &[u8] = b"aes-256-ctr iv";

/// Long-lived key held by the key manager; never leaves it.
#[derive(Debug, Clone)]
pub struct MasterKey {
    key: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut key = [0_u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }

        let mut key = [0_u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Seals `data_key` for storage next to the object it protects.
    pub fn wrap_data_key(&self, key_id: &str, data_key: &DataKey) -> Result<Vec<u8>> {
        cipher::seal(&self.key, key_id.as_bytes(), &data_key.key)
    }

    pub fn unwrap_data_key(&self, key_id: &str, ciphered: &[u8]) -> Result<DataKey> {
        let plain = cipher::open(&self.key, key_id.as_bytes(), ciphered)?;
        DataKey::from_bytes(&plain)
    }
}

/// Per-object key. Only its sealed form is persisted.
#[derive(Clone)]
pub struct DataKey {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey").finish_non_exhaustive()
    }
}

impl DataKey {
    pub fn generate() -> Self {
        let mut key = [0_u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }

        let mut key = [0_u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Key and initial counter block for the CTR stream transform.
    pub fn stream_material(&self) -> Result<([u8; KEY_SIZE], [u8; STREAM_IV_SIZE])> {
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), &self.key);
        let mut key = [0_u8; KEY_SIZE];
        let mut iv = [0_u8; STREAM_IV_SIZE];
        hk.expand(STREAM_KEY_INFO, &mut key)
            .map_err(|_| CryptoError::KeyDerivation)?;
        hk.expand(STREAM_IV_INFO, &mut iv)
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok((key, iv))
    }
}

#[cfg(test)]
mod tests {
    use super::{DataKey, MasterKey};

    #[test]
    fn wrapped_data_key_unwraps_to_same_stream_material() {
        let master = MasterKey::generate();
        let data_key = DataKey::generate();
        let sealed = master.wrap_data_key("mk-1", &data_key).unwrap();

        let reopened = master.unwrap_data_key("mk-1", &sealed).unwrap();
        assert_eq!(
            reopened.stream_material().unwrap(),
            data_key.stream_material().unwrap()
        );
        assert!(MasterKey::generate().unwrap_data_key("mk-1", &sealed).is_err());
    }

    #[test]
    fn rejects_short_master_key() {
        assert!(MasterKey::from_bytes(&[0_u8; 16]).is_err());
    }
}
