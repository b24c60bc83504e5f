use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{RngCore, rngs::OsRng};

use crate::{CryptoError, Result};

const NONCE_SIZE: usize = 12;

/// Output is `nonce (12) || ciphertext || tag (16)`, with `aad` bound to it.
pub fn seal(key: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    let mut nonce_bytes = [0_u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encrypt)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + sealed.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&sealed);
    Ok(output)
}

pub fn open(key: &[u8; 32], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() <= NONCE_SIZE {
        return Err(CryptoError::InvalidCiphertext("missing nonce"));
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    let (nonce_bytes, encrypted) = sealed.split_at(NONCE_SIZE);

    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: encrypted,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::{open, seal};

    #[test]
    fn associated_data_is_bound() {
        let key = [7_u8; 32];
        let sealed = seal(&key, b"key-a", b"data key bytes").unwrap();
        assert_eq!(open(&key, b"key-a", &sealed).unwrap(), b"data key bytes");
        assert!(open(&key, b"key-b", &sealed).is_err());
        assert!(open(&key, b"key-a", &sealed[..8]).is_err());
    }
}
