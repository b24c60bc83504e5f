use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use futures::Stream;
use pin_project_lite::pin_project;

use crate::key::DataKey;
use crate::{CryptoError, Result};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

pub struct StreamTransform {
    cipher: Aes256Ctr,
}

impl fmt::Debug for StreamTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransform").finish_non_exhaustive()
    }
}

impl StreamTransform {
    /// Keystream positioned at byte `offset` of the object.
    pub fn new(data_key: &DataKey, offset: u64) -> Result<Self> {
        let (key, iv) = data_key.stream_material()?;
        let mut cipher = Aes256Ctr::new_from_slices(&key, &iv)
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
        cipher
            .try_seek(offset)
            .map_err(|_| CryptoError::OffsetOutOfRange(offset))?;
        Ok(Self { cipher })
    }

    pub fn apply(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
    }
}

pin_project! {
    /// Encrypts or decrypts every chunk of `inner`; CTR makes both the same
    /// operation.
    #[derive(Debug)]
    pub struct CipherStream<S> {
        #[pin]
        inner: S,
        transform: StreamTransform,
    }
}

impl<S> CipherStream<S> {
    pub fn new(inner: S, transform: StreamTransform) -> Self {
        Self { inner, transform }
    }
}

impl<S> Stream for CipherStream<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = ready!(this.inner.poll_next(cx)).map(|chunk| {
            chunk.map(|chunk| {
                let mut buf = BytesMut::from(&chunk[..]);
                this.transform.apply(&mut buf);
                buf.freeze()
            })
        });
        Poll::Ready(item)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::{StreamExt, stream};

    use super::{CipherStream, StreamTransform};
    use crate::key::DataKey;

    async fn run(transform: StreamTransform, parts: Vec<Vec<u8>>) -> Vec<u8> {
        let input = stream::iter(parts.into_iter().map(|p| Ok::<_, std::io::Error>(Bytes::from(p))));
        let mut out = Vec::new();
        let mut cipher = CipherStream::new(input, transform);
        while let Some(chunk) = cipher.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn chunking_does_not_change_ciphertext() {
        let key = DataKey::generate();
        let plain: Vec<u8> = (0..100_u8).collect();

        let whole = run(StreamTransform::new(&key, 0).unwrap(), vec![plain.clone()]).await;
        let split = run(
            StreamTransform::new(&key, 0).unwrap(),
            vec![plain[..7].to_vec(), plain[7..50].to_vec(), plain[50..].to_vec()],
        )
        .await;
        assert_eq!(whole, split);
        assert_ne!(whole, plain);
    }

    #[tokio::test]
    async fn range_decrypts_from_offset() {
        let key = DataKey::generate();
        let plain: Vec<u8> = (0..64_u8).collect();
        let cipher = run(StreamTransform::new(&key, 0).unwrap(), vec![plain.clone()]).await;

        // bytes 21..=40, deliberately not block aligned
        let ranged = run(
            StreamTransform::new(&key, 21).unwrap(),
            vec![cipher[21..=40].to_vec()],
        )
        .await;
        assert_eq!(ranged, &plain[21..=40]);
    }
}
