use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt, stream};
use gantry_common::types::{ByteRange, ByteStream, HealthStatus, KeyContext};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{DriverError, DriverResult};
use crate::traits::{DataDriver, ExactSizeStream};

pub const MEMORY_BACKEND_NAME: &str = "mem";

/// Process-local blob map. Keys are a monotonically increasing counter.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<HashMap<String, Bytes>>,
    next_key: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl DataDriver for MemoryBackend {
    fn name(&self) -> &str {
        MEMORY_BACKEND_NAME
    }

    async fn put(
        &self,
        stream: ByteStream,
        size: u64,
        _ctx: &KeyContext,
        request_id: &str,
    ) -> DriverResult<String> {
        // nothing is inserted until the whole body has been read
        let body = ExactSizeStream::new(stream, size)
            .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await?
            .freeze();

        let key = self.next_key.fetch_add(1, Ordering::Relaxed).to_string();
        self.objects.write().await.insert(key.clone(), body);
        debug!(request_id, key = %key, size, "stored object in memory");
        Ok(key)
    }

    async fn get(
        &self,
        key: &str,
        range: Option<ByteRange>,
        _request_id: &str,
    ) -> DriverResult<ByteStream> {
        let body = self
            .objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(key.to_string()))?;

        let body = match range {
            None => body,
            Some(range) => match range.clamp_to(body.len() as u64) {
                Some(range) => body.slice(range.start as usize..=range.end as usize),
                None => Bytes::new(),
            },
        };
        Ok(stream::iter([Ok::<_, std::io::Error>(body)]).boxed())
    }

    async fn delete(&self, key: &str, _request_id: &str) -> DriverResult<()> {
        self.objects
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| DriverError::NotFound(key.to_string()))
    }

    async fn healthcheck(&self, _request_id: &str) -> HealthStatus {
        HealthStatus::ok()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::{StreamExt, TryStreamExt, stream};
    use gantry_common::types::{ByteRange, KeyContext};

    use super::MemoryBackend;
    use crate::traits::DataDriver;

    fn body(data: &'static [u8]) -> gantry_common::ByteStream {
        stream::iter([Ok(Bytes::from_static(data))]).boxed()
    }

    async fn read(backend: &MemoryBackend, key: &str, range: Option<ByteRange>) -> Vec<u8> {
        let chunks: Vec<Bytes> = backend
            .get(key, range, "req")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn put_get_delete() {
        let backend = MemoryBackend::new();
        let ctx = KeyContext::new("bucket", "owner", "ns");
        let key = backend.put(body(b"I am a body"), 11, &ctx, "req").await.unwrap();

        assert_eq!(read(&backend, &key, None).await, b"I am a body");
        assert_eq!(
            read(&backend, &key, Some(ByteRange::new(2, 3).unwrap())).await,
            b"am"
        );

        backend.delete(&key, "req").await.unwrap();
        assert!(matches!(backend.get(&key, None, "req").await, Err(err) if err.is_not_found()));
        assert!(backend.delete(&key, "req").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn short_body_is_not_stored() {
        let backend = MemoryBackend::new();
        let ctx = KeyContext::new("bucket", "owner", "ns");
        assert!(backend.put(body(b"short"), 11, &ctx, "req").await.is_err());
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn keys_are_unique() {
        let backend = MemoryBackend::new();
        let ctx = KeyContext::new("bucket", "owner", "ns");
        let first = backend.put(body(b"a"), 1, &ctx, "req").await.unwrap();
        let second = backend.put(body(b"a"), 1, &ctx, "req").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(backend.len().await, 2);
    }
}
