use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, Stream, StreamExt};
use gantry_common::types::{ByteRange, ByteStream, DiskUsage, HealthStatus, KeyContext};
use pin_project_lite::pin_project;

use crate::error::{DriverError, DriverResult};

/// Writable end handed to drivers that push object bytes instead of
/// returning a stream.
pub type ByteSink = futures::channel::mpsc::Sender<io::Result<Bytes>>;

/// Server-side copy handed to a driver that can copy within its own store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCopyRequest {
    pub source_key: String,
    pub source_location: String,
    pub dest_location: String,
    pub dest_bucket: String,
    pub dest_object_key: Option<String>,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedObject {
    pub key: String,
    pub data_store_name: String,
    pub data_store_type: Option<String>,
}

/// A storage backend holding opaque blobs under keys it chooses itself.
#[async_trait]
pub trait DataDriver: fmt::Debug + Send + Sync {
    /// Name recorded as `data_store_name` on every location this driver
    /// produces.
    fn name(&self) -> &str;

    /// Stores exactly `size` bytes and returns the new key.
    async fn put(
        &self,
        stream: ByteStream,
        size: u64,
        ctx: &KeyContext,
        request_id: &str,
    ) -> DriverResult<String>;

    async fn get(
        &self,
        key: &str,
        range: Option<ByteRange>,
        request_id: &str,
    ) -> DriverResult<ByteStream>;

    /// Writes the object into `sink`. Drivers whose client library only
    /// downloads into a writable target override this and report
    /// [`DataDriver::writes_to_sink`].
    async fn get_into(
        &self,
        key: &str,
        range: Option<ByteRange>,
        sink: ByteSink,
        request_id: &str,
    ) -> DriverResult<()> {
        let stream = self.get(key, range, request_id).await?;
        pump(stream, sink).await
    }

    fn writes_to_sink(&self) -> bool {
        false
    }

    async fn delete(&self, key: &str, request_id: &str) -> DriverResult<()>;

    /// Never fails: a degraded backend reports [`HealthStatus::Error`].
    async fn healthcheck(&self, request_id: &str) -> HealthStatus;

    async fn disk_usage(&self, _request_id: &str) -> DriverResult<Option<DiskUsage>> {
        Ok(None)
    }

    async fn copy_object(
        &self,
        _request: &NativeCopyRequest,
        _request_id: &str,
    ) -> DriverResult<CopiedObject> {
        Err(DriverError::Unsupported {
            backend: self.name().to_string(),
            operation: "copy_object",
        })
    }
}

/// Drains `stream` into `sink`. A read failure is forwarded to the sink
/// before it is returned, so the consumer does not mistake it for a clean end.
pub async fn pump(mut stream: ByteStream, mut sink: ByteSink) -> DriverResult<()> {
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                sink.send(Ok(chunk)).await.map_err(|_| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "byte sink closed")
                })?;
            }
            Err(err) => {
                let _ = sink
                    .send(Err(io::Error::new(err.kind(), err.to_string())))
                    .await;
                return Err(err.into());
            }
        }
    }
    Ok(())
}

pin_project! {
    /// Fails the stream unless it yields exactly `expected` bytes.
    ///
    /// The chunk completing `expected` is held back until the inner stream
    /// has reported its end, so consumers that stop polling once they have
    /// the declared length still drive the inner stream to completion.
    #[derive(Debug)]
    pub struct ExactSizeStream<S> {
        #[pin]
        inner: S,
        expected: u64,
        seen: u64,
        held: Option<Bytes>,
        done: bool,
    }
}

impl<S> ExactSizeStream<S> {
    pub fn new(inner: S, expected: u64) -> Self {
        Self {
            inner,
            expected,
            seen: 0,
            held: None,
            done: false,
        }
    }
}

fn size_mismatch(expected: u64, seen: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("stream size mismatch: expected {expected} bytes, got {seen}"),
    )
}

impl<S> Stream for ExactSizeStream<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if *this.done {
                return Poll::Ready(None);
            }
            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => {
                    *this.seen += chunk.len() as u64;
                    if *this.seen > *this.expected {
                        *this.done = true;
                        this.held.take();
                        return Poll::Ready(Some(Err(size_mismatch(*this.expected, *this.seen))));
                    }
                    if *this.seen == *this.expected {
                        *this.held = Some(chunk);
                        continue;
                    }
                    return Poll::Ready(Some(Ok(chunk)));
                }
                Some(Err(err)) => {
                    *this.done = true;
                    this.held.take();
                    return Poll::Ready(Some(Err(err)));
                }
                None => {
                    *this.done = true;
                    if let Some(chunk) = this.held.take() {
                        return Poll::Ready(Some(Ok(chunk)));
                    }
                    if *this.seen != *this.expected {
                        return Poll::Ready(Some(Err(size_mismatch(*this.expected, *this.seen))));
                    }
                    return Poll::Ready(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::{StreamExt, TryStreamExt, stream};
    use gantry_common::HashedStream;

    use super::{ExactSizeStream, pump};

    fn body(parts: &[&'static str]) -> gantry_common::ByteStream {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    #[tokio::test]
    async fn exact_size_accepts_matching_length() {
        let out: Vec<Bytes> = ExactSizeStream::new(body(&["ab", "cd"]), 4)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(out.concat(), b"abcd");
    }

    #[tokio::test]
    async fn exact_size_rejects_short_and_long_bodies() {
        let short: Result<Vec<Bytes>, _> =
            ExactSizeStream::new(body(&["ab"]), 4).try_collect().await;
        assert_eq!(short.unwrap_err().kind(), std::io::ErrorKind::InvalidData);

        let long: Result<Vec<Bytes>, _> =
            ExactSizeStream::new(body(&["ab", "cde"]), 4).try_collect().await;
        assert_eq!(long.unwrap_err().kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn last_chunk_waits_for_end_of_inner_stream() {
        let (hashed, hash) = HashedStream::new(body(&["ab", "cd"]));
        let mut exact = ExactSizeStream::new(hashed, 4);

        let mut received = 0;
        while received < 4 {
            received += exact.next().await.unwrap().unwrap().len();
        }
        assert!(hash.is_completed());
    }

    #[tokio::test]
    async fn pump_forwards_every_chunk() {
        let (tx, rx) = futures::channel::mpsc::channel(1);
        let (pumped, received) = tokio::join!(
            pump(body(&["one", "two"]), tx),
            rx.try_collect::<Vec<Bytes>>()
        );
        pumped.unwrap();
        assert_eq!(received.unwrap().concat(), b"onetwo");
    }
}
