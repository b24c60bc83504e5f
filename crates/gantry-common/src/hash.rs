use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::Stream;
use md5::{Digest, Md5};
use pin_project_lite::pin_project;
use tokio::sync::watch;

use crate::error::{GantryError, Result};

pin_project! {
    #[derive(Debug)]
    pub struct HashedStream<S> {
        #[pin]
        inner: S,
        hasher: Option<Md5>,
        digest_tx: watch::Sender<Option<String>>,
    }
}

impl<S> HashedStream<S> {
    pub fn new(inner: S) -> (Self, ContentHash) {
        let (digest_tx, digest_rx) = watch::channel(None);
        let stream = Self {
            inner,
            hasher: Some(Md5::new()),
            digest_tx,
        };
        (stream, ContentHash { digest_rx })
    }
}

impl<S> Stream for HashedStream<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match ready!(this.inner.poll_next(cx)) {
            Some(Ok(chunk)) => {
                if let Some(hasher) = this.hasher.as_mut() {
                    hasher.update(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => {
                if let Some(hasher) = this.hasher.take() {
                    let digest = format!("{:x}", hasher.finalize());
                    this.digest_tx.send_replace(Some(digest));
                }
                Poll::Ready(None)
            }
        }
    }
}

/// Handle on the digest computed by a [`HashedStream`].
#[derive(Debug, Clone)]
pub struct ContentHash {
    digest_rx: watch::Receiver<Option<String>>,
}

impl ContentHash {
    pub fn is_completed(&self) -> bool {
        self.digest_rx.borrow().is_some()
    }

    /// The hex digest if every byte has already passed through.
    pub fn digest(&self) -> Option<String> {
        self.digest_rx.borrow().clone()
    }

    /// Resolves with the digest, immediately when it is already known.
    ///
    /// Fails when the stream was dropped before reaching its end.
    pub async fn wait(&self) -> Result<String> {
        let mut digest_rx = self.digest_rx.clone();
        let digest = digest_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| GantryError::InternalError)?
            .as_ref()
            .cloned();
        digest.ok_or(GantryError::InternalError)
    }
}
