use std::future::Future;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use gantry_common::error::{GantryError, Result};
use gantry_common::types::ByteStream;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// The output of a retrieval, typically an HTTP response body.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn send(&mut self, chunk: Bytes) -> io::Result<()>;

    /// Resolves once the consumer has gone away.
    async fn closed(&self);

    fn is_closed(&self) -> bool;

    /// Signals end of stream.
    fn finish(&mut self);

    /// Tears the sink down after a failure.
    fn abort(&mut self, err: io::Error);
}

/// [`ResponseSink`] over a bounded tokio channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Option<mpsc::Sender<io::Result<Bytes>>>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<io::Result<Bytes>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }
}

#[async_trait]
impl ResponseSink for ChannelSink {
    async fn send(&mut self, chunk: Bytes) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "response already finished"))?;
        tx.send(Ok(chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response receiver dropped"))
    }

    async fn closed(&self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => {}
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(mpsc::Sender::is_closed)
    }

    fn finish(&mut self) {
        self.tx.take();
    }

    fn abort(&mut self, err: io::Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.try_send(Err(err));
        }
    }
}

/// Streams `parts` into `sink` in order using `retrieve` to open each one.
/// Part `n + 1` is opened only after part `n` has drained.
///
/// Returns exactly one outcome: `Ok` once every part drained and the sink
/// was finished, [`GantryError::ResponseClosed`] when the consumer left
/// early, or the first retrieval or stream error.
pub async fn retrieve_data<I, F, Fut, S>(parts: I, mut retrieve: F, sink: &mut S) -> Result<()>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<ByteStream>>,
    S: ResponseSink + ?Sized,
{
    for (index, part) in parts.into_iter().enumerate() {
        if sink.is_closed() {
            debug!(part = index, "response closed before part was fetched");
            sink.finish();
            return Err(GantryError::ResponseClosed);
        }

        let readable = match retrieve(part).await {
            Ok(readable) => readable,
            Err(err) => {
                error!(part = index, error = %err, "failed to open part for retrieval");
                sink.abort(io::Error::other(err.to_string()));
                return Err(err);
            }
        };

        match drain(readable, sink).await {
            Ok(()) => {}
            Err(GantryError::ResponseClosed) => {
                debug!(part = index, "response closed by client while streaming part");
                sink.finish();
                return Err(GantryError::ResponseClosed);
            }
            Err(err) => {
                error!(part = index, error = %err, "error streaming part into response");
                sink.abort(io::Error::other(err.to_string()));
                return Err(err);
            }
        }
    }

    sink.finish();
    Ok(())
}

/// Copies one part into the sink. Dropping `readable` on an early return
/// releases the backend stream.
async fn drain<S>(mut readable: ByteStream, sink: &mut S) -> Result<()>
where
    S: ResponseSink + ?Sized,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = sink.closed() => return Err(GantryError::ResponseClosed),
            next = readable.next() => next,
        };
        match next {
            None => return Ok(()),
            Some(Err(err)) => return Err(GantryError::Stream(err)),
            Some(Ok(chunk)) => {
                if sink.send(chunk).await.is_err() {
                    return Err(GantryError::ResponseClosed);
                }
            }
        }
    }
}
