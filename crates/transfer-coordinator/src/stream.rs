//! Flow-controlled chunk pipe between a transfer session and the intercept
//! context.
//!
//! The writer never enqueues without first holding a reserved slot, so at
//! most `capacity` chunks are in memory per transfer no matter how fast the
//! producer is.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("chunk stream closed")]
pub struct StreamClosed;

/// Creates a writer/reader pair holding at most `capacity` chunks (min 1).
pub fn pipe(capacity: usize) -> (ChunkWriter, ChunkStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let writer = ChunkWriter {
        tx,
        closed: CancellationToken::new(),
    };
    (writer, ChunkStream { rx })
}

/// Writable half. Clones share the same close signal.
#[derive(Debug, Clone)]
pub struct ChunkWriter {
    tx: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

impl ChunkWriter {
    /// Readiness signal: waits for a free slot. Waiters are served in the
    /// order they started waiting. Resolves to [`StreamClosed`] once the
    /// writer is closed or the reader is gone.
    pub async fn ready(&self) -> Result<WritePermit<'_>, StreamClosed> {
        if self.closed.is_cancelled() {
            return Err(StreamClosed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(StreamClosed),
            permit = self.tx.reserve() => permit
                .map(|permit| WritePermit { permit })
                .map_err(|_| StreamClosed),
        }
    }

    /// Idempotent. Pending `ready` calls settle with [`StreamClosed`]; the
    /// reader sees end-of-stream after draining once every clone is dropped.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// A reserved slot; writing cannot block or fail.
pub struct WritePermit<'a> {
    permit: mpsc::Permit<'a, Bytes>,
}

impl WritePermit<'_> {
    pub fn write(self, chunk: Bytes) {
        self.permit.send(chunk);
    }
}

/// Readable half, handed to the intercept context.
#[derive(Debug)]
pub struct ChunkStream {
    rx: mpsc::Receiver<Bytes>,
}

impl ChunkStream {
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Drains the stream to its end.
    pub async fn read_to_end(mut self) -> Bytes {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }
}

impl Stream for ChunkStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use test_timeout::tokio_timeout_test;

    #[tokio_timeout_test(5)]
    async fn chunks_arrive_in_write_order() {
        let (writer, mut reader) = pipe(4);
        for part in ["a", "b", "c"] {
            writer
                .ready()
                .await
                .expect("open")
                .write(Bytes::from(part));
        }
        drop(writer);

        let mut seen = Vec::new();
        while let Some(chunk) = reader.next().await {
            seen.push(chunk);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio_timeout_test(5)]
    async fn ready_waits_for_the_reader() {
        let (writer, mut reader) = pipe(1);
        writer.ready().await.expect("open").write(Bytes::from_static(b"first"));
        assert_eq!(writer.available(), 0);

        let mut second = Box::pin(writer.ready());
        assert!(futures::poll!(second.as_mut()).is_pending());

        assert_eq!(reader.next_chunk().await.as_deref(), Some(&b"first"[..]));
        second.await.expect("slot freed").write(Bytes::from_static(b"second"));
        assert_eq!(reader.next_chunk().await.as_deref(), Some(&b"second"[..]));
    }

    #[tokio_timeout_test(5)]
    async fn close_releases_pending_waiters() {
        let (writer, reader) = pipe(1);
        writer.ready().await.expect("open").write(Bytes::from_static(b"x"));

        let waiter = writer.clone();
        let pending = tokio::spawn(async move { waiter.ready().await.map(|_| ()) });
        tokio::task::yield_now().await;
        writer.close();
        writer.close();

        assert_eq!(pending.await.expect("join"), Err(StreamClosed));
        assert!(writer.is_closed());
        drop(writer);
        assert_eq!(reader.read_to_end().await, Bytes::from_static(b"x"));
    }

    #[tokio_timeout_test(5)]
    async fn dropped_reader_closes_the_writer() {
        let (writer, reader) = pipe(1);
        drop(reader);
        assert!(writer.ready().await.is_err());
        assert!(writer.is_closed());
    }
}
