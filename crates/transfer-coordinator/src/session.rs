use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::stream::ChunkWriter;
use crate::trigger::TransferMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Streaming,
    Closed,
}

#[derive(Debug, Default)]
struct Progress {
    bytes: AtomicU64,
    chunks: AtomicU64,
}

/// What a `post` needs from a session: the writer plus progress counters.
/// Cloned out of the registry so no lock is held while waiting on the sink.
#[derive(Debug, Clone)]
pub struct SessionLink {
    pub writer: ChunkWriter,
    progress: Arc<Progress>,
}

impl SessionLink {
    pub fn record(&self, bytes: usize) {
        self.progress
            .bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.progress.chunks.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct TransferSession {
    meta: TransferMeta,
    link: SessionLink,
    state: SessionState,
}

impl TransferSession {
    pub fn new(meta: TransferMeta, writer: ChunkWriter) -> Self {
        Self {
            meta,
            link: SessionLink {
                writer,
                progress: Arc::default(),
            },
            state: SessionState::Created,
        }
    }

    pub fn generation(&self) -> u64 {
        self.meta.generation
    }

    /// Finalizes the writer; pending readiness waiters settle as closed.
    pub fn close(mut self) -> SessionSnapshot {
        self.link.writer.close();
        self.state = SessionState::Closed;
        self.snapshot()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.meta.id.clone(),
            file_name: self.meta.file_name.clone(),
            file_size: self.meta.file_size,
            chunk_count: self.meta.chunk_count,
            state: self.state,
            bytes_accepted: self.link.progress.bytes.load(Ordering::Relaxed),
            chunks_accepted: self.link.progress.chunks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_count: u64,
    pub state: SessionState,
    pub bytes_accepted: u64,
    pub chunks_accepted: u64,
}

/// Result of [`SessionRegistry::admit`].
#[derive(Debug)]
pub enum Admission {
    Fresh,
    /// The new session took the id; the previous one is handed back to be closed.
    Displaced(TransferSession),
    /// The id was taken and replacing was not allowed; the new session is handed back.
    Refused(TransferSession),
}

/// Live sessions by id. At most one writer per id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, TransferSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks for a live session under the id and registers `session` in one
    /// step.
    pub fn admit(&self, session: TransferSession, replace: bool) -> Admission {
        let mut sessions = self.sessions.lock();
        match sessions.entry(session.meta.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(session);
                Admission::Fresh
            }
            Entry::Occupied(_) if !replace => Admission::Refused(session),
            Entry::Occupied(mut slot) => Admission::Displaced(slot.insert(session)),
        }
    }

    pub fn mark_streaming(&self, id: &str) {
        if let Some(session) = self.sessions.lock().get_mut(id) {
            session.state = SessionState::Streaming;
        }
    }

    pub fn link(&self, id: &str) -> Option<SessionLink> {
        self.sessions
            .lock()
            .get(id)
            .map(|session| session.link.clone())
    }

    pub fn remove(&self, id: &str) -> Option<TransferSession> {
        self.sessions.lock().remove(id)
    }

    /// Removes the session only if it is still the one started as `generation`.
    pub fn remove_generation(&self, id: &str, generation: u64) -> Option<TransferSession> {
        let mut sessions = self.sessions.lock();
        match sessions.get(id) {
            Some(session) if session.generation() == generation => sessions.remove(id),
            _ => None,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<_> = self
            .sessions
            .lock()
            .values()
            .map(TransferSession::snapshot)
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::pipe;
    use bytes::Bytes;
    use test_timeout::tokio_timeout_test;

    fn session(id: &str) -> (TransferSession, crate::stream::ChunkStream) {
        let (writer, reader) = pipe(2);
        (
            TransferSession::new(TransferMeta::new(id, "a.bin", 8, 2), writer),
            reader,
        )
    }

    #[tokio_timeout_test(5)]
    async fn links_share_progress_with_the_session() {
        let registry = SessionRegistry::new();
        let (session, _reader) = session("f1");
        assert!(matches!(registry.admit(session, false), Admission::Fresh));
        registry.mark_streaming("f1");

        let link = registry.link("f1").expect("registered");
        link.writer
            .ready()
            .await
            .expect("open")
            .write(Bytes::from_static(b"abcd"));
        link.record(4);

        let snapshots = registry.snapshots();
        let snapshot = &snapshots[0];
        assert_eq!(snapshot.state, SessionState::Streaming);
        assert_eq!(snapshot.bytes_accepted, 4);
        assert_eq!(snapshot.chunks_accepted, 1);
    }

    #[tokio_timeout_test(5)]
    async fn removal_and_close_finalize_the_writer() {
        let registry = SessionRegistry::new();
        let (session, reader) = session("f1");
        registry.admit(session, false);
        let link = registry.link("f1").expect("registered");

        let closed = registry.remove("f1").expect("present").close();
        assert_eq!(closed.state, SessionState::Closed);
        assert!(registry.remove("f1").is_none());
        assert!(registry.link("f1").is_none());
        assert!(link.writer.ready().await.is_err());

        drop(link);
        assert!(reader.read_to_end().await.is_empty());
    }

    #[tokio_timeout_test(5)]
    async fn admit_displaces_or_refuses_in_one_step() {
        let registry = SessionRegistry::new();
        let (first, _r1) = session("dup");
        let (second, _r2) = session("dup");
        let (third, _r3) = session("dup");
        let first = TransferSession { meta: first.meta.with_generation(1), ..first };
        let second = TransferSession { meta: second.meta.with_generation(2), ..second };

        assert!(matches!(registry.admit(first, true), Admission::Fresh));
        let Admission::Displaced(displaced) = registry.admit(second, true) else {
            panic!("first session should be displaced");
        };
        assert_eq!(displaced.generation(), 1);
        assert_eq!(displaced.snapshot().state, SessionState::Created);

        let Admission::Refused(refused) = registry.admit(third, false) else {
            panic!("live id should refuse");
        };
        assert_eq!(refused.generation(), 0);
        assert_eq!(registry.ids(), vec!["dup".to_string()]);

        assert!(registry.remove_generation("dup", 1).is_none());
        assert_eq!(registry.remove_generation("dup", 2).map(|s| s.generation()), Some(2));
    }
}
