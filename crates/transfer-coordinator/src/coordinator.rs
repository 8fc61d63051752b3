use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channel::ControlChannel;
use crate::config::{CoordinatorConfig, DuplicatePolicy};
use crate::error::{TransferError, TransferResult};
use crate::host::{Document, InterceptHandle, InterceptHost};
use crate::protocol::ControlMessage;
use crate::registrar::Registrar;
use crate::session::{Admission, SessionRegistry, SessionSnapshot, TransferSession};
use crate::stream::pipe;
use crate::trigger::{DownloadTrigger, TransferMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// The chunk was accepted by the session's sink.
    Delivered,
    /// No session is registered under the id; nothing was written.
    UnknownSession,
    /// The session closed while the chunk waited for capacity.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    Unknown,
}

struct Inner {
    config: CoordinatorConfig,
    registrar: Registrar,
    channel: ControlChannel,
    sessions: SessionRegistry,
    trigger: DownloadTrigger,
    starting: Mutex<()>,
    generations: AtomicU64,
    shut_down: AtomicBool,
}

/// Page-side owner of the intercept registration, the control channel and
/// every live transfer. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct TransferCoordinator {
    inner: Arc<Inner>,
}

impl TransferCoordinator {
    pub fn open(
        config: CoordinatorConfig,
        host: Arc<dyn InterceptHost>,
        document: Arc<dyn Document>,
    ) -> Self {
        let registrar = Registrar::new(host, &config);
        Self {
            inner: Arc::new(Inner {
                registrar,
                channel: ControlChannel::new(),
                sessions: SessionRegistry::new(),
                trigger: DownloadTrigger::new(document),
                starting: Mutex::new(()),
                generations: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
                config,
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Resolves the intercept context, adopting an existing one when the host
    /// has it. Later calls return the cached handle.
    pub async fn register(&self) -> TransferResult<InterceptHandle> {
        self.ensure_open()?;
        Ok(self.inner.registrar.register().await?)
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registrar.handle().is_some()
    }

    /// Opens a session: hands the readable half to the intercept context,
    /// records the writer and fires the download trigger.
    pub fn start(&self, meta: TransferMeta) -> TransferResult<()> {
        self.ensure_open()?;
        let handle = self
            .inner
            .registrar
            .handle()
            .ok_or(TransferError::NotRegistered)?;

        // Starts are serialized so control messages for one id never interleave.
        let _starting = self.inner.starting.lock();
        let sender = self.inner.channel.ensure(&handle)?;
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let meta = meta.with_generation(generation);
        let (writer, readable) = pipe(self.inner.config.stream_buffer);

        let replace = self.inner.config.duplicate_policy == DuplicatePolicy::Replace;
        match self
            .inner
            .sessions
            .admit(TransferSession::new(meta.clone(), writer), replace)
        {
            Admission::Fresh => {}
            Admission::Refused(_) => {
                warn!(id = %meta.id, "start rejected: transfer already live");
                return Err(TransferError::DuplicateSession { id: meta.id });
            }
            Admission::Displaced(previous) => {
                warn!(
                    id = %meta.id,
                    previous = previous.generation(),
                    generation,
                    "replacing live transfer with the same id"
                );
                self.retire(&meta.id, Some(previous));
            }
        }

        let announce = ControlMessage::TransferStart {
            id: meta.id.clone(),
            generation,
            readable,
        };
        if let Err(err) = sender.post(announce) {
            warn!(id = %meta.id, error = %err, "control channel lost; it will be rebuilt on the next start");
            if let Some(session) = self.inner.sessions.remove_generation(&meta.id, generation) {
                session.close();
            }
            self.inner.channel.reset();
            return Err(TransferError::ChannelClosed);
        }

        info!(
            id = %meta.id,
            generation,
            file_name = %meta.file_name,
            file_size = meta.file_size,
            chunks = meta.chunk_count,
            "transfer started"
        );
        self.inner.trigger.fire(&meta);
        self.inner.sessions.mark_streaming(&meta.id);
        Ok(())
    }

    /// Writes one chunk once the session's sink has room. Chunks posted to the
    /// same id land in call order.
    pub async fn post(&self, id: &str, chunk: Bytes) -> TransferResult<PostOutcome> {
        let Some(link) = self.inner.sessions.link(id) else {
            debug!(id = %id, "post to unknown transfer ignored");
            return Ok(PostOutcome::UnknownSession);
        };

        let ready = link.writer.ready();
        let permit = match self.inner.config.post_timeout {
            Some(limit) => match tokio::time::timeout(limit, ready).await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(id = %id, waited = ?limit, "sink did not signal capacity");
                    return Err(TransferError::Stalled {
                        id: id.to_string(),
                        waited: limit,
                    });
                }
            },
            None => ready.await,
        };
        let Ok(permit) = permit else {
            debug!(id = %id, "transfer closed before chunk was accepted");
            return Ok(PostOutcome::Closed);
        };

        let len = chunk.len();
        permit.write(chunk);
        link.record(len);
        debug!(id = %id, bytes = len, "chunk accepted");
        Ok(PostOutcome::Delivered)
    }

    /// Ends a transfer. Safe to call repeatedly or for ids never started.
    pub fn close(&self, id: &str) -> CloseOutcome {
        let session = self.inner.sessions.remove(id);
        self.retire(id, session)
    }

    /// Detaches the trigger, sends TRANSFER_CLOSE and finalizes `session`.
    fn retire(&self, id: &str, session: Option<TransferSession>) -> CloseOutcome {
        let detached = self.inner.trigger.dispose(id);
        self.inner.channel.send(ControlMessage::TransferClose { id: id.to_string() });

        match session {
            Some(session) => {
                let closed = session.close();
                info!(
                    id = %id,
                    bytes = closed.bytes_accepted,
                    chunks = closed.chunks_accepted,
                    "transfer closed"
                );
                CloseOutcome::Closed
            }
            None => {
                debug!(id = %id, detached, "close for unknown transfer");
                CloseOutcome::Unknown
            }
        }
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.inner.sessions.snapshots()
    }

    /// Closes every live session and drops the control channel. Later
    /// `register`/`start` calls fail with [`TransferError::ShutDown`].
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids = self.inner.sessions.ids();
        for id in &ids {
            self.close(id);
        }
        self.inner.channel.reset();
        info!(closed = ids.len(), "transfer coordinator shut down");
    }

    fn ensure_open(&self) -> TransferResult<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(TransferError::ShutDown);
        }
        Ok(())
    }
}
