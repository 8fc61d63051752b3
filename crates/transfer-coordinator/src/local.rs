//! In-process host: installs the intercept worker as a tokio task and hands
//! streamed downloads to a [`DownloadSink`].

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::RegistrationError;
use crate::host::{Document, InterceptHandle, InterceptHost, WorkerState};
use crate::intercept::{DownloadResponse, FetchEvent, FetchOutcome, InterceptWorker, NavigationRequest};
use crate::stream::ChunkStream;
use crate::trigger::HiddenFrame;

const FETCH_QUEUE_DEPTH: usize = 16;
const COMPLETION_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("download io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("download truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub id: String,
    pub file_name: String,
    pub location: Option<PathBuf>,
    pub bytes: u64,
}

/// A navigation that did not end in a persisted download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadFailure {
    pub id: String,
    pub reason: String,
}

/// Where the host persists a streamed download.
#[async_trait]
pub trait DownloadSink: Send + Sync {
    async fn persist(&self, response: DownloadResponse) -> Result<DownloadReport, SinkError>;
}

/// Writes every download into one directory, never overwriting.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn create_unique(&self, file_name: &str) -> Result<(PathBuf, fs::File), SinkError> {
        fs::create_dir_all(&self.root).await?;
        let (stem, ext) = split_extension(file_name);
        let mut attempt = 0u32;
        loop {
            let candidate = match attempt {
                0 => file_name.to_string(),
                n => format!("{stem} ({n}){ext}"),
            };
            let path = self.root.join(&candidate);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[async_trait]
impl DownloadSink for DirectorySink {
    async fn persist(&self, response: DownloadResponse) -> Result<DownloadReport, SinkError> {
        let DownloadResponse { meta, body, .. } = response;
        let file_name = sanitize_file_name(&meta.file_name);
        let (path, file) = self.create_unique(&file_name).await?;

        match copy_body(body, file, meta.file_size).await {
            Ok(written) => Ok(DownloadReport {
                id: meta.id,
                file_name,
                location: Some(path),
                bytes: written,
            }),
            Err(err) => {
                warn!(id = %meta.id, path = %path.display(), error = %err, "discarding partial download");
                if let Err(remove_err) = fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %remove_err, "partial download not removed");
                }
                Err(err)
            }
        }
    }
}

async fn copy_body(mut body: ChunkStream, mut file: fs::File, expected: u64) -> Result<u64, SinkError> {
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    if written < expected {
        return Err(SinkError::Truncated {
            expected,
            received: written,
        });
    }
    Ok(written)
}

/// Keeps downloads in memory, keyed by transfer id.
#[derive(Debug, Default)]
pub struct MemorySink {
    files: Mutex<HashMap<String, Bytes>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Bytes> {
        self.files.lock().get(id).cloned()
    }
}

#[async_trait]
impl DownloadSink for MemorySink {
    async fn persist(&self, response: DownloadResponse) -> Result<DownloadReport, SinkError> {
        let DownloadResponse { meta, body, .. } = response;
        let bytes = body.read_to_end().await;
        let report = DownloadReport {
            id: meta.id.clone(),
            file_name: meta.file_name,
            location: None,
            bytes: bytes.len() as u64,
        };
        self.files.lock().insert(meta.id, bytes);
        Ok(report)
    }
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

struct Installation {
    handle: InterceptHandle,
    fetches: mpsc::Sender<FetchEvent>,
    worker: JoinHandle<()>,
    _state: watch::Sender<WorkerState>,
}

struct LocalHostInner {
    sink: Arc<dyn DownloadSink>,
    installation: Mutex<Option<Installation>>,
    frames: Mutex<HashMap<String, HiddenFrame>>,
    completions: broadcast::Sender<DownloadReport>,
    failures: broadcast::Sender<DownloadFailure>,
    reject_reason: Option<String>,
    installs: AtomicUsize,
}

/// Host that runs the intercept worker in-process. Cheap to clone.
#[derive(Clone)]
pub struct LocalHost {
    inner: Arc<LocalHostInner>,
}

impl LocalHost {
    pub fn new(sink: Arc<dyn DownloadSink>) -> Self {
        Self::build(sink, None)
    }

    /// A host whose installs always fail with `reason`.
    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self::build(Arc::new(MemorySink::new()), Some(reason.into()))
    }

    fn build(sink: Arc<dyn DownloadSink>, reject_reason: Option<String>) -> Self {
        let (completions, _) = broadcast::channel(COMPLETION_DEPTH);
        let (failures, _) = broadcast::channel(COMPLETION_DEPTH);
        Self {
            inner: Arc::new(LocalHostInner {
                sink,
                installation: Mutex::new(None),
                frames: Mutex::new(HashMap::new()),
                completions,
                failures,
                reject_reason,
                installs: AtomicUsize::new(0),
            }),
        }
    }

    /// Reports of finished downloads. Subscribe before starting transfers.
    pub fn completions(&self) -> broadcast::Receiver<DownloadReport> {
        self.inner.completions.subscribe()
    }

    /// Navigations that ended without a persisted download.
    pub fn failures(&self) -> broadcast::Receiver<DownloadFailure> {
        self.inner.failures.subscribe()
    }

    pub fn install_count(&self) -> usize {
        self.inner.installs.load(Ordering::SeqCst)
    }

    /// Stops the intercept worker.
    pub fn shutdown(&self) {
        if let Some(installation) = self.inner.installation.lock().take() {
            installation.worker.abort();
            debug!("local intercept worker stopped");
        }
    }

    fn navigate(&self, frame: &HiddenFrame) {
        let fetches = match self.inner.installation.lock().as_ref() {
            Some(installation) => installation.fetches.clone(),
            None => {
                debug!(id = %frame.id, "no intercept context; navigation ignored");
                return;
            }
        };
        let request = NavigationRequest::new(frame.src.clone());
        let sink = Arc::clone(&self.inner.sink);
        let completions = self.inner.completions.clone();
        let failures = self.inner.failures.clone();
        let id = frame.id.clone();
        tokio::spawn(async move {
            let fail = |reason: String| {
                let _ = failures.send(DownloadFailure {
                    id: id.clone(),
                    reason,
                });
            };
            let (respond, reply) = oneshot::channel();
            if fetches.send(FetchEvent { request, respond }).await.is_err() {
                warn!(id = %id, "intercept worker gone; navigation dropped");
                fail("intercept worker gone".to_string());
                return;
            }
            let response = match reply.await {
                Ok(FetchOutcome::Stream(response)) => response,
                Ok(FetchOutcome::Passthrough) => {
                    debug!(id = %id, "navigation passed through");
                    fail("navigation not intercepted".to_string());
                    return;
                }
                Err(_) => {
                    fail("intercept worker dropped the navigation".to_string());
                    return;
                }
            };
            match sink.persist(response).await {
                Ok(report) => {
                    info!(id = %report.id, bytes = report.bytes, "download persisted");
                    let _ = completions.send(report);
                }
                Err(err) => {
                    warn!(id = %id, error = %err, "download failed");
                    fail(err.to_string());
                }
            }
        });
    }
}

#[async_trait]
impl InterceptHost for LocalHost {
    async fn registration(
        &self,
        scope: &str,
    ) -> Result<Option<InterceptHandle>, RegistrationError> {
        Ok(self
            .inner
            .installation
            .lock()
            .as_ref()
            .filter(|installation| installation.handle.scope() == scope)
            .map(|installation| installation.handle.clone()))
    }

    async fn install(
        &self,
        script_url: &str,
        scope: &str,
    ) -> Result<InterceptHandle, RegistrationError> {
        self.inner.installs.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.inner.reject_reason {
            return Err(RegistrationError::Rejected(reason.clone()));
        }

        let (state_tx, state_rx) = watch::channel(WorkerState::Installing);
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::channel(FETCH_QUEUE_DEPTH);
        let worker = tokio::spawn(InterceptWorker::new().run(mailbox_rx, fetch_rx));
        let handle = InterceptHandle::new(script_url, scope, state_rx, mailbox_tx);
        state_tx.send_replace(WorkerState::Activated);

        let previous = self.inner.installation.lock().replace(Installation {
            handle: handle.clone(),
            fetches: fetch_tx,
            worker,
            _state: state_tx,
        });
        if let Some(previous) = previous {
            previous.worker.abort();
        }
        info!(script = script_url, scope, "local intercept worker installed");
        Ok(handle)
    }
}

impl Document for LocalHost {
    fn append_frame(&self, frame: HiddenFrame) {
        self.navigate(&frame);
        self.inner.frames.lock().insert(frame.id.clone(), frame);
    }

    fn remove_frame(&self, id: &str) -> bool {
        self.inner.frames.lock().remove(id).is_some()
    }

    fn contains_frame(&self, id: &str) -> bool {
        self.inner.frames.lock().contains_key(id)
    }
}
