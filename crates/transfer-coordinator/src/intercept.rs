//! The intercept context's side of the protocol: it receives the readable
//! halves announced over the control channel and answers download
//! navigations with them.

use std::collections::HashMap;
use std::future;
use std::time::Duration;

use message_port::{PortReceiver, PortSender};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::protocol::{ControlMessage, InterceptNotice, WorkerMessage};
use crate::stream::ChunkStream;
use crate::trigger::{encode_component, TransferMeta};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationRequest {
    pub url: String,
}

impl NavigationRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[derive(Debug)]
pub struct DownloadResponse {
    pub meta: TransferMeta,
    pub headers: Vec<(&'static str, String)>,
    pub body: ChunkStream,
}

impl DownloadResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    Stream(DownloadResponse),
    /// Not a transfer this context knows; the host handles it normally.
    Passthrough,
}

/// A navigation routed to the intercept context plus its reply slot.
pub struct FetchEvent {
    pub request: NavigationRequest,
    pub respond: oneshot::Sender<FetchOutcome>,
}

/// How long a closed stream nobody navigated to stays claimable.
pub const CLOSED_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct PendingTransfer {
    generation: u64,
    readable: Option<ChunkStream>,
    closed_at: Option<Instant>,
}

pub struct InterceptWorker {
    transfers: HashMap<String, PendingTransfer>,
    notices: Option<PortSender<InterceptNotice>>,
    closed_grace: Duration,
}

impl Default for InterceptWorker {
    fn default() -> Self {
        Self {
            transfers: HashMap::new(),
            notices: None,
            closed_grace: CLOSED_GRACE,
        }
    }
}

impl InterceptWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_closed_grace(mut self, grace: Duration) -> Self {
        self.closed_grace = grace;
        self
    }

    /// Serves worker messages, control traffic and navigations until the
    /// mailbox or the fetch queue closes.
    pub async fn run(
        mut self,
        mut mailbox: mpsc::UnboundedReceiver<WorkerMessage>,
        mut fetches: mpsc::Receiver<FetchEvent>,
    ) {
        let mut control: Option<PortReceiver<ControlMessage>> = None;
        let mut sweep = time::interval(self.closed_grace);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            // Control traffic is drained before navigations so a transfer's
            // TRANSFER_START is always seen before its trigger request.
            tokio::select! {
                biased;
                message = mailbox.recv() => match message {
                    Some(WorkerMessage::InitChannel { port }) => {
                        let (notices, receiver) = port.split();
                        if control.is_some() {
                            warn!("control channel re-initialised; previous port dropped");
                        }
                        self.notices = Some(notices);
                        control = Some(receiver);
                        self.notify(None, "control channel ready");
                    }
                    None => break,
                },
                message = next_control(&mut control) => match message {
                    Some(message) => self.handle_control(message),
                    None => {
                        debug!("control channel closed by page");
                        control = None;
                    }
                },
                event = fetches.recv() => match event {
                    Some(FetchEvent { request, respond }) => {
                        let outcome = self.fetch(&request);
                        let _ = respond.send(outcome);
                    }
                    None => break,
                },
                _ = sweep.tick() => {
                    self.evict_stale(Instant::now());
                }
            }
        }
        debug!(pending = self.transfers.len(), "intercept worker stopped");
    }

    pub fn handle_control(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::TransferStart {
                id,
                generation,
                readable,
            } => {
                let previous = self.transfers.insert(
                    id.clone(),
                    PendingTransfer {
                        generation,
                        readable: Some(readable),
                        closed_at: None,
                    },
                );
                if let Some(previous) = previous {
                    warn!(
                        id = %id,
                        previous = previous.generation,
                        generation,
                        "transfer id reused; previous stream dropped"
                    );
                }
                self.notify(Some(&id), "transfer registered");
            }
            ControlMessage::TransferClose { id } => {
                let claimed = match self.transfers.get_mut(&id) {
                    Some(pending) if pending.readable.is_some() => {
                        // Still unclaimed: keep it so a late navigation drains it.
                        pending.closed_at = Some(Instant::now());
                        false
                    }
                    Some(_) => true,
                    None => return,
                };
                if claimed {
                    self.transfers.remove(&id);
                }
                self.notify(Some(&id), "transfer closed");
            }
        }
    }

    pub fn fetch(&mut self, request: &NavigationRequest) -> FetchOutcome {
        let meta = match TransferMeta::from_download_url(&request.url) {
            Ok(meta) => meta,
            Err(err) => {
                debug!(url = %request.url, error = %err, "navigation not intercepted");
                return FetchOutcome::Passthrough;
            }
        };
        let Some(pending) = self.transfers.get_mut(&meta.id) else {
            debug!(id = %meta.id, "no stream registered for navigation");
            return FetchOutcome::Passthrough;
        };
        if pending.generation != meta.generation {
            warn!(
                id = %meta.id,
                expected = pending.generation,
                got = meta.generation,
                "navigation from a replaced transfer ignored"
            );
            return FetchOutcome::Passthrough;
        }
        let Some(body) = pending.readable.take() else {
            warn!(id = %meta.id, "stream already claimed by an earlier navigation");
            return FetchOutcome::Passthrough;
        };
        if pending.closed_at.is_some() {
            self.transfers.remove(&meta.id);
        }

        info!(id = %meta.id, file_name = %meta.file_name, "answering download with live stream");
        self.notify(Some(&meta.id), "download response started");
        let headers = download_headers(&meta);
        FetchOutcome::Stream(DownloadResponse {
            meta,
            headers,
            body,
        })
    }

    /// Drops closed streams no navigation claimed within the grace period.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let grace = self.closed_grace;
        let before = self.transfers.len();
        self.transfers.retain(|id, pending| match pending.closed_at {
            Some(closed_at) if now.saturating_duration_since(closed_at) >= grace => {
                debug!(id = %id, "closed stream never claimed; evicted");
                false
            }
            _ => true,
        });
        before - self.transfers.len()
    }

    pub fn pending(&self) -> usize {
        self.transfers.len()
    }

    fn notify(&self, id: Option<&str>, message: &str) {
        if let Some(notices) = &self.notices {
            let _ = notices.post(InterceptNotice {
                id: id.map(str::to_string),
                message: message.to_string(),
            });
        }
    }
}

async fn next_control(control: &mut Option<PortReceiver<ControlMessage>>) -> Option<ControlMessage> {
    match control {
        Some(receiver) => receiver.recv().await,
        None => future::pending().await,
    }
}

fn download_headers(meta: &TransferMeta) -> Vec<(&'static str, String)> {
    vec![
        ("Content-Type", "application/octet-stream".to_string()),
        (
            "Content-Disposition",
            format!(
                "attachment; filename*=UTF-8''{}",
                encode_component(&meta.file_name)
            ),
        ),
        ("Content-Length", meta.file_size.to_string()),
        ("X-Content-Type-Options", "nosniff".to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::pipe;
    use bytes::Bytes;
    use message_port::MessageChannel;
    use test_timeout::tokio_timeout_test;

    fn start_generation(
        worker: &mut InterceptWorker,
        id: &str,
        generation: u64,
    ) -> crate::stream::ChunkWriter {
        let (writer, readable) = pipe(4);
        worker.handle_control(ControlMessage::TransferStart {
            id: id.into(),
            generation,
            readable,
        });
        writer
    }

    fn start(worker: &mut InterceptWorker, id: &str) -> crate::stream::ChunkWriter {
        start_generation(worker, id, 1)
    }

    fn request_generation(id: &str, name: &str, generation: u64) -> NavigationRequest {
        NavigationRequest::new(
            TransferMeta::new(id, name, 3, 1)
                .with_generation(generation)
                .download_path(),
        )
    }

    fn request(id: &str, name: &str) -> NavigationRequest {
        request_generation(id, name, 1)
    }

    #[tokio_timeout_test(5)]
    async fn navigation_gets_the_registered_stream() {
        let mut worker = InterceptWorker::new();
        let writer = start(&mut worker, "f1");
        writer.ready().await.expect("open").write(Bytes::from_static(b"abc"));
        drop(writer);

        let FetchOutcome::Stream(response) = worker.fetch(&request("f1", "café.txt")) else {
            panic!("expected stream");
        };
        assert_eq!(
            response.header("content-disposition"),
            Some("attachment; filename*=UTF-8''caf%C3%A9.txt")
        );
        assert_eq!(response.header("Content-Length"), Some("3"));
        assert_eq!(response.body.read_to_end().await, Bytes::from_static(b"abc"));
    }

    #[tokio_timeout_test(5)]
    async fn unknown_or_foreign_navigations_pass_through() {
        let mut worker = InterceptWorker::new();
        assert!(matches!(
            worker.fetch(&request("ghost", "a")),
            FetchOutcome::Passthrough
        ));
        assert!(matches!(
            worker.fetch(&NavigationRequest::new("/index.html")),
            FetchOutcome::Passthrough
        ));
    }

    #[tokio_timeout_test(5)]
    async fn close_before_navigation_keeps_stream_claimable_once() {
        let mut worker = InterceptWorker::new();
        let _writer = start(&mut worker, "f1");
        worker.handle_control(ControlMessage::TransferClose { id: "f1".into() });
        assert_eq!(worker.pending(), 1);

        assert!(matches!(
            worker.fetch(&request("f1", "a")),
            FetchOutcome::Stream(_)
        ));
        assert_eq!(worker.pending(), 0);
        assert!(matches!(
            worker.fetch(&request("f1", "a")),
            FetchOutcome::Passthrough
        ));
    }

    #[tokio_timeout_test(5)]
    async fn close_after_navigation_forgets_the_transfer() {
        let mut worker = InterceptWorker::new();
        let _writer = start(&mut worker, "f1");
        assert!(matches!(
            worker.fetch(&request("f1", "a")),
            FetchOutcome::Stream(_)
        ));
        worker.handle_control(ControlMessage::TransferClose { id: "f1".into() });
        worker.handle_control(ControlMessage::TransferClose { id: "f1".into() });
        assert_eq!(worker.pending(), 0);
    }

    #[tokio_timeout_test(5)]
    async fn run_loop_serves_channel_then_fetch() {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::channel(4);
        let worker = tokio::spawn(InterceptWorker::new().run(mailbox_rx, fetch_rx));

        let (page, remote) = MessageChannel::<ControlMessage, InterceptNotice>::new().into_ports();
        mailbox_tx
            .send(WorkerMessage::InitChannel { port: remote })
            .expect("mailbox open");
        let (writer, readable) = pipe(1);
        page.post(ControlMessage::TransferStart {
            id: "f2".into(),
            generation: 1,
            readable,
        })
        .expect("post");

        let (respond, reply) = oneshot::channel();
        fetch_tx
            .send(FetchEvent {
                request: request("f2", "b.bin"),
                respond,
            })
            .await
            .expect("fetch queued");
        let FetchOutcome::Stream(response) = reply.await.expect("reply") else {
            panic!("expected stream");
        };

        writer.ready().await.expect("open").write(Bytes::from_static(b"xyz"));
        drop(writer);
        assert_eq!(response.body.read_to_end().await, Bytes::from_static(b"xyz"));

        let mut page = page;
        let notice = page.recv().await.expect("notice");
        assert_eq!(notice.message, "control channel ready");

        drop(mailbox_tx);
        worker.await.expect("worker stops");
    }

    #[tokio_timeout_test(5)]
    async fn navigation_from_a_replaced_start_cannot_claim_the_new_stream() {
        let mut worker = InterceptWorker::new();
        let _old = start_generation(&mut worker, "dup", 1);
        worker.handle_control(ControlMessage::TransferClose { id: "dup".into() });
        let new = start_generation(&mut worker, "dup", 2);

        assert!(matches!(
            worker.fetch(&request_generation("dup", "old.txt", 1)),
            FetchOutcome::Passthrough
        ));
        let FetchOutcome::Stream(response) = worker.fetch(&request_generation("dup", "new.txt", 2))
        else {
            panic!("expected stream for the current start");
        };
        assert_eq!(response.meta.file_name, "new.txt");

        new.ready().await.expect("open").write(Bytes::from_static(b"NEW"));
        drop(new);
        assert_eq!(response.body.read_to_end().await, Bytes::from_static(b"NEW"));
    }

    #[tokio_timeout_test(5)]
    async fn unclaimed_closed_streams_are_evicted_after_the_grace_period() {
        let mut worker = InterceptWorker::new().with_closed_grace(Duration::from_secs(1));
        let _closed = start(&mut worker, "f1");
        let _open = start(&mut worker, "f2");
        worker.handle_control(ControlMessage::TransferClose { id: "f1".into() });

        assert_eq!(worker.evict_stale(Instant::now()), 0);
        assert_eq!(worker.evict_stale(Instant::now() + Duration::from_secs(2)), 1);
        assert_eq!(worker.pending(), 1);
        assert!(matches!(
            worker.fetch(&request("f1", "a")),
            FetchOutcome::Passthrough
        ));
    }

    #[tokio_timeout_test(5, paused)]
    async fn run_loop_sweeps_unclaimed_streams() {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::channel(4);
        let worker = InterceptWorker::new().with_closed_grace(Duration::from_millis(50));
        let _task = tokio::spawn(worker.run(mailbox_rx, fetch_rx));

        let (page, remote) = MessageChannel::<ControlMessage, InterceptNotice>::new().into_ports();
        mailbox_tx
            .send(WorkerMessage::InitChannel { port: remote })
            .expect("mailbox open");
        let (_writer, readable) = pipe(1);
        page.post(ControlMessage::TransferStart {
            id: "f1".into(),
            generation: 1,
            readable,
        })
        .expect("post");
        page.post(ControlMessage::TransferClose { id: "f1".into() })
            .expect("post");

        tokio::time::sleep(Duration::from_millis(200)).await;
        let (respond, reply) = oneshot::channel();
        fetch_tx
            .send(FetchEvent {
                request: request("f1", "a"),
                respond,
            })
            .await
            .expect("fetch queued");
        assert!(matches!(reply.await.expect("reply"), FetchOutcome::Passthrough));
    }
}
