#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use transfer_coordinator::{
    CoordinatorConfig, Document, HiddenFrame, InterceptHandle, InterceptHost, InterceptPort,
    RegistrationError, TransferCoordinator, WorkerMessage, WorkerState,
};

/// Host whose intercept context is the test itself: the mailbox and the
/// activation state stay in the test's hands.
#[derive(Default)]
pub struct RecordingHost {
    state: Mutex<Option<watch::Sender<WorkerState>>>,
    mailbox: Mutex<Option<mpsc::UnboundedReceiver<WorkerMessage>>>,
}

impl RecordingHost {
    pub fn set_state(&self, state: WorkerState) {
        if let Some(tx) = self.state.lock().as_ref() {
            tx.send_replace(state);
        }
    }

    /// Waits for `INIT_CHANNEL` and returns the intercept side of the channel.
    pub async fn accept_channel(&self) -> InterceptPort {
        let mut mailbox = self.mailbox.lock().take().expect("installed");
        let WorkerMessage::InitChannel { port } = mailbox.recv().await.expect("init channel");
        *self.mailbox.lock() = Some(mailbox);
        port
    }
}

#[async_trait]
impl InterceptHost for RecordingHost {
    async fn registration(
        &self,
        _scope: &str,
    ) -> Result<Option<InterceptHandle>, RegistrationError> {
        Ok(None)
    }

    async fn install(
        &self,
        script_url: &str,
        scope: &str,
    ) -> Result<InterceptHandle, RegistrationError> {
        let (state_tx, state_rx) = watch::channel(WorkerState::Activated);
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        *self.state.lock() = Some(state_tx);
        *self.mailbox.lock() = Some(mailbox_rx);
        Ok(InterceptHandle::new(script_url, scope, state_rx, mailbox_tx))
    }
}

/// Page that remembers every frame ever attached.
#[derive(Default)]
pub struct RecordingPage {
    attached: Mutex<HashMap<String, HiddenFrame>>,
    history: Mutex<Vec<HiddenFrame>>,
}

impl RecordingPage {
    pub fn history(&self) -> Vec<HiddenFrame> {
        self.history.lock().clone()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.attached.lock().contains_key(id)
    }
}

impl Document for RecordingPage {
    fn append_frame(&self, frame: HiddenFrame) {
        self.history.lock().push(frame.clone());
        self.attached.lock().insert(frame.id.clone(), frame);
    }

    fn remove_frame(&self, id: &str) -> bool {
        self.attached.lock().remove(id).is_some()
    }

    fn contains_frame(&self, id: &str) -> bool {
        self.attached.lock().contains_key(id)
    }
}

pub struct Harness {
    pub coordinator: TransferCoordinator,
    pub host: Arc<RecordingHost>,
    pub page: Arc<RecordingPage>,
}

pub fn harness(config: CoordinatorConfig) -> Harness {
    let host = Arc::new(RecordingHost::default());
    let page = Arc::new(RecordingPage::default());
    let coordinator = TransferCoordinator::open(config, host.clone(), page.clone());
    Harness {
        coordinator,
        host,
        page,
    }
}

pub fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        build_id: "test".into(),
        stream_buffer: 1,
        post_timeout: Some(Duration::from_secs(30)),
        ..CoordinatorConfig::default()
    }
}
