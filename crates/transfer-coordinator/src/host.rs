//! Boundary to the host environment: where intercept contexts get installed
//! and where download trigger frames get attached.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::RegistrationError;
use crate::protocol::WorkerMessage;
use crate::trigger::HiddenFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Installing,
    Activated,
    Redundant,
}

/// Handle to one installed intercept context. Clones refer to the same context.
#[derive(Clone)]
pub struct InterceptHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    script_url: String,
    scope: String,
    state: watch::Receiver<WorkerState>,
    mailbox: mpsc::UnboundedSender<WorkerMessage>,
}

impl InterceptHandle {
    pub fn new(
        script_url: impl Into<String>,
        scope: impl Into<String>,
        state: watch::Receiver<WorkerState>,
        mailbox: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                script_url: script_url.into(),
                scope: scope.into(),
                state,
                mailbox,
            }),
        }
    }

    pub fn script_url(&self) -> &str {
        &self.inner.script_url
    }

    pub fn scope(&self) -> &str {
        &self.inner.scope
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.borrow()
    }

    pub fn same_context(&self, other: &InterceptHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn wait_active(&self, timeout: Duration) -> Result<(), RegistrationError> {
        let mut state = self.inner.state.clone();
        let settled = tokio::time::timeout(
            timeout,
            state.wait_for(|current| *current != WorkerState::Installing),
        )
        .await;
        let reached = match settled {
            Err(_) => return Err(RegistrationError::ActivationTimeout(timeout)),
            Ok(Err(_)) => {
                return Err(RegistrationError::Unavailable(
                    "host dropped the registration".into(),
                ))
            }
            Ok(Ok(current)) => *current,
        };
        match reached {
            WorkerState::Activated => Ok(()),
            _ => Err(RegistrationError::Redundant),
        }
    }

    /// Posts to the active context. Returns `false` when the message was
    /// dropped because the context is not active or already gone.
    pub fn post_message(&self, message: WorkerMessage) -> bool {
        let state = self.state();
        if state != WorkerState::Activated {
            debug!(kind = %message.kind(), ?state, "intercept context not active; message dropped");
            return false;
        }
        self.inner.mailbox.send(message).is_ok()
    }
}

impl fmt::Debug for InterceptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptHandle")
            .field("script_url", &self.inner.script_url)
            .field("scope", &self.inner.scope)
            .field("state", &self.state())
            .finish()
    }
}

/// Host facility that owns intercept context registrations.
#[async_trait]
pub trait InterceptHost: Send + Sync {
    /// Existing registration for `scope`, if any.
    async fn registration(&self, scope: &str)
        -> Result<Option<InterceptHandle>, RegistrationError>;

    /// Installs a new intercept context. The handle may still be installing.
    async fn install(
        &self,
        script_url: &str,
        scope: &str,
    ) -> Result<InterceptHandle, RegistrationError>;
}

/// The page the download trigger frames are attached to. Attaching a frame
/// makes the host navigate to its `src`.
pub trait Document: Send + Sync {
    fn append_frame(&self, frame: HiddenFrame);
    fn remove_frame(&self, id: &str) -> bool;
    fn contains_frame(&self, id: &str) -> bool;
}
