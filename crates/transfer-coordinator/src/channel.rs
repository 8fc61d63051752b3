//! The one control channel shared by every transfer.

use message_port::{MessageChannel, PortSender};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{TransferError, TransferResult};
use crate::host::InterceptHandle;
use crate::protocol::{ControlMessage, InterceptNotice, WorkerMessage};

struct Established {
    sender: PortSender<ControlMessage>,
    notices: JoinHandle<()>,
}

#[derive(Default)]
pub struct ControlChannel {
    state: Mutex<Option<Established>>,
}

impl ControlChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the established channel, creating it on first use by handing
    /// the remote port to the intercept context in an `INIT_CHANNEL` message.
    /// Must run inside a tokio runtime.
    pub fn ensure(&self, handle: &InterceptHandle) -> TransferResult<PortSender<ControlMessage>> {
        let mut state = self.state.lock();
        if let Some(established) = state.as_ref() {
            return Ok(established.sender.clone());
        }

        let (local, remote) = MessageChannel::<ControlMessage, InterceptNotice>::new().into_ports();
        if !handle.post_message(WorkerMessage::InitChannel { port: remote }) {
            warn!(scope = handle.scope(), "control channel not established");
            return Err(TransferError::InterceptInactive);
        }

        let (sender, notices) = local.on_message(|notice: InterceptNotice| match notice.id {
            Some(id) => debug!(target: "intercept", id = %id, "{}", notice.message),
            None => debug!(target: "intercept", "{}", notice.message),
        });
        info!(scope = handle.scope(), "control channel established");
        *state = Some(Established {
            sender: sender.clone(),
            notices,
        });
        Ok(sender)
    }

    pub fn is_established(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Sends on the established channel. With no channel the message is
    /// dropped; returns whether it was handed to the port.
    pub fn send(&self, message: ControlMessage) -> bool {
        let sender = match self.state.lock().as_ref() {
            Some(established) => established.sender.clone(),
            None => {
                debug!(kind = %message.kind(), id = message.id(), "no control channel; message dropped");
                return false;
            }
        };
        let kind = message.kind();
        match sender.post(message) {
            Ok(()) => true,
            Err(err) => {
                warn!(%kind, error = %err, "control message not delivered");
                false
            }
        }
    }

    /// Forgets the channel so the next `ensure` establishes a fresh one.
    pub fn reset(&self) {
        if let Some(established) = self.state.lock().take() {
            established.notices.abort();
            debug!("control channel torn down");
        }
    }
}
