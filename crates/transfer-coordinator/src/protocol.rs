//! Messages exchanged between the page side and the intercept context.

use std::fmt;

use message_port::Port;

use crate::stream::ChunkStream;

/// Query keys carried on the download trigger URL.
pub const FILE_ID: &str = "fileId";
pub const FILE_SIZE: &str = "fileSize";
pub const FILE_TOTAL: &str = "fileTotal";
pub const FILE_NAME: &str = "fileName";
pub const FILE_GENERATION: &str = "fileGen";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    InitChannel,
    TransferStart,
    TransferClose,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::InitChannel => "INIT_CHANNEL",
            MessageKind::TransferStart => "TRANSFER_START",
            MessageKind::TransferClose => "TRANSFER_CLOSE",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic on the control channel, page to intercept context.
#[derive(Debug)]
pub enum ControlMessage {
    /// Ownership of `readable` moves to the intercept context. Only a
    /// navigation carrying the same `generation` may claim it.
    TransferStart {
        id: String,
        generation: u64,
        readable: ChunkStream,
    },
    TransferClose { id: String },
}

impl ControlMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::TransferStart { .. } => MessageKind::TransferStart,
            ControlMessage::TransferClose { .. } => MessageKind::TransferClose,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ControlMessage::TransferStart { id, .. } | ControlMessage::TransferClose { id } => id,
        }
    }
}

/// Diagnostic note from the intercept context. Logged, never acted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptNotice {
    pub id: Option<String>,
    pub message: String,
}

pub type PagePort = Port<ControlMessage, InterceptNotice>;
pub type InterceptPort = Port<InterceptNotice, ControlMessage>;

/// Delivered straight to the intercept context, outside the control channel.
pub enum WorkerMessage {
    /// One-shot setup; the intercept context keeps `port` for its lifetime.
    InitChannel { port: InterceptPort },
}

impl WorkerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            WorkerMessage::InitChannel { .. } => MessageKind::InitChannel,
        }
    }
}

impl fmt::Debug for WorkerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerMessage")
            .field("kind", &self.kind())
            .finish()
    }
}
