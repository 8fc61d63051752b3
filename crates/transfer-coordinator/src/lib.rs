//! Streams file transfers to a host's download mechanism through an
//! intercept context, one flow-controlled pipe per transfer.

mod channel;
mod config;
mod coordinator;
mod error;
mod host;
mod intercept;
mod local;
mod protocol;
mod registrar;
mod session;
mod stream;
mod trigger;

pub use channel::ControlChannel;
pub use config::{is_trusted_origin, CoordinatorConfig, DuplicatePolicy, BUILD_ID};
pub use coordinator::{CloseOutcome, PostOutcome, TransferCoordinator};
pub use error::{MetaError, RegistrationError, TransferError, TransferResult};
pub use host::{Document, InterceptHandle, InterceptHost, WorkerState};
pub use intercept::{DownloadResponse, FetchEvent, FetchOutcome, InterceptWorker, NavigationRequest};
pub use local::{
    DirectorySink, DownloadFailure, DownloadReport, DownloadSink, LocalHost, MemorySink, SinkError,
};
pub use protocol::{
    ControlMessage, InterceptNotice, InterceptPort, MessageKind, PagePort, WorkerMessage,
    FILE_GENERATION, FILE_ID, FILE_NAME, FILE_SIZE, FILE_TOTAL,
};
pub use registrar::Registrar;
pub use session::{SessionSnapshot, SessionState};
pub use stream::{pipe, ChunkStream, ChunkWriter, StreamClosed, WritePermit};
pub use trigger::{encode_component, DownloadTrigger, HiddenFrame, TransferMeta};
