//! Entangled in-process message ports.
//!
//! A [`MessageChannel`] hands out two [`Port`]s; whatever one side posts the
//! other side receives, in posting order. Posting never waits, so a port is
//! the right tool for control traffic and the wrong one for bulk data (bulk
//! data travels on bounded streams handed across a port instead).

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("message port closed")]
    Closed,
}

pub type PortResult<T> = Result<T, PortError>;

/// A pair of entangled ports. `port1` posts `A` and receives `B`; `port2` is
/// the mirror image.
pub struct MessageChannel<A, B> {
    pub port1: Port<A, B>,
    pub port2: Port<B, A>,
}

impl<A, B> MessageChannel<A, B> {
    pub fn new() -> Self {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        Self {
            port1: Port {
                sender: PortSender { tx: a_tx },
                receiver: PortReceiver { rx: b_rx },
            },
            port2: Port {
                sender: PortSender { tx: b_tx },
                receiver: PortReceiver { rx: a_rx },
            },
        }
    }

    pub fn into_ports(self) -> (Port<A, B>, Port<B, A>) {
        (self.port1, self.port2)
    }
}

impl<A, B> Default for MessageChannel<A, B> {
    fn default() -> Self {
        Self::new()
    }
}

/// One end of a [`MessageChannel`]: posts `Out`, receives `In`.
pub struct Port<Out, In> {
    sender: PortSender<Out>,
    receiver: PortReceiver<In>,
}

impl<Out, In> Port<Out, In> {
    pub fn post(&self, message: Out) -> PortResult<()> {
        self.sender.post(message)
    }

    pub async fn recv(&mut self) -> Option<In> {
        self.receiver.recv().await
    }

    pub fn sender(&self) -> PortSender<Out> {
        self.sender.clone()
    }

    pub fn split(self) -> (PortSender<Out>, PortReceiver<In>) {
        (self.sender, self.receiver)
    }
}

impl<Out, In> Port<Out, In>
where
    In: Send + 'static,
{
    /// Spawns a pump that feeds every inbound message to `handler` until the
    /// peer port goes away. Must be called inside a tokio runtime.
    pub fn on_message<F>(self, mut handler: F) -> (PortSender<Out>, JoinHandle<()>)
    where
        F: FnMut(In) + Send + 'static,
    {
        let (sender, mut receiver) = self.split();
        let pump = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                handler(message);
            }
            trace!("message port pump finished");
        });
        (sender, pump)
    }
}

/// Cloneable posting half of a [`Port`].
pub struct PortSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> PortSender<T> {
    pub fn post(&self, message: T) -> PortResult<()> {
        self.tx.send(message).map_err(|_| PortError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T> Clone for PortSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> std::fmt::Debug for PortSender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortSender")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Receiving half of a [`Port`].
pub struct PortReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> PortReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}
