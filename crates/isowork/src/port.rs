//! # Ports
//!
//! An in-process message channel between the host and a sandbox.
//!
//! ## Philosophy
//!
//! - **Envelope-Oriented**: Every message travels with its own one-shot reply
//!   slot. Answering consumes the envelope; dropping it unanswered is how the
//!   sandbox says "no response".
//! - **Move, Don't Copy**: Messages are moved into the channel. A buffer that
//!   is posted belongs to the receiver until it is moved back in a reply.
//! - **FIFO Per Port**: Each port is one unbounded queue. Nothing orders two
//!   different ports relative to each other.

use tokio::sync::mpsc;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The listening end was dropped.
    Disconnected,
    /// The receiver dropped the envelope without answering.
    NoReply,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Port disconnected"),
            Self::NoReply => write!(f, "Message dropped without a reply"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A message paired with the slot its reply goes into.
pub struct Envelope<M, R> {
    pub message: M,
    reply: oneshot::Sender<R>,
}

impl<M, R> Envelope<M, R> {
    /// Splits the envelope so the message can be consumed before answering.
    pub fn into_parts(self) -> (M, Reply<R>) {
        (self.message, Reply { slot: self.reply })
    }
}

/// The answering half of an envelope.
pub struct Reply<R> {
    slot: oneshot::Sender<R>,
}

impl<R> Reply<R> {
    /// Posts the reply. A sender that stopped waiting simply never sees it.
    pub fn send(self, reply: R) {
        let _ = self.slot.send(reply);
    }
}

/// The posting end of a port.
pub struct Port<M, R> {
    tx: mpsc::UnboundedSender<Envelope<M, R>>,
}

impl<M, R> Clone for Port<M, R> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<M, R> Port<M, R> {
    /// Posts a message and returns the receiver for its reply.
    pub fn post(&self, message: M) -> Result<oneshot::Receiver<R>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { message, reply })
            .map_err(|_| Error::Disconnected)?;
        Ok(rx)
    }

    /// Posts a message and waits for its reply.
    pub async fn request(&self, message: M) -> Result<R> {
        let rx = self.post(message)?;
        rx.await.map_err(|_| Error::NoReply)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The listening end of a port.
pub struct Listener<M, R> {
    rx: mpsc::UnboundedReceiver<Envelope<M, R>>,
}

impl<M, R> Listener<M, R> {
    /// Waits for the next envelope, or `None` once every port is dropped.
    pub async fn recv(&mut self) -> Option<Envelope<M, R>> {
        self.rx.recv().await
    }
}

/// Creates a connected port and listener.
pub fn channel<M, R>() -> (Port<M, R>, Listener<M, R>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Port { tx }, Listener { rx })
}
