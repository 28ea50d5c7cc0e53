//! Handler-facing request and reply types.

use bytes::Bytes;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::Stream;
use weft_core::{Metadata, Status};

/// An inbound call as seen by a handler: request metadata, the message (a
/// single payload or an [`Inbound`] sequence), and the peer address.
pub struct Request<T> {
    pub metadata: Metadata,
    pub message: T,
    pub peer: String,
}

/// A handler's reply: initial metadata emitted before the first message,
/// the message (a single payload or an [`Outbound`] sequence), and trailing
/// metadata delivered with OK status.
pub struct Reply<T> {
    pub message: T,
    pub initial_metadata: Metadata,
    pub trailing_metadata: Metadata,
}

impl<T> Reply<T> {
    pub fn new(message: T) -> Self {
        Self {
            message,
            initial_metadata: Metadata::new(),
            trailing_metadata: Metadata::new(),
        }
    }

    pub fn with_initial_metadata(mut self, metadata: Metadata) -> Self {
        self.initial_metadata = metadata;
        self
    }

    pub fn with_trailing_metadata(mut self, metadata: Metadata) -> Self {
        self.trailing_metadata = metadata;
        self
    }
}

/// The inbound message sequence of a client-streaming or bidi call. Ends at
/// the client's half-close.
pub struct Inbound {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Inbound {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Stream for Inbound {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// The outbound message sequence of a server-streaming or bidi reply. An
/// `Err` item ends the call with that status.
pub type Outbound = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;
