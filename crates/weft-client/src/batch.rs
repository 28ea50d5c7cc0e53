//! Batches: atomic sets of transport operations on one call.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use weft_core::wire::RequestHead;
use weft_core::{Metadata, Status, WeftError};

use crate::call::Call;

/// A set of operations drawn from the six slots, each at most once. The
/// batch either passes validation as a whole or is rejected without I/O;
/// sends within it are emitted in the canonical order metadata, message,
/// close.
#[derive(Default)]
pub struct Batch {
    send_initial_metadata: Option<Metadata>,
    send_message: Option<Bytes>,
    send_close: bool,
    recv_initial_metadata: bool,
    recv_message: bool,
    recv_status: bool,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_initial_metadata(mut self, metadata: Metadata) -> Self {
        self.send_initial_metadata = Some(metadata);
        self
    }

    pub fn send_message(mut self, payload: Bytes) -> Self {
        self.send_message = Some(payload);
        self
    }

    pub fn send_close(mut self) -> Self {
        self.send_close = true;
        self
    }

    pub fn recv_initial_metadata(mut self) -> Self {
        self.recv_initial_metadata = true;
        self
    }

    pub fn recv_message(mut self) -> Self {
        self.recv_message = true;
        self
    }

    pub fn recv_status(mut self) -> Self {
        self.recv_status = true;
        self
    }

    fn has_sends(&self) -> bool {
        self.send_initial_metadata.is_some() || self.send_message.is_some() || self.send_close
    }
}

/// Results of the recv operations in a completed batch. Slots the batch did
/// not request stay `None`; `message` distinguishes "not requested" (outer
/// `None`) from "end of stream" (inner `None`).
#[derive(Debug, Default)]
pub struct BatchResult {
    pub initial_metadata: Option<Metadata>,
    pub message: Option<Option<Bytes>>,
    pub status: Option<Status>,
}

/// Pending recv side of a submitted batch. Completes once every requested
/// operation has completed; send operations complete at submission and carry
/// no payload here.
pub struct BatchCompletion {
    headers: Option<oneshot::Receiver<Metadata>>,
    message: Option<Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>>>,
    status: Option<oneshot::Receiver<Status>>,
}

impl BatchCompletion {
    /// Await the batch's recv operations, in the order initial metadata,
    /// message, status.
    pub async fn wait(mut self) -> BatchResult {
        let mut result = BatchResult::default();
        if let Some(rx) = self.headers.take() {
            result.initial_metadata = rx.await.ok();
        }
        if let Some(messages) = self.message.take() {
            let mut rx = messages.lock().await;
            result.message = Some(rx.recv().await);
        }
        if let Some(rx) = self.status.take() {
            result.status =
                Some(rx.await.unwrap_or_else(|_| Status::internal("call state lost")));
        }
        result
    }
}

impl Call {
    /// Validate and submit a batch. Sends are performed before this returns
    /// (a full transport queue defers acceptance, which is the send-side
    /// backpressure); the returned [`BatchCompletion`] resolves the recv
    /// operations.
    ///
    /// Lifetime invariants enforced here: at most one SEND_INITIAL_METADATA
    /// and one SEND_CLOSE per call, initial metadata and status each
    /// requested at most once, and batches containing sends fail without I/O
    /// once the call is terminal.
    pub async fn start_batch(&self, batch: Batch) -> Result<BatchCompletion, WeftError> {
        let inner = &self.inner;
        let completion;
        {
            let mut flags = inner.flags.lock().unwrap();
            if batch.has_sends() && inner.control.is_terminal() {
                return Err(WeftError::call("call already finished"));
            }
            if batch.send_initial_metadata.is_some() && flags.sent_initial_metadata {
                return Err(WeftError::call("initial metadata already sent"));
            }
            if batch.send_close && flags.sent_close {
                return Err(WeftError::call("call already half-closed"));
            }

            let headers = if batch.recv_initial_metadata {
                let rx = inner.headers_rx.lock().unwrap().take();
                match rx {
                    Some(rx) => Some(rx),
                    None => return Err(WeftError::call("initial metadata already requested")),
                }
            } else {
                None
            };
            let status = if batch.recv_status {
                let rx = inner.status_rx.lock().unwrap().take();
                match rx {
                    Some(rx) => Some(rx),
                    None => {
                        // Rejecting the batch must not consume its slots.
                        if let Some(headers) = headers {
                            *inner.headers_rx.lock().unwrap() = Some(headers);
                        }
                        return Err(WeftError::call("final status already requested"));
                    }
                }
            } else {
                None
            };

            flags.started = true;
            if batch.send_initial_metadata.is_some() {
                flags.sent_initial_metadata = true;
            }
            if batch.send_close {
                flags.sent_close = true;
            }

            completion = BatchCompletion {
                headers,
                message: batch.recv_message.then(|| Arc::clone(&inner.messages_rx)),
                status,
            };
        }

        if let Some(metadata) = batch.send_initial_metadata {
            let head = self.build_request_head(metadata).await?;
            inner.control.send_headers(&head).await?;
        }
        if let Some(payload) = batch.send_message {
            inner.control.send_message(payload).await?;
        }
        if batch.send_close {
            inner.control.send_close().await?;
        }

        Ok(completion)
    }

    /// Submit a batch and await its completion.
    pub async fn run_batch(&self, batch: Batch) -> Result<BatchResult, WeftError> {
        let completion = self.start_batch(batch).await?;
        Ok(completion.wait().await)
    }

    /// Assemble the request head for SEND_INITIAL_METADATA: caller metadata,
    /// then the user-agent entry, then whatever the effective credentials
    /// generate for this call's authority. A failing credential generator
    /// resolves the call with its status.
    async fn build_request_head(&self, mut metadata: Metadata) -> Result<RequestHead, WeftError> {
        let inner = &self.inner;

        if metadata.first("user-agent").is_none() {
            metadata.add("user-agent", inner.user_agent.as_str())?;
        }

        let per_call = inner.per_call_credentials.lock().unwrap().clone();
        for credentials in [inner.channel_credentials.as_ref(), per_call.as_ref()]
            .into_iter()
            .flatten()
        {
            match credentials.apply(&inner.authority).await {
                Ok(generated) => metadata.merge(generated),
                Err(status) => {
                    inner.control.cancel(status.clone());
                    return Err(WeftError::Rpc(status));
                }
            }
        }

        let timeout_ms = match inner.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                (remaining.as_millis() as u64).max(1)
            }
            None => 0,
        };

        Ok(RequestHead {
            path: inner.path.clone(),
            authority: inner.authority.clone(),
            timeout_ms,
            metadata,
        })
    }
}
