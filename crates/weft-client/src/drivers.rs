//! Shape drivers: the four RPC shapes sequenced as batches.
//!
//! All drivers operate on opaque message bytes; typed encode/decode lives in
//! the client layer. State machine for every shape is
//! IDLE -> SENDING -> HALF_CLOSED -> TERMINAL, with the batches described on
//! each driver.

use bytes::Bytes;
use weft_core::{Metadata, Status, WeftError};

use crate::batch::{Batch, BatchCompletion, BatchResult};
use crate::call::Call;

/// Everything a unary-shaped exchange produces.
#[derive(Debug)]
pub struct RawUnaryResponse {
    pub payload: Bytes,
    pub initial_metadata: Metadata,
    pub trailing_metadata: Metadata,
}

fn check_size(call: &Call, len: usize) -> Result<(), WeftError> {
    if let Some(max) = call.max_recv() {
        if len > max {
            return Err(WeftError::Rpc(Status::resource_exhausted(format!(
                "received message of {} bytes exceeds limit of {}",
                len, max
            ))));
        }
    }
    Ok(())
}

/// A batch lost the race against the call turning terminal (deadline,
/// cancel, connection loss). Claim the buffered status so the caller
/// observes the terminal code rather than a bare call error.
async fn terminal_status(call: &Call) -> WeftError {
    match call.start_batch(Batch::new().recv_status()).await {
        Ok(completion) => match completion.wait().await.status {
            Some(status) => WeftError::Rpc(status),
            None => WeftError::call("call already finished"),
        },
        Err(e) => e,
    }
}

async fn open_batch(call: &Call, batch: Batch) -> Result<BatchCompletion, WeftError> {
    match call.start_batch(batch).await {
        Ok(completion) => Ok(completion),
        Err(WeftError::Call(_)) if call.is_terminal() => Err(terminal_status(call).await),
        Err(e) => Err(e),
    }
}

fn finish_unary(call: &Call, result: BatchResult) -> Result<RawUnaryResponse, WeftError> {
    let status = result
        .status
        .unwrap_or_else(|| Status::internal("missing final status"));
    if !status.is_ok() {
        return Err(WeftError::Rpc(status));
    }
    let payload = match result.message.flatten() {
        Some(payload) => payload,
        None => {
            return Err(WeftError::Rpc(Status::internal(
                "no response message received",
            )))
        }
    };
    check_size(call, payload.len())?;
    Ok(RawUnaryResponse {
        payload,
        initial_metadata: result.initial_metadata.unwrap_or_default(),
        trailing_metadata: status.metadata().clone(),
    })
}

/// Unary driver: one batch carrying all six operations.
pub async fn unary(
    call: &Call,
    metadata: Metadata,
    request: Bytes,
) -> Result<RawUnaryResponse, WeftError> {
    let completion = open_batch(
        call,
        Batch::new()
            .send_initial_metadata(metadata)
            .send_message(request)
            .send_close()
            .recv_initial_metadata()
            .recv_message()
            .recv_status(),
    )
    .await?;
    finish_unary(call, completion.wait().await)
}

/// Client-streaming driver.
///
/// Two concurrent batches on open ({SEND_INITIAL_METADATA,
/// RECV_INITIAL_METADATA} and {RECV_MESSAGE, RECV_STATUS_ON_CLIENT}), one
/// {SEND_MESSAGE} batch per write, {SEND_CLOSE_FROM_CLIENT} on finish.
pub struct RawClientStream {
    call: Call,
    open: BatchCompletion,
    response: BatchCompletion,
}

pub async fn client_streaming(
    call: &Call,
    metadata: Metadata,
) -> Result<RawClientStream, WeftError> {
    let open = open_batch(
        call,
        Batch::new()
            .send_initial_metadata(metadata)
            .recv_initial_metadata(),
    )
    .await?;
    let response = call
        .start_batch(Batch::new().recv_message().recv_status())
        .await?;
    Ok(RawClientStream {
        call: call.clone(),
        open,
        response,
    })
}

impl RawClientStream {
    /// Queue one message. A write racing a cancellation or an already-ended
    /// call is dropped silently; errors surface through the final status.
    pub async fn send(&self, payload: Bytes) -> Result<(), WeftError> {
        match self
            .call
            .start_batch(Batch::new().send_message(payload))
            .await
        {
            Ok(_) => Ok(()),
            Err(WeftError::Call(_)) if self.call.is_terminal() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Half-close and await the single response.
    pub async fn finish(self) -> Result<RawUnaryResponse, WeftError> {
        match self.call.start_batch(Batch::new().send_close()).await {
            Ok(_) => {}
            Err(WeftError::Call(_)) if self.call.is_terminal() => {}
            Err(e) => return Err(e),
        }
        let mut result = self.response.wait().await;
        // The open batch resolves no later than the response batch; merge
        // its initial metadata into the unary-shaped result.
        result.initial_metadata = self.open.wait().await.initial_metadata;
        finish_unary(&self.call, result)
    }

    pub fn call(&self) -> &Call {
        &self.call
    }
}

/// Readable sequence for server-streaming and bidi reads.
///
/// Messages are pulled by demand as {RECV_MESSAGE} batches; a completion
/// with no payload triggers the trailing {RECV_STATUS_ON_CLIENT} batch.
/// Exactly one terminal event is surfaced: `Ok(None)` for OK status, `Err`
/// otherwise.
pub struct RawStreaming {
    call: Call,
    open: Option<BatchCompletion>,
    initial_metadata: Option<Metadata>,
    trailing_status: Option<Status>,
    done: bool,
}

impl RawStreaming {
    fn new(call: Call, open: BatchCompletion) -> Self {
        Self {
            call,
            open: Some(open),
            initial_metadata: None,
            trailing_status: None,
            done: false,
        }
    }

    /// Initial response metadata, awaited at most once and delivered before
    /// any message.
    pub async fn initial_metadata(&mut self) -> Option<Metadata> {
        if let Some(open) = self.open.take() {
            self.initial_metadata = open.wait().await.initial_metadata;
        }
        self.initial_metadata.clone()
    }

    /// Pull the next message. `Ok(None)` means the stream ended with OK
    /// status; a non-OK status is returned as an error exactly once, after
    /// which the sequence reports end-of-stream.
    pub async fn next(&mut self) -> Result<Option<Bytes>, WeftError> {
        if self.done {
            return Ok(None);
        }
        if self.open.is_some() {
            self.initial_metadata().await;
        }
        // A local cancel suppresses data events that were already buffered;
        // the terminal status is all that remains observable.
        if self.call.locally_cancelled() {
            return self.read_status().await;
        }
        let completion = self.call.start_batch(Batch::new().recv_message()).await?;
        match completion.wait().await.message.flatten() {
            Some(payload) if !self.call.locally_cancelled() => {
                check_size(&self.call, payload.len())?;
                Ok(Some(payload))
            }
            _ => self.read_status().await,
        }
    }

    async fn read_status(&mut self) -> Result<Option<Bytes>, WeftError> {
        self.done = true;
        let result = self
            .call
            .start_batch(Batch::new().recv_status())
            .await?
            .wait()
            .await;
        let status = result
            .status
            .unwrap_or_else(|| Status::internal("missing final status"));
        self.trailing_status = Some(status.clone());
        if status.is_ok() {
            Ok(None)
        } else {
            Err(WeftError::Rpc(status))
        }
    }

    /// Final status, available once the sequence has ended.
    pub fn trailing_status(&self) -> Option<&Status> {
        self.trailing_status.as_ref()
    }

    /// Trailing metadata, available once the sequence has ended.
    pub fn trailing_metadata(&self) -> Option<&Metadata> {
        self.trailing_status.as_ref().map(|s| s.metadata())
    }

    pub fn call(&self) -> &Call {
        &self.call
    }
}

/// Server-streaming driver: open batch {SEND_INITIAL_METADATA, SEND_MESSAGE,
/// SEND_CLOSE_FROM_CLIENT, RECV_INITIAL_METADATA}, then demand-driven reads.
pub async fn server_streaming(
    call: &Call,
    metadata: Metadata,
    request: Bytes,
) -> Result<RawStreaming, WeftError> {
    let open = open_batch(
        call,
        Batch::new()
            .send_initial_metadata(metadata)
            .send_message(request)
            .send_close()
            .recv_initial_metadata(),
    )
    .await?;
    Ok(RawStreaming::new(call.clone(), open))
}

/// Writable half of a bidi call.
pub struct RawSink {
    call: Call,
}

impl RawSink {
    /// Queue one message; silently dropped after cancel or end-of-call.
    pub async fn send(&self, payload: Bytes) -> Result<(), WeftError> {
        match self
            .call
            .start_batch(Batch::new().send_message(payload))
            .await
        {
            Ok(_) => Ok(()),
            Err(WeftError::Call(_)) if self.call.is_terminal() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Half-close the write side. Clean even when the read side has already
    /// ended (server-initiated completion).
    pub async fn close(&self) -> Result<(), WeftError> {
        match self.call.start_batch(Batch::new().send_close()).await {
            Ok(_) => Ok(()),
            Err(WeftError::Call(_)) if self.call.is_terminal() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn call(&self) -> &Call {
        &self.call
    }
}

/// Bidi driver: open batch {SEND_INITIAL_METADATA, RECV_INITIAL_METADATA};
/// writes and reads then proceed independently.
pub async fn duplex(
    call: &Call,
    metadata: Metadata,
) -> Result<(RawSink, RawStreaming), WeftError> {
    let open = open_batch(
        call,
        Batch::new()
            .send_initial_metadata(metadata)
            .recv_initial_metadata(),
    )
    .await?;
    Ok((
        RawSink { call: call.clone() },
        RawStreaming::new(call.clone(), open),
    ))
}
