//! Server-side connection handling: framed calls in, responses out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};
use weft_core::wire::{self, Frame, FrameKind, FrameParser, RequestHead, Trailers};
use weft_core::{Metadata, Status, WeftError};

const WRITE_QUEUE_DEPTH: usize = 32;
const INCOMING_QUEUE_DEPTH: usize = 16;
const READ_CHUNK: usize = 16 * 1024;

/// One call as observed by the server: its request head, the inbound message
/// sequence (ending at the client's half-close), a cancellation watch, and
/// the responder used to emit headers, messages, and trailers.
pub struct InboundCall {
    pub head: RequestHead,
    pub messages: mpsc::UnboundedReceiver<Bytes>,
    pub cancelled: watch::Receiver<bool>,
    pub responder: Responder,
}

/// Write-side handle for one server call. Initial metadata is emitted at
/// most once and always precedes the first message; `finish` emits it (empty)
/// on its own when a handler never did.
#[derive(Clone)]
pub struct Responder {
    call_id: u32,
    writer: mpsc::Sender<Frame>,
    peer: String,
    headers_sent: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl Responder {
    async fn send(&self, frame: Frame) -> Result<(), WeftError> {
        self.writer
            .send(frame)
            .await
            .map_err(|_| WeftError::call("connection closed"))
    }

    pub async fn send_initial_metadata(&self, metadata: &Metadata) -> Result<(), WeftError> {
        if self.headers_sent.swap(true, Ordering::SeqCst) {
            return Err(WeftError::call("initial metadata already sent"));
        }
        self.send(Frame::headers(
            self.call_id,
            wire::encode_metadata_payload(metadata),
        ))
        .await
    }

    pub async fn send_message(&self, payload: Bytes) -> Result<(), WeftError> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(WeftError::call("call already finished"));
        }
        if !self.headers_sent.swap(true, Ordering::SeqCst) {
            self.send(Frame::headers(
                self.call_id,
                wire::encode_metadata_payload(&Metadata::new()),
            ))
            .await?;
        }
        self.send(Frame::message(self.call_id, payload)).await
    }

    /// Emit trailers carrying `status` and its trailing metadata. At most
    /// one emission per call; later attempts are no-ops.
    pub async fn finish(&self, status: &Status) -> Result<(), WeftError> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.headers_sent.swap(true, Ordering::SeqCst) {
            self.send(Frame::headers(
                self.call_id,
                wire::encode_metadata_payload(&Metadata::new()),
            ))
            .await?;
        }
        self.send(Frame::trailers(
            self.call_id,
            Trailers::from_status(status).encode(),
        ))
        .await
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

struct ServerEntry {
    messages: Option<mpsc::UnboundedSender<Bytes>>,
    cancelled: watch::Sender<bool>,
}

/// Turn an accepted socket into a stream of inbound calls. Reader and writer
/// tasks are spawned internally; the returned receiver yields one
/// [`InboundCall`] per HEADERS frame and closes when the peer disconnects.
pub fn serve_connection(stream: TcpStream, peer: SocketAddr) -> mpsc::Receiver<InboundCall> {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_DEPTH);

    tokio::spawn(write_loop(write_half, writer_rx));
    tokio::spawn(read_loop(read_half, writer_tx, incoming_tx, peer));

    incoming_rx
}

async fn write_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_half.write_all(&frame.encode()).await {
            debug!("write loop ending: {}", e);
            break;
        }
    }
}

async fn read_loop(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    writer: mpsc::Sender<Frame>,
    incoming: mpsc::Sender<InboundCall>,
    peer: SocketAddr,
) {
    let mut parser = FrameParser::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut calls: HashMap<u32, ServerEntry> = HashMap::new();

    'outer: loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                parser.feed(&buf[..n]);
                loop {
                    match parser.parse_frame() {
                        Ok(Some(frame)) => {
                            if handle_frame(frame, &writer, &incoming, &mut calls, peer)
                                .await
                                .is_err()
                            {
                                break 'outer;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!(%peer, "frame parse error: {}", e);
                            break 'outer;
                        }
                    }
                }
            }
            Err(e) => {
                debug!(%peer, "read loop ending: {}", e);
                break;
            }
        }
    }
    // Dropping the map drops every cancellation sender, which is how
    // in-flight handlers learn the connection is gone.
}

async fn handle_frame(
    frame: Frame,
    writer: &mpsc::Sender<Frame>,
    incoming: &mpsc::Sender<InboundCall>,
    calls: &mut HashMap<u32, ServerEntry>,
    peer: SocketAddr,
) -> Result<(), ()> {
    match frame.kind {
        FrameKind::Headers => {
            let head = match RequestHead::decode(frame.payload) {
                Ok(head) => head,
                Err(e) => {
                    error!(%peer, call_id = frame.call_id, "malformed request head: {}", e);
                    return Err(());
                }
            };
            let (messages_tx, messages_rx) = mpsc::unbounded_channel();
            let (cancel_tx, cancel_rx) = watch::channel(false);
            calls.insert(
                frame.call_id,
                ServerEntry {
                    messages: Some(messages_tx),
                    cancelled: cancel_tx,
                },
            );
            let call = InboundCall {
                head,
                messages: messages_rx,
                cancelled: cancel_rx,
                responder: Responder {
                    call_id: frame.call_id,
                    writer: writer.clone(),
                    peer: peer.to_string(),
                    headers_sent: Arc::new(AtomicBool::new(false)),
                    finished: Arc::new(AtomicBool::new(false)),
                },
            };
            if incoming.send(call).await.is_err() {
                return Err(());
            }
        }
        FrameKind::Message => {
            if let Some(entry) = calls.get(&frame.call_id) {
                if let Some(tx) = &entry.messages {
                    let _ = tx.send(frame.payload);
                }
            }
        }
        FrameKind::Close => {
            // Half-close: no further inbound messages on this call.
            if let Some(entry) = calls.get_mut(&frame.call_id) {
                entry.messages = None;
            }
        }
        FrameKind::Cancel => {
            if let Some(entry) = calls.remove(&frame.call_id) {
                let _ = entry.cancelled.send(true);
            }
        }
        FrameKind::Trailers => {
            debug!(%peer, call_id = frame.call_id, "ignoring client trailers frame");
        }
    }
    Ok(())
}
