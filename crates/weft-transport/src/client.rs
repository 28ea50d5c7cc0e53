//! Client-side connection: call multiplexing and frame demultiplexing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};
use weft_core::wire::{self, Frame, FrameKind, FrameParser, RequestHead, Trailers};
use weft_core::{Metadata, Status, WeftError};

/// Depth of the outbound frame queue. A full queue defers acceptance of the
/// next send, which is what gives SEND_MESSAGE its backpressure.
const WRITE_QUEUE_DEPTH: usize = 32;

const READ_CHUNK: usize = 16 * 1024;

struct CallEntry {
    headers: Option<oneshot::Sender<Metadata>>,
    messages: mpsc::UnboundedSender<Bytes>,
    status: oneshot::Sender<Status>,
}

struct ConnectionInner {
    target: String,
    peer: String,
    writer: mpsc::Sender<Frame>,
    calls: Mutex<HashMap<u32, CallEntry>>,
    next_call_id: AtomicU32,
    closed: AtomicBool,
}

impl ConnectionInner {
    fn is_active(&self, call_id: u32) -> bool {
        self.calls.lock().unwrap().contains_key(&call_id)
    }

    /// Resolve a call's final status. The first resolution wins; later
    /// signals for the same call are suppressed. Dropping the entry closes
    /// the headers and message channels, which is what ends any outstanding
    /// recv operations.
    fn finish_call(&self, call_id: u32, status: Status, notify_remote: bool) {
        let entry = self.calls.lock().unwrap().remove(&call_id);
        let Some(entry) = entry else {
            return;
        };
        if notify_remote && !self.closed.load(Ordering::SeqCst) {
            if self.writer.try_send(Frame::cancel(call_id)).is_err() {
                debug!(call_id, "cancel frame dropped: write queue unavailable");
            }
        }
        let _ = entry.status.send(status);
    }

    fn fail_all(&self, status: Status) {
        let entries: Vec<(u32, CallEntry)> =
            self.calls.lock().unwrap().drain().collect();
        for (call_id, entry) in entries {
            debug!(call_id, code = status.code().as_str(), "failing call");
            let _ = entry.status.send(status.clone());
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame.kind {
            FrameKind::Headers => match wire::decode_metadata_payload(frame.payload) {
                Ok(metadata) => {
                    let mut calls = self.calls.lock().unwrap();
                    if let Some(entry) = calls.get_mut(&frame.call_id) {
                        if let Some(tx) = entry.headers.take() {
                            let _ = tx.send(metadata);
                        }
                    }
                }
                Err(e) => {
                    self.finish_call(
                        frame.call_id,
                        Status::internal(format!("malformed response headers: {}", e)),
                        true,
                    );
                }
            },
            FrameKind::Message => {
                let calls = self.calls.lock().unwrap();
                if let Some(entry) = calls.get(&frame.call_id) {
                    let _ = entry.messages.send(frame.payload);
                }
            }
            FrameKind::Trailers => match Trailers::decode(frame.payload) {
                Ok(trailers) => {
                    self.finish_call(frame.call_id, trailers.into_status(), false);
                }
                Err(e) => {
                    self.finish_call(
                        frame.call_id,
                        Status::internal(format!("malformed trailers: {}", e)),
                        true,
                    );
                }
            },
            FrameKind::Close | FrameKind::Cancel => {
                debug!(call_id = frame.call_id, kind = ?frame.kind, "ignoring server frame");
            }
        }
    }
}

/// A client connection to one peer. Channels are the only multi-call shared
/// resource: a `Connection` is internally synchronised and may be used from
/// any number of concurrent calls.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connect to `target` (a `host:port` string).
    pub async fn connect(target: &str) -> Result<Connection, WeftError> {
        let stream = TcpStream::connect(target)
            .await
            .map_err(|e| WeftError::Transport(format!("failed to connect to {}: {}", target, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| WeftError::Transport(e.to_string()))?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| target.to_string());

        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

        let inner = Arc::new(ConnectionInner {
            target: target.to_string(),
            peer,
            writer: writer_tx,
            calls: Mutex::new(HashMap::new()),
            next_call_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(write_loop(write_half, writer_rx));
        tokio::spawn(read_loop(read_half, Arc::downgrade(&inner)));

        Ok(Connection { inner })
    }

    /// The target string this connection was created with.
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// The remote address as reported by the socket.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Shut the connection down. Every outstanding call fails with
    /// UNAVAILABLE and subsequent call creation is rejected.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.fail_all(Status::unavailable("channel closed"));
    }

    /// Register a new call. The deadline, when present, is armed immediately;
    /// its expiry resolves the call with DEADLINE_EXCEEDED and notifies the
    /// peer.
    pub fn new_call(
        &self,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<(CallControl, CallRecv), WeftError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(WeftError::call("channel closed"));
        }

        let call_id = self.inner.next_call_id.fetch_add(1, Ordering::SeqCst);
        let (headers_tx, headers_rx) = oneshot::channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = oneshot::channel();

        self.inner.calls.lock().unwrap().insert(
            call_id,
            CallEntry {
                headers: Some(headers_tx),
                messages: messages_tx,
                status: status_tx,
            },
        );

        if let Some(deadline) = deadline {
            let conn = Arc::downgrade(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(conn) = conn.upgrade() {
                    conn.finish_call(
                        call_id,
                        Status::deadline_exceeded("Deadline Exceeded"),
                        true,
                    );
                }
            });
        }

        let control = CallControl {
            conn: Arc::clone(&self.inner),
            call_id,
        };
        let recv = CallRecv {
            headers: Some(headers_rx),
            messages: messages_rx,
            status: Some(status_rx),
        };
        Ok((control, recv))
    }
}

/// Send-side and control handle for one call. Cloneable; sends are
/// serialized by the connection's write queue in submission order.
#[derive(Clone)]
pub struct CallControl {
    conn: Arc<ConnectionInner>,
    call_id: u32,
}

impl CallControl {
    fn ensure_active(&self) -> Result<(), WeftError> {
        if self.conn.is_active(self.call_id) {
            Ok(())
        } else {
            Err(WeftError::call("call already finished"))
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), WeftError> {
        self.ensure_active()?;
        self.conn
            .writer
            .send(frame)
            .await
            .map_err(|_| WeftError::call("connection closed"))
    }

    pub async fn send_headers(&self, head: &RequestHead) -> Result<(), WeftError> {
        self.send(Frame::headers(self.call_id, head.encode())).await
    }

    pub async fn send_message(&self, payload: Bytes) -> Result<(), WeftError> {
        self.send(Frame::message(self.call_id, payload)).await
    }

    pub async fn send_close(&self) -> Result<(), WeftError> {
        self.send(Frame::close(self.call_id)).await
    }

    /// Resolve the call with `status` locally and notify the peer, which
    /// observes CANCELLED regardless of the local code. A no-op once the
    /// call is terminal.
    pub fn cancel(&self, status: Status) {
        self.conn.finish_call(self.call_id, status, true);
    }

    pub fn is_terminal(&self) -> bool {
        !self.conn.is_active(self.call_id)
    }

    /// The remote address of the underlying connection.
    pub fn peer(&self) -> String {
        self.conn.peer.clone()
    }
}

/// Receive-side channels for one call.
///
/// After the call turns terminal the channels keep draining whatever had
/// already arrived: `headers`/`status` resolve with their buffered value and
/// `messages` yields remaining payloads before ending.
pub struct CallRecv {
    pub headers: Option<oneshot::Receiver<Metadata>>,
    pub messages: mpsc::UnboundedReceiver<Bytes>,
    pub status: Option<oneshot::Receiver<Status>>,
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
    conn: Weak<ConnectionInner>,
) {
    let mut parser = FrameParser::new();
    let mut buf = vec![0u8; READ_CHUNK];

    'outer: loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                parser.feed(&buf[..n]);
                loop {
                    match parser.parse_frame() {
                        Ok(Some(frame)) => {
                            let Some(conn) = conn.upgrade() else {
                                return;
                            };
                            conn.dispatch(frame);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!("frame parse error: {}", e);
                            break 'outer;
                        }
                    }
                }
            }
            Err(e) => {
                debug!("read loop ending: {}", e);
                break;
            }
        }
    }

    if let Some(conn) = conn.upgrade() {
        conn.closed.store(true, Ordering::SeqCst);
        conn.fail_all(Status::unavailable("connection lost"));
    }
}
