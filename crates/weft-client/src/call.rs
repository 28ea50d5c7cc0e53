//! Call handles: one live RPC each.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use weft_core::{CallCredentials, Code, Metadata, Status, WeftError};
use weft_transport::{CallControl, CallRecv};

/// Flags controlling what a child call inherits from its parent.
pub mod propagate {
    pub const DEADLINE: u32 = 0x1;
    pub const CANCELLATION: u32 = 0x2;
    pub const DEFAULTS: u32 = DEADLINE | CANCELLATION;
}

/// Per-call options recognised at invocation time.
#[derive(Default)]
pub struct CallOptions {
    /// Absolute deadline; `None` means "never expire by timeout".
    pub deadline: Option<Instant>,
    /// Authority override for this call.
    pub host: Option<String>,
    /// Parent call for deadline/cancellation propagation.
    pub parent: Option<Call>,
    /// Bitmask of [`propagate`] flags. Ignored unless `parent` is set.
    pub propagate_flags: u32,
    /// Per-call credential override. Requires a secure channel credential.
    pub credentials: Option<CallCredentials>,
    /// Per-message send flags. Accepted for interface compatibility; the
    /// framed transport has no flagged send path.
    pub flags: u32,
}

impl CallOptions {
    pub fn new() -> Self {
        Self {
            propagate_flags: propagate::DEFAULTS,
            ..Self::default()
        }
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn parent(mut self, parent: &Call) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn propagate_flags(mut self, flags: u32) -> Self {
        self.propagate_flags = flags;
        self
    }

    pub fn credentials(mut self, credentials: CallCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

pub(crate) struct CallFlags {
    pub started: bool,
    pub sent_initial_metadata: bool,
    pub sent_close: bool,
}

pub(crate) struct CallInner {
    pub control: CallControl,
    pub path: String,
    pub authority: String,
    pub deadline: Option<Instant>,
    pub secure: bool,
    pub max_recv: Option<usize>,
    pub user_agent: String,
    /// Call credentials attached to the channel credential, if any.
    pub channel_credentials: Option<CallCredentials>,
    /// Per-call override, settable until the first batch runs.
    pub per_call_credentials: Mutex<Option<CallCredentials>>,
    pub flags: Mutex<CallFlags>,
    /// Set by local cancellation. Readable sequences use this to suppress
    /// data events buffered before the cancel.
    pub cancelled: AtomicBool,
    pub headers_rx: Mutex<Option<oneshot::Receiver<Metadata>>>,
    pub messages_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>>,
    pub status_rx: Mutex<Option<oneshot::Receiver<Status>>>,
    pub children: Mutex<Vec<Weak<CallInner>>>,
}

impl CallInner {
    fn cancel_with(&self, status: Status) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.control.cancel(status);
        let children: Vec<_> = self.children.lock().unwrap().drain(..).collect();
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel_with(Status::cancelled("parent call cancelled"));
            }
        }
    }
}

impl Drop for CallInner {
    fn drop(&mut self) {
        // An abandoned call tears down its transport state; a completed one
        // is already terminal and this is a no-op.
        if !self.control.is_terminal() {
            self.control.cancel(Status::cancelled("call dropped"));
        }
    }
}

/// A single in-flight RPC.
///
/// Cloning shares the same underlying call; the handle is what drivers
/// submit batches against and what callers cancel through. A call becomes
/// terminal once its final status resolves (trailers, deadline, cancel, or
/// connection loss); after that, batches containing send operations fail
/// without I/O while recv operations drain whatever already arrived.
#[derive(Clone)]
pub struct Call {
    pub(crate) inner: Arc<CallInner>,
}

impl Call {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        control: CallControl,
        recv: CallRecv,
        path: String,
        authority: String,
        deadline: Option<Instant>,
        secure: bool,
        max_recv: Option<usize>,
        user_agent: String,
        channel_credentials: Option<CallCredentials>,
        per_call_credentials: Option<CallCredentials>,
    ) -> Self {
        Self {
            inner: Arc::new(CallInner {
                control,
                path,
                authority,
                deadline,
                secure,
                max_recv,
                user_agent,
                channel_credentials,
                per_call_credentials: Mutex::new(per_call_credentials),
                flags: Mutex::new(CallFlags {
                    started: false,
                    sent_initial_metadata: false,
                    sent_close: false,
                }),
                cancelled: AtomicBool::new(false),
                headers_rx: Mutex::new(recv.headers),
                messages_rx: Arc::new(tokio::sync::Mutex::new(recv.messages)),
                status_rx: Mutex::new(recv.status),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Cancel the call. Any outstanding batch and the final status report
    /// CANCELLED; the remote peer observes CANCELLED as well. Race-safe: a
    /// no-op once the call is terminal.
    pub fn cancel(&self) {
        self.inner.cancel_with(Status::cancelled("Cancelled"));
    }

    /// Like [`cancel`](Self::cancel), but the local observer sees the given
    /// code and details. The remote peer still observes CANCELLED.
    pub fn cancel_with_status(&self, code: Code, details: impl Into<String>) {
        self.inner.cancel_with(Status::new(code, details));
    }

    /// The transport's current remote address.
    pub fn peer(&self) -> String {
        self.inner.control.peer()
    }

    /// Override the per-call credentials. Only valid before the first batch
    /// runs, and only on calls over a secure channel credential.
    pub fn set_credentials(&self, credentials: CallCredentials) -> Result<(), WeftError> {
        if !self.inner.secure {
            return Err(WeftError::invalid_argument(
                "call credentials require a secure channel",
            ));
        }
        let flags = self.inner.flags.lock().unwrap();
        if flags.started {
            return Err(WeftError::call("call already started"));
        }
        *self.inner.per_call_credentials.lock().unwrap() = Some(credentials);
        Ok(())
    }

    /// Whether the call has reached its terminal state.
    pub fn is_terminal(&self) -> bool {
        self.inner.control.is_terminal()
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn authority(&self) -> &str {
        &self.inner.authority
    }

    pub(crate) fn register_child(&self, child: &Call) {
        // A child attached to an already-terminal parent is cancelled
        // immediately.
        if self.inner.control.is_terminal() {
            child.inner.cancel_with(Status::cancelled("parent call cancelled"));
            return;
        }
        self.inner
            .children
            .lock()
            .unwrap()
            .push(Arc::downgrade(&child.inner));
    }

    pub(crate) fn max_recv(&self) -> Option<usize> {
        self.inner.max_recv
    }

    pub(crate) fn locally_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}
