//! The weft server: accept loop and per-call dispatch.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;
use tracing::{debug, error, info};
use weft_core::wire::RequestHead;
use weft_core::{Status, WeftError};
use weft_transport::{serve_connection, InboundCall, Responder};

use crate::router::{Route, Router};
use crate::service::{Inbound, Outbound, Reply, Request};

/// A weft RPC server.
pub struct Server {
    router: Arc<Router>,
}

impl Server {
    pub fn new(router: Router) -> Self {
        Self {
            router: Arc::new(router),
        }
    }

    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Bind to `addr` without accepting yet; useful for ephemeral ports.
    pub async fn bind(self, addr: SocketAddr) -> Result<BoundServer, WeftError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WeftError::Transport(format!("failed to bind {}: {}", addr, e)))?;
        Ok(BoundServer {
            listener,
            router: self.router,
        })
    }

    /// Bind and serve until the task is dropped.
    pub async fn serve(self, addr: SocketAddr) -> Result<(), WeftError> {
        self.bind(addr).await?.serve().await
    }
}

/// A server bound to a local address.
pub struct BoundServer {
    listener: TcpListener,
    router: Arc<Router>,
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr, WeftError> {
        self.listener
            .local_addr()
            .map_err(|e| WeftError::Transport(e.to_string()))
    }

    pub async fn serve(self) -> Result<(), WeftError> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("weft server listening on {}", addr);
        }
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| WeftError::Transport(format!("accept failed: {}", e)))?;
            let router = Arc::clone(&self.router);
            tokio::spawn(handle_connection(stream, peer, router));
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, router: Arc<Router>) {
    debug!(%peer, "connection accepted");
    let mut incoming = serve_connection(stream, peer);
    while let Some(call) = incoming.recv().await {
        tokio::spawn(dispatch(call, Arc::clone(&router)));
    }
    debug!(%peer, "connection closed");
}

async fn dispatch(call: InboundCall, router: Arc<Router>) {
    let InboundCall {
        head,
        messages,
        mut cancelled,
        responder,
    } = call;

    let Some(route) = router.get(&head.path) else {
        let status = Status::unimplemented(format!("unknown method: {}", head.path));
        if let Err(e) = responder.finish(&status).await {
            debug!("failed to reject call: {}", e);
        }
        return;
    };

    let deadline = (head.timeout_ms > 0).then(|| Duration::from_millis(head.timeout_ms));

    tokio::select! {
        _ = run_route(route, head, messages, responder.clone()) => {}
        _ = wait_cancelled(&mut cancelled) => {
            debug!("call cancelled by peer");
        }
        _ = wait_deadline(deadline) => {
            let _ = responder
                .finish(&Status::deadline_exceeded("Deadline Exceeded"))
                .await;
        }
    }
}

async fn wait_cancelled(cancelled: &mut watch::Receiver<bool>) {
    loop {
        if *cancelled.borrow() {
            return;
        }
        // A closed watch means the connection is gone; treat it as cancel.
        if cancelled.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_deadline(deadline: Option<Duration>) {
    match deadline {
        Some(deadline) => tokio::time::sleep(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_route(
    route: &Route,
    head: RequestHead,
    messages: mpsc::UnboundedReceiver<Bytes>,
    responder: Responder,
) {
    let peer = responder.peer().to_string();
    match route {
        Route::Unary(handler) => {
            let mut inbound = Inbound::new(messages);
            let Some(message) = inbound.next().await else {
                let _ = responder
                    .finish(&Status::internal("missing request message"))
                    .await;
                return;
            };
            let result = handler(Request {
                metadata: head.metadata,
                message,
                peer,
            })
            .await;
            send_unary_reply(&responder, result).await;
        }
        Route::ClientStreaming(handler) => {
            let result = handler(Request {
                metadata: head.metadata,
                message: Inbound::new(messages),
                peer,
            })
            .await;
            send_unary_reply(&responder, result).await;
        }
        Route::ServerStreaming(handler) => {
            let mut inbound = Inbound::new(messages);
            let Some(message) = inbound.next().await else {
                let _ = responder
                    .finish(&Status::internal("missing request message"))
                    .await;
                return;
            };
            let result = handler(Request {
                metadata: head.metadata,
                message,
                peer,
            })
            .await;
            send_streaming_reply(&responder, result).await;
        }
        Route::Duplex(handler) => {
            let result = handler(Request {
                metadata: head.metadata,
                message: Inbound::new(messages),
                peer,
            })
            .await;
            send_streaming_reply(&responder, result).await;
        }
    }
}

async fn send_unary_reply(responder: &Responder, result: Result<Reply<Bytes>, Status>) {
    match result {
        Ok(reply) => {
            if let Err(e) = async {
                responder.send_initial_metadata(&reply.initial_metadata).await?;
                responder.send_message(reply.message).await?;
                responder
                    .finish(&Status::ok().with_metadata(reply.trailing_metadata))
                    .await
            }
            .await
            {
                error!("failed to send reply: {}", e);
            }
        }
        Err(status) => {
            let _ = responder.finish(&status).await;
        }
    }
}

async fn send_streaming_reply(responder: &Responder, result: Result<Reply<Outbound>, Status>) {
    let reply = match result {
        Ok(reply) => reply,
        Err(status) => {
            let _ = responder.finish(&status).await;
            return;
        }
    };

    if let Err(e) = responder.send_initial_metadata(&reply.initial_metadata).await {
        error!("failed to send initial metadata: {}", e);
        return;
    }

    let mut body = reply.message;
    while let Some(item) = body.next().await {
        match item {
            Ok(payload) => {
                if let Err(e) = responder.send_message(payload).await {
                    debug!("stopping stream: {}", e);
                    return;
                }
            }
            Err(status) => {
                let _ = responder.finish(&status).await;
                return;
            }
        }
    }

    let _ = responder
        .finish(&Status::ok().with_metadata(reply.trailing_metadata))
        .await;
}

/// Builder for assembling a server from shaped handlers.
pub struct ServerBuilder {
    router: Router,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
        }
    }

    /// Register a unary handler. Path format: `{package.Service}/{Method}`.
    pub fn register_unary<F, Fut>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request<Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply<Bytes>, Status>> + Send + 'static,
    {
        self.router.register_unary(path, handler);
        self
    }

    pub fn register_client_streaming<F, Fut>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request<Inbound>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply<Bytes>, Status>> + Send + 'static,
    {
        self.router.register_client_streaming(path, handler);
        self
    }

    pub fn register_server_streaming<F, Fut>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request<Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply<Outbound>, Status>> + Send + 'static,
    {
        self.router.register_server_streaming(path, handler);
        self
    }

    pub fn register_duplex<F, Fut>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request<Inbound>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply<Outbound>, Status>> + Send + 'static,
    {
        self.router.register_duplex(path, handler);
        self
    }

    pub fn build(self) -> Server {
        Server::new(self.router)
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
