//! Method router: path -> shaped handler.
//!
//! Paths follow the `{package.Service}/{Method}` convention.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use weft_core::Status;

use crate::service::{Inbound, Outbound, Reply, Request};

type UnaryHandler =
    Arc<dyn Fn(Request<Bytes>) -> BoxFuture<'static, Result<Reply<Bytes>, Status>> + Send + Sync>;
type ClientStreamingHandler = Arc<
    dyn Fn(Request<Inbound>) -> BoxFuture<'static, Result<Reply<Bytes>, Status>> + Send + Sync,
>;
type ServerStreamingHandler = Arc<
    dyn Fn(Request<Bytes>) -> BoxFuture<'static, Result<Reply<Outbound>, Status>> + Send + Sync,
>;
type DuplexHandler = Arc<
    dyn Fn(Request<Inbound>) -> BoxFuture<'static, Result<Reply<Outbound>, Status>> + Send + Sync,
>;

pub(crate) enum Route {
    Unary(UnaryHandler),
    ClientStreaming(ClientStreamingHandler),
    ServerStreaming(ServerStreamingHandler),
    Duplex(DuplexHandler),
}

/// Routes incoming calls to registered handlers by method path.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Route>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn register_unary<F, Fut>(&mut self, path: impl Into<String>, handler: F)
    where
        F: Fn(Request<Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply<Bytes>, Status>> + Send + 'static,
    {
        self.routes.insert(
            path.into(),
            Route::Unary(Arc::new(move |request| handler(request).boxed())),
        );
    }

    pub fn register_client_streaming<F, Fut>(&mut self, path: impl Into<String>, handler: F)
    where
        F: Fn(Request<Inbound>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply<Bytes>, Status>> + Send + 'static,
    {
        self.routes.insert(
            path.into(),
            Route::ClientStreaming(Arc::new(move |request| handler(request).boxed())),
        );
    }

    pub fn register_server_streaming<F, Fut>(&mut self, path: impl Into<String>, handler: F)
    where
        F: Fn(Request<Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply<Outbound>, Status>> + Send + 'static,
    {
        self.routes.insert(
            path.into(),
            Route::ServerStreaming(Arc::new(move |request| handler(request).boxed())),
        );
    }

    pub fn register_duplex<F, Fut>(&mut self, path: impl Into<String>, handler: F)
    where
        F: Fn(Request<Inbound>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply<Outbound>, Status>> + Send + 'static,
    {
        self.routes.insert(
            path.into(),
            Route::Duplex(Arc::new(move |request| handler(request).boxed())),
        );
    }

    pub(crate) fn get(&self, path: &str) -> Option<&Route> {
        self.routes.get(path)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_lookup() {
        let mut router = Router::new();
        assert!(router.is_empty());

        router.register_unary("echo.Echo/Echo", |request: Request<Bytes>| async move {
            Ok(Reply::new(request.message))
        });

        assert!(matches!(
            router.get("echo.Echo/Echo"),
            Some(Route::Unary(_))
        ));
        assert!(router.get("echo.Echo/Missing").is_none());
        assert!(!router.is_empty());
    }
}
