//! Channel and client factory.
//!
//! A [`Channel`] is the only multi-call shared resource: one connection plus
//! the channel credential and construction options, safe to use from any
//! number of concurrent calls. A [`Client`] binds a channel to a service's
//! method descriptor map and exposes one typed entry point per RPC shape.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use tracing::debug;
use weft_core::{ChannelCredentials, Metadata, Status, WeftError};
use weft_transport::Connection;

use crate::call::{propagate, Call, CallOptions};
use crate::drivers::{self, RawClientStream, RawSink, RawStreaming};

/// Options recognised at channel construction.
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    /// Authority used for TLS hostname matching, in place of the target.
    /// Only honored on secure channels.
    pub ssl_target_name_override: Option<String>,
    /// Fallback authority header when no override applies.
    pub default_authority: Option<String>,
    /// Prepended to the library's own user-agent string.
    pub primary_user_agent: Option<String>,
    /// Hard ceiling on received message size.
    pub max_receive_message_size: Option<usize>,
}

impl ChannelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ssl_target_name_override(mut self, authority: impl Into<String>) -> Self {
        self.ssl_target_name_override = Some(authority.into());
        self
    }

    pub fn default_authority(mut self, authority: impl Into<String>) -> Self {
        self.default_authority = Some(authority.into());
        self
    }

    pub fn primary_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.primary_user_agent = Some(agent.into());
        self
    }

    pub fn max_receive_message_size(mut self, bytes: usize) -> Self {
        self.max_receive_message_size = Some(bytes);
        self
    }
}

struct ChannelInner {
    conn: Connection,
    credentials: ChannelCredentials,
    authority: String,
    user_agent: String,
    max_recv: Option<usize>,
}

/// A connection to one peer, shared by any number of calls.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Connect to `target` (a `host:port` string) with the given channel
    /// credential and options.
    pub async fn connect(
        target: &str,
        credentials: ChannelCredentials,
        options: ChannelOptions,
    ) -> Result<Channel, WeftError> {
        if target.is_empty() {
            return Err(WeftError::invalid_argument("channel target must not be empty"));
        }

        let authority = if credentials.is_secure() {
            options
                .ssl_target_name_override
                .or(options.default_authority)
                .unwrap_or_else(|| target.to_string())
        } else {
            options
                .default_authority
                .unwrap_or_else(|| target.to_string())
        };

        let user_agent = match options.primary_user_agent {
            Some(primary) => format!("{} weft-rust/{}", primary, env!("CARGO_PKG_VERSION")),
            None => format!("weft-rust/{}", env!("CARGO_PKG_VERSION")),
        };

        let conn = Connection::connect(target).await?;
        debug!(target, authority = %authority, "channel connected");

        Ok(Channel {
            inner: Arc::new(ChannelInner {
                conn,
                credentials,
                authority,
                user_agent,
                max_recv: options.max_receive_message_size,
            }),
        })
    }

    /// The target string this channel was created with.
    pub fn target(&self) -> &str {
        self.inner.conn.target()
    }

    /// Shut the channel down; outstanding calls fail with UNAVAILABLE and
    /// new calls are rejected.
    pub fn close(&self) {
        self.inner.conn.close();
    }

    /// Create a call against `path` with the given per-call options.
    pub fn create_call(&self, path: &str, options: CallOptions) -> Result<Call, WeftError> {
        let inner = &self.inner;
        if options.credentials.is_some() && !inner.credentials.is_secure() {
            return Err(WeftError::invalid_argument(
                "call credentials require a secure channel",
            ));
        }

        let mut deadline = options.deadline;
        if let Some(parent) = &options.parent {
            if options.propagate_flags & propagate::DEADLINE != 0 {
                deadline = match (deadline, parent.inner.deadline) {
                    (Some(own), Some(inherited)) => Some(own.min(inherited)),
                    (own, inherited) => own.or(inherited),
                };
            }
        }

        let (control, recv) = inner.conn.new_call(deadline)?;
        let call = Call::new(
            control,
            recv,
            path.to_string(),
            options.host.unwrap_or_else(|| inner.authority.clone()),
            deadline,
            inner.credentials.is_secure(),
            inner.max_recv,
            inner.user_agent.clone(),
            inner.credentials.call_credentials().cloned(),
            options.credentials,
        );

        if let Some(parent) = &options.parent {
            if options.propagate_flags & propagate::CANCELLATION != 0 {
                parent.register_child(&call);
            }
        }

        Ok(call)
    }
}

/// Descriptor for one method: its path and the streaming flags that pick the
/// driver shape.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub path: String,
    pub request_stream: bool,
    pub response_stream: bool,
}

/// A service's method descriptor map: `name -> descriptor`, with paths of
/// the form `{package.Service}/{Method}`.
#[derive(Debug, Clone, Default)]
pub struct ServiceDescriptor {
    service: String,
    methods: HashMap<String, MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            methods: HashMap::new(),
        }
    }

    /// Register a method; its shape is determined by the streaming flag
    /// pair.
    pub fn method(mut self, name: &str, request_stream: bool, response_stream: bool) -> Self {
        self.methods.insert(
            name.to_string(),
            MethodDescriptor {
                path: format!("{}/{}", self.service, name),
                request_stream,
                response_stream,
            },
        );
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

/// A client bound to one service on one channel.
pub struct Client {
    channel: Channel,
    descriptor: ServiceDescriptor,
}

impl Client {
    /// Bind `descriptor` to `channel`. Method names starting with `$` are
    /// reserved and rejected here.
    pub fn new(channel: Channel, descriptor: ServiceDescriptor) -> Result<Client, WeftError> {
        for name in descriptor.methods.keys() {
            if name.starts_with('$') {
                return Err(WeftError::invalid_argument(format!(
                    "method name {:?} uses the reserved '$' prefix",
                    name
                )));
            }
        }
        Ok(Client {
            channel,
            descriptor,
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    fn method(
        &self,
        name: &str,
        request_stream: bool,
        response_stream: bool,
    ) -> Result<&MethodDescriptor, WeftError> {
        let descriptor = self.descriptor.methods.get(name).ok_or_else(|| {
            WeftError::invalid_argument(format!("unknown method: {}", name))
        })?;
        if descriptor.request_stream != request_stream
            || descriptor.response_stream != response_stream
        {
            return Err(WeftError::invalid_argument(format!(
                "method {} has shape ({}, {}), not ({}, {})",
                name,
                descriptor.request_stream,
                descriptor.response_stream,
                request_stream,
                response_stream
            )));
        }
        Ok(descriptor)
    }

    /// Unary call: one request, one response.
    pub async fn unary<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        metadata: Metadata,
        options: CallOptions,
    ) -> Result<UnaryResponse<Resp>, WeftError>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let descriptor = self.method(method, false, false)?;
        let call = self.channel.create_call(&descriptor.path, options)?;
        let raw = drivers::unary(&call, metadata, encode(request)).await?;
        Ok(UnaryResponse {
            message: decode(raw.payload)?,
            initial_metadata: raw.initial_metadata,
            trailing_metadata: raw.trailing_metadata,
        })
    }

    /// Client-streaming call: a writable sequence, then one response.
    pub async fn client_streaming<Req, Resp>(
        &self,
        method: &str,
        metadata: Metadata,
        options: CallOptions,
    ) -> Result<ClientStream<Req, Resp>, WeftError>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let descriptor = self.method(method, true, false)?;
        let call = self.channel.create_call(&descriptor.path, options)?;
        let raw = drivers::client_streaming(&call, metadata).await?;
        Ok(ClientStream {
            raw,
            _marker: PhantomData,
        })
    }

    /// Server-streaming call: one request, then a readable sequence.
    pub async fn server_streaming<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        metadata: Metadata,
        options: CallOptions,
    ) -> Result<Streaming<Resp>, WeftError>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let descriptor = self.method(method, false, true)?;
        let call = self.channel.create_call(&descriptor.path, options)?;
        let raw = drivers::server_streaming(&call, metadata, encode(request)).await?;
        Ok(Streaming {
            raw,
            _marker: PhantomData,
        })
    }

    /// Bidi call: independent writable and readable sequences.
    pub async fn bidi_streaming<Req, Resp>(
        &self,
        method: &str,
        metadata: Metadata,
        options: CallOptions,
    ) -> Result<(StreamSender<Req>, Streaming<Resp>), WeftError>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let descriptor = self.method(method, true, true)?;
        let call = self.channel.create_call(&descriptor.path, options)?;
        let (sink, stream) = drivers::duplex(&call, metadata).await?;
        Ok((
            StreamSender {
                raw: sink,
                _marker: PhantomData,
            },
            Streaming {
                raw: stream,
                _marker: PhantomData,
            },
        ))
    }
}

/// Result of a unary-shaped exchange. Message, initial metadata, and
/// trailing metadata arrive together, so there is no observable ordering
/// between "callback" and metadata/status events.
#[derive(Debug)]
pub struct UnaryResponse<T> {
    pub message: T,
    pub initial_metadata: Metadata,
    pub trailing_metadata: Metadata,
}

/// Typed writable sequence for client-streaming calls.
pub struct ClientStream<Req, Resp> {
    raw: RawClientStream,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> ClientStream<Req, Resp>
where
    Req: Message,
    Resp: Message + Default,
{
    /// Send one message. Writes racing a cancellation are dropped silently.
    pub async fn send(&self, request: &Req) -> Result<(), WeftError> {
        self.raw.send(encode(request)).await
    }

    /// Half-close and await the single response.
    pub async fn finish(self) -> Result<UnaryResponse<Resp>, WeftError> {
        let raw = self.raw.finish().await?;
        Ok(UnaryResponse {
            message: decode(raw.payload)?,
            initial_metadata: raw.initial_metadata,
            trailing_metadata: raw.trailing_metadata,
        })
    }

    pub fn call(&self) -> &Call {
        self.raw.call()
    }
}

/// Typed readable sequence for server-streaming and bidi calls.
pub struct Streaming<Resp> {
    raw: RawStreaming,
    _marker: PhantomData<fn() -> Resp>,
}

impl<Resp> Streaming<Resp>
where
    Resp: Message + Default,
{
    /// Next message, or `None` once the stream ends with OK status. A
    /// non-OK status surfaces as an error exactly once.
    pub async fn message(&mut self) -> Result<Option<Resp>, WeftError> {
        match self.raw.next().await? {
            Some(payload) => decode(payload).map(Some),
            None => Ok(None),
        }
    }

    /// Initial response metadata, delivered before the first message.
    pub async fn initial_metadata(&mut self) -> Option<Metadata> {
        self.raw.initial_metadata().await
    }

    /// Final status, once the sequence has ended.
    pub fn trailing_status(&self) -> Option<&Status> {
        self.raw.trailing_status()
    }

    /// Trailing metadata, once the sequence has ended.
    pub fn trailing_metadata(&self) -> Option<&Metadata> {
        self.raw.trailing_metadata()
    }

    pub fn call(&self) -> &Call {
        self.raw.call()
    }
}

/// Typed writable half of a bidi call.
pub struct StreamSender<Req> {
    raw: RawSink,
    _marker: PhantomData<fn(Req)>,
}

impl<Req> StreamSender<Req>
where
    Req: Message,
{
    /// Send one message; silently dropped after cancel or end-of-call.
    pub async fn send(&self, request: &Req) -> Result<(), WeftError> {
        self.raw.send(encode(request)).await
    }

    /// Half-close the write side.
    pub async fn close(&self) -> Result<(), WeftError> {
        self.raw.close().await
    }

    pub fn call(&self) -> &Call {
        self.raw.call()
    }
}

fn encode<M: Message>(message: &M) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

fn decode<M: Message + Default>(payload: Bytes) -> Result<M, WeftError> {
    M::decode(payload)
        .map_err(|_| WeftError::Rpc(Status::internal("Failed to parse server response")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_paths() {
        let descriptor = ServiceDescriptor::new("test.TestService")
            .method("UnaryCall", false, false)
            .method("FullDuplexCall", true, true);

        assert_eq!(
            descriptor.methods["UnaryCall"].path,
            "test.TestService/UnaryCall"
        );
        assert!(descriptor.methods["FullDuplexCall"].request_stream);
        assert!(descriptor.methods["FullDuplexCall"].response_stream);
    }
}
