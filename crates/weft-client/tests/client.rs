//! Client-layer behavior against a peer that accepts but never answers.

use std::net::SocketAddr;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::{Duration, Instant};
use weft_client::{CallOptions, Channel, ChannelOptions, Client, ServiceDescriptor};
use weft_core::{CallCredentials, ChannelCredentials, Code, Metadata, WeftError};

#[derive(Clone, PartialEq, ::prost::Message)]
struct Ping {
    #[prost(string, tag = "1")]
    text: String,
}

/// Accepts connections and discards whatever arrives, never answering.
async fn silent_peer() -> SocketAddr {
    let _ = tracing_subscriber::fmt::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });
    addr
}

async fn insecure_channel() -> Channel {
    let addr = silent_peer().await;
    Channel::connect(
        &addr.to_string(),
        ChannelCredentials::insecure(),
        ChannelOptions::new(),
    )
    .await
    .unwrap()
}

fn descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new("test.PingService")
        .method("Ping", false, false)
        .method("PingStream", true, false)
        .method("PingDuplex", true, true)
}

#[tokio::test]
async fn test_reserved_method_prefix_rejected() {
    let channel = insecure_channel().await;
    let bad = ServiceDescriptor::new("test.PingService").method("$internal", false, false);

    match Client::new(channel, bad) {
        Err(WeftError::InvalidArgument(msg)) => assert!(msg.contains('$')),
        other => panic!("expected invalid argument, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_shape_mismatch_rejected() {
    let channel = insecure_channel().await;
    let client = Client::new(channel, descriptor()).unwrap();

    let err = client
        .unary::<Ping, Ping>(
            "PingStream",
            &Ping::default(),
            Metadata::new(),
            CallOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WeftError::InvalidArgument(_)));

    let err = client
        .unary::<Ping, Ping>(
            "NoSuchMethod",
            &Ping::default(),
            Metadata::new(),
            CallOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WeftError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_per_call_credentials_need_secure_channel() {
    let channel = insecure_channel().await;
    let client = Client::new(channel, descriptor()).unwrap();

    let options = CallOptions::new().credentials(CallCredentials::from_access_token("tok"));
    let err = client
        .unary::<Ping, Ping>("Ping", &Ping::default(), Metadata::new(), options)
        .await
        .unwrap_err();
    assert!(matches!(err, WeftError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_deadline_surfaces_deadline_exceeded() {
    let channel = insecure_channel().await;
    let client = Client::new(channel, descriptor()).unwrap();

    let options = CallOptions::new().deadline(Instant::now() + Duration::from_millis(40));
    let err = tokio::time::timeout(
        Duration::from_secs(2),
        client.unary::<Ping, Ping>(
            "Ping",
            &Ping {
                text: "hi".to_string(),
            },
            Metadata::new(),
            options,
        ),
    )
    .await
    .expect("deadline never fired")
    .unwrap_err();

    assert_eq!(
        err.status().map(|s| s.code()),
        Some(Code::DeadlineExceeded)
    );
}

#[tokio::test]
async fn test_cancel_then_write_is_dropped_silently() {
    let channel = insecure_channel().await;
    let client = Client::new(channel, descriptor()).unwrap();

    let stream = client
        .client_streaming::<Ping, Ping>("PingStream", Metadata::new(), CallOptions::new())
        .await
        .unwrap();

    stream.call().cancel();

    // Write after cancel: no error, no dangling continuation.
    stream
        .send(&Ping {
            text: "late".to_string(),
        })
        .await
        .unwrap();

    let err = stream.finish().await.unwrap_err();
    assert_eq!(err.status().map(|s| s.code()), Some(Code::Cancelled));
}

#[tokio::test]
async fn test_cancel_with_status_keeps_local_code() {
    let channel = insecure_channel().await;
    let client = Client::new(channel, descriptor()).unwrap();

    let stream = client
        .client_streaming::<Ping, Ping>("PingStream", Metadata::new(), CallOptions::new())
        .await
        .unwrap();

    stream.call().cancel_with_status(Code::Aborted, "caller gave up");
    let err = stream.finish().await.unwrap_err();
    let status = err.status().unwrap();
    assert_eq!(status.code(), Code::Aborted);
    assert_eq!(status.details(), "caller gave up");
}

#[tokio::test]
async fn test_set_credentials_requires_secure_channel() {
    let channel = insecure_channel().await;
    let client = Client::new(channel.clone(), descriptor()).unwrap();

    let stream = client
        .client_streaming::<Ping, Ping>("PingStream", Metadata::new(), CallOptions::new())
        .await
        .unwrap();
    let err = stream
        .call()
        .set_credentials(CallCredentials::from_access_token("tok"))
        .unwrap_err();
    assert!(matches!(err, WeftError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_parent_cancellation_propagates() {
    let channel = insecure_channel().await;
    let client = Client::new(channel.clone(), descriptor()).unwrap();

    let parent = client
        .client_streaming::<Ping, Ping>("PingStream", Metadata::new(), CallOptions::new())
        .await
        .unwrap();

    let child_options = CallOptions::new().parent(parent.call());
    let child = client
        .client_streaming::<Ping, Ping>("PingStream", Metadata::new(), child_options)
        .await
        .unwrap();

    parent.call().cancel();
    assert!(child.call().is_terminal());

    let err = child.finish().await.unwrap_err();
    assert_eq!(err.status().map(|s| s.code()), Some(Code::Cancelled));
}

#[tokio::test]
async fn test_channel_close_rejects_new_calls() {
    let channel = insecure_channel().await;
    let client = Client::new(channel.clone(), descriptor()).unwrap();
    channel.close();

    let err = client
        .unary::<Ping, Ping>("Ping", &Ping::default(), Metadata::new(), CallOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WeftError::Call(_)));
}

#[tokio::test]
async fn test_peer_reports_remote_address() {
    let addr = silent_peer().await;
    let channel = Channel::connect(
        &addr.to_string(),
        ChannelCredentials::insecure(),
        ChannelOptions::new(),
    )
    .await
    .unwrap();
    assert_eq!(channel.target(), addr.to_string());

    let client = Client::new(channel, descriptor()).unwrap();
    let stream = client
        .client_streaming::<Ping, Ping>("PingStream", Metadata::new(), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(stream.call().peer(), addr.to_string());
    stream.call().cancel();
}
