//! End-to-end interop matrix against the in-process reference server.

use weft_interop::{run_test_case, test_server, InteropOptions};

async fn start_server() -> u16 {
    let bound = test_server()
        .bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let port = bound.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = bound.serve().await;
    });
    port
}

async fn opts() -> InteropOptions {
    let _ = tracing_subscriber::fmt::try_init();
    InteropOptions {
        server_host: "127.0.0.1".to_string(),
        server_port: start_server().await,
        ..InteropOptions::default()
    }
}

#[tokio::test]
async fn test_empty_unary() {
    run_test_case("empty_unary", &opts().await).await.unwrap();
}

#[tokio::test]
async fn test_large_unary() {
    run_test_case("large_unary", &opts().await).await.unwrap();
}

#[tokio::test]
async fn test_client_streaming() {
    run_test_case("client_streaming", &opts().await)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_server_streaming() {
    run_test_case("server_streaming", &opts().await)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_ping_pong() {
    run_test_case("ping_pong", &opts().await).await.unwrap();
}

#[tokio::test]
async fn test_empty_stream() {
    run_test_case("empty_stream", &opts().await).await.unwrap();
}

#[tokio::test]
async fn test_cancel_after_begin() {
    run_test_case("cancel_after_begin", &opts().await)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cancel_after_first_response() {
    run_test_case("cancel_after_first_response", &opts().await)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_timeout_on_sleeping_server() {
    run_test_case("timeout_on_sleeping_server", &opts().await)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_custom_metadata() {
    run_test_case("custom_metadata", &opts().await)
        .await
        .unwrap();
}

/// The auth cases need a secure (composable) channel credential; the token
/// itself is opaque to this layer, so a fixed one exercises the path.
fn with_auth(mut opts: InteropOptions) -> InteropOptions {
    opts.use_tls = true;
    opts.use_test_ca = true;
    opts.oauth_access_token = Some("interop-test-token".to_string());
    opts.default_service_account = Some("interop@example.test".to_string());
    opts.oauth_scope = Some("https://example.test/auth/interop.scope".to_string());
    opts
}

#[tokio::test]
async fn test_oauth2_auth_token() {
    run_test_case("oauth2_auth_token", &with_auth(opts().await))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_per_rpc_creds() {
    run_test_case("per_rpc_creds", &with_auth(opts().await))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_half_duplex_unimplemented() {
    use weft_client::{CallOptions, Channel, ChannelOptions, Client};
    use weft_core::{ChannelCredentials, Code, Metadata, WeftError};
    use weft_interop::messages::{StreamingOutputCallRequest, StreamingOutputCallResponse};
    use weft_interop::service_descriptor;

    let opts = opts().await;
    let channel = Channel::connect(
        &format!("127.0.0.1:{}", opts.server_port),
        ChannelCredentials::insecure(),
        ChannelOptions::new(),
    )
    .await
    .unwrap();
    let client = Client::new(channel, service_descriptor()).unwrap();

    let (sender, mut receiver) = client
        .bidi_streaming::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "HalfDuplexCall",
            Metadata::new(),
            CallOptions::new(),
        )
        .await
        .unwrap();
    sender.close().await.unwrap();

    match receiver.message().await {
        Err(WeftError::Rpc(status)) => assert_eq!(status.code(), Code::Unimplemented),
        other => panic!("expected UNIMPLEMENTED, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_unknown_case_is_rejected() {
    let err = run_test_case("no_such_case", &opts().await)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown test case"));
}
