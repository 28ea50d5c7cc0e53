//! Named interop test cases.

use bytes::Bytes;
use tokio::time::{Duration, Instant};
use tracing::info;
use weft_client::{CallOptions, Channel, ChannelOptions, Client, Streaming, UnaryResponse};
use weft_core::{CallCredentials, ChannelCredentials, Code, Metadata, Status, WeftError};

use crate::messages::{
    Empty, Payload, PayloadType, ResponseParameters, SimpleRequest, SimpleResponse,
    StreamingInputCallRequest, StreamingInputCallResponse, StreamingOutputCallRequest,
    StreamingOutputCallResponse,
};
use crate::service::{
    service_descriptor, ECHO_INITIAL_KEY, ECHO_TRAILING_KEY, IDENTITY_KEY, SCOPE_KEY,
};

const LARGE_REQUEST_SIZE: i32 = 271828;
const LARGE_RESPONSE_SIZE: i32 = 314159;
const CLIENT_STREAM_SIZES: [i32; 4] = [27182, 8, 1828, 45904];
const SERVER_STREAM_SIZES: [i32; 4] = [31415, 9, 2653, 58979];

const ECHO_INITIAL_VALUE: &str = "test_initial_metadata_value";
const ECHO_TRAILING_VALUE: [u8; 3] = [0xab, 0xab, 0xab];

/// Root certificate the interop suite pins with `--use_test_ca`. Carried
/// opaquely; session establishment belongs to the transport core.
const TEST_CA: &[u8] = b"-----BEGIN CERTIFICATE-----
weft interop test root certificate placeholder
-----END CERTIFICATE-----
";

/// Per-run options mirroring the interop client's CLI flags.
#[derive(Debug, Clone, Default)]
pub struct InteropOptions {
    pub server_host: String,
    pub server_port: u16,
    pub server_host_override: Option<String>,
    pub use_tls: bool,
    pub use_test_ca: bool,
    /// Bearer token for the auth cases. Token acquisition is external.
    pub oauth_access_token: Option<String>,
    /// Expected authenticated identity (service account email).
    pub default_service_account: Option<String>,
    pub oauth_scope: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error(transparent)]
    Rpc(#[from] WeftError),

    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("unknown test case: {0}")]
    UnknownCase(String),
}

fn check(condition: bool, what: impl Into<String>) -> Result<(), HarnessError> {
    if condition {
        Ok(())
    } else {
        Err(HarnessError::Assertion(what.into()))
    }
}

fn error_code(error: &WeftError) -> Option<Code> {
    error.status().map(Status::code)
}

/// Run one named test case to completion.
pub async fn run_test_case(case: &str, opts: &InteropOptions) -> Result<(), HarnessError> {
    info!(case, "running interop test case");
    match case {
        "empty_unary" => empty_unary(opts).await,
        "large_unary" => {
            large_unary(&build_client(opts, false).await?, CallOptions::new(), false).await?;
            Ok(())
        }
        "client_streaming" => client_streaming(opts).await,
        "server_streaming" => server_streaming(opts).await,
        "ping_pong" => ping_pong(opts).await,
        "empty_stream" => empty_stream(opts).await,
        "cancel_after_begin" => cancel_after_begin(opts).await,
        "cancel_after_first_response" => cancel_after_first_response(opts).await,
        "timeout_on_sleeping_server" => timeout_on_sleeping_server(opts).await,
        "custom_metadata" => custom_metadata(opts).await,
        "compute_engine_creds" | "service_account_creds" | "jwt_token_creds"
        | "oauth2_auth_token" => channel_auth(opts).await,
        "per_rpc_creds" => per_rpc_creds(opts).await,
        other => Err(HarnessError::UnknownCase(other.to_string())),
    }
}

fn channel_credentials(opts: &InteropOptions) -> ChannelCredentials {
    if opts.use_tls {
        let roots = opts.use_test_ca.then(|| Bytes::from_static(TEST_CA));
        ChannelCredentials::ssl(roots, None)
    } else {
        ChannelCredentials::insecure()
    }
}

/// Call credentials for the auth cases: the bearer token plus the identity
/// entries the test service echoes back when asked to fill username/scope.
fn auth_call_credentials(opts: &InteropOptions) -> Result<CallCredentials, HarnessError> {
    let token = opts.oauth_access_token.clone().ok_or_else(|| {
        WeftError::invalid_argument("an access token is required for auth test cases")
    })?;
    let mut credentials = CallCredentials::from_access_token(token);

    if let Some(account) = opts.default_service_account.clone() {
        credentials = credentials.compose(CallCredentials::from_generator(move |_authority| {
            let account = account.clone();
            async move {
                let mut metadata = Metadata::new();
                metadata
                    .add(IDENTITY_KEY, account)
                    .map_err(|e| Status::internal(e.to_string()))?;
                Ok(metadata)
            }
        }));
    }
    if let Some(scope) = opts.oauth_scope.clone() {
        credentials = credentials.compose(CallCredentials::from_generator(move |_authority| {
            let scope = scope.clone();
            async move {
                let mut metadata = Metadata::new();
                metadata
                    .add(SCOPE_KEY, scope)
                    .map_err(|e| Status::internal(e.to_string()))?;
                Ok(metadata)
            }
        }));
    }
    Ok(credentials)
}

async fn build_client(opts: &InteropOptions, with_auth: bool) -> Result<Client, HarnessError> {
    let mut credentials = channel_credentials(opts);
    if with_auth {
        credentials = credentials.compose(auth_call_credentials(opts)?)?;
    }

    let mut options = ChannelOptions::new();
    if let Some(authority) = &opts.server_host_override {
        options = options.ssl_target_name_override(authority.clone());
    }

    let target = format!("{}:{}", opts.server_host, opts.server_port);
    let channel = Channel::connect(&target, credentials, options).await?;
    Ok(Client::new(channel, service_descriptor())?)
}

fn zeros(size: i32) -> Payload {
    Payload {
        r#type: PayloadType::Compressable as i32,
        body: vec![0; size as usize],
    }
}

fn large_request(fill_identity: bool) -> SimpleRequest {
    SimpleRequest {
        response_type: PayloadType::Compressable as i32,
        response_size: LARGE_RESPONSE_SIZE,
        payload: Some(zeros(LARGE_REQUEST_SIZE)),
        fill_username: fill_identity,
        fill_oauth_scope: fill_identity,
    }
}

fn check_large_response(response: &SimpleResponse) -> Result<(), HarnessError> {
    let payload = response
        .payload
        .as_ref()
        .ok_or_else(|| HarnessError::Assertion("response payload missing".into()))?;
    check(
        payload.r#type == PayloadType::Compressable as i32,
        "response payload type is not COMPRESSABLE",
    )?;
    check(
        payload.body.len() == LARGE_RESPONSE_SIZE as usize,
        format!(
            "response body length {} != {}",
            payload.body.len(),
            LARGE_RESPONSE_SIZE
        ),
    )
}

async fn large_unary(
    client: &Client,
    options: CallOptions,
    fill_identity: bool,
) -> Result<UnaryResponse<SimpleResponse>, HarnessError> {
    let response: UnaryResponse<SimpleResponse> = client
        .unary(
            "UnaryCall",
            &large_request(fill_identity),
            Metadata::new(),
            options,
        )
        .await?;
    check_large_response(&response.message)?;
    Ok(response)
}

async fn empty_unary(opts: &InteropOptions) -> Result<(), HarnessError> {
    let client = build_client(opts, false).await?;
    let response: UnaryResponse<Empty> = client
        .unary("EmptyCall", &Empty {}, Metadata::new(), CallOptions::new())
        .await?;
    check(response.message == Empty {}, "response is not Empty")
}

async fn client_streaming(opts: &InteropOptions) -> Result<(), HarnessError> {
    let client = build_client(opts, false).await?;
    let stream = client
        .client_streaming::<StreamingInputCallRequest, StreamingInputCallResponse>(
            "StreamingInputCall",
            Metadata::new(),
            CallOptions::new(),
        )
        .await?;

    for size in CLIENT_STREAM_SIZES {
        stream
            .send(&StreamingInputCallRequest {
                payload: Some(zeros(size)),
            })
            .await?;
    }

    let response = stream.finish().await?;
    let expected: i32 = CLIENT_STREAM_SIZES.iter().sum();
    check(
        response.message.aggregated_payload_size == expected,
        format!(
            "aggregated {} != {}",
            response.message.aggregated_payload_size, expected
        ),
    )
}

async fn collect_stream(
    stream: &mut Streaming<StreamingOutputCallResponse>,
) -> Result<Vec<StreamingOutputCallResponse>, HarnessError> {
    let mut responses = Vec::new();
    while let Some(response) = stream.message().await? {
        responses.push(response);
    }
    Ok(responses)
}

async fn server_streaming(opts: &InteropOptions) -> Result<(), HarnessError> {
    let client = build_client(opts, false).await?;
    let request = StreamingOutputCallRequest {
        response_type: PayloadType::Compressable as i32,
        response_parameters: SERVER_STREAM_SIZES
            .iter()
            .map(|size| ResponseParameters {
                size: *size,
                interval_us: 0,
            })
            .collect(),
        payload: None,
    };

    let mut stream = client
        .server_streaming("StreamingOutputCall", &request, Metadata::new(), CallOptions::new())
        .await?;
    let responses = collect_stream(&mut stream).await?;

    check(
        responses.len() == SERVER_STREAM_SIZES.len(),
        format!(
            "received {} responses, expected {}",
            responses.len(),
            SERVER_STREAM_SIZES.len()
        ),
    )?;
    for (response, expected) in responses.iter().zip(SERVER_STREAM_SIZES) {
        let body_len = response.payload.as_ref().map(|p| p.body.len()).unwrap_or(0);
        check(
            body_len == expected as usize,
            format!("response body length {} != {}", body_len, expected),
        )?;
    }
    Ok(())
}

fn ping_pong_request(request_size: i32, response_size: i32) -> StreamingOutputCallRequest {
    StreamingOutputCallRequest {
        response_type: PayloadType::Compressable as i32,
        response_parameters: vec![ResponseParameters {
            size: response_size,
            interval_us: 0,
        }],
        payload: Some(zeros(request_size)),
    }
}

async fn ping_pong(opts: &InteropOptions) -> Result<(), HarnessError> {
    let client = build_client(opts, false).await?;
    let (sender, mut receiver) = client
        .bidi_streaming::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            Metadata::new(),
            CallOptions::new(),
        )
        .await?;

    for (request_size, response_size) in CLIENT_STREAM_SIZES.iter().zip(SERVER_STREAM_SIZES) {
        sender
            .send(&ping_pong_request(*request_size, response_size))
            .await?;
        let response = receiver
            .message()
            .await?
            .ok_or_else(|| HarnessError::Assertion("stream ended mid round-trip".into()))?;
        let body_len = response.payload.as_ref().map(|p| p.body.len()).unwrap_or(0);
        check(
            body_len == response_size as usize,
            format!("round-trip body length {} != {}", body_len, response_size),
        )?;
    }

    sender.close().await?;
    check(
        receiver.message().await?.is_none(),
        "responses after close",
    )?;
    check(
        receiver
            .trailing_status()
            .map(|s| s.is_ok())
            .unwrap_or(false),
        "terminal status is not OK",
    )
}

async fn empty_stream(opts: &InteropOptions) -> Result<(), HarnessError> {
    let client = build_client(opts, false).await?;
    let (sender, mut receiver) = client
        .bidi_streaming::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            Metadata::new(),
            CallOptions::new(),
        )
        .await?;

    sender.close().await?;
    check(receiver.message().await?.is_none(), "unexpected data frame")
}

async fn cancel_after_begin(opts: &InteropOptions) -> Result<(), HarnessError> {
    let client = build_client(opts, false).await?;
    let stream = client
        .client_streaming::<StreamingInputCallRequest, StreamingInputCallResponse>(
            "StreamingInputCall",
            Metadata::new(),
            CallOptions::new(),
        )
        .await?;

    stream.call().cancel();
    match stream.finish().await {
        Ok(_) => Err(HarnessError::Assertion("call succeeded after cancel".into())),
        Err(e) => check(
            error_code(&e) == Some(Code::Cancelled),
            format!("expected CANCELLED, got {}", e),
        ),
    }
}

async fn cancel_after_first_response(opts: &InteropOptions) -> Result<(), HarnessError> {
    let client = build_client(opts, false).await?;
    let (sender, mut receiver) = client
        .bidi_streaming::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            Metadata::new(),
            CallOptions::new(),
        )
        .await?;

    sender
        .send(&ping_pong_request(CLIENT_STREAM_SIZES[0], SERVER_STREAM_SIZES[0]))
        .await?;
    check(
        receiver.message().await?.is_some(),
        "no first response before cancel",
    )?;

    receiver.call().cancel();
    match receiver.message().await {
        Ok(None) => Err(HarnessError::Assertion(
            "stream ended cleanly after cancel".into(),
        )),
        Ok(Some(_)) => Err(HarnessError::Assertion("data event after cancel".into())),
        Err(e) => check(
            error_code(&e) == Some(Code::Cancelled),
            format!("expected CANCELLED, got {}", e),
        ),
    }
}

async fn timeout_on_sleeping_server(opts: &InteropOptions) -> Result<(), HarnessError> {
    let client = build_client(opts, false).await?;
    let options = CallOptions::new().deadline(Instant::now() + Duration::from_millis(1));
    let opened = client
        .bidi_streaming::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            Metadata::new(),
            options,
        )
        .await;
    let (sender, mut receiver) = match opened {
        Ok(pair) => pair,
        // The deadline may beat the open batch itself.
        Err(e) => return check_deadline_error(&e),
    };

    // No response parameters: the server waits on further input, so only the
    // deadline can end the call. The write may race the expiry and be
    // dropped; that is fine.
    let _ = sender
        .send(&StreamingOutputCallRequest {
            response_type: PayloadType::Compressable as i32,
            response_parameters: vec![],
            payload: Some(zeros(CLIENT_STREAM_SIZES[0])),
        })
        .await;

    match receiver.message().await {
        Ok(_) => Err(HarnessError::Assertion("call survived its deadline".into())),
        Err(e) => check_deadline_error(&e),
    }
}

/// Near-deadline races may surface INTERNAL instead of DEADLINE_EXCEEDED.
fn check_deadline_error(error: &WeftError) -> Result<(), HarnessError> {
    let code = error_code(error);
    check(
        code == Some(Code::DeadlineExceeded) || code == Some(Code::Internal),
        format!("expected DEADLINE_EXCEEDED or INTERNAL, got {}", error),
    )
}

fn echo_request_metadata() -> Result<Metadata, HarnessError> {
    let mut metadata = Metadata::new();
    metadata.add(ECHO_INITIAL_KEY, ECHO_INITIAL_VALUE)?;
    metadata.add(ECHO_TRAILING_KEY, ECHO_TRAILING_VALUE.to_vec())?;
    Ok(metadata)
}

fn check_initial_echo(metadata: &Metadata) -> Result<(), HarnessError> {
    check(
        metadata.first(ECHO_INITIAL_KEY).and_then(|v| v.as_text())
            == Some(ECHO_INITIAL_VALUE),
        "initial metadata echo mismatch",
    )
}

fn check_trailing_echo(metadata: &Metadata) -> Result<(), HarnessError> {
    check(
        metadata.first(ECHO_TRAILING_KEY).map(|v| v.as_bytes())
            == Some(&ECHO_TRAILING_VALUE[..]),
        "trailing metadata echo mismatch",
    )
}

/// The 5-way echo assertion: unary payload plus initial/trailing echoes on
/// both the unary and the duplex path.
async fn custom_metadata(opts: &InteropOptions) -> Result<(), HarnessError> {
    let client = build_client(opts, false).await?;

    let response: UnaryResponse<SimpleResponse> = client
        .unary(
            "UnaryCall",
            &large_request(false),
            echo_request_metadata()?,
            CallOptions::new(),
        )
        .await?;
    check_large_response(&response.message)?;
    check_initial_echo(&response.initial_metadata)?;
    check_trailing_echo(&response.trailing_metadata)?;

    let (sender, mut receiver) = client
        .bidi_streaming::<StreamingOutputCallRequest, StreamingOutputCallResponse>(
            "FullDuplexCall",
            echo_request_metadata()?,
            CallOptions::new(),
        )
        .await?;
    sender
        .send(&ping_pong_request(CLIENT_STREAM_SIZES[0], SERVER_STREAM_SIZES[0]))
        .await?;
    check(
        receiver
            .message()
            .await?
            .map(|r: StreamingOutputCallResponse| r.payload.is_some())
            .unwrap_or(false),
        "no duplex response",
    )?;
    let initial = receiver
        .initial_metadata()
        .await
        .ok_or_else(|| HarnessError::Assertion("no initial metadata on duplex call".into()))?;
    check_initial_echo(&initial)?;

    sender.close().await?;
    check(receiver.message().await?.is_none(), "responses after close")?;
    let trailing = receiver
        .trailing_metadata()
        .ok_or_else(|| HarnessError::Assertion("no trailing metadata on duplex call".into()))?;
    check_trailing_echo(trailing)
}

fn check_identity(
    opts: &InteropOptions,
    response: &SimpleResponse,
) -> Result<(), HarnessError> {
    let expected = opts
        .default_service_account
        .clone()
        .ok_or_else(|| WeftError::invalid_argument("a service account is required"))?;
    check(
        response.username == expected,
        format!("username {:?} != {:?}", response.username, expected),
    )?;
    if let Some(scope) = &opts.oauth_scope {
        check(
            !response.oauth_scope.is_empty() && scope.contains(&response.oauth_scope),
            format!("oauth scope {:?} not within {:?}", response.oauth_scope, scope),
        )?;
    }
    Ok(())
}

/// Auth via channel-composed call credentials.
async fn channel_auth(opts: &InteropOptions) -> Result<(), HarnessError> {
    let client = build_client(opts, true).await?;
    let response = large_unary(&client, CallOptions::new(), true).await?;
    check_identity(opts, &response.message)
}

/// Auth via a per-call credential override.
async fn per_rpc_creds(opts: &InteropOptions) -> Result<(), HarnessError> {
    let client = build_client(opts, false).await?;
    let options = CallOptions::new().credentials(auth_call_credentials(opts)?);
    let response = large_unary(&client, options, true).await?;
    check_identity(opts, &response.message)
}
