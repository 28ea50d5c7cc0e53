//! The reference test service.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use prost::Message;
use rand::RngCore;
use weft_client::ServiceDescriptor;
use weft_core::{Metadata, Status};
use weft_server::{Inbound, Outbound, Reply, Request, Server};

use crate::messages::{
    Empty, Payload, PayloadType, ResponseParameters, SimpleRequest, SimpleResponse,
    StreamingInputCallRequest, StreamingInputCallResponse, StreamingOutputCallRequest,
    StreamingOutputCallResponse,
};

pub const SERVICE_NAME: &str = "grpc.testing.TestService";

/// Initial-metadata key echoed back in initial response metadata.
pub const ECHO_INITIAL_KEY: &str = "x-grpc-test-echo-initial";
/// Binary metadata key echoed back in trailing metadata.
pub const ECHO_TRAILING_KEY: &str = "x-grpc-test-echo-trailing-bin";

/// Metadata keys the auth test cases use to carry the authenticated identity
/// alongside the authorization entry. Token introspection is an external
/// concern; the service trusts these entries when asked to fill identity.
pub const IDENTITY_KEY: &str = "x-weft-test-identity";
pub const SCOPE_KEY: &str = "x-weft-test-scope";

/// Client-side descriptor map for the test service.
pub fn service_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new(SERVICE_NAME)
        .method("EmptyCall", false, false)
        .method("UnaryCall", false, false)
        .method("StreamingInputCall", true, false)
        .method("StreamingOutputCall", false, true)
        .method("FullDuplexCall", true, true)
        .method("HalfDuplexCall", true, true)
}

/// The interop server. HalfDuplexCall is left unregistered and therefore
/// reports UNIMPLEMENTED.
pub fn test_server() -> Server {
    Server::builder()
        .register_unary(format!("{SERVICE_NAME}/EmptyCall"), empty_call)
        .register_unary(format!("{SERVICE_NAME}/UnaryCall"), unary_call)
        .register_client_streaming(
            format!("{SERVICE_NAME}/StreamingInputCall"),
            streaming_input_call,
        )
        .register_server_streaming(
            format!("{SERVICE_NAME}/StreamingOutputCall"),
            streaming_output_call,
        )
        .register_duplex(format!("{SERVICE_NAME}/FullDuplexCall"), full_duplex_call)
        .build()
}

/// The echo convention: `x-grpc-test-echo-initial` is reflected into initial
/// response metadata, `x-grpc-test-echo-trailing-bin` into trailing
/// metadata.
fn echo_metadata(request: &Metadata) -> Result<(Metadata, Metadata), Status> {
    let mut initial = Metadata::new();
    let mut trailing = Metadata::new();
    if let Some(value) = request.first(ECHO_INITIAL_KEY) {
        initial
            .set(ECHO_INITIAL_KEY, value.clone())
            .map_err(|e| Status::internal(e.to_string()))?;
    }
    if let Some(value) = request.first(ECHO_TRAILING_KEY) {
        trailing
            .set(ECHO_TRAILING_KEY, value.clone())
            .map_err(|e| Status::internal(e.to_string()))?;
    }
    Ok((initial, trailing))
}

fn decode_error(e: prost::DecodeError) -> Status {
    Status::internal(format!("failed to decode request: {}", e))
}

fn make_payload(requested_type: i32, size: i32) -> Result<Payload, Status> {
    if size < 0 {
        return Err(Status::new(
            weft_core::Code::InvalidArgument,
            format!("response size must not be negative, got {}", size),
        ));
    }
    let requested = PayloadType::try_from(requested_type)
        .map_err(|_| Status::new(weft_core::Code::InvalidArgument, "unknown payload type"))?;
    let resolved = match requested {
        PayloadType::Compressable | PayloadType::Uncompressable => requested,
        // RANDOM: coin flip between the two concrete formats.
        PayloadType::Random => {
            if rand::random::<bool>() {
                PayloadType::Compressable
            } else {
                PayloadType::Uncompressable
            }
        }
    };
    let mut body = vec![0u8; size as usize];
    if resolved == PayloadType::Uncompressable {
        rand::thread_rng().fill_bytes(&mut body);
    }
    Ok(Payload {
        r#type: resolved as i32,
        body,
    })
}

fn encode<M: Message>(message: &M) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

async fn empty_call(request: Request<Bytes>) -> Result<Reply<Bytes>, Status> {
    Empty::decode(request.message).map_err(decode_error)?;
    let (initial, trailing) = echo_metadata(&request.metadata)?;
    Ok(Reply::new(encode(&Empty {}))
        .with_initial_metadata(initial)
        .with_trailing_metadata(trailing))
}

async fn unary_call(request: Request<Bytes>) -> Result<Reply<Bytes>, Status> {
    let simple = SimpleRequest::decode(request.message).map_err(decode_error)?;
    let (initial, trailing) = echo_metadata(&request.metadata)?;

    let identity = |key: &str| {
        request
            .metadata
            .first(key)
            .and_then(|v| v.as_text())
            .unwrap_or_default()
            .to_string()
    };
    let response = SimpleResponse {
        payload: Some(make_payload(simple.response_type, simple.response_size)?),
        username: if simple.fill_username {
            identity(IDENTITY_KEY)
        } else {
            String::new()
        },
        oauth_scope: if simple.fill_oauth_scope {
            identity(SCOPE_KEY)
        } else {
            String::new()
        },
    };

    Ok(Reply::new(encode(&response))
        .with_initial_metadata(initial)
        .with_trailing_metadata(trailing))
}

async fn streaming_input_call(request: Request<Inbound>) -> Result<Reply<Bytes>, Status> {
    let (initial, trailing) = echo_metadata(&request.metadata)?;
    let mut inbound = request.message;

    let mut aggregated: i32 = 0;
    while let Some(bytes) = inbound.next().await {
        let message = StreamingInputCallRequest::decode(bytes).map_err(decode_error)?;
        if let Some(payload) = message.payload {
            aggregated += payload.body.len() as i32;
        }
    }

    let response = StreamingInputCallResponse {
        aggregated_payload_size: aggregated,
    };
    Ok(Reply::new(encode(&response))
        .with_initial_metadata(initial)
        .with_trailing_metadata(trailing))
}

async fn streaming_output_call(request: Request<Bytes>) -> Result<Reply<Outbound>, Status> {
    let message = StreamingOutputCallRequest::decode(request.message).map_err(decode_error)?;
    let (initial, trailing) = echo_metadata(&request.metadata)?;

    let response_type = message.response_type;
    let body: Outbound = Box::pin(
        futures_util::stream::iter(message.response_parameters).then(
            move |param: ResponseParameters| async move {
                if param.interval_us > 0 {
                    tokio::time::sleep(Duration::from_micros(param.interval_us as u64)).await;
                }
                let payload = make_payload(response_type, param.size)?;
                Ok(encode(&StreamingOutputCallResponse {
                    payload: Some(payload),
                }))
            },
        ),
    );

    Ok(Reply::new(body)
        .with_initial_metadata(initial)
        .with_trailing_metadata(trailing))
}

async fn full_duplex_call(request: Request<Inbound>) -> Result<Reply<Outbound>, Status> {
    let (initial, trailing) = echo_metadata(&request.metadata)?;
    let inbound = request.message;

    // One response per response_parameters entry of each inbound request;
    // output closes when input closes.
    let pending: VecDeque<(i32, ResponseParameters)> = VecDeque::new();
    let body: Outbound = Box::pin(futures_util::stream::unfold(
        (inbound, pending),
        |(mut inbound, mut pending)| async move {
            loop {
                if let Some((response_type, param)) = pending.pop_front() {
                    if param.interval_us > 0 {
                        tokio::time::sleep(Duration::from_micros(param.interval_us as u64)).await;
                    }
                    let item = make_payload(response_type, param.size).map(|payload| {
                        encode(&StreamingOutputCallResponse {
                            payload: Some(payload),
                        })
                    });
                    return Some((item, (inbound, pending)));
                }
                match inbound.next().await {
                    Some(bytes) => match StreamingOutputCallRequest::decode(bytes) {
                        Ok(message) => {
                            let response_type = message.response_type;
                            for param in message.response_parameters {
                                pending.push_back((response_type, param));
                            }
                        }
                        Err(e) => return Some((Err(decode_error(e)), (inbound, pending))),
                    },
                    None => return None,
                }
            }
        },
    ));

    Ok(Reply::new(body)
        .with_initial_metadata(initial)
        .with_trailing_metadata(trailing))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_payload_sizes() {
        let payload = make_payload(PayloadType::Compressable as i32, 314159).unwrap();
        assert_eq!(payload.body.len(), 314159);
        assert_eq!(payload.r#type, PayloadType::Compressable as i32);
        assert!(payload.body.iter().all(|b| *b == 0));

        assert!(make_payload(PayloadType::Compressable as i32, -1).is_err());
    }

    #[test]
    fn test_make_payload_random_resolves() {
        let payload = make_payload(PayloadType::Random as i32, 8).unwrap();
        assert_ne!(payload.r#type, PayloadType::Random as i32);
    }

    #[test]
    fn test_echo_metadata() {
        let mut request = Metadata::new();
        request.add(ECHO_INITIAL_KEY, "hello").unwrap();
        request
            .add(ECHO_TRAILING_KEY, vec![0xab_u8, 0xab, 0xab])
            .unwrap();
        request.add("x-unrelated", "ignored").unwrap();

        let (initial, trailing) = echo_metadata(&request).unwrap();
        assert_eq!(
            initial.first(ECHO_INITIAL_KEY).unwrap().as_text(),
            Some("hello")
        );
        assert_eq!(initial.len(), 1);
        assert_eq!(
            trailing.first(ECHO_TRAILING_KEY).unwrap().as_bytes(),
            &[0xab, 0xab, 0xab]
        );
        assert_eq!(trailing.len(), 1);
    }
}
