//! Interop protocol messages, declared with prost derives.

/// The type of payload that should be returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PayloadType {
    /// Compressable text format.
    Compressable = 0,
    /// Uncompressable binary format.
    Uncompressable = 1,
    /// Randomly chosen from all other formats.
    Random = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

/// A block of bytes, to simulate stream payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Payload {
    #[prost(enumeration = "PayloadType", tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub body: Vec<u8>,
}

/// Unary request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SimpleRequest {
    /// Desired payload type in the response from the server.
    #[prost(enumeration = "PayloadType", tag = "1")]
    pub response_type: i32,
    /// Desired payload size in the response from the server.
    #[prost(int32, tag = "2")]
    pub response_size: i32,
    #[prost(message, optional, tag = "3")]
    pub payload: Option<Payload>,
    /// Whether the server should fill username in the response.
    #[prost(bool, tag = "4")]
    pub fill_username: bool,
    /// Whether the server should fill oauth scope in the response.
    #[prost(bool, tag = "5")]
    pub fill_oauth_scope: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SimpleResponse {
    #[prost(message, optional, tag = "1")]
    pub payload: Option<Payload>,
    /// The user the request came from, for verifying authentication was
    /// successful.
    #[prost(string, tag = "2")]
    pub username: String,
    #[prost(string, tag = "3")]
    pub oauth_scope: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingInputCallRequest {
    #[prost(message, optional, tag = "1")]
    pub payload: Option<Payload>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingInputCallResponse {
    /// Aggregated size of payloads received from the client.
    #[prost(int32, tag = "1")]
    pub aggregated_payload_size: i32,
}

/// Configuration for a particular response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseParameters {
    /// Desired payload size in the response.
    #[prost(int32, tag = "1")]
    pub size: i32,
    /// Desired interval between consecutive responses, in microseconds.
    #[prost(int32, tag = "2")]
    pub interval_us: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingOutputCallRequest {
    #[prost(enumeration = "PayloadType", tag = "1")]
    pub response_type: i32,
    #[prost(message, repeated, tag = "2")]
    pub response_parameters: Vec<ResponseParameters>,
    #[prost(message, optional, tag = "3")]
    pub payload: Option<Payload>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingOutputCallResponse {
    #[prost(message, optional, tag = "1")]
    pub payload: Option<Payload>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_simple_request_roundtrip() {
        let request = SimpleRequest {
            response_type: PayloadType::Compressable as i32,
            response_size: 314159,
            payload: Some(Payload {
                r#type: PayloadType::Compressable as i32,
                body: vec![0; 64],
            }),
            fill_username: true,
            fill_oauth_scope: false,
        };

        let decoded = SimpleRequest::decode(request.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.payload.unwrap().body.len(), 64);
    }

    #[test]
    fn test_payload_type_values() {
        assert_eq!(PayloadType::try_from(0), Ok(PayloadType::Compressable));
        assert_eq!(PayloadType::try_from(1), Ok(PayloadType::Uncompressable));
        assert_eq!(PayloadType::try_from(2), Ok(PayloadType::Random));
        assert!(PayloadType::try_from(3).is_err());
    }
}
