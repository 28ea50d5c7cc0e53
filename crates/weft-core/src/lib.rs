//! Core types and utilities for the weft RPC layer.
//!
//! This crate provides the foundation types used across all weft components:
//! - Metadata (ordered multimap of text/binary header entries)
//! - Status codes and the remote-status error model
//! - Channel and call credentials, with the composition algebra
//! - Wire framing for the batch operation language

pub mod credentials;
pub mod error;
pub mod metadata;
pub mod status;
pub mod wire;

pub use credentials::{CallCredentials, ChannelCredentials, Identity, TokenSource};
pub use error::WeftError;
pub use metadata::{Metadata, MetadataValue};
pub use status::{Code, Status};
pub use wire::{Frame, FrameKind, FrameParser, RequestHead, Trailers, MAX_FRAME_SIZE};
