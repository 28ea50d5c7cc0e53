//! Client surface for weft RPC.
//!
//! Layers, bottom up:
//! - [`Call`]: one in-flight RPC — deadline, authority, per-call credentials,
//!   cancellation, parent propagation
//! - [`Batch`]: an atomic set of transport operations submitted against a call
//! - drivers ([`drivers`]): the four RPC shapes sequenced as batches
//! - [`Client`]: a typed factory bound to a service's method descriptors

pub mod batch;
pub mod call;
pub mod client;
pub mod drivers;

pub use batch::{Batch, BatchCompletion, BatchResult};
pub use call::{propagate, Call, CallOptions};
pub use client::{
    Channel, ChannelOptions, Client, ClientStream, MethodDescriptor, ServiceDescriptor,
    StreamSender, Streaming, UnaryResponse,
};
