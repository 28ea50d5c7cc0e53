//! Server surface for weft RPC.
//!
//! Handlers come in the four RPC shapes and are registered on a
//! [`ServerBuilder`] by method path. Each accepted connection is served on
//! its own task; each call runs its handler under the call's deadline and
//! cancellation watch.

pub mod router;
pub mod server;
pub mod service;

pub use router::Router;
pub use server::{BoundServer, Server, ServerBuilder};
pub use service::{Inbound, Outbound, Reply, Request};
