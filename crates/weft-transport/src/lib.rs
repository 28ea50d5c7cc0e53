//! Transport layer for weft RPC.
//!
//! This crate moves the batch operation language over framed TCP:
//! - client side: [`Connection`] multiplexes calls onto one socket and
//!   demultiplexes HEADERS / MESSAGE / TRAILERS frames into per-call channels
//! - server side: [`serve_connection`] turns an accepted socket into a
//!   sequence of [`InboundCall`]s
//!
//! Deadlines are transport-driven: the client connection arms a timer per
//! call and synthesizes `DEADLINE_EXCEEDED` locally; drivers never run their
//! own timers.

pub mod client;
pub mod server;

pub use client::{CallControl, CallRecv, Connection};
pub use server::{serve_connection, InboundCall, Responder};
