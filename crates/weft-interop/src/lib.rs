//! Reference test service and interop harness for weft RPC.
//!
//! The service implements the interop protocol (empty call, sized unary
//! payloads, aggregation, output streaming, full duplex, metadata echo); the
//! harness runs the named test cases against it.

pub mod harness;
pub mod messages;
pub mod service;

pub use harness::{run_test_case, HarnessError, InteropOptions};
pub use service::{service_descriptor, test_server};
