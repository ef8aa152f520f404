//! IPC bridge between host, manager and worker processes.
//!
//! # Architecture
//!
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **channel**: duplex link from two one-directional pipes
//! - **protocol**: frame types and the control verbs/statuses
//! - **correlation**: request/reply matching by correlation id

pub mod channel;
pub mod codec;
pub mod correlation;
pub mod protocol;
