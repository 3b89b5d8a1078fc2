//! RPC transport: wire messages, the client seam, and two
//! implementations.
//!
//! - `http`: axum server + reqwest client for production
//! - `inmemory`: in-process network with partition control for tests

pub mod http;
pub mod inmemory;
pub mod traits;

pub use traits::{RaftClient, TransportError};
