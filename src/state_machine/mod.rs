//! State machine abstraction the replication group drives.

pub mod traits;

pub use traits::{AppliedLog, StateMachine, TestStateMachine};
