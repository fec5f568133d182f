//! State machine module.

pub mod machine;

pub use machine::{CloseReason, SessionContext, SessionState};
