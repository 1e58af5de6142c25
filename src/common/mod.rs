//! Common types and abstractions
//!
//! This module defines the building blocks shared across the server:
//! - Address: destination address parsed from the client stream
//! - MeteredStream: per-direction byte accounting decorator
//! - relay: bidirectional copy between client and target

mod address;
pub mod relay;
mod stream;

pub use address::Address;
pub use relay::relay;
pub use stream::MeteredStream;

// Re-export error types from crate root
pub use crate::error::{Error, Result};
