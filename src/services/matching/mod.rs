//! Order matching and settlement.
//!
//! Everything here runs inside serializable database transactions; the
//! database's isolation is the engine's concurrency control.

pub mod engine;
pub mod types;

pub use engine::MatchingEngine;
pub use types::{AmendRequest, PlaceOrderRequest};
