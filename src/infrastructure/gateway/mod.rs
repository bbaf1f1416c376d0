//! Payment gateway adapters.

pub mod sandbox;
pub mod snap;
