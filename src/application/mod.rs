//! Application layer: the settlement use cases and the workers that drive them.
//!
//! [`runtime::SettlementEngine`] wires everything together over the domain ports
//! and owns the background tasks (token retry, recovery relay, expiration
//! listener and reconciliation scheduler).

pub mod cancellation;
pub mod checkout;
pub mod distribution;
pub mod reconciliation;
pub mod resilience;
pub mod retry;
pub mod runtime;
pub mod scheduler;
