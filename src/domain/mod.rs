//! Entities, value objects and the ports the application layer talks through.

pub mod events;
pub mod money;
pub mod notification;
pub mod ports;
pub mod status;
pub mod transaction;
pub mod wallet;
