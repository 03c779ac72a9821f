//! Domain types and the storage ports consumed by the application layer.

pub mod account;
pub mod context;
pub mod ports;
pub mod progress;
