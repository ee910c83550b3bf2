//! Sync engine: registrar, pull/push engines, event channel, orchestrator.

pub mod events;
pub mod http;
pub mod pull;
pub mod push;
pub mod registry;
pub mod service;
pub mod transport;
