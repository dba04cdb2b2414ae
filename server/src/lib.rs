//! Delta firmware update service: firmware registry, patch generation,
//! chunked patch delivery and per-device rollout tracking behind an HTTP API.

pub mod api;
pub mod auth;
pub mod chunks;
pub mod config;
pub mod coordinator;
pub mod generator;
pub mod patches;
pub mod registry;
pub mod store;

pub use api::{configure, State};
pub use config::ServerConfig;
