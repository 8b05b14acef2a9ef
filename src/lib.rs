// Public API for integration tests and potential library usage

pub mod api;
pub mod auth;
pub mod blocklist;
pub mod config;
pub mod heartbeat;
pub mod llm;
pub mod protocol;
pub mod state;
pub mod telemetry;
pub mod types;
pub mod ws;
