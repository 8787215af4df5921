pub mod artifacts;
pub mod config;
pub mod diff;
pub mod errors;
pub mod gates;
pub mod llm;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod telemetry;
pub mod tools;
pub mod ui;
pub mod validate;
