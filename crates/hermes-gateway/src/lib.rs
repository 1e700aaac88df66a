/*!
 * Hermes Gateway
 *
 * This crate provides the client-facing core of the Hermes gateway: command
 * validation and relaying, recursive device discovery, and the bridge that
 * forwards binary telemetry streams from devices to clients.
 */

#![warn(missing_docs)]

// Re-export core types
pub use hermes_core::prelude;

pub mod builder;
pub mod discovery;
pub mod error;
pub mod session;
pub mod stream;
pub mod validator;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use builder::{build_request, device_url, OutboundRequest, Scheme};
pub use discovery::{CrawlEvent, CrawlHandle, CrawlOutcome, CrawlTrigger, Crawler, Entity};
pub use error::{CommandError, Error, Result};
pub use session::CommandSession;
pub use stream::{
    negotiate, spawn_bridge, BridgeExit, BridgeReport, BridgeStats, StreamConsumer, StreamHandle,
    StreamSession,
};
pub use validator::{Command, Resolved, ValidatedCommand, Validator};

/// Hermes gateway crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the gateway
pub fn init() -> Result<()> {
    tracing::info!("Hermes Gateway {} initialized", VERSION);
    Ok(())
}
