/*!
 * Prelude module for Hermes Core.
 *
 * This module re-exports commonly used types and functions from the Hermes Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{DataValue, DeviceId, ParameterId, PeripheralId, SessionId};

// Re-export config types
pub use crate::config::{
    Config, ConfigBuilder, DiscoveryConfig, LoggingConfig, RelayConfig, SharedConfig,
    StreamConfig,
};

// Re-export utility functions
pub use crate::utils::{duration_to_millis, millis_to_duration, spawn_and_log, with_timeout};

// Re-export logging helpers
pub use crate::logging::{operation_span, session_span};
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
