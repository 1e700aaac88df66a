/*!
 * Hermes Devices
 *
 * This crate provides the device-facing layer of the Hermes gateway: the
 * JSON command protocol and its binary telemetry frames, the directory of
 * known devices, and the HTTP relay used to reach device command endpoints.
 */

#![warn(missing_docs)]

// Re-export core types
pub use hermes_core::prelude;

pub mod directory;
pub mod frame;
pub mod protocol;
pub mod relay;

pub use directory::{
    DeviceRecord, Directory, DirectoryError, DirectoryEvent, InMemoryDirectory, ParameterRecord,
    PeripheralRecord, SharedDirectory,
};
pub use frame::{FrameField, FrameLayout, FRAME_DELIMITER};
pub use protocol::{
    decode_response, decode_response_str, error_response, CodecError, CommandKind, DataType,
    DeviceRequest, ErrorCode, Methods, Response, ResponseKind, StreamRate,
};
pub use relay::{HttpRelay, Relay, RelayError, SharedRelay};

/// Hermes devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device layer
pub fn init() -> Result<(), hermes_core::error::Error> {
    tracing::info!("Hermes Devices {} initialized", VERSION);
    Ok(())
}
