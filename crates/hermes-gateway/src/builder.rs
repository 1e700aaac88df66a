/*!
 * Outbound request construction.
 *
 * Turns a [`ValidatedCommand`] into the device-protocol body and the URL it
 * must be sent to. Pure functions only; nothing here touches the network or
 * the directory.
 */
use std::fmt;

use hermes_devices::directory::DeviceRecord;
use hermes_devices::protocol::{DeviceRequest, ErrorCode};

use crate::error::CommandError;
use crate::validator::{Command, ValidatedCommand};

/// URL scheme used to reach a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain HTTP for request/response commands
    Http,
    /// WebSocket for telemetry streams
    Ws,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => f.write_str("http"),
            Scheme::Ws => f.write_str("ws"),
        }
    }
}

/// Build `scheme://host:port/path`, making sure the path starts with `/`
pub fn device_url(scheme: Scheme, host: &str, port: u16, path: &str) -> String {
    let separator = if path.starts_with('/') { "" } else { "/" };
    format!("{}://{}:{}{}{}", scheme, host, port, separator, path)
}

/// A request ready to be relayed
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    /// Target URL
    pub url: String,
    /// Protocol body
    pub body: DeviceRequest,
}

fn command_url(device: &DeviceRecord, command: &Command) -> String {
    match command {
        Command::Stream { ext, .. } => device_url(Scheme::Ws, &device.address, device.port, ext),
        _ => device_url(Scheme::Http, &device.address, device.port, &device.cmd_path),
    }
}

/// Build the outbound request for a validated command
///
/// SET requests carry the parameter's own wire type, not the one the client
/// declared. A command without a resolved device has nowhere to go and is
/// rejected with `InvalidCmdParams`.
pub fn build_request(validated: &ValidatedCommand) -> Result<OutboundRequest, CommandError> {
    let device = validated
        .resolved
        .device
        .as_ref()
        .ok_or_else(|| CommandError::from_code(ErrorCode::InvalidCmdParams))?;

    let body = match &validated.command {
        Command::Info {
            peripheral_id,
            parameter_id,
            ..
        } => DeviceRequest::info(*peripheral_id, *parameter_id),
        Command::Get {
            peripheral_id,
            parameter_id,
            ..
        } => DeviceRequest::get(*peripheral_id, *parameter_id),
        Command::Action {
            peripheral_id,
            parameter_id,
            ..
        } => DeviceRequest::action(*peripheral_id, *parameter_id),
        Command::Set {
            peripheral_id,
            parameter_id,
            data,
            ..
        } => {
            let parameter = validated
                .parameter()
                .ok_or_else(|| CommandError::from_code(ErrorCode::InvalidCmdParams))?;
            DeviceRequest::set(*peripheral_id, *parameter_id, data.clone(), parameter.data_type)
        }
        Command::Stream {
            peripheral_id,
            parameter_ids,
            rate,
            ..
        } => DeviceRequest::stream(*peripheral_id, parameter_ids.clone(), *rate),
    };

    Ok(OutboundRequest {
        url: command_url(device, &validated.command),
        body,
    })
}
