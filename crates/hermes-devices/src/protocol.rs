/*!
 * Device protocol vocabulary and JSON envelope codec.
 *
 * This module defines the closed enumerations of the command protocol spoken
 * by Hermes devices (command kinds, response kinds, wire data types, method
 * capability bits, error codes and stream rate tiers) together with the
 * encoder for outbound requests and the validating decoder for device
 * responses.
 */
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use hermes_core::types::{DataValue, DeviceId, ParameterId, PeripheralId};

/// Key carrying the command kind in requests
pub const KEY_CMD_TYPE: &str = "cmd_type";
/// Key carrying the response kind in responses
pub const KEY_RSP_TYPE: &str = "rsp_type";

/// Errors produced while decoding device responses or binary frames
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// The response does not match any known response schema
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// A binary frame has the wrong size for the session layout
    #[error("Frame length mismatch: expected {expected} bytes, got {actual}")]
    FrameLength {
        /// Size required by the layout
        expected: usize,
        /// Size actually received
        actual: usize,
    },

    /// The wire type has no fixed width and cannot appear in a frame
    #[error("Wire type {0} cannot be carried in a binary frame")]
    UnframeableType(DataType),

    /// A value cannot be packed with the wire type of its field
    #[error("Value {value} does not fit wire type {data_type}")]
    ValueMismatch {
        /// The offending value
        value: String,
        /// The field wire type
        data_type: DataType,
    },

    /// The frame layout itself is unusable
    #[error("Frame layout error: {0}")]
    Layout(String),
}

impl CodecError {
    fn malformed<S: AsRef<str>>(msg: S) -> Self {
        CodecError::MalformedResponse(msg.as_ref().to_string())
    }

    /// Whether this error describes a malformed JSON response
    pub fn is_malformed_response(&self) -> bool {
        matches!(self, CodecError::MalformedResponse(_))
    }
}

/// Command kinds understood by devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandKind {
    /// Describe the device, a peripheral or a parameter
    Info = 0,
    /// Read a parameter value
    Get = 1,
    /// Write a parameter value
    Set = 2,
    /// Trigger a parameter action
    Action = 4,
    /// Start a binary telemetry stream
    Stream = 5,
}

impl CommandKind {
    /// All command kinds
    pub const ALL: [CommandKind; 5] = [
        CommandKind::Info,
        CommandKind::Get,
        CommandKind::Set,
        CommandKind::Action,
        CommandKind::Stream,
    ];

    /// The numeric wire code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look a kind up by wire code
    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|k| u64::from(k.code()) == code)
    }

    /// Look a kind up by its (case-insensitive) client name
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "INFO" => Some(CommandKind::Info),
            "GET" => Some(CommandKind::Get),
            "SET" => Some(CommandKind::Set),
            "ACT" | "ACTION" => Some(CommandKind::Action),
            "STREAM" => Some(CommandKind::Stream),
            _ => None,
        }
    }

    /// The canonical upper-case name
    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Info => "INFO",
            CommandKind::Get => "GET",
            CommandKind::Set => "SET",
            CommandKind::Action => "ACTION",
            CommandKind::Stream => "STREAM",
        }
    }

    /// Whether device, peripheral and parameter ids must all be non-zero
    pub fn requires_full_address(self) -> bool {
        !matches!(self, CommandKind::Info | CommandKind::Stream)
    }

    /// Keys a client request of this kind must carry
    pub fn required_request_keys(self) -> &'static [&'static str] {
        match self {
            CommandKind::Info | CommandKind::Get | CommandKind::Action => {
                &["cmd_type", "dev_id", "periph_id", "param_id"]
            }
            CommandKind::Set => &["cmd_type", "dev_id", "periph_id", "param_id", "data", "data_type"],
            CommandKind::Stream => &["dev_id", "periph_id", "param_ids", "rate", "ext"],
        }
    }

    /// The response kind a device answers this command with on success
    pub fn expected_response(self) -> ResponseKind {
        match self {
            CommandKind::Info => ResponseKind::Info,
            CommandKind::Get => ResponseKind::Data,
            CommandKind::Set | CommandKind::Action | CommandKind::Stream => ResponseKind::Ok,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Response kinds sent back by devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResponseKind {
    /// Description of a device, peripheral or parameter
    Info = 0,
    /// Command accepted
    Ok = 1,
    /// Command rejected
    Error = 2,
    /// Parameter value
    Data = 3,
    /// Stream announcement
    Stream = 4,
}

impl ResponseKind {
    /// All response kinds
    pub const ALL: [ResponseKind; 5] = [
        ResponseKind::Info,
        ResponseKind::Ok,
        ResponseKind::Error,
        ResponseKind::Data,
        ResponseKind::Stream,
    ];

    /// The numeric wire code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look a kind up by wire code
    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|k| u64::from(k.code()) == code)
    }

    /// Keys every response of this kind must carry
    ///
    /// INFO responses have further level-specific keys, checked by [`InfoBody`].
    pub fn required_keys(self) -> &'static [&'static str] {
        match self {
            ResponseKind::Info => &["rsp_type", "name"],
            ResponseKind::Ok => &["rsp_type", "periph_id", "param_id"],
            ResponseKind::Error => &["rsp_type", "error_code", "msg"],
            ResponseKind::Data => &["rsp_type", "data", "data_type", "periph_id", "param_id"],
            ResponseKind::Stream => &["rsp_type", "periph_id", "param_ids"],
        }
    }
}

/// Wire data types of parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum DataType {
    /// No value
    None = 0,
    /// 8-bit integer
    Int8 = 1,
    /// 16-bit integer
    Int16 = 2,
    /// 32-bit integer
    Int32 = 4,
    /// 32-bit IEEE float
    Float = 5,
    /// 64-bit IEEE float
    Double = 8,
    /// Text
    String = 10,
    /// Boolean
    Bool = 11,
}

impl DataType {
    /// All data types
    pub const ALL: [DataType; 8] = [
        DataType::None,
        DataType::Int8,
        DataType::Int16,
        DataType::Int32,
        DataType::Float,
        DataType::Double,
        DataType::String,
        DataType::Bool,
    ];

    /// The numeric wire code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look a type up by wire code
    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| u64::from(t.code()) == code)
    }

    /// Width in bytes inside a binary frame, if the type is fixed-width
    pub fn frame_width(self) -> Option<usize> {
        match self {
            DataType::Int8 | DataType::Bool => Some(1),
            DataType::Int16 => Some(2),
            DataType::Int32 | DataType::Float => Some(4),
            DataType::Double => Some(8),
            DataType::None | DataType::String => None,
        }
    }
}

impl Default for DataType {
    fn default() -> Self {
        DataType::None
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

impl TryFrom<u8> for DataType {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        DataType::from_code(u64::from(code)).ok_or_else(|| format!("unknown data type {}", code))
    }
}

impl From<DataType> for u8 {
    fn from(data_type: DataType) -> Self {
        data_type.code()
    }
}

/// Capability bitmask of a parameter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Methods(u8);

impl Methods {
    /// The parameter can be read
    pub const GET: Methods = Methods(1);
    /// The parameter can be written
    pub const SET: Methods = Methods(2);
    /// The parameter can be triggered
    pub const ACTION: Methods = Methods(4);
    /// The parameter can be streamed
    pub const STREAM: Methods = Methods(8);

    /// Build a mask from raw bits, ignoring undefined bits
    pub fn from_bits(bits: u8) -> Self {
        Methods(bits & 0x0F)
    }

    /// The raw bits
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set
    pub fn contains(self, other: Methods) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Methods {
    type Output = Methods;

    fn bitor(self, rhs: Methods) -> Methods {
        Methods(self.0 | rhs.0)
    }
}

/// Client-facing error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    /// A required key is absent
    MissingField = 0x0D,
    /// The request is structurally valid but not acceptable
    InvalidRequest = 0x0E,
    /// The addressed ids are not valid for the command
    InvalidCmdParams = 0x0F,
    /// The stream rate exceeds the highest tier
    InvalidStreamRate = 0x10,
    /// Unknown or unusable data type
    InvalidDataType = 0x11,
    /// The value is out of range for the parameter
    InvalidDataValue = 0x12,
    /// The device answered with a body that is not a valid response
    InvalidResponseJson = 0x1D,
    /// The device answered with an oversized body
    InvalidResponseLength = 0x1E,
    /// The client message is not valid JSON or has mistyped fields
    InvalidJson = 0x1F,
    /// The device URL is invalid or unreachable
    InvalidUrl = 0x20,
    /// The device did not answer in time
    HttpTimeout = 0x21,
    /// Unknown device id
    InvalidDeviceId = 0x2A,
    /// Unknown peripheral id
    InvalidPeripheralId = 0x2B,
    /// Unknown parameter id
    InvalidParameterId = 0x2C,
    /// The device answered with an ERROR response
    ErrorResponse = 0x30,
}

impl ErrorCode {
    /// The numeric wire code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// The fixed human-readable message for this code
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::MissingField => "Missing Json fields",
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::InvalidCmdParams => "Invalid ID for command",
            ErrorCode::InvalidStreamRate => "Invalid stream rate",
            ErrorCode::InvalidDataType => "Invalid data type",
            ErrorCode::InvalidDataValue => "Value out of range",
            ErrorCode::InvalidResponseJson => "Invalid response json",
            ErrorCode::InvalidResponseLength => "Excess response data",
            ErrorCode::InvalidJson => "Invalid json",
            ErrorCode::InvalidUrl => "Invalid device url",
            ErrorCode::HttpTimeout => "Device request timed out",
            ErrorCode::InvalidDeviceId => "Invalid device id",
            ErrorCode::InvalidPeripheralId => "Invalid periph id",
            ErrorCode::InvalidParameterId => "Invalid param id",
            ErrorCode::ErrorResponse => "Device returned an error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02x})", self, self.code())
    }
}

/// Build the ERROR response envelope sent to clients
pub fn error_response(code: ErrorCode, message: &str) -> Value {
    json!({
        KEY_RSP_TYPE: ResponseKind::Error.code(),
        "error_code": code.code(),
        "msg": message,
    })
}

/// Stream sampling rate tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamRate(u8);

impl StreamRate {
    /// Sampling frequency of each tier, in Hz
    pub const TIERS_HZ: [u32; 7] = [1, 2, 5, 10, 20, 50, 100];

    /// The highest defined tier
    pub const MAX: StreamRate = StreamRate(6);

    /// Build a rate from a tier index, if the tier exists
    pub fn new(tier: u8) -> Option<Self> {
        (usize::from(tier) < Self::TIERS_HZ.len()).then_some(StreamRate(tier))
    }

    /// The tier index
    pub fn tier(self) -> u8 {
        self.0
    }

    /// The sampling frequency in Hz
    pub fn hz(self) -> u32 {
        Self::TIERS_HZ[usize::from(self.0)]
    }

    /// The interval between two samples
    pub fn interval(self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.hz()))
    }
}

/// An outbound request sent to a device
///
/// Serializes to exactly the keys the device protocol expects for its kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DeviceRequest {
    /// INFO, GET, SET and ACTION requests
    Addressed {
        /// Command kind code
        cmd_type: u8,
        /// Target peripheral (0 for the device root)
        periph_id: PeripheralId,
        /// Target parameter (0 for the peripheral itself)
        param_id: ParameterId,
        /// Payload (0 unless SET)
        data: DataValue,
        /// Payload wire type (NONE unless SET)
        data_type: u8,
    },
    /// STREAM negotiation request
    Stream {
        /// Command kind code
        cmd_type: u8,
        /// Peripheral owning the streamed parameters
        periph_id: PeripheralId,
        /// Streamed parameters, in frame order
        param_ids: Vec<ParameterId>,
        /// Rate tier
        rate: u8,
    },
}

impl DeviceRequest {
    fn addressed(kind: CommandKind, periph_id: PeripheralId, param_id: ParameterId) -> Self {
        DeviceRequest::Addressed {
            cmd_type: kind.code(),
            periph_id,
            param_id,
            data: DataValue::Integer(0),
            data_type: DataType::None.code(),
        }
    }

    /// INFO request; zero ids address the device root or a whole peripheral
    pub fn info(periph_id: PeripheralId, param_id: ParameterId) -> Self {
        Self::addressed(CommandKind::Info, periph_id, param_id)
    }

    /// GET request
    pub fn get(periph_id: PeripheralId, param_id: ParameterId) -> Self {
        Self::addressed(CommandKind::Get, periph_id, param_id)
    }

    /// ACTION request
    pub fn action(periph_id: PeripheralId, param_id: ParameterId) -> Self {
        Self::addressed(CommandKind::Action, periph_id, param_id)
    }

    /// SET request
    pub fn set(
        periph_id: PeripheralId,
        param_id: ParameterId,
        data: DataValue,
        data_type: DataType,
    ) -> Self {
        DeviceRequest::Addressed {
            cmd_type: CommandKind::Set.code(),
            periph_id,
            param_id,
            data,
            data_type: data_type.code(),
        }
    }

    /// STREAM request
    pub fn stream(periph_id: PeripheralId, param_ids: Vec<ParameterId>, rate: StreamRate) -> Self {
        DeviceRequest::Stream {
            cmd_type: CommandKind::Stream.code(),
            periph_id,
            param_ids,
            rate: rate.tier(),
        }
    }

    /// The command kind of this request
    pub fn kind(&self) -> CommandKind {
        let code = match self {
            DeviceRequest::Addressed { cmd_type, .. } | DeviceRequest::Stream { cmd_type, .. } => {
                *cmd_type
            }
        };
        CommandKind::from_code(u64::from(code)).unwrap_or(CommandKind::Info)
    }

    /// Encode the request as a JSON value
    pub fn to_json(&self) -> Value {
        match self {
            DeviceRequest::Addressed {
                cmd_type,
                periph_id,
                param_id,
                data,
                data_type,
            } => json!({
                KEY_CMD_TYPE: cmd_type,
                "periph_id": periph_id,
                "param_id": param_id,
                "data": data.to_json(),
                "data_type": data_type,
            }),
            DeviceRequest::Stream {
                cmd_type,
                periph_id,
                param_ids,
                rate,
            } => json!({
                KEY_CMD_TYPE: cmd_type,
                "periph_id": periph_id,
                "param_ids": param_ids,
                "rate": rate,
            }),
        }
    }
}

/// Device description returned by a root INFO request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Device id as assigned by the device
    pub dev_id: DeviceId,
    /// Declared peripheral count
    pub periph_num: u32,
    /// Peripheral ids, in enumeration order
    pub periph_ids: Vec<PeripheralId>,
    /// Optional device type tag
    #[serde(default)]
    pub dev_type: Option<String>,
    /// Optional hardware address
    #[serde(default)]
    pub mac_address: Option<String>,
}

/// Peripheral description returned by an INFO request on a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeripheralInfo {
    /// Peripheral name
    pub name: String,
    /// Peripheral id
    pub periph_id: PeripheralId,
    /// Peripheral type tag
    pub periph_type: u32,
    /// Declared parameter count
    pub param_num: u32,
    /// Parameter ids, in enumeration order
    pub param_ids: Vec<ParameterId>,
}

/// Parameter description returned by an INFO request on a parameter
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ParameterInfo {
    /// Parameter name
    pub name: String,
    /// Parameter id
    pub param_id: ParameterId,
    /// Capability bitmask
    pub methods: u8,
    /// Declared maximum value
    pub param_max: i64,
    /// Wire data type
    pub data_type: DataType,
    /// Optional unit label
    #[serde(default)]
    pub units: Option<String>,
}

/// The payload of an INFO response
///
/// The level (device, peripheral, parameter) is known only to the requester,
/// so the typed views check their own key sets on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct InfoBody(Map<String, Value>);

impl InfoBody {
    /// The reported name
    pub fn name(&self) -> &str {
        self.0.get("name").and_then(Value::as_str).unwrap_or_default()
    }

    /// The raw key/value map
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    fn view<T: for<'de> Deserialize<'de>>(&self, level: &str) -> Result<T, CodecError> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| CodecError::malformed(format!("{} INFO response: {}", level, e)))
    }

    /// Interpret the body as a device description
    pub fn device(&self) -> Result<DeviceInfo, CodecError> {
        self.view("device")
    }

    /// Interpret the body as a peripheral description
    pub fn peripheral(&self) -> Result<PeripheralInfo, CodecError> {
        self.view("peripheral")
    }

    /// Interpret the body as a parameter description
    pub fn parameter(&self) -> Result<ParameterInfo, CodecError> {
        self.view("parameter")
    }
}

/// A decoded device response
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Description of a device, peripheral or parameter
    Info(InfoBody),
    /// Command accepted
    Ok {
        /// Echoed peripheral id
        periph_id: PeripheralId,
        /// Echoed parameter id
        param_id: ParameterId,
    },
    /// Command rejected by the device
    Error {
        /// Device error code
        error_code: u16,
        /// Device error message
        msg: String,
    },
    /// Parameter value
    Data {
        /// Echoed peripheral id
        periph_id: PeripheralId,
        /// Echoed parameter id
        param_id: ParameterId,
        /// Current value
        data: DataValue,
        /// Wire type of the value
        data_type: DataType,
    },
    /// Stream announcement
    Stream {
        /// Streamed peripheral
        periph_id: PeripheralId,
        /// Streamed parameters in frame order
        param_ids: Vec<ParameterId>,
        /// Frame size announced by the device, if any
        frame_len: Option<usize>,
    },
}

impl Response {
    /// The kind of this response
    pub fn kind(&self) -> ResponseKind {
        match self {
            Response::Info(_) => ResponseKind::Info,
            Response::Ok { .. } => ResponseKind::Ok,
            Response::Error { .. } => ResponseKind::Error,
            Response::Data { .. } => ResponseKind::Data,
            Response::Stream { .. } => ResponseKind::Stream,
        }
    }
}

fn get_u32(map: &Map<String, Value>, key: &str) -> Result<u32, CodecError> {
    map.get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| CodecError::malformed(format!("'{}' is not an unsigned integer", key)))
}

fn get_id_list(map: &Map<String, Value>, key: &str) -> Result<Vec<u32>, CodecError> {
    let items = map
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| CodecError::malformed(format!("'{}' is not a list", key)))?;
    items
        .iter()
        .map(|v| {
            v.as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| CodecError::malformed(format!("'{}' holds a non-id entry", key)))
        })
        .collect()
}

/// Decode a device response from a JSON value
///
/// The `rsp_type` must name one of the five response kinds and every key
/// required by that kind must be present with the right type; otherwise the
/// whole response is rejected.
pub fn decode_response(value: &Value) -> Result<Response, CodecError> {
    let map = value
        .as_object()
        .ok_or_else(|| CodecError::malformed("response is not a JSON object"))?;

    let code = map
        .get(KEY_RSP_TYPE)
        .ok_or_else(|| CodecError::malformed("missing 'rsp_type'"))?
        .as_u64()
        .ok_or_else(|| CodecError::malformed("'rsp_type' is not an unsigned integer"))?;
    let kind = ResponseKind::from_code(code)
        .ok_or_else(|| CodecError::malformed(format!("unknown response kind {}", code)))?;

    if let Some(missing) = kind.required_keys().iter().find(|k| !map.contains_key(**k)) {
        return Err(CodecError::malformed(format!(
            "{:?} response missing '{}'",
            kind, missing
        )));
    }

    match kind {
        ResponseKind::Info => {
            if !map.get("name").map(Value::is_string).unwrap_or(false) {
                return Err(CodecError::malformed("'name' is not a string"));
            }
            Ok(Response::Info(InfoBody(map.clone())))
        }
        ResponseKind::Ok => Ok(Response::Ok {
            periph_id: get_u32(map, "periph_id")?,
            param_id: get_u32(map, "param_id")?,
        }),
        ResponseKind::Error => {
            let error_code = map
                .get("error_code")
                .and_then(Value::as_u64)
                .and_then(|v| u16::try_from(v).ok())
                .ok_or_else(|| CodecError::malformed("'error_code' is not a valid code"))?;
            let msg = map
                .get("msg")
                .and_then(Value::as_str)
                .ok_or_else(|| CodecError::malformed("'msg' is not a string"))?;
            Ok(Response::Error {
                error_code,
                msg: msg.to_string(),
            })
        }
        ResponseKind::Data => {
            let data = map
                .get("data")
                .and_then(DataValue::from_json)
                .ok_or_else(|| CodecError::malformed("'data' is not a scalar value"))?;
            let data_type = map
                .get("data_type")
                .and_then(Value::as_u64)
                .and_then(DataType::from_code)
                .ok_or_else(|| CodecError::malformed("'data_type' is not a known data type"))?;
            Ok(Response::Data {
                periph_id: get_u32(map, "periph_id")?,
                param_id: get_u32(map, "param_id")?,
                data,
                data_type,
            })
        }
        ResponseKind::Stream => Ok(Response::Stream {
            periph_id: get_u32(map, "periph_id")?,
            param_ids: get_id_list(map, "param_ids")?,
            frame_len: map
                .get("frame_len")
                .and_then(Value::as_u64)
                .and_then(|v| usize::try_from(v).ok()),
        }),
    }
}

/// Decode a device response from JSON text
pub fn decode_response_str(text: &str) -> Result<Response, CodecError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| CodecError::malformed(format!("invalid JSON: {}", e)))?;
    decode_response(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_kind_codes_and_names() {
        assert_eq!(CommandKind::Info.code(), 0);
        assert_eq!(CommandKind::Action.code(), 4);
        assert_eq!(CommandKind::from_code(5), Some(CommandKind::Stream));
        assert_eq!(CommandKind::from_code(3), None);
        assert_eq!(CommandKind::from_name("get"), Some(CommandKind::Get));
        assert_eq!(CommandKind::from_name("ACT"), Some(CommandKind::Action));
        assert_eq!(CommandKind::from_name("reboot"), None);
        assert!(CommandKind::Set.requires_full_address());
        assert!(!CommandKind::Stream.requires_full_address());
    }

    #[test]
    fn test_encode_get_request() {
        let request = DeviceRequest::get(2, 7);
        assert_eq!(request.kind(), CommandKind::Get);
        assert_eq!(
            request.to_json(),
            json!({"cmd_type": 1, "periph_id": 2, "param_id": 7, "data": 0, "data_type": 0})
        );
        assert_eq!(serde_json::to_value(&request).unwrap(), request.to_json());
    }

    #[test]
    fn test_encode_set_and_stream_requests() {
        let set = DeviceRequest::set(1, 3, DataValue::Integer(55), DataType::Int16);
        assert_eq!(
            set.to_json(),
            json!({"cmd_type": 2, "periph_id": 1, "param_id": 3, "data": 55, "data_type": 2})
        );

        let stream = DeviceRequest::stream(4, vec![1, 2, 3], StreamRate::new(3).unwrap());
        let encoded = stream.to_json();
        assert_eq!(
            encoded,
            json!({"cmd_type": 5, "periph_id": 4, "param_ids": [1, 2, 3], "rate": 3})
        );
        assert_eq!(encoded.as_object().unwrap().len(), 4);
    }

    #[test]
    fn test_decode_data_response() {
        let response = decode_response(&json!({
            "rsp_type": 3, "data": 42, "data_type": 1, "periph_id": 2, "param_id": 7
        }))
        .unwrap();
        assert_eq!(
            response,
            Response::Data {
                periph_id: 2,
                param_id: 7,
                data: DataValue::Integer(42),
                data_type: DataType::Int8,
            }
        );
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        for code in [5, 9, 255] {
            let err = decode_response(&json!({"rsp_type": code, "periph_id": 1, "param_id": 1}))
                .unwrap_err();
            assert!(err.is_malformed_response());
        }
        let err = decode_response(&json!({"rsp_type": -1})).unwrap_err();
        assert!(err.is_malformed_response());
    }

    #[test]
    fn test_decode_rejects_missing_keys() {
        let err = decode_response(&json!({"rsp_type": 2, "error_code": 13})).unwrap_err();
        assert_eq!(
            err,
            CodecError::MalformedResponse("Error response missing 'msg'".to_string())
        );

        let err = decode_response(&json!({"rsp_type": 3, "data": 1, "periph_id": 1, "param_id": 1}))
            .unwrap_err();
        assert!(err.is_malformed_response());

        assert!(decode_response(&json!([1, 2])).is_err());
        assert!(decode_response_str("not json").is_err());
    }

    #[test]
    fn test_request_decoded_as_response_never_panics() {
        for request in [
            DeviceRequest::info(0, 0),
            DeviceRequest::get(1, 1),
            DeviceRequest::set(1, 1, DataValue::Float(1.5), DataType::Float),
            DeviceRequest::action(3, 4),
            DeviceRequest::stream(1, vec![1], StreamRate::MAX),
        ] {
            // Requests carry no rsp_type, so they can never decode into a response.
            let result = decode_response(&request.to_json());
            assert!(result.unwrap_err().is_malformed_response());
        }
    }

    #[test]
    fn test_info_body_views() {
        let response = decode_response(&json!({
            "rsp_type": 0, "name": "bench-node", "dev_id": 9, "periph_num": 2, "periph_ids": [1, 2]
        }))
        .unwrap();
        let Response::Info(body) = response else {
            panic!("expected INFO response");
        };
        assert_eq!(body.name(), "bench-node");
        let device = body.device().unwrap();
        assert_eq!(device.dev_id, 9);
        assert_eq!(device.periph_ids, vec![1, 2]);
        assert!(body.peripheral().unwrap_err().is_malformed_response());
    }

    #[test]
    fn test_parameter_info_rejects_unknown_data_type() {
        let Response::Info(body) = decode_response(&json!({
            "rsp_type": 0, "name": "temp", "param_id": 1, "methods": 9,
            "param_max": 100, "data_type": 3
        }))
        .unwrap() else {
            panic!("expected INFO response");
        };
        assert!(body.parameter().is_err());
    }

    #[test]
    fn test_methods_bits() {
        let methods = Methods::from_bits(0xF9);
        assert!(methods.contains(Methods::GET));
        assert!(methods.contains(Methods::STREAM));
        assert!(!methods.contains(Methods::SET));
        assert_eq!(methods.bits(), 9);
        assert_eq!((Methods::GET | Methods::SET).bits(), 3);
    }

    #[test]
    fn test_stream_rate_tiers() {
        assert_eq!(StreamRate::new(0).unwrap().hz(), 1);
        assert_eq!(StreamRate::MAX.hz(), 100);
        assert_eq!(StreamRate::new(3).unwrap().interval(), Duration::from_millis(100));
        assert!(StreamRate::new(7).is_none());
    }

    #[test]
    fn test_error_response_envelope() {
        let value = error_response(ErrorCode::InvalidDataValue, "Value greater than max");
        assert_eq!(value["rsp_type"], 2);
        assert_eq!(value["error_code"], 0x12);
        assert_eq!(value["msg"], "Value greater than max");
        assert_eq!(ErrorCode::MissingField.code(), 0x0d);
        assert_eq!(ErrorCode::InvalidParameterId.message(), "Invalid param id");
    }
}
