/*!
 * Command validation for Hermes.
 *
 * Client requests arrive as loosely typed JSON. The [`Validator`] turns one
 * into a [`ValidatedCommand`] or a single [`CommandError`], checking in a
 * fixed order so the most fundamental problem is always the one reported:
 *
 * 1. required keys for the command kind are present and well typed
 * 2. device, peripheral and parameter ids resolve in the directory
 * 3. GET, SET and ACTION address a parameter with three non-zero ids
 * 4. a SET value is within the parameter's declared bound
 * 5. a STREAM targets streamable parameters at an allowed rate
 */
use serde_json::{Map, Value};
use tracing::debug;

use hermes_core::types::{DataValue, DeviceId, ParameterId, PeripheralId};
use hermes_devices::directory::{DeviceRecord, ParameterRecord, PeripheralRecord, SharedDirectory};
use hermes_devices::protocol::{CommandKind, DataType, ErrorCode, StreamRate, KEY_CMD_TYPE};

use crate::error::CommandError;

/// A normalized client command, one variant per command kind
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Describe a device, peripheral or parameter
    Info {
        /// Target device (0 when not yet known)
        device_id: DeviceId,
        /// Target peripheral (0 for the device root)
        peripheral_id: PeripheralId,
        /// Target parameter (0 for the peripheral itself)
        parameter_id: ParameterId,
    },
    /// Read a parameter
    Get {
        /// Target device
        device_id: DeviceId,
        /// Target peripheral
        peripheral_id: PeripheralId,
        /// Target parameter
        parameter_id: ParameterId,
    },
    /// Write a parameter
    Set {
        /// Target device
        device_id: DeviceId,
        /// Target peripheral
        peripheral_id: PeripheralId,
        /// Target parameter
        parameter_id: ParameterId,
        /// Value to write
        data: DataValue,
        /// Wire type of the target parameter
        data_type: DataType,
    },
    /// Trigger a parameter action
    Action {
        /// Target device
        device_id: DeviceId,
        /// Target peripheral
        peripheral_id: PeripheralId,
        /// Target parameter
        parameter_id: ParameterId,
    },
    /// Start a telemetry stream
    Stream {
        /// Target device
        device_id: DeviceId,
        /// Peripheral owning the streamed parameters
        peripheral_id: PeripheralId,
        /// Streamed parameters, in frame order
        parameter_ids: Vec<ParameterId>,
        /// Requested rate tier
        rate: StreamRate,
        /// Device stream endpoint path
        ext: String,
    },
}

impl Command {
    /// The kind of this command
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Info { .. } => CommandKind::Info,
            Command::Get { .. } => CommandKind::Get,
            Command::Set { .. } => CommandKind::Set,
            Command::Action { .. } => CommandKind::Action,
            Command::Stream { .. } => CommandKind::Stream,
        }
    }

    /// The addressed device
    pub fn device_id(&self) -> DeviceId {
        match self {
            Command::Info { device_id, .. }
            | Command::Get { device_id, .. }
            | Command::Set { device_id, .. }
            | Command::Action { device_id, .. }
            | Command::Stream { device_id, .. } => *device_id,
        }
    }

    /// The addressed peripheral
    pub fn peripheral_id(&self) -> PeripheralId {
        match self {
            Command::Info { peripheral_id, .. }
            | Command::Get { peripheral_id, .. }
            | Command::Set { peripheral_id, .. }
            | Command::Action { peripheral_id, .. }
            | Command::Stream { peripheral_id, .. } => *peripheral_id,
        }
    }
}

/// Directory records resolved while validating a command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolved {
    /// The addressed device, unless its id was 0
    pub device: Option<DeviceRecord>,
    /// The addressed peripheral, unless its id was 0
    pub peripheral: Option<PeripheralRecord>,
    /// The addressed parameters, in request order
    pub parameters: Vec<ParameterRecord>,
}

/// A command that passed validation, with the records it refers to
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCommand {
    /// The normalized command
    pub command: Command,
    /// Records resolved during validation
    pub resolved: Resolved,
}

impl ValidatedCommand {
    /// The single addressed parameter, for GET, SET, ACTION and parameter INFO
    pub fn parameter(&self) -> Option<&ParameterRecord> {
        self.resolved.parameters.first()
    }
}

/// Raw fields of a request, typed but not yet resolved
struct Fields {
    device_id: DeviceId,
    peripheral_id: PeripheralId,
    parameter_ids: Vec<ParameterId>,
}

fn invalid_json(key: &str) -> CommandError {
    CommandError::new(ErrorCode::InvalidJson, format!("Invalid json: '{}' has the wrong type", key))
}

fn get_id(map: &Map<String, Value>, key: &str) -> Result<u32, CommandError> {
    let value = map.get(key).ok_or_else(|| CommandError::from_code(ErrorCode::MissingField))?;
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| invalid_json(key))
}

fn parse_kind(value: &Value) -> Result<CommandKind, CommandError> {
    let kind = match value {
        Value::String(name) => CommandKind::from_name(name),
        Value::Number(n) => n.as_u64().and_then(CommandKind::from_code),
        _ => None,
    };
    kind.ok_or_else(|| {
        CommandError::new(ErrorCode::InvalidRequest, format!("Unknown command type {}", value))
    })
}

/// Validates client requests against the directory
#[derive(Debug, Clone)]
pub struct Validator {
    directory: SharedDirectory,
    max_rate: StreamRate,
}

impl Validator {
    /// Create a validator allowing every defined stream rate
    pub fn new(directory: SharedDirectory) -> Self {
        Self {
            directory,
            max_rate: StreamRate::MAX,
        }
    }

    /// Lower the highest accepted stream rate tier
    ///
    /// Tiers above [`StreamRate::MAX`] are clamped.
    pub fn with_max_rate_tier(mut self, tier: u8) -> Self {
        self.max_rate = StreamRate::new(tier).unwrap_or(StreamRate::MAX);
        self
    }

    /// The directory used for identity resolution
    pub fn directory(&self) -> &SharedDirectory {
        &self.directory
    }

    /// Validate a request received as JSON text
    pub fn validate_str(&self, text: &str) -> Result<ValidatedCommand, CommandError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|_| CommandError::from_code(ErrorCode::InvalidJson))?;
        self.validate(&value)
    }

    /// Validate a request whose kind is given by its `cmd_type` key
    pub fn validate(&self, request: &Value) -> Result<ValidatedCommand, CommandError> {
        let map = request
            .as_object()
            .ok_or_else(|| CommandError::from_code(ErrorCode::InvalidJson))?;
        let kind = parse_kind(
            map.get(KEY_CMD_TYPE)
                .ok_or_else(|| CommandError::from_code(ErrorCode::MissingField))?,
        )?;
        self.validate_as(kind, request)
    }

    /// Validate a request as a command of the given kind
    pub fn validate_as(
        &self,
        kind: CommandKind,
        request: &Value,
    ) -> Result<ValidatedCommand, CommandError> {
        let map = request
            .as_object()
            .ok_or_else(|| CommandError::from_code(ErrorCode::InvalidJson))?;

        if kind == CommandKind::Stream {
            let empty = map
                .get("param_ids")
                .and_then(Value::as_array)
                .map(Vec::is_empty)
                .unwrap_or(false);
            if empty {
                return Err(CommandError::new(
                    ErrorCode::InvalidRequest,
                    "A stream needs at least one parameter",
                ));
            }
        }

        // 1. field presence
        if let Some(missing) = kind
            .required_request_keys()
            .iter()
            .find(|k| !map.contains_key(**k))
        {
            debug!(%kind, missing, "Request is missing a required key");
            return Err(CommandError::new(
                ErrorCode::MissingField,
                format!("Missing Json fields: '{}'", missing),
            ));
        }

        let fields = self.parse_fields(kind, map)?;

        // 2. identity resolution
        let resolved = self.resolve(&fields)?;

        // 3. zero-id rule
        if kind.requires_full_address()
            && (fields.device_id == 0
                || fields.peripheral_id == 0
                || fields.parameter_ids.first().copied().unwrap_or(0) == 0)
        {
            return Err(CommandError::from_code(ErrorCode::InvalidCmdParams));
        }

        let command = match kind {
            CommandKind::Info => Command::Info {
                device_id: fields.device_id,
                peripheral_id: fields.peripheral_id,
                parameter_id: fields.parameter_ids[0],
            },
            CommandKind::Get => Command::Get {
                device_id: fields.device_id,
                peripheral_id: fields.peripheral_id,
                parameter_id: fields.parameter_ids[0],
            },
            CommandKind::Action => Command::Action {
                device_id: fields.device_id,
                peripheral_id: fields.peripheral_id,
                parameter_id: fields.parameter_ids[0],
            },
            // 4. value bound
            CommandKind::Set => self.check_set(map, &fields, &resolved)?,
            // 5. stream constraints
            CommandKind::Stream => self.check_stream(map, fields, &resolved)?,
        };

        Ok(ValidatedCommand { command, resolved })
    }

    fn parse_fields(
        &self,
        kind: CommandKind,
        map: &Map<String, Value>,
    ) -> Result<Fields, CommandError> {
        let device_id = get_id(map, "dev_id")?;
        let peripheral_id = get_id(map, "periph_id")?;

        let parameter_ids = if kind == CommandKind::Stream {
            map.get("param_ids")
                .and_then(Value::as_array)
                .ok_or_else(|| invalid_json("param_ids"))?
                .iter()
                .map(|v| {
                    v.as_u64()
                        .and_then(|v| u32::try_from(v).ok())
                        .ok_or_else(|| invalid_json("param_ids"))
                })
                .collect::<Result<Vec<_>, _>>()?
        } else {
            vec![get_id(map, "param_id")?]
        };

        Ok(Fields {
            device_id,
            peripheral_id,
            parameter_ids,
        })
    }

    fn resolve(&self, fields: &Fields) -> Result<Resolved, CommandError> {
        let mut resolved = Resolved::default();

        if fields.device_id != 0 {
            resolved.device = Some(
                self.directory
                    .resolve_device(fields.device_id)
                    .ok_or_else(|| CommandError::from_code(ErrorCode::InvalidDeviceId))?,
            );
        }

        if fields.peripheral_id != 0 {
            resolved.peripheral = Some(
                self.directory
                    .resolve_peripheral(fields.device_id, fields.peripheral_id)
                    .ok_or_else(|| CommandError::from_code(ErrorCode::InvalidPeripheralId))?,
            );
        }

        for &parameter_id in fields.parameter_ids.iter().filter(|id| **id != 0) {
            let parameter = self
                .directory
                .resolve_parameter(fields.device_id, fields.peripheral_id, parameter_id)
                .ok_or_else(|| CommandError::from_code(ErrorCode::InvalidParameterId))?;
            resolved.parameters.push(parameter);
        }

        Ok(resolved)
    }

    fn check_set(
        &self,
        map: &Map<String, Value>,
        fields: &Fields,
        resolved: &Resolved,
    ) -> Result<Command, CommandError> {
        let data = map
            .get("data")
            .and_then(DataValue::from_json)
            .ok_or_else(|| CommandError::from_code(ErrorCode::InvalidDataType))?;

        let parameter = resolved
            .parameters
            .first()
            .ok_or_else(|| CommandError::from_code(ErrorCode::InvalidCmdParams))?;

        match data.as_float() {
            Some(value) if value.abs() > parameter.max_value as f64 => {
                return Err(CommandError::new(
                    ErrorCode::InvalidDataValue,
                    format!("Value greater than max ({})", parameter.max_value),
                ));
            }
            Some(_) => {}
            None if parameter.data_type == DataType::String => {}
            None => return Err(CommandError::from_code(ErrorCode::InvalidDataType)),
        }

        Ok(Command::Set {
            device_id: fields.device_id,
            peripheral_id: fields.peripheral_id,
            parameter_id: parameter.id,
            data,
            data_type: parameter.data_type,
        })
    }

    fn check_stream(
        &self,
        map: &Map<String, Value>,
        fields: Fields,
        resolved: &Resolved,
    ) -> Result<Command, CommandError> {
        let all_streamable = resolved.parameters.len() == fields.parameter_ids.len()
            && resolved.parameters.iter().all(|p| p.is_streamable);
        if !all_streamable {
            return Err(CommandError::new(
                ErrorCode::InvalidRequest,
                "Every streamed parameter must be streamable",
            ));
        }

        let tier = map
            .get("rate")
            .and_then(Value::as_u64)
            .ok_or_else(|| invalid_json("rate"))?;
        let rate = u8::try_from(tier)
            .ok()
            .and_then(StreamRate::new)
            .filter(|rate| *rate <= self.max_rate)
            .ok_or_else(|| CommandError::from_code(ErrorCode::InvalidStreamRate))?;

        let ext = map
            .get("ext")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_json("ext"))?
            .to_string();

        Ok(Command::Stream {
            device_id: fields.device_id,
            peripheral_id: fields.peripheral_id,
            parameter_ids: fields.parameter_ids,
            rate,
            ext,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::seeded_directory;

    fn validator() -> Validator {
        Validator::new(seeded_directory())
    }

    fn code(result: Result<ValidatedCommand, CommandError>) -> ErrorCode {
        result.unwrap_err().code
    }

    #[test]
    fn test_get_by_name() {
        let validated = validator()
            .validate(&json!({"cmd_type": "GET", "dev_id": 5, "periph_id": 2, "param_id": 7}))
            .unwrap();
        assert_eq!(
            validated.command,
            Command::Get {
                device_id: 5,
                peripheral_id: 2,
                parameter_id: 7
            }
        );
        assert_eq!(validated.resolved.device.as_ref().unwrap().id, 5);
        assert_eq!(validated.parameter().unwrap().name, "brightness");
    }

    #[test]
    fn test_numeric_and_unknown_command_types() {
        let v = validator();
        let validated = v
            .validate(&json!({"cmd_type": 4, "dev_id": 5, "periph_id": 2, "param_id": 8}))
            .unwrap();
        assert_eq!(validated.command.kind(), CommandKind::Action);

        assert_eq!(
            code(v.validate(&json!({"cmd_type": "REBOOT", "dev_id": 5, "periph_id": 2, "param_id": 8}))),
            ErrorCode::InvalidRequest
        );
        assert_eq!(
            code(v.validate(&json!({"dev_id": 5, "periph_id": 2, "param_id": 8}))),
            ErrorCode::MissingField
        );
        assert_eq!(code(v.validate_str("{not json")), ErrorCode::InvalidJson);
    }

    #[test]
    fn test_missing_field_reported_before_identity() {
        let err = validator()
            .validate(&json!({"cmd_type": "SET", "dev_id": 99, "periph_id": 2, "param_id": 7}))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingField);
        assert!(err.message.contains("data"));
    }

    #[test]
    fn test_identity_errors_in_order() {
        let v = validator();
        assert_eq!(
            code(v.validate(&json!({"cmd_type": "GET", "dev_id": 9, "periph_id": 9, "param_id": 9}))),
            ErrorCode::InvalidDeviceId
        );
        assert_eq!(
            code(v.validate(&json!({"cmd_type": "GET", "dev_id": 5, "periph_id": 9, "param_id": 9}))),
            ErrorCode::InvalidPeripheralId
        );
        assert_eq!(
            code(v.validate(&json!({"cmd_type": "GET", "dev_id": 5, "periph_id": 2, "param_id": 9}))),
            ErrorCode::InvalidParameterId
        );
    }

    #[test]
    fn test_zero_ids_rejected_except_info() {
        let v = validator();
        for kind in ["GET", "ACTION"] {
            for (d, p, q) in [(0, 0, 0), (5, 0, 0), (5, 2, 0)] {
                assert_eq!(
                    code(v.validate(&json!({"cmd_type": kind, "dev_id": d, "periph_id": p, "param_id": q}))),
                    ErrorCode::InvalidCmdParams
                );
            }
        }
        assert_eq!(
            code(v.validate(&json!({
                "cmd_type": "SET", "dev_id": 5, "periph_id": 2, "param_id": 0,
                "data": 1, "data_type": 2
            }))),
            ErrorCode::InvalidCmdParams
        );

        let info = v
            .validate(&json!({"cmd_type": "INFO", "dev_id": 5, "periph_id": 0, "param_id": 0}))
            .unwrap();
        assert_eq!(info.command.kind(), CommandKind::Info);
        assert!(info.resolved.peripheral.is_none());
    }

    #[test]
    fn test_set_bound_uses_magnitude() {
        let v = validator();
        let set = |data: Value| {
            v.validate(&json!({
                "cmd_type": "SET", "dev_id": 5, "periph_id": 2, "param_id": 7,
                "data": data, "data_type": 2
            }))
        };
        assert_eq!(code(set(json!(999))), ErrorCode::InvalidDataValue);
        assert_eq!(code(set(json!(101))), ErrorCode::InvalidDataValue);
        assert_eq!(code(set(json!(-101))), ErrorCode::InvalidDataValue);
        assert_eq!(code(set(json!("high"))), ErrorCode::InvalidDataType);
        assert_eq!(code(set(json!([1]))), ErrorCode::InvalidDataType);
        assert!(set(json!(100)).is_ok());
        assert!(set(json!(-100)).is_ok());
    }

    #[test]
    fn test_set_client_data_type_is_not_trusted() {
        let v = validator();
        let set = |data: Value, data_type: Value| {
            v.validate(&json!({
                "cmd_type": "SET", "dev_id": 5, "periph_id": 2, "param_id": 7,
                "data": data, "data_type": data_type
            }))
        };
        assert_eq!(code(set(json!(999), json!(3))), ErrorCode::InvalidDataValue);
        assert_eq!(code(set(json!(999), json!("int"))), ErrorCode::InvalidDataValue);

        let validated = set(json!(55), json!(3)).unwrap();
        match validated.command {
            Command::Set { data_type, .. } => assert_eq!(data_type, DataType::Int16),
            other => panic!("expected SET, got {:?}", other),
        }
    }

    #[test]
    fn test_mistyped_ids_are_invalid_json() {
        assert_eq!(
            code(validator().validate(&json!({"cmd_type": "GET", "dev_id": "5", "periph_id": 2, "param_id": 7}))),
            ErrorCode::InvalidJson
        );
        assert_eq!(
            code(validator().validate(&json!({"cmd_type": "GET", "dev_id": -5, "periph_id": 2, "param_id": 7}))),
            ErrorCode::InvalidJson
        );
    }

    #[test]
    fn test_stream_rules() {
        let v = validator().with_max_rate_tier(4);
        let stream = |ids: Value, rate: Value| {
            v.validate_as(
                CommandKind::Stream,
                &json!({"dev_id": 5, "periph_id": 2, "param_ids": ids, "rate": rate, "ext": "/stream"}),
            )
        };

        let validated = stream(json!([7]), json!(4)).unwrap();
        match validated.command {
            Command::Stream { parameter_ids, rate, ext, .. } => {
                assert_eq!(parameter_ids, vec![7]);
                assert_eq!(rate.tier(), 4);
                assert_eq!(ext, "/stream");
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert_eq!(code(stream(json!([8]), json!(1))), ErrorCode::InvalidRequest);
        assert_eq!(code(stream(json!([7]), json!(5))), ErrorCode::InvalidStreamRate);
        assert_eq!(code(stream(json!([7]), json!(300))), ErrorCode::InvalidStreamRate);
        assert_eq!(code(stream(json!([7, 9]), json!(1))), ErrorCode::InvalidParameterId);
    }

    #[test]
    fn test_empty_stream_list_always_invalid_request() {
        let v = validator();
        for request in [
            json!({"param_ids": []}),
            json!({"dev_id": 99, "periph_id": 2, "param_ids": [], "rate": 1, "ext": "/s"}),
            json!({"dev_id": 5, "periph_id": 2, "param_ids": [], "rate": 200}),
        ] {
            assert_eq!(
                code(v.validate_as(CommandKind::Stream, &request)),
                ErrorCode::InvalidRequest
            );
        }
    }
}
