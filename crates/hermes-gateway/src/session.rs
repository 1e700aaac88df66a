/*!
 * Per-client command session.
 *
 * A session owns the request/response loop for one client connection:
 * validate, build, relay, decode, record the observed value, reply. Every
 * request produces exactly one reply, either the device's response or an
 * ERROR envelope.
 */
use serde_json::Value;
use tracing::{debug, info, warn, Instrument};

use hermes_core::logging::session_span;
use hermes_core::types::SessionId;
use hermes_devices::directory::SharedDirectory;
use hermes_devices::protocol::{decode_response, CommandKind, ErrorCode, Response};
use hermes_devices::relay::SharedRelay;

use crate::builder::build_request;
use crate::error::CommandError;
use crate::validator::Validator;

/// Handles INFO, GET, SET and ACTION requests for one client
#[derive(Debug, Clone)]
pub struct CommandSession {
    id: SessionId,
    validator: Validator,
    relay: SharedRelay,
    directory: SharedDirectory,
}

impl CommandSession {
    /// Create a session over the given directory and relay
    pub fn new(directory: SharedDirectory, relay: SharedRelay) -> Self {
        Self {
            id: SessionId::new(),
            validator: Validator::new(directory.clone()),
            relay,
            directory,
        }
    }

    /// The session id
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Handle one raw text message, always producing one reply
    pub async fn handle_text(&self, text: &str) -> Value {
        match serde_json::from_str::<Value>(text) {
            Ok(request) => self.handle(&request).await,
            Err(e) => {
                debug!("Client sent invalid JSON: {}", e);
                CommandError::from_code(ErrorCode::InvalidJson).to_response()
            }
        }
    }

    /// Handle one request, always producing one reply
    pub async fn handle(&self, request: &Value) -> Value {
        let span = session_span("command", &self.id);
        match self.execute(request).instrument(span).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(code = %err.code, "Rejecting command: {}", err.message);
                err.to_response()
            }
        }
    }

    /// Run one command to completion
    ///
    /// Device ERROR replies are returned unchanged as the `Ok` reply.
    pub async fn execute(&self, request: &Value) -> Result<Value, CommandError> {
        let validated = self.validator.validate(request)?;
        let kind = validated.command.kind();
        if kind == CommandKind::Stream {
            return Err(CommandError::new(
                ErrorCode::InvalidRequest,
                "Streams are started on the stream endpoint",
            ));
        }

        let outbound = build_request(&validated)?;
        info!(%kind, url = %outbound.url, "Relaying command");

        let reply = self
            .relay
            .post(&outbound.url, &outbound.body.to_json())
            .await
            .map_err(|e| {
                warn!(url = %outbound.url, "Relay failed: {}", e);
                CommandError::from(e)
            })?;

        let response = decode_response(&reply).map_err(|e| {
            warn!("Device sent an invalid response: {}", e);
            CommandError::from(e)
        })?;

        match &response {
            Response::Error { error_code, msg } => {
                info!(error_code, "Device rejected command: {}", msg);
                return Ok(reply);
            }
            other if other.kind() != kind.expected_response() => {
                warn!(
                    expected = ?kind.expected_response(),
                    actual = ?other.kind(),
                    "Device answered with the wrong response kind"
                );
                return Err(CommandError::from_code(ErrorCode::InvalidResponseJson));
            }
            _ => {}
        }

        if let Response::Data {
            periph_id,
            param_id,
            data,
            ..
        } = response
        {
            let target = validated
                .parameter()
                .ok_or_else(|| CommandError::from_code(ErrorCode::InvalidCmdParams))?;
            if (periph_id, param_id) != (target.peripheral_id, target.id) {
                warn!(
                    periph_id,
                    param_id,
                    expected_periph_id = target.peripheral_id,
                    expected_param_id = target.id,
                    "Device answered for a different parameter"
                );
                return Err(CommandError::from_code(ErrorCode::InvalidResponseJson));
            }
            if let Err(e) = self.directory.update_parameter_value(
                target.device_id,
                target.peripheral_id,
                target.id,
                data,
            ) {
                warn!(
                    device_id = target.device_id,
                    periph_id, param_id, "Failed to record value: {}", e
                );
            }
        }

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use hermes_core::types::DataValue;
    use hermes_devices::directory::Directory;
    use hermes_devices::RelayError;

    use super::*;
    use crate::testing::{seeded_directory, ScriptedRelay};

    #[tokio::test]
    async fn test_get_updates_last_value() {
        let directory = seeded_directory();
        let relay = ScriptedRelay::new(|_, _| {
            Ok(json!({"rsp_type": 3, "data": 42, "data_type": 1, "periph_id": 2, "param_id": 7}))
        });
        let session = CommandSession::new(directory.clone(), relay.clone());

        let reply = session
            .handle_text(r#"{"cmd_type":"GET","dev_id":5,"periph_id":2,"param_id":7}"#)
            .await;
        assert_eq!(reply["rsp_type"], 3);
        assert_eq!(reply["data"], 42);

        let calls = relay.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "http://127.0.0.1:8080/api");
        assert_eq!(
            calls[0].1,
            json!({"cmd_type": 1, "periph_id": 2, "param_id": 7, "data": 0, "data_type": 0})
        );
        assert_eq!(
            directory.resolve_parameter(5, 2, 7).unwrap().last_value,
            Some(DataValue::Integer(42))
        );
    }

    #[tokio::test]
    async fn test_data_for_another_parameter_is_rejected() {
        let directory = seeded_directory();
        let relay = ScriptedRelay::new(|_, _| {
            Ok(json!({"rsp_type": 3, "data": 1, "data_type": 1, "periph_id": 2, "param_id": 8}))
        });
        let session = CommandSession::new(directory.clone(), relay);

        let err = session
            .execute(&json!({"cmd_type": "GET", "dev_id": 5, "periph_id": 2, "param_id": 7}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidResponseJson);
        assert_eq!(directory.resolve_parameter(5, 2, 7).unwrap().last_value, None);
        assert_eq!(directory.resolve_parameter(5, 2, 8).unwrap().last_value, None);
    }

    #[tokio::test]
    async fn test_out_of_range_set_never_reaches_device() {
        let relay = ScriptedRelay::new(|_, _| Ok(json!({"rsp_type": 1, "periph_id": 2, "param_id": 7})));
        let session = CommandSession::new(seeded_directory(), relay.clone());

        let reply = session
            .handle(&json!({
                "cmd_type": "SET", "dev_id": 5, "periph_id": 2, "param_id": 7,
                "data": 999, "data_type": 2
            }))
            .await;
        assert_eq!(reply["rsp_type"], 2);
        assert_eq!(reply["error_code"], ErrorCode::InvalidDataValue.code());
        assert!(relay.calls().is_empty());
    }

    #[tokio::test]
    async fn test_device_error_forwarded_unchanged() {
        let device_error = json!({"rsp_type": 2, "error_code": 77, "msg": "busy"});
        let expected = device_error.clone();
        let relay = ScriptedRelay::new(move |_, _| Ok(device_error.clone()));
        let session = CommandSession::new(seeded_directory(), relay);

        let reply = session
            .handle(&json!({"cmd_type": "ACT", "dev_id": 5, "periph_id": 2, "param_id": 8}))
            .await;
        assert_eq!(reply, expected);
    }

    #[tokio::test]
    async fn test_wrong_reply_kind_is_invalid_response() {
        let relay = ScriptedRelay::new(|_, _| Ok(json!({"rsp_type": 1, "periph_id": 2, "param_id": 7})));
        let session = CommandSession::new(seeded_directory(), relay);

        let err = session
            .execute(&json!({"cmd_type": "GET", "dev_id": 5, "periph_id": 2, "param_id": 7}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidResponseJson);
    }

    #[tokio::test]
    async fn test_transport_failures_become_error_replies() {
        let relay = ScriptedRelay::new(|_, _| {
            Err(RelayError::Timeout(std::time::Duration::from_secs(10)))
        });
        let session = CommandSession::new(seeded_directory(), relay);

        let reply = session
            .handle(&json!({"cmd_type": "GET", "dev_id": 5, "periph_id": 2, "param_id": 7}))
            .await;
        assert_eq!(reply["error_code"], ErrorCode::HttpTimeout.code());

        let reply = session.handle_text("not json").await;
        assert_eq!(reply["error_code"], ErrorCode::InvalidJson.code());
    }

    #[tokio::test]
    async fn test_stream_rejected_on_command_endpoint() {
        let relay = ScriptedRelay::new(|_, _| Ok(json!({})));
        let session = CommandSession::new(seeded_directory(), relay.clone());

        let reply = session
            .handle(&json!({
                "cmd_type": "STREAM", "dev_id": 5, "periph_id": 2,
                "param_ids": [7], "rate": 1, "ext": "/s"
            }))
            .await;
        assert_eq!(reply["error_code"], ErrorCode::InvalidRequest.code());
        assert!(relay.calls().is_empty());
    }
}
