/*!
 * Telemetry stream bridge.
 *
 * Streaming runs in two phases. Negotiation validates a start message as a
 * STREAM command and computes the binary [`FrameLayout`] from the resolved
 * parameters. Bridging then runs as its own task: it opens a WebSocket to
 * the device, sends the STREAM request once and forwards every decoded frame
 * to the client until the client leaves, the device hangs up or too many
 * frames fail to decode.
 *
 * The task races its [`CancellationToken`] against every receive from the
 * device and every send to the client, so a stalled client cannot hold off
 * teardown and no frame reaches the client once teardown starts.
 * The device socket lives in a guard whose close is idempotent.
 */
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, trace, warn, Instrument};

use hermes_core::config::StreamConfig;
use hermes_core::logging::session_span;
use hermes_core::types::{DataValue, PeripheralId, SessionId};
use hermes_core::utils::spawn_and_log;
use hermes_devices::directory::SharedDirectory;
use hermes_devices::frame::FrameLayout;
use hermes_devices::protocol::{
    decode_response_str, CommandKind, DeviceRequest, ErrorCode, Response, ResponseKind,
};

use crate::builder::build_request;
use crate::error::{CommandError, Error, Result};
use crate::validator::{ValidatedCommand, Validator};

type DeviceSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A negotiated stream, ready to be bridged
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSession {
    /// Device stream URL
    pub url: String,
    /// STREAM request sent once the connection is open
    pub request: DeviceRequest,
    /// Peripheral owning the streamed parameters
    pub peripheral_id: PeripheralId,
    /// Frame layout derived from the parameters' wire types
    pub layout: FrameLayout,
}

/// Negotiate a stream session from a validated STREAM command
pub fn negotiate(validated: &ValidatedCommand) -> std::result::Result<StreamSession, CommandError> {
    if validated.command.kind() != CommandKind::Stream {
        return Err(CommandError::new(ErrorCode::InvalidRequest, "Not a stream command"));
    }

    let outbound = build_request(validated)?;
    let layout = FrameLayout::new(
        validated
            .resolved
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.data_type)),
    )?;

    debug!(
        url = %outbound.url,
        frame_len = layout.frame_len(),
        items = layout.item_count(),
        "Negotiated stream session"
    );

    Ok(StreamSession {
        url: outbound.url,
        request: outbound.body,
        peripheral_id: validated.command.peripheral_id(),
        layout,
    })
}

/// Why a bridge stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    /// The client went away or asked to stop
    Cancelled,
    /// The device closed the connection
    DeviceClosed,
    /// The device answered the STREAM request with an ERROR
    DeviceRejected,
    /// The decode error threshold was reached
    TooManyErrors,
    /// The client channel was closed
    ClientGone,
}

/// Counters of one bridge run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Telemetry records forwarded to the client
    pub frames_forwarded: u64,
    /// Frames that failed to decode and were skipped
    pub decode_errors: u32,
}

/// The final report of a bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeReport {
    /// Why the bridge stopped
    pub exit: BridgeExit,
    /// Counters at exit
    pub stats: BridgeStats,
}

/// The device side of a bridge; closing is idempotent
struct DeviceConnection {
    url: String,
    socket: Option<DeviceSocket>,
}

impl DeviceConnection {
    async fn open(url: &str) -> Result<Self> {
        let (socket, _response) = connect_async(url).await?;
        debug!(url, "Opened device stream connection");
        Ok(Self {
            url: url.to_string(),
            socket: Some(socket),
        })
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| Error::stream("device connection is closed"))?;
        socket.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_message(
        &mut self,
    ) -> Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> {
        match self.socket.as_mut() {
            Some(socket) => socket.next().await,
            None => None,
        }
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                trace!(url = %self.url, "Device close handshake failed: {}", e);
            }
            debug!(url = %self.url, "Closed device stream connection");
        }
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        if self.socket.take().is_some() {
            debug!(url = %self.url, "Device stream connection dropped without close handshake");
        }
    }
}

/// The bridging task state
struct Bridge {
    session: StreamSession,
    config: StreamConfig,
    client: mpsc::Sender<Value>,
    cancel: CancellationToken,
    stats: BridgeStats,
}

impl Bridge {
    fn report(&self, exit: BridgeExit) -> BridgeReport {
        BridgeReport {
            exit,
            stats: self.stats.clone(),
        }
    }

    async fn run(mut self) -> Result<BridgeReport> {
        let url = self.session.url.clone();
        let connection = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(self.report(BridgeExit::Cancelled)),
            connection = DeviceConnection::open(&url) => connection,
        };
        let mut connection = match connection {
            Ok(connection) => connection,
            Err(e) => {
                warn!(%url, "Failed to open device stream: {}", e);
                self.forward(CommandError::from_code(ErrorCode::InvalidUrl).to_response())
                    .await;
                return Err(e);
            }
        };

        let result = self.pump(&mut connection).await;
        connection.close().await;

        match &result {
            Ok(report) => info!(
                exit = ?report.exit,
                frames = report.stats.frames_forwarded,
                decode_errors = report.stats.decode_errors,
                "Stream bridge stopped"
            ),
            Err(e) => warn!("Stream bridge failed: {}", e),
        }
        result
    }

    async fn pump(&mut self, connection: &mut DeviceConnection) -> Result<BridgeReport> {
        connection
            .send_text(self.session.request.to_json().to_string())
            .await?;

        let receive_timeout = self.config.receive_timeout().max(Duration::from_millis(1));
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(self.report(BridgeExit::Cancelled)),
                received = timeout(receive_timeout, connection.next_message()) => received,
            };

            let message = match received {
                Err(_) => {
                    trace!("No frame within {:?}", receive_timeout);
                    continue;
                }
                Ok(None) => return Ok(self.report(BridgeExit::DeviceClosed)),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(message))) => message,
            };

            let is_frame = matches!(message, Message::Binary(_));
            let outbound = match message {
                Message::Binary(frame) => match self.session.layout.decode(&frame) {
                    Ok(values) => self.telemetry(values),
                    Err(e) => {
                        if let Some(exit) = self.decode_failed(&e.to_string()) {
                            return Ok(self.report(exit));
                        }
                        continue;
                    }
                },
                Message::Text(text) => match decode_response_str(&text) {
                    Ok(Response::Error { error_code, msg }) => {
                        warn!(error_code, "Device rejected stream: {}", msg);
                        let exit = self
                            .forward(json_or_string(&text))
                            .await
                            .unwrap_or(BridgeExit::DeviceRejected);
                        return Ok(self.report(exit));
                    }
                    Ok(response) => {
                        if let Response::Stream {
                            frame_len: Some(declared),
                            ..
                        } = &response
                        {
                            self.session.layout = self.session.layout.clone().with_declared_len(*declared);
                        }
                        debug!(kind = ?response.kind(), "Device stream reply");
                        json_or_string(&text)
                    }
                    Err(e) => {
                        if let Some(exit) = self.decode_failed(&e.to_string()) {
                            return Ok(self.report(exit));
                        }
                        continue;
                    }
                },
                Message::Close(_) => return Ok(self.report(BridgeExit::DeviceClosed)),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };

            if let Some(exit) = self.forward(outbound).await {
                return Ok(self.report(exit));
            }
            if is_frame {
                self.stats.frames_forwarded += 1;
            }
        }
    }

    /// Count a decode failure; returns an exit once the threshold is reached
    fn decode_failed(&mut self, reason: &str) -> Option<BridgeExit> {
        self.stats.decode_errors += 1;
        warn!(
            errors = self.stats.decode_errors,
            limit = self.config.max_decode_errors,
            "Skipping undecodable stream frame: {}",
            reason
        );
        (self.stats.decode_errors >= self.config.max_decode_errors).then_some(BridgeExit::TooManyErrors)
    }

    fn telemetry(&self, values: Vec<(String, DataValue)>) -> Value {
        let data: Vec<Value> = values
            .into_iter()
            .map(|(name, value)| json!({ "name": name, "value": value.to_json() }))
            .collect();
        json!({
            "rsp_type": ResponseKind::Stream.code(),
            "stream": true,
            "periph_id": self.session.peripheral_id,
            "data": data,
        })
    }

    /// Hand one message to the client; returns an exit if the bridge must stop
    ///
    /// A full client channel must not hold off cancellation.
    async fn forward(&self, message: Value) -> Option<BridgeExit> {
        if self.cancel.is_cancelled() {
            return Some(BridgeExit::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Some(BridgeExit::Cancelled),
            sent = self.client.send(message) => sent.err().map(|_| BridgeExit::ClientGone),
        }
    }
}

fn json_or_string(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// A running bridge
///
/// Dropping the handle cancels the bridge without waiting for it.
#[derive(Debug)]
pub struct StreamHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<BridgeReport>>,
    _guard: DropGuard,
}

impl StreamHandle {
    /// Whether the bridge task has stopped on its own
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the bridge and wait until it has released the device connection
    pub async fn shutdown(self) -> Result<BridgeReport> {
        self.cancel.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(Error::stream(format!("stream bridge task failed: {}", e))),
        }
    }
}

/// Start bridging a negotiated session, forwarding to `client`
pub fn spawn_bridge(
    session: StreamSession,
    config: StreamConfig,
    client: mpsc::Sender<Value>,
    session_id: &SessionId,
) -> StreamHandle {
    let cancel = CancellationToken::new();
    let bridge = Bridge {
        session,
        config,
        client,
        cancel: cancel.clone(),
        stats: BridgeStats::default(),
    };

    let task = spawn_and_log(
        "stream-bridge",
        bridge.run().instrument(session_span("stream", session_id)),
    );

    StreamHandle {
        _guard: cancel.clone().drop_guard(),
        cancel,
        task,
    }
}

/// The stream endpoint of one client
///
/// Owns at most one bridge at a time. Replies and telemetry are delivered
/// through the channel returned by [`StreamConsumer::channel`].
#[derive(Debug)]
pub struct StreamConsumer {
    id: SessionId,
    validator: Validator,
    config: StreamConfig,
    client: mpsc::Sender<Value>,
    bridge: Option<StreamHandle>,
}

impl StreamConsumer {
    /// Create a consumer and the receiving end of its client channel
    pub fn channel(directory: SharedDirectory, config: StreamConfig) -> (Self, mpsc::Receiver<Value>) {
        let (client, receiver) = mpsc::channel(config.client_buffer.max(1));
        let validator = Validator::new(directory).with_max_rate_tier(config.max_rate_tier);
        (
            Self {
                id: SessionId::new(),
                validator,
                config,
                client,
                bridge: None,
            },
            receiver,
        )
    }

    /// The session id
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Whether a bridge is currently running
    pub fn is_streaming(&self) -> bool {
        self.bridge.as_ref().map(|b| !b.is_finished()).unwrap_or(false)
    }

    /// Handle a start message received as text
    pub async fn receive_text(&mut self, text: &str) -> std::result::Result<(), CommandError> {
        match serde_json::from_str::<Value>(text) {
            Ok(request) => self.receive(&request).await,
            Err(_) => self.reject(CommandError::from_code(ErrorCode::InvalidJson)).await,
        }
    }

    /// Handle a start message
    ///
    /// Failures are sent to the client as ERROR responses and also returned.
    pub async fn receive(&mut self, request: &Value) -> std::result::Result<(), CommandError> {
        if self.is_streaming() {
            return self
                .reject(CommandError::new(
                    ErrorCode::InvalidRequest,
                    "A stream is already running",
                ))
                .await;
        }
        if let Some(finished) = self.bridge.take() {
            if let Err(e) = finished.shutdown().await {
                debug!("Previous stream bridge ended with error: {}", e);
            }
        }

        let session = match self
            .validator
            .validate_as(CommandKind::Stream, request)
            .and_then(|validated| negotiate(&validated))
        {
            Ok(session) => session,
            Err(err) => return self.reject(err).await,
        };

        info!(url = %session.url, "Starting stream bridge");
        self.bridge = Some(spawn_bridge(
            session,
            self.config.clone(),
            self.client.clone(),
            &self.id,
        ));
        Ok(())
    }

    async fn reject(&self, err: CommandError) -> std::result::Result<(), CommandError> {
        debug!(code = %err.code, "Rejecting stream request: {}", err.message);
        let _ = self.client.send(err.to_response()).await;
        Err(err)
    }

    /// Tear down the bridge, if any, and wait for it to finish
    pub async fn disconnect(&mut self) -> Option<BridgeReport> {
        let bridge = self.bridge.take()?;
        match bridge.shutdown().await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Stream bridge ended with error: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use hermes_devices::directory::{Directory, ParameterRecord};
    use hermes_devices::protocol::{DataType, Methods};

    use super::*;
    use crate::testing::seeded_directory;

    fn stream_request(ids: Value) -> Value {
        json!({"dev_id": 5, "periph_id": 2, "param_ids": ids, "rate": 3, "ext": "/stream"})
    }

    #[test]
    fn test_negotiate_builds_layout() {
        let directory = seeded_directory();
        let validated = Validator::new(directory)
            .validate_as(CommandKind::Stream, &stream_request(json!([7])))
            .unwrap();
        let session = negotiate(&validated).unwrap();
        assert_eq!(session.url, "ws://127.0.0.1:8080/stream");
        assert_eq!(session.peripheral_id, 2);
        assert_eq!(session.layout.item_count(), 1);
        assert_eq!(session.layout.frame_len(), 2);
        assert_eq!(
            session.request.to_json(),
            json!({"cmd_type": 5, "periph_id": 2, "param_ids": [7], "rate": 3})
        );
    }

    #[test]
    fn test_negotiate_rejects_unframeable_parameter() {
        let directory = seeded_directory();
        directory
            .create_parameter(ParameterRecord::new(
                5,
                2,
                9,
                "label",
                Methods::GET | Methods::STREAM,
                0,
                DataType::String,
            ))
            .unwrap();
        let validated = Validator::new(directory)
            .validate_as(CommandKind::Stream, &stream_request(json!([7, 9])))
            .unwrap();
        assert_eq!(
            negotiate(&validated).unwrap_err().code,
            ErrorCode::InvalidDataType
        );
    }

    #[test]
    fn test_negotiate_requires_stream_command() {
        let validated = Validator::new(seeded_directory())
            .validate(&json!({"cmd_type": "GET", "dev_id": 5, "periph_id": 2, "param_id": 7}))
            .unwrap();
        assert_eq!(
            negotiate(&validated).unwrap_err().code,
            ErrorCode::InvalidRequest
        );
    }

    #[tokio::test]
    async fn test_consumer_reports_validation_errors() {
        let (mut consumer, mut replies) =
            StreamConsumer::channel(seeded_directory(), StreamConfig::default());

        let err = consumer
            .receive(&stream_request(json!([])))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply["error_code"], ErrorCode::InvalidRequest.code());
        assert!(!consumer.is_streaming());
        assert!(consumer.disconnect().await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_device_reports_invalid_url() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let session = StreamSession {
            url: format!("ws://127.0.0.1:{}/stream", port),
            request: DeviceRequest::stream(2, vec![7], hermes_devices::StreamRate::MAX),
            peripheral_id: 2,
            layout: FrameLayout::new([("x", DataType::Int8)]).unwrap(),
        };
        let (client, mut replies) = mpsc::channel(4);
        let handle = spawn_bridge(session, StreamConfig::default(), client, &SessionId::new());

        let reply = replies.recv().await.unwrap();
        assert_eq!(reply["error_code"], ErrorCode::InvalidUrl.code());
        assert!(handle.shutdown().await.is_err());
    }
}
