/*!
 * Device discovery for Hermes.
 *
 * A crawl enumerates an unknown device through sequential INFO requests
 * (device root, then each peripheral, then each of its parameters) and
 * persists what it learned. Progress is reported as a finite sequence of
 * [`CrawlEvent`]s ending with exactly one [`CrawlEvent::Finished`].
 *
 * A failure on the device root aborts the crawl. A failure on a peripheral or
 * parameter is reported, marks the crawl failed and enumeration continues
 * with the next node. Persistence is best-effort in the same way.
 */
use std::fmt;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use hermes_core::config::DiscoveryConfig;
use hermes_core::logging::{operation_span, session_span};
use hermes_core::types::{DeviceId, ParameterId, PeripheralId, SessionId};
use hermes_devices::directory::{
    DeviceRecord, ParameterRecord, PeripheralRecord, SharedDirectory,
};
use hermes_devices::protocol::{
    decode_response, DeviceInfo, DeviceRequest, InfoBody, Methods, ParameterInfo, PeripheralInfo,
    Response,
};
use hermes_devices::relay::SharedRelay;

use crate::builder::{device_url, Scheme};

/// Progress code: a phase is running
pub const CODE_PROGRESS: u16 = 1;
/// Progress code: a node was enumerated
pub const CODE_SUCCESS: u16 = 200;
/// Progress code: a record was created, or the crawl succeeded
pub const CODE_CREATED: u16 = 201;
/// Progress code: something failed
pub const CODE_FAILURE: u16 = 506;

/// Where to find the device to enumerate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlTrigger {
    /// Host name or IP address
    pub address: String,
    /// Command API port
    pub port: u16,
    /// Command endpoint path
    pub extension: String,
}

impl CrawlTrigger {
    /// Parse a client trigger message
    ///
    /// `ip_addr` is accepted in place of `address`, and the port may be sent
    /// as a number or a numeric string.
    pub fn from_json(value: &Value) -> Result<Self, String> {
        let address = value
            .get("address")
            .or_else(|| value.get("ip_addr"))
            .and_then(Value::as_str)
            .ok_or("Missing initial data: address")?;
        let port = match value.get("port") {
            Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
            Some(_) => None,
            None => return Err("Missing initial data: port".to_string()),
        }
        .ok_or("Invalid port")?;
        let extension = value
            .get("extension")
            .and_then(Value::as_str)
            .ok_or("Missing initial data: extension")?;

        Ok(Self {
            address: address.to_string(),
            port,
            extension: extension.to_string(),
        })
    }

    /// The device command URL
    pub fn url(&self) -> String {
        device_url(Scheme::Http, &self.address, self.port, &self.extension)
    }
}

/// A record touched during persistence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    /// A device
    Device(DeviceId),
    /// A peripheral of a device
    Peripheral(DeviceId, PeripheralId),
    /// A parameter of a peripheral
    Parameter(DeviceId, PeripheralId, ParameterId),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Device(d) => write!(f, "Device [{}]", d),
            Entity::Peripheral(d, p) => write!(f, "Peripheral [{}/{}]", d, p),
            Entity::Parameter(d, p, q) => write!(f, "Parameter [{}/{}/{}]", d, p, q),
        }
    }
}

/// Overall result of a crawl
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// Every node was enumerated and persisted
    Succeeded {
        /// The enumerated device
        device_id: DeviceId,
    },
    /// Something failed; see the preceding events
    Failed {
        /// Summary of the first failure
        reason: String,
    },
}

impl CrawlOutcome {
    /// Whether the crawl succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, CrawlOutcome::Succeeded { .. })
    }
}

/// One progress notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlEvent {
    /// Enumeration of the device at `url` started
    Started {
        /// Device command URL
        url: String,
    },
    /// The device root answered
    DeviceFound {
        /// Device id
        device_id: DeviceId,
        /// Device name
        name: String,
        /// Declared peripheral count
        peripheral_count: u32,
    },
    /// The device root could not be enumerated
    DeviceFailed {
        /// What went wrong
        reason: String,
    },
    /// A peripheral answered
    PeripheralFound {
        /// Peripheral id
        peripheral_id: PeripheralId,
        /// Peripheral name
        name: String,
        /// Declared parameter count
        parameter_count: u32,
    },
    /// A peripheral could not be enumerated
    PeripheralFailed {
        /// Peripheral id
        peripheral_id: PeripheralId,
        /// What went wrong
        reason: String,
    },
    /// A parameter answered
    ParameterFound {
        /// Owning peripheral
        peripheral_id: PeripheralId,
        /// Parameter id
        parameter_id: ParameterId,
        /// Parameter name
        name: String,
    },
    /// A parameter could not be enumerated
    ParameterFailed {
        /// Owning peripheral
        peripheral_id: PeripheralId,
        /// Parameter id
        parameter_id: ParameterId,
        /// What went wrong
        reason: String,
    },
    /// Enumeration finished, persistence started
    Persisting,
    /// A record was created
    Created(Entity),
    /// A record could not be created
    CreateFailed {
        /// The record
        entity: Entity,
        /// What went wrong
        reason: String,
    },
    /// The crawl is over; always the last event
    Finished(CrawlOutcome),
}

impl CrawlEvent {
    /// Progress code of this event
    pub fn code(&self) -> u16 {
        match self {
            CrawlEvent::Started { .. } | CrawlEvent::Persisting => CODE_PROGRESS,
            CrawlEvent::DeviceFound { .. }
            | CrawlEvent::PeripheralFound { .. }
            | CrawlEvent::ParameterFound { .. } => CODE_SUCCESS,
            CrawlEvent::Created(_) => CODE_CREATED,
            CrawlEvent::Finished(outcome) if outcome.is_success() => CODE_CREATED,
            CrawlEvent::DeviceFailed { .. }
            | CrawlEvent::PeripheralFailed { .. }
            | CrawlEvent::ParameterFailed { .. }
            | CrawlEvent::CreateFailed { .. }
            | CrawlEvent::Finished(_) => CODE_FAILURE,
        }
    }

    /// Whether this is the terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, CrawlEvent::Finished(_))
    }

    /// Render the progress message sent to the client
    pub fn to_client_message(&self) -> Value {
        json!({ "data": self.to_string(), "code": self.code() })
    }
}

impl fmt::Display for CrawlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlEvent::Started { url } => write!(f, "> Enumerating device at [{}]", url),
            CrawlEvent::DeviceFound {
                device_id,
                name,
                peripheral_count,
            } => write!(
                f,
                "Found device '{}' [{}] with {} peripherals",
                name, device_id, peripheral_count
            ),
            CrawlEvent::DeviceFailed { reason } => write!(f, "Device info failed: {}", reason),
            CrawlEvent::PeripheralFound {
                peripheral_id,
                name,
                parameter_count,
            } => write!(
                f,
                "- Found peripheral '{}' [{}] with {} parameters",
                name, peripheral_id, parameter_count
            ),
            CrawlEvent::PeripheralFailed {
                peripheral_id,
                reason,
            } => write!(f, "- Peripheral [{}] failed: {}", peripheral_id, reason),
            CrawlEvent::ParameterFound {
                peripheral_id,
                parameter_id,
                name,
            } => write!(
                f,
                "- - Found parameter '{}' [{}/{}]",
                name, peripheral_id, parameter_id
            ),
            CrawlEvent::ParameterFailed {
                peripheral_id,
                parameter_id,
                reason,
            } => write!(
                f,
                "- - Parameter [{}/{}] failed: {}",
                peripheral_id, parameter_id, reason
            ),
            CrawlEvent::Persisting => f.write_str("Engaging database... standby"),
            CrawlEvent::Created(entity) => write!(f, "- - - Created new {}", entity),
            CrawlEvent::CreateFailed { entity, reason } => {
                write!(f, "- - - Failed to create {}: {}", entity, reason)
            }
            CrawlEvent::Finished(CrawlOutcome::Succeeded { .. }) => {
                f.write_str("Successfully enumerated device!")
            }
            CrawlEvent::Finished(CrawlOutcome::Failed { reason }) => {
                write!(f, "Failed to enumerate device: {}", reason)
            }
        }
    }
}

/// A running crawl
#[derive(Debug)]
pub struct CrawlHandle {
    /// Progress events, ending with [`CrawlEvent::Finished`]
    pub events: mpsc::Receiver<CrawlEvent>,
    /// The crawl task
    pub task: JoinHandle<CrawlOutcome>,
}

/// A peripheral enumerated during the crawl, with its parameters
#[derive(Debug)]
struct PeripheralNode {
    info: PeripheralInfo,
    parameters: Vec<ParameterInfo>,
}

/// Emits events and remembers the first failure
struct Progress {
    sender: mpsc::Sender<CrawlEvent>,
    failure: Option<String>,
}

impl Progress {
    async fn emit(&mut self, event: CrawlEvent) {
        if let Some(reason) = match &event {
            CrawlEvent::DeviceFailed { reason } => Some(reason.clone()),
            CrawlEvent::PeripheralFailed {
                peripheral_id,
                reason,
            } => Some(format!("peripheral {}: {}", peripheral_id, reason)),
            CrawlEvent::ParameterFailed {
                peripheral_id,
                parameter_id,
                reason,
            } => Some(format!(
                "parameter {}/{}: {}",
                peripheral_id, parameter_id, reason
            )),
            CrawlEvent::CreateFailed { entity, reason } => Some(format!("{}: {}", entity, reason)),
            _ => None,
        } {
            self.failure.get_or_insert(reason);
        }

        debug!("Crawl progress: {}", event);
        if self.sender.send(event).await.is_err() {
            debug!("Crawl progress receiver dropped");
        }
    }

    async fn finish(mut self, device_id: Option<DeviceId>) -> CrawlOutcome {
        let outcome = match (self.failure.take(), device_id) {
            (None, Some(device_id)) => CrawlOutcome::Succeeded { device_id },
            (Some(reason), _) => CrawlOutcome::Failed { reason },
            (None, None) => CrawlOutcome::Failed {
                reason: "device was not enumerated".to_string(),
            },
        };
        self.emit(CrawlEvent::Finished(outcome.clone())).await;
        outcome
    }
}

/// Enumerates devices and persists them in the directory
#[derive(Debug, Clone)]
pub struct Crawler {
    relay: SharedRelay,
    directory: SharedDirectory,
    config: DiscoveryConfig,
}

impl Crawler {
    /// Create a crawler
    pub fn new(relay: SharedRelay, directory: SharedDirectory, config: DiscoveryConfig) -> Self {
        Self {
            relay,
            directory,
            config,
        }
    }

    /// Start a crawl from a raw client trigger message
    pub fn start(&self, trigger: &Value) -> CrawlHandle {
        let (sender, events) = mpsc::channel(self.config.progress_buffer.max(1));
        let crawler = self.clone();
        let trigger = CrawlTrigger::from_json(trigger);
        let span = session_span("discovery", &SessionId::new());

        let task = tokio::spawn(
            async move {
                let mut progress = Progress {
                    sender,
                    failure: None,
                };
                match trigger {
                    Ok(trigger) => crawler.run(&trigger, progress).await,
                    Err(reason) => {
                        warn!("Rejecting crawl trigger: {}", reason);
                        progress.failure = Some(reason);
                        progress.finish(None).await
                    }
                }
            }
            .instrument(span),
        );

        CrawlHandle { events, task }
    }

    /// Crawl a device, reporting through `sender`
    pub async fn crawl(&self, trigger: &CrawlTrigger, sender: mpsc::Sender<CrawlEvent>) -> CrawlOutcome {
        let progress = Progress {
            sender,
            failure: None,
        };
        self.run(trigger, progress).await
    }

    async fn run(&self, trigger: &CrawlTrigger, mut progress: Progress) -> CrawlOutcome {
        let url = trigger.url();
        info!(%url, "Enumerating device");
        progress.emit(CrawlEvent::Started { url: url.clone() }).await;

        let device = match self.request_info(&url, DeviceRequest::info(0, 0)).await {
            Ok(body) => match body.device() {
                Ok(device) => device,
                Err(e) => {
                    return self.abort(progress, e.to_string()).await;
                }
            },
            Err(reason) => return self.abort(progress, reason).await,
        };

        if self.directory.device_exists(device.dev_id) {
            let reason = format!("device {} is already registered", device.dev_id);
            return self.abort(progress, reason).await;
        }

        progress
            .emit(CrawlEvent::DeviceFound {
                device_id: device.dev_id,
                name: device.name.clone(),
                peripheral_count: device.periph_num,
            })
            .await;
        if device.periph_num as usize != device.periph_ids.len() {
            warn!(
                declared = device.periph_num,
                listed = device.periph_ids.len(),
                "Device peripheral count does not match its id list"
            );
        }

        let mut peripherals = Vec::with_capacity(device.periph_ids.len());
        for &peripheral_id in &device.periph_ids {
            if let Some(node) = self.crawl_peripheral(&url, peripheral_id, &mut progress).await {
                peripherals.push(node);
            }
        }

        progress.emit(CrawlEvent::Persisting).await;
        self.persist(trigger, &device, &peripherals, &mut progress)
            .instrument(operation_span("persist", "discovery"))
            .await;

        let outcome = progress.finish(Some(device.dev_id)).await;
        if outcome.is_success() {
            info!(device_id = device.dev_id, "Device enumerated");
        } else {
            warn!(device_id = device.dev_id, "Device enumeration incomplete");
        }
        outcome
    }

    async fn abort(&self, mut progress: Progress, reason: String) -> CrawlOutcome {
        error!("Device enumeration aborted: {}", reason);
        progress.emit(CrawlEvent::DeviceFailed { reason }).await;
        progress.finish(None).await
    }

    async fn crawl_peripheral(
        &self,
        url: &str,
        peripheral_id: PeripheralId,
        progress: &mut Progress,
    ) -> Option<PeripheralNode> {
        let info = match self
            .request_info(url, DeviceRequest::info(peripheral_id, 0))
            .await
            .and_then(|body| body.peripheral().map_err(|e| e.to_string()))
            .and_then(|info| match info.periph_id {
                id if id == peripheral_id => Ok(info),
                id => Err(format!("answered as peripheral {}", id)),
            })
        {
            Ok(info) => info,
            Err(reason) => {
                progress
                    .emit(CrawlEvent::PeripheralFailed {
                        peripheral_id,
                        reason,
                    })
                    .await;
                return None;
            }
        };

        progress
            .emit(CrawlEvent::PeripheralFound {
                peripheral_id,
                name: info.name.clone(),
                parameter_count: info.param_num,
            })
            .await;

        let mut parameters = Vec::with_capacity(info.param_ids.len());
        for &parameter_id in &info.param_ids {
            match self
                .request_info(url, DeviceRequest::info(peripheral_id, parameter_id))
                .await
                .and_then(|body| body.parameter().map_err(|e| e.to_string()))
                .and_then(|parameter| match parameter.param_id {
                    id if id == parameter_id => Ok(parameter),
                    id => Err(format!("answered as parameter {}", id)),
                })
            {
                Ok(parameter) => {
                    progress
                        .emit(CrawlEvent::ParameterFound {
                            peripheral_id,
                            parameter_id,
                            name: parameter.name.clone(),
                        })
                        .await;
                    parameters.push(parameter);
                }
                Err(reason) => {
                    progress
                        .emit(CrawlEvent::ParameterFailed {
                            peripheral_id,
                            parameter_id,
                            reason,
                        })
                        .await;
                }
            }
        }

        Some(PeripheralNode { info, parameters })
    }

    /// One INFO round trip; any non-INFO outcome is a failure reason
    async fn request_info(&self, url: &str, request: DeviceRequest) -> Result<InfoBody, String> {
        let reply = self
            .relay
            .post(url, &request.to_json())
            .await
            .map_err(|e| e.to_string())?;
        match decode_response(&reply).map_err(|e| e.to_string())? {
            Response::Info(body) => Ok(body),
            Response::Error { error_code, msg } => {
                Err(format!("device error {}: {}", error_code, msg))
            }
            other => Err(format!("unexpected {:?} response", other.kind())),
        }
    }

    async fn persist(
        &self,
        trigger: &CrawlTrigger,
        device: &DeviceInfo,
        peripherals: &[PeripheralNode],
        progress: &mut Progress,
    ) {
        let now = Utc::now();
        let device_id = device.dev_id;
        let mut record = DeviceRecord::new(
            device_id,
            device.name.clone(),
            trigger.address.clone(),
            trigger.port,
            trigger.extension.clone(),
        )
        .with_peripheral_count(device.periph_num);
        record.dev_type = device.dev_type.clone().unwrap_or_default();
        record.mac_address = device.mac_address.clone();
        record.last_polled = now;
        record.setup_date = now;
        self.report(self.directory.create_device(record), Entity::Device(device_id), progress)
            .await;

        for node in peripherals {
            let peripheral_id = node.info.periph_id;
            let mut record = PeripheralRecord::new(device_id, peripheral_id, node.info.name.clone());
            record.parameter_count = node.info.param_num;
            record.periph_type = node.info.periph_type;
            self.report(
                self.directory.create_peripheral(record),
                Entity::Peripheral(device_id, peripheral_id),
                progress,
            )
            .await;

            for parameter in &node.parameters {
                let mut record = ParameterRecord::new(
                    device_id,
                    peripheral_id,
                    parameter.param_id,
                    parameter.name.clone(),
                    Methods::from_bits(parameter.methods),
                    parameter.param_max,
                    parameter.data_type,
                );
                record.units = parameter.units.clone();
                self.report(
                    self.directory.create_parameter(record),
                    Entity::Parameter(device_id, peripheral_id, parameter.param_id),
                    progress,
                )
                .await;
            }
        }
    }

    async fn report<E: fmt::Display>(
        &self,
        result: Result<(), E>,
        entity: Entity,
        progress: &mut Progress,
    ) {
        match result {
            Ok(()) => progress.emit(CrawlEvent::Created(entity)).await,
            Err(e) => {
                warn!("Failed to create {}: {}", entity, e);
                progress
                    .emit(CrawlEvent::CreateFailed {
                        entity,
                        reason: e.to_string(),
                    })
                    .await
            }
        }
    }
}
