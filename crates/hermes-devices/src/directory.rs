/*!
 * Device directory for Hermes.
 *
 * The directory holds the persisted device, peripheral and parameter records.
 * The gateway core only needs a narrow view of it (lookups, creation during
 * discovery and last-value updates), expressed by the [`Directory`] trait.
 * [`InMemoryDirectory`] is the bundled implementation.
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use hermes_core::types::{DataValue, DeviceId, ParameterId, PeripheralId};

use crate::protocol::{DataType, Methods};

/// Error type for directory operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// A record with the same key already exists
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The parent record of a new record does not exist
    #[error("Parent of {0} does not exist")]
    MissingParent(String),

    /// The record to update does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// The directory lock was poisoned by a panicking writer
    #[error("Directory lock poisoned")]
    LockPoisoned,
}

/// A persisted device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device id
    pub id: DeviceId,
    /// Device name
    pub name: String,
    /// Network address (host name or IP)
    pub address: String,
    /// Command API port
    pub port: u16,
    /// Command endpoint path
    pub cmd_path: String,
    /// Declared peripheral count
    pub peripheral_count: u32,
    /// Device type tag
    pub dev_type: String,
    /// Hardware address, when reported
    pub mac_address: Option<String>,
    /// Whether the device was powered when last seen
    pub is_powered: bool,
    /// Sleep state reported by the device
    pub sleep_state: u8,
    /// Last time the device answered
    pub last_polled: DateTime<Utc>,
    /// Time the device was enumerated
    pub setup_date: DateTime<Utc>,
}

impl DeviceRecord {
    /// Create a device record at the given endpoint
    pub fn new<N, A, P>(id: DeviceId, name: N, address: A, port: u16, cmd_path: P) -> Self
    where
        N: Into<String>,
        A: Into<String>,
        P: Into<String>,
    {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            address: address.into(),
            port,
            cmd_path: cmd_path.into(),
            peripheral_count: 0,
            dev_type: String::new(),
            mac_address: None,
            is_powered: true,
            sleep_state: 0,
            last_polled: now,
            setup_date: now,
        }
    }

    /// Set the declared peripheral count
    pub fn with_peripheral_count(mut self, count: u32) -> Self {
        self.peripheral_count = count;
        self
    }
}

/// A persisted peripheral
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralRecord {
    /// Peripheral id, local to the device
    pub id: PeripheralId,
    /// Parent device
    pub device_id: DeviceId,
    /// Peripheral name
    pub name: String,
    /// Declared parameter count
    pub parameter_count: u32,
    /// Peripheral type tag
    pub periph_type: u32,
}

impl PeripheralRecord {
    /// Create a peripheral record
    pub fn new<N: Into<String>>(device_id: DeviceId, id: PeripheralId, name: N) -> Self {
        Self {
            id,
            device_id,
            name: name.into(),
            parameter_count: 0,
            periph_type: 0,
        }
    }
}

/// A persisted parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    /// Parameter id, local to the peripheral
    pub id: ParameterId,
    /// Device owning the parent peripheral
    pub device_id: DeviceId,
    /// Parent peripheral
    pub peripheral_id: PeripheralId,
    /// Parameter name
    pub name: String,
    /// Declared maximum value
    pub max_value: i64,
    /// Wire data type
    pub data_type: DataType,
    /// Capability bitmask
    pub methods: Methods,
    /// Readable
    pub is_gettable: bool,
    /// Writable
    pub is_settable: bool,
    /// Triggerable
    pub is_action: bool,
    /// Streamable
    pub is_streamable: bool,
    /// Unit label
    pub units: Option<String>,
    /// Last value observed from the device
    pub last_value: Option<DataValue>,
}

impl ParameterRecord {
    /// Create a parameter record, deriving the capability flags from `methods`
    pub fn new<N: Into<String>>(
        device_id: DeviceId,
        peripheral_id: PeripheralId,
        id: ParameterId,
        name: N,
        methods: Methods,
        max_value: i64,
        data_type: DataType,
    ) -> Self {
        Self {
            id,
            device_id,
            peripheral_id,
            name: name.into(),
            max_value,
            data_type,
            methods,
            is_gettable: methods.contains(Methods::GET),
            is_settable: methods.contains(Methods::SET),
            is_action: methods.contains(Methods::ACTION),
            is_streamable: methods.contains(Methods::STREAM),
            units: None,
            last_value: None,
        }
    }
}

/// Event types for directory changes
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    /// A device was created
    DeviceCreated(DeviceId),
    /// A peripheral was created
    PeripheralCreated(DeviceId, PeripheralId),
    /// A parameter was created
    ParameterCreated(DeviceId, PeripheralId, ParameterId),
    /// A parameter's last value changed
    ParameterUpdated {
        /// Owning device
        device_id: DeviceId,
        /// Owning peripheral
        peripheral_id: PeripheralId,
        /// Parameter
        parameter_id: ParameterId,
        /// New value
        value: DataValue,
    },
}

/// The persistence collaborator consumed by the gateway core
///
/// Implementations serialize writes internally; a reader never observes a
/// partially applied write.
pub trait Directory: Send + Sync + Debug {
    /// Look up a device
    fn resolve_device(&self, id: DeviceId) -> Option<DeviceRecord>;

    /// Look up a peripheral of a device
    fn resolve_peripheral(&self, device_id: DeviceId, id: PeripheralId) -> Option<PeripheralRecord>;

    /// Look up a parameter of a peripheral
    fn resolve_parameter(
        &self,
        device_id: DeviceId,
        peripheral_id: PeripheralId,
        id: ParameterId,
    ) -> Option<ParameterRecord>;

    /// Record the last value observed for a parameter
    fn update_parameter_value(
        &self,
        device_id: DeviceId,
        peripheral_id: PeripheralId,
        id: ParameterId,
        value: DataValue,
    ) -> Result<(), DirectoryError>;

    /// Persist a new device
    fn create_device(&self, record: DeviceRecord) -> Result<(), DirectoryError>;

    /// Persist a new peripheral; its device must exist
    fn create_peripheral(&self, record: PeripheralRecord) -> Result<(), DirectoryError>;

    /// Persist a new parameter; its peripheral must exist
    fn create_parameter(&self, record: ParameterRecord) -> Result<(), DirectoryError>;

    /// Whether a device is known
    fn device_exists(&self, id: DeviceId) -> bool {
        self.resolve_device(id).is_some()
    }
}

/// A shared handle to a directory
pub type SharedDirectory = Arc<dyn Directory>;

#[derive(Debug, Default)]
struct Tables {
    devices: HashMap<DeviceId, DeviceRecord>,
    peripherals: HashMap<(DeviceId, PeripheralId), PeripheralRecord>,
    parameters: HashMap<(DeviceId, PeripheralId, ParameterId), ParameterRecord>,
}

/// Directory kept in process memory
#[derive(Debug)]
pub struct InMemoryDirectory {
    tables: RwLock<Tables>,
    event_sender: broadcast::Sender<DirectoryEvent>,
}

impl InMemoryDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            tables: RwLock::new(Tables::default()),
            event_sender,
        }
    }

    /// Create an empty directory behind a shared handle
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Subscribe to directory change events
    pub fn subscribe(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.event_sender.subscribe()
    }

    /// Number of stored devices
    pub fn device_count(&self) -> usize {
        self.read(|t| t.devices.len()).unwrap_or(0)
    }

    /// Number of stored peripherals
    pub fn peripheral_count(&self) -> usize {
        self.read(|t| t.peripherals.len()).unwrap_or(0)
    }

    /// Number of stored parameters
    pub fn parameter_count(&self) -> usize {
        self.read(|t| t.parameters.len()).unwrap_or(0)
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Option<T> {
        match self.tables.read() {
            Ok(tables) => Some(f(&tables)),
            Err(_) => {
                warn!("Failed to acquire read lock on directory");
                None
            }
        }
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<T, DirectoryError>,
    ) -> Result<T, DirectoryError> {
        let mut tables = self.tables.write().map_err(|_| DirectoryError::LockPoisoned)?;
        f(&mut tables)
    }

    fn notify(&self, event: DirectoryEvent) {
        let _ = self.event_sender.send(event);
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory for InMemoryDirectory {
    fn resolve_device(&self, id: DeviceId) -> Option<DeviceRecord> {
        self.read(|t| t.devices.get(&id).cloned()).flatten()
    }

    fn resolve_peripheral(&self, device_id: DeviceId, id: PeripheralId) -> Option<PeripheralRecord> {
        self.read(|t| t.peripherals.get(&(device_id, id)).cloned())
            .flatten()
    }

    fn resolve_parameter(
        &self,
        device_id: DeviceId,
        peripheral_id: PeripheralId,
        id: ParameterId,
    ) -> Option<ParameterRecord> {
        self.read(|t| t.parameters.get(&(device_id, peripheral_id, id)).cloned())
            .flatten()
    }

    fn update_parameter_value(
        &self,
        device_id: DeviceId,
        peripheral_id: PeripheralId,
        id: ParameterId,
        value: DataValue,
    ) -> Result<(), DirectoryError> {
        self.write(|t| {
            let record = t
                .parameters
                .get_mut(&(device_id, peripheral_id, id))
                .ok_or_else(|| {
                    DirectoryError::NotFound(format!(
                        "parameter {}/{}/{}",
                        device_id, peripheral_id, id
                    ))
                })?;
            record.last_value = Some(value.clone());
            Ok(())
        })?;

        debug!(device_id, peripheral_id, parameter_id = id, %value, "Updated parameter value");
        self.notify(DirectoryEvent::ParameterUpdated {
            device_id,
            peripheral_id,
            parameter_id: id,
            value,
        });
        Ok(())
    }

    fn create_device(&self, record: DeviceRecord) -> Result<(), DirectoryError> {
        let id = record.id;
        self.write(|t| {
            if t.devices.contains_key(&id) {
                return Err(DirectoryError::AlreadyExists(format!("device {}", id)));
            }
            t.devices.insert(id, record);
            Ok(())
        })?;

        debug!("Created device with ID {}", id);
        self.notify(DirectoryEvent::DeviceCreated(id));
        Ok(())
    }

    fn create_peripheral(&self, record: PeripheralRecord) -> Result<(), DirectoryError> {
        let key = (record.device_id, record.id);
        self.write(|t| {
            let label = format!("peripheral {}/{}", key.0, key.1);
            if !t.devices.contains_key(&key.0) {
                return Err(DirectoryError::MissingParent(label));
            }
            if t.peripherals.contains_key(&key) {
                return Err(DirectoryError::AlreadyExists(label));
            }
            t.peripherals.insert(key, record);
            Ok(())
        })?;

        debug!("Created peripheral {}/{}", key.0, key.1);
        self.notify(DirectoryEvent::PeripheralCreated(key.0, key.1));
        Ok(())
    }

    fn create_parameter(&self, record: ParameterRecord) -> Result<(), DirectoryError> {
        let key = (record.device_id, record.peripheral_id, record.id);
        self.write(|t| {
            let label = format!("parameter {}/{}/{}", key.0, key.1, key.2);
            if !t.peripherals.contains_key(&(key.0, key.1)) {
                return Err(DirectoryError::MissingParent(label));
            }
            if t.parameters.contains_key(&key) {
                return Err(DirectoryError::AlreadyExists(label));
            }
            t.parameters.insert(key, record);
            Ok(())
        })?;

        debug!("Created parameter {}/{}/{}", key.0, key.1, key.2);
        self.notify(DirectoryEvent::ParameterCreated(key.0, key.1, key.2));
        Ok(())
    }

    fn device_exists(&self, id: DeviceId) -> bool {
        self.read(|t| t.devices.contains_key(&id)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> InMemoryDirectory {
        let directory = InMemoryDirectory::new();
        directory
            .create_device(DeviceRecord::new(5, "lamp", "10.0.0.5", 80, "/api"))
            .unwrap();
        directory
            .create_peripheral(PeripheralRecord::new(5, 2, "dimmer"))
            .unwrap();
        directory
            .create_parameter(ParameterRecord::new(
                5,
                2,
                7,
                "brightness",
                Methods::GET | Methods::SET,
                100,
                DataType::Int8,
            ))
            .unwrap();
        directory
    }

    #[test]
    fn test_resolve_records() {
        let directory = seeded();
        assert!(directory.device_exists(5));
        assert!(!directory.device_exists(6));
        assert_eq!(directory.resolve_device(5).unwrap().address, "10.0.0.5");
        assert!(directory.resolve_peripheral(5, 2).is_some());
        assert!(directory.resolve_peripheral(6, 2).is_none());

        let parameter = directory.resolve_parameter(5, 2, 7).unwrap();
        assert!(parameter.is_gettable);
        assert!(parameter.is_settable);
        assert!(!parameter.is_streamable);
        assert!(directory.resolve_parameter(5, 3, 7).is_none());
    }

    #[test]
    fn test_create_requires_parent() {
        let directory = InMemoryDirectory::new();
        let err = directory
            .create_peripheral(PeripheralRecord::new(1, 1, "orphan"))
            .unwrap_err();
        assert!(matches!(err, DirectoryError::MissingParent(_)));

        let err = directory
            .create_parameter(ParameterRecord::new(1, 1, 1, "orphan", Methods::GET, 1, DataType::Bool))
            .unwrap_err();
        assert!(matches!(err, DirectoryError::MissingParent(_)));
    }

    #[test]
    fn test_create_rejects_duplicates() {
        let directory = seeded();
        let err = directory
            .create_device(DeviceRecord::new(5, "again", "10.0.0.9", 80, "api"))
            .unwrap_err();
        assert_eq!(err, DirectoryError::AlreadyExists("device 5".to_string()));
        assert_eq!(directory.device_count(), 1);
    }

    #[tokio::test]
    async fn test_update_parameter_value_notifies() {
        let directory = seeded();
        let mut events = directory.subscribe();

        directory
            .update_parameter_value(5, 2, 7, DataValue::Integer(42))
            .unwrap();
        assert_eq!(
            directory.resolve_parameter(5, 2, 7).unwrap().last_value,
            Some(DataValue::Integer(42))
        );
        assert_eq!(
            events.recv().await.unwrap(),
            DirectoryEvent::ParameterUpdated {
                device_id: 5,
                peripheral_id: 2,
                parameter_id: 7,
                value: DataValue::Integer(42),
            }
        );

        let err = directory
            .update_parameter_value(5, 2, 8, DataValue::Integer(1))
            .unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_updates_last_write_wins() {
        let directory = Arc::new(seeded());
        let mut handles = Vec::new();
        for value in 0..32i64 {
            let directory = directory.clone();
            handles.push(tokio::spawn(async move {
                directory.update_parameter_value(5, 2, 7, DataValue::Integer(value))
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let last = directory.resolve_parameter(5, 2, 7).unwrap().last_value.unwrap();
        assert!(matches!(last, DataValue::Integer(v) if (0..32).contains(&v)));
    }
}
