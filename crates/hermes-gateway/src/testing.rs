//! Shared fixtures for unit tests.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use hermes_devices::directory::{
    DeviceRecord, Directory, InMemoryDirectory, ParameterRecord, PeripheralRecord,
};
use hermes_devices::protocol::{DataType, Methods};
use hermes_devices::{Relay, RelayError};

type Handler = Box<dyn Fn(&str, &Value) -> Result<Value, RelayError> + Send + Sync>;

/// A relay answering from a closure and recording every call.
pub(crate) struct ScriptedRelay {
    handler: Handler,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedRelay {
    pub(crate) fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&str, &Value) -> Result<Value, RelayError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

impl fmt::Debug for ScriptedRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedRelay").finish_non_exhaustive()
    }
}

#[async_trait]
impl Relay for ScriptedRelay {
    async fn post(&self, url: &str, body: &Value) -> Result<Value, RelayError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), body.clone()));
        (self.handler)(url, body)
    }
}

/// Device 5 ("lamp") with peripheral 2 holding parameters 7 (brightness,
/// get/set/stream, max 100) and 8 (reset, action only).
pub(crate) fn seeded_directory() -> Arc<InMemoryDirectory> {
    let directory = InMemoryDirectory::shared();
    directory
        .create_device(DeviceRecord::new(5, "lamp", "127.0.0.1", 8080, "api"))
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
            Methods::GET | Methods::SET | Methods::STREAM,
            100,
            DataType::Int16,
        ))
        .unwrap();
    directory
        .create_parameter(ParameterRecord::new(
            5,
            2,
            8,
            "reset",
            Methods::ACTION,
            1,
            DataType::Bool,
        ))
        .unwrap();
    directory
}
