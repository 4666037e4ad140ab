//! INDI client core for telescope control
//!
//! Mirrors the device/property tree of one INDI server, stages and sends
//! property changes, and exposes camera, focuser and mount views on top of
//! the generic model.
//!
//! ## Features
//!
//! - Explicit [`ConnectionManager`] with DISCONNECTED / BUSY / CONNECTED states
//! - Typed property model with staged (desired) values and range checks
//! - One broadcast event channel plus callback listeners
//! - Capability checks that follow the server's live property set
//! - Camera capture loops, focuser moves and mount goto/sync/park
//! - Bounded log ring with one latest entry per device

pub mod astro;
mod codec;
mod connection;
pub mod devices;
mod error;
mod events;
mod log;
pub mod logging;
pub mod model;
pub mod protocol;
mod update;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use codec::{decode_str, MessageDecoder, ServerMessage};
pub use connection::{ConnectionManager, ConnectionState};
pub use devices::{Camera, Focuser, Mount, Specialization};
pub use error::{IndiError, IndiResult, ProtocolDataError};
pub use events::{ClientEvent, EventHub, ListenerControl, ListenerHandle};
pub use log::{LogItem, LogRing};
pub use model::{Device, Property, PropertyState, PropertyType, Value};
pub use protocol::{standard_elements, standard_properties, BlobMode, INDI_PROTOCOL_VERSION};
pub use update::{PropertyUpdater, Staging};

/// Default INDI server port
pub const INDI_DEFAULT_PORT: u16 = 7624;

/// A saved INDI server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerEndpoint {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
        }
    }
}

fn default_port() -> u16 {
    INDI_DEFAULT_PORT
}

/// Client settings, persisted as JSON by the embedding application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// TCP connect timeout (default: 10 seconds)
    pub connection_timeout_secs: u64,
    /// Version sent with `getProperties` (default: 1.7)
    pub protocol_version: String,
    /// Log ring size (default: 100 entries)
    pub log_capacity: usize,
    /// Broadcast buffer per subscriber (default: 1024 events)
    pub event_buffer: usize,
    /// Outbound messages waiting for the socket (default: 100)
    pub send_queue: usize,
    /// Ask the server for BLOBs on new BLOB properties (default: true)
    pub blob_enabled: bool,
    /// Pause between captures of a camera loop (default: 0 ms)
    pub loop_delay_ms: u64,
    pub servers: Vec<ServerEndpoint>,
    /// Device last picked by the user, restored on startup
    pub last_device: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 10,
            protocol_version: INDI_PROTOCOL_VERSION.to_string(),
            log_capacity: 100,
            event_buffer: 1024,
            send_queue: 100,
            blob_enabled: true,
            loop_delay_ms: 0,
            servers: vec![ServerEndpoint::new("Local", "localhost", INDI_DEFAULT_PORT)],
            last_device: None,
        }
    }
}

impl ClientConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn loop_delay(&self) -> Duration {
        Duration::from_millis(self.loop_delay_ms)
    }

    pub fn server(&self, name: &str) -> Option<&ServerEndpoint> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Add a server, replacing any saved one with the same name.
    pub fn save_server(&mut self, endpoint: ServerEndpoint) {
        match self.servers.iter_mut().find(|s| s.name == endpoint.name) {
            Some(existing) => *existing = endpoint,
            None => self.servers.push(endpoint),
        }
    }

    pub fn from_json_str(json: &str) -> IndiResult<Self> {
        serde_json::from_str(json).map_err(|e| IndiError::ParseError(format!("Invalid client config: {}", e)))
    }

    pub fn to_json_string(&self) -> IndiResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| IndiError::ParseError(format!("Failed to serialize client config: {}", e)))
    }
}
