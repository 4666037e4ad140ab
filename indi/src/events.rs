//! Event fan-out
//!
//! Every notification the client produces goes through one broadcast channel
//! as a [`ClientEvent`]. Consumers either hold a receiver from
//! [`EventHub::subscribe`] or register a callback with [`EventHub::listen`],
//! which runs on its own task so a slow or failing listener never stalls the
//! connection reader or other listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::astro::Equatorial;
use crate::connection::ConnectionState;
use crate::devices::{LoopStopReason, Specialization};
use crate::log::LogItem;
use crate::model::{Blob, PropertyState};

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionState),
    /// Connect attempt failed; the manager is back to DISCONNECTED
    ConnectionFailed {
        host: String,
        port: u16,
        error: String,
    },
    /// An established connection ended (server drop or `disconnect`)
    ConnectionLost {
        reason: String,
    },
    DeviceAdded(String),
    DeviceRemoved(String),
    PropertyDefined {
        device: String,
        property: String,
        replaced: bool,
    },
    PropertyUpdated {
        device: String,
        property: String,
        state: PropertyState,
    },
    PropertyRemoved {
        device: String,
        property: String,
    },
    LogAppended(LogItem),
    /// Free text pushed by the server, also appended to the log
    ServerMessage {
        device: Option<String>,
        text: String,
    },
    BlobReceived {
        device: String,
        property: String,
        element: String,
        blob: Blob,
    },
    SpecializationAdded {
        device: String,
        kind: Specialization,
    },
    SpecializationRemoved {
        device: String,
        kind: Specialization,
    },
    /// A property relevant to a wrapper appeared or disappeared
    CapabilitiesChanged {
        device: String,
        kind: Specialization,
    },
    CameraImageReady {
        device: String,
        blob: Blob,
    },
    CameraExposureState {
        device: String,
        state: PropertyState,
    },
    CameraLoopProgress {
        device: String,
        done: u32,
        total: u32,
    },
    CameraLoopStopped {
        device: String,
        completed: u32,
        reason: LoopStopReason,
    },
    CameraError {
        device: String,
        message: String,
    },
    FocuserPositionChanged {
        device: String,
        position: f64,
    },
    FocuserSpeedChanged {
        device: String,
        speed: f64,
    },
    MountCoordinatesChanged {
        device: String,
        coordinates: Equatorial,
    },
}

impl ClientEvent {
    /// Device the event concerns, if any
    pub fn device(&self) -> Option<&str> {
        match self {
            ClientEvent::ConnectionStateChanged(_)
            | ClientEvent::ConnectionFailed { .. }
            | ClientEvent::ConnectionLost { .. } => None,
            ClientEvent::LogAppended(item) => item.device.as_deref(),
            ClientEvent::ServerMessage { device, .. } => device.as_deref(),
            ClientEvent::DeviceAdded(device) | ClientEvent::DeviceRemoved(device) => Some(device),
            ClientEvent::PropertyDefined { device, .. }
            | ClientEvent::PropertyUpdated { device, .. }
            | ClientEvent::PropertyRemoved { device, .. }
            | ClientEvent::BlobReceived { device, .. }
            | ClientEvent::SpecializationAdded { device, .. }
            | ClientEvent::SpecializationRemoved { device, .. }
            | ClientEvent::CapabilitiesChanged { device, .. }
            | ClientEvent::CameraImageReady { device, .. }
            | ClientEvent::CameraExposureState { device, .. }
            | ClientEvent::CameraLoopProgress { device, .. }
            | ClientEvent::CameraLoopStopped { device, .. }
            | ClientEvent::CameraError { device, .. }
            | ClientEvent::FocuserPositionChanged { device, .. }
            | ClientEvent::FocuserSpeedChanged { device, .. }
            | ClientEvent::MountCoordinatesChanged { device, .. } => Some(device),
        }
    }
}

/// Returned by listener callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerControl {
    Continue,
    /// Stop delivering to this listener
    Unregister,
}

/// Registration of a callback listener. Dropping it unregisters the listener.
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// False once the listener unregistered itself or the hub closed
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn unregister(self) {
        // Drop aborts the task
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<ClientEvent>,
    next_id: Arc<AtomicU64>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Never blocks; events with no subscribers are dropped.
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Register a callback. Must be called inside a tokio runtime.
    ///
    /// The subscription is taken before this returns, so every event emitted
    /// afterwards reaches the callback. A panic inside the callback is caught
    /// and logged; the listener keeps receiving events.
    ///
    /// A listener that falls more than the hub capacity behind skips the
    /// oldest events with a warning and resumes at the oldest one still
    /// buffered. Callbacks that track state should re-read the model when they
    /// cannot afford gaps.
    pub fn listen<F>(&self, mut callback: F) -> ListenerHandle
    where
        F: FnMut(&ClientEvent) -> ListenerControl + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                        Ok(ListenerControl::Continue) => {}
                        Ok(ListenerControl::Unregister) => {
                            tracing::debug!("Listener {} unregistered itself", id);
                            break;
                        }
                        Err(panic) => {
                            let reason = panic
                                .downcast_ref::<&str>()
                                .map(|s| s.to_string())
                                .or_else(|| panic.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "unknown panic".to_string());
                            tracing::error!("Listener {} panicked on {:?}: {}", id, event, reason);
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Listener {} lagged behind, {} events dropped", id, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        ListenerHandle { id, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn collect(rx: &mut mpsc::UnboundedReceiver<String>, n: usize) -> Vec<String> {
        let mut out = Vec::new();
        while out.len() < n {
            match timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(v)) => out.push(v),
                _ => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn test_self_unregister_does_not_disturb_others() {
        let hub = EventHub::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut handles = Vec::new();
        for name in ["a", "b", "c"] {
            let tx = tx.clone();
            handles.push(hub.listen(move |event| {
                if let ClientEvent::DeviceAdded(device) = event {
                    let _ = tx.send(format!("{}:{}", name, device));
                }
                if name == "b" {
                    ListenerControl::Unregister
                } else {
                    ListenerControl::Continue
                }
            }));
        }

        for device in ["d1", "d2", "d3"] {
            hub.emit(ClientEvent::DeviceAdded(device.to_string()));
        }

        let mut got = collect(&mut rx, 7).await;
        got.sort();
        assert_eq!(got, vec!["a:d1", "a:d2", "a:d3", "b:d1", "c:d1", "c:d2", "c:d3"]);
        // nothing else arrives
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
        assert!(!handles[1].is_active());
        assert!(handles[0].is_active());
    }

    #[tokio::test]
    async fn test_panicking_listener_is_isolated() {
        let hub = EventHub::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _bad = hub.listen(|event| {
            if let ClientEvent::DeviceAdded(device) = event {
                if device == "boom" {
                    panic!("listener failure");
                }
            }
            ListenerControl::Continue
        });
        let tx2 = tx.clone();
        let _good = hub.listen(move |event| {
            if let ClientEvent::DeviceAdded(device) = event {
                let _ = tx2.send(device.clone());
            }
            ListenerControl::Continue
        });

        hub.emit(ClientEvent::DeviceAdded("boom".to_string()));
        hub.emit(ClientEvent::DeviceAdded("fine".to_string()));
        assert_eq!(collect(&mut rx, 2).await, vec!["boom", "fine"]);
        drop(tx);
    }

    #[tokio::test]
    async fn test_lagging_listener_keeps_running() {
        let hub = EventHub::new(4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = hub.listen(move |event| {
            if let ClientEvent::DeviceAdded(device) = event {
                let _ = tx.send(device.clone());
            }
            ListenerControl::Continue
        });

        for i in 0..20 {
            hub.emit(ClientEvent::DeviceAdded(format!("d{}", i)));
        }
        // Only the newest events survive the overflow
        assert_eq!(collect(&mut rx, 4).await, vec!["d16", "d17", "d18", "d19"]);

        hub.emit(ClientEvent::DeviceAdded("late".to_string()));
        assert_eq!(collect(&mut rx, 1).await, vec!["late"]);
        assert!(handle.is_active());
    }

    #[tokio::test]
    async fn test_dropping_handle_unregisters() {
        let hub = EventHub::new(16);
        let handle = hub.listen(|_| ListenerControl::Continue);
        assert_eq!(hub.subscriber_count(), 1);
        handle.unregister();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_event_device() {
        let event = ClientEvent::FocuserPositionChanged {
            device: "Focuser".to_string(),
            position: 100.0,
        };
        assert_eq!(event.device(), Some("Focuser"));
        assert_eq!(ClientEvent::ConnectionStateChanged(ConnectionState::Busy).device(), None);
    }
}
