//! INDI server connection manager
//!
//! [`ConnectionManager`] owns the TCP session, the device model, the log ring
//! and the specialized wrappers. One reader task applies server pushes to the
//! model; one writer task drains the outbound queue. Every notification goes
//! out through a single broadcast channel as a [`ClientEvent`].
//!
//! Lock order is session, then model, then wrapper registry. None of them is
//! held across an await.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use quick_xml::events::Event;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::codec::{MessageDecoder, ServerMessage};
use crate::devices::{Camera, DeviceContext, DeviceRegistry, Focuser, Mount, Specialization};
use crate::error::{IndiError, IndiResult};
use crate::events::{ClientEvent, EventHub, ListenerControl, ListenerHandle};
use crate::log::{LogItem, LogRing};
use crate::model::{read_store, write_store, Device, DeviceStore, Property, PropertyType, RawValue, Value};
use crate::protocol::{self, BlobMode};
use crate::update::PropertyUpdater;
use crate::{ClientConfig, ServerEndpoint};

/// Connection state of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// A connect attempt is in flight
    Busy,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Busy => write!(f, "BUSY"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

#[derive(Debug, Default)]
struct Session {
    state: ConnectionState,
    /// Bumped on every connect so stale tasks can tell they are stale
    generation: u64,
    cancel: Option<CancellationToken>,
    endpoint: Option<(String, u16)>,
    established: bool,
}

#[derive(Debug)]
struct Inner {
    ctx: Arc<DeviceContext>,
    registry: Mutex<DeviceRegistry>,
    session: Mutex<Session>,
    blob_enabled: AtomicBool,
    config: ClientConfig,
}

/// Client for one INDI server at a time. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        let mut ctx = DeviceContext::new(
            Arc::new(RwLock::new(DeviceStore::new())),
            PropertyUpdater::new(),
            EventHub::new(config.event_buffer),
            Arc::new(LogRing::new(config.log_capacity)),
        );
        ctx.loop_delay = config.loop_delay();
        Self {
            inner: Arc::new(Inner {
                ctx: Arc::new(ctx),
                registry: Mutex::new(DeviceRegistry::default()),
                session: Mutex::new(Session::default()),
                blob_enabled: AtomicBool::new(config.blob_enabled),
                config,
            }),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.inner.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, DeviceRegistry> {
        self.inner.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ctx(&self) -> &DeviceContext {
        &self.inner.ctx
    }

    fn emit(&self, event: ClientEvent) {
        self.inner.ctx.events.emit(event);
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.session().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Host and port of the current or pending connection
    pub fn endpoint(&self) -> Option<(String, u16)> {
        let session = self.session();
        match session.state {
            ConnectionState::Disconnected => None,
            _ => session.endpoint.clone(),
        }
    }

    // Connection lifecycle

    /// Start connecting. Must be called inside a tokio runtime.
    ///
    /// Returns once the attempt is scheduled; the outcome arrives as
    /// `ConnectionStateChanged` and, on failure, `ConnectionFailed`.
    pub fn connect(&self, host: &str, port: u16) -> IndiResult<()> {
        let (generation, token) = {
            let mut session = self.session();
            if session.state != ConnectionState::Disconnected {
                let state = session.state;
                drop(session);
                tracing::warn!("Connect to {}:{} refused, manager is {}", host, port, state);
                self.ctx().log(format!("Already connected or connecting ({})", state), None);
                return Err(IndiError::AlreadyConnecting { state });
            }
            let token = CancellationToken::new();
            session.state = ConnectionState::Busy;
            session.generation += 1;
            session.cancel = Some(token.clone());
            session.endpoint = Some((host.to_string(), port));
            session.established = false;
            self.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Busy));
            (session.generation, token)
        };

        self.ctx().log(format!("Trying to connect to {}:{}", host, port), None);
        let manager = self.clone();
        let host = host.to_string();
        tokio::spawn(async move { manager.run_connect(generation, token, host, port).await });
        Ok(())
    }

    pub fn connect_endpoint(&self, endpoint: &ServerEndpoint) -> IndiResult<()> {
        self.connect(&endpoint.host, endpoint.port)
    }

    /// Close the connection or cancel a pending attempt. No-op when disconnected.
    pub fn disconnect(&self) {
        self.teardown(None, "Disconnected by client");
    }

    async fn run_connect(self, generation: u64, token: CancellationToken, host: String, port: u16) {
        let addr = format!("{}:{}", host, port);
        let connection_timeout = self.inner.config.connection_timeout();

        let attempt = tokio::select! {
            _ = token.cancelled() => return,
            attempt = timeout(connection_timeout, TcpStream::connect(&addr)) => attempt,
        };
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let error = IndiError::ConnectionFailed(format!(
                    "Failed to connect to INDI server at {}: {}",
                    addr, e
                ));
                self.connect_failed(generation, &host, port, error);
                return;
            }
            Err(_) => {
                let error = IndiError::ConnectionTimeout {
                    host: host.clone(),
                    port,
                    duration: connection_timeout,
                };
                self.connect_failed(generation, &host, port, error);
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        self.establish(generation, token, read_half, write_half, &addr);
    }

    fn connect_failed(&self, generation: u64, host: &str, port: u16, error: IndiError) {
        let mut session = self.session();
        if session.generation != generation || session.state != ConnectionState::Busy {
            return;
        }
        session.state = ConnectionState::Disconnected;
        session.cancel = None;
        tracing::error!("{}", error);
        self.ctx().log(format!("Connection error: {}", error), None);
        self.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        self.emit(ClientEvent::ConnectionFailed {
            host: host.to_string(),
            port,
            error: error.to_string(),
        });
    }

    /// Wire up reader and writer once the socket is open.
    ///
    /// Generic over the stream halves so tests can drive it with in-memory pipes.
    fn establish<R, W>(&self, generation: u64, token: CancellationToken, reader: R, writer: W, addr: &str)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.inner.config.send_queue.max(1));
        {
            let mut session = self.session();
            if session.generation != generation || session.state != ConnectionState::Busy {
                // Cancelled while the socket was opening
                return;
            }
            self.ctx().updater.attach(tx);
            session.state = ConnectionState::Connected;
            session.established = true;
            self.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Connected));
        }

        tracing::info!("Connected to INDI server at {}", addr);
        self.ctx().log("Connected", None);

        tokio::spawn(self.clone().writer_task(generation, token.clone(), writer, rx));

        let request = protocol::get_properties(&self.inner.config.protocol_version, None, None);
        if let Err(e) = self.ctx().updater.send_raw(request) {
            tracing::error!("Failed to request properties: {}", e);
        }

        tokio::spawn(self.clone().reader_task(generation, token, reader));
    }

    async fn writer_task<W: AsyncWrite + Unpin>(
        self,
        generation: u64,
        token: CancellationToken,
        mut writer: W,
        mut rx: mpsc::Receiver<String>,
    ) {
        loop {
            let message = tokio::select! {
                _ = token.cancelled() => break,
                message = rx.recv() => message,
            };
            let Some(message) = message else { break };
            tracing::trace!("INDI -> {}", message);
            let result = async {
                writer.write_all(message.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = result {
                tracing::error!("INDI write error: {}", e);
                self.teardown(Some(generation), &format!("Write error: {}", e));
                break;
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn reader_task<R: AsyncRead + Unpin>(self, generation: u64, token: CancellationToken, reader: R) {
        let mut reader = quick_xml::reader::Reader::from_reader(BufReader::new(reader));
        reader.trim_text(true);
        let mut buf = Vec::new();
        let mut decoder = MessageDecoder::new();

        let reason = loop {
            let event = tokio::select! {
                _ = token.cancelled() => return,
                event = reader.read_event_into_async(&mut buf) => event,
            };
            match event {
                Ok(Event::Eof) => {
                    tracing::info!("INDI connection closed (EOF)");
                    break "Server closed the connection".to_string();
                }
                Ok(event) => {
                    if let Some(message) = decoder.feed(&event) {
                        self.apply(generation, message);
                    }
                }
                Err(quick_xml::Error::Io(e)) => {
                    tracing::error!("INDI read error: {}", e);
                    break format!("Read error: {}", e);
                }
                Err(e) => {
                    tracing::warn!("INDI XML parse error at byte {}: {}", reader.buffer_position(), e);
                    decoder.reset();
                }
            }
            buf.clear();
        };

        self.teardown(Some(generation), &reason);
    }

    /// Apply one server message. Events are emitted while the model lock is
    /// held so snapshot subscribers never miss or double-see a change.
    fn apply(&self, generation: u64, message: ServerMessage) {
        let session = self.session();
        if session.generation != generation || session.state != ConnectionState::Connected {
            return;
        }
        let ctx = self.ctx();
        let mut store = write_store(&ctx.store);
        let mut registry = self.registry();
        let mut events = Vec::new();

        match message {
            ServerMessage::Define { property, message } => {
                let device = property.device.clone();
                let name = property.name.clone();
                let is_blob = property.property_type() == PropertyType::Blob;
                let outcome = store.upsert_property(property);
                if outcome.device_added {
                    tracing::info!("New device: {}", device);
                    ctx.log(format!("New device: {}", device), None);
                    events.push(ClientEvent::DeviceAdded(device.clone()));
                }
                tracing::debug!("Property defined: {}.{} (replaced: {})", device, name, outcome.replaced);
                if is_blob {
                    let xml = protocol::enable_blob(&device, Some(&name), self.blob_mode());
                    if let Err(e) = ctx.updater.send_raw(xml) {
                        tracing::warn!("Could not set BLOB policy for {}.{}: {}", device, name, e);
                    }
                }
                events.push(ClientEvent::PropertyDefined {
                    device: device.clone(),
                    property: name.clone(),
                    replaced: outcome.replaced,
                });
                registry.sync_device(&self.inner.ctx, &store, &device, &name, &mut events);
                if let Some(text) = message {
                    ctx.log(text, Some(&device));
                }
            }
            ServerMessage::Update(update) => match store.merge_server_update(&update) {
                Ok(outcome) => {
                    for issue in &outcome.issues {
                        tracing::warn!("{}", issue);
                    }
                    events.push(ClientEvent::PropertyUpdated {
                        device: update.device.clone(),
                        property: update.name.clone(),
                        state: outcome.state,
                    });
                    for value in &update.values {
                        if let RawValue::Blob(blob) = &value.value {
                            events.push(ClientEvent::BlobReceived {
                                device: update.device.clone(),
                                property: update.name.clone(),
                                element: value.name.clone(),
                                blob: blob.clone(),
                            });
                        }
                    }
                    registry.updated(&store, &update, &mut events);
                    if let Some(text) = &update.message {
                        ctx.log(text.clone(), Some(&update.device));
                    }
                }
                Err(e) => tracing::debug!("Ignoring update: {}", e),
            },
            ServerMessage::Delete { device, name: Some(name), message } => {
                if store.remove_property(&device, &name).is_some() {
                    tracing::debug!("Property removed: {}.{}", device, name);
                    events.push(ClientEvent::PropertyRemoved {
                        device: device.clone(),
                        property: name.clone(),
                    });
                    registry.sync_device(&self.inner.ctx, &store, &device, &name, &mut events);
                }
                if let Some(text) = message {
                    ctx.log(text, Some(&device));
                }
            }
            ServerMessage::Delete { device, name: None, message } => {
                if store.remove_device(&device).is_some() {
                    tracing::info!("Device removed: {}", device);
                    registry.remove_device(&device, &mut events);
                    events.push(ClientEvent::DeviceRemoved(device.clone()));
                    ctx.log(format!("Device removed: {}", device), None);
                }
                if let Some(text) = message {
                    ctx.log(text, Some(&device));
                }
            }
            ServerMessage::Message { device, text, .. } => {
                ctx.log(text.clone(), device.as_deref());
                events.push(ClientEvent::ServerMessage { device, text });
            }
        }

        for event in events {
            self.emit(event);
        }
        drop(registry);
        drop(store);
        drop(session);
    }

    /// Shared teardown for disconnect, EOF, read and write errors.
    ///
    /// `generation` pins the teardown to one connection; `None` means the
    /// current one.
    fn teardown(&self, generation: Option<u64>, reason: &str) {
        let mut session = self.session();
        if generation.is_some_and(|g| g != session.generation) || session.state == ConnectionState::Disconnected {
            return;
        }
        let established = session.established;
        session.state = ConnectionState::Disconnected;
        session.established = false;
        if let Some(token) = session.cancel.take() {
            token.cancel();
        }
        let ctx = self.ctx();
        ctx.updater.detach();

        let mut store = write_store(&ctx.store);
        let mut registry = self.registry();
        let mut events = Vec::new();
        registry.clear(&mut events);
        for device in store.clear() {
            events.push(ClientEvent::DeviceRemoved(device));
        }
        for event in events {
            self.emit(event);
        }
        drop(registry);
        drop(store);

        self.emit(ClientEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        if established {
            tracing::info!("INDI connection closed: {}", reason);
            ctx.log(format!("Disconnected: {}", reason), None);
            self.emit(ClientEvent::ConnectionLost {
                reason: reason.to_string(),
            });
        } else {
            tracing::info!("Connection attempt cancelled");
            ctx.log("Connection attempt cancelled", None);
        }
    }

    // Events

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.ctx.events.subscribe()
    }

    /// Current devices plus a receiver for every change after them.
    pub fn subscribe_with_snapshot(&self) -> (Vec<Device>, broadcast::Receiver<ClientEvent>) {
        let store = read_store(&self.ctx().store);
        let rx = self.inner.ctx.events.subscribe();
        (store.devices().to_vec(), rx)
    }

    /// Callback listener on its own task; see [`EventHub::listen`].
    pub fn listen<F>(&self, callback: F) -> ListenerHandle
    where
        F: FnMut(&ClientEvent) -> ListenerControl + Send + 'static,
    {
        self.inner.ctx.events.listen(callback)
    }

    // Model access

    pub fn devices(&self) -> Vec<Device> {
        read_store(&self.ctx().store).devices().to_vec()
    }

    pub fn device_names(&self) -> Vec<String> {
        read_store(&self.ctx().store).device_names()
    }

    pub fn device(&self, name: &str) -> Option<Device> {
        read_store(&self.ctx().store).device(name).cloned()
    }

    pub fn property(&self, device: &str, name: &str) -> Option<Property> {
        read_store(&self.ctx().store).property(device, name).cloned()
    }

    /// Stage a value; nothing is sent until [`send_changes`](Self::send_changes).
    pub fn set_desired_value(&self, device: &str, property: &str, element: &str, value: Value) -> IndiResult<()> {
        write_store(&self.ctx().store).set_desired_value(device, property, element, value)
    }

    pub fn select_switch(&self, device: &str, property: &str, element: &str) -> IndiResult<()> {
        write_store(&self.ctx().store).select_switch(device, property, element)
    }

    /// Send every staged value of a property as one message.
    ///
    /// Staged values are cleared whether or not the send succeeds. Nothing to
    /// send is not an error.
    pub fn send_changes(&self, device: &str, property: &str) -> IndiResult<()> {
        let staged = write_store(&self.ctx().store).take_staged(device, property)?;
        let Some(staged) = staged else {
            return Ok(());
        };
        self.ctx().updater.send(&staged).map_err(|e| {
            self.ctx().log(format!("Error: {}", e), Some(device));
            e
        })
    }

    pub fn discard_changes(&self, device: &str, property: &str) {
        write_store(&self.ctx().store).discard_staged(device, property);
    }

    /// Ask the server to (re)send definitions.
    pub fn request_properties(&self, device: Option<&str>, property: Option<&str>) -> IndiResult<()> {
        let xml = protocol::get_properties(&self.inner.config.protocol_version, device, property);
        self.ctx().updater.send_raw(xml)
    }

    // BLOB policy

    fn blob_mode(&self) -> BlobMode {
        if self.inner.blob_enabled.load(Ordering::SeqCst) {
            BlobMode::Also
        } else {
            BlobMode::Never
        }
    }

    pub fn blob_enabled(&self) -> bool {
        self.inner.blob_enabled.load(Ordering::SeqCst)
    }

    /// Change the BLOB policy and push it to every known BLOB property.
    pub fn set_blob_enabled(&self, enabled: bool) -> IndiResult<()> {
        self.inner.blob_enabled.store(enabled, Ordering::SeqCst);
        if !self.is_connected() {
            return Ok(());
        }
        let mode = self.blob_mode();
        let targets: Vec<(String, String)> = read_store(&self.ctx().store)
            .devices()
            .iter()
            .flat_map(|d| d.properties().iter())
            .filter(|p| p.property_type() == PropertyType::Blob)
            .map(|p| (p.device.clone(), p.name.clone()))
            .collect();
        for (device, name) in targets {
            self.ctx()
                .updater
                .send_raw(protocol::enable_blob(&device, Some(&name), mode))?;
        }
        Ok(())
    }

    // Log

    pub fn log(&self, message: impl Into<String>) {
        self.ctx().log(message, None);
    }

    /// Device-scoped entry; replaces the device's previous entry.
    pub fn log_device(&self, message: impl Into<String>, device: &str) {
        self.ctx().log(message, Some(device));
    }

    pub fn logs(&self) -> Vec<LogItem> {
        self.ctx().log_ring.snapshot()
    }

    pub fn clear_logs(&self) {
        self.ctx().log_ring.clear();
    }

    // Wrappers

    pub fn camera(&self, device: &str) -> Option<Arc<Camera>> {
        self.registry().camera(device)
    }

    pub fn cameras(&self) -> Vec<Arc<Camera>> {
        self.registry().cameras()
    }

    pub fn focuser(&self, device: &str) -> Option<Arc<Focuser>> {
        self.registry().focuser(device)
    }

    pub fn focusers(&self) -> Vec<Arc<Focuser>> {
        self.registry().focusers()
    }

    pub fn mount(&self, device: &str) -> Option<Arc<Mount>> {
        self.registry().mount(device)
    }

    pub fn mounts(&self) -> Vec<Arc<Mount>> {
        self.registry().mounts()
    }

    /// Mount currently reporting `EQUATORIAL_EOD_COORD`
    pub fn telescope(&self) -> Option<Arc<Mount>> {
        let store = read_store(&self.ctx().store);
        self.registry().telescope(&store)
    }

    pub fn specializations(&self, device: &str) -> Vec<Specialization> {
        self.registry().kinds_of(device)
    }
}
