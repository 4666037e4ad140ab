//! INDI Camera wrapper
//!
//! Exposures, presets, image settings and the capture loop of a CCD/DSLR
//! device. Images arrive as `CCD1` BLOB updates and are surfaced as
//! [`ClientEvent::CameraImageReady`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{DeviceContext, Specialization};
use crate::connection::ConnectionState;
use crate::error::{IndiError, IndiResult};
use crate::events::ClientEvent;
use crate::model::{PropertyState, SwitchOption, SwitchStatus, Value};
use crate::protocol::standard_elements::*;
use crate::protocol::standard_properties::*;
use crate::protocol::{self, standard_elements, standard_properties, BlobMode};

/// What one capture exposes for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Exposure {
    /// Exposure time in seconds
    Seconds(f64),
    /// Element name of a `CCD_EXPOSURE_PRESETS` switch
    Preset(String),
}

/// Where the driver delivers images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadMode {
    Client,
    Local,
    Both,
}

impl UploadMode {
    pub fn element(self) -> &'static str {
        match self {
            UploadMode::Client => UPLOAD_CLIENT,
            UploadMode::Local => UPLOAD_LOCAL,
            UploadMode::Both => UPLOAD_BOTH,
        }
    }
}

/// What happens to captured images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SaveMode {
    #[default]
    ShowOnly,
    SaveJpgAndShow,
    /// Stored on the server only; no BLOBs are sent to the client
    RemoteSave,
    RemoteSaveAndShow,
}

impl SaveMode {
    pub fn upload_mode(self) -> UploadMode {
        match self {
            SaveMode::RemoteSave => UploadMode::Local,
            SaveMode::RemoteSaveAndShow => UploadMode::Both,
            SaveMode::ShowOnly | SaveMode::SaveJpgAndShow => UploadMode::Client,
        }
    }

    pub fn blob_mode(self) -> BlobMode {
        match self {
            SaveMode::RemoteSave => BlobMode::Never,
            _ => BlobMode::Also,
        }
    }

    /// Whether the client receives and shows images
    pub fn receives_images(self) -> bool {
        self != SaveMode::RemoteSave
    }
}

/// Capture loop parameters
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureLoop {
    pub exposure: Exposure,
    /// Number of captures, 0 for an endless loop
    pub count: u32,
    pub delay: Duration,
}

impl CaptureLoop {
    pub fn new(exposure: Exposure, count: u32) -> Self {
        Self {
            exposure,
            count,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Why a capture loop ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopStopReason {
    /// All requested captures completed
    Finished,
    /// Stopped locally by abort or a new loop
    Cancelled,
    /// The driver reported ALERT or IDLE for an exposure
    ExposureFailed,
    /// Connection or device went away
    Disconnected,
    Error(String),
}

#[derive(Debug)]
struct LoopHandle {
    id: u64,
    token: CancellationToken,
    reason: Arc<Mutex<LoopStopReason>>,
    progress: Arc<Mutex<(u32, u32)>>,
}

impl LoopHandle {
    fn stop(&self, reason: LoopStopReason) {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = reason;
        self.token.cancel();
    }
}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

/// Camera view of one device
#[derive(Debug, Clone)]
pub struct Camera {
    ctx: Arc<DeviceContext>,
    device: String,
    save_mode: Arc<Mutex<SaveMode>>,
    file_prefix: Arc<Mutex<Option<String>>>,
    active_loop: Arc<Mutex<Option<LoopHandle>>>,
}

impl Camera {
    pub(crate) fn new(ctx: Arc<DeviceContext>, device: &str) -> Self {
        Self {
            ctx,
            device: device.to_string(),
            save_mode: Arc::new(Mutex::new(SaveMode::default())),
            file_prefix: Arc::new(Mutex::new(None)),
            active_loop: Arc::new(Mutex::new(None)),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device
    }

    fn supports(&self, property: &str, elements: &[&str]) -> bool {
        self.ctx.supports(&self.device, property, elements)
    }

    fn options(&self, property: &str) -> Vec<SwitchOption> {
        self.ctx
            .read_property(&self.device, property, |p| p.switch_options())
            .unwrap_or_default()
    }

    fn selected(&self, property: &str, operation: &str) -> IndiResult<Option<SwitchOption>> {
        self.ctx
            .read_property(&self.device, property, |p| p.selected_switch())
            .ok_or_else(|| self.unsupported_or_gone(operation))
    }

    fn unsupported_or_gone(&self, operation: &str) -> IndiError {
        if self.ctx.has_device(&self.device) {
            IndiError::unsupported(&self.device, operation)
        } else {
            IndiError::DeviceGone(self.device.clone())
        }
    }

    // Capabilities

    pub fn can_capture(&self) -> bool {
        self.supports(CCD_EXPOSURE, &[CCD_EXPOSURE_VALUE])
    }

    pub fn can_abort(&self) -> bool {
        self.supports(CCD_ABORT_EXPOSURE, &[ABORT])
    }

    pub fn has_blob(&self) -> bool {
        self.supports(standard_properties::CCD1, &[standard_elements::CCD1])
    }

    pub fn has_presets(&self) -> bool {
        self.ctx.read_property(&self.device, CCD_EXPOSURE_PRESETS, |_| ()).is_some()
    }

    pub fn has_iso(&self) -> bool {
        self.ctx.read_property(&self.device, CCD_ISO, |_| ()).is_some()
    }

    pub fn has_gain(&self) -> bool {
        self.supports(CCD_GAIN, &[GAIN])
    }

    pub fn has_force_bulb(&self) -> bool {
        self.supports(CCD_FORCE_BLOB, &[FORCE_ON, FORCE_OFF])
    }

    pub fn has_binning(&self) -> bool {
        self.supports(CCD_BINNING, &[HOR_BIN, VER_BIN])
    }

    pub fn has_frame_types(&self) -> bool {
        self.ctx.read_property(&self.device, CCD_FRAME_TYPE, |_| ()).is_some()
    }

    pub fn has_upload_modes(&self) -> bool {
        self.supports(UPLOAD_MODE, &[UPLOAD_CLIENT, UPLOAD_LOCAL, UPLOAD_BOTH])
    }

    pub fn has_upload_settings(&self) -> bool {
        self.supports(UPLOAD_SETTINGS, &[UPLOAD_DIR, UPLOAD_PREFIX])
    }

    pub fn has_formats(&self) -> bool {
        self.ctx.read_property(&self.device, CAPTURE_FORMAT, |_| ()).is_some()
    }

    pub fn has_transfer_formats(&self) -> bool {
        self.ctx.read_property(&self.device, CCD_TRANSFER_FORMAT, |_| ()).is_some()
    }

    // Option lists and selections

    /// Selectable exposure presets; "time" and "bulb" entries are left out.
    pub fn presets(&self) -> Vec<SwitchOption> {
        self.options(CCD_EXPOSURE_PRESETS)
            .into_iter()
            .filter(|o| {
                let label = o.label.to_lowercase();
                label != "time" && label != "bulb"
            })
            .collect()
    }

    pub fn iso_values(&self) -> Vec<SwitchOption> {
        self.options(CCD_ISO)
    }

    pub fn frame_types(&self) -> Vec<SwitchOption> {
        self.options(CCD_FRAME_TYPE)
    }

    pub fn formats(&self) -> Vec<SwitchOption> {
        self.options(CAPTURE_FORMAT)
    }

    pub fn transfer_formats(&self) -> Vec<SwitchOption> {
        self.options(CCD_TRANSFER_FORMAT)
    }

    pub fn selected_preset(&self) -> IndiResult<Option<SwitchOption>> {
        self.selected(CCD_EXPOSURE_PRESETS, "presets")?;
        Ok(self.presets().into_iter().find(|o| o.selected))
    }

    pub fn selected_iso(&self) -> IndiResult<Option<SwitchOption>> {
        self.selected(CCD_ISO, "iso")
    }

    pub fn selected_frame_type(&self) -> IndiResult<Option<SwitchOption>> {
        self.selected(CCD_FRAME_TYPE, "frame types")
    }

    pub fn selected_format(&self) -> IndiResult<Option<SwitchOption>> {
        self.selected(CAPTURE_FORMAT, "formats")
    }

    pub fn selected_transfer_format(&self) -> IndiResult<Option<SwitchOption>> {
        self.selected(CCD_TRANSFER_FORMAT, "transfer formats")
    }

    pub fn gain(&self) -> Option<f64> {
        self.ctx.read_property(&self.device, CCD_GAIN, |p| p.number(GAIN)).flatten()
    }

    pub fn binning(&self) -> Option<(u32, u32)> {
        self.ctx
            .read_property(&self.device, CCD_BINNING, |p| Some((p.number(HOR_BIN)? as u32, p.number(VER_BIN)? as u32)))
            .flatten()
    }

    pub fn exposure_state(&self) -> Option<PropertyState> {
        self.ctx.read_property(&self.device, CCD_EXPOSURE, |p| p.state)
    }

    /// Remaining seconds reported by the driver
    pub fn exposure_remaining(&self) -> Option<f64> {
        self.ctx
            .read_property(&self.device, CCD_EXPOSURE, |p| p.number(CCD_EXPOSURE_VALUE))
            .flatten()
    }

    // Captures

    /// Timed exposure. Force bulb is switched on in the same batch when present.
    pub fn capture_seconds(&self, seconds: f64) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        staging.require(CCD_EXPOSURE, &[CCD_EXPOSURE_VALUE], "capture")?;
        if staging.supports(CCD_FORCE_BLOB, &[FORCE_ON, FORCE_OFF]) {
            staging.select(CCD_FORCE_BLOB, FORCE_ON)?;
        }
        staging.set(CCD_EXPOSURE, CCD_EXPOSURE_VALUE, Value::Number(seconds))?;
        staging.commit()
    }

    /// Preset exposure. Force bulb is switched off in the same batch when present.
    pub fn capture_preset(&self, preset: &str) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        staging.require(CCD_EXPOSURE_PRESETS, &[preset], "capture preset")?;
        if staging.supports(CCD_FORCE_BLOB, &[FORCE_ON, FORCE_OFF]) {
            staging.select(CCD_FORCE_BLOB, FORCE_OFF)?;
        }
        staging.select(CCD_EXPOSURE_PRESETS, preset)?;
        staging.commit()
    }

    pub fn capture(&self, exposure: &Exposure) -> IndiResult<()> {
        match exposure {
            Exposure::Seconds(seconds) => self.capture_seconds(*seconds),
            Exposure::Preset(preset) => self.capture_preset(preset),
        }
    }

    /// Resolve user input to an exposure: a preset label or a number of seconds.
    ///
    /// A preset label wins over a number when the camera has both.
    pub fn parse_exposure(&self, input: &str) -> IndiResult<Exposure> {
        let input = input.trim();
        let can_capture = self.can_capture();
        let has_presets = self.has_presets();
        if !can_capture && !has_presets {
            return Err(self.unsupported_or_gone("capture"));
        }
        if has_presets {
            if let Some(preset) = self.presets().into_iter().find(|o| o.label == input) {
                return Ok(Exposure::Preset(preset.name));
            }
            if !can_capture {
                return Err(IndiError::invalid(&self.device, CCD_EXPOSURE_PRESETS, input, "preset not found"));
            }
        }
        input
            .parse::<f64>()
            .map(Exposure::Seconds)
            .map_err(|_| IndiError::invalid(&self.device, CCD_EXPOSURE, CCD_EXPOSURE_VALUE, format!("'{}' is not an exposure time", input)))
    }

    pub fn capture_str(&self, input: &str) -> IndiResult<()> {
        let exposure = self.parse_exposure(input)?;
        self.capture(&exposure)
    }

    /// Stop a running loop, then abort the exposure if the driver can.
    pub fn abort(&self) -> IndiResult<()> {
        self.stop_loop_with(LoopStopReason::Cancelled);
        if !self.ctx.has_device(&self.device) {
            return Err(IndiError::DeviceGone(self.device.clone()));
        }
        if !self.can_abort() {
            return Ok(());
        }
        let mut staging = self.ctx.stage(&self.device)?;
        staging.set(CCD_ABORT_EXPOSURE, ABORT, Value::Switch(SwitchStatus::On))?;
        staging.commit()
    }

    // Settings

    pub fn set_gain(&self, gain: f64) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        staging.require(CCD_GAIN, &[GAIN], "gain")?;
        staging.set(CCD_GAIN, GAIN, Value::Number(gain))?;
        staging.commit()
    }

    /// Same binning on both axes
    pub fn set_binning(&self, binning: u32) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        staging.require(CCD_BINNING, &[HOR_BIN, VER_BIN], "binning")?;
        staging
            .set(CCD_BINNING, HOR_BIN, Value::Number(f64::from(binning)))?
            .set(CCD_BINNING, VER_BIN, Value::Number(f64::from(binning)))?;
        staging.commit()
    }

    fn select_one(&self, property: &str, element: &str, operation: &str) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        staging.require(property, &[element], operation)?;
        staging.select(property, element)?;
        staging.commit()
    }

    pub fn set_iso(&self, element: &str) -> IndiResult<()> {
        self.select_one(CCD_ISO, element, "iso")
    }

    pub fn set_format(&self, element: &str) -> IndiResult<()> {
        self.select_one(CAPTURE_FORMAT, element, "format")
    }

    pub fn set_transfer_format(&self, element: &str) -> IndiResult<()> {
        self.select_one(CCD_TRANSFER_FORMAT, element, "transfer format")
    }

    pub fn set_frame_type(&self, element: &str) -> IndiResult<()> {
        self.select_one(CCD_FRAME_TYPE, element, "frame type")
    }

    pub fn set_preset(&self, element: &str) -> IndiResult<()> {
        self.select_one(CCD_EXPOSURE_PRESETS, element, "preset")
    }

    pub fn set_upload_mode(&self, mode: UploadMode) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        staging.require(UPLOAD_MODE, &[UPLOAD_CLIENT, UPLOAD_LOCAL, UPLOAD_BOTH], "upload mode")?;
        staging.select(UPLOAD_MODE, mode.element())?;
        staging.commit()
    }

    pub fn set_upload_dir(&self, dir: &str) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        staging.require(UPLOAD_SETTINGS, &[UPLOAD_DIR, UPLOAD_PREFIX], "upload settings")?;
        staging.set(UPLOAD_SETTINGS, UPLOAD_DIR, Value::Text(dir.to_string()))?;
        staging.commit()
    }

    pub fn set_upload_prefix(&self, prefix: &str) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        staging.require(UPLOAD_SETTINGS, &[UPLOAD_DIR, UPLOAD_PREFIX], "upload settings")?;
        staging.set(UPLOAD_SETTINGS, UPLOAD_PREFIX, Value::Text(prefix.to_string()))?;
        staging.commit()
    }

    /// Prefix template used by capture loops.
    ///
    /// Defaults to the driver's current prefix without its `_XXX` counter.
    pub fn file_prefix(&self) -> IndiResult<String> {
        if let Some(prefix) = self.file_prefix.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Ok(prefix);
        }
        self.ctx
            .read_property(&self.device, UPLOAD_SETTINGS, |p| p.text(UPLOAD_PREFIX).map(|t| t.replace("_XXX", "")))
            .flatten()
            .ok_or_else(|| self.unsupported_or_gone("upload settings"))
    }

    pub fn set_file_prefix(&self, template: &str) {
        *self.file_prefix.lock().unwrap_or_else(PoisonError::into_inner) = Some(template.to_string());
    }

    pub fn save_mode(&self) -> SaveMode {
        *self.save_mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Switch the upload mode (when available) and the `CCD1` BLOB policy.
    pub fn set_save_mode(&self, mode: SaveMode) -> IndiResult<()> {
        if !self.has_blob() {
            return Err(self.unsupported_or_gone("save mode"));
        }
        *self.save_mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
        if self.has_upload_modes() {
            if let Err(e) = self.set_upload_mode(mode.upload_mode()) {
                self.report_error(&e);
                return Err(e);
            }
        }
        let xml = protocol::enable_blob(&self.device, Some(standard_properties::CCD1), mode.blob_mode());
        self.ctx.updater.send_raw(xml).map_err(|e| {
            self.report_error(&e);
            e
        })
    }

    fn report_error(&self, error: &IndiError) {
        tracing::error!("Camera {}: {}", self.device, error);
        self.ctx.events.emit(ClientEvent::CameraError {
            device: self.device.clone(),
            message: error.to_string(),
        });
    }

    // Capture loop

    pub fn is_looping(&self) -> bool {
        self.active_loop.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Completed and total captures of the running loop
    pub fn loop_progress(&self) -> Option<(u32, u32)> {
        self.active_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|h| *h.progress.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Loop with the configured default delay
    pub fn start_capture_loop(&self, exposure: Exposure, count: u32) -> IndiResult<()> {
        self.start_loop(CaptureLoop::new(exposure, count).with_delay(self.ctx.loop_delay))
    }

    /// Start a capture loop, replacing a running one. Must be called inside a tokio runtime.
    pub fn start_loop(&self, settings: CaptureLoop) -> IndiResult<()> {
        match &settings.exposure {
            Exposure::Seconds(seconds) => {
                if !self.can_capture() {
                    return Err(self.unsupported_or_gone("capture loop"));
                }
                if !seconds.is_finite() || *seconds <= 0.0 {
                    return Err(IndiError::invalid(
                        &self.device,
                        CCD_EXPOSURE,
                        CCD_EXPOSURE_VALUE,
                        "exposure time must be positive",
                    ));
                }
            }
            Exposure::Preset(preset) => {
                if !self.supports(CCD_EXPOSURE_PRESETS, &[preset.as_str()]) {
                    return Err(self.unsupported_or_gone("capture loop"));
                }
            }
        }

        self.stop_loop_with(LoopStopReason::Cancelled);

        if let Exposure::Seconds(_) = settings.exposure {
            if self.has_force_bulb() {
                let mut staging = self.ctx.stage(&self.device)?;
                staging.select(CCD_FORCE_BLOB, FORCE_ON)?;
                staging.commit()?;
            }
        }

        let template = if self.has_upload_settings() {
            self.file_prefix().ok()
        } else {
            None
        };

        let handle = LoopHandle {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(LoopStopReason::Cancelled)),
            progress: Arc::new(Mutex::new((0, settings.count))),
        };
        // Subscribe before the first capture goes out
        let events = self.ctx.events.subscribe();
        let runner = LoopRunner {
            camera: self.clone(),
            settings,
            template,
            id: handle.id,
            token: handle.token.clone(),
            reason: handle.reason.clone(),
            progress: handle.progress.clone(),
        };
        *self.active_loop.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        tokio::spawn(runner.run(events));
        Ok(())
    }

    pub fn stop_loop(&self) {
        self.stop_loop_with(LoopStopReason::Cancelled);
    }

    pub(crate) fn stop_loop_with(&self, reason: LoopStopReason) {
        if let Some(handle) = self.active_loop.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.stop(reason);
        }
    }

    fn exposure_label(&self, exposure: &Exposure) -> String {
        match exposure {
            Exposure::Seconds(seconds) => format!("{:.2}", seconds),
            Exposure::Preset(preset) => self
                .presets()
                .into_iter()
                .find(|o| &o.name == preset)
                .map(|o| o.label)
                .unwrap_or_else(|| preset.clone())
                .replace('/', "over"),
        }
    }
}

/// Expand an upload prefix template for one capture.
///
/// `%e` exposure, `%d` date, `%t` hour and minute, `%f` frame type. The
/// `_XXX` suffix is the driver's sequence counter placeholder.
pub fn format_upload_prefix(template: &str, exposure: &str, frame_type: Option<&str>, now: DateTime<Local>) -> String {
    let mut prefix = template
        .replace("%e", exposure)
        .replace("%d", &now.format("%Y-%m-%d").to_string())
        .replace("%t", &now.format("%H-%M").to_string());
    if let Some(frame_type) = frame_type {
        prefix = prefix.replace("%f", &frame_type.to_lowercase());
    }
    prefix.push_str("_XXX");
    prefix
}

enum Outcome {
    Completed,
    Stopped(LoopStopReason),
}

fn exposure_outcome(state: PropertyState) -> Option<Outcome> {
    match state {
        PropertyState::Ok => Some(Outcome::Completed),
        PropertyState::Alert | PropertyState::Idle => Some(Outcome::Stopped(LoopStopReason::ExposureFailed)),
        PropertyState::Busy => None,
    }
}

struct LoopRunner {
    camera: Camera,
    settings: CaptureLoop,
    template: Option<String>,
    id: u64,
    token: CancellationToken,
    reason: Arc<Mutex<LoopStopReason>>,
    progress: Arc<Mutex<(u32, u32)>>,
}

impl LoopRunner {
    async fn run(self, mut events: broadcast::Receiver<ClientEvent>) {
        let device = self.camera.device.clone();
        let total = self.settings.count;
        let mut done = 0u32;
        tracing::info!("Camera {}: capture loop started ({} captures)", device, total);

        let reason = loop {
            if self.token.is_cancelled() {
                break self.cancel_reason();
            }
            if let Err(e) = self.issue_capture() {
                break match e {
                    IndiError::DeviceGone(_) | IndiError::NotConnected => LoopStopReason::Disconnected,
                    other => {
                        self.camera.report_error(&other);
                        LoopStopReason::Error(other.to_string())
                    }
                };
            }

            match self.wait_for_exposure(&mut events).await {
                Outcome::Completed => {}
                Outcome::Stopped(reason) => break reason,
            }

            done += 1;
            *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = (done, total);
            self.camera.ctx.events.emit(ClientEvent::CameraLoopProgress {
                device: device.clone(),
                done,
                total,
            });
            if total != 0 && done >= total {
                break LoopStopReason::Finished;
            }

            if !self.settings.delay.is_zero() {
                tokio::select! {
                    _ = self.token.cancelled() => break self.cancel_reason(),
                    _ = tokio::time::sleep(self.settings.delay) => {}
                }
            } else if self.token.is_cancelled() {
                break self.cancel_reason();
            }
        };

        {
            let mut active = self.camera.active_loop.lock().unwrap_or_else(PoisonError::into_inner);
            if active.as_ref().map(|h| h.id) == Some(self.id) {
                *active = None;
            }
        }
        tracing::info!("Camera {}: capture loop stopped after {} captures: {:?}", device, done, reason);
        self.camera.ctx.events.emit(ClientEvent::CameraLoopStopped {
            device,
            completed: done,
            reason,
        });
    }

    fn cancel_reason(&self) -> LoopStopReason {
        self.reason.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn issue_capture(&self) -> IndiResult<()> {
        if let Some(template) = &self.template {
            let frame_type = self.camera.selected_frame_type().ok().flatten().map(|o| o.label);
            let label = self.camera.exposure_label(&self.settings.exposure);
            let prefix = format_upload_prefix(template, &label, frame_type.as_deref(), Local::now());
            self.camera.set_upload_prefix(&prefix)?;
        }
        self.camera.capture(&self.settings.exposure)
    }

    async fn wait_for_exposure(&self, events: &mut broadcast::Receiver<ClientEvent>) -> Outcome {
        let device = self.camera.device.as_str();
        loop {
            let event = tokio::select! {
                _ = self.token.cancelled() => return Outcome::Stopped(self.cancel_reason()),
                event = events.recv() => event,
            };
            match event {
                Ok(ClientEvent::PropertyUpdated { device: d, property, state }) if d == device && property == CCD_EXPOSURE => {
                    if let Some(outcome) = exposure_outcome(state) {
                        return outcome;
                    }
                }
                Ok(ClientEvent::SpecializationRemoved { device: d, kind: Specialization::Camera }) if d == device => {
                    return Outcome::Stopped(LoopStopReason::Disconnected)
                }
                Ok(ClientEvent::ConnectionLost { .. })
                | Ok(ClientEvent::ConnectionStateChanged(ConnectionState::Disconnected)) => {
                    return Outcome::Stopped(LoopStopReason::Disconnected)
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // The exposure may have finished among the dropped events
                    tracing::warn!("Camera {}: capture loop missed {} events, re-reading exposure state", device, missed);
                    match self.camera.ctx.read_property(device, CCD_EXPOSURE, |p| p.state) {
                        Some(state) => {
                            if let Some(outcome) = exposure_outcome(state) {
                                return outcome;
                            }
                        }
                        None => return Outcome::Stopped(LoopStopReason::Disconnected),
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Outcome::Stopped(LoopStopReason::Disconnected),
            }
        }
    }
}
