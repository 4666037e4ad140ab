//! Specialized device wrappers
//!
//! A wrapper is a thin view keyed by device name. It holds no references into
//! the model: every capability check and every action resolves the current
//! property definition by name, so a redefined or removed property is never
//! seen through a stale handle.

mod camera;
mod focuser;
mod mount;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use camera::{format_upload_prefix, Camera, CaptureLoop, Exposure, LoopStopReason, SaveMode, UploadMode};
pub use focuser::Focuser;
pub use mount::{CoordSetMode, Mount, MotionDirection};

use crate::astro::Equatorial;
use crate::error::IndiResult;
use crate::events::{ClientEvent, EventHub};
use crate::log::LogRing;
use crate::model::{read_store, DeviceStore, Property, PropertyUpdate, RawValue, SharedStore};
use crate::protocol::standard_elements;
use crate::protocol::standard_properties::*;
use crate::update::{PropertyUpdater, Staging};

/// Device kinds with a dedicated wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Specialization {
    Camera,
    Focuser,
    Mount,
}

impl Specialization {
    pub const ALL: [Specialization; 3] = [Specialization::Camera, Specialization::Focuser, Specialization::Mount];

    /// Whether a property of this name makes a device this kind
    pub fn is_defined_by(self, property: &str) -> bool {
        match self {
            Specialization::Camera => property.starts_with("CCD_") || property.starts_with("CAPTURE_"),
            Specialization::Focuser => {
                property.starts_with("FOCUS_") || property == ABS_FOCUS_POSITION || property == REL_FOCUS_POSITION
            }
            Specialization::Mount => {
                property.starts_with("TELESCOPE_") || property == EQUATORIAL_EOD_COORD || property == ON_COORD_SET
            }
        }
    }

    /// Defining properties plus the optional ones the wrapper also uses
    pub fn uses(self, property: &str) -> bool {
        self.is_defined_by(property)
            || (self == Specialization::Camera && matches!(property, CCD1 | UPLOAD_MODE | UPLOAD_SETTINGS))
    }
}

/// Shared plumbing handed to every wrapper
#[derive(Debug)]
pub struct DeviceContext {
    pub(crate) store: SharedStore,
    pub(crate) updater: PropertyUpdater,
    pub(crate) events: EventHub,
    pub(crate) log_ring: Arc<LogRing>,
    /// Default pause between captures of a loop
    pub(crate) loop_delay: Duration,
}

impl DeviceContext {
    pub(crate) fn new(store: SharedStore, updater: PropertyUpdater, events: EventHub, log_ring: Arc<LogRing>) -> Self {
        Self {
            store,
            updater,
            events,
            log_ring,
            loop_delay: Duration::ZERO,
        }
    }

    /// Append to the log ring, mirror to tracing and notify listeners.
    pub(crate) fn log(&self, message: impl Into<String>, device: Option<&str>) {
        let item = self.log_ring.append(message, device);
        match &item.device {
            Some(device) => tracing::info!("[{}] {}", device, item.message),
            None => tracing::info!("{}", item.message),
        }
        self.events.emit(ClientEvent::LogAppended(item));
    }

    pub(crate) fn stage(&self, device: &str) -> IndiResult<Staging<'_>> {
        Staging::begin(self, device)
    }

    pub(crate) fn has_device(&self, device: &str) -> bool {
        read_store(&self.store).device(device).is_some()
    }

    /// Run `f` against the current definition of a property.
    pub(crate) fn read_property<T>(&self, device: &str, property: &str, f: impl FnOnce(&Property) -> T) -> Option<T> {
        read_store(&self.store).property(device, property).map(f)
    }

    /// Whether `property` is defined with every one of `elements`
    pub(crate) fn supports(&self, device: &str, property: &str, elements: &[&str]) -> bool {
        self.read_property(device, property, |p| p.has_elements(elements))
            .unwrap_or(false)
    }
}

/// Device → wrapper maps, kept in step with the model
#[derive(Debug, Default)]
pub(crate) struct DeviceRegistry {
    cameras: BTreeMap<String, Arc<Camera>>,
    focusers: BTreeMap<String, Arc<Focuser>>,
    mounts: BTreeMap<String, Arc<Mount>>,
}

impl DeviceRegistry {
    pub fn camera(&self, device: &str) -> Option<Arc<Camera>> {
        self.cameras.get(device).cloned()
    }

    pub fn cameras(&self) -> Vec<Arc<Camera>> {
        self.cameras.values().cloned().collect()
    }

    pub fn focuser(&self, device: &str) -> Option<Arc<Focuser>> {
        self.focusers.get(device).cloned()
    }

    pub fn focusers(&self) -> Vec<Arc<Focuser>> {
        self.focusers.values().cloned().collect()
    }

    pub fn mount(&self, device: &str) -> Option<Arc<Mount>> {
        self.mounts.get(device).cloned()
    }

    pub fn mounts(&self) -> Vec<Arc<Mount>> {
        self.mounts.values().cloned().collect()
    }

    pub fn kinds_of(&self, device: &str) -> Vec<Specialization> {
        Specialization::ALL
            .into_iter()
            .filter(|kind| self.contains(*kind, device))
            .collect()
    }

    fn contains(&self, kind: Specialization, device: &str) -> bool {
        match kind {
            Specialization::Camera => self.cameras.contains_key(device),
            Specialization::Focuser => self.focusers.contains_key(device),
            Specialization::Mount => self.mounts.contains_key(device),
        }
    }

    fn insert(&mut self, kind: Specialization, ctx: &Arc<DeviceContext>, device: &str) {
        match kind {
            Specialization::Camera => {
                self.cameras.insert(device.to_string(), Arc::new(Camera::new(ctx.clone(), device)));
            }
            Specialization::Focuser => {
                self.focusers.insert(device.to_string(), Arc::new(Focuser::new(ctx.clone(), device)));
            }
            Specialization::Mount => {
                self.mounts.insert(device.to_string(), Arc::new(Mount::new(ctx.clone(), device)));
            }
        }
    }

    fn remove(&mut self, kind: Specialization, device: &str) {
        match kind {
            Specialization::Camera => {
                if let Some(camera) = self.cameras.remove(device) {
                    camera.stop_loop_with(LoopStopReason::Disconnected);
                }
            }
            Specialization::Focuser => {
                self.focusers.remove(device);
            }
            Specialization::Mount => {
                self.mounts.remove(device);
            }
        }
    }

    /// Re-evaluate the wrappers of `device` after `property` was defined or removed.
    pub fn sync_device(
        &mut self,
        ctx: &Arc<DeviceContext>,
        store: &DeviceStore,
        device: &str,
        property: &str,
        events: &mut Vec<ClientEvent>,
    ) {
        for kind in Specialization::ALL {
            let wanted = store
                .device(device)
                .map(|d| d.properties().iter().any(|p| kind.is_defined_by(&p.name)))
                .unwrap_or(false);
            let present = self.contains(kind, device);
            if wanted && !present {
                self.insert(kind, ctx, device);
                events.push(ClientEvent::SpecializationAdded {
                    device: device.to_string(),
                    kind,
                });
            } else if !wanted && present {
                self.remove(kind, device);
                events.push(ClientEvent::SpecializationRemoved {
                    device: device.to_string(),
                    kind,
                });
            } else if wanted && kind.uses(property) {
                events.push(ClientEvent::CapabilitiesChanged {
                    device: device.to_string(),
                    kind,
                });
            }
        }
    }

    pub fn remove_device(&mut self, device: &str, events: &mut Vec<ClientEvent>) {
        for kind in self.kinds_of(device) {
            self.remove(kind, device);
            events.push(ClientEvent::SpecializationRemoved {
                device: device.to_string(),
                kind,
            });
        }
    }

    pub fn clear(&mut self, events: &mut Vec<ClientEvent>) {
        let devices: Vec<String> = self
            .cameras
            .keys()
            .chain(self.focusers.keys())
            .chain(self.mounts.keys())
            .cloned()
            .collect();
        for device in devices {
            self.remove_device(&device, events);
        }
    }

    /// Wrapper-level notifications for a merged server push
    pub fn updated(&self, store: &DeviceStore, update: &PropertyUpdate, events: &mut Vec<ClientEvent>) {
        let device = update.device.as_str();
        let Some(property) = store.property(device, &update.name) else {
            return;
        };

        if let Some(camera) = self.cameras.get(device) {
            match update.name.as_str() {
                CCD_EXPOSURE => events.push(ClientEvent::CameraExposureState {
                    device: device.to_string(),
                    state: property.state,
                }),
                CCD1 if camera.save_mode().receives_images() => {
                    for value in &update.values {
                        if let RawValue::Blob(blob) = &value.value {
                            events.push(ClientEvent::CameraImageReady {
                                device: device.to_string(),
                                blob: blob.clone(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        if self.focusers.contains_key(device) {
            match update.name.as_str() {
                ABS_FOCUS_POSITION => {
                    if let Some(position) = property.number(standard_elements::FOCUS_ABSOLUTE_POSITION) {
                        events.push(ClientEvent::FocuserPositionChanged {
                            device: device.to_string(),
                            position,
                        });
                    }
                }
                FOCUS_SPEED => {
                    if let Some(speed) = property.number(standard_elements::FOCUS_SPEED_VALUE) {
                        events.push(ClientEvent::FocuserSpeedChanged {
                            device: device.to_string(),
                            speed,
                        });
                    }
                }
                _ => {}
            }
        }

        if self.mounts.contains_key(device) && update.name == EQUATORIAL_EOD_COORD {
            if let (Some(ra), Some(dec)) = (
                property.number(standard_elements::RA),
                property.number(standard_elements::DEC),
            ) {
                events.push(ClientEvent::MountCoordinatesChanged {
                    device: device.to_string(),
                    coordinates: Equatorial::from_hours(ra, dec),
                });
            }
        }
    }

    /// Mount currently reporting equatorial coordinates
    pub fn telescope(&self, store: &DeviceStore) -> Option<Arc<Mount>> {
        self.mounts
            .iter()
            .find(|(device, _)| store.has_property(device, EQUATORIAL_EOD_COORD))
            .map(|(_, mount)| mount.clone())
    }
}
