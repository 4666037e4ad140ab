//! In-memory mirror of the server's device tree
//!
//! Devices and properties live in owning vectors and refer to each other by
//! name only. The store never performs I/O; the connection manager feeds it
//! server pushes and turns its outcomes into events.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::device::Device;
use super::property::{Property, PropertyState, PropertyUpdate, StagedVector, Value};
use crate::error::{IndiError, IndiResult, ProtocolDataError};

pub type SharedStore = Arc<RwLock<DeviceStore>>;

pub(crate) fn read_store(store: &RwLock<DeviceStore>) -> RwLockReadGuard<'_, DeviceStore> {
    store.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_store(store: &RwLock<DeviceStore>) -> RwLockWriteGuard<'_, DeviceStore> {
    store.write().unwrap_or_else(PoisonError::into_inner)
}

/// What an upsert changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub device_added: bool,
    pub replaced: bool,
}

/// Result of merging a server push into an existing property
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub state: PropertyState,
    pub issues: Vec<ProtocolDataError>,
}

#[derive(Debug, Default)]
pub struct DeviceStore {
    devices: Vec<Device>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name.clone()).collect()
    }

    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }

    fn device_mut(&mut self, name: &str) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.name == name)
    }

    pub fn property(&self, device: &str, name: &str) -> Option<&Property> {
        self.device(device)?.property(name)
    }

    pub fn has_property(&self, device: &str, name: &str) -> bool {
        self.property(device, name).is_some()
    }

    fn property_mut(&mut self, device: &str, name: &str) -> IndiResult<&mut Property> {
        self.device_mut(device)
            .and_then(|d| d.property_mut(name))
            .ok_or_else(|| IndiError::PropertyNotFound {
                device: device.to_string(),
                property: name.to_string(),
            })
    }

    /// New or redefined property. A redefinition replaces the old one whole.
    pub fn upsert_property(&mut self, property: Property) -> UpsertOutcome {
        let device_added = self.device(&property.device).is_none();
        if device_added {
            self.devices.push(Device::new(&property.device));
        }
        let replaced = match self.device_mut(&property.device) {
            Some(device) => device.upsert(property),
            None => false,
        };
        UpsertOutcome { device_added, replaced }
    }

    /// Removing an absent property is not an error.
    pub fn remove_property(&mut self, device: &str, name: &str) -> Option<Property> {
        self.device_mut(device)?.remove(name)
    }

    pub fn remove_device(&mut self, device: &str) -> Option<Device> {
        let idx = self.devices.iter().position(|d| d.name == device)?;
        Some(self.devices.remove(idx))
    }

    /// Drop everything; returns the names of the removed devices.
    pub fn clear(&mut self) -> Vec<String> {
        self.devices.drain(..).map(|d| d.name).collect()
    }

    pub fn set_desired_value(&mut self, device: &str, property: &str, element: &str, value: Value) -> IndiResult<()> {
        self.property_mut(device, property)?.set_desired(element, value)
    }

    /// One-of-many selection: `element` On, every sibling Off
    pub fn select_switch(&mut self, device: &str, property: &str, element: &str) -> IndiResult<()> {
        self.property_mut(device, property)?.select_one(element)
    }

    /// Overwrite current values from a server push.
    pub fn merge_server_update(&mut self, update: &PropertyUpdate) -> IndiResult<MergeOutcome> {
        let property = self.property_mut(&update.device, &update.name)?;
        let issues = property.merge(update);
        Ok(MergeOutcome {
            state: property.state,
            issues,
        })
    }

    pub fn take_staged(&mut self, device: &str, property: &str) -> IndiResult<Option<StagedVector>> {
        Ok(self.property_mut(device, property)?.take_staged())
    }

    pub fn discard_staged(&mut self, device: &str, property: &str) {
        if let Ok(p) = self.property_mut(device, property) {
            p.clear_desired();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::property::tests::{number_property, switch_property};
    use crate::model::property::{ElementUpdate, PropertyType, RawValue};

    #[test]
    fn test_upsert_creates_device_and_replaces() {
        let mut store = DeviceStore::new();
        let outcome = store.upsert_property(switch_property("Mount1", "TELESCOPE_MOTION_NS", &[("MOTION_NORTH", false), ("MOTION_SOUTH", false)]));
        assert_eq!(outcome, UpsertOutcome { device_added: true, replaced: false });

        let outcome = store.upsert_property(switch_property("Mount1", "TELESCOPE_MOTION_NS", &[("MOTION_NORTH", true)]));
        assert_eq!(outcome, UpsertOutcome { device_added: false, replaced: true });

        let prop = store.property("Mount1", "TELESCOPE_MOTION_NS").unwrap();
        assert_eq!(prop.element_names(), vec!["MOTION_NORTH"]);
        assert_eq!(store.device("Mount1").unwrap().properties().len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut store = DeviceStore::new();
        store.upsert_property(number_property("CCD", "CCD_GAIN", &[("GAIN", 0.0, 0.0, 100.0)]));
        assert!(store.remove_property("CCD", "CCD_GAIN").is_some());
        assert!(store.remove_property("CCD", "CCD_GAIN").is_none());
        assert!(store.remove_property("Nope", "CCD_GAIN").is_none());
        assert!(store.device("CCD").is_some());
        assert!(store.remove_device("CCD").is_some());
        assert!(store.remove_device("CCD").is_none());
    }

    #[test]
    fn test_latest_operation_wins_for_any_sequence() {
        // (op, property, version): op true = upsert, false = remove
        let script: &[(bool, &str, f64)] = &[
            (true, "A", 1.0),
            (false, "B", 0.0),
            (true, "B", 1.0),
            (true, "A", 2.0),
            (false, "A", 0.0),
            (false, "A", 0.0),
            (true, "C", 1.0),
            (true, "B", 2.0),
            (false, "C", 0.0),
            (true, "A", 3.0),
        ];
        let mut store = DeviceStore::new();
        let mut expected: std::collections::HashMap<&str, Option<f64>> = Default::default();
        for (upsert, name, version) in script {
            if *upsert {
                store.upsert_property(number_property("Dev", name, &[("V", *version, 0.0, 0.0)]));
                expected.insert(*name, Some(*version));
            } else {
                store.remove_property("Dev", name);
                expected.insert(*name, None);
            }
            for (name, version) in &expected {
                let seen = store.property("Dev", name).and_then(|p| p.number("V"));
                assert_eq!(seen, *version, "property {}", name);
            }
        }
    }

    #[test]
    fn test_desired_survives_merge_of_sibling() {
        let mut store = DeviceStore::new();
        store.upsert_property(number_property("CCD", "CCD_BINNING", &[("HOR_BIN", 1.0, 1.0, 4.0), ("VER_BIN", 1.0, 1.0, 4.0)]));
        store.set_desired_value("CCD", "CCD_BINNING", "HOR_BIN", Value::Number(2.0)).unwrap();

        let update = PropertyUpdate {
            device: "CCD".to_string(),
            name: "CCD_BINNING".to_string(),
            kind: PropertyType::Number,
            state: Some(PropertyState::Busy),
            timeout: None,
            timestamp: None,
            message: None,
            values: vec![ElementUpdate {
                name: "VER_BIN".to_string(),
                value: RawValue::Text("3".to_string()),
            }],
        };
        let outcome = store.merge_server_update(&update).unwrap();
        assert_eq!(outcome.state, PropertyState::Busy);
        assert!(outcome.issues.is_empty());

        let prop = store.property("CCD", "CCD_BINNING").unwrap();
        assert_eq!(prop.desired("HOR_BIN"), Some(Value::Number(2.0)));
        assert_eq!(prop.number("VER_BIN"), Some(3.0));
    }

    #[test]
    fn test_merge_unknown_property() {
        let mut store = DeviceStore::new();
        let update = PropertyUpdate {
            device: "CCD".to_string(),
            name: "CCD_TEMPERATURE".to_string(),
            kind: PropertyType::Number,
            state: None,
            timeout: None,
            timestamp: None,
            message: None,
            values: Vec::new(),
        };
        assert!(matches!(
            store.merge_server_update(&update),
            Err(IndiError::PropertyNotFound { .. })
        ));
    }

    #[test]
    fn test_take_staged_and_discard() {
        let mut store = DeviceStore::new();
        store.upsert_property(switch_property("Mount", "TELESCOPE_PARK", &[("PARK", false), ("UNPARK", true)]));
        store.select_switch("Mount", "TELESCOPE_PARK", "PARK").unwrap();
        store.discard_staged("Mount", "TELESCOPE_PARK");
        assert_eq!(store.take_staged("Mount", "TELESCOPE_PARK").unwrap(), None);

        store.select_switch("Mount", "TELESCOPE_PARK", "PARK").unwrap();
        let staged = store.take_staged("Mount", "TELESCOPE_PARK").unwrap().unwrap();
        assert_eq!(staged.values.len(), 2);
        assert!(store.take_staged("Mount", "MISSING").is_err());
    }

    #[test]
    fn test_clear_returns_device_names() {
        let mut store = DeviceStore::new();
        store.upsert_property(switch_property("A", "CONNECTION", &[("CONNECT", true)]));
        store.upsert_property(switch_property("B", "CONNECTION", &[("CONNECT", true)]));
        assert_eq!(store.clear(), vec!["A".to_string(), "B".to_string()]);
        assert!(store.devices().is_empty());
    }
}
