//! INDI properties and elements
//!
//! A property's element payload is a closed sum type ([`PropertyKind`]), one
//! variant per INDI vector kind. Every element keeps the last value pushed by
//! the server (`current`) apart from the locally staged one (`desired`).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{IndiError, IndiResult, ProtocolDataError};

/// INDI property types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    Text,
    Number,
    Switch,
    Light,
    Blob,
}

impl PropertyType {
    /// Vector tag infix used on the wire (`defNumberVector`, `oneBLOB`, ...)
    pub fn wire_name(self) -> &'static str {
        match self {
            PropertyType::Text => "Text",
            PropertyType::Number => "Number",
            PropertyType::Switch => "Switch",
            PropertyType::Light => "Light",
            PropertyType::Blob => "BLOB",
        }
    }

    pub fn from_wire_name(s: &str) -> Option<Self> {
        match s {
            "Text" => Some(PropertyType::Text),
            "Number" => Some(PropertyType::Number),
            "Switch" => Some(PropertyType::Switch),
            "Light" => Some(PropertyType::Light),
            "BLOB" => Some(PropertyType::Blob),
            _ => None,
        }
    }
}

/// INDI property state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PropertyState {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

impl PropertyState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Idle" => Some(PropertyState::Idle),
            "Ok" => Some(PropertyState::Ok),
            "Busy" => Some(PropertyState::Busy),
            "Alert" => Some(PropertyState::Alert),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PropertyState::Idle => "Idle",
            PropertyState::Ok => "Ok",
            PropertyState::Busy => "Busy",
            PropertyState::Alert => "Alert",
        };
        f.write_str(s)
    }
}

/// INDI property permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Permission {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

impl Permission {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "ro" => Permission::ReadOnly,
            "wo" => Permission::WriteOnly,
            _ => Permission::ReadWrite,
        }
    }

    pub fn is_writable(self) -> bool {
        self != Permission::ReadOnly
    }
}

/// Switch vector rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SwitchRule {
    #[default]
    OneOfMany,
    AtMostOne,
    AnyOfMany,
}

impl SwitchRule {
    pub fn parse(s: &str) -> Self {
        match s {
            "AtMostOne" => SwitchRule::AtMostOne,
            "AnyOfMany" => SwitchRule::AnyOfMany,
            _ => SwitchRule::OneOfMany,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SwitchStatus {
    On,
    #[default]
    Off,
}

impl SwitchStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "On" => Some(SwitchStatus::On),
            "Off" => Some(SwitchStatus::Off),
            _ => None,
        }
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            SwitchStatus::On => "On",
            SwitchStatus::Off => "Off",
        }
    }

    pub fn is_on(self) -> bool {
        self == SwitchStatus::On
    }
}

impl From<bool> for SwitchStatus {
    fn from(on: bool) -> Self {
        if on {
            SwitchStatus::On
        } else {
            SwitchStatus::Off
        }
    }
}

/// Number element limits
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NumberLimits {
    pub min: f64,
    pub max: f64,
    pub step: f64,
    /// printf-style format, e.g. `%010.6m`
    pub format: String,
}

impl NumberLimits {
    /// Range checking only applies when the server gave a real interval.
    pub fn is_bounded(&self) -> bool {
        self.min < self.max
    }

    pub fn contains(&self, value: f64) -> bool {
        !self.is_bounded() || (value >= self.min && value <= self.max)
    }
}

/// Decoded BLOB payload
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    /// Format after magic-byte verification, e.g. `.fits`
    pub format: String,
    /// Size announced by the server (may differ from `data.len()` for compressed payloads)
    pub size: usize,
    pub data: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchElement {
    pub name: String,
    pub label: String,
    pub current: SwitchStatus,
    pub desired: Option<SwitchStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumberElement {
    pub name: String,
    pub label: String,
    pub current: f64,
    pub desired: Option<f64>,
    pub limits: NumberLimits,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextElement {
    pub name: String,
    pub label: String,
    pub current: String,
    pub desired: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LightElement {
    pub name: String,
    pub label: String,
    pub current: PropertyState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlobElement {
    pub name: String,
    pub label: String,
    pub current: Option<Blob>,
}

/// Element payload of a property, one variant per vector kind
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    Switch {
        rule: SwitchRule,
        elements: Vec<SwitchElement>,
    },
    Number(Vec<NumberElement>),
    Text(Vec<TextElement>),
    Light(Vec<LightElement>),
    Blob(Vec<BlobElement>),
}

/// A writable value staged by local code
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Switch(SwitchStatus),
    Number(f64),
    Text(String),
}

impl Value {
    pub fn wire_text(&self) -> String {
        match self {
            Value::Switch(s) => s.as_wire().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Text(t) => t.clone(),
        }
    }
}

/// Element value as carried by a `set*Vector` push, before kind checking
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Text(String),
    Blob(Blob),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementUpdate {
    pub name: String,
    pub value: RawValue,
}

/// Authoritative server push for an already defined property
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyUpdate {
    pub device: String,
    pub name: String,
    pub kind: PropertyType,
    pub state: Option<PropertyState>,
    pub timeout: Option<f64>,
    pub timestamp: Option<String>,
    pub message: Option<String>,
    pub values: Vec<ElementUpdate>,
}

/// Staged values of one property, ready to become one `new*Vector`
#[derive(Debug, Clone, PartialEq)]
pub struct StagedVector {
    pub device: String,
    pub property: String,
    pub kind: PropertyType,
    pub values: Vec<(String, Value)>,
}

/// Label/name/selection of one switch, as shown to users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchOption {
    pub name: String,
    pub label: String,
    pub selected: bool,
}

/// An INDI property
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub device: String,
    pub name: String,
    pub label: String,
    pub group: String,
    pub state: PropertyState,
    pub perm: Permission,
    pub timeout: f64,
    pub timestamp: Option<String>,
    pub kind: PropertyKind,
}

impl Property {
    pub fn property_type(&self) -> PropertyType {
        match self.kind {
            PropertyKind::Switch { .. } => PropertyType::Switch,
            PropertyKind::Number(_) => PropertyType::Number,
            PropertyKind::Text(_) => PropertyType::Text,
            PropertyKind::Light(_) => PropertyType::Light,
            PropertyKind::Blob(_) => PropertyType::Blob,
        }
    }

    pub fn element_names(&self) -> Vec<&str> {
        match &self.kind {
            PropertyKind::Switch { elements, .. } => elements.iter().map(|e| e.name.as_str()).collect(),
            PropertyKind::Number(elements) => elements.iter().map(|e| e.name.as_str()).collect(),
            PropertyKind::Text(elements) => elements.iter().map(|e| e.name.as_str()).collect(),
            PropertyKind::Light(elements) => elements.iter().map(|e| e.name.as_str()).collect(),
            PropertyKind::Blob(elements) => elements.iter().map(|e| e.name.as_str()).collect(),
        }
    }

    pub fn has_element(&self, element: &str) -> bool {
        self.element_names().contains(&element)
    }

    pub fn has_elements(&self, elements: &[&str]) -> bool {
        elements.iter().all(|e| self.has_element(e))
    }

    pub fn number(&self, element: &str) -> Option<f64> {
        self.number_element(element).map(|e| e.current)
    }

    pub fn number_element(&self, element: &str) -> Option<&NumberElement> {
        match &self.kind {
            PropertyKind::Number(elements) => elements.iter().find(|e| e.name == element),
            _ => None,
        }
    }

    pub fn switch(&self, element: &str) -> Option<bool> {
        match &self.kind {
            PropertyKind::Switch { elements, .. } => {
                elements.iter().find(|e| e.name == element).map(|e| e.current.is_on())
            }
            _ => None,
        }
    }

    pub fn text(&self, element: &str) -> Option<&str> {
        match &self.kind {
            PropertyKind::Text(elements) => {
                elements.iter().find(|e| e.name == element).map(|e| e.current.as_str())
            }
            _ => None,
        }
    }

    pub fn light(&self, element: &str) -> Option<PropertyState> {
        match &self.kind {
            PropertyKind::Light(elements) => elements.iter().find(|e| e.name == element).map(|e| e.current),
            _ => None,
        }
    }

    pub fn blob(&self, element: &str) -> Option<&Blob> {
        match &self.kind {
            PropertyKind::Blob(elements) => {
                elements.iter().find(|e| e.name == element).and_then(|e| e.current.as_ref())
            }
            _ => None,
        }
    }

    /// Switch elements with their labels and current selection
    pub fn switch_options(&self) -> Vec<SwitchOption> {
        match &self.kind {
            PropertyKind::Switch { elements, .. } => elements
                .iter()
                .map(|e| SwitchOption {
                    name: e.name.clone(),
                    label: e.label.clone(),
                    selected: e.current.is_on(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// First switch currently On
    pub fn selected_switch(&self) -> Option<SwitchOption> {
        self.switch_options().into_iter().find(|o| o.selected)
    }

    /// Element name of the switch with the given label (or name)
    pub fn switch_by_label(&self, label: &str) -> Option<String> {
        self.switch_options()
            .into_iter()
            .find(|o| o.label == label || o.name == label)
            .map(|o| o.name)
    }

    /// Desired value of an element, if one is staged
    pub fn desired(&self, element: &str) -> Option<Value> {
        match &self.kind {
            PropertyKind::Switch { elements, .. } => elements
                .iter()
                .find(|e| e.name == element)
                .and_then(|e| e.desired.map(Value::Switch)),
            PropertyKind::Number(elements) => elements
                .iter()
                .find(|e| e.name == element)
                .and_then(|e| e.desired.map(Value::Number)),
            PropertyKind::Text(elements) => elements
                .iter()
                .find(|e| e.name == element)
                .and_then(|e| e.desired.clone().map(Value::Text)),
            PropertyKind::Light(_) | PropertyKind::Blob(_) => None,
        }
    }

    pub fn has_staged(&self) -> bool {
        match &self.kind {
            PropertyKind::Switch { elements, .. } => elements.iter().any(|e| e.desired.is_some()),
            PropertyKind::Number(elements) => elements.iter().any(|e| e.desired.is_some()),
            PropertyKind::Text(elements) => elements.iter().any(|e| e.desired.is_some()),
            PropertyKind::Light(_) | PropertyKind::Blob(_) => false,
        }
    }

    /// Validate and stage a value for one element.
    ///
    /// On error neither the current nor the desired value changes.
    pub fn set_desired(&mut self, element: &str, value: Value) -> IndiResult<()> {
        if !self.perm.is_writable() {
            return Err(IndiError::PermissionDenied(format!(
                "{}.{} is read-only",
                self.device, self.name
            )));
        }
        let kind_name = self.property_type().wire_name();
        let device = self.device.as_str();
        let property = self.name.as_str();
        let not_found = || IndiError::ElementNotFound {
            device: device.to_string(),
            property: property.to_string(),
            element: element.to_string(),
        };
        match (&mut self.kind, value) {
            (PropertyKind::Switch { elements, .. }, Value::Switch(status)) => {
                let elem = elements.iter_mut().find(|e| e.name == element).ok_or_else(not_found)?;
                elem.desired = Some(status);
                Ok(())
            }
            (PropertyKind::Number(elements), Value::Number(n)) => {
                let elem = elements.iter_mut().find(|e| e.name == element).ok_or_else(not_found)?;
                if !n.is_finite() {
                    return Err(IndiError::invalid(device, property, element, "value is not finite"));
                }
                if !elem.limits.contains(n) {
                    return Err(IndiError::ValueOutOfRange {
                        device: device.to_string(),
                        property: property.to_string(),
                        element: element.to_string(),
                        value: n,
                        min: elem.limits.min,
                        max: elem.limits.max,
                    });
                }
                elem.desired = Some(n);
                Ok(())
            }
            (PropertyKind::Text(elements), Value::Text(t)) => {
                let elem = elements.iter_mut().find(|e| e.name == element).ok_or_else(not_found)?;
                elem.desired = Some(t);
                Ok(())
            }
            (PropertyKind::Light(_), _) | (PropertyKind::Blob(_), _) => Err(IndiError::invalid(
                device,
                property,
                element,
                "light and BLOB elements are not writable",
            )),
            (_, value) => Err(IndiError::invalid(
                device,
                property,
                element,
                format!("{:?} does not fit a {} property", value, kind_name),
            )),
        }
    }

    /// Stage `element` On and every other switch Off.
    pub fn select_one(&mut self, element: &str) -> IndiResult<()> {
        if !self.has_element(element) {
            return Err(IndiError::ElementNotFound {
                device: self.device.clone(),
                property: self.name.clone(),
                element: element.to_string(),
            });
        }
        let names: Vec<String> = self.element_names().into_iter().map(str::to_string).collect();
        for name in names {
            let status = SwitchStatus::from(name == element);
            self.set_desired(&name, Value::Switch(status))?;
        }
        Ok(())
    }

    pub fn clear_desired(&mut self) {
        match &mut self.kind {
            PropertyKind::Switch { elements, .. } => elements.iter_mut().for_each(|e| e.desired = None),
            PropertyKind::Number(elements) => elements.iter_mut().for_each(|e| e.desired = None),
            PropertyKind::Text(elements) => elements.iter_mut().for_each(|e| e.desired = None),
            PropertyKind::Light(_) | PropertyKind::Blob(_) => {}
        }
    }

    /// Collect staged values and clear them. `None` when nothing is staged.
    pub fn take_staged(&mut self) -> Option<StagedVector> {
        let values: Vec<(String, Value)> = match &mut self.kind {
            PropertyKind::Switch { elements, .. } => elements
                .iter_mut()
                .filter_map(|e| e.desired.take().map(|d| (e.name.clone(), Value::Switch(d))))
                .collect(),
            PropertyKind::Number(elements) => elements
                .iter_mut()
                .filter_map(|e| e.desired.take().map(|d| (e.name.clone(), Value::Number(d))))
                .collect(),
            PropertyKind::Text(elements) => elements
                .iter_mut()
                .filter_map(|e| e.desired.take().map(|d| (e.name.clone(), Value::Text(d))))
                .collect(),
            PropertyKind::Light(_) | PropertyKind::Blob(_) => Vec::new(),
        };
        if values.is_empty() {
            return None;
        }
        Some(StagedVector {
            device: self.device.clone(),
            property: self.name.clone(),
            kind: self.property_type(),
            values,
        })
    }

    /// Apply a server push. Only current values, state and timeout change.
    ///
    /// Bad fields are skipped and returned; the rest is still applied.
    pub fn merge(&mut self, update: &PropertyUpdate) -> Vec<ProtocolDataError> {
        let mut issues = Vec::new();
        if update.kind != self.property_type() {
            issues.push(ProtocolDataError::new(
                &self.device,
                &self.name,
                None,
                format!(
                    "set{}Vector for a {} property",
                    update.kind.wire_name(),
                    self.property_type().wire_name()
                ),
            ));
            return issues;
        }
        if let Some(state) = update.state {
            self.state = state;
        }
        if let Some(timeout) = update.timeout {
            self.timeout = timeout;
        }
        if update.timestamp.is_some() {
            self.timestamp = update.timestamp.clone();
        }
        for value in &update.values {
            if let Err(reason) = self.merge_element(value) {
                issues.push(ProtocolDataError::new(&self.device, &self.name, Some(&value.name), reason));
            }
        }
        issues
    }

    fn merge_element(&mut self, update: &ElementUpdate) -> Result<(), String> {
        let unknown = || format!("unknown element '{}'", update.name);
        match (&mut self.kind, &update.value) {
            (PropertyKind::Switch { elements, .. }, RawValue::Text(text)) => {
                let elem = elements.iter_mut().find(|e| e.name == update.name).ok_or_else(unknown)?;
                elem.current = SwitchStatus::parse(text).ok_or_else(|| format!("not a switch state: '{}'", text))?;
            }
            (PropertyKind::Number(elements), RawValue::Text(text)) => {
                let elem = elements.iter_mut().find(|e| e.name == update.name).ok_or_else(unknown)?;
                elem.current = parse_number(text).ok_or_else(|| format!("not a number: '{}'", text))?;
            }
            (PropertyKind::Text(elements), RawValue::Text(text)) => {
                let elem = elements.iter_mut().find(|e| e.name == update.name).ok_or_else(unknown)?;
                elem.current = text.clone();
            }
            (PropertyKind::Light(elements), RawValue::Text(text)) => {
                let elem = elements.iter_mut().find(|e| e.name == update.name).ok_or_else(unknown)?;
                elem.current = PropertyState::parse(text).ok_or_else(|| format!("not a light state: '{}'", text))?;
            }
            (PropertyKind::Blob(elements), RawValue::Blob(blob)) => {
                let elem = elements.iter_mut().find(|e| e.name == update.name).ok_or_else(unknown)?;
                elem.current = Some(blob.clone());
            }
            _ => return Err("value kind does not match property".to_string()),
        }
        Ok(())
    }
}

/// Parse an INDI number: plain decimal or sexagesimal (`-12:30:15`, `5 30`).
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(value) = text.parse::<f64>() {
        return Some(value);
    }
    let negative = text.starts_with('-');
    let mut parts = text
        .trim_start_matches(['-', '+'])
        .split([':', ' ', ';'])
        .filter(|p| !p.is_empty());
    let degrees: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0.0,
    };
    let seconds: f64 = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0.0,
    };
    if parts.next().is_some() {
        return None;
    }
    let value = degrees + minutes / 60.0 + seconds / 3600.0;
    Some(if negative { -value } else { value })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn number_property(device: &str, name: &str, elements: &[(&str, f64, f64, f64)]) -> Property {
        Property {
            device: device.to_string(),
            name: name.to_string(),
            label: name.to_string(),
            group: "Main Control".to_string(),
            state: PropertyState::Idle,
            perm: Permission::ReadWrite,
            timeout: 60.0,
            timestamp: None,
            kind: PropertyKind::Number(
                elements
                    .iter()
                    .map(|(n, v, min, max)| NumberElement {
                        name: n.to_string(),
                        label: n.to_string(),
                        current: *v,
                        desired: None,
                        limits: NumberLimits {
                            min: *min,
                            max: *max,
                            step: 1.0,
                            format: "%g".to_string(),
                        },
                    })
                    .collect(),
            ),
        }
    }

    pub(crate) fn switch_property(device: &str, name: &str, elements: &[(&str, bool)]) -> Property {
        Property {
            device: device.to_string(),
            name: name.to_string(),
            label: name.to_string(),
            group: "Main Control".to_string(),
            state: PropertyState::Idle,
            perm: Permission::ReadWrite,
            timeout: 60.0,
            timestamp: None,
            kind: PropertyKind::Switch {
                rule: SwitchRule::OneOfMany,
                elements: elements
                    .iter()
                    .map(|(n, on)| SwitchElement {
                        name: n.to_string(),
                        label: n.to_string(),
                        current: SwitchStatus::from(*on),
                        desired: None,
                    })
                    .collect(),
            },
        }
    }

    fn text_update(device: &str, name: &str, kind: PropertyType, values: &[(&str, &str)]) -> PropertyUpdate {
        PropertyUpdate {
            device: device.to_string(),
            name: name.to_string(),
            kind,
            state: Some(PropertyState::Ok),
            timeout: None,
            timestamp: None,
            message: None,
            values: values
                .iter()
                .map(|(n, v)| ElementUpdate {
                    name: n.to_string(),
                    value: RawValue::Text(v.to_string()),
                })
                .collect(),
        }
    }

    #[test]
    fn test_out_of_range_leaves_values_untouched() {
        let mut prop = number_property("Focuser", "ABS_FOCUS_POSITION", &[("FOCUS_ABSOLUTE_POSITION", 500.0, 0.0, 1000.0)]);
        let err = prop
            .set_desired("FOCUS_ABSOLUTE_POSITION", Value::Number(1500.0))
            .unwrap_err();
        assert!(matches!(err, IndiError::ValueOutOfRange { max, .. } if max == 1000.0));
        assert!(err.is_invalid_value());
        assert_eq!(prop.number("FOCUS_ABSOLUTE_POSITION"), Some(500.0));
        assert_eq!(prop.desired("FOCUS_ABSOLUTE_POSITION"), None);
    }

    #[test]
    fn test_unbounded_number_accepts_anything() {
        let mut prop = number_property("CCD", "CCD_GAIN", &[("GAIN", 0.0, 0.0, 0.0)]);
        prop.set_desired("GAIN", Value::Number(-42.0)).unwrap();
        assert_eq!(prop.desired("GAIN"), Some(Value::Number(-42.0)));
        assert!(prop.set_desired("GAIN", Value::Number(f64::NAN)).is_err());
    }

    #[test]
    fn test_kind_mismatch_and_read_only() {
        let mut prop = number_property("CCD", "CCD_GAIN", &[("GAIN", 0.0, 0.0, 100.0)]);
        let err = prop.set_desired("GAIN", Value::Switch(SwitchStatus::On)).unwrap_err();
        assert!(matches!(err, IndiError::InvalidValue { .. }));

        prop.perm = Permission::ReadOnly;
        let err = prop.set_desired("GAIN", Value::Number(10.0)).unwrap_err();
        assert!(matches!(err, IndiError::PermissionDenied(_)));

        let mut sw = switch_property("CCD", "CCD_FRAME_TYPE", &[("FRAME_LIGHT", true)]);
        let err = sw.set_desired("FRAME_BIAS", Value::Switch(SwitchStatus::On)).unwrap_err();
        assert!(matches!(err, IndiError::ElementNotFound { .. }));
        assert!(err.is_invalid_value());
        let err = sw.select_one("FRAME_BIAS").unwrap_err();
        assert!(err.is_invalid_value());
        assert_eq!(sw.desired("FRAME_LIGHT"), None);
    }

    #[test]
    fn test_merge_preserves_other_desired_values() {
        let mut prop = number_property(
            "Mount",
            "EQUATORIAL_EOD_COORD",
            &[("RA", 1.0, 0.0, 24.0), ("DEC", 10.0, -90.0, 90.0)],
        );
        prop.set_desired("RA", Value::Number(5.5)).unwrap();
        let issues = prop.merge(&text_update("Mount", "EQUATORIAL_EOD_COORD", PropertyType::Number, &[("DEC", "45.0")]));
        assert!(issues.is_empty());
        assert_eq!(prop.desired("RA"), Some(Value::Number(5.5)));
        assert_eq!(prop.number("DEC"), Some(45.0));
        assert_eq!(prop.number("RA"), Some(1.0));
        assert_eq!(prop.state, PropertyState::Ok);
    }

    #[test]
    fn test_merge_applies_partially() {
        let mut prop = number_property(
            "Mount",
            "EQUATORIAL_EOD_COORD",
            &[("RA", 1.0, 0.0, 24.0), ("DEC", 10.0, -90.0, 90.0)],
        );
        let issues = prop.merge(&text_update(
            "Mount",
            "EQUATORIAL_EOD_COORD",
            PropertyType::Number,
            &[("RA", "garbage"), ("BOGUS", "1"), ("DEC", "-20:30:00")],
        ));
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].element.as_deref(), Some("RA"));
        assert_eq!(issues[1].element.as_deref(), Some("BOGUS"));
        assert_eq!(prop.number("RA"), Some(1.0));
        assert_eq!(prop.number("DEC"), Some(-20.5));
    }

    #[test]
    fn test_merge_rejects_wrong_vector_kind() {
        let mut prop = switch_property("Mount", "TELESCOPE_PARK", &[("PARK", false), ("UNPARK", true)]);
        let issues = prop.merge(&text_update("Mount", "TELESCOPE_PARK", PropertyType::Number, &[("PARK", "1")]));
        assert_eq!(issues.len(), 1);
        assert_eq!(prop.switch("UNPARK"), Some(true));
        assert_eq!(prop.state, PropertyState::Idle);
    }

    #[test]
    fn test_select_one_and_take_staged() {
        let mut prop = switch_property(
            "CCD",
            "CCD_FRAME_TYPE",
            &[("FRAME_LIGHT", true), ("FRAME_DARK", false), ("FRAME_FLAT", false)],
        );
        prop.select_one("FRAME_DARK").unwrap();
        let staged = prop.take_staged().unwrap();
        assert_eq!(staged.kind, PropertyType::Switch);
        assert_eq!(
            staged.values,
            vec![
                ("FRAME_LIGHT".to_string(), Value::Switch(SwitchStatus::Off)),
                ("FRAME_DARK".to_string(), Value::Switch(SwitchStatus::On)),
                ("FRAME_FLAT".to_string(), Value::Switch(SwitchStatus::Off)),
            ]
        );
        assert!(!prop.has_staged());
        assert!(prop.take_staged().is_none());
        // current values only move on server push
        assert_eq!(prop.switch("FRAME_LIGHT"), Some(true));
    }

    #[test]
    fn test_parse_number_formats() {
        assert_eq!(parse_number("12.5"), Some(12.5));
        assert_eq!(parse_number(" 1e3 "), Some(1000.0));
        assert_eq!(parse_number("5:30"), Some(5.5));
        assert_eq!(parse_number("-0:30:00"), Some(-0.5));
        assert_eq!(parse_number("10 15 00"), Some(10.25));
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number("1:2:3:4"), None);
    }

    #[test]
    fn test_switch_option_lookup() {
        let prop = switch_property("Mount", "TELESCOPE_SLEW_RATE", &[("1x", false), ("16x", true)]);
        assert_eq!(prop.selected_switch().map(|o| o.name), Some("16x".to_string()));
        assert_eq!(prop.switch_by_label("1x"), Some("1x".to_string()));
        assert_eq!(prop.switch_by_label("MAX"), None);
    }
}
