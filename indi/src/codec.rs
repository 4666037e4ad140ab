//! Server-to-client message decoding
//!
//! [`MessageDecoder`] is fed the quick-xml event stream of one connection and
//! yields a [`ServerMessage`] each time a top-level INDI element completes.
//! It keeps no I/O of its own so the reader task and the tests drive it the
//! same way.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use quick_xml::events::{BytesStart, Event};

use crate::model::{
    parse_number, Blob, BlobElement, ElementUpdate, LightElement, NumberElement, NumberLimits, Permission,
    Property, PropertyKind, PropertyState, PropertyType, PropertyUpdate, RawValue, SwitchElement, SwitchRule,
    SwitchStatus, TextElement,
};
use crate::protocol::validate_blob_format;

/// A complete message pushed by the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// `def*Vector`: new or redefined property
    Define {
        property: Property,
        message: Option<String>,
    },
    /// `set*Vector`: new values for a defined property
    Update(PropertyUpdate),
    /// `delProperty`: one property, or the whole device when `name` is absent
    Delete {
        device: String,
        name: Option<String>,
        message: Option<String>,
    },
    /// `message`: free text, optionally from a device
    Message {
        device: Option<String>,
        text: String,
        timestamp: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VectorMode {
    Define,
    Set,
}

#[derive(Debug)]
struct PendingVector {
    mode: VectorMode,
    kind: PropertyType,
    device: String,
    name: String,
    label: Option<String>,
    group: String,
    state: Option<PropertyState>,
    perm: Permission,
    rule: SwitchRule,
    timeout: Option<f64>,
    timestamp: Option<String>,
    message: Option<String>,
    elements: Vec<PendingElement>,
}

#[derive(Debug, Default)]
struct PendingElement {
    name: String,
    label: Option<String>,
    min: Option<String>,
    max: Option<String>,
    step: Option<String>,
    format: Option<String>,
    size: Option<String>,
    text: String,
}

/// Incremental decoder for the INDI server stream
#[derive(Debug, Default)]
pub struct MessageDecoder {
    vector: Option<PendingVector>,
    element: Option<PendingElement>,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one parser event; returns a message when a top-level element closes.
    pub fn feed(&mut self, event: &Event<'_>) -> Option<ServerMessage> {
        match event {
            Event::Start(e) => self.start(e, false),
            Event::Empty(e) => self.start(e, true),
            Event::Text(t) => {
                if let Some(element) = self.element.as_mut() {
                    match t.unescape() {
                        Ok(text) => element.text.push_str(&text),
                        Err(e) => tracing::warn!("INDI text unescape failed: {}", e),
                    }
                }
                None
            }
            Event::CData(c) => {
                if let Some(element) = self.element.as_mut() {
                    element.text.push_str(&String::from_utf8_lossy(c));
                }
                None
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                self.end(&name)
            }
            _ => None,
        }
    }

    /// Drop any half-read message (used after a parse error).
    pub fn reset(&mut self) {
        self.vector = None;
        self.element = None;
    }

    fn start(&mut self, e: &BytesStart<'_>, empty: bool) -> Option<ServerMessage> {
        let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();

        if let Some((mode, kind)) = vector_tag(&tag) {
            if self.vector.is_some() {
                tracing::warn!("INDI {} opened inside another vector, dropping the previous one", tag);
            }
            let device = get_attribute(e, "device").unwrap_or_default();
            let name = get_attribute(e, "name").unwrap_or_default();
            self.element = None;
            self.vector = Some(PendingVector {
                mode,
                kind,
                device,
                name,
                label: get_attribute(e, "label"),
                group: get_attribute(e, "group").unwrap_or_default(),
                state: get_attribute(e, "state").and_then(|s| PropertyState::parse(&s)),
                perm: get_attribute(e, "perm").map(|p| Permission::parse(&p)).unwrap_or_default(),
                rule: get_attribute(e, "rule").map(|r| SwitchRule::parse(&r)).unwrap_or_default(),
                timeout: get_attribute(e, "timeout").and_then(|t| t.trim().parse().ok()),
                timestamp: get_attribute(e, "timestamp"),
                message: get_attribute(e, "message"),
                elements: Vec::new(),
            });
            return if empty { self.finish_vector() } else { None };
        }

        if element_tag(&tag) {
            if self.vector.is_none() {
                tracing::debug!("INDI {} outside of a vector, ignored", tag);
                return None;
            }
            let element = PendingElement {
                name: get_attribute(e, "name").unwrap_or_default(),
                label: get_attribute(e, "label"),
                min: get_attribute(e, "min"),
                max: get_attribute(e, "max"),
                step: get_attribute(e, "step"),
                format: get_attribute(e, "format"),
                size: get_attribute(e, "size"),
                text: String::new(),
            };
            if empty {
                self.push_element(element);
            } else {
                self.element = Some(element);
            }
            return None;
        }

        match tag.as_str() {
            "delProperty" => get_attribute(e, "device").map(|device| ServerMessage::Delete {
                device,
                name: get_attribute(e, "name"),
                message: get_attribute(e, "message"),
            }),
            "message" => get_attribute(e, "message").map(|text| ServerMessage::Message {
                device: get_attribute(e, "device"),
                text,
                timestamp: get_attribute(e, "timestamp"),
            }),
            _ => None,
        }
    }

    fn end(&mut self, tag: &str) -> Option<ServerMessage> {
        if element_tag(tag) {
            if let Some(element) = self.element.take() {
                self.push_element(element);
            }
            return None;
        }
        if vector_tag(tag).is_some() {
            return self.finish_vector();
        }
        None
    }

    fn push_element(&mut self, element: PendingElement) {
        if let Some(vector) = self.vector.as_mut() {
            vector.elements.push(element);
        }
    }

    fn finish_vector(&mut self) -> Option<ServerMessage> {
        let vector = self.vector.take()?;
        self.element = None;
        if vector.device.is_empty() || vector.name.is_empty() {
            tracing::warn!("INDI vector without device or name, ignored");
            return None;
        }
        Some(match vector.mode {
            VectorMode::Define => build_definition(vector),
            VectorMode::Set => build_update(vector),
        })
    }
}

/// `defNumberVector` → (Define, Number), `setBLOBVector` → (Set, Blob)
fn vector_tag(tag: &str) -> Option<(VectorMode, PropertyType)> {
    let inner = tag.strip_suffix("Vector")?;
    let (mode, kind) = if let Some(kind) = inner.strip_prefix("def") {
        (VectorMode::Define, kind)
    } else if let Some(kind) = inner.strip_prefix("set") {
        (VectorMode::Set, kind)
    } else {
        return None;
    };
    PropertyType::from_wire_name(kind).map(|k| (mode, k))
}

fn element_tag(tag: &str) -> bool {
    let kind = match tag.strip_prefix("def").or_else(|| tag.strip_prefix("one")) {
        Some(kind) => kind,
        None => return false,
    };
    PropertyType::from_wire_name(kind).is_some()
}

fn build_definition(vector: PendingVector) -> ServerMessage {
    let device = vector.device;
    let name = vector.name;
    let elements = vector.elements;
    let warn = |element: &str, reason: String| {
        tracing::warn!("INDI bad definition data for {}.{}.{}: {}", device, name, element, reason);
    };

    let kind = match vector.kind {
        PropertyType::Switch => PropertyKind::Switch {
            rule: vector.rule,
            elements: elements
                .into_iter()
                .map(|e| {
                    let current = SwitchStatus::parse(&e.text).unwrap_or_else(|| {
                        warn(&e.name, format!("not a switch state: '{}'", e.text));
                        SwitchStatus::Off
                    });
                    SwitchElement {
                        label: e.label.unwrap_or_else(|| e.name.clone()),
                        name: e.name,
                        current,
                        desired: None,
                    }
                })
                .collect(),
        },
        PropertyType::Number => PropertyKind::Number(
            elements
                .into_iter()
                .map(|e| {
                    let current = parse_number(&e.text).unwrap_or_else(|| {
                        warn(&e.name, format!("not a number: '{}'", e.text));
                        0.0
                    });
                    let limit = |v: &Option<String>| v.as_deref().and_then(parse_number).unwrap_or(0.0);
                    NumberElement {
                        limits: NumberLimits {
                            min: limit(&e.min),
                            max: limit(&e.max),
                            step: limit(&e.step),
                            format: e.format.clone().unwrap_or_else(|| "%g".to_string()),
                        },
                        label: e.label.unwrap_or_else(|| e.name.clone()),
                        name: e.name,
                        current,
                        desired: None,
                    }
                })
                .collect(),
        ),
        PropertyType::Text => PropertyKind::Text(
            elements
                .into_iter()
                .map(|e| TextElement {
                    label: e.label.unwrap_or_else(|| e.name.clone()),
                    name: e.name,
                    current: e.text,
                    desired: None,
                })
                .collect(),
        ),
        PropertyType::Light => PropertyKind::Light(
            elements
                .into_iter()
                .map(|e| {
                    let current = PropertyState::parse(&e.text).unwrap_or_else(|| {
                        warn(&e.name, format!("not a light state: '{}'", e.text));
                        PropertyState::Idle
                    });
                    LightElement {
                        label: e.label.unwrap_or_else(|| e.name.clone()),
                        name: e.name,
                        current,
                    }
                })
                .collect(),
        ),
        PropertyType::Blob => PropertyKind::Blob(
            elements
                .into_iter()
                .map(|e| BlobElement {
                    label: e.label.unwrap_or_else(|| e.name.clone()),
                    name: e.name,
                    current: None,
                })
                .collect(),
        ),
    };

    ServerMessage::Define {
        property: Property {
            label: vector.label.unwrap_or_else(|| name.clone()),
            device,
            name,
            group: vector.group,
            state: vector.state.unwrap_or_default(),
            perm: vector.perm,
            timeout: vector.timeout.unwrap_or(0.0),
            timestamp: vector.timestamp,
            kind,
        },
        message: vector.message,
    }
}

fn build_update(vector: PendingVector) -> ServerMessage {
    let mut values = Vec::with_capacity(vector.elements.len());
    for e in vector.elements {
        let value = if vector.kind == PropertyType::Blob {
            match decode_blob(&e) {
                Ok(blob) => RawValue::Blob(blob),
                Err(reason) => {
                    tracing::warn!(
                        "Failed to decode BLOB for {}.{}.{}: {}",
                        vector.device,
                        vector.name,
                        e.name,
                        reason
                    );
                    continue;
                }
            }
        } else {
            RawValue::Text(e.text)
        };
        values.push(ElementUpdate { name: e.name, value });
    }

    ServerMessage::Update(PropertyUpdate {
        device: vector.device,
        name: vector.name,
        kind: vector.kind,
        state: vector.state,
        timeout: vector.timeout,
        timestamp: vector.timestamp,
        message: vector.message,
        values,
    })
}

fn decode_blob(e: &PendingElement) -> Result<Blob, String> {
    // base64 payloads are usually wrapped over many lines
    let compact: String = e.text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let data = BASE64.decode(compact.as_bytes()).map_err(|err| err.to_string())?;
    let declared = e.format.clone().unwrap_or_else(|| ".fits".to_string());
    let size = e.size.as_deref().and_then(|s| s.trim().parse().ok()).unwrap_or(data.len());
    Ok(Blob {
        format: validate_blob_format(&declared, &data),
        size,
        data: Arc::new(data),
    })
}

/// Helper to get attribute from XML event
fn get_attribute(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name.as_bytes())
        .map(|a| match a.unescape_value() {
            Ok(v) => v.to_string(),
            Err(_) => String::from_utf8_lossy(&a.value).to_string(),
        })
}

/// Decode a complete in-memory stream (tests and replay).
pub fn decode_str(xml: &str) -> Vec<ServerMessage> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.trim_text(true);
    let mut decoder = MessageDecoder::new();
    let mut messages = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Eof) => break,
            Ok(event) => messages.extend(decoder.feed(&event)),
            Err(e) => {
                tracing::warn!("INDI XML parse error: {}", e);
                decoder.reset();
            }
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_number_vector() {
        let xml = r#"<defNumberVector device="Telescope Simulator" name="EQUATORIAL_EOD_COORD" label="Eq. Coordinates" group="Main Control" state="Idle" perm="rw" timeout="60">
            <defNumber name="RA" label="RA (hh:mm:ss)" format="%010.6m" min="0" max="24" step="0">5:30:00</defNumber>
            <defNumber name="DEC" label="DEC (dd:mm:ss)" format="%010.6m" min="-90" max="90" step="0">-10.5</defNumber>
        </defNumberVector>"#;
        let messages = decode_str(xml);
        assert_eq!(messages.len(), 1);
        let ServerMessage::Define { property, message } = &messages[0] else {
            panic!("expected definition, got {:?}", messages[0]);
        };
        assert!(message.is_none());
        assert_eq!(property.device, "Telescope Simulator");
        assert_eq!(property.label, "Eq. Coordinates");
        assert_eq!(property.group, "Main Control");
        assert_eq!(property.perm, Permission::ReadWrite);
        assert_eq!(property.timeout, 60.0);
        assert_eq!(property.number("RA"), Some(5.5));
        assert_eq!(property.number("DEC"), Some(-10.5));
        let ra = property.number_element("RA").unwrap();
        assert_eq!(ra.limits.max, 24.0);
        assert_eq!(ra.limits.format, "%010.6m");
    }

    #[test]
    fn test_define_switch_and_empty_blob() {
        let xml = r#"<defSwitchVector device="CCD Simulator" name="CCD_FRAME_TYPE" label="Frame" group="Image Settings" state="Ok" perm="rw" rule="OneOfMany">
            <defSwitch name="FRAME_LIGHT" label="Light">On</defSwitch>
            <defSwitch name="FRAME_DARK" label="Dark">Off</defSwitch>
        </defSwitchVector>
        <defBLOBVector device="CCD Simulator" name="CCD1" label="Image Data" group="Image Info" state="Idle" perm="ro">
            <defBLOB name="CCD1" label="Image"/>
        </defBLOBVector>"#;
        let messages = decode_str(xml);
        assert_eq!(messages.len(), 2);
        let ServerMessage::Define { property, .. } = &messages[0] else { panic!() };
        assert_eq!(property.switch("FRAME_LIGHT"), Some(true));
        assert_eq!(property.switch_by_label("Dark"), Some("FRAME_DARK".to_string()));
        assert_eq!(property.state, PropertyState::Ok);
        let ServerMessage::Define { property, .. } = &messages[1] else { panic!() };
        assert_eq!(property.property_type(), PropertyType::Blob);
        assert_eq!(property.perm, Permission::ReadOnly);
        assert_eq!(property.element_names(), vec!["CCD1"]);
    }

    #[test]
    fn test_set_vector_with_message() {
        let xml = r#"<setNumberVector device="CCD Simulator" name="CCD_EXPOSURE" state="Busy" timeout="60" message="Exposure started">
            <oneNumber name="CCD_EXPOSURE_VALUE">4.5</oneNumber>
        </setNumberVector>"#;
        let messages = decode_str(xml);
        let ServerMessage::Update(update) = &messages[0] else { panic!() };
        assert_eq!(update.kind, PropertyType::Number);
        assert_eq!(update.state, Some(PropertyState::Busy));
        assert_eq!(update.message.as_deref(), Some("Exposure started"));
        assert_eq!(
            update.values,
            vec![ElementUpdate {
                name: "CCD_EXPOSURE_VALUE".to_string(),
                value: RawValue::Text("4.5".to_string()),
            }]
        );
    }

    #[test]
    fn test_state_only_update_is_empty_element() {
        let messages = decode_str(r#"<setSwitchVector device="Mount" name="TELESCOPE_PARK" state="Alert"/>"#);
        let ServerMessage::Update(update) = &messages[0] else { panic!() };
        assert_eq!(update.state, Some(PropertyState::Alert));
        assert!(update.values.is_empty());
    }

    #[test]
    fn test_blob_decoding() {
        // "SIMPLE  =" base64 encoded, split over lines
        let xml = "<setBLOBVector device=\"CCD\" name=\"CCD1\" state=\"Ok\">\
                   <oneBLOB name=\"CCD1\" size=\"9\" format=\".fits\">U0lNUExF\nICA9</oneBLOB>\
                   </setBLOBVector>";
        let messages = decode_str(xml);
        let ServerMessage::Update(update) = &messages[0] else { panic!() };
        let RawValue::Blob(blob) = &update.values[0].value else { panic!() };
        assert_eq!(blob.format, ".fits");
        assert_eq!(blob.size, 9);
        assert_eq!(blob.data.as_slice(), b"SIMPLE  =");
    }

    #[test]
    fn test_bad_blob_is_skipped() {
        let xml = r#"<setBLOBVector device="CCD" name="CCD1" state="Ok"><oneBLOB name="CCD1" size="3" format=".fits">!!!</oneBLOB></setBLOBVector>"#;
        let messages = decode_str(xml);
        let ServerMessage::Update(update) = &messages[0] else { panic!() };
        assert!(update.values.is_empty());
        assert_eq!(update.state, Some(PropertyState::Ok));
    }

    #[test]
    fn test_delete_and_message() {
        let xml = r#"<delProperty device="Focuser" name="FOCUS_SPEED"/>
            <delProperty device="Focuser" message="bye"/>
            <message device="Focuser" timestamp="2021-03-01T20:00:00" message="[INFO] Focuser is online."/>
            <message message="no device"/>"#;
        let messages = decode_str(xml);
        assert_eq!(
            messages,
            vec![
                ServerMessage::Delete {
                    device: "Focuser".to_string(),
                    name: Some("FOCUS_SPEED".to_string()),
                    message: None,
                },
                ServerMessage::Delete {
                    device: "Focuser".to_string(),
                    name: None,
                    message: Some("bye".to_string()),
                },
                ServerMessage::Message {
                    device: Some("Focuser".to_string()),
                    text: "[INFO] Focuser is online.".to_string(),
                    timestamp: Some("2021-03-01T20:00:00".to_string()),
                },
                ServerMessage::Message {
                    device: None,
                    text: "no device".to_string(),
                    timestamp: None,
                },
            ]
        );
    }

    #[test]
    fn test_escaped_attribute_and_text() {
        let xml = r#"<defTextVector device="CCD" name="UPLOAD_SETTINGS" label="Upload &amp; Save" group="Options" state="Idle" perm="rw">
            <defText name="UPLOAD_PREFIX" label="Prefix">IMAGE_&lt;XXX&gt;</defText>
        </defTextVector>"#;
        let messages = decode_str(xml);
        let ServerMessage::Define { property, .. } = &messages[0] else { panic!() };
        assert_eq!(property.label, "Upload & Save");
        assert_eq!(property.text("UPLOAD_PREFIX"), Some("IMAGE_<XXX>"));
    }

    #[test]
    fn test_bad_number_in_definition_defaults() {
        let xml = r#"<defNumberVector device="F" name="FOCUS_SPEED" state="Idle" perm="rw"><defNumber name="FOCUS_SPEED_VALUE" min="0" max="3">fast</defNumber></defNumberVector>"#;
        let messages = decode_str(xml);
        let ServerMessage::Define { property, .. } = &messages[0] else { panic!() };
        assert_eq!(property.number("FOCUS_SPEED_VALUE"), Some(0.0));
    }

    #[test]
    fn test_vector_tag_parsing() {
        assert_eq!(vector_tag("defBLOBVector"), Some((VectorMode::Define, PropertyType::Blob)));
        assert_eq!(vector_tag("setLightVector"), Some((VectorMode::Set, PropertyType::Light)));
        assert_eq!(vector_tag("newNumberVector"), None);
        assert!(element_tag("oneSwitch"));
        assert!(element_tag("defText"));
        assert!(!element_tag("delProperty"));
    }
}
