//! INDI XML protocol definitions and client-to-server messages

use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};

use crate::model::StagedVector;

/// INDI protocol version
pub const INDI_PROTOCOL_VERSION: &str = "1.7";

/// `enableBLOB` policy for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobMode {
    Never,
    Also,
    Only,
}

impl BlobMode {
    pub fn as_wire(self) -> &'static str {
        match self {
            BlobMode::Never => "Never",
            BlobMode::Also => "Also",
            BlobMode::Only => "Only",
        }
    }
}

/// Standard INDI properties
pub mod standard_properties {
    pub const CONNECTION: &str = "CONNECTION";

    // Camera properties
    pub const CCD_EXPOSURE: &str = "CCD_EXPOSURE";
    pub const CCD_EXPOSURE_PRESETS: &str = "CCD_EXPOSURE_PRESETS";
    pub const CCD_ABORT_EXPOSURE: &str = "CCD_ABORT_EXPOSURE";
    pub const CCD_FRAME_TYPE: &str = "CCD_FRAME_TYPE";
    pub const CCD_BINNING: &str = "CCD_BINNING";
    pub const CCD_GAIN: &str = "CCD_GAIN";
    pub const CCD_ISO: &str = "CCD_ISO";
    pub const CCD_FORCE_BLOB: &str = "CCD_FORCE_BLOB";
    pub const CCD_TRANSFER_FORMAT: &str = "CCD_TRANSFER_FORMAT";
    pub const CAPTURE_FORMAT: &str = "CAPTURE_FORMAT";
    pub const CCD1: &str = "CCD1"; // BLOB property for image data
    pub const UPLOAD_MODE: &str = "UPLOAD_MODE";
    pub const UPLOAD_SETTINGS: &str = "UPLOAD_SETTINGS";

    // Mount properties
    pub const EQUATORIAL_EOD_COORD: &str = "EQUATORIAL_EOD_COORD";
    pub const ON_COORD_SET: &str = "ON_COORD_SET";
    pub const TELESCOPE_TRACK_STATE: &str = "TELESCOPE_TRACK_STATE";
    pub const TELESCOPE_PARK: &str = "TELESCOPE_PARK";
    pub const TELESCOPE_ABORT_MOTION: &str = "TELESCOPE_ABORT_MOTION";
    pub const TELESCOPE_MOTION_NS: &str = "TELESCOPE_MOTION_NS";
    pub const TELESCOPE_MOTION_WE: &str = "TELESCOPE_MOTION_WE";
    pub const TELESCOPE_SLEW_RATE: &str = "TELESCOPE_SLEW_RATE";

    // Focuser properties
    pub const FOCUS_MOTION: &str = "FOCUS_MOTION";
    pub const FOCUS_SPEED: &str = "FOCUS_SPEED";
    pub const FOCUS_SYNC: &str = "FOCUS_SYNC";
    pub const ABS_FOCUS_POSITION: &str = "ABS_FOCUS_POSITION";
    pub const REL_FOCUS_POSITION: &str = "REL_FOCUS_POSITION";
    pub const FOCUS_ABORT_MOTION: &str = "FOCUS_ABORT_MOTION";
}

/// Element names of the standard properties
pub mod standard_elements {
    // Camera
    pub const CCD_EXPOSURE_VALUE: &str = "CCD_EXPOSURE_VALUE";
    pub const ABORT: &str = "ABORT";
    pub const GAIN: &str = "GAIN";
    pub const HOR_BIN: &str = "HOR_BIN";
    pub const VER_BIN: &str = "VER_BIN";
    pub const FORCE_ON: &str = "On";
    pub const FORCE_OFF: &str = "Off";
    pub const CCD1: &str = "CCD1";
    pub const UPLOAD_CLIENT: &str = "UPLOAD_CLIENT";
    pub const UPLOAD_LOCAL: &str = "UPLOAD_LOCAL";
    pub const UPLOAD_BOTH: &str = "UPLOAD_BOTH";
    pub const UPLOAD_DIR: &str = "UPLOAD_DIR";
    pub const UPLOAD_PREFIX: &str = "UPLOAD_PREFIX";

    // Mount
    pub const RA: &str = "RA";
    pub const DEC: &str = "DEC";
    pub const TRACK: &str = "TRACK";
    pub const SLEW: &str = "SLEW";
    pub const SYNC: &str = "SYNC";
    pub const MOTION_NORTH: &str = "MOTION_NORTH";
    pub const MOTION_SOUTH: &str = "MOTION_SOUTH";
    pub const MOTION_WEST: &str = "MOTION_WEST";
    pub const MOTION_EAST: &str = "MOTION_EAST";
    pub const ABORT_MOTION: &str = "ABORT_MOTION";
    pub const PARK: &str = "PARK";
    pub const UNPARK: &str = "UNPARK";
    pub const TRACK_ON: &str = "TRACK_ON";
    pub const TRACK_OFF: &str = "TRACK_OFF";

    // Focuser
    pub const FOCUS_INWARD: &str = "FOCUS_INWARD";
    pub const FOCUS_OUTWARD: &str = "FOCUS_OUTWARD";
    pub const FOCUS_ABSOLUTE_POSITION: &str = "FOCUS_ABSOLUTE_POSITION";
    pub const FOCUS_RELATIVE_POSITION: &str = "FOCUS_RELATIVE_POSITION";
    pub const FOCUS_SPEED_VALUE: &str = "FOCUS_SPEED_VALUE";
    pub const FOCUS_SYNC_VALUE: &str = "FOCUS_SYNC_VALUE";
}

/// `<getProperties>` for everything, one device, or one property
pub fn get_properties(version: &str, device: Option<&str>, property: Option<&str>) -> String {
    let mut xml = format!("<getProperties version=\"{}\"", escape(version));
    if let Some(device) = device {
        xml.push_str(&format!(" device=\"{}\"", escape(device)));
        if let Some(property) = property {
            xml.push_str(&format!(" name=\"{}\"", escape(property)));
        }
    }
    xml.push_str("/>");
    xml
}

/// `<enableBLOB>` for a device, optionally narrowed to one BLOB property
pub fn enable_blob(device: &str, property: Option<&str>, mode: BlobMode) -> String {
    match property {
        Some(name) => format!(
            "<enableBLOB device=\"{}\" name=\"{}\">{}</enableBLOB>",
            escape(device),
            escape(name),
            mode.as_wire()
        ),
        None => format!("<enableBLOB device=\"{}\">{}</enableBLOB>", escape(device), mode.as_wire()),
    }
}

/// One `new*Vector` carrying every staged element of the property
pub fn new_vector(staged: &StagedVector) -> String {
    let kind = staged.kind.wire_name();
    let mut xml = format!(
        "<new{}Vector device=\"{}\" name=\"{}\">",
        kind,
        escape(&staged.device),
        escape(&staged.property)
    );
    for (element, value) in &staged.values {
        xml.push_str(&format!(
            "<one{} name=\"{}\">{}</one{}>",
            kind,
            escape(element),
            escape(&value.wire_text()),
            kind
        ));
    }
    xml.push_str(&format!("</new{}Vector>", kind));
    xml
}

/// Detect the real BLOB format from its magic bytes, falling back to the declared one
pub fn validate_blob_format(declared_format: &str, data: &[u8]) -> String {
    let detected: &str = if data.starts_with(b"SIMPLE") {
        ".fits"
    } else if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        ".png"
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        ".jpeg"
    } else if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        ".webp"
    } else if data.starts_with(&[0x1F, 0x8B, 0x08]) {
        ".gz"
    } else if data.starts_with(b"PK") {
        ".zip"
    } else {
        declared_format
    };

    if !declared_format.is_empty() && detected != declared_format {
        tracing::debug!(
            "BLOB format mismatch: declared '{}', detected '{}'",
            declared_format,
            detected
        );
    }

    detected.to_string()
}
