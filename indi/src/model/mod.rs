//! Device/property model

mod device;
pub(crate) mod property;
mod store;

pub use device::Device;
pub use property::{
    parse_number, Blob, BlobElement, ElementUpdate, LightElement, NumberElement, NumberLimits, Permission,
    Property, PropertyKind, PropertyState, PropertyType, PropertyUpdate, RawValue, StagedVector, SwitchElement,
    SwitchOption, SwitchRule, SwitchStatus, TextElement, Value,
};
pub use store::{DeviceStore, MergeOutcome, SharedStore, UpsertOutcome};
pub(crate) use store::{read_store, write_store};
