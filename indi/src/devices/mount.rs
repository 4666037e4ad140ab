//! INDI Mount (telescope) wrapper
//!
//! RA travels over the wire in hours, Dec in degrees. The [`Equatorial`] type
//! keeps RA in degrees, so conversions happen at this boundary.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DeviceContext;
use crate::astro::{CoordinateTransform, Epoch, Equatorial, Horizontal, ObserverLocation};
use crate::error::{IndiError, IndiResult};
use crate::model::{SwitchOption, SwitchStatus, Value};
use crate::protocol::standard_elements::*;
use crate::protocol::standard_properties::*;

/// Manual motion direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotionDirection {
    North,
    South,
    East,
    West,
}

impl MotionDirection {
    fn property(self) -> &'static str {
        match self {
            MotionDirection::North | MotionDirection::South => TELESCOPE_MOTION_NS,
            MotionDirection::East | MotionDirection::West => TELESCOPE_MOTION_WE,
        }
    }

    /// (this direction, the opposite one) on the same axis
    fn elements(self) -> (&'static str, &'static str) {
        match self {
            MotionDirection::North => (MOTION_NORTH, MOTION_SOUTH),
            MotionDirection::South => (MOTION_SOUTH, MOTION_NORTH),
            MotionDirection::West => (MOTION_WEST, MOTION_EAST),
            MotionDirection::East => (MOTION_EAST, MOTION_WEST),
        }
    }
}

/// What the mount does when it receives new coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordSetMode {
    /// Slew, then keep tracking
    Track,
    /// Slew and stop
    Slew,
    /// Accept the coordinates as the current position
    Sync,
}

impl CoordSetMode {
    pub fn element(self) -> &'static str {
        match self {
            CoordSetMode::Track => TRACK,
            CoordSetMode::Slew => SLEW,
            CoordSetMode::Sync => SYNC,
        }
    }
}

/// Mount view of one device
#[derive(Debug, Clone)]
pub struct Mount {
    ctx: Arc<DeviceContext>,
    device: String,
}

impl Mount {
    pub(crate) fn new(ctx: Arc<DeviceContext>, device: &str) -> Self {
        Self {
            ctx,
            device: device.to_string(),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device
    }

    fn supports(&self, property: &str, elements: &[&str]) -> bool {
        self.ctx.supports(&self.device, property, elements)
    }

    // Capabilities

    pub fn has_coordinates(&self) -> bool {
        self.supports(EQUATORIAL_EOD_COORD, &[RA, DEC])
    }

    pub fn has_coord_set(&self) -> bool {
        self.supports(ON_COORD_SET, &[TRACK, SLEW, SYNC])
    }

    pub fn can_move_ns(&self) -> bool {
        self.supports(TELESCOPE_MOTION_NS, &[MOTION_NORTH, MOTION_SOUTH])
    }

    pub fn can_move_we(&self) -> bool {
        self.supports(TELESCOPE_MOTION_WE, &[MOTION_WEST, MOTION_EAST])
    }

    /// True while either motion axis is available
    pub fn can_move_relative(&self) -> bool {
        self.can_move_ns() || self.can_move_we()
    }

    pub fn can_abort(&self) -> bool {
        self.abort_element().is_some()
    }

    pub fn has_slew_rate(&self) -> bool {
        self.ctx.read_property(&self.device, TELESCOPE_SLEW_RATE, |_| ()).is_some()
    }

    pub fn can_park(&self) -> bool {
        self.supports(TELESCOPE_PARK, &[PARK, UNPARK])
    }

    pub fn has_tracking(&self) -> bool {
        self.supports(TELESCOPE_TRACK_STATE, &[TRACK_ON, TRACK_OFF])
    }

    // Drivers disagree on the abort element name
    fn abort_element(&self) -> Option<&'static str> {
        self.ctx
            .read_property(&self.device, TELESCOPE_ABORT_MOTION, |p| {
                [ABORT, ABORT_MOTION].into_iter().find(|e| p.has_element(e))
            })
            .flatten()
    }

    fn unsupported_or_gone(&self, operation: &str) -> IndiError {
        if self.ctx.has_device(&self.device) {
            IndiError::unsupported(&self.device, operation)
        } else {
            IndiError::DeviceGone(self.device.clone())
        }
    }

    // Reads

    /// Current pointing with RA in degrees
    pub fn coordinates(&self) -> Option<Equatorial> {
        self.ctx
            .read_property(&self.device, EQUATORIAL_EOD_COORD, |p| {
                Some(Equatorial::from_hours(p.number(RA)?, p.number(DEC)?))
            })
            .flatten()
    }

    pub fn ra_hours(&self) -> Option<f64> {
        self.coordinates().map(|c| c.ra_hours())
    }

    pub fn dec(&self) -> Option<f64> {
        self.coordinates().map(|c| c.dec)
    }

    pub fn slew_rates(&self) -> Vec<SwitchOption> {
        self.ctx
            .read_property(&self.device, TELESCOPE_SLEW_RATE, |p| p.switch_options())
            .unwrap_or_default()
    }

    pub fn selected_slew_rate(&self) -> Option<SwitchOption> {
        self.ctx
            .read_property(&self.device, TELESCOPE_SLEW_RATE, |p| p.selected_switch())
            .flatten()
    }

    pub fn is_parked(&self) -> Option<bool> {
        self.ctx.read_property(&self.device, TELESCOPE_PARK, |p| p.switch(PARK)).flatten()
    }

    pub fn is_tracking(&self) -> Option<bool> {
        self.ctx
            .read_property(&self.device, TELESCOPE_TRACK_STATE, |p| p.switch(TRACK_ON))
            .flatten()
    }

    /// Current pointing converted to altitude/azimuth
    pub fn horizontal(
        &self,
        transform: &dyn CoordinateTransform,
        observer: ObserverLocation,
        time: DateTime<Utc>,
    ) -> Option<Horizontal> {
        self.coordinates()
            .map(|eq| transform.to_horizontal(eq, observer, time))
    }

    // Motion

    /// Start (`active`) or stop manual motion in one direction.
    pub fn move_direction(&self, direction: MotionDirection, active: bool) -> IndiResult<()> {
        let property = direction.property();
        let (this, opposite) = direction.elements();
        let mut staging = self.ctx.stage(&self.device)?;
        staging.require(property, &[this, opposite], "manual motion")?;
        staging
            .set(property, this, Value::Switch(SwitchStatus::from(active)))?
            .set(property, opposite, Value::Switch(SwitchStatus::Off))?;
        staging.commit()
    }

    /// Stop both motion axes.
    pub fn stop_motion(&self) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        let mut any = false;
        for (property, elements) in [
            (TELESCOPE_MOTION_NS, [MOTION_NORTH, MOTION_SOUTH]),
            (TELESCOPE_MOTION_WE, [MOTION_WEST, MOTION_EAST]),
        ] {
            if staging.supports(property, &elements) {
                for element in elements {
                    staging.set(property, element, Value::Switch(SwitchStatus::Off))?;
                }
                any = true;
            }
        }
        if !any {
            return Err(IndiError::unsupported(&self.device, "manual motion"));
        }
        staging.commit()
    }

    pub fn abort(&self) -> IndiResult<()> {
        let element = self.abort_element().ok_or_else(|| self.unsupported_or_gone("abort"))?;
        let mut staging = self.ctx.stage(&self.device)?;
        staging.set(TELESCOPE_ABORT_MOTION, element, Value::Switch(SwitchStatus::On))?;
        staging.commit()
    }

    /// Send coordinates of date, RA in degrees.
    ///
    /// The coordinate-set mode and the coordinates go out in one batch, mode first.
    pub fn set_coordinates(&self, mode: CoordSetMode, target: Equatorial) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        staging.require(ON_COORD_SET, &[mode.element()], "coordinate set")?;
        staging.require(EQUATORIAL_EOD_COORD, &[RA, DEC], "goto")?;
        staging.select(ON_COORD_SET, mode.element())?;
        staging
            .set(EQUATORIAL_EOD_COORD, RA, Value::Number(target.ra_hours()))?
            .set(EQUATORIAL_EOD_COORD, DEC, Value::Number(target.dec))?;
        staging.commit()
    }

    /// Goto with tracking (`track`) or a plain slew.
    pub fn goto(&self, target: Equatorial, track: bool) -> IndiResult<()> {
        let mode = if track { CoordSetMode::Track } else { CoordSetMode::Slew };
        self.set_coordinates(mode, target)
    }

    pub fn sync(&self, position: Equatorial) -> IndiResult<()> {
        self.set_coordinates(CoordSetMode::Sync, position)
    }

    /// Goto a J2000 position, precessed to the epoch of `time`.
    pub fn goto_j2000(
        &self,
        transform: &dyn CoordinateTransform,
        target: Equatorial,
        time: DateTime<Utc>,
        track: bool,
    ) -> IndiResult<()> {
        let of_date = transform.precess(Epoch::J2000, Epoch::of(time), target);
        self.goto(of_date, track)
    }

    fn set_switch(&self, property: &str, element: &str, elements: &[&str], operation: &str) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        staging.require(property, elements, operation)?;
        staging.select(property, element)?;
        staging.commit()
    }

    pub fn park(&self) -> IndiResult<()> {
        self.set_switch(TELESCOPE_PARK, PARK, &[PARK, UNPARK], "park")
    }

    pub fn unpark(&self) -> IndiResult<()> {
        self.set_switch(TELESCOPE_PARK, UNPARK, &[PARK, UNPARK], "unpark")
    }

    pub fn set_tracking(&self, enabled: bool) -> IndiResult<()> {
        let element = if enabled { TRACK_ON } else { TRACK_OFF };
        self.set_switch(TELESCOPE_TRACK_STATE, element, &[TRACK_ON, TRACK_OFF], "tracking")
    }

    /// Select a slew rate by its label (or element name).
    pub fn set_slew_rate(&self, label: &str) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        let element = staging
            .store()
            .property(&self.device, TELESCOPE_SLEW_RATE)
            .ok_or_else(|| IndiError::unsupported(&self.device, "slew rate"))?
            .switch_by_label(label)
            .ok_or_else(|| IndiError::ElementNotFound {
                device: self.device.clone(),
                property: TELESCOPE_SLEW_RATE.to_string(),
                element: label.to_string(),
            })?;
        staging.select(TELESCOPE_SLEW_RATE, &element)?;
        staging.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::tests::test_context;
    use crate::model::property::tests::{number_property, switch_property};
    use crate::model::{write_store, PropertyKind};
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    const DEVICE: &str = "Telescope Simulator";

    fn mount() -> (Mount, mpsc::Receiver<String>) {
        let (ctx, rx) = test_context();
        {
            let mut store = write_store(&ctx.store);
            store.upsert_property(number_property(DEVICE, EQUATORIAL_EOD_COORD, &[(RA, 5.5, 0.0, 24.0), (DEC, -5.0, -90.0, 90.0)]));
            store.upsert_property(switch_property(DEVICE, ON_COORD_SET, &[(TRACK, true), (SLEW, false), (SYNC, false)]));
            store.upsert_property(switch_property(DEVICE, TELESCOPE_MOTION_NS, &[(MOTION_NORTH, false), (MOTION_SOUTH, false)]));
            store.upsert_property(switch_property(DEVICE, TELESCOPE_ABORT_MOTION, &[(ABORT, false)]));
            let mut rates = switch_property(DEVICE, TELESCOPE_SLEW_RATE, &[("SLEW_GUIDE", true), ("SLEW_MAX", false)]);
            if let PropertyKind::Switch { elements, .. } = &mut rates.kind {
                elements[0].label = "Guide".to_string();
                elements[1].label = "Max".to_string();
            }
            store.upsert_property(rates);
        }
        (Mount::new(ctx, DEVICE), rx)
    }

    struct FixedTransform;

    impl CoordinateTransform for FixedTransform {
        fn to_horizontal(&self, equatorial: Equatorial, _: ObserverLocation, _: DateTime<Utc>) -> Horizontal {
            Horizontal {
                alt: equatorial.dec,
                az: equatorial.ra,
            }
        }

        fn precess(&self, _: Epoch, _: Epoch, equatorial: Equatorial) -> Equatorial {
            Equatorial::new(equatorial.ra + 15.0, equatorial.dec)
        }
    }

    #[test]
    fn test_reads() {
        let (mount, _rx) = mount();
        assert_eq!(mount.ra_hours(), Some(5.5));
        assert_eq!(mount.coordinates(), Some(Equatorial::new(82.5, -5.0)));
        assert_eq!(mount.selected_slew_rate().unwrap().label, "Guide");
        assert_eq!(mount.is_parked(), None);
        let time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let horizontal = mount.horizontal(&FixedTransform, ObserverLocation::default(), time).unwrap();
        assert_eq!(horizontal.az, 82.5);
    }

    #[test]
    fn test_relative_motion_capability_follows_properties() {
        let (mount, mut rx) = mount();
        assert!(mount.can_move_relative());
        assert!(!mount.can_move_we());

        mount.move_direction(MotionDirection::North, true).unwrap();
        let msg = rx.try_recv().unwrap();
        assert!(msg.contains("<oneSwitch name=\"MOTION_NORTH\">On</oneSwitch><oneSwitch name=\"MOTION_SOUTH\">Off</oneSwitch>"));
        assert!(matches!(
            mount.move_direction(MotionDirection::East, true),
            Err(IndiError::Unsupported { .. })
        ));

        write_store(&mount.ctx.store).remove_property(DEVICE, TELESCOPE_MOTION_NS);
        assert!(!mount.can_move_relative());
        assert!(matches!(mount.stop_motion(), Err(IndiError::Unsupported { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_goto_sends_mode_then_coordinates() {
        let (mount, mut rx) = mount();
        mount.goto(Equatorial::new(150.0, 45.0), false).unwrap();
        let mode = rx.try_recv().unwrap();
        assert!(mode.contains("<oneSwitch name=\"SLEW\">On</oneSwitch>"));
        assert!(mode.contains("<oneSwitch name=\"TRACK\">Off</oneSwitch>"));
        assert_eq!(
            rx.try_recv().unwrap(),
            "<newNumberVector device=\"Telescope Simulator\" name=\"EQUATORIAL_EOD_COORD\">\
             <oneNumber name=\"RA\">10</oneNumber><oneNumber name=\"DEC\">45</oneNumber></newNumberVector>"
        );
    }

    #[test]
    fn test_goto_j2000_precesses_first() {
        let (mount, mut rx) = mount();
        let time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        mount.goto_j2000(&FixedTransform, Equatorial::new(15.0, 0.0), time, true).unwrap();
        rx.try_recv().unwrap();
        assert!(rx.try_recv().unwrap().contains("<oneNumber name=\"RA\">2</oneNumber>"));
    }

    #[test]
    fn test_tracking_and_park() {
        let (mount, mut rx) = mount();
        {
            let mut store = write_store(&mount.ctx.store);
            store.upsert_property(switch_property(DEVICE, TELESCOPE_PARK, &[(PARK, true), (UNPARK, false)]));
            store.upsert_property(switch_property(DEVICE, TELESCOPE_TRACK_STATE, &[(TRACK_ON, false), (TRACK_OFF, true)]));
        }
        assert!(mount.can_park());
        assert!(mount.has_tracking());
        assert_eq!(mount.is_parked(), Some(true));
        assert_eq!(mount.is_tracking(), Some(false));

        mount.unpark().unwrap();
        assert!(rx.try_recv().unwrap().contains("<oneSwitch name=\"UNPARK\">On</oneSwitch>"));
        mount.set_tracking(true).unwrap();
        let msg = rx.try_recv().unwrap();
        assert!(msg.contains("<oneSwitch name=\"TRACK_ON\">On</oneSwitch>"));
        assert!(msg.contains("<oneSwitch name=\"TRACK_OFF\">Off</oneSwitch>"));
    }

    #[test]
    fn test_slew_rate_follows_live_properties() {
        let (mount, mut rx) = mount();
        write_store(&mount.ctx.store).remove_property(DEVICE, TELESCOPE_SLEW_RATE);
        assert!(matches!(mount.set_slew_rate("Max"), Err(IndiError::Unsupported { .. })));
        write_store(&mount.ctx.store).remove_device(DEVICE);
        assert!(matches!(mount.set_slew_rate("Max"), Err(IndiError::DeviceGone(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_slew_rate_abort_and_park() {
        let (mount, mut rx) = mount();
        mount.set_slew_rate("Max").unwrap();
        assert!(rx.try_recv().unwrap().contains("<oneSwitch name=\"SLEW_MAX\">On</oneSwitch>"));
        let err = mount.set_slew_rate("Warp").unwrap_err();
        assert!(matches!(err, IndiError::ElementNotFound { .. }));
        assert!(err.is_invalid_value());

        mount.abort().unwrap();
        assert!(rx.try_recv().unwrap().contains("<oneSwitch name=\"ABORT\">On</oneSwitch>"));

        assert!(matches!(mount.park(), Err(IndiError::Unsupported { .. })));
        write_store(&mount.ctx.store).remove_device(DEVICE);
        assert!(matches!(mount.park(), Err(IndiError::DeviceGone(_))));
        assert!(matches!(mount.abort(), Err(IndiError::DeviceGone(_))));
    }
}
