//! INDI Focuser wrapper

use std::sync::Arc;

use super::DeviceContext;
use crate::error::{IndiError, IndiResult};
use crate::model::{SwitchStatus, Value};
use crate::protocol::standard_elements::*;
use crate::protocol::standard_properties::*;

/// Focuser view of one device
#[derive(Debug, Clone)]
pub struct Focuser {
    ctx: Arc<DeviceContext>,
    device: String,
}

impl Focuser {
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

    pub fn has_direction(&self) -> bool {
        self.supports(FOCUS_MOTION, &[FOCUS_INWARD, FOCUS_OUTWARD])
    }

    pub fn has_relative_position(&self) -> bool {
        self.supports(REL_FOCUS_POSITION, &[FOCUS_RELATIVE_POSITION])
    }

    /// Direction plus step count
    pub fn can_move_relative(&self) -> bool {
        self.has_direction() && self.has_relative_position()
    }

    pub fn has_absolute_position(&self) -> bool {
        self.supports(ABS_FOCUS_POSITION, &[FOCUS_ABSOLUTE_POSITION])
    }

    pub fn can_sync(&self) -> bool {
        self.supports(FOCUS_SYNC, &[FOCUS_SYNC_VALUE])
    }

    pub fn has_speed(&self) -> bool {
        self.supports(FOCUS_SPEED, &[FOCUS_SPEED_VALUE])
    }

    pub fn can_abort(&self) -> bool {
        self.supports(FOCUS_ABORT_MOTION, &[ABORT])
    }

    pub fn position(&self) -> Option<f64> {
        self.ctx
            .read_property(&self.device, ABS_FOCUS_POSITION, |p| p.number(FOCUS_ABSOLUTE_POSITION))
            .flatten()
    }

    pub fn speed(&self) -> Option<f64> {
        self.ctx
            .read_property(&self.device, FOCUS_SPEED, |p| p.number(FOCUS_SPEED_VALUE))
            .flatten()
    }

    /// `[min, max]` of the absolute position, when the driver bounds it
    pub fn position_limits(&self) -> Option<(f64, f64)> {
        self.ctx
            .read_property(&self.device, ABS_FOCUS_POSITION, |p| {
                p.number_element(FOCUS_ABSOLUTE_POSITION)
                    .filter(|e| e.limits.is_bounded())
                    .map(|e| (e.limits.min, e.limits.max))
            })
            .flatten()
    }

    fn move_relative(&self, direction: &str, steps: u32) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        staging.require(FOCUS_MOTION, &[FOCUS_INWARD, FOCUS_OUTWARD], "relative move")?;
        staging.require(REL_FOCUS_POSITION, &[FOCUS_RELATIVE_POSITION], "relative move")?;
        staging.select(FOCUS_MOTION, direction)?;
        staging.set(REL_FOCUS_POSITION, FOCUS_RELATIVE_POSITION, Value::Number(f64::from(steps)))?;
        staging.commit()
    }

    pub fn move_inward(&self, steps: u32) -> IndiResult<()> {
        self.move_relative(FOCUS_INWARD, steps)
    }

    pub fn move_outward(&self, steps: u32) -> IndiResult<()> {
        self.move_relative(FOCUS_OUTWARD, steps)
    }

    pub fn set_absolute_position(&self, position: u32) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        staging.require(ABS_FOCUS_POSITION, &[FOCUS_ABSOLUTE_POSITION], "absolute position")?;
        staging.set(ABS_FOCUS_POSITION, FOCUS_ABSOLUTE_POSITION, Value::Number(f64::from(position)))?;
        staging.commit()
    }

    /// Tell the focuser its current position is `position`.
    pub fn sync(&self, position: u32) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        staging.require(FOCUS_SYNC, &[FOCUS_SYNC_VALUE], "sync")?;
        staging.set(FOCUS_SYNC, FOCUS_SYNC_VALUE, Value::Number(f64::from(position)))?;
        staging.commit()
    }

    pub fn set_speed(&self, speed: f64) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        staging.require(FOCUS_SPEED, &[FOCUS_SPEED_VALUE], "speed")?;
        staging.set(FOCUS_SPEED, FOCUS_SPEED_VALUE, Value::Number(speed))?;
        staging.commit()
    }

    pub fn abort(&self) -> IndiResult<()> {
        let mut staging = self.ctx.stage(&self.device)?;
        staging.require(FOCUS_ABORT_MOTION, &[ABORT], "abort")?;
        staging.set(FOCUS_ABORT_MOTION, ABORT, Value::Switch(SwitchStatus::On))?;
        staging.commit()
    }

    /// Stop motion if possible; a focuser without abort is left alone.
    pub fn try_abort(&self) -> IndiResult<bool> {
        match self.abort() {
            Ok(()) => Ok(true),
            Err(IndiError::Unsupported { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::tests::test_context;
    use crate::model::property::tests::{number_property, switch_property};
    use crate::model::{read_store, write_store};

    const DEVICE: &str = "Focuser Simulator";

    fn focuser() -> (Focuser, tokio::sync::mpsc::Receiver<String>) {
        let (ctx, rx) = test_context();
        {
            let mut store = write_store(&ctx.store);
            store.upsert_property(switch_property(DEVICE, FOCUS_MOTION, &[(FOCUS_INWARD, true), (FOCUS_OUTWARD, false)]));
            store.upsert_property(number_property(DEVICE, REL_FOCUS_POSITION, &[(FOCUS_RELATIVE_POSITION, 0.0, 0.0, 50000.0)]));
            store.upsert_property(number_property(DEVICE, ABS_FOCUS_POSITION, &[(FOCUS_ABSOLUTE_POSITION, 25000.0, 0.0, 100000.0)]));
        }
        (Focuser::new(ctx, DEVICE), rx)
    }

    #[test]
    fn test_capabilities() {
        let (focuser, _rx) = focuser();
        assert!(focuser.can_move_relative());
        assert!(focuser.has_absolute_position());
        assert!(!focuser.can_sync());
        assert!(!focuser.has_speed());
        assert!(!focuser.can_abort());
        assert_eq!(focuser.position(), Some(25000.0));
        assert_eq!(focuser.position_limits(), Some((0.0, 100000.0)));
    }

    #[test]
    fn test_move_outward_sends_direction_then_steps() {
        let (focuser, mut rx) = focuser();
        focuser.move_outward(150).unwrap();
        let direction = rx.try_recv().unwrap();
        assert!(direction.contains("<oneSwitch name=\"FOCUS_INWARD\">Off</oneSwitch>"));
        assert!(direction.contains("<oneSwitch name=\"FOCUS_OUTWARD\">On</oneSwitch>"));
        assert_eq!(
            rx.try_recv().unwrap(),
            "<newNumberVector device=\"Focuser Simulator\" name=\"REL_FOCUS_POSITION\">\
             <oneNumber name=\"FOCUS_RELATIVE_POSITION\">150</oneNumber></newNumberVector>"
        );
        // Current value waits for the server
        let store = read_store(&focuser.ctx.store);
        assert_eq!(store.property(DEVICE, FOCUS_MOTION).unwrap().switch(FOCUS_INWARD), Some(true));
    }

    #[test]
    fn test_out_of_range_sends_nothing() {
        let (focuser, mut rx) = focuser();
        let err = focuser.set_absolute_position(200000).unwrap_err();
        assert!(matches!(err, IndiError::ValueOutOfRange { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_missing_capabilities() {
        let (focuser, mut rx) = focuser();
        assert!(matches!(focuser.sync(10), Err(IndiError::Unsupported { .. })));
        assert!(matches!(focuser.set_speed(2.0), Err(IndiError::Unsupported { .. })));
        assert_eq!(focuser.try_abort().unwrap(), false);
        assert!(rx.try_recv().is_err());

        write_store(&focuser.ctx.store).remove_property(DEVICE, REL_FOCUS_POSITION);
        assert!(!focuser.can_move_relative());
        assert!(matches!(focuser.move_inward(10), Err(IndiError::Unsupported { .. })));
    }
}
