//! Coordinate types and the coordinate-transform contract
//!
//! The ephemeris and precession formulas live outside this crate; the mount
//! wrapper only needs something implementing [`CoordinateTransform`].

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Equatorial coordinates, RA and Dec in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Equatorial {
    pub ra: f64,
    pub dec: f64,
}

impl Equatorial {
    pub fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }

    /// INDI mounts report RA in hours
    pub fn from_hours(ra_hours: f64, dec: f64) -> Self {
        Self {
            ra: ra_hours * 15.0,
            dec,
        }
    }

    pub fn ra_hours(&self) -> f64 {
        self.ra / 15.0
    }
}

/// Horizontal coordinates in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Horizontal {
    pub alt: f64,
    pub az: f64,
}

/// Observer position in degrees, east longitude positive
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ObserverLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// Julian epoch, e.g. `Epoch::J2000`
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Epoch(pub f64);

impl Epoch {
    pub const J2000: Epoch = Epoch(2000.0);

    /// Fractional Julian year of an instant
    pub fn of(time: DateTime<Utc>) -> Self {
        let day_of_year = f64::from(time.ordinal0()) + f64::from(time.num_seconds_from_midnight()) / 86_400.0;
        Epoch(f64::from(time.year()) + day_of_year / 365.25)
    }
}

/// Pure coordinate conversions used by the mount wrapper
pub trait CoordinateTransform: Send + Sync {
    fn to_horizontal(&self, equatorial: Equatorial, observer: ObserverLocation, time: DateTime<Utc>) -> Horizontal;

    fn precess(&self, from: Epoch, to: Epoch, equatorial: Equatorial) -> Equatorial;
}
