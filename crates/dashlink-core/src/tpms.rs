//! TPMS cache
//!
//! Wireless tire sensors report intermittently and nothing is known at
//! startup, so the last reading of every wheel is kept on disk. Each wheel
//! carries its own time-of-day stamp; updating one wheel never touches
//! another wheel's fields.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::persist::{read_json, write_json_atomic};
use crate::telemetry::{TelemetrySnapshot, WHEEL_COUNT};

/// Cached data older than this is shown but not flagged live
pub const STALE_AFTER_SECS: i64 = 24 * 60 * 60;

const PRESSURE_RANGE_PSI: (f32, f32) = (0.0, 100.0);
const TEMPERATURE_RANGE_C: (f32, f32) = (-40.0, 125.0);

/// Wheel position, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Wheel {
    FrontLeft,
    FrontRight,
    RearLeft,
    RearRight,
}

impl Wheel {
    pub const ALL: [Wheel; WHEEL_COUNT] = [
        Wheel::FrontLeft,
        Wheel::FrontRight,
        Wheel::RearLeft,
        Wheel::RearRight,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            Wheel::FrontLeft => "FL",
            Wheel::FrontRight => "FR",
            Wheel::RearLeft => "RL",
            Wheel::RearRight => "RR",
        }
    }
}

/// Last known data for one wheel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TireSample {
    pub pressure_psi: Option<f32>,
    pub temperature_c: Option<f32>,
    pub battery_pct: Option<u8>,
    /// Local time of day of the last report ("HH:MM")
    pub updated: Option<String>,
}

/// On-disk form of the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedCache {
    pressure: [Option<f32>; WHEEL_COUNT],
    temperature_c: [Option<f32>; WHEEL_COUNT],
    battery: [Option<u8>; WHEEL_COUNT],
    /// Unix time of the last write
    timestamp: i64,
    times: [Option<String>; WHEEL_COUNT],
}

fn in_range(v: f32, (lo, hi): (f32, f32)) -> bool {
    v.is_finite() && v >= lo && v <= hi
}

fn plausible_pressure(v: Option<f32>) -> Option<f32> {
    v.filter(|p| in_range(*p, PRESSURE_RANGE_PSI))
}

fn plausible_temperature(v: Option<f32>) -> Option<f32> {
    v.filter(|t| in_range(*t, TEMPERATURE_RANGE_C))
}

fn plausible_battery(v: Option<u8>) -> Option<u8> {
    v.filter(|b| *b <= 100)
}

/// Per-wheel tire data with durable persistence
#[derive(Debug)]
pub struct TpmsCache {
    path: Option<PathBuf>,
    wheels: [TireSample; WHEEL_COUNT],
    live: [bool; WHEEL_COUNT],
}

impl TpmsCache {
    /// A cache that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            wheels: Default::default(),
            live: [false; WHEEL_COUNT],
        }
    }

    /// Load the cache from `path`
    ///
    /// Never fails: a missing or unreadable document yields an empty cache,
    /// and implausible values are dropped rather than trusted.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        Self::load_at(path, Local::now())
    }

    pub fn load_at(path: impl Into<PathBuf>, now: DateTime<Local>) -> Self {
        let path = path.into();
        let mut cache = Self {
            path: Some(path.clone()),
            ..Self::in_memory()
        };

        let doc: PersistedCache = match read_json(&path) {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                debug!(path = %path.display(), "no TPMS cache yet");
                return cache;
            }
            Err(e) => {
                warn!(path = %path.display(), "ignoring unreadable TPMS cache: {}", e);
                return cache;
            }
        };

        let age = now.timestamp() - doc.timestamp;
        let fresh = (0..STALE_AFTER_SECS).contains(&age);

        for i in 0..WHEEL_COUNT {
            let sample = TireSample {
                pressure_psi: plausible_pressure(doc.pressure[i]),
                temperature_c: plausible_temperature(doc.temperature_c[i]),
                battery_pct: plausible_battery(doc.battery[i]),
                updated: doc.times[i].clone(),
            };
            if sample.pressure_psi != doc.pressure[i]
                || sample.temperature_c != doc.temperature_c[i]
                || sample.battery_pct != doc.battery[i]
            {
                warn!(wheel = i, "dropping implausible cached tire values");
            }
            cache.live[i] = fresh && sample.pressure_psi.is_some();
            cache.wheels[i] = sample;
        }

        info!(
            path = %path.display(),
            age_secs = age,
            fresh,
            "loaded TPMS cache"
        );
        cache
    }

    /// Record a sensor report for one wheel and persist the cache
    pub fn update(&mut self, wheel: Wheel, pressure_psi: f32, temperature_c: f32, battery_pct: u8) {
        self.update_at(wheel, pressure_psi, temperature_c, battery_pct, Local::now());
    }

    pub fn update_at(
        &mut self,
        wheel: Wheel,
        pressure_psi: f32,
        temperature_c: f32,
        battery_pct: u8,
        now: DateTime<Local>,
    ) {
        let i = wheel.index();
        let sample = &mut self.wheels[i];

        match plausible_pressure(Some(pressure_psi)) {
            Some(p) => sample.pressure_psi = Some(p),
            None => warn!(wheel = wheel.label(), pressure_psi, "ignoring implausible pressure"),
        }
        match plausible_temperature(Some(temperature_c)) {
            Some(t) => sample.temperature_c = Some(t),
            None => warn!(wheel = wheel.label(), temperature_c, "ignoring implausible temperature"),
        }
        match plausible_battery(Some(battery_pct)) {
            Some(b) => sample.battery_pct = Some(b),
            None => warn!(wheel = wheel.label(), battery_pct, "ignoring implausible battery level"),
        }
        sample.updated = Some(now.format("%H:%M").to_string());
        self.live[i] = true;

        self.persist(now);
    }

    pub fn wheel(&self, wheel: Wheel) -> &TireSample {
        &self.wheels[wheel.index()]
    }

    pub fn wheels(&self) -> &[TireSample; WHEEL_COUNT] {
        &self.wheels
    }

    /// Whether the wheel's data is current (reported this run, or cached
    /// less than a day ago)
    pub fn is_live(&self, wheel: Wheel) -> bool {
        self.live[wheel.index()]
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Copy one wheel into the telemetry record
    pub fn mirror_wheel(&self, wheel: Wheel, t: &mut TelemetrySnapshot) {
        let i = wheel.index();
        let sample = &self.wheels[i];
        t.tire_pressure_psi[i] = sample.pressure_psi;
        t.tire_temp_c[i] = sample.temperature_c;
        t.tire_battery_pct[i] = sample.battery_pct;
        t.tire_updated[i] = sample.updated.clone();
        t.tire_live[i] = self.live[i];
    }

    /// Copy every wheel into the telemetry record
    pub fn mirror_all(&self, t: &mut TelemetrySnapshot) {
        for wheel in Wheel::ALL {
            self.mirror_wheel(wheel, t);
        }
    }

    fn persist(&self, now: DateTime<Local>) {
        let Some(path) = &self.path else {
            return;
        };
        let doc = PersistedCache {
            pressure: std::array::from_fn(|i| self.wheels[i].pressure_psi),
            temperature_c: std::array::from_fn(|i| self.wheels[i].temperature_c),
            battery: std::array::from_fn(|i| self.wheels[i].battery_pct),
            timestamp: now.timestamp(),
            times: std::array::from_fn(|i| self.wheels[i].updated.clone()),
        };
        // In-memory state stays authoritative for this run
        if let Err(e) = write_json_atomic(path, &doc) {
            warn!(path = %path.display(), "failed to persist TPMS cache: {}", e);
        }
    }
}
