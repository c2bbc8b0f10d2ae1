//! Shared vehicle telemetry
//!
//! The external CAN decoder writes vehicle values into a [`SharedTelemetry`]
//! handle; the link worker reads consistent snapshots from it for outbound
//! frames and writes inbound sensor fields (TPMS, IMU) back into it.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Number of wheels tracked for tire data (FL, FR, RL, RR)
pub const WHEEL_COUNT: usize = 4;

/// Extended inertial values reported by a full IMU frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuMotion {
    pub accel_z: f32,
    pub gyro_x: f32,
    pub gyro_y: f32,
    pub gyro_z: f32,
    pub lin_accel_x: f32,
    pub lin_accel_y: f32,
    pub pitch: f32,
    pub roll: f32,
}

/// Inertial data from the display's IMU
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuReading {
    /// Lateral acceleration (g)
    pub accel_x: f32,
    /// Longitudinal acceleration (g)
    pub accel_y: f32,
    /// Present only when the peer sends the long form of the frame
    pub motion: Option<ImuMotion>,
}

/// Mutable record of current vehicle values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub rpm: u16,
    pub speed_mph: f32,
    /// 0 = neutral, -1 = reverse
    pub gear: i8,
    /// Gear was inferred from the rpm/speed ratio rather than reported
    pub gear_estimated: bool,
    pub throttle_pct: f32,
    pub coolant_temp_f: f32,
    pub oil_pressure_ok: bool,
    pub engine_running: bool,
    pub clutch_pressed: bool,

    /// Unfiltered fuel level from the sender unit
    pub fuel_raw_pct: Option<f32>,
    /// Smoothed fuel level from the fuel accountant
    pub fuel_pct: Option<f32>,
    pub range_miles: Option<u32>,

    pub check_engine: bool,
    pub abs_warning: bool,
    pub oil_warning: bool,
    pub battery_warning: bool,
    pub headlights: bool,
    pub high_beams: bool,

    pub tire_pressure_psi: [Option<f32>; WHEEL_COUNT],
    pub tire_temp_c: [Option<f32>; WHEEL_COUNT],
    pub tire_battery_pct: [Option<u8>; WHEEL_COUNT],
    /// Time of day each wheel last reported ("HH:MM")
    pub tire_updated: [Option<String>; WHEEL_COUNT],
    /// Wheel reported this run or within the last day; stale cached values
    /// are still shown but not flagged live
    pub tire_live: [bool; WHEEL_COUNT],

    pub imu: ImuReading,

    /// Screen currently shown by the display
    pub current_screen: u8,
}

impl TelemetrySnapshot {
    /// Fuel level to show: smoothed when available, raw otherwise
    pub fn display_fuel(&self) -> Option<f32> {
        self.fuel_pct.or(self.fuel_raw_pct)
    }
}

/// Thread-safe handle to the shared telemetry record
///
/// Cloning the handle shares the same record. Access is synchronized at
/// snapshot granularity so multi-field groups (tire arrays, IMU frames) are
/// never observed half-written.
#[derive(Debug, Clone, Default)]
pub struct SharedTelemetry {
    inner: Arc<RwLock<TelemetrySnapshot>>,
}

impl SharedTelemetry {
    /// Create a handle around a default record
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handle around an existing record
    pub fn with_snapshot(snapshot: TelemetrySnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    /// Copy the whole record
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.read_guard().clone()
    }

    /// Read a value out of the record under the lock
    pub fn read<R>(&self, f: impl FnOnce(&TelemetrySnapshot) -> R) -> R {
        f(&self.read_guard())
    }

    /// Mutate the record under the write lock
    pub fn update<R>(&self, f: impl FnOnce(&mut TelemetrySnapshot) -> R) -> R {
        f(&mut self.write_guard())
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, TelemetrySnapshot> {
        // A panicked writer cannot leave the record structurally invalid
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, TelemetrySnapshot> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
