//! Demo drive - simulated vehicle for bench testing
//!
//! Produces plausible rpm, speed, gear, throttle and coolant values plus a
//! slowly draining, noisy fuel sender reading, so the display link and the
//! fuel accountant can be exercised without a car. The drive cycles
//! through parked, idle, accelerate, cruise and brake phases, with engine
//! stop/start between legs.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::telemetry::TelemetrySnapshot;

const IDLE_RPM: f64 = 850.0;
const PARKED_MS: u64 = 8_000;
const IDLE_MS: u64 = 4_000;
const ACCEL_MPH_PER_SEC: f64 = 6.0;
const BRAKE_MPH_PER_SEC: f64 = 9.0;
/// Gear ratios expressed as rpm per mph
const RPM_PER_MPH: [f64; 6] = [140.0, 85.0, 58.0, 44.0, 36.0, 30.0];
/// Deliberately high so the gauge visibly moves on a bench run
const MILES_PER_PERCENT: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Parked { until_ms: u64 },
    Idle { until_ms: u64 },
    Accelerate { target_mph: f64 },
    Cruise { until_ms: u64 },
    Brake,
}

/// Simulated vehicle that writes into a [`TelemetrySnapshot`]
pub struct DemoDrive {
    start_ms: Option<u64>,
    last_ms: u64,
    phase: Phase,
    legs_left: u32,
    speed_mph: f64,
    rpm: f64,
    coolant_f: f64,
    fuel_pct: f64,
    rng: StdRng,
}

impl Default for DemoDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoDrive {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Reproducible drive for tests
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(mut rng: StdRng) -> Self {
        let legs_left = rng.gen_range(2..5);
        Self {
            start_ms: None,
            last_ms: 0,
            phase: Phase::Idle { until_ms: IDLE_MS },
            legs_left,
            speed_mph: 0.0,
            rpm: IDLE_RPM,
            coolant_f: 120.0,
            fuel_pct: rng.gen_range(55.0..90.0),
            rng,
        }
    }

    /// True (noise-free) fuel level
    pub fn fuel_level(&self) -> f64 {
        self.fuel_pct
    }

    pub fn engine_running(&self) -> bool {
        !matches!(self.phase, Phase::Parked { .. })
    }

    /// Advance the simulation to `elapsed_ms` and write the result into `t`
    pub fn update(&mut self, elapsed_ms: u64, t: &mut TelemetrySnapshot) {
        let start = *self.start_ms.get_or_insert(elapsed_ms);
        let sim_ms = elapsed_ms.saturating_sub(start);
        let dt = elapsed_ms.saturating_sub(self.last_ms.max(start)) as f64 / 1000.0;
        self.last_ms = elapsed_ms;

        self.advance_phase(sim_ms);

        let throttle = match self.phase {
            Phase::Parked { .. } => {
                self.speed_mph = 0.0;
                0.0
            }
            Phase::Idle { .. } => 0.0,
            Phase::Accelerate { target_mph } => {
                self.speed_mph = (self.speed_mph + ACCEL_MPH_PER_SEC * dt).min(target_mph);
                self.rng.gen_range(35.0..65.0)
            }
            Phase::Cruise { .. } => {
                self.speed_mph = (self.speed_mph + self.rng.gen_range(-0.3..0.3)).max(5.0);
                self.rng.gen_range(12.0..20.0)
            }
            Phase::Brake => {
                self.speed_mph = (self.speed_mph - BRAKE_MPH_PER_SEC * dt).max(0.0);
                0.0
            }
        };

        let running = self.engine_running();
        let gear = gear_for_speed(self.speed_mph);
        let target_rpm = match gear {
            0 => IDLE_RPM,
            g => (self.speed_mph * RPM_PER_MPH[g as usize - 1]).max(IDLE_RPM),
        };
        if running {
            // Engine speed follows the target with some lag
            self.rpm += (target_rpm - self.rpm) * (dt * 4.0).min(1.0);
        } else {
            self.rpm = 0.0;
        }
        let wobble = if running { 15.0 * (sim_ms as f64 / 400.0).sin() } else { 0.0 };

        if running {
            self.coolant_f += (195.0 - self.coolant_f) * (dt / 90.0).min(1.0);
        } else {
            self.coolant_f += (80.0 - self.coolant_f) * (dt / 600.0).min(1.0);
        }

        let miles = self.speed_mph * dt / 3600.0;
        let idle_burn = if running { dt / 3600.0 } else { 0.0 };
        self.fuel_pct = (self.fuel_pct - miles / MILES_PER_PERCENT - idle_burn).max(0.0);
        // Sloshing sender
        let noise = if self.speed_mph > 0.0 { 2.5 } else { 0.5 };
        let raw_fuel = (self.fuel_pct + self.rng.gen_range(-noise..noise)).clamp(0.0, 100.0);

        t.engine_running = running;
        t.rpm = (self.rpm + wobble).max(0.0).round() as u16;
        t.speed_mph = self.speed_mph as f32;
        t.gear = gear;
        t.gear_estimated = true;
        t.throttle_pct = throttle as f32;
        t.coolant_temp_f = self.coolant_f as f32;
        t.oil_pressure_ok = running;
        t.oil_warning = !running;
        t.battery_warning = !running;
        t.clutch_pressed = matches!(self.phase, Phase::Idle { .. });
        t.fuel_raw_pct = Some(raw_fuel as f32);
    }

    fn advance_phase(&mut self, sim_ms: u64) {
        self.phase = match self.phase {
            Phase::Parked { until_ms } if sim_ms >= until_ms => {
                self.legs_left = self.rng.gen_range(2..5);
                Phase::Idle {
                    until_ms: sim_ms + IDLE_MS,
                }
            }
            Phase::Idle { until_ms } if sim_ms >= until_ms => {
                if self.legs_left == 0 {
                    Phase::Parked {
                        until_ms: sim_ms + PARKED_MS,
                    }
                } else {
                    self.legs_left -= 1;
                    Phase::Accelerate {
                        target_mph: self.rng.gen_range(25.0..70.0),
                    }
                }
            }
            Phase::Accelerate { target_mph } if self.speed_mph >= target_mph => Phase::Cruise {
                until_ms: sim_ms + self.rng.gen_range(10_000..40_000),
            },
            Phase::Cruise { until_ms } if sim_ms >= until_ms => Phase::Brake,
            Phase::Brake if self.speed_mph <= 0.0 => Phase::Idle {
                until_ms: sim_ms + IDLE_MS,
            },
            phase => phase,
        };
    }
}

fn gear_for_speed(speed_mph: f64) -> i8 {
    match speed_mph {
        s if s < 1.0 => 0,
        s if s < 15.0 => 1,
        s if s < 25.0 => 2,
        s if s < 38.0 => 3,
        s if s < 50.0 => 4,
        s if s < 62.0 => 5,
        _ => 6,
    }
}
