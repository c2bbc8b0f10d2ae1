//! Fuel accountant

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::stats::{load_stats, save_stats, LifetimeStats};
use crate::config::FuelConfig;

/// One periodic input sample
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FuelSample {
    /// Vehicle speed, integrated into trip distance
    pub speed_mph: f64,
    /// Raw fuel sender reading, when one is available
    pub raw_fuel_pct: Option<f64>,
    /// Transitions start and end trips
    pub engine_running: bool,
}

/// Progress of the trip in progress
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TripProgress {
    pub elapsed_secs: f64,
    /// Smoothed level when the trip began, if one was known
    pub start_fuel_pct: Option<f64>,
    pub distance_mi: f64,
    /// Drop in smoothed level converted with the tank size
    pub fuel_used_gal: f64,
}

/// Values published after every update
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FuelOutputs {
    pub smoothed_fuel_pct: Option<f64>,
    /// Lifetime economy, falling back to the trip window then the default
    pub average_mpg: f64,
    /// Remaining range; `None` until the level is known
    pub range_miles: Option<u32>,
    pub trip: Option<TripProgress>,
    pub last_trip_mpg: Option<f64>,
    pub lifetime_distance_mi: f64,
    pub lifetime_fuel_gal: f64,
    pub trips_in_window: usize,
}

#[derive(Debug)]
struct TripRecord {
    started: Instant,
    start_fuel_pct: Option<f64>,
    distance_mi: f64,
    fuel_used_gal: f64,
}

#[derive(Debug)]
struct AccountantState {
    smoothed: Option<f64>,
    last_tick: Option<Instant>,
    engine_running: bool,
    trip: Option<TripRecord>,
    last_trip_mpg: Option<f64>,
    stats: LifetimeStats,
    last_save: Instant,
}

/// Smoothed fuel level, trips, lifetime statistics and range
///
/// Updates and output reads may come from different threads. Outputs sit
/// behind their own lock so readers never wait on an update in progress.
pub struct FuelAccountant {
    config: FuelConfig,
    path: Option<PathBuf>,
    state: Mutex<AccountantState>,
    outputs: RwLock<FuelOutputs>,
}

impl FuelAccountant {
    /// Accountant that never touches the disk
    pub fn in_memory(config: FuelConfig) -> Self {
        let stats = LifetimeStats::new(config.trip_window);
        Self::with_stats(config, None, stats)
    }

    /// Accountant backed by the statistics document at `path`
    pub fn load(config: FuelConfig, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stats = load_stats(&path, &config);
        Self::with_stats(config, Some(path), stats)
    }

    fn with_stats(config: FuelConfig, path: Option<PathBuf>, stats: LifetimeStats) -> Self {
        let state = AccountantState {
            smoothed: None,
            last_tick: None,
            engine_running: false,
            trip: None,
            last_trip_mpg: None,
            stats,
            last_save: Instant::now(),
        };
        let outputs = Self::compute_outputs(&config, &state, Instant::now());
        Self {
            config,
            path,
            state: Mutex::new(state),
            outputs: RwLock::new(outputs),
        }
    }

    pub fn config(&self) -> &FuelConfig {
        &self.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Latest published outputs
    pub fn outputs(&self) -> FuelOutputs {
        *self.outputs.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Feed one sample taken now
    pub fn update(&self, sample: FuelSample) -> FuelOutputs {
        self.update_at(sample, Instant::now())
    }

    /// Feed one sample taken at `now`
    pub fn update_at(&self, sample: FuelSample, now: Instant) -> FuelOutputs {
        let cfg = &self.config;
        let mut state = self.lock();

        let dt_secs = state
            .last_tick
            .map(|t| {
                now.saturating_duration_since(t)
                    .as_secs_f64()
                    .min(cfg.max_tick_secs)
            })
            .unwrap_or(0.0);
        state.last_tick = Some(now);

        let previous = state.smoothed;
        match sample.raw_fuel_pct {
            Some(raw) if raw.is_finite() && (0.0..=100.0).contains(&raw) => {
                state.smoothed = Some(match previous {
                    Some(p) => cfg.smoothing_alpha * raw + (1.0 - cfg.smoothing_alpha) * p,
                    None => raw,
                });
            }
            Some(raw) => debug!(raw, "rejecting out-of-range fuel reading"),
            None => {}
        }

        let was_running = state.engine_running;
        state.engine_running = sample.engine_running;

        match (was_running, sample.engine_running) {
            (false, true) => {
                info!(fuel_pct = ?state.smoothed, "engine started, trip begins");
                state.trip = Some(TripRecord {
                    started: now,
                    start_fuel_pct: state.smoothed,
                    distance_mi: 0.0,
                    fuel_used_gal: 0.0,
                });
            }
            (true, false) => {
                if let Some(trip) = state.trip.take() {
                    self.finish_trip(&mut state, trip, now);
                }
            }
            (true, true) => {
                let smoothed = state.smoothed;
                if let Some(trip) = state.trip.as_mut() {
                    if sample.speed_mph.is_finite() && sample.speed_mph > cfg.min_driving_speed_mph
                    {
                        trip.distance_mi += sample.speed_mph * dt_secs / 3600.0;
                    }
                    // Rising level is refueling, never negative consumption
                    if let (Some(prev), Some(cur)) = (previous, smoothed) {
                        let delta = prev - cur;
                        if delta > 0.0 {
                            trip.fuel_used_gal += delta / 100.0 * cfg.tank_capacity_gal;
                        }
                    }
                }
            }
            (false, false) => {}
        }

        if now.saturating_duration_since(state.last_save)
            >= Duration::from_secs(cfg.save_interval_secs)
        {
            self.persist(&mut state, now);
        }

        let outputs = Self::compute_outputs(cfg, &state, now);
        *self.outputs.write().unwrap_or_else(|e| e.into_inner()) = outputs;
        outputs
    }

    /// Clear lifetime totals and the trip window (operator action)
    pub fn reset_lifetime(&self) {
        let mut state = self.lock();
        state.stats = LifetimeStats::new(self.config.trip_window);
        state.last_trip_mpg = None;
        info!("lifetime fuel statistics reset");

        let now = Instant::now();
        self.persist(&mut state, now);
        let outputs = Self::compute_outputs(&self.config, &state, now);
        *self.outputs.write().unwrap_or_else(|e| e.into_inner()) = outputs;
    }

    /// Persist current statistics (e.g. at shutdown)
    pub fn flush(&self) {
        let mut state = self.lock();
        self.persist(&mut state, Instant::now());
    }

    pub fn lifetime(&self) -> LifetimeStats {
        self.lock().stats.clone()
    }

    fn finish_trip(&self, state: &mut AccountantState, trip: TripRecord, now: Instant) {
        let cfg = &self.config;
        if trip.distance_mi < cfg.min_trip_distance_mi || trip.fuel_used_gal < cfg.min_trip_fuel_gal
        {
            info!(
                distance_mi = trip.distance_mi,
                fuel_gal = trip.fuel_used_gal,
                "engine stopped, discarding short trip"
            );
            return;
        }

        let mpg = state.stats.record_trip(trip.distance_mi, trip.fuel_used_gal);
        state.last_trip_mpg = Some(mpg);
        info!(
            distance_mi = trip.distance_mi,
            fuel_gal = trip.fuel_used_gal,
            mpg,
            duration_secs = now.saturating_duration_since(trip.started).as_secs(),
            "engine stopped, trip recorded"
        );
        self.persist(state, now);
    }

    fn persist(&self, state: &mut AccountantState, now: Instant) {
        state.last_save = now;
        let Some(path) = &self.path else {
            return;
        };
        match save_stats(path, &state.stats, &self.config) {
            Ok(()) => debug!(path = %path.display(), "saved fuel statistics"),
            Err(e) => warn!(path = %path.display(), "failed to save fuel statistics: {}", e),
        }
    }

    fn compute_outputs(cfg: &FuelConfig, state: &AccountantState, now: Instant) -> FuelOutputs {
        let average_mpg = state.stats.average_mpg(cfg);
        let range_miles = state.smoothed.map(|pct| {
            let gallons = pct / 100.0 * cfg.tank_capacity_gal;
            (gallons * average_mpg.min(cfg.max_range_mpg)).floor().max(0.0) as u32
        });

        FuelOutputs {
            smoothed_fuel_pct: state.smoothed,
            average_mpg,
            range_miles,
            trip: state.trip.as_ref().map(|t| TripProgress {
                elapsed_secs: now.saturating_duration_since(t.started).as_secs_f64(),
                start_fuel_pct: t.start_fuel_pct,
                distance_mi: t.distance_mi,
                fuel_used_gal: t.fuel_used_gal,
            }),
            last_trip_mpg: state.last_trip_mpg,
            lifetime_distance_mi: state.stats.total_distance_mi,
            lifetime_fuel_gal: state.stats.total_fuel_gal,
            trips_in_window: state.stats.trip_count(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AccountantState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
