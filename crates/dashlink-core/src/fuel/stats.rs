//! Lifetime fuel statistics and their on-disk document

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::FuelConfig;
use crate::persist::{read_json, write_json_atomic, PersistError};

/// One finished trip as kept in the rolling window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TripSummary {
    pub mpg: f64,
    pub distance_mi: f64,
}

/// On-disk fuel statistics document
///
/// The trip arrays are parallel: `trip_mpg[i]` belongs to
/// `trip_distance_mi[i]`, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedStats {
    pub total_distance_mi: f64,
    pub total_fuel_gal: f64,
    pub trip_mpg: Vec<f64>,
    pub trip_distance_mi: Vec<f64>,
    /// Unix time of the last save
    pub last_save: i64,
    /// Average reported when the document was written (informational)
    pub average_mpg: f64,
}

/// Accumulated totals across all valid trips plus the recent-trip window
#[derive(Debug, Clone, PartialEq)]
pub struct LifetimeStats {
    pub total_distance_mi: f64,
    pub total_fuel_gal: f64,
    window: VecDeque<TripSummary>,
    capacity: usize,
}

fn valid_amount(v: f64) -> bool {
    v.is_finite() && v >= 0.0
}

impl LifetimeStats {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            total_distance_mi: 0.0,
            total_fuel_gal: 0.0,
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Fold a valid trip into the totals and the window; returns its MPG
    pub fn record_trip(&mut self, distance_mi: f64, fuel_gal: f64) -> f64 {
        let mpg = distance_mi / fuel_gal;
        self.total_distance_mi += distance_mi;
        self.total_fuel_gal += fuel_gal;

        if self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(TripSummary { mpg, distance_mi });
        mpg
    }

    pub fn trips(&self) -> impl Iterator<Item = &TripSummary> {
        self.window.iter()
    }

    pub fn trip_count(&self) -> usize {
        self.window.len()
    }

    /// Lifetime MPG, if enough fuel has been logged and the ratio is plausible
    pub fn lifetime_mpg(&self, config: &FuelConfig) -> Option<f64> {
        if self.total_fuel_gal < config.min_lifetime_fuel_gal || self.total_fuel_gal <= 0.0 {
            return None;
        }
        let mpg = self.total_distance_mi / self.total_fuel_gal;
        (config.plausible_mpg_min..=config.plausible_mpg_max)
            .contains(&mpg)
            .then_some(mpg)
    }

    /// Distance-weighted average of the recent-trip window
    pub fn window_mpg(&self) -> Option<f64> {
        let distance: f64 = self.window.iter().map(|t| t.distance_mi).sum();
        if distance <= 0.0 {
            return None;
        }
        let weighted: f64 = self.window.iter().map(|t| t.mpg * t.distance_mi).sum();
        Some(weighted / distance)
    }

    /// Lifetime, else window, else the configured default
    pub fn average_mpg(&self, config: &FuelConfig) -> f64 {
        self.lifetime_mpg(config)
            .or_else(|| self.window_mpg())
            .unwrap_or(config.default_mpg)
    }

    /// Rebuild from a loaded document, dropping values that cannot be right
    pub fn from_persisted(doc: &PersistedStats, config: &FuelConfig) -> Self {
        let mut stats = Self::new(config.trip_window);

        if valid_amount(doc.total_distance_mi) && valid_amount(doc.total_fuel_gal) {
            stats.total_distance_mi = doc.total_distance_mi;
            stats.total_fuel_gal = doc.total_fuel_gal;
        } else {
            warn!(
                distance = doc.total_distance_mi,
                fuel = doc.total_fuel_gal,
                "discarding invalid lifetime totals"
            );
        }

        if doc.trip_mpg.len() != doc.trip_distance_mi.len() {
            warn!(
                mpg = doc.trip_mpg.len(),
                distance = doc.trip_distance_mi.len(),
                "trip arrays differ in length, keeping the common prefix"
            );
        }
        let trips: Vec<TripSummary> = doc
            .trip_mpg
            .iter()
            .zip(&doc.trip_distance_mi)
            .filter(|(mpg, d)| mpg.is_finite() && **mpg > 0.0 && d.is_finite() && **d > 0.0)
            .map(|(&mpg, &distance_mi)| TripSummary { mpg, distance_mi })
            .collect();
        let dropped = doc.trip_mpg.len().min(doc.trip_distance_mi.len()) - trips.len();
        if dropped > 0 {
            warn!(dropped, "dropped invalid trips from fuel statistics");
        }
        let skip = trips.len().saturating_sub(stats.capacity);
        stats.window.extend(trips.into_iter().skip(skip));

        if stats.total_fuel_gal >= config.min_lifetime_fuel_gal
            && stats.lifetime_mpg(config).is_none()
        {
            warn!(
                distance = stats.total_distance_mi,
                fuel = stats.total_fuel_gal,
                "lifetime totals imply an implausible MPG, not trusting them"
            );
        }
        stats
    }

    pub fn to_persisted(&self, config: &FuelConfig, now_epoch: i64) -> PersistedStats {
        PersistedStats {
            total_distance_mi: self.total_distance_mi,
            total_fuel_gal: self.total_fuel_gal,
            trip_mpg: self.window.iter().map(|t| t.mpg).collect(),
            trip_distance_mi: self.window.iter().map(|t| t.distance_mi).collect(),
            last_save: now_epoch,
            average_mpg: self.average_mpg(config),
        }
    }
}

/// Load statistics, falling back to empty ones on any problem
pub fn load_stats(path: &Path, config: &FuelConfig) -> LifetimeStats {
    match read_json::<PersistedStats>(path) {
        Ok(Some(doc)) => {
            let stats = LifetimeStats::from_persisted(&doc, config);
            info!(
                path = %path.display(),
                trips = stats.trip_count(),
                distance = stats.total_distance_mi,
                "loaded fuel statistics"
            );
            stats
        }
        Ok(None) => {
            debug!(path = %path.display(), "no fuel statistics yet");
            LifetimeStats::new(config.trip_window)
        }
        Err(e) => {
            warn!(path = %path.display(), "unreadable fuel statistics, starting fresh: {}", e);
            LifetimeStats::new(config.trip_window)
        }
    }
}

pub fn save_stats(
    path: &Path,
    stats: &LifetimeStats,
    config: &FuelConfig,
) -> Result<(), PersistError> {
    let doc = stats.to_persisted(config, chrono::Utc::now().timestamp());
    write_json_atomic(path, &doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> FuelConfig {
        FuelConfig {
            trip_window: 3,
            ..FuelConfig::default()
        }
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut stats = LifetimeStats::new(3);
        for d in [10.0, 20.0, 30.0, 40.0] {
            stats.record_trip(d, 1.0);
        }
        let kept: Vec<f64> = stats.trips().map(|t| t.distance_mi).collect();
        assert_eq!(kept, vec![20.0, 30.0, 40.0]);
        // Totals include every trip, evicted or not
        assert_eq!(stats.total_distance_mi, 100.0);
        assert_eq!(stats.total_fuel_gal, 4.0);
    }

    #[test]
    fn test_window_average_is_distance_weighted() {
        let mut stats = LifetimeStats::new(10);
        stats.record_trip(10.0, 0.5); // 20 mpg
        stats.record_trip(30.0, 1.0); // 30 mpg
        let avg = stats.window_mpg().unwrap();
        assert!((avg - 27.5).abs() < 1e-9, "avg = {}", avg);
    }

    #[test]
    fn test_average_precedence() {
        let cfg = config();
        let mut stats = LifetimeStats::new(3);
        assert_eq!(stats.average_mpg(&cfg), cfg.default_mpg);

        stats.record_trip(12.0, 0.4); // below min lifetime fuel
        assert!((stats.average_mpg(&cfg) - 30.0).abs() < 1e-9);

        stats.record_trip(22.0, 0.6);
        // 34 mi / 1.0 gal
        assert!((stats.average_mpg(&cfg) - 34.0).abs() < 1e-9);
    }

    #[test]
    fn test_implausible_lifetime_falls_back_to_window() {
        let cfg = config();
        let doc = PersistedStats {
            total_distance_mi: 5000.0,
            total_fuel_gal: 2.0,
            trip_mpg: vec![24.0, 28.0],
            trip_distance_mi: vec![10.0, 10.0],
            ..PersistedStats::default()
        };
        let stats = LifetimeStats::from_persisted(&doc, &cfg);
        assert_eq!(stats.lifetime_mpg(&cfg), None);
        assert!((stats.average_mpg(&cfg) - 26.0).abs() < 1e-9);
        // Kept, not erased
        assert_eq!(stats.total_distance_mi, 5000.0);
    }

    #[test]
    fn test_invalid_document_values_dropped() {
        let cfg = config();
        let doc = PersistedStats {
            total_distance_mi: -3.0,
            total_fuel_gal: f64::NAN,
            trip_mpg: vec![25.0, f64::INFINITY, -1.0, 30.0, 31.0, 32.0, 99.0],
            trip_distance_mi: vec![5.0, 5.0, 5.0, 5.0, 5.0, 5.0],
            ..PersistedStats::default()
        };
        let stats = LifetimeStats::from_persisted(&doc, &cfg);
        assert_eq!(stats.total_distance_mi, 0.0);
        assert_eq!(stats.total_fuel_gal, 0.0);
        let mpgs: Vec<f64> = stats.trips().map(|t| t.mpg).collect();
        assert_eq!(mpgs, vec![30.0, 31.0, 32.0]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fuel_stats.json");
        let cfg = config();

        let mut stats = LifetimeStats::new(cfg.trip_window);
        stats.record_trip(30.0, 1.25);
        save_stats(&path, &stats, &cfg).unwrap();

        let loaded = load_stats(&path, &cfg);
        assert_eq!(loaded, stats);

        let doc: PersistedStats = read_json(&path).unwrap().unwrap();
        assert!(doc.last_save > 0);
        assert_eq!(doc.average_mpg, 24.0);
    }

    #[test]
    fn test_corrupted_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fuel_stats.json");
        std::fs::write(&path, "{ not json").unwrap();

        let stats = load_stats(&path, &config());
        assert_eq!(stats.trip_count(), 0);
        assert_eq!(stats.total_fuel_gal, 0.0);
    }
}
