//! Fuel economy accounting
//!
//! Turns the noisy fuel sender reading, vehicle speed and the engine
//! running flag into a smoothed fuel level, trip and lifetime MPG, and an
//! estimated range.

mod accountant;
pub mod stats;

pub use accountant::{FuelAccountant, FuelOutputs, FuelSample, TripProgress};
pub use stats::{LifetimeStats, PersistedStats, TripSummary};
