//! # dashlink Core Library
//!
//! Core functionality for the dashlink display bridge.

#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - A reconnecting line-protocol link to the display microcontroller
//! - A persistent per-wheel TPMS cache
//! - Fuel economy accounting (smoothed level, trips, lifetime MPG, range)
//! - Bidirectional display settings synchronization
//!
//! ## Example
//!
//! ```rust,ignore
//! use dashlink_core::prelude::*;
//!
//! let config = BridgeConfig::load_or_default(None)?;
//! let telemetry = SharedTelemetry::new();
//! let sender = LinkSender::new(&config.link);
//! let settings = Arc::new(SettingsSync::new(sender.clone()));
//! let tpms = TpmsCache::load(config.storage.tpms_cache_path());
//!
//! let link = SerialLink::new(config.link, sender, telemetry, tpms, settings, listener);
//! link.start()?;
//! link.send(OutboundMessage::Screen(2));
//! ```

pub mod config;
pub mod demo;
pub mod fuel;
pub mod persist;
pub mod protocol;
pub mod settings;
pub mod telemetry;
pub mod tpms;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{BridgeConfig, FuelConfig, LinkConfig, StorageConfig};
    pub use crate::demo::DemoDrive;
    pub use crate::fuel::{FuelAccountant, FuelOutputs, FuelSample};
    pub use crate::protocol::{
        ConnectionState, InboundMessage, LinkError, LinkListener, LinkSender, LinkStats,
        OutboundMessage, SerialLink,
    };
    pub use crate::settings::{SettingValue, SettingsSync};
    pub use crate::telemetry::{SharedTelemetry, TelemetrySnapshot};
    pub use crate::tpms::{TireSample, TpmsCache, Wheel};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
