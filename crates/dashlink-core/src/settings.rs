//! Display settings synchronization
//!
//! Both ends can change a setting. Local changes go out as `SET:name=value`;
//! remote changes (`SETTING:` / `SETTINGS:`) update the local table and are
//! reported back to the link so its listener can react. Remote changes are
//! never echoed back to the display.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::protocol::{LinkSender, OutboundMessage};

/// A setting value; the variant of the default fixes the setting's type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl SettingValue {
    /// Wire encoding
    pub fn encode(&self) -> String {
        match self {
            SettingValue::Bool(b) => u8::from(*b).to_string(),
            SettingValue::Int(i) => i.to_string(),
            SettingValue::Float(f) => format!("{:.1}", f),
        }
    }

    /// Parse `raw` as the same type as `self`
    pub fn parse_like(&self, raw: &str) -> Option<SettingValue> {
        let raw = raw.trim();
        match self {
            SettingValue::Bool(_) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => Some(SettingValue::Bool(true)),
                "0" | "false" | "off" => Some(SettingValue::Bool(false)),
                _ => None,
            },
            SettingValue::Int(_) => raw
                .parse::<i64>()
                .ok()
                .or_else(|| {
                    raw.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f.round() as i64)
                })
                .map(SettingValue::Int),
            SettingValue::Float(_) => raw
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(SettingValue::Float),
        }
    }

    /// Convert `value` to the type of `self`, if it makes sense
    fn coerce(&self, value: SettingValue) -> Option<SettingValue> {
        match (self, value) {
            (SettingValue::Bool(_), SettingValue::Bool(_))
            | (SettingValue::Int(_), SettingValue::Int(_)) => Some(value),
            (SettingValue::Float(_), SettingValue::Float(f)) if f.is_finite() => Some(value),
            (SettingValue::Float(_), SettingValue::Int(i)) => Some(SettingValue::Float(i as f64)),
            (SettingValue::Int(_), SettingValue::Float(f)) if f.is_finite() => {
                Some(SettingValue::Int(f.round() as i64))
            }
            _ => None,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Settings known to both ends, with their defaults
pub const DEFAULT_SETTINGS: &[(&str, SettingValue)] = &[
    ("brightness", SettingValue::Int(80)),
    ("auto_dim", SettingValue::Bool(true)),
    ("use_mph", SettingValue::Bool(true)),
    ("use_fahrenheit", SettingValue::Bool(true)),
    ("shift_rpm", SettingValue::Int(6500)),
    ("redline_rpm", SettingValue::Int(7200)),
    ("coolant_warn_f", SettingValue::Int(230)),
    ("tire_low_psi", SettingValue::Float(28.0)),
    ("tire_high_psi", SettingValue::Float(40.0)),
    ("shift_light", SettingValue::Bool(true)),
];

/// Local copy of the display settings
pub struct SettingsSync {
    values: Mutex<BTreeMap<String, SettingValue>>,
    sender: LinkSender,
}

impl SettingsSync {
    /// Start from [`DEFAULT_SETTINGS`]
    pub fn new(sender: LinkSender) -> Self {
        let values = DEFAULT_SETTINGS
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect();
        Self::with_values(sender, values)
    }

    /// Start from an explicit table; its keys are the known settings
    pub fn with_values(sender: LinkSender, values: BTreeMap<String, SettingValue>) -> Self {
        Self {
            values: Mutex::new(values),
            sender,
        }
    }

    pub fn get(&self, name: &str) -> Option<SettingValue> {
        self.lock().get(name).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, SettingValue> {
        self.lock().clone()
    }

    /// Change a setting locally and tell the display
    ///
    /// Returns false (and sends nothing) for unknown names or values that
    /// cannot be converted to the setting's type.
    pub fn set(&self, name: &str, value: SettingValue) -> bool {
        let applied = {
            let mut values = self.lock();
            match values.get_mut(name) {
                Some(slot) => match slot.coerce(value) {
                    Some(v) => {
                        *slot = v;
                        Some(v)
                    }
                    None => None,
                },
                None => None,
            }
        };

        match applied {
            Some(v) => {
                self.sender.send(OutboundMessage::Setting {
                    name: name.to_string(),
                    value: v.encode(),
                });
                true
            }
            None => {
                debug!(name, %value, "rejected local setting change");
                false
            }
        }
    }

    /// Apply a change reported by the display
    ///
    /// Returns the stored value for known, parsable settings so the caller
    /// can notify its listener.
    pub fn apply_remote(&self, name: &str, raw: &str) -> Option<SettingValue> {
        let mut values = self.lock();
        let Some(slot) = values.get_mut(name) else {
            debug!(name, raw, "ignoring unknown remote setting");
            return None;
        };
        match slot.parse_like(raw) {
            Some(v) => {
                *slot = v;
                Some(v)
            }
            None => {
                debug!(name, raw, "ignoring unparsable remote setting");
                None
            }
        }
    }

    /// Apply a bulk `SETTINGS:` payload, returning the resulting table
    pub fn apply_bulk(&self, pairs: &[(String, String)]) -> BTreeMap<String, SettingValue> {
        let mut applied = 0;
        for (name, raw) in pairs {
            if self.apply_remote(name, raw).is_some() {
                applied += 1;
            }
        }
        info!(applied, received = pairs.len(), "settings synchronized from display");
        self.snapshot()
    }

    /// Queue every known setting for transmission; returns how many
    pub fn send_all(&self) -> usize {
        let snapshot = self.snapshot();
        for (name, value) in &snapshot {
            self.sender.send(OutboundMessage::Setting {
                name: name.clone(),
                value: value.encode(),
            });
        }
        debug!(count = snapshot.len(), "queued full settings sync");
        snapshot.len()
    }

    /// Ask the display to report all of its settings
    pub fn request_all(&self) {
        self.sender.send(OutboundMessage::GetSettings);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, SettingValue>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::protocol::WriteDecision;
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    fn sync() -> (SettingsSync, LinkSender) {
        let sender = LinkSender::new(&LinkConfig::default());
        (SettingsSync::new(sender.clone()), sender)
    }

    fn drain(sender: &LinkSender) -> Vec<String> {
        let mut out = Vec::new();
        let now = Instant::now();
        while let Some(WriteDecision::Command(msg)) = sender.next_write(now) {
            out.push(msg.encode());
        }
        out
    }

    #[test]
    fn test_parse_like_follows_type() {
        assert_eq!(
            SettingValue::Bool(false).parse_like("on"),
            Some(SettingValue::Bool(true))
        );
        assert_eq!(
            SettingValue::Int(0).parse_like("6499.6"),
            Some(SettingValue::Int(6500))
        );
        assert_eq!(
            SettingValue::Float(0.0).parse_like("27.5"),
            Some(SettingValue::Float(27.5))
        );
        assert_eq!(SettingValue::Float(0.0).parse_like("NaN"), None);
        assert_eq!(SettingValue::Bool(true).parse_like("maybe"), None);
    }

    #[test]
    fn test_local_set_sends_and_updates() {
        let (s, sender) = sync();
        assert!(s.set("brightness", SettingValue::Int(40)));
        assert_eq!(s.get("brightness"), Some(SettingValue::Int(40)));
        assert!(s.set("tire_low_psi", SettingValue::Int(30)));
        assert_eq!(s.get("tire_low_psi"), Some(SettingValue::Float(30.0)));
        assert!(!s.set("unknown", SettingValue::Int(1)));
        assert!(!s.set("use_mph", SettingValue::Int(1)));

        assert_eq!(
            drain(&sender),
            vec!["SET:brightness=40\n", "SET:tire_low_psi=30.0\n"]
        );
    }

    #[test]
    fn test_remote_change_not_echoed() {
        let (s, sender) = sync();
        assert_eq!(
            s.apply_remote("shift_rpm", "6800"),
            Some(SettingValue::Int(6800))
        );
        assert_eq!(s.apply_remote("nonexistent", "1"), None);
        assert_eq!(s.apply_remote("use_mph", "banana"), None);
        assert_eq!(s.get("use_mph"), Some(SettingValue::Bool(true)));
        assert!(drain(&sender).is_empty());
    }

    #[test]
    fn test_bulk_sync_is_idempotent() {
        let (s, _sender) = sync();
        let payload = vec![
            ("brightness".to_string(), "55".to_string()),
            ("use_mph".to_string(), "0".to_string()),
            ("tire_high_psi".to_string(), "42.5".to_string()),
            ("bogus".to_string(), "9".to_string()),
        ];
        let first = s.apply_bulk(&payload);
        let second = s.apply_bulk(&payload);
        assert_eq!(first, second);
        assert_eq!(first.get("use_mph"), Some(&SettingValue::Bool(false)));
        assert!(!first.contains_key("bogus"));
    }

    #[test]
    fn test_send_all_covers_every_setting() {
        let (s, sender) = sync();
        assert_eq!(s.send_all(), DEFAULT_SETTINGS.len());
        let lines = drain(&sender);
        assert_eq!(lines.len(), DEFAULT_SETTINGS.len());
        assert!(lines.contains(&"SET:use_fahrenheit=1\n".to_string()));

        s.request_all();
        assert_eq!(drain(&sender), vec!["GET_SETTINGS\n"]);
    }
}
