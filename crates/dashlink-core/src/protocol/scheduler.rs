//! Outbound write scheduling
//!
//! Decides, once per worker iteration, what goes out on the wire:
//!
//! 1. the pending navigation command, if the navigation rate limit allows;
//! 2. otherwise the oldest queued FIFO command;
//! 3. otherwise a periodic telemetry frame, unless a navigation command is
//!    still waiting on the rate limit (telemetry is skipped, never queued).
//!
//! Navigation commands coalesce latest-wins: a newer one replaces the
//! pending one, so a navigation command is only ever lost by being
//! superseded.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::codec::OutboundMessage;
use crate::config::LinkConfig;

/// What the worker should transmit this iteration
#[derive(Debug, Clone, PartialEq)]
pub enum WriteDecision {
    /// Latest screen or selection change, rate limited
    Navigation(OutboundMessage),
    /// Oldest queued command
    Command(OutboundMessage),
    /// Build a telemetry frame from the current snapshot
    Telemetry {
        /// Also send the (slower-changing) tire frames
        include_tires: bool,
    },
}

/// Priority and coalescing policy for outbound traffic
#[derive(Debug)]
pub struct WriteScheduler {
    pending_navigation: Option<OutboundMessage>,
    commands: VecDeque<OutboundMessage>,
    max_commands: usize,
    navigation_interval: Duration,
    telemetry_interval: Duration,
    tire_frame_every: u32,
    last_navigation: Option<Instant>,
    last_telemetry: Option<Instant>,
    telemetry_frames: u64,
    superseded: u64,
    dropped: u64,
}

impl WriteScheduler {
    pub fn new(
        navigation_interval: Duration,
        telemetry_interval: Duration,
        tire_frame_every: u32,
        max_commands: usize,
    ) -> Self {
        Self {
            pending_navigation: None,
            commands: VecDeque::new(),
            max_commands: max_commands.max(1),
            navigation_interval,
            telemetry_interval,
            tire_frame_every: tire_frame_every.max(1),
            last_navigation: None,
            last_telemetry: None,
            telemetry_frames: 0,
            superseded: 0,
            dropped: 0,
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(
            Duration::from_millis(config.navigation_interval_ms),
            Duration::from_millis(config.telemetry_interval_ms),
            config.tire_frame_every,
            config.max_queued_commands,
        )
    }

    /// Queue a message for transmission
    pub fn enqueue(&mut self, msg: OutboundMessage) {
        if msg.is_navigation() {
            if let Some(old) = self.pending_navigation.replace(msg) {
                self.superseded += 1;
                debug!(?old, "navigation command superseded");
            }
            return;
        }

        if self.commands.len() >= self.max_commands {
            if let Some(old) = self.commands.pop_front() {
                self.dropped += 1;
                warn!(?old, "command queue full, dropping oldest");
            }
        }
        self.commands.push_back(msg);
    }

    /// Pick this iteration's write, if any
    pub fn next_write(&mut self, now: Instant) -> Option<WriteDecision> {
        if self.pending_navigation.is_some() && self.navigation_ready(now) {
            if let Some(nav) = self.pending_navigation.take() {
                self.last_navigation = Some(now);
                return Some(WriteDecision::Navigation(nav));
            }
        }

        if let Some(cmd) = self.commands.pop_front() {
            return Some(WriteDecision::Command(cmd));
        }

        // Keep the wire clear for the waiting navigation command
        if self.pending_navigation.is_some() {
            return None;
        }

        if self.telemetry_due(now) {
            self.last_telemetry = Some(now);
            let include_tires = self.telemetry_frames % u64::from(self.tire_frame_every) == 0;
            self.telemetry_frames += 1;
            return Some(WriteDecision::Telemetry { include_tires });
        }

        None
    }

    /// Put back a navigation command whose write failed
    ///
    /// Dropped if a newer one arrived in the meantime.
    pub fn restore_navigation(&mut self, msg: OutboundMessage) {
        if self.pending_navigation.is_none() {
            self.pending_navigation = Some(msg);
        } else {
            self.superseded += 1;
        }
    }

    /// Restart periodic timing after a (re)connect so the peer gets a full
    /// frame, tires included, right away
    pub fn reset_telemetry(&mut self) {
        self.last_telemetry = None;
        self.telemetry_frames = 0;
    }

    pub fn has_pending_navigation(&self) -> bool {
        self.pending_navigation.is_some()
    }

    pub fn queued_commands(&self) -> usize {
        self.commands.len()
    }

    /// Navigation commands replaced by a newer one before being sent
    pub fn superseded_count(&self) -> u64 {
        self.superseded
    }

    /// FIFO commands dropped because the queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    fn navigation_ready(&self, now: Instant) -> bool {
        self.last_navigation
            .map(|t| now.saturating_duration_since(t) >= self.navigation_interval)
            .unwrap_or(true)
    }

    fn telemetry_due(&self, now: Instant) -> bool {
        self.last_telemetry
            .map(|t| now.saturating_duration_since(t) >= self.telemetry_interval)
            .unwrap_or(true)
    }
}
