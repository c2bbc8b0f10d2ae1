//! Link management
//!
//! [`SerialLink`] owns the one physical channel to the display. A single
//! worker thread performs all channel I/O, so outbound lines are never
//! interleaved. Each iteration it:
//!
//! 1. reconnects if disconnected (gated by the retry interval);
//! 2. performs at most one scheduled write;
//! 3. drains and dispatches complete inbound lines;
//! 4. sleeps briefly if it did nothing.
//!
//! A missing display is the normal state while the car is off or the
//! display is unplugged; the worker simply keeps retrying.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::channel::{ChannelOpener, LinkChannel, SerialOpener};
use super::codec::{
    parse_line, DiagnosticFrame, InboundMessage, LineBuffer, OutboundMessage, TelemetryFrame,
};
use super::scheduler::{WriteDecision, WriteScheduler};
use super::{LinkError, MAX_READS_PER_ITERATION, READ_CHUNK_SIZE};
use crate::config::LinkConfig;
use crate::settings::{SettingValue, SettingsSync};
use crate::telemetry::{SharedTelemetry, WHEEL_COUNT};
use crate::tpms::{TpmsCache, Wheel};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No channel open; retrying on the retry interval
    Disconnected,
    /// Opening the channel
    Connecting,
    /// Channel open and serviced by the worker
    Connected,
}

/// Receives display events
///
/// Callbacks run on the link worker thread and must return quickly.
pub trait LinkListener: Send + Sync {
    /// The display switched to another screen
    fn on_screen_changed(&self, _screen: u8) {}

    /// The display changed one setting (already applied locally)
    fn on_setting_changed(&self, _name: &str, _value: &SettingValue) {}

    /// The display pushed its full settings table
    fn on_settings_synced(&self, _settings: &BTreeMap<String, SettingValue>) {}

    /// The highlighted item on the current screen moved
    fn on_selection_changed(&self, _index: u8) {}

    /// The link changed state
    fn on_connection_changed(&self, _state: ConnectionState) {}
}

/// Listener that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl LinkListener for NoopListener {}

/// Point-in-time link counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Bytes written to the display
    pub tx_bytes: u64,
    /// Bytes read from the display
    pub rx_bytes: u64,
    /// Complete lines written
    pub tx_lines: u64,
    /// Non-empty lines received
    pub rx_lines: u64,
    /// `OK:` acknowledgements received
    pub acks: u64,
    /// Successful channel opens, first connect included
    pub connects: u64,
    /// Received lines with a known prefix but a bad payload
    pub decode_errors: u64,
    /// Received lines dropped for exceeding the length limit
    pub line_overflows: u64,
    /// Navigation commands replaced before being sent
    pub superseded_navigation: u64,
    /// Queued commands dropped because the queue was full
    pub dropped_commands: u64,
}

#[derive(Debug, Default)]
struct Counters {
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    tx_lines: AtomicU64,
    rx_lines: AtomicU64,
    acks: AtomicU64,
    connects: AtomicU64,
    decode_errors: AtomicU64,
    line_overflows: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// State shared between the link handle and its worker
#[derive(Debug)]
struct LinkShared {
    state: Mutex<ConnectionState>,
    stop: AtomicBool,
    counters: Counters,
}

impl LinkShared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable handle for queueing outbound messages
///
/// Sending never waits on channel I/O; messages are transmitted later by
/// the worker.
#[derive(Debug, Clone)]
pub struct LinkSender {
    scheduler: Arc<Mutex<WriteScheduler>>,
}

impl LinkSender {
    pub fn new(config: &LinkConfig) -> Self {
        Self::from_scheduler(WriteScheduler::from_config(config))
    }

    pub fn from_scheduler(scheduler: WriteScheduler) -> Self {
        Self {
            scheduler: Arc::new(Mutex::new(scheduler)),
        }
    }

    /// Queue a message for the display
    pub fn send(&self, msg: OutboundMessage) {
        self.lock().enqueue(msg);
    }

    /// Whether a navigation command is waiting to go out
    pub fn has_pending_navigation(&self) -> bool {
        self.lock().has_pending_navigation()
    }

    pub(crate) fn next_write(&self, now: Instant) -> Option<WriteDecision> {
        self.lock().next_write(now)
    }

    fn restore_navigation(&self, msg: OutboundMessage) {
        self.lock().restore_navigation(msg);
    }

    fn reset_telemetry(&self) {
        self.lock().reset_telemetry();
    }

    fn superseded_count(&self) -> u64 {
        self.lock().superseded_count()
    }

    fn dropped_count(&self) -> u64 {
        self.lock().dropped_count()
    }

    fn lock(&self) -> MutexGuard<'_, WriteScheduler> {
        self.scheduler.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

/// The single owner of the physical channel
struct Worker {
    config: LinkConfig,
    opener: Box<dyn ChannelOpener>,
    channel: Option<Box<dyn LinkChannel>>,
    shared: Arc<LinkShared>,
    sender: LinkSender,
    telemetry: SharedTelemetry,
    tpms: TpmsCache,
    settings: Arc<SettingsSync>,
    listener: Arc<dyn LinkListener>,
    lines: LineBuffer,
    /// A failed write may have left a partial line on the wire
    line_dirty: bool,
    consecutive_errors: u32,
    last_attempt: Option<Instant>,
}

impl Worker {
    fn run(mut self) -> Self {
        info!("link worker started");
        let idle = Duration::from_millis(self.config.idle_sleep_ms);

        while !self.shared.stop.load(Ordering::Acquire) {
            if !self.iterate(Instant::now()) {
                thread::sleep(idle);
            }
        }

        if self.channel.is_some() {
            self.disconnect("link stopped");
        }
        info!("link worker stopped");
        self
    }

    /// One pass of the loop; returns whether any work was done
    fn iterate(&mut self, now: Instant) -> bool {
        if self.channel.is_none() && !self.try_connect(now) {
            return false;
        }
        let wrote = self.service_write(now);
        let read = self.service_read();
        wrote || read
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut current = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            debug!(?state, "link state changed");
            self.listener.on_connection_changed(state);
        }
    }

    fn try_connect(&mut self, now: Instant) -> bool {
        let retry = Duration::from_millis(self.config.retry_interval_ms);
        if let Some(last) = self.last_attempt {
            if now.saturating_duration_since(last) < retry {
                return false;
            }
        }
        self.last_attempt = Some(now);
        self.set_state(ConnectionState::Connecting);

        match self.opener.open() {
            Ok(mut channel) => {
                if let Err(e) = channel.clear_input_buffer() {
                    debug!("failed to clear input buffer: {}", e);
                }
                info!(channel = %channel.name(), "display connected");
                self.channel = Some(channel);
                self.lines.clear();
                self.line_dirty = false;
                self.consecutive_errors = 0;
                self.sender.reset_telemetry();
                Counters::add(&self.shared.counters.connects, 1);
                self.set_state(ConnectionState::Connected);

                if self.config.resync_settings_on_connect {
                    self.settings.send_all();
                }
                true
            }
            Err(e) => {
                debug!("display not available: {}", e);
                self.set_state(ConnectionState::Disconnected);
                false
            }
        }
    }

    fn disconnect(&mut self, reason: &str) {
        // Dropping the channel closes the port
        self.channel = None;
        self.lines.clear();
        self.line_dirty = false;
        self.consecutive_errors = 0;
        self.last_attempt = Some(Instant::now());
        info!(reason, "display disconnected");
        self.set_state(ConnectionState::Disconnected);
    }

    /// Count a transient failure, forcing a reconnect past the threshold
    fn record_error(&mut self, e: &io::Error) {
        self.consecutive_errors += 1;
        debug!(
            count = self.consecutive_errors,
            threshold = self.config.error_threshold,
            "transient link error: {}",
            e
        );
        if self.consecutive_errors > self.config.error_threshold {
            warn!(
                count = self.consecutive_errors,
                "too many consecutive link errors, reconnecting"
            );
            self.disconnect("error threshold exceeded");
        }
    }

    fn service_write(&mut self, now: Instant) -> bool {
        let Some(decision) = self.sender.next_write(now) else {
            return false;
        };

        let (payload, navigation) = match decision {
            WriteDecision::Navigation(msg) => (msg.encode(), Some(msg)),
            WriteDecision::Command(msg) => (msg.encode(), None),
            WriteDecision::Telemetry { include_tires } => (self.telemetry_frame(include_tires), None),
        };

        if let Err(e) = self.write_payload(payload.as_bytes()) {
            // A failed navigation write is retried unless something newer replaced it
            if let Some(msg) = navigation {
                self.sender.restore_navigation(msg);
            }
            if is_transient(&e) {
                self.record_error(&e);
            } else {
                warn!("write to display failed: {}", e);
                self.disconnect("write failed");
            }
        }
        true
    }

    fn write_payload(&mut self, payload: &[u8]) -> io::Result<()> {
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, LinkError::NotConnected))?;

        // Terminate whatever fragment the last failed write left behind so
        // the peer discards it instead of gluing it to this payload
        let mut frame = Vec::with_capacity(payload.len() + 1);
        if self.line_dirty {
            frame.push(b'\n');
        }
        frame.extend_from_slice(payload);

        // Part of the frame may already be on the wire when this fails
        self.line_dirty = true;
        channel.write_all(&frame)?;
        channel.flush()?;
        self.line_dirty = false;

        let counters = &self.shared.counters;
        Counters::add(&counters.tx_bytes, frame.len() as u64);
        Counters::add(
            &counters.tx_lines,
            payload.iter().filter(|b| **b == b'\n').count() as u64,
        );
        self.consecutive_errors = 0;
        Ok(())
    }

    /// Build the periodic frame from one consistent snapshot
    fn telemetry_frame(&self, include_tires: bool) -> String {
        let snapshot = self.telemetry.snapshot();
        let mut frame = OutboundMessage::Telemetry(TelemetryFrame::from(&snapshot)).encode();
        frame.push_str(&OutboundMessage::Diagnostics(DiagnosticFrame::from(&snapshot)).encode());
        if include_tires {
            frame.push_str(&OutboundMessage::TirePressure(snapshot.tire_pressure_psi).encode());
            frame.push_str(&OutboundMessage::TireTemperature(snapshot.tire_temp_c).encode());
            frame.push_str(&OutboundMessage::TireTime(snapshot.tire_updated).encode());
        }
        frame
    }

    fn service_read(&mut self) -> bool {
        let mut did_work = false;
        let mut buf = [0u8; READ_CHUNK_SIZE];

        for _ in 0..MAX_READS_PER_ITERATION {
            let Some(channel) = self.channel.as_mut() else {
                break;
            };

            let available = match channel.bytes_to_read() {
                Ok(n) => n as usize,
                Err(e) => {
                    warn!("failed to poll display channel: {}", e);
                    self.disconnect("poll failed");
                    return true;
                }
            };
            if available == 0 {
                break;
            }

            let to_read = available.min(buf.len());
            let result = channel.read(&mut buf[..to_read]);
            did_work = true;

            match result {
                Ok(0) => {
                    let e = io::Error::new(ErrorKind::UnexpectedEof, LinkError::ChannelClosed);
                    self.record_error(&e);
                }
                Ok(n) => {
                    Counters::add(&self.shared.counters.rx_bytes, n as u64);
                    self.consecutive_errors = 0;
                    let overflows = self.lines.overflow_count();
                    for line in self.lines.push(&buf[..n]) {
                        self.dispatch(&line);
                    }
                    let overflowed = self.lines.overflow_count() - overflows;
                    if overflowed > 0 {
                        Counters::add(&self.shared.counters.line_overflows, overflowed);
                        debug!(overflowed, "discarded over-long inbound line");
                    }
                }
                Err(e) if is_transient(&e) => self.record_error(&e),
                Err(e) => {
                    warn!("read from display failed: {}", e);
                    self.disconnect("read failed");
                }
            }
        }
        did_work
    }

    fn dispatch(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        Counters::add(&self.shared.counters.rx_lines, 1);

        match parse_line(line) {
            Ok(msg) => self.route(msg),
            Err(e) => {
                Counters::add(&self.shared.counters.decode_errors, 1);
                debug!(line, "discarding malformed line: {}", e);
            }
        }
    }

    fn route(&mut self, msg: InboundMessage) {
        match msg {
            InboundMessage::TpmsSensor {
                wheel,
                pressure_psi,
                temperature_c,
                battery_pct,
            } => {
                let Some(wheel) = Wheel::from_index(wheel) else {
                    return;
                };
                self.tpms
                    .update(wheel, pressure_psi, temperature_c, battery_pct);
                let tpms = &self.tpms;
                self.telemetry.update(|t| tpms.mirror_wheel(wheel, t));
            }
            InboundMessage::TpmsPressures(values) => {
                self.telemetry.update(|t| {
                    t.tire_pressure_psi = values.map(Some);
                    t.tire_live = [true; WHEEL_COUNT];
                });
            }
            InboundMessage::TpmsTemperatures(values) => {
                self.telemetry.update(|t| t.tire_temp_c = values.map(Some));
            }
            InboundMessage::Imu(reading) => {
                self.telemetry.update(|t| {
                    t.imu.accel_x = reading.accel_x;
                    t.imu.accel_y = reading.accel_y;
                    if reading.motion.is_some() {
                        t.imu.motion = reading.motion;
                    }
                });
            }
            InboundMessage::ScreenChanged(screen) => {
                self.telemetry.update(|t| t.current_screen = screen);
                self.listener.on_screen_changed(screen);
            }
            InboundMessage::SettingChanged { name, value } => {
                if let Some(v) = self.settings.apply_remote(&name, &value) {
                    self.listener.on_setting_changed(&name, &v);
                }
            }
            InboundMessage::SelectionChanged(index) => {
                self.listener.on_selection_changed(index);
            }
            InboundMessage::SettingsSync(pairs) => {
                let table = self.settings.apply_bulk(&pairs);
                self.listener.on_settings_synced(&table);
            }
            InboundMessage::Ack(ack) => {
                Counters::add(&self.shared.counters.acks, 1);
                debug!(?ack, "display acknowledged");
            }
            InboundMessage::Diagnostic(text) => {
                debug!(target: "dashlink::peer", "{}", text);
            }
            InboundMessage::Unrecognized(line) => {
                debug!(line, "ignoring unrecognized line");
            }
        }
    }
}

/// Reconnecting link to the display
pub struct SerialLink {
    config: LinkConfig,
    shared: Arc<LinkShared>,
    sender: LinkSender,
    /// Worker state while no thread is running
    idle: Mutex<Option<Worker>>,
    handle: Mutex<Option<JoinHandle<Worker>>>,
    /// Worker that missed the join timeout and is still winding down
    detached: Mutex<Option<JoinHandle<Worker>>>,
}

impl SerialLink {
    /// Create a link over the configured serial port (not yet started)
    pub fn new(
        config: LinkConfig,
        sender: LinkSender,
        telemetry: SharedTelemetry,
        tpms: TpmsCache,
        settings: Arc<SettingsSync>,
        listener: Arc<dyn LinkListener>,
    ) -> Self {
        let opener = SerialOpener::new(
            config.port_name.clone(),
            config.baud_rate,
            Duration::from_millis(config.read_timeout_ms),
        );
        Self::with_opener(
            config,
            Box::new(opener),
            sender,
            telemetry,
            tpms,
            settings,
            listener,
        )
    }

    /// Create a link over a custom channel source
    pub fn with_opener(
        config: LinkConfig,
        opener: Box<dyn ChannelOpener>,
        sender: LinkSender,
        telemetry: SharedTelemetry,
        tpms: TpmsCache,
        settings: Arc<SettingsSync>,
        listener: Arc<dyn LinkListener>,
    ) -> Self {
        // Last-known tire data is shown until sensors report again
        telemetry.update(|t| tpms.mirror_all(t));

        let shared = Arc::new(LinkShared {
            state: Mutex::new(ConnectionState::Disconnected),
            stop: AtomicBool::new(false),
            counters: Counters::default(),
        });
        let worker = Worker {
            config: config.clone(),
            opener,
            channel: None,
            shared: shared.clone(),
            sender: sender.clone(),
            telemetry,
            tpms,
            settings,
            listener,
            lines: LineBuffer::default(),
            line_dirty: false,
            consecutive_errors: 0,
            last_attempt: None,
        };

        Self {
            config,
            shared,
            sender,
            idle: Mutex::new(Some(worker)),
            handle: Mutex::new(None),
            detached: Mutex::new(None),
        }
    }

    /// Spawn the worker and return immediately
    ///
    /// Succeeds whether or not the display is present. Fails with
    /// [`LinkError::Stopping`] while a worker detached by [`stop`](Self::stop)
    /// is still winding down.
    pub fn start(&self) -> Result<(), LinkError> {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            return Err(LinkError::AlreadyRunning);
        }
        let worker = match self.idle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(worker) => worker,
            None => self.reclaim_detached()?,
        };

        self.shared.stop.store(false, Ordering::Release);
        let spawned = thread::Builder::new()
            .name("dashlink-link".into())
            .spawn(move || worker.run())?;
        *handle = Some(spawned);
        Ok(())
    }

    fn reclaim_detached(&self) -> Result<Worker, LinkError> {
        let mut detached = self.detached.lock().unwrap_or_else(|e| e.into_inner());
        match detached.take() {
            Some(h) if h.is_finished() => h.join().map_err(|_| {
                error!("link worker panicked");
                LinkError::WorkerLost
            }),
            Some(h) => {
                *detached = Some(h);
                Err(LinkError::Stopping)
            }
            None => Err(LinkError::WorkerLost),
        }
    }

    /// Stop the worker, close the channel and join within the configured timeout
    ///
    /// Returns after at most `join_timeout_ms` even if the worker is stuck
    /// (e.g. in a slow port open). Such a worker is detached; it exits at
    /// its next loop check and can be restarted once it has.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };

        let deadline = Instant::now() + Duration::from_millis(self.config.join_timeout_ms);
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        if !handle.is_finished() {
            warn!(
                timeout_ms = self.config.join_timeout_ms,
                "link worker did not stop in time, detaching"
            );
            *self.detached.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            return;
        }
        match handle.join() {
            Ok(worker) => {
                *self.idle.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker);
            }
            Err(_) => error!("link worker panicked"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Queue a message; see [`LinkSender::send`]
    pub fn send(&self, msg: OutboundMessage) {
        self.sender.send(msg);
    }

    pub fn sender(&self) -> LinkSender {
        self.sender.clone()
    }

    pub fn stats(&self) -> LinkStats {
        let c = &self.shared.counters;
        LinkStats {
            tx_bytes: c.tx_bytes.load(Ordering::Relaxed),
            rx_bytes: c.rx_bytes.load(Ordering::Relaxed),
            tx_lines: c.tx_lines.load(Ordering::Relaxed),
            rx_lines: c.rx_lines.load(Ordering::Relaxed),
            acks: c.acks.load(Ordering::Relaxed),
            connects: c.connects.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            line_overflows: c.line_overflows.load(Ordering::Relaxed),
            superseded_navigation: self.sender.superseded_count(),
            dropped_commands: self.sender.dropped_count(),
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::channel::LinkChannel;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Wire {
        inbound: VecDeque<u8>,
        written: Vec<u8>,
        write_error: Option<ErrorKind>,
        /// Bytes the wire takes before timing out, unlimited when `None`
        accept_limit: Option<usize>,
        present: bool,
        opens: u32,
    }

    #[derive(Clone, Default)]
    struct MockWire(Arc<Mutex<Wire>>);

    impl MockWire {
        fn present() -> Self {
            let wire = Self::default();
            wire.0.lock().unwrap().present = true;
            wire
        }

        fn feed(&self, text: &str) {
            self.0.lock().unwrap().inbound.extend(text.bytes());
        }

        fn written(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().written.clone()).unwrap()
        }

        fn clear_written(&self) {
            self.0.lock().unwrap().written.clear();
        }
    }

    struct MockChannel(MockWire);

    impl Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut wire = (self.0).0.lock().unwrap();
            let n = buf.len().min(wire.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = wire.inbound.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut wire = (self.0).0.lock().unwrap();
            if let Some(kind) = wire.write_error {
                return Err(io::Error::new(kind, "mock write failure"));
            }
            let n = match wire.accept_limit {
                Some(0) => return Err(io::Error::new(ErrorKind::TimedOut, "mock stall")),
                Some(limit) => {
                    let n = buf.len().min(limit);
                    wire.accept_limit = Some(limit - n);
                    n
                }
                None => buf.len(),
            };
            wire.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LinkChannel for MockChannel {
        fn clear_input_buffer(&mut self) -> io::Result<()> {
            (self.0).0.lock().unwrap().inbound.clear();
            Ok(())
        }

        fn bytes_to_read(&mut self) -> io::Result<u32> {
            Ok((self.0).0.lock().unwrap().inbound.len() as u32)
        }

        fn name(&self) -> String {
            "mock".into()
        }
    }

    impl ChannelOpener for MockWire {
        fn open(&mut self) -> Result<Box<dyn LinkChannel>, LinkError> {
            let mut wire = self.0.lock().unwrap();
            wire.opens += 1;
            if !wire.present {
                return Err(LinkError::NoPortFound);
            }
            Ok(Box::new(MockChannel(self.clone())))
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl LinkListener for Recorder {
        fn on_screen_changed(&self, screen: u8) {
            self.events.lock().unwrap().push(format!("screen {}", screen));
        }

        fn on_setting_changed(&self, name: &str, value: &SettingValue) {
            self.events
                .lock()
                .unwrap()
                .push(format!("setting {}={}", name, value));
        }

        fn on_settings_synced(&self, settings: &BTreeMap<String, SettingValue>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("synced {}", settings.len()));
        }

        fn on_selection_changed(&self, index: u8) {
            self.events.lock().unwrap().push(format!("selection {}", index));
        }

        fn on_connection_changed(&self, state: ConnectionState) {
            self.events.lock().unwrap().push(format!("{:?}", state));
        }
    }

    fn config() -> LinkConfig {
        LinkConfig {
            error_threshold: 3,
            resync_settings_on_connect: false,
            ..LinkConfig::default()
        }
    }

    fn worker(wire: &MockWire, config: LinkConfig) -> (Worker, Arc<Recorder>) {
        let sender = LinkSender::new(&config);
        let settings = Arc::new(SettingsSync::new(sender.clone()));
        let recorder = Arc::new(Recorder::default());
        let shared = Arc::new(LinkShared {
            state: Mutex::new(ConnectionState::Disconnected),
            stop: AtomicBool::new(false),
            counters: Counters::default(),
        });
        let worker = Worker {
            config,
            opener: Box::new(wire.clone()),
            channel: None,
            shared,
            sender,
            telemetry: SharedTelemetry::new(),
            tpms: TpmsCache::in_memory(),
            settings,
            listener: recorder.clone(),
            lines: LineBuffer::default(),
            line_dirty: false,
            consecutive_errors: 0,
            last_attempt: None,
        };
        (worker, recorder)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_absent_peer_retries_on_interval() {
        let wire = MockWire::default();
        let (mut w, _) = worker(&wire, config());
        let t0 = Instant::now();

        assert!(!w.iterate(t0));
        assert!(!w.iterate(t0 + ms(500)));
        assert!(!w.iterate(t0 + ms(1999)));
        assert_eq!(wire.0.lock().unwrap().opens, 1);

        assert!(!w.iterate(t0 + ms(2000)));
        assert_eq!(wire.0.lock().unwrap().opens, 2);
        assert_eq!(w.shared.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connect_clears_stale_input_and_sends_frame() {
        let wire = MockWire::present();
        wire.feed("SCREEN_CHANGED:9\n");
        let (mut w, recorder) = worker(&wire, config());

        assert!(w.iterate(Instant::now()));
        assert_eq!(w.shared.state(), ConnectionState::Connected);
        // Stale line from before the connect was discarded
        assert!(!recorder
            .events
            .lock()
            .unwrap()
            .contains(&"screen 9".to_string()));

        let out = wire.written();
        assert!(out.starts_with("TEL:"));
        assert!(out.contains("\nDIAG:"));
        assert!(out.contains("\nTIRE:-,-,-,-\n"));
        assert!(out.contains("TIRE_TIME:--:--,--:--,--:--,--:--\n"));
    }

    #[test]
    fn test_error_threshold_forces_reconnect_within_one_iteration() {
        let wire = MockWire::present();
        let (mut w, _) = worker(&wire, config());
        let t0 = Instant::now();
        assert!(w.iterate(t0));
        assert!(w.channel.is_some());

        wire.0.lock().unwrap().write_error = Some(ErrorKind::TimedOut);
        // Threshold 3: errors 1..=3 are tolerated
        for i in 1..=3u64 {
            w.iterate(t0 + ms(100 * i));
            assert_eq!(w.shared.state(), ConnectionState::Connected);
            assert_eq!(w.consecutive_errors, i as u32);
        }
        w.iterate(t0 + ms(400));
        assert_eq!(w.shared.state(), ConnectionState::Disconnected);
        assert!(w.channel.is_none());
    }

    #[test]
    fn test_hard_write_failure_disconnects_immediately() {
        let wire = MockWire::present();
        let (mut w, recorder) = worker(&wire, config());
        let t0 = Instant::now();
        w.iterate(t0);

        wire.0.lock().unwrap().write_error = Some(ErrorKind::BrokenPipe);
        w.iterate(t0 + ms(100));
        assert_eq!(w.shared.state(), ConnectionState::Disconnected);

        // Recovery after the retry interval
        wire.0.lock().unwrap().write_error = None;
        assert!(!w.iterate(t0 + ms(200)));
        let later = Instant::now() + ms(2100);
        assert!(w.iterate(later));
        assert_eq!(w.shared.state(), ConnectionState::Connected);

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "Connecting",
                "Connected",
                "Disconnected",
                "Connecting",
                "Connected"
            ]
        );
    }

    #[test]
    fn test_failed_navigation_write_is_retried() {
        let wire = MockWire::present();
        let (mut w, _) = worker(&wire, config());
        let t0 = Instant::now();
        w.iterate(t0);
        wire.clear_written();

        w.sender.send(OutboundMessage::Screen(4));
        wire.0.lock().unwrap().write_error = Some(ErrorKind::TimedOut);
        w.iterate(t0 + ms(100));
        assert!(w.sender.has_pending_navigation());

        wire.0.lock().unwrap().write_error = None;
        w.iterate(t0 + ms(200));
        assert_eq!(wire.written(), "SCREEN:4\n");
    }

    #[test]
    fn test_partial_write_is_terminated_before_next_line() {
        let wire = MockWire::present();
        wire.0.lock().unwrap().accept_limit = Some(6);
        let (mut w, _) = worker(&wire, config());
        let t0 = Instant::now();

        // Connect frame stalls after six bytes
        w.iterate(t0);
        assert_eq!(w.shared.state(), ConnectionState::Connected);
        assert_eq!(wire.written().len(), 6);

        wire.0.lock().unwrap().accept_limit = None;
        w.sender.send(OutboundMessage::Screen(4));
        w.iterate(t0 + ms(10));

        let out = wire.written();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), 6);
        assert!(lines[0].starts_with("TEL:"));
        assert_eq!(lines[1], "SCREEN:4");
        assert_eq!(w.consecutive_errors, 0);

        // Clean writes carry no separator
        wire.clear_written();
        w.sender.send(OutboundMessage::Screen(5));
        w.iterate(t0 + ms(1000));
        assert!(wire.written().starts_with("SCREEN:5\n"));
    }

    #[test]
    fn test_overlong_inbound_line_is_counted() {
        let wire = MockWire::present();
        let (mut w, recorder) = worker(&wire, config());
        let t0 = Instant::now();
        w.iterate(t0);

        wire.feed(&"x".repeat(600));
        wire.feed("\nSCREEN_CHANGED:3\n");
        // Each iteration reads a bounded number of chunks
        w.iterate(t0 + ms(10));
        w.iterate(t0 + ms(20));

        assert_eq!(w.shared.counters.line_overflows.load(Ordering::Relaxed), 1);
        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events.last().map(String::as_str), Some("screen 3"));
    }

    #[test]
    fn test_inbound_routing() {
        let wire = MockWire::present();
        let (mut w, recorder) = worker(&wire, config());
        let t0 = Instant::now();
        w.iterate(t0);

        wire.feed(concat!(
            "TPMS:1,33.5,24.0,90\n",
            "TPMS_TEMP:20,21,22,23\n",
            "IMU:0.25,-0.5\n",
            "SCREEN_CHANGED:2\n",
            "SETTING:brightness=35\n",
            "SELECTION:5\n",
            "SETTINGS:use_mph=0,shift_rpm=6000\n",
            "OK:SCREEN_2\n",
            "DEBUG:boot ok\n",
            "WHAT:is this\n",
            "TPMS:9,1,1,1\n",
        ));
        w.iterate(t0 + ms(10));

        let t = w.telemetry.snapshot();
        assert_eq!(t.tire_pressure_psi[1], Some(33.5));
        assert_eq!(t.tire_battery_pct[1], Some(90));
        assert_eq!(t.tire_pressure_psi[0], None);
        assert_eq!(t.tire_temp_c, [Some(20.0), Some(21.0), Some(22.0), Some(23.0)]);
        assert_eq!(t.imu.accel_x, 0.25);
        assert_eq!(t.current_screen, 2);
        assert_eq!(w.tpms.wheel(Wheel::FrontRight).pressure_psi, Some(33.5));
        assert_eq!(w.settings.get("shift_rpm"), Some(SettingValue::Int(6000)));

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(
            &events[2..],
            &[
                "screen 2".to_string(),
                "setting brightness=35".to_string(),
                "selection 5".to_string(),
                "synced 10".to_string(),
            ]
        );

        let c = &w.shared.counters;
        assert_eq!(c.rx_lines.load(Ordering::Relaxed), 11);
        assert_eq!(c.acks.load(Ordering::Relaxed), 1);
        assert_eq!(c.decode_errors.load(Ordering::Relaxed), 1);
        assert_eq!(t.tire_live, [false, true, false, false]);
    }

    #[test]
    fn test_resync_settings_on_connect() {
        let wire = MockWire::present();
        let cfg = LinkConfig {
            resync_settings_on_connect: true,
            ..config()
        };
        let (mut w, _) = worker(&wire, cfg);
        let t0 = Instant::now();
        w.iterate(t0);
        w.iterate(t0 + ms(1));
        assert!(wire.written().contains("SET:"));
    }
}
