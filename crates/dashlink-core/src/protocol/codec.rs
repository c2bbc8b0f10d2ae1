//! Line protocol codec
//!
//! Every message is one ASCII line, `PREFIX:payload\n`. Inbound lines are
//! framed by [`LineBuffer`] and decoded with [`parse_line`]; outbound
//! messages are encoded with [`OutboundMessage::encode`].
//!
//! Outbound numbers use fixed precision so frame sizes stay bounded and
//! the output never depends on the host locale. Unknown values are sent as
//! `-` so the field count of a frame never changes.

use super::error::CodecError;
use crate::telemetry::{ImuMotion, ImuReading, TelemetrySnapshot, WHEEL_COUNT};

/// Longest inbound line accepted before the buffer is discarded
pub const MAX_LINE_LEN: usize = 512;

const UNKNOWN: &str = "-";
const UNKNOWN_TIME: &str = "--:--";

// Inbound prefixes
const TPMS: &str = "TPMS:";
const TPMS_PSI: &str = "TPMS_PSI:";
const TPMS_TEMP: &str = "TPMS_TEMP:";
const IMU: &str = "IMU:";
const SCREEN_CHANGED: &str = "SCREEN_CHANGED:";
const SETTING: &str = "SETTING:";
const SETTINGS: &str = "SETTINGS:";
const SELECTION: &str = "SELECTION:";
const ACK: &str = "OK:";
const DEBUG: &str = "DEBUG:";

/// A decoded inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Single wireless sensor report
    TpmsSensor {
        wheel: usize,
        pressure_psi: f32,
        temperature_c: f32,
        battery_pct: u8,
    },
    /// Pressures for all four wheels (FL, FR, RL, RR)
    TpmsPressures([f32; WHEEL_COUNT]),
    /// Temperatures for all four wheels in Celsius
    TpmsTemperatures([f32; WHEEL_COUNT]),
    Imu(ImuReading),
    ScreenChanged(u8),
    SettingChanged { name: String, value: String },
    SelectionChanged(u8),
    SettingsSync(Vec<(String, String)>),
    Ack(Acknowledgement),
    /// Free-form debug output from the display firmware
    Diagnostic(String),
    /// Line with no known prefix
    Unrecognized(String),
}

/// Acknowledgement of a command previously sent to the display
#[derive(Debug, Clone, PartialEq)]
pub enum Acknowledgement {
    Screen(u8),
    Setting(String),
    Other(String),
}

/// Decode one line (without its terminator)
///
/// Unknown prefixes are not an error; they decode to
/// [`InboundMessage::Unrecognized`]. Known prefixes with a bad payload are.
pub fn parse_line(line: &str) -> Result<InboundMessage, CodecError> {
    let line = line.trim();

    // Longer prefixes first where one could shadow another
    if let Some(payload) = line.strip_prefix(TPMS_PSI) {
        return Ok(InboundMessage::TpmsPressures(parse_quad(TPMS_PSI, payload)?));
    }
    if let Some(payload) = line.strip_prefix(TPMS_TEMP) {
        return Ok(InboundMessage::TpmsTemperatures(parse_quad(TPMS_TEMP, payload)?));
    }
    if let Some(payload) = line.strip_prefix(TPMS) {
        return parse_tpms_sensor(payload);
    }
    if let Some(payload) = line.strip_prefix(IMU) {
        return parse_imu(payload).map(InboundMessage::Imu);
    }
    if let Some(payload) = line.strip_prefix(SCREEN_CHANGED) {
        return parse_number(SCREEN_CHANGED, payload).map(InboundMessage::ScreenChanged);
    }
    if let Some(payload) = line.strip_prefix(SETTINGS) {
        return parse_pairs(payload).map(InboundMessage::SettingsSync);
    }
    if let Some(payload) = line.strip_prefix(SETTING) {
        let (name, value) = parse_pair(payload)?;
        return Ok(InboundMessage::SettingChanged { name, value });
    }
    if let Some(payload) = line.strip_prefix(SELECTION) {
        return parse_number(SELECTION, payload).map(InboundMessage::SelectionChanged);
    }
    if let Some(payload) = line.strip_prefix(ACK) {
        return Ok(InboundMessage::Ack(parse_ack(payload)));
    }
    if let Some(payload) = line.strip_prefix(DEBUG) {
        return Ok(InboundMessage::Diagnostic(payload.trim().to_string()));
    }

    Ok(InboundMessage::Unrecognized(line.to_string()))
}

fn fields(payload: &str) -> Vec<&str> {
    payload.split(',').map(str::trim).collect()
}

fn parse_number<T: std::str::FromStr>(prefix: &'static str, value: &str) -> Result<T, CodecError> {
    value
        .trim()
        .parse()
        .map_err(|_| CodecError::InvalidNumber {
            prefix,
            value: value.trim().to_string(),
        })
}

fn parse_finite(prefix: &'static str, value: &str) -> Result<f32, CodecError> {
    let v: f32 = parse_number(prefix, value)?;
    if v.is_finite() {
        Ok(v)
    } else {
        Err(CodecError::InvalidNumber {
            prefix,
            value: value.to_string(),
        })
    }
}

fn parse_quad(prefix: &'static str, payload: &str) -> Result<[f32; WHEEL_COUNT], CodecError> {
    let parts = fields(payload);
    if parts.len() != WHEEL_COUNT {
        return Err(CodecError::FieldCount {
            prefix,
            expected: WHEEL_COUNT,
            actual: parts.len(),
        });
    }
    let mut out = [0.0; WHEEL_COUNT];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = parse_finite(prefix, part)?;
    }
    Ok(out)
}

fn parse_tpms_sensor(payload: &str) -> Result<InboundMessage, CodecError> {
    let parts = fields(payload);
    if parts.len() != 4 {
        return Err(CodecError::FieldCount {
            prefix: TPMS,
            expected: 4,
            actual: parts.len(),
        });
    }
    let wheel: usize = parse_number(TPMS, parts[0])?;
    if wheel >= WHEEL_COUNT {
        return Err(CodecError::WheelOutOfRange(wheel));
    }
    // Battery may arrive as "87" or "87.0"
    let battery = parse_finite(TPMS, parts[3])?.clamp(0.0, 100.0).round() as u8;
    Ok(InboundMessage::TpmsSensor {
        wheel,
        pressure_psi: parse_finite(TPMS, parts[1])?,
        temperature_c: parse_finite(TPMS, parts[2])?,
        battery_pct: battery,
    })
}

fn parse_imu(payload: &str) -> Result<ImuReading, CodecError> {
    let parts = fields(payload);
    let values = parts
        .iter()
        .map(|p| parse_finite(IMU, p))
        .collect::<Result<Vec<f32>, _>>()?;

    match values.as_slice() {
        [x, y] => Ok(ImuReading {
            accel_x: *x,
            accel_y: *y,
            motion: None,
        }),
        [x, y, z, gx, gy, gz, lx, ly, pitch, roll] => Ok(ImuReading {
            accel_x: *x,
            accel_y: *y,
            motion: Some(ImuMotion {
                accel_z: *z,
                gyro_x: *gx,
                gyro_y: *gy,
                gyro_z: *gz,
                lin_accel_x: *lx,
                lin_accel_y: *ly,
                pitch: *pitch,
                roll: *roll,
            }),
        }),
        _ => Err(CodecError::FieldCount {
            prefix: IMU,
            expected: if values.len() < 2 { 2 } else { 10 },
            actual: values.len(),
        }),
    }
}

fn parse_pair(segment: &str) -> Result<(String, String), CodecError> {
    match segment.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(CodecError::MalformedPair(segment.trim().to_string())),
    }
}

fn parse_pairs(payload: &str) -> Result<Vec<(String, String)>, CodecError> {
    payload
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(parse_pair)
        .collect()
}

fn parse_ack(payload: &str) -> Acknowledgement {
    let payload = payload.trim();
    if let Some(n) = payload.strip_prefix("SCREEN_") {
        if let Ok(screen) = n.parse() {
            return Acknowledgement::Screen(screen);
        }
    }
    if let Some(rest) = payload.strip_prefix("SET:") {
        return Acknowledgement::Setting(rest.to_string());
    }
    Acknowledgement::Other(payload.to_string())
}

/// Accumulates raw bytes and yields complete lines
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    max_len: usize,
    /// Currently skipping the remainder of an over-long line
    discarding: bool,
    overflows: u64,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(MAX_LINE_LEN)
    }
}

impl LineBuffer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_len.min(1024)),
            max_len,
            discarding: false,
            overflows: 0,
        }
    }

    /// Feed bytes, returning every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                if self.discarding {
                    self.discarding = false;
                } else {
                    if self.buf.last() == Some(&b'\r') {
                        self.buf.pop();
                    }
                    lines.push(String::from_utf8_lossy(&self.buf).into_owned());
                }
                self.buf.clear();
            } else if self.discarding {
                continue;
            } else if self.buf.len() >= self.max_len {
                self.buf.clear();
                self.discarding = true;
                self.overflows += 1;
            } else {
                self.buf.push(b);
            }
        }
        lines
    }

    /// Drop any partial line (after reconnect)
    pub fn clear(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }

    /// Number of lines dropped for exceeding the length limit
    pub fn overflow_count(&self) -> u64 {
        self.overflows
    }
}

/// Core driving values sent every telemetry tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryFrame {
    pub rpm: u16,
    pub speed_mph: f32,
    pub gear: i8,
    pub throttle_pct: f32,
    pub coolant_temp_f: f32,
    pub oil_ok: bool,
    pub fuel_pct: Option<f32>,
    pub engine_on: bool,
    pub gear_estimated: bool,
    pub clutch: bool,
}

impl From<&TelemetrySnapshot> for TelemetryFrame {
    fn from(t: &TelemetrySnapshot) -> Self {
        Self {
            rpm: t.rpm,
            speed_mph: t.speed_mph,
            gear: t.gear,
            throttle_pct: t.throttle_pct,
            coolant_temp_f: t.coolant_temp_f,
            oil_ok: t.oil_pressure_ok,
            fuel_pct: t.display_fuel(),
            engine_on: t.engine_running,
            gear_estimated: t.gear_estimated,
            clutch: t.clutch_pressed,
        }
    }
}

/// Warning lamps and light states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticFrame {
    pub check_engine: bool,
    pub abs: bool,
    pub oil_warning: bool,
    pub battery_warning: bool,
    pub headlights: bool,
    pub high_beams: bool,
}

impl From<&TelemetrySnapshot> for DiagnosticFrame {
    fn from(t: &TelemetrySnapshot) -> Self {
        Self {
            check_engine: t.check_engine,
            abs: t.abs_warning,
            oil_warning: t.oil_warning,
            battery_warning: t.battery_warning,
            headlights: t.headlights,
            high_beams: t.high_beams,
        }
    }
}

/// A message the bridge sends to the display
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Telemetry(TelemetryFrame),
    Diagnostics(DiagnosticFrame),
    TirePressure([Option<f32>; WHEEL_COUNT]),
    TireTemperature([Option<f32>; WHEEL_COUNT]),
    TireTime([Option<String>; WHEEL_COUNT]),
    /// Switch the display to a screen
    Screen(u8),
    /// Steering wheel control button press
    SteeringButton(String),
    Setting { name: String, value: String },
    /// Move the menu selection highlight
    Selection(u8),
    /// Lock or unlock on-display navigation
    NavLock(bool),
    CalibrateImu,
    GetSettings,
}

impl OutboundMessage {
    /// Steering wheel button, rejecting names that would break framing
    pub fn steering_button(name: impl Into<String>) -> Result<Self, CodecError> {
        Ok(OutboundMessage::SteeringButton(checked_token(name.into())?))
    }

    /// Setting write, rejecting names or values that would break framing
    pub fn setting(
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, CodecError> {
        Ok(OutboundMessage::Setting {
            name: checked_token(name.into())?,
            value: checked_token(value.into())?,
        })
    }

    /// Navigation commands are coalesced latest-wins by the scheduler
    pub fn is_navigation(&self) -> bool {
        matches!(self, OutboundMessage::Screen(_) | OutboundMessage::Selection(_))
    }

    /// Encode as a terminated ASCII line
    pub fn encode(&self) -> String {
        match self {
            OutboundMessage::Telemetry(f) => format!(
                "TEL:{},{},{},{},{},{},{},{},{},{}\n",
                f.rpm,
                whole(f.speed_mph),
                f.gear,
                whole(f.throttle_pct),
                whole(f.coolant_temp_f),
                flag(f.oil_ok),
                tenths(f.fuel_pct),
                flag(f.engine_on),
                flag(f.gear_estimated),
                flag(f.clutch),
            ),
            OutboundMessage::Diagnostics(d) => format!(
                "DIAG:{},{},{},{},{},{}\n",
                flag(d.check_engine),
                flag(d.abs),
                flag(d.oil_warning),
                flag(d.battery_warning),
                flag(d.headlights),
                flag(d.high_beams),
            ),
            OutboundMessage::TirePressure(values) => {
                format!("TIRE:{}\n", join_quad(values.iter().map(|v| tenths(*v))))
            }
            OutboundMessage::TireTemperature(values) => {
                format!("TIRE_TEMP:{}\n", join_quad(values.iter().map(|v| tenths(*v))))
            }
            OutboundMessage::TireTime(values) => format!(
                "TIRE_TIME:{}\n",
                join_quad(
                    values
                        .iter()
                        .map(|v| v.clone().unwrap_or_else(|| UNKNOWN_TIME.to_string()))
                )
            ),
            OutboundMessage::Screen(n) => format!("SCREEN:{}\n", n),
            OutboundMessage::SteeringButton(name) => format!("SWC:{}\n", strip_reserved(name)),
            OutboundMessage::Setting { name, value } => format!(
                "SET:{}={}\n",
                strip_reserved(name),
                strip_reserved(value)
            ),
            OutboundMessage::Selection(idx) => format!("SELECTION:{}\n", idx),
            OutboundMessage::NavLock(locked) => format!("NAVLOCK:{}\n", flag(*locked)),
            OutboundMessage::CalibrateImu => "CAL_IMU\n".to_string(),
            OutboundMessage::GetSettings => "GET_SETTINGS\n".to_string(),
        }
    }
}

/// Characters that delimit lines, fields or key=value pairs on the wire
const RESERVED: [char; 4] = ['\r', '\n', ',', '='];

fn checked_token(token: String) -> Result<String, CodecError> {
    if token.contains(RESERVED) {
        return Err(CodecError::InvalidToken(token));
    }
    Ok(token)
}

// Variants built directly bypass the checked constructors
fn strip_reserved(token: &str) -> String {
    token.replace(RESERVED, "")
}

fn flag(b: bool) -> u8 {
    u8::from(b)
}

fn whole(v: f32) -> i32 {
    if v.is_finite() {
        v.round() as i32
    } else {
        0
    }
}

fn tenths(v: Option<f32>) -> String {
    match v {
        Some(v) if v.is_finite() => format!("{:.1}", v),
        _ => UNKNOWN.to_string(),
    }
}

fn join_quad(items: impl Iterator<Item = String>) -> String {
    items.collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_tpms_sensor() {
        let msg = parse_line("TPMS:2,32.5,28.0,87").unwrap();
        assert_eq!(
            msg,
            InboundMessage::TpmsSensor {
                wheel: 2,
                pressure_psi: 32.5,
                temperature_c: 28.0,
                battery_pct: 87,
            }
        );
    }

    #[test]
    fn test_parse_tpms_rejects_bad_wheel() {
        assert_eq!(
            parse_line("TPMS:4,32.5,28.0,87"),
            Err(CodecError::WheelOutOfRange(4))
        );
    }

    #[test]
    fn test_parse_quad_prefixes_not_shadowed() {
        assert_eq!(
            parse_line("TPMS_PSI:32.0,32.5,31.0,30.5").unwrap(),
            InboundMessage::TpmsPressures([32.0, 32.5, 31.0, 30.5])
        );
        assert_eq!(
            parse_line("TPMS_TEMP:20,21,22,23\r").unwrap(),
            InboundMessage::TpmsTemperatures([20.0, 21.0, 22.0, 23.0])
        );
        assert!(matches!(
            parse_line("TPMS_PSI:1,2,3"),
            Err(CodecError::FieldCount { expected: 4, actual: 3, .. })
        ));
    }

    #[test]
    fn test_parse_imu_short_and_long() {
        let short = parse_line("IMU:0.12,-0.40").unwrap();
        assert_eq!(
            short,
            InboundMessage::Imu(ImuReading {
                accel_x: 0.12,
                accel_y: -0.40,
                motion: None,
            })
        );

        let long = parse_line("IMU:0.1,0.2,1.0,0.5,0.6,0.7,0.01,0.02,3.5,-1.25").unwrap();
        match long {
            InboundMessage::Imu(r) => {
                let m = r.motion.unwrap();
                assert_eq!(m.pitch, 3.5);
                assert_eq!(m.roll, -1.25);
            }
            other => panic!("Expected IMU, got {:?}", other),
        }

        assert!(parse_line("IMU:0.1,0.2,0.3").is_err());
    }

    #[test]
    fn test_parse_setting_vs_settings() {
        assert_eq!(
            parse_line("SETTING:brightness=80").unwrap(),
            InboundMessage::SettingChanged {
                name: "brightness".into(),
                value: "80".into(),
            }
        );
        assert_eq!(
            parse_line("SETTINGS:brightness=80,use_mph=1").unwrap(),
            InboundMessage::SettingsSync(vec![
                ("brightness".into(), "80".into()),
                ("use_mph".into(), "1".into()),
            ])
        );
        assert!(parse_line("SETTING:novalue").is_err());
    }

    #[test]
    fn test_parse_acks_and_passthrough() {
        assert_eq!(
            parse_line("OK:SCREEN_3").unwrap(),
            InboundMessage::Ack(Acknowledgement::Screen(3))
        );
        assert_eq!(
            parse_line("OK:SET:brightness=80").unwrap(),
            InboundMessage::Ack(Acknowledgement::Setting("brightness=80".into()))
        );
        assert_eq!(
            parse_line("DEBUG: heap 40k").unwrap(),
            InboundMessage::Diagnostic("heap 40k".into())
        );
        assert_eq!(
            parse_line("garbage").unwrap(),
            InboundMessage::Unrecognized("garbage".into())
        );
    }

    #[test]
    fn test_line_buffer_splits_partial_reads() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"SCREEN_CHAN").is_empty());
        let lines = buf.push(b"GED:2\r\nSELECTION:1\nTP");
        assert_eq!(lines, vec!["SCREEN_CHANGED:2", "SELECTION:1"]);
        assert_eq!(buf.push(b"MS:0,1,2,3\n"), vec!["TPMS:0,1,2,3"]);
    }

    #[test]
    fn test_line_buffer_discards_overlong_line() {
        let mut buf = LineBuffer::new(8);
        let lines = buf.push(b"0123456789ABCDEF\nOK:X\n");
        assert_eq!(lines, vec!["OK:X"]);
        assert_eq!(buf.overflow_count(), 1);
    }

    #[test]
    fn test_encode_telemetry_fixed_format() {
        let snap = TelemetrySnapshot {
            rpm: 3150,
            speed_mph: 44.6,
            gear: 4,
            throttle_pct: 22.4,
            coolant_temp_f: 195.2,
            oil_pressure_ok: true,
            fuel_pct: Some(49.96),
            engine_running: true,
            ..Default::default()
        };
        let line = OutboundMessage::Telemetry(TelemetryFrame::from(&snap)).encode();
        assert_eq!(line, "TEL:3150,45,4,22,195,1,50.0,1,0,0\n");
    }

    #[test]
    fn test_encode_unknown_fuel_keeps_field_count() {
        let line = OutboundMessage::Telemetry(TelemetryFrame::from(&TelemetrySnapshot::default()))
            .encode();
        assert_eq!(line.trim_end().split(',').count(), 10);
        assert!(line.contains(",-,"));
    }

    #[test]
    fn test_encode_tires_and_commands() {
        assert_eq!(
            OutboundMessage::TirePressure([Some(32.04), None, Some(30.0), Some(29.95)]).encode(),
            "TIRE:32.0,-,30.0,30.0\n"
        );
        assert_eq!(
            OutboundMessage::TireTime([Some("08:15".into()), None, None, None]).encode(),
            "TIRE_TIME:08:15,--:--,--:--,--:--\n"
        );
        assert_eq!(
            OutboundMessage::Diagnostics(DiagnosticFrame {
                check_engine: true,
                high_beams: true,
                ..Default::default()
            })
            .encode(),
            "DIAG:1,0,0,0,0,1\n"
        );
        assert_eq!(OutboundMessage::Screen(3).encode(), "SCREEN:3\n");
        assert_eq!(OutboundMessage::NavLock(true).encode(), "NAVLOCK:1\n");
        assert_eq!(OutboundMessage::CalibrateImu.encode(), "CAL_IMU\n");
        assert_eq!(
            OutboundMessage::Setting {
                name: "brightness".into(),
                value: "80".into()
            }
            .encode(),
            "SET:brightness=80\n"
        );
    }

    #[test]
    fn test_reserved_characters_never_reach_the_wire() {
        assert!(matches!(
            OutboundMessage::steering_button("VOL_UP\nSCREEN:0"),
            Err(CodecError::InvalidToken(_))
        ));
        assert!(OutboundMessage::setting("a,b", "1").is_err());
        assert!(OutboundMessage::setting("brightness", "1=2").is_err());
        assert_eq!(
            OutboundMessage::setting("brightness", "80").unwrap().encode(),
            "SET:brightness=80\n"
        );

        let raw = OutboundMessage::Setting {
            name: "shift\r\nrpm".into(),
            value: "6,000".into(),
        };
        assert_eq!(raw.encode(), "SET:shiftrpm=6000\n");
        assert_eq!(
            OutboundMessage::SteeringButton("MODE\nSCREEN:1".into()).encode(),
            "SWC:MODESCREEN:1\n"
        );
    }

    #[test]
    fn test_negative_zero_is_not_rendered() {
        let frame = TelemetryFrame {
            speed_mph: -0.2,
            ..TelemetryFrame::from(&TelemetrySnapshot::default())
        };
        assert!(OutboundMessage::Telemetry(frame).encode().starts_with("TEL:0,0,"));
    }
}
