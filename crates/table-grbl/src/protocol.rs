//! GRBL / FluidNC wire protocol.
//!
//! Protocol Overview:
//! - Format: newline-terminated ASCII, one command per line
//! - Real-time bytes: `?` status, `!` feed hold, `0x18` soft reset (GRBL)
//! - Acknowledgement: `ok`; failures: `error:<code>`
//! - Status frame: `<Idle|MPos:1.000,2.000,0.000|FS:0,0|Pn:XY>`
//! - Startup banner: `Grbl 1.1h ['$' for help]`, `Grbl 3.7 [FluidNC v3.7.8 ...]`

use table_core::FirmwareKind;

/// Status query.
pub const STATUS_QUERY: u8 = b'?';
/// Feed hold.
pub const FEED_HOLD: u8 = b'!';
/// GRBL soft reset (Ctrl-X).
pub const GRBL_RESET: u8 = 0x18;
/// FluidNC restart command.
pub const FLUIDNC_RESET: &str = "$Bye";
/// Clear alarm lock.
pub const UNLOCK: &str = "$X";
/// Build / version info.
pub const IDENTIFY: &str = "$I";
/// Dump all settings (GRBL).
pub const SETTINGS_DUMP: &str = "$$";
/// Hardware homing cycle.
pub const HOME: &str = "$H";
/// Clear G92 offsets.
pub const CLEAR_OFFSETS: &str = "G92.1";
/// Zero the G54 work offset.
pub const ZERO_G54: &str = "G10 L2 P1 X0 Y0";

/// The reset a firmware family understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCommand {
    /// Single real-time byte.
    Byte(u8),
    /// Full command line.
    Line(&'static str),
}

/// Firmware-specific soft reset.
pub fn reset_command(kind: FirmwareKind) -> ResetCommand {
    match kind {
        FirmwareKind::Fluidnc => ResetCommand::Line(FLUIDNC_RESET),
        FirmwareKind::Grbl | FirmwareKind::Unknown => ResetCommand::Byte(GRBL_RESET),
    }
}

/// Absolute machine-coordinate move.
pub fn move_command(x: f64, y: f64, speed: f64) -> String {
    format!("G1 G53 X{:.3} Y{:.3} F{}", x, y, speed)
}

/// Relative radial jog. `$J=` moves are non-modal, so the controller stays
/// in absolute mode whatever happens to the exchange.
pub fn radial_jog_command(dy: f64, speed: f64) -> String {
    format!("$J=G91 G21 Y{} F{}", dy, speed)
}

/// Bare acknowledgement.
pub fn is_ack(line: &str) -> bool {
    line.eq_ignore_ascii_case("ok")
}

/// Error response (`error:22`, `error: Unsupported command`).
pub fn is_error(line: &str) -> bool {
    line.to_ascii_lowercase().starts_with("error")
}

/// Alarm notification (`ALARM:1`).
pub fn is_alarm_message(line: &str) -> bool {
    line.to_ascii_lowercase().starts_with("alarm:")
}

/// Startup banner printed after a reset.
pub fn is_restart_banner(line: &str) -> bool {
    line.starts_with("Grbl") || line.starts_with("FluidNC") || line.starts_with("[FluidNC")
}

/// Axis named in a FluidNC/GRBL `Homed:<axis>` message.
pub fn homed_axis(line: &str) -> Option<char> {
    let idx = line.find("Homed:")?;
    line[idx + "Homed:".len()..]
        .chars()
        .next()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.is_ascii_alphabetic())
}

/// Version token from `$I` output.
///
/// `[VER:1.1h.20190825:]` yields `1.1h.20190825`;
/// `[VER:3.7 FluidNC v3.7.8:]` yields `v3.7.8`.
pub fn extract_version(output: &str) -> Option<String> {
    let start = output.find("[VER:")? + "[VER:".len();
    let rest = &output[start..];
    let body = rest.split(']').next()?.trim_end_matches(':').trim();
    if body.is_empty() {
        return None;
    }
    let tokens: Vec<&str> = body.split_whitespace().collect();
    let version = tokens
        .windows(2)
        .find(|pair| pair[0].eq_ignore_ascii_case("fluidnc"))
        .map(|pair| pair[1])
        .or_else(|| tokens.first().copied())?;
    Some(version.trim_end_matches(':').to_string())
}

/// Value of `key=value` settings lines such as `$100=320.000` or
/// `/axes/x/steps_per_mm=320`. Leading `$` on the line is ignored.
pub fn parse_setting(line: &str, key: &str) -> Option<f64> {
    let line = line.trim().trim_start_matches('$');
    let key = key.trim_start_matches('$');
    let (k, v) = line.split_once('=')?;
    if !k.trim().eq_ignore_ascii_case(key) {
        return None;
    }
    v.trim().parse().ok()
}

/// Coordinate frame of a reported position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionFrame {
    /// `MPos`
    Machine,
    /// `WPos`
    Work,
}

/// Parsed `<State|Pos:x,y,z|...>` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusFrame {
    /// `Idle`, `Run`, `Alarm`, `Hold:0`, ...
    pub state: String,
    /// X and Y of the reported position.
    pub position: Option<(f64, f64)>,
    /// Which key the position came from.
    pub frame: Option<PositionFrame>,
    /// Active input pins (`Pn:` field), if any.
    pub pins: Option<String>,
}

impl StatusFrame {
    /// Parse a status line; `None` if it is not a status frame.
    pub fn parse(line: &str) -> Option<Self> {
        let body = line.trim().strip_prefix('<')?.strip_suffix('>')?;
        let mut fields = body.split('|');
        let state = fields.next()?.trim().to_string();
        if state.is_empty() {
            return None;
        }

        let mut frame = StatusFrame {
            state,
            position: None,
            frame: None,
            pins: None,
        };

        for field in fields {
            let Some((key, value)) = field.split_once(':') else {
                continue;
            };
            match key {
                "MPos" | "WPos" => {
                    let mut coords = value.split(',').map(|v| v.trim().parse::<f64>());
                    if let (Some(Ok(x)), Some(Ok(y))) = (coords.next(), coords.next()) {
                        frame.position = Some((x, y));
                        frame.frame = Some(if key == "MPos" {
                            PositionFrame::Machine
                        } else {
                            PositionFrame::Work
                        });
                    }
                }
                "Pn" if !value.trim().is_empty() => frame.pins = Some(value.trim().to_string()),
                _ => {}
            }
        }
        Some(frame)
    }

    /// Motion queue drained.
    pub fn is_idle(&self) -> bool {
        self.state.starts_with("Idle")
    }

    /// Controller locked by an alarm.
    pub fn is_alarm(&self) -> bool {
        self.state.starts_with("Alarm")
    }
}
