//! Simulated GRBL / FluidNC controller.
//!
//! Runs on one end of a `tokio::io::duplex` pair and answers the subset of
//! the protocol the connection manager speaks: `$I`, resets, `$X`, `$$`,
//! FluidNC `$/...` queries, `$H`, `$J=` jogs, moves and `?`. Used by the test suites and
//! by `sandtable --simulate`.
//!
//! ```rust,ignore
//! let (transport, controller) = MockController::spawn(MockConfig::grbl(), state.clone());
//! manager.connect_with(Box::new(transport)).await?;
//! assert_eq!(controller.moves().len(), 0);
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use table_core::{LineTransport, SharedState, TransportKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Firmware personality of the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFirmware {
    /// GRBL 1.1h.
    Grbl,
    /// FluidNC 3.7.
    Fluidnc,
}

/// Behaviour knobs.
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Dialect spoken.
    pub firmware: MockFirmware,
    /// Reported `(x, y)` steps per mm.
    pub steps_per_mm: (f64, f64),
    /// Homing cycle configured (`$22` / `homing/cycle`).
    pub homing_cycle: bool,
    /// Print a banner after a reset.
    pub reset_banner: bool,
    /// Axes that report `Homed:` during `$H`.
    pub homed_axes: (bool, bool),
    /// The next N moves are answered with `error:20`.
    pub reject_moves: u32,
    /// Start locked in alarm.
    pub start_in_alarm: bool,
    /// Active pins; while set, `$X` cannot clear the alarm.
    pub alarm_pins: Option<String>,
    /// Simulated execution time of one move before `ok`.
    pub move_delay: Duration,
    /// The next N moves are answered only after `slow_ack_delay`.
    pub slow_acks: u32,
    /// Reply delay of a slow move.
    pub slow_ack_delay: Duration,
    /// Status queries answered with `Run` after each move or jog.
    pub busy_polls: u32,
    /// Initial machine position.
    pub position: (f64, f64),
}

impl MockConfig {
    /// Healthy GRBL table.
    pub fn grbl() -> Self {
        Self {
            firmware: MockFirmware::Grbl,
            steps_per_mm: (320.0, 287.0),
            homing_cycle: false,
            reset_banner: true,
            homed_axes: (true, true),
            reject_moves: 0,
            start_in_alarm: false,
            alarm_pins: None,
            move_delay: Duration::ZERO,
            slow_acks: 0,
            slow_ack_delay: Duration::ZERO,
            busy_polls: 0,
            position: (0.0, 0.0),
        }
    }

    /// Healthy FluidNC table.
    pub fn fluidnc() -> Self {
        Self {
            firmware: MockFirmware::Fluidnc,
            ..Self::grbl()
        }
    }
}

#[derive(Debug, Default)]
struct Record {
    commands: Vec<String>,
    moves: Vec<(f64, f64)>,
    feeds: Vec<f64>,
    realtime: Vec<u8>,
    position: (f64, f64),
    alarm: bool,
    busy_left: u32,
    run_reports: usize,
}

/// Handle to inspect and disturb a running mock.
#[derive(Clone)]
pub struct MockController {
    record: Arc<Mutex<Record>>,
    unplug: Arc<Notify>,
}

impl MockController {
    /// Start a mock and return the host-side transport plus the handle.
    pub fn spawn(config: MockConfig, state: SharedState) -> (LineTransport<DuplexStream>, Self) {
        let (host, device) = tokio::io::duplex(4096);
        let record = Arc::new(Mutex::new(Record {
            position: config.position,
            alarm: config.start_in_alarm,
            ..Default::default()
        }));
        let unplug = Arc::new(Notify::new());

        let device_task = Device {
            config,
            record: record.clone(),
        };
        let unplugged = unplug.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = device_task.run(device) => {}
                _ = unplugged.notified() => debug!("Mock controller unplugged"),
            }
        });

        let transport = LineTransport::from_stream(host, TransportKind::Serial, "mock", state);
        (transport, Self { record, unplug })
    }

    /// Every line command received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.record.lock().commands.clone()
    }

    /// Targets of acknowledged absolute moves.
    pub fn moves(&self) -> Vec<(f64, f64)> {
        self.record.lock().moves.clone()
    }

    /// Feed rates of acknowledged absolute moves, parallel to [`moves`](Self::moves).
    pub fn feeds(&self) -> Vec<f64> {
        self.record.lock().feeds.clone()
    }

    /// Status queries answered with `Run`.
    pub fn run_reports(&self) -> usize {
        self.record.lock().run_reports
    }

    /// Real-time bytes received (`?` excluded).
    pub fn realtime(&self) -> Vec<u8> {
        self.record.lock().realtime.clone()
    }

    /// Current simulated machine position.
    pub fn position(&self) -> (f64, f64) {
        self.record.lock().position
    }

    /// Simulate a yanked cable: the device end closes.
    pub fn unplug(&self) {
        self.unplug.notify_one();
    }
}

impl std::fmt::Debug for MockController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockController")
            .field("position", &self.position())
            .finish_non_exhaustive()
    }
}

struct Device {
    config: MockConfig,
    record: Arc<Mutex<Record>>,
}

impl Device {
    async fn run(mut self, mut io: DuplexStream) {
        let mut buf = [0u8; 256];
        let mut line = Vec::new();
        loop {
            let n = match io.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            for &byte in &buf[..n] {
                let replies = match byte {
                    b'?' => vec![self.status()],
                    b'!' | 0x18 => self.realtime(byte),
                    b'\n' => {
                        let text = String::from_utf8_lossy(&line).trim().to_string();
                        line.clear();
                        if text.is_empty() {
                            continue;
                        }
                        self.command(&text).await
                    }
                    b'\r' => continue,
                    other => {
                        line.push(other);
                        continue;
                    }
                };
                for reply in replies {
                    trace!(%reply, "Mock TX");
                    let framed = format!("{}\r\n", reply);
                    if io.write_all(framed.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn banner(&self) -> String {
        match self.config.firmware {
            MockFirmware::Grbl => "Grbl 1.1h ['$' for help]".to_string(),
            MockFirmware::Fluidnc => "Grbl 3.7 [FluidNC v3.7.8 (wifi) '$' for help]".to_string(),
        }
    }

    fn status(&self) -> String {
        let mut record = self.record.lock();
        let state = if record.alarm {
            "Alarm"
        } else if record.busy_left > 0 {
            record.busy_left -= 1;
            record.run_reports += 1;
            "Run"
        } else {
            "Idle"
        };
        let pins = match (&self.config.alarm_pins, record.alarm) {
            (Some(pins), true) => format!("|Pn:{}", pins),
            _ => String::new(),
        };
        format!(
            "<{}|MPos:{:.3},{:.3},0.000|FS:0,0{}>",
            state, record.position.0, record.position.1, pins
        )
    }

    fn realtime(&mut self, byte: u8) -> Vec<String> {
        self.record.lock().realtime.push(byte);
        if byte == 0x18 && self.config.reset_banner {
            vec![self.banner()]
        } else {
            Vec::new()
        }
    }

    async fn command(&mut self, text: &str) -> Vec<String> {
        self.record.lock().commands.push(text.to_string());
        let ok = || vec!["ok".to_string()];
        let (x_steps, y_steps) = self.config.steps_per_mm;

        match text {
            "$I" => match self.config.firmware {
                MockFirmware::Grbl => vec![
                    "[VER:1.1h.20190825:]".to_string(),
                    "[OPT:V,15,128]".to_string(),
                    "ok".to_string(),
                ],
                MockFirmware::Fluidnc => vec![
                    "[VER:3.7 FluidNC v3.7.8:]".to_string(),
                    "[OLR:SSID]".to_string(),
                    "ok".to_string(),
                ],
            },
            "$Bye" => {
                if self.config.reset_banner {
                    vec![self.banner()]
                } else {
                    Vec::new()
                }
            }
            "$X" => {
                let mut record = self.record.lock();
                if self.config.alarm_pins.is_none() {
                    record.alarm = false;
                }
                vec!["[MSG:Caution: Unlocked]".to_string(), "ok".to_string()]
            }
            "$$" if self.config.firmware == MockFirmware::Grbl => vec![
                "$0=10".to_string(),
                format!("$22={}", u8::from(self.config.homing_cycle)),
                format!("$100={:.3}", x_steps),
                format!("$101={:.3}", y_steps),
                "ok".to_string(),
            ],
            "$/axes/x/steps_per_mm" => {
                vec![format!("$/axes/x/steps_per_mm={:.3}", x_steps), "ok".into()]
            }
            "$/axes/y/steps_per_mm" => {
                vec![format!("$/axes/y/steps_per_mm={:.3}", y_steps), "ok".into()]
            }
            "$/axes/x/homing/cycle" => vec![
                format!("$/axes/x/homing/cycle={}", u8::from(self.config.homing_cycle)),
                "ok".into(),
            ],
            "$H" => self.home(),
            _ if text.starts_with("G1 G53") => self.absolute_move(text).await,
            _ if text.starts_with("$J=") => {
                let mut record = self.record.lock();
                if let Some(dy) = word(text, 'Y') {
                    record.position.1 += dy;
                }
                record.busy_left = self.config.busy_polls;
                ok()
            }
            _ if text.starts_with('$') && self.config.firmware == MockFirmware::Grbl => {
                vec!["error:3".to_string()]
            }
            _ => ok(),
        }
    }

    fn home(&mut self) -> Vec<String> {
        let (x, y) = self.config.homed_axes;
        let mut replies = Vec::new();
        if x {
            replies.push("[MSG:Homed:X]".to_string());
        }
        if y {
            replies.push("[MSG:Homed:Y]".to_string());
        }
        if x || y {
            let mut record = self.record.lock();
            record.alarm = false;
            if x {
                record.position.0 = 0.0;
            }
            if y {
                record.position.1 = 0.0;
            }
            replies.push("ok".to_string());
        } else {
            replies.push("ALARM:9".to_string());
        }
        replies
    }

    async fn absolute_move(&mut self, text: &str) -> Vec<String> {
        if self.config.reject_moves > 0 {
            self.config.reject_moves -= 1;
            return vec!["error:20".to_string()];
        }
        let delay = if self.config.slow_acks > 0 {
            self.config.slow_acks -= 1;
            self.config.slow_ack_delay
        } else {
            self.config.move_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut record = self.record.lock();
        let x = word(text, 'X').unwrap_or(record.position.0);
        let y = word(text, 'Y').unwrap_or(record.position.1);
        record.position = (x, y);
        record.moves.push((x, y));
        if let Some(feed) = word(text, 'F') {
            record.feeds.push(feed);
        }
        record.busy_left = self.config.busy_polls;
        vec!["ok".to_string()]
    }
}

/// Numeric value following `letter` in a G-code line.
fn word(line: &str, letter: char) -> Option<f64> {
    line.split_whitespace()
        .find_map(|w| w.strip_prefix(letter))
        .and_then(|v| v.parse().ok())
}
