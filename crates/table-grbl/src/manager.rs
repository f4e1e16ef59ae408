//! Connection manager for GRBL / FluidNC sand table controllers.
//!
//! The manager owns the single live [`Transport`] behind one async mutex, so
//! every exchange on the wire (a command and the lines that answer it) is
//! atomic with respect to other tasks. On top of it sit the device-level
//! operations: firmware detection, soft reset, work-coordinate reset, alarm
//! handling, calibration, buffered motion send and idle/position polling.
//! Homing lives in [`crate::homing`].
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = Arc::new(ConnectionManager::new(settings, state));
//! manager.connect().await?;
//! manager.send_move(12.0, 3.5, 500.0).await?;
//! manager.wait_until_idle().await?;
//! ```

use crate::ports::{list_ports, order_candidates};
use crate::protocol::{self, ResetCommand, StatusFrame};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use table_core::retry::{geometric_timeout, retry_with, Attempt, Backoff, RetryPolicy};
use table_core::state::{Calibration, FirmwareInfo};
use table_core::{
    FirmwareKind, HomingMode, SerialTransport, Settings, SharedState, SocketTransport, TableError,
    TableResult, TableType, Transport, TransportError,
};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

pub(crate) type LinkSlot = Option<Box<dyn Transport>>;

/// Lifecycle of the controller link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport.
    Disconnected,
    /// Opening a port or socket.
    Connecting,
    /// A live transport is attached.
    Connected,
}

/// Homing state machine: `Idle -> Homing -> {Homed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HomingPhase {
    /// Not homed since connect.
    Idle,
    /// A homing cycle is running.
    Homing,
    /// Last homing succeeded.
    Homed,
    /// Last homing failed.
    Failed,
}

/// Result of [`ConnectionManager::check_alarm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmStatus {
    /// No alarm was reported.
    Clear,
    /// An alarm was cleared by `$X`.
    Unlocked,
    /// Still in alarm, but a sensor pin is active; homing is expected to clear it.
    Provisional,
}

/// Result of [`ConnectionManager::wait_until_idle_bounded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The controller reported `Idle`; position has been persisted.
    Idle,
    /// The cancel predicate fired first.
    Cancelled,
    /// The timeout elapsed first.
    TimedOut,
}

/// Wait windows and retry policies used against the controller.
#[derive(Debug, Clone)]
pub struct Timings {
    /// How long `$I` output is collected.
    pub firmware_window: Duration,
    /// First soft-reset banner wait; grows by `reset_growth` per attempt.
    pub reset_timeout: Duration,
    /// Geometric growth factor of the banner wait.
    pub reset_growth: f64,
    /// Soft-reset attempts and backoff.
    pub reset_policy: RetryPolicy,
    /// Acknowledgement wait for single commands (`$X`, `G92.1`, ...).
    pub ack_timeout: Duration,
    /// Response window of one move attempt.
    pub move_window: Duration,
    /// Overall cap across all attempts of one move.
    pub move_cap: Duration,
    /// Move retries on `error:` or silence.
    pub move_policy: RetryPolicy,
    /// Delay between status queries while waiting for `Idle`.
    pub poll_interval: Duration,
    /// Wait for a status frame after `?`.
    pub status_timeout: Duration,
    /// How long `Homed:` messages are collected after `$H`.
    pub sensor_window: Duration,
    /// Hard ceiling over a whole homing run.
    pub homing_ceiling: Duration,
    /// Idle confirmation window after each homing move.
    pub homing_idle_timeout: Duration,
    /// Collection window of one settings query.
    pub settings_window: Duration,
    /// Retries of the GRBL `$$` dump.
    pub settings_policy: RetryPolicy,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            firmware_window: Duration::from_secs(2),
            reset_timeout: Duration::from_secs(5),
            reset_growth: 1.5,
            reset_policy: RetryPolicy {
                max_attempts: 5,
                backoff: Backoff::Exponential {
                    base: Duration::from_secs(1),
                    max: Duration::from_secs(8),
                },
            },
            ack_timeout: Duration::from_secs(5),
            move_window: Duration::from_secs(10),
            move_cap: Duration::from_secs(30),
            move_policy: RetryPolicy {
                max_attempts: 3,
                backoff: Backoff::Linear(Duration::from_millis(100)),
            },
            poll_interval: Duration::from_millis(200),
            status_timeout: Duration::from_secs(1),
            sensor_window: Duration::from_secs(60),
            homing_ceiling: Duration::from_secs(120),
            homing_idle_timeout: Duration::from_secs(60),
            settings_window: Duration::from_secs(2),
            settings_policy: RetryPolicy {
                max_attempts: 3,
                backoff: Backoff::Constant(Duration::from_millis(500)),
            },
        }
    }
}

/// How a command exchange ended.
#[derive(Debug)]
pub(crate) enum Reply {
    /// `ok`
    Ack,
    /// `error:..` or `ALARM:..`
    Rejected(String),
    /// Nothing conclusive inside the window.
    Silent,
}

/// Read until `ok`, an error, or the window elapses. Other lines are returned.
pub(crate) async fn collect_reply(
    link: &mut dyn Transport,
    window: Duration,
) -> Result<(Vec<String>, Reply), TransportError> {
    let deadline = Instant::now() + window;
    let mut lines = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match link.readline(remaining).await? {
            None => return Ok((lines, Reply::Silent)),
            Some(line) if protocol::is_ack(&line) => return Ok((lines, Reply::Ack)),
            Some(line) if protocol::is_error(&line) || protocol::is_alarm_message(&line) => {
                return Ok((lines, Reply::Rejected(line)))
            }
            Some(line) => {
                trace!(%line, "Collected");
                lines.push(line);
            }
        }
    }
}

/// Discard every line already waiting on the link, such as a late `ok`
/// from an attempt that timed out.
pub(crate) async fn drain_input(link: &mut dyn Transport) -> Result<usize, TransportError> {
    let mut dropped = 0;
    while let Some(line) = link.readline(Duration::ZERO).await? {
        trace!(%line, "Stale");
        dropped += 1;
    }
    Ok(dropped)
}

/// Connection manager.
///
/// Always used through an `Arc`; homing and connect spawn work that outlives
/// a borrow.
pub struct ConnectionManager {
    pub(crate) link: Mutex<LinkSlot>,
    connect_lock: Mutex<()>,
    connection: watch::Sender<ConnectionState>,
    pub(crate) homing: watch::Sender<HomingPhase>,
    pub(crate) state: SharedState,
    pub(crate) settings: Settings,
    pub(crate) timings: Timings,
}

impl ConnectionManager {
    /// Manager with default timings.
    pub fn new(settings: Settings, state: SharedState) -> Self {
        Self::with_timings(settings, state, Timings::default())
    }

    /// Manager with explicit timings.
    pub fn with_timings(settings: Settings, state: SharedState, timings: Timings) -> Self {
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        let (homing, _) = watch::channel(HomingPhase::Idle);
        Self {
            link: Mutex::new(None),
            connect_lock: Mutex::new(()),
            connection,
            homing,
            state,
            settings,
            timings,
        }
    }

    /// Shared machine state handle.
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Active settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Active timings.
    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Current link lifecycle state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// Watch link lifecycle changes.
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Current homing phase.
    pub fn homing_phase(&self) -> HomingPhase {
        *self.homing.borrow()
    }

    /// True while a transport is attached and alive.
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Open the preferred port (or the socket fallback) and initialise the device.
    ///
    /// A no-op when already connected.
    #[instrument(skip(self), err)]
    pub async fn connect(self: &Arc<Self>) -> TableResult<()> {
        {
            let _guard = self.connect_lock.lock().await;
            if self.is_connected() {
                debug!("Already connected");
                return Ok(());
            }
            self.connection.send_replace(ConnectionState::Connecting);
            let transport = match self.open_transport().await {
                Ok(transport) => transport,
                Err(e) => {
                    self.connection.send_replace(ConnectionState::Disconnected);
                    return Err(e);
                }
            };
            self.install(transport).await;
        }
        self.initialize_device().await
    }

    /// Attach an already-open transport and initialise the device.
    pub async fn connect_with(self: &Arc<Self>, transport: Box<dyn Transport>) -> TableResult<()> {
        self.attach(transport).await;
        self.initialize_device().await
    }

    /// Attach an already-open transport without talking to the device.
    ///
    /// Any previous link is closed first.
    pub async fn attach(&self, transport: Box<dyn Transport>) {
        let _guard = self.connect_lock.lock().await;
        self.install(transport).await;
    }

    async fn install(&self, transport: Box<dyn Transport>) {
        let mut slot = self.link.lock().await;
        if let Some(mut old) = slot.take() {
            if let Err(e) = old.close().await {
                warn!(endpoint = old.describe(), error = %e, "Closing previous link failed");
            }
        }
        info!(endpoint = transport.describe(), kind = %transport.kind(), "Controller link attached");
        *slot = Some(transport);
        self.connection.send_replace(ConnectionState::Connected);
        self.homing.send_replace(HomingPhase::Idle);
        self.state.update(|s| s.homing.homed = false);
    }

    async fn open_transport(&self) -> TableResult<Box<dyn Transport>> {
        let conn = &self.settings.connection;
        let available = list_ports();
        let last_used = self.state.read(|s| s.last_port.clone());
        let candidates = order_candidates(
            conn.port.as_deref(),
            last_used.as_deref(),
            &available,
            &conn.deprioritized_ports,
        );

        for port in &candidates {
            match SerialTransport::open(port, conn.baud_rate, self.state.clone()).await {
                Ok(transport) => {
                    info!(%port, baud_rate = conn.baud_rate, "Serial port opened");
                    let port = port.clone();
                    self.state.update_and_save(|s| s.last_port = Some(port))?;
                    return Ok(Box::new(transport));
                }
                Err(e) => warn!(%port, error = %e, "Serial port unavailable"),
            }
        }

        if !available.is_empty() {
            return Err(TableError::NoDevice(format!(
                "none of {} serial port(s) could be opened",
                candidates.len()
            )));
        }

        info!(
            host = %conn.socket_host,
            port = conn.socket_port,
            "No serial ports present, trying socket link"
        );
        let transport = SocketTransport::connect(
            &conn.socket_host,
            conn.socket_port,
            conn.socket_timeout(),
            self.state.clone(),
        )
        .await
        .map_err(|e| {
            TableError::NoDevice(format!(
                "socket {}:{} unreachable: {}",
                conn.socket_host, conn.socket_port, e
            ))
        })?;
        Ok(Box::new(transport))
    }

    /// Close the link (persisting state first) and forget it.
    #[instrument(skip(self), err)]
    pub async fn disconnect(&self) -> TableResult<()> {
        let _guard = self.connect_lock.lock().await;
        let taken = self.link.lock().await.take();
        self.connection.send_replace(ConnectionState::Disconnected);
        self.homing.send_replace(HomingPhase::Idle);
        self.state.update(|s| s.homing.homed = false);
        match taken {
            Some(mut transport) => {
                info!(endpoint = transport.describe(), "Disconnecting");
                transport.close().await?;
            }
            None => self.state.save()?,
        }
        Ok(())
    }

    /// Disconnect, then connect again.
    pub async fn restart(self: &Arc<Self>) -> TableResult<()> {
        self.disconnect().await?;
        self.connect().await
    }

    /// Drop a link whose device vanished.
    pub(crate) fn drop_dead_link(&self, slot: &mut LinkSlot) {
        if let Some(transport) = slot.take() {
            error!(endpoint = transport.describe(), "Device vanished, connection dropped");
        }
        self.connection.send_replace(ConnectionState::Disconnected);
        if let Err(e) = self.state.save() {
            warn!(error = %e, "Failed to persist state after link loss");
        }
    }

    /// Drop the link when `result` carries a vanished-device error.
    pub(crate) fn settle<T>(&self, slot: &mut LinkSlot, result: TableResult<T>) -> TableResult<T> {
        if matches!(&result, Err(e) if e.is_device_gone()) {
            self.drop_dead_link(slot);
        }
        result
    }

    /// Send one command and wait for its acknowledgement.
    pub async fn command(&self, line: &str) -> TableResult<()> {
        let mut slot = self.link.lock().await;
        let result = match slot.as_deref_mut() {
            Some(link) => exchange(link, line, self.timings.ack_timeout).await,
            None => Err(TableError::NotConnected),
        };
        self.settle(&mut slot, result)
    }

    /// Send one real-time byte.
    pub async fn realtime(&self, byte: u8) -> TableResult<()> {
        let mut slot = self.link.lock().await;
        let result = match slot.as_deref_mut() {
            Some(link) => link.send_realtime(byte).await.map_err(TableError::from),
            None => Err(TableError::NotConnected),
        };
        self.settle(&mut slot, result)
    }

    // =========================================================================
    // Device initialisation
    // =========================================================================

    /// Bring a freshly attached controller into a known state.
    ///
    /// Firmware detection, optional soft reset plus work-coordinate reset,
    /// alarm handling, calibration, position query and optional auto-homing.
    /// Only a vanished device or an unrecoverable alarm aborts the sequence.
    #[instrument(skip(self), err)]
    pub async fn initialize_device(self: &Arc<Self>) -> TableResult<()> {
        let firmware = self.detect_firmware().await?;
        info!(kind = %firmware.firmware_kind, version = ?firmware.firmware_version, "Firmware detected");

        if self.settings.connection.reset_on_connect {
            match self.soft_reset().await {
                Ok(()) => {
                    if let Err(e) = self.reset_work_coordinates().await {
                        if e.is_device_gone() {
                            return Err(e);
                        }
                        warn!(error = %e, "Work-coordinate reset failed");
                    }
                }
                Err(e) if e.is_device_gone() => return Err(e),
                Err(e) => warn!(error = %e, "Soft reset failed, keeping persisted position"),
            }
        }

        match self.check_alarm().await? {
            AlarmStatus::Clear => {}
            AlarmStatus::Unlocked => info!("Alarm cleared"),
            AlarmStatus::Provisional => warn!("Alarm persists with active sensor pin, continuing"),
        }

        if let Err(e) = self.query_calibration().await {
            if e.is_device_gone() {
                return Err(e);
            }
            warn!(error = %e, "Calibration query failed, using persisted values");
        }

        if let Err(e) = self.update_position().await {
            if e.is_device_gone() {
                return Err(e);
            }
            warn!(error = %e, "Position query failed");
        }

        if self.settings.connection.auto_home {
            if self.state.read(|s| s.homing.sensor_homing_failed) {
                warn!("Sensor homing previously failed; auto-homing skipped until an operator homes");
            } else if let Err(e) = self.home(crate::homing::HomingTrigger::Automatic).await {
                if e.is_device_gone() {
                    return Err(e);
                }
                error!(error = %e, "Auto-homing failed");
            }
        }
        Ok(())
    }

    /// Identify the firmware family from `$I` output.
    #[instrument(skip(self), err)]
    pub async fn detect_firmware(&self) -> TableResult<FirmwareInfo> {
        let mut slot = self.link.lock().await;
        let result = match slot.as_deref_mut() {
            Some(link) => self.identify(link).await,
            None => Err(TableError::NotConnected),
        };
        let info = self.settle(&mut slot, result)?;
        drop(slot);

        let stored = info.clone();
        self.state.update_and_save(|s| s.firmware = stored)?;
        Ok(info)
    }

    async fn identify(&self, link: &mut dyn Transport) -> TableResult<FirmwareInfo> {
        link.send(protocol::IDENTIFY).await?;
        let (lines, reply) = collect_reply(link, self.timings.firmware_window).await?;
        if let Reply::Rejected(line) = &reply {
            debug!(%line, "Identification rejected");
        }
        let output = lines.join("\n");
        Ok(FirmwareInfo {
            firmware_kind: FirmwareKind::classify(&output),
            firmware_version: protocol::extract_version(&output),
        })
    }

    // =========================================================================
    // Soft reset
    // =========================================================================

    /// Soft-reset the controller and zero the persisted machine position.
    ///
    /// The position is only zeroed after a restart banner and an acknowledged
    /// unlock. If no banner is ever seen the persisted state is left untouched
    /// and [`TableError::ResetFailed`] is returned.
    #[instrument(skip(self), err)]
    pub async fn soft_reset(&self) -> TableResult<()> {
        let kind = self.state.read(|s| s.firmware.firmware_kind);
        let reset = protocol::reset_command(kind);
        debug!(%kind, ?reset, "Soft reset");

        retry_with(&self.timings.reset_policy, |attempt| {
            self.attempt_reset(reset, attempt)
        })
        .await?;

        self.command(protocol::UNLOCK).await?;
        self.state.update_and_save(|s| s.set_machine(0.0, 0.0))?;
        info!("Controller restarted, machine position zeroed");
        Ok(())
    }

    async fn attempt_reset(&self, reset: ResetCommand, attempt: u32) -> Attempt<(), TableError> {
        let wait = geometric_timeout(self.timings.reset_timeout, self.timings.reset_growth, attempt);
        let mut slot = self.link.lock().await;
        let Some(link) = slot.as_deref_mut() else {
            return Attempt::Fatal(TableError::NotConnected);
        };
        let result = await_banner(link, reset, wait).await;
        match self.settle(&mut slot, result) {
            Ok(true) => Attempt::Success(()),
            Ok(false) => {
                warn!(attempt = attempt + 1, ?wait, "No restart banner");
                Attempt::Retry(TableError::ResetFailed {
                    attempts: attempt + 1,
                })
            }
            Err(e) if e.is_device_gone() => Attempt::Fatal(e),
            Err(e) => Attempt::Retry(e),
        }
    }

    /// Clear `G92` offsets and zero the `G54` work offset.
    #[instrument(skip(self), err)]
    pub async fn reset_work_coordinates(&self) -> TableResult<()> {
        self.command(protocol::CLEAR_OFFSETS).await?;
        self.command(protocol::ZERO_G54).await?;
        debug!("Work coordinates reset");
        Ok(())
    }

    // =========================================================================
    // Alarm
    // =========================================================================

    /// Check for an alarm and try to unlock it.
    #[instrument(skip(self), err)]
    pub async fn check_alarm(&self) -> TableResult<AlarmStatus> {
        let frame = self.query_status().await?;
        if !frame.is_alarm() {
            return Ok(AlarmStatus::Clear);
        }

        warn!(state = %frame.state, "Controller in alarm, unlocking");
        if let Err(e) = self.command(protocol::UNLOCK).await {
            if e.is_device_gone() {
                return Err(e);
            }
            warn!(error = %e, "Unlock not acknowledged");
        }

        let frame = self.query_status().await?;
        if !frame.is_alarm() {
            Ok(AlarmStatus::Unlocked)
        } else if let Some(pins) = frame.pins.as_deref() {
            warn!(%pins, "Alarm persists with sensor input active");
            Ok(AlarmStatus::Provisional)
        } else {
            Err(TableError::Alarm(frame.state))
        }
    }

    // =========================================================================
    // Calibration
    // =========================================================================

    /// Read steps-per-mm and the homing cycle, then derive table type, gear
    /// ratio and homing mode (settings overrides win) and persist them.
    #[instrument(skip(self), err)]
    pub async fn query_calibration(&self) -> TableResult<Calibration> {
        let kind = self.state.read(|s| s.firmware.firmware_kind);
        let raw = match kind {
            FirmwareKind::Fluidnc => self.fluidnc_calibration().await?,
            FirmwareKind::Grbl | FirmwareKind::Unknown => {
                retry_with(&self.timings.settings_policy, |attempt| {
                    self.attempt_settings_dump(attempt)
                })
                .await?
            }
        };

        let table = &self.settings.table;
        let detected = TableType::from_steps(raw.x_steps, raw.y_steps);
        let table_type = table.table_type_override.unwrap_or(detected);
        let gear_ratio = table
            .gear_ratio_override
            .unwrap_or_else(|| table_type.default_gear_ratio());
        let homing_mode = table.homing_mode.unwrap_or(if raw.homing_cycle {
            HomingMode::Sensor
        } else {
            HomingMode::Crash
        });

        let calibration = Calibration {
            x_steps_per_mm: raw.x_steps,
            y_steps_per_mm: raw.y_steps,
            gear_ratio,
            table_type,
            homing_cycle_enabled: raw.homing_cycle,
        };
        let stored = calibration.clone();
        let offset = table.angular_offset_rad();
        self.state.update_and_save(|s| {
            s.calibration = stored;
            s.homing.homing_mode = homing_mode;
            s.homing.angular_offset = offset;
        })?;

        info!(
            x_steps = raw.x_steps,
            y_steps = raw.y_steps,
            %table_type,
            %detected,
            gear_ratio,
            ?homing_mode,
            "Calibration loaded"
        );
        Ok(calibration)
    }

    async fn fluidnc_calibration(&self) -> TableResult<RawCalibration> {
        let x_steps = self.query_setting("/axes/x/steps_per_mm").await?;
        let y_steps = self.query_setting("/axes/y/steps_per_mm").await?;
        let (Some(x_steps), Some(y_steps)) = (x_steps, y_steps) else {
            return Err(TableError::Firmware(
                "controller did not report steps_per_mm".to_string(),
            ));
        };
        let cycle = self.query_setting("/axes/x/homing/cycle").await?;
        Ok(RawCalibration {
            x_steps,
            y_steps,
            homing_cycle: cycle.is_some_and(|c| c >= 1.0),
        })
    }

    /// Query one FluidNC `$/path` setting. `None` when it is absent.
    async fn query_setting(&self, key: &str) -> TableResult<Option<f64>> {
        let mut slot = self.link.lock().await;
        let result = match slot.as_deref_mut() {
            Some(link) => {
                let window = self.timings.settings_window;
                async {
                    link.send(&format!("${}", key)).await?;
                    let (lines, reply) = collect_reply(link, window).await?;
                    if let Reply::Rejected(line) = reply {
                        debug!(%key, %line, "Setting not available");
                    }
                    Ok::<_, TableError>(lines.iter().find_map(|l| protocol::parse_setting(l, key)))
                }
                .await
            }
            None => Err(TableError::NotConnected),
        };
        self.settle(&mut slot, result)
    }

    async fn attempt_settings_dump(&self, attempt: u32) -> Attempt<RawCalibration, TableError> {
        let mut slot = self.link.lock().await;
        let Some(link) = slot.as_deref_mut() else {
            return Attempt::Fatal(TableError::NotConnected);
        };
        let window = self.timings.settings_window;
        let result: TableResult<Vec<String>> = async {
            link.send(protocol::SETTINGS_DUMP).await?;
            Ok::<_, TableError>(collect_reply(link, window).await?.0)
        }
        .await;

        match self.settle(&mut slot, result) {
            Ok(lines) => {
                let find = |key: &str| lines.iter().find_map(|l| protocol::parse_setting(l, key));
                match (find("$100"), find("$101")) {
                    (Some(x_steps), Some(y_steps)) => Attempt::Success(RawCalibration {
                        x_steps,
                        y_steps,
                        homing_cycle: find("$22").is_some_and(|v| v >= 1.0),
                    }),
                    _ => {
                        warn!(attempt = attempt + 1, lines = lines.len(), "Incomplete settings dump");
                        Attempt::Retry(TableError::Firmware(
                            "settings dump lacks $100/$101".to_string(),
                        ))
                    }
                }
            }
            Err(e) if e.is_device_gone() => Attempt::Fatal(e),
            Err(e) => Attempt::Retry(e),
        }
    }

    // =========================================================================
    // Motion
    // =========================================================================

    /// Send an absolute machine-coordinate move and wait for its `ok`.
    ///
    /// `error:` replies and silence are retried with a short backoff; a
    /// vanished device is fatal and drops the connection. The whole call is
    /// capped by `Timings::move_cap`.
    #[instrument(skip(self), level = "trace", err)]
    pub async fn send_move(&self, x: f64, y: f64, speed: f64) -> TableResult<()> {
        let line = protocol::move_command(x, y, speed);
        let attempts = retry_with(&self.timings.move_policy, |attempt| {
            self.attempt_move(&line, attempt)
        });
        match tokio::time::timeout(self.timings.move_cap, attempts).await {
            Ok(result) => result,
            Err(_) => Err(TableError::Timeout(format!("acknowledgement of '{}'", line))),
        }
    }

    async fn attempt_move(&self, line: &str, attempt: u32) -> Attempt<(), TableError> {
        let mut slot = self.link.lock().await;
        let Some(link) = slot.as_deref_mut() else {
            return Attempt::Fatal(TableError::NotConnected);
        };
        let window = self.timings.move_window;
        let result: TableResult<Reply> = async {
            if attempt > 0 {
                let dropped = drain_input(link).await?;
                if dropped > 0 {
                    debug!(dropped, "Discarded stale replies before resend");
                }
            }
            link.send(line).await?;
            Ok::<_, TableError>(collect_reply(link, window).await?.1)
        }
        .await;

        match self.settle(&mut slot, result) {
            Ok(Reply::Ack) => Attempt::Success(()),
            Ok(Reply::Rejected(reply)) => {
                warn!(%line, %reply, attempt = attempt + 1, "Move rejected");
                Attempt::Retry(TableError::Firmware(reply))
            }
            Ok(Reply::Silent) => {
                warn!(%line, attempt = attempt + 1, "Move not acknowledged");
                Attempt::Retry(TableError::Timeout(format!("acknowledgement of '{}'", line)))
            }
            Err(e) if e.is_device_gone() => Attempt::Fatal(e),
            Err(e) => Attempt::Retry(e),
        }
    }

    // =========================================================================
    // Status and position polling
    // =========================================================================

    /// Send `?` and return the next status frame.
    pub async fn query_status(&self) -> TableResult<StatusFrame> {
        let mut slot = self.link.lock().await;
        let result = match slot.as_deref_mut() {
            Some(link) => await_status(link, self.timings.status_timeout).await,
            None => Err(TableError::NotConnected),
        };
        self.settle(&mut slot, result)
    }

    /// Query the controller position and persist it.
    #[instrument(skip(self), err)]
    pub async fn update_position(&self) -> TableResult<(f64, f64)> {
        let frame = self.query_status().await?;
        self.record_position(&frame)?
            .ok_or_else(|| TableError::Firmware(format!("status frame without position: {}", frame.state)))
    }

    fn record_position(&self, frame: &StatusFrame) -> TableResult<Option<(f64, f64)>> {
        let Some((x, y)) = frame.position else {
            return Ok(None);
        };
        self.state.update_and_save(|s| s.set_machine(x, y))?;
        debug!(x, y, frame = ?frame.frame, "Position updated");
        Ok(Some((x, y)))
    }

    /// Poll until the controller reports `Idle`, then persist its position.
    ///
    /// Unbounded; only a lost link ends it early.
    pub async fn wait_until_idle(&self) -> TableResult<()> {
        loop {
            match self.query_status().await {
                Ok(frame) if frame.is_idle() => {
                    self.record_position(&frame)?;
                    return Ok(());
                }
                Ok(frame) => trace!(state = %frame.state, "Waiting for idle"),
                Err(TableError::Timeout(_)) => trace!("No status frame"),
                Err(e) => return Err(e),
            }
            sleep(self.timings.poll_interval).await;
        }
    }

    /// Like [`wait_until_idle`](Self::wait_until_idle), but gives up after
    /// `timeout` and checks `cancel` before every query.
    pub async fn wait_until_idle_bounded<F>(
        &self,
        timeout: Duration,
        cancel: F,
    ) -> TableResult<IdleOutcome>
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if cancel() {
                return Ok(IdleOutcome::Cancelled);
            }
            if Instant::now() >= deadline {
                return Ok(IdleOutcome::TimedOut);
            }
            match self.query_status().await {
                Ok(frame) if frame.is_idle() => {
                    self.record_position(&frame)?;
                    return Ok(IdleOutcome::Idle);
                }
                Ok(frame) => trace!(state = %frame.state, "Waiting for idle"),
                Err(TableError::Timeout(_)) => trace!("No status frame"),
                Err(e) => return Err(e),
            }
            sleep(self.timings.poll_interval).await;
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connection", &self.connection_state())
            .field("homing", &self.homing_phase())
            .finish_non_exhaustive()
    }
}

struct RawCalibration {
    x_steps: f64,
    y_steps: f64,
    homing_cycle: bool,
}

/// Send `line` and require an `ok` within `window`.
pub(crate) async fn exchange(
    link: &mut dyn Transport,
    line: &str,
    window: Duration,
) -> TableResult<()> {
    link.send(line).await?;
    match collect_reply(link, window).await?.1 {
        Reply::Ack => Ok(()),
        Reply::Rejected(reply) => Err(TableError::Firmware(format!("'{}' -> {}", line, reply))),
        Reply::Silent => Err(TableError::Timeout(format!("acknowledgement of '{}'", line))),
    }
}

async fn await_banner(
    link: &mut dyn Transport,
    reset: ResetCommand,
    wait: Duration,
) -> TableResult<bool> {
    match reset {
        ResetCommand::Byte(byte) => link.send_realtime(byte).await?,
        ResetCommand::Line(line) => link.send(line).await?,
    }
    let deadline = Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match link.readline(remaining).await? {
            None => return Ok(false),
            Some(line) if protocol::is_restart_banner(&line) => {
                info!(banner = %line, "Restart banner");
                return Ok(true);
            }
            Some(line) => trace!(%line, "Waiting for banner"),
        }
    }
}

async fn await_status(link: &mut dyn Transport, wait: Duration) -> TableResult<StatusFrame> {
    link.send_realtime(protocol::STATUS_QUERY).await?;
    let deadline = Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match link.readline(remaining).await? {
            None => return Err(TableError::Timeout("status frame".to_string())),
            Some(line) => match StatusFrame::parse(&line) {
                Some(frame) => return Ok(frame),
                None => trace!(%line, "Skipping non-status line"),
            },
        }
    }
}
