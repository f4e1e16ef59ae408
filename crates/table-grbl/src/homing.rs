//! Homing state machine.
//!
//! ```text
//! Idle --home()--> Homing --+--> Homed
//!                           +--> Failed
//! ```
//!
//! Crash mode drives the radial axis into its mechanical stop and declares
//! polar (0, 0) in software. Sensor mode runs `$H` and watches for
//! `Homed:X` / `Homed:Y`:
//!
//! | Confirmed axes | Action |
//! |---|---|
//! | both | idle, `G1 G53 X0 Y0`, idle, theta = angular offset, rho = 0 |
//! | one | crash-home, polar (0, 0) |
//! | none | latch `sensor_homing_failed`, fail |
//!
//! The latch blocks automatic homing until an operator-triggered homing
//! succeeds. A whole run is bounded by `Timings::homing_ceiling`; on expiry
//! a feed hold is sent and the run reports [`HomingFailure::TimedOut`]. Each
//! homing move must be followed by `Idle` within `Timings::homing_idle_timeout`,
//! otherwise the run fails with [`HomingFailure::NoIdleConfirmation`].

use crate::manager::{collect_reply, ConnectionManager, HomingPhase, IdleOutcome, Reply};
use crate::protocol;
use std::sync::Arc;
use table_core::{HomingFailure, HomingMode, TableError, TableResult, Transport};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Who asked for homing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingTrigger {
    /// Part of device initialisation after connect.
    Automatic,
    /// Explicit operator request; the only trigger that clears the sensor latch.
    Operator,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct AxesConfirmed {
    x: bool,
    y: bool,
}

impl ConnectionManager {
    /// Home the table.
    ///
    /// Returns [`TableError::Busy`] if a homing run is already in progress and
    /// [`HomingFailure::SensorFailureLatched`] for automatic homing while the
    /// sensor latch is set.
    #[instrument(skip(self), err)]
    pub async fn home(self: &Arc<Self>, trigger: HomingTrigger) -> TableResult<()> {
        if trigger == HomingTrigger::Automatic && self.state.read(|s| s.homing.sensor_homing_failed)
        {
            return Err(TableError::Homing(HomingFailure::SensorFailureLatched));
        }

        let claimed = self.homing.send_if_modified(|phase| {
            if *phase == HomingPhase::Homing {
                false
            } else {
                *phase = HomingPhase::Homing;
                true
            }
        });
        if !claimed {
            return Err(TableError::Busy("homing already in progress".to_string()));
        }

        let this = Arc::clone(self);
        let mut task = tokio::spawn(async move { this.run_homing().await });
        let outcome = match tokio::time::timeout(self.timings.homing_ceiling, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(TableError::Firmware(format!("homing task failed: {}", join))),
            Err(_) => {
                task.abort();
                error!(ceiling = ?self.timings.homing_ceiling, "Homing timed out, halting");
                if let Err(e) = self.realtime(protocol::FEED_HOLD).await {
                    warn!(error = %e, "Feed hold failed");
                }
                Err(TableError::Homing(HomingFailure::TimedOut))
            }
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.update_position().await {
                    if e.is_device_gone() {
                        self.homing.send_replace(HomingPhase::Failed);
                        return Err(e);
                    }
                    warn!(error = %e, "Position refresh after homing failed");
                }
                let saved = self.state.update_and_save(|s| {
                    s.homing.homed = true;
                    if trigger == HomingTrigger::Operator {
                        s.homing.sensor_homing_failed = false;
                    }
                });
                if let Err(e) = saved {
                    self.homing.send_replace(HomingPhase::Failed);
                    return Err(e);
                }
                self.homing.send_replace(HomingPhase::Homed);
                info!(?trigger, "Homing complete");
                Ok(())
            }
            Err(e) => {
                self.homing.send_replace(HomingPhase::Failed);
                Err(e)
            }
        }
    }

    async fn run_homing(&self) -> TableResult<()> {
        match self.state.read(|s| s.homing.homing_mode) {
            HomingMode::Crash => self.crash_home().await,
            HomingMode::Sensor => self.sensor_home().await,
        }
    }

    /// Drive the radial axis into its stop and declare polar (0, 0).
    async fn crash_home(&self) -> TableResult<()> {
        let table_type = self.state.read(|s| s.calibration.table_type);
        let offset = table_type.crash_offset_mm();
        let speed = self.settings.table.homing_speed;
        info!(%table_type, offset, speed, "Crash homing");

        self.command(&protocol::radial_jog_command(offset, speed))
            .await?;
        self.confirm_idle().await?;
        self.state.update_and_save(|s| s.set_polar(0.0, 0.0))?;
        Ok(())
    }

    /// Bounded idle wait after a homing move.
    async fn confirm_idle(&self) -> TableResult<()> {
        let window = self.timings.homing_idle_timeout;
        match self.wait_until_idle_bounded(window, || false).await? {
            IdleOutcome::Idle => Ok(()),
            outcome => {
                error!(?outcome, ?window, "Controller did not settle after homing move");
                Err(TableError::Homing(HomingFailure::NoIdleConfirmation))
            }
        }
    }

    async fn sensor_home(&self) -> TableResult<()> {
        info!("Sensor homing");
        let axes = self.run_homing_cycle().await?;
        debug!(?axes, "Homing cycle finished");

        match (axes.x, axes.y) {
            (true, true) => {
                self.confirm_idle().await?;
                self.send_move(0.0, 0.0, self.settings.table.homing_speed)
                    .await?;
                self.confirm_idle().await?;
                let offset = self.state.read(|s| s.homing.angular_offset);
                self.state.update_and_save(|s| s.set_polar(offset, 0.0))?;
                Ok(())
            }
            (true, false) | (false, true) => {
                warn!(?axes, "Only one axis confirmed homing, falling back to crash homing");
                self.crash_home().await
            }
            (false, false) => {
                error!("No homing sensor triggered");
                self.state
                    .update_and_save(|s| s.homing.sensor_homing_failed = true)?;
                Err(TableError::Homing(HomingFailure::SensorsNotTriggered))
            }
        }
    }

    /// Send `$H` and collect `Homed:` confirmations until both axes report,
    /// the controller answers, or the sensor window closes.
    async fn run_homing_cycle(&self) -> TableResult<AxesConfirmed> {
        let mut slot = self.link.lock().await;
        let result = match slot.as_deref_mut() {
            Some(link) => watch_homing(link, self.timings.sensor_window).await,
            None => Err(TableError::NotConnected),
        };
        self.settle(&mut slot, result)
    }
}

async fn watch_homing(
    link: &mut dyn Transport,
    window: std::time::Duration,
) -> TableResult<AxesConfirmed> {
    link.send(protocol::HOME).await?;
    let deadline = Instant::now() + window;
    let mut axes = AxesConfirmed::default();
    while !(axes.x && axes.y) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Some(line) = link.readline(remaining).await? else {
            warn!("Sensor window elapsed");
            break;
        };
        match protocol::homed_axis(&line) {
            Some('X') => axes.x = true,
            Some('Y') => axes.y = true,
            _ if protocol::is_ack(&line) => break,
            _ if protocol::is_error(&line) || protocol::is_alarm_message(&line) => {
                warn!(%line, "Homing cycle rejected");
                break;
            }
            _ => debug!(%line, "Homing"),
        }
    }

    // The trailing `ok` of `$H` belongs to this exchange.
    if axes.x && axes.y {
        if let (_, Reply::Silent) = collect_reply(link, std::time::Duration::from_millis(500)).await? {
            debug!("No trailing acknowledgement after homing");
        }
    }
    Ok(axes)
}
