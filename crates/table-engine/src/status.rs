//! Status snapshots and the background flows that publish them.
//!
//! - [`spawn_status_broadcaster`]: periodic [`StatusSnapshot`] on a broadcast channel
//! - [`spawn_idle_timer`]: re-asserts the idle visual after a quiet period

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use table_core::state::Progress;
use table_core::{MachineState, TableType, VisualFeedback};
use table_grbl::{ConnectionState, HomingPhase};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Coarse session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No session.
    Idle,
    /// Drawing.
    Running,
    /// Held at the pause gate.
    Paused,
    /// Stop raised, runner not yet finished.
    Stopping,
}

/// Playlist part of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaylistStatus {
    /// Playlist name.
    pub name: Option<String>,
    /// Index into `files` of the file being drawn.
    pub index: Option<usize>,
    /// `single` or `indefinite`.
    pub mode: Option<String>,
    /// Built sequence of the current pass.
    pub files: Vec<String>,
}

/// Point-in-time view of the table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    /// Session phase.
    pub phase: SessionPhase,
    /// File being drawn.
    pub current_file: Option<String>,
    /// Progress of `current_file`.
    pub progress: Option<Progress>,
    /// Completion percentage of `current_file`.
    pub percent: Option<f64>,
    /// Present while a playlist runs.
    pub playlist: Option<PlaylistStatus>,
    /// Polar angle, radians.
    pub theta: f64,
    /// Normalised radius.
    pub rho: f64,
    /// Machine X, mm.
    pub machine_x: f64,
    /// Machine Y, mm.
    pub machine_y: f64,
    /// Pattern feed rate.
    pub speed: f64,
    /// Controller link.
    pub connection: ConnectionState,
    /// Homing state machine.
    pub homing: HomingPhase,
    /// Detected table type.
    pub table_type: TableType,
}

impl StatusSnapshot {
    /// Assemble from the machine record and the live phases.
    pub fn from_state(
        state: &MachineState,
        phase: SessionPhase,
        connection: ConnectionState,
        homing: HomingPhase,
    ) -> Self {
        let session = &state.session;
        let playlist = (!session.playlist.is_empty()).then(|| PlaylistStatus {
            name: session.playlist_name.clone(),
            index: session.playlist_index,
            mode: session.playlist_mode.clone(),
            files: session.playlist.clone(),
        });
        Self {
            phase,
            current_file: session.current_file.clone(),
            progress: session.progress.clone(),
            percent: session.progress.as_ref().map(Progress::percent),
            playlist,
            theta: state.theta,
            rho: state.rho,
            machine_x: state.machine_x,
            machine_y: state.machine_y,
            speed: state.speed,
            connection,
            homing,
            table_type: state.calibration.table_type,
        }
    }
}

/// Publish `source()` on `tx` every `period` until aborted.
///
/// Ticks with no subscribers skip building the snapshot.
pub fn spawn_status_broadcaster<F>(
    source: F,
    tx: broadcast::Sender<StatusSnapshot>,
    period: Duration,
) -> JoinHandle<()>
where
    F: Fn() -> StatusSnapshot + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.receiver_count() == 0 {
                continue;
            }
            let snapshot = source();
            trace!(phase = ?snapshot.phase, "Status broadcast");
            let _ = tx.send(snapshot);
        }
    })
}

/// Call `effect_idle` once after `timeout` without a running session.
///
/// Re-arms when the next session starts. Ends when the `running` sender is
/// dropped.
pub fn spawn_idle_timer(
    mut running: watch::Receiver<bool>,
    visual: Arc<dyn VisualFeedback>,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if running.wait_for(|r| !*r).await.is_err() {
                break;
            }
            let expired = tokio::select! {
                _ = tokio::time::sleep(timeout) => Some(true),
                started = running.wait_for(|r| *r) => started.ok().map(|_| false),
            };
            match expired {
                None => break,
                Some(false) => continue,
                Some(true) => {
                    debug!(?timeout, "Idle timeout reached");
                    visual.effect_idle();
                    if running.wait_for(|r| *r).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingVisual {
        idle: AtomicUsize,
    }

    impl VisualFeedback for CountingVisual {
        fn effect_playing(&self) {}

        fn effect_idle(&self) {
            self.idle.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn snapshot_reflects_session() {
        let mut state = MachineState::default();
        state.session.current_file = Some("star.thr".into());
        state.session.progress = Some(Progress {
            done: 1,
            total: 4,
            ..Default::default()
        });
        let snap = StatusSnapshot::from_state(
            &state,
            SessionPhase::Running,
            ConnectionState::Connected,
            HomingPhase::Homed,
        );
        assert_eq!(snap.percent, Some(25.0));
        assert!(snap.playlist.is_none());

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["phase"], "running");
        assert_eq!(json["connection"], "connected");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_fires_once_per_idle_period() {
        let visual = Arc::new(CountingVisual::default());
        let (tx, rx) = watch::channel(false);
        let handle = spawn_idle_timer(rx, visual.clone(), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(visual.idle.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(visual.idle.load(Ordering::SeqCst), 1);

        tx.send_replace(true);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(visual.idle.load(Ordering::SeqCst), 1);

        tx.send_replace(false);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(visual.idle.load(Ordering::SeqCst), 2);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn broadcaster_publishes_snapshots() {
        let (tx, mut rx) = broadcast::channel(4);
        let handle = spawn_status_broadcaster(
            || {
                StatusSnapshot::from_state(
                    &MachineState::default(),
                    SessionPhase::Idle,
                    ConnectionState::Disconnected,
                    HomingPhase::Idle,
                )
            },
            tx,
            Duration::from_millis(500),
        );
        let snap = rx.recv().await.unwrap();
        assert_eq!(snap.phase, SessionPhase::Idle);
        handle.abort();
    }
}
