//! Shared machine state.
//!
//! One process-wide record holding machine and polar position, calibration,
//! homing configuration and the bookkeeping of the active execution session.
//! It is persisted as a flat JSON object so that the table resumes with a
//! known position after a restart.
//!
//! # Writer ownership
//!
//! | Fields | Writers |
//! |---|---|
//! | `machine_x`, `machine_y`, `theta`, `rho` | connection manager, motion engine |
//! | calibration, firmware, homing | connection manager |
//! | session bookkeeping | motion engine |
//!
//! Homing never overlaps a pattern session (both take the engine's execution
//! lock or run at connect time), so the position writers do not race.
//!
//! # Example
//!
//! ```rust,ignore
//! let state = SharedState::load("state.json");
//! state.update(|s| s.set_polar(0.0, 0.0));
//! state.save()?;
//! ```

use crate::error::TableResult;
use crate::table::{FirmwareKind, HomingMode, TableType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-axis calibration retrieved from the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    /// Angular axis steps per mm.
    pub x_steps_per_mm: f64,
    /// Radial axis steps per mm.
    pub y_steps_per_mm: f64,
    /// Effective gear ratio after overrides.
    pub gear_ratio: f64,
    /// Derived hardware variant.
    pub table_type: TableType,
    /// Whether the controller has a homing cycle configured.
    pub homing_cycle_enabled: bool,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            x_steps_per_mm: 320.0,
            y_steps_per_mm: 287.0,
            gear_ratio: TableType::DuneWeaver.default_gear_ratio(),
            table_type: TableType::DuneWeaver,
            homing_cycle_enabled: false,
        }
    }
}

/// Homing configuration and outcome.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HomingState {
    /// Crash or sensor homing.
    pub homing_mode: HomingMode,
    /// Theta assigned after a successful sensor homing (radians).
    pub angular_offset: f64,
    /// Sticky: set when sensor homing found no sensor, cleared only by an
    /// operator-triggered homing that succeeds.
    pub sensor_homing_failed: bool,
    /// A homing has completed since the last connect.
    pub homed: bool,
}

/// Firmware identification.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareInfo {
    /// Detected family.
    pub firmware_kind: FirmwareKind,
    /// Version token if the controller reported one.
    pub firmware_version: Option<String>,
}

/// Progress of the pattern currently executing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Progress {
    /// Points already sent and acknowledged.
    pub done: usize,
    /// Points in the pattern.
    pub total: usize,
    /// Estimated seconds left, from recent throughput.
    pub remaining_secs: Option<f64>,
    /// Seconds since the pattern started (pauses included).
    pub elapsed_secs: f64,
}

impl Progress {
    /// Completion percentage in `0..=100`.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.done as f64 * 100.0 / self.total as f64
        }
    }
}

/// Session bookkeeping owned by the motion engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRecord {
    /// Pattern file being drawn.
    pub current_file: Option<String>,
    /// Progress of `current_file`.
    pub progress: Option<Progress>,
    /// Concrete, ordered sequence of the running playlist (clear patterns included).
    pub playlist: Vec<String>,
    /// Name supplied by the orchestrator.
    pub playlist_name: Option<String>,
    /// Index into `playlist` of the file being drawn.
    pub playlist_index: Option<usize>,
    /// `single` or `indefinite`.
    pub playlist_mode: Option<String>,
    /// Pause gate closed.
    pub paused: bool,
    /// Stop flag raised.
    pub stop_requested: bool,
    /// Skip flag raised and not yet consumed.
    pub skip_requested: bool,
}

impl SessionRecord {
    /// Drop every session field, leaving the flags as they are.
    pub fn clear_run(&mut self) {
        self.current_file = None;
        self.progress = None;
        self.playlist.clear();
        self.playlist_name = None;
        self.playlist_index = None;
        self.playlist_mode = None;
    }
}

/// The persisted machine record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineState {
    /// Absolute machine X (angular axis), mm.
    pub machine_x: f64,
    /// Absolute machine Y (radial axis), mm.
    pub machine_y: f64,
    /// Polar angle, radians (unbounded).
    pub theta: f64,
    /// Normalised radius, 0 = centre, 1 = perimeter.
    pub rho: f64,
    /// Feed rate for pattern moves, mm/min.
    pub speed: f64,
    /// Port of the last successful connection.
    pub last_port: Option<String>,
    /// Calibration constants.
    #[serde(flatten)]
    pub calibration: Calibration,
    /// Homing configuration.
    #[serde(flatten)]
    pub homing: HomingState,
    /// Firmware identification.
    #[serde(flatten)]
    pub firmware: FirmwareInfo,
    /// Active session bookkeeping.
    #[serde(flatten)]
    pub session: SessionRecord,
}

impl Default for MachineState {
    fn default() -> Self {
        Self {
            machine_x: 0.0,
            machine_y: 0.0,
            theta: 0.0,
            rho: 0.0,
            speed: 500.0,
            last_port: None,
            calibration: Calibration::default(),
            homing: HomingState::default(),
            firmware: FirmwareInfo::default(),
            session: SessionRecord::default(),
        }
    }
}

impl MachineState {
    /// Set polar position.
    pub fn set_polar(&mut self, theta: f64, rho: f64) {
        self.theta = theta;
        self.rho = rho;
    }

    /// Set absolute machine position.
    pub fn set_machine(&mut self, x: f64, y: f64) {
        self.machine_x = x;
        self.machine_y = y;
    }
}

struct Inner {
    state: Mutex<MachineState>,
    path: Option<PathBuf>,
    save_lock: Mutex<()>,
}

/// Cloneable handle to the process-wide [`MachineState`].
///
/// Critical sections are short and never held across an `.await`.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

impl SharedState {
    /// State that is never written to disk.
    pub fn in_memory() -> Self {
        Self::with_state(MachineState::default(), None)
    }

    fn with_state(state: MachineState, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                path,
                save_lock: Mutex::new(()),
            }),
        }
    }

    /// Load from `path`, falling back to defaults when the file is missing or unreadable.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<MachineState>(&text) {
                Ok(state) => {
                    debug!(path = %path.display(), "Loaded machine state");
                    state
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt state file, using defaults");
                    MachineState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MachineState::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read state file, using defaults");
                MachineState::default()
            }
        };
        Self::with_state(state, Some(path))
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Clone of the whole record.
    pub fn snapshot(&self) -> MachineState {
        self.inner.state.lock().clone()
    }

    /// Read under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&MachineState) -> R) -> R {
        f(&self.inner.state.lock())
    }

    /// Mutate under the lock. Does not persist.
    pub fn update<R>(&self, f: impl FnOnce(&mut MachineState) -> R) -> R {
        f(&mut self.inner.state.lock())
    }

    /// Mutate, then persist.
    pub fn update_and_save<R>(&self, f: impl FnOnce(&mut MachineState) -> R) -> TableResult<R> {
        let result = self.update(f);
        self.save()?;
        Ok(result)
    }

    /// Write the record atomically (temp file + rename).
    pub fn save(&self) -> TableResult<()> {
        let Some(path) = self.inner.path.as_ref() else {
            return Ok(());
        };
        let _guard = self.inner.save_lock.lock();
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_flat_json() {
        let json = serde_json::to_value(MachineState::default()).unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("machine_x"));
        assert!(obj.contains_key("x_steps_per_mm"));
        assert!(obj.contains_key("sensor_homing_failed"));
        assert!(obj.contains_key("playlist_index"));
        assert!(!obj.contains_key("calibration"));
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let state = SharedState::load(&path);
        state
            .update_and_save(|s| {
                s.set_machine(12.5, -3.0);
                s.set_polar(1.0, 0.25);
                s.homing.sensor_homing_failed = true;
            })
            .unwrap();

        let reloaded = SharedState::load(&path).snapshot();
        assert_eq!(reloaded.machine_x, 12.5);
        assert_eq!(reloaded.rho, 0.25);
        assert!(reloaded.homing.sensor_homing_failed);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let state = SharedState::load(&path);
        assert_eq!(state.snapshot(), MachineState::default());
    }

    #[test]
    fn clear_run_keeps_flags() {
        let mut session = SessionRecord {
            current_file: Some("a.thr".into()),
            playlist: vec!["a.thr".into()],
            playlist_index: Some(0),
            stop_requested: true,
            ..Default::default()
        };
        session.clear_run();
        assert!(session.current_file.is_none());
        assert!(session.playlist.is_empty());
        assert!(session.stop_requested);
    }

    #[test]
    fn progress_percent() {
        let p = Progress {
            done: 25,
            total: 100,
            ..Default::default()
        };
        assert_eq!(p.percent(), 25.0);
        assert_eq!(Progress::default().percent(), 0.0);
    }
}
