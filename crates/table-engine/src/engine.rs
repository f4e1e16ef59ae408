//! The motion execution engine.
//!
//! One [`MotionEngine`] owns the execution lock. A pattern or playlist run
//! holds it for its whole lifetime; a second start request is rejected with
//! [`TableError::Busy`] and never queued. Operator homing takes the same lock.
//!
//! ## Session state machine
//!
//! ```text
//! Idle --start--> Running --pause--> Paused --resume--> Running
//!                    |                  |
//!                    +------stop--------+--> Stopping --> Idle
//! ```
//!
//! The runner checks, before every point and in this order: stop, skip,
//! pause. Session fields in the shared state are only written by the runner
//! while `stop_requested` is false, under the same lock [`MotionEngine::stop`]
//! uses to clear them, so a stop always leaves them empty.

use crate::cache::{MetadataCache, PatternMetadata};
use crate::clear::ClearSelector;
use crate::control::{Gate, SessionControl, WaitOutcome};
use crate::mapping::{move_polar, SaveThrottle};
use crate::pattern::{load_pattern, resolve_pattern_path, Coordinate};
use crate::playlist::{build_sequence, EntryKind, PlaylistOptions, RunMode};
use crate::progress::ProgressTracker;
use crate::status::{spawn_idle_timer, spawn_status_broadcaster, SessionPhase, StatusSnapshot};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use table_core::{MachineState, SharedState, TableError, TableResult, VisualFeedback};
use table_grbl::{ConnectionManager, HomingTrigger, IdleOutcome};
use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Upper bound of the idle confirmation after a pattern.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Status broadcast channel depth.
const STATUS_CAPACITY: usize = 16;

/// Moves between position saves while drawing.
const SAVE_EVERY_MOVES: usize = 25;

/// Longest gap between position saves while drawing.
const SAVE_INTERVAL: Duration = Duration::from_secs(5);

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Ran to the end.
    Completed,
    /// Ended by [`MotionEngine::stop`].
    Stopped,
}

/// Handle of a spawned session.
pub type SessionHandle = JoinHandle<TableResult<SessionOutcome>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternOutcome {
    Completed,
    Skipped,
    Stopped,
}

struct Inner {
    manager: Arc<ConnectionManager>,
    control: SessionControl,
    exec: Arc<Mutex<()>>,
    visual: Arc<dyn VisualFeedback>,
    cache: MetadataCache,
    status_tx: broadcast::Sender<StatusSnapshot>,
    running: watch::Sender<bool>,
}

/// Cloneable handle to the execution engine.
#[derive(Clone)]
pub struct MotionEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MotionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionEngine")
            .field("phase", &self.phase())
            .field("manager", &self.inner.manager)
            .finish_non_exhaustive()
    }
}

impl MotionEngine {
    /// Engine driving `manager`. The configured pattern speed is copied into
    /// the machine state.
    pub fn new(manager: Arc<ConnectionManager>, visual: Arc<dyn VisualFeedback>) -> Self {
        let speed = manager.settings().table.speed;
        manager.state().update(|s| s.speed = speed);
        let (status_tx, _) = broadcast::channel(STATUS_CAPACITY);
        let (running, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                manager,
                control: SessionControl::new(),
                exec: Arc::new(Mutex::new(())),
                visual,
                cache: MetadataCache::new(),
                status_tx,
                running,
            }),
        }
    }

    /// The connection manager.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.inner.manager
    }

    fn state(&self) -> &SharedState {
        self.inner.manager.state()
    }

    /// Pattern metadata cache.
    pub fn cache(&self) -> &MetadataCache {
        &self.inner.cache
    }

    /// A session is active.
    pub fn is_running(&self) -> bool {
        *self.inner.running.borrow()
    }

    /// Current session phase.
    pub fn phase(&self) -> SessionPhase {
        if !self.is_running() {
            return SessionPhase::Idle;
        }
        let control = &self.inner.control;
        if control.stop_requested() {
            SessionPhase::Stopping
        } else if control.is_paused() {
            SessionPhase::Paused
        } else {
            SessionPhase::Running
        }
    }

    /// Snapshot of position, session and link.
    pub fn status(&self) -> StatusSnapshot {
        let manager = &self.inner.manager;
        StatusSnapshot::from_state(
            &self.state().snapshot(),
            self.phase(),
            manager.connection_state(),
            manager.homing_phase(),
        )
    }

    /// Receive periodic snapshots once [`spawn_background`](Self::spawn_background) runs.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.inner.status_tx.subscribe()
    }

    /// Start the status broadcaster and, when configured, the visual idle timer.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let visual = &self.inner.manager.settings().visual;
        let engine = self.clone();
        let mut tasks = vec![spawn_status_broadcaster(
            move || engine.status(),
            self.inner.status_tx.clone(),
            Duration::from_millis(visual.status_interval_ms.max(50)),
        )];
        if visual.idle_timeout_secs > 0 {
            tasks.push(spawn_idle_timer(
                self.inner.running.subscribe(),
                self.inner.visual.clone(),
                Duration::from_secs(visual.idle_timeout_secs),
            ));
        }
        tasks
    }

    // =========================================================================
    // Session entry points
    // =========================================================================

    /// Draw one pattern file. Returns as soon as the session is spawned.
    #[instrument(skip(self), err)]
    pub fn start_pattern(&self, name: &str) -> TableResult<SessionHandle> {
        let guard = self.claim("a pattern is already running")?;
        let path = resolve_pattern_path(&self.inner.manager.settings().patterns.dir, name);
        self.begin_session();

        let engine = self.clone();
        Ok(tokio::spawn(async move {
            let _guard = guard;
            let result = engine.run_single(&path).await;
            engine.finish_session(&result);
            result
        }))
    }

    /// Run a playlist. Returns as soon as the session is spawned.
    #[instrument(skip(self, options), fields(name = %options.name, mode = ?options.run_mode), err)]
    pub fn start_playlist(&self, options: PlaylistOptions) -> TableResult<SessionHandle> {
        if options.files.is_empty() {
            return Err(TableError::Pattern(format!(
                "playlist '{}' is empty",
                options.name
            )));
        }
        let guard = self.claim("a pattern is already running")?;
        self.begin_session();

        let engine = self.clone();
        Ok(tokio::spawn(async move {
            let _guard = guard;
            let result = engine.run_playlist(&options).await;
            engine.finish_session(&result);
            result
        }))
    }

    /// Operator homing. Rejected with `Busy` while a session runs.
    pub async fn home(&self) -> TableResult<()> {
        let _guard = self.claim("cannot home while a pattern is running")?;
        self.inner.manager.home(HomingTrigger::Operator).await
    }

    fn claim(&self, reason: &str) -> TableResult<OwnedMutexGuard<()>> {
        self.inner
            .exec
            .clone()
            .try_lock_owned()
            .map_err(|_| TableError::Busy(reason.to_string()))
    }

    fn begin_session(&self) {
        self.inner.control.begin();
        self.state().update(|s| {
            s.session.clear_run();
            s.session.paused = false;
            s.session.stop_requested = false;
            s.session.skip_requested = false;
        });
        self.inner.running.send_replace(true);
    }

    fn finish_session(&self, result: &TableResult<SessionOutcome>) {
        match result {
            Ok(outcome) => info!(?outcome, "Session finished"),
            Err(e) => warn!(error = %e, "Session aborted"),
        }
        self.state().update(|s| {
            s.session.clear_run();
            s.session.paused = false;
            s.session.skip_requested = false;
        });
        if let Err(e) = self.state().save() {
            warn!(error = %e, "Failed to persist state after session");
        }
        self.inner.running.send_replace(false);
        if !matches!(result, Ok(SessionOutcome::Stopped)) {
            self.inner.visual.effect_idle();
        }
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Close the pause gate. The runner halts before its next point.
    pub fn pause(&self) -> TableResult<()> {
        self.require_running()?;
        self.inner.control.pause();
        self.state().update(|s| s.session.paused = true);
        info!("Pause requested");
        Ok(())
    }

    /// Open the pause gate.
    pub fn resume(&self) -> TableResult<()> {
        self.require_running()?;
        self.inner.control.resume();
        self.state().update(|s| s.session.paused = false);
        info!("Resume requested");
        Ok(())
    }

    /// Abort the pattern being drawn; a playlist continues with the next entry.
    pub fn skip(&self) -> TableResult<()> {
        self.require_running()?;
        self.inner.control.skip();
        self.state().update(|s| s.session.skip_requested = true);
        info!("Skip requested");
        Ok(())
    }

    /// Stop the session. Succeeds whether or not one is running; the
    /// session fields are empty when this returns.
    pub fn stop(&self) -> TableResult<()> {
        let was_running = self.is_running();
        self.inner.control.stop();
        self.state().update(|s| {
            s.session.stop_requested = true;
            s.session.paused = false;
            s.session.skip_requested = false;
            s.session.clear_run();
        });
        self.state().save()?;
        if was_running {
            info!("Stop requested");
            self.inner.visual.effect_idle();
        }
        Ok(())
    }

    fn require_running(&self) -> TableResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(TableError::NotRunning)
        }
    }

    // =========================================================================
    // Runners
    // =========================================================================

    async fn run_single(&self, path: &Path) -> TableResult<SessionOutcome> {
        let coords = load_pattern(path).await?;
        let label = path.display().to_string();
        self.publish(|s| s.session.current_file = Some(label));
        self.inner.visual.effect_playing();

        let speed = self.state().read(|s| s.speed);
        match self.run_pattern(&coords, speed).await? {
            PatternOutcome::Stopped => Ok(SessionOutcome::Stopped),
            PatternOutcome::Skipped => Ok(SessionOutcome::Completed),
            PatternOutcome::Completed => {
                self.settle().await?;
                Ok(SessionOutcome::Completed)
            }
        }
    }

    async fn run_playlist(&self, options: &PlaylistOptions) -> TableResult<SessionOutcome> {
        let settings = self.inner.manager.settings();
        let mode = options.run_mode;
        let name = options.name.clone();
        self.publish(|s| {
            s.session.playlist_name = Some(name);
            s.session.playlist_mode = Some(mode.as_str().to_string());
        });
        self.inner.visual.effect_playing();

        let pattern_speed = self.state().read(|s| s.speed);
        let clear_speed = settings.table.clear_speed.unwrap_or(pattern_speed);

        let mut pass = 0usize;
        loop {
            pass += 1;
            let table_type = self.state().read(|s| s.calibration.table_type);
            let selector = ClearSelector::new(&settings.patterns, table_type, &self.inner.cache);
            let sequence = build_sequence(options, &settings.patterns.dir, &selector).await;
            let labels: Vec<String> = sequence.iter().map(|e| e.label()).collect();
            debug!(pass, entries = labels.len(), "Playlist pass built");
            self.publish(|s| s.session.playlist = labels);

            let mut drawn = 0usize;
            for (index, entry) in sequence.iter().enumerate() {
                if self.inner.control.stop_requested() {
                    return Ok(SessionOutcome::Stopped);
                }
                let label = entry.label();
                self.publish(|s| {
                    s.session.playlist_index = Some(index);
                    s.session.current_file = Some(label);
                    s.session.progress = None;
                });

                let coords = match self.load_entry(&entry.path).await {
                    Ok(coords) => coords,
                    Err(e) => {
                        warn!(path = %entry.path.display(), error = %e, "Skipping unreadable pattern");
                        continue;
                    }
                };
                drawn += 1;

                let speed = match entry.kind {
                    EntryKind::Clear => clear_speed,
                    EntryKind::Main => pattern_speed,
                };
                info!(index, path = %entry.path.display(), kind = ?entry.kind, "Drawing");
                match self.run_pattern(&coords, speed).await? {
                    PatternOutcome::Stopped => return Ok(SessionOutcome::Stopped),
                    PatternOutcome::Skipped => info!(index, "Pattern skipped"),
                    PatternOutcome::Completed => {
                        self.settle().await?;
                        // A skip raised during the last point or the settle
                        // belongs to this pattern.
                        if self.consume_skip() {
                            debug!(index, "Skip arrived after the last point");
                        }
                    }
                }

                let more = index + 1 < sequence.len() || mode == RunMode::Indefinite;
                if entry.kind == EntryKind::Main && more && !options.pause_time.is_zero() {
                    debug!(pause = ?options.pause_time, "Pause between patterns");
                    match self.inner.control.sleep_interruptible(options.pause_time).await {
                        WaitOutcome::Stopped => return Ok(SessionOutcome::Stopped),
                        WaitOutcome::Skipped => {
                            self.state().update(|s| s.session.skip_requested = false);
                            info!("Pause between patterns skipped");
                        }
                        WaitOutcome::Finished => {}
                    }
                }
            }

            if drawn == 0 {
                return Err(TableError::Pattern(format!(
                    "playlist '{}' has no readable pattern",
                    options.name
                )));
            }
            if mode == RunMode::Single {
                return Ok(SessionOutcome::Completed);
            }
        }
    }

    async fn load_entry(&self, path: &Path) -> TableResult<Vec<Coordinate>> {
        let coords = load_pattern(path).await?;
        if let Ok(modified) = tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            self.inner
                .cache
                .remember(path, modified, PatternMetadata::from_points(&coords));
        }
        Ok(coords)
    }

    /// Draw `coords` point by point, honouring stop, skip and pause.
    async fn run_pattern(&self, coords: &[Coordinate], speed: f64) -> TableResult<PatternOutcome> {
        let control = &self.inner.control;
        let mut tracker = ProgressTracker::new(coords.len());
        let mut throttle = SaveThrottle::new(SAVE_EVERY_MOVES, SAVE_INTERVAL);
        self.publish_progress(&tracker);

        for (index, &(theta, rho)) in coords.iter().enumerate() {
            loop {
                let flags = control.flags();
                if flags.stop {
                    debug!(index, "Stop observed");
                    return Ok(PatternOutcome::Stopped);
                }
                if self.consume_skip() {
                    return Ok(PatternOutcome::Skipped);
                }
                if flags.gate == Gate::Closed {
                    if self.hold(&mut tracker).await == WaitOutcome::Stopped {
                        return Ok(PatternOutcome::Stopped);
                    }
                    continue;
                }
                break;
            }

            move_polar(&self.inner.manager, theta, rho, speed).await?;
            if throttle.record_move() {
                if let Err(e) = self.state().save() {
                    warn!(error = %e, "Failed to persist position");
                }
            }
            tracker.record(index + 1);
            self.publish_progress(&tracker);
        }
        Ok(PatternOutcome::Completed)
    }

    /// Take a pending skip and clear its persisted flag.
    fn consume_skip(&self) -> bool {
        let taken = self.inner.control.take_skip();
        if taken {
            self.state().update(|s| s.session.skip_requested = false);
        }
        taken
    }

    /// Wait at the closed gate with the idle visual asserted.
    async fn hold(&self, tracker: &mut ProgressTracker) -> WaitOutcome {
        info!("Paused");
        self.inner.visual.effect_idle();
        if let Err(e) = self.state().update_and_save(|s| s.session.paused = true) {
            warn!(error = %e, "Failed to persist paused state");
        }
        let outcome = self.inner.control.wait_while_paused().await;
        if outcome == WaitOutcome::Finished {
            self.state().update(|s| s.session.paused = false);
            tracker.restart_window();
            self.inner.visual.effect_playing();
            info!("Resumed");
        }
        outcome
    }

    /// Bounded wait for the controller to finish buffered motion.
    async fn settle(&self) -> TableResult<()> {
        let control = &self.inner.control;
        let outcome = self
            .inner
            .manager
            .wait_until_idle_bounded(SETTLE_TIMEOUT, || control.stop_requested())
            .await?;
        if outcome == IdleOutcome::TimedOut {
            warn!(timeout = ?SETTLE_TIMEOUT, "Controller did not report idle after pattern");
        }
        Ok(())
    }

    /// Apply a session-field update unless stop has been raised.
    fn publish(&self, f: impl FnOnce(&mut MachineState)) {
        self.state().update(|s| {
            if !s.session.stop_requested {
                f(s);
            }
        });
    }

    fn publish_progress(&self, tracker: &ProgressTracker) {
        let progress = tracker.snapshot();
        self.publish(|s| s.session.progress = Some(progress));
    }
}
