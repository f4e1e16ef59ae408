//! Pattern and playlist sessions against the simulated controller.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use table_core::{Settings, SharedState, TableError, VisualFeedback};
use table_engine::{
    ClearMode, MotionEngine, PlaylistOptions, RunMode, SessionOutcome, SessionPhase,
};
use table_grbl::{ConnectionManager, MockConfig, MockController};
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

#[derive(Default)]
struct RecordingVisual {
    events: Mutex<Vec<&'static str>>,
}

impl RecordingVisual {
    fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }
}

impl VisualFeedback for RecordingVisual {
    fn effect_playing(&self) {
        self.events.lock().push("playing");
    }

    fn effect_idle(&self) {
        self.events.lock().push("idle");
    }
}

struct Rig {
    engine: MotionEngine,
    mock: MockController,
    state: SharedState,
    visual: Arc<RecordingVisual>,
    state_path: PathBuf,
    _dir: TempDir,
}

fn write_pattern(dir: &Path, name: &str, points: usize) {
    let body: String = (0..points)
        .map(|i| format!("{:.4} {:.4}\n", i as f64 * 0.1, i as f64 / points as f64))
        .collect();
    std::fs::write(dir.join(name), body).unwrap();
}

fn slow_mock() -> MockConfig {
    MockConfig {
        move_delay: Duration::from_millis(100),
        ..MockConfig::grbl()
    }
}

async fn rig(patterns: &[(&str, usize)]) -> Rig {
    rig_with(patterns, slow_mock(), |_| {}).await
}

async fn rig_with(
    patterns: &[(&str, usize)],
    config: MockConfig,
    tweak: impl FnOnce(&mut Settings),
) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    for (name, points) in patterns {
        write_pattern(dir.path(), name, *points);
    }
    let mut settings = Settings::default();
    settings.connection.auto_home = false;
    settings.patterns.dir = dir.path().to_path_buf();
    tweak(&mut settings);

    let state_path = dir.path().join("state.json");
    let state = SharedState::load(&state_path);
    let (transport, mock) = MockController::spawn(config, state.clone());
    let manager = Arc::new(ConnectionManager::new(settings, state.clone()));
    manager.attach(Box::new(transport)).await;

    let visual = Arc::new(RecordingVisual::default());
    let engine = MotionEngine::new(manager, visual.clone());
    Rig {
        engine,
        mock,
        state,
        visual,
        state_path,
        _dir: dir,
    }
}

fn playlist(files: &[&str], run_mode: RunMode) -> PlaylistOptions {
    PlaylistOptions {
        name: "test".to_string(),
        files: files.iter().map(|f| f.to_string()).collect(),
        pause_time: Duration::ZERO,
        clear_mode: ClearMode::None,
        run_mode,
        shuffle: false,
    }
}

fn assert_session_empty(state: &SharedState) {
    let session = state.read(|s| s.session.clone());
    assert!(session.current_file.is_none());
    assert!(session.progress.is_none());
    assert!(session.playlist.is_empty());
    assert!(session.playlist_index.is_none());
    assert!(session.playlist_name.is_none());
    assert!(session.playlist_mode.is_none());
}

#[tokio::test(start_paused = true)]
async fn single_pattern_runs_to_completion() {
    let rig = rig(&[("spiral.thr", 5)]).await;
    let handle = rig.engine.start_pattern("spiral.thr").unwrap();
    assert!(rig.engine.is_running());

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome, SessionOutcome::Completed);
    assert_eq!(rig.mock.moves().len(), 5);
    assert_eq!(rig.engine.phase(), SessionPhase::Idle);
    assert_session_empty(&rig.state);

    let (theta, rho) = rig.state.read(|s| (s.theta, s.rho));
    assert!((theta - 0.4).abs() < 1e-9);
    assert!((rho - 0.8).abs() < 1e-9);
    assert_eq!(rig.visual.events(), vec!["playing", "idle"]);
}

#[tokio::test(start_paused = true)]
async fn second_start_is_rejected_without_side_effects() {
    let rig = rig(&[("a.thr", 30), ("b.thr", 3)]).await;
    let handle = rig.engine.start_pattern("a.thr").unwrap();
    sleep(Duration::from_millis(350)).await;

    let before = rig.state.read(|s| s.session.clone());
    assert!(before.current_file.as_deref().unwrap().ends_with("a.thr"));

    assert!(matches!(
        rig.engine.start_pattern("b.thr"),
        Err(TableError::Busy(_))
    ));
    assert!(matches!(
        rig.engine.start_playlist(playlist(&["b.thr"], RunMode::Single)),
        Err(TableError::Busy(_))
    ));
    assert!(matches!(rig.engine.home().await, Err(TableError::Busy(_))));
    assert_eq!(rig.state.read(|s| s.session.clone()), before);

    rig.engine.stop().unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), SessionOutcome::Stopped);
}

#[tokio::test(start_paused = true)]
async fn control_requires_a_session() {
    let rig = rig(&[]).await;
    assert!(matches!(rig.engine.pause(), Err(TableError::NotRunning)));
    assert!(matches!(rig.engine.resume(), Err(TableError::NotRunning)));
    assert!(matches!(rig.engine.skip(), Err(TableError::NotRunning)));
    rig.engine.stop().unwrap();
    assert_session_empty(&rig.state);
}

#[tokio::test(start_paused = true)]
async fn stop_clears_session_while_running_or_paused() {
    let rig = rig(&[("long.thr", 100)]).await;

    let handle = rig.engine.start_pattern("long.thr").unwrap();
    sleep(Duration::from_millis(350)).await;
    assert!(rig.state.read(|s| s.session.progress.is_some()));
    rig.engine.stop().unwrap();
    assert_session_empty(&rig.state);
    assert_eq!(handle.await.unwrap().unwrap(), SessionOutcome::Stopped);
    assert_session_empty(&rig.state);

    let handle = rig.engine.start_pattern("long.thr").unwrap();
    sleep(Duration::from_millis(350)).await;
    rig.engine.pause().unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(rig.engine.phase(), SessionPhase::Paused);
    rig.engine.stop().unwrap();
    assert_session_empty(&rig.state);
    assert!(!rig.state.read(|s| s.session.paused));
    assert_eq!(handle.await.unwrap().unwrap(), SessionOutcome::Stopped);
    assert_eq!(rig.engine.phase(), SessionPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn pause_freezes_motion_until_resume() {
    let rig = rig(&[("star.thr", 20)]).await;
    let handle = rig.engine.start_pattern("star.thr").unwrap();
    sleep(Duration::from_millis(350)).await;

    rig.engine.pause().unwrap();
    sleep(Duration::from_millis(200)).await;
    let frozen = rig.mock.moves().len();
    let position = rig.state.read(|s| (s.theta, s.rho));
    assert!(frozen < 20);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(rig.mock.moves().len(), frozen);
    assert_eq!(rig.state.read(|s| (s.theta, s.rho)), position);
    assert!(rig.state.read(|s| s.session.paused));

    rig.engine.resume().unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), SessionOutcome::Completed);
    assert_eq!(rig.mock.moves().len(), 20);
    assert_eq!(rig.visual.events(), vec!["playing", "idle", "playing", "idle"]);
}

#[tokio::test(start_paused = true)]
async fn indefinite_playlist_cycles_until_stopped() {
    let rig = rig(&[("a.thr", 3), ("b.thr", 3)]).await;
    let handle = rig
        .engine
        .start_playlist(playlist(&["a.thr", "b.thr"], RunMode::Indefinite))
        .unwrap();

    let mut seen: Vec<usize> = Vec::new();
    for _ in 0..400 {
        sleep(Duration::from_millis(20)).await;
        if let Some(index) = rig.state.read(|s| s.session.playlist_index) {
            if seen.last() != Some(&index) {
                seen.push(index);
            }
        }
        if seen.len() >= 5 {
            break;
        }
    }
    assert_eq!(&seen[..5], &[0, 1, 0, 1, 0]);
    assert!(!handle.is_finished());
    assert_eq!(
        rig.state.read(|s| s.session.playlist_mode.clone()).as_deref(),
        Some("indefinite")
    );

    rig.engine.stop().unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), SessionOutcome::Stopped);
    assert_session_empty(&rig.state);
}

#[tokio::test(start_paused = true)]
async fn skip_moves_playlist_to_next_pattern() {
    let rig = rig(&[("long.thr", 50), ("short.thr", 2)]).await;
    let handle = rig
        .engine
        .start_playlist(playlist(&["long.thr", "short.thr"], RunMode::Single))
        .unwrap();
    sleep(Duration::from_millis(350)).await;
    assert_eq!(rig.state.read(|s| s.session.playlist_index), Some(0));

    rig.engine.skip().unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), SessionOutcome::Completed);

    let moves = rig.mock.moves().len();
    assert!(moves < 52, "long pattern was not cut short ({} moves)", moves);
    assert!(moves >= 3);
    assert!(!rig.state.read(|s| s.session.skip_requested));
    assert_session_empty(&rig.state);
}

#[tokio::test(start_paused = true)]
async fn missing_pattern_fails_the_session() {
    let rig = rig(&[]).await;
    let handle = rig.engine.start_pattern("nowhere.thr").unwrap();
    assert!(matches!(
        handle.await.unwrap(),
        Err(TableError::Pattern(_))
    ));
    assert!(!rig.engine.is_running());
    assert!(matches!(
        rig.engine.start_playlist(playlist(&[], RunMode::Single)),
        Err(TableError::Pattern(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn skip_during_last_point_does_not_drop_next_pattern() {
    let rig = rig(&[("one.thr", 1), ("five.thr", 5)]).await;
    let handle = rig
        .engine
        .start_playlist(playlist(&["one.thr", "five.thr"], RunMode::Single))
        .unwrap();

    // one.thr's only move is still waiting for its ok.
    sleep(Duration::from_millis(50)).await;
    rig.engine.skip().unwrap();

    assert_eq!(handle.await.unwrap().unwrap(), SessionOutcome::Completed);
    assert_eq!(rig.mock.moves().len(), 6);
    assert!(!rig.state.read(|s| s.session.skip_requested));
}

#[tokio::test(start_paused = true)]
async fn clear_patterns_interleave_at_clear_speed() {
    let rig = rig_with(
        &[("a.thr", 2), ("b.thr", 2), ("clear_from_in.thr", 3)],
        slow_mock(),
        |settings| {
            settings.table.speed = 500.0;
            settings.table.clear_speed = Some(900.0);
        },
    )
    .await;
    let options = PlaylistOptions {
        clear_mode: ClearMode::ClearFromIn,
        ..playlist(&["a.thr", "b.thr"], RunMode::Single)
    };
    let handle = rig.engine.start_playlist(options).unwrap();

    sleep(Duration::from_millis(50)).await;
    let labels = rig.state.read(|s| s.session.playlist.clone());
    assert_eq!(labels.len(), 4);
    assert!(labels[0].contains("clear_from_in"));
    assert!(labels[1].ends_with("a.thr"));
    assert!(labels[2].contains("clear_from_in"));
    assert!(labels[3].ends_with("b.thr"));

    assert_eq!(handle.await.unwrap().unwrap(), SessionOutcome::Completed);
    assert_eq!(
        rig.mock.feeds(),
        vec![900.0, 900.0, 900.0, 500.0, 500.0, 900.0, 900.0, 900.0, 500.0, 500.0]
    );
}

#[tokio::test(start_paused = true)]
async fn pause_between_patterns_follows_main_patterns_only() {
    let config = MockConfig {
        busy_polls: 2,
        ..slow_mock()
    };
    let rig = rig_with(
        &[("a.thr", 2), ("b.thr", 2), ("clear_from_in.thr", 3)],
        config,
        |_| {},
    )
    .await;
    let options = PlaylistOptions {
        clear_mode: ClearMode::ClearFromIn,
        pause_time: Duration::from_secs(10),
        ..playlist(&["a.thr", "b.thr"], RunMode::Single)
    };
    let started = Instant::now();
    let handle = rig.engine.start_playlist(options).unwrap();

    sleep(Duration::from_secs(3)).await;
    assert_eq!(rig.mock.moves().len(), 5);
    sleep(Duration::from_secs(6)).await;
    assert_eq!(rig.mock.moves().len(), 5);
    assert_eq!(rig.engine.phase(), SessionPhase::Running);

    assert_eq!(handle.await.unwrap().unwrap(), SessionOutcome::Completed);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(10), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(15), "{:?}", elapsed);
    assert_eq!(rig.mock.moves().len(), 10);
    // Every settle after a pattern polled through two Run frames.
    assert_eq!(rig.mock.run_reports(), 8);
}

#[tokio::test(start_paused = true)]
async fn between_pattern_pause_yields_to_skip_and_stop() {
    let waiting = || PlaylistOptions {
        pause_time: Duration::from_secs(3600),
        ..playlist(&["a.thr", "b.thr"], RunMode::Single)
    };

    let skipped = rig(&[("a.thr", 2), ("b.thr", 2)]).await;
    let handle = skipped.engine.start_playlist(waiting()).unwrap();
    sleep(Duration::from_secs(2)).await;
    assert_eq!(skipped.mock.moves().len(), 2);
    skipped.engine.skip().unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), SessionOutcome::Completed);
    assert_eq!(skipped.mock.moves().len(), 4);
    assert!(!skipped.state.read(|s| s.session.skip_requested));

    let stopped = rig(&[("a.thr", 2), ("b.thr", 2)]).await;
    let handle = stopped.engine.start_playlist(waiting()).unwrap();
    sleep(Duration::from_secs(2)).await;
    stopped.engine.stop().unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), SessionOutcome::Stopped);
    assert_eq!(stopped.mock.moves().len(), 2);
    assert_session_empty(&stopped.state);
}

#[tokio::test(start_paused = true)]
async fn position_is_persisted_while_drawing() {
    let rig = rig(&[("long.thr", 60)]).await;
    let handle = rig.engine.start_pattern("long.thr").unwrap();

    sleep(Duration::from_millis(3200)).await;
    let persisted = SharedState::load(&rig.state_path).snapshot();
    assert!((persisted.theta - 2.4).abs() < 1e-9, "theta {}", persisted.theta);
    assert!((persisted.rho - 0.4).abs() < 1e-9, "rho {}", persisted.rho);

    rig.engine.stop().unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), SessionOutcome::Stopped);
}
