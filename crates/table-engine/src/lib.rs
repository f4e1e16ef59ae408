//! Motion execution engine for the sand table.
//!
//! - [`pattern`]: `.thr` parsing and theta normalisation
//! - [`cache`]: mtime-validated pattern metadata
//! - [`mapping`]: polar to machine coordinates and [`move_polar`]
//! - [`control`]: pause gate plus stop and skip flags
//! - [`progress`]: points done and time remaining
//! - [`clear`]: clear-pattern selection
//! - [`playlist`]: pass building and run options
//! - [`status`]: snapshots, broadcaster, visual idle timer
//! - [`engine`]: [`MotionEngine`], the session owner

pub mod cache;
pub mod clear;
pub mod control;
pub mod engine;
pub mod mapping;
pub mod pattern;
pub mod playlist;
pub mod progress;
pub mod status;

pub use cache::{MetadataCache, PatternMetadata};
pub use clear::ClearMode;
pub use engine::{MotionEngine, SessionHandle, SessionOutcome};
pub use mapping::{move_polar, plan_move, MovePlan, SaveThrottle};
pub use pattern::{load_pattern, parse_coordinates, Coordinate};
pub use playlist::{PlaylistOptions, RunMode};
pub use status::{SessionPhase, StatusSnapshot};
