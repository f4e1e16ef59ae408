//! Polar to machine coordinate mapping.
//!
//! The angular axis (X) turns the arm; the radial axis (Y) is geared through
//! the angular drive, so turning the arm also moves the radius. Each move is
//! corrected for that coupling:
//!
//! ```text
//! dx = dtheta * 100 / (2 * pi * X_SCALE)
//! dy = drho * 100 / Y_SCALE
//! c  = dx * (x_total * X_SCALE) / (gear_ratio * y_total * Y_SCALE)
//! dy = dy - c   (compact tables)
//! dy = dy + c   (standard tables)
//! ```
//!
//! where `x_total = x_steps_per_mm * 100 / X_SCALE` and likewise for Y.

use serde::Serialize;
use std::f64::consts::PI;
use std::time::Duration;
use table_core::{MachineState, TableResult};
use table_grbl::ConnectionManager;
use tokio::time::Instant;
use tracing::trace;

/// Angular-to-linear scaling factor.
pub const X_SCALE: f64 = 2.0;
/// Radial scaling factor.
pub const Y_SCALE: f64 = 5.0;

/// Absolute machine target for one polar point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MovePlan {
    /// Target polar angle.
    pub theta: f64,
    /// Target normalised radius.
    pub rho: f64,
    /// Absolute machine X, unrounded.
    pub x: f64,
    /// Absolute machine Y, unrounded.
    pub y: f64,
}

/// Compute the machine target for `(theta, rho)` from the current state.
///
/// Pure: identical inputs always yield identical output.
pub fn plan_move(state: &MachineState, theta: f64, rho: f64) -> MovePlan {
    let calibration = &state.calibration;
    let dx = (theta - state.theta) * 100.0 / (2.0 * PI * X_SCALE);
    let mut dy = (rho - state.rho) * 100.0 / Y_SCALE;

    let x_total = calibration.x_steps_per_mm * 100.0 / X_SCALE;
    let y_total = calibration.y_steps_per_mm * 100.0 / Y_SCALE;
    let correction = dx * (x_total * X_SCALE) / (calibration.gear_ratio * y_total * Y_SCALE);
    let correction = if correction.is_finite() { correction } else { 0.0 };
    if calibration.table_type.is_compact() {
        dy -= correction;
    } else {
        dy += correction;
    }

    MovePlan {
        theta,
        rho,
        x: state.machine_x + dx,
        y: state.machine_y + dy,
    }
}

/// Move the ball to `(theta, rho)` at `speed`.
///
/// Shared state is updated only after the controller acknowledged the move.
pub async fn move_polar(
    manager: &ConnectionManager,
    theta: f64,
    rho: f64,
    speed: f64,
) -> TableResult<MovePlan> {
    let plan = manager.state().read(|s| plan_move(s, theta, rho));
    manager.send_move(plan.x, plan.y, speed).await?;
    manager.state().update(|s| {
        s.set_machine(plan.x, plan.y);
        s.set_polar(plan.theta, plan.rho);
    });
    trace!(theta, rho, x = plan.x, y = plan.y, "Moved");
    Ok(plan)
}

/// Decides when a running pattern persists its position: every `every`
/// moves, or once `interval` has passed since the last save.
#[derive(Debug)]
pub struct SaveThrottle {
    every: usize,
    interval: Duration,
    since_save: usize,
    last_save: Instant,
}

impl SaveThrottle {
    /// Throttle starting now.
    pub fn new(every: usize, interval: Duration) -> Self {
        Self {
            every: every.max(1),
            interval,
            since_save: 0,
            last_save: Instant::now(),
        }
    }

    /// Count one acknowledged move. True when a save is due; the counters
    /// restart in that case.
    pub fn record_move(&mut self) -> bool {
        self.since_save += 1;
        if self.since_save >= self.every || self.last_save.elapsed() >= self.interval {
            self.since_save = 0;
            self.last_save = Instant::now();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use table_core::TableType;

    fn standard() -> MachineState {
        MachineState::default()
    }

    #[test]
    fn plan_is_pure() {
        let mut state = standard();
        state.set_machine(12.0, 3.0);
        state.set_polar(0.3, 0.4);
        let a = plan_move(&state, 1.1, 0.9);
        let b = plan_move(&state, 1.1, 0.9);
        assert_eq!(a, b);
        assert_eq!(state.machine_x, 12.0);
    }

    #[test]
    fn radial_only_move() {
        let plan = plan_move(&standard(), 0.0, 1.0);
        assert_eq!(plan.x, 0.0);
        assert!((plan.y - 20.0).abs() < 1e-12);
    }

    #[test]
    fn full_turn_is_fifty_mm_with_coupling() {
        let state = standard();
        let plan = plan_move(&state, 2.0 * PI, 0.0);
        assert!((plan.x - 50.0).abs() < 1e-9);

        let x_total = 320.0 * 100.0 / X_SCALE;
        let y_total = 287.0 * 100.0 / Y_SCALE;
        let expected = 50.0 * (x_total * X_SCALE) / (10.0 * y_total * Y_SCALE);
        assert!((plan.y - expected).abs() < 1e-9);
    }

    #[test]
    fn compact_tables_subtract_correction() {
        let mut state = standard();
        state.calibration.table_type = TableType::DuneWeaverMini;
        state.calibration.x_steps_per_mm = 256.0;
        state.calibration.y_steps_per_mm = 180.0;
        state.calibration.gear_ratio = 6.25;

        let plan = plan_move(&state, PI, 0.0);
        assert!(plan.y < 0.0);

        let standard_plan = plan_move(&standard(), PI, 0.0);
        assert!(standard_plan.y > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_by_count_and_time() {
        let mut throttle = SaveThrottle::new(3, Duration::from_secs(5));
        assert!(!throttle.record_move());
        assert!(!throttle.record_move());
        assert!(throttle.record_move());

        assert!(!throttle.record_move());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(throttle.record_move());
        assert!(!throttle.record_move());
    }
}
