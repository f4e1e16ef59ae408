//! Visual-feedback hook.
//!
//! LED and effect engines live outside this crate. The motion engine only
//! tells them whether the table is drawing.

/// Two-call activation interface consumed by the motion engine.
///
/// Implementations must be cheap and must not block; they are called from
/// the execution task.
pub trait VisualFeedback: Send + Sync {
    /// A pattern is being drawn.
    fn effect_playing(&self);

    /// The table is idle or paused.
    fn effect_idle(&self);
}

/// No visual feedback configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVisual;

impl VisualFeedback for NoVisual {
    fn effect_playing(&self) {}

    fn effect_idle(&self) {}
}
