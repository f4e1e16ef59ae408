//! Session control: the pause gate and the stop / skip flags.
//!
//! All three live in one `watch` channel so every suspension point can wait
//! on "gate open, or stop raised" without polling.
//!
//! - **Gate**: `Open` lets the runner proceed, `Closed` blocks it. `pause`
//!   closes, `resume` opens.
//! - **Stop**: one-way; cleared only by [`SessionControl::begin`].
//! - **Skip**: one-shot; consumed by [`SessionControl::take_skip`].

use std::time::Duration;
use tokio::sync::watch;

/// Pause gate position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Gate {
    /// Runner may proceed.
    #[default]
    Open,
    /// Runner is held.
    Closed,
}

/// Current control flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlFlags {
    /// Pause gate.
    pub gate: Gate,
    /// Stop raised.
    pub stop: bool,
    /// Skip raised and not yet consumed.
    pub skip: bool,
}

/// How a cancellable wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The wait ran to completion (gate opened or timer expired).
    Finished,
    /// Stop was raised.
    Stopped,
    /// Skip was raised (and consumed).
    Skipped,
}

/// Shared control flags of the execution session.
#[derive(Debug)]
pub struct SessionControl {
    tx: watch::Sender<ControlFlags>,
}

impl Default for SessionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionControl {
    /// Open gate, no flags.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ControlFlags::default());
        Self { tx }
    }

    /// Current flags.
    pub fn flags(&self) -> ControlFlags {
        *self.tx.borrow()
    }

    /// Reset for a new session: gate open, stop and skip cleared.
    pub fn begin(&self) {
        self.tx.send_replace(ControlFlags::default());
    }

    /// Close the gate.
    pub fn pause(&self) {
        self.tx.send_modify(|f| f.gate = Gate::Closed);
    }

    /// Open the gate.
    pub fn resume(&self) {
        self.tx.send_modify(|f| f.gate = Gate::Open);
    }

    /// Raise stop.
    pub fn stop(&self) {
        self.tx.send_modify(|f| f.stop = true);
    }

    /// Raise skip.
    pub fn skip(&self) {
        self.tx.send_modify(|f| f.skip = true);
    }

    /// Gate closed.
    pub fn is_paused(&self) -> bool {
        self.flags().gate == Gate::Closed
    }

    /// Stop raised.
    pub fn stop_requested(&self) -> bool {
        self.flags().stop
    }

    /// Consume a pending skip.
    pub fn take_skip(&self) -> bool {
        let mut taken = false;
        self.tx.send_if_modified(|f| {
            taken = f.skip;
            f.skip = false;
            taken
        });
        taken
    }

    /// Block while the gate is closed. Returns early if stop is raised.
    pub async fn wait_while_paused(&self) -> WaitOutcome {
        let mut rx = self.tx.subscribe();
        let stopped = match rx.wait_for(|f| f.gate == Gate::Open || f.stop).await {
            Ok(flags) => flags.stop,
            Err(_) => true,
        };
        if stopped {
            WaitOutcome::Stopped
        } else {
            WaitOutcome::Finished
        }
    }

    /// Sleep for `duration` unless stop or skip is raised first.
    ///
    /// A skip that ends the sleep is consumed.
    pub async fn sleep_interruptible(&self, duration: Duration) -> WaitOutcome {
        let mut rx = self.tx.subscribe();
        let interrupted = tokio::select! {
            _ = tokio::time::sleep(duration) => None,
            flags = rx.wait_for(|f| f.stop || f.skip) => Some(flags.map(|f| f.stop).unwrap_or(true)),
        };
        match interrupted {
            None => WaitOutcome::Finished,
            Some(true) => WaitOutcome::Stopped,
            Some(false) => {
                self.take_skip();
                WaitOutcome::Skipped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn skip_is_one_shot() {
        let control = SessionControl::new();
        control.skip();
        assert!(control.take_skip());
        assert!(!control.take_skip());
    }

    #[test]
    fn begin_clears_stop() {
        let control = SessionControl::new();
        control.stop();
        control.pause();
        assert!(control.stop_requested());
        control.begin();
        assert_eq!(control.flags(), ControlFlags::default());
    }

    #[tokio::test(start_paused = true)]
    async fn paused_waiter_released_by_resume() {
        let control = Arc::new(SessionControl::new());
        control.pause();

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_while_paused().await })
        };
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!waiter.is_finished());

        control.resume();
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_waiter_released_by_stop() {
        let control = Arc::new(SessionControl::new());
        control.pause();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_while_paused().await })
        };
        control.stop();
        assert_eq!(waiter.await.unwrap(), WaitOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn interruptible_sleep() {
        let control = Arc::new(SessionControl::new());
        assert_eq!(
            control.sleep_interruptible(Duration::from_secs(3)).await,
            WaitOutcome::Finished
        );

        let sleeper = {
            let control = control.clone();
            tokio::spawn(async move { control.sleep_interruptible(Duration::from_secs(3600)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        control.skip();
        assert_eq!(sleeper.await.unwrap(), WaitOutcome::Skipped);
        assert!(!control.flags().skip);
    }
}
