//! Error types shared by every sand table crate.
//!
//! `TableError` is the primary error enum. Library code returns
//! [`TableResult`]; the CLI wraps it in `anyhow` at the edge.
//!
//! ## Error Hierarchy
//!
//! - **`Transport`**: failures on the wire. [`TransportError::DeviceGone`] is
//!   the distinguished "device vanished" class that callers never retry.
//! - **`Timeout` / `ResetFailed` / `Homing`**: protocol-level failures after
//!   the bounded retries of the connection manager are exhausted.
//! - **`Busy` / `NotRunning`**: immediate rejections from the execution engine.
//!   A busy request is never queued.
//! - **`Config` / `Io` / `Json`**: settings and state-file problems.

use thiserror::Error;

/// Convenience alias for results using the table error type.
pub type TableResult<T> = std::result::Result<T, TableError>;

/// Errors raised by a [`Transport`](crate::transport::Transport).
#[derive(Error, Debug)]
pub enum TransportError {
    /// The device disappeared (unplugged, socket closed, EOF).
    ///
    /// **Recovery Strategy**: none at this layer. The connection is marked dead
    /// and the operator must reconnect.
    #[error("Device no longer present: {0}")]
    DeviceGone(String),

    /// The handle was closed or never opened.
    #[error("Transport is closed")]
    Closed,

    /// Any other I/O failure. Callers may retry these.
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Classify an I/O error, promoting "device vanished" conditions.
    pub fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof => TransportError::DeviceGone(err.to_string()),
            // ENXIO / ENODEV / EIO are what a yanked USB serial adapter reports
            _ if matches!(err.raw_os_error(), Some(5) | Some(6) | Some(19)) => {
                TransportError::DeviceGone(err.to_string())
            }
            _ => TransportError::Io(err),
        }
    }

    /// True for the fatal, non-retryable class.
    pub fn is_device_gone(&self) -> bool {
        matches!(self, TransportError::DeviceGone(_))
    }
}

/// Why a homing attempt did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingFailure {
    /// Neither axis reported a sensor trigger. Sets the sticky failure flag.
    SensorsNotTriggered,
    /// A previous sensor homing failed and no operator homing has succeeded since.
    SensorFailureLatched,
    /// The overall homing ceiling elapsed.
    TimedOut,
    /// The controller never reported `Idle` after a homing move.
    NoIdleConfirmation,
}

impl std::fmt::Display for HomingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            HomingFailure::SensorsNotTriggered => "no homing sensor triggered",
            HomingFailure::SensorFailureLatched => {
                "sensor homing previously failed; operator homing required"
            }
            HomingFailure::TimedOut => "homing timed out",
            HomingFailure::NoIdleConfirmation => "controller did not return to idle",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for the sand table.
#[derive(Error, Debug)]
pub enum TableError {
    /// Settings could not be loaded or were rejected by validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem I/O (state file, pattern files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// State file or snapshot (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wire-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An operation needed a live connection and there is none.
    #[error("Not connected to the table controller")]
    NotConnected,

    /// No usable serial port or socket endpoint could be opened.
    #[error("No controller found: {0}")]
    NoDevice(String),

    /// A bounded wait elapsed without the expected response.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// The controller answered with something the protocol does not allow.
    #[error("Firmware error: {0}")]
    Firmware(String),

    /// Every soft-reset attempt finished without a restart banner.
    #[error("Soft reset failed after {attempts} attempts")]
    ResetFailed {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Controller stayed in alarm after unlock.
    #[error("Controller is in alarm state: {0}")]
    Alarm(String),

    /// Homing did not complete.
    #[error("Homing failed: {0}")]
    Homing(HomingFailure),

    /// Another session (or homing) holds the execution lock.
    #[error("Busy: {0}")]
    Busy(String),

    /// Pause/resume requested with no running session.
    #[error("No pattern is running")]
    NotRunning,

    /// Pattern file could not be read at all.
    #[error("Pattern error: {0}")]
    Pattern(String),

    /// A cancellable wait was interrupted by stop or skip.
    #[error("Cancelled")]
    Cancelled,
}

impl TableError {
    /// True when the underlying cause is a vanished device.
    pub fn is_device_gone(&self) -> bool {
        matches!(self, TableError::Transport(t) if t.is_device_gone())
    }
}

impl From<figment::Error> for TableError {
    fn from(err: figment::Error) -> Self {
        TableError::Config(err.to_string())
    }
}
