//! Core types for the sand table motion stack.
//!
//! - [`transport`]: line-oriented link to the controller (serial or socket)
//! - [`state`]: the shared, persisted machine record
//! - [`settings`]: Figment-backed configuration
//! - [`retry`]: bounded retry combinators
//! - [`visual`]: the two-call visual-feedback hook
//! - [`error`]: [`TableError`] and [`TransportError`]

pub mod error;
pub mod retry;
pub mod settings;
pub mod state;
pub mod table;
pub mod transport;
pub mod visual;

pub use error::{HomingFailure, TableError, TableResult, TransportError};
pub use settings::Settings;
pub use state::{MachineState, Progress, SharedState};
pub use table::{FirmwareKind, HomingMode, TableType};
pub use transport::{LineTransport, SerialTransport, SocketTransport, Transport, TransportKind};
pub use visual::{NoVisual, VisualFeedback};
