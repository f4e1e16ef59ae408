//! Connection manager for GRBL and FluidNC sand table controllers.
//!
//! - [`protocol`]: command constants and response parsers
//! - [`ports`]: serial port discovery and preference order
//! - [`manager`]: [`ConnectionManager`], the owner of the controller link
//! - [`homing`]: crash and sensor homing
//! - [`mock`]: simulated controller for tests and dry runs

pub mod homing;
pub mod manager;
pub mod mock;
pub mod ports;
pub mod protocol;

pub use homing::HomingTrigger;
pub use manager::{
    AlarmStatus, ConnectionManager, ConnectionState, HomingPhase, IdleOutcome, Timings,
};
pub use mock::{MockConfig, MockController, MockFirmware};
pub use ports::list_ports;
pub use protocol::StatusFrame;
