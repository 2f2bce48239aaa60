//! Sequential speech command dispatch over swappable drivers.
//!
//! The engine crate has three layers: the [`proxy::DriverProxy`] dispatch
//! core (FIFO command queue, busy tracking, run-loop integration), the
//! [`driver::Driver`] capability trait every synthesis backend implements,
//! and the concrete drivers under [`drivers`]. Callers queue operations and
//! drive one of the two run-loop modes; results come back as
//! [`speech_types::Notification`] events through an [`notify::EngineSink`].

pub mod driver;
pub mod drivers;
pub mod notify;
pub mod proxy;

pub use driver::{Driver, LoopCursor, PropertyError};
pub use drivers::{create_driver, DriverKind};
pub use notify::EngineSink;
pub use proxy::{DispatchError, DriverHandle, DriverProxy};
