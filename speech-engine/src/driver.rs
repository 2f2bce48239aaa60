//! Driver abstraction layer.
//!
//! A driver wraps one speech synthesis backend behind a common capability
//! trait, allowing different implementations (eSpeak, in-process dummy) to be
//! used interchangeably by the dispatch proxy.

use std::path::Path;

use anyhow::Result;
use thiserror::Error;

use speech_types::PropertyValue;

/// Errors from synchronous property access.
#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("unknown property \"{0}\"")]
    UnknownProperty(String),
    #[error("unknown voice \"{0}\"")]
    UnknownVoice(String),
    #[error("invalid value for \"{key}\": {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("property \"{0}\" is read-only")]
    ReadOnly(String),
}

/// One step of a driver's native event source.
///
/// Obtained from [`Driver::cursor`] for the externally driven run-loop mode.
/// Each `step` performs a fixed, small unit of work (typically processing one
/// pending event) and returns without blocking.
pub trait LoopCursor: Send {
    /// Advance the event source by one unit of work.
    ///
    /// Returns false once the underlying sequence is exhausted; callers
    /// treat that as a normal terminal condition, not an error. A fresh
    /// cursor restarts iteration.
    fn step(&mut self) -> bool;
}

/// Trait for speech synthesis drivers.
///
/// Drivers execute one command at a time. Completion is never reported by
/// return value: a driver receives a `DriverHandle` at construction and uses
/// it to report busy/idle transitions and raise notifications, possibly from
/// a different thread than the one that invoked the operation.
///
/// Methods take `&self` because a thread may be blocked inside `start_loop`
/// while dispatch invokes `say` or `stop` from a callback; implementations
/// use interior mutability and must not hold internal locks across handle
/// callbacks.
pub trait Driver: Send + Sync {
    /// Begin speaking `text` asynchronously. The driver must eventually
    /// report idle through its handle and emit a finished-utterance
    /// notification.
    fn say(&self, text: &str) -> Result<()>;

    /// Request interruption of the current utterance. Idempotent when
    /// nothing is speaking.
    fn stop(&self) -> Result<()>;

    /// Synthesize `text` into an audio file at `path` instead of playing it.
    /// Same busy/notify contract as [`Driver::say`].
    fn save_to_file(&self, text: &str, path: &Path) -> Result<()>;

    /// Read a property value. Recognized keys at minimum: `voice`, `rate`,
    /// `volume`, `pitch` and the read-only `voices` catalog.
    fn get_property(&self, key: &str) -> Result<PropertyValue, PropertyError>;

    /// Validate a property assignment without applying it. Called
    /// synchronously from the caller's thread before the assignment is
    /// queued, so conversion and voice-lookup failures surface to the caller
    /// directly.
    fn check_property(&self, key: &str, value: &PropertyValue) -> Result<(), PropertyError>;

    /// Apply a property assignment. Invoked from the pump, in queue order.
    fn set_property(&self, key: &str, value: &PropertyValue) -> Result<(), PropertyError>;

    /// Run the driver's native event loop. Blocks until [`Driver::end_loop`]
    /// is called. The driver must report idle once the loop is running.
    fn start_loop(&self) -> Result<()>;

    /// Make a running [`Driver::start_loop`] return.
    fn end_loop(&self) -> Result<()>;

    /// Hand out a cursor over the native event source for the externally
    /// driven run-loop mode.
    fn cursor(&self) -> Result<Box<dyn LoopCursor>>;

    /// Release native resources. Must tolerate being called multiple times
    /// or after partial initialization failure.
    fn destroy(&self);
}
