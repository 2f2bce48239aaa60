//! Driver implementations.
//!
//! This module provides the concrete drivers behind the [`Driver`] trait and
//! a small factory for selecting one at runtime.

pub mod dummy;
pub mod espeak;

use anyhow::Result;
use tracing::{info, warn};

use speech_types::PropertyValue;

use crate::driver::{Driver, PropertyError};
use crate::proxy::DriverHandle;

/// Validate that `value` is a number within `[min, max]`. Shared by the
/// drivers' `check_property` implementations.
pub(crate) fn expect_number(
    key: &str,
    value: &PropertyValue,
    min: f64,
    max: f64,
) -> Result<(), PropertyError> {
    let n = value.as_number().ok_or_else(|| PropertyError::InvalidValue {
        key: key.to_string(),
        reason: "expected a number".to_string(),
    })?;
    if n < min || n > max {
        return Err(PropertyError::InvalidValue {
            key: key.to_string(),
            reason: format!("{n} is outside {min}..={max}"),
        });
    }
    Ok(())
}

/// Supported driver types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverKind {
    /// Auto-detect: prefer eSpeak, fall back to the dummy driver.
    #[default]
    Auto,
    /// eSpeak CLI driver (audible output, voice catalog from the system).
    Espeak,
    /// In-process driver with no system dependencies (no audible output).
    Dummy,
}

impl DriverKind {
    /// Parse driver kind from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "espeak" => Some(Self::Espeak),
            "dummy" | "null" => Some(Self::Dummy),
            _ => None,
        }
    }
}

/// Create a driver of the specified kind, wired to `handle` for busy reports
/// and notifications.
pub fn create_driver(kind: DriverKind, handle: DriverHandle) -> Result<Box<dyn Driver>> {
    match kind {
        DriverKind::Auto => create_driver_auto(handle),
        DriverKind::Espeak => {
            info!("Using eSpeak driver");
            Ok(Box::new(espeak::EspeakDriver::new(handle)?))
        }
        DriverKind::Dummy => {
            info!("Using dummy driver");
            Ok(Box::new(dummy::DummyDriver::new(handle)))
        }
    }
}

fn create_driver_auto(handle: DriverHandle) -> Result<Box<dyn Driver>> {
    if espeak::EspeakDriver::is_available() {
        match espeak::EspeakDriver::new(handle.clone()) {
            Ok(driver) => {
                info!("Using eSpeak driver (auto-detected)");
                return Ok(Box::new(driver));
            }
            Err(e) => {
                warn!("eSpeak driver creation failed: {e:#}");
                warn!("Falling back to the dummy driver (no audio output)");
            }
        }
    } else {
        warn!("espeak binary not found on PATH, using the dummy driver");
    }
    Ok(Box::new(dummy::DummyDriver::new(handle)))
}
