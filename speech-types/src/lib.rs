//! Shared types crossing the engine/driver boundary.
//!
//! These are the data shapes exchanged between the dispatch core, the
//! drivers, and whatever front end consumes notifications: voice catalog
//! entries, property values, and driver events.

use serde::{Deserialize, Serialize};

/// One entry in a driver's voice catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voice {
    /// Driver-specific voice identifier, as accepted by the `voice` property.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Language/locale tags (e.g. "en", "en_US").
    #[serde(default)]
    pub languages: Vec<String>,
    pub gender: Option<String>,
    pub age: Option<String>,
}

impl Voice {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            languages: Vec::new(),
            gender: None,
            age: None,
        }
    }
}

/// Value of a driver property.
///
/// Recognized property keys are `voice`, `rate`, `volume`, `pitch` and the
/// read-only `voices` catalog. Which value shape a key accepts is up to the
/// driver; validation happens synchronously when the property is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Number(f64),
    Text(String),
    Voices(Vec<Voice>),
}

impl PropertyValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_voices(&self) -> Option<&[Voice]> {
        match self {
            PropertyValue::Voices(v) => Some(v),
            _ => None,
        }
    }
}

impl From<f64> for PropertyValue {
    fn from(n: f64) -> Self {
        PropertyValue::Number(n)
    }
}

impl From<&str> for PropertyValue {
    fn from(t: &str) -> Self {
        PropertyValue::Text(t.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(t: String) -> Self {
        PropertyValue::Text(t)
    }
}

impl From<Vec<Voice>> for PropertyValue {
    fn from(v: Vec<Voice>) -> Self {
        PropertyValue::Voices(v)
    }
}

/// Event raised by a driver and relayed to the engine.
///
/// Events carry the name of the utterance they belong to. A driver may leave
/// `name` empty when the originating callback has no knowledge of the logical
/// utterance (a low-level word-boundary signal, for instance); the dispatch
/// core stamps such events with the name of the most recently dispatched
/// command before forwarding them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    StartedUtterance {
        name: Option<String>,
    },
    StartedWord {
        name: Option<String>,
        /// Byte offset of the word within the utterance text.
        location: usize,
        /// Byte length of the word.
        length: usize,
    },
    FinishedUtterance {
        name: Option<String>,
        /// False when the utterance was interrupted.
        completed: bool,
    },
    Error {
        name: Option<String>,
        message: String,
    },
}

impl Notification {
    /// Utterance name carried by the event, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Notification::StartedUtterance { name }
            | Notification::StartedWord { name, .. }
            | Notification::FinishedUtterance { name, .. }
            | Notification::Error { name, .. } => name.as_deref(),
        }
    }

    /// Fill in `fallback` when the event carries no name of its own. An
    /// explicit name is never overwritten.
    pub fn stamp_name(&mut self, fallback: Option<String>) {
        let slot = match self {
            Notification::StartedUtterance { name }
            | Notification::StartedWord { name, .. }
            | Notification::FinishedUtterance { name, .. }
            | Notification::Error { name, .. } => name,
        };
        if slot.is_none() {
            *slot = fallback;
        }
    }

    /// Stable topic string for logs.
    pub fn topic(&self) -> &'static str {
        match self {
            Notification::StartedUtterance { .. } => "started-utterance",
            Notification::StartedWord { .. } => "started-word",
            Notification::FinishedUtterance { .. } => "finished-utterance",
            Notification::Error { .. } => "error",
        }
    }
}
