//! In-process driver with no system dependencies.
//!
//! Synthesis is simulated: utterances complete through the driver's own
//! event queue, word boundaries are reported per whitespace-separated token,
//! and save-to-file writes a silence WAV sized to the text. The full
//! busy/notify protocol is exercised, which makes this the driver behind the
//! integration tests and the fallback when no real synthesizer is installed.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::debug;

use speech_types::{Notification, PropertyValue, Voice};

use crate::driver::{Driver, LoopCursor, PropertyError};
use crate::drivers::expect_number;
use crate::proxy::DriverHandle;

const LOOP_POLL: Duration = Duration::from_millis(10);
const SAMPLE_RATE: u32 = 22050;
/// Samples of silence written per word when saving to file.
const SAMPLES_PER_WORD: usize = SAMPLE_RATE as usize / 4;

/// Events the synthesis side posts to the run loop.
enum DriverEvent {
    Word { location: usize, length: usize },
    Finished,
}

struct Properties {
    voice: String,
    rate: f64,
    volume: f64,
    pitch: f64,
}

struct Inner {
    handle: DriverHandle,
    events_tx: Sender<DriverEvent>,
    events_rx: Receiver<DriverEvent>,
    props: Mutex<Properties>,
    speaking: AtomicBool,
    stopping: AtomicBool,
    looping: AtomicBool,
    voices: Vec<Voice>,
}

impl Inner {
    fn process(&self, event: DriverEvent) {
        match event {
            DriverEvent::Word { location, length } => {
                if self.speaking.load(Ordering::SeqCst) && !self.stopping.load(Ordering::SeqCst) {
                    self.handle.notify(Notification::StartedWord {
                        name: None,
                        location,
                        length,
                    });
                }
            }
            DriverEvent::Finished => {
                let completed = !self.stopping.swap(false, Ordering::SeqCst);
                self.speaking.store(false, Ordering::SeqCst);
                self.handle.notify(Notification::FinishedUtterance {
                    name: None,
                    completed,
                });
                self.handle.set_busy(false);
            }
        }
    }

    fn begin_utterance(&self) {
        self.handle.set_busy(true);
        self.stopping.store(false, Ordering::SeqCst);
        self.speaking.store(true, Ordering::SeqCst);
        self.handle
            .notify(Notification::StartedUtterance { name: None });
    }
}

pub struct DummyDriver {
    inner: Arc<Inner>,
}

impl DummyDriver {
    pub fn new(handle: DriverHandle) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            inner: Arc::new(Inner {
                handle,
                events_tx,
                events_rx,
                props: Mutex::new(Properties {
                    voice: "dummy.en".to_string(),
                    rate: 175.0,
                    volume: 1.0,
                    pitch: 50.0,
                }),
                speaking: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                looping: AtomicBool::new(false),
                voices: catalog(),
            }),
        }
    }
}

fn catalog() -> Vec<Voice> {
    vec![
        Voice {
            id: "dummy.en".to_string(),
            name: "Dummy English".to_string(),
            languages: vec!["en".to_string()],
            gender: Some("Female".to_string()),
            age: None,
        },
        Voice {
            id: "dummy.de".to_string(),
            name: "Dummy German".to_string(),
            languages: vec!["de".to_string()],
            gender: Some("Male".to_string()),
            age: None,
        },
    ]
}

/// Byte spans of whitespace-separated words in `text`.
fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((s, idx - s));
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len() - s));
    }
    spans
}

fn write_silence_wav(path: &Path, text: &str) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer =
        WavWriter::create(path, spec).with_context(|| format!("creating {}", path.display()))?;
    let words = text.split_whitespace().count().max(1);
    for _ in 0..words * SAMPLES_PER_WORD {
        writer.write_sample(0i16)?;
    }
    writer.finalize()?;
    Ok(())
}

impl Driver for DummyDriver {
    fn say(&self, text: &str) -> Result<()> {
        debug!("dummy say: {} bytes", text.len());
        self.inner.begin_utterance();
        for (location, length) in word_spans(text) {
            let _ = self.inner.events_tx.send(DriverEvent::Word { location, length });
        }
        let _ = self.inner.events_tx.send(DriverEvent::Finished);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.inner.speaking.load(Ordering::SeqCst) {
            self.inner.stopping.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn save_to_file(&self, text: &str, path: &Path) -> Result<()> {
        write_silence_wav(path, text)?;
        debug!("dummy synthesized {}", path.display());
        self.inner.begin_utterance();
        let _ = self.inner.events_tx.send(DriverEvent::Finished);
        Ok(())
    }

    fn get_property(&self, key: &str) -> Result<PropertyValue, PropertyError> {
        let props = self.inner.props.lock().unwrap();
        match key {
            "voice" => Ok(PropertyValue::Text(props.voice.clone())),
            "rate" => Ok(PropertyValue::Number(props.rate)),
            "volume" => Ok(PropertyValue::Number(props.volume)),
            "pitch" => Ok(PropertyValue::Number(props.pitch)),
            "voices" => Ok(PropertyValue::Voices(self.inner.voices.clone())),
            _ => Err(PropertyError::UnknownProperty(key.to_string())),
        }
    }

    fn check_property(&self, key: &str, value: &PropertyValue) -> Result<(), PropertyError> {
        match key {
            "voice" => {
                let id = value.as_text().ok_or_else(|| PropertyError::InvalidValue {
                    key: key.to_string(),
                    reason: "voice id must be a string".to_string(),
                })?;
                if self.inner.voices.iter().any(|v| v.id == id) {
                    Ok(())
                } else {
                    Err(PropertyError::UnknownVoice(id.to_string()))
                }
            }
            "rate" => expect_number(key, value, 1.0, 1000.0),
            "volume" => expect_number(key, value, 0.0, 1.0),
            "pitch" => expect_number(key, value, 0.0, 100.0),
            "voices" => Err(PropertyError::ReadOnly(key.to_string())),
            _ => Err(PropertyError::UnknownProperty(key.to_string())),
        }
    }

    fn set_property(&self, key: &str, value: &PropertyValue) -> Result<(), PropertyError> {
        self.check_property(key, value)?;
        let mut props = self.inner.props.lock().unwrap();
        match key {
            "voice" => props.voice = value.as_text().unwrap().to_string(),
            "rate" => props.rate = value.as_number().unwrap(),
            "volume" => props.volume = value.as_number().unwrap(),
            "pitch" => props.pitch = value.as_number().unwrap(),
            _ => unreachable!("checked above"),
        }
        Ok(())
    }

    fn start_loop(&self) -> Result<()> {
        let inner = &self.inner;
        inner.looping.store(true, Ordering::SeqCst);
        inner.handle.set_busy(false);
        while inner.looping.load(Ordering::SeqCst) {
            match inner.events_rx.recv_timeout(LOOP_POLL) {
                Ok(event) => inner.process(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }

    fn end_loop(&self) -> Result<()> {
        self.inner.looping.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn cursor(&self) -> Result<Box<dyn LoopCursor>> {
        Ok(Box::new(DummyCursor {
            inner: Arc::clone(&self.inner),
            primed: false,
        }))
    }

    fn destroy(&self) {
        self.inner.looping.store(false, Ordering::SeqCst);
    }
}

struct DummyCursor {
    inner: Arc<Inner>,
    primed: bool,
}

impl LoopCursor for DummyCursor {
    fn step(&mut self) -> bool {
        if !self.primed {
            self.primed = true;
            self.inner.handle.set_busy(false);
            return true;
        }
        match self.inner.events_rx.try_recv() {
            Ok(event) => {
                self.inner.process(event);
                true
            }
            Err(TryRecvError::Empty) => true,
            Err(TryRecvError::Disconnected) => false,
        }
    }
}
