//! eSpeak CLI driver.
//!
//! Shells out to the `espeak` binary: text goes to the child's stdin,
//! `save_to_file` uses `-w`, and the voice catalog is parsed from
//! `espeak --voices` at construction. Utterance completion is reported by a
//! watcher thread that polls the child process and posts into the driver's
//! event queue; the run loop turns those events into notifications and idle
//! reports.

use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, warn};

use speech_types::{Notification, PropertyValue, Voice};

use crate::driver::{Driver, LoopCursor, PropertyError};
use crate::drivers::expect_number;
use crate::proxy::DriverHandle;

const LOOP_POLL: Duration = Duration::from_millis(10);
const CHILD_POLL: Duration = Duration::from_millis(20);
/// eSpeak's own default speed in words per minute.
const DEFAULT_RATE_WPM: f64 = 175.0;

enum DriverEvent {
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
    child: Mutex<Option<Child>>,
    speaking: AtomicBool,
    stopping: AtomicBool,
    looping: AtomicBool,
    voices: Vec<Voice>,
}

impl Inner {
    fn process(&self, event: DriverEvent) {
        match event {
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
}

pub struct EspeakDriver {
    inner: Arc<Inner>,
}

impl EspeakDriver {
    /// Probe for the espeak binary.
    pub fn is_available() -> bool {
        Command::new("espeak")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    pub fn new(handle: DriverHandle) -> Result<Self> {
        let output = Command::new("espeak")
            .arg("--voices")
            .output()
            .context("running espeak --voices")?;
        anyhow::ensure!(output.status.success(), "espeak --voices failed");
        let voices = parse_voices(&String::from_utf8_lossy(&output.stdout));
        let default_voice = voices
            .iter()
            .find(|v| v.id == "en")
            .or_else(|| voices.first())
            .map(|v| v.id.clone())
            .unwrap_or_else(|| "en".to_string());
        debug!("espeak catalog holds {} voices", voices.len());

        let (events_tx, events_rx) = unbounded();
        Ok(Self {
            inner: Arc::new(Inner {
                handle,
                events_tx,
                events_rx,
                props: Mutex::new(Properties {
                    voice: default_voice,
                    rate: DEFAULT_RATE_WPM,
                    volume: 1.0,
                    pitch: 50.0,
                }),
                child: Mutex::new(None),
                speaking: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                looping: AtomicBool::new(false),
                voices,
            }),
        })
    }

    /// Spawn an espeak child and feed it `text` on stdin. With `out` set the
    /// child writes a WAV file instead of playing audio.
    fn spawn_speak(&self, text: &str, out: Option<&Path>) -> Result<Child> {
        let args = {
            let props = self.inner.props.lock().unwrap();
            speak_args(&props)
        };
        let mut cmd = Command::new("espeak");
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(path) = out {
            cmd.arg("-w").arg(path);
        }
        let mut child = cmd.spawn().context("spawning espeak")?;
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(text.as_bytes()) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err).context("writing to espeak stdin");
            }
            // dropping stdin closes the pipe; espeak starts speaking
        }
        Ok(child)
    }

    fn begin_utterance(&self, child: Child) {
        self.inner.handle.set_busy(true);
        self.inner.stopping.store(false, Ordering::SeqCst);
        self.inner.speaking.store(true, Ordering::SeqCst);
        self.inner
            .handle
            .notify(Notification::StartedUtterance { name: None });
        *self.inner.child.lock().unwrap() = Some(child);
        self.watch_child();
    }

    /// Poll the active child until it exits, then post completion into the
    /// event queue. One watcher per utterance; the busy protocol guarantees
    /// they never overlap.
    fn watch_child(&self) {
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || loop {
            let done = {
                let mut slot = inner.child.lock().unwrap();
                match slot.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            debug!("espeak exited: {status}");
                            *slot = None;
                            true
                        }
                        Ok(None) => false,
                        Err(err) => {
                            warn!("waiting on espeak failed: {err}");
                            *slot = None;
                            true
                        }
                    },
                    // already reaped by stop()
                    None => true,
                }
            };
            if done {
                let _ = inner.events_tx.send(DriverEvent::Finished);
                return;
            }
            thread::sleep(CHILD_POLL);
        });
    }
}

/// eSpeak argument list for the current properties. Volume 0.0..=1.0 maps to
/// amplitude 0..=200, rate is words per minute, pitch is 0..=99.
fn speak_args(props: &Properties) -> Vec<String> {
    vec![
        "-v".to_string(),
        props.voice.clone(),
        "-s".to_string(),
        format!("{}", props.rate.round() as i64),
        "-a".to_string(),
        format!("{}", (props.volume.clamp(0.0, 1.0) * 200.0).round() as i64),
        "-p".to_string(),
        format!("{}", props.pitch.round() as i64),
        "--stdin".to_string(),
    ]
}

/// Parse the table printed by `espeak --voices`.
///
/// Format: `Pty Language Age/Gender VoiceName File Other Languages`, one
/// voice per line after a header row.
fn parse_voices(output: &str) -> Vec<Voice> {
    let mut voices = Vec::new();
    for line in output.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let language = fields[1].to_string();
        let gender = match fields[2] {
            "M" => Some("Male".to_string()),
            "F" => Some("Female".to_string()),
            _ => None,
        };
        voices.push(Voice {
            id: language.clone(),
            name: fields[3].to_string(),
            languages: vec![language],
            gender,
            age: None,
        });
    }
    voices
}

impl Driver for EspeakDriver {
    fn say(&self, text: &str) -> Result<()> {
        let child = self.spawn_speak(text, None)?;
        self.begin_utterance(child);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if !self.inner.speaking.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stopping.store(true, Ordering::SeqCst);
        let mut slot = self.inner.child.lock().unwrap();
        if let Some(child) = slot.as_mut() {
            if let Err(err) = child.kill() {
                warn!("killing espeak failed: {err}");
            }
            let _ = child.wait();
            *slot = None;
        }
        Ok(())
    }

    fn save_to_file(&self, text: &str, path: &Path) -> Result<()> {
        let child = self.spawn_speak(text, Some(path))?;
        self.begin_utterance(child);
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
            "pitch" => expect_number(key, value, 0.0, 99.0),
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
        Ok(Box::new(EspeakCursor {
            inner: Arc::clone(&self.inner),
            primed: false,
        }))
    }

    fn destroy(&self) {
        self.inner.looping.store(false, Ordering::SeqCst);
        let mut slot = self.inner.child.lock().unwrap();
        if let Some(child) = slot.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
            *slot = None;
        }
    }
}

struct EspeakCursor {
    inner: Arc<Inner>,
    primed: bool,
}

impl LoopCursor for EspeakCursor {
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
