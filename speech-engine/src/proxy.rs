//! Command dispatch proxy between the engine and a speech driver.
//!
//! Public operations never execute against the driver inline: each call
//! appends to a FIFO queue and attempts a pump. The pump drains the queue
//! while the driver is idle, dispatching one command at a time; the driver's
//! idle report is the only thing that resumes a stalled queue. Two run-loop
//! modes are supported: the driver owns a blocking loop, or the caller steps
//! the driver's event source itself.

use std::collections::VecDeque;
use std::mem;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, warn};

use speech_types::{Notification, PropertyValue};

use crate::driver::{Driver, LoopCursor, PropertyError};
use crate::notify::EngineSink;

/// Errors from misusing the run-loop surface.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("a run loop is already active")]
    AlreadyLooping,
    #[error("no externally driven loop is active")]
    NotExternallyDriven,
}

/// A queued operation together with its utterance name.
struct QueuedCommand {
    op: QueuedOp,
    name: Option<String>,
}

/// Operations the proxy can hold in its queue.
///
/// `EndLoop` is the loop-termination marker: dispatching it tears the active
/// run loop down instead of invoking the driver.
enum QueuedOp {
    Say(String),
    SaveToFile(String, PathBuf),
    SetProperty(String, PropertyValue),
    EndLoop,
}

impl QueuedOp {
    fn label(&self) -> &'static str {
        match self {
            QueuedOp::Say(_) => "say",
            QueuedOp::SaveToFile(..) => "save_to_file",
            QueuedOp::SetProperty(..) => "set_property",
            QueuedOp::EndLoop => "end_loop",
        }
    }
}

/// Which run-loop integration mode is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    NotLooping,
    DriverOwned,
    External,
}

struct DispatchState {
    queue: VecDeque<QueuedCommand>,
    /// True while a command is mid-execution or the driver has not yet
    /// reported idle after the last dispatched command.
    busy: bool,
    /// Dispatch-in-progress flag. A pump entered from a driver callback
    /// while another pump is mid-dispatch returns immediately; the running
    /// pump re-checks state after every dispatch, so no idle report is lost.
    pumping: bool,
    /// Name of the most recently dispatched command; stamps notifications
    /// that carry no name of their own.
    current_name: Option<String>,
    loop_state: LoopState,
}

struct Shared {
    state: Mutex<DispatchState>,
    /// Installed once at the end of construction. Callbacks arriving while
    /// the driver is still being built update state but skip the pump.
    driver: OnceLock<Box<dyn Driver>>,
    /// External-loop cursor. Locked separately (always before `state`) so a
    /// step never runs under the dispatch state lock.
    cursor: Mutex<Option<Box<dyn LoopCursor>>>,
    sink: Box<dyn EngineSink>,
}

impl Shared {
    fn driver(&self) -> Option<&dyn Driver> {
        self.driver.get().map(|d| d.as_ref())
    }

    fn is_busy(&self) -> bool {
        self.state.lock().unwrap().busy
    }

    fn set_busy(&self, busy: bool) {
        debug!("driver busy = {}", busy);
        self.state.lock().unwrap().busy = busy;
        if !busy {
            self.pump();
        }
    }

    /// Stamp `event` with the active utterance name when it has none, then
    /// forward it. The state lock is released before the sink runs so a sink
    /// may call back into the proxy.
    fn notify(&self, mut event: Notification) {
        if event.name().is_none() {
            event.stamp_name(self.state.lock().unwrap().current_name.clone());
        }
        self.sink.notify(event);
    }

    fn push(&self, op: QueuedOp, name: Option<String>) {
        debug!("queueing {} ({:?})", op.label(), name);
        self.state
            .lock()
            .unwrap()
            .queue
            .push_back(QueuedCommand { op, name });
        self.pump();
    }

    /// Drain ready queue entries while the driver is idle.
    ///
    /// A dispatch failure is converted into an error notification and
    /// draining continues; a failing command forfeits only its own
    /// utterance. The state lock is never held across a driver invocation.
    fn pump(&self) {
        let Some(driver) = self.driver() else {
            return;
        };
        loop {
            let cmd = {
                let mut state = self.state.lock().unwrap();
                if state.busy || state.pumping {
                    return;
                }
                let Some(cmd) = state.queue.pop_front() else {
                    return;
                };
                state.current_name = cmd.name.clone();
                state.pumping = true;
                cmd
            };
            debug!("dispatching {} ({:?})", cmd.op.label(), cmd.name);
            let outcome = self.dispatch(driver, cmd.op);
            self.state.lock().unwrap().pumping = false;
            if let Err(err) = outcome {
                warn!("command failed: {err:#}");
                self.notify(Notification::Error {
                    name: None,
                    message: format!("{err:#}"),
                });
            }
        }
    }

    fn dispatch(&self, driver: &dyn Driver, op: QueuedOp) -> Result<()> {
        match op {
            QueuedOp::Say(text) => driver.say(&text),
            QueuedOp::SaveToFile(text, path) => driver.save_to_file(&text, &path),
            QueuedOp::SetProperty(key, value) => {
                driver.set_property(&key, &value)?;
                Ok(())
            }
            QueuedOp::EndLoop => {
                self.end_loop();
                Ok(())
            }
        }
    }

    /// Terminal loop teardown, shared by the marker dispatch and the public
    /// `end_loop`. Clears the whole queue (marker included), forces busy so
    /// nothing pumps until a fresh idle report, then tears the driver side
    /// down according to the active mode. Idempotent.
    fn end_loop(&self) {
        let mut cursor_slot = self.cursor.lock().unwrap();
        let mode = {
            let mut state = self.state.lock().unwrap();
            state.queue.clear();
            state.busy = true;
            mem::replace(&mut state.loop_state, LoopState::NotLooping)
        };
        *cursor_slot = None;
        drop(cursor_slot);

        let Some(driver) = self.driver() else {
            return;
        };
        if let Err(err) = driver.stop() {
            warn!("driver stop failed during loop teardown: {err:#}");
        }
        if mode == LoopState::DriverOwned {
            if let Err(err) = driver.end_loop() {
                warn!("driver loop teardown failed: {err:#}");
            }
        }
    }
}

/// Callback handle a driver uses to report state and raise notifications.
///
/// Holds only a weak reference to the proxy: it never extends the proxy's
/// lifetime, and every method becomes a no-op once the proxy has been torn
/// down, so a late callback from a driver thread is absorbed rather than
/// undefined.
#[derive(Clone)]
pub struct DriverHandle {
    shared: Weak<Shared>,
}

impl DriverHandle {
    /// Report the driver busy or idle. An idle report pumps the queue and is
    /// the sole mechanism by which stalled work resumes.
    pub fn set_busy(&self, busy: bool) {
        if let Some(shared) = self.shared.upgrade() {
            shared.set_busy(busy);
        }
    }

    /// Current busy state. Reports busy after proxy teardown.
    pub fn is_busy(&self) -> bool {
        self.shared.upgrade().map(|s| s.is_busy()).unwrap_or(true)
    }

    /// Forward a driver event to the engine sink. Events without an
    /// utterance name are stamped with the name of the most recently
    /// dispatched command.
    pub fn notify(&self, event: Notification) {
        if let Some(shared) = self.shared.upgrade() {
            shared.notify(event);
        }
    }
}

/// Serializing proxy in front of a speech driver.
///
/// Owns the command queue and busy state exclusively; the driver only ever
/// reaches back through its [`DriverHandle`]. Dropping the proxy destroys
/// the driver.
pub struct DriverProxy {
    shared: Arc<Shared>,
}

impl DriverProxy {
    /// Build a proxy around the driver produced by `build`.
    ///
    /// `build` receives the callback handle the driver must use for busy
    /// reports and notifications. The proxy starts busy; the driver reports
    /// idle once its event loop is running.
    pub fn new<F>(sink: Box<dyn EngineSink>, build: F) -> Result<Self>
    where
        F: FnOnce(DriverHandle) -> Result<Box<dyn Driver>>,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(DispatchState {
                queue: VecDeque::new(),
                busy: true,
                pumping: false,
                current_name: None,
                loop_state: LoopState::NotLooping,
            }),
            driver: OnceLock::new(),
            cursor: Mutex::new(None),
            sink,
        });
        let driver = build(DriverHandle {
            shared: Arc::downgrade(&shared),
        })?;
        if shared.driver.set(driver).is_err() {
            unreachable!("driver installed twice");
        }
        Ok(Self { shared })
    }

    fn driver(&self) -> &dyn Driver {
        self.shared
            .driver()
            .expect("driver is installed at construction")
    }

    /// Queue text to be spoken. Returns immediately; the utterance plays
    /// once the driver reaches it.
    pub fn say(&self, text: impl Into<String>, name: Option<String>) {
        self.shared.push(QueuedOp::Say(text.into()), name);
    }

    /// Queue synthesis of `text` into an audio file at `path`.
    pub fn save_to_file(
        &self,
        text: impl Into<String>,
        path: impl Into<PathBuf>,
        name: Option<String>,
    ) {
        self.shared
            .push(QueuedOp::SaveToFile(text.into(), path.into()), name);
    }

    /// Interrupt the current utterance and discard queued work.
    ///
    /// Discards from the head of the queue up to (but not including) a
    /// pending loop-termination marker, so a loop that is waiting to end
    /// still ends. The stop request is forwarded to the driver even when
    /// nothing was queued.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            let mut discarded = 0usize;
            while let Some(front) = state.queue.front() {
                if matches!(front.op, QueuedOp::EndLoop) {
                    break;
                }
                state.queue.pop_front();
                discarded += 1;
            }
            if discarded > 0 {
                debug!("stop discarded {} queued commands", discarded);
            }
        }
        if let Err(err) = self.driver().stop() {
            warn!("driver stop failed: {err:#}");
        }
    }

    /// Read a driver property. Synchronous; does not touch the queue.
    pub fn get_property(&self, key: &str) -> Result<PropertyValue, PropertyError> {
        self.driver().get_property(key)
    }

    /// Change a driver property.
    ///
    /// The value is validated synchronously: unknown keys, unknown voices
    /// and conversion failures surface here, with the queue untouched. On
    /// success the assignment is queued so it applies in order relative to
    /// utterances already waiting.
    pub fn set_property(&self, key: &str, value: PropertyValue) -> Result<(), PropertyError> {
        self.driver().check_property(key, &value)?;
        self.shared
            .push(QueuedOp::SetProperty(key.to_string(), value), None);
        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.shared.is_busy()
    }

    /// Process every queued command, then return.
    ///
    /// Enqueues the loop-termination marker behind the waiting work and
    /// hands control to the driver's blocking loop. Reaching the marker
    /// tears the loop down, so the call returns without further input even
    /// if nothing else is ever queued.
    pub fn run_and_wait(&self) -> Result<()> {
        self.begin_loop(LoopState::DriverOwned)?;
        self.shared.push(QueuedOp::EndLoop, None);
        self.driver().start_loop()
    }

    /// Start the driver-owned loop. Blocks until something calls
    /// [`DriverProxy::end_loop`].
    pub fn start_loop(&self) -> Result<()> {
        self.begin_loop(LoopState::DriverOwned)?;
        self.driver().start_loop()
    }

    /// Start an externally driven loop. Returns immediately; the caller
    /// advances the driver with [`DriverProxy::iterate`] from its own loop.
    pub fn start_external_loop(&self) -> Result<()> {
        self.begin_loop(LoopState::External)?;
        match self.driver().cursor() {
            Ok(cursor) => {
                *self.shared.cursor.lock().unwrap() = Some(cursor);
                Ok(())
            }
            Err(err) => {
                self.shared.state.lock().unwrap().loop_state = LoopState::NotLooping;
                Err(err)
            }
        }
    }

    fn begin_loop(&self, mode: LoopState) -> Result<(), DispatchError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.loop_state != LoopState::NotLooping {
            return Err(DispatchError::AlreadyLooping);
        }
        state.loop_state = mode;
        Ok(())
    }

    /// Advance the externally driven loop by one unit of work.
    ///
    /// Exhaustion of the driver's event source is a silent no-op; request a
    /// fresh loop to restart iteration.
    pub fn iterate(&self) -> Result<(), DispatchError> {
        let taken = {
            let mut slot = self.shared.cursor.lock().unwrap();
            {
                let state = self.shared.state.lock().unwrap();
                if state.loop_state != LoopState::External {
                    return Err(DispatchError::NotExternallyDriven);
                }
            }
            slot.take()
        };
        let Some(mut cursor) = taken else {
            return Ok(());
        };
        // Stepped outside both locks so driver callbacks can re-enter the
        // proxy.
        cursor.step();
        let mut slot = self.shared.cursor.lock().unwrap();
        let still_external = self.shared.state.lock().unwrap().loop_state == LoopState::External;
        if still_external {
            *slot = Some(cursor);
        }
        Ok(())
    }

    /// Tear down the active run loop: clear the queue entirely (marker
    /// included), force busy, stop the driver and end its loop or drop the
    /// cursor per mode. Idempotent; safe with no loop active.
    pub fn end_loop(&self) {
        self.shared.end_loop();
    }

    #[cfg(test)]
    fn push_end_loop_marker(&self) {
        self.shared.push(QueuedOp::EndLoop, None);
    }

    #[cfg(test)]
    fn queued_labels(&self) -> Vec<&'static str> {
        self.shared
            .state
            .lock()
            .unwrap()
            .queue
            .iter()
            .map(|cmd| cmd.op.label())
            .collect()
    }
}

impl Drop for DriverProxy {
    fn drop(&mut self) {
        if let Some(driver) = self.shared.driver() {
            driver.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use crossbeam_channel::Receiver;

    /// Scripted driver with a shared call log. In manual mode utterances
    /// never complete on their own; tests drive idle reports through the
    /// handle. In auto mode every utterance finishes synchronously from
    /// within the dispatched call, which exercises pump reentrancy.
    struct TestDriver {
        handle: DriverHandle,
        calls: Arc<Mutex<Vec<String>>>,
        auto_complete: bool,
        rate: Mutex<f64>,
        looping: AtomicBool,
    }

    impl TestDriver {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn complete_utterance(&self) {
            self.handle.notify(Notification::FinishedUtterance {
                name: None,
                completed: true,
            });
            self.handle.set_busy(false);
        }
    }

    impl Driver for TestDriver {
        fn say(&self, text: &str) -> Result<()> {
            if text == "boom" {
                anyhow::bail!("synthetic say failure");
            }
            assert!(!self.handle.is_busy(), "dispatched while busy");
            self.record(format!("say {text}"));
            self.handle.set_busy(true);
            self.handle
                .notify(Notification::StartedUtterance { name: None });
            if self.auto_complete {
                self.complete_utterance();
            }
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            self.record("stop");
            Ok(())
        }

        fn save_to_file(&self, text: &str, path: &std::path::Path) -> Result<()> {
            self.record(format!("save {} {}", text, path.display()));
            self.handle.set_busy(true);
            self.handle
                .notify(Notification::StartedUtterance { name: None });
            if self.auto_complete {
                self.complete_utterance();
            }
            Ok(())
        }

        fn get_property(&self, key: &str) -> Result<PropertyValue, PropertyError> {
            match key {
                "rate" => Ok(PropertyValue::Number(*self.rate.lock().unwrap())),
                "voice" => Ok(PropertyValue::Text("test.en".to_string())),
                _ => Err(PropertyError::UnknownProperty(key.to_string())),
            }
        }

        fn check_property(&self, key: &str, value: &PropertyValue) -> Result<(), PropertyError> {
            match key {
                "rate" | "volume" | "pitch" => value
                    .as_number()
                    .map(|_| ())
                    .ok_or_else(|| PropertyError::InvalidValue {
                        key: key.to_string(),
                        reason: "expected a number".to_string(),
                    }),
                "voice" => {
                    let id = value.as_text().ok_or_else(|| PropertyError::InvalidValue {
                        key: key.to_string(),
                        reason: "expected a voice id".to_string(),
                    })?;
                    if id == "test.en" {
                        Ok(())
                    } else {
                        Err(PropertyError::UnknownVoice(id.to_string()))
                    }
                }
                "voices" => Err(PropertyError::ReadOnly(key.to_string())),
                _ => Err(PropertyError::UnknownProperty(key.to_string())),
            }
        }

        fn set_property(&self, key: &str, value: &PropertyValue) -> Result<(), PropertyError> {
            self.check_property(key, value)?;
            if key == "rate" {
                *self.rate.lock().unwrap() = value.as_number().unwrap();
            }
            self.record(format!("set {key}={value:?}"));
            Ok(())
        }

        fn start_loop(&self) -> Result<()> {
            self.record("start_loop");
            self.looping.store(true, Ordering::SeqCst);
            self.handle.set_busy(false);
            while self.looping.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }

        fn end_loop(&self) -> Result<()> {
            self.record("end_loop");
            self.looping.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn cursor(&self) -> Result<Box<dyn LoopCursor>> {
            self.record("cursor");
            Ok(Box::new(TestCursor {
                handle: self.handle.clone(),
                primed: false,
            }))
        }

        fn destroy(&self) {
            self.record("destroy");
        }
    }

    struct TestCursor {
        handle: DriverHandle,
        primed: bool,
    }

    impl LoopCursor for TestCursor {
        fn step(&mut self) -> bool {
            if !self.primed {
                self.primed = true;
                self.handle.set_busy(false);
            }
            true
        }
    }

    struct Harness {
        proxy: DriverProxy,
        handle: DriverHandle,
        calls: Arc<Mutex<Vec<String>>>,
        events: Receiver<Notification>,
    }

    impl Harness {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn drain_events(&self) -> Vec<Notification> {
            self.events.try_iter().collect()
        }
    }

    fn harness(auto_complete: bool) -> Harness {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (tx, events) = crossbeam_channel::unbounded();
        let handle_slot = Arc::new(Mutex::new(None));
        let proxy = DriverProxy::new(Box::new(tx), {
            let calls = Arc::clone(&calls);
            let handle_slot = Arc::clone(&handle_slot);
            move |handle| {
                *handle_slot.lock().unwrap() = Some(handle.clone());
                Ok(Box::new(TestDriver {
                    handle,
                    calls,
                    auto_complete,
                    rate: Mutex::new(175.0),
                    looping: AtomicBool::new(false),
                }) as Box<dyn Driver>)
            }
        })
        .unwrap();
        let handle = handle_slot.lock().unwrap().clone().unwrap();
        Harness {
            proxy,
            handle,
            calls,
            events,
        }
    }

    #[test]
    fn test_commands_stay_queued_while_busy() {
        let h = harness(false);
        h.proxy.say("hi", Some("u1".to_string()));
        h.proxy.say("bye", Some("u2".to_string()));
        assert!(h.calls().is_empty());
        assert_eq!(h.proxy.queued_labels(), ["say", "say"]);
    }

    #[test]
    fn test_fifo_order_preserved() {
        let h = harness(false);
        h.proxy.say("a", None);
        h.proxy.say("b", None);
        h.proxy.say("c", None);
        // one idle report dispatches exactly one command
        h.handle.set_busy(false);
        assert_eq!(h.calls(), ["say a"]);
        h.handle.set_busy(false);
        h.handle.set_busy(false);
        assert_eq!(h.calls(), ["say a", "say b", "say c"]);
    }

    #[test]
    fn test_reentrant_pump_drains_sequentially() {
        // auto mode: the driver completes each utterance from inside the
        // dispatched call, so the pump is re-entered mid-dispatch
        let h = harness(true);
        h.proxy.say("a", None);
        h.proxy.say("b", None);
        h.proxy.say("c", None);
        h.handle.set_busy(false);
        assert_eq!(h.calls(), ["say a", "say b", "say c"]);
        assert_eq!(h.proxy.queued_labels(), Vec::<&str>::new());
    }

    #[test]
    fn test_busy_and_idle_interleaving_dispatches_one_at_a_time() {
        let h = harness(false);
        h.proxy.say("hi", Some("u1".to_string()));
        h.proxy.say("bye", Some("u2".to_string()));

        h.handle.set_busy(false);
        assert_eq!(h.calls(), ["say hi"]);
        assert!(h.proxy.is_busy());

        h.handle.set_busy(false);
        assert_eq!(h.calls(), ["say hi", "say bye"]);

        let started: Vec<_> = h
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, Notification::StartedUtterance { .. }))
            .map(|e| e.name().map(str::to_string))
            .collect();
        assert_eq!(
            started,
            [Some("u1".to_string()), Some("u2".to_string())]
        );
    }

    #[test]
    fn test_stop_discards_up_to_marker() {
        let h = harness(false);
        h.proxy.say("a", None);
        h.proxy.say("b", None);
        h.proxy.push_end_loop_marker();
        h.proxy.say("c", None);

        h.proxy.stop();
        assert_eq!(h.proxy.queued_labels(), ["end_loop", "say"]);
        assert_eq!(h.calls(), ["stop"]);

        // the preserved marker still fires: it empties the queue, so the
        // trailing command never runs
        h.handle.set_busy(false);
        assert_eq!(h.proxy.queued_labels(), Vec::<&str>::new());
        assert!(h.proxy.is_busy());
        assert!(!h.calls().contains(&"say c".to_string()));
    }

    #[test]
    fn test_stop_with_empty_queue_still_reaches_driver() {
        let h = harness(false);
        h.proxy.stop();
        assert_eq!(h.calls(), ["stop"]);
    }

    #[test]
    fn test_end_loop_clears_everything_and_forces_busy() {
        let h = harness(false);
        h.proxy.say("a", None);
        h.proxy.push_end_loop_marker();
        h.proxy.say("b", None);
        h.handle.set_busy(false);
        assert_eq!(h.calls(), ["say a"]);

        h.proxy.end_loop();
        assert_eq!(h.proxy.queued_labels(), Vec::<&str>::new());
        assert!(h.proxy.is_busy());
        assert!(h.calls().contains(&"stop".to_string()));

        // idempotent
        h.proxy.end_loop();
        assert!(h.proxy.is_busy());
    }

    #[test]
    fn test_notifications_stamped_with_current_utterance() {
        let h = harness(false);
        h.proxy.say("hello", Some("u1".to_string()));
        h.handle.set_busy(false);

        // driver-raised event with no name
        h.handle.notify(Notification::StartedWord {
            name: None,
            location: 0,
            length: 5,
        });
        // explicit name survives
        h.handle.notify(Notification::StartedWord {
            name: Some("explicit".to_string()),
            location: 6,
            length: 5,
        });

        let events = h.drain_events();
        assert_eq!(events[0].name(), Some("u1"));
        assert_eq!(events[1].name(), Some("u1"));
        assert_eq!(events[2].name(), Some("explicit"));
    }

    #[test]
    fn test_failed_command_notifies_and_keeps_draining() {
        let h = harness(false);
        h.proxy.say("boom", Some("bad".to_string()));
        h.proxy.say("ok", Some("good".to_string()));
        h.handle.set_busy(false);

        // the failure did not leave the queue stuck
        assert_eq!(h.calls(), ["say ok"]);

        let events = h.drain_events();
        match &events[0] {
            Notification::Error { name, message } => {
                assert_eq!(name.as_deref(), Some("bad"));
                assert!(message.contains("synthetic say failure"));
            }
            other => panic!("expected error notification, got {other:?}"),
        }
    }

    #[test]
    fn test_set_property_invalid_value_fails_synchronously() {
        let h = harness(false);
        let err = h
            .proxy
            .set_property("rate", PropertyValue::Text("not-a-number".to_string()))
            .unwrap_err();
        assert!(matches!(err, PropertyError::InvalidValue { .. }));
        assert_eq!(h.proxy.queued_labels(), Vec::<&str>::new());
    }

    #[test]
    fn test_set_property_unknown_key_and_voice() {
        let h = harness(false);
        assert!(matches!(
            h.proxy.set_property("warble", PropertyValue::Number(1.0)),
            Err(PropertyError::UnknownProperty(_))
        ));
        assert!(matches!(
            h.proxy
                .set_property("voice", PropertyValue::Text("nope".to_string())),
            Err(PropertyError::UnknownVoice(_))
        ));
        assert!(matches!(
            h.proxy.set_property("voices", PropertyValue::Number(0.0)),
            Err(PropertyError::ReadOnly(_))
        ));
        assert_eq!(h.proxy.queued_labels(), Vec::<&str>::new());
    }

    #[test]
    fn test_set_property_applies_in_queue_order() {
        let h = harness(true);
        h.proxy.say("first", None);
        h.proxy
            .set_property("rate", PropertyValue::Number(120.0))
            .unwrap();
        h.proxy.say("second", None);
        h.handle.set_busy(false);
        assert_eq!(
            h.calls(),
            ["say first", "set rate=Number(120.0)", "say second"]
        );
        assert_eq!(
            h.proxy.get_property("rate").unwrap(),
            PropertyValue::Number(120.0)
        );
    }

    #[test]
    fn test_run_and_wait_returns_with_empty_queue() {
        // bounded-loop guarantee: the marker alone ends the loop with zero
        // further caller input
        let h = harness(false);
        h.proxy.run_and_wait().unwrap();
        assert_eq!(h.calls(), ["start_loop", "stop", "end_loop"]);
        assert!(h.proxy.is_busy());
    }

    #[test]
    fn test_run_and_wait_processes_queue_then_terminates() {
        let h = harness(true);
        h.proxy.say("one", Some("u1".to_string()));
        h.proxy.say("two", Some("u2".to_string()));
        h.proxy.run_and_wait().unwrap();

        let calls = h.calls();
        assert_eq!(calls[0], "start_loop");
        assert_eq!(calls[1], "say one");
        assert_eq!(calls[2], "say two");
        assert!(calls.contains(&"end_loop".to_string()));
        assert!(h.proxy.is_busy());

        let started: Vec<_> = h
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, Notification::StartedUtterance { .. }))
            .map(|e| e.name().map(str::to_string))
            .collect();
        assert_eq!(
            started,
            [Some("u1".to_string()), Some("u2".to_string())]
        );
    }

    #[test]
    fn test_external_loop_lifecycle() {
        let h = harness(true);
        h.proxy.say("stepped", None);
        h.proxy.start_external_loop().unwrap();

        // a second loop of either kind is rejected while one is active
        assert!(matches!(
            h.proxy.start_external_loop(),
            Err(err) if err.downcast_ref::<DispatchError>().is_some()
        ));

        // first step primes the driver idle, which drains the queue
        h.proxy.iterate().unwrap();
        assert_eq!(h.calls(), ["cursor", "say stepped"]);

        h.proxy.end_loop();
        assert!(matches!(
            h.proxy.iterate(),
            Err(DispatchError::NotExternallyDriven)
        ));
    }

    #[test]
    fn test_late_callbacks_after_teardown_are_inert() {
        let h = harness(false);
        let handle = h.handle.clone();
        let calls = Arc::clone(&h.calls);
        drop(h.proxy);

        assert!(calls.lock().unwrap().contains(&"destroy".to_string()));
        // none of these may panic or resurrect state
        handle.set_busy(false);
        handle.notify(Notification::StartedUtterance { name: None });
        assert!(handle.is_busy());
    }
}
