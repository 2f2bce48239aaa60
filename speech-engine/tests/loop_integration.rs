//! End-to-end runs of the dispatch core against the dummy driver, covering
//! both run-loop modes and mid-utterance cancellation.

use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use speech_engine::drivers::dummy::DummyDriver;
use speech_engine::DriverProxy;
use speech_types::{Notification, PropertyValue};

fn make_proxy() -> (DriverProxy, Receiver<Notification>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let proxy = DriverProxy::new(Box::new(tx), |handle| {
        Ok(Box::new(DummyDriver::new(handle)))
    })
    .unwrap();
    (proxy, rx)
}

fn started_names(events: &[Notification]) -> Vec<Option<String>> {
    events
        .iter()
        .filter(|e| matches!(e, Notification::StartedUtterance { .. }))
        .map(|e| e.name().map(str::to_string))
        .collect()
}

#[test]
fn test_run_and_wait_processes_utterances_in_order() {
    let (proxy, rx) = make_proxy();
    proxy.say("hello there", Some("u1".to_string()));
    proxy.say("goodbye", Some("u2".to_string()));
    proxy.run_and_wait().unwrap();

    let events: Vec<Notification> = rx.try_iter().collect();
    assert_eq!(
        started_names(&events),
        [Some("u1".to_string()), Some("u2".to_string())]
    );

    // both utterances ran to completion
    let finished: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Notification::FinishedUtterance { name, completed } => {
                Some((name.clone(), *completed))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        finished,
        [
            (Some("u1".to_string()), true),
            (Some("u2".to_string()), true)
        ]
    );

    // word boundaries arrive between start and finish, stamped with the
    // utterance they belong to
    let words: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Notification::StartedWord { name, location, length } => {
                Some((name.clone(), *location, *length))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        words,
        [
            (Some("u1".to_string()), 0, 5),
            (Some("u1".to_string()), 6, 5),
            (Some("u2".to_string()), 0, 7)
        ]
    );

    // the loop ended: queue reset, proxy busy until a new loop starts
    assert!(proxy.is_busy());
}

#[test]
fn test_run_and_wait_with_empty_queue_returns_immediately() {
    let (proxy, _rx) = make_proxy();
    proxy.run_and_wait().unwrap();
    assert!(proxy.is_busy());
}

#[test]
fn test_run_and_wait_can_be_repeated() {
    let (proxy, rx) = make_proxy();
    proxy.say("first pass", Some("a".to_string()));
    proxy.run_and_wait().unwrap();
    proxy.say("second pass", Some("b".to_string()));
    proxy.run_and_wait().unwrap();

    let events: Vec<Notification> = rx.try_iter().collect();
    assert_eq!(
        started_names(&events),
        [Some("a".to_string()), Some("b".to_string())]
    );
}

#[test]
fn test_external_loop_iterates_to_completion() {
    let (proxy, rx) = make_proxy();
    proxy.say("one two", Some("a".to_string()));
    proxy.start_external_loop().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut events = Vec::new();
    while Instant::now() < deadline {
        proxy.iterate().unwrap();
        events.extend(rx.try_iter());
        if events
            .iter()
            .any(|e| matches!(e, Notification::FinishedUtterance { .. }))
        {
            break;
        }
    }

    assert_eq!(started_names(&events), [Some("a".to_string())]);
    assert!(events
        .iter()
        .any(|e| matches!(e, Notification::FinishedUtterance { completed: true, .. })));

    proxy.end_loop();
    assert!(proxy.iterate().is_err());
}

#[test]
fn test_stop_mid_utterance_reports_interrupted() {
    let (proxy, rx) = make_proxy();
    proxy.say("a very long utterance", Some("cut".to_string()));
    proxy.start_external_loop().unwrap();

    // the first step primes the driver idle, which dispatches the say; its
    // completion event is still waiting in the driver's queue
    proxy.iterate().unwrap();
    proxy.stop();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut events: Vec<Notification> = rx.try_iter().collect();
    while Instant::now() < deadline {
        proxy.iterate().unwrap();
        events.extend(rx.try_iter());
        if events
            .iter()
            .any(|e| matches!(e, Notification::FinishedUtterance { .. }))
        {
            break;
        }
    }

    // interrupted: finished arrives with completed=false and the pending
    // word boundaries are suppressed
    assert!(events
        .iter()
        .any(|e| matches!(e, Notification::FinishedUtterance { completed: false, .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, Notification::StartedWord { .. })));

    proxy.end_loop();
}

#[test]
fn test_save_to_file_writes_playable_wav() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("utterance.wav");

    let (proxy, rx) = make_proxy();
    proxy.save_to_file("hi there world", &path, Some("f1".to_string()));
    proxy.run_and_wait().unwrap();

    let events: Vec<Notification> = rx.try_iter().collect();
    assert_eq!(started_names(&events), [Some("f1".to_string())]);

    let reader = hound::WavReader::open(&path).unwrap();
    assert!(reader.len() > 0);
    assert_eq!(reader.spec().channels, 1);
}

#[test]
fn test_property_changes_take_effect_between_utterances() {
    let (proxy, _rx) = make_proxy();
    proxy
        .set_property("rate", PropertyValue::Number(120.0))
        .unwrap();
    proxy
        .set_property("voice", PropertyValue::Text("dummy.de".to_string()))
        .unwrap();
    proxy.run_and_wait().unwrap();

    assert_eq!(
        proxy.get_property("rate").unwrap(),
        PropertyValue::Number(120.0)
    );
    assert_eq!(
        proxy.get_property("voice").unwrap(),
        PropertyValue::Text("dummy.de".to_string())
    );

    let voices = proxy.get_property("voices").unwrap();
    let voices = voices.as_voices().unwrap();
    assert!(voices.iter().any(|v| v.id == "dummy.de"));
}
