use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use genstore_service::{GenerationError, ObtainError, WriteDestination};
use genstore_test::{setup, tempdir, wait_for};

use crate::*;

#[test]
fn test_obtain_generates_once() {
    setup();
    let dir = tempdir();
    let engine = engine(&dir);
    let script = Script::new(&[b"hello ", b"world"]);

    let mut first = Recorder::new();
    engine.obtain_item(&mut first, "greeting", script.clone()).unwrap();
    assert_eq!(first.text(), "hello world");

    let mut second = Recorder::new();
    engine.obtain_item(&mut second, "greeting", script).unwrap();
    assert_eq!(second.text(), "hello world");
    assert_eq!(second.calls, 1);

    assert_eq!(engine.backend().generations(), 1);
    assert_eq!(
        fs::read(stable_path(&engine, "greeting")).unwrap(),
        b"hello world"
    );
    wait_for(TIMEOUT, || engine.in_flight() == 0);
    assert!(leftover_temp_files(&engine).is_empty());
}

#[test]
fn test_concurrent_requests_share_generation() {
    setup();
    let dir = tempdir();
    let engine = engine(&dir);
    let gate = Gate::new();
    let script = Script::new(&[b"hello", b" ", b"world"]).gated(1, &gate);

    let results = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                let script = script.clone();
                s.spawn(move || {
                    let mut recorder = Recorder::new();
                    engine.obtain_item(&mut recorder, "greeting", script).map(|_| recorder)
                })
            })
            .collect();

        wait_for(TIMEOUT, || engine.in_flight() == 1);
        thread::sleep(Duration::from_millis(50));
        gate.open();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    for result in results {
        assert_eq!(result.unwrap().text(), "hello world");
    }
    assert_eq!(engine.backend().generations(), 1);
    assert_eq!(
        fs::metadata(stable_path(&engine, "greeting")).unwrap().len(),
        11
    );
}

#[test]
fn test_distinct_ids_generate_separately() {
    setup();
    let dir = tempdir();
    let engine = engine(&dir);

    let mut dest = WriteDestination(Vec::new());
    engine
        .obtain_item(&mut dest, "a", Script::new(&[b"first"]))
        .unwrap();
    engine
        .obtain_item(&mut dest, "b", Script::new(&[b"second"]))
        .unwrap();

    assert_eq!(dest.into_inner(), b"firstsecond");
    assert_eq!(engine.backend().generations(), 2);
}

#[test]
fn test_empty_object() {
    setup();
    let dir = tempdir();
    let engine = engine(&dir);

    let mut recorder = Recorder::new();
    engine
        .obtain_item(&mut recorder, "empty", Script::new(&[]))
        .unwrap();
    assert!(recorder.data.is_empty());
    assert_eq!(
        fs::metadata(stable_path(&engine, "empty")).unwrap().len(),
        0
    );
}

#[test]
fn test_failed_generation_reaches_all_requesters() {
    setup();
    let dir = tempdir();
    let engine = engine(&dir);
    let gate = Gate::new();
    let script = Script::new(&[b"hello", b"!"]).gated(1, &gate).failing("boom");

    let (first, second) = thread::scope(|s| {
        let first = s.spawn(|| engine.obtain_item(&mut Recorder::new(), "doomed", script.clone()));
        wait_for(TIMEOUT, || engine.in_flight() == 1);
        let second = s.spawn(|| {
            let mut recorder = Recorder::new();
            let result = engine.obtain_item(&mut recorder, "doomed", script.clone());
            (result, recorder)
        });
        thread::sleep(Duration::from_millis(50));
        gate.open();
        (first.join().unwrap(), second.join().unwrap())
    });

    let err = first.unwrap_err();
    assert!(error_chain(&err).iter().any(|e| e.contains("boom")), "{err:?}");

    let (result, recorder) = second;
    let err = result.unwrap_err();
    assert!(error_chain(&err).iter().any(|e| e.contains("boom")), "{err:?}");
    // everything that was written before the failure is handed out
    assert_eq!(recorder.text(), "hello!");

    assert!(!stable_path(&engine, "doomed").exists());
    wait_for(TIMEOUT, || engine.in_flight() == 0);
    assert!(leftover_temp_files(&engine).is_empty());
}

#[test]
fn test_retry_after_failed_generation() {
    setup();
    let dir = tempdir();
    let engine = engine(&dir);

    let err = engine
        .obtain_item(
            &mut Recorder::new(),
            "flaky",
            Script::new(&[b"partial"]).failing("boom"),
        )
        .unwrap_err();
    assert!(matches!(err, ObtainError::Copy(_)), "{err:?}");
    wait_for(TIMEOUT, || engine.in_flight() == 0);

    let mut recorder = Recorder::new();
    engine
        .obtain_item(&mut recorder, "flaky", Script::new(&[b"complete"]))
        .unwrap();
    assert_eq!(recorder.text(), "complete");
    assert_eq!(engine.backend().generations(), 2);
}

#[test]
fn test_owner_disconnect_then_failure() {
    setup();
    let dir = tempdir();
    let engine = engine(&dir);
    let gate = Gate::new();
    let script = Script::new(&[b"data"]).gated(0, &gate).failing("boom");

    let err = engine
        .obtain_item(&mut Disconnected, "doomed", script)
        .unwrap_err();
    assert!(matches!(err, ObtainError::Copy(_)), "{err:?}");
    // the owner gave up, but the generation carries on
    assert_eq!(engine.in_flight(), 1);
    gate.open();

    wait_for(TIMEOUT, || engine.in_flight() == 0);
    assert!(!stable_path(&engine, "doomed").exists());
    assert!(leftover_temp_files(&engine).is_empty());
}

#[test]
fn test_disconnected_destination_does_not_abort_generation() {
    setup();
    let dir = tempdir();
    let engine = engine(&dir);

    let err = engine
        .obtain_item(&mut Disconnected, "greeting", Script::new(&[b"hello"]))
        .unwrap_err();
    let ObtainError::Copy(err) = err else {
        panic!("unexpected error: {err:?}");
    };
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);

    wait_for(TIMEOUT, || engine.in_flight() == 0);
    assert_eq!(fs::read(stable_path(&engine, "greeting")).unwrap(), b"hello");

    let mut recorder = Recorder::new();
    engine
        .obtain_item(&mut recorder, "greeting", Script::new(&[b"other"]))
        .unwrap();
    assert_eq!(recorder.text(), "hello");
    assert_eq!(engine.backend().generations(), 1);
}

#[test]
fn test_resume_after_forced_close() {
    setup();
    let dir = tempdir();
    let engine = engine(&dir);
    let gate = Gate::new();
    let script = Script::new(&[b"hello ", b"world"]).gated(1, &gate);

    let path = stable_path(&engine, "greeting");
    let mut recorder = Recorder::new();
    recorder.after_first_read = Some(Box::new({
        let gate = Arc::clone(&gate);
        move || {
            // let the generation finish and publish while we hold on to the stream
            gate.open();
            wait_for(TIMEOUT, || path.exists());
        }
    }));

    engine
        .obtain_item(&mut recorder, "greeting", script)
        .unwrap();

    assert_eq!(recorder.text(), "hello world");
    // the second call continues from the published file
    assert_eq!(recorder.calls, 2);
    assert_eq!(engine.backend().generations(), 1);
}

#[test]
fn test_panicking_generation() {
    setup();
    let dir = tempdir();
    let engine = engine(&dir);
    let script = Script {
        panic: true,
        ..Script::new(&[b"partial"])
    };

    let result = engine.obtain_item(&mut Recorder::new(), "explosive", script);
    assert!(result.is_err());

    wait_for(TIMEOUT, || engine.in_flight() == 0);
    assert!(!stable_path(&engine, "explosive").exists());
    assert!(leftover_temp_files(&engine).is_empty());

    let mut recorder = Recorder::new();
    engine
        .obtain_item(&mut recorder, "explosive", Script::new(&[b"calm"]))
        .unwrap();
    assert_eq!(recorder.text(), "calm");
}

#[test]
fn test_error_classification() {
    let err = ObtainError::from(GenerationError::Panicked);
    assert!(!err.is_internal());
    assert!(ObtainError::MissingAfterGeneration.is_internal());
}

#[test]
fn test_withdraw_when_published_concurrently() {
    setup();
    let dir = tempdir();
    let engine = engine(&dir);

    // another worker publishes between our cache lookup and our registration
    let path = stable_path(&engine, "greeting");
    engine.backend().before_temp_file(move || {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"published elsewhere").unwrap();
    });

    let mut recorder = Recorder::new();
    engine
        .obtain_item(&mut recorder, "greeting", Script::new(&[b"ours"]))
        .unwrap();

    assert_eq!(recorder.text(), "published elsewhere");
    assert_eq!(engine.backend().generations(), 0);
    assert_eq!(engine.in_flight(), 0);
    assert!(leftover_temp_files(&engine).is_empty());
}

#[test]
fn test_existing_file_is_not_replaced() {
    setup();
    let dir = tempdir();
    let engine = engine(&dir);
    let gate = Gate::new();
    let path = stable_path(&engine, "greeting");

    let err = engine
        .obtain_item(
            &mut Disconnected,
            "greeting",
            Script::new(&[b"generated"]).gated(0, &gate),
        )
        .unwrap_err();
    assert!(matches!(err, ObtainError::Copy(_)), "{err:?}");

    // another process publishes while we are still generating
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"published elsewhere").unwrap();
    gate.open();

    wait_for(TIMEOUT, || engine.in_flight() == 0);
    assert_eq!(fs::read(&path).unwrap(), b"published elsewhere");
    assert_eq!(engine.backend().generations(), 1);
    assert!(leftover_temp_files(&engine).is_empty());
}

#[test]
fn test_stable_file_present_on_return() {
    setup();
    let dir = tempdir();
    let engine = engine(&dir);

    for i in 0..20 {
        let id = format!("x{i}");
        let gate = Gate::new();
        let script = Script::new(&[b"hello", b" world"]).gated(1, &gate);

        thread::scope(|s| {
            let callers: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        let mut recorder = Recorder::new();
                        engine.obtain_item(&mut recorder, &id, script.clone()).unwrap();
                        recorder
                    })
                })
                .collect();
            gate.open();
            for caller in callers {
                assert_eq!(caller.join().unwrap().text(), "hello world");
            }
        });

        // no waiting here, the callers only return once the object is published
        assert_eq!(fs::read(stable_path(&engine, &id)).unwrap(), b"hello world");
    }
}

#[test]
fn test_failed_generation_hands_out_written_bytes() {
    setup();
    let dir = tempdir();
    let engine = engine(&dir);

    for i in 0..20 {
        let id = format!("x{i}");
        let mut recorder = Recorder::new();
        let err = engine
            .obtain_item(&mut recorder, &id, Script::new(&[b"12345"]).failing("boom"))
            .unwrap_err();

        assert!(!err.is_internal(), "{err:?}");
        assert!(error_chain(&err).iter().any(|e| e.contains("boom")), "{err:?}");
        assert_eq!(recorder.text(), "12345");
        assert!(!stable_path(&engine, &id).exists());
    }

    wait_for(TIMEOUT, || engine.in_flight() == 0);
    assert!(leftover_temp_files(&engine).is_empty());
}

#[test]
fn test_persist_failure_reaches_drained_requester() {
    setup();
    let dir = tempdir();
    let engine = engine(&dir);

    // a file where the object's directory should go, created after the cache lookup
    let path = stable_path(&engine, "greeting");
    let blocker = path.parent().unwrap().to_owned();
    engine.backend().before_temp_file(move || {
        fs::create_dir_all(blocker.parent().unwrap()).unwrap();
        fs::write(&blocker, b"").unwrap();
    });

    let mut recorder = Recorder::new();
    let err = engine
        .obtain_item(&mut recorder, "greeting", Script::new(&[b"hello"]))
        .unwrap_err();
    assert!(
        matches!(err, ObtainError::Generation(GenerationError::Persist(_))),
        "{err:?}"
    );
    assert!(!err.is_internal());
    wait_for(TIMEOUT, || engine.in_flight() == 0);
    assert!(leftover_temp_files(&engine).is_empty());
}
