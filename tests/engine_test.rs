use std::sync::Arc;
use std::time::Duration;

use autofire::test_support::MockBackend;
use autofire::{
    AutofireEngine, AutofireError, EngineOptions, Notice, SendMethod, Slot, Target, WindowHandle,
};
use tokio::time;

fn engine_with(options: EngineOptions) -> (Arc<MockBackend>, AutofireEngine) {
    let backend = Arc::new(MockBackend::new());
    let engine = AutofireEngine::new(backend.clone(), options);
    (backend, engine)
}

fn engine() -> (Arc<MockBackend>, AutofireEngine) {
    engine_with(EngineOptions::default())
}

/// Let the coordinator drain queued edges.
async fn settle() {
    time::sleep(Duration::from_millis(5)).await;
}

async fn status(engine: &AutofireEngine) -> String {
    engine.status().await.to_string()
}

#[tokio::test(start_paused = true)]
async fn test_emits_at_interval_while_held() {
    let (backend, engine) = engine();
    let sender = backend.sender();
    engine
        .apply(vec![Slot::new(1, "e", "r").with_interval(100)])
        .await
        .unwrap();
    engine.start().await.unwrap();

    backend.press("e");
    time::sleep(Duration::from_millis(1000)).await;
    backend.release("e");
    settle().await;

    let count = sender.emissions("r");
    assert!((9..=11).contains(&count), "got {count} emissions");
    assert_eq!(sender.downs("r"), sender.ups("r"));

    let times = sender.emission_times("r");
    for pair in times.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= Duration::from_millis(95) && gap <= Duration::from_millis(105),
            "gap {gap:?}"
        );
    }

    // Nothing more once released
    time::sleep(Duration::from_millis(500)).await;
    assert_eq!(sender.emissions("r"), count);
}

#[tokio::test(start_paused = true)]
async fn test_two_slots_keep_their_own_timing() {
    let (backend, engine) = engine();
    let sender = backend.sender();
    engine
        .apply(vec![
            Slot::new(1, "e", "r").with_interval(50),
            Slot::new(2, "q", "w").with_interval(100),
        ])
        .await
        .unwrap();
    engine.start().await.unwrap();

    backend.press("e");
    backend.press("q");
    time::sleep(Duration::from_millis(1000)).await;
    backend.release("e");
    backend.release("q");
    settle().await;

    let r = sender.emissions("r");
    let w = sender.emissions("w");
    assert!((19..=21).contains(&r), "got {r} r emissions");
    assert!((9..=11).contains(&w), "got {w} w emissions");
}

#[tokio::test(start_paused = true)]
async fn test_disabled_slot_is_not_bound() {
    let (backend, engine) = engine();
    let sender = backend.sender();
    engine
        .apply(vec![Slot::new(1, "e", "r"), Slot::new(2, "f", "g").disabled()])
        .await
        .unwrap();
    engine.start().await.unwrap();

    assert_eq!(backend.watched_keys(), vec!["e"]);
    assert_eq!(backend.watched_chords(), vec!["ctrl+alt+escape"]);
    assert_eq!(status(&engine).await, "Running (1 slots)");

    backend.press("f");
    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sender.emissions("g"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_apply_leaves_engine_untouched() {
    let (backend, engine) = engine();
    engine.apply(vec![Slot::new(1, "e", "r")]).await.unwrap();
    engine.start().await.unwrap();
    let mut notices = engine.subscribe_notices();

    let err = engine
        .apply(vec![Slot::new(1, "q", "w").with_interval(0)])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AutofireError::Config {
            slot: 1,
            field: "interval_ms",
            ..
        }
    ));

    assert_eq!(engine.slots().await, vec![Slot::new(1, "e", "r")]);
    assert_eq!(status(&engine).await, "Running (1 slots)");
    assert_eq!(backend.watched_keys(), vec!["e"]);
    assert!(matches!(notices.try_recv(), Ok(Notice::Rejected { .. })));

    let err = engine
        .apply(vec![Slot::new(1, "e", "not-a-key")])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AutofireError::Config {
            field: "output_key",
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_apply_disarms_and_installs() {
    let (backend, engine) = engine();
    let sender = backend.sender();
    engine.apply(vec![Slot::new(1, "e", "r")]).await.unwrap();
    engine.start().await.unwrap();

    backend.press("e");
    time::sleep(Duration::from_millis(200)).await;
    engine.apply(vec![Slot::new(1, "q", "w")]).await.unwrap();

    assert_eq!(status(&engine).await, "Stopped");
    assert_eq!(backend.open_watches(), 0);
    let frozen = sender.emissions("r");
    assert_eq!(sender.downs("r"), sender.ups("r"));
    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sender.emissions("r"), frozen);

    engine.start().await.unwrap();
    assert_eq!(backend.watched_keys(), vec!["q"]);
    backend.press("q");
    time::sleep(Duration::from_millis(120)).await;
    assert!(sender.emissions("w") > 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_errors() {
    let (backend, engine) = engine();

    // Nothing enabled
    engine
        .apply(vec![Slot::new(1, "e", "r").disabled()])
        .await
        .unwrap();
    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, AutofireError::Engine(_)));
    assert_eq!(status(&engine).await, "Stopped");

    // Sender unavailable
    backend.set_unavailable(SendMethod::Script);
    engine
        .apply(vec![
            Slot::new(1, "e", "r"),
            Slot::new(2, "q", "w").with_method(SendMethod::Script),
        ])
        .await
        .unwrap();
    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, AutofireError::Engine(_)));
    assert_eq!(backend.open_watches(), 0);
    assert_eq!(status(&engine).await, "Stopped");
}

#[tokio::test(start_paused = true)]
async fn test_start_and_stop_are_idempotent() {
    let (backend, engine) = engine();
    engine.apply(vec![Slot::new(1, "e", "r")]).await.unwrap();

    // Stop before anything was started
    engine.stop().await.unwrap();

    engine.start().await.unwrap();
    engine.start().await.unwrap();
    assert_eq!(backend.open_watches(), 1);
    assert_eq!(backend.watched_keys(), vec!["e"]);

    engine.stop().await.unwrap();
    engine.stop().await.unwrap();
    assert_eq!(backend.open_watches(), 0);
    assert!(backend.watched_keys().is_empty());
    assert_eq!(status(&engine).await, "Stopped");
}

#[tokio::test(start_paused = true)]
async fn test_status_lines_follow_edges() {
    let (backend, engine) = engine();
    let watch = engine.subscribe_status();
    engine
        .apply(vec![Slot::new(1, "e", "r"), Slot::new(2, "q", "w")])
        .await
        .unwrap();
    assert_eq!(*watch.borrow(), "Stopped");

    engine.start().await.unwrap();
    assert_eq!(*watch.borrow(), "Running (2 slots)");

    backend.press("e");
    settle().await;
    assert_eq!(status(&engine).await, "Active: E");

    backend.press("q");
    settle().await;
    assert_eq!(status(&engine).await, "Active: E, Q");
    assert_eq!(*watch.borrow(), "Active: E, Q");

    backend.release("e");
    settle().await;
    assert_eq!(status(&engine).await, "Active: Q");

    backend.release("q");
    settle().await;
    assert_eq!(status(&engine).await, "Running (2 slots)");

    engine.stop().await.unwrap();
    assert_eq!(*watch.borrow(), "Stopped");
}

#[tokio::test(start_paused = true)]
async fn test_trigger_suppressed_once_per_activation() {
    let (backend, engine) = engine();
    let sender = backend.sender();
    engine
        .apply(vec![
            Slot::new(1, "e", "r"),
            Slot::new(2, "q", "w").with_pass_through(true),
        ])
        .await
        .unwrap();
    engine.start().await.unwrap();

    backend.press("e");
    settle().await;
    // OS auto-repeat delivers more down edges while held
    backend.press("e");
    backend.press("e");
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sender.suppress_count("e"), 1);
    assert_eq!(sender.release_count("e"), 0);

    backend.release("e");
    settle().await;
    assert_eq!(sender.release_count("e"), 1);

    backend.press("q");
    time::sleep(Duration::from_millis(100)).await;
    backend.release("q");
    settle().await;
    assert_eq!(sender.suppress_count("q"), 0);
    assert_eq!(sender.release_count("q"), 0);
    assert!(sender.emissions("w") > 0);
}

#[tokio::test(start_paused = true)]
async fn test_shared_trigger_fires_every_slot() {
    let (backend, engine) = engine();
    let sender = backend.sender();
    engine
        .apply(vec![
            Slot::new(1, "e", "r").with_interval(50),
            Slot::new(2, "e", "t").with_interval(100),
        ])
        .await
        .unwrap();
    engine.start().await.unwrap();
    assert_eq!(backend.watched_keys(), vec!["e", "e"]);

    backend.press("e");
    time::sleep(Duration::from_millis(500)).await;
    assert_eq!(status(&engine).await, "Active: E");
    backend.release("e");
    settle().await;

    assert!(sender.emissions("r") > sender.emissions("t"));
    assert!(sender.emissions("t") > 0);
    assert_eq!(status(&engine).await, "Running (2 slots)");
}

#[tokio::test(start_paused = true)]
async fn test_window_target_and_vanishing_window() {
    let (backend, engine) = engine();
    let sender = backend.sender();
    sender.add_window("Game", 42);
    engine
        .apply(vec![Slot::new(1, "e", "r")
            .with_interval(100)
            .with_window("Game")])
        .await
        .unwrap();
    engine.start().await.unwrap();
    let mut notices = engine.subscribe_notices();

    backend.press("e");
    time::sleep(Duration::from_millis(250)).await;
    let before = sender.emissions("r");
    assert!(before >= 2);
    assert!(sender
        .targets("r")
        .iter()
        .all(|t| *t == Target::Window(WindowHandle(42))));

    sender.remove_window("Game");
    match notices.recv().await {
        Ok(Notice::SlotFailed { slot, reason }) => {
            assert_eq!(slot, 1);
            assert!(reason.contains("Game"), "{reason}");
        }
        other => panic!("expected SlotFailed, got {other:?}"),
    }
    settle().await;
    assert_eq!(status(&engine).await, "Running (1 slots)");
    assert_eq!(sender.emissions("r"), before);
    assert_eq!(sender.downs("r"), sender.ups("r"));
    assert_eq!(sender.release_count("e"), 1);

    // Still held: auto-repeat must not restart the failed slot
    sender.add_window("Game", 42);
    backend.press("e");
    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sender.emissions("r"), before);

    // A fresh press does
    backend.release("e");
    settle().await;
    backend.press("e");
    time::sleep(Duration::from_millis(50)).await;
    assert!(sender.emissions("r") > before);
}

#[tokio::test(start_paused = true)]
async fn test_emergency_chord_stops_everything() {
    let (backend, engine) = engine();
    let sender = backend.sender();
    engine
        .apply(vec![Slot::new(1, "e", "r"), Slot::new(2, "q", "w")])
        .await
        .unwrap();
    engine.start().await.unwrap();
    let mut notices = engine.subscribe_notices();

    backend.press("e");
    backend.press("q");
    time::sleep(Duration::from_millis(200)).await;
    backend.fire_emergency();
    settle().await;

    assert_eq!(status(&engine).await, "Stopped");
    assert_eq!(backend.open_watches(), 0);
    assert!(matches!(notices.try_recv(), Ok(Notice::EmergencyStop)));
    assert_eq!(sender.release_count("e"), 1);
    assert_eq!(sender.release_count("q"), 1);

    let r = sender.emissions("r");
    let w = sender.emissions("w");
    time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sender.emissions("r"), r);
    assert_eq!(sender.emissions("w"), w);
    assert_eq!(sender.downs("r"), sender.ups("r"));

    // Edges from the old registration are ignored
    backend.press("e");
    settle().await;
    assert_eq!(status(&engine).await, "Stopped");
}

#[tokio::test(start_paused = true)]
async fn test_emergency_stop_call() {
    let (backend, engine) = engine();
    engine.apply(vec![Slot::new(1, "e", "r")]).await.unwrap();
    engine.start().await.unwrap();
    backend.press("e");
    settle().await;

    engine.emergency_stop().await.unwrap();
    assert_eq!(status(&engine).await, "Stopped");

    // Can be re-armed afterwards
    engine.start().await.unwrap();
    assert_eq!(status(&engine).await, "Running (1 slots)");
}

#[tokio::test(start_paused = true)]
async fn test_rapid_press_release() {
    let (backend, engine) = engine();
    let sender = backend.sender();
    engine
        .apply(vec![Slot::new(1, "e", "r").with_interval(10)])
        .await
        .unwrap();
    engine.start().await.unwrap();

    for _ in 0..20 {
        backend.press("e");
        backend.release("e");
    }
    time::sleep(Duration::from_millis(500)).await;

    assert!(sender.downs("r") <= 20);
    assert_eq!(sender.downs("r"), sender.ups("r"));
    assert_eq!(sender.suppress_count("e"), sender.release_count("e"));
    assert_eq!(status(&engine).await, "Running (1 slots)");
}

#[tokio::test(start_paused = true)]
async fn test_short_interval_caps_hold() {
    let (backend, engine) = engine();
    let sender = backend.sender();
    engine
        .apply(vec![Slot::new(1, "e", "r").with_interval(10)])
        .await
        .unwrap();
    engine.start().await.unwrap();

    backend.press("e");
    time::sleep(Duration::from_millis(200)).await;
    backend.release("e");
    settle().await;

    // A 20ms hold at a 10ms interval would halve the rate
    let count = sender.emissions("r");
    assert!((19..=21).contains(&count), "got {count} emissions");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stuck_loop_reported_on_stop() {
    let (backend, engine) = engine_with(EngineOptions {
        down_hold: Duration::from_millis(1),
        stop_timeout: Some(Duration::from_millis(50)),
        ..EngineOptions::default()
    });
    let sender = backend.sender();
    sender.set_key_up_delay(Duration::from_millis(400));
    engine
        .apply(vec![Slot::new(1, "e", "r").with_interval(100)])
        .await
        .unwrap();
    engine.start().await.unwrap();
    let mut notices = engine.subscribe_notices();

    backend.press("e");
    time::sleep(Duration::from_millis(30)).await;

    let err = engine.stop().await.unwrap_err();
    match err {
        AutofireError::Shutdown { slots } => assert_eq!(slots, vec![1]),
        other => panic!("expected shutdown error, got {other}"),
    }
    assert_eq!(status(&engine).await, "Stopped");
    assert!(matches!(
        notices.try_recv(),
        Ok(Notice::StopTimedOut { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_edges_from_previous_arming_are_dropped() {
    let (backend, engine) = engine();
    let sender = backend.sender();
    engine.apply(vec![Slot::new(1, "e", "r")]).await.unwrap();
    engine.start().await.unwrap();

    // The down edge is still queued when slot 1 is replaced and re-armed
    backend.press("e");
    engine.apply(vec![Slot::new(1, "q", "w")]).await.unwrap();
    engine.start().await.unwrap();
    backend.release("e");
    time::sleep(Duration::from_millis(500)).await;

    assert_eq!(sender.emissions("w"), 0);
    assert_eq!(sender.emissions("r"), 0);
    assert_eq!(status(&engine).await, "Running (1 slots)");

    // The new binding still answers its own trigger
    backend.press("q");
    time::sleep(Duration::from_millis(120)).await;
    assert!(sender.emissions("w") > 0);
}

#[tokio::test(start_paused = true)]
async fn test_failure_during_release_is_reported_once() {
    let (backend, engine) = engine();
    let sender = backend.sender();
    sender.add_window("Game", 42);
    engine
        .apply(vec![Slot::new(1, "e", "r")
            .with_interval(100)
            .with_window("Game")])
        .await
        .unwrap();
    engine.start().await.unwrap();
    let mut notices = engine.subscribe_notices();

    backend.press("e");
    settle().await;
    // Mid-hold: the window closes and the trigger comes up before the
    // pending key-up, its retry and the retried emission all fail
    assert_eq!(sender.downs("r"), 1);
    sender.remove_window("Game");
    backend.release("e");
    time::sleep(Duration::from_millis(50)).await;

    match notices.try_recv() {
        Ok(Notice::SlotFailed { slot, reason }) => {
            assert_eq!(slot, 1);
            assert!(reason.contains("Game"), "{reason}");
        }
        other => panic!("expected SlotFailed, got {other:?}"),
    }
    assert!(matches!(
        notices.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
    assert_eq!(status(&engine).await, "Running (1 slots)");
    assert_eq!(sender.release_count("e"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_suppressed_triggers_are_consumed_by_the_watch() {
    let (backend, engine) = engine();
    engine
        .apply(vec![
            Slot::new(1, "e", "r"),
            Slot::new(2, "q", "w").with_pass_through(true),
        ])
        .await
        .unwrap();
    engine.start().await.unwrap();

    assert_eq!(backend.watched_keys(), vec!["e", "q"]);
    assert_eq!(backend.consumed_keys(), vec!["e"]);

    engine.stop().await.unwrap();
    assert!(backend.consumed_keys().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_modifier_trigger_rejected_by_apply() {
    let (backend, engine) = engine();
    let mut notices = engine.subscribe_notices();

    let err = engine
        .apply(vec![Slot::new(1, "ctrl", "r")])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AutofireError::Config {
            slot: 1,
            field: "trigger_key",
            ..
        }
    ));
    assert!(matches!(notices.try_recv(), Ok(Notice::Rejected { .. })));
    assert!(engine.slots().await.is_empty());
    assert!(backend.watched_keys().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_slow_sender_does_not_hold_back_other_slots() {
    use std::os::unix::fs::PermissionsExt;

    use autofire::key_sender::ScriptSender;

    let dir = tempfile::tempdir().unwrap();
    let helper = dir.path().join("slow-helper.sh");
    std::fs::write(&helper, "#!/bin/sh\nsleep 0.2\n").unwrap();
    std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();

    let (backend, engine) = engine();
    let sender = backend.sender();
    backend.set_sender(SendMethod::Script, Arc::new(ScriptSender::new(helper).unwrap()));
    engine
        .apply(vec![
            Slot::new(1, "e", "r").with_interval(50),
            Slot::new(2, "q", "w")
                .with_interval(100)
                .with_method(SendMethod::Script),
        ])
        .await
        .unwrap();
    engine.start().await.unwrap();

    backend.press("q");
    backend.press("e");
    time::sleep(Duration::from_millis(1000)).await;

    // Every helper call takes 200ms on the blocking pool; slot 1 keeps its
    // 50ms rate on the runtime meanwhile.
    let r = sender.emissions("r");
    assert!(r >= 16, "got {r} r emissions");

    backend.release("e");
    backend.release("q");
    // The helper may still be mid-call; an aborted slot is fine here
    let _ = engine.stop().await;
}
