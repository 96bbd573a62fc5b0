//! Reconnect policy: bounded retries, backend-loss turn failure, shutdown.

use std::sync::Arc;
use std::time::Duration;

use coderelay_bridge::mock::{
    text_delta, MockDriver, MockStep, MockTransport, RecordingSink,
};
use coderelay_bridge::store::MemorySessionStore;
use coderelay_bridge::{ConnectionSupervisor, SessionRegistry, TurnEngine};
use coderelay_protocol::ServerMessage;

async fn settle() {
    // Paused-clock tests: let background tasks and timers run.
    for _ in 0..500 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn exactly_three_retries_then_gives_up() {
    let transport = Arc::new(MockTransport::available());
    let sink = Arc::new(RecordingSink::new());
    let supervisor = ConnectionSupervisor::new(transport.clone(), sink.clone());

    supervisor.ensure_connected(false).await.unwrap();
    assert_eq!(transport.connect_attempts(), 1);

    transport.fail_next_connects(usize::MAX);
    transport.close_current("backend crashed");
    settle().await;

    // The initial connect plus exactly three retry attempts.
    assert_eq!(transport.connect_attempts(), 4);
    let status = supervisor.status();
    assert!(!status.connected);
    assert!(!status.runtime_available);
    assert!(status.unavailable_reason.contains("3 reconnect attempts"));
    assert_eq!(sink.lost().len(), 1);
    assert_eq!(sink.announced().len(), 1);

    // No further attempts after exhaustion.
    settle().await;
    assert_eq!(transport.connect_attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn successful_retry_resets_the_budget() {
    let transport = Arc::new(MockTransport::available());
    let sink = Arc::new(RecordingSink::new());
    let supervisor = ConnectionSupervisor::new(transport.clone(), sink.clone());

    supervisor.ensure_connected(false).await.unwrap();
    transport.fail_next_connects(2);
    transport.close_current("blip");
    settle().await;

    let status = supervisor.status();
    assert!(status.connected, "third retry should have landed");
    assert_eq!(status.retry_count, 0);
    // initial + two failed retries + one successful retry
    assert_eq!(transport.connect_attempts(), 4);

    // A later disconnect gets a fresh budget.
    transport.fail_next_connects(usize::MAX);
    transport.close_current("gone again");
    settle().await;
    assert_eq!(transport.connect_attempts(), 7);
    assert_eq!(sink.lost().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn backend_loss_fails_the_running_turn() {
    let driver = MockDriver::new();
    driver.script_turn(vec![
        MockStep::AwaitPrompt,
        MockStep::Event(text_delta(0, "halfway")),
        MockStep::WaitAbort,
    ]);
    let registry = SessionRegistry::new(Arc::new(MemorySessionStore::new()));
    let engine = TurnEngine::new(registry.clone(), Arc::new(driver));
    let transport = Arc::new(MockTransport::available());
    let supervisor = ConnectionSupervisor::new(transport.clone(), Arc::new(engine.clone()));

    supervisor.ensure_connected(false).await.unwrap();
    let id = registry.create_session().await;
    engine
        .send_user_message(&id, "do the thing", Vec::new(), Vec::new())
        .await
        .unwrap();
    settle().await;

    transport.fail_next_connects(usize::MAX);
    transport.close_current("backend crashed");
    settle().await;

    registry
        .with_session(&id, |session| {
            assert!(!session.is_processing);
            assert!(session.history.iter().any(
                |m| matches!(m, ServerMessage::Error { text } if text.contains("disconnected"))
            ));
            assert!(session
                .history
                .iter()
                .any(|m| matches!(m, ServerMessage::Done { code: 1 })));
        })
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn backend_loss_fails_each_running_turn_once() {
    let driver = MockDriver::new();
    // One script per running turn.
    for _ in 0..2 {
        driver.script_turn(vec![
            MockStep::AwaitPrompt,
            MockStep::Event(text_delta(0, "halfway")),
            MockStep::WaitAbort,
        ]);
    }
    let registry = SessionRegistry::new(Arc::new(MemorySessionStore::new()));
    let engine = TurnEngine::new(registry.clone(), Arc::new(driver));
    let transport = Arc::new(MockTransport::available());
    let supervisor = ConnectionSupervisor::new(transport.clone(), Arc::new(engine.clone()));

    supervisor.ensure_connected(false).await.unwrap();
    let first = registry.create_session().await;
    engine
        .send_user_message(&first, "task one", Vec::new(), Vec::new())
        .await
        .unwrap();
    let second = registry.create_session().await;
    engine
        .send_user_message(&second, "task two", Vec::new(), Vec::new())
        .await
        .unwrap();
    let idle = registry.create_session().await;
    settle().await;

    transport.fail_next_connects(usize::MAX);
    transport.close_current("backend crashed");
    settle().await;

    for id in [&first, &second] {
        registry
            .with_session(id, |session| {
                assert!(!session.is_processing);
                let errors = session
                    .history
                    .iter()
                    .filter(|m| matches!(m, ServerMessage::Error { .. }))
                    .count();
                assert_eq!(errors, 1, "one failure per running turn");
                let dones = session
                    .history
                    .iter()
                    .filter(|m| matches!(m, ServerMessage::Done { code: 1 }))
                    .count();
                assert_eq!(dones, 1);
            })
            .await
            .unwrap();
    }
    registry
        .with_session(&idle, |session| {
            assert!(session.history.is_empty(), "idle session untouched");
        })
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_turns_and_stops_retries() {
    let transport = Arc::new(MockTransport::available());
    let sink = Arc::new(RecordingSink::new());
    let supervisor = ConnectionSupervisor::new(transport.clone(), sink.clone());

    supervisor.ensure_connected(false).await.unwrap();
    transport.fail_next_connects(usize::MAX);
    transport.close_current("crash");
    // Let the first retry get scheduled, then shut down mid-policy.
    tokio::time::sleep(Duration::from_millis(100)).await;
    supervisor.shutdown().await;
    settle().await;

    assert_eq!(sink.shutdowns(), 1);
    let attempts_at_shutdown = transport.connect_attempts();
    settle().await;
    assert_eq!(transport.connect_attempts(), attempts_at_shutdown);
    assert!(supervisor.status().shutting_down);
}
