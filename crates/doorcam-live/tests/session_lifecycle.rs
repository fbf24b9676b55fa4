//! End-to-end behaviour of `SessionCore` against a fake door unit and fake
//! decoders, in paused virtual time.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::mock::{
    settle_for, spawn_session, wait_for_phase, wait_until, FakeDevice, FakeFactory, StartReply,
    STREAM_URL,
};
use doorcam_live::error::{CommandError, DecoderError, SessionClosed};
use doorcam_proto::protocol::{Intent, Phase, StreamAction};

#[tokio::test(start_paused = true)]
async fn expand_reaches_playing_with_one_start() {
    let device = FakeDevice::new(StartReply::Ack);
    let factory = FakeFactory::new();
    let (session, _core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    let playing = wait_for_phase(&session, Phase::Playing).await;

    assert_eq!(playing.generation, 1);
    assert_eq!(playing.last_error, None);
    assert_eq!(device.commands(), vec![StreamAction::Start]);
    assert_eq!(factory.stats.created(), 1);
    assert_eq!(factory.stats.played(), 1);
    assert!(factory.stats.looping.load(Ordering::SeqCst));
    assert_eq!(*factory.stats.urls.lock().unwrap(), vec![STREAM_URL.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn decoder_is_created_only_after_ack_and_settle() {
    let device = FakeDevice::new(StartReply::AckAfter(Duration::from_secs(2)));
    let factory = FakeFactory::new();
    let (session, _core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    settle_for(Duration::from_millis(2_500)).await;
    assert_eq!(session.snapshot().phase, Phase::Starting);
    assert_eq!(factory.stats.created(), 0, "1s settle has not elapsed yet");

    wait_for_phase(&session, Phase::Playing).await;
    assert_eq!(factory.stats.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn collapse_from_playing_stops_once_and_disposes_before_idle() {
    let device = FakeDevice::new(StartReply::Ack);
    let factory = FakeFactory::new();
    let (session, _core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    wait_for_phase(&session, Phase::Playing).await;

    let mut updates = session.subscribe();
    session.collapse().await.unwrap();
    let idle = wait_for_phase(&session, Phase::Idle).await;

    assert_eq!(factory.stats.disposed(), 1);
    assert_eq!(factory.stats.alive(), 0);
    assert_eq!(device.commands(), vec![StreamAction::Start, StreamAction::Stop]);
    assert_eq!(idle.last_error, None);

    assert_eq!(updates.recv().await.unwrap().phase, Phase::Stopping);
    assert_eq!(updates.recv().await.unwrap().phase, Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn repeated_expand_sends_one_start() {
    let device = FakeDevice::new(StartReply::AckAfter(Duration::from_millis(300)));
    let factory = FakeFactory::new();
    let (session, _core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    session.expand().await.unwrap();
    session.send_intent(Intent::Expand).await.unwrap();
    wait_for_phase(&session, Phase::Playing).await;
    session.expand().await.unwrap();
    settle_for(Duration::from_secs(5)).await;

    assert_eq!(device.commands(), vec![StreamAction::Start]);
    assert_eq!(factory.stats.created(), 1);
    assert_eq!(session.snapshot().generation, 1);
}

#[tokio::test(start_paused = true)]
async fn remote_timeout_fails_without_creating_a_decoder() {
    // The door unit never answers inside the start deadline.
    let device = FakeDevice::new(StartReply::AckAfter(Duration::from_secs(60)));
    let factory = FakeFactory::new();
    let (session, _core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    let failed = wait_for_phase(&session, Phase::Failed).await;

    assert_eq!(
        failed.last_error.as_deref(),
        Some("Camera did not respond in time")
    );
    assert_eq!(factory.stats.created(), 0);

    // Best-effort stop queues behind the hung start.
    settle_for(Duration::from_secs(60)).await;
    assert_eq!(device.commands(), vec![StreamAction::Start, StreamAction::Stop]);
    assert_eq!(session.snapshot().phase, Phase::Failed);
}

#[tokio::test(start_paused = true)]
async fn client_side_timeout_is_reported_as_timeout() {
    let device = FakeDevice::new(StartReply::FailAfter(
        Duration::from_secs(5),
        CommandError::Timeout(Duration::from_secs(5)),
    ));
    let factory = FakeFactory::new();
    let (session, _core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    let failed = wait_for_phase(&session, Phase::Failed).await;
    assert_eq!(
        failed.last_error.as_deref(),
        Some("Camera did not respond in time")
    );
    assert_eq!(factory.stats.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn init_timeout_disposes_partial_decoder_and_stops_remote() {
    let device = FakeDevice::new(StartReply::Ack);
    let factory = FakeFactory::new().with_init_delay(Duration::from_secs(600));
    let (session, _core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    let failed = wait_for_phase(&session, Phase::Failed).await;

    assert_eq!(failed.last_error.as_deref(), Some("Live feed timed out"));
    assert_eq!(factory.stats.created(), 1);
    assert_eq!(factory.stats.disposed(), 1);
    assert_eq!(factory.stats.played(), 0);

    settle_for(Duration::from_secs(1)).await;
    assert_eq!(device.commands(), vec![StreamAction::Start, StreamAction::Stop]);
}

#[tokio::test(start_paused = true)]
async fn init_error_is_reported_and_cleared_on_retry() {
    let device = FakeDevice::new(StartReply::Ack);
    let factory =
        FakeFactory::new().with_init_error(DecoderError::InitFailed("404 Not Found".into()));
    let (session, _core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    let failed = wait_for_phase(&session, Phase::Failed).await;
    assert_eq!(
        failed.last_error.as_deref(),
        Some("Live feed could not be opened")
    );
    assert_eq!(factory.stats.alive(), 0);

    session.expand().await.unwrap();
    let retry = wait_for_phase(&session, Phase::Starting).await;
    assert_eq!(retry.last_error, None);
    assert_eq!(retry.generation, 2);
}

#[tokio::test(start_paused = true)]
async fn rejected_start_then_collapse_goes_idle_without_error() {
    let device = FakeDevice::new(StartReply::Fail(CommandError::Rejected("busy".into())));
    let factory = FakeFactory::new();
    let (session, _core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    let failed = wait_for_phase(&session, Phase::Failed).await;
    assert_eq!(
        failed.last_error.as_deref(),
        Some("Camera refused to start streaming")
    );

    session.collapse().await.unwrap();
    let idle = wait_for_phase(&session, Phase::Idle).await;
    assert_eq!(idle.last_error, None);

    // Device recovers; a fresh expand works.
    device.set_start_reply(StartReply::Ack);
    session.expand().await.unwrap();
    wait_for_phase(&session, Phase::Playing).await;
    assert_eq!(factory.stats.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn collapse_while_starting_discards_the_late_decoder() {
    let device = FakeDevice::new(StartReply::Ack);
    let factory = FakeFactory::new().with_init_delay(Duration::from_secs(3));
    let (session, _core) = spawn_session(&device, &factory);
    let mut updates = session.subscribe();

    session.expand().await.unwrap();
    // Ack is immediate and settle is 1s, so initialize is in progress at 2s.
    settle_for(Duration::from_secs(2)).await;
    assert_eq!(factory.stats.created(), 1);

    session.collapse().await.unwrap();
    wait_for_phase(&session, Phase::Idle).await;
    assert_eq!(factory.stats.alive(), 0, "Idle published with a decoder alive");
    settle_for(Duration::from_secs(10)).await;

    assert_eq!(factory.stats.disposed(), 1);
    assert_eq!(factory.stats.alive(), 0);
    assert_eq!(factory.stats.played(), 0);
    assert_eq!(session.snapshot().phase, Phase::Idle);
    while let Ok(snapshot) = updates.try_recv() {
        assert_ne!(snapshot.phase, Phase::Playing, "stale attempt was adopted");
    }
}

#[tokio::test(start_paused = true)]
async fn idle_waits_for_a_slow_dispose_of_the_superseded_decoder() {
    let device = FakeDevice::new(StartReply::Ack);
    let factory = FakeFactory::new()
        .with_init_delay(Duration::from_secs(10))
        .with_dispose_delay(Duration::from_secs(2));
    let (session, _core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    settle_for(Duration::from_secs(2)).await;
    assert_eq!(factory.stats.alive(), 1);

    let collapsed_at = tokio::time::Instant::now();
    session.collapse().await.unwrap();
    wait_for_phase(&session, Phase::Idle).await;

    assert_eq!(factory.stats.alive(), 0);
    assert_eq!(factory.stats.disposed(), 1);
    assert!(collapsed_at.elapsed() >= Duration::from_secs(2));
    assert_eq!(device.commands(), vec![StreamAction::Start, StreamAction::Stop]);
}

#[tokio::test(start_paused = true)]
async fn expand_while_stopping_restarts_in_order() {
    let device = FakeDevice::new(StartReply::Ack);
    let factory = FakeFactory::new();
    let (session, _core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    wait_for_phase(&session, Phase::Playing).await;
    session.collapse().await.unwrap();
    session.expand().await.unwrap();

    let playing = wait_until(&session, |s| s.phase == Phase::Playing && s.generation > 1).await;
    assert_eq!(playing.generation, 3);
    assert_eq!(
        device.commands(),
        vec![StreamAction::Start, StreamAction::Stop, StreamAction::Start]
    );
    assert_eq!(factory.stats.created(), 2);
    assert_eq!(factory.stats.disposed(), 1);
    assert_eq!(factory.stats.max_alive(), 1);
}

#[tokio::test(start_paused = true)]
async fn rapid_toggling_keeps_at_most_one_decoder() {
    let device = FakeDevice::new(StartReply::AckAfter(Duration::from_millis(120)));
    let factory = FakeFactory::new().with_init_delay(Duration::from_millis(700));
    let (session, _core) = spawn_session(&device, &factory);

    let gaps = [50u64, 900, 1_300, 10, 2_000, 400, 1_150, 5, 3_000, 250];
    for (i, gap) in gaps.iter().cycle().take(40).enumerate() {
        if i % 2 == 0 {
            session.expand().await.unwrap();
        } else {
            session.collapse().await.unwrap();
        }
        settle_for(Duration::from_millis(*gap)).await;
    }
    session.collapse().await.unwrap();
    settle_for(Duration::from_secs(30)).await;

    let stats = &factory.stats;
    assert_eq!(session.snapshot().phase, Phase::Idle);
    assert!(stats.max_alive() <= 1, "max alive {}", stats.max_alive());
    assert_eq!(stats.created(), stats.disposed());
    assert_eq!(stats.alive(), 0);

    // Remote commands alternate and end stopped.
    let commands = device.commands();
    assert_eq!(commands.last(), Some(&StreamAction::Stop));
    for pair in commands.windows(2) {
        assert_ne!(pair[0], pair[1], "{:?}", commands);
    }
}

#[tokio::test(start_paused = true)]
async fn play_failure_after_adoption_fails_and_disposes() {
    let device = FakeDevice::new(StartReply::Ack);
    let factory = FakeFactory::new().with_play_error(DecoderError::Ipc("mpv went away".into()));
    let (session, _core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    let failed = wait_for_phase(&session, Phase::Failed).await;
    assert_eq!(
        failed.last_error.as_deref(),
        Some("Live feed could not be opened")
    );
    assert_eq!(factory.stats.disposed(), 1);
    settle_for(Duration::from_secs(1)).await;
    assert_eq!(device.commands(), vec![StreamAction::Start, StreamAction::Stop]);
}

#[tokio::test(start_paused = true)]
async fn teardown_while_playing_stops_and_disposes() {
    let device = FakeDevice::new(StartReply::Ack);
    let factory = FakeFactory::new();
    let (session, core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    wait_for_phase(&session, Phase::Playing).await;

    session.shutdown().await.unwrap();
    core.await.unwrap();

    assert_eq!(session.snapshot().phase, Phase::Idle);
    assert_eq!(factory.stats.disposed(), 1);
    assert_eq!(device.commands(), vec![StreamAction::Start, StreamAction::Stop]);
    assert_eq!(session.expand().await, Err(SessionClosed));
}

#[tokio::test(start_paused = true)]
async fn teardown_while_starting_waits_for_attempt_to_dispose() {
    let device = FakeDevice::new(StartReply::Ack);
    let factory = FakeFactory::new().with_init_delay(Duration::from_secs(10));
    let (session, core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    settle_for(Duration::from_secs(2)).await;
    assert_eq!(factory.stats.created(), 1);

    session.shutdown().await.unwrap();
    core.await.unwrap();

    assert_eq!(session.snapshot().phase, Phase::Idle);
    assert_eq!(factory.stats.disposed(), 1);
    assert_eq!(device.commands(), vec![StreamAction::Start, StreamAction::Stop]);
}

#[tokio::test(start_paused = true)]
async fn teardown_is_bounded_when_the_device_hangs() {
    let device = FakeDevice::new(StartReply::AckAfter(Duration::from_secs(3_600)));
    let factory = FakeFactory::new();
    let (session, core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    settle_for(Duration::from_millis(100)).await;

    let started = tokio::time::Instant::now();
    session.shutdown().await.unwrap();
    core.await.unwrap();

    // Grace (3s) plus the command drain (10s), then it gives up.
    assert!(started.elapsed() <= Duration::from_secs(14), "{:?}", started.elapsed());
    assert_eq!(session.snapshot().phase, Phase::Idle);
    assert_eq!(factory.stats.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_delivers_a_stop_queued_behind_a_slow_start() {
    // The start outlives the teardown grace; the stop behind it must still go out.
    let device = FakeDevice::new(StartReply::AckAfter(Duration::from_secs(8)));
    let factory = FakeFactory::new();
    let (session, core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    settle_for(Duration::from_millis(200)).await;

    session.shutdown().await.unwrap();
    core.await.unwrap();

    assert_eq!(device.commands(), vec![StreamAction::Start, StreamAction::Stop]);
    assert_eq!(session.snapshot().phase, Phase::Idle);
    assert_eq!(factory.stats.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_tears_down() {
    let device = FakeDevice::new(StartReply::Ack);
    let factory = FakeFactory::new();
    let (session, core) = spawn_session(&device, &factory);

    session.expand().await.unwrap();
    wait_for_phase(&session, Phase::Playing).await;
    drop(session);
    core.await.unwrap();

    assert_eq!(factory.stats.disposed(), 1);
    assert_eq!(device.commands().last(), Some(&StreamAction::Stop));
}
