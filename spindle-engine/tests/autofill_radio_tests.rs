//! Idle-radio integration tests
//!
//! Covers the autofill delay timer end to end: an idle guild pulls
//! from the configured source after the delay, pending pulls are
//! cancelled by manual enqueues, exhausted pulls reschedule, and
//! filler entries answer to `skip_filler` and `stop`.

mod helpers;

use helpers::*;
use spindle_common::{AutofillSource, EngineEvent, PlaybackState};
use std::io::Write as _;
use std::time::Duration;

const GUILD: u64 = 200;
const USER: u64 = 7;

fn radio_config(delay_secs: u64) -> spindle_common::EngineConfig {
    let mut config = quick_config();
    config.autofill.enabled = true;
    config.autofill.delay_secs = delay_secs;
    config.autofill.source_url = Some("radio://test".into());
    config
}

fn radio_tracks() -> Vec<spindle_common::Track> {
    vec![track("r1"), track("r2"), track("r3")]
}

async fn wait_for_autofill(
    rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
) -> (AutofillSource, usize) {
    let event = wait_for(rx, "AutofillTriggered", |e| {
        matches!(e, EngineEvent::AutofillTriggered { .. })
    })
    .await;
    match event {
        EngineEvent::AutofillTriggered { source, added, .. } => (source, added),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_idle_guild_pulls_from_source_url_after_delay() {
    let engine = build_engine(
        radio_config(1),
        ScriptedResolver::with_radio(radio_tracks()),
        StubFetcher::new(Vec::new()),
        Duration::from_secs(60),
    )
    .await;
    let mut rx = engine.bus.subscribe();

    // waking the idle guild arms the radio countdown
    engine.scheduler.snapshot(GUILD).await.unwrap();

    let (source, added) = wait_for_autofill(&mut rx).await;
    assert_eq!(source, AutofillSource::SourceUrl);
    assert_eq!(added, 3);

    let started = wait_for_track_started(&mut rx, "r1").await;
    assert!(started.origin.is_autofill());
    assert_eq!(started.requested_by, None);

    let snapshot = engine.scheduler.snapshot(GUILD).await.unwrap();
    assert_eq!(snapshot.current.as_ref().map(|t| t.id.as_str()), Some("r1"));
    let queued: Vec<&str> = snapshot.queue.iter().map(|e| e.track.id.as_str()).collect();
    assert_eq!(queued, vec!["r2", "r3"]);
}

#[tokio::test]
async fn test_manual_enqueue_cancels_pending_pull() {
    let engine = build_engine(
        radio_config(2),
        ScriptedResolver::with_radio(radio_tracks()),
        StubFetcher::new(Vec::new()),
        Duration::from_secs(60),
    )
    .await;
    let mut rx = engine.bus.subscribe();

    engine.scheduler.snapshot(GUILD).await.unwrap();
    engine.scheduler.enqueue(GUILD, "track:m", USER).await.unwrap();
    wait_for_track_started(&mut rx, "m").await;

    // well past the configured delay: the pull never fires
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_no_event(&mut rx, "autofill pull", |e| {
        matches!(e, EngineEvent::AutofillTriggered { .. })
    });
    let snapshot = engine.scheduler.snapshot(GUILD).await.unwrap();
    assert_eq!(snapshot.current.as_ref().map(|t| t.id.as_str()), Some("m"));
    assert!(snapshot.queue.is_empty());
}

#[tokio::test]
async fn test_exhausted_pull_reschedules() {
    // no URL tracks, no CSV, no likes: every pull comes up empty
    let engine = build_engine(
        radio_config(1),
        ScriptedResolver::with_radio(Vec::new()),
        StubFetcher::new(Vec::new()),
        Duration::from_secs(60),
    )
    .await;
    let mut rx = engine.bus.subscribe();

    engine.scheduler.snapshot(GUILD).await.unwrap();

    wait_for(&mut rx, "first AutofillExhausted", |e| {
        matches!(e, EngineEvent::AutofillExhausted { .. })
    })
    .await;
    // the timer re-arms and tries again
    wait_for(&mut rx, "second AutofillExhausted", |e| {
        matches!(e, EngineEvent::AutofillExhausted { .. })
    })
    .await;
}

#[tokio::test]
async fn test_disabling_autofill_silences_the_radio() {
    let engine = build_engine(
        radio_config(1),
        ScriptedResolver::with_radio(radio_tracks()),
        StubFetcher::new(Vec::new()),
        Duration::from_secs(60),
    )
    .await;
    let mut rx = engine.bus.subscribe();

    engine.scheduler.snapshot(GUILD).await.unwrap();
    engine.scheduler.set_autofill_enabled(GUILD, false).await.unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_no_event(&mut rx, "autofill pull", |e| {
        matches!(e, EngineEvent::AutofillTriggered { .. })
    });
    let snapshot = engine.scheduler.snapshot(GUILD).await.unwrap();
    assert!(!snapshot.autofill_enabled);
    assert_eq!(snapshot.state, PlaybackState::Idle);
}

#[tokio::test]
async fn test_skip_filler_purges_queue_and_skips_current() {
    let engine = build_engine(
        radio_config(1),
        ScriptedResolver::with_radio(radio_tracks()),
        StubFetcher::new(Vec::new()),
        Duration::from_secs(60),
    )
    .await;
    let mut rx = engine.bus.subscribe();

    engine.scheduler.snapshot(GUILD).await.unwrap();
    wait_for_track_started(&mut rx, "r1").await;

    // a manual request queued behind the filler survives the purge
    engine.scheduler.enqueue(GUILD, "track:m", USER).await.unwrap();

    let result = engine.scheduler.skip_filler(GUILD).await.unwrap();
    assert_eq!(result.purged, 2);
    assert!(result.current_skipped);

    assert!(!wait_for_track_finished(&mut rx, "r1").await);
    wait_for_track_started(&mut rx, "m").await;
    let snapshot = engine.scheduler.snapshot(GUILD).await.unwrap();
    assert_eq!(snapshot.current.as_ref().map(|t| t.id.as_str()), Some("m"));
    assert!(snapshot.queue.is_empty());
}

#[tokio::test]
async fn test_stop_restarts_the_radio_countdown() {
    let engine = build_engine(
        radio_config(1),
        ScriptedResolver::with_radio(radio_tracks()),
        StubFetcher::new(Vec::new()),
        Duration::from_secs(60),
    )
    .await;
    let mut rx = engine.bus.subscribe();

    engine.scheduler.snapshot(GUILD).await.unwrap();
    wait_for_autofill(&mut rx).await;
    wait_for_track_started(&mut rx, "r1").await;

    engine.scheduler.stop(GUILD).await.unwrap();
    assert!(!wait_for_track_finished(&mut rx, "r1").await);

    // the queue emptied again, so the countdown re-arms and refills
    let (source, added) = wait_for_autofill(&mut rx).await;
    assert_eq!(source, AutofillSource::SourceUrl);
    assert_eq!(added, 3);
}

#[tokio::test]
async fn test_likes_feed_the_radio_when_no_url_is_set() {
    let mut config = radio_config(1);
    config.autofill.source_url = None;
    let engine = build_engine(
        config,
        ScriptedResolver::new(),
        StubFetcher::new(Vec::new()),
        Duration::from_secs(60),
    )
    .await;
    let mut rx = engine.bus.subscribe();

    // seed likes before the guild wakes up
    use spindle_engine::traits::StateStore;
    engine.store.record_like(GUILD, 1, &track("l1")).await.unwrap();
    engine.store.record_like(GUILD, 1, &track("l2")).await.unwrap();
    engine.store.record_like(GUILD, 2, &track("l3")).await.unwrap();

    engine.scheduler.snapshot(GUILD).await.unwrap();

    let (source, added) = wait_for_autofill(&mut rx).await;
    assert_eq!(source, AutofillSource::UserLikes);
    assert_eq!(added, 3);

    let snapshot = engine.scheduler.snapshot(GUILD).await.unwrap();
    let mut ids: Vec<String> = snapshot
        .queue
        .iter()
        .map(|e| e.track.id.clone())
        .chain(snapshot.current.iter().map(|t| t.id.clone()))
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["l1", "l2", "l3"]);
}

#[tokio::test]
async fn test_csv_seed_feeds_the_radio() {
    let mut seed = tempfile::NamedTempFile::new().unwrap();
    for i in 0..4 {
        writeln!(seed, "c{},Seed {},X,https://cdn.test/c{}.mp3", i, i, i).unwrap();
    }
    let mut config = radio_config(1);
    config.autofill.source_url = None;
    config.autofill.csv_path = Some(seed.path().to_path_buf());
    let engine = build_engine(
        config,
        ScriptedResolver::new(),
        StubFetcher::new(Vec::new()),
        Duration::from_secs(60),
    )
    .await;
    let mut rx = engine.bus.subscribe();

    engine.scheduler.snapshot(GUILD).await.unwrap();

    let (source, added) = wait_for_autofill(&mut rx).await;
    assert_eq!(source, AutofillSource::CsvSeed);
    assert_eq!(added, 4);
    wait_for_track_started(&mut rx, "c0").await;
}
