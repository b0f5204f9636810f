//! Cross-guild cache integration tests
//!
//! The cache store is shared by every guild actor; these tests assert
//! that simultaneous demand for the same track costs one fetch, that
//! warmup mode never touches disk, and that the next queued entry is
//! prefetched while the current one plays.

mod helpers;

use helpers::*;
use spindle_common::config::PrefetchMode;
use spindle_common::PrefetchStatus;
use std::time::Duration;

const USER: u64 = 7;

fn cache_config(mode: PrefetchMode, dir: &std::path::Path) -> spindle_common::EngineConfig {
    let mut config = quick_config();
    config.prefetch.mode = mode;
    config.prefetch.dir = dir.to_path_buf();
    config
}

fn cached_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_two_guilds_share_one_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let payload = vec![0xAB; 4096];
    let engine = build_engine(
        cache_config(PrefetchMode::Full, dir.path()),
        ScriptedResolver::new(),
        StubFetcher::slow(payload.clone(), Duration::from_millis(50)),
        Duration::from_secs(60),
    )
    .await;
    let mut rx = engine.bus.subscribe();

    let guild_a: u64 = 301;
    let guild_b: u64 = 302;
    let (a, b) = tokio::join!(
        engine.scheduler.enqueue(guild_a, "track:shared", USER),
        engine.scheduler.enqueue(guild_b, "track:shared", USER),
    );
    a.unwrap();
    b.unwrap();

    // the two guild actors start independently, so their TrackStarted
    // events can arrive in either order
    let mut started = std::collections::HashSet::new();
    while started.len() < 2 {
        let event = wait_for(&mut rx, "TrackStarted", |e| {
            matches!(
                e,
                spindle_common::EngineEvent::TrackStarted { guild_id, .. }
                    if *guild_id == guild_a || *guild_id == guild_b
            )
        })
        .await;
        if let spindle_common::EngineEvent::TrackStarted { guild_id, .. } = event {
            started.insert(guild_id);
        }
    }

    assert_eq!(engine.fetcher.calls(), 1, "concurrent acquires coalesce");
    assert!(engine.cache.is_ready("shared").await);

    // exactly one finished file on disk, holding the full payload
    let files = cached_files(dir.path());
    assert_eq!(files.len(), 1);
    assert_eq!(std::fs::read(&files[0]).unwrap(), payload);
    assert!(files[0].extension().map_or(false, |e| e != "part"));
}

#[tokio::test]
async fn test_warmup_mode_caps_the_read_and_stays_off_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = cache_config(PrefetchMode::Warmup, dir.path());
    config.prefetch.prefetch_bytes = 1024;
    let engine = build_engine(
        config,
        ScriptedResolver::new(),
        StubFetcher::new(vec![0xCD; 8192]),
        Duration::from_secs(60),
    )
    .await;
    let mut rx = engine.bus.subscribe();

    engine.scheduler.enqueue(400, "track:warm", USER).await.unwrap();
    wait_for_track_started(&mut rx, "warm").await;

    assert_eq!(engine.fetcher.calls(), 1);
    assert_eq!(engine.fetcher.last_cap(), Some(1024));
    assert!(engine.cache.is_ready("warm").await);
    assert!(cached_files(dir.path()).is_empty(), "warmup never persists");
}

#[tokio::test]
async fn test_next_entry_prefetches_while_current_plays() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(
        cache_config(PrefetchMode::Full, dir.path()),
        ScriptedResolver::new(),
        StubFetcher::new(vec![0xEF; 2048]),
        Duration::from_secs(60),
    )
    .await;
    let mut rx = engine.bus.subscribe();

    let guild: u64 = 401;
    engine.scheduler.enqueue(guild, "track:now", USER).await.unwrap();
    engine.scheduler.enqueue(guild, "track:next", USER).await.unwrap();
    wait_for_track_started(&mut rx, "now").await;

    // the queued entry's audio lands in the cache in the background
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = engine.scheduler.snapshot(guild).await.unwrap();
        if snapshot
            .queue
            .first()
            .map_or(false, |e| e.prefetch == PrefetchStatus::Ready)
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "prefetch never completed: {:?}",
            snapshot.queue.first().map(|e| e.prefetch)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(engine.cache.is_ready("next").await);
    assert_eq!(engine.fetcher.calls(), 2);
    assert_eq!(cached_files(dir.path()).len(), 2);
}
