//! Shared fixtures for engine integration tests
//!
//! Builds a full `GuildScheduler` against an in-memory database, a
//! simulated per-guild voice sink, a scripted resolver, and a stub
//! audio fetcher. All timing in these tests is real time with short
//! windows, so keep configured durations small.

#![allow(dead_code)]

use async_trait::async_trait;
use spindle_common::config::PrefetchMode;
use spindle_common::error::ResolutionKind;
use spindle_common::{
    EngineConfig, EngineEvent, Error, EventBus, PlaybackState, Result, Track, TrackOrigin,
};
use spindle_engine::cache::{AudioFetcher, CacheStore};
use spindle_engine::db::{connect_in_memory, SqliteStateStore};
use spindle_engine::scheduler::{EngineDeps, GuildScheduler};
use spindle_engine::sink::SimulatedSinkProvider;
use spindle_engine::traits::TrackResolver;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// A resolvable test track. Enqueue paths re-tag requester and origin,
/// so the values here only matter for autofill pulls.
pub fn track(id: &str) -> Track {
    Track {
        id: id.to_string(),
        title: format!("Track {}", id),
        artist: "Integration Artist".into(),
        source_url: format!("https://cdn.test/{}.mp3", id),
        duration_secs: Some(180),
        requested_by: None,
        origin: TrackOrigin::Manual,
    }
}

/// Scripted resolver:
/// - `track:<id>` resolves to one track with that id
/// - `batch:<n>` resolves to n tracks `b0..b{n-1}`
/// - `radio://test` resolves to the configured radio tracks
/// - anything else is unsupported
pub struct ScriptedResolver {
    radio: Vec<Track>,
}

impl ScriptedResolver {
    pub fn new() -> Self {
        Self { radio: Vec::new() }
    }

    pub fn with_radio(radio: Vec<Track>) -> Self {
        Self { radio }
    }
}

#[async_trait]
impl TrackResolver for ScriptedResolver {
    async fn resolve(&self, reference: &str) -> Result<Vec<Track>> {
        if let Some(id) = reference.strip_prefix("track:") {
            return Ok(vec![track(id)]);
        }
        if let Some(n) = reference
            .strip_prefix("batch:")
            .and_then(|n| n.parse::<usize>().ok())
        {
            return Ok((0..n).map(|i| track(&format!("b{}", i))).collect());
        }
        if reference == "radio://test" {
            return Ok(self.radio.clone());
        }
        Err(Error::resolution(ResolutionKind::Unsupported, reference))
    }
}

/// Fetcher returning a fixed payload, counting calls and recording the
/// byte cap of the most recent one.
pub struct StubFetcher {
    payload: Vec<u8>,
    delay: Duration,
    fail: bool,
    calls: AtomicUsize,
    last_cap: Mutex<Option<u64>>,
}

impl StubFetcher {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            delay: Duration::ZERO,
            fail: false,
            calls: AtomicUsize::new(0),
            last_cap: Mutex::new(None),
        }
    }

    /// Fetches take `delay` before returning, to widen race windows.
    pub fn slow(payload: Vec<u8>, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(payload)
        }
    }

    /// Every fetch fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_cap(&self) -> Option<u64> {
        *self.last_cap.lock().expect("cap lock")
    }
}

#[async_trait]
impl AudioFetcher for StubFetcher {
    async fn fetch(&self, url: &str, max_bytes: Option<u64>) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_cap.lock().expect("cap lock") = max_bytes;
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(Error::fetch(url, "stub fetch failure"));
        }
        let mut bytes = self.payload.clone();
        if let Some(cap) = max_bytes {
            bytes.truncate(cap as usize);
        }
        Ok(bytes)
    }
}

/// Everything a test needs to drive and observe the engine.
pub struct TestEngine {
    pub scheduler: Arc<GuildScheduler>,
    pub sinks: Arc<SimulatedSinkProvider>,
    pub store: Arc<SqliteStateStore>,
    pub cache: Arc<CacheStore>,
    pub fetcher: Arc<StubFetcher>,
    pub bus: EventBus,
}

/// Fast config for integration runs: tight fades, streaming cache,
/// autofill off unless a test turns it on.
pub fn quick_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.prefetch.mode = PrefetchMode::None;
    config.fade.fade_in_ms = 40;
    config.fade.fade_out_ms = 40;
    config.fade.skip_fade_out_ms = 20;
    config.fade.steps = 4;
    config.fade.hard_timeout_ms = 1000;
    config.autofill.enabled = false;
    config
}

/// Wire up a scheduler over fresh in-memory state. Subscribe to
/// `bus` before issuing the first command to see every event.
pub async fn build_engine(
    config: EngineConfig,
    resolver: ScriptedResolver,
    fetcher: StubFetcher,
    track_duration: Duration,
) -> TestEngine {
    let pool = connect_in_memory().await.expect("in-memory database");
    let store = Arc::new(SqliteStateStore::new(pool));
    let sinks = Arc::new(SimulatedSinkProvider::new(track_duration));
    let fetcher = Arc::new(fetcher);
    let cache = Arc::new(CacheStore::new(config.prefetch.clone(), fetcher.clone()));
    let bus = EventBus::default();
    let scheduler = Arc::new(GuildScheduler::new(EngineDeps {
        config,
        resolver: Arc::new(resolver),
        store: store.clone(),
        sinks: sinks.clone(),
        cache: cache.clone(),
        events: bus.clone(),
    }));
    TestEngine {
        scheduler,
        sinks,
        store,
        cache,
        fetcher,
        bus,
    }
}

/// Receive events until `pred` matches, returning the match. Panics
/// after ten seconds, naming `what` in the failure.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<EngineEvent>,
    what: &str,
    pred: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("event bus closed while waiting for {}", what)
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

pub async fn wait_for_state(
    rx: &mut broadcast::Receiver<EngineEvent>,
    state: PlaybackState,
) -> EngineEvent {
    wait_for(rx, &format!("state {}", state), |e| {
        matches!(
            e,
            EngineEvent::PlaybackStateChanged { new_state, .. } if *new_state == state
        )
    })
    .await
}

pub async fn wait_for_track_started(
    rx: &mut broadcast::Receiver<EngineEvent>,
    track_id: &str,
) -> Track {
    let event = wait_for(rx, &format!("TrackStarted {}", track_id), |e| {
        matches!(e, EngineEvent::TrackStarted { track, .. } if track.id == track_id)
    })
    .await;
    match event {
        EngineEvent::TrackStarted { track, .. } => track,
        _ => unreachable!(),
    }
}

pub async fn wait_for_track_finished(
    rx: &mut broadcast::Receiver<EngineEvent>,
    track_id: &str,
) -> bool {
    let event = wait_for(rx, &format!("TrackFinished {}", track_id), |e| {
        matches!(e, EngineEvent::TrackFinished { track_id: id, .. } if id == track_id)
    })
    .await;
    match event {
        EngineEvent::TrackFinished { completed, .. } => completed,
        _ => unreachable!(),
    }
}

/// Drain everything currently buffered, asserting none of it matches
/// `pred`. Used to prove an event did NOT fire.
pub fn assert_no_event(
    rx: &mut broadcast::Receiver<EngineEvent>,
    what: &str,
    pred: impl Fn(&EngineEvent) -> bool,
) {
    loop {
        match rx.try_recv() {
            Ok(event) => {
                assert!(!pred(&event), "unexpected {}: {:?}", what, event);
            }
            Err(broadcast::error::TryRecvError::Empty) => return,
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(broadcast::error::TryRecvError::Closed) => return,
        }
    }
}
