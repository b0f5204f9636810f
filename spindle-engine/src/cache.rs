//! Content-addressed audio cache with single-flight fetches
//!
//! One store serves every guild. Entries are keyed by track id, so
//! concurrent acquires for the same track from different guilds
//! coalesce onto a single network fetch and every waiter gets the
//! same result. Each fetch runs on its own task, so a waiter that
//! gives up (a skip during resolve) leaves the fetch running for
//! everyone else.
//!
//! Behavior by prefetch mode:
//! - `none`: acquires return the remote URL untouched, nothing cached
//! - `warmup`: fetch the first N bytes to prime the CDN path, discard
//!   them, and hand back the remote URL
//! - `full`: download the complete audio to a `.part` file, rename
//!   into place, and hand back the local path
//!
//! Full-mode files are LRU-evicted once the directory exceeds the
//! configured byte cap; entries pinned by an active playback session
//! are never evicted.

use crate::traits::AudioHandle;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use spindle_common::config::{PrefetchConfig, PrefetchMode};
use spindle_common::{Error, Result, Track};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

// ============================================================================
// Fetcher seam
// ============================================================================

/// Pulls raw audio bytes from a source URL. `max_bytes` caps the read
/// for warmup-mode fetches; `None` reads to the end of the stream.
#[async_trait]
pub trait AudioFetcher: Send + Sync {
    async fn fetch(&self, url: &str, max_bytes: Option<u64>) -> Result<Vec<u8>>;
}

/// Streaming HTTP fetcher over a shared reqwest client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, max_bytes: Option<u64>) -> Result<Vec<u8>> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::fetch(url, e.to_string()))?;

        let mut out: Vec<u8> = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::fetch(url, e.to_string()))?
        {
            out.extend_from_slice(&chunk);
            if let Some(cap) = max_bytes {
                if out.len() as u64 >= cap {
                    out.truncate(cap as usize);
                    break;
                }
            }
        }
        Ok(out)
    }
}

// ============================================================================
// Cache store
// ============================================================================

/// Cloneable fetch result broadcast to coalesced waiters.
type FetchResult = std::result::Result<AudioHandle, String>;

enum CacheEntry {
    /// A fetch is running; waiters hold a clone of this receiver.
    InFlight(watch::Receiver<Option<FetchResult>>),
    /// Audio is available (local file, or warmed remote URL).
    Ready {
        handle: AudioHandle,
        bytes: u64,
        last_access: u64,
    },
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    pinned: HashSet<String>,
    /// Logical clock for LRU ordering.
    clock: u64,
}

/// Single-flight audio cache shared by all guild schedulers.
pub struct CacheStore {
    config: PrefetchConfig,
    fetcher: Arc<dyn AudioFetcher>,
    inner: Arc<Mutex<CacheInner>>,
}

impl CacheStore {
    pub fn new(config: PrefetchConfig, fetcher: Arc<dyn AudioFetcher>) -> Self {
        Self {
            config,
            fetcher,
            inner: Arc::new(Mutex::new(CacheInner::default())),
        }
    }

    pub fn mode(&self) -> PrefetchMode {
        self.config.mode
    }

    /// Resolve a track into playable audio, coalescing with any fetch
    /// already in flight for the same track id.
    ///
    /// A failed fetch is surfaced to every coalesced waiter and the
    /// entry is dropped, so the next acquire retries from scratch. The
    /// fetch itself runs on a spawned task; cancelling a waiter never
    /// strands the in-flight entry.
    pub async fn acquire(&self, track: &Track) -> Result<AudioHandle> {
        if self.config.mode == PrefetchMode::None {
            return Ok(AudioHandle::Remote(track.source_url.clone()));
        }

        let mut rx = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            match inner.entries.get_mut(&track.id) {
                Some(CacheEntry::Ready {
                    handle,
                    last_access,
                    ..
                }) => {
                    inner.clock += 1;
                    *last_access = inner.clock;
                    return Ok(handle.clone());
                }
                Some(CacheEntry::InFlight(rx)) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inner
                        .entries
                        .insert(track.id.clone(), CacheEntry::InFlight(rx.clone()));
                    tokio::spawn(run_fetch(
                        self.config.clone(),
                        self.fetcher.clone(),
                        Arc::clone(&self.inner),
                        track.clone(),
                        tx,
                    ));
                    rx
                }
            }
        };
        Self::await_inflight(&track.id, &mut rx).await
    }

    async fn await_inflight(
        track_id: &str,
        rx: &mut watch::Receiver<Option<FetchResult>>,
    ) -> Result<AudioHandle> {
        let resolved = rx
            .wait_for(|v| v.is_some())
            .await
            .map_err(|_| Error::fetch(track_id, "fetch task dropped"))?;
        match resolved.as_ref() {
            Some(Ok(handle)) => Ok(handle.clone()),
            Some(Err(reason)) => Err(Error::fetch(track_id, reason.clone())),
            None => unreachable!("wait_for guarantees Some"),
        }
    }

    /// Keep this track's file out of eviction while it plays.
    pub async fn pin(&self, track_id: &str) {
        self.inner.lock().await.pinned.insert(track_id.to_string());
    }

    pub async fn unpin(&self, track_id: &str) {
        self.inner.lock().await.pinned.remove(track_id);
    }

    /// Drop a cached entry and its file. In-flight entries cannot be
    /// invalidated. Returns whether anything was removed.
    pub async fn invalidate(&self, track_id: &str) -> Result<bool> {
        let removed = {
            let mut inner = self.inner.lock().await;
            if matches!(inner.entries.get(track_id), Some(CacheEntry::InFlight(_))) {
                return Err(Error::InvalidState(format!(
                    "fetch in flight for {}",
                    track_id
                )));
            }
            inner.entries.remove(track_id)
        };
        match removed {
            Some(CacheEntry::Ready {
                handle: AudioHandle::Local(path),
                ..
            }) => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "failed to delete invalidated file");
                }
                Ok(true)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    /// Whether audio for this track is already fetched.
    pub async fn is_ready(&self, track_id: &str) -> bool {
        matches!(
            self.inner.lock().await.entries.get(track_id),
            Some(CacheEntry::Ready { .. })
        )
    }

    /// Total bytes of fully cached audio currently on disk.
    pub async fn cached_bytes(&self) -> u64 {
        self.inner
            .lock()
            .await
            .entries
            .values()
            .map(|e| match e {
                CacheEntry::Ready { bytes, .. } => *bytes,
                CacheEntry::InFlight(_) => 0,
            })
            .sum()
    }
}

/// Owns one coalesced fetch end to end: network read, entry install,
/// waiter notification, eviction of displaced files. Runs as its own
/// task so it always reaches a terminal state and clears or fills the
/// in-flight entry, no matter what happens to the waiters.
async fn run_fetch(
    config: PrefetchConfig,
    fetcher: Arc<dyn AudioFetcher>,
    inner: Arc<Mutex<CacheInner>>,
    track: Track,
    tx: watch::Sender<Option<FetchResult>>,
) {
    let outcome =
        tokio::time::timeout(config.timeout(), do_fetch(&config, fetcher.as_ref(), &track)).await;
    let result: Result<(AudioHandle, u64)> = match outcome {
        Ok(r) => r,
        Err(_) => Err(Error::fetch(
            &track.id,
            format!("fetch timed out after {}s", config.timeout_secs),
        )),
    };

    let evicted = {
        let mut inner = inner.lock().await;
        match result {
            Ok((handle, bytes)) => {
                inner.clock += 1;
                let clock = inner.clock;
                inner.entries.insert(
                    track.id.clone(),
                    CacheEntry::Ready {
                        handle: handle.clone(),
                        bytes,
                        last_access: clock,
                    },
                );
                let evicted = inner.evict_over_cap(config.max_cache_bytes);
                tx.send_replace(Some(Ok(handle)));
                evicted
            }
            Err(e) => {
                warn!(track_id = %track.id, error = %e, "audio fetch failed");
                inner.entries.remove(&track.id);
                tx.send_replace(Some(Err(e.to_string())));
                Vec::new()
            }
        }
    };

    for path in evicted {
        debug!(path = %path.display(), "evicting cached audio");
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "failed to delete evicted file");
        }
    }
}

async fn do_fetch(
    config: &PrefetchConfig,
    fetcher: &dyn AudioFetcher,
    track: &Track,
) -> Result<(AudioHandle, u64)> {
    match config.mode {
        PrefetchMode::None => Ok((AudioHandle::Remote(track.source_url.clone()), 0)),
        PrefetchMode::Warmup => {
            let bytes = fetcher
                .fetch(&track.source_url, Some(config.prefetch_bytes))
                .await?;
            debug!(track_id = %track.id, bytes = bytes.len(), "warmup read complete");
            Ok((AudioHandle::Remote(track.source_url.clone()), 0))
        }
        PrefetchMode::Full => {
            let bytes = fetcher.fetch(&track.source_url, None).await?;
            if bytes.is_empty() {
                return Err(Error::fetch(&track.id, "source returned no audio data"));
            }
            let len = bytes.len() as u64;
            let final_path = path_for(config, track);
            let part_path = final_path.with_extension("part");
            tokio::fs::create_dir_all(&config.dir).await?;
            // write-then-rename so a crash never leaves a truncated
            // file at the final path
            tokio::fs::write(&part_path, &bytes).await?;
            tokio::fs::rename(&part_path, &final_path).await?;
            debug!(track_id = %track.id, bytes = len, path = %final_path.display(), "cached audio");
            Ok((AudioHandle::Local(final_path), len))
        }
    }
}

/// Deterministic on-disk path for a track id.
fn path_for(config: &PrefetchConfig, track: &Track) -> PathBuf {
    let digest = Sha256::digest(track.id.as_bytes());
    let name = format!("{:x}", digest);
    config
        .dir
        .join(format!("{}.{}", &name[..16], guess_ext(&track.source_url)))
}

impl CacheInner {
    /// Remove least-recently-used unpinned local entries until the
    /// byte total fits under `cap`. Returns the files to delete.
    fn evict_over_cap(&mut self, cap: u64) -> Vec<PathBuf> {
        let mut evicted = Vec::new();
        loop {
            let total: u64 = self
                .entries
                .values()
                .map(|e| match e {
                    CacheEntry::Ready { bytes, .. } => *bytes,
                    CacheEntry::InFlight(_) => 0,
                })
                .sum();
            if total <= cap {
                return evicted;
            }
            let victim = self
                .entries
                .iter()
                .filter_map(|(id, e)| match e {
                    CacheEntry::Ready {
                        handle: AudioHandle::Local(_),
                        last_access,
                        ..
                    } if !self.pinned.contains(id) => Some((*last_access, id.clone())),
                    _ => None,
                })
                .min()
                .map(|(_, id)| id);
            let Some(id) = victim else {
                // everything left is pinned or in flight
                return evicted;
            };
            if let Some(CacheEntry::Ready {
                handle: AudioHandle::Local(path),
                ..
            }) = self.entries.remove(&id)
            {
                evicted.push(path);
            }
        }
    }
}

/// File extension from a source URL, `bin` when nothing plausible.
fn guess_ext(url: &str) -> &str {
    let path = url
        .split('#')
        .next()
        .unwrap_or(url)
        .split('?')
        .next()
        .unwrap_or(url);
    match path.rsplit_once('.') {
        Some((_, ext))
            if !ext.is_empty()
                && ext.len() <= 4
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            &path[path.len() - ext.len()..]
        }
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingFetcher {
        calls: AtomicUsize,
        delay: Duration,
        payload: Vec<u8>,
        fail: bool,
    }

    impl CountingFetcher {
        fn new(payload: Vec<u8>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(20),
                payload,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(vec![1, 2, 3])
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AudioFetcher for CountingFetcher {
        async fn fetch(&self, url: &str, max_bytes: Option<u64>) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::fetch(url, "synthetic failure"));
            }
            let mut bytes = self.payload.clone();
            if let Some(cap) = max_bytes {
                bytes.truncate(cap as usize);
            }
            Ok(bytes)
        }
    }

    fn track(id: &str) -> Track {
        Track::manual(id, "T", "A", format!("https://cdn/{}.mp3", id), 1)
    }

    fn full_config(dir: &std::path::Path) -> PrefetchConfig {
        PrefetchConfig {
            mode: PrefetchMode::Full,
            dir: dir.to_path_buf(),
            ..PrefetchConfig::default()
        }
    }

    #[tokio::test]
    async fn test_none_mode_passthrough() {
        let fetcher = Arc::new(CountingFetcher::new(vec![0; 64]));
        let store = CacheStore::new(
            PrefetchConfig {
                mode: PrefetchMode::None,
                ..PrefetchConfig::default()
            },
            fetcher.clone(),
        );
        let handle = store.acquire(&track("a")).await.unwrap();
        assert_eq!(handle, AudioHandle::Remote("https://cdn/a.mp3".into()));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_warmup_mode_returns_remote() {
        let fetcher = Arc::new(CountingFetcher::new(vec![0; 1024]));
        let store = CacheStore::new(
            PrefetchConfig {
                mode: PrefetchMode::Warmup,
                prefetch_bytes: 128,
                ..PrefetchConfig::default()
            },
            fetcher.clone(),
        );
        let handle = store.acquire(&track("a")).await.unwrap();
        assert!(!handle.is_local());
        assert_eq!(fetcher.calls(), 1);
        // second acquire hits the warmed entry, no second fetch
        store.acquire(&track("a")).await.unwrap();
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_full_mode_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(CountingFetcher::new(vec![7; 256]));
        let store = CacheStore::new(full_config(dir.path()), fetcher);
        let handle = store.acquire(&track("a")).await.unwrap();
        let AudioHandle::Local(path) = handle else {
            panic!("expected local handle");
        };
        assert_eq!(path.extension().unwrap(), "mp3");
        assert_eq!(std::fs::read(&path).unwrap().len(), 256);
        // no .part leftovers
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "part"))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(store.cached_bytes().await, 256);
    }

    #[tokio::test]
    async fn test_single_flight_coalesces() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(CountingFetcher::new(vec![1; 64]));
        let store = Arc::new(CacheStore::new(full_config(dir.path()), fetcher.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.acquire(&track("same")).await
            }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }
        assert_eq!(fetcher.calls(), 1);
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_failure_surfaces_then_fresh_acquire_retries() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(CountingFetcher::failing());
        let store = Arc::new(CacheStore::new(full_config(dir.path()), fetcher.clone()));

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.acquire(&track("x")).await })
        };
        // let the owner task register its in-flight entry first
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = store.acquire(&track("x")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(waiter.await.unwrap().is_err());
        let calls_after_first = fetcher.calls();
        assert_eq!(calls_after_first, 1);

        // failure is not sticky: a new acquire fetches again
        let _ = store.acquire(&track("x")).await;
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_acquire_does_not_strand_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(CountingFetcher::new(vec![9; 64]));
        let store = Arc::new(CacheStore::new(full_config(dir.path()), fetcher.clone()));

        // the first caller gives up mid-fetch
        let owner = {
            let store = store.clone();
            tokio::spawn(async move { store.acquire(&track("t")).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        owner.abort();
        let _ = owner.await;

        // the fetch keeps running; a later acquire rides it to completion
        let handle = store.acquire(&track("t")).await.unwrap();
        assert!(handle.is_local());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_respects_pins() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(CountingFetcher::new(vec![0; 100]));
        let store = CacheStore::new(
            PrefetchConfig {
                max_cache_bytes: 250,
                ..full_config(dir.path())
            },
            fetcher,
        );

        store.acquire(&track("a")).await.unwrap();
        store.pin("a").await;
        store.acquire(&track("b")).await.unwrap();
        // third fetch pushes total to 300; "b" is the oldest unpinned
        store.acquire(&track("c")).await.unwrap();

        assert!(store.is_ready("a").await, "pinned entry survived");
        assert!(!store.is_ready("b").await, "LRU unpinned entry evicted");
        assert!(store.is_ready("c").await);
        assert_eq!(store.cached_bytes().await, 200);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(CountingFetcher::new(vec![0; 32]));
        let store = CacheStore::new(full_config(dir.path()), fetcher.clone());
        let handle = store.acquire(&track("a")).await.unwrap();
        assert!(store.invalidate("a").await.unwrap());
        if let AudioHandle::Local(path) = handle {
            assert!(!path.exists());
        }
        assert!(!store.invalidate("a").await.unwrap());
        // next acquire refetches
        store.acquire(&track("a")).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[test]
    fn test_guess_ext() {
        assert_eq!(guess_ext("https://cdn/x.mp3"), "mp3");
        assert_eq!(guess_ext("https://cdn/x.ogg?token=abc"), "ogg");
        assert_eq!(guess_ext("https://cdn/stream"), "bin");
        assert_eq!(guess_ext("https://cdn/x.verylongext"), "bin");
    }
}
