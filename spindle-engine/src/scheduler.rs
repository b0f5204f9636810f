//! Guild scheduler: one actor per guild
//!
//! The scheduler owns a registry of guild actors, created on first
//! activity and torn down on disconnect. Each actor is the single
//! writer for its guild's queue, autofill controller, and playback
//! session; every external command goes through the actor's mailbox,
//! so all mutations for one guild are linearized while distinct
//! guilds run fully in parallel.
//!
//! The actor's select loop multiplexes four signals: the command
//! mailbox, the running session's completion, the autofill delay
//! timer, and prefetch completion notices for queued entries.

use crate::autofill::AutofillController;
use crate::cache::CacheStore;
use crate::fader::{volume_to_gain, FadeController};
use crate::playback::{CancelKind, PlaybackSession, SessionHandle, SessionOutcome, StateCell};
use crate::queue::TrackQueue;
use crate::traits::{
    PersistedGuildState, PlayContext, SinkProvider, StateStore, TrackResolver, VoiceSink,
};
use spindle_common::error::ResolutionKind;
use spindle_common::{
    EngineConfig, EngineEvent, Error, EventBus, GuildId, PlaybackState, PrefetchStatus,
    QueueEntry, Result, Track, TrackOrigin, UserId,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Cap on automatic skip-and-retry attempts within one advance cycle.
const MAX_AUTO_SKIPS: u32 = 2;
/// Bound on the synchronous autofill attempt made before declaring
/// true idle.
const AUTOFILL_SYNC_TIMEOUT: Duration = Duration::from_secs(10);
/// Mailbox depth per guild actor.
const MAILBOX_CAPACITY: usize = 64;

// ============================================================================
// Commands and replies
// ============================================================================

/// Outcome of a filler-skip command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillerSkip {
    /// Queued autofill entries dropped
    pub purged: usize,
    /// Whether the currently playing track was filler and got skipped
    pub current_skipped: bool,
}

/// Read-only view of one guild's playback state.
#[derive(Debug, Clone)]
pub struct GuildSnapshot {
    pub guild_id: GuildId,
    pub state: PlaybackState,
    pub current: Option<Track>,
    pub volume: u16,
    pub queue: Vec<QueueEntry>,
    pub playlists: Vec<String>,
    pub autofill_enabled: bool,
}

/// Commands accepted by a guild actor. Every variant carries a reply
/// channel; dropping the reply is harmless.
pub enum GuildCommand {
    Enqueue {
        reference: String,
        requested_by: UserId,
        position: Option<usize>,
        reply: oneshot::Sender<Result<usize>>,
    },
    Skip {
        reply: oneshot::Sender<Result<()>>,
    },
    SkipFiller {
        reply: oneshot::Sender<Result<FillerSkip>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    Shuffle {
        displace_first: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetVolume {
        volume: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    Remove {
        position: usize,
        reply: oneshot::Sender<Result<Track>>,
    },
    Clear {
        reply: oneshot::Sender<Result<usize>>,
    },
    Snapshot {
        reply: oneshot::Sender<GuildSnapshot>,
    },
    CreatePlaylist {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    DeletePlaylist {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    AddToPlaylist {
        name: String,
        reference: String,
        requested_by: UserId,
        reply: oneshot::Sender<Result<usize>>,
    },
    LoadPlaylist {
        name: String,
        reply: oneshot::Sender<Result<usize>>,
    },
    SetAutofillEnabled {
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetAutofillSource {
        url: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Like {
        user_id: UserId,
        reply: oneshot::Sender<Result<u64>>,
    },
    Unlike {
        user_id: UserId,
        track_id: String,
        reply: oneshot::Sender<Result<u64>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// Guild actor
// ============================================================================

struct GuildActor {
    guild_id: GuildId,
    config: EngineConfig,
    queue: TrackQueue,
    autofill: AutofillController,
    cache: Arc<CacheStore>,
    sink: Arc<dyn VoiceSink>,
    resolver: Arc<dyn TrackResolver>,
    store: Arc<dyn StateStore>,
    events: EventBus,
    fader: FadeController,
    state: StateCell,
    volume: watch::Sender<u16>,
    session: Option<SessionHandle>,
    consecutive_failures: u32,
    autofill_deadline: Option<Instant>,
    /// Recently started track ids, oldest first, for now-playing pruning.
    recent_started: VecDeque<String>,
    prefetch_tx: mpsc::UnboundedSender<(String, bool)>,
    prefetch_rx: mpsc::UnboundedReceiver<(String, bool)>,
}

impl GuildActor {
    async fn run(mut self, mut mailbox: mpsc::Receiver<GuildCommand>) {
        info!(guild_id = self.guild_id, "guild scheduler started");
        // resume a restored queue, or start the radio countdown
        if !self.queue.is_empty() {
            self.advance(true).await;
        } else {
            self.arm_autofill_timer();
        }
        loop {
            let has_session = self.session.is_some();
            let deadline = self.autofill_deadline;
            tokio::select! {
                cmd = mailbox.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                outcome = await_session(&mut self.session), if has_session => {
                    self.on_session_end(outcome).await;
                }
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    self.autofill_deadline = None;
                    self.on_autofill_timer().await;
                }
                Some((track_id, ok)) = self.prefetch_rx.recv() => {
                    let status = if ok {
                        PrefetchStatus::Ready
                    } else {
                        PrefetchStatus::Failed
                    };
                    self.queue.set_prefetch_status(&track_id, status);
                }
            }
        }
        let guild_id = self.guild_id;
        self.shutdown().await;
        info!(guild_id, "guild scheduler stopped");
    }

    /// Returns true when the actor should exit.
    async fn handle_command(&mut self, cmd: GuildCommand) -> bool {
        match cmd {
            GuildCommand::Enqueue {
                reference,
                requested_by,
                position,
                reply,
            } => {
                let result = self.do_enqueue(reference, requested_by, position).await;
                let _ = reply.send(result);
            }
            GuildCommand::Skip { reply } => {
                let result = match &self.session {
                    Some(session) => {
                        session.cancel(CancelKind::Skip);
                        Ok(())
                    }
                    None => Err(Error::InvalidState("nothing is playing".into())),
                };
                let _ = reply.send(result);
            }
            GuildCommand::SkipFiller { reply } => {
                let result = self.do_skip_filler().await;
                let _ = reply.send(result);
            }
            GuildCommand::Stop { reply } => {
                let _ = reply.send(self.do_stop().await);
            }
            GuildCommand::Shuffle {
                displace_first,
                reply,
            } => {
                {
                    let mut rng = rand::thread_rng();
                    if displace_first {
                        self.queue.shuffle_displacing_first(&mut rng);
                    } else {
                        self.queue.shuffle(&mut rng);
                    }
                }
                self.emit_queue_changed();
                self.persist().await;
                let _ = reply.send(Ok(()));
            }
            GuildCommand::SetVolume { volume, reply } => {
                let _ = reply.send(self.do_set_volume(volume).await);
            }
            GuildCommand::Remove { position, reply } => {
                let result = self.queue.remove_at(position);
                if result.is_ok() {
                    self.emit_queue_changed();
                    self.persist().await;
                }
                let _ = reply.send(result);
            }
            GuildCommand::Clear { reply } => {
                let cleared = self.queue.clear();
                if cleared > 0 {
                    self.emit_queue_changed();
                    self.persist().await;
                }
                if self.session.is_none() {
                    self.arm_autofill_timer();
                }
                let _ = reply.send(Ok(cleared));
            }
            GuildCommand::Snapshot { reply } => {
                let _ = reply.send(GuildSnapshot {
                    guild_id: self.guild_id,
                    state: self.state.get(),
                    current: self.session.as_ref().map(|s| s.track.clone()),
                    volume: *self.volume.borrow(),
                    queue: self.queue.snapshot(),
                    playlists: self.queue.playlist_names(),
                    autofill_enabled: self.autofill.is_enabled(),
                });
            }
            GuildCommand::CreatePlaylist { name, reply } => {
                let result = self.queue.create_playlist(&name);
                if result.is_ok() {
                    self.persist().await;
                }
                let _ = reply.send(result);
            }
            GuildCommand::DeletePlaylist { name, reply } => {
                let result = self.queue.delete_playlist(&name);
                if result.is_ok() {
                    self.persist().await;
                }
                let _ = reply.send(result);
            }
            GuildCommand::AddToPlaylist {
                name,
                reference,
                requested_by,
                reply,
            } => {
                let result = self.do_add_to_playlist(name, reference, requested_by).await;
                let _ = reply.send(result);
            }
            GuildCommand::LoadPlaylist { name, reply } => {
                let result = self.queue.load_playlist(&name);
                if let Ok(added) = result {
                    debug!(guild_id = self.guild_id, added, playlist = %name, "playlist loaded");
                    self.autofill_deadline = None;
                    self.emit_queue_changed();
                    self.persist().await;
                    self.advance(true).await;
                    self.spawn_prefetch_for_next();
                }
                let _ = reply.send(result);
            }
            GuildCommand::SetAutofillEnabled { enabled, reply } => {
                self.autofill.set_enabled(enabled);
                if !enabled {
                    self.autofill_deadline = None;
                } else if self.session.is_none() && self.queue.is_empty() {
                    self.arm_autofill_timer();
                }
                self.persist().await;
                let _ = reply.send(Ok(()));
            }
            GuildCommand::SetAutofillSource { url, reply } => {
                self.autofill.set_source_url(url);
                self.persist().await;
                let _ = reply.send(Ok(()));
            }
            GuildCommand::Like { user_id, reply } => {
                let _ = reply.send(self.do_like(user_id).await);
            }
            GuildCommand::Unlike {
                user_id,
                track_id,
                reply,
            } => {
                let result = self.store.record_unlike(self.guild_id, user_id, &track_id).await;
                if result.is_ok() {
                    self.events.emit_lossy(EngineEvent::LikeRecorded {
                        guild_id: self.guild_id,
                        user_id,
                        track_id,
                        liked: false,
                        timestamp: chrono::Utc::now(),
                    });
                }
                let _ = reply.send(result);
            }
            GuildCommand::Disconnect { reply } => {
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    // ========================================================================
    // Command bodies
    // ========================================================================

    async fn do_enqueue(
        &mut self,
        reference: String,
        requested_by: UserId,
        position: Option<usize>,
    ) -> Result<usize> {
        let resolved = self.resolver.resolve(&reference).await?;
        if resolved.is_empty() {
            return Err(Error::resolution(ResolutionKind::NotFound, reference));
        }
        let mut tracks: Vec<Track> = resolved
            .into_iter()
            .map(|t| Track {
                requested_by: Some(requested_by),
                origin: TrackOrigin::Manual,
                ..t
            })
            .collect();
        let added = if tracks.len() == 1 {
            self.queue.enqueue_at(tracks.remove(0), position)?;
            1
        } else {
            self.queue.enqueue_batch(tracks)?
        };
        // a non-empty queue makes the pending autofill moot
        self.autofill_deadline = None;
        self.emit_queue_changed();
        self.persist().await;
        self.advance(true).await;
        // entries queued behind a running session start fetching now
        self.spawn_prefetch_for_next();
        Ok(added)
    }

    async fn do_skip_filler(&mut self) -> Result<FillerSkip> {
        let purged = self.queue.purge_filler();
        if purged > 0 {
            self.emit_queue_changed();
            self.persist().await;
        }
        let current_skipped = match &self.session {
            Some(session) if session.track.origin.is_autofill() => {
                session.cancel(CancelKind::Skip);
                true
            }
            _ => false,
        };
        Ok(FillerSkip {
            purged,
            current_skipped,
        })
    }

    async fn do_stop(&mut self) -> Result<()> {
        let cleared = self.queue.clear();
        if cleared > 0 {
            self.emit_queue_changed();
        }
        self.persist().await;
        match &self.session {
            Some(session) => session.cancel(CancelKind::Stop),
            None => self.arm_autofill_timer(),
        }
        Ok(())
    }

    async fn do_set_volume(&mut self, volume: u16) -> Result<()> {
        if volume > 200 {
            return Err(Error::Config(format!(
                "volume must be 0-200, got {}",
                volume
            )));
        }
        // send_replace: the channel may have no receiver while idle
        self.volume.send_replace(volume);
        // live sessions pick the new value up at the next fade step;
        // steady-state playback gets it applied directly
        if self.state.get() == PlaybackState::Playing {
            self.sink.set_gain(volume_to_gain(volume)).await;
        }
        self.events.emit_lossy(EngineEvent::VolumeChanged {
            guild_id: self.guild_id,
            volume,
            timestamp: chrono::Utc::now(),
        });
        self.persist().await;
        Ok(())
    }

    async fn do_add_to_playlist(
        &mut self,
        name: String,
        reference: String,
        requested_by: UserId,
    ) -> Result<usize> {
        let resolved = self.resolver.resolve(&reference).await?;
        if resolved.is_empty() {
            return Err(Error::resolution(ResolutionKind::NotFound, reference));
        }
        let mut len = 0;
        for track in resolved {
            len = self.queue.add_to_playlist(
                &name,
                Track {
                    requested_by: Some(requested_by),
                    origin: TrackOrigin::Manual,
                    ..track
                },
            )?;
        }
        self.persist().await;
        Ok(len)
    }

    async fn do_like(&mut self, user_id: UserId) -> Result<u64> {
        let track = self
            .session
            .as_ref()
            .map(|s| s.track.clone())
            .ok_or_else(|| Error::InvalidState("nothing is playing".into()))?;
        let count = self.store.record_like(self.guild_id, user_id, &track).await?;
        self.events.emit_lossy(EngineEvent::LikeRecorded {
            guild_id: self.guild_id,
            user_id,
            track_id: track.id,
            liked: true,
            timestamp: chrono::Utc::now(),
        });
        Ok(count)
    }

    // ========================================================================
    // Advance cycle
    // ========================================================================

    /// Start the next session if nothing is playing. `external` marks
    /// advances triggered by commands/timers rather than the retry
    /// loop, and resets the auto-skip budget.
    async fn advance(&mut self, external: bool) {
        if external {
            self.consecutive_failures = 0;
        }
        if self.session.is_some() {
            return;
        }
        if self.queue.is_empty() && !self.try_autofill_now().await {
            self.arm_autofill_timer();
            return;
        }
        let Some(entry) = self.queue.dequeue_next() else {
            self.arm_autofill_timer();
            return;
        };
        self.emit_queue_changed();
        self.note_started(&entry.track);
        self.session = Some(PlaybackSession::spawn(
            self.guild_id,
            entry.track,
            self.cache.clone(),
            self.sink.clone(),
            self.fader.clone(),
            self.state.clone(),
            self.events.clone(),
            self.volume.subscribe(),
        ));
        self.spawn_prefetch_for_next();
    }

    async fn on_session_end(&mut self, outcome: SessionOutcome) {
        let Some(session) = self.session.take() else {
            return;
        };
        let track = session.track;
        let started_at = session.started_at;
        debug!(guild_id = self.guild_id, track_id = %track.id, ?outcome, "session ended");
        match outcome {
            SessionOutcome::Completed => {
                self.finish_track(&track, started_at, true).await;
                self.state.set(PlaybackState::Idle);
                self.consecutive_failures = 0;
                self.advance(false).await;
            }
            SessionOutcome::Skipped => {
                self.finish_track(&track, started_at, false).await;
                self.state.set(PlaybackState::Idle);
                self.advance(true).await;
            }
            SessionOutcome::Stopped => {
                self.finish_track(&track, started_at, false).await;
                self.state.set(PlaybackState::Stopped);
                self.state.set(PlaybackState::Idle);
                self.arm_autofill_timer();
            }
            SessionOutcome::FetchFailed(reason) | SessionOutcome::SinkError(reason) => {
                self.events.emit_lossy(EngineEvent::TrackFailed {
                    guild_id: self.guild_id,
                    track_id: track.id.clone(),
                    reason,
                    timestamp: chrono::Utc::now(),
                });
                self.state.set(PlaybackState::Idle);
                self.consecutive_failures += 1;
                if self.consecutive_failures >= MAX_AUTO_SKIPS {
                    warn!(
                        guild_id = self.guild_id,
                        failures = self.consecutive_failures,
                        "advance cycle stuck, waiting for external input"
                    );
                    self.events.emit_lossy(EngineEvent::PlaybackStuck {
                        guild_id: self.guild_id,
                        consecutive_failures: self.consecutive_failures,
                        timestamp: chrono::Utc::now(),
                    });
                } else {
                    self.advance(false).await;
                }
            }
        }
    }

    async fn finish_track(
        &mut self,
        track: &Track,
        started_at: chrono::DateTime<chrono::Utc>,
        completed: bool,
    ) {
        self.events.emit_lossy(EngineEvent::TrackFinished {
            guild_id: self.guild_id,
            track_id: track.id.clone(),
            completed,
            timestamp: chrono::Utc::now(),
        });
        let context = match track.origin {
            TrackOrigin::Manual => PlayContext::Manual,
            TrackOrigin::Playlist => PlayContext::Playlist,
            _ => PlayContext::Autofill,
        };
        let ended_at = completed.then(chrono::Utc::now);
        if let Err(e) = self
            .store
            .record_play(self.guild_id, track, context, started_at, ended_at)
            .await
        {
            warn!(guild_id = self.guild_id, track_id = %track.id, error = %e, "failed to record play");
        }
    }

    /// Track now-playing staleness: once enough newer tracks start,
    /// the indicator for an old one should be dropped.
    fn note_started(&mut self, track: &Track) {
        self.recent_started.push_back(track.id.clone());
        let keep = self.config.nowplaying_prune_after as usize + 1;
        while self.recent_started.len() > keep {
            if let Some(stale) = self.recent_started.pop_front() {
                self.events.emit_lossy(EngineEvent::NowPlayingStale {
                    guild_id: self.guild_id,
                    track_id: stale,
                    timestamp: chrono::Utc::now(),
                });
            }
        }
    }

    /// Kick off a background fetch for the next queued entry so it is
    /// ready by the time the current track ends.
    fn spawn_prefetch_for_next(&mut self) {
        let Some(next) = self.queue.peek_next() else {
            return;
        };
        if next.prefetch != PrefetchStatus::NotStarted {
            return;
        }
        let track = next.track.clone();
        self.queue
            .set_prefetch_status(&track.id, PrefetchStatus::InProgress);
        let cache = self.cache.clone();
        let notify = self.prefetch_tx.clone();
        tokio::spawn(async move {
            let ok = cache.acquire(&track).await.is_ok();
            let _ = notify.send((track.id, ok));
        });
    }

    // ========================================================================
    // Autofill plumbing
    // ========================================================================

    /// One bounded synchronous autofill attempt; true when tracks were
    /// added to the queue.
    async fn try_autofill_now(&mut self) -> bool {
        if !self.autofill.is_enabled() {
            return false;
        }
        let exclude = self.exclude_set();
        let pulled =
            tokio::time::timeout(AUTOFILL_SYNC_TIMEOUT, self.autofill.pull(self.guild_id, &exclude))
                .await;
        match pulled {
            Ok(Ok(pull)) => {
                let added = pull.tracks.len();
                for track in pull.tracks {
                    // filler is exempt from quotas, but a full queue
                    // row count error would still be a bug worth seeing
                    if let Err(e) = self.queue.enqueue(track) {
                        error!(guild_id = self.guild_id, error = %e, "autofill enqueue rejected");
                    }
                }
                info!(guild_id = self.guild_id, added, source = ?pull.source, "autofill refilled queue");
                self.events.emit_lossy(EngineEvent::AutofillTriggered {
                    guild_id: self.guild_id,
                    source: pull.source,
                    added,
                    timestamp: chrono::Utc::now(),
                });
                self.emit_queue_changed();
                self.persist().await;
                true
            }
            Ok(Err(Error::AutofillExhausted)) => {
                self.events.emit_lossy(EngineEvent::AutofillExhausted {
                    guild_id: self.guild_id,
                    timestamp: chrono::Utc::now(),
                });
                false
            }
            Ok(Err(e)) => {
                warn!(guild_id = self.guild_id, error = %e, "autofill pull failed");
                false
            }
            Err(_) => {
                warn!(guild_id = self.guild_id, "autofill pull timed out");
                false
            }
        }
    }

    async fn on_autofill_timer(&mut self) {
        if self.session.is_some() || !self.queue.is_empty() {
            // condition became moot before the timer fired
            return;
        }
        self.advance(true).await;
    }

    fn arm_autofill_timer(&mut self) {
        if !self.autofill.is_enabled() || self.autofill_deadline.is_some() {
            return;
        }
        self.autofill_deadline = Some(Instant::now() + self.autofill.delay());
        debug!(
            guild_id = self.guild_id,
            delay_secs = self.autofill.delay().as_secs(),
            "autofill timer armed"
        );
    }

    /// Track ids that an autofill pass must not duplicate.
    fn exclude_set(&self) -> HashSet<String> {
        let mut set: HashSet<String> =
            self.queue.entries().map(|e| e.track.id.clone()).collect();
        if let Some(session) = &self.session {
            set.insert(session.track.id.clone());
        }
        set
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    fn emit_queue_changed(&self) {
        self.events.emit_lossy(EngineEvent::QueueChanged {
            guild_id: self.guild_id,
            queue_len: self.queue.len(),
            timestamp: chrono::Utc::now(),
        });
    }

    async fn persist(&self) {
        let snapshot = PersistedGuildState {
            queue: self.queue.snapshot(),
            playlists: self.queue.playlists().clone(),
            volume: *self.volume.borrow(),
            autofill_enabled: self.autofill.is_enabled(),
            autofill_source_url: self.autofill.source_url_override().map(str::to_string),
        };
        if let Err(e) = self.store.save_guild_state(self.guild_id, &snapshot).await {
            warn!(guild_id = self.guild_id, error = %e, "failed to persist guild state");
        }
    }

    async fn shutdown(mut self) {
        if let Some(session) = self.session.take() {
            session.cancel(CancelKind::Stop);
            let _ = session.join.await;
        }
        self.state.set(PlaybackState::Stopped);
        self.persist().await;
    }
}

/// Await the running session's outcome. Callers guard on
/// `session.is_some()`.
async fn await_session(session: &mut Option<SessionHandle>) -> SessionOutcome {
    match session {
        Some(active) => match (&mut active.join).await {
            Ok(outcome) => outcome,
            Err(e) => SessionOutcome::SinkError(format!("session task failed: {}", e)),
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Everything a guild actor needs, injected once at scheduler build.
#[derive(Clone)]
pub struct EngineDeps {
    pub config: EngineConfig,
    pub resolver: Arc<dyn TrackResolver>,
    pub store: Arc<dyn StateStore>,
    pub sinks: Arc<dyn SinkProvider>,
    pub cache: Arc<CacheStore>,
    pub events: EventBus,
}

struct GuildHandle {
    tx: mpsc::Sender<GuildCommand>,
    join: JoinHandle<()>,
}

/// Registry of per-guild actors. The only component that knows which
/// guild a command belongs to.
pub struct GuildScheduler {
    deps: EngineDeps,
    guilds: tokio::sync::Mutex<HashMap<GuildId, GuildHandle>>,
}

impl GuildScheduler {
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            deps,
            guilds: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.deps.events
    }

    /// Guilds with a live actor.
    pub async fn active_guilds(&self) -> Vec<GuildId> {
        self.guilds.lock().await.keys().copied().collect()
    }

    /// Mailbox for a guild, spinning its actor up on first use and
    /// restoring any persisted queue/playlists/settings.
    async fn ensure_guild(&self, guild_id: GuildId) -> Result<mpsc::Sender<GuildCommand>> {
        let mut guilds = self.guilds.lock().await;
        if let Some(handle) = guilds.get(&guild_id) {
            if !handle.join.is_finished() {
                return Ok(handle.tx.clone());
            }
            guilds.remove(&guild_id);
        }

        let persisted = match self.deps.store.load_guild_state(guild_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(guild_id, error = %e, "failed to load guild state, starting fresh");
                None
            }
        };

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let actor = self.build_actor(guild_id, persisted);
        let join = tokio::spawn(actor.run(rx));
        guilds.insert(
            guild_id,
            GuildHandle {
                tx: tx.clone(),
                join,
            },
        );
        Ok(tx)
    }

    fn build_actor(&self, guild_id: GuildId, persisted: Option<PersistedGuildState>) -> GuildActor {
        let config = self.deps.config.clone();
        let mut autofill = AutofillController::new(
            config.autofill.clone(),
            self.deps.resolver.clone(),
            self.deps.store.clone(),
        );
        let (volume, persisted) = match persisted {
            Some(state) => {
                autofill.set_enabled(state.autofill_enabled);
                autofill.set_source_url(state.autofill_source_url.clone());
                (state.volume.min(200), state)
            }
            None => (config.default_volume, PersistedGuildState::default()),
        };
        let (volume_tx, _) = watch::channel(volume);
        let (prefetch_tx, prefetch_rx) = mpsc::unbounded_channel();
        GuildActor {
            guild_id,
            queue: TrackQueue::restore(
                config.queue.clone(),
                persisted.queue,
                persisted.playlists,
            ),
            autofill,
            cache: self.deps.cache.clone(),
            sink: self.deps.sinks.sink_for(guild_id),
            resolver: self.deps.resolver.clone(),
            store: self.deps.store.clone(),
            events: self.deps.events.clone(),
            fader: FadeController::new(config.fade.clone()),
            state: StateCell::new(guild_id, self.deps.events.clone()),
            volume: volume_tx,
            session: None,
            consecutive_failures: 0,
            autofill_deadline: None,
            recent_started: VecDeque::new(),
            prefetch_tx,
            prefetch_rx,
            config,
        }
    }

    async fn request<T>(
        &self,
        guild_id: GuildId,
        make: impl FnOnce(oneshot::Sender<T>) -> GuildCommand,
    ) -> Result<T> {
        let tx = self.ensure_guild(guild_id).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(make(reply_tx))
            .await
            .map_err(|_| Error::GuildNotActive(guild_id))?;
        reply_rx.await.map_err(|_| Error::GuildNotActive(guild_id))
    }

    // ========================================================================
    // Public command surface
    // ========================================================================

    /// Resolve a reference and enqueue the result for a user.
    pub async fn enqueue(
        &self,
        guild_id: GuildId,
        reference: impl Into<String>,
        requested_by: UserId,
    ) -> Result<usize> {
        let reference = reference.into();
        self.request(guild_id, |reply| GuildCommand::Enqueue {
            reference,
            requested_by,
            position: None,
            reply,
        })
        .await?
    }

    pub async fn enqueue_at(
        &self,
        guild_id: GuildId,
        reference: impl Into<String>,
        requested_by: UserId,
        position: usize,
    ) -> Result<usize> {
        let reference = reference.into();
        self.request(guild_id, |reply| GuildCommand::Enqueue {
            reference,
            requested_by,
            position: Some(position),
            reply,
        })
        .await?
    }

    pub async fn skip(&self, guild_id: GuildId) -> Result<()> {
        self.request(guild_id, |reply| GuildCommand::Skip { reply })
            .await?
    }

    /// Drop queued filler and skip the current track if it is filler.
    pub async fn skip_filler(&self, guild_id: GuildId) -> Result<FillerSkip> {
        self.request(guild_id, |reply| GuildCommand::SkipFiller { reply })
            .await?
    }

    pub async fn stop(&self, guild_id: GuildId) -> Result<()> {
        self.request(guild_id, |reply| GuildCommand::Stop { reply })
            .await?
    }

    pub async fn shuffle(&self, guild_id: GuildId, displace_first: bool) -> Result<()> {
        self.request(guild_id, |reply| GuildCommand::Shuffle {
            displace_first,
            reply,
        })
        .await?
    }

    pub async fn set_volume(&self, guild_id: GuildId, volume: u16) -> Result<()> {
        self.request(guild_id, |reply| GuildCommand::SetVolume { volume, reply })
            .await?
    }

    pub async fn remove(&self, guild_id: GuildId, position: usize) -> Result<Track> {
        self.request(guild_id, |reply| GuildCommand::Remove { position, reply })
            .await?
    }

    pub async fn clear(&self, guild_id: GuildId) -> Result<usize> {
        self.request(guild_id, |reply| GuildCommand::Clear { reply })
            .await?
    }

    pub async fn snapshot(&self, guild_id: GuildId) -> Result<GuildSnapshot> {
        self.request(guild_id, |reply| GuildCommand::Snapshot { reply })
            .await
    }

    pub async fn create_playlist(&self, guild_id: GuildId, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.request(guild_id, |reply| GuildCommand::CreatePlaylist { name, reply })
            .await?
    }

    pub async fn delete_playlist(&self, guild_id: GuildId, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.request(guild_id, |reply| GuildCommand::DeletePlaylist { name, reply })
            .await?
    }

    /// Resolve a reference and append it to a named playlist. Returns
    /// the playlist's new length.
    pub async fn add_to_playlist(
        &self,
        guild_id: GuildId,
        name: impl Into<String>,
        reference: impl Into<String>,
        requested_by: UserId,
    ) -> Result<usize> {
        let name = name.into();
        let reference = reference.into();
        self.request(guild_id, |reply| GuildCommand::AddToPlaylist {
            name,
            reference,
            requested_by,
            reply,
        })
        .await?
    }

    pub async fn load_playlist(&self, guild_id: GuildId, name: impl Into<String>) -> Result<usize> {
        let name = name.into();
        self.request(guild_id, |reply| GuildCommand::LoadPlaylist { name, reply })
            .await?
    }

    pub async fn set_autofill_enabled(&self, guild_id: GuildId, enabled: bool) -> Result<()> {
        self.request(guild_id, |reply| GuildCommand::SetAutofillEnabled {
            enabled,
            reply,
        })
        .await?
    }

    pub async fn set_autofill_source(
        &self,
        guild_id: GuildId,
        url: Option<String>,
    ) -> Result<()> {
        self.request(guild_id, |reply| GuildCommand::SetAutofillSource { url, reply })
            .await?
    }

    /// Like the currently playing track. Returns the user's like count.
    pub async fn like(&self, guild_id: GuildId, user_id: UserId) -> Result<u64> {
        self.request(guild_id, |reply| GuildCommand::Like { user_id, reply })
            .await?
    }

    pub async fn unlike(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        track_id: impl Into<String>,
    ) -> Result<u64> {
        let track_id = track_id.into();
        self.request(guild_id, |reply| GuildCommand::Unlike {
            user_id,
            track_id,
            reply,
        })
        .await?
    }

    /// Play-count leaderboard straight from the store; no actor needed.
    pub async fn top(
        &self,
        guild_id: GuildId,
        range: crate::traits::TimeRange,
        limit: u32,
    ) -> Result<Vec<crate::traits::TopTrack>> {
        self.deps.store.query_top(guild_id, range, limit).await
    }

    pub async fn history(
        &self,
        guild_id: GuildId,
        limit: u32,
    ) -> Result<Vec<crate::traits::PlayRecord>> {
        self.deps.store.query_history(guild_id, limit).await
    }

    /// Stop the guild's actor, persisting its state. No-op for guilds
    /// without one.
    pub async fn disconnect(&self, guild_id: GuildId) -> Result<()> {
        let handle = self.guilds.lock().await.remove(&guild_id);
        let Some(handle) = handle else {
            return Ok(());
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if handle.tx.send(GuildCommand::Disconnect { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
        handle
            .join
            .await
            .map_err(|e| Error::Internal(format!("guild actor panicked: {}", e)))
    }

    /// Disconnect every active guild, for process shutdown.
    pub async fn shutdown(&self) {
        for guild_id in self.active_guilds().await {
            if let Err(e) = self.disconnect(guild_id).await {
                warn!(guild_id, error = %e, "guild shutdown failed");
            }
        }
    }
}
