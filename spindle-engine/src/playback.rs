//! Single-track playback sessions
//!
//! A `PlaybackSession` drives exactly one track through the state
//! machine: Resolving -> FadingIn -> Playing -> FadingOut, ending in
//! a `SessionOutcome` the guild actor turns into the next advance.
//! The session runs as its own task so a slow fetch or a long track
//! never blocks the guild's command mailbox; the actor reaches in
//! only through the cancel channel and the shared state cell.
//!
//! Cancellation semantics:
//! - `Skip` during Resolving abandons the fetch wait (the coalesced
//!   cache fetch itself keeps running for other waiters)
//! - `Skip` during FadingIn/Playing runs the shortened fade-out
//! - `Stop` snaps the gain to zero and tears the sink down with no
//!   intermediate steps

use crate::cache::CacheStore;
use crate::fader::FadeController;
use crate::traits::{PlayOutcome, VoiceSink};
use spindle_common::{EngineEvent, EventBus, GuildId, PlaybackState, Track};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// External cancellation of a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    /// Graceful: shortened fade-out, then advance
    Skip,
    /// Abrupt: immediate silence, no advance
    Stop,
}

/// How a session ended, as seen by the guild actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Track played to its natural end
    Completed,
    /// Skipped by command
    Skipped,
    /// Stopped by command or disconnect
    Stopped,
    /// Audio could not be resolved or fetched
    FetchFailed(String),
    /// The sink failed mid-track
    SinkError(String),
}

/// Shared playback state cell: the session writes transitions, the
/// actor and external observers read the current value.
#[derive(Clone)]
pub struct StateCell {
    guild_id: GuildId,
    state: watch::Sender<PlaybackState>,
    events: EventBus,
}

impl StateCell {
    pub fn new(guild_id: GuildId, events: EventBus) -> Self {
        let (state, _) = watch::channel(PlaybackState::Idle);
        Self {
            guild_id,
            state,
            events,
        }
    }

    pub fn get(&self) -> PlaybackState {
        *self.state.borrow()
    }

    /// Transition to `new_state`, emitting the change. Idempotent for
    /// repeated sets of the same state.
    pub fn set(&self, new_state: PlaybackState) {
        let old_state = *self.state.borrow();
        if old_state == new_state {
            return;
        }
        self.state.send_replace(new_state);
        debug!(guild_id = self.guild_id, %old_state, %new_state, "playback state changed");
        self.events.emit_lossy(EngineEvent::PlaybackStateChanged {
            guild_id: self.guild_id,
            old_state,
            new_state,
            timestamp: chrono::Utc::now(),
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state.subscribe()
    }
}

/// Handle the guild actor keeps while a session task runs.
pub struct SessionHandle {
    pub track: Track,
    pub started_at: chrono::DateTime<chrono::Utc>,
    cancel: watch::Sender<Option<CancelKind>>,
    pub join: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    /// Signal the session; the first signal wins, later ones are
    /// ignored unless they escalate a Skip into a Stop.
    pub fn cancel(&self, kind: CancelKind) {
        let current = *self.cancel.borrow();
        match (current, kind) {
            (None, _) | (Some(CancelKind::Skip), CancelKind::Stop) => {
                self.cancel.send_replace(Some(kind));
            }
            _ => {}
        }
    }
}

/// One track's journey through the state machine.
pub struct PlaybackSession {
    guild_id: GuildId,
    track: Track,
    cache: Arc<CacheStore>,
    sink: Arc<dyn VoiceSink>,
    fader: FadeController,
    state: StateCell,
    events: EventBus,
    volume: watch::Receiver<u16>,
    cancel: watch::Receiver<Option<CancelKind>>,
}

impl PlaybackSession {
    /// Spawn a session task for `track` and return its handle.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        guild_id: GuildId,
        track: Track,
        cache: Arc<CacheStore>,
        sink: Arc<dyn VoiceSink>,
        fader: FadeController,
        state: StateCell,
        events: EventBus,
        volume: watch::Receiver<u16>,
    ) -> SessionHandle {
        let (cancel_tx, cancel_rx) = watch::channel(None);
        let session = PlaybackSession {
            guild_id,
            track: track.clone(),
            cache,
            sink,
            fader,
            state,
            events,
            volume,
            cancel: cancel_rx,
        };
        let join = tokio::spawn(session.run());
        SessionHandle {
            track,
            started_at: chrono::Utc::now(),
            cancel: cancel_tx,
            join,
        }
    }

    async fn run(self) -> SessionOutcome {
        // ---- Resolving ----
        self.state.set(PlaybackState::Resolving);
        let mut cancel = self.cancel.clone();
        let handle = tokio::select! {
            result = self.cache.acquire(&self.track) => match result {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(guild_id = self.guild_id, track_id = %self.track.id, error = %e, "audio fetch failed");
                    return SessionOutcome::FetchFailed(e.to_string());
                }
            },
            kind = cancelled(&mut cancel) => {
                // fetch wait abandoned; the coalesced fetch finishes
                // for any other waiter
                return match kind {
                    CancelKind::Skip => SessionOutcome::Skipped,
                    CancelKind::Stop => SessionOutcome::Stopped,
                };
            }
        };

        // The playing track's cache entry must survive eviction.
        self.cache.pin(&self.track.id).await;
        let outcome = self.play_faded(handle).await;
        self.cache.unpin(&self.track.id).await;
        outcome
    }

    async fn play_faded(&self, handle: crate::traits::AudioHandle) -> SessionOutcome {
        let sink = self.sink.clone();
        let mut play = tokio::spawn(async move { sink.play(handle, 0.0).await });
        let mut play_done: Option<PlayOutcome> = None;

        // ---- FadingIn ----
        self.state.set(PlaybackState::FadingIn);
        self.events.emit_lossy(EngineEvent::TrackStarted {
            guild_id: self.guild_id,
            track: self.track.clone(),
            timestamp: chrono::Utc::now(),
        });
        {
            let fade = self.fader.run_fade_in(self.sink.as_ref(), &self.volume);
            tokio::pin!(fade);
            let mut cancel = self.cancel.clone();
            tokio::select! {
                _ = &mut fade => {}
                result = &mut play => {
                    // track shorter than the fade window
                    play_done = Some(join_outcome(result));
                }
                kind = cancelled(&mut cancel) => {
                    return self.teardown(kind, &mut play).await;
                }
            }
        }

        // ---- Playing ----
        let done = match play_done {
            Some(done) => done,
            None => {
                self.state.set(PlaybackState::Playing);
                let mut cancel = self.cancel.clone();
                tokio::select! {
                    result = &mut play => join_outcome(result),
                    kind = cancelled(&mut cancel) => {
                        return self.teardown(kind, &mut play).await;
                    }
                }
            }
        };

        match done {
            PlayOutcome::NaturalEnd => {
                // ---- FadingOut ----
                self.state.set(PlaybackState::FadingOut);
                self.fader
                    .run_fade_out(self.sink.as_ref(), &self.volume, false)
                    .await;
                self.sink.stop().await;
                SessionOutcome::Completed
            }
            // the sink was stopped out from under us (e.g. transport
            // teardown); treat as a stop
            PlayOutcome::Stopped => SessionOutcome::Stopped,
            PlayOutcome::Error(reason) => {
                self.sink.stop().await;
                SessionOutcome::SinkError(reason)
            }
        }
    }

    /// Cancel path out of the fade-in or playing phase. Only reachable
    /// while the play task is still running.
    async fn teardown(&self, kind: CancelKind, play: &mut JoinHandle<PlayOutcome>) -> SessionOutcome {
        match kind {
            CancelKind::Stop => {
                // stop is deliberately abrupt: straight to zero
                self.sink.set_gain(0.0).await;
                self.sink.stop().await;
                let _ = play.await;
                SessionOutcome::Stopped
            }
            CancelKind::Skip => {
                self.state.set(PlaybackState::FadingOut);
                let mut finished = false;
                {
                    let fade = self.fader.run_fade_out(self.sink.as_ref(), &self.volume, true);
                    tokio::pin!(fade);
                    tokio::select! {
                        _ = &mut fade => {}
                        _ = &mut *play => { finished = true; }
                    }
                }
                self.sink.stop().await;
                if !finished {
                    let _ = play.await;
                }
                SessionOutcome::Skipped
            }
        }
    }
}

/// Resolve once a cancel signal arrives. A dropped sender (actor gone)
/// counts as a stop.
async fn cancelled(rx: &mut watch::Receiver<Option<CancelKind>>) -> CancelKind {
    loop {
        if let Some(kind) = *rx.borrow_and_update() {
            return kind;
        }
        if rx.changed().await.is_err() {
            return CancelKind::Stop;
        }
    }
}

fn join_outcome(result: std::result::Result<PlayOutcome, tokio::task::JoinError>) -> PlayOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(e) => PlayOutcome::Error(format!("play task failed: {}", e)),
    }
}
