//! Event types for the spindle engine
//!
//! Components communicate outward through a broadcast `EventBus`:
//! - Non-blocking publish (slow subscribers never block the engine)
//! - Multiple concurrent subscribers
//! - Automatic cleanup when subscribers drop
//!
//! Mutations flow the other way, through each guild's command mailbox;
//! events are strictly notifications.

use crate::track::{GuildId, Track, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Playback state of one guild's session machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// Nothing playing; queue may be non-empty but not yet pulled
    Idle,
    /// Fetching/validating audio for the next entry
    Resolving,
    /// Gain ramping 0 -> target
    FadingIn,
    Playing,
    /// Gain ramping target -> 0
    FadingOut,
    /// Terminal for the session; the scheduler may start a fresh one
    Stopped,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Resolving => "resolving",
            PlaybackState::FadingIn => "fading_in",
            PlaybackState::Playing => "playing",
            PlaybackState::FadingOut => "fading_out",
            PlaybackState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Which autofill source produced a batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutofillSource {
    SourceUrl,
    CsvSeed,
    UserLikes,
}

/// Engine event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Playback state machine moved between states
    PlaybackStateChanged {
        guild_id: GuildId,
        old_state: PlaybackState,
        new_state: PlaybackState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A track began playing (fade-in started)
    TrackStarted {
        guild_id: GuildId,
        track: Track,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A track finished; `completed` is false for skips
    TrackFinished {
        guild_id: GuildId,
        track_id: String,
        completed: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Queue contents changed (enqueue, remove, shuffle, clear, autofill)
    QueueChanged {
        guild_id: GuildId,
        queue_len: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Volume changed (0-200 scale)
    VolumeChanged {
        guild_id: GuildId,
        volume: u16,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Autofill pulled candidates into the queue
    AutofillTriggered {
        guild_id: GuildId,
        source: AutofillSource,
        added: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Every configured autofill source came up empty
    AutofillExhausted {
        guild_id: GuildId,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A track was reported as failing (resolution or fetch) and skipped
    TrackFailed {
        guild_id: GuildId,
        track_id: String,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The advance loop hit its consecutive-failure cap and gave up
    PlaybackStuck {
        guild_id: GuildId,
        consecutive_failures: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Enough subsequent tracks have played that the now-playing card
    /// for this track should be pruned from the control channel
    NowPlayingStale {
        guild_id: GuildId,
        track_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A user liked or unliked a track
    LikeRecorded {
        guild_id: GuildId,
        user_id: UserId,
        track_id: String,
        liked: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl EngineEvent {
    /// Event type as string, for filtering and logging
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::PlaybackStateChanged { .. } => "PlaybackStateChanged",
            EngineEvent::TrackStarted { .. } => "TrackStarted",
            EngineEvent::TrackFinished { .. } => "TrackFinished",
            EngineEvent::QueueChanged { .. } => "QueueChanged",
            EngineEvent::VolumeChanged { .. } => "VolumeChanged",
            EngineEvent::AutofillTriggered { .. } => "AutofillTriggered",
            EngineEvent::AutofillExhausted { .. } => "AutofillExhausted",
            EngineEvent::TrackFailed { .. } => "TrackFailed",
            EngineEvent::PlaybackStuck { .. } => "PlaybackStuck",
            EngineEvent::NowPlayingStale { .. } => "NowPlayingStale",
            EngineEvent::LikeRecorded { .. } => "LikeRecorded",
        }
    }

    /// Guild the event belongs to
    pub fn guild_id(&self) -> GuildId {
        match self {
            EngineEvent::PlaybackStateChanged { guild_id, .. }
            | EngineEvent::TrackStarted { guild_id, .. }
            | EngineEvent::TrackFinished { guild_id, .. }
            | EngineEvent::QueueChanged { guild_id, .. }
            | EngineEvent::VolumeChanged { guild_id, .. }
            | EngineEvent::AutofillTriggered { guild_id, .. }
            | EngineEvent::AutofillExhausted { guild_id, .. }
            | EngineEvent::TrackFailed { guild_id, .. }
            | EngineEvent::PlaybackStuck { guild_id, .. }
            | EngineEvent::NowPlayingStale { guild_id, .. }
            | EngineEvent::LikeRecorded { guild_id, .. } => *guild_id,
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus
///
/// Wraps `tokio::sync::broadcast`. Emission is lossy by design: an
/// engine with no listeners keeps playing.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; returns the subscriber count on success.
    pub fn emit(&self, event: EngineEvent) -> Result<usize, broadcast::error::SendError<EngineEvent>> {
        self.tx.send(event)
    }

    /// Emit, ignoring the no-subscribers case.
    pub fn emit_lossy(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
