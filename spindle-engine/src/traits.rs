//! Collaborator seams
//!
//! The engine never talks to a concrete voice gateway, content
//! resolver, or database directly. Each collaborator is a trait
//! object injected at construction, which is what lets the whole
//! scheduler run in tests against simulated sinks and in-memory
//! stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spindle_common::{GuildId, QueueEntry, Result, Track, UserId};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ============================================================================
// Audio handles
// ============================================================================

/// Where playable audio for a track lives once resolution finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioHandle {
    /// Fully cached on local disk
    Local(PathBuf),
    /// Streamed directly from the source URL
    Remote(String),
}

impl AudioHandle {
    pub fn is_local(&self) -> bool {
        matches!(self, AudioHandle::Local(_))
    }
}

/// How a `VoiceSink::play` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayOutcome {
    /// The audio stream ran to its natural end
    NaturalEnd,
    /// `stop()` was called while the track was playing
    Stopped,
    /// The sink failed mid-track
    Error(String),
}

// ============================================================================
// Voice sink
// ============================================================================

/// One audio output per guild.
///
/// `play` resolves only when the track ends, so callers race it
/// against their own cancellation signals. `set_gain` and `stop`
/// take effect on whatever play call is currently in flight.
#[async_trait]
pub trait VoiceSink: Send + Sync {
    /// Start playback at the given gain and wait for it to end.
    async fn play(&self, handle: AudioHandle, gain: f32) -> PlayOutcome;

    /// Adjust output gain mid-track. 1.0 is unity.
    async fn set_gain(&self, gain: f32);

    /// Tear down the current play call, if any.
    async fn stop(&self);
}

/// Hands out the sink for a guild when its scheduler actor starts.
pub trait SinkProvider: Send + Sync {
    fn sink_for(&self, guild_id: GuildId) -> std::sync::Arc<dyn VoiceSink>;
}

// ============================================================================
// Track resolution
// ============================================================================

/// Turns an external reference (track URL, playlist URL, seed path)
/// into zero or more playable tracks.
#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<Vec<Track>>;
}

// ============================================================================
// Persistence
// ============================================================================

/// Queue and settings snapshot persisted per guild, restored when the
/// guild's actor comes back up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedGuildState {
    pub queue: Vec<QueueEntry>,
    pub playlists: BTreeMap<String, Vec<Track>>,
    pub volume: u16,
    pub autofill_enabled: bool,
    pub autofill_source_url: Option<String>,
}

/// Why a play happened, recorded alongside the play row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayContext {
    Manual,
    Playlist,
    Autofill,
}

impl std::fmt::Display for PlayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlayContext::Manual => "manual",
            PlayContext::Playlist => "playlist",
            PlayContext::Autofill => "autofill",
        };
        write!(f, "{}", s)
    }
}

/// Time window for play-count aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRange {
    Day,
    Week,
    Month,
    All,
}

impl TimeRange {
    /// Inclusive lower bound for the window, `None` for all time.
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            TimeRange::Day => Some(now - chrono::Duration::days(1)),
            TimeRange::Week => Some(now - chrono::Duration::days(7)),
            TimeRange::Month => Some(now - chrono::Duration::days(30)),
            TimeRange::All => None,
        }
    }
}

/// Aggregated play count for one track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopTrack {
    pub track_id: String,
    pub title: String,
    pub artist: String,
    pub plays: i64,
}

/// One finished play, newest first in history queries.
#[derive(Debug, Clone)]
pub struct PlayRecord {
    pub track_id: String,
    pub title: String,
    pub artist: String,
    pub requested_by: Option<UserId>,
    pub context: PlayContext,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Durable storage behind the engine: guild snapshots, play history,
/// and per-user likes.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_guild_state(&self, guild_id: GuildId) -> Result<Option<PersistedGuildState>>;

    async fn save_guild_state(
        &self,
        guild_id: GuildId,
        state: &PersistedGuildState,
    ) -> Result<()>;

    /// Record a finished play. `ended_at` is `None` when the track was
    /// cut off before its natural end.
    async fn record_play(
        &self,
        guild_id: GuildId,
        track: &Track,
        context: PlayContext,
        started_at: DateTime<Utc>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Returns the user's like count for the guild after the insert.
    /// Re-liking the same track is a no-op on the stored set.
    async fn record_like(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        track: &Track,
    ) -> Result<u64>;

    /// Returns the remaining like count after the delete.
    async fn record_unlike(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        track_id: &str,
    ) -> Result<u64>;

    /// Every user with likes in this guild, with their liked tracks.
    /// Order of users is unspecified; the autofill sampler shuffles.
    async fn liked_track_sets(&self, guild_id: GuildId)
        -> Result<Vec<(UserId, Vec<Track>)>>;

    async fn query_top(
        &self,
        guild_id: GuildId,
        range: TimeRange,
        limit: u32,
    ) -> Result<Vec<TopTrack>>;

    async fn query_history(&self, guild_id: GuildId, limit: u32) -> Result<Vec<PlayRecord>>;
}
