//! Track value types
//!
//! A `Track` is immutable once resolved: created by a `TrackResolver`,
//! then shared by value between the queue, cache, and store without
//! further mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server/community context id; the unit of queue and autofill isolation.
pub type GuildId = u64;

/// Identity of a requesting user.
pub type UserId = u64;

/// Where a queue entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackOrigin {
    /// Enqueued directly by a user
    Manual,
    /// Loaded from a named playlist
    Playlist,
    /// Autofill pull from the configured source URL
    AutofillUrl,
    /// Autofill pull from the CSV seed file
    AutofillCsv,
    /// Autofill sample from per-user liked tracks
    AutofillLikes,
}

impl TrackOrigin {
    /// Autofill-sourced entries ("filler") are treated differently by
    /// per-user quotas, `stop`, and the filler-skip command.
    pub fn is_autofill(&self) -> bool {
        matches!(
            self,
            TrackOrigin::AutofillUrl | TrackOrigin::AutofillCsv | TrackOrigin::AutofillLikes
        )
    }
}

/// Resolved track metadata, immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Stable identity (source URL or content hash)
    pub id: String,
    pub title: String,
    pub artist: String,
    /// Where the audio bytes live
    pub source_url: String,
    /// Unknown until probed
    pub duration_secs: Option<u64>,
    /// None for autofill-sourced tracks
    pub requested_by: Option<UserId>,
    pub origin: TrackOrigin,
}

impl Track {
    /// Build a manually requested track with the given requester.
    pub fn manual(
        id: impl Into<String>,
        title: impl Into<String>,
        artist: impl Into<String>,
        source_url: impl Into<String>,
        requested_by: UserId,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: artist.into(),
            source_url: source_url.into(),
            duration_secs: None,
            requested_by: Some(requested_by),
            origin: TrackOrigin::Manual,
        }
    }

    /// Copy of this track re-tagged with an autofill origin and no requester.
    pub fn as_autofill(&self, origin: TrackOrigin) -> Self {
        debug_assert!(origin.is_autofill());
        Self {
            requested_by: None,
            origin,
            ..self.clone()
        }
    }
}

/// Prefetch lifecycle of a queue entry, mirroring the cache fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchStatus {
    NotStarted,
    InProgress,
    Ready,
    Failed,
}

/// A track plus queue-local state. Lives in exactly one guild's queue;
/// destroyed when played, skipped, or the queue is cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub track: Track,
    pub enqueued_at: DateTime<Utc>,
    pub prefetch: PrefetchStatus,
}

impl QueueEntry {
    pub fn new(track: Track) -> Self {
        Self {
            track,
            enqueued_at: Utc::now(),
            prefetch: PrefetchStatus::NotStarted,
        }
    }
}
