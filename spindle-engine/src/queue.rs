//! Per-guild track queue and named playlists
//!
//! The queue is plain owned data, no interior locking: it lives inside
//! one guild's scheduler actor and every mutation arrives through that
//! actor's mailbox, which is what makes observers see each change
//! atomically.
//!
//! Quota rules:
//! - A batch add is all-or-nothing. If the batch size exceeds
//!   `max_per_add`, or any requester in it would exceed `max_per_user`,
//!   nothing is enqueued.
//! - Autofill ("filler") entries never count toward a user's quota and
//!   never block manual adds.

use rand::seq::SliceRandom;
use rand::Rng;
use spindle_common::config::QueueConfig;
use spindle_common::{Error, QueueEntry, Result, Track, TrackOrigin, UserId};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::collections::VecDeque;

/// FIFO queue of pending tracks plus this guild's named playlists.
#[derive(Debug, Default)]
pub struct TrackQueue {
    entries: VecDeque<QueueEntry>,
    playlists: BTreeMap<String, Vec<Track>>,
    limits: QueueConfig,
}

impl TrackQueue {
    pub fn new(limits: QueueConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            playlists: BTreeMap::new(),
            limits,
        }
    }

    /// Rebuild from a persisted snapshot.
    pub fn restore(
        limits: QueueConfig,
        entries: Vec<QueueEntry>,
        playlists: BTreeMap<String, Vec<Track>>,
    ) -> Self {
        Self {
            entries: entries.into(),
            playlists,
            limits,
        }
    }

    // ========================================================================
    // Queue operations
    // ========================================================================

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    pub fn contains_track(&self, track_id: &str) -> bool {
        self.entries.iter().any(|e| e.track.id == track_id)
    }

    /// Non-filler entries currently queued by `user`.
    pub fn user_queued_count(&self, user: UserId) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.track.origin.is_autofill() && e.track.requested_by == Some(user))
            .count()
    }

    /// Append one track, or insert at `position` (clamped to the tail).
    ///
    /// Returns the entry's position. Manual tracks are checked against
    /// the per-user cap; filler bypasses it.
    pub fn enqueue_at(&mut self, track: Track, position: Option<usize>) -> Result<usize> {
        self.check_user_caps(std::slice::from_ref(&track))?;
        let pos = position
            .unwrap_or(self.entries.len())
            .min(self.entries.len());
        self.entries.insert(pos, QueueEntry::new(track));
        Ok(pos)
    }

    pub fn enqueue(&mut self, track: Track) -> Result<usize> {
        self.enqueue_at(track, None)
    }

    /// Append a batch atomically. Returns the number enqueued, which
    /// is always the full batch size on success.
    pub fn enqueue_batch(&mut self, tracks: Vec<Track>) -> Result<usize> {
        if self.limits.limit_enabled && tracks.len() > self.limits.max_per_add {
            return Err(Error::QuotaExceeded(format!(
                "batch of {} exceeds the {}-track add limit",
                tracks.len(),
                self.limits.max_per_add
            )));
        }
        self.check_user_caps(&tracks)?;
        let added = tracks.len();
        self.entries.extend(tracks.into_iter().map(QueueEntry::new));
        Ok(added)
    }

    /// Per-user cap check across existing entries plus the incoming
    /// batch. Fails before anything is inserted.
    fn check_user_caps(&self, incoming: &[Track]) -> Result<()> {
        let mut pending: BTreeMap<UserId, usize> = BTreeMap::new();
        for track in incoming {
            if track.origin.is_autofill() {
                continue;
            }
            if let Some(user) = track.requested_by {
                *pending.entry(user).or_default() += 1;
            }
        }
        for (user, extra) in pending {
            let total = self.user_queued_count(user) + extra;
            if total > self.limits.max_per_user {
                return Err(Error::QuotaExceeded(format!(
                    "user {} would have {} queued tracks (max {})",
                    user, total, self.limits.max_per_user
                )));
            }
        }
        Ok(())
    }

    /// Pop the head of the queue for playback.
    pub fn dequeue_next(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Head of the queue without removing it; prefetch lookahead uses this.
    pub fn peek_next(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    /// Remove the entry at `position` (0 = head).
    pub fn remove_at(&mut self, position: usize) -> Result<Track> {
        self.entries
            .remove(position)
            .map(|e| e.track)
            .ok_or_else(|| {
                Error::InvalidState(format!(
                    "no queue entry at position {} (len {})",
                    position,
                    self.entries.len()
                ))
            })
    }

    /// Drop every autofill-sourced entry. Returns how many went.
    pub fn purge_filler(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !e.track.origin.is_autofill());
        before - self.entries.len()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    /// Fisher-Yates over the pending entries. The entry set is
    /// unchanged, only the order moves.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        self.entries.make_contiguous().shuffle(rng);
    }

    /// Shuffle variant that guarantees the current head does not stay
    /// first (when more than one entry exists), so a reshuffle is
    /// always audible.
    pub fn shuffle_displacing_first<R: Rng>(&mut self, rng: &mut R) {
        if self.entries.len() < 2 {
            return;
        }
        let old_head = self.entries[0].track.id.clone();
        self.shuffle(rng);
        if self.entries[0].track.id == old_head {
            let swap_with = rng.gen_range(1..self.entries.len());
            self.entries.swap(0, swap_with);
        }
    }

    /// Update the prefetch status of the entry holding `track_id`.
    pub fn set_prefetch_status(
        &mut self,
        track_id: &str,
        status: spindle_common::PrefetchStatus,
    ) -> bool {
        for entry in self.entries.iter_mut() {
            if entry.track.id == track_id {
                entry.prefetch = status;
                return true;
            }
        }
        false
    }

    /// Clone of the pending entries, for snapshots and persistence.
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.iter().cloned().collect()
    }

    // ========================================================================
    // Playlists
    // ========================================================================

    /// Create an empty playlist. Names are case-sensitive and unique.
    pub fn create_playlist(&mut self, name: &str) -> Result<()> {
        match self.playlists.entry(name.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(Vec::new());
                Ok(())
            }
            Entry::Occupied(_) => Err(Error::InvalidState(format!(
                "playlist already exists: {}",
                name
            ))),
        }
    }

    pub fn delete_playlist(&mut self, name: &str) -> Result<()> {
        self.playlists
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::PlaylistNotFound(name.to_string()))
    }

    pub fn add_to_playlist(&mut self, name: &str, track: Track) -> Result<usize> {
        let list = self
            .playlists
            .get_mut(name)
            .ok_or_else(|| Error::PlaylistNotFound(name.to_string()))?;
        list.push(track);
        Ok(list.len())
    }

    /// Append a playlist's tracks to the queue, re-tagged with the
    /// playlist origin. The playlist itself is untouched. Playlist
    /// loads bypass the per-add batch cap but still honor per-user caps.
    pub fn load_playlist(&mut self, name: &str) -> Result<usize> {
        let tracks: Vec<Track> = self
            .playlists
            .get(name)
            .ok_or_else(|| Error::PlaylistNotFound(name.to_string()))?
            .iter()
            .map(|t| Track {
                origin: TrackOrigin::Playlist,
                ..t.clone()
            })
            .collect();
        self.check_user_caps(&tracks)?;
        let added = tracks.len();
        self.entries.extend(tracks.into_iter().map(QueueEntry::new));
        Ok(added)
    }

    pub fn playlist_names(&self) -> Vec<String> {
        self.playlists.keys().cloned().collect()
    }

    pub fn playlists(&self) -> &BTreeMap<String, Vec<Track>> {
        &self.playlists
    }
}
