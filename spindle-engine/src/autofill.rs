//! Idle-radio autofill
//!
//! When a guild's queue stays empty past the configured delay, the
//! controller asks up to three sources for replacement tracks, in
//! strict priority order. The first source that contributes at least
//! one candidate wins the pass; a source that errors, is empty, or
//! loses everything to dedup falls through to the next:
//!
//! 1. The configured source URL, resolved through the track resolver
//! 2. The CSV seed file, read with a rotating cursor so successive
//!    pulls walk the file instead of replaying its head
//! 3. Per-user liked tracks, sampled round-robin across users so one
//!    prolific liker cannot monopolize the radio
//!
//! Candidates already queued or currently playing are dropped without
//! consuming budget. Only when every source yields nothing does the
//! pull fail with `AutofillExhausted`.

use crate::resolver::read_seed_file;
use crate::traits::{StateStore, TrackResolver};
use rand::seq::SliceRandom;
use spindle_common::config::AutofillConfig;
use spindle_common::events::AutofillSource;
use spindle_common::{Error, GuildId, Result, Track, TrackOrigin};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of one autofill pass: the winning source and its tracks,
/// already origin-tagged and in enqueue order.
#[derive(Debug)]
pub struct AutofillPull {
    pub source: AutofillSource,
    pub tracks: Vec<Track>,
}

/// Per-guild autofill state. Lives inside the guild's scheduler actor.
pub struct AutofillController {
    config: AutofillConfig,
    resolver: Arc<dyn TrackResolver>,
    store: Arc<dyn StateStore>,
    /// Runtime toggle, persisted with the guild snapshot.
    enabled: bool,
    /// Runtime override of the configured source URL.
    source_url_override: Option<String>,
    /// Next CSV row to consider, survives across pulls.
    csv_cursor: usize,
}

impl AutofillController {
    pub fn new(
        config: AutofillConfig,
        resolver: Arc<dyn TrackResolver>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let enabled = config.enabled;
        Self {
            config,
            resolver,
            store,
            enabled,
            source_url_override: None,
            csv_cursor: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_source_url(&mut self, url: Option<String>) {
        self.source_url_override = url;
    }

    pub fn source_url(&self) -> Option<&str> {
        self.source_url_override
            .as_deref()
            .or(self.config.source_url.as_deref())
    }

    /// The runtime override alone, for persistence.
    pub fn source_url_override(&self) -> Option<&str> {
        self.source_url_override.as_deref()
    }

    /// How long the queue must stay empty before a pull fires.
    pub fn delay(&self) -> Duration {
        self.config.delay()
    }

    /// Run one autofill pass. `exclude` holds the ids of everything
    /// queued or currently playing; excluded candidates never consume
    /// budget.
    pub async fn pull(
        &mut self,
        guild_id: GuildId,
        exclude: &HashSet<String>,
    ) -> Result<AutofillPull> {
        if !self.enabled {
            return Err(Error::AutofillExhausted);
        }
        let budget = self.config.max_pull;

        if let Some(tracks) = self.pull_from_url(exclude, budget).await {
            debug!(guild_id, count = tracks.len(), "autofill pulled from source URL");
            return Ok(AutofillPull {
                source: AutofillSource::SourceUrl,
                tracks,
            });
        }
        if let Some(tracks) = self.pull_from_csv(exclude, budget).await {
            debug!(guild_id, count = tracks.len(), "autofill pulled from CSV seed");
            return Ok(AutofillPull {
                source: AutofillSource::CsvSeed,
                tracks,
            });
        }
        if let Some(tracks) = self.pull_from_likes(guild_id, exclude, budget).await {
            debug!(guild_id, count = tracks.len(), "autofill pulled from user likes");
            return Ok(AutofillPull {
                source: AutofillSource::UserLikes,
                tracks,
            });
        }
        Err(Error::AutofillExhausted)
    }

    /// `None` means the source contributed nothing and the pass falls
    /// through to the next source.
    async fn pull_from_url(
        &self,
        exclude: &HashSet<String>,
        budget: usize,
    ) -> Option<Vec<Track>> {
        let url = self.source_url()?;
        let resolved = match self.resolver.resolve(url).await {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!(url, error = %e, "autofill source URL failed, trying next source");
                return None;
            }
        };
        let mut seen = HashSet::new();
        let picked: Vec<Track> = resolved
            .into_iter()
            .filter(|t| !exclude.contains(&t.id) && seen.insert(t.id.clone()))
            .take(budget)
            .map(|t| t.as_autofill(TrackOrigin::AutofillUrl))
            .collect();
        (!picked.is_empty()).then_some(picked)
    }

    async fn pull_from_csv(
        &mut self,
        exclude: &HashSet<String>,
        budget: usize,
    ) -> Option<Vec<Track>> {
        let path = self.config.csv_path.clone()?;
        let rows = match read_seed_file(&path).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "autofill seed file failed, trying next source");
                return None;
            }
        };
        if rows.is_empty() {
            return None;
        }
        let start = self.csv_cursor % rows.len();
        let mut seen = HashSet::new();
        let mut picked = Vec::new();
        let mut examined = 0;
        for i in 0..rows.len() {
            if picked.len() >= budget {
                break;
            }
            examined = i + 1;
            let track = &rows[(start + i) % rows.len()];
            if !exclude.contains(&track.id) && seen.insert(track.id.clone()) {
                picked.push(track.as_autofill(TrackOrigin::AutofillCsv));
            }
        }
        self.csv_cursor = (start + examined) % rows.len();
        (!picked.is_empty()).then_some(picked)
    }

    async fn pull_from_likes(
        &self,
        guild_id: GuildId,
        exclude: &HashSet<String>,
        budget: usize,
    ) -> Option<Vec<Track>> {
        if self.config.likes_per_user == 0 {
            return None;
        }
        let mut sets = match self.store.liked_track_sets(guild_id).await {
            Ok(sets) => sets,
            Err(e) => {
                warn!(guild_id, error = %e, "autofill likes query failed");
                return None;
            }
        };
        // shuffle user order and each user's sample so no user or
        // track gets a standing head start
        let mut rng = rand::thread_rng();
        sets.shuffle(&mut rng);
        let mut lanes: Vec<VecDeque<Track>> = sets
            .into_iter()
            .map(|(_, mut tracks)| {
                tracks.shuffle(&mut rng);
                tracks.truncate(self.config.likes_per_user);
                VecDeque::from(tracks)
            })
            .collect();

        // round-robin across users until budget or lanes run dry
        let mut seen = HashSet::new();
        let mut picked = Vec::new();
        loop {
            let mut yielded = false;
            for lane in lanes.iter_mut() {
                if picked.len() >= budget {
                    return (!picked.is_empty()).then_some(picked);
                }
                let Some(track) = lane.pop_front() else {
                    continue;
                };
                yielded = true;
                if !exclude.contains(&track.id) && seen.insert(track.id.clone()) {
                    picked.push(track.as_autofill(TrackOrigin::AutofillLikes));
                }
            }
            if !yielded {
                return (!picked.is_empty()).then_some(picked);
            }
        }
    }
}
