//! SQLite state store
//!
//! Guild snapshots are stored as one JSON payload per guild; plays
//! and likes get real rows so the leaderboard and autofill queries
//! can aggregate in SQL.

use crate::traits::{
    PersistedGuildState, PlayContext, PlayRecord, StateStore, TimeRange, TopTrack,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use spindle_common::{Error, GuildId, Result, Track, TrackOrigin, UserId};
use sqlx::SqlitePool;
use uuid::Uuid;

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn context_from_str(s: &str) -> PlayContext {
    match s {
        "playlist" => PlayContext::Playlist,
        "autofill" => PlayContext::Autofill,
        _ => PlayContext::Manual,
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load_guild_state(&self, guild_id: GuildId) -> Result<Option<PersistedGuildState>> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM guild_state WHERE guild_id = ?")
                .bind(guild_id as i64)
                .fetch_optional(&self.pool)
                .await?;
        match payload {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| Error::Internal(format!("corrupt guild state payload: {}", e))),
            None => Ok(None),
        }
    }

    async fn save_guild_state(
        &self,
        guild_id: GuildId,
        state: &PersistedGuildState,
    ) -> Result<()> {
        let payload = serde_json::to_string(state)
            .map_err(|e| Error::Internal(format!("cannot serialize guild state: {}", e)))?;
        sqlx::query(
            r#"
            INSERT INTO guild_state (guild_id, payload, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(guild_id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(guild_id as i64)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_play(
        &self,
        guild_id: GuildId,
        track: &Track,
        context: PlayContext,
        started_at: DateTime<Utc>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plays
                (guid, guild_id, track_id, title, artist, requested_by, context, started_at, ended_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(guild_id as i64)
        .bind(&track.id)
        .bind(&track.title)
        .bind(&track.artist)
        .bind(track.requested_by.map(|u| u as i64))
        .bind(context.to_string())
        .bind(started_at)
        .bind(ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_like(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        track: &Track,
    ) -> Result<u64> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO likes
                (guild_id, user_id, track_id, title, artist, source_url, duration_secs, liked_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(guild_id as i64)
        .bind(user_id as i64)
        .bind(&track.id)
        .bind(&track.title)
        .bind(&track.artist)
        .bind(&track.source_url)
        .bind(track.duration_secs.map(|d| d as i64))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM likes WHERE guild_id = ? AND user_id = ?")
                .bind(guild_id as i64)
                .bind(user_id as i64)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn record_unlike(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        track_id: &str,
    ) -> Result<u64> {
        sqlx::query("DELETE FROM likes WHERE guild_id = ? AND user_id = ? AND track_id = ?")
            .bind(guild_id as i64)
            .bind(user_id as i64)
            .bind(track_id)
            .execute(&self.pool)
            .await?;

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM likes WHERE guild_id = ? AND user_id = ?")
                .bind(guild_id as i64)
                .bind(user_id as i64)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn liked_track_sets(
        &self,
        guild_id: GuildId,
    ) -> Result<Vec<(UserId, Vec<Track>)>> {
        let rows: Vec<(i64, String, String, String, String, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT user_id, track_id, title, artist, source_url, duration_secs
            FROM likes
            WHERE guild_id = ?
            ORDER BY user_id, liked_at
            "#,
        )
        .bind(guild_id as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut sets: Vec<(UserId, Vec<Track>)> = Vec::new();
        for (user_id, track_id, title, artist, source_url, duration) in rows {
            let track = Track {
                id: track_id,
                title,
                artist,
                source_url,
                duration_secs: duration.map(|d| d as u64),
                requested_by: None,
                origin: TrackOrigin::Manual,
            };
            match sets.last_mut() {
                Some((user, tracks)) if *user == user_id as UserId => tracks.push(track),
                _ => sets.push((user_id as UserId, vec![track])),
            }
        }
        Ok(sets)
    }

    async fn query_top(
        &self,
        guild_id: GuildId,
        range: TimeRange,
        limit: u32,
    ) -> Result<Vec<TopTrack>> {
        let since = range.since(Utc::now());
        let rows: Vec<(String, String, String, i64)> = match since {
            Some(since) => {
                sqlx::query_as(
                    r#"
                    SELECT track_id, title, artist, COUNT(*) AS plays
                    FROM plays
                    WHERE guild_id = ? AND started_at >= ?
                    GROUP BY track_id, title, artist
                    ORDER BY plays DESC, track_id
                    LIMIT ?
                    "#,
                )
                .bind(guild_id as i64)
                .bind(since)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT track_id, title, artist, COUNT(*) AS plays
                    FROM plays
                    WHERE guild_id = ?
                    GROUP BY track_id, title, artist
                    ORDER BY plays DESC, track_id
                    LIMIT ?
                    "#,
                )
                .bind(guild_id as i64)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows
            .into_iter()
            .map(|(track_id, title, artist, plays)| TopTrack {
                track_id,
                title,
                artist,
                plays,
            })
            .collect())
    }

    async fn query_history(&self, guild_id: GuildId, limit: u32) -> Result<Vec<PlayRecord>> {
        let rows: Vec<(
            String,
            String,
            String,
            Option<i64>,
            String,
            DateTime<Utc>,
            Option<DateTime<Utc>>,
        )> = sqlx::query_as(
            r#"
            SELECT track_id, title, artist, requested_by, context, started_at, ended_at
            FROM plays
            WHERE guild_id = ?
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )
        .bind(guild_id as i64)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(track_id, title, artist, requested_by, context, started_at, ended_at)| {
                    PlayRecord {
                        track_id,
                        title,
                        artist,
                        requested_by: requested_by.map(|u| u as UserId),
                        context: context_from_str(&context),
                        started_at,
                        ended_at,
                    }
                },
            )
            .collect())
    }
}
