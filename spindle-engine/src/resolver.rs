//! CSV-backed track resolution
//!
//! Seed files are one track per line: `id,title,artist,url[,duration]`.
//! Blank lines and `#` comments are skipped, fields may be quoted to
//! carry embedded commas. The same parser feeds the autofill CSV
//! source and the standalone `CsvResolver`.

use crate::traits::TrackResolver;
use async_trait::async_trait;
use spindle_common::error::ResolutionKind;
use spindle_common::{Error, Result, Track, TrackOrigin};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Split one CSV line, honoring double quotes.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Parse one seed line into a track. Returns `None` for blank lines,
/// comments, and rows missing required fields.
pub fn parse_seed_line(line: &str) -> Option<Track> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let fields = split_fields(line);
    if fields.len() < 4 {
        return None;
    }
    let id = fields[0].trim();
    let url = fields[3].trim();
    if id.is_empty() || url.is_empty() {
        return None;
    }
    Some(Track {
        id: id.to_string(),
        title: fields[1].trim().to_string(),
        artist: fields[2].trim().to_string(),
        source_url: url.to_string(),
        duration_secs: fields.get(4).and_then(|d| d.trim().parse().ok()),
        requested_by: None,
        origin: TrackOrigin::Manual,
    })
}

/// Read and parse a whole seed file, skipping malformed rows.
pub async fn read_seed_file(path: &Path) -> Result<Vec<Track>> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::resolution(
            ResolutionKind::NotFound,
            format!("{}: {}", path.display(), e),
        )
    })?;
    let mut tracks = Vec::new();
    for (n, line) in text.lines().enumerate() {
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        match parse_seed_line(line) {
            Some(track) => tracks.push(track),
            None => warn!(path = %path.display(), line = n + 1, "skipping malformed seed row"),
        }
    }
    Ok(tracks)
}

/// Resolves `.csv` file references into their track rows.
pub struct CsvResolver {
    /// Restrict resolution to this file when set; otherwise any
    /// existing `.csv` path resolves.
    seed_path: Option<PathBuf>,
}

impl CsvResolver {
    pub fn new() -> Self {
        Self { seed_path: None }
    }

    pub fn pinned_to(path: impl Into<PathBuf>) -> Self {
        Self {
            seed_path: Some(path.into()),
        }
    }
}

impl Default for CsvResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrackResolver for CsvResolver {
    async fn resolve(&self, reference: &str) -> Result<Vec<Track>> {
        let path = match &self.seed_path {
            Some(pinned) => pinned.clone(),
            None if reference.ends_with(".csv") => PathBuf::from(reference),
            None => {
                return Err(Error::resolution(ResolutionKind::Unsupported, reference));
            }
        };
        let tracks = read_seed_file(&path).await?;
        if tracks.is_empty() {
            return Err(Error::resolution(ResolutionKind::NotFound, reference));
        }
        Ok(tracks)
    }
}
