//! # Spindle Common Library
//!
//! Shared code for the spindle playback engine:
//! - Track and queue-entry value types
//! - Error taxonomy (Error enum + Result alias)
//! - Event types (EngineEvent enum) and the broadcast EventBus
//! - Configuration loading
//! - Fade curve definitions and calculations

pub mod config;
pub mod error;
pub mod events;
pub mod fade_curves;
pub mod track;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use events::{AutofillSource, EngineEvent, EventBus, PlaybackState};
pub use fade_curves::FadeCurve;
pub use track::{GuildId, PrefetchStatus, QueueEntry, Track, TrackOrigin, UserId};
