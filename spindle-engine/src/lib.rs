//! # Spindle Playback Engine (spindle-engine)
//!
//! Continuous per-guild audio playback: an ordered track queue that
//! self-replenishes when empty, content-addressed prefetching to hide
//! playback-start latency, and stepped fade transitions between
//! tracks.
//!
//! **Architecture:** one actor per guild linearizes every mutation
//! for that guild; a single shared cache store coalesces fetches
//! across guilds; external collaborators (resolver, voice sink,
//! storage) are trait objects injected at construction.

pub mod autofill;
pub mod cache;
pub mod db;
pub mod fader;
pub mod playback;
pub mod queue;
pub mod resolver;
pub mod scheduler;
pub mod sink;
pub mod traits;

pub use scheduler::{EngineDeps, FillerSkip, GuildScheduler, GuildSnapshot};
pub use traits::{AudioHandle, PlayOutcome, SinkProvider, StateStore, TrackResolver, VoiceSink};
