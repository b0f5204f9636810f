//! Simulated voice sink
//!
//! Stands in for the real voice transport in the demo binary and in
//! tests. A "track" is a timed sleep at the configured duration, and
//! every gain write is logged so tests can assert on the envelope the
//! fade controller actually produced.

use crate::traits::{AudioHandle, PlayOutcome, VoiceSink};
use async_trait::async_trait;
use spindle_common::GuildId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

pub struct SimulatedSink {
    /// Every simulated track "plays" for this long.
    track_duration: Duration,
    gain_log: Mutex<Vec<f32>>,
    stop: Notify,
    playing: AtomicBool,
    /// When set, `play` fails with this message instead of finishing.
    fail_with: Option<String>,
}

impl SimulatedSink {
    pub fn new(track_duration: Duration) -> Self {
        Self {
            track_duration,
            gain_log: Mutex::new(Vec::new()),
            stop: Notify::new(),
            playing: AtomicBool::new(false),
            fail_with: None,
        }
    }

    /// A sink whose every play call fails, for error-path tests.
    pub fn failing(track_duration: Duration, reason: impl Into<String>) -> Self {
        Self {
            fail_with: Some(reason.into()),
            ..Self::new(track_duration)
        }
    }

    /// Every gain value written so far, in write order.
    pub fn gain_log(&self) -> Vec<f32> {
        self.gain_log.lock().expect("gain log lock").clone()
    }

    pub fn last_gain(&self) -> f32 {
        self.gain_log
            .lock()
            .expect("gain log lock")
            .last()
            .copied()
            .unwrap_or(0.0)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn log_gain(&self, gain: f32) {
        self.gain_log.lock().expect("gain log lock").push(gain);
    }
}

#[async_trait]
impl VoiceSink for SimulatedSink {
    async fn play(&self, handle: AudioHandle, gain: f32) -> PlayOutcome {
        debug!(?handle, gain, "simulated play start");
        self.log_gain(gain);
        self.playing.store(true, Ordering::SeqCst);
        let outcome = tokio::select! {
            _ = tokio::time::sleep(self.track_duration) => {
                match &self.fail_with {
                    Some(reason) => PlayOutcome::Error(reason.clone()),
                    None => PlayOutcome::NaturalEnd,
                }
            }
            _ = self.stop.notified() => PlayOutcome::Stopped,
        };
        self.playing.store(false, Ordering::SeqCst);
        outcome
    }

    async fn set_gain(&self, gain: f32) {
        self.log_gain(gain);
    }

    async fn stop(&self) {
        self.stop.notify_waiters();
    }
}

/// Provider handing every guild its own independent simulated sink.
pub struct SimulatedSinkProvider {
    track_duration: Duration,
    sinks: Mutex<std::collections::HashMap<GuildId, Arc<SimulatedSink>>>,
}

impl SimulatedSinkProvider {
    pub fn new(track_duration: Duration) -> Self {
        Self {
            track_duration,
            sinks: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// The sink previously handed out for a guild, for test assertions.
    pub fn existing(&self, guild_id: GuildId) -> Option<Arc<SimulatedSink>> {
        self.sinks.lock().expect("sink map lock").get(&guild_id).cloned()
    }
}

impl crate::traits::SinkProvider for SimulatedSinkProvider {
    fn sink_for(&self, guild_id: GuildId) -> Arc<dyn VoiceSink> {
        let mut sinks = self.sinks.lock().expect("sink map lock");
        sinks
            .entry(guild_id)
            .or_insert_with(|| Arc::new(SimulatedSink::new(self.track_duration)))
            .clone()
    }
}
