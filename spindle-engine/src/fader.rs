//! Discrete fade envelopes
//!
//! Fades are driven as a fixed number of gain steps spread evenly over
//! the fade window, not per-sample ramps: the sink only exposes
//! `set_gain`, so the controller computes each step's multiplier from
//! the configured curve and sleeps between steps. Step sequences are
//! monotone because every curve is monotone over its domain.
//!
//! The user volume (0-200) scales the whole envelope: the fade-in
//! target is `volume / 100` as a gain multiplier, and a volume change
//! mid-fade is picked up at the next step.

use crate::traits::VoiceSink;
use spindle_common::config::FadeConfig;
use std::time::Duration;
use tokio::sync::watch;

/// Convert the 0-200 user volume scale to a gain multiplier.
pub fn volume_to_gain(volume: u16) -> f32 {
    f32::from(volume.min(200)) / 100.0
}

/// Runs fade envelopes against a sink.
#[derive(Debug, Clone)]
pub struct FadeController {
    config: FadeConfig,
}

impl FadeController {
    pub fn new(config: FadeConfig) -> Self {
        Self { config }
    }

    /// The envelope multipliers for a fade-in, starting at 0.0 and
    /// ending at exactly 1.0.
    pub fn fade_in_steps(&self) -> Vec<f32> {
        let steps = self.config.steps;
        (0..=steps)
            .map(|i| self.config.curve.fade_in_gain(i as f32 / steps as f32))
            .collect()
    }

    /// The envelope multipliers for a fade-out, starting at 1.0 and
    /// ending at exactly 0.0.
    pub fn fade_out_steps(&self) -> Vec<f32> {
        let steps = self.config.steps;
        (0..=steps)
            .map(|i| self.config.curve.fade_out_gain(i as f32 / steps as f32))
            .collect()
    }

    fn step_interval(&self, window_ms: u64) -> Duration {
        Duration::from_millis(window_ms / u64::from(self.config.steps).max(1))
    }

    /// Upper bound on how long a fade-out may run before the sink is
    /// torn down regardless.
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.config.hard_timeout_ms)
    }

    /// Ramp the sink from silence up to the current volume gain.
    ///
    /// `volume` is watched so a mid-fade volume change rescales the
    /// remaining steps. The final step always lands on the exact
    /// target gain.
    pub async fn run_fade_in(&self, sink: &dyn VoiceSink, volume: &watch::Receiver<u16>) {
        let interval = self.step_interval(self.config.fade_in_ms);
        for (i, multiplier) in self.fade_in_steps().into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(interval).await;
            }
            let target = volume_to_gain(*volume.borrow());
            sink.set_gain(multiplier * target).await;
        }
    }

    /// Ramp the sink from the current volume gain down to silence.
    ///
    /// `shortened` selects the skip window instead of the natural-end
    /// window. The whole ramp is bounded by the hard timeout; if it
    /// fires the gain snaps to zero.
    pub async fn run_fade_out(
        &self,
        sink: &dyn VoiceSink,
        volume: &watch::Receiver<u16>,
        shortened: bool,
    ) {
        let window = if shortened {
            self.config.skip_fade_out_ms
        } else {
            self.config.fade_out_ms
        };
        let interval = self.step_interval(window);
        let ramp = async {
            for (i, multiplier) in self.fade_out_steps().into_iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(interval).await;
                }
                let target = volume_to_gain(*volume.borrow());
                sink.set_gain(multiplier * target).await;
            }
        };
        if tokio::time::timeout(self.hard_timeout(), ramp).await.is_err() {
            sink.set_gain(0.0).await;
        }
    }
}
