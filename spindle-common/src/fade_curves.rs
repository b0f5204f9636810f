//! Fade curve shapes for transition envelopes
//!
//! The fade controller works in discrete gain steps rather than
//! per-sample multipliers, so a curve here is just a mapping from
//! normalized progress (0.0..=1.0) to a gain multiplier. Every curve
//! is monotone over that range, which keeps the emitted step
//! sequences monotone as well.

use serde::{Deserialize, Serialize};
use std::f32::consts::FRAC_PI_2;

/// Fade curve types
///
/// - Linear: constant rate of change (the default; predictable)
/// - Exponential: slow start, fast finish (natural-sounding fade-in)
/// - Logarithmic: fast start, slow finish (natural-sounding fade-out)
/// - SCurve: smooth acceleration and deceleration
/// - EqualPower: constant perceived loudness across a crossfade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    Linear,
    Exponential,
    Logarithmic,
    SCurve,
    EqualPower,
}

impl FadeCurve {
    /// Gain multiplier for a fade-in at normalized `progress`.
    ///
    /// 0.0 at the start of the fade, 1.0 at the end.
    pub fn fade_in_gain(&self, progress: f32) -> f32 {
        let t = progress.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => t,
            // y = t^2: slow start, fast finish
            FadeCurve::Exponential => t * t,
            // sqrt inverts the quadratic when used on the way up
            FadeCurve::Logarithmic => t.sqrt(),
            // y = 0.5 * (1 - cos(pi * t))
            FadeCurve::SCurve => 0.5 * (1.0 - (std::f32::consts::PI * t).cos()),
            // y = sin(t * pi/2)
            FadeCurve::EqualPower => (t * FRAC_PI_2).sin(),
        }
    }

    /// Gain multiplier for a fade-out at normalized `progress`.
    ///
    /// 1.0 at the start of the fade, 0.0 at the end.
    pub fn fade_out_gain(&self, progress: f32) -> f32 {
        let t = progress.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => 1.0 - t,
            // y = 1 - t^2: stays loud, then drops fast
            FadeCurve::Exponential => 1.0 - t * t,
            // y = (1-t)^2: fast start, slow finish
            FadeCurve::Logarithmic => {
                let inv = 1.0 - t;
                inv * inv
            }
            FadeCurve::SCurve => 0.5 * (1.0 + (std::f32::consts::PI * t).cos()),
            FadeCurve::EqualPower => (t * FRAC_PI_2).cos(),
        }
    }

    /// Parse from a config/database string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "linear" => Some(FadeCurve::Linear),
            "exponential" => Some(FadeCurve::Exponential),
            "logarithmic" => Some(FadeCurve::Logarithmic),
            "cosine" | "scurve" | "s-curve" | "s_curve" => Some(FadeCurve::SCurve),
            "equal_power" | "equalpower" => Some(FadeCurve::EqualPower),
            _ => None,
        }
    }

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            FadeCurve::Linear => "linear",
            FadeCurve::Exponential => "exponential",
            FadeCurve::Logarithmic => "logarithmic",
            FadeCurve::SCurve => "s_curve",
            FadeCurve::EqualPower => "equal_power",
        }
    }

    /// All variants, for validation and iteration in tests.
    pub fn all_variants() -> &'static [FadeCurve] {
        &[
            FadeCurve::Linear,
            FadeCurve::Exponential,
            FadeCurve::Logarithmic,
            FadeCurve::SCurve,
            FadeCurve::EqualPower,
        ]
    }
}

impl Default for FadeCurve {
    fn default() -> Self {
        FadeCurve::Linear
    }
}

impl std::fmt::Display for FadeCurve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fade_in_bounds() {
        for curve in FadeCurve::all_variants() {
            assert!(curve.fade_in_gain(0.0).abs() < 0.01, "{:?} start", curve);
            assert!((curve.fade_in_gain(1.0) - 1.0).abs() < 0.01, "{:?} end", curve);
        }
    }

    #[test]
    fn test_fade_out_bounds() {
        for curve in FadeCurve::all_variants() {
            assert!((curve.fade_out_gain(0.0) - 1.0).abs() < 0.01, "{:?} start", curve);
            assert!(curve.fade_out_gain(1.0).abs() < 0.01, "{:?} end", curve);
        }
    }

    #[test]
    fn test_monotone() {
        // 100-point sweep; fade-in must never decrease, fade-out never increase
        for curve in FadeCurve::all_variants() {
            let mut prev_in = curve.fade_in_gain(0.0);
            let mut prev_out = curve.fade_out_gain(0.0);
            for i in 1..=100 {
                let t = i as f32 / 100.0;
                let g_in = curve.fade_in_gain(t);
                let g_out = curve.fade_out_gain(t);
                assert!(g_in >= prev_in - 1e-6, "{:?} fade-in not monotone at {}", curve, t);
                assert!(g_out <= prev_out + 1e-6, "{:?} fade-out not monotone at {}", curve, t);
                prev_in = g_in;
                prev_out = g_out;
            }
        }
    }

    #[test]
    fn test_parse_round_trip() {
        for curve in FadeCurve::all_variants() {
            assert_eq!(FadeCurve::parse(curve.as_str()), Some(*curve));
        }
        assert_eq!(FadeCurve::parse("cosine"), Some(FadeCurve::SCurve));
        assert_eq!(FadeCurve::parse("bogus"), None);
    }

    #[test]
    fn test_progress_clamped() {
        assert_eq!(FadeCurve::Linear.fade_in_gain(-1.0), 0.0);
        assert_eq!(FadeCurve::Linear.fade_in_gain(2.0), 1.0);
        assert_eq!(FadeCurve::Linear.fade_out_gain(2.0), 0.0);
    }
}
