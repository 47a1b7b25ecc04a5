use crate::circuit_fit::TrackDemand;
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// thresholds are calibrated for one car/sensor rig; re-check them for any other.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CornerConfig {
    /// degrees
    pub steering_threshold: f64,
    /// g
    pub lateral_g_threshold: f64,
    /// seconds
    pub min_corner_duration: f64,
    /// meters between zones that get merged into one (chicanes)
    pub merge_gap_m: f64,
    /// fallback merge gap when the distance channel is unusable
    pub merge_gap_samples: usize,
    /// bar
    pub brake_threshold: f64,
    pub brake_lookback: usize,
    /// seconds per row when timestamps are unusable
    pub nominal_sample_interval: f64,
    pub throttle_reapply_pct: f64,
    pub min_lap_samples: usize,
}

impl Default for CornerConfig {
    fn default() -> Self {
        Self {
            steering_threshold: 30.0,
            lateral_g_threshold: 0.8,
            min_corner_duration: 0.5,
            merge_gap_m: 50.0,
            merge_gap_samples: 12,
            brake_threshold: 20.0,
            brake_lookback: 100,
            nominal_sample_interval: 0.04,
            throttle_reapply_pct: 50.0,
            min_lap_samples: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub min_laps: usize,
    pub max_speed: f64,
    pub max_forward_fill: usize,
    pub smoothness_epsilon: f64,
    pub full_throttle_pct: f64,
    pub straight_throttle_pct: f64,
    pub straight_max_lateral_g: f64,
    pub min_straight_samples: usize,
    pub min_corner_entry_speed: f64,
    pub min_corners: usize,
    pub min_braking_laps: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            min_laps: 3,
            max_speed: 300.0,
            max_forward_fill: 5,
            smoothness_epsilon: 1e-3,
            full_throttle_pct: 80.0,
            straight_throttle_pct: 95.0,
            straight_max_lateral_g: 0.3,
            min_straight_samples: 20,
            min_corner_entry_speed: 20.0,
            min_corners: 2,
            min_braking_laps: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RaceFeatureConfig {
    pub green_flag: String,
    pub min_green_laps: usize,
    pub fastest_lap_window: usize,
    pub min_stint_laps: usize,
}

impl Default for RaceFeatureConfig {
    fn default() -> Self {
        Self {
            green_flag: "GF".to_string(),
            min_green_laps: 3,
            fastest_lap_window: 10,
            min_stint_laps: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FactorConfig {
    pub min_observations: usize,
    pub collinearity_threshold: f64,
    pub vif_threshold: f64,
    pub kmo_threshold: f64,
    pub bartlett_alpha: f64,
    pub varimax_max_iter: usize,
    pub varimax_tol: f64,
    /// loadings considered "dominant" when deciding reflection
    pub dominant_loadings: usize,
}

impl Default for FactorConfig {
    fn default() -> Self {
        Self {
            min_observations: 10,
            collinearity_threshold: 0.70,
            vif_threshold: 10.0,
            kmo_threshold: 0.6,
            bartlett_alpha: 0.05,
            varimax_max_iter: 100,
            varimax_tol: 1e-6,
            dominant_loadings: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StretchConfig {
    pub target_std: f64,
    pub target_range: f64,
    pub out_min: f64,
    pub out_max: f64,
}

impl Default for StretchConfig {
    fn default() -> Self {
        Self { target_std: 25.0, target_range: 80.0, out_min: 5.0, out_max: 95.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub min_drivers: usize,
    pub bootstrap_resamples: usize,
    pub seed: u64,
    /// a resample whose thinnest design direction keeps less than this share of the
    /// full sample's spread is skipped as degenerate
    pub min_resample_spread: f64,
    pub medium_ratio: f64,
    pub low_ratio: f64,
    pub similar_k: usize,
    pub max_shrinkage: f64,
    pub min_out_of_sample_r2: f64,
    pub small_sample_drivers: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            min_drivers: 6,
            bootstrap_resamples: 1000,
            seed: 42,
            min_resample_spread: 0.05,
            medium_ratio: 1.5,
            low_ratio: 2.0,
            similar_k: 3,
            max_shrinkage: 0.15,
            min_out_of_sample_r2: 0.2,
            small_sample_drivers: 20,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub corner: CornerConfig,
    pub telemetry: TelemetryConfig,
    pub race: RaceFeatureConfig,
    pub factor: FactorConfig,
    pub stretch: StretchConfig,
    pub model: ModelConfig,
    pub tracks: BTreeMap<String, TrackDemand>,
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&data)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))
    }
}
