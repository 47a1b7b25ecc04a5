// Telemetry feature extraction: one driver's samples for one race in, one feature record out.
//
// Every per-lap measure is averaged across laps; single-lap telemetry is too noisy to use alone.
// A feature that can't be computed is None, never zero.

use crate::config::{CornerConfig, TelemetryConfig};
use crate::corners::detect_corners;
use crate::data::{ChannelSet, TelemetryFile, TelemetrySample};
use crate::error::{InsufficientDataError, MalformedInputError};
use crate::stats::{mean, percentile, sample_std};
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// A sample that survived cleaning: speed, steering and brake are always present.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanSample {
    pub lap: u32,
    pub distance: Option<f64>,
    pub time: Option<f64>,
    pub speed: f64,
    pub throttle: Option<f64>,
    pub brake: f64,
    pub steering: f64,
    pub accel_long: Option<f64>,
    pub accel_lat: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetryFeatures {
    pub throttle_smoothness: Option<f64>,
    pub steering_smoothness: Option<f64>,
    pub braking_consistency: Option<f64>,
    pub corner_efficiency: Option<f64>,
    pub lateral_g_utilization: Option<f64>,
    pub acceleration_efficiency: Option<f64>,
    pub straight_speed_consistency: Option<f64>,
}

impl TelemetryFeatures {
    pub const NAMES: [&'static str; 7] = [
        "throttle_smoothness",
        "steering_smoothness",
        "braking_consistency",
        "corner_efficiency",
        "lateral_g_utilization",
        "acceleration_efficiency",
        "straight_speed_consistency",
    ];

    pub fn values(&self) -> [Option<f64>; 7] {
        [
            self.throttle_smoothness,
            self.steering_smoothness,
            self.braking_consistency,
            self.corner_efficiency,
            self.lateral_g_utilization,
            self.acceleration_efficiency,
            self.straight_speed_consistency,
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleaningStats {
    pub missing_core: usize,
    pub out_of_range: usize,
    pub filled: usize,
}

fn fill_channel<F>(lap: &mut [CleanSample], limit: usize, get: F) -> usize
where
    F: Fn(&mut CleanSample) -> &mut Option<f64>,
{
    let mut last: Option<f64> = None;
    let mut run = 0usize;
    let mut filled = 0usize;
    for s in lap.iter_mut() {
        let slot = get(s);
        match *slot {
            Some(v) => {
                last = Some(v);
                run = 0;
            }
            None => {
                run += 1;
                if run <= limit {
                    if let Some(v) = last {
                        *slot = Some(v);
                        filled += 1;
                    }
                }
            }
        }
    }
    filled
}

fn in_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<f64, MalformedInputError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(MalformedInputError::OutOfRange { field, value, min, max })
    }
}

fn clean_sample(s: &TelemetrySample, cfg: &TelemetryConfig) -> Result<CleanSample, MalformedInputError> {
    let speed = s.speed.ok_or(MalformedInputError::MissingValue("speed"))?;
    let steering = s.steering.ok_or(MalformedInputError::MissingValue("steering"))?;
    let brake = s.brake.ok_or(MalformedInputError::MissingValue("brake"))?;
    Ok(CleanSample {
        lap: s.lap,
        distance: s.distance,
        time: s.timestamp,
        speed: in_range("speed", speed, 0.0, cfg.max_speed)?,
        throttle: s.throttle.map(|t| in_range("throttle", t, 0.0, 100.0)).transpose()?,
        brake: in_range("brake", brake, f64::MIN, f64::MAX)?,
        steering: in_range("steering", steering, f64::MIN, f64::MAX)?,
        accel_long: s.accel_long,
        accel_lat: s.accel_lat,
    })
}

/// Drops unusable rows, rejects impossible values and forward-fills short channel gaps.
/// Returns the surviving samples grouped per lap, in file order within each lap.
pub fn preprocess(
    samples: &[TelemetrySample],
    cfg: &TelemetryConfig,
) -> (BTreeMap<u32, Vec<CleanSample>>, CleaningStats) {
    let mut stats = CleaningStats::default();
    let mut laps: BTreeMap<u32, Vec<CleanSample>> = BTreeMap::new();
    for s in samples {
        match clean_sample(s, cfg) {
            Ok(clean) => laps.entry(s.lap).or_default().push(clean),
            Err(MalformedInputError::OutOfRange { .. }) => stats.out_of_range += 1,
            Err(_) => stats.missing_core += 1,
        }
    }
    for lap in laps.values_mut() {
        let limit = cfg.max_forward_fill;
        stats.filled += fill_channel(lap, limit, |s| &mut s.distance);
        stats.filled += fill_channel(lap, limit, |s| &mut s.throttle);
        stats.filled += fill_channel(lap, limit, |s| &mut s.accel_long);
        stats.filled += fill_channel(lap, limit, |s| &mut s.accel_lat);
    }
    (laps, stats)
}

/// 1 / (std of first difference + epsilon). Flatter signal, larger score.
pub fn smoothness(signal: &[f64], epsilon: f64) -> Option<f64> {
    let diffs: Vec<f64> = signal.windows(2).map(|w| w[1] - w[0]).collect();
    Some(1.0 / (sample_std(&diffs)? + epsilon))
}

#[derive(Debug, Default)]
struct LapMeasures {
    throttle_smoothness: Option<f64>,
    steering_smoothness: Option<f64>,
    acceleration_efficiency: Option<f64>,
    lateral_g_utilization: Option<f64>,
    straight_speed_consistency: Option<f64>,
    first_brake_distance: Option<f64>,
    corner_ratios: Vec<f64>,
}

fn measure_lap(
    lap: &[CleanSample],
    channels: &ChannelSet,
    cfg: &TelemetryConfig,
    corner_cfg: &CornerConfig,
) -> LapMeasures {
    let eps = cfg.smoothness_epsilon;
    let mut m = LapMeasures::default();

    let steering: Vec<f64> = lap.iter().map(|s| s.steering).collect();
    m.steering_smoothness = smoothness(&steering, eps);

    if channels.throttle {
        let throttle: Vec<f64> = lap.iter().filter_map(|s| s.throttle).collect();
        m.throttle_smoothness = smoothness(&throttle, eps);
    }

    if channels.throttle && channels.accel_long {
        let max_accel = lap.iter().filter_map(|s| s.accel_long).fold(f64::NEG_INFINITY, f64::max);
        let full: Vec<f64> = lap
            .iter()
            .filter(|s| s.throttle.map_or(false, |t| t > cfg.full_throttle_pct))
            .filter_map(|s| s.accel_long)
            .collect();
        if max_accel > 0.0 {
            m.acceleration_efficiency = mean(&full).map(|a| a / max_accel);
        }
    }

    if channels.accel_lat {
        let lat: Vec<f64> = lap.iter().filter_map(|s| s.accel_lat).map(f64::abs).collect();
        m.lateral_g_utilization = percentile(&lat, 95.0);
    }

    if channels.throttle && channels.accel_lat {
        let straight: Vec<f64> = lap
            .iter()
            .filter(|s| {
                s.throttle.map_or(false, |t| t > cfg.straight_throttle_pct)
                    && s.accel_lat.map_or(false, |g| g.abs() < cfg.straight_max_lateral_g)
            })
            .map(|s| s.speed)
            .collect();
        if straight.len() >= cfg.min_straight_samples {
            m.straight_speed_consistency = sample_std(&straight).map(|sd| 1.0 / (sd + eps));
        }
    }

    if channels.distance {
        m.first_brake_distance = lap
            .iter()
            .find(|s| s.brake > corner_cfg.brake_threshold && s.distance.is_some())
            .and_then(|s| s.distance);
    }

    if channels.accel_lat && channels.distance {
        m.corner_ratios = detect_corners(lap, corner_cfg)
            .iter()
            .filter(|c| c.entry_speed > cfg.min_corner_entry_speed)
            .filter_map(|c| c.efficiency())
            .collect();
    }
    m
}

fn average<F>(laps: &[LapMeasures], get: F) -> Option<f64>
where
    F: Fn(&LapMeasures) -> Option<f64>,
{
    let values: Vec<f64> = laps.iter().filter_map(get).collect();
    mean(&values)
}

/// Feature record for one driver in one race.
/// Fails only when fewer than `min_laps` usable laps remain after cleaning.
pub fn extract_features(
    samples: &[TelemetrySample],
    channels: &ChannelSet,
    cfg: &TelemetryConfig,
    corner_cfg: &CornerConfig,
) -> Result<TelemetryFeatures, InsufficientDataError> {
    let (laps, stats) = preprocess(samples, cfg);
    if stats.missing_core + stats.out_of_range > 0 {
        debug!(
            missing = stats.missing_core,
            out_of_range = stats.out_of_range,
            filled = stats.filled,
            "telemetry rows cleaned"
        );
    }
    let usable: Vec<&Vec<CleanSample>> =
        laps.values().filter(|lap| lap.len() >= corner_cfg.min_lap_samples).collect();
    if usable.len() < cfg.min_laps {
        return Err(InsufficientDataError::new("telemetry laps", cfg.min_laps, usable.len()));
    }

    let measures: Vec<LapMeasures> =
        usable.iter().map(|lap| measure_lap(lap, channels, cfg, corner_cfg)).collect();

    let brake_points: Vec<f64> = measures.iter().filter_map(|m| m.first_brake_distance).collect();
    let braking_consistency = if brake_points.len() >= cfg.min_braking_laps {
        sample_std(&brake_points).map(|sd| 1.0 / (sd + 1.0))
    } else {
        None
    };

    let ratios: Vec<f64> = measures.iter().flat_map(|m| m.corner_ratios.iter().copied()).collect();
    let corner_efficiency = if ratios.len() >= cfg.min_corners { mean(&ratios) } else { None };

    Ok(TelemetryFeatures {
        throttle_smoothness: average(&measures, |m| m.throttle_smoothness),
        steering_smoothness: average(&measures, |m| m.steering_smoothness),
        braking_consistency,
        corner_efficiency,
        lateral_g_utilization: average(&measures, |m| m.lateral_g_utilization),
        acceleration_efficiency: average(&measures, |m| m.acceleration_efficiency),
        straight_speed_consistency: average(&measures, |m| m.straight_speed_consistency),
    })
}

/// Extracts every car in a race file. Cars are independent, so they run in parallel;
/// the returned rows are ordered by car number.
pub fn extract_race(
    race_id: &str,
    file: &TelemetryFile,
    cfg: &TelemetryConfig,
    corner_cfg: &CornerConfig,
) -> Vec<(u32, TelemetryFeatures)> {
    let by_vehicle: Vec<(u32, Vec<TelemetrySample>)> = file.by_vehicle().into_iter().collect();
    let mut rows: Vec<(u32, TelemetryFeatures)> = by_vehicle
        .par_iter()
        .filter_map(|(vehicle, samples)| {
            match extract_features(samples, &file.channels, cfg, corner_cfg) {
                Ok(features) => Some((*vehicle, features)),
                Err(err) => {
                    warn!(race = race_id, vehicle, %err, "telemetry features unavailable");
                    None
                }
            }
        })
        .collect();
    rows.sort_by_key(|(vehicle, _)| *vehicle);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corners::tests::synthetic_lap;

    fn to_samples(vehicle: u32, laps: &[Vec<CleanSample>]) -> Vec<TelemetrySample> {
        laps.iter()
            .flatten()
            .map(|s| TelemetrySample {
                vehicle_number: vehicle,
                lap: s.lap,
                distance: s.distance,
                timestamp: s.time,
                speed: Some(s.speed),
                throttle: s.throttle,
                brake: Some(s.brake),
                steering: Some(s.steering),
                accel_long: s.accel_long,
                accel_lat: s.accel_lat,
            })
            .collect()
    }

    fn three_laps() -> Vec<Vec<CleanSample>> {
        (1..=3).map(|lap| synthetic_lap(lap, 600, &[(270, 50), (450, 50)])).collect()
    }

    #[test]
    fn smoother_signal_scores_higher() {
        let calm: Vec<f64> = (0..100).map(|i| (i as f64 * 0.1).sin()).collect();
        let nervous: Vec<f64> = (0..100).map(|i| (i as f64 * 0.1).sin() + if i % 2 == 0 { 0.3 } else { -0.3 }).collect();
        let eps = TelemetryConfig::default().smoothness_epsilon;
        assert!(smoothness(&calm, eps).unwrap() > smoothness(&nervous, eps).unwrap());
    }

    #[test]
    fn flat_signal_does_not_divide_by_zero() {
        let s = smoothness(&[5.0; 20], 1e-3).unwrap();
        assert!(s.is_finite());
        assert!((s - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn identical_laps_brake_at_250_give_full_consistency() {
        let samples = to_samples(7, &three_laps());
        let f = extract_features(&samples, &ChannelSet::all(), &TelemetryConfig::default(), &CornerConfig::default())
            .unwrap();
        // first brake in each lap is 20 samples before the corner at 270 m
        assert_eq!(f.braking_consistency, Some(1.0));
    }

    #[test]
    fn corner_efficiency_is_min_over_entry() {
        let samples = to_samples(7, &three_laps());
        let f = extract_features(&samples, &ChannelSet::all(), &TelemetryConfig::default(), &CornerConfig::default())
            .unwrap();
        assert!((f.corner_efficiency.unwrap() - 80.0 / 120.0).abs() < 1e-9);
    }

    #[test]
    fn fewer_than_three_laps_is_insufficient() {
        let laps: Vec<Vec<CleanSample>> = (1..=2).map(|lap| synthetic_lap(lap, 300, &[(100, 50)])).collect();
        let err = extract_features(&to_samples(7, &laps), &ChannelSet::all(), &TelemetryConfig::default(), &CornerConfig::default())
            .unwrap_err();
        assert_eq!(err.needed, 3);
        assert_eq!(err.got, 2);
    }

    #[test]
    fn absent_throttle_channel_leaves_dependent_features_missing() {
        let mut samples = to_samples(7, &three_laps());
        for s in samples.iter_mut() {
            s.throttle = None;
        }
        let channels = ChannelSet { throttle: false, ..ChannelSet::all() };
        let f = extract_features(&samples, &channels, &TelemetryConfig::default(), &CornerConfig::default()).unwrap();
        assert_eq!(f.throttle_smoothness, None);
        assert_eq!(f.acceleration_efficiency, None);
        assert_eq!(f.straight_speed_consistency, None);
        assert!(f.steering_smoothness.is_some());
        assert!(f.corner_efficiency.is_some());
    }

    #[test]
    fn impossible_values_are_rejected_and_gaps_filled() {
        let mut samples = to_samples(7, &three_laps());
        samples[3].speed = Some(420.0);
        samples[4].throttle = Some(130.0);
        samples[5].steering = None;
        samples[10].distance = None;
        samples[11].distance = None;
        let (laps, stats) = preprocess(&samples, &TelemetryConfig::default());
        assert_eq!(stats.out_of_range, 2);
        assert_eq!(stats.missing_core, 1);
        assert!(stats.filled >= 2);
        assert_eq!(laps[&1].len(), 597);
        assert!(laps[&1].iter().all(|s| s.distance.is_some()));
    }

    #[test]
    fn rejected_sample_names_the_offending_channel() {
        let mut samples = to_samples(7, &three_laps());
        samples[0].speed = Some(-3.0);
        match clean_sample(&samples[0], &TelemetryConfig::default()) {
            Err(MalformedInputError::OutOfRange { field, value, .. }) => {
                assert_eq!(field, "speed");
                assert_eq!(value, -3.0);
            }
            other => panic!("expected out-of-range speed, got {:?}", other),
        }
        samples[1].brake = None;
        assert_eq!(
            clean_sample(&samples[1], &TelemetryConfig::default()),
            Err(MalformedInputError::MissingValue("brake"))
        );
        assert!(clean_sample(&samples[2], &TelemetryConfig::default()).is_ok());
    }

    #[test]
    fn long_gaps_are_not_filled() {
        let mut samples = to_samples(7, &three_laps());
        for s in samples.iter_mut().skip(100).take(8) {
            s.accel_lat = None;
        }
        let (laps, _) = preprocess(&samples, &TelemetryConfig::default());
        let missing = laps[&1].iter().filter(|s| s.accel_lat.is_none()).count();
        assert_eq!(missing, 3);
    }

    #[test]
    fn straight_line_consistency_needs_twenty_samples() {
        let mut samples = to_samples(7, &three_laps());
        // no sample is ever above 95% throttle
        for s in samples.iter_mut() {
            s.throttle = s.throttle.map(|t| t.min(90.0));
        }
        let f = extract_features(&samples, &ChannelSet::all(), &TelemetryConfig::default(), &CornerConfig::default())
            .unwrap();
        assert_eq!(f.straight_speed_consistency, None);
    }

    #[test]
    fn race_extraction_is_ordered_and_skips_thin_cars() {
        let mut samples = to_samples(22, &three_laps());
        samples.extend(to_samples(5, &three_laps()));
        let thin: Vec<Vec<CleanSample>> = vec![synthetic_lap(1, 300, &[(100, 50)])];
        samples.extend(to_samples(9, &thin));
        let file = TelemetryFile::new(samples, ChannelSet::all());
        let rows = extract_race("test/r1", &file, &TelemetryConfig::default(), &CornerConfig::default());
        let cars: Vec<u32> = rows.iter().map(|(v, _)| *v).collect();
        assert_eq!(cars, vec![5, 22]);
    }
}
