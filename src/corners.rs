// Corner and braking-zone segmentation for a single lap.
//
// A sample is "in corner" when both |steering| and |lateral g| clear their thresholds.
// Contiguous runs become candidate zones, short runs are dropped as steering kinks,
// and zones separated by less than the merge gap are fused (chicanes count once).

use crate::config::CornerConfig;
use crate::error::MalformedInputError;
use crate::telemetry::CleanSample;
use tracing::warn;

/// Inclusive sample-index range of one zone within a lap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneSpan {
    pub start: usize,
    pub end: usize,
}

impl ZoneSpan {
    pub fn sample_count(&self) -> usize {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CornerZone {
    pub span: ZoneSpan,
    pub start_distance: f64,
    pub apex_distance: f64,
    pub exit_distance: f64,
    pub entry_speed: f64,
    pub apex_speed: f64,
    pub exit_speed: f64,
    pub lateral_g_max: f64,
    pub steering_max: f64,
    /// equals `start_distance` when no braking event was found
    pub braking_point: f64,
    pub max_brake_pressure: f64,
    pub braked: bool,
    pub throttle_reapply_distance: Option<f64>,
    /// seconds
    pub duration: f64,
}

impl CornerZone {
    /// Minimum corner speed over entry speed.
    pub fn efficiency(&self) -> Option<f64> {
        (self.entry_speed > 0.0).then(|| self.apex_speed / self.entry_speed)
    }
}

pub fn cornering_mask(lap: &[CleanSample], cfg: &CornerConfig) -> Vec<bool> {
    lap.iter()
        .map(|s| {
            s.steering.abs() > cfg.steering_threshold
                && s.accel_lat.map_or(false, |g| g.abs() > cfg.lateral_g_threshold)
        })
        .collect()
}

pub fn candidate_spans(mask: &[bool]) -> Vec<ZoneSpan> {
    let mut spans = Vec::new();
    let mut open: Option<usize> = None;
    for (i, &on) in mask.iter().enumerate() {
        match (on, open) {
            (true, None) => open = Some(i),
            (false, Some(start)) => {
                spans.push(ZoneSpan { start, end: i - 1 });
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        spans.push(ZoneSpan { start, end: mask.len() - 1 });
    }
    spans
}

// timestamps are only trusted when every sample has one and they never go backwards
fn timestamps_usable(lap: &[CleanSample]) -> bool {
    let mut prev = f64::NEG_INFINITY;
    for s in lap {
        match s.time {
            Some(t) if t >= prev => prev = t,
            _ => return false,
        }
    }
    lap.len() > 1 && lap[lap.len() - 1].time > lap[0].time
}

/// Wall-clock length of a span; row count times the nominal interval when timestamps can't be used.
pub fn span_duration(lap: &[CleanSample], span: ZoneSpan, cfg: &CornerConfig, use_time: bool) -> f64 {
    if use_time {
        if let (Some(a), Some(b)) = (lap[span.start].time, lap[span.end].time) {
            return b - a;
        }
    }
    span.sample_count() as f64 * cfg.nominal_sample_interval
}

fn gap_is_mergeable(lap: &[CleanSample], cur: ZoneSpan, next: ZoneSpan, cfg: &CornerConfig) -> bool {
    if let (Some(a), Some(b)) = (lap[cur.end].distance, lap[next.start].distance) {
        if b >= a {
            return b - a <= cfg.merge_gap_m;
        }
    }
    next.start.saturating_sub(cur.end + 1) <= cfg.merge_gap_samples
}

/// Fuses consecutive zones whose gap is within the merge gap. Running it on its own output is a no-op.
pub fn merge_zones(lap: &[CleanSample], spans: &[ZoneSpan], cfg: &CornerConfig) -> Vec<ZoneSpan> {
    let mut merged: Vec<ZoneSpan> = Vec::with_capacity(spans.len());
    for &span in spans {
        match merged.last_mut() {
            Some(cur) if gap_is_mergeable(lap, *cur, span, cfg) => cur.end = cur.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

fn distance_at(lap: &[CleanSample], i: usize) -> Result<f64, MalformedInputError> {
    lap[i].distance.ok_or(MalformedInputError::MissingValue("distance"))
}

fn zone_metrics(
    lap: &[CleanSample],
    span: ZoneSpan,
    cfg: &CornerConfig,
    use_time: bool,
) -> Result<CornerZone, MalformedInputError> {
    let zone = &lap[span.start..=span.end];
    let mut apex = span.start;
    for (offset, s) in zone.iter().enumerate() {
        if s.speed < lap[apex].speed {
            apex = span.start + offset;
        }
    }

    // nearest braking sample before the zone, then walk back to where the brake went on
    let window_lo = span.start.saturating_sub(cfg.brake_lookback);
    let mut onset = None;
    for i in (window_lo..span.start).rev() {
        if lap[i].brake > cfg.brake_threshold {
            onset = Some(i);
            break;
        }
    }
    if let Some(mut i) = onset {
        while i > window_lo && lap[i - 1].brake > cfg.brake_threshold {
            i -= 1;
        }
        onset = Some(i);
    }

    let start_distance = distance_at(lap, span.start)?;
    let (braking_point, max_brake_pressure) = match onset {
        Some(i) => {
            let peak = lap[i..=apex].iter().map(|s| s.brake).fold(0.0, f64::max);
            (distance_at(lap, i)?, peak)
        }
        None => (start_distance, 0.0),
    };

    let throttle_reapply_distance = lap[apex + 1..]
        .iter()
        .find(|s| s.throttle.map_or(false, |t| t > cfg.throttle_reapply_pct))
        .and_then(|s| s.distance);

    Ok(CornerZone {
        span,
        start_distance,
        apex_distance: distance_at(lap, apex)?,
        exit_distance: distance_at(lap, span.end)?,
        entry_speed: lap[span.start].speed,
        apex_speed: lap[apex].speed,
        exit_speed: lap[span.end].speed,
        lateral_g_max: zone.iter().filter_map(|s| s.accel_lat).map(f64::abs).fold(0.0, f64::max),
        steering_max: zone.iter().map(|s| s.steering.abs()).fold(0.0, f64::max),
        braking_point,
        max_brake_pressure,
        braked: onset.is_some(),
        throttle_reapply_distance,
        duration: span_duration(lap, span, cfg, use_time),
    })
}

/// Ordered corner zones for one lap. Pure: same lap and thresholds give the same list.
pub fn detect_corners(lap: &[CleanSample], cfg: &CornerConfig) -> Vec<CornerZone> {
    if lap.len() < cfg.min_lap_samples {
        return Vec::new();
    }
    let use_time = timestamps_usable(lap);
    let spans: Vec<ZoneSpan> = candidate_spans(&cornering_mask(lap, cfg))
        .into_iter()
        .filter(|&span| span_duration(lap, span, cfg, use_time) >= cfg.min_corner_duration)
        .collect();

    let mut zones = Vec::new();
    let mut skipped = 0usize;
    for span in merge_zones(lap, &spans, cfg) {
        match zone_metrics(lap, span, cfg, use_time) {
            Ok(zone) => zones.push(zone),
            Err(err) => {
                skipped += 1;
                warn!(start = span.start, end = span.end, %err, "skipping corner");
            }
        }
    }
    if skipped > 0 {
        warn!(skipped, kept = zones.len(), "corners skipped in lap");
    }
    zones
}
