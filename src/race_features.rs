// Tier-1 features from the timing feed: qualifying, lap analysis and results.
//
// Lap-time features only look at green-flag, non-pit laps; caution laps are slow and
// bunched and would swamp the consistency measures. Racecraft uses every lap.

use crate::config::RaceFeatureConfig;
use crate::data::{LapRow, QualifyingRow, ResultRow};
use crate::error::InsufficientDataError;
use crate::stats::{coefficient_of_variation, mean, sort_floats};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RaceFeatures {
    /// seconds, informational
    pub best_lap_s: Option<f64>,
    /// seconds, informational
    pub top10_avg_s: Option<f64>,
    pub qualifying_gap_pct: Option<f64>,
    pub best_lap_gap_pct: Option<f64>,
    pub top10_avg_gap_pct: Option<f64>,
    pub lap_time_cv: Option<f64>,
    pub sector_cv: Option<f64>,
    pub degradation_ratio: Option<f64>,
    pub positions_gained: Option<f64>,
    pub position_changes: Option<f64>,
}

impl RaceFeatures {
    pub const NAMES: [&'static str; 8] = [
        "qualifying_gap_pct",
        "best_lap_gap_pct",
        "top10_avg_gap_pct",
        "lap_time_cv",
        "sector_cv",
        "degradation_ratio",
        "positions_gained",
        "position_changes",
    ];

    pub fn values(&self) -> [Option<f64>; 8] {
        [
            self.qualifying_gap_pct,
            self.best_lap_gap_pct,
            self.top10_avg_gap_pct,
            self.lap_time_cv,
            self.sector_cv,
            self.degradation_ratio,
            self.positions_gained,
            self.position_changes,
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RaceDriverRow {
    pub number: u32,
    pub finish_position: Option<u32>,
    pub green_laps: usize,
    pub features: RaceFeatures,
}

fn is_green(lap: &LapRow, cfg: &RaceFeatureConfig) -> bool {
    lap.flag.eq_ignore_ascii_case(&cfg.green_flag) && !lap.pitted && lap.lap_time.is_some()
}

fn fastest_mean(times: &[f64], window: usize) -> Option<f64> {
    let mut sorted = times.to_vec();
    sort_floats(&mut sorted);
    let k = window.min(sorted.len());
    mean(&sorted[..k])
}

fn sector_consistency(green: &[&LapRow], min_laps: usize) -> Option<f64> {
    let mut cvs = Vec::new();
    for sector in 0..3 {
        let times: Vec<f64> = green.iter().filter_map(|l| l.sectors[sector]).filter(|t| *t > 0.0).collect();
        if times.len() >= min_laps {
            if let Some(cv) = coefficient_of_variation(&times) {
                cvs.push(cv);
            }
        }
    }
    mean(&cvs)
}

// late-third over early-third pace for every stint long enough to show a trend
fn degradation(laps: &[&LapRow], cfg: &RaceFeatureConfig) -> Option<f64> {
    let mut ratios = Vec::new();
    let mut stint: Vec<f64> = Vec::new();
    let mut close = |stint: &mut Vec<f64>| {
        if stint.len() >= cfg.min_stint_laps {
            let third = stint.len() / 3;
            if let (Some(early), Some(late)) = (mean(&stint[..third]), mean(&stint[stint.len() - third..])) {
                if early > 0.0 {
                    ratios.push(late / early);
                }
            }
        }
        stint.clear();
    };
    for lap in laps {
        if is_green(lap, cfg) {
            if let Some(t) = lap.lap_time {
                stint.push(t);
            }
        }
        if lap.pitted {
            close(&mut stint);
        }
    }
    close(&mut stint);
    mean(&ratios)
}

// running order per lap from cumulative elapsed time
fn running_positions(laps: &[LapRow]) -> HashMap<u32, BTreeMap<u32, u32>> {
    let mut by_lap: BTreeMap<u32, Vec<(u32, f64)>> = BTreeMap::new();
    for l in laps {
        if let Some(e) = l.elapsed {
            by_lap.entry(l.lap_number).or_default().push((l.number, e));
        }
    }
    let mut out: HashMap<u32, BTreeMap<u32, u32>> = HashMap::new();
    for (lap, mut entries) in by_lap {
        entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
        for (rank, (number, _)) in entries.into_iter().enumerate() {
            out.entry(number).or_default().insert(lap, rank as u32 + 1);
        }
    }
    out
}

fn position_changes(grid: Option<u32>, running: Option<&BTreeMap<u32, u32>>) -> Option<f64> {
    let mut sequence: Vec<u32> = grid.into_iter().collect();
    if let Some(r) = running {
        sequence.extend(r.values().copied());
    }
    if sequence.len() < 2 {
        return None;
    }
    Some(sequence.windows(2).filter(|w| w[0] != w[1]).count() as f64)
}

/// One row per driver with at least `min_green_laps` green laps. Drivers below that are
/// reported in the second list and left out of the table.
pub fn build_race_features(
    race_id: &str,
    results: &[ResultRow],
    qualifying: &[QualifyingRow],
    laps: &[LapRow],
    cfg: &RaceFeatureConfig,
) -> (Vec<RaceDriverRow>, Vec<(u32, InsufficientDataError)>) {
    let mut per_driver: BTreeMap<u32, Vec<&LapRow>> = BTreeMap::new();
    for l in laps {
        per_driver.entry(l.number).or_default().push(l);
    }
    for driver_laps in per_driver.values_mut() {
        driver_laps.sort_by_key(|l| l.lap_number);
    }

    let finish: HashMap<u32, u32> = results.iter().map(|r| (r.number, r.position)).collect();
    let grid: HashMap<u32, u32> = qualifying.iter().filter_map(|q| Some((q.number, q.position?))).collect();
    let qual_best: HashMap<u32, f64> = qualifying.iter().filter_map(|q| Some((q.number, q.best_lap?))).collect();
    let pole = qual_best.values().copied().fold(f64::INFINITY, f64::min);
    let running = running_positions(laps);

    let mut rows = Vec::new();
    let mut excluded = Vec::new();
    for (&number, driver_laps) in &per_driver {
        let green: Vec<&LapRow> = driver_laps.iter().copied().filter(|l| is_green(l, cfg)).collect();
        if green.len() < cfg.min_green_laps {
            excluded.push((number, InsufficientDataError::new("green-flag laps", cfg.min_green_laps, green.len())));
            continue;
        }
        let times: Vec<f64> = green.iter().filter_map(|l| l.lap_time).collect();
        let grid_pos = grid.get(&number).copied();
        let finish_pos = finish.get(&number).copied();
        let features = RaceFeatures {
            best_lap_s: times.iter().copied().reduce(f64::min),
            top10_avg_s: fastest_mean(&times, cfg.fastest_lap_window),
            qualifying_gap_pct: qual_best
                .get(&number)
                .filter(|_| pole.is_finite() && pole > 0.0)
                .map(|b| (b - pole) / pole * 100.0),
            best_lap_gap_pct: None,
            top10_avg_gap_pct: None,
            lap_time_cv: coefficient_of_variation(&times),
            sector_cv: sector_consistency(&green, cfg.min_green_laps),
            degradation_ratio: degradation(driver_laps, cfg),
            positions_gained: match (grid_pos, finish_pos) {
                (Some(g), Some(f)) => Some(g as f64 - f as f64),
                _ => None,
            },
            position_changes: position_changes(grid_pos, running.get(&number)),
        };
        rows.push(RaceDriverRow { number, finish_position: finish_pos, green_laps: green.len(), features });
    }

    // classified but never timed: same treatment as a driver short of green laps
    for r in results.iter().filter(|r| !per_driver.contains_key(&r.number)) {
        excluded.push((r.number, InsufficientDataError::new("green-flag laps", cfg.min_green_laps, 0)));
    }

    // pace relative to the field so different circuits are comparable
    let field_best = rows.iter().filter_map(|r| r.features.best_lap_s).fold(f64::INFINITY, f64::min);
    let field_top10 = rows.iter().filter_map(|r| r.features.top10_avg_s).fold(f64::INFINITY, f64::min);
    for row in rows.iter_mut() {
        let f = &mut row.features;
        if field_best.is_finite() && field_best > 0.0 {
            f.best_lap_gap_pct = f.best_lap_s.map(|b| (b - field_best) / field_best * 100.0);
        }
        if field_top10.is_finite() && field_top10 > 0.0 {
            f.top10_avg_gap_pct = f.top10_avg_s.map(|t| (t - field_top10) / field_top10 * 100.0);
        }
    }
    debug!(race = race_id, drivers = rows.len(), excluded = excluded.len(), "race features built");
    (rows, excluded)
}
