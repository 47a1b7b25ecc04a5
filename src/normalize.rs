// Percentile ranks over the driver population, the display stretch, and per-driver aggregates.
//
// Percentiles are population-relative: adding or removing one driver means recomputing all of them.

use crate::config::StretchConfig;
use crate::factors::{FactorScoreTable, N_FACTORS};
use crate::stats::{mean, population_std, sample_std};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Share of the population with a strictly lower value, x100. A flat population sits at 50.
pub fn percentile_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n == 0 {
        return Vec::new();
    }
    let flat = values.iter().all(|v| (v - values[0]).abs() < 1e-12);
    if flat {
        return vec![50.0; n];
    }
    values
        .iter()
        .map(|v| values.iter().filter(|o| **o < *v).count() as f64 / n as f64 * 100.0)
        .collect()
}

/// Linear min-max rescale onto [out_min, out_max] when the percentiles are bunched up.
/// Monotonic, so it never changes who is ahead of whom.
pub fn stretch(percentiles: &[f64], cfg: &StretchConfig) -> Vec<f64> {
    let (lo, hi) = percentiles
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let range = hi - lo;
    if percentiles.is_empty() || range <= 1e-12 {
        return percentiles.to_vec();
    }
    let spread = population_std(percentiles).unwrap_or(0.0);
    if spread >= cfg.target_std && range >= cfg.target_range {
        return percentiles.to_vec();
    }
    percentiles
        .iter()
        .map(|p| cfg.out_min + (p - lo) / range * (cfg.out_max - cfg.out_min))
        .collect()
}

pub fn normalize_scores(raw: &[f64], cfg: &StretchConfig) -> Vec<f64> {
    stretch(&percentile_ranks(raw), cfg)
}

fn z_scores(values: &[f64]) -> Vec<f64> {
    let m = mean(values).unwrap_or(0.0);
    match sample_std(values) {
        Some(sd) if sd > f64::EPSILON => values.iter().map(|v| (v - m) / sd).collect(),
        _ => vec![0.0; values.len()],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileEntry {
    /// unweighted mean of the driver's reflected factor scores
    pub score: f64,
    /// `score` standardised across the driver population
    pub z_score: f64,
    pub percentile: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverAggregateProfile {
    pub driver: u32,
    pub races: usize,
    pub mean_finish: Option<f64>,
    pub factors: [PercentileEntry; N_FACTORS],
}

impl DriverAggregateProfile {
    pub fn z_scores(&self) -> [f64; N_FACTORS] {
        std::array::from_fn(|f| self.factors[f].z_score)
    }

    pub fn percentiles(&self) -> [f64; N_FACTORS] {
        std::array::from_fn(|f| self.factors[f].percentile)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PercentileTable {
    pub factor_names: [String; N_FACTORS],
    /// ordered by driver number
    pub drivers: Vec<DriverAggregateProfile>,
}

impl PercentileTable {
    pub fn get(&self, driver: u32) -> Option<&DriverAggregateProfile> {
        self.drivers.iter().find(|d| d.driver == driver)
    }
}

/// Averages each driver's races, then ranks every factor across the whole driver population.
pub fn normalize(scores: &FactorScoreTable, cfg: &StretchConfig) -> PercentileTable {
    let mut per_driver: BTreeMap<u32, (Vec<[f64; N_FACTORS]>, Vec<f64>)> = BTreeMap::new();
    for row in &scores.rows {
        let entry = per_driver.entry(row.driver).or_default();
        entry.0.push(row.scores);
        if let Some(p) = row.finish_position {
            entry.1.push(p as f64);
        }
    }

    let drivers: Vec<u32> = per_driver.keys().copied().collect();
    let means: Vec<[f64; N_FACTORS]> = per_driver
        .values()
        .map(|(races, _)| std::array::from_fn(|f| races.iter().map(|r| r[f]).sum::<f64>() / races.len() as f64))
        .collect();

    let mut percentiles = Vec::with_capacity(N_FACTORS);
    let mut zs = Vec::with_capacity(N_FACTORS);
    for f in 0..N_FACTORS {
        let column: Vec<f64> = means.iter().map(|m| m[f]).collect();
        percentiles.push(normalize_scores(&column, cfg));
        zs.push(z_scores(&column));
    }

    let profiles = drivers
        .iter()
        .enumerate()
        .map(|(i, &driver)| {
            let (races, finishes) = &per_driver[&driver];
            DriverAggregateProfile {
                driver,
                races: races.len(),
                mean_finish: mean(finishes),
                factors: std::array::from_fn(|f| PercentileEntry {
                    score: means[i][f],
                    z_score: zs[f][i],
                    percentile: percentiles[f][i],
                }),
            }
        })
        .collect();

    PercentileTable { factor_names: scores.factor_names.clone(), drivers: profiles }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::FactorScoreRow;
    use proptest::prelude::*;

    fn table(rows: Vec<(u32, [f64; 4], Option<u32>)>) -> FactorScoreTable {
        let names = ["Speed", "Consistency", "Racecraft", "Tire Management"].map(String::from);
        let score_rows = rows
            .into_iter()
            .enumerate()
            .map(|(i, (driver, scores, finish))| FactorScoreRow {
                race_id: format!("r{}", i),
                driver,
                finish_position: finish,
                scores,
            })
            .collect();
        FactorScoreTable::from_rows(names, score_rows)
    }

    #[test]
    fn strict_lower_percentiles() {
        assert_eq!(percentile_ranks(&[3.0, 1.0, 2.0, 2.0]), vec![75.0, 0.0, 25.0, 25.0]);
    }

    #[test]
    fn zero_variance_maps_to_midpoint() {
        let p = normalize_scores(&[0.4; 6], &StretchConfig::default());
        assert_eq!(p, vec![50.0; 6]);
    }

    #[test]
    fn compressed_distribution_is_stretched() {
        // three-driver field: 0, 33.3, 66.7 -> range 66.7 < 80
        let p = normalize_scores(&[1.0, 2.0, 3.0], &StretchConfig::default());
        assert!((p[0] - 5.0).abs() < 1e-9);
        assert!((p[1] - 50.0).abs() < 1e-9);
        assert!((p[2] - 95.0).abs() < 1e-9);
    }

    #[test]
    fn spread_distribution_is_left_alone() {
        let raw: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let p = normalize_scores(&raw, &StretchConfig::default());
        assert_eq!(p, percentile_ranks(&raw));
    }

    #[test]
    fn aggregates_average_races_unweighted() {
        let t = table(vec![
            (7, [1.0, 0.0, 0.0, 0.0], Some(1)),
            (7, [3.0, 0.0, 0.0, 0.0], Some(3)),
            (9, [0.0, 0.0, 0.0, 0.0], Some(10)),
            (11, [-1.0, 0.0, 0.0, 0.0], None),
        ]);
        let pt = normalize(&t, &StretchConfig::default());
        let d7 = pt.get(7).unwrap();
        assert_eq!(d7.races, 2);
        assert_eq!(d7.factors[0].score, 2.0);
        assert_eq!(d7.mean_finish, Some(2.0));
        assert_eq!(pt.get(11).unwrap().mean_finish, None);
        assert!(d7.factors[0].percentile > pt.get(9).unwrap().factors[0].percentile);
        // flat factor
        assert_eq!(d7.factors[1].percentile, 50.0);
        assert_eq!(d7.factors[1].z_score, 0.0);
        assert!(d7.factors[0].z_score > 0.0);
    }

    proptest! {
        #[test]
        fn percentiles_are_bounded_and_order_preserving(raw in prop::collection::vec(-50.0f64..50.0, 1..40)) {
            let cfg = StretchConfig::default();
            let before = percentile_ranks(&raw);
            let after = stretch(&before, &cfg);
            for i in 0..raw.len() {
                prop_assert!((0.0..=100.0).contains(&before[i]));
                prop_assert!((0.0..=100.0).contains(&after[i]));
                for j in 0..raw.len() {
                    if raw[i] > raw[j] {
                        prop_assert!(before[i] >= before[j]);
                        prop_assert!(after[i] >= after[j]);
                    }
                    if before[i] > before[j] {
                        prop_assert!(after[i] > after[j]);
                    }
                }
            }
        }
    }
}
