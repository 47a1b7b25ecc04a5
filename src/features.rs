// The merged driver-race feature table: Tier-1 timing features plus telemetry features,
// one row per (race, driver), and the median imputation that feeds factor analysis.

use crate::error::FeatureError;
use crate::race_features::{RaceDriverRow, RaceFeatures};
use crate::stats::median;
use crate::telemetry::TelemetryFeatures;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FactorCategory {
    Speed,
    Consistency,
    Racecraft,
    TireManagement,
}

impl FactorCategory {
    pub const ALL: [FactorCategory; 4] =
        [FactorCategory::Speed, FactorCategory::Consistency, FactorCategory::Racecraft, FactorCategory::TireManagement];

    pub fn label(&self) -> &'static str {
        match self {
            FactorCategory::Speed => "Speed",
            FactorCategory::Consistency => "Consistency",
            FactorCategory::Racecraft => "Racecraft",
            FactorCategory::TireManagement => "Tire Management",
        }
    }
}

impl fmt::Display for FactorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureSpec {
    pub name: &'static str,
    pub category: FactorCategory,
    pub higher_is_better: bool,
}

const fn entry(name: &'static str, category: FactorCategory, higher_is_better: bool) -> FeatureSpec {
    FeatureSpec { name, category, higher_is_better }
}

/// Every feature the pipeline knows, in table column order.
pub const CATALOG: [FeatureSpec; 15] = [
    entry("qualifying_gap_pct", FactorCategory::Speed, false),
    entry("best_lap_gap_pct", FactorCategory::Speed, false),
    entry("top10_avg_gap_pct", FactorCategory::Speed, false),
    entry("lap_time_cv", FactorCategory::Consistency, false),
    entry("sector_cv", FactorCategory::Consistency, false),
    entry("degradation_ratio", FactorCategory::TireManagement, false),
    entry("positions_gained", FactorCategory::Racecraft, true),
    entry("position_changes", FactorCategory::Racecraft, true),
    entry("throttle_smoothness", FactorCategory::TireManagement, true),
    entry("steering_smoothness", FactorCategory::TireManagement, true),
    entry("braking_consistency", FactorCategory::Consistency, true),
    entry("corner_efficiency", FactorCategory::Speed, true),
    entry("lateral_g_utilization", FactorCategory::Speed, true),
    entry("acceleration_efficiency", FactorCategory::Speed, true),
    entry("straight_speed_consistency", FactorCategory::Consistency, true),
];

pub fn feature_spec(name: &str) -> Option<&'static FeatureSpec> {
    CATALOG.iter().find(|s| s.name == name)
}

pub fn catalog_names() -> Vec<String> {
    CATALOG.iter().map(|s| s.name.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverRaceFeatureVector {
    pub race_id: String,
    pub driver: u32,
    pub finish_position: Option<u32>,
    /// aligned with the table's column names; None = missing
    pub values: Vec<Option<f64>>,
}

impl DriverRaceFeatureVector {
    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    pub names: Vec<String>,
    pub rows: Vec<DriverRaceFeatureVector>,
}

impl FeatureTable {
    pub fn new(names: Vec<String>) -> Self {
        Self { names, rows: Vec::new() }
    }

    /// Rejects rows whose width doesn't match the columns, and duplicate (race, driver) keys.
    pub fn push(&mut self, row: DriverRaceFeatureVector) -> Result<(), FeatureError> {
        if row.values.len() != self.names.len() {
            return Err(FeatureError::Width {
                race: row.race_id,
                driver: row.driver,
                expected: self.names.len(),
                got: row.values.len(),
            });
        }
        if self.rows.iter().any(|r| r.race_id == row.race_id && r.driver == row.driver) {
            return Err(FeatureError::Duplicate { race: row.race_id, driver: row.driver });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn sort(&mut self) {
        self.rows.sort_by(|a, b| a.race_id.cmp(&b.race_id).then(a.driver.cmp(&b.driver)));
    }

    pub fn column(&self, idx: usize) -> Vec<Option<f64>> {
        self.rows.iter().map(|r| r.values[idx]).collect()
    }
}

/// Joins Tier-1 rows with telemetry rows on (race, driver). Tier-1 decides which
/// observations exist; telemetry without a Tier-1 row is ignored.
pub fn merge_features(
    race_rows: &[(String, Vec<RaceDriverRow>)],
    telemetry: &[(String, Vec<(u32, TelemetryFeatures)>)],
) -> FeatureTable {
    let tele: HashMap<(&str, u32), &TelemetryFeatures> = telemetry
        .iter()
        .flat_map(|(race, rows)| rows.iter().map(move |(driver, f)| ((race.as_str(), *driver), f)))
        .collect();

    debug_assert_eq!(RaceFeatures::NAMES.len() + TelemetryFeatures::NAMES.len(), CATALOG.len());
    let mut table = FeatureTable::new(catalog_names());
    let mut dropped = 0usize;
    for (race, rows) in race_rows {
        for row in rows {
            let tf = tele.get(&(race.as_str(), row.number)).copied().copied().unwrap_or_default();
            let mut values: Vec<Option<f64>> = row.features.values().to_vec();
            values.extend(tf.values());
            let vector = DriverRaceFeatureVector {
                race_id: race.clone(),
                driver: row.number,
                finish_position: row.finish_position,
                values,
            };
            if vector.is_empty() {
                dropped += 1;
                continue;
            }
            if let Err(err) = table.push(vector) {
                warn!(%err, "feature row rejected");
            }
        }
    }
    if dropped > 0 {
        info!(dropped, "observations with no usable feature dropped");
    }
    table.sort();
    table
}

/// Complete numeric matrix ready for factor extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct ImputedTable {
    pub names: Vec<String>,
    pub keys: Vec<(String, u32)>,
    pub finish_positions: Vec<Option<u32>>,
    /// row-major, rows x names
    pub matrix: Vec<Vec<f64>>,
    pub dropped_columns: Vec<String>,
    pub imputed_cells: usize,
}

/// Fills gaps with the column median. Columns missing everywhere, or constant, carry
/// no information and are dropped.
pub fn impute(table: &FeatureTable) -> ImputedTable {
    let mut keep = Vec::new();
    let mut medians = BTreeMap::new();
    let mut dropped_columns = Vec::new();
    for (idx, name) in table.names.iter().enumerate() {
        let present: Vec<f64> = table.column(idx).into_iter().flatten().collect();
        let constant = present.windows(2).all(|w| (w[0] - w[1]).abs() < 1e-12);
        match median(&present) {
            Some(m) if !constant => {
                keep.push(idx);
                medians.insert(idx, m);
            }
            _ => {
                warn!(feature = %name, observed = present.len(), "feature column dropped before factoring");
                dropped_columns.push(name.clone());
            }
        }
    }

    let mut imputed_cells = 0usize;
    let matrix = table
        .rows
        .iter()
        .map(|row| {
            keep.iter()
                .map(|&idx| {
                    row.values[idx].unwrap_or_else(|| {
                        imputed_cells += 1;
                        medians[&idx]
                    })
                })
                .collect()
        })
        .collect();

    ImputedTable {
        names: keep.iter().map(|&i| table.names[i].clone()).collect(),
        keys: table.rows.iter().map(|r| (r.race_id.clone(), r.driver)).collect(),
        finish_positions: table.rows.iter().map(|r| r.finish_position).collect(),
        matrix,
        dropped_columns,
        imputed_cells,
    }
}
