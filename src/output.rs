// Run artifacts. Everything is written into a staging directory first and only renamed into
// place once every file exists, so a failed run leaves the previous output untouched.
//
// The swap itself is one rename per file. A reader polling the directory while it runs can
// see new and old files side by side; if a rename fails, the files already swapped are
// taken back and the previous set is restored.

use crate::error::PipelineError;
use crate::factors::{FactorDiagnostics, FactorScoreTable, N_FACTORS};
use crate::features::FeatureTable;
use crate::normalize::{DriverAggregateProfile, PercentileEntry, PercentileTable};
use crate::validation::ValidationReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const FEATURES_CSV: &str = "driver_race_features.csv";
pub const SCORES_CSV: &str = "factor_scores.csv";
pub const AGGREGATES_JSON: &str = "driver_aggregates.json";
pub const VALIDATION_JSON: &str = "validation_report.json";
pub const DIAGNOSTICS_JSON: &str = "factor_diagnostics.json";
const LOCK_FILE: &str = ".lock";
const PREVIOUS_DIR: &str = ".previous";

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
    move |source| PipelineError::Output { path: path.to_path_buf(), source }
}

fn csv_err(path: &Path) -> impl FnOnce(csv::Error) -> PipelineError + '_ {
    move |e| PipelineError::Serialize(format!("{}: {}", path.display(), e))
}

/// Held for the duration of a run. A second run against the same directory fails instead of
/// interleaving writes.
#[derive(Debug)]
pub struct OutputLock {
    path: PathBuf,
}

impl OutputLock {
    pub fn acquire(dir: &Path) -> Result<Self, PipelineError> {
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        let path = dir.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(PipelineError::Locked(path)),
            Err(e) => Err(PipelineError::Output { path, source: e }),
        }
    }
}

impl Drop for OutputLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "could not remove output lock");
        }
    }
}

/// Files written so far in this run. Dropping without `commit` throws them away.
#[derive(Debug)]
pub struct StagedOutput<'a> {
    dir: PathBuf,
    staging: PathBuf,
    files: Vec<String>,
    committed: bool,
    _lock: &'a OutputLock,
}

impl<'a> StagedOutput<'a> {
    pub fn new(dir: &Path, lock: &'a OutputLock) -> Result<Self, PipelineError> {
        let staging = dir.join(format!(".staging-{}", std::process::id()));
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(io_err(&staging))?;
        }
        fs::create_dir_all(&staging).map_err(io_err(&staging))?;
        Ok(Self { dir: dir.to_path_buf(), staging, files: Vec::new(), committed: false, _lock: lock })
    }

    fn create(&mut self, name: &str) -> Result<(PathBuf, File), PipelineError> {
        let path = self.staging.join(name);
        let file = File::create(&path).map_err(io_err(&path))?;
        self.files.push(name.to_string());
        Ok((path, file))
    }

    pub fn write_json<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), PipelineError> {
        let (path, file) = self.create(name)?;
        let mut w = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut w, value)
            .map_err(|e| PipelineError::Serialize(format!("{}: {}", path.display(), e)))?;
        w.flush().map_err(io_err(&path))
    }

    pub fn write_csv(&mut self, name: &str, header: &[String], rows: &[Vec<String>]) -> Result<(), PipelineError> {
        let (path, file) = self.create(name)?;
        let mut wtr = csv::Writer::from_writer(BufWriter::new(file));
        wtr.write_record(header).map_err(csv_err(&path))?;
        for row in rows {
            wtr.write_record(row).map_err(csv_err(&path))?;
        }
        wtr.flush().map_err(io_err(&path))
    }

    /// Moves every staged file over its final name. On failure the previous files are put back.
    pub fn commit(mut self) -> Result<Vec<PathBuf>, PipelineError> {
        let previous = self.staging.join(PREVIOUS_DIR);
        fs::create_dir_all(&previous).map_err(io_err(&previous))?;
        let (mut aside, mut placed) = (Vec::new(), Vec::new());
        if let Err(err) = self.swap_in(&previous, &mut aside, &mut placed) {
            self.roll_back(&previous, &aside, &placed);
            return Err(err);
        }
        self.committed = true;
        fs::remove_dir_all(&self.staging).map_err(io_err(&self.staging))?;
        Ok(self.files.iter().map(|name| self.dir.join(name)).collect())
    }

    fn swap_in(&self, previous: &Path, aside: &mut Vec<String>, placed: &mut Vec<String>) -> Result<(), PipelineError> {
        for name in &self.files {
            let target = self.dir.join(name);
            if target.exists() {
                fs::rename(&target, previous.join(name)).map_err(io_err(&target))?;
                aside.push(name.clone());
            }
            fs::rename(self.staging.join(name), &target).map_err(io_err(&target))?;
            placed.push(name.clone());
        }
        Ok(())
    }

    fn roll_back(&self, previous: &Path, aside: &[String], placed: &[String]) {
        for name in placed {
            if let Err(err) = fs::remove_file(self.dir.join(name)) {
                warn!(file = %name, %err, "could not withdraw partially committed artifact");
            }
        }
        for name in aside {
            if let Err(err) = fs::rename(previous.join(name), self.dir.join(name)) {
                warn!(file = %name, %err, "could not restore previous artifact");
            }
        }
        warn!(restored = aside.len(), "artifact commit failed; previous output restored");
    }
}

impl Drop for StagedOutput<'_> {
    fn drop(&mut self) {
        if !self.committed && self.staging.exists() {
            let _ = fs::remove_dir_all(&self.staging);
        }
    }
}

fn cell(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}

pub fn feature_rows(table: &FeatureTable) -> (Vec<String>, Vec<Vec<String>>) {
    let mut header = vec!["race_id".to_string(), "driver".to_string(), "finish_position".to_string()];
    header.extend(table.names.iter().cloned());
    let rows = table
        .rows
        .iter()
        .map(|r| {
            let mut out = vec![r.race_id.clone(), r.driver.to_string(), r.finish_position.map(|p| p.to_string()).unwrap_or_default()];
            out.extend(r.values.iter().map(|v| cell(*v)));
            out
        })
        .collect();
    (header, rows)
}

pub fn score_rows(table: &FactorScoreTable) -> (Vec<String>, Vec<Vec<String>>) {
    let mut header = vec!["race_id".to_string(), "driver".to_string(), "finish_position".to_string()];
    header.extend(table.factor_names.iter().cloned());
    let rows = table
        .rows
        .iter()
        .map(|r| {
            let mut out = vec![r.race_id.clone(), r.driver.to_string(), r.finish_position.map(|p| p.to_string()).unwrap_or_default()];
            out.extend(r.scores.iter().map(|s| s.to_string()));
            out
        })
        .collect();
    (header, rows)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorRecord {
    pub factor: String,
    pub score: f64,
    pub z_score: f64,
    pub percentile: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub races: usize,
    pub mean_finish: Option<f64>,
    /// in factor order
    pub factors: Vec<FactorRecord>,
}

/// Driver-number keyed view of the aggregates, as written to `driver_aggregates.json`.
pub fn aggregate_records(table: &PercentileTable) -> BTreeMap<String, AggregateRecord> {
    table
        .drivers
        .iter()
        .map(|d| {
            let factors = (0..N_FACTORS)
                .map(|f| FactorRecord {
                    factor: table.factor_names[f].clone(),
                    score: d.factors[f].score,
                    z_score: d.factors[f].z_score,
                    percentile: d.factors[f].percentile,
                })
                .collect();
            (d.driver.to_string(), AggregateRecord { races: d.races, mean_finish: d.mean_finish, factors })
        })
        .collect()
}

pub fn read_aggregates(path: &Path) -> Result<PercentileTable, PipelineError> {
    let file = File::open(path).map_err(io_err(path))?;
    let records: BTreeMap<String, AggregateRecord> =
        serde_json::from_reader(file).map_err(|e| PipelineError::Serialize(format!("{}: {}", path.display(), e)))?;
    let bad = |msg: String| PipelineError::Serialize(format!("{}: {}", path.display(), msg));

    let mut factor_names: Option<[String; N_FACTORS]> = None;
    let mut drivers = Vec::with_capacity(records.len());
    for (key, rec) in records {
        let driver: u32 = key.parse().map_err(|_| bad(format!("driver key {:?} is not a number", key)))?;
        if rec.factors.len() != N_FACTORS {
            return Err(bad(format!("driver {} has {} factors", driver, rec.factors.len())));
        }
        let names: [String; N_FACTORS] = std::array::from_fn(|f| rec.factors[f].factor.clone());
        match &factor_names {
            Some(existing) if *existing != names => return Err(bad(format!("driver {} lists factors in a different order", driver))),
            Some(_) => {}
            None => factor_names = Some(names),
        }
        drivers.push(DriverAggregateProfile {
            driver,
            races: rec.races,
            mean_finish: rec.mean_finish,
            factors: std::array::from_fn(|f| PercentileEntry {
                score: rec.factors[f].score,
                z_score: rec.factors[f].z_score,
                percentile: rec.factors[f].percentile,
            }),
        });
    }
    drivers.sort_by_key(|d| d.driver);
    let factor_names = factor_names.ok_or_else(|| bad("no drivers".into()))?;
    Ok(PercentileTable { factor_names, drivers })
}

/// Everything one run produces.
pub struct Artifacts<'a> {
    pub features: &'a FeatureTable,
    pub scores: &'a FactorScoreTable,
    pub aggregates: &'a PercentileTable,
    pub validation: &'a ValidationReport,
    pub diagnostics: &'a FactorDiagnostics,
}

pub fn write_artifacts(dir: &Path, artifacts: &Artifacts<'_>) -> Result<Vec<PathBuf>, PipelineError> {
    let lock = OutputLock::acquire(dir)?;
    let mut staged = StagedOutput::new(dir, &lock)?;

    let (header, rows) = feature_rows(artifacts.features);
    staged.write_csv(FEATURES_CSV, &header, &rows)?;
    let (header, rows) = score_rows(artifacts.scores);
    staged.write_csv(SCORES_CSV, &header, &rows)?;
    staged.write_json(AGGREGATES_JSON, &aggregate_records(artifacts.aggregates))?;
    staged.write_json(VALIDATION_JSON, artifacts.validation)?;
    staged.write_json(DIAGNOSTICS_JSON, artifacts.diagnostics)?;

    let written = staged.commit()?;
    info!(dir = %dir.display(), files = written.len(), "artifacts written");
    Ok(written)
}
