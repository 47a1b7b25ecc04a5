// Raw race files -> feature table -> factors -> percentiles -> model -> validation.
//
// Stage boundaries are hard barriers: factoring needs the whole feature table, percentiles
// need every driver's scores. Only telemetry extraction fans out.

use crate::config::PipelineConfig;
use crate::data::RaceData;
use crate::error::{FactorError, PipelineError, Result};
use crate::factors::{compute_factors, extract_factors, FactorAnalysis, FactorCalibration};
use crate::features::{impute, merge_features, FeatureTable};
use crate::model::FactorModel;
use crate::normalize::{normalize, PercentileTable};
use crate::output::{write_artifacts, Artifacts};
use crate::race_features::build_race_features;
use crate::source::DataSource;
use crate::telemetry::extract_race;
use crate::validation::{validate_model, ValidationReport};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Everything one run computes, before anything is written.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub features: FeatureTable,
    pub analysis: FactorAnalysis,
    pub aggregates: PercentileTable,
    pub model: FactorModel,
    pub validation: ValidationReport,
}

impl RunOutcome {
    pub fn artifacts(&self) -> Artifacts<'_> {
        Artifacts {
            features: &self.features,
            scores: &self.analysis.scores,
            aggregates: &self.aggregates,
            validation: &self.validation,
            diagnostics: &self.analysis.diagnostics,
        }
    }

    pub fn write(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        write_artifacts(dir, &self.artifacts())
    }
}

pub struct Pipeline<'a> {
    source: &'a dyn DataSource,
    config: &'a PipelineConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(source: &'a dyn DataSource, config: &'a PipelineConfig) -> Self {
        Self { source, config }
    }

    /// Any source failure here is fatal: a missing race would silently shrink the population.
    pub fn load_races(&self) -> Result<Vec<RaceData>> {
        let keys = self.source.races()?;
        if keys.is_empty() {
            return Err(PipelineError::InsufficientPopulation("no races found".into()));
        }
        let mut races = Vec::with_capacity(keys.len());
        for key in &keys {
            races.push(self.source.get_race(key)?);
        }
        info!(races = races.len(), source = self.source.name(), "race data loaded");
        Ok(races)
    }

    pub fn build_feature_table(&self, races: &[RaceData]) -> FeatureTable {
        let cfg = self.config;
        let mut tier1 = Vec::with_capacity(races.len());
        let mut telemetry = Vec::with_capacity(races.len());
        for race in races {
            let (rows, excluded) =
                build_race_features(&race.race_id, &race.results, &race.qualifying, &race.laps, &cfg.race);
            for (driver, err) in &excluded {
                warn!(race = %race.race_id, driver, %err, "driver left out of race features");
            }
            tier1.push((race.race_id.clone(), rows));
            match &race.telemetry {
                Some(file) => telemetry.push((race.race_id.clone(), extract_race(&race.race_id, file, &cfg.telemetry, &cfg.corner))),
                None => info!(race = %race.race_id, "no telemetry file; telemetry features missing for this race"),
            }
        }
        merge_features(&tier1, &telemetry)
    }

    fn check_population(&self, table: &FeatureTable) -> Result<()> {
        let needed = self.config.factor.min_observations;
        if table.rows.len() < needed {
            return Err(PipelineError::InsufficientPopulation(format!(
                "{} driver-race observations, need {}",
                table.rows.len(),
                needed
            )));
        }
        Ok(())
    }

    /// Proposes a reflection calibration from the current data. Nothing is scored.
    pub fn calibrate(&self) -> Result<FactorCalibration> {
        let races = self.load_races()?;
        let table = self.build_feature_table(&races);
        self.check_population(&table)?;
        let extraction = extract_factors(&impute(&table), &self.config.factor).map_err(population_error)?;
        let calibration = FactorCalibration::derive(&extraction, &self.config.factor);
        for entry in &calibration.factors {
            info!(factor = entry.index, name = %entry.name, reflect = entry.reflect, rationale = %entry.rationale, "proposed calibration");
        }
        Ok(calibration)
    }

    pub fn run(&self, calibration: &FactorCalibration) -> Result<RunOutcome> {
        let races = self.load_races()?;
        let features = self.build_feature_table(&races);
        self.analyze(features, calibration)
    }

    /// Everything after the feature table. Split out so callers with a table in hand can skip loading.
    pub fn analyze(&self, features: FeatureTable, calibration: &FactorCalibration) -> Result<RunOutcome> {
        let cfg = self.config;
        self.check_population(&features)?;
        let analysis = compute_factors(&features, calibration, &cfg.factor).map_err(population_error)?;
        let aggregates = normalize(&analysis.scores, &cfg.stretch);

        let with_finish = aggregates.drivers.iter().filter(|d| d.mean_finish.is_some()).count();
        if with_finish < cfg.model.min_drivers {
            return Err(PipelineError::InsufficientPopulation(format!(
                "{} drivers with a finishing position, need {}",
                with_finish, cfg.model.min_drivers
            )));
        }
        let model = FactorModel::fit(&aggregates.drivers, aggregates.factor_names.clone(), &cfg.model)?;
        let validation = validate_model(&aggregates.drivers, &aggregates.factor_names, &cfg.model)?;
        for issue in &validation.issues {
            warn!(issue = ?issue, "model validation");
        }
        info!(
            observations = features.rows.len(),
            drivers = aggregates.drivers.len(),
            status = ?validation.status,
            "run complete"
        );
        Ok(RunOutcome { features, analysis, aggregates, model, validation })
    }
}

fn population_error(err: FactorError) -> PipelineError {
    match err {
        FactorError::TooFewFeatures { .. } | FactorError::TooFewObservations { .. } => {
            PipelineError::InsufficientPopulation(err.to_string())
        }
        other => PipelineError::Factor(other),
    }
}
