use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use driver_skill::circuit_fit::{fit_score, rank_drivers_for_track};
use driver_skill::factors::N_FACTORS;
use driver_skill::output::{read_aggregates, AGGREGATES_JSON};
use driver_skill::source::{DataCache, DataSource, FallbackSource, LocalFileSource};
use driver_skill::{FactorCalibration, FactorModel, Pipeline, PipelineConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "driver_skill", about = "Driver skill factors from race timing and telemetry")]
struct Cli {
    /// JSON config; defaults are used for anything it leaves out
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Score every driver and write the artifacts
    Run {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        calibration: PathBuf,
    },
    /// Propose a factor reflection table from the current data
    Calibrate {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// replace an existing calibration file
        #[arg(long)]
        force: bool,
    },
    /// Predict a driver's finish, optionally with adjusted percentiles
    Predict {
        /// directory holding a previous run's artifacts
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        driver: u32,
        /// percentile change per factor, e.g. `--adjust Consistency=5`
        #[arg(long, value_parser = parse_adjustment)]
        adjust: Vec<(String, f64)>,
        /// also report circuit fit for a track from the config
        #[arg(long)]
        track: Option<String>,
    },
}

fn parse_adjustment(s: &str) -> Result<(String, f64), String> {
    let (name, delta) = s.split_once('=').ok_or_else(|| format!("expected FACTOR=DELTA, got {:?}", s))?;
    let delta: f64 = delta.trim().parse().map_err(|e| format!("bad delta in {:?}: {}", s, e))?;
    Ok((name.trim().to_string(), delta))
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(p) => PipelineConfig::load(p).with_context(|| format!("loading config {}", p.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn data_source(root: &Path) -> FallbackSource {
    let local: Arc<dyn DataSource> = Arc::new(LocalFileSource::new(root));
    FallbackSource::new(vec![local], Some(Arc::new(DataCache::new())))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run { data, out, calibration } => {
            let cal = FactorCalibration::load(&calibration)
                .with_context(|| format!("run `calibrate` first to create {}", calibration.display()))?;
            let source = data_source(&data);
            let outcome = Pipeline::new(&source, &config).run(&cal).context("pipeline run failed")?;
            let written = outcome.write(&out).with_context(|| format!("writing artifacts to {}", out.display()))?;
            for path in &written {
                info!(path = %path.display(), "wrote");
            }
            println!("{}", serde_json::to_string_pretty(&outcome.validation)?);
        }
        Command::Calibrate { data, output, force } => {
            if output.exists() && !force {
                bail!("{} exists; pass --force to replace it", output.display());
            }
            let source = data_source(&data);
            let cal = Pipeline::new(&source, &config).calibrate().context("calibration failed")?;
            cal.save(&output)?;
            println!("wrote proposed calibration to {}; review before using it", output.display());
        }
        Command::Predict { out, driver, adjust, track } => {
            let table = read_aggregates(&out.join(AGGREGATES_JSON))?;
            let profile = table.get(driver).with_context(|| format!("driver {} not in aggregates", driver))?;
            let model = FactorModel::fit(&table.drivers, table.factor_names.clone(), &config.model)?;

            let mut deltas = [0.0; N_FACTORS];
            for (name, delta) in &adjust {
                let k = table
                    .factor_names
                    .iter()
                    .position(|f| f.eq_ignore_ascii_case(name))
                    .with_context(|| format!("unknown factor {:?}; known: {:?}", name, table.factor_names))?;
                deltas[k] += delta;
            }
            let result = if adjust.is_empty() { model.predict(profile) } else { model.predict_adjusted(profile, deltas)? };
            println!("{}", serde_json::to_string_pretty(&result)?);

            if let Some(track) = track {
                let demand = config.tracks.get(&track).with_context(|| format!("no demand profile for track {:?}", track))?;
                let ranking = rank_drivers_for_track(&table, demand);
                let place = ranking.iter().position(|f| f.driver == driver).map_or(0, |i| i + 1);
                println!(
                    "circuit fit at {}: {:.1} (rank {} of {})",
                    track,
                    fit_score(profile, demand),
                    place,
                    ranking.len()
                );
            }
        }
    }
    Ok(())
}
