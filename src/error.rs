use std::path::PathBuf;
use thiserror::Error;

// not enough laps / corners / samples for one feature or one observation.
// callers turn this into a missing value, never into a zero.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("insufficient data for {what}: need {needed}, got {got}")]
pub struct InsufficientDataError {
    pub what: String,
    pub needed: usize,
    pub got: usize,
}

impl InsufficientDataError {
    pub fn new(what: impl Into<String>, needed: usize, got: usize) -> Self {
        Self { what: what.into(), needed, got }
    }
}

// a value or row that could not be parsed. recovered locally as a missing value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MalformedInputError {
    #[error("unparseable time string {0:?}")]
    TimeString(String),
    #[error("missing required column {0:?}")]
    MissingColumn(String),
    #[error("{field} value {value} outside physical range [{min}, {max}]")]
    OutOfRange { field: &'static str, value: f64, min: f64, max: f64 },
    #[error("missing {0} value in sample")]
    MissingValue(&'static str),
}

// every configured data source failed for one request
#[derive(Error, Debug, Clone)]
#[error("all data sources failed for {request}: {}", attempts.join("; "))]
pub struct DataUnavailableError {
    pub request: String,
    pub attempts: Vec<String>,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("io error reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("csv error in {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Malformed(#[from] MalformedInputError),
    #[error(transparent)]
    Unavailable(#[from] DataUnavailableError),
}

// a feature row that doesn't fit the table it's being added to
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeatureError {
    #[error("row {race}/{driver} has {got} values for {expected} columns")]
    Width { race: String, driver: u32, expected: usize, got: usize },
    #[error("duplicate row {race}/{driver}")]
    Duplicate { race: String, driver: u32 },
}

#[derive(Error, Debug)]
pub enum FactorError {
    #[error("need at least {needed} feature columns for {factors} factors, got {got}")]
    TooFewFeatures { needed: usize, factors: usize, got: usize },
    #[error("need at least {needed} observations, got {got}")]
    TooFewObservations { needed: usize, got: usize },
    #[error("correlation matrix is not usable: {0}")]
    Degenerate(String),
    #[error("factor calibration was made for features {expected:?}, current run has {actual:?}")]
    CalibrationMismatch { expected: Vec<String>, actual: Vec<String> },
    #[error("factor calibration unusable: {0}")]
    Calibration(String),
    #[error("reflection already applied to this factor table")]
    AlreadyReflected,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("need at least {needed} drivers to fit, got {got}")]
    TooFewDrivers { needed: usize, got: usize },
    #[error("regression fit failed: {0}")]
    Fit(String),
    #[error("degenerate design: {0}")]
    Degenerate(String),
    #[error("no training percentiles for factor {0}")]
    EmptyPercentileMap(usize),
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Factor(#[from] FactorError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("population too small: {0}")]
    InsufficientPopulation(String),
    #[error("output error at {path}: {source}")]
    Output { path: PathBuf, source: std::io::Error },
    #[error("another run holds the output lock at {0}")]
    Locked(PathBuf),
    #[error("serialization error: {0}")]
    Serialize(String),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
