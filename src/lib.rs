//! Driver skill profiling from race timing and car telemetry.
//!
//! Raw race files become one feature vector per driver per race, which factor analysis
//! reduces to four skills (Speed, Consistency, Racecraft, Tire Management). Skills are
//! ranked across the field, then used to model finishing position.

pub mod circuit_fit;
pub mod config;
pub mod corners;
pub mod data;
pub mod error;
pub mod factors;
pub mod features;
pub mod model;
pub mod normalize;
pub mod output;
pub mod pipeline;
pub mod race_features;
pub mod source;
pub mod stats;
pub mod telemetry;
pub mod validation;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use factors::{compute_factors, FactorCalibration, FactorScoreTable};
pub use model::{FactorModel, PredictionResult};
pub use normalize::{normalize, DriverAggregateProfile, PercentileTable};
pub use pipeline::{Pipeline, RunOutcome};
pub use telemetry::extract_features;
pub use validation::{validate_model, ValidationReport};
