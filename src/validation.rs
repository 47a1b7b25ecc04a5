// Leave-one-driver-out check of the finish-position model.
//
// All metrics use the raw regression output. The 1.0 floor is a presentation rule and would
// otherwise hide how badly an overfit model misses.

use crate::config::ModelConfig;
use crate::error::ModelError;
use crate::factors::N_FACTORS;
use crate::model::{fit_ols, linear_prediction};
use crate::normalize::DriverAggregateProfile;
use crate::stats::mean;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ValidationIssue {
    Overfitting { shrinkage: f64 },
    WeakOutOfSample { r2: f64 },
    NoPredictivePower { r2: f64 },
    SmallSample { drivers: usize },
    /// a factor whose higher score predicts a worse finish
    CoefficientSign { factor: String, coefficient: f64 },
    LodoFailed { driver: u32, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverValidation {
    pub driver: u32,
    pub actual: f64,
    pub in_sample: f64,
    pub out_of_sample: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub n_drivers: usize,
    pub intercept: f64,
    pub coefficients: [f64; N_FACTORS],
    pub in_sample_r2: f64,
    pub in_sample_mae: f64,
    pub out_of_sample_r2: Option<f64>,
    pub out_of_sample_mae: Option<f64>,
    /// in-sample minus out-of-sample R²
    pub shrinkage: Option<f64>,
    pub per_driver: Vec<DriverValidation>,
    pub status: ValidationStatus,
    pub issues: Vec<ValidationIssue>,
}

/// 1 - SSE/SST, SST taken around the mean of `actual`. None when the actuals are flat.
pub fn r_squared(actual: &[f64], predicted: &[f64]) -> Option<f64> {
    let m = mean(actual)?;
    let sst: f64 = actual.iter().map(|a| (a - m).powi(2)).sum();
    if sst <= f64::EPSILON {
        return None;
    }
    let sse: f64 = actual.iter().zip(predicted).map(|(a, p)| (a - p).powi(2)).sum();
    Some(1.0 - sse / sst)
}

pub fn mean_absolute_error(actual: &[f64], predicted: &[f64]) -> Option<f64> {
    let errs: Vec<f64> = actual.iter().zip(predicted).map(|(a, p)| (a - p).abs()).collect();
    mean(&errs)
}

pub fn validate_model(
    profiles: &[DriverAggregateProfile],
    factor_names: &[String; N_FACTORS],
    cfg: &ModelConfig,
) -> Result<ValidationReport, ModelError> {
    let rows: Vec<(u32, [f64; N_FACTORS], f64)> = profiles
        .iter()
        .filter_map(|p| p.mean_finish.map(|f| (p.driver, p.z_scores(), f)))
        .collect();
    let n = rows.len();
    if n < cfg.min_drivers {
        return Err(ModelError::TooFewDrivers { needed: cfg.min_drivers, got: n });
    }
    let x: Vec<[f64; N_FACTORS]> = rows.iter().map(|r| r.1).collect();
    let y: Vec<f64> = rows.iter().map(|r| r.2).collect();

    let (intercept, coefficients) = fit_ols(&x, &y)?;
    let in_pred: Vec<f64> = x.iter().map(|z| linear_prediction(intercept, &coefficients, z)).collect();
    let in_sample_r2 = r_squared(&y, &in_pred).ok_or(ModelError::Fit("finish positions have no variance".into()))?;
    let in_sample_mae = mean_absolute_error(&y, &in_pred).unwrap_or(0.0);

    let mut issues = Vec::new();
    let mut out_pred: Vec<Option<f64>> = Vec::with_capacity(n);
    for held in 0..n {
        let tx: Vec<[f64; N_FACTORS]> = x.iter().enumerate().filter(|(i, _)| *i != held).map(|(_, v)| *v).collect();
        let ty: Vec<f64> = y.iter().enumerate().filter(|(i, _)| *i != held).map(|(_, v)| *v).collect();
        match fit_ols(&tx, &ty) {
            Ok((b0, b)) => out_pred.push(Some(linear_prediction(b0, &b, &x[held]))),
            Err(err) => {
                warn!(driver = rows[held].0, %err, "leave-one-driver-out fold failed");
                issues.push(ValidationIssue::LodoFailed { driver: rows[held].0, reason: err.to_string() });
                out_pred.push(None);
            }
        }
    }

    let lodo: Option<Vec<f64>> = out_pred.iter().copied().collect();
    let out_of_sample_r2 = lodo.as_ref().and_then(|p| r_squared(&y, p));
    let out_of_sample_mae = lodo.as_ref().and_then(|p| mean_absolute_error(&y, p));
    let shrinkage = out_of_sample_r2.map(|r2| in_sample_r2 - r2);

    if let Some(s) = shrinkage.filter(|s| *s > cfg.max_shrinkage) {
        issues.push(ValidationIssue::Overfitting { shrinkage: s });
    }
    match out_of_sample_r2 {
        Some(r2) if r2 < 0.0 => issues.push(ValidationIssue::NoPredictivePower { r2 }),
        Some(r2) if r2 < cfg.min_out_of_sample_r2 => issues.push(ValidationIssue::WeakOutOfSample { r2 }),
        _ => {}
    }
    if n < cfg.small_sample_drivers {
        issues.push(ValidationIssue::SmallSample { drivers: n });
    }
    for (k, c) in coefficients.iter().enumerate() {
        if *c > 0.0 {
            issues.push(ValidationIssue::CoefficientSign { factor: factor_names[k].clone(), coefficient: *c });
        }
    }

    let status = match out_of_sample_r2 {
        Some(r2) if r2 >= 0.0 => ValidationStatus::Pass,
        _ => ValidationStatus::Fail,
    };
    info!(
        drivers = n,
        in_sample_r2,
        out_of_sample_r2 = ?out_of_sample_r2,
        shrinkage = ?shrinkage,
        status = ?status,
        "model validated"
    );

    let per_driver = rows
        .iter()
        .enumerate()
        .map(|(i, (driver, _, actual))| DriverValidation {
            driver: *driver,
            actual: *actual,
            in_sample: in_pred[i],
            out_of_sample: out_pred[i],
        })
        .collect();

    Ok(ValidationReport {
        n_drivers: n,
        intercept,
        coefficients,
        in_sample_r2,
        in_sample_mae,
        out_of_sample_r2,
        out_of_sample_mae,
        shrinkage,
        per_driver,
        status,
        issues,
    })
}
