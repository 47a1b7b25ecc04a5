//! Factor analysis over the driver-race feature table.
//!
//! Standardised features are reduced to four latent factors: principal-axis extraction
//! from the correlation matrix, varimax rotation, regression-style scores.
//!
//! The numerical eigensolver returns factors with an arbitrary sign. Each factor is first
//! put in a canonical orientation (its largest-|loading| feature loads positively), then
//! flipped or not according to a stored [`FactorCalibration`]. The calibration is a
//! reviewed artifact, not recomputed per run: re-deriving it on every run could flip a
//! factor whenever the sample moves slightly. [`FactorCalibration::derive`] proposes one.

use crate::config::FactorConfig;
use crate::error::FactorError;
use crate::features::{feature_spec, FactorCategory, FeatureTable, ImputedTable};
use nalgebra::{DMatrix, SymmetricEigen};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub const N_FACTORS: usize = 4;

// ---------------------------------------------------------------------------
// Standardisation and correlation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardization {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

/// Column-wise z-scores (sample std). A constant column becomes all zeros.
pub fn standardize(matrix: &[Vec<f64>]) -> (DMatrix<f64>, Standardization) {
    let n = matrix.len();
    let p = matrix.first().map_or(0, Vec::len);
    let mut means = vec![0.0; p];
    let mut stds = vec![0.0; p];
    for j in 0..p {
        let col: Vec<f64> = matrix.iter().map(|r| r[j]).collect();
        means[j] = crate::stats::mean(&col).unwrap_or(0.0);
        stds[j] = crate::stats::sample_std(&col).unwrap_or(0.0);
    }
    let z = DMatrix::from_fn(n, p, |i, j| {
        if stds[j] > f64::EPSILON {
            (matrix[i][j] - means[j]) / stds[j]
        } else {
            0.0
        }
    });
    (z, Standardization { means, stds })
}

pub fn correlation_matrix(z: &DMatrix<f64>) -> DMatrix<f64> {
    let n = z.nrows().max(2) as f64;
    z.transpose() * z / (n - 1.0)
}

// ---------------------------------------------------------------------------
// Factorability and multicollinearity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FactorabilityWarning {
    /// Bartlett's test could not reject "correlation matrix is identity"
    SphericityNotRejected { p_value: f64 },
    LowSamplingAdequacy { kmo: f64 },
    SingularCorrelation,
    FewObservations { observations: usize, features: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorabilityReport {
    pub observations: usize,
    pub features: usize,
    pub bartlett_chi2: Option<f64>,
    pub bartlett_df: f64,
    pub bartlett_p: Option<f64>,
    pub kmo: Option<f64>,
    pub warnings: Vec<FactorabilityWarning>,
}

impl FactorabilityReport {
    pub fn is_factorable(&self) -> bool {
        self.warnings.is_empty()
    }
}

pub fn factorability(corr: &DMatrix<f64>, observations: usize, cfg: &FactorConfig) -> FactorabilityReport {
    let p = corr.nrows();
    let df = (p * p.saturating_sub(1)) as f64 / 2.0;
    let mut warnings = Vec::new();
    if observations < 5 * p {
        warnings.push(FactorabilityWarning::FewObservations { observations, features: p });
    }

    let det = corr.determinant();
    let (bartlett_chi2, bartlett_p) = if det > 0.0 && det.is_finite() {
        let chi2 = -(observations as f64 - 1.0 - (2.0 * p as f64 + 5.0) / 6.0) * det.ln();
        // df is zero for a single feature; no test is possible then
        let pv = ChiSquared::new(df).ok().map(|dist| dist.sf(chi2.max(0.0)));
        if let Some(pv) = pv.filter(|&pv| pv > cfg.bartlett_alpha) {
            warnings.push(FactorabilityWarning::SphericityNotRejected { p_value: pv });
        }
        (Some(chi2), pv)
    } else {
        (None, None)
    };

    let kmo = corr.clone().try_inverse().and_then(|inv| {
        let (mut r2, mut a2) = (0.0, 0.0);
        for i in 0..p {
            for j in 0..p {
                if i == j {
                    continue;
                }
                let denom = (inv[(i, i)] * inv[(j, j)]).sqrt();
                if !(denom.is_finite() && denom > 0.0) {
                    return None;
                }
                r2 += corr[(i, j)].powi(2);
                a2 += (inv[(i, j)] / denom).powi(2);
            }
        }
        (r2 + a2 > 0.0).then(|| r2 / (r2 + a2))
    });
    match kmo {
        Some(k) if k < cfg.kmo_threshold => warnings.push(FactorabilityWarning::LowSamplingAdequacy { kmo: k }),
        None => warnings.push(FactorabilityWarning::SingularCorrelation),
        _ => {}
    }
    if bartlett_chi2.is_none() && !warnings.contains(&FactorabilityWarning::SingularCorrelation) {
        warnings.push(FactorabilityWarning::SingularCorrelation);
    }

    FactorabilityReport { observations, features: p, bartlett_chi2, bartlett_df: df, bartlett_p, kmo, warnings }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollinearPair {
    pub a: String,
    pub b: String,
    pub r: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollinearityReport {
    pub pairs: Vec<CollinearPair>,
    /// None when the correlation matrix can't be inverted
    pub vif: Vec<(String, Option<f64>)>,
    pub high_vif: Vec<String>,
}

pub fn collinearity(corr: &DMatrix<f64>, names: &[String], cfg: &FactorConfig) -> CollinearityReport {
    let p = corr.nrows();
    let mut pairs = Vec::new();
    for i in 0..p {
        for j in i + 1..p {
            let r = corr[(i, j)];
            if r.abs() > cfg.collinearity_threshold {
                pairs.push(CollinearPair { a: names[i].clone(), b: names[j].clone(), r });
            }
        }
    }
    let inv = corr.clone().try_inverse();
    let vif: Vec<(String, Option<f64>)> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.clone(), inv.as_ref().map(|m| m[(i, i)]).filter(|v| v.is_finite() && *v > 0.0)))
        .collect();
    let high_vif = vif
        .iter()
        .filter(|(_, v)| v.map_or(true, |v| v > cfg.vif_threshold))
        .map(|(n, _)| n.clone())
        .collect();
    CollinearityReport { pairs, vif, high_vif }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Kaiser-normalised varimax rotation of a p x k loading matrix.
pub fn varimax(loadings: &DMatrix<f64>, max_iter: usize, tol: f64) -> DMatrix<f64> {
    let (p, k) = loadings.shape();
    let h: Vec<f64> = (0..p).map(|i| loadings.row(i).norm()).collect();
    let a = DMatrix::from_fn(p, k, |i, j| if h[i] > 0.0 { loadings[(i, j)] / h[i] } else { 0.0 });

    let mut rotation = DMatrix::<f64>::identity(k, k);
    let mut d = 0.0;
    for _ in 0..max_iter {
        let lr = &a * &rotation;
        let col_ss: Vec<f64> = (0..k).map(|j| lr.column(j).norm_squared() / p as f64).collect();
        let target = DMatrix::from_fn(p, k, |i, j| lr[(i, j)].powi(3) - lr[(i, j)] * col_ss[j]);
        let svd = (a.transpose() * target).svd(true, true);
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else { break };
        rotation = u * v_t;
        let d_new = svd.singular_values.sum();
        if d_new < d * (1.0 + tol) {
            break;
        }
        d = d_new;
    }
    let rotated = &a * &rotation;
    DMatrix::from_fn(p, k, |i, j| rotated[(i, j)] * h[i])
}

/// Unreflected extraction result.
#[derive(Debug, Clone)]
pub struct FactorExtraction {
    pub feature_names: Vec<String>,
    /// p x N_FACTORS, canonically oriented
    pub loadings: DMatrix<f64>,
    pub eigenvalues: Vec<f64>,
    /// share of total standardised variance per rotated factor
    pub explained_variance: Vec<f64>,
    /// p x N_FACTORS, scores = Z * weights
    pub score_weights: DMatrix<f64>,
    pub standardization: Standardization,
    pub correlation: DMatrix<f64>,
    /// n x N_FACTORS, before reflection
    pub raw_scores: DMatrix<f64>,
}

impl FactorExtraction {
    pub fn loading_column(&self, factor: usize) -> Vec<f64> {
        self.loadings.column(factor).iter().copied().collect()
    }
}

pub fn extract_factors(imputed: &ImputedTable, cfg: &FactorConfig) -> Result<FactorExtraction, FactorError> {
    let n = imputed.matrix.len();
    let p = imputed.names.len();
    if p < N_FACTORS {
        return Err(FactorError::TooFewFeatures { needed: N_FACTORS, factors: N_FACTORS, got: p });
    }
    if n < cfg.min_observations {
        return Err(FactorError::TooFewObservations { needed: cfg.min_observations, got: n });
    }

    let (z, standardization) = standardize(&imputed.matrix);
    let corr = correlation_matrix(&z);
    if corr.iter().any(|v| !v.is_finite()) {
        return Err(FactorError::Degenerate("non-finite correlation".into()));
    }

    let eigen = SymmetricEigen::new(corr.clone());
    let mut order: Vec<usize> = (0..p).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].partial_cmp(&eigen.eigenvalues[a]).unwrap_or(Ordering::Equal));
    let eigenvalues: Vec<f64> = order.iter().map(|&i| eigen.eigenvalues[i]).collect();
    if eigenvalues[N_FACTORS - 1] <= 1e-10 {
        return Err(FactorError::Degenerate(format!("only {} non-zero eigenvalues", eigenvalues.iter().filter(|v| **v > 1e-10).count())));
    }

    let unrotated = DMatrix::from_fn(p, N_FACTORS, |i, j| {
        let src = order[j];
        eigen.eigenvectors[(i, src)] * eigenvalues[j].sqrt()
    });
    let rotated = varimax(&unrotated, cfg.varimax_max_iter, cfg.varimax_tol);

    // order by variance explained after rotation, then canonical sign
    let mut by_var: Vec<(usize, f64)> = (0..N_FACTORS).map(|j| (j, rotated.column(j).norm_squared())).collect();
    by_var.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    let mut loadings = DMatrix::zeros(p, N_FACTORS);
    for (dst, (src, _)) in by_var.iter().enumerate() {
        let col = rotated.column(*src);
        let lead = col.iter().copied().fold(0.0, |best: f64, v| if v.abs() > best.abs() { v } else { best });
        let sign = if lead < 0.0 { -1.0 } else { 1.0 };
        for i in 0..p {
            loadings[(i, dst)] = col[i] * sign;
        }
    }
    let explained_variance: Vec<f64> = by_var.iter().map(|(_, ss)| ss / p as f64).collect();

    let gram = loadings.transpose() * &loadings;
    let gram_inv = gram.try_inverse().ok_or_else(|| FactorError::Degenerate("singular loading gram matrix".into()))?;
    let score_weights = &loadings * gram_inv;
    let raw_scores = &z * &score_weights;

    Ok(FactorExtraction {
        feature_names: imputed.names.clone(),
        loadings,
        eigenvalues,
        explained_variance,
        score_weights,
        standardization,
        correlation: corr,
        raw_scores,
    })
}

// ---------------------------------------------------------------------------
// Reflection calibration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadingEntry {
    pub feature: String,
    pub loading: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorCalibrationEntry {
    pub index: usize,
    pub name: String,
    pub reflect: bool,
    pub rationale: String,
    pub loadings_snapshot: Vec<LoadingEntry>,
}

/// Versioned factor-id -> reflect table with the loadings that justified it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorCalibration {
    pub version: u32,
    pub features: Vec<String>,
    pub factors: Vec<FactorCalibrationEntry>,
}

fn direction(feature: &str) -> f64 {
    match feature_spec(feature) {
        Some(spec) if !spec.higher_is_better => -1.0,
        _ => 1.0,
    }
}

fn dominant(names: &[String], column: &[f64], count: usize) -> Vec<(usize, f64)> {
    let mut idx: Vec<(usize, f64)> = column.iter().copied().enumerate().collect();
    idx.sort_by(|a, b| b.1.abs().partial_cmp(&a.1.abs()).unwrap_or(Ordering::Equal).then(names[a.0].cmp(&names[b.0])));
    idx.truncate(count.max(1));
    idx
}

/// Whether a factor must be flipped so that higher means better: the dominant loadings,
/// weighted by magnitude and signed by each feature's better-direction, sum negative.
pub fn needs_reflection(names: &[String], column: &[f64], dominant_count: usize) -> (bool, String) {
    let top = dominant(names, column, dominant_count);
    let oriented: f64 = top.iter().map(|&(i, l)| l * l.abs() * direction(&names[i])).sum();
    let listed: Vec<String> = top
        .iter()
        .map(|&(i, l)| {
            let dir = if direction(&names[i]) > 0.0 { "higher better" } else { "lower better" };
            format!("{} {:+.3} ({})", names[i], l, dir)
        })
        .collect();
    let reflect = oriented < 0.0;
    let rationale = format!(
        "dominant loadings: {}; oriented sum {:+.3} -> {}",
        listed.join(", "),
        oriented,
        if reflect { "reflect" } else { "keep" }
    );
    (reflect, rationale)
}

// each factor gets the category with the most squared loading, greedily, no repeats
fn name_factors(names: &[String], loadings: &DMatrix<f64>) -> Vec<String> {
    let mut cells = Vec::new();
    for (ci, cat) in FactorCategory::ALL.iter().enumerate() {
        for f in 0..N_FACTORS {
            let mass: f64 = names
                .iter()
                .enumerate()
                .filter(|(_, n)| feature_spec(n).map(|s| s.category) == Some(*cat))
                .map(|(i, _)| loadings[(i, f)].powi(2))
                .sum();
            cells.push((ci, f, mass));
        }
    }
    cells.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));
    let mut assigned: Vec<Option<FactorCategory>> = vec![None; N_FACTORS];
    let mut used = [false; 4];
    for (ci, f, _) in cells {
        if assigned[f].is_none() && !used[ci] {
            assigned[f] = Some(FactorCategory::ALL[ci]);
            used[ci] = true;
        }
    }
    assigned
        .into_iter()
        .enumerate()
        .map(|(f, c)| c.map_or_else(|| format!("Factor {}", f + 1), |c| c.label().to_string()))
        .collect()
}

impl FactorCalibration {
    pub const VERSION: u32 = 1;

    /// Proposal from the current loadings. Meant to be reviewed and committed, not used blindly.
    pub fn derive(extraction: &FactorExtraction, cfg: &FactorConfig) -> Self {
        let names = &extraction.feature_names;
        let labels = name_factors(names, &extraction.loadings);
        let factors = (0..N_FACTORS)
            .map(|f| {
                let column = extraction.loading_column(f);
                let (reflect, rationale) = needs_reflection(names, &column, cfg.dominant_loadings);
                FactorCalibrationEntry {
                    index: f,
                    name: labels[f].clone(),
                    reflect,
                    rationale,
                    loadings_snapshot: names
                        .iter()
                        .zip(&column)
                        .map(|(n, l)| LoadingEntry { feature: n.clone(), loading: *l })
                        .collect(),
                }
            })
            .collect();
        Self { version: Self::VERSION, features: names.clone(), factors }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FactorError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| FactorError::Calibration(format!("cannot read calibration {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| FactorError::Calibration(format!("invalid calibration {}: {}", path.display(), e)))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), FactorError> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self).map_err(|e| FactorError::Calibration(e.to_string()))?;
        fs::write(path, text)
            .map_err(|e| FactorError::Calibration(format!("cannot write calibration {}: {}", path.display(), e)))
    }

    pub fn reflect_flags(&self) -> [bool; N_FACTORS] {
        let mut flags = [false; N_FACTORS];
        for entry in &self.factors {
            if entry.index < N_FACTORS {
                flags[entry.index] = entry.reflect;
            }
        }
        flags
    }

    pub fn names(&self) -> [String; N_FACTORS] {
        let mut names: [String; N_FACTORS] = std::array::from_fn(|i| format!("Factor {}", i + 1));
        for entry in &self.factors {
            if entry.index < N_FACTORS {
                names[entry.index] = entry.name.clone();
            }
        }
        names
    }

    /// Factors whose current loadings would call for a different reflection than stored.
    pub fn drift(&self, extraction: &FactorExtraction, cfg: &FactorConfig) -> Vec<usize> {
        let flags = self.reflect_flags();
        (0..N_FACTORS)
            .filter(|&f| {
                let (now, _) = needs_reflection(&extraction.feature_names, &extraction.loading_column(f), cfg.dominant_loadings);
                now != flags[f]
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Scores
// ---------------------------------------------------------------------------

/// Negates every score of one factor. Applying it twice gives the input back.
pub fn reflect(scores: &[f64]) -> Vec<f64> {
    scores.iter().map(|s| -s).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorScoreRow {
    pub race_id: String,
    pub driver: u32,
    pub finish_position: Option<u32>,
    pub scores: [f64; N_FACTORS],
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactorScoreTable {
    pub factor_names: [String; N_FACTORS],
    pub rows: Vec<FactorScoreRow>,
    reflected: [bool; N_FACTORS],
    reflection_applied: bool,
}

impl FactorScoreTable {
    /// Table of scores that have not been reflected yet.
    pub fn from_rows(factor_names: [String; N_FACTORS], rows: Vec<FactorScoreRow>) -> Self {
        Self { factor_names, rows, reflected: [false; N_FACTORS], reflection_applied: false }
    }

    pub fn from_extraction(imputed: &ImputedTable, extraction: &FactorExtraction, factor_names: [String; N_FACTORS]) -> Self {
        let rows = imputed
            .keys
            .iter()
            .zip(&imputed.finish_positions)
            .enumerate()
            .map(|(i, ((race_id, driver), finish))| FactorScoreRow {
                race_id: race_id.clone(),
                driver: *driver,
                finish_position: *finish,
                scores: std::array::from_fn(|f| extraction.raw_scores[(i, f)]),
            })
            .collect();
        Self::from_rows(factor_names, rows)
    }

    /// Applies the calibrated reflection. A table accepts this exactly once.
    pub fn apply_reflection(&mut self, flags: [bool; N_FACTORS]) -> Result<(), FactorError> {
        if self.reflection_applied {
            return Err(FactorError::AlreadyReflected);
        }
        for f in (0..N_FACTORS).filter(|&f| flags[f]) {
            let column: Vec<f64> = self.rows.iter().map(|r| r.scores[f]).collect();
            for (row, v) in self.rows.iter_mut().zip(reflect(&column)) {
                row.scores[f] = v;
            }
        }
        self.reflected = flags;
        self.reflection_applied = true;
        Ok(())
    }

    pub fn reflection_applied(&self) -> bool {
        self.reflection_applied
    }

    pub fn reflected(&self) -> [bool; N_FACTORS] {
        self.reflected
    }

    pub fn column(&self, factor: usize) -> Vec<f64> {
        self.rows.iter().map(|r| r.scores[factor]).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorSummary {
    pub index: usize,
    pub name: String,
    pub reflected: bool,
    pub explained_variance: f64,
    pub loadings: Vec<LoadingEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorDiagnostics {
    pub observations: usize,
    pub features: Vec<String>,
    pub dropped_features: Vec<String>,
    pub imputed_cells: usize,
    pub eigenvalues: Vec<f64>,
    pub factors: Vec<FactorSummary>,
    pub factorability: FactorabilityReport,
    pub collinearity: CollinearityReport,
    /// factors whose stored reflection disagrees with this run's loadings
    pub calibration_drift: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct FactorAnalysis {
    pub scores: FactorScoreTable,
    pub diagnostics: FactorDiagnostics,
}

/// Imputes, extracts, scores and reflects. Factorability problems are reported and logged,
/// they don't stop the run.
pub fn compute_factors(
    table: &FeatureTable,
    calibration: &FactorCalibration,
    cfg: &FactorConfig,
) -> Result<FactorAnalysis, FactorError> {
    let imputed = crate::features::impute(table);
    if calibration.features != imputed.names {
        return Err(FactorError::CalibrationMismatch {
            expected: calibration.features.clone(),
            actual: imputed.names.clone(),
        });
    }
    let extraction = extract_factors(&imputed, cfg)?;

    let factorability = factorability(&extraction.correlation, imputed.matrix.len(), cfg);
    for w in &factorability.warnings {
        warn!(warning = ?w, "feature matrix factorability");
    }
    let collinearity = collinearity(&extraction.correlation, &imputed.names, cfg);
    for pair in &collinearity.pairs {
        warn!(a = %pair.a, b = %pair.b, r = pair.r, "highly correlated features");
    }

    let drift = calibration.drift(&extraction, cfg);
    if !drift.is_empty() {
        warn!(factors = ?drift, "loadings disagree with stored reflection; keeping stored decision, recalibrate to change it");
    }

    let names = calibration.names();
    let flags = calibration.reflect_flags();
    let mut scores = FactorScoreTable::from_extraction(&imputed, &extraction, names.clone());
    scores.apply_reflection(flags)?;

    let factors = (0..N_FACTORS)
        .map(|f| FactorSummary {
            index: f,
            name: names[f].clone(),
            reflected: flags[f],
            explained_variance: extraction.explained_variance[f],
            loadings: imputed
                .names
                .iter()
                .enumerate()
                .map(|(i, n)| LoadingEntry {
                    feature: n.clone(),
                    loading: if flags[f] { -extraction.loadings[(i, f)] } else { extraction.loadings[(i, f)] },
                })
                .collect(),
        })
        .collect();
    info!(
        observations = imputed.matrix.len(),
        features = imputed.names.len(),
        explained = ?extraction.explained_variance,
        "factors extracted"
    );

    Ok(FactorAnalysis {
        scores,
        diagnostics: FactorDiagnostics {
            observations: imputed.matrix.len(),
            features: imputed.names.clone(),
            dropped_features: imputed.dropped_columns.clone(),
            imputed_cells: imputed.imputed_cells,
            eigenvalues: extraction.eigenvalues.clone(),
            factors,
            factorability,
            collinearity,
            calibration_drift: drift,
        },
    })
}
