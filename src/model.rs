use crate::config::ModelConfig;
use crate::error::ModelError;
use crate::factors::N_FACTORS;
use crate::normalize::DriverAggregateProfile;
use crate::stats::{median, percentile};
use linfa::prelude::*;
use linfa_linear::LinearRegression;
use nalgebra::{SMatrix, SymmetricEigen};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub type FittedLinearRegression = linfa_linear::FittedLinearRegression<f64>;

/// Lowest finishing position a prediction may report.
pub const FINISH_FLOOR: f64 = 1.0;

/// Ordinary least squares of finish position on factor z-scores. Returns (intercept, coefficients).
pub fn fit_ols(x: &[[f64; N_FACTORS]], y: &[f64]) -> Result<(f64, [f64; N_FACTORS]), ModelError> {
    if x.len() != y.len() {
        return Err(ModelError::Fit(format!("{} rows but {} targets", x.len(), y.len())));
    }
    if x.len() <= N_FACTORS {
        return Err(ModelError::TooFewDrivers { needed: N_FACTORS + 1, got: x.len() });
    }
    if x.iter().flatten().chain(y).any(|v| !v.is_finite()) {
        return Err(ModelError::NonFinite("regression input"));
    }
    let distinct = distinct_rows(x);
    if distinct <= N_FACTORS {
        return Err(ModelError::Degenerate(format!("{} distinct drivers for {} factors", distinct, N_FACTORS)));
    }
    let (thinnest, widest) = design_spread(x);
    if !(widest > 0.0) || thinnest <= widest * 1e-12 {
        return Err(ModelError::Degenerate("factor columns are linearly dependent".into()));
    }
    let feats: Vec<f64> = x.iter().flat_map(|r| r.iter().copied()).collect();
    let xs = Array2::from_shape_vec((x.len(), N_FACTORS), feats).map_err(|e| ModelError::Fit(e.to_string()))?;
    let ds = Dataset::new(xs, Array1::from_vec(y.to_vec()));

    let fitted: FittedLinearRegression = LinearRegression::new().fit(&ds).map_err(|e| ModelError::Fit(e.to_string()))?;
    let params = fitted.params();
    let coefficients: [f64; N_FACTORS] = std::array::from_fn(|k| params[k]);
    let intercept = fitted.intercept();
    if !intercept.is_finite() || coefficients.iter().any(|c| !c.is_finite()) {
        return Err(ModelError::NonFinite("regression coefficients"));
    }
    Ok((intercept, coefficients))
}

fn distinct_rows(x: &[[f64; N_FACTORS]]) -> usize {
    let mut keys: Vec<[u64; N_FACTORS]> = x.iter().map(|r| r.map(f64::to_bits)).collect();
    keys.sort_unstable();
    keys.dedup();
    keys.len()
}

/// Smallest and largest eigenvalue of the centred covariance of the design rows.
pub fn design_spread(x: &[[f64; N_FACTORS]]) -> (f64, f64) {
    if x.is_empty() {
        return (0.0, 0.0);
    }
    let n = x.len() as f64;
    let means: [f64; N_FACTORS] = std::array::from_fn(|k| x.iter().map(|r| r[k]).sum::<f64>() / n);
    let mut cov = SMatrix::<f64, N_FACTORS, N_FACTORS>::zeros();
    for row in x {
        for i in 0..N_FACTORS {
            for j in 0..N_FACTORS {
                cov[(i, j)] += (row[i] - means[i]) * (row[j] - means[j]) / n;
            }
        }
    }
    let eigenvalues = SymmetricEigen::new(cov).eigenvalues;
    (eigenvalues.min(), eigenvalues.max())
}

pub fn linear_prediction(intercept: f64, coefficients: &[f64; N_FACTORS], z: &[f64; N_FACTORS]) -> f64 {
    intercept + coefficients.iter().zip(z).map(|(c, v)| c * v).sum::<f64>()
}

/// Percentile -> z lookup built from what the training population actually looks like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmpiricalPercentileMap {
    /// (percentile, z) sorted by percentile, one entry per distinct percentile
    points: Vec<(f64, f64)>,
}

impl EmpiricalPercentileMap {
    pub fn new(pairs: &[(f64, f64)]) -> Self {
        let mut sorted: Vec<(f64, f64)> = pairs.iter().copied().filter(|(p, z)| p.is_finite() && z.is_finite()).collect();
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut points: Vec<(f64, f64)> = Vec::with_capacity(sorted.len());
        let mut i = 0;
        while i < sorted.len() {
            let p = sorted[i].0;
            let group: Vec<f64> = sorted[i..].iter().take_while(|(q, _)| (q - p).abs() < 1e-9).map(|(_, z)| *z).collect();
            i += group.len();
            points.push((p, group.iter().sum::<f64>() / group.len() as f64));
        }
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Interpolates linearly between observed pairs; past either end, continues the outermost segment.
    pub fn to_z(&self, pct: f64) -> Option<f64> {
        let pts = &self.points;
        match pts.len() {
            0 => None,
            1 => Some(pts[0].1),
            n => {
                let seg = if pct <= pts[0].0 {
                    0
                } else if pct >= pts[n - 1].0 {
                    n - 2
                } else {
                    pts.windows(2).position(|w| pct <= w[1].0).unwrap_or(n - 2)
                };
                let (p0, z0) = pts[seg];
                let (p1, z1) = pts[seg + 1];
                Some(z0 + (pct - p0) * (z1 - z0) / (p1 - p0))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

/// A query sits away from every real driver the model was fitted on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtrapolationWarning {
    pub nearest_distance: f64,
    pub median_pairwise_distance: f64,
    pub ratio: f64,
    pub interval_widening: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionInterval {
    pub lower: f64,
    pub upper: f64,
    pub resamples_used: usize,
    pub resamples_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarDriver {
    pub driver: u32,
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub z_scores: [f64; N_FACTORS],
    /// regression output before the floor
    pub raw_prediction: f64,
    pub predicted_finish: f64,
    /// None when the training set is too small to bootstrap
    pub interval: Option<PredictionInterval>,
    pub confidence: ConfidenceLevel,
    pub extrapolation: Option<ExtrapolationWarning>,
    pub similar_drivers: Vec<SimilarDriver>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingPoint {
    pub driver: u32,
    pub z_scores: [f64; N_FACTORS],
    pub percentiles: [f64; N_FACTORS],
    pub mean_finish: Option<f64>,
}

impl From<&DriverAggregateProfile> for TrainingPoint {
    fn from(p: &DriverAggregateProfile) -> Self {
        Self { driver: p.driver, z_scores: p.z_scores(), percentiles: p.percentiles(), mean_finish: p.mean_finish }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct BootstrapEnsemble {
    fits: Vec<(f64, [f64; N_FACTORS])>,
    failed: usize,
}

/// Refits on `resamples` draws with replacement. Index sets come from one seeded generator, so the
/// ensemble is reproducible no matter how the refits are scheduled.
///
/// A draw that repeats a few drivers can collapse the design along some direction; OLS then
/// returns finite but meaningless coefficients. Such draws count as failed.
fn bootstrap(x: &[[f64; N_FACTORS]], y: &[f64], cfg: &ModelConfig) -> BootstrapEnsemble {
    let n = x.len();
    if n <= N_FACTORS {
        return BootstrapEnsemble::default();
    }
    let min_spread = design_spread(x).0 * cfg.min_resample_spread;
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let draws: Vec<Vec<usize>> =
        (0..cfg.bootstrap_resamples).map(|_| (0..n).map(|_| rng.gen_range(0..n)).collect()).collect();
    let results: Vec<Option<(f64, [f64; N_FACTORS])>> = draws
        .par_iter()
        .map(|idx| {
            let bx: Vec<[f64; N_FACTORS]> = idx.iter().map(|&i| x[i]).collect();
            let by: Vec<f64> = idx.iter().map(|&i| y[i]).collect();
            fit_resample(&bx, &by, min_spread).ok()
        })
        .collect();
    let failed = results.iter().filter(|r| r.is_none()).count();
    if failed > 0 {
        debug!(failed, resamples = cfg.bootstrap_resamples, "degenerate bootstrap resamples skipped");
    }
    BootstrapEnsemble { fits: results.into_iter().flatten().collect(), failed }
}

fn fit_resample(x: &[[f64; N_FACTORS]], y: &[f64], min_spread: f64) -> Result<(f64, [f64; N_FACTORS]), ModelError> {
    let (thinnest, _) = design_spread(x);
    if thinnest < min_spread {
        return Err(ModelError::Degenerate(format!("resample spread {:.3e} below {:.3e}", thinnest, min_spread)));
    }
    fit_ols(x, y)
}

#[derive(Debug, Clone)]
pub struct FactorModel {
    pub factor_names: [String; N_FACTORS],
    pub intercept: f64,
    pub coefficients: [f64; N_FACTORS],
    pub training: Vec<TrainingPoint>,
    maps: [EmpiricalPercentileMap; N_FACTORS],
    median_pairwise: Option<f64>,
    ensemble: BootstrapEnsemble,
    config: ModelConfig,
}

impl FactorModel {
    /// Fits on every driver with a known mean finish. Drivers without one still shape the
    /// percentile maps and the extrapolation geometry.
    pub fn fit(
        profiles: &[DriverAggregateProfile],
        factor_names: [String; N_FACTORS],
        cfg: &ModelConfig,
    ) -> Result<Self, ModelError> {
        let training: Vec<TrainingPoint> = profiles.iter().map(TrainingPoint::from).collect();
        let (x, y) = regression_rows(&training);
        if x.len() < cfg.min_drivers {
            return Err(ModelError::TooFewDrivers { needed: cfg.min_drivers, got: x.len() });
        }
        let (intercept, coefficients) = fit_ols(&x, &y)?;
        info!(drivers = x.len(), intercept, coefficients = ?coefficients, "finish-position model fitted");
        Ok(Self::assemble(factor_names, intercept, coefficients, training, cfg))
    }

    /// Model from calibrated impacts (finishing places gained per +1 z on each factor).
    pub fn from_impacts(
        intercept: f64,
        impacts: [f64; N_FACTORS],
        profiles: &[DriverAggregateProfile],
        factor_names: [String; N_FACTORS],
        cfg: &ModelConfig,
    ) -> Self {
        let training = profiles.iter().map(TrainingPoint::from).collect();
        Self::assemble(factor_names, intercept, impacts.map(|i| -i), training, cfg)
    }

    fn assemble(
        factor_names: [String; N_FACTORS],
        intercept: f64,
        coefficients: [f64; N_FACTORS],
        training: Vec<TrainingPoint>,
        cfg: &ModelConfig,
    ) -> Self {
        let maps = std::array::from_fn(|k| {
            let pairs: Vec<(f64, f64)> = training.iter().map(|t| (t.percentiles[k], t.z_scores[k])).collect();
            EmpiricalPercentileMap::new(&pairs)
        });
        let mut pairwise = Vec::new();
        for i in 0..training.len() {
            for j in i + 1..training.len() {
                pairwise.push(weighted_distance(&coefficients, &training[i].z_scores, &training[j].z_scores));
            }
        }
        let (x, y) = regression_rows(&training);
        let ensemble = if x.len() >= cfg.min_drivers {
            bootstrap(&x, &y, cfg)
        } else {
            BootstrapEnsemble::default()
        };
        Self {
            factor_names,
            intercept,
            coefficients,
            training,
            maps,
            median_pairwise: median(&pairwise),
            ensemble,
            config: cfg.clone(),
        }
    }

    pub fn percentile_map(&self, factor: usize) -> &EmpiricalPercentileMap {
        &self.maps[factor]
    }

    pub fn raw_prediction(&self, z: &[f64; N_FACTORS]) -> f64 {
        linear_prediction(self.intercept, &self.coefficients, z)
    }

    pub fn distance(&self, a: &[f64; N_FACTORS], b: &[f64; N_FACTORS]) -> f64 {
        weighted_distance(&self.coefficients, a, b)
    }

    /// Nearest-training distance over median pairwise training distance.
    pub fn extrapolation_ratio(&self, z: &[f64; N_FACTORS]) -> Option<(f64, f64, f64)> {
        let nearest = self.training.iter().map(|t| self.distance(z, &t.z_scores)).min_by(|a, b| a.total_cmp(b))?;
        let typical = self.median_pairwise?;
        let ratio = if typical > 1e-12 {
            nearest / typical
        } else if nearest > 1e-12 {
            f64::INFINITY
        } else {
            0.0
        };
        Some((nearest, typical, ratio))
    }

    pub fn similar_drivers(&self, z: &[f64; N_FACTORS], k: usize) -> Vec<SimilarDriver> {
        let mut all: Vec<SimilarDriver> = self
            .training
            .iter()
            .map(|t| SimilarDriver { driver: t.driver, distance: self.distance(z, &t.z_scores) })
            .collect();
        all.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.driver.cmp(&b.driver)));
        all.truncate(k);
        all
    }

    pub fn predict(&self, profile: &DriverAggregateProfile) -> PredictionResult {
        self.predict_z(&profile.z_scores())
    }

    pub fn predict_z(&self, z: &[f64; N_FACTORS]) -> PredictionResult {
        let raw = self.raw_prediction(z);
        let point = raw.max(FINISH_FLOOR);

        let (confidence, extrapolation) = match self.extrapolation_ratio(z) {
            Some((nearest, typical, ratio)) if ratio > self.config.medium_ratio => {
                let level = if ratio > self.config.low_ratio { ConfidenceLevel::Low } else { ConfidenceLevel::Medium };
                let widening = if ratio.is_finite() { ratio / self.config.medium_ratio } else { self.config.low_ratio };
                warn!(ratio, nearest, typical, "prediction extrapolates beyond training drivers");
                (
                    level,
                    Some(ExtrapolationWarning {
                        nearest_distance: nearest,
                        median_pairwise_distance: typical,
                        ratio,
                        interval_widening: widening,
                    }),
                )
            }
            Some(_) => (ConfidenceLevel::High, None),
            None => (ConfidenceLevel::Low, None),
        };

        let interval = self.bootstrap_interval(z).map(|(lo, hi)| {
            let f = extrapolation.as_ref().map_or(1.0, |w| w.interval_widening);
            PredictionInterval {
                lower: (raw - (raw - lo) * f).max(FINISH_FLOOR),
                upper: (raw + (hi - raw) * f).max(FINISH_FLOOR),
                resamples_used: self.ensemble.fits.len(),
                resamples_failed: self.ensemble.failed,
            }
        });

        PredictionResult {
            z_scores: *z,
            raw_prediction: raw,
            predicted_finish: point,
            interval,
            confidence,
            extrapolation,
            similar_drivers: self.similar_drivers(z, self.config.similar_k),
        }
    }

    fn bootstrap_interval(&self, z: &[f64; N_FACTORS]) -> Option<(f64, f64)> {
        let preds: Vec<f64> = self.ensemble.fits.iter().map(|(b0, b)| linear_prediction(*b0, b, z)).collect();
        Some((percentile(&preds, 2.5)?, percentile(&preds, 97.5)?))
    }

    /// "What if" query: shifts each factor's percentile, maps it back to z through the training
    /// distribution, and predicts.
    pub fn predict_adjusted(
        &self,
        profile: &DriverAggregateProfile,
        adjustments: [f64; N_FACTORS],
    ) -> Result<PredictionResult, ModelError> {
        let current = profile.percentiles();
        let mut z = [0.0; N_FACTORS];
        for k in 0..N_FACTORS {
            let target = (current[k] + adjustments[k]).clamp(0.0, 100.0);
            z[k] = self.maps[k].to_z(target).ok_or(ModelError::EmptyPercentileMap(k))?;
        }
        Ok(self.predict_z(&z))
    }
}

fn regression_rows(training: &[TrainingPoint]) -> (Vec<[f64; N_FACTORS]>, Vec<f64>) {
    training.iter().filter_map(|t| t.mean_finish.map(|f| (t.z_scores, f))).unzip()
}

/// Euclidean distance with each factor scaled by the size of its coefficient.
pub fn weighted_distance(coefficients: &[f64; N_FACTORS], a: &[f64; N_FACTORS], b: &[f64; N_FACTORS]) -> f64 {
    (0..N_FACTORS).map(|k| (coefficients[k].abs() * (a[k] - b[k])).powi(2)).sum::<f64>().sqrt()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::normalize::PercentileEntry;

    pub(crate) fn names() -> [String; N_FACTORS] {
        ["Speed", "Consistency", "Racecraft", "Tire Management"].map(String::from)
    }

    pub(crate) fn profile(driver: u32, z: [f64; N_FACTORS], finish: Option<f64>) -> DriverAggregateProfile {
        DriverAggregateProfile {
            driver,
            races: 3,
            mean_finish: finish,
            factors: std::array::from_fn(|k| PercentileEntry {
                score: z[k],
                z_score: z[k],
                percentile: (50.0 + 15.0 * z[k]).clamp(0.0, 100.0),
            }),
        }
    }

    // finish = 10 - 3 s - 2 c - r - 0.5 t + small deterministic wobble
    pub(crate) fn population(n: usize) -> Vec<DriverAggregateProfile> {
        (0..n)
            .map(|i| {
                let t = i as f64;
                let z = [
                    ((t * 0.7).sin()),
                    ((t * 1.3).cos()),
                    ((t * 0.4 + 1.0).sin()),
                    ((t * 2.1).cos() * 0.8),
                ];
                let finish = 10.0 - 3.0 * z[0] - 2.0 * z[1] - z[2] - 0.5 * z[3] + 0.2 * (t * 3.7).sin();
                profile(i as u32 + 1, z, Some(finish))
            })
            .collect()
    }

    #[test]
    fn impacts_become_negative_coefficients_and_floor_applies() {
        let m = FactorModel::from_impacts(13.01, [6.079, 3.792, 1.943, 1.237], &population(12), names(), &ModelConfig::default());
        let all_good = m.predict_z(&[1.0; 4]);
        assert!((all_good.raw_prediction - (13.01 - (6.079 + 3.792 + 1.943 + 1.237))).abs() < 1e-9);
        assert_eq!(all_good.predicted_finish, 1.0);
        let half = m.predict_z(&[0.5; 4]);
        assert!((half.predicted_finish - (13.01 - 0.5 * 13.051)).abs() < 1e-9);
    }

    #[test]
    fn ols_recovers_planted_relationship() {
        let m = FactorModel::fit(&population(30), names(), &ModelConfig::default()).unwrap();
        assert!((m.coefficients[0] + 3.0).abs() < 0.3, "{:?}", m.coefficients);
        assert!((m.coefficients[1] + 2.0).abs() < 0.3, "{:?}", m.coefficients);
        assert!((m.intercept - 10.0).abs() < 0.5);
    }

    #[test]
    fn too_few_drivers_is_an_error() {
        let err = FactorModel::fit(&population(5), names(), &ModelConfig::default()).unwrap_err();
        assert!(matches!(err, ModelError::TooFewDrivers { needed: 6, got: 5 }));
    }

    #[test]
    fn prediction_never_beats_first_place() {
        let m = FactorModel::fit(&population(20), names(), &ModelConfig::default()).unwrap();
        for z in [[50.0; 4], [1e6; 4], [-3.0, 40.0, 2.0, 9.0]] {
            let r = m.predict_z(&z);
            assert!(r.predicted_finish >= 1.0);
            let iv = r.interval.unwrap();
            assert!(iv.lower >= 1.0 && iv.upper >= 1.0);
        }
    }

    #[test]
    fn training_profile_is_not_extrapolation_but_far_point_is() {
        let pop = population(20);
        let m = FactorModel::fit(&pop, names(), &ModelConfig::default()).unwrap();
        for p in &pop {
            let r = m.predict(p);
            assert!(r.extrapolation.is_none());
            assert_eq!(r.confidence, ConfidenceLevel::High);
        }
        let far: [f64; N_FACTORS] = std::array::from_fn(|k| {
            let (lo, hi) = pop.iter().fold((f64::MAX, f64::MIN), |(lo, hi), p| (lo.min(p.factors[k].z_score), hi.max(p.factors[k].z_score)));
            10.0 * (hi - lo)
        });
        let r = m.predict_z(&far);
        assert!(r.extrapolation.is_some());
        assert_eq!(r.confidence, ConfidenceLevel::Low);
    }

    #[test]
    fn bootstrap_interval_is_reproducible_and_brackets_prediction() {
        let cfg = ModelConfig { bootstrap_resamples: 300, ..ModelConfig::default() };
        let a = FactorModel::fit(&population(25), names(), &cfg).unwrap();
        let b = FactorModel::fit(&population(25), names(), &cfg).unwrap();
        let z = [0.2, -0.1, 0.3, 0.0];
        let (ra, rb) = (a.predict_z(&z), b.predict_z(&z));
        assert_eq!(ra.interval, rb.interval);
        let iv = ra.interval.unwrap();
        assert!(iv.lower <= ra.predicted_finish && ra.predicted_finish <= iv.upper);
        assert_eq!(iv.resamples_used + iv.resamples_failed, 300);
    }

    #[test]
    fn empirical_map_interpolates_and_extends() {
        let map = EmpiricalPercentileMap::new(&[(10.0, -1.0), (50.0, 0.0), (50.0, 0.2), (90.0, 2.0)]);
        assert!((map.to_z(50.0).unwrap() - 0.1).abs() < 1e-12);
        assert!((map.to_z(70.0).unwrap() - 1.05).abs() < 1e-12);
        // below the first point: slope of the first segment (1.1 z per 40 pct)
        assert!((map.to_z(0.0).unwrap() - (-1.0 - 1.1 / 4.0)).abs() < 1e-12);
        assert_eq!(EmpiricalPercentileMap::new(&[]).to_z(30.0), None);
    }

    #[test]
    fn zero_adjustment_reproduces_plain_prediction() {
        let pop = population(15);
        let m = FactorModel::fit(&pop, names(), &ModelConfig::default()).unwrap();
        let plain = m.predict(&pop[3]);
        let adjusted = m.predict_adjusted(&pop[3], [0.0; 4]).unwrap();
        assert!((plain.raw_prediction - adjusted.raw_prediction).abs() < 1e-9);
        let better = m.predict_adjusted(&pop[3], [10.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(better.raw_prediction < plain.raw_prediction);
    }

    #[test]
    fn similar_drivers_use_coefficient_weights() {
        let train = vec![
            profile(1, [0.4, 0.0, 0.0, 0.0], Some(5.0)),
            profile(2, [0.0, 0.0, 0.0, 3.0], Some(4.0)),
            profile(3, [1.0, 1.0, 1.0, 1.0], Some(6.0)),
        ];
        // speed matters a lot, tire management barely
        let m = FactorModel::from_impacts(10.0, [5.0, 1.0, 1.0, 0.01], &train, names(), &ModelConfig::default());
        let origin = [0.0; N_FACTORS];
        let near: Vec<u32> = m.similar_drivers(&origin, 3).iter().map(|s| s.driver).collect();
        assert_eq!(near, vec![2, 1, 3]);

        // plain euclidean puts driver 1 first and driver 2 last
        let mut plain: Vec<(f64, u32)> =
            train.iter().map(|p| (weighted_distance(&[1.0; N_FACTORS], &origin, &p.z_scores()), p.driver)).collect();
        plain.sort_by(|a, b| a.0.total_cmp(&b.0));
        assert_eq!(plain.iter().map(|(_, d)| *d).collect::<Vec<_>>(), vec![1, 3, 2]);
    }

    #[test]
    fn medium_band_widens_interval_by_ratio() {
        let pop = population(20);
        let m = FactorModel::from_impacts(10.0, [1.0; N_FACTORS], &pop, names(), &ModelConfig::default());

        let inside = m.predict(&pop[0]);
        assert_eq!(inside.confidence, ConfidenceLevel::High);
        let (lo, hi) = m.bootstrap_interval(&pop[0].z_scores()).unwrap();
        let iv = inside.interval.unwrap();
        assert!((iv.upper - iv.lower - (hi - lo)).abs() < 1e-9);

        // walk away from the centroid until the query is 1.5-2x a typical spacing away
        let centroid: [f64; N_FACTORS] =
            std::array::from_fn(|k| pop.iter().map(|p| p.factors[k].z_score).sum::<f64>() / pop.len() as f64);
        let dir = [-0.5, 0.5, -0.5, 0.5];
        let z = (0..4000)
            .map(|i| {
                let t = i as f64 * 0.005;
                let z: [f64; N_FACTORS] = std::array::from_fn(|k| centroid[k] + t * dir[k]);
                z
            })
            .find(|z| m.extrapolation_ratio(z).map_or(false, |(_, _, r)| r > 1.55 && r < 1.95))
            .unwrap();

        let r = m.predict_z(&z);
        assert_eq!(r.confidence, ConfidenceLevel::Medium);
        let w = r.extrapolation.unwrap();
        assert!((w.interval_widening - w.ratio / 1.5).abs() < 1e-12);
        assert!(w.interval_widening > 1.0);

        let (lo, hi) = m.bootstrap_interval(&z).unwrap();
        let iv = r.interval.unwrap();
        assert!(iv.lower > FINISH_FLOOR, "floor would hide the widening: {:?}", iv);
        assert!((iv.upper - iv.lower - w.interval_widening * (hi - lo)).abs() < 1e-9);
        assert!(iv.upper - iv.lower > hi - lo);
    }

    #[test]
    fn small_fields_skip_collapsed_resamples() {
        for n in 6..=8 {
            let pop = population(n);
            let m = FactorModel::fit(&pop, names(), &ModelConfig::default()).unwrap();
            assert!(m.ensemble.failed > 0, "n = {}", n);
            assert!(!m.ensemble.fits.is_empty(), "n = {}", n);
            for (_, b) in &m.ensemble.fits {
                assert!(b.iter().all(|c| c.abs() < 50.0), "n = {}: {:?}", n, b);
            }
            let iv = m.predict(&pop[0]).interval.unwrap();
            assert!(iv.upper < 15.0 && iv.upper - iv.lower < 10.0, "n = {}: {:?}", n, iv);
        }
    }

    #[test]
    fn repeated_rows_are_a_degenerate_design() {
        let pop = population(4);
        let mut x: Vec<[f64; N_FACTORS]> = pop.iter().map(|p| p.z_scores()).collect();
        x.extend_from_within(0..2);
        let y = vec![5.0, 6.0, 7.0, 8.0, 5.0, 6.0];
        assert!(matches!(fit_ols(&x, &y), Err(ModelError::Degenerate(_))));
    }

    #[test]
    fn adjusting_without_training_percentiles_names_the_factor() {
        let m = FactorModel::from_impacts(10.0, [1.0; N_FACTORS], &[], names(), &ModelConfig::default());
        let p = profile(9, [0.0; N_FACTORS], None);
        assert!(matches!(m.predict_adjusted(&p, [5.0, 0.0, 0.0, 0.0]), Err(ModelError::EmptyPercentileMap(0))));
    }
}
