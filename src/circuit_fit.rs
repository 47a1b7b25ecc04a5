use crate::factors::N_FACTORS;
use crate::normalize::{DriverAggregateProfile, PercentileTable};
use serde::{Deserialize, Serialize};

/// How much each factor matters at one circuit, in factor order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDemand {
    pub weights: [f64; N_FACTORS],
}

impl TrackDemand {
    /// Clamps negatives to zero and rescales to sum 1. All-zero input becomes uniform.
    pub fn new(weights: [f64; N_FACTORS]) -> Self {
        let w = weights.map(|v| if v.is_finite() { v.max(0.0) } else { 0.0 });
        let total: f64 = w.iter().sum();
        if total <= f64::EPSILON {
            return Self { weights: [1.0 / N_FACTORS as f64; N_FACTORS] };
        }
        Self { weights: w.map(|v| v / total) }
    }

    /// Config files carry raw weights; this applies the same cleaning as `new`.
    pub fn normalized(&self) -> Self {
        Self::new(self.weights)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitFit {
    pub driver: u32,
    /// 0-100
    pub score: f64,
}

pub fn fit_score(profile: &DriverAggregateProfile, demand: &TrackDemand) -> f64 {
    let d = demand.normalized();
    profile.percentiles().iter().zip(d.weights).map(|(p, w)| p * w).sum()
}

/// Best fit first; equal scores fall back to driver number.
pub fn rank_drivers_for_track(table: &PercentileTable, demand: &TrackDemand) -> Vec<CircuitFit> {
    let mut fits: Vec<CircuitFit> = table
        .drivers
        .iter()
        .map(|p| CircuitFit { driver: p.driver, score: fit_score(p, demand) })
        .collect();
    fits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.driver.cmp(&b.driver)));
    fits
}
