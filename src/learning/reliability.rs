//! Per-source rolling forecast MAE with derived confidence factors.
//!
//! Tracks the last 50 absolute errors for each forecast source and maps the
//! mean error onto a confidence in [0, 1] against a per-source reference
//! scale. Unit contract: PV errors in kW, consumption in W, price in EUR/kWh.
//! Callers convert `state.pv_power` (W) to kW before updating.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use tracing::warn;

use crate::persist;

pub const RELIABILITY_MODEL_VERSION: u32 = 1;

/// Rolling error samples retained per source (~12.5 h at 15-min cycles)
const WINDOW_SIZE: usize = 50;

/// Below this many samples the source is assumed reliable (confidence 1.0)
const MIN_SAMPLES_FOR_CONFIDENCE: usize = 5;

/// Persist every N updates to bound disk I/O
const PERSIST_INTERVAL: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForecastSource {
    Pv,
    Consumption,
    Price,
}

impl ForecastSource {
    /// Error magnitude treated as confidence-destroying for this source.
    fn reference_scale(self) -> f64 {
        match self {
            ForecastSource::Pv => 5.0,            // kW
            ForecastSource::Consumption => 2000.0, // W
            ForecastSource::Price => 0.10,         // EUR/kWh
        }
    }

    fn index(self) -> usize {
        match self {
            ForecastSource::Pv => 0,
            ForecastSource::Consumption => 1,
            ForecastSource::Price => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ForecastSource::Pv => "pv",
            ForecastSource::Consumption => "consumption",
            ForecastSource::Price => "price",
        }
    }
}

/// Confidence per source, handed to the planner and reserve-floor calculator.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConfidenceFactors {
    pub pv: f64,
    pub consumption: f64,
    pub price: f64,
}

impl Default for ConfidenceFactors {
    fn default() -> Self {
        Self { pv: 1.0, consumption: 1.0, price: 1.0 }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ReliabilityModel {
    version: u32,
    pv: Vec<f64>,
    consumption: Vec<f64>,
    price: Vec<f64>,
}

struct Inner {
    windows: [VecDeque<f64>; 3],
    update_count: u64,
}

pub struct ForecastReliabilityTracker {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl ForecastReliabilityTracker {
    pub fn new(path: PathBuf) -> Self {
        let mut windows: [VecDeque<f64>; 3] = Default::default();
        if let Some(model) =
            persist::load_model::<ReliabilityModel>(&path, RELIABILITY_MODEL_VERSION)
        {
            for (idx, errors) in
                [model.pv, model.consumption, model.price].into_iter().enumerate()
            {
                for err in errors.into_iter().filter(|e| e.is_finite() && *e >= 0.0) {
                    if windows[idx].len() == WINDOW_SIZE {
                        windows[idx].pop_front();
                    }
                    windows[idx].push_back(err);
                }
            }
        }
        Self { path, inner: Mutex::new(Inner { windows, update_count: 0 }) }
    }

    /// Record one |actual - forecast| observation for `source`.
    /// Persists every [`PERSIST_INTERVAL`] updates; file I/O runs outside the lock.
    pub fn update(&self, source: ForecastSource, actual: f64, forecast: f64) {
        let abs_error = (actual - forecast).abs();

        let model_snapshot = {
            let mut inner = self.inner.lock();
            let window = &mut inner.windows[source.index()];
            if window.len() == WINDOW_SIZE {
                window.pop_front();
            }
            window.push_back(abs_error);
            inner.update_count += 1;
            (inner.update_count % PERSIST_INTERVAL == 0).then(|| Self::build_model(&inner))
        };

        if let Some(model) = model_snapshot {
            if let Err(e) = persist::write_model(&self.path, &model) {
                warn!(error = %e, "reliability model persist failed");
            }
        }
    }

    /// Confidence for `source` in [0, 1]; 1.0 until enough samples exist.
    pub fn confidence(&self, source: ForecastSource) -> f64 {
        let inner = self.inner.lock();
        let window = &inner.windows[source.index()];
        if window.len() < MIN_SAMPLES_FOR_CONFIDENCE {
            return 1.0;
        }
        let mae: f64 = window.iter().sum::<f64>() / window.len() as f64;
        (1.0 - (mae / source.reference_scale()).min(1.0)).max(0.0)
    }

    pub fn all_confidences(&self) -> ConfidenceFactors {
        ConfidenceFactors {
            pv: self.confidence(ForecastSource::Pv),
            consumption: self.confidence(ForecastSource::Consumption),
            price: self.confidence(ForecastSource::Price),
        }
    }

    /// Persist immediately, bypassing the update interval.
    pub fn save(&self) {
        let model = {
            let inner = self.inner.lock();
            Self::build_model(&inner)
        };
        if let Err(e) = persist::write_model(&self.path, &model) {
            warn!(error = %e, "reliability model persist failed");
        }
    }

    fn build_model(inner: &Inner) -> ReliabilityModel {
        ReliabilityModel {
            version: RELIABILITY_MODEL_VERSION,
            pv: inner.windows[0].iter().copied().collect(),
            consumption: inner.windows[1].iter().copied().collect(),
            price: inner.windows[2].iter().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (tempfile::TempDir, ForecastReliabilityTracker) {
        let dir = tempfile::tempdir().unwrap();
        let t = ForecastReliabilityTracker::new(dir.path().join("reliability.json"));
        (dir, t)
    }

    #[test]
    fn confidence_is_one_below_min_samples() {
        let (_d, t) = tracker();
        for _ in 0..4 {
            t.update(ForecastSource::Pv, 10.0, 0.0);
        }
        assert_eq!(t.confidence(ForecastSource::Pv), 1.0);
    }

    #[test]
    fn perfect_forecasts_keep_full_confidence() {
        let (_d, t) = tracker();
        for _ in 0..10 {
            t.update(ForecastSource::Price, 0.25, 0.25);
        }
        assert_eq!(t.confidence(ForecastSource::Price), 1.0);
    }

    #[test]
    fn errors_at_reference_scale_zero_confidence() {
        let (_d, t) = tracker();
        for _ in 0..10 {
            t.update(ForecastSource::Pv, 5.0, 0.0);
        }
        assert_eq!(t.confidence(ForecastSource::Pv), 0.0);
    }

    #[test]
    fn confidence_non_increasing_in_error() {
        let (_d, a) = tracker();
        let (_d2, b) = tracker();
        for _ in 0..20 {
            a.update(ForecastSource::Consumption, 500.0, 0.0);
            b.update(ForecastSource::Consumption, 1500.0, 0.0);
        }
        assert!(a.confidence(ForecastSource::Consumption) > b.confidence(ForecastSource::Consumption));
    }

    #[test]
    fn window_is_bounded_at_fifty() {
        let (_d, t) = tracker();
        // 60 large errors then 50 zero errors: only the zeros remain
        for _ in 0..60 {
            t.update(ForecastSource::Pv, 5.0, 0.0);
        }
        for _ in 0..WINDOW_SIZE {
            t.update(ForecastSource::Pv, 1.0, 1.0);
        }
        assert_eq!(t.confidence(ForecastSource::Pv), 1.0);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reliability.json");
        {
            let t = ForecastReliabilityTracker::new(path.clone());
            for _ in 0..10 {
                t.update(ForecastSource::Price, 0.30, 0.10);
            }
            t.save();
        }
        let reloaded = ForecastReliabilityTracker::new(path);
        assert_eq!(reloaded.confidence(ForecastSource::Price), 0.0);
    }
}
