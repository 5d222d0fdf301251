//! Seasonal plan-error table.
//!
//! Accumulates plan errors (actual slot-0 cost minus planned slot-0 cost, EUR)
//! in a 48-cell table keyed by (season, four-hour bucket, weekend). Cells with
//! enough samples yield a correction the planner adds to its expected prices.
//!
//! Sign convention: positive mean error means the plan was optimistic.

use chrono::{DateTime, Datelike, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

use crate::persist;

pub const SEASONAL_MODEL_VERSION: u32 = 1;

/// Samples a cell needs before its mean is trusted
pub const MIN_SAMPLES: u64 = 10;

const PERSIST_INTERVAL: u64 = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeasonalCell {
    pub sum_error: f64,
    pub count: u64,
    pub mean_error: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SeasonalModel {
    version: u32,
    cells: BTreeMap<String, SeasonalCell>,
}

/// Meteorological season index: 0 winter (DJF), 1 spring, 2 summer, 3 autumn.
/// The naive (month-1)/3 would put December into autumn.
fn season_of_month(month: u32) -> u32 {
    match month {
        12 | 1 | 2 => 0,
        3..=5 => 1,
        6..=8 => 2,
        9..=11 => 3,
        other => unreachable!("chrono month out of range: {other}"),
    }
}

fn cell_key_for(dt: DateTime<Utc>) -> String {
    let season = season_of_month(dt.month());
    let period = dt.hour() / 4;
    let weekend = u32::from(dt.weekday().number_from_monday() >= 6);
    format!("s{season}_t{period}_w{weekend}")
}

struct Inner {
    cells: BTreeMap<String, SeasonalCell>,
    update_count: u64,
}

pub struct SeasonalBiasTable {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl SeasonalBiasTable {
    pub fn new(path: PathBuf) -> Self {
        let cells = persist::load_model::<SeasonalModel>(&path, SEASONAL_MODEL_VERSION)
            .map(|m| m.cells)
            .unwrap_or_default();
        Self { path, inner: Mutex::new(Inner { cells, update_count: 0 }) }
    }

    /// Record one plan error observation for the cell covering `dt`.
    pub fn update(&self, dt: DateTime<Utc>, plan_error_eur: f64) {
        let key = cell_key_for(dt);

        let model_snapshot = {
            let mut inner = self.inner.lock();
            let cell = inner.cells.entry(key).or_default();
            cell.sum_error += plan_error_eur;
            cell.count += 1;
            cell.mean_error = cell.sum_error / cell.count as f64;

            inner.update_count += 1;
            (inner.update_count % PERSIST_INTERVAL == 0).then(|| Self::build_model(&inner))
        };

        if let Some(model) = model_snapshot {
            if let Err(e) = persist::write_model(&self.path, &model) {
                warn!(error = %e, "seasonal model persist failed");
            }
        }
    }

    /// Mean plan error for the cell covering `dt`, or `None` below
    /// [`MIN_SAMPLES`] observations.
    pub fn correction(&self, dt: DateTime<Utc>) -> Option<f64> {
        self.correction_with_min_samples(dt, MIN_SAMPLES)
    }

    pub fn correction_with_min_samples(&self, dt: DateTime<Utc>, min_samples: u64) -> Option<f64> {
        let key = cell_key_for(dt);
        let inner = self.inner.lock();
        inner
            .cells
            .get(&key)
            .filter(|c| c.count >= min_samples)
            .map(|c| c.mean_error)
    }

    pub fn cell(&self, dt: DateTime<Utc>) -> SeasonalCell {
        let key = cell_key_for(dt);
        self.inner.lock().cells.get(&key).cloned().unwrap_or_default()
    }

    pub fn populated_cell_count(&self) -> usize {
        self.inner.lock().cells.values().filter(|c| c.count > 0).count()
    }

    pub fn all_cells(&self) -> BTreeMap<String, SeasonalCell> {
        self.inner.lock().cells.clone()
    }

    pub fn save(&self) {
        let model = {
            let inner = self.inner.lock();
            Self::build_model(&inner)
        };
        if let Err(e) = persist::write_model(&self.path, &model) {
            warn!(error = %e, "seasonal model persist failed");
        }
    }

    fn build_model(inner: &Inner) -> SeasonalModel {
        SeasonalModel { version: SEASONAL_MODEL_VERSION, cells: inner.cells.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn table() -> (tempfile::TempDir, SeasonalBiasTable) {
        let dir = tempfile::tempdir().unwrap();
        let t = SeasonalBiasTable::new(dir.path().join("seasonal.json"));
        (dir, t)
    }

    #[test]
    fn december_is_winter() {
        assert_eq!(season_of_month(12), 0);
        assert_eq!(season_of_month(1), 0);
        assert_eq!(season_of_month(6), 2);
        assert_eq!(season_of_month(11), 3);
    }

    #[test]
    fn cell_key_distinguishes_weekend() {
        // 2024-06-01 is a Saturday, 2024-06-03 a Monday
        let sat = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let mon = Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap();
        assert_eq!(cell_key_for(sat), "s2_t2_w1");
        assert_eq!(cell_key_for(mon), "s2_t2_w0");
    }

    #[test]
    fn mean_is_exactly_sum_over_count() {
        let (_d, t) = table();
        let dt = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let errors = [0.05, -0.02, 0.11, 0.0, -0.07];
        for e in errors {
            t.update(dt, e);
        }
        let cell = t.cell(dt);
        assert_eq!(cell.count, errors.len() as u64);
        let sum: f64 = errors.iter().sum();
        assert_eq!(cell.sum_error, sum);
        assert_eq!(cell.mean_error, sum / errors.len() as f64);
    }

    #[test]
    fn correction_requires_min_samples() {
        let (_d, t) = table();
        let dt = Utc.with_ymd_and_hms(2024, 7, 10, 13, 0, 0).unwrap();
        for _ in 0..9 {
            t.update(dt, 0.03);
        }
        assert!(t.correction(dt).is_none());
        t.update(dt, 0.03);
        let corr = t.correction(dt).unwrap();
        assert!((corr - 0.03).abs() < 1e-12);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seasonal.json");
        let dt = Utc.with_ymd_and_hms(2024, 3, 5, 5, 0, 0).unwrap();
        {
            let t = SeasonalBiasTable::new(path.clone());
            for _ in 0..12 {
                t.update(dt, 0.02);
            }
            t.save();
        }
        let reloaded = SeasonalBiasTable::new(path);
        assert_eq!(reloaded.cell(dt).count, 12);
        assert!(reloaded.correction(dt).is_some());
    }
}
