//! PV and consumption forecasting.
//!
//! The PV forecast is sourced from evcc's solar tariff and corrected by a
//! learned actual/forecast ratio. The consumption forecast is a learned
//! 96-slot daily load profile. Both models persist across restarts.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

use crate::domain::{solar_values_are_watts, TariffSlot, HORIZON_SLOTS};
use crate::persist;

pub const PV_MODEL_VERSION: u32 = 1;
pub const CONSUMPTION_MODEL_VERSION: u32 = 1;

/// EMA weight for correction-factor updates
const CORRECTION_ALPHA: f64 = 0.1;

/// Correction factor bounds; beyond this the source data is the problem
const CORRECTION_MIN: f64 = 0.5;
const CORRECTION_MAX: f64 = 2.0;

/// Baseline load (W) before the profile has learned anything
const DEFAULT_LOAD_W: f64 = 1200.0;

fn slot_of_day(ts: DateTime<Utc>) -> usize {
    (ts.hour() as usize * 4 + ts.minute() as usize / 15) % HORIZON_SLOTS
}

// ---------------------------------------------------------------------------
// PV
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct PvModel {
    version: u32,
    correction_factor: f64,
    samples: u64,
}

struct PvInner {
    correction_factor: f64,
    samples: u64,
}

pub struct PvForecaster {
    path: PathBuf,
    inner: Mutex<PvInner>,
}

impl PvForecaster {
    pub fn new(path: PathBuf) -> Self {
        let (correction_factor, samples) =
            match persist::load_model::<PvModel>(&path, PV_MODEL_VERSION) {
                Some(m) => (m.correction_factor.clamp(CORRECTION_MIN, CORRECTION_MAX), m.samples),
                None => (1.0, 0),
            };
        Self { path, inner: Mutex::new(PvInner { correction_factor, samples }) }
    }

    /// Map the evcc solar forecast onto 96 15-min kW slots starting at `now`,
    /// scaled by the learned correction factor.
    pub fn forecast_96(&self, solar: &[TariffSlot], now: DateTime<Utc>) -> Vec<f64> {
        let correction = self.inner.lock().correction_factor;
        let to_kw = if solar_values_are_watts(solar) { 0.001 } else { 1.0 };

        let mut out = vec![0.0; HORIZON_SLOTS];
        for (i, slot_value) in out.iter_mut().enumerate() {
            let slot_start = now + chrono::Duration::minutes(15 * i as i64);
            if let Some(entry) =
                solar.iter().find(|s| s.start <= slot_start && slot_start < s.end)
            {
                *slot_value = (entry.value * to_kw * correction).max(0.0);
            }
        }
        out
    }

    /// Update the actual/forecast ratio EMA. Skipped at negligible forecast
    /// power, where the ratio is noise.
    pub fn update_correction(&self, actual_kw: f64, forecast_kw: f64) {
        if forecast_kw <= 0.1 {
            return;
        }
        let ratio = (actual_kw / forecast_kw).clamp(CORRECTION_MIN, CORRECTION_MAX);
        let model = {
            let mut inner = self.inner.lock();
            inner.correction_factor = (CORRECTION_ALPHA * ratio
                + (1.0 - CORRECTION_ALPHA) * inner.correction_factor)
                .clamp(CORRECTION_MIN, CORRECTION_MAX);
            inner.samples += 1;
            PvModel {
                version: PV_MODEL_VERSION,
                correction_factor: inner.correction_factor,
                samples: inner.samples,
            }
        };
        if let Err(e) = persist::write_model(&self.path, &model) {
            warn!(error = %e, "pv model persist failed");
        }
    }

    pub fn correction_factor(&self) -> f64 {
        self.inner.lock().correction_factor
    }
}

// ---------------------------------------------------------------------------
// Consumption
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct ConsumptionModel {
    version: u32,
    slot_means_w: Vec<f64>,
    slot_counts: Vec<u64>,
    data_days: u32,
    last_date: Option<NaiveDate>,
    correction_factor: f64,
}

struct ConsumptionInner {
    slot_means_w: Vec<f64>,
    slot_counts: Vec<u64>,
    data_days: u32,
    last_date: Option<NaiveDate>,
    correction_factor: f64,
}

pub struct ConsumptionForecaster {
    path: PathBuf,
    inner: Mutex<ConsumptionInner>,
}

impl ConsumptionForecaster {
    pub fn new(path: PathBuf) -> Self {
        let inner = match persist::load_model::<ConsumptionModel>(&path, CONSUMPTION_MODEL_VERSION)
        {
            Some(m) if m.slot_means_w.len() == HORIZON_SLOTS => ConsumptionInner {
                slot_means_w: m.slot_means_w,
                slot_counts: m.slot_counts,
                data_days: m.data_days,
                last_date: m.last_date,
                correction_factor: m.correction_factor.clamp(CORRECTION_MIN, CORRECTION_MAX),
            },
            _ => ConsumptionInner {
                slot_means_w: vec![0.0; HORIZON_SLOTS],
                slot_counts: vec![0; HORIZON_SLOTS],
                data_days: 0,
                last_date: None,
                correction_factor: 1.0,
            },
        };
        Self { path, inner: Mutex::new(inner) }
    }

    /// Fold one home-load observation (W) into the daily profile.
    pub fn update(&self, home_power_w: f64, now: DateTime<Utc>) {
        if !home_power_w.is_finite() || home_power_w < 0.0 {
            return;
        }
        let slot = slot_of_day(now);
        let today = NaiveDate::from_ymd_opt(now.year(), now.month(), now.day());

        let model = {
            let mut inner = self.inner.lock();
            let count = inner.slot_counts[slot] + 1;
            let mean = inner.slot_means_w[slot];
            inner.slot_means_w[slot] = mean + (home_power_w - mean) / count as f64;
            inner.slot_counts[slot] = count;

            if inner.last_date != today {
                if inner.last_date.is_some() {
                    inner.data_days += 1;
                }
                inner.last_date = today;
            }
            Self::build_model(&inner)
        };
        if let Err(e) = persist::write_model(&self.path, &model) {
            warn!(error = %e, "consumption model persist failed");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().data_days >= 1
    }

    pub fn data_days(&self) -> u32 {
        self.inner.lock().data_days
    }

    /// 96-slot load forecast (W) starting at the current slot. Slots the
    /// profile has never seen fall back to the baseline.
    pub fn forecast_96(&self, now: DateTime<Utc>) -> Vec<f64> {
        let inner = self.inner.lock();
        let start = slot_of_day(now);
        (0..HORIZON_SLOTS)
            .map(|i| {
                let slot = (start + i) % HORIZON_SLOTS;
                let base = if inner.slot_counts[slot] == 0 {
                    DEFAULT_LOAD_W
                } else {
                    inner.slot_means_w[slot]
                };
                base * inner.correction_factor
            })
            .collect()
    }

    /// Immediate self-correction from the current slot's actual vs forecast.
    pub fn apply_correction(&self, actual_w: f64, forecast_w: f64) {
        if forecast_w <= 100.0 {
            return;
        }
        let ratio = (actual_w / forecast_w).clamp(CORRECTION_MIN, CORRECTION_MAX);
        let model = {
            let mut inner = self.inner.lock();
            inner.correction_factor = (CORRECTION_ALPHA * ratio
                + (1.0 - CORRECTION_ALPHA) * inner.correction_factor)
                .clamp(CORRECTION_MIN, CORRECTION_MAX);
            Self::build_model(&inner)
        };
        if let Err(e) = persist::write_model(&self.path, &model) {
            warn!(error = %e, "consumption model persist failed");
        }
    }

    fn build_model(inner: &ConsumptionInner) -> ConsumptionModel {
        ConsumptionModel {
            version: CONSUMPTION_MODEL_VERSION,
            slot_means_w: inner.slot_means_w.clone(),
            slot_counts: inner.slot_counts.clone(),
            data_days: inner.data_days,
            last_date: inner.last_date,
            correction_factor: inner.correction_factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn slot_of_day_maps_quarter_hours() {
        assert_eq!(slot_of_day(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()), 0);
        assert_eq!(slot_of_day(Utc.with_ymd_and_hms(2024, 6, 1, 0, 15, 0).unwrap()), 1);
        assert_eq!(slot_of_day(Utc.with_ymd_and_hms(2024, 6, 1, 23, 45, 0).unwrap()), 95);
    }

    #[test]
    fn pv_forecast_aligns_solar_slots() {
        let dir = tempfile::tempdir().unwrap();
        let pv = PvForecaster::new(dir.path().join("pv.json"));
        let solar = vec![TariffSlot {
            start: noon(),
            end: noon() + Duration::hours(1),
            value: 3.0, // kW
        }];
        let forecast = pv.forecast_96(&solar, noon());
        assert_eq!(forecast[0], 3.0);
        assert_eq!(forecast[3], 3.0);
        assert_eq!(forecast[4], 0.0);
    }

    #[test]
    fn pv_watt_values_are_converted() {
        let dir = tempfile::tempdir().unwrap();
        let pv = PvForecaster::new(dir.path().join("pv.json"));
        let solar = vec![TariffSlot {
            start: noon(),
            end: noon() + Duration::hours(1),
            value: 3000.0, // W (median > 100)
        }];
        let forecast = pv.forecast_96(&solar, noon());
        assert!((forecast[0] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn pv_correction_tracks_overforecast() {
        let dir = tempfile::tempdir().unwrap();
        let pv = PvForecaster::new(dir.path().join("pv.json"));
        for _ in 0..50 {
            pv.update_correction(1.0, 2.0); // actual half of forecast
        }
        assert!(pv.correction_factor() < 0.7);
        assert!(pv.correction_factor() >= CORRECTION_MIN);
    }

    #[test]
    fn consumption_profile_learns_and_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let c = ConsumptionForecaster::new(dir.path().join("consumption.json"));
        c.update(2000.0, noon());
        let forecast = c.forecast_96(noon());
        assert!((forecast[0] - 2000.0).abs() < 1e-9);
        // Unseen slot falls back to baseline
        assert!((forecast[10] - DEFAULT_LOAD_W).abs() < 1e-9);
    }

    #[test]
    fn consumption_ready_after_two_dates() {
        let dir = tempfile::tempdir().unwrap();
        let c = ConsumptionForecaster::new(dir.path().join("consumption.json"));
        c.update(1000.0, noon());
        assert!(!c.is_ready());
        c.update(1000.0, noon() + Duration::days(1));
        assert!(c.is_ready());
        assert_eq!(c.data_days(), 1);
    }

    #[test]
    fn consumption_persists_profile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consumption.json");
        {
            let c = ConsumptionForecaster::new(path.clone());
            c.update(1500.0, noon());
        }
        let c = ConsumptionForecaster::new(path);
        assert!((c.forecast_96(noon())[0] - 1500.0).abs() < 1e-9);
    }

    #[test]
    fn negative_load_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let c = ConsumptionForecaster::new(dir.path().join("consumption.json"));
        c.update(-500.0, noon());
        assert!((c.forecast_96(noon())[0] - DEFAULT_LOAD_W).abs() < 1e-9);
    }
}
