//! Dynamic reserve floor for the house battery.
//!
//! Recomputes the battery minimum reserve each cycle from PV forecast
//! confidence, price spread, and time of day. A 14-day observation phase
//! computes and logs without touching evcc; afterwards (or when the user
//! forces it) live mode pushes changed values downstream. The event log is
//! bounded and persisted.

use chrono::{DateTime, Duration, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use tracing::warn;

use crate::persist;

pub const BUFFER_MODEL_VERSION: u32 = 1;

/// Reserve never drops below this, regardless of inputs
const HARD_FLOOR_PCT: i64 = 10;

/// Practical minimum even at full confidence
const PRACTICAL_MIN_PCT: i64 = 20;

/// PV confidence above which reduction begins
const CONFIDENCE_REDUCTION_THRESHOLD: f64 = 0.65;

const OBSERVATION_PERIOD_DAYS: i64 = 14;

/// ~7 days of 15-min cycles
const MAX_LOG_ENTRIES: usize = 700;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferMode {
    Observation,
    Live,
}

/// One reserve adjustment event, logged in both modes for chart continuity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferEvent {
    pub ts: DateTime<Utc>,
    pub mode: BufferMode,
    pub pv_confidence: f64,
    pub price_spread_ct: f64,
    pub hour_of_day: u32,
    pub expected_pv_kw: f64,
    pub old_buffer_pct: i64,
    pub new_buffer_pct: i64,
    pub reason: String,
    /// false in observation mode
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    pub current_buffer_pct: i64,
    pub mode: BufferMode,
    pub days_remaining: Option<i64>,
    pub observation_live_at: Option<DateTime<Utc>>,
    /// Set when live mode wants a changed value pushed to evcc this cycle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply_pct: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BufferModel {
    version: u32,
    deployment_ts: Option<DateTime<Utc>>,
    live_override: Option<bool>,
    observation_extended_until: Option<DateTime<Utc>>,
    current_buffer_pct: i64,
    log: Vec<BufferEvent>,
}

struct Inner {
    deployment_ts: Option<DateTime<Utc>>,
    /// Some(true) = user forced live, Some(false) = user extended observation
    live_override: Option<bool>,
    observation_extended_until: Option<DateTime<Utc>>,
    current_buffer_pct: i64,
    log: VecDeque<BufferEvent>,
}

pub struct ReserveFloorCalc {
    path: PathBuf,
    base_min_soc: i64,
    inner: Mutex<Inner>,
}

impl ReserveFloorCalc {
    pub fn new(path: PathBuf, battery_min_soc: f64) -> Self {
        let base_min_soc = battery_min_soc.round() as i64;
        let mut inner = Inner {
            deployment_ts: None,
            live_override: None,
            observation_extended_until: None,
            current_buffer_pct: base_min_soc,
            log: VecDeque::new(),
        };
        if let Some(model) = persist::load_model::<BufferModel>(&path, BUFFER_MODEL_VERSION) {
            inner.deployment_ts = model.deployment_ts;
            inner.live_override = model.live_override;
            inner.observation_extended_until = model.observation_extended_until;
            inner.current_buffer_pct = model.current_buffer_pct;
            inner.log = model.log.into_iter().collect();
        }
        Self { path, base_min_soc, inner: Mutex::new(inner) }
    }

    /// One calculation cycle. `price_spread` in EUR/kWh, `pv_96` in kW.
    ///
    /// The returned status carries `apply_pct` when live mode changed the
    /// target; the caller pushes that to evcc (I/O stays out of here).
    pub fn step(
        &self,
        pv_confidence: f64,
        price_spread: f64,
        pv_96: &[f64],
        now: DateTime<Utc>,
    ) -> BufferStatus {
        let (status, model) = {
            let mut inner = self.inner.lock();

            let mode = Self::mode_locked(&mut inner, now);
            let target = self.compute_target(pv_confidence, price_spread, now);
            let old = inner.current_buffer_pct;

            let applied = mode == BufferMode::Live;
            let apply_pct = (applied && target != old).then_some(target);
            if apply_pct.is_some() {
                inner.current_buffer_pct = target;
            }

            let reason = build_reason(pv_confidence, price_spread, target, mode);
            let event = BufferEvent {
                ts: now,
                mode,
                pv_confidence,
                price_spread_ct: price_spread * 100.0,
                hour_of_day: now.hour(),
                expected_pv_kw: pv_96.iter().take(16).sum(),
                old_buffer_pct: old,
                new_buffer_pct: target,
                reason,
                applied,
            };
            if inner.log.len() == MAX_LOG_ENTRIES {
                inner.log.pop_front();
            }
            inner.log.push_back(event);

            let status = BufferStatus {
                current_buffer_pct: inner.current_buffer_pct,
                mode,
                days_remaining: (mode == BufferMode::Observation)
                    .then(|| Self::days_remaining_locked(&inner, now)),
                observation_live_at: Self::live_at_locked(&inner),
                apply_pct,
            };
            (status, Self::build_model(&inner))
        };

        if let Err(e) = persist::write_model(&self.path, &model) {
            warn!(error = %e, "buffer model persist failed");
        }
        status
    }

    /// Latest reserve value, used as the dynamic floor by the arbitrage gates.
    pub fn current_buffer_pct(&self) -> i64 {
        self.inner.lock().current_buffer_pct
    }

    pub fn activate_live(&self) {
        let model = {
            let mut inner = self.inner.lock();
            inner.live_override = Some(true);
            Self::build_model(&inner)
        };
        if let Err(e) = persist::write_model(&self.path, &model) {
            warn!(error = %e, "buffer model persist failed");
        }
    }

    pub fn extend_observation(&self, extra_days: i64) {
        let model = {
            let mut inner = self.inner.lock();
            inner.live_override = Some(false);
            inner.observation_extended_until = Some(Utc::now() + Duration::days(extra_days));
            Self::build_model(&inner)
        };
        if let Err(e) = persist::write_model(&self.path, &model) {
            warn!(error = %e, "buffer model persist failed");
        }
    }

    pub fn recent_events(&self, count: usize) -> Vec<BufferEvent> {
        let inner = self.inner.lock();
        inner.log.iter().rev().take(count).rev().cloned().collect()
    }

    /// Reserve formula: base minus confidence-scaled headroom with spread and
    /// morning bonuses, 5-pp hysteresis, practical and hard floors.
    fn compute_target(&self, confidence: f64, spread: f64, now: DateTime<Utc>) -> i64 {
        let base = self.base_min_soc;
        let headroom = (base - PRACTICAL_MIN_PCT).max(0);

        if confidence <= CONFIDENCE_REDUCTION_THRESHOLD || headroom == 0 {
            return base;
        }

        let conf_factor = (confidence - CONFIDENCE_REDUCTION_THRESHOLD)
            / (1.0 - CONFIDENCE_REDUCTION_THRESHOLD);
        let spread_bonus = if spread > 0.10 { 0.1 } else { 0.0 };
        let time_bonus = if (5..=10).contains(&now.hour()) { 0.1 } else { 0.0 };
        let total_factor = (conf_factor + spread_bonus + time_bonus).min(1.0);

        let reduction = (headroom as f64 * total_factor).round() as i64;
        let target = base - reduction;

        // Round to nearest 5 pp against oscillation
        let target = ((target as f64 / 5.0).round() * 5.0) as i64;

        target.max(PRACTICAL_MIN_PCT).max(HARD_FLOOR_PCT)
    }

    fn mode_locked(inner: &mut Inner, now: DateTime<Utc>) -> BufferMode {
        match inner.live_override {
            Some(true) => BufferMode::Live,
            Some(false) => {
                if inner
                    .observation_extended_until
                    .is_some_and(|until| now < until)
                {
                    BufferMode::Observation
                } else {
                    BufferMode::Live
                }
            }
            None => {
                let deployed = *inner.deployment_ts.get_or_insert(now);
                if now - deployed >= Duration::days(OBSERVATION_PERIOD_DAYS) {
                    BufferMode::Live
                } else {
                    BufferMode::Observation
                }
            }
        }
    }

    fn days_remaining_locked(inner: &Inner, now: DateTime<Utc>) -> i64 {
        match inner.deployment_ts {
            None => OBSERVATION_PERIOD_DAYS,
            Some(deployed) => {
                let elapsed_days = (now - deployed).num_days();
                (OBSERVATION_PERIOD_DAYS - elapsed_days).max(0)
            }
        }
    }

    fn live_at_locked(inner: &Inner) -> Option<DateTime<Utc>> {
        inner.deployment_ts.map(|t| t + Duration::days(OBSERVATION_PERIOD_DAYS))
    }

    fn build_model(inner: &Inner) -> BufferModel {
        BufferModel {
            version: BUFFER_MODEL_VERSION,
            deployment_ts: inner.deployment_ts,
            live_override: inner.live_override,
            observation_extended_until: inner.observation_extended_until,
            current_buffer_pct: inner.current_buffer_pct,
            log: inner.log.iter().cloned().collect(),
        }
    }
}

fn build_reason(confidence: f64, spread: f64, target: i64, mode: BufferMode) -> String {
    let mut parts = vec![format!("Konfidenz {:.0}%", confidence * 100.0)];
    if spread > 0.10 {
        parts.push(format!("Spread {:.0}ct", spread * 100.0));
    }
    parts.push(format!("Puffer {target}%"));
    if mode == BufferMode::Observation {
        parts.push("[Simulation]".to_string());
    }
    parts.join(" - ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn calc(min_soc: f64) -> (tempfile::TempDir, ReserveFloorCalc) {
        let dir = tempfile::tempdir().unwrap();
        let c = ReserveFloorCalc::new(dir.path().join("buffer.json"), min_soc);
        (dir, c)
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 7, 0, 0).unwrap()
    }

    #[test]
    fn low_confidence_keeps_base() {
        let (_d, c) = calc(30.0);
        assert_eq!(c.compute_target(0.5, 0.20, noon()), 30);
        assert_eq!(c.compute_target(0.65, 0.20, noon()), 30);
    }

    #[test]
    fn no_headroom_keeps_base() {
        let (_d, c) = calc(20.0);
        assert_eq!(c.compute_target(0.99, 0.20, morning()), 20);
    }

    #[test]
    fn full_confidence_reaches_practical_min() {
        let (_d, c) = calc(30.0);
        // conf 1.0 -> factor 1.0, reduction 10, target 20
        assert_eq!(c.compute_target(1.0, 0.0, noon()), 20);
    }

    #[test]
    fn bonuses_increase_reduction() {
        let (_d, c) = calc(30.0);
        // conf 0.8 -> factor ~0.43, alone: reduction 4 -> target 26 -> rounds to 25
        let plain = c.compute_target(0.8, 0.0, noon());
        // spread + morning add 0.2 -> factor ~0.63 -> reduction 6 -> 24 -> 25
        let boosted = c.compute_target(0.9, 0.2, morning());
        assert!(boosted <= plain);
        assert!(plain >= 20 && plain <= 30);
    }

    #[test]
    fn target_never_below_practical_min() {
        let (_d, c) = calc(60.0);
        let target = c.compute_target(1.0, 0.5, morning());
        assert!(target >= PRACTICAL_MIN_PCT);
    }

    #[test]
    fn observation_mode_never_applies() {
        let (_d, c) = calc(30.0);
        let status = c.step(1.0, 0.2, &[0.0; 96], noon());
        assert_eq!(status.mode, BufferMode::Observation);
        assert!(status.apply_pct.is_none());
        assert_eq!(status.days_remaining, Some(OBSERVATION_PERIOD_DAYS));
    }

    #[test]
    fn live_mode_applies_only_on_change() {
        let (_d, c) = calc(30.0);
        c.activate_live();
        let first = c.step(1.0, 0.2, &[0.0; 96], noon());
        assert_eq!(first.mode, BufferMode::Live);
        assert_eq!(first.apply_pct, Some(20));
        // Same inputs next cycle: no change, no push
        let second = c.step(1.0, 0.2, &[0.0; 96], noon() + Duration::minutes(15));
        assert!(second.apply_pct.is_none());
        assert_eq!(second.current_buffer_pct, 20);
    }

    #[test]
    fn observation_ends_after_period() {
        let (_d, c) = calc(30.0);
        let start = noon();
        c.step(0.5, 0.0, &[], start);
        let later = start + Duration::days(OBSERVATION_PERIOD_DAYS + 1);
        let status = c.step(0.5, 0.0, &[], later);
        assert_eq!(status.mode, BufferMode::Live);
    }

    #[test]
    fn extend_observation_holds_mode() {
        let (_d, c) = calc(30.0);
        let start = noon();
        c.step(0.5, 0.0, &[], start);
        c.extend_observation(30);
        let later = Utc::now() + Duration::days(20);
        let status = c.step(0.5, 0.0, &[], later);
        assert_eq!(status.mode, BufferMode::Observation);
    }

    #[test]
    fn event_log_is_bounded() {
        let (_d, c) = calc(30.0);
        for i in 0..(MAX_LOG_ENTRIES + 20) {
            c.step(0.5, 0.0, &[], noon() + Duration::minutes(i as i64));
        }
        assert!(c.recent_events(usize::MAX).len() <= MAX_LOG_ENTRIES);
    }

    #[test]
    fn persists_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json");
        {
            let c = ReserveFloorCalc::new(path.clone(), 30.0);
            c.activate_live();
            c.step(1.0, 0.2, &[0.0; 96], noon());
        }
        let reloaded = ReserveFloorCalc::new(path, 30.0);
        assert_eq!(reloaded.current_buffer_pct(), 20);
    }
}
