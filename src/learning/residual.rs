//! Residual learner: shadow/advisory price-threshold deltas.
//!
//! The agent never chooses dispatch. Its action is a pair of signed deltas
//! (ct/kWh) added to the planner's battery and EV price limits, drawn from a
//! small discrete set via ε-greedy selection over a tabular state-action
//! value. In shadow mode it only records what it would have done; advisory
//! mode is reached exclusively through an audited promotion. The advise and
//! apply call sites are separate on purpose: shadow output cannot reach
//! dispatch by construction.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::LearnerMode;
use crate::domain::{PlanAction, SystemState};
use crate::persist;

pub const RESIDUAL_MODEL_VERSION: u32 = 1;

/// Signed threshold deltas in ct/kWh, applied to battery and EV independently
pub const DELTA_OPTIONS_CT: [f64; 5] = [-5.0, -2.0, 0.0, 2.0, 5.0];

const N_DELTAS: usize = DELTA_OPTIONS_CT.len();
const N_ACTIONS: usize = N_DELTAS * N_DELTAS;

const LEARNING_RATE: f64 = 0.1;
const EPSILON_DECAY: f64 = 0.999;
const EPSILON_FLOOR: f64 = 0.01;
const SHADOW_LOG_CAP: usize = 2000;
const PERSIST_EVERY_STEPS: u64 = 50;

/// Days of shadow operation required before a promotion audit may pass
pub const PROMOTION_SHADOW_DAYS: f64 = 30.0;

/// Audit bound on the mean |delta| over the shadow log (ct/kWh)
const AUDIT_MAX_MEAN_DELTA_CT: f64 = 3.0;
/// Audit bound on |bat|+|ev| of any cell's greedy action (ct/kWh)
const AUDIT_MAX_CELL_DELTA_CT: f64 = 10.0;

/// One ε-greedy pick, fed back into `record_shadow`/`apply`/`learn`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaSelection {
    pub bat_delta_ct: f64,
    pub ev_delta_ct: f64,
    pub action_idx: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShadowEntry {
    ts: DateTime<Utc>,
    state_key: String,
    bat_delta_ct: f64,
    ev_delta_ct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub samples: usize,
    pub mean_abs_delta_ct: f64,
    pub max_cell_delta_ct: f64,
    pub win_rate: f64,
    pub shadow_days: f64,
    pub passed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResidualModel {
    version: u32,
    mode: String,
    epsilon: f64,
    total_steps: u64,
    wins: u64,
    losses: u64,
    shadow_since: Option<DateTime<Utc>>,
    q: BTreeMap<String, Vec<f64>>,
    shadow_log: Vec<ShadowEntry>,
}

struct Inner {
    mode: LearnerMode,
    epsilon: f64,
    total_steps: u64,
    wins: u64,
    losses: u64,
    shadow_since: Option<DateTime<Utc>>,
    q: BTreeMap<String, Vec<f64>>,
    shadow_log: VecDeque<ShadowEntry>,
}

pub struct ResidualLearner {
    path: PathBuf,
    promotion_win_rate: f64,
    inner: Mutex<Inner>,
}

impl ResidualLearner {
    pub fn new(path: PathBuf, configured_mode: LearnerMode, epsilon: f64, promotion_win_rate: f64) -> Self {
        let mut inner = Inner {
            mode: configured_mode,
            epsilon,
            total_steps: 0,
            wins: 0,
            losses: 0,
            shadow_since: None,
            q: BTreeMap::new(),
            shadow_log: VecDeque::new(),
        };

        if let Some(model) = persist::load_model::<ResidualModel>(&path, RESIDUAL_MODEL_VERSION) {
            // A persisted advisory promotion survives restarts unless the user
            // disabled the learner outright.
            if configured_mode != LearnerMode::Disabled {
                inner.mode = match model.mode.as_str() {
                    "advisory" => LearnerMode::Advisory,
                    _ => configured_mode,
                };
            }
            inner.epsilon = model.epsilon;
            inner.total_steps = model.total_steps;
            inner.wins = model.wins;
            inner.losses = model.losses;
            inner.shadow_since = model.shadow_since;
            inner.q = model
                .q
                .into_iter()
                .filter(|(_, values)| values.len() == N_ACTIONS)
                .collect();
            inner.shadow_log = model.shadow_log.into_iter().collect();
        }

        if inner.mode == LearnerMode::Shadow && inner.shadow_since.is_none() {
            inner.shadow_since = Some(Utc::now());
        }

        Self { path, promotion_win_rate, inner: Mutex::new(inner) }
    }

    pub fn mode(&self) -> LearnerMode {
        self.inner.lock().mode
    }

    pub fn epsilon(&self) -> f64 {
        self.inner.lock().epsilon
    }

    pub fn total_steps(&self) -> u64 {
        self.inner.lock().total_steps
    }

    /// Quantised state key: SoC in 20-pp buckets, current price positioned
    /// among the forward percentiles, time of day in four-hour buckets.
    pub fn state_key(state: &SystemState) -> String {
        let soc_bucket = ((state.battery_soc / 20.0) as usize).min(4);
        let price_bucket = [20u8, 40, 60, 80]
            .into_iter()
            .filter(|p| {
                state
                    .price_percentiles
                    .get(p)
                    .is_some_and(|threshold| state.current_price > *threshold)
            })
            .count();
        let hour = state.timestamp.map_or(0, |t| {
            use chrono::Timelike;
            t.hour()
        });
        let time_bucket = hour / 4;
        format!("s{soc_bucket}_p{price_bucket}_t{time_bucket}")
    }

    /// ε-greedy pick of a delta pair for the given state.
    pub fn select(&self, state: &SystemState) -> DeltaSelection {
        let key = Self::state_key(state);
        let mut inner = self.inner.lock();
        let epsilon = inner.epsilon;
        let values = inner.q.entry(key).or_insert_with(|| vec![0.0; N_ACTIONS]);

        let mut rng = rand::thread_rng();
        let action_idx = if rng.gen::<f64>() < epsilon {
            rng.gen_range(0..N_ACTIONS)
        } else {
            greedy_action(values)
        };

        DeltaSelection {
            bat_delta_ct: DELTA_OPTIONS_CT[action_idx / N_DELTAS],
            ev_delta_ct: DELTA_OPTIONS_CT[action_idx % N_DELTAS],
            action_idx,
        }
    }

    /// Shadow mode: log the correction that would have been applied.
    /// The plan itself is never touched from here.
    pub fn record_shadow(&self, state: &SystemState, selection: DeltaSelection) {
        let entry = ShadowEntry {
            ts: Utc::now(),
            state_key: Self::state_key(state),
            bat_delta_ct: selection.bat_delta_ct,
            ev_delta_ct: selection.ev_delta_ct,
        };
        let mut inner = self.inner.lock();
        if inner.shadow_log.len() == SHADOW_LOG_CAP {
            inner.shadow_log.pop_front();
        }
        inner.shadow_log.push_back(entry);
    }

    /// Advisory mode: return the plan action with adjusted price limits.
    pub fn apply(&self, action: &PlanAction, selection: DeltaSelection) -> PlanAction {
        let mut adjusted = *action;
        adjusted.battery_limit_eur = action
            .battery_limit_eur
            .map(|limit| (limit + selection.bat_delta_ct / 100.0).max(0.0));
        adjusted.ev_limit_eur = action
            .ev_limit_eur
            .map(|limit| (limit + selection.ev_delta_ct / 100.0).max(0.0));
        adjusted
    }

    /// Reward: negative normalised plan error for slot 0. Plan cheaper than
    /// reality is punished, reality cheaper than plan is rewarded.
    pub fn reward(plan_slot0_cost: f64, actual_slot0_cost: f64) -> f64 {
        let scale = plan_slot0_cost.abs().max(0.05);
        (-(actual_slot0_cost - plan_slot0_cost) / scale).clamp(-1.0, 1.0)
    }

    /// One tabular update for the (state, action) actually selected this cycle.
    pub fn learn(&self, state: &SystemState, selection: DeltaSelection, reward: f64) {
        let key = Self::state_key(state);
        let model_snapshot = {
            let mut inner = self.inner.lock();
            let values = inner.q.entry(key).or_insert_with(|| vec![0.0; N_ACTIONS]);
            let current = values[selection.action_idx];
            values[selection.action_idx] = current + LEARNING_RATE * (reward - current);

            if reward > 0.0 {
                inner.wins += 1;
            } else if reward < 0.0 {
                inner.losses += 1;
            }
            inner.total_steps += 1;
            inner.epsilon = (inner.epsilon * EPSILON_DECAY).max(EPSILON_FLOOR);

            (inner.total_steps % PERSIST_EVERY_STEPS == 0).then(|| Self::build_model(&inner))
        };

        if let Some(model) = model_snapshot {
            if let Err(e) = persist::write_model(&self.path, &model) {
                warn!(error = %e, "residual model persist failed");
            }
        }
    }

    pub fn shadow_elapsed_days(&self) -> f64 {
        let inner = self.inner.lock();
        inner
            .shadow_since
            .map_or(0.0, |since| (Utc::now() - since).num_seconds() as f64 / 86_400.0)
    }

    /// Constraint audit over the shadow log and Q-table.
    pub fn run_audit(&self) -> AuditReport {
        let inner = self.inner.lock();

        let samples = inner.shadow_log.len();
        let mean_abs_delta_ct = if samples == 0 {
            0.0
        } else {
            inner
                .shadow_log
                .iter()
                .map(|e| (e.bat_delta_ct.abs() + e.ev_delta_ct.abs()) / 2.0)
                .sum::<f64>()
                / samples as f64
        };

        let max_cell_delta_ct = inner
            .q
            .values()
            .map(|values| {
                let idx = greedy_action(values);
                DELTA_OPTIONS_CT[idx / N_DELTAS].abs() + DELTA_OPTIONS_CT[idx % N_DELTAS].abs()
            })
            .fold(0.0, f64::max);

        let decided = inner.wins + inner.losses;
        let win_rate = if decided == 0 { 0.0 } else { inner.wins as f64 / decided as f64 };

        let shadow_days = inner
            .shadow_since
            .map_or(0.0, |since| (Utc::now() - since).num_seconds() as f64 / 86_400.0);

        let passed = shadow_days >= PROMOTION_SHADOW_DAYS
            && samples > 0
            && mean_abs_delta_ct <= AUDIT_MAX_MEAN_DELTA_CT
            && max_cell_delta_ct <= AUDIT_MAX_CELL_DELTA_CT
            && win_rate >= self.promotion_win_rate;

        AuditReport { samples, mean_abs_delta_ct, max_cell_delta_ct, win_rate, shadow_days, passed }
    }

    /// Promote shadow -> advisory when the audit passed. Persists immediately.
    pub fn maybe_promote(&self, report: &AuditReport) -> bool {
        if !report.passed {
            return false;
        }
        let model = {
            let mut inner = self.inner.lock();
            if inner.mode != LearnerMode::Shadow {
                return false;
            }
            inner.mode = LearnerMode::Advisory;
            Self::build_model(&inner)
        };
        info!(
            win_rate = report.win_rate,
            shadow_days = report.shadow_days,
            "residual learner promoted to advisory mode"
        );
        if let Err(e) = persist::write_model(&self.path, &model) {
            warn!(error = %e, "residual model persist failed");
        }
        true
    }

    pub fn save(&self) {
        let model = {
            let inner = self.inner.lock();
            Self::build_model(&inner)
        };
        if let Err(e) = persist::write_model(&self.path, &model) {
            warn!(error = %e, "residual model persist failed");
        }
    }

    fn build_model(inner: &Inner) -> ResidualModel {
        ResidualModel {
            version: RESIDUAL_MODEL_VERSION,
            mode: match inner.mode {
                LearnerMode::Shadow => "shadow".to_string(),
                LearnerMode::Advisory => "advisory".to_string(),
                LearnerMode::Disabled => "disabled".to_string(),
            },
            epsilon: inner.epsilon,
            total_steps: inner.total_steps,
            wins: inner.wins,
            losses: inner.losses,
            shadow_since: inner.shadow_since,
            q: inner.q.clone(),
            shadow_log: inner.shadow_log.iter().cloned().collect(),
        }
    }
}

fn greedy_action(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(0, |(idx, _)| idx)
}
