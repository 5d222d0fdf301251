//! Reaction-timing tracker: do plan/actual deviations self-correct?
//!
//! A deviation is a cycle where the planned action differs from the applied
//! action. If plan and actual align again on the very next cycle the episode
//! self-corrected; otherwise it needed intervention. An EMA of the
//! self-correction rate decides whether the loop should re-plan immediately.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

use crate::persist;

pub const REACTION_MODEL_VERSION: u32 = 1;

const EMA_ALPHA: f64 = 0.05;
const INITIAL_EMA: f64 = 0.5;
const WAIT_THRESHOLD: f64 = 0.6;
const MAX_EPISODES: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviationEpisode {
    pub timestamp: DateTime<Utc>,
    pub plan_action: String,
    pub actual_action: String,
    pub self_corrected: bool,
    /// 1 if resolved on the next cycle, 0 otherwise
    pub resolved_in_cycles: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReactionStats {
    pub ema_self_correction_rate: f64,
    pub wait_threshold: f64,
    pub total_episodes: usize,
    pub should_replan: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReactionModel {
    version: u32,
    ema_self_correction_rate: f64,
    wait_threshold: f64,
    episodes: Vec<DeviationEpisode>,
}

struct Inner {
    episodes: Vec<DeviationEpisode>,
    ema: f64,
    wait_threshold: f64,
    pending: Option<DeviationEpisode>,
}

pub struct ReactionTimingTracker {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl ReactionTimingTracker {
    pub fn new(path: PathBuf) -> Self {
        let (episodes, ema, wait_threshold) =
            match persist::load_model::<ReactionModel>(&path, REACTION_MODEL_VERSION) {
                Some(m) => (m.episodes, m.ema_self_correction_rate, m.wait_threshold),
                None => (Vec::new(), INITIAL_EMA, WAIT_THRESHOLD),
            };
        Self {
            path,
            inner: Mutex::new(Inner { episodes, ema, wait_threshold, pending: None }),
        }
    }

    /// Record one plan vs actual observation.
    ///
    /// Resolves a pending episode from the previous cycle first (aligned now
    /// means self-corrected), then opens a new pending episode if this cycle
    /// deviates.
    pub fn update(&self, plan_action: &str, actual_action: &str) {
        let model_snapshot = {
            let mut inner = self.inner.lock();
            let mut committed = false;

            if let Some(mut pending) = inner.pending.take() {
                let aligned = plan_action == actual_action;
                pending.self_corrected = aligned;
                pending.resolved_in_cycles = u8::from(aligned);

                let value = if aligned { 1.0 } else { 0.0 };
                inner.ema = EMA_ALPHA * value + (1.0 - EMA_ALPHA) * inner.ema;

                inner.episodes.push(pending);
                let len = inner.episodes.len();
                if len > MAX_EPISODES {
                    inner.episodes.drain(..len - MAX_EPISODES);
                }
                committed = true;
            }

            if plan_action != actual_action {
                inner.pending = Some(DeviationEpisode {
                    timestamp: Utc::now(),
                    plan_action: plan_action.to_string(),
                    actual_action: actual_action.to_string(),
                    self_corrected: false,
                    resolved_in_cycles: 0,
                });
            }

            committed.then(|| Self::build_model(&inner))
        };

        if let Some(model) = model_snapshot {
            if let Err(e) = persist::write_model(&self.path, &model) {
                warn!(error = %e, "reaction-timing model persist failed");
            }
        }
    }

    /// True when history says deviations usually do NOT self-correct.
    /// With no history the EMA starts neutral (0.5 < 0.6), so early cycles
    /// lean toward re-planning.
    pub fn should_replan_immediately(&self) -> bool {
        let inner = self.inner.lock();
        inner.ema < inner.wait_threshold
    }

    pub fn stats(&self) -> ReactionStats {
        let inner = self.inner.lock();
        ReactionStats {
            ema_self_correction_rate: inner.ema,
            wait_threshold: inner.wait_threshold,
            total_episodes: inner.episodes.len(),
            should_replan: inner.ema < inner.wait_threshold,
        }
    }

    pub fn save(&self) {
        let model = {
            let inner = self.inner.lock();
            Self::build_model(&inner)
        };
        if let Err(e) = persist::write_model(&self.path, &model) {
            warn!(error = %e, "reaction-timing model persist failed");
        }
    }

    fn build_model(inner: &Inner) -> ReactionModel {
        ReactionModel {
            version: REACTION_MODEL_VERSION,
            ema_self_correction_rate: inner.ema,
            wait_threshold: inner.wait_threshold,
            episodes: inner.episodes.clone(),
        }
    }
}
