//! Dispatches decisions to evcc.
//!
//! Owns the memory of what was last pushed so every downstream write is
//! change-only: limits, buffer values, and discharge control are re-sent only
//! when they differ from the previous cycle. Failures are logged and the
//! cycle continues; the next cycle retries naturally.

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::arbitrage::{AdaptiveLimits, ArbitrageCommand};
use crate::config::AppConfig;
use crate::domain::{BatteryAction, EvAction, PlanAction};
use crate::evcc::EvccClient;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct PushedState {
    bat_limit_eur: Option<f64>,
    ev_limit_eur: Option<f64>,
    arbitrage_active: bool,
    limits: Option<AdaptiveLimits>,
    buffer_soc: Option<i64>,
    discharge_control: Option<bool>,
}

pub struct Controller {
    base_floor_soc: i64,
    base_min_soc: i64,
    pushed: Mutex<PushedState>,
}

impl Controller {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            base_floor_soc: cfg.arbitrage.battery_to_ev_floor_soc.round() as i64,
            base_min_soc: cfg.battery.min_soc.round() as i64,
            pushed: Mutex::new(PushedState::default()),
        }
    }

    /// Apply the final per-cycle action: battery grid-charge limit and EV
    /// smart-cost limit, each only when changed.
    pub async fn apply(&self, evcc: &EvccClient, action: &PlanAction) {
        let bat_target = match action.battery_action {
            BatteryAction::Charge => action.battery_limit_eur,
            BatteryAction::Hold | BatteryAction::Discharge => None,
        };
        let ev_target = match action.ev_action {
            EvAction::Charge => action.ev_limit_eur,
            EvAction::Idle => None,
        };

        let (push_bat, push_ev) = {
            let pushed = self.pushed.lock();
            (
                !approx_eq_opt(pushed.bat_limit_eur, bat_target),
                !approx_eq_opt(pushed.ev_limit_eur, ev_target),
            )
        };

        if push_bat {
            let result = match bat_target {
                Some(limit) => evcc.set_battery_grid_charge_limit(limit).await,
                None => evcc.clear_battery_grid_charge_limit().await,
            };
            match result {
                Ok(()) => self.pushed.lock().bat_limit_eur = bat_target,
                Err(e) => warn!(error = %e, "battery limit push failed"),
            }
        }

        if push_ev {
            if let Some(limit) = ev_target {
                match evcc.set_smart_cost_limit(limit).await {
                    Ok(()) => self.pushed.lock().ev_limit_eur = ev_target,
                    Err(e) => warn!(error = %e, "EV limit push failed"),
                }
            } else {
                // No EV charge: leave the smart cost limit as-is; the mode
                // controller parks the loadpoint in pv mode.
                self.pushed.lock().ev_limit_eur = None;
            }
        }
    }

    /// Apply the arbitrage evaluator's verdict. Activation pushes the
    /// adaptive limits and frees battery discharge; deactivation after an
    /// active phase restores conservative defaults.
    pub async fn apply_arbitrage(&self, evcc: &EvccClient, command: ArbitrageCommand) {
        match command {
            ArbitrageCommand::Activate { usable_kwh, limits } => {
                let (was_active, limits_changed) = {
                    let pushed = self.pushed.lock();
                    (pushed.arbitrage_active, pushed.limits != Some(limits))
                };

                if !was_active {
                    info!(usable_kwh = format!("{usable_kwh:.1}"), "battery-to-EV activated");
                }
                if limits_changed {
                    self.push_limits(evcc, limits).await;
                }
                self.set_discharge_control(evcc, false).await;
                self.pushed.lock().arbitrage_active = true;
            }
            ArbitrageCommand::Deactivate => {
                let was_active = self.pushed.lock().arbitrage_active;
                if !was_active {
                    return;
                }
                info!("battery-to-EV deactivated, restoring defaults");
                let defaults = AdaptiveLimits {
                    priority_soc: self.base_floor_soc,
                    buffer_soc: self.base_min_soc,
                    buffer_start_soc: 0,
                };
                self.push_limits(evcc, defaults).await;
                self.set_discharge_control(evcc, true).await;
                self.pushed.lock().arbitrage_active = false;
            }
        }
    }

    /// Reserve-floor write path; deduplicated like everything else.
    pub async fn push_buffer_soc(&self, evcc: &EvccClient, pct: i64) {
        if self.pushed.lock().buffer_soc == Some(pct) {
            return;
        }
        match evcc.set_buffer_soc(pct).await {
            Ok(()) => self.pushed.lock().buffer_soc = Some(pct),
            Err(e) => warn!(error = %e, pct, "buffer SoC push failed"),
        }
    }

    pub fn arbitrage_active(&self) -> bool {
        self.pushed.lock().arbitrage_active
    }

    async fn push_limits(&self, evcc: &EvccClient, limits: AdaptiveLimits) {
        let mut all_ok = true;
        if let Err(e) = evcc.set_priority_soc(limits.priority_soc).await {
            warn!(error = %e, "priority SoC push failed");
            all_ok = false;
        }
        if let Err(e) = evcc.set_buffer_soc(limits.buffer_soc).await {
            warn!(error = %e, "buffer SoC push failed");
            all_ok = false;
        }
        if let Err(e) = evcc.set_buffer_start_soc(limits.buffer_start_soc).await {
            warn!(error = %e, "buffer start SoC push failed");
            all_ok = false;
        }
        let mut pushed = self.pushed.lock();
        if all_ok {
            pushed.limits = Some(limits);
            pushed.buffer_soc = Some(limits.buffer_soc);
        } else {
            // Partial push: forget state so the next cycle re-sends everything
            pushed.limits = None;
            pushed.buffer_soc = None;
        }
    }

    async fn set_discharge_control(&self, evcc: &EvccClient, enabled: bool) {
        if self.pushed.lock().discharge_control == Some(enabled) {
            return;
        }
        match evcc.set_battery_discharge_control(enabled).await {
            Ok(()) => self.pushed.lock().discharge_control = Some(enabled),
            Err(e) => warn!(error = %e, enabled, "discharge control push failed"),
        }
    }
}

fn approx_eq_opt(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => (a - b).abs() < 1e-6,
        _ => false,
    }
}
