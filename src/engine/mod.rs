//! Decision loop: the single writer that orchestrates one dispatch cycle
//! every interval and publishes the result through the state store.
//!
//! Precedence is centralised here and nowhere else:
//! boost override > mode controller > arbitrage > planner fallback.

pub mod departures;
pub mod notify;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::arbitrage::ArbitrageEvaluator;
use crate::buffer::ReserveFloorCalc;
use crate::config::{AppConfig, LearnerMode};
use crate::controller::Controller;
use crate::domain::{EvAction, PlanAction, PlanHorizon, SystemState, TariffSlot, SLOT_HOURS};
use crate::evcc::{EvccClient, EvccState};
use crate::forecast::{ConsumptionForecaster, PvForecaster};
use crate::learning::{
    residual::PROMOTION_SHADOW_DAYS, ForecastReliabilityTracker, ForecastSource, ReactionTimingTracker,
    ResidualLearner, SeasonalBiasTable,
};
use crate::modes::ModeController;
use crate::overrides::OverrideManager;
use crate::planner::{HorizonPlanner, MinilpSolver};
use crate::store::{StateStore, StoreUpdate};
use crate::vehicles::{spawn_pollers, VehicleRegistry};
use departures::DepartureStore;
use notify::Notifier;

/// Cadence of the background evcc state collector
const COLLECTOR_INTERVAL_SECS: u64 = 60;

/// Sleep before retrying after a missing snapshot or a cycle error
const ERROR_RETRY_SECS: u64 = 60;

/// Latest raw evcc state, refreshed by a background task. `None` while evcc
/// is unreachable so the mode controller can track the outage.
pub struct StateCollector {
    evcc: Arc<EvccClient>,
    cache: Mutex<Option<EvccState>>,
}

impl StateCollector {
    pub fn new(evcc: Arc<EvccClient>) -> Arc<Self> {
        Arc::new(Self { evcc, cache: Mutex::new(None) })
    }

    pub fn latest(&self) -> Option<EvccState> {
        self.cache.lock().clone()
    }

    pub async fn refresh(&self) {
        let state = self.evcc.state().await;
        *self.cache.lock() = state;
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let collector = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                collector.refresh().await;
                tokio::time::sleep(Duration::from_secs(COLLECTOR_INTERVAL_SECS)).await;
            }
        })
    }
}

/// Shared handles the web layer needs; everything is cheap to clone.
#[derive(Clone)]
pub struct EngineHandles {
    pub store: Arc<StateStore>,
    pub evcc: Arc<EvccClient>,
    pub overrides: OverrideManager,
    pub departures: Arc<DepartureStore>,
    pub registry: Arc<VehicleRegistry>,
    pub buffer: Arc<ReserveFloorCalc>,
    pub learner: Arc<ResidualLearner>,
    pub reaction: Arc<ReactionTimingTracker>,
    pub seasonal: Arc<SeasonalBiasTable>,
}

pub struct Engine {
    cfg: AppConfig,
    evcc: Arc<EvccClient>,
    store: Arc<StateStore>,
    collector: Arc<StateCollector>,
    controller: Controller,
    planner: HorizonPlanner,
    reliability: Arc<ForecastReliabilityTracker>,
    seasonal: Arc<SeasonalBiasTable>,
    reaction: Arc<ReactionTimingTracker>,
    learner: Arc<ResidualLearner>,
    buffer: Arc<ReserveFloorCalc>,
    arbitrage: ArbitrageEvaluator,
    modes: ModeController,
    overrides: OverrideManager,
    registry: Arc<VehicleRegistry>,
    pv: Arc<PvForecaster>,
    consumption: Arc<ConsumptionForecaster>,
    departures: Arc<DepartureStore>,
    notifier: Arc<dyn Notifier>,

    last_ev_connected: bool,
    last_ev_name: String,
}

enum CycleOutcome {
    Completed,
    RetrySoon,
}

impl Engine {
    pub fn new(
        cfg: AppConfig,
        store: Arc<StateStore>,
        evcc: Arc<EvccClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let data = &cfg.persistence.data_dir;
        let collector = StateCollector::new(Arc::clone(&evcc));

        let reliability =
            Arc::new(ForecastReliabilityTracker::new(data.join("reliability_model.json")));
        let seasonal = Arc::new(SeasonalBiasTable::new(data.join("seasonal_model.json")));
        let reaction = Arc::new(ReactionTimingTracker::new(data.join("reaction_timing.json")));
        let learner = Arc::new(ResidualLearner::new(
            data.join("residual_model.json"),
            cfg.learner.mode,
            cfg.learner.epsilon,
            cfg.learner.promotion_win_rate,
        ));
        let buffer =
            Arc::new(ReserveFloorCalc::new(data.join("buffer_model.json"), cfg.battery.min_soc));
        let registry =
            Arc::new(VehicleRegistry::new(data.join("manual_soc.json"), &cfg.vehicles));
        let pv = Arc::new(PvForecaster::new(data.join("pv_model.json")));
        let consumption =
            Arc::new(ConsumptionForecaster::new(data.join("consumption_model.json")));
        let departures = Arc::new(DepartureStore::new(
            data.join("departure_times.json"),
            cfg.ev.default_departure_hour,
        ));

        info!(
            seasonal_cells = seasonal.populated_cell_count(),
            learner_mode = ?learner.mode(),
            "learned models loaded"
        );

        Self {
            planner: HorizonPlanner::new(&cfg, Box::new(MinilpSolver)),
            arbitrage: ArbitrageEvaluator::new(&cfg),
            modes: ModeController::new(&cfg),
            overrides: OverrideManager::new(
                cfg.dispatch.quiet_hours_enabled,
                cfg.dispatch.quiet_hours_start,
                cfg.dispatch.quiet_hours_end,
            ),
            controller: Controller::new(&cfg),
            collector,
            evcc,
            store,
            reliability,
            seasonal,
            reaction,
            learner,
            buffer,
            registry,
            pv,
            consumption,
            departures,
            notifier,
            last_ev_connected: false,
            last_ev_name: String::new(),
            cfg,
        }
    }

    pub fn handles(&self) -> EngineHandles {
        EngineHandles {
            store: Arc::clone(&self.store),
            evcc: Arc::clone(&self.evcc),
            overrides: self.overrides.clone(),
            departures: Arc::clone(&self.departures),
            registry: Arc::clone(&self.registry),
            buffer: Arc::clone(&self.buffer),
            learner: Arc::clone(&self.learner),
            reaction: Arc::clone(&self.reaction),
            seasonal: Arc::clone(&self.seasonal),
        }
    }

    /// Spawn the background workers (state collector, vehicle pollers) and
    /// run the decision loop forever.
    pub async fn run(mut self) {
        let _collector_task = self.collector.spawn();
        let _poller_tasks = spawn_pollers(Arc::clone(&self.registry), &self.cfg.vehicles);

        let interval = Duration::from_secs(self.cfg.dispatch.decision_interval_minutes * 60);
        info!(interval_min = self.cfg.dispatch.decision_interval_minutes, "decision loop started");

        loop {
            let started = Instant::now();
            let sleep_for = match self.run_cycle().await {
                Ok(CycleOutcome::Completed) => interval.saturating_sub(started.elapsed()),
                Ok(CycleOutcome::RetrySoon) => Duration::from_secs(ERROR_RETRY_SECS),
                Err(e) => {
                    error!(error = ?e, "cycle failed");
                    Duration::from_secs(ERROR_RETRY_SECS)
                }
            };
            tokio::time::sleep(sleep_for.max(Duration::from_secs(1))).await;
        }
    }

    async fn run_cycle(&mut self) -> anyhow::Result<CycleOutcome> {
        // 1. State snapshot
        let Some(evcc_state) = self.collector.latest() else {
            warn!("no evcc state available, retrying shortly");
            // Let the mode controller record the outage
            let mode_status = self
                .modes
                .step(&SystemState::default(), None, None, false, &self.evcc)
                .await;
            self.store.update(StoreUpdate {
                mode_status: Some(mode_status),
                ..Default::default()
            });
            return Ok(CycleOutcome::RetrySoon);
        };
        let now = Utc::now();

        if let Some(lp) = evcc_state.first_loadpoint() {
            self.registry.sync_from_loadpoint(
                lp,
                self.cfg.ev.default_capacity_kwh,
                self.cfg.ev.default_charge_power_kw,
            );
        }

        // 2. Tariffs, forecasts, derived price context
        let tariffs = self.evcc.tariff_grid().await;
        let solar = self.evcc.tariff_solar().await;
        let mut state = self.build_state(&evcc_state, &tariffs, now);
        state.enrich_with_tariffs(&tariffs, &solar);

        // 3. Plug-in detection: inquiry fires exactly once per session
        let just_plugged = state.ev_connected && !self.last_ev_connected;
        if just_plugged
            && !state.ev_name.is_empty()
            && !self.departures.is_inquiry_pending(&state.ev_name)
        {
            self.notifier.send_departure_inquiry(&state.ev_name, Some(state.ev_soc));
            self.departures.mark_inquiry_sent(&state.ev_name);
        }
        if !state.ev_connected && !self.last_ev_name.is_empty() {
            self.departures.reset_inquiry(&self.last_ev_name);
        }
        // evcc may report connected before it resolved the vehicle name; only
        // latch once a name exists or the EV is gone
        if !state.ev_name.is_empty() || !state.ev_connected {
            self.last_ev_connected = state.ev_connected;
            self.last_ev_name = state.ev_name.clone();
        }

        // Forecaster updates
        self.consumption.update(state.home_power, now);
        let consumption_96 = self.consumption.forecast_96(now);
        if consumption_96[0] > 100.0 {
            self.consumption.apply_correction(state.home_power, consumption_96[0]);
        }
        let pv_96 = self.pv.forecast_96(&solar, now);
        self.pv.update_correction(state.pv_power / 1000.0, pv_96[0]);

        // 4. Forecast reliability, current slot actual vs forecast
        self.reliability.update(ForecastSource::Pv, state.pv_power / 1000.0, pv_96[0]);
        self.reliability.update(ForecastSource::Consumption, state.home_power, consumption_96[0]);
        if let Some(first) = tariffs.first() {
            self.reliability.update(ForecastSource::Price, state.current_price, first.value);
        }
        let confidence = self.reliability.all_confidences();

        // 5. Seasonal correction
        let seasonal_corr = self.seasonal.correction(now).unwrap_or(0.0);
        if seasonal_corr != 0.0 {
            info!(correction_eur = format!("{seasonal_corr:+.4}"), "seasonal correction applied");
        }

        // 6. Plan
        let departure_map = self.departures.departure_map(now);
        let mut plan = self.planner.plan(
            &state,
            &tariffs,
            &consumption_96,
            &pv_96,
            &departure_map,
            &confidence,
            seasonal_corr,
        );
        let mut lp_action =
            plan.as_ref().map_or_else(PlanAction::hold, |p| PlanAction::from_plan(p, &state));
        match &plan {
            Some(p) => info!(
                cost = format!("{:.4}", p.objective_eur),
                padded = p.padded_slots,
                action = lp_action.label(),
                "LP plan"
            ),
            None => info!("no LP plan this cycle"),
        }

        // 7. Boost override wins; otherwise the residual learner may act.
        if self.overrides.is_active()
            && (!state.ev_connected || state.ev_soc >= self.cfg.ev.target_soc)
        {
            if let Some(vehicle) = self.overrides.cancel() {
                info!(vehicle, "Boost beendet, Planer uebernimmt");
            }
        }
        let override_active = self.overrides.is_active();

        let mut selection = None;
        let final_action = if override_active {
            // Keep charging at full power; the override already forced 'now'
            PlanAction { ev_action: EvAction::Charge, ev_limit_eur: None, ..lp_action }
        } else {
            match self.learner.mode() {
                LearnerMode::Shadow => {
                    let sel = self.learner.select(&state);
                    self.learner.record_shadow(&state, sel);
                    selection = Some(sel);
                    lp_action
                }
                LearnerMode::Advisory => {
                    let sel = self.learner.select(&state);
                    selection = Some(sel);
                    self.learner.apply(&lp_action, sel)
                }
                LearnerMode::Disabled => lp_action,
            }
        };

        // 8. Dispatch
        self.controller.apply(&self.evcc, &final_action).await;

        // 9. Mode control, bypassed while the override runs
        let departure_urgent = self.departure_urgent(&state, now);
        let mode_status = if override_active {
            self.modes.current_status()
        } else {
            self.modes
                .step(&state, plan.as_ref(), Some(&evcc_state), departure_urgent, &self.evcc)
                .await
        };

        // 10. Arbitrage gates
        let any_connected = self.registry.any_connected() || state.ev_connected;
        let total_need = self.total_ev_need(&state);
        let (arb_status, arb_cmd) = self.arbitrage.evaluate(
            &state,
            plan.as_ref(),
            &mode_status,
            any_connected,
            total_need,
            &tariffs,
            &solar,
            self.buffer.current_buffer_pct(),
        );
        self.controller.apply_arbitrage(&self.evcc, arb_cmd).await;

        // 11. Reserve floor only while arbitrage is idle
        let buffer_status = if self.controller.arbitrage_active() {
            None
        } else {
            let status = self.buffer.step(confidence.pv, state.price_spread, &pv_96, now);
            if let Some(pct) = status.apply_pct {
                self.controller.push_buffer_soc(&self.evcc, pct).await;
            }
            Some(status)
        };

        // 12. Publish
        self.store.update(StoreUpdate {
            state: Some(state.clone()),
            lp_action: Some(lp_action),
            rl_action: Some(final_action),
            plan: plan.clone(),
            solar_forecast: solar,
            pv_forecast: Some(pv_96.clone()),
            consumption_forecast: Some(consumption_96.clone()),
            buffer_status,
            mode_status: Some(mode_status),
            arbitrage_status: Some(arb_status),
        });

        // 13. Shared slot-0 costs feed all learners once
        let feed_in = self.cfg.battery.feed_in_tariff_ct / 100.0;
        let slot0_plan_cost = plan.as_ref().map(|p| plan_slot0_cost(p, feed_in));
        if let Some(plan_cost) = slot0_plan_cost {
            let actual_cost = actual_slot0_cost(&state, feed_in);
            self.seasonal.update(now, actual_cost - plan_cost);

            let plan_label = lp_action.label();
            let actual_label = final_action.label();
            self.reaction.update(&plan_label, &actual_label);

            if plan_label != actual_label && self.reaction.should_replan_immediately() {
                info!("deviation unlikely to self-correct, re-planning immediately");
                let replanned = self.planner.plan(
                    &state,
                    &tariffs,
                    &consumption_96,
                    &pv_96,
                    &departure_map,
                    &confidence,
                    seasonal_corr,
                );
                // The fresh solve only refreshes the local plan view; the
                // published snapshot stays the one from this cycle's dispatch
                // and the next cycle re-publishes from fresh state anyway.
                if let Some(new_plan) = replanned {
                    lp_action = PlanAction::from_plan(&new_plan, &state);
                    plan = Some(new_plan);
                    info!(
                        action = lp_action.label(),
                        cost = format!(
                            "{:.4}",
                            plan.as_ref().map_or(0.0, |p| p.objective_eur)
                        ),
                        "refreshed plan computed"
                    );
                }
            }

            if !override_active {
                if let Some(sel) = selection {
                    let reward = ResidualLearner::reward(plan_cost, actual_cost);
                    self.learner.learn(&state, sel, reward);
                }
            }
        }

        // 14. Shadow -> advisory auto-promotion
        if self.learner.mode() == LearnerMode::Shadow
            && self.learner.shadow_elapsed_days() >= PROMOTION_SHADOW_DAYS
        {
            let report = self.learner.run_audit();
            self.learner.maybe_promote(&report);
        }

        Ok(CycleOutcome::Completed)
    }

    fn build_state(
        &self,
        evcc_state: &EvccState,
        tariffs: &[TariffSlot],
        now: DateTime<Utc>,
    ) -> SystemState {
        let lp = evcc_state.first_loadpoint();
        let ev_connected = lp.is_some_and(|l| l.connected);
        let ev_name = lp
            .and_then(|l| l.vehicle_name.clone())
            .unwrap_or_default();
        let vehicle = (!ev_name.is_empty())
            .then(|| self.registry.get(&ev_name))
            .flatten();

        let ev_soc = vehicle
            .as_ref()
            .and_then(|v| v.effective_soc())
            .or_else(|| lp.and_then(|l| l.vehicle_soc))
            .unwrap_or(0.0);
        let ev_capacity_kwh = vehicle
            .as_ref()
            .map(|v| v.capacity_kwh)
            .or_else(|| lp.and_then(|l| l.vehicle_capacity))
            .unwrap_or(self.cfg.ev.default_capacity_kwh);
        let ev_charge_power_kw = vehicle
            .map(|v| v.charge_power_kw)
            .unwrap_or(self.cfg.ev.default_charge_power_kw);

        let current_price = tariffs
            .iter()
            .find(|t| t.start <= now && now < t.end)
            .or_else(|| tariffs.first())
            .map_or(0.0, |t| t.value);

        SystemState {
            timestamp: Some(now),
            battery_soc: evcc_state.battery_soc.unwrap_or(0.0),
            battery_power: evcc_state.battery_power.unwrap_or(0.0),
            grid_power: evcc_state.grid_power.unwrap_or(0.0),
            pv_power: evcc_state.pv_power.unwrap_or(0.0),
            home_power: evcc_state.home_power.unwrap_or(0.0),
            current_price,
            ev_connected,
            ev_name,
            ev_soc,
            ev_capacity_kwh,
            ev_charge_power_kw,
            ev_power: lp.and_then(|l| l.charge_power).unwrap_or(0.0),
            ..Default::default()
        }
    }

    fn total_ev_need(&self, state: &SystemState) -> f64 {
        let from_registry = self.registry.total_need_kwh(self.cfg.ev.target_soc);
        if from_registry > 0.0 {
            from_registry
        } else if state.ev_connected {
            self.arbitrage.ev_need_kwh(state.ev_soc, state.ev_capacity_kwh)
        } else {
            0.0
        }
    }

    fn departure_urgent(&self, state: &SystemState, now: DateTime<Utc>) -> bool {
        if !state.ev_connected || state.ev_name.is_empty() {
            return false;
        }
        let Some(departure) = self.departures.departure(&state.ev_name) else {
            return false;
        };
        let hours_left = (departure - now).num_seconds() as f64 / 3600.0;
        let soc_needed = (self.cfg.ev.target_soc - state.ev_soc).max(0.0);
        let hours_needed = soc_needed / 100.0 * state.ev_capacity_kwh
            / state.ev_charge_power_kw.max(1.0);
        hours_left < hours_needed * 1.3
    }
}

/// Planned cost of the current slot: charge energy at the planned price minus
/// feed-in revenue from planned discharge.
pub fn plan_slot0_cost(plan: &PlanHorizon, feed_in_eur: f64) -> f64 {
    match plan.slot0() {
        None => 0.0,
        Some(s) => {
            (s.bat_charge_kw + s.ev_charge_kw) * SLOT_HOURS * s.price_eur_kwh
                - s.bat_discharge_kw * SLOT_HOURS * feed_in_eur
        }
    }
}

/// Measured cost over the current slot from signed battery power and the
/// momentary EV charge power.
pub fn actual_slot0_cost(state: &SystemState, feed_in_eur: f64) -> f64 {
    let bat_charge_kw = state.battery_power.max(0.0) / 1000.0;
    let bat_discharge_kw = (-state.battery_power).max(0.0) / 1000.0;
    let ev_kw = state.ev_power.max(0.0) / 1000.0;
    (bat_charge_kw + ev_kw) * SLOT_HOURS * state.current_price
        - bat_discharge_kw * SLOT_HOURS * feed_in_eur
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DispatchSlot, SolverStatus};

    fn plan_with_slot0(charge: f64, discharge: f64, ev: f64, price: f64) -> PlanHorizon {
        PlanHorizon {
            computed_at: Utc::now(),
            slots: vec![DispatchSlot {
                slot_index: 0,
                slot_start: Utc::now(),
                bat_charge_kw: charge,
                bat_discharge_kw: discharge,
                ev_charge_kw: ev,
                ev_name: String::new(),
                price_eur_kwh: price,
                pv_kw: 0.0,
                load_kw: 0.5,
                bat_soc_pct: 50.0,
                ev_soc_pct: 0.0,
            }],
            solver_status: SolverStatus::Optimal,
            objective_eur: 0.0,
            padded_slots: 0,
            current_bat_charge: charge > 0.1,
            current_bat_discharge: discharge > 0.1,
            current_ev_charge: ev > 0.1,
            current_price_limit: price,
        }
    }

    #[test]
    fn plan_cost_charges_count_discharge_earns() {
        // 4 kW charge for 15 min at 0.20 EUR/kWh = 0.20 EUR/kWh * 1 kWh = 0.2
        let plan = plan_with_slot0(4.0, 0.0, 0.0, 0.20);
        assert!((plan_slot0_cost(&plan, 0.07) - 0.2).abs() < 1e-9);

        let plan = plan_with_slot0(0.0, 4.0, 0.0, 0.20);
        assert!((plan_slot0_cost(&plan, 0.07) + 0.07).abs() < 1e-9);
    }

    #[test]
    fn actual_cost_uses_signed_battery_power() {
        let state = SystemState {
            battery_power: 4000.0, // charging
            ev_power: 0.0,
            current_price: 0.20,
            ..Default::default()
        };
        assert!((actual_slot0_cost(&state, 0.07) - 0.2).abs() < 1e-9);

        let state = SystemState {
            battery_power: -4000.0, // discharging
            current_price: 0.20,
            ..Default::default()
        };
        assert!((actual_slot0_cost(&state, 0.07) + 0.07).abs() < 1e-9);
    }

    #[test]
    fn empty_plan_costs_nothing() {
        let mut plan = plan_with_slot0(0.0, 0.0, 0.0, 0.2);
        plan.slots.clear();
        assert_eq!(plan_slot0_cost(&plan, 0.07), 0.0);
    }
}
