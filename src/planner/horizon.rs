//! Rolling-horizon LP planner for joint battery + EV dispatch.
//!
//! Solves a 96-slot (15-min) linear program each cycle and applies only the
//! current-slot decision; the LP is re-solved fresh from measured SoC every
//! cycle, which corrects model-plant mismatch. Any failure (short price
//! horizon, infeasibility, solver trouble) yields `None` and the cycle runs
//! without a plan.
//!
//! Variable layout (T = 96, N = 5T+2):
//!   bat_charge[t]    t=0..T-1   kW
//!   bat_discharge[t] t=0..T-1   kW
//!   ev_charge[t]     t=0..T-1   kW (bounded to 0 when not connected)
//!   bat_soc[t]       t=0..T     fraction
//!   ev_soc[t]        t=0..T     fraction

use chrono::{DateTime, Duration, DurationRound, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::domain::{
    DispatchSlot, PlanHorizon, SolverStatus, SystemState, TariffSlot, CHARGE_THRESHOLD_KW,
    HORIZON_SLOTS, SLOT_HOURS,
};
use crate::learning::ConfidenceFactors;

use super::solver::{LpProblem, LpSolver, LpStatus, SparseRow};

/// Fewer forward price slots than this (8 h) and no plan is attempted
pub const MIN_PRICE_SLOTS: usize = 32;

/// PV surplus below this (kW) is ignored in the objective
const PV_SURPLUS_MIN_KW: f64 = 0.05;

/// Fallback house load (W) when the consumption forecast runs short
const FALLBACK_LOAD_W: f64 = 1200.0;

pub struct HorizonPlanner {
    bat_cap_kwh: f64,
    bat_p_max_kw: f64,
    eta_c: f64,
    eta_d: f64,
    /// Fractions 0..1
    bat_min_soc: f64,
    bat_max_soc: f64,
    /// EUR/kWh
    bat_max_price: f64,
    ev_max_price: f64,
    feed_in: f64,
    ev_default_cap_kwh: f64,
    ev_default_power_kw: f64,
    /// Fraction 0..1
    ev_target_soc: f64,
    solver: Box<dyn LpSolver>,
}

impl HorizonPlanner {
    pub fn new(cfg: &AppConfig, solver: Box<dyn LpSolver>) -> Self {
        Self {
            bat_cap_kwh: cfg.battery.capacity_kwh,
            bat_p_max_kw: cfg.battery.charge_power_kw,
            eta_c: cfg.battery.charge_efficiency,
            eta_d: cfg.battery.discharge_efficiency,
            bat_min_soc: cfg.battery.min_soc / 100.0,
            bat_max_soc: cfg.battery.max_soc / 100.0,
            bat_max_price: cfg.battery.max_price_ct / 100.0,
            ev_max_price: cfg.ev.max_price_ct / 100.0,
            feed_in: cfg.battery.feed_in_tariff_ct / 100.0,
            ev_default_cap_kwh: cfg.ev.default_capacity_kwh,
            ev_default_power_kw: cfg.ev.default_charge_power_kw,
            ev_target_soc: cfg.ev.target_soc / 100.0,
            solver,
        }
    }

    /// Solve the next 24h. `consumption_96` is in W, `pv_96` in kW.
    /// `seasonal_correction_eur` shifts expected prices by the learned bias.
    pub fn plan(
        &self,
        state: &SystemState,
        tariffs: &[TariffSlot],
        consumption_96: &[f64],
        pv_96: &[f64],
        departures: &HashMap<String, DateTime<Utc>>,
        confidence: &ConfidenceFactors,
        seasonal_correction_eur: f64,
    ) -> Option<PlanHorizon> {
        let now = state.timestamp.unwrap_or_else(Utc::now);
        let pv_confidence = confidence.pv.clamp(0.0, 1.0);

        if self.bat_min_soc >= self.bat_max_soc || self.bat_cap_kwh <= 0.0 {
            warn!("planner disabled: battery SoC window or capacity invalid");
            return None;
        }

        let (price_96, padded_slots) = self.tariffs_to_slots(tariffs, now)?;

        if state.ev_connected {
            self.check_ev_feasibility(state, departures, now);
        }

        let solution = self.solve(
            state,
            &price_96,
            consumption_96,
            pv_96,
            departures,
            now,
            pv_confidence,
            seasonal_correction_eur,
        )?;

        Some(self.extract_plan(
            &solution.x,
            solution.objective,
            &price_96,
            padded_slots,
            state,
            consumption_96,
            pv_96,
            now,
        ))
    }

    /// Expand the hourly tariff window into 96 15-min prices (EUR/kWh).
    ///
    /// Returns `None` below [`MIN_PRICE_SLOTS`]; horizons in [32, 96) are
    /// padded with the last known price and the padded count is surfaced on
    /// the plan.
    fn tariffs_to_slots(
        &self,
        tariffs: &[TariffSlot],
        now: DateTime<Utc>,
    ) -> Option<(Vec<f64>, usize)> {
        if tariffs.is_empty() {
            return None;
        }

        let now_hour = now.duration_trunc(Duration::hours(1)).ok()?;
        let mut buckets: BTreeMap<DateTime<Utc>, (f64, u32)> = BTreeMap::new();
        for t in tariffs {
            let hour = match t.start.duration_trunc(Duration::hours(1)) {
                Ok(h) => h,
                Err(_) => continue,
            };
            if hour >= now_hour {
                let entry = buckets.entry(hour).or_insert((0.0, 0));
                entry.0 += t.value;
                entry.1 += 1;
            }
        }

        let mut prices: Vec<f64> = Vec::with_capacity(HORIZON_SLOTS);
        for (_hour, (sum, count)) in buckets {
            let hourly = sum / f64::from(count);
            prices.extend(std::iter::repeat(hourly).take(4));
        }

        if prices.len() < MIN_PRICE_SLOTS {
            info!(slots = prices.len(), "insufficient price horizon (need >= {MIN_PRICE_SLOTS})");
            return None;
        }

        if prices.len() >= HORIZON_SLOTS {
            prices.truncate(HORIZON_SLOTS);
            Some((prices, 0))
        } else {
            let pad_count = HORIZON_SLOTS - prices.len();
            let last = *prices.last().unwrap_or(&0.0);
            info!(
                padded = pad_count,
                price = format!("{last:.4}"),
                "padding price horizon with last known price"
            );
            prices.extend(std::iter::repeat(last).take(pad_count));
            Some((prices, pad_count))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn solve(
        &self,
        state: &SystemState,
        price_96: &[f64],
        consumption_96: &[f64],
        pv_96: &[f64],
        departures: &HashMap<String, DateTime<Utc>>,
        now: DateTime<Utc>,
        pv_confidence: f64,
        seasonal_correction_eur: f64,
    ) -> Option<crate::planner::solver::LpSolution> {
        let t_n = HORIZON_SLOTS;
        let i_bat_chg = 0;
        let i_bat_dis = t_n;
        let i_ev_chg = 2 * t_n;
        let i_bat_soc = 3 * t_n;
        let i_ev_soc = 3 * t_n + (t_n + 1);
        let n_vars = 5 * t_n + 2;

        let ev_connected = state.ev_connected;
        let ev_capacity = self.ev_capacity(state);
        let ev_charge_power = if ev_connected { self.ev_charge_power(state) } else { 0.0 };
        let ev_current_soc = if ev_connected { state.ev_soc / 100.0 } else { 0.0 };

        let cons = padded(consumption_96, t_n, FALLBACK_LOAD_W);
        let pv = padded(pv_96, t_n, 0.0);

        // Objective: grid cost for charging, discounted by covered PV surplus;
        // a 10x penalty acts as a soft gate above the configured price limits.
        let mut objective = vec![0.0; n_vars];
        for t in 0..t_n {
            let pv_surplus_kw = (pv[t] - cons[t] / 1000.0).max(0.0);
            let mut effective = price_96[t];
            if pv_surplus_kw > PV_SURPLUS_MIN_KW {
                let coverage = (pv_surplus_kw / self.bat_p_max_kw.max(0.1)).min(1.0);
                effective = price_96[t] * (1.0 - coverage * pv_confidence);
            }
            effective += seasonal_correction_eur;

            objective[i_bat_chg + t] = if price_96[t] > self.bat_max_price {
                price_96[t] * 10.0
            } else {
                effective
            };
            objective[i_ev_chg + t] = if ev_connected && price_96[t] > self.ev_max_price {
                price_96[t] * 10.0
            } else {
                effective
            };
            objective[i_bat_dis + t] = -self.feed_in;
        }
        // Terminal credit: energy still in the battery at the horizon end is
        // worth its dischargeable value at the user's price ceiling. Without
        // it the LP never charges, whatever the price profile looks like.
        // The 1/dt factor puts the SoC credit in the same implicit per-slot
        // units as the power coefficients; charging then pays off exactly
        // below bat_max_price * eta_c * eta_d.
        let terminal_credit = -self.bat_max_price * self.bat_cap_kwh * self.eta_d / SLOT_HOURS;
        objective[i_bat_soc + t_n] = terminal_credit;

        // SoC dynamics as equalities, banded
        let mut eq_rows = Vec::with_capacity(2 * t_n + 2);
        let dt_h = SLOT_HOURS;
        for t in 0..t_n {
            eq_rows.push(SparseRow {
                coeffs: vec![
                    (i_bat_soc + t + 1, 1.0),
                    (i_bat_soc + t, -1.0),
                    (i_bat_chg + t, -self.eta_c * dt_h / self.bat_cap_kwh),
                    (i_bat_dis + t, dt_h / (self.eta_d * self.bat_cap_kwh)),
                ],
                rhs: 0.0,
            });
        }
        eq_rows.push(SparseRow {
            coeffs: vec![(i_bat_soc, 1.0)],
            rhs: state.battery_soc / 100.0,
        });
        for t in 0..t_n {
            let coeffs = if ev_connected && ev_capacity > 0.0 {
                vec![
                    (i_ev_soc + t + 1, 1.0),
                    (i_ev_soc + t, -1.0),
                    (i_ev_chg + t, -dt_h / ev_capacity),
                ]
            } else {
                // No EV: identity keeps ev_soc pinned at its start value
                vec![(i_ev_soc + t + 1, 1.0), (i_ev_soc + t, -1.0)]
            };
            eq_rows.push(SparseRow { coeffs, rhs: 0.0 });
        }
        eq_rows.push(SparseRow { coeffs: vec![(i_ev_soc, 1.0)], rhs: ev_current_soc });

        // Inequalities: departure target + per-slot mutual exclusion
        let mut ub_rows = Vec::with_capacity(t_n + 1);
        if ev_connected {
            let departure = departures
                .get(&state.ev_name)
                .or_else(|| departures.get("_default"))
                .copied();
            if let Some(departure) = departure {
                let dep_slot = departure_slot(departure, now);
                // ev_soc[dep] >= target  written as  -ev_soc[dep] <= -target
                ub_rows.push(SparseRow {
                    coeffs: vec![(i_ev_soc + dep_slot, -1.0)],
                    rhs: -self.ev_target_soc,
                });
            }
        }
        let p_max_sum = self.bat_p_max_kw.max(0.1);
        for t in 0..t_n {
            ub_rows.push(SparseRow {
                coeffs: vec![(i_bat_chg + t, 1.0), (i_bat_dis + t, 1.0)],
                rhs: p_max_sum,
            });
        }

        let mut bounds = Vec::with_capacity(n_vars);
        bounds.extend(std::iter::repeat((0.0, self.bat_p_max_kw)).take(t_n));
        bounds.extend(std::iter::repeat((0.0, self.bat_p_max_kw)).take(t_n));
        bounds.extend(std::iter::repeat((0.0, ev_charge_power)).take(t_n));
        bounds.extend(std::iter::repeat((self.bat_min_soc, self.bat_max_soc)).take(t_n + 1));
        let ev_soc_hi = if ev_connected { 1.0 } else { 0.0 };
        bounds.extend(std::iter::repeat((0.0, ev_soc_hi)).take(t_n + 1));

        let lp = LpProblem { objective, bounds, eq_rows, ub_rows };

        let started = std::time::Instant::now();
        let solution = self.solver.solve(&lp);
        let elapsed_ms = started.elapsed().as_millis();

        match solution.status {
            LpStatus::Optimal => {
                // Report the dispatch cost without the terminal-credit
                // constant so the objective stays comparable across cycles.
                let mut solution = solution;
                solution.objective -= terminal_credit * solution.x[i_bat_soc + t_n];
                debug!(
                    elapsed_ms,
                    cost = format!("{:.4}", solution.objective),
                    "LP solved"
                );
                Some(solution)
            }
            LpStatus::Infeasible | LpStatus::Unbounded => {
                warn!(elapsed_ms, status = ?solution.status, "LP failed, no plan this cycle");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn extract_plan(
        &self,
        x: &[f64],
        objective: f64,
        price_96: &[f64],
        padded_slots: usize,
        state: &SystemState,
        consumption_96: &[f64],
        pv_96: &[f64],
        now: DateTime<Utc>,
    ) -> PlanHorizon {
        let t_n = HORIZON_SLOTS;
        let i_bat_chg = 0;
        let i_bat_dis = t_n;
        let i_ev_chg = 2 * t_n;
        let i_bat_soc = 3 * t_n;
        let i_ev_soc = 3 * t_n + (t_n + 1);

        let ev_connected = state.ev_connected;
        let ev_charge_power = if ev_connected { self.ev_charge_power(state) } else { 0.0 };
        let ev_name = if ev_connected { state.ev_name.clone() } else { String::new() };

        let cons = padded(consumption_96, t_n, FALLBACK_LOAD_W);
        let pv = padded(pv_96, t_n, 0.0);

        // Clip solver output to variable bounds; simplex backends may return
        // tiny negatives near the bounds. Charge and discharge are also
        // netted per slot so at most one side stays non-zero: with a strong
        // PV discount the effective charge price can drop below the feed-in
        // rate and the raw LP optimum then runs both at once.
        let mut slots = Vec::with_capacity(t_n);
        for t in 0..t_n {
            let net_kw = x[i_bat_chg + t] - x[i_bat_dis + t];
            slots.push(DispatchSlot {
                slot_index: t,
                slot_start: now + Duration::minutes(15 * t as i64),
                bat_charge_kw: net_kw.clamp(0.0, self.bat_p_max_kw),
                bat_discharge_kw: (-net_kw).clamp(0.0, self.bat_p_max_kw),
                ev_charge_kw: x[i_ev_chg + t].clamp(0.0, ev_charge_power.max(0.0)),
                ev_name: ev_name.clone(),
                price_eur_kwh: price_96[t],
                pv_kw: pv[t],
                load_kw: cons[t] / 1000.0,
                bat_soc_pct: x[i_bat_soc + t].clamp(self.bat_min_soc, self.bat_max_soc) * 100.0,
                ev_soc_pct: x[i_ev_soc + t].clamp(0.0, 1.0) * 100.0,
            });
        }

        let slot0 = &slots[0];
        let current_bat_charge = slot0.bat_charge_kw > CHARGE_THRESHOLD_KW;
        let current_bat_discharge = slot0.bat_discharge_kw > CHARGE_THRESHOLD_KW;
        let current_ev_charge = slot0.ev_charge_kw > CHARGE_THRESHOLD_KW && ev_connected;
        let current_price_limit = slot0.price_eur_kwh;

        PlanHorizon {
            computed_at: now,
            slots,
            solver_status: SolverStatus::Optimal,
            objective_eur: objective,
            padded_slots,
            current_bat_charge,
            current_bat_discharge,
            current_ev_charge,
            current_price_limit,
        }
    }

    /// Warn ahead of the solve when the departure target cannot physically be
    /// met; the LP still runs and reports infeasibility on its own.
    fn check_ev_feasibility(
        &self,
        state: &SystemState,
        departures: &HashMap<String, DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let Some(departure) = departures
            .get(&state.ev_name)
            .or_else(|| departures.get("_default"))
            .copied()
        else {
            return;
        };
        let ev_capacity = self.ev_capacity(state);
        if ev_capacity <= 0.0 {
            return;
        }
        let ev_charge_power = self.ev_charge_power(state);
        let dep_slot = departure_slot(departure, now);

        let max_deliverable = (dep_slot as f64 * ev_charge_power * SLOT_HOURS) / ev_capacity;
        let soc_needed = self.ev_target_soc - state.ev_soc / 100.0;

        if soc_needed > 0.0 && max_deliverable < soc_needed {
            warn!(
                needed_pct = format!("{:.0}", soc_needed * 100.0),
                deliverable_pct = format!("{:.0}", max_deliverable * 100.0),
                slots = dep_slot,
                "EV departure target may be infeasible"
            );
        }
    }

    fn ev_capacity(&self, state: &SystemState) -> f64 {
        if state.ev_capacity_kwh > 0.0 { state.ev_capacity_kwh } else { self.ev_default_cap_kwh }
    }

    fn ev_charge_power(&self, state: &SystemState) -> f64 {
        if state.ev_charge_power_kw > 0.0 {
            state.ev_charge_power_kw
        } else {
            self.ev_default_power_kw
        }
    }
}

/// 15-min slot index of a departure instant, clamped to [1, 95].
fn departure_slot(departure: DateTime<Utc>, now: DateTime<Utc>) -> usize {
    let minutes = (departure - now).num_minutes();
    let slot = minutes / 15;
    slot.clamp(1, (HORIZON_SLOTS - 1) as i64) as usize
}

fn padded(values: &[f64], len: usize, fallback: f64) -> Vec<f64> {
    let fill = values.last().copied().unwrap_or(fallback);
    values.iter().copied().chain(std::iter::repeat(fill)).take(len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::MinilpSolver;
    use chrono::TimeZone;

    fn test_config() -> AppConfig {
        use figment::providers::{Format, Toml};
        let toml = r#"
            [server]
            [evcc]
            url = "http://evcc.local:7070"
            [battery]
            capacity_kwh = 10.0
            charge_power_kw = 5.0
            charge_efficiency = 0.95
            discharge_efficiency = 0.95
            min_soc = 10.0
            max_soc = 90.0
            [ev]
            [arbitrage]
            [dispatch]
            [learner]
            [persistence]
        "#;
        AppConfig::load_from(figment::Figment::new().merge(Toml::string(toml))).unwrap()
    }

    fn planner() -> HorizonPlanner {
        HorizonPlanner::new(&test_config(), Box::new(MinilpSolver))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn hourly_tariffs(prices: &[f64]) -> Vec<TariffSlot> {
        prices
            .iter()
            .enumerate()
            .map(|(i, p)| TariffSlot {
                start: now() + Duration::hours(i as i64),
                end: now() + Duration::hours(i as i64 + 1),
                value: *p,
            })
            .collect()
    }

    fn base_state(soc: f64) -> SystemState {
        SystemState {
            timestamp: Some(now()),
            battery_soc: soc,
            current_price: 0.25,
            ..Default::default()
        }
    }

    #[test]
    fn departure_slot_clamps() {
        let n = now();
        assert_eq!(departure_slot(n - Duration::hours(1), n), 1);
        assert_eq!(departure_slot(n + Duration::minutes(30), n), 2);
        assert_eq!(departure_slot(n + Duration::days(3), n), 95);
    }

    #[test]
    fn eight_hours_of_prices_produces_padded_plan() {
        let p = planner();
        let tariffs = hourly_tariffs(&[0.25; 8]); // 32 slots
        let plan = p
            .plan(
                &base_state(50.0),
                &tariffs,
                &[1000.0; 96],
                &[0.0; 96],
                &HashMap::new(),
                &ConfidenceFactors::default(),
                0.0,
            )
            .expect("plan");
        assert_eq!(plan.slots.len(), 96);
        assert_eq!(plan.padded_slots, 64);
    }

    #[test]
    fn seven_hours_of_prices_is_no_plan() {
        let p = planner();
        let tariffs = hourly_tariffs(&[0.25; 7]); // 28 slots < 32
        assert!(p
            .plan(
                &base_state(50.0),
                &tariffs,
                &[1000.0; 96],
                &[0.0; 96],
                &HashMap::new(),
                &ConfidenceFactors::default(),
                0.0,
            )
            .is_none());
    }

    #[test]
    fn start_at_max_soc_never_charges() {
        let p = planner();
        let tariffs = hourly_tariffs(&[0.05; 24]); // cheap everywhere
        let plan = p
            .plan(
                &base_state(90.0),
                &tariffs,
                &[1000.0; 96],
                &[0.0; 96],
                &HashMap::new(),
                &ConfidenceFactors::default(),
                0.0,
            )
            .expect("plan");
        let total_charge: f64 = plan.slots.iter().map(|s| s.bat_charge_kw).sum();
        assert!(total_charge < 0.5, "charged {total_charge} kW at max SoC");
    }

    #[test]
    fn soc_stays_within_bounds() {
        let p = planner();
        let mut prices = vec![0.40; 12];
        prices.extend(vec![0.05; 12]);
        let tariffs = hourly_tariffs(&prices);
        let plan = p
            .plan(
                &base_state(30.0),
                &tariffs,
                &[800.0; 96],
                &[0.0; 96],
                &HashMap::new(),
                &ConfidenceFactors::default(),
                0.0,
            )
            .expect("plan");
        for slot in &plan.slots {
            assert!(slot.bat_soc_pct >= 10.0 - 0.5 && slot.bat_soc_pct <= 90.0 + 0.5);
        }
    }

    #[test]
    fn charge_and_discharge_are_mutually_exclusive() {
        let p = planner();
        let mut prices = vec![0.40; 12];
        prices.extend(vec![0.05; 12]);
        let tariffs = hourly_tariffs(&prices);
        let plan = p
            .plan(
                &base_state(50.0),
                &tariffs,
                &[800.0; 96],
                &[2.0; 96],
                &HashMap::new(),
                &ConfidenceFactors::default(),
                0.0,
            )
            .expect("plan");
        for slot in &plan.slots {
            assert!(slot.bat_charge_kw * slot.bat_discharge_kw < 1e-6);
        }
    }

    #[test]
    fn invalid_soc_window_returns_none() {
        let mut cfg = test_config();
        cfg.battery.min_soc = 95.0;
        cfg.battery.max_soc = 90.0;
        let p = HorizonPlanner::new(&cfg, Box::new(MinilpSolver));
        let tariffs = hourly_tariffs(&[0.25; 24]);
        assert!(p
            .plan(
                &base_state(50.0),
                &tariffs,
                &[1000.0; 96],
                &[0.0; 96],
                &HashMap::new(),
                &ConfidenceFactors::default(),
                0.0,
            )
            .is_none());
    }
}
