//! LP-gated battery-to-EV arbitrage.
//!
//! Seven gates, evaluated in order, all of which must pass before the house
//! battery may discharge into an EV. Reason strings are German plain ASCII
//! and rendered verbatim on the dashboard.

use serde::Serialize;
use tracing::info;

use crate::config::AppConfig;
use crate::domain::{
    solar_surplus_kwh, ChargeMode, PlanHorizon, SystemState, TariffSlot, CHARGE_THRESHOLD_KW,
};
use crate::modes::ModeStatus;

/// Slots 1..=24 of the plan (6 h) are scanned for cheaper upcoming prices
const LOOKAHEAD_SLOTS: usize = 24;

/// A future price below this fraction of the current price blocks discharge
const LOOKAHEAD_PRICE_RATIO: f64 = 0.8;

/// Minimum usable battery energy above the floor (kWh)
const MIN_USABLE_KWH: f64 = 0.5;

/// Minimum total EV charge need for gate 1 (kWh)
const MIN_EV_NEED_KWH: f64 = 1.0;

/// Refill expectation cap when deriving adaptive limits (percent)
const MAX_REFILL_PCT: f64 = 80.0;

/// Fraction of the expected refill considered safe to discharge
const SAFE_DISCHARGE_FACTOR: f64 = 0.8;

/// Downstream limits pushed while battery-to-EV is active.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdaptiveLimits {
    /// Floor below which the battery must not be pulled (prioritySoc)
    pub priority_soc: i64,
    /// Discharge target for this session (bufferSoc)
    pub buffer_soc: i64,
    /// SoC at which battery-to-EV may start (bufferStartSoc)
    pub buffer_start_soc: i64,
}

/// What the controller should do downstream this cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArbitrageCommand {
    Deactivate,
    Activate { usable_kwh: f64, limits: AdaptiveLimits },
}

#[derive(Debug, Clone, Serialize)]
pub struct ArbitrageStatus {
    pub active: bool,
    /// German reason for the first failing gate, if any
    pub reason: Option<String>,
    pub savings_ct: Option<f64>,
    pub usable_kwh: Option<f64>,
    pub effective_floor_pct: f64,
    pub dynamic_buffer_pct: i64,
}

pub struct ArbitrageEvaluator {
    ev_target_soc: f64,
    battery_capacity_kwh: f64,
    battery_max_price_ct: f64,
    eta_c: f64,
    eta_d: f64,
    floor_soc: f64,
    min_profit_ct: f64,
    ev_charge_power_kw: f64,
}

impl ArbitrageEvaluator {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            ev_target_soc: cfg.ev.target_soc,
            battery_capacity_kwh: cfg.battery.capacity_kwh,
            battery_max_price_ct: cfg.battery.max_price_ct,
            eta_c: cfg.battery.charge_efficiency,
            eta_d: cfg.battery.discharge_efficiency,
            floor_soc: cfg.arbitrage.battery_to_ev_floor_soc,
            min_profit_ct: cfg.arbitrage.min_profit_ct,
            ev_charge_power_kw: cfg.ev.default_charge_power_kw,
        }
    }

    /// Evaluate all gates. Returns the status for publication plus the
    /// command the controller must apply (change detection happens there).
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        state: &SystemState,
        plan: Option<&PlanHorizon>,
        mode_status: &ModeStatus,
        any_ev_connected: bool,
        total_ev_need_kwh: f64,
        tariffs: &[TariffSlot],
        solar_forecast: &[TariffSlot],
        dynamic_buffer_pct: i64,
    ) -> (ArbitrageStatus, ArbitrageCommand) {
        let effective_floor = self.floor_soc.max(dynamic_buffer_pct as f64);

        let inactive = |reason: Option<String>| {
            (
                ArbitrageStatus {
                    active: false,
                    reason,
                    savings_ct: None,
                    usable_kwh: None,
                    effective_floor_pct: effective_floor,
                    dynamic_buffer_pct,
                },
                ArbitrageCommand::Deactivate,
            )
        };

        // Gate 1: EV attached with real charge need
        if !any_ev_connected || tariffs.is_empty() {
            return inactive(Some("Kein EV angeschlossen".to_string()));
        }
        if total_ev_need_kwh < MIN_EV_NEED_KWH {
            return inactive(Some(format!(
                "Kein Ladebedarf ({total_ev_need_kwh:.1} kWh)"
            )));
        }

        // Gate 2: planner authorises battery discharge this slot
        let Some(plan) = plan else {
            return inactive(Some("kein LP-Plan verfuegbar".to_string()));
        };
        if !plan.current_bat_discharge {
            return inactive(Some("LP plant keine Batterie-Entladung".to_string()));
        }

        // Gate 3: EV must be fast-charging
        if mode_status.current_mode != Some(ChargeMode::Now) {
            let mode = mode_status
                .current_mode
                .map_or_else(|| "unbekannt".to_string(), |m| m.to_string());
            return inactive(Some(format!("EV nicht im Sofortladen-Modus ({mode})")));
        }

        // Gate 4: profitable after round-trip losses
        let rt_eff = self.eta_c * self.eta_d;
        let bat_cost_ct = self.battery_max_price_ct / rt_eff;
        let grid_ct = state.current_price * 100.0;
        let savings = grid_ct - bat_cost_ct;
        if savings < self.min_profit_ct {
            return inactive(Some(format!(
                "Nicht profitabel ({savings:.1} ct/kWh < {} ct Minimum)",
                self.min_profit_ct
            )));
        }

        // Gate 5: no cheaper grid window within the lookahead
        for slot in plan.slots.iter().skip(1).take(LOOKAHEAD_SLOTS) {
            let future_ct = slot.price_eur_kwh * 100.0;
            if future_ct < grid_ct * LOOKAHEAD_PRICE_RATIO {
                let when = slot.slot_start.format("%H:%M");
                info!(
                    future_ct = format!("{future_ct:.1}"),
                    now_ct = format!("{grid_ct:.1}"),
                    "lookahead guard blocks battery-to-EV discharge"
                );
                return inactive(Some(format!(
                    "Guenstigere Netzpreise um {when} erwartet"
                )));
            }
        }

        // Gate 6: battery comfortably above the effective floor
        let bat_available =
            ((state.battery_soc - effective_floor) / 100.0 * self.battery_capacity_kwh).max(0.0);
        if bat_available < MIN_USABLE_KWH {
            return inactive(Some(format!(
                "Batterie-SoC ({:.0}%) zu nah an Untergrenze ({effective_floor:.0}%)",
                state.battery_soc
            )));
        }

        // Gate 7: LP must not be discharging to grid only this slot
        if let Some(slot0) = plan.slot0() {
            if slot0.bat_discharge_kw > CHARGE_THRESHOLD_KW
                && slot0.ev_charge_kw < CHARGE_THRESHOLD_KW
            {
                info!("LP grid discharge active, battery-to-EV blocked");
                return inactive(Some(
                    "LP entlaedt zur Netzeinspeisung (Mutual Exclusion)".to_string(),
                ));
            }
        }

        // All gates passed
        let usable = bat_available.min(total_ev_need_kwh);
        let home_kw = if state.home_power > 0.0 { state.home_power / 1000.0 } else { 1.0 };
        let surplus_kwh = solar_surplus_kwh(solar_forecast, home_kw);
        let cheap_hours = tariffs
            .iter()
            .filter(|t| t.value * 100.0 <= self.battery_max_price_ct)
            .count();

        let limits = self.adaptive_limits(
            state.battery_soc,
            effective_floor,
            total_ev_need_kwh,
            surplus_kwh,
            cheap_hours,
        );

        (
            ArbitrageStatus {
                active: true,
                reason: None,
                savings_ct: Some((savings * 10.0).round() / 10.0),
                usable_kwh: Some((usable * 10.0).round() / 10.0),
                effective_floor_pct: effective_floor,
                dynamic_buffer_pct,
            },
            ArbitrageCommand::Activate { usable_kwh: usable, limits },
        )
    }

    /// Derive session limits from how quickly the battery can be refilled.
    fn adaptive_limits(
        &self,
        battery_soc: f64,
        base_floor: f64,
        ev_need_kwh: f64,
        surplus_kwh: f64,
        cheap_hours: usize,
    ) -> AdaptiveLimits {
        let cap = self.battery_capacity_kwh.max(0.1);

        let solar_refill_pct = surplus_kwh / cap * 100.0;
        let grid_refill_pct =
            cheap_hours as f64 * self.ev_charge_power_kw * self.eta_c / cap * 100.0;
        let total_refill_pct = (solar_refill_pct + grid_refill_pct).min(MAX_REFILL_PCT);

        let safe_discharge_pct = total_refill_pct * SAFE_DISCHARGE_FACTOR;
        let dynamic_floor = base_floor.max(battery_soc - safe_discharge_pct);

        let rt_eff = self.eta_c * self.eta_d;
        let need_pct = ev_need_kwh / (cap * rt_eff) * 100.0;
        let target_soc = dynamic_floor.max(battery_soc - need_pct);

        AdaptiveLimits {
            priority_soc: dynamic_floor.round() as i64,
            buffer_soc: target_soc.round() as i64,
            buffer_start_soc: battery_soc.floor().min(95.0) as i64,
        }
    }

    pub fn ev_need_kwh(&self, soc: f64, capacity_kwh: f64) -> f64 {
        ((self.ev_target_soc - soc) / 100.0 * capacity_kwh).max(0.0)
    }
}
