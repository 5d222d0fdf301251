use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::SystemState;

/// kW below which a continuous LP decision is treated as "off"
pub const CHARGE_THRESHOLD_KW: f64 = 0.1;

/// Number of 15-minute slots in the 24h horizon
pub const HORIZON_SLOTS: usize = 96;

/// Slot duration in hours
pub const SLOT_HOURS: f64 = 0.25;

/// evcc loadpoint charge mode
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChargeMode {
    Now,
    #[strum(serialize = "minpv")]
    #[serde(rename = "minpv")]
    MinPv,
    Pv,
}

/// One 15-minute entry of a dispatch plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSlot {
    pub slot_index: usize,
    pub slot_start: DateTime<Utc>,
    /// kW, >= 0; at most one of charge/discharge is non-zero by LP construction
    pub bat_charge_kw: f64,
    pub bat_discharge_kw: f64,
    pub ev_charge_kw: f64,
    pub ev_name: String,
    pub price_eur_kwh: f64,
    pub pv_kw: f64,
    pub load_kw: f64,
    /// Predicted SoC at the slot boundary, percent
    pub bat_soc_pct: f64,
    pub ev_soc_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverStatus {
    Optimal,
    Infeasible,
    Unbounded,
    Failed,
}

/// A solved 24h dispatch horizon. Only produced when the LP reached optimality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanHorizon {
    pub computed_at: DateTime<Utc>,
    pub slots: Vec<DispatchSlot>,
    pub solver_status: SolverStatus,
    /// Objective value in EUR over the horizon
    pub objective_eur: f64,
    /// Price slots that were padded with the last known price
    pub padded_slots: usize,

    pub current_bat_charge: bool,
    pub current_bat_discharge: bool,
    pub current_ev_charge: bool,
    /// Effective price limit for the current slot, EUR/kWh
    pub current_price_limit: f64,
}

impl PlanHorizon {
    pub fn slot0(&self) -> Option<&DispatchSlot> {
        self.slots.first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BatteryAction {
    Hold,
    Charge,
    Discharge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EvAction {
    Idle,
    Charge,
}

/// The current-slot command derived from a plan. This is what the controller
/// dispatches to evcc and what the residual learner may adjust.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanAction {
    pub battery_action: BatteryAction,
    /// Grid-charge price limit for the battery, EUR/kWh
    pub battery_limit_eur: Option<f64>,
    pub ev_action: EvAction,
    /// Smart-cost limit for the EV, EUR/kWh
    pub ev_limit_eur: Option<f64>,
}

impl PlanAction {
    /// Conservative default when no plan is available: hold everything.
    pub fn hold() -> Self {
        Self {
            battery_action: BatteryAction::Hold,
            battery_limit_eur: None,
            ev_action: EvAction::Idle,
            ev_limit_eur: None,
        }
    }

    pub fn from_plan(plan: &PlanHorizon, state: &SystemState) -> Self {
        let battery_action = if plan.current_bat_charge {
            BatteryAction::Charge
        } else if plan.current_bat_discharge {
            BatteryAction::Discharge
        } else {
            BatteryAction::Hold
        };

        let ev_action = if plan.current_ev_charge && state.ev_connected {
            EvAction::Charge
        } else {
            EvAction::Idle
        };

        Self {
            battery_action,
            battery_limit_eur: plan.current_bat_charge.then_some(plan.current_price_limit),
            ev_action,
            ev_limit_eur: (ev_action == EvAction::Charge).then_some(plan.current_price_limit),
        }
    }

    /// Stable label used by the reaction-timing tracker.
    pub fn label(&self) -> String {
        format!("bat_{}+ev_{}", self.battery_action, self.ev_action)
    }
}
