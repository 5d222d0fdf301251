//! evcc charge-mode control and manual-override detection.
//!
//! Maps the LP plan and price context onto the loadpoint mode (now/minpv/pv).
//! A mode the dispatcher did not set itself is a manual override and is
//! respected until the EV disconnects or reaches its target SoC. On startup
//! the currently reported mode is adopted as baseline without sending a
//! command.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::str::FromStr;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::domain::{ChargeMode, PlanHorizon, SystemState};
use crate::evcc::{EvccClient, EvccState};

/// Continuous unreachability beyond this raises a dashboard warning
const UNREACHABLE_WARN_MINUTES: i64 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct ModeStatus {
    pub active: bool,
    pub current_mode: Option<ChargeMode>,
    pub target_mode: Option<ChargeMode>,
    pub override_active: bool,
    pub override_mode: Option<ChargeMode>,
    pub override_since: Option<DateTime<Utc>>,
    pub evcc_reachable: bool,
    pub evcc_unreachable_since: Option<DateTime<Utc>>,
    pub startup_complete: bool,
    /// German warning once evcc has been unreachable for too long
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

pub struct ModeController {
    ev_target_soc: f64,
    ev_max_price_eur: f64,

    last_set_mode: Option<ChargeMode>,
    override_active: bool,
    override_mode: Option<ChargeMode>,
    override_since: Option<DateTime<Utc>>,
    unreachable_since: Option<DateTime<Utc>>,
    startup_complete: bool,
    current_mode: Option<ChargeMode>,
}

impl ModeController {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            ev_target_soc: cfg.ev.target_soc,
            ev_max_price_eur: cfg.ev.max_price_ct / 100.0,
            last_set_mode: None,
            override_active: false,
            override_mode: None,
            override_since: None,
            unreachable_since: None,
            startup_complete: false,
            current_mode: None,
        }
    }

    /// Pure mode decision: same inputs, same output.
    pub fn decide_mode(
        &self,
        state: &SystemState,
        plan: Option<&PlanHorizon>,
        departure_urgent: bool,
    ) -> ChargeMode {
        if !state.ev_connected {
            return ChargeMode::Pv;
        }
        if state.ev_soc >= self.ev_target_soc {
            return ChargeMode::Pv;
        }
        if departure_urgent {
            return ChargeMode::Now;
        }
        let Some(plan) = plan else {
            return ChargeMode::Pv;
        };
        if !plan.current_ev_charge {
            return ChargeMode::Pv;
        }

        let price = state.current_price;
        let p = &state.price_percentiles;
        if !p.is_empty() {
            let p30 = p.get(&30).copied().unwrap_or(price);
            let p60 = p.get(&60).copied().unwrap_or(price);
            if price <= p30 {
                ChargeMode::Now
            } else if price <= p60 {
                ChargeMode::MinPv
            } else {
                ChargeMode::Pv
            }
        } else if price <= self.ev_max_price_eur * 0.5 {
            ChargeMode::Now
        } else if price <= self.ev_max_price_eur * 0.8 {
            ChargeMode::MinPv
        } else {
            ChargeMode::Pv
        }
    }

    /// One mode-control cycle. Reads the raw evcc state the collector already
    /// fetched; issues at most one mode command.
    pub async fn step(
        &mut self,
        state: &SystemState,
        plan: Option<&PlanHorizon>,
        evcc_state: Option<&EvccState>,
        departure_urgent: bool,
        evcc: &EvccClient,
    ) -> ModeStatus {
        let now = Utc::now();

        let Some(evcc_state) = evcc_state else {
            if self.unreachable_since.is_none() {
                self.unreachable_since = Some(now);
                warn!("evcc unreachable");
            }
            return self.status(now);
        };

        let Some(loadpoint) = evcc_state.first_loadpoint() else {
            warn!("evcc state has no loadpoints");
            return self.status(now);
        };
        let Some(reported_mode) = loadpoint
            .mode
            .as_deref()
            .and_then(|m| ChargeMode::from_str(m).ok())
        else {
            warn!("loadpoint reports no usable mode");
            return self.status(now);
        };

        if self.unreachable_since.take().is_some() {
            info!("evcc wieder erreichbar");
        }
        self.current_mode = Some(reported_mode);

        // Startup: adopt whatever evcc runs right now, send nothing
        if !self.startup_complete {
            self.last_set_mode = Some(reported_mode);
            self.startup_complete = true;
            info!(mode = %reported_mode, "startup: evcc mode adopted as baseline");
            return self.status(now);
        }

        if self.override_active {
            let ended_reason = if !state.ev_connected || !loadpoint.connected {
                Some("EV abgekoppelt".to_string())
            } else if state.ev_soc >= self.ev_target_soc {
                Some(format!("Ziel-SoC {:.0}% erreicht", self.ev_target_soc))
            } else {
                None
            };

            if let Some(reason) = ended_reason {
                info!(reason, "Override beendet, Dispatcher uebernimmt");
                self.override_active = false;
                self.override_mode = None;
                self.override_since = None;
                // Reset baseline so the manual mode is not re-detected
                self.last_set_mode = None;
            }
            // In both cases: no command this cycle
            return self.status(now);
        }

        // Manual override: evcc runs a mode we did not set
        if self
            .last_set_mode
            .is_some_and(|last| last != reported_mode)
        {
            self.override_active = true;
            self.override_mode = Some(reported_mode);
            self.override_since = Some(now);
            info!(mode = %reported_mode, "Override erkannt, Modus-Steuerung pausiert");
            return self.status(now);
        }

        let target = self.decide_mode(state, plan, departure_urgent);
        if target != reported_mode {
            match evcc.set_loadpoint_mode(0, target).await {
                Ok(()) => {
                    info!(from = %reported_mode, to = %target, "loadpoint mode changed");
                    self.last_set_mode = Some(target);
                }
                Err(e) => warn!(error = %e, mode = %target, "set_loadpoint_mode failed"),
            }
        } else {
            self.last_set_mode = Some(reported_mode);
        }

        self.status(now)
    }

    pub fn status(&self, now: DateTime<Utc>) -> ModeStatus {
        let warning = self.unreachable_since.and_then(|since| {
            let minutes = (now - since).num_minutes();
            (minutes > UNREACHABLE_WARN_MINUTES)
                .then(|| format!("evcc nicht erreichbar seit {}", since.format("%H:%M")))
        });
        ModeStatus {
            active: self.startup_complete,
            current_mode: self.current_mode,
            target_mode: self.last_set_mode,
            override_active: self.override_active,
            override_mode: self.override_mode,
            override_since: self.override_since,
            evcc_reachable: self.unreachable_since.is_none(),
            evcc_unreachable_since: self.unreachable_since,
            startup_complete: self.startup_complete,
            warning,
        }
    }

    pub fn current_status(&self) -> ModeStatus {
        self.status(Utc::now())
    }
}
