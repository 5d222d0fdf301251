//! Boost-charge override: a driver directive to charge immediately at full
//! power, bypassing the planner. Last activation wins, the previous expiry
//! timer is cancelled, and the override ends after 90 minutes or when the
//! decision loop sees the EV disconnect or reach its target SoC.

use chrono::{DateTime, Duration, Local, Timelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

pub const OVERRIDE_DURATION_MINUTES: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideSource {
    Dashboard,
    Api,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveOverride {
    pub vehicle_name: String,
    pub activated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub activated_by: OverrideSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverrideStatus {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_minutes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_by: Option<OverrideSource>,
}

/// Outcome of an activation attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ActivationResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiet_hours_blocked: Option<bool>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

struct Inner {
    active: Option<ActiveOverride>,
    /// Bumped on every activate/cancel so a stale expiry task is a no-op
    generation: u64,
}

#[derive(Clone)]
pub struct OverrideManager {
    quiet_enabled: bool,
    quiet_start: u32,
    quiet_end: u32,
    inner: Arc<Mutex<Inner>>,
}

impl OverrideManager {
    pub fn new(quiet_enabled: bool, quiet_start: u32, quiet_end: u32) -> Self {
        Self {
            quiet_enabled,
            quiet_start,
            quiet_end,
            inner: Arc::new(Mutex::new(Inner { active: None, generation: 0 })),
        }
    }

    /// Activate boost charge for `vehicle`. Last-wins: any prior override is
    /// replaced and its timer invalidated. The caller flips evcc to `now`.
    pub fn activate(&self, vehicle: &str, source: OverrideSource) -> ActivationResult {
        if self.is_quiet(Local::now().hour()) {
            let message =
                format!("Leise-Stunden aktiv, Laden startet um {:02}:00", self.quiet_end);
            info!(vehicle, "boost blocked by quiet hours");
            return ActivationResult {
                ok: false,
                quiet_hours_blocked: Some(true),
                message,
                expires_at: None,
            };
        }

        let now = Utc::now();
        let expires_at = now + Duration::minutes(OVERRIDE_DURATION_MINUTES);

        let generation = {
            let mut inner = self.inner.lock();
            if let Some(prev) = &inner.active {
                info!(
                    previous = prev.vehicle_name,
                    replacement = vehicle,
                    "replacing active boost override"
                );
            }
            inner.generation += 1;
            inner.active = Some(ActiveOverride {
                vehicle_name: vehicle.to_string(),
                activated_at: now,
                expires_at,
                activated_by: source,
            });
            inner.generation
        };

        // Expiry timer: fires at most once, only for this generation
        let inner = Arc::clone(&self.inner);
        let vehicle_owned = vehicle.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(
                (OVERRIDE_DURATION_MINUTES * 60) as u64,
            ))
            .await;
            let mut guard = inner.lock();
            if guard.generation == generation && guard.active.is_some() {
                guard.active = None;
                info!(vehicle = vehicle_owned, "boost override expired, Planer uebernimmt");
            }
        });

        info!(vehicle, expires = %expires_at, "boost override activated");
        ActivationResult {
            ok: true,
            quiet_hours_blocked: None,
            message: format!("Boost Charge aktiv fuer {vehicle}"),
            expires_at: Some(expires_at),
        }
    }

    /// Clear the active override. The decision loop restores planner control
    /// on its next cycle; no downstream command is issued here.
    pub fn cancel(&self) -> Option<String> {
        let mut inner = self.inner.lock();
        let cancelled = inner.active.take().map(|o| o.vehicle_name);
        if cancelled.is_some() {
            inner.generation += 1;
        }
        cancelled
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active.is_some()
    }

    pub fn active_vehicle(&self) -> Option<String> {
        self.inner.lock().active.as_ref().map(|o| o.vehicle_name.clone())
    }

    pub fn status(&self) -> OverrideStatus {
        let inner = self.inner.lock();
        match &inner.active {
            None => OverrideStatus {
                active: false,
                vehicle: None,
                expires_at: None,
                remaining_minutes: None,
                activated_by: None,
            },
            Some(active) => {
                let remaining =
                    ((active.expires_at - Utc::now()).num_seconds() as f64 / 60.0).max(0.0);
                OverrideStatus {
                    active: true,
                    vehicle: Some(active.vehicle_name.clone()),
                    expires_at: Some(active.expires_at),
                    remaining_minutes: Some((remaining * 10.0).round() / 10.0),
                    activated_by: Some(active.activated_by),
                }
            }
        }
    }

    /// Quiet-hours window with overnight wrap (e.g. 22:00-06:00).
    fn is_quiet(&self, hour: u32) -> bool {
        if !self.quiet_enabled {
            return false;
        }
        let (s, e) = (self.quiet_start, self.quiet_end);
        if s > e {
            hour >= s || hour < e
        } else {
            (s..e).contains(&hour)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn activation_sets_expiry_window() {
        let mgr = OverrideManager::new(false, 22, 6);
        let result = mgr.activate("ioniq", OverrideSource::Dashboard);
        assert!(result.ok);
        assert!(mgr.is_active());

        let status = mgr.status();
        assert_eq!(status.vehicle.as_deref(), Some("ioniq"));
        let remaining = status.remaining_minutes.unwrap();
        assert!(remaining > 85.0 && remaining <= 90.0);
    }

    #[tokio::test]
    async fn last_activation_wins() {
        let mgr = OverrideManager::new(false, 22, 6);
        mgr.activate("ioniq", OverrideSource::Dashboard);
        mgr.activate("zoe", OverrideSource::Api);
        assert_eq!(mgr.active_vehicle().as_deref(), Some("zoe"));
    }

    #[tokio::test]
    async fn cancel_clears_override() {
        let mgr = OverrideManager::new(false, 22, 6);
        mgr.activate("ioniq", OverrideSource::Dashboard);
        assert_eq!(mgr.cancel().as_deref(), Some("ioniq"));
        assert!(!mgr.is_active());
        assert!(mgr.cancel().is_none());
    }

    #[test]
    fn quiet_hours_overnight_wrap() {
        let mgr = OverrideManager::new(true, 22, 6);
        assert!(mgr.is_quiet(23));
        assert!(mgr.is_quiet(2));
        assert!(!mgr.is_quiet(12));
        assert!(!mgr.is_quiet(6));
    }

    #[test]
    fn quiet_hours_daytime_window() {
        let mgr = OverrideManager::new(true, 12, 14);
        assert!(mgr.is_quiet(12));
        assert!(mgr.is_quiet(13));
        assert!(!mgr.is_quiet(14));
        assert!(!mgr.is_quiet(9));
    }

    #[tokio::test]
    async fn quiet_hours_block_activation() {
        let hour = Local::now().hour();
        // Quiet window that always covers the current hour
        let mgr = OverrideManager::new(true, hour, (hour + 1) % 24);
        let result = mgr.activate("ioniq", OverrideSource::Dashboard);
        assert!(!result.ok);
        assert_eq!(result.quiet_hours_blocked, Some(true));
        assert!(!mgr.is_active());
    }
}
