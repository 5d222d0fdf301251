//! Vehicle registry and background pollers.
//!
//! Long-lived per-vehicle state: last known SoC (possibly stale), manual
//! driver-entered SoC, wallbox connection, and provider polling metadata.
//! One poller task runs per provider that supports active polling, with an
//! exponential back-off ladder on failures.

pub mod provider;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::VehicleProviderConfig;
use crate::evcc::Loadpoint;
use crate::persist;
pub use provider::{PollBackoff, ProviderError, VehicleData, VehicleProvider};

pub const MANUAL_SOC_VERSION: u32 = 1;

/// Provider data older than this counts as stale unless a manual SoC exists
const STALE_AFTER_MINUTES: i64 = 60;

#[derive(Debug, Clone, Serialize)]
pub struct Vehicle {
    pub name: String,
    pub capacity_kwh: f64,
    pub charge_power_kw: f64,
    pub provider_type: String,

    /// Last SoC from provider or wallbox; may be stale
    pub soc: Option<f64>,
    /// Driver-entered SoC; wins over polled data until cleared
    pub manual_soc: Option<f64>,
    pub connected: bool,
    pub charging: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub last_poll: Option<DateTime<Utc>>,
}

impl Vehicle {
    /// Stale: no update for an hour and no manual override to fall back on.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        if self.manual_soc.is_some() {
            return false;
        }
        match self.last_update {
            None => true,
            Some(ts) => now - ts > Duration::minutes(STALE_AFTER_MINUTES),
        }
    }

    /// Manual SoC wins until cleared.
    pub fn effective_soc(&self) -> Option<f64> {
        self.manual_soc.or(self.soc)
    }

    pub fn need_kwh(&self, target_soc: f64) -> f64 {
        match self.effective_soc() {
            Some(soc) => ((target_soc - soc) / 100.0 * self.capacity_kwh).max(0.0),
            None => 0.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ManualSocModel {
    version: u32,
    entries: BTreeMap<String, ManualSocEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManualSocEntry {
    soc: f64,
    entered_at: DateTime<Utc>,
}

pub struct VehicleRegistry {
    manual_path: PathBuf,
    vehicles: Mutex<BTreeMap<String, Vehicle>>,
}

impl VehicleRegistry {
    pub fn new(manual_path: PathBuf, configs: &[VehicleProviderConfig]) -> Self {
        let mut vehicles = BTreeMap::new();
        for cfg in configs {
            vehicles.insert(
                cfg.name.clone(),
                Vehicle {
                    name: cfg.name.clone(),
                    capacity_kwh: cfg.capacity_kwh,
                    charge_power_kw: cfg.charge_power_kw,
                    provider_type: format!("{:?}", cfg.provider).to_lowercase(),
                    soc: None,
                    manual_soc: None,
                    connected: false,
                    charging: false,
                    last_update: None,
                    last_poll: None,
                },
            );
        }

        if let Some(model) = persist::load_model::<ManualSocModel>(&manual_path, MANUAL_SOC_VERSION)
        {
            for (name, entry) in model.entries {
                if let Some(v) = vehicles.get_mut(&name) {
                    v.manual_soc = Some(entry.soc);
                }
            }
        }

        Self { manual_path, vehicles: Mutex::new(vehicles) }
    }

    /// Merge the wallbox view into the registry each cycle. Unknown vehicle
    /// names get a registry entry with the configured EV defaults.
    pub fn sync_from_loadpoint(
        &self,
        loadpoint: &Loadpoint,
        default_capacity_kwh: f64,
        default_charge_power_kw: f64,
    ) {
        let Some(name) = loadpoint.vehicle_name.clone().filter(|n| !n.is_empty()) else {
            return;
        };
        let mut vehicles = self.vehicles.lock();
        let vehicle = vehicles.entry(name.clone()).or_insert_with(|| Vehicle {
            name,
            capacity_kwh: loadpoint.vehicle_capacity.unwrap_or(default_capacity_kwh),
            charge_power_kw: default_charge_power_kw,
            provider_type: "evcc".to_string(),
            soc: None,
            manual_soc: None,
            connected: false,
            charging: false,
            last_update: None,
            last_poll: None,
        });
        vehicle.connected = loadpoint.connected;
        vehicle.charging = loadpoint.charging;
        if let Some(soc) = loadpoint.vehicle_soc {
            vehicle.soc = Some(soc);
            vehicle.last_update = Some(Utc::now());
        }
        if !loadpoint.connected {
            // Session over: a driver-entered SoC no longer applies
            if vehicle.manual_soc.take().is_some() {
                drop(vehicles);
                self.persist_manual();
            }
        }
    }

    pub fn apply_provider_data(&self, name: &str, data: &VehicleData) {
        let cleared_manual = {
            let mut vehicles = self.vehicles.lock();
            let Some(vehicle) = vehicles.get_mut(name) else { return };
            vehicle.soc = data.soc.or(vehicle.soc);
            vehicle.charging = data.charging;
            vehicle.last_update = Some(data.timestamp);
            vehicle.last_poll = Some(Utc::now());
            // Fresh provider data supersedes a driver-entered value
            vehicle.manual_soc.take().is_some()
        };
        if cleared_manual {
            self.persist_manual();
        }
    }

    pub fn record_poll_attempt(&self, name: &str) {
        if let Some(v) = self.vehicles.lock().get_mut(name) {
            v.last_poll = Some(Utc::now());
        }
    }

    pub fn set_manual_soc(&self, name: &str, soc: f64) -> bool {
        let known = {
            let mut vehicles = self.vehicles.lock();
            match vehicles.get_mut(name) {
                Some(v) => {
                    v.manual_soc = Some(soc.clamp(0.0, 100.0));
                    true
                }
                None => false,
            }
        };
        if known {
            self.persist_manual();
        }
        known
    }

    pub fn get(&self, name: &str) -> Option<Vehicle> {
        self.vehicles.lock().get(name).cloned()
    }

    pub fn all(&self) -> Vec<Vehicle> {
        self.vehicles.lock().values().cloned().collect()
    }

    pub fn any_connected(&self) -> bool {
        self.vehicles.lock().values().any(|v| v.connected)
    }

    /// Total charge need of every vehicle with a believable SoC.
    pub fn total_need_kwh(&self, target_soc: f64) -> f64 {
        self.vehicles
            .lock()
            .values()
            .filter(|v| v.effective_soc().is_some() || v.connected)
            .map(|v| v.need_kwh(target_soc))
            .sum()
    }

    fn persist_manual(&self) {
        let model = {
            let vehicles = self.vehicles.lock();
            ManualSocModel {
                version: MANUAL_SOC_VERSION,
                entries: vehicles
                    .iter()
                    .filter_map(|(name, v)| {
                        v.manual_soc.map(|soc| {
                            (name.clone(), ManualSocEntry { soc, entered_at: Utc::now() })
                        })
                    })
                    .collect(),
            }
        };
        if let Err(e) = persist::write_model(&self.manual_path, &model) {
            warn!(error = %e, "manual SoC persist failed");
        }
    }
}

/// Spawn one poller task per provider that supports active polling.
pub fn spawn_pollers(
    registry: Arc<VehicleRegistry>,
    configs: &[VehicleProviderConfig],
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for cfg in configs {
        let provider = match VehicleProvider::from_config(cfg) {
            Ok(p) => p,
            Err(e) => {
                warn!(vehicle = cfg.name, error = %e, "provider init failed");
                continue;
            }
        };
        if !provider.supports_active_poll() {
            debug!(vehicle = cfg.name, "provider has no active poll, skipping poller");
            continue;
        }
        let registry = Arc::clone(&registry);
        let name = cfg.name.clone();
        let interval = std::time::Duration::from_secs(cfg.poll_interval_minutes * 60);
        handles.push(tokio::spawn(async move {
            poll_loop(registry, provider, name, interval).await;
        }));
    }
    handles
}

async fn poll_loop(
    registry: Arc<VehicleRegistry>,
    provider: VehicleProvider,
    name: String,
    interval: std::time::Duration,
) {
    let mut backoff = PollBackoff::default();
    info!(vehicle = name, provider = provider.kind_name(), "vehicle poller started");
    loop {
        registry.record_poll_attempt(&name);
        match provider.poll().await {
            Ok(data) => {
                debug!(vehicle = name, soc = ?data.soc, "vehicle poll ok");
                registry.apply_provider_data(&name, &data);
                backoff.reset();
            }
            Err(e) => {
                backoff.record_failure();
                warn!(
                    vehicle = name,
                    error = %e,
                    retry_in_s = backoff.current_delay().map(|d| d.as_secs()),
                    "vehicle poll failed, backing off"
                );
            }
        }
        let sleep_for = backoff.current_delay().unwrap_or(interval);
        tokio::time::sleep(sleep_for).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;

    fn provider_cfg(name: &str) -> VehicleProviderConfig {
        VehicleProviderConfig {
            name: name.to_string(),
            provider: ProviderKind::Manual,
            capacity_kwh: 30.0,
            charge_power_kw: 11.0,
            poll_interval_minutes: 30,
            api_url: None,
            username: None,
            password: None,
        }
    }

    fn registry() -> (tempfile::TempDir, VehicleRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let r = VehicleRegistry::new(dir.path().join("manual_soc.json"), &[provider_cfg("ioniq")]);
        (dir, r)
    }

    fn connected_loadpoint(name: &str, soc: Option<f64>) -> Loadpoint {
        Loadpoint {
            mode: Some("pv".to_string()),
            connected: true,
            charging: false,
            vehicle_soc: soc,
            vehicle_name: Some(name.to_string()),
            vehicle_capacity: Some(30.0),
            charge_power: None,
        }
    }

    #[test]
    fn staleness_predicate() {
        let (_d, r) = registry();
        let now = Utc::now();
        let mut v = r.get("ioniq").unwrap();
        assert!(v.is_stale(now)); // never updated

        v.last_update = Some(now - Duration::minutes(30));
        assert!(!v.is_stale(now));

        v.last_update = Some(now - Duration::minutes(90));
        assert!(v.is_stale(now));

        v.manual_soc = Some(60.0);
        assert!(!v.is_stale(now)); // manual override suppresses staleness
    }

    #[test]
    fn manual_soc_wins_until_cleared() {
        let (_d, r) = registry();
        r.sync_from_loadpoint(&connected_loadpoint("ioniq", Some(40.0)), 30.0, 11.0);
        assert!(r.set_manual_soc("ioniq", 70.0));
        assert_eq!(r.get("ioniq").unwrap().effective_soc(), Some(70.0));

        // Fresh provider data clears the override
        let data = VehicleData {
            soc: Some(45.0),
            charging: false,
            plugged_in: true,
            timestamp: Utc::now(),
        };
        r.apply_provider_data("ioniq", &data);
        assert_eq!(r.get("ioniq").unwrap().effective_soc(), Some(45.0));
    }

    #[test]
    fn disconnect_clears_manual_soc() {
        let (_d, r) = registry();
        r.sync_from_loadpoint(&connected_loadpoint("ioniq", Some(40.0)), 30.0, 11.0);
        r.set_manual_soc("ioniq", 70.0);

        let mut lp = connected_loadpoint("ioniq", None);
        lp.connected = false;
        r.sync_from_loadpoint(&lp, 30.0, 11.0);
        assert!(r.get("ioniq").unwrap().manual_soc.is_none());
    }

    #[test]
    fn unknown_loadpoint_vehicle_is_registered() {
        let (_d, r) = registry();
        r.sync_from_loadpoint(&connected_loadpoint("zoe", Some(55.0)), 27.0, 11.0);
        let v = r.get("zoe").unwrap();
        assert_eq!(v.provider_type, "evcc");
        assert!(v.connected);
        assert_eq!(v.soc, Some(55.0));
    }

    #[test]
    fn total_need_sums_vehicles_below_target() {
        let (_d, r) = registry();
        r.sync_from_loadpoint(&connected_loadpoint("ioniq", Some(50.0)), 30.0, 11.0);
        // (80-50)/100 * 30 = 9 kWh
        assert!((r.total_need_kwh(80.0) - 9.0).abs() < 1e-9);
    }

    #[test]
    fn manual_soc_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manual_soc.json");
        {
            let r = VehicleRegistry::new(path.clone(), &[provider_cfg("ioniq")]);
            r.set_manual_soc("ioniq", 66.0);
        }
        let r = VehicleRegistry::new(path, &[provider_cfg("ioniq")]);
        assert_eq!(r.get("ioniq").unwrap().manual_soc, Some(66.0));
    }

    #[test]
    fn need_is_zero_without_soc() {
        let (_d, r) = registry();
        assert_eq!(r.total_need_kwh(80.0), 0.0);
    }
}
