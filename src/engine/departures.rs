//! Departure-time store: vehicle name -> scheduled departure, persisted.
//!
//! Also tracks a per-vehicle inquiry flag so the plug-in departure question
//! is dispatched exactly once per charging session.

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use tracing::warn;

use crate::persist;

pub const DEPARTURE_MODEL_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct DepartureModel {
    version: u32,
    entries: BTreeMap<String, DateTime<Utc>>,
}

struct Inner {
    entries: BTreeMap<String, DateTime<Utc>>,
    inquiry_sent: HashSet<String>,
}

pub struct DepartureStore {
    path: PathBuf,
    default_hour: u32,
    inner: Mutex<Inner>,
}

impl DepartureStore {
    pub fn new(path: PathBuf, default_hour: u32) -> Self {
        let entries = persist::load_model::<DepartureModel>(&path, DEPARTURE_MODEL_VERSION)
            .map(|m| m.entries)
            .unwrap_or_default();
        Self {
            path,
            default_hour,
            inner: Mutex::new(Inner { entries, inquiry_sent: HashSet::new() }),
        }
    }

    pub fn set_departure(&self, vehicle: &str, departure: DateTime<Utc>) {
        let model = {
            let mut inner = self.inner.lock();
            inner.entries.insert(vehicle.to_string(), departure);
            DepartureModel { version: DEPARTURE_MODEL_VERSION, entries: inner.entries.clone() }
        };
        if let Err(e) = persist::write_model(&self.path, &model) {
            warn!(error = %e, "departure store persist failed");
        }
    }

    pub fn departure(&self, vehicle: &str) -> Option<DateTime<Utc>> {
        self.inner.lock().entries.get(vehicle).copied()
    }

    /// Map handed to the planner. Stale (past) entries are skipped; the
    /// `_default` key carries the next occurrence of the configured fallback
    /// departure hour.
    pub fn departure_map(&self, now: DateTime<Utc>) -> HashMap<String, DateTime<Utc>> {
        let mut map: HashMap<String, DateTime<Utc>> = self
            .inner
            .lock()
            .entries
            .iter()
            .filter(|(_, dt)| **dt > now)
            .map(|(name, dt)| (name.clone(), *dt))
            .collect();
        map.insert("_default".to_string(), next_occurrence(self.default_hour, now));
        map
    }

    pub fn is_inquiry_pending(&self, vehicle: &str) -> bool {
        self.inner.lock().inquiry_sent.contains(vehicle)
    }

    pub fn mark_inquiry_sent(&self, vehicle: &str) {
        self.inner.lock().inquiry_sent.insert(vehicle.to_string());
    }

    /// Called when the EV unplugs so the next session asks again.
    pub fn reset_inquiry(&self, vehicle: &str) {
        self.inner.lock().inquiry_sent.remove(vehicle);
    }
}

fn next_occurrence(hour: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .map(|ndt| Utc.from_utc_datetime(&ndt))
        .unwrap_or(now);
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn store() -> (tempfile::TempDir, DepartureStore) {
        let dir = tempfile::tempdir().unwrap();
        let s = DepartureStore::new(dir.path().join("departures.json"), 7);
        (dir, s)
    }

    #[test]
    fn default_departure_is_next_occurrence() {
        let (_d, s) = store();
        let morning = Utc.with_ymd_and_hms(2024, 6, 1, 5, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2024, 6, 1, 20, 0, 0).unwrap();

        let from_morning = s.departure_map(morning)["_default"];
        assert_eq!(from_morning.hour(), 7);
        assert_eq!(from_morning.day(), 1);

        let from_evening = s.departure_map(evening)["_default"];
        assert_eq!(from_evening.hour(), 7);
        assert_eq!(from_evening.day(), 2);
    }

    #[test]
    fn past_departures_are_filtered() {
        let (_d, s) = store();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        s.set_departure("ioniq", now - Duration::hours(2));
        assert!(!s.departure_map(now).contains_key("ioniq"));
        s.set_departure("ioniq", now + Duration::hours(5));
        assert!(s.departure_map(now).contains_key("ioniq"));
    }

    #[test]
    fn inquiry_flag_is_per_vehicle_and_resettable() {
        let (_d, s) = store();
        assert!(!s.is_inquiry_pending("ioniq"));
        s.mark_inquiry_sent("ioniq");
        assert!(s.is_inquiry_pending("ioniq"));
        assert!(!s.is_inquiry_pending("zoe"));
        s.reset_inquiry("ioniq");
        assert!(!s.is_inquiry_pending("ioniq"));
    }

    #[test]
    fn departures_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("departures.json");
        let dt = Utc.with_ymd_and_hms(2024, 6, 2, 7, 30, 0).unwrap();
        {
            let s = DepartureStore::new(path.clone(), 7);
            s.set_departure("ioniq", dt);
        }
        let s = DepartureStore::new(path, 7);
        assert_eq!(s.departure("ioniq"), Some(dt));
    }
}
