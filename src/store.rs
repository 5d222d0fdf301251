//! Single publication point for every per-cycle decision.
//!
//! The decision loop is the only writer; web handlers and the SSE fan-out are
//! readers. `update()` replaces all fields atomically under one mutex, then
//! broadcasts the snapshot to subscriber channels *outside* the critical
//! section. A slow subscriber whose channel is full silently loses the update;
//! the writer never blocks.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::arbitrage::ArbitrageStatus;
use crate::buffer::BufferStatus;
use crate::domain::{PlanAction, PlanHorizon, SystemState, TariffSlot};
use crate::modes::ModeStatus;

/// Pending snapshots a subscriber may buffer before updates are dropped.
const SUBSCRIBER_QUEUE: usize = 10;

/// Everything the decision loop publishes each cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreUpdate {
    pub state: Option<SystemState>,
    pub lp_action: Option<PlanAction>,
    pub rl_action: Option<PlanAction>,
    pub plan: Option<PlanHorizon>,
    pub solar_forecast: Vec<TariffSlot>,
    pub pv_forecast: Option<Vec<f64>>,
    pub consumption_forecast: Option<Vec<f64>>,
    pub buffer_status: Option<BufferStatus>,
    pub mode_status: Option<ModeStatus>,
    pub arbitrage_status: Option<ArbitrageStatus>,
}

/// Self-consistent copy of the store; all fields stem from a single `update`.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSnapshot {
    pub state: Option<SystemState>,
    pub lp_action: Option<PlanAction>,
    pub rl_action: Option<PlanAction>,
    pub plan: Option<PlanHorizon>,
    pub solar_forecast: Vec<TariffSlot>,
    pub pv_forecast: Option<Vec<f64>>,
    pub consumption_forecast: Option<Vec<f64>>,
    pub buffer_status: Option<BufferStatus>,
    pub mode_status: Option<ModeStatus>,
    pub arbitrage_status: Option<ArbitrageStatus>,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Fields {
    current: StoreUpdate,
    last_update: Option<DateTime<Utc>>,
}

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<StoreSnapshot>,
}

#[derive(Default)]
pub struct StateStore {
    fields: Mutex<Fields>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace all fields, then broadcast outside the lock.
    pub fn update(&self, update: StoreUpdate) {
        let snapshot = {
            let mut fields = self.fields.lock();
            fields.current = update;
            fields.last_update = Some(Utc::now());
            Self::snapshot_locked(&fields)
        };
        self.broadcast(snapshot);
    }

    /// Shallow, self-consistent copy of the latest published cycle.
    pub fn snapshot(&self) -> StoreSnapshot {
        let fields = self.fields.lock();
        Self::snapshot_locked(&fields)
    }

    fn snapshot_locked(fields: &Fields) -> StoreSnapshot {
        let c = &fields.current;
        StoreSnapshot {
            state: c.state.clone(),
            lp_action: c.lp_action,
            rl_action: c.rl_action,
            plan: c.plan.clone(),
            solar_forecast: c.solar_forecast.clone(),
            pv_forecast: c.pv_forecast.clone(),
            consumption_forecast: c.consumption_forecast.clone(),
            buffer_status: c.buffer_status.clone(),
            mode_status: c.mode_status.clone(),
            arbitrage_status: c.arbitrage_status.clone(),
            last_update: fields.last_update,
        }
    }

    /// Register an SSE subscriber. The receiver yields one snapshot per
    /// `update`; missed events are not replayed.
    pub fn register_subscriber(&self) -> (Uuid, mpsc::Receiver<StoreSnapshot>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = Uuid::new_v4();
        self.subscribers.lock().push(Subscriber { id, tx });
        (id, rx)
    }

    pub fn unregister_subscriber(&self, id: Uuid) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn broadcast(&self, snapshot: StoreSnapshot) {
        // Snapshot the subscriber list, then send without holding any lock.
        let targets: Vec<(Uuid, mpsc::Sender<StoreSnapshot>)> = {
            let subs = self.subscribers.lock();
            subs.iter().map(|s| (s.id, s.tx.clone())).collect()
        };

        let mut closed = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(snapshot.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow client loses this update; never block the writer.
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }
        if !closed.is_empty() {
            self.subscribers.lock().retain(|s| !closed.contains(&s.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SystemState;

    fn update_with_soc(soc: f64) -> StoreUpdate {
        StoreUpdate {
            state: Some(SystemState { battery_soc: soc, ..Default::default() }),
            ..Default::default()
        }
    }

    #[test]
    fn snapshot_reflects_single_update() {
        let store = StateStore::new();
        store.update(update_with_soc(55.0));
        let snap = store.snapshot();
        assert_eq!(snap.state.unwrap().battery_soc, 55.0);
        assert!(snap.last_update.is_some());
    }

    #[test]
    fn identical_updates_yield_identical_snapshots() {
        let store = StateStore::new();
        store.update(update_with_soc(42.0));
        let a = store.snapshot();
        store.update(update_with_soc(42.0));
        let b = store.snapshot();
        assert_eq!(
            serde_json::to_value(&a.state).unwrap(),
            serde_json::to_value(&b.state).unwrap()
        );
        assert_eq!(a.lp_action, b.lp_action);
    }

    #[test]
    fn last_update_is_monotonic() {
        let store = StateStore::new();
        store.update(StoreUpdate::default());
        let first = store.snapshot().last_update.unwrap();
        store.update(StoreUpdate::default());
        let second = store.snapshot().last_update.unwrap();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn subscriber_receives_broadcast() {
        let store = StateStore::new();
        let (_id, mut rx) = store.register_subscriber();
        store.update(update_with_soc(33.0));
        let snap = rx.recv().await.unwrap();
        assert_eq!(snap.state.unwrap().battery_soc, 33.0);
    }

    #[tokio::test]
    async fn full_subscriber_queue_drops_updates_without_blocking() {
        let store = StateStore::new();
        let (_id, mut rx) = store.register_subscriber();
        for i in 0..30 {
            store.update(update_with_soc(f64::from(i)));
        }
        // Queue holds at most SUBSCRIBER_QUEUE snapshots; the rest were dropped.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= SUBSCRIBER_QUEUE);
        assert!(received > 0);
    }

    #[test]
    fn unregister_removes_subscriber() {
        let store = StateStore::new();
        let (id, rx) = store.register_subscriber();
        assert_eq!(store.subscriber_count(), 1);
        drop(rx);
        store.unregister_subscriber(id);
        assert_eq!(store.subscriber_count(), 0);
    }
}
