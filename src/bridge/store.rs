//! Device state store: latest sample and liveness metadata per device.
//!
//! The store is a plain map with no interior locking. All mutation goes
//! through the single [`BridgeActor`](crate::bridge::BridgeActor), which is
//! the only owner, so an incoming update and a prune for the same device can
//! never interleave.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};

use crate::bridge::alerts::AlertState;
use crate::config::Thresholds;
use crate::{AlertEvent, MetricKind, MetricSample};

/// Everything the bridge knows about one device.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub device_id: String,
    pub latest_sample: MetricSample,
    pub last_seen_at: DateTime<Utc>,
    alerts: AlertState,
}

impl DeviceState {
    /// Metrics currently above their threshold for this device.
    pub fn active_alerts(&self) -> &BTreeSet<MetricKind> {
        self.alerts.active()
    }
}

#[derive(Debug)]
pub struct DeviceStateStore {
    devices: HashMap<String, DeviceState>,
    thresholds: Thresholds,
}

impl DeviceStateStore {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            devices: HashMap::new(),
            thresholds,
        }
    }

    /// Apply one incoming sample: overwrite the latest sample, refresh the
    /// liveness timestamp and evaluate alert transitions.
    ///
    /// Re-applying the same sample is idempotent apart from `last_seen_at`,
    /// which makes at-least-once delivery from the broker harmless.
    pub fn apply(&mut self, sample: &MetricSample, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let state = self
            .devices
            .entry(sample.device_id.clone())
            .or_insert_with(|| DeviceState {
                device_id: sample.device_id.clone(),
                latest_sample: sample.clone(),
                last_seen_at: now,
                alerts: AlertState::default(),
            });

        state.latest_sample = sample.clone();
        state.last_seen_at = now;
        state.alerts.observe(sample, &self.thresholds, now)
    }

    /// Remove devices not seen within `window`, returning their ids.
    ///
    /// Idempotent: a second sweep over the same state removes nothing.
    pub fn prune(&mut self, now: DateTime<Utc>, window: Duration) -> Vec<String> {
        let mut removed = vec![];
        self.devices.retain(|device_id, state| {
            let expired = now.signed_duration_since(state.last_seen_at) > window;
            if expired {
                removed.push(device_id.clone());
            }
            !expired
        });
        removed
    }

    /// Immutable copy of every device's latest sample, for new subscribers.
    pub fn snapshot(&self) -> HashMap<String, MetricSample> {
        self.devices
            .iter()
            .map(|(id, state)| (id.clone(), state.latest_sample.clone()))
            .collect()
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceState> {
        self.devices.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Threshold;

    fn sample(device_id: &str, cpu: f64) -> MetricSample {
        MetricSample {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            cpu_percent: Some(cpu),
            mem_percent: Some(40.0),
            disk_percent: None,
            gpu_percent: None,
            agent_metrics: Default::default(),
        }
    }

    #[test]
    fn apply_inserts_and_overwrites() {
        let mut store = DeviceStateStore::new(Thresholds::default());
        let now = Utc::now();

        store.apply(&sample("dev-a", 10.0), now);
        store.apply(&sample("dev-a", 20.0), now);
        store.apply(&sample("dev-b", 30.0), now);

        assert_eq!(store.len(), 2);
        assert_eq!(
            store.get("dev-a").unwrap().latest_sample.cpu_percent,
            Some(20.0)
        );
    }

    #[test]
    fn duplicate_delivery_is_idempotent() {
        let thresholds = Thresholds {
            cpu: Some(Threshold {
                limit: 90.0,
                cooldown_secs: 0,
            }),
            ..Default::default()
        };
        let mut store = DeviceStateStore::new(thresholds);
        let now = Utc::now();
        let s = sample("dev-a", 95.0);

        let first = store.apply(&s, now);
        let state_after_one = store.get("dev-a").unwrap().clone();

        // the broker redelivers the same message
        let second = store.apply(&s, now);
        let state_after_two = store.get("dev-a").unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty(), "duplicate must not re-fire the alert");
        assert_eq!(state_after_one.latest_sample, state_after_two.latest_sample);
        assert_eq!(
            state_after_one.active_alerts(),
            state_after_two.active_alerts()
        );
    }

    #[test]
    fn prune_removes_only_expired_devices() {
        let mut store = DeviceStateStore::new(Thresholds::default());
        let now = Utc::now();

        store.apply(&sample("old", 10.0), now - Duration::seconds(120));
        store.apply(&sample("fresh", 10.0), now);

        let removed = store.prune(now, Duration::seconds(30));
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(store.get("old").is_none());
        assert!(store.get("fresh").is_some());
    }

    #[test]
    fn prune_is_idempotent() {
        let mut store = DeviceStateStore::new(Thresholds::default());
        let now = Utc::now();

        store.apply(&sample("old", 10.0), now - Duration::seconds(120));

        assert_eq!(store.prune(now, Duration::seconds(30)).len(), 1);
        assert!(store.prune(now, Duration::seconds(30)).is_empty());
    }

    #[test]
    fn update_resets_liveness() {
        let mut store = DeviceStateStore::new(Thresholds::default());
        let now = Utc::now();

        store.apply(&sample("dev-a", 10.0), now - Duration::seconds(120));
        store.apply(&sample("dev-a", 11.0), now);

        assert!(store.prune(now, Duration::seconds(30)).is_empty());
    }

    #[test]
    fn snapshot_contains_latest_samples() {
        let mut store = DeviceStateStore::new(Thresholds::default());
        let now = Utc::now();

        store.apply(&sample("dev-a", 10.0), now);
        store.apply(&sample("dev-a", 55.0), now);
        store.apply(&sample("dev-b", 20.0), now);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["dev-a"].cpu_percent, Some(55.0));
        assert_eq!(snapshot["dev-b"].cpu_percent, Some(20.0));
    }
}
