//! Edge-triggered threshold evaluation.
//!
//! A metric transitions into "alert active" only when it crosses from
//! at-or-below to strictly-above its threshold; exactly one [`AlertEvent`] is
//! emitted for that transition. While the metric stays above the threshold no
//! further events fire. Observing the metric at-or-below the threshold clears
//! the flag so a later crossing can trigger again.
//!
//! An optional cooldown suppresses the *event* (not the flag) when a new
//! rising edge follows the previous fired event too closely.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, trace};

use crate::config::Thresholds;
use crate::{AlertEvent, MetricKind, MetricSample};

/// Per-device alert bookkeeping, owned by the device's state entry.
#[derive(Debug, Clone, Default)]
pub struct AlertState {
    active: BTreeSet<MetricKind>,
    last_fired: HashMap<MetricKind, DateTime<Utc>>,
}

impl AlertState {
    /// Evaluate one sample against the configured thresholds.
    ///
    /// Returns the events for every rising edge. A metric absent from the
    /// sample is not observed at all: it neither fires nor clears.
    pub fn observe(
        &mut self,
        sample: &MetricSample,
        thresholds: &Thresholds,
        now: DateTime<Utc>,
    ) -> Vec<AlertEvent> {
        let mut events = vec![];

        for kind in MetricKind::ALL {
            let Some(threshold) = thresholds.get(kind) else {
                continue;
            };
            let Some(value) = sample.metric(kind) else {
                continue;
            };

            let above = value > threshold.limit;
            let was_active = self.active.contains(&kind);

            match (was_active, above) {
                (false, true) => {
                    self.active.insert(kind);

                    let cooled_down = self.last_fired.get(&kind).is_none_or(|fired| {
                        now.signed_duration_since(*fired)
                            >= Duration::seconds(threshold.cooldown_secs as i64)
                    });

                    if cooled_down {
                        debug!(
                            "{}: {kind} crossed threshold ({value:.1} > {:.1})",
                            sample.device_id, threshold.limit
                        );
                        self.last_fired.insert(kind, now);
                        events.push(AlertEvent {
                            device_id: sample.device_id.clone(),
                            metric: kind,
                            value,
                            threshold: threshold.limit,
                            transitioned_at: now,
                        });
                    } else {
                        trace!(
                            "{}: {kind} crossing within cooldown, suppressed",
                            sample.device_id
                        );
                    }
                }
                (true, false) => {
                    debug!("{}: {kind} back below threshold ({value:.1})", sample.device_id);
                    self.active.remove(&kind);
                }
                _ => {}
            }
        }

        events
    }

    /// Metrics currently above their threshold.
    pub fn active(&self) -> &BTreeSet<MetricKind> {
        &self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Threshold;
    use chrono::Utc;

    fn thresholds(cpu_limit: f64, cooldown_secs: u64) -> Thresholds {
        Thresholds {
            cpu: Some(Threshold {
                limit: cpu_limit,
                cooldown_secs,
            }),
            ..Default::default()
        }
    }

    fn cpu_sample(value: Option<f64>) -> MetricSample {
        MetricSample {
            device_id: "dev-1".into(),
            timestamp: Utc::now(),
            cpu_percent: value,
            mem_percent: None,
            disk_percent: None,
            gpu_percent: None,
            agent_metrics: Default::default(),
        }
    }

    #[test]
    fn fires_once_per_rising_edge() {
        let thresholds = thresholds(90.0, 0);
        let mut state = AlertState::default();
        let now = Utc::now();

        let mut fired = 0;
        for value in [50.0, 95.0, 96.0, 40.0, 97.0] {
            fired += state
                .observe(&cpu_sample(Some(value)), &thresholds, now)
                .len();
        }

        // edges at 50→95 and 40→97, not at 95→96
        assert_eq!(fired, 2);
    }

    #[test]
    fn event_carries_value_and_threshold() {
        let thresholds = thresholds(90.0, 0);
        let mut state = AlertState::default();
        let now = Utc::now();

        let events = state.observe(&cpu_sample(Some(95.5)), &thresholds, now);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metric, MetricKind::Cpu);
        assert_eq!(events[0].value, 95.5);
        assert_eq!(events[0].threshold, 90.0);
        assert_eq!(events[0].device_id, "dev-1");
    }

    #[test]
    fn exactly_at_threshold_does_not_fire() {
        let thresholds = thresholds(90.0, 0);
        let mut state = AlertState::default();

        let events = state.observe(&cpu_sample(Some(90.0)), &thresholds, Utc::now());
        assert!(events.is_empty());
        assert!(state.active().is_empty());
    }

    #[test]
    fn active_flag_tracks_threshold_state() {
        let thresholds = thresholds(90.0, 0);
        let mut state = AlertState::default();
        let now = Utc::now();

        state.observe(&cpu_sample(Some(95.0)), &thresholds, now);
        assert!(state.active().contains(&MetricKind::Cpu));

        state.observe(&cpu_sample(Some(90.0)), &thresholds, now);
        assert!(state.active().is_empty());
    }

    #[test]
    fn absent_metric_neither_fires_nor_clears() {
        let thresholds = thresholds(90.0, 0);
        let mut state = AlertState::default();
        let now = Utc::now();

        state.observe(&cpu_sample(Some(95.0)), &thresholds, now);
        assert!(state.active().contains(&MetricKind::Cpu));

        // sensor disappears; the alert stays active
        let events = state.observe(&cpu_sample(None), &thresholds, now);
        assert!(events.is_empty());
        assert!(state.active().contains(&MetricKind::Cpu));
    }

    #[test]
    fn unconfigured_metric_never_fires() {
        let mut state = AlertState::default();
        let events = state.observe(
            &cpu_sample(Some(99.9)),
            &Thresholds::default(),
            Utc::now(),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn cooldown_suppresses_rapid_retrigger() {
        let thresholds = thresholds(90.0, 60);
        let mut state = AlertState::default();
        let start = Utc::now();

        // first crossing fires
        let events = state.observe(&cpu_sample(Some(95.0)), &thresholds, start);
        assert_eq!(events.len(), 1);

        // drop below, cross again 10s later: suppressed but flag is set
        state.observe(&cpu_sample(Some(50.0)), &thresholds, start + Duration::seconds(5));
        let events = state.observe(
            &cpu_sample(Some(95.0)),
            &thresholds,
            start + Duration::seconds(10),
        );
        assert!(events.is_empty());
        assert!(state.active().contains(&MetricKind::Cpu));

        // after the cooldown a fresh edge fires again
        state.observe(&cpu_sample(Some(50.0)), &thresholds, start + Duration::seconds(70));
        let events = state.observe(
            &cpu_sample(Some(95.0)),
            &thresholds,
            start + Duration::seconds(80),
        );
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn independent_metrics_fire_independently() {
        let thresholds = Thresholds {
            cpu: Some(Threshold {
                limit: 90.0,
                cooldown_secs: 0,
            }),
            mem: Some(Threshold {
                limit: 80.0,
                cooldown_secs: 0,
            }),
            ..Default::default()
        };
        let mut state = AlertState::default();

        let mut sample = cpu_sample(Some(95.0));
        sample.mem_percent = Some(85.0);

        let events = state.observe(&sample, &thresholds, Utc::now());
        assert_eq!(events.len(), 2);
        let metrics: Vec<_> = events.iter().map(|e| e.metric).collect();
        assert!(metrics.contains(&MetricKind::Cpu));
        assert!(metrics.contains(&MetricKind::Mem));
    }
}
