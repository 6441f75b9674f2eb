//! Backend bridge: MQTT in, consistent state + WebSocket feed + alerts out.
//!
//! ```text
//!                  ┌──────────────────┐
//!   MQTT broker ──▶│   ingest task    │
//!                  └────────┬─────────┘
//!                           │ BridgeCommand::Apply
//!                  ┌────────▼─────────┐     prune ticker (internal)
//!                  │   BridgeActor    │◀─────────────┘
//!                  │ DeviceStateStore │
//!                  └───┬──────────┬───┘
//!        broadcast     │          │ mpsc
//!   ┌──────────────────▼──┐   ┌───▼──────────┐
//!   │ WebSocket fan-out   │   │   notifier   │
//!   │ (snapshot + deltas) │   │  (webhook)   │
//!   └─────────────────────┘   └──────────────┘
//! ```
//!
//! The actor is the single writer for the store: message arrival, pruning and
//! snapshot requests are serialized through its select loop, so a prune and an
//! update for the same device can never interleave. Fan-out is read-only;
//! each subscriber owns a broadcast receiver and a lagging subscriber is
//! disconnected instead of stalling the bridge.

pub mod alerts;
pub mod ingest;
pub mod notifier;
pub mod store;
pub mod ws;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, instrument, warn};

use crate::config::Thresholds;
use crate::{AlertEvent, MetricSample};
use store::DeviceStateStore;

/// Per-subscriber buffer; a subscriber this far behind is disconnected.
const SUBSCRIBER_BUFFER: usize = 256;

/// One change to the device state, fanned out to all subscribers.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// A device reported a new sample.
    Update { sample: MetricSample },

    /// A device went silent for longer than the liveness window.
    Removed { device_id: String },
}

/// A new subscriber's starting point: a consistent snapshot plus the delta
/// stream beginning exactly after it.
pub struct FeedSubscription {
    pub snapshot: HashMap<String, MetricSample>,
    pub events: broadcast::Receiver<BridgeEvent>,
}

/// Commands that can be sent to the BridgeActor
#[derive(Debug)]
pub enum BridgeCommand {
    /// Apply one parsed sample from the broker
    Apply { sample: MetricSample },

    /// Register a new feed subscriber
    Subscribe {
        respond_to: oneshot::Sender<FeedSubscription>,
    },

    /// Gracefully shut down the bridge
    Shutdown,
}

pub struct BridgeActor {
    store: DeviceStateStore,
    prune_window: chrono::Duration,
    command_rx: mpsc::Receiver<BridgeCommand>,
    event_tx: broadcast::Sender<BridgeEvent>,
    alert_tx: mpsc::Sender<AlertEvent>,
}

impl BridgeActor {
    fn new(
        thresholds: Thresholds,
        prune_window: chrono::Duration,
        command_rx: mpsc::Receiver<BridgeCommand>,
        event_tx: broadcast::Sender<BridgeEvent>,
        alert_tx: mpsc::Sender<AlertEvent>,
    ) -> Self {
        Self {
            store: DeviceStateStore::new(thresholds),
            prune_window,
            command_rx,
            event_tx,
            alert_tx,
        }
    }

    /// Run the actor's main loop.
    #[instrument(skip(self))]
    pub async fn run(mut self, prune_every: Duration) {
        debug!("starting bridge actor");

        let mut ticker = tokio::time::interval(prune_every);
        // the first tick fires immediately; harmless on an empty store
        loop {
            tokio::select! {
                _ = ticker.tick() => self.prune(),

                cmd = self.command_rx.recv() => match cmd {
                    Some(BridgeCommand::Apply { sample }) => self.apply(sample),
                    Some(BridgeCommand::Subscribe { respond_to }) => {
                        let _ = respond_to.send(self.subscribe());
                    }
                    Some(BridgeCommand::Shutdown) => {
                        debug!("received shutdown command");
                        break;
                    }
                    None => {
                        warn!("command channel closed, shutting down");
                        break;
                    }
                },
            }
        }

        debug!("bridge actor stopped");
    }

    /// One atomic update: state, liveness, alert transitions, then broadcast.
    fn apply(&mut self, sample: MetricSample) {
        let now = Utc::now();
        let alerts = self.store.apply(&sample, now);

        let _ = self.event_tx.send(BridgeEvent::Update { sample });

        for event in alerts {
            // Fire and forget: a congested notifier must not hold up state
            // mutation, and a lost alert is logged, never retried from here.
            if let Err(e) = self.alert_tx.try_send(event) {
                warn!("dropping alert, notifier backlog full: {e}");
            }
        }
    }

    fn prune(&mut self) {
        let removed = self.store.prune(Utc::now(), self.prune_window);
        for device_id in removed {
            debug!("pruned silent device {device_id}");
            let _ = self.event_tx.send(BridgeEvent::Removed { device_id });
        }
    }

    /// Snapshot and receiver are taken in the same actor turn, so the delta
    /// stream starts exactly where the snapshot ends: no gap, no duplicate.
    fn subscribe(&self) -> FeedSubscription {
        FeedSubscription {
            snapshot: self.store.snapshot(),
            events: self.event_tx.subscribe(),
        }
    }
}

/// Handle for the BridgeActor
///
/// Can be cloned and shared across tasks (ingest, WebSocket handlers).
#[derive(Clone)]
pub struct BridgeHandle {
    sender: mpsc::Sender<BridgeCommand>,
}

impl BridgeHandle {
    /// Spawn the bridge actor.
    ///
    /// `alert_tx` is the channel to the notifier; the prune cadence is half
    /// the liveness window (at least one second).
    pub fn spawn(
        thresholds: Thresholds,
        prune_window: Duration,
        alert_tx: mpsc::Sender<AlertEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);

        let window = chrono::Duration::from_std(prune_window).unwrap_or(chrono::Duration::MAX);
        let prune_every = (prune_window / 2).max(Duration::from_secs(1));

        let actor = BridgeActor::new(thresholds, window, cmd_rx, event_tx, alert_tx);
        tokio::spawn(actor.run(prune_every));

        Self { sender: cmd_tx }
    }

    /// Apply one parsed sample.
    pub async fn apply(&self, sample: MetricSample) -> Result<()> {
        self.sender
            .send(BridgeCommand::Apply { sample })
            .await
            .context("failed to send Apply command")?;
        Ok(())
    }

    /// Register a new feed subscriber.
    pub async fn subscribe(&self) -> Result<FeedSubscription> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BridgeCommand::Subscribe { respond_to: tx })
            .await
            .context("failed to send Subscribe command")?;

        rx.await.context("failed to receive subscription")
    }

    /// Gracefully shut down the bridge.
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(BridgeCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
