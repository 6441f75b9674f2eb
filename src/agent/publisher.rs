//! PublisherActor - drains the offline queue over MQTT
//!
//! The actor exclusively owns the [`OfflineQueue`] and a connection state
//! machine:
//!
//! ```text
//! DISCONNECTED ──backoff elapsed──▶ CONNECTING ──ConnAck──▶ CONNECTED
//!      ▲                                │                       │
//!      └────────── transport error ─────┴───────────────────────┘
//! ```
//!
//! Samples arrive over a channel in every state and are enqueued immediately,
//! so sampling is never coupled to connectivity. While CONNECTED the actor
//! publishes queue entries at QoS 1 and commits an entry only when its PubAck
//! arrives; acks for a single connection come back in publish order, so FIFO
//! commit is sound. A connection error leaves unacknowledged entries queued
//! for the next session (at-least-once, duplicates are tolerated downstream).

use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, instrument, trace, warn};

use crate::MetricSample;
use crate::agent::backoff::Backoff;
use crate::config::AgentConfig;
use crate::metrics_topic;
use crate::queue::OfflineQueue;

/// Base reconnect delay.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Minimum capacity of the rumqttc request channel.
const MQTT_CHANNEL_CAPACITY: usize = 64;

/// The request channel must hold a full publish window: `pump` awaits channel
/// capacity while the event loop that drains it is not being polled, so a
/// window larger than the channel would deadlock the actor.
fn request_channel_capacity(publish_window: usize) -> usize {
    publish_window.max(MQTT_CHANNEL_CAPACITY)
}

/// Connection state of the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Commands that can be sent to the PublisherActor
#[derive(Debug)]
pub enum PublisherCommand {
    /// Get queue and connection statistics
    GetStats {
        respond_to: oneshot::Sender<PublisherStats>,
    },

    /// Gracefully shut down the publisher
    Shutdown,
}

/// Observable publisher state, mainly for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublisherStats {
    pub state: ConnectionState,
    pub queued: usize,
    pub dropped: u64,
    pub published: u64,
}

/// How a connection session ended.
enum SessionEnd {
    TransportError,
    Shutdown,
}

pub struct PublisherActor {
    config: AgentConfig,

    /// Topic all samples are published to.
    topic: String,

    queue: OfflineQueue,
    backoff: Backoff,
    state: ConnectionState,

    /// Queue head entries published but not yet acknowledged.
    in_flight: usize,

    /// Acks still expected for entries evicted while in flight. Acks arrive
    /// in publish order, so these are consumed before any live commit.
    ghost_acks: usize,

    /// Total successfully acknowledged publishes.
    published: u64,

    sample_rx: mpsc::UnboundedReceiver<MetricSample>,
    command_rx: mpsc::Receiver<PublisherCommand>,
}

impl PublisherActor {
    fn new(
        config: AgentConfig,
        sample_rx: mpsc::UnboundedReceiver<MetricSample>,
        command_rx: mpsc::Receiver<PublisherCommand>,
    ) -> Self {
        let topic = metrics_topic(&config.device_id);
        let queue = OfflineQueue::new(config.queue_capacity);

        Self {
            config,
            topic,
            queue,
            backoff: Backoff::new(BACKOFF_BASE, BACKOFF_CAP),
            state: ConnectionState::Disconnected,
            in_flight: 0,
            ghost_acks: 0,
            published: 0,
            sample_rx,
            command_rx,
        }
    }

    /// Run the actor's main loop: one connection session per iteration, with
    /// backoff between sessions.
    #[instrument(skip(self), fields(device_id = %self.config.device_id))]
    pub async fn run(mut self) {
        debug!("starting publisher actor");

        loop {
            match self.run_session().await {
                SessionEnd::Shutdown => break,
                SessionEnd::TransportError => {
                    let delay = self.backoff.next_delay();
                    debug!("reconnecting in {delay:?}");
                    if !self.wait_for_reconnect(delay).await {
                        break;
                    }
                }
            }
        }

        debug!("publisher actor stopped");
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("connection state {:?} -> {state:?}", self.state);
            self.state = state;
        }
    }

    /// Absorb samples and commands while the backoff delay elapses.
    ///
    /// Returns `false` if a shutdown was requested.
    async fn wait_for_reconnect(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,

                Some(sample) = self.sample_rx.recv() => self.enqueue(sample),

                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd) {
                            return false;
                        }
                    }
                    None => {
                        warn!("command channel closed, shutting down");
                        return false;
                    }
                },
            }
        }
    }

    /// One connection attempt plus, on success, the connected drain loop.
    async fn run_session(&mut self) -> SessionEnd {
        self.set_state(ConnectionState::Connecting);
        self.in_flight = 0;
        self.ghost_acks = 0;

        let (client, mut eventloop) = self.connect();
        let connect_deadline =
            Instant::now() + Duration::from_secs(self.config.connect_timeout_secs);

        // CONNECTING: wait for the broker's ConnAck, bounded by the timeout.
        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("connect failed: {e}");
                        self.set_state(ConnectionState::Disconnected);
                        return SessionEnd::TransportError;
                    }
                },

                _ = tokio::time::sleep_until(connect_deadline) => {
                    warn!("connect attempt timed out");
                    self.set_state(ConnectionState::Disconnected);
                    return SessionEnd::TransportError;
                }

                Some(sample) = self.sample_rx.recv() => self.enqueue(sample),

                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd) {
                            return SessionEnd::Shutdown;
                        }
                    }
                    None => return SessionEnd::Shutdown,
                },
            }
        }

        debug!("connected to broker {}:{}", self.config.broker.host, self.config.broker.port);
        self.set_state(ConnectionState::Connected);
        self.backoff.reset();

        if self.pump(&client).await.is_err() {
            self.set_state(ConnectionState::Disconnected);
            return SessionEnd::TransportError;
        }

        // CONNECTED: drain the queue, commit on PubAck, keep enqueuing.
        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::PubAck(_))) => {
                        self.on_ack();
                        if self.pump(&client).await.is_err() {
                            self.set_state(ConnectionState::Disconnected);
                            return SessionEnd::TransportError;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("connection lost: {e}");
                        self.set_state(ConnectionState::Disconnected);
                        return SessionEnd::TransportError;
                    }
                },

                Some(sample) = self.sample_rx.recv() => {
                    self.enqueue(sample);
                    if self.pump(&client).await.is_err() {
                        self.set_state(ConnectionState::Disconnected);
                        return SessionEnd::TransportError;
                    }
                }

                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd) {
                            let _ = client.disconnect().await;
                            return SessionEnd::Shutdown;
                        }
                    }
                    None => {
                        let _ = client.disconnect().await;
                        return SessionEnd::Shutdown;
                    }
                },
            }
        }
    }

    fn connect(&self) -> (AsyncClient, EventLoop) {
        let broker = &self.config.broker;
        let mut options =
            MqttOptions::new(&self.config.device_id, &broker.host, broker.port);
        options.set_keep_alive(Duration::from_secs(15));
        if let (Some(username), Some(password)) = (&broker.username, &broker.password) {
            options.set_credentials(username, password);
        }

        AsyncClient::new(
            options,
            request_channel_capacity(self.config.publish_window),
        )
    }

    /// Returns `true` if the command requests shutdown.
    fn handle_command(&mut self, cmd: PublisherCommand) -> bool {
        match cmd {
            PublisherCommand::GetStats { respond_to } => {
                let _ = respond_to.send(PublisherStats {
                    state: self.state,
                    queued: self.queue.len(),
                    dropped: self.queue.dropped(),
                    published: self.published,
                });
                false
            }
            PublisherCommand::Shutdown => {
                debug!("received shutdown command");
                true
            }
        }
    }

    fn enqueue(&mut self, sample: MetricSample) {
        let evicted = self.queue.enqueue(sample);
        if evicted && self.in_flight > 0 {
            // The evicted head was already published; its ack must not commit
            // a surviving entry.
            self.in_flight -= 1;
            self.ghost_acks += 1;
        }
    }

    fn on_ack(&mut self) {
        if self.ghost_acks > 0 {
            self.ghost_acks -= 1;
            trace!("ack for evicted entry");
            return;
        }

        self.queue.commit(1);
        self.in_flight -= 1;
        self.published += 1;
        trace!(published = self.published, queued = self.queue.len(), "publish acknowledged");
    }

    /// Publish queue entries until the in-flight window is full.
    async fn pump(&mut self, client: &AsyncClient) -> Result<(), rumqttc::ClientError> {
        let window = self.config.publish_window.saturating_sub(self.ghost_acks);
        let target = self.queue.len().min(window);
        if self.in_flight >= target {
            return Ok(());
        }

        let payloads: Vec<Vec<u8>> = self
            .queue
            .peek_batch(target)
            .skip(self.in_flight)
            .map(|entry| {
                serde_json::to_vec(&entry.sample).expect("sample serializes to JSON")
            })
            .collect();

        for payload in payloads {
            if let Err(e) = client
                .publish(&self.topic, QoS::AtLeastOnce, false, payload)
                .await
            {
                error!("publish failed: {e}");
                return Err(e);
            }
            self.in_flight += 1;
        }

        Ok(())
    }
}

/// Handle for controlling a PublisherActor
///
/// Can be cloned and shared across tasks.
#[derive(Clone)]
pub struct PublisherHandle {
    sender: mpsc::Sender<PublisherCommand>,
}

impl PublisherHandle {
    /// Spawn a new publisher actor consuming samples from `sample_rx`.
    ///
    /// Also returns the actor's join handle; await it after sending Shutdown
    /// so the broker connection is closed before the process exits.
    pub fn spawn(
        config: AgentConfig,
        sample_rx: mpsc::UnboundedReceiver<MetricSample>,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = PublisherActor::new(config, sample_rx, cmd_rx);
        let task = tokio::spawn(actor.run());

        (Self { sender: cmd_tx }, task)
    }

    /// Get queue and connection statistics.
    pub async fn stats(&self) -> Result<PublisherStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PublisherCommand::GetStats { respond_to: tx })
            .await
            .context("failed to send GetStats command")?;

        rx.await.context("failed to receive stats")
    }

    /// Gracefully shut down the publisher.
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(PublisherCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
