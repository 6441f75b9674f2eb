//! MQTT ingest: subscribes to the metrics topic and feeds the bridge actor.
//!
//! Malformed input (unexpected topic, unparseable payload) is dropped with a
//! diagnostic; only the sample stream reaches the actor. Connection errors
//! are retried with a fresh client so the subscription is re-established.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Publish, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::bridge::BridgeHandle;
use crate::config::BrokerConfig;
use crate::{METRICS_SUBSCRIPTION, MetricSample, parse_metrics_topic};

/// Pause before rebuilding the client after a connection error.
const RECONNECT_PAUSE: Duration = Duration::from_secs(2);

/// MQTT client id of the bridge.
const CLIENT_ID: &str = "edge-bridge";

/// Spawn the ingest task. Abort the returned handle to stop it.
pub fn spawn_ingest(broker: BrokerConfig, bridge: BridgeHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut options = MqttOptions::new(CLIENT_ID, &broker.host, broker.port);
            options.set_keep_alive(Duration::from_secs(15));
            if let (Some(username), Some(password)) = (&broker.username, &broker.password) {
                options.set_credentials(username, password);
            }

            let (client, mut eventloop) = AsyncClient::new(options, 64);
            if let Err(e) = client.subscribe(METRICS_SUBSCRIPTION, QoS::AtLeastOnce).await {
                error!("subscribe failed: {e}");
                tokio::time::sleep(RECONNECT_PAUSE).await;
                continue;
            }

            debug!(
                "subscribed to {METRICS_SUBSCRIPTION} on {}:{}",
                broker.host, broker.port
            );

            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if !handle_publish(&bridge, publish).await {
                            // bridge gone, nothing left to feed
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("broker connection error: {e}");
                        tokio::time::sleep(RECONNECT_PAUSE).await;
                        break;
                    }
                }
            }
        }
    })
}

/// Parse and forward one publish. Returns `false` once the bridge is gone.
async fn handle_publish(bridge: &BridgeHandle, publish: Publish) -> bool {
    let Some(device_id) = parse_metrics_topic(&publish.topic) else {
        warn!("dropping message with unexpected topic {:?}", publish.topic);
        return true;
    };

    let mut sample: MetricSample = match serde_json::from_slice(&publish.payload) {
        Ok(sample) => sample,
        Err(e) => {
            warn!("dropping unparseable payload on {:?}: {e}", publish.topic);
            return true;
        }
    };

    // the topic is authoritative for identity
    if sample.device_id != device_id {
        debug!(
            "payload device_id {:?} differs from topic, using {device_id:?}",
            sample.device_id
        );
        sample.device_id = device_id.to_string();
    }

    trace!("ingested sample from {device_id}");

    if let Err(e) = bridge.apply(sample).await {
        warn!("bridge unavailable: {e}");
        return false;
    }
    true
}
