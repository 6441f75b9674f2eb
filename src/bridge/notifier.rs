//! Webhook alert delivery, fire-and-forget.
//!
//! Delivery is decoupled from alert state: a failed POST is logged and
//! dropped, never retried from here, so a flapping webhook endpoint cannot
//! re-trigger edges or stall the bridge.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::AlertEvent;

/// Per-request delivery timeout.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawn the notifier task.
///
/// Without a webhook URL alerts are only logged. The task ends once every
/// alert sender is gone.
pub fn spawn_notifier(
    webhook_url: Option<String>,
    mut alert_rx: mpsc::Receiver<AlertEvent>,
) -> JoinHandle<()> {
    let client = reqwest::Client::new();

    tokio::spawn(async move {
        while let Some(event) = alert_rx.recv().await {
            let summary = format_summary(&event);

            match &webhook_url {
                None => warn!("ALERT {summary} (no webhook configured)"),
                Some(url) => send_webhook(&client, url, &event, &summary).await,
            }
        }

        debug!("notifier stopped");
    })
}

fn format_summary(event: &AlertEvent) -> String {
    format!(
        "{}: {} at {:.1}% (threshold {:.1}%)",
        event.device_id, event.metric, event.value, event.threshold
    )
}

async fn send_webhook(client: &reqwest::Client, url: &str, event: &AlertEvent, summary: &str) {
    let payload = json!({
        "message": summary,
        "device_id": event.device_id,
        "metric": event.metric,
        "value": event.value,
        "threshold": event.threshold,
        "timestamp": event.transitioned_at.to_rfc3339(),
    });

    match client
        .post(url)
        .json(&payload)
        .timeout(WEBHOOK_TIMEOUT)
        .send()
        .await
    {
        Ok(response) => {
            if response.status().is_success() {
                info!("sent alert webhook: {summary}");
            } else {
                error!("alert webhook failed with status: {}", response.status());
            }
        }
        Err(e) => {
            error!("failed to send alert webhook: {e}");
        }
    }
}
