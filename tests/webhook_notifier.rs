//! Webhook delivery tests against a mock HTTP server.

use chrono::Utc;
use edge_telemetry::bridge::notifier::spawn_notifier;
use edge_telemetry::{AlertEvent, MetricKind};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn alert(device_id: &str, value: f64) -> AlertEvent {
    AlertEvent {
        device_id: device_id.into(),
        metric: MetricKind::Cpu,
        value,
        threshold: 90.0,
        transitioned_at: Utc::now(),
    }
}

#[tokio::test]
async fn alert_is_posted_as_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (alert_tx, alert_rx) = mpsc::channel(8);
    let notifier = spawn_notifier(Some(format!("{}/hook", server.uri())), alert_rx);

    alert_tx.send(alert("dev-a", 95.5)).await.unwrap();
    drop(alert_tx);
    notifier.await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);

    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["device_id"], "dev-a");
    assert_eq!(body["metric"], "cpu");
    assert_eq!(body["value"], 95.5);
    assert_eq!(body["threshold"], 90.0);
    assert_eq!(body["message"], "dev-a: cpu at 95.5% (threshold 90.0%)");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn failed_delivery_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let (alert_tx, alert_rx) = mpsc::channel(8);
    let notifier = spawn_notifier(Some(server.uri()), alert_rx);

    alert_tx.send(alert("dev-a", 95.0)).await.unwrap();
    drop(alert_tx);
    notifier.await.unwrap();

    // exactly one request despite the error response
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn each_alert_gets_its_own_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&server)
        .await;

    let (alert_tx, alert_rx) = mpsc::channel(8);
    let notifier = spawn_notifier(Some(server.uri()), alert_rx);

    for value in [91.0, 92.0, 93.0] {
        alert_tx.send(alert("dev-a", value)).await.unwrap();
    }
    drop(alert_tx);
    notifier.await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let values: Vec<f64> = requests
        .iter()
        .map(|r| {
            let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
            body["value"].as_f64().unwrap()
        })
        .collect();
    assert_eq!(values, vec![91.0, 92.0, 93.0]);
}

#[tokio::test]
async fn without_webhook_the_task_drains_and_exits() {
    let (alert_tx, alert_rx) = mpsc::channel(8);
    let notifier = spawn_notifier(None, alert_rx);

    alert_tx.send(alert("dev-a", 95.0)).await.unwrap();
    drop(alert_tx);

    // logged only, no network involved
    notifier.await.unwrap();
}
