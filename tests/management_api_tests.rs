// tests/management_api_tests.rs
use rust_tcp_balancer::config::ProxyConfig;
use rust_tcp_balancer::metrics::MetricsRegistry;
use rust_tcp_balancer::proxy::ControlClient;
use rust_tcp_balancer::server::{ApiHandler, ProxyGroups, ServerBuilder};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

struct TestApi {
    base: String,
    groups: Arc<ProxyGroups>,
    http: reqwest::Client,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestApi {
    async fn start() -> Self {
        let registry = Arc::new(MetricsRegistry::new().unwrap());
        let groups = Arc::new(ProxyGroups::new(
            ProxyConfig::default(),
            Some(registry.collector()),
        ));
        let handler = ApiHandler::new(groups.clone()).with_metrics(registry, "/metrics");

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = ServerBuilder::new(addr)
            .with_handler(handler)
            .bind()
            .await
            .unwrap();
        let base = format!("http://{}", server.local_addr());

        let (tx, rx) = oneshot::channel();
        tokio::spawn(server.serve_with_shutdown(async {
            let _ = rx.await;
        }));

        Self {
            base,
            groups,
            http: reqwest::Client::new(),
            shutdown: Some(tx),
        }
    }

    async fn post(&self, path: &str) -> Value {
        let response = self
            .http
            .post(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json().await.unwrap()
    }

    async fn get(&self, path: &str) -> Value {
        let response = self
            .http
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json().await.unwrap()
    }

    async fn shutdown(mut self) {
        self.groups.stop_all().await;
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_group_lifecycle_over_http() {
    let api = TestApi::start().await;
    let port = free_port().await;

    assert_eq!(api.post(&format!("/group-open.do?group={}", port)).await, json!({ "ok": true }));
    assert_eq!(api.groups.ports(), vec![port]);

    let again = api.post(&format!("/group-open.do?group={}", port)).await;
    assert_eq!(again["ok"], json!(false));

    api.post(&format!("/worker-keepalive.do?group={}&server=127.0.0.1:9200", port))
        .await;
    api.post(&format!("/worker-keepalive.do?group={}&server=127.0.0.1:9100", port))
        .await;
    assert_eq!(
        api.get(&format!("/worker-list.do?group={}", port)).await,
        json!({ "ok": true, "list": ["127.0.0.1:9100", "127.0.0.1:9200"] })
    );

    assert_eq!(api.post(&format!("/group-close.do?group={}", port)).await, json!({ "ok": true }));
    let listed = api.get(&format!("/worker-list.do?group={}", port)).await;
    assert_eq!(listed["ok"], json!(false));

    api.shutdown().await;
}

#[tokio::test]
async fn test_http_and_wire_heartbeats_share_a_tracker() {
    let api = TestApi::start().await;
    let port = free_port().await;
    api.post(&format!("/group-open.do?group={}", port)).await;

    let client = ControlClient::new(format!("127.0.0.1:{}", port), Duration::from_secs(2));
    client.send_heartbeat("127.0.0.1:9300").await.unwrap();

    let mut list = Value::Null;
    for _ in 0..50 {
        list = api.get(&format!("/worker-list.do?group={}", port)).await;
        if list["list"].as_array().map(|l| l.len()) == Some(1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(list["list"], json!(["127.0.0.1:9300"]));

    api.post(&format!("/worker-keepalive.do?group={}&server=127.0.0.1:9000", port))
        .await;
    assert_eq!(
        client.list_alive().await.unwrap(),
        vec!["127.0.0.1:9000", "127.0.0.1:9300"]
    );

    api.shutdown().await;
}

#[tokio::test]
async fn test_unknown_group_and_route() {
    let api = TestApi::start().await;

    let body = api.get("/worker-list.do?group=1").await;
    assert_eq!(body["ok"], json!(false));
    assert!(body["msg"].as_str().unwrap().contains("port 1"));

    let response = api
        .http
        .get(format!("{}/nowhere", api.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    api.shutdown().await;
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let api = TestApi::start().await;
    let port = free_port().await;
    api.post(&format!("/group-open.do?group={}", port)).await;
    api.post(&format!("/worker-keepalive.do?group={}&server=127.0.0.1:9400", port))
        .await;

    let text = api
        .http
        .get(format!("{}/metrics", api.base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains(&format!("tcplb_backends_alive{{group=\"{}\"}} 1", port)));

    api.shutdown().await;
}
