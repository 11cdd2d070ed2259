// src/server/handler.rs
use crate::metrics::MetricsRegistry;
use crate::server::groups::ProxyGroups;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::Service;

/// Management API over the proxy groups.
///
/// Every route answers 200 with `{"ok": bool, ...}`; only unknown paths and
/// wrong methods get a non-200 status.
#[derive(Clone)]
pub struct ApiHandler {
    groups: Arc<ProxyGroups>,
    metrics: Option<(Arc<MetricsRegistry>, Arc<str>)>,
}

impl ApiHandler {
    pub fn new(groups: Arc<ProxyGroups>) -> Self {
        Self {
            groups,
            metrics: None,
        }
    }

    /// Serve the Prometheus text format at `path`.
    pub fn with_metrics(mut self, registry: Arc<MetricsRegistry>, path: &str) -> Self {
        self.metrics = Some((registry, Arc::from(path)));
        self
    }

    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().trim_start_matches('/');
        let params = query_params(&req);

        if let Some((registry, metrics_path)) = &self.metrics {
            if path == metrics_path.trim_start_matches('/') {
                return match registry.gather() {
                    Ok(body) => text_response(StatusCode::OK, body),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to encode metrics");
                        text_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            b"metrics unavailable".to_vec(),
                        )
                    }
                };
            }
        }

        let expected = match path {
            "worker-keepalive.do" | "group-open.do" | "group-close.do" => Method::POST,
            "worker-list.do" => Method::GET,
            _ => return text_response(StatusCode::NOT_FOUND, b"Not Found".to_vec()),
        };
        if req.method() != expected {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, b"Method Not Allowed".to_vec());
        }

        let result = match path {
            "worker-keepalive.do" => self.keep_alive(&params).await,
            "worker-list.do" => self.list(&params).await,
            "group-open.do" => self.open(&params).await,
            _ => self.close(&params).await,
        };

        let body = match result {
            Ok(body) => body,
            Err(msg) => json!({ "ok": false, "msg": msg }),
        };
        tracing::info!(uri = %req.uri(), response = %body, "management api response");
        json_response(&body)
    }

    async fn keep_alive(&self, params: &HashMap<String, String>) -> Result<Value, String> {
        let port = group_port(params)?;
        let server = params
            .get("server")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| "missing 'server' parameter".to_string())?;

        self.groups
            .heartbeat(port, server)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "ok": true }))
    }

    async fn list(&self, params: &HashMap<String, String>) -> Result<Value, String> {
        let port = group_port(params)?;
        let list = self.groups.list(port).await.map_err(|e| e.to_string())?;
        Ok(json!({ "ok": true, "list": list }))
    }

    async fn open(&self, params: &HashMap<String, String>) -> Result<Value, String> {
        let port = group_port(params)?;
        self.groups.open(port).await.map_err(|e| e.to_string())?;
        Ok(json!({ "ok": true }))
    }

    async fn close(&self, params: &HashMap<String, String>) -> Result<Value, String> {
        let port = group_port(params)?;
        self.groups.close(port).await.map_err(|e| e.to_string())?;
        Ok(json!({ "ok": true }))
    }
}

impl Service<Request<Body>> for ApiHandler {
    type Response = Response<Body>;
    type Error = Box<dyn std::error::Error + Send + Sync>;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let handler = self.clone();
        Box::pin(async move { Ok(handler.handle(req).await) })
    }
}

fn query_params(req: &Request<Body>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn group_port(params: &HashMap<String, String>) -> Result<u16, String> {
    let group = params
        .get("group")
        .ok_or_else(|| "missing 'group' parameter".to_string())?;
    group
        .trim()
        .parse()
        .map_err(|_| format!("invalid group port '{}'", group))
}

fn json_response(body: &Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn text_response(status: StatusCode, body: Vec<u8>) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    async fn call(handler: &ApiHandler, method: Method, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = handler.handle(req).await;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn handler() -> ApiHandler {
        ApiHandler::new(Arc::new(ProxyGroups::new(ProxyConfig::default(), None)))
    }

    #[tokio::test]
    async fn test_group_round_trip() {
        let handler = handler();
        let port = handler.groups.open(0).await.unwrap().port();

        let (status, body) = call(
            &handler,
            Method::POST,
            &format!("/worker-keepalive.do?group={}&server=127.0.0.1:9100", port),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));

        let uri = format!("/worker-list.do?group={}", port);
        let (_, body) = call(&handler, Method::GET, &uri).await;
        assert_eq!(body, json!({ "ok": true, "list": ["127.0.0.1:9100"] }));

        let uri = format!("/group-close.do?group={}", port);
        let (_, body) = call(&handler, Method::POST, &uri).await;
        assert_eq!(body["ok"], json!(true));

        let uri = format!("/worker-list.do?group={}", port);
        let (_, body) = call(&handler, Method::GET, &uri).await;
        assert_eq!(body["ok"], json!(false));
    }

    #[tokio::test]
    async fn test_bad_parameters() {
        let handler = handler();

        let (status, body) = call(&handler, Method::GET, "/worker-list.do").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], json!(false));
        assert_eq!(body["msg"], json!("missing 'group' parameter"));

        let (_, body) = call(&handler, Method::GET, "/worker-list.do?group=abc").await;
        assert_eq!(body["ok"], json!(false));

        let (_, body) = call(&handler, Method::POST, "/worker-keepalive.do?group=1").await;
        assert_eq!(body["msg"], json!("missing 'server' parameter"));
    }

    #[tokio::test]
    async fn test_routing_errors() {
        let handler = handler();

        let (status, _) = call(&handler, Method::GET, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&handler, Method::GET, "/group-open.do?group=1").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_metrics_route() {
        let registry = Arc::new(MetricsRegistry::new().unwrap());
        registry.collector().update_backends_alive("8081", 2);
        let handler = handler().with_metrics(registry, "/metrics");

        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = handler.handle(req).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("tcplb_backends_alive{group=\"8081\"} 2"));
    }
}
