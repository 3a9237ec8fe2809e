//! HTTP metrics collaborator client.
//!
//! Issues `GET {endpoint}/query?instances=a,b&window_secs=N` and decodes a
//! JSON `MetricsSample`. Timeouts are the evaluator's concern.

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::BodyExt;
use tracing::debug;

use rollgate_core::InstanceId;

use crate::source::{MetricsError, MetricsSample, MetricsSource};

/// Queries a metrics service over plain HTTP/1.1.
#[derive(Debug, Clone)]
pub struct HttpMetricsSource {
    /// `host:port` to connect to.
    address: String,
    /// Path prefix taken from the endpoint URL (no trailing slash).
    base_path: String,
}

impl HttpMetricsSource {
    /// Build a source from a base URL such as `http://127.0.0.1:9400/metrics`.
    pub fn new(endpoint: &str) -> Result<Self, MetricsError> {
        let uri: http::Uri = endpoint
            .parse()
            .map_err(|e| MetricsError::Unreachable(format!("invalid endpoint {endpoint}: {e}")))?;
        if uri.scheme_str().is_some_and(|s| s != "http") {
            return Err(MetricsError::Unreachable(format!(
                "unsupported scheme in {endpoint}"
            )));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| MetricsError::Unreachable(format!("no host in {endpoint}")))?;
        let address = match authority.port_u16() {
            Some(_) => authority.as_str().to_string(),
            None => format!("{}:80", authority.host()),
        };
        Ok(Self {
            address,
            base_path: uri.path().trim_end_matches('/').to_string(),
        })
    }

    fn query_path(&self, instance_ids: &[InstanceId], window: Duration) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("instances", &instance_ids.join(","))
            .append_pair("window_secs", &window.as_secs().to_string())
            .finish();
        format!("{}/query?{query}", self.base_path)
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn query_metrics(
        &self,
        instance_ids: &[InstanceId],
        window: Duration,
    ) -> Result<MetricsSample, MetricsError> {
        let path = self.query_path(instance_ids, window);

        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| MetricsError::Unreachable(format!("connect {}: {e}", self.address)))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| MetricsError::Unreachable(format!("handshake: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&path)
            .header("host", &self.address)
            .header("accept", "application/json")
            .header("user-agent", "rollgate-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| MetricsError::Unreachable(format!("build request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| MetricsError::Unreachable(format!("request: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            debug!(%status, %path, "metrics query non-2xx");
            return Err(MetricsError::Unreachable(format!("metrics endpoint returned {status}")));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| MetricsError::Unreachable(format!("read body: {e}")))?
            .to_bytes();

        serde_json::from_slice(&body).map_err(|e| MetricsError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Router;
    use axum::extract::Query;
    use axum::routing::get;
    use std::collections::HashMap;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    #[test]
    fn endpoint_parsing() {
        let source = HttpMetricsSource::new("http://metrics.local/api/").unwrap();
        assert_eq!(source.address, "metrics.local:80");
        assert_eq!(
            source.query_path(&["a".into(), "b".into()], Duration::from_secs(60)),
            "/api/query?instances=a%2Cb&window_secs=60"
        );
        assert!(HttpMetricsSource::new("https://metrics.local").is_err());
    }

    #[test]
    fn instance_ids_are_escaped() {
        let source = HttpMetricsSource::new("http://metrics.local").unwrap();
        assert_eq!(
            source.query_path(&["web 1".into(), "a&b=c".into()], Duration::from_secs(5)),
            "/query?instances=web+1%2Ca%26b%3Dc&window_secs=5"
        );
    }

    #[tokio::test]
    async fn queries_and_decodes_sample() {
        let router = Router::new().route(
            "/v1/query",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                let count = q.get("instances").map_or(0, |s| s.split(',').count()) as u64;
                axum::Json(serde_json::json!({
                    "error_rate": 0.02,
                    "latency_p95_ms": 80,
                    "sample_count": count * 100,
                    "timestamp": 1_700_000_000u64,
                }))
            }),
        );
        let endpoint = serve(router).await;

        let source = HttpMetricsSource::new(&endpoint).unwrap();
        let sample = source
            .query_metrics(&["a".into(), "b".into()], Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(sample.sample_count, 200);
        assert_eq!(sample.latency_p95_ms, 80);
    }

    #[tokio::test]
    async fn odd_instance_ids_reach_the_server_intact() {
        let router = Router::new().route(
            "/v1/query",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                let ids = q.get("instances").cloned().unwrap_or_default();
                let expected = q.get("window_secs").map(String::as_str) == Some("30")
                    && ids == "web 1,a&b";
                axum::Json(serde_json::json!({
                    "error_rate": 0.0,
                    "latency_p95_ms": 10,
                    "sample_count": if expected { ids.split(',').count() as u64 } else { 0 },
                    "timestamp": 1_700_000_000u64,
                }))
            }),
        );
        let endpoint = serve(router).await;

        let source = HttpMetricsSource::new(&endpoint).unwrap();
        let sample = source
            .query_metrics(&["web 1".into(), "a&b".into()], Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(sample.sample_count, 2);
    }

    #[tokio::test]
    async fn non_success_is_unreachable() {
        let router = Router::new().route(
            "/v1/query",
            get(|| async { axum::http::StatusCode::SERVICE_UNAVAILABLE }),
        );
        let endpoint = serve(router).await;

        let source = HttpMetricsSource::new(&endpoint).unwrap();
        let err = source.query_metrics(&["a".into()], Duration::from_secs(30)).await;
        assert!(matches!(err, Err(MetricsError::Unreachable(_))));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let source = HttpMetricsSource::new("http://127.0.0.1:1").unwrap();
        let err = source.query_metrics(&["a".into()], Duration::from_secs(30)).await;
        assert!(matches!(err, Err(MetricsError::Unreachable(_))));
    }
}
