//! Minimal HTTP/1.1 client for the daemon's JSON API.

use anyhow::{Context, bail};
use bytes::Bytes;
use http::Method;
use http_body_util::{BodyExt, Full};
use serde::de::DeserializeOwned;
use tracing::debug;

use rollgate_api::handlers::ApiResponse;

pub struct ApiClient {
    /// `host:port` of the daemon.
    address: String,
    /// Path prefix from the server URL, without trailing slash.
    base_path: String,
}

impl ApiClient {
    /// Build a client from a URL such as `http://127.0.0.1:8470`.
    pub fn new(server: &str) -> anyhow::Result<Self> {
        let uri: http::Uri = server
            .parse()
            .with_context(|| format!("invalid server URL {server}"))?;
        if uri.scheme_str().is_some_and(|s| s != "http") {
            bail!("unsupported scheme in {server}; only http is supported");
        }
        let authority = uri
            .authority()
            .with_context(|| format!("no host in server URL {server}"))?;
        let address = match authority.port_u16() {
            Some(_) => authority.as_str().to_string(),
            None => format!("{}:80", authority.host()),
        };
        Ok(Self {
            address,
            base_path: uri.path().trim_end_matches('/').to_string(),
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<ApiResponse<T>> {
        self.send(Method::GET, path, None).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> anyhow::Result<ApiResponse<T>> {
        let body = body.map(serde_json::to_vec).transpose()?;
        self.send(Method::POST, path, body).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base_path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> anyhow::Result<ApiResponse<T>> {
        let url = self.url(path);
        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("connecting to rollgated at {}", self.address))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .context("HTTP handshake")?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut req = http::Request::builder()
            .method(method.clone())
            .uri(&url)
            .header("host", &self.address)
            .header("accept", "application/json")
            .header("user-agent", "rollgate-cli/0.1");
        if body.is_some() {
            req = req.header("content-type", "application/json");
        }
        let req = req.body(Full::new(Bytes::from(body.unwrap_or_default())))?;

        let resp = sender
            .send_request(req)
            .await
            .with_context(|| format!("{method} {url}"))?;
        let status = resp.status();
        debug!(%method, %url, %status, "API call");

        let bytes = resp
            .into_body()
            .collect()
            .await
            .context("reading response body")?
            .to_bytes();
        serde_json::from_slice(&bytes)
            .with_context(|| format!("unexpected response from rollgated ({status})"))
    }
}
