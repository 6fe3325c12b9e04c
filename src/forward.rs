//! Loopback forwarding into ready workers
//!
//! Requests are fully buffered in both directions. Only `cookie` and
//! `content-type` pass through from the client; `authorization` is always the
//! worker's own secret.

use crate::config::Config;
use crate::cookie::cookie_header;
use crate::error::{GatewayError, SpawnError};
use crate::redact;
use crate::worker::WorkerRecord;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, COOKIE};
use hyper::http::request::Parts;
use hyper::{Method, Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::{debug, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Content type used when a worker response carries none
pub const DEFAULT_CONTENT_TYPE: &str = "text/html";

/// Settings for the forwarding client
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Maximum idle connections kept per worker port
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Deadline for one complete exchange with a worker
    pub request_timeout: Duration,
    /// Upper bound for buffered request and response bodies
    pub max_body_bytes: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(60),
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ForwarderConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
            request_timeout: config.cloud_wallet.request_timeout(),
            max_body_bytes: config.cloud_wallet.max_body_bytes,
        }
    }
}

/// Normalize the part of a URL following the key segment into a worker path
pub fn normalize_sub_path(rest: &str) -> String {
    if rest.is_empty() {
        "/".to_string()
    } else if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}

/// Build the loopback request for a worker from the inbound request parts
pub fn build_outbound(
    parts: &Parts,
    port: u16,
    sub_path: &str,
    authorization_key: &str,
    body: Bytes,
) -> Result<Request<Full<Bytes>>, GatewayError> {
    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(format!("http://localhost:{}{}", port, sub_path));

    if let Some(cookie) = cookie_header(&parts.headers) {
        builder = builder.header(COOKIE, cookie);
    }
    if let Some(content_type) = parts.headers.get(CONTENT_TYPE) {
        builder = builder.header(CONTENT_TYPE, content_type.clone());
    }

    builder
        .header(AUTHORIZATION, authorization_key)
        .body(Full::new(body))
        .map_err(|e| GatewayError::WorkerTransport(format!("cannot build request: {}", e)))
}

/// Buffer a body, failing once it exceeds `limit` bytes
pub(crate) async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, BoxError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let collected = Limited::new(body, limit).collect().await?;
    Ok(collected.to_bytes())
}

/// Forwards requests to workers over a pooled loopback client
pub struct Forwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    config: ForwarderConfig,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            request_timeout_secs = config.request_timeout.as_secs(),
            "Forwarding client initialized"
        );

        Self { client, config }
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Wait for `record` to be ready and relay `req` to it at `sub_path`.
    ///
    /// Never fails: a worker that cannot be readied yields the fallback page,
    /// anything else that goes wrong yields a bare status.
    pub async fn forward<B>(
        &self,
        record: &WorkerRecord,
        sub_path: &str,
        req: Request<B>,
    ) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        match self.try_forward(record, sub_path, req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    key = %redact(record.key()),
                    phase = e.phase(),
                    status = e.status_code().as_u16(),
                    error = %e,
                    "Request to worker failed"
                );
                e.into_response()
            }
        }
    }

    async fn try_forward<B>(
        &self,
        record: &WorkerRecord,
        sub_path: &str,
        req: Request<B>,
    ) -> Result<Response<Full<Bytes>>, GatewayError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let port = record.ready().await?;
        let authorization_key = record
            .authorization_key()
            .ok_or(GatewayError::Spawn(SpawnError::Abandoned))?;

        let (parts, body) = req.into_parts();
        let body = if parts.method == Method::POST || parts.method == Method::PUT {
            read_body(body, self.config.max_body_bytes)
                .await
                .map_err(|e| GatewayError::Buffering(format!("request body: {}", e)))?
        } else {
            Bytes::new()
        };

        let outbound = build_outbound(&parts, port, sub_path, authorization_key, body)?;
        debug!(
            key = %redact(record.key()),
            port,
            method = %parts.method,
            path = sub_path,
            "Forwarding request to worker"
        );

        match tokio::time::timeout(self.config.request_timeout, self.exchange(outbound)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::WorkerTransport(format!(
                "no response within {} seconds",
                self.config.request_timeout.as_secs()
            ))),
        }
    }

    async fn exchange(
        &self,
        outbound: Request<Full<Bytes>>,
    ) -> Result<Response<Full<Bytes>>, GatewayError> {
        let response = self
            .client
            .request(outbound)
            .await
            .map_err(|e| GatewayError::WorkerTransport(e.to_string()))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));

        if !status.is_success() {
            return Err(GatewayError::WorkerUpstream {
                status,
                content_type,
            });
        }

        let body = read_body(response.into_body(), self.config.max_body_bytes)
            .await
            .map_err(|e| GatewayError::Buffering(format!("worker response body: {}", e)))?;

        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, content_type)
            .body(Full::new(body))
            .map_err(|e| GatewayError::Buffering(e.to_string()))
    }
}
