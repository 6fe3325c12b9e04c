use crate::cookie::cookie_header;
use crate::error::{empty_response, GatewayError};
use crate::forward::{normalize_sub_path, read_body, Forwarder};
use crate::identity::{bind, resolve_identity, BindRequest, CapabilityToken};
use crate::redact;
use crate::worker::{SpawnParams, WorkerRegistry};
use http_body_util::Full;
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderValue, SET_COOKIE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::borrow::Cow;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// URL prefixes under which wallets are served
pub const ROUTE_PREFIXES: &[&str] = &["cloud-wallet", "iframe"];

/// Path segment of the bind endpoint, following a route prefix
pub const BIND_SEGMENT: &str = "setSSAPPToken";

const LOADER_SEGMENT: &str = "loader";

/// Path segments longer than this are shortened in request logs
const LOGGED_SEGMENT_MAX_LEN: usize = 16;

/// What a request addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `PUT /<prefix>/setSSAPPToken/:anchorId`
    Bind { anchor_id: String },
    /// `/<prefix>/:key[/...]` or `/:walletName/loader/<prefix>/:key[/...]`
    Content {
        /// Decoded key segment: a capability token or an anchor id
        key: String,
        /// Everything after the key segment, query included
        rest: String,
        wallet_name: Option<String>,
    },
    NotFound,
}

/// Split `/segment/remainder` into `segment` and `/remainder` (or "")
fn split_segment(path: &str) -> Option<(&str, &str)> {
    let path = path.strip_prefix('/')?;
    match path.find('/') {
        Some(i) => Some((&path[..i], &path[i..])),
        None => Some((path, "")),
    }
}

fn decode_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .unwrap_or(Cow::Borrowed(segment))
        .into_owned()
}

fn with_query(rest: &str, query: Option<&str>) -> String {
    match query {
        Some(q) => format!("{}?{}", rest, q),
        None => rest.to_string(),
    }
}

fn content_route(
    key: &str,
    rest: &str,
    query: Option<&str>,
    wallet_name: Option<&str>,
) -> Option<Route> {
    if key.is_empty() {
        return None;
    }
    Some(Route::Content {
        key: decode_segment(key),
        rest: with_query(rest, query),
        wallet_name: wallet_name.map(decode_segment),
    })
}

fn try_match_route(method: &Method, uri: &Uri) -> Option<Route> {
    let query = uri.query();
    let (first, after_first) = split_segment(uri.path())?;
    let (second, after_second) = split_segment(after_first)?;

    if ROUTE_PREFIXES.contains(&first) {
        if method == Method::PUT && second == BIND_SEGMENT {
            if let Some((anchor_id, tail)) = split_segment(after_second) {
                if !anchor_id.is_empty() && (tail.is_empty() || tail == "/") {
                    return Some(Route::Bind {
                        anchor_id: decode_segment(anchor_id),
                    });
                }
            }
        }
        return content_route(second, after_second, query, None);
    }

    if second == LOADER_SEGMENT && !first.is_empty() {
        let (prefix, after_prefix) = split_segment(after_second)?;
        if ROUTE_PREFIXES.contains(&prefix) {
            let (key, rest) = split_segment(after_prefix)?;
            return content_route(key, rest, query, Some(first));
        }
    }

    None
}

/// Match a request line against the gateway routes; first match wins
pub fn match_route(method: &Method, uri: &Uri) -> Route {
    try_match_route(method, uri).unwrap_or(Route::NotFound)
}

/// Request path with long segments (tokens) shortened
fn loggable_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.len() > LOGGED_SEGMENT_MAX_LEN {
                Cow::Owned(redact(segment))
            } else {
                Cow::Borrowed(segment)
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Route handlers over a shared worker registry
pub struct Gateway {
    registry: Arc<WorkerRegistry>,
    forwarder: Forwarder,
}

impl Gateway {
    pub fn new(registry: Arc<WorkerRegistry>, forwarder: Forwarder) -> Self {
        Self {
            registry,
            forwarder,
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Hook for an imminent relisten: stop every worker first
    pub fn prepare_relisten(&self) -> usize {
        info!(workers = self.registry.len(), "Restarting process in progress");
        self.registry.terminate_all()
    }

    /// Handle one request.
    ///
    /// A [`CapabilityToken`] request extension, if an outer layer set one,
    /// overrides the key found in the URL.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match match_route(req.method(), req.uri()) {
            Route::Bind { anchor_id } => self.handle_bind(&anchor_id, req).await,
            Route::Content {
                key,
                rest,
                wallet_name,
            } => {
                debug!(key = %redact(&key), wallet_name = ?wallet_name, "Content request");
                self.handle_content(&key, &rest, req).await
            }
            Route::NotFound => empty_response(StatusCode::NOT_FOUND),
        }
    }

    async fn handle_bind<B>(&self, anchor_id: &str, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match self.try_bind(anchor_id, req).await {
            Ok(response) => response,
            Err(e) => {
                error!(anchor_id, phase = e.phase(), error = %e, "Failed to bind wallet anchor id");
                e.into_response()
            }
        }
    }

    async fn try_bind<B>(
        &self,
        anchor_id: &str,
        req: Request<B>,
    ) -> Result<Response<Full<Bytes>>, GatewayError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let existing = cookie_header(req.headers());
        let body = read_body(req.into_body(), self.forwarder.config().max_body_bytes)
            .await
            .map_err(|e| GatewayError::Buffering(format!("request body: {}", e)))?;

        let request: BindRequest = serde_json::from_slice(&body)
            .map_err(|e| GatewayError::ClientInput(format!("invalid bind body: {}", e)))?;
        let token = request
            .token()
            .map_err(|e| GatewayError::ClientInput(e.to_string()))?;

        let cookie = bind(anchor_id, token, existing.as_deref())
            .map_err(|e| GatewayError::ClientInput(e.to_string()))?;
        let value = HeaderValue::from_str(&cookie.to_header_value())
            .map_err(|e| GatewayError::ClientInput(format!("unrepresentable cookie: {}", e)))?;

        info!(anchor_id, key = %redact(token), "Bound wallet anchor id");
        let mut response = empty_response(StatusCode::OK);
        response.headers_mut().append(SET_COOKIE, value);
        Ok(response)
    }

    async fn handle_content<B>(
        &self,
        path_key: &str,
        rest: &str,
        req: Request<B>,
    ) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let cookie = cookie_header(req.headers());
        let identity = resolve_identity(
            path_key,
            req.extensions().get::<CapabilityToken>(),
            cookie.as_deref(),
        );

        let record = self.registry.get_or_create(
            &identity.key,
            SpawnParams {
                cookie,
                wallet_anchor_id: identity.anchor_id,
            },
        );

        self.forwarder
            .forward(&record, &normalize_sub_path(rest), req)
            .await
    }
}

/// HTTP(S) listener serving a [`Gateway`]
pub struct GatewayServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        gateway: Arc<Gateway>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    /// Bind and serve until the shutdown channel flips to `true`
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, protocol, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let tls_acceptor = self.tls_acceptor.clone();

                            tokio::spawn(accept_connection(stream, addr, gateway, tls_acceptor));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(addr = %local_addr, "Gateway listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn accept_connection(
    stream: TcpStream,
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    tls_acceptor: Option<TlsAcceptor>,
) {
    let Some(acceptor) = tls_acceptor else {
        if let Err(e) = handle_connection(stream, addr, gateway).await {
            debug!(addr = %addr, error = %e, "Connection error");
        }
        return;
    };

    match acceptor.accept(stream).await {
        Ok(tls_stream) => {
            if let Err(e) = handle_connection(tls_stream, addr, gateway).await {
                debug!(addr = %addr, error = %e, "TLS connection error");
            }
        }
        Err(e) => {
            debug!(addr = %addr, error = %e, "TLS handshake failed");
        }
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    gateway: Arc<Gateway>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { Ok::<_, Infallible>(serve_request(&gateway, addr, req).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Run one request through the gateway and log its outcome
async fn serve_request(
    gateway: &Gateway,
    client_addr: SocketAddr,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let started = Instant::now();
    let method = req.method().clone();
    let path = loggable_path(req.uri().path());

    let span = info_span!("request", request_id = %request_id);
    let response = gateway.handle(req).instrument(span.clone()).await;

    span.in_scope(|| {
        info!(
            method = %method,
            uri = %path,
            status = response.status().as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            client = %client_addr,
            "Request finished"
        );
    });

    response
}
