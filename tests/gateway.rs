//! Integration tests for the wallet gateway

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, COOKIE, SET_COOKIE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use walletgate::error::INVALID_WALLET_HTML_RESPONSE;
use walletgate::forward::{Forwarder, ForwarderConfig};
use walletgate::gateway::{Gateway, GatewayServer};
use walletgate::identity::CapabilityToken;
use walletgate::launcher::{LaunchedWorker, Terminator, WorkerData, WorkerEvent, WorkerLauncher};
use walletgate::worker::WorkerRegistry;

/// A request as seen by the mock worker
#[derive(Debug, Clone)]
struct Recorded {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Bytes,
}

/// In-process stand-in for a wallet runtime unit's HTTP server
struct MockWorker {
    port: u16,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockWorker {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let recorded = Arc::clone(&recorded);
                        async move { Ok::<_, Infallible>(mock_response(req, &recorded).await) }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { port, requests }
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }

    fn last(&self) -> Recorded {
        self.requests.lock().last().cloned().expect("worker saw no request")
    }
}

async fn mock_response(
    req: Request<Incoming>,
    recorded: &Mutex<Vec<Recorded>>,
) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_default();

    recorded.lock().push(Recorded {
        method: parts.method.clone(),
        path: path.clone(),
        headers: parts.headers.clone(),
        body: body.clone(),
    });

    let builder = Response::builder();
    match parts.uri.path() {
        "/status/404" => builder
            .status(StatusCode::NOT_FOUND)
            .header(CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from_static(b"worker internals"))),
        "/echo" => {
            let builder = match parts.headers.get(CONTENT_TYPE) {
                Some(ct) => builder.header(CONTENT_TYPE, ct.clone()),
                None => builder,
            };
            builder.body(Full::new(body))
        }
        "/no-type" => builder.body(Full::new(Bytes::from_static(b"plain"))),
        "/big" => builder
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Full::new(Bytes::from(vec![b'x'; 4096]))),
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            builder.body(Full::new(Bytes::new()))
        }
        _ => builder
            .header(CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from(format!("worker:{}", path)))),
    }
    .unwrap()
}

/// Launcher that reports scripted outcomes instead of starting processes
#[derive(Default)]
struct TestLauncher {
    outcomes: HashMap<String, WorkerEvent>,
    ready_delay: Duration,
    launches: Mutex<Vec<WorkerData>>,
    live: Mutex<Vec<(mpsc::UnboundedSender<WorkerEvent>, watch::Receiver<bool>)>>,
}

impl TestLauncher {
    fn new() -> Self {
        Self::default()
    }

    /// Seed `key` as a wallet whose worker listens on `port`
    fn with_wallet(mut self, key: &str, port: u16) -> Self {
        self.outcomes.insert(key.to_string(), WorkerEvent::Ready(port));
        self
    }

    fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = delay;
        self
    }

    fn launches(&self) -> Vec<WorkerData> {
        self.launches.lock().clone()
    }

    fn all_terminated(&self) -> bool {
        self.live.lock().iter().all(|(_, rx)| *rx.borrow())
    }
}

impl WorkerLauncher for TestLauncher {
    fn launch(&self, data: WorkerData) -> anyhow::Result<LaunchedWorker> {
        let event = self
            .outcomes
            .get(&data.seed)
            .cloned()
            .unwrap_or_else(|| WorkerEvent::Error("unknown wallet".to_string()));
        self.launches.lock().push(data);

        let (events_tx, events) = mpsc::unbounded_channel();
        let (terminator, terminate_rx) = Terminator::new();

        if self.ready_delay.is_zero() {
            let _ = events_tx.send(event);
        } else {
            let sender = events_tx.clone();
            let delay = self.ready_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = sender.send(event);
            });
        }

        // Keep the channel open so the worker counts as running
        self.live.lock().push((events_tx, terminate_rx));
        Ok(LaunchedWorker { events, terminator })
    }
}

fn build_gateway(launcher: &Arc<TestLauncher>, config: ForwarderConfig) -> Arc<Gateway> {
    let launcher: Arc<dyn WorkerLauncher> = launcher.clone();
    let registry =
        WorkerRegistry::new(launcher, "/tmp/wallet-cache".into(), Duration::from_secs(5));
    Arc::new(Gateway::new(registry, Forwarder::new(config)))
}

fn get(uri: &str) -> Request<Full<Bytes>> {
    Request::get(uri).body(Full::new(Bytes::new())).unwrap()
}

fn put_json(uri: &str, body: &str) -> Request<Full<Bytes>> {
    Request::put(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

async fn body_of(response: Response<Full<Bytes>>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

/// The `Cookie` header a browser would send back after a `Set-Cookie`
fn cookie_from(response: &Response<Full<Bytes>>) -> String {
    let set_cookie = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
    set_cookie.split(';').next().unwrap().to_string()
}

async fn wait_until_empty(registry: &WorkerRegistry) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !registry.is_empty() {
        assert!(Instant::now() < deadline, "workers were never removed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_anchor_id_binding_scenario() {
    let worker = MockWorker::start().await;
    let launcher = Arc::new(TestLauncher::new().with_wallet("T1", worker.port));
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    // Unbound anchor id is used as a raw key, which is not a wallet
    let response = gateway.handle(get("/cloud-wallet/W1/file.txt")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/html");
    assert_eq!(body_of(response).await, INVALID_WALLET_HTML_RESPONSE.as_bytes());

    let response = gateway
        .handle(put_json("/cloud-wallet/setSSAPPToken/W1", r#"{"sReadSSI":"T1"}"#))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = cookie_from(&response);

    let request = Request::get("/cloud-wallet/W1/file.txt")
        .header(COOKIE, &cookie)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = gateway.handle(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_of(response).await, "worker:/file.txt");

    let seen = worker.last();
    assert_eq!(seen.method, Method::GET);
    assert_eq!(seen.path, "/file.txt");
    assert_eq!(seen.headers.get(COOKIE).unwrap(), cookie.as_str());

    let launches = launcher.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[0].seed, "W1");
    assert_eq!(launches[0].wallet_anchor_id, None);
    assert_eq!(launches[1].seed, "T1");
    assert_eq!(launches[1].wallet_anchor_id.as_deref(), Some("W1"));
    assert_eq!(launches[1].cookie.as_deref(), Some(cookie.as_str()));
}

#[tokio::test]
async fn test_bind_response_cookie() {
    let launcher = Arc::new(TestLauncher::new());
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    let response = gateway
        .handle(put_json("/iframe/setSSAPPToken/W1", r#"{"sReadSSI":"T1"}"#))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let cookies: Vec<_> = response.headers().get_all(SET_COOKIE).iter().collect();
    assert_eq!(
        cookies,
        vec!["SSAPP-TOKEN=%7B%22W1%22%3A%22T1%22%7D; Max-Age=2147483647; Path=/; HttpOnly"]
    );
    assert!(body_of(response).await.is_empty());
    assert!(launcher.launches().is_empty());
}

#[tokio::test]
async fn test_bind_preserves_other_bindings() {
    let worker = MockWorker::start().await;
    let launcher = Arc::new(
        TestLauncher::new()
            .with_wallet("TA", worker.port)
            .with_wallet("TB", worker.port),
    );
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    let first = gateway
        .handle(put_json("/cloud-wallet/setSSAPPToken/W1", r#"{"sReadSSI":"TA"}"#))
        .await;
    let cookie = cookie_from(&first);

    let mut second = put_json("/cloud-wallet/setSSAPPToken/W2", r#"{"sReadSSI":"TB"}"#);
    second.headers_mut().insert(COOKIE, HeaderValue::from_str(&cookie).unwrap());
    let second = gateway.handle(second).await;
    let cookie = cookie_from(&second);

    for (anchor, token) in [("W1", "TA"), ("W2", "TB")] {
        let request = Request::get(format!("/cloud-wallet/{}/x", anchor))
            .header(COOKIE, &cookie)
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(gateway.handle(request).await.status(), StatusCode::OK);
        assert_eq!(launcher.launches().last().unwrap().seed, token);
    }
}

#[tokio::test]
async fn test_bind_rejects_missing_token() {
    let launcher = Arc::new(TestLauncher::new());
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    for body in ["{}", r#"{"sReadSSI":""}"#, r#"{"sReadSSI":42}"#, "not json", ""] {
        let response = gateway.handle(put_json("/cloud-wallet/setSSAPPToken/W1", body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {:?}", body);
        assert!(response.headers().get(SET_COOKIE).is_none());
        assert!(body_of(response).await.is_empty());
    }
}

#[tokio::test]
async fn test_authorization_is_overridden() {
    let worker = MockWorker::start().await;
    let launcher = Arc::new(TestLauncher::new().with_wallet("T1", worker.port));
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    let request = Request::get("/cloud-wallet/T1/data")
        .header(AUTHORIZATION, "Bearer forged")
        .header("x-user-id", "alice")
        .header("x-forwarded-for", "10.0.0.1")
        .body(Full::new(Bytes::new()))
        .unwrap();
    assert_eq!(gateway.handle(request).await.status(), StatusCode::OK);

    let seen = worker.last();
    let expected = launcher.launches()[0].authorization_key.clone();
    assert_eq!(expected.len(), 128);
    assert_eq!(seen.headers.get(AUTHORIZATION).unwrap(), expected.as_str());
    assert!(seen.headers.get("x-user-id").is_none());
    assert!(seen.headers.get("x-forwarded-for").is_none());

    let record = gateway.registry().get("T1").unwrap();
    assert_eq!(record.authorization_key(), Some(expected.as_str()));
}

#[tokio::test]
async fn test_sub_path_forwarding() {
    let worker = MockWorker::start().await;
    let launcher = Arc::new(TestLauncher::new().with_wallet("abc123", worker.port));
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    let cases = [
        ("/cloud-wallet/abc123/sub/dir", "/sub/dir"),
        ("/cloud-wallet/abc123", "/"),
        ("/cloud-wallet/abc123?x=1", "/?x=1"),
        ("/iframe/abc123/a/b?q=2", "/a/b?q=2"),
        ("/my-wallet/loader/cloud-wallet/abc123/index.html", "/index.html"),
        ("/my-wallet/loader/iframe/abc123", "/"),
    ];

    for (inbound, expected) in cases {
        let response = gateway.handle(get(inbound)).await;
        assert_eq!(response.status(), StatusCode::OK, "inbound {}", inbound);
        assert_eq!(worker.last().path, expected, "inbound {}", inbound);
    }

    // All prefixes share one worker for the key
    assert_eq!(launcher.launches().len(), 1);
}

#[tokio::test]
async fn test_post_body_is_forwarded() {
    let worker = MockWorker::start().await;
    let launcher = Arc::new(TestLauncher::new().with_wallet("T1", worker.port));
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    let payload = r#"{"item":"value"}"#;
    let request = Request::post("/cloud-wallet/T1/echo")
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(payload)))
        .unwrap();
    let response = gateway.handle(request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "application/json");
    assert_eq!(body_of(response).await, payload);

    let seen = worker.last();
    assert_eq!(seen.method, Method::POST);
    assert_eq!(seen.body, payload);
    assert_eq!(seen.headers.get(CONTENT_TYPE).unwrap(), "application/json");
}

#[tokio::test]
async fn test_get_body_is_not_forwarded() {
    let worker = MockWorker::start().await;
    let launcher = Arc::new(TestLauncher::new().with_wallet("T1", worker.port));
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    let request = Request::get("/cloud-wallet/T1/echo")
        .body(Full::new(Bytes::from_static(b"ignored")))
        .unwrap();
    assert_eq!(gateway.handle(request).await.status(), StatusCode::OK);
    assert!(worker.last().body.is_empty());
}

#[tokio::test]
async fn test_worker_error_status_has_empty_body() {
    let worker = MockWorker::start().await;
    let launcher = Arc::new(TestLauncher::new().with_wallet("T1", worker.port));
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    let response = gateway.handle(get("/cloud-wallet/T1/status/404")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/plain");
    assert!(body_of(response).await.is_empty());
}

#[tokio::test]
async fn test_missing_content_type_defaults_to_html() {
    let worker = MockWorker::start().await;
    let launcher = Arc::new(TestLauncher::new().with_wallet("T1", worker.port));
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    let response = gateway.handle(get("/cloud-wallet/T1/no-type")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/html");
    assert_eq!(body_of(response).await, "plain");
}

#[tokio::test]
async fn test_unreachable_worker_is_500() {
    // Reserve a port, then close it so nothing listens there
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let launcher = Arc::new(TestLauncher::new().with_wallet("T1", port));
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    let response = gateway.handle(get("/cloud-wallet/T1/file.txt")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_of(response).await.is_empty());
}

#[tokio::test]
async fn test_request_timeout_is_500() {
    let worker = MockWorker::start().await;
    let launcher = Arc::new(TestLauncher::new().with_wallet("T1", worker.port));
    let config = ForwarderConfig {
        request_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let gateway = build_gateway(&launcher, config);

    let response = gateway.handle(get("/cloud-wallet/T1/slow")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_of(response).await.is_empty());
}

#[tokio::test]
async fn test_oversized_bodies_are_500() {
    let worker = MockWorker::start().await;
    let launcher = Arc::new(TestLauncher::new().with_wallet("T1", worker.port));
    let config = ForwarderConfig {
        max_body_bytes: 1024,
        ..Default::default()
    };
    let gateway = build_gateway(&launcher, config);

    // Worker response over the limit
    let response = gateway.handle(get("/cloud-wallet/T1/big")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // Request body over the limit never reaches the worker
    let before = worker.requests().len();
    let request = Request::put("/cloud-wallet/T1/echo")
        .body(Full::new(Bytes::from(vec![b'y'; 2048])))
        .unwrap();
    let response = gateway.handle(request).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(worker.requests().len(), before);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_spawn() {
    let worker = MockWorker::start().await;
    let launcher = Arc::new(
        TestLauncher::new()
            .with_wallet("T1", worker.port)
            .with_ready_delay(Duration::from_millis(100)),
    );
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    let requests = (0..20).map(|i| {
        let gateway = Arc::clone(&gateway);
        async move { gateway.handle(get(&format!("/cloud-wallet/T1/item/{}", i))).await }
    });
    let responses = join_all(requests).await;

    for response in responses {
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(launcher.launches().len(), 1);
    assert_eq!(worker.requests().len(), 20);
}

#[tokio::test]
async fn test_concurrent_failures_share_one_spawn() {
    let launcher = Arc::new(TestLauncher::new().with_ready_delay(Duration::from_millis(100)));
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    let requests = (0..10).map(|_| {
        let gateway = Arc::clone(&gateway);
        async move { gateway.handle(get("/cloud-wallet/missing/x")).await }
    });

    for response in join_all(requests).await {
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_of(response).await, INVALID_WALLET_HTML_RESPONSE.as_bytes());
    }
    assert_eq!(launcher.launches().len(), 1);

    // The failed record is gone, so the next request tries again
    let response = gateway.handle(get("/cloud-wallet/missing/x")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(launcher.launches().len(), 2);
}

#[tokio::test]
async fn test_explicit_token_overrides_binding() {
    let worker = MockWorker::start().await;
    let launcher = Arc::new(
        TestLauncher::new()
            .with_wallet("T1", worker.port)
            .with_wallet("direct", worker.port),
    );
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    let bound = gateway
        .handle(put_json("/cloud-wallet/setSSAPPToken/W1", r#"{"sReadSSI":"T1"}"#))
        .await;
    let cookie = cookie_from(&bound);

    let mut request = Request::get("/cloud-wallet/W1/page")
        .header(COOKIE, &cookie)
        .body(Full::new(Bytes::new()))
        .unwrap();
    request
        .extensions_mut()
        .insert(CapabilityToken("direct".to_string()));

    assert_eq!(gateway.handle(request).await.status(), StatusCode::OK);
    assert_eq!(worker.last().path, "/page");

    let launches = launcher.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].seed, "direct");
    assert_eq!(launches[0].wallet_anchor_id, None);
}

#[tokio::test]
async fn test_unknown_routes_are_404() {
    let launcher = Arc::new(TestLauncher::new());
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    for uri in ["/", "/health", "/cloud-wallet", "/wallet/loader/other/x"] {
        let response = gateway.handle(get(uri)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "uri {}", uri);
        assert!(body_of(response).await.is_empty());
    }
    assert!(launcher.launches().is_empty());
}

#[tokio::test]
async fn test_relisten_hook_terminates_workers() {
    let worker = MockWorker::start().await;
    let launcher = Arc::new(
        TestLauncher::new()
            .with_wallet("A", worker.port)
            .with_wallet("B", worker.port),
    );
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    gateway.handle(get("/cloud-wallet/A/")).await;
    gateway.handle(get("/cloud-wallet/B/")).await;

    assert_eq!(gateway.prepare_relisten(), 2);
    assert!(launcher.all_terminated());
}

#[tokio::test]
async fn test_server_serves_over_tcp() {
    let worker = MockWorker::start().await;
    let launcher = Arc::new(TestLauncher::new().with_wallet("T1", worker.port));
    let gateway = build_gateway(&launcher, ForwarderConfig::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = GatewayServer::new(addr, gateway, shutdown_rx);
    let handle = tokio::spawn(server.serve(listener));

    let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();

    let request = Request::get(format!("http://{}/cloud-wallet/T1/hello", addr))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = client.request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, "worker:/hello");

    let request = Request::get(format!("http://{}/nothing", addr))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = client.request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_process_worker_end_to_end() {
    use walletgate::config::CloudWalletConfig;
    use walletgate::launcher::ProcessLauncher;

    let worker = MockWorker::start().await;
    let dir = tempfile::tempdir().unwrap();
    let data_file = dir.path().join("worker-data.json");
    let script = dir.path().join("boot.sh");
    std::fs::write(
        &script,
        format!(
            "read -r line\nprintf '%s\\n' \"$line\" > \"$DATA_FILE\"\necho booting\necho '{{\"port\": {}}}'\nexec sleep 30\n",
            worker.port
        ),
    )
    .unwrap();

    let mut config = CloudWalletConfig::new(&script.to_string_lossy()).with_runtime("sh", vec![]);
    config
        .env
        .insert("DATA_FILE".to_string(), data_file.to_string_lossy().into_owned());
    config.shutdown_grace_period_secs = 1;

    let launcher: Arc<dyn WorkerLauncher> = Arc::new(ProcessLauncher::new(&config));
    let registry = WorkerRegistry::new(launcher, dir.path().join("cache"), Duration::from_secs(10));
    let gateway = Gateway::new(Arc::clone(&registry), Forwarder::new(ForwarderConfig::default()));

    let response = gateway.handle(get("/cloud-wallet/T1/file.txt")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_of(response).await, "worker:/file.txt");

    let data: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&data_file).unwrap()).unwrap();
    assert_eq!(data["seed"], "T1");
    assert_eq!(
        data["cacheContainerPath"],
        dir.path().join("cache").to_string_lossy().as_ref()
    );
    let key = data["authorizationKey"].as_str().unwrap();
    assert_eq!(worker.last().headers.get(AUTHORIZATION).unwrap(), key);

    // Stopping the worker removes its record; the next request respawns
    assert_eq!(gateway.prepare_relisten(), 1);
    wait_until_empty(&registry).await;

    let response = gateway.handle(get("/cloud-wallet/T1/again")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let respawned: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&data_file).unwrap()).unwrap();
    assert_ne!(respawned["authorizationKey"], data["authorizationKey"]);

    registry.terminate_all();
    wait_until_empty(&registry).await;
}
