//! Error taxonomy and the fixed responses the gateway emits on failure
//!
//! Only a spawn failure produces a human-readable body. Every other failure is
//! a bare status code so that nothing from a worker leaks through the gateway.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// Page served when a wallet worker cannot be readied
pub const INVALID_WALLET_HTML_RESPONSE: &str = r#"
    <html>
    <body>
        <p>
            The application has encountered an unexpected error. <br/>
            If you have network issues please use the following to refresh the application.
        </p>
        <button id="refresh">Refresh</button>
        <script>
            document.getElementById("refresh").addEventListener("click", function() {
                window.top.location.reload();
            });
        </script>
    </body>
    </html>
"#;

/// Why a worker never became ready
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SpawnError {
    /// The OS random generator could not produce an authorization key
    #[error("failed to generate worker authorization key: {0}")]
    KeyGeneration(String),
    /// The runtime unit could not be started
    #[error("failed to launch worker: {0}")]
    Launch(String),
    /// The runtime unit reported an error instead of a port
    #[error("worker reported error: {0}")]
    Reported(String),
    /// The runtime unit exited before reporting a port
    #[error("worker exited with code {0} before becoming ready")]
    ExitedEarly(i32),
    /// No readiness message arrived within the spawn timeout
    #[error("worker did not become ready within {0} seconds")]
    Timeout(u64),
    /// The readiness handle was dropped unresolved
    #[error("worker readiness was abandoned")]
    Abandoned,
}

/// Terminal outcomes of a gateway request other than success
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Missing or malformed client input
    #[error("invalid client input: {0}")]
    ClientInput(String),
    /// The worker for the key failed to start
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// The loopback exchange with a ready worker failed
    #[error("worker transport error: {0}")]
    WorkerTransport(String),
    /// A request or response body could not be buffered
    #[error("failed to buffer body: {0}")]
    Buffering(String),
    /// The worker answered with a non-2xx status
    #[error("worker responded with status {status}")]
    WorkerUpstream {
        status: StatusCode,
        content_type: HeaderValue,
    },
}

impl GatewayError {
    /// Status code reported to the client
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::ClientInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::Spawn(_) => StatusCode::BAD_REQUEST,
            GatewayError::WorkerTransport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Buffering(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::WorkerUpstream { status, .. } => *status,
        }
    }

    /// Short phase label used in logs
    pub fn phase(&self) -> &'static str {
        match self {
            GatewayError::ClientInput(_) => "input",
            GatewayError::Spawn(_) => "spawn",
            GatewayError::WorkerTransport(_) => "transport",
            GatewayError::Buffering(_) => "buffering",
            GatewayError::WorkerUpstream { .. } => "upstream",
        }
    }

    /// Build the client-facing response for this error.
    ///
    /// The worker's own error body is never passed through.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        match self {
            GatewayError::Spawn(_) => fallback_response(),
            GatewayError::WorkerUpstream {
                status,
                content_type,
            } => {
                let mut response = empty_response(status);
                response.headers_mut().insert(CONTENT_TYPE, content_type);
                response
            }
            other => empty_response(other.status_code()),
        }
    }
}

/// A response with the given status and no body
pub fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("valid response with StatusCode enum")
}

/// The 400 text/html fallback page for wallets that cannot be readied
pub fn fallback_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(CONTENT_TYPE, "text/html")
        .body(Full::new(Bytes::from_static(INVALID_WALLET_HTML_RESPONSE.as_bytes())))
        .expect("valid response with StatusCode enum and static header")
}
