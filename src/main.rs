use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use walletgate::config::Config;
use walletgate::forward::{Forwarder, ForwarderConfig};
use walletgate::gateway::{Gateway, GatewayServer};
use walletgate::launcher::{ProcessLauncher, WorkerLauncher};
use walletgate::worker::WorkerRegistry;
use walletgate::{PKG_NAME, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("walletgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let cache_container_path = config.storage.cache_container_path();
    if let Err(e) = std::fs::create_dir_all(&cache_container_path) {
        warn!(
            path = %cache_container_path.display(),
            error = %e,
            "Failed to create worker cache directory"
        );
    }

    let launcher = ProcessLauncher::new(&config.cloud_wallet);
    let (program, args) = launcher.command_line();
    info!(program = %program.display(), args = ?args, "Using boot script for workers");

    let launcher: Arc<dyn WorkerLauncher> = Arc::new(launcher);
    let registry = WorkerRegistry::new(
        launcher,
        cache_container_path,
        config.cloud_wallet.spawn_timeout(),
    );
    let forwarder = Forwarder::new(ForwarderConfig::from_config(&config));
    let gateway = Arc::new(Gateway::new(Arc::clone(&registry), forwarder));

    let tls_acceptor = if config.server.tls_enabled() {
        Some(build_tls_acceptor(&config)?)
    } else {
        None
    };

    let mut listeners = Listeners::start(&config, &gateway, tls_acceptor.as_ref())?;

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or relisten (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, restarting listeners...");
                    let stopped = gateway.prepare_relisten();
                    info!(workers = stopped, "Stopped workers before relisten");
                    listeners.stop().await;
                    listeners = Listeners::start(&config, &gateway, tls_acceptor.as_ref())?;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    info!(workers = registry.len(), "Stopping all workers...");
    registry.terminate_all();
    listeners.stop().await;

    // Give workers their grace period to exit before the process goes away
    let grace = config.cloud_wallet.shutdown_grace_period() + Duration::from_secs(1);
    let _ = tokio::time::timeout(grace, async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// The running HTTP and HTTPS listeners of one generation
struct Listeners {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Listeners {
    fn start(
        config: &Config,
        gateway: &Arc<Gateway>,
        tls_acceptor: Option<&TlsAcceptor>,
    ) -> anyhow::Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        let http_port = config.server.http_port();
        if http_port > 0 {
            let addr = bind_addr(&config.server.bind, http_port)?;
            let server = GatewayServer::new(addr, Arc::clone(gateway), shutdown_rx.clone());
            handles.push(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "HTTP gateway server error");
                }
            }));
        }

        let https_port = config.server.https_port();
        if let Some(acceptor) = tls_acceptor.filter(|_| https_port > 0) {
            let addr = bind_addr(&config.server.bind, https_port)?;
            let server = GatewayServer::new(addr, Arc::clone(gateway), shutdown_rx)
                .with_tls(acceptor.clone());
            handles.push(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "HTTPS gateway server error");
                }
            }));
        }

        Ok(Self {
            shutdown_tx,
            handles,
        })
    }

    /// Signal every listener to stop and wait (bounded) for them to close
    async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        let handles = std::mem::take(&mut self.handles);
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await;
    }
}

fn bind_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind = %bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", bind, port, e)
    })
}

/// Open PID file; on Unix it holds an exclusive `flock` for its lifetime
struct PidFile {
    _file: File,
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor belongs to `file`, which outlives the call
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("PID file {} is locked by a running gateway", path.display());
            }
            return Err(err.into());
        }
    }

    writeln!(file, "{}", std::process::id())?;
    Ok(PidFile { _file: file })
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting wallet gateway");
    let http_port = config.server.http_port();
    let https_port = config.server.https_port();
    info!(
        bind = %config.server.bind,
        http_port = if http_port > 0 { Some(http_port) } else { None },
        https_port = if https_port > 0 { Some(https_port) } else { None },
        tls = config.server.tls_enabled(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        spawn_timeout_secs = config.cloud_wallet.spawn_timeout_secs,
        request_timeout_secs = config.cloud_wallet.request_timeout_secs,
        max_body_bytes = config.cloud_wallet.max_body_bytes,
        "Request handling settings"
    );
    info!(
        shutdown_grace_period_secs = config.cloud_wallet.shutdown_grace_period_secs,
        cache = %config.storage.cache_container_path().display(),
        "Worker settings"
    );
}

fn build_tls_acceptor(config: &Config) -> anyhow::Result<TlsAcceptor> {
    let (Some(cert_path), Some(key_path)) = (&config.server.tls_cert, &config.server.tls_key) else {
        anyhow::bail!("TLS requires both tls_cert and tls_key");
    };

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn pem_reader(path: &str, kind: &str) -> anyhow::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| anyhow::anyhow!("Cannot open TLS {} {}: {}", kind, path, e))
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = pem_reader(path, "certificate")?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("Invalid certificate PEM in {}: {}", path, e))?;
    if certs.is_empty() {
        anyhow::bail!("{} contains no certificates", path);
    }
    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = pem_reader(path, "key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| anyhow::anyhow!("Invalid key PEM in {}: {}", path, e))?
        .ok_or_else(|| anyhow::anyhow!("{} contains no private key", path))
}
