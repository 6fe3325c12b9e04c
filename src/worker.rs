//! Per-wallet worker registry
//!
//! One [`WorkerRecord`] exists per capability token. A record is inserted
//! into the registry *before* its runtime unit is launched, so concurrent
//! requests for an unseen key all find the same record and share its
//! readiness handle instead of spawning duplicates.
//!
//! A record moves `SPAWNING -> READY` or `SPAWNING -> FAILED`. Failed records
//! are removed immediately; ready records are removed once their runtime unit
//! exits. Either way the next request for the key spawns afresh.

use crate::error::SpawnError;
use crate::launcher::{LaunchedWorker, Terminator, WorkerData, WorkerEvent, WorkerLauncher};
use crate::redact;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Random bytes in a worker authorization key (hex-encoded to twice this length)
pub const AUTHORIZATION_KEY_BYTES: usize = 64;

/// Readiness of a worker record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The runtime unit has not reported yet
    Pending,
    /// The runtime unit listens on this loopback port
    Ready(u16),
    /// The runtime unit will never become ready
    Failed(SpawnError),
}

/// Request-derived parameters for a spawn
#[derive(Debug, Clone, Default)]
pub struct SpawnParams {
    /// Cookie header of the triggering request
    pub cookie: Option<String>,
    /// Anchor id, when the key came from a cookie binding
    pub wallet_anchor_id: Option<String>,
}

/// A wallet worker, from first lookup until its runtime unit is gone
pub struct WorkerRecord {
    key: String,
    authorization_key: OnceLock<String>,
    readiness: watch::Sender<Readiness>,
    terminator: Mutex<TerminatorSlot>,
    created_at: Instant,
}

/// The unit's terminator, plus a stop request that may arrive before launch
#[derive(Default)]
struct TerminatorSlot {
    terminator: Option<Terminator>,
    stop_requested: bool,
}

impl WorkerRecord {
    fn new(key: &str) -> Self {
        let (readiness, _) = watch::channel(Readiness::Pending);
        Self {
            key: key.to_string(),
            authorization_key: OnceLock::new(),
            readiness,
            terminator: Mutex::new(TerminatorSlot::default()),
            created_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Loopback port, once ready
    pub fn port(&self) -> Option<u16> {
        match *self.readiness.borrow() {
            Readiness::Ready(port) => Some(port),
            _ => None,
        }
    }

    /// Secret sent as `authorization` on every forwarded request
    pub fn authorization_key(&self) -> Option<&str> {
        self.authorization_key.get().map(String::as_str)
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.borrow().clone()
    }

    /// Time since the record was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Wait until the record is ready or failed
    pub async fn ready(&self) -> Result<u16, SpawnError> {
        let mut rx = self.readiness.subscribe();
        let state = match rx.wait_for(|state| *state != Readiness::Pending).await {
            Ok(state) => state.clone(),
            Err(_) => return Err(SpawnError::Abandoned),
        };

        match state {
            Readiness::Ready(port) => Ok(port),
            Readiness::Failed(e) => Err(e),
            Readiness::Pending => Err(SpawnError::Abandoned),
        }
    }

    /// Resolve readiness; only the first resolution takes effect
    fn resolve(&self, outcome: Readiness) -> bool {
        self.readiness.send_if_modified(|state| {
            if *state == Readiness::Pending {
                *state = outcome;
                true
            } else {
                false
            }
        })
    }

    /// Store the unit's terminator, stopping the unit at once if a stop was
    /// requested while it was being launched
    fn set_terminator(&self, terminator: Terminator) {
        let mut slot = self.terminator.lock();
        if slot.stop_requested {
            terminator.terminate();
        }
        slot.terminator = Some(terminator);
    }

    /// Stop the runtime unit. Returns whether one was already launched; if not,
    /// the unit is stopped as soon as its launch completes.
    pub fn terminate(&self) -> bool {
        let mut slot = self.terminator.lock();
        slot.stop_requested = true;
        match slot.terminator.as_ref() {
            Some(terminator) => {
                terminator.terminate();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for WorkerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRecord")
            .field("key", &redact(&self.key))
            .field("readiness", &*self.readiness.borrow())
            .finish_non_exhaustive()
    }
}

/// Generate a fresh hex-encoded authorization key from the OS RNG
pub fn generate_authorization_key() -> Result<String, SpawnError> {
    let mut bytes = [0u8; AUTHORIZATION_KEY_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| SpawnError::KeyGeneration(e.to_string()))?;
    Ok(hex::encode(bytes))
}

/// Owns every worker record, keyed by capability token.
///
/// Like the handlers that use it, the registry lives behind an `Arc`;
/// [`get_or_create`](WorkerRegistry::get_or_create) needs `&Arc<Self>` to hand
/// a reference to the spawn task.
pub struct WorkerRegistry {
    workers: DashMap<String, Arc<WorkerRecord>>,
    launcher: Arc<dyn WorkerLauncher>,
    cache_container_path: PathBuf,
    spawn_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        cache_container_path: PathBuf,
        spawn_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            workers: DashMap::new(),
            launcher,
            cache_container_path,
            spawn_timeout,
        })
    }

    /// Return the record for `key`, creating it and starting a spawn if absent.
    ///
    /// An existing record is returned whatever its state, including mid-spawn.
    pub fn get_or_create(self: &Arc<Self>, key: &str, params: SpawnParams) -> Arc<WorkerRecord> {
        let record = match self.workers.entry(key.to_string()) {
            Entry::Occupied(entry) => return Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let record = Arc::new(WorkerRecord::new(key));
                entry.insert(Arc::clone(&record));
                record
            }
        };

        let registry = Arc::clone(self);
        let spawned = Arc::clone(&record);
        tokio::spawn(async move {
            registry.spawn(spawned, params).await;
        });

        record
    }

    /// Current record for `key`, if any
    pub fn get(&self, key: &str) -> Option<Arc<WorkerRecord>> {
        self.workers.get(key).map(|r| Arc::clone(r.value()))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.workers.iter().map(|e| e.key().clone()).collect()
    }

    /// Ask every runtime unit to stop, including ones still being launched.
    ///
    /// Records stay in the map; each is removed when its unit exits. Returns
    /// the number of units that were already launched.
    pub fn terminate_all(&self) -> usize {
        let mut terminated = 0;
        for entry in self.workers.iter() {
            if entry.value().terminate() {
                terminated += 1;
            }
        }
        info!(count = terminated, "Stopping worker runtime units");
        terminated
    }

    /// Remove `record` if it is still the registered record for its key
    fn remove(&self, record: &Arc<WorkerRecord>) {
        self.workers
            .remove_if(record.key(), |_, current| Arc::ptr_eq(current, record));
    }

    fn fail(&self, record: &Arc<WorkerRecord>, error: SpawnError) {
        error!(
            key = %redact(record.key()),
            phase = "spawn",
            error = %error,
            "Worker failed to start"
        );
        record.resolve(Readiness::Failed(error));
        self.remove(record);
    }

    async fn spawn(self: Arc<Self>, record: Arc<WorkerRecord>, params: SpawnParams) {
        let key = redact(record.key());

        let authorization_key = match generate_authorization_key() {
            Ok(k) => k,
            Err(e) => return self.fail(&record, e),
        };
        let _ = record.authorization_key.set(authorization_key.clone());

        debug!(key = %key, "Starting worker for wallet");
        let data = WorkerData {
            seed: record.key().to_string(),
            authorization_key,
            cookie: params.cookie,
            cache_container_path: self.cache_container_path.clone(),
            wallet_anchor_id: params.wallet_anchor_id,
        };

        let LaunchedWorker {
            mut events,
            terminator,
        } = match self.launcher.launch(data) {
            Ok(launched) => launched,
            Err(e) => return self.fail(&record, SpawnError::Launch(e.to_string())),
        };
        record.set_terminator(terminator.clone());

        // Phase 1: wait for the unit to report a port
        let first = tokio::time::timeout(self.spawn_timeout, events.recv()).await;
        match first {
            Ok(Some(WorkerEvent::Ready(port))) => {
                record.resolve(Readiness::Ready(port));
                info!(
                    key = %key,
                    port,
                    startup_ms = record.age().as_millis() as u64,
                    "Worker is now ready"
                );
            }
            Ok(Some(WorkerEvent::Error(message))) => {
                self.fail(&record, SpawnError::Reported(message));
                terminator.terminate();
                return;
            }
            Ok(Some(WorkerEvent::Exit(code))) => {
                return self.fail(&record, SpawnError::ExitedEarly(code));
            }
            Ok(None) => {
                return self.fail(&record, SpawnError::ExitedEarly(-1));
            }
            Err(_) => {
                self.fail(&record, SpawnError::Timeout(self.spawn_timeout.as_secs()));
                terminator.terminate();
                return;
            }
        }

        // Phase 2: the unit is serving; drop the record once it is gone
        loop {
            match events.recv().await {
                Some(WorkerEvent::Ready(port)) => {
                    debug!(key = %key, port, "Ignoring duplicate readiness message");
                }
                Some(WorkerEvent::Error(message)) => {
                    error!(key = %key, error = %message, "Worker reported an error, dropping it");
                    terminator.terminate();
                    break;
                }
                Some(WorkerEvent::Exit(0)) => {
                    info!(key = %key, "Worker exited");
                    break;
                }
                Some(WorkerEvent::Exit(code)) => {
                    warn!(key = %key, code, "Worker stopped with exit code");
                    break;
                }
                None => {
                    warn!(key = %key, "Worker event channel closed");
                    break;
                }
            }
        }

        self.remove(&record);
    }
}
