//! Broker lifecycle and certificate-material rotation.
//!
//! The concrete MQTT wire engine is an external collaborator behind
//! [`BrokerEngine`]: it owns sockets and sessions and calls back into the
//! interceptor and authorizator. The [`Broker`] value wires the security core
//! to an engine with idempotent `start`/`stop`; `start` after `stop`
//! re-constructs every component, which is how key material gets re-read.
//!
//! [`InProcessEngine`] is the in-tree loopback engine used by tests and the
//! development daemon; production embeds a real MQTT library implementing the
//! same trait.

use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::authenticator::Authenticator;
use crate::authorizator::Authorizator;
use crate::interceptor::{
    ConnectDecision, ConnectEvent, Interceptor, InterceptorOptions, SessionControl,
};
use crate::registry::Registry;
use crate::tls::{build_server_context, ServerTlsContext, TlsPaths};

pub const DEFAULT_TLS_PORT: u16 = 8884;
pub const DEFAULT_CONTROLLER_ID: &str = "controller-01";
pub const DEFAULT_ROTATION_MIN: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_ROTATION_MAX: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const DEFAULT_FILE_POLL: Duration = Duration::from_secs(5 * 60);

// -------------------- Engine seam --------------------

/// Everything an engine needs to serve one broker generation.
#[derive(Clone)]
pub struct EngineBinding {
    /// TLS listener address. The plaintext listener is never opened.
    pub bind_addr: String,
    pub tls: ServerTlsContext,
    pub authorizator: Arc<Authorizator>,
    pub interceptor: Arc<Interceptor>,
}

/// The wire-protocol collaborator. Implementations deliver CONNECT,
/// DISCONNECT and publish events to the bound interceptor, gate subscribe and
/// publish through the bound authorizator, and close sessions on demand.
pub trait BrokerEngine: Send + Sync {
    fn start(&self, binding: EngineBinding) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn session_control(&self) -> Arc<dyn SessionControl>;
}

// -------------------- Broker --------------------

#[derive(Clone, Debug)]
pub struct BrokerSettings {
    pub bind_addr: String,
    pub controller_id: String,
    pub tls: TlsPaths,
    pub interceptor: InterceptorOptions,
}

struct Running {
    interceptor: Arc<Interceptor>,
}

/// Owned broker instance with idempotent lifecycle. Replaces a process-wide
/// singleton: construct once, pass by `Arc`.
pub struct Broker {
    settings: BrokerSettings,
    registry: Arc<Registry>,
    engine: Arc<dyn BrokerEngine>,
    running: Mutex<Option<Running>>,
}

impl Broker {
    pub fn new(
        settings: BrokerSettings,
        registry: Arc<Registry>,
        engine: Arc<dyn BrokerEngine>,
    ) -> Self {
        Self {
            settings,
            registry,
            engine,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().map(|r| r.is_some()).unwrap_or(false)
    }

    /// Start the broker. A second call while running is a no-op. On any
    /// failure the broker does not enter the started state.
    pub fn start(&self) -> Result<()> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| anyhow!("broker lifecycle lock poisoned"))?;
        if running.is_some() {
            log::debug!("broker already started");
            return Ok(());
        }

        let tls = build_server_context(&self.settings.tls)?;
        let authenticator = Arc::new(Authenticator::new(self.registry.clone()));
        let authorizator = Arc::new(Authorizator::new(
            self.registry.clone(),
            &self.settings.controller_id,
        ));
        let interceptor = Arc::new(Interceptor::new(
            self.registry.clone(),
            authenticator,
            self.engine.session_control(),
            self.settings.interceptor.clone(),
        )?);

        self.engine.start(EngineBinding {
            bind_addr: self.settings.bind_addr.clone(),
            tls,
            authorizator,
            interceptor: interceptor.clone(),
        })?;

        *running = Some(Running { interceptor });
        log::info!(
            "broker started on {} (controller id {})",
            self.settings.bind_addr,
            self.settings.controller_id
        );
        Ok(())
    }

    /// Stop the broker. A second call while stopped is a no-op.
    pub fn stop(&self) -> Result<()> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| anyhow!("broker lifecycle lock poisoned"))?;
        let Some(state) = running.take() else {
            log::debug!("broker already stopped");
            return Ok(());
        };
        self.engine.stop()?;
        state.interceptor.shutdown();
        log::info!("broker stopped");
        Ok(())
    }

    /// Stop and start again with the same paths; key material is re-read
    /// from disk by the new TLS context.
    pub fn restart(&self) -> Result<()> {
        self.stop()?;
        self.start()
    }
}

// -------------------- Cert rotation --------------------

/// Jittered rotation delay: absolute-value modulo of a random 64-bit draw,
/// mapped into `[min_secs, max_secs]` inclusive. Equal bounds yield exactly
/// that value.
pub fn rotation_delay_secs(min_secs: u64, max_secs: u64, draw: i64) -> u64 {
    if max_secs <= min_secs {
        return min_secs;
    }
    let span = max_secs - min_secs + 1;
    min_secs + draw.unsigned_abs() % span
}

fn snapshot_mtimes(files: &[PathBuf]) -> HashMap<PathBuf, Option<SystemTime>> {
    files
        .iter()
        .map(|path| {
            let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
            (path.clone(), mtime)
        })
        .collect()
}

fn mtimes_changed(
    before: &HashMap<PathBuf, Option<SystemTime>>,
    after: &HashMap<PathBuf, Option<SystemTime>>,
) -> bool {
    before
        .iter()
        .any(|(path, mtime)| after.get(path).map(|m| m != mtime).unwrap_or(true))
}

/// Periodic certificate-material reload: one thread multiplexing a jittered
/// next-rotation timer and a file-modification poll. Either tick restarts
/// the broker.
pub struct CertRotationService {
    shutdown_tx: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CertRotationService {
    pub fn start(
        broker: Arc<Broker>,
        paths: TlsPaths,
        window: (Duration, Duration),
        poll: Duration,
    ) -> Result<Self> {
        let (min, max) = window;
        if min > max {
            return Err(anyhow!(
                "rotation window min ({}s) exceeds max ({}s)",
                min.as_secs(),
                max.as_secs()
            ));
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("hub-cert-rotation".to_string())
            .spawn(move || {
                let files = paths.watched_files();
                let mut mtimes = snapshot_mtimes(&files);
                let mut rotation_deadline = Instant::now() + next_delay(min, max);
                let mut poll_deadline = Instant::now() + poll;

                loop {
                    let now = Instant::now();
                    let wait = rotation_deadline
                        .min(poll_deadline)
                        .saturating_duration_since(now);
                    match shutdown_rx.recv_timeout(wait) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }

                    let now = Instant::now();
                    let mut restart = false;
                    if now >= rotation_deadline {
                        log::info!("scheduled certificate rotation due");
                        restart = true;
                    }
                    if now >= poll_deadline {
                        poll_deadline = now + poll;
                        let current = snapshot_mtimes(&files);
                        if mtimes_changed(&mtimes, &current) {
                            log::info!("certificate material changed on disk");
                            restart = true;
                        }
                    }

                    if restart {
                        if let Err(e) = broker.restart() {
                            log::error!("broker restart after cert reload failed: {}", e);
                        }
                        mtimes = snapshot_mtimes(&files);
                        rotation_deadline = Instant::now() + next_delay(min, max);
                    }
                }
            })?;
        Ok(Self {
            shutdown_tx,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CertRotationService {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn next_delay(min: Duration, max: Duration) -> Duration {
    let delay_secs = rotation_delay_secs(min.as_secs(), max.as_secs(), rand::random::<i64>());
    log::info!(
        "next certificate rotation in {:.1} hours",
        delay_secs as f64 / 3600.0
    );
    Duration::from_secs(delay_secs)
}

// -------------------- In-process engine --------------------

struct EngineState {
    binding: Mutex<Option<EngineBinding>>,
    sessions: Mutex<HashSet<String>>,
}

/// Loopback engine: sessions are entries in a map, wire I/O is function
/// calls. Used by the test suite and the development daemon; it exercises the
/// same interceptor and authorizator surface a socket engine would.
pub struct InProcessEngine {
    state: Arc<EngineState>,
}

impl InProcessEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(EngineState {
                binding: Mutex::new(None),
                sessions: Mutex::new(HashSet::new()),
            }),
        }
    }

    fn binding(&self) -> Option<EngineBinding> {
        self.state.binding.lock().ok().and_then(|b| b.clone())
    }

    /// Simulate a client CONNECT. Admission runs through the interceptor.
    pub fn connect(&self, client_id: &str, peer_addr: &str) -> ConnectDecision {
        let Some(binding) = self.binding() else {
            return ConnectDecision::Reject;
        };
        let decision = binding.interceptor.on_connect(&ConnectEvent {
            client_id,
            peer_addr,
            client_info: None,
        });
        if decision == ConnectDecision::Accept {
            if let Ok(mut sessions) = self.state.sessions.lock() {
                sessions.insert(client_id.to_string());
            }
        }
        decision
    }

    /// Simulate a publish. ACL first; an admitted message reaches the
    /// interceptor's publish path synchronously.
    pub fn publish(&self, client_id: &str, topic: &str, payload: &[u8]) -> bool {
        let Some(binding) = self.binding() else {
            return false;
        };
        if !self.is_connected(client_id) {
            return false;
        }
        if !binding.authorizator.can_write(Some(client_id), Some(topic)) {
            return false;
        }
        binding.interceptor.process_publish(client_id, topic, payload);
        true
    }

    /// Simulate a subscribe attempt; returns the ACL decision.
    pub fn subscribe(&self, client_id: &str, topic: &str) -> bool {
        let Some(binding) = self.binding() else {
            return false;
        };
        if !self.is_connected(client_id) {
            return false;
        }
        binding.authorizator.can_read(Some(client_id), Some(topic))
    }

    /// Simulate a client-initiated DISCONNECT.
    pub fn disconnect(&self, client_id: &str) {
        let was_connected = self
            .state
            .sessions
            .lock()
            .map(|mut sessions| sessions.remove(client_id))
            .unwrap_or(false);
        if !was_connected {
            return;
        }
        if let Some(binding) = self.binding() {
            binding.interceptor.on_disconnect(client_id);
        }
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.state
            .sessions
            .lock()
            .map(|sessions| sessions.contains(client_id))
            .unwrap_or(false)
    }
}

impl Default for InProcessEngine {
    fn default() -> Self {
        Self::new()
    }
}

struct InProcessSessions {
    state: Arc<EngineState>,
}

impl SessionControl for InProcessSessions {
    fn close_session(&self, client_id: &str) {
        let was_connected = self
            .state
            .sessions
            .lock()
            .map(|mut sessions| sessions.remove(client_id))
            .unwrap_or(false);
        if !was_connected {
            return;
        }
        // A torn-down session fires DISCONNECT, exactly like a socket engine.
        let binding = self.state.binding.lock().ok().and_then(|b| b.clone());
        if let Some(binding) = binding {
            binding.interceptor.on_disconnect(client_id);
        }
        log::debug!("session {} closed by broker", client_id);
    }
}

impl BrokerEngine for InProcessEngine {
    fn start(&self, binding: EngineBinding) -> Result<()> {
        let mut slot = self
            .state
            .binding
            .lock()
            .map_err(|_| anyhow!("engine binding lock poisoned"))?;
        if slot.is_some() {
            return Err(anyhow!("engine already started"));
        }
        *slot = Some(binding);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut slot = self
            .state
            .binding
            .lock()
            .map_err(|_| anyhow!("engine binding lock poisoned"))?;
        *slot = None;
        if let Ok(mut sessions) = self.state.sessions.lock() {
            sessions.clear();
        }
        Ok(())
    }

    fn session_control(&self) -> Arc<dyn SessionControl> {
        Arc::new(InProcessSessions {
            state: self.state.clone(),
        })
    }
}
