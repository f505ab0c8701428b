//! `ProxyNode`: one running workspace proxy replica.
//!
//! ```text
//!  start:  preflight ─► register (first attempt) ─► dialer ─► apps
//!                                                            │
//!                                          apply response ◄──┘
//!                                          (key, mesh, relay map) ──► Serving
//!
//!  close:  cancel ─► wait loop (grace) ─► relay ─► apps ─► dialer ─► idle conns
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{watch, OnceCell};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;
use wsp_domain::buildinfo::{versions_match, BuildInfo};
use wsp_domain::config::{
    Config, DialerConfig, DialerStrategy, FailurePolicy, RegistrationConfig,
};
use wsp_domain::hostname::{compile_hostname_pattern, replica_hostname};
use wsp_protocol::{RegisterProxyRequest, RegisterProxyResponse};
use wsp_sdk::{
    DialAgent, DialError, PrimaryApi, RegisterHooks, RegisterLoop, RegisterLoopHandle,
    RegisterLoopOptions, RegistrationFailure, SdkError,
};

use crate::apps::AppServer;
use crate::dialer::{AgentDialer, CacheDialer, SharedSessionDialer};
use crate::health::HealthReporter;
use crate::mesh::MeshCoordinator;
use crate::relay::RelayHub;
use crate::shutdown::{ShutdownError, ShutdownReport, ShutdownStep};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options, state, errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a node needs besides its primary connection.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub access_url: String,
    /// Wildcard hostname for subdomain apps, empty to disable.
    pub app_hostname: String,
    pub relay_enabled: bool,
    /// Address siblings use to reach this replica's relay.
    pub relay_address: String,
    pub replica_hostname: String,
    pub registration: RegistrationConfig,
    pub dialer: DialerConfig,
    pub build: BuildInfo,
}

impl NodeOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            access_url: cfg.proxy.access_url.clone(),
            app_hostname: cfg.proxy.app_hostname.clone(),
            relay_enabled: cfg.proxy.relay_enabled,
            relay_address: cfg.proxy.relay_address.clone(),
            replica_hostname: replica_hostname(),
            registration: cfg.registration.clone(),
            dialer: cfg.dialer.clone(),
            build: BuildInfo::current(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Created,
    Registering,
    Serving,
    Closing,
    Closed,
    /// Construction failed; never observed on a returned node.
    Failed,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to get build info from primary: {0}")]
    Preflight(SdkError),
    #[error("dashboard url ({0}) is a workspace proxy, must be a primary coderd")]
    PrimaryIsProxy(String),
    #[error("register with primary: {0}")]
    Registration(SdkError),
    #[error("apply registration: {0}")]
    ApplyRegistration(String),
    #[error("create agent dialer: {0}")]
    Dialer(DialError),
    #[error("re-registration failed {consecutive_failures} times in a row: {error}")]
    RegistrationLost {
        consecutive_failures: u32,
        error: SdkError,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration hooks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Applies a registration response to the node's components.  Used for
/// the first response and for every background success.
struct RegistrationApplier {
    mesh: Arc<MeshCoordinator>,
    apps: Arc<AppServer>,
    dialer: Arc<AgentDialer>,
    relay_enabled: bool,
}

impl RegistrationApplier {
    fn apply(&self, resp: &RegisterProxyResponse) -> Result<(), String> {
        self.apps
            .set_security_key(&resp.app_security_key)
            .map_err(|e| e.to_string())?;
        if self.relay_enabled {
            self.mesh.set_mesh_key(&resp.derp_mesh_key);
            self.mesh
                .set_addresses(&resp.sibling_relay_addresses(), false);
        }
        self.dialer
            .set_relay_map(&resp.derp_map, Some(resp.derp_region_id));
        Ok(())
    }
}

/// Decides what a failed background registration means for the node.
struct FailureHandler {
    policy: FailurePolicy,
    max_failure_count: u32,
    closing: CancellationToken,
    fatal: Arc<watch::Sender<Option<NodeError>>>,
}

impl FailureHandler {
    fn handle(&self, failure: &RegistrationFailure) {
        match self.policy {
            FailurePolicy::Ignore => {}
            FailurePolicy::LogOnly => tracing::error!(
                error = %failure.error,
                consecutive_failures = failure.consecutive_failures,
                "failed to re-register with primary"
            ),
            FailurePolicy::Terminate => {
                if self.closing.is_cancelled()
                    || failure.consecutive_failures < self.max_failure_count
                {
                    return;
                }
                let err = NodeError::RegistrationLost {
                    consecutive_failures: failure.consecutive_failures,
                    error: failure.error.clone(),
                };
                let raised = self.fatal.send_if_modified(|slot| {
                    if slot.is_some() {
                        return false;
                    }
                    *slot = Some(err);
                    true
                });
                if raised {
                    tracing::error!(
                        error = %failure.error,
                        consecutive_failures = failure.consecutive_failures,
                        "failed to periodically re-register with primary, node is no longer usable"
                    );
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Node
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct NodeInner {
    replica_id: Uuid,
    build: BuildInfo,
    primary: Arc<dyn PrimaryApi>,
    relay_enabled: bool,
    state: RwLock<NodeState>,
    cancel: CancellationToken,
    registration: Mutex<Option<RegisterLoopHandle>>,
    close_grace: Duration,
    close_outcome: OnceCell<Result<(), ShutdownError>>,
    fatal: Arc<watch::Sender<Option<NodeError>>>,
    mesh: Arc<MeshCoordinator>,
    relay: Arc<RelayHub>,
    apps: Arc<AppServer>,
    dialer: Arc<AgentDialer>,
    health: HealthReporter,
}

/// A running proxy replica.  Cheap to clone; all clones share one node.
#[derive(Clone)]
pub struct ProxyNode {
    inner: Arc<NodeInner>,
}

impl ProxyNode {
    /// Bring the node up.
    ///
    /// Fails without leaving anything running when the primary is
    /// unreachable, is itself a proxy, or rejects the first registration.
    pub async fn start(
        opts: NodeOptions,
        primary: Arc<dyn PrimaryApi>,
        raw_dial: Arc<dyn DialAgent>,
    ) -> Result<Self, NodeError> {
        let replica_id = Uuid::new_v4();
        tracing::debug!(replica_id = %replica_id, state = ?NodeState::Created, "starting proxy node");

        let result = match Self::build(replica_id, opts, primary).await {
            Ok(parts) => Self::register(parts, raw_dial).await,
            Err(e) => Err(e),
        };
        result.inspect_err(|e| {
            tracing::error!(replica_id = %replica_id, state = ?NodeState::Failed, error = %e, "proxy node failed to start");
        })
    }

    async fn build(
        replica_id: Uuid,
        opts: NodeOptions,
        primary: Arc<dyn PrimaryApi>,
    ) -> Result<StartParts, NodeError> {
        let hostname = if opts.app_hostname.is_empty() {
            None
        } else {
            Some(
                compile_hostname_pattern(&opts.app_hostname)
                    .map_err(|e| NodeError::Config(e.to_string()))?,
            )
        };

        let primary_build = primary.build_info().await.map_err(NodeError::Preflight)?;
        if primary_build.workspace_proxy {
            return Err(NodeError::PrimaryIsProxy(primary.primary_url().to_string()));
        }
        if !opts.build.is_dev() && !versions_match(&primary_build.version, &opts.build.version) {
            tracing::warn!(
                primary_version = %primary_build.version,
                proxy_version = %opts.build.version,
                "primary and proxy versions differ"
            );
        }

        Ok(StartParts {
            replica_id,
            opts,
            primary,
            hostname,
        })
    }

    async fn register(parts: StartParts, raw_dial: Arc<dyn DialAgent>) -> Result<Self, NodeError> {
        let StartParts {
            replica_id,
            opts,
            primary,
            hostname,
        } = parts;
        let cancel = CancellationToken::new();
        let close_grace = opts.registration.close_grace();

        let relay = Arc::new(RelayHub::new());
        let mesh = Arc::new(MeshCoordinator::new(relay.clone(), &opts.relay_address));
        let (fatal, _) = watch::channel(None);
        let fatal = Arc::new(fatal);

        // Filled once the components built from the first response exist.
        let ready: Arc<OnceLock<RegistrationApplier>> = Arc::new(OnceLock::new());
        let failures = FailureHandler {
            policy: opts.registration.failure_policy,
            max_failure_count: opts.registration.max_failure_count,
            closing: cancel.clone(),
            fatal: fatal.clone(),
        };
        let mesh_for_mutate = mesh.clone();
        let background = ready.clone();
        let hooks = RegisterHooks::new()
            .mutate(move |req: &mut RegisterProxyRequest| {
                // TODO: probe sibling relays directly instead of reporting
                // only the last mesh update failure.
                req.replica_error = mesh_for_mutate.last_error().unwrap_or_default();
            })
            .on_success(move |resp| match background.get() {
                Some(applier) => applier.apply(resp).map_err(SdkError::Hook),
                None => {
                    tracing::debug!("node still starting, registration applied later");
                    Ok(())
                }
            })
            .on_failure(move |failure| failures.handle(failure));

        let request = RegisterProxyRequest {
            access_url: opts.access_url.clone(),
            wildcard_hostname: opts.app_hostname.clone(),
            derp_enabled: opts.relay_enabled,
            replica_id,
            replica_hostname: opts.replica_hostname.clone(),
            replica_error: String::new(),
            replica_relay_address: opts.relay_address.clone(),
            version: opts.build.version.clone(),
        };
        let loop_opts = RegisterLoopOptions {
            interval: opts.registration.interval(),
            attempt_timeout: opts.registration.attempt_timeout(),
        };

        tracing::debug!(replica_id = %replica_id, state = ?NodeState::Registering, "registering with primary");
        let (first, handle) =
            match RegisterLoop::start(primary.clone(), request, loop_opts, hooks, cancel.clone())
                .await
            {
                Ok(pair) => pair,
                Err(e) => {
                    cancel.cancel();
                    let _ = relay.close().await;
                    return Err(NodeError::Registration(e));
                }
            };

        let dialer = match build_dialer(&opts.dialer, &primary, raw_dial, &first, &cancel).await {
            Ok(dialer) => Arc::new(dialer),
            Err(e) => {
                abandon(&cancel, &handle, close_grace, &relay, None).await;
                return Err(e);
            }
        };
        let apps = Arc::new(AppServer::new(dialer.clone(), hostname));
        let applier = RegistrationApplier {
            mesh: mesh.clone(),
            apps: apps.clone(),
            dialer: dialer.clone(),
            relay_enabled: opts.relay_enabled,
        };
        if let Err(e) = applier.apply(&first) {
            abandon(&cancel, &handle, close_grace, &relay, Some(dialer.as_ref())).await;
            return Err(NodeError::ApplyRegistration(e));
        }
        let _ = ready.set(applier);

        let health = HealthReporter::new(primary.clone(), opts.build.clone(), cancel.clone());
        let node = Self {
            inner: Arc::new(NodeInner {
                replica_id,
                build: opts.build,
                primary,
                relay_enabled: opts.relay_enabled,
                state: RwLock::new(NodeState::Serving),
                cancel,
                registration: Mutex::new(Some(handle)),
                close_grace,
                close_outcome: OnceCell::new(),
                fatal,
                mesh,
                relay,
                apps,
                dialer,
                health,
            }),
        };

        tracing::info!(
            replica_id = %replica_id,
            access_url = %opts.access_url,
            strategy = ?node.inner.dialer.strategy(),
            region_id = first.derp_region_id,
            siblings = first.sibling_replicas.len(),
            state = ?NodeState::Serving,
            "proxy node serving"
        );
        Ok(node)
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn replica_id(&self) -> Uuid {
        self.inner.replica_id
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state.read()
    }

    pub fn build_info(&self) -> &BuildInfo {
        &self.inner.build
    }

    /// The primary's URL, which is also where users find the dashboard.
    pub fn dashboard_url(&self) -> &Url {
        self.inner.primary.primary_url()
    }

    pub fn relay_enabled(&self) -> bool {
        self.inner.relay_enabled
    }

    pub fn relay(&self) -> &Arc<RelayHub> {
        &self.inner.relay
    }

    pub fn mesh(&self) -> &MeshCoordinator {
        &self.inner.mesh
    }

    pub fn apps(&self) -> &AppServer {
        &self.inner.apps
    }

    pub fn dialer(&self) -> &AgentDialer {
        &self.inner.dialer
    }

    pub fn health(&self) -> &HealthReporter {
        &self.inner.health
    }

    /// Whether close has begun.
    pub fn is_closing(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves when the failure policy declares the node unusable.  The
    /// owner is expected to close the node and exit.
    pub async fn fatal(&self) -> NodeError {
        let mut rx = self.inner.fatal.subscribe();
        loop {
            if let Some(err) = rx.borrow_and_update().clone() {
                return err;
            }
            if rx.changed().await.is_err() {
                // The sender lives as long as the node.
                std::future::pending::<()>().await;
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Close the node.
    ///
    /// Idempotent: every caller, concurrent or later, gets the outcome of
    /// the single close that ran.
    pub async fn close(&self) -> Result<(), ShutdownError> {
        self.inner
            .close_outcome
            .get_or_init(|| self.run_close())
            .await
            .clone()
    }

    async fn run_close(&self) -> Result<(), ShutdownError> {
        let inner = &self.inner;
        *inner.state.write() = NodeState::Closing;
        tracing::info!(
            replica_id = %inner.replica_id,
            mesh_peers = inner.mesh.addresses().len(),
            relay = ?inner.relay.stats(),
            agent_sessions = inner.dialer.active_sessions(),
            "closing proxy node"
        );
        let mut report = ShutdownReport::default();

        inner.cancel.cancel();
        let handle = inner.registration.lock().take();
        if let Some(handle) = handle {
            if !handle.wait_timeout(inner.close_grace).await {
                handle.abort();
                report.record(
                    ShutdownStep::RegistrationLoop,
                    Err(format!(
                        "timed out after {}s waiting for registration loop to finish",
                        inner.close_grace.as_secs_f64()
                    )),
                );
            }
        }

        report.record(ShutdownStep::Relay, inner.relay.close().await);
        report.record(ShutdownStep::AppServer, inner.apps.close());
        report.record(ShutdownStep::AgentDialer, inner.dialer.close().await);
        inner.primary.release_idle_connections();

        *inner.state.write() = NodeState::Closed;
        let outcome = report.finish();
        match &outcome {
            Ok(()) => tracing::info!(replica_id = %inner.replica_id, "proxy node closed"),
            Err(e) => tracing::warn!(replica_id = %inner.replica_id, error = %e, "proxy node closed with errors"),
        }
        outcome
    }
}

/// Build the agent dialer for the configured strategy.  The shared-session
/// strategy is homed on the first registration's relay map and falls back
/// to the primary's agent connection info when that map is empty.
async fn build_dialer(
    cfg: &DialerConfig,
    primary: &Arc<dyn PrimaryApi>,
    raw_dial: Arc<dyn DialAgent>,
    first: &RegisterProxyResponse,
    cancel: &CancellationToken,
) -> Result<AgentDialer, NodeError> {
    match cfg.strategy {
        DialerStrategy::SharedSession => {
            let (relay_map, preferred) = if first.derp_map.is_empty() {
                tracing::warn!("registration returned an empty relay map, using agent connection info");
                let info = primary.agent_connection_info().await.map_err(|e| {
                    NodeError::Dialer(DialError::Other(format!(
                        "fetch agent connection info: {e}"
                    )))
                })?;
                (info.derp_map, None)
            } else {
                (first.derp_map.clone(), Some(first.derp_region_id))
            };
            SharedSessionDialer::new(raw_dial, relay_map, preferred)
                .map(AgentDialer::SharedSession)
                .map_err(NodeError::Dialer)
        }
        DialerStrategy::Cache => Ok(AgentDialer::Cache(CacheDialer::new(
            raw_dial,
            cfg.cache_max_entries,
            cfg.cache_idle_ttl(),
            cancel,
        ))),
    }
}

/// Undo a partially started node after the first registration succeeded.
async fn abandon(
    cancel: &CancellationToken,
    handle: &RegisterLoopHandle,
    grace: Duration,
    relay: &RelayHub,
    dialer: Option<&AgentDialer>,
) {
    cancel.cancel();
    if !handle.wait_timeout(grace).await {
        handle.abort();
    }
    let _ = relay.close().await;
    if let Some(dialer) = dialer {
        let _ = dialer.close().await;
    }
}

struct StartParts {
    replica_id: Uuid,
    opts: NodeOptions,
    primary: Arc<dyn PrimaryApi>,
    hostname: Option<regex::Regex>,
}
