//! The hub: tracks authenticated control connections, their data sockets,
//! per-client runtimes and grouped sessions, routes control messages, and
//! owns graceful shutdown.
//!
//! Each control context is an independent unit of concurrency: its messages
//! are handled sequentially in arrival order, and nothing here serializes
//! one client's mutations against another's. No lock is held across a
//! gateway call, a socket send or a PTY spawn.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mobile_core::auth::{generate_client_id, AuthService, Credentials};
use mobile_core::gateway::MultiplexerGateway;
use mobile_core::monitor::{StateEmitter, StateMonitor};
use mobile_core::pty::PtyFactory;
use mobile_core::runtime::TerminalRuntime;
use mobile_core::{
    AuthError, GatewayError, PtyError, RuntimeConfig, SessionSummary, StateSnapshot,
    MOBILE_SESSION_PREFIX,
};

use crate::protocol::{ClientMessage, ServerMessage};

/// Close code sent to a control socket evicted by a reconnect.
pub const CLOSE_RECONNECTED: u16 = 4000;
/// Close code for data sockets that fail or skip authentication.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

/// Outbound frame for a control socket's send task.
#[derive(Debug)]
pub enum ControlFrame {
    Message(ServerMessage),
    Close { code: u16, reason: &'static str },
}

/// Outbound frame for a data socket's send task.
#[derive(Debug)]
pub enum DataFrame {
    Output(Bytes),
    Close { code: u16, reason: &'static str },
}

/// Per-client view state that survives a control-socket close (but not a
/// process restart), keyed by client id.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    pub base_session: Option<String>,
    pub pane_id: Option<String>,
    pub zoomed: Option<bool>,
    pub updated_at: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("no attached session")]
    NoAttachedSession,
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Pty(#[from] PtyError),
}

/// State owned by one authenticated control socket.
#[derive(Default)]
struct ClientSession {
    runtime: Option<Arc<TerminalRuntime>>,
    /// The mobile (grouped) session the runtime is attached to.
    attached_session: Option<String>,
    base_session: Option<String>,
    data_sockets: HashMap<u64, mpsc::Sender<DataFrame>>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

/// One authenticated control connection. The runtime and its output
/// broadcast belong to this context alone; data sockets bound here never
/// see another client's bytes.
pub struct ControlContext {
    pub client_id: String,
    outbound: mpsc::Sender<ControlFrame>,
    output_tx: broadcast::Sender<Bytes>,
    session: tokio::sync::Mutex<ClientSession>,
}

impl std::fmt::Debug for ControlContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlContext")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl ControlContext {
    async fn send(&self, message: ServerMessage) {
        let _ = self.outbound.send(ControlFrame::Message(message)).await;
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<Bytes> {
        self.output_tx.subscribe()
    }

    /// Forward raw input to this client's PTY; dropped when detached.
    pub async fn write_input(&self, bytes: &[u8]) {
        let runtime = self.session.lock().await.runtime.clone();
        if let Some(runtime) = runtime {
            if let Err(e) = runtime.write(bytes) {
                debug!(client_id = %self.client_id, error = %e, "pty write failed");
            }
        }
    }

    pub async fn resize(&self, cols: f64, rows: f64) {
        let runtime = self.session.lock().await.runtime.clone();
        if let Some(runtime) = runtime {
            runtime.resize(cols, rows);
        }
    }
}

/// Monitor emitter that fans snapshots out to all subscribed control
/// sockets through a broadcast channel.
struct BroadcastEmitter {
    state_tx: broadcast::Sender<StateSnapshot>,
}

impl StateEmitter for BroadcastEmitter {
    fn emit_state(&self, snapshot: StateSnapshot) {
        let _ = self.state_tx.send(snapshot);
    }

    fn emit_error(&self, error: String) {
        warn!(error = %error, "state poll failed");
    }
}

pub struct Broker {
    gateway: Arc<dyn MultiplexerGateway>,
    pty_factory: Arc<dyn PtyFactory>,
    auth: AuthService,
    config: RuntimeConfig,
    monitor: StateMonitor,
    state_tx: broadcast::Sender<StateSnapshot>,
    contexts: Mutex<HashMap<String, Arc<ControlContext>>>,
    reconnect: Mutex<HashMap<String, ReconnectState>>,
    next_socket_id: AtomicU64,
    stop_once: OnceCell<()>,
}

impl Broker {
    pub fn new(
        gateway: Arc<dyn MultiplexerGateway>,
        pty_factory: Arc<dyn PtyFactory>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = broadcast::channel(32);
        let auth = AuthService::new(config.token.clone(), config.password.clone());
        let monitor = StateMonitor::new(
            gateway.clone(),
            Arc::new(BroadcastEmitter {
                state_tx: state_tx.clone(),
            }),
            Duration::from_millis(config.poll_interval_ms),
        );
        Arc::new(Self {
            gateway,
            pty_factory,
            auth,
            config,
            monitor,
            state_tx,
            contexts: Mutex::new(HashMap::new()),
            reconnect: Mutex::new(HashMap::new()),
            next_socket_id: AtomicU64::new(1),
            stop_once: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Start background polling. Call once after construction.
    pub fn start(&self) {
        self.monitor.start();
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateSnapshot> {
        self.state_tx.subscribe()
    }

    // ============================================
    // Control plane
    // ============================================

    /// Verify credentials and register a control context. Adopts the
    /// client-supplied id (evicting a previous holder) or mints a fresh
    /// one. Sends `auth_ok` before returning.
    pub async fn authenticate_control(
        self: &Arc<Self>,
        credentials: &Credentials,
        requested_id: Option<&str>,
        outbound: mpsc::Sender<ControlFrame>,
    ) -> Result<Arc<ControlContext>, AuthError> {
        self.auth.verify(credentials)?;

        let client_id = requested_id
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.len() <= 128)
            .map(String::from)
            .unwrap_or_else(generate_client_id);

        let (output_tx, _) = broadcast::channel(256);
        let context = Arc::new(ControlContext {
            client_id: client_id.clone(),
            outbound,
            output_tx,
            session: tokio::sync::Mutex::new(ClientSession::default()),
        });

        // Seed the base session from reconnect memory so the initial
        // attach can go straight back to where the client was.
        let remembered_base = {
            let map = self.reconnect.lock().expect("reconnect mutex");
            map.get(&client_id).and_then(|r| r.base_session.clone())
        };
        if remembered_base.is_some() {
            context.session.lock().await.base_session = remembered_base;
        }

        let evicted = {
            let mut contexts = self.contexts.lock().expect("contexts mutex");
            contexts.insert(client_id.clone(), context.clone())
        };
        if let Some(old) = evicted {
            info!(client_id = %client_id, "evicting previous control connection");
            let _ = old
                .outbound
                .send(ControlFrame::Close {
                    code: CLOSE_RECONNECTED,
                    reason: "reconnected",
                })
                .await;
            self.shutdown_control(&old).await;
        }

        info!(client_id = %client_id, "control connection authenticated");
        context
            .send(ServerMessage::AuthOk {
                client_id: client_id.clone(),
                requires_password: self.auth.requires_password(),
            })
            .await;
        Ok(context)
    }

    /// Initial attach after authentication. Failure leaves the context
    /// authenticated but detached; the client sees an `error` message.
    pub async fn run_initial_attach(self: &Arc<Self>, context: &Arc<ControlContext>) {
        if let Err(e) = self.ensure_attached_session(context, None).await {
            warn!(client_id = %context.client_id, error = %e, "initial attach failed");
            context
                .send(ServerMessage::Error {
                    message: e.to_string(),
                })
                .await;
        }
        self.publish_state().await;
    }

    /// Attach policy: forced target > remembered base > the only existing
    /// base > a freshly created default; multiple candidates go to the
    /// session picker instead.
    pub async fn ensure_attached_session(
        self: &Arc<Self>,
        context: &Arc<ControlContext>,
        force_session: Option<&str>,
    ) -> Result<(), BrokerError> {
        if let Some(base) = force_session {
            return self.attach_control_to_base_session(context, base).await;
        }

        let sessions = self.gateway.list_sessions().await?;
        let bases: Vec<SessionSummary> = sessions
            .into_iter()
            .filter(|s| !s.name.starts_with(MOBILE_SESSION_PREFIX))
            .collect();

        let remembered = context.session.lock().await.base_session.clone();
        if let Some(base) = remembered {
            if bases.iter().any(|s| s.name == base) {
                return self.attach_control_to_base_session(context, &base).await;
            }
        }

        match bases.len() {
            0 => {
                let name = self.config.default_session.clone();
                self.gateway.create_session(&name).await?;
                self.attach_control_to_base_session(context, &name).await
            }
            1 => {
                self.attach_control_to_base_session(context, &bases[0].name)
                    .await
            }
            _ => {
                context
                    .send(ServerMessage::SessionPicker { sessions: bases })
                    .await;
                Ok(())
            }
        }
    }

    /// Group this client's mobile session against `base` and attach the
    /// runtime to it. Emits `attached` once the PTY is up and sized.
    pub async fn attach_control_to_base_session(
        self: &Arc<Self>,
        context: &Arc<ControlContext>,
        base: &str,
    ) -> Result<(), BrokerError> {
        let mobile = format!("{}{}", MOBILE_SESSION_PREFIX, context.client_id);

        let sessions = self.gateway.list_sessions().await?;
        let mut mobile_exists = sessions.iter().any(|s| s.name == mobile);
        let previous_base = context.session.lock().await.base_session.clone();
        if mobile_exists && previous_base.as_deref() != Some(base) {
            // Regrouping: the old mobile session dies with its PTY client,
            // so tear the runtime down first to avoid a spurious exit.
            if let Some(runtime) = context.session.lock().await.runtime.clone() {
                runtime.shutdown().await;
            }
            self.gateway.kill_session(&mobile).await?;
            mobile_exists = false;
        }
        if !mobile_exists {
            self.gateway.create_grouped_session(&mobile, base).await?;
        }

        {
            let mut session = context.session.lock().await;
            session.base_session = Some(base.to_string());
            session.attached_session = Some(mobile.clone());
        }
        self.remember(&context.client_id, |r| {
            r.base_session = Some(base.to_string());
        });

        let runtime = self.ensure_runtime(context).await;
        runtime.attach(&mobile).await?;

        // Optional fast path for an interactive multiplexer client; fails
        // with "no current client" when none is present.
        if let Err(e) = self.gateway.switch_client(&mobile).await {
            debug!(session = %mobile, error = %e, "switch-client skipped");
        }

        self.restore_view(context).await;

        info!(client_id = %context.client_id, base = %base, session = %mobile, "attached");
        context.send(ServerMessage::Attached { session: mobile }).await;
        Ok(())
    }

    /// Best-effort restore of the remembered pane selection and zoom
    /// state. A vanished pane fails silently; nothing reaches the client.
    async fn restore_view(&self, context: &Arc<ControlContext>) {
        let remembered = {
            let map = self.reconnect.lock().expect("reconnect mutex");
            map.get(&context.client_id).cloned()
        };
        let Some(state) = remembered else { return };
        let Some(pane_id) = state.pane_id else { return };

        if let Err(e) = self.gateway.select_pane(&pane_id).await {
            debug!(client_id = %context.client_id, pane = %pane_id, error = %e, "pane restore skipped");
            return;
        }
        if let Some(wanted) = state.zoomed {
            match self.gateway.is_pane_zoomed(&pane_id).await {
                Ok(current) if current != wanted => {
                    if let Err(e) = self.gateway.zoom_pane(&pane_id).await {
                        debug!(pane = %pane_id, error = %e, "zoom restore skipped");
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(pane = %pane_id, error = %e, "zoom probe skipped"),
            }
        }
    }

    /// Handle one authenticated control message. A repeated `auth` is
    /// ignored; every other variant triggers a force-publish regardless of
    /// whether the mutation succeeded.
    pub async fn handle_control_message(
        self: &Arc<Self>,
        context: &Arc<ControlContext>,
        message: ClientMessage,
    ) {
        if matches!(message, ClientMessage::Auth { .. }) {
            return;
        }
        // An evicted context may still receive messages until its socket
        // closes; they must not mutate anything.
        if context.session.lock().await.closed {
            return;
        }
        if let Err(e) = self.run_mutation(context, message).await {
            context
                .send(ServerMessage::Error {
                    message: e.to_string(),
                })
                .await;
        }
        self.publish_state().await;
    }

    async fn run_mutation(
        self: &Arc<Self>,
        context: &Arc<ControlContext>,
        message: ClientMessage,
    ) -> Result<(), BrokerError> {
        match message {
            ClientMessage::Auth { .. } => Ok(()),
            ClientMessage::SelectSession { session } => {
                self.attach_control_to_base_session(context, &session).await
            }
            ClientMessage::NewSession { name } => {
                self.gateway.create_session(&name).await?;
                self.attach_control_to_base_session(context, &name).await
            }
            ClientMessage::NewWindow { session: _ } => {
                // The context's attached session wins over the supplied
                // name so one client cannot grow another client's session.
                let attached = self.require_attached(context).await?;
                self.gateway.new_window(&attached).await?;
                Ok(())
            }
            ClientMessage::SelectWindow { window_index } => {
                let attached = self.require_attached(context).await?;
                self.gateway.select_window(&attached, window_index).await?;
                Ok(())
            }
            ClientMessage::KillWindow { window_index } => {
                let attached = self.require_attached(context).await?;
                self.gateway.kill_window(&attached, window_index).await?;
                Ok(())
            }
            ClientMessage::SelectPane { pane_id } => {
                self.gateway.select_pane(&pane_id).await?;
                self.remember(&context.client_id, |r| {
                    r.pane_id = Some(pane_id.clone());
                });
                Ok(())
            }
            ClientMessage::SplitPane {
                pane_id,
                orientation,
            } => {
                self.gateway.split_window(&pane_id, orientation).await?;
                Ok(())
            }
            ClientMessage::KillPane { pane_id } => {
                self.gateway.kill_pane(&pane_id).await?;
                Ok(())
            }
            ClientMessage::ZoomPane { pane_id } => {
                self.gateway.zoom_pane(&pane_id).await?;
                self.remember(&context.client_id, |r| {
                    r.zoomed = Some(!r.zoomed.unwrap_or(false));
                });
                Ok(())
            }
            ClientMessage::CaptureScrollback { pane_id, lines } => {
                let lines = lines.unwrap_or(self.config.scrollback_lines);
                let text = self.gateway.capture_pane(&pane_id, lines).await?;
                context
                    .send(ServerMessage::Scrollback {
                        pane_id,
                        text,
                        lines,
                    })
                    .await;
                Ok(())
            }
            ClientMessage::SendCompose { text } => {
                let runtime = context
                    .session
                    .lock()
                    .await
                    .runtime
                    .clone()
                    .ok_or(BrokerError::NoAttachedSession)?;
                runtime.write(format!("{}\r", text).as_bytes())?;
                Ok(())
            }
        }
    }

    async fn require_attached(&self, context: &Arc<ControlContext>) -> Result<String, BrokerError> {
        context
            .session
            .lock()
            .await
            .attached_session
            .clone()
            .ok_or(BrokerError::NoAttachedSession)
    }

    async fn publish_state(&self) {
        if let Err(e) = self.monitor.force_publish().await {
            warn!(error = %e, "force publish failed");
        }
    }

    /// Create the context's runtime on first use and wire its exit events
    /// to the control socket.
    async fn ensure_runtime(
        self: &Arc<Self>,
        context: &Arc<ControlContext>,
    ) -> Arc<TerminalRuntime> {
        let mut session = context.session.lock().await;
        if let Some(runtime) = &session.runtime {
            return runtime.clone();
        }
        let runtime = Arc::new(TerminalRuntime::new(
            self.pty_factory.clone(),
            context.output_tx.clone(),
        ));
        let mut exit_rx = runtime.subscribe_exit();
        let outbound = context.outbound.clone();
        let watcher = tokio::spawn(async move {
            while exit_rx.recv().await.is_ok() {
                let _ = outbound
                    .send(ControlFrame::Message(ServerMessage::Info {
                        message: "tmux client exited".into(),
                    }))
                    .await;
            }
        });
        session.tasks.push(watcher);
        session.runtime = Some(runtime.clone());
        runtime
    }

    fn remember(&self, client_id: &str, update: impl FnOnce(&mut ReconnectState)) {
        let mut map = self.reconnect.lock().expect("reconnect mutex");
        let entry = map.entry(client_id.to_string()).or_default();
        update(entry);
        entry.updated_at = Utc::now().to_rfc3339();
    }

    // ============================================
    // Data plane
    // ============================================

    /// Authenticate a data socket and bind it to its control context.
    /// Returns `None` for bad credentials, a missing client id, or an id
    /// without a live authenticated context.
    pub async fn bind_data_socket(
        &self,
        credentials: &Credentials,
        client_id: Option<&str>,
        sender: mpsc::Sender<DataFrame>,
    ) -> Option<(Arc<ControlContext>, u64)> {
        if self.auth.verify(credentials).is_err() {
            return None;
        }
        let client_id = client_id?;
        let context = {
            let contexts = self.contexts.lock().expect("contexts mutex");
            contexts.get(client_id).cloned()
        }?;

        let socket_id = self.next_socket_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut session = context.session.lock().await;
            if session.closed {
                return None;
            }
            session.data_sockets.insert(socket_id, sender);
        }
        debug!(client_id = %client_id, socket_id, "data socket bound");
        Some((context, socket_id))
    }

    pub async fn unbind_data_socket(&self, context: &Arc<ControlContext>, socket_id: u64) {
        context.session.lock().await.data_sockets.remove(&socket_id);
    }

    // ============================================
    // Lifecycle
    // ============================================

    /// Tear down a control context: close its data sockets, shut down the
    /// runtime, kill the mobile session, stamp reconnect memory. Safe to
    /// call more than once.
    pub async fn shutdown_control(&self, context: &Arc<ControlContext>) {
        let (runtime, attached, data_sockets, tasks) = {
            let mut session = context.session.lock().await;
            if session.closed {
                return;
            }
            session.closed = true;
            (
                session.runtime.take(),
                session.attached_session.take(),
                std::mem::take(&mut session.data_sockets),
                std::mem::take(&mut session.tasks),
            )
        };

        for sender in data_sockets.into_values() {
            let _ = sender
                .send(DataFrame::Close {
                    code: 1000,
                    reason: "control connection closed",
                })
                .await;
        }
        for task in tasks {
            task.abort();
        }
        if let Some(runtime) = runtime {
            runtime.shutdown().await;
        }
        if let Some(mobile) = attached {
            // A failed kill must not stall the rest of the teardown.
            if let Err(e) = self.gateway.kill_session(&mobile).await {
                warn!(session = %mobile, error = %e, "failed to kill mobile session");
            }
        }
        self.remember(&context.client_id, |_| {});

        let mut contexts = self.contexts.lock().expect("contexts mutex");
        if let Some(current) = contexts.get(&context.client_id) {
            if Arc::ptr_eq(current, context) {
                contexts.remove(&context.client_id);
            }
        }
        drop(contexts);
        info!(client_id = %context.client_id, "control context closed");
    }

    /// Stop everything: the monitor first, then every context concurrently.
    /// Idempotent and single-flight; a second caller awaits the first run.
    pub async fn stop(&self) {
        self.stop_once
            .get_or_init(|| async {
                info!("stopping broker");
                self.monitor.stop();
                let contexts: Vec<Arc<ControlContext>> = {
                    let map = self.contexts.lock().expect("contexts mutex");
                    map.values().cloned().collect()
                };
                futures_util::future::join_all(contexts.iter().map(|context| async {
                    let _ = context
                        .outbound
                        .send(ControlFrame::Close {
                            code: 1001,
                            reason: "server shutting down",
                        })
                        .await;
                    self.shutdown_control(context).await;
                }))
                .await;
            })
            .await;
    }
}
