//! State monitor: polls the gateway, diffs snapshots by fingerprint and
//! publishes changes through a [`StateEmitter`].
//!
//! Force-publish uses a monotone generation counter rather than future
//! cancellation: in-flight multiplexer I/O cannot be cancelled cleanly, so
//! a stale result is simply dropped when the generation has advanced since
//! its build started.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::errors::GatewayError;
use crate::gateway::MultiplexerGateway;
use crate::{SessionState, StateSnapshot, WindowState};

/// Adapter for delivering monitor output; the broker implements this to
/// broadcast to control sockets.
pub trait StateEmitter: Send + Sync {
    fn emit_state(&self, snapshot: StateSnapshot);
    fn emit_error(&self, error: String);
}

/// Default polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2500);

struct MonitorInner {
    gateway: Arc<dyn MultiplexerGateway>,
    emitter: Arc<dyn StateEmitter>,
    poll_interval: Duration,
    /// Fingerprint of the last snapshot delivered to the emitter.
    fingerprint: Mutex<Option<String>>,
    /// Bumped at the start of every force-publish and on stop; snapshots
    /// built under an older generation are discarded.
    generation: AtomicU64,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

pub struct StateMonitor {
    inner: Arc<MonitorInner>,
}

impl StateMonitor {
    pub fn new(
        gateway: Arc<dyn MultiplexerGateway>,
        emitter: Arc<dyn StateEmitter>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                gateway,
                emitter,
                poll_interval,
                fingerprint: Mutex::new(None),
                generation: AtomicU64::new(0),
                tick_task: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Start the polling loop. Idempotent while a loop is running.
    pub fn start(&self) {
        let mut guard = self.inner.tick_task.lock().expect("tick task mutex");
        if guard.is_some() || self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        *guard = Some(tokio::spawn(tick_loop(self.inner.clone())));
    }

    /// Build and publish a snapshot now, bypassing change suppression.
    ///
    /// The current tick is cancelled first; the poll loop is rescheduled
    /// only by the newest force call. Errors propagate to the caller
    /// instead of going through the emitter.
    pub async fn force_publish(&self) -> Result<(), GatewayError> {
        let inner = &self.inner;
        let my_generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(handle) = inner.tick_task.lock().expect("tick task mutex").take() {
            handle.abort();
        }

        let result = build_snapshot(inner.gateway.as_ref()).await;
        let newest = inner.generation.load(Ordering::SeqCst) == my_generation
            && !inner.stopped.load(Ordering::SeqCst);

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if newest {
                    self.reschedule(my_generation);
                }
                return Err(e);
            }
        };

        if newest {
            *inner.fingerprint.lock().expect("fingerprint mutex") = Some(snapshot.fingerprint());
            inner.emitter.emit_state(snapshot);
            self.reschedule(my_generation);
        }
        Ok(())
    }

    /// Stop polling; in-flight work is discarded and nothing is emitted
    /// afterwards. Idempotent.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.inner.tick_task.lock().expect("tick task mutex").take() {
            handle.abort();
        }
    }

    fn reschedule(&self, my_generation: u64) {
        let inner = &self.inner;
        let mut guard = inner.tick_task.lock().expect("tick task mutex");
        if guard.is_none()
            && inner.generation.load(Ordering::SeqCst) == my_generation
            && !inner.stopped.load(Ordering::SeqCst)
        {
            *guard = Some(tokio::spawn(tick_loop(inner.clone())));
        }
    }
}

/// Sequential poll loop: the next tick is scheduled only after the previous
/// snapshot resolved, so ticks never overlap.
async fn tick_loop(inner: Arc<MonitorInner>) {
    loop {
        tokio::time::sleep(inner.poll_interval).await;
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let generation = inner.generation.load(Ordering::SeqCst);
        let result = build_snapshot(inner.gateway.as_ref()).await;
        if inner.generation.load(Ordering::SeqCst) != generation
            || inner.stopped.load(Ordering::SeqCst)
        {
            // A force-publish supersedes this tick; it also respawned or
            // will respawn the loop, so this one ends here.
            return;
        }
        match result {
            Ok(snapshot) => {
                let fingerprint = snapshot.fingerprint();
                let changed = {
                    let mut guard = inner.fingerprint.lock().expect("fingerprint mutex");
                    if guard.as_deref() != Some(fingerprint.as_str()) {
                        *guard = Some(fingerprint);
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    inner.emitter.emit_state(snapshot);
                }
            }
            Err(e) => inner.emitter.emit_error(e.to_string()),
        }
    }
}

/// Assemble the full state tree: sessions, their windows, their panes.
/// A window counts as zoomed when its active pane carries the zoom flag.
pub async fn build_snapshot(
    gateway: &dyn MultiplexerGateway,
) -> Result<StateSnapshot, GatewayError> {
    let summaries = gateway.list_sessions().await?;
    let mut sessions = Vec::with_capacity(summaries.len());
    for summary in summaries {
        let windows = gateway.list_windows(&summary.name).await?;
        let mut window_states = Vec::with_capacity(windows.len());
        for window in windows {
            let panes = gateway.list_panes(&summary.name, window.index).await?;
            let zoomed = panes.iter().any(|p| p.zoomed);
            window_states.push(WindowState {
                index: window.index,
                name: window.name,
                active: window.active,
                zoomed,
                pane_count: window.pane_count,
                panes,
            });
        }
        sessions.push(SessionState {
            name: summary.name,
            attached: summary.attached,
            windows: window_states,
        });
    }
    Ok(StateSnapshot {
        sessions,
        captured_at: Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    use crate::gateway::SplitOrientation;
    use crate::{PaneState, SessionSummary, WindowRecord};

    #[derive(Default)]
    struct TestEmitter {
        states: Mutex<Vec<StateSnapshot>>,
        errors: Mutex<Vec<String>>,
    }

    impl StateEmitter for TestEmitter {
        fn emit_state(&self, snapshot: StateSnapshot) {
            self.states.lock().unwrap().push(snapshot);
        }

        fn emit_error(&self, error: String) {
            self.errors.lock().unwrap().push(error);
        }
    }

    impl TestEmitter {
        fn state_count(&self) -> usize {
            self.states.lock().unwrap().len()
        }

        fn session_names(&self, index: usize) -> Vec<String> {
            self.states.lock().unwrap()[index]
                .sessions
                .iter()
                .map(|s| s.name.clone())
                .collect()
        }
    }

    /// Gateway returning a scripted sequence of session lists. Each
    /// `list_sessions` call pops the next script entry (sticking with the
    /// last one when the script runs dry) and may block on a gate first.
    #[derive(Default)]
    struct ScriptedGateway {
        script: Mutex<VecDeque<Result<Vec<SessionSummary>, GatewayError>>>,
        current: Mutex<Vec<SessionSummary>>,
        gates: Mutex<VecDeque<Option<oneshot::Receiver<()>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedGateway {
        fn push_sessions(&self, names: &[&str]) {
            self.script
                .lock()
                .unwrap()
                .push_back(Ok(names.iter().map(|n| summary(n)).collect()));
        }

        fn push_error(&self) {
            self.script
                .lock()
                .unwrap()
                .push_back(Err(GatewayError::CommandFailed("boom".into())));
        }

        fn push_gate(&self) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().unwrap().push_back(Some(rx));
            tx
        }

        fn push_open_gate(&self) {
            self.gates.lock().unwrap().push_back(None);
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn summary(name: &str) -> SessionSummary {
        SessionSummary {
            name: name.to_string(),
            attached: false,
            windows: 1,
        }
    }

    #[async_trait]
    impl MultiplexerGateway for ScriptedGateway {
        async fn list_sessions(&self) -> Result<Vec<SessionSummary>, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.gates.lock().unwrap().pop_front().flatten();
            if let Some(rx) = gate {
                let _ = rx.await;
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(sessions)) => {
                    *self.current.lock().unwrap() = sessions.clone();
                    Ok(sessions)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.current.lock().unwrap().clone()),
            }
        }

        async fn list_windows(&self, _session: &str) -> Result<Vec<WindowRecord>, GatewayError> {
            Ok(Vec::new())
        }

        async fn list_panes(
            &self,
            _session: &str,
            _window_index: u32,
        ) -> Result<Vec<PaneState>, GatewayError> {
            Ok(Vec::new())
        }

        async fn create_session(&self, _name: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn create_grouped_session(
            &self,
            _name: &str,
            _target: &str,
        ) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn kill_session(&self, _name: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn switch_client(&self, _session: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn new_window(&self, _session: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn kill_window(&self, _session: &str, _window_index: u32) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn select_window(
            &self,
            _session: &str,
            _window_index: u32,
        ) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn split_window(
            &self,
            _pane_id: &str,
            _orientation: SplitOrientation,
        ) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn kill_pane(&self, _pane_id: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn select_pane(&self, _pane_id: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn zoom_pane(&self, _pane_id: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn is_pane_zoomed(&self, _pane_id: &str) -> Result<bool, GatewayError> {
            Ok(false)
        }

        async fn capture_pane(&self, _pane_id: &str, _lines: u32) -> Result<String, GatewayError> {
            Ok(String::new())
        }
    }

    fn monitor_with(
        gateway: Arc<ScriptedGateway>,
        interval_ms: u64,
    ) -> (StateMonitor, Arc<TestEmitter>) {
        let emitter = Arc::new(TestEmitter::default());
        let monitor = StateMonitor::new(
            gateway,
            emitter.clone(),
            Duration::from_millis(interval_ms),
        );
        (monitor, emitter)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_equal_snapshots_are_suppressed() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.push_sessions(&["main"]);
        gateway.push_sessions(&["main"]);
        gateway.push_sessions(&["main", "dev"]);
        let (monitor, emitter) = monitor_with(gateway.clone(), 10);

        monitor.start();
        wait_for(|| emitter.state_count() >= 2).await;
        monitor.stop();

        assert_eq!(emitter.state_count(), 2);
        assert_eq!(emitter.session_names(0), vec!["main"]);
        assert_eq!(emitter.session_names(1), vec!["main", "dev"]);
    }

    #[tokio::test]
    async fn test_force_publish_bypasses_suppression() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.push_sessions(&["main"]);
        let (monitor, emitter) = monitor_with(gateway, 60_000);

        monitor.force_publish().await.unwrap();
        monitor.force_publish().await.unwrap();

        // Identical state, but both forces are delivered.
        assert_eq!(emitter.state_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_force_is_discarded() {
        let gateway = Arc::new(ScriptedGateway::default());
        // First force blocks inside the gateway until released; second
        // force runs through immediately and takes the first script entry.
        let release = gateway.push_gate();
        gateway.push_open_gate();
        gateway.push_sessions(&["fresh"]);
        gateway.push_sessions(&["stale"]);
        let (monitor, emitter) = monitor_with(gateway.clone(), 60_000);

        let monitor = Arc::new(monitor);
        let first = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.force_publish().await })
        };
        wait_for(|| gateway.call_count() >= 1).await;

        monitor.force_publish().await.unwrap();
        release.send(()).unwrap();
        first.await.unwrap().unwrap();

        // Only the newer force was delivered; the blocked one was dropped.
        assert_eq!(emitter.state_count(), 1);
        assert_eq!(emitter.session_names(0), vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_force_publish_supersedes_blocked_tick() {
        let gateway = Arc::new(ScriptedGateway::default());
        // The first tick blocks inside the gateway; the force takes the
        // open gate and sees the post-mutation state.
        let release = gateway.push_gate();
        gateway.push_open_gate();
        gateway.push_sessions(&["zoomed"]);
        let (monitor, emitter) = monitor_with(gateway.clone(), 10);

        monitor.start();
        wait_for(|| gateway.call_count() >= 1).await;

        monitor.force_publish().await.unwrap();
        let _ = release.send(());
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The stalled tick never delivered; the last state is the forced one.
        assert_eq!(emitter.state_count(), 1);
        assert_eq!(emitter.session_names(0), vec!["zoomed"]);
        monitor.stop();
    }

    #[tokio::test]
    async fn test_tick_errors_reach_emitter_and_polling_continues() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.push_error();
        gateway.push_sessions(&["main"]);
        let (monitor, emitter) = monitor_with(gateway, 10);

        monitor.start();
        wait_for(|| emitter.state_count() >= 1).await;
        monitor.stop();

        assert_eq!(emitter.errors.lock().unwrap().len(), 1);
        assert_eq!(emitter.session_names(0), vec!["main"]);
    }

    #[tokio::test]
    async fn test_force_publish_propagates_errors_to_caller() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.push_error();
        let (monitor, emitter) = monitor_with(gateway, 60_000);

        let result = monitor.force_publish().await;
        assert!(matches!(result, Err(GatewayError::CommandFailed(_))));
        assert_eq!(emitter.state_count(), 0);
        assert!(emitter.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_halts_delivery() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.push_sessions(&["main"]);
        let (monitor, emitter) = monitor_with(gateway.clone(), 10);

        monitor.start();
        wait_for(|| emitter.state_count() >= 1).await;
        monitor.stop();
        let seen = emitter.state_count();

        gateway.push_sessions(&["main", "dev"]);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(emitter.state_count(), seen);

        // Stopping again is harmless.
        monitor.stop();
    }

    #[tokio::test]
    async fn test_build_snapshot_derives_window_zoom_from_panes() {
        struct ZoomGateway;

        #[async_trait]
        impl MultiplexerGateway for ZoomGateway {
            async fn list_sessions(&self) -> Result<Vec<SessionSummary>, GatewayError> {
                Ok(vec![summary("work")])
            }

            async fn list_windows(
                &self,
                _session: &str,
            ) -> Result<Vec<WindowRecord>, GatewayError> {
                Ok(vec![WindowRecord {
                    index: 0,
                    name: "shell".into(),
                    active: true,
                    pane_count: 2,
                }])
            }

            async fn list_panes(
                &self,
                _session: &str,
                _window_index: u32,
            ) -> Result<Vec<PaneState>, GatewayError> {
                Ok(vec![
                    PaneState {
                        index: 0,
                        id: "%0".into(),
                        current_command: "bash".into(),
                        active: false,
                        width: 80,
                        height: 24,
                        zoomed: false,
                    },
                    PaneState {
                        index: 1,
                        id: "%1".into(),
                        current_command: "vim".into(),
                        active: true,
                        width: 80,
                        height: 24,
                        zoomed: true,
                    },
                ])
            }

            async fn create_session(&self, _name: &str) -> Result<(), GatewayError> {
                unimplemented!()
            }
            async fn create_grouped_session(
                &self,
                _name: &str,
                _target: &str,
            ) -> Result<(), GatewayError> {
                unimplemented!()
            }
            async fn kill_session(&self, _name: &str) -> Result<(), GatewayError> {
                unimplemented!()
            }
            async fn switch_client(&self, _session: &str) -> Result<(), GatewayError> {
                unimplemented!()
            }
            async fn new_window(&self, _session: &str) -> Result<(), GatewayError> {
                unimplemented!()
            }
            async fn kill_window(
                &self,
                _session: &str,
                _window_index: u32,
            ) -> Result<(), GatewayError> {
                unimplemented!()
            }
            async fn select_window(
                &self,
                _session: &str,
                _window_index: u32,
            ) -> Result<(), GatewayError> {
                unimplemented!()
            }
            async fn split_window(
                &self,
                _pane_id: &str,
                _orientation: SplitOrientation,
            ) -> Result<(), GatewayError> {
                unimplemented!()
            }
            async fn kill_pane(&self, _pane_id: &str) -> Result<(), GatewayError> {
                unimplemented!()
            }
            async fn select_pane(&self, _pane_id: &str) -> Result<(), GatewayError> {
                unimplemented!()
            }
            async fn zoom_pane(&self, _pane_id: &str) -> Result<(), GatewayError> {
                unimplemented!()
            }
            async fn is_pane_zoomed(&self, _pane_id: &str) -> Result<bool, GatewayError> {
                unimplemented!()
            }
            async fn capture_pane(
                &self,
                _pane_id: &str,
                _lines: u32,
            ) -> Result<String, GatewayError> {
                unimplemented!()
            }
        }

        let snapshot = build_snapshot(&ZoomGateway).await.unwrap();
        assert_eq!(snapshot.sessions.len(), 1);
        let window = &snapshot.sessions[0].windows[0];
        assert!(window.zoomed);
        assert_eq!(window.panes.len(), 2);
        assert!(!snapshot.captured_at.is_empty());
    }
}
