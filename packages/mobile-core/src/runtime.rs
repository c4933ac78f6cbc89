//! Per-client terminal runtime: owns one attached PTY, fans its output out
//! to subscribers, and replays the last known viewport size on reattach.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::errors::PtyError;
use crate::pty::{PtyFactory, PtyProcess, DEFAULT_COLS, DEFAULT_ROWS};

struct RuntimeInner {
    session: Option<String>,
    process: Option<Box<dyn PtyProcess>>,
    /// Last valid viewport, replayed on every spawn.
    size: (u16, u16),
    pump: Option<JoinHandle<()>>,
}

/// Owns at most one attach PTY. One runtime per client; output broadcast
/// goes only to that client's data sockets.
pub struct TerminalRuntime {
    factory: Arc<dyn PtyFactory>,
    output_tx: broadcast::Sender<Bytes>,
    exit_tx: broadcast::Sender<()>,
    inner: Mutex<RuntimeInner>,
}

impl TerminalRuntime {
    /// `output_tx` is supplied by the owner so data sockets can subscribe
    /// before the first attach happens.
    pub fn new(factory: Arc<dyn PtyFactory>, output_tx: broadcast::Sender<Bytes>) -> Self {
        let (exit_tx, _) = broadcast::channel(4);
        Self {
            factory,
            output_tx,
            exit_tx,
            inner: Mutex::new(RuntimeInner {
                session: None,
                process: None,
                size: (DEFAULT_COLS, DEFAULT_ROWS),
                pump: None,
            }),
        }
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<Bytes> {
        self.output_tx.subscribe()
    }

    pub fn subscribe_exit(&self) -> broadcast::Receiver<()> {
        self.exit_tx.subscribe()
    }

    /// Attach to `session`. No-op when already attached to it with a live
    /// process; otherwise the current process is killed, a new one spawned
    /// and the last viewport size applied before this returns.
    pub async fn attach(&self, session: &str) -> Result<(), PtyError> {
        let size = {
            let inner = self.inner.lock().expect("runtime mutex");
            if inner.process.is_some() && inner.session.as_deref() == Some(session) {
                return Ok(());
            }
            inner.size
        };

        self.teardown_current().await;

        let spawn = self.factory.spawn_attach(session).await?;
        spawn.process.resize(size.0, size.1);

        let pump = tokio::spawn(pump_loop(
            spawn.output,
            spawn.exit,
            self.output_tx.clone(),
            self.exit_tx.clone(),
        ));

        let mut inner = self.inner.lock().expect("runtime mutex");
        inner.session = Some(session.to_string());
        inner.process = Some(spawn.process);
        inner.pump = Some(pump);
        Ok(())
    }

    /// Forward input bytes to the process; silently dropped when detached.
    pub fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        let inner = self.inner.lock().expect("runtime mutex");
        match &inner.process {
            Some(process) => process.write(bytes),
            None => Ok(()),
        }
    }

    /// Store and apply a viewport size. Non-finite or sub-2x2 dimensions
    /// are ignored; fractional values are truncated.
    pub fn resize(&self, cols: f64, rows: f64) {
        if !cols.is_finite() || !rows.is_finite() || cols < 2.0 || rows < 2.0 {
            return;
        }
        let size = (cols as u16, rows as u16);
        let mut inner = self.inner.lock().expect("runtime mutex");
        inner.size = size;
        if let Some(process) = &inner.process {
            process.resize(size.0, size.1);
        }
    }

    /// Kill the current process and forget it. The runtime can be
    /// reattached afterwards.
    pub async fn shutdown(&self) {
        self.teardown_current().await;
        self.inner.lock().expect("runtime mutex").session = None;
    }

    /// Deliberate teardown: the pump is stopped before the kill so
    /// deliberate kills never surface as an exit event.
    async fn teardown_current(&self) {
        let (process, pump) = {
            let mut inner = self.inner.lock().expect("runtime mutex");
            (inner.process.take(), inner.pump.take())
        };
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }
        if let Some(process) = process {
            process.kill();
        }
    }
}

async fn pump_loop(
    mut output: mpsc::Receiver<Bytes>,
    mut exit: mpsc::Receiver<()>,
    output_tx: broadcast::Sender<Bytes>,
    exit_tx: broadcast::Sender<()>,
) {
    loop {
        tokio::select! {
            biased;
            chunk = output.recv() => match chunk {
                Some(bytes) => {
                    let _ = output_tx.send(bytes);
                }
                None => {
                    let _ = exit_tx.send(());
                    break;
                }
            },
            _ = exit.recv() => {
                let _ = exit_tx.send(());
                break;
            }
        }
    }
}
