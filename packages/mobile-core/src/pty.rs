//! PTY adapter: spawn `tmux attach-session` under a pseudo-terminal and
//! bridge its byte I/O to the async side.
//!
//! The blocking portable-pty surfaces are isolated in threads: a reader
//! thread feeds the output channel, a resize thread owns the master, and a
//! poll thread watches `try_wait()` for exit.

use std::io::{Read, Write};
use std::sync::{self, Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;

use crate::errors::PtyError;
use crate::gateway::MULTIPLEXER_ENV_VARS;

/// Columns/rows used at spawn before the client reports its viewport.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Handle to a spawned attach process.
pub trait PtyProcess: Send + Sync {
    fn write(&self, bytes: &[u8]) -> Result<(), PtyError>;
    fn resize(&self, cols: u16, rows: u16);
    fn kill(&self);
}

/// A freshly spawned PTY: the process handle plus its output and exit
/// streams. Channel receivers replace callback registration; the runtime
/// pumps them into its broadcast channels.
pub struct PtySpawn {
    pub process: Box<dyn PtyProcess>,
    pub output: mpsc::Receiver<Bytes>,
    pub exit: mpsc::Receiver<()>,
}

#[async_trait]
pub trait PtyFactory: Send + Sync {
    async fn spawn_attach(&self, session: &str) -> Result<PtySpawn, PtyError>;
}

/// portable-pty backed factory spawning `tmux attach-session -t <name>`.
pub struct AttachPtyFactory {
    tmux_bin: String,
}

impl AttachPtyFactory {
    pub fn new() -> Self {
        Self::with_binary("tmux")
    }

    pub fn with_binary(tmux_bin: impl Into<String>) -> Self {
        Self {
            tmux_bin: tmux_bin.into(),
        }
    }
}

impl Default for AttachPtyFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Attach command: session name passed as a distinct argument, never
/// interpolated into a shell line. TMUX/TMUX_PANE are removed so the child
/// does not believe it is nested.
fn attach_command(tmux_bin: &str, session: &str) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(tmux_bin);
    cmd.arg("attach-session");
    cmd.arg("-t");
    cmd.arg(session);
    cmd.env("TERM", "xterm-256color");
    for var in MULTIPLEXER_ENV_VARS {
        cmd.env_remove(var);
    }
    cmd
}

#[async_trait]
impl PtyFactory for AttachPtyFactory {
    async fn spawn_attach(&self, session: &str) -> Result<PtySpawn, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let cmd = attach_command(&self.tmux_bin, session);
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        let master = pair.master;

        let (output_tx, output_rx) = mpsc::channel::<Bytes>(256);
        let (exit_tx, exit_rx) = mpsc::channel::<()>(1);
        let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();

        let child = Arc::new(Mutex::new(child));

        // Blocking reader thread: PTY stdout → async side.
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        // Resize thread: owns the master so resizes apply after the
        // reader/writer handles are split off.
        std::thread::spawn(move || {
            while let Ok((cols, rows)) = resize_rx.recv() {
                let _ = master.resize(PtySize {
                    cols,
                    rows,
                    pixel_width: 0,
                    pixel_height: 0,
                });
            }
        });

        // Poll thread: report child exit once.
        let child_poll = Arc::clone(&child);
        std::thread::spawn(move || loop {
            let exited = {
                let mut guard = match child_poll.lock() {
                    Ok(g) => g,
                    Err(_) => break,
                };
                match guard.try_wait() {
                    Ok(None) => false,
                    Ok(Some(_)) => true,
                    Err(_) => true,
                }
            };
            if exited {
                let _ = exit_tx.blocking_send(());
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(500));
        });

        let process = AttachedPty {
            writer: Mutex::new(writer),
            resize_tx,
            child,
        };
        Ok(PtySpawn {
            process: Box::new(process),
            output: output_rx,
            exit: exit_rx,
        })
    }
}

struct AttachedPty {
    writer: Mutex<Box<dyn Write + Send>>,
    resize_tx: sync::mpsc::Sender<(u16, u16)>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
}

impl PtyProcess for AttachedPty {
    fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        let mut guard = self
            .writer
            .lock()
            .expect("pty writer mutex");
        guard.write_all(bytes)?;
        guard.flush()?;
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) {
        let _ = self.resize_tx.send((cols, rows));
    }

    fn kill(&self) {
        if let Ok(mut guard) = self.child.lock() {
            let _ = guard.kill();
        }
    }
}
