use std::io;
use std::time::Duration;

/// Errors from running multiplexer commands.
///
/// "No server running" gets its own variant because callers treat it
/// differently: session listing normalizes it to an empty list, while
/// mutations surface it to the client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no server running")]
    NoServer,

    #[error("tmux command timed out after {0:?}")]
    Timeout(Duration),

    #[error("tmux command failed: {0}")]
    CommandFailed(String),

    #[error("failed to run tmux: {0}")]
    Spawn(#[source] io::Error),

    #[error("unexpected tmux output: {0}")]
    BadOutput(String),
}

/// Errors from spawning or driving an attached pseudo-terminal.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("failed to spawn pty: {0}")]
    Spawn(String),

    #[error("pty I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Authentication failures, reported verbatim to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,

    #[error("invalid password")]
    InvalidPassword,
}
