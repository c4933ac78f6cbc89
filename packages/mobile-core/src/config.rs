//! Runtime configuration assembled by the CLI and shared with the broker.

/// Everything the broker and HTTP surface need at runtime. The token and
/// password never leave the process through `/api/config`.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub port: u16,
    pub host: String,
    pub password: Option<String>,
    /// Session created when no base session exists yet.
    pub default_session: String,
    /// Lines returned by `capture_scrollback` when the client omits a count.
    pub scrollback_lines: u32,
    pub poll_interval_ms: u64,
    pub token: String,
    /// Directory holding the built frontend (index.html + assets).
    pub frontend_dir: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: 8484,
            host: "0.0.0.0".to_string(),
            password: None,
            default_session: "main".to_string(),
            scrollback_lines: 2000,
            poll_interval_ms: 2500,
            token: String::new(),
            frontend_dir: "frontend/dist".to_string(),
        }
    }
}
