//! Multiplexer gateway: typed operations over the external tmux binary.
//!
//! Every command is executed as an argument vector (never a shell string)
//! with the enclosing-multiplexer environment stripped, so a server that
//! itself runs inside tmux does not leak its client identity into children.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::errors::GatewayError;
use crate::{PaneState, SessionSummary, WindowRecord};

/// Default bound on a single tmux command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variables that identify an enclosing tmux client; removed
/// from every child we spawn.
pub const MULTIPLEXER_ENV_VARS: &[&str] = &["TMUX", "TMUX_PANE"];

/// Split direction for `split-window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitOrientation {
    #[serde(rename = "h")]
    Horizontal,
    #[serde(rename = "v")]
    Vertical,
}

impl SplitOrientation {
    fn flag(self) -> &'static str {
        match self {
            SplitOrientation::Horizontal => "-h",
            SplitOrientation::Vertical => "-v",
        }
    }
}

/// Abstract multiplexer operations used by the broker and the state
/// monitor. The CLI-backed implementation is [`TmuxGateway`]; tests use
/// in-memory fakes.
#[async_trait]
pub trait MultiplexerGateway: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, GatewayError>;
    async fn list_windows(&self, session: &str) -> Result<Vec<WindowRecord>, GatewayError>;
    async fn list_panes(
        &self,
        session: &str,
        window_index: u32,
    ) -> Result<Vec<PaneState>, GatewayError>;

    async fn create_session(&self, name: &str) -> Result<(), GatewayError>;
    /// Create a detached session sharing the target's window set. Window
    /// mutations are visible to both; active-pane and zoom state are not.
    async fn create_grouped_session(&self, name: &str, target: &str) -> Result<(), GatewayError>;
    async fn kill_session(&self, name: &str) -> Result<(), GatewayError>;
    /// May fail with "no current client"; callers with another attach path
    /// treat that as non-fatal.
    async fn switch_client(&self, session: &str) -> Result<(), GatewayError>;

    async fn new_window(&self, session: &str) -> Result<(), GatewayError>;
    async fn kill_window(&self, session: &str, window_index: u32) -> Result<(), GatewayError>;
    async fn select_window(&self, session: &str, window_index: u32) -> Result<(), GatewayError>;

    async fn split_window(
        &self,
        pane_id: &str,
        orientation: SplitOrientation,
    ) -> Result<(), GatewayError>;
    async fn kill_pane(&self, pane_id: &str) -> Result<(), GatewayError>;
    async fn select_pane(&self, pane_id: &str) -> Result<(), GatewayError>;
    /// Toggles zoom on the pane's window.
    async fn zoom_pane(&self, pane_id: &str) -> Result<(), GatewayError>;
    async fn is_pane_zoomed(&self, pane_id: &str) -> Result<bool, GatewayError>;

    /// Capture the last `lines` lines of the pane, including history.
    async fn capture_pane(&self, pane_id: &str, lines: u32) -> Result<String, GatewayError>;
}

// Tab-separated -F format strings. Field order is load-bearing: the line
// parsers below index by position.
const SESSION_FORMAT: &str = "#{session_name}\t#{session_attached}\t#{session_windows}";
const WINDOW_FORMAT: &str = "#{window_index}\t#{window_name}\t#{window_active}\t#{window_panes}";
const PANE_FORMAT: &str = concat!(
    "#{pane_index}\t#{pane_id}\t#{pane_current_command}\t#{pane_active}\t",
    "#{pane_width}x#{pane_height}\t",
    "#{?#{&&:#{window_zoomed_flag},#{pane_active}},1,0}"
);

/// CLI-backed gateway around the `tmux` binary.
pub struct TmuxGateway {
    tmux_bin: String,
    timeout: Duration,
}

impl TmuxGateway {
    pub fn new() -> Self {
        Self::with_binary("tmux")
    }

    pub fn with_binary(tmux_bin: impl Into<String>) -> Self {
        Self {
            tmux_bin: tmux_bin.into(),
            timeout: COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a tmux subcommand and return its stdout.
    async fn run(&self, args: &[&str]) -> Result<String, GatewayError> {
        let mut cmd = Command::new(&self.tmux_bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for var in MULTIPLEXER_ENV_VARS {
            cmd.env_remove(var);
        }

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| GatewayError::Timeout(self.timeout))?
            .map_err(GatewayError::Spawn)?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("no server running") {
            return Err(GatewayError::NoServer);
        }
        Err(GatewayError::CommandFailed(stderr.trim().to_string()))
    }
}

impl Default for TmuxGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MultiplexerGateway for TmuxGateway {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, GatewayError> {
        match self.run(&["list-sessions", "-F", SESSION_FORMAT]).await {
            Ok(out) => parse_lines(&out, parse_session_line),
            // No server means no sessions, not a failure.
            Err(GatewayError::NoServer) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn list_windows(&self, session: &str) -> Result<Vec<WindowRecord>, GatewayError> {
        let out = self
            .run(&["list-windows", "-t", session, "-F", WINDOW_FORMAT])
            .await?;
        parse_lines(&out, parse_window_line)
    }

    async fn list_panes(
        &self,
        session: &str,
        window_index: u32,
    ) -> Result<Vec<PaneState>, GatewayError> {
        let target = format!("{}:{}", session, window_index);
        let out = self
            .run(&["list-panes", "-t", &target, "-F", PANE_FORMAT])
            .await?;
        parse_lines(&out, parse_pane_line)
    }

    async fn create_session(&self, name: &str) -> Result<(), GatewayError> {
        self.run(&["new-session", "-d", "-s", name]).await?;
        Ok(())
    }

    async fn create_grouped_session(&self, name: &str, target: &str) -> Result<(), GatewayError> {
        self.run(&["new-session", "-d", "-s", name, "-t", target])
            .await?;
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<(), GatewayError> {
        self.run(&["kill-session", "-t", name]).await?;
        Ok(())
    }

    async fn switch_client(&self, session: &str) -> Result<(), GatewayError> {
        self.run(&["switch-client", "-t", session]).await?;
        Ok(())
    }

    async fn new_window(&self, session: &str) -> Result<(), GatewayError> {
        self.run(&["new-window", "-t", session]).await?;
        Ok(())
    }

    async fn kill_window(&self, session: &str, window_index: u32) -> Result<(), GatewayError> {
        let target = format!("{}:{}", session, window_index);
        self.run(&["kill-window", "-t", &target]).await?;
        Ok(())
    }

    async fn select_window(&self, session: &str, window_index: u32) -> Result<(), GatewayError> {
        let target = format!("{}:{}", session, window_index);
        self.run(&["select-window", "-t", &target]).await?;
        Ok(())
    }

    async fn split_window(
        &self,
        pane_id: &str,
        orientation: SplitOrientation,
    ) -> Result<(), GatewayError> {
        self.run(&["split-window", orientation.flag(), "-t", pane_id])
            .await?;
        Ok(())
    }

    async fn kill_pane(&self, pane_id: &str) -> Result<(), GatewayError> {
        self.run(&["kill-pane", "-t", pane_id]).await?;
        Ok(())
    }

    async fn select_pane(&self, pane_id: &str) -> Result<(), GatewayError> {
        self.run(&["select-pane", "-t", pane_id]).await?;
        Ok(())
    }

    async fn zoom_pane(&self, pane_id: &str) -> Result<(), GatewayError> {
        self.run(&["resize-pane", "-Z", "-t", pane_id]).await?;
        Ok(())
    }

    async fn is_pane_zoomed(&self, pane_id: &str) -> Result<bool, GatewayError> {
        let out = self
            .run(&[
                "display-message",
                "-p",
                "-t",
                pane_id,
                "#{window_zoomed_flag}",
            ])
            .await?;
        Ok(out.trim() == "1")
    }

    async fn capture_pane(&self, pane_id: &str, lines: u32) -> Result<String, GatewayError> {
        let start = format!("-{}", lines);
        self.run(&["capture-pane", "-p", "-t", pane_id, "-S", &start])
            .await
    }
}

// ============================================
// Line parsing
// ============================================

fn parse_lines<T>(
    output: &str,
    parse: fn(&str) -> Result<T, GatewayError>,
) -> Result<Vec<T>, GatewayError> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .map(parse)
        .collect()
}

fn parse_flag(field: &str) -> bool {
    // Boolean-ish tmux fields are "1"/"0"; session_attached is a client
    // count, so anything nonzero counts as attached.
    field != "0"
}

fn parse_u32(field: &str, line: &str) -> Result<u32, GatewayError> {
    field
        .parse()
        .map_err(|_| GatewayError::BadOutput(format!("bad number in line: {}", line)))
}

pub fn parse_session_line(line: &str) -> Result<SessionSummary, GatewayError> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 3 {
        return Err(GatewayError::BadOutput(format!(
            "expected 3 session fields, got {}: {}",
            fields.len(),
            line
        )));
    }
    Ok(SessionSummary {
        name: fields[0].to_string(),
        attached: parse_flag(fields[1]),
        windows: parse_u32(fields[2], line)?,
    })
}

pub fn parse_window_line(line: &str) -> Result<WindowRecord, GatewayError> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 4 {
        return Err(GatewayError::BadOutput(format!(
            "expected 4 window fields, got {}: {}",
            fields.len(),
            line
        )));
    }
    Ok(WindowRecord {
        index: parse_u32(fields[0], line)?,
        name: fields[1].to_string(),
        active: parse_flag(fields[2]),
        pane_count: parse_u32(fields[3], line)?,
    })
}

pub fn parse_pane_line(line: &str) -> Result<PaneState, GatewayError> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 6 {
        return Err(GatewayError::BadOutput(format!(
            "expected 6 pane fields, got {}: {}",
            fields.len(),
            line
        )));
    }
    let (width, height) = fields[4]
        .split_once('x')
        .ok_or_else(|| GatewayError::BadOutput(format!("bad pane size in line: {}", line)))?;
    Ok(PaneState {
        index: parse_u32(fields[0], line)?,
        id: fields[1].to_string(),
        current_command: fields[2].to_string(),
        active: parse_flag(fields[3]),
        width: parse_u32(width, line)? as u16,
        height: parse_u32(height, line)? as u16,
        zoomed: parse_flag(fields[5]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_line() {
        let s = parse_session_line("work\t1\t3").unwrap();
        assert_eq!(s.name, "work");
        assert!(s.attached);
        assert_eq!(s.windows, 3);

        let s = parse_session_line("tmux-mobile-client-abc\t0\t1").unwrap();
        assert!(!s.attached);
    }

    #[test]
    fn test_parse_session_attached_is_a_client_count() {
        // tmux reports the number of attached clients, not a strict flag.
        let s = parse_session_line("work\t2\t1").unwrap();
        assert!(s.attached);
    }

    #[test]
    fn test_parse_window_line() {
        let w = parse_window_line("0\tshell\t1\t2").unwrap();
        assert_eq!(w.index, 0);
        assert_eq!(w.name, "shell");
        assert!(w.active);
        assert_eq!(w.pane_count, 2);
    }

    #[test]
    fn test_parse_window_name_with_spaces() {
        let w = parse_window_line("4\tmy editor\t0\t1").unwrap();
        assert_eq!(w.name, "my editor");
        assert!(!w.active);
    }

    #[test]
    fn test_parse_pane_line() {
        let p = parse_pane_line("1\t%5\tvim\t1\t120x40\t1").unwrap();
        assert_eq!(p.index, 1);
        assert_eq!(p.id, "%5");
        assert_eq!(p.current_command, "vim");
        assert!(p.active);
        assert_eq!((p.width, p.height), (120, 40));
        assert!(p.zoomed);
    }

    #[test]
    fn test_parse_pane_inactive_never_zoomed() {
        // The format string renders zoom only for the active pane.
        let p = parse_pane_line("0\t%4\tbash\t0\t80x24\t0").unwrap();
        assert!(!p.active);
        assert!(!p.zoomed);
    }

    #[test]
    fn test_parse_lines_skips_empty() {
        let out = "work\t1\t2\n\ndev\t0\t1\n";
        let sessions = parse_lines(out, parse_session_line).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1].name, "dev");
    }

    #[test]
    fn test_parse_rejects_short_lines() {
        assert!(parse_session_line("work\t1").is_err());
        assert!(parse_window_line("0\tshell\t1").is_err());
        assert!(parse_pane_line("1\t%5\tvim\t1\t120x40").is_err());
        assert!(parse_pane_line("1\t%5\tvim\t1\t120-40\t0").is_err());
    }

    #[test]
    fn test_format_strings_are_tab_separated() {
        assert_eq!(SESSION_FORMAT.matches('\t').count(), 2);
        assert_eq!(WINDOW_FORMAT.matches('\t').count(), 3);
        assert_eq!(PANE_FORMAT.matches('\t').count(), 5);
    }
}
