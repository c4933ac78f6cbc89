pub mod auth;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod monitor;
pub mod pty;
pub mod runtime;

use serde::{Deserialize, Serialize};

pub use auth::AuthService;
pub use config::RuntimeConfig;
pub use errors::{AuthError, GatewayError, PtyError};
pub use gateway::{MultiplexerGateway, SplitOrientation, TmuxGateway};
pub use monitor::{StateEmitter, StateMonitor};
pub use pty::{AttachPtyFactory, PtyFactory, PtyProcess, PtySpawn};
pub use runtime::TerminalRuntime;

/// Name prefix for broker-managed grouped sessions. Sessions with this
/// prefix are hidden from the session picker and only the broker creates
/// or destroys them.
pub const MOBILE_SESSION_PREFIX: &str = "tmux-mobile-client-";

/// One row of `list-sessions` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub name: String,
    pub attached: bool,
    /// Window count, not the window list (see [`SessionState`]).
    pub windows: u32,
}

/// One row of `list-windows` output; panes are listed separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowRecord {
    pub index: u32,
    pub name: String,
    pub active: bool,
    pub pane_count: u32,
}

/// A single pane. `zoomed` is the combined flag: the enclosing window is
/// zoomed AND this pane is the active one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaneState {
    pub index: u32,
    /// Opaque multiplexer pane id, e.g. "%3".
    pub id: String,
    pub current_command: String,
    pub active: bool,
    pub width: u16,
    pub height: u16,
    pub zoomed: bool,
}

/// A window with its panes, assembled by the state monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowState {
    pub index: u32,
    pub name: String,
    pub active: bool,
    pub zoomed: bool,
    pub pane_count: u32,
    pub panes: Vec<PaneState>,
}

/// A session with its windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub name: String,
    pub attached: bool,
    pub windows: Vec<WindowState>,
}

/// Full multiplexer state at one point in time.
///
/// Equality for change detection is defined over `sessions` only; the
/// timestamp is informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub sessions: Vec<SessionState>,
    pub captured_at: String,
}

impl StateSnapshot {
    /// Canonical serialization of the sessions sequence, used as the
    /// change-detection fingerprint. The timestamp is excluded.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(&self.sessions).expect("sessions serialize")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(at: &str, names: &[&str]) -> StateSnapshot {
        StateSnapshot {
            sessions: names
                .iter()
                .map(|n| SessionState {
                    name: n.to_string(),
                    attached: false,
                    windows: Vec::new(),
                })
                .collect(),
            captured_at: at.to_string(),
        }
    }

    #[test]
    fn test_fingerprint_ignores_timestamp() {
        let a = snapshot("2026-01-01T00:00:00Z", &["main"]);
        let b = snapshot("2026-01-01T00:00:05Z", &["main"]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_reflects_sessions() {
        let a = snapshot("t", &["main"]);
        let b = snapshot("t", &["main", "dev"]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_wire_field_names() {
        let pane = PaneState {
            index: 0,
            id: "%1".into(),
            current_command: "vim".into(),
            active: true,
            width: 80,
            height: 24,
            zoomed: false,
        };
        let json = serde_json::to_value(&pane).unwrap();
        assert!(json.get("currentCommand").is_some());

        let window = WindowState {
            index: 0,
            name: "shell".into(),
            active: true,
            zoomed: false,
            pane_count: 1,
            panes: vec![pane],
        };
        let json = serde_json::to_value(&window).unwrap();
        assert!(json.get("paneCount").is_some());

        let snap = StateSnapshot {
            sessions: Vec::new(),
            captured_at: "now".into(),
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert!(json.get("capturedAt").is_some());
    }
}
