//! Wire protocol for both WebSocket planes: closed tagged-variant sums with
//! a string `type` discriminator. Unknown tags fail deserialization and are
//! reported as protocol errors.

use serde::{Deserialize, Serialize};

use mobile_core::{SessionSummary, SplitOrientation, StateSnapshot};

/// Inbound control-plane messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Auth {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        client_id: Option<String>,
    },
    SelectSession {
        session: String,
    },
    NewSession {
        name: String,
    },
    /// The session field is accepted for compatibility but the broker
    /// always targets the context's attached session.
    NewWindow {
        session: String,
    },
    #[serde(rename_all = "camelCase")]
    SelectWindow {
        window_index: u32,
    },
    #[serde(rename_all = "camelCase")]
    KillWindow {
        window_index: u32,
    },
    #[serde(rename_all = "camelCase")]
    SelectPane {
        pane_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SplitPane {
        pane_id: String,
        orientation: SplitOrientation,
    },
    #[serde(rename_all = "camelCase")]
    KillPane {
        pane_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ZoomPane {
        pane_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CaptureScrollback {
        pane_id: String,
        #[serde(default)]
        lines: Option<u32>,
    },
    SendCompose {
        text: String,
    },
}

/// Outbound control-plane messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    AuthOk {
        client_id: String,
        requires_password: bool,
    },
    AuthError {
        reason: String,
    },
    Attached {
        session: String,
    },
    SessionPicker {
        sessions: Vec<SessionSummary>,
    },
    TmuxState {
        state: StateSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    Scrollback {
        pane_id: String,
        text: String,
        lines: u32,
    },
    Error {
        message: String,
    },
    Info {
        message: String,
    },
}

/// The two JSON shapes understood on the data plane; everything else on
/// that socket is raw terminal bytes.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataClientMessage {
    #[serde(rename_all = "camelCase")]
    Auth {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        client_id: Option<String>,
    },
    Resize {
        cols: f64,
        rows: f64,
    },
}
