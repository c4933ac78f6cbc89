//! WebSocket plumbing for both planes.
//!
//! Each socket gets a send task draining an outbound channel and a
//! sequential receive loop, so responses for one socket keep arrival
//! order while different sockets proceed independently.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use mobile_core::auth::Credentials;

use crate::broker::{Broker, ControlContext, ControlFrame, DataFrame, CLOSE_UNAUTHORIZED};
use crate::protocol::{ClientMessage, DataClientMessage, ServerMessage};
use crate::AppState;

/// `GET /ws/control`. Plain (non-upgrade) requests get a 404; the path is
/// reserved for WebSocket upgrades.
pub async fn control_handler(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => {
            let broker = state.broker.clone();
            ws.on_upgrade(move |socket| handle_control_socket(broker, socket))
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `GET /ws/terminal`.
pub async fn terminal_handler(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => {
            let broker = state.broker.clone();
            ws.on_upgrade(move |socket| handle_terminal_socket(broker, socket))
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

// ============================================
// Control plane
// ============================================

async fn handle_control_socket(broker: Arc<Broker>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ControlFrame>(64);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match frame {
                ControlFrame::Message(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            debug!(error = %e, "failed to serialize control message");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                ControlFrame::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let mut context: Option<Arc<ControlContext>> = None;
    let mut state_task: Option<JoinHandle<()>> = None;

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Err(_) => {
                send_control(
                    &outbound_tx,
                    ServerMessage::Error {
                        message: "invalid message format".into(),
                    },
                )
                .await;
            }
            Ok(ClientMessage::Auth {
                token,
                password,
                client_id,
            }) => {
                if context.is_some() {
                    // Repeated auth on an authenticated socket is ignored.
                    continue;
                }
                let credentials = Credentials { token, password };
                match broker
                    .authenticate_control(&credentials, client_id.as_deref(), outbound_tx.clone())
                    .await
                {
                    Ok(new_context) => {
                        state_task = Some(spawn_state_forwarder(&broker, outbound_tx.clone()));
                        broker.run_initial_attach(&new_context).await;
                        context = Some(new_context);
                    }
                    Err(e) => {
                        // The socket stays open so the client can retry.
                        send_control(
                            &outbound_tx,
                            ServerMessage::AuthError {
                                reason: e.to_string(),
                            },
                        )
                        .await;
                    }
                }
            }
            Ok(message) => match &context {
                Some(context) => broker.handle_control_message(context, message).await,
                None => {
                    send_control(
                        &outbound_tx,
                        ServerMessage::AuthError {
                            reason: "auth required".into(),
                        },
                    )
                    .await;
                }
            },
        }
    }

    if let Some(task) = state_task {
        task.abort();
    }
    if let Some(context) = context {
        broker.shutdown_control(&context).await;
    }
    drop(outbound_tx);
    let _ = send_task.await;
}

async fn send_control(outbound: &mpsc::Sender<ControlFrame>, message: ServerMessage) {
    let _ = outbound.send(ControlFrame::Message(message)).await;
}

/// Forward state broadcasts to one authenticated control socket.
fn spawn_state_forwarder(
    broker: &Arc<Broker>,
    outbound: mpsc::Sender<ControlFrame>,
) -> JoinHandle<()> {
    let mut state_rx = broker.subscribe_state();
    tokio::spawn(async move {
        loop {
            match state_rx.recv().await {
                Ok(snapshot) => {
                    let message = ServerMessage::TmuxState { state: snapshot };
                    if outbound.send(ControlFrame::Message(message)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "control socket lagged behind state broadcasts");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

// ============================================
// Data plane
// ============================================

async fn handle_terminal_socket(broker: Arc<Broker>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<DataFrame>(256);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match frame {
                DataFrame::Output(bytes) => {
                    if sink.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                DataFrame::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let mut bound: Option<(Arc<ControlContext>, u64)> = None;
    let mut pump: Option<JoinHandle<()>> = None;

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Binary(bytes) => match &bound {
                Some((context, _)) => context.write_input(&bytes).await,
                None => {
                    let _ = outbound_tx
                        .send(DataFrame::Close {
                            code: CLOSE_UNAUTHORIZED,
                            reason: "auth required",
                        })
                        .await;
                    break;
                }
            },
            Message::Text(text) => {
                if let Some((context, _)) = &bound {
                    handle_data_text(context, &text).await;
                    continue;
                }
                // First frame must be a JSON auth message.
                match parse_data_auth(&text) {
                    Some((credentials, client_id)) => {
                        match broker
                            .bind_data_socket(
                                &credentials,
                                client_id.as_deref(),
                                outbound_tx.clone(),
                            )
                            .await
                        {
                            Some((context, socket_id)) => {
                                pump = Some(spawn_output_pump(&context, outbound_tx.clone()));
                                bound = Some((context, socket_id));
                            }
                            None => {
                                let _ = outbound_tx
                                    .send(DataFrame::Close {
                                        code: CLOSE_UNAUTHORIZED,
                                        reason: "unauthorized",
                                    })
                                    .await;
                                break;
                            }
                        }
                    }
                    None => {
                        let _ = outbound_tx
                            .send(DataFrame::Close {
                                code: CLOSE_UNAUTHORIZED,
                                reason: "auth required",
                            })
                            .await;
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(task) = pump {
        task.abort();
    }
    if let Some((context, socket_id)) = bound {
        broker.unbind_data_socket(&context, socket_id).await;
    }
    drop(outbound_tx);
    let _ = send_task.await;
}

/// Text frames that look like JSON are probed for a resize message and
/// consumed when they parse; everything else goes to the PTY verbatim.
async fn handle_data_text(context: &Arc<ControlContext>, text: &str) {
    if text.trim_start().starts_with('{') {
        match serde_json::from_str::<DataClientMessage>(text) {
            Ok(DataClientMessage::Resize { cols, rows }) => {
                context.resize(cols, rows).await;
                return;
            }
            // Already authenticated; a repeated auth is swallowed rather
            // than typed into the terminal.
            Ok(DataClientMessage::Auth { .. }) => return,
            Err(_) => {}
        }
    }
    context.write_input(text.as_bytes()).await;
}

fn parse_data_auth(text: &str) -> Option<(Credentials, Option<String>)> {
    match serde_json::from_str::<DataClientMessage>(text) {
        Ok(DataClientMessage::Auth {
            token,
            password,
            client_id,
        }) => Some((Credentials { token, password }, client_id)),
        _ => None,
    }
}

/// Pump this context's PTY output into one data socket.
fn spawn_output_pump(
    context: &Arc<ControlContext>,
    outbound: mpsc::Sender<DataFrame>,
) -> JoinHandle<()> {
    let mut output_rx = context.subscribe_output();
    tokio::spawn(async move {
        loop {
            match output_rx.recv().await {
                Ok(bytes) => {
                    if outbound.send(DataFrame::Output(bytes)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "data socket lagged behind pty output");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_auth() {
        let parsed = parse_data_auth(r#"{"type":"auth","token":"T","clientId":"abc"}"#);
        let (credentials, client_id) = parsed.expect("auth should parse");
        assert_eq!(credentials.token.as_deref(), Some("T"));
        assert_eq!(client_id.as_deref(), Some("abc"));

        // A resize before auth is not an auth message.
        assert!(parse_data_auth(r#"{"type":"resize","cols":80,"rows":24}"#).is_none());
        assert!(parse_data_auth("plain keystrokes").is_none());
    }
}
