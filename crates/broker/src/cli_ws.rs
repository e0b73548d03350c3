//! The CLI gateway: inverted-connection dial-ins.
//!
//! A launched CLI connects to `/ws/cli/<session>`. The gateway checks the
//! session is waiting for it, bridges the socket to line channels, kicks off
//! `connect_backend` (which parks on the rendezvous), and delivers the
//! socket. Frames arriving before delivery sit in the bounded inbound
//! channel and replay to the adapter in arrival order.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use bc_adapters::rendezvous::{CliSocket, CLI_SOCKET_BUFFER};
use bc_adapters::BackendAdapter;
use bc_sessions::{session_id, Session, SessionPhase};

use crate::consumer_ws::close_with;
use crate::state::AppState;

const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// How long to wait for `connect_backend` to park on the rendezvous before
/// giving up on the delivery.
const DELIVERY_WAIT: Duration = Duration::from_secs(5);

pub async fn cli_ws(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    if !session_id::is_valid(&session_id) {
        return ws.on_upgrade(|socket| close_with(socket, CLOSE_POLICY_VIOLATION, "invalid session id"));
    }

    let Some(session) = state.coordinator.repo.get(&session_id) else {
        return ws.on_upgrade(|socket| close_with(socket, CLOSE_POLICY_VIOLATION, "unknown session"));
    };
    if session.phase() != SessionPhase::Starting {
        return ws
            .on_upgrade(|socket| close_with(socket, CLOSE_POLICY_VIOLATION, "session not waiting"));
    }

    match state.coordinator.resolver.resolve(&session.adapter_name()) {
        Ok(adapter) if adapter.is_inverted() => {}
        _ => {
            return ws.on_upgrade(|socket| {
                close_with(socket, CLOSE_POLICY_VIOLATION, "adapter does not dial in")
            });
        }
    }

    ws.on_upgrade(move |socket| handle_cli(socket, state, session))
}

async fn handle_cli(socket: WebSocket, state: AppState, session: Arc<Session>) {
    let session_id = session.id().to_string();
    let claude = state.coordinator.resolver.claude();

    let (out_tx, mut out_rx) = mpsc::channel::<String>(CLI_SOCKET_BUFFER);
    let (in_tx, in_rx) = mpsc::channel::<String>(CLI_SOCKET_BUFFER);

    // connect_backend parks on the rendezvous until we deliver the socket.
    {
        let coordinator = state.coordinator.clone();
        let connect_session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.connect_backend(&connect_session).await {
                tracing::warn!(
                    session_id = connect_session.id(),
                    error = %e,
                    "inverted backend connect failed"
                );
            }
        });
    }

    // Wait for the register entry to appear, then deliver.
    let deadline = tokio::time::Instant::now() + DELIVERY_WAIT;
    while !claude.rendezvous().is_pending(&session_id) {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(session_id = %session_id, "no pending connect for CLI dial-in");
            claude.cancel_pending(&session_id);
            close_with(socket, CLOSE_INTERNAL_ERROR, "no pending connect").await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let delivered = claude.rendezvous().deliver(
        &session_id,
        CliSocket {
            outgoing: out_tx,
            incoming: in_rx,
        },
    );
    if !delivered {
        claude.cancel_pending(&session_id);
        close_with(socket, CLOSE_INTERNAL_ERROR, "socket delivery failed").await;
        return;
    }

    state
        .coordinator
        .bus
        .emit(bc_domain::event::DomainEvent::ProcessConnected {
            session_id: session_id.clone(),
        });
    tracing::info!(session_id = %session_id, "CLI connected");

    // Bridge the socket to the adapter's line channels.
    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if sink.send(Message::Text(line)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                // Awaiting here is the backpressure: a slow adapter slows
                // the CLI read loop rather than growing a buffer.
                if in_tx.send(text).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Dropping in_tx ends the adapter's inbound stream; the pump emits
    // backend:disconnected from there.
    drop(in_tx);
    writer.abort();
    tracing::info!(session_id = %session_id, "CLI disconnected");
}
