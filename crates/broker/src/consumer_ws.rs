//! The consumer WebSocket gateway.
//!
//! Handshake order is fixed: `identity`, then `session_init`, then history
//! replay, then `cli_connected` if the backend is attached, then live
//! traffic. Every inbound frame runs the same pipeline: size check, rate
//! limit, parse, authorize, dispatch. One bad frame never costs the socket.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};

use bc_domain::event::DomainEvent;
use bc_domain::message::{ContentBlock, UnifiedMessage};
use bc_domain::trace::TraceEvent;
use bc_domain::Error;
use bc_protocol::{authorized, parse_request, ConsumerEvent, ConsumerRequest};
use bc_sessions::{
    session_id, ClosedReason, ConsumerHandle, ConsumerIdentity, Session, SessionPhase,
};

use crate::auth::AuthContext;
use crate::broadcast;
use crate::state::AppState;

const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

pub async fn consumer_ws(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let origin = headers
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    if !state.origin.validate(origin) {
        tracing::warn!(origin = ?origin, "rejecting consumer with bad origin");
        return ws.on_upgrade(|socket| close_with(socket, CLOSE_POLICY_VIOLATION, "bad origin"));
    }
    if !session_id::is_valid(&session_id) {
        return ws.on_upgrade(|socket| close_with(socket, CLOSE_POLICY_VIOLATION, "invalid session id"));
    }

    let session = match state.coordinator.get_or_create_for_consumer(&session_id) {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "consumer rejected");
            let code = match e {
                Error::MaxSessionsReached { .. } => CLOSE_TRY_AGAIN_LATER,
                _ => CLOSE_POLICY_VIOLATION,
            };
            return ws.on_upgrade(move |socket| close_with(socket, code, "session unavailable"));
        }
    };

    let ctx = AuthContext {
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
            })
            .collect(),
        query,
        remote_addr: None,
    };

    ws.on_upgrade(move |socket| handle_consumer(socket, state, session, ctx))
}

pub async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })))
        .await;
}

async fn handle_consumer(
    socket: WebSocket,
    state: AppState,
    session: Arc<Session>,
    ctx: AuthContext,
) {
    // ── Authentication ───────────────────────────────────────────────
    let identity = match &state.authenticator {
        Some(authenticator) => {
            let deadline = Duration::from_millis(state.config.consumer.auth_timeout_ms);
            match tokio::time::timeout(deadline, authenticator.authenticate(&ctx)).await {
                Ok(Ok(identity)) => identity,
                Ok(Err(e)) => {
                    tracing::warn!(session_id = session.id(), error = %e, "consumer auth rejected");
                    close_with(socket, CLOSE_POLICY_VIOLATION, "unauthenticated").await;
                    return;
                }
                Err(_) => {
                    tracing::warn!(session_id = session.id(), "consumer auth timed out");
                    close_with(socket, CLOSE_POLICY_VIOLATION, "auth timeout").await;
                    return;
                }
            }
        }
        None => state.next_anonymous(),
    };

    // ── Registration & handshake ─────────────────────────────────────
    let (consumer_id, handle) = session.add_consumer(identity.clone());
    TraceEvent::ConsumerJoined {
        session_id: session.id().to_string(),
        user_id: identity.user_id.clone(),
    }
    .emit();

    broadcast::direct(
        &handle,
        ConsumerEvent::Identity {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            role: identity.role,
        },
    );
    broadcast::direct(
        &handle,
        ConsumerEvent::SessionInit {
            state: session.state(),
        },
    );

    // Replay: everything after the consumer's last-seen seq, or the trailing
    // window for a fresh consumer.
    let last_seen = ctx
        .query
        .get("last_seen")
        .and_then(|raw| raw.parse::<u64>().ok())
        .or_else(|| session.last_seen_for(&identity.user_id));
    let replayed = match last_seen {
        Some(seen) => session.replay_after(seen),
        None => session.history_tail(session.limits().initial_replay),
    };
    TraceEvent::ReplaySent {
        session_id: session.id().to_string(),
        after_seq: last_seen.unwrap_or(0),
        count: replayed.len(),
    }
    .emit();
    for event in replayed {
        handle.queue.enqueue(event);
    }

    if session.has_backend() {
        broadcast::direct(&handle, ConsumerEvent::CliConnected);
    }

    broadcast::presence_update(&session);

    // ── Socket pumps ─────────────────────────────────────────────────
    let (mut sink, mut stream) = socket.split();

    let writer_session = session.clone();
    let writer_handle = handle.clone();
    let writer_user = identity.user_id.clone();
    let writer = tokio::spawn(async move {
        loop {
            writer_handle.queue.wait().await;
            if let Some(reason) = writer_handle.queue.closed_reason() {
                let (code, text): (u16, &'static str) = match reason {
                    ClosedReason::Shutdown => (CLOSE_GOING_AWAY, "Server shutting down"),
                    ClosedReason::Overflow => (CLOSE_TRY_AGAIN_LATER, "Outbound queue overflow"),
                };
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: Cow::Borrowed(text),
                    })))
                    .await;
                return;
            }
            for event in writer_handle.queue.drain(64) {
                let Ok(json) = serde_json::to_string(&event) else {
                    continue;
                };
                if sink.send(Message::Text(json)).await.is_err() {
                    return;
                }
                if event.seq > 0 {
                    writer_session.record_seen(&writer_user, event.seq);
                }
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                handle_frame(&state, &session, &handle, &identity, &text).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // ── Cleanup ──────────────────────────────────────────────────────
    session.remove_consumer(consumer_id);
    writer.abort();
    if !session.is_closed() {
        broadcast::presence_update(&session);
    }
    TraceEvent::ConsumerLeft {
        session_id: session.id().to_string(),
        user_id: identity.user_id.clone(),
    }
    .emit();
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-frame pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_frame(
    state: &AppState,
    session: &Arc<Session>,
    handle: &Arc<ConsumerHandle>,
    identity: &ConsumerIdentity,
    text: &str,
) {
    if text.len() > state.config.consumer.max_message_size {
        tracing::warn!(
            session_id = session.id(),
            size = text.len(),
            "dropping oversized consumer frame"
        );
        return;
    }

    if !handle.limiter.lock().try_consume(1) {
        state.coordinator.bus.emit(DomainEvent::RateLimitExceeded {
            session_id: session.id().to_string(),
            user_id: identity.user_id.clone(),
        });
        return;
    }

    let request = match parse_request(text) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(session_id = session.id(), error = %e, "invalid consumer frame");
            broadcast::direct(handle, ConsumerEvent::from_error(&e));
            return;
        }
    };

    if !authorized(identity.role, &request) {
        tracing::debug!(
            session_id = session.id(),
            user_id = %identity.user_id,
            request = request.type_name(),
            "dropping unauthorized request"
        );
        return;
    }

    dispatch(state, session, handle, request).await;
}

async fn dispatch(
    state: &AppState,
    session: &Arc<Session>,
    handle: &Arc<ConsumerHandle>,
    request: ConsumerRequest,
) {
    let router = &state.coordinator.router;
    match request {
        ConsumerRequest::UserMessage {
            content, images, ..
        } => {
            router.route(session, user_message(content, images)).await;
        }
        ConsumerRequest::Interrupt => {
            router.route(session, UnifiedMessage::interrupt()).await;
        }
        ConsumerRequest::PermissionResponse(response) => {
            router
                .route(session, UnifiedMessage::permission_response(response))
                .await;
        }
        ConsumerRequest::SetModel { model } => {
            router
                .route(
                    session,
                    UnifiedMessage::configuration_change(Some(model), None),
                )
                .await;
        }
        ConsumerRequest::SetPermissionMode { mode } => {
            router
                .route(
                    session,
                    UnifiedMessage::configuration_change(None, Some(mode)),
                )
                .await;
        }
        ConsumerRequest::PresenceQuery => {
            broadcast::direct(
                handle,
                ConsumerEvent::PresenceUpdate {
                    consumers: session.presence(),
                },
            );
        }
        ConsumerRequest::SlashCommand {
            command,
            request_id,
        } => {
            state
                .coordinator
                .slash
                .dispatch(session, &command, request_id)
                .await;
        }
        ConsumerRequest::SetAdapter { adapter } => {
            if session.has_backend() || session.phase() != SessionPhase::Starting {
                broadcast::direct(
                    handle,
                    ConsumerEvent::Error {
                        kind: "unsupported".into(),
                        message: "adapter can only change before the backend connects".into(),
                    },
                );
                return;
            }
            match bc_adapters::registry::canonical(&adapter) {
                Some(name) => session.set_adapter_name(name),
                None => {
                    broadcast::direct(
                        handle,
                        ConsumerEvent::Error {
                            kind: "unknown_message_type".into(),
                            message: format!("unknown adapter {adapter:?}"),
                        },
                    );
                }
            };
        }
        ConsumerRequest::QueueMessage { content, images }
        | ConsumerRequest::UpdateQueuedMessage { content, images } => {
            let queued = bc_domain::state::QueuedMessage { content, images };
            session.set_queued_message(queued.clone());
            broadcast::broadcast(session, ConsumerEvent::QueuedMessageUpdated { queued });
        }
        ConsumerRequest::CancelQueuedMessage => {
            if session.clear_queued_message() {
                broadcast::broadcast(session, ConsumerEvent::QueuedMessageCancelled);
            }
        }
    }
}

fn user_message(content: String, images: Vec<String>) -> UnifiedMessage {
    let mut msg = UnifiedMessage::user(content);
    for data in images {
        msg.content.push(ContentBlock::Image {
            media_type: "image/png".into(),
            data,
        });
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use bc_domain::config::Config;
    use crate::coordinator::Coordinator;

    fn state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.consumer.max_message_size = 64;
        let coordinator = Coordinator::new(Arc::new(config)).unwrap();
        (dir, AppState::new(coordinator))
    }

    fn consumer(session: &Arc<Session>) -> (ConsumerIdentity, Arc<ConsumerHandle>) {
        let identity = ConsumerIdentity::anonymous(1);
        let (_, handle) = session.add_consumer(identity.clone());
        (identity, handle)
    }

    #[tokio::test]
    async fn oversized_frames_are_dropped_silently() {
        let (_dir, state) = state();
        let session = state
            .coordinator
            .get_or_create_for_consumer("123e4567-e89b-42d3-a456-426614174000")
            .unwrap();
        let (identity, handle) = consumer(&session);

        let big = format!(
            r#"{{"type":"user_message","content":"{}"}}"#,
            "x".repeat(100)
        );
        handle_frame(&state, &session, &handle, &identity, &big).await;
        assert!(handle.queue.is_empty());
        assert_eq!(session.pending_message_count(), 0);
    }

    #[tokio::test]
    async fn invalid_frames_produce_error_events() {
        let (_dir, state) = state();
        let session = state
            .coordinator
            .get_or_create_for_consumer("123e4567-e89b-42d3-a456-426614174000")
            .unwrap();
        let (identity, handle) = consumer(&session);

        handle_frame(&state, &session, &handle, &identity, "not json").await;
        let frames = handle.queue.drain(10);
        match &frames[0].payload {
            ConsumerEvent::Error { kind, .. } => assert_eq!(kind, "invalid_frame"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_drops_and_emits_event() {
        let (_dir, state) = state();
        let session = state
            .coordinator
            .get_or_create_for_consumer("123e4567-e89b-42d3-a456-426614174000")
            .unwrap();
        let (identity, handle) = consumer(&session);
        let mut events = state.coordinator.bus.subscribe();

        // Exhaust the bucket.
        {
            let mut limiter = handle.limiter.lock();
            while limiter.try_consume(1) {}
        }
        handle_frame(&state, &session, &handle, &identity, r#"{"type":"interrupt"}"#).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.key(), "ratelimit:exceeded");
    }

    #[tokio::test]
    async fn user_message_without_backend_buffers() {
        let (_dir, state) = state();
        let session = state
            .coordinator
            .get_or_create_for_consumer("123e4567-e89b-42d3-a456-426614174000")
            .unwrap();
        let (identity, handle) = consumer(&session);

        handle_frame(
            &state,
            &session,
            &handle,
            &identity,
            r#"{"type":"user_message","content":"hi"}"#,
        )
        .await;
        assert_eq!(session.pending_message_count(), 1);
    }

    #[tokio::test]
    async fn queued_message_slot_round_trip() {
        let (_dir, state) = state();
        let session = state
            .coordinator
            .get_or_create_for_consumer("123e4567-e89b-42d3-a456-426614174000")
            .unwrap();
        let (identity, handle) = consumer(&session);

        handle_frame(
            &state,
            &session,
            &handle,
            &identity,
            r#"{"type":"queue_message","content":"later"}"#,
        )
        .await;
        assert_eq!(session.queued_message().unwrap().content, "later");

        handle_frame(
            &state,
            &session,
            &handle,
            &identity,
            r#"{"type":"update_queued_message","content":"sooner"}"#,
        )
        .await;
        assert_eq!(session.queued_message().unwrap().content, "sooner");

        handle_frame(
            &state,
            &session,
            &handle,
            &identity,
            r#"{"type":"cancel_queued_message"}"#,
        )
        .await;
        assert!(session.queued_message().is_none());
    }

    #[tokio::test]
    async fn set_adapter_only_before_connect() {
        let (_dir, state) = state();
        let session = state
            .coordinator
            .get_or_create_for_consumer("123e4567-e89b-42d3-a456-426614174000")
            .unwrap();
        let (identity, handle) = consumer(&session);

        handle_frame(
            &state,
            &session,
            &handle,
            &identity,
            r#"{"type":"set_adapter","adapter":"codex"}"#,
        )
        .await;
        assert_eq!(session.adapter_name(), "codex");

        session.set_phase(SessionPhase::Running);
        handle_frame(
            &state,
            &session,
            &handle,
            &identity,
            r#"{"type":"set_adapter","adapter":"gemini"}"#,
        )
        .await;
        assert_eq!(session.adapter_name(), "codex");
        let frames = handle.queue.drain(10);
        assert!(frames
            .iter()
            .any(|frame| frame.payload.type_name() == "error"));
    }

    #[tokio::test]
    async fn observers_cannot_send_messages() {
        let (_dir, state) = state();
        let session = state
            .coordinator
            .get_or_create_for_consumer("123e4567-e89b-42d3-a456-426614174000")
            .unwrap();
        let identity = ConsumerIdentity {
            user_id: "watcher".into(),
            display_name: "Watcher".into(),
            role: bc_protocol::ConsumerRole::Observer,
        };
        let (_, handle) = session.add_consumer(identity.clone());

        handle_frame(
            &state,
            &session,
            &handle,
            &identity,
            r#"{"type":"user_message","content":"hi"}"#,
        )
        .await;
        assert_eq!(session.pending_message_count(), 0);

        // Presence queries are fine.
        handle_frame(
            &state,
            &session,
            &handle,
            &identity,
            r#"{"type":"presence_query"}"#,
        )
        .await;
        let frames = handle.queue.drain(10);
        assert_eq!(frames[0].payload.type_name(), "presence_update");
    }
}
