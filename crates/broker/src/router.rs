//! The unified message router: the single entry point for every
//! `UnifiedMessage`, whether it came from the backend adapter or a consumer.
//!
//! Per message: apply the pure reducer, do the variant's bookkeeping
//! (pending permissions, capabilities, passthrough tagging, queued-message
//! release), broadcast anything consumer-relevant, persist (debounced;
//! immediate on critical transitions), and emit the domain event. Messages
//! arriving after `session:closed` are dropped.

use std::sync::Arc;

use chrono::Utc;

use bc_adapters::BackendChannel;
use bc_domain::message::{UnifiedMessage, UnifiedPayload};
use bc_domain::state::SessionStatus;
use bc_domain::trace::TraceEvent;
use bc_domain::{Error, Role};
use bc_protocol::{ConsumerEvent, SessionActivity};
use bc_sessions::reducer::reduce;
use bc_sessions::{Session, SessionRepository};

use crate::broadcast;
use crate::capabilities::CapabilitiesPolicy;

pub struct MessageRouter {
    repo: Arc<SessionRepository>,
    capabilities: Arc<CapabilitiesPolicy>,
}

impl MessageRouter {
    pub fn new(repo: Arc<SessionRepository>, capabilities: Arc<CapabilitiesPolicy>) -> Self {
        Self { repo, capabilities }
    }

    pub async fn route(&self, session: &Arc<Session>, msg: UnifiedMessage) {
        if session.is_closed() {
            tracing::debug!(
                session_id = session.id(),
                message_type = msg.type_name(),
                "dropping message for closed session"
            );
            return;
        }
        session.touch();
        TraceEvent::MessageRouted {
            session_id: session.id().to_string(),
            message_type: msg.type_name().to_string(),
        }
        .emit();

        // Capabilities control traffic never reaches consumers.
        if let UnifiedPayload::ControlResponse {
            request_id,
            success,
            response,
        } = &msg.payload
        {
            self.capabilities
                .handle_control_response(session, request_id, *success, response);
            return;
        }

        let changed =
            session.update_state(|state, buffer| reduce(state, &msg, buffer, Utc::now()));

        let mut critical_save = false;
        match &msg.payload {
            UnifiedPayload::SessionInit(init) => {
                // A different backend conversation id means a fresh
                // conversation: sequencing restarts at 1.
                let previous = session.swap_backend_session_id(&init.session_id);
                if previous.is_some() && previous.as_deref() != Some(init.session_id.as_str()) {
                    session.reset_sequencer();
                }

                session.with_registry(|registry| {
                    registry.register_cli_commands(init.slash_commands.iter().map(|name| {
                        bc_domain::state::CommandInfo {
                            name: name.clone(),
                            description: None,
                            argument_hint: None,
                        }
                    }));
                    registry.register_skills(&init.skills);
                });

                broadcast::broadcast(
                    session,
                    ConsumerEvent::SessionInit {
                        state: session.state(),
                    },
                );
                self.capabilities.apply_session_init(session, init);
                critical_save = true;
            }
            UnifiedPayload::PermissionRequest(request) => {
                session.insert_permission(request.clone());
                broadcast::broadcast(session, ConsumerEvent::PermissionRequest(request.clone()));
            }
            UnifiedPayload::Result(result) => {
                // Tag the turn back to a passthrough slash command, if one
                // is waiting.
                if let Some(passthrough) = session.pop_passthrough() {
                    broadcast::broadcast(
                        session,
                        ConsumerEvent::SlashCommandResult {
                            command: passthrough.command,
                            request_id: passthrough.request_id,
                            content: passthrough.response,
                            source: "passthrough".into(),
                            duration_ms: result.duration_ms,
                        },
                    );
                }
                broadcast::broadcast(session, ConsumerEvent::Result(result.clone()));
                session.set_last_status(Some(SessionStatus::Idle));
                self.release_queued_message(session).await;
                critical_save = true;
            }
            UnifiedPayload::StatusChange { status, .. } => {
                if let Some(status) = status {
                    session.set_last_status(Some(*status));
                    broadcast::broadcast(
                        session,
                        ConsumerEvent::StatusChange {
                            status: match status {
                                SessionStatus::Idle => SessionActivity::Idle,
                                SessionStatus::Running => SessionActivity::Running,
                                SessionStatus::Compacting => SessionActivity::Compacting,
                            },
                        },
                    );
                    if *status == SessionStatus::Idle {
                        self.release_queued_message(session).await;
                    }
                }
            }
            UnifiedPayload::StreamEvent { event } => {
                if msg.role == Role::Assistant && !msg.content.is_empty() {
                    let text = msg.text();
                    if !text.is_empty() {
                        session.append_passthrough_response(&text);
                    }
                    broadcast::broadcast(
                        session,
                        ConsumerEvent::Assistant {
                            content: msg.content.clone(),
                            metadata: msg.metadata.clone(),
                        },
                    );
                } else {
                    broadcast::broadcast(
                        session,
                        ConsumerEvent::StreamEvent {
                            event: event.clone(),
                        },
                    );
                }
            }
            UnifiedPayload::ToolProgress {
                tool_call_id,
                progress,
            } => {
                broadcast::broadcast(
                    session,
                    ConsumerEvent::ToolProgress {
                        tool_call_id: tool_call_id.clone(),
                        progress: progress.clone(),
                    },
                );
            }
            // Consumer-originated traffic flows to the backend.
            UnifiedPayload::UserMessage => {
                self.forward(session, msg.clone()).await;
            }
            UnifiedPayload::Interrupt => {
                self.forward(session, msg.clone()).await;
            }
            UnifiedPayload::PermissionResponse(response) => {
                if session.remove_permission(&response.request_id).is_none() {
                    tracing::debug!(
                        session_id = session.id(),
                        request_id = %response.request_id,
                        "permission_response for unknown request"
                    );
                    return;
                }
                broadcast::broadcast(
                    session,
                    ConsumerEvent::PermissionCancelled {
                        request_id: response.request_id.clone(),
                    },
                );
                self.forward(session, msg.clone()).await;
            }
            UnifiedPayload::ConfigurationChange { .. } => {
                self.forward(session, msg.clone()).await;
            }
            UnifiedPayload::ControlResponse { .. } => unreachable!("handled above"),
        }

        if changed && !matches!(msg.payload, UnifiedPayload::SessionInit(_)) {
            broadcast::broadcast(
                session,
                ConsumerEvent::SessionUpdate {
                    state: session.state(),
                },
            );
        }

        if critical_save {
            self.repo.save_sync(session);
        } else if changed {
            self.repo.save(session);
        }
    }

    /// Forward a consumer-originated message to the backend, or buffer user
    /// messages while it is away.
    async fn forward(&self, session: &Arc<Session>, msg: UnifiedMessage) {
        let Some(channel) = session.backend_channel() else {
            if matches!(msg.payload, UnifiedPayload::UserMessage) {
                session.push_pending_message(msg.text());
                self.repo.save(session);
            } else {
                tracing::debug!(
                    session_id = session.id(),
                    message_type = msg.type_name(),
                    "dropping message, backend not attached"
                );
            }
            return;
        };

        let is_user = matches!(msg.payload, UnifiedPayload::UserMessage);
        let text = is_user.then(|| msg.text());
        match channel.send(msg).await {
            Ok(()) => {}
            Err(Error::SessionClosed | Error::BackendDisconnected) => {
                if let Some(text) = text {
                    session.push_pending_message(text);
                    self.repo.save(session);
                }
            }
            Err(e) => {
                tracing::warn!(session_id = session.id(), error = %e, "backend send failed");
            }
        }
    }

    async fn release_queued_message(&self, session: &Arc<Session>) {
        let Some(queued) = session.take_queued_message() else {
            return;
        };
        broadcast::broadcast(session, ConsumerEvent::QueuedMessageCancelled);
        let mut msg = UnifiedMessage::user(queued.content);
        for image in queued.images {
            msg.content.push(bc_domain::message::ContentBlock::Image {
                media_type: "image/png".into(),
                data: image,
            });
        }
        self.forward(session, msg).await;
    }
}
