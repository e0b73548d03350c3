//! The slash command dispatch chain.
//!
//! Ordered handlers, first match wins: Local built-ins → adapter-native
//! executor → passthrough (forward as a user message, tag the echo back) →
//! unsupported (terminal error). Exactly one handler runs per dispatch.

use std::sync::Arc;
use std::time::Instant;

use bc_adapters::{AdapterResolver, BackendAdapter, BackendChannel};
use bc_domain::event::{DomainEvent, EventBus};
use bc_domain::message::UnifiedMessage;
use bc_protocol::ConsumerEvent;
use bc_sessions::session::PendingPassthrough;
use bc_sessions::Session;

use crate::broadcast;

pub struct SlashChain {
    resolver: Arc<AdapterResolver>,
    bus: EventBus,
}

impl SlashChain {
    pub fn new(resolver: Arc<AdapterResolver>, bus: EventBus) -> Self {
        Self { resolver, bus }
    }

    pub async fn dispatch(
        &self,
        session: &Arc<Session>,
        command: &str,
        request_id: Option<String>,
    ) {
        let started = Instant::now();

        // 1. Local built-ins.
        if let Some(content) = self.run_local(session, command) {
            self.succeed(
                session,
                command,
                request_id,
                content,
                "emulated",
                "local",
                started,
            );
            return;
        }

        // 2. Adapter-native executor.
        let adapter = self.resolver.resolve(&session.adapter_name()).ok();
        if let (Some(adapter), Some(channel)) = (&adapter, session.backend_channel()) {
            if let Some(executor) = adapter.slash_executor(channel) {
                if executor.handles(command) {
                    match executor.execute(command).await {
                        Ok(Some(outcome)) => {
                            self.succeed(
                                session,
                                command,
                                request_id,
                                outcome.content,
                                outcome.source,
                                "adapter-native",
                                started,
                            );
                            return;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            self.fail(session, command, request_id, e.to_string());
                            return;
                        }
                    }
                }
            }
        }

        // 3. Passthrough: forward to the backend as a user message; the
        //    router tags the echoed turn back via the FIFO.
        if let (Some(adapter), Some(channel)) = (&adapter, session.backend_channel()) {
            if adapter.capabilities().slash_commands {
                session.push_passthrough(PendingPassthrough {
                    command: command.to_string(),
                    request_id,
                    response: String::new(),
                });
                if let Err(e) = channel.send(UnifiedMessage::user(command)).await {
                    // Undo the reservation; the command never went out.
                    session.pop_passthrough();
                    self.fail(session, command, None, e.to_string());
                }
                return;
            }
        }

        // 4. Unsupported (terminal).
        self.fail(
            session,
            command,
            request_id,
            format!("command {command} is not supported by this backend"),
        );
    }

    fn run_local(&self, session: &Arc<Session>, command: &str) -> Option<String> {
        let name = command.split_whitespace().next().unwrap_or(command);
        match name {
            "/help" => Some(session.with_registry(|registry| {
                let mut lines = vec!["Available commands:".to_string()];
                for info in registry.list() {
                    match &info.description {
                        Some(description) => lines.push(format!("  {} — {}", info.name, description)),
                        None => lines.push(format!("  {}", info.name)),
                    }
                }
                lines.join("\n")
            })),
            _ => None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn succeed(
        &self,
        session: &Arc<Session>,
        command: &str,
        request_id: Option<String>,
        content: String,
        wire_source: &str,
        event_source: &str,
        started: Instant,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        broadcast::broadcast(
            session,
            ConsumerEvent::SlashCommandResult {
                command: command.to_string(),
                request_id,
                content,
                source: wire_source.to_string(),
                duration_ms,
            },
        );
        self.bus.emit(DomainEvent::SlashExecuted {
            session_id: session.id().to_string(),
            command: command.to_string(),
            duration_ms,
            source: event_source.to_string(),
        });
    }

    fn fail(
        &self,
        session: &Arc<Session>,
        command: &str,
        request_id: Option<String>,
        error: String,
    ) {
        broadcast::broadcast(
            session,
            ConsumerEvent::SlashCommandError {
                command: command.to_string(),
                request_id,
                error,
            },
        );
        self.bus.emit(DomainEvent::SlashFailed {
            session_id: session.id().to_string(),
            command: command.to_string(),
        });
    }
}
