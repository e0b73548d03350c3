//! The session coordinator: composition root and lifecycle owner.

use std::sync::Arc;
use std::time::Duration;

use bc_adapters::{registry, AdapterResolver};
use bc_domain::config::Config;
use bc_domain::error::{Error, Result};
use bc_domain::event::{DomainEvent, EventBus};
use bc_domain::trace::TraceEvent;
use bc_protocol::ConsumerEvent;
use bc_sessions::{
    session_id, ClosedReason, FileSessionStorage, Session, SessionLimits, SessionPhase,
    SessionRepository,
};

use crate::broadcast;
use crate::capabilities::CapabilitiesPolicy;
use crate::connector::BackendConnector;
use crate::idle::IdlePolicy;
use crate::launcher::{Launcher, TokioProcessManager};
use crate::router::MessageRouter;
use crate::slash::SlashChain;
use crate::watchdog::ReconnectPolicy;

#[derive(Debug, Clone, Default)]
pub struct CreateSessionParams {
    pub adapter: Option<String>,
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub claude_binary: Option<String>,
}

pub struct Coordinator {
    config: Arc<Config>,
    pub repo: Arc<SessionRepository>,
    pub resolver: Arc<AdapterResolver>,
    pub router: Arc<MessageRouter>,
    pub connector: Arc<BackendConnector>,
    pub capabilities: Arc<CapabilitiesPolicy>,
    pub slash: Arc<SlashChain>,
    pub launcher: Arc<Launcher>,
    pub bus: EventBus,
    limits: SessionLimits,
}

impl Coordinator {
    pub fn new(config: Arc<Config>) -> Result<Arc<Self>> {
        Self::with_process_manager(config, Arc::new(TokioProcessManager))
    }

    /// Construction with an explicit process manager (tests inject fakes).
    pub fn with_process_manager(
        config: Arc<Config>,
        process_manager: Arc<dyn crate::launcher::ProcessManager>,
    ) -> Result<Arc<Self>> {
        let bus = EventBus::new();
        let storage = Arc::new(FileSessionStorage::new(
            config.storage.data_dir.join("sessions"),
        )?);
        let repo = Arc::new(SessionRepository::new(
            storage,
            Duration::from_millis(config.sessions.save_debounce_ms),
        ));
        let resolver = Arc::new(AdapterResolver::new(&config.backend, &config.launcher));
        let capabilities = Arc::new(CapabilitiesPolicy::new(
            bus.clone(),
            Duration::from_millis(config.backend.initialize_timeout_ms),
        ));
        let router = Arc::new(MessageRouter::new(repo.clone(), capabilities.clone()));
        let connector = Arc::new(BackendConnector::new(
            resolver.clone(),
            router.clone(),
            capabilities.clone(),
            repo.clone(),
            bus.clone(),
            Duration::from_millis(config.backend.kill_grace_ms),
        ));
        let slash = Arc::new(SlashChain::new(resolver.clone(), bus.clone()));
        let launcher = Arc::new(Launcher::new(
            process_manager,
            config.launcher.clone(),
            Duration::from_millis(config.backend.kill_grace_ms),
            &config.storage.data_dir,
            bus.clone(),
        ));

        let limits = SessionLimits {
            max_history: config.sessions.max_message_history,
            initial_replay: config.sessions.initial_replay_count,
            pending_message_max: config.sessions.pending_message_queue_max,
            high_water_mark: config.consumer.high_water_mark,
            max_queue_size: config.consumer.max_queue_size,
            rate_burst: config.consumer.rate_limit.burst_size,
            rate_refill_per_sec: config.consumer.rate_limit.refill_per_sec,
        };

        Ok(Arc::new(Self {
            config,
            repo,
            resolver,
            router,
            connector,
            capabilities,
            slash,
            launcher,
            bus,
            limits,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Restore persisted state and start the control loops. The HTTP/WS
    /// server is bound by the caller (it owns the listener).
    pub fn start(self: &Arc<Self>) {
        let restored = self.repo.restore_all(&self.limits);
        tracing::info!(restored, "session repository ready");
        self.launcher.restore();

        ReconnectPolicy::new(
            self.repo.clone(),
            self.launcher.clone(),
            self.bus.clone(),
            Duration::from_millis(self.config.backend.reconnect_grace_ms),
        )
        .start();

        IdlePolicy::new(
            self.clone(),
            Duration::from_millis(self.config.sessions.idle_timeout_ms),
        )
        .start();
    }

    /// Close every session (process shutdown).
    pub async fn stop(&self) {
        for session in self.repo.list() {
            if let Err(e) = self.close_session(session.id(), "shutdown").await {
                tracing::warn!(session_id = session.id(), error = %e, "close on shutdown failed");
            }
        }
    }

    // ── Session lifecycle ────────────────────────────────────────────

    /// Explicit creation (daemon API).
    pub fn create_session(&self, params: CreateSessionParams) -> Result<Arc<Session>> {
        if self.repo.len() >= self.config.sessions.max_sessions {
            return Err(Error::MaxSessionsReached {
                limit: self.config.sessions.max_sessions,
            });
        }

        let requested = params
            .adapter
            .as_deref()
            .unwrap_or_else(|| self.resolver.default_name());
        let adapter = registry::canonical(requested)
            .ok_or_else(|| Error::SchemaViolation(format!("unknown adapter {requested:?}")))?;

        let id = session_id::generate();
        let session = Arc::new(Session::new(&id, adapter, self.limits.clone()));
        session.update_state(|state, _| {
            let mut next = state.clone();
            next.cwd = params.cwd.clone();
            next.model = params.model.clone();
            next.permission_mode = params.permission_mode.clone();
            (next != *state).then_some(next)
        });

        self.repo.insert(session.clone());
        self.repo.save_sync(&session);
        TraceEvent::SessionCreated {
            session_id: id.clone(),
            adapter: adapter.to_string(),
        }
        .emit();
        self.bus.emit(DomainEvent::SessionCreated {
            session_id: id.clone(),
        });

        if adapter == "claude" {
            // Inverted: spawn the CLI, which dials back into /ws/cli/<id>.
            if let Err(e) = self
                .launcher
                .spawn_for_session(&session, params.claude_binary.as_deref())
            {
                self.repo.remove(&id);
                return Err(e);
            }
        } else {
            // Dial-out adapters connect in the background.
            let connector = self.connector.clone();
            let connect_session = session.clone();
            tokio::spawn(async move {
                if let Err(e) = connector.connect(&connect_session).await {
                    tracing::warn!(
                        session_id = connect_session.id(),
                        error = %e,
                        "backend connect failed"
                    );
                    broadcast::broadcast(
                        &connect_session,
                        ConsumerEvent::from_error(&e),
                    );
                }
            });
        }

        Ok(session)
    }

    /// Implicit creation: a consumer referenced a session id we don't have.
    pub fn get_or_create_for_consumer(&self, id: &str) -> Result<Arc<Session>> {
        if let Some(session) = self.repo.get(id) {
            if session.is_closed() {
                return Err(Error::SessionClosed);
            }
            return Ok(session);
        }
        if self.repo.len() >= self.config.sessions.max_sessions {
            return Err(Error::MaxSessionsReached {
                limit: self.config.sessions.max_sessions,
            });
        }

        let default_adapter = self.resolver.default_name().to_string();
        let limits = self.limits.clone();
        let (session, created) =
            self.repo
                .get_or_create(id, || Session::new(id, default_adapter.clone(), limits));
        if created {
            self.repo.save_sync(&session);
            TraceEvent::SessionCreated {
                session_id: id.to_string(),
                adapter: default_adapter,
            }
            .emit();
            self.bus.emit(DomainEvent::SessionCreated {
                session_id: id.to_string(),
            });
        }
        Ok(session)
    }

    pub async fn connect_backend(&self, session: &Arc<Session>) -> Result<()> {
        self.connector.connect(session).await
    }

    /// Graceful close: backend teardown, consumer sockets closed with
    /// "going away", removal from map and disk.
    pub async fn close_session(&self, id: &str, reason: &str) -> Result<()> {
        let session = self
            .repo
            .get(id)
            .ok_or_else(|| Error::UnknownSession(id.to_string()))?;

        session.set_phase(SessionPhase::Closed);
        self.capabilities.cancel(&session);

        for permission in session.drain_permissions() {
            broadcast::broadcast(
                &session,
                ConsumerEvent::PermissionCancelled {
                    request_id: permission.request_id,
                },
            );
        }

        self.connector.disconnect(&session).await;
        self.launcher.kill(id).await;

        for (consumer_id, handle) in session.consumers() {
            handle.queue.close(ClosedReason::Shutdown);
            session.remove_consumer(consumer_id);
        }

        self.repo.remove(id);
        TraceEvent::SessionClosed {
            session_id: id.to_string(),
            reason: reason.to_string(),
        }
        .emit();
        self.bus.emit(DomainEvent::SessionClosed {
            session_id: id.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bc_domain::config::Config;

    fn coordinator() -> (tempfile::TempDir, Arc<Coordinator>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.sessions.max_sessions = 2;
        (dir, Coordinator::new(Arc::new(config)).unwrap())
    }

    #[tokio::test]
    async fn implicit_creation_is_idempotent_and_capped() {
        let (_dir, coordinator) = coordinator();
        let a = "123e4567-e89b-42d3-a456-426614174000";
        let b = "223e4567-e89b-42d3-a456-426614174000";
        let c = "323e4567-e89b-42d3-a456-426614174000";

        let first = coordinator.get_or_create_for_consumer(a).unwrap();
        let again = coordinator.get_or_create_for_consumer(a).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.adapter_name(), "claude");

        coordinator.get_or_create_for_consumer(b).unwrap();
        let err = coordinator.get_or_create_for_consumer(c).unwrap_err();
        assert_eq!(err.kind(), "max_sessions_reached");
    }

    #[tokio::test]
    async fn create_session_rejects_unknown_adapter() {
        let (_dir, coordinator) = coordinator();
        let err = coordinator
            .create_session(CreateSessionParams {
                adapter: Some("vim".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), "schema_violation");
        assert!(coordinator.repo.is_empty());
    }

    #[tokio::test]
    async fn close_session_removes_map_and_disk() {
        let (dir, coordinator) = coordinator();
        let id = "123e4567-e89b-42d3-a456-426614174000";
        let session = coordinator.get_or_create_for_consumer(id).unwrap();
        assert!(dir
            .path()
            .join("sessions")
            .join(format!("{id}.json"))
            .exists());

        coordinator.close_session(id, "test").await.unwrap();
        assert!(coordinator.repo.get(id).is_none());
        assert!(!dir
            .path()
            .join("sessions")
            .join(format!("{id}.json"))
            .exists());
        assert!(session.is_closed());

        let err = coordinator.close_session(id, "test").await.unwrap_err();
        assert_eq!(err.kind(), "unknown_session");
    }
}
