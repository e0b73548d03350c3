//! Backend connector: opens an adapter session for a `Session` and pumps
//! its inbound stream into the router.
//!
//! Exactly one pump task runs per attached backend. Cancellation (via the
//! session's token) ends the pump within one iteration; transport loss ends
//! it after the adapter's synthetic failure result. Deliberate disconnects
//! take the backend handle first, so the pump teardown can tell the two
//! apart.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bc_adapters::{AdapterResolver, BackendAdapter, BackendChannel, ConnectOptions};
use bc_domain::error::{Error, Result};
use bc_domain::event::{DomainEvent, EventBus};
use bc_domain::message::UnifiedMessage;
use bc_domain::trace::TraceEvent;
use bc_protocol::ConsumerEvent;
use bc_sessions::session::BackendHandle;
use bc_sessions::{Session, SessionPhase, SessionRepository};

use crate::broadcast;
use crate::capabilities::CapabilitiesPolicy;
use crate::router::MessageRouter;

pub struct BackendConnector {
    resolver: Arc<AdapterResolver>,
    router: Arc<MessageRouter>,
    capabilities: Arc<CapabilitiesPolicy>,
    repo: Arc<SessionRepository>,
    bus: EventBus,
    kill_grace: Duration,
}

impl BackendConnector {
    pub fn new(
        resolver: Arc<AdapterResolver>,
        router: Arc<MessageRouter>,
        capabilities: Arc<CapabilitiesPolicy>,
        repo: Arc<SessionRepository>,
        bus: EventBus,
        kill_grace: Duration,
    ) -> Self {
        Self {
            resolver,
            router,
            capabilities,
            repo,
            bus,
            kill_grace,
        }
    }

    /// Open the adapter session and start the inbound pump. On failure
    /// nothing is registered on the session.
    pub async fn connect(&self, session: &Arc<Session>) -> Result<()> {
        if session.has_backend() {
            return Ok(());
        }

        let adapter_name = session.adapter_name();
        let adapter = self.resolver.resolve(&adapter_name)?;

        let mut opts = ConnectOptions::new(session.id());
        opts.resume = session.current_seq() > 0;
        opts.cwd = session.state().cwd.map(PathBuf::from);

        let backend = adapter.connect(opts).await?;
        if backend.session_id != session.id() {
            backend.channel.close().await;
            return Err(Error::ConnectFailed {
                adapter: adapter_name,
                message: format!(
                    "adapter returned session {} for {}",
                    backend.session_id,
                    session.id()
                ),
            });
        }

        let cancel = CancellationToken::new();
        let channel = backend.channel.clone();
        session.set_backend(BackendHandle::new(channel.clone(), cancel.clone()));
        session.set_phase(SessionPhase::Running);

        TraceEvent::BackendConnected {
            session_id: session.id().to_string(),
            adapter: adapter_name,
        }
        .emit();
        self.bus.emit(DomainEvent::BackendConnected {
            session_id: session.id().to_string(),
        });
        broadcast::broadcast(session, ConsumerEvent::CliConnected);

        // Flush messages buffered while the backend was away.
        for content in session.drain_pending_messages() {
            if let Err(e) = channel.send(UnifiedMessage::user(content)).await {
                tracing::warn!(session_id = session.id(), error = %e, "pending message flush failed");
                break;
            }
        }

        self.capabilities.send_initialize(session).await;

        let pump = tokio::spawn(pump(
            session.clone(),
            backend.messages,
            cancel,
            self.router.clone(),
            self.capabilities.clone(),
            self.repo.clone(),
            self.bus.clone(),
        ));
        session.set_backend_pump(pump);

        Ok(())
    }

    /// Deliberate disconnect: cancel the pump, await it up to the kill
    /// grace period, close the channel.
    pub async fn disconnect(&self, session: &Arc<Session>) {
        let Some(handle) = session.take_backend() else {
            return;
        };
        handle.cancel.cancel();
        let pump = handle.pump.lock().take();
        if let Some(pump) = pump {
            if tokio::time::timeout(self.kill_grace, pump).await.is_err() {
                tracing::warn!(session_id = session.id(), "backend pump did not stop in time");
            }
        }
        handle.channel.close().await;

        self.capabilities.cancel(session);
        TraceEvent::BackendDisconnected {
            session_id: session.id().to_string(),
        }
        .emit();
        self.bus.emit(DomainEvent::BackendDisconnected {
            session_id: session.id().to_string(),
        });
        broadcast::broadcast(session, ConsumerEvent::CliDisconnected);
    }
}

/// Iterate the adapter's finite message stream in emission order.
async fn pump(
    session: Arc<Session>,
    mut messages: mpsc::Receiver<UnifiedMessage>,
    cancel: CancellationToken,
    router: Arc<MessageRouter>,
    capabilities: Arc<CapabilitiesPolicy>,
    repo: Arc<SessionRepository>,
    bus: EventBus,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = messages.recv() => match msg {
                Some(msg) => router.route(&session, msg).await,
                None => break,
            },
        }
    }

    // If the handle is still registered this was transport loss, not a
    // deliberate disconnect.
    if session.take_backend().is_none() || session.is_closed() {
        return;
    }
    session.set_phase(SessionPhase::Starting);
    capabilities.cancel(&session);

    // Outstanding permission requests cannot be answered any more.
    for permission in session.drain_permissions() {
        broadcast::broadcast(
            &session,
            ConsumerEvent::PermissionCancelled {
                request_id: permission.request_id,
            },
        );
    }

    TraceEvent::BackendDisconnected {
        session_id: session.id().to_string(),
    }
    .emit();
    bus.emit(DomainEvent::BackendDisconnected {
        session_id: session.id().to_string(),
    });
    broadcast::broadcast(&session, ConsumerEvent::CliDisconnected);
    repo.save_sync(&session);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bc_adapters::rendezvous::CliSocket;
    use bc_adapters::BackendAdapter;
    use bc_domain::config::{BackendConfig, LauncherConfig};
    use bc_sessions::{ConsumerIdentity, FileSessionStorage, SessionLimits};
    use serde_json::json;

    struct Fixture {
        connector: BackendConnector,
        resolver: Arc<AdapterResolver>,
        session: Arc<Session>,
        bus: EventBus,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileSessionStorage::new(dir.path().to_path_buf()).unwrap());
        let repo = Arc::new(SessionRepository::new(storage, Duration::from_millis(50)));
        let bus = EventBus::new();
        let resolver = Arc::new(AdapterResolver::new(
            &BackendConfig::default(),
            &LauncherConfig::default(),
        ));
        let capabilities = Arc::new(CapabilitiesPolicy::new(bus.clone(), Duration::from_secs(5)));
        let router = Arc::new(MessageRouter::new(repo.clone(), capabilities.clone()));
        let session = Arc::new(Session::new(
            "123e4567-e89b-42d3-a456-426614174000",
            "claude",
            SessionLimits::default(),
        ));
        repo.insert(session.clone());

        Fixture {
            connector: BackendConnector::new(
                resolver.clone(),
                router,
                capabilities,
                repo,
                bus.clone(),
                Duration::from_millis(500),
            ),
            resolver,
            session,
            bus,
            _dir: dir,
        }
    }

    /// Connect through the real inverted adapter by delivering a fake CLI
    /// socket, and return its line channels.
    async fn attach(f: &Fixture) -> (mpsc::Receiver<String>, mpsc::Sender<String>) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);

        let connector_session = f.session.clone();
        let connector = async { f.connector.connect(&connector_session).await };
        tokio::pin!(connector);

        let claude = f.resolver.claude();
        let delivered = tokio::select! {
            result = &mut connector => panic!("connect finished early: {result:?}"),
            delivered = async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                claude.deliver_socket(f.session.id(), CliSocket {
                    outgoing: out_tx,
                    incoming: in_rx,
                })
            } => delivered,
        };
        assert!(delivered);
        connector.await.unwrap();
        (out_rx, in_tx)
    }

    #[tokio::test]
    async fn connect_attaches_backend_and_flushes_pending() {
        let f = fixture();
        let (_, consumer) = f.session.add_consumer(ConsumerIdentity::anonymous(1));
        f.session.push_pending_message("buffered hello".into());

        let (mut out_rx, _in_tx) = attach(&f).await;

        assert!(f.session.has_backend());
        assert_eq!(f.session.phase(), SessionPhase::Running);

        // Consumers heard cli_connected.
        let frames = consumer.queue.drain(10);
        assert!(frames
            .iter()
            .any(|frame| frame.payload.type_name() == "cli_connected"));

        // The buffered message went out, then the initialize request.
        let first = out_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(value["type"], "user");
        let second = out_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&second).unwrap();
        assert_eq!(value["request"]["subtype"], "initialize");
        assert_eq!(f.session.pending_message_count(), 0);
    }

    #[tokio::test]
    async fn transport_loss_detaches_and_notifies() {
        let f = fixture();
        let mut events = f.bus.subscribe();
        let (_out_rx, in_tx) = attach(&f).await;
        let (_, consumer) = f.session.add_consumer(ConsumerIdentity::anonymous(1));

        // Drain connect-time events.
        while let Ok(event) = events.try_recv() {
            let _ = event;
        }

        // CLI hangs up.
        in_tx
            .send(json!({"type": "system", "subtype": "init", "session_id": "c1"}).to_string())
            .await
            .unwrap();
        drop(in_tx);

        // The pump ends with backend:disconnected.
        let mut saw_disconnect = false;
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
                Ok(Ok(event)) if event.key() == "backend:disconnected" => {
                    saw_disconnect = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_disconnect);
        assert!(!f.session.has_backend());
        assert_eq!(f.session.phase(), SessionPhase::Starting);

        let frames = consumer.queue.drain(100);
        assert!(frames
            .iter()
            .any(|frame| frame.payload.type_name() == "cli_disconnected"));
    }

    #[tokio::test]
    async fn deliberate_disconnect_is_quiet_on_the_pump_side() {
        let f = fixture();
        let (_out_rx, _in_tx) = attach(&f).await;

        f.connector.disconnect(&f.session).await;
        assert!(!f.session.has_backend());

        // Idempotent.
        f.connector.disconnect(&f.session).await;
    }

    #[tokio::test]
    async fn connect_is_a_noop_with_backend_attached() {
        let f = fixture();
        let (_out_rx, _in_tx) = attach(&f).await;
        // Second connect returns immediately without a new rendezvous.
        f.connector.connect(&f.session).await.unwrap();
    }

    #[tokio::test]
    async fn connect_failure_leaves_session_clean() {
        let f = fixture();
        f.session.set_adapter_name("definitely-unknown");
        let err = f.connector.connect(&f.session).await.unwrap_err();
        assert_eq!(err.kind(), "connect_failed");
        assert!(!f.session.has_backend());
        assert_eq!(f.session.phase(), SessionPhase::Starting);
    }
}
