//! Reconnect watchdog.
//!
//! On broker start, every session still in `starting` gets a grace timer.
//! If the backend has not (re)connected when it fires, the session is marked
//! and its CLI relaunched — gated by a count-based circuit breaker so a
//! crash-looping binary cannot spin the launcher. Any qualifying domain
//! event clears the session's watchdog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use bc_domain::event::{DomainEvent, EventBus};
use bc_domain::trace::TraceEvent;
use bc_protocol::{ConsumerEvent, SessionActivity};
use bc_sessions::{Session, SessionPhase, SessionRepository};

use crate::breaker::CircuitBreaker;
use crate::broadcast;
use crate::launcher::Launcher;

const BREAKER_FAILURES: u32 = 3;
const BREAKER_RECOVERY: Duration = Duration::from_secs(60);

pub struct ReconnectPolicy {
    repo: Arc<SessionRepository>,
    launcher: Arc<Launcher>,
    bus: EventBus,
    grace: Duration,
    breaker: Mutex<CircuitBreaker>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ReconnectPolicy {
    pub fn new(
        repo: Arc<SessionRepository>,
        launcher: Arc<Launcher>,
        bus: EventBus,
        grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            launcher,
            bus,
            grace,
            breaker: Mutex::new(CircuitBreaker::new(BREAKER_FAILURES, BREAKER_RECOVERY)),
            timers: Mutex::new(HashMap::new()),
        })
    }

    pub fn start(self: Arc<Self>) {
        // Arm a watchdog for every session waiting on its backend.
        for session in self.repo.list() {
            if session.phase() == SessionPhase::Starting && !session.is_archived() {
                self.clone().arm(session);
            }
        }

        // Qualifying events clear the watchdog.
        let policy = self.clone();
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    DomainEvent::ProcessConnected { session_id }
                    | DomainEvent::BackendConnected { session_id }
                    | DomainEvent::SessionClosed { session_id } => {
                        policy.clear(&session_id);
                    }
                    _ => {}
                }
            }
        });
    }

    pub fn arm(self: Arc<Self>, session: Arc<Session>) {
        broadcast::broadcast(
            &session,
            ConsumerEvent::StatusChange {
                status: SessionActivity::Watchdog,
            },
        );

        let session_id = session.id().to_string();
        let policy = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(policy.grace).await;
            policy.timers.lock().remove(session.id());
            if session.phase() != SessionPhase::Starting {
                return;
            }
            policy.fire(&session);
        });

        let mut timers = self.timers.lock();
        if let Some(previous) = timers.insert(session_id, timer) {
            previous.abort();
        }
    }

    fn fire(&self, session: &Arc<Session>) {
        broadcast::broadcast(
            session,
            ConsumerEvent::Error {
                kind: "reconnect_timeout".into(),
                message: "backend did not reconnect within the grace period".into(),
            },
        );

        let mut relaunched = false;
        if !session.is_archived() {
            if self.breaker.lock().allow() {
                match self.launcher.spawn_for_session(session, None) {
                    Ok(pid) => {
                        tracing::info!(session_id = session.id(), pid, "relaunched backend");
                        self.breaker.lock().record_success();
                        relaunched = true;
                    }
                    Err(e) => {
                        // Relaunch errors are logged, never propagated.
                        tracing::warn!(session_id = session.id(), error = %e, "relaunch failed");
                        self.breaker.lock().record_failure();
                    }
                }
            } else {
                tracing::warn!(
                    session_id = session.id(),
                    "relaunch suppressed by circuit breaker"
                );
            }
        }

        TraceEvent::WatchdogFired {
            session_id: session.id().to_string(),
            relaunched,
        }
        .emit();
    }

    fn clear(&self, session_id: &str) {
        if let Some(timer) = self.timers.lock().remove(session_id) {
            timer.abort();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.timers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{ManagedChild, ProcessManager, SpawnSpec};
    use bc_domain::config::LauncherConfig;
    use bc_sessions::{FileSessionStorage, SessionLimits};

    struct NeverChild;

    #[async_trait::async_trait]
    impl ManagedChild for NeverChild {
        fn pid(&self) -> Option<u32> {
            Some(1)
        }
        async fn wait(&mut self) -> Option<i32> {
            std::future::pending().await
        }
        fn terminate(&mut self) {}
        fn force_kill(&mut self) {}
    }

    struct CountingManager {
        spawns: Arc<Mutex<usize>>,
    }

    impl ProcessManager for CountingManager {
        fn spawn(&self, _spec: &SpawnSpec) -> bc_domain::Result<Box<dyn ManagedChild>> {
            *self.spawns.lock() += 1;
            Ok(Box::new(NeverChild))
        }
        fn is_alive(&self, _pid: u32) -> bool {
            true
        }
    }

    struct Fixture {
        policy: Arc<ReconnectPolicy>,
        repo: Arc<SessionRepository>,
        bus: EventBus,
        spawns: Arc<Mutex<usize>>,
        _dir: tempfile::TempDir,
    }

    fn fixture(grace: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileSessionStorage::new(dir.path().join("sessions")).unwrap());
        let repo = Arc::new(SessionRepository::new(storage, Duration::from_millis(50)));
        let bus = EventBus::new();
        let spawns = Arc::new(Mutex::new(0));
        let launcher = Arc::new(Launcher::new(
            Arc::new(CountingManager {
                spawns: spawns.clone(),
            }),
            LauncherConfig::default(),
            Duration::from_millis(100),
            dir.path(),
            bus.clone(),
        ));
        let policy = ReconnectPolicy::new(repo.clone(), launcher, bus.clone(), grace);
        Fixture {
            policy,
            repo,
            bus,
            spawns,
            _dir: dir,
        }
    }

    fn starting_session(repo: &SessionRepository, id: &str) -> Arc<Session> {
        let session = Arc::new(Session::new(id, "claude", SessionLimits::default()));
        repo.insert(session.clone());
        session
    }

    #[tokio::test(start_paused = true)]
    async fn fires_and_relaunches_after_grace() {
        let f = fixture(Duration::from_millis(500));
        let session = starting_session(&f.repo, "123e4567-e89b-42d3-a456-426614174000");
        f.policy.clone().start();
        assert_eq!(f.policy.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;

        assert_eq!(*f.spawns.lock(), 1);
        assert_eq!(f.policy.pending_count(), 0);
        assert_eq!(session.phase(), SessionPhase::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn qualifying_event_clears_the_watchdog() {
        let f = fixture(Duration::from_millis(500));
        let session = starting_session(&f.repo, "123e4567-e89b-42d3-a456-426614174000");
        f.policy.clone().start();

        f.bus.emit(bc_domain::event::DomainEvent::BackendConnected {
            session_id: session.id().to_string(),
        });
        // Let the listener process the event.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;

        assert_eq!(*f.spawns.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn running_sessions_do_not_fire() {
        let f = fixture(Duration::from_millis(100));
        let session = starting_session(&f.repo, "123e4567-e89b-42d3-a456-426614174000");
        f.policy.clone().start();
        session.set_phase(SessionPhase::Running);

        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert_eq!(*f.spawns.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn archived_sessions_are_marked_but_not_relaunched() {
        let f = fixture(Duration::from_millis(100));
        let session = starting_session(&f.repo, "123e4567-e89b-42d3-a456-426614174000");
        session.set_archived(true);
        f.policy.clone().arm(session);

        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert_eq!(*f.spawns.lock(), 0);
    }
}
