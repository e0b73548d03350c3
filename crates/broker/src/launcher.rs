//! Process supervision for CLI backends the broker launches itself.
//!
//! The launcher spawns the inverted `claude` CLI pointed back at our
//! `/ws/cli/<session>` endpoint, tracks per-session spawn metadata in
//! `launcher.json` (atomic writes), and surfaces `process:exited` events.
//! Kill is SIGTERM first, SIGKILL after the grace period.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use bc_domain::config::LauncherConfig;
use bc_domain::error::{Error, Result};
use bc_domain::event::{DomainEvent, EventBus};
use bc_domain::trace::TraceEvent;
use bc_sessions::Session;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process manager abstraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub binary: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

#[async_trait::async_trait]
pub trait ManagedChild: Send {
    fn pid(&self) -> Option<u32>;
    /// Wait for exit; cancel-safe.
    async fn wait(&mut self) -> Option<i32>;
    /// Graceful termination (SIGTERM).
    fn terminate(&mut self);
    /// Hard kill (SIGKILL).
    fn force_kill(&mut self);
}

pub trait ProcessManager: Send + Sync {
    fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn ManagedChild>>;
    fn is_alive(&self, pid: u32) -> bool;
}

pub struct TokioProcessManager;

struct TokioChild {
    child: tokio::process::Child,
}

#[async_trait::async_trait]
impl ManagedChild for TokioChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Option<i32> {
        self.child.wait().await.ok().and_then(|status| status.code())
    }

    fn terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            signal_pid(pid, nix::sys::signal::Signal::SIGTERM);
        }
    }

    fn force_kill(&mut self) {
        let _ = self.child.start_kill();
    }
}

impl ProcessManager for TokioProcessManager {
    fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn ManagedChild>> {
        let mut cmd = tokio::process::Command::new(&spec.binary);
        cmd.args(&spec.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        let child = cmd.spawn().map_err(|e| Error::ConnectFailed {
            adapter: "claude".into(),
            message: format!("spawn {}: {e}", spec.binary),
        })?;
        Ok(Box::new(TokioChild { child }))
    }

    fn is_alive(&self, pid: u32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }
}

fn signal_pid(pid: u32, signal: nix::sys::signal::Signal) {
    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Launcher state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LauncherEntry {
    binary: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    pid: u32,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LauncherState {
    sessions: HashMap<String, LauncherEntry>,
}

struct ChildSlot {
    entry: LauncherEntry,
    /// `None` for children adopted from a previous broker run.
    kill_tx: Option<mpsc::Sender<()>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Launcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Launcher {
    manager: Arc<dyn ProcessManager>,
    config: LauncherConfig,
    kill_grace: Duration,
    state_path: PathBuf,
    bus: EventBus,
    /// Set once the server has bound; dial-back URLs need the real port.
    port: AtomicU16,
    children: Arc<Mutex<HashMap<String, ChildSlot>>>,
}

impl Launcher {
    pub fn new(
        manager: Arc<dyn ProcessManager>,
        config: LauncherConfig,
        kill_grace: Duration,
        data_dir: &std::path::Path,
        bus: EventBus,
    ) -> Self {
        Self {
            manager,
            config,
            kill_grace,
            state_path: data_dir.join("launcher.json"),
            bus,
            port: AtomicU16::new(0),
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }

    pub fn pid_for(&self, session_id: &str) -> Option<u32> {
        self.children.lock().get(session_id).map(|c| c.entry.pid)
    }

    /// Adopt children recorded by a previous run; dead pids are dropped.
    pub fn restore(&self) {
        let Ok(raw) = std::fs::read_to_string(&self.state_path) else {
            return;
        };
        let Ok(state) = serde_json::from_str::<LauncherState>(&raw) else {
            tracing::warn!(path = %self.state_path.display(), "unreadable launcher state");
            return;
        };

        let mut children = self.children.lock();
        for (session_id, entry) in state.sessions {
            if self.manager.is_alive(entry.pid) {
                tracing::info!(session_id = %session_id, pid = entry.pid, "adopted running backend");
                children.insert(
                    session_id,
                    ChildSlot {
                        entry,
                        kill_tx: None,
                    },
                );
            }
        }
        drop(children);
        self.persist();
    }

    /// Spawn (or respawn) the CLI child for an inverted session.
    pub fn spawn_for_session(
        &self,
        session: &Session,
        binary_override: Option<&str>,
    ) -> Result<u32> {
        if session.adapter_name() != "claude" {
            return Err(Error::Unsupported(
                "launcher only manages inverted CLI backends",
            ));
        }

        let session_id = session.id().to_string();
        let binary = binary_override
            .map(str::to_string)
            .or_else(|| {
                // Relaunches reuse the recorded binary.
                self.children
                    .lock()
                    .get(&session_id)
                    .map(|c| c.entry.binary.clone())
            })
            .unwrap_or_else(|| self.config.claude_binary.clone());

        let port = self.port.load(Ordering::Relaxed);
        let spec = SpawnSpec {
            binary: binary.clone(),
            args: vec![
                "--session-id".into(),
                session_id.clone(),
                "--broker-url".into(),
                format!("ws://127.0.0.1:{port}/ws/cli/{session_id}"),
            ],
            cwd: session.state().cwd.map(PathBuf::from),
        };

        let mut child = self.manager.spawn(&spec)?;
        let pid = child.pid().unwrap_or(0);
        TraceEvent::ProcessSpawned {
            session_id: session_id.clone(),
            pid,
        }
        .emit();

        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        self.children.lock().insert(
            session_id.clone(),
            ChildSlot {
                entry: LauncherEntry {
                    binary,
                    args: spec.args.clone(),
                    cwd: spec.cwd.clone(),
                    pid,
                    started_at: Utc::now(),
                },
                kill_tx: Some(kill_tx),
            },
        );
        self.persist();

        // Monitor: reap on exit, or kill on request (TERM, grace, KILL).
        let children = self.children.clone();
        let state_path = self.state_path.clone();
        let bus = self.bus.clone();
        let kill_grace = self.kill_grace;
        let monitor_session = session_id.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            // Race exit against a kill request; the wait future is dropped
            // before the kill path touches the child again.
            let natural_exit = tokio::select! {
                _ = kill_rx.recv() => None,
                code = child.wait() => Some(code),
            };
            let exit_code = match natural_exit {
                Some(code) => code,
                None => {
                    child.terminate();
                    match tokio::time::timeout(kill_grace, child.wait()).await {
                        Ok(code) => {
                            TraceEvent::ProcessKilled {
                                session_id: monitor_session.clone(),
                                pid,
                                forced: false,
                            }
                            .emit();
                            code
                        }
                        Err(_) => {
                            child.force_kill();
                            TraceEvent::ProcessKilled {
                                session_id: monitor_session.clone(),
                                pid,
                                forced: true,
                            }
                            .emit();
                            child.wait().await
                        }
                    }
                }
            };

            children.lock().remove(&monitor_session);
            persist_state(&state_path, &children.lock());
            bus.emit(DomainEvent::ProcessExited {
                session_id: monitor_session,
                exit_code,
                uptime_ms: started.elapsed().as_millis() as u64,
            });
        });

        Ok(pid)
    }

    /// Kill the session's child, if any. Returns whether one existed.
    pub async fn kill(&self, session_id: &str) -> bool {
        let slot = {
            let children = self.children.lock();
            children
                .get(session_id)
                .map(|c| (c.entry.pid, c.kill_tx.clone()))
        };
        match slot {
            Some((_, Some(kill_tx))) => {
                let _ = kill_tx.send(()).await;
                true
            }
            Some((pid, None)) => {
                // Adopted child from a previous run: signal it directly.
                signal_pid(pid, nix::sys::signal::Signal::SIGTERM);
                let manager = self.manager.clone();
                let kill_grace = self.kill_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(kill_grace).await;
                    if manager.is_alive(pid) {
                        signal_pid(pid, nix::sys::signal::Signal::SIGKILL);
                    }
                });
                self.children.lock().remove(session_id);
                self.persist();
                true
            }
            None => false,
        }
    }

    fn persist(&self) {
        persist_state(&self.state_path, &self.children.lock());
    }
}

fn persist_state(path: &std::path::Path, children: &HashMap<String, ChildSlot>) {
    let state = LauncherState {
        sessions: children
            .iter()
            .map(|(id, slot)| (id.clone(), slot.entry.clone()))
            .collect(),
    };
    let result = (|| -> Result<()> {
        let json = serde_json::to_vec_pretty(&state)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    })();
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "failed to persist launcher state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bc_sessions::SessionLimits;
    use parking_lot::Mutex as PMutex;

    struct FakeChild {
        pid: u32,
        exit_rx: Option<tokio::sync::oneshot::Receiver<i32>>,
        terminated: Arc<PMutex<bool>>,
    }

    #[async_trait::async_trait]
    impl ManagedChild for FakeChild {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }
        async fn wait(&mut self) -> Option<i32> {
            match self.exit_rx.take() {
                Some(rx) => rx.await.ok(),
                None => None,
            }
        }
        fn terminate(&mut self) {
            *self.terminated.lock() = true;
        }
        fn force_kill(&mut self) {}
    }

    struct FakeManager {
        exits: PMutex<Vec<tokio::sync::oneshot::Sender<i32>>>,
        terminated: Arc<PMutex<bool>>,
    }

    impl ProcessManager for FakeManager {
        fn spawn(&self, _spec: &SpawnSpec) -> Result<Box<dyn ManagedChild>> {
            let (tx, rx) = tokio::sync::oneshot::channel();
            self.exits.lock().push(tx);
            Ok(Box::new(FakeChild {
                pid: 4242,
                exit_rx: Some(rx),
                terminated: self.terminated.clone(),
            }))
        }
        fn is_alive(&self, _pid: u32) -> bool {
            false
        }
    }

    fn launcher_with(manager: Arc<FakeManager>, dir: &std::path::Path) -> (Launcher, EventBus) {
        let bus = EventBus::new();
        let launcher = Launcher::new(
            manager,
            LauncherConfig::default(),
            Duration::from_millis(100),
            dir,
            bus.clone(),
        );
        launcher.set_port(8790);
        (launcher, bus)
    }

    fn session() -> Session {
        Session::new(
            "123e4567-e89b-42d3-a456-426614174000",
            "claude",
            SessionLimits::default(),
        )
    }

    #[tokio::test]
    async fn spawn_records_pid_and_persists_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(FakeManager {
            exits: PMutex::new(vec![]),
            terminated: Arc::new(PMutex::new(false)),
        });
        let (launcher, _bus) = launcher_with(manager, dir.path());

        let session = session();
        let pid = launcher.spawn_for_session(&session, None).unwrap();
        assert_eq!(pid, 4242);
        assert_eq!(launcher.pid_for(session.id()), Some(4242));

        let raw = std::fs::read_to_string(dir.path().join("launcher.json")).unwrap();
        assert!(raw.contains(session.id()));
        assert!(raw.contains("--broker-url"));
        assert!(raw.contains("8790"));
    }

    #[tokio::test]
    async fn exit_emits_process_exited_and_clears_entry() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(FakeManager {
            exits: PMutex::new(vec![]),
            terminated: Arc::new(PMutex::new(false)),
        });
        let (launcher, bus) = launcher_with(manager.clone(), dir.path());
        let mut events = bus.subscribe();

        let session = session();
        launcher.spawn_for_session(&session, None).unwrap();

        manager.exits.lock().pop().unwrap().send(3).unwrap();

        let event = events.recv().await.unwrap();
        match event {
            DomainEvent::ProcessExited {
                session_id,
                exit_code,
                ..
            } => {
                assert_eq!(session_id, session.id());
                assert_eq!(exit_code, Some(3));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(launcher.pid_for(session.id()), None);
    }

    #[tokio::test]
    async fn kill_terminates_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let terminated = Arc::new(PMutex::new(false));
        let manager = Arc::new(FakeManager {
            exits: PMutex::new(vec![]),
            terminated: terminated.clone(),
        });
        let (launcher, bus) = launcher_with(manager.clone(), dir.path());
        let mut events = bus.subscribe();

        let session = session();
        launcher.spawn_for_session(&session, None).unwrap();
        assert!(launcher.kill(session.id()).await);

        // Simulate the child exiting on SIGTERM.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(*terminated.lock());
        manager.exits.lock().pop().unwrap().send(0).unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.key(), "process:exited");
        assert!(!launcher.kill(session.id()).await);
    }

    #[test]
    fn non_inverted_sessions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(FakeManager {
            exits: PMutex::new(vec![]),
            terminated: Arc::new(PMutex::new(false)),
        });
        let (launcher, _bus) = launcher_with(manager, dir.path());
        let session = Session::new(
            "123e4567-e89b-42d3-a456-426614174000",
            "codex",
            SessionLimits::default(),
        );
        let err = launcher.spawn_for_session(&session, None).unwrap_err();
        assert_eq!(err.kind(), "unsupported");
    }
}
