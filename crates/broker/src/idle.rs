//! Idle session reaper.
//!
//! When enabled, a periodic sweep closes sessions whose last activity is
//! older than the configured window. Closure takes the same path as an
//! explicit close (graceful backend teardown, then removal).

use std::sync::Arc;
use std::time::Duration;

use bc_sessions::SessionPhase;

use crate::coordinator::Coordinator;

pub struct IdlePolicy {
    coordinator: Arc<Coordinator>,
    timeout: Duration,
}

impl IdlePolicy {
    pub fn new(coordinator: Arc<Coordinator>, timeout: Duration) -> Self {
        Self {
            coordinator,
            timeout,
        }
    }

    pub fn start(self) {
        if self.timeout.is_zero() {
            return;
        }
        // Sweep at half the timeout, capped at a minute.
        let interval = (self.timeout / 2).min(Duration::from_secs(60)).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        });
    }

    async fn sweep(&self) {
        for session in self.coordinator.repo.list() {
            if session.phase() == SessionPhase::Closed {
                continue;
            }
            if session.last_activity().elapsed() < self.timeout {
                continue;
            }
            tracing::info!(session_id = session.id(), "reaping idle session");
            if let Err(e) = self.coordinator.close_session(session.id(), "idle").await {
                tracing::warn!(session_id = session.id(), error = %e, "idle close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use bc_domain::config::Config;

    #[tokio::test]
    async fn sweep_reaps_only_stale_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();
        let coordinator = Coordinator::new(Arc::new(config)).unwrap();

        let stale_id = "123e4567-e89b-42d3-a456-426614174000";
        let fresh_id = "223e4567-e89b-42d3-a456-426614174000";
        let stale = coordinator.get_or_create_for_consumer(stale_id).unwrap();
        let fresh = coordinator.get_or_create_for_consumer(fresh_id).unwrap();

        let policy = IdlePolicy::new(coordinator.clone(), Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(80)).await;
        fresh.touch();
        policy.sweep().await;

        assert!(coordinator.repo.get(stale_id).is_none());
        assert!(coordinator.repo.get(fresh_id).is_some());
        assert!(stale.is_closed());
    }

    #[tokio::test]
    async fn zero_timeout_disables_the_reaper() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();
        let coordinator = Coordinator::new(Arc::new(config)).unwrap();
        // start() with a zero timeout spawns nothing; just ensure it
        // returns without panicking.
        IdlePolicy::new(coordinator, Duration::ZERO).start();
    }
}
