//! Periodic sweep of exited script instances.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::Supervisor;

/// Spawn the reaper task. Returns `None` when `interval` is zero (disabled).
pub fn spawn_reaper(supervisor: Arc<Supervisor>, interval: Duration) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reaped = supervisor.reap();
            if reaped > 0 {
                debug!(reaped, remaining = supervisor.total_instances(), "Reaper sweep");
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Interpreters;
    use crate::workspace::Workspace;
    use tempfile::TempDir;

    #[tokio::test]
    async fn zero_interval_disables_reaper() {
        let tmp = TempDir::new().unwrap();
        let supervisor = Arc::new(Supervisor::new(
            Workspace::new(tmp.path()),
            tmp.path().join("logs"),
            Interpreters::default(),
        ));
        assert!(spawn_reaper(supervisor, Duration::ZERO).is_none());
    }

    #[tokio::test]
    async fn reaper_removes_exited_instances() {
        let tmp = TempDir::new().unwrap();
        let supervisor = Arc::new(Supervisor::new(
            Workspace::new(tmp.path().join("uploads")),
            tmp.path().join("logs"),
            Interpreters {
                shell: "sh".to_string(),
                ..Interpreters::default()
            },
        ));
        supervisor
            .workspace()
            .save_upload("u1", "quick.sh", b"exit 0\n")
            .await
            .unwrap();
        supervisor.run("u1", "quick.sh").await.unwrap();
        assert_eq!(supervisor.stats("u1").active_instances, 1);

        let handle = spawn_reaper(Arc::clone(&supervisor), Duration::from_millis(20)).unwrap();
        for _ in 0..200 {
            if supervisor.stats("u1").active_instances == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();

        assert_eq!(supervisor.stats("u1").active_instances, 0);
    }
}
