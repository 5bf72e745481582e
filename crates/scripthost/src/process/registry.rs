//! In-memory registry of running script instances.
//!
//! Records are keyed by user, then by instance id. Ids come from one global
//! counter, so they are unique across users and never reused within a run.

// The map lock is never held across an .await.
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::process::Child;
use tracing::{debug, warn};

use super::ScriptKind;

// ============================================================================
// InstanceRecord
// ============================================================================

/// One spawned execution of a script.
///
/// The record is the only owner of the child handle. Whoever removes it from
/// the registry signals the child (if needed) and drops the record.
#[derive(Debug)]
pub struct InstanceRecord {
    pub id: u64,
    pub user: String,
    pub file_name: String,
    pub kind: ScriptKind,
    pub pid: Option<u32>,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
    /// Set once the child has been observed to exit.
    pub exit_status: Option<ExitStatus>,
    child: Child,
}

impl InstanceRecord {
    pub fn new(
        id: u64,
        user: impl Into<String>,
        file_name: impl Into<String>,
        kind: ScriptKind,
        log_path: PathBuf,
        child: Child,
    ) -> Self {
        Self {
            id,
            user: user.into(),
            file_name: file_name.into(),
            kind,
            pid: child.id(),
            log_path,
            started_at: Utc::now(),
            exit_status: None,
            child,
        }
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            id: self.id,
            file_name: self.file_name.clone(),
            kind: self.kind,
            pid: self.pid,
            log_path: self.log_path.clone(),
            started_at: self.started_at,
        }
    }

    /// Ask the script's process group to exit (SIGTERM).
    pub fn terminate(mut self) {
        self.signal(libc::SIGTERM);
    }

    /// Kill the script's process group outright (SIGKILL).
    pub fn kill(mut self) {
        self.signal(libc::SIGKILL);
    }

    /// Poll the child without blocking. `true` once it has exited.
    fn poll_exited(&mut self) -> bool {
        if self.exit_status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(
                    instance = self.id,
                    error = %e,
                    "Failed to poll instance; treating as exited"
                );
                true
            }
        }
    }

    /// Signal the whole process group, even when the leader is gone: jobs the
    /// script left in the background still belong to it.
    fn signal(&mut self, signal: libc::c_int) {
        if self.poll_exited() {
            debug!(instance = self.id, "Group leader already exited");
        }
        let Some(pid) = self.pid else {
            return;
        };
        // SAFETY: killpg only sends a signal. The child was started in its own
        // session, so its process group id equals its pid and contains only
        // the script and whatever it spawned. The id cannot be reused while
        // any member of the group is alive.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, signal) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                debug!(instance = self.id, pid, "Process group already gone");
            } else {
                warn!(instance = self.id, pid, signal, error = %err, "Failed to signal instance");
            }
        }
    }
}

/// Handle-free view of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    pub id: u64,
    pub file_name: String,
    pub kind: ScriptKind,
    pub pid: Option<u32>,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug)]
pub struct Registry {
    instances: Mutex<HashMap<String, BTreeMap<u64, InstanceRecord>>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BTreeMap<u64, InstanceRecord>>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the next instance id.
    pub fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn put(&self, record: InstanceRecord) {
        let mut instances = self.lock();
        instances
            .entry(record.user.clone())
            .or_default()
            .insert(record.id, record);
    }

    pub fn get(&self, user: &str, id: u64) -> Option<InstanceSummary> {
        self.lock()
            .get(user)
            .and_then(|by_id| by_id.get(&id))
            .map(InstanceRecord::summary)
    }

    pub fn remove(&self, user: &str, id: u64) -> Option<InstanceRecord> {
        let mut instances = self.lock();
        let by_id = instances.get_mut(user)?;
        let record = by_id.remove(&id);
        if by_id.is_empty() {
            instances.remove(user);
        }
        record
    }

    /// The user's instances, ordered by id.
    pub fn list_by_user(&self, user: &str) -> Vec<InstanceSummary> {
        self.lock()
            .get(user)
            .map(|by_id| by_id.values().map(InstanceRecord::summary).collect())
            .unwrap_or_default()
    }

    pub fn find_by_user_and_file_name(&self, user: &str, file_name: &str) -> Vec<InstanceSummary> {
        self.lock()
            .get(user)
            .map(|by_id| {
                by_id
                    .values()
                    .filter(|r| r.file_name == file_name)
                    .map(InstanceRecord::summary)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove every instance of `file_name` for `user` in one critical section.
    pub fn remove_by_file(&self, user: &str, file_name: &str) -> Vec<InstanceRecord> {
        let mut instances = self.lock();
        let Some(by_id) = instances.get_mut(user) else {
            return Vec::new();
        };

        let ids: Vec<u64> = by_id
            .values()
            .filter(|r| r.file_name == file_name)
            .map(|r| r.id)
            .collect();
        let removed = ids.iter().filter_map(|id| by_id.remove(id)).collect();

        if by_id.is_empty() {
            instances.remove(user);
        }
        removed
    }

    pub fn count_by_user(&self, user: &str) -> usize {
        self.lock().get(user).map_or(0, BTreeMap::len)
    }

    pub fn total(&self) -> usize {
        self.lock().values().map(BTreeMap::len).sum()
    }

    /// Remove and return every record whose child has exited.
    pub fn drain_exited(&self) -> Vec<InstanceRecord> {
        let mut instances = self.lock();
        let mut exited = Vec::new();

        for by_id in instances.values_mut() {
            let ids: Vec<u64> = by_id
                .iter_mut()
                .filter_map(|(id, record)| record.poll_exited().then_some(*id))
                .collect();
            exited.extend(ids.iter().filter_map(|id| by_id.remove(id)));
        }

        instances.retain(|_, by_id| !by_id.is_empty());
        exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::sync::Arc;
    use std::time::Duration;

    fn spawn_child(cmd: &str) -> Child {
        tokio::process::Command::new("sh")
            .args(["-c", cmd])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    fn record(registry: &Registry, user: &str, file_name: &str, cmd: &str) -> InstanceRecord {
        InstanceRecord::new(
            registry.allocate(),
            user,
            file_name,
            ScriptKind::Shell,
            PathBuf::from("/dev/null"),
            spawn_child(cmd),
        )
    }

    #[tokio::test]
    async fn ids_are_unique_and_increasing_across_users() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                (0..50).map(|_| registry.allocate()).collect::<Vec<_>>()
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            let ids = handle.await.unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            all.extend(ids);
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
        assert_eq!(all.first(), Some(&1));
    }

    #[tokio::test]
    async fn put_get_remove() {
        let registry = Registry::new();
        let rec = record(&registry, "u1", "job.sh", "sleep 30");
        let id = rec.id;
        registry.put(rec);

        let summary = registry.get("u1", id).unwrap();
        assert_eq!(summary.file_name, "job.sh");
        assert!(registry.get("u2", id).is_none());
        assert_eq!(registry.count_by_user("u1"), 1);

        let removed = registry.remove("u1", id).unwrap();
        removed.kill();
        assert!(registry.remove("u1", id).is_none());
        assert_eq!(registry.total(), 0);
    }

    #[tokio::test]
    async fn list_by_user_is_isolated_and_ordered() {
        let registry = Registry::new();
        let a = record(&registry, "u1", "a.sh", "sleep 30");
        let b = record(&registry, "u2", "b.sh", "sleep 30");
        let c = record(&registry, "u1", "c.sh", "sleep 30");
        let (a_id, c_id) = (a.id, c.id);
        // Insert out of order; listing follows id order.
        registry.put(c);
        registry.put(b);
        registry.put(a);

        let ids: Vec<u64> = registry.list_by_user("u1").iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a_id, c_id]);
        assert_eq!(registry.list_by_user("u2").len(), 1);
        assert!(registry.list_by_user("nobody").is_empty());
        assert_eq!(registry.total(), 3);
    }

    #[tokio::test]
    async fn remove_by_file_takes_all_instances() {
        let registry = Registry::new();
        registry.put(record(&registry, "u1", "job.sh", "sleep 30"));
        registry.put(record(&registry, "u1", "job.sh", "sleep 30"));
        registry.put(record(&registry, "u1", "other.sh", "sleep 30"));

        assert_eq!(registry.find_by_user_and_file_name("u1", "job.sh").len(), 2);

        let removed = registry.remove_by_file("u1", "job.sh");
        assert_eq!(removed.len(), 2);
        removed.into_iter().for_each(InstanceRecord::kill);

        assert!(registry.find_by_user_and_file_name("u1", "job.sh").is_empty());
        assert_eq!(registry.count_by_user("u1"), 1);
        assert!(registry.remove_by_file("u1", "missing.sh").is_empty());
    }

    #[tokio::test]
    async fn drain_exited_keeps_live_instances() {
        let registry = Registry::new();
        let quick = record(&registry, "u1", "quick.sh", "exit 3");
        let slow = record(&registry, "u1", "slow.sh", "sleep 30");
        let quick_id = quick.id;
        registry.put(quick);
        registry.put(slow);

        let mut drained = Vec::new();
        for _ in 0..50 {
            drained = registry.drain_exited();
            if !drained.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id, quick_id);
        assert_eq!(drained[0].exit_status.and_then(|s| s.code()), Some(3));
        assert_eq!(registry.count_by_user("u1"), 1);
    }

    #[tokio::test]
    async fn empty_user_maps_are_dropped() {
        let registry = Registry::new();
        let rec = record(&registry, "u1", "job.sh", "sleep 30");
        let id = rec.id;
        registry.put(rec);
        registry.remove("u1", id).unwrap().kill();

        assert!(registry.lock().get("u1").is_none());
    }
}
