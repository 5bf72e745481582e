//! Process supervisor: run, stop, cascade-delete and reap script instances.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{InstanceRecord, InstanceSummary, Interpreters, Registry, ScriptKind};
use crate::error::{SupervisorError, SupervisorResult};
use crate::workspace::Workspace;

// ============================================================================
// Result types
// ============================================================================

/// Result of deleting a script together with its instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeOutcome {
    /// Ids of the instances that were killed, in id order.
    pub killed: Vec<u64>,
    /// Whether the script file was present before deletion.
    pub file_existed: bool,
}

/// Per-user counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Instances in the registry. Not checked for liveness.
    pub active_instances: usize,
}

// ============================================================================
// Supervisor
// ============================================================================

pub struct Supervisor {
    workspace: Workspace,
    registry: Registry,
    logs_dir: PathBuf,
    interpreters: Interpreters,
}

impl Supervisor {
    pub fn new(
        workspace: Workspace,
        logs_dir: impl Into<PathBuf>,
        interpreters: Interpreters,
    ) -> Self {
        Self {
            workspace,
            registry: Registry::new(),
            logs_dir: logs_dir.into(),
            interpreters,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// The user's running instances, ordered by id.
    pub fn instances(&self, user: &str) -> Vec<InstanceSummary> {
        self.registry.list_by_user(user)
    }

    pub fn instance(&self, user: &str, id: u64) -> Option<InstanceSummary> {
        self.registry.get(user, id)
    }

    /// Start a new instance of `file_name` and return its id.
    ///
    /// The child gets the user's directory as cwd, a null stdin, and stdout and
    /// stderr appended to `<logs_dir>/<user>_<file_name>_<id>.log`. It runs in a
    /// new session so signals aimed at the host never reach it.
    pub async fn run(&self, user: &str, file_name: &str) -> SupervisorResult<u64> {
        let script = self
            .workspace
            .script_path(user, file_name)
            .await
            .ok_or_else(|| SupervisorError::script_not_found(file_name))?;
        let kind = ScriptKind::from_file_name(file_name)
            .ok_or_else(|| SupervisorError::unsupported_type(file_name))?;

        let script = fs::canonicalize(&script)
            .await
            .map_err(|e| SupervisorError::storage(&script, e))?;
        let user_dir = self.workspace.ensure(user).await?;

        let id = self.registry.allocate();
        let log_path = self.log_path(user, file_name, id);
        let (stdout, stderr) = self.open_log(&log_path).await?;

        let (program, args) = kind.command(&self.interpreters, &script);
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&user_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        // SAFETY: pre_exec runs in the forked child before exec. setsid is
        // async-signal-safe and touches no shared state.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| {
            warn!(user, file = file_name, program = %program, error = %e, "Failed to spawn script");
            SupervisorError::spawn(file_name, e)
        })?;

        let record = InstanceRecord::new(id, user, file_name, kind, log_path, child);
        info!(
            user,
            instance = id,
            file = file_name,
            pid = record.pid,
            log = %record.log_path.display(),
            "Started script"
        );
        self.registry.put(record);
        Ok(id)
    }

    /// Send SIGTERM to an instance and forget it. `false` if it is not registered.
    ///
    /// Returns without waiting for the process to exit.
    pub fn stop(&self, user: &str, id: u64) -> bool {
        match self.registry.remove(user, id) {
            Some(record) => {
                info!(user, instance = id, file = %record.file_name, "Stopping script");
                record.terminate();
                true
            }
            None => {
                debug!(user, instance = id, "Stop requested for unknown instance");
                false
            }
        }
    }

    /// Kill every instance of `file_name`, then delete the file.
    pub async fn cascade_delete(
        &self,
        user: &str,
        file_name: &str,
    ) -> SupervisorResult<CascadeOutcome> {
        let removed = self.registry.remove_by_file(user, file_name);
        let killed: Vec<u64> = removed.iter().map(|r| r.id).collect();
        for record in removed {
            record.kill();
        }
        if !killed.is_empty() {
            info!(user, file = file_name, instances = ?killed, "Killed instances before delete");
        }

        let file_existed = self.workspace.delete_script(user, file_name).await?;
        Ok(CascadeOutcome {
            killed,
            file_existed,
        })
    }

    pub fn stats(&self, user: &str) -> Stats {
        Stats {
            active_instances: self.registry.count_by_user(user),
        }
    }

    pub fn total_instances(&self) -> usize {
        self.registry.total()
    }

    /// Drop records whose process has exited. Returns how many were dropped.
    pub fn reap(&self) -> usize {
        let exited = self.registry.drain_exited();
        for record in &exited {
            let code = record.exit_status.and_then(|s| s.code());
            info!(
                user = %record.user,
                instance = record.id,
                file = %record.file_name,
                exit_code = ?code,
                "Script exited"
            );
        }
        exited.len()
    }

    /// Log what is left behind. Children are detached and keep running.
    pub fn shutdown(&self) {
        let remaining = self.registry.total();
        if remaining > 0 {
            warn!(
                count = remaining,
                "Shutting down with running scripts; they continue unsupervised"
            );
        } else {
            info!("Supervisor shut down with no running scripts");
        }
    }

    fn log_path(&self, user: &str, file_name: &str, id: u64) -> PathBuf {
        self.logs_dir.join(format!("{user}_{file_name}_{id}.log"))
    }

    async fn open_log(&self, log_path: &Path) -> SupervisorResult<(Stdio, Stdio)> {
        fs::create_dir_all(&self.logs_dir)
            .await
            .map_err(|e| SupervisorError::storage(&self.logs_dir, e))?;
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await
            .map_err(|e| SupervisorError::storage(log_path, e))?
            .into_std()
            .await;
        let err_file = file
            .try_clone()
            .map_err(|e| SupervisorError::storage(log_path, e))?;
        Ok((Stdio::from(file), Stdio::from(err_file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn supervisor(tmp: &TempDir) -> Supervisor {
        Supervisor::new(
            Workspace::new(tmp.path().join("uploads")),
            tmp.path().join("logs"),
            Interpreters {
                shell: "sh".to_string(),
                ..Interpreters::default()
            },
        )
    }

    async fn wait_for(path: &Path, needle: &str) -> String {
        for _ in 0..100 {
            if let Ok(content) = std::fs::read_to_string(path)
                && content.contains(needle)
            {
                return content;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{} never contained {needle:?}", path.display());
    }

    #[tokio::test]
    async fn run_missing_script_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&tmp);

        let err = sup.run("u1", "missing.sh").await.unwrap_err();
        assert!(matches!(err, SupervisorError::ScriptNotFound { .. }));
        assert_eq!(sup.stats("u1").active_instances, 0);
    }

    #[tokio::test]
    async fn run_writes_output_to_instance_log_in_user_dir() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&tmp);
        sup.workspace()
            .save_upload("u1", "job.sh", b"pwd; echo out; echo err >&2\n")
            .await
            .unwrap();

        let id = sup.run("u1", "job.sh").await.unwrap();
        let log = tmp.path().join("logs").join(format!("u1_job.sh_{id}.log"));
        let content = wait_for(&log, "err").await;

        assert!(content.contains("out"));
        let user_dir = std::fs::canonicalize(tmp.path().join("uploads/u1")).unwrap();
        assert!(content.contains(&*user_dir.to_string_lossy()));
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_record() {
        let tmp = TempDir::new().unwrap();
        let sup = Supervisor::new(
            Workspace::new(tmp.path().join("uploads")),
            tmp.path().join("logs"),
            Interpreters {
                shell: "/nonexistent/interpreter".to_string(),
                ..Interpreters::default()
            },
        );
        sup.workspace()
            .save_upload("u1", "job.sh", b"true\n")
            .await
            .unwrap();

        let err = sup.run("u1", "job.sh").await.unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFault { .. }));
        assert_eq!(sup.total_instances(), 0);
    }

    #[tokio::test]
    async fn child_runs_in_its_own_session() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&tmp);
        sup.workspace()
            .save_upload("u1", "sleeper.sh", b"sleep 30\n")
            .await
            .unwrap();

        let id = sup.run("u1", "sleeper.sh").await.unwrap();
        let pid = sup.instance("u1", id).unwrap().pid.unwrap() as libc::pid_t;

        // SAFETY: getpgid only reads process state.
        let pgid = unsafe { libc::getpgid(pid) };
        assert_eq!(pgid, pid);

        assert!(sup.stop("u1", id));
    }

    #[tokio::test]
    async fn stop_terminates_process_group() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&tmp);
        sup.workspace()
            .save_upload("u1", "sleeper.sh", b"echo started; sleep 30\n")
            .await
            .unwrap();

        let id = sup.run("u1", "sleeper.sh").await.unwrap();
        let summary = sup.instance("u1", id).unwrap();
        wait_for(&summary.log_path, "started").await;
        let pid = summary.pid.unwrap() as libc::pid_t;

        assert!(sup.stop("u1", id));
        assert!(!sup.stop("u1", id));

        assert!(wait_dead(pid).await, "process {pid} still alive after stop");
    }

    /// Missing from /proc, or a zombie waiting to be reaped.
    fn is_dead(pid: libc::pid_t) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        }
    }

    #[tokio::test]
    async fn cascade_delete_without_instances() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&tmp);
        sup.workspace()
            .save_upload("u1", "idle.sh", b"true\n")
            .await
            .unwrap();

        let outcome = sup.cascade_delete("u1", "idle.sh").await.unwrap();
        assert!(outcome.killed.is_empty());
        assert!(outcome.file_existed);

        let outcome = sup.cascade_delete("u1", "idle.sh").await.unwrap();
        assert!(!outcome.file_existed);
    }

    async fn wait_dead(pid: libc::pid_t) -> bool {
        for _ in 0..100 {
            if is_dead(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn stop_reaches_background_jobs_after_leader_exits() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&tmp);
        sup.workspace()
            .save_upload("u1", "fork.sh", b"sleep 300 &\necho $! > bg.pid\nexit 0\n")
            .await
            .unwrap();

        let id = sup.run("u1", "fork.sh").await.unwrap();
        let leader = sup.instance("u1", id).unwrap().pid.unwrap() as libc::pid_t;
        let pid_file = tmp.path().join("uploads/u1/bg.pid");
        let background: libc::pid_t = wait_for(&pid_file, "\n").await.trim().parse().unwrap();
        assert!(wait_dead(leader).await, "leader {leader} never exited");
        assert!(!is_dead(background));

        assert!(sup.stop("u1", id));
        assert!(
            wait_dead(background).await,
            "background job {background} survived stop"
        );
    }

    #[tokio::test]
    async fn cascade_delete_kills_running_instances() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&tmp);
        sup.workspace()
            .save_upload("u1", "loop.sh", b"echo started; sleep 30\n")
            .await
            .unwrap();

        let mut pids = Vec::new();
        for _ in 0..2 {
            let id = sup.run("u1", "loop.sh").await.unwrap();
            let summary = sup.instance("u1", id).unwrap();
            wait_for(&summary.log_path, "started").await;
            pids.push(summary.pid.unwrap() as libc::pid_t);
        }

        let outcome = sup.cascade_delete("u1", "loop.sh").await.unwrap();
        assert_eq!(outcome.killed.len(), 2);
        assert!(outcome.file_existed);
        for pid in pids {
            assert!(wait_dead(pid).await, "process {pid} still alive after delete");
        }
    }
}
