use std::io;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use common::error::{StoreError, StoreResult};

use crate::core::node::NodeId;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Exit status of a remote command; `code` is `None` when the process was
/// killed by a signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteStatus {
    pub code: Option<i32>,
}

impl RemoteStatus {
    pub const SUCCESS: RemoteStatus = RemoteStatus { code: Some(0) };

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for RemoteStatus {
    fn from(s: ExitStatus) -> Self {
        RemoteStatus { code: s.code() }
    }
}

/// Runs commands on cluster nodes and pulls files off them.
///
/// Calls block the calling worker until the remote side finishes.
pub trait RemoteExecutor: Send + Sync {
    fn execute(&self, node: NodeId, command: &str) -> io::Result<RemoteStatus>;

    fn copy(&self, node: NodeId, remote_path: &str, destination: &Path)
        -> io::Result<RemoteStatus>;
}

/// Maps an executor outcome onto the store's error type.
pub fn check(node: NodeId, res: io::Result<RemoteStatus>) -> StoreResult<()> {
    match res {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(StoreError::RemoteExecFailure {
            node,
            reason: match status.code {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            },
        }),
        Err(e) => Err(StoreError::RemoteExecFailure {
            node,
            reason: e.to_string(),
        }),
    }
}

/// Executor over `ssh` and `scp`. Assumes key-based auth to every host.
pub struct SshExecutor {
    hosts: Vec<String>,
    timeout: Option<Duration>,
}

impl SshExecutor {
    pub fn new(hosts: Vec<String>, timeout: Option<Duration>) -> Self {
        Self { hosts, timeout }
    }

    fn host(&self, node: NodeId) -> io::Result<&str> {
        self.hosts
            .get(node)
            .map(String::as_str)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown node {node}")))
    }

    fn run(&self, mut cmd: Command) -> io::Result<RemoteStatus> {
        cmd.stdin(Stdio::null()).stdout(Stdio::null());
        let child = cmd.spawn()?;
        match self.timeout {
            Some(limit) => wait_with_deadline(child, limit),
            None => {
                let mut child = child;
                child.wait().map(RemoteStatus::from)
            }
        }
    }
}

/// Waits for `child`, killing it once `limit` has elapsed.
fn wait_with_deadline(mut child: Child, limit: Duration) -> io::Result<RemoteStatus> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status.into());
        }
        if Instant::now() >= deadline {
            warn!(pid = child.id(), ?limit, "remote command timed out, killing");
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("remote command exceeded {}", humantime::format_duration(limit)),
            ));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

impl RemoteExecutor for SshExecutor {
    fn execute(&self, node: NodeId, command: &str) -> io::Result<RemoteStatus> {
        let host = self.host(node)?;
        debug!(node, host, command, "ssh");
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes", host, command]);
        self.run(cmd)
    }

    fn copy(
        &self,
        node: NodeId,
        remote_path: &str,
        destination: &Path,
    ) -> io::Result<RemoteStatus> {
        let host = self.host(node)?;
        debug!(node, host, remote_path, dest = %destination.display(), "scp");
        let mut cmd = Command::new("scp");
        cmd.args(["-o", "BatchMode=yes", "-q"])
            .arg(format!("{host}:{remote_path}"))
            .arg(destination);
        self.run(cmd)
    }
}

/// Executor that only logs what it would run. Used for dry runs.
#[derive(Debug, Default)]
pub struct DryRunExecutor;

impl RemoteExecutor for DryRunExecutor {
    fn execute(&self, node: NodeId, command: &str) -> io::Result<RemoteStatus> {
        info!(node, command, "dry-run: execute");
        Ok(RemoteStatus::SUCCESS)
    }

    fn copy(
        &self,
        node: NodeId,
        remote_path: &str,
        destination: &Path,
    ) -> io::Result<RemoteStatus> {
        info!(node, remote_path, dest = %destination.display(), "dry-run: copy");
        Ok(RemoteStatus::SUCCESS)
    }
}

/// Measures one round trip to `node` with a no-op command, in milliseconds.
pub fn probe_latency(executor: &dyn RemoteExecutor, node: NodeId) -> StoreResult<f64> {
    let start = Instant::now();
    check(node, executor.execute(node, "true"))?;
    Ok(start.elapsed().as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_maps_failures() {
        assert!(check(0, Ok(RemoteStatus::SUCCESS)).is_ok());

        let err = check(3, Ok(RemoteStatus { code: Some(255) })).unwrap_err();
        assert!(matches!(err, StoreError::RemoteExecFailure { node: 3, .. }));
        assert!(err.to_string().contains("255"));

        let err = check(1, Err(io::Error::new(io::ErrorKind::TimedOut, "slow"))).unwrap_err();
        assert!(matches!(err, StoreError::RemoteExecFailure { node: 1, .. }));
    }

    #[test]
    fn test_unknown_host_is_an_error() {
        let ssh = SshExecutor::new(vec!["a".into()], None);
        assert!(ssh.execute(4, "true").is_err());
    }

    #[test]
    fn test_dry_run_always_succeeds() {
        let dry = DryRunExecutor;
        assert!(probe_latency(&dry, 0).unwrap() >= 0.0);
    }
}
