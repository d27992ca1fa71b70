use anyhow::{Context, Result};
use nix::{sys::signal::Signal, unistd::Pid};
use sockinit::ServiceId;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time::timeout;

/// Locations of the binaries cargo built for this test run
pub fn init_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_init"))
}

pub fn ping_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ping"))
}

pub fn service_binary(id: ServiceId) -> PathBuf {
    match id {
        ServiceId::A => PathBuf::from(env!("CARGO_BIN_EXE_service-a")),
        ServiceId::B => PathBuf::from(env!("CARGO_BIN_EXE_service-b")),
        ServiceId::C => PathBuf::from(env!("CARGO_BIN_EXE_service-c")),
    }
}

/// Directory holding the service binaries
pub fn bin_dir() -> PathBuf {
    init_binary()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Spawns the crate's binaries against a private socket directory
pub struct ProcessTestHarness {
    socket_dir: TempDir,
    cleanup_pids: Vec<Pid>,
}

impl ProcessTestHarness {
    pub fn new() -> Result<Self> {
        let socket_dir = TempDir::new().context("Failed to create socket directory")?;

        Ok(Self {
            socket_dir,
            cleanup_pids: Vec::new(),
        })
    }

    /// Directory the spawned processes use for their sockets
    pub fn socket_dir(&self) -> &Path {
        self.socket_dir.path()
    }

    pub fn socket_path(&self, id: ServiceId) -> PathBuf {
        id.socket_path(self.socket_dir())
    }

    /// Spawns `init` with a fast health interval and the given extra flags
    pub async fn spawn_init(&mut self, args: &[&str]) -> Result<TestProcess> {
        let mut cmd = Command::new(init_binary());
        cmd.arg("--socket-dir")
            .arg(self.socket_dir())
            .arg("--service-bin-dir")
            .arg(bin_dir())
            .args(["--health-interval-ms", "100"])
            .args(args);

        self.spawn(cmd, "init")
    }

    /// Spawns one service binary directly, without a supervisor
    pub async fn spawn_service(&mut self, id: ServiceId, args: &[&str]) -> Result<TestProcess> {
        let mut cmd = Command::new(service_binary(id));
        cmd.arg("--socket-dir").arg(self.socket_dir()).args(args);

        self.spawn(cmd, id.binary_name())
    }

    /// Runs `ping` to completion against this harness' socket directory
    pub async fn run_ping(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new(ping_binary())
            .arg("--socket-dir")
            .arg(self.socket_dir())
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .context("Failed to run ping")?;
        Ok(output)
    }

    fn spawn(&mut self, mut cmd: Command, name: &str) -> Result<TestProcess> {
        cmd.stdin(Stdio::null());
        // Own process group so cleanup also reaches the services
        cmd.process_group(0);
        cmd.kill_on_drop(true);

        let start_time = Instant::now();
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {name}"))?;

        let pid = Pid::from_raw(
            child
                .id()
                .ok_or_else(|| anyhow::anyhow!("Failed to get child PID"))? as i32,
        );

        self.cleanup_pids.push(pid);

        Ok(TestProcess {
            pid,
            start_time,
            child: Some(child),
        })
    }
}

impl Drop for ProcessTestHarness {
    fn drop(&mut self) {
        for pid in &self.cleanup_pids {
            let _ = nix::sys::signal::killpg(*pid, Signal::SIGKILL);
        }
    }
}

/// A spawned binary under test
pub struct TestProcess {
    pub pid: Pid,
    pub start_time: Instant,
    child: Option<tokio::process::Child>,
}

impl TestProcess {
    pub fn signal(&self, signal: Signal) -> Result<()> {
        nix::sys::signal::kill(self.pid, signal).context("Failed to signal process")
    }

    /// Wait for process exit with a timeout
    pub async fn wait_for_exit_timeout(&mut self, duration: Duration) -> Result<Option<ExitStatus>> {
        if let Some(child) = &mut self.child {
            match timeout(duration, child.wait()).await {
                Ok(result) => Ok(Some(result.context("Process wait failed")?)),
                Err(_) => Ok(None),
            }
        } else {
            Ok(None)
        }
    }

    /// Sends SIGTERM and waits for the exit status
    pub async fn terminate(&mut self, duration: Duration) -> Result<ExitStatus> {
        self.signal(Signal::SIGTERM)?;
        self.wait_for_exit_timeout(duration)
            .await?
            .ok_or_else(|| anyhow::anyhow!("process {} ignored SIGTERM", self.pid))
    }

    pub fn runtime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_running(&mut self) -> bool {
        if let Some(child) = &mut self.child {
            child.try_wait().unwrap_or(None).is_none()
        } else {
            false
        }
    }
}
