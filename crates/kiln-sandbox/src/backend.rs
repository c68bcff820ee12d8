//! Isolation backends: how a staged program actually runs inside a slot.
//!
//! The production backend shells out to `isolate`, the contest-grade Linux
//! sandbox, once per invocation: `--init` the numbered box, copy the program
//! in, `--run` the runner under resource limits, `--cleanup`. A second
//! backend runs the runner as a plain child process for environments without
//! `isolate` (tests, development machines); it confines nothing beyond a
//! scrubbed environment and the pool's wall-clock kill.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// File name of the in-sandbox runner binary.
pub const RUNNER_BIN_NAME: &str = "kiln-runner";

/// Mount point for the runner inside an isolate box.
const RUNNER_MOUNT: &str = "/kiln";

/// Resource limits applied to one sandboxed invocation.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// Wall-clock budget for the whole run.
    pub wall_time: Duration,
    /// Control-group memory ceiling, in KiB.
    pub memory_limit_kib: u64,
    /// Maximum number of processes the tool may hold at once.
    pub process_limit: u32,
    /// Whether the sandbox shares the host network namespace.
    pub share_net: bool,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            wall_time: Duration::from_secs(30),
            memory_limit_kib: 102_400,
            process_limit: 50,
            share_net: false,
        }
    }
}

/// One isolation strategy for running the runner in a numbered slot.
///
/// The pool guarantees that `init`, `run`, and `cleanup` for a slot never
/// overlap with another invocation using the same slot number.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Prepare the slot and stage `program` into it. Returns the path the
    /// runner should load the program from, in the runner's own view of the
    /// filesystem.
    async fn init(&self, slot: usize, program: &Path) -> anyhow::Result<PathBuf>;

    /// Run the runner for one invocation. `program` is the path returned by
    /// [`IsolationBackend::init`]; `workspace` is visible at the same path
    /// on both sides. Returns the child's exit status.
    async fn run(&self, slot: usize, program: &Path, workspace: &Path)
        -> anyhow::Result<ExitStatus>;

    /// Tear the slot down. Called even when `run` failed or timed out.
    async fn cleanup(&self, slot: usize) -> anyhow::Result<()>;
}

/// Backend that drives the `isolate` sandbox.
pub struct IsolateBackend {
    limits: SandboxLimits,
    runner_dir: PathBuf,
    runner_name: String,
}

impl IsolateBackend {
    /// Build a backend around limits and a resolved runner binary path.
    pub fn new(limits: SandboxLimits, runner_bin: PathBuf) -> anyhow::Result<Self> {
        let runner_dir = runner_bin
            .parent()
            .ok_or_else(|| anyhow!("runner binary has no parent directory"))?
            .to_path_buf();
        let runner_name = runner_bin
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("runner binary has no usable file name"))?
            .to_string();
        Ok(Self {
            limits,
            runner_dir,
            runner_name,
        })
    }

    /// Arguments for `isolate --run`, in order.
    ///
    /// The box sees: a private `/tmp`, the workspace read-write at its host
    /// path, and the runner's directory read-only at `/kiln`. With
    /// `share_net` the host network namespace and `/etc` (resolver
    /// configuration) are exposed as well.
    fn run_args(&self, slot: usize, program: &Path, workspace: &Path) -> Vec<String> {
        let mut args = vec![
            "--cg".to_string(),
            format!("--box-id={slot}"),
            "--env=HOME=/box".to_string(),
            "--dir=/tmp=".to_string(),
            format!("--dir={}:rw", workspace.display()),
            format!("--dir={}={}", RUNNER_MOUNT, self.runner_dir.display()),
            format!("--processes={}", self.limits.process_limit),
            format!("--wall-time={}", self.limits.wall_time.as_secs()),
            format!("--cg-mem={}", self.limits.memory_limit_kib),
        ];
        if self.limits.share_net {
            args.push("--share-net".to_string());
            args.push("--dir=/etc/".to_string());
        }
        args.push("--run".to_string());
        args.push("--".to_string());
        args.push(format!("{RUNNER_MOUNT}/{}", self.runner_name));
        args.push(program.display().to_string());
        args.push(workspace.display().to_string());
        args
    }
}

#[async_trait]
impl IsolationBackend for IsolateBackend {
    async fn init(&self, slot: usize, program: &Path) -> anyhow::Result<PathBuf> {
        let output = Command::new("isolate")
            .arg("--cg")
            .arg(format!("--box-id={slot}"))
            .arg("--init")
            .output()
            .await
            .context("failed to invoke isolate --init")?;
        if !output.status.success() {
            bail!(
                "isolate --init failed for slot {slot}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        // --init prints the box root; the program goes into its box/ subdir
        let box_root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if box_root.is_empty() {
            bail!("isolate --init reported no box directory for slot {slot}");
        }
        let file_name = program
            .file_name()
            .ok_or_else(|| anyhow!("program path has no file name"))?;
        let staged = Path::new(&box_root).join("box").join(file_name);
        tokio::fs::copy(program, &staged)
            .await
            .with_context(|| format!("failed to stage program into {}", staged.display()))?;
        debug!(slot, box_root = %box_root, "initialized isolate box");

        Ok(Path::new("/box").join(file_name))
    }

    async fn run(&self, slot: usize, program: &Path, workspace: &Path)
        -> anyhow::Result<ExitStatus> {
        let status = Command::new("isolate")
            .args(self.run_args(slot, program, workspace))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(if std::env::var("KILN_DEBUG").is_ok() {
                std::process::Stdio::inherit()
            } else {
                std::process::Stdio::null()
            })
            .kill_on_drop(true)
            .status()
            .await
            .context("failed to invoke isolate --run")?;
        Ok(status)
    }

    async fn cleanup(&self, slot: usize) -> anyhow::Result<()> {
        let output = Command::new("isolate")
            .arg("--cg")
            .arg(format!("--box-id={slot}"))
            .arg("--cleanup")
            .output()
            .await
            .context("failed to invoke isolate --cleanup")?;
        if !output.status.success() {
            bail!(
                "isolate --cleanup failed for slot {slot}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Backend that runs the runner as an ordinary child process.
///
/// There is no filesystem or memory confinement here. The environment is
/// scrubbed and the pool's wall-clock kill still applies, which is enough
/// for tests and trusted local use, and nothing more.
pub struct UnconfinedBackend {
    staging_root: PathBuf,
    runner_bin: PathBuf,
}

impl UnconfinedBackend {
    /// Build a backend that stages programs under `staging_root`.
    pub fn new(staging_root: PathBuf, runner_bin: PathBuf) -> Self {
        Self {
            staging_root,
            runner_bin,
        }
    }

    fn slot_dir(&self, slot: usize) -> PathBuf {
        self.staging_root.join(format!("slot-{slot}"))
    }
}

#[async_trait]
impl IsolationBackend for UnconfinedBackend {
    async fn init(&self, slot: usize, program: &Path) -> anyhow::Result<PathBuf> {
        let slot_dir = self.slot_dir(slot);
        tokio::fs::create_dir_all(&slot_dir)
            .await
            .with_context(|| format!("failed to create slot directory {}", slot_dir.display()))?;
        let file_name = program
            .file_name()
            .ok_or_else(|| anyhow!("program path has no file name"))?;
        let staged = slot_dir.join(file_name);
        tokio::fs::copy(program, &staged)
            .await
            .with_context(|| format!("failed to stage program into {}", staged.display()))?;
        Ok(staged)
    }

    async fn run(&self, slot: usize, program: &Path, workspace: &Path)
        -> anyhow::Result<ExitStatus> {
        let _ = slot;
        let status = Command::new(&self.runner_bin)
            .arg(program)
            .arg(workspace)
            .env_clear()
            .env("HOME", workspace)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(if std::env::var("KILN_DEBUG").is_ok() {
                std::process::Stdio::inherit()
            } else {
                std::process::Stdio::null()
            })
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to spawn runner at {}", self.runner_bin.display()))?;
        Ok(status)
    }

    async fn cleanup(&self, slot: usize) -> anyhow::Result<()> {
        let slot_dir = self.slot_dir(slot);
        match tokio::fs::remove_dir_all(&slot_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("failed to clear slot directory {}", slot_dir.display()))),
        }
    }
}

/// Find the `kiln-runner` binary.
///
/// Search order:
/// 1. `KILN_RUNNER_BIN` environment variable (must be an absolute path)
/// 2. Same directory as the current executable
/// 3. Parent of that directory (test binaries live in `target/*/deps/`)
///
/// On Unix, rejects world-writable binaries (mode & 0o002 != 0).
pub fn find_runner_binary() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("KILN_RUNNER_BIN") {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            bail!("KILN_RUNNER_BIN must be an absolute path, got: {path}");
        }
        if p.is_file() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let runner = dir.join(RUNNER_BIN_NAME);
            if runner.is_file() {
                validate_binary_permissions(&runner)?;
                return Ok(runner);
            }
            if let Some(parent) = dir.parent() {
                let runner = parent.join(RUNNER_BIN_NAME);
                if runner.is_file() {
                    validate_binary_permissions(&runner)?;
                    return Ok(runner);
                }
            }
        }
    }

    bail!("kiln-runner binary not found. Set KILN_RUNNER_BIN or install it alongside the service")
}

/// Validate binary file permissions (Unix only).
///
/// Rejects world-writable binaries so a writable runner cannot be swapped
/// out from under the service.
pub(crate) fn validate_binary_permissions(_path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(_path)
            .with_context(|| format!("cannot read metadata for {}", _path.display()))?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            bail!(
                "insecure permissions on runner binary {}: mode {:o} is world-writable",
                _path.display(),
                mode,
            );
        }
    }
    Ok(())
}
