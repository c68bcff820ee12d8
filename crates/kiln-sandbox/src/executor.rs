//! End-to-end execution of one submitted tool.
//!
//! The executor owns the workspace manager and the slot pool and walks a
//! submission through the whole pipeline: extract the contract, stage the
//! program and arguments into a fresh workspace, run the sandbox, read the
//! result envelope back, and hand the workspace to its retention timer.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use kiln_codec::{ExecutionOutcome, ARGS_FILE, RESULT_FILE};
use kiln_error::ToolError;
use kiln_tool::ToolDescriptor;

use crate::backend::{
    find_runner_binary, validate_binary_permissions, IsolateBackend, IsolationBackend,
    SandboxLimits, UnconfinedBackend,
};
use crate::marshal::{marshal, FieldMap};
use crate::pool::{PoolConfig, PoolMetrics, SlotPool};
use crate::workspace::{Workspace, WorkspaceConfig, WorkspaceManager};

/// Which isolation backend the executor drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationMode {
    /// The `isolate` sandbox. Requires root-installed isolate with cgroup
    /// support; this is the only mode that actually confines the tool.
    #[default]
    Isolate,
    /// A plain child process with a scrubbed environment. For tests and
    /// trusted local development only.
    Unconfined,
}

/// Everything the executor needs to know at construction time.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of sandbox slots.
    pub slots: usize,
    /// Resource limits applied to every invocation.
    pub limits: SandboxLimits,
    /// Isolation backend selection.
    pub isolation: IsolationMode,
    /// Workspace creation and retention settings.
    pub workspace: WorkspaceConfig,
    /// Explicit runner binary path. When `None` the runner is looked up
    /// next to the current executable (see [`find_runner_binary`]).
    pub runner_bin: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            slots: 5,
            limits: SandboxLimits::default(),
            isolation: IsolationMode::default(),
            workspace: WorkspaceConfig::default(),
            runner_bin: None,
        }
    }
}

/// Outcome of one invocation, plus where its artifacts live.
#[derive(Debug)]
pub struct Invocation {
    /// What the tool returned, or how it failed.
    pub outcome: ExecutionOutcome,
    /// The workspace directory. It stays readable for the retention window,
    /// so path results inside it can still be fetched.
    pub workspace: PathBuf,
}

/// Executes submitted tools in sandbox slots.
pub struct ToolExecutor {
    pool: SlotPool,
    workspaces: WorkspaceManager,
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor").finish_non_exhaustive()
    }
}

impl ToolExecutor {
    /// Build an executor. Fails when the runner binary cannot be found or
    /// is unsafe to use.
    pub fn new(config: ExecutorConfig) -> anyhow::Result<Self> {
        let runner_bin = match config.runner_bin {
            Some(path) => {
                let path = std::fs::canonicalize(&path).with_context(|| {
                    format!("configured runner binary not found: {}", path.display())
                })?;
                validate_binary_permissions(&path)?;
                path
            }
            None => find_runner_binary()?,
        };

        let backend: Arc<dyn IsolationBackend> = match config.isolation {
            IsolationMode::Isolate => {
                Arc::new(IsolateBackend::new(config.limits.clone(), runner_bin)?)
            }
            IsolationMode::Unconfined => Arc::new(UnconfinedBackend::new(
                config.workspace.scratch_root.join("slots"),
                runner_bin,
            )),
        };

        let pool = SlotPool::new(
            PoolConfig {
                slots: config.slots,
                wall_time: config.limits.wall_time,
            },
            backend,
        );
        let workspaces = WorkspaceManager::new(config.workspace);

        Ok(Self { pool, workspaces })
    }

    /// The workspace manager, for artifact containment checks.
    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Pool counters.
    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        self.pool.metrics()
    }

    /// Validate `source` and run its entry function with the given fields.
    ///
    /// `tool_name` is the submitted file's stem and names the entry
    /// function. Validation failures surface before any workspace or slot
    /// is touched.
    #[tracing::instrument(skip(self, source, fields), fields(tool = %tool_name))]
    pub async fn execute(
        &self,
        tool_name: &str,
        source: &str,
        fields: &FieldMap,
    ) -> Result<Invocation, ToolError> {
        let descriptor = kiln_tool::extract(tool_name, source)?;
        self.execute_extracted(&descriptor, fields).await
    }

    /// Run an already-extracted descriptor.
    pub async fn execute_extracted(
        &self,
        descriptor: &ToolDescriptor,
        fields: &FieldMap,
    ) -> Result<Invocation, ToolError> {
        let workspace = self.workspaces.acquire().await.map_err(ToolError::Sandbox)?;
        let result = self.run_in_workspace(descriptor, fields, &workspace).await;

        // The workspace handle is consumed on every path; the directory
        // itself lives on until the retention timer fires.
        let workspace_dir = workspace.path().to_path_buf();
        self.workspaces.release(workspace).await;

        let outcome = result?;
        info!(
            tool = %descriptor.entry_name,
            success = outcome.is_success(),
            "invocation finished"
        );
        Ok(Invocation {
            outcome,
            workspace: workspace_dir,
        })
    }

    async fn run_in_workspace(
        &self,
        descriptor: &ToolDescriptor,
        fields: &FieldMap,
        workspace: &Workspace,
    ) -> Result<ExecutionOutcome, ToolError> {
        let program = workspace
            .path()
            .join(format!("{}.py", descriptor.entry_name));
        tokio::fs::write(&program, descriptor.source.as_bytes())
            .await
            .map_err(|e| sandbox_io(e, "failed to stage program"))?;

        let args = marshal(descriptor, fields, workspace.path()).await?;
        let payload = kiln_codec::args_to_vec(&args)
            .map_err(|e| ToolError::Sandbox(anyhow::Error::new(e).context("failed to encode arguments")))?;
        tokio::fs::write(workspace.path().join(ARGS_FILE), payload)
            .await
            .map_err(|e| sandbox_io(e, "failed to write argument file"))?;

        let record = self
            .pool
            .run(&program, workspace.path())
            .await
            .map_err(ToolError::Sandbox)?;

        let result_path = workspace.path().join(RESULT_FILE);
        let bytes = match tokio::fs::read(&result_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    tool = %descriptor.entry_name,
                    slot = record.slot,
                    status = ?record.status.and_then(|s| s.code()),
                    timed_out = record.timed_out,
                    "runner produced no result"
                );
                return Err(ToolError::RunnerFailed);
            }
            Err(e) => return Err(sandbox_io(e, "failed to read result file")),
        };

        match kiln_codec::outcome_from_slice(&bytes) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(
                    tool = %descriptor.entry_name,
                    slot = record.slot,
                    error = %e,
                    "result envelope was malformed"
                );
                Err(ToolError::RunnerFailed)
            }
        }
    }

    /// Delete every retained workspace and refuse retention from now on.
    pub async fn shutdown(&self) {
        self.workspaces.shutdown().await;
    }
}

fn sandbox_io(e: std::io::Error, what: &'static str) -> ToolError {
    ToolError::Sandbox(anyhow::Error::new(e).context(what))
}
