#![warn(missing_docs)]

//! # kiln-sandbox
//!
//! Sandboxed execution of single-file Python tools.
//!
//! Submitted source is validated structurally (never imported on the host),
//! staged into a throwaway workspace together with its marshalled arguments,
//! and executed by the `kiln-runner` binary inside an `isolate` box. Results
//! come back through a JSON file protocol, so nothing the tool prints or
//! does can talk to the service directly.
//!
//! ## Security model
//!
//! - **No host-side import**: The contract is read from the AST; submitted
//!   code first runs inside the sandbox
//! - **isolate boxes**: Separate pid/mount/net namespaces with cgroup
//!   memory and process caps
//! - **Slot locking**: One invocation per box at a time, unpredictable
//!   workspace names between invocations
//! - **Scrubbed environment**: The runner starts from an empty environment
//!   in every backend
//! - **Wall-clock guard**: The host kills the sandbox shortly after its
//!   own time limit, even if `isolate` wedges
//! - **Contained artifacts**: Path results are only served from under the
//!   scratch root

pub mod backend;
pub mod executor;
pub mod marshal;
pub mod pool;
pub mod workspace;

pub use backend::{
    find_runner_binary, IsolateBackend, IsolationBackend, SandboxLimits, UnconfinedBackend,
    RUNNER_BIN_NAME,
};
pub use executor::{ExecutorConfig, Invocation, IsolationMode, ToolExecutor};
pub use marshal::{marshal, FieldMap, FieldValue};
pub use pool::{PoolConfig, PoolMetrics, RunRecord, SlotPool};
pub use workspace::{Workspace, WorkspaceConfig, WorkspaceManager};

// The executor is shared across request handlers.
const _: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<ToolExecutor>();
    assert_send_sync::<WorkspaceManager>();
};
