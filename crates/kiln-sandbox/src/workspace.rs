//! Invocation workspace lifecycle: creation, retention, deletion.
//!
//! Every invocation gets a fresh directory under the scratch root with an
//! unpredictable 32-character name. The tool reads its inputs there and may
//! leave result artifacts behind; the directory outlives the invocation by a
//! retention window so callers can fetch those artifacts, then it is deleted.
//! Shutdown cancels all retention timers and deletes everything before
//! returning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Alphabet for workspace names. 64 characters, so each position draws
/// 6 bits from the generator.
const NAME_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Length of a workspace directory name.
const NAME_LEN: usize = 32;

/// Settings for workspace handling.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Directory under which invocation workspaces are created.
    pub scratch_root: PathBuf,
    /// How long a workspace outlives its invocation.
    pub retention: Duration,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            scratch_root: std::env::temp_dir().join("kiln"),
            retention: Duration::from_secs(600),
        }
    }
}

/// Handle to a live invocation workspace.
///
/// Obtained from [`WorkspaceManager::acquire`] and consumed by
/// [`WorkspaceManager::release`], so a workspace cannot be released twice.
#[derive(Debug)]
pub struct Workspace {
    name: String,
    path: PathBuf,
}

impl Workspace {
    /// Absolute path of the workspace directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The random directory name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A scheduled deletion that can be pulled forward at shutdown.
struct PendingDelete {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns the scratch root and every workspace under it.
pub struct WorkspaceManager {
    config: WorkspaceConfig,
    pending: Arc<Mutex<HashMap<String, PendingDelete>>>,
    shutting_down: Arc<Mutex<bool>>,
}

impl WorkspaceManager {
    /// Create a manager for the given scratch root. The root itself is
    /// created lazily on first acquire.
    pub fn new(config: WorkspaceConfig) -> Self {
        Self {
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            shutting_down: Arc::new(Mutex::new(false)),
        }
    }

    /// The configured scratch root.
    pub fn scratch_root(&self) -> &Path {
        &self.config.scratch_root
    }

    /// Create a fresh workspace directory.
    ///
    /// Names are drawn from a thread-local CSPRNG, so they are not guessable
    /// from earlier names. The directory is made world-accessible because
    /// the sandboxed process runs under a different uid than the service.
    pub async fn acquire(&self) -> anyhow::Result<Workspace> {
        tokio::fs::create_dir_all(&self.config.scratch_root)
            .await
            .with_context(|| {
                format!(
                    "failed to create scratch root {}",
                    self.config.scratch_root.display()
                )
            })?;

        loop {
            let name = random_name();
            let path = self.config.scratch_root.join(&name);
            match tokio::fs::create_dir(&path).await {
                Ok(()) => {
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777))
                            .await
                            .context("failed to open workspace permissions")?;
                    }
                    debug!(workspace = %name, "created workspace");
                    return Ok(Workspace { name, path });
                }
                // 64^32 names make this a once-in-a-lifetime branch, but it
                // must not hand out a directory another invocation owns
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(anyhow::Error::new(e).context("failed to create workspace"));
                }
            }
        }
    }

    /// Hand the workspace back and start its retention timer.
    ///
    /// The directory is deleted after the retention window, or immediately
    /// if the manager is already shutting down. Deletion is best-effort; a
    /// failure is logged and the scratch root is left to operator cleanup.
    pub async fn release(&self, workspace: Workspace) {
        let Workspace { name, path } = workspace;

        if *self.shutting_down.lock().await {
            remove_workspace(&path, &name).await;
            return;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let retention = self.config.retention;
        let registry = Arc::clone(&self.pending);
        let task_name = name.clone();

        let mut pending = self.pending.lock().await;
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(retention) => {}
                _ = cancel_rx => {}
            }
            remove_workspace(&path, &task_name).await;
            registry.lock().await.remove(&task_name);
        });
        pending.insert(
            name,
            PendingDelete {
                cancel: cancel_tx,
                handle,
            },
        );
    }

    /// Cancel every retention timer and delete all pending workspaces.
    ///
    /// Returns only after every directory has been removed. Workspaces
    /// released after this call are deleted immediately.
    pub async fn shutdown(&self) {
        *self.shutting_down.lock().await = true;

        // Drain under the lock, await outside it: the deletion tasks
        // deregister themselves and would otherwise block on this mutex.
        let drained: Vec<PendingDelete> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, entry)| entry).collect()
        };

        for entry in drained {
            let _ = entry.cancel.send(());
            if let Err(e) = entry.handle.await {
                warn!(error = %e, "workspace deletion task failed");
            }
        }
    }

    /// Resolve `candidate` and return it only if it is an existing regular
    /// file inside the scratch root.
    ///
    /// This is the containment check for anything that serves workspace
    /// artifacts outward: a path that escapes the scratch root, or names a
    /// directory, resolves to `None`.
    pub async fn resolve_under_scratch(&self, candidate: &Path) -> Option<PathBuf> {
        let root = tokio::fs::canonicalize(&self.config.scratch_root).await.ok()?;
        let resolved = tokio::fs::canonicalize(candidate).await.ok()?;
        if !resolved.starts_with(&root) {
            return None;
        }
        let meta = tokio::fs::metadata(&resolved).await.ok()?;
        if meta.is_file() {
            Some(resolved)
        } else {
            None
        }
    }
}

fn random_name() -> String {
    let mut rng = rand::rng();
    (0..NAME_LEN)
        .map(|_| {
            let idx = rng.random_range(0..NAME_ALPHABET.len());
            NAME_ALPHABET[idx] as char
        })
        .collect()
}

async fn remove_workspace(path: &Path, name: &str) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!(workspace = name, "deleted workspace"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(workspace = name, error = %e, "failed to delete workspace"),
    }
}
