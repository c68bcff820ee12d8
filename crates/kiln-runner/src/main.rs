//! kiln-runner, the inside-the-sandbox half of the execution protocol.
//!
//! Spawned by the service once per invocation with two arguments: the
//! staged program and the workspace directory. It reads `args.json` from
//! the workspace, imports the program, calls the entry function with the
//! decoded keyword arguments, and writes `result.json` back. An exception
//! raised by the tool is a captured result; anything that breaks the
//! protocol itself (unreadable workspace, a program that will not import)
//! exits nonzero with no result file instead.
//!
//! **Security**: this process runs with whatever confinement the backend
//! set up around it. The environment is scrubbed on entry; only `HOME`
//! survives, because tools are allowed to treat the sandbox home as theirs.

mod convert;
mod load;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use pyo3::prelude::*;

use kiln_codec::{ArgMap, ExecutionOutcome, RuntimeFailure};

use crate::convert::ValueBridge;

/// How much of a failure traceback is kept, counted from the end.
const TRACE_TAIL_LINES: usize = 40;

fn main() -> Result<()> {
    scrub_environment();

    // stderr only; the sandbox discards it unless debugging is on
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let mut args = std::env::args_os().skip(1);
    let (program, workspace) = match (args.next(), args.next(), args.next()) {
        (Some(program), Some(workspace), None) => {
            (PathBuf::from(program), PathBuf::from(workspace))
        }
        _ => bail!("usage: kiln-runner <program.py> <workspace>"),
    };

    // Tools run with the workspace as their working directory, so relative
    // paths they create land next to their inputs.
    std::env::set_current_dir(&workspace)
        .with_context(|| format!("failed to enter workspace {}", workspace.display()))?;
    let workspace = Path::new(".");

    let args_map = kiln_codec::read_args(workspace).context("failed to read argument payload")?;

    let entry_name = program
        .file_stem()
        .and_then(|stem| stem.to_str())
        .context("program path has no usable stem")?
        .to_string();

    let outcome = Python::with_gil(|py| run_tool(py, &program, &entry_name, &args_map))?;

    kiln_codec::write_result(workspace, &outcome).context("failed to write result payload")?;
    Ok(())
}

/// Remove every inherited environment variable except `HOME`.
fn scrub_environment() {
    let home = std::env::var_os("HOME");
    let keys: Vec<String> = std::env::vars().map(|(key, _)| key).collect();
    for key in keys {
        std::env::remove_var(&key);
    }
    if let Some(home) = home {
        std::env::set_var("HOME", home);
    }
}

fn run_tool(
    py: Python<'_>,
    program: &Path,
    entry_name: &str,
    args: &ArgMap,
) -> Result<ExecutionOutcome> {
    let bridge = ValueBridge::new(py)
        .map_err(|e| anyhow::anyhow!("failed to import pathlib: {e}"))?;
    let entry = load::load_entry(py, program, entry_name)?;
    let kwargs = bridge
        .kwargs(py, args)
        .map_err(|e| anyhow::anyhow!("failed to build keyword arguments: {e}"))?;

    match entry.call((), Some(&kwargs)) {
        Ok(value) => match bridge.to_value(&value) {
            Ok(value) => Ok(ExecutionOutcome::Success(value)),
            Err(e) => Ok(ExecutionOutcome::Failure(RuntimeFailure {
                kind: "UnserializableResult".to_string(),
                trace: e.to_string(),
            })),
        },
        Err(err) => Ok(ExecutionOutcome::Failure(describe_failure(py, &err))),
    }
}

/// Render a raised exception the way Python itself would, bounded in size.
fn describe_failure(py: Python<'_>, err: &PyErr) -> RuntimeFailure {
    let kind = err
        .get_type_bound(py)
        .getattr("__name__")
        .ok()
        .and_then(|name| name.extract::<String>().ok())
        .unwrap_or_else(|| "Exception".to_string());

    let rendered = err
        .traceback_bound(py)
        .and_then(|tb| tb.format().ok())
        .unwrap_or_default();
    let summary = match err.value_bound(py).str() {
        Ok(text) => format!("{kind}: {}", text.to_string_lossy()),
        Err(_) => kind.clone(),
    };

    RuntimeFailure {
        kind,
        trace: tail_lines(&format!("{rendered}{summary}"), TRACE_TAIL_LINES),
    }
}

fn tail_lines(text: &str, keep: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= keep {
        text.trim_end().to_string()
    } else {
        lines[lines.len() - keep..].join("\n")
    }
}
