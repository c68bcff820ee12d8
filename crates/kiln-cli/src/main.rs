//! Command line front end for the kiln tool execution service.
//!
//! Takes a single-file Python tool plus `name=value` argument pairs, runs the
//! tool in an isolation sandbox, and prints the outcome as JSON on stdout.
//! Logs go to stderr so stdout stays machine-readable.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use kiln_codec::{to_json, ExecutionOutcome, ToolValue};
use kiln_config::KilnConfig;
use kiln_sandbox::{
    ExecutorConfig, FieldMap, FieldValue, Invocation, IsolationMode, ToolExecutor,
    WorkspaceManager,
};
use serde_json::Value;
use tracing::{debug, info, warn};

const USAGE: &str = "\
Usage: kiln [OPTIONS] <tool.py> [name=value | name=@file]...

Runs a single-file Python tool in an isolation sandbox and prints its
result as JSON on stdout.

Each name=value pair fills the tool parameter of that name. name=@file
uploads the named file's content; the tool receives it as a path inside
its workspace.

Options:
      --config <FILE>   Configuration file (default: $KILN_CONFIG, ./kiln.toml)
      --keep            Retain the invocation workspace instead of deleting it
      --unconfined      Run without the isolate sandbox (trusted input only)
  -h, --help            Print this help
  -V, --version         Print version

Exit codes:
  0  the tool ran and returned a value
  1  the tool raised an exception
  2  the submission or its arguments were rejected
  3  the service itself failed
";

/// Parsed command line.
#[derive(Debug, Clone, PartialEq)]
struct CliArgs {
    config: Option<PathBuf>,
    keep: bool,
    unconfined: bool,
    tool: PathBuf,
    fields: Vec<(String, FieldSource)>,
}

/// Where a field's value comes from.
#[derive(Debug, Clone, PartialEq)]
enum FieldSource {
    /// Inline text from the command line.
    Text(String),
    /// A file to upload, given as `name=@path`.
    File(PathBuf),
}

#[tokio::main]
async fn main() -> ExitCode {
    let raw: Vec<String> = std::env::args().skip(1).collect();

    // Version and help must work even with a broken config or environment.
    if raw.iter().any(|arg| arg == "--version" || arg == "-V") {
        println!("kiln {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }
    if raw.is_empty() || raw.iter().any(|arg| arg == "--help" || arg == "-h") {
        print!("{USAGE}");
        return ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args(&raw) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("kiln: {err:#}");
            eprint!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("kiln: {err:#}");
            ExitCode::from(3)
        }
    }
}

async fn run(args: CliArgs) -> Result<ExitCode> {
    let config = load_config(&args)?;
    let executor = ToolExecutor::new(build_executor_config(&config, args.unconfined))
        .context("failed to initialize the executor")?;

    let tool_name = args
        .tool
        .file_stem()
        .and_then(|stem| stem.to_str())
        .with_context(|| format!("cannot derive a tool name from {}", args.tool.display()))?
        .to_string();
    let source = tokio::fs::read_to_string(&args.tool)
        .await
        .with_context(|| format!("failed to read {}", args.tool.display()))?;
    let fields = load_fields(args.fields).await?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        tool = %tool_name,
        "kiln starting"
    );

    let result = tokio::select! {
        result = executor.execute(&tool_name, &source, &fields) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, cleaning up");
            executor.shutdown().await;
            return Ok(ExitCode::from(130));
        }
    };

    let invocation = match result {
        Ok(invocation) => invocation,
        Err(err) => {
            let body = serde_json::json!({
                "error": { "code": err.code(), "message": err.public_message() }
            });
            println!("{body:#}");
            executor.shutdown().await;
            let code = if err.is_validation() { 2 } else { 3 };
            return Ok(ExitCode::from(code));
        }
    };

    let artifacts = resolve_artifacts(executor.workspaces(), &invocation).await;
    let keep = args.keep || !artifacts.is_empty();

    let code = match &invocation.outcome {
        ExecutionOutcome::Success(value) => {
            let rendered =
                to_json(value).context("result value could not be rendered as JSON")?;
            let mut body = serde_json::Map::new();
            body.insert("result".to_string(), rendered);
            if keep {
                body.insert(
                    "workspace".to_string(),
                    Value::String(invocation.workspace.display().to_string()),
                );
            }
            if !artifacts.is_empty() {
                body.insert(
                    "artifacts".to_string(),
                    Value::Array(
                        artifacts
                            .iter()
                            .map(|path| Value::String(path.display().to_string()))
                            .collect(),
                    ),
                );
            }
            println!("{:#}", Value::Object(body));
            ExitCode::SUCCESS
        }
        ExecutionOutcome::Failure(failure) => {
            let body = serde_json::json!({
                "error": { "kind": failure.kind, "trace": failure.trace }
            });
            println!("{body:#}");
            ExitCode::from(1)
        }
    };

    if keep {
        info!(workspace = %invocation.workspace.display(), "workspace retained");
    } else {
        executor.shutdown().await;
    }

    Ok(code)
}

/// Parse everything after the program name.
fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut config = None;
    let mut keep = false;
    let mut unconfined = false;
    let mut tool: Option<PathBuf> = None;
    let mut fields = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let value = iter.next().context("--config requires a file path")?;
                config = Some(PathBuf::from(value));
            }
            "--keep" => keep = true,
            "--unconfined" => unconfined = true,
            flag if flag.starts_with('-') => bail!("unknown option '{flag}'"),
            positional => {
                if tool.is_none() {
                    tool = Some(PathBuf::from(positional));
                } else {
                    fields.push(parse_field(positional)?);
                }
            }
        }
    }

    Ok(CliArgs {
        config,
        keep,
        unconfined,
        tool: tool.context("no tool file given")?,
        fields,
    })
}

/// Split one `name=value` or `name=@file` argument.
fn parse_field(raw: &str) -> Result<(String, FieldSource)> {
    let (name, value) = raw
        .split_once('=')
        .with_context(|| format!("field '{raw}' is not name=value or name=@file"))?;
    if name.is_empty() {
        bail!("field '{raw}' has an empty name");
    }
    let source = match value.strip_prefix('@') {
        Some(path) if !path.is_empty() => FieldSource::File(PathBuf::from(path)),
        Some(_) => bail!("field '{name}' names no upload file after '@'"),
        None => FieldSource::Text(value.to_string()),
    };
    Ok((name.to_string(), source))
}

/// Locate the configuration file.
///
/// Search order:
/// 1. `KILN_CONFIG` environment variable
/// 2. `kiln.toml` in the current directory
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KILN_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let local = PathBuf::from("kiln.toml");
    local.exists().then_some(local)
}

fn load_config(args: &CliArgs) -> Result<KilnConfig> {
    match args.config.clone().or_else(find_config_file) {
        Some(path) => {
            info!(path = %path.display(), "loading config");
            KilnConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            debug!("no config file found, using defaults");
            Ok(KilnConfig::default())
        }
    }
}

/// Turn configuration overrides into an executor config, starting from the
/// compiled-in defaults.
fn build_executor_config(config: &KilnConfig, unconfined: bool) -> ExecutorConfig {
    let mut exec = ExecutorConfig::default();

    if let Some(slots) = config.sandbox.slots {
        exec.slots = slots;
    }
    if let Some(secs) = config.sandbox.wall_time_secs {
        exec.limits.wall_time = Duration::from_secs(secs);
    }
    if let Some(kib) = config.sandbox.memory_limit_kib {
        exec.limits.memory_limit_kib = kib;
    }
    if let Some(count) = config.sandbox.process_limit {
        exec.limits.process_limit = count;
    }
    if let Some(share) = config.sandbox.share_net {
        exec.limits.share_net = share;
    }
    if unconfined || config.sandbox.isolation.as_deref() == Some("none") {
        exec.isolation = IsolationMode::Unconfined;
    }
    if let Some(path) = &config.sandbox.runner_bin {
        exec.runner_bin = Some(PathBuf::from(path));
    }
    if let Some(root) = &config.workspace.scratch_root {
        exec.workspace.scratch_root = PathBuf::from(root);
    }
    if let Some(secs) = config.workspace.retention_secs {
        exec.workspace.retention = Duration::from_secs(secs);
    }

    exec
}

/// Read upload files and assemble the field map handed to the executor.
async fn load_fields(specs: Vec<(String, FieldSource)>) -> Result<FieldMap> {
    let mut fields = FieldMap::new();
    for (name, source) in specs {
        let value = match source {
            FieldSource::Text(text) => FieldValue::Text(text),
            FieldSource::File(path) => {
                let content = tokio::fs::read(&path).await.with_context(|| {
                    format!("failed to read upload for '{name}': {}", path.display())
                })?;
                let filename = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .with_context(|| {
                        format!(
                            "upload path for '{name}' has no usable file name: {}",
                            path.display()
                        )
                    })?
                    .to_string();
                FieldValue::Upload { filename, content }
            }
        };
        fields.insert(name, value);
    }
    Ok(fields)
}

/// Resolve path results to absolute locations inside the scratch root.
///
/// Relative paths are taken relative to the invocation workspace. Anything
/// resolving outside the scratch root, or to nothing at all, is dropped with
/// a warning rather than handed to the caller.
async fn resolve_artifacts(
    workspaces: &WorkspaceManager,
    invocation: &Invocation,
) -> Vec<PathBuf> {
    let mut raw = Vec::new();
    if let ExecutionOutcome::Success(value) = &invocation.outcome {
        collect_paths(value, &mut raw);
    }

    let mut resolved = Vec::new();
    for path in raw {
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            invocation.workspace.join(path)
        };
        match workspaces.resolve_under_scratch(&candidate).await {
            Some(real) => resolved.push(real),
            None => warn!(
                path = %path.display(),
                "path result does not resolve to a workspace file"
            ),
        }
    }
    resolved
}

/// Collect every path value in a result, depth first.
fn collect_paths<'v>(value: &'v ToolValue, out: &mut Vec<&'v Path>) {
    match value {
        ToolValue::Path(path) => out.push(path),
        ToolValue::List(items) => {
            for item in items {
                collect_paths(item, out);
            }
        }
        ToolValue::Map(entries) => {
            for item in entries.values() {
                collect_paths(item, out);
            }
        }
        _ => {}
    }
}
