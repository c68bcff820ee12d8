//! Typed value model and JSON codec shared by the kiln host and runner.
//!
//! Arguments and results cross the sandbox boundary as JSON files
//! ([`ARGS_FILE`] and [`RESULT_FILE`] inside the invocation workspace).
//! Filesystem paths survive the trip as single-key tagged objects
//! (`{"__path__": "..."}`); captured tool exceptions travel as a
//! `{"__failure__": {...}}` envelope in the result file. Both sides of the
//! boundary depend on this crate so the wire shape is defined exactly once.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// File name of the argument payload inside a workspace.
pub const ARGS_FILE: &str = "args.json";

/// File name of the result envelope inside a workspace.
pub const RESULT_FILE: &str = "result.json";

/// Object key marking an encoded filesystem path.
pub const PATH_TAG: &str = "__path__";

/// Object key marking a captured in-tool failure in the result envelope.
pub const FAILURE_TAG: &str = "__failure__";

/// Errors produced while encoding or decoding tool values.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON serialization or parsing failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading or writing a payload file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A NaN or infinite float has no JSON representation.
    #[error("non-finite float cannot be encoded")]
    NonFiniteFloat,

    /// The argument payload was not a JSON object.
    #[error("argument payload must be a JSON object")]
    ArgsNotObject,
}

/// A value crossing the sandbox boundary.
///
/// This is the closed set of shapes the service moves between caller, tool,
/// and result: JSON scalars and containers plus tagged filesystem paths.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolValue {
    /// JSON `null` / Python `None`.
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A float.
    Float(f64),
    /// A text string.
    Str(String),
    /// A filesystem path, wire-encoded as `{"__path__": "..."}`.
    Path(PathBuf),
    /// An ordered sequence.
    List(Vec<ToolValue>),
    /// A string-keyed mapping.
    Map(BTreeMap<String, ToolValue>),
}

impl ToolValue {
    /// Returns the contained path if this value is a [`ToolValue::Path`].
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(p) => Some(p),
            _ => None,
        }
    }
}

/// Encode a [`ToolValue`] into its wire JSON form.
pub fn to_json(value: &ToolValue) -> Result<Value, CodecError> {
    match value {
        ToolValue::Null => Ok(Value::Null),
        ToolValue::Bool(b) => Ok(Value::Bool(*b)),
        ToolValue::Int(i) => Ok(Value::Number((*i).into())),
        ToolValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .ok_or(CodecError::NonFiniteFloat),
        ToolValue::Str(s) => Ok(Value::String(s.clone())),
        ToolValue::Path(p) => {
            let mut obj = serde_json::Map::with_capacity(1);
            obj.insert(
                PATH_TAG.to_string(),
                Value::String(p.to_string_lossy().into_owned()),
            );
            Ok(Value::Object(obj))
        }
        ToolValue::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(to_json(item)?);
            }
            Ok(Value::Array(out))
        }
        ToolValue::Map(entries) => {
            let mut obj = serde_json::Map::with_capacity(entries.len());
            for (key, item) in entries {
                obj.insert(key.clone(), to_json(item)?);
            }
            Ok(Value::Object(obj))
        }
    }
}

/// Decode wire JSON into a [`ToolValue`].
///
/// Only an object whose *sole* key is [`PATH_TAG`] with a string value
/// decodes as a path; an object with extra keys, or a non-string tag value,
/// stays an ordinary map. A genuine user map of that exact shape is
/// indistinguishable from a tagged path; the tag key is reserved.
pub fn from_json(value: &Value) -> ToolValue {
    match value {
        Value::Null => ToolValue::Null,
        Value::Bool(b) => ToolValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ToolValue::Int(i)
            } else {
                // u64-only and lossy cases both land here; JSON numbers
                // outside i64 degrade to f64
                ToolValue::Float(n.as_f64().unwrap_or(f64::MAX))
            }
        }
        Value::String(s) => ToolValue::Str(s.clone()),
        Value::Array(items) => ToolValue::List(items.iter().map(from_json).collect()),
        Value::Object(obj) => {
            if obj.len() == 1 {
                if let Some(Value::String(path)) = obj.get(PATH_TAG) {
                    return ToolValue::Path(PathBuf::from(path));
                }
            }
            ToolValue::Map(
                obj.iter()
                    .map(|(k, v)| (k.clone(), from_json(v)))
                    .collect(),
            )
        }
    }
}

/// A captured exception from inside the tool, as recorded by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeFailure {
    /// The exception type name (for example `ValueError`).
    pub kind: String,
    /// A condensed traceback, truncated from the front when oversized.
    pub trace: String,
}

/// What an invocation produced: a value, or a captured in-tool failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The entry function returned; here is its (decoded) return value.
    Success(ToolValue),
    /// The entry function raised; here is the captured failure.
    Failure(RuntimeFailure),
}

impl ExecutionOutcome {
    /// Returns `true` for [`ExecutionOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Encode an outcome into the result envelope JSON.
pub fn encode_outcome(outcome: &ExecutionOutcome) -> Result<Value, CodecError> {
    match outcome {
        ExecutionOutcome::Success(value) => to_json(value),
        ExecutionOutcome::Failure(failure) => {
            let mut obj = serde_json::Map::with_capacity(1);
            obj.insert(FAILURE_TAG.to_string(), serde_json::to_value(failure)?);
            Ok(Value::Object(obj))
        }
    }
}

/// Decode a result envelope back into an outcome.
///
/// A single-key [`FAILURE_TAG`] object is a captured failure; anything else
/// is a success value. The tag key is reserved (see [`from_json`]).
pub fn decode_outcome(value: &Value) -> Result<ExecutionOutcome, CodecError> {
    if let Value::Object(obj) = value {
        if obj.len() == 1 {
            if let Some(inner) = obj.get(FAILURE_TAG) {
                let failure: RuntimeFailure = serde_json::from_value(inner.clone())?;
                return Ok(ExecutionOutcome::Failure(failure));
            }
        }
    }
    Ok(ExecutionOutcome::Success(from_json(value)))
}

// ---------------------------------------------------------------------------
// Argument payloads
// ---------------------------------------------------------------------------

/// Marshalled keyword arguments for one invocation.
pub type ArgMap = BTreeMap<String, ToolValue>;

/// Encode marshalled arguments into the `args.json` byte payload.
pub fn args_to_vec(args: &ArgMap) -> Result<Vec<u8>, CodecError> {
    let mut obj = serde_json::Map::with_capacity(args.len());
    for (name, value) in args {
        obj.insert(name.clone(), to_json(value)?);
    }
    Ok(serde_json::to_vec(&Value::Object(obj))?)
}

/// Decode an `args.json` byte payload into marshalled arguments.
pub fn args_from_slice(bytes: &[u8]) -> Result<ArgMap, CodecError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(obj) = value else {
        return Err(CodecError::ArgsNotObject);
    };
    Ok(obj
        .iter()
        .map(|(k, v)| (k.clone(), from_json(v)))
        .collect())
}

/// Encode an outcome into the `result.json` byte payload.
pub fn outcome_to_vec(outcome: &ExecutionOutcome) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(&encode_outcome(outcome)?)?)
}

/// Decode a `result.json` byte payload.
pub fn outcome_from_slice(bytes: &[u8]) -> Result<ExecutionOutcome, CodecError> {
    let value: Value = serde_json::from_slice(bytes)?;
    decode_outcome(&value)
}

// ---------------------------------------------------------------------------
// Workspace file protocol (blocking; the runner has no async runtime)
// ---------------------------------------------------------------------------

/// Read and decode the argument payload from a workspace directory.
pub fn read_args(workspace: &Path) -> Result<ArgMap, CodecError> {
    let bytes = std::fs::read(workspace.join(ARGS_FILE))?;
    args_from_slice(&bytes)
}

/// Encode and write the result envelope into a workspace directory.
pub fn write_result(workspace: &Path, outcome: &ExecutionOutcome) -> Result<(), CodecError> {
    let bytes = outcome_to_vec(outcome)?;
    std::fs::write(workspace.join(RESULT_FILE), bytes)?;
    Ok(())
}

/// Read the result envelope from a workspace directory, if present.
///
/// Returns `Ok(None)` when the file does not exist, which is how a crashed
/// runner looks from the host side.
pub fn read_result(workspace: &Path) -> Result<Option<ExecutionOutcome>, CodecError> {
    let bytes = match std::fs::read(workspace.join(RESULT_FILE)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(outcome_from_slice(&bytes)?))
}
