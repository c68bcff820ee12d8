//! Argument marshalling: caller-supplied fields to typed keyword arguments.
//!
//! Every field is checked against the declared parameter type before
//! anything reaches the sandbox. Text fields are coerced with the same
//! tolerance Python's own constructors have (surrounding whitespace is
//! fine, anything else is not), uploads are staged into the workspace under
//! their base name, and `Literal` parameters accept exactly the declared
//! options. A parameter with no matching field is simply omitted so the
//! function's own default applies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use kiln_codec::{ArgMap, ToolValue, ARGS_FILE, RESULT_FILE};
use kiln_error::ToolError;
use kiln_tool::{ParameterType, ToolDescriptor};

/// One caller-supplied argument field.
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// Plain text, as from a form field or a command line.
    Text(String),
    /// An uploaded file with its original name and raw content.
    Upload {
        /// File name as the caller sent it. Only the base name is kept.
        filename: String,
        /// Raw file bytes.
        content: Vec<u8>,
    },
}

/// Collected fields of one submission, keyed by parameter name.
pub type FieldMap = HashMap<String, FieldValue>;

/// Check `fields` against the descriptor and build the argument map,
/// staging uploads into `workspace` along the way.
///
/// Fields with no matching parameter are ignored.
pub async fn marshal(
    descriptor: &ToolDescriptor,
    fields: &FieldMap,
    workspace: &Path,
) -> Result<ArgMap, ToolError> {
    let mut args = ArgMap::new();
    for param in &descriptor.parameters {
        let Some(field) = fields.get(&param.name) else {
            continue;
        };
        let value = match (&param.declared, field) {
            (ParameterType::Path, FieldValue::Upload { filename, content }) => {
                let staged =
                    stage_upload(descriptor, workspace, &param.name, filename, content).await?;
                ToolValue::Path(staged)
            }
            (ParameterType::Path, FieldValue::Text(_)) => {
                return Err(coercion(&param.name, "an uploaded file"));
            }
            (_, FieldValue::Upload { .. }) => {
                return Err(coercion(&param.name, "a text value, not a file"));
            }
            (ParameterType::Int, FieldValue::Text(text)) => {
                let parsed = text
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| coercion(&param.name, "an integer"))?;
                ToolValue::Int(parsed)
            }
            (ParameterType::Float, FieldValue::Text(text)) => {
                let parsed = text
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| coercion(&param.name, "a number"))?;
                if !parsed.is_finite() {
                    return Err(coercion(&param.name, "a finite number"));
                }
                ToolValue::Float(parsed)
            }
            (ParameterType::Str, FieldValue::Text(text)) => ToolValue::Str(text.clone()),
            (ParameterType::LiteralOf(options), FieldValue::Text(text)) => {
                if !options.contains(text) {
                    let listed = options.iter().cloned().collect::<Vec<_>>().join(", ");
                    return Err(coercion(&param.name, &format!("one of: {listed}")));
                }
                ToolValue::Str(text.clone())
            }
        };
        args.insert(param.name.clone(), value);
    }
    Ok(args)
}

fn coercion(field: &str, expected: &str) -> ToolError {
    ToolError::Coercion {
        field: field.to_string(),
        expected: expected.to_string(),
    }
}

/// Write an upload into the workspace under its base name.
///
/// The caller-sent filename is reduced to its final component, so traversal
/// sequences cannot place the file outside the workspace. Names the service
/// itself writes (the program file and the protocol files) are refused.
async fn stage_upload(
    descriptor: &ToolDescriptor,
    workspace: &Path,
    field: &str,
    filename: &str,
    content: &[u8],
) -> Result<PathBuf, ToolError> {
    let base = Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty());
    let Some(base) = base else {
        return Err(coercion(field, "an upload with a usable file name"));
    };

    let program_file = format!("{}.py", descriptor.entry_name);
    if base == ARGS_FILE || base == RESULT_FILE || base == program_file {
        return Err(coercion(field, "a file name not reserved by the service"));
    }

    let dest = workspace.join(base);
    tokio::fs::write(&dest, content).await.map_err(|e| {
        ToolError::Sandbox(anyhow::Error::new(e).context(format!(
            "failed to stage upload for field '{field}'"
        )))
    })?;
    Ok(dest)
}
