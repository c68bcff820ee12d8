//! Program loading: import the submitted source and find its entry.

use std::path::Path;

use anyhow::{bail, Context, Result};
use pyo3::prelude::*;
use pyo3::types::PyModule;

/// Import `program` as a module and return its entry function.
///
/// The entry is the module-level callable named after the file stem. The
/// service verified it statically before staging, so a miss here means the
/// module rewrote or deleted it at import time. Either way this is a
/// protocol fault, not a tool failure the caller should see details of.
pub fn load_entry<'py>(
    py: Python<'py>,
    program: &Path,
    entry_name: &str,
) -> Result<Bound<'py, PyAny>> {
    let source = std::fs::read_to_string(program)
        .with_context(|| format!("failed to read program {}", program.display()))?;
    let file_name = program
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("tool.py");

    let module = PyModule::from_code_bound(py, &source, file_name, entry_name)
        .map_err(|e| anyhow::anyhow!("program failed to import: {e}"))?;
    let entry = module.getattr(entry_name).map_err(|_| {
        anyhow::anyhow!("entry '{entry_name}' vanished between validation and import")
    })?;
    if !entry.is_callable() {
        bail!("entry '{entry_name}' is not callable");
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_program(dir: &tempfile::TempDir, name: &str, source: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, source).unwrap();
        path
    }

    #[test]
    fn loads_a_module_level_function() {
        let dir = tempfile::tempdir().unwrap();
        let program = write_program(&dir, "add_one.py", "def add_one(x: int):\n    return x + 1\n");

        Python::with_gil(|py| {
            let entry = load_entry(py, &program, "add_one").unwrap();
            let result = entry.call1((41,)).unwrap();
            assert_eq!(result.extract::<i64>().unwrap(), 42);
        });
    }

    #[test]
    fn import_time_exception_is_a_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let program = write_program(
            &dir,
            "angry.py",
            "raise RuntimeError('broken at import')\n\ndef angry():\n    return 1\n",
        );

        Python::with_gil(|py| {
            let err = load_entry(py, &program, "angry").unwrap_err();
            assert!(err.to_string().contains("import"), "got: {err}");
        });
    }

    #[test]
    fn non_callable_entry_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let program = write_program(&dir, "shadow.py", "shadow = 42\n");

        Python::with_gil(|py| {
            let err = load_entry(py, &program, "shadow").unwrap_err();
            assert!(err.to_string().contains("not callable"), "got: {err}");
        });
    }

    #[test]
    fn missing_program_file_is_a_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("ghost.py");

        Python::with_gil(|py| {
            let err = load_entry(py, &program, "ghost").unwrap_err();
            assert!(err.to_string().contains("failed to read"), "got: {err}");
        });
    }
}
