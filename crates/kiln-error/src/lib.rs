//! Typed error taxonomy for the kiln tool execution pipeline.
//!
//! Provides [`ToolError`], the canonical error type returned by contract
//! extraction, argument marshalling, and sandboxed execution. Validation
//! errors (bad submissions) carry full detail for the submitter; operational
//! errors (sandbox plumbing) keep their detail internal and surface a
//! generic message.

use thiserror::Error;

/// Canonical error type for tool submission and execution.
///
/// All variants are `#[non_exhaustive]` to allow future additions without
/// breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ToolError {
    /// The submitted source is not valid Python.
    #[error("python syntax error: line {line}")]
    Syntax {
        /// 1-based line number of the first syntax error.
        line: usize,
    },

    /// No top-level function matches the submitted file's name.
    #[error("entrypoint not found: no function named '{name}'")]
    EntrypointNotFound {
        /// The function name that was required (the file stem).
        name: String,
    },

    /// An entrypoint parameter has no type annotation.
    #[error("missing annotation: parameter '{parameter}' must be annotated")]
    MissingAnnotation {
        /// The unannotated parameter.
        parameter: String,
    },

    /// An entrypoint parameter is annotated with a type outside the
    /// supported set (`int`, `float`, `str`, `Path`, `Literal[...]`).
    #[error("unsupported type: parameter '{parameter}' is annotated '{annotation}'")]
    UnsupportedType {
        /// The offending parameter.
        parameter: String,
        /// The annotation's source text.
        annotation: String,
    },

    /// A supplied argument could not be converted to its declared type.
    #[error("invalid argument '{field}': expected {expected}")]
    Coercion {
        /// The argument field that failed conversion.
        field: String,
        /// Human-readable description of what was expected.
        expected: String,
    },

    /// Sandbox or workspace plumbing failed (catch-all for operational
    /// faults). Detail is for logs, not for callers.
    #[error(transparent)]
    Sandbox(#[from] anyhow::Error),

    /// The sandbox ran but produced no result artifact.
    #[error("tool execution failed inside the sandbox")]
    RunnerFailed,
}

impl ToolError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Syntax { .. } => "SYNTAX_ERROR",
            Self::EntrypointNotFound { .. } => "ENTRYPOINT_NOT_FOUND",
            Self::MissingAnnotation { .. } => "MISSING_ANNOTATION",
            Self::UnsupportedType { .. } => "UNSUPPORTED_TYPE",
            Self::Coercion { .. } => "TYPE_COERCION",
            Self::Sandbox(_) => "SANDBOX_ERROR",
            Self::RunnerFailed => "RUNNER_FAILED",
        }
    }

    /// Returns whether this error describes a problem with the submission
    /// itself (as opposed to an operational fault in the service).
    pub fn is_validation(&self) -> bool {
        match self {
            Self::Syntax { .. } => true,
            Self::EntrypointNotFound { .. } => true,
            Self::MissingAnnotation { .. } => true,
            Self::UnsupportedType { .. } => true,
            Self::Coercion { .. } => true,
            Self::Sandbox(_) => false,
            Self::RunnerFailed => false,
        }
    }

    /// The message suitable for showing to the submitter.
    ///
    /// Validation errors describe exactly what is wrong with the submission.
    /// Operational errors collapse to a fixed phrase so that host paths,
    /// sandbox internals, and infrastructure state never leak outward.
    pub fn public_message(&self) -> String {
        if self.is_validation() {
            self.to_string()
        } else {
            "tool execution failed".to_string()
        }
    }
}

// Compile-time assertion: ToolError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<ToolError>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_syntax() {
        let err = ToolError::Syntax { line: 3 };
        assert_eq!(err.to_string(), "python syntax error: line 3");
    }

    #[test]
    fn display_entrypoint_not_found() {
        let err = ToolError::EntrypointNotFound {
            name: "double".into(),
        };
        assert_eq!(
            err.to_string(),
            "entrypoint not found: no function named 'double'"
        );
    }

    #[test]
    fn display_missing_annotation() {
        let err = ToolError::MissingAnnotation {
            parameter: "count".into(),
        };
        assert_eq!(
            err.to_string(),
            "missing annotation: parameter 'count' must be annotated"
        );
    }

    #[test]
    fn display_unsupported_type() {
        let err = ToolError::UnsupportedType {
            parameter: "data".into(),
            annotation: "dict".into(),
        };
        assert_eq!(
            err.to_string(),
            "unsupported type: parameter 'data' is annotated 'dict'"
        );
    }

    #[test]
    fn display_coercion() {
        let err = ToolError::Coercion {
            field: "count".into(),
            expected: "an integer".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid argument 'count': expected an integer"
        );
    }

    #[test]
    fn sandbox_is_display_transparent() {
        let err = ToolError::Sandbox(anyhow::anyhow!("isolate --init exited with 2"));
        assert_eq!(err.to_string(), "isolate --init exited with 2");
    }

    #[test]
    fn from_anyhow_error() {
        let inner = anyhow::anyhow!("mount failed");
        let err: ToolError = inner.into();
        assert!(matches!(err, ToolError::Sandbox(_)));
        assert_eq!(err.code(), "SANDBOX_ERROR");
    }

    #[test]
    fn code_exhaustive() {
        let cases: Vec<(ToolError, &str)> = vec![
            (ToolError::Syntax { line: 1 }, "SYNTAX_ERROR"),
            (
                ToolError::EntrypointNotFound { name: "f".into() },
                "ENTRYPOINT_NOT_FOUND",
            ),
            (
                ToolError::MissingAnnotation {
                    parameter: "p".into(),
                },
                "MISSING_ANNOTATION",
            ),
            (
                ToolError::UnsupportedType {
                    parameter: "p".into(),
                    annotation: "set".into(),
                },
                "UNSUPPORTED_TYPE",
            ),
            (
                ToolError::Coercion {
                    field: "f".into(),
                    expected: "a float".into(),
                },
                "TYPE_COERCION",
            ),
            (ToolError::Sandbox(anyhow::anyhow!("x")), "SANDBOX_ERROR"),
            (ToolError::RunnerFailed, "RUNNER_FAILED"),
        ];
        for (err, expected_code) in &cases {
            assert_eq!(err.code(), *expected_code, "wrong code for {err}");
        }
    }

    #[test]
    fn validation_classification() {
        assert!(ToolError::Syntax { line: 1 }.is_validation());
        assert!(ToolError::EntrypointNotFound { name: "f".into() }.is_validation());
        assert!(ToolError::MissingAnnotation {
            parameter: "p".into()
        }
        .is_validation());
        assert!(ToolError::UnsupportedType {
            parameter: "p".into(),
            annotation: "list".into()
        }
        .is_validation());
        assert!(ToolError::Coercion {
            field: "f".into(),
            expected: "x".into()
        }
        .is_validation());
        assert!(!ToolError::Sandbox(anyhow::anyhow!("x")).is_validation());
        assert!(!ToolError::RunnerFailed.is_validation());
    }

    #[test]
    fn public_message_keeps_validation_detail() {
        let err = ToolError::Syntax { line: 7 };
        assert_eq!(err.public_message(), "python syntax error: line 7");
    }

    #[test]
    fn public_message_masks_operational_detail() {
        let err = ToolError::Sandbox(anyhow::anyhow!("/var/local/lib/isolate/3 is busy"));
        assert_eq!(err.public_message(), "tool execution failed");
        let err = ToolError::RunnerFailed;
        assert_eq!(err.public_message(), "tool execution failed");
    }

    #[test]
    fn send_sync_static() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<ToolError>();
    }
}
