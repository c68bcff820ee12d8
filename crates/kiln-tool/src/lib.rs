//! Static extraction of typed parameter contracts from Python tool sources.
//!
//! A tool is one Python file whose entry function carries the file's name.
//! [`extract`] parses the source (it is never imported or executed here),
//! locates that function among the top-level `def` statements, and turns its
//! annotated parameters into a [`ToolDescriptor`]: the closed, typed contract
//! everything downstream (marshalling, form rendering, staging) trusts.
//!
//! Annotations are matched structurally against the supported grammar and
//! never evaluated. The whole annotation surface is the [`ParameterType`]
//! union; anything outside it is rejected up front rather than discovered at
//! call time inside the sandbox.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use kiln_error::ToolError;
use regex::Regex;
use rustpython_parser::ast::{self, Ranged};
use rustpython_parser::Parse;

mod tags;

/// Shape of a valid entry name (and therefore a stageable file stem).
///
/// Anything else can never match a `def` and would not be safe to splice
/// into a workspace file name.
static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// The declared type of one entry-function parameter.
///
/// This is the entire annotation surface the service accepts. Adding a
/// variant here is the only way a new parameter type enters the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterType {
    /// `int`
    Int,
    /// `float`
    Float,
    /// `str`
    Str,
    /// `Path`: the caller sends a file, the tool receives a `pathlib.Path`.
    Path,
    /// `Literal["a", "b", ...]`: a closed set of string options.
    LiteralOf(BTreeSet<String>),
}

/// One parameter of the entry function, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    /// Parameter name.
    pub name: String,
    /// Declared type, parsed from the annotation.
    pub declared: ParameterType,
    /// Display text of the default value, if the parameter has one.
    /// String-literal defaults are recorded without their quotes.
    pub default: Option<String>,
}

/// The extracted contract of one submitted tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDescriptor {
    /// Entry function name (equal to the submitted file's stem).
    pub entry_name: String,
    /// The full submitted source, kept for staging into workspaces.
    pub source: String,
    /// Entry parameters in declaration order.
    pub parameters: Vec<ParameterSpec>,
    /// Tags from the first source line, plus the entry name itself.
    pub tags: BTreeSet<String>,
}

/// Parse `source` and extract the contract for the tool named `tool_name`.
///
/// `tool_name` is the submitted file's stem; the entry function must be a
/// top-level synchronous `def` with exactly that name. Only plain
/// positional-or-keyword parameters participate in the contract.
pub fn extract(tool_name: &str, source: &str) -> Result<ToolDescriptor, ToolError> {
    if !IDENT_RE.is_match(tool_name) {
        return Err(ToolError::EntrypointNotFound {
            name: tool_name.to_string(),
        });
    }

    let suite = ast::Suite::parse(source, "<submission>").map_err(|err| {
        let offset = usize::from(err.offset).min(source.len());
        ToolError::Syntax {
            line: 1 + source[..offset].bytes().filter(|b| *b == b'\n').count(),
        }
    })?;

    let entry = suite
        .iter()
        .find_map(|stmt| match stmt {
            ast::Stmt::FunctionDef(def) if def.name.as_str() == tool_name => Some(def),
            _ => None,
        })
        .ok_or_else(|| ToolError::EntrypointNotFound {
            name: tool_name.to_string(),
        })?;

    let mut parameters = Vec::with_capacity(entry.args.args.len());
    for arg in &entry.args.args {
        let name = arg.def.arg.to_string();
        let annotation = arg
            .def
            .annotation
            .as_deref()
            .ok_or_else(|| ToolError::MissingAnnotation {
                parameter: name.clone(),
            })?;
        let declared = parse_annotation(annotation, source, &name)?;
        let default = arg.default.as_deref().map(|expr| render_default(expr, source));
        parameters.push(ParameterSpec {
            name,
            declared,
            default,
        });
    }

    let mut tags = tags::parse(source);
    tags.insert(tool_name.to_string());

    Ok(ToolDescriptor {
        entry_name: tool_name.to_string(),
        source: source.to_string(),
        parameters,
        tags,
    })
}

/// Match an annotation expression against the supported grammar.
fn parse_annotation(
    annotation: &ast::Expr,
    source: &str,
    parameter: &str,
) -> Result<ParameterType, ToolError> {
    match annotation {
        ast::Expr::Name(name) => match name.id.as_str() {
            "int" => return Ok(ParameterType::Int),
            "float" => return Ok(ParameterType::Float),
            "str" => return Ok(ParameterType::Str),
            "Path" => return Ok(ParameterType::Path),
            _ => {}
        },
        ast::Expr::Subscript(sub) => {
            if is_literal_head(&sub.value) {
                if let Some(options) = literal_options(&sub.slice) {
                    return Ok(ParameterType::LiteralOf(options));
                }
            }
        }
        _ => {}
    }
    Err(ToolError::UnsupportedType {
        parameter: parameter.to_string(),
        annotation: source_text(annotation, source),
    })
}

/// `Literal[...]` may be spelled bare or behind a module path
/// (`typing.Literal[...]`).
fn is_literal_head(expr: &ast::Expr) -> bool {
    match expr {
        ast::Expr::Name(name) => name.id.as_str() == "Literal",
        ast::Expr::Attribute(attr) => attr.attr.as_str() == "Literal",
        _ => false,
    }
}

/// The subscript of a `Literal` must be one string constant or a non-empty
/// tuple of string constants.
fn literal_options(slice: &ast::Expr) -> Option<BTreeSet<String>> {
    match slice {
        ast::Expr::Constant(c) => match &c.value {
            ast::Constant::Str(s) => Some(BTreeSet::from([s.clone()])),
            _ => None,
        },
        ast::Expr::Tuple(tuple) => {
            if tuple.elts.is_empty() {
                return None;
            }
            let mut options = BTreeSet::new();
            for elt in &tuple.elts {
                match elt {
                    ast::Expr::Constant(c) => match &c.value {
                        ast::Constant::Str(s) => {
                            options.insert(s.clone());
                        }
                        _ => return None,
                    },
                    _ => return None,
                }
            }
            Some(options)
        }
        _ => None,
    }
}

/// Default values are recorded as display text: the inner string for string
/// literals, the exact source text for everything else.
fn render_default(default: &ast::Expr, source: &str) -> String {
    if let ast::Expr::Constant(c) = default {
        if let ast::Constant::Str(s) = &c.value {
            return s.clone();
        }
    }
    source_text(default, source).trim().to_string()
}

fn source_text(expr: &ast::Expr, source: &str) -> String {
    let range = expr.range();
    let start = usize::from(range.start()).min(source.len());
    let end = usize::from(range.end()).min(source.len());
    source[start..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOUBLE: &str = "# math, demo\nfrom pathlib import Path\n\ndef double(x: int) -> int:\n    return x * 2\n";

    #[test]
    fn extracts_single_int_parameter() {
        let descriptor = extract("double", DOUBLE).unwrap();
        assert_eq!(descriptor.entry_name, "double");
        assert_eq!(descriptor.parameters.len(), 1);
        assert_eq!(descriptor.parameters[0].name, "x");
        assert_eq!(descriptor.parameters[0].declared, ParameterType::Int);
        assert_eq!(descriptor.parameters[0].default, None);
        assert_eq!(descriptor.source, DOUBLE);
    }

    #[test]
    fn tags_include_entry_name() {
        let descriptor = extract("double", DOUBLE).unwrap();
        assert_eq!(
            descriptor.tags,
            BTreeSet::from(["math".to_string(), "demo".to_string(), "double".to_string()])
        );
    }

    #[test]
    fn all_scalar_annotations() {
        let source = "def mix(a: int, b: float, c: str, d: Path):\n    return a\n";
        let descriptor = extract("mix", source).unwrap();
        let declared: Vec<_> = descriptor.parameters.iter().map(|p| &p.declared).collect();
        assert_eq!(
            declared,
            vec![
                &ParameterType::Int,
                &ParameterType::Float,
                &ParameterType::Str,
                &ParameterType::Path
            ]
        );
    }

    #[test]
    fn literal_single_option() {
        let source = "def pick(mode: Literal[\"fast\"]):\n    return mode\n";
        let descriptor = extract("pick", source).unwrap();
        assert_eq!(
            descriptor.parameters[0].declared,
            ParameterType::LiteralOf(BTreeSet::from(["fast".to_string()]))
        );
    }

    #[test]
    fn literal_tuple_of_options() {
        let source = "def pick(mode: Literal[\"fast\", \"slow\", \"auto\"]):\n    return mode\n";
        let descriptor = extract("pick", source).unwrap();
        assert_eq!(
            descriptor.parameters[0].declared,
            ParameterType::LiteralOf(BTreeSet::from([
                "auto".to_string(),
                "fast".to_string(),
                "slow".to_string()
            ]))
        );
    }

    #[test]
    fn literal_behind_module_path() {
        let source = "import typing\n\ndef pick(mode: typing.Literal[\"a\", \"b\"]):\n    return mode\n";
        let descriptor = extract("pick", source).unwrap();
        assert!(matches!(
            descriptor.parameters[0].declared,
            ParameterType::LiteralOf(_)
        ));
    }

    #[test]
    fn literal_of_ints_rejected() {
        let source = "def pick(mode: Literal[1, 2]):\n    return mode\n";
        let err = extract("pick", source).unwrap_err();
        match err {
            ToolError::UnsupportedType {
                parameter,
                annotation,
            } => {
                assert_eq!(parameter, "mode");
                assert_eq!(annotation, "Literal[1, 2]");
            }
            other => panic!("expected UnsupportedType, got: {other}"),
        }
    }

    #[test]
    fn unsupported_annotation_carries_source_text() {
        let source = "def feed(data: dict[str, int]):\n    return data\n";
        let err = extract("feed", source).unwrap_err();
        match err {
            ToolError::UnsupportedType {
                parameter,
                annotation,
            } => {
                assert_eq!(parameter, "data");
                assert_eq!(annotation, "dict[str, int]");
            }
            other => panic!("expected UnsupportedType, got: {other}"),
        }
    }

    #[test]
    fn missing_annotation_rejected() {
        let source = "def f(x):\n    return x\n";
        let err = extract("f", source).unwrap_err();
        assert!(matches!(
            err,
            ToolError::MissingAnnotation { parameter } if parameter == "x"
        ));
    }

    #[test]
    fn syntax_error_reports_line() {
        let source = "def f(x: int):\n    return (\n";
        let err = extract("f", source).unwrap_err();
        match err {
            ToolError::Syntax { line } => assert!(line >= 2, "line was {line}"),
            other => panic!("expected Syntax, got: {other}"),
        }
    }

    #[test]
    fn entrypoint_must_match_file_stem() {
        let source = "def other(x: int):\n    return x\n";
        let err = extract("double", source).unwrap_err();
        assert!(matches!(
            err,
            ToolError::EntrypointNotFound { name } if name == "double"
        ));
    }

    #[test]
    fn nested_def_is_not_an_entry() {
        let source = "def outer():\n    def double(x: int):\n        return x * 2\n    return double\n";
        let err = extract("double", source).unwrap_err();
        assert!(matches!(err, ToolError::EntrypointNotFound { .. }));
    }

    #[test]
    fn async_def_is_not_an_entry() {
        let source = "async def fetch(url: str):\n    return url\n";
        let err = extract("fetch", source).unwrap_err();
        assert!(matches!(err, ToolError::EntrypointNotFound { .. }));
    }

    #[test]
    fn non_identifier_tool_name_rejected() {
        let err = extract("../evil", "def f(x: int):\n    return x\n").unwrap_err();
        assert!(matches!(err, ToolError::EntrypointNotFound { .. }));
    }

    #[test]
    fn string_default_recorded_without_quotes() {
        let source = "def greet(name: str = \"world\"):\n    return name\n";
        let descriptor = extract("greet", source).unwrap();
        assert_eq!(descriptor.parameters[0].default.as_deref(), Some("world"));
    }

    #[test]
    fn numeric_default_recorded_as_source_text() {
        let source = "def scale(factor: float = 2.5):\n    return factor\n";
        let descriptor = extract("scale", source).unwrap();
        assert_eq!(descriptor.parameters[0].default.as_deref(), Some("2.5"));
    }

    #[test]
    fn expression_default_recorded_as_source_text() {
        let source = "def wait(seconds: int = 60 * 10):\n    return seconds\n";
        let descriptor = extract("wait", source).unwrap();
        assert_eq!(descriptor.parameters[0].default.as_deref(), Some("60 * 10"));
    }

    #[test]
    fn defaults_attach_to_trailing_parameters() {
        let source = "def f(a: int, b: str = \"x\", c: float = 1.0):\n    return a\n";
        let descriptor = extract("f", source).unwrap();
        assert_eq!(descriptor.parameters[0].default, None);
        assert_eq!(descriptor.parameters[1].default.as_deref(), Some("x"));
        assert_eq!(descriptor.parameters[2].default.as_deref(), Some("1.0"));
    }

    #[test]
    fn only_ordinary_parameters_participate() {
        let source =
            "def f(a: int, *args, key: str = \"k\", **extra):\n    return a\n";
        let descriptor = extract("f", source).unwrap();
        let names: Vec<_> = descriptor.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn second_function_can_be_the_entry() {
        let source = "def helper(x: dict):\n    return x\n\ndef main(x: int):\n    return helper({})\n";
        let descriptor = extract("main", source).unwrap();
        assert_eq!(descriptor.parameters.len(), 1);
    }
}
