//! Expression evaluation.
//!
//! Conditions, computed lengths, value transforms, meta-items and read
//! procedures are [Rhai](https://rhai.rs) scripts. Every call gets a fresh
//! [`Scope`] holding only:
//!
//! - `rec`: the record being parsed (`rec.value(name)`, `rec.hex_value(name)`,
//!   `rec.length()`, `rec.raw()`)
//! - the call's own [`Param`]s (`value`, `offset`, `input`, ...)
//!
//! so nested evaluations (a field expression reading another lazily computed
//! field) never observe each other's bindings.
//!
//! Two shorthands are expanded before compilation: `$(name)` becomes
//! `rec.value(name)` and `$hex(name)` becomes `rec.hex_value(name)`.
//!
//! Functions defined in script files passed to [`Evaluator::with_scripts`] are
//! callable from every expression.

mod stream;

use crate::error::{Error, Result};
use crate::record::Record;
use rhai::{Blob, Dynamic, Engine, EvalAltResult, ImmutableString, Scope, AST, INT};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::rc::Rc;
use thiserror::Error as ThisError;
use tracing::{debug, trace};

pub use stream::InputStream;

/// Failure of a single evaluation
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// The script failed to compile or raised an error
    #[error("{0}")]
    Script(String),

    /// A configured resource limit was exceeded
    #[error("evaluation limit exceeded: {0}")]
    Limit(String),
}

impl EvalError {
    /// Returns true for resource-limit failures, which are never recovered
    pub fn is_fatal(&self) -> bool {
        matches!(self, EvalError::Limit(_))
    }
}

impl From<Box<EvalAltResult>> for EvalError {
    fn from(err: Box<EvalAltResult>) -> Self {
        match *err {
            EvalAltResult::ErrorTooManyOperations(..)
            | EvalAltResult::ErrorStackOverflow(..)
            | EvalAltResult::ErrorDataTooLarge(..)
            | EvalAltResult::ErrorTerminated(..) => EvalError::Limit(err.to_string()),
            _ => EvalError::Script(err.to_string()),
        }
    }
}

/// A named value bound for one evaluation
#[derive(Debug, Clone)]
pub struct Param {
    name: String,
    value: Dynamic,
}

impl Param {
    /// Binds a string
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Dynamic::from(value.into()),
        }
    }

    /// Binds an integer
    pub fn int(name: impl Into<String>, value: usize) -> Self {
        Self {
            name: name.into(),
            value: Dynamic::from(INT::try_from(value).unwrap_or(INT::MAX)),
        }
    }

    /// Binds an input stream
    pub fn stream(name: impl Into<String>, value: InputStream) -> Self {
        Self {
            name: name.into(),
            value: Dynamic::from(value),
        }
    }
}

/// Resource limits applied to every evaluation
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Maximum number of operations per evaluation (0 = unlimited)
    pub max_operations: u64,
    /// Maximum function call nesting
    pub max_call_levels: usize,
    /// Maximum expression nesting
    pub max_expr_depth: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            max_operations: 0,
            max_call_levels: 64,
            max_expr_depth: 64,
        }
    }
}

impl EvaluatorConfig {
    /// Creates a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of operations per evaluation
    pub fn max_operations(mut self, max: u64) -> Self {
        self.max_operations = max;
        self
    }

    /// Sets the maximum function call nesting
    pub fn max_call_levels(mut self, max: usize) -> Self {
        self.max_call_levels = max;
        self
    }

    /// Sets the maximum expression nesting
    pub fn max_expr_depth(mut self, max: usize) -> Self {
        self.max_expr_depth = max;
        self
    }
}

/// Cheaply cloneable handle over a configured Rhai engine
#[derive(Clone)]
pub struct Evaluator {
    inner: Rc<EvaluatorInner>,
}

struct EvaluatorInner {
    engine: Engine,
    library: AST,
    compiled: RefCell<HashMap<String, Rc<AST>>>,
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluator")
            .field("compiled", &self.inner.compiled.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    /// Creates an evaluator with default limits and no script library
    pub fn new() -> Self {
        Self::from_parts(build_engine(&EvaluatorConfig::default()), AST::empty())
    }

    /// Creates an evaluator with custom limits
    pub fn with_config(config: EvaluatorConfig) -> Self {
        Self::from_parts(build_engine(&config), AST::empty())
    }

    /// Creates an evaluator whose expressions may call the functions defined in `scripts`
    pub fn with_scripts<P: AsRef<Path>>(
        config: EvaluatorConfig,
        scripts: impl IntoIterator<Item = P>,
    ) -> Result<Self> {
        let engine = build_engine(&config);
        let mut library = AST::empty();

        for path in scripts {
            let path = path.as_ref();
            let source =
                std::fs::read_to_string(path).map_err(|e| Error::file_read(path, e))?;
            let ast = engine.compile(&source).map_err(|e| {
                Error::invalid_config(path, "script", format!("failed to compile: {e}"))
            })?;
            debug!("Loaded script {}", path.display());
            library = library.merge(&ast.clone_functions_only());
        }

        Ok(Self::from_parts(engine, library))
    }

    fn from_parts(engine: Engine, library: AST) -> Self {
        Self {
            inner: Rc::new(EvaluatorInner {
                engine,
                library,
                compiled: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Evaluates `expression` and renders the result as a string
    pub fn eval(
        &self,
        record: Option<&Record>,
        expression: &str,
        params: &[Param],
    ) -> std::result::Result<String, EvalError> {
        self.eval_dynamic(record, expression, params)
            .map(|value| value.to_string())
    }

    /// Evaluates a condition.
    ///
    /// Absent or blank conditions are true, a result rendering as `false` is
    /// false, and script errors are true so that a broken condition never hides
    /// a layout. Only limit errors are returned.
    pub fn eval_bool(
        &self,
        record: Option<&Record>,
        expression: Option<&str>,
        params: &[Param],
    ) -> std::result::Result<bool, EvalError> {
        let Some(expression) = expression.filter(|e| !e.trim().is_empty()) else {
            return Ok(true);
        };
        match self.eval(record, expression, params) {
            Ok(value) => Ok(value != "false"),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                trace!("Condition '{}' failed open: {}", expression, err);
                Ok(true)
            }
        }
    }

    /// Evaluates a read procedure: a blob, or `()` at end of stream
    pub fn eval_bytes(
        &self,
        record: Option<&Record>,
        expression: &str,
        params: &[Param],
    ) -> std::result::Result<Option<Vec<u8>>, EvalError> {
        let value = self.eval_dynamic(record, expression, params)?;
        if value.is_unit() {
            return Ok(None);
        }
        value.into_blob().map(Some).map_err(|type_name| {
            EvalError::Script(format!("expected a blob or (), got {type_name}"))
        })
    }

    fn eval_dynamic(
        &self,
        record: Option<&Record>,
        expression: &str,
        params: &[Param],
    ) -> std::result::Result<Dynamic, EvalError> {
        let ast = self.compiled(expression)?;

        let mut scope = Scope::new();
        if let Some(record) = record {
            scope.push("rec", record.clone());
        }
        for param in params {
            scope.push_dynamic(param.name.as_str(), param.value.clone());
        }

        let result = self.inner.engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast);
        result.map_err(EvalError::from)
    }

    fn compiled(&self, expression: &str) -> std::result::Result<Rc<AST>, EvalError> {
        if let Some(ast) = self.inner.compiled.borrow().get(expression) {
            return Ok(Rc::clone(ast));
        }

        let source = expand_shorthand(expression);
        let ast = self
            .inner
            .engine
            .compile(&source)
            .map_err(|e| EvalError::Script(format!("{e} in '{expression}'")))?;
        let ast = Rc::new(self.inner.library.merge(&ast));

        self.inner
            .compiled
            .borrow_mut()
            .insert(expression.to_string(), Rc::clone(&ast));
        Ok(ast)
    }
}

fn build_engine(config: &EvaluatorConfig) -> Engine {
    let mut engine = Engine::new();

    if config.max_operations > 0 {
        engine.set_max_operations(config.max_operations);
    }
    engine.set_max_call_levels(config.max_call_levels);
    engine.set_max_expr_depths(config.max_expr_depth, config.max_expr_depth);

    engine.on_print(|text| debug!(target: "recscope::script", "{}", text));
    engine.on_debug(|text, _, pos| trace!(target: "recscope::script", "{:?}: {}", pos, text));

    engine
        .register_type_with_name::<Record>("Record")
        .register_fn("value", |rec: &mut Record, name: ImmutableString| {
            rec.value(&name)
        })
        .register_fn("hex_value", |rec: &mut Record, name: ImmutableString| {
            rec.hex_value(&name)
        })
        .register_fn("length", |rec: &mut Record| {
            INT::try_from(rec.len()).unwrap_or(INT::MAX)
        })
        .register_fn("raw", |rec: &mut Record| -> Blob { rec.raw_bytes() });

    stream::register(&mut engine);
    engine
}

/// Rewrites `$(…)` and `$hex(…)` outside string and character literals
fn expand_shorthand(expression: &str) -> String {
    let mut out = String::with_capacity(expression.len() + 16);
    let mut chars = expression.char_indices().peekable();
    let mut quote: Option<char> = None;

    while let Some((i, c)) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == '\\' {
                if let Some((_, escaped)) = chars.next() {
                    out.push(escaped);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '"' | '\'' | '`' => {
                quote = Some(c);
                out.push(c);
            }
            '$' if expression[i + 1..].starts_with("hex(") => {
                out.push_str("rec.hex_value(");
                for _ in 0.."hex(".len() {
                    chars.next();
                }
            }
            '$' if expression[i + 1..].starts_with('(') => {
                out.push_str("rec.value(");
                chars.next();
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_expand_shorthand() {
        assert_eq!(expand_shorthand("$(\"a\")"), "rec.value(\"a\")");
        assert_eq!(
            expand_shorthand("$hex(\"a\") + $(\"b\")"),
            "rec.hex_value(\"a\") + rec.value(\"b\")"
        );
        assert_eq!(expand_shorthand("\"$(x)\" + `$hex(y)`"), "\"$(x)\" + `$hex(y)`");
        assert_eq!(expand_shorthand("\"a\\\"$(\" + $(\"c\")"), "\"a\\\"$(\" + rec.value(\"c\")");
        assert_eq!(expand_shorthand("price$"), "price$");
    }

    #[test]
    fn test_eval_with_params() {
        let evaluator = Evaluator::new();
        let params = [Param::text("value", "41"), Param::int("offset", 3)];
        let result = evaluator
            .eval(None, "parse_int(value) + offset", &params)
            .unwrap();
        assert_eq!(result, "44");
    }

    #[test]
    fn test_unit_renders_empty() {
        let evaluator = Evaluator::new();
        assert_eq!(evaluator.eval(None, "()", &[]).unwrap(), "");
    }

    #[test]
    fn test_eval_bool_semantics() {
        let evaluator = Evaluator::new();
        assert!(evaluator.eval_bool(None, None, &[]).unwrap());
        assert!(evaluator.eval_bool(None, Some(""), &[]).unwrap());
        assert!(evaluator.eval_bool(None, Some("  "), &[]).unwrap());
        assert!(!evaluator.eval_bool(None, Some("false"), &[]).unwrap());
        assert!(!evaluator.eval_bool(None, Some("1 > 2"), &[]).unwrap());
        assert!(evaluator.eval_bool(None, Some("1 < 2"), &[]).unwrap());
        assert!(evaluator.eval_bool(None, Some("throw \"boom\""), &[]).unwrap());
        assert!(evaluator.eval_bool(None, Some("this is not rhai ((("), &[]).unwrap());
        assert!(evaluator.eval_bool(None, Some("\"no\""), &[]).unwrap());
    }

    #[test]
    fn test_limit_errors_propagate() {
        let evaluator = Evaluator::with_config(EvaluatorConfig::new().max_operations(1_000));
        let err = evaluator
            .eval_bool(None, Some("loop { }"), &[])
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_eval_bytes() {
        let evaluator = Evaluator::new();
        let stream = InputStream::new(Cursor::new(vec![2u8, 0xaa, 0xbb, 1, 0xcc]));
        let procedure = r#"
            let n = input.read_byte();
            if n < 0 { () } else { input.read(n) }
        "#;
        let params = [Param::stream("input", stream)];
        assert_eq!(
            evaluator.eval_bytes(None, procedure, &params).unwrap(),
            Some(vec![0xaa, 0xbb])
        );
        assert_eq!(
            evaluator.eval_bytes(None, procedure, &params).unwrap(),
            Some(vec![0xcc])
        );
        assert_eq!(evaluator.eval_bytes(None, procedure, &params).unwrap(), None);
        assert!(evaluator.eval_bytes(None, "\"text\"", &[]).is_err());
    }

    #[test]
    fn test_scripts_library() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("lib.rhai");
        std::fs::write(&script, "fn double(x) { x * 2 }").unwrap();

        let evaluator = Evaluator::with_scripts(EvaluatorConfig::new(), [&script]).unwrap();
        assert_eq!(evaluator.eval(None, "double(21)", &[]).unwrap(), "42");
    }

    #[test]
    fn test_script_compile_error_names_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("broken.rhai");
        std::fs::write(&script, "fn broken( {").unwrap();

        let err = Evaluator::with_scripts(EvaluatorConfig::new(), [&script]).unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("broken.rhai"));
    }

    #[test]
    fn test_scopes_are_per_call() {
        let evaluator = Evaluator::new();
        evaluator.eval(None, "let leaked = 1; leaked", &[]).unwrap();
        assert!(evaluator.eval(None, "leaked", &[]).is_err());
    }
}
