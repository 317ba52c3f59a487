//! The orc-file schema.
//!
//! A composition is a YAML mapping. Keys without `=` are environment
//! variables; keys containing `.` are registers, exported as
//! `UPPER__CASE` variables, and nested mappings are flattened into register
//! names. Keys containing `=` are directives:
//!
//! - `external=`: orc-files executed before everything else;
//! - `?=`: predicate script; if it fails the composition is skipped;
//! - `$=`: main script;
//! - `.=`: finalizer script, always run once the predicate has passed.
//!
//! A statement is a string (shell command), a mapping (nested composition)
//! or null (join: wait for the statements launched so far).

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;
use yakut_common::env::{encode_env_value, flatten_registers, is_register_name, register_name_to_env};

/// The only character that cannot occur in an environment variable name.
pub const NOT_ENV: char = '=';

/// Variable holding the kill timeout in seconds.
pub const KILL_TIMEOUT_VAR: &str = "(kill_timeout)";

/// Kill timeout used when [`KILL_TIMEOUT_VAR`] is unset or malformed.
pub const DEFAULT_KILL_TIMEOUT: f64 = 20.0;

const DIRECTIVE_EXTERNAL: &str = "external=";
const DIRECTIVE_PREDICATE: &str = "?=";
const DIRECTIVE_MAIN: &str = "$=";
const DIRECTIVE_FINALIZER: &str = ".=";

/// Environment variables of a composition.
pub type Env = BTreeMap<String, String>;

/// The orc-file is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SchemaError(pub String);

/// A loaded composition with its environment fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    /// Variables seen by every statement of this composition.
    pub env: Env,
    /// Orc-files to execute first.
    pub external: Vec<String>,
    /// Predicate script.
    pub predicate: Vec<Statement>,
    /// Main script.
    pub main: Vec<Statement>,
    /// Finalizer script.
    pub finalizer: Vec<Statement>,
}

impl Composition {
    /// Seconds a stopped child is given before it is killed.
    #[must_use]
    pub fn kill_timeout(&self) -> f64 {
        self.env
            .get(KILL_TIMEOUT_VAR)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(DEFAULT_KILL_TIMEOUT)
    }
}

/// One step of a script.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Shell command.
    Shell(String),
    /// Nested composition.
    Composition(Box<Composition>),
    /// Wait for the pending statements.
    Join,
}

/// Parses orc-file text.
///
/// # Errors
///
/// Returns a [`SchemaError`] on YAML syntax errors.
pub fn load_ast(text: &str) -> Result<Value, SchemaError> {
    serde_yaml::from_str(text).map_err(|e| SchemaError(format!("Syntax error: {e}")))
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Builds a composition from its AST. The inherited `env` is extended with
/// the variables of `ast`, which take precedence; null values unset
/// inherited variables.
///
/// # Errors
///
/// Returns a [`SchemaError`] if the AST is not a mapping, contains unknown
/// directives, unencodable values or malformed statements.
pub fn load_composition(ast: &Value, env: &Env) -> Result<Composition, SchemaError> {
    let Value::Object(map) = ast else {
        return Err(SchemaError(format!("The composition shall be a dict, not {}", type_name(ast))));
    };
    let mut env = env.clone();
    let variables: Map<String, Value> = map
        .iter()
        .filter(|(k, _)| !k.contains(NOT_ENV))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (name, value) in flatten_registers(&variables) {
        let name = if is_register_name(&name) { register_name_to_env(&name) } else { name };
        if value.is_null() {
            let _ = env.remove(&name);
        } else {
            let text = encode_env_value(&value).map_err(|e| SchemaError(format!("Environment variable error: {e}")))?;
            let _ = env.insert(name, text);
        }
    }

    let unknown: Vec<&str> = map
        .keys()
        .filter(|k| k.contains(NOT_ENV))
        .filter(|k| ![DIRECTIVE_EXTERNAL, DIRECTIVE_PREDICATE, DIRECTIVE_MAIN, DIRECTIVE_FINALIZER].contains(&k.as_str()))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(SchemaError(format!("Unknown directives: {unknown:?}")));
    }

    Ok(Composition {
        external: load_external(map.get(DIRECTIVE_EXTERNAL))?,
        predicate: load_script(map.get(DIRECTIVE_PREDICATE), &env)?,
        main: load_script(map.get(DIRECTIVE_MAIN), &env)?,
        finalizer: load_script(map.get(DIRECTIVE_FINALIZER), &env)?,
        env,
    })
}

/// A missing directive is an empty script; a single statement is a script of one.
fn load_script(ast: Option<&Value>, env: &Env) -> Result<Vec<Statement>, SchemaError> {
    match ast {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(|x| load_statement(x, env)).collect(),
        Some(single) => Ok(vec![load_statement(single, env)?]),
    }
}

fn load_statement(ast: &Value, env: &Env) -> Result<Statement, SchemaError> {
    match ast {
        Value::String(cmd) => Ok(Statement::Shell(cmd.clone())),
        Value::Object(_) => Ok(Statement::Composition(Box::new(load_composition(ast, env)?))),
        Value::Null => Ok(Statement::Join),
        _ => Err(SchemaError(
            "Statement shall be either: string (command to run), dict (nested schema), null (join)".to_owned(),
        )),
    }
}

fn load_external(ast: Option<&Value>) -> Result<Vec<String>, SchemaError> {
    let item = |v: &Value| match v {
        Value::String(s) => Ok(s.clone()),
        other => Err(SchemaError(format!("Call arguments shall be strings, not {}", type_name(other)))),
    };
    match ast {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(item).collect(),
        Some(single) => Ok(vec![item(single)?]),
    }
}
