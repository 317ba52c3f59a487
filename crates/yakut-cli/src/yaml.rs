//! YAML input with embedded expressions.
//!
//! A scalar tagged `!$` is an expression rather than data: `{x: !$ "sin(t)"}`.
//! Documents are parsed once into a [`Template`] that can be evaluated many
//! times against changing variables, as `publish` does on every cycle.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::expr::{Environment, EvalError, Expr};

/// Tag that marks an expression.
pub const EXPRESSION_TAG: &str = "$";

/// Failure to load a YAML document.
#[derive(Debug, Error)]
pub enum YamlError {
    /// Not valid YAML.
    #[error("invalid YAML: {0}")]
    Syntax(#[from] serde_yaml::Error),
    /// A tag other than `!$`, or `!$` on a non-string.
    #[error("{0}")]
    Tag(String),
    /// A mapping key that is not a scalar.
    #[error("unsupported mapping key: {0}")]
    Key(String),
    /// An expression failed to parse or evaluate.
    #[error(transparent)]
    Expr(#[from] EvalError),
}

/// A document whose leaves may be expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Template {
    /// Plain data.
    Value(Value),
    /// An expression evaluated on demand.
    Expr(Expr),
    /// A sequence.
    List(Vec<Template>),
    /// A mapping with keys in document order.
    Map(Vec<(String, Template)>),
}

fn scalar_to_json(value: &serde_yaml::Value) -> Value {
    match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(*b),
        serde_yaml::Value::Number(n) => n
            .as_i64()
            .map(Value::from)
            .or_else(|| n.as_u64().map(Value::from))
            .or_else(|| n.as_f64().map(Value::from))
            .unwrap_or(Value::Null),
        serde_yaml::Value::String(s) => Value::String(s.clone()),
        other => Value::String(format!("{other:?}")),
    }
}

fn key_to_string(key: &serde_yaml::Value) -> Result<String, YamlError> {
    match key {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Null => Ok("null".to_owned()),
        other => Err(YamlError::Key(format!("{other:?}"))),
    }
}

impl Template {
    /// Parses a YAML text.
    ///
    /// # Errors
    ///
    /// Invalid YAML, unknown tags, or malformed expressions.
    pub fn parse(text: &str) -> Result<Self, YamlError> {
        let doc: serde_yaml::Value = serde_yaml::from_str(text)?;
        Self::from_yaml(&doc)
    }

    /// Converts a parsed YAML value.
    ///
    /// # Errors
    ///
    /// Unknown tags, non-scalar keys, or malformed expressions.
    pub fn from_yaml(value: &serde_yaml::Value) -> Result<Self, YamlError> {
        match value {
            serde_yaml::Value::Sequence(items) => items.iter().map(Self::from_yaml).collect::<Result<_, _>>().map(Self::List),
            serde_yaml::Value::Mapping(map) => map
                .iter()
                .map(|(k, v)| Ok((key_to_string(k)?, Self::from_yaml(v)?)))
                .collect::<Result<_, YamlError>>()
                .map(Self::Map),
            serde_yaml::Value::Tagged(tagged) => {
                let tag = tagged.tag.to_string();
                if tag.trim_start_matches('!') != EXPRESSION_TAG {
                    return Err(YamlError::Tag(format!("unsupported tag {tag}")));
                }
                match &tagged.value {
                    serde_yaml::Value::String(text) => Ok(Self::Expr(Expr::parse(text)?)),
                    other => Err(YamlError::Tag(format!(
                        "the expression tag applies to strings only, not {other:?}"
                    ))),
                }
            }
            scalar => Ok(Self::Value(scalar_to_json(scalar))),
        }
    }

    /// Whether evaluation always yields the same value.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        match self {
            Self::Value(_) => true,
            Self::Expr(_) => false,
            Self::List(items) => items.iter().all(Self::is_constant),
            Self::Map(items) => items.iter().all(|(_, v)| v.is_constant()),
        }
    }

    /// Evaluates every expression against `env`.
    ///
    /// # Errors
    ///
    /// The first expression that fails.
    pub fn evaluate(&self, env: &dyn Environment) -> Result<Value, EvalError> {
        Ok(match self {
            Self::Value(v) => v.clone(),
            Self::Expr(e) => e.evaluate(env)?.to_json(),
            Self::List(items) => Value::Array(items.iter().map(|t| t.evaluate(env)).collect::<Result<_, _>>()?),
            Self::Map(items) => {
                let mut out = Map::new();
                for (k, v) in items {
                    let _ = out.insert(k.clone(), v.evaluate(env)?);
                }
                Value::Object(out)
            }
        })
    }
}

/// Loads a document, evaluating expressions without variables.
///
/// # Errors
///
/// See [`Template::parse`] and [`Template::evaluate`].
pub fn load(text: &str) -> Result<Value, YamlError> {
    Ok(Template::parse(text)?.evaluate(&())?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::expr::Val;

    struct Cycle(f64);

    impl Environment for Cycle {
        fn variable(&self, name: &str) -> Option<Val> {
            (name == "n").then_some(Val::Num(self.0))
        }
    }

    #[test]
    fn plain_documents_load_as_json() {
        let v = load("{125: {a: [1, 2.5, x]}, flag: true, none: ~}").expect("load");
        assert_eq!(v, json!({"125": {"a": [1, 2.5, "x"]}, "flag": true, "none": null}));
        assert_eq!(load("").expect("empty"), Value::Null);
    }

    #[test]
    fn expressions_are_reevaluated() {
        let t = Template::parse("{value: !$ 'n * 2', fixed: 7}").expect("parse");
        assert!(!t.is_constant());
        assert_eq!(t.evaluate(&Cycle(1.0)).expect("eval"), json!({"value": 2, "fixed": 7}));
        assert_eq!(t.evaluate(&Cycle(1.5)).expect("eval"), json!({"value": 3, "fixed": 7}));
        assert!(Template::parse("[1, 2]").expect("parse").is_constant());
    }

    #[test]
    fn only_the_expression_tag_is_accepted() {
        assert!(matches!(load("!foo 1"), Err(YamlError::Tag(_))));
        assert!(matches!(load("!$ [1]"), Err(YamlError::Tag(_))));
        assert!(matches!(load("!$ '1 +'"), Err(YamlError::Expr(_))));
        assert_eq!(load("!$ '2 ** 10'").expect("eval"), json!(1024));
    }
}
