//! Document formatters for data printed to stdout.
//!
//! Every formatter turns one builtin value into a complete document including
//! its terminating newline, so callers write the result as is.

use std::io::IsTerminal;

use clap::{Args, ValueEnum};
use serde_json::Value;

/// Output format of documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// YAML on a terminal, JSON when redirected.
    #[default]
    Auto,
    /// YAML documents separated by `---`.
    Yaml,
    /// One compact JSON object per line.
    Json,
    /// Tab-separated leaf values, one object per line.
    Tsv,
    /// TSV with a header row of flattened keys.
    Tsvh,
    /// TSVH with extra columns marking where mappings and lists open and close.
    Tsvfc,
}

/// Format selection shared by all data-producing commands.
#[derive(Args, Debug, Clone, Default)]
pub struct FormatArgs {
    /// The format of data printed to stdout. "auto" selects YAML on a
    /// terminal and JSON when the output is redirected; JSON and TSV keep
    /// exactly one object per line.
    #[arg(long, short = 'F', value_enum, default_value = "auto", env = "YAKUT_FORMAT")]
    pub format: Format,

    /// Same as --format=yaml.
    #[arg(long, short = 'y', conflicts_with_all = ["json", "tsvh"])]
    pub yaml: bool,

    /// Same as --format=json.
    #[arg(long, short = 'j', conflicts_with_all = ["yaml", "tsvh"])]
    pub json: bool,

    /// Same as --format=tsvh.
    #[arg(long, short = 't', conflicts_with_all = ["yaml", "json"])]
    pub tsvh: bool,
}

impl FormatArgs {
    /// The selected format with the shortcut flags applied.
    #[must_use]
    pub const fn resolve(&self) -> Format {
        if self.yaml {
            Format::Yaml
        } else if self.json {
            Format::Json
        } else if self.tsvh {
            Format::Tsvh
        } else {
            self.format
        }
    }
}

/// Hints from the command about the shape of its output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatterHints {
    /// The command emits exactly one document; separators are not needed.
    pub single_document: bool,
}

/// A stateful document formatter.
#[derive(Debug, Clone)]
pub struct Formatter {
    format: Format,
    hints: FormatterHints,
    header_pending: bool,
}

const NEWLINE: &str = "\n";

impl Formatter {
    /// A formatter for `format`; [`Format::Auto`] is resolved against stdout here.
    #[must_use]
    pub fn new(format: Format, hints: FormatterHints) -> Self {
        let format = match format {
            Format::Auto if std::io::stdout().is_terminal() => Format::Yaml,
            Format::Auto => Format::Json,
            other => other,
        };
        tracing::debug!(?format, "formatter selected");
        Self {
            format,
            hints,
            header_pending: true,
        }
    }

    /// The concrete format in use.
    #[must_use]
    pub const fn kind(&self) -> Format {
        self.format
    }

    /// Renders one document.
    pub fn format(&mut self, data: &Value) -> String {
        match self.format {
            Format::Auto | Format::Json => {
                let mut out = serde_json::to_string(data).unwrap_or_default();
                out.push_str(NEWLINE);
                out
            }
            Format::Yaml => to_yaml(data, !self.hints.single_document),
            Format::Tsv => row(flatten(data, false).iter().map(|(_, v)| cell(v))),
            Format::Tsvh | Format::Tsvfc => {
                let items = flatten(data, self.format == Format::Tsvfc);
                let values = row(items.iter().map(|(_, v)| cell(v)));
                if std::mem::take(&mut self.header_pending) {
                    let mut out = row(items.iter().map(|(k, _)| k.clone()));
                    out.push_str(&values);
                    out
                } else {
                    values
                }
            }
        }
    }
}

fn row(cells: impl Iterator<Item = String>) -> String {
    let mut out = cells.collect::<Vec<_>>().join("\t");
    out.push_str(NEWLINE);
    out
}

fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_owned(),
        other => other.to_string(),
    }
}

/// Flattens nested mappings and lists into `(key, leaf)` pairs with keys such
/// as `a.b.[0]`. With `markers`, every container is bracketed by `key{`/`key}`
/// or `key[`/`key]` entries whose values are the bracket itself.
#[must_use]
pub fn flatten(data: &Value, markers: bool) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    flatten_into(data, "", markers, &mut out);
    out
}

fn flatten_into(data: &Value, parent: &str, markers: bool, out: &mut Vec<(String, Value)>) {
    let join = |k: &str| {
        if parent.is_empty() {
            k.to_owned()
        } else {
            format!("{parent}.{k}")
        }
    };
    match data {
        Value::Object(map) => {
            for (k, v) in map {
                add_item(&join(k), v, markers, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                add_item(&join(&format!("[{i}]")), v, markers, out);
            }
        }
        _ => {}
    }
}

fn add_item(key: &str, value: &Value, markers: bool, out: &mut Vec<(String, Value)>) {
    let brackets = match value {
        Value::Object(_) => Some(("{", "}")),
        Value::Array(_) => Some(("[", "]")),
        _ => None,
    };
    match brackets {
        Some((open, close)) => {
            if markers {
                out.push((format!("{key}{open}"), Value::from(open)));
            }
            flatten_into(value, key, markers, out);
            if markers {
                out.push((format!("{key}{close}"), Value::from(close)));
            }
        }
        None => out.push((key.to_owned(), value.clone())),
    }
}

/// Mapping keys that look like integers (port-IDs, node-IDs) become YAML
/// integers so that the output reads `2345:` rather than `'2345':`.
fn to_yaml_value(data: &Value) -> serde_yaml::Value {
    match data {
        Value::Object(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (k, v) in map {
                let key = k
                    .parse::<i64>()
                    .map_or_else(|_| serde_yaml::Value::from(k.as_str()), serde_yaml::Value::from);
                let _ = out.insert(key, to_yaml_value(v));
            }
            serde_yaml::Value::Mapping(out)
        }
        Value::Array(items) => serde_yaml::Value::Sequence(items.iter().map(to_yaml_value).collect()),
        Value::String(s) => serde_yaml::Value::from(s.as_str()),
        Value::Bool(b) => serde_yaml::Value::Bool(*b),
        Value::Number(n) => n
            .as_i64()
            .map(serde_yaml::Value::from)
            .or_else(|| n.as_u64().map(serde_yaml::Value::from))
            .or_else(|| n.as_f64().map(serde_yaml::Value::from))
            .unwrap_or(serde_yaml::Value::Null),
        Value::Null => serde_yaml::Value::Null,
    }
}

fn to_yaml(data: &Value, explicit_start: bool) -> String {
    let body = serde_yaml::to_string(&to_yaml_value(data)).unwrap_or_default();
    let body = body.strip_prefix("---\n").unwrap_or(&body);
    if explicit_start {
        format!("---\n{body}")
    } else {
        body.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn formatter(format: Format) -> Formatter {
        Formatter::new(format, FormatterHints::default())
    }

    fn sample() -> Value {
        json!({"2345": {"abc": {"def": [123, 456]}, "ghi": 789}})
    }

    #[test]
    fn json_is_compact_single_line() {
        assert_eq!(
            formatter(Format::Json).format(&sample()),
            "{\"2345\":{\"abc\":{\"def\":[123,456]},\"ghi\":789}}\n"
        );
    }

    #[test]
    fn tsv_lists_leaf_values() {
        assert_eq!(formatter(Format::Tsv).format(&sample()), "123\t456\t789\n");
    }

    #[test]
    fn tsvh_header_is_emitted_once() {
        let mut f = formatter(Format::Tsvh);
        assert_eq!(
            f.format(&sample()),
            "2345.abc.def.[0]\t2345.abc.def.[1]\t2345.ghi\n123\t456\t789\n"
        );
        assert_eq!(f.format(&sample()), "123\t456\t789\n");
    }

    #[test]
    fn tsvfc_marks_structure() {
        let obj = json!({"142": {"t": {"us": 5}, "v": [1.5], "p": "nominal"}});
        assert_eq!(
            formatter(Format::Tsvfc).format(&obj),
            "142{\t142.t{\t142.t.us\t142.t}\t142.v[\t142.v.[0]\t142.v]\t142.p\t142}\n\
             {\t{\t5\t}\t[\t1.5\t]\tnominal\t}\n"
        );
    }

    #[test]
    fn yaml_has_document_start_unless_single() {
        let text = formatter(Format::Yaml).format(&sample());
        assert!(text.starts_with("---\n2345:\n"), "{text}");
        assert!(text.contains("\n  ghi: 789\n"), "{text}");
        let _: serde_yaml::Value = serde_yaml::from_str(&text).expect("yaml");

        let single = Formatter::new(Format::Yaml, FormatterHints { single_document: true }).format(&json!({"a": 1}));
        assert_eq!(single, "a: 1\n");
    }

    #[test]
    fn shortcuts_override_format() {
        let args = FormatArgs {
            format: Format::Tsv,
            json: true,
            ..FormatArgs::default()
        };
        assert_eq!(args.resolve(), Format::Json);
        assert_eq!(FormatArgs::default().resolve(), Format::Auto);
    }
}
