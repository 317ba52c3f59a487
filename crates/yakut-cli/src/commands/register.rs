//! `yakut register` — Read or write one register on many nodes, or dump all
//! registers when no name is given.

use std::time::Duration;

use clap::Args;
use serde_json::{Map, Value};
use yakut_common::constants::{DEFAULT_SERVICE_REQUEST_TIMEOUT, EXIT_CODE_UNSUCCESSFUL};
use yakut_common::types::{NodeId, Priority};
use yakut_node::Node;
use yakut_node::register::remote::{self, AccessOptions};

use crate::commands::parse_node_ids;
use crate::context::{Context, parse_timeout, run_async};
use crate::output::FormatterHints;
use crate::ui::{self, ExitStatus, ProgressReporter};

/// Arguments for the `register` command.
#[derive(Args, Debug)]
#[command(after_help = "\
Without a value, the register is only read. With a value, it is first read to learn its type, then
written with the value converted to that type; the value uses the environment variable notation,
e.g. space-separated numbers for arrays. Without a name, all registers of the nodes are read.

Examples:
    yakut register 42 uavcan.node.description
    yakut register 10-13 uavcan.pub.measurement.id 3000
    yakut register 125 m.inductance_dq 12e-6 12e-6")]
pub struct RegisterArgs {
    /// Node-IDs to access, as an integer set such as `1,3-5`.
    #[arg(value_name = "NODE_IDS")]
    pub node_ids: String,

    /// Register name.
    #[arg(value_name = "NAME")]
    pub name: Option<String>,

    /// Value to assign; several elements are joined with spaces.
    #[arg(value_name = "VALUE", requires = "name")]
    pub value: Vec<String>,

    /// Response timeout in seconds.
    #[arg(long, short = 'T', default_value_t = DEFAULT_SERVICE_REQUEST_TIMEOUT, value_parser = parse_timeout)]
    pub timeout: f64,

    /// Nodes that do not answer are reported as warnings rather than errors.
    #[arg(long, short = 's', visible_alias = "optional-service")]
    pub maybe_no_service: bool,

    /// Writing a nonexistent register is a warning rather than an error.
    #[arg(long, short = 'm', visible_alias = "optional-register")]
    pub maybe_missing: bool,

    /// Print the full typed value instead of the simplified one.
    #[arg(long, short = 'a')]
    pub asis: bool,

    /// Merge the values of all nodes: one value if they agree, a list otherwise.
    #[arg(long, short = 'f')]
    pub flat: bool,
}

/// Distinct non-null values: null if none, the value itself if one, a list otherwise.
fn flatten_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> Value {
    let mut unique: Vec<Value> = Vec::new();
    for v in values {
        if !v.is_null() && !unique.contains(v) {
            unique.push(v.clone());
        }
    }
    match unique.len() {
        0 => Value::Null,
        1 => unique.swap_remove(0),
        _ => Value::Array(unique),
    }
}

async fn access_one(
    node: &Node,
    ids: &[NodeId],
    name: &str,
    args: &RegisterArgs,
) -> anyhow::Result<(Map<String, Value>, Vec<String>, Vec<String>)> {
    let value_text = (!args.value.is_empty()).then(|| args.value.join(" "));
    let options = AccessOptions {
        optional_service: args.maybe_no_service,
        optional_register: args.maybe_missing,
    };
    let outcome = remote::access(
        node,
        ids,
        name,
        value_text.as_deref(),
        options,
        Duration::from_secs_f64(args.timeout),
    )
    .await?;
    let detail = u8::from(args.asis);
    let per_node = outcome
        .data_per_node
        .iter()
        .map(|(nid, r)| (nid.to_string(), r.as_ref().map_or(Value::Null, |r| r.represent(detail))))
        .collect();
    Ok((per_node, outcome.errors, outcome.warnings))
}

async fn dump_all(
    node: &Node,
    ids: &[NodeId],
    args: &RegisterArgs,
) -> anyhow::Result<(Map<String, Value>, Vec<String>, Vec<String>)> {
    let timeout = Duration::from_secs_f64(args.timeout);
    let mut per_node = Map::new();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut progress = ProgressReporter::new();
    for &nid in ids {
        progress.report(&format!("Reading registers of node {nid}"));
        let fetched = remote::fetch_registers(node, nid, |_| true, timeout, Priority::Nominal).await?;
        let value = match fetched {
            Some(registers) => Value::Object(
                registers
                    .into_iter()
                    .map(|(name, v)| {
                        let rendered = if args.asis { v.to_builtin() } else { v.to_simplified() };
                        (name, rendered)
                    })
                    .collect(),
            ),
            None => {
                let msg = format!("Registers of node {nid} could not be read completely");
                if args.maybe_no_service {
                    warnings.push(msg);
                } else {
                    errors.push(msg);
                }
                Value::Null
            }
        };
        let _ = per_node.insert(nid.to_string(), value);
    }
    Ok((per_node, errors, warnings))
}

/// Executes the `register` command.
///
/// # Errors
///
/// Returns an error if the node cannot be started; unsuccessful accesses
/// print the best-effort output and exit with status 1.
pub fn execute(args: RegisterArgs, ctx: &Context) -> anyhow::Result<()> {
    let (ids, _) = parse_node_ids(&args.node_ids)?;
    tracing::debug!(?args, ?ids, "register");
    let mut formatter = ctx.formatter(FormatterHints { single_document: true });
    let (per_node, errors, warnings) = run_async(async {
        let node = ctx.make_node("register", false)?;
        let result = match args.name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => access_one(&node, &ids, name, &args).await,
            None => dump_all(&node, &ids, &args).await,
        };
        node.close().await;
        result
    })?;
    let ok = ui::report(&errors, &warnings);
    let doc = if args.flat {
        flatten_values(per_node.values())
    } else {
        Value::Object(per_node)
    };
    ui::emit(&formatter.format(&doc))?;
    if ok { Ok(()) } else { Err(ExitStatus(EXIT_CODE_UNSUCCESSFUL).into()) }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn flat_output_merges_equal_values() {
        assert_eq!(flatten_values(&[json!(null), json!(null)]), json!(null));
        assert_eq!(flatten_values(&[json!(5), json!(null), json!(5)]), json!(5));
        assert_eq!(flatten_values(&[json!([1, 2]), json!("x"), json!([1, 2])]), json!([[1, 2], "x"]));
    }
}
