//! `yakut register-list` — List the register names of the specified nodes.

use std::time::Duration;

use clap::Args;
use serde_json::{Map, Value};
use yakut_common::constants::{DEFAULT_SERVICE_REQUEST_TIMEOUT, EXIT_CODE_UNSUCCESSFUL};
use yakut_common::types::NodeId;
use yakut_node::register::remote::{self, Outcome};

use crate::commands::parse_node_ids;
use crate::context::{Context, parse_timeout, run_async};
use crate::output::FormatterHints;
use crate::ui::{self, ExitStatus, ProgressReporter};

/// Arguments for the `register-list` command.
#[derive(Args, Debug)]
#[command(after_help = "\
The output maps node-IDs to sorted lists of register names; a node without the service maps to
null. A single node-ID given without separators prints the list alone, which is convenient for
piping into `yakut register-batch`.

Examples:
    yakut register-list 42
    yakut rl 1-10 --optional-service | yakut rb")]
pub struct RegisterListArgs {
    /// Node-IDs to query, as an integer set such as `1,3-5`.
    #[arg(value_name = "NODE_IDS")]
    pub node_ids: String,

    /// Response timeout in seconds.
    #[arg(long, short = 'T', default_value_t = DEFAULT_SERVICE_REQUEST_TIMEOUT, value_parser = parse_timeout)]
    pub timeout: f64,

    /// Nodes that never answer are reported as warnings rather than errors.
    #[arg(long, short = 's')]
    pub optional_service: bool,
}

fn render(outcome: &Outcome<Option<Vec<String>>>, unwrap: bool) -> Value {
    let names = |v: &Option<Vec<String>>| {
        v.as_ref()
            .map_or(Value::Null, |n| Value::Array(n.iter().cloned().map(Value::String).collect()))
    };
    if unwrap && outcome.data_per_node.len() == 1 {
        if let Some(v) = outcome.data_per_node.values().next() {
            return names(v);
        }
    }
    Value::Object(
        outcome
            .data_per_node
            .iter()
            .map(|(nid, v)| (nid.to_string(), names(v)))
            .collect::<Map<_, _>>(),
    )
}

/// Executes the `register-list` command.
///
/// # Errors
///
/// Returns an error if the node cannot be started; unsuccessful listings
/// print the best-effort output and exit with status 1.
pub fn execute(args: RegisterListArgs, ctx: &Context) -> anyhow::Result<()> {
    let (ids, scalar): (Vec<NodeId>, bool) = parse_node_ids(&args.node_ids)?;
    tracing::debug!(?args, ?ids, "register-list");
    let mut formatter = ctx.formatter(FormatterHints { single_document: true });
    let outcome = run_async(async {
        let node = ctx.make_node("register_list", false)?;
        let mut progress = ProgressReporter::new();
        progress.report(&format!("Listing registers of {} node(s)", ids.len()));
        let timeout = Duration::from_secs_f64(args.timeout);
        let result = remote::list_names(&node, &ids, timeout, args.optional_service).await;
        drop(progress);
        node.close().await;
        Ok(result?)
    })?;
    let ok = ui::report(&outcome.errors, &outcome.warnings);
    ui::emit(&formatter.format(&render(&outcome, scalar)))?;
    if ok { Ok(()) } else { Err(ExitStatus(EXIT_CODE_UNSUCCESSFUL).into()) }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn outcome(entries: &[(u16, Option<&[&str]>)]) -> Outcome<Option<Vec<String>>> {
        let mut out = Outcome::default();
        for (nid, names) in entries {
            let _ = out
                .data_per_node
                .insert(NodeId::new(*nid), names.map(|n| n.iter().map(|s| (*s).to_owned()).collect()));
        }
        out
    }

    #[test]
    fn single_scalar_node_is_unwrapped() {
        let o = outcome(&[(42, Some(&["a", "b"]))]);
        assert_eq!(render(&o, true), json!(["a", "b"]));
        assert_eq!(render(&o, false), json!({"42": ["a", "b"]}));
    }

    #[test]
    fn missing_service_maps_to_null() {
        let o = outcome(&[(1, Some(&["x"])), (2, None)]);
        assert_eq!(render(&o, true), json!({"1": ["x"], "2": null}));
    }
}
