//! `yakut execute-command` — Send `uavcan.node.ExecuteCommand` to a group of nodes.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context as _;
use clap::Args;
use serde_json::{Map, Value, json};
use tokio::task::JoinSet;
use yakut_common::constants::{DEFAULT_SERVICE_REQUEST_TIMEOUT, EXIT_CODE_UNSUCCESSFUL};
use yakut_common::int_set::{INT_SET_USER_DOC, parse_int_literal, parse_int_set};
use yakut_common::types::NodeId;
use yakut_dsdl::Composite;
use yakut_node::{Node, types};

use crate::commands::parse_node_ids;
use crate::context::{Context, parse_timeout, run_async};
use crate::output::FormatterHints;
use crate::ui::{self, ExitStatus, ProgressReporter};

const COMMAND_PREFIX: &str = "COMMAND_";
const STATUS_PREFIX: &str = "STATUS_";

/// Arguments for the `execute-command` command.
#[derive(Args, Debug)]
#[command(after_help = format!("\
The command is an integer or a case-insensitive abbreviation of a standard command name such as
restart (65535) or begin_software_update (65533). The output maps node-IDs to responses, or is the
response alone if NODE_IDS is a single integer.

Examples:
    yakut execute-command 0-128 restart -e
    y cmd 122-126 begin_software_update /path/to/software/image

{INT_SET_USER_DOC}"))]
pub struct ExecuteCommandArgs {
    /// Node-IDs to command, as an integer set such as `1,3-5`.
    #[arg(value_name = "NODE_IDS")]
    pub node_ids: String,

    /// Command code or name.
    #[arg(value_name = "COMMAND")]
    pub command: String,

    /// Command parameter, such as the path of a software image.
    #[arg(value_name = "PARAMETER", default_value = "")]
    pub parameter: String,

    /// Status codes accepted as success, as an integer set. Without a value,
    /// requests are sent to all nodes at once and responses are not checked.
    #[arg(
        long,
        short = 'e',
        value_name = "STATUS_CODES",
        default_value = "0",
        num_args = 0..=1,
        default_missing_value = ""
    )]
    pub expect: String,

    /// Response timeout in seconds.
    #[arg(long, short = 'T', default_value_t = DEFAULT_SERVICE_REQUEST_TIMEOUT, value_parser = parse_timeout)]
    pub timeout: f64,
}

/// The accepted status codes; `None` means fire and forget.
fn parse_status_set(text: &str) -> anyhow::Result<Option<Vec<i64>>> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    let set = parse_int_set(text).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(Some(set.to_vec()))
}

/// Resolves a command code from an integer literal or a unique prefix of a
/// standard command name.
fn parse_command(text: &str, request: &Composite) -> anyhow::Result<u16> {
    if let Some(code) = text.trim().parse::<i64>().ok().or_else(|| parse_int_literal(text.trim())) {
        return u16::try_from(code).map_err(|_| anyhow::anyhow!("Command code out of range: {code}"));
    }
    let needle = text.trim().to_ascii_lowercase();
    let matches: Vec<i64> = request
        .constants()
        .iter()
        .filter_map(|c| c.name.strip_prefix(COMMAND_PREFIX).map(|n| (n, c.value)))
        .filter(|(n, _)| !needle.is_empty() && n.to_ascii_lowercase().starts_with(&needle))
        .map(|(_, v)| v)
        .collect();
    match matches.as_slice() {
        [code] => u16::try_from(*code).context("invalid command constant"),
        _ => anyhow::bail!("Command not understood: {text:?}"),
    }
}

fn status_name(code: i64, response: &Composite) -> Option<&str> {
    response
        .constants()
        .iter()
        .find(|c| c.value == code && c.name.starts_with(STATUS_PREFIX))
        .and_then(|c| c.name.strip_prefix(STATUS_PREFIX))
}

async fn send_all(
    node: &Node,
    ids: &[NodeId],
    request: &Value,
    timeout: Duration,
    fire_and_forget: bool,
) -> anyhow::Result<BTreeMap<NodeId, Option<Value>>> {
    let dtype = types::EXECUTE_COMMAND.load()?;
    let mut result = BTreeMap::new();
    if fire_and_forget {
        let mut pending = JoinSet::new();
        for &nid in ids {
            let mut client = node.make_client(&dtype, nid, None)?;
            client.timeout = timeout;
            let request = request.clone();
            let _ = pending.spawn(async move { (nid, client.call(&request).await) });
        }
        while let Some(joined) = pending.join_next().await {
            let (nid, response) = joined.context("request task failed")?;
            let _ = result.insert(nid, response?.map(|(r, _)| r));
        }
        return Ok(result);
    }
    let mut progress = ProgressReporter::new();
    for &nid in ids {
        progress.report(&format!("{:5}", nid.get()));
        let mut client = node.make_client(&dtype, nid, None)?;
        client.timeout = timeout;
        let _ = result.insert(nid, client.call(request).await?.map(|(r, _)| r));
    }
    Ok(result)
}

/// Problems found in the responses.
fn check_responses(
    responses: &BTreeMap<NodeId, Option<Value>>,
    expect: &[i64],
    response_schema: &Composite,
) -> Vec<String> {
    let mut errors = Vec::new();
    for (nid, response) in responses {
        let Some(response) = response else {
            errors.push(format!("Timed out while waiting for response from node {nid}"));
            continue;
        };
        let status = response.get("status").and_then(Value::as_i64).unwrap_or(-1);
        if expect.contains(&status) {
            tracing::debug!(node_id = %nid, %response, "success");
        } else {
            let desc = status_name(status, response_schema).unwrap_or("(unknown status code)");
            errors.push(format!("Node {nid} returned unexpected status code: {status} {desc}"));
        }
    }
    errors
}

/// Executes the `execute-command` command.
///
/// # Errors
///
/// Returns an error on malformed arguments or if the node cannot be
/// started; unexpected statuses and timeouts exit with status 1.
pub fn execute(args: ExecuteCommandArgs, ctx: &Context) -> anyhow::Result<()> {
    let (ids, scalar) = parse_node_ids(&args.node_ids)?;
    let expect = parse_status_set(&args.expect)?;
    let (request_schema, response_schema) = types::EXECUTE_COMMAND.service()?;
    let command = parse_command(&args.command, &request_schema)?;
    tracing::debug!(?ids, command, parameter = %args.parameter, ?expect, "execute-command");
    let request = json!({"command": command, "parameter": args.parameter});
    let _ = yakut_dsdl::serialize(&request_schema, &request).context("invalid request")?;
    let mut formatter = ctx.formatter(FormatterHints { single_document: true });
    let timeout = Duration::from_secs_f64(args.timeout);
    let responses = run_async(async {
        let node = ctx.make_node("execute_command", false)?;
        let result = send_all(&node, &ids, &request, timeout, expect.is_none()).await;
        node.close().await;
        result
    })?;
    let ok = match &expect {
        Some(codes) => ui::report(&check_responses(&responses, codes, &response_schema), &[]),
        None => {
            ui::show_warning("Responses not checked as requested");
            true
        }
    };
    let mut output: Map<String, Value> = responses
        .into_iter()
        .map(|(nid, r)| (nid.to_string(), r.unwrap_or(Value::Null)))
        .collect();
    let doc = match ids.first() {
        Some(nid) if scalar => output.remove(&nid.to_string()).unwrap_or(Value::Null),
        _ => Value::Object(output),
    };
    ui::emit(&formatter.format(&doc))?;
    if ok { Ok(()) } else { Err(ExitStatus(EXIT_CODE_UNSUCCESSFUL).into()) }
}
