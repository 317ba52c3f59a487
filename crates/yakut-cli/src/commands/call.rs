//! `yakut call` — Invoke an RPC-service and print the response.

use std::time::{Duration, Instant};

use anyhow::Context as _;
use clap::Args;
use serde_json::{Map, Value, json};
use yakut_common::constants::DEFAULT_SERVICE_REQUEST_TIMEOUT;
use yakut_common::types::{NodeId, Priority};
use yakut_node::resolver::process_service_specifier;
use yakut_node::types::service_schemas;
use yakut_transport::Timestamp;

use crate::context::{Context, parse_timeout, run_async};
use crate::output::FormatterHints;
use crate::ui;

const RESOLVER_MIN_RESPONSE_TIMEOUT: f64 = 1.0;

/// Arguments for the `call` command.
#[derive(Args, Debug)]
#[command(after_help = "\
The service is given as [SERVICE_ID:]TYPE_NAME[.MAJOR[.MINOR]] or SERVICE_NAME[:TYPE_NAME[.MAJOR[.MINOR]]];
a bare name is looked up in the uavcan.srv.NAME.* registers of the server.
The output maps the service-ID to the response.

Examples:
    yakut call 42 uavcan.node.getinfo -M -T3 -Pe
    yakut call 42 least_squares 'points: [{x: 10, y: 1}, {x: 20, y: 2}]'
    yakut call 42 123:sirius_cyber_corp.PerformLinearLeastSquaresFit '[[10, 1], [20, 2]]'")]
pub struct CallArgs {
    /// Node-ID of the server.
    #[arg(value_name = "SERVER_NODE_ID")]
    pub server_node_id: u16,

    /// Service specifier.
    #[arg(value_name = "SERVICE")]
    pub service: String,

    /// Request fields in YAML; missing fields keep their default values.
    #[arg(value_name = "FIELDS", default_value = "{}")]
    pub request_fields: String,

    /// Request timeout in seconds.
    #[arg(long, short = 'T', default_value_t = DEFAULT_SERVICE_REQUEST_TIMEOUT, value_parser = parse_timeout)]
    pub timeout: f64,

    /// Priority of the request transfer.
    #[arg(long, short = 'P', default_value = "nominal")]
    pub priority: Priority,

    /// Prepend the response with a `_meta_` object including the round-trip time.
    #[arg(long, short = 'M')]
    pub with_metadata: bool,
}

fn quantize(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

async fn run(args: CallArgs, request: Value, ctx: &Context) -> anyhow::Result<()> {
    let server = NodeId::new(args.server_node_id);
    let node = ctx.make_node("call", false)?;
    let mut formatter = ctx.formatter(FormatterHints { single_document: true });
    let loader = ctx.loader();
    let resolve_timeout = Duration::from_secs_f64(args.timeout.max(RESOLVER_MIN_RESPONSE_TIMEOUT));
    let (service_id, dtype) =
        process_service_specifier(&args.service, server, &loader, Some(&node), resolve_timeout).await?;
    let _ = service_schemas(&dtype).map_err(|_| anyhow::anyhow!("{} is not a service type", dtype.full_name()))?;
    tracing::info!(%request, service = service_id, dtype = %dtype, "request object");
    let mut client = node.make_client(&dtype, server, Some(service_id))?;
    client.timeout = Duration::from_secs_f64(args.timeout);
    client.priority = args.priority;

    let sent = Timestamp::now();
    let started = Instant::now();
    let result = client.call(&request).await;
    let elapsed = started.elapsed();
    node.close().await;
    let Some((response, meta)) = result? else {
        anyhow::bail!("The request has timed out after {:.1} seconds", args.timeout);
    };
    tracing::info!(duration = ?elapsed, "request completed");

    let mut body = Map::new();
    if args.with_metadata {
        let mut m = meta.to_builtin(Some(&dtype));
        let _ = m.insert("rtt".to_owned(), json!(quantize(meta.timestamp.monotonic - sent.monotonic)));
        let _ = body.insert("_meta_".to_owned(), Value::Object(m));
    }
    match response {
        Value::Object(fields) => body.extend(fields),
        other => {
            let _ = body.insert("value".to_owned(), other);
        }
    }
    let doc = Value::Object(Map::from_iter([(service_id.to_string(), Value::Object(body))]));
    ui::emit(&formatter.format(&doc))?;
    Ok(())
}

/// Executes the `call` command.
///
/// # Errors
///
/// Returns an error if the service cannot be resolved, the request is
/// malformed, or no response arrives in time.
pub fn execute(args: CallArgs, ctx: &Context) -> anyhow::Result<()> {
    tracing::debug!(?args, "call");
    let request = match crate::yaml::load(&args.request_fields).context("Invalid request fields")? {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    run_async(run(args, request, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_time_is_quantized() {
        assert!((quantize(0.123_456_789) - 0.123_457).abs() < 1e-12);
    }
}
