//! `yakut subscribe` — Print the messages received on one or more subjects.

use std::sync::Arc;

use clap::{ArgGroup, Args};
use serde_json::{Map, Value};
use yakut_dsdl::DataType;
use yakut_node::resolver::{SubjectResolver, process_subject_specifier};
use yakut_node::sync::{
    ARRIVAL_TOLERANCE_MINMAX, AsyncSync, ClusterKey, FIELD_TOLERANCE_MINMAX, Group, MonoclustSync, SyncStream,
    Synchronizer, TransferIdSync, require_timestamp_field, tolerance_range,
};

use crate::context::{Context, run_async};
use crate::output::{Formatter, FormatterHints};
use crate::ui;

/// Arguments for the `subscribe` command.
#[derive(Args, Debug)]
#[command(
    group(ArgGroup::new("synchronizer").multiple(false)),
    after_help = "\
Subjects are specified as SUBJECT_ID:TYPE_NAME[.MAJOR[.MINOR]], as TYPE_NAME when the type has a
fixed subject-ID, or as a bare SUBJECT_ID to discover the type from the network (which requires a
local node-ID). Several subjects are subscribed to together and their messages are grouped by the
selected synchronizer; every document maps subject-IDs to messages.

Examples:
    yakut sub 33:uavcan.si.unit.angle.Scalar --with-metadata --count=1
    yakut sub 33 42 5789 --sync-monoclust-arrival=0.1
    yakut sub uavcan.node.Heartbeat"
)]
pub struct SubscribeArgs {
    /// Subject specifiers.
    #[arg(value_name = "SUBJECT")]
    pub subject: Vec<String>,

    /// Prepend each message with a `_meta_` object describing the transfer.
    #[arg(long, short = 'M')]
    pub with_metadata: bool,

    /// Exit after this many messages or synchronized groups. No limit by default.
    #[arg(long, short = 'N')]
    pub count: Option<i64>,

    /// Clear the screen before printing each document.
    #[arg(long, short = 'R')]
    pub redraw: bool,

    /// Group messages whose `timestamp` fields are within TOLERANCE seconds
    /// of each other. Without a value the tolerance is tuned automatically.
    #[arg(
        long,
        visible_alias = "smcf",
        value_name = "TOLERANCE",
        num_args = 0..=1,
        require_equals = true,
        group = "synchronizer"
    )]
    pub sync_monoclust_field: Option<Option<f64>>,

    /// Group messages received within TOLERANCE seconds of each other.
    /// Without a value the tolerance is tuned automatically.
    #[arg(
        long,
        visible_aliases = ["smca", "sync"],
        value_name = "TOLERANCE",
        num_args = 0..=1,
        require_equals = true,
        group = "synchronizer"
    )]
    pub sync_monoclust_arrival: Option<Option<f64>>,

    /// Group messages sharing the source node-ID and transfer-ID.
    #[arg(long, visible_alias = "stid", group = "synchronizer")]
    pub sync_transfer_id: bool,
}

impl SubscribeArgs {
    fn synchronizer(&self, dtypes: &[Arc<DataType>]) -> anyhow::Result<Box<dyn Synchronizer>> {
        let width = dtypes.len();
        if let Some(tolerance) = self.sync_monoclust_field {
            require_timestamp_field(dtypes.iter().map(AsRef::as_ref))?;
            let range = tolerance_range(tolerance.unwrap_or(f64::NAN), FIELD_TOLERANCE_MINMAX);
            return Ok(Box::new(MonoclustSync::new(width, ClusterKey::Field, range)));
        }
        if let Some(tolerance) = self.sync_monoclust_arrival {
            let range = tolerance_range(tolerance.unwrap_or(f64::NAN), ARRIVAL_TOLERANCE_MINMAX);
            return Ok(Box::new(MonoclustSync::new(width, ClusterKey::Arrival, range)));
        }
        if self.sync_transfer_id {
            return Ok(Box::new(TransferIdSync::new(width)));
        }
        if width == 1 {
            return Ok(Box::new(AsyncSync::unary(width)?));
        }
        Ok(Box::new(AsyncSync::new(width)))
    }
}

/// The output document of one group: subject-ID to message, with the
/// transfer metadata first when requested.
fn render_group(group: &Group, subjects: &[(u16, Arc<DataType>)], with_metadata: bool) -> Value {
    let mut outer = Map::new();
    for (slot, (subject_id, dtype)) in group.iter().zip(subjects) {
        let Some((message, meta)) = slot else {
            continue;
        };
        let mut inner = Map::new();
        if with_metadata {
            let _ = inner.insert("_meta_".to_owned(), Value::Object(meta.to_builtin(Some(dtype))));
        }
        match message {
            Value::Object(fields) => inner.extend(fields.clone()),
            other => {
                let _ = inner.insert("value".to_owned(), other.clone());
            }
        }
        let _ = outer.insert(subject_id.to_string(), Value::Object(inner));
    }
    Value::Object(outer)
}

async fn run(args: SubscribeArgs, ctx: &Context) -> anyhow::Result<()> {
    let node = ctx.make_node("subscribe", true)?;
    if node.id().is_some() {
        tracing::info!("It is recommended to use an anonymous node with this command");
    }
    let loader = ctx.loader();
    let mut subjects = Vec::with_capacity(args.subject.len());
    {
        let mut resolver = match node.id() {
            Some(_) => Some(SubjectResolver::new(&node)?),
            None => None,
        };
        for spec in &args.subject {
            subjects.push(process_subject_specifier(spec, &loader, resolver.as_mut()).await?);
        }
    }
    let dtypes: Vec<Arc<DataType>> = subjects.iter().map(|(_, dt)| Arc::clone(dt)).collect();
    let synchronizer = args.synchronizer(&dtypes)?;
    let subscribers = subjects
        .iter()
        .map(|(id, dt)| node.make_subscriber(dt, Some(*id)))
        .collect::<yakut_node::Result<Vec<_>>>()?;
    tracing::info!(subjects = ?subjects.iter().map(|(id, _)| *id).collect::<Vec<_>>(), "subscribed");

    let mut formatter: Formatter = ctx.formatter(FormatterHints::default());
    let mut stream = SyncStream::new(subscribers, synchronizer);
    let mut remaining = args.count.map_or(u64::MAX, |c| u64::try_from(c).unwrap_or(0));
    let mut result = Ok(());
    while remaining > 0 {
        let Some(group) = stream.next().await else {
            tracing::info!("subscription ended");
            break;
        };
        let doc = formatter.format(&render_group(&group, &subjects, args.with_metadata));
        if args.redraw {
            if let Err(e) = ui::clear_screen() {
                result = Err(e.into());
                break;
            }
        }
        if let Err(e) = ui::emit(&doc) {
            result = Err(e.into());
            break;
        }
        remaining -= 1;
    }
    tracing::info!(transport = %node.transport().describe(), "subscription finished");
    node.close().await;
    result
}

/// Executes the `subscribe` command.
///
/// # Errors
///
/// Returns an error if a subject cannot be resolved or the transport fails.
pub fn execute(args: SubscribeArgs, ctx: &Context) -> anyhow::Result<()> {
    tracing::debug!(?args, "subscribe");
    if let Some(count) = args.count.filter(|c| *c <= 0) {
        tracing::warn!("Nothing to do because count={count}");
        return Ok(());
    }
    if args.subject.is_empty() {
        tracing::warn!("Nothing to do because no subjects are specified");
        return Ok(());
    }
    run_async(run(args, ctx))
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use serde_json::json;
    use yakut_common::types::{NodeId, Priority};
    use yakut_node::TransferMeta;
    use yakut_transport::Timestamp;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: SubscribeArgs,
    }

    fn parse(line: &str) -> Result<SubscribeArgs, clap::Error> {
        Harness::try_parse_from(std::iter::once("sub").chain(line.split_whitespace())).map(|h| h.args)
    }

    #[test]
    fn synchronizer_options_are_exclusive() {
        let a = parse("33 42 --sync").expect("arrival");
        assert_eq!(a.sync_monoclust_arrival, Some(None));
        assert_eq!(a.subject, ["33", "42"]);
        let a = parse("33 42 --smcf=0.5").expect("field");
        assert_eq!(a.sync_monoclust_field, Some(Some(0.5)));
        assert!(parse("33 42 --stid --smca").is_err());
    }

    #[test]
    fn groups_render_by_subject_id() {
        let dtype = yakut_node::types::HEARTBEAT.load().expect("heartbeat");
        let subjects = vec![(7509, Arc::clone(&dtype)), (100, dtype)];
        let meta = TransferMeta {
            timestamp: Timestamp {
                system: 1.5,
                monotonic: 2.25,
            },
            priority: Priority::Nominal,
            transfer_id: 9,
            source_node_id: Some(NodeId::new(42)),
        };
        let group: Group = vec![Some((json!({"uptime": 5}), meta)), None];
        assert_eq!(render_group(&group, &subjects, false), json!({"7509": {"uptime": 5}}));

        let with_meta = render_group(&group, &subjects, true);
        let inner = with_meta["7509"].as_object().expect("object");
        assert_eq!(inner.keys().next().map(String::as_str), Some("_meta_"));
        assert_eq!(inner["_meta_"]["source_node_id"], json!(42));
        assert_eq!(inner["_meta_"]["dtype"], json!("uavcan.node.Heartbeat.1.0"));
    }
}
