//! `yakut publish` — Publish messages, optionally computed anew on every
//! cycle from expressions and controller inputs.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context as _;
use clap::Args;
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tokio::time::Instant;
use yakut_common::types::Priority;
use yakut_node::Publisher;
use yakut_node::resolver::{SubjectResolver, process_subject_specifier};

use crate::context::{Context, parse_timeout, run_async};
use crate::controller::{ControllerReader, Selector};
use crate::expr::{Environment, EvalError, Val};
use crate::yaml::Template;

/// Arguments for the `publish` command.
#[derive(Args, Debug)]
#[command(after_help = "\
Each message is given as a pair: the subject specifier followed by the message fields in YAML.
Fields tagged `!$` are expressions evaluated on every cycle with these names available:
    n        publication cycle index, starting from zero
    t        n * period
    A(c, i)  axis i of controller c, in [-1, +1]
    B(c, i)  button i of controller c, 0 or 1
    T(c, i)  toggle switch i of controller c, 0 or 1
Controllers are referred to by index or name; see `yakut joystick`.

Examples:
    yakut pub 33:uavcan.si.unit.angle.Scalar 2.31 uavcan.diagnostic.Record 'text: hello'
    yakut pub -T 0.1 1234:uavcan.si.unit.voltage.Scalar '!$ \"sin(t * pi) * 10\"'
    yakut pub 5:uavcan.primitive.scalar.Real64 '!$ \"A(1, 3) * 100\"'")]
pub struct PublishArgs {
    /// SUBJECT FIELDS pairs. The subject is `[SUBJECT_ID:]TYPE_NAME[.MAJOR[.MINOR]]`;
    /// an empty FIELDS document publishes the default message.
    #[arg(value_name = "SUBJECT FIELDS", num_args = 0..)]
    pub message: Vec<String>,

    /// Message publication period in seconds; all messages are published once per period.
    #[arg(long, short = 'T', default_value = "1.0", value_parser = parse_timeout)]
    pub period: f64,

    /// Number of publication cycles before exiting normally. Unlimited by default.
    #[arg(long, short = 'N')]
    pub count: Option<i64>,

    /// Priority of published message transfers.
    #[arg(long, short = 'P', default_value = "nominal")]
    pub priority: Priority,
}

/// Variables and controller functions of one publication cycle.
struct Cycle<'a> {
    index: u64,
    period: f64,
    controllers: &'a OnceLock<ControllerReader>,
}

impl Cycle<'_> {
    fn read_controller(&self, name: &str, args: &[Val]) -> Result<Val, EvalError> {
        let [controller, channel] = args else {
            return Err(EvalError::Type(format!("{name}() takes the controller and the channel index")));
        };
        let selector = match controller {
            Val::Str(s) => Selector::Name(s.clone()),
            other => Selector::Index(index_of(other)?),
        };
        let channel = u8::try_from(index_of(channel)?)
            .map_err(|_| EvalError::Type(format!("{name}(): channel index out of range")))?;
        let reader = self.controllers.get_or_init(ControllerReader::open);
        let sample = reader
            .read(&selector)
            .ok_or_else(|| EvalError::Type(format!("controller {selector:?} is not connected")))?;
        Ok(match name {
            "A" => Val::Num(sample.axis(channel)),
            "B" => Val::Num(f64::from(u8::from(sample.button(channel)))),
            _ => Val::Num(f64::from(u8::from(sample.toggle(channel)))),
        })
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn index_of(v: &Val) -> Result<usize, EvalError> {
    let x = v.as_num()?;
    if x.fract() != 0.0 || x < 0.0 {
        return Err(EvalError::Type(format!("{x} is not a valid index")));
    }
    Ok(x as usize)
}

impl Environment for Cycle<'_> {
    #[allow(clippy::cast_precision_loss)]
    fn variable(&self, name: &str) -> Option<Val> {
        match name {
            "n" => Some(Val::Num(self.index as f64)),
            "t" => Some(Val::Num(self.period * self.index as f64)),
            _ => None,
        }
    }

    fn call(&self, name: &str, args: &[Val]) -> Option<Result<Val, EvalError>> {
        matches!(name, "A" | "B" | "T").then(|| self.read_controller(name, args))
    }
}

fn parse_messages(message: &[String]) -> anyhow::Result<Vec<(String, Template)>> {
    if message.len() % 2 != 0 {
        anyhow::bail!(
            "Expected pairs of SUBJECT FIELDS, got an odd number of arguments: {}",
            message.len()
        );
    }
    message
        .chunks_exact(2)
        .map(|pair| {
            let template = Template::parse(&pair[1]).with_context(|| format!("Invalid field spec {:?}", pair[1]))?;
            Ok((pair[0].clone(), template))
        })
        .collect()
}

async fn run(args: PublishArgs, messages: Vec<(String, Template)>, ctx: &Context) -> anyhow::Result<()> {
    let node = ctx.make_node("publish", true)?;
    let loader = ctx.loader();
    let mut publishers = Vec::with_capacity(messages.len());
    let mut templates = Vec::with_capacity(messages.len());
    {
        let mut resolver = match node.id() {
            Some(_) => Some(SubjectResolver::new(&node)?),
            None => None,
        };
        for (spec, template) in messages {
            let (subject_id, dtype) = process_subject_specifier(&spec, &loader, resolver.as_mut()).await?;
            let mut publisher = node.make_publisher(&dtype, Some(subject_id))?;
            publisher.priority = args.priority;
            tracing::info!(subject = subject_id, dtype = %dtype, constant = template.is_constant(), "publisher ready");
            publishers.push(Arc::new(publisher));
            templates.push(template);
        }
    }
    let result = publish_cycles(&publishers, &templates, args.period, args.count).await;
    node.close().await;
    result
}

/// Evaluates every message of a cycle; nothing is published if any fails.
fn evaluate_cycle(templates: &[Template], cycle: &Cycle<'_>) -> anyhow::Result<Vec<Value>> {
    templates
        .iter()
        .map(|template| {
            Ok(match template.evaluate(cycle)? {
                Value::Null => Value::Object(Map::new()),
                other => other,
            })
        })
        .collect()
}

/// Waits for every publication of a cycle, then reports the first failure.
async fn join_all(mut pending: JoinSet<anyhow::Result<()>>) -> anyhow::Result<()> {
    let mut first_error = None;
    while let Some(joined) = pending.join_next().await {
        let outcome = joined.context("publication task failed").and_then(|r| r);
        if let Err(e) = outcome {
            tracing::debug!(error = %e, "publication failed");
            let _ = first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

async fn publish_cycles(
    publishers: &[Arc<Publisher>],
    templates: &[Template],
    period: f64,
    count: Option<i64>,
) -> anyhow::Result<()> {
    let count = count.map_or(u64::MAX, |c| u64::try_from(c).unwrap_or(0));
    let timeout = Duration::from_secs_f64(period.max(0.1));
    let controllers = OnceLock::<ControllerReader>::new();
    let mut started = None;
    for index in 0..count {
        if let Some(reader) = controllers.get() {
            reader.sample_and_hold();
        }
        let cycle = Cycle {
            index,
            period,
            controllers: &controllers,
        };
        let messages = evaluate_cycle(templates, &cycle)?;
        // Lazy controller setup during the first evaluation must not shift the phase.
        let started = *started.get_or_insert_with(Instant::now);
        let mut pending = JoinSet::new();
        for (publisher, message) in publishers.iter().zip(messages) {
            tracing::debug!(subject = %publisher.subject_id(), index, %message, "publishing");
            let publisher = Arc::clone(publisher);
            let _ = pending.spawn(async move {
                if !publisher.publish(&message, timeout).await? {
                    tracing::error!(subject = %publisher.subject_id(), index, "publication timed out");
                }
                Ok::<_, anyhow::Error>(())
            });
        }
        join_all(pending).await?;
        #[allow(clippy::cast_precision_loss)]
        let deadline = started + Duration::from_secs_f64(period * (index + 1) as f64);
        tokio::time::sleep_until(deadline).await;
    }
    Ok(())
}

/// Executes the `publish` command.
///
/// # Errors
///
/// Returns an error on malformed arguments, unresolvable subjects, invalid
/// message contents or transport failures.
pub fn execute(args: PublishArgs, ctx: &Context) -> anyhow::Result<()> {
    tracing::debug!(?args, "publish");
    if let Some(count) = args.count.filter(|c| *c <= 0) {
        tracing::warn!("Nothing to do because count={count}");
        return Ok(());
    }
    let messages = parse_messages(&args.message)?;
    if messages.is_empty() {
        tracing::warn!("Nothing to do because no messages are specified");
        return Ok(());
    }
    run_async(run(args, messages, ctx))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde_json::json;

    use super::*;
    use crate::controller::{Controller, NullController};

    #[test]
    fn messages_come_in_pairs() {
        assert!(parse_messages(&["33:uavcan.primitive.String".into()]).is_err());
        let parsed = parse_messages(&["a".into(), "{x: !$ n}".into(), "b".into(), String::new()]).expect("pairs");
        assert_eq!(parsed.len(), 2);
        assert!(!parsed[0].1.is_constant());
        assert!(parsed[1].1.is_constant());
        assert!(parse_messages(&["a".into(), "!$ '1 +'".into()]).is_err());
    }

    #[test]
    fn cycle_variables() {
        let controllers = OnceLock::new();
        let cycle = Cycle {
            index: 3,
            period: 0.5,
            controllers: &controllers,
        };
        let t = Template::parse("{n: !$ n, t: !$ t, both: !$ 'n + t * 2'}").expect("parse");
        assert_eq!(t.evaluate(&cycle).expect("eval"), json!({"n": 3, "t": 1.5, "both": 6}));
        assert!(controllers.get().is_none());
    }

    #[test]
    fn failing_template_stops_the_whole_cycle() {
        let controllers = OnceLock::new();
        let boxed: Vec<Box<dyn Controller>> = vec![Box::new(NullController)];
        assert!(controllers.set(ControllerReader::new(boxed)).is_ok());
        let cycle = Cycle {
            index: 0,
            period: 1.0,
            controllers: &controllers,
        };
        let good = Template::parse("{value: !$ n}").expect("parse");
        let bad = Template::parse("!$ 'A(0)'").expect("parse");
        let empty = Template::parse("").expect("parse");
        assert!(evaluate_cycle(&[good.clone(), bad], &cycle).is_err());
        let messages = evaluate_cycle(&[good, empty], &cycle).expect("eval");
        assert_eq!(messages, vec![json!({"value": 0}), json!({})]);
    }

    #[tokio::test]
    async fn failed_publication_waits_for_the_rest() {
        let finished = Arc::new(AtomicBool::new(false));
        let mut pending: JoinSet<anyhow::Result<()>> = JoinSet::new();
        let _ = pending.spawn(async { Err(anyhow::anyhow!("first")) });
        let flag = Arc::clone(&finished);
        let _ = pending.spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        let _ = pending.spawn(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(anyhow::anyhow!("second"))
        });
        let err = join_all(pending).await.expect_err("failed");
        assert_eq!(err.to_string(), "first");
        assert!(finished.load(Ordering::SeqCst));
        assert!(join_all(JoinSet::new()).await.is_ok());
    }

    #[test]
    fn controller_functions_read_the_held_sample() {
        let controllers = OnceLock::new();
        let boxed: Vec<Box<dyn Controller>> = vec![Box::new(NullController)];
        assert!(controllers.set(ControllerReader::new(boxed)).is_ok());
        let cycle = Cycle {
            index: 0,
            period: 1.0,
            controllers: &controllers,
        };
        let t = Template::parse("[!$ 'A(0, 1)', !$ 'B(\"null\", 2)', !$ 'T(0, 0)']").expect("parse");
        assert_eq!(t.evaluate(&cycle).expect("eval"), json!([0, 0, 0]));
        assert!(Template::parse("!$ 'A(5, 0)'").expect("parse").evaluate(&cycle).is_err());
        assert!(Template::parse("!$ 'A(0)'").expect("parse").evaluate(&cycle).is_err());
    }
}
