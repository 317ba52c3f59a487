//! `yakut register-batch` — Read and write many registers of many nodes, as
//! directed by a YAML or JSON document.

use std::io::Read as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::{ArgAction, Args};
use serde_json::Value;
use yakut_common::constants::{DEFAULT_SERVICE_REQUEST_TIMEOUT, EXIT_CODE_UNSUCCESSFUL};
use yakut_common::types::NodeId;
use yakut_node::register::remote::{self, AccessOptions, Directive, Predicate};

use crate::commands::parse_node_ids;
use crate::context::{Context, parse_timeout, run_async};
use crate::output::FormatterHints;
use crate::ui::{self, ExitStatus, ProgressReporter};

/// Arguments for the `register-batch` command.
#[derive(Args, Debug)]
#[command(after_help = "\
The directive maps node-IDs to register names (read) or to mappings of names to values (write), as
produced by `register-list` and by this command respectively. Registers are processed strictly in
the order of the document. With NODE_IDS, the document describes one node and is applied to each.

Examples:
    yakut register-list 42,45-50 | yakut register-batch --only=mp > network_config.json
    y rl 125 | y rb 125 -omp > single_node_config.json
    y rb 10-14 --file single_node_config.json")]
pub struct RegisterBatchArgs {
    /// Apply a single-node directive to each of these nodes.
    #[arg(value_name = "NODE_IDS")]
    pub node_ids: Option<String>,

    /// Directive file; read from stdin by default.
    #[arg(long, short = 'f', value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Output only the registers with these flags: m(utable), i(mmutable),
    /// p(ersistent), v(olatile), or a combination such as mp. All registers
    /// are written regardless.
    #[arg(long, short = 'o', value_parser = parse_predicate)]
    pub only: Option<Predicate>,

    /// Response timeout in seconds.
    #[arg(long, short = 'T', default_value_t = DEFAULT_SERVICE_REQUEST_TIMEOUT, value_parser = parse_timeout)]
    pub timeout: f64,

    /// Nodes that never answer are reported as warnings rather than errors.
    #[arg(long, short = 's')]
    pub optional_service: bool,

    /// Nonexistent registers are reported as warnings rather than errors.
    #[arg(long, short = 'r')]
    pub optional_register: bool,

    /// Print typed values instead of simplified ones; twice to add the flags.
    #[arg(long, short = 'd', action = ArgAction::Count)]
    pub detailed: u8,
}

fn parse_predicate(text: &str) -> Result<Predicate, String> {
    text.parse().map_err(|e| format!("{e}; choose one of {}", Predicate::CODES.join(", ")))
}

fn read_document(file: Option<&PathBuf>) -> anyhow::Result<Value> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?,
        None => {
            let mut text = String::new();
            let _ = std::io::stdin()
                .read_to_string(&mut text)
                .context("cannot read the directive from stdin")?;
            text
        }
    };
    crate::yaml::load(&text).context("invalid directive document")
}

/// Executes the `register-batch` command.
///
/// # Errors
///
/// Returns an error on malformed directives or if the node cannot be
/// started; failed registers print the best-effort output and exit with
/// status 1.
pub fn execute(args: RegisterBatchArgs, ctx: &Context) -> anyhow::Result<()> {
    let targets: Option<(Vec<NodeId>, bool)> = args.node_ids.as_deref().map(parse_node_ids).transpose()?;
    let document = read_document(args.file.as_ref())?;
    let directive = Directive::load(&document, targets.as_ref().map(|(ids, _)| ids.as_slice()))?;
    tracing::debug!(?args, nodes = directive.registers_per_node.len(), "register-batch");
    let mut formatter = ctx.formatter(FormatterHints { single_document: true });
    let results = run_async(async {
        let node = ctx.make_node("register_batch", false)?;
        let mut progress = ProgressReporter::new();
        progress.report(&format!(
            "Processing {} register(s) of {} node(s)",
            directive.registers_per_node.iter().map(|(_, r)| r.len()).sum::<usize>(),
            directive.registers_per_node.len()
        ));
        let result = remote::do_calls(&node, &directive, Duration::from_secs_f64(args.timeout)).await;
        drop(progress);
        node.close().await;
        Ok(result?)
    })?;
    let options = AccessOptions {
        optional_service: args.optional_service,
        optional_register: args.optional_register,
    };
    let (errors, warnings) = remote::batch_report(&results, options);
    let ok = ui::report(&errors, &warnings);
    let mut output = remote::batch_output(&results, args.only, args.detailed);
    let single = match (&targets, &output) {
        (Some((_, true)), Value::Object(per_node)) if per_node.len() == 1 => per_node.values().next().cloned(),
        _ => None,
    };
    if let Some(single) = single {
        output = single;
    }
    ui::emit(&formatter.format(&output))?;
    if ok { Ok(()) } else { Err(ExitStatus(EXIT_CODE_UNSUCCESSFUL).into()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_are_case_insensitive() {
        assert_eq!(parse_predicate("MP"), Ok(Predicate::MutablePersistent));
        assert!(parse_predicate("q").expect_err("bad").contains("choose one of m, i, p, v"));
    }

    #[test]
    fn directive_file_is_read() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("d.yaml");
        std::fs::write(&path, "{42: [uavcan.node.id]}").expect("write");
        let doc = read_document(Some(&path)).expect("read");
        let directive = Directive::load(&doc, None).expect("directive");
        assert_eq!(directive.registers_per_node[0].0, NodeId::new(42));
        assert!(read_document(Some(&tmp.path().join("missing"))).is_err());
    }
}
