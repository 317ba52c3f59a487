//! CLI command definitions and dispatch.
//!
//! Global options go before the subcommand. Every long option of a
//! subcommand can also be given as `YAKUT_<SUBCOMMAND>_<OPTION>`; the
//! variable names are attached by [`attach_env`] when the tree is built.

pub mod accommodate;
pub mod call;
pub mod compile;
pub mod execute_command;
pub mod file_client;
pub mod file_server;
pub mod joystick;
pub mod monitor;
pub mod orchestrate;
pub mod publish;
pub mod register;
pub mod register_batch;
pub mod register_list;
pub mod subscribe;

use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::{ArgAction, CommandFactory, FromArgMatches, Parser, Subcommand};
use yakut_common::config::{LookupPaths, PATH_LIST_SEP};
use yakut_common::constants::ENV_PREFIX;
use yakut_common::int_set::parse_int_set;
use yakut_common::types::NodeId;

use crate::context::{Context, NodeArgs};
use crate::output::FormatArgs;

/// Yakut: a simple CLI tool for diagnostics and debugging of Cyphal networks.
#[derive(Parser, Debug)]
#[command(
    name = "yakut",
    version,
    about,
    long_about = None,
    infer_subcommands = true,
    infer_long_args = true,
    after_help = "Every long option of a subcommand may be set through YAKUT_<SUBCOMMAND>_<OPTION>, \
                  e.g. YAKUT_SUBSCRIBE_COUNT=3. Registers are read from UAVCAN__* variables, \
                  e.g. UAVCAN__NODE__ID=42."
)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Emit verbose log messages. Specify twice for extra verbosity.
    #[arg(long, short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Add a directory to the lookup paths for compiled namespaces and
    /// orc-files. The current directory is always searched first.
    #[arg(long, short = 'P', env = "YAKUT_PATH", value_delimiter = PATH_LIST_SEP)]
    pub path: Vec<PathBuf>,

    /// Output format selection.
    #[command(flatten)]
    pub format: FormatArgs,

    /// Transport expression, e.g. 'Loopback(42)'. When absent, the transport
    /// is configured from the UAVCAN__* registers.
    #[arg(long, short = 'i', env = "YAKUT_TRANSPORT")]
    pub transport: Option<String>,

    /// Local node options.
    #[command(flatten)]
    pub node: NodeArgs,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile DSDL namespaces so that their types become available.
    #[command(visible_alias = "co")]
    Compile(compile::CompileArgs),
    /// Publish messages on the specified subjects.
    #[command(visible_aliases = ["pub", "p"])]
    Publish(publish::PublishArgs),
    /// Subscribe to subjects and print the received messages.
    #[command(visible_aliases = ["sub", "s"])]
    Subscribe(subscribe::SubscribeArgs),
    /// Invoke an RPC-service and print the response.
    #[command(visible_alias = "q")]
    Call(call::CallArgs),
    /// Display the network activity in real time.
    #[command(visible_alias = "mon")]
    Monitor(monitor::MonitorArgs),
    /// Read or write a register on the specified nodes.
    #[command(visible_aliases = ["r", "reg"])]
    Register(register::RegisterArgs),
    /// List the registers of the specified nodes.
    #[command(visible_alias = "rl")]
    RegisterList(register_list::RegisterListArgs),
    /// Read and write registers of many nodes as directed by a YAML document.
    #[command(visible_aliases = ["rbat", "rb"])]
    RegisterBatch(register_batch::RegisterBatchArgs),
    /// Send uavcan.node.ExecuteCommand to the specified nodes.
    #[command(visible_alias = "cmd")]
    ExecuteCommand(execute_command::ExecuteCommandArgs),
    /// Serve files and optionally update the software of nodes.
    #[command(visible_alias = "fsrv")]
    FileServer(file_server::FileServerArgs),
    /// Access the file service of remote nodes.
    #[command(visible_alias = "fcli")]
    FileClient(file_client::FileClientArgs),
    /// Print a node-ID that appears to be free on the network.
    #[command(visible_alias = "acc")]
    Accommodate(accommodate::AccommodateArgs),
    /// Show the state of the connected joysticks.
    #[command(visible_alias = "joy")]
    Joystick(joystick::JoystickArgs),
    /// Execute an orchestration file.
    #[command(visible_alias = "orc")]
    Orchestrate(orchestrate::OrchestrateArgs),
}

/// `YAKUT_<PATH>_<LONG>` with dashes turned into underscores.
fn env_name(path: &[String], long: &str) -> String {
    let mut parts = vec![ENV_PREFIX.to_owned()];
    parts.extend(path.iter().cloned());
    parts.push(long.to_owned());
    parts.join("_").replace('-', "_").to_uppercase()
}

/// Attaches environment variable names to the long options of every
/// subcommand below `cmd`, which is named by `path`.
fn attach_env(cmd: clap::Command, path: &[String]) -> clap::Command {
    let names: Vec<String> = cmd.get_subcommands().map(|s| s.get_name().to_owned()).collect();
    names.into_iter().fold(cmd, |cmd, name| {
        cmd.mut_subcommand(name.clone(), |sub| {
            let mut sub_path = path.to_vec();
            sub_path.push(name.clone());
            let sub = sub
                .infer_long_args(true)
                .infer_subcommands(true)
                .mut_args(|arg| {
                    let id = arg.get_id().as_str();
                    if arg.get_env().is_some() || arg.is_positional() || id == "help" || id == "version" {
                        return arg;
                    }
                    let Some(var) = arg.get_long().map(|long| env_name(&sub_path, long)) else {
                        return arg;
                    };
                    arg.env(var)
                });
            attach_env(sub, &sub_path)
        })
    })
}

/// The complete command tree.
#[must_use]
pub fn command() -> clap::Command {
    attach_env(Cli::command(), &[])
}

/// Parses the command line.
///
/// # Errors
///
/// Usage errors, `--help` and `--version`; clap renders them.
pub fn parse<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let mut cmd = command();
    let matches = cmd.try_get_matches_from_mut(args)?;
    Cli::from_arg_matches(&matches).map_err(|e| e.format(&mut cmd))
}

/// Parses a node-ID set such as `1,2,10-20`. A bare number stays a scalar,
/// which the caller may use to unwrap single-node output.
///
/// # Errors
///
/// Fails on malformed sets and values outside the node-ID range.
pub fn parse_node_ids(text: &str) -> anyhow::Result<(Vec<NodeId>, bool)> {
    let set = parse_int_set(text).map_err(|e| anyhow::anyhow!("{e}"))?;
    let ids = set
        .to_vec()
        .into_iter()
        .map(|x| NodeId::try_from_i64(x).map_err(|e| anyhow::anyhow!("{e}")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok((ids, set.is_scalar()))
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let cwd = std::env::current_dir().context("cannot determine the working directory")?;
    let ctx = Context {
        lookup: LookupPaths::new(&cwd, &cli.path),
        format: cli.format.resolve(),
        transport: cli.transport.filter(|t| !t.trim().is_empty()),
        node: cli.node,
    };
    tracing::debug!(lookup = ?ctx.lookup, format = ?ctx.format, "context ready");
    match cli.command {
        Command::Compile(args) => compile::execute(args, &ctx),
        Command::Publish(args) => publish::execute(args, &ctx),
        Command::Subscribe(args) => subscribe::execute(args, &ctx),
        Command::Call(args) => call::execute(args, &ctx),
        Command::Monitor(args) => monitor::execute(args, &ctx),
        Command::Register(args) => register::execute(args, &ctx),
        Command::RegisterList(args) => register_list::execute(args, &ctx),
        Command::RegisterBatch(args) => register_batch::execute(args, &ctx),
        Command::ExecuteCommand(args) => execute_command::execute(args, &ctx),
        Command::FileServer(args) => file_server::execute(args, &ctx),
        Command::FileClient(args) => file_client::execute(args, &ctx),
        Command::Accommodate(args) => accommodate::execute(args, &ctx),
        Command::Joystick(args) => joystick::execute(args, &ctx),
        Command::Orchestrate(args) => orchestrate::execute(args, &ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        std::iter::once("yakut".to_owned())
            .chain(line.split_whitespace().map(str::to_owned))
            .collect()
    }

    #[test]
    fn command_tree_is_consistent() {
        command().debug_assert();
    }

    #[test]
    fn env_names_use_the_full_subcommand_path() {
        assert_eq!(env_name(&["subscribe".into()], "count"), "YAKUT_SUBSCRIBE_COUNT");
        assert_eq!(
            env_name(&["register-batch".into()], "optional-service"),
            "YAKUT_REGISTER_BATCH_OPTIONAL_SERVICE"
        );
        assert_eq!(env_name(&["file-client".into(), "ls".into()], "get-info"), "YAKUT_FILE_CLIENT_LS_GET_INFO");

        let cmd = command();
        let sub = cmd.find_subcommand("subscribe").expect("subscribe");
        let count = sub
            .get_arguments()
            .find(|a| a.get_long() == Some("count"))
            .expect("count");
        assert_eq!(
            count.get_env().and_then(|e| e.to_str()),
            Some("YAKUT_SUBSCRIBE_COUNT")
        );
    }

    #[test]
    fn aliases_and_prefixes_resolve() {
        for line in ["sub 33:uavcan.si.unit.angle.Scalar", "s 7509", "subscr 7509"] {
            let cli = parse(args(line)).expect(line);
            assert!(matches!(cli.command, Command::Subscribe(_)), "{line}");
        }
        let cli = parse(args("-vv --json rl 1,2")).expect("register-list");
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Command::RegisterList(_)));
        assert!(parse(args("frobnicate")).is_err());
    }

    #[test]
    fn node_id_sets() {
        assert_eq!(parse_node_ids("5").expect("scalar"), (vec![NodeId::new(5)], true));
        let (ids, scalar) = parse_node_ids("1-4,!2").expect("set");
        assert_eq!(ids, vec![NodeId::new(1), NodeId::new(3)]);
        assert!(!scalar);
        assert!(parse_node_ids("70000").is_err());
    }
}
