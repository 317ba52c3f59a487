//! `yakut file-client` — Work with the files of remote nodes over the
//! standard file services.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Subcommand};
use serde_json::{Map, Value};
use yakut_common::constants::{DEFAULT_SERVICE_REQUEST_TIMEOUT, EXIT_CODE_UNSUCCESSFUL};
use yakut_common::types::NodeId;
use yakut_node::Node;
use yakut_node::file::{FileClient, FileEntry, ListOptions, list_files};

use crate::commands::parse_node_ids;
use crate::context::{Context, parse_timeout, run_async};
use crate::output::FormatterHints;
use crate::ui::{self, ExitStatus, ProgressReporter};

/// Arguments for the `file-client` command group.
#[derive(Args, Debug)]
pub struct FileClientArgs {
    /// Operation to perform.
    #[command(subcommand)]
    pub command: FileCommand,
}

/// File client operations.
#[derive(Subcommand, Debug)]
pub enum FileCommand {
    /// List a directory on remote nodes.
    Ls(LsArgs),
    /// Move or rename a file or directory on remote nodes.
    Mv(ModifyArgs),
    /// Copy a file on remote nodes.
    Cp(ModifyArgs),
    /// Create an empty file or update its timestamp on remote nodes.
    Touch(PathArgs),
    /// Remove a file or directory on remote nodes.
    Rm(PathArgs),
    /// Read a file from a remote node into a local file.
    Read(TransferArgs),
    /// Write a local file to a remote node.
    Write(TransferArgs),
}

/// Arguments for `file-client ls`.
#[derive(Args, Debug)]
pub struct LsArgs {
    /// Node-IDs to query, as an integer set such as `1,3-5`.
    #[arg(value_name = "NODE_IDS")]
    pub node_ids: String,

    /// Remote directory; the server root by default.
    #[arg(value_name = "PATH", default_value = "")]
    pub path: String,

    /// Response timeout in seconds.
    #[arg(long, short = 'T', default_value_t = DEFAULT_SERVICE_REQUEST_TIMEOUT, value_parser = parse_timeout)]
    pub timeout: f64,

    /// Nodes that never answer are reported as warnings rather than errors.
    #[arg(long, short = 's')]
    pub optional_service: bool,

    /// Also request the attributes of every entry.
    #[arg(long, short = 'i')]
    pub get_info: bool,
}

/// Arguments for `file-client mv` and `file-client cp`.
#[derive(Args, Debug)]
pub struct ModifyArgs {
    /// Node-IDs to act on, as an integer set such as `1,3-5`.
    #[arg(value_name = "NODE_IDS")]
    pub node_ids: String,

    /// Source path.
    #[arg(value_name = "SRC")]
    pub source: String,

    /// Destination path.
    #[arg(value_name = "DST")]
    pub destination: String,

    /// Replace the destination if it exists.
    #[arg(long, short = 'f')]
    pub overwrite: bool,

    /// Response timeout in seconds.
    #[arg(long, short = 'T', default_value_t = DEFAULT_SERVICE_REQUEST_TIMEOUT, value_parser = parse_timeout)]
    pub timeout: f64,
}

/// Arguments for `file-client touch` and `file-client rm`.
#[derive(Args, Debug)]
pub struct PathArgs {
    /// Node-IDs to act on, as an integer set such as `1,3-5`.
    #[arg(value_name = "NODE_IDS")]
    pub node_ids: String,

    /// Remote path.
    #[arg(value_name = "PATH")]
    pub path: String,

    /// Response timeout in seconds.
    #[arg(long, short = 'T', default_value_t = DEFAULT_SERVICE_REQUEST_TIMEOUT, value_parser = parse_timeout)]
    pub timeout: f64,
}

/// Arguments for `file-client read` and `file-client write`.
#[derive(Args, Debug)]
pub struct TransferArgs {
    /// Node-ID of the file server.
    #[arg(value_name = "NODE_ID", value_parser = parse_single_node_id)]
    pub node_id: NodeId,

    /// Source path: remote for `read`, local for `write`.
    #[arg(value_name = "SRC")]
    pub source: String,

    /// Destination path; the base name of the source by default.
    #[arg(value_name = "DST")]
    pub destination: Option<String>,

    /// Response timeout in seconds.
    #[arg(long, short = 'T', default_value_t = DEFAULT_SERVICE_REQUEST_TIMEOUT, value_parser = parse_timeout)]
    pub timeout: f64,
}

fn parse_single_node_id(text: &str) -> Result<NodeId, String> {
    let value: i64 = text.trim().parse().map_err(|e| format!("{e}"))?;
    NodeId::try_from_i64(value).map_err(|e| e.to_string())
}

/// A modification applied to every node in turn.
#[derive(Debug, Clone, Copy)]
enum Modification<'a> {
    Move { source: &'a str, destination: &'a str, overwrite: bool },
    Copy { source: &'a str, destination: &'a str, overwrite: bool },
    Touch(&'a str),
    Remove(&'a str),
}

impl<'a> Modification<'a> {
    const fn suffix(self) -> &'static str {
        match self {
            Self::Move { .. } => "file_client_mv",
            Self::Copy { .. } => "file_client_cp",
            Self::Touch(_) => "file_client_touch",
            Self::Remove(_) => "file_client_rm",
        }
    }

    fn describe(self) -> String {
        match self {
            Self::Move { source, destination, .. } => format!("moving {source} to {destination}"),
            Self::Copy { source, destination, .. } => format!("copying {source} to {destination}"),
            Self::Touch(path) => format!("touching {path}"),
            Self::Remove(path) => format!("removing {path}"),
        }
    }

    /// The path whose absence is a warning rather than an error.
    const fn may_be_missing(self) -> Option<&'static str> {
        match self {
            Self::Touch(_) => None,
            Self::Move { .. } | Self::Copy { .. } => Some("Source path"),
            Self::Remove(_) => Some("Path"),
        }
    }

    const fn subject(self) -> &'a str {
        match self {
            Self::Move { source, .. } | Self::Copy { source, .. } | Self::Remove(source) => source,
            Self::Touch(path) => path,
        }
    }

    async fn apply(self, fc: &FileClient<'_>) -> yakut_node::file::client::Result<()> {
        match self {
            Self::Move { source, destination, overwrite } => fc.move_(source, destination, overwrite).await,
            Self::Copy { source, destination, overwrite } => fc.copy(source, destination, overwrite).await,
            Self::Touch(path) => fc.touch(path).await,
            Self::Remove(path) => fc.remove(path).await,
        }
    }
}

async fn modify_all(
    node: &Node,
    ids: &[NodeId],
    op: Modification<'_>,
    timeout: Duration,
) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut progress = ProgressReporter::new();
    for &nid in ids {
        progress.report(&format!("{} on node {nid}", op.describe()));
        let fc = FileClient::new(node, nid, timeout);
        match op.apply(&fc).await {
            Ok(()) => tracing::info!(node_id = %nid, "done {}", op.describe()),
            Err(e) if e.is_not_found() => match op.may_be_missing() {
                Some(what) => warnings.push(format!("{what} {} not found on node {nid}", op.subject())),
                None => errors.push(format!("Error {} on node {nid}: {e}", op.describe())),
            },
            Err(e) => errors.push(format!("Error {} on node {nid}: {e}", op.describe())),
        }
    }
    (errors, warnings)
}

fn finish(errors: &[String], warnings: &[String]) -> anyhow::Result<()> {
    if ui::report(errors, warnings) {
        Ok(())
    } else {
        Err(ExitStatus(EXIT_CODE_UNSUCCESSFUL).into())
    }
}

fn run_modification(node_ids: &str, op: Modification<'_>, timeout: f64, ctx: &Context) -> anyhow::Result<()> {
    let (ids, _) = parse_node_ids(node_ids)?;
    tracing::debug!(?ids, ?op, timeout, "file-client");
    let (errors, warnings) = run_async(async {
        let node = ctx.make_node(op.suffix(), false)?;
        let result = modify_all(&node, &ids, op, Duration::from_secs_f64(timeout)).await;
        node.close().await;
        Ok(result)
    })?;
    finish(&errors, &warnings)
}

fn render_listing(per_node: &std::collections::BTreeMap<NodeId, Option<Vec<FileEntry>>>, unwrap: bool) -> Value {
    let entries = |v: &Option<Vec<FileEntry>>| {
        v.as_ref()
            .map_or(Value::Null, |e| serde_json::to_value(e).unwrap_or(Value::Null))
    };
    if unwrap && per_node.len() == 1 {
        if let Some(v) = per_node.values().next() {
            return entries(v);
        }
    }
    Value::Object(per_node.iter().map(|(nid, v)| (nid.to_string(), entries(v))).collect::<Map<_, _>>())
}

fn ls(args: LsArgs, ctx: &Context) -> anyhow::Result<()> {
    let (ids, scalar) = parse_node_ids(&args.node_ids)?;
    tracing::debug!(?args, ?ids, "file-client ls");
    let mut formatter = ctx.formatter(FormatterHints { single_document: true });
    let options = ListOptions {
        optional_service: args.optional_service,
        get_info: args.get_info,
        timeout: Duration::from_secs_f64(args.timeout),
    };
    let outcome = run_async(async {
        let node = ctx.make_node("file_client_ls", false)?;
        let mut progress = ProgressReporter::new();
        let result = list_files(&node, &ids, &args.path, options, &mut |s| progress.report(s)).await;
        drop(progress);
        node.close().await;
        Ok(result?)
    })?;
    let ok = ui::report(&outcome.errors, &outcome.warnings);
    ui::emit(&formatter.format(&render_listing(&outcome.data_per_node, scalar)))?;
    if ok { Ok(()) } else { Err(ExitStatus(EXIT_CODE_UNSUCCESSFUL).into()) }
}

/// The local destination of `read`: the given path or the remote base name.
fn read_destination(source: &str, destination: Option<&str>) -> PathBuf {
    destination.map_or_else(
        || PathBuf::from(source.rsplit('/').find(|s| !s.is_empty()).unwrap_or(source)),
        PathBuf::from,
    )
}

/// The remote destination of `write`: the given path or the local base name.
fn write_destination(source: &Path, destination: Option<&str>) -> String {
    destination.map_or_else(
        || source.file_name().map_or_else(String::new, |n| n.to_string_lossy().into_owned()),
        str::to_owned,
    )
}

fn read(args: TransferArgs, ctx: &Context) -> anyhow::Result<()> {
    let destination = read_destination(&args.source, args.destination.as_deref());
    let nid = args.node_id;
    let data = run_async(async {
        let node = ctx.make_node("file_client_read", false)?;
        let fc = FileClient::new(&node, nid, Duration::from_secs_f64(args.timeout));
        let mut progress = ProgressReporter::new();
        let result = fc
            .read(&args.source, &mut |done, _| progress.report(&format!("Read {done} bytes")))
            .await;
        drop(progress);
        node.close().await;
        Ok(result)
    })?;
    match data {
        Ok(data) => {
            std::fs::write(&destination, &data).with_context(|| format!("cannot write {}", destination.display()))?;
            tracing::info!(
                node_id = %nid,
                bytes = data.len(),
                source = %args.source,
                destination = %destination.display(),
                "read"
            );
            Ok(())
        }
        Err(e) if e.is_not_found() => finish(&[format!("File {} not found on node {nid}", args.source)], &[]),
        Err(e) => finish(&[format!("Error reading {} from node {nid}: {e}", args.source)], &[]),
    }
}

fn write(args: TransferArgs, ctx: &Context) -> anyhow::Result<()> {
    let source = PathBuf::from(&args.source);
    let destination = write_destination(&source, args.destination.as_deref());
    let data = std::fs::read(&source).with_context(|| format!("cannot read {}", source.display()))?;
    let nid = args.node_id;
    let result = run_async(async {
        let node = ctx.make_node("file_client_write", false)?;
        let fc = FileClient::new(&node, nid, Duration::from_secs_f64(args.timeout));
        let mut progress = ProgressReporter::new();
        let result = fc
            .write(&destination, &data, &mut |done, total| {
                progress.report(&format!("Written {done}/{} bytes", total.unwrap_or(0)));
            })
            .await;
        drop(progress);
        node.close().await;
        Ok(result)
    })?;
    match result {
        Ok(()) => {
            tracing::info!(node_id = %nid, bytes = data.len(), %destination, "written");
            Ok(())
        }
        Err(e) => finish(&[format!("Error writing {} to node {nid}: {e}", source.display())], &[]),
    }
}

/// Executes a `file-client` subcommand.
///
/// # Errors
///
/// Returns an error on malformed arguments or if the node cannot be
/// started; failed operations exit with status 1.
pub fn execute(args: FileClientArgs, ctx: &Context) -> anyhow::Result<()> {
    match args.command {
        FileCommand::Ls(a) => ls(a, ctx),
        FileCommand::Mv(a) => {
            let op = Modification::Move { source: &a.source, destination: &a.destination, overwrite: a.overwrite };
            run_modification(&a.node_ids, op, a.timeout, ctx)
        }
        FileCommand::Cp(a) => {
            let op = Modification::Copy { source: &a.source, destination: &a.destination, overwrite: a.overwrite };
            run_modification(&a.node_ids, op, a.timeout, ctx)
        }
        FileCommand::Touch(a) => run_modification(&a.node_ids, Modification::Touch(&a.path), a.timeout, ctx),
        FileCommand::Rm(a) => run_modification(&a.node_ids, Modification::Remove(&a.path), a.timeout, ctx),
        FileCommand::Read(a) => read(a, ctx),
        FileCommand::Write(a) => write(a, ctx),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use yakut_node::file::FileInfo;

    use super::*;

    #[test]
    fn default_destinations_are_base_names() {
        assert_eq!(read_destination("a/b/image.bin", None), PathBuf::from("image.bin"));
        assert_eq!(read_destination("a/b/", None), PathBuf::from("b"));
        assert_eq!(read_destination("x", Some("/tmp/y")), PathBuf::from("/tmp/y"));
        assert_eq!(write_destination(Path::new("/tmp/fw.app.bin"), None), "fw.app.bin");
        assert_eq!(write_destination(Path::new("fw"), Some("dir/fw")), "dir/fw");
    }

    #[test]
    fn listing_is_rendered_per_node() {
        let info = FileInfo { size: 3, is_file_not_directory: true, ..FileInfo::default() };
        let per_node = BTreeMap::from([(
            NodeId::new(7),
            Some(vec![
                FileEntry { name: "a".to_owned(), info: None },
                FileEntry { name: "b".to_owned(), info: Some(info) },
            ]),
        )]);
        let single = render_listing(&per_node, true);
        assert_eq!(single[0], json!({"name": "a", "info": null}));
        assert_eq!(single[1]["info"]["size"], json!(3));
        assert_eq!(render_listing(&per_node, false)["7"][0]["name"], json!("a"));
    }

    #[test]
    fn missing_paths_are_warnings_except_for_touch() {
        assert_eq!(Modification::Touch("x").may_be_missing(), None);
        assert_eq!(Modification::Remove("x").may_be_missing(), Some("Path"));
        let mv = Modification::Move { source: "a", destination: "b", overwrite: false };
        assert_eq!(mv.may_be_missing(), Some("Source path"));
        assert_eq!(mv.subject(), "a");
        assert_eq!(mv.suffix(), "file_client_mv");
    }

    #[test]
    fn node_id_must_be_in_range() {
        assert_eq!(parse_single_node_id("42").expect("42"), NodeId::new(42));
        assert!(parse_single_node_id("70000").is_err());
        assert!(parse_single_node_id("x").is_err());
    }
}
