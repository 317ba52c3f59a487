//! `yakut file-server` — Serve local directories over the standard file
//! services and optionally push software updates to the nodes.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context as _;
use clap::{ArgAction, Args};
use serde_json::{Value, json};
use yakut_common::int_set::parse_int_set;
use yakut_common::types::{NodeId, Priority};
use yakut_node::tracker::{Entry, HEALTH_WARNING, MODE_SOFTWARE_UPDATE, NodeTracker};
use yakut_node::{Node, NodeInfo, types};

use crate::app_descriptor::AppDescriptor;
use crate::context::{Context, run_async};

const COMMAND_BEGIN_SOFTWARE_UPDATE: u16 = 65533;
const UPDATE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Arguments for the `file-server` command.
#[derive(Args, Debug)]
#[command(after_help = "\
Several roots appear to the network as one directory; the first root wins on conflicting entries.
The current directory is served when no root is given.

With --update-software, every node that comes online (or restarts) is asked for its info and, if a
package named NAME[-HW_MAJOR[.HW_MINOR]]-SW_MAJOR.SW_MINOR[.VCS[.CRC]].app* in a root is newer or
different, the node is commanded to update from it. Without a value all nodes are checked; nodes
given explicitly are commanded even when already in the software update mode.

Examples:
    yakut file-server --update-software
    yakut fsrv --update-software=10,11 /srv/firmware")]
pub struct FileServerArgs {
    /// Directories to serve.
    #[arg(value_name = "PATH")]
    pub roots: Vec<PathBuf>,

    /// Run a plug-and-play node-ID allocator with this allocation table.
    #[arg(long, short = 'P', value_name = "FILE")]
    pub plug_and_play: Option<PathBuf>,

    /// Keep the software of the nodes up to date; optionally only of these node-IDs.
    #[arg(
        long,
        short = 'u',
        value_name = "NODE_IDS",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "",
        action = ArgAction::Append
    )]
    pub update_software: Vec<String>,
}

/// Which nodes the software updater looks after.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct UpdatePolicy {
    all: bool,
    explicit: BTreeSet<NodeId>,
}

impl UpdatePolicy {
    fn parse(values: &[String]) -> anyhow::Result<Self> {
        let mut policy = Self::default();
        for v in values {
            if v.trim().is_empty() {
                policy.all = true;
                continue;
            }
            let set = parse_int_set(v).map_err(|e| anyhow::anyhow!("--update-software: {e}"))?;
            for x in set.to_vec() {
                let nid = NodeId::try_from_i64(x).map_err(|e| anyhow::anyhow!("--update-software: {e}"))?;
                let _ = policy.explicit.insert(nid);
            }
        }
        Ok(policy)
    }

    fn enabled(&self) -> bool {
        self.all || !self.explicit.is_empty()
    }
}

fn validate_roots(roots: Vec<PathBuf>) -> anyhow::Result<Vec<PathBuf>> {
    let roots = if roots.is_empty() {
        vec![std::env::current_dir().context("cannot determine the current directory")?]
    } else {
        roots
    };
    roots
        .into_iter()
        .map(|r| {
            let resolved = r
                .canonicalize()
                .with_context(|| format!("root directory {} does not exist", r.display()))?;
            if !resolved.is_dir() {
                anyhow::bail!("{} is not a directory", r.display());
            }
            Ok(resolved)
        })
        .collect()
}

/// The remote-visible path of the package the node should update to, if any.
///
/// No update is offered when any local package is equivalent to the running
/// application, so that several versions may coexist on one network.
fn locate_package(roots: &[PathBuf], info: &NodeInfo) -> Option<String> {
    let app = AppDescriptor::from_node_info(info);
    let mut result = None;
    for root in roots {
        for name in package_names(root, &app) {
            let Some(candidate) = AppDescriptor::from_file_name(&name) else {
                continue;
            };
            if app.is_equivalent(&candidate) {
                return None;
            }
            if app.should_update_to(&candidate) {
                result = Some(name);
            }
        }
    }
    result
}

fn package_names(root: &Path, app: &AppDescriptor) -> Vec<String> {
    let Ok(dir) = std::fs::read_dir(root) else {
        tracing::warn!(root = %root.display(), "cannot list the root directory");
        return Vec::new();
    };
    let mut names: Vec<String> = dir
        .filter_map(Result::ok)
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| app.prefilter(n))
        .collect();
    names.sort();
    names
}

struct Updater {
    node: Arc<Node>,
    roots: Vec<PathBuf>,
    all: bool,
    explicit: Mutex<BTreeSet<NodeId>>,
}

impl Updater {
    fn is_explicit(&self, nid: NodeId) -> bool {
        self.explicit.lock().unwrap_or_else(PoisonError::into_inner).contains(&nid)
    }

    fn check(self: &Arc<Self>, nid: NodeId, entry: Option<&Entry>) {
        let Some(entry) = entry else { return };
        let Some(info) = &entry.info else {
            tracing::debug!(node_id = %nid, "info not available yet, cannot check the software version");
            return;
        };
        let explicit = self.is_explicit(nid);
        if !explicit && !self.all {
            tracing::warn!(node_id = %nid, "ignored: not selected for the software update");
            return;
        }
        let hb = entry.heartbeat;
        // A node reporting WARNING in the update mode may be missing its application.
        if hb.mode == MODE_SOFTWARE_UPDATE && hb.health < HEALTH_WARNING && !explicit {
            tracing::warn!(node_id = %nid, ?hb, "already in the software update mode with acceptable health");
            return;
        }
        tracing::info!(node_id = %nid, "checking whether a software update is required");
        let Some(path) = locate_package(&self.roots, info) else {
            tracing::warn!(node_id = %nid, "no software update required");
            return;
        };
        let this = Arc::clone(self);
        let _ = tokio::spawn(async move { this.request_update(nid, path).await });
    }

    async fn request_update(&self, nid: NodeId, path: String) {
        let request = json!({"command": COMMAND_BEGIN_SOFTWARE_UPDATE, "parameter": path});
        tracing::warn!(node_id = %nid, %request, "requesting a software update");
        let result = async {
            let mut client = self.node.make_client(&types::EXECUTE_COMMAND.load()?, nid, None)?;
            client.priority = Priority::Slow;
            client.timeout = UPDATE_REQUEST_TIMEOUT;
            client.call(&request).await
        }
        .await;
        match result {
            Err(e) => tracing::error!(node_id = %nid, "cannot send the software update command: {e}"),
            Ok(None) => tracing::error!(
                node_id = %nid,
                "no response to the software update command in {:.1} s",
                UPDATE_REQUEST_TIMEOUT.as_secs_f64()
            ),
            Ok(Some((response, _))) => {
                let status = response.get("status").and_then(Value::as_i64).unwrap_or(-1);
                if status == 0 {
                    tracing::info!(node_id = %nid, "software update command confirmed");
                    let _ = self.explicit.lock().unwrap_or_else(PoisonError::into_inner).remove(&nid);
                } else {
                    tracing::error!(node_id = %nid, status, "software update command rejected");
                }
            }
        }
    }
}

/// Executes the `file-server` command. Runs until interrupted.
///
/// # Errors
///
/// Returns an error on invalid roots or if the node cannot be started.
pub fn execute(args: FileServerArgs, ctx: &Context) -> anyhow::Result<()> {
    if let Some(table) = &args.plug_and_play {
        anyhow::bail!(
            "Plug-and-play node-ID allocation is not supported (allocation table {})",
            table.display()
        );
    }
    let roots = validate_roots(args.roots)?;
    let policy = UpdatePolicy::parse(&args.update_software)?;
    tracing::info!(?roots, ?policy, "file-server");
    run_async(async {
        let node = ctx.make_node("file_server", false)?;
        let server = yakut_node::file::FileServer::new(&node, roots)?;
        let _tracker = if policy.enabled() {
            let tracker = NodeTracker::new(Arc::clone(&node))?;
            let updater = Arc::new(Updater {
                node: Arc::clone(&node),
                roots: server.roots().to_vec(),
                all: policy.all,
                explicit: Mutex::new(policy.explicit),
            });
            tracker.add_update_handler(Arc::new(move |nid, _, entry| updater.check(nid, entry)));
            Some(tracker)
        } else {
            tracing::info!("software update checker not required");
            None
        };
        std::future::pending::<anyhow::Result<()>>().await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use yakut_node::info::Version;

    #[test]
    fn update_policy() {
        assert!(!UpdatePolicy::parse(&[]).expect("none").enabled());
        let all = UpdatePolicy::parse(&[String::new()]).expect("all");
        assert!(all.all && all.explicit.is_empty());
        let some = UpdatePolicy::parse(&["3-5".to_owned(), "9".to_owned()]).expect("some");
        assert!(!some.all);
        assert_eq!(some.explicit.iter().map(|n| n.get()).collect::<Vec<_>>(), vec![3, 4, 9]);
        assert!(UpdatePolicy::parse(&["x".to_owned()]).is_err());
    }

    fn info(name: &str, major: u8, minor: u8) -> NodeInfo {
        NodeInfo {
            name: name.to_owned(),
            software_version: Version { major, minor },
            ..NodeInfo::default()
        }
    }

    #[test]
    fn newer_package_is_located() {
        let tmp = tempfile::tempdir().expect("tempdir");
        for name in ["com.example.app-1.2.app.bin", "com.example.app-1.5.app.bin", "other-9.9.app"] {
            std::fs::write(tmp.path().join(name), b"").expect("write");
        }
        let roots = vec![tmp.path().to_path_buf()];
        assert_eq!(
            locate_package(&roots, &info("com.example.app", 1, 0)).as_deref(),
            Some("com.example.app-1.5.app.bin")
        );
        // An equivalent package suppresses the update.
        assert_eq!(locate_package(&roots, &info("com.example.app", 1, 2)), None);
        assert_eq!(locate_package(&roots, &info("com.example.app", 2, 0)), None);
        assert_eq!(locate_package(&roots, &info("unknown", 1, 0)), None);
    }

    #[test]
    fn default_root_is_cwd() {
        let roots = validate_roots(Vec::new()).expect("cwd");
        assert_eq!(roots.len(), 1);
        assert!(validate_roots(vec![PathBuf::from("/definitely/not/here")]).is_err());
    }
}
