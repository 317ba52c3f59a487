//! State shared by all commands: lookup paths, output format, transport
//! selection and the settings of the local node.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Args;
use serde_json::Value;
use yakut_common::config::LookupPaths;
use yakut_common::constants::output_transfer_id_map_dir;
use yakut_common::env::registers_from_env;
use yakut_common::types::Priority;
use yakut_dsdl::Loader;
use yakut_node::{HeartbeatSettings, Node, NodeInfo, NodeSettings, Registry};
use yakut_transport::Transport;

use crate::output::{Format, Formatter, FormatterHints};
use crate::ui::Interrupted;

/// Options of the local node that commands create.
#[derive(Args, Debug, Clone, Default)]
pub struct NodeArgs {
    /// Vendor-specific status code of the heartbeat, 0..=255.
    #[arg(long, visible_alias = "vssc", env = "YAKUT_HEARTBEAT_VSSC")]
    pub heartbeat_vssc: Option<u8>,

    /// Heartbeat publication period in seconds, at most 1.
    #[arg(long, env = "YAKUT_HEARTBEAT_PERIOD")]
    pub heartbeat_period: Option<f64>,

    /// Heartbeat priority, by name or number.
    #[arg(long, env = "YAKUT_HEARTBEAT_PRIORITY")]
    pub heartbeat_priority: Option<Priority>,

    /// YAML mapping merged into the GetInfo response of the local node, e.g.
    /// '{software_version: {major: 1, minor: 2}, name: com.example.tool}'.
    #[arg(long, env = "YAKUT_NODE_INFO")]
    pub node_info: Option<String>,
}

impl NodeArgs {
    fn heartbeat(&self) -> anyhow::Result<HeartbeatSettings> {
        let mut hb = HeartbeatSettings::default();
        if let Some(vssc) = self.heartbeat_vssc {
            hb.vssc = vssc;
        }
        if let Some(period) = self.heartbeat_period {
            if !period.is_finite() || period <= 0.0 {
                anyhow::bail!("invalid heartbeat period: {period}");
            }
            hb.period = Duration::from_secs_f64(period);
        }
        if let Some(priority) = self.heartbeat_priority {
            hb.priority = priority;
        }
        hb.validate()?;
        Ok(hb)
    }

    fn info(&self, suffix: &str) -> anyhow::Result<NodeInfo> {
        let mut info = NodeInfo::for_command(suffix)?;
        if let Some(text) = self.node_info.as_deref().filter(|t| !t.trim().is_empty()) {
            let overrides = crate::yaml::load(text).context("invalid --node-info")?;
            let Value::Object(map) = overrides else {
                anyhow::bail!("--node-info must be a mapping, not {overrides}");
            };
            info.apply_overrides(&map)?;
        }
        Ok(info)
    }
}

/// Everything the global options configure.
#[derive(Debug, Clone)]
pub struct Context {
    /// Directories searched for compiled namespaces and orc-files.
    pub lookup: LookupPaths,
    /// Selected output format.
    pub format: Format,
    /// Transport expression; registers are used when absent.
    pub transport: Option<String>,
    /// Local node options.
    pub node: NodeArgs,
}

impl Context {
    /// The data type loader over the lookup paths.
    #[must_use]
    pub fn loader(&self) -> Loader {
        Loader::new(self.lookup.as_slice())
    }

    /// A fresh formatter for the selected format.
    #[must_use]
    pub fn formatter(&self, hints: FormatterHints) -> Formatter {
        Formatter::new(self.format, hints)
    }

    /// Register values given through the environment, by register name.
    #[must_use]
    pub fn registers() -> BTreeMap<String, String> {
        registers_from_env(std::env::vars()).into_iter().collect()
    }

    /// Constructs the transport from `--transport` or the registers.
    ///
    /// # Errors
    ///
    /// Fails if the transport is misconfigured or unsupported.
    pub fn make_transport(&self) -> anyhow::Result<Arc<dyn Transport>> {
        let transport = yakut_transport::config::construct(self.transport.as_deref(), &Self::registers())
            .context("cannot construct the transport (see --transport and the UAVCAN__* variables)")?;
        tracing::info!(transport = %transport.describe(), "transport ready");
        Ok(transport)
    }

    /// Constructs the local node for the command named `suffix`. Must be
    /// called within the runtime.
    ///
    /// # Errors
    ///
    /// Fails on invalid node options, a broken transport, or an anonymous
    /// transport when the command needs a node-ID.
    pub fn make_node(&self, suffix: &str, allow_anonymous: bool) -> anyhow::Result<Arc<Node>> {
        let transport = self.make_transport()?;
        let registry = Registry::for_node(transport.local_node_id(), std::env::vars());
        let settings = NodeSettings {
            info: self.node.info(suffix)?,
            heartbeat: self.node.heartbeat()?,
            allow_anonymous,
            transfer_id_map_dir: Some(output_transfer_id_map_dir()),
        };
        let node = Node::new(transport, registry, settings)?;
        tracing::debug!(node_id = ?node.id(), name = %node.info().name, "local node started");
        Ok(Arc::new(node))
    }

    /// Lookup paths as owned path buffers.
    #[must_use]
    pub fn lookup_dirs(&self) -> Vec<PathBuf> {
        self.lookup.as_slice().to_vec()
    }
}

/// Runs `fut` to completion on a new multi-threaded runtime, or until the
/// user presses Ctrl+C, which yields [`Interrupted`].
///
/// # Errors
///
/// Whatever `fut` returns, or the runtime construction failure.
pub fn run_async<F, T>(fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot start the async runtime")?;
    runtime.block_on(async {
        tokio::select! {
            res = fut => res,
            _ = tokio::signal::ctrl_c() => Err(Interrupted.into()),
        }
    })
}

/// Parses a duration in seconds given on the command line.
///
/// # Errors
///
/// Fails unless the value is a positive finite number.
pub fn parse_timeout(text: &str) -> Result<f64, String> {
    let x: f64 = text.trim().parse().map_err(|e| format!("{e}"))?;
    if x.is_finite() && x > 0.0 {
        Ok(x)
    } else {
        Err(format!("must be a positive number of seconds, got {text:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_options_are_validated() {
        let args = NodeArgs {
            heartbeat_period: Some(0.5),
            heartbeat_vssc: Some(7),
            ..NodeArgs::default()
        };
        let hb = args.heartbeat().expect("valid");
        assert_eq!(hb.period, Duration::from_millis(500));
        assert_eq!(hb.vssc, 7);

        let args = NodeArgs {
            heartbeat_period: Some(2.0),
            ..NodeArgs::default()
        };
        assert!(args.heartbeat().is_err());
    }

    #[test]
    fn node_info_overrides_are_merged() {
        let args = NodeArgs {
            node_info: Some("{software_version: {major: 3, minor: 4}}".into()),
            ..NodeArgs::default()
        };
        let info = args.info("sub").expect("info");
        assert_eq!(info.name, "org.opencyphal.yakut.sub");
        assert_eq!((info.software_version.major, info.software_version.minor), (3, 4));

        let bad = NodeArgs {
            node_info: Some("[1, 2]".into()),
            ..NodeArgs::default()
        };
        assert!(bad.info("sub").is_err());
    }

    #[test]
    fn timeouts_must_be_positive() {
        assert_eq!(parse_timeout("1.5"), Ok(1.5));
        assert!(parse_timeout("0").is_err());
        assert!(parse_timeout("inf").is_err());
        assert!(parse_timeout("x").is_err());
    }
}
