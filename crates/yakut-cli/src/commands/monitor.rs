//! `yakut monitor` — Live view of the nodes and traffic on the network.

use std::path::PathBuf;

use clap::Args;

use crate::context::{Context, run_async};

/// Arguments for the `monitor` command.
#[derive(Args, Debug)]
#[command(after_help = "\
The monitor listens to all traffic. When the local node has a node-ID, it also asks newly seen
nodes for their info; an anonymous monitor stays passive. Press q or Esc to quit.")]
pub struct MonitorArgs {
    /// Run a plug-and-play node-ID allocator with the given allocation table.
    #[arg(long, short = 'P', value_name = "FILE")]
    pub plug_and_play: Option<PathBuf>,
}

/// Executes the `monitor` command.
///
/// # Errors
///
/// Returns an error if the node cannot be started or the terminal fails.
pub fn execute(args: MonitorArgs, ctx: &Context) -> anyhow::Result<()> {
    if let Some(table) = &args.plug_and_play {
        anyhow::bail!(
            "Plug-and-play node-ID allocation is not supported (allocation table {})",
            table.display()
        );
    }
    run_async(async {
        let node = ctx.make_node("monitor", true)?;
        if node.id().is_none() {
            tracing::info!("the local node is anonymous, node info will not be requested");
        }
        let result = yakut_monitor::run(std::sync::Arc::clone(&node)).await;
        node.close().await;
        result.map_err(|e| anyhow::anyhow!("{e}"))
    })
}
