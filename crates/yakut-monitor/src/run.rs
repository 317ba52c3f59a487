//! The monitor main loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use yakut_common::types::Priority;
use yakut_node::{Node, types};
use yakut_transport::Timestamp;

use crate::app::App;
use crate::error::Result;
use crate::event::{TerminalEvent, spawn_reader};
use crate::model::Schemas;
use crate::stats::PERIOD;
use crate::ui;

/// How long a GetInfo request waits for the response.
const INFO_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Restores the terminal however the loop ends.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        ratatui::restore();
    }
}

fn request_info(node: &Node, targets: Vec<yakut_common::types::NodeId>) {
    if node.id().is_none() || targets.is_empty() {
        return;
    }
    let get_info = match types::GET_INFO.load() {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(error = %e, "cannot load GetInfo");
            return;
        }
    };
    for target in targets {
        tracing::info!(node_id = %target, "requesting node info");
        match node.make_client(&get_info, target, None) {
            Ok(mut client) => {
                client.priority = Priority::Optional;
                client.timeout = INFO_REQUEST_TIMEOUT;
                // The response is picked up from the traffic.
                let _task = tokio::spawn(async move {
                    if let Err(e) = client.call(&serde_json::json!({})).await {
                        tracing::debug!(error = %e, "GetInfo failed");
                    }
                });
            }
            Err(e) => tracing::warn!(node_id = %target, error = %e, "cannot query node info"),
        }
    }
}

/// Runs the monitor on `node` until the user quits or the transport closes.
///
/// # Errors
///
/// Fails if the standard types are missing or the terminal cannot be drawn.
pub async fn run(node: Arc<Node>) -> Result<()> {
    let mut app = App::new(Schemas::load()?, node.id(), node.info().clone());
    let mut traffic = node.transport().listen();
    // Subscriptions tell the network which data the monitor is interested in.
    let _heartbeats = node.make_subscriber(&types::HEARTBEAT.load()?, None)?;
    let _port_lists = node.make_subscriber(&types::PORT_LIST.load()?, None)?;

    let (tx, mut events) = mpsc::unbounded_channel();
    let stop = Arc::new(AtomicBool::new(false));
    let reader = spawn_reader(tx, Arc::clone(&stop));

    let mut terminal = ratatui::init();
    let guard = TerminalGuard;
    let mut ticker = tokio::time::interval(PERIOD);
    let mut lost = 0_u64;
    tracing::debug!("monitor main loop started");
    let result = loop {
        tokio::select! {
            received = traffic.recv() => match received {
                Ok(transfer) => app.on_transfer(&transfer),
                Err(RecvError::Lagged(n)) => lost += n,
                Err(RecvError::Closed) => break Ok(()),
            },
            _ = ticker.tick() => {
                app.transport_errors = node.transport().error_count() + lost;
                app.tick(Timestamp::now().monotonic);
                request_info(&node, app.take_info_requests());
                if let Err(e) = terminal.draw(|f| ui::render(f, &app)) {
                    break Err(e.into());
                }
            },
            Some(event) = events.recv() => {
                if event.is_quit() {
                    app.quit();
                } else if let TerminalEvent::Resize(..) = event {
                    if let Err(e) = terminal.draw(|f| ui::render(f, &app)) {
                        break Err(e.into());
                    }
                }
            },
        }
        if !app.running {
            break Ok(());
        }
    };
    stop.store(true, Ordering::Relaxed);
    drop(guard);
    if reader.join().is_err() {
        tracing::warn!("terminal reader thread panicked");
    }
    result
}
