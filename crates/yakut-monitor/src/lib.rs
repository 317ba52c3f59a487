//! # yakut-monitor
//!
//! Live view of a Cyphal network, like htop: a table of the nodes that are
//! or were online and a connectivity matrix of transfer rates per port and
//! node. Everything is learned by listening; a non-anonymous monitor also
//! asks new nodes for their info.
//!
//! Built with `ratatui` and `crossterm`.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod app;
pub mod error;
pub mod event;
pub mod model;
pub mod run;
pub mod stats;
pub mod ui;

pub use error::{MonitorError, Result};
pub use run::run;
