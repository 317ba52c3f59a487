//! # yakut-common
//!
//! Shared types, error definitions, configuration helpers and constants
//! used across the entire Yakut workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and provides the primitives (node-IDs, port-IDs, priorities,
//! integer sets, register naming rules) that every other crate builds upon.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod env;
pub mod error;
pub mod int_set;
pub mod types;
