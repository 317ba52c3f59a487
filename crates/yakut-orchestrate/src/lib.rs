//! # yakut-orchestrate
//!
//! Runs compositions of processes described in YAML orc-files. A composition
//! sets environment variables and registers for its children and runs its
//! scripts with the semantics of a POSIX shell, except that statements are
//! launched concurrently until a join. Execution is driven by exit codes; an
//! external gate lets the caller request a graceful stop.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod child;
pub mod executor;
pub mod schema;

pub use executor::{
    Context, EXIT_CANNOT_EXECUTE, EXIT_FILE_ERROR, EXIT_SCHEMA_ERROR, Gate, Stack, exec_composition, exec_file,
};
pub use schema::{Composition, Env, SchemaError, Statement, load_ast, load_composition};
