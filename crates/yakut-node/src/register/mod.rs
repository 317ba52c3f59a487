//! Registers: the value model, the local registry and the remote access logic.

pub mod registry;
pub mod remote;
pub mod value;

pub use registry::{Register, Registry};
pub use value::RegisterValue;
