//! # yakut
//!
//! Command-line tool for diagnostics and debugging of Cyphal networks.

fn main() -> std::process::ExitCode {
    yakut_cli::main()
}
