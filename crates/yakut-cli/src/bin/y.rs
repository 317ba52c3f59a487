//! # y
//!
//! Short alias of `yakut`.

fn main() -> std::process::ExitCode {
    yakut_cli::main()
}
