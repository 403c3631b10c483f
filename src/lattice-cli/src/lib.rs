//! Lattice CLI library: argument definitions, logging setup and the
//! subcommand handlers behind the `lattice` binary.

pub mod cli;
pub mod commands;
pub mod logging;

pub use cli::{Cli, Commands};
pub use commands::dispatch;
