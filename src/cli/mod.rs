//! CLI module for runsched - command-line interface and subcommands.

pub mod commands;

pub use commands::Cli;
