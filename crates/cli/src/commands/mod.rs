//! CLI subcommands

pub mod status;
pub mod targets;
