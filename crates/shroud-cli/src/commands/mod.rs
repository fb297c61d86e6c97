//! Subcommands of the `shroud` binary.

pub mod check;
pub mod explain;
pub mod introspect;
pub mod serve;
