//! CLI subcommand implementations.

pub mod init;
pub mod reference;
pub mod replay;
pub mod status;
