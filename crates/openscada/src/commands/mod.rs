//! Command handlers, one module per command family.

pub mod client;
pub mod config_cmd;
pub mod serve;
