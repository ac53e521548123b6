//! Clap derive structures for the `openscada` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// openscada -- run and talk to an openSCADA subscription service
#[derive(Debug, Parser)]
#[command(
    name = "openscada",
    version,
    about = "Run an openSCADA DA/AE/HD service and talk to GMPP servers",
    long_about = "Serves data items, alarms & events and historical queries over GMPP,\n\
        federating upstream servers through proxy items.\n\n\
        The read, write and watch commands act as a GMPP client against --uri.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, short = 'c', env = "OPENSCADA_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// GMPP server to talk to, host:port
    #[arg(
        long,
        short = 'u',
        env = "OPENSCADA_URI",
        default_value = "127.0.0.1:1202",
        global = true
    )]
    pub uri: String,

    /// User the client session is opened for
    #[arg(long, env = "OPENSCADA_USER", global = true)]
    pub user: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "plain", global = true)]
    pub output: OutputFormat,

    /// Connect and request timeout in seconds
    #[arg(long, default_value = "10", global = true)]
    pub timeout: u64,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,
}

// ── Output Enums ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// `item = value`, one per line
    Plain,
    /// Pretty-printed JSON
    Json,
    /// One compact JSON document per line
    JsonCompact,
    /// YAML
    Yaml,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the service until interrupted
    Serve(ServeArgs),

    /// Inspect and create the configuration file
    Config(ConfigArgs),

    /// Read the current value of an item
    Read(ReadArgs),

    /// Write a value to an item
    Write(WriteArgs),

    /// Follow value changes of an item
    Watch(WatchArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Listen address, overrides [server] listen
    #[arg(long, short = 'l')]
    pub listen: Option<String>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the configuration file path
    Path,

    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short = 'f')]
        force: bool,
    },
}

#[derive(Debug, Args)]
pub struct ReadArgs {
    /// Item id
    pub item: String,
}

#[derive(Debug, Args)]
pub struct WriteArgs {
    /// Item id
    pub item: String,

    /// Value, parsed according to --type
    pub value: String,

    /// Value type: bool, int32, int64, float64 or string
    #[arg(long = "type", short = 't', default_value = "string")]
    pub value_type: String,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Item id
    pub item: String,

    /// Stop after this many values
    #[arg(long, short = 'n')]
    pub count: Option<usize>,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Target shell
    pub shell: clap_complete::Shell,
}
