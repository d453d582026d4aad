//! # CLI Interface
//!
//! Defines the command-line argument structure for `keytrust-node` using
//! `clap` derive. Two subcommands: `demo` and `version`.

use clap::{Parser, Subcommand, ValueEnum};

/// keytrust device verification node.
///
/// Runs SAS verification between devices. The `demo` subcommand wires two
/// in-process devices together and walks them through a full handshake.
#[derive(Parser, Debug)]
#[command(
    name = "keytrust-node",
    about = "keytrust device verification node",
    version,
    propagate_version = true
)]
pub struct KeytrustCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the keytrust node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Verify two in-process devices against each other.
    Demo(DemoArgs),
    /// Print version information and exit.
    Version,
}

/// SAS display methods offered by the demo devices.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodChoice {
    /// Three four-digit numbers only.
    Decimal,
    /// Seven emoji, with decimal as fallback.
    Emoji,
}

/// How the demo handshake is opened.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowChoice {
    /// Send a Start right away.
    Start,
    /// Send a Request first and let the peer send the Start.
    Request,
}

/// Log line format on stderr.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact human-readable lines.
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Arguments for the `demo` subcommand.
#[derive(Parser, Debug)]
pub struct DemoArgs {
    /// Idle timeout of each verification, in seconds.
    #[arg(long, env = "KEYTRUST_TIMEOUT_SECS", default_value_t = 600)]
    pub timeout_secs: u64,

    /// SAS methods the devices offer.
    #[arg(long, value_enum, env = "KEYTRUST_METHOD", default_value_t = MethodChoice::Emoji)]
    pub method: MethodChoice,

    /// Whether to open with a Start or a Request.
    #[arg(long, value_enum, default_value_t = FlowChoice::Start)]
    pub flow: FlowChoice,

    /// Have the second device report that the codes differ.
    #[arg(long, conflicts_with = "interactive")]
    pub mismatch: bool,

    /// Ask on stdin whether the codes match instead of answering "yes".
    #[arg(long)]
    pub interactive: bool,

    /// Log output format.
    #[arg(long, value_enum, env = "KEYTRUST_LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}
