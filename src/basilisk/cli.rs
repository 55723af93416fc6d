//! Command-line surface of the launcher.
//!
//! The single-instance guard and IPC forwarding are host concerns; this
//! module only defines the argument grammar they and the headless launcher
//! share.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Log verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        };
        write!(f, "{}", name)
    }
}

impl LogLevel {
    /// Map onto the `log` crate's filter levels (`CRITICAL` folds into
    /// `Error`, which is the highest severity the facade distinguishes).
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Error | LogLevel::Critical => log::LevelFilter::Error,
        }
    }
}

/// `basilisk [options] [conversation.bskc]`
#[derive(Debug, Parser)]
#[command(name = "basilisk", about = "Multi-provider LLM conversation engine")]
pub struct Cli {
    /// UI language tag (e.g. `fr-FR`); forwarded to the localisation layer.
    #[arg(long)]
    pub language: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Skip discovering accounts from environment variables.
    #[arg(long)]
    pub no_env_account: bool,

    /// Start minimised.
    #[arg(long)]
    pub minimize: bool,

    /// Show an "already running" notice when another instance holds the lock.
    #[arg(short = 'n')]
    pub notify_running: bool,

    /// Conversation archive to open on launch.
    pub path: Option<PathBuf>,
}
