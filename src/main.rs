//! Read objects of a bucket through a local, size-bounded file cache.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;

mod app_config;
mod session;
mod trc;

use crate::app_config::Config;
use crate::session::Action;
use crate::trc::Trc;

#[derive(Parser)]
#[command(version, about = "Bucket objects through a local file cache.")]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a bucketfs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[arg(long, help = "Plain log output without spinners.")]
    plain: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a whole object into the cache.
    Fetch {
        /// Object name within the bucket.
        object: String,
    },

    /// Write a byte range of an object to stdout, going through the cache.
    Cat {
        /// Object name within the bucket.
        object: String,

        #[arg(long, default_value_t = 0, help = "First byte to read.")]
        offset: u64,

        #[arg(long, help = "Number of bytes to read. Defaults to the rest of the object.")]
        len: Option<u64>,
    },

    /// List a directory of the bucket.
    Ls {
        /// Directory to list; the bucket root by default.
        #[arg(default_value = "")]
        dir: String,
    },

    /// Show what the file cache holds.
    Status,
}

impl From<Command> for Action {
    fn from(command: Command) -> Self {
        match command {
            Command::Fetch { object } => Self::Fetch { object },
            Command::Cat {
                object,
                offset,
                len,
            } => Self::Cat {
                object,
                offset,
                len,
            },
            Command::Ls { dir } => Self::Ls { dir },
            Command::Status => Self::Status,
        }
    }
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load_or_create(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    Trc::default()
        .plain(args.plain)
        .init()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to initialize logging. Without logging, we can't provide any useful error \
                 messages, so we have to exit: {e}"
            );
            std::process::exit(1);
        });

    if let Err(e) = session::spawn(config, args.command.into()) {
        error!("{e}");
        std::process::exit(1);
    }
}
