#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::doc_markdown)]

mod commands;
mod logging;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;
use urja_core::Mode;

/// Default config file, relative to the working directory.
const DEFAULT_CONFIG: &str = "urja.config.json";

#[derive(Parser, Debug)]
#[command(name = "urja")]
#[command(author, version, about = "Front-end build pipeline, dev server and module federation", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines on stderr and command results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the production pipeline
    Build {
        /// Config file (JSON)
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Override the configured mode (development, production, test)
        #[arg(long)]
        mode: Option<Mode>,
    },

    /// Start the development server
    Dev {
        /// Config file (JSON)
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Do not watch files for HMR
        #[arg(long)]
        no_watch: bool,
    },

    /// Scan entries for bare imports and pre-bundle them
    Deps {
        /// Entry files
        #[arg(required = true)]
        entries: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    logging::init(cli.verbose, cli.json);

    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;

    match cli.command {
        Commands::Build { config, mode } => {
            let span = tracing::info_span!("build", cwd = %cwd.display());
            let _guard = span.enter();
            runtime.block_on(commands::build::run(commands::build::BuildAction {
                config: cwd.join(config),
                mode,
                json: cli.json,
            }))
        }
        Commands::Dev {
            config,
            port,
            host,
            no_watch,
        } => runtime.block_on(commands::dev::run(commands::dev::DevAction {
            config: cwd.join(config),
            port,
            host,
            watch: !no_watch,
        })),
        Commands::Deps { entries } => runtime.block_on(commands::deps::run(commands::deps::DepsAction {
            cwd: cwd.clone(),
            entries: entries.into_iter().map(|e| cwd.join(e)).collect(),
            json: cli.json,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_defaults_config_file() {
        let cli = Cli::try_parse_from(["urja", "build"]).unwrap();
        match cli.command {
            Commands::Build { config, mode } => {
                assert_eq!(config, PathBuf::from(DEFAULT_CONFIG));
                assert!(mode.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_build_parses_mode() {
        let cli = Cli::try_parse_from(["urja", "build", "--mode", "production"]).unwrap();
        assert!(matches!(cli.command, Commands::Build { mode: Some(Mode::Production), .. }));
        assert!(Cli::try_parse_from(["urja", "build", "--mode", "prod"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["urja", "dev", "-vv", "--json", "--port", "3001"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Dev { port: Some(3001), .. }));
    }

    #[test]
    fn test_deps_requires_entries() {
        assert!(Cli::try_parse_from(["urja", "deps"]).is_err());
        let cli = Cli::try_parse_from(["urja", "deps", "src/main.js"]).unwrap();
        assert!(matches!(cli.command, Commands::Deps { ref entries } if entries.len() == 1));
    }
}
