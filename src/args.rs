use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "tripwire")]
#[command(
    version = const_format::formatcp!("{}", env!("CARGO_PKG_VERSION")),
    about = "Tripwire: idempotent reactive triggers without feedback loops",
    disable_version_flag = true,
    disable_help_subcommand = true
)]
pub(crate) struct Args {
    #[command(subcommand)]
    pub(crate) command: Subcommand,

    /// Print version
    #[arg(short, long, action = clap::ArgAction::Version)]
    version: Option<bool>,
}

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Subcommand {
    #[command(subcommand)]
    Server(Server),
    #[command(subcommand)]
    Monitor(Monitor),
    #[command(subcommand)]
    Ledger(Ledger),
}

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Server {
    /// Start the dispatcher, the background tasks and the HTTP API.
    Run {
        /// Delete the sqlite database file before starting
        #[arg(long)]
        clean_sqlite_file: bool,
        /// Path to the TOML configuration
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Write the default configuration file
    GenerateConfig {
        /// Destination, defaults to `tripwire.toml` in the current directory.
        path: Option<PathBuf>,
        /// Replace the destination if it exists
        #[arg(long)]
        overwrite: bool,
    },
    /// Read the configuration, validate the handler declarations and exit
    Verify {
        /// Path to the TOML configuration
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Monitor {
    /// Run one invocation count sweep and print the raised alerts as JSON.
    Sweep {
        /// Path to the TOML configuration
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Ledger {
    /// Delete ledger entries older than the configured retention horizon.
    Purge {
        /// Path to the TOML configuration
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn server_run_flags() {
        let args =
            Args::try_parse_from(["tripwire", "server", "run", "-c", "x.toml", "--clean-sqlite-file"])
                .unwrap();
        assert_matches!(
            args.command,
            Subcommand::Server(Server::Run { clean_sqlite_file: true, config: Some(config) })
                if config == PathBuf::from("x.toml")
        );
    }
}
