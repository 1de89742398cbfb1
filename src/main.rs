mod args;
mod command;
mod config;
#[cfg(feature = "tokio-console")]
mod env_vars;
mod init;
mod server;

use args::{Args, Ledger, Monitor, Server, Subcommand};
use clap::Parser;
use config::config_holder::ConfigHolder;
use directories::{BaseDirs, ProjectDirs};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "tripwire", "tripwire")
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    match Args::parse().command {
        Subcommand::Server(Server::Run {
            clean_sqlite_file,
            config,
        }) => {
            Box::pin(command::server::run(
                project_dirs(),
                BaseDirs::new(),
                config,
                clean_sqlite_file,
            ))
            .await
        }
        Subcommand::Server(Server::Verify { config }) => {
            command::server::verify(project_dirs(), BaseDirs::new(), config).await
        }
        Subcommand::Server(Server::GenerateConfig { path, overwrite }) => {
            ConfigHolder::generate_default_config(path, overwrite).await
        }
        Subcommand::Monitor(Monitor::Sweep { config }) => {
            command::monitor::sweep(project_dirs(), BaseDirs::new(), config).await
        }
        Subcommand::Ledger(Ledger::Purge { config }) => {
            command::ledger::purge(project_dirs(), BaseDirs::new(), config).await
        }
    }
}
