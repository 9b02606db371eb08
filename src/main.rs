// src/main.rs

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::process::ExitCode;

fn run(cli: Cli) -> Result<i32> {
    let host = &cli.host;
    match cli.command {
        Commands::Activate { ids } => commands::cmd_activate(host, &ids)?,
        Commands::Swap { package_id } => commands::cmd_swap(host, &package_id)?,
        Commands::Active => commands::cmd_active(host)?,
        Commands::Fetch { repository_url, ids } => commands::cmd_fetch(host, &repository_url, &ids)?,
        Commands::Add { package_tarball } => commands::cmd_add(host, &package_tarball)?,
        Commands::List => commands::cmd_list(host)?,
        Commands::Remove { ids } => commands::cmd_remove(host, &ids)?,
        Commands::Setup => commands::cmd_setup(host)?,
        Commands::Uninstall => commands::cmd_uninstall(host)?,
        Commands::Check { list } => return commands::cmd_check(host, list),
        Commands::Build {
            repository_url,
            dont_clean_after_build,
            recursive,
        } => commands::cmd_build(repository_url.as_deref(), dont_clean_after_build, recursive)?,
        Commands::Tree {
            mkbootstrap,
            repository_url,
            variant,
        } => commands::cmd_tree(mkbootstrap, repository_url.as_deref(), variant.as_deref())?,
    }
    Ok(0)
}

fn main() -> ExitCode {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Files written by activation must be world readable
    nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(0o022));

    let cli = Cli::parse();
    match run(cli) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
