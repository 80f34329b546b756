//! `nexd`: the overlay mesh node agent binary (spec §6).

use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::Parser as _;

mod cli;
mod supervisor;

use cli::{Cli, Command};

fn main() -> ExitCode {
    let cli = Cli::parse();

    if matches!(cli.command, Some(Command::Version)) {
        println!("nexd {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    #[cfg(target_os = "linux")]
    if !has_necessary_permissions() {
        eprintln!("nexd needs to be executed as `root` or with the `CAP_NET_ADMIN`/`CAP_NET_RAW` capabilities.");
        return ExitCode::FAILURE;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    match runtime.block_on(try_main(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main(cli: Cli) -> Result<()> {
    let handle = nexd_logging::setup_global_subscriber("info").context("failed to set up logging")?;
    let level = nexd_logging::LevelControl::new(handle);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting nexd");
    supervisor::run(cli, level).await
}

#[cfg(target_os = "linux")]
fn has_necessary_permissions() -> bool {
    let is_root = nix::unistd::Uid::current().is_root();
    let has_net_admin = caps::has_cap(None, caps::CapSet::Effective, caps::Capability::CAP_NET_ADMIN).is_ok_and(|b| b);
    is_root || has_net_admin
}
