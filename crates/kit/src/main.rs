//! Container VM Kit (cvk) - prepare VMs for container monitoring
//!
//! cvk walks a VM managed by a XenServer-style control plane through
//! trust establishment (SSH key push or TLS client certificates),
//! verifies the container runtime answers under that trust, and hands
//! the VM off to the monitoring subsystem.

use clap::{Parser, Subcommand};
use color_eyre::{Report, Result};

mod certs;
mod command_run;
mod media;
mod monitor;
mod prepare;
mod prompt;
mod sshkey;
mod verify;
mod xapi;

/// A one-shot setup workflow for container hosts running as VMs.
///
/// cvk establishes trust between the control plane and a guest's
/// container runtime - either by pushing an SSH public key or by
/// installing TLS client certificates (supplied or freshly generated
/// and delivered via virtual CD) - then registers the VM with the
/// monitor once the runtime is confirmed reachable.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available cvk commands.
#[derive(Subcommand)]
enum Commands {
    /// Prepare a VM for container monitoring
    Prepare(prepare::PrepareOpts),
}

/// Install and configure the tracing/logging system.
///
/// Structured logging with environment-based filtering, error layer
/// integration, and compact console output on stderr. Filtered by the
/// RUST_LOG environment variable, defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

/// Main entry point for the cvk CLI application.
///
/// Initializes logging and error handling, then dispatches to the
/// requested command. Any abort, declined confirmation, or failure in
/// the workflow surfaces as an error here and yields exit status 1.
fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Prepare(opts) => prepare::run(opts)?,
    }
    tracing::debug!("exiting");
    Ok(())
}
