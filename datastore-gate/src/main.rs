//! Datastore gate operator tool.
//!
//! Runs the datastore startup safety gates outside the service, looks up the
//! `datastore_active` flag for a resource, and lists the alias view.
//!
//! # Security Guarantees
//! - The read-only credential is probed with writes that are always rolled back
//! - Connection strings are redacted in logs
//! - Any unverifiable boundary exits with an error

use clap::Parser;
use datastore_gate::{Cli, run};
use datastore_gate_core::{Result, init_logging};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.global.verbose, cli.global.quiet, cli.global.log_json)?;

    let output = run(&cli).await?;
    println!("{}", output);

    Ok(())
}
