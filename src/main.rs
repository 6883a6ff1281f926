//! `cynapse` binary
//!
//! Installs diagnostics, parses the command line and maps failures to exit codes.

use clap::Parser;
use cynapse::audit_verifier::VerifyError;
use cynapse::cli::{dispatch, Cli};
use cynapse::errors::{exit_code, CynapseError};
use std::process::exit;
use tracing_subscriber::EnvFilter;

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<CynapseError>() {
        return e.exit_code();
    }
    if err.downcast_ref::<VerifyError>().is_some() {
        return exit_code::VERIFICATION_FAILURE;
    }
    exit_code::FAILURE
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = dispatch(cli).await {
        eprintln!("Error: {err:#}");
        exit(exit_code_for(&err));
    }
}
