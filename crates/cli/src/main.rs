//! bundlecdn CLI
//!
//! Publishes concatenated CSS/JS bundles from a directory-backed blob store
//! and prints the versioned URL clients should load. `watch` keeps the
//! bundle fresh by republishing whenever a source file changes.

// CLI binary needs to output to stdout/stderr
#![allow(clippy::print_stdout, clippy::print_stderr)]

mod cli;
mod commands;
mod tracing;

use crate::cli::{EXIT_CLI, EXIT_OK, exit_code_for, render_error};
use crate::tracing::{TracingConfig, TracingFormat};

#[tokio::main]
async fn main() {
    // Tracing may be unusable during a panic
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with RUST_LOG=debug for more information.");
    }));

    let cli = cli::parse();

    let tracing_config = TracingConfig {
        format: if cli.json {
            TracingFormat::Json
        } else {
            TracingFormat::Compact
        },
        level: cli.level.into(),
        filter: None,
    };
    if let Err(e) = crate::tracing::init_tracing(tracing_config) {
        eprintln!("{e:?}");
        std::process::exit(EXIT_CLI);
    }

    let exit_code = match commands::run(&cli).await {
        Ok(()) => EXIT_OK,
        Err(err) => {
            render_error(&err, cli.json);
            exit_code_for(&err)
        }
    };
    std::process::exit(exit_code);
}
