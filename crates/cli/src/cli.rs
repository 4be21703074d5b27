use crate::tracing::LogLevel;
use bundlecdn::{BundleSettings, ContentType, SettingsFile};
use clap::{Parser, Subcommand, ValueEnum};
use miette::{Diagnostic, Report};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Exit codes for the CLI application
pub const EXIT_OK: i32 = 0;
/// CLI or configuration error exit code
pub const EXIT_CLI: i32 = 2;
/// Bundle generation or publish error exit code
pub const EXIT_PUBLISH: i32 = 3;

/// CLI-specific error types with exit code mapping
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum CliError {
    /// CLI or configuration error (exit code 2)
    #[error("CLI/configuration error: {message}")]
    #[diagnostic(code(bundlecdn::cli::config))]
    Config {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Generation or publish failure (exit code 3)
    #[error("Publish error: {message}")]
    #[diagnostic(code(bundlecdn::cli::publish))]
    Publish {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
}

impl CliError {
    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    /// Create a new configuration error with help text
    #[must_use]
    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Create a new publish error
    #[must_use]
    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish {
            message: message.into(),
            help: None,
        }
    }
}

impl From<bundlecdn::Error> for CliError {
    fn from(err: bundlecdn::Error) -> Self {
        match err {
            bundlecdn::Error::Configuration { message } => Self::config_with_help(
                message,
                "Set BUNDLECDN_ACCOUNT_NAME and BUNDLECDN_ACCESS_KEY or pass --account-name/--access-key",
            ),
            bundlecdn::Error::Io { .. } | bundlecdn::Error::Serialization { .. } => {
                Self::config(err.to_string())
            }
            bundlecdn::Error::Publish { ref source, .. } => Self::Publish {
                message: format!("{err}: {source}"),
                help: Some("Nothing was cached; the next request retries the publish".to_string()),
            },
            bundlecdn::Error::Compression { .. } | bundlecdn::Error::Generation { .. } => {
                Self::publish(err.to_string())
            }
        }
    }
}

impl From<bundlecdn_blobstore::Error> for CliError {
    fn from(err: bundlecdn_blobstore::Error) -> Self {
        Self::config_with_help(err.to_string(), "Check that --store-root points to a writable directory")
    }
}

/// Map CLI error to appropriate exit code
#[must_use]
pub const fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Config { .. } => EXIT_CLI,
        CliError::Publish { .. } => EXIT_PUBLISH,
    }
}

/// Render error appropriately based on JSON flag
#[allow(clippy::print_stdout, clippy::print_stderr)]
pub fn render_error(err: &CliError, json_mode: bool) {
    if json_mode {
        let envelope = ErrorEnvelope::new(serde_json::json!({
            "code": match err {
                CliError::Config { .. } => "config",
                CliError::Publish { .. } => "publish",
            },
            "message": err.to_string()
        }));
        match serde_json::to_string(&envelope) {
            Ok(json) => println!("{json}"),
            Err(_) => eprintln!("Error serializing error response"),
        }
    } else {
        let report = Report::new(err.clone());
        eprintln!("{report:?}");
        let _ = io::stderr().flush();
    }
}

/// Success response envelope for JSON output
#[derive(Debug, Clone, Serialize)]
pub struct OkEnvelope<T> {
    /// Always "ok"
    pub status: &'static str,
    /// The actual data payload
    pub data: T,
}

impl<T> OkEnvelope<T> {
    /// Create a new success envelope
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self { status: "ok", data }
    }
}

/// Error response envelope for JSON output
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope<E> {
    /// Always "error"
    pub status: &'static str,
    /// The error details
    pub error: E,
}

impl<E> ErrorEnvelope<E> {
    /// Create a new error envelope
    #[must_use]
    pub const fn new(error: E) -> Self {
        Self {
            status: "error",
            error,
        }
    }
}

/// Bundle kind accepted on the command line
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum BundleKind {
    /// Stylesheet bundle (`.css`)
    Css,
    /// Script bundle (`.js`)
    Js,
}

impl From<BundleKind> for ContentType {
    fn from(kind: BundleKind) -> Self {
        match kind {
            BundleKind::Css => Self::Stylesheet,
            BundleKind::Js => Self::Script,
        }
    }
}

/// Publish generated CSS/JS bundles to a blob store and keep them fresh.
#[derive(Parser, Debug)]
#[command(name = "bundlecdn")]
#[command(about = "Publish CSS/JS bundles to a blob store behind versioned CDN URLs")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Logging verbosity level.
    #[arg(short = 'L', long, global = true, default_value = "warn", value_enum)]
    pub level: LogLevel,

    /// Emit JSON envelopes and JSON logs.
    #[arg(long, global = true)]
    pub json: bool,

    /// Settings file (JSON); environment variables override it.
    #[arg(long, global = true, env = "BUNDLECDN_SETTINGS", value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Storage account name.
    #[arg(long, global = true, env = "BUNDLECDN_ACCOUNT_NAME", hide_env_values = true)]
    pub account_name: Option<String>,

    /// Storage access key.
    #[arg(long, global = true, env = "BUNDLECDN_ACCESS_KEY", hide_env_values = true)]
    pub access_key: Option<String>,

    /// Base CDN URL for plain requests.
    #[arg(long, global = true, env = "BUNDLECDN_CDN_PATH")]
    pub cdn_path: Option<String>,

    /// Base CDN URL for encrypted requests.
    #[arg(long, global = true, env = "BUNDLECDN_SECURE_CDN_PATH")]
    pub secure_cdn_path: Option<String>,

    /// Directory backing the blob store; containers are subdirectories.
    #[arg(long, global = true, env = "BUNDLECDN_STORE_ROOT", default_value = ".")]
    pub store_root: PathBuf,

    /// Container holding sources and published artifacts.
    #[arg(long, short = 'c', global = true, env = "BUNDLECDN_CONTAINER", default_value = "assets")]
    pub container: String,
}

/// Bundle definition shared by the subcommands
#[derive(clap::Args, Debug, Clone)]
pub struct BundleArgs {
    /// Bundle virtual path, e.g. `~/css/site`.
    #[arg(value_name = "VIRTUAL_PATH")]
    pub virtual_path: String,

    /// Source file inside the container (repeatable, concatenated in order).
    #[arg(long = "source", short = 's', required = true, action = clap::ArgAction::Append)]
    pub sources: Vec<String>,

    /// Bundle type.
    #[arg(long = "type", short = 't', value_enum, default_value_t = BundleKind::Js)]
    pub kind: BundleKind,

    /// Serve the gzip sibling, as for a client accepting gzip.
    #[arg(long)]
    pub gzip: bool,

    /// Treat the request as arriving over an encrypted connection.
    #[arg(long)]
    pub secure: bool,

    /// Print the store path instead of a CDN URL.
    #[arg(long)]
    pub no_cdn: bool,

    /// Publish gzip siblings (overrides settings).
    #[arg(long)]
    pub compress: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate and publish a bundle once.
    Publish {
        /// Bundle to publish.
        #[command(flatten)]
        bundle: BundleArgs,
    },
    /// Publish a bundle and republish whenever a source changes.
    Watch {
        /// Bundle to watch.
        #[command(flatten)]
        bundle: BundleArgs,

        /// Seconds between source polls (overrides settings).
        #[arg(long, value_name = "SECS")]
        poll_secs: Option<u64>,

        /// Stop after this many republishes.
        #[arg(long, value_name = "N")]
        max_republishes: Option<usize>,
    },
}

impl Cli {
    /// Resolve global settings: file, then environment, then flags
    pub fn settings(&self) -> Result<BundleSettings, CliError> {
        let file = match &self.settings {
            Some(path) => SettingsFile::read(path)?,
            None => SettingsFile::default(),
        };
        let file = file.with_env_overrides(|name| std::env::var(name).ok());
        Ok(BundleSettings::from_file(self.apply_flags(file))?)
    }

    fn apply_flags(&self, mut file: SettingsFile) -> SettingsFile {
        let set = |slot: &mut Option<String>, value: &Option<String>| {
            if let Some(v) = value.as_ref().filter(|v| !v.trim().is_empty()) {
                *slot = Some(v.clone());
            }
        };
        set(&mut file.account_name, &self.account_name);
        set(&mut file.access_key, &self.access_key);
        set(&mut file.cdn_path, &self.cdn_path);
        set(&mut file.secure_cdn_path, &self.secure_cdn_path);
        if let Commands::Publish { bundle } | Commands::Watch { bundle, .. } = &self.command
            && bundle.compress
        {
            file.use_compression = Some(true);
        }
        file
    }

    /// Poll interval override from `watch --poll-secs`
    #[must_use]
    pub fn poll_interval(&self) -> Option<Duration> {
        match &self.command {
            Commands::Watch {
                poll_secs: Some(secs),
                ..
            } if *secs > 0 => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

/// Parse command line arguments
#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}
