//! Subcommand execution

use crate::cli::{BundleArgs, Cli, CliError, Commands, OkEnvelope};
use bundlecdn::{
    BundleConfig, BundleDefinition, BundleIdentity, BundleOverrides, BundleRequest,
    BundleResponse, BundleService, CompressedForm, ConcatGenerator,
};
use bundlecdn_blobstore::{BlobStore, FsBlobStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// How often `watch` checks whether its bundle was invalidated
const WATCH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Result of one publish, as printed to stdout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReport {
    /// Bundle virtual path
    pub virtual_path: String,
    /// Store path the client is directed to
    pub served_path: String,
    /// Versioned CDN URL, when CDN delivery is enabled
    pub cdn_url: Option<String>,
    /// Plain artifact was rewritten
    pub plain_written: bool,
    /// Compressed sibling was rewritten, and in which form
    pub compressed_written: Option<CompressedForm>,
}

impl PublishReport {
    fn from_response(virtual_path: &str, response: &BundleResponse) -> Self {
        let outcome = &response.bundle.outcome;
        Self {
            virtual_path: virtual_path.to_string(),
            served_path: response.served_path.clone(),
            cdn_url: response.cdn_url.clone(),
            plain_written: !response.cache_hit && outcome.plain_written,
            compressed_written: if response.cache_hit {
                None
            } else {
                outcome.compressed_written
            },
        }
    }

    /// The line printed in text mode
    #[must_use]
    pub fn location(&self) -> &str {
        self.cdn_url.as_deref().unwrap_or(&self.served_path)
    }
}

/// Run the parsed command
pub async fn run(cli: &Cli) -> Result<(), CliError> {
    match &cli.command {
        Commands::Publish { bundle } => {
            let (service, request) = build_service(cli, bundle)?;
            let report = publish_once(&service, &request).await?;
            emit(&report, cli.json);
            Ok(())
        }
        Commands::Watch {
            bundle,
            max_republishes,
            ..
        } => {
            let (service, request) = build_service(cli, bundle)?;
            watch(&service, &request, *max_republishes, cli.json).await
        }
    }
}

fn build_service(cli: &Cli, bundle: &BundleArgs) -> Result<(BundleService, BundleRequest), CliError> {
    let settings = cli.settings()?;
    let overrides = BundleOverrides {
        cache_poll_interval: cli.poll_interval(),
        ..Default::default()
    };
    let config = BundleConfig::resolve(cli.container.clone(), overrides, &settings)?;

    let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::open(&cli.store_root)?);
    let generator = ConcatGenerator::new(Arc::clone(&store), cli.container.clone()).with_bundle(
        bundle.virtual_path.clone(),
        BundleDefinition {
            content_type: bundle.kind.into(),
            sources: bundle.sources.clone(),
        },
    );
    let service = BundleService::new(store, config, Arc::new(generator)).with_cdn(!bundle.no_cdn);

    let mut request = BundleRequest::new(bundle.virtual_path.clone()).secure(bundle.secure);
    if bundle.gzip {
        request = request.accept_encoding("gzip");
    }
    Ok((service, request))
}

#[instrument(name = "publish", skip_all, fields(virtual_path = %request.virtual_path))]
async fn publish_once(service: &BundleService, request: &BundleRequest) -> Result<PublishReport, CliError> {
    let response = service.handle(request).await?;
    Ok(PublishReport::from_response(&request.virtual_path, &response))
}

async fn watch(
    service: &BundleService,
    request: &BundleRequest,
    max_republishes: Option<usize>,
    json: bool,
) -> Result<(), CliError> {
    emit(&publish_once(service, request).await?, json);

    let identity = BundleIdentity::new(
        &request.virtual_path,
        &service.config().container,
        request.secure,
    );
    let key = service.cache().key_for(&identity);
    info!(
        virtual_path = %request.virtual_path,
        poll_secs = service.config().cache_poll_interval.as_secs(),
        "Watching bundle sources"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(WATCH_CHECK_INTERVAL);
    let mut republished = 0usize;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Interrupted, stopping watch");
                break;
            }
            _ = ticker.tick() => {}
        }
        if service.cache().contains(&key) {
            continue;
        }

        match publish_once(service, request).await {
            Ok(report) => {
                emit(&report, json);
                republished += 1;
                if max_republishes.is_some_and(|max| republished >= max) {
                    break;
                }
            }
            // Nothing was cached, so the next check retries
            Err(e) => warn!(error = %e, "Republish failed"),
        }
    }

    service.cache().clear();
    Ok(())
}

#[allow(clippy::print_stdout)]
fn emit(report: &PublishReport, json: bool) {
    if json {
        match serde_json::to_string(&OkEnvelope::new(report)) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "Failed to serialize publish report"),
        }
    } else {
        println!("{}", report.location());
    }
}
