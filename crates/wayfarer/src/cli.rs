//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use wayfarer_service::caching::Caches;
use wayfarer_service::config::Config;
use wayfarer_service::fetch::{
    AssetDecoder, Decoded, FilesystemLibrary, HttpFetcher, Image, ImageDecoder, LocalFetcher,
    MediaFetcher, RawDecoder, Video, VideoDecoder,
};
use wayfarer_service::metrics;
use wayfarer_service::resolver::AssetPipeline;
use wayfarer_sources::RequestDescriptor;

use crate::logging;

/// The kind of media to resolve, which selects the cache and the decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum Kind {
    #[default]
    Image,
    Video,
    /// Undecoded bytes, stored in the image cache.
    Raw,
}

/// Cache maintenance commands.
#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// Remove every entry of the persistent caches.
    Clear,

    /// Remove a single asset from the persistent cache.
    Remove {
        /// The asset, either a URL or `local:<id>`.
        descriptor: RequestDescriptor,

        #[arg(long, value_enum, default_value_t)]
        kind: Kind,
    },
}

/// Wayfarer commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve assets through the cache tiers.
    Resolve {
        /// The assets, either URLs or `local:<id>`.
        #[arg(required = true)]
        descriptors: Vec<RequestDescriptor>,

        #[arg(long, value_enum, default_value_t)]
        kind: Kind,

        /// Write the resolved assets into this directory.
        #[arg(long, short, value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Maintain the persistent caches.
    #[command(subcommand)]
    Cache(CacheCommand),
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "wayfarer", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime is not started yet, so this is still single-threaded.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("wayfarer")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(run(cli.command, config))
}

async fn run(command: Command, config: Config) -> Result<()> {
    let caches = Caches::from_config(&config).context("failed to create the caches")?;
    caches
        .clear_tmp(&config)
        .context("failed to clear the temporary cache files")?;

    match command {
        Command::Resolve {
            descriptors,
            kind,
            output,
        } => {
            let reports = resolve(&config, &caches, kind, &descriptors, output.as_deref()).await?;
            for report in reports {
                println!("{}", serde_json::to_string(&report)?);
            }
        }
        Command::Cache(CacheCommand::Clear) => {
            caches.clear().await.context("failed to clear the caches")?;
            tracing::info!("Cleared the persistent caches");
        }
        Command::Cache(CacheCommand::Remove { descriptor, kind }) => {
            let removed = invalidate(&config, &caches, kind, &descriptor).await?;
            tracing::info!(%descriptor, removed, "Invalidated asset");
        }
    }

    Ok(())
}

/// The outcome of resolving one asset, printed as a JSON line.
#[derive(Debug, Serialize, PartialEq)]
struct Report {
    descriptor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Access to the encoded form of a resolved item.
trait Encoded {
    fn format(&self) -> Option<String>;
    fn data(&self) -> &Bytes;
}

impl Encoded for Image {
    fn format(&self) -> Option<String> {
        Some(self.format.to_string())
    }

    fn data(&self) -> &Bytes {
        &self.data
    }
}

impl Encoded for Video {
    fn format(&self) -> Option<String> {
        Some(self.format.to_string())
    }

    fn data(&self) -> &Bytes {
        &self.data
    }
}

impl Encoded for Bytes {
    fn format(&self) -> Option<String> {
        None
    }

    fn data(&self) -> &Bytes {
        self
    }
}

type CliPipeline<D> = AssetPipeline<Decoded<MediaFetcher<FilesystemLibrary>, D>>;

fn pipeline<D: AssetDecoder>(
    config: &Config,
    caches: &Caches,
    decoder: D,
) -> Result<CliPipeline<D>> {
    // Without a library directory, local assets are looked up in an empty path and not found.
    let library = FilesystemLibrary::new(config.library_dir.clone().unwrap_or_default());
    let local = LocalFetcher::new(Arc::new(library));
    let remote = HttpFetcher::from_config(config).context("failed to create the HTTP client")?;

    let fetcher = Decoded::new(MediaFetcher::new(local, remote), decoder);
    Ok(AssetPipeline::from_config(fetcher, config, caches))
}

async fn resolve(
    config: &Config,
    caches: &Caches,
    kind: Kind,
    descriptors: &[RequestDescriptor],
    output: Option<&Path>,
) -> Result<Vec<Report>> {
    match kind {
        Kind::Image => {
            let pipeline = pipeline(config, caches, ImageDecoder)?;
            resolve_with(&pipeline, descriptors, output).await
        }
        Kind::Video => {
            let pipeline = pipeline(config, caches, VideoDecoder)?;
            resolve_with(&pipeline, descriptors, output).await
        }
        Kind::Raw => {
            let decoder = RawDecoder(ImageDecoder.cache_name());
            let pipeline = pipeline(config, caches, decoder)?;
            resolve_with(&pipeline, descriptors, output).await
        }
    }
}

async fn resolve_with<D>(
    pipeline: &CliPipeline<D>,
    descriptors: &[RequestDescriptor],
    output: Option<&Path>,
) -> Result<Vec<Report>>
where
    D: AssetDecoder,
    D::Item: Encoded,
{
    if let Some(output) = output {
        tokio::fs::create_dir_all(output)
            .await
            .with_context(|| format!("failed to create {}", output.display()))?;
    }

    let mut reports = Vec::with_capacity(descriptors.len());
    for (index, descriptor) in descriptors.iter().enumerate() {
        let (entry, tier) = pipeline.resolve(descriptor).await;
        let mut report = Report {
            descriptor: descriptor.to_string(),
            tier: None,
            format: None,
            size: None,
            path: None,
            error: None,
        };

        match entry {
            Ok(item) => {
                report.tier = Some(tier.as_ref().to_owned());
                report.format = item.format();
                report.size = Some(item.data().len());
                if let Some(output) = output {
                    let extension = report.format.as_deref().unwrap_or("bin");
                    let path = output.join(format!("{index}.{extension}"));
                    tokio::fs::write(&path, item.data())
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    report.path = Some(path);
                }
            }
            Err(error) => {
                tracing::warn!(%descriptor, error = %error, "Failed to resolve asset");
                report.error = Some(error.to_string());
            }
        }

        reports.push(report);
    }

    Ok(reports)
}

async fn invalidate(
    config: &Config,
    caches: &Caches,
    kind: Kind,
    descriptor: &RequestDescriptor,
) -> Result<bool> {
    let removed = match kind {
        Kind::Image => pipeline(config, caches, ImageDecoder)?.invalidate(descriptor).await,
        Kind::Video => pipeline(config, caches, VideoDecoder)?.invalidate(descriptor).await,
        Kind::Raw => {
            let decoder = RawDecoder(ImageDecoder.cache_name());
            pipeline(config, caches, decoder)?.invalidate(descriptor).await
        }
    };
    removed.context("failed to remove the cache entry")
}
