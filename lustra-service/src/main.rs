//! # Lustra Service
//!
//! CLI host for the gallery engine's background pipelines. Each subcommand
//! wires one processor stack into the periodic reconciliation scan and,
//! where it makes sense, the live filesystem watcher, then runs until
//! Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lustra_config::LustraConfig;
use lustra_core::processor::FileProcessor;
use lustra_core::scan::{
    FileSource, PeriodicScanService, ScanOptions, StoreSource, TokioFs, WalkSource,
};
use lustra_core::store::{
    EmptyGpsSource, MediaRecordStore, MemoryFaceStore, MemoryLocationStore, MemoryMediaStore,
    UnavailableFaceDetector,
};
use lustra_core::watch::{FileWatchService, WatchOptions};
use lustra_core::{
    CompositeProcessor, FaceDetectionProcessor, FileClassifier, GeoClusterProcessor,
    RecordSyncProcessor, ThumbnailCleanupProcessor, ThumbnailProcessor,
};

#[derive(Parser)]
#[command(
    name = "lustra-service",
    about = "Lustra gallery background services",
    version
)]
struct Cli {
    /// Path to lustra.toml (defaults probe ./lustra.toml, /etc/lustra/)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone, Debug)]
struct CommonArgs {
    /// Override the library root folder
    #[arg(long, short = 'f')]
    folder: Option<PathBuf>,

    /// Degree of parallelism (0 selects the CPU count)
    #[arg(long, short = 'p')]
    parallel: Option<usize>,

    /// Process files sequentially
    #[arg(long)]
    sequential: bool,

    /// Seconds between reconciliation scans
    #[arg(long)]
    interval: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build derivative renditions (live watcher + periodic scan)
    Thumbnails {
        #[command(flatten)]
        common: CommonArgs,

        /// Target heights; repeats (defaults to the configured heights)
        #[arg(long = "height", short = 'H')]
        heights: Vec<u32>,
    },

    /// Sweep orphaned renditions for one height directory
    Cleanup {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long, default_value_t = 400)]
        height: u32,
    },

    /// Keep media records in step with the tree
    Records {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Face detection over tracked records
    Faces {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Geospatial clustering over tracked records
    Geo {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Run every pipeline as one composite
    All {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long = "height", short = 'H')]
        heights: Vec<u32>,
    },
}

impl Command {
    fn common(&self) -> &CommonArgs {
        match self {
            Command::Thumbnails { common, .. }
            | Command::Cleanup { common, .. }
            | Command::Records { common }
            | Command::Faces { common }
            | Command::Geo { common }
            | Command::All { common, .. } => common,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = effective_config(&cli).context("loading configuration")?;

    match &cli.command {
        Command::Thumbnails { heights, .. } => {
            let heights = pick_heights(heights, &config);
            let classifier = classifier(&config);
            info!(heights = ?heights, root = %config.library.root.display(), "starting thumbnail pipeline");
            let processor: Arc<dyn FileProcessor> =
                Arc::new(ThumbnailProcessor::new(classifier, heights));
            let source = walk_source(&processor);
            run_pipeline(processor, source, &config, true).await
        }
        Command::Cleanup { height, .. } => {
            let classifier = classifier(&config);
            info!(height, "starting rendition cleanup pipeline");
            let processor: Arc<dyn FileProcessor> =
                Arc::new(ThumbnailCleanupProcessor::new(classifier, *height));
            let source = walk_source(&processor);
            run_pipeline(processor, source, &config, false).await
        }
        Command::Records { .. } => {
            let classifier = classifier(&config);
            let store = memory_media_store();
            info!(root = %config.library.root.display(), "starting record sync pipeline");
            let processor: Arc<dyn FileProcessor> =
                Arc::new(RecordSyncProcessor::new(classifier, store));
            let source = walk_source(&processor);
            run_pipeline(processor, source, &config, true).await
        }
        Command::Faces { .. } => {
            let classifier = classifier(&config);
            let media = memory_media_store();
            info!("starting face detection pipeline");
            let processor: Arc<dyn FileProcessor> = Arc::new(FaceDetectionProcessor::new(
                classifier,
                Arc::new(UnavailableFaceDetector),
                Arc::new(MemoryFaceStore::new()),
                Arc::clone(&media),
            ));
            let source: Arc<dyn FileSource> =
                Arc::new(StoreSource::new(media, Arc::clone(&processor)));
            run_pipeline(processor, source, &config, false).await
        }
        Command::Geo { .. } => {
            let classifier = classifier(&config);
            let media = memory_media_store();
            info!("starting geo clustering pipeline");
            let processor: Arc<dyn FileProcessor> = Arc::new(GeoClusterProcessor::new(
                classifier,
                Arc::clone(&media),
                Arc::new(MemoryLocationStore::new()),
                Arc::new(EmptyGpsSource),
            ));
            let source: Arc<dyn FileSource> =
                Arc::new(StoreSource::new(media, Arc::clone(&processor)));
            run_pipeline(processor, source, &config, false).await
        }
        Command::All { heights, .. } => {
            let heights = pick_heights(heights, &config);
            let classifier = classifier(&config);
            let media = memory_media_store();
            info!(heights = ?heights, "starting combined pipeline");
            let children: Vec<Arc<dyn FileProcessor>> = vec![
                Arc::new(ThumbnailProcessor::new(Arc::clone(&classifier), heights)),
                Arc::new(RecordSyncProcessor::new(
                    Arc::clone(&classifier),
                    Arc::clone(&media),
                )),
                Arc::new(FaceDetectionProcessor::new(
                    Arc::clone(&classifier),
                    Arc::new(UnavailableFaceDetector),
                    Arc::new(MemoryFaceStore::new()),
                    Arc::clone(&media),
                )),
                Arc::new(GeoClusterProcessor::new(
                    Arc::clone(&classifier),
                    Arc::clone(&media),
                    Arc::new(MemoryLocationStore::new()),
                    Arc::new(EmptyGpsSource),
                )),
            ];
            // Children run in order: renditions land before the record
            // hashes them, and the record exists before faces/geo look it
            // up. Files still fan out across the scan's worker pool.
            let processor: Arc<dyn FileProcessor> = Arc::new(CompositeProcessor::new(
                config.library.root.clone(),
                children,
            ));
            let source = walk_source(&processor);
            run_pipeline(processor, source, &config, true).await
        }
    }
}

fn effective_config(cli: &Cli) -> anyhow::Result<LustraConfig> {
    let mut config = LustraConfig::load(cli.config.as_deref())?;
    let common = cli.command.common();
    if let Some(folder) = &common.folder {
        config.library.root = folder.clone();
    }
    if let Some(parallel) = common.parallel {
        config.scan.parallelism = parallel;
    }
    if common.sequential {
        config.scan.parallelism = 1;
    }
    if let Some(interval) = common.interval {
        config.scan.interval_secs = interval;
    }
    config.validate()?;
    Ok(config)
}

fn classifier(config: &LustraConfig) -> Arc<FileClassifier> {
    Arc::new(FileClassifier::new(
        config.library.root.clone(),
        config.classification_rules(),
    ))
}

fn pick_heights(cli_heights: &[u32], config: &LustraConfig) -> Vec<u32> {
    if cli_heights.is_empty() {
        config.derivatives.heights.clone()
    } else {
        cli_heights.to_vec()
    }
}

fn walk_source(processor: &Arc<dyn FileProcessor>) -> Arc<dyn FileSource> {
    Arc::new(WalkSource::new(
        Arc::new(TokioFs::new()),
        Arc::clone(processor),
    ))
}

fn memory_media_store() -> Arc<dyn MediaRecordStore> {
    warn!("using in-memory record store: records do not survive restarts");
    Arc::new(MemoryMediaStore::new())
}

async fn run_pipeline(
    processor: Arc<dyn FileProcessor>,
    source: Arc<dyn FileSource>,
    config: &LustraConfig,
    with_watcher: bool,
) -> anyhow::Result<()> {
    let options = ScanOptions {
        interval: config.scan_interval(),
        parallelism: config.parallelism(),
    };
    let scan = Arc::new(PeriodicScanService::new(
        Arc::clone(&processor),
        source,
        options,
    ));
    let cancel = CancellationToken::new();

    let watch_handle = if with_watcher {
        let watcher = FileWatchService::new(
            processor,
            scan.process_snapshot(),
            WatchOptions {
                debounce_window: config.debounce_window(),
            },
        );
        Some(
            watcher
                .start(cancel.clone())
                .await
                .context("starting filesystem watcher")?,
        )
    } else {
        None
    };

    let scan_task = {
        let scan = Arc::clone(&scan);
        let cancel = cancel.clone();
        tokio::spawn(async move { scan.run(cancel).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");
    cancel.cancel();

    let _ = scan_task.await;
    if let Some(handle) = watch_handle {
        handle.stopped().await;
    }
    info!("shutdown complete");
    Ok(())
}
