use crate::compression::selector::BackendSelector;
use crate::config::{Config, EnvOverrides, CONFIG_ENV};
use crate::convert::builder::CommandBuilder;
use crate::convert::LayerConverter;
use crate::options::{resolve, ConversionOptions, Defaults, RequestFlags};
use crate::report::DebugReport;
use crate::store::OciDir;
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod compression;
mod config;
mod convert;
mod error;
mod hashed_writer;
mod image;
mod io;
mod media_type;
mod options;
mod platform_matcher;
mod progress;
mod report;
mod store;
#[cfg(test)]
mod test_utils;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// OCI image layout to convert
    source: PathBuf,
    /// OCI image layout to write, may be the same as the source
    destination: PathBuf,
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Convert layers to zstd
    #[arg(long, help_heading = "Formats")]
    zstd: bool,
    /// Convert layers to zstd:chunked
    #[arg(long, help_heading = "Formats")]
    zstdchunked: bool,
    /// Convert layers to eStargz
    #[arg(long, help_heading = "Formats")]
    estargz: bool,
    /// Convert layers to nydus blobs
    #[arg(long, help_heading = "Formats")]
    nydus: bool,
    /// Convert layers to overlaybd
    #[arg(long, help_heading = "Formats")]
    overlaybd: bool,
    /// Add SOCI span indexes to layers
    #[arg(long, help_heading = "Formats")]
    soci: bool,
    /// Store layers uncompressed
    #[arg(long, help_heading = "Formats")]
    uncompress: bool,
    /// Write OCI media types, converting Docker schema2 types
    #[arg(long, help_heading = "Formats")]
    oci: bool,

    #[arg(long, help_heading = "zstd")]
    zstd_compression_level: Option<i32>,
    #[arg(long, help_heading = "zstd:chunked")]
    zstdchunked_compression_level: Option<i32>,
    #[arg(long, help_heading = "zstd:chunked", allow_negative_numbers = true)]
    zstdchunked_chunk_size: Option<i64>,
    /// File listing paths to prioritize
    #[arg(long, help_heading = "zstd:chunked")]
    zstdchunked_record_in: Option<PathBuf>,

    #[arg(long, help_heading = "eStargz")]
    estargz_compression_level: Option<i32>,
    #[arg(long, help_heading = "eStargz", allow_negative_numbers = true)]
    estargz_chunk_size: Option<i64>,
    #[arg(long, help_heading = "eStargz", allow_negative_numbers = true)]
    estargz_min_chunk_size: Option<i64>,
    #[arg(long, help_heading = "eStargz")]
    estargz_record_in: Option<PathBuf>,
    #[arg(long, help_heading = "eStargz")]
    estargz_external_toc: bool,
    /// Fail instead of changing a layer's diffID
    #[arg(long, help_heading = "eStargz")]
    estargz_keep_diff_id: bool,

    #[arg(long, help_heading = "nydus")]
    nydus_builder_path: Option<PathBuf>,
    #[arg(long, help_heading = "nydus")]
    nydus_work_dir: Option<PathBuf>,
    /// Newline or comma separated paths
    #[arg(long, help_heading = "nydus")]
    nydus_prefetch_patterns: Option<String>,
    /// none, lz4_block or zstd
    #[arg(long, help_heading = "nydus")]
    nydus_compressor: Option<String>,

    #[arg(long, help_heading = "overlaybd")]
    overlaybd_fs_type: Option<String>,
    #[arg(long, help_heading = "overlaybd")]
    overlaybd_dbstr: Option<String>,

    /// -1 uses the builder default
    #[arg(long, help_heading = "SOCI", allow_negative_numbers = true)]
    soci_min_layer_size: Option<i64>,
    /// -1 uses the builder default
    #[arg(long, help_heading = "SOCI", allow_negative_numbers = true)]
    soci_span_size: Option<i64>,

    /// Platforms to convert as os/arch[/variant] globs, defaults to the host
    #[arg(long = "platform", help_heading = "Platforms")]
    platforms: Vec<String>,
    #[arg(long, help_heading = "Platforms")]
    all_platforms: bool,
    /// Copy manifests of other platforms unchanged instead of dropping them
    #[arg(long, help_heading = "Platforms")]
    keep_unselected_platforms: bool,

    /// Print the compression decisions after converting
    #[arg(long)]
    debug_compression: bool,
}

impl Args {
    fn request_flags(&self) -> RequestFlags {
        RequestFlags {
            zstd: self.zstd,
            zstdchunked: self.zstdchunked,
            estargz: self.estargz,
            nydus: self.nydus,
            overlaybd: self.overlaybd,
            soci: self.soci,
            uncompress: self.uncompress,
            oci: self.oci,
            zstd_compression_level: self.zstd_compression_level,
            zstdchunked_compression_level: self.zstdchunked_compression_level,
            zstdchunked_chunk_size: self.zstdchunked_chunk_size,
            zstdchunked_record_in: self.zstdchunked_record_in.clone(),
            estargz_compression_level: self.estargz_compression_level,
            estargz_chunk_size: self.estargz_chunk_size,
            estargz_min_chunk_size: self.estargz_min_chunk_size,
            estargz_record_in: self.estargz_record_in.clone(),
            estargz_external_toc: self.estargz_external_toc,
            estargz_keep_diff_id: self.estargz_keep_diff_id,
            nydus_builder_path: self.nydus_builder_path.clone(),
            nydus_work_dir: self.nydus_work_dir.clone(),
            nydus_prefetch_patterns: self.nydus_prefetch_patterns.clone(),
            nydus_compressor: self.nydus_compressor.clone(),
            overlaybd_fs_type: self.overlaybd_fs_type.clone(),
            overlaybd_dbstr: self.overlaybd_dbstr.clone(),
            soci_min_layer_size: self.soci_min_layer_size,
            soci_span_size: self.soci_span_size,
            platforms: self.platforms.clone(),
            all_platforms: self.all_platforms,
            keep_unselected_platforms: self.keep_unselected_platforms,
            debug_compression: self.debug_compression,
        }
    }
}

fn setup_tracing() {
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();
}

fn main() -> ExitCode {
    setup_tracing();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let env = EnvOverrides::from_process_env()?;
    let config = match Config::default_path(args.config.clone(), std::env::var(CONFIG_ENV).ok()) {
        Some(path) => Config::load_from(&path)?,
        None => Config::default(),
    };
    let options = resolve(&Defaults::default(), &config, &env, &args.request_flags())?;
    info!(
        "Converting {} to {} in {}",
        args.source.display(),
        options.target(),
        args.destination.display()
    );

    let runtime = tokio::runtime::Runtime::new().context("Starting runtime")?;
    let cancel = CancellationToken::new();
    runtime.block_on(async {
        let watcher = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, discarding partial conversion");
                    cancel.cancel();
                }
            }
        });
        let result = tokio::task::spawn_blocking(move || convert(&args, &options, cancel)).await;
        watcher.abort();
        result.context("Conversion task panicked")?
    })
}

fn convert(args: &Args, options: &ConversionOptions, cancel: CancellationToken) -> anyhow::Result<()> {
    let source = OciDir::open(&args.source).context("Error opening source image")?;
    let destination = OciDir::create(&args.destination).context("Error opening destination image")?;
    let selector = BackendSelector::system(options.backend().workers);
    let builder = CommandBuilder::default();

    let mut converter = LayerConverter::new(options, &selector, &builder, cancel);
    let result = converter.convert(&source, &destination)?;
    for manifest in &result.manifests.manifests {
        info!(
            "{}: {} -> {}",
            manifest.platform,
            manifest.source_digest,
            manifest.descriptor.digest()
        );
    }
    if !result.manifests.passed_through.is_empty() {
        info!(
            "Copied {} unselected manifests unchanged",
            result.manifests.passed_through.len()
        );
    }
    if options.debug() {
        print!("{}", DebugReport(&result.reports));
    }
    Ok(())
}
