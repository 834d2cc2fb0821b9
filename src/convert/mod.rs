//! Converts every selected platform manifest of an image to one target format.

use crate::compression::selector::BackendSelector;
use crate::error::ConvertError;
use crate::hashed_writer::hash_reader;
use crate::image::{IndexEntry, SourceImage, SourceManifest};
use crate::media_type;
use crate::options::ConversionOptions;
use crate::platform_matcher::PlatformMatcher;
use crate::progress::progress_parallel_collect;
use crate::report::ConversionReport;
use crate::store::{to_canonical_json, ContentStore, OciDir, Staging};
use anyhow::{bail, Context};
use itertools::Itertools;
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest, MediaType};
use rayon::prelude::*;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub mod builder;
pub mod chunked;
mod layer;

use builder::ExternalBuilder;
use layer::{ConvertedLayer, LayerContext, LayerJob, LayerStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ConversionState {
    Pending,
    ResolvingOptions,
    EnumeratingLayers,
    Converting,
    AssemblingManifest,
    Committed,
    Failed,
}

impl ConversionState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }

    fn next(self) -> Option<Self> {
        Some(match self {
            Self::Pending => Self::ResolvingOptions,
            Self::ResolvingOptions => Self::EnumeratingLayers,
            Self::EnumeratingLayers => Self::Converting,
            Self::Converting => Self::AssemblingManifest,
            Self::AssemblingManifest => Self::Committed,
            Self::Committed | Self::Failed => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConvertedManifest {
    pub platform: String,
    pub source_digest: String,
    /// Entry in the new index.
    pub descriptor: Descriptor,
    pub manifest: ImageManifest,
    pub diff_ids: Vec<String>,
}

/// The converted image as committed to the destination.
#[derive(Debug, Clone)]
pub struct ManifestSet {
    pub index: ImageIndex,
    pub manifests: Vec<ConvertedManifest>,
    /// Unselected entries copied through unchanged.
    pub passed_through: Vec<Descriptor>,
}

#[derive(Debug, Clone)]
pub struct ConversionResult {
    pub manifests: ManifestSet,
    /// Compression decisions, filled only in debug mode.
    pub reports: Vec<ConversionReport>,
}

/// Everything written during assembly, committed in one step.
#[derive(Default)]
struct Assembly {
    manifests: Vec<ConvertedManifest>,
    passed_through: Vec<Descriptor>,
    index_entries: Vec<Descriptor>,
    json_blobs: Vec<Vec<u8>>,
    copies: Vec<String>,
}

pub struct LayerConverter<'a> {
    options: &'a ConversionOptions,
    selector: &'a BackendSelector,
    builder: &'a dyn ExternalBuilder,
    cancel: CancellationToken,
    state: ConversionState,
}

impl<'a> LayerConverter<'a> {
    pub fn new(
        options: &'a ConversionOptions,
        selector: &'a BackendSelector,
        builder: &'a dyn ExternalBuilder,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            options,
            selector,
            builder,
            cancel,
            state: ConversionState::Pending,
        }
    }

    pub fn state(&self) -> ConversionState {
        self.state
    }

    fn advance(&mut self) {
        if let Some(next) = self.state.next() {
            debug!("Conversion {} -> {next}", self.state);
            self.state = next;
        }
    }

    fn check_cancelled(&self) -> Result<(), ConvertError> {
        if self.cancel.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }
        Ok(())
    }

    /// Converts `source` into `destination`. Both may be the same layout.
    ///
    /// Nothing becomes visible in `destination` unless every layer of every
    /// selected manifest converted successfully.
    #[instrument(skip_all, fields(format = %self.options.target()))]
    pub fn convert(&mut self, source: &OciDir, destination: &OciDir) -> anyhow::Result<ConversionResult> {
        if self.state.is_terminal() {
            bail!("Conversion already finished ({})", self.state);
        }
        let result = self.run(source, destination);
        if let Err(error) = &result {
            debug!("Conversion failed in state {}: {error:#}", self.state);
            self.state = ConversionState::Failed;
        }
        result
    }

    fn run(&mut self, source: &OciDir, destination: &OciDir) -> anyhow::Result<ConversionResult> {
        self.advance();
        let strategy = LayerStrategy::plan(self.options, self.selector)?;
        let matcher = PlatformMatcher::from_filter(self.options.platforms())?;
        self.check_cancelled()?;

        self.advance();
        let image = SourceImage::load(source, &matcher)?;
        if image.selected().next().is_none() {
            bail!("No manifest in {source} matches {matcher}");
        }
        let jobs = image
            .selected()
            .flat_map(|m| {
                m.manifest
                    .layers()
                    .iter()
                    .zip(&m.diff_ids)
                    .map(move |(descriptor, diff_id)| (m.to_string(), descriptor, diff_id))
            })
            .unique_by(|(_, descriptor, _)| descriptor.digest().to_string())
            .enumerate()
            .map(|(id, (platform, descriptor, diff_id))| LayerJob {
                id,
                descriptor: descriptor.clone(),
                diff_id: diff_id.clone(),
                platform,
            })
            .collect_vec();
        info!(
            "Converting {} layers of {} manifests to {}",
            jobs.len(),
            image.selected().count(),
            self.options.target()
        );

        self.advance();
        let staging = Staging::new_in(destination)?;
        let context = LayerContext {
            source,
            staging: &staging,
            builder: self.builder,
            options: self.options,
            strategy: &strategy,
            cancel: &self.cancel,
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.selector.workers().count())
            .build()
            .context("Building worker pool")?;
        let target = self.options.target();
        let converted: Vec<ConvertedLayer> = pool.install(|| {
            progress_parallel_collect(
                "Converting layers",
                jobs.par_iter().map(|job| {
                    context.convert(job).with_context(|| {
                        format!(
                            "Converting layer {} ({}) to {target}",
                            job.descriptor.digest(),
                            job.platform
                        )
                    })
                }),
            )
        })?;
        self.check_cancelled()?;
        let by_digest: HashMap<&str, &ConvertedLayer> = jobs
            .iter()
            .map(|job| job.descriptor.digest().as_str())
            .zip(&converted)
            .collect();

        self.advance();
        let mut assembly = Assembly::default();
        for entry in &image.entries {
            match entry {
                IndexEntry::Selected(manifest) => self
                    .assemble_manifest(manifest, &by_digest, &mut assembly)
                    .with_context(|| format!("Assembling manifest for {manifest}"))?,
                IndexEntry::Unselected { descriptor, blobs } => match self.options.unselected() {
                    crate::options::UnselectedPlatforms::Exclude => {
                        debug!("Dropping unselected entry {}", descriptor.digest());
                    }
                    crate::options::UnselectedPlatforms::PassThrough => {
                        assembly.copies.extend(blobs.iter().cloned());
                        assembly.index_entries.push(descriptor.clone());
                        assembly.passed_through.push(descriptor.clone());
                    }
                },
            }
        }

        let mut index = image.index.clone();
        if self.options.oci() {
            let source_type = index.media_type().clone().unwrap_or(MediaType::ImageIndex);
            index.set_media_type(Some(media_type::to_oci(&source_type)));
        }
        index.set_manifests(assembly.index_entries.clone());

        self.check_cancelled()?;
        let copies: Vec<(String, &dyn ContentStore)> = if source.same_location(destination) {
            vec![]
        } else {
            assembly
                .copies
                .iter()
                .unique()
                .map(|digest| (digest.clone(), source as &dyn ContentStore))
                .collect()
        };
        let staged = converted
            .iter()
            .flat_map(|c| c.staged.iter().cloned())
            .unique_by(|blob| blob.hash.clone())
            .collect_vec();
        staging.commit(destination, staged, &copies, &assembly.json_blobs, &index)?;
        self.advance();

        let reports = converted.iter().filter_map(|c| c.report.clone()).collect_vec();
        Ok(ConversionResult {
            manifests: ManifestSet {
                index,
                manifests: assembly.manifests,
                passed_through: assembly.passed_through,
            },
            reports,
        })
    }

    fn assemble_manifest(
        &self,
        source: &SourceManifest,
        converted: &HashMap<&str, &ConvertedLayer>,
        assembly: &mut Assembly,
    ) -> anyhow::Result<()> {
        let oci = self.options.oci();
        let layers = source
            .manifest
            .layers()
            .iter()
            .map(|layer| {
                converted
                    .get(layer.digest().as_str())
                    .copied()
                    .with_context(|| format!("Layer {} was not converted", layer.digest()))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        for layer in &layers {
            assembly.copies.extend(layer.reused.iter().cloned());
        }
        let diff_ids = layers.iter().map(|l| l.diff_id.clone()).collect_vec();

        let source_config = source.manifest.config();
        let config_media_type = if oci {
            media_type::to_oci(source_config.media_type())
        } else {
            source_config.media_type().clone()
        };
        let config_descriptor = if diff_ids == source.diff_ids {
            assembly.copies.push(source_config.digest().to_string());
            let mut descriptor = source_config.clone();
            descriptor.set_media_type(config_media_type);
            descriptor
        } else {
            let mut config: serde_json::Value =
                serde_json::from_slice(&source.config).context("Parsing image configuration")?;
            let Some(rootfs) = config.get_mut("rootfs").and_then(|r| r.as_object_mut()) else {
                bail!("Image configuration has no rootfs");
            };
            rootfs.insert("diff_ids".to_string(), serde_json::to_value(&diff_ids)?);
            let content = to_canonical_json(&config)?;
            let hash = hash_reader(content.as_slice())?;
            assembly.json_blobs.push(content);
            Descriptor::new(config_media_type, hash.size as i64, hash.prefixed_hash())
        };

        let manifest_media_type = match source.manifest.media_type() {
            Some(mt) if oci => media_type::to_oci(mt),
            Some(mt) => mt.clone(),
            None => MediaType::ImageManifest,
        };
        if media_type::is_docker(&manifest_media_type) && self.options.target().uses_zstd_backend() {
            warn!(
                "Docker manifest for {source} now references zstd layers; use --oci for an OCI manifest"
            );
        }
        let mut manifest = source.manifest.clone();
        manifest.set_media_type(Some(manifest_media_type.clone()));
        manifest.set_config(config_descriptor);
        manifest.set_layers(layers.iter().map(|l| l.descriptor.clone()).collect());

        let content = to_canonical_json(&manifest)?;
        let hash = hash_reader(content.as_slice())?;
        assembly.json_blobs.push(content);

        let mut descriptor = source.descriptor.clone();
        descriptor.set_media_type(manifest_media_type);
        descriptor.set_digest(hash.prefixed_hash());
        descriptor.set_size(hash.size as i64);
        assembly.index_entries.push(descriptor.clone());
        assembly.manifests.push(ConvertedManifest {
            platform: source.to_string(),
            source_digest: source.descriptor.digest().to_string(),
            descriptor,
            manifest,
            diff_ids,
        });
        Ok(())
    }
}
