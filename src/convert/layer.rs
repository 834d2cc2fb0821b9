use super::builder::{BuildRequest, ExternalBuilder};
use super::chunked::{read_record_in, write_chunked};
use crate::compression::selector::{BackendSelector, Selection};
use crate::compression::Compression;
use crate::error::ConvertError;
use crate::hashed_writer::{hash_file, hash_reader, HashAndSize};
use crate::io::new_mmap;
use crate::media_type;
use crate::options::{ConversionOptions, TargetFormat};
use crate::report::ConversionReport;
use crate::store::{ContentStore, OciDir, StagedBlob, Staging};
use anyhow::Context;
use oci_spec::image::{Descriptor, MediaType};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span};

/// Layers smaller than this keep no span index unless told otherwise.
pub const SOCI_DEFAULT_MIN_LAYER_SIZE: u64 = 10 * 1024 * 1024;
pub const SOCI_ZTOC_ANNOTATION: &str = "com.amazon.soci.ztoc-digest";

/// How every layer of one conversion is produced.
#[derive(Debug)]
pub enum LayerStrategy {
    Zstd(Selection),
    ZstdChunked {
        selection: Selection,
        chunk_size: u64,
        prioritized: HashSet<String>,
    },
    /// estargz, nydus and overlaybd.
    External { format: TargetFormat, level: Option<i32> },
    Soci { min_layer_size: u64 },
    Uncompressed,
    /// Blob reused, only the media type may change.
    Passthrough,
}

impl LayerStrategy {
    /// Resolves everything that does not depend on layer content. Backend
    /// errors surface here, before any layer is read.
    pub fn plan(options: &ConversionOptions, selector: &BackendSelector) -> anyhow::Result<Self> {
        let forced = options.backend().forced;
        let levels = options.levels();
        let params = options.params();
        Ok(match options.target() {
            TargetFormat::Zstd => Self::Zstd(selector.select(levels.zstd, forced)?),
            TargetFormat::ZstdChunked => Self::ZstdChunked {
                selection: selector.select(levels.zstd_chunked, forced)?,
                chunk_size: params.zstd_chunked.chunk_size,
                prioritized: match &params.zstd_chunked.record_in {
                    Some(path) => read_record_in(path)?,
                    None => HashSet::new(),
                },
            },
            format @ TargetFormat::Estargz => Self::External {
                format,
                level: Some(levels.estargz),
            },
            format @ (TargetFormat::Nydus | TargetFormat::Overlaybd) => Self::External { format, level: None },
            TargetFormat::Soci => Self::Soci {
                min_layer_size: params.soci.min_layer_size.unwrap_or(SOCI_DEFAULT_MIN_LAYER_SIZE),
            },
            TargetFormat::Uncompressed => Self::Uncompressed,
            TargetFormat::OciPlain => Self::Passthrough,
        })
    }

    pub fn selection(&self) -> Option<&Selection> {
        match self {
            Self::Zstd(selection) | Self::ZstdChunked { selection, .. } => Some(selection),
            _ => None,
        }
    }
}

/// One distinct source layer to convert.
#[derive(Debug)]
pub struct LayerJob {
    pub id: usize,
    pub descriptor: Descriptor,
    pub diff_id: String,
    pub platform: String,
}

#[derive(Debug, Clone)]
pub struct ConvertedLayer {
    pub descriptor: Descriptor,
    pub diff_id: String,
    pub staged: Vec<StagedBlob>,
    /// Set when the source blob is reused as it is.
    pub reused: Option<String>,
    pub report: Option<ConversionReport>,
}

/// Shared, read-only inputs for converting layers in parallel.
pub struct LayerContext<'a> {
    pub source: &'a OciDir,
    pub staging: &'a Staging,
    pub builder: &'a dyn ExternalBuilder,
    pub options: &'a ConversionOptions,
    pub strategy: &'a LayerStrategy,
    pub cancel: &'a CancellationToken,
}

fn integrity_error(job: &LayerJob, actual: &HashAndSize) -> ConvertError {
    ConvertError::ContentIntegrity {
        layer: job.descriptor.digest().to_string(),
        expected: job.diff_id.clone(),
        actual: actual.prefixed_hash(),
    }
}

impl LayerContext<'_> {
    fn layer_media_type(&self, job: &LayerJob, produced: MediaType) -> MediaType {
        if self.options.oci() || !media_type::is_docker(job.descriptor.media_type()) {
            produced
        } else {
            media_type::to_docker_layer(&produced)
        }
    }

    fn reused(&self, job: &LayerJob) -> ConvertedLayer {
        let mut descriptor = job.descriptor.clone();
        if self.options.oci() {
            descriptor.set_media_type(media_type::to_oci(job.descriptor.media_type()));
        }
        ConvertedLayer {
            descriptor,
            diff_id: job.diff_id.clone(),
            staged: vec![],
            reused: Some(job.descriptor.digest().to_string()),
            report: None,
        }
    }

    fn produced(
        &self,
        job: &LayerJob,
        blob: StagedBlob,
        media_type: MediaType,
        diff_id: String,
        annotations: HashMap<String, String>,
    ) -> ConvertedLayer {
        let mut descriptor = Descriptor::new(
            self.layer_media_type(job, media_type),
            blob.hash.size as i64,
            blob.hash.prefixed_hash(),
        );
        if !annotations.is_empty() {
            descriptor.set_annotations(Some(annotations));
        }
        ConvertedLayer {
            descriptor,
            diff_id,
            staged: vec![blob],
            reused: None,
            report: None,
        }
    }

    /// Decompresses the source blob into staging and checks it against the
    /// diffID recorded in the image configuration.
    fn stage_source_tar(&self, job: &LayerJob) -> anyhow::Result<StagedBlob> {
        let blob = self.source.get_blob(job.descriptor.digest())?;
        let (compression, mut reader) = Compression::open_detected(job.descriptor.media_type(), blob)?;
        debug!("Source layer is {compression}");
        let (path, mut writer) = self.staging.create(&format!("source-{}.tar", job.id))?;
        std::io::copy(&mut reader, &mut writer).context("Decompressing source layer")?;
        let staged = Staging::finish(path, writer)?;
        if staged.hash.prefixed_hash() != job.diff_id {
            return Err(integrity_error(job, &staged.hash).into());
        }
        Ok(staged)
    }

    fn decoded_hash(path: &Path, compression: Compression) -> anyhow::Result<HashAndSize> {
        let file = File::open(path).with_context(|| format!("Opening {path:?}"))?;
        hash_reader(compression.new_reader(BufReader::new(file))?).context("Decoding converted layer")
    }

    /// Re-decodes a produced blob and requires it to yield the source diffID.
    fn verify(&self, job: &LayerJob, blob: &StagedBlob, compression: Compression) -> anyhow::Result<()> {
        let decoded = Self::decoded_hash(&blob.path, compression)?;
        if decoded.prefixed_hash() != job.diff_id {
            return Err(integrity_error(job, &decoded).into());
        }
        Ok(())
    }

    fn report(&self, job: &LayerJob, selection: &Selection) -> Option<ConversionReport> {
        self.options.debug().then(|| {
            ConversionReport::new(
                self.options.target(),
                selection,
                job.descriptor.digest().as_str(),
                job.platform.as_str(),
            )
        })
    }

    pub fn convert(&self, job: &LayerJob) -> anyhow::Result<ConvertedLayer> {
        if self.cancel.is_cancelled() {
            return Err(ConvertError::Cancelled.into());
        }
        let span = info_span!(
            "layer",
            digest = %job.descriptor.digest(),
            platform = %job.platform,
            format = %self.options.target()
        );
        let _entered = span.enter();

        let converted = match self.strategy {
            LayerStrategy::Passthrough => self.reused(job),
            LayerStrategy::Soci { min_layer_size } => self.soci(job, *min_layer_size)?,
            LayerStrategy::Uncompressed => {
                let tar = self.stage_source_tar(job)?;
                self.produced(job, tar, MediaType::ImageLayer, job.diff_id.clone(), HashMap::new())
            }
            LayerStrategy::Zstd(selection) => {
                let tar = self.stage_source_tar(job)?;
                let (path, mut writer) = self.staging.create(&format!("layer-{}.tar.zst", job.id))?;
                {
                    let file = File::open(&tar.path)?;
                    let content = new_mmap(&file, true)?;
                    selection
                        .backend
                        .compress_frame(selection.effective_level, &content, &mut writer)
                        .with_context(|| format!("Compressing with {}", selection.backend))?;
                }
                let blob = Staging::finish(path, writer)?;
                std::fs::remove_file(&tar.path)?;
                self.verify(job, &blob, Compression::Zstd)?;
                let mut converted =
                    self.produced(job, blob, MediaType::ImageLayerZstd, job.diff_id.clone(), HashMap::new());
                converted.report = self.report(job, selection);
                converted
            }
            LayerStrategy::ZstdChunked {
                selection,
                chunk_size,
                prioritized,
            } => {
                let tar = self.stage_source_tar(job)?;
                let (path, mut writer) = self.staging.create(&format!("layer-{}.tar.zst", job.id))?;
                let annotations = {
                    let file = File::open(&tar.path)?;
                    let content = new_mmap(&file, false)?;
                    write_chunked(
                        &content,
                        &selection.backend,
                        selection.effective_level,
                        *chunk_size,
                        prioritized,
                        &mut writer,
                    )?
                };
                let blob = Staging::finish(path, writer)?;
                std::fs::remove_file(&tar.path)?;
                self.verify(job, &blob, Compression::Zstd)?;
                let mut converted =
                    self.produced(job, blob, MediaType::ImageLayerZstd, job.diff_id.clone(), annotations);
                converted.report = self.report(job, selection);
                converted
            }
            LayerStrategy::External { format, level } => self.external(job, *format, *level)?,
        };
        info!(
            "Converted to {} ({})",
            converted.descriptor.digest(),
            crate::progress::display_bytes(converted.descriptor.size() as u64)
        );
        Ok(converted)
    }

    fn build(
        &self,
        job: &LayerJob,
        format: TargetFormat,
        level: Option<i32>,
        tar: &StagedBlob,
        output: &Path,
    ) -> anyhow::Result<super::builder::BuildOutput> {
        let work_dir = self.staging.path().join(format!("work-{}", job.id));
        std::fs::create_dir_all(&work_dir).with_context(|| format!("Creating {work_dir:?}"))?;
        let output = self.builder.build(&BuildRequest {
            format,
            source_tar: &tar.path,
            output,
            work_dir: &work_dir,
            level,
            params: self.options.params(),
        })?;
        std::fs::remove_dir_all(&work_dir).with_context(|| format!("Removing {work_dir:?}"))?;
        Ok(output)
    }

    fn external(&self, job: &LayerJob, format: TargetFormat, level: Option<i32>) -> anyhow::Result<ConvertedLayer> {
        let tar = self.stage_source_tar(job)?;
        let output = self.staging.path().join(format!("layer-{}.{format}", job.id));
        let built = self.build(job, format, level, &tar, &output)?;
        std::fs::remove_file(&tar.path)?;
        let blob = StagedBlob {
            hash: hash_file(&output)?,
            path: output,
        };

        let diff_id = match format {
            TargetFormat::Estargz => {
                let decoded = Self::decoded_hash(&blob.path, Compression::Gzip)?;
                let keep = self.options.params().estargz.keep_diff_id;
                let reported_mismatch = built
                    .diff_id
                    .as_ref()
                    .is_some_and(|reported| *reported != decoded.prefixed_hash());
                if (keep && decoded.prefixed_hash() != job.diff_id) || reported_mismatch {
                    return Err(integrity_error(job, &decoded).into());
                }
                decoded.prefixed_hash()
            }
            _ => built
                .diff_id
                .clone()
                .unwrap_or_else(|| blob.hash.prefixed_hash()),
        };
        Ok(self.produced(job, blob, built.media_type, diff_id, built.annotations))
    }

    fn soci(&self, job: &LayerJob, min_layer_size: u64) -> anyhow::Result<ConvertedLayer> {
        let mut converted = self.reused(job);
        let size = job.descriptor.size().max(0) as u64;
        if size < min_layer_size {
            debug!("Layer below {min_layer_size} bytes, no span index");
            return Ok(converted);
        }
        let tar = self.stage_source_tar(job)?;
        let output = self.staging.path().join(format!("ztoc-{}", job.id));
        self.build(job, TargetFormat::Soci, None, &tar, &output)?;
        std::fs::remove_file(&tar.path)?;
        let ztoc = StagedBlob {
            hash: hash_file(&output)?,
            path: output,
        };
        let mut annotations = converted.descriptor.annotations().clone().unwrap_or_default();
        annotations.insert(SOCI_ZTOC_ANNOTATION.to_string(), ztoc.hash.prefixed_hash());
        converted.descriptor.set_annotations(Some(annotations));
        converted.staged.push(ztoc);
        Ok(converted)
    }
}
