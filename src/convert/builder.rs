//! Formats whose encoders live outside this process.

use crate::error::ConvertError;
use crate::media_type;
use crate::options::{FormatParams, TargetFormat};
use anyhow::{bail, Context};
use oci_spec::image::MediaType;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, instrument};

/// Everything a builder needs to turn one layer tar into a blob.
#[derive(Debug)]
pub struct BuildRequest<'a> {
    pub format: TargetFormat,
    /// Uncompressed layer tar.
    pub source_tar: &'a Path,
    /// Where the blob must be written.
    pub output: &'a Path,
    /// Scratch space private to this request.
    pub work_dir: &'a Path,
    pub level: Option<i32>,
    pub params: &'a FormatParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    pub media_type: MediaType,
    /// diffID as reported by the builder, if it reported one.
    pub diff_id: Option<String>,
    pub annotations: HashMap<String, String>,
}

pub trait ExternalBuilder: Send + Sync {
    fn build(&self, request: &BuildRequest<'_>) -> anyhow::Result<BuildOutput>;
}

/// Runs the format's command line tool.
///
/// Tools may print `diff-id <digest>` and `annotation <key>=<value>` lines
/// on stdout; anything else is logged and ignored.
#[derive(Debug, Clone, Default)]
pub struct CommandBuilder {
    programs: HashMap<TargetFormat, PathBuf>,
}

impl CommandBuilder {
    pub fn with_program(mut self, format: TargetFormat, program: impl Into<PathBuf>) -> Self {
        self.programs.insert(format, program.into());
        self
    }

    fn program(&self, request: &BuildRequest<'_>) -> anyhow::Result<PathBuf> {
        if let Some(program) = self.programs.get(&request.format) {
            return Ok(program.clone());
        }
        Ok(PathBuf::from(match request.format {
            TargetFormat::Estargz => "stargz-build",
            TargetFormat::Nydus => {
                return Ok(request
                    .params
                    .nydus
                    .builder_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("nydus-image")))
            }
            TargetFormat::Overlaybd => "overlaybd-build",
            TargetFormat::Soci => "soci-ztoc",
            other => bail!("{other} is not built by an external tool"),
        }))
    }

    fn command(&self, request: &BuildRequest<'_>) -> anyhow::Result<Command> {
        let mut command = Command::new(self.program(request)?);
        let params = request.params;
        match request.format {
            TargetFormat::Estargz => {
                let estargz = &params.estargz;
                if let Some(level) = request.level {
                    command.arg("--compression-level").arg(level.to_string());
                }
                if estargz.chunk_size > 0 {
                    command.arg("--chunk-size").arg(estargz.chunk_size.to_string());
                }
                if estargz.min_chunk_size > 0 {
                    command.arg("--min-chunk-size").arg(estargz.min_chunk_size.to_string());
                }
                if let Some(record_in) = &estargz.record_in {
                    command.arg("--record-in").arg(record_in);
                }
                if estargz.external_toc {
                    command.arg("--external-toc");
                }
                command.arg(request.source_tar).arg(request.output);
            }
            TargetFormat::Nydus => {
                let nydus = &params.nydus;
                let work_dir = nydus_work_dir(request);
                std::fs::create_dir_all(&work_dir).with_context(|| format!("Creating {work_dir:?}"))?;
                command
                    .arg("create")
                    .arg("--type")
                    .arg("tar-rafs")
                    .arg("--blob")
                    .arg(request.output)
                    .arg("--bootstrap")
                    .arg(work_dir.join("bootstrap"));
                if let Some(compressor) = &nydus.compressor {
                    command.arg("--compressor").arg(compressor);
                }
                if !nydus.prefetch_patterns.is_empty() {
                    let list = work_dir.join("prefetch-patterns");
                    std::fs::write(&list, nydus.prefetch_patterns.join("\n"))
                        .with_context(|| format!("Writing {list:?}"))?;
                    command.arg("--prefetch-policy").arg("fs").arg("--prefetch-list").arg(list);
                }
                command.arg(request.source_tar);
            }
            TargetFormat::Overlaybd => {
                let overlaybd = &params.overlaybd;
                if let Some(fs_type) = &overlaybd.fs_type {
                    command.arg("--fstype").arg(fs_type);
                }
                if let Some(dbstr) = &overlaybd.dbstr {
                    command.arg("--dbstr").arg(dbstr);
                }
                command.arg(request.source_tar).arg(request.output);
            }
            TargetFormat::Soci => {
                let soci = &params.soci;
                if let Some(span_size) = soci.span_size {
                    command.arg("--span-size").arg(span_size.to_string());
                }
                command.arg(request.source_tar).arg(request.output);
            }
            other => bail!("{other} is not built by an external tool"),
        }
        command.current_dir(request.work_dir);
        Ok(command)
    }
}

/// Scratch directory for one nydus build. A configured work dir is shared
/// by all jobs, so each job gets its own subdirectory of it.
fn nydus_work_dir(request: &BuildRequest<'_>) -> PathBuf {
    match &request.params.nydus.work_dir {
        Some(root) => root.join(request.work_dir.file_name().unwrap_or_default()),
        None => request.work_dir.to_path_buf(),
    }
}

/// Media type of a blob produced for `format`.
pub fn output_media_type(format: TargetFormat) -> MediaType {
    match format {
        TargetFormat::Estargz => MediaType::ImageLayerGzip,
        TargetFormat::Nydus => MediaType::Other(media_type::NYDUS_BLOB.to_string()),
        TargetFormat::Overlaybd => MediaType::ImageLayer,
        TargetFormat::Soci => MediaType::Other(media_type::SOCI_ZTOC.to_string()),
        TargetFormat::Zstd | TargetFormat::ZstdChunked => MediaType::ImageLayerZstd,
        TargetFormat::Uncompressed => MediaType::ImageLayer,
        TargetFormat::OciPlain => MediaType::ImageLayerGzip,
    }
}

fn parse_stdout(format: TargetFormat, stdout: &str) -> BuildOutput {
    let mut output = BuildOutput {
        media_type: output_media_type(format),
        diff_id: None,
        annotations: HashMap::new(),
    };
    for line in stdout.lines().map(str::trim) {
        if let Some(diff_id) = line.strip_prefix("diff-id ") {
            output.diff_id = Some(diff_id.trim().to_string());
        } else if let Some((key, value)) = line
            .strip_prefix("annotation ")
            .and_then(|a| a.split_once('='))
        {
            output.annotations.insert(key.trim().to_string(), value.trim().to_string());
        } else if !line.is_empty() {
            debug!("{format} builder: {line}");
        }
    }
    output
}

impl ExternalBuilder for CommandBuilder {
    #[instrument(skip_all, fields(format = %request.format))]
    fn build(&self, request: &BuildRequest<'_>) -> anyhow::Result<BuildOutput> {
        let mut command = self.command(request)?;
        debug!("Running {command:?}");
        let tool = command.get_program().to_string_lossy().to_string();
        let output = command.output();
        if request.format == TargetFormat::Nydus && request.params.nydus.work_dir.is_some() {
            let work_dir = nydus_work_dir(request);
            if let Err(e) = std::fs::remove_dir_all(&work_dir) {
                debug!("Could not remove {work_dir:?}: {e}");
            }
        }
        let output = output.map_err(|e| ConvertError::Builder {
            tool: tool.clone(),
            message: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(ConvertError::Builder {
                tool,
                message: format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }
            .into());
        }
        if !request.output.exists() {
            return Err(ConvertError::Builder {
                tool,
                message: format!("did not write {:?}", request.output),
            }
            .into());
        }
        Ok(parse_stdout(request.format, &String::from_utf8_lossy(&output.stdout)))
    }
}
