use crate::compression::backend::BackendKind;
use crate::compression::selector::Workers;
use std::path::PathBuf;

pub mod resolver;

pub use resolver::{resolve, Defaults, RequestFlags};

/// The single format a conversion produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum TargetFormat {
    #[strum(serialize = "zstd")]
    Zstd,
    #[strum(serialize = "zstd:chunked")]
    ZstdChunked,
    #[strum(serialize = "estargz")]
    Estargz,
    #[strum(serialize = "nydus")]
    Nydus,
    #[strum(serialize = "overlaybd")]
    Overlaybd,
    #[strum(serialize = "soci")]
    Soci,
    #[strum(serialize = "uncompressed")]
    Uncompressed,
    #[strum(serialize = "oci")]
    OciPlain,
}

impl TargetFormat {
    /// Name of the command line switch selecting this format.
    pub fn flag(&self) -> &'static str {
        match self {
            TargetFormat::Zstd => "zstd",
            TargetFormat::ZstdChunked => "zstdchunked",
            TargetFormat::Estargz => "estargz",
            TargetFormat::Nydus => "nydus",
            TargetFormat::Overlaybd => "overlaybd",
            TargetFormat::Soci => "soci",
            TargetFormat::Uncompressed => "uncompress",
            TargetFormat::OciPlain => "oci",
        }
    }

    pub fn uses_zstd_backend(&self) -> bool {
        matches!(self, TargetFormat::Zstd | TargetFormat::ZstdChunked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Levels {
    pub zstd: i32,
    pub zstd_chunked: i32,
    pub estargz: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZstdChunkedParams {
    pub chunk_size: u64,
    pub record_in: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EstargzParams {
    pub chunk_size: u64,
    pub min_chunk_size: u64,
    pub record_in: Option<PathBuf>,
    pub external_toc: bool,
    pub keep_diff_id: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NydusParams {
    pub builder_path: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub prefetch_patterns: Vec<String>,
    pub compressor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlaybdParams {
    pub fs_type: Option<String>,
    pub dbstr: Option<String>,
}

/// `None` leaves the builder's own default in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SociParams {
    pub min_layer_size: Option<u64>,
    pub span_size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatParams {
    pub zstd_chunked: ZstdChunkedParams,
    pub estargz: EstargzParams,
    pub nydus: NydusParams,
    pub overlaybd: OverlaybdParams,
    pub soci: SociParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PlatformFilter {
    /// Only the platform this process runs on.
    #[default]
    Host,
    All,
    /// `os/arch[/variant]` glob patterns.
    List(Vec<String>),
}

/// What happens to index entries the platform filter did not select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum UnselectedPlatforms {
    #[default]
    Exclude,
    PassThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendDirective {
    pub forced: Option<BackendKind>,
    pub workers: Workers,
}

/// One fully resolved conversion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOptions {
    target: TargetFormat,
    levels: Levels,
    params: FormatParams,
    oci: bool,
    platforms: PlatformFilter,
    unselected: UnselectedPlatforms,
    debug: bool,
    backend: BackendDirective,
}

impl ConversionOptions {
    pub fn target(&self) -> TargetFormat {
        self.target
    }

    pub fn levels(&self) -> Levels {
        self.levels
    }

    /// Compression level requested for the target format, if it has one.
    pub fn requested_level(&self) -> Option<i32> {
        match self.target {
            TargetFormat::Zstd => Some(self.levels.zstd),
            TargetFormat::ZstdChunked => Some(self.levels.zstd_chunked),
            TargetFormat::Estargz => Some(self.levels.estargz),
            _ => None,
        }
    }

    pub fn params(&self) -> &FormatParams {
        &self.params
    }

    pub fn oci(&self) -> bool {
        self.oci
    }

    pub fn platforms(&self) -> &PlatformFilter {
        &self.platforms
    }

    pub fn unselected(&self) -> UnselectedPlatforms {
        self.unselected
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn backend(&self) -> BackendDirective {
        self.backend
    }
}
