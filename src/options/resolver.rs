//! Merges built-in defaults, the configuration file and explicit flags.
//!
//! A flag counts as explicit when the caller set it at all, so passing the
//! default value on the command line still beats the configuration file.

use super::{
    BackendDirective, ConversionOptions, EstargzParams, FormatParams, Levels, NydusParams, OverlaybdParams,
    PlatformFilter, SociParams, TargetFormat, UnselectedPlatforms, ZstdChunkedParams,
};
use crate::config::{Config, EnvOverrides};
use crate::error::ConvertError;
use itertools::Itertools;
use std::path::PathBuf;
use tracing::debug;

const ESTARGZ_MAX_LEVEL: i32 = 9;
const NYDUS_COMPRESSORS: &[&str] = &["none", "lz4_block", "zstd"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub zstd_compression_level: i32,
    pub zstd_chunked_compression_level: i32,
    pub estargz_compression_level: i32,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            zstd_compression_level: 3,
            zstd_chunked_compression_level: 3,
            estargz_compression_level: 9,
        }
    }
}

/// Flags as the caller gave them. `None` and `false` mean "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFlags {
    pub zstd: bool,
    pub zstdchunked: bool,
    pub estargz: bool,
    pub nydus: bool,
    pub overlaybd: bool,
    pub soci: bool,
    pub uncompress: bool,
    pub oci: bool,

    pub zstd_compression_level: Option<i32>,
    pub zstdchunked_compression_level: Option<i32>,
    pub zstdchunked_chunk_size: Option<i64>,
    pub zstdchunked_record_in: Option<PathBuf>,

    pub estargz_compression_level: Option<i32>,
    pub estargz_chunk_size: Option<i64>,
    pub estargz_min_chunk_size: Option<i64>,
    pub estargz_record_in: Option<PathBuf>,
    pub estargz_external_toc: bool,
    pub estargz_keep_diff_id: bool,

    pub nydus_builder_path: Option<PathBuf>,
    pub nydus_work_dir: Option<PathBuf>,
    pub nydus_prefetch_patterns: Option<String>,
    pub nydus_compressor: Option<String>,

    pub overlaybd_fs_type: Option<String>,
    pub overlaybd_dbstr: Option<String>,

    pub soci_min_layer_size: Option<i64>,
    pub soci_span_size: Option<i64>,

    pub platforms: Vec<String>,
    pub all_platforms: bool,
    pub keep_unselected_platforms: bool,
    pub debug_compression: bool,
}

pub fn resolve(
    defaults: &Defaults,
    config: &Config,
    env: &EnvOverrides,
    flags: &RequestFlags,
) -> Result<ConversionOptions, ConvertError> {
    let target = resolve_target(flags)?;

    let levels = Levels {
        zstd: flags
            .zstd_compression_level
            .or(config.compression.zstd_compression_level)
            .unwrap_or(defaults.zstd_compression_level),
        zstd_chunked: flags
            .zstdchunked_compression_level
            .or(config.compression.zstd_chunked_compression_level)
            .unwrap_or(defaults.zstd_chunked_compression_level),
        estargz: flags
            .estargz_compression_level
            .unwrap_or(defaults.estargz_compression_level),
    };
    validate_level(target, &levels)?;

    let params = FormatParams {
        zstd_chunked: ZstdChunkedParams {
            chunk_size: non_negative("zstdchunked-chunk-size", flags.zstdchunked_chunk_size)?,
            record_in: flags.zstdchunked_record_in.clone(),
        },
        estargz: EstargzParams {
            chunk_size: non_negative("estargz-chunk-size", flags.estargz_chunk_size)?,
            min_chunk_size: non_negative("estargz-min-chunk-size", flags.estargz_min_chunk_size)?,
            record_in: flags.estargz_record_in.clone(),
            external_toc: flags.estargz_external_toc,
            keep_diff_id: flags.estargz_keep_diff_id,
        },
        nydus: NydusParams {
            builder_path: flags.nydus_builder_path.clone(),
            work_dir: flags.nydus_work_dir.clone(),
            prefetch_patterns: split_patterns(flags.nydus_prefetch_patterns.as_deref()),
            compressor: nydus_compressor(flags.nydus_compressor.as_deref())?,
        },
        overlaybd: OverlaybdParams {
            fs_type: non_empty(flags.overlaybd_fs_type.as_deref()),
            dbstr: non_empty(flags.overlaybd_dbstr.as_deref()),
        },
        soci: SociParams {
            min_layer_size: builder_default_or_size("soci-min-layer-size", flags.soci_min_layer_size, false)?,
            span_size: builder_default_or_size("soci-span-size", flags.soci_span_size, true)?,
        },
    };

    let platforms = resolve_platforms(flags)?;
    let unselected = if flags.keep_unselected_platforms {
        UnselectedPlatforms::PassThrough
    } else {
        UnselectedPlatforms::Exclude
    };

    let backend = BackendDirective {
        forced: match env.force_implementation {
            Some(kind) => Some(kind),
            None => config.preferred_implementation()?,
        },
        workers: env.workers,
    };

    let options = ConversionOptions {
        target,
        levels,
        params,
        oci: flags.oci,
        platforms,
        unselected,
        debug: flags.debug_compression,
        backend,
    };
    debug!(?options, "Resolved conversion options");
    Ok(options)
}

fn resolve_target(flags: &RequestFlags) -> Result<TargetFormat, ConvertError> {
    let selected = [
        (flags.zstd, TargetFormat::Zstd),
        (flags.zstdchunked, TargetFormat::ZstdChunked),
        (flags.estargz, TargetFormat::Estargz),
        (flags.nydus, TargetFormat::Nydus),
        (flags.overlaybd, TargetFormat::Overlaybd),
        (flags.soci, TargetFormat::Soci),
        (flags.uncompress, TargetFormat::Uncompressed),
    ]
    .into_iter()
    .filter_map(|(enabled, format)| enabled.then_some(format))
    .collect_vec();

    match selected.as_slice() {
        [] if flags.oci => Ok(TargetFormat::OciPlain),
        [] => Err(ConvertError::validation(
            "no target format selected (use one of --zstd, --zstdchunked, --estargz, --nydus, --overlaybd, --soci, --uncompress or --oci)",
        )),
        [format] => Ok(*format),
        formats => Err(ConvertError::validation(format!(
            "options {} are mutually exclusive",
            formats.iter().map(|f| format!("--{}", f.flag())).join(", ")
        ))),
    }
}

/// Checks the level the target compresses with. Levels of other formats
/// are never used, so a stale configured value for them is not an error.
fn validate_level(target: TargetFormat, levels: &Levels) -> Result<(), ConvertError> {
    let (name, level) = match target {
        TargetFormat::Zstd => ("zstd-compression-level", levels.zstd),
        TargetFormat::ZstdChunked => ("zstdchunked-compression-level", levels.zstd_chunked),
        TargetFormat::Estargz => {
            if !(1..=ESTARGZ_MAX_LEVEL).contains(&levels.estargz) {
                return Err(ConvertError::validation(format!(
                    "estargz-compression-level must be between 1 and {ESTARGZ_MAX_LEVEL}, got {}",
                    levels.estargz
                )));
            }
            return Ok(());
        }
        _ => return Ok(()),
    };
    if level < 1 {
        return Err(ConvertError::validation(format!(
            "{name} must be a positive integer, got {level}"
        )));
    }
    Ok(())
}

fn non_negative(name: &str, value: Option<i64>) -> Result<u64, ConvertError> {
    match value {
        None => Ok(0),
        Some(v) if v >= 0 => Ok(v as u64),
        Some(v) => Err(ConvertError::validation(format!("{name} must not be negative, got {v}"))),
    }
}

/// `-1` (or unset) defers to the builder's default.
fn builder_default_or_size(name: &str, value: Option<i64>, positive: bool) -> Result<Option<u64>, ConvertError> {
    match value {
        None | Some(-1) => Ok(None),
        Some(0) if positive => Err(ConvertError::validation(format!("{name} must be positive or -1"))),
        Some(v) if v >= 0 => Ok(Some(v as u64)),
        Some(v) => Err(ConvertError::validation(format!("{name} must be -1 or non-negative, got {v}"))),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

fn split_patterns(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(['\n', ','])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn nydus_compressor(value: Option<&str>) -> Result<Option<String>, ConvertError> {
    match non_empty(value) {
        Some(name) if !NYDUS_COMPRESSORS.contains(&name.as_str()) => Err(ConvertError::validation(format!(
            "nydus-compressor must be one of {}, got {name:?}",
            NYDUS_COMPRESSORS.join(", ")
        ))),
        other => Ok(other),
    }
}

fn resolve_platforms(flags: &RequestFlags) -> Result<PlatformFilter, ConvertError> {
    let patterns = flags
        .platforms
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect_vec();
    match (flags.all_platforms, patterns.is_empty()) {
        (true, false) => Err(ConvertError::validation(
            "--all-platforms and --platform are mutually exclusive",
        )),
        (true, true) => Ok(PlatformFilter::All),
        (false, true) => Ok(PlatformFilter::Host),
        (false, false) => {
            for pattern in &patterns {
                globset::Glob::new(pattern)
                    .map_err(|e| ConvertError::validation(format!("invalid platform {pattern:?}: {e}")))?;
            }
            Ok(PlatformFilter::List(patterns))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::backend::BackendKind;
    use crate::compression::selector::Workers;
    use crate::config::CompressionConfig;

    fn config(implementation: Option<&str>, zstd: Option<i32>, chunked: Option<i32>) -> Config {
        Config {
            compression: CompressionConfig {
                zstd_implementation: implementation.map(str::to_string),
                zstd_compression_level: zstd,
                zstd_chunked_compression_level: chunked,
            },
        }
    }

    fn zstd_flags() -> RequestFlags {
        RequestFlags {
            zstd: true,
            oci: true,
            ..Default::default()
        }
    }

    fn resolve_with(config: &Config, flags: &RequestFlags) -> Result<ConversionOptions, ConvertError> {
        resolve(&Defaults::default(), config, &EnvOverrides::default(), flags)
    }

    #[test]
    fn config_levels_used_when_flags_absent() {
        let options = resolve_with(&config(Some("software"), Some(11), Some(22)), &zstd_flags()).unwrap();
        assert_eq!(options.levels().zstd, 11);
        assert_eq!(options.levels().zstd_chunked, 22);
        assert_eq!(options.requested_level(), Some(11));
    }

    #[test]
    fn explicit_flags_override_config() {
        let flags = RequestFlags {
            zstd_compression_level: Some(5),
            zstdchunked_compression_level: Some(7),
            ..zstd_flags()
        };
        let options = resolve_with(&config(Some("software"), Some(11), Some(22)), &flags).unwrap();
        assert_eq!(options.levels().zstd, 5);
        assert_eq!(options.levels().zstd_chunked, 7);
    }

    #[test]
    fn explicit_flag_equal_to_default_still_overrides() {
        let flags = RequestFlags {
            zstd_compression_level: Some(Defaults::default().zstd_compression_level),
            ..zstd_flags()
        };
        let options = resolve_with(&config(None, Some(11), None), &flags).unwrap();
        assert_eq!(options.levels().zstd, 3);
    }

    #[test]
    fn defaults_when_nothing_configured() {
        let options = resolve_with(&Config::default(), &zstd_flags()).unwrap();
        assert_eq!(options.levels().zstd, 3);
        assert_eq!(options.levels().zstd_chunked, 3);
        assert_eq!(options.levels().estargz, 9);
        assert_eq!(options.platforms(), &PlatformFilter::Host);
        assert_eq!(options.backend(), BackendDirective::default());
        assert!(!options.debug());
    }

    #[test]
    fn two_formats_are_rejected() {
        let flags = RequestFlags {
            nydus: true,
            ..zstd_flags()
        };
        let error = resolve_with(&Config::default(), &flags).unwrap_err();
        assert!(matches!(error, ConvertError::Validation(_)));
        assert!(error.to_string().contains("--zstd, --nydus"));
    }

    #[test]
    fn format_selection() {
        let oci_only = RequestFlags {
            oci: true,
            ..Default::default()
        };
        assert_eq!(
            resolve_with(&Config::default(), &oci_only).unwrap().target(),
            TargetFormat::OciPlain
        );
        let uncompress = RequestFlags {
            uncompress: true,
            ..Default::default()
        };
        assert_eq!(
            resolve_with(&Config::default(), &uncompress).unwrap().target(),
            TargetFormat::Uncompressed
        );
        assert!(resolve_with(&Config::default(), &RequestFlags::default()).is_err());
    }

    #[test]
    fn out_of_range_values_fail_instead_of_clamping() {
        for flags in [
            RequestFlags {
                zstd_compression_level: Some(0),
                ..zstd_flags()
            },
            RequestFlags {
                zstdchunked_chunk_size: Some(-5),
                ..zstd_flags()
            },
            RequestFlags {
                estargz: true,
                estargz_compression_level: Some(10),
                ..Default::default()
            },
            RequestFlags {
                soci_span_size: Some(0),
                ..zstd_flags()
            },
            RequestFlags {
                soci_min_layer_size: Some(-2),
                ..zstd_flags()
            },
            RequestFlags {
                nydus_compressor: Some("brotli".to_string()),
                ..zstd_flags()
            },
        ] {
            assert!(
                matches!(resolve_with(&Config::default(), &flags), Err(ConvertError::Validation(_))),
                "{flags:?} should be rejected"
            );
        }
    }

    #[test]
    fn only_the_target_level_is_validated() {
        let stale = config(None, Some(0), Some(0));
        for flags in [
            RequestFlags {
                nydus: true,
                ..Default::default()
            },
            RequestFlags {
                soci: true,
                ..Default::default()
            },
            RequestFlags {
                zstd: true,
                estargz_compression_level: Some(42),
                zstd_compression_level: Some(3),
                ..Default::default()
            },
        ] {
            assert!(resolve_with(&stale, &flags).is_ok(), "{flags:?} should resolve");
        }
        let chunked = RequestFlags {
            zstdchunked: true,
            ..Default::default()
        };
        assert!(matches!(
            resolve_with(&stale, &chunked),
            Err(ConvertError::Validation(message)) if message.contains("zstdchunked-compression-level")
        ));
    }

    #[test]
    fn zstd_levels_above_backend_max_are_left_for_the_selector() {
        let flags = RequestFlags {
            zstd_compression_level: Some(30),
            ..zstd_flags()
        };
        assert_eq!(resolve_with(&Config::default(), &flags).unwrap().levels().zstd, 30);
    }

    #[test]
    fn platform_filters() {
        let conflicting = RequestFlags {
            all_platforms: true,
            platforms: vec!["linux/amd64".to_string()],
            ..zstd_flags()
        };
        assert!(resolve_with(&Config::default(), &conflicting).is_err());

        let all = RequestFlags {
            all_platforms: true,
            ..zstd_flags()
        };
        assert_eq!(resolve_with(&Config::default(), &all).unwrap().platforms(), &PlatformFilter::All);

        let list = RequestFlags {
            platforms: vec!["linux/arm64".to_string(), " ".to_string()],
            keep_unselected_platforms: true,
            ..zstd_flags()
        };
        let options = resolve_with(&Config::default(), &list).unwrap();
        assert_eq!(
            options.platforms(),
            &PlatformFilter::List(vec!["linux/arm64".to_string()])
        );
        assert_eq!(options.unselected(), UnselectedPlatforms::PassThrough);
    }

    #[test]
    fn environment_beats_configured_implementation() {
        let env = EnvOverrides {
            force_implementation: Some(BackendKind::Native),
            workers: Workers::sequential(),
        };
        let options = resolve(
            &Defaults::default(),
            &config(Some("software"), None, None),
            &env,
            &zstd_flags(),
        )
        .unwrap();
        assert_eq!(options.backend().forced, Some(BackendKind::Native));
        assert_eq!(options.backend().workers, Workers::sequential());

        let options = resolve_with(&config(Some("software"), None, None), &zstd_flags()).unwrap();
        assert_eq!(options.backend().forced, Some(BackendKind::Software));

        assert!(resolve_with(&config(Some("snappy"), None, None), &zstd_flags()).is_err());
    }

    #[test]
    fn auxiliary_parameters() {
        let flags = RequestFlags {
            nydus: true,
            zstd: false,
            nydus_prefetch_patterns: Some("/usr/bin\n/etc, /lib".to_string()),
            nydus_compressor: Some("zstd".to_string()),
            soci_min_layer_size: Some(-1),
            soci_span_size: Some(1 << 20),
            ..zstd_flags()
        };
        let options = resolve_with(&Config::default(), &flags).unwrap();
        assert_eq!(options.target(), TargetFormat::Nydus);
        assert_eq!(options.requested_level(), None);
        assert_eq!(options.params().nydus.prefetch_patterns, vec!["/usr/bin", "/etc", "/lib"]);
        assert_eq!(options.params().nydus.compressor.as_deref(), Some("zstd"));
        assert_eq!(options.params().soci.min_layer_size, None);
        assert_eq!(options.params().soci.span_size, Some(1 << 20));
    }
}
