use anyhow::Context;
use ruzstd::encoding::CompressionLevel as SoftwareLevel;
use std::fmt::{Display, Formatter};
use std::io::Write;
use std::str::FromStr;

use crate::error::ConvertError;

/// The two zstd encoder implementations a conversion can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum BackendKind {
    /// Pure Rust encoder (`ruzstd`), always available.
    #[strum(serialize = "software")]
    Software,
    /// libzstd through the `zstd` crate.
    #[strum(serialize = "native")]
    Native,
}

impl BackendKind {
    /// Parses an implementation name. `auto` and the empty string mean no
    /// preference and yield `None`. `klauspost` and `gozstd` are accepted
    /// for configurations written for the Go tooling.
    pub fn parse_preference(value: &str) -> Result<Option<Self>, ConvertError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(None),
            "software" | "ruzstd" | "pure" | "klauspost" => Ok(Some(Self::Software)),
            "native" | "libzstd" | "zstd" | "gozstd" => Ok(Some(Self::Native)),
            other => Err(ConvertError::validation(format!(
                "unknown zstd implementation {other:?} (expected software, native or auto)"
            ))),
        }
    }
}

impl FromStr for BackendKind {
    type Err = ConvertError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse_preference(value)?
            .ok_or_else(|| ConvertError::validation("an explicit zstd implementation is required here"))
    }
}

/// One concrete zstd encoder with its capability limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionBackend {
    pub kind: BackendKind,
    pub max_level: i32,
    pub workers: usize,
}

impl Display for CompressionBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl CompressionBackend {
    pub const SOFTWARE_MAX_LEVEL: i32 = 11;
    pub const NATIVE_MAX_LEVEL: i32 = 22;

    pub fn software(workers: usize) -> Self {
        Self {
            kind: BackendKind::Software,
            max_level: Self::SOFTWARE_MAX_LEVEL,
            workers,
        }
    }

    pub fn native(workers: usize) -> Self {
        Self {
            kind: BackendKind::Native,
            max_level: Self::NATIVE_MAX_LEVEL,
            workers,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            BackendKind::Software => "ruzstd (pure Rust)",
            BackendKind::Native => "libzstd (native)",
        }
    }

    /// Compresses `input` into a single zstd frame appended to `output`.
    ///
    /// `level` must already be capped to `max_level`.
    pub fn compress_frame(&self, level: i32, input: &[u8], output: &mut impl Write) -> anyhow::Result<()> {
        debug_assert!(level >= 1 && level <= self.max_level);
        match self.kind {
            BackendKind::Software => {
                let frame = ruzstd::encoding::compress_to_vec(input, software_level(level));
                output.write_all(&frame).context("Writing ruzstd frame")?;
            }
            BackendKind::Native => {
                let mut encoder = zstd::stream::Encoder::new(output, level)?;
                if self.workers > 1 {
                    encoder.multithread(self.workers as u32)?;
                }
                encoder.include_contentsize(true)?;
                encoder.include_checksum(false)?;
                encoder.set_pledged_src_size(Some(input.len() as u64))?;
                encoder.write_all(input).context("Writing libzstd frame")?;
                encoder.finish()?;
            }
        }
        Ok(())
    }
}

// ruzstd only ships its fastest strategy; every level in the software range
// maps onto it until stronger matchers land upstream.
fn software_level(_level: i32) -> SoftwareLevel {
    SoftwareLevel::Fastest
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTENT: &[u8] = b"the quick brown fox jumps over the lazy dog, the quick brown fox";

    #[test]
    fn parses_implementation_names() {
        assert_eq!(BackendKind::parse_preference("pure").unwrap(), Some(BackendKind::Software));
        assert_eq!(BackendKind::parse_preference("RUZSTD").unwrap(), Some(BackendKind::Software));
        assert_eq!(BackendKind::parse_preference("libzstd").unwrap(), Some(BackendKind::Native));
        assert_eq!(BackendKind::parse_preference(" Native ").unwrap(), Some(BackendKind::Native));
        assert_eq!(BackendKind::parse_preference("klauspost").unwrap(), Some(BackendKind::Software));
        assert_eq!(BackendKind::parse_preference("GoZstd").unwrap(), Some(BackendKind::Native));
        assert_eq!(BackendKind::parse_preference("auto").unwrap(), None);
        assert_eq!(BackendKind::parse_preference("").unwrap(), None);
        assert!(matches!(
            BackendKind::parse_preference("lz4"),
            Err(ConvertError::Validation(_))
        ));
        assert!("auto".parse::<BackendKind>().is_err());
        assert_eq!("native".parse::<BackendKind>().unwrap(), BackendKind::Native);
    }

    #[test]
    fn software_frame_decodes_with_libzstd() {
        let mut output = vec![];
        CompressionBackend::software(1)
            .compress_frame(5, CONTENT, &mut output)
            .unwrap();
        assert_eq!(zstd::decode_all(output.as_slice()).unwrap(), CONTENT);
    }

    #[test]
    fn native_frame_round_trips() {
        let mut output = vec![];
        CompressionBackend::native(1)
            .compress_frame(19, CONTENT, &mut output)
            .unwrap();
        assert_eq!(zstd::decode_all(output.as_slice()).unwrap(), CONTENT);
    }

    #[test]
    fn frames_concatenate() {
        let mut output = vec![];
        let backend = CompressionBackend::native(1);
        backend.compress_frame(3, b"hello ", &mut output).unwrap();
        CompressionBackend::software(1)
            .compress_frame(3, b"world", &mut output)
            .unwrap();
        assert_eq!(zstd::decode_all(output.as_slice()).unwrap(), b"hello world");
    }

    #[test]
    fn names_identify_implementation() {
        assert!(CompressionBackend::software(1).to_string().contains("ruzstd"));
        assert!(CompressionBackend::native(4).to_string().contains("libzstd"));
        assert_eq!(CompressionBackend::software(1).max_level, 11);
        assert_eq!(CompressionBackend::native(1).max_level, 22);
    }
}
