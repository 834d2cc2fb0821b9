use crate::compression::backend::BackendKind;
use crate::compression::selector::Selection;
use crate::options::TargetFormat;
use itertools::Itertools;
use std::fmt::{Display, Formatter};

/// One compression decision taken while converting a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionReport {
    pub format: TargetFormat,
    pub backend: BackendKind,
    pub implementation: &'static str,
    pub requested_level: i32,
    pub effective_level: i32,
    pub max_level: i32,
    pub capped: bool,
    pub layer: String,
    pub platform: String,
}

impl ConversionReport {
    pub fn new(format: TargetFormat, selection: &Selection, layer: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            format,
            backend: selection.backend.kind,
            implementation: selection.backend.name(),
            requested_level: selection.requested_level,
            effective_level: selection.effective_level,
            max_level: selection.backend.max_level,
            capped: selection.capped,
            layer: layer.into(),
            platform: platform.into(),
        }
    }

    fn decision(&self) -> (TargetFormat, BackendKind, i32, i32, i32, bool) {
        (
            self.format,
            self.backend,
            self.requested_level,
            self.effective_level,
            self.max_level,
            self.capped,
        )
    }
}

/// Human readable block for `--debug-compression`.
///
/// Layers that got the same decision are folded into one entry.
pub struct DebugReport<'a>(pub &'a [ConversionReport]);

impl Display for DebugReport<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Compression Debug Info ===")?;
        if self.0.is_empty() {
            return writeln!(f, "No zstd compression decisions were made");
        }
        let groups = self
            .0
            .iter()
            .into_group_map_by(|r| r.decision())
            .into_iter()
            .sorted_by_key(|(decision, _)| {
                self.0
                    .iter()
                    .position(|r| r.decision() == *decision)
                    .unwrap_or_default()
            })
            .collect_vec();
        for (idx, (_, reports)) in groups.iter().enumerate() {
            let report = reports[0];
            if idx > 0 {
                writeln!(f)?;
            }
            writeln!(f, "Implementation: {} ({})", report.backend, report.implementation)?;
            writeln!(f, "Requested {} Level: {}", report.format, report.requested_level)?;
            writeln!(f, "Effective Level: {}", report.effective_level)?;
            writeln!(f, "Max Compression Level: {}", report.max_level)?;
            if report.capped {
                writeln!(
                    f,
                    "Warning: requested level {} exceeds maximum {} for {}, capped to {}",
                    report.requested_level, report.max_level, report.implementation, report.effective_level
                )?;
            }
            let platforms = reports.iter().map(|r| r.platform.as_str()).unique().join(", ");
            writeln!(f, "Layers: {} ({platforms})", reports.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::selector::select;

    fn report(format: TargetFormat, selection: &Selection, layer: &str) -> ConversionReport {
        ConversionReport::new(format, selection, layer, "linux/amd64")
    }

    #[test]
    fn capped_software_selection() {
        let selection = select(15, Some(BackendKind::Software), true, 1).unwrap();
        let reports = [report(TargetFormat::Zstd, &selection, "sha256:aa")];
        let text = DebugReport(&reports).to_string();
        assert!(text.starts_with("=== Compression Debug Info ===\n"));
        assert!(text.contains("Implementation: software (ruzstd (pure Rust))"));
        assert!(text.contains("Requested zstd Level: 15"));
        assert!(text.contains("Effective Level: 11"));
        assert!(text.contains("Max Compression Level: 11"));
        assert!(text.contains("exceeds maximum"));
        assert!(text.contains("Layers: 1 (linux/amd64)"));
    }

    #[test]
    fn uncapped_native_selection() {
        let selection = select(22, None, true, 1).unwrap();
        let reports = [report(TargetFormat::ZstdChunked, &selection, "sha256:aa")];
        let text = DebugReport(&reports).to_string();
        assert!(text.contains("Implementation: native (libzstd (native))"));
        assert!(text.contains("Requested zstd:chunked Level: 22"));
        assert!(text.contains("Max Compression Level: 22"));
        assert!(!text.contains("exceeds maximum"));
    }

    #[test]
    fn identical_decisions_are_folded() {
        let first = select(3, None, false, 1).unwrap();
        let second = select(19, None, false, 1).unwrap();
        let reports = [
            report(TargetFormat::Zstd, &first, "sha256:aa"),
            report(TargetFormat::Zstd, &first, "sha256:bb"),
            report(TargetFormat::Zstd, &second, "sha256:cc"),
        ];
        let text = DebugReport(&reports).to_string();
        assert_eq!(text.matches("Implementation:").count(), 2);
        assert!(text.contains("Layers: 2 (linux/amd64)"));
        assert!(text.find("Requested zstd Level: 3") < text.find("Requested zstd Level: 19"));
    }

    #[test]
    fn empty_report_still_has_header() {
        let text = DebugReport(&[]).to_string();
        assert!(text.starts_with("=== Compression Debug Info ==="));
    }
}
