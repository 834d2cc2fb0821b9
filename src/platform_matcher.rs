use crate::options::PlatformFilter;
use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use oci_spec::image::Platform;
use std::fmt::{Display, Formatter};
use tracing::{debug, instrument};

#[derive(Debug)]
pub struct PlatformMatcher {
    patterns: Vec<String>,
    globs: GlobSet,
    exclude: GlobMatcher,
}

impl Display for PlatformMatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("PlatformMatcher: ")?;
        f.write_str(&self.patterns.join(", "))?;
        f.write_str(" (exclude: ")?;
        f.write_str(self.exclude.glob().glob())?;
        f.write_str(")")
    }
}

/// `os/arch[/variant]` of the running process, in OCI naming.
pub fn host_platform() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64le",
        "loongarch64" => "loong64",
        other => other,
    };
    format!("{os}/{arch}")
}

impl PlatformMatcher {
    pub fn from_filter(filter: &PlatformFilter) -> anyhow::Result<Self> {
        let patterns = match filter {
            PlatformFilter::Host => vec![host_platform()],
            PlatformFilter::All => vec!["*".to_string()],
            PlatformFilter::List(patterns) => patterns.clone(),
        };
        debug!("Creating platform matcher for patterns: {}", patterns.join(", "));

        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            builder.add(
                GlobBuilder::new(pattern)
                    .case_insensitive(true)
                    .literal_separator(false)
                    .build()?,
            );
        }
        let exclude = GlobBuilder::new("unknown/*")
            .case_insensitive(true)
            .literal_separator(false)
            .build()?;

        Ok(Self {
            patterns,
            globs: builder.build()?,
            exclude: exclude.compile_matcher(),
        })
    }

    #[instrument(level = "debug", skip(self))]
    pub fn matches_str(&self, os: &str, arch: &str, variant: &str) -> bool {
        let os = os.to_ascii_lowercase();
        let arch = arch.to_ascii_lowercase();
        let variant = variant.to_ascii_lowercase();

        let os_arch = format!("{}/{}", os, arch);
        let os_arch_variant = format!("{}/{}/{}", os, arch, variant);

        if self.exclude.is_match(&os_arch_variant) || self.exclude.is_match(&os_arch) {
            debug!("Platform is excluded");
            return false;
        }

        let result = self.globs.is_match(&os_arch) || self.globs.is_match(&os_arch_variant);
        if result {
            debug!("Platform matched");
        } else {
            debug!("Platform does not match");
        }
        result
    }

    /// Entries without a platform belong to single-platform images and always match.
    pub fn matches_platform(&self, platform: Option<&Platform>) -> bool {
        match platform {
            Some(platform) => {
                let variant = platform.variant().as_deref().unwrap_or("unknown");
                self.matches_str(
                    &platform.os().to_string(),
                    &platform.architecture().to_string(),
                    variant,
                )
            }
            None => true,
        }
    }
}

/// Short `os/arch[/variant]` label for logs and reports.
pub fn platform_label(platform: Option<&Platform>) -> String {
    match platform {
        Some(platform) => match platform.variant() {
            Some(variant) => format!("{}/{}/{}", platform.os(), platform.architecture(), variant),
            None => format!("{}/{}", platform.os(), platform.architecture()),
        },
        None => "default".to_string(),
    }
}
