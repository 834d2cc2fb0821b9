//! Chooses the zstd encoder and the effective level for one compression step.
//!
//! The decision itself is the pure function [`select`]; [`BackendSelector`]
//! only adds the cached native availability probe around it.

use crate::compression::backend::{BackendKind, CompressionBackend};
use crate::error::ConvertError;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Worker count used by the encoders and the layer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Workers {
    /// Host parallelism.
    #[default]
    Auto,
    /// Fixed count. `1` is the deterministic sequential mode.
    Fixed(NonZeroUsize),
}

impl Workers {
    pub fn sequential() -> Self {
        Self::Fixed(NonZeroUsize::MIN)
    }

    pub fn parse(value: &str) -> Result<Self, ConvertError> {
        value
            .trim()
            .parse::<NonZeroUsize>()
            .map(Self::Fixed)
            .map_err(|_| ConvertError::validation(format!("worker count must be a positive integer, got {value:?}")))
    }

    pub fn count(self) -> usize {
        match self {
            Workers::Auto => std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            Workers::Fixed(count) => count.get(),
        }
    }
}

/// Result of one selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub backend: CompressionBackend,
    pub requested_level: i32,
    pub effective_level: i32,
    pub capped: bool,
}

/// Pure backend decision.
///
/// A forced kind is binding; without one the native backend is preferred
/// whenever it is available. Levels above the backend maximum are capped,
/// levels below one are rejected.
pub fn select(
    requested_level: i32,
    forced: Option<BackendKind>,
    native_available: bool,
    workers: usize,
) -> Result<Selection, ConvertError> {
    if requested_level < 1 {
        return Err(ConvertError::validation(format!(
            "zstd compression level must be at least 1, got {requested_level}"
        )));
    }
    let backend = match forced {
        Some(BackendKind::Native) if !native_available => {
            return Err(ConvertError::UnavailableBackend {
                kind: BackendKind::Native,
                reason: "libzstd not available in this build or on this host",
            })
        }
        Some(BackendKind::Native) => CompressionBackend::native(workers),
        Some(BackendKind::Software) => CompressionBackend::software(workers),
        None if native_available => CompressionBackend::native(workers),
        None => CompressionBackend::software(workers),
    };
    let capped = requested_level > backend.max_level;
    Ok(Selection {
        backend,
        requested_level,
        effective_level: requested_level.min(backend.max_level),
        capped,
    })
}

/// Answers whether the native encoder can run here.
pub trait NativeProbe: Send + Sync {
    fn probe(&self) -> bool;
}

/// Probes the linked libzstd once per process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibzstdProbe;

impl NativeProbe for LibzstdProbe {
    fn probe(&self) -> bool {
        static AVAILABLE: OnceLock<bool> = OnceLock::new();
        *AVAILABLE.get_or_init(|| {
            let available = cfg!(feature = "native-zstd") && zstd::zstd_safe::CCtx::try_create().is_some();
            debug!(available, "Probed libzstd");
            available
        })
    }
}

pub struct BackendSelector {
    probe: Arc<dyn NativeProbe>,
    native_available: OnceLock<bool>,
    workers: Workers,
}

impl BackendSelector {
    pub fn new(probe: Arc<dyn NativeProbe>, workers: Workers) -> Self {
        Self {
            probe,
            native_available: OnceLock::new(),
            workers,
        }
    }

    pub fn system(workers: Workers) -> Self {
        Self::new(Arc::new(LibzstdProbe), workers)
    }

    pub fn workers(&self) -> Workers {
        self.workers
    }

    pub fn native_available(&self) -> bool {
        *self.native_available.get_or_init(|| self.probe.probe())
    }

    pub fn select(&self, requested_level: i32, forced: Option<BackendKind>) -> Result<Selection, ConvertError> {
        let selection = select(
            requested_level,
            forced,
            self.native_available(),
            self.workers.count(),
        )?;
        if selection.capped {
            warn!(
                "Requested zstd level {} exceeds maximum {} for {}, using {}",
                selection.requested_level,
                selection.backend.max_level,
                selection.backend,
                selection.effective_level
            );
        }
        Ok(selection)
    }
}
