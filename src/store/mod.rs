//! OCI image layout directories as content stores.

use crate::hashed_writer::{hash_file, hash_reader, raw_digest, HashAndSize};
use anyhow::{bail, Context};
use oci_spec::image::ImageIndex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::{Debug, Display, Formatter};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

mod staging;

pub use staging::{StagedBlob, Staging};

const OCI_LAYOUT: &str = "{\"imageLayoutVersion\":\"1.0.0\"}";

/// Blob access by digest.
pub trait ContentStore: Send + Sync {
    fn get_blob(&self, digest: &str) -> anyhow::Result<Box<dyn Read + Send>>;

    fn has_blob(&self, digest: &str) -> bool;

    /// Stores `content` and returns its identity.
    fn put_blob(&self, content: &[u8]) -> anyhow::Result<HashAndSize>;

    fn read_blob(&self, digest: &str) -> anyhow::Result<Vec<u8>> {
        let mut content = vec![];
        self.get_blob(digest)?
            .read_to_end(&mut content)
            .with_context(|| format!("Reading blob {digest}"))?;
        Ok(content)
    }

    fn read_json<T: DeserializeOwned>(&self, digest: &str) -> anyhow::Result<T>
    where
        Self: Sized,
    {
        let content = self.read_blob(digest)?;
        serde_json::from_slice(&content).with_context(|| format!("Parsing JSON blob {digest}"))
    }
}

/// Serializes with sorted object keys so equal values give equal digests.
pub fn to_canonical_json(item: &impl Serialize) -> anyhow::Result<Vec<u8>> {
    let value = serde_json::to_value(item).context("Converting to JSON value")?;
    serde_json::to_vec(&value).context("Serializing JSON value")
}

pub struct OciDir {
    root: PathBuf,
    blobs_dir: PathBuf,
}

impl Display for OciDir {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OciDir {}", self.root.display())
    }
}

impl Debug for OciDir {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl OciDir {
    /// Opens an existing layout.
    pub fn open(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.join("index.json").exists() {
            bail!("No index.json found in {root:?}");
        }
        Ok(Self {
            blobs_dir: root.join("blobs").join("sha256"),
            root,
        })
    }

    /// Opens or initialises a layout.
    pub fn create(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let blobs_dir = root.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir).with_context(|| format!("Creating blobs directory {blobs_dir:?}"))?;
        let layout = root.join("oci-layout");
        if !layout.exists() {
            std::fs::write(&layout, OCI_LAYOUT).with_context(|| format!("Writing {layout:?}"))?;
        }
        Ok(Self { root, blobs_dir })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.blobs_dir.join(raw_digest(digest))
    }

    /// Whether both handles point at the same directory.
    pub fn same_location(&self, other: &OciDir) -> bool {
        match (self.root.canonicalize(), other.root.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => self.root == other.root,
        }
    }

    pub fn read_index(&self) -> anyhow::Result<ImageIndex> {
        let index_path = self.root.join("index.json");
        ImageIndex::from_file(&index_path).with_context(|| format!("Error reading index from {index_path:?}"))
    }

    /// Atomically replaces `index.json`.
    pub fn write_index(&self, index: &ImageIndex) -> anyhow::Result<()> {
        let content = to_canonical_json(index)?;
        let mut file = NamedTempFile::new_in(&self.root).context("Creating temporary index")?;
        file.write_all(&content).context("Writing temporary index")?;
        file.persist(self.root.join("index.json"))
            .context("Replacing index.json")?;
        Ok(())
    }

    /// Moves a finished file into the blob directory under `hash`.
    pub fn put_blob_file(&self, path: &Path, hash: &HashAndSize) -> anyhow::Result<()> {
        let target = self.blobs_dir.join(hash.raw_hash());
        if target.exists() {
            debug!("Blob {hash} already present");
            std::fs::remove_file(path).with_context(|| format!("Removing duplicate {path:?}"))?;
            return Ok(());
        }
        std::fs::rename(path, &target).with_context(|| format!("Renaming {path:?} to {target:?}"))
    }

    /// Copies one blob from another store, verifying its digest.
    pub fn copy_blob_from(&self, source: &dyn ContentStore, digest: &str) -> anyhow::Result<()> {
        if self.has_blob(digest) {
            return Ok(());
        }
        let mut file = NamedTempFile::new_in(&self.blobs_dir).context("Creating temporary blob")?;
        let mut reader = source.get_blob(digest)?;
        std::io::copy(&mut reader, &mut file).with_context(|| format!("Copying blob {digest}"))?;
        let hash = hash_file(file.path())?;
        if hash.raw_hash() != raw_digest(digest) {
            bail!("Blob {digest} does not match its content digest {hash}");
        }
        file.persist(self.blob_path(digest))
            .with_context(|| format!("Persisting blob {digest}"))?;
        Ok(())
    }
}

impl ContentStore for OciDir {
    fn get_blob(&self, digest: &str) -> anyhow::Result<Box<dyn Read + Send>> {
        let path = self.blob_path(digest);
        let file = File::open(&path).with_context(|| format!("Error reading blob from {path:?}"))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    fn put_blob(&self, content: &[u8]) -> anyhow::Result<HashAndSize> {
        let hash = hash_reader(content)?;
        let target = self.blobs_dir.join(hash.raw_hash());
        if !target.exists() {
            let mut file = NamedTempFile::new_in(&self.blobs_dir).context("Creating temporary blob")?;
            file.write_all(content).context("Writing blob")?;
            file.persist(&target).with_context(|| format!("Persisting {target:?}"))?;
        }
        Ok(hash)
    }
}
