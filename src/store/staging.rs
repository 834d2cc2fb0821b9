use super::{ContentStore, OciDir};
use crate::hashed_writer::{HashAndSize, HashedWriter};
use crate::io::new_bufwriter;
use anyhow::Context;
use oci_spec::image::ImageIndex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// A converted blob waiting in the staging directory.
#[derive(Debug, Clone)]
pub struct StagedBlob {
    pub path: PathBuf,
    pub hash: HashAndSize,
}

/// Scratch directory inside the destination layout.
///
/// Nothing in here is visible to readers of the destination until
/// [`Staging::commit`]; dropping it discards every staged file.
#[derive(Debug)]
pub struct Staging {
    dir: TempDir,
}

impl Staging {
    pub fn new_in(destination: &OciDir) -> anyhow::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(".layer-convert-")
            .tempdir_in(destination.root())
            .with_context(|| format!("Creating staging directory in {destination}"))?;
        debug!("Staging converted blobs in {:?}", dir.path());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Creates a staging file wrapped in a hashing writer.
    pub fn create(&self, name: &str) -> anyhow::Result<(PathBuf, HashedWriter<BufWriter<File>>)> {
        let path = self.dir.path().join(name);
        let file = File::options()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Creating staging file {path:?}"))?;
        Ok((path, HashedWriter::new(new_bufwriter(file))))
    }

    /// Flushes a writer from [`Staging::create`] and records the result.
    pub fn finish(path: PathBuf, writer: HashedWriter<BufWriter<File>>) -> anyhow::Result<StagedBlob> {
        let (mut out, hash) = writer.into_inner();
        out.flush().with_context(|| format!("Flushing {path:?}"))?;
        Ok(StagedBlob { path, hash })
    }

    /// Publishes everything into `destination`: staged files, copied blobs,
    /// JSON blobs and finally the index.
    pub fn commit(
        self,
        destination: &OciDir,
        staged: Vec<StagedBlob>,
        copies: &[(String, &dyn ContentStore)],
        json_blobs: &[Vec<u8>],
        index: &ImageIndex,
    ) -> anyhow::Result<()> {
        for blob in &staged {
            if !blob.path.exists() && destination.has_blob(&blob.hash.prefixed_hash()) {
                continue;
            }
            destination
                .put_blob_file(&blob.path, &blob.hash)
                .with_context(|| format!("Committing blob {}", blob.hash))?;
        }
        for (digest, source) in copies {
            destination
                .copy_blob_from(*source, digest)
                .with_context(|| format!("Copying unchanged blob {digest}"))?;
        }
        for content in json_blobs {
            destination.put_blob(content).context("Writing JSON blob")?;
        }
        destination.write_index(index).context("Writing index")?;
        info!(
            "Committed {} converted blobs to {destination}",
            staged.len()
        );
        Ok(())
    }
}
