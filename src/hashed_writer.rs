use anyhow::Context;
use const_hex::Buffer;
use sha2::{Digest, Sha256};
use std::fmt::{Debug, Display, Formatter};
use std::fs::File;
use std::io;
use std::io::{BufReader, Read, Write};
use std::path::Path;

/// A sha256 content identity together with the number of bytes hashed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HashAndSize {
    hash: String,
    pub size: u64,
}

impl Display for HashAndSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", self.hash)
    }
}

impl HashAndSize {
    pub fn prefixed_hash(&self) -> String {
        format!("sha256:{}", self.hash.as_str())
    }

    pub fn raw_hash(&self) -> &str {
        self.hash.as_str()
    }

    fn from_hasher(hasher: Sha256, size: u64) -> Self {
        let mut buffer = Buffer::<32>::new();
        buffer.format(&hasher.finalize().into());
        Self {
            hash: buffer.to_string(),
            size,
        }
    }
}

/// Strips the `sha256:` algorithm prefix off a digest string.
pub fn raw_digest(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

/// Passes writes through while hashing and counting them.
#[derive(Debug)]
pub struct HashedWriter<W: Write> {
    writer: W,
    total_bytes_written: u64,
    hasher: Sha256,
}

impl<W: Write> HashedWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Sha256::new(),
            total_bytes_written: 0,
        }
    }

    pub fn into_inner(self) -> (W, HashAndSize) {
        (
            self.writer,
            HashAndSize::from_hasher(self.hasher, self.total_bytes_written),
        )
    }
}

impl<W: Write> Write for HashedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let bytes_written = self.writer.write(buf)?;
        self.hasher.update(&buf[..bytes_written]);
        self.total_bytes_written += bytes_written as u64;
        Ok(bytes_written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

pub fn hash_reader(mut content: impl Read) -> anyhow::Result<HashAndSize> {
    let mut writer = HashedWriter::new(io::sink());
    io::copy(&mut content, &mut writer).context("Copying bytes")?;
    Ok(writer.into_inner().1)
}

pub fn hash_file(path: impl AsRef<Path> + Debug) -> anyhow::Result<HashAndSize> {
    let file = File::options()
        .read(true)
        .open(&path)
        .with_context(|| format!("Opening {path:?} for reading"))?;
    hash_reader(BufReader::new(file)).with_context(|| format!("Hashing {path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("hello world")
    const HELLO: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn writer_hashes_what_passes_through() {
        let mut writer = HashedWriter::new(vec![]);
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        let (inner, hash) = writer.into_inner();
        assert_eq!(inner, b"hello world");
        assert_eq!(hash.size, 11);
        assert_eq!(hash.raw_hash(), HELLO);
        assert_eq!(hash.prefixed_hash(), format!("sha256:{HELLO}"));
        assert_eq!(hash.to_string(), hash.prefixed_hash());
    }

    #[test]
    fn reader_and_file_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_reader(&b"hello world"[..]).unwrap());
        assert_eq!(raw_digest(&format!("sha256:{HELLO}")), HELLO);
        assert_eq!(raw_digest(HELLO), HELLO);
    }
}
