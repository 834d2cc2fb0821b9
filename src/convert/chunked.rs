//! zstd:chunked encoding.
//!
//! The tar stream is cut at every file's data boundaries and every
//! `chunk_size` bytes inside large files. Each piece becomes an independent
//! zstd frame, so a lazy-pull runtime can fetch single files by range. The
//! table of contents and a fixed-size footer are appended as skippable
//! frames; plain zstd decoders ignore them and reproduce the tar exactly.

use crate::compression::backend::CompressionBackend;
use crate::hashed_writer::hash_reader;
use anyhow::Context;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use tar::EntryType;
use tracing::debug;

pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
pub const MANIFEST_CHECKSUM_ANNOTATION: &str = "io.github.containers.zstd-chunked.manifest-checksum";
pub const MANIFEST_POSITION_ANNOTATION: &str = "io.github.containers.zstd-chunked.manifest-position";

const SKIPPABLE_FRAME_MAGIC: u32 = 0x184D_2A50;
const FOOTER_MAGIC: &[u8; 8] = b"GNUlInUx";
const MANIFEST_TYPE_CRFS: u64 = 1;
const FOOTER_SIZE: usize = 64;
const TOC_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct Toc {
    version: u32,
    entries: Vec<TocEntry>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct TocEntry {
    #[serde(rename = "type")]
    type_: &'static str,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    link_name: Option<String>,
    mode: u32,
    size: u64,
    uid: u64,
    gid: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
    offset: u64,
    end_offset: u64,
    #[serde(skip_serializing_if = "is_zero")]
    chunk_size: u64,
    #[serde(skip_serializing_if = "is_zero")]
    chunk_offset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_digest: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    priority: bool,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Position of a tar member inside the uncompressed stream.
#[derive(Debug)]
struct Member {
    type_: &'static str,
    name: String,
    link_name: Option<String>,
    mode: u32,
    size: u64,
    uid: u64,
    gid: u64,
    data_start: u64,
    data_len: u64,
}

fn toc_type(entry_type: EntryType) -> Option<&'static str> {
    Some(match entry_type {
        EntryType::Regular | EntryType::Continuous => "reg",
        EntryType::Directory => "dir",
        EntryType::Symlink => "symlink",
        EntryType::Link => "hardlink",
        EntryType::Char => "char",
        EntryType::Block => "block",
        EntryType::Fifo => "fifo",
        _ => return None,
    })
}

fn normalize_path(path: &str) -> String {
    path.trim_start_matches("./").trim_start_matches('/').to_string()
}

fn read_members(tar: &[u8]) -> anyhow::Result<Vec<Member>> {
    let mut archive = tar::Archive::new(tar);
    let mut members = vec![];
    for entry in archive.entries().context("Reading tar entries")? {
        let entry = entry.context("Reading tar entry")?;
        let header = entry.header();
        let Some(type_) = toc_type(header.entry_type()) else {
            debug!("Leaving {:?} entry out of the table of contents", header.entry_type());
            continue;
        };
        members.push(Member {
            type_,
            name: normalize_path(&entry.path()?.to_string_lossy()),
            link_name: entry.link_name()?.map(|l| l.to_string_lossy().to_string()),
            mode: header.mode()?,
            size: entry.size(),
            uid: header.uid()?,
            gid: header.gid()?,
            data_start: entry.raw_file_position(),
            data_len: header.entry_size()?,
        });
    }
    Ok(members)
}

/// Reads a prioritized-files list: a JSON array of paths, or JSON lines
/// with a `path` field.
pub fn read_record_in(path: &Path) -> anyhow::Result<HashSet<String>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Reading record-in file {path:?}"))?;
    if let Ok(paths) = serde_json::from_str::<Vec<String>>(&content) {
        return Ok(paths.iter().map(|p| normalize_path(p)).collect());
    }
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let record: serde_json::Value =
                serde_json::from_str(line).with_context(|| format!("Invalid record {line:?} in {path:?}"))?;
            record
                .get("path")
                .and_then(|p| p.as_str())
                .map(normalize_path)
                .with_context(|| format!("Record {line:?} in {path:?} has no path"))
        })
        .collect()
}

struct OffsetWriter<W: Write> {
    inner: W,
    offset: u64,
}

impl<W: Write> Write for OffsetWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.offset += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn write_skippable_frame(out: &mut impl Write, payload: &[u8]) -> std::io::Result<()> {
    out.write_all(&SKIPPABLE_FRAME_MAGIC.to_le_bytes())?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(payload)
}

fn sha256(content: &[u8]) -> anyhow::Result<String> {
    Ok(hash_reader(content)?.prefixed_hash())
}

/// Encodes `tar` as zstd:chunked and returns the descriptor annotations.
pub fn write_chunked(
    tar: &[u8],
    backend: &CompressionBackend,
    level: i32,
    chunk_size: u64,
    prioritized: &HashSet<String>,
    out: impl Write,
) -> anyhow::Result<HashMap<String, String>> {
    let chunk_size = if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size };
    let members = read_members(tar)?;

    let mut boundaries = BTreeSet::from([0, tar.len() as u64]);
    for member in members.iter().filter(|m| m.data_len > 0) {
        let end = member.data_start + member.data_len;
        let mut position = member.data_start;
        while position < end {
            boundaries.insert(position);
            position += chunk_size;
        }
        boundaries.insert(end);
    }

    let mut out = OffsetWriter { inner: out, offset: 0 };
    let mut frames = HashMap::new();
    let boundaries = boundaries.into_iter().collect::<Vec<_>>();
    for window in boundaries.windows(2) {
        let (start, end) = (window[0], window[1]);
        let compressed_start = out.offset;
        backend
            .compress_frame(level, &tar[start as usize..end as usize], &mut out)
            .with_context(|| format!("Compressing bytes {start}..{end}"))?;
        frames.insert(start, (end, compressed_start, out.offset));
    }
    debug!("Wrote {} frames", boundaries.len().saturating_sub(1));

    let mut entries = vec![];
    for member in members {
        let priority = prioritized.contains(&member.name);
        let mut entry = TocEntry {
            type_: member.type_,
            name: member.name,
            link_name: member.link_name,
            mode: member.mode,
            size: member.size,
            uid: member.uid,
            gid: member.gid,
            priority,
            ..Default::default()
        };
        if member.type_ != "reg" || member.data_len == 0 {
            entries.push(entry);
            continue;
        }
        let data_end = member.data_start + member.data_len;
        let data = &tar[member.data_start as usize..data_end as usize];
        entry.digest = Some(sha256(data)?);

        let mut start = member.data_start;
        let mut first = true;
        while start < data_end {
            let (end, compressed_start, compressed_end) = frames
                .get(&start)
                .copied()
                .with_context(|| format!("No frame starts at {start}"))?;
            let chunk = &tar[start as usize..end as usize];
            if first {
                entry.offset = compressed_start;
                entry.end_offset = compressed_end;
                entry.chunk_size = chunk.len() as u64;
                entry.chunk_digest = Some(sha256(chunk)?);
                entries.push(std::mem::take(&mut entry));
                first = false;
            } else {
                let previous = entries.last().map(|e| e.name.clone()).unwrap_or_default();
                entries.push(TocEntry {
                    type_: "chunk",
                    name: previous,
                    offset: compressed_start,
                    end_offset: compressed_end,
                    chunk_size: chunk.len() as u64,
                    chunk_offset: start - member.data_start,
                    chunk_digest: Some(sha256(chunk)?),
                    ..Default::default()
                });
            }
            start = end;
        }
    }

    let toc = serde_json::to_vec(&Toc {
        version: TOC_VERSION,
        entries,
    })
    .context("Serializing table of contents")?;
    let mut compressed_toc = vec![];
    backend
        .compress_frame(level, &toc, &mut compressed_toc)
        .context("Compressing table of contents")?;

    let manifest_offset = out.offset + 8;
    write_skippable_frame(&mut out, &compressed_toc)?;

    let mut footer = Vec::with_capacity(FOOTER_SIZE);
    for field in [
        manifest_offset,
        compressed_toc.len() as u64,
        toc.len() as u64,
        MANIFEST_TYPE_CRFS,
        0,
        0,
        0,
    ] {
        footer.extend_from_slice(&field.to_le_bytes());
    }
    footer.extend_from_slice(FOOTER_MAGIC);
    write_skippable_frame(&mut out, &footer)?;
    out.flush()?;

    Ok(HashMap::from([
        (
            MANIFEST_CHECKSUM_ANNOTATION.to_string(),
            sha256(&compressed_toc)?,
        ),
        (
            MANIFEST_POSITION_ANNOTATION.to_string(),
            format!(
                "{manifest_offset}:{}:{}:{MANIFEST_TYPE_CRFS}",
                compressed_toc.len(),
                toc.len()
            ),
        ),
    ]))
}
