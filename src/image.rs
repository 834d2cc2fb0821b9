use crate::media_type;
use crate::platform_matcher::{platform_label, PlatformMatcher};
use crate::progress::progress_iter;
use crate::store::{ContentStore, OciDir};
use anyhow::{bail, Context};
use itertools::Itertools;
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest};
use std::fmt::{Display, Formatter};
use tracing::{debug, instrument, warn};

/// A platform manifest chosen for conversion.
#[derive(Debug, Clone)]
pub struct SourceManifest {
    /// The entry pointing at this manifest in the source index.
    pub descriptor: Descriptor,
    pub manifest: ImageManifest,
    /// Config blob exactly as stored.
    pub config: Vec<u8>,
    pub diff_ids: Vec<String>,
}

impl Display for SourceManifest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&platform_label(self.descriptor.platform().as_ref()))
    }
}

impl SourceManifest {
    fn load(store: &OciDir, descriptor: Descriptor) -> anyhow::Result<Self> {
        let manifest: ImageManifest = store
            .read_json(descriptor.digest())
            .context("Reading manifest")?;
        let config = store
            .read_blob(manifest.config().digest())
            .context("Reading image configuration")?;
        let diff_ids = read_diff_ids(&config).context("Parsing image configuration")?;
        if diff_ids.len() != manifest.layers().len() {
            bail!(
                "Manifest {} lists {} layers but its configuration has {} diff_ids",
                descriptor.digest(),
                manifest.layers().len(),
                diff_ids.len()
            );
        }
        Ok(Self {
            descriptor,
            manifest,
            config,
            diff_ids,
        })
    }
}

fn read_diff_ids(config: &[u8]) -> anyhow::Result<Vec<String>> {
    let value: serde_json::Value = serde_json::from_slice(config)?;
    let Some(diff_ids) = value.pointer("/rootfs/diff_ids").and_then(|v| v.as_array()) else {
        bail!("Configuration has no rootfs.diff_ids");
    };
    diff_ids
        .iter()
        .map(|v| match v.as_str() {
            Some(s) => Ok(s.to_string()),
            None => bail!("Non-string diff_id {v}"),
        })
        .collect()
}

/// One top-level entry of the converted index.
#[derive(Debug, Clone)]
pub enum IndexEntry {
    Selected(SourceManifest),
    /// Filtered out, with every blob it references.
    Unselected { descriptor: Descriptor, blobs: Vec<String> },
}

#[derive(Debug)]
pub struct SourceImage {
    pub index: ImageIndex,
    pub entries: Vec<IndexEntry>,
}

impl SourceImage {
    /// Reads the index and every manifest below it. Nested indexes are
    /// flattened into their platform manifests.
    #[instrument(name = "load_image", skip_all, fields(store = %store, matcher = %matcher))]
    pub fn load(store: &OciDir, matcher: &PlatformMatcher) -> anyhow::Result<Self> {
        let index = store.read_index()?;
        let mut descriptors = vec![];
        flatten_index(store, &index, &mut descriptors)?;

        let mut entries = vec![];
        for descriptor in progress_iter("Reading Manifests", descriptors.into_iter()) {
            if !media_type::is_manifest(descriptor.media_type()) {
                warn!(
                    "Keeping unknown media type {} unchanged",
                    descriptor.media_type()
                );
                let blobs = vec![descriptor.digest().to_string()];
                entries.push(IndexEntry::Unselected { descriptor, blobs });
            } else if matcher.matches_platform(descriptor.platform().as_ref()) {
                let label = platform_label(descriptor.platform().as_ref());
                let manifest = SourceManifest::load(store, descriptor)
                    .with_context(|| format!("Loading manifest for platform {label}"))?;
                entries.push(IndexEntry::Selected(manifest));
            } else {
                debug!(
                    "Platform {} not selected",
                    platform_label(descriptor.platform().as_ref())
                );
                let manifest: ImageManifest = store.read_json(descriptor.digest())?;
                let blobs = std::iter::once(descriptor.digest().to_string())
                    .chain(std::iter::once(manifest.config().digest().to_string()))
                    .chain(manifest.layers().iter().map(|l| l.digest().to_string()))
                    .collect_vec();
                entries.push(IndexEntry::Unselected { descriptor, blobs });
            }
        }
        Ok(Self { index, entries })
    }

    pub fn selected(&self) -> impl Iterator<Item = &SourceManifest> {
        self.entries.iter().filter_map(|e| match e {
            IndexEntry::Selected(manifest) => Some(manifest),
            IndexEntry::Unselected { .. } => None,
        })
    }
}

fn flatten_index(store: &OciDir, index: &ImageIndex, out: &mut Vec<Descriptor>) -> anyhow::Result<()> {
    for descriptor in index.manifests() {
        if media_type::is_index(descriptor.media_type()) {
            let nested: ImageIndex = store
                .read_json(descriptor.digest())
                .with_context(|| format!("Reading nested index {}", descriptor.digest()))?;
            flatten_index(store, &nested, out)?;
        } else {
            out.push(descriptor.clone());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::PlatformFilter;
    use crate::test_utils::{build_layer, ImageFixture};

    fn matcher(filter: PlatformFilter) -> PlatformMatcher {
        PlatformMatcher::from_filter(&filter).unwrap()
    }

    #[test_log::test]
    fn loads_single_platform_image() {
        let dir = tempfile::tempdir().unwrap();
        let layer = build_layer().with_files(&[("a.txt", b"a".as_slice())]).build_raw();
        ImageFixture::default().with_manifest(None, vec![layer]).write(dir.path());

        let store = OciDir::open(dir.path()).unwrap();
        let image = SourceImage::load(&store, &matcher(PlatformFilter::Host)).unwrap();
        let selected = image.selected().collect_vec();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].diff_ids.len(), 1);
        assert_eq!(selected[0].to_string(), "default");
    }

    #[test_log::test]
    fn filters_and_flattens_platforms() {
        let dir = tempfile::tempdir().unwrap();
        let layer = build_layer().with_files(&[("a.txt", b"a".as_slice())]).build_raw();
        ImageFixture::default()
            .with_manifest(Some("linux/amd64"), vec![layer.clone()])
            .with_manifest(Some("linux/arm64/v8"), vec![layer])
            .nested()
            .write(dir.path());

        let store = OciDir::open(dir.path()).unwrap();
        let image = SourceImage::load(
            &store,
            &matcher(PlatformFilter::List(vec!["linux/arm64".to_string()])),
        )
        .unwrap();
        assert_eq!(image.entries.len(), 2);
        let selected = image.selected().collect_vec();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].to_string(), "linux/arm64/v8");
        let IndexEntry::Unselected { blobs, .. } = &image.entries[0] else {
            panic!("amd64 should not be selected");
        };
        assert_eq!(blobs.len(), 3);
    }

    #[test]
    fn diff_ids_must_match_layers() {
        assert!(read_diff_ids(br#"{"rootfs":{"type":"layers","diff_ids":["sha256:aa"]}}"#).is_ok());
        assert!(read_diff_ids(br#"{"rootfs":{"type":"layers"}}"#).is_err());
        assert!(read_diff_ids(br#"{"rootfs":{"diff_ids":[1]}}"#).is_err());
    }
}
