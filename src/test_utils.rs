use crate::hashed_writer::hash_reader;
use crate::media_type::{DOCKER_CONFIG, DOCKER_LAYER_GZIP, DOCKER_MANIFEST, DOCKER_MANIFEST_LIST};
use crate::store::{to_canonical_json, ContentStore, OciDir};
use flate2::write::GzEncoder;
use oci_spec::image::{
    Descriptor, ImageIndexBuilder, ImageManifest, ImageManifestBuilder, MediaType, Platform, PlatformBuilder,
};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header};

#[derive(Default)]
pub struct LayerBuilder {
    files: Vec<(PathBuf, Vec<u8>)>,
    symlinks: Vec<(PathBuf, PathBuf)>,
    directories: Vec<PathBuf>,
}

impl LayerBuilder {
    pub fn with_files(mut self, files: &[(impl AsRef<Path>, &[u8])]) -> Self {
        self.files
            .extend(files.iter().map(|(p, d)| (p.as_ref().to_path_buf(), d.to_vec())));
        self
    }

    pub fn with_symlinks(mut self, symlinks: &[(impl AsRef<Path>, impl AsRef<Path>)]) -> Self {
        self.symlinks.extend(
            symlinks
                .iter()
                .map(|(p, d)| (p.as_ref().to_path_buf(), d.as_ref().to_path_buf())),
        );
        self
    }

    pub fn with_directories(mut self, directories: &[impl AsRef<Path>]) -> Self {
        self.directories
            .extend(directories.iter().map(|p| p.as_ref().to_path_buf()));
        self
    }

    pub fn build_raw(self) -> Vec<u8> {
        let mut builder = setup_tar();
        for directory in self.directories {
            add_dir(&mut builder, directory);
        }
        for (path, content) in self.files {
            add_file(&mut builder, path, &content);
        }
        for (path, to_path) in self.symlinks {
            add_symlink(&mut builder, path, to_path);
        }

        builder.into_inner().unwrap()
    }
}

pub fn build_layer() -> LayerBuilder {
    LayerBuilder::default()
}

pub fn setup_tar() -> Builder<Vec<u8>> {
    Builder::new(vec![])
}

pub fn new_header(type_: EntryType, path: impl AsRef<Path>) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(type_);
    header.set_path(path).unwrap();
    header.set_mode(0o644);
    header
}

pub fn add_dir(builder: &mut Builder<impl Write>, path: impl AsRef<Path>) {
    let mut header = new_header(EntryType::Directory, path);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append(&header, &mut std::io::empty()).unwrap();
}

pub fn add_file(builder: &mut Builder<impl Write>, path: impl AsRef<Path>, content: &[u8]) {
    let mut header = new_header(EntryType::Regular, &path);
    header.set_size(content.len() as u64);
    builder.append_data(&mut header, &path, content).unwrap();
}

pub fn add_symlink(builder: &mut Builder<impl Write>, path: impl AsRef<Path>, to_path: impl AsRef<Path>) {
    let mut header = new_header(EntryType::Symlink, &path);
    header.set_size(0);
    builder.append_link(&mut header, path, &to_path).unwrap();
}

pub fn gzip(content: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(vec![], flate2::Compression::fast());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
}

pub fn sha256(content: &[u8]) -> String {
    hash_reader(content).unwrap().prefixed_hash()
}

fn parse_platform(platform: &str) -> Platform {
    let mut parts = platform.split('/');
    let mut builder = PlatformBuilder::default()
        .os(parts.next().unwrap())
        .architecture(parts.next().unwrap());
    if let Some(variant) = parts.next() {
        builder = builder.variant(variant);
    }
    builder.build().unwrap()
}

/// Writes gzip-layered OCI layouts for tests.
#[derive(Default)]
pub struct ImageFixture {
    manifests: Vec<(Option<String>, Vec<Vec<u8>>)>,
    nested: bool,
    docker: bool,
    mismatched_diff_id: bool,
}

/// What a written fixture contains, per manifest in insertion order.
#[derive(Debug)]
pub struct WrittenFixture {
    pub manifest_digests: Vec<String>,
    pub layer_digests: Vec<Vec<String>>,
    pub diff_ids: Vec<Vec<String>>,
    pub config_digests: Vec<String>,
}

impl ImageFixture {
    pub fn with_manifest(mut self, platform: Option<&str>, layers: Vec<Vec<u8>>) -> Self {
        self.manifests.push((platform.map(str::to_string), layers));
        self
    }

    /// Puts the manifests into an index referenced from `index.json`.
    pub fn nested(mut self) -> Self {
        self.nested = true;
        self
    }

    /// Uses Docker schema2 media types, including a manifest list index.
    pub fn docker(mut self) -> Self {
        self.docker = true;
        self
    }

    /// Records a wrong diffID for the last layer of the last manifest.
    pub fn with_mismatched_diff_id(mut self) -> Self {
        self.mismatched_diff_id = true;
        self
    }

    pub fn write(self, dir: &Path) -> WrittenFixture {
        let store = OciDir::create(dir).unwrap();
        let mut written = WrittenFixture {
            manifest_digests: vec![],
            layer_digests: vec![],
            diff_ids: vec![],
            config_digests: vec![],
        };
        let manifest_count = self.manifests.len();
        let mut descriptors = vec![];
        for (idx, (platform, layers)) in self.manifests.into_iter().enumerate() {
            let mut diff_ids = layers.iter().map(|l| sha256(l)).collect::<Vec<_>>();
            if self.mismatched_diff_id && idx + 1 == manifest_count {
                if let Some(last) = diff_ids.last_mut() {
                    *last = sha256(b"not the layer content");
                }
            }
            let layer_media_type = if self.docker {
                MediaType::from(DOCKER_LAYER_GZIP)
            } else {
                MediaType::ImageLayerGzip
            };
            let layer_descriptors = layers
                .iter()
                .map(|layer| {
                    let hash = store.put_blob(&gzip(layer)).unwrap();
                    Descriptor::new(layer_media_type.clone(), hash.size as i64, hash.prefixed_hash())
                })
                .collect::<Vec<_>>();

            let (os, arch) = platform
                .as_deref()
                .and_then(|p| p.split_once('/'))
                .unwrap_or(("linux", "amd64"));
            let arch = arch.split('/').next().unwrap();
            let config = serde_json::json!({
                "architecture": arch,
                "os": os,
                "config": {"Env": ["PATH=/usr/bin"]},
                "rootfs": {"type": "layers", "diff_ids": diff_ids},
                "history": [{"created_by": "fixture"}],
            });
            let config_hash = store.put_blob(&to_canonical_json(&config).unwrap()).unwrap();
            let config_media_type = if self.docker {
                MediaType::from(DOCKER_CONFIG)
            } else {
                MediaType::ImageConfig
            };
            let manifest_media_type = if self.docker {
                MediaType::from(DOCKER_MANIFEST)
            } else {
                MediaType::ImageManifest
            };
            let manifest: ImageManifest = ImageManifestBuilder::default()
                .schema_version(2u32)
                .media_type(manifest_media_type.clone())
                .config(Descriptor::new(
                    config_media_type,
                    config_hash.size as i64,
                    config_hash.prefixed_hash(),
                ))
                .layers(layer_descriptors.clone())
                .build()
                .unwrap();
            let manifest_hash = store.put_blob(&to_canonical_json(&manifest).unwrap()).unwrap();
            let mut descriptor = Descriptor::new(
                manifest_media_type,
                manifest_hash.size as i64,
                manifest_hash.prefixed_hash(),
            );
            descriptor.set_platform(platform.as_deref().map(parse_platform));
            descriptors.push(descriptor);

            written.manifest_digests.push(manifest_hash.prefixed_hash());
            written
                .layer_digests
                .push(layer_descriptors.iter().map(|d| d.digest().to_string()).collect());
            written.diff_ids.push(diff_ids);
            written.config_digests.push(config_hash.prefixed_hash());
        }

        let index_media_type = if self.docker {
            MediaType::from(DOCKER_MANIFEST_LIST)
        } else {
            MediaType::ImageIndex
        };
        let mut index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(index_media_type)
            .manifests(descriptors)
            .build()
            .unwrap();
        if self.nested {
            let hash = store.put_blob(&to_canonical_json(&index).unwrap()).unwrap();
            index.set_manifests(vec![Descriptor::new(
                MediaType::ImageIndex,
                hash.size as i64,
                hash.prefixed_hash(),
            )]);
        }
        store.write_index(&index).unwrap();
        written
    }
}

pub fn read_manifest(store: &OciDir, descriptor: &Descriptor) -> ImageManifest {
    store.read_json(descriptor.digest()).unwrap()
}

pub fn decode_blob(store: &OciDir, descriptor: &Descriptor) -> Vec<u8> {
    let blob = store.get_blob(descriptor.digest()).unwrap();
    let (_, mut reader) = crate::compression::Compression::open_detected(descriptor.media_type(), blob).unwrap();
    let mut content = vec![];
    reader.read_to_end(&mut content).unwrap();
    content
}
