use oci_spec::image::MediaType;

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_TAR: &str = "application/vnd.docker.image.rootfs.diff.tar";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_LAYER_ZSTD: &str = "application/vnd.docker.image.rootfs.diff.tar.zstd";
pub const DOCKER_FOREIGN_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

pub const NYDUS_BLOB: &str = "application/vnd.oci.image.layer.nydus.blob.v1";
pub const SOCI_ZTOC: &str = "application/octet-stream";

pub fn is_docker(media_type: &MediaType) -> bool {
    media_type.to_string().starts_with("application/vnd.docker.")
}

pub fn is_manifest(media_type: &MediaType) -> bool {
    matches!(media_type, MediaType::ImageManifest) || media_type.to_string() == DOCKER_MANIFEST
}

pub fn is_index(media_type: &MediaType) -> bool {
    matches!(media_type, MediaType::ImageIndex) || media_type.to_string() == DOCKER_MANIFEST_LIST
}

/// Maps a Docker schema2 media type onto its OCI counterpart. OCI types and
/// anything unknown come back unchanged.
pub fn to_oci(media_type: &MediaType) -> MediaType {
    match media_type.to_string().as_str() {
        DOCKER_MANIFEST => MediaType::ImageManifest,
        DOCKER_MANIFEST_LIST => MediaType::ImageIndex,
        DOCKER_CONFIG => MediaType::ImageConfig,
        DOCKER_LAYER_TAR => MediaType::ImageLayer,
        DOCKER_LAYER_GZIP => MediaType::ImageLayerGzip,
        DOCKER_LAYER_ZSTD => MediaType::ImageLayerZstd,
        DOCKER_FOREIGN_LAYER_GZIP => MediaType::ImageLayerNonDistributableGzip,
        _ => media_type.clone(),
    }
}

/// Docker schema2 name of a produced layer type, for Docker manifests kept
/// as they are.
pub fn to_docker_layer(media_type: &MediaType) -> MediaType {
    match media_type {
        MediaType::ImageLayer => MediaType::from(DOCKER_LAYER_TAR),
        MediaType::ImageLayerGzip => MediaType::from(DOCKER_LAYER_GZIP),
        MediaType::ImageLayerZstd => MediaType::from(DOCKER_LAYER_ZSTD),
        other => other.clone(),
    }
}
