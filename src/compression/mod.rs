use crate::media_type;
use anyhow::bail;
use flate2::read::MultiGzDecoder;
use oci_spec::image::MediaType;
use std::io::{BufRead, BufReader, Read};
use zstd::Decoder;

pub mod backend;
pub mod selector;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const ZSTD_SKIPPABLE_MAGIC_MASK: u32 = 0xFFFF_FFF0;
const ZSTD_SKIPPABLE_MAGIC: u32 = 0x184D_2A50;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// How a stored layer blob is encoded.
#[derive(Debug, Clone, Copy, strum::Display, Eq, PartialEq)]
pub enum Compression {
    Raw,
    Gzip,
    Zstd,
}

impl Compression {
    pub fn from_media_type(media_type: &MediaType) -> Option<Self> {
        match media_type::to_oci(media_type) {
            MediaType::ImageLayer | MediaType::ImageLayerNonDistributable => Some(Self::Raw),
            MediaType::ImageLayerGzip | MediaType::ImageLayerNonDistributableGzip => Some(Self::Gzip),
            MediaType::ImageLayerZstd | MediaType::ImageLayerNonDistributableZstd => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Sniffs the codec from the first bytes of a blob.
    pub fn from_magic(header: &[u8]) -> Self {
        if header.starts_with(&ZSTD_MAGIC) {
            return Self::Zstd;
        }
        if header.len() >= 4 {
            let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            if magic & ZSTD_SKIPPABLE_MAGIC_MASK == ZSTD_SKIPPABLE_MAGIC {
                return Self::Zstd;
            }
        }
        if header.starts_with(&GZIP_MAGIC) {
            return Self::Gzip;
        }
        Self::Raw
    }

    /// Media type wins when it names a codec; otherwise the content decides.
    pub fn detect(media_type: &MediaType, header: &[u8]) -> Self {
        match Self::from_media_type(media_type) {
            Some(compression) if compression == Self::from_magic(header) => compression,
            Some(Self::Raw) | None => Self::from_magic(header),
            Some(compression) => compression,
        }
    }

    pub fn new_reader<T: Read>(self, file: T) -> anyhow::Result<CompressedReader<'static, T>> {
        CompressedReader::new(self, file)
    }

    /// Opens a decoding reader, detecting the codec from the media type and
    /// the stream's leading bytes.
    pub fn open_detected<T: Read + 'static>(
        media_type: &MediaType,
        reader: T,
    ) -> anyhow::Result<(Self, CompressedReader<'static, BufReader<T>>)> {
        let mut reader = BufReader::new(reader);
        let header = reader.fill_buf()?;
        if header.is_empty() {
            bail!("Layer blob is empty");
        }
        let compression = Self::detect(media_type, header);
        Ok((compression, compression.new_reader(reader)?))
    }
}

pub enum CompressedReader<'a, T: Read> {
    Raw(T),
    Gzip(MultiGzDecoder<T>),
    Zstd(Decoder<'a, BufReader<T>>),
}

impl<'a, T: Read> CompressedReader<'a, T> {
    #[inline(always)]
    fn new(type_: Compression, file: T) -> anyhow::Result<CompressedReader<'a, T>> {
        match type_ {
            Compression::Raw => Ok(Self::Raw(file)),
            Compression::Gzip => Ok(Self::Gzip(MultiGzDecoder::new(file))),
            Compression::Zstd => Ok(Self::Zstd(Decoder::new(file)?)),
        }
    }
}

impl<T: Read> Read for CompressedReader<'_, T> {
    #[inline(always)]
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            CompressedReader::Raw(f) => f.read(buf),
            CompressedReader::Gzip(f) => f.read(buf),
            CompressedReader::Zstd(f) => f.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::compression::Compression;
    use crate::media_type::DOCKER_LAYER_GZIP;
    use flate2::write::GzEncoder;
    use oci_spec::image::MediaType;
    use std::io::Write;

    const CONTENT: &[u8] = b"hello world";

    fn gzip(content: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(content).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn raw_read() {
        let mut reader = Compression::Raw.new_reader(CONTENT).unwrap();
        let mut output = vec![];
        std::io::copy(&mut reader, &mut output).unwrap();
        assert_eq!(output, CONTENT);
    }

    #[test]
    fn gzip_read_multiple_members() {
        let mut compressed_content = gzip(b"hello ");
        compressed_content.extend(gzip(b"world"));
        let mut reader = Compression::Gzip.new_reader(compressed_content.as_slice()).unwrap();
        let mut output = vec![];
        std::io::copy(&mut reader, &mut output).unwrap();
        assert_eq!(output, CONTENT);
    }

    #[test]
    fn zstd_read() {
        let content = zstd::encode_all(CONTENT, 1).unwrap();
        let mut reader = Compression::Zstd.new_reader(content.as_slice()).unwrap();
        let mut output = vec![];
        std::io::copy(&mut reader, &mut output).unwrap();
        assert_eq!(output, CONTENT);
    }

    #[test]
    fn magic_detection() {
        assert_eq!(Compression::from_magic(&gzip(CONTENT)), Compression::Gzip);
        assert_eq!(
            Compression::from_magic(&zstd::encode_all(CONTENT, 1).unwrap()),
            Compression::Zstd
        );
        assert_eq!(Compression::from_magic(&[0x50, 0x2a, 0x4d, 0x18, 0, 0]), Compression::Zstd);
        assert_eq!(Compression::from_magic(CONTENT), Compression::Raw);
    }

    #[test]
    fn detect_prefers_media_type_and_falls_back_to_content() {
        let gzipped = gzip(CONTENT);
        let docker_gzip = MediaType::from(DOCKER_LAYER_GZIP);
        assert_eq!(Compression::detect(&docker_gzip, &gzipped), Compression::Gzip);
        // A plain-tar media type whose content is really gzip.
        assert_eq!(Compression::detect(&MediaType::ImageLayer, &gzipped), Compression::Gzip);
        let unknown = MediaType::Other("application/x-custom".to_string());
        assert_eq!(Compression::detect(&unknown, CONTENT), Compression::Raw);
    }

    #[test]
    fn open_detected_decodes() {
        let gzipped = gzip(CONTENT);
        let (compression, mut reader) =
            Compression::open_detected(&MediaType::ImageLayerGzip, std::io::Cursor::new(gzipped)).unwrap();
        assert_eq!(compression, Compression::Gzip);
        let mut output = vec![];
        std::io::copy(&mut reader, &mut output).unwrap();
        assert_eq!(output, CONTENT);
    }
}
