use flate2::read::GzDecoder;
use pkgbuilderd_common::errors::*;
use std::io::Read;
use xz2::read::XzDecoder;

/// Compression of a repository database, repo-add picks it from the
/// database file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbCompression {
    Gzip,
    Xz,
    Zstd,
    /// Plain tar, or something we don't recognize and let tar reject.
    None,
}

impl DbCompression {
    pub fn detect(bytes: &[u8]) -> DbCompression {
        let mime = tree_magic_mini::from_u8(bytes);
        trace!("Repository database looks like {:?}", mime);

        match mime {
            "application/gzip" => DbCompression::Gzip,
            "application/x-xz" => DbCompression::Xz,
            "application/zstd" => DbCompression::Zstd,
            _ => DbCompression::None,
        }
    }

    pub fn reader<'a>(self, bytes: &'a [u8]) -> Result<Box<dyn Read + 'a>> {
        let reader: Box<dyn Read + 'a> = match self {
            DbCompression::Gzip => Box::new(GzDecoder::new(bytes)),
            DbCompression::Xz => Box::new(XzDecoder::new(bytes)),
            DbCompression::Zstd => Box::new(zstd::Decoder::new(bytes)
                .context("Failed to set up zstd decoder")?),
            DbCompression::None => Box::new(bytes),
        };
        Ok(reader)
    }
}

/// Decompress a database of any supported compression.
pub fn open(bytes: &[u8]) -> Result<Box<dyn Read + '_>> {
    DbCompression::detect(bytes).reader(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONTENT: &[u8] = b"%NAME%\nfoo\n";

    fn roundtrip(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        open(bytes).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_plain() {
        assert_eq!(DbCompression::detect(CONTENT), DbCompression::None);
        assert_eq!(roundtrip(CONTENT), CONTENT);
    }

    #[test]
    fn test_gzip() {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(CONTENT).unwrap();
        let bytes = enc.finish().unwrap();

        assert_eq!(DbCompression::detect(&bytes), DbCompression::Gzip);
        assert_eq!(roundtrip(&bytes), CONTENT);
    }

    #[test]
    fn test_xz() {
        let mut enc = xz2::write::XzEncoder::new(Vec::new(), 6);
        enc.write_all(CONTENT).unwrap();
        let bytes = enc.finish().unwrap();

        assert_eq!(DbCompression::detect(&bytes), DbCompression::Xz);
        assert_eq!(roundtrip(&bytes), CONTENT);
    }

    #[test]
    fn test_zstd() {
        let bytes = zstd::encode_all(CONTENT, 3).unwrap();

        assert_eq!(DbCompression::detect(&bytes), DbCompression::Zstd);
        assert_eq!(roundtrip(&bytes), CONTENT);
    }
}
