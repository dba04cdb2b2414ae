//! Delta patches for firmware images.
//!
//! A patch is a zlib compressed stream of copy/insert ops against the
//! source image, framed by a header carrying both image lengths and
//! SHA-256 digests. Decoding is streaming: [`StreamingPatch`] accepts the
//! compressed bytes in arbitrary slices and writes the target image
//! sequentially, so a device never holds more than the decompressor
//! window and a small copy buffer in memory.

use std::io::{self, Write};

use flate2::write::ZlibEncoder;
use flate2::Compression;

mod apply;
mod diff;
mod format;

pub use apply::{ImageSink, ImageSource, PatchApplier, StreamingPatch};
pub use diff::diff;
pub use format::{Header, FORMAT_VERSION, HEADER_LEN, MAGIC};

/// Block size used to index the source image.
pub const DEFAULT_BLOCK_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("not a delta patch")]
    BadMagic,
    #[error("unsupported patch format version {0}")]
    UnsupportedVersion(u8),
    #[error("base image does not match the patch source")]
    SourceMismatch,
    #[error("reconstructed image does not match the patch target")]
    TargetMismatch,
    #[error("copy op reads outside the base image")]
    CopyOutOfBounds,
    #[error("patch stream ended early")]
    Truncated,
    #[error("data after end of patch")]
    TrailingData,
    #[error("malformed patch: {0}")]
    Malformed(&'static str),
    #[error("image of {0} bytes exceeds the 4 GiB format limit")]
    TooLarge(usize),
    #[error("i/o error")]
    Io(#[from] io::Error),
}

impl PatchError {
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            PatchError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }

    /// Recovers a patch error that travelled through an `io::Write` chain.
    pub(crate) fn from_io(e: io::Error) -> Self {
        match e.get_ref() {
            Some(inner) if inner.is::<PatchError>() => {}
            _ => return PatchError::Io(e),
        }
        match e.into_inner().map(|inner| inner.downcast::<PatchError>()) {
            Some(Ok(inner)) => *inner,
            _ => PatchError::Malformed("unrecoverable error"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PatchOptions {
    pub block_size: usize,
    /// zlib level, 0-9.
    pub level: u32,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            level: 9,
        }
    }
}

/// Computes and compresses the patch turning `source` into `target`.
pub fn create_patch(
    source: &[u8],
    target: &[u8],
    options: &PatchOptions,
) -> Result<Vec<u8>, PatchError> {
    for image in [source, target] {
        if image.len() > u32::MAX as usize {
            return Err(PatchError::TooLarge(image.len()));
        }
    }
    let ops = diff(source, target, options.block_size);
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(options.level.min(9)));
    encoder.write_all(&ops)?;
    Ok(encoder.finish()?)
}

/// Applies a complete patch held in memory.
pub fn apply_patch(source: &[u8], patch: &[u8]) -> Result<Vec<u8>, PatchError> {
    let mut stream = StreamingPatch::new(source, Vec::new());
    stream.feed(patch)?;
    stream.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn firmware(len: usize, seed: u32) -> Vec<u8> {
        let mut x = seed | 1;
        (0..len)
            .map(|i| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                // Mix in some structure so the image compresses somewhat.
                if i % 64 < 16 {
                    (i / 64) as u8
                } else {
                    x as u8
                }
            })
            .collect()
    }

    /// v5.3 is v5.0 with a patched function, a grown table and a shifted
    /// tail, the kind of edit a point release makes.
    fn fixtures() -> (Vec<u8>, Vec<u8>) {
        let v50 = firmware(96 * 1024, 50);
        let mut v53 = Vec::new();
        v53.extend_from_slice(&v50[..20_000]);
        v53.extend_from_slice(&firmware(1200, 53));
        v53.extend_from_slice(&v50[20_400..60_000]);
        for b in v50[60_000..61_000].iter() {
            v53.push(b.wrapping_add(1));
        }
        v53.extend_from_slice(&v50[61_000..]);
        v53.extend_from_slice(b"build 5.3");
        (v50, v53)
    }

    #[test]
    fn patch_reconstructs_target() {
        let (v50, v53) = fixtures();
        let patch = create_patch(&v50, &v53, &PatchOptions::default()).unwrap();
        assert!(patch.len() < v53.len() / 10, "patch is {} bytes", patch.len());
        assert_eq!(apply_patch(&v50, &patch).unwrap(), v53);
    }

    #[test]
    fn generation_is_deterministic() {
        let (v50, v53) = fixtures();
        let a = create_patch(&v50, &v53, &PatchOptions::default()).unwrap();
        let b = create_patch(&v50, &v53, &PatchOptions::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn streaming_in_chunks_matches() {
        let (v50, v53) = fixtures();
        let patch = create_patch(&v50, &v53, &PatchOptions::default()).unwrap();

        let mut stream = StreamingPatch::new(&v50[..], Vec::new());
        let mut last = 0;
        for chunk in patch.chunks(512) {
            stream.feed(chunk).unwrap();
            assert!(stream.written() >= last);
            last = stream.written();
        }
        assert_eq!(stream.finish().unwrap(), v53);
    }

    #[test]
    fn errors_survive_the_decoder() {
        let (v50, v53) = fixtures();
        let patch = create_patch(&v50, &v53, &PatchOptions::default()).unwrap();
        let wrong = firmware(v50.len(), 99);
        assert!(matches!(
            apply_patch(&wrong, &patch),
            Err(PatchError::SourceMismatch)
        ));
    }

    #[test]
    fn corrupt_compressed_stream_fails() {
        let (v50, v53) = fixtures();
        let mut patch = create_patch(&v50, &v53, &PatchOptions::default()).unwrap();
        let mid = patch.len() / 2;
        patch[mid] ^= 0xff;
        assert!(apply_patch(&v50, &patch).is_err());
    }
}
