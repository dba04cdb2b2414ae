use std::io::{self, Write};

use flate2::write::ZlibDecoder;
use sha2::{Digest, Sha256};

use crate::format::{Header, VarintReader, HEADER_LEN, OP_COPY, OP_END, OP_INSERT};
use crate::PatchError;

const COPY_BUFFER: usize = 256;

/// Random access view of the image a patch was computed against.
pub trait ImageSource {
    fn image_len(&self) -> u64;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

/// Destination of the reconstructed image. Writes arrive in ascending,
/// contiguous order starting at zero.
pub trait ImageSink {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;
}

impl ImageSource for &[u8] {
    fn image_len(&self) -> u64 {
        self.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "read past image end"))?;
        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }
}

impl ImageSink for Vec<u8> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start + data.len();
        if self.len() < end {
            self.resize(end, 0);
        }
        self[start..end].copy_from_slice(data);
        Ok(())
    }
}

enum Stage {
    Header(Vec<u8>),
    Tag,
    CopyOffset(VarintReader),
    CopyLen(u64, VarintReader),
    InsertLen(VarintReader),
    Insert(u64),
    End,
}

/// Interprets an uncompressed diff stream, writing the target image as ops
/// arrive. Input may be split at any byte boundary.
pub struct PatchApplier<S, T> {
    source: S,
    target: T,
    stage: Stage,
    header: Option<Header>,
    written: u64,
    hasher: Sha256,
}

impl<S: ImageSource, T: ImageSink> PatchApplier<S, T> {
    pub fn new(source: S, target: T) -> Self {
        Self {
            source,
            target,
            stage: Stage::Header(Vec::with_capacity(HEADER_LEN)),
            header: None,
            written: 0,
            hasher: Sha256::new(),
        }
    }

    /// Bytes of target image written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn consume(&mut self, mut data: &[u8]) -> Result<(), PatchError> {
        while !data.is_empty() {
            let stage = std::mem::replace(&mut self.stage, Stage::Tag);
            self.stage = match stage {
                Stage::Header(mut buf) => {
                    let take = core::cmp::min(HEADER_LEN - buf.len(), data.len());
                    buf.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if buf.len() == HEADER_LEN {
                        let header = Header::decode(&buf)?;
                        self.check_source(&header)?;
                        self.header = Some(header);
                        Stage::Tag
                    } else {
                        Stage::Header(buf)
                    }
                }
                Stage::Tag => {
                    let tag = data[0];
                    data = &data[1..];
                    match tag {
                        OP_END => Stage::End,
                        OP_COPY => Stage::CopyOffset(VarintReader::default()),
                        OP_INSERT => Stage::InsertLen(VarintReader::default()),
                        _ => return Err(PatchError::Malformed("unknown op")),
                    }
                }
                Stage::CopyOffset(mut reader) => {
                    let byte = data[0];
                    data = &data[1..];
                    match reader.push(byte)? {
                        Some(offset) => Stage::CopyLen(offset, VarintReader::default()),
                        None => Stage::CopyOffset(reader),
                    }
                }
                Stage::CopyLen(offset, mut reader) => {
                    let byte = data[0];
                    data = &data[1..];
                    match reader.push(byte)? {
                        Some(len) => {
                            self.copy(offset, len)?;
                            Stage::Tag
                        }
                        None => Stage::CopyLen(offset, reader),
                    }
                }
                Stage::InsertLen(mut reader) => {
                    let byte = data[0];
                    data = &data[1..];
                    match reader.push(byte)? {
                        Some(0) => Stage::Tag,
                        Some(len) => Stage::Insert(len),
                        None => Stage::InsertLen(reader),
                    }
                }
                Stage::Insert(remaining) => {
                    let take = core::cmp::min(remaining, data.len() as u64) as usize;
                    let (head, rest) = data.split_at(take);
                    self.emit(head)?;
                    data = rest;
                    if remaining == take as u64 {
                        Stage::Tag
                    } else {
                        Stage::Insert(remaining - take as u64)
                    }
                }
                Stage::End => {
                    self.stage = Stage::End;
                    return Err(PatchError::TrailingData);
                }
            };
        }
        Ok(())
    }

    /// Validates that the whole stream was seen and the output is the image
    /// the patch was built for, returning the sink.
    pub fn finish(self) -> Result<T, PatchError> {
        if !matches!(self.stage, Stage::End) {
            return Err(PatchError::Truncated);
        }
        let header = self.header.ok_or(PatchError::Truncated)?;
        if self.written != header.target_len as u64 {
            return Err(PatchError::TargetMismatch);
        }
        if self.hasher.finalize().as_slice() != header.target_hash {
            return Err(PatchError::TargetMismatch);
        }
        Ok(self.target)
    }

    fn check_source(&mut self, header: &Header) -> Result<(), PatchError> {
        let len = self.source.image_len();
        if len != header.source_len as u64 {
            log::warn!(
                "Base image is {} bytes, patch expects {}",
                len,
                header.source_len
            );
            return Err(PatchError::SourceMismatch);
        }
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 1024];
        let mut offset = 0;
        while offset < len {
            let n = core::cmp::min(buf.len() as u64, len - offset) as usize;
            self.source.read_at(offset, &mut buf[..n])?;
            hasher.update(&buf[..n]);
            offset += n as u64;
        }
        if hasher.finalize().as_slice() != header.source_hash {
            return Err(PatchError::SourceMismatch);
        }
        Ok(())
    }

    fn copy(&mut self, offset: u64, len: u64) -> Result<(), PatchError> {
        let end = offset.checked_add(len).ok_or(PatchError::CopyOutOfBounds)?;
        if end > self.source.image_len() {
            return Err(PatchError::CopyOutOfBounds);
        }
        let mut buf = [0u8; COPY_BUFFER];
        let mut at = offset;
        while at < end {
            let n = core::cmp::min(COPY_BUFFER as u64, end - at) as usize;
            self.source.read_at(at, &mut buf[..n])?;
            self.emit(&buf[..n])?;
            at += n as u64;
        }
        Ok(())
    }

    fn emit(&mut self, data: &[u8]) -> Result<(), PatchError> {
        let target_len = self.header.as_ref().map(|h| h.target_len as u64).unwrap_or(0);
        if self.written + data.len() as u64 > target_len {
            return Err(PatchError::Malformed("ops overrun target length"));
        }
        self.target.write_at(self.written, data)?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        Ok(())
    }
}

impl<S: ImageSource, T: ImageSink> Write for PatchApplier<S, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.consume(buf).map_err(PatchError::into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Decompresses and applies a patch as its compressed bytes arrive.
pub struct StreamingPatch<S: ImageSource, T: ImageSink> {
    decoder: ZlibDecoder<PatchApplier<S, T>>,
}

impl<S: ImageSource, T: ImageSink> StreamingPatch<S, T> {
    pub fn new(source: S, target: T) -> Self {
        Self {
            decoder: ZlibDecoder::new(PatchApplier::new(source, target)),
        }
    }

    /// Feeds the next slice of compressed patch. All output derivable from
    /// the input seen so far is written before this returns.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), PatchError> {
        self.decoder.write_all(data).map_err(PatchError::from_io)?;
        self.decoder.flush().map_err(PatchError::from_io)
    }

    pub fn written(&self) -> u64 {
        self.decoder.get_ref().written()
    }

    pub fn header(&self) -> Option<&Header> {
        self.decoder.get_ref().header()
    }

    pub fn finish(self) -> Result<T, PatchError> {
        let applier = self.decoder.finish().map_err(PatchError::from_io)?;
        applier.finish()
    }
}
