use crate::PatchError;

pub const MAGIC: &[u8; 4] = b"DOTA";
pub const FORMAT_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 4 + 1 + 4 + 4 + 32 + 32;

pub(crate) const OP_END: u8 = 0x00;
pub(crate) const OP_COPY: u8 = 0x01;
pub(crate) const OP_INSERT: u8 = 0x02;

/// Fixed size prefix of the uncompressed diff stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub source_len: u32,
    pub target_len: u32,
    pub source_hash: [u8; 32],
    pub target_hash: [u8; 32],
}

impl Header {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&self.source_len.to_le_bytes());
        out.extend_from_slice(&self.target_len.to_le_bytes());
        out.extend_from_slice(&self.source_hash);
        out.extend_from_slice(&self.target_hash);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PatchError> {
        if buf.len() < HEADER_LEN {
            return Err(PatchError::Truncated);
        }
        if &buf[0..4] != MAGIC {
            return Err(PatchError::BadMagic);
        }
        if buf[4] != FORMAT_VERSION {
            return Err(PatchError::UnsupportedVersion(buf[4]));
        }
        let mut source_len = [0; 4];
        source_len.copy_from_slice(&buf[5..9]);
        let mut target_len = [0; 4];
        target_len.copy_from_slice(&buf[9..13]);
        let mut source_hash = [0; 32];
        source_hash.copy_from_slice(&buf[13..45]);
        let mut target_hash = [0; 32];
        target_hash.copy_from_slice(&buf[45..77]);
        Ok(Self {
            source_len: u32::from_le_bytes(source_len),
            target_len: u32::from_le_bytes(target_len),
            source_hash,
            target_hash,
        })
    }
}

/// Unsigned LEB128.
pub(crate) fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Byte-at-a-time LEB128 decoder, so varints may straddle chunk boundaries.
#[derive(Debug, Default, Clone)]
pub(crate) struct VarintReader {
    value: u64,
    shift: u32,
}

impl VarintReader {
    pub(crate) fn push(&mut self, byte: u8) -> Result<Option<u64>, PatchError> {
        if self.shift > 63 {
            return Err(PatchError::Malformed("varint too long"));
        }
        self.value |= ((byte & 0x7f) as u64) << self.shift;
        self.shift += 7;
        if byte & 0x80 == 0 {
            Ok(Some(self.value))
        } else {
            Ok(None)
        }
    }
}
