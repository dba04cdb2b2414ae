use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::format::{write_varint, Header, OP_COPY, OP_END, OP_INSERT};

/// Number of source positions remembered per weak checksum.
const MAX_CANDIDATES: usize = 8;

/// Weak rolling checksum over a fixed window, as used by rsync.
#[derive(Debug, Clone, Copy)]
struct Rolling {
    a: u32,
    b: u32,
    window: u32,
}

impl Rolling {
    fn new(window: &[u8]) -> Self {
        let len = window.len() as u32;
        let mut a: u32 = 0;
        let mut b: u32 = 0;
        for (i, &x) in window.iter().enumerate() {
            a = a.wrapping_add(x as u32);
            b = b.wrapping_add((len - i as u32).wrapping_mul(x as u32));
        }
        Self { a, b, window: len }
    }

    fn roll(&mut self, out: u8, inp: u8) {
        self.a = self.a.wrapping_sub(out as u32).wrapping_add(inp as u32);
        self.b = self
            .b
            .wrapping_sub(self.window.wrapping_mul(out as u32))
            .wrapping_add(self.a);
    }

    fn digest(&self) -> u32 {
        (self.a & 0xffff) | (self.b << 16)
    }
}

/// Weak checksums of the source at block aligned offsets.
struct BlockIndex {
    block: usize,
    blocks: HashMap<u32, Vec<usize>>,
}

impl BlockIndex {
    fn build(source: &[u8], block: usize) -> Self {
        let mut blocks: HashMap<u32, Vec<usize>> = HashMap::new();
        let mut offset = 0;
        while offset + block <= source.len() {
            let digest = Rolling::new(&source[offset..offset + block]).digest();
            let positions = blocks.entry(digest).or_default();
            if positions.len() < MAX_CANDIDATES {
                positions.push(offset);
            }
            offset += block;
        }
        Self { block, blocks }
    }

    /// Best verified match for the window at `target[pos..]`, picking the
    /// candidate with the longest forward extension (first one on ties).
    fn find(&self, source: &[u8], target: &[u8], pos: usize, digest: u32) -> Option<usize> {
        let window = &target[pos..pos + self.block];
        let mut best: Option<(usize, usize)> = None;
        for &candidate in self.blocks.get(&digest)?.iter() {
            if &source[candidate..candidate + self.block] != window {
                continue;
            }
            let extension = common_prefix(&source[candidate..], &target[pos..]);
            match best {
                Some((_, len)) if len >= extension => {}
                _ => best = Some((candidate, extension)),
            }
        }
        best.map(|(candidate, _)| candidate)
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

enum Pending {
    Copy { offset: usize, len: usize },
    Insert { start: usize, end: usize },
}

/// Serialises ops, merging contiguous copies and adjacent inserts.
struct OpWriter<'t> {
    target: &'t [u8],
    out: Vec<u8>,
    pending: Option<Pending>,
    copies: usize,
    inserted: usize,
}

impl<'t> OpWriter<'t> {
    fn new(header: &Header, target: &'t [u8]) -> Self {
        let mut out = Vec::with_capacity(target.len() / 4 + 128);
        header.encode(&mut out);
        Self {
            target,
            out,
            pending: None,
            copies: 0,
            inserted: 0,
        }
    }

    fn insert(&mut self, start: usize, end: usize) {
        if start == end {
            return;
        }
        if let Some(Pending::Insert { end: pending_end, .. }) = &mut self.pending {
            if *pending_end == start {
                *pending_end = end;
                return;
            }
        }
        self.flush();
        self.pending = Some(Pending::Insert { start, end });
    }

    fn copy(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        if let Some(Pending::Copy {
            offset: pending_offset,
            len: pending_len,
        }) = &mut self.pending
        {
            if *pending_offset + *pending_len == offset {
                *pending_len += len;
                return;
            }
        }
        self.flush();
        self.pending = Some(Pending::Copy { offset, len });
    }

    fn flush(&mut self) {
        match self.pending.take() {
            Some(Pending::Copy { offset, len }) => {
                self.out.push(OP_COPY);
                write_varint(&mut self.out, offset as u64);
                write_varint(&mut self.out, len as u64);
                self.copies += len;
            }
            Some(Pending::Insert { start, end }) => {
                self.out.push(OP_INSERT);
                write_varint(&mut self.out, (end - start) as u64);
                self.out.extend_from_slice(&self.target[start..end]);
                self.inserted += end - start;
            }
            None => {}
        }
    }

    fn finish(mut self) -> Vec<u8> {
        self.flush();
        self.out.push(OP_END);
        log::debug!(
            "Diff of {} bytes: {} copied, {} inserted, {} bytes of ops",
            self.target.len(),
            self.copies,
            self.inserted,
            self.out.len()
        );
        self.out
    }
}

pub(crate) fn header_for(source: &[u8], target: &[u8]) -> Header {
    let mut source_hash = [0; 32];
    source_hash.copy_from_slice(&Sha256::digest(source));
    let mut target_hash = [0; 32];
    target_hash.copy_from_slice(&Sha256::digest(target));
    Header {
        source_len: source.len() as u32,
        target_len: target.len() as u32,
        source_hash,
        target_hash,
    }
}

/// Computes the uncompressed diff stream turning `source` into `target`.
///
/// The caller guarantees both images fit the 32-bit lengths of the header.
/// Output depends only on the inputs and `block`, so regenerating a patch
/// yields identical bytes.
pub fn diff(source: &[u8], target: &[u8], block: usize) -> Vec<u8> {
    let block = block.max(4);
    let header = header_for(source, target);
    let mut ops = OpWriter::new(&header, target);

    if source.len() < block || target.len() < block {
        ops.insert(0, target.len());
        return ops.finish();
    }

    let index = BlockIndex::build(source, block);
    let mut literal_start = 0;
    let mut pos = 0;
    let mut rolling = Rolling::new(&target[0..block]);

    while pos + block <= target.len() {
        if let Some(src) = index.find(source, target, pos, rolling.digest()) {
            let mut back = 0;
            while back < pos - literal_start
                && back < src
                && source[src - back - 1] == target[pos - back - 1]
            {
                back += 1;
            }
            let src_start = src - back;
            let tgt_start = pos - back;
            let len = common_prefix(&source[src_start..], &target[tgt_start..]);

            ops.insert(literal_start, tgt_start);
            ops.copy(src_start, len);

            pos = tgt_start + len;
            literal_start = pos;
            if pos + block <= target.len() {
                rolling = Rolling::new(&target[pos..pos + block]);
            }
        } else {
            if pos + block < target.len() {
                rolling.roll(target[pos], target[pos + block]);
            }
            pos += 1;
        }
    }

    ops.insert(literal_start, target.len());
    ops.finish()
}
