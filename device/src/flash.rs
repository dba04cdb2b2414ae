use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use ota_patch::{ImageSink, ImageSource};
use ota_schema::ContentHasher;

const READ_BLOCK: usize = 4096;

/// A fixed size region of non-volatile storage.
pub trait Partition: Send {
    fn capacity(&self) -> u64;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;
    fn erase(&mut self) -> io::Result<()>;
    /// Returns once every completed write is durable.
    fn sync(&mut self) -> io::Result<()>;
}

fn check_bounds(capacity: u64, offset: u64, len: usize) -> io::Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "access of {} bytes at {} exceeds partition of {} bytes",
                len, offset, capacity
            ),
        )),
    }
}

/// RAM backed partition, reads back erased space as 0xFF like NOR flash.
pub struct MemPartition {
    data: Vec<u8>,
}

impl MemPartition {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0xFF; capacity],
        }
    }

    pub fn with_image(image: &[u8], capacity: usize) -> Self {
        let mut partition = Self::new(capacity.max(image.len()));
        partition.data[..image.len()].copy_from_slice(image);
        partition
    }
}

impl Partition for MemPartition {
    fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_bounds(self.capacity(), offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        check_bounds(self.capacity(), offset, data.len())?;
        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self) -> io::Result<()> {
        self.data.fill(0xFF);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Partition stored in a regular file, used by the simulator.
pub struct FilePartition {
    file: File,
    capacity: u64,
}

impl FilePartition {
    pub fn open(path: &Path, capacity: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        let mut partition = Self { file, capacity };
        if len > capacity {
            partition.file.set_len(capacity)?;
        } else if len < capacity {
            partition.fill_erased(len)?;
        }
        Ok(partition)
    }

    /// Writes the erased pattern from `from` to the end of the partition.
    fn fill_erased(&mut self, from: u64) -> io::Result<()> {
        let block = [0xFFu8; READ_BLOCK];
        self.file.seek(SeekFrom::Start(from))?;
        let mut remaining = self.capacity - from;
        while remaining > 0 {
            let n = remaining.min(READ_BLOCK as u64) as usize;
            self.file.write_all(&block[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }
}

impl Partition for FilePartition {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_bounds(self.capacity, offset, buf.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        check_bounds(self.capacity, offset, data.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn erase(&mut self) -> io::Result<()> {
        self.fill_erased(0)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// Shared handle to a partition. Clones refer to the same storage, so a
/// handle kept by the caller sees everything the agent writes and survives
/// the agent being dropped.
#[derive(Clone)]
pub struct PartitionHandle(Arc<Mutex<dyn Partition>>);

impl PartitionHandle {
    pub fn new<P: Partition + 'static>(partition: P) -> Self {
        Self(Arc::new(Mutex::new(partition)))
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, dyn Partition + 'static>> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "partition lock poisoned"))
    }

    pub fn capacity(&self) -> io::Result<u64> {
        Ok(self.lock()?.capacity())
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.lock()?.read_at(offset, buf)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.lock()?.write_at(offset, data)
    }

    pub fn erase(&self) -> io::Result<()> {
        self.lock()?.erase()
    }

    pub fn sync(&self) -> io::Result<()> {
        self.lock()?.sync()
    }

    pub fn read_image(&self, len: u64) -> io::Result<Vec<u8>> {
        let mut image = vec![0; len as usize];
        self.read_at(0, &mut image)?;
        Ok(image)
    }

    /// Content hash of the first `len` bytes.
    pub fn hash(&self, len: u64) -> io::Result<String> {
        let mut hasher = ContentHasher::new();
        let mut buf = [0u8; READ_BLOCK];
        let mut offset = 0;
        while offset < len {
            let n = core::cmp::min(READ_BLOCK as u64, len - offset) as usize;
            self.read_at(offset, &mut buf[..n])?;
            hasher.update(&buf[..n]);
            offset += n as u64;
        }
        Ok(hasher.finalize_hex())
    }
}

impl ImageSink for PartitionHandle {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        PartitionHandle::write_at(self, offset, data)
    }
}

/// The running image as the base a patch reads from.
pub struct ImageView {
    partition: PartitionHandle,
    len: u64,
}

impl ImageView {
    pub fn new(partition: PartitionHandle, len: u64) -> Self {
        Self { partition, len }
    }
}

impl ImageSource for ImageView {
    fn image_len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_bounds(self.len, offset, buf.len())?;
        self.partition.read_at(offset, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_partition_bounds_and_erase() {
        let handle = PartitionHandle::new(MemPartition::with_image(b"firmware", 16));
        assert_eq!(handle.read_image(8).unwrap(), b"firmware".to_vec());
        assert!(handle.write_at(12, b"too long").is_err());

        handle.erase().unwrap();
        assert_eq!(handle.read_image(4).unwrap(), vec![0xFF; 4]);
        assert_eq!(handle.capacity().unwrap(), 16);
    }

    #[test]
    fn clones_share_storage() {
        let handle = PartitionHandle::new(MemPartition::new(8));
        let mut sink = handle.clone();
        ImageSink::write_at(&mut sink, 0, b"abcd").unwrap();
        assert_eq!(handle.read_image(4).unwrap(), b"abcd".to_vec());
        assert_eq!(
            handle.hash(4).unwrap(),
            ota_schema::content_hash(b"abcd")
        );
    }

    #[test]
    fn file_partition_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot-a.bin");
        {
            let mut partition = FilePartition::open(&path, 1024).unwrap();
            partition.write_at(100, b"payload").unwrap();
            partition.sync().unwrap();
        }
        let mut partition = FilePartition::open(&path, 1024).unwrap();
        let mut buf = [0u8; 7];
        partition.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
        assert!(partition.read_at(1020, &mut buf).is_err());
    }

    #[test]
    fn file_partition_erases_to_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot-b.bin");
        let capacity = READ_BLOCK as u64 * 2 + 10;
        let mut partition = FilePartition::open(&path, capacity).unwrap();
        let mut buf = vec![0u8; capacity as usize];
        partition.read_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0xFF));

        partition.write_at(READ_BLOCK as u64 - 2, &[0u8; 8]).unwrap();
        partition.erase().unwrap();
        partition.read_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0xFF));

        let mut mem = MemPartition::new(capacity as usize);
        let mut expected = vec![0u8; capacity as usize];
        mem.read_at(0, &mut expected).unwrap();
        assert_eq!(buf, expected);
    }

    #[test]
    fn image_view_is_limited_to_the_image() {
        let handle = PartitionHandle::new(MemPartition::with_image(b"base", 64));
        let mut view = ImageView::new(handle, 4);
        let mut buf = [0u8; 4];
        view.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"base");
        assert!(view.read_at(2, &mut buf).is_err());
    }
}
