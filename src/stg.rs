use crate::{util, Error, HashSet, Result};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Interface for fixed-size block storage.
///
/// Blocks are addressed by ordinal ( the rowid for a table heap, the
/// page id for an index file ). A storage may be wrapped by the WAL, in
/// which case the wrapper is the object a table interacts with and the
/// transaction hooks apply or discard staged writes.
pub trait Storage {
    /// Allocate a block ( reusing the free-list ) without writing it.
    fn alloc(&mut self) -> Result<i64>;

    /// Allocate a block and write data to it. Result is the block ordinal.
    fn write(&mut self, data: &[u8]) -> Result<i64> {
        let id = self.alloc()?;
        self.write_at(id, data)?;
        Ok(id)
    }

    /// Write data to an existing block.
    fn write_at(&mut self, id: i64, data: &[u8]) -> Result<()>;

    /// Read a block into out ( out may be shorter than the block ).
    fn read(&self, id: i64, out: &mut [u8]) -> Result<()>;

    /// Free a block. The content is left untouched.
    fn delete(&mut self, id: i64) -> Result<()>;

    /// Make sure the block ordinal exists ( used by WAL recovery ).
    fn reserve(&mut self, id: i64) -> Result<()>;

    /// Number of blocks allocated ( high water mark ).
    fn count(&self) -> u64;

    /// Size of one block in bytes.
    fn block_bytes(&self) -> usize;

    /// Total size of the underlying storage in bytes.
    fn bytes(&self) -> u64;

    /// Persist header and free-list, flush data to the file.
    fn save(&mut self) -> Result<()>;

    /// Apply writes staged by the current transaction ( WAL wrappers only ).
    fn tx_apply(&mut self) -> Result<()> {
        Ok(())
    }

    /// Discard writes staged by the current transaction ( WAL wrappers only ).
    fn tx_discard(&mut self) -> Result<()> {
        Ok(())
    }
}

/// File signature.
const SIG: [u8; 4] = *b"ITBL";
/// File format version.
const VERSION: u32 = 1;
/// Size of the file header.
const HSIZE: u64 = 64;

/// Block heap over a memory-mapped file.
///
/// Layout: header, then blocks of `block_bytes`, then ( after a clean
/// save ) the free-list sidecar. The file grows in `increment` chunks
/// and is remapped after each growth. A crash before save loses only
/// the free-list, so freed slots are simply not reused.
pub struct HeapFile {
    file: File,
    map: MmapMut,
    path: PathBuf,
    block_bytes: usize,
    blocks: u64,
    free: Vec<i64>,
    free_set: HashSet<i64>,
    increment: u64,
    compact: u64,
    is_new: bool,
}

impl HeapFile {
    /// Open or create a heap file.
    pub fn open(path: &Path, block_bytes: usize, increment: u64, compact: u64) -> Result<HeapFile> {
        debug_assert!(block_bytes > 0);
        let increment = increment.max(HSIZE + block_bytes as u64);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        let is_new = len == 0;
        if is_new {
            file.set_len(increment)?;
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut x = HeapFile {
            file,
            map,
            path: path.to_path_buf(),
            block_bytes,
            blocks: 0,
            free: Vec::new(),
            free_set: HashSet::default(),
            increment,
            compact,
            is_new,
        };
        if is_new {
            x.write_header();
            log::debug!("created heap file {:?} block_bytes={}", x.path, block_bytes);
        } else {
            x.read_header()?;
        }
        Ok(x)
    }

    /// File was created by this open.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Borrow the block content ( zero-copy view into the map ).
    pub fn slice(&self, id: i64) -> Result<&[u8]> {
        self.check(id)?;
        let off = self.offset(id);
        Ok(&self.map[off..off + self.block_bytes])
    }

    fn offset(&self, id: i64) -> usize {
        HSIZE as usize + id as usize * self.block_bytes
    }

    fn check(&self, id: i64) -> Result<()> {
        if id < 0 || id as u64 >= self.blocks || self.free_set.contains(&id) {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn write_header(&mut self) {
        self.map[0..4].copy_from_slice(&SIG);
        util::setu32(&mut self.map, 4, VERSION);
        util::setu64(&mut self.map, 8, self.block_bytes as u64);
        util::setu64(&mut self.map, 16, self.blocks);
        util::setu64(&mut self.map, 24, 0); // Free-list offset.
        util::setu64(&mut self.map, 32, 0); // Free-list length.
    }

    fn read_header(&mut self) -> Result<()> {
        if self.map.len() < HSIZE as usize || self.map[0..4] != SIG {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{:?} is not a heap file", self.path),
            )));
        }
        let version = util::getu32(&self.map, 4);
        if version != VERSION {
            return Err(Error::Unsupported(format!(
                "heap file version {} (expected {})",
                version, VERSION
            )));
        }
        let bb = util::getu64(&self.map, 8) as usize;
        if bb != self.block_bytes {
            return Err(Error::Unsupported(format!(
                "block size is {} (expected {})",
                bb, self.block_bytes
            )));
        }
        self.blocks = util::getu64(&self.map, 16);
        let free_off = util::getu64(&self.map, 24);
        let free_len = util::getu64(&self.map, 32);
        let free_crc = util::getu32(&self.map, 40);
        if free_off != 0 {
            // The sidecar area can be overwritten by blocks allocated
            // after the save that wrote it; the checksum rejects that.
            let free_end = free_len.saturating_mul(8).saturating_add(free_off);
            if free_end > self.map.len() as u64
                || crc32fast::hash(&self.map[free_off as usize..free_end as usize]) != free_crc
            {
                log::warn!("ignoring damaged free-list in {:?}", self.path);
            } else {
                for i in 0..free_len {
                    let id = util::getu64(&self.map, (free_off + i * 8) as usize) as i64;
                    if id >= 0 && (id as u64) < self.blocks && self.free_set.insert(id) {
                        self.free.push(id);
                    }
                }
            }
            // Mark the list consumed so it cannot be loaded twice.
            util::setu64(&mut self.map, 24, 0);
            util::setu64(&mut self.map, 32, 0);
        }
        Ok(())
    }

    /// Grow the file so that at least n bytes are addressable.
    fn grow(&mut self, n: u64) -> Result<()> {
        let mut len = self.map.len() as u64;
        if n <= len {
            return Ok(());
        }
        while len < n {
            len += self.increment;
        }
        self.map.flush()?;
        self.file.set_len(len)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        log::debug!("grew {:?} to {} bytes", self.path, len);
        Ok(())
    }

    /// Drop trailing free blocks and shrink the file.
    fn compact_tail(&mut self) -> Result<()> {
        let mut dropped = 0_u64;
        while self.blocks > 0 && self.free_set.contains(&(self.blocks as i64 - 1)) {
            let id = self.blocks as i64 - 1;
            self.free_set.remove(&id);
            self.free.retain(|x| *x != id);
            self.blocks -= 1;
            dropped += 1;
        }
        if dropped * self.block_bytes as u64 >= self.compact {
            let len = HSIZE + self.blocks * self.block_bytes as u64 + self.free.len() as u64 * 8;
            self.map.flush()?;
            self.file.set_len(len)?;
            self.map = unsafe { MmapMut::map_mut(&self.file)? };
            log::debug!("compacted {:?}, dropped {} blocks", self.path, dropped);
        } else {
            // Not worth shrinking, put the blocks back on the free-list.
            for _ in 0..dropped {
                let id = self.blocks as i64;
                self.blocks += 1;
                self.free.push(id);
                self.free_set.insert(id);
            }
        }
        Ok(())
    }
}

impl Storage for HeapFile {
    fn alloc(&mut self) -> Result<i64> {
        if let Some(id) = self.free.pop() {
            self.free_set.remove(&id);
            return Ok(id);
        }
        let id = self.blocks as i64;
        self.blocks += 1;
        self.grow(HSIZE + self.blocks * self.block_bytes as u64)?;
        Ok(id)
    }

    fn write_at(&mut self, id: i64, data: &[u8]) -> Result<()> {
        self.check(id)?;
        if data.len() > self.block_bytes {
            return Err(Error::BufferOverflow);
        }
        let off = self.offset(id);
        self.map[off..off + data.len()].copy_from_slice(data);
        for b in &mut self.map[off + data.len()..off + self.block_bytes] {
            *b = 0;
        }
        Ok(())
    }

    fn read(&self, id: i64, out: &mut [u8]) -> Result<()> {
        if out.len() > self.block_bytes {
            return Err(Error::BufferOverflow);
        }
        let s = self.slice(id)?;
        out.copy_from_slice(&s[0..out.len()]);
        Ok(())
    }

    fn delete(&mut self, id: i64) -> Result<()> {
        self.check(id)?;
        self.free.push(id);
        self.free_set.insert(id);
        Ok(())
    }

    fn reserve(&mut self, id: i64) -> Result<()> {
        if id < 0 {
            return Err(Error::NotFound);
        }
        if (id as u64) < self.blocks {
            if self.free_set.remove(&id) {
                self.free.retain(|x| *x != id);
            }
            return Ok(());
        }
        self.blocks = id as u64 + 1;
        self.grow(HSIZE + self.blocks * self.block_bytes as u64)
    }

    fn count(&self) -> u64 {
        self.blocks
    }

    fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    fn bytes(&self) -> u64 {
        self.map.len() as u64
    }

    fn save(&mut self) -> Result<()> {
        if self.compact > 0 {
            self.compact_tail()?;
        }
        // Free-list sidecar after the last block.
        let free_off = HSIZE + self.blocks * self.block_bytes as u64;
        self.grow(free_off + self.free.len() as u64 * 8)?;
        for (i, id) in self.free.iter().enumerate() {
            util::setu64(&mut self.map, free_off as usize + i * 8, *id as u64);
        }
        let crc = crc32fast::hash(
            &self.map[free_off as usize..free_off as usize + self.free.len() * 8],
        );
        util::setu64(&mut self.map, 16, self.blocks);
        util::setu64(&mut self.map, 24, free_off);
        util::setu64(&mut self.map, 32, self.free.len() as u64);
        util::setu32(&mut self.map, 40, crc);
        self.map.flush()?;
        Ok(())
    }
}

/// In-memory storage, used by tests.
#[derive(Default)]
pub struct MemFile {
    blocks: Vec<Vec<u8>>,
    free: Vec<i64>,
    free_set: HashSet<i64>,
    block_bytes: usize,
}

impl MemFile {
    pub fn new(block_bytes: usize) -> Self {
        Self {
            blocks: Vec::new(),
            free: Vec::new(),
            free_set: HashSet::default(),
            block_bytes,
        }
    }

    fn check(&self, id: i64) -> Result<()> {
        if id < 0 || id as usize >= self.blocks.len() || self.free_set.contains(&id) {
            return Err(Error::NotFound);
        }
        Ok(())
    }
}

impl Storage for MemFile {
    fn alloc(&mut self) -> Result<i64> {
        if let Some(id) = self.free.pop() {
            self.free_set.remove(&id);
            return Ok(id);
        }
        self.blocks.push(vec![0; self.block_bytes]);
        Ok(self.blocks.len() as i64 - 1)
    }

    fn write_at(&mut self, id: i64, data: &[u8]) -> Result<()> {
        self.check(id)?;
        if data.len() > self.block_bytes {
            return Err(Error::BufferOverflow);
        }
        let b = &mut self.blocks[id as usize];
        b[0..data.len()].copy_from_slice(data);
        for x in &mut b[data.len()..] {
            *x = 0;
        }
        Ok(())
    }

    fn read(&self, id: i64, out: &mut [u8]) -> Result<()> {
        self.check(id)?;
        if out.len() > self.block_bytes {
            return Err(Error::BufferOverflow);
        }
        out.copy_from_slice(&self.blocks[id as usize][0..out.len()]);
        Ok(())
    }

    fn delete(&mut self, id: i64) -> Result<()> {
        self.check(id)?;
        self.free.push(id);
        self.free_set.insert(id);
        Ok(())
    }

    fn reserve(&mut self, id: i64) -> Result<()> {
        if id < 0 {
            return Err(Error::NotFound);
        }
        if self.free_set.remove(&id) {
            self.free.retain(|x| *x != id);
        }
        while self.blocks.len() <= id as usize {
            self.blocks.push(vec![0; self.block_bytes]);
        }
        Ok(())
    }

    fn count(&self) -> u64 {
        self.blocks.len() as u64
    }

    fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    fn bytes(&self) -> u64 {
        (self.blocks.len() * self.block_bytes) as u64
    }

    fn save(&mut self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn mem_file_test() {
    let mut m = MemFile::new(16);
    let a = m.write(b"hello").unwrap();
    let b = m.write(b"world").unwrap();
    assert_eq!(a, 0);
    assert_eq!(b, 1);
    let mut buf = [0; 5];
    m.read(a, &mut buf).unwrap();
    assert_eq!(&buf, b"hello");
    m.delete(a).unwrap();
    assert!(m.read(a, &mut buf).is_err());
    // Freed slot is reused.
    assert_eq!(m.write(b"again").unwrap(), 0);
}

#[cfg(test)]
mod file_tests {
    use super::*;

    #[test]
    fn heap_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.heap");
        {
            let mut h = HeapFile::open(&path, 32, 4096, 0).unwrap();
            assert!(h.is_new());
            let a = h.write(b"aaaa").unwrap();
            let b = h.write(b"bbbb").unwrap();
            h.delete(b).unwrap();
            assert_eq!(a, 0);
            h.save().unwrap();
        }
        {
            let mut h = HeapFile::open(&path, 32, 4096, 0).unwrap();
            assert!(!h.is_new());
            assert_eq!(h.count(), 2);
            let mut buf = [0; 4];
            h.read(0, &mut buf).unwrap();
            assert_eq!(&buf, b"aaaa");
            // Block 1 was freed and survives on the free-list.
            assert!(h.read(1, &mut buf).is_err());
            assert_eq!(h.write(b"cccc").unwrap(), 1);
        }
    }

    #[test]
    fn heap_grows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.heap");
        let mut h = HeapFile::open(&path, 64, 256, 0).unwrap();
        for i in 0..100_i64 {
            let id = h.write(&[i as u8; 64]).unwrap();
            assert_eq!(id, i);
        }
        let mut buf = [0; 64];
        h.read(99, &mut buf).unwrap();
        assert_eq!(buf[0], 99);
        assert!(h.bytes() >= 64 * 100);
    }

    #[test]
    fn wrong_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.heap");
        std::fs::write(&path, vec![0xFF; 128]).unwrap();
        assert!(HeapFile::open(&path, 32, 4096, 0).is_err());
    }
}
