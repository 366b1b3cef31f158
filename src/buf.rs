use crate::{util, Error, Mutex, Result};

/// Little-endian byte buffer with a read/write position.
///
/// The capacity is fixed once borrowed from a pool; `put` past the end
/// reports [`Error::BufferOverflow`] rather than growing, so a row that
/// does not fit its slot is detected at encode time. `realloc` grows a
/// free-standing buffer explicitly.
pub struct ByteBuf {
    data: Vec<u8>,
    /// Read/write position.
    pos: usize,
    /// Read limit, set by flip().
    limit: usize,
}

impl ByteBuf {
    /// Construct a buffer of n zeroed bytes.
    pub fn new(n: usize) -> Self {
        Self {
            data: vec![0; n],
            pos: 0,
            limit: n,
        }
    }

    /// Construct a buffer over an existing vector ( used by BufPool ).
    pub fn from_vec(mut data: Vec<u8>, n: usize) -> Self {
        data.clear();
        data.resize(n, 0);
        Self {
            data,
            pos: 0,
            limit: n,
        }
    }

    /// Buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Current position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes remaining before the limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    /// Prepare for reading what was just written: limit = position, position = 0.
    pub fn flip(&mut self) {
        self.limit = self.pos;
        self.pos = 0;
    }

    /// Reset position and limit, keeping the allocation.
    pub fn clear(&mut self) {
        self.pos = 0;
        self.limit = self.data.len();
    }

    /// Advance the position by n bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        if self.pos + n > self.limit {
            return Err(Error::BufferOverflow);
        }
        self.pos += n;
        Ok(())
    }

    /// Grow the buffer to n bytes ( new bytes are zero ).
    pub fn realloc(&mut self, n: usize) {
        if n > self.data.len() {
            self.data.resize(n, 0);
        }
        self.limit = self.data.len();
    }

    /// Write bytes at the current position.
    pub fn put(&mut self, bytes: &[u8]) -> Result<()> {
        if self.pos + bytes.len() > self.data.len() {
            return Err(Error::BufferOverflow);
        }
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    /// Write a variable-length field: u16 length followed by the bytes,
    /// zero-padded out to size bytes.
    pub fn array_put(&mut self, bytes: &[u8], size: usize) -> Result<()> {
        if bytes.len() > size || bytes.len() > u16::MAX as usize {
            return Err(Error::BufferOverflow);
        }
        self.put_u16(bytes.len() as u16)?;
        if self.pos + size > self.data.len() {
            return Err(Error::BufferOverflow);
        }
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        for b in &mut self.data[self.pos + bytes.len()..self.pos + size] {
            *b = 0;
        }
        self.pos += size;
        Ok(())
    }

    /// Read a variable-length field written by array_put.
    pub fn array_get(&mut self, size: usize) -> Result<&[u8]> {
        let n = self.get_u16()? as usize;
        if n > size || self.pos + size > self.limit {
            return Err(Error::BufferOverflow);
        }
        let result = &self.data[self.pos..self.pos + n];
        self.pos += size;
        Ok(result)
    }

    /// Read n bytes from the current position.
    pub fn get(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.limit {
            return Err(Error::BufferOverflow);
        }
        let result = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(result)
    }

    pub fn put_i8(&mut self, x: i8) -> Result<()> {
        self.put(&x.to_le_bytes())
    }

    pub fn put_u8(&mut self, x: u8) -> Result<()> {
        self.put(&[x])
    }

    pub fn put_i16(&mut self, x: i16) -> Result<()> {
        self.put(&x.to_le_bytes())
    }

    pub fn put_u16(&mut self, x: u16) -> Result<()> {
        self.put(&x.to_le_bytes())
    }

    pub fn put_i32(&mut self, x: i32) -> Result<()> {
        self.put(&x.to_le_bytes())
    }

    pub fn put_u32(&mut self, x: u32) -> Result<()> {
        self.put(&x.to_le_bytes())
    }

    pub fn put_i64(&mut self, x: i64) -> Result<()> {
        self.put(&x.to_le_bytes())
    }

    pub fn put_u64(&mut self, x: u64) -> Result<()> {
        self.put(&x.to_le_bytes())
    }

    pub fn put_f32(&mut self, x: f32) -> Result<()> {
        self.put(&x.to_le_bytes())
    }

    pub fn put_f64(&mut self, x: f64) -> Result<()> {
        self.put(&x.to_le_bytes())
    }

    pub fn get_i8(&mut self) -> Result<i8> {
        Ok(self.get(1)?[0] as i8)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get(1)?[0])
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        let b = self.get(2)?;
        Ok(i16::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.get(2)?;
        Ok(u16::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let b = self.get(4)?;
        Ok(i32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.get(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        let b = self.get(8)?;
        Ok(i64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.get(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn get_f32(&mut self) -> Result<f32> {
        let b = self.get(4)?;
        Ok(util::getf32(b, 0))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        let b = self.get(8)?;
        Ok(util::getf64(b, 0))
    }

    /// Borrow a sub-range of the buffer. The slice never outlives the buffer.
    pub fn slice(&self, off: usize, len: usize) -> Result<&[u8]> {
        if off + len > self.data.len() {
            return Err(Error::BufferOverflow);
        }
        Ok(&self.data[off..off + len])
    }

    /// Whole buffer contents up to the limit.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[0..self.limit]
    }

    /// Whole buffer contents, mutable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let limit = self.limit;
        &mut self.data[0..limit]
    }

    /// Take the backing vector ( truncated to the limit ).
    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.truncate(self.limit);
        self.data
    }
}

/// Pool of reusable byte buffers, bound to a single table writer.
///
/// borrow/release follow a stack discipline: the most recently released
/// allocation is handed out first, so row-sized buffers are recycled
/// instead of churning the allocator on every encode.
#[derive(Default)]
pub struct BufPool {
    free: Vec<Vec<u8>>,
}

impl BufPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow a buffer of at least n bytes ( zeroed, position 0 ).
    pub fn borrow(&mut self, n: usize) -> ByteBuf {
        while let Some(v) = self.free.pop() {
            if v.capacity() >= n {
                return ByteBuf::from_vec(v, n);
            }
            // Too small, drop it and try the next one.
        }
        ByteBuf::new(n)
    }

    /// Return a buffer to the pool.
    pub fn release(&mut self, buf: ByteBuf) {
        if self.free.len() < 16 {
            self.free.push(buf.into_vec());
        }
    }
}

/// Thread-safe buffer pool, shared by cross-table paths.
#[derive(Default)]
pub struct SharedBufPool {
    pool: Mutex<BufPool>,
}

impl SharedBufPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn borrow(&self, n: usize) -> ByteBuf {
        self.pool.lock().borrow(n)
    }

    pub fn release(&self, buf: ByteBuf) {
        self.pool.lock().release(buf);
    }
}

#[test]
fn byte_buf_test() {
    let mut b = ByteBuf::new(16);
    b.put_u16(2).unwrap();
    b.put_i64(-5).unwrap();
    b.put_f32(1.5).unwrap();
    assert!(b.put_i32(1).is_err()); // Only 2 bytes left.
    b.flip();
    assert_eq!(b.get_u16().unwrap(), 2);
    assert_eq!(b.get_i64().unwrap(), -5);
    assert_eq!(b.get_f32().unwrap(), 1.5);
    assert_eq!(b.remaining(), 0);
}

#[test]
fn array_round_trip() {
    let mut b = ByteBuf::new(32);
    b.array_put(b"hello", 10).unwrap();
    assert_eq!(b.position(), 12);
    b.flip();
    assert_eq!(b.array_get(10).unwrap(), b"hello");
}

#[test]
fn pool_reuse() {
    let mut pool = BufPool::new();
    let b = pool.borrow(64);
    let p = b.as_slice().as_ptr();
    pool.release(b);
    let b2 = pool.borrow(32);
    assert_eq!(b2.capacity(), 32);
    assert_eq!(b2.as_slice().as_ptr(), p);
}
