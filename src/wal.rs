use crate::{stg::Storage, util, Error, HashMap, HashSet, Rc, RefCell, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Journal mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalMode {
    /// No journal: writes go straight to storage.
    Off,
    /// Journal, checkpoint keeps prior log bytes in place.
    Log,
    /// Journal, checkpoint truncates the log.
    Truncate,
}

/// Commit durability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    Off,
    /// fdatasync on commit.
    Normal,
    /// Full file sync on commit ( metadata included ).
    Full,
}

/// Journal options, stored in the table schema.
#[derive(Clone, Debug, PartialEq)]
pub struct WalOpts {
    pub mode: WalMode,
    pub sync: SyncMode,
    /// Batch buffer size in bytes.
    pub buffer: usize,
    /// Flush the batch after this many records ( 0 = only when full ).
    pub batch: usize,
    /// Payloads at or above this size bypass the batch buffer.
    pub direct: usize,
    /// Capture pre-images in UPDATE records.
    pub page_data: bool,
}

impl Default for WalOpts {
    fn default() -> Self {
        Self {
            mode: WalMode::Log,
            sync: SyncMode::Normal,
            buffer: 4 * 1024 * 1024,
            batch: 0,
            direct: 64 * 1024,
            page_data: false,
        }
    }
}

/// Log record operations.
const OP_BEGIN: u8 = 1;
const OP_WRITE: u8 = 2;
const OP_UPDATE: u8 = 3;
const OP_DELETE: u8 = 4;
const OP_COMMIT: u8 = 5;
const OP_ROLLBACK: u8 = 6;
const OP_CHECKPOINT: u8 = 7;

/// Replayed operation handed to the recovery callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecOp {
    Write,
    Update,
    Delete,
}

const MAGIC: [u8; 4] = *b"IWAL";
const VERSION: u32 = 1;
/// Header: magic, version, lsn, tx counter, checkpoint lsn, checkpoint offset.
const HDR: u64 = 48;
/// Record header: lsn u64, tx u64, op u8, storage u16, target u64, len u32.
const REC_HDR: usize = 31;
/// Sanity cap on record payloads.
const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Offset-addressed write ( does not move the file position ).
fn pwrite(file: &File, off: u64, data: &[u8]) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(data, off)?;
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut off = off;
        let mut data = data;
        while !data.is_empty() {
            let n = file.seek_write(data, off)?;
            off += n as u64;
            data = &data[n..];
        }
    }
    Ok(())
}

/// Offset-addressed read. Result is false at end of file.
fn pread(file: &File, off: u64, data: &mut [u8]) -> Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        match file.read_exact_at(data, off) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut off = off;
        let mut data = data;
        while !data.is_empty() {
            match file.seek_read(data, off) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    off += n as u64;
                    data = &mut data[n..];
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(true)
    }
}

/// Write-ahead log for one table.
///
/// Records are appended through a batch buffer; payloads at or above the
/// direct-write threshold flush the batch and go straight to the file,
/// avoiding a second copy of page-sized images. Each record carries a
/// CRC32; recovery treats the first record that fails to validate as the
/// end of the log.
pub struct Wal {
    file: File,
    path: PathBuf,
    pub opts: WalOpts,
    lsn: u64,
    tx_counter: u64,
    ckpt_lsn: u64,
    ckpt_off: u64,
    /// Logical end of the log ( includes batched bytes ).
    end: u64,
    batch: Vec<u8>,
    /// File offset of the start of the batch buffer.
    batch_off: u64,
    batch_recs: usize,
    /// Currently open transaction.
    active: Option<u64>,
}

impl Wal {
    /// Open or create the journal file.
    pub fn open(path: &Path, mut opts: WalOpts) -> Result<Wal> {
        opts.direct = opts.direct.clamp(1, opts.buffer.max(1));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        let mut w = Wal {
            file,
            path: path.to_path_buf(),
            opts,
            lsn: 0,
            tx_counter: 0,
            ckpt_lsn: 0,
            ckpt_off: HDR,
            end: len.max(HDR),
            batch: Vec::new(),
            batch_off: 0,
            batch_recs: 0,
            active: None,
        };
        if len == 0 {
            w.write_header()?;
        } else {
            w.read_header()?;
        }
        w.batch_off = w.end;
        Ok(w)
    }

    /// Total log bytes.
    pub fn bytes(&self) -> u64 {
        self.end
    }

    /// The open transaction, if any.
    pub fn active(&self) -> Option<u64> {
        self.active
    }

    fn write_header(&mut self) -> Result<()> {
        let mut h = [0_u8; HDR as usize];
        h[0..4].copy_from_slice(&MAGIC);
        util::setu32(&mut h, 4, VERSION);
        util::setu64(&mut h, 8, self.lsn);
        util::setu64(&mut h, 16, self.tx_counter);
        util::setu64(&mut h, 24, self.ckpt_lsn);
        util::setu64(&mut h, 32, self.ckpt_off);
        pwrite(&self.file, 0, &h)
    }

    fn read_header(&mut self) -> Result<()> {
        let mut h = [0_u8; HDR as usize];
        if !pread(&self.file, 0, &mut h)? || h[0..4] != MAGIC {
            return Err(Error::WalCorrupted(format!("{:?}: bad header", self.path)));
        }
        if util::getu32(&h, 4) != VERSION {
            return Err(Error::WalCorrupted(format!(
                "{:?}: unsupported version",
                self.path
            )));
        }
        self.lsn = util::getu64(&h, 8);
        self.tx_counter = util::getu64(&h, 16);
        self.ckpt_lsn = util::getu64(&h, 24);
        self.ckpt_off = util::getu64(&h, 32).clamp(HDR, self.end);
        Ok(())
    }

    fn sync_file(&self) -> Result<()> {
        match self.opts.sync {
            SyncMode::Off => Ok(()),
            SyncMode::Normal => Ok(self.file.sync_data()?),
            SyncMode::Full => Ok(self.file.sync_all()?),
        }
    }

    fn flush_batch(&mut self) -> Result<()> {
        if !self.batch.is_empty() {
            pwrite(&self.file, self.batch_off, &self.batch)?;
            self.batch.clear();
        }
        self.batch_off = self.end;
        self.batch_recs = 0;
        Ok(())
    }

    /// Append a record, batching or direct-writing by payload size.
    fn append(&mut self, op: u8, tx: u64, sid: u16, target: i64, payloads: &[&[u8]]) -> Result<()> {
        self.lsn += 1;
        let plen: usize = payloads.iter().map(|p| p.len()).sum();
        if plen >= MAX_PAYLOAD as usize {
            return Err(Error::Unsupported("log record too large".to_string()));
        }
        let mut hdr = [0_u8; REC_HDR];
        util::setu64(&mut hdr, 0, self.lsn);
        util::setu64(&mut hdr, 8, tx);
        hdr[16] = op;
        util::setu16(&mut hdr, 17, sid);
        util::setu64(&mut hdr, 19, target as u64);
        util::setu32(&mut hdr, 27, plen as u32);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&hdr);
        for p in payloads {
            hasher.update(p);
        }
        let crc = hasher.finalize();

        let total = REC_HDR + plen + 4;
        if plen >= self.opts.direct {
            // Large payload: flush what is pending, then write in place.
            self.flush_batch()?;
            let mut off = self.end;
            pwrite(&self.file, off, &hdr)?;
            off += REC_HDR as u64;
            for p in payloads {
                pwrite(&self.file, off, p)?;
                off += p.len() as u64;
            }
            pwrite(&self.file, off, &crc.to_le_bytes())?;
            self.end += total as u64;
            self.batch_off = self.end;
        } else {
            self.batch.extend_from_slice(&hdr);
            for p in payloads {
                self.batch.extend_from_slice(p);
            }
            self.batch.extend_from_slice(&crc.to_le_bytes());
            self.end += total as u64;
            self.batch_recs += 1;
            if self.batch.len() >= self.opts.buffer
                || (self.opts.batch > 0 && self.batch_recs >= self.opts.batch)
            {
                self.flush_batch()?;
            }
        }
        Ok(())
    }

    fn check_tx(&self, tx: u64) -> Result<()> {
        if self.active != Some(tx) {
            return Err(Error::TransactionState("transaction is not active"));
        }
        Ok(())
    }

    /// Start a transaction. Result is its id.
    pub fn begin(&mut self) -> Result<u64> {
        if self.active.is_some() {
            return Err(Error::TransactionState("transaction already active"));
        }
        self.tx_counter += 1;
        let tx = self.tx_counter;
        self.active = Some(tx);
        self.append(OP_BEGIN, tx, 0, 0, &[])?;
        Ok(tx)
    }

    /// Journal a fresh-slot write.
    pub fn log_write(&mut self, tx: u64, sid: u16, target: i64, image: &[u8]) -> Result<()> {
        self.check_tx(tx)?;
        self.append(OP_WRITE, tx, sid, target, &[image])
    }

    /// Journal an overwrite. The payload is a u32 image length, the new
    /// image, then the pre-image when page-image capture is on.
    pub fn log_update(
        &mut self,
        tx: u64,
        sid: u16,
        target: i64,
        image: &[u8],
        pre: Option<&[u8]>,
    ) -> Result<()> {
        self.check_tx(tx)?;
        let len = (image.len() as u32).to_le_bytes();
        match pre {
            Some(pre) => self.append(OP_UPDATE, tx, sid, target, &[&len, image, pre]),
            None => self.append(OP_UPDATE, tx, sid, target, &[&len, image]),
        }
    }

    /// Journal a block delete.
    pub fn log_delete(&mut self, tx: u64, sid: u16, target: i64) -> Result<()> {
        self.check_tx(tx)?;
        self.append(OP_DELETE, tx, sid, target, &[])
    }

    /// Commit: append the commit record, flush the batch, make the
    /// header durable and sync per the configured mode.
    pub fn commit(&mut self, tx: u64) -> Result<()> {
        self.check_tx(tx)?;
        self.append(OP_COMMIT, tx, 0, 0, &[])?;
        self.flush_batch()?;
        self.write_header()?;
        self.sync_file()?;
        self.active = None;
        Ok(())
    }

    /// Roll back: append the rollback record. Recovery also treats a
    /// transaction with no commit record as rolled back.
    pub fn rollback(&mut self, tx: u64) -> Result<()> {
        self.check_tx(tx)?;
        self.append(OP_ROLLBACK, tx, 0, 0, &[])?;
        self.flush_batch()?;
        self.active = None;
        Ok(())
    }

    /// Emit a checkpoint and truncate or retain prior log bytes per mode.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.flush_batch()?;
        if self.opts.mode == WalMode::Truncate {
            self.file.set_len(HDR)?;
            self.end = HDR;
            self.batch_off = HDR;
        }
        self.ckpt_off = self.end;
        self.ckpt_lsn = self.lsn + 1;
        self.append(OP_CHECKPOINT, 0, 0, 0, &[])?;
        self.flush_batch()?;
        self.write_header()?;
        self.sync_file()?;
        log::debug!(
            "checkpoint {:?} lsn={} off={}",
            self.path,
            self.ckpt_lsn,
            self.ckpt_off
        );
        Ok(())
    }

    /// Replay the log from the last checkpoint.
    ///
    /// Operations are buffered per transaction; when a COMMIT record is
    /// seen they are handed to `apply` in order. Transactions with a
    /// ROLLBACK record, or none at all, are discarded. The first record
    /// with a bad checksum ( or a short read ) ends the scan. A fresh
    /// checkpoint is emitted afterwards.
    pub fn recover(
        &mut self,
        apply: &mut dyn FnMut(u16, i64, RecOp, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let mut off = self.ckpt_off;
        let mut pending: HashMap<u64, Vec<(u16, i64, RecOp, Vec<u8>)>> = HashMap::default();
        let mut committed = 0_usize;
        let mut discarded = 0_usize;
        let mut last_lsn = 0_u64;
        loop {
            let mut hdr = [0_u8; REC_HDR];
            if !pread(&self.file, off, &mut hdr)? {
                break;
            }
            let lsn = util::getu64(&hdr, 0);
            let tx = util::getu64(&hdr, 8);
            let op = hdr[16];
            let sid = util::getu16(&hdr, 17);
            let target = util::getu64(&hdr, 19) as i64;
            let plen = util::getu32(&hdr, 27);
            if op == 0 || op > OP_CHECKPOINT || plen >= MAX_PAYLOAD || lsn == 0 {
                break;
            }
            if last_lsn != 0 && lsn <= last_lsn {
                break; // Stale bytes from an earlier log generation.
            }
            let mut body = vec![0_u8; plen as usize + 4];
            if !pread(&self.file, off + REC_HDR as u64, &mut body)? {
                break;
            }
            let crc = util::getu32(&body, plen as usize);
            body.truncate(plen as usize);
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&hdr);
            hasher.update(&body);
            if hasher.finalize() != crc {
                log::warn!("{:?}: checksum mismatch at offset {}, log ends", self.path, off);
                break;
            }
            last_lsn = lsn;
            match op {
                OP_BEGIN => {
                    pending.insert(tx, Vec::new());
                }
                OP_WRITE => {
                    if let Some(ops) = pending.get_mut(&tx) {
                        ops.push((sid, target, RecOp::Write, body));
                    }
                }
                OP_UPDATE => {
                    if let Some(ops) = pending.get_mut(&tx) {
                        // Strip the image length prefix and any pre-image.
                        if body.len() < 4 {
                            return Err(Error::WalCorrupted("short update record".to_string()));
                        }
                        let n = util::getu32(&body, 0) as usize;
                        if 4 + n > body.len() {
                            return Err(Error::WalCorrupted("bad update image".to_string()));
                        }
                        ops.push((sid, target, RecOp::Update, body[4..4 + n].to_vec()));
                    }
                }
                OP_DELETE => {
                    if let Some(ops) = pending.get_mut(&tx) {
                        ops.push((sid, target, RecOp::Delete, Vec::new()));
                    }
                }
                OP_COMMIT => {
                    if let Some(ops) = pending.remove(&tx) {
                        for (sid, target, op, image) in ops {
                            apply(sid, target, op, &image)?;
                        }
                        committed += 1;
                    }
                }
                OP_ROLLBACK => {
                    if pending.remove(&tx).is_some() {
                        discarded += 1;
                    }
                }
                OP_CHECKPOINT => {
                    self.ckpt_lsn = lsn;
                }
                _ => unreachable!(),
            }
            self.lsn = self.lsn.max(lsn);
            self.tx_counter = self.tx_counter.max(tx);
            off += (REC_HDR + plen as usize + 4) as u64;
        }
        discarded += pending.len();
        self.end = off;
        self.batch_off = off;
        if committed > 0 || discarded > 0 {
            log::debug!(
                "recovered {:?}: {} committed, {} discarded",
                self.path,
                committed,
                discarded
            );
        }
        self.checkpoint()
    }
} // end impl Wal

/// Storage wrapper that journals writes through the WAL.
///
/// While a transaction is open, writes are journaled and staged in
/// memory, one image per target block; reads consult the staged images
/// first. Commit applies the staged images to the underlying storage
/// ( after the WAL commit record is durable ), rollback discards them,
/// so undo never rewrites the data file. With no open transaction the
/// wrapper passes straight through.
pub struct WalStore {
    inner: Box<dyn Storage>,
    wal: Rc<RefCell<Wal>>,
    /// Ordinal this storage registered with the WAL.
    sid: u16,
    /// Staged images; None marks a staged delete.
    staged: HashMap<i64, Option<Vec<u8>>>,
    /// Blocks allocated by the open transaction.
    allocs: HashSet<i64>,
    /// Cache invalidation hook, fired when an image is applied.
    refresh: Option<Box<dyn Fn(i64)>>,
}

impl WalStore {
    pub fn new(
        inner: Box<dyn Storage>,
        wal: Rc<RefCell<Wal>>,
        sid: u16,
        refresh: Option<Box<dyn Fn(i64)>>,
    ) -> Self {
        Self {
            inner,
            wal,
            sid,
            staged: HashMap::default(),
            allocs: HashSet::default(),
            refresh,
        }
    }

    /// The wrapped storage ( recovery writes to it directly ).
    pub fn inner_mut(&mut self) -> &mut dyn Storage {
        &mut *self.inner
    }

    fn tx(&self) -> Option<u64> {
        self.wal.borrow().active()
    }

    fn fire_refresh(&self, id: i64) {
        if let Some(f) = &self.refresh {
            f(id);
        }
    }
}

impl Storage for WalStore {
    fn alloc(&mut self) -> Result<i64> {
        let id = self.inner.alloc()?;
        if self.tx().is_some() {
            self.allocs.insert(id);
        }
        Ok(id)
    }

    fn write_at(&mut self, id: i64, data: &[u8]) -> Result<()> {
        let tx = match self.tx() {
            Some(tx) => tx,
            None => return self.inner.write_at(id, data),
        };
        if self.allocs.contains(&id) && !self.staged.contains_key(&id) {
            self.wal.borrow_mut().log_write(tx, self.sid, id, data)?;
        } else {
            let page_data = self.wal.borrow().opts.page_data;
            let pre = if page_data && !self.staged.contains_key(&id) && !self.allocs.contains(&id) {
                let mut old = vec![0; self.inner.block_bytes()];
                match self.inner.read(id, &mut old) {
                    Ok(()) => Some(old),
                    Err(Error::NotFound) => None,
                    Err(e) => return Err(e),
                }
            } else {
                None
            };
            self.wal
                .borrow_mut()
                .log_update(tx, self.sid, id, data, pre.as_deref())?;
        }
        self.staged.insert(id, Some(data.to_vec()));
        Ok(())
    }

    fn read(&self, id: i64, out: &mut [u8]) -> Result<()> {
        match self.staged.get(&id) {
            Some(Some(d)) => {
                let n = out.len().min(d.len());
                out[0..n].copy_from_slice(&d[0..n]);
                for b in &mut out[n..] {
                    *b = 0;
                }
                Ok(())
            }
            Some(None) => Err(Error::NotFound),
            None => self.inner.read(id, out),
        }
    }

    fn delete(&mut self, id: i64) -> Result<()> {
        let tx = match self.tx() {
            Some(tx) => tx,
            None => return self.inner.delete(id),
        };
        self.wal.borrow_mut().log_delete(tx, self.sid, id)?;
        self.staged.insert(id, None);
        Ok(())
    }

    fn reserve(&mut self, id: i64) -> Result<()> {
        self.inner.reserve(id)
    }

    fn count(&self) -> u64 {
        self.inner.count()
    }

    fn block_bytes(&self) -> usize {
        self.inner.block_bytes()
    }

    fn bytes(&self) -> u64 {
        self.inner.bytes()
    }

    fn save(&mut self) -> Result<()> {
        self.inner.save()
    }

    fn tx_apply(&mut self) -> Result<()> {
        for (id, image) in std::mem::take(&mut self.staged) {
            match image {
                Some(d) => {
                    self.inner.reserve(id)?;
                    self.inner.write_at(id, &d)?;
                }
                None => match self.inner.delete(id) {
                    Ok(()) | Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                },
            }
            self.fire_refresh(id);
        }
        self.allocs.clear();
        Ok(())
    }

    fn tx_discard(&mut self) -> Result<()> {
        self.staged.clear();
        for id in std::mem::take(&mut self.allocs) {
            match self.inner.delete(id) {
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stg::MemFile;
    use crate::util;

    fn wal_opts(direct: usize) -> WalOpts {
        WalOpts {
            direct,
            sync: SyncMode::Off,
            ..WalOpts::default()
        }
    }

    #[test]
    fn batch_and_direct() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wal");
        let mut w = Wal::open(&path, wal_opts(100)).unwrap();
        let tx = w.begin().unwrap();

        // Payload below the threshold stays in the batch buffer.
        w.log_write(tx, 0, 1, &vec![7_u8; 99]).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), HDR);

        // Payload at the threshold flushes the batch and is written directly.
        w.log_write(tx, 0, 2, &vec![8_u8; 100]).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), w.bytes());

        w.commit(tx).unwrap();
    }

    #[test]
    fn double_begin_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = Wal::open(&dir.path().join("t.wal"), wal_opts(64)).unwrap();
        let tx = w.begin().unwrap();
        assert!(matches!(w.begin(), Err(Error::TransactionState(_))));
        assert!(matches!(w.commit(tx + 1), Err(Error::TransactionState(_))));
        w.rollback(tx).unwrap();
        assert!(w.begin().is_ok());
    }

    #[test]
    fn recovery_applies_committed_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wal");
        {
            let mut w = Wal::open(&path, wal_opts(1024)).unwrap();
            let tx = w.begin().unwrap();
            w.log_write(tx, 0, 0, b"first").unwrap();
            w.log_write(tx, 1, 3, b"index").unwrap();
            w.commit(tx).unwrap();
            let tx = w.begin().unwrap();
            w.log_write(tx, 0, 1, b"orphan").unwrap();
            w.flush_batch().unwrap();
            // No commit: drop the wal as a crash would.
        }
        let mut w = Wal::open(&path, wal_opts(1024)).unwrap();
        let mut applied = Vec::new();
        w.recover(&mut |sid, target, op, image| {
            applied.push((sid, target, op, image.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            applied,
            vec![
                (0, 0, RecOp::Write, b"first".to_vec()),
                (1, 3, RecOp::Write, b"index".to_vec()),
            ]
        );
        // Recovery checkpointed: a second replay applies nothing.
        let mut n = 0;
        w.recover(&mut |_, _, _, _| {
            n += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn corrupt_tail_ends_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wal");
        {
            let mut w = Wal::open(&path, wal_opts(1024)).unwrap();
            let tx = w.begin().unwrap();
            w.log_write(tx, 0, 0, b"good").unwrap();
            w.commit(tx).unwrap();
            let tx = w.begin().unwrap();
            w.log_write(tx, 0, 1, b"torn").unwrap();
            w.commit(tx).unwrap();
        }
        // Flip a byte inside the second transaction's write record.
        let mut bytes = std::fs::read(&path).unwrap();
        let n = bytes.len();
        bytes[n - 20] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let mut w = Wal::open(&path, wal_opts(1024)).unwrap();
        let mut applied = Vec::new();
        w.recover(&mut |_, target, _, image| {
            applied.push((target, image.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(applied, vec![(0, b"good".to_vec())]);
    }

    #[test]
    fn update_pre_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wal");
        let mut opts = wal_opts(1024);
        opts.page_data = true;
        let mut w = Wal::open(&path, opts).unwrap();
        let tx = w.begin().unwrap();
        w.log_update(tx, 0, 5, b"new image", Some(b"old image")).unwrap();
        w.commit(tx).unwrap();
        drop(w);

        let mut w = Wal::open(&path, wal_opts(1024)).unwrap();
        let mut applied = Vec::new();
        w.recover(&mut |_, target, op, image| {
            applied.push((target, op, image.to_vec()));
            Ok(())
        })
        .unwrap();
        // Recovery applies the new image; the pre-image is only logged.
        assert_eq!(applied, vec![(5, RecOp::Update, b"new image".to_vec())]);
    }

    #[test]
    fn wal_store_stages_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let wal = util::new(Wal::open(&dir.path().join("t.wal"), wal_opts(1024)).unwrap());
        let mut s = WalStore::new(Box::new(MemFile::new(16)), wal.clone(), 0, None);

        let tx = wal.borrow_mut().begin().unwrap();
        let id = s.write(b"hello").unwrap();
        // Read through the wrapper sees the staged image.
        let mut buf = [0_u8; 5];
        s.read(id, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        // The underlying storage does not, yet.
        assert!(s.inner.read(id, &mut buf).is_err() || buf != *b"hello");

        wal.borrow_mut().commit(tx).unwrap();
        s.tx_apply().unwrap();
        let mut buf = [0_u8; 5];
        s.inner.read(id, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn wal_store_rollback_discards() {
        let dir = tempfile::tempdir().unwrap();
        let wal = util::new(Wal::open(&dir.path().join("t.wal"), wal_opts(1024)).unwrap());
        let mut s = WalStore::new(Box::new(MemFile::new(16)), wal.clone(), 0, None);

        // Committed base row.
        let tx = wal.borrow_mut().begin().unwrap();
        let id = s.write(b"base").unwrap();
        wal.borrow_mut().commit(tx).unwrap();
        s.tx_apply().unwrap();

        // Update and delete inside a rolled back transaction.
        let tx = wal.borrow_mut().begin().unwrap();
        s.write_at(id, b"changed").unwrap();
        let extra = s.write(b"extra").unwrap();
        wal.borrow_mut().rollback(tx).unwrap();
        s.tx_discard().unwrap();

        let mut buf = [0_u8; 4];
        s.read(id, &mut buf).unwrap();
        assert_eq!(&buf, b"base");
        assert!(s.read(extra, &mut [0_u8; 4]).is_err());
        // The extra slot went back on the free-list.
        assert_eq!(s.alloc().unwrap(), extra);
    }
}
