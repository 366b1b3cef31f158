use crate::{
    btree::BTreeFile,
    buf::{BufPool, ByteBuf},
    cache::RowCache,
    filter::{best_index, Filter},
    stg::{HeapFile, MemFile, Storage},
    util,
    wal::{RecOp, Wal, WalMode, WalStore},
    Cell, Error, Meta, OpenMode, Ordering, Rc, RefCell, Result, Row, Variant,
};
use std::path::{Path, PathBuf};

/// Engine file suffix: heap is `<base>.flint`, schema `<base>.flint.desc`,
/// indexes `<base>.flint.i.<name>`, journal `<base>.flint.wal`.
pub const SUFFIX: &str = "flint";

fn data_path(base: &Path) -> PathBuf {
    PathBuf::from(format!("{}.{}", base.display(), SUFFIX))
}

fn desc_path(base: &Path) -> PathBuf {
    PathBuf::from(format!("{}.{}.desc", base.display(), SUFFIX))
}

fn index_path(base: &Path, name: &str) -> PathBuf {
    PathBuf::from(format!("{}.{}.i.{}", base.display(), SUFFIX, name))
}

fn wal_path(base: &Path) -> PathBuf {
    PathBuf::from(format!("{}.{}.wal", base.display(), SUFFIX))
}

/// Open a table ( schema from the .desc sidecar when not supplied ).
pub fn table_open(base: &Path, mode: OpenMode, schema: Option<Meta>) -> Result<Table> {
    Table::open(base, mode, schema)
}

/// Remove a table's files: heap, schema sidecar, journal and indexes.
pub fn table_drop(base: &Path) -> Result<()> {
    fn rm(p: PathBuf) -> Result<()> {
        match std::fs::remove_file(&p) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
    if let Ok(meta) = Meta::load_desc(&desc_path(base)) {
        for ix in &meta.indexes {
            rm(index_path(base, &ix.name))?;
        }
    }
    rm(data_path(base))?;
    rm(wal_path(base))?;
    rm(desc_path(base))?;
    log::debug!("dropped table {:?}", base);
    Ok(())
}

/// Parsed query consumed by [`Table::find`].
#[derive(Default, Clone)]
pub struct Query {
    /// WHERE expression.
    pub wher: Option<String>,
    /// USE INDEX hint: index name and descending flag.
    pub use_index: Option<(String, bool)>,
    /// ORDER BY columns ( name, descending ), used to steer index choice.
    pub order_by: Vec<(String, bool)>,
    /// LIMIT ( offset, count ).
    pub limit: Option<(usize, usize)>,
}

impl Query {
    pub fn wher(src: &str) -> Query {
        Query {
            wher: Some(src.to_string()),
            ..Query::default()
        }
    }
}

/// A table: block heap, row cache, buffer pool and one B+Tree per index,
/// journaled through a shared WAL when enabled.
///
/// A table is a single-writer object: all mutating operations and
/// transactions go through the exclusivity token `busy`. Distinct tables
/// can be used from distinct threads.
pub struct Table {
    pub meta: Rc<Meta>,
    heap: RefCell<Box<dyn Storage>>,
    indexes: Vec<BTreeFile>,
    wal: Option<Rc<RefCell<Wal>>>,
    cache: Rc<RefCell<RowCache>>,
    pool: RefCell<BufPool>,
    /// Table lock.
    busy: Cell<bool>,
    mode: OpenMode,
    base: Option<PathBuf>,
}

impl Table {
    /// Open or create a table backed by files.
    ///
    /// With an explicit schema and an existing sidecar the two must
    /// serialize identically. If the journal holds committed work that
    /// was never applied ( a crash ), it is replayed before the table
    /// is assembled.
    pub fn open(base: &Path, mode: OpenMode, schema: Option<Meta>) -> Result<Table> {
        let desc = desc_path(base);
        let meta = if desc.exists() {
            let on_disk = Meta::load_desc(&desc)?;
            if let Some(m) = schema {
                if on_disk.to_sql() != m.to_sql() {
                    return Err(Error::Unsupported(format!(
                        "schema for '{}' does not match the existing table",
                        m.name
                    )));
                }
            }
            on_disk
        } else {
            let m = schema.ok_or_else(|| {
                Error::Unsupported(format!("table {:?} does not exist", base))
            })?;
            if mode == OpenMode::ReadWrite {
                m.save_desc(&desc)?;
            }
            m
        };
        let meta = Rc::new(meta);

        let mut stores: Vec<Box<dyn Storage>> = Vec::new();
        stores.push(Box::new(HeapFile::open(
            &data_path(base),
            meta.row_bytes,
            meta.opts.increment,
            meta.opts.compact,
        )?));
        for ix in &meta.indexes {
            stores.push(Box::new(HeapFile::open(
                &index_path(base, &ix.name),
                meta.opts.page,
                meta.opts.increment,
                0,
            )?));
        }

        let wal = if meta.wal.mode != WalMode::Off {
            let mut w = Wal::open(&wal_path(base), meta.wal.clone())?;
            w.recover(&mut |sid, target, op, image| {
                let s = stores
                    .get_mut(sid as usize)
                    .ok_or_else(|| Error::WalCorrupted(format!("unknown storage {}", sid)))?;
                match op {
                    RecOp::Write | RecOp::Update => {
                        s.reserve(target)?;
                        s.write_at(target, image)
                    }
                    RecOp::Delete => match s.delete(target) {
                        Ok(()) | Err(Error::NotFound) => Ok(()),
                        e => e,
                    },
                }
            })?;
            for s in &mut stores {
                s.save()?;
            }
            Some(util::new(w))
        } else {
            None
        };
        log::debug!("opened table {:?}", base);
        Self::assemble(meta, stores, wal, mode, Some(base.to_path_buf()))
    }

    /// Open a table over in-memory storage ( journal disabled ). Used by
    /// tests and scratch tables.
    pub fn open_mem(meta: Meta) -> Result<Table> {
        let meta = Rc::new(meta);
        let mut stores: Vec<Box<dyn Storage>> = Vec::new();
        stores.push(Box::new(MemFile::new(meta.row_bytes)));
        for _ in &meta.indexes {
            stores.push(Box::new(MemFile::new(meta.opts.page)));
        }
        Self::assemble(meta, stores, None, OpenMode::ReadWrite, None)
    }

    fn assemble(
        meta: Rc<Meta>,
        mut stores: Vec<Box<dyn Storage>>,
        wal: Option<Rc<RefCell<Wal>>>,
        mode: OpenMode,
        base: Option<PathBuf>,
    ) -> Result<Table> {
        let cache = Rc::new(RefCell::new(RowCache::new(meta.opts.cache, meta.row_bytes)));
        let heap_raw = stores.remove(0);
        let heap: Box<dyn Storage> = match &wal {
            Some(w) => {
                let c = cache.clone();
                let refresh: Box<dyn Fn(i64)> = Box::new(move |id| {
                    c.borrow_mut().remove(id);
                });
                Box::new(WalStore::new(heap_raw, w.clone(), 0, Some(refresh)))
            }
            None => heap_raw,
        };
        let mut indexes = Vec::new();
        for (i, s) in stores.into_iter().enumerate() {
            let stg: Box<dyn Storage> = match &wal {
                Some(w) => Box::new(WalStore::new(s, w.clone(), (i + 1) as u16, None)),
                None => s,
            };
            indexes.push(BTreeFile::open(stg, meta.opts.cache)?);
        }
        Ok(Table {
            meta,
            heap: RefCell::new(heap),
            indexes,
            wal,
            cache,
            pool: RefCell::new(BufPool::new()),
            busy: Cell::new(false),
            mode,
            base,
        })
    }

    fn writable(&self) -> Result<()> {
        if self.mode != OpenMode::ReadWrite {
            return Err(Error::Unsupported("table is read-only".to_string()));
        }
        Ok(())
    }

    /// Number of rows ( primary index count ).
    pub fn rows(&self) -> u64 {
        self.indexes[0].count_get()
    }

    /// Heap file size in bytes.
    pub fn bytes(&self) -> u64 {
        self.heap.borrow().bytes()
    }

    /// Read a row through the cache.
    pub fn read(&self, rowid: i64) -> Result<Rc<Row>> {
        if let Some(r) = self.cache.borrow_mut().get(rowid) {
            return Ok(r);
        }
        let mut row = Row::new(self.meta.clone());
        self.read_stream(rowid, &mut row)?;
        let row = Rc::new(row);
        self.cache.borrow_mut().put(rowid, row.clone());
        Ok(row)
    }

    /// Read a row into a caller-owned Row, bypassing the cache.
    pub fn read_stream(&self, rowid: i64, dest: &mut Row) -> Result<()> {
        let mut buf = self.pool.borrow_mut().borrow(self.meta.row_bytes);
        let r = self.read_decode(rowid, &mut buf, dest);
        self.pool.borrow_mut().release(buf);
        r
    }

    fn read_decode(&self, rowid: i64, buf: &mut ByteBuf, dest: &mut Row) -> Result<()> {
        self.heap.borrow().read(rowid, buf.as_mut_slice())?;
        dest.decode(buf.as_slice())?;
        dest.id = rowid;
        Ok(())
    }

    /// Order a probe row against a stored row on the given key columns.
    fn cmp_probe(&self, cols: &[usize], probe: &Row, stored: i64) -> Result<Ordering> {
        if probe.id == stored {
            return Ok(Ordering::Equal);
        }
        let r = self.read(stored)?;
        for c in cols {
            let o = probe.values[*c].cmp(&r.values[*c]);
            if o != Ordering::Equal {
                return Ok(o);
            }
        }
        Ok(Ordering::Equal)
    }

    /// Insert or update a row.
    ///
    /// A primary-key match fails with DuplicateKey unless `upsert` is
    /// set, in which case the existing row is rewritten in place and
    /// secondary indexes are maintained. On success `row.id` holds the
    /// assigned rowid.
    pub fn apply(&self, row: &mut Row, upsert: bool) -> Result<()> {
        self.writable()?;
        let opened = self.auto_begin()?;
        let mut buf = self.pool.borrow_mut().borrow(self.meta.row_bytes);
        let r = self.apply_encoded(row, upsert, &mut buf);
        self.pool.borrow_mut().release(buf);
        self.auto_end(opened, r)
    }

    fn apply_encoded(&self, row: &mut Row, upsert: bool, buf: &mut ByteBuf) -> Result<()> {
        row.encode(buf)?;
        let pcols: &[usize] = &self.meta.indexes[0].cols;
        let existing = self.indexes[0].compare_get(&|stored| self.cmp_probe(pcols, row, stored))?;
        match existing {
            Some(old_id) => {
                if !upsert {
                    return Err(Error::DuplicateKey);
                }
                let old = self.read(old_id)?;
                for (i, t) in self.indexes.iter().enumerate().skip(1) {
                    let cols: &[usize] = &self.meta.indexes[i].cols;
                    t.delete(&|stored| self.cmp_probe(cols, &old, stored), old_id)?;
                }
                self.cache.borrow_mut().remove(old_id);
                self.heap.borrow_mut().write_at(old_id, buf.as_slice())?;
                row.id = old_id;
                for (i, t) in self.indexes.iter().enumerate().skip(1) {
                    let cols: &[usize] = &self.meta.indexes[i].cols;
                    t.put(&|stored| self.cmp_probe(cols, row, stored), old_id)?;
                }
            }
            None => {
                let id = self.heap.borrow_mut().write(buf.as_slice())?;
                row.id = id;
                for (i, t) in self.indexes.iter().enumerate() {
                    let cols: &[usize] = &self.meta.indexes[i].cols;
                    t.put(&|stored| self.cmp_probe(cols, row, stored), id)?;
                }
            }
        }
        self.cache.borrow_mut().put(row.id, Rc::new(row.clone()));
        Ok(())
    }

    /// Rewrite the row stored at `rowid` ( which must exist ).
    pub fn apply_at(&self, rowid: i64, row: &mut Row) -> Result<()> {
        self.writable()?;
        let opened = self.auto_begin()?;
        let mut buf = self.pool.borrow_mut().borrow(self.meta.row_bytes);
        let r = self.apply_at_encoded(rowid, row, &mut buf);
        self.pool.borrow_mut().release(buf);
        self.auto_end(opened, r)
    }

    fn apply_at_encoded(&self, rowid: i64, row: &mut Row, buf: &mut ByteBuf) -> Result<()> {
        row.encode(buf)?;
        let old = self.read(rowid)?;
        // A changed primary key must not collide with another row.
        let pcols: &[usize] = &self.meta.indexes[0].cols;
        if let Some(hit) = self.indexes[0].compare_get(&|stored| self.cmp_probe(pcols, row, stored))?
        {
            if hit != rowid {
                return Err(Error::DuplicateKey);
            }
        }
        for (i, t) in self.indexes.iter().enumerate() {
            let cols: &[usize] = &self.meta.indexes[i].cols;
            t.delete(&|stored| self.cmp_probe(cols, &old, stored), rowid)?;
        }
        self.cache.borrow_mut().remove(rowid);
        self.heap.borrow_mut().write_at(rowid, buf.as_slice())?;
        row.id = rowid;
        for (i, t) in self.indexes.iter().enumerate() {
            let cols: &[usize] = &self.meta.indexes[i].cols;
            t.put(&|stored| self.cmp_probe(cols, row, stored), rowid)?;
        }
        self.cache.borrow_mut().put(rowid, Rc::new(row.clone()));
        Ok(())
    }

    /// Delete the row at `rowid`.
    pub fn delete_at(&self, rowid: i64) -> Result<()> {
        self.writable()?;
        let opened = self.auto_begin()?;
        let r = self.delete_inner(rowid);
        self.auto_end(opened, r)
    }

    fn delete_inner(&self, rowid: i64) -> Result<()> {
        let old = self.read(rowid)?;
        for (i, t) in self.indexes.iter().enumerate() {
            let cols: &[usize] = &self.meta.indexes[i].cols;
            t.delete(&|stored| self.cmp_probe(cols, &old, stored), rowid)?;
        }
        self.cache.borrow_mut().remove(rowid);
        self.heap.borrow_mut().delete(rowid)?;
        Ok(())
    }

    /// Look up a single row by index key values ( one string per key column ).
    pub fn one(&self, index: &str, argv: &[&str]) -> Result<Rc<Row>> {
        let ix = self
            .meta
            .index_at(index)
            .ok_or_else(|| Error::IndexMissing(index.to_string()))?;
        let cols: &[usize] = &self.meta.indexes[ix].cols;
        if argv.len() != cols.len() {
            return Err(Error::ColumnMismatch {
                got: argv.len(),
                want: cols.len(),
            });
        }
        let mut probe = Row::new(self.meta.clone());
        for (v, c) in argv.iter().zip(cols.iter()) {
            let col = &self.meta.columns[*c];
            probe.values[*c] = Variant::parse_typed(v, col.typ, col.scale)?;
        }
        match self.indexes[ix].compare_get(&|stored| self.cmp_probe(cols, &probe, stored))? {
            Some(id) => self.read(id),
            None => Err(Error::NotFound),
        }
    }

    /// Plan and start a scan. Parse and compile errors surface here;
    /// row-level errors surface from the cursor.
    pub fn find(&self, q: &Query) -> Result<Cursor> {
        let filter = match &q.wher {
            Some(src) => Some(Filter::compile(src, &self.meta)?),
            None => None,
        };
        let mut ob = Vec::new();
        for (name, d) in &q.order_by {
            let col = self
                .meta
                .column_at(name)
                .ok_or_else(|| Error::Unsupported(format!("unknown column '{}'", name)))?;
            ob.push((col, *d));
        }
        let (ix, mut desc) = match &q.use_index {
            Some((name, d)) => (
                self.meta
                    .index_at(name)
                    .ok_or_else(|| Error::IndexMissing(name.clone()))?,
                *d,
            ),
            None => {
                let ix = best_index(filter.as_ref(), &ob, &self.meta).unwrap_or(0);
                (ix, false)
            }
        };
        if q.use_index.is_none() {
            // An ORDER BY served by this index decides the direction.
            if let Some((col, d)) = ob.first() {
                if self.meta.indexes[ix].cols[0] == *col {
                    desc = *d;
                }
            }
        }
        let (push, residual) = match filter {
            Some(f) => f.split(&self.meta.indexes[ix].cols),
            None => (None, None),
        };
        let push = push.map(Rc::new);
        let table = self;
        let seek: crate::btree::Tri<'_> = match &push {
            Some(f) => {
                let f = f.clone();
                Box::new(move |rid| {
                    let row = table.read(rid)?;
                    Ok(f.seek(&row))
                })
            }
            None => Box::new(crate::btree::in_range),
        };
        let tri: crate::btree::Tri<'_> = match &push {
            Some(f) => {
                let f = f.clone();
                Box::new(move |rid| {
                    let row = table.read(rid)?;
                    Ok(f.tri(&row, desc))
                })
            }
            None => Box::new(crate::btree::in_range),
        };
        let (skip, remaining) = match q.limit {
            Some((off, n)) => (off, n),
            None => (0, usize::MAX),
        };
        Ok(Cursor {
            table: self,
            bt: self.indexes[ix].find(desc, seek, tri),
            residual,
            skip,
            remaining,
        })
    }

    /// Begin an explicit transaction ( requires a journal ).
    pub fn begin(&self) -> Result<Transaction> {
        self.writable()?;
        let wal = self
            .wal
            .as_ref()
            .ok_or_else(|| Error::Unsupported("transactions require a journal".to_string()))?;
        if self.busy.get() {
            return Err(Error::TransactionState("table is locked"));
        }
        let tx = wal.borrow_mut().begin()?;
        self.busy.set(true);
        let counts = self.indexes.iter().map(|t| t.count_get()).collect();
        Ok(Transaction {
            table: self,
            tx,
            counts,
            done: false,
        })
    }

    /// Start an implicit per-statement transaction unless one is open.
    fn auto_begin(&self) -> Result<bool> {
        if self.busy.get() {
            return Ok(false);
        }
        if let Some(w) = &self.wal {
            w.borrow_mut().begin()?;
        }
        self.busy.set(true);
        Ok(true)
    }

    /// Finish an implicit transaction: commit on success, roll back the
    /// in-progress journal transaction on error.
    fn auto_end(&self, opened: bool, r: Result<()>) -> Result<()> {
        match r {
            Ok(()) => {
                if opened {
                    let c = self.commit_current();
                    self.busy.set(false);
                    c
                } else {
                    Ok(())
                }
            }
            Err(e) => {
                let _ = self.rollback_current();
                self.busy.set(false);
                Err(e)
            }
        }
    }

    /// Flush index pages and metadata, commit the journal, then apply
    /// the staged block images. Index metadata is made part of the
    /// journaled write set before the commit record, so recovery either
    /// observes it or replays it.
    fn commit_current(&self) -> Result<()> {
        for t in &self.indexes {
            t.flush()?;
            t.flush_meta()?;
        }
        if let Some(w) = &self.wal {
            let tx = {
                let w = w.borrow();
                w.active()
                    .ok_or(Error::TransactionState("no active transaction"))?
            };
            w.borrow_mut().commit(tx)?;
        }
        self.heap.borrow_mut().tx_apply()?;
        for t in &self.indexes {
            t.tx_apply()?;
        }
        Ok(())
    }

    /// Rewind the journal transaction and refresh in-memory state: the
    /// row cache is cleared and every index drops its page cache and
    /// reloads ( root, count ) from the durable header.
    fn rollback_current(&self) -> Result<()> {
        let w = match &self.wal {
            Some(w) => w,
            None => {
                // No journal, no undo: drop caches only.
                self.cache.borrow_mut().clear();
                return Ok(());
            }
        };
        if let Some(tx) = w.borrow().active() {
            w.borrow_mut().rollback(tx)?;
        }
        self.heap.borrow_mut().tx_discard()?;
        for t in &self.indexes {
            t.tx_discard()?;
            t.reopen()?;
        }
        self.cache.borrow_mut().clear();
        Ok(())
    }

    /// Persist everything and checkpoint the journal.
    pub fn save(&self) -> Result<()> {
        self.writable()?;
        if self.busy.get() {
            return Err(Error::TransactionState("transaction open"));
        }
        for t in &self.indexes {
            t.save()?;
        }
        self.heap.borrow_mut().save()?;
        if let Some(w) = &self.wal {
            w.borrow_mut().checkpoint()?;
        }
        Ok(())
    }
} // end impl Table

impl Drop for Table {
    fn drop(&mut self) {
        if self.mode == OpenMode::ReadWrite && !self.busy.get() {
            if let Err(e) = self.save() {
                log::warn!("save on close failed for {:?}: {}", self.base, e);
            }
        }
    }
}

/// Explicit transaction over one table. Holds the table lock from
/// begin until commit, rollback or close; close without commit rolls
/// back. Dropping an unfinished transaction rolls back too.
pub struct Transaction<'t> {
    table: &'t Table,
    tx: u64,
    /// Per-index key counts at begin.
    counts: Vec<u64>,
    done: bool,
}

impl<'t> Transaction<'t> {
    /// The journal transaction id.
    pub fn id(&self) -> u64 {
        self.tx
    }

    /// The transaction can still be used.
    pub fn validate(&self) -> Result<()> {
        if self.done || !self.table.busy.get() {
            return Err(Error::TransactionState("transaction finished"));
        }
        Ok(())
    }

    pub fn apply(&mut self, row: &mut Row, upsert: bool) -> Result<()> {
        self.validate()?;
        let r = self.table.apply(row, upsert);
        self.note(&r);
        r
    }

    pub fn apply_at(&mut self, rowid: i64, row: &mut Row) -> Result<()> {
        self.validate()?;
        let r = self.table.apply_at(rowid, row);
        self.note(&r);
        r
    }

    pub fn delete_at(&mut self, rowid: i64) -> Result<()> {
        self.validate()?;
        let r = self.table.delete_at(rowid);
        self.note(&r);
        r
    }

    /// A failed operation has already rolled the transaction back.
    fn note(&mut self, r: &Result<()>) {
        if r.is_err() && !self.table.busy.get() {
            self.done = true;
        }
    }

    pub fn commit(&mut self) -> Result<()> {
        self.validate()?;
        let r = self.table.commit_current();
        self.done = true;
        self.table.busy.set(false);
        r
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.validate()?;
        let r = self.table.rollback_current();
        self.done = true;
        self.table.busy.set(false);
        if r.is_ok() {
            debug_assert_eq!(
                self.counts,
                self.table
                    .indexes
                    .iter()
                    .map(|t| t.count_get())
                    .collect::<Vec<u64>>()
            );
        }
        r
    }

    /// Close the transaction, rolling back if not committed.
    pub fn close(&mut self) {
        if !self.done {
            let _ = self.table.rollback_current();
            self.table.busy.set(false);
            self.done = true;
        }
    }
}

impl<'t> Drop for Transaction<'t> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Scan cursor yielding rowids: index range scan with push-down,
/// residual filter and limit applied per step.
pub struct Cursor<'t> {
    table: &'t Table,
    bt: crate::btree::BtCursor<'t>,
    residual: Option<Filter>,
    skip: usize,
    remaining: usize,
}

impl<'t> Iterator for Cursor<'t> {
    type Item = Result<i64>;

    fn next(&mut self) -> Option<<Self as Iterator>::Item> {
        if self.remaining == 0 {
            return None;
        }
        loop {
            let id = match self.bt.next()? {
                Ok(id) => id,
                Err(e) => {
                    self.remaining = 0;
                    return Some(Err(e));
                }
            };
            if let Some(f) = &self.residual {
                match self.table.read(id) {
                    Ok(row) => {
                        if !f.matches(&row) {
                            continue;
                        }
                    }
                    Err(e) => {
                        self.remaining = 0;
                        return Some(Err(e));
                    }
                }
            }
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            self.remaining -= 1;
            return Some(Ok(id));
        }
    }
}
