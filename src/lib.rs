//!
//!ToDo List:
//!
//!Implement BETWEEN and IN in the filter grammar.
//!
//!Repack interior free slots when compact is set ( only trailing blocks are reclaimed today ).
//!
//!Decimal multiply.
//!
//! Embedded relational storage engine: tables with typed columns,
//! primary and secondary B+Tree indexes, a transactional write path
//! backed by a write-ahead log, and a compiled WHERE filter with index
//! push-down.
//! Example program:
//! ```no_run
//! use flintdb::{table_open, Meta, OpenMode, Query, Row, Variant};
//! use std::rc::Rc;
//!
//! fn main() -> flintdb::Result<()> {
//!     let schema = Meta::parse(
//!         "CREATE TABLE event (id uint, name string(20), INDEX primary (id)) WAL=log",
//!     )?;
//!     let table = table_open(
//!         std::path::Path::new("/tmp/event"),
//!         OpenMode::ReadWrite,
//!         Some(schema),
//!     )?;
//!     let mut row = Row::new(table.meta.clone());
//!     row.values[0] = Variant::UInt64(1);
//!     row.values[1] = Variant::Str(Rc::new("hello".to_string()));
//!     table.apply(&mut row, true)?;
//!     for id in table.find(&Query::wher("id = 1"))? {
//!         println!("{}", table.read(id?)?.values[1]);
//!     }
//!     Ok(())
//! }
//! ```
//!
//!General Design
//!
//!A table is a block heap ( fixed-size row slots over a memory-mapped
//!file ) plus one B+Tree per index. The trees store only rowids; key
//!order is resolved by a comparator that reads rows through the table's
//!LRU row cache.
//!
//!When the journal is enabled, the heap and every index file are
//!wrapped by a WAL storage: writes are journaled and staged in memory,
//!commit makes the journal durable and then applies the staged images,
//!rollback simply discards them. Recovery replays committed
//!transactions from the last checkpoint.
//!
//!WHERE expressions compile to a filter tree which is split into an
//!index push-down part ( driven through the B+Tree's tri-state scan
//!filter ) and a residual part applied per row.

use std::{
    cell::{Cell, RefCell},
    cmp::Ordering,
    collections::BTreeSet,
    rc::Rc,
};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

/// B+Tree index of rowids ordered by a row comparator.
pub mod btree;

/// Byte buffers and the per-table buffer pool.
pub mod buf;

/// LRU row cache.
pub mod cache;

/// BCD fixed-scale decimal.
pub mod dec;

/// WHERE compiler, tri-state scan filter, predicate split, index scoring.
pub mod filter;

/// Table schema: columns, indexes, options, CREATE TABLE round-trip.
pub mod meta;

/// B+Tree page layout.
pub mod page;

/// Row and the fixed-width row codec.
pub mod row;

/// Block storage: Storage trait, mmap heap file, in-memory file.
pub mod stg;

/// Table, transaction, query and cursor.
pub mod table;

/// Utility functions.
pub mod util;

/// Tagged values and column data types.
pub mod variant;

/// Write-ahead log and the journaling storage wrapper.
pub mod wal;

#[cfg(test)]
mod test;

// End of modules.

pub use crate::{
    dec::Decimal,
    meta::Meta,
    row::Row,
    table::{table_drop, table_open, Cursor, Query, Table, Transaction},
    variant::{DataType, Variant},
};

/// Result of every fallible engine operation.
pub type Result<T> = std::result::Result<T, Error>;

/// Rowid sentinel: the row has no heap slot yet ( or a lookup missed ).
pub const NOT_FOUND: i64 = -1;

/// How a table file is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

/// Engine errors.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("write past end of buffer")]
    BufferOverflow,

    #[error("row has {got} values, schema has {want} columns")]
    ColumnMismatch { got: usize, want: usize },

    #[error("encoded value exceeds the declared {0} bytes")]
    RowBytesExceeded(usize),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("invalid decimal: {0}")]
    InvalidDecimal(String),

    #[error("duplicate key")]
    DuplicateKey,

    #[error("not found")]
    NotFound,

    #[error("no index named '{0}'")]
    IndexMissing(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("journal corrupted: {0}")]
    WalCorrupted(String),

    #[error("transaction state: {0}")]
    TransactionState(&'static str),
}
