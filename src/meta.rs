use crate::{
    wal::{SyncMode, WalMode, WalOpts},
    DataType, Error, HashMap, Result, Variant,
};

/// Maximum number of columns in a table.
pub const MAX_COLUMNS: usize = 200;
/// Maximum number of indexes ( including primary ).
pub const MAX_INDEXES: usize = 5;
/// Maximum number of key columns per index.
pub const MAX_KEYS: usize = 5;
/// Maximum length of a table, column or index name in bytes.
pub const MAX_NAME: usize = 40;

/// Default declared byte budget for string/bytes columns.
const DEFAULT_VAR_BYTES: usize = 255;
/// Byte budget for a decimal column ( sign + scale + 16 BCD bytes ).
const DECIMAL_BYTES: usize = 18;

/// Column definition.
#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    pub name: String,
    pub typ: DataType,
    /// Declared payload byte budget ( variable types only ).
    pub bytes: usize,
    /// Fraction digits ( decimal only ).
    pub scale: u8,
    pub nullable: bool,
    pub default: Option<Variant>,
    pub comment: Option<String>,
}

impl Column {
    /// Encoded width of this column: 2 byte tag plus payload.
    /// Variable types pay a 2 byte length prefix plus their budget.
    pub fn width(&self) -> usize {
        match self.typ.fixed_width() {
            Some(n) => 2 + n,
            None => 2 + 2 + self.bytes,
        }
    }
}

/// Index definition: name plus key column ordinals.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexDef {
    pub name: String,
    pub cols: Vec<usize>,
}

/// Storage tuning options.
#[derive(Clone, Debug, PartialEq)]
pub struct TableOpts {
    /// File growth chunk in bytes.
    pub increment: u64,
    /// Compact-on-save when more than this many bytes of trailing blocks are free ( 0 = off ).
    pub compact: u64,
    /// Row cache budget in bytes.
    pub cache: usize,
    /// B+Tree page size in bytes.
    pub page: usize,
}

impl Default for TableOpts {
    fn default() -> Self {
        Self {
            increment: 16 * 1024 * 1024,
            compact: 0,
            cache: 1024 * 1024,
            page: 4096,
        }
    }
}

/// Table schema: columns, indexes and engine options.
#[derive(Debug)]
pub struct Meta {
    pub name: String,
    pub columns: Vec<Column>,
    pub indexes: Vec<IndexDef>,
    pub opts: TableOpts,
    pub wal: WalOpts,
    /// Fixed encoded row width.
    pub row_bytes: usize,
    /// Column name to ordinal.
    colmap: HashMap<String, usize>,
}

impl Meta {
    /// Build a schema, validating limits and computing the row width.
    pub fn new(
        name: &str,
        columns: Vec<Column>,
        indexes: Vec<IndexDef>,
        opts: TableOpts,
        wal: WalOpts,
    ) -> Result<Meta> {
        check_name(name)?;
        if columns.is_empty() || columns.len() > MAX_COLUMNS {
            return Err(Error::Unsupported(format!(
                "table must have 1..={} columns",
                MAX_COLUMNS
            )));
        }
        if indexes.is_empty() || indexes.len() > MAX_INDEXES {
            return Err(Error::Unsupported(format!(
                "table must have 1..={} indexes",
                MAX_INDEXES
            )));
        }
        if indexes[0].name != "primary" {
            return Err(Error::Unsupported(
                "first index must be named 'primary'".to_string(),
            ));
        }
        let mut colmap = HashMap::default();
        for (ix, c) in columns.iter().enumerate() {
            check_name(&c.name)?;
            if colmap.insert(c.name.clone(), ix).is_some() {
                return Err(Error::Unsupported(format!("duplicate column '{}'", c.name)));
            }
        }
        let mut ixnames = HashMap::default();
        for ix in &indexes {
            check_name(&ix.name)?;
            if ixnames.insert(ix.name.clone(), ()).is_some() {
                return Err(Error::Unsupported(format!("duplicate index '{}'", ix.name)));
            }
            if ix.cols.is_empty() || ix.cols.len() > MAX_KEYS {
                return Err(Error::Unsupported(format!(
                    "index '{}' must have 1..={} keys",
                    ix.name, MAX_KEYS
                )));
            }
            for c in &ix.cols {
                if *c >= columns.len() {
                    return Err(Error::Unsupported(format!(
                        "index '{}' references unknown column",
                        ix.name
                    )));
                }
            }
        }
        let row_bytes = 2 + columns.iter().map(Column::width).sum::<usize>();
        Ok(Meta {
            name: name.to_string(),
            columns,
            indexes,
            opts,
            wal,
            row_bytes,
            colmap,
        })
    }

    /// Get a column ordinal by name.
    pub fn column_at(&self, name: &str) -> Option<usize> {
        self.colmap.get(name).copied()
    }

    /// Get an index ordinal by name.
    pub fn index_at(&self, name: &str) -> Option<usize> {
        self.indexes.iter().position(|ix| ix.name == name)
    }

    /// Parse a CREATE TABLE definition.
    pub fn parse(src: &str) -> Result<Meta> {
        let mut p = Lex::new(src);
        p.expect_id("CREATE")?;
        p.expect_id("TABLE")?;
        let name = p.ident()?;
        p.expect(b'(')?;

        let mut columns = Vec::new();
        let mut indexes: Vec<IndexDef> = Vec::new();
        let mut colnames: Vec<String> = Vec::new();
        loop {
            if p.test_id("INDEX") {
                let iname = p.ident()?;
                p.expect(b'(')?;
                let mut cols = Vec::new();
                loop {
                    let cname = p.ident()?;
                    let cn = colnames
                        .iter()
                        .position(|n| *n == cname)
                        .ok_or_else(|| {
                            Error::Unsupported(format!("index references unknown column '{}'", cname))
                        })?;
                    cols.push(cn);
                    if !p.test(b',') {
                        break;
                    }
                }
                p.expect(b')')?;
                indexes.push(IndexDef { name: iname, cols });
            } else {
                let col = parse_column(&mut p)?;
                colnames.push(col.name.clone());
                columns.push(col);
            }
            if !p.test(b',') {
                break;
            }
        }
        p.expect(b')')?;

        let mut opts = TableOpts::default();
        let mut wal = WalOpts::default();
        while let Some(key) = p.maybe_ident() {
            p.expect(b'=')?;
            match key.to_uppercase().as_str() {
                "INCREMENT" => opts.increment = p.number()? as u64,
                "COMPACT" => opts.compact = p.number()? as u64,
                "CACHE" => opts.cache = p.number()? as usize,
                "PAGE" => opts.page = p.number()? as usize,
                "WAL" => {
                    wal.mode = match p.ident()?.to_uppercase().as_str() {
                        "OFF" => WalMode::Off,
                        "LOG" => WalMode::Log,
                        "TRUNCATE" => WalMode::Truncate,
                        m => return Err(Error::Unsupported(format!("WAL mode '{}'", m))),
                    }
                }
                "WAL_SYNC" => {
                    wal.sync = match p.ident()?.to_uppercase().as_str() {
                        "OFF" => SyncMode::Off,
                        "NORMAL" => SyncMode::Normal,
                        "FULL" => SyncMode::Full,
                        m => return Err(Error::Unsupported(format!("sync mode '{}'", m))),
                    }
                }
                "WAL_BUFFER" => wal.buffer = p.number()? as usize,
                "WAL_BATCH" => wal.batch = p.number()? as usize,
                "WAL_DIRECT" => wal.direct = p.number()? as usize,
                "WAL_PAGE_DATA" => wal.page_data = p.number()? != 0,
                k => return Err(Error::Unsupported(format!("option '{}'", k))),
            }
        }
        p.end()?;
        Meta::new(&name, columns, indexes, opts, wal)
    }

    /// Serialize to a CREATE TABLE definition. parse(to_sql(m)) reproduces m.
    pub fn to_sql(&self) -> String {
        let mut s = format!("CREATE TABLE {} (\n", self.name);
        for c in &self.columns {
            s.push_str("  ");
            s.push_str(&c.name);
            s.push(' ');
            s.push_str(c.typ.name());
            match c.typ {
                DataType::Str | DataType::Bytes => {
                    s.push_str(&format!("({})", c.bytes));
                }
                DataType::Decimal => {
                    s.push_str(&format!("({})", c.scale));
                }
                _ => {}
            }
            if !c.nullable {
                s.push_str(" NOT NULL");
            }
            if let Some(d) = &c.default {
                match d {
                    Variant::Str(x) => {
                        s.push_str(&format!(" DEFAULT '{}'", x.replace('\'', "''")))
                    }
                    d => s.push_str(&format!(" DEFAULT {}", d)),
                }
            }
            if let Some(cm) = &c.comment {
                s.push_str(&format!(" COMMENT '{}'", cm.replace('\'', "''")));
            }
            s.push_str(",\n");
        }
        for (n, ix) in self.indexes.iter().enumerate() {
            let cols: Vec<&str> = ix.cols.iter().map(|c| self.columns[*c].name.as_str()).collect();
            s.push_str(&format!("  INDEX {} ({})", ix.name, cols.join(",")));
            if n + 1 < self.indexes.len() {
                s.push(',');
            }
            s.push('\n');
        }
        s.push(')');
        s.push_str(&format!(
            " INCREMENT={} COMPACT={} CACHE={} PAGE={}",
            self.opts.increment, self.opts.compact, self.opts.cache, self.opts.page
        ));
        s.push_str(&format!(
            " WAL={} WAL_SYNC={} WAL_BUFFER={} WAL_BATCH={} WAL_DIRECT={} WAL_PAGE_DATA={}",
            match self.wal.mode {
                WalMode::Off => "off",
                WalMode::Log => "log",
                WalMode::Truncate => "truncate",
            },
            match self.wal.sync {
                SyncMode::Off => "off",
                SyncMode::Normal => "normal",
                SyncMode::Full => "full",
            },
            self.wal.buffer,
            self.wal.batch,
            self.wal.direct,
            self.wal.page_data as u8
        ));
        s.push('\n');
        s
    }

    /// Write the schema sidecar next to the data file.
    pub fn save_desc(&self, path: &std::path::Path) -> Result<()> {
        std::fs::write(path, self.to_sql())?;
        Ok(())
    }

    /// Read the schema sidecar.
    pub fn load_desc(path: &std::path::Path) -> Result<Meta> {
        let s = std::fs::read_to_string(path)?;
        Meta::parse(&s)
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME {
        return Err(Error::Unsupported(format!(
            "name '{}' must be 1..={} bytes",
            name, MAX_NAME
        )));
    }
    Ok(())
}

fn parse_column(p: &mut Lex) -> Result<Column> {
    let name = p.ident()?;
    let tname = p.ident()?;
    let mut col = Column {
        name,
        typ: type_from_name(&tname)?,
        bytes: 0,
        scale: 0,
        nullable: true,
        default: None,
        comment: None,
    };
    match col.typ {
        DataType::Str | DataType::Bytes => col.bytes = DEFAULT_VAR_BYTES,
        DataType::Decimal => col.bytes = DECIMAL_BYTES,
        _ => {}
    }
    if p.test(b'(') {
        let n = p.number()?;
        match col.typ {
            DataType::Str | DataType::Bytes => col.bytes = n as usize,
            DataType::Decimal => col.scale = n as u8,
            _ => {
                return Err(Error::Unsupported(format!(
                    "type {} takes no arguments",
                    tname
                )))
            }
        }
        p.expect(b')')?;
    }
    loop {
        if p.test_id("NOT") {
            p.expect_id("NULL")?;
            col.nullable = false;
        } else if p.test_id("NULL") {
            col.nullable = true;
        } else if p.test_id("DEFAULT") {
            let v = if let Some(s) = p.maybe_string()? {
                Variant::parse_typed(&s, col.typ, col.scale)?
            } else {
                let n = p.signed_number_str()?;
                Variant::parse_typed(&n, col.typ, col.scale)?
            };
            col.default = Some(v);
        } else if p.test_id("COMMENT") {
            col.comment = p.maybe_string()?;
        } else {
            break;
        }
    }
    Ok(col)
}

fn type_from_name(name: &str) -> Result<DataType> {
    Ok(match name.to_lowercase().as_str() {
        "int8" | "tinyint" => DataType::Int8,
        "int16" | "smallint" => DataType::Int16,
        "int32" => DataType::Int32,
        "int" | "int64" | "bigint" => DataType::Int64,
        "uint8" => DataType::UInt8,
        "uint16" => DataType::UInt16,
        "uint32" => DataType::UInt32,
        "uint" | "uint64" => DataType::UInt64,
        "float" => DataType::Float,
        "double" => DataType::Double,
        "string" => DataType::Str,
        "bytes" | "binary" => DataType::Bytes,
        "decimal" => DataType::Decimal,
        "date" => DataType::Date,
        "time" => DataType::Time,
        "uuid" => DataType::Uuid,
        "ipv6" => DataType::Ipv6,
        _ => return Err(Error::Unsupported(format!("unknown type '{}'", name))),
    })
}

/// Minimal tokenizer for schema definitions.
struct Lex<'a> {
    src: &'a [u8],
    ix: usize,
}

impl<'a> Lex<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            ix: 0,
        }
    }

    fn skip_space(&mut self) {
        while self.ix < self.src.len() && self.src[self.ix].is_ascii_whitespace() {
            self.ix += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_space();
        self.src.get(self.ix).copied()
    }

    fn test(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.ix += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        if self.test(c) {
            Ok(())
        } else {
            Err(Error::Unsupported(format!(
                "expected '{}' in table definition",
                c as char
            )))
        }
    }

    fn maybe_ident(&mut self) -> Option<String> {
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => {
                let start = self.ix;
                while self.ix < self.src.len()
                    && (self.src[self.ix].is_ascii_alphanumeric() || self.src[self.ix] == b'_')
                {
                    self.ix += 1;
                }
                Some(String::from_utf8_lossy(&self.src[start..self.ix]).to_string())
            }
            _ => None,
        }
    }

    fn ident(&mut self) -> Result<String> {
        self.maybe_ident()
            .ok_or_else(|| Error::Unsupported("expected identifier".to_string()))
    }

    fn expect_id(&mut self, id: &str) -> Result<()> {
        let got = self.ident()?;
        if got.eq_ignore_ascii_case(id) {
            Ok(())
        } else {
            Err(Error::Unsupported(format!("expected {} got {}", id, got)))
        }
    }

    /// Consume the identifier if it matches ( case-insensitive ).
    fn test_id(&mut self, id: &str) -> bool {
        let save = self.ix;
        if let Some(got) = self.maybe_ident() {
            if got.eq_ignore_ascii_case(id) {
                return true;
            }
        }
        self.ix = save;
        false
    }

    fn number(&mut self) -> Result<i64> {
        self.skip_space();
        let start = self.ix;
        while self.ix < self.src.len() && self.src[self.ix].is_ascii_digit() {
            self.ix += 1;
        }
        if start == self.ix {
            return Err(Error::Unsupported("expected number".to_string()));
        }
        std::str::from_utf8(&self.src[start..self.ix])
            .unwrap()
            .parse()
            .map_err(|_| Error::Unsupported("number out of range".to_string()))
    }

    /// Number with optional sign and fraction, returned as text.
    fn signed_number_str(&mut self) -> Result<String> {
        self.skip_space();
        let start = self.ix;
        if self.src.get(self.ix) == Some(&b'-') {
            self.ix += 1;
        }
        while self.ix < self.src.len()
            && (self.src[self.ix].is_ascii_digit() || self.src[self.ix] == b'.')
        {
            self.ix += 1;
        }
        if start == self.ix {
            return Err(Error::Unsupported("expected literal".to_string()));
        }
        Ok(String::from_utf8_lossy(&self.src[start..self.ix]).to_string())
    }

    /// Quoted string literal, with '' escaping.
    fn maybe_string(&mut self) -> Result<Option<String>> {
        if !self.test(b'\'') {
            return Ok(None);
        }
        let mut s = String::new();
        loop {
            match self.src.get(self.ix) {
                Some(b'\'') => {
                    self.ix += 1;
                    if self.src.get(self.ix) == Some(&b'\'') {
                        s.push('\'');
                        self.ix += 1;
                    } else {
                        return Ok(Some(s));
                    }
                }
                Some(c) => {
                    s.push(*c as char);
                    self.ix += 1;
                }
                None => return Err(Error::Unsupported("unterminated string".to_string())),
            }
        }
    }

    fn end(&mut self) -> Result<()> {
        if self.peek().is_none() {
            Ok(())
        } else {
            Err(Error::Unsupported("trailing input in table definition".to_string()))
        }
    }
}

#[test]
fn parse_round_trip() {
    let src = "CREATE TABLE orders (
        id uint NOT NULL,
        name string(10) DEFAULT 'none' COMMENT 'display name',
        price decimal(2),
        qty int32,
        INDEX primary (id),
        INDEX by_name (name,qty)
    ) CACHE=524288 WAL=log";
    let m = Meta::parse(src).unwrap();
    assert_eq!(m.name, "orders");
    assert_eq!(m.columns.len(), 4);
    assert_eq!(m.columns[1].bytes, 10);
    assert_eq!(m.columns[2].scale, 2);
    assert!(!m.columns[0].nullable);
    assert_eq!(m.indexes[1].cols, vec![1, 3]);
    assert_eq!(m.column_at("qty"), Some(3));
    assert_eq!(m.index_at("by_name"), Some(1));
    // id 2+8, name 2+2+10, price 2+2+18, qty 2+4, count 2.
    assert_eq!(m.row_bytes, 2 + 10 + 14 + 22 + 6);

    let sql = m.to_sql();
    let m2 = Meta::parse(&sql).unwrap();
    assert_eq!(m2.to_sql(), sql);
    assert_eq!(m2.row_bytes, m.row_bytes);
    assert_eq!(m2.columns, m.columns);
    assert_eq!(m2.indexes, m.indexes);
}

#[test]
fn validation() {
    // First index must be primary.
    assert!(Meta::parse("CREATE TABLE t (a int, INDEX other (a))").is_err());
    // Duplicate column.
    assert!(Meta::parse("CREATE TABLE t (a int, a int, INDEX primary (a))").is_err());
    // Unknown index column.
    assert!(Meta::parse("CREATE TABLE t (a int, INDEX primary (b))").is_err());
    // Name too long.
    let long = "x".repeat(41);
    assert!(Meta::parse(&format!("CREATE TABLE {} (a int, INDEX primary (a))", long)).is_err());
    // Too many keys.
    assert!(
        Meta::parse("CREATE TABLE t (a int,b int,c int,d int,e int,f int, INDEX primary (a,b,c,d,e,f))")
            .is_err()
    );
}
