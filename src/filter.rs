use crate::{
    meta::MAX_KEYS, row::Row, util::SmallSet, DataType, Error, Meta, Ordering, Result, Variant,
};

/// Comparison operators of the filter grammar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

impl CmpOp {
    /// Mirror the operator for `literal op column` comparisons.
    fn flip(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            op => op,
        }
    }
}

/// A single condition: column op literal.
#[derive(Clone, Debug)]
pub struct Cond {
    pub op: CmpOp,
    pub col: usize,
    pub val: Variant,
}

/// Compiled WHERE expression.
#[derive(Clone, Debug)]
pub enum Filter {
    Cond(Cond),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    /// Compile a WHERE expression against a schema.
    ///
    /// Identifiers resolve to column ordinals; literals are coerced to
    /// the column type. `BETWEEN`, `IN`, `NOT` and `IS` are outside the
    /// grammar and report [`Error::Unsupported`].
    pub fn compile(src: &str, meta: &Meta) -> Result<Filter> {
        let mut lex = Lex::new(src);
        lex.advance()?;
        let f = parse_or(&mut lex, meta)?;
        if !matches!(lex.tok, Tok::End) {
            return Err(Error::Unsupported(format!(
                "unexpected input after WHERE expression: {:?}",
                lex.tok
            )));
        }
        Ok(f)
    }

    /// Evaluate the filter against a row.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::Cond(c) => c.matches(row),
            Filter::And(list) => list.iter().all(|f| f.matches(row)),
            Filter::Or(list) => list.iter().any(|f| f.matches(row)),
        }
    }

    /// Scan filter for an index range scan: 0 keeps the row, the skip
    /// sign passes over it, the opposite sign ends the scan ( ascending
    /// scans skip on negative and stop on positive, descending scans
    /// mirror that ).
    pub fn tri(&self, row: &Row, desc: bool) -> i32 {
        let skip = if desc { 1 } else { -1 };
        match self {
            Filter::Cond(c) => c.tri(row, skip),
            Filter::And(list) => {
                for f in list {
                    let t = f.tri(row, desc);
                    if t != 0 {
                        return t;
                    }
                }
                0
            }
            Filter::Or(_) => {
                if self.matches(row) {
                    0
                } else {
                    skip
                }
            }
        }
    }

    /// Descent pruning hint: the sign of the probe range against the
    /// row, 0 where the condition gives no usable bound. Unlike `tri`
    /// this never treats a key as skippable, so it is safe to steer the
    /// B+Tree descent with it.
    pub fn seek(&self, row: &Row) -> i32 {
        match self {
            Filter::Cond(c) => c.seek(row),
            Filter::And(list) => {
                for f in list {
                    let s = f.seek(row);
                    if s != 0 {
                        return s;
                    }
                }
                0
            }
            Filter::Or(_) => 0,
        }
    }

    /// Flatten nested AND nodes into conds and opaque residual filters.
    fn flatten(self, conds: &mut Vec<Cond>, residual: &mut Vec<Filter>) {
        match self {
            Filter::Cond(c) => conds.push(c),
            Filter::And(list) => {
                for f in list {
                    f.flatten(conds, residual);
                }
            }
            or => residual.push(or),
        }
    }

    /// Split into ( index push-down, post-filter ) for an index with the
    /// given key columns. Conditions on columns of the covered key
    /// prefix go into the push-down part, everything else ( including
    /// any OR subtree ) becomes the post-filter.
    pub fn split(self, index_cols: &[usize]) -> (Option<Filter>, Option<Filter>) {
        let mut conds = Vec::new();
        let mut residual = Vec::new();
        self.flatten(&mut conds, &mut residual);

        let mut kc = SmallSet::default();
        for c in &conds {
            kc.insert(c.col);
        }
        let n = covered(index_cols, &kc);
        let mut first: Vec<Filter> = Vec::new();
        let mut second: Vec<Filter> = residual;
        // Push-down conditions ordered by index key position, so a
        // multi-column seek compares the major key first.
        for key in &index_cols[0..n] {
            let mut i = 0;
            while i < conds.len() {
                if conds[i].col == *key {
                    first.push(Filter::Cond(conds.remove(i)));
                } else {
                    i += 1;
                }
            }
        }
        for c in conds {
            second.push(Filter::Cond(c));
        }
        (combine(first), combine(second))
    }

    /// Collect the columns known from plain conditions ( index scoring ).
    fn known_cols(&self, kc: &mut SmallSet) {
        match self {
            Filter::Cond(c) => kc.insert(c.col),
            Filter::And(list) => {
                for f in list {
                    f.known_cols(kc);
                }
            }
            Filter::Or(_) => {}
        }
    }
}

fn combine(mut list: Vec<Filter>) -> Option<Filter> {
    match list.len() {
        0 => None,
        1 => Some(list.remove(0)),
        _ => Some(Filter::And(list)),
    }
}

/// Longest prefix of the index keys where every key column is known.
fn covered(index_cols: &[usize], kc: &SmallSet) -> usize {
    let mut n = 0;
    for c in index_cols {
        if kc.contains(*c) {
            n += 1;
        } else {
            break;
        }
    }
    n
}

/// Choose the best index for a query, or None for a full scan.
///
/// Scoring: every covered WHERE prefix column is worth 100, an ORDER BY
/// that is a prefix of the index keys adds 50 plus the matched column
/// count, and narrower indexes get a small bonus as a tie-break.
pub fn best_index(
    wher: Option<&Filter>,
    orderby: &[(usize, bool)],
    meta: &Meta,
) -> Option<usize> {
    let mut kc = SmallSet::default();
    if let Some(f) = wher {
        f.known_cols(&mut kc);
    }
    let mut best: Option<(usize, i64)> = None;
    for (ix, index) in meta.indexes.iter().enumerate() {
        let mut score = 0_i64;
        score += 100 * covered(&index.cols, &kc) as i64;
        if !orderby.is_empty() {
            let n = orderby
                .iter()
                .zip(index.cols.iter())
                .take_while(|((oc, _), kc)| oc == *kc)
                .count();
            if n == orderby.len() {
                score += 50 + n as i64;
            }
        }
        if score > 0 {
            score += (MAX_KEYS - index.cols.len()) as i64;
            match best {
                Some((_, s)) if s >= score => {}
                _ => best = Some((ix, score)),
            }
        }
    }
    best.map(|(ix, _)| ix)
}

impl Cond {
    fn matches(&self, row: &Row) -> bool {
        let lv = &row.values[self.col];
        match self.op {
            CmpOp::Eq => lv.cmp(&self.val) == Ordering::Equal,
            CmpOp::Ne => lv.cmp(&self.val) != Ordering::Equal,
            CmpOp::Like => like_value(lv, &self.val),
            _ => {
                if lv.is_null() || self.val.is_null() {
                    return false;
                }
                match (self.op, lv.cmp(&self.val)) {
                    (CmpOp::Lt, Ordering::Less) => true,
                    (CmpOp::Le, Ordering::Less | Ordering::Equal) => true,
                    (CmpOp::Gt, Ordering::Greater) => true,
                    (CmpOp::Ge, Ordering::Greater | Ordering::Equal) => true,
                    _ => false,
                }
            }
        }
    }

    fn tri(&self, row: &Row, skip: i32) -> i32 {
        let lv = &row.values[self.col];
        match self.op {
            CmpOp::Eq => sign(lv.cmp(&self.val)),
            CmpOp::Ne => {
                if lv.cmp(&self.val) != Ordering::Equal {
                    0
                } else {
                    skip
                }
            }
            CmpOp::Like => {
                if like_value(lv, &self.val) {
                    0
                } else {
                    skip
                }
            }
            _ => {
                if lv.is_null() {
                    return skip;
                }
                let c = sign(lv.cmp(&self.val));
                match self.op {
                    CmpOp::Lt => {
                        if c < 0 {
                            0
                        } else {
                            1
                        }
                    }
                    CmpOp::Le => {
                        if c <= 0 {
                            0
                        } else {
                            1
                        }
                    }
                    CmpOp::Gt => {
                        if c > 0 {
                            0
                        } else {
                            -1
                        }
                    }
                    CmpOp::Ge => {
                        if c >= 0 {
                            0
                        } else {
                            -1
                        }
                    }
                    _ => unreachable!(),
                }
            }
        }
    }

    fn seek(&self, row: &Row) -> i32 {
        let lv = &row.values[self.col];
        match self.op {
            CmpOp::Eq => sign(lv.cmp(&self.val)),
            CmpOp::Ne | CmpOp::Like => 0,
            CmpOp::Lt | CmpOp::Le => {
                if lv.is_null() {
                    return 0;
                }
                let c = sign(lv.cmp(&self.val));
                let hi = if self.op == CmpOp::Lt { c >= 0 } else { c > 0 };
                if hi {
                    1
                } else {
                    0
                }
            }
            CmpOp::Gt | CmpOp::Ge => {
                if lv.is_null() {
                    return -1;
                }
                let c = sign(lv.cmp(&self.val));
                let lo = if self.op == CmpOp::Gt { c <= 0 } else { c < 0 };
                if lo {
                    -1
                } else {
                    0
                }
            }
        }
    }
}

fn sign(o: Ordering) -> i32 {
    match o {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

fn like_value(lv: &Variant, pat: &Variant) -> bool {
    match (lv, pat) {
        (Variant::Str(s), Variant::Str(p)) => like_match(s.as_bytes(), p.as_bytes()),
        _ => false,
    }
}

/// Wildcard match: `%` and `*` match any run of characters.
pub fn like_match(text: &[u8], pat: &[u8]) -> bool {
    match pat.first() {
        None => text.is_empty(),
        Some(b'%') | Some(b'*') => {
            like_match(text, &pat[1..]) || (!text.is_empty() && like_match(&text[1..], pat))
        }
        Some(c) => match text.first() {
            Some(t) if t == c => like_match(&text[1..], &pat[1..]),
            _ => false,
        },
    }
}

/// Tokens of the WHERE grammar.
#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Id(String),
    Num(String),
    Str(String),
    Op(CmpOp),
    LBra,
    RBra,
    End,
}

struct Lex<'a> {
    src: &'a [u8],
    ix: usize,
    tok: Tok,
}

impl<'a> Lex<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            ix: 0,
            tok: Tok::End,
        }
    }

    fn advance(&mut self) -> Result<()> {
        while self.ix < self.src.len() && self.src[self.ix].is_ascii_whitespace() {
            self.ix += 1;
        }
        let c = match self.src.get(self.ix) {
            None => {
                self.tok = Tok::End;
                return Ok(());
            }
            Some(c) => *c,
        };
        self.tok = match c {
            b'(' => {
                self.ix += 1;
                Tok::LBra
            }
            b')' => {
                self.ix += 1;
                Tok::RBra
            }
            b'=' => {
                self.ix += 1;
                Tok::Op(CmpOp::Eq)
            }
            b'<' => {
                self.ix += 1;
                match self.src.get(self.ix) {
                    Some(b'=') => {
                        self.ix += 1;
                        Tok::Op(CmpOp::Le)
                    }
                    Some(b'>') => {
                        self.ix += 1;
                        Tok::Op(CmpOp::Ne)
                    }
                    _ => Tok::Op(CmpOp::Lt),
                }
            }
            b'>' => {
                self.ix += 1;
                if self.src.get(self.ix) == Some(&b'=') {
                    self.ix += 1;
                    Tok::Op(CmpOp::Ge)
                } else {
                    Tok::Op(CmpOp::Gt)
                }
            }
            b'!' => {
                self.ix += 1;
                if self.src.get(self.ix) == Some(&b'=') {
                    self.ix += 1;
                    Tok::Op(CmpOp::Ne)
                } else {
                    return Err(Error::Unsupported("'!'".to_string()));
                }
            }
            b'\'' => {
                self.ix += 1;
                let mut s = String::new();
                loop {
                    match self.src.get(self.ix) {
                        Some(b'\'') => {
                            self.ix += 1;
                            if self.src.get(self.ix) == Some(&b'\'') {
                                s.push('\'');
                                self.ix += 1;
                            } else {
                                break;
                            }
                        }
                        Some(c) => {
                            s.push(*c as char);
                            self.ix += 1;
                        }
                        None => {
                            return Err(Error::Unsupported("unterminated string".to_string()))
                        }
                    }
                }
                Tok::Str(s)
            }
            b'0'..=b'9' | b'-' | b'.' => {
                let start = self.ix;
                self.ix += 1;
                while self
                    .src
                    .get(self.ix)
                    .map_or(false, |c| c.is_ascii_digit() || *c == b'.')
                {
                    self.ix += 1;
                }
                Tok::Num(String::from_utf8_lossy(&self.src[start..self.ix]).to_string())
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let start = self.ix;
                while self
                    .src
                    .get(self.ix)
                    .map_or(false, |c| c.is_ascii_alphanumeric() || *c == b'_')
                {
                    self.ix += 1;
                }
                Tok::Id(String::from_utf8_lossy(&self.src[start..self.ix]).to_string())
            }
            c => return Err(Error::Unsupported(format!("'{}'", c as char))),
        };
        Ok(())
    }

    /// Current identifier matches the keyword ( case-insensitive ).
    fn is_kw(&self, kw: &str) -> bool {
        matches!(&self.tok, Tok::Id(s) if s.eq_ignore_ascii_case(kw))
    }
}

fn parse_or(lex: &mut Lex, meta: &Meta) -> Result<Filter> {
    let mut list = vec![parse_and(lex, meta)?];
    while lex.is_kw("OR") {
        lex.advance()?;
        list.push(parse_and(lex, meta)?);
    }
    Ok(if list.len() == 1 {
        list.remove(0)
    } else {
        Filter::Or(list)
    })
}

fn parse_and(lex: &mut Lex, meta: &Meta) -> Result<Filter> {
    let mut list = vec![parse_factor(lex, meta)?];
    while lex.is_kw("AND") {
        lex.advance()?;
        list.push(parse_factor(lex, meta)?);
    }
    Ok(if list.len() == 1 {
        list.remove(0)
    } else {
        Filter::And(list)
    })
}

fn parse_factor(lex: &mut Lex, meta: &Meta) -> Result<Filter> {
    if matches!(lex.tok, Tok::LBra) {
        lex.advance()?;
        let f = parse_or(lex, meta)?;
        if !matches!(lex.tok, Tok::RBra) {
            return Err(Error::Unsupported("expected ')'".to_string()));
        }
        lex.advance()?;
        return Ok(f);
    }
    for kw in ["NOT", "BETWEEN", "IN", "IS"] {
        if lex.is_kw(kw) {
            return Err(Error::Unsupported(kw.to_string()));
        }
    }
    // column op literal, or literal op column.
    match lex.tok.clone() {
        Tok::Id(name) => {
            lex.advance()?;
            let col = resolve(meta, &name)?;
            let op = parse_op(lex)?;
            let lit = parse_literal(lex)?;
            make_cond(meta, col, op, lit)
        }
        Tok::Num(_) | Tok::Str(_) => {
            let lit = parse_literal(lex)?;
            let op = parse_op(lex)?;
            let name = match lex.tok.clone() {
                Tok::Id(n) => n,
                t => {
                    return Err(Error::Unsupported(format!(
                        "expected column name, got {:?}",
                        t
                    )))
                }
            };
            lex.advance()?;
            let col = resolve(meta, &name)?;
            make_cond(meta, col, op.flip(), lit)
        }
        t => Err(Error::Unsupported(format!("unexpected token {:?}", t))),
    }
}

fn resolve(meta: &Meta, name: &str) -> Result<usize> {
    meta.column_at(name)
        .ok_or_else(|| Error::Unsupported(format!("unknown column '{}'", name)))
}

fn parse_op(lex: &mut Lex) -> Result<CmpOp> {
    for kw in ["BETWEEN", "IN", "IS", "NOT"] {
        if lex.is_kw(kw) {
            return Err(Error::Unsupported(kw.to_string()));
        }
    }
    if lex.is_kw("LIKE") {
        lex.advance()?;
        return Ok(CmpOp::Like);
    }
    match lex.tok {
        Tok::Op(op) => {
            lex.advance()?;
            Ok(op)
        }
        ref t => Err(Error::Unsupported(format!("expected operator, got {:?}", t))),
    }
}

/// Raw literal: text plus whether it was quoted.
struct Lit {
    text: String,
    quoted: bool,
}

fn parse_literal(lex: &mut Lex) -> Result<Lit> {
    let lit = match lex.tok.clone() {
        Tok::Num(s) => Lit {
            text: s,
            quoted: false,
        },
        Tok::Str(s) => Lit {
            text: s,
            quoted: true,
        },
        t => return Err(Error::Unsupported(format!("expected literal, got {:?}", t))),
    };
    lex.advance()?;
    Ok(lit)
}

fn make_cond(meta: &Meta, col: usize, op: CmpOp, lit: Lit) -> Result<Filter> {
    let c = &meta.columns[col];
    let val = if op == CmpOp::Like {
        if c.typ != DataType::Str {
            return Err(Error::TypeMismatch(format!(
                "LIKE on non-string column '{}'",
                c.name
            )));
        }
        Variant::parse_typed(&lit.text, DataType::Str, 0)?
    } else if lit.quoted && c.typ != DataType::Str && c.typ != DataType::Bytes {
        return Err(Error::TypeMismatch(format!(
            "quoted literal for {} column '{}'",
            c.typ.name(),
            c.name
        )));
    } else {
        Variant::parse_typed(&lit.text, c.typ, c.scale)?
    };
    Ok(Filter::Cond(Cond { op, col, val }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::Meta;
    use crate::Rc;

    fn schema() -> Rc<Meta> {
        Rc::new(
            Meta::parse(
                "CREATE TABLE t (
                    a uint, b string(10), c int, d decimal(2),
                    INDEX primary (a),
                    INDEX by_ab (a,c)
                )",
            )
            .unwrap(),
        )
    }

    fn row_of(m: &Rc<Meta>, a: u64, b: &str, c: i64) -> Row {
        let mut r = Row::new(m.clone());
        r.values[0] = Variant::UInt64(a);
        r.values[1] = Variant::Str(Rc::new(b.to_string()));
        r.values[2] = Variant::Int64(c);
        r
    }

    #[test]
    fn compile_and_eval() {
        let m = schema();
        let f = Filter::compile("a = 5 AND b = 'x'", &m).unwrap();
        assert!(f.matches(&row_of(&m, 5, "x", 0)));
        assert!(!f.matches(&row_of(&m, 5, "y", 0)));
        assert!(!f.matches(&row_of(&m, 6, "x", 0)));

        let f = Filter::compile("a >= 2 OR c < 0", &m).unwrap();
        assert!(f.matches(&row_of(&m, 3, "", 1)));
        assert!(f.matches(&row_of(&m, 0, "", -1)));
        assert!(!f.matches(&row_of(&m, 1, "", 1)));

        // Flipped comparison.
        let f = Filter::compile("10 < a", &m).unwrap();
        assert!(f.matches(&row_of(&m, 11, "", 0)));
        assert!(!f.matches(&row_of(&m, 10, "", 0)));
    }

    #[test]
    fn unsupported_constructs() {
        let m = schema();
        for src in [
            "a BETWEEN 1 AND 5",
            "a IN (1,2)",
            "NOT a = 1",
            "b IS NULL",
            "e = 1",
        ] {
            assert!(
                matches!(Filter::compile(src, &m), Err(Error::Unsupported(_))),
                "{} should be unsupported",
                src
            );
        }
        // Incompatible literal.
        assert!(matches!(
            Filter::compile("a = 'text'", &m),
            Err(Error::TypeMismatch(_))
        ));
        assert!(matches!(
            Filter::compile("a = x9", &m),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn like_patterns() {
        assert!(like_match(b"hello world", b"%world"));
        assert!(like_match(b"hello world", b"hello%"));
        assert!(like_match(b"hello world", b"%lo wo%"));
        assert!(like_match(b"hello", b"hello"));
        assert!(!like_match(b"hello", b"help%"));
        assert!(!like_match(b"hello", b"%world%"));
        assert!(like_match(b"", b"%"));
        assert!(like_match(b"abc", b"*b*"));
    }

    #[test]
    fn split_pushdown() {
        let m = schema();
        // Index on (a): a = 5 is pushed down, b = 'x' is residual.
        let f = Filter::compile("a = 5 AND b = 'x'", &m).unwrap();
        let (first, second) = f.split(&m.indexes[0].cols);
        let first = first.unwrap();
        let second = second.unwrap();
        assert!(matches!(
            &first,
            Filter::Cond(Cond { col: 0, op: CmpOp::Eq, .. })
        ));
        assert!(matches!(&second, Filter::Cond(Cond { col: 1, .. })));

        // OR never splits.
        let f = Filter::compile("a = 5 OR b = 'x'", &m).unwrap();
        let (first, second) = f.split(&m.indexes[0].cols);
        assert!(first.is_none());
        assert!(second.is_some());

        // Multi-column prefix: both conditions push down, major key first.
        let f = Filter::compile("c = 2 AND a = 1", &m).unwrap();
        let (first, second) = f.split(&m.indexes[1].cols);
        assert!(second.is_none());
        match first.unwrap() {
            Filter::And(list) => {
                assert!(matches!(&list[0], Filter::Cond(Cond { col: 0, .. })));
                assert!(matches!(&list[1], Filter::Cond(Cond { col: 2, .. })));
            }
            f => panic!("expected And, got {:?}", f),
        }

        // Condition on a non-prefix key column stays residual.
        let f = Filter::compile("c = 2", &m).unwrap();
        let (first, second) = f.split(&m.indexes[1].cols);
        assert!(first.is_none());
        assert!(second.is_some());
    }

    #[test]
    fn tri_state_mapping() {
        let m = schema();
        let f = Filter::compile("a = 5", &m).unwrap();
        // Ascending: below range advances, match yields, above range stops.
        assert_eq!(f.tri(&row_of(&m, 3, "", 0), false), -1);
        assert_eq!(f.tri(&row_of(&m, 5, "", 0), false), 0);
        assert_eq!(f.tri(&row_of(&m, 7, "", 0), false), 1);

        let f = Filter::compile("a <= 5", &m).unwrap();
        assert_eq!(f.tri(&row_of(&m, 5, "", 0), false), 0);
        assert_eq!(f.tri(&row_of(&m, 6, "", 0), false), 1);

        let f = Filter::compile("a > 5", &m).unwrap();
        assert_eq!(f.tri(&row_of(&m, 5, "", 0), false), -1);
        assert_eq!(f.tri(&row_of(&m, 6, "", 0), false), 0);

        // != skips the equal key and keeps scanning.
        let f = Filter::compile("a != 5", &m).unwrap();
        assert_eq!(f.tri(&row_of(&m, 5, "", 0), false), -1);
        assert_eq!(f.tri(&row_of(&m, 5, "", 0), true), 1);
        assert_eq!(f.tri(&row_of(&m, 4, "", 0), false), 0);
    }

    #[test]
    fn index_scoring() {
        let m = schema();
        let f = Filter::compile("a = 1 AND c = 2", &m).unwrap();
        // Both indexes match on a; (a,c) covers two columns and wins.
        assert_eq!(best_index(Some(&f), &[], &m), Some(1));

        let f = Filter::compile("a = 1", &m).unwrap();
        // Single condition: the narrower primary wins the tie.
        assert_eq!(best_index(Some(&f), &[], &m), Some(0));

        // ORDER BY a,c prefers the composite index.
        assert_eq!(best_index(None, &[(0, false), (2, false)], &m), Some(1));

        // No usable index.
        let f = Filter::compile("b = 'x'", &m).unwrap();
        assert_eq!(best_index(Some(&f), &[], &m), None);
    }
}
