use crate::{dec::Decimal, Error, Ordering, Rc, Result};

/// Column data type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    Str,
    Bytes,
    Decimal,
    Date,
    Time,
    Uuid,
    Ipv6,
}

/// Field tag: the column is null.
pub const TAG_NULL: u16 = 0;
/// Field tag: the column holds its zero value ( no payload ).
pub const TAG_ZERO: u16 = 1;

impl DataType {
    /// Wire tag for a non-null value of this type.
    pub fn tag(self) -> u16 {
        match self {
            DataType::Int8 => 2,
            DataType::UInt8 => 3,
            DataType::Int16 => 4,
            DataType::UInt16 => 5,
            DataType::Int32 => 6,
            DataType::UInt32 => 7,
            DataType::Int64 => 8,
            DataType::UInt64 => 9,
            DataType::Float => 10,
            DataType::Double => 11,
            DataType::Str => 12,
            DataType::Bytes => 13,
            DataType::Decimal => 14,
            DataType::Date => 15,
            DataType::Time => 16,
            DataType::Uuid => 17,
            DataType::Ipv6 => 18,
        }
    }

    /// Inverse of tag().
    pub fn from_tag(tag: u16) -> Result<DataType> {
        Ok(match tag {
            2 => DataType::Int8,
            3 => DataType::UInt8,
            4 => DataType::Int16,
            5 => DataType::UInt16,
            6 => DataType::Int32,
            7 => DataType::UInt32,
            8 => DataType::Int64,
            9 => DataType::UInt64,
            10 => DataType::Float,
            11 => DataType::Double,
            12 => DataType::Str,
            13 => DataType::Bytes,
            14 => DataType::Decimal,
            15 => DataType::Date,
            16 => DataType::Time,
            17 => DataType::Uuid,
            18 => DataType::Ipv6,
            _ => return Err(Error::TypeMismatch(format!("unknown type tag {}", tag))),
        })
    }

    /// Payload width in bytes for fixed-width types, None for variable types.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            DataType::Int8 | DataType::UInt8 => Some(1),
            DataType::Int16 | DataType::UInt16 => Some(2),
            DataType::Date => Some(3),
            DataType::Int32 | DataType::UInt32 | DataType::Float => Some(4),
            DataType::Int64 | DataType::UInt64 | DataType::Double | DataType::Time => Some(8),
            DataType::Uuid | DataType::Ipv6 => Some(16),
            DataType::Str | DataType::Bytes | DataType::Decimal => None,
        }
    }

    /// The name used in a CREATE TABLE definition.
    pub fn name(self) -> &'static str {
        match self {
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int",
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::Str => "string",
            DataType::Bytes => "bytes",
            DataType::Decimal => "decimal",
            DataType::Date => "date",
            DataType::Time => "time",
            DataType::Uuid => "uuid",
            DataType::Ipv6 => "ipv6",
        }
    }
}

/// Tagged runtime value.
///
/// String and byte payloads are shared with Rc: a decoded variant and
/// the rows/caches holding it reference one allocation, released when
/// the last holder drops.
#[derive(Clone, Debug)]
pub enum Variant {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Str(Rc<String>),
    Bytes(Rc<Vec<u8>>),
    Dec(Decimal),
    /// Days, stored in 24 bits.
    Date(u32),
    /// Microseconds since midnight ( or an epoch, the engine does not care ).
    Time(i64),
    Uuid([u8; 16]),
    Ipv6([u8; 16]),
}

impl Variant {
    /// The zero value for a data type.
    pub fn zero(typ: DataType) -> Variant {
        match typ {
            DataType::Int8 => Variant::Int8(0),
            DataType::Int16 => Variant::Int16(0),
            DataType::Int32 => Variant::Int32(0),
            DataType::Int64 => Variant::Int64(0),
            DataType::UInt8 => Variant::UInt8(0),
            DataType::UInt16 => Variant::UInt16(0),
            DataType::UInt32 => Variant::UInt32(0),
            DataType::UInt64 => Variant::UInt64(0),
            DataType::Float => Variant::Float(0.0),
            DataType::Double => Variant::Double(0.0),
            DataType::Str => Variant::Str(Rc::new(String::new())),
            DataType::Bytes => Variant::Bytes(Rc::new(Vec::new())),
            DataType::Decimal => Variant::Dec(Decimal::zero(0)),
            DataType::Date => Variant::Date(0),
            DataType::Time => Variant::Time(0),
            DataType::Uuid => Variant::Uuid([0; 16]),
            DataType::Ipv6 => Variant::Ipv6([0; 16]),
        }
    }

    /// Wire tag of this value.
    pub fn tag(&self) -> u16 {
        match self {
            Variant::Null => TAG_NULL,
            Variant::Int8(_) => DataType::Int8.tag(),
            Variant::Int16(_) => DataType::Int16.tag(),
            Variant::Int32(_) => DataType::Int32.tag(),
            Variant::Int64(_) => DataType::Int64.tag(),
            Variant::UInt8(_) => DataType::UInt8.tag(),
            Variant::UInt16(_) => DataType::UInt16.tag(),
            Variant::UInt32(_) => DataType::UInt32.tag(),
            Variant::UInt64(_) => DataType::UInt64.tag(),
            Variant::Float(_) => DataType::Float.tag(),
            Variant::Double(_) => DataType::Double.tag(),
            Variant::Str(_) => DataType::Str.tag(),
            Variant::Bytes(_) => DataType::Bytes.tag(),
            Variant::Dec(_) => DataType::Decimal.tag(),
            Variant::Date(_) => DataType::Date.tag(),
            Variant::Time(_) => DataType::Time.tag(),
            Variant::Uuid(_) => DataType::Uuid.tag(),
            Variant::Ipv6(_) => DataType::Ipv6.tag(),
        }
    }

    /// Value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }

    /// Get a signed integer ( any signed width ).
    pub fn int(&self) -> Result<i64> {
        match self {
            Variant::Int8(x) => Ok(*x as i64),
            Variant::Int16(x) => Ok(*x as i64),
            Variant::Int32(x) => Ok(*x as i64),
            Variant::Int64(x) => Ok(*x),
            _ => Err(self.mismatch("int")),
        }
    }

    /// Get an unsigned integer ( any unsigned width ).
    pub fn uint(&self) -> Result<u64> {
        match self {
            Variant::UInt8(x) => Ok(*x as u64),
            Variant::UInt16(x) => Ok(*x as u64),
            Variant::UInt32(x) => Ok(*x as u64),
            Variant::UInt64(x) => Ok(*x),
            _ => Err(self.mismatch("uint")),
        }
    }

    /// Get a float ( f32 or f64 ).
    pub fn float(&self) -> Result<f64> {
        match self {
            Variant::Float(x) => Ok(*x as f64),
            Variant::Double(x) => Ok(*x),
            _ => Err(self.mismatch("float")),
        }
    }

    /// Get a string.
    pub fn str(&self) -> Result<Rc<String>> {
        match self {
            Variant::Str(s) => Ok(s.clone()),
            _ => Err(self.mismatch("string")),
        }
    }

    /// Get a byte array.
    pub fn bytes(&self) -> Result<Rc<Vec<u8>>> {
        match self {
            Variant::Bytes(b) => Ok(b.clone()),
            _ => Err(self.mismatch("bytes")),
        }
    }

    /// Get a decimal.
    pub fn dec(&self) -> Result<Decimal> {
        match self {
            Variant::Dec(d) => Ok(*d),
            _ => Err(self.mismatch("decimal")),
        }
    }

    /// Get a date.
    pub fn date(&self) -> Result<u32> {
        match self {
            Variant::Date(d) => Ok(*d),
            _ => Err(self.mismatch("date")),
        }
    }

    /// Get a time.
    pub fn time(&self) -> Result<i64> {
        match self {
            Variant::Time(t) => Ok(*t),
            _ => Err(self.mismatch("time")),
        }
    }

    /// Get a uuid.
    pub fn uuid(&self) -> Result<[u8; 16]> {
        match self {
            Variant::Uuid(u) => Ok(*u),
            _ => Err(self.mismatch("uuid")),
        }
    }

    /// Get an ipv6 address.
    pub fn ipv6(&self) -> Result<[u8; 16]> {
        match self {
            Variant::Ipv6(u) => Ok(*u),
            _ => Err(self.mismatch("ipv6")),
        }
    }

    fn mismatch(&self, want: &str) -> Error {
        Error::TypeMismatch(format!("wanted {} got tag {}", want, self.tag()))
    }

    /// Coerce a literal string to a value of the given column type.
    /// Used by the filter compiler and probe-row construction.
    pub fn parse_typed(s: &str, typ: DataType, scale: u8) -> Result<Variant> {
        let bad = || Error::TypeMismatch(format!("'{}' is not a {}", s, typ.name()));
        Ok(match typ {
            DataType::Int8 => Variant::Int8(s.parse().map_err(|_| bad())?),
            DataType::Int16 => Variant::Int16(s.parse().map_err(|_| bad())?),
            DataType::Int32 => Variant::Int32(s.parse().map_err(|_| bad())?),
            DataType::Int64 => Variant::Int64(s.parse().map_err(|_| bad())?),
            DataType::UInt8 => Variant::UInt8(s.parse().map_err(|_| bad())?),
            DataType::UInt16 => Variant::UInt16(s.parse().map_err(|_| bad())?),
            DataType::UInt32 => Variant::UInt32(s.parse().map_err(|_| bad())?),
            DataType::UInt64 => Variant::UInt64(s.parse().map_err(|_| bad())?),
            DataType::Float => Variant::Float(s.parse().map_err(|_| bad())?),
            DataType::Double => Variant::Double(s.parse().map_err(|_| bad())?),
            DataType::Str => Variant::Str(Rc::new(s.to_string())),
            DataType::Bytes => Variant::Bytes(Rc::new(s.as_bytes().to_vec())),
            DataType::Decimal => Variant::Dec(Decimal::from_string(s, scale)?),
            DataType::Date => Variant::Date(s.parse().map_err(|_| bad())?),
            DataType::Time => Variant::Time(s.parse().map_err(|_| bad())?),
            DataType::Uuid | DataType::Ipv6 => return Err(bad()),
        })
    }

    /// Numeric class used for cross-type comparison.
    fn num_class(&self) -> u8 {
        match self {
            Variant::Int8(_) | Variant::Int16(_) | Variant::Int32(_) | Variant::Int64(_) => 1,
            Variant::UInt8(_) | Variant::UInt16(_) | Variant::UInt32(_) | Variant::UInt64(_) => 1,
            Variant::Float(_) | Variant::Double(_) => 2,
            Variant::Dec(_) => 3,
            _ => 0,
        }
    }

    fn as_i128(&self) -> i128 {
        match self {
            Variant::Int8(x) => *x as i128,
            Variant::Int16(x) => *x as i128,
            Variant::Int32(x) => *x as i128,
            Variant::Int64(x) => *x as i128,
            Variant::UInt8(x) => *x as i128,
            Variant::UInt16(x) => *x as i128,
            Variant::UInt32(x) => *x as i128,
            Variant::UInt64(x) => *x as i128,
            _ => 0,
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Variant::Float(x) => *x as f64,
            Variant::Double(x) => *x,
            Variant::Dec(d) => d.to_i128() as f64 / 10_f64.powi(d.scale() as i32),
            v => v.as_i128() as f64,
        }
    }

    /// Total ordering.
    ///
    /// Null sorts before everything. Numbers compare within the numeric
    /// family ( integers exactly, floats via f64 ). Strings and byte
    /// arrays compare lexicographically, shorter prefix first. Values of
    /// non-coercible types compare by tag.
    pub fn cmp(&self, other: &Variant) -> Ordering {
        use Variant::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Str(a), Str(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (Time(a), Time(b)) => a.cmp(b),
            (Uuid(a), Uuid(b)) => a.cmp(b),
            (Ipv6(a), Ipv6(b)) => a.cmp(b),
            (Dec(a), Dec(b)) => a.cmp(b),
            (a, b) => {
                let (ca, cb) = (a.num_class(), b.num_class());
                if ca == 0 || cb == 0 {
                    return a.tag().cmp(&b.tag());
                }
                if ca == 2 || cb == 2 {
                    a.as_f64().total_cmp(&b.as_f64())
                } else if ca == 3 || cb == 3 {
                    // Decimal against integer.
                    let da = match a {
                        Dec(d) => *d,
                        _ => Decimal::from_i128(a.as_i128(), 0),
                    };
                    let db = match b {
                        Dec(d) => *d,
                        _ => Decimal::from_i128(b.as_i128(), 0),
                    };
                    da.cmp(&db)
                } else {
                    a.as_i128().cmp(&b.as_i128())
                }
            }
        }
    }
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Variant {}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Variant::Null => write!(f, "NULL"),
            Variant::Int8(x) => write!(f, "{}", x),
            Variant::Int16(x) => write!(f, "{}", x),
            Variant::Int32(x) => write!(f, "{}", x),
            Variant::Int64(x) => write!(f, "{}", x),
            Variant::UInt8(x) => write!(f, "{}", x),
            Variant::UInt16(x) => write!(f, "{}", x),
            Variant::UInt32(x) => write!(f, "{}", x),
            Variant::UInt64(x) => write!(f, "{}", x),
            Variant::Float(x) => write!(f, "{}", x),
            Variant::Double(x) => write!(f, "{}", x),
            Variant::Str(s) => write!(f, "{}", s),
            Variant::Bytes(b) => {
                for x in b.iter() {
                    write!(f, "{:02x}", x)?;
                }
                Ok(())
            }
            Variant::Dec(d) => write!(f, "{}", d),
            Variant::Date(d) => write!(f, "{}", d),
            Variant::Time(t) => write!(f, "{}", t),
            Variant::Uuid(u) | Variant::Ipv6(u) => {
                for x in u.iter() {
                    write!(f, "{:02x}", x)?;
                }
                Ok(())
            }
        }
    }
}

#[test]
fn typed_get() {
    let v = Variant::Int32(-7);
    assert_eq!(v.int().unwrap(), -7);
    assert!(v.uint().is_err());
    assert!(v.str().is_err());

    let s = Variant::Str(Rc::new("abc".to_string()));
    assert_eq!(&*s.str().unwrap(), "abc");
    assert!(s.int().is_err());

    for x in [0_i64, 1, -1, i64::MIN, i64::MAX] {
        assert_eq!(Variant::Int64(x).int().unwrap(), x);
    }
    for x in [0_u64, 1, u64::MAX] {
        assert_eq!(Variant::UInt64(x).uint().unwrap(), x);
    }
}

#[test]
fn ordering_rules() {
    use Variant::*;
    // Null sorts first.
    assert_eq!(Null.cmp(&Int64(i64::MIN)), Ordering::Less);
    // Signed/unsigned compare exactly.
    assert_eq!(Int64(-1).cmp(&UInt64(u64::MAX)), Ordering::Less);
    assert_eq!(UInt8(5).cmp(&Int32(5)), Ordering::Equal);
    // Floats pull integers into f64.
    assert_eq!(Int64(2).cmp(&Double(1.5)), Ordering::Greater);
    // Strings: lexicographic, prefix sorts first.
    let s = |x: &str| Str(Rc::new(x.to_string()));
    assert_eq!(s("ab").cmp(&s("abc")), Ordering::Less);
    assert_eq!(s("b").cmp(&s("abc")), Ordering::Greater);
    // Distinct non-coercible types order by tag.
    assert_eq!(s("z").cmp(&Bytes(Rc::new(vec![0]))), Ordering::Less);
}

#[test]
fn literal_coercion() {
    let v = Variant::parse_typed("42", DataType::UInt32, 0).unwrap();
    assert_eq!(v.uint().unwrap(), 42);
    assert!(Variant::parse_typed("x", DataType::UInt32, 0).is_err());
    let d = Variant::parse_typed("1.25", DataType::Decimal, 2).unwrap();
    assert_eq!(d.dec().unwrap().to_string(), "1.25");
}
