use crate::{
    buf::ByteBuf,
    dec::Decimal,
    util,
    variant::{TAG_NULL, TAG_ZERO},
    DataType, Error, Meta, Rc, Result, Variant, NOT_FOUND,
};

/// Row of values with schema reference.
///
/// `id` is the heap slot the row lives in, [`NOT_FOUND`] until the row
/// is applied to a table. Shared ownership of decoded rows ( row cache,
/// cursors ) is expressed with `Rc<Row>`.
#[derive(Clone)]
pub struct Row {
    pub info: Rc<Meta>,
    pub values: Vec<Variant>,
    pub id: i64,
}

impl Row {
    /// Construct a row with default values ( column default, else null, else zero ).
    pub fn new(info: Rc<Meta>) -> Row {
        let mut values = Vec::with_capacity(info.columns.len());
        for c in &info.columns {
            values.push(match &c.default {
                Some(v) => v.clone(),
                None if c.nullable => Variant::Null,
                None => Variant::zero(c.typ),
            });
        }
        Row {
            info,
            values,
            id: NOT_FOUND,
        }
    }

    /// Encode the row into a slot-sized buffer.
    ///
    /// Layout: u16 column count, then per column a u16 tag and payload.
    /// Null and zero values carry no payload. Variable-width values are
    /// a u16 length plus the declared budget, zero padded.
    pub fn encode(&self, out: &mut ByteBuf) -> Result<()> {
        let cols = &self.info.columns;
        if self.values.len() != cols.len() {
            return Err(Error::ColumnMismatch {
                got: self.values.len(),
                want: cols.len(),
            });
        }
        out.clear();
        out.put_u16(cols.len() as u16)?;
        for (c, v) in cols.iter().zip(self.values.iter()) {
            if v.is_null() {
                if !c.nullable {
                    return Err(Error::TypeMismatch(format!(
                        "null value in non-null column '{}'",
                        c.name
                    )));
                }
                out.put_u16(TAG_NULL)?;
                continue;
            }
            if v.tag() != c.typ.tag() {
                return Err(Error::TypeMismatch(format!(
                    "column '{}' is {}, value has tag {}",
                    c.name,
                    c.typ.name(),
                    v.tag()
                )));
            }
            if *v == Variant::zero(c.typ) {
                out.put_u16(TAG_ZERO)?;
                continue;
            }
            out.put_u16(v.tag())?;
            match v {
                Variant::Int8(x) => out.put_i8(*x)?,
                Variant::Int16(x) => out.put_i16(*x)?,
                Variant::Int32(x) => out.put_i32(*x)?,
                Variant::Int64(x) => out.put_i64(*x)?,
                Variant::UInt8(x) => out.put_u8(*x)?,
                Variant::UInt16(x) => out.put_u16(*x)?,
                Variant::UInt32(x) => out.put_u32(*x)?,
                Variant::UInt64(x) => out.put_u64(*x)?,
                Variant::Float(x) => out.put_f32(*x)?,
                Variant::Double(x) => out.put_f64(*x)?,
                Variant::Time(x) => out.put_i64(*x)?,
                Variant::Date(x) => {
                    if *x > 0xFF_FFFF {
                        return Err(Error::TypeMismatch(format!(
                            "date {} does not fit in 24 bits",
                            x
                        )));
                    }
                    out.put(&x.to_le_bytes()[0..3])?
                }
                Variant::Uuid(b) | Variant::Ipv6(b) => out.put(b)?,
                Variant::Str(s) => {
                    if s.len() > c.bytes {
                        return Err(Error::RowBytesExceeded(c.bytes));
                    }
                    out.array_put(s.as_bytes(), c.bytes)?
                }
                Variant::Bytes(b) => {
                    if b.len() > c.bytes {
                        return Err(Error::RowBytesExceeded(c.bytes));
                    }
                    out.array_put(b, c.bytes)?
                }
                Variant::Dec(d) => {
                    let b = d.to_bytes();
                    if b.len() > c.bytes {
                        return Err(Error::RowBytesExceeded(c.bytes));
                    }
                    out.array_put(&b, c.bytes)?
                }
                Variant::Null => unreachable!(),
            }
        }
        out.flip();
        Ok(())
    }

    /// Decode a row from slot data. The inverse of encode.
    pub fn decode(&mut self, data: &[u8]) -> Result<()> {
        let cols = &self.info.columns;
        if data.len() < 2 {
            return Err(Error::BufferOverflow);
        }
        let n = util::getu16(data, 0) as usize;
        if n != cols.len() {
            return Err(Error::ColumnMismatch {
                got: n,
                want: cols.len(),
            });
        }
        self.values.clear();
        let mut off = 2;
        for c in cols {
            if off + 2 > data.len() {
                return Err(Error::BufferOverflow);
            }
            let tag = util::getu16(data, off);
            off += 2;
            if tag == TAG_NULL {
                self.values.push(Variant::Null);
                continue;
            }
            if tag == TAG_ZERO {
                self.values.push(Variant::zero(c.typ));
                continue;
            }
            if tag != c.typ.tag() {
                return Err(Error::TypeMismatch(format!(
                    "column '{}' is {}, stored tag is {}",
                    c.name,
                    c.typ.name(),
                    tag
                )));
            }
            let v = match c.typ.fixed_width() {
                Some(w) => {
                    if off + w > data.len() {
                        return Err(Error::BufferOverflow);
                    }
                    let v = decode_fixed(c.typ, &data[off..off + w]);
                    off += w;
                    v
                }
                None => {
                    if off + 2 + c.bytes > data.len() {
                        return Err(Error::BufferOverflow);
                    }
                    let len = util::getu16(data, off) as usize;
                    off += 2;
                    if len > c.bytes {
                        return Err(Error::RowBytesExceeded(c.bytes));
                    }
                    let bytes = &data[off..off + len];
                    off += c.bytes;
                    match c.typ {
                        DataType::Str => {
                            let s = std::str::from_utf8(bytes).map_err(|_| {
                                Error::TypeMismatch(format!(
                                    "column '{}' holds invalid utf-8",
                                    c.name
                                ))
                            })?;
                            Variant::Str(Rc::new(s.to_string()))
                        }
                        DataType::Bytes => Variant::Bytes(Rc::new(bytes.to_vec())),
                        DataType::Decimal => Variant::Dec(Decimal::from_bytes(bytes)?),
                        _ => unreachable!(),
                    }
                }
            };
            self.values.push(v);
        }
        Ok(())
    }
}

fn decode_fixed(typ: DataType, b: &[u8]) -> Variant {
    match typ {
        DataType::Int8 => Variant::Int8(b[0] as i8),
        DataType::UInt8 => Variant::UInt8(b[0]),
        DataType::Int16 => Variant::Int16(util::iget(b, 0, 2) as i16),
        DataType::UInt16 => Variant::UInt16(util::getu16(b, 0)),
        DataType::Int32 => Variant::Int32(util::iget(b, 0, 4) as i32),
        DataType::UInt32 => Variant::UInt32(util::getu32(b, 0)),
        DataType::Int64 => Variant::Int64(util::iget(b, 0, 8)),
        DataType::UInt64 => Variant::UInt64(util::getu64(b, 0)),
        DataType::Float => Variant::Float(util::getf32(b, 0)),
        DataType::Double => Variant::Double(util::getf64(b, 0)),
        DataType::Date => Variant::Date(util::get(b, 0, 3) as u32),
        DataType::Time => Variant::Time(util::iget(b, 0, 8)),
        DataType::Uuid => Variant::Uuid(b.try_into().unwrap()),
        DataType::Ipv6 => Variant::Ipv6(b.try_into().unwrap()),
        DataType::Str | DataType::Bytes | DataType::Decimal => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::Meta;

    fn schema() -> Rc<Meta> {
        Rc::new(
            Meta::parse(
                "CREATE TABLE t (
                    a int, b uint8, c string(6), d decimal(2), e double, f date,
                    INDEX primary (a)
                )",
            )
            .unwrap(),
        )
    }

    #[test]
    fn encode_decode() {
        let info = schema();
        let mut row = Row::new(info.clone());
        row.values = vec![
            Variant::Int64(-42),
            Variant::UInt8(7),
            Variant::Str(Rc::new("abc".to_string())),
            Variant::Dec(Decimal::from_string("1.25", 2).unwrap()),
            Variant::Double(2.5),
            Variant::Date(123456),
        ];
        let mut buf = ByteBuf::new(info.row_bytes);
        row.encode(&mut buf).unwrap();
        assert!(buf.as_slice().len() <= info.row_bytes);

        let mut back = Row::new(info);
        back.decode(buf.as_slice()).unwrap();
        assert_eq!(back.values, row.values);
    }

    #[test]
    fn null_and_zero() {
        let info = schema();
        let mut row = Row::new(info.clone());
        row.values = vec![
            Variant::Int64(0),
            Variant::Null,
            Variant::Str(Rc::new(String::new())),
            Variant::Null,
            Variant::Double(0.0),
            Variant::Date(0),
        ];
        let mut buf = ByteBuf::new(info.row_bytes);
        row.encode(&mut buf).unwrap();
        // All null or zero: 2 bytes count + 6 * 2 byte tags.
        assert_eq!(buf.as_slice().len(), 14);
        let mut back = Row::new(info);
        back.decode(buf.as_slice()).unwrap();
        assert_eq!(back.values, row.values);
    }

    #[test]
    fn width_violation() {
        let info = schema();
        let mut row = Row::new(info.clone());
        row.values[2] = Variant::Str(Rc::new("1234567".to_string())); // Budget is 6.
        let mut buf = ByteBuf::new(info.row_bytes);
        assert!(matches!(
            row.encode(&mut buf),
            Err(Error::RowBytesExceeded(6))
        ));
        // Exactly at the budget is fine.
        row.values[2] = Variant::Str(Rc::new("123456".to_string()));
        row.encode(&mut buf).unwrap();
    }

    #[test]
    fn arity_mismatch() {
        let info = schema();
        let mut row = Row::new(info.clone());
        row.values.pop();
        let mut buf = ByteBuf::new(info.row_bytes);
        assert!(matches!(
            row.encode(&mut buf),
            Err(Error::ColumnMismatch { got: 5, want: 6 })
        ));
    }

    #[test]
    fn wrong_type_rejected() {
        let info = schema();
        let mut row = Row::new(info.clone());
        row.values[0] = Variant::Str(Rc::new("not an int".to_string()));
        let mut buf = ByteBuf::new(info.row_bytes);
        assert!(matches!(row.encode(&mut buf), Err(Error::TypeMismatch(_))));
    }
}
