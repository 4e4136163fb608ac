//! Little-endian encoding of primitive and scalar values into byte buffers.
//!
//! Used for both aggregate state serialization and the batch encoding in
//! temporary files. Decoding is checked, reading past the end of the input
//! returns an error instead of panicking.

use aggspill_error::{DbError, Result, ResultExt};
use bytes::{Buf, BufMut};

use super::datatype::DataType;
use super::scalar::ScalarValue;

#[derive(Debug)]
pub struct ByteEncoder<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> ByteEncoder<'a> {
    /// Create a new encoder writing to the end of `buf`.
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        ByteEncoder { buf }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    /// Put a length-prefixed byte slice.
    ///
    /// Errors if the slice is too long for a u32 length prefix.
    pub fn put_bytes(&mut self, v: &[u8]) -> Result<()> {
        self.buf.put_u32_le(encoded_len(v.len())?);
        self.buf.put_slice(v);
        Ok(())
    }

    pub fn put_scalar(&mut self, v: &ScalarValue) -> Result<()> {
        self.put_u8(v.datatype().tag());
        match v {
            ScalarValue::Null => (),
            ScalarValue::Boolean(b) => self.put_u8(*b as u8),
            ScalarValue::Int64(i) => self.put_i64(*i),
            ScalarValue::Float64(f) => self.put_f64(*f),
            ScalarValue::Utf8(s) => self.put_bytes(s.as_bytes())?,
            ScalarValue::Binary(b) => self.put_bytes(b)?,
        }
        Ok(())
    }
}

/// Convert a length to its encoded u32 form.
pub fn encoded_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| DbError::new("Value too large to encode").with_field("len", len))
}

#[derive(Debug)]
pub struct ByteDecoder<'a> {
    buf: &'a [u8],
}

impl<'a> ByteDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteDecoder { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(DbError::new("Buffer too small to decode value")
                .with_field("need", n)
                .with_field("remaining", self.buf.remaining()));
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        self.ensure(8)?;
        Ok(self.buf.get_f64_le())
    }

    /// Get a length-prefixed byte slice.
    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.ensure(len)?;
        let (bytes, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(bytes)
    }

    pub fn get_scalar(&mut self) -> Result<ScalarValue> {
        let datatype = DataType::try_from_tag(self.get_u8()?)?;
        Ok(match datatype {
            DataType::Null => ScalarValue::Null,
            DataType::Boolean => ScalarValue::Boolean(self.get_u8()? != 0),
            DataType::Int64 => ScalarValue::Int64(self.get_i64()?),
            DataType::Float64 => ScalarValue::Float64(self.get_f64()?),
            DataType::Utf8 => {
                let bytes = self.get_bytes()?;
                let s = std::str::from_utf8(bytes).context("Invalid utf8 in encoded value")?;
                ScalarValue::Utf8(s.to_string())
            }
            DataType::Binary => ScalarValue::Binary(self.get_bytes()?.to_vec()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_in_sequence() {
        let vals = [
            ScalarValue::Null,
            ScalarValue::Boolean(true),
            ScalarValue::Int64(-4),
            ScalarValue::Float64(1.5),
            ScalarValue::from("hello"),
            ScalarValue::Binary(vec![1, 2, 3]),
        ];

        let mut buf = Vec::new();
        let mut enc = ByteEncoder::new(&mut buf);
        for v in &vals {
            enc.put_scalar(v).unwrap();
        }

        let mut dec = ByteDecoder::new(&buf);
        for v in &vals {
            assert_eq!(v, &dec.get_scalar().unwrap());
        }
        assert_eq!(0, dec.remaining());
    }

    #[test]
    fn truncated_input_errors() {
        let mut buf = Vec::new();
        ByteEncoder::new(&mut buf)
            .put_scalar(&ScalarValue::from("hello"))
            .unwrap();
        buf.truncate(buf.len() - 1);

        let mut dec = ByteDecoder::new(&buf);
        assert!(dec.get_scalar().is_err());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn oversized_length_errors() {
        assert_eq!(u32::MAX, encoded_len(u32::MAX as usize).unwrap());
        assert!(encoded_len(u32::MAX as usize + 1).is_err());
    }

    #[test]
    fn unknown_tag_errors() {
        let buf = [200u8];
        assert!(ByteDecoder::new(&buf).get_scalar().is_err());
    }
}
