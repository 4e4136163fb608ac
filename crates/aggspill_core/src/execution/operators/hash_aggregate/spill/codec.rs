use std::hash::{BuildHasher, Hasher};

use aggspill_error::{DbError, Result};

use crate::arrays::array::{Array, ArrayData};
use crate::arrays::batch::Batch;
use crate::arrays::datatype::DataType;
use crate::arrays::encoding::{ByteDecoder, ByteEncoder, encoded_len};
use crate::arrays::hash::HASH_RANDOM_STATE;

pub const FILE_MAGIC: [u8; 8] = *b"AGGSPILL";
pub const FORMAT_VERSION: u32 = 1;
pub const FILE_HEADER_LEN: usize = FILE_MAGIC.len() + 4;

pub const SEGMENT_MAGIC: u32 = 0x4D47_4553;
pub const SEGMENT_HEADER_LEN: usize = 4 * 5 + 8;

pub fn encode_file_header(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&FILE_MAGIC);
    ByteEncoder::new(buf).put_u32(FORMAT_VERSION);
}

pub fn decode_file_header(buf: &[u8]) -> Result<()> {
    if buf.len() != FILE_HEADER_LEN || buf[..FILE_MAGIC.len()] != FILE_MAGIC {
        return Err(DbError::spill_read("Invalid temporary file header"));
    }
    let version = ByteDecoder::new(&buf[FILE_MAGIC.len()..]).get_u32()?;
    if version != FORMAT_VERSION {
        return Err(DbError::spill_read("Unsupported temporary file version")
            .with_field("version", version)
            .with_field("expected", FORMAT_VERSION));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub bucket: u32,
    pub row_count: u32,
    pub uncompressed_len: u32,
    pub compressed_len: u32,
    /// Hash of the other header fields and the compressed payload.
    pub checksum: u64,
}

impl SegmentHeader {
    /// Compute the checksum for this header and its payload.
    ///
    /// The stored `checksum` field is not part of the hash.
    pub fn compute_checksum(&self, payload: &[u8]) -> u64 {
        let mut hasher = HASH_RANDOM_STATE.build_hasher();
        hasher.write_u32(self.bucket);
        hasher.write_u32(self.row_count);
        hasher.write_u32(self.uncompressed_len);
        hasher.write_u32(self.compressed_len);
        hasher.write(payload);
        hasher.finish()
    }

    /// Check the stored checksum against the payload.
    pub fn verify(&self, payload: &[u8]) -> bool {
        self.compute_checksum(payload) == self.checksum
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut enc = ByteEncoder::new(buf);
        enc.put_u32(SEGMENT_MAGIC);
        enc.put_u32(self.bucket);
        enc.put_u32(self.row_count);
        enc.put_u32(self.uncompressed_len);
        enc.put_u32(self.compressed_len);
        enc.put_u64(self.checksum);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut dec = ByteDecoder::new(buf);
        let magic = dec.get_u32()?;
        if magic != SEGMENT_MAGIC {
            return Err(DbError::spill_read("Invalid segment magic").with_field("magic", magic));
        }
        Ok(SegmentHeader {
            bucket: dec.get_u32()?,
            row_count: dec.get_u32()?,
            uncompressed_len: dec.get_u32()?,
            compressed_len: dec.get_u32()?,
            checksum: dec.get_u64()?,
        })
    }
}

/// Encode a batch, appending to `buf`.
pub fn encode_batch(batch: &Batch, buf: &mut Vec<u8>) -> Result<()> {
    let mut enc = ByteEncoder::new(buf);
    enc.put_u32(encoded_len(batch.num_rows())?);
    enc.put_u32(encoded_len(batch.num_columns())?);

    for arr in batch.arrays() {
        enc.put_u8(arr.datatype().tag());
        match &arr.validity {
            Some(validity) => {
                enc.put_u8(1);
                let packed = pack_bits(validity);
                enc.put_bytes(&packed)?;
            }
            None => enc.put_u8(0),
        }

        match arr.data() {
            ArrayData::Null(_) => (),
            ArrayData::Boolean(v) => enc.put_bytes(&pack_bits(v))?,
            ArrayData::Int64(v) => v.iter().for_each(|v| enc.put_i64(*v)),
            ArrayData::Float64(v) => v.iter().for_each(|v| enc.put_f64(*v)),
            ArrayData::Utf8(v) => {
                for v in v {
                    enc.put_bytes(v.as_bytes())?;
                }
            }
            ArrayData::Binary(v) => {
                for v in v {
                    enc.put_bytes(v)?;
                }
            }
        }
    }

    Ok(())
}

/// Decode a batch, checking columns against the expected types.
pub fn decode_batch(buf: &[u8], datatypes: &[DataType]) -> Result<Batch> {
    let mut dec = ByteDecoder::new(buf);
    let num_rows = dec.get_u32()? as usize;
    let num_columns = dec.get_u32()? as usize;
    if num_columns != datatypes.len() {
        return Err(DbError::new("Unexpected number of columns in encoded batch")
            .with_field("expected", datatypes.len())
            .with_field("got", num_columns));
    }

    let mut arrays = Vec::with_capacity(num_columns);
    for &expected in datatypes {
        let datatype = DataType::try_from_tag(dec.get_u8()?)?;
        if datatype != expected {
            return Err(DbError::new("Unexpected column type in encoded batch")
                .with_field("expected", expected)
                .with_field("got", datatype));
        }

        let validity = match dec.get_u8()? {
            0 => None,
            _ => Some(unpack_bits(dec.get_bytes()?, num_rows)?),
        };

        let data = match datatype {
            DataType::Null => ArrayData::Null(num_rows),
            DataType::Boolean => ArrayData::Boolean(unpack_bits(dec.get_bytes()?, num_rows)?),
            DataType::Int64 => {
                ArrayData::Int64((0..num_rows).map(|_| dec.get_i64()).collect::<Result<_>>()?)
            }
            DataType::Float64 => {
                ArrayData::Float64((0..num_rows).map(|_| dec.get_f64()).collect::<Result<_>>()?)
            }
            DataType::Utf8 => {
                let mut values = Vec::with_capacity(num_rows);
                for _ in 0..num_rows {
                    let bytes = dec.get_bytes()?;
                    let s = std::str::from_utf8(bytes)
                        .map_err(|_| DbError::new("Invalid utf8 in encoded batch"))?;
                    values.push(s.to_string());
                }
                ArrayData::Utf8(values)
            }
            DataType::Binary => ArrayData::Binary(
                (0..num_rows)
                    .map(|_| dec.get_bytes().map(|b| b.to_vec()))
                    .collect::<Result<_>>()?,
            ),
        };

        arrays.push(Array {
            datatype,
            validity,
            data,
        });
    }

    if dec.remaining() != 0 {
        return Err(DbError::new("Trailing bytes after encoded batch")
            .with_field("remaining", dec.remaining()));
    }

    if arrays.is_empty() {
        return Ok(Batch::empty_with_num_rows(num_rows));
    }
    Batch::try_new(arrays)
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; bits.len().div_ceil(8)];
    for (idx, _) in bits.iter().enumerate().filter(|(_, b)| **b) {
        packed[idx / 8] |= 1 << (idx % 8);
    }
    packed
}

fn unpack_bits(packed: &[u8], len: usize) -> Result<Vec<bool>> {
    if packed.len() != len.div_ceil(8) {
        return Err(DbError::new("Unexpected bitmap length")
            .with_field("expected", len.div_ceil(8))
            .with_field("got", packed.len()));
    }
    Ok((0..len)
        .map(|idx| packed[idx / 8] & (1 << (idx % 8)) != 0)
        .collect())
}
