use ahash::RandomState;

use super::batch::Batch;
use super::row::ScalarRow;
use super::scalar::ScalarValue;

/// State used for all hashing operations during execution.
///
/// Seeds are fixed so the same key always hashes to the same value for the
/// lifetime of the process, which is what keeps bucket assignment consistent
/// across spills.
pub const HASH_RANDOM_STATE: RandomState = RandomState::with_seeds(0, 0, 0, 0);

/// Hash value to use when not provided with any groups.
///
/// Non-zero for debuggability.
pub const NO_GROUPS_HASH_VALUE: u64 = 49820;

const NULL_HASH: u64 = 0xA21258D088C87A13;

/// Combine two hashes into a single value.
///
/// Implementation taken from boost:
/// <https://github.com/boostorg/container_hash/blob/b8179488b20eb1373bdbf5c7fcca963f072512df/include/boost/container_hash/detail/hash_mix.hpp#L67>
const fn combine_hashes(v1: u64, v2: u64) -> u64 {
    const fn mix(mut x: u64) -> u64 {
        const M: u64 = 0xE9846AF9B1A615D;
        x ^= x.wrapping_shr(32);
        x = x.wrapping_mul(M);
        x ^= x.wrapping_shr(32);
        x = x.wrapping_mul(M);
        x ^= x.wrapping_shr(28);
        x
    }

    mix(v1.wrapping_add(0x9E3779B9).wrapping_add(v2))
}

pub fn hash_scalar(value: &ScalarValue) -> u64 {
    match value {
        ScalarValue::Null => NULL_HASH,
        other => HASH_RANDOM_STATE.hash_one(other),
    }
}

/// Hash a full group key.
pub fn hash_row(row: &ScalarRow) -> u64 {
    if row.columns.is_empty() {
        return NO_GROUPS_HASH_VALUE;
    }

    row.columns
        .iter()
        .enumerate()
        .fold(0, |acc, (idx, v)| {
            let h = hash_scalar(v);
            if idx == 0 { h } else { combine_hashes(acc, h) }
        })
}

/// Hash every row of the given columns in the batch, writing the hashes into
/// `hashes`.
///
/// When `columns` is empty, every row gets `NO_GROUPS_HASH_VALUE`, putting
/// all rows in a single group.
pub fn hash_batch_columns(batch: &Batch, columns: &[usize], hashes: &mut Vec<u64>) {
    hashes.clear();
    hashes.resize(batch.num_rows(), NO_GROUPS_HASH_VALUE);

    for (col_pos, &col_idx) in columns.iter().enumerate() {
        let arr = &batch.arrays()[col_idx];
        for (row_idx, hash) in hashes.iter_mut().enumerate() {
            let h = hash_scalar(&arr.value_unchecked(row_idx));
            *hash = if col_pos == 0 {
                h
            } else {
                combine_hashes(*hash, h)
            };
        }
    }
}

/// Get the bucket to use for a hash.
///
/// This must be the only place computing bucket assignment so that the
/// grouping table, spill writer and merger all agree.
pub const fn bucket_for_hash(hash: u64, num_buckets: usize) -> usize {
    (hash % num_buckets as u64) as usize
}
