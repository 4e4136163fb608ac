use aggspill_error::{DbError, Result};

#[derive(Debug, Clone, Copy)]
pub struct Entry {
    /// The hash value for this entry.
    pub hash: u64,
    /// Index of the group in the owning table.
    ///
    /// None if this slot isn't occupied.
    pub group: Option<usize>,
}

impl Entry {
    const ZERO: Self = Entry {
        hash: 0,
        group: None,
    };
}

/// Hash table directory containing indices to groups.
///
/// The number of occupied entries in the directory indicates the number of
/// groups.
#[derive(Debug)]
pub struct Directory {
    /// Number of occupied entries.
    pub num_occupied: usize,
    /// Entries in the table.
    pub entries: Vec<Entry>,
}

const _: () = {
    assert!(
        Directory::DEFAULT_CAPACITY.is_power_of_two(),
        "must be power of two"
    );
};

impl Directory {
    const LOAD_NUM: usize = 7;
    const LOAD_DEN: usize = 10;

    pub const DEFAULT_CAPACITY: usize = 512;

    pub fn try_with_capacity(capacity: usize) -> Result<Self> {
        let capacity = capacity
            .max(1)
            .checked_next_power_of_two()
            .ok_or_else(|| DbError::new("Requested capacity for directory to high"))?;

        Ok(Directory {
            num_occupied: 0,
            entries: vec![Entry::ZERO; capacity],
        })
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Resizes the directory to at least `new_capacity`.
    ///
    /// This will ensure the new capacity of the directory is a power of two.
    pub fn resize(&mut self, mut new_capacity: usize) -> Result<()> {
        if !is_power_of_two(new_capacity) {
            new_capacity = new_capacity
                .checked_next_power_of_two()
                .ok_or_else(|| DbError::new("Requested capacity for directory to high"))?;
        }
        if new_capacity < self.entries.len() {
            return Err(DbError::new("Cannot reduce capacity of hash table")
                .with_field("current", self.entries.len())
                .with_field("new", new_capacity));
        }

        let old_entries = std::mem::replace(&mut self.entries, vec![Entry::ZERO; new_capacity]);

        for ent in old_entries {
            if ent.group.is_none() {
                continue;
            }

            let mut offset = compute_offset_from_hash(ent.hash, new_capacity as u64) as usize;
            // Continue to try to insert until we find an empty slot.
            loop {
                if self.entries[offset].group.is_none() {
                    self.entries[offset] = ent;
                    break;
                }
                offset = inc_and_wrap_offset(offset, new_capacity);
            }
        }

        debug_assert_eq!(
            self.num_occupied,
            self.entries.iter().filter(|ent| ent.group.is_some()).count()
        );

        Ok(())
    }

    pub fn needs_resize(&self, num_inputs: usize) -> bool {
        // (num_occupied + num_inputs) / capacity > 7/10
        (self.num_occupied + num_inputs) * Self::LOAD_DEN > self.capacity() * Self::LOAD_NUM
    }

    /// Probe for the slot holding a group matching `hash` for which
    /// `is_match` returns true, or the empty slot where such a group should
    /// be inserted.
    ///
    /// Returns the slot offset.
    pub fn probe(&self, hash: u64, mut is_match: impl FnMut(usize) -> bool) -> Result<usize> {
        let cap = self.capacity();
        let mut offset = compute_offset_from_hash(hash, cap as u64) as usize;

        for _ in 0..cap {
            let ent = &self.entries[offset];
            match ent.group {
                None => return Ok(offset),
                Some(group) if ent.hash == hash && is_match(group) => return Ok(offset),
                _ => offset = inc_and_wrap_offset(offset, cap),
            }
        }

        // We wrapped. Callers resize before inserting so this shouldn't
        // happen.
        Err(DbError::new("Hash table completely full").with_field("cap", cap))
    }

    /// Size in bytes of the entries.
    pub fn size_bytes(&self) -> usize {
        self.entries.len() * std::mem::size_of::<Entry>()
    }
}

/// Increment offset by one, wrapping around if necessary.
///
/// Requires that `cap` be a power of 2.
pub const fn inc_and_wrap_offset(offset: usize, cap: usize) -> usize {
    (offset + 1) & (cap - 1)
}

/// Compute the initial offset using a hash.
///
/// Uses the high bits of the hash. Bucket assignment is derived from the low
/// bits, so every group in a per-bucket table would otherwise share the same
/// starting slots.
///
/// Requires that `cap` be a power of 2.
pub const fn compute_offset_from_hash(hash: u64, cap: u64) -> u64 {
    hash.rotate_left(32) & (cap - 1)
}

/// Returns if `v` is a power of two.
pub const fn is_power_of_two(v: usize) -> bool {
    v != 0 && (v & (v - 1)) == 0
}
