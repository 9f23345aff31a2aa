//! Hybrid array+hash table with Lua 5.1 semantics.
//!
//! The array part is an allocated vector whose holes are explicit nils; its
//! length is the allocated size, which is observable through `len()`. The
//! hash part preserves insertion order and tracks a power-of-two capacity so
//! that growth happens exactly when the reference implementation would
//! rehash (a new key arriving while every node is in use).

use crate::value::Value;
use indexmap::IndexMap;
use std::fmt;

/// 2^MAX_BITS is the largest array-part size; larger integer keys always
/// live in the hash part.
const MAX_BITS: usize = 26;
const MAX_ARRAY_SIZE: i64 = 1 << MAX_BITS;

/// Errors raised by table mutation and iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableError {
    IndexIsNil,
    IndexIsNaN,
    InvalidKeyToNext,
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::IndexIsNil => write!(f, "table index is nil"),
            TableError::IndexIsNaN => write!(f, "table index is NaN"),
            TableError::InvalidKeyToNext => write!(f, "invalid key to 'next'"),
        }
    }
}

impl std::error::Error for TableError {}

/// A Lua table: hybrid array part + insertion-ordered hash part.
pub struct Table {
    array: Vec<Value>,
    hash: IndexMap<Value, Value>,
    /// Node-array capacity of the hash part (power of two; 0 = none).
    hash_capacity: usize,
}

impl Table {
    pub fn new() -> Self {
        Table {
            array: Vec::new(),
            hash: IndexMap::new(),
            hash_capacity: 0,
        }
    }

    /// Create a table with pre-sized parts, as a constructor with size hints
    /// does: the array part is allocated (and nil-filled) up front.
    pub fn with_capacity(narray: usize, nhash: usize) -> Self {
        Table {
            array: vec![Value::Nil; narray],
            hash: IndexMap::with_capacity(nhash),
            hash_capacity: if nhash == 0 {
                0
            } else {
                nhash.next_power_of_two()
            },
        }
    }

    pub fn array_size(&self) -> usize {
        self.array.len()
    }

    /// Read a value. Absent keys, nil, and NaN read as nil.
    pub fn get(&self, key: &Value) -> Value {
        match key {
            Value::Nil => Value::Nil,
            Value::Number(n) if n.is_nan() => Value::Nil,
            _ => {
                let key = normalize_key(*key);
                if let Some(i) = key.as_array_index() {
                    if i <= self.array.len() as i64 {
                        return self.array[(i - 1) as usize];
                    }
                }
                self.hash.get(&key).copied().unwrap_or(Value::Nil)
            }
        }
    }

    /// Read an integer key, consulting the array part first.
    pub fn get_int(&self, i: i64) -> Value {
        if i >= 1 && i <= self.array.len() as i64 {
            self.array[(i - 1) as usize]
        } else {
            self.hash
                .get(&Value::Number(i as f64))
                .copied()
                .unwrap_or(Value::Nil)
        }
    }

    /// Write a value. Creates the key on miss (even for a nil value, which
    /// occupies a hash node until the next rehash). Nil and NaN keys are
    /// rejected.
    pub fn set(&mut self, key: Value, value: Value) -> Result<(), TableError> {
        match key {
            Value::Nil => return Err(TableError::IndexIsNil),
            Value::Number(n) if n.is_nan() => return Err(TableError::IndexIsNaN),
            _ => {}
        }
        let key = normalize_key(key);
        if let Some(i) = key.as_array_index() {
            if i <= self.array.len() as i64 {
                self.array[(i - 1) as usize] = value;
                return Ok(());
            }
        }
        if self.hash.contains_key(&key) {
            self.hash.insert(key, value);
        } else {
            self.new_key(key, value);
        }
        Ok(())
    }

    /// Convenience integer-key write.
    pub fn set_int(&mut self, i: i64, value: Value) {
        // integer keys can never be nil or NaN
        self.set(Value::Number(i as f64), value).unwrap();
    }

    fn new_key(&mut self, key: Value, value: Value) {
        if self.hash.len() >= self.hash_capacity {
            self.rehash(&key);
            // the grown array part may now hold this key
            if let Some(i) = key.as_array_index() {
                if i <= self.array.len() as i64 {
                    self.array[(i - 1) as usize] = value;
                    return;
                }
            }
        }
        self.hash.insert(key, value);
    }

    /// The `#` operator: some boundary of the table.
    ///
    /// A non-nil last array slot makes the allocated array size the answer
    /// (interior holes notwithstanding) unless the hash part extends the
    /// sequence; a nil last slot is resolved by binary search inside the
    /// array; otherwise the search continues through the hash part with a
    /// doubling probe, falling back to a linear scan when the probe index
    /// would overflow.
    pub fn len(&self) -> i64 {
        let size = self.array.len();
        if size > 0 && self.array[size - 1].is_nil() {
            let (mut i, mut j) = (0usize, size);
            while j - i > 1 {
                let m = (i + j) / 2;
                if self.array[m - 1].is_nil() {
                    j = m;
                } else {
                    i = m;
                }
            }
            i as i64
        } else if self.hash.is_empty() {
            size as i64
        } else {
            self.unbound_search(size as i64)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unbound_search(&self, start: i64) -> i64 {
        let mut i = start; // zero or a present index
        let mut j = i + 1;
        while !self.get_int(j).is_nil() {
            i = j;
            if j > i32::MAX as i64 / 2 {
                // pathologically sparse: resort to a linear scan
                let mut k = 1i64;
                while !self.get_int(k).is_nil() {
                    k += 1;
                }
                return k - 1;
            }
            j *= 2;
        }
        while j - i > 1 {
            let m = (i + j) / 2;
            if self.get_int(m).is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i
    }

    /// Resumable iteration: ascending array indices, then hash entries in
    /// insertion order. A nil key restarts; a key not present in the table
    /// is an error.
    pub fn next(&self, key: &Value) -> Result<Option<(Value, Value)>, TableError> {
        let array_start = match key {
            Value::Nil => 0usize,
            _ => {
                let key = normalize_key(*key);
                match key.as_array_index() {
                    Some(i) if i <= self.array.len() as i64 => i as usize,
                    _ => return self.next_in_hash(&key),
                }
            }
        };
        for idx in array_start..self.array.len() {
            if !self.array[idx].is_nil() {
                return Ok(Some((Value::Number((idx + 1) as f64), self.array[idx])));
            }
        }
        Ok(self.first_live_hash_entry(0))
    }

    fn next_in_hash(&self, key: &Value) -> Result<Option<(Value, Value)>, TableError> {
        match self.hash.get_index_of(key) {
            Some(pos) => Ok(self.first_live_hash_entry(pos + 1)),
            None => Err(TableError::InvalidKeyToNext),
        }
    }

    fn first_live_hash_entry(&self, from: usize) -> Option<(Value, Value)> {
        for pos in from..self.hash.len() {
            let (k, v) = self.hash.get_index(pos).unwrap();
            if !v.is_nil() {
                return Some((*k, *v));
            }
        }
        None
    }

    // ---- rehash ----

    fn rehash(&mut self, extra_key: &Value) {
        let mut nums = [0usize; MAX_BITS + 1];
        let mut nasize = self.count_array_keys(&mut nums);
        let mut totaluse = nasize;
        totaluse += self.count_hash_keys(&mut nums, &mut nasize);
        nasize += count_int(extra_key, &mut nums);
        totaluse += 1;
        let na = compute_sizes(&nums, &mut nasize);
        self.resize(nasize, totaluse - na);
    }

    /// Count non-nil array entries, bucketed by key magnitude.
    fn count_array_keys(&self, nums: &mut [usize; MAX_BITS + 1]) -> usize {
        let mut ause = 0;
        let mut i = 1usize;
        let mut ttlg = 1usize; // 2^lg
        for counter in nums.iter_mut() {
            let mut lc = 0;
            let mut lim = ttlg;
            if lim > self.array.len() {
                lim = self.array.len();
                if i > lim {
                    break;
                }
            }
            // elements with keys in (2^(lg-1), 2^lg]
            while i <= lim {
                if !self.array[i - 1].is_nil() {
                    lc += 1;
                }
                i += 1;
            }
            *counter += lc;
            ause += lc;
            ttlg *= 2;
        }
        ause
    }

    /// Count live hash entries; integer keys are also bucketed and added to
    /// the array-candidate count.
    fn count_hash_keys(&self, nums: &mut [usize; MAX_BITS + 1], nasize: &mut usize) -> usize {
        let mut totaluse = 0;
        for (k, v) in &self.hash {
            if v.is_nil() {
                continue;
            }
            *nasize += count_int(k, nums);
            totaluse += 1;
        }
        totaluse
    }

    fn resize(&mut self, nasize: usize, nhsize: usize) {
        let old_hash = std::mem::take(&mut self.hash);
        self.hash_capacity = if nhsize == 0 {
            0
        } else {
            nhsize.next_power_of_two()
        };
        if nasize > self.array.len() {
            self.array.resize(nasize, Value::Nil);
        } else if nasize < self.array.len() {
            // re-insert elements from the vanishing slice
            let vanishing: Vec<(i64, Value)> = self.array[nasize..]
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.is_nil())
                .map(|(off, v)| ((nasize + off + 1) as i64, *v))
                .collect();
            self.array.truncate(nasize);
            for (k, v) in vanishing {
                self.hash.insert(Value::Number(k as f64), v);
            }
        }
        // re-insert live hash entries; tombstones are dropped here
        for (k, v) in old_hash {
            if v.is_nil() {
                continue;
            }
            if let Some(i) = k.as_array_index() {
                if i <= self.array.len() as i64 {
                    self.array[(i - 1) as usize] = v;
                    continue;
                }
            }
            self.hash.insert(k, v);
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "table(array={}, hash={})",
            self.array.len(),
            self.hash.len()
        )
    }
}

/// Negative zero addresses the same slot as positive zero.
fn normalize_key(key: Value) -> Value {
    match key {
        Value::Number(n) if n == 0.0 => Value::Number(0.0),
        other => other,
    }
}

/// If `key` is an array-candidate integer, bucket it and return 1.
fn count_int(key: &Value, nums: &mut [usize; MAX_BITS + 1]) -> usize {
    match key.as_array_index() {
        Some(i) if i <= MAX_ARRAY_SIZE => {
            nums[ceil_log2(i as u64)] += 1;
            1
        }
        _ => 0,
    }
}

/// ceil(log2(x)) for x >= 1.
fn ceil_log2(x: u64) -> usize {
    if x <= 1 {
        0
    } else {
        (64 - (x - 1).leading_zeros()) as usize
    }
}

/// Given key-magnitude counts, pick the largest power of two such that more
/// than half of the slots below it would be in use. Returns the number of
/// integer keys that will live in the array part; `narray` becomes the new
/// array size.
fn compute_sizes(nums: &[usize; MAX_BITS + 1], narray: &mut usize) -> usize {
    let mut a = 0; // elements smaller than 2^i
    let mut na = 0; // elements that go to the array part
    let mut n = 0; // optimal size so far
    let mut twotoi = 1usize;
    let mut i = 0;
    while twotoi / 2 < *narray && i <= MAX_BITS {
        if nums[i] > 0 {
            a += nums[i];
            if a > twotoi / 2 {
                n = twotoi;
                na = a;
            }
        }
        if a == *narray {
            break;
        }
        i += 1;
        twotoi *= 2;
    }
    *narray = n;
    na
}
