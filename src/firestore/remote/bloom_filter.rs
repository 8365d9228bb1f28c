use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use md5::{Digest, Md5};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::remote::watch_change::BloomFilterParams;

/// Bloom filter sent by the server with an existence filter, listing the names
/// of documents that still match a target.
///
/// Hashing follows the backend: the MD5 digest of the document name is split
/// into two little-endian 64-bit halves `h1` and `h2`, and bit `i` is
/// `(h1 + i * h2) mod bit_count` with wrapping 64-bit arithmetic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> FirestoreResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument("Invalid hash count: 0"));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Invalid padding when bitmap length is 0: {padding}"
            )));
        }
        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    /// Decodes the wire form. The bitmap arrives as base64 text.
    pub fn from_params(params: &BloomFilterParams) -> FirestoreResult<Self> {
        let bitmap = BASE64_STANDARD
            .decode(params.bitmap.as_bytes())
            .map_err(|err| invalid_argument(format!("Invalid bloom filter bitmap: {err}")))?;
        Self::new(bitmap, params.padding, params.hash_count)
    }

    /// Builds a filter with room for `bit_count` bits holding `values`.
    pub fn create<'a, I>(bit_count: u64, hash_count: i32, values: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let padding = if bit_count % 8 == 0 { 0 } else { 8 - bit_count % 8 };
        let bitmap = vec![0u8; bit_count.div_ceil(8) as usize];
        let mut filter = Self::new(bitmap, padding as i32, hash_count)?;
        for value in values {
            filter.insert(value);
        }
        Ok(filter)
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    /// Wire form of the filter, the inverse of [`BloomFilter::from_params`].
    pub fn to_params(&self) -> BloomFilterParams {
        BloomFilterParams {
            bitmap: BASE64_STANDARD.encode(&self.bitmap),
            padding: (self.bitmap.len() as u64 * 8 - self.bit_count) as i32,
            hash_count: self.hash_count as i32,
        }
    }

    /// False means `value` was definitely not inserted.
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (hash1, hash2) = hash_halves(value);
        (0..self.hash_count).all(|index| self.is_bit_set(self.bit_index(hash1, hash2, index)))
    }

    pub fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let (hash1, hash2) = hash_halves(value);
        for index in 0..self.hash_count {
            let bit = self.bit_index(hash1, hash2, index);
            self.bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    fn bit_index(&self, hash1: u64, hash2: u64, index: u32) -> u64 {
        hash1.wrapping_add(hash2.wrapping_mul(u64::from(index))) % self.bit_count
    }

    fn is_bit_set(&self, bit: u64) -> bool {
        self.bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }
}

fn hash_halves(value: &str) -> (u64, u64) {
    let digest = Md5::digest(value.as_bytes());
    let mut low = [0u8; 8];
    let mut high = [0u8; 8];
    low.copy_from_slice(&digest[..8]);
    high.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(low), u64::from_le_bytes(high))
}
