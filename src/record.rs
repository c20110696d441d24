//! Fixed-width record.

use std::cmp::Ordering;
use std::fmt;

/// Size of a record in bytes. All nodes of a cluster must agree on it.
pub const RECORD_SIZE: usize = 100;
/// Size of the record key prefix in bytes.
pub const KEY_SIZE: usize = 10;

/// An opaque fixed-width record. The first [`KEY_SIZE`] bytes are the sort key, the rest is payload.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Record([u8; RECORD_SIZE]);

impl Record {
    /// Reserved all-zero record marking the end of a stream in the legacy framing.
    pub const SENTINEL: Record = Record([0; RECORD_SIZE]);

    pub fn new(bytes: [u8; RECORD_SIZE]) -> Self {
        Record(bytes)
    }

    /// Creates a record from a slice. Returns [`None`] if the slice is not exactly [`RECORD_SIZE`] bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; RECORD_SIZE] = bytes.try_into().ok()?;
        Some(Record(bytes))
    }

    pub fn key(&self) -> &[u8] {
        &self.0[..KEY_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Checks if the record equals [`Record::SENTINEL`].
    pub fn is_sentinel(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Compares two records by their key prefix only.
    pub fn cmp_key(&self, other: &Record) -> Ordering {
        self.key().cmp(other.key())
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record(key=")?;
        for b in self.key() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;

    use rstest::*;

    use super::{Record, KEY_SIZE, RECORD_SIZE};

    fn record_with_key(key: &[u8], fill: u8) -> Record {
        let mut bytes = [fill; RECORD_SIZE];
        bytes[..key.len()].copy_from_slice(key);
        Record::new(bytes)
    }

    #[rstest]
    #[case(0, false)]
    #[case(RECORD_SIZE - 1, false)]
    #[case(RECORD_SIZE, true)]
    #[case(RECORD_SIZE + 1, false)]
    fn test_from_slice(#[case] len: usize, #[case] accepted: bool) {
        let bytes = vec![7u8; len];
        assert_eq!(Record::from_slice(&bytes).is_some(), accepted);
    }

    #[test]
    fn test_key() {
        let record = record_with_key(b"0123456789", 0xaa);

        assert_eq!(record.key(), b"0123456789");
        assert_eq!(record.key().len(), KEY_SIZE);
        assert!(record.as_bytes()[KEY_SIZE..].iter().all(|b| *b == 0xaa));
    }

    #[test]
    fn test_sentinel() {
        assert!(Record::SENTINEL.is_sentinel());
        assert!(Record::new([0; RECORD_SIZE]).is_sentinel());

        let mut bytes = [0; RECORD_SIZE];
        bytes[RECORD_SIZE - 1] = 1;
        assert!(!Record::new(bytes).is_sentinel());
    }

    #[rstest]
    #[case(b"aaaaaaaaaa", b"aaaaaaaaab", Ordering::Less)]
    #[case(b"b000000000", b"a999999999", Ordering::Greater)]
    #[case(b"kkkkkkkkkk", b"kkkkkkkkkk", Ordering::Equal)]
    fn test_cmp_key(#[case] left: &[u8], #[case] right: &[u8], #[case] expected: Ordering) {
        // payload differs but must not affect the ordering
        let left = record_with_key(left, 0xff);
        let right = record_with_key(right, 0x00);

        assert_eq!(left.cmp_key(&right), expected);
    }
}
