//! Record and key codecs.
//!
//! Rows are JSON-serialized into redb's `&[u8]` value columns. Index keys
//! concatenate field values with a separator byte that is forbidden inside
//! field values, so composite keys order and prefix-match unambiguously.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Joins (and terminates) every field of an index key. Field values must
/// not contain this byte.
pub const SEP: u8 = 0x00;

/// Stands in for an empty field in an allow-blank index, keeping a blank
/// field distinguishable from an absent trailing field.
pub const BLANK: u8 = 0x1f;

/// Serialize a row for storage.
///
/// Panics on failure: an unencodable row means this replica can no longer
/// apply the log it was given, and continuing would diverge from consensus.
pub fn encode_record<R: Serialize>(row: &R) -> Vec<u8> {
    serde_json::to_vec(row).expect("state record encoding failed")
}

/// Decode a stored row.
///
/// Panics on failure, for the same reason as [`encode_record`]: a row that
/// no longer decodes means the store and the log have diverged.
pub fn decode_record<R: DeserializeOwned>(buf: &[u8]) -> R {
    serde_json::from_slice(buf).expect("state record decoding failed")
}

/// Big-endian row-id bytes, so row ids order the same way as their keys.
pub fn row_id_bytes(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Smallest byte string strictly greater than every key starting with
/// `prefix`, or `None` when no such bound exists (empty or all-0xff
/// prefixes scan to the end).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Node;

    #[test]
    fn record_roundtrip() {
        let node = Node {
            node: "n1".to_string(),
            address: "10.0.0.1".to_string(),
        };
        let buf = encode_record(&node);
        let back: Node = decode_record(&buf);
        assert_eq!(back, node);
    }

    #[test]
    #[should_panic(expected = "state record decoding failed")]
    fn decode_garbage_panics() {
        let _: Node = decode_record(b"not json");
    }

    #[test]
    fn row_ids_order_lexicographically() {
        assert!(row_id_bytes(1) < row_id_bytes(2));
        assert!(row_id_bytes(255) < row_id_bytes(256));
        assert!(row_id_bytes(u64::MAX - 1) < row_id_bytes(u64::MAX));
    }

    #[test]
    fn prefix_end_increments_last_byte() {
        assert_eq!(prefix_end(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(prefix_end(b"a\x00"), Some(b"a\x01".to_vec()));
    }

    #[test]
    fn prefix_end_carries_past_max_bytes() {
        assert_eq!(prefix_end(b"a\xff"), Some(b"b".to_vec()));
        assert_eq!(prefix_end(b"a\xff\xff"), Some(b"b".to_vec()));
    }

    #[test]
    fn prefix_end_unbounded_cases() {
        assert_eq!(prefix_end(b""), None);
        assert_eq!(prefix_end(b"\xff\xff"), None);
    }

    #[test]
    fn prefix_end_bounds_the_scan() {
        let end = prefix_end(b"foo/").unwrap();
        assert!(b"foo/".as_slice() < end.as_slice());
        assert!(b"foo/zzz".as_slice() < end.as_slice());
        assert!(b"fop".as_slice() >= end.as_slice());
    }
}
