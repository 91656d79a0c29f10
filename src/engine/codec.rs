//! The binary dictionary format.
//!
//! All integers are little-endian.
//!
//! ```text
//! u32 entry count
//! per entry:
//!   u32 key byte length, key bytes (UTF-8, or UTF-16LE code units)
//!   i32 value length (-1 = absent), value bytes
//! ```
//!
//! Values are opaque and round-trip byte for byte.

use crate::config::StringEncoding;
use crate::engine::buffer::{self, PooledBuffer};
use crate::engine::map::{KeyComparer, StoreMap};
use crate::{Error, Result};

/// Fixed bytes each entry adds on top of its key and value.
pub const ENTRY_OVERHEAD: usize = 8;
/// Fixed bytes a snapshot adds on top of its entries.
pub const HEADER_SIZE: usize = 4;

const ABSENT: i32 = -1;

/// Why a persisted dictionary could not be parsed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("truncated at byte {offset}: needed {needed} more bytes")]
    Truncated { offset: usize, needed: usize },
    #[error("invalid value length {length} at byte {offset}")]
    InvalidLength { offset: usize, length: i64 },
    #[error("key at byte {offset} is not valid {encoding}")]
    InvalidKey {
        offset: usize,
        encoding: StringEncoding,
    },
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
    #[error("payload could not be decrypted (wrong key or corrupt data)")]
    Undecryptable,
}

/// Appends the encoded form of `map` to `out`.
pub fn encode(map: &StoreMap, encoding: StringEncoding, out: &mut PooledBuffer<'_, u8>) -> Result<()> {
    let count = u32::try_from(map.len())
        .map_err(|_| Error::InvalidArgument("too many entries to serialize".to_string()))?;
    out.write(&count.to_le_bytes());

    for entry in map.entries() {
        write_key(out, entry.key(), encoding)?;
        match entry.value() {
            None => out.write(&ABSENT.to_le_bytes()),
            Some(value) => {
                let len = i32::try_from(value.len()).map_err(|_| {
                    Error::InvalidArgument(format!(
                        "value for key '{}' is too large to serialize",
                        entry.key()
                    ))
                })?;
                out.write(&len.to_le_bytes());
                out.write(value);
            }
        }
    }
    Ok(())
}

fn write_key(out: &mut PooledBuffer<'_, u8>, key: &str, encoding: StringEncoding) -> Result<()> {
    match encoding {
        StringEncoding::Utf8 => {
            out.write(&key_len(key.len())?.to_le_bytes());
            out.write(key.as_bytes());
        }
        StringEncoding::Utf16 => {
            // UTF-16 never needs more code units than UTF-8 needs bytes.
            let mut units = buffer::chars().rent(key.len());
            let mut count = 0;
            for (slot, unit) in units.tail_mut().iter_mut().zip(key.encode_utf16()) {
                *slot = unit;
                count += 1;
            }
            units.advance(count)?;

            out.write(&key_len(count * 2)?.to_le_bytes());
            let bytes = out.tail_with(count * 2);
            for (pair, unit) in bytes.chunks_exact_mut(2).zip(units.written()) {
                pair.copy_from_slice(&unit.to_le_bytes());
            }
            out.advance(count * 2)?;
        }
    }
    Ok(())
}

fn key_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::InvalidArgument("key is too long to serialize".to_string()))
}

/// Parses an encoded dictionary into a map compared by `comparer`.
///
/// Later duplicates of a key (possible when an ordinal file is loaded case-insensitively)
/// replace earlier ones.
pub fn decode(
    bytes: &[u8],
    encoding: StringEncoding,
    comparer: KeyComparer,
) -> std::result::Result<StoreMap, FormatError> {
    let mut reader = Reader { bytes, pos: 0 };
    let count = reader.u32()? as usize;
    // Each entry needs at least its two length prefixes.
    let capacity = count.min(reader.remaining() / ENTRY_OVERHEAD);
    let mut map = StoreMap::with_capacity(comparer, capacity);

    for _ in 0..count {
        let key_offset = reader.pos;
        let key_len = reader.u32()? as usize;
        let key = decode_key(reader.take(key_len)?, encoding).ok_or(FormatError::InvalidKey {
            offset: key_offset,
            encoding,
        })?;

        let value_offset = reader.pos;
        let value = match reader.i32()? {
            ABSENT => None,
            len if len < 0 => {
                return Err(FormatError::InvalidLength {
                    offset: value_offset,
                    length: len as i64,
                })
            }
            len => Some(reader.take(len as usize)?.to_vec()),
        };
        map.insert(key, value);
    }

    match reader.remaining() {
        0 => Ok(map),
        extra => Err(FormatError::TrailingBytes(extra)),
    }
}

fn decode_key(raw: &[u8], encoding: StringEncoding) -> Option<String> {
    match encoding {
        StringEncoding::Utf8 => String::from_utf8(raw.to_vec()).ok(),
        StringEncoding::Utf16 => {
            if raw.len() % 2 != 0 {
                return None;
            }
            let units = raw
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
            char::decode_utf16(units).collect::<std::result::Result<String, _>>().ok()
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> std::result::Result<&'a [u8], FormatError> {
        if len > self.remaining() {
            return Err(FormatError::Truncated {
                offset: self.pos,
                needed: len - self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u32(&mut self) -> std::result::Result<u32, FormatError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn i32(&mut self) -> std::result::Result<i32, FormatError> {
        let raw = self.take(4)?;
        Ok(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(comparer: KeyComparer) -> StoreMap {
        let mut map = StoreMap::new(comparer);
        map.insert("alpha".to_string(), Some(vec![1, 2, 3]));
        map.insert("ünïcødé ✓".to_string(), Some((0..=255).collect()));
        map.insert("empty".to_string(), Some(Vec::new()));
        map.insert("absent".to_string(), None);
        map
    }

    fn encoded(map: &StoreMap, encoding: StringEncoding) -> Vec<u8> {
        let mut out = buffer::bytes().rent(64);
        encode(map, encoding, &mut out).unwrap();
        out.to_vec()
    }

    #[test]
    fn test_roundtrip_both_encodings() {
        let map = sample(KeyComparer::Ordinal);
        for encoding in [StringEncoding::Utf8, StringEncoding::Utf16] {
            let bytes = encoded(&map, encoding);
            let back = decode(&bytes, encoding, KeyComparer::Ordinal).unwrap();
            assert_eq!(back.len(), map.len());
            for entry in map.entries() {
                assert_eq!(back.get(entry.key()), Some(entry));
            }
        }
    }

    #[test]
    fn test_layout_of_single_entry() {
        let mut map = StoreMap::new(KeyComparer::Ordinal);
        map.insert("ab".to_string(), Some(vec![9]));
        let bytes = encoded(&map, StringEncoding::Utf8);
        assert_eq!(bytes, vec![1, 0, 0, 0, 2, 0, 0, 0, b'a', b'b', 1, 0, 0, 0, 9]);

        let utf16 = encoded(&map, StringEncoding::Utf16);
        assert_eq!(&utf16[4..12], &[4, 0, 0, 0, b'a', 0, b'b', 0]);
    }

    #[test]
    fn test_truncated_input() {
        let bytes = encoded(&sample(KeyComparer::Ordinal), StringEncoding::Utf8);
        for cut in [0, 3, 7, bytes.len() - 1] {
            let err = decode(&bytes[..cut], StringEncoding::Utf8, KeyComparer::Ordinal).unwrap_err();
            assert!(matches!(err, FormatError::Truncated { .. }), "cut {}: {:?}", cut, err);
        }
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = encoded(&sample(KeyComparer::Ordinal), StringEncoding::Utf8);
        bytes.push(0);
        assert_eq!(
            decode(&bytes, StringEncoding::Utf8, KeyComparer::Ordinal).unwrap_err(),
            FormatError::TrailingBytes(1)
        );
    }

    #[test]
    fn test_invalid_key_and_length() {
        let bad_key = [1, 0, 0, 0, 1, 0, 0, 0, 0xff, 0, 0, 0, 0];
        assert!(matches!(
            decode(&bad_key, StringEncoding::Utf8, KeyComparer::Ordinal),
            Err(FormatError::InvalidKey { offset: 4, .. })
        ));

        let bad_len = [1, 0, 0, 0, 1, 0, 0, 0, b'k', 0xfe, 0xff, 0xff, 0xff];
        assert!(matches!(
            decode(&bad_len, StringEncoding::Utf8, KeyComparer::Ordinal),
            Err(FormatError::InvalidLength { length: -2, .. })
        ));
    }

    #[test]
    fn test_huge_count_does_not_preallocate() {
        let bytes = [0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            decode(&bytes, StringEncoding::Utf8, KeyComparer::Ordinal),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_ignore_case_load_merges_duplicates() {
        let mut map = StoreMap::new(KeyComparer::Ordinal);
        map.insert("Key".to_string(), Some(vec![1]));
        map.insert("key".to_string(), Some(vec![2]));
        let bytes = encoded(&map, StringEncoding::Utf8);
        let back = decode(&bytes, StringEncoding::Utf8, KeyComparer::IgnoreCase).unwrap();
        assert_eq!(back.len(), 1);
        assert!(back.contains_key("KEY"));
    }
}
