//! Packing and unpacking of persisted keys.
//!
//! Every persisted key is `prefix ++ tuple(segments)` where the prefix comes
//! from the owning object's storage description. An optional trailing edge
//! byte (0x00 below, 0xff above) turns a key into a range boundary for the
//! subtree rooted at it.

use grove_kv::{strinc, tuple, KvError, Segment};

use crate::error::StoreError;
use crate::key::{Edge, HKey, Key};
use crate::schema::StorageDescription;

/// `prefix ++ tuple(key)`.
pub fn pack(desc: &StorageDescription, key: &Key) -> Vec<u8> {
    let mut out = desc.prefix().to_vec();
    tuple::pack_segments(&mut out, key.segments());
    out
}

/// `prefix ++ tuple(key) ++ edge`.
pub fn pack_edge(desc: &StorageDescription, key: &Key, edge: Edge) -> Vec<u8> {
    let mut out = pack(desc, key);
    out.push(edge.byte());
    out
}

/// Exclusive upper bound of the object's entire keyspace.
pub fn prefix_end(desc: &StorageDescription) -> Result<Vec<u8>, StoreError> {
    strinc(desc.prefix()).map_err(StoreError::from)
}

/// Strip the prefix and decode the tuple back into a fresh key.
pub fn unpack(desc: &StorageDescription, packed: &[u8]) -> Result<Key, StoreError> {
    let prefix = desc.prefix();
    if !packed.starts_with(prefix) {
        return Err(StoreError::CorruptKey(format!(
            "key does not carry the expected prefix for {}",
            desc.path().join("/")
        )));
    }
    let segments = tuple::unpack_segments(&packed[prefix.len()..]).map_err(corrupt_key)?;
    Ok(Key::from_segments(segments))
}

/// Encode an hkey as a standalone value payload (no prefix).
pub fn pack_hkey_value(hkey: &HKey) -> Vec<u8> {
    let mut out = Vec::new();
    tuple::pack_segments(&mut out, hkey.segments());
    out
}

/// Decode a value payload produced by [`pack_hkey_value`].
pub fn unpack_hkey_value(bytes: &[u8]) -> Result<HKey, StoreError> {
    let segments: Vec<Segment> = tuple::unpack_segments(bytes)
        .map_err(|err| StoreError::CorruptValue(format!("hkey payload: {err}")))?;
    Ok(HKey::from_key(Key::from_segments(segments)))
}

/// Encode a single-long cell (sequence next-batch-start, null separator).
pub fn encode_long_cell(value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    tuple::pack_segments(&mut out, &[Segment::Int(value)]);
    out
}

/// Decode a single-long cell.
pub fn decode_long_cell(bytes: &[u8]) -> Result<i64, KvError> {
    match tuple::unpack_segments(bytes)?.as_slice() {
        [Segment::Int(value)] => Ok(*value),
        _ => Err(KvError::Corrupt("cell does not hold a single long".into())),
    }
}

fn corrupt_key(err: KvError) -> StoreError {
    StoreError::CorruptKey(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> StorageDescription {
        StorageDescription::new(vec!["data".into(), "s".into(), "t".into()], vec![0x15, 0x07])
    }

    fn sample_key() -> Key {
        let mut key = Key::new();
        key.append_int(1);
        key.append_str("widget");
        key.append_null();
        key
    }

    #[test]
    fn pack_then_unpack_recovers_key() {
        let key = sample_key();
        let packed = pack(&desc(), &key);
        assert!(packed.starts_with(desc().prefix()));
        assert_eq!(unpack(&desc(), &packed).unwrap(), key);
    }

    #[test]
    fn edges_bracket_the_descendants() {
        let key = sample_key();
        let plain = pack(&desc(), &key);
        let before = pack_edge(&desc(), &key, Edge::Before);
        let after = pack_edge(&desc(), &key, Edge::After);
        // The row itself sorts below BEFORE: [before, after) holds only
        // proper descendants, while [plain, after) also includes the row.
        assert!(plain < before);
        assert!(before < after);

        let mut child = key.clone();
        child.append_int(9);
        let child_packed = pack(&desc(), &child);
        assert!(child_packed >= before);
        assert!(child_packed < after);

        // An unrelated sibling key falls outside the bracket.
        let mut sibling = Key::new();
        sibling.append_int(2);
        let sibling_packed = pack(&desc(), &sibling);
        assert!(sibling_packed < before || sibling_packed >= after);
    }

    #[test]
    fn unpack_rejects_foreign_prefix() {
        let other = StorageDescription::new(vec!["data".into(), "x".into()], vec![0x15, 0x08]);
        let packed = pack(&desc(), &sample_key());
        assert!(matches!(
            unpack(&other, &packed),
            Err(StoreError::CorruptKey(_))
        ));
    }

    #[test]
    fn unpack_rejects_malformed_segments() {
        let mut packed = desc().prefix().to_vec();
        packed.push(0xf0);
        assert!(matches!(
            unpack(&desc(), &packed),
            Err(StoreError::CorruptKey(_))
        ));
    }

    #[test]
    fn hkey_value_roundtrip() {
        let hkey = HKey::root(1, &[Segment::Int(10), Segment::Str("a".into())]);
        let bytes = pack_hkey_value(&hkey);
        assert_eq!(unpack_hkey_value(&bytes).unwrap(), hkey);
    }
}
