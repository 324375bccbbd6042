//! Typed keys and hierarchical keys.

use std::fmt;

use grove_kv::Segment;

/// Synthetic boundary one position below (`Before`) or above (`After`) every
/// real segment at a key's current depth; used to form half-open ranges that
/// cover exactly one subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Before,
    After,
}

impl Edge {
    pub(crate) fn byte(self) -> u8 {
        match self {
            Edge::Before => 0x00,
            Edge::After => 0xff,
        }
    }
}

/// An ordered, append-only sequence of typed segments. Depth is the number of
/// appended segments; truncation discards the deepest ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key {
    segments: Vec<Segment>,
}

impl Key {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn append(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    pub fn append_int(&mut self, value: i64) {
        self.append(Segment::Int(value));
    }

    pub fn append_str(&mut self, value: impl Into<String>) {
        self.append(Segment::Str(value.into()));
    }

    pub fn append_bytes(&mut self, value: impl Into<Vec<u8>>) {
        self.append(Segment::Bytes(value.into()));
    }

    pub fn append_null(&mut self) {
        self.append(Segment::Null);
    }

    /// Drop segments beyond `depth`.
    pub fn set_depth(&mut self, depth: usize) {
        self.segments.truncate(depth);
    }

    /// Copy of the first `depth` segments.
    pub fn truncated(&self, depth: usize) -> Key {
        Key {
            segments: self.segments[..depth.min(self.segments.len())].to_vec(),
        }
    }

    pub fn starts_with(&self, prefix: &Key) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (idx, segment) in self.segments.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            match segment {
                Segment::Null => write!(f, "NULL")?,
                Segment::Int(v) => write!(f, "{v}")?,
                Segment::Str(s) => write!(f, "'{s}'")?,
                Segment::Bytes(b) => write!(f, "x'{}'", hex(b))?,
            }
        }
        write!(f, ")")
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Hierarchical key: ordinals and primary-key values spelling the path from
/// a group's root table down to one row. The hkey is the row's physical
/// identity within its group and defines group-scan order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct HKey {
    key: Key,
}

impl HKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_key(key: Key) -> Self {
        Self { key }
    }

    /// Start a root-level hkey: `[ordinal, pk...]`.
    pub fn root(ordinal: i64, pk: &[Segment]) -> Self {
        let mut hkey = Self::new();
        hkey.push_ordinal(ordinal);
        for segment in pk {
            hkey.push_key_segment(segment.clone());
        }
        hkey
    }

    /// Extend a parent hkey with a child table's ordinal and key columns.
    pub fn child(parent: &HKey, ordinal: i64, pk: &[Segment]) -> Self {
        let mut hkey = parent.clone();
        hkey.push_ordinal(ordinal);
        for segment in pk {
            hkey.push_key_segment(segment.clone());
        }
        hkey
    }

    pub fn push_ordinal(&mut self, ordinal: i64) {
        self.key.append_int(ordinal);
    }

    pub fn push_key_segment(&mut self, segment: Segment) {
        self.key.append(segment);
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn into_key(self) -> Key {
        self.key
    }

    pub fn segments(&self) -> &[Segment] {
        self.key.segments()
    }

    pub fn starts_with(&self, ancestor: &HKey) -> bool {
        self.key.starts_with(&ancestor.key)
    }
}

impl fmt::Display for HKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_tracks_appends_and_truncation() {
        let mut key = Key::new();
        key.append_int(1);
        key.append_str("x");
        key.append_null();
        assert_eq!(key.depth(), 3);
        key.set_depth(2);
        assert_eq!(key.depth(), 2);
        assert_eq!(
            key.segments(),
            &[Segment::Int(1), Segment::Str("x".into())]
        );
    }

    #[test]
    fn child_hkey_extends_parent() {
        let customer = HKey::root(1, &[Segment::Int(42)]);
        let order = HKey::child(&customer, 2, &[Segment::Int(7)]);
        assert!(order.starts_with(&customer));
        assert!(!customer.starts_with(&order));
        assert_eq!(
            order.segments(),
            &[
                Segment::Int(1),
                Segment::Int(42),
                Segment::Int(2),
                Segment::Int(7)
            ]
        );
    }

    #[test]
    fn display_formats_row_values() {
        let mut key = Key::new();
        key.append_int(3);
        key.append_str("abc");
        key.append_null();
        assert_eq!(key.to_string(), "(3, 'abc', NULL)");
    }
}
