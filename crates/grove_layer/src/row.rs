//! Opaque row payloads.
//!
//! The layer never interprets a row except to pull individual fields while
//! building index keys. Rows are stored as the tuple encoding of their field
//! values in declared column order, which keeps field extraction a plain
//! positional decode.

use grove_kv::{tuple, Segment};

use crate::error::StoreError;

/// Byte-encoded row payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowData {
    bytes: Vec<u8>,
}

impl RowData {
    /// Wrap already-encoded row bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Encode a row from field values in declared order.
    pub fn from_fields(fields: &[Segment]) -> Self {
        let mut bytes = Vec::new();
        tuple::pack_segments(&mut bytes, fields);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Decode all field values.
    pub fn fields(&self) -> Result<Vec<Segment>, StoreError> {
        tuple::unpack_segments(&self.bytes)
            .map_err(|err| StoreError::CorruptValue(format!("row payload: {err}")))
    }

    /// Decode the field at `position`.
    pub fn field(&self, position: usize) -> Result<Segment, StoreError> {
        let fields = self.fields()?;
        fields.get(position).cloned().ok_or_else(|| {
            StoreError::CorruptValue(format!(
                "row has {} fields, position {position} requested",
                fields.len()
            ))
        })
    }
}
