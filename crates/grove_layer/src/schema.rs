//! Schema descriptors consumed by the storage layer.
//!
//! These records are produced by the outer schema manager; the layer only
//! reads them. Each storable object carries a `StorageDescription` binding it
//! to the packed prefix the directory layer allocated for its data path.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Schema-qualified object name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectName {
    pub schema: String,
    pub name: String,
}

impl ObjectName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Live-data directory path for this object.
    pub fn data_path(&self) -> Vec<String> {
        vec!["data".into(), self.schema.clone(), self.name.clone()]
    }

    /// Staging directory path used while an alter is in flight.
    pub fn alter_path(&self) -> Vec<String> {
        vec!["dataAltering".into(), self.schema.clone(), self.name.clone()]
    }
}

impl std::fmt::Display for ObjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Binding of a logical object to its allocated byte prefix. Immutable once
/// resolved for a schema generation; no active prefix is a proper prefix of
/// another (guaranteed by the directory layer's allocator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDescription {
    path: Vec<String>,
    prefix: Vec<u8>,
}

impl StorageDescription {
    pub fn new(path: Vec<String>, prefix: Vec<u8>) -> Self {
        Self { path, prefix }
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Stable identity for process-wide caches keyed by storage location.
    pub fn unique_key(&self) -> &[u8] {
        &self.prefix
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub nullable: bool,
}

/// One table of a group. `ordinal` fixes the table's slot in hkeys;
/// `parent_join_fields` are the child-side positions of the grouping join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub name: ObjectName,
    pub ordinal: i64,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<usize>,
    pub parent_join_fields: Vec<usize>,
}

impl TableDef {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.columns.is_empty() {
            return Err(StoreError::Internal(format!(
                "table {} has no columns",
                self.name
            )));
        }
        for position in self.primary_key.iter().chain(&self.parent_join_fields) {
            if *position >= self.columns.len() {
                return Err(StoreError::Internal(format!(
                    "table {} references column position {position} out of bounds",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// A set of tables physically co-located under one hkey space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDef {
    pub name: ObjectName,
    pub storage: StorageDescription,
}

/// Which side of the grouping join anchors a group index's rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Left,
    Right,
}

/// Table index vs. group index. Group indexes span tables of one group and
/// carry the projection from index-row positions to positions in the
/// flattened group row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Table,
    Group {
        join: JoinType,
        row_composition: Vec<usize>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: ObjectName,
    pub index_name: String,
    pub kind: IndexKind,
    /// Positions of the key columns in the (flattened) row, declared order.
    pub key_columns: Vec<usize>,
    pub unique: bool,
    pub unique_and_may_contain_nulls: bool,
    pub storage: StorageDescription,
}

impl IndexDef {
    pub fn is_group_index(&self) -> bool {
        matches!(self.kind, IndexKind::Group { .. })
    }

    /// Qualified label used in errors and logs.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.name, self.index_name)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.key_columns.is_empty() {
            return Err(StoreError::Internal(format!(
                "index {} has no key columns",
                self.qualified_name()
            )));
        }
        if self.unique_and_may_contain_nulls && !self.unique {
            return Err(StoreError::Internal(format!(
                "index {} is nullable-unique but not unique",
                self.qualified_name()
            )));
        }
        if let IndexKind::Group {
            row_composition, ..
        } = &self.kind
        {
            if row_composition.len() < self.key_columns.len() {
                return Err(StoreError::Internal(format!(
                    "index {} row composition is narrower than its key",
                    self.qualified_name()
                )));
            }
        }
        Ok(())
    }
}

/// Logical counter allocated in cached batches. Raw ticks map to user-facing
/// values through `start_value`/`increment`. A non-positive `cache_size`
/// defers to the store's configured default batch width.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceDef {
    pub name: ObjectName,
    pub cache_size: i64,
    pub start_value: i64,
    pub increment: i64,
    pub storage: StorageDescription,
}

impl SequenceDef {
    /// Map a raw tick (1-based) to the user-visible value.
    pub fn real_value_for_raw(&self, raw: i64) -> i64 {
        self.start_value + (raw - 1) * self.increment
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.increment == 0 {
            return Err(StoreError::Internal(format!(
                "sequence {} has zero increment",
                self.name
            )));
        }
        Ok(())
    }
}
