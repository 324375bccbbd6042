//! Grove storage layer: projects a grouped relational schema (tables joined
//! into parent/child groups, table and group indexes, sequences) onto a flat,
//! transactional, lexicographically-ordered key/value store.
//!
//! The layer owns the on-disk encoding (prefix ++ tuple-encoded key), the
//! hkey colocation scheme that keeps a group's rows physically interleaved in
//! join order, uniqueness checking under optimistic transactions, group-index
//! row counting via atomic ADD cells, batched sequence allocation, and the
//! directory-move protocol behind schema alters.

pub mod alter;
pub mod codec;
pub mod config;
pub mod error;
pub mod index;
pub mod key;
pub mod metrics;
pub mod row;
pub mod schema;
pub mod sequence;
pub mod session;
pub mod store;
pub mod traverse;

pub use alter::{AlterListener, ChangeLevel};
pub use config::StoreConfig;
pub use error::StoreError;
pub use index::{IndexRow, PendingCheck};
pub use key::{Edge, HKey, Key};
pub use metrics::{MetricsSnapshot, StoreMetrics};
pub use row::RowData;
pub use schema::{
    ColumnDef, GroupDef, IndexDef, IndexKind, JoinType, ObjectName, SequenceDef,
    StorageDescription, TableDef,
};
pub use session::Session;
pub use store::{GroveStore, StoreData};
pub use traverse::{GroupVisitor, IndexVisitor};

pub use grove_kv::Segment;
