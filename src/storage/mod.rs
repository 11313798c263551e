//! Storage: unified values, schemas, and the hybrid backend stack.

pub mod engine;
pub mod kv;
pub mod memory;
pub mod router;
pub mod schema;
pub mod value;

pub use engine::{Isolation, ScanRequest, StorageEngine, TxnContext};
pub use router::{OpKind, RouteTarget, Router, TableConfigManager};
pub use schema::{Catalog, ColumnDescriptor, IndexDescriptor, PersistencePolicy, SemanticType, TableDescriptor};
pub use value::{Row, Value};
