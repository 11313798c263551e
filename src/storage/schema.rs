//! Table metadata and the shared catalog
//!
//! Descriptors are created by DDL, owned by the storage engine that created
//! the table, and shared read-only with the planner through the catalog.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::value::Value;

/// Default database present at startup.
pub const DEFAULT_DATABASE: &str = "default";

/// Semantic column type, mapped onto MySQL wire types at the protocol edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SemanticType {
    Int,
    Uint,
    Float,
    Bool,
    String,
    Bytes,
    Time,
    Json,
}

impl SemanticType {
    /// MySQL protocol type byte for column definitions.
    pub fn mysql_type(&self) -> u8 {
        match self {
            SemanticType::Int | SemanticType::Uint => 8, // LONGLONG
            SemanticType::Float => 5,                    // DOUBLE
            SemanticType::Bool => 1,                     // TINY
            SemanticType::String => 253,                 // VAR_STRING
            SemanticType::Bytes => 252,                  // BLOB
            SemanticType::Time => 12,                    // DATETIME
            SemanticType::Json => 245,                   // JSON
        }
    }

    /// Display width reported in column definitions.
    pub fn column_length(&self) -> u32 {
        match self {
            SemanticType::Int | SemanticType::Uint => 20,
            SemanticType::Float => 22,
            SemanticType::Bool => 1,
            SemanticType::String => 1024,
            SemanticType::Bytes => 65_535,
            SemanticType::Time => 19,
            SemanticType::Json => 4_194_304,
        }
    }
}

/// Column descriptor; ordering within the table is part of the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: SemanticType,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    /// Literal default, if declared.
    pub default: Option<Value>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, data_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            primary_key: false,
            auto_increment: false,
            default: None,
        }
    }
}

/// Secondary index shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Hash,
    Ordered,
}

/// Secondary index descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub kind: IndexKind,
}

/// Where a table's rows live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PersistencePolicy {
    /// Rows exist only in the memory engine; lost on restart.
    #[default]
    MemoryOnly,
    /// Rows are routed to the persistent KV backend.
    Persistent {
        /// Flush the backend on every write.
        sync_on_write: bool,
        /// Keep a memory copy and dual-write.
        cache_in_memory: bool,
    },
}

impl PersistencePolicy {
    pub fn is_persistent(&self) -> bool {
        matches!(self, PersistencePolicy::Persistent { .. })
    }

    pub fn dual_write(&self) -> bool {
        matches!(
            self,
            PersistencePolicy::Persistent {
                cache_in_memory: true,
                ..
            }
        )
    }
}

/// Which engine family serves a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TableEngine {
    #[default]
    Hybrid,
    /// Remote table backed by an HTTP data source plugin.
    Http {
        source: String,
    },
}

/// Table descriptor shared read-only via the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key: Vec<String>,
    pub indexes: Vec<IndexDescriptor>,
    pub persistence: PersistencePolicy,
    pub engine: TableEngine,
    /// Columns covered by a FULLTEXT index.
    pub fulltext: Vec<String>,
}

impl TableDescriptor {
    /// Validate structural invariants: primary-key columns must exist and be
    /// declared non-null.
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(Error::Syntax(format!("table '{}' has no columns", self.name)));
        }
        let mut seen = std::collections::HashSet::new();
        for c in &self.columns {
            if !seen.insert(c.name.as_str()) {
                return Err(Error::Syntax(format!("duplicate column '{}'", c.name)));
            }
        }
        for pk in &self.primary_key {
            let col = self
                .columns
                .iter()
                .find(|c| &c.name == pk)
                .ok_or_else(|| Error::UnknownColumn(pk.clone()))?;
            if col.nullable {
                return Err(Error::Syntax(format!(
                    "primary key column '{}' must be NOT NULL",
                    pk
                )));
            }
        }
        for idx in &self.indexes {
            for c in &idx.columns {
                if !self.columns.iter().any(|col| &col.name == c) {
                    return Err(Error::UnknownColumn(c.clone()));
                }
            }
        }
        for c in &self.fulltext {
            if !self.columns.iter().any(|col| &col.name == c) {
                return Err(Error::UnknownColumn(c.clone()));
            }
        }
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        let unqualified = name.rsplit('.').next().unwrap_or(name);
        self.columns.iter().find(|c| c.name == unqualified)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Index whose leading columns cover the given column, if any.
    pub fn index_covering(&self, column: &str) -> Option<&IndexDescriptor> {
        self.indexes
            .iter()
            .find(|idx| idx.columns.first().map(String::as_str) == Some(column))
    }
}

/// Read-mostly catalog of databases and table descriptors. DDL takes the
/// write lock; planning takes read locks.
pub struct Catalog {
    databases: RwLock<HashMap<String, HashMap<String, Arc<TableDescriptor>>>>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        let mut databases = HashMap::new();
        databases.insert(DEFAULT_DATABASE.to_string(), HashMap::new());
        Self {
            databases: RwLock::new(databases),
        }
    }

    pub fn create_database(&self, name: &str) -> Result<()> {
        let mut dbs = self.databases.write().unwrap();
        dbs.entry(name.to_string()).or_default();
        Ok(())
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.databases.read().unwrap().contains_key(name)
    }

    pub fn databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn register_table(&self, database: &str, desc: TableDescriptor) -> Result<()> {
        desc.validate()?;
        let mut dbs = self.databases.write().unwrap();
        let tables = dbs
            .get_mut(database)
            .ok_or_else(|| Error::UnknownDatabase(database.to_string()))?;
        if tables.contains_key(&desc.name) {
            return Err(Error::Syntax(format!("table '{}' already exists", desc.name)));
        }
        tables.insert(desc.name.clone(), Arc::new(desc));
        Ok(())
    }

    pub fn drop_table(&self, database: &str, table: &str) -> Result<()> {
        let mut dbs = self.databases.write().unwrap();
        let tables = dbs
            .get_mut(database)
            .ok_or_else(|| Error::UnknownDatabase(database.to_string()))?;
        tables
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| Error::TableNotFound(table.to_string()))
    }

    pub fn table(&self, database: &str, table: &str) -> Result<Arc<TableDescriptor>> {
        let dbs = self.databases.read().unwrap();
        let tables = dbs
            .get(database)
            .ok_or_else(|| Error::UnknownDatabase(database.to_string()))?;
        tables
            .get(table)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(table.to_string()))
    }

    pub fn tables(&self, database: &str) -> Result<Vec<String>> {
        let dbs = self.databases.read().unwrap();
        let tables = dbs
            .get(database)
            .ok_or_else(|| Error::UnknownDatabase(database.to_string()))?;
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Replace a descriptor in place (index DDL, persistence migration).
    pub fn update_table(&self, database: &str, desc: TableDescriptor) -> Result<()> {
        desc.validate()?;
        let mut dbs = self.databases.write().unwrap();
        let tables = dbs
            .get_mut(database)
            .ok_or_else(|| Error::UnknownDatabase(database.to_string()))?;
        if !tables.contains_key(&desc.name) {
            return Err(Error::TableNotFound(desc.name.clone()));
        }
        tables.insert(desc.name.clone(), Arc::new(desc));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_table() -> TableDescriptor {
        TableDescriptor {
            name: "users".to_string(),
            columns: vec![
                ColumnDescriptor {
                    name: "id".to_string(),
                    data_type: SemanticType::Int,
                    nullable: false,
                    primary_key: true,
                    auto_increment: false,
                    default: None,
                },
                ColumnDescriptor::new("name", SemanticType::String),
            ],
            primary_key: vec!["id".to_string()],
            indexes: vec![],
            persistence: PersistencePolicy::MemoryOnly,
            engine: TableEngine::Hybrid,
            fulltext: vec![],
        }
    }

    #[test]
    fn test_pk_must_be_not_null() {
        let mut desc = users_table();
        desc.columns[0].nullable = true;
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_pk_must_exist() {
        let mut desc = users_table();
        desc.primary_key = vec!["missing".to_string()];
        assert!(matches!(desc.validate(), Err(Error::UnknownColumn(_))));
    }

    #[test]
    fn test_catalog_register_and_lookup() {
        let catalog = Catalog::new();
        catalog.register_table(DEFAULT_DATABASE, users_table()).unwrap();
        let desc = catalog.table(DEFAULT_DATABASE, "users").unwrap();
        assert_eq!(desc.columns.len(), 2);
        assert!(matches!(
            catalog.register_table(DEFAULT_DATABASE, users_table()),
            Err(Error::Syntax(_))
        ));
        assert!(matches!(
            catalog.table("nope", "users"),
            Err(Error::UnknownDatabase(_))
        ));
        catalog.drop_table(DEFAULT_DATABASE, "users").unwrap();
        assert!(matches!(
            catalog.table(DEFAULT_DATABASE, "users"),
            Err(Error::TableNotFound(_))
        ));
    }

    #[test]
    fn test_index_covering_prefers_leading_column() {
        let mut desc = users_table();
        desc.indexes.push(IndexDescriptor {
            name: "idx_name".to_string(),
            columns: vec!["name".to_string()],
            unique: false,
            kind: IndexKind::Hash,
        });
        assert!(desc.index_covering("name").is_some());
        assert!(desc.index_covering("id").is_none());
    }
}
