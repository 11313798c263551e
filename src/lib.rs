//! SqlExc - MySQL-wire-compatible SQL execution gateway
//!
//! Clients speak the MySQL client/server protocol to the gateway, which
//! parses SQL, plans it over pluggable data sources (an in-memory MVCC
//! engine, an embedded persistent KV backend, remote HTTP tables), executes
//! the plan through a pull-based operator tree, and streams result sets
//! back in wire format.
//!
//! # Architecture
//!
//! A connection task per client drives the handshake and command loop.
//! COM_QUERY flows through the parse adapter, the logical planner and its
//! rewrite passes, the cost-based optimizer (DP join ordering, adaptive
//! cost constants, genetic index selection), and the executor, whose scans
//! dispatch through the hybrid storage router. Full-text MATCH predicates
//! route through the BM25/hybrid search engine.

pub mod auth;
pub mod cache;
pub mod config;
pub mod datasource;
pub mod dispatch;
pub mod error;
pub mod exec;
pub mod fts;
pub mod metrics;
pub mod optimizer;
pub mod plan;
pub mod plugin;
pub mod protocol;
pub mod rowset;
pub mod server;
pub mod session;
pub mod sql;
pub mod storage;

pub use config::GatewayConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::GatewayConfig;
    pub use crate::error::{Error, Result};
    pub use crate::server::{GatewayContext, SqlServer};
    pub use crate::storage::value::{Row, Value};
    pub use crate::storage::{Catalog, Router, TableConfigManager, TableDescriptor};
}
