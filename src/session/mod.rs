//! Per-connection session state
//!
//! A session lives exactly as long as its connection. Known state lives in
//! typed fields; only user-set SQL variables go through the variable map.

pub mod manager;

use std::collections::HashMap;
use std::time::Instant;

use crate::protocol::constants::StatusFlags;
use crate::sql::ast::Statement;
use crate::storage::engine::TxnContext;
use crate::storage::schema::{ColumnDescriptor, DEFAULT_DATABASE};
use crate::storage::value::Value;

pub use manager::SessionManager;

/// A prepared statement compiled once at COM_STMT_PREPARE.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub id: u32,
    pub sql: String,
    pub statement: Statement,
    pub num_params: u16,
    /// Result columns, when the statement is a SELECT with a known shape.
    pub columns: Vec<ColumnDescriptor>,
}

/// Per-connection state.
#[derive(Debug)]
pub struct Session {
    /// Connection/thread id reported in the handshake.
    pub thread_id: u32,
    pub username: String,
    pub database: String,
    /// User-set SQL variables.
    pub variables: HashMap<String, Value>,
    /// Next outbound sequence id; wraps at 256.
    pub seq: u8,
    pub prepared: HashMap<u32, PreparedStatement>,
    next_stmt_id: u32,
    pub autocommit: bool,
    /// Explicit transaction in progress, if any.
    pub txn: Option<TxnContext>,
    /// Per-statement scan parallelism, bounded by the worker-pool ceiling.
    pub parallelism: usize,
    pub created_at: Instant,
    pub last_active: Instant,
}

impl Session {
    pub fn new(thread_id: u32) -> Self {
        let now = Instant::now();
        Self {
            thread_id,
            username: String::new(),
            database: DEFAULT_DATABASE.to_string(),
            variables: HashMap::new(),
            seq: 0,
            prepared: HashMap::new(),
            next_stmt_id: 1,
            autocommit: true,
            txn: None,
            parallelism: 1,
            created_at: now,
            last_active: now,
        }
    }

    /// Start a new command: the server's first response continues from the
    /// client's sequence id.
    pub fn begin_command(&mut self, client_seq: u8) {
        self.seq = client_seq.wrapping_add(1);
        self.last_active = Instant::now();
    }

    /// Take the next outbound sequence id.
    pub fn next_seq(&mut self) -> u8 {
        let id = self.seq;
        self.seq = self.seq.wrapping_add(1);
        id
    }

    /// Status flags reported in OK/EOF packets.
    pub fn status_flags(&self) -> StatusFlags {
        let mut flags = StatusFlags::empty();
        if self.autocommit {
            flags |= StatusFlags::AUTOCOMMIT;
        }
        if self.txn.is_some() {
            flags |= StatusFlags::IN_TRANSACTION;
        }
        flags
    }

    pub fn set_variable(&mut self, name: &str, value: Value) {
        match name {
            "autocommit" => self.autocommit = value.is_true(),
            "parallelism" => {
                if let Value::Int(n) = value {
                    self.parallelism = n.max(1) as usize;
                }
            }
            _ => {}
        }
        self.variables.insert(name.to_string(), value);
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn add_prepared(&mut self, sql: String, statement: Statement, num_params: u16, columns: Vec<ColumnDescriptor>) -> u32 {
        let id = self.next_stmt_id;
        self.next_stmt_id += 1;
        self.prepared.insert(
            id,
            PreparedStatement {
                id,
                sql,
                statement,
                num_params,
                columns,
            },
        );
        id
    }

    pub fn close_prepared(&mut self, id: u32) {
        self.prepared.remove(&id);
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_active.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_id_wraps() {
        let mut session = Session::new(1);
        session.seq = 255;
        assert_eq!(session.next_seq(), 255);
        assert_eq!(session.next_seq(), 0);
        assert_eq!(session.next_seq(), 1);
    }

    #[test]
    fn test_begin_command_continues_client_seq() {
        let mut session = Session::new(1);
        session.begin_command(0);
        assert_eq!(session.next_seq(), 1);
        session.begin_command(255);
        assert_eq!(session.next_seq(), 0);
    }

    #[test]
    fn test_status_flags_track_txn() {
        let mut session = Session::new(1);
        assert!(session.status_flags().contains(StatusFlags::AUTOCOMMIT));
        session.txn = Some(TxnContext {
            xid: 42,
            snapshot: 41,
            isolation: crate::storage::engine::Isolation::Snapshot,
        });
        assert!(session.status_flags().contains(StatusFlags::IN_TRANSACTION));
        session.set_variable("autocommit", Value::Int(0));
        assert!(!session.status_flags().contains(StatusFlags::AUTOCOMMIT));
    }

    #[test]
    fn test_prepared_statement_table() {
        let mut session = Session::new(1);
        let id = session.add_prepared(
            "SELECT 1".into(),
            Statement::Ping,
            0,
            vec![],
        );
        assert!(session.prepared.contains_key(&id));
        session.close_prepared(id);
        assert!(session.prepared.is_empty());
    }
}
