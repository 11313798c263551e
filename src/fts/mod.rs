//! Full-text search engine
//!
//! Inverted index with BM25 scoring plus a vector store for hybrid
//! retrieval. Table indexes are registered per FULLTEXT declaration and
//! rebuilt on startup; there is no separate persistence layer.

pub mod hybrid;
pub mod index;
pub mod score;
pub mod tokenize;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::storage::value::{Row, Value};

use hybrid::{fuse, Fusion, VectorStore};
use index::InvertedIndex;
use score::{bm25_search, Bm25Params};
use tokenize::Tokenizer;

/// Per-table full-text index: lexical + vector sides fed from the same
/// tokenizer, documents keyed by integer primary key.
pub struct TableFtsIndex {
    pub columns: Vec<String>,
    tokenizer: Box<dyn Tokenizer>,
    inverted: InvertedIndex,
    vectors: VectorStore,
    params: Bm25Params,
}

impl TableFtsIndex {
    pub fn new(columns: Vec<String>, tokenizer: Box<dyn Tokenizer>) -> Self {
        Self {
            columns,
            tokenizer,
            inverted: InvertedIndex::new(),
            vectors: VectorStore::new(),
            params: Bm25Params::default(),
        }
    }

    fn document_text(&self, row: &Row) -> String {
        self.columns
            .iter()
            .filter_map(|c| row.get(c))
            .filter(|v| !v.is_null())
            .map(Value::to_text)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn index_row(&mut self, doc_id: u64, row: &Row) {
        let text = self.document_text(row);
        let tokens = self.tokenizer.tokenize(&text);
        self.inverted.add_document(doc_id, &tokens);
        self.vectors.add_document(doc_id, &tokens);
    }

    pub fn index_text(&mut self, doc_id: u64, text: &str) {
        let tokens = self.tokenizer.tokenize(text);
        self.inverted.add_document(doc_id, &tokens);
        self.vectors.add_document(doc_id, &tokens);
    }

    pub fn remove_row(&mut self, doc_id: u64) {
        self.inverted.remove_document(doc_id);
        self.vectors.remove_document(doc_id);
    }

    /// Lexical-only BM25 ranking.
    pub fn search_lexical(&self, query: &str) -> Vec<(u64, f64)> {
        let tokens = self.tokenizer.tokenize(query);
        bm25_search(&self.inverted, &tokens, self.params)
    }

    /// Hybrid ranking with the given fusion strategy.
    pub fn search_hybrid(&self, query: &str, fusion: Fusion) -> Vec<(u64, f64)> {
        let tokens = self.tokenizer.tokenize(query);
        let lexical = bm25_search(&self.inverted, &tokens, self.params);
        let vector = self.vectors.search(&tokens);
        fuse(&lexical, &vector, fusion)
    }

    pub fn cosine(&self, doc_id: u64, query: &str) -> f64 {
        let tokens = self.tokenizer.tokenize(query);
        self.vectors.cosine(doc_id, &tokens)
    }

    pub fn doc_count(&self) -> u64 {
        self.inverted.doc_count()
    }
}

/// Registry of per-table full-text indexes.
#[derive(Default)]
pub struct FtsRegistry {
    tables: RwLock<HashMap<String, Arc<RwLock<TableFtsIndex>>>>,
}

impl FtsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, table: &str, columns: Vec<String>, tokenizer_name: &str) {
        let index = TableFtsIndex::new(columns, tokenize::by_name(tokenizer_name));
        self.tables
            .write()
            .unwrap()
            .insert(table.to_string(), Arc::new(RwLock::new(index)));
    }

    pub fn drop_table(&self, table: &str) {
        self.tables.write().unwrap().remove(table);
    }

    pub fn get(&self, table: &str) -> Option<Arc<RwLock<TableFtsIndex>>> {
        self.tables.read().unwrap().get(table).cloned()
    }

    pub fn has(&self, table: &str) -> bool {
        self.tables.read().unwrap().contains_key(table)
    }

    /// Index one row under its integer primary key.
    pub fn index_row(&self, table: &str, row: &Row, pk_column: &str) -> Result<()> {
        let Some(index) = self.get(table) else {
            return Ok(());
        };
        let doc_id = doc_id_from_row(row, pk_column)?;
        index.write().unwrap().index_row(doc_id, row);
        Ok(())
    }

    pub fn remove_row(&self, table: &str, row: &Row, pk_column: &str) -> Result<()> {
        let Some(index) = self.get(table) else {
            return Ok(());
        };
        let doc_id = doc_id_from_row(row, pk_column)?;
        index.write().unwrap().remove_row(doc_id);
        Ok(())
    }

    /// Hybrid search with the default fusion, used by MATCH ... AGAINST.
    pub fn search(&self, table: &str, query: &str) -> Result<Vec<(u64, f64)>> {
        let index = self
            .get(table)
            .ok_or_else(|| Error::Unsupported(format!("table '{table}' has no FULLTEXT index")))?;
        let index = index.read().unwrap();
        Ok(index.search_hybrid(query, Fusion::default()))
    }
}

/// FULLTEXT documents are keyed by a single integer primary key.
pub fn doc_id_from_row(row: &Row, pk_column: &str) -> Result<u64> {
    match row.get(pk_column) {
        Some(Value::Int(i)) if *i >= 0 => Ok(*i as u64),
        Some(Value::Uint(u)) => Ok(*u),
        other => Err(Error::Unsupported(format!(
            "FULLTEXT tables need a non-negative integer primary key, got {other:?}"
        ))),
    }
}
