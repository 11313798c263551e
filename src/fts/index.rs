//! Inverted index
//!
//! Term ids come from FNV-1a over the term's UTF-8 bytes; the same hash
//! feeds the vector store so lexical and vector scores share one key space.
//! Posting lists keep document ids strictly increasing.

use std::collections::HashMap;

/// FNV-1a, 64-bit. The single canonical term-id hash for the engine.
pub fn fnv1a(term: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in term.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// One posting: a document containing the term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub doc_id: u64,
    pub term_freq: u32,
    pub positions: Option<Vec<u32>>,
}

/// Inverted index with document-length tracking for BM25.
#[derive(Debug, Default)]
pub struct InvertedIndex {
    postings: HashMap<u64, Vec<Posting>>,
    doc_len: HashMap<u64, u32>,
    total_len: u64,
    /// term id -> document frequency (len of posting list, cached)
    pub keep_positions: bool,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn doc_count(&self) -> u64 {
        self.doc_len.len() as u64
    }

    pub fn avg_doc_len(&self) -> f64 {
        if self.doc_len.is_empty() {
            0.0
        } else {
            self.total_len as f64 / self.doc_len.len() as f64
        }
    }

    pub fn doc_len(&self, doc_id: u64) -> u32 {
        self.doc_len.get(&doc_id).copied().unwrap_or(0)
    }

    pub fn doc_freq(&self, term_id: u64) -> u64 {
        self.postings.get(&term_id).map(|p| p.len() as u64).unwrap_or(0)
    }

    pub fn postings(&self, term_id: u64) -> Option<&[Posting]> {
        self.postings.get(&term_id).map(Vec::as_slice)
    }

    pub fn contains_doc(&self, doc_id: u64) -> bool {
        self.doc_len.contains_key(&doc_id)
    }

    /// Index a tokenized document. Re-adding an id replaces the previous
    /// version.
    pub fn add_document(&mut self, doc_id: u64, tokens: &[String]) {
        if self.contains_doc(doc_id) {
            self.remove_document(doc_id);
        }
        let mut freqs: HashMap<u64, (u32, Vec<u32>)> = HashMap::new();
        for (pos, token) in tokens.iter().enumerate() {
            let entry = freqs.entry(fnv1a(token)).or_insert((0, Vec::new()));
            entry.0 += 1;
            if self.keep_positions {
                entry.1.push(pos as u32);
            }
        }
        for (term_id, (term_freq, positions)) in freqs {
            let posting = Posting {
                doc_id,
                term_freq,
                positions: self.keep_positions.then_some(positions),
            };
            let list = self.postings.entry(term_id).or_default();
            // Doc ids stay strictly increasing within every posting list.
            let idx = list.partition_point(|p| p.doc_id < doc_id);
            debug_assert!(idx == list.len() || list[idx].doc_id != doc_id);
            list.insert(idx, posting);
        }
        self.doc_len.insert(doc_id, tokens.len() as u32);
        self.total_len += tokens.len() as u64;
    }

    pub fn remove_document(&mut self, doc_id: u64) {
        if let Some(len) = self.doc_len.remove(&doc_id) {
            self.total_len -= u64::from(len);
        }
        self.postings.retain(|_, list| {
            list.retain(|p| p.doc_id != doc_id);
            !list.is_empty()
        });
    }

    /// Term frequency of `term_id` in `doc_id`.
    pub fn term_freq(&self, term_id: u64, doc_id: u64) -> u32 {
        self.postings
            .get(&term_id)
            .and_then(|list| {
                let idx = list.partition_point(|p| p.doc_id < doc_id);
                list.get(idx).filter(|p| p.doc_id == doc_id)
            })
            .map(|p| p.term_freq)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(text: &str) -> Vec<String> {
        crate::fts::tokenize::StandardTokenizer.tokenize(text)
    }

    use crate::fts::tokenize::Tokenizer;

    #[test]
    fn test_fnv1a_known_values() {
        // FNV-1a 64 reference values.
        assert_eq!(fnv1a(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a("a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_posting_doc_ids_strictly_increasing() {
        let mut index = InvertedIndex::new();
        // Insert out of order on purpose.
        index.add_document(3, &tokens("quick dog"));
        index.add_document(1, &tokens("the quick brown fox"));
        index.add_document(2, &tokens("a lazy dog"));
        let list = index.postings(fnv1a("quick")).unwrap();
        let ids: Vec<u64> = list.iter().map(|p| p.doc_id).collect();
        assert_eq!(ids, vec![1, 3]);
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_doc_len_and_avg() {
        let mut index = InvertedIndex::new();
        index.add_document(1, &tokens("one two three four"));
        index.add_document(2, &tokens("one two"));
        assert_eq!(index.doc_len(1), 4);
        assert_eq!(index.doc_len(2), 2);
        assert!((index.avg_doc_len() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_remove_document() {
        let mut index = InvertedIndex::new();
        index.add_document(1, &tokens("quick fox"));
        index.add_document(2, &tokens("quick dog"));
        index.remove_document(1);
        assert!(!index.contains_doc(1));
        assert_eq!(index.doc_freq(fnv1a("quick")), 1);
        assert_eq!(index.doc_freq(fnv1a("fox")), 0);
    }

    #[test]
    fn test_readd_replaces() {
        let mut index = InvertedIndex::new();
        index.add_document(1, &tokens("old words here"));
        index.add_document(1, &tokens("new"));
        assert_eq!(index.doc_len(1), 1);
        assert_eq!(index.doc_freq(fnv1a("old")), 0);
        assert_eq!(index.doc_freq(fnv1a("new")), 1);
        assert_eq!(index.doc_count(), 1);
    }

    #[test]
    fn test_term_freq() {
        let mut index = InvertedIndex::new();
        index.add_document(7, &tokens("spam spam spam eggs"));
        assert_eq!(index.term_freq(fnv1a("spam"), 7), 3);
        assert_eq!(index.term_freq(fnv1a("eggs"), 7), 1);
        assert_eq!(index.term_freq(fnv1a("ham"), 7), 0);
    }
}
