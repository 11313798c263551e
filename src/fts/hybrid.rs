//! Hybrid retrieval: vector similarity and rank fusion
//!
//! The vector store keys term weights by the same FNV-1a ids as the
//! inverted index. Cosine similarity normalizes by the L2 norm over all
//! document terms, not just the terms shared with the query.

use std::collections::HashMap;

use crate::fts::index::fnv1a;

/// Sparse TF vectors per document, sharing the inverted index's term ids.
#[derive(Debug, Default)]
pub struct VectorStore {
    docs: HashMap<u64, HashMap<u64, f64>>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_document(&mut self, doc_id: u64, tokens: &[String]) {
        let mut vector: HashMap<u64, f64> = HashMap::new();
        for token in tokens {
            *vector.entry(fnv1a(token)).or_insert(0.0) += 1.0;
        }
        self.docs.insert(doc_id, vector);
    }

    pub fn remove_document(&mut self, doc_id: u64) {
        self.docs.remove(&doc_id);
    }

    /// Cosine similarity between the query and one document. The document
    /// norm runs over every document term; an out-of-vocabulary query
    /// scores exactly zero.
    pub fn cosine(&self, doc_id: u64, query_tokens: &[String]) -> f64 {
        let Some(doc) = self.docs.get(&doc_id) else {
            return 0.0;
        };
        let mut query: HashMap<u64, f64> = HashMap::new();
        for token in query_tokens {
            *query.entry(fnv1a(token)).or_insert(0.0) += 1.0;
        }

        let dot: f64 = query
            .iter()
            .filter_map(|(term, qw)| doc.get(term).map(|dw| qw * dw))
            .sum();
        if dot == 0.0 {
            return 0.0;
        }
        let doc_norm: f64 = doc.values().map(|w| w * w).sum::<f64>().sqrt();
        let query_norm: f64 = query.values().map(|w| w * w).sum::<f64>().sqrt();
        dot / (doc_norm * query_norm)
    }

    /// Rank all documents by cosine similarity, best first.
    pub fn search(&self, query_tokens: &[String]) -> Vec<(u64, f64)> {
        let mut ranked: Vec<(u64, f64)> = self
            .docs
            .keys()
            .map(|&doc_id| (doc_id, self.cosine(doc_id, query_tokens)))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        ranked
    }
}

/// Fusion strategy for combining lexical and vector rankings.
#[derive(Debug, Clone, Copy)]
pub enum Fusion {
    /// `1 / (k + rank)` per list, summed.
    ReciprocalRank { k: f64 },
    /// Weighted sum of min-max-normalized scores.
    WeightedSum { lexical: f64, vector: f64 },
}

impl Default for Fusion {
    fn default() -> Self {
        Fusion::WeightedSum {
            lexical: 0.7,
            vector: 0.3,
        }
    }
}

pub const RRF_DEFAULT_K: f64 = 60.0;

fn min_max_normalize(ranked: &[(u64, f64)]) -> HashMap<u64, f64> {
    if ranked.is_empty() {
        return HashMap::new();
    }
    let max = ranked.iter().map(|(_, s)| *s).fold(f64::NEG_INFINITY, f64::max);
    let min = ranked.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let span = (max - min).max(f64::MIN_POSITIVE);
    ranked
        .iter()
        .map(|(d, s)| (*d, if max == min { 1.0 } else { (s - min) / span }))
        .collect()
}

/// Fuse two rankings into one, best first.
pub fn fuse(
    lexical: &[(u64, f64)],
    vector: &[(u64, f64)],
    strategy: Fusion,
) -> Vec<(u64, f64)> {
    let mut combined: HashMap<u64, f64> = HashMap::new();
    match strategy {
        Fusion::ReciprocalRank { k } => {
            for list in [lexical, vector] {
                for (rank, (doc, _)) in list.iter().enumerate() {
                    *combined.entry(*doc).or_insert(0.0) += 1.0 / (k + rank as f64 + 1.0);
                }
            }
        }
        Fusion::WeightedSum {
            lexical: wl,
            vector: wv,
        } => {
            for (doc, s) in min_max_normalize(lexical) {
                *combined.entry(doc).or_insert(0.0) += wl * s;
            }
            for (doc, s) in min_max_normalize(vector) {
                *combined.entry(doc).or_insert(0.0) += wv * s;
            }
        }
    }
    let mut ranked: Vec<(u64, f64)> = combined.into_iter().collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fts::tokenize::{StandardTokenizer, Tokenizer};

    fn store() -> VectorStore {
        let mut store = VectorStore::new();
        let docs = [
            (1u64, "the quick brown fox"),
            (2, "a lazy dog"),
            (3, "quick dog"),
        ];
        for (id, text) in docs {
            store.add_document(id, &StandardTokenizer.tokenize(text));
        }
        store
    }

    #[test]
    fn test_out_of_vocabulary_cosine_is_zero() {
        let store = store();
        let query = StandardTokenizer.tokenize("alpha");
        assert_eq!(store.cosine(1, &query), 0.0);
        assert!(store.search(&query).is_empty());
    }

    #[test]
    fn test_cosine_uses_full_doc_norm() {
        let mut store = VectorStore::new();
        // Both docs contain "quick" once; doc 2 has many other terms, so its
        // full-document norm is larger and its similarity lower.
        store.add_document(1, &StandardTokenizer.tokenize("quick"));
        store.add_document(
            2,
            &StandardTokenizer.tokenize("quick plus several unrelated extra terms"),
        );
        let query = StandardTokenizer.tokenize("quick");
        let s1 = store.cosine(1, &query);
        let s2 = store.cosine(2, &query);
        assert!((s1 - 1.0).abs() < 1e-9);
        assert!(s2 < s1, "full-norm similarity must penalize doc 2");
    }

    #[test]
    fn test_rrf_fusion_prefers_doc_in_both_lists() {
        let lexical = vec![(1u64, 5.0), (3, 2.0)];
        let vector = vec![(1u64, 0.9), (2, 0.4)];
        let fused = fuse(&lexical, &vector, Fusion::ReciprocalRank { k: RRF_DEFAULT_K });
        assert_eq!(fused[0].0, 1);
    }

    #[test]
    fn test_weighted_fusion_ranks_doc1_first() {
        let store = store();
        let query = StandardTokenizer.tokenize("quick fox");
        let mut index = crate::fts::index::InvertedIndex::new();
        for (id, text) in [
            (1u64, "the quick brown fox"),
            (2, "a lazy dog"),
            (3, "quick dog"),
        ] {
            index.add_document(id, &StandardTokenizer.tokenize(text));
        }
        let lexical = crate::fts::score::bm25_search(
            &index,
            &query,
            crate::fts::score::Bm25Params::default(),
        );
        let vector = store.search(&query);
        // Equal weights still rank document 1 first.
        let fused = fuse(
            &lexical,
            &vector,
            Fusion::WeightedSum {
                lexical: 0.5,
                vector: 0.5,
            },
        );
        assert_eq!(fused[0].0, 1, "fused: {fused:?}");
    }

    #[test]
    fn test_min_max_normalization_bounds() {
        let ranked = vec![(1u64, 10.0), (2, 5.0), (3, 0.0)];
        let normalized = min_max_normalize(&ranked);
        assert_eq!(normalized[&1], 1.0);
        assert_eq!(normalized[&3], 0.0);
        assert!(normalized[&2] > 0.0 && normalized[&2] < 1.0);
    }
}
