//! BM25 scoring

use crate::fts::index::{fnv1a, InvertedIndex};

/// Okapi BM25 parameters. `k1` saturates term frequency, `b` controls
/// length normalization.
#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

impl Bm25Params {
    pub fn clamped(k1: f64, b: f64) -> Self {
        Self {
            k1: k1.clamp(1.2, 2.0),
            b: b.clamp(0.0, 1.0),
        }
    }
}

/// `log((N - df + 0.5) / (df + 0.5))`
pub fn idf(doc_count: u64, doc_freq: u64) -> f64 {
    let n = doc_count as f64;
    let df = doc_freq as f64;
    ((n - df + 0.5) / (df + 0.5)).ln()
}

/// Score every document containing at least one query term, best first.
pub fn bm25_search(
    index: &InvertedIndex,
    query_tokens: &[String],
    params: Bm25Params,
) -> Vec<(u64, f64)> {
    let n = index.doc_count();
    let avg_dl = index.avg_doc_len().max(f64::MIN_POSITIVE);
    let mut scores: std::collections::HashMap<u64, f64> = std::collections::HashMap::new();

    for token in query_tokens {
        let term_id = fnv1a(token);
        let Some(postings) = index.postings(term_id) else {
            continue;
        };
        let term_idf = idf(n, postings.len() as u64);
        for posting in postings {
            let tf = f64::from(posting.term_freq);
            let dl = f64::from(index.doc_len(posting.doc_id));
            let denom = tf + params.k1 * (1.0 - params.b + params.b * dl / avg_dl);
            let score = term_idf * (tf * (params.k1 + 1.0)) / denom;
            *scores.entry(posting.doc_id).or_insert(0.0) += score;
        }
    }

    let mut ranked: Vec<(u64, f64)> = scores.into_iter().collect();
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

    fn sample_index() -> InvertedIndex {
        let mut index = InvertedIndex::new();
        let docs = [
            (1u64, "the quick brown fox"),
            (2, "a lazy dog"),
            (3, "quick dog"),
        ];
        for (id, text) in docs {
            index.add_document(id, &StandardTokenizer.tokenize(text));
        }
        index
    }

    #[test]
    fn test_quick_fox_ranks_doc1_first() {
        let index = sample_index();
        let query = StandardTokenizer.tokenize("quick fox");
        let ranked = bm25_search(&index, &query, Bm25Params::default());
        assert_eq!(ranked[0].0, 1, "ranked: {ranked:?}");
        assert!(ranked[0].1 > ranked[1].1);
        // Doc 2 contains neither query term.
        assert!(!ranked.iter().any(|(d, _)| *d == 2));
    }

    #[test]
    fn test_idf_decreases_with_df() {
        assert!(idf(100, 1) > idf(100, 50));
    }

    #[test]
    fn test_params_clamped() {
        let p = Bm25Params::clamped(0.5, 2.0);
        assert_eq!(p.k1, 1.2);
        assert_eq!(p.b, 1.0);
    }

    #[test]
    fn test_empty_query_empty_result() {
        let index = sample_index();
        let ranked = bm25_search(&index, &[], Bm25Params::default());
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_length_normalization_prefers_shorter_doc() {
        let mut index = InvertedIndex::new();
        index.add_document(
            1,
            &StandardTokenizer.tokenize("quick and many many other words here now"),
        );
        index.add_document(2, &StandardTokenizer.tokenize("quick note"));
        let ranked = bm25_search(
            &index,
            &StandardTokenizer.tokenize("quick"),
            Bm25Params::default(),
        );
        assert_eq!(ranked[0].0, 2, "shorter doc wins: {ranked:?}");
    }
}
