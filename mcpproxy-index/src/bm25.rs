//! BM25 ranking over the aggregated tool catalog
//!
//! Documents are built from each tool's description, owning server name
//! and input schema rendered as text. The index is immutable once built;
//! the registry swaps whole snapshots on rebuild.

use std::collections::HashMap;

use serde::Serialize;

/// Term-frequency saturation parameter
pub const BM25_K1: f64 = 1.2;

/// Length-normalization parameter
pub const BM25_B: f64 = 0.75;

/// One search hit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredTool {
    /// Qualified name, `"<server>.<tool>"`
    pub qualified_name: String,
    pub score: f64,
}

struct Document {
    qualified_name: String,
    term_counts: HashMap<String, u32>,
    length: usize,
}

/// Immutable BM25 index
pub struct Bm25Index {
    documents: Vec<Document>,

    /// Term to number of documents containing it
    document_frequency: HashMap<String, u32>,

    average_length: f64,
}

impl Bm25Index {
    /// Build an index from `(qualified name, searchable text)` pairs
    pub fn build<'a>(corpus: impl IntoIterator<Item = (&'a str, String)>) -> Self {
        let mut documents = Vec::new();
        let mut document_frequency: HashMap<String, u32> = HashMap::new();
        let mut total_length = 0usize;

        for (qualified_name, text) in corpus {
            let terms = tokenize(&text);
            let mut term_counts: HashMap<String, u32> = HashMap::new();
            for term in &terms {
                *term_counts.entry(term.clone()).or_default() += 1;
            }
            for term in term_counts.keys() {
                *document_frequency.entry(term.clone()).or_default() += 1;
            }
            total_length += terms.len();
            documents.push(Document {
                qualified_name: qualified_name.to_string(),
                term_counts,
                length: terms.len(),
            });
        }

        let average_length = if documents.is_empty() {
            0.0
        } else {
            total_length as f64 / documents.len() as f64
        };

        Self {
            documents,
            document_frequency,
            average_length,
        }
    }

    /// Number of indexed documents
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Rank documents against `query`, best first, at most `limit` hits
    pub fn search(&self, query: &str, limit: usize) -> Vec<ScoredTool> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || self.documents.is_empty() {
            return Vec::new();
        }

        let n = self.documents.len() as f64;
        let mut hits: Vec<ScoredTool> = self
            .documents
            .iter()
            .filter_map(|doc| {
                let mut score = 0.0;
                for term in &query_terms {
                    let tf = *doc.term_counts.get(term).unwrap_or(&0) as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    let df = *self.document_frequency.get(term).unwrap_or(&0) as f64;
                    let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                    let norm = 1.0 - BM25_B + BM25_B * (doc.length as f64 / self.average_length);
                    score += idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * norm);
                }
                (score > 0.0).then(|| ScoredTool {
                    qualified_name: doc.qualified_name.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        hits
    }
}

/// Lowercased alphanumeric tokens; everything else separates
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> Bm25Index {
        Bm25Index::build([
            (
                "gh.search_issues",
                "search issues github repository query filter".to_string(),
            ),
            (
                "gh.create_pr",
                "create pull request github branch merge".to_string(),
            ),
            (
                "fs.read_file",
                "read file contents path filesystem".to_string(),
            ),
        ])
    }

    #[test]
    fn test_relevant_document_ranks_first() {
        let index = sample_index();
        let hits = index.search("search github issues", 10);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].qualified_name, "gh.search_issues");
    }

    #[test]
    fn test_limit_respected() {
        let index = sample_index();
        let hits = index.search("github", 1);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_no_match_is_empty() {
        let index = sample_index();
        assert!(index.search("kubernetes", 10).is_empty());
        assert!(index.search("", 10).is_empty());
    }

    #[test]
    fn test_empty_index() {
        let index = Bm25Index::build(std::iter::empty::<(&str, String)>());
        assert!(index.is_empty());
        assert!(index.search("anything", 10).is_empty());
    }

    #[test]
    fn test_scores_decrease_monotonically() {
        let index = sample_index();
        let hits = index.search("github file", 10);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }
}
