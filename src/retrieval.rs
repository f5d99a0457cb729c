//! Hybrid retrieval over the knowledge base: semantic similarity from an
//! external index blended with lexical BM25 scoring, both min-max normalized
//! before weighting.
//!
//! The semantic index is a collaborator behind `VectorIndex` (the production
//! deployment points it at a vector database); `MemoryIndex` is the
//! process-local implementation used by tests and offline runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ChatError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub content: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Value,
}

/// External semantic-search collaborator: `search(query)` returns ranked
/// results with raw similarity scores.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>, ChatError>;
}

pub struct HybridRetriever {
    index: Arc<dyn VectorIndex>,
    top_k: usize,
    semantic_weight: f32,
    keyword_weight: f32,
}

impl HybridRetriever {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        top_k: usize,
        semantic_weight: f32,
        keyword_weight: f32,
    ) -> Self {
        Self {
            index,
            top_k,
            semantic_weight,
            keyword_weight,
        }
    }

    /// Semantic candidates re-scored with BM25 over their own text, blended
    /// by the configured weights, sorted descending.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ChatError> {
        let hits = self.index.search(query, self.top_k).await?;
        if hits.is_empty() {
            return Ok(hits);
        }

        let semantic = normalize_scores(&hits.iter().map(|h| h.score).collect::<Vec<_>>());
        let documents: Vec<&str> = hits.iter().map(|h| h.content.as_str()).collect();
        let keyword = normalize_scores(&bm25_scores(query, &documents));

        let mut combined: Vec<SearchHit> = hits
            .into_iter()
            .zip(semantic.iter().zip(keyword.iter()))
            .map(|(mut hit, (s, k))| {
                hit.score = self.semantic_weight * s + self.keyword_weight * k;
                hit
            })
            .collect();
        combined.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(combined)
    }

    /// Serialize results for prompt context; also returns the single best
    /// passage for metadata/audit purposes.
    pub fn format_search_results(results: &[SearchHit]) -> (String, Option<String>) {
        let mut top_result: Option<&SearchHit> = None;
        let formatted: Vec<Value> = results
            .iter()
            .map(|r| {
                if top_result.map(|t| r.score > t.score).unwrap_or(true) {
                    top_result = Some(r);
                }
                json!({
                    "content": r.content,
                    "relevance_score": format!("{:.2}", r.score),
                    "metadata": r.metadata,
                })
            })
            .collect();
        let context = serde_json::to_string_pretty(&formatted).unwrap_or_else(|_| "[]".to_string());
        (context, top_result.map(|t| t.content.clone()))
    }
}

/// Min-max normalization; a constant vector maps to all-ones.
fn normalize_scores(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let min = scores.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if (max - min).abs() < f32::EPSILON {
        return vec![1.0; scores.len()];
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

const BM25_K1: f32 = 1.5;
const BM25_B: f32 = 0.75;

/// Okapi BM25 over the candidate documents (the corpus is the candidate set
/// itself, which is all the lexical signal this stage needs).
fn bm25_scores(query: &str, documents: &[&str]) -> Vec<f32> {
    let docs: Vec<Vec<String>> = documents.iter().map(|d| tokenize(d)).collect();
    let n = docs.len() as f32;
    let avg_len = docs.iter().map(|d| d.len() as f32).sum::<f32>() / n.max(1.0);

    // Document frequency per term.
    let mut df: HashMap<&str, f32> = HashMap::new();
    for doc in &docs {
        let mut seen: Vec<&str> = Vec::new();
        for tok in doc {
            if !seen.contains(&tok.as_str()) {
                seen.push(tok);
                *df.entry(tok).or_insert(0.0) += 1.0;
            }
        }
    }

    let query_tokens = tokenize(query);
    docs.iter()
        .map(|doc| {
            let len = doc.len() as f32;
            query_tokens
                .iter()
                .map(|q| {
                    let tf = doc.iter().filter(|t| *t == q).count() as f32;
                    if tf == 0.0 {
                        return 0.0;
                    }
                    let dfq = df.get(q.as_str()).copied().unwrap_or(0.0);
                    let idf = ((n - dfq + 0.5) / (dfq + 0.5) + 1.0).ln();
                    idf * (tf * (BM25_K1 + 1.0))
                        / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg_len.max(1.0)))
                })
                .sum()
        })
        .collect()
}

fn tokenize(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .collect()
}

/// Term-overlap index for tests and offline runs.
#[derive(Default)]
pub struct MemoryIndex {
    docs: Vec<(String, Value)>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents<I>(docs: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        Self {
            docs: docs.into_iter().collect(),
        }
    }

    pub fn add_document(&mut self, content: impl Into<String>, metadata: Value) {
        self.docs.push((content.into(), metadata));
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>, ChatError> {
        let query_tokens = tokenize(query);
        let mut hits: Vec<SearchHit> = self
            .docs
            .iter()
            .map(|(content, metadata)| {
                let doc_tokens = tokenize(content);
                let overlap = query_tokens
                    .iter()
                    .filter(|q| doc_tokens.contains(q))
                    .count() as f32;
                SearchHit {
                    content: content.clone(),
                    score: overlap / (query_tokens.len().max(1) as f32),
                    metadata: metadata.clone(),
                }
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_retriever(index: MemoryIndex) -> HybridRetriever {
        HybridRetriever::new(Arc::new(index), 5, 0.7, 0.3)
    }

    fn course_index() -> MemoryIndex {
        MemoryIndex::with_documents(vec![
            (
                "Math Explorers is a course for children aged 6 to 8 covering arithmetic."
                    .to_string(),
                json!({ "category": "course" }),
            ),
            (
                "Our refund policy allows cancellation within 14 days of enrollment.".to_string(),
                json!({ "category": "policy" }),
            ),
            (
                "Reading Club meets twice a week and builds comprehension skills.".to_string(),
                json!({ "category": "course" }),
            ),
        ])
    }

    #[tokio::test]
    async fn relevant_document_ranks_first() {
        let r = mk_retriever(course_index());
        let hits = r.search("math course for children aged 7").await.unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0].content.contains("Math Explorers"));
        // Descending order.
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn empty_index_returns_no_hits() {
        let r = mk_retriever(MemoryIndex::new());
        assert!(r.search("anything").await.unwrap().is_empty());
    }

    #[test]
    fn bm25_prefers_term_matches() {
        let scores = bm25_scores(
            "refund policy",
            &[
                "our refund policy allows cancellation",
                "reading club meets twice a week",
            ],
        );
        assert!(scores[0] > scores[1]);
        assert_eq!(scores[1], 0.0);
    }

    #[test]
    fn normalization_handles_constant_scores() {
        assert_eq!(normalize_scores(&[0.4, 0.4, 0.4]), vec![1.0, 1.0, 1.0]);
        assert_eq!(normalize_scores(&[]), Vec::<f32>::new());
        let n = normalize_scores(&[1.0, 3.0, 2.0]);
        assert_eq!(n[0], 0.0);
        assert_eq!(n[1], 1.0);
    }

    #[test]
    fn format_returns_context_json_and_top_result() {
        let hits = vec![
            SearchHit {
                content: "low".into(),
                score: 0.2,
                metadata: json!({}),
            },
            SearchHit {
                content: "high".into(),
                score: 0.9,
                metadata: json!({ "category": "course" }),
            },
        ];
        let (context, top) = HybridRetriever::format_search_results(&hits);
        assert_eq!(top.as_deref(), Some("high"));
        let parsed: Value = serde_json::from_str(&context).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        assert_eq!(parsed[1]["relevance_score"], "0.90");
    }
}
