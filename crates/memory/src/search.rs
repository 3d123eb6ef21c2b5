/// Hybrid retrieval: vector similarity and BM25 keyword rank merged into one
/// weighted score.
use std::{collections::HashMap, sync::Arc};

use {
    serde::Serialize,
    tracing::{debug, warn},
};

use crate::{
    embedder::Embedder,
    error::{MemoryError, Result},
    store::{Candidate, Capabilities, MemoryStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Hybrid,
    Vector,
    Keyword,
}

/// A reduced-quality condition the caller should know about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    KeywordUnavailable,
    VectorUnavailable,
    QueryEmbeddingFailed { error: String },
    /// The brute-force scan saw only the `scanned` most recent of `total`
    /// comparable chunks.
    FallbackScanTruncated { scanned: usize, total: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub source_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    pub score: f32,
    pub vector_score: Option<f32>,
    pub keyword_score: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub mode: SearchMode,
    pub degraded: Vec<Degradation>,
    /// Embedded chunks skipped because their model or dimensions differ from
    /// the query embedding.
    pub stale_chunks: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SearchOptions {
    pub limit: usize,
    /// Vector weight in [0, 1]; keyword gets `1 - weight`.
    pub weight: Option<f32>,
    pub min_score: Option<f32>,
}

impl SearchOptions {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}

// ── Scoring ──────────────────────────────────────────────────────────────────

/// Cosine similarity in [-1, 1]; `None` when the vectors are not comparable.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return Some(0.0);
    }
    Some((dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0) as f32)
}

/// Map cosine similarity onto [0, 1].
pub fn similarity_to_score(cosine: f32) -> f32 {
    if !cosine.is_finite() {
        return 0.0;
    }
    ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Map a "lower is better" rank onto (0, 1]; strictly decreasing for rank >= 0.
pub fn rank_to_score(rank: f64) -> f32 {
    if !rank.is_finite() {
        return 0.0;
    }
    (1.0 / (1.0 + rank.max(0.0))) as f32
}

/// Keyword candidates scored relative to the best BM25 rank in the set.
fn keyword_scores(candidates: Vec<Candidate>) -> Vec<(Candidate, f32)> {
    let best = candidates
        .iter()
        .map(|c| c.raw_score)
        .filter(|r| r.is_finite())
        .fold(f64::INFINITY, f64::min);
    candidates
        .into_iter()
        .map(|c| {
            let score = rank_to_score(c.raw_score - best);
            (c, score)
        })
        .collect()
}

/// Weighted merge of both result lists by chunk id. A side that did not
/// return a chunk contributes 0. Sorted by score, ties by id ascending.
pub fn merge_hybrid(
    vector: Vec<(Candidate, f32)>,
    keyword: Vec<(Candidate, f32)>,
    weight: f32,
) -> Vec<SearchHit> {
    let mut by_id: HashMap<String, SearchHit> = HashMap::new();
    for (c, score) in vector {
        let hit = by_id.entry(c.id.clone()).or_insert_with(|| hit_from(c));
        hit.vector_score = Some(score);
    }
    for (c, score) in keyword {
        let hit = by_id.entry(c.id.clone()).or_insert_with(|| hit_from(c));
        hit.keyword_score = Some(score);
    }

    let mut hits: Vec<SearchHit> = by_id
        .into_values()
        .map(|mut h| {
            h.score = weight * h.vector_score.unwrap_or(0.0)
                + (1.0 - weight) * h.keyword_score.unwrap_or(0.0);
            h
        })
        .collect();
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    hits
}

fn hit_from(c: Candidate) -> SearchHit {
    SearchHit {
        id: c.id,
        source_path: c.source_path,
        start_line: c.start_line,
        end_line: c.end_line,
        text: c.text,
        score: 0.0,
        vector_score: None,
        keyword_score: None,
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Search parameters fixed per manager.
#[derive(Debug, Clone, Copy)]
pub struct SearchDefaults {
    pub hybrid_weight: f32,
    pub candidate_multiplier: usize,
    pub min_score: f32,
    pub max_fallback_scan_chunks: usize,
}

pub struct HybridSearch {
    store: Arc<dyn MemoryStore>,
    embedder: Arc<Embedder>,
    capabilities: Capabilities,
    defaults: SearchDefaults,
}

struct VectorOutcome {
    scored: Vec<(Candidate, f32)>,
    stale: usize,
    degraded: Option<Degradation>,
}

impl HybridSearch {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        embedder: Arc<Embedder>,
        capabilities: Capabilities,
        defaults: SearchDefaults,
    ) -> Self {
        Self {
            store,
            embedder,
            capabilities,
            defaults,
        }
    }

    pub async fn search(&self, query: &str, opts: SearchOptions) -> Result<SearchResponse> {
        let weight = opts.weight.unwrap_or(self.defaults.hybrid_weight);
        if !(0.0..=1.0).contains(&weight) {
            return Err(MemoryError::Config(format!(
                "search weight must be within [0, 1], got {weight}"
            )));
        }
        let limit = opts.limit.max(1);
        let min_score = opts.min_score.unwrap_or(self.defaults.min_score);
        let candidates = limit.saturating_mul(self.defaults.candidate_multiplier.max(1));

        let mut degraded = Vec::new();
        let keyword_weighted = weight < 1.0;
        let vector_weighted = weight > 0.0;
        let run_keyword = keyword_weighted && self.capabilities.keyword;
        let run_vector = vector_weighted && self.embedder.is_enabled();
        if keyword_weighted && !self.capabilities.keyword {
            degraded.push(Degradation::KeywordUnavailable);
        }
        if vector_weighted && !self.embedder.is_enabled() {
            degraded.push(Degradation::VectorUnavailable);
        }
        if !run_keyword && !run_vector {
            return Err(MemoryError::capability(
                "search",
                format!("no retrieval path available at vector weight {weight}"),
            ));
        }

        let query = query.trim();
        if query.is_empty() {
            let mode = match (run_vector, run_keyword) {
                (true, true) => SearchMode::Hybrid,
                (true, false) => SearchMode::Vector,
                _ => SearchMode::Keyword,
            };
            return Ok(SearchResponse {
                hits: Vec::new(),
                mode,
                degraded,
                stale_chunks: 0,
            });
        }

        let keyword_fut = async {
            if run_keyword {
                self.store.keyword_search(query, candidates).await.map(Some)
            } else {
                Ok(None)
            }
        };
        let vector_fut = async {
            if run_vector {
                self.vector_path(query, candidates, run_keyword).await.map(Some)
            } else {
                Ok(None)
            }
        };
        let (keyword, vector) = tokio::join!(keyword_fut, vector_fut);
        let keyword = keyword?.map(keyword_scores);
        let vector = vector?;

        let mut stale_chunks = 0;
        let vector = vector.and_then(|v| {
            stale_chunks = v.stale;
            degraded.extend(v.degraded.clone());
            // A failed query embedding leaves no vector results at all.
            (!matches!(v.degraded, Some(Degradation::QueryEmbeddingFailed { .. })))
                .then_some(v.scored)
        });

        let (mode, hits) = match (vector, keyword) {
            (Some(v), Some(k)) => (SearchMode::Hybrid, merge_hybrid(v, k, weight)),
            (Some(v), None) => (SearchMode::Vector, merge_hybrid(v, Vec::new(), 1.0)),
            (None, Some(k)) => (SearchMode::Keyword, merge_hybrid(Vec::new(), k, 0.0)),
            (None, None) => {
                return Err(MemoryError::capability("search", "no retrieval path produced results"));
            },
        };

        let hits: Vec<SearchHit> = hits
            .into_iter()
            .filter(|h| h.score >= min_score)
            .take(limit)
            .collect();
        debug!(query_len = query.len(), hits = hits.len(), ?mode, "memory search");
        Ok(SearchResponse {
            hits,
            mode,
            degraded,
            stale_chunks,
        })
    }

    async fn vector_path(
        &self,
        query: &str,
        candidates: usize,
        keyword_fallback: bool,
    ) -> Result<VectorOutcome> {
        let embedding = match self.embedder.embed_query(query).await {
            Ok(e) => e,
            Err(e) if keyword_fallback => {
                warn!(error = %e, "query embedding failed, searching keywords only");
                return Ok(VectorOutcome {
                    scored: Vec::new(),
                    stale: 0,
                    degraded: Some(Degradation::QueryEmbeddingFailed {
                        error: e.to_string(),
                    }),
                });
            },
            Err(e) => return Err(e),
        };
        let model_id = self.embedder.model_id();
        let dims = embedding.len();
        let stale = self.store.count_stale_embeddings(model_id, dims).await?;

        if self.capabilities.native_vector {
            let scored = self
                .store
                .vector_search(&embedding, model_id, candidates)
                .await?
                .into_iter()
                .map(|c| {
                    let score = similarity_to_score(c.raw_score as f32);
                    (c, score)
                })
                .collect();
            return Ok(VectorOutcome {
                scored,
                stale,
                degraded: None,
            });
        }

        let batch = self
            .store
            .scan_embeddings(model_id, dims, self.defaults.max_fallback_scan_chunks)
            .await?;
        let scanned = batch.rows.len();
        let total = batch.total_candidates;
        let degraded = (total > scanned).then(|| {
            debug!(scanned, total, "fallback vector scan truncated");
            Degradation::FallbackScanTruncated { scanned, total }
        });

        let scored = tokio::task::spawn_blocking(move || {
            let mut scored: Vec<(Candidate, f32)> = batch
                .rows
                .into_iter()
                .filter_map(|row| {
                    let cosine = cosine_similarity(&embedding, row.embedding.as_deref()?)?;
                    Some((
                        Candidate {
                            id: row.id,
                            source_path: row.source_path,
                            start_line: row.start_line,
                            end_line: row.end_line,
                            text: row.text,
                            raw_score: f64::from(cosine),
                        },
                        similarity_to_score(cosine),
                    ))
                })
                .collect();
            scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
            scored.truncate(candidates);
            scored
        })
        .await
        .map_err(|e| MemoryError::Task(e.to_string()))?;

        Ok(VectorOutcome {
            scored,
            stale,
            degraded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{EmbeddingProviderKind, MemorySettings},
        embeddings::{EmbeddingProvider, ResolvedProvider},
        schema::{ChunkRow, FileRow},
        store_sqlite::SqliteMemoryStore,
        test_support::MockProvider,
    };

    fn cand(id: &str) -> Candidate {
        Candidate {
            id: id.into(),
            source_path: "memory/a.md".into(),
            start_line: 1,
            end_line: 1,
            text: id.into(),
            raw_score: 0.0,
        }
    }

    fn defaults() -> SearchDefaults {
        SearchDefaults {
            hybrid_weight: 0.7,
            candidate_multiplier: 4,
            min_score: 0.0,
            max_fallback_scan_chunks: 5000,
        }
    }

    #[test]
    fn cosine_identities() {
        let a = [1.0, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a).unwrap() - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap().abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]).unwrap() + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[], &[]), None);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), Some(0.0));
    }

    #[test]
    fn similarity_score_range() {
        assert_eq!(similarity_to_score(1.0), 1.0);
        assert_eq!(similarity_to_score(-1.0), 0.0);
        assert_eq!(similarity_to_score(0.0), 0.5);
        assert_eq!(similarity_to_score(f32::NAN), 0.0);
    }

    #[test]
    fn rank_score_is_strictly_decreasing() {
        let ranks = [0.0, 0.1, 1.0, 2.5, 10.0, 1000.0];
        let scores: Vec<f32> = ranks.iter().map(|r| rank_to_score(*r)).collect();
        assert_eq!(scores[0], 1.0);
        assert!(scores.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(rank_to_score(-5.0), 1.0);
        assert_eq!(rank_to_score(f64::NAN), 0.0);
        assert_eq!(rank_to_score(f64::INFINITY), 0.0);
    }

    #[test]
    fn keyword_scores_shift_by_best_rank() {
        let mut a = cand("a");
        a.raw_score = -4.0;
        let mut b = cand("b");
        b.raw_score = -1.0;
        let scored = keyword_scores(vec![a, b]);
        assert_eq!(scored[0].1, 1.0);
        assert!((scored[1].1 - 0.25).abs() < 1e-6);
    }

    #[test]
    fn merge_weights_and_tie_breaks() {
        let vector = vec![(cand("b"), 1.0), (cand("a"), 0.5)];
        let keyword = vec![(cand("a"), 1.0), (cand("c"), 0.5)];

        let hits = merge_hybrid(vector.clone(), keyword.clone(), 0.5);
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        // a = 0.75, b = 0.5, c = 0.25
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(hits[1].keyword_score, None);

        let pure_vector = merge_hybrid(vector.clone(), keyword.clone(), 1.0);
        assert_eq!(pure_vector[0].id, "b");
        let pure_keyword = merge_hybrid(vector, keyword, 0.0);
        assert_eq!(pure_keyword[0].id, "a");

        let tied = merge_hybrid(vec![(cand("z"), 0.5), (cand("m"), 0.5)], Vec::new(), 1.0);
        assert_eq!(tied[0].id, "m");
    }

    fn row(id: usize, dims: usize, model_id: &str, text: &str) -> ChunkRow {
        let mut embedding = crate::test_support::concept_vector(text, dims);
        embedding.truncate(dims);
        ChunkRow {
            id: format!("c{id:06}"),
            source_path: "memory/a.md".into(),
            content_hash: crate::chunker::hash_text(&format!("{id}{text}")),
            start_line: id as i64,
            end_line: id as i64,
            text: text.into(),
            token_count: 1,
            embedding: Some(embedding),
            model_id: model_id.into(),
            updated_at: id as i64,
        }
    }

    async fn seed(store: &SqliteMemoryStore, rows: &[ChunkRow]) {
        let file = FileRow {
            path: "memory/a.md".into(),
            hash: "h".into(),
            mtime: 0,
            size: 0,
            chunk_count: rows.len() as i64,
            indexed_at: 0,
        };
        store.replace_source(&file, rows).await.unwrap();
    }

    fn engine(
        store: Arc<SqliteMemoryStore>,
        provider: Option<Arc<MockProvider>>,
        defaults: SearchDefaults,
    ) -> HybridSearch {
        let resolved = match provider {
            Some(p) => ResolvedProvider::new(EmbeddingProviderKind::Local, p),
            None => ResolvedProvider::disabled(),
        };
        let settings = MemorySettings {
            embed_retry_backoff_ms: 1,
            ..Default::default()
        };
        let embedder = Arc::new(Embedder::new(&resolved, &settings));
        let caps = store.capabilities();
        HybridSearch::new(store, embedder, caps, defaults)
    }

    #[tokio::test]
    async fn mismatched_dimensions_are_excluded_and_counted() {
        let store = Arc::new(SqliteMemoryStore::in_memory().await.unwrap());
        let mock = MockProvider::new("dual", 1536);
        let model_id = format!("{}/{}", mock.provider_key(), mock.model_name());
        seed(
            &store,
            &[
                row(1, 768, &model_id, "cats purr"),
                row(2, 768, &model_id, "kitten whiskers"),
                row(3, 1536, &model_id, "cat nap"),
            ],
        )
        .await;

        let search = engine(store, Some(mock), defaults());
        let resp = search
            .search("cat", SearchOptions {
                limit: 10,
                weight: Some(1.0),
                min_score: None,
            })
            .await
            .unwrap();
        assert_eq!(resp.mode, SearchMode::Vector);
        assert_eq!(resp.stale_chunks, 2);
        let ids: Vec<&str> = resp.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c000003"]);
    }

    #[tokio::test]
    async fn fallback_scan_reports_truncation() {
        let store = Arc::new(SqliteMemoryStore::in_memory().await.unwrap());
        let mock = MockProvider::concept();
        let model_id = format!("{}/{}", mock.provider_key(), mock.model_name());
        let rows: Vec<ChunkRow> = (0..50).map(|i| row(i, 8, &model_id, "rust crate")).collect();
        seed(&store, &rows).await;

        let search = engine(store, Some(mock), SearchDefaults {
            max_fallback_scan_chunks: 10,
            ..defaults()
        });
        let resp = search
            .search("rust", SearchOptions {
                limit: 5,
                weight: Some(1.0),
                min_score: None,
            })
            .await
            .unwrap();
        assert_eq!(resp.hits.len(), 5);
        assert!(resp.degraded.contains(&Degradation::FallbackScanTruncated {
            scanned: 10,
            total: 50,
        }));
        // Most recently updated rows are the ones scanned.
        assert!(resp.hits.iter().all(|h| h.start_line >= 40));
    }

    #[tokio::test]
    async fn keyword_only_without_provider() {
        let store = Arc::new(SqliteMemoryStore::in_memory().await.unwrap());
        seed(&store, &[row(1, 8, "", "tomato garden"), row(2, 8, "", "airport hotel")]).await;

        let search = engine(store, None, defaults());
        let resp = search.search("tomato", SearchOptions::limit(5)).await.unwrap();
        assert_eq!(resp.mode, SearchMode::Keyword);
        assert!(resp.degraded.contains(&Degradation::VectorUnavailable));
        assert_eq!(resp.hits.len(), 1);
        assert_eq!(resp.hits[0].score, 1.0);

        let err = search
            .search("tomato", SearchOptions {
                limit: 5,
                weight: Some(1.0),
                min_score: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::CapabilityUnavailable { .. }));
    }

    #[tokio::test]
    async fn query_embedding_failure_falls_back_to_keywords() {
        let store = Arc::new(SqliteMemoryStore::in_memory().await.unwrap());
        seed(&store, &[row(1, 8, "", "tomato garden")]).await;
        let mock = MockProvider::concept();
        mock.fail_next(100);
        let search = engine(store, Some(mock), defaults());

        let resp = search.search("tomato", SearchOptions::limit(5)).await.unwrap();
        assert_eq!(resp.mode, SearchMode::Keyword);
        assert!(matches!(
            resp.degraded.as_slice(),
            [Degradation::QueryEmbeddingFailed { .. }]
        ));
        assert_eq!(resp.hits.len(), 1);
    }

    #[tokio::test]
    async fn min_score_filters_and_bad_weight_is_rejected() {
        let store = Arc::new(SqliteMemoryStore::in_memory().await.unwrap());
        // Enough unrelated rows to give "tomato" a positive IDF.
        seed(&store, &[
            row(1, 8, "", "tomato garden"),
            row(2, 8, "", "tomato tomato soil"),
            row(3, 8, "", "airport hotel"),
            row(4, 8, "", "flight trip"),
            row(5, 8, "", "luggage"),
        ])
        .await;
        let search = engine(store, None, defaults());

        let resp = search
            .search("tomato", SearchOptions {
                limit: 5,
                weight: Some(0.0),
                min_score: Some(0.99),
            })
            .await
            .unwrap();
        assert_eq!(resp.hits.len(), 1);

        assert!(matches!(
            search
                .search("tomato", SearchOptions {
                    limit: 5,
                    weight: Some(1.5),
                    min_score: None,
                })
                .await,
            Err(MemoryError::Config(_))
        ));
    }
}
