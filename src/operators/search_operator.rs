use crate::{
    errors::ServiceError,
    operators::{
        model_operator::create_embedding,
        qdrant_operator::{query_site_vectors_query, ScoredChunkVector},
    },
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const SEARCH_TOP_K: u64 = 5;
pub const MAX_CHUNKS_RETURNED: usize = 3;

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct RetrievedChunk {
    pub content: String,
    pub page_url: String,
    pub heading: Option<String>,
    pub score: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct KnowledgeSearchResult {
    pub has_answer: bool,
    pub chunks: Vec<RetrievedChunk>,
    /// Best similarity observed, reported even without an answer so that
    /// threshold tuning has something to look at.
    pub best_score: f32,
}

/// Threshold cut and page-level dedup over ranked matches. A match exactly at
/// the threshold counts as grounding.
pub fn select_relevant_chunks(
    mut matches: Vec<RetrievedChunk>,
    threshold: f32,
) -> KnowledgeSearchResult {
    matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let best_score = matches.first().map(|chunk| chunk.score).unwrap_or(0.0);

    let relevant: Vec<RetrievedChunk> = matches
        .into_iter()
        .filter(|chunk| chunk.score >= threshold)
        .unique_by(|chunk| chunk.page_url.clone())
        .take(MAX_CHUNKS_RETURNED)
        .collect();

    if relevant.is_empty() {
        return KnowledgeSearchResult {
            has_answer: false,
            chunks: vec![],
            best_score,
        };
    }

    KnowledgeSearchResult {
        has_answer: true,
        best_score: relevant[0].score,
        chunks: relevant,
    }
}

/// Embeds the question and ranks the site's chunks against it. `has_answer`
/// is false when nothing clears the similarity threshold.
#[tracing::instrument]
pub async fn search_knowledge(
    site_id: uuid::Uuid,
    question: String,
    threshold: f32,
) -> Result<KnowledgeSearchResult, ServiceError> {
    let question_vector = create_embedding(question).await?;

    let matches = query_site_vectors_query(site_id, question_vector, SEARCH_TOP_K).await?;

    let retrieved = matches
        .into_iter()
        .map(|chunk: ScoredChunkVector| RetrievedChunk {
            content: chunk.content,
            page_url: chunk.page_url,
            heading: chunk.heading,
            score: chunk.score,
        })
        .collect();

    Ok(select_relevant_chunks(retrieved, threshold))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(page: &str, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            content: format!("content from {}", page),
            page_url: page.to_string(),
            heading: None,
            score,
        }
    }

    #[test]
    fn score_at_threshold_counts_as_answer() {
        let result = select_relevant_chunks(vec![chunk("/a", 0.35)], 0.35);
        assert!(result.has_answer);
        assert_eq!(result.chunks.len(), 1);
    }

    #[test]
    fn score_below_threshold_is_no_answer_but_reports_best() {
        let result = select_relevant_chunks(vec![chunk("/a", 0.349)], 0.35);
        assert!(!result.has_answer);
        assert!(result.chunks.is_empty());
        assert!((result.best_score - 0.349).abs() < f32::EPSILON);
    }

    #[test]
    fn empty_matches_report_zero_best_score() {
        let result = select_relevant_chunks(vec![], 0.35);
        assert!(!result.has_answer);
        assert_eq!(result.best_score, 0.0);
    }

    #[test]
    fn dedupes_by_source_page_and_caps_count() {
        let result = select_relevant_chunks(
            vec![
                chunk("/a", 0.9),
                chunk("/a", 0.85),
                chunk("/b", 0.8),
                chunk("/c", 0.7),
                chunk("/d", 0.6),
            ],
            0.5,
        );
        assert!(result.has_answer);
        assert_eq!(result.chunks.len(), MAX_CHUNKS_RETURNED);
        let pages: Vec<&str> = result.chunks.iter().map(|c| c.page_url.as_str()).collect();
        assert_eq!(pages, vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn orders_by_score_descending() {
        let result = select_relevant_chunks(
            vec![chunk("/low", 0.6), chunk("/high", 0.9), chunk("/mid", 0.7)],
            0.5,
        );
        assert_eq!(result.chunks[0].page_url, "/high");
        assert!((result.best_score - 0.9).abs() < f32::EPSILON);
    }
}
