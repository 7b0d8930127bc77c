//! Hybrid retriever: fuses vector and lexical results, hydrates with
//! chunk text and source metadata from storage.

use std::collections::HashMap;

use crate::lexical_index::LexicalIndex;
use crate::models::{Document, FormatTag, KBConfig};
use crate::storage::Storage;
use crate::vector_index::VectorIndex;

/// One ranked result, ready to hand to a caller (CLI, tool-server runtime).
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub source_filename: String,
    pub format: FormatTag,
    pub score: f32,
    pub sequence_index: usize,
}

/// Minimum candidate pool pulled from each index before fusion.
const MIN_CANDIDATE_POOL: usize = 20;

fn min_max_normalize(scores: &mut HashMap<String, f32>) {
    if scores.is_empty() {
        return;
    }
    let min = scores.values().cloned().fold(f32::INFINITY, f32::min);
    let max = scores.values().cloned().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    if range.abs() < f32::EPSILON {
        for v in scores.values_mut() {
            *v = 1.0;
        }
        return;
    }
    for v in scores.values_mut() {
        *v = (*v - min) / range;
    }
}

/// Run a hybrid (or vector-only) query and hydrate the top-k with chunk text
/// and owning-document metadata.
pub async fn retrieve(
    storage: &Storage,
    vector_index: &VectorIndex,
    lexical_index: &LexicalIndex,
    config: &KBConfig,
    query_vector: Option<&[f32]>,
    query_text: &str,
    k: usize,
) -> crate::error::KResult<Vec<RetrievedChunk>> {
    let pool = (2 * k).max(MIN_CANDIDATE_POOL);

    let fused: Vec<(String, f32)> = if query_vector.is_none() {
        // No embedding available for this query (provider disabled): the
        // lexical index is the only signal we have, regardless of the KB's
        // hybrid setting.
        let mut lexical_scores: HashMap<String, f32> = lexical_index
            .search(query_text, k)
            .into_iter()
            .map(|h| (h.chunk_id, h.score))
            .collect();
        min_max_normalize(&mut lexical_scores);
        let mut scored: Vec<(String, f32)> = lexical_scores.into_iter().collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    } else if !config.hybrid_enabled {
        let qv = query_vector.unwrap();
        vector_index
            .search(qv, k)
            .into_iter()
            .map(|h| (h.chunk_id, h.score))
            .collect()
    } else {
        let qv = query_vector.unwrap();
        let mut vector_scores: HashMap<String, f32> = vector_index
            .search(qv, pool)
            .into_iter()
            .map(|h| (h.chunk_id, h.score))
            .collect();
        let mut lexical_scores: HashMap<String, f32> = lexical_index
            .search(query_text, pool)
            .into_iter()
            .map(|h| (h.chunk_id, h.score))
            .collect();
        let lexical_raw = lexical_scores.clone();

        min_max_normalize(&mut vector_scores);
        min_max_normalize(&mut lexical_scores);

        let alpha = config.vector_weight_alpha;
        let mut all_ids: Vec<String> = vector_scores.keys().chain(lexical_scores.keys()).cloned().collect();
        all_ids.sort();
        all_ids.dedup();

        let mut combined: Vec<(String, f32, f32)> = all_ids
            .into_iter()
            .map(|id| {
                let v = vector_scores.get(&id).copied().unwrap_or(0.0);
                let l = lexical_scores.get(&id).copied().unwrap_or(0.0);
                let fused_score = alpha * v + (1.0 - alpha) * l;
                let lexical_raw_score = lexical_raw.get(&id).copied().unwrap_or(0.0);
                (id, fused_score, lexical_raw_score)
            })
            .collect();

        combined.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.0.cmp(&b.0))
        });
        combined.truncate(k);
        combined.into_iter().map(|(id, score, _)| (id, score)).collect()
    };

    hydrate(storage, fused).await
}

async fn hydrate(
    storage: &Storage,
    scored: Vec<(String, f32)>,
) -> crate::error::KResult<Vec<RetrievedChunk>> {
    let mut doc_cache: HashMap<String, Document> = HashMap::new();
    let mut out = Vec::with_capacity(scored.len());

    for (chunk_id, score) in scored {
        let Some(chunk) = storage.get_chunk(&chunk_id).await? else {
            continue;
        };
        let document = if let Some(doc) = doc_cache.get(&chunk.document_id) {
            doc.clone()
        } else {
            let Some(doc) = storage.get_document(&chunk.document_id).await? else {
                continue;
            };
            doc_cache.insert(chunk.document_id.clone(), doc.clone());
            doc
        };

        out.push(RetrievedChunk {
            chunk_id: chunk.id,
            document_id: chunk.document_id,
            text: chunk.text,
            source_filename: document.filename,
            format: document.format,
            score,
            sequence_index: chunk.sequence_index,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_max_normalize_scales_to_unit_range() {
        let mut scores: HashMap<String, f32> =
            [("a".to_string(), 1.0), ("b".to_string(), 3.0), ("c".to_string(), 5.0)]
                .into_iter()
                .collect();
        min_max_normalize(&mut scores);
        assert_eq!(scores["a"], 0.0);
        assert_eq!(scores["c"], 1.0);
        assert!((scores["b"] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn min_max_normalize_constant_scores_become_one() {
        let mut scores: HashMap<String, f32> =
            [("a".to_string(), 2.0), ("b".to_string(), 2.0)].into_iter().collect();
        min_max_normalize(&mut scores);
        assert_eq!(scores["a"], 1.0);
        assert_eq!(scores["b"], 1.0);
    }
}
