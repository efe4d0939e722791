use crate::{
    errors::ServiceError,
    get_env,
    utils::retry::{with_retry, BackoffPolicy},
};
use openai_dive::v1::resources::embedding::{EmbeddingInput, EmbeddingOutput, EmbeddingResponse};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const EMBEDDING_MAX_BATCH_SIZE: usize = 100;
pub const EMBEDDING_RETRY_ATTEMPTS: u32 = 3;

// Provider throughput headroom between consecutive batch calls.
const INTER_BATCH_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize, Deserialize)]
pub struct EmbeddingParameters {
    /// Input text to embed, encoded as a string or array of strings.
    pub input: EmbeddingInput,
    /// ID of the model to use.
    pub model: String,
}

fn embedding_base_url() -> String {
    std::env::var("OPENAI_BASE_URL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or("https://api.openai.com/v1".to_string())
}

async fn embedding_server_call(texts: Vec<String>) -> Result<Vec<Vec<f32>>, ServiceError> {
    let embedding_api_key = get_env!("OPENAI_API_KEY", "OPENAI_API_KEY should be set");

    let parameters = EmbeddingParameters {
        input: EmbeddingInput::StringArray(texts),
        model: EMBEDDING_MODEL.to_string(),
    };

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/embeddings", embedding_base_url()))
        .header("Authorization", format!("Bearer {}", embedding_api_key))
        .header("Content-Type", "application/json")
        .json(&parameters)
        .send()
        .await
        .map_err(|err| {
            ServiceError::InternalServerError(format!(
                "Could not reach embeddings server: {:?}",
                err
            ))
        })?;

    if !response.status().is_success() {
        return Err(ServiceError::InternalServerError(format!(
            "Embeddings server responded with status {}",
            response.status()
        )));
    }

    let embeddings: EmbeddingResponse = response.json().await.map_err(|err| {
        log::error!("Failed to parse response from embeddings server {:?}", err);
        ServiceError::InternalServerError(
            "Failed to parse response from embeddings server".to_string(),
        )
    })?;

    let vectors: Vec<Vec<f32>> = embeddings
        .data
        .into_iter()
        .map(|item| match item.embedding {
            EmbeddingOutput::Float(values) => values.iter().map(|value| *value as f32).collect(),
            EmbeddingOutput::Base64(_) => {
                log::error!("Embeddings server responded with Base64, which is not supported");
                vec![]
            }
        })
        .collect();

    if vectors.iter().any(|vector| vector.is_empty()) {
        return Err(ServiceError::InternalServerError(
            "Embeddings server returned an empty vector".to_string(),
        ));
    }

    Ok(vectors)
}

/// Embeds one text, used for incoming questions at query time.
#[tracing::instrument]
pub async fn create_embedding(text: String) -> Result<Vec<f32>, ServiceError> {
    if text.trim().is_empty() {
        return Err(ServiceError::BadRequest("No text to embed".to_string()));
    }

    let mut vectors = create_embeddings(vec![text]).await?;
    vectors.pop().ok_or_else(|| {
        ServiceError::InternalServerError("No dense embeddings returned from server".to_string())
    })
}

/// Embeds a document batch, preserving input order. Batches are capped at
/// `EMBEDDING_MAX_BATCH_SIZE` and each one is retried with exponential
/// backoff; an exhausted batch fails the whole call, because a site with a
/// partial vector set is worse than a site marked errored.
#[tracing::instrument(skip(texts))]
pub async fn create_embeddings(texts: Vec<String>) -> Result<Vec<Vec<f32>>, ServiceError> {
    if texts.is_empty() {
        return Ok(vec![]);
    }

    let total = texts.len();
    let mut all_vectors: Vec<Vec<f32>> = Vec::with_capacity(total);

    for (batch_index, batch) in texts.chunks(EMBEDDING_MAX_BATCH_SIZE).enumerate() {
        let batch_vectors = with_retry(EMBEDDING_RETRY_ATTEMPTS, BackoffPolicy::default(), || {
            embedding_server_call(batch.to_vec())
        })
        .await?;

        if batch_vectors.len() != batch.len() {
            return Err(ServiceError::InternalServerError(format!(
                "Embeddings server returned {} vectors for {} inputs",
                batch_vectors.len(),
                batch.len()
            )));
        }

        all_vectors.extend(batch_vectors);

        if (batch_index + 1) * EMBEDDING_MAX_BATCH_SIZE < total {
            tokio::time::sleep(INTER_BATCH_DELAY).await;
        }
    }

    Ok(all_vectors)
}
