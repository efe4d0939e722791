use crate::{errors::ServiceError, get_env};
use qdrant_client::{
    qdrant::{
        value::Kind, Condition, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
        DeletePointsBuilder, Distance, FieldType, Filter, PointStruct, SearchPointsBuilder,
        UpsertPointsBuilder, VectorParamsBuilder,
    },
    Payload, Qdrant,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const QDRANT_UPSERT_BATCH_SIZE: usize = 100;

#[tracing::instrument(skip(qdrant_url, qdrant_api_key))]
pub async fn get_qdrant_connection(
    qdrant_url: Option<&str>,
    qdrant_api_key: Option<&str>,
) -> Result<Qdrant, ServiceError> {
    let qdrant_url = qdrant_url.unwrap_or(get_env!(
        "QDRANT_URL",
        "QDRANT_URL should be set if this is called"
    ));
    let qdrant_api_key = qdrant_api_key.unwrap_or(get_env!(
        "QDRANT_API_KEY",
        "QDRANT_API_KEY should be set if this is called"
    ));

    Qdrant::from_url(qdrant_url)
        .api_key(qdrant_api_key)
        .timeout(std::time::Duration::from_secs(60))
        .build()
        .map_err(|_err| ServiceError::BadRequest("Failed to connect to Qdrant".to_string()))
}

pub fn get_qdrant_collection_name() -> String {
    std::env::var("QDRANT_COLLECTION").unwrap_or("site_knowledge_vectors".to_string())
}

fn embedding_size() -> u64 {
    std::env::var("EMBEDDING_SIZE")
        .unwrap_or("1536".to_string())
        .parse()
        .unwrap_or(1536)
}

/// Every query and delete is scoped by this filter. The `site_id` payload
/// field is the sole tenant boundary in the vector index.
fn site_namespace_filter(site_id: uuid::Uuid) -> Filter {
    Filter::must([Condition::matches("site_id", site_id.to_string())])
}

/// Creates the shared knowledge collection and the keyword index backing the
/// per-site namespace filter. Idempotent, called once at startup.
#[tracing::instrument]
pub async fn create_knowledge_collection_query() -> Result<(), ServiceError> {
    let qdrant_client = get_qdrant_connection(None, None).await?;
    let collection_name = get_qdrant_collection_name();

    let collection_exists = qdrant_client
        .collection_exists(collection_name.clone())
        .await
        .map_err(|e| ServiceError::BadRequest(e.to_string()))?;

    if collection_exists {
        log::info!("Avoided creating collection as it already exists");
        return Ok(());
    }

    qdrant_client
        .create_collection(
            CreateCollectionBuilder::new(collection_name.clone())
                .vectors_config(VectorParamsBuilder::new(embedding_size(), Distance::Cosine)),
        )
        .await
        .map_err(|err| {
            if err.to_string().contains("already exists") {
                return ServiceError::BadRequest("Collection already exists".into());
            }
            ServiceError::BadRequest(err.to_string())
        })?;

    qdrant_client
        .create_field_index(CreateFieldIndexCollectionBuilder::new(
            collection_name,
            "site_id",
            FieldType::Keyword,
        ))
        .await
        .map_err(|_| ServiceError::BadRequest("Failed to create site_id index".into()))?;

    Ok(())
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChunkVectorRecord {
    pub vector_id: uuid::Uuid,
    pub values: Vec<f32>,
    pub site_id: uuid::Uuid,
    pub page_url: String,
    pub content: String,
    pub heading: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScoredChunkVector {
    pub vector_id: String,
    pub score: f32,
    pub page_url: String,
    pub content: String,
    pub heading: Option<String>,
}

/// Bulk-inserts chunk vectors for one site. Mixed-site batches are refused so
/// a bug upstream cannot leak chunks across namespaces; oversized batches are
/// split.
#[tracing::instrument(skip(records))]
pub async fn bulk_upsert_chunk_vectors_query(
    site_id: uuid::Uuid,
    records: Vec<ChunkVectorRecord>,
) -> Result<(), ServiceError> {
    if records.is_empty() {
        return Ok(());
    }

    if records.iter().any(|record| record.site_id != site_id) {
        return Err(ServiceError::BadRequest(
            "All vectors in an upsert batch must belong to the same site".to_string(),
        ));
    }

    let qdrant_client = get_qdrant_connection(None, None).await?;
    let collection_name = get_qdrant_collection_name();

    for batch in records.chunks(QDRANT_UPSERT_BATCH_SIZE) {
        let points: Vec<PointStruct> = batch
            .iter()
            .map(|record| {
                let payload: Payload = serde_json::json!({
                    "site_id": record.site_id.to_string(),
                    "page_url": record.page_url,
                    "content": record.content,
                    "heading": record.heading,
                })
                .try_into()
                .expect("payload is a json object");

                PointStruct::new(
                    record.vector_id.to_string(),
                    record.values.clone(),
                    payload,
                )
            })
            .collect();

        qdrant_client
            .upsert_points(UpsertPointsBuilder::new(collection_name.clone(), points))
            .await
            .map_err(|err| {
                log::error!("Failed inserting chunk vectors to qdrant {:?}", err);
                ServiceError::InternalServerError(format!(
                    "Failed inserting chunk vectors to qdrant {:?}",
                    err
                ))
            })?;
    }

    Ok(())
}

/// Drops the whole namespace for a site ahead of a recrawl or delete.
#[tracing::instrument]
pub async fn delete_site_vectors_query(site_id: uuid::Uuid) -> Result<(), ServiceError> {
    let qdrant_client = get_qdrant_connection(None, None).await?;

    qdrant_client
        .delete_points(
            DeletePointsBuilder::new(get_qdrant_collection_name())
                .points(site_namespace_filter(site_id))
                .wait(true),
        )
        .await
        .map_err(|err| {
            log::error!("Failed deleting site vectors from qdrant {:?}", err);
            ServiceError::InternalServerError(
                "Failed deleting site vectors from qdrant".to_string(),
            )
        })?;

    Ok(())
}

fn payload_string(
    payload: &HashMap<String, qdrant_client::qdrant::Value>,
    key: &str,
) -> Option<String> {
    payload.get(key).and_then(|value| match &value.kind {
        Some(Kind::StringValue(text)) => Some(text.clone()),
        _ => None,
    })
}

/// Top-K similarity search inside one site's namespace, highest score first.
#[tracing::instrument(skip(query_vector))]
pub async fn query_site_vectors_query(
    site_id: uuid::Uuid,
    query_vector: Vec<f32>,
    top_k: u64,
) -> Result<Vec<ScoredChunkVector>, ServiceError> {
    let qdrant_client = get_qdrant_connection(None, None).await?;

    let search_result = qdrant_client
        .search_points(
            SearchPointsBuilder::new(get_qdrant_collection_name(), query_vector, top_k)
                .filter(site_namespace_filter(site_id))
                .with_payload(true),
        )
        .await
        .map_err(|err| {
            log::error!("Failed searching qdrant {:?}", err);
            ServiceError::InternalServerError("Failed to search the vector index".to_string())
        })?;

    let matches = search_result
        .result
        .into_iter()
        .map(|point| {
            let vector_id = point
                .id
                .and_then(|id| id.point_id_options)
                .map(|options| match options {
                    qdrant_client::qdrant::point_id::PointIdOptions::Uuid(uuid) => uuid,
                    qdrant_client::qdrant::point_id::PointIdOptions::Num(num) => num.to_string(),
                })
                .unwrap_or_default();

            ScoredChunkVector {
                vector_id,
                score: point.score,
                page_url: payload_string(&point.payload, "page_url").unwrap_or_default(),
                content: payload_string(&point.payload, "content").unwrap_or_default(),
                heading: payload_string(&point.payload, "heading"),
            }
        })
        .collect();

    Ok(matches)
}
