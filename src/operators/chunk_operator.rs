use crate::{
    data::models::{KnowledgeChunk, Pool},
    errors::ServiceError,
};
use actix_web::web;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

// Keeps a big crawl's insert well under the Postgres bind-parameter cap.
const INSERT_BATCH_SIZE: usize = 500;

/// Bulk-creates the durable chunk records after a successful crawl. Chunks
/// are append-only; the whole set is replaced on recrawl.
#[tracing::instrument(skip(pool, chunks))]
pub async fn bulk_create_knowledge_chunks_query(
    chunks: Vec<KnowledgeChunk>,
    pool: web::Data<Pool>,
) -> Result<usize, ServiceError> {
    use crate::data::schema::knowledge_chunks::dsl as knowledge_chunks_table;

    if chunks.is_empty() {
        return Ok(0);
    }

    let mut conn = pool
        .get()
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    let mut inserted = 0;
    for batch in chunks.chunks(INSERT_BATCH_SIZE) {
        inserted += diesel::insert_into(knowledge_chunks_table::knowledge_chunks)
            .values(batch)
            .execute(&mut conn)
            .await
            .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;
    }

    Ok(inserted)
}

#[tracing::instrument(skip(pool))]
pub async fn delete_site_chunks_query(
    site_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::knowledge_chunks::dsl as knowledge_chunks_table;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    diesel::delete(
        knowledge_chunks_table::knowledge_chunks
            .filter(knowledge_chunks_table::site_id.eq(site_id)),
    )
    .execute(&mut conn)
    .await
    .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    Ok(())
}
