use crate::{
    data::models::{Pool, Site, SiteStatus},
    errors::ServiceError,
};
use actix_web::web;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

#[tracing::instrument(skip(pool))]
pub async fn get_site_by_id_query(
    site_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<Site, ServiceError> {
    use crate::data::schema::sites::dsl as sites_table;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    sites_table::sites
        .filter(sites_table::id.eq(site_id))
        .select(Site::as_select())
        .first(&mut conn)
        .await
        .map_err(|_| ServiceError::NotFound("Site not found".to_string()))
}

#[tracing::instrument(skip(pool, api_key_hash))]
pub async fn get_site_by_api_key_hash_query(
    api_key_hash: String,
    pool: web::Data<Pool>,
) -> Result<Site, ServiceError> {
    use crate::data::schema::sites::dsl as sites_table;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    sites_table::sites
        .filter(sites_table::api_key_hash.eq(api_key_hash))
        .select(Site::as_select())
        .first(&mut conn)
        .await
        .map_err(|_| ServiceError::Unauthorized)
}

#[tracing::instrument(skip(pool, site))]
pub async fn create_site_query(site: Site, pool: web::Data<Pool>) -> Result<Site, ServiceError> {
    use crate::data::schema::sites::dsl as sites_table;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    diesel::insert_into(sites_table::sites)
        .values(&site)
        .execute(&mut conn)
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    Ok(site)
}

/// The only writer of site status. `error_message` lands in `last_error` so
/// the admin UI can show why a crawl died; a successful crawl clears it and
/// stamps `last_crawled_at`.
#[tracing::instrument(skip(pool))]
pub async fn update_site_status_query(
    site_id: uuid::Uuid,
    status: SiteStatus,
    error_message: Option<String>,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::sites::dsl as sites_table;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    if status == SiteStatus::Active {
        diesel::update(sites_table::sites.filter(sites_table::id.eq(site_id)))
            .set((
                sites_table::status.eq(status.to_string()),
                sites_table::last_error.eq(error_message),
                sites_table::last_crawled_at.eq(Some(chrono::Utc::now().naive_utc())),
            ))
            .execute(&mut conn)
            .await
            .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;
    } else {
        diesel::update(sites_table::sites.filter(sites_table::id.eq(site_id)))
            .set((
                sites_table::status.eq(status.to_string()),
                sites_table::last_error.eq(error_message),
            ))
            .execute(&mut conn)
            .await
            .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;
    }

    Ok(())
}

#[tracing::instrument(skip(pool))]
pub async fn delete_site_query(
    site_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::sites::dsl as sites_table;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    diesel::delete(sites_table::sites.filter(sites_table::id.eq(site_id)))
        .execute(&mut conn)
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    Ok(())
}
