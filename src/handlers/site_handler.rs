use crate::{
    data::models::{CrawlProgress, Pool, RedisPool, Site},
    errors::{ErrorResponseBody, ServiceError},
    operators::{
        chunk_operator::delete_site_chunks_query,
        crawl_operator::enqueue_crawl_job,
        qdrant_operator::delete_site_vectors_query,
        redis_operator,
        site_operator::{create_site_query, delete_site_query, get_site_by_id_query},
    },
    utils::hash::hash_api_key,
};
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use url::Url;
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateSiteReqPayload {
    /// Display name used in widget prompts; defaults to the domain.
    pub name: Option<String>,
    /// Canonical URL of the site to crawl.
    pub url: String,
    /// Extra seed URLs crawled alongside the canonical one.
    pub additional_urls: Option<Vec<String>>,
    /// Minimum similarity score for retrieved chunks to count as grounding.
    pub similarity_threshold: Option<f64>,
    /// Whether answers may fall back to the model's general knowledge.
    pub allow_general_knowledge: Option<bool>,
    /// Per-session chat message cap enforced by the widget API.
    pub max_messages_per_session: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SiteCreatedResponse {
    pub site: Site,
    /// Widget API key, shown exactly once; only its hash is stored.
    pub api_key: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CrawlStatusResponse {
    pub status: String,
    pub last_error: Option<String>,
    pub progress: Option<CrawlProgress>,
}

fn domain_from_url(url: &str) -> Result<String, ServiceError> {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(|host| host.to_string()))
        .ok_or_else(|| ServiceError::BadRequest(format!("Invalid site url: {}", url)))
}

/// create_site
///
/// Register a site and enqueue its initial crawl. The response carries the
/// widget API key in plaintext; it cannot be recovered later.
#[utoipa::path(
    post,
    path = "/sites",
    context_path = "/api",
    tag = "site",
    request_body(content = CreateSiteReqPayload, description = "JSON request payload to register a site", content_type = "application/json"),
    responses(
        (status = 200, description = "The registered site and its widget API key", body = SiteCreatedResponse),
        (status = 400, description = "Service error relating to registering the site", body = ErrorResponseBody),
    )
)]
pub async fn create_site(
    data: web::Json<CreateSiteReqPayload>,
    pool: web::Data<Pool>,
    redis_pool: web::Data<RedisPool>,
) -> Result<HttpResponse, actix_web::Error> {
    let payload = data.into_inner();
    let domain = domain_from_url(&payload.url)?;

    let api_key = format!("sa-{}", uuid::Uuid::new_v4().simple());

    let site = create_site_query(
        Site::from_details(
            payload.name.unwrap_or_else(|| domain.clone()),
            payload.url,
            domain,
            payload.additional_urls.unwrap_or_default(),
            payload.similarity_threshold,
            payload.allow_general_knowledge,
            payload.max_messages_per_session,
            hash_api_key(&api_key),
        ),
        pool.clone(),
    )
    .await?;

    enqueue_crawl_job(
        site.id,
        site.status(),
        site.crawl_seed_urls(),
        pool,
        redis_pool,
    )
    .await?;

    Ok(HttpResponse::Ok().json(SiteCreatedResponse { site, api_key }))
}

/// recrawl_site
///
/// Drop the site's knowledge base and enqueue a fresh crawl. Refused while a
/// crawl is running or during the recrawl cooldown window.
#[utoipa::path(
    post,
    path = "/sites/{site_id}/recrawl",
    context_path = "/api",
    tag = "site",
    params(("site_id" = uuid::Uuid, description = "The ID of the site to recrawl.")),
    responses(
        (status = 204, description = "Recrawl accepted"),
        (status = 409, description = "A crawl is already in progress", body = ErrorResponseBody),
        (status = 429, description = "Site was crawled too recently", body = ErrorResponseBody),
    )
)]
pub async fn recrawl_site(
    site_id: web::Path<uuid::Uuid>,
    pool: web::Data<Pool>,
    redis_pool: web::Data<RedisPool>,
) -> Result<HttpResponse, actix_web::Error> {
    let site_id = site_id.into_inner();
    let site = get_site_by_id_query(site_id, pool.clone()).await?;

    // admission checks run before the wipe so a refused recrawl keeps the
    // existing knowledge base intact
    if site.status() == crate::data::models::SiteStatus::Crawling {
        return Err(ServiceError::CrawlInProgress.into());
    }
    if !redis_operator::can_start_crawl(site_id, &redis_pool).await? {
        return Err(ServiceError::CrawlCooldown.into());
    }

    delete_site_vectors_query(site_id).await?;
    delete_site_chunks_query(site_id, pool.clone()).await?;

    enqueue_crawl_job(
        site_id,
        site.status(),
        site.crawl_seed_urls(),
        pool,
        redis_pool,
    )
    .await?;

    Ok(HttpResponse::NoContent().finish())
}

/// get_crawl_status
///
/// Site lifecycle status plus live crawl progress while a job is running.
#[utoipa::path(
    get,
    path = "/sites/{site_id}/crawl-status",
    context_path = "/api",
    tag = "site",
    params(("site_id" = uuid::Uuid, description = "The ID of the site to poll.")),
    responses(
        (status = 200, description = "Current status and cached progress", body = CrawlStatusResponse),
        (status = 404, description = "Site not found", body = ErrorResponseBody),
    )
)]
pub async fn get_crawl_status(
    site_id: web::Path<uuid::Uuid>,
    pool: web::Data<Pool>,
    redis_pool: web::Data<RedisPool>,
) -> Result<HttpResponse, actix_web::Error> {
    let site_id = site_id.into_inner();
    let site = get_site_by_id_query(site_id, pool).await?;
    let progress = redis_operator::get_crawl_progress(site_id, &redis_pool).await?;

    Ok(HttpResponse::Ok().json(CrawlStatusResponse {
        status: site.status,
        last_error: site.last_error,
        progress,
    }))
}

/// delete_site
///
/// Remove a site and everything derived from it: vectors, chunk records, and
/// cached progress.
#[utoipa::path(
    delete,
    path = "/sites/{site_id}",
    context_path = "/api",
    tag = "site",
    params(("site_id" = uuid::Uuid, description = "The ID of the site to delete.")),
    responses(
        (status = 204, description = "Site deleted"),
        (status = 404, description = "Site not found", body = ErrorResponseBody),
    )
)]
pub async fn delete_site(
    site_id: web::Path<uuid::Uuid>,
    pool: web::Data<Pool>,
    redis_pool: web::Data<RedisPool>,
) -> Result<HttpResponse, actix_web::Error> {
    let site_id = site_id.into_inner();
    get_site_by_id_query(site_id, pool.clone()).await?;

    delete_site_vectors_query(site_id).await?;
    delete_site_chunks_query(site_id, pool.clone()).await?;
    redis_operator::clear_crawl_progress(site_id, &redis_pool).await?;
    delete_site_query(site_id, pool).await?;

    Ok(HttpResponse::NoContent().finish())
}

/// health_check
#[utoipa::path(
    get,
    path = "/",
    tag = "health",
    responses((status = 200, description = "Service is up")),
)]
pub async fn health_check() -> Result<HttpResponse, actix_web::Error> {
    Ok(HttpResponse::Ok().finish())
}
