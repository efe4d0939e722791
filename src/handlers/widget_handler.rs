use crate::{
    data::models::{Pool, RedisPool},
    errors::{ErrorResponseBody, RateLimitResponseBody, ServiceError},
    middleware::api_key_middleware::AuthedSite,
    operators::message_operator::{
        process_chat_message, save_email_for_unanswered_query, ChatMessagePayload,
        ChatTurnResponse,
    },
};
use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use url::Url;
use utoipa::ToSchema;

/// The widget sends its page origin; the chat turn validates it against the
/// site's registered domain.
fn request_domain(req: &HttpRequest) -> Result<String, ServiceError> {
    let origin = req
        .headers()
        .get("Origin")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ServiceError::BadRequest("Origin header is required".to_string()))?;

    Url::parse(origin)
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()))
        .ok_or_else(|| ServiceError::BadRequest("Origin header is not a valid URL".to_string()))
}

fn request_ip(req: &HttpRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string()
}

/// widget_chat
///
/// One chat turn for the embedded widget: rate-limit checks, knowledge
/// search, answer generation, and persistence. When the knowledge base cannot
/// ground an answer the response is the email-capture prompt instead.
#[utoipa::path(
    post,
    path = "/widget/chat",
    context_path = "/api",
    tag = "widget",
    request_body(content = ChatMessagePayload, description = "JSON request payload with the visitor message", content_type = "application/json"),
    responses(
        (status = 200, description = "The generated answer or the email-capture prompt", body = ChatTurnResponse),
        (status = 401, description = "Invalid or missing API key", body = ErrorResponseBody),
        (status = 403, description = "Origin does not match the site domain", body = ErrorResponseBody),
        (status = 429, description = "Session or IP message limit reached", body = RateLimitResponseBody),
    ),
    security(("X-API-KEY" = []))
)]
pub async fn widget_chat(
    authed_site: AuthedSite,
    data: web::Json<ChatMessagePayload>,
    req: HttpRequest,
    pool: web::Data<Pool>,
    redis_pool: web::Data<RedisPool>,
) -> Result<HttpResponse, actix_web::Error> {
    let domain = request_domain(&req)?;
    let ip_address = request_ip(&req);

    let response = process_chat_message(
        authed_site.0,
        data.into_inner(),
        ip_address,
        domain,
        pool,
        redis_pool,
    )
    .await?;

    Ok(HttpResponse::Ok().json(response))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SaveEmailReqPayload {
    pub unanswered_question_id: uuid::Uuid,
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SaveEmailResponse {
    pub success: bool,
}

/// widget_save_email
///
/// Attach a visitor email to an unanswered question so the site team can
/// follow up.
#[utoipa::path(
    post,
    path = "/widget/email",
    context_path = "/api",
    tag = "widget",
    request_body(content = SaveEmailReqPayload, description = "JSON request payload with the email to attach", content_type = "application/json"),
    responses(
        (status = 200, description = "Email recorded", body = SaveEmailResponse),
        (status = 404, description = "Unanswered question not found", body = ErrorResponseBody),
    ),
    security(("X-API-KEY" = []))
)]
pub async fn widget_save_email(
    authed_site: AuthedSite,
    data: web::Json<SaveEmailReqPayload>,
    pool: web::Data<Pool>,
) -> Result<HttpResponse, actix_web::Error> {
    let payload = data.into_inner();

    if payload.email.trim().is_empty() || !payload.email.contains('@') {
        return Err(ServiceError::BadRequest("Invalid email address".to_string()).into());
    }

    save_email_for_unanswered_query(
        authed_site.0.id,
        payload.unanswered_question_id,
        payload.email,
        pool,
    )
    .await?;

    Ok(HttpResponse::Ok().json(SaveEmailResponse { success: true }))
}
