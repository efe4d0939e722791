use crate::{
    data::models::{ChatMessage, Pool, RedisPool, Site, UnansweredQuestion, WidgetSession},
    errors::{RateLimitScope, ServiceError},
    get_env,
    operators::{
        redis_operator,
        search_operator::{search_knowledge, RetrievedChunk},
    },
    utils::hash::hash_ip_address,
};
use actix_web::web;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use itertools::Itertools;
use openai_dive::v1::{
    api::Client,
    resources::chat::{
        ChatCompletionParameters, ChatMessage as CompletionMessage, ChatMessageContent, Role,
    },
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const CHAT_MODEL: &str = "gpt-4o-mini";
const CHAT_TEMPERATURE: f32 = 0.3;
const CHAT_MAX_TOKENS: u32 = 500;

/// Sentinel the generator returns when the supplied context cannot ground an
/// answer; treated exactly like an empty search result.
pub const NO_ANSWER_SENTINEL: &str = "noAnswer";

pub const FALLBACK_PROMPT: &str = "I don't have enough information to answer this question. \
Would you like to leave your email so the team can help you?";

/// Only the tail of the conversation rides along as generation context.
pub const MAX_HISTORY_MESSAGES: usize = 6;

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct ChatMessagePayload {
    /// Stable per-browser-tab identifier supplied by the widget.
    pub session_id: String,
    pub message: String,
    pub user_email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct AnswerSource {
    pub page_url: String,
    pub title: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChatTurnResponse {
    pub response: String,
    pub response_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<uuid::Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<AnswerSource>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_provide_email: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unanswered_question_id: Option<uuid::Uuid>,
}

pub struct GeneratedAnswer {
    pub answer: String,
    pub sources: Vec<AnswerSource>,
}

/// The widget only answers on pages of the site it was issued for; localhost
/// is let through so integrations can be developed locally.
pub fn validate_widget_domain(
    request_domain: &str,
    site_domain: &str,
) -> Result<(), ServiceError> {
    if request_domain == site_domain
        || request_domain == "localhost"
        || request_domain == "127.0.0.1"
    {
        return Ok(());
    }

    Err(ServiceError::DomainMismatch {
        request_domain: request_domain.to_string(),
        site_domain: site_domain.to_string(),
    })
}

/// One citation per source page, in retrieval order.
pub fn dedupe_sources(chunks: &[RetrievedChunk]) -> Vec<AnswerSource> {
    chunks
        .iter()
        .unique_by(|chunk| chunk.page_url.clone())
        .map(|chunk| AnswerSource {
            page_url: chunk.page_url.clone(),
            title: chunk.heading.clone(),
        })
        .collect()
}

pub fn build_system_prompt(site_name: &str, allow_general_knowledge: bool) -> String {
    if allow_general_knowledge {
        format!(
            "You are a helpful customer support assistant for {site_name}. Answer questions \
using the provided knowledge base context. If the context doesn't contain the answer but you \
have relevant general knowledge, you may use it BUT you MUST prefix your response with: \
\"Based on general knowledge (not specific to {site_name}): \"\n\n\
When users ask about \"this product\", \"it\", \"your service\", or similar references - they \
are asking about {site_name}.\n\n\
Rules:\n\
1. Always prioritize knowledge base context\n\
2. Keep responses under 300 words\n\
3. Be friendly and professional\n\
4. If you use general knowledge, make it very clear\n"
        )
    } else {
        format!(
            "You are a helpful customer support assistant for {site_name}. Answer questions \
ONLY using the provided knowledge base context. If context does not have the answer, return \
exactly: \"{NO_ANSWER_SENTINEL}\"\nDo not write anything else.\n\n\
When users ask about \"this product\", \"it\", \"your service\", or similar references - they \
are asking about {site_name}.\n\n\
Rules:\n\
1. If the context contains the answer, provide a clear, concise response\n\
2. Never make up information or use general knowledge\n\
3. Keep responses under 300 words\n\
4. Be friendly and professional\n\
5. Speak as you're a customer support representative of {site_name}.\n"
        )
    }
}

fn build_context_message(question: &str, chunks: &[RetrievedChunk]) -> String {
    let context = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| format!("[Source {} - {}]\n{}", i + 1, chunk.page_url, chunk.content))
        .collect::<Vec<String>>()
        .join("\n\n---\n\n");

    format!("Context:\n{}\n\nQuestion: {}", context, question)
}

/// Calls the completion model with the retrieved chunks as grounding. The
/// caller decides what to do with the no-answer sentinel.
#[tracing::instrument(skip(chunks, history))]
pub async fn generate_answer(
    question: &str,
    chunks: &[RetrievedChunk],
    allow_general_knowledge: bool,
    site_name: &str,
    history: Vec<(String, String)>,
) -> Result<GeneratedAnswer, ServiceError> {
    let llm_api_key = get_env!("OPENAI_API_KEY", "OPENAI_API_KEY should be set").to_string();
    let base_url = std::env::var("OPENAI_BASE_URL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or("https://api.openai.com/v1".to_string());

    let client = Client {
        api_key: llm_api_key,
        http_client: reqwest::Client::new(),
        base_url,
        organization: None,
        project: None,
    };

    let mut messages = vec![CompletionMessage {
        role: Role::System,
        content: ChatMessageContent::Text(build_system_prompt(
            site_name,
            allow_general_knowledge,
        )),
        tool_calls: None,
        name: None,
        tool_call_id: None,
    }];

    let history_tail = history
        .len()
        .saturating_sub(MAX_HISTORY_MESSAGES / 2);
    for (user_message, assistant_message) in history.into_iter().skip(history_tail) {
        messages.push(CompletionMessage {
            role: Role::User,
            content: ChatMessageContent::Text(user_message),
            tool_calls: None,
            name: None,
            tool_call_id: None,
        });
        messages.push(CompletionMessage {
            role: Role::Assistant,
            content: ChatMessageContent::Text(assistant_message),
            tool_calls: None,
            name: None,
            tool_call_id: None,
        });
    }

    messages.push(CompletionMessage {
        role: Role::User,
        content: ChatMessageContent::Text(build_context_message(question, chunks)),
        tool_calls: None,
        name: None,
        tool_call_id: None,
    });

    let parameters = ChatCompletionParameters {
        model: CHAT_MODEL.to_string(),
        messages,
        temperature: Some(CHAT_TEMPERATURE),
        top_p: None,
        n: None,
        stop: None,
        stream: None,
        max_tokens: Some(CHAT_MAX_TOKENS),
        presence_penalty: None,
        frequency_penalty: None,
        logit_bias: None,
        user: None,
        response_format: None,
        tools: None,
        tool_choice: None,
        logprobs: None,
        top_logprobs: None,
        seed: None,
    };

    let completion = client.chat().create(parameters).await.map_err(|err| {
        log::error!("Completion call failed: {:?}", err);
        ServiceError::InternalServerError("Failed to generate an answer".to_string())
    })?;

    let answer = <[_]>::first(&completion.choices)
        .map(|choice| match &choice.message.content {
            ChatMessageContent::Text(text) => text.clone(),
            _ => String::new(),
        })
        .unwrap_or_default();

    Ok(GeneratedAnswer {
        answer,
        sources: dedupe_sources(chunks),
    })
}

#[tracing::instrument(skip(pool))]
pub async fn upsert_widget_session_query(
    session: WidgetSession,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::widget_sessions::dsl as widget_sessions_table;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    diesel::insert_into(widget_sessions_table::widget_sessions)
        .values(&session)
        .on_conflict(widget_sessions_table::id)
        .do_update()
        .set((
            widget_sessions_table::last_seen_at.eq(chrono::Utc::now().naive_utc()),
            widget_sessions_table::ip_address_hash.eq(session.ip_address_hash.clone()),
        ))
        .execute(&mut conn)
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    if let Some(email) = session.user_email.clone() {
        diesel::update(
            widget_sessions_table::widget_sessions
                .filter(widget_sessions_table::id.eq(session.id)),
        )
        .set(widget_sessions_table::user_email.eq(email))
        .execute(&mut conn)
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;
    }

    Ok(())
}

#[tracing::instrument(skip(pool))]
pub async fn increment_session_message_count_query(
    session_id: String,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::widget_sessions::dsl as widget_sessions_table;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    diesel::update(
        widget_sessions_table::widget_sessions.filter(widget_sessions_table::id.eq(session_id)),
    )
    .set(
        widget_sessions_table::message_count.eq(widget_sessions_table::message_count + 1),
    )
    .execute(&mut conn)
    .await
    .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    Ok(())
}

#[tracing::instrument(skip(pool, message))]
pub async fn create_chat_message_query(
    message: ChatMessage,
    pool: web::Data<Pool>,
) -> Result<ChatMessage, ServiceError> {
    use crate::data::schema::chat_messages::dsl as chat_messages_table;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    diesel::insert_into(chat_messages_table::chat_messages)
        .values(&message)
        .execute(&mut conn)
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    Ok(message)
}

#[tracing::instrument(skip(pool))]
pub async fn get_session_history_query(
    session_id: String,
    site_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<Vec<(String, String)>, ServiceError> {
    use crate::data::schema::chat_messages::dsl as chat_messages_table;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    let messages: Vec<ChatMessage> = chat_messages_table::chat_messages
        .filter(chat_messages_table::session_id.eq(session_id))
        .filter(chat_messages_table::site_id.eq(site_id))
        .order_by(chat_messages_table::created_at.asc())
        .select(ChatMessage::as_select())
        .load(&mut conn)
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    Ok(messages
        .into_iter()
        .map(|message| (message.message, message.response))
        .collect())
}

#[tracing::instrument(skip(pool, question))]
pub async fn create_unanswered_question_query(
    question: UnansweredQuestion,
    pool: web::Data<Pool>,
) -> Result<UnansweredQuestion, ServiceError> {
    use crate::data::schema::unanswered_questions::dsl as unanswered_questions_table;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    diesel::insert_into(unanswered_questions_table::unanswered_questions)
        .values(&question)
        .execute(&mut conn)
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    Ok(question)
}

/// Attaches a visitor email to a previously captured unanswered question and
/// to the widget session, for human follow-up.
#[tracing::instrument(skip(pool, email))]
pub async fn save_email_for_unanswered_query(
    site_id: uuid::Uuid,
    unanswered_question_id: uuid::Uuid,
    email: String,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::unanswered_questions::dsl as unanswered_questions_table;
    use crate::data::schema::widget_sessions::dsl as widget_sessions_table;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    let session_id: String = diesel::update(
        unanswered_questions_table::unanswered_questions
            .filter(unanswered_questions_table::id.eq(unanswered_question_id))
            .filter(unanswered_questions_table::site_id.eq(site_id)),
    )
    .set(unanswered_questions_table::user_email.eq(email.clone()))
    .returning(unanswered_questions_table::session_id)
    .get_result(&mut conn)
    .await
    .map_err(|_| ServiceError::NotFound("Unanswered question not found".to_string()))?;

    diesel::update(
        widget_sessions_table::widget_sessions.filter(widget_sessions_table::id.eq(session_id)),
    )
    .set(widget_sessions_table::user_email.eq(email))
    .execute(&mut conn)
    .await
    .map_err(|e| ServiceError::InternalServerError(e.to_string()))?;

    Ok(())
}

async fn check_rate_limits(
    session_id: &str,
    session_cap: i64,
    ip_address: &str,
    redis_pool: &web::Data<RedisPool>,
) -> Result<(), ServiceError> {
    let session_status =
        redis_operator::check_session_limit(session_id, session_cap, redis_pool).await?;
    if !session_status.allowed {
        return Err(ServiceError::RateLimited {
            retry_after_secs: session_status.retry_after_secs,
            scope: RateLimitScope::Session,
        });
    }

    let ip_status = redis_operator::check_ip_limit(ip_address, redis_pool).await?;
    if !ip_status.allowed {
        return Err(ServiceError::RateLimited {
            retry_after_secs: ip_status.retry_after_secs,
            scope: RateLimitScope::Ip,
        });
    }

    Ok(())
}

/// A non-answer still consumes rate-limit budget, otherwise a visitor could
/// probe the knowledge base for free indefinitely.
async fn increment_limits(
    session_id: &str,
    ip_address: &str,
    pool: web::Data<Pool>,
    redis_pool: &web::Data<RedisPool>,
) -> Result<(), ServiceError> {
    redis_operator::increment_session_counter(session_id, redis_pool).await?;
    redis_operator::increment_ip_counter(ip_address, redis_pool).await?;
    increment_session_message_count_query(session_id.to_string(), pool).await?;
    Ok(())
}

async fn handle_unanswered(
    site: &Site,
    payload: &ChatMessagePayload,
    ip_address: &str,
    best_score: f32,
    started_at: std::time::Instant,
    pool: web::Data<Pool>,
    redis_pool: &web::Data<RedisPool>,
) -> Result<ChatTurnResponse, ServiceError> {
    let unanswered = create_unanswered_question_query(
        UnansweredQuestion::from_details(
            site.id,
            payload.session_id.clone(),
            payload.user_email.clone(),
            payload.message.clone(),
            best_score as f64,
        ),
        pool.clone(),
    )
    .await?;

    increment_limits(&payload.session_id, ip_address, pool, redis_pool).await?;

    Ok(ChatTurnResponse {
        response: FALLBACK_PROMPT.to_string(),
        response_time_ms: started_at.elapsed().as_millis() as i64,
        message_id: None,
        sources: None,
        can_provide_email: Some(true),
        unanswered_question_id: Some(unanswered.id),
    })
}

/// The request-level state machine for one widget message. Terminal outcomes
/// are an answered turn or an unanswered-question capture; policy violations
/// (domain mismatch, rate limits) surface as typed errors before any model
/// call is made.
#[tracing::instrument(skip(site, payload, pool, redis_pool))]
pub async fn process_chat_message(
    site: Site,
    payload: ChatMessagePayload,
    ip_address: String,
    request_domain: String,
    pool: web::Data<Pool>,
    redis_pool: web::Data<RedisPool>,
) -> Result<ChatTurnResponse, ServiceError> {
    let started_at = std::time::Instant::now();

    if payload.session_id.trim().is_empty() {
        return Err(ServiceError::BadRequest("session_id is required".to_string()));
    }
    if payload.message.trim().is_empty() {
        return Err(ServiceError::BadRequest("message is required".to_string()));
    }

    validate_widget_domain(&request_domain, &site.domain)?;

    check_rate_limits(
        &payload.session_id,
        site.max_messages_per_session as i64,
        &ip_address,
        &redis_pool,
    )
    .await?;

    upsert_widget_session_query(
        WidgetSession::from_details(
            payload.session_id.clone(),
            site.id,
            hash_ip_address(&ip_address),
            payload.user_email.clone(),
        ),
        pool.clone(),
    )
    .await?;

    // anchor the query to the site so short questions still retrieve well
    let enriched_query = format!("{}: {}", site.name, payload.message);
    let search_result =
        search_knowledge(site.id, enriched_query, site.similarity_threshold as f32).await?;

    if !search_result.has_answer {
        return handle_unanswered(
            &site,
            &payload,
            &ip_address,
            search_result.best_score,
            started_at,
            pool,
            &redis_pool,
        )
        .await;
    }

    let history =
        get_session_history_query(payload.session_id.clone(), site.id, pool.clone()).await?;

    let generated = generate_answer(
        &payload.message,
        &search_result.chunks,
        site.allow_general_knowledge,
        &site.name,
        history,
    )
    .await?;

    if generated.answer.trim() == NO_ANSWER_SENTINEL || generated.answer.trim().is_empty() {
        return handle_unanswered(
            &site,
            &payload,
            &ip_address,
            search_result.best_score,
            started_at,
            pool,
            &redis_pool,
        )
        .await;
    }

    let response_time_ms = started_at.elapsed().as_millis() as i64;
    let chat_message = create_chat_message_query(
        ChatMessage::from_details(
            site.id,
            payload.session_id.clone(),
            payload.message.clone(),
            generated.answer.clone(),
            response_time_ms as i32,
        ),
        pool.clone(),
    )
    .await?;

    increment_limits(&payload.session_id, &ip_address, pool, &redis_pool).await?;

    Ok(ChatTurnResponse {
        response: generated.answer,
        response_time_ms,
        message_id: Some(chat_message.id),
        sources: Some(generated.sources),
        can_provide_email: None,
        unanswered_question_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_domain_is_accepted() {
        assert!(validate_widget_domain("acme.io", "acme.io").is_ok());
    }

    #[test]
    fn localhost_is_always_accepted() {
        assert!(validate_widget_domain("localhost", "acme.io").is_ok());
        assert!(validate_widget_domain("127.0.0.1", "acme.io").is_ok());
    }

    #[test]
    fn foreign_domain_is_rejected() {
        let err = validate_widget_domain("evil.io", "acme.io").unwrap_err();
        match err {
            ServiceError::DomainMismatch {
                request_domain,
                site_domain,
            } => {
                assert_eq!(request_domain, "evil.io");
                assert_eq!(site_domain, "acme.io");
            }
            other => panic!("expected domain mismatch, got {:?}", other),
        }
    }

    #[test]
    fn subdomain_is_not_the_registered_domain() {
        assert!(validate_widget_domain("app.acme.io", "acme.io").is_err());
    }

    #[test]
    fn sources_are_deduplicated_by_page() {
        let chunks = vec![
            RetrievedChunk {
                content: "a".to_string(),
                page_url: "/a".to_string(),
                heading: Some("A".to_string()),
                score: 0.9,
            },
            RetrievedChunk {
                content: "a2".to_string(),
                page_url: "/a".to_string(),
                heading: Some("A2".to_string()),
                score: 0.8,
            },
            RetrievedChunk {
                content: "b".to_string(),
                page_url: "/b".to_string(),
                heading: None,
                score: 0.7,
            },
        ];

        let sources = dedupe_sources(&chunks);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].page_url, "/a");
        assert_eq!(sources[0].title.as_deref(), Some("A"));
        assert_eq!(sources[1].page_url, "/b");
    }

    #[test]
    fn knowledge_only_prompt_carries_the_sentinel() {
        let prompt = build_system_prompt("Acme", false);
        assert!(prompt.contains(NO_ANSWER_SENTINEL));
        assert!(prompt.contains("Acme"));
    }

    #[test]
    fn general_knowledge_prompt_requires_the_prefix() {
        let prompt = build_system_prompt("Acme", true);
        assert!(!prompt.contains(NO_ANSWER_SENTINEL));
        assert!(prompt.contains("Based on general knowledge"));
    }

    #[test]
    fn context_message_numbers_the_sources() {
        let chunks = vec![
            RetrievedChunk {
                content: "first".to_string(),
                page_url: "https://acme.io/a".to_string(),
                heading: None,
                score: 0.9,
            },
            RetrievedChunk {
                content: "second".to_string(),
                page_url: "https://acme.io/b".to_string(),
                heading: None,
                score: 0.8,
            },
        ];

        let message = build_context_message("how do I install?", &chunks);
        assert!(message.contains("[Source 1 - https://acme.io/a]"));
        assert!(message.contains("[Source 2 - https://acme.io/b]"));
        assert!(message.ends_with("Question: how do I install?"));
    }
}
