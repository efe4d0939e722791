#![allow(clippy::extra_unused_lifetimes)]

use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::schema::*;

pub type Pool = diesel_async::pooled_connection::deadpool::Pool<diesel_async::AsyncPgConnection>;
pub type RedisPool = bb8_redis::bb8::Pool<bb8_redis::RedisConnectionManager>;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Pending,
    Crawling,
    Active,
    Error,
}

impl std::fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SiteStatus::Pending => write!(f, "pending"),
            SiteStatus::Crawling => write!(f, "crawling"),
            SiteStatus::Active => write!(f, "active"),
            SiteStatus::Error => write!(f, "error"),
        }
    }
}

impl From<String> for SiteStatus {
    fn from(status: String) -> Self {
        match status.as_str() {
            "crawling" => SiteStatus::Crawling,
            "active" => SiteStatus::Active,
            "error" => SiteStatus::Error,
            _ => SiteStatus::Pending,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Queryable, Insertable, Selectable, Clone, ToSchema)]
#[diesel(table_name = sites)]
pub struct Site {
    pub id: uuid::Uuid,
    pub name: String,
    pub url: String,
    pub domain: String,
    pub status: String,
    pub additional_urls: Vec<String>,
    pub similarity_threshold: f64,
    pub allow_general_knowledge: bool,
    pub max_messages_per_session: i32,
    #[serde(skip_serializing)]
    pub api_key_hash: String,
    pub last_crawled_at: Option<chrono::NaiveDateTime>,
    pub last_error: Option<String>,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
}

impl Site {
    #[allow(clippy::too_many_arguments)]
    pub fn from_details<S: Into<String>>(
        name: S,
        url: S,
        domain: S,
        additional_urls: Vec<String>,
        similarity_threshold: Option<f64>,
        allow_general_knowledge: Option<bool>,
        max_messages_per_session: Option<i32>,
        api_key_hash: String,
    ) -> Self {
        Site {
            id: uuid::Uuid::new_v4(),
            name: name.into(),
            url: url.into(),
            domain: domain.into(),
            status: SiteStatus::Pending.to_string(),
            additional_urls,
            similarity_threshold: similarity_threshold.unwrap_or(0.35),
            allow_general_knowledge: allow_general_knowledge.unwrap_or(false),
            max_messages_per_session: max_messages_per_session.unwrap_or(15),
            api_key_hash,
            last_crawled_at: None,
            last_error: None,
            created_at: chrono::Utc::now().naive_local(),
            updated_at: chrono::Utc::now().naive_local(),
        }
    }

    pub fn status(&self) -> SiteStatus {
        SiteStatus::from(self.status.clone())
    }

    /// Seed list for a crawl: the canonical URL followed by any extra seeds.
    pub fn crawl_seed_urls(&self) -> Vec<String> {
        let mut urls = vec![self.url.clone()];
        urls.extend(self.additional_urls.iter().cloned());
        urls
    }
}

#[derive(Debug, Serialize, Deserialize, Queryable, Insertable, Selectable, Clone, ToSchema)]
#[diesel(table_name = knowledge_chunks)]
pub struct KnowledgeChunk {
    pub id: uuid::Uuid,
    pub site_id: uuid::Uuid,
    pub page_url: String,
    pub content: String,
    pub heading: Option<String>,
    pub vector_id: uuid::Uuid,
    pub chunk_index: i32,
    pub created_at: chrono::NaiveDateTime,
}

impl KnowledgeChunk {
    pub fn from_details(
        site_id: uuid::Uuid,
        page_url: String,
        content: String,
        heading: Option<String>,
        vector_id: uuid::Uuid,
        chunk_index: i32,
    ) -> Self {
        KnowledgeChunk {
            id: uuid::Uuid::new_v4(),
            site_id,
            page_url,
            content,
            heading,
            vector_id,
            chunk_index,
            created_at: chrono::Utc::now().naive_local(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Queryable, Insertable, Selectable, Clone, ToSchema)]
#[diesel(table_name = widget_sessions)]
pub struct WidgetSession {
    pub id: String,
    pub site_id: uuid::Uuid,
    pub ip_address_hash: String,
    pub user_email: Option<String>,
    pub message_count: i32,
    pub first_seen_at: chrono::NaiveDateTime,
    pub last_seen_at: chrono::NaiveDateTime,
}

impl WidgetSession {
    pub fn from_details(
        id: String,
        site_id: uuid::Uuid,
        ip_address_hash: String,
        user_email: Option<String>,
    ) -> Self {
        WidgetSession {
            id,
            site_id,
            ip_address_hash,
            user_email,
            message_count: 0,
            first_seen_at: chrono::Utc::now().naive_local(),
            last_seen_at: chrono::Utc::now().naive_local(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Queryable, Insertable, Selectable, Clone, ToSchema)]
#[diesel(table_name = chat_messages)]
pub struct ChatMessage {
    pub id: uuid::Uuid,
    pub site_id: uuid::Uuid,
    pub session_id: String,
    pub message: String,
    pub response: String,
    pub response_time_ms: i32,
    pub created_at: chrono::NaiveDateTime,
}

impl ChatMessage {
    pub fn from_details(
        site_id: uuid::Uuid,
        session_id: String,
        message: String,
        response: String,
        response_time_ms: i32,
    ) -> Self {
        ChatMessage {
            id: uuid::Uuid::new_v4(),
            site_id,
            session_id,
            message,
            response,
            response_time_ms,
            created_at: chrono::Utc::now().naive_local(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Queryable, Insertable, Selectable, Clone, ToSchema)]
#[diesel(table_name = unanswered_questions)]
pub struct UnansweredQuestion {
    pub id: uuid::Uuid,
    pub site_id: uuid::Uuid,
    pub session_id: String,
    pub user_email: Option<String>,
    pub question: String,
    pub best_match_score: f64,
    pub resolved: bool,
    pub created_at: chrono::NaiveDateTime,
}

impl UnansweredQuestion {
    pub fn from_details(
        site_id: uuid::Uuid,
        session_id: String,
        user_email: Option<String>,
        question: String,
        best_match_score: f64,
    ) -> Self {
        UnansweredQuestion {
            id: uuid::Uuid::new_v4(),
            site_id,
            session_id,
            user_email,
            question,
            best_match_score,
            resolved: false,
            created_at: chrono::Utc::now().naive_local(),
        }
    }
}

/// Live crawl progress published to Redis after every fetch. Last writer wins;
/// readers poll it from the crawl-status endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, Default, ToSchema)]
pub struct CrawlProgress {
    pub pages_discovered: usize,
    pub pages_crawled: usize,
    pub pages_processed: usize,
    pub current_url: Option<String>,
    pub errors: Vec<PageCrawlError>,
}

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct PageCrawlError {
    pub url: String,
    pub message: String,
}
