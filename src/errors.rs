use actix_web::{error::ResponseError, HttpResponse};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::convert::From;
use utoipa::ToSchema;
use uuid::Error as ParseError;

#[derive(Serialize, Deserialize, Debug, Display, ToSchema)]
#[schema(example = json!({"message": "Bad Request"}))]
pub struct ErrorResponseBody {
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct RateLimitResponseBody {
    pub message: String,
    /// Seconds until the limited counter expires and requests are accepted again.
    pub retry_after_secs: u64,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    #[display(fmt = "session")]
    Session,
    #[display(fmt = "ip")]
    Ip,
}

#[derive(Debug, Display, Clone)]
pub enum ServiceError {
    #[display(fmt = "Internal Server Error: {_0}")]
    InternalServerError(String),

    #[display(fmt = "BadRequest: {_0}")]
    BadRequest(String),

    #[display(fmt = "Unauthorized")]
    Unauthorized,

    #[display(fmt = "Not Found: {_0}")]
    NotFound(String),

    #[display(fmt = "Widget origin {request_domain} does not match site domain {site_domain}")]
    DomainMismatch {
        request_domain: String,
        site_domain: String,
    },

    #[display(fmt = "Rate limited ({scope}), retry after {retry_after_secs}s")]
    RateLimited {
        retry_after_secs: u64,
        scope: RateLimitScope,
    },

    #[display(fmt = "A crawl is already in progress for this site")]
    CrawlInProgress,

    #[display(fmt = "Site was crawled recently, try again later")]
    CrawlCooldown,

    #[display(fmt = "Json Deserialization Error: {_0}")]
    JsonDeserializeError(String),
}

impl ResponseError for ServiceError {
    fn error_response(&self) -> HttpResponse {
        if let ServiceError::InternalServerError(_) = self {
            sentry::capture_message(&format!("Error {:?}", self), sentry::Level::Error);
        }
        match self {
            ServiceError::InternalServerError(ref message) => HttpResponse::InternalServerError()
                .json(ErrorResponseBody {
                    message: message.to_string(),
                }),
            ServiceError::BadRequest(ref message) => {
                HttpResponse::BadRequest().json(ErrorResponseBody {
                    message: message.to_string(),
                })
            }
            ServiceError::Unauthorized => HttpResponse::Unauthorized().json(ErrorResponseBody {
                message: "Invalid or missing API key".to_string(),
            }),
            ServiceError::NotFound(ref message) => {
                HttpResponse::NotFound().json(ErrorResponseBody {
                    message: format!("Not Found: {}", message),
                })
            }
            ServiceError::DomainMismatch { .. } => {
                HttpResponse::Forbidden().json(ErrorResponseBody {
                    message: self.to_string(),
                })
            }
            ServiceError::RateLimited {
                retry_after_secs,
                scope,
            } => HttpResponse::TooManyRequests()
                .insert_header(("Retry-After", retry_after_secs.to_string()))
                .json(RateLimitResponseBody {
                    message: format!("Message limit reached for this {}", scope),
                    retry_after_secs: *retry_after_secs,
                }),
            ServiceError::CrawlInProgress => HttpResponse::Conflict().json(ErrorResponseBody {
                message: self.to_string(),
            }),
            ServiceError::CrawlCooldown => {
                HttpResponse::TooManyRequests().json(ErrorResponseBody {
                    message: self.to_string(),
                })
            }
            ServiceError::JsonDeserializeError(ref message) => {
                HttpResponse::BadRequest().json(ErrorResponseBody {
                    message: format!("Json Deserialization Error: {}", message),
                })
            }
        }
    }
}

// lets handlers return early on malformed UUID path params with a stable message
impl From<ParseError> for ServiceError {
    fn from(_: ParseError) -> ServiceError {
        ServiceError::BadRequest("Invalid UUID".into())
    }
}

pub fn custom_json_error_handler(
    err: actix_web::error::JsonPayloadError,
    _req: &actix_web::HttpRequest,
) -> actix_web::Error {
    ServiceError::JsonDeserializeError(err.to_string()).into()
}
