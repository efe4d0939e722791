#![allow(clippy::get_first)]

use crate::errors::{custom_json_error_handler, ServiceError};
use actix_cors::Cors;
use actix_web::{
    middleware::Logger,
    web::{self, PayloadConfig},
    App, HttpServer,
};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_redoc::{Redoc, Servable};

pub mod data;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod operators;
pub mod utils;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");
pub const SECONDS_IN_MINUTE: u64 = 60;
pub const SECONDS_IN_HOUR: u64 = 60 * SECONDS_IN_MINUTE;

#[macro_export]
macro_rules! get_env {
    ($name:expr, $message:expr) => {{
        lazy_static::lazy_static! {
            static ref ENV_VAR: String = {
                std::env::var($name).expect($message)
            };
        }
        ENV_VAR.as_str()
    }};
}

fn run_migrations(url: &str) {
    use diesel::prelude::*;

    // Run migrations in sync because the async migration story is still thin
    let mut conn = diesel::pg::PgConnection::establish(url).expect("Failed to connect to database");
    conn.run_pending_migrations(MIGRATIONS)
        .expect("Failed to run migrations");
}

/// Shared tracing/sentry bootstrap used by the API server and the workers.
pub fn init_observability() -> Option<sentry::ClientInitGuard> {
    let sentry_url = std::env::var("SENTRY_URL");
    if let Ok(sentry_url) = sentry_url {
        let guard = sentry::init((
            sentry_url,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                traces_sample_rate: 1.0,
                ..Default::default()
            },
        ));

        tracing_subscriber::Registry::default()
            .with(sentry::integrations::tracing::layer())
            .with(
                tracing_subscriber::fmt::layer().with_filter(
                    EnvFilter::from_default_env()
                        .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
                ),
            )
            .init();

        log::info!("Sentry monitoring enabled");
        Some(guard)
    } else {
        tracing_subscriber::Registry::default()
            .with(
                tracing_subscriber::fmt::layer().with_filter(
                    EnvFilter::from_default_env()
                        .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
                ),
            )
            .init();

        None
    }
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi
            .components
            .as_mut()
            .expect("Safe to expect since the component was already registered");
        components.add_security_scheme(
            "X-API-KEY",
            SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-API-KEY"))),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "SiteAssist API",
        description = "SiteAssist OpenAPI specification. Covers site registration, crawl management, and the public widget chat surface.",
        license(
            name = "MIT",
        ),
        version = "0.1.0",
    ),
    servers(
        (url = "http://localhost:8090",
        description = "Local development server"),
    ),
    modifiers(&SecurityAddon),
    paths(
        handlers::site_handler::create_site,
        handlers::site_handler::recrawl_site,
        handlers::site_handler::get_crawl_status,
        handlers::site_handler::delete_site,
        handlers::site_handler::health_check,
        handlers::widget_handler::widget_chat,
        handlers::widget_handler::widget_save_email,
    ),
    components(
        schemas(
            data::models::Site,
            data::models::SiteStatus,
            data::models::KnowledgeChunk,
            data::models::WidgetSession,
            data::models::ChatMessage,
            data::models::UnansweredQuestion,
            data::models::CrawlProgress,
            data::models::PageCrawlError,
            handlers::site_handler::CreateSiteReqPayload,
            handlers::site_handler::SiteCreatedResponse,
            handlers::site_handler::CrawlStatusResponse,
            handlers::widget_handler::SaveEmailReqPayload,
            handlers::widget_handler::SaveEmailResponse,
            operators::message_operator::ChatMessagePayload,
            operators::message_operator::ChatTurnResponse,
            operators::message_operator::AnswerSource,
            operators::search_operator::RetrievedChunk,
            operators::search_operator::KnowledgeSearchResult,
            errors::ErrorResponseBody,
            errors::RateLimitResponseBody,
        )
    ),
    tags(
        (name = "site", description = "Site registration and crawl lifecycle management."),
        (name = "widget", description = "Public chat surface consumed by the embeddable widget."),
        (name = "health", description = "Health check endpoint."),
    ),
)]
pub struct ApiDoc;

pub fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    let _sentry_guard = init_observability();

    let database_url = get_env!("DATABASE_URL", "DATABASE_URL should be set");
    let redis_url = get_env!("REDIS_URL", "REDIS_URL should be set");

    log::info!("Running migrations");
    run_migrations(database_url);

    actix_web::rt::System::new().block_on(async move {
        let mgr = AsyncDieselConnectionManager::<diesel_async::AsyncPgConnection>::new(database_url);

        let pool = diesel_async::pooled_connection::deadpool::Pool::builder(mgr)
            .max_size(10)
            .build()
            .expect("Failed to create diesel_async pool");

        log::info!("Connecting to redis");
        let redis_manager =
            bb8_redis::RedisConnectionManager::new(redis_url).expect("Failed to connect to redis");

        let redis_connections: u32 = std::env::var("REDIS_CONNECTIONS")
            .unwrap_or("30".to_string())
            .parse()
            .unwrap_or(30);

        let redis_pool = bb8_redis::bb8::Pool::builder()
            .max_size(redis_connections)
            .build(redis_manager)
            .await
            .expect("Failed to create redis pool");

        if std::env::var("CREATE_QDRANT_COLLECTION").unwrap_or("true".to_string()) != "false" {
            log::info!("Creating qdrant collection");
            let _ = operators::qdrant_operator::create_knowledge_collection_query()
                .await
                .map_err(|err| {
                    log::error!("Failed to create qdrant collection: {:?}", err);
                });
        }

        let json_cfg = web::JsonConfig::default()
            .limit(1_048_576)
            .error_handler(custom_json_error_handler);

        HttpServer::new(move || {
            App::new()
                .app_data(json_cfg.clone())
                .app_data(
                    web::PathConfig::default().error_handler(|err, _req| {
                        ServiceError::BadRequest(format!("{}", err)).into()
                    }),
                )
                .app_data(web::Data::new(pool.clone()))
                .app_data(web::Data::new(redis_pool.clone()))
                .app_data(PayloadConfig::new(1_048_576))
                .wrap(Cors::permissive())
                .wrap(
                    Logger::new("%r %s %b %{Referer}i %{User-Agent}i %T")
                        .exclude("/")
                        .exclude("/metrics"),
                )
                .service(Redoc::with_url("/redoc", ApiDoc::openapi()))
                .service(
                    web::resource("/")
                        .route(web::get().to(handlers::site_handler::health_check)),
                )
                .service(
                    web::scope("/api")
                        .service(
                            web::scope("/sites")
                                .service(
                                    web::resource("").route(
                                        web::post().to(handlers::site_handler::create_site),
                                    ),
                                )
                                .service(web::resource("/{site_id}").route(
                                    web::delete().to(handlers::site_handler::delete_site),
                                ))
                                .service(web::resource("/{site_id}/recrawl").route(
                                    web::post().to(handlers::site_handler::recrawl_site),
                                ))
                                .service(web::resource("/{site_id}/crawl-status").route(
                                    web::get().to(handlers::site_handler::get_crawl_status),
                                )),
                        )
                        .service(
                            web::scope("/widget")
                                .wrap(
                                    middleware::api_key_middleware::ApiKeyMiddlewareFactory,
                                )
                                .service(web::resource("/chat").route(
                                    web::post().to(handlers::widget_handler::widget_chat),
                                ))
                                .service(web::resource("/email").route(
                                    web::post().to(handlers::widget_handler::widget_save_email),
                                )),
                        ),
                )
        })
        .bind(("0.0.0.0", 8090))?
        .run()
        .await
    })
}
