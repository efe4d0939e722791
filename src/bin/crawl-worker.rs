use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use signal_hook::consts::SIGTERM;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use actix_web::web;
use siteassist_server::{
    data::models::{Pool, RedisPool},
    get_env, init_observability,
    operators::{
        crawl_operator::{
            process_crawl_job, CrawlJobMessage, CRAWL_PROCESSING_KEY, CRAWL_QUEUE_KEY,
        },
        page_operator::RenderServiceFetcher,
    },
};

async fn crawl_worker(
    worker_id: usize,
    should_terminate: Arc<AtomicBool>,
    redis_pool: web::Data<RedisPool>,
    pool: web::Data<Pool>,
) {
    log::info!("Starting crawl worker {}", worker_id);

    let fetcher = RenderServiceFetcher::from_env();
    let mut broken_pipe_sleep = std::time::Duration::from_secs(10);

    loop {
        if should_terminate.load(Ordering::Relaxed) {
            log::info!("Shutting down crawl worker {}", worker_id);
            break;
        }

        let mut redis_connection = match redis_pool.get().await {
            Ok(redis_connection) => redis_connection,
            Err(err) => {
                log::error!("Failed to get redis connection: {:?}", err);
                tokio::time::sleep(broken_pipe_sleep).await;
                broken_pipe_sleep =
                    std::cmp::min(broken_pipe_sleep * 2, std::time::Duration::from_secs(300));
                continue;
            }
        };

        let payload_result: Result<Vec<String>, redis::RedisError> = redis::cmd("brpoplpush")
            .arg(CRAWL_QUEUE_KEY)
            .arg(CRAWL_PROCESSING_KEY)
            .arg(1.0)
            .query_async(&mut *redis_connection)
            .await;

        let serialized_message = if let Ok(payload) = payload_result {
            broken_pipe_sleep = std::time::Duration::from_secs(10);

            if payload.is_empty() {
                continue;
            }

            payload
                .first()
                .expect("Payload must have a first element")
                .clone()
        } else {
            log::error!("Unable to poll crawl queue {:?}", payload_result);

            if payload_result.is_err_and(|err| err.is_io_error()) {
                tokio::time::sleep(broken_pipe_sleep).await;
                broken_pipe_sleep =
                    std::cmp::min(broken_pipe_sleep * 2, std::time::Duration::from_secs(300));
            }

            continue;
        };

        let job: CrawlJobMessage = match serde_json::from_str(&serialized_message) {
            Ok(job) => job,
            Err(err) => {
                log::error!("Failed to parse crawl job message: {:?}", err);
                remove_from_processing(&redis_pool, &serialized_message).await;
                continue;
            }
        };

        log::info!("Worker {} processing crawl for site {}", worker_id, job.site_id);

        // at-most-once: a failed job is marked on the site and dropped, never
        // re-queued
        match process_crawl_job(job.clone(), &fetcher, pool.clone(), redis_pool.clone()).await {
            Ok(()) => {
                log::info!("Crawl completed for site {}", job.site_id);
            }
            Err(err) => {
                log::error!("Crawl failed for site {}: {:?}", job.site_id, err);
            }
        }

        remove_from_processing(&redis_pool, &serialized_message).await;
    }
}

async fn remove_from_processing(redis_pool: &web::Data<RedisPool>, serialized_message: &str) {
    let mut redis_conn = match redis_pool.get().await {
        Ok(conn) => conn,
        Err(err) => {
            log::error!("Failed to get redis connection for cleanup: {:?}", err);
            return;
        }
    };

    let _ = redis::cmd("LREM")
        .arg(CRAWL_PROCESSING_KEY)
        .arg(1)
        .arg(serialized_message)
        .query_async::<usize>(&mut *redis_conn)
        .await;
}

fn main() {
    dotenvy::dotenv().ok();

    let _sentry_guard = init_observability();

    let database_url = get_env!("DATABASE_URL", "DATABASE_URL should be set");

    let mgr = AsyncDieselConnectionManager::<diesel_async::AsyncPgConnection>::new(database_url);

    let pool = diesel_async::pooled_connection::deadpool::Pool::builder(mgr)
        .max_size(3)
        .build()
        .expect("Failed to create diesel_async pool");

    let web_pool = actix_web::web::Data::new(pool);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime")
        .block_on(async move {
            let redis_url = get_env!("REDIS_URL", "REDIS_URL is not set");
            let redis_connections: u32 = std::env::var("REDIS_CONNECTIONS")
                .unwrap_or("4".to_string())
                .parse()
                .unwrap_or(4);

            let redis_manager = bb8_redis::RedisConnectionManager::new(redis_url)
                .expect("Failed to connect to redis");

            let redis_pool = bb8_redis::bb8::Pool::builder()
                .max_size(redis_connections)
                .connection_timeout(std::time::Duration::from_secs(2))
                .build(redis_manager)
                .await
                .expect("Failed to create redis pool");

            let web_redis_pool = actix_web::web::Data::new(redis_pool);

            let should_terminate = Arc::new(AtomicBool::new(false));
            signal_hook::flag::register(SIGTERM, Arc::clone(&should_terminate))
                .expect("Failed to register shutdown hook");

            let concurrency: usize = std::env::var("CRAWL_CONCURRENCY")
                .unwrap_or("2".to_string())
                .parse()
                .unwrap_or(2);

            let workers: Vec<_> = (0..concurrency)
                .map(|worker_id| {
                    tokio::spawn(crawl_worker(
                        worker_id,
                        Arc::clone(&should_terminate),
                        web_redis_pool.clone(),
                        web_pool.clone(),
                    ))
                })
                .collect();

            futures_util::future::join_all(workers).await;
        });
}
