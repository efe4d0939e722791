use crate::{
    data::models::{
        CrawlProgress, KnowledgeChunk, PageCrawlError, Pool, RedisPool, SiteStatus,
    },
    errors::ServiceError,
    operators::{
        chunk_operator::bulk_create_knowledge_chunks_query,
        model_operator::create_embeddings,
        page_operator::Fetcher,
        parse_operator::{chunk_text, DEFAULT_CHUNK_OVERLAP_TOKENS, DEFAULT_CHUNK_SIZE_TOKENS},
        qdrant_operator::{bulk_upsert_chunk_vectors_query, ChunkVectorRecord},
        redis_operator,
        site_operator::update_site_status_query,
    },
};
use actix_web::web;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};
use url::Url;

pub const CRAWL_QUEUE_KEY: &str = "crawl_queue";
pub const CRAWL_PROCESSING_KEY: &str = "crawl_processing";

/// Queue payload for one crawl job. Ephemeral: lives only on the Redis list,
/// delivered at most once.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CrawlJobMessage {
    pub site_id: uuid::Uuid,
    pub urls: Vec<String>,
}

/// The three independent crawl budgets plus the fetch-level knobs. Any one
/// budget alone is insufficient: slow pages need the wall clock, fast pages
/// need the page cap, deep irrelevant trees need the depth cap.
#[derive(Debug, Clone, Copy)]
pub struct CrawlBudgets {
    pub max_pages: usize,
    pub max_depth: usize,
    pub total_timeout: Duration,
    pub page_timeout: Duration,
    pub politeness_delay: Duration,
    pub min_pages_for_success: usize,
}

impl CrawlBudgets {
    pub fn from_env() -> Self {
        fn env_usize(name: &str, default: usize) -> usize {
            std::env::var(name)
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(default)
        }

        CrawlBudgets {
            max_pages: env_usize("MAX_CRAWL_PAGES", 50),
            max_depth: env_usize("MAX_CRAWL_DEPTH", 2),
            total_timeout: Duration::from_secs(env_usize("CRAWL_TIMEOUT_SECONDS", 600) as u64),
            page_timeout: Duration::from_secs(env_usize("PAGE_TIMEOUT_SECONDS", 30) as u64),
            politeness_delay: Duration::from_millis(
                env_usize("CRAWL_DELAY_MILLIS", 1000) as u64,
            ),
            min_pages_for_success: env_usize("MIN_PAGES_FOR_SUCCESS", 1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawledPage {
    pub url: String,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Default)]
pub struct CrawlOutcome {
    pub pages: Vec<CrawledPage>,
    pub errors: Vec<PageCrawlError>,
    pub pages_discovered: usize,
    pub pages_crawled: usize,
}

/// Canonical form used for the visited/discovered sets: fragment dropped,
/// trailing slash dropped. Unparseable input is passed through untouched.
pub fn normalize_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            let mut normalized = parsed.to_string();
            if normalized.ends_with('/') {
                normalized.pop();
            }
            normalized
        }
        Err(_) => url.to_string(),
    }
}

/// Crawl scope is a single domain; everything else is dropped on the floor.
pub fn filter_same_domain_links(links: &[String], base_url: &str) -> Vec<String> {
    let base_domain = match Url::parse(base_url).ok().and_then(|url| {
        url.host_str().map(|host| host.to_string())
    }) {
        Some(domain) => domain,
        None => return vec![],
    };

    links
        .iter()
        .filter(|link| {
            Url::parse(link)
                .ok()
                .and_then(|url| url.host_str().map(|host| host.to_string()))
                .is_some_and(|domain| domain == base_domain)
        })
        .cloned()
        .collect()
}

pub fn insufficient_content_error(pages_processed: usize, min_pages: usize) -> String {
    format!(
        "Insufficient pages crawled: {}/{}",
        pages_processed, min_pages
    )
}

/// Breadth-first traversal from the seed URLs. The loop owns all of its state
/// (visited set, discovered set, FIFO queue); nothing is shared across jobs.
/// Progress is published to Redis after every fetch but a cache hiccup never
/// aborts the crawl.
pub async fn run_crawl_loop<F: Fetcher + Sync>(
    site_id: uuid::Uuid,
    seed_urls: &[String],
    budgets: CrawlBudgets,
    fetcher: &F,
    redis_pool: Option<&web::Data<RedisPool>>,
) -> CrawlOutcome {
    let mut visited: HashSet<String> = HashSet::new();
    let mut discovered: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();

    for seed in seed_urls {
        let normalized = normalize_url(seed);
        if discovered.insert(normalized.clone()) {
            queue.push_back((normalized, 0));
        }
    }

    let mut pages: Vec<CrawledPage> = vec![];
    let mut errors: Vec<PageCrawlError> = vec![];
    let started_at = Instant::now();

    log::info!(
        "Starting crawl for site {} with {} seed urls",
        site_id,
        seed_urls.len()
    );

    while !queue.is_empty() && visited.len() < budgets.max_pages {
        if started_at.elapsed() >= budgets.total_timeout {
            log::info!("Crawl wall clock exhausted for site {}", site_id);
            break;
        }

        let (url, depth) = queue.pop_front().expect("queue is non-empty");

        if visited.contains(&url) || depth > budgets.max_depth {
            continue;
        }
        visited.insert(url.clone());

        log::info!("Crawling {} at depth {} for site {}", url, depth, site_id);

        let result = fetcher.fetch_page(&url, budgets.page_timeout).await;

        if result.success && !result.content.trim().is_empty() {
            if depth < budgets.max_depth {
                for link in filter_same_domain_links(&result.links, &url) {
                    let normalized = normalize_url(&link);
                    if discovered.insert(normalized.clone()) {
                        queue.push_back((normalized, depth + 1));
                    }
                }
            }

            pages.push(CrawledPage {
                url: result.url,
                title: result.title,
                content: result.content,
            });
        } else {
            let message = result
                .error
                .unwrap_or_else(|| "Page yielded no content".to_string());
            log::info!("Failed to crawl {}: {}", url, message);
            errors.push(PageCrawlError {
                url: url.clone(),
                message,
            });
        }

        if let Some(redis_pool) = redis_pool {
            let progress = CrawlProgress {
                pages_discovered: discovered.len(),
                pages_crawled: visited.len(),
                pages_processed: pages.len(),
                current_url: Some(url),
                errors: errors.clone(),
            };
            if let Err(err) = redis_operator::set_crawl_progress(site_id, &progress, redis_pool).await
            {
                log::error!("Failed to publish crawl progress for {}: {}", site_id, err);
            }
        }

        tokio::time::sleep(budgets.politeness_delay).await;
    }

    CrawlOutcome {
        pages_discovered: discovered.len(),
        pages_crawled: visited.len(),
        pages,
        errors,
    }
}

/// Chunk, embed, and store everything a crawl produced. An embedding failure
/// that survives its retry budget propagates and fails the job: a site with
/// half a vector set is worse than a site marked errored.
async fn ingest_pages(
    site_id: uuid::Uuid,
    pages: &[CrawledPage],
    pool: web::Data<Pool>,
) -> Result<usize, ServiceError> {
    let mut spans: Vec<(String, Option<String>, String, usize)> = vec![];
    for page in pages {
        let heading = if page.title.trim().is_empty() {
            None
        } else {
            Some(page.title.clone())
        };
        for span in chunk_text(
            &page.content,
            DEFAULT_CHUNK_SIZE_TOKENS,
            DEFAULT_CHUNK_OVERLAP_TOKENS,
        ) {
            spans.push((page.url.clone(), heading.clone(), span.content, span.index));
        }
    }

    log::info!("Generated {} chunks for site {}", spans.len(), site_id);

    if spans.is_empty() {
        return Ok(0);
    }

    let texts: Vec<String> = spans.iter().map(|(_, _, content, _)| content.clone()).collect();
    let embeddings = create_embeddings(texts).await?;

    let mut records: Vec<ChunkVectorRecord> = Vec::with_capacity(spans.len());
    let mut chunks: Vec<KnowledgeChunk> = Vec::with_capacity(spans.len());

    for ((page_url, heading, content, index), values) in spans.into_iter().zip(embeddings) {
        let vector_id = uuid::Uuid::new_v4();

        records.push(ChunkVectorRecord {
            vector_id,
            values,
            site_id,
            page_url: page_url.clone(),
            content: content.clone(),
            heading: heading.clone(),
        });

        chunks.push(KnowledgeChunk::from_details(
            site_id,
            page_url,
            content,
            heading,
            vector_id,
            index as i32,
        ));
    }

    bulk_upsert_chunk_vectors_query(site_id, records).await?;
    let stored = bulk_create_knowledge_chunks_query(chunks, pool).await?;

    log::info!("Stored {} knowledge chunks for site {}", stored, site_id);

    Ok(stored)
}

/// Runs one crawl job end to end: BFS, ingestion, status transitions, final
/// progress. At most one attempt; a failure marks the site errored and the
/// job is never re-queued.
pub async fn process_crawl_job<F: Fetcher + Sync>(
    message: CrawlJobMessage,
    fetcher: &F,
    pool: web::Data<Pool>,
    redis_pool: web::Data<RedisPool>,
) -> Result<(), ServiceError> {
    let site_id = message.site_id;
    let budgets = CrawlBudgets::from_env();

    update_site_status_query(site_id, SiteStatus::Crawling, None, pool.clone()).await?;

    let outcome = run_crawl_loop(site_id, &message.urls, budgets, fetcher, Some(&redis_pool)).await;

    log::info!(
        "Crawl finished for site {}: {} pages, {} errors",
        site_id,
        outcome.pages.len(),
        outcome.errors.len()
    );

    let result = if outcome.pages.len() < budgets.min_pages_for_success {
        Err(ServiceError::InternalServerError(
            insufficient_content_error(outcome.pages.len(), budgets.min_pages_for_success),
        ))
    } else {
        ingest_pages(site_id, &outcome.pages, pool.clone()).await.map(|_| ())
    };

    let mut final_progress = CrawlProgress {
        pages_discovered: outcome.pages_discovered,
        pages_crawled: outcome.pages_crawled,
        pages_processed: outcome.pages.len(),
        current_url: None,
        errors: outcome.errors,
    };

    match result {
        Ok(()) => {
            update_site_status_query(site_id, SiteStatus::Active, None, pool).await?;
        }
        Err(ref err) => {
            let message = err.to_string();
            final_progress.errors.push(PageCrawlError {
                url: "crawl".to_string(),
                message: message.clone(),
            });
            update_site_status_query(site_id, SiteStatus::Error, Some(message), pool).await?;
        }
    }

    if let Err(err) = redis_operator::set_crawl_progress(site_id, &final_progress, &redis_pool).await
    {
        log::error!("Failed to publish final progress for {}: {}", site_id, err);
    }

    result
}

/// Admission control for new crawl jobs. The cooldown key in Redis is the
/// lock that guarantees at most one live crawl per site; the orchestrator
/// itself never has to coordinate.
pub async fn enqueue_crawl_job(
    site_id: uuid::Uuid,
    current_status: SiteStatus,
    urls: Vec<String>,
    pool: web::Data<Pool>,
    redis_pool: web::Data<RedisPool>,
) -> Result<(), ServiceError> {
    if current_status == SiteStatus::Crawling {
        return Err(ServiceError::CrawlInProgress);
    }

    if !redis_operator::can_start_crawl(site_id, &redis_pool).await? {
        return Err(ServiceError::CrawlCooldown);
    }

    let message = CrawlJobMessage { site_id, urls };
    let serialized = serde_json::to_string(&message).map_err(|_| {
        ServiceError::InternalServerError("Failed to serialize crawl job".to_string())
    })?;

    let mut conn = redis_pool
        .get()
        .await
        .map_err(|err| ServiceError::InternalServerError(err.to_string()))?;

    redis::cmd("lpush")
        .arg(CRAWL_QUEUE_KEY)
        .arg(&serialized)
        .query_async::<()>(&mut *conn)
        .await
        .map_err(|err| {
            log::error!("Error publishing message to crawl_queue: {:?}", err);
            ServiceError::InternalServerError(
                "Error publishing message to crawl_queue".to_string(),
            )
        })?;

    update_site_status_query(site_id, SiteStatus::Crawling, None, pool).await?;
    redis_operator::record_crawl_start(site_id, &redis_pool).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::page_operator::{PageFetchResult, BOT_BLOCK_ERROR};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct ScriptedFetcher {
        responses: HashMap<String, PageFetchResult>,
        fetched: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn new(responses: Vec<PageFetchResult>) -> Self {
            ScriptedFetcher {
                responses: responses
                    .into_iter()
                    .map(|result| (result.url.clone(), result))
                    .collect(),
                fetched: Mutex::new(vec![]),
            }
        }

        fn fetch_count(&self) -> usize {
            self.fetched.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch_page(&self, url: &str, _timeout: Duration) -> PageFetchResult {
            self.fetched.lock().unwrap().push(url.to_string());
            self.responses
                .get(url)
                .cloned()
                .unwrap_or_else(|| PageFetchResult::failure(url.to_string(), "404".to_string()))
        }
    }

    fn page(url: &str, links: Vec<&str>) -> PageFetchResult {
        PageFetchResult {
            url: url.to_string(),
            title: format!("Title of {}", url),
            content: format!("Body text for {}", url),
            links: links.into_iter().map(|l| l.to_string()).collect(),
            success: true,
            error: None,
        }
    }

    fn blocked(url: &str) -> PageFetchResult {
        PageFetchResult::failure(url.to_string(), BOT_BLOCK_ERROR.to_string())
    }

    fn test_budgets() -> CrawlBudgets {
        CrawlBudgets {
            max_pages: 50,
            max_depth: 2,
            total_timeout: Duration::from_secs(60),
            page_timeout: Duration::from_secs(5),
            politeness_delay: Duration::ZERO,
            min_pages_for_success: 1,
        }
    }

    #[test]
    fn normalize_strips_fragment_and_trailing_slash() {
        assert_eq!(
            normalize_url("https://acme.io/docs/#install"),
            "https://acme.io/docs"
        );
        assert_eq!(normalize_url("https://acme.io/"), "https://acme.io");
        assert_eq!(normalize_url("not a url"), "not a url");
    }

    #[test]
    fn same_domain_filter_drops_foreign_hosts() {
        let links = vec![
            "https://acme.io/pricing".to_string(),
            "https://other.io/pricing".to_string(),
            "garbage".to_string(),
        ];
        assert_eq!(
            filter_same_domain_links(&links, "https://acme.io"),
            vec!["https://acme.io/pricing".to_string()]
        );
    }

    #[tokio::test]
    async fn crawls_seed_and_depth_one_links() {
        // scenario: one seed with three same-domain links, depth capped at 1
        let fetcher = ScriptedFetcher::new(vec![
            page(
                "https://acme.io",
                vec![
                    "https://acme.io/a",
                    "https://acme.io/b",
                    "https://acme.io/c",
                    "https://elsewhere.io/skip",
                ],
            ),
            page("https://acme.io/a", vec!["https://acme.io/deeper"]),
            page("https://acme.io/b", vec![]),
            page("https://acme.io/c", vec![]),
        ]);

        let mut budgets = test_budgets();
        budgets.max_depth = 1;

        let outcome = run_crawl_loop(
            uuid::Uuid::new_v4(),
            &["https://acme.io".to_string()],
            budgets,
            &fetcher,
            None,
        )
        .await;

        assert_eq!(outcome.pages_crawled, 4);
        assert_eq!(outcome.pages.len(), 4);
        assert_eq!(outcome.pages_discovered, 4);
        assert!(outcome.errors.is_empty());
        // links found at the depth cap must not be followed
        assert!(!fetcher
            .fetched
            .lock()
            .unwrap()
            .contains(&"https://acme.io/deeper".to_string()));
    }

    #[tokio::test]
    async fn all_pages_blocked_yields_zero_processed() {
        let fetcher = ScriptedFetcher::new(vec![blocked("https://acme.io")]);

        let outcome = run_crawl_loop(
            uuid::Uuid::new_v4(),
            &["https://acme.io".to_string()],
            test_budgets(),
            &fetcher,
            None,
        )
        .await;

        assert_eq!(outcome.pages.len(), 0);
        assert_eq!(outcome.pages_crawled, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].message, BOT_BLOCK_ERROR);
        assert!(outcome.pages.len() < test_budgets().min_pages_for_success);
    }

    #[tokio::test]
    async fn page_budget_caps_visited_count() {
        let fetcher = ScriptedFetcher::new(vec![
            page(
                "https://acme.io",
                vec![
                    "https://acme.io/a",
                    "https://acme.io/b",
                    "https://acme.io/c",
                ],
            ),
            page("https://acme.io/a", vec![]),
            page("https://acme.io/b", vec![]),
            page("https://acme.io/c", vec![]),
        ]);

        let mut budgets = test_budgets();
        budgets.max_pages = 2;

        let outcome = run_crawl_loop(
            uuid::Uuid::new_v4(),
            &["https://acme.io".to_string()],
            budgets,
            &fetcher,
            None,
        )
        .await;

        assert_eq!(outcome.pages_crawled, 2);
        assert!(outcome.pages_crawled <= budgets.max_pages);
    }

    #[tokio::test]
    async fn urls_are_never_enqueued_twice() {
        // both child pages link back to the seed and to each other
        let fetcher = ScriptedFetcher::new(vec![
            page(
                "https://acme.io",
                vec!["https://acme.io/a", "https://acme.io/b"],
            ),
            page(
                "https://acme.io/a",
                vec!["https://acme.io", "https://acme.io/b"],
            ),
            page(
                "https://acme.io/b",
                vec!["https://acme.io", "https://acme.io/a#section"],
            ),
        ]);

        let outcome = run_crawl_loop(
            uuid::Uuid::new_v4(),
            &["https://acme.io".to_string()],
            test_budgets(),
            &fetcher,
            None,
        )
        .await;

        assert_eq!(outcome.pages_discovered, 3);
        assert_eq!(outcome.pages_crawled, 3);
        assert_eq!(fetcher.fetch_count(), 3);
    }

    #[tokio::test]
    async fn wall_clock_ceiling_stops_the_loop() {
        let fetcher = ScriptedFetcher::new(vec![page("https://acme.io", vec![])]);

        let mut budgets = test_budgets();
        budgets.total_timeout = Duration::ZERO;

        let outcome = run_crawl_loop(
            uuid::Uuid::new_v4(),
            &["https://acme.io".to_string()],
            budgets,
            &fetcher,
            None,
        )
        .await;

        assert_eq!(outcome.pages_crawled, 0);
        assert_eq!(fetcher.fetch_count(), 0);
    }

    #[test]
    fn insufficient_content_message_names_both_counts() {
        let message = insufficient_content_error(0, 1);
        assert!(message.contains("0/1"));
    }
}
