use crate::get_env;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const CRAWLER_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; SiteAssistBot/1.0; +https://siteassist.dev/bot)";

/// How long the render service waits for the network to go quiet before
/// snapshotting, and how long the DOM must hold still after that.
pub const NETWORK_IDLE_WAIT_MS: u64 = 10_000;
pub const DOM_STABLE_WAIT_MS: u64 = 3_000;

pub const BOT_BLOCK_ERROR: &str = "Bot detection - access denied";
const BOT_BLOCK_SIGNATURES: [&str; 3] = ["403", "Access Denied", "Cloudflare"];

// Boilerplate removed before text extraction. Links are collected first, so
// stripping navigation does not cost us link discovery.
const STRIP_TAGS: [&str; 7] = [
    "nav", "footer", "header", "script", "style", "noscript", "iframe",
];
const STRIP_ROLES: [&str; 3] = ["navigation", "banner", "contentinfo"];
const STRIP_CLASSES: [&str; 4] = [
    "cookie-banner",
    "cookie-consent",
    "advertisement",
    "ad-container",
];
const STRIP_IDS: [&str; 1] = ["cookie-banner"];

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PageFetchResult {
    pub url: String,
    pub title: String,
    pub content: String,
    pub links: Vec<String>,
    pub success: bool,
    pub error: Option<String>,
}

impl PageFetchResult {
    pub fn failure(url: String, error: String) -> Self {
        PageFetchResult {
            url,
            title: String::new(),
            content: String::new(),
            links: vec![],
            success: false,
            error: Some(error),
        }
    }
}

/// Seam between the crawl loop and the page-rendering backend so the loop can
/// be driven by a scripted fetcher in tests.
#[async_trait::async_trait]
pub trait Fetcher {
    async fn fetch_page(&self, url: &str, timeout: Duration) -> PageFetchResult;
}

#[derive(Serialize)]
struct RenderPageRequest<'a> {
    url: &'a str,
    user_agent: &'a str,
    timeout_ms: u64,
    network_idle_ms: u64,
    dom_stable_ms: u64,
}

#[derive(Deserialize)]
struct RenderPageResponse {
    url: String,
    status_code: u16,
    html: String,
}

/// Client for the headless render service: it navigates with the given user
/// agent, waits for client-side rendering to settle, and hands back the final
/// URL plus rendered HTML.
pub struct RenderServiceFetcher {
    client: reqwest::Client,
    origin: String,
}

impl RenderServiceFetcher {
    pub fn from_env() -> Self {
        let origin = get_env!(
            "RENDER_SERVER_ORIGIN",
            "RENDER_SERVER_ORIGIN should be set"
        )
        .to_string();
        RenderServiceFetcher {
            client: reqwest::Client::new(),
            origin,
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for RenderServiceFetcher {
    async fn fetch_page(&self, url: &str, timeout: Duration) -> PageFetchResult {
        let request = RenderPageRequest {
            url,
            user_agent: CRAWLER_USER_AGENT,
            timeout_ms: timeout.as_millis() as u64,
            network_idle_ms: NETWORK_IDLE_WAIT_MS,
            dom_stable_ms: DOM_STABLE_WAIT_MS,
        };

        // margin on top of the navigation timeout for the settle waits
        let request_timeout =
            timeout + Duration::from_millis(NETWORK_IDLE_WAIT_MS + DOM_STABLE_WAIT_MS + 5_000);

        let response = match self
            .client
            .post(format!("{}/render", self.origin))
            .timeout(request_timeout)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                log::error!("Render service request failed for {}: {:?}", url, err);
                return PageFetchResult::failure(
                    url.to_string(),
                    classify_fetch_error(None, &err.to_string()),
                );
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            return PageFetchResult::failure(
                url.to_string(),
                classify_fetch_error(Some(status), "Render service rejected the page"),
            );
        }

        let rendered: RenderPageResponse = match response.json().await {
            Ok(rendered) => rendered,
            Err(err) => {
                log::error!(
                    "Could not parse render service response for {}: {:?}",
                    url,
                    err
                );
                return PageFetchResult::failure(
                    url.to_string(),
                    "Could not parse render service response".to_string(),
                );
            }
        };

        if rendered.status_code >= 400 {
            return PageFetchResult::failure(
                url.to_string(),
                classify_fetch_error(
                    Some(rendered.status_code),
                    &format!("Page responded with status {}", rendered.status_code),
                ),
            );
        }

        let extracted = extract_page(&rendered.html, &rendered.url);
        PageFetchResult {
            url: rendered.url,
            title: extracted.title,
            content: extracted.content,
            links: extracted.links,
            success: true,
            error: None,
        }
    }
}

/// Maps a raw fetch failure to the crawl error taxonomy: anti-automation
/// blocks are reported distinctly so operators can tell them from outages.
pub fn classify_fetch_error(status_code: Option<u16>, message: &str) -> String {
    if status_code == Some(403)
        || BOT_BLOCK_SIGNATURES
            .iter()
            .any(|signature| message.contains(signature))
    {
        return BOT_BLOCK_ERROR.to_string();
    }
    message.to_string()
}

#[derive(Debug, Clone)]
pub struct ExtractedPage {
    pub title: String,
    pub content: String,
    pub links: Vec<String>,
}

/// Pulls title, outbound links, and visible text out of rendered HTML. Links
/// are collected before any stripping because most internal links live in the
/// navigation chrome that content extraction throws away.
pub fn extract_page(html: &str, base_url: &str) -> ExtractedPage {
    let document = Html::parse_document(html);

    let title_selector = Selector::parse("title").expect("static selector");
    let title = document
        .select(&title_selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    let link_selector = Selector::parse("a[href]").expect("static selector");
    let links = document
        .select(&link_selector)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| resolve_link(href, base_url))
        .collect::<Vec<String>>();

    let body_selector = Selector::parse("body").expect("static selector");
    let mut content = String::new();
    if let Some(body) = document.select(&body_selector).next() {
        push_visible_text(body, &mut content);
    }

    ExtractedPage {
        title,
        content: content.split_whitespace().collect::<Vec<&str>>().join(" "),
        links,
    }
}

fn resolve_link(href: &str, base_url: &str) -> Option<String> {
    let base = Url::parse(base_url).ok()?;
    let resolved = base.join(href).ok()?;
    match resolved.scheme() {
        "http" | "https" => Some(resolved.to_string()),
        _ => None,
    }
}

fn push_visible_text(element: ElementRef, out: &mut String) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            out.push(' ');
        } else if let Some(child_element) = ElementRef::wrap(child) {
            if !should_strip(&child_element) {
                push_visible_text(child_element, out);
            }
        }
    }
}

fn should_strip(element: &ElementRef) -> bool {
    let value = element.value();

    if STRIP_TAGS.contains(&value.name()) {
        return true;
    }
    if value
        .attr("role")
        .is_some_and(|role| STRIP_ROLES.contains(&role))
    {
        return true;
    }
    if value.attr("hidden").is_some() {
        return true;
    }
    if value.attr("style").is_some_and(|style| {
        style.contains("display: none") || style.contains("visibility: hidden")
    }) {
        return true;
    }
    if value.attr("class").is_some_and(|classes| {
        classes
            .split_whitespace()
            .any(|class| STRIP_CLASSES.contains(&class))
    }) {
        return true;
    }
    if value.attr("id").is_some_and(|id| STRIP_IDS.contains(&id)) {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html>
          <head><title>Acme Docs</title></head>
          <body>
            <nav>
              <a href="/pricing">Pricing</a>
              <a href="/docs/setup">Setup</a>
            </nav>
            <div role="banner">Banner text</div>
            <main>
              <h1>Getting started</h1>
              <p>Install the widget and paste your key.</p>
              <a href="https://acme.io/guide">Guide</a>
              <a href="mailto:help@acme.io">Mail us</a>
              <span style="display: none">secret draft</span>
              <div class="cookie-banner">We use cookies</div>
            </main>
            <footer>Copyright Acme</footer>
            <script>var x = 1;</script>
          </body>
        </html>"#;

    #[test]
    fn collects_links_before_stripping_navigation() {
        let page = extract_page(PAGE, "https://acme.io/docs");
        assert!(page.links.contains(&"https://acme.io/pricing".to_string()));
        assert!(page
            .links
            .contains(&"https://acme.io/docs/setup".to_string()));
        assert!(page.links.contains(&"https://acme.io/guide".to_string()));
    }

    #[test]
    fn drops_non_http_links() {
        let page = extract_page(PAGE, "https://acme.io/docs");
        assert!(!page.links.iter().any(|link| link.starts_with("mailto:")));
    }

    #[test]
    fn strips_boilerplate_and_hidden_content() {
        let page = extract_page(PAGE, "https://acme.io/docs");
        assert!(page.content.contains("Install the widget"));
        assert!(!page.content.contains("Pricing"));
        assert!(!page.content.contains("Banner text"));
        assert!(!page.content.contains("Copyright Acme"));
        assert!(!page.content.contains("secret draft"));
        assert!(!page.content.contains("We use cookies"));
        assert!(!page.content.contains("var x"));
    }

    #[test]
    fn extracts_title() {
        let page = extract_page(PAGE, "https://acme.io/docs");
        assert_eq!(page.title, "Acme Docs");
    }

    #[test]
    fn classifies_bot_blocks() {
        assert_eq!(
            classify_fetch_error(Some(403), "forbidden"),
            BOT_BLOCK_ERROR
        );
        assert_eq!(
            classify_fetch_error(None, "blocked by Cloudflare challenge"),
            BOT_BLOCK_ERROR
        );
        assert_eq!(
            classify_fetch_error(Some(500), "server exploded"),
            "server exploded"
        );
    }
}
