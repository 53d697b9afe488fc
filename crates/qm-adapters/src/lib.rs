//! Quote source contract + paginated HTML quote-site adapter.

use std::time::Duration;

use async_trait::async_trait;
use qm_core::ScrapedRow;
use qm_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

pub const CRATE_NAME: &str = "qm-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
}

/// One quote extracted from a listing page, before serial assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuote {
    pub quote: String,
    pub link: String,
    pub author: String,
}

/// Source collaborator: yields ordered scraped rows for one slug.
///
/// A failed page fetch ends that slug's scan; it is never surfaced as an
/// error past this boundary.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn scrape_slug(&self, http: &HttpFetcher, slug: &str) -> Vec<ScrapedRow>;
}

#[derive(Debug, Clone, Copy)]
pub struct ScrapeLimits {
    pub max_pages: usize,
    pub page_delay: Duration,
}

impl Default for ScrapeLimits {
    fn default() -> Self {
        Self {
            max_pages: 10,
            page_delay: Duration::from_secs(1),
        }
    }
}

/// First path segment of a quote-site URL names the scrape target.
pub fn extract_slug(input: &str) -> Option<String> {
    let parsed = Url::parse(input.trim()).ok()?;
    parsed
        .path_segments()?
        .find(|segment| !segment.is_empty())
        .map(ToString::to_string)
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn first_href(element: ElementRef<'_>, anchor: &Selector) -> Option<String> {
    element
        .select(anchor)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| text_or_none(href.to_string()))
}

/// Extract quote/link/author triples from one listing page.
///
/// Containers without any recoverable quote text are skipped; a missing
/// author byline falls back to the anonymous label.
pub fn parse_quote_page(html: &str) -> Result<Vec<PageQuote>, AdapterError> {
    let container_sel = parse_selector("div.q-wrapper")?;
    let quote_div_sel = parse_selector("div.quote-a")?;
    let quote_anchor_sel = parse_selector("a.quote-a")?;
    let anchor_sel = parse_selector("a")?;
    let byline_sel = parse_selector("div.author-p.bylines")?;
    let author_link_sel = parse_selector("p.author-p a")?;

    let document = Html::parse_document(html);
    let mut quotes = Vec::new();

    for container in document.select(&container_sel) {
        let quote_div = container.select(&quote_div_sel).next();
        let quote_text = match quote_div {
            Some(div) => element_text(div),
            None => container.select(&quote_anchor_sel).next().and_then(element_text),
        };
        let Some(quote) = quote_text else {
            continue;
        };

        let link = quote_div
            .and_then(|div| first_href(div, &anchor_sel))
            .or_else(|| first_href(container, &quote_anchor_sel))
            .unwrap_or_default();

        let author = container
            .select(&byline_sel)
            .next()
            .and_then(element_text)
            .map(|byline| byline.replace("by ", "").trim().to_string())
            .or_else(|| container.select(&author_link_sel).next().and_then(element_text))
            .unwrap_or_else(|| "Anonymous".to_string());

        quotes.push(PageQuote {
            quote,
            link,
            author,
        });
    }

    Ok(quotes)
}

/// Paginated HTML quote-site adapter.
#[derive(Debug, Clone)]
pub struct QuoteSiteAdapter {
    base_url: String,
    limits: ScrapeLimits,
}

impl Default for QuoteSiteAdapter {
    fn default() -> Self {
        Self::new("https://quotefancy.com", ScrapeLimits::default())
    }
}

impl QuoteSiteAdapter {
    pub fn new(base_url: impl Into<String>, limits: ScrapeLimits) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            limits,
        }
    }

    pub fn page_url(&self, slug: &str, page_number: usize) -> String {
        format!("{}/{}/page/{}", self.base_url, slug, page_number)
    }
}

#[async_trait]
impl QuoteSource for QuoteSiteAdapter {
    fn source_id(&self) -> &str {
        &self.base_url
    }

    async fn scrape_slug(&self, http: &HttpFetcher, slug: &str) -> Vec<ScrapedRow> {
        let mut rows = Vec::new();
        let mut serial = 1u32;

        for page_number in 1..=self.limits.max_pages {
            let page_url = self.page_url(slug, page_number);
            let page = match http.fetch_bytes(slug, &page_url).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(slug, page_number, %err, "page fetch failed; ending scan for slug");
                    break;
                }
            };

            let html = String::from_utf8_lossy(&page.body);
            let page_quotes = match parse_quote_page(&html) {
                Ok(page_quotes) => page_quotes,
                Err(err) => {
                    warn!(slug, page_number, %err, "page parse failed; ending scan for slug");
                    break;
                }
            };
            if page_quotes.is_empty() {
                break;
            }

            for item in page_quotes {
                rows.push(ScrapedRow {
                    serial,
                    quote: item.quote,
                    link: item.link,
                    author: item.author,
                });
                serial += 1;
            }

            tokio::time::sleep(self.limits.page_delay).await;
        }

        info!(slug, rows = rows.len(), "slug scan complete");
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING_PAGE: &str = r#"
        <html><body>
          <div class="q-wrapper">
            <div class="quote-a">
              <a href="/marie-curie-quotes/1">Nothing in life is to be feared, it is only to be understood.</a>
            </div>
            <div class="author-p bylines">by Marie Curie</div>
          </div>
          <div class="q-wrapper">
            <a class="quote-a" href="/einstein-quotes/7">Imagination is more important than knowledge.</a>
            <p class="author-p"><a>Albert Einstein</a></p>
          </div>
          <div class="q-wrapper">
            <div class="quote-a">Unattributed wisdom.</div>
          </div>
          <div class="q-wrapper">
            <div class="not-a-quote">decoration only</div>
          </div>
        </body></html>
    "#;

    #[test]
    fn listing_page_yields_quotes_in_document_order() {
        let quotes = parse_quote_page(LISTING_PAGE).expect("parse");
        assert_eq!(quotes.len(), 3);

        assert_eq!(
            quotes[0],
            PageQuote {
                quote: "Nothing in life is to be feared, it is only to be understood.".to_string(),
                link: "/marie-curie-quotes/1".to_string(),
                author: "Marie Curie".to_string(),
            }
        );
        assert_eq!(quotes[1].quote, "Imagination is more important than knowledge.");
        assert_eq!(quotes[1].link, "/einstein-quotes/7");
        assert_eq!(quotes[1].author, "Albert Einstein");
    }

    #[test]
    fn missing_byline_falls_back_to_anonymous() {
        let quotes = parse_quote_page(LISTING_PAGE).expect("parse");
        assert_eq!(quotes[2].author, "Anonymous");
        assert_eq!(quotes[2].link, "");
    }

    #[test]
    fn containers_without_quote_text_are_skipped() {
        let quotes = parse_quote_page(r#"<div class="q-wrapper"><span>no quote</span></div>"#)
            .expect("parse");
        assert!(quotes.is_empty());
    }

    #[test]
    fn slug_is_the_first_path_segment() {
        assert_eq!(
            extract_slug("https://quotefancy.com/marie-curie-quotes"),
            Some("marie-curie-quotes".to_string())
        );
        assert_eq!(
            extract_slug("https://quotefancy.com/motivational-quotes/page/3"),
            Some("motivational-quotes".to_string())
        );
        assert_eq!(extract_slug("https://quotefancy.com/"), None);
        assert_eq!(extract_slug("not a url"), None);
    }

    #[test]
    fn page_urls_follow_the_site_layout() {
        let adapter = QuoteSiteAdapter::default();
        assert_eq!(
            adapter.page_url("marie-curie-quotes", 2),
            "https://quotefancy.com/marie-curie-quotes/page/2"
        );
    }
}
