//! Source adapter contracts and the four adapter families: selector-driven
//! HTML scraping, JSON APIs, RSS/Atom feeds and the paged ticketing API.

pub mod norsk;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kultur_core::{Category, EventDraft};
use kultur_fetch::{FetchClient, FetchError, FetchedPage};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "kultur-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Html,
    Json,
    Rss,
    Ticketing,
}

/// One entry of the source registry (`sources.yaml`). Field-extraction rules
/// live here so adding a venue is a config change, not a new adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    /// Lower number wins canonical selection inside a duplicate cluster.
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub urls: Vec<String>,
    /// Fallback venue for single-venue sources whose pages omit it.
    #[serde(default)]
    pub default_venue: Option<String>,
    #[serde(default)]
    pub default_category: Option<String>,
    #[serde(default)]
    pub html: Option<HtmlRules>,
    #[serde(default)]
    pub json: Option<JsonRules>,
    #[serde(default)]
    pub ticketing: Option<TicketingRules>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_priority() -> i64 {
    100
}

/// CSS selectors for one HTML program page. `item` scopes a repeating event
/// card; the rest select within a card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtmlRules {
    pub item: String,
    pub title: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    /// Selector for the detail link; `href` is taken from the first match.
    #[serde(default)]
    pub link: Option<String>,
    /// Selector for the event image; `src` is taken from the first match.
    #[serde(default)]
    pub image: Option<String>,
}

/// JSON pointers for an API source: `items` points at the event array, the
/// rest are pointers within one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRules {
    pub items: String,
    pub title: String,
    /// RFC 3339 start timestamp.
    pub starts_at: String,
    #[serde(default)]
    pub ends_at: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub ticket_url: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub price_text: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketingRules {
    #[serde(default = "default_page_param")]
    pub page_param: String,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_max_pages() -> u32 {
    20
}

#[derive(Debug, Clone, Copy)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source {source_id} misconfigured: {reason}")]
    Misconfigured { source_id: String, reason: String },
    #[error("invalid selector `{0}`")]
    Selector(String),
    #[error("malformed payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Pull the raw documents for a source. The default implementation GETs
    /// every configured URL; the ticketing adapter overrides it for paging.
    async fn fetch(
        &self,
        http: &FetchClient,
        ctx: &AdapterContext,
        spec: &SourceSpec,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let mut pages = Vec::with_capacity(spec.urls.len());
        for url in &spec.urls {
            pages.push(http.get(ctx.run_id, &spec.source_id, url).await?);
        }
        Ok(pages)
    }

    fn parse(&self, spec: &SourceSpec, page: &FetchedPage) -> Result<Vec<EventDraft>, AdapterError>;
}

pub fn adapter_for(kind: SourceKind) -> Box<dyn SourceAdapter> {
    match kind {
        SourceKind::Html => Box::new(HtmlProgramAdapter),
        SourceKind::Json => Box::new(JsonApiAdapter),
        SourceKind::Rss => Box::new(RssFeedAdapter),
        SourceKind::Ticketing => Box::new(TicketingAdapter),
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(collapse_whitespace(trimmed))
    }
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|_| AdapterError::Selector(selector.to_string()))
}

fn select_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|node| text_or_none(node.text().collect::<String>()))
}

fn select_attr(scope: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|node| node.value().attr(attr))
        .and_then(|value| text_or_none(value.to_string()))
}

/// Resolve a possibly-relative href against the page it came from.
fn absolutize(base_url: &str, href: &str) -> Option<String> {
    let base = Url::parse(base_url).ok()?;
    base.join(href).ok().map(|joined| joined.to_string())
}

fn default_category_for(spec: &SourceSpec) -> Option<Category> {
    spec.default_category.as_deref().and_then(Category::parse)
}

/// Selector-driven scraper for program pages with repeating event cards.
#[derive(Debug, Clone, Copy)]
pub struct HtmlProgramAdapter;

impl HtmlProgramAdapter {
    fn parse_item(
        item: ElementRef<'_>,
        spec: &SourceSpec,
        rules: &HtmlRules,
        page: &FetchedPage,
    ) -> Result<Option<EventDraft>, AdapterError> {
        let title_sel = parse_selector(&rules.title)?;
        let Some(title) = select_text(item, &title_sel) else {
            return Ok(None);
        };

        let date_text = match &rules.date {
            Some(selector) => select_text(item, &parse_selector(selector)?),
            None => None,
        };
        let date_text = date_text.unwrap_or_else(|| item.text().collect::<String>());

        let (starts_at, ends_at) =
            match norsk::parse_date_range(&date_text, page.fetched_at) {
                Some((start, end)) => (Some(start), Some(end)),
                None => (norsk::parse_event_datetime(&date_text, page.fetched_at), None),
            };
        let Some(starts_at) = starts_at else {
            debug!(source_id = %spec.source_id, %title, "skipping item without parsable date");
            return Ok(None);
        };

        let venue = match &rules.venue {
            Some(selector) => select_text(item, &parse_selector(selector)?),
            None => None,
        }
        .or_else(|| spec.default_venue.clone());

        let description = match &rules.description {
            Some(selector) => select_text(item, &parse_selector(selector)?),
            None => None,
        };

        let price = match &rules.price {
            Some(selector) => select_text(item, &parse_selector(selector)?),
            None => None,
        }
        .and_then(|text| norsk::parse_price(&text));

        let url = match &rules.link {
            Some(selector) => select_attr(item, &parse_selector(selector)?, "href"),
            None => None,
        }
        .and_then(|href| absolutize(&page.final_url, &href));

        let image_url = match &rules.image {
            Some(selector) => select_attr(item, &parse_selector(selector)?, "src"),
            None => None,
        }
        .and_then(|src| absolutize(&page.final_url, &src));

        Ok(Some(EventDraft {
            source_id: spec.source_id.clone(),
            source_event_id: None,
            title,
            description,
            starts_at,
            ends_at,
            venue,
            address: None,
            category: default_category_for(spec),
            url,
            ticket_url: None,
            image_url,
            organizer: Some(spec.display_name.clone()),
            price_min_nok: price.as_ref().and_then(|p| p.min_nok),
            price_text: price.map(|p| p.text),
            fetched_at: page.fetched_at,
        }))
    }
}

#[async_trait]
impl SourceAdapter for HtmlProgramAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Html
    }

    fn parse(&self, spec: &SourceSpec, page: &FetchedPage) -> Result<Vec<EventDraft>, AdapterError> {
        let rules = spec.html.as_ref().ok_or_else(|| AdapterError::Misconfigured {
            source_id: spec.source_id.clone(),
            reason: "html source without html rules".to_string(),
        })?;
        let body = String::from_utf8_lossy(&page.body);
        let document = Html::parse_document(&body);
        let item_sel = parse_selector(&rules.item)?;

        let mut drafts = Vec::new();
        for item in document.select(&item_sel) {
            if let Some(draft) = Self::parse_item(item, spec, rules, page)? {
                drafts.push(draft);
            }
        }
        Ok(drafts)
    }
}

fn pointer_str<'a>(item: &'a JsonValue, pointer: &str) -> Option<&'a str> {
    item.pointer(pointer).and_then(JsonValue::as_str)
}

fn pointer_string(item: &JsonValue, pointer: &Option<String>) -> Option<String> {
    pointer
        .as_deref()
        .and_then(|p| pointer_str(item, p))
        .and_then(|s| text_or_none(s.to_string()))
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Adapter for JSON APIs described by per-source JSON pointers.
#[derive(Debug, Clone, Copy)]
pub struct JsonApiAdapter;

impl JsonApiAdapter {
    fn parse_item(
        item: &JsonValue,
        spec: &SourceSpec,
        rules: &JsonRules,
        page: &FetchedPage,
    ) -> Option<EventDraft> {
        let title = pointer_str(item, &rules.title)
            .and_then(|s| text_or_none(s.to_string()))?;
        let starts_at = pointer_str(item, &rules.starts_at).and_then(parse_rfc3339)?;
        let ends_at = rules
            .ends_at
            .as_deref()
            .and_then(|p| pointer_str(item, p))
            .and_then(parse_rfc3339);

        let price_text = pointer_string(item, &rules.price_text);
        let price = price_text.as_deref().and_then(norsk::parse_price);
        let category = pointer_string(item, &rules.category)
            .as_deref()
            .and_then(Category::parse)
            .or_else(|| default_category_for(spec));

        Some(EventDraft {
            source_id: spec.source_id.clone(),
            source_event_id: rules.id.as_deref().and_then(|p| {
                item.pointer(p).map(|v| match v {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                })
            }),
            title,
            description: pointer_string(item, &rules.description),
            starts_at,
            ends_at,
            venue: pointer_string(item, &rules.venue).or_else(|| spec.default_venue.clone()),
            address: pointer_string(item, &rules.address),
            category,
            url: pointer_string(item, &rules.url)
                .and_then(|href| absolutize(&page.final_url, &href)),
            ticket_url: pointer_string(item, &rules.ticket_url)
                .and_then(|href| absolutize(&page.final_url, &href)),
            image_url: pointer_string(item, &rules.image)
                .and_then(|href| absolutize(&page.final_url, &href)),
            organizer: Some(spec.display_name.clone()),
            price_min_nok: price.as_ref().and_then(|p| p.min_nok),
            price_text: price.map(|p| p.text),
            fetched_at: page.fetched_at,
        })
    }
}

#[async_trait]
impl SourceAdapter for JsonApiAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Json
    }

    fn parse(&self, spec: &SourceSpec, page: &FetchedPage) -> Result<Vec<EventDraft>, AdapterError> {
        let rules = spec.json.as_ref().ok_or_else(|| AdapterError::Misconfigured {
            source_id: spec.source_id.clone(),
            reason: "json source without json rules".to_string(),
        })?;
        let root: JsonValue = serde_json::from_slice(&page.body)
            .map_err(|err| AdapterError::Payload(err.to_string()))?;
        let items = root
            .pointer(&rules.items)
            .and_then(JsonValue::as_array)
            .ok_or_else(|| {
                AdapterError::Payload(format!("no array at pointer {}", rules.items))
            })?;

        let mut drafts = Vec::with_capacity(items.len());
        for item in items {
            match Self::parse_item(item, spec, rules, page) {
                Some(draft) => drafts.push(draft),
                None => {
                    debug!(source_id = %spec.source_id, "skipping item without title or start time")
                }
            }
        }
        Ok(drafts)
    }
}

/// RSS/Atom adapter. Event start time is mined out of the entry text when
/// possible; the publish date is a last resort.
#[derive(Debug, Clone, Copy)]
pub struct RssFeedAdapter;

#[async_trait]
impl SourceAdapter for RssFeedAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Rss
    }

    fn parse(&self, spec: &SourceSpec, page: &FetchedPage) -> Result<Vec<EventDraft>, AdapterError> {
        let feed = feed_rs::parser::parse(&page.body[..])
            .map_err(|err| AdapterError::Payload(err.to_string()))?;

        let mut drafts = Vec::with_capacity(feed.entries.len());
        for entry in feed.entries {
            let Some(title) = entry
                .title
                .as_ref()
                .and_then(|t| text_or_none(t.content.clone()))
            else {
                continue;
            };
            let summary = entry
                .summary
                .as_ref()
                .and_then(|t| text_or_none(strip_tags(&t.content)));

            let text_date = norsk::parse_event_datetime(&title, page.fetched_at).or_else(|| {
                summary
                    .as_deref()
                    .and_then(|s| norsk::parse_event_datetime(s, page.fetched_at))
            });
            let Some(starts_at) = text_date.or(entry.published).or(entry.updated) else {
                debug!(source_id = %spec.source_id, %title, "skipping entry without any date");
                continue;
            };

            let url = entry
                .links
                .first()
                .map(|link| link.href.clone())
                .and_then(|href| absolutize(&page.final_url, &href));

            drafts.push(EventDraft {
                source_id: spec.source_id.clone(),
                source_event_id: text_or_none(entry.id.clone()),
                title,
                description: summary,
                starts_at,
                ends_at: None,
                venue: spec.default_venue.clone(),
                address: None,
                category: default_category_for(spec),
                url,
                ticket_url: None,
                image_url: None,
                organizer: Some(spec.display_name.clone()),
                price_text: None,
                price_min_nok: None,
                fetched_at: page.fetched_at,
            });
        }
        Ok(drafts)
    }
}

/// Drop markup from RSS descriptions that embed HTML.
fn strip_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// Paged ticketing-API adapter. The API has a fixed response shape:
/// `{ "events": [...], "pagination": { "next_page": n | null } }`.
#[derive(Debug, Clone, Copy)]
pub struct TicketingAdapter;

impl TicketingAdapter {
    fn page_url(base: &str, page_param: &str, page: u32) -> String {
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{base}{separator}{page_param}={page}")
    }

    fn parse_event(item: &JsonValue, spec: &SourceSpec, page: &FetchedPage) -> Option<EventDraft> {
        let title = pointer_str(item, "/name").and_then(|s| text_or_none(s.to_string()))?;
        let starts_at = pointer_str(item, "/starts_at").and_then(parse_rfc3339)?;

        let price_min_nok = item.pointer("/price/min").and_then(JsonValue::as_f64);
        let currency = pointer_str(item, "/price/currency").unwrap_or("NOK");

        Some(EventDraft {
            source_id: spec.source_id.clone(),
            source_event_id: item.pointer("/id").map(|v| match v {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            }),
            title,
            description: pointer_str(item, "/description")
                .and_then(|s| text_or_none(s.to_string())),
            starts_at,
            ends_at: pointer_str(item, "/ends_at").and_then(parse_rfc3339),
            venue: pointer_str(item, "/venue/name").and_then(|s| text_or_none(s.to_string())),
            address: pointer_str(item, "/venue/address")
                .and_then(|s| text_or_none(s.to_string())),
            category: pointer_str(item, "/category")
                .and_then(Category::parse)
                .or_else(|| default_category_for(spec)),
            url: pointer_str(item, "/url").map(ToString::to_string),
            ticket_url: pointer_str(item, "/ticket_url").map(ToString::to_string),
            image_url: pointer_str(item, "/image_url").map(ToString::to_string),
            organizer: pointer_str(item, "/organizer")
                .and_then(|s| text_or_none(s.to_string()))
                .or_else(|| Some(spec.display_name.clone())),
            price_min_nok,
            price_text: price_min_nok.map(|min| format!("fra {min:.0} {currency}")),
            fetched_at: page.fetched_at,
        })
    }
}

#[async_trait]
impl SourceAdapter for TicketingAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Ticketing
    }

    async fn fetch(
        &self,
        http: &FetchClient,
        ctx: &AdapterContext,
        spec: &SourceSpec,
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let rules = spec.ticketing.clone().unwrap_or(TicketingRules {
            page_param: default_page_param(),
            max_pages: default_max_pages(),
        });
        let base = spec.urls.first().ok_or_else(|| AdapterError::Misconfigured {
            source_id: spec.source_id.clone(),
            reason: "ticketing source without a base url".to_string(),
        })?;

        let mut pages = Vec::new();
        let mut page_no = 1u32;
        loop {
            let url = Self::page_url(base, &rules.page_param, page_no);
            let page = http.get(ctx.run_id, &spec.source_id, &url).await?;

            let next_page = serde_json::from_slice::<JsonValue>(&page.body)
                .ok()
                .and_then(|v| {
                    v.pointer("/pagination/next_page")
                        .and_then(JsonValue::as_u64)
                });
            pages.push(page);

            match next_page {
                Some(next) if next as u32 > page_no && page_no < rules.max_pages => {
                    page_no = next as u32;
                }
                _ => break,
            }
        }
        Ok(pages)
    }

    fn parse(&self, spec: &SourceSpec, page: &FetchedPage) -> Result<Vec<EventDraft>, AdapterError> {
        let root: JsonValue = serde_json::from_slice(&page.body)
            .map_err(|err| AdapterError::Payload(err.to_string()))?;
        let events = root
            .pointer("/events")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| AdapterError::Payload("no /events array in response".to_string()))?;

        Ok(events
            .iter()
            .filter_map(|item| Self::parse_event(item, spec, page))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::StatusCode;

    fn page(body: &str, content_type: &str) -> FetchedPage {
        page_from(body, content_type, "https://kultur.example.no/program")
    }

    fn page_from(body: &str, content_type: &str, final_url: &str) -> FetchedPage {
        FetchedPage {
            status: StatusCode::OK,
            final_url: final_url.to_string(),
            content_type: Some(content_type.to_string()),
            body: body.as_bytes().to_vec(),
            fetched_at: Utc.with_ymd_and_hms(2026, 8, 1, 6, 0, 0).single().unwrap(),
        }
    }

    fn html_spec() -> SourceSpec {
        SourceSpec {
            source_id: "kulturhuset".into(),
            display_name: "Kulturhuset".into(),
            enabled: true,
            kind: SourceKind::Html,
            priority: 10,
            urls: vec!["https://kultur.example.no/program".into()],
            default_venue: Some("Kulturhuset".into()),
            default_category: Some("konsert".into()),
            html: Some(HtmlRules {
                item: ".event-card".into(),
                title: "h3".into(),
                date: Some(".date".into()),
                venue: Some(".venue".into()),
                description: Some(".ingress".into()),
                price: Some(".price".into()),
                link: Some("a".into()),
                image: Some("img".into()),
            }),
            json: None,
            ticketing: None,
            notes: None,
        }
    }

    const PROGRAM_HTML: &str = r#"
        <html><body>
          <div class="event-card">
            <h3>Jazzkveld med Trio Nord</h3>
            <div class="date">Torsdag 5. september kl. 19:30</div>
            <div class="venue">Storsalen</div>
            <p class="ingress">Kveldskonsert med lokale musikere.</p>
            <span class="price">Kr 250</span>
            <a href="/program/jazzkveld">Les mer</a>
            <img src="/bilder/jazz.jpg" />
          </div>
          <div class="event-card">
            <h3>Barneteater: Karius og Baktus</h3>
            <div class="date">12. oktober kl. 13:00</div>
            <span class="price">Gratis</span>
            <a href="https://billetter.example.no/karius">Billetter</a>
          </div>
          <div class="event-card">
            <h3>Kommer senere</h3>
            <div class="date">Dato ikke fastsatt</div>
          </div>
        </body></html>
    "#;

    #[test]
    fn html_adapter_extracts_cards_and_skips_dateless_items() {
        let spec = html_spec();
        let drafts = HtmlProgramAdapter
            .parse(&spec, &page(PROGRAM_HTML, "text/html"))
            .unwrap();
        assert_eq!(drafts.len(), 2);

        let jazz = &drafts[0];
        assert_eq!(jazz.title, "Jazzkveld med Trio Nord");
        assert_eq!(jazz.venue.as_deref(), Some("Storsalen"));
        assert_eq!(
            jazz.description.as_deref(),
            Some("Kveldskonsert med lokale musikere.")
        );
        assert_eq!(jazz.price_min_nok, Some(250.0));
        assert_eq!(
            jazz.url.as_deref(),
            Some("https://kultur.example.no/program/jazzkveld")
        );
        assert_eq!(
            jazz.image_url.as_deref(),
            Some("https://kultur.example.no/bilder/jazz.jpg")
        );
        assert_eq!(jazz.category, Some(Category::Konsert));

        let teater = &drafts[1];
        // No .venue node, so the registry default applies.
        assert_eq!(teater.venue.as_deref(), Some("Kulturhuset"));
        assert_eq!(teater.price_min_nok, Some(0.0));
        assert_eq!(
            teater.url.as_deref(),
            Some("https://billetter.example.no/karius")
        );
    }

    #[test]
    fn html_adapter_without_rules_is_a_config_error() {
        let mut spec = html_spec();
        spec.html = None;
        let err = HtmlProgramAdapter
            .parse(&spec, &page("<html></html>", "text/html"))
            .unwrap_err();
        assert!(matches!(err, AdapterError::Misconfigured { .. }));
    }

    fn json_spec() -> SourceSpec {
        SourceSpec {
            source_id: "kommune-api".into(),
            display_name: "Kommunens aktivitetskalender".into(),
            enabled: true,
            kind: SourceKind::Json,
            priority: 20,
            urls: vec!["https://kultur.example.no/api/events".into()],
            default_venue: None,
            default_category: None,
            html: None,
            json: Some(JsonRules {
                items: "/data/events".into(),
                title: "/title".into(),
                starts_at: "/start_time".into(),
                ends_at: Some("/end_time".into()),
                id: Some("/id".into()),
                description: Some("/summary".into()),
                venue: Some("/location/name".into()),
                address: Some("/location/address".into()),
                url: Some("/permalink".into()),
                ticket_url: None,
                image: None,
                price_text: Some("/price".into()),
                category: Some("/genre".into()),
            }),
            ticketing: None,
            notes: None,
        }
    }

    const API_JSON: &str = r#"{
      "data": {
        "events": [
          {
            "id": 811,
            "title": "Forfattermøte: Nordlys og ord",
            "summary": "Samtale med forfatteren.",
            "start_time": "2026-09-10T18:00:00+02:00",
            "end_time": "2026-09-10T20:00:00+02:00",
            "location": {"name": "Biblioteket", "address": "Storgata 1"},
            "permalink": "/arrangement/811",
            "price": "Gratis",
            "genre": "litteratur"
          },
          {"title": "Uten dato"}
        ]
      }
    }"#;

    #[test]
    fn json_adapter_follows_pointers_and_drops_invalid_items() {
        let spec = json_spec();
        let drafts = JsonApiAdapter
            .parse(&spec, &page(API_JSON, "application/json"))
            .unwrap();
        assert_eq!(drafts.len(), 1);

        let event = &drafts[0];
        assert_eq!(event.title, "Forfattermøte: Nordlys og ord");
        assert_eq!(event.source_event_id.as_deref(), Some("811"));
        assert_eq!(event.venue.as_deref(), Some("Biblioteket"));
        assert_eq!(event.address.as_deref(), Some("Storgata 1"));
        assert_eq!(event.category, Some(Category::Litteratur));
        assert_eq!(event.price_min_nok, Some(0.0));
        assert_eq!(
            event.url.as_deref(),
            Some("https://kultur.example.no/arrangement/811")
        );
        assert_eq!(
            event.starts_at,
            Utc.with_ymd_and_hms(2026, 9, 10, 16, 0, 0).single().unwrap()
        );
        assert!(event.ends_at.is_some());
    }

    #[test]
    fn json_adapter_reports_wrong_items_pointer() {
        let spec = json_spec();
        let err = JsonApiAdapter
            .parse(&spec, &page(r#"{"data": {}}"#, "application/json"))
            .unwrap_err();
        assert!(matches!(err, AdapterError::Payload(_)));
    }

    fn rss_spec() -> SourceSpec {
        SourceSpec {
            source_id: "avisa-kultur".into(),
            display_name: "Avisa kulturkalender".into(),
            enabled: true,
            kind: SourceKind::Rss,
            priority: 50,
            urls: vec!["https://avisa.example.no/kultur/rss".into()],
            default_venue: None,
            default_category: None,
            html: None,
            json: None,
            ticketing: None,
            notes: None,
        }
    }

    const FEED_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
      <rss version="2.0"><channel>
        <title>Kulturkalender</title>
        <link>https://avisa.example.no/kultur</link>
        <description>Hva skjer</description>
        <item>
          <guid>avisa-4211</guid>
          <title>Allsang på torget 15. august kl. 18:00</title>
          <link>/kultur/allsang-pa-torget</link>
          <description>&lt;p&gt;Tradisjonen tro blir det allsang.&lt;/p&gt;</description>
          <pubDate>Mon, 03 Aug 2026 08:00:00 +0200</pubDate>
        </item>
        <item>
          <title>Nytt galleri åpner dørene</title>
          <link>https://avisa.example.no/kultur/galleri</link>
          <pubDate>Tue, 04 Aug 2026 09:00:00 +0200</pubDate>
        </item>
      </channel></rss>
    "#;

    #[test]
    fn rss_adapter_prefers_dates_mined_from_text() {
        let spec = rss_spec();
        let drafts = RssFeedAdapter
            .parse(
                &spec,
                &page_from(
                    FEED_XML,
                    "application/rss+xml",
                    "https://avisa.example.no/kultur/rss",
                ),
            )
            .unwrap();
        assert_eq!(drafts.len(), 2);

        let allsang = &drafts[0];
        assert_eq!(allsang.source_event_id.as_deref(), Some("avisa-4211"));
        // 18:00 Oslo summer time is 16:00 UTC.
        assert_eq!(
            allsang.starts_at,
            Utc.with_ymd_and_hms(2026, 8, 15, 16, 0, 0).single().unwrap()
        );
        assert_eq!(
            allsang.description.as_deref(),
            Some("Tradisjonen tro blir det allsang.")
        );
        assert_eq!(
            allsang.url.as_deref(),
            Some("https://avisa.example.no/kultur/allsang-pa-torget")
        );

        // Falls back to the publish date when the text has no event date.
        let galleri = &drafts[1];
        assert_eq!(
            galleri.starts_at,
            Utc.with_ymd_and_hms(2026, 8, 4, 7, 0, 0).single().unwrap()
        );
    }

    fn ticketing_spec() -> SourceSpec {
        SourceSpec {
            source_id: "billettluka".into(),
            display_name: "Billettluka".into(),
            enabled: true,
            kind: SourceKind::Ticketing,
            priority: 5,
            urls: vec!["https://api.billettluka.no/v1/events?municipality=eksempelvik".into()],
            default_venue: None,
            default_category: None,
            html: None,
            json: None,
            ticketing: Some(TicketingRules {
                page_param: "page".into(),
                max_pages: 20,
            }),
            notes: None,
        }
    }

    const TICKETING_JSON: &str = r#"{
      "events": [
        {
          "id": "evt_991",
          "name": "Stand-up: Høstlatter",
          "description": "To timer med humor.",
          "starts_at": "2026-10-02T19:00:00+02:00",
          "ends_at": "2026-10-02T21:00:00+02:00",
          "venue": {"name": "Samfunnshuset", "address": "Torgveien 2"},
          "url": "https://billettluka.no/e/evt_991",
          "ticket_url": "https://billettluka.no/e/evt_991/kjop",
          "image_url": "https://cdn.billettluka.no/evt_991.jpg",
          "price": {"min": 395.0, "currency": "NOK"},
          "category": "annet"
        },
        {"name": "Mangler starttid"}
      ],
      "pagination": {"next_page": null}
    }"#;

    #[test]
    fn ticketing_adapter_parses_fixed_schema() {
        let spec = ticketing_spec();
        let drafts = TicketingAdapter
            .parse(&spec, &page(TICKETING_JSON, "application/json"))
            .unwrap();
        assert_eq!(drafts.len(), 1);

        let event = &drafts[0];
        assert_eq!(event.source_event_id.as_deref(), Some("evt_991"));
        assert_eq!(event.venue.as_deref(), Some("Samfunnshuset"));
        assert_eq!(event.price_min_nok, Some(395.0));
        assert_eq!(event.price_text.as_deref(), Some("fra 395 NOK"));
        assert_eq!(
            event.ticket_url.as_deref(),
            Some("https://billettluka.no/e/evt_991/kjop")
        );
    }

    #[test]
    fn ticketing_page_urls_respect_existing_query() {
        assert_eq!(
            TicketingAdapter::page_url("https://api.example.no/events?m=x", "page", 3),
            "https://api.example.no/events?m=x&page=3"
        );
        assert_eq!(
            TicketingAdapter::page_url("https://api.example.no/events", "side", 1),
            "https://api.example.no/events?side=1"
        );
    }

    #[test]
    fn adapter_registry_covers_all_kinds() {
        for kind in [
            SourceKind::Html,
            SourceKind::Json,
            SourceKind::Rss,
            SourceKind::Ticketing,
        ] {
            assert_eq!(adapter_for(kind).kind(), kind);
        }
    }

    #[test]
    fn tag_stripping_keeps_text() {
        assert_eq!(strip_tags("<p>Hei <b>verden</b></p>"), "Hei verden");
    }
}
