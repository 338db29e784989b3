//! Core domain model for the Kulturkalender event aggregator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kultur-core";

/// Coarse event category used for filtering and site navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Konsert,
    Teater,
    Utstilling,
    Film,
    Litteratur,
    Foredrag,
    Festival,
    Barn,
    Annet,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Konsert => "konsert",
            Category::Teater => "teater",
            Category::Utstilling => "utstilling",
            Category::Film => "film",
            Category::Litteratur => "litteratur",
            Category::Foredrag => "foredrag",
            Category::Festival => "festival",
            Category::Barn => "barn",
            Category::Annet => "annet",
        }
    }

    pub fn parse(input: &str) -> Option<Category> {
        match input.trim().to_ascii_lowercase().as_str() {
            "konsert" | "musikk" => Some(Category::Konsert),
            "teater" | "scene" | "revy" => Some(Category::Teater),
            "utstilling" | "kunst" => Some(Category::Utstilling),
            "film" | "kino" => Some(Category::Film),
            "litteratur" | "bok" => Some(Category::Litteratur),
            "foredrag" | "debatt" | "kurs" => Some(Category::Foredrag),
            "festival" => Some(Category::Festival),
            "barn" | "familie" => Some(Category::Barn),
            "annet" => Some(Category::Annet),
            _ => None,
        }
    }
}

/// Parsed/pre-normalized handoff contract from source adapters into the sync
/// pipeline. Every optional field stays `None` when the source does not carry
/// it; the pipeline never invents values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub source_id: String,
    /// Stable per-source identifier when the source exposes one (ticketing
    /// APIs and some JSON feeds do, scraped HTML usually does not).
    pub source_event_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub venue: Option<String>,
    pub address: Option<String>,
    pub category: Option<Category>,
    pub url: Option<String>,
    pub ticket_url: Option<String>,
    pub image_url: Option<String>,
    pub organizer: Option<String>,
    pub price_text: Option<String>,
    pub price_min_nok: Option<f64>,
    pub fetched_at: DateTime<Utc>,
}

impl EventDraft {
    /// Number of populated optional fields. Used when picking the canonical
    /// record out of a duplicate cluster.
    pub fn completeness(&self) -> u32 {
        [
            self.source_event_id.is_some(),
            self.description.is_some(),
            self.ends_at.is_some(),
            self.venue.is_some(),
            self.address.is_some(),
            self.category.is_some(),
            self.url.is_some(),
            self.ticket_url.is_some(),
            self.image_url.is_some(),
            self.organizer.is_some(),
            self.price_text.is_some(),
            self.price_min_nok.is_some(),
        ]
        .iter()
        .filter(|populated| **populated)
        .count() as u32
    }

    pub fn signature(&self) -> String {
        event_signature(&self.title, self.starts_at, self.venue.as_deref())
    }
}

/// Canonical persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub source_id: String,
    pub source_event_id: Option<String>,
    pub signature: String,
    pub title: String,
    pub description: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub venue: Option<String>,
    pub address: Option<String>,
    pub category: Option<Category>,
    pub url: Option<String>,
    pub ticket_url: Option<String>,
    pub image_url: Option<String>,
    pub organizer: Option<String>,
    pub price_text: Option<String>,
    pub price_min_nok: Option<f64>,
    /// Set when this row was merged into another event by the dedupe engine.
    pub canonical_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Fold a free-text fragment into a comparison token: lowercase, Norwegian
/// letters transliterated, everything non-alphanumeric collapsed to single
/// spaces.
pub fn normalize_text(input: &str) -> String {
    let mut folded = String::with_capacity(input.len());
    for ch in input.to_lowercase().chars() {
        match ch {
            'æ' => folded.push_str("ae"),
            'ø' => folded.push('o'),
            'å' => folded.push('a'),
            'é' | 'è' | 'ê' => folded.push('e'),
            'ü' => folded.push('u'),
            c if c.is_alphanumeric() => folded.push(c),
            _ => folded.push(' '),
        }
    }
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Exact-duplicate signature: normalized title + UTC start date + normalized
/// venue. Two postings with the same signature describe the same event.
pub fn event_signature(title: &str, starts_at: DateTime<Utc>, venue: Option<&str>) -> String {
    format!(
        "{}|{}|{}",
        normalize_text(title),
        starts_at.format("%Y-%m-%dT%H:%M"),
        venue.map(normalize_text).unwrap_or_default()
    )
}

/// Deterministic event id derived from the signature, so re-imports of the
/// same posting agree on the UID in ICS output.
pub fn event_uid(signature: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, signature.as_bytes())
}

/// Canonicalize a URL for duplicate comparison: lowercase scheme and host,
/// drop the fragment, drop common tracking query params, trim trailing slash.
pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim();
    let (scheme, rest) = match trimmed.split_once("://") {
        Some((s, r)) => (s.to_ascii_lowercase(), r),
        None => return trimmed.trim_end_matches('/').to_string(),
    };
    let rest = rest.split('#').next().unwrap_or(rest);
    let (host_path, query) = match rest.split_once('?') {
        Some((hp, q)) => (hp, Some(q)),
        None => (rest, None),
    };
    let (host, path) = match host_path.split_once('/') {
        Some((h, p)) => (h.to_ascii_lowercase(), format!("/{p}")),
        None => (host_path.to_ascii_lowercase(), String::new()),
    };
    let path = path.trim_end_matches('/').to_string();

    let kept_query = query
        .map(|q| {
            q.split('&')
                .filter(|pair| {
                    let key = pair.split('=').next().unwrap_or("");
                    !matches!(key, "fbclid" | "gclid" | "ref")
                        && !key.starts_with("utm_")
                })
                .collect::<Vec<_>>()
                .join("&")
        })
        .filter(|q| !q.is_empty());

    match kept_query {
        Some(q) => format!("{scheme}://{host}{path}?{q}"),
        None => format!("{scheme}://{host}{path}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 5, 17, 30, 0).single().unwrap()
    }

    #[test]
    fn text_normalization_folds_norwegian_letters() {
        assert_eq!(normalize_text("Blåmann på Sjøbadet!"), "blamann pa sjobadet");
        assert_eq!(normalize_text("  Jazz-kveld,  kl. 19  "), "jazz kveld kl 19");
    }

    #[test]
    fn signatures_ignore_case_and_punctuation() {
        let a = event_signature("Åpen Scene: Jazzkveld", ts(), Some("Kulturhuset"));
        let b = event_signature("åpen scene – jazzkveld", ts(), Some("KULTURHUSET"));
        assert_eq!(a, b);
    }

    #[test]
    fn signature_differs_on_start_time() {
        let a = event_signature("Jazzkveld", ts(), Some("Kulturhuset"));
        let later = ts() + chrono::Duration::hours(2);
        let b = event_signature("Jazzkveld", later, Some("Kulturhuset"));
        assert_ne!(a, b);
    }

    #[test]
    fn event_uid_is_deterministic() {
        let sig = event_signature("Jazzkveld", ts(), None);
        assert_eq!(event_uid(&sig), event_uid(&sig));
    }

    #[test]
    fn url_normalization_strips_tracking_and_fragment() {
        assert_eq!(
            normalize_url("HTTPS://Kulturhuset.NO/program/jazz/?utm_source=fb&id=42#info"),
            "https://kulturhuset.no/program/jazz?id=42"
        );
        assert_eq!(
            normalize_url("https://kulturhuset.no/program/jazz/"),
            "https://kulturhuset.no/program/jazz"
        );
    }

    #[test]
    fn category_parsing_accepts_synonyms() {
        assert_eq!(Category::parse("Musikk"), Some(Category::Konsert));
        assert_eq!(Category::parse("kino"), Some(Category::Film));
        assert_eq!(Category::parse("ukjent-greie"), None);
    }

    #[test]
    fn completeness_counts_populated_fields() {
        let draft = EventDraft {
            source_id: "kulturhuset".into(),
            source_event_id: None,
            title: "Jazzkveld".into(),
            description: Some("Konsert med lokalt band".into()),
            starts_at: ts(),
            ends_at: None,
            venue: Some("Kulturhuset".into()),
            address: None,
            category: Some(Category::Konsert),
            url: Some("https://kulturhuset.no/jazz".into()),
            ticket_url: None,
            image_url: None,
            organizer: None,
            price_text: None,
            price_min_nok: None,
            fetched_at: ts(),
        };
        assert_eq!(draft.completeness(), 4);
    }
}
