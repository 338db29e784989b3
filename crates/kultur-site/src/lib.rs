//! Static site rendering and the local preview server.
//!
//! The published artifact is a directory of plain files (index.html,
//! events.ics, feed.rss, app.css) suitable for any static host. The axum
//! server exists for previewing and for the /api/status endpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use askama::Template;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Europe::Oslo;
use kultur_core::{event_uid, Event};
use kultur_db::Db;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "kultur-site";

const APP_CSS: &str = include_str!("../assets/app.css");
const SITE_TITLE: &str = "Kulturkalenderen";
const SITE_DESCRIPTION: &str = "Hva skjer i kommunen: konserter, teater, utstillinger og mer";

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub site_url: String,
}

impl AppState {
    pub fn new(db: Db, site_url: impl Into<String>) -> Self {
        Self {
            db,
            site_url: site_url.into(),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    site_title: &'static str,
    generated_at: String,
    total_events: usize,
    days: Vec<DayGroup>,
}

struct DayGroup {
    label: String,
    events: Vec<EventRow>,
}

struct EventRow {
    time: String,
    title: String,
    venue: String,
    category: String,
    price: String,
    url: String,
    has_url: bool,
}

/// Render every output file into `output_dir`. `site_url` becomes the RSS
/// channel link, which names where the published files will live.
pub async fn write_site(
    db: &Db,
    output_dir: &Path,
    site_url: &str,
    now: DateTime<Utc>,
) -> Result<usize> {
    let events = db.upcoming_events(now).await?;

    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("creating {}", output_dir.display()))?;

    let html = render_index(&events, now).context("rendering index.html")?;
    tokio::fs::write(output_dir.join("index.html"), html)
        .await
        .context("writing index.html")?;

    let ics = render_ics(&events, now);
    tokio::fs::write(output_dir.join("events.ics"), ics)
        .await
        .context("writing events.ics")?;

    let rss = render_rss(&events, now, site_url);
    tokio::fs::write(output_dir.join("feed.rss"), rss)
        .await
        .context("writing feed.rss")?;

    tokio::fs::write(output_dir.join("app.css"), APP_CSS)
        .await
        .context("writing app.css")?;

    Ok(events.len())
}

fn render_index(events: &[Event], now: DateTime<Utc>) -> Result<String> {
    let tpl = IndexTemplate {
        site_title: SITE_TITLE,
        generated_at: now.with_timezone(&Oslo).format("%d.%m.%Y %H:%M").to_string(),
        total_events: events.len(),
        days: group_by_day(events),
    };
    tpl.render().context("askama render")
}

fn group_by_day(events: &[Event]) -> Vec<DayGroup> {
    let mut days: Vec<DayGroup> = Vec::new();
    for event in events {
        let local = event.starts_at.with_timezone(&Oslo);
        let label = norwegian_day_label(local.weekday().num_days_from_monday(), local.day(), local.month(), local.year());
        let row = EventRow {
            time: format!("{:02}:{:02}", local.hour(), local.minute()),
            title: event.title.clone(),
            venue: event.venue.clone().unwrap_or_default(),
            category: event
                .category
                .map(|c| c.as_str().to_string())
                .unwrap_or_default(),
            price: event.price_text.clone().unwrap_or_default(),
            url: event.url.clone().unwrap_or_default(),
            has_url: event.url.is_some(),
        };
        match days.last_mut() {
            Some(day) if day.label == label => day.events.push(row),
            _ => days.push(DayGroup {
                label,
                events: vec![row],
            }),
        }
    }
    days
}

fn norwegian_day_label(weekday: u32, day: u32, month: u32, year: i32) -> String {
    let weekdays = [
        "mandag", "tirsdag", "onsdag", "torsdag", "fredag", "lørdag", "søndag",
    ];
    let months = [
        "januar", "februar", "mars", "april", "mai", "juni", "juli", "august",
        "september", "oktober", "november", "desember",
    ];
    let weekday_name = weekdays.get(weekday as usize).copied().unwrap_or("");
    let month_name = months.get(month as usize - 1).copied().unwrap_or("");
    format!("{weekday_name} {day}. {month_name} {year}")
}

/// RFC 5545 text escaping: backslash, semicolon, comma and newline.
fn ics_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            other => out.push(other),
        }
    }
    out
}

/// Fold a content line at 75 octets, never splitting inside a UTF-8
/// sequence. Continuation lines start with a single space.
fn fold_ics_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len() + 8);
    let mut octets = 0usize;
    for ch in line.chars() {
        let width = ch.len_utf8();
        if octets + width > 75 {
            out.push_str("\r\n ");
            octets = 1;
        }
        out.push(ch);
        octets += width;
    }
    out
}

fn ics_push(buf: &mut String, line: &str) {
    buf.push_str(&fold_ics_line(line));
    buf.push_str("\r\n");
}

fn ics_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn render_ics(events: &[Event], now: DateTime<Utc>) -> String {
    let mut buf = String::new();
    ics_push(&mut buf, "BEGIN:VCALENDAR");
    ics_push(&mut buf, "VERSION:2.0");
    ics_push(&mut buf, "PRODID:-//Kulturkalenderen//NO");
    ics_push(&mut buf, "CALSCALE:GREGORIAN");
    ics_push(&mut buf, "METHOD:PUBLISH");

    let stamp = ics_timestamp(now);
    for event in events {
        ics_push(&mut buf, "BEGIN:VEVENT");
        // UID from the signature, so re-publishing the same event keeps the
        // same calendar entry across runs.
        ics_push(
            &mut buf,
            &format!("UID:{}@kulturkalenderen", event_uid(&event.signature)),
        );
        ics_push(&mut buf, &format!("DTSTAMP:{stamp}"));
        ics_push(&mut buf, &format!("DTSTART:{}", ics_timestamp(event.starts_at)));
        if let Some(ends_at) = event.ends_at {
            ics_push(&mut buf, &format!("DTEND:{}", ics_timestamp(ends_at)));
        }
        ics_push(&mut buf, &format!("SUMMARY:{}", ics_escape(&event.title)));
        if let Some(venue) = &event.venue {
            let location = match &event.address {
                Some(address) => format!("{venue}, {address}"),
                None => venue.clone(),
            };
            ics_push(&mut buf, &format!("LOCATION:{}", ics_escape(&location)));
        }
        if let Some(description) = &event.description {
            ics_push(
                &mut buf,
                &format!("DESCRIPTION:{}", ics_escape(description)),
            );
        }
        if let Some(url) = &event.url {
            ics_push(&mut buf, &format!("URL:{url}"));
        }
        if let Some(category) = event.category {
            ics_push(
                &mut buf,
                &format!("CATEGORIES:{}", ics_escape(category.as_str())),
            );
        }
        ics_push(&mut buf, "END:VEVENT");
    }

    ics_push(&mut buf, "END:VCALENDAR");
    buf
}

fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

pub fn render_rss(events: &[Event], now: DateTime<Utc>, site_url: &str) -> String {
    let mut buf = String::new();
    buf.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    buf.push_str("<rss version=\"2.0\">\n<channel>\n");
    buf.push_str(&format!("<title>{}</title>\n", xml_escape(SITE_TITLE)));
    buf.push_str(&format!("<link>{}</link>\n", xml_escape(site_url)));
    buf.push_str(&format!(
        "<description>{}</description>\n",
        xml_escape(SITE_DESCRIPTION)
    ));
    buf.push_str("<language>nb-NO</language>\n");
    buf.push_str(&format!(
        "<lastBuildDate>{}</lastBuildDate>\n",
        now.to_rfc2822()
    ));

    for event in events {
        buf.push_str("<item>\n");
        buf.push_str(&format!("<title>{}</title>\n", xml_escape(&event.title)));
        if let Some(url) = &event.url {
            buf.push_str(&format!("<link>{}</link>\n", xml_escape(url)));
        }
        buf.push_str(&format!(
            "<guid isPermaLink=\"false\">{}</guid>\n",
            event_uid(&event.signature)
        ));
        buf.push_str(&format!("<pubDate>{}</pubDate>\n", event.starts_at.to_rfc2822()));

        let local = event.starts_at.with_timezone(&Oslo);
        let mut description = format!("{}", local.format("%d.%m.%Y kl. %H:%M"));
        if let Some(venue) = &event.venue {
            description.push_str(&format!(", {venue}"));
        }
        if let Some(price) = &event.price_text {
            description.push_str(&format!(". {price}"));
        }
        if let Some(text) = &event.description {
            description.push_str(&format!("\n\n{text}"));
        }
        buf.push_str(&format!(
            "<description>{}</description>\n",
            xml_escape(&description)
        ));
        buf.push_str("</item>\n");
    }

    buf.push_str("</channel>\n</rss>\n");
    buf
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/events.ics", get(calendar_handler))
        .route("/feed.rss", get(feed_handler))
        .route("/app.css", get(css_handler))
        .route("/api/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(db: Db) -> Result<()> {
    let port: u16 = std::env::var("KULTUR_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let site_url = std::env::var("KULTUR_SITE_URL")
        .unwrap_or_else(|_| "http://localhost:8000/".to_string());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState::new(db, site_url))).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let now = Utc::now();
    match state.db.upcoming_events(now).await {
        Ok(events) => match render_index(&events, now) {
            Ok(html) => Html(html).into_response(),
            Err(err) => server_error(err),
        },
        Err(err) => server_error(err.into()),
    }
}

async fn calendar_handler(State(state): State<Arc<AppState>>) -> Response {
    let now = Utc::now();
    match state.db.upcoming_events(now).await {
        Ok(events) => (
            [(header::CONTENT_TYPE, "text/calendar; charset=utf-8")],
            render_ics(&events, now),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn feed_handler(State(state): State<Arc<AppState>>) -> Response {
    let now = Utc::now();
    match state.db.upcoming_events(now).await {
        Ok(events) => (
            [(header::CONTENT_TYPE, "application/rss+xml; charset=utf-8")],
            render_rss(&events, now, &state.site_url),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn css_handler() -> Response {
    ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], APP_CSS).into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let latest_run = match state.db.latest_run().await {
        Ok(run) => run,
        Err(err) => return server_error(err.into()),
    };
    let health = match state.db.all_source_health().await {
        Ok(rows) => rows,
        Err(err) => return server_error(err.into()),
    };

    let sources: Vec<serde_json::Value> = health
        .iter()
        .map(|h| {
            serde_json::json!({
                "source_id": h.source_id,
                "state": h.state.as_str(),
                "consecutive_failures": h.consecutive_failures,
                "open_until": h.open_until,
                "last_success_at": h.last_success_at,
                "last_failure_at": h.last_failure_at,
                "last_error": h.last_error,
            })
        })
        .collect();

    Json(serde_json::json!({
        "latest_run": latest_run,
        "sources": sources,
    }))
    .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
