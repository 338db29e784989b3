//! Norwegian date, clock and price string parsing.
//!
//! Municipal sites write dates in many shapes: «torsdag 5. september 2026
//! kl. 19:30», «5. sep kl 19», «5.–7. juni». Times are wall-clock Europe/Oslo
//! and converted to UTC here.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use chrono_tz::Europe::Oslo;

const MONTHS: [(&str, u32); 12] = [
    ("januar", 1),
    ("februar", 2),
    ("mars", 3),
    ("april", 4),
    ("mai", 5),
    ("juni", 6),
    ("juli", 7),
    ("august", 8),
    ("september", 9),
    ("oktober", 10),
    ("november", 11),
    ("desember", 12),
];

/// Match a month token against full names and the common three-letter
/// abbreviations («sep», «sep.», «okt»).
pub fn month_from_name(token: &str) -> Option<u32> {
    let token = token
        .trim_matches(|c: char| !c.is_alphabetic())
        .to_lowercase();
    if token.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .find(|(name, _)| *name == token || (token.len() == 3 && name.starts_with(&token)))
        .map(|(_, number)| *number)
}

/// Parse «19:30», «19.30» or a bare hour «19» into (hour, minute).
pub fn parse_clock(token: &str) -> Option<(u32, u32)> {
    let token = token.trim_matches(|c: char| !c.is_ascii_digit() && c != ':' && c != '.');
    let (hour_part, minute_part) = match token.split_once([':', '.']) {
        Some((h, m)) => (h, m),
        None => (token, "0"),
    };
    let hour: u32 = hour_part.parse().ok()?;
    let minute: u32 = minute_part.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

fn parse_day_token(token: &str) -> Option<u32> {
    let digits = token.trim_end_matches('.');
    let day: u32 = digits.parse().ok()?;
    (1..=31).contains(&day).then_some(day)
}

fn oslo_to_utc(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    Oslo.with_ymd_and_hms(year, month, day, hour, minute, 0)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Resolve a year-less date against the fetch time: listings describe
/// upcoming events, so a date far in the past rolls over to next year.
fn infer_year(month: u32, day: u32, reference: DateTime<Utc>) -> i32 {
    let year = reference.year();
    match oslo_to_utc(year, month, day, 12, 0) {
        Some(candidate) if candidate < reference - Duration::days(60) => year + 1,
        Some(_) => year,
        None => year,
    }
}

/// Extract the first «day. month [year] [kl. HH:MM]» occurrence from free
/// text. Returns a UTC instant; midnight Oslo time when no clock is given.
pub fn parse_event_datetime(text: &str, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lowered = text.to_lowercase();
    let tokens: Vec<&str> = lowered.split_whitespace().collect();

    let mut date: Option<(u32, u32, Option<i32>)> = None;
    let mut clock: Option<(u32, u32)> = None;
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];

        if date.is_none() {
            if let (Some(day), Some(month)) = (
                parse_day_token(token),
                tokens.get(i + 1).and_then(|t| month_from_name(t)),
            ) {
                let year = tokens
                    .get(i + 2)
                    .and_then(|t| t.trim_matches(|c: char| !c.is_ascii_digit()).parse().ok())
                    .filter(|y| (2000..2100).contains(y));
                date = Some((month, day, year));
                i += 2;
                continue;
            }
        }

        if clock.is_none() && (token == "kl." || token == "kl") {
            clock = tokens.get(i + 1).and_then(|t| parse_clock(t));
            i += 2;
            continue;
        }
        // Glued form «kl.19:30».
        if clock.is_none() && token.starts_with("kl") {
            clock = parse_clock(token.trim_start_matches("kl").trim_start_matches('.'));
        }

        i += 1;
    }

    let (month, day, year) = date?;
    let year = year.unwrap_or_else(|| infer_year(month, day, reference));
    let (hour, minute) = clock.unwrap_or((0, 0));
    oslo_to_utc(year, month, day, hour, minute)
}

/// Parse a day range «5.–7. juni [2026]» into start and end instants. The end
/// lands at 23:59 Oslo time on the last day.
pub fn parse_date_range(
    text: &str,
    reference: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let lowered = text.to_lowercase();
    let normalized = lowered.replace('–', "-");
    let tokens: Vec<&str> = normalized.split_whitespace().collect();

    for (i, token) in tokens.iter().enumerate() {
        let Some((first, second)) = token.split_once('-') else {
            continue;
        };
        let (Some(start_day), Some(end_day)) = (parse_day_token(first), parse_day_token(second))
        else {
            continue;
        };
        let Some(month) = tokens.get(i + 1).and_then(|t| month_from_name(t)) else {
            continue;
        };
        if end_day < start_day {
            return None;
        }
        let year = tokens
            .get(i + 2)
            .and_then(|t| t.trim_matches(|c: char| !c.is_ascii_digit()).parse().ok())
            .filter(|y| (2000..2100).contains(y))
            .unwrap_or_else(|| infer_year(month, start_day, reference));
        let start = oslo_to_utc(year, month, start_day, 0, 0)?;
        let end = oslo_to_utc(year, month, end_day, 23, 59)?;
        return Some((start, end));
    }
    None
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPrice {
    pub text: String,
    pub min_nok: Option<f64>,
    pub free: bool,
}

/// Parse price strings: «Gratis», «Kr 250», «250,-», «fra 150 kr»,
/// «150–250 kr». The lowest mentioned amount wins.
pub fn parse_price(text: &str) -> Option<ParsedPrice> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_lowercase();

    if lowered.contains("gratis") || lowered.contains("fri entré") || lowered.contains("fri entre")
    {
        return Some(ParsedPrice {
            text: trimmed.to_string(),
            min_nok: Some(0.0),
            free: true,
        });
    }

    let mut amounts = Vec::new();
    let mut current = String::new();
    for ch in lowered.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if !current.is_empty() {
            if let Ok(v) = current.parse::<f64>() {
                amounts.push(v);
            }
            current.clear();
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<f64>() {
            amounts.push(v);
        }
    }

    let min_nok =
        (!amounts.is_empty()).then(|| amounts.iter().cloned().fold(f64::INFINITY, f64::min));
    Some(ParsedPrice {
        text: trimmed.to_string(),
        min_nok,
        free: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).single().unwrap()
    }

    fn oslo(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Oslo.with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn full_datetime_with_weekday_and_year() {
        let parsed =
            parse_event_datetime("Torsdag 5. september 2026 kl. 19:30", reference()).unwrap();
        assert_eq!(parsed, oslo(2026, 9, 5, 19, 30));
    }

    #[test]
    fn abbreviated_month_and_dotted_clock() {
        let parsed = parse_event_datetime("5. sep kl 19.30", reference()).unwrap();
        assert_eq!(parsed, oslo(2026, 9, 5, 19, 30));
    }

    #[test]
    fn glued_clock_token() {
        let parsed = parse_event_datetime("12. oktober kl.20:00", reference()).unwrap();
        assert_eq!(parsed, oslo(2026, 10, 12, 20, 0));
    }

    #[test]
    fn missing_clock_defaults_to_midnight() {
        let parsed = parse_event_datetime("Utstilling åpner 3. desember", reference()).unwrap();
        assert_eq!(parsed, oslo(2026, 12, 3, 0, 0));
    }

    #[test]
    fn yearless_past_date_rolls_to_next_year() {
        // Fetched in August; a February date must mean next year.
        let parsed = parse_event_datetime("14. februar kl. 18:00", reference()).unwrap();
        assert_eq!(parsed, oslo(2027, 2, 14, 18, 0));
    }

    #[test]
    fn recent_past_date_stays_in_current_year() {
        // Listings keep events from the last few weeks around.
        let parsed = parse_event_datetime("20. juli kl. 21:00", reference()).unwrap();
        assert_eq!(parsed, oslo(2026, 7, 20, 21, 0));
    }

    #[test]
    fn no_date_yields_none() {
        assert!(parse_event_datetime("Program kommer snart", reference()).is_none());
        assert!(parse_event_datetime("", reference()).is_none());
    }

    #[test]
    fn date_range_with_en_dash() {
        // Early June is within the grace window seen from August, so the
        // range stays in the fetch year.
        let (start, end) = parse_date_range("5.–7. juni", reference()).unwrap();
        assert_eq!(start, oslo(2026, 6, 5, 0, 0));
        assert_eq!(end, oslo(2026, 6, 7, 23, 59));
    }

    #[test]
    fn date_range_with_hyphen_and_year() {
        let (start, end) = parse_date_range("12.-14. mars 2027", reference()).unwrap();
        assert_eq!(start, oslo(2027, 3, 12, 0, 0));
        assert_eq!(end, oslo(2027, 3, 14, 23, 59));
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(parse_date_range("7.–5. juni", reference()).is_none());
    }

    #[test]
    fn month_abbreviations() {
        assert_eq!(month_from_name("sep"), Some(9));
        assert_eq!(month_from_name("sep."), Some(9));
        assert_eq!(month_from_name("mai"), Some(5));
        assert_eq!(month_from_name("ma"), None);
    }

    #[test]
    fn price_gratis() {
        let p = parse_price("Gratis").unwrap();
        assert!(p.free);
        assert_eq!(p.min_nok, Some(0.0));
    }

    #[test]
    fn price_variants() {
        assert_eq!(parse_price("Kr 250").unwrap().min_nok, Some(250.0));
        assert_eq!(parse_price("250,-").unwrap().min_nok, Some(250.0));
        assert_eq!(parse_price("fra 150 kr").unwrap().min_nok, Some(150.0));
        assert_eq!(parse_price("150–250 kr").unwrap().min_nok, Some(150.0));
    }

    #[test]
    fn price_without_amount_keeps_text_only() {
        let p = parse_price("Billetter i døra").unwrap();
        assert_eq!(p.min_nok, None);
        assert!(!p.free);
        assert!(parse_price("   ").is_none());
    }
}
