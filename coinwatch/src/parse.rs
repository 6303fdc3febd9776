use chrono::{Datelike, Local, TimeZone};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

/// Payload the ping endpoint answers with while the API is healthy.
pub const PING_CANARY: &str = "(V3) To the Moon!";
pub const RATE_LIMIT_MARKER: &str = "exceeded the Rate Limit";
pub const LAST_UPDATED_FIELD: &str = "last_updated_at";

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const INVALID_TIMESTAMP: &str = "0000-00-00 00:00:00";

/// Top-level keys the provider answers with instead of a price map.
const ERROR_KEYS: &[&str] = &["status", "error"];

lazy_static! {
    static ref NUMBER_RUN: Regex = Regex::new(r"[0-9.]+").unwrap();
}

/// One asset's price as reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub external_id: String,
    pub price: f64,
    pub unix_time: f64,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
struct Ping {
    gecko_says: String,
}

#[derive(Debug)]
pub enum ParseError {
    RateLimited(String),
    UnexpectedResponse(String),
    MissingField { asset: String, field: String },
    MalformedNumber { asset: String, field: String, raw: String },
}

impl std::error::Error for ParseError {}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::RateLimited(body) => write!(f, "Rate limited, server response: {}", body),
            ParseError::UnexpectedResponse(body) => write!(f, "API may be down, response: {}", body),
            ParseError::MissingField { asset, field } => write!(
                f,
                "Error retrieving the crypto {} from API: no '{}' field in the response",
                asset, field
            ),
            ParseError::MalformedNumber { asset, field, raw } => write!(
                f,
                "Error retrieving the crypto {} from API: '{}' is not a number ({})",
                asset, field, raw
            ),
        }
    }
}

/// Classifies the two sentinel response shapes. Throttling is checked first since a
/// throttled ping never carries the canary either.
pub fn check_liveness(ping: &str, prices: &str) -> Result<(), ParseError> {
    if let Some(body) = [ping, prices]
        .iter()
        .find(|body| body.contains(RATE_LIMIT_MARKER))
    {
        return Err(ParseError::RateLimited(body.to_string()));
    }

    match serde_json::from_str::<Ping>(ping) {
        Ok(ref answer) if answer.gecko_says == PING_CANARY => Ok(()),
        _ => Err(ParseError::UnexpectedResponse(ping.to_string())),
    }
}

/// Extracts a quote for every requested identifier present in the batched price response.
///
/// Identifiers the provider left out are skipped. A present identifier lacking a usable
/// price or update time means the response schema changed and fails the whole batch.
pub fn parse_prices(
    body: &str,
    requested: &[String],
    currency: &str,
) -> Result<Vec<Quote>, ParseError> {
    let entries: HashMap<String, Value> = serde_json::from_str(body)
        .map_err(|_| ParseError::UnexpectedResponse(body.to_string()))?;

    let any_requested = requested.iter().any(|id| entries.contains_key(id));
    if !any_requested && ERROR_KEYS.iter().any(|key| entries.contains_key(*key)) {
        return Err(ParseError::UnexpectedResponse(body.to_string()));
    }

    let mut quotes = Vec::with_capacity(requested.len());
    for external_id in requested {
        let entry = match entries.get(external_id) {
            Some(entry) => entry,
            None => {
                debug!("{} missing from price response, skipping", external_id);
                continue;
            }
        };

        let price = number_field(external_id, entry, currency)?;
        let unix_time = number_field(external_id, entry, LAST_UPDATED_FIELD)?;

        quotes.push(Quote {
            external_id: external_id.clone(),
            price,
            unix_time,
            timestamp: format_local(unix_time),
        });
    }

    Ok(quotes)
}

fn number_field(asset: &str, entry: &Value, field: &str) -> Result<f64, ParseError> {
    let value = entry.get(field).ok_or_else(|| ParseError::MissingField {
        asset: asset.to_string(),
        field: field.to_string(),
    })?;

    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => scan_number(text),
        _ => None,
    };

    number.ok_or_else(|| ParseError::MalformedNumber {
        asset: asset.to_string(),
        field: field.to_string(),
        raw: value.to_string(),
    })
}

/// Parses the first maximal run of digits and decimal points, ignoring surrounding
/// punctuation such as currency symbols or units.
pub fn scan_number(text: &str) -> Option<f64> {
    let run = NUMBER_RUN.find(text)?;
    run.as_str().parse().ok()
}

/// Formats epoch seconds as local time. Anything that isn't a representable instant
/// with a four digit year yields `INVALID_TIMESTAMP`.
pub fn format_local(epoch_seconds: f64) -> String {
    if !epoch_seconds.is_finite() {
        return INVALID_TIMESTAMP.to_string();
    }

    match Local.timestamp_opt(epoch_seconds.trunc() as i64, 0).single() {
        Some(time) if (0..=9999).contains(&time.year()) => {
            time.format(TIMESTAMP_FORMAT).to_string()
        }
        _ => INVALID_TIMESTAMP.to_string(),
    }
}

pub fn now_local() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}
