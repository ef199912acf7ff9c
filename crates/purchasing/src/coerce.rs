//! Lenient conversion of spreadsheet cells into typed attribute values.
//!
//! Registers are maintained by hand, so numbers arrive with thousands
//! separators and currency marks, booleans as `да`/`нет`, and dates either as
//! text or as spreadsheet serial day numbers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::reference::start_of_day;

/// Day number of 1970-01-01 in the 1900 spreadsheet date system.
const SERIAL_EPOCH_DAY: f64 = 25_569.0;
const MILLIS_PER_DAY: f64 = 86_400_000.0;
/// 9999-12-31, the last day spreadsheets can represent.
const SERIAL_LAST_DAY: f64 = 2_958_465.0;

/// A raw cell value as delivered by a spreadsheet-to-JSON conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LooseValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<&str> for LooseValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for LooseValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for LooseValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for LooseValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Outcome of coercing one cell: `Ok(None)` for an empty cell, `Err` with a
/// human-readable reason when the cell has content of the wrong shape.
pub type Coerced<T> = Result<Option<T>, String>;

/// Collapse internal whitespace and trim; blank cells become `None`.
pub fn normalize_cell(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

pub fn to_text(value: &LooseValue) -> Option<String> {
    match value {
        LooseValue::Null => None,
        LooseValue::Bool(b) => Some(b.to_string()),
        LooseValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => Some(format!("{}", *n as i64)),
        LooseValue::Number(n) => Some(n.to_string()),
        LooseValue::Text(s) => normalize_cell(s),
    }
}

pub fn to_number(value: &LooseValue) -> Coerced<f64> {
    match value {
        LooseValue::Null => Ok(None),
        LooseValue::Number(n) if n.is_finite() => Ok(Some(*n)),
        LooseValue::Number(_) => Err("must be a finite number".to_string()),
        LooseValue::Bool(_) => Err("expected a number".to_string()),
        LooseValue::Text(s) => parse_number_text(s),
    }
}

/// Parse `1 234,56 руб.`, `(1,200.00)`, `₽ 5 000` and similar.
///
/// Whitespace (including non-breaking spaces) and currency marks are dropped,
/// parentheses mean a negative amount, and when both `,` and `.` occur the
/// later one is the decimal separator. A lone separator repeated several
/// times is read as thousands grouping; a single one is always the decimal
/// separator, so `5.000` is five.
pub fn parse_number_text(raw: &str) -> Coerced<f64> {
    let mut text: String = raw.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_lowercase();
    if text.is_empty() {
        return Ok(None);
    }
    for mark in ["руб.", "руб", "rub", "р.", "₽", "$", "€", "£"] {
        text = text.replace(mark, "");
    }
    if let Some(stripped) = text.strip_suffix('р') {
        text = stripped.to_string();
    }

    let mut negative = false;
    if text.starts_with('(') && text.ends_with(')') && text.len() > 2 {
        negative = true;
        text = text[1..text.len() - 1].to_string();
    }

    let normalized = match (text.rfind(','), text.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => text.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => text.replace(',', ""),
        (Some(_), None) if text.matches(',').count() == 1 => text.replace(',', "."),
        (Some(_), None) => text.replace(',', ""),
        (None, Some(_)) if text.matches('.').count() > 1 => text.replace('.', ""),
        _ => text,
    };

    match normalized.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(Some(if negative { -n } else { n })),
        _ => Err(format!("cannot read {:?} as a number", raw.trim())),
    }
}

pub fn to_bool(value: &LooseValue) -> Coerced<bool> {
    match value {
        LooseValue::Null => Ok(None),
        LooseValue::Bool(b) => Ok(Some(*b)),
        LooseValue::Number(n) if *n == 1.0 => Ok(Some(true)),
        LooseValue::Number(n) if *n == 0.0 => Ok(Some(false)),
        LooseValue::Number(_) => Err("expected 1 or 0".to_string()),
        LooseValue::Text(s) => parse_bool_text(s),
    }
}

fn parse_bool_text(raw: &str) -> Coerced<bool> {
    let token = raw.trim().to_lowercase();
    match token.as_str() {
        "" => Ok(None),
        "да" | "true" | "1" | "yes" | "y" | "+" => Ok(Some(true)),
        "нет" | "false" | "0" | "no" | "n" | "-" => Ok(Some(false)),
        _ => Err(format!("expected yes/no, got {:?}", raw.trim())),
    }
}

/// Completion flag; also understands register phrasing such as
/// `состоялась` / `не состоялась`.
pub fn to_completed(value: &LooseValue) -> Coerced<bool> {
    if let LooseValue::Text(s) = value {
        let lowered = s.to_lowercase();
        if lowered.contains("не состоя") {
            return Ok(Some(false));
        }
        if lowered.contains("состоя") {
            return Ok(Some(true));
        }
    }
    to_bool(value)
}

pub fn to_date(value: &LooseValue) -> Coerced<DateTime<Utc>> {
    match value {
        LooseValue::Null => Ok(None),
        LooseValue::Bool(_) => Err("expected a date".to_string()),
        LooseValue::Number(n) => from_serial(*n).map(Some),
        LooseValue::Text(s) => {
            let text = s.trim();
            if text.is_empty() {
                return Ok(None);
            }
            if let Ok(n) = text.parse::<f64>() {
                return from_serial(n).map(Some);
            }
            if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
                return Ok(Some(instant.with_timezone(&Utc)));
            }
            parse_date_text(text)
                .map(|day| Some(start_of_day(day)))
                .ok_or_else(|| format!("cannot read {text:?} as a date"))
        }
    }
}

/// Calendar day in one of the formats registers use: `DD.MM.YYYY`,
/// `D.M.YYYY`, `DD.MM.YY`, `DD/MM/YYYY` or ISO `YYYY-MM-DD`.
pub fn parse_date_text(raw: &str) -> Option<NaiveDate> {
    let text = raw.trim();
    if let Some(day) = parse_short_year(text) {
        return Some(day);
    }
    ["%d.%m.%Y", "%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .or_else(|| {
            let instant = DateTime::parse_from_rfc3339(text).ok()?;
            Some(instant.with_timezone(&Utc).date_naive())
        })
}

/// `DD.MM.YY` and `DD/MM/YY`, windowed to 1970..=2069.
fn parse_short_year(text: &str) -> Option<NaiveDate> {
    let split = text.rfind(['.', '/'])?;
    let (head, year) = (&text[..split], &text[split + 1..]);
    if year.len() != 2 || !year.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = year.parse().ok()?;
    let year = if year >= 70 { 1900 + year } else { 2000 + year };
    let head = head.replace('/', ".");
    NaiveDate::parse_from_str(&format!("{head}.{year}"), "%d.%m.%Y").ok()
}

/// Spreadsheet serial day number from 1970-01-01 through 9999-12-31, or a
/// Unix timestamp in seconds or milliseconds for values too large to be day
/// numbers. Anything else, such as a bare year like `2025`, is rejected.
fn from_serial(n: f64) -> Result<DateTime<Utc>, String> {
    if !n.is_finite() || n <= 0.0 {
        return Err(format!("{n} is not a valid date number"));
    }
    let instant = if n >= 1e12 {
        DateTime::from_timestamp_millis(n as i64)
    } else if n >= 1e9 {
        DateTime::from_timestamp(n as i64, 0)
    } else if (SERIAL_EPOCH_DAY..=SERIAL_LAST_DAY).contains(&n) {
        let millis = ((n.floor() - SERIAL_EPOCH_DAY) * MILLIS_PER_DAY) as i64;
        DateTime::from_timestamp_millis(millis)
    } else {
        return Err(format!("{n} is not a plausible spreadsheet date"));
    };
    instant.ok_or_else(|| format!("{n} is out of the supported date range"))
}
