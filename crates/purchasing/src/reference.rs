//! Entry references: the registration code plus date a purchase was logged
//! under, usually written as one string such as `956-вн/ск от 23.07.2025`.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use procura_core::ValueObject;

/// Code and date extracted from a combined reference string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryReference {
    #[serde(rename = "entryNumber", default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(rename = "entryDate", default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

impl ValueObject for EntryReference {}

impl EntryReference {
    /// Split `raw` into code and date.
    ///
    /// The date is the first `D.M.YYYY`-like token (separators `.`, `-`, `/`;
    /// two-digit years are windowed to 1970..=2069), taken as midnight UTC.
    /// When that token is not a real calendar day the date is absent; later
    /// tokens are never consulted. The code is everything before the word
    /// `от`, or before the first date token when there is no such word, with
    /// trailing whitespace and dashes removed. Never fails: unrecognised parts
    /// are simply absent.
    pub fn parse(raw: &str) -> Self {
        let text = raw.trim();
        if text.is_empty() {
            return Self::default();
        }
        let chars: Vec<(usize, char)> = text.char_indices().collect();
        let date = find_date(&chars);
        let cut = find_separator(&chars).or(date.map(|(start, _)| start));
        let date = date.and_then(|(_, day)| day);
        let code = match cut {
            Some(end) => clean_code(&text[..end]),
            None => clean_code(text),
        };

        Self {
            code,
            date: date.map(start_of_day),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_none() && self.date.is_none()
    }
}

/// True when `text` carries a date token or the `от` separator, i.e. it is a
/// combined reference rather than a bare code.
pub fn looks_combined(text: &str) -> bool {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    find_separator(&chars).is_some() || find_date(&chars).is_some()
}

/// Resolve the stored reference from explicitly supplied parts and an
/// optional combined string. Explicit values win over parsed ones.
pub(crate) fn resolve(
    number: Option<&str>,
    date: Option<DateTime<Utc>>,
    raw: Option<&str>,
) -> EntryReference {
    let number = number.map(str::trim).filter(|n| !n.is_empty());
    let raw = raw.map(str::trim).filter(|r| !r.is_empty());

    match (number, raw) {
        (_, Some(raw)) => {
            let parsed = EntryReference::parse(raw);
            EntryReference {
                code: number.map(str::to_string).or(parsed.code),
                date: date.or(parsed.date),
            }
        }
        (Some(number), None) if looks_combined(number) => {
            let parsed = EntryReference::parse(number);
            EntryReference {
                code: parsed.code.or_else(|| Some(number.to_string())),
                date: date.or(parsed.date),
            }
        }
        (number, None) => EntryReference {
            code: number.map(str::to_string),
            date,
        },
    }
}

pub(crate) fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

fn clean_code(head: &str) -> Option<String> {
    let code = head
        .trim_end_matches(|c: char| c.is_whitespace() || matches!(c, '-' | '–' | '—' | ',' | ';'))
        .trim();
    (!code.is_empty()).then(|| code.to_string())
}

/// Byte offset of the first standalone `от` (Cyrillic or Latin `о`).
fn find_separator(chars: &[(usize, char)]) -> Option<usize> {
    chars.windows(2).enumerate().find_map(|(i, pair)| {
        let (offset, first) = pair[0];
        let (_, second) = pair[1];
        let is_word = matches!(first, 'о' | 'О' | 'o' | 'O') && matches!(second, 'т' | 'Т');
        let open_before = i == 0 || !chars[i - 1].1.is_alphanumeric();
        let open_after = chars.get(i + 2).is_none_or(|(_, c)| !c.is_alphanumeric());
        (is_word && open_before && open_after).then_some(offset)
    })
}

/// Start offset of the first date-shaped token, with its value when it names
/// a real calendar day. Tokens never start in the middle of a longer number.
fn find_date(chars: &[(usize, char)]) -> Option<(usize, Option<NaiveDate>)> {
    (0..chars.len())
        .filter(|&i| chars[i].1.is_ascii_digit())
        .filter(|&i| i == 0 || !chars[i - 1].1.is_ascii_digit())
        .find_map(|i| {
            let mut shaped = None;
            for day_len in [2, 1] {
                match date_at(chars, i, day_len) {
                    Some(Some(day)) => return Some((chars[i].0, Some(day))),
                    Some(None) => shaped = Some((chars[i].0, None)),
                    None => {}
                }
            }
            shaped
        })
}

/// `None` when no date shape starts at `start`; `Some(None)` when the shape
/// is there but no reading of it is a real day.
fn date_at(chars: &[(usize, char)], start: usize, day_len: usize) -> Option<Option<NaiveDate>> {
    let day = digits(chars, start, day_len)?;
    let after_day = start + day_len;
    if !is_date_separator(chars.get(after_day)?.1) {
        return None;
    }
    let mut shaped = false;
    for month_len in [2, 1] {
        let Some(month) = digits(chars, after_day + 1, month_len) else {
            continue;
        };
        let after_month = after_day + 1 + month_len;
        if !chars.get(after_month).is_some_and(|(_, c)| is_date_separator(*c)) {
            continue;
        }
        for year_len in [4, 2] {
            let Some(year) = digits(chars, after_month + 1, year_len) else {
                continue;
            };
            let after_year = after_month + 1 + year_len;
            if year_len == 2 && chars.get(after_year).is_some_and(|(_, c)| c.is_ascii_digit()) {
                continue;
            }
            shaped = true;
            let year = if year_len == 2 { window_year(year) } else { year };
            if let Some(date) = NaiveDate::from_ymd_opt(year as i32, month, day) {
                return Some(Some(date));
            }
        }
    }
    shaped.then_some(None)
}

fn digits(chars: &[(usize, char)], start: usize, len: usize) -> Option<u32> {
    let slice = chars.get(start..start + len)?;
    slice.iter().try_fold(0u32, |acc, (_, c)| c.to_digit(10).map(|d| acc * 10 + d))
}

fn is_date_separator(c: char) -> bool {
    matches!(c, '.' | '-' | '/')
}

fn window_year(two_digits: u32) -> u32 {
    if two_digits >= 70 { 1900 + two_digits } else { 2000 + two_digits }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn utc_day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn splits_code_and_date_around_separator() {
        let parsed = EntryReference::parse("956-вн/ск от 23.07.2025");
        assert_eq!(parsed.code.as_deref(), Some("956-вн/ск"));
        assert_eq!(parsed.date, Some(utc_day(2025, 7, 23)));
    }

    #[test]
    fn separator_is_case_insensitive_and_accepts_latin_o() {
        let parsed = EntryReference::parse("12/ЗК ОТ 1.2.24");
        assert_eq!(parsed.code.as_deref(), Some("12/ЗК"));
        assert_eq!(parsed.date, Some(utc_day(2024, 2, 1)));

        let parsed = EntryReference::parse("A-7 o\u{442} 05/11/2023");
        assert_eq!(parsed.code.as_deref(), Some("A-7"));
        assert_eq!(parsed.date, Some(utc_day(2023, 11, 5)));
    }

    #[test]
    fn separator_inside_word_is_ignored() {
        let parsed = EntryReference::parse("Отдел-5");
        assert_eq!(parsed.code.as_deref(), Some("Отдел-5"));
        assert_eq!(parsed.date, None);
    }

    #[test]
    fn code_falls_back_to_text_before_date() {
        let parsed = EntryReference::parse("ЗК-44 - 01-03-2024");
        assert_eq!(parsed.code.as_deref(), Some("ЗК-44"));
        assert_eq!(parsed.date, Some(utc_day(2024, 3, 1)));
    }

    #[test]
    fn two_digit_years_are_windowed() {
        assert_eq!(EntryReference::parse("1 от 01.01.70").date, Some(utc_day(1970, 1, 1)));
        assert_eq!(EntryReference::parse("1 от 01.01.69").date, Some(utc_day(2069, 1, 1)));
    }

    #[test]
    fn impossible_dates_leave_the_date_absent() {
        let parsed = EntryReference::parse("5 от 31.02.2024");
        assert_eq!(parsed.code.as_deref(), Some("5"));
        assert_eq!(parsed.date, None);
    }

    #[test]
    fn first_date_token_wins_even_when_impossible() {
        let parsed = EntryReference::parse("A-1 31.02.2024 / 05.03.2024");
        assert_eq!(parsed.code.as_deref(), Some("A-1"));
        assert_eq!(parsed.date, None);

        let parsed = EntryReference::parse("A-2 01.03.2024 / 05.03.2024");
        assert_eq!(parsed.code.as_deref(), Some("A-2"));
        assert_eq!(parsed.date, Some(utc_day(2024, 3, 1)));
    }

    #[test]
    fn blank_input_yields_nothing() {
        assert!(EntryReference::parse("   ").is_empty());
        let parsed = EntryReference::parse("от 23.07.2025");
        assert_eq!(parsed.code, None);
        assert_eq!(parsed.date, Some(utc_day(2025, 7, 23)));
    }

    #[test]
    fn explicit_parts_win_over_parsed_ones() {
        let explicit = utc_day(2020, 1, 1);
        let resolved = resolve(Some("X-1"), Some(explicit), Some("956 от 23.07.2025"));
        assert_eq!(resolved.code.as_deref(), Some("X-1"));
        assert_eq!(resolved.date, Some(explicit));
    }

    #[test]
    fn combined_text_in_number_field_is_split() {
        let resolved = resolve(Some("956-вн/ск от 23.07.2025"), None, None);
        assert_eq!(resolved.code.as_deref(), Some("956-вн/ск"));
        assert_eq!(resolved.date, Some(utc_day(2025, 7, 23)));

        let resolved = resolve(Some("  A-100 "), None, None);
        assert_eq!(resolved.code.as_deref(), Some("A-100"));
        assert_eq!(resolved.date, None);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        #[test]
        fn parse_never_panics(raw in "\\PC{0,40}") {
            let _ = EntryReference::parse(&raw);
        }

        #[test]
        fn formatted_references_parse_back(
            code in "[A-Z0-9]{1,4}(/[вкнс]{1,3})?",
            day in 1u32..=28,
            month in 1u32..=12,
            year in 1970i32..=2069,
        ) {
            let raw = format!("{code} от {day:02}.{month:02}.{year}");
            let parsed = EntryReference::parse(&raw);
            prop_assert_eq!(parsed.code.as_deref(), Some(code.as_str()));
            prop_assert_eq!(parsed.date, Some(utc_day(year, month, day)));
        }
    }
}
