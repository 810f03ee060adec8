//! Deterministic text patterns shared by the fallback parsers.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::Datelike;
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;

/// Oldest model year accepted anywhere.
pub const MIN_YEAR: i32 = 1990;

const LAKH: Decimal = dec!(100000);

static UNIT_AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(crores?|cr|lakhs?|lacs?|l|thousand|k)\b").unwrap()
});
static PLAIN_AMOUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}(?:,\d{2,3})+|\d{4,})").unwrap());
static BARE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\d.])(\d+(?:\.\d+)?)(?:[^\d.]|$)").unwrap());
static LAKH_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(?:-|to|and)\s*(\d+(?:\.\d+)?)\s*(?:lakhs?|lacs?|l)\b")
        .unwrap()
});
static YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").unwrap());
static INTEGER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-?\d+").unwrap());
static REGISTRATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([a-z]{2})[\s-]?(\d{1,2})[\s-]?([a-z]{1,2})[\s-]?(\d{4})\b").unwrap()
});
static OPTION_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:option|no\.?|number|car)?\s*#?\s*(\d{1,2})\s*[.)]?\s*$").unwrap()
});

const ORDINALS: [&str; 10] = [
    "first", "second", "third", "fourth", "fifth", "sixth", "seventh", "eighth", "ninth", "tenth",
];

const YES_WORDS: &[&str] = &[
    "yes", "y", "yeah", "yep", "yup", "sure", "ok", "okay", "confirm", "confirmed", "correct",
    "proceed", "right", "absolutely", "definitely",
];
const YES_PHRASES: &[&str] = &["go ahead", "sounds good", "i do", "i have", "that s right", "looks good"];
const NO_WORDS: &[&str] = &["no", "n", "nope", "nah", "wrong", "incorrect", "negative"];
const NO_PHRASES: &[&str] = &["don t", "do not", "dont", "not", "haven t", "have not", "never"];

/// Lowercase, replace punctuation with spaces and pad with single spaces so
/// whole-word phrases can be found with `contains`.
pub fn normalize(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    format!(" {} ", words.join(" "))
}

/// Whether `phrase` occurs as whole words in already-normalized text.
pub fn has_phrase(normalized: &str, phrase: &str) -> bool {
    normalized.contains(&normalize(phrase))
}

pub fn has_any(normalized: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| has_phrase(normalized, p))
}

/// The longest vocabulary entry mentioned in the text, in its canonical form.
pub fn find_in_vocab(normalized: &str, vocab: &[String]) -> Option<String> {
    vocab
        .iter()
        .filter(|v| has_phrase(normalized, v))
        .max_by_key(|v| v.len())
        .cloned()
}

fn unit_multiplier(unit: &str) -> Decimal {
    let unit = unit.to_lowercase();
    if unit.starts_with("cr") {
        dec!(10000000)
    } else if unit.starts_with("la") || unit == "l" {
        LAKH
    } else {
        dec!(1000)
    }
}

/// Read a rupee amount: "7.5 lakh", "50k", "5,00,000", "450000".
///
/// With `bare_small_as_lakh`, a bare number below 100 is taken as lakh.
pub fn parse_amount(text: &str, bare_small_as_lakh: bool) -> Option<Decimal> {
    if let Some(caps) = UNIT_AMOUNT.captures(text) {
        let n = Decimal::from_str(&caps[1]).ok()?;
        return n.checked_mul(unit_multiplier(&caps[2]));
    }
    if let Some(caps) = PLAIN_AMOUNT.captures(text) {
        return Decimal::from_str(&caps[1].replace(',', "")).ok();
    }
    if bare_small_as_lakh
        && let Some(caps) = BARE_NUMBER.captures(text)
        && let Ok(n) = Decimal::from_str(&caps[1])
        && n < dec!(100)
    {
        return n.checked_mul(LAKH);
    }
    None
}

/// An amount as a raw field value for the validator.
pub fn amount_value(amount: Decimal) -> Value {
    Value::String(amount.normalize().to_string())
}

/// Read the upper bound of a budget: "8-10 lakh", "under 12 lakh", "7 lac".
pub fn parse_budget(text: &str) -> Option<Decimal> {
    if let Some(caps) = LAKH_RANGE.captures(text) {
        let hi = Decimal::from_str(&caps[2]).ok()?;
        return hi.checked_mul(LAKH);
    }
    parse_amount(text, false)
}

/// A plausible model year in the text.
pub fn parse_year(text: &str) -> Option<i32> {
    let current = chrono::Utc::now().year();
    YEAR.captures_iter(text)
        .filter_map(|c| c[1].parse::<i32>().ok())
        .find(|y| (MIN_YEAR..=current).contains(y))
}

pub fn first_integer(text: &str) -> Option<i64> {
    INTEGER.find(text).and_then(|m| m.as_str().parse().ok())
}

/// The last ten digits of a number with at least ten digits.
pub fn parse_phone(text: &str) -> Option<String> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 10 {
        return None;
    }
    Some(digits[digits.len() - 10..].to_string())
}

/// Normalize a registration number like "ka 1 ab 1234" to "KA01AB1234".
pub fn parse_registration(text: &str) -> Option<String> {
    let caps = REGISTRATION.captures(text)?;
    Some(format!(
        "{}{:0>2}{}{}",
        caps[1].to_uppercase(),
        &caps[2],
        caps[3].to_uppercase(),
        &caps[4]
    ))
}

const NAME_PREFIXES: &[&str] = &["my name is", "name is", "name:", "i am", "i'm", "this is"];

/// Drop a leading "my name is" and similar.
pub fn strip_name_prefix(text: &str) -> String {
    let text = text.trim();
    let lowered = text.to_lowercase();
    for prefix in NAME_PREFIXES {
        if lowered.starts_with(prefix) {
            return text.get(prefix.len()..).unwrap_or(text).trim().to_string();
        }
    }
    text.to_string()
}

pub fn has_name_prefix(text: &str) -> bool {
    let lowered = text.trim().to_lowercase();
    NAME_PREFIXES.iter().any(|p| lowered.starts_with(p))
}

/// The first word after `anchor` that `skip` does not reject, as typed.
/// A plain lowercase word is capitalized.
pub fn word_after(text: &str, anchor: &str, skip: impl Fn(&str) -> bool) -> Option<String> {
    let words: Vec<&str> = text
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .filter(|w| !w.is_empty())
        .collect();
    let anchor: Vec<String> = anchor.split_whitespace().map(str::to_lowercase).collect();
    if anchor.is_empty() {
        return None;
    }
    let start = words.windows(anchor.len()).position(|window| {
        window
            .iter()
            .zip(&anchor)
            .all(|(w, a)| w.to_lowercase() == *a)
    })?;
    let word = words[start + anchor.len()..]
        .iter()
        .find(|w| !skip(&w.to_lowercase()))?;
    if word.chars().all(|c| c.is_ascii_lowercase()) {
        let mut chars = word.chars();
        let first = chars.next()?;
        Some(first.to_ascii_uppercase().to_string() + chars.as_str())
    } else {
        Some(word.to_string())
    }
}

/// Interpret a short answer as yes or no.
pub fn parse_yes_no(text: &str) -> Option<bool> {
    let norm = normalize(text);
    let first = norm.split_whitespace().next()?;
    if YES_WORDS.contains(&first) {
        return Some(true);
    }
    if NO_WORDS.contains(&first) {
        return Some(false);
    }
    if has_any(&norm, NO_PHRASES) {
        return Some(false);
    }
    if has_any(&norm, YES_PHRASES) {
        return Some(true);
    }
    None
}

/// A menu pick: "2", "option 3", "#1", "the second one".
pub fn parse_option_number(text: &str, max: usize) -> Option<usize> {
    let n = if let Some(caps) = OPTION_NUMBER.captures(text) {
        caps[1].parse::<usize>().ok()?
    } else {
        let norm = normalize(text);
        ORDINALS.iter().position(|o| has_phrase(&norm, o))? + 1
    };
    (1..=max).contains(&n).then_some(n)
}
