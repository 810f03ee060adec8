//! Field declarations and validation of extracted values.

use std::str::FromStr;

use chrono::Datelike;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;

use crate::conversation::state::FieldValue;
use crate::flows::parse;

/// Largest amount accepted from a user: ₹10,000 crore.
pub const MAX_AMOUNT: Decimal = dec!(100000000000);

/// How a declared field is validated and normalized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    /// Free text with a minimum trimmed length.
    Text { min_len: usize },
    /// One of a fixed set of canonical options. A 1-based option number is
    /// also accepted.
    Choice(&'static [&'static str]),
    /// Rupee amount. Strings may use lakh/thousand notation. With
    /// `small_as_lakh`, a bare number under 100 is read as lakh.
    Amount { allow_zero: bool, small_as_lakh: bool },
    /// A model year between 1990 and the current year.
    Year,
    /// One of a fixed set of integers, or its 1-based position.
    OneOf(&'static [i64]),
    /// Integer in an inclusive range.
    Integer { min: i64, max: i64 },
    /// Ten-digit mobile number.
    Phone,
    /// Indian vehicle registration, e.g. KA01AB1234.
    Registration,
    Flag,
    /// Filled by step actions only; never taken from extraction.
    Derived,
}

/// A field a flow may collect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Extraction hint given to the model.
    pub description: &'static str,
    /// Phrase used when asking the user for this field.
    pub ask: &'static str,
}

impl FieldSpec {
    pub const fn new(
        name: &'static str,
        kind: FieldKind,
        description: &'static str,
        ask: &'static str,
    ) -> Self {
        Self {
            name,
            kind,
            description,
            ask,
        }
    }

    pub fn is_extractable(&self) -> bool {
        !matches!(self.kind, FieldKind::Derived)
    }

    /// Validate and normalize a raw extracted value.
    pub fn normalize(&self, raw: &Value) -> Result<FieldValue, FieldIssue> {
        let invalid = |reason: &str| FieldIssue::Invalid {
            field: self.name,
            reason: reason.to_string(),
        };
        let text = value_text(raw);

        match self.kind {
            FieldKind::Text { min_len } => {
                let t = text.ok_or_else(|| invalid("expected text"))?;
                let t = t.trim();
                if t.chars().count() < min_len {
                    return Err(invalid("that looks too short"));
                }
                Ok(FieldValue::Text(t.to_string()))
            }
            FieldKind::Choice(options) => {
                let t = text.ok_or_else(|| invalid("expected one of the listed options"))?;
                let key = canonical_key(&t);
                if let Ok(n) = key.parse::<usize>()
                    && (1..=options.len()).contains(&n)
                {
                    return Ok(FieldValue::Text(options[n - 1].to_string()));
                }
                options
                    .iter()
                    .find(|o| canonical_key(o) == key)
                    .map(|o| FieldValue::Text(o.to_string()))
                    .ok_or_else(|| invalid("please pick one of the listed options"))
            }
            FieldKind::Amount {
                allow_zero,
                small_as_lakh,
            } => {
                let amount = match raw {
                    Value::Number(n) => Decimal::from_str(&n.to_string()).ok().and_then(|d| {
                        if small_as_lakh && d > Decimal::ZERO && d < Decimal::ONE_HUNDRED {
                            d.checked_mul(Decimal::from(100_000))
                        } else {
                            Some(d)
                        }
                    }),
                    _ => text.as_deref().and_then(|t| parse::parse_amount(t, small_as_lakh)),
                }
                .ok_or_else(|| invalid("I couldn't read that amount"))?;
                if amount < Decimal::ZERO || (!allow_zero && amount.is_zero()) {
                    return Err(invalid("the amount must be more than zero"));
                }
                if amount > MAX_AMOUNT {
                    return Err(invalid("that amount looks too large"));
                }
                Ok(FieldValue::Amount(amount))
            }
            FieldKind::Year => {
                let year = value_int(raw).ok_or_else(|| invalid("expected a year like 2019"))?;
                let current = chrono::Utc::now().year() as i64;
                if !(parse::MIN_YEAR as i64..=current).contains(&year) {
                    return Err(invalid(&format!(
                        "the year must be between {} and {}",
                        parse::MIN_YEAR,
                        current
                    )));
                }
                Ok(FieldValue::Integer(year))
            }
            FieldKind::OneOf(allowed) => {
                let n = value_int(raw).ok_or_else(|| invalid("expected a number"))?;
                if allowed.contains(&n) {
                    return Ok(FieldValue::Integer(n));
                }
                if n >= 1 && (n as usize) <= allowed.len() {
                    return Ok(FieldValue::Integer(allowed[n as usize - 1]));
                }
                Err(invalid("please pick one of the listed options"))
            }
            FieldKind::Integer { min, max } => {
                let n = value_int(raw).ok_or_else(|| invalid("expected a number"))?;
                if !(min..=max).contains(&n) {
                    return Err(invalid(&format!("expected a number from {min} to {max}")));
                }
                Ok(FieldValue::Integer(n))
            }
            FieldKind::Phone => text
                .as_deref()
                .and_then(parse::parse_phone)
                .map(FieldValue::Text)
                .ok_or_else(|| invalid("a 10-digit mobile number is needed")),
            FieldKind::Registration => text
                .as_deref()
                .and_then(parse::parse_registration)
                .map(FieldValue::Text)
                .ok_or_else(|| invalid("registration numbers look like KA01AB1234")),
            FieldKind::Flag => match raw {
                Value::Bool(b) => Ok(FieldValue::Flag(*b)),
                _ => text
                    .as_deref()
                    .and_then(parse::parse_yes_no)
                    .map(FieldValue::Flag)
                    .ok_or_else(|| invalid("please answer yes or no")),
            },
            FieldKind::Derived => Err(invalid("not user-supplied")),
        }
    }
}

/// Why a step cannot advance yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldIssue {
    Missing { field: &'static str },
    Invalid { field: &'static str, reason: String },
    /// A catalogue search found nothing.
    NoMatches,
    /// A collaborator needed by the step did not answer.
    Unavailable,
}

impl FieldIssue {
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Missing { field } | Self::Invalid { field, .. } => Some(field),
            Self::NoMatches | Self::Unavailable => None,
        }
    }
}

fn value_text(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn value_int(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => parse::first_integer(s),
        _ => None,
    }
}

fn canonical_key(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const ACTION: FieldSpec = FieldSpec::new(
        "next_action",
        FieldKind::Choice(&["test_drive", "financing", "change"]),
        "",
        "",
    );

    fn spec(kind: FieldKind) -> FieldSpec {
        FieldSpec::new("f", kind, "", "")
    }

    #[test]
    fn choice_accepts_label_and_number() {
        assert_eq!(
            ACTION.normalize(&json!("Test Drive")).unwrap(),
            FieldValue::Text("test_drive".into())
        );
        assert_eq!(
            ACTION.normalize(&json!("2")).unwrap(),
            FieldValue::Text("financing".into())
        );
        assert!(ACTION.normalize(&json!("7")).is_err());
        assert!(ACTION.normalize(&json!("maybe")).is_err());
    }

    #[test]
    fn amount_reads_numbers_and_lakh() {
        let s = spec(FieldKind::Amount {
            allow_zero: false,
            small_as_lakh: false,
        });
        assert_eq!(s.normalize(&json!(850000)).unwrap(), FieldValue::Amount(dec!(850000)));
        assert_eq!(s.normalize(&json!("10 lakh")).unwrap(), FieldValue::Amount(dec!(1000000)));
        assert!(s.normalize(&json!(0)).is_err());
        assert!(s.normalize(&json!("lots")).is_err());
    }

    #[test]
    fn amount_rejects_absurd_values() {
        let s = spec(FieldKind::Amount {
            allow_zero: false,
            small_as_lakh: true,
        });
        assert!(s.normalize(&json!("90000000000000000000000000000")).is_err());
        assert!(matches!(
            s.normalize(&json!("5000000 crore")),
            Err(FieldIssue::Invalid { reason, .. }) if reason.contains("too large")
        ));
        assert_eq!(s.normalize(&json!(2)).unwrap(), FieldValue::Amount(dec!(200000)));
    }

    #[test]
    fn zero_amount_when_allowed() {
        let s = spec(FieldKind::Amount {
            allow_zero: true,
            small_as_lakh: false,
        });
        assert_eq!(s.normalize(&json!(0)).unwrap(), FieldValue::Amount(dec!(0)));
    }

    #[test]
    fn small_amounts_as_lakh() {
        let s = spec(FieldKind::Amount {
            allow_zero: true,
            small_as_lakh: true,
        });
        assert_eq!(s.normalize(&json!(2)).unwrap(), FieldValue::Amount(dec!(200000)));
        assert_eq!(s.normalize(&json!("1.5")).unwrap(), FieldValue::Amount(dec!(150000)));
        assert_eq!(s.normalize(&json!(50000)).unwrap(), FieldValue::Amount(dec!(50000)));
        assert_eq!(s.normalize(&json!(0)).unwrap(), FieldValue::Amount(dec!(0)));
    }

    #[test]
    fn year_range_is_enforced() {
        let s = spec(FieldKind::Year);
        assert_eq!(s.normalize(&json!(2018)).unwrap(), FieldValue::Integer(2018));
        assert_eq!(s.normalize(&json!("2015 model")).unwrap(), FieldValue::Integer(2015));
        assert!(s.normalize(&json!(1985)).is_err());
        assert!(s.normalize(&json!(2999)).is_err());
    }

    #[test]
    fn one_of_accepts_value_or_position() {
        let s = spec(FieldKind::OneOf(&[12, 24, 36]));
        assert_eq!(s.normalize(&json!(24)).unwrap(), FieldValue::Integer(24));
        assert_eq!(s.normalize(&json!("3")).unwrap(), FieldValue::Integer(36));
        assert!(s.normalize(&json!(48)).is_err());
    }

    #[test]
    fn phone_and_registration() {
        assert_eq!(
            spec(FieldKind::Phone).normalize(&json!("+91 98765 43210")).unwrap(),
            FieldValue::Text("9876543210".into())
        );
        assert!(spec(FieldKind::Phone).normalize(&json!("12345")).is_err());
        assert_eq!(
            spec(FieldKind::Registration).normalize(&json!("ka 01 ab 1234")).unwrap(),
            FieldValue::Text("KA01AB1234".into())
        );
    }

    #[test]
    fn flag_from_bool_or_words() {
        let s = spec(FieldKind::Flag);
        assert_eq!(s.normalize(&json!(true)).unwrap(), FieldValue::Flag(true));
        assert_eq!(s.normalize(&json!("no")).unwrap(), FieldValue::Flag(false));
        assert!(s.normalize(&json!("perhaps")).is_err());
    }

    #[test]
    fn derived_is_never_accepted() {
        let s = spec(FieldKind::Derived);
        assert!(!s.is_extractable());
        assert!(s.normalize(&json!("x")).is_err());
    }

    #[test]
    fn short_text_is_invalid() {
        let s = spec(FieldKind::Text { min_len: 2 });
        let err = s.normalize(&json!(" a ")).unwrap_err();
        assert_eq!(err.field(), Some("f"));
    }
}
