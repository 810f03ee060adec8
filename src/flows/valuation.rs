//! Used-car valuation: collect the vehicle, then show an estimate.

use async_trait::async_trait;
use chrono::Datelike;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use tracing::{debug, warn};

use crate::conversation::state::{FieldValue, FlowData, FlowName, Step};
use crate::error::ComposeError;
use crate::flows::compose::{Reply, ResponseComposer, ask_for, format_lakh, format_rupees};
use crate::flows::fields::{FieldIssue, FieldKind, FieldSpec};
use crate::flows::parse::{
    find_in_vocab, has_phrase, normalize, parse_registration, parse_year, word_after,
};
use crate::flows::{
    ActionContext, FlowDefinition, RawFields, StepActions, StepKind, StepSpec, Target, Transition,
    Vocabulary,
};

const FUEL_TYPES: &[&str] = &["petrol", "diesel", "cng", "electric", "hybrid"];
const CONDITIONS: &[&str] = &["excellent", "very_good", "good", "average", "fair", "poor"];

pub const FIELDS: &[FieldSpec] = &[
    FieldSpec::new("brand", FieldKind::Text { min_len: 2 }, "make of the user's car", "the brand"),
    FieldSpec::new(
        "model",
        FieldKind::Text { min_len: 1 },
        "model name of the user's car, e.g. Creta or Swift",
        "the model",
    ),
    FieldSpec::new("year", FieldKind::Year, "year of manufacture", "the year it was made"),
    FieldSpec::new(
        "fuel_type",
        FieldKind::Choice(FUEL_TYPES),
        "one of petrol, diesel, cng, electric, hybrid",
        "the fuel type (petrol, diesel, CNG...)",
    ),
    FieldSpec::new(
        "condition",
        FieldKind::Choice(CONDITIONS),
        "one of excellent, very_good, good, average, fair, poor",
        "its condition (excellent, good, average...)",
    ),
    FieldSpec::new("valuation", FieldKind::Derived, "", "the estimate"),
    FieldSpec::new("base_price", FieldKind::Derived, "", "the base price"),
    FieldSpec::new("age_years", FieldKind::Derived, "", "the age"),
];

/// Keyword families for condition, checked in order.
const CONDITION_WORDS: &[(&str, &[&str])] = &[
    ("excellent", &["excellent", "perfect", "mint", "like new", "showroom condition"]),
    ("very_good", &["very good", "great condition", "almost new"]),
    ("poor", &["poor", "bad", "damaged", "needs repair", "rough"]),
    ("good", &["good", "well maintained", "decent"]),
    ("average", &["average", "okay", "ok", "normal", "regular"]),
    ("fair", &["fair", "usable"]),
];

const FUEL_WORDS: &[(&str, &[&str])] = &[
    ("petrol", &["petrol", "gasoline"]),
    ("diesel", &["diesel"]),
    ("cng", &["cng"]),
    ("electric", &["electric", "ev"]),
    ("hybrid", &["hybrid"]),
];

/// Filler words skipped when guessing a model name after the brand.
const NOT_A_MODEL: &[&str] = &[
    "car", "model", "my", "a", "an", "the", "is", "it", "its", "of", "from", "year", "in", "and",
    "with", "condition",
];

/// Catalogue-independent base prices.
const BRAND_BASE_PRICES: &[(&str, Decimal)] = &[
    ("tata", dec!(800000)),
    ("hyundai", dec!(900000)),
    ("maruti", dec!(700000)),
    ("mahindra", dec!(850000)),
    ("honda", dec!(1000000)),
    ("toyota", dec!(1100000)),
    ("ford", dec!(950000)),
    ("renault", dec!(800000)),
    ("skoda", dec!(1200000)),
    ("nissan", dec!(900000)),
];
const DEFAULT_BASE_PRICE: Decimal = dec!(800000);

pub fn definition() -> FlowDefinition {
    FlowDefinition {
        flow: FlowName::Valuation,
        entry: Step::CollectingVehicle,
        summary: "estimate the resale value of the user's car",
        fields: FIELDS,
        steps: vec![
            StepSpec::new(
                Step::CollectingVehicle,
                StepKind::Collect,
                &["brand", "model", "year", "fuel_type", "condition"],
            )
            .then(Transition::to(Target::Step(Step::ShowingValuation))),
            StepSpec::new(Step::ShowingValuation, StepKind::Display, &[])
                .then(Transition::to(Target::Complete)),
        ],
        fallback: parse_fields,
    }
}

pub fn brand_base_price(brand: &str) -> Decimal {
    BRAND_BASE_PRICES
        .iter()
        .find(|(b, _)| b.eq_ignore_ascii_case(brand))
        .map(|(_, p)| *p)
        .unwrap_or(DEFAULT_BASE_PRICE)
}

pub fn condition_multiplier(condition: &str) -> Decimal {
    match condition {
        "excellent" => dec!(1.0),
        "very_good" => dec!(0.9),
        "good" => dec!(0.8),
        "fair" => dec!(0.6),
        "poor" => dec!(0.5),
        _ => dec!(0.7),
    }
}

/// Share of the base price left after `age` years.
pub fn depreciation_factor(age: i64) -> Decimal {
    let age = Decimal::from(age.max(0));
    let factor = if age <= dec!(5) {
        Decimal::ONE - age * dec!(0.10)
    } else {
        dec!(0.5) - (age - dec!(5)) * dec!(0.05)
    };
    factor.max(dec!(0.2))
}

/// Estimated value rounded to the nearest thousand rupees.
pub fn estimate_value(base: Decimal, age: i64, condition: &str) -> Decimal {
    let raw = base * depreciation_factor(age) * condition_multiplier(condition);
    (raw / dec!(1000)).round() * dec!(1000)
}

/// Deterministic field parse for the valuation flow.
pub fn parse_fields(step: Step, text: &str, data: &FlowData, vocab: &Vocabulary) -> RawFields {
    let mut fields = RawFields::new();
    if step != Step::CollectingVehicle {
        return fields;
    }
    let norm = normalize(text);

    let brand = find_in_vocab(&norm, &vocab.brands);
    if let Some(brand) = &brand {
        fields.insert("brand".into(), Value::String(brand.clone()));
    }
    if let Some(year) = parse_year(text) {
        fields.insert("year".into(), Value::from(year));
    }
    if let Some(fuel) = keyword_family(&norm, FUEL_WORDS) {
        fields.insert("fuel_type".into(), Value::String(fuel.into()));
    }
    if let Some(condition) = keyword_family(&norm, CONDITION_WORDS) {
        fields.insert("condition".into(), Value::String(condition.into()));
    }

    let model = match &brand {
        Some(brand) => model_after_brand(text, brand),
        // A lone word once the brand is known is most likely the model.
        None if data.contains("brand") && !data.contains("model") && fields.is_empty() => {
            let words: Vec<&str> = norm.split_whitespace().collect();
            match words.as_slice() {
                [one] | [one, _] if !NOT_A_MODEL.contains(one) => Some(text.trim().to_string()),
                _ => None,
            }
        }
        None => None,
    };
    if let Some(model) = model {
        fields.insert("model".into(), Value::String(model));
    }
    debug!(fields = fields.len(), "Valuation fallback parse");
    fields
}

fn keyword_family(norm: &str, families: &[(&'static str, &[&str])]) -> Option<&'static str> {
    families
        .iter()
        .find(|(_, words)| words.iter().any(|w| has_phrase(norm, w)))
        .map(|(name, _)| *name)
}

/// The model name that follows a brand, e.g. "Creta" in "Hyundai Creta 2019".
pub(crate) fn model_after_brand(text: &str, brand: &str) -> Option<String> {
    word_after(text, brand, |w| {
        NOT_A_MODEL.contains(&w)
            || w.parse::<i64>().is_ok()
            || parse_registration(w).is_some()
            || keyword_family(&format!(" {w} "), FUEL_WORDS).is_some()
            || keyword_family(&format!(" {w} "), CONDITION_WORDS).is_some()
    })
}

pub struct ValuationActions;

#[async_trait]
impl StepActions for ValuationActions {
    async fn on_enter(
        &self,
        step: Step,
        data: &mut FlowData,
        ctx: &ActionContext<'_>,
    ) -> Result<(), FieldIssue> {
        if step != Step::ShowingValuation {
            return Ok(());
        }
        let brand = data.text("brand").ok_or(FieldIssue::Missing { field: "brand" })?.to_string();
        let model = data.text("model").ok_or(FieldIssue::Missing { field: "model" })?.to_string();
        let year = data.integer("year").ok_or(FieldIssue::Missing { field: "year" })?;
        let condition = data
            .text("condition")
            .ok_or(FieldIssue::Missing { field: "condition" })?
            .to_string();

        let base = match tokio::time::timeout(ctx.timeout, ctx.records.average_price(&brand, &model)).await {
            Ok(Ok(Some(avg))) => avg,
            Ok(Ok(None)) => brand_base_price(&brand),
            Ok(Err(e)) => {
                warn!("Average price lookup failed, using brand default: {}", e);
                brand_base_price(&brand)
            }
            Err(_) => {
                warn!("Average price lookup timed out, using brand default");
                brand_base_price(&brand)
            }
        };
        let age = i64::from(chrono::Utc::now().year()) - year;
        let value = estimate_value(base, age, &condition);
        debug!(%brand, %model, year, %value, "Valuation computed");

        data.insert("base_price", FieldValue::Amount(base));
        data.insert("age_years", FieldValue::Integer(age));
        data.insert("valuation", FieldValue::Amount(value));
        Ok(())
    }
}

pub struct ValuationComposer;

impl ValuationComposer {
    fn result(data: &FlowData) -> Result<String, ComposeError> {
        let missing = |k: &str| ComposeError::MissingData(k.to_string());
        let value = data.amount("valuation").ok_or_else(|| missing("valuation"))?;
        let low = (value * dec!(0.9)).round();
        let high = (value * dec!(1.1)).round();
        let condition = data.text("condition").unwrap_or("average").replace('_', " ");
        Ok(format!(
            "📊 *Car Valuation*\n\n\
             • Car: {brand} {model}\n\
             • Year: {year} ({age} years old)\n\
             • Fuel: {fuel}\n\
             • Condition: {condition}\n\n\
             💰 Estimated value: {value} ({lakh})\n\
             Likely range: {low} to {high}\n\n\
             This is an approximate figure. A physical inspection at our showroom gives an exact offer. \
             Type *menu* to see what else I can do.",
            brand = data.text("brand").ok_or_else(|| missing("brand"))?,
            model = data.text("model").ok_or_else(|| missing("model"))?,
            year = data.integer("year").ok_or_else(|| missing("year"))?,
            age = data.integer("age_years").unwrap_or(0),
            fuel = data.text("fuel_type").unwrap_or("-"),
            value = format_rupees(value),
            lakh = format_lakh(value),
            low = format_rupees(low),
            high = format_rupees(high),
        ))
    }
}

impl ResponseComposer for ValuationComposer {
    fn compose(&self, step: Step, data: &FlowData, reply: &Reply<'_>) -> Result<String, ComposeError> {
        match (step, reply) {
            (Step::CollectingVehicle, Reply::Prompt) => Ok(
                "Let's find out what your car is worth! 💰\n\n\
                 Please tell me the brand, model, year, fuel type and condition, \
                 e.g. \"Hyundai Creta 2019 petrol, good condition\"."
                    .to_string(),
            ),
            (Step::CollectingVehicle, Reply::Restarted) => {
                Ok("Sure, let's value a car from scratch. Which brand and model is it?".to_string())
            }
            (Step::ShowingValuation, Reply::Outcome) => Self::result(data),
            (_, Reply::Missing(issues)) => Ok(ask_for(FIELDS, issues)),
            _ => Err(ComposeError::NoTemplate {
                flow: FlowName::Valuation,
                step,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::store::InMemoryRecordStore;

    #[test]
    fn definition_is_valid() {
        definition().validate().unwrap();
    }

    #[test]
    fn depreciation_curve() {
        assert_eq!(depreciation_factor(0), dec!(1.0));
        assert_eq!(depreciation_factor(3), dec!(0.70));
        assert_eq!(depreciation_factor(5), dec!(0.50));
        assert_eq!(depreciation_factor(7), dec!(0.40));
        assert_eq!(depreciation_factor(20), dec!(0.2));
    }

    #[test]
    fn estimate_rounds_to_thousand() {
        // 900000 * 0.7 * 0.8 = 504000
        assert_eq!(estimate_value(dec!(900000), 3, "good"), dec!(504000));
        // 777777 * 1.0 * 0.9 = 699999.3
        assert_eq!(estimate_value(dec!(777777), 0, "very_good"), dec!(700000));
    }

    #[test]
    fn brand_defaults() {
        assert_eq!(brand_base_price("Skoda"), dec!(1200000));
        assert_eq!(brand_base_price("Kia"), dec!(800000));
    }

    #[test]
    fn parses_full_description() {
        let f = parse_fields(
            Step::CollectingVehicle,
            "Hyundai Creta 2019 petrol, well maintained",
            &FlowData::new(),
            &Vocabulary::default(),
        );
        assert_eq!(f["brand"], json!("Hyundai"));
        assert_eq!(f["model"], json!("Creta"));
        assert_eq!(f["year"], json!(2019));
        assert_eq!(f["fuel_type"], json!("petrol"));
        assert_eq!(f["condition"], json!("good"));
    }

    #[test]
    fn very_good_beats_good() {
        let f = parse_fields(
            Step::CollectingVehicle,
            "very good condition",
            &FlowData::new(),
            &Vocabulary::default(),
        );
        assert_eq!(f["condition"], json!("very_good"));
    }

    #[test]
    fn lone_word_is_model_once_brand_known() {
        let mut data = FlowData::new();
        data.insert("brand", FieldValue::Text("Maruti".into()));
        let f = parse_fields(Step::CollectingVehicle, "Swift", &data, &Vocabulary::default());
        assert_eq!(f["model"], json!("Swift"));
    }

    #[tokio::test]
    async fn catalogue_average_is_base_price() {
        let store = InMemoryRecordStore::with_demo_catalog();
        let ctx = ActionContext {
            records: &store,
            timeout: Duration::from_secs(1),
        };
        let current = chrono::Utc::now().year() as i64;
        let mut data: FlowData = [
            ("brand", FieldValue::Text("Honda".into())),
            ("model", FieldValue::Text("City".into())),
            ("year", FieldValue::Integer(current - 2)),
            ("fuel_type", FieldValue::Text("petrol".into())),
            ("condition", FieldValue::Text("excellent".into())),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        ValuationActions.on_enter(Step::ShowingValuation, &mut data, &ctx).await.unwrap();
        assert_eq!(data.amount("base_price"), Some(dec!(790000)));
        // 790000 * 0.8 * 1.0
        assert_eq!(data.amount("valuation"), Some(dec!(632000)));

        let text = ValuationComposer
            .compose(Step::ShowingValuation, &data, &Reply::Outcome)
            .unwrap();
        assert!(text.contains("₹6,32,000"));
        assert!(text.contains("6.32 lakh"));
    }
}
