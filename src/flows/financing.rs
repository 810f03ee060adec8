//! EMI estimate for a car price, down payment and tenure.

use async_trait::async_trait;
use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use serde_json::Value;
use tracing::debug;

use crate::conversation::state::{FieldValue, FlowData, FlowName, Step};
use crate::error::ComposeError;
use crate::flows::compose::{Reply, ResponseComposer, ask_for, format_rupees};
use crate::flows::fields::{FieldIssue, FieldKind, FieldSpec};
use crate::flows::parse::{
    amount_value, find_in_vocab, first_integer, has_any, normalize, parse_amount,
};
use crate::flows::{
    ActionContext, FlowDefinition, Guard, RawFields, StepActions, StepKind, StepSpec, Target,
    Transition, Vocabulary,
};

pub const TENURES: &[i64] = &[12, 24, 36, 48, 60, 72];

pub const FIELDS: &[FieldSpec] = &[
    FieldSpec::new(
        "car_price",
        FieldKind::Amount {
            allow_zero: false,
            small_as_lakh: true,
        },
        "price of the car in rupees",
        "the price of the car",
    ),
    FieldSpec::new(
        "car_name",
        FieldKind::Text { min_len: 2 },
        "name of the car if mentioned, e.g. Hyundai Creta",
        "which car it is",
    ),
    FieldSpec::new(
        "down_payment",
        FieldKind::Amount {
            allow_zero: true,
            small_as_lakh: true,
        },
        "down payment in rupees; 0 if none",
        "your down payment",
    ),
    FieldSpec::new(
        "tenure",
        FieldKind::OneOf(TENURES),
        "loan tenure in months: 12, 24, 36, 48, 60 or 72",
        "the loan tenure (12 to 72 months)",
    ),
    FieldSpec::new("loan_amount", FieldKind::Derived, "", "the loan amount"),
    FieldSpec::new("interest_rate", FieldKind::Derived, "", "the interest rate"),
    FieldSpec::new("emi", FieldKind::Derived, "", "the EMI"),
    FieldSpec::new("total_amount", FieldKind::Derived, "", "the total payable"),
    FieldSpec::new("total_interest", FieldKind::Derived, "", "the total interest"),
];

const NO_DOWN_PAYMENT: &[&str] = &["no down payment", "zero", "nothing", "none", "nil"];

pub fn definition() -> FlowDefinition {
    FlowDefinition {
        flow: FlowName::Financing,
        entry: Step::SelectingCar,
        summary: "estimate the monthly EMI for a car loan",
        fields: FIELDS,
        steps: vec![
            StepSpec::new(Step::SelectingCar, StepKind::Collect, &["car_price"])
                .optional(&["car_name"])
                .then(Transition::to(Target::Step(Step::DownPayment))),
            StepSpec::new(Step::DownPayment, StepKind::Collect, &["down_payment"])
                .then(Transition::when(
                    Guard::Covers("down_payment", "car_price"),
                    Target::Step(Step::ShowingEstimate),
                ))
                .then(Transition::to(Target::Step(Step::SelectingTenure))),
            StepSpec::new(Step::SelectingTenure, StepKind::Collect, &["tenure"])
                .then(Transition::to(Target::Step(Step::ShowingEstimate))),
            StepSpec::new(Step::ShowingEstimate, StepKind::Display, &[])
                .then(Transition::to(Target::Complete)),
        ],
        fallback: parse_fields,
    }
}

/// Monthly instalment: P·r·(1+r)^n / ((1+r)^n − 1) with r the monthly rate.
///
/// `None` when the figures overflow.
pub fn emi(principal: Decimal, annual_rate: Decimal, months: i64) -> Option<Decimal> {
    if principal <= Decimal::ZERO || months <= 0 {
        return Some(Decimal::ZERO);
    }
    let r = annual_rate / dec!(12) / dec!(100);
    if r.is_zero() {
        return Some((principal / Decimal::from(months)).round_dp(2));
    }
    let growth = (Decimal::ONE + r).checked_powi(months)?;
    let numerator = principal.checked_mul(r)?.checked_mul(growth)?;
    numerator
        .checked_div(growth - Decimal::ONE)
        .map(|m| m.round_dp(2))
}

/// Deterministic field parse for the financing flow.
pub fn parse_fields(step: Step, text: &str, _data: &FlowData, vocab: &Vocabulary) -> RawFields {
    let mut fields = RawFields::new();
    let norm = normalize(text);
    match step {
        Step::SelectingCar => {
            if let Some(price) = parse_amount(text, true) {
                fields.insert("car_price".into(), amount_value(price));
            }
            if let Some(brand) = find_in_vocab(&norm, &vocab.brands) {
                let name = text
                    .split(|c: char| c.is_ascii_digit() || c == ',')
                    .next()
                    .map(str::trim)
                    .filter(|n| n.len() > brand.len())
                    .map(str::to_string)
                    .unwrap_or(brand);
                fields.insert("car_name".into(), Value::String(name));
            }
        }
        Step::DownPayment => {
            if has_any(&norm, NO_DOWN_PAYMENT) {
                fields.insert("down_payment".into(), amount_value(Decimal::ZERO));
            } else if let Some(amount) = parse_amount(text, true) {
                fields.insert("down_payment".into(), amount_value(amount));
            }
        }
        Step::SelectingTenure => {
            if let Some(n) = first_integer(text) {
                let months = if has_any(&norm, &["year", "years", "yr", "yrs"]) {
                    n.checked_mul(12)
                } else {
                    Some(n)
                };
                if let Some(months) = months {
                    fields.insert("tenure".into(), Value::from(months));
                }
            }
        }
        _ => {}
    }
    debug!(step = %step, fields = fields.len(), "Financing fallback parse");
    fields
}

pub struct FinancingActions {
    interest_rate: Decimal,
}

impl FinancingActions {
    pub fn new(interest_rate: Decimal) -> Self {
        Self { interest_rate }
    }
}

#[async_trait]
impl StepActions for FinancingActions {
    async fn on_enter(
        &self,
        step: Step,
        data: &mut FlowData,
        _ctx: &ActionContext<'_>,
    ) -> Result<(), FieldIssue> {
        if !matches!(step, Step::SelectingTenure | Step::ShowingEstimate) {
            return Ok(());
        }
        let price = data.amount("car_price").ok_or(FieldIssue::Missing { field: "car_price" })?;
        let down = data
            .amount("down_payment")
            .ok_or(FieldIssue::Missing { field: "down_payment" })?;
        let loan = (price - down).max(Decimal::ZERO);
        data.insert("loan_amount", FieldValue::Amount(loan));
        data.insert("interest_rate", FieldValue::Amount(self.interest_rate));

        if step == Step::ShowingEstimate
            && loan > Decimal::ZERO
            && let Some(months) = data.integer("tenure")
        {
            let too_large = || FieldIssue::Invalid {
                field: "car_price",
                reason: "that loan is too large to estimate".to_string(),
            };
            let monthly = emi(loan, self.interest_rate, months).ok_or_else(too_large)?;
            let total = monthly
                .checked_mul(Decimal::from(months))
                .ok_or_else(too_large)?
                .round_dp(2);
            data.insert("emi", FieldValue::Amount(monthly));
            data.insert("total_amount", FieldValue::Amount(total));
            data.insert("total_interest", FieldValue::Amount(total - loan));
        }
        Ok(())
    }
}

fn tenure_label(months: i64) -> String {
    match (months / 12, months % 12) {
        (0, m) => format!("{m} months"),
        (1, 0) => "1 year".to_string(),
        (y, 0) => format!("{y} years"),
        (y, m) => format!("{y} years {m} months"),
    }
}

pub struct FinancingComposer;

impl FinancingComposer {
    fn tenure_options(data: &FlowData) -> Result<String, ComposeError> {
        let loan = data
            .amount("loan_amount")
            .ok_or_else(|| ComposeError::MissingData("loan_amount".into()))?;
        let rate = data.amount("interest_rate").unwrap_or(dec!(9.5));
        let mut lines = vec![
            format!("Loan amount: {} at {}% a year.\n", format_rupees(loan), rate.normalize()),
            "Pick a tenure:".to_string(),
        ];
        for (i, months) in TENURES.iter().enumerate() {
            let monthly = emi(loan, rate, *months)
                .ok_or_else(|| ComposeError::MissingData("emi".into()))?;
            lines.push(format!(
                "{}. {} months ({}): about {}/month",
                i + 1,
                months,
                tenure_label(*months),
                format_rupees(monthly.round())
            ));
        }
        Ok(lines.join("\n"))
    }

    fn estimate(data: &FlowData) -> Result<String, ComposeError> {
        let missing = |k: &str| ComposeError::MissingData(k.to_string());
        let price = data.amount("car_price").ok_or_else(|| missing("car_price"))?;
        let down = data.amount("down_payment").ok_or_else(|| missing("down_payment"))?;
        let car = data.text("car_name").unwrap_or("your car");

        let Some(monthly) = data.amount("emi") else {
            return Ok(format!(
                "Your down payment of {} covers the price of {} ({}). No loan needed! 🎉\n\n\
                 Type *menu* to see what else I can do.",
                format_rupees(down),
                car,
                format_rupees(price)
            ));
        };
        let months = data.integer("tenure").ok_or_else(|| missing("tenure"))?;
        Ok(format!(
            "💰 *EMI Estimate*\n\n\
             • Car: {car} ({price})\n\
             • Down payment: {down}\n\
             • Loan amount: {loan}\n\
             • Interest rate: {rate}% a year\n\
             • Tenure: {months} months ({label})\n\n\
             💵 Monthly EMI: *{emi}*\n\
             Total payable: {total}\n\
             Total interest: {interest}\n\n\
             This is an approximate figure; the final EMI depends on your lender. \
             Type *menu* to see what else I can do.",
            price = format_rupees(price),
            down = format_rupees(down),
            loan = format_rupees(data.amount("loan_amount").ok_or_else(|| missing("loan_amount"))?),
            rate = data.amount("interest_rate").unwrap_or_default().normalize(),
            label = tenure_label(months),
            emi = format_rupees(monthly),
            total = format_rupees(data.amount("total_amount").unwrap_or_default()),
            interest = format_rupees(data.amount("total_interest").unwrap_or_default()),
        ))
    }
}

impl ResponseComposer for FinancingComposer {
    fn compose(&self, step: Step, data: &FlowData, reply: &Reply<'_>) -> Result<String, ComposeError> {
        match (step, reply) {
            (Step::SelectingCar, Reply::Prompt) => Ok(
                "Let's work out your EMI 💳\n\n\
                 What's the price of the car you have in mind? (e.g. 8.5 lakh)\n\
                 Haven't picked one yet? Type *browse* to see our cars."
                    .to_string(),
            ),
            (Step::DownPayment, Reply::Prompt) => {
                let price = data
                    .amount("car_price")
                    .ok_or_else(|| ComposeError::MissingData("car_price".into()))?;
                let car = match data.text("car_name") {
                    Some(name) => format!("the {name} at {}", format_rupees(price)),
                    None => format!("a car at {}", format_rupees(price)),
                };
                Ok(format!(
                    "For {car}, how much can you pay upfront as down payment? \
                     (e.g. 2 lakh, or 0 for none)"
                ))
            }
            (Step::SelectingTenure, Reply::Prompt) => Self::tenure_options(data),
            (Step::ShowingEstimate, Reply::Outcome) => Self::estimate(data),
            (_, Reply::Missing(issues)) => Ok(ask_for(FIELDS, issues)),
            _ => Err(ComposeError::NoTemplate {
                flow: FlowName::Financing,
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

    fn parse(step: Step, text: &str) -> RawFields {
        parse_fields(step, text, &FlowData::new(), &Vocabulary::default())
    }

    fn close(a: Decimal, b: Decimal) -> bool {
        (a - b).abs() <= dec!(0.05)
    }

    #[test]
    fn definition_is_valid() {
        definition().validate().unwrap();
    }

    #[test]
    fn emi_formula() {
        assert!(close(emi(dec!(500000), dec!(9.5), 60).unwrap(), dec!(10500.93)));
        assert!(close(emi(dec!(500000), dec!(9.5), 12).unwrap(), dec!(43841.76)));
        assert!(close(emi(dec!(750000), dec!(9.5), 72).unwrap(), dec!(13706.02)));
    }

    #[test]
    fn zero_rate_is_simple_division() {
        assert_eq!(emi(dec!(120000), Decimal::ZERO, 12), Some(dec!(10000)));
        assert_eq!(emi(Decimal::ZERO, dec!(9.5), 12), Some(Decimal::ZERO));
    }

    #[test]
    fn emi_overflow_is_none() {
        assert_eq!(emi(Decimal::MAX, dec!(9.5), 72), None);
    }

    #[test]
    fn huge_tenure_in_years_is_ignored() {
        assert!(!parse(Step::SelectingTenure, "999999999999999999 years").contains_key("tenure"));
    }

    #[test]
    fn down_payment_parsing() {
        assert_eq!(parse(Step::DownPayment, "2")["down_payment"], json!("200000"));
        assert_eq!(parse(Step::DownPayment, "50,000")["down_payment"], json!("50000"));
        assert_eq!(parse(Step::DownPayment, "no down payment")["down_payment"], json!("0"));
    }

    #[test]
    fn tenure_in_years_or_months() {
        assert_eq!(parse(Step::SelectingTenure, "5 years")["tenure"], json!(60));
        assert_eq!(parse(Step::SelectingTenure, "36 months")["tenure"], json!(36));
        assert_eq!(parse(Step::SelectingTenure, "3")["tenure"], json!(3));
    }

    #[test]
    fn car_price_with_name() {
        let f = parse(Step::SelectingCar, "Honda City 7.9 lakh");
        assert_eq!(f["car_price"], json!("790000"));
        assert_eq!(f["car_name"], json!("Honda City"));
    }

    #[test]
    fn tenure_labels() {
        assert_eq!(tenure_label(12), "1 year");
        assert_eq!(tenure_label(36), "3 years");
    }

    fn data(price: Decimal, down: Decimal, tenure: Option<i64>) -> FlowData {
        let mut d = FlowData::new();
        d.insert("car_price", FieldValue::Amount(price));
        d.insert("down_payment", FieldValue::Amount(down));
        if let Some(t) = tenure {
            d.insert("tenure", FieldValue::Integer(t));
        }
        d
    }

    #[tokio::test]
    async fn estimate_fills_derived_fields() {
        let store = InMemoryRecordStore::with_demo_catalog();
        let ctx = ActionContext {
            records: &store,
            timeout: Duration::from_secs(1),
        };
        let mut d = data(dec!(700000), dec!(200000), Some(60));
        FinancingActions::new(dec!(9.5))
            .on_enter(Step::ShowingEstimate, &mut d, &ctx)
            .await
            .unwrap();
        assert_eq!(d.amount("loan_amount"), Some(dec!(500000)));
        assert!(close(d.amount("emi").unwrap(), dec!(10500.93)));
        let text = FinancingComposer.compose(Step::ShowingEstimate, &d, &Reply::Outcome).unwrap();
        assert!(text.contains("₹5,00,000"));
        assert!(text.contains("60 months (5 years)"));
    }

    #[tokio::test]
    async fn overflowing_estimate_flags_the_price() {
        let store = InMemoryRecordStore::with_demo_catalog();
        let ctx = ActionContext {
            records: &store,
            timeout: Duration::from_secs(1),
        };
        let mut d = data(Decimal::MAX, Decimal::ZERO, Some(72));
        let issue = FinancingActions::new(dec!(9.5))
            .on_enter(Step::ShowingEstimate, &mut d, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(issue, FieldIssue::Invalid { field: "car_price", .. }));
        assert!(d.amount("emi").is_none());
    }

    #[tokio::test]
    async fn full_down_payment_needs_no_loan() {
        let store = InMemoryRecordStore::with_demo_catalog();
        let ctx = ActionContext {
            records: &store,
            timeout: Duration::from_secs(1),
        };
        let mut d = data(dec!(500000), dec!(600000), None);
        assert!(Guard::Covers("down_payment", "car_price").holds(&d));
        FinancingActions::new(dec!(9.5))
            .on_enter(Step::ShowingEstimate, &mut d, &ctx)
            .await
            .unwrap();
        assert_eq!(d.amount("loan_amount"), Some(Decimal::ZERO));
        assert!(!d.contains("emi"));
        let text = FinancingComposer.compose(Step::ShowingEstimate, &d, &Reply::Outcome).unwrap();
        assert!(text.contains("No loan needed"));
    }
}
