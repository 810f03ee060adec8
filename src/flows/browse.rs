//! Browse the catalogue, pick a car and book a test drive.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};

use crate::conversation::state::{ConversationState, FieldValue, FlowData, FlowName, Step};
use crate::error::ComposeError;
use crate::flows::compose::{Reply, ResponseComposer, ask_for, format_lakh, format_rupees};
use crate::flows::fields::{FieldIssue, FieldKind, FieldSpec};
use crate::flows::parse::{
    amount_value, find_in_vocab, has_any, has_name_prefix, normalize, parse_budget,
    parse_option_number, parse_phone, parse_yes_no, strip_name_prefix,
};
use crate::flows::{
    ActionContext, FlowDefinition, Guard, RawFields, StepActions, StepKind, StepSpec, Target,
    Transition, Vocabulary,
};
use crate::store::{CommitRequest, DriveLocation, SearchCriteria, TestDriveBooking};

/// Most results shown for one search.
pub const MAX_RESULTS: usize = 10;

/// Value stored for "no preference" on brand or body type.
pub const ANY: &str = "any";

pub const FIELDS: &[FieldSpec] = &[
    FieldSpec::new(
        "brand",
        FieldKind::Text { min_len: 2 },
        "car brand the user wants, e.g. Hyundai; \"any\" if they have no preference",
        "which brand you prefer",
    ),
    FieldSpec::new(
        "budget",
        FieldKind::Amount {
            allow_zero: false,
            small_as_lakh: true,
        },
        "maximum budget in rupees; for a range use the upper end",
        "your budget",
    ),
    FieldSpec::new(
        "car_type",
        FieldKind::Text { min_len: 2 },
        "body type such as SUV, Sedan or Hatchback; \"any\" if no preference",
        "the type of car (SUV, sedan, hatchback...)",
    ),
    FieldSpec::new("results", FieldKind::Derived, "", "a search"),
    FieldSpec::new(
        "selection",
        FieldKind::Integer { min: 1, max: MAX_RESULTS as i64 },
        "number of the car picked from the results list",
        "the number of the car you like",
    ),
    FieldSpec::new(
        "results_action",
        FieldKind::Choice(&["change"]),
        "\"change\" if the user wants to search again with different criteria",
        "whether you want to change your search",
    ),
    FieldSpec::new("selected_car", FieldKind::Derived, "", "a car"),
    FieldSpec::new(
        "next_action",
        FieldKind::Choice(&["test_drive", "financing", "change"]),
        "one of test_drive, financing or change (menu options 1, 2, 3)",
        "what you'd like to do next (1, 2 or 3)",
    ),
    FieldSpec::new(
        "preferred_date",
        FieldKind::Text { min_len: 2 },
        "test drive date as the user said it, e.g. tomorrow or 12 March",
        "the date for your test drive",
    ),
    FieldSpec::new(
        "preferred_time",
        FieldKind::Text { min_len: 2 },
        "test drive time as the user said it, e.g. 11am or evening",
        "a time that suits you",
    ),
    FieldSpec::new(
        "customer_name",
        FieldKind::Text { min_len: 2 },
        "the user's full name",
        "your name",
    ),
    FieldSpec::new("phone", FieldKind::Phone, "10-digit mobile number", "your 10-digit mobile number"),
    FieldSpec::new(
        "has_license",
        FieldKind::Flag,
        "true if the user has a valid driving licence",
        "whether you have a valid driving licence",
    ),
    FieldSpec::new(
        "location",
        FieldKind::Choice(&["showroom", "home"]),
        "showroom, or home for a drive from their address",
        "showroom or home",
    ),
    FieldSpec::new(
        "address",
        FieldKind::Text { min_len: 5 },
        "address for a home test drive",
        "your address",
    ),
];

const CHANGE_WORDS: &[&str] = &[
    "change", "modify", "different", "new search", "search again", "start over", "other cars",
];
const TEST_DRIVE_WORDS: &[&str] = &["test drive", "drive", "book"];
const FINANCE_WORDS: &[&str] = &["emi", "loan", "finance", "financing", "installment"];
const ANY_BRAND: &[&str] = &["any brand", "any make", "no preference", "all brands", "doesn t matter"];
const ANY_TYPE: &[&str] = &["any type", "any body", "any car type", "all types"];

pub fn definition() -> FlowDefinition {
    use Step::*;
    FlowDefinition {
        flow: FlowName::Browse,
        entry: CollectingCriteria,
        summary: "find a used car in the catalogue and book a test drive",
        fields: FIELDS,
        steps: vec![
            StepSpec::new(CollectingCriteria, StepKind::Collect, &["brand", "budget", "car_type"])
                .then(Transition::to(Target::Step(ShowingResults))),
            StepSpec::new(ShowingResults, StepKind::Menu, &["selection"])
                .optional(&["results_action"])
                .check(selection_in_results)
                .then(Transition::escape(Guard::Equals("results_action", "change"), Target::Restart))
                .then(Transition::to(Target::Step(CarSelected))),
            StepSpec::new(CarSelected, StepKind::Menu, &["next_action"])
                .absorbs(&[FlowName::Financing])
                .then(Transition::when(
                    Guard::Equals("next_action", "test_drive"),
                    Target::Step(TestDriveDate),
                ))
                .then(Transition::when(
                    Guard::Equals("next_action", "financing"),
                    Target::Handoff(FlowName::Financing),
                ))
                .then(Transition::when(Guard::Equals("next_action", "change"), Target::Restart)),
            StepSpec::new(TestDriveDate, StepKind::Collect, &["preferred_date"])
                .then(Transition::to(Target::Step(TestDriveTime))),
            StepSpec::new(TestDriveTime, StepKind::Collect, &["preferred_time"])
                .then(Transition::to(Target::Step(TestDriveName))),
            StepSpec::new(TestDriveName, StepKind::Collect, &["customer_name"])
                .then(Transition::to(Target::Step(TestDrivePhone))),
            StepSpec::new(TestDrivePhone, StepKind::Collect, &["phone"])
                .then(Transition::to(Target::Step(TestDriveLicense))),
            StepSpec::new(TestDriveLicense, StepKind::Collect, &["has_license"])
                .then(Transition::when(Guard::Flag("has_license", false), Target::Exit))
                .then(Transition::to(Target::Step(TestDriveLocation))),
            StepSpec::new(TestDriveLocation, StepKind::Collect, &["location"])
                .then(Transition::when(
                    Guard::Equals("location", "home"),
                    Target::Step(TestDriveAddress),
                ))
                .then(Transition::to(Target::Step(TestDriveConfirm))),
            StepSpec::new(TestDriveAddress, StepKind::Collect, &["address"])
                .then(Transition::to(Target::Step(TestDriveConfirm))),
            StepSpec::new(TestDriveConfirm, StepKind::Confirm, &[])
                .then(Transition::to(Target::Complete)),
        ],
        fallback: parse_fields,
    }
}

fn selection_in_results(data: &FlowData) -> Result<(), FieldIssue> {
    let count = data.cars("results").map(<[_]>::len).unwrap_or(0);
    match data.integer("selection") {
        Some(n) if n >= 1 && n as usize <= count => Ok(()),
        _ => Err(FieldIssue::Invalid {
            field: "selection",
            reason: format!("there are only {count} cars in the list"),
        }),
    }
}

/// Deterministic field parse for the browse flow.
pub fn parse_fields(step: Step, text: &str, _data: &FlowData, vocab: &Vocabulary) -> RawFields {
    let mut fields = RawFields::new();
    let norm = normalize(text);
    let trimmed = text.trim();

    match step {
        Step::CollectingCriteria => {
            if let Some(brand) = find_in_vocab(&norm, &vocab.brands) {
                fields.insert("brand".into(), Value::String(brand));
            } else if has_any(&norm, ANY_BRAND) {
                fields.insert("brand".into(), Value::String(ANY.into()));
            }
            if let Some(car_type) = find_in_vocab(&norm, &vocab.car_types) {
                fields.insert("car_type".into(), Value::String(car_type));
            } else if has_any(&norm, ANY_TYPE) {
                fields.insert("car_type".into(), Value::String(ANY.into()));
            }
            // A bare "8" on its own means 8 lakh.
            let budget = parse_budget(text).or_else(|| {
                trimmed
                    .parse::<Decimal>()
                    .ok()
                    .filter(|n| *n > Decimal::ZERO && *n < Decimal::ONE_HUNDRED)
                    .and_then(|n| n.checked_mul(Decimal::from(100_000)))
            });
            if let Some(budget) = budget {
                fields.insert("budget".into(), amount_value(budget));
            }
            if norm.trim() == ANY {
                fields.entry("brand").or_insert_with(|| Value::String(ANY.into()));
                fields.entry("car_type").or_insert_with(|| Value::String(ANY.into()));
            }
        }
        Step::ShowingResults => {
            if has_any(&norm, CHANGE_WORDS) {
                fields.insert("results_action".into(), Value::String("change".into()));
            } else if let Some(n) = parse_option_number(text, MAX_RESULTS) {
                fields.insert("selection".into(), Value::from(n as u64));
            }
        }
        Step::CarSelected => {
            let action = match parse_option_number(text, 3) {
                Some(1) => Some("test_drive"),
                Some(2) => Some("financing"),
                Some(3) => Some("change"),
                _ if has_any(&norm, FINANCE_WORDS) => Some("financing"),
                _ if has_any(&norm, CHANGE_WORDS) => Some("change"),
                _ if has_any(&norm, TEST_DRIVE_WORDS) => Some("test_drive"),
                _ => None,
            };
            if let Some(action) = action {
                fields.insert("next_action".into(), Value::String(action.into()));
            }
        }
        Step::TestDriveDate => {
            fields.insert("preferred_date".into(), Value::String(trimmed.into()));
        }
        Step::TestDriveTime => {
            fields.insert("preferred_time".into(), Value::String(trimmed.into()));
        }
        Step::TestDriveName => {
            fields.insert("customer_name".into(), Value::String(strip_name_prefix(trimmed)));
        }
        Step::TestDrivePhone => {
            let phone = parse_phone(text).unwrap_or_else(|| trimmed.to_string());
            fields.insert("phone".into(), Value::String(phone));
        }
        Step::TestDriveLicense => {
            let value = match parse_yes_no(text) {
                Some(flag) => Value::Bool(flag),
                None => Value::String(trimmed.into()),
            };
            fields.insert("has_license".into(), value);
        }
        Step::TestDriveLocation => {
            fields.insert("location".into(), location_value(&norm, trimmed));
        }
        Step::TestDriveAddress => {
            fields.insert("address".into(), Value::String(trimmed.into()));
        }
        Step::TestDriveConfirm => {
            // Edits while the summary is pending.
            if let Some(phone) = parse_phone(text) {
                fields.insert("phone".into(), Value::String(phone));
            }
            if has_any(&norm, &["showroom", "home", "house"]) {
                fields.insert("location".into(), location_value(&norm, trimmed));
            }
            if has_name_prefix(trimmed) {
                fields.insert("customer_name".into(), Value::String(strip_name_prefix(trimmed)));
            }
        }
        _ => {}
    }
    debug!(step = %step, fields = fields.len(), "Browse fallback parse");
    fields
}

fn location_value(norm: &str, trimmed: &str) -> Value {
    let picked = match parse_option_number(trimmed, 2) {
        Some(1) => Some("showroom"),
        Some(2) => Some("home"),
        _ if has_any(norm, &["home", "house", "my place", "doorstep"]) => Some("home"),
        _ if has_any(norm, &["showroom", "dealership", "store"]) => Some("showroom"),
        _ => None,
    };
    Value::String(picked.unwrap_or(trimmed).to_string())
}

fn criteria_from(data: &FlowData) -> SearchCriteria {
    let pick = |key: &str| {
        data.text(key)
            .filter(|v| !v.eq_ignore_ascii_case(ANY))
            .map(str::to_string)
    };
    SearchCriteria {
        brand: pick("brand"),
        model: None,
        car_type: pick("car_type"),
        max_price: data.amount("budget"),
        limit: MAX_RESULTS,
    }
}

pub struct BrowseActions;

#[async_trait]
impl StepActions for BrowseActions {
    async fn on_enter(
        &self,
        step: Step,
        data: &mut FlowData,
        ctx: &ActionContext<'_>,
    ) -> Result<(), FieldIssue> {
        match step {
            Step::ShowingResults => {
                let criteria = criteria_from(data);
                let cars = match tokio::time::timeout(ctx.timeout, ctx.records.search(&criteria)).await {
                    Ok(Ok(cars)) => cars,
                    Ok(Err(e)) => {
                        warn!("Catalogue search failed: {}", e);
                        return Err(FieldIssue::Unavailable);
                    }
                    Err(_) => {
                        warn!("Catalogue search timed out after {:?}", ctx.timeout);
                        return Err(FieldIssue::Unavailable);
                    }
                };
                debug!(found = cars.len(), "Catalogue search");
                if cars.is_empty() {
                    return Err(FieldIssue::NoMatches);
                }
                // A pick from an older list must not carry over.
                data.remove("selection");
                data.remove("results_action");
                data.insert("results", FieldValue::Cars(cars));
                Ok(())
            }
            Step::CarSelected => {
                let car = data
                    .integer("selection")
                    .and_then(|n| usize::try_from(n).ok())
                    .and_then(|n| data.cars("results").and_then(|cars| cars.get(n.wrapping_sub(1))))
                    .cloned()
                    .ok_or(FieldIssue::Missing { field: "selection" })?;
                data.remove("next_action");
                data.insert("selected_car", FieldValue::Car(car));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn commit_request(&self, step: Step, state: &ConversationState) -> Option<CommitRequest> {
        if step != Step::TestDriveConfirm {
            return None;
        }
        let data = &state.data;
        let car = data.car("selected_car")?;
        let location = match data.text("location")? {
            "home" => DriveLocation::Home,
            _ => DriveLocation::Showroom,
        };
        Some(CommitRequest::TestDrive(TestDriveBooking {
            idempotency_key: state.session_id,
            user_id: state.user_id.clone(),
            car_id: car.id,
            car_label: car.label(),
            customer_name: data.text("customer_name")?.to_string(),
            phone: data.text("phone")?.to_string(),
            has_license: data.flag("has_license")?,
            preferred_date: data.text("preferred_date")?.to_string(),
            preferred_time: data.text("preferred_time")?.to_string(),
            location,
            address: match location {
                DriveLocation::Home => data.text("address").map(str::to_string),
                DriveLocation::Showroom => None,
            },
        }))
    }

    fn handoff(&self, to: FlowName, data: &FlowData) -> FlowData {
        let mut carried = FlowData::new();
        if to == FlowName::Financing
            && let Some(car) = data.car("selected_car")
        {
            carried.insert("car_price", FieldValue::Amount(car.price));
            carried.insert("car_name", FieldValue::Text(car.label()));
        }
        carried
    }
}

const CRITERIA_PROMPT: &str = "Great, let's find your next car! 🚗\n\n\
     Tell me:\n\
     • Brand (e.g. Hyundai, Maruti, Tata, or \"any\")\n\
     • Budget (e.g. 8 lakh, or 5-7 lakh)\n\
     • Type (SUV, sedan, hatchback...)\n\n\
     You can send them all in one message, like \"Hyundai SUV under 10 lakh\".";

pub struct BrowseComposer;

impl BrowseComposer {
    fn results(data: &FlowData) -> Result<String, ComposeError> {
        let cars = data
            .cars("results")
            .ok_or_else(|| ComposeError::MissingData("results".into()))?;
        let mut lines = vec![format!("I found {} car(s) for you:\n", cars.len())];
        for (i, car) in cars.iter().enumerate() {
            lines.push(format!(
                "{}. {}\n   ₹{} · {} · {}",
                i + 1,
                car.label(),
                format_lakh(car.price),
                car.fuel_type,
                car.car_type
            ));
        }
        lines.push(String::new());
        lines.push("Reply with the number of the car you like, or say *change* to search again.".into());
        Ok(lines.join("\n"))
    }

    fn summary(data: &FlowData) -> Result<String, ComposeError> {
        let missing = |k: &str| ComposeError::MissingData(k.to_string());
        let car = data.car("selected_car").ok_or_else(|| missing("selected_car"))?;
        let location = match data.text("location") {
            Some("home") => format!(
                "Home ({})",
                data.text("address").unwrap_or("address not given")
            ),
            _ => "Showroom".to_string(),
        };
        Ok(format!(
            "Please confirm your test drive:\n\n\
             🚗 Car: {car}\n\
             📅 Date: {date}\n\
             ⏰ Time: {time}\n\
             👤 Name: {name}\n\
             📱 Phone: {phone}\n\
             📍 Location: {location}\n\n\
             Reply *yes* to confirm or *no* to change something.",
            car = car.label(),
            date = data.text("preferred_date").ok_or_else(|| missing("preferred_date"))?,
            time = data.text("preferred_time").ok_or_else(|| missing("preferred_time"))?,
            name = data.text("customer_name").ok_or_else(|| missing("customer_name"))?,
            phone = data.text("phone").ok_or_else(|| missing("phone"))?,
        ))
    }
}

impl ResponseComposer for BrowseComposer {
    fn compose(&self, step: Step, data: &FlowData, reply: &Reply<'_>) -> Result<String, ComposeError> {
        use Step::*;
        let text = match (step, reply) {
            (CollectingCriteria, Reply::Prompt) => CRITERIA_PROMPT.to_string(),
            (_, Reply::Restarted) => format!("No problem, let's start a fresh search.\n\n{CRITERIA_PROMPT}"),
            (ShowingResults, Reply::Prompt) => Self::results(data)?,
            (ShowingResults, Reply::Missing(issues)) => format!(
                "{}\nReply with a number from the list, or say *change* to search again.",
                ask_for(FIELDS, issues)
            ),
            (CarSelected, Reply::Prompt) | (CarSelected, Reply::Missing(_)) => {
                let car = data
                    .car("selected_car")
                    .ok_or_else(|| ComposeError::MissingData("selected_car".into()))?;
                format!(
                    "Nice choice! {} for {}.\n\n\
                     What would you like to do?\n\
                     1. Book a test drive\n\
                     2. Calculate EMI\n\
                     3. Change search",
                    car.label(),
                    format_rupees(car.price)
                )
            }
            (TestDriveDate, Reply::Prompt) => {
                "Which date works for your test drive? (e.g. tomorrow, Saturday, 15 March)".to_string()
            }
            (TestDriveTime, Reply::Prompt) => {
                "What time suits you? Our showroom is open 10am to 7pm.".to_string()
            }
            (TestDriveName, Reply::Prompt) => "May I have your full name?".to_string(),
            (TestDrivePhone, Reply::Prompt) => "What's your 10-digit mobile number?".to_string(),
            (TestDriveLicense, Reply::Prompt) => {
                "Do you have a valid driving licence? (yes/no)".to_string()
            }
            (TestDriveLicense, Reply::Outcome) => {
                "Sorry, a valid driving licence is needed for a test drive. \
                 You're welcome to bring someone who has one. Type *menu* to see other options."
                    .to_string()
            }
            (TestDriveLocation, Reply::Prompt) => {
                "Where would you like the test drive?\n1. At our showroom\n2. At your home".to_string()
            }
            (TestDriveAddress, Reply::Prompt) => {
                "Please share the address where we should bring the car.".to_string()
            }
            (TestDriveConfirm, Reply::Summary) => Self::summary(data)?,
            (TestDriveConfirm, Reply::Declined) => {
                "No problem. Tell me what you'd like to change (date, time, name, phone or location), \
                 or reply *yes* when everything looks right."
                    .to_string()
            }
            (TestDriveConfirm, Reply::ConfirmReprompt) => {
                format!("I didn't catch that.\n\n{}", Self::summary(data)?)
            }
            (TestDriveConfirm, Reply::Committed { confirmation_id }) => format!(
                "✅ Your test drive is booked!\n\nBooking ID: {confirmation_id}\n\
                 Our team will call you to confirm the slot. Type *menu* for anything else."
            ),
            (TestDriveConfirm, Reply::CommitFailed) => {
                "Sorry, I couldn't save your booking just now. Reply *yes* to try again.".to_string()
            }
            (_, Reply::Missing(issues)) => ask_for(FIELDS, issues),
            _ => {
                return Err(ComposeError::NoTemplate {
                    flow: FlowName::Browse,
                    step,
                });
            }
        };
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rust_decimal_macros::dec;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::store::{InMemoryRecordStore, demo_catalog};

    fn parse(step: Step, text: &str) -> RawFields {
        parse_fields(step, text, &FlowData::new(), &Vocabulary::default())
    }

    #[test]
    fn definition_is_valid() {
        definition().validate().unwrap();
    }

    #[test]
    fn criteria_in_one_message() {
        let f = parse(Step::CollectingCriteria, "Maruti hatchback, 5-7 lakh");
        assert_eq!(f["brand"], json!("Maruti"));
        assert_eq!(f["car_type"], json!("Hatchback"));
        assert_eq!(f["budget"], json!("700000"));
    }

    #[test]
    fn criteria_any_and_bare_lakh() {
        let f = parse(Step::CollectingCriteria, "no preference on brand, any type");
        assert_eq!(f["brand"], json!(ANY));
        assert_eq!(f["car_type"], json!(ANY));
        assert_eq!(parse(Step::CollectingCriteria, "8")["budget"], json!("800000"));
        assert!(!parse(Step::CollectingCriteria, "Hyundai i20").contains_key("budget"));
    }

    #[test]
    fn results_pick_or_change() {
        assert_eq!(parse(Step::ShowingResults, "2")["selection"], json!(2));
        assert_eq!(parse(Step::ShowingResults, "show me different cars")["results_action"], json!("change"));
    }

    #[test]
    fn car_menu_words() {
        assert_eq!(parse(Step::CarSelected, "1")["next_action"], json!("test_drive"));
        assert_eq!(parse(Step::CarSelected, "what would the EMI be")["next_action"], json!("financing"));
        assert_eq!(parse(Step::CarSelected, "change")["next_action"], json!("change"));
    }

    #[test]
    fn name_prefix_is_stripped() {
        assert_eq!(parse(Step::TestDriveName, "My name is Ravi Kumar")["customer_name"], json!("Ravi Kumar"));
    }

    #[test]
    fn location_from_number_or_word() {
        assert_eq!(parse(Step::TestDriveLocation, "2")["location"], json!("home"));
        assert_eq!(parse(Step::TestDriveLocation, "at the showroom please")["location"], json!("showroom"));
    }

    #[test]
    fn selection_must_be_in_list() {
        let mut data = FlowData::new();
        data.insert("results", FieldValue::Cars(demo_catalog()[..2].to_vec()));
        data.insert("selection", FieldValue::Integer(3));
        assert!(selection_in_results(&data).is_err());
        data.insert("selection", FieldValue::Integer(2));
        assert!(selection_in_results(&data).is_ok());
    }

    #[tokio::test]
    async fn search_fills_results_cheapest_first() {
        let store = InMemoryRecordStore::with_demo_catalog();
        let ctx = ActionContext {
            records: &store,
            timeout: Duration::from_secs(1),
        };
        let mut data = FlowData::new();
        data.insert("brand", FieldValue::Text("Hyundai".into()));
        data.insert("budget", FieldValue::Amount(dec!(1000000)));
        data.insert("car_type", FieldValue::Text("SUV".into()));
        BrowseActions.on_enter(Step::ShowingResults, &mut data, &ctx).await.unwrap();
        let cars = data.cars("results").unwrap();
        assert_eq!(cars.len(), 2);
        assert_eq!(cars[0].model, "Venue");
        assert_eq!(cars[1].model, "Creta");
    }

    #[tokio::test]
    async fn empty_search_is_no_matches() {
        let store = InMemoryRecordStore::with_demo_catalog();
        let ctx = ActionContext {
            records: &store,
            timeout: Duration::from_secs(1),
        };
        let mut data = FlowData::new();
        data.insert("brand", FieldValue::Text("Kia".into()));
        data.insert("budget", FieldValue::Amount(dec!(300000)));
        data.insert("car_type", FieldValue::Text(ANY.into()));
        let err = BrowseActions.on_enter(Step::ShowingResults, &mut data, &ctx).await.unwrap_err();
        assert_eq!(err, FieldIssue::NoMatches);
        assert!(!data.contains("results"));
    }

    fn confirmed_state() -> ConversationState {
        let car = demo_catalog()[0].clone();
        let data: FlowData = [
            ("selected_car", FieldValue::Car(car)),
            ("preferred_date", FieldValue::Text("Saturday".into())),
            ("preferred_time", FieldValue::Text("11am".into())),
            ("customer_name", FieldValue::Text("Ravi".into())),
            ("phone", FieldValue::Text("9876543210".into())),
            ("has_license", FieldValue::Flag(true)),
            ("location", FieldValue::Text("home".into())),
            ("address", FieldValue::Text("12 MG Road".into())),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        ConversationState::new("u1", FlowName::Browse, Step::TestDriveConfirm).with_data(data)
    }

    #[test]
    fn commit_request_uses_session_id() {
        let state = confirmed_state();
        let Some(CommitRequest::TestDrive(booking)) =
            BrowseActions.commit_request(Step::TestDriveConfirm, &state)
        else {
            panic!("expected a test drive booking");
        };
        assert_eq!(booking.idempotency_key, state.session_id);
        assert_eq!(booking.location, DriveLocation::Home);
        assert_eq!(booking.address.as_deref(), Some("12 MG Road"));
        assert_ne!(booking.idempotency_key, Uuid::nil());
        assert!(BrowseActions.commit_request(Step::TestDriveDate, &state).is_none());
    }

    #[test]
    fn handoff_carries_price_and_name() {
        let state = confirmed_state();
        let carried = BrowseActions.handoff(FlowName::Financing, &state.data);
        assert_eq!(carried.amount("car_price"), Some(dec!(950000)));
        assert_eq!(carried.text("car_name"), Some("2020 Hyundai Creta SX"));
        assert!(BrowseActions.handoff(FlowName::Service, &state.data).is_empty());
    }

    #[test]
    fn summary_lists_booking_details() {
        let state = confirmed_state();
        let text = BrowseComposer
            .compose(Step::TestDriveConfirm, &state.data, &Reply::Summary)
            .unwrap();
        assert!(text.contains("Hyundai Creta"));
        assert!(text.contains("Home (12 MG Road)"));
        assert!(text.contains("*yes*"));
    }

    #[test]
    fn missing_criteria_named_specifically() {
        let issues = [
            FieldIssue::Missing { field: "budget" },
            FieldIssue::Missing { field: "car_type" },
        ];
        let text = BrowseComposer
            .compose(Step::CollectingCriteria, &FlowData::new(), &Reply::Missing(&issues))
            .unwrap();
        assert!(text.contains("your budget"));
        assert!(text.contains("type of car"));
    }
}
