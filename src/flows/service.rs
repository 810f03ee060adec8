//! Service booking: vehicle, service type and contact details, then a
//! confirmed booking.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::conversation::phrases;
use crate::conversation::state::{ConversationState, FlowData, FlowName, Step};
use crate::error::ComposeError;
use crate::flows::compose::{Reply, ResponseComposer, ask_for};
use crate::flows::fields::{FieldKind, FieldSpec};
use crate::flows::parse::{
    find_in_vocab, has_any, has_name_prefix, normalize, parse_option_number, parse_phone,
    parse_registration, parse_yes_no, parse_year, strip_name_prefix,
};
use crate::flows::valuation::model_after_brand;
use crate::flows::{
    FlowDefinition, Guard, RawFields, StepActions, StepKind, StepSpec, Target, Transition,
    Vocabulary,
};
use crate::store::{CommitRequest, ServiceBooking};

const MENU_OPTIONS: &[&str] = &["book", "browse", "team", "menu"];

/// Canonical service types with their display names.
pub const SERVICE_TYPES: &[(&str, &str)] = &[
    ("regular_service", "Regular Service"),
    ("major_service", "Major Service"),
    ("accident_repair", "Accident Repair"),
    ("insurance_claim", "Insurance Claim"),
    ("other", "Other"),
];
const SERVICE_TYPE_KEYS: &[&str] = &[
    "regular_service",
    "major_service",
    "accident_repair",
    "insurance_claim",
    "other",
];

pub const FIELDS: &[FieldSpec] = &[
    FieldSpec::new(
        "service_action",
        FieldKind::Choice(MENU_OPTIONS),
        "menu choice: book (1), browse (2), team (3) or menu (4)",
        "an option from 1 to 4",
    ),
    FieldSpec::new("make", FieldKind::Text { min_len: 2 }, "make of the car to service", "the make"),
    FieldSpec::new("model", FieldKind::Text { min_len: 1 }, "model of the car to service", "the model"),
    FieldSpec::new("year", FieldKind::Year, "year of manufacture", "the year"),
    FieldSpec::new(
        "registration_number",
        FieldKind::Registration,
        "vehicle registration number, e.g. KA01AB1234",
        "the registration number (e.g. KA01AB1234)",
    ),
    FieldSpec::new(
        "service_type",
        FieldKind::Choice(SERVICE_TYPE_KEYS),
        "one of regular_service, major_service, accident_repair, insurance_claim, other",
        "the type of service (1 to 5)",
    ),
    FieldSpec::new("customer_name", FieldKind::Text { min_len: 2 }, "the user's full name", "your name"),
    FieldSpec::new("phone", FieldKind::Phone, "10-digit mobile number", "your 10-digit mobile number"),
];

const BOOK_WORDS: &[&str] = &["book", "booking", "service", "servicing", "schedule"];
const BROWSE_WORDS: &[&str] = &["browse", "used cars", "buy"];
const TEAM_WORDS: &[&str] = &["team", "talk", "contact", "call", "speak"];

const TYPE_WORDS: &[(&str, &[&str])] = &[
    ("regular_service", &["regular", "routine", "general", "periodic", "oil change"]),
    ("major_service", &["major", "full service", "complete service"]),
    ("accident_repair", &["accident", "dent", "collision", "body work", "bodywork"]),
    ("insurance_claim", &["insurance", "claim"]),
    ("other", &["other", "something else"]),
];

pub fn definition() -> FlowDefinition {
    use Step::*;
    FlowDefinition {
        flow: FlowName::Service,
        entry: ShowingServices,
        summary: "book a service or repair appointment for the user's car",
        fields: FIELDS,
        steps: vec![
            StepSpec::new(ShowingServices, StepKind::Menu, &["service_action"])
                .absorbs(&[FlowName::Browse])
                .then(Transition::when(
                    Guard::Equals("service_action", "book"),
                    Target::Step(CollectingVehicleDetails),
                ))
                .then(Transition::when(
                    Guard::Equals("service_action", "browse"),
                    Target::Handoff(FlowName::Browse),
                ))
                .then(Transition::when(Guard::Equals("service_action", "team"), Target::Stay))
                .then(Transition::when(Guard::Equals("service_action", "menu"), Target::Exit)),
            StepSpec::new(
                CollectingVehicleDetails,
                StepKind::Collect,
                &["make", "model", "year", "registration_number"],
            )
            .then(Transition::to(Target::Step(CollectingServiceType))),
            StepSpec::new(CollectingServiceType, StepKind::Collect, &["service_type"])
                .then(Transition::to(Target::Step(CollectingCustomerDetails))),
            StepSpec::new(CollectingCustomerDetails, StepKind::Collect, &["customer_name", "phone"])
                .then(Transition::to(Target::Step(ServiceConfirm))),
            StepSpec::new(ServiceConfirm, StepKind::Confirm, &[])
                .then(Transition::to(Target::Complete)),
        ],
        fallback: parse_fields,
    }
}

pub fn service_type_label(key: &str) -> &str {
    SERVICE_TYPES
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, label)| *label)
        .unwrap_or(key)
}

fn service_type_in(norm: &str) -> Option<&'static str> {
    TYPE_WORDS
        .iter()
        .find(|(_, words)| has_any(norm, words))
        .map(|(key, _)| *key)
}

fn vehicle_fields(text: &str, norm: &str, data: &FlowData, vocab: &Vocabulary, fields: &mut RawFields) {
    let make = find_in_vocab(norm, &vocab.brands);
    if let Some(make) = &make {
        fields.insert("make".into(), Value::String(make.clone()));
        if let Some(model) = model_after_brand(text, make) {
            fields.insert("model".into(), Value::String(model));
        }
    }
    if let Some(year) = parse_year(text) {
        fields.insert("year".into(), Value::from(year));
    }
    if let Some(reg) = parse_registration(text) {
        fields.insert("registration_number".into(), Value::String(reg));
    }
    // A lone word once the make is known is most likely the model.
    if fields.is_empty() && data.contains("make") && !data.contains("model") {
        let words: Vec<&str> = norm.split_whitespace().collect();
        if let [_] | [_, _] = words.as_slice() {
            fields.insert("model".into(), Value::String(text.trim().to_string()));
        }
    }
}

fn contact_fields(text: &str, data: &FlowData, fields: &mut RawFields) {
    let phone = parse_phone(text);
    let name: String = strip_name_prefix(
        &text
            .chars()
            .filter(|c| !(c.is_ascii_digit() || matches!(c, '+' | '-' | ',' | '(' | ')')))
            .collect::<String>(),
    );
    let name = name.trim().trim_end_matches(['.', ':']).trim().to_string();
    match phone {
        Some(phone) => {
            fields.insert("phone".into(), Value::String(phone));
            if name.chars().count() >= 2 {
                fields.insert("customer_name".into(), Value::String(name));
            }
        }
        None if !data.contains("customer_name") && !name.is_empty() => {
            fields.insert("customer_name".into(), Value::String(name));
        }
        None => {
            fields.insert("phone".into(), Value::String(text.trim().to_string()));
        }
    }
}

/// Deterministic field parse for the service flow.
pub fn parse_fields(step: Step, text: &str, data: &FlowData, vocab: &Vocabulary) -> RawFields {
    let mut fields = RawFields::new();
    let norm = normalize(text);
    match step {
        Step::ShowingServices => {
            let action = match parse_option_number(text, MENU_OPTIONS.len()) {
                Some(n) => Some(MENU_OPTIONS[n - 1]),
                None if has_any(&norm, TEAM_WORDS) => Some("team"),
                None if has_any(&norm, BROWSE_WORDS) => Some("browse"),
                None if has_any(&norm, BOOK_WORDS) || parse_yes_no(text) == Some(true) => Some("book"),
                None => None,
            };
            if let Some(action) = action {
                fields.insert("service_action".into(), Value::String(action.into()));
            }
        }
        Step::CollectingVehicleDetails => vehicle_fields(text, &norm, data, vocab, &mut fields),
        Step::CollectingServiceType => {
            let picked = parse_option_number(text, SERVICE_TYPE_KEYS.len())
                .map(|n| SERVICE_TYPE_KEYS[n - 1])
                .or_else(|| service_type_in(&norm));
            if let Some(key) = picked {
                fields.insert("service_type".into(), Value::String(key.into()));
            }
        }
        Step::CollectingCustomerDetails => contact_fields(text, data, &mut fields),
        Step::ServiceConfirm => {
            // Edits while the summary is pending.
            if let Some(reg) = parse_registration(text) {
                fields.insert("registration_number".into(), Value::String(reg));
            }
            if let Some(phone) = parse_phone(text) {
                fields.insert("phone".into(), Value::String(phone));
            }
            if let Some(year) = parse_year(text) {
                fields.insert("year".into(), Value::from(year));
            }
            if let Some(key) = service_type_in(&norm) {
                fields.insert("service_type".into(), Value::String(key.into()));
            }
            if has_name_prefix(text) {
                fields.insert("customer_name".into(), Value::String(strip_name_prefix(text)));
            }
        }
        _ => {}
    }
    debug!(step = %step, fields = fields.len(), "Service fallback parse");
    fields
}

pub struct ServiceActions;

#[async_trait]
impl StepActions for ServiceActions {
    fn commit_request(&self, step: Step, state: &ConversationState) -> Option<CommitRequest> {
        if step != Step::ServiceConfirm {
            return None;
        }
        let data = &state.data;
        Some(CommitRequest::Service(ServiceBooking {
            idempotency_key: state.session_id,
            user_id: state.user_id.clone(),
            customer_name: data.text("customer_name")?.to_string(),
            phone: data.text("phone")?.to_string(),
            make: data.text("make")?.to_string(),
            model: data.text("model")?.to_string(),
            year: i32::try_from(data.integer("year")?).ok()?,
            registration_number: data.text("registration_number")?.to_string(),
            service_type: service_type_label(data.text("service_type")?).to_string(),
        }))
    }
}

const SERVICE_MENU: &str = "🔧 *Service & Repairs*\n\n\
     What would you like to do?\n\
     1. Book a service\n\
     2. Browse used cars\n\
     3. Talk to our team\n\
     4. Main menu";

const TEAM_CONTACT: &str = "Our service team is happy to help! 👥\n\n\
     📞 Call us: 1800-123-4567 (9am to 7pm)\n\
     📍 Visit: any Sherpa Motors showroom\n\n\
     Or reply *1* and I'll book a service; the team will call you back.";

pub struct ServiceComposer;

impl ServiceComposer {
    fn summary(data: &FlowData) -> Result<String, ComposeError> {
        let missing = |k: &str| ComposeError::MissingData(k.to_string());
        Ok(format!(
            "Please confirm your service booking:\n\n\
             🚗 Car: {make} {model} ({year})\n\
             🔢 Registration: {reg}\n\
             🔧 Service: {service}\n\
             👤 Name: {name}\n\
             📱 Phone: {phone}\n\n\
             Reply *yes* to confirm or *no* to change something.",
            make = data.text("make").ok_or_else(|| missing("make"))?,
            model = data.text("model").ok_or_else(|| missing("model"))?,
            year = data.integer("year").ok_or_else(|| missing("year"))?,
            reg = data.text("registration_number").ok_or_else(|| missing("registration_number"))?,
            service = service_type_label(data.text("service_type").ok_or_else(|| missing("service_type"))?),
            name = data.text("customer_name").ok_or_else(|| missing("customer_name"))?,
            phone = data.text("phone").ok_or_else(|| missing("phone"))?,
        ))
    }
}

impl ResponseComposer for ServiceComposer {
    fn compose(&self, step: Step, data: &FlowData, reply: &Reply<'_>) -> Result<String, ComposeError> {
        use Step::*;
        let text = match (step, reply) {
            (ShowingServices, Reply::Prompt) => SERVICE_MENU.to_string(),
            (ShowingServices, Reply::Missing(_)) => {
                format!("Please pick an option from 1 to 4.\n\n{SERVICE_MENU}")
            }
            (ShowingServices, Reply::Outcome) => match data.text("service_action") {
                Some("team") => TEAM_CONTACT.to_string(),
                _ => phrases::main_menu().to_string(),
            },
            (CollectingVehicleDetails, Reply::Prompt) => "Let's book your service! 🚗🔧\n\n\
                 Please share your car's:\n\
                 • Make (e.g. Hyundai, Maruti, Honda)\n\
                 • Model (e.g. i20, Swift, City)\n\
                 • Year (e.g. 2020)\n\
                 • Registration number (e.g. KA01AB1234)"
                .to_string(),
            (CollectingServiceType, Reply::Prompt) => {
                let mut lines = vec!["What kind of service do you need?".to_string()];
                for (i, (_, label)) in SERVICE_TYPES.iter().enumerate() {
                    lines.push(format!("{}. {}", i + 1, label));
                }
                lines.join("\n")
            }
            (CollectingCustomerDetails, Reply::Prompt) => {
                "Almost done! Please share your name and 10-digit mobile number.".to_string()
            }
            (ServiceConfirm, Reply::Summary) => Self::summary(data)?,
            (ServiceConfirm, Reply::Declined) => {
                "No problem. Tell me what to change (car details, service type, name or phone), \
                 or reply *yes* when everything looks right."
                    .to_string()
            }
            (ServiceConfirm, Reply::ConfirmReprompt) => {
                format!("I didn't catch that.\n\n{}", Self::summary(data)?)
            }
            (ServiceConfirm, Reply::Committed { confirmation_id }) => format!(
                "✅ Your service is booked!\n\nBooking ID: {confirmation_id}\n\
                 Our team will call you shortly to fix a slot. Type *menu* for anything else."
            ),
            (ServiceConfirm, Reply::CommitFailed) => {
                "Sorry, I couldn't save your booking just now. Reply *yes* to try again.".to_string()
            }
            (_, Reply::Missing(issues)) => ask_for(FIELDS, issues),
            _ => {
                return Err(ComposeError::NoTemplate {
                    flow: FlowName::Service,
                    step,
                });
            }
        };
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::conversation::state::FieldValue;

    fn parse(step: Step, text: &str) -> RawFields {
        parse_fields(step, text, &FlowData::new(), &Vocabulary::default())
    }

    #[test]
    fn definition_is_valid() {
        definition().validate().unwrap();
    }

    #[test]
    fn menu_by_number_or_words() {
        assert_eq!(parse(Step::ShowingServices, "1")["service_action"], json!("book"));
        assert_eq!(parse(Step::ShowingServices, "4")["service_action"], json!("menu"));
        assert_eq!(parse(Step::ShowingServices, "can I talk to someone")["service_action"], json!("team"));
        assert_eq!(parse(Step::ShowingServices, "I want to book a service")["service_action"], json!("book"));
    }

    #[test]
    fn vehicle_details_in_one_message() {
        let f = parse(Step::CollectingVehicleDetails, "Honda City 2018, KA 01 AB 1234");
        assert_eq!(f["make"], json!("Honda"));
        assert_eq!(f["model"], json!("City"));
        assert_eq!(f["year"], json!(2018));
        assert_eq!(f["registration_number"], json!("KA01AB1234"));
    }

    #[test]
    fn service_type_by_number_or_word() {
        assert_eq!(parse(Step::CollectingServiceType, "3")["service_type"], json!("accident_repair"));
        assert_eq!(
            parse(Step::CollectingServiceType, "it's for an insurance claim")["service_type"],
            json!("insurance_claim")
        );
    }

    #[test]
    fn contact_name_and_phone() {
        let f = parse(Step::CollectingCustomerDetails, "Priya Shah, 98765 43210");
        assert_eq!(f["customer_name"], json!("Priya Shah"));
        assert_eq!(f["phone"], json!("9876543210"));

        let f = parse(Step::CollectingCustomerDetails, "my name is Arjun");
        assert_eq!(f["customer_name"], json!("Arjun"));
        assert!(!f.contains_key("phone"));
    }

    #[test]
    fn bad_phone_after_name_is_passed_on() {
        let mut data = FlowData::new();
        data.insert("customer_name", FieldValue::Text("Arjun".into()));
        let f = parse_fields(Step::CollectingCustomerDetails, "12345", &data, &Vocabulary::default());
        assert_eq!(f["phone"], json!("12345"));
    }

    #[test]
    fn commit_request_uses_label() {
        let data: FlowData = [
            ("make", FieldValue::Text("Honda".into())),
            ("model", FieldValue::Text("City".into())),
            ("year", FieldValue::Integer(2018)),
            ("registration_number", FieldValue::Text("KA01AB1234".into())),
            ("service_type", FieldValue::Text("major_service".into())),
            ("customer_name", FieldValue::Text("Priya".into())),
            ("phone", FieldValue::Text("9876543210".into())),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        let state = ConversationState::new("u9", FlowName::Service, Step::ServiceConfirm).with_data(data);
        let Some(CommitRequest::Service(booking)) = ServiceActions.commit_request(Step::ServiceConfirm, &state)
        else {
            panic!("expected a service booking");
        };
        assert_eq!(booking.service_type, "Major Service");
        assert_eq!(booking.idempotency_key, state.session_id);

        let summary = ServiceComposer.compose(Step::ServiceConfirm, &state.data, &Reply::Summary).unwrap();
        assert!(summary.contains("Honda City (2018)"));
        assert!(summary.contains("Major Service"));
    }

    #[test]
    fn team_outcome_shows_contact() {
        let mut data = FlowData::new();
        data.insert("service_action", FieldValue::Text("team".into()));
        let text = ServiceComposer.compose(Step::ShowingServices, &data, &Reply::Outcome).unwrap();
        assert!(text.contains("Call us"));
    }
}
