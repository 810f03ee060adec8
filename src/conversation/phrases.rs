//! Fixed phrases the orchestrator reacts to, and its canned replies.

use crate::conversation::state::FlowName;
use crate::flows::parse::{has_any, normalize};

/// Whole-message phrases that abandon the active flow.
const EXIT_PHRASES: &[&str] = &[
    "exit", "quit", "cancel", "stop", "back", "menu", "main menu", "back to menu", "go back",
];

/// Whole-message phrases that restart the active flow from its entry step.
const RESTART_PHRASES: &[&str] = &["start over", "start again", "restart", "reset", "new search"];

/// Phrases that name a flow, in routing priority order.
const SWITCH_PHRASES: &[(FlowName, &[&str])] = &[
    (
        FlowName::Service,
        &[
            "book a service", "book service", "service booking", "car service", "servicing",
            "repair", "maintenance",
        ],
    ),
    (
        FlowName::Financing,
        &[
            "emi", "loan", "finance", "financing", "installment", "down payment",
            "monthly payment", "calculate emi",
        ],
    ),
    (
        FlowName::Valuation,
        &[
            "valuation", "value my car", "resale value", "sell my car", "what is my car worth",
            "how much is my car worth",
        ],
    ),
    (
        FlowName::Browse,
        &[
            "browse", "browse cars", "buy a car", "want to buy", "used cars", "looking for a car",
            "find a car",
        ],
    ),
];

const CAR_KEYWORDS: &[&str] = &[
    "car", "cars", "vehicle", "automobile", "auto", "truck", "suv", "sedan", "hatchback",
    "engine", "transmission", "brake", "tyre", "tire", "wheel", "battery", "oil", "maintenance",
    "repair", "service", "mechanic", "garage", "mileage", "fuel", "petrol", "diesel", "electric",
    "hybrid", "insurance", "registration", "license", "licence", "driving", "accident", "claim",
    "price", "cost", "buy", "sell", "trade", "lease", "finance", "loan", "warranty", "emi",
    "test drive", "showroom", "dealer",
];

const GREETINGS: &[&str] = &[
    "hi", "hii", "hello", "hey", "namaste", "good morning", "good afternoon", "good evening",
    "start", "help",
];

/// Whether the whole message asks to leave the current flow.
pub fn is_exit(text: &str) -> bool {
    let norm = normalize(text);
    let msg = norm.trim();
    EXIT_PHRASES.iter().any(|p| *p == msg)
}

pub fn is_restart(text: &str) -> bool {
    let norm = normalize(text);
    let msg = norm.trim();
    RESTART_PHRASES.iter().any(|p| *p == msg)
}

/// The flow a message explicitly names, highest priority first.
pub fn requested_flow(text: &str) -> Option<FlowName> {
    let norm = normalize(text);
    SWITCH_PHRASES
        .iter()
        .find(|(_, phrases)| has_any(&norm, phrases))
        .map(|(flow, _)| *flow)
}

pub fn is_car_related(text: &str) -> bool {
    let norm = normalize(text);
    has_any(&norm, CAR_KEYWORDS) || has_any(&norm, GREETINGS)
}

pub fn main_menu() -> &'static str {
    "Hi! I'm AutoSherpa, your car assistant. 🚗\n\n\
     I can help you:\n\
     1. Browse used cars and book a test drive\n\
     2. Get a valuation for your car\n\
     3. Calculate EMI for a car loan\n\
     4. Book a service\n\n\
     Just tell me what you'd like to do!"
}

pub fn out_of_scope() -> &'static str {
    "I appreciate the question! I'm here to help with cars: buying, selling, \
     financing and servicing. How can I help you with your car today?"
}

/// Sent when a flow had to be abandoned unexpectedly.
pub fn flow_aborted() -> &'static str {
    "Sorry, something went wrong on my side and I've had to start over. \
     Type *menu* to see what I can help with."
}

/// Sent when the engine cannot produce any other reply.
pub fn fallback() -> &'static str {
    "I'm having trouble processing that right now. Could you please try again in a moment?"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_is_whole_message_only() {
        assert!(is_exit("Exit"));
        assert!(is_exit("  main menu! "));
        assert!(is_exit("go back"));
        assert!(!is_exit("don't stop the search"));
        assert!(!is_exit("back seat space?"));
        assert!(!is_exit("start over"));
        assert!(is_restart("Start over"));
        assert!(!is_restart("restart the engine"));
    }

    #[test]
    fn service_outranks_financing() {
        assert_eq!(requested_flow("book a service and tell me the EMI"), Some(FlowName::Service));
        assert_eq!(requested_flow("what's the emi?"), Some(FlowName::Financing));
        assert_eq!(requested_flow("I want to sell my car"), Some(FlowName::Valuation));
        assert_eq!(requested_flow("show me used cars"), Some(FlowName::Browse));
        assert_eq!(requested_flow("Hyundai SUV under 10 lakh"), None);
    }

    #[test]
    fn whole_words_only() {
        assert_eq!(requested_flow("premium sedan"), None);
        assert!(!is_car_related("what's the weather like"));
        assert!(is_car_related("my car makes a noise"));
        assert!(is_car_related("hello"));
    }
}
