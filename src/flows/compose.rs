//! `ResponseComposer`: turns a step and its data into reply text.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::conversation::state::{FlowData, Step};
use crate::error::ComposeError;
use crate::flows::fields::{FieldIssue, FieldSpec};

/// What the reply should say about the step.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<'a> {
    /// The step's opening prompt.
    Prompt,
    /// Ask specifically for what is missing or wrong.
    Missing(&'a [FieldIssue]),
    /// Summary shown before a commit, asking for yes/no.
    Summary,
    /// The user said no to the summary.
    Declined,
    /// The answer to the summary was neither yes nor no.
    ConfirmReprompt,
    Committed { confirmation_id: &'a str },
    /// The commit failed; the user may retry.
    CommitFailed,
    /// Result of a display step or a terminal edge.
    Outcome,
    /// Collected data was dropped and the flow begins again.
    Restarted,
}

/// Pure formatting of replies for one flow.
pub trait ResponseComposer: Send + Sync {
    fn compose(&self, step: Step, data: &FlowData, reply: &Reply<'_>) -> Result<String, ComposeError>;
}

/// Templated reply used when a composer fails.
pub fn generic_reply(reply: &Reply<'_>) -> String {
    match reply {
        Reply::Committed { confirmation_id } => {
            format!("✅ All done! Your reference number is {confirmation_id}.")
        }
        Reply::CommitFailed => {
            "Sorry, I couldn't save that just now. Reply *yes* to try again.".to_string()
        }
        Reply::Summary | Reply::ConfirmReprompt => {
            "Shall I go ahead? Please reply *yes* or *no*.".to_string()
        }
        _ => "Sorry, I didn't quite get that. Could you say it another way?".to_string(),
    }
}

/// How a field is asked for, or its bare name when undeclared.
fn ask_of<'a>(fields: &'a [FieldSpec], name: &'a str) -> &'a str {
    fields
        .iter()
        .find(|f| f.name == name)
        .map(|f| f.ask)
        .unwrap_or(name)
}

/// A sentence asking for exactly the fields in `issues`.
pub fn ask_for(fields: &[FieldSpec], issues: &[FieldIssue]) -> String {
    let mut lines = Vec::new();
    let missing: Vec<&str> = issues
        .iter()
        .filter_map(|i| match i {
            FieldIssue::Missing { field } => Some(ask_of(fields, field)),
            _ => None,
        })
        .collect();

    for issue in issues {
        match issue {
            FieldIssue::Invalid { field, reason } => {
                lines.push(format!("Hmm, {reason}. Could you give me {} again?", ask_of(fields, field)));
            }
            FieldIssue::NoMatches => lines.push(
                "I couldn't find any cars matching that. Try another brand, a higher budget or a different body type."
                    .to_string(),
            ),
            FieldIssue::Unavailable => lines.push(
                "I'm having trouble reaching our system right now. Please try again in a moment."
                    .to_string(),
            ),
            FieldIssue::Missing { .. } => {}
        }
    }
    if !missing.is_empty() {
        let prefix = if lines.is_empty() { "Could you tell me" } else { "Also, could you tell me" };
        lines.push(format!("{prefix} {}?", join_list(&missing)));
    }
    lines.join("\n")
}

/// "a", "a and b", "a, b and c".
pub fn join_list(items: &[&str]) -> String {
    match items {
        [] => String::new(),
        [one] => one.to_string(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}

/// Rupees with Indian digit grouping, e.g. ₹12,50,000.
pub fn format_rupees(amount: Decimal) -> String {
    let rounded = amount.round_dp(2);
    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let abs = rounded.abs();
    let whole = abs.trunc();
    let frac = abs - whole;

    let digits = whole.to_string();
    let grouped = if digits.len() <= 3 {
        digits
    } else {
        let (head, tail) = digits.split_at(digits.len() - 3);
        let mut groups = Vec::new();
        let mut rest = head;
        while rest.len() > 2 {
            let (h, t) = rest.split_at(rest.len() - 2);
            groups.push(t);
            rest = h;
        }
        groups.push(rest);
        groups.reverse();
        format!("{},{}", groups.join(","), tail)
    };

    let sign = if negative { "-" } else { "" };
    if frac.is_zero() {
        format!("{sign}₹{grouped}")
    } else {
        let paise = (frac * dec!(100)).round().to_string();
        format!("{sign}₹{grouped}.{paise:0>2}")
    }
}

/// Amount in lakh, e.g. "9.5 lakh".
pub fn format_lakh(amount: Decimal) -> String {
    let lakh = (amount / dec!(100000)).round_dp(2).normalize();
    format!("{lakh} lakh")
}
