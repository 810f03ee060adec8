//! Conversation state: which flow a user is in, which step, and what has been
//! collected so far.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::CarRecord;

/// The transactional flows a user can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowName {
    Browse,
    Valuation,
    Financing,
    Service,
}

impl FlowName {
    pub const ALL: [FlowName; 4] = [
        FlowName::Browse,
        FlowName::Valuation,
        FlowName::Financing,
        FlowName::Service,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Browse => "browse",
            Self::Valuation => "valuation",
            Self::Financing => "financing",
            Self::Service => "service",
        }
    }
}

impl std::fmt::Display for FlowName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FlowName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown flow: {s}"))
    }
}

/// Every step of every flow. Which steps belong to which flow is declared by
/// the flow definitions, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    // Browse and test drive
    CollectingCriteria,
    ShowingResults,
    CarSelected,
    TestDriveDate,
    TestDriveTime,
    TestDriveName,
    TestDrivePhone,
    TestDriveLicense,
    TestDriveLocation,
    TestDriveAddress,
    TestDriveConfirm,
    // Valuation
    CollectingVehicle,
    ShowingValuation,
    // Financing
    SelectingCar,
    DownPayment,
    SelectingTenure,
    ShowingEstimate,
    // Service booking
    ShowingServices,
    CollectingVehicleDetails,
    CollectingServiceType,
    CollectingCustomerDetails,
    ServiceConfirm,
    /// Shared terminal marker.
    Complete,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CollectingCriteria => "collecting_criteria",
            Self::ShowingResults => "showing_results",
            Self::CarSelected => "car_selected",
            Self::TestDriveDate => "test_drive_date",
            Self::TestDriveTime => "test_drive_time",
            Self::TestDriveName => "test_drive_name",
            Self::TestDrivePhone => "test_drive_phone",
            Self::TestDriveLicense => "test_drive_license",
            Self::TestDriveLocation => "test_drive_location",
            Self::TestDriveAddress => "test_drive_address",
            Self::TestDriveConfirm => "test_drive_confirm",
            Self::CollectingVehicle => "collecting_vehicle",
            Self::ShowingValuation => "showing_valuation",
            Self::SelectingCar => "selecting_car",
            Self::DownPayment => "down_payment",
            Self::SelectingTenure => "selecting_tenure",
            Self::ShowingEstimate => "showing_estimate",
            Self::ShowingServices => "showing_services",
            Self::CollectingVehicleDetails => "collecting_vehicle_details",
            Self::CollectingServiceType => "collecting_service_type",
            Self::CollectingCustomerDetails => "collecting_customer_details",
            Self::ServiceConfirm => "service_confirm",
            Self::Complete => "complete",
        }
    }

    /// Whether this step ends the flow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Marker layered on top of the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubState {
    #[default]
    None,
    /// A commit summary has been shown; the next message is a yes/no answer.
    AwaitingConfirmation,
    /// The step was entered without showing its prompt yet.
    NeedsInit,
}

impl std::fmt::Display for SubState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::NeedsInit => "needs_init",
        };
        write!(f, "{s}")
    }
}

/// A typed value collected by a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Amount(Decimal),
    Flag(bool),
    Car(CarRecord),
    Cars(Vec<CarRecord>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_amount(&self) -> Option<Decimal> {
        match self {
            Self::Amount(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            _ => None,
        }
    }
}

/// Fields accumulated within one flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowData(BTreeMap<String, FieldValue>);

impl FlowData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Insert a value, returning true if it changed what was stored.
    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) -> bool {
        let key = key.into();
        if self.0.get(&key) == Some(&value) {
            return false;
        }
        self.0.insert(key, value);
        true
    }

    /// Drop a derived value that no longer applies.
    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        self.0.remove(key)
    }

    /// Overlay `other` on top of `self`. Keys absent from `other` are kept.
    pub fn merge(&mut self, other: FlowData) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, value) in other.0 {
            if self.insert(key.clone(), value) {
                changed.push(key);
            }
        }
        changed
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(FieldValue::as_text)
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(FieldValue::as_integer)
    }

    pub fn amount(&self, key: &str) -> Option<Decimal> {
        self.get(key).and_then(FieldValue::as_amount)
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(FieldValue::as_flag)
    }

    pub fn car(&self, key: &str) -> Option<&CarRecord> {
        match self.get(key) {
            Some(FieldValue::Car(car)) => Some(car),
            _ => None,
        }
    }

    pub fn cars(&self, key: &str) -> Option<&[CarRecord]> {
        match self.get(key) {
            Some(FieldValue::Cars(cars)) => Some(cars),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, FieldValue)> for FlowData {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Per-user conversation state. Absent entirely when no flow is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub user_id: String,
    pub flow: FlowName,
    pub step: Step,
    pub sub_state: SubState,
    pub data: FlowData,
    /// Identifies this run through the flow. Doubles as the commit
    /// idempotency key.
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ConversationState {
    /// Fresh state at a flow's entry step, prompt not yet shown.
    pub fn new(user_id: impl Into<String>, flow: FlowName, entry: Step) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            flow,
            step: entry,
            sub_state: SubState::NeedsInit,
            data: FlowData::new(),
            session_id: Uuid::new_v4(),
            started_at: now,
            last_activity: now,
        }
    }

    pub fn with_data(mut self, data: FlowData) -> Self {
        self.data = data;
        self
    }

    /// Whether the user has been idle for longer than `ttl` at `now`.
    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let idle = now.signed_duration_since(self.last_activity);
        idle.to_std().map(|idle| idle > ttl).unwrap_or(false)
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}
