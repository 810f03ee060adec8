//! `RecordStore` trait: catalogue search and booking commits.

use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CommitError, DatabaseError};

/// A car in the dealership catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarRecord {
    pub id: i64,
    pub brand: String,
    pub model: String,
    pub variant: Option<String>,
    pub car_type: String,
    pub year: i32,
    pub fuel_type: String,
    pub transmission: Option<String>,
    pub mileage_km: Option<i64>,
    pub price: Decimal,
    pub color: Option<String>,
    pub registration_number: Option<String>,
    pub status: String,
}

impl CarRecord {
    /// Short human label, e.g. "2020 Hyundai Creta SX".
    pub fn label(&self) -> String {
        match &self.variant {
            Some(v) => format!("{} {} {} {}", self.year, self.brand, self.model, v),
            None => format!("{} {} {}", self.year, self.brand, self.model),
        }
    }
}

/// Catalogue search filters. `None` means "any".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchCriteria {
    pub brand: Option<String>,
    pub model: Option<String>,
    pub car_type: Option<String>,
    pub max_price: Option<Decimal>,
    pub limit: usize,
}

/// Where a test drive happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveLocation {
    Showroom,
    Home,
}

impl DriveLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Showroom => "showroom",
            Self::Home => "home",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDriveBooking {
    pub idempotency_key: Uuid,
    pub user_id: String,
    pub car_id: i64,
    pub car_label: String,
    pub customer_name: String,
    pub phone: String,
    pub has_license: bool,
    pub preferred_date: String,
    pub preferred_time: String,
    pub location: DriveLocation,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceBooking {
    pub idempotency_key: Uuid,
    pub user_id: String,
    pub customer_name: String,
    pub phone: String,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub registration_number: String,
    pub service_type: String,
}

/// A write performed at a confirmation point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommitRequest {
    TestDrive(TestDriveBooking),
    Service(ServiceBooking),
}

impl CommitRequest {
    /// Repeating a commit with the same key must not create a second record.
    pub fn idempotency_key(&self) -> Uuid {
        match self {
            Self::TestDrive(b) => b.idempotency_key,
            Self::Service(b) => b.idempotency_key,
        }
    }

    pub fn confirmation_prefix(&self) -> &'static str {
        match self {
            Self::TestDrive(_) => "TD",
            Self::Service(_) => "SB",
        }
    }
}

/// Generate a confirmation id like `TD-7K2M9QXA`.
pub fn new_confirmation_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|b| (b as char).to_ascii_uppercase())
        .collect();
    format!("{prefix}-{suffix}")
}

/// Backend-agnostic catalogue and booking store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Available cars matching `criteria`, cheapest first.
    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<CarRecord>, DatabaseError>;

    /// Average catalogue price for a brand/model pair.
    async fn average_price(&self, brand: &str, model: &str)
    -> Result<Option<Decimal>, DatabaseError>;

    /// Distinct brands in the catalogue.
    async fn brands(&self) -> Result<Vec<String>, DatabaseError>;

    /// Distinct body types in the catalogue.
    async fn car_types(&self) -> Result<Vec<String>, DatabaseError>;

    /// Persist a booking and return its confirmation id.
    async fn commit(&self, request: &CommitRequest) -> Result<String, CommitError>;
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn confirmation_id_shape() {
        let id = new_confirmation_id("TD");
        assert!(id.starts_with("TD-"));
        assert_eq!(id.len(), 11);
        assert!(id[3..].chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn car_label_includes_variant() {
        let car = CarRecord {
            id: 1,
            brand: "Hyundai".into(),
            model: "Creta".into(),
            variant: Some("SX".into()),
            car_type: "SUV".into(),
            year: 2020,
            fuel_type: "Petrol".into(),
            transmission: None,
            mileage_km: None,
            price: dec!(950000),
            color: None,
            registration_number: None,
            status: "available".into(),
        };
        assert_eq!(car.label(), "2020 Hyundai Creta SX");
    }
}
