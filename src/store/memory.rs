//! In-memory `RecordStore`, used by tests and quick local runs.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{CommitError, DatabaseError};
use crate::store::traits::{
    CarRecord, CommitRequest, RecordStore, SearchCriteria, new_confirmation_id,
};

/// A small used-car catalogue for local runs and tests.
pub fn demo_catalog() -> Vec<CarRecord> {
    let rows: [(&str, &str, &str, &str, i32, &str, Decimal); 12] = [
        ("Hyundai", "Creta", "SX", "SUV", 2020, "Petrol", dec!(950000)),
        ("Hyundai", "Venue", "S", "SUV", 2021, "Petrol", dec!(780000)),
        ("Hyundai", "i20", "Asta", "Hatchback", 2019, "Petrol", dec!(560000)),
        ("Tata", "Nexon", "XZ+", "SUV", 2021, "Diesel", dec!(850000)),
        ("Tata", "Tiago", "XT", "Hatchback", 2020, "Petrol", dec!(420000)),
        ("Maruti", "Swift", "VXI", "Hatchback", 2019, "Petrol", dec!(480000)),
        ("Maruti", "Brezza", "ZXI", "SUV", 2022, "Petrol", dec!(980000)),
        ("Maruti", "Ciaz", "Alpha", "Sedan", 2018, "Petrol", dec!(620000)),
        ("Honda", "City", "V", "Sedan", 2019, "Petrol", dec!(790000)),
        ("Mahindra", "XUV300", "W8", "SUV", 2020, "Diesel", dec!(880000)),
        ("Toyota", "Innova Crysta", "GX", "MUV", 2018, "Diesel", dec!(1450000)),
        ("Kia", "Seltos", "HTX", "SUV", 2021, "Diesel", dec!(1250000)),
    ];
    rows.into_iter()
        .enumerate()
        .map(|(i, (brand, model, variant, car_type, year, fuel, price))| CarRecord {
            id: i as i64 + 1,
            brand: brand.to_string(),
            model: model.to_string(),
            variant: Some(variant.to_string()),
            car_type: car_type.to_string(),
            year,
            fuel_type: fuel.to_string(),
            transmission: Some("Manual".to_string()),
            mileage_km: Some(20_000 + 7_500 * i as i64),
            price,
            color: None,
            registration_number: None,
            status: "available".to_string(),
        })
        .collect()
}

/// Whether a car passes the search filters.
pub(crate) fn matches_criteria(car: &CarRecord, criteria: &SearchCriteria) -> bool {
    let eq = |want: &Option<String>, have: &str| {
        want.as_ref()
            .map(|w| w.eq_ignore_ascii_case(have))
            .unwrap_or(true)
    };
    car.status == "available"
        && eq(&criteria.brand, &car.brand)
        && eq(&criteria.model, &car.model)
        && eq(&criteria.car_type, &car.car_type)
        && criteria.max_price.map(|max| car.price <= max).unwrap_or(true)
}

/// Vec-backed catalogue with a commit log keyed by idempotency key.
pub struct InMemoryRecordStore {
    cars: RwLock<Vec<CarRecord>>,
    commits: Mutex<HashMap<Uuid, (String, CommitRequest)>>,
    commit_calls: AtomicUsize,
    fail_commits: AtomicBool,
}

impl InMemoryRecordStore {
    pub fn new(cars: Vec<CarRecord>) -> Self {
        Self {
            cars: RwLock::new(cars),
            commits: Mutex::new(HashMap::new()),
            commit_calls: AtomicUsize::new(0),
            fail_commits: AtomicBool::new(false),
        }
    }

    pub fn with_demo_catalog() -> Self {
        Self::new(demo_catalog())
    }

    /// Make every subsequent commit fail (for exercising retry paths).
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Number of times `commit` has been called, successful or not.
    pub fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }

    /// Committed records, in no particular order.
    pub async fn committed(&self) -> Vec<(String, CommitRequest)> {
        self.commits.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<CarRecord>, DatabaseError> {
        let cars = self.cars.read().await;
        let mut found: Vec<CarRecord> = cars.iter().filter(|c| matches_criteria(c, criteria)).cloned().collect();
        found.sort_by(|a, b| a.price.cmp(&b.price));
        if criteria.limit > 0 {
            found.truncate(criteria.limit);
        }
        Ok(found)
    }

    async fn average_price(
        &self,
        brand: &str,
        model: &str,
    ) -> Result<Option<Decimal>, DatabaseError> {
        let cars = self.cars.read().await;
        let prices: Vec<Decimal> = cars
            .iter()
            .filter(|c| c.brand.eq_ignore_ascii_case(brand) && c.model.eq_ignore_ascii_case(model))
            .map(|c| c.price)
            .collect();
        if prices.is_empty() {
            return Ok(None);
        }
        let total: Decimal = prices.iter().copied().sum();
        Ok(Some(total / Decimal::from(prices.len())))
    }

    async fn brands(&self) -> Result<Vec<String>, DatabaseError> {
        let cars = self.cars.read().await;
        Ok(cars.iter().map(|c| c.brand.clone()).collect::<BTreeSet<_>>().into_iter().collect())
    }

    async fn car_types(&self) -> Result<Vec<String>, DatabaseError> {
        let cars = self.cars.read().await;
        Ok(cars.iter().map(|c| c.car_type.clone()).collect::<BTreeSet<_>>().into_iter().collect())
    }

    async fn commit(&self, request: &CommitRequest) -> Result<String, CommitError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(CommitError::Rejected("record store unavailable".to_string()));
        }
        let mut commits = self.commits.lock().await;
        let key = request.idempotency_key();
        if let Some((id, _)) = commits.get(&key) {
            return Ok(id.clone());
        }
        let id = new_confirmation_id(request.confirmation_prefix());
        commits.insert(key, (id.clone(), request.clone()));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::traits::ServiceBooking;

    fn service_request(key: Uuid) -> CommitRequest {
        CommitRequest::Service(ServiceBooking {
            idempotency_key: key,
            user_id: "u1".into(),
            customer_name: "Asha".into(),
            phone: "9876543210".into(),
            make: "Honda".into(),
            model: "City".into(),
            year: 2019,
            registration_number: "KA01AB1234".into(),
            service_type: "Regular Service".into(),
        })
    }

    #[tokio::test]
    async fn search_filters_and_sorts_by_price() {
        let store = InMemoryRecordStore::with_demo_catalog();
        let found = store
            .search(&SearchCriteria {
                brand: Some("hyundai".into()),
                car_type: Some("suv".into()),
                max_price: Some(dec!(1000000)),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].model, "Venue");
        assert_eq!(found[1].model, "Creta");
    }

    #[tokio::test]
    async fn search_respects_limit() {
        let store = InMemoryRecordStore::with_demo_catalog();
        let found = store
            .search(&SearchCriteria {
                limit: 3,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].model, "Tiago");
    }

    #[tokio::test]
    async fn average_price_for_known_model() {
        let store = InMemoryRecordStore::with_demo_catalog();
        let avg = store.average_price("Honda", "City").await.unwrap();
        assert_eq!(avg, Some(dec!(790000)));
        assert_eq!(store.average_price("Honda", "Jazz").await.unwrap(), None);
    }

    #[tokio::test]
    async fn brands_are_distinct() {
        let store = InMemoryRecordStore::with_demo_catalog();
        let brands = store.brands().await.unwrap();
        assert_eq!(brands.iter().filter(|b| *b == "Hyundai").count(), 1);
        assert!(brands.contains(&"Kia".to_string()));
    }

    #[tokio::test]
    async fn repeated_commit_returns_same_id() {
        let store = InMemoryRecordStore::with_demo_catalog();
        let key = Uuid::new_v4();
        let first = store.commit(&service_request(key)).await.unwrap();
        let second = store.commit(&service_request(key)).await.unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("SB-"));
        assert_eq!(store.committed().await.len(), 1);
        assert_eq!(store.commit_calls(), 2);
    }

    #[tokio::test]
    async fn failing_commit_records_nothing() {
        let store = InMemoryRecordStore::with_demo_catalog();
        store.set_fail_commits(true);
        let err = store.commit(&service_request(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, CommitError::Rejected(_)));
        assert!(store.committed().await.is_empty());
    }
}
