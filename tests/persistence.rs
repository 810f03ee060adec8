//! Conversations backed by the libSQL store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use autosherpa::conversation::{ConversationStateStore, FlowName, Step};
use autosherpa::store::LibSqlBackend;

use common::Builder;

const USER: &str = "919800000002";

async fn open(path: &std::path::Path) -> Arc<LibSqlBackend> {
    let backend = LibSqlBackend::new_local(path).await.unwrap();
    backend.seed_demo_catalog().await.unwrap();
    Arc::new(backend)
}

#[tokio::test]
async fn conversation_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autosherpa.db");

    {
        let db = open(&path).await;
        let h = Builder::new()
            .records(db.clone())
            .states(db.clone())
            .build()
            .await;
        h.say(USER, "I want to buy a car").await;
        h.say(USER, "Hyundai SUV under 10 lakh").await;
    }

    let db = open(&path).await;
    let state = db.get(USER).await.unwrap().expect("state persisted");
    assert_eq!(state.flow, FlowName::Browse);
    assert_eq!(state.step, Step::ShowingResults);
    assert!(state.data.cars("results").is_some_and(|cars| !cars.is_empty()));

    let h = Builder::new()
        .records(db.clone())
        .states(db.clone())
        .build()
        .await;
    let reply = h.say(USER, "1").await;
    assert!(reply.contains("Nice choice"));
    assert_eq!(db.get(USER).await.unwrap().unwrap().step, Step::CarSelected);
}

#[tokio::test]
async fn service_booking_lands_in_the_database() {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    db.seed_demo_catalog().await.unwrap();
    let h = Builder::new()
        .records(db.clone())
        .states(db.clone())
        .build()
        .await;

    h.say(USER, "book a service").await;
    if db.get(USER).await.unwrap().unwrap().step == Step::ShowingServices {
        h.say(USER, "1").await;
    }
    h.say(USER, "Honda City 2018 MH12AB1234").await;
    h.say(USER, "2").await;
    h.say(USER, "Meera Shah 9812345678").await;
    let reply = h.say(USER, "yes").await;

    assert!(reply.contains("SB-"), "got: {reply}");
    assert_eq!(db.booking_counts().await.unwrap(), (0, 1));
}

#[tokio::test]
async fn idle_conversation_expires() {
    let db = Arc::new(
        LibSqlBackend::new_memory()
            .await
            .unwrap()
            .with_state_ttl(Duration::from_millis(300)),
    );
    db.seed_demo_catalog().await.unwrap();
    let h = Builder::new()
        .records(db.clone())
        .states(db.clone())
        .build()
        .await;

    h.say(USER, "I want to buy a car").await;
    assert!(db.get(USER).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(db.get(USER).await.unwrap().is_none());
}
