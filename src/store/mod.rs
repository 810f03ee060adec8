//! Persistence layer: catalogue, bookings and conversation state.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::{InMemoryRecordStore, demo_catalog};
pub use traits::{
    CarRecord, CommitRequest, DriveLocation, RecordStore, SearchCriteria, ServiceBooking,
    TestDriveBooking, new_confirmation_id,
};
