//! SQLite storage for the push pipeline.
//!
//! Provides persistence for device registrations and the notification outbox.

mod db;
mod models;
mod queries_devices;
mod queries_outbox;

pub use citewalk_core::db::DatabaseError;
pub use db::PushDatabase;
pub use models::*;
pub use queries_devices::{NewDeviceRow, RefreshDeviceRow};
pub use queries_outbox::NewOutboxRow;
