//! Citewalk push pipeline library
//!
//! Core functionality for push notification delivery:
//! - SQLite storage for device registrations and the notification outbox
//! - Token store with encrypted-at-rest device tokens
//! - Outbox intake and the bus-driven delivery worker
//! - APNs and FCM provider senders
//! - gRPC `PushService`

pub mod error;
pub mod outbox;
pub mod senders;
pub mod server;
pub mod storage;
pub mod tokens;
pub mod worker;

pub use error::PushError;
