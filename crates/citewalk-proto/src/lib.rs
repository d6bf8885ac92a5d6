//! Citewalk Protocol Buffers
//!
//! Generated protobuf code for the Citewalk push gRPC API.
//!
//! This crate contains:
//! - `PushService` for device registration and notification intake

#![allow(clippy::derive_partial_eq_without_eq)]

/// Citewalk v1 API definitions.
///
/// All generated types and services are included here.
pub mod v1 {
    tonic::include_proto!("citewalk.v1");
}

pub use v1::*;
