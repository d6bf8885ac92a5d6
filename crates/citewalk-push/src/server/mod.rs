//! gRPC server implementations for the push pipeline.

pub mod push_svc;

pub use push_svc::PushServiceImpl;
