//! Citewalk event bus
//!
//! A publish/subscribe abstraction over a partitioned, replayable topic log.
//!
//! - Topics are created lazily and idempotently on first publish or subscribe.
//! - A dedup key routes a record to a fixed partition, so records sharing a
//!   key are consumed in publish order.
//! - Subscribers sharing a consumer group split the partitions between them;
//!   each group receives the full stream.
//! - Delivery is at-least-once. A failing handler is logged and its record is
//!   still committed.
//!
//! [`SqliteEventBus`] is the durable backend: every process opening the same
//! database file takes part in the same consumer groups.

mod consumer;
pub mod error;
pub mod event_bus;
mod partition;
pub mod record;
pub mod sqlite;
pub mod storage;
mod topics;

pub use error::BusError;
pub use event_bus::{
    BusMessage, EventBus, EventBusExt, EventHandler, HandlerResult, PublishOptions,
    SubscribeOptions, handler_fn,
};
pub use sqlite::{BusOptions, SqliteEventBus};
pub use storage::BusDatabase;
