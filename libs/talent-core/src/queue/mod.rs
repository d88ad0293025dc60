//! Job queue service: two named queues over a shared broker, with retry,
//! backoff, broker-global rate limiting and an in-process fallback when the
//! broker cannot be reached.

mod broker;
mod memory;
mod redis_broker;
mod service;

#[cfg(test)]
mod queue_tests;

pub use broker::{Broker, BrokerConnector};
pub use memory::{MemoryBroker, MemoryConnector};
pub use redis_broker::{RedisBroker, RedisConnector};
pub use service::{ConnectionState, QueueService};
