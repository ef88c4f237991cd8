//! Task queue: durable records, leases and retry policy.

pub mod dispatcher;
pub mod types;

pub use dispatcher::{Dispatcher, CANCELLED_MESSAGE};
pub use types::{
    ConvertPayload, HeartbeatStatus, InferPayload, Lease, MergePayload, RetryPolicy, TaskRecord,
};
