//! Task execution for the model hub workers
//!
//! - `pool`: worker groups leasing records and settling them
//! - `handler`: the handler trait and table the pool dispatches through
//! - `merge`, `convert`, `infer`: one handler per task kind

pub mod command;
pub mod convert;
pub mod handler;
pub mod infer;
pub mod merge;
pub mod pool;
pub mod stats;

pub use command::CommandTemplate;
pub use convert::{CommandConverter, ConvertHandler, Converter};
pub use handler::{HandlerError, HandlerRegistry, TaskContext, TaskHandler};
pub use infer::{CommandEngine, InferHandler, InferenceEngine};
pub use merge::MergeHandler;
pub use pool::{standard_groups, PoolConfig, PoolHandle, WorkerGroup, WorkerPool};
pub use stats::{PoolStats, StatsSnapshot};
