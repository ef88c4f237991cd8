pub mod device;
pub mod errors;
pub mod executor;
pub mod observability;
pub mod upload_client;
pub mod worker;

pub use device::{GroupSizes, WorkerCapabilities};
pub use errors::{AgentError, Result};
pub use executor::{
    HandlerError, HandlerRegistry, PoolConfig, PoolHandle, PoolStats, TaskContext, TaskHandler,
    WorkerGroup, WorkerPool,
};
pub use observability::{init_production_logging, init_simple_logging};
pub use upload_client::{upload_file, wait_for_record, UploadOptions, UploadReceipt};
pub use worker::{default_handlers, Worker};

/// Human-readable byte count
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_000_000_000 {
        format!("{:.1} GB", bytes as f64 / 1_000_000_000.0)
    } else if bytes >= 1_000_000 {
        format!("{:.1} MB", bytes as f64 / 1_000_000.0)
    } else if bytes >= 1_000 {
        format!("{:.1} KB", bytes as f64 / 1_000.0)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(15_728_640), "15.7 MB");
        assert_eq!(format_bytes(2_500_000_000), "2.5 GB");
    }
}
