use model_hub::config::WorkersConfig;
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Hardware the worker process can use.
///
/// Detected at runtime using the `sysinfo` crate and `CUDA_VISIBLE_DEVICES`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerCapabilities {
    /// Number of CPU cores
    pub cpu_cores: usize,

    /// Total RAM in megabytes
    pub ram_mb: usize,

    /// Visible GPU devices
    pub accelerators: usize,

    pub os: String,
    pub arch: String,
}

/// Number of executors per worker group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupSizes {
    pub merge: usize,
    pub convert: usize,
    pub infer: usize,
}

impl WorkerCapabilities {
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let cpu_cores = sys.cpus().len();
        let ram_mb = (sys.total_memory() / 1_048_576) as usize;
        let accelerators =
            parse_visible_devices(std::env::var("CUDA_VISIBLE_DEVICES").ok().as_deref());

        Self {
            cpu_cores,
            ram_mb,
            accelerators,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// Resolve configured group sizes against the hardware.
    ///
    /// A configured size of 0 means "detect". The infer group is capped at the
    /// accelerator count; without accelerators it runs a single CPU executor.
    pub fn group_sizes(&self, config: &WorkersConfig) -> GroupSizes {
        let cores = self.cpu_cores.max(1);
        let accelerators = config.accelerators.unwrap_or(self.accelerators);
        let infer_cap = accelerators.max(1);

        GroupSizes {
            merge: match config.merge {
                0 => (cores / 2).max(1),
                n => n,
            },
            convert: match config.convert {
                0 => 1,
                n => n,
            },
            infer: match config.infer {
                0 => infer_cap,
                n => n.min(infer_cap),
            },
        }
    }
}

/// Count devices in a `CUDA_VISIBLE_DEVICES` value.
///
/// Unset means no accelerators; `-1` or an empty value hides all devices.
pub fn parse_visible_devices(value: Option<&str>) -> usize {
    let Some(value) = value else {
        return 0;
    };
    let value = value.trim();
    if value.is_empty() || value.starts_with("-1") || value.eq_ignore_ascii_case("NoDevFiles") {
        return 0;
    }
    value
        .split(',')
        .map(str::trim)
        .take_while(|id| !id.is_empty() && !id.starts_with('-'))
        .count()
}
