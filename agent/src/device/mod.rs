//! Hardware detection used to size worker groups.

mod capabilities;

pub use capabilities::{parse_visible_devices, GroupSizes, WorkerCapabilities};
