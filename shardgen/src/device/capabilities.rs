use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Host hardware capabilities.
///
/// Detected at runtime using the `sysinfo` crate and used to size the
/// virtual device mesh when no explicit device count is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Number of CPU cores
    pub cpu_cores: usize,

    /// Total RAM in bytes
    pub ram_bytes: u64,

    /// Operating system
    pub os: String,

    /// CPU architecture
    pub arch: String,
}

impl DeviceCapabilities {
    /// Detect current host capabilities.
    ///
    /// # Example
    ///
    /// ```
    /// use shardgen::DeviceCapabilities;
    ///
    /// let caps = DeviceCapabilities::detect();
    /// println!("{} cores, {} MB", caps.cpu_cores, caps.ram_mb());
    /// ```
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            cpu_cores: sys.cpus().len().max(1),
            ram_bytes: sys.total_memory(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// Total RAM in megabytes
    pub fn ram_mb(&self) -> u64 {
        self.ram_bytes / 1_048_576
    }
}
