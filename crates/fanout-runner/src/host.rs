//! Host resource readings.

use sysinfo::System;

/// Global CPU usage of the machine running the sessions.
///
/// sysinfo computes usage as a delta between refreshes, so the first
/// reading after construction is usually `0.0`; that reading is reported as
/// no data rather than an idle CPU.
pub struct HostProbe {
    sys: System,
}

impl HostProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        Self { sys }
    }

    pub fn cpu_percent(&mut self) -> Option<f64> {
        self.sys.refresh_cpu_usage();
        let usage = self.sys.global_cpu_usage() as f64;
        (usage.is_finite() && usage > 0.0).then_some(usage.min(100.0))
    }
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new()
    }
}
