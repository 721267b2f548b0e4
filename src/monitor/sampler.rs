//! Resource sampling backends

use crate::errors::SamplingError;
use parking_lot::Mutex;
use std::time::Instant;
use sysinfo::{Pid, System};

/// Process IO rate treated as 100% activity.
pub const IO_CEILING_BYTES_PER_SEC: f64 = 64.0 * 1024.0 * 1024.0;

/// One raw reading, before thresholds are applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    /// Process CPU usage; may exceed 100 on multi-core machines
    pub cpu_percent: f64,
    /// Process resident memory
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    /// Process disk read+write rate since the previous sample
    pub io_bytes_per_sec: f64,
}

impl RawSample {
    pub fn memory_percent(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            return 0.0;
        }
        (self.memory_used_bytes as f64 / self.memory_total_bytes as f64 * 100.0).clamp(0.0, 100.0)
    }

    pub fn io_percent(&self) -> f64 {
        (self.io_bytes_per_sec / IO_CEILING_BYTES_PER_SEC * 100.0).clamp(0.0, 100.0)
    }
}

/// Source of resource readings. Called from a blocking thread.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> Result<RawSample, SamplingError>;
}

/// Samples the current process through `sysinfo`.
pub struct SystemSampler {
    pid: Option<Pid>,
    state: Mutex<SamplerState>,
}

struct SamplerState {
    system: System,
    last_refresh: Option<Instant>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();

        Self {
            pid: sysinfo::get_current_pid().ok(),
            state: Mutex::new(SamplerState {
                system,
                last_refresh: None,
            }),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> Result<RawSample, SamplingError> {
        let pid = self
            .pid
            .ok_or_else(|| SamplingError::Unavailable("current pid is unknown".to_string()))?;

        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = state
            .last_refresh
            .map(|at| now.duration_since(at).as_secs_f64())
            .unwrap_or(0.0);

        state.system.refresh_memory();
        if !state.system.refresh_process(pid) {
            return Err(SamplingError::ProcessMissing(pid.as_u32()));
        }
        state.last_refresh = Some(now);

        let total = state.system.total_memory();
        let process = state
            .system
            .process(pid)
            .ok_or(SamplingError::ProcessMissing(pid.as_u32()))?;

        let disk = process.disk_usage();
        let io_bytes = disk.read_bytes.saturating_add(disk.written_bytes);
        let io_bytes_per_sec = if elapsed > 0.0 {
            io_bytes as f64 / elapsed
        } else {
            0.0
        };

        Ok(RawSample {
            cpu_percent: f64::from(process.cpu_usage()),
            memory_used_bytes: process.memory(),
            memory_total_bytes: total,
            io_bytes_per_sec,
        })
    }
}

/// Sampler returning readings set by its owner.
///
/// Reports `Unavailable` until the first reading is set or after `fail`.
#[derive(Debug, Default)]
pub struct StaticSampler {
    reading: Mutex<Option<RawSample>>,
}

impl StaticSampler {
    pub fn new(reading: RawSample) -> Self {
        Self {
            reading: Mutex::new(Some(reading)),
        }
    }

    pub fn set(&self, reading: RawSample) {
        *self.reading.lock() = Some(reading);
    }

    pub fn fail(&self) {
        *self.reading.lock() = None;
    }
}

impl ResourceSampler for StaticSampler {
    fn sample(&self) -> Result<RawSample, SamplingError> {
        (*self.reading.lock()).ok_or_else(|| SamplingError::Unavailable("no reading set".to_string()))
    }
}
