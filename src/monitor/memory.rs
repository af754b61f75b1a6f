//! Memory sampling for the performance monitor.

use std::fs;
#[cfg(feature = "cuda")]
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::device::{Backend, DeviceContext};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Source of the memory figure recorded per frame.
pub trait MemoryProbe: Send + Sync {
    /// Reset the peak counter, where supported.
    fn reset_peak(&self);

    /// Peak memory since the last reset, in megabytes.
    fn peak_mb(&self) -> f64;

    /// Short name of what is measured, for logs.
    fn source(&self) -> &'static str;
}

/// Probe matching the selected backend: device memory on CUDA, process memory elsewhere.
#[must_use]
pub fn probe_for(ctx: &DeviceContext) -> Box<dyn MemoryProbe> {
    if let Some(probe) = device_probe(ctx) {
        return probe;
    }
    if ctx.backend() != Backend::Cpu {
        debug!(backend = %ctx.backend(), "no device memory probe, sampling process memory");
    }
    Box::new(ProcessMemory)
}

#[cfg(feature = "cuda")]
fn device_probe(ctx: &DeviceContext) -> Option<Box<dyn MemoryProbe>> {
    match ctx.device() {
        candle_core::Device::Cuda(device) => Some(Box::new(CudaMemory::new(device.clone()))),
        _ => None,
    }
}

#[cfg(not(feature = "cuda"))]
fn device_probe(_ctx: &DeviceContext) -> Option<Box<dyn MemoryProbe>> {
    None
}

/// Process memory from `/proc/self/status`.
///
/// Reports the resident-set high-water mark (`VmHWM`), falling back to the current resident set
/// (`VmRSS`). Resetting writes `5` to `/proc/self/clear_refs`. On platforms without procfs the
/// probe reports zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemory;

impl ProcessMemory {
    fn status_kb(field: &str) -> Option<u64> {
        let status = fs::read_to_string("/proc/self/status").ok()?;
        parse_status_kb(&status, field)
    }
}

impl MemoryProbe for ProcessMemory {
    fn reset_peak(&self) {
        if let Err(e) = fs::write("/proc/self/clear_refs", "5") {
            debug!(error = %e, "peak memory reset unavailable");
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn peak_mb(&self) -> f64 {
        Self::status_kb("VmHWM")
            .or_else(|| Self::status_kb("VmRSS"))
            .map_or(0.0, |kb| (kb * 1024) as f64 / BYTES_PER_MB)
    }

    fn source(&self) -> &'static str {
        "process"
    }
}

/// Device memory in use on a CUDA device, from the driver's free/total counters.
///
/// The driver keeps no high-water mark, so the peak is the larger of the samples taken at
/// reset and at read time.
#[cfg(feature = "cuda")]
pub struct CudaMemory {
    device: candle_core::CudaDevice,
    at_reset: AtomicUsize,
}

#[cfg(feature = "cuda")]
impl CudaMemory {
    /// Probe for `device`.
    #[must_use]
    pub fn new(device: candle_core::CudaDevice) -> Self {
        Self {
            device,
            at_reset: AtomicUsize::new(0),
        }
    }

    fn used_bytes(&self) -> Option<usize> {
        use candle_core::cuda::cudarc::driver::result;

        if let Err(e) = self.device.cuda_device().bind_to_thread() {
            debug!(error = %e, "cuda context unavailable");
            return None;
        }
        let (free, total) = result::mem_get_info().ok()?;
        Some(total.saturating_sub(free))
    }
}

#[cfg(feature = "cuda")]
impl MemoryProbe for CudaMemory {
    fn reset_peak(&self) {
        let used = self.used_bytes().unwrap_or(0);
        self.at_reset.store(used, Ordering::Relaxed);
    }

    #[allow(clippy::cast_precision_loss)]
    fn peak_mb(&self) -> f64 {
        let at_reset = self.at_reset.load(Ordering::Relaxed);
        let now = self.used_bytes().unwrap_or(0);
        at_reset.max(now) as f64 / BYTES_PER_MB
    }

    fn source(&self) -> &'static str {
        "cuda"
    }
}

/// Probe that always reports zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMemory;

impl MemoryProbe for NullMemory {
    fn reset_peak(&self) {}

    fn peak_mb(&self) -> f64 {
        0.0
    }

    fn source(&self) -> &'static str {
        "none"
    }
}

/// Parse a `Name:   1234 kB` line out of a procfs status file.
fn parse_status_kb(status: &str, field: &str) -> Option<u64> {
    status.lines().find_map(|line| {
        let rest = line.strip_prefix(field)?.strip_prefix(':')?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str =
        "Name:\tedge-lora\nVmPeak:\t  300000 kB\nVmHWM:\t    2048 kB\nVmRSS:\t    1024 kB\n";

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status_kb(STATUS, "VmHWM"), Some(2048));
        assert_eq!(parse_status_kb(STATUS, "VmRSS"), Some(1024));
        assert_eq!(parse_status_kb(STATUS, "VmSwap"), None);
        assert_eq!(parse_status_kb(STATUS, "Vm"), None);
    }

    #[test]
    fn test_null_probe() {
        let probe = NullMemory;
        probe.reset_peak();
        assert!(probe.peak_mb().abs() < f64::EPSILON);
    }

    #[test]
    fn test_process_probe_non_negative() {
        let probe = ProcessMemory;
        probe.reset_peak();
        assert!(probe.peak_mb() >= 0.0);
    }

    #[test]
    fn test_cpu_context_samples_process_memory() {
        assert_eq!(probe_for(&DeviceContext::cpu()).source(), "process");
    }
}
