//! GPU utilization telemetry for the idle watcher.
//!
//! A trait seam so the idle watcher can be exercised in tests without a
//! GPU; the real implementation reads NVML. When the probe fails at
//! runtime the watcher falls back to timing a context synchronize and
//! stops asking.

use nvml_wrapper::{Device, Nvml};

use crate::error::AgentError;

pub trait UtilizationProbe: Send {
    /// Percent of the last sample period during which kernels were
    /// executing on the GPU.
    fn utilization(&mut self) -> Result<u32, AgentError>;
}

pub struct NvmlProbe {
    device: Device<'static>,
}

impl NvmlProbe {
    /// Initialize NVML and grab device 0.
    pub fn init() -> Result<Self, AgentError> {
        // `Device` borrows from `Nvml`, which must therefore outlive it.
        // Leaking the `Nvml` box gives it the process lifetime it
        // effectively has anyway.
        let nvml = Box::leak(Box::new(Nvml::init()?));
        let device = nvml.device_by_index(0)?;
        Ok(Self { device })
    }
}

impl UtilizationProbe for NvmlProbe {
    fn utilization(&mut self) -> Result<u32, AgentError> {
        Ok(self.device.utilization_rates()?.gpu)
    }
}
