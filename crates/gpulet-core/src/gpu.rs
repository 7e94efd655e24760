//! GPU inventory probing

use nvml_wrapper::Nvml;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::config::GpuConfig;
use crate::error::{GpuletError, GpuletResult};

/// Point-in-time view of one physical GPU as reported by a probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDevice {
    /// Device index, matching the CUDA device ordinal
    pub index: u32,
    /// Device product name
    pub name: String,
    /// Total memory in bytes
    pub memory_total: u64,
    /// Memory in use in bytes
    pub memory_used: u64,
    /// Current utilization percentage (0-100)
    pub utilization: u32,
    /// Whether the probe judged the device occupied by outside work
    pub busy: bool,
}

/// One entry in the allocator's device ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSlot {
    /// Device index
    pub index: u32,
    /// Whether the device is reserved for a task
    pub busy: bool,
    /// Task holding the reservation, when busy
    pub owner_task: Option<Uuid>,
}

impl DeviceSlot {
    /// Create a free slot for a device index
    pub fn free(index: u32) -> Self {
        Self {
            index,
            busy: false,
            owner_task: None,
        }
    }
}

/// Source of GPU inventory, consulted at startup and on reconciliation
pub trait GpuProbe: Send + Sync {
    /// Return the host's devices ordered by index
    fn probe(&self) -> GpuletResult<Vec<GpuDevice>>;
}

/// Probe backed by the NVIDIA Management Library
pub struct NvmlProbe {
    nvml: Nvml,
    utilization_threshold: u32,
    memory_threshold: f64,
}

impl NvmlProbe {
    /// Initialize NVML; fails on hosts without the NVIDIA driver
    pub fn new(config: &GpuConfig) -> GpuletResult<Self> {
        let nvml = Nvml::init()
            .map_err(|e| GpuletError::Probe(format!("NVML initialization failed: {e}")))?;
        Ok(Self {
            nvml,
            utilization_threshold: config.utilization_threshold,
            memory_threshold: config.memory_threshold,
        })
    }

    fn read_device(&self, index: u32) -> GpuDevice {
        match self.try_read_device(index) {
            Ok(device) => device,
            Err(e) => {
                warn!(index, error = %e, "GPU query failed, treating device as busy");
                GpuDevice {
                    index,
                    name: "unknown".to_string(),
                    memory_total: 0,
                    memory_used: 0,
                    utilization: 0,
                    busy: true,
                }
            }
        }
    }

    fn try_read_device(&self, index: u32) -> Result<GpuDevice, nvml_wrapper::error::NvmlError> {
        let device = self.nvml.device_by_index(index)?;
        let name = device.name()?;
        let memory = device.memory_info()?;
        let utilization = device.utilization_rates()?.gpu;
        let memory_fraction = if memory.total == 0 {
            1.0
        } else {
            memory.used as f64 / memory.total as f64
        };
        let busy = utilization >= self.utilization_threshold
            || memory_fraction >= self.memory_threshold;
        Ok(GpuDevice {
            index,
            name,
            memory_total: memory.total,
            memory_used: memory.used,
            utilization,
            busy,
        })
    }
}

impl GpuProbe for NvmlProbe {
    fn probe(&self) -> GpuletResult<Vec<GpuDevice>> {
        let count = self
            .nvml
            .device_count()
            .map_err(|e| GpuletError::Probe(format!("device count query failed: {e}")))?;
        Ok((0..count).map(|index| self.read_device(index)).collect())
    }
}

/// Fixed inventory of idle virtual devices, for hosts without NVML and for tests
pub struct StaticProbe {
    count: u32,
}

impl StaticProbe {
    /// Create a probe reporting `count` idle devices
    pub fn new(count: u32) -> Self {
        Self { count }
    }
}

impl GpuProbe for StaticProbe {
    fn probe(&self) -> GpuletResult<Vec<GpuDevice>> {
        Ok((0..self.count)
            .map(|index| GpuDevice {
                index,
                name: format!("virtual-gpu-{index}"),
                memory_total: 0,
                memory_used: 0,
                utilization: 0,
                busy: false,
            })
            .collect())
    }
}
