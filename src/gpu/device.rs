//! GPU adapter enumeration and selection.
//!
//! On the boards this tool targets the GPU is integrated and renders out of
//! the same DRAM the memory tester is exercising, so auto-selection prefers
//! integrated adapters.

use crate::error::GpuError;
use wgpu::{Adapter, Backend, Backends, DeviceType, Instance, InstanceDescriptor};

/// Information about an available GPU.
#[derive(Debug, Clone)]
pub struct GpuInfo {
    /// Index in the enumerated list.
    pub index: usize,
    /// GPU name (e.g., "Mali-400 MP").
    pub name: String,
    /// Vendor name (e.g., "ARM").
    pub vendor: String,
    /// Graphics API backend (Vulkan, GL, ...).
    pub backend: Backend,
    /// Device type (integrated, discrete, ...).
    pub device_type: DeviceType,
    /// Driver version string.
    pub driver: String,
}

impl GpuInfo {
    fn from_adapter(index: usize, adapter: &Adapter) -> Self {
        let info = adapter.get_info();
        Self {
            index,
            name: info.name,
            vendor: vendor_name(info.vendor),
            backend: info.backend,
            device_type: info.device_type,
            driver: info.driver,
        }
    }
}

impl std::fmt::Display for GpuInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} ({}, {:?}, {:?})",
            self.index, self.name, self.vendor, self.backend, self.device_type
        )
    }
}

fn adapters() -> Vec<Adapter> {
    let instance = Instance::new(&InstanceDescriptor::default());
    instance.enumerate_adapters(Backends::all())
}

/// Enumerate all available GPU adapters.
///
/// The list may be empty if no GPUs are available.
pub fn enumerate_gpus() -> Vec<GpuInfo> {
    adapters()
        .iter()
        .enumerate()
        .map(|(index, adapter)| GpuInfo::from_adapter(index, adapter))
        .collect()
}

/// Select a GPU adapter by index, or the preferred one if `index` is `None`.
///
/// # Errors
///
/// Returns `GpuError::NoAdapter` if no GPUs are available.
/// Returns `GpuError::AdapterNotFound` if the specified index is invalid.
pub fn select_gpu(index: Option<usize>) -> Result<(Adapter, GpuInfo), GpuError> {
    let mut adapters = adapters();

    if adapters.is_empty() {
        return Err(GpuError::NoAdapter);
    }

    let idx = match index {
        Some(idx) if idx >= adapters.len() => {
            let available = adapters.iter().map(|a| a.get_info().name).collect();
            return Err(GpuError::AdapterNotFound {
                index: idx,
                available,
            });
        }
        Some(idx) => idx,
        None => {
            let types: Vec<DeviceType> =
                adapters.iter().map(|a| a.get_info().device_type).collect();
            preferred_index(&types)
        }
    };

    let adapter = adapters.swap_remove(idx);
    let info = GpuInfo::from_adapter(idx, &adapter);
    Ok((adapter, info))
}

/// Lower is better. CPU (software) rasterisers come last since they do not
/// load the GPU at all.
fn preference_rank(device_type: DeviceType) -> u8 {
    match device_type {
        DeviceType::IntegratedGpu => 0,
        DeviceType::DiscreteGpu => 1,
        DeviceType::VirtualGpu => 2,
        DeviceType::Cpu => 4,
        _ => 3,
    }
}

/// Picks the best adapter; ties go to the lowest index.
fn preferred_index(types: &[DeviceType]) -> usize {
    types
        .iter()
        .enumerate()
        .min_by_key(|(i, t)| (preference_rank(**t), *i))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Convert vendor ID to human-readable name.
fn vendor_name(vendor_id: u32) -> String {
    match vendor_id {
        0x13B5 => "ARM".to_string(),
        0x5143 => "Qualcomm".to_string(),
        0x1010 => "ImgTec".to_string(),
        0x14E4 => "Broadcom".to_string(),
        0x1002 => "AMD".to_string(),
        0x10DE => "NVIDIA".to_string(),
        0x8086 => "Intel".to_string(),
        0x106B => "Apple".to_string(),
        _ => format!("Unknown (0x{:04X})", vendor_id),
    }
}
