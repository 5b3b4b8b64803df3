//! # Compute Device Selection
//!
//! Picks the Candle device the local Whisper backend runs on. `stt.device` is
//! validated at startup, so by the time a device is created the preference
//! always parses; GPU preferences still fall back to CPU when the hardware or
//! the Candle build lacks support.

use candle_core::Device;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Result of the one-time `auto` probe.
static AUTO_DEVICE: OnceLock<Device> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// CUDA, then Metal, then CPU
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("unknown device '{}', expected auto, cpu, cuda or metal", s)),
        }
    }
}

pub struct DeviceManager;

impl DeviceManager {
    pub fn get_device(preference: DevicePreference) -> Device {
        match preference {
            DevicePreference::Auto => Self::get_best_device(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => Self::cuda().unwrap_or(Device::Cpu),
            DevicePreference::Metal => Self::metal().unwrap_or(Device::Cpu),
        }
    }

    /// Best available device, probed once per process.
    pub fn get_best_device() -> Device {
        AUTO_DEVICE
            .get_or_init(|| {
                let device = Self::cuda().or_else(Self::metal).unwrap_or(Device::Cpu);
                info!(device = %Self::get_device_info(&device), "Selected compute device for Whisper");
                device
            })
            .clone()
    }

    fn cuda() -> Option<Device> {
        Device::new_cuda(0)
            .map_err(|e| debug!("CUDA not available: {}", e))
            .ok()
    }

    fn metal() -> Option<Device> {
        Device::new_metal(0)
            .map_err(|e| debug!("Metal not available: {}", e))
            .ok()
    }

    pub fn get_device_info(device: &Device) -> String {
        match device {
            Device::Cpu => "CPU".to_string(),
            Device::Cuda(_) => "CUDA GPU".to_string(),
            Device::Metal(_) => "Metal GPU".to_string(),
        }
    }
}

/// Device for an `stt.device` setting; an unparsable value means `auto`.
pub fn create_device_from_string(device_str: &str) -> Device {
    let preference = device_str.parse::<DevicePreference>().unwrap_or_default();
    DeviceManager::get_device(preference)
}
