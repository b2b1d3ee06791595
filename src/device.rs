//! # Device and Precision Selection
//!
//! Maps the configured transcription device (`cpu`, `cuda`, `metal`, `auto`)
//! and compute type (`float32`, `float16`, `bfloat16`, `int8`) onto a Candle
//! `Device` and `DType`. GPU preferences fall back to the CPU when the backend
//! is unavailable.

use candle_core::{DType, Device};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Cached best available device to avoid repeated detection
static BEST_DEVICE: OnceLock<Device> = OnceLock::new();

/// Device preferences for model inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Automatically select the best available device
    #[default]
    Auto,
    Cpu,
    /// CUDA GPU, falling back to CPU
    Cuda,
    /// Metal GPU, falling back to CPU
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

pub struct DeviceManager;

impl DeviceManager {
    pub fn get_device(preference: DevicePreference) -> Device {
        match preference {
            DevicePreference::Auto => Self::get_best_device(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => Self::get_cuda_device().unwrap_or_else(|| {
                warn!("CUDA requested but not available, using CPU");
                Device::Cpu
            }),
            DevicePreference::Metal => Self::get_metal_device().unwrap_or_else(|| {
                warn!("Metal requested but not available, using CPU");
                Device::Cpu
            }),
        }
    }

    /// Best available device, detected once per process.
    pub fn get_best_device() -> Device {
        BEST_DEVICE.get_or_init(Self::detect_best_device).clone()
    }

    fn detect_best_device() -> Device {
        info!("Detecting best available compute device...");

        if let Some(cuda_device) = Self::get_cuda_device() {
            info!("Selected CUDA GPU for ML inference");
            return cuda_device;
        }

        if let Some(metal_device) = Self::get_metal_device() {
            info!("Selected Metal GPU for ML inference");
            return metal_device;
        }

        info!("Using CPU for ML inference (no GPU acceleration available)");
        Device::Cpu
    }

    fn get_cuda_device() -> Option<Device> {
        match Device::new_cuda(0) {
            Ok(device) => {
                debug!("CUDA device 0 available");
                Some(device)
            }
            Err(e) => {
                debug!("CUDA not available: {}", e);
                None
            }
        }
    }

    fn get_metal_device() -> Option<Device> {
        match Device::new_metal(0) {
            Ok(device) => {
                debug!("Metal device 0 available");
                Some(device)
            }
            Err(e) => {
                debug!("Metal not available: {}", e);
                None
            }
        }
    }

    pub fn get_device_info(device: &Device) -> &'static str {
        match device {
            Device::Cpu => "CPU",
            Device::Cuda(_) => "CUDA GPU",
            Device::Metal(_) => "Metal GPU",
        }
    }
}

/// Create a device from a configured preference, using `auto` for unknown values.
pub fn create_device_from_string(device_str: &str) -> Device {
    match device_str.parse::<DevicePreference>() {
        Ok(preference) => DeviceManager::get_device(preference),
        Err(_) => {
            warn!("Invalid device preference '{}', using auto", device_str);
            DeviceManager::get_best_device()
        }
    }
}

/// Weight precision for a compute type on `device`.
///
/// Quantized types have no Candle equivalent for Whisper and load as
/// `float32`. Half precision is only honoured on GPUs.
pub fn select_dtype(compute_type: &str, device: &Device) -> DType {
    let requested = match compute_type.trim().to_lowercase().as_str() {
        "float16" | "f16" => DType::F16,
        "bfloat16" | "bf16" => DType::BF16,
        "float32" | "f32" | "default" | "auto" => DType::F32,
        other => {
            if other.starts_with("int8") {
                warn!(compute_type = %other, "Quantized compute type not supported, loading float32 weights");
            } else {
                warn!(compute_type = %other, "Unknown compute type, loading float32 weights");
            }
            DType::F32
        }
    };

    if requested != DType::F32 && device.is_cpu() {
        warn!(compute_type = %compute_type, "Half precision requested on CPU, using float32");
        return DType::F32;
    }
    requested
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!(" CPU ".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("cuda".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("metal".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_cpu_preference_is_cpu() {
        assert!(DeviceManager::get_device(DevicePreference::Cpu).is_cpu());
        assert!(create_device_from_string("cpu").is_cpu());
    }

    #[test]
    fn test_compute_type_on_cpu_is_float32() {
        let cpu = Device::Cpu;
        assert_eq!(select_dtype("int8", &cpu), DType::F32);
        assert_eq!(select_dtype("int8_float16", &cpu), DType::F32);
        assert_eq!(select_dtype("float16", &cpu), DType::F32);
        assert_eq!(select_dtype("float32", &cpu), DType::F32);
    }
}
