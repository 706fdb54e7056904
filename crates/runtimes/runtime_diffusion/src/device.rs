//! Device selection
//!
//! Priority is Metal, then CUDA, then CPU. The first two run the model in
//! bf16; the CPU fallback runs in f32 and always succeeds.

use candle_core::{DType, Device};
use std::sync::OnceLock;
use zimage_runtime_api::{Backend, DeviceProfile, Precision};

static PROFILE: OnceLock<DeviceProfile> = OnceLock::new();

/// Probe the available backends once and cache the answer for the process.
pub fn select_device() -> DeviceProfile {
    *PROFILE.get_or_init(|| {
        let profile = profile_for(metal_available(), cuda_available());
        tracing::info!("Selected device: {}", profile);
        profile
    })
}

/// Selection rule, separated from probing
pub fn profile_for(metal_available: bool, cuda_available: bool) -> DeviceProfile {
    if metal_available {
        DeviceProfile {
            backend: Backend::Metal,
            precision: Precision::Bf16,
        }
    } else if cuda_available {
        DeviceProfile {
            backend: Backend::Cuda,
            precision: Precision::Bf16,
        }
    } else {
        DeviceProfile {
            backend: Backend::Cpu,
            precision: Precision::F32,
        }
    }
}

/// Open the candle device for a profile
pub fn device_for(profile: &DeviceProfile) -> candle_core::Result<Device> {
    match profile.backend {
        Backend::Metal => Device::new_metal(0),
        Backend::Cuda => Device::new_cuda(0),
        Backend::Cpu => Ok(Device::Cpu),
    }
}

pub fn dtype_for(precision: Precision) -> DType {
    match precision {
        Precision::Bf16 => DType::BF16,
        Precision::F32 => DType::F32,
    }
}

fn metal_available() -> bool {
    #[cfg(feature = "metal")]
    {
        Device::new_metal(0).is_ok()
    }
    #[cfg(not(feature = "metal"))]
    {
        false
    }
}

fn cuda_available() -> bool {
    #[cfg(feature = "cuda")]
    {
        Device::new_cuda(0).is_ok()
    }
    #[cfg(not(feature = "cuda"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metal_wins_over_cuda() {
        let profile = profile_for(true, true);
        assert_eq!(profile.backend, Backend::Metal);
        assert_eq!(profile.precision, Precision::Bf16);
    }

    #[test]
    fn cuda_when_no_metal() {
        let profile = profile_for(false, true);
        assert_eq!(profile.backend, Backend::Cuda);
        assert_eq!(profile.precision, Precision::Bf16);
    }

    #[test]
    fn cpu_fallback_is_full_precision() {
        let profile = profile_for(false, false);
        assert_eq!(profile.backend, Backend::Cpu);
        assert_eq!(profile.precision, Precision::F32);
        assert!(device_for(&profile).unwrap().is_cpu());
    }

    #[test]
    fn selection_is_cached() {
        assert_eq!(select_device(), select_device());
    }

    #[test]
    fn precision_maps_to_dtype() {
        assert_eq!(dtype_for(Precision::Bf16), DType::BF16);
        assert_eq!(dtype_for(Precision::F32), DType::F32);
    }
}
