use std::sync::Arc;

use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device};

use crate::error::PipelineResult;
use crate::DeviceMap;

fn select_best_device(device_map: DeviceMap) -> candle_core::Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Device::new_cuda(ordinal),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Device::new_metal(ordinal),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::info!(
                    "running on CPU, to run on GPU(metal), build with `--features metal`"
                );
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::info!("running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// The acceleration context every stage runs on.
///
/// Acquired once and shared by reference count; the device is released when the
/// last `Arc` goes away, whichever path drops it.
#[derive(Debug)]
pub struct ResourceEnvironment {
    device: Device,
    dtype: DType,
}

impl ResourceEnvironment {
    pub fn acquire(device_map: DeviceMap) -> PipelineResult<Arc<Self>> {
        let device = select_best_device(device_map)?;
        let dtype = device.bf16_default_to_f32();
        tracing::info!(device = ?device, ?dtype, "acquired resource environment");
        Ok(Arc::new(Self { device, dtype }))
    }

    /// CPU environment with `f32` tensors.
    pub fn cpu() -> Arc<Self> {
        Arc::new(Self {
            device: Device::Cpu,
            dtype: DType::F32,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

impl Drop for ResourceEnvironment {
    fn drop(&mut self) {
        if let Err(err) = self.device.synchronize() {
            tracing::warn!(%err, "device synchronization failed during release");
        }
        tracing::info!(device = ?self.device, "released resource environment");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_cpu_yields_cpu_f32() {
        let env = ResourceEnvironment::acquire(DeviceMap::ForceCpu).unwrap();
        assert!(env.device().is_cpu());
        assert_eq!(env.dtype(), DType::F32);
    }

    #[test]
    fn holders_share_one_environment() {
        let env = ResourceEnvironment::cpu();
        let other = Arc::clone(&env);
        assert_eq!(Arc::strong_count(&env), 2);
        drop(other);
        assert_eq!(Arc::strong_count(&env), 1);
    }
}
