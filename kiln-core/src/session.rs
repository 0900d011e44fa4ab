use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use tracing::{info, warn};

/// Which device the operator asked for. Resolution never fails: an ordinal
/// that cannot be honoured degrades to the CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Accelerator {
    Cuda,
    Metal,
    Cpu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precision {
    Bf16,
    F16,
    F32,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Self::Bf16 => DType::BF16,
            Self::F16 => DType::F16,
            Self::F32 => DType::F32,
        }
    }
}

/// Lowest precision the accelerator handles well; the CPU gets full precision.
pub fn precision_for(accelerator: Accelerator, bf16_supported: bool) -> Precision {
    match accelerator {
        Accelerator::Cuda if bf16_supported => Precision::Bf16,
        Accelerator::Cuda | Accelerator::Metal => Precision::F16,
        Accelerator::Cpu => Precision::F32,
    }
}

/// Device and precision for the lifetime of the process.
///
/// Built once by [`SessionConfig::resolve`] and handed out by clone; there are
/// no setters.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    device: Device,
    precision: Precision,
}

impl SessionConfig {
    pub fn resolve(device_map: DeviceMap) -> Self {
        let device = select_best_device(device_map);
        let accelerator = accelerator_of(&device);
        let bf16 = accelerator == Accelerator::Cuda && supports_bf16(&device);
        let precision = precision_for(accelerator, bf16);
        info!(?accelerator, ?precision, "resolved session device");
        Self { device, precision }
    }

    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            precision: Precision::F32,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn dtype(&self) -> DType {
        self.precision.dtype()
    }

    pub fn accelerator(&self) -> Accelerator {
        accelerator_of(&self.device)
    }
}

fn accelerator_of(device: &Device) -> Accelerator {
    if device.is_cuda() {
        Accelerator::Cuda
    } else if device.is_metal() {
        Accelerator::Metal
    } else {
        Accelerator::Cpu
    }
}

fn select_best_device(device_map: DeviceMap) -> Device {
    let ordinal = match device_map {
        DeviceMap::ForceCpu => return Device::Cpu,
        DeviceMap::Ordinal(ordinal) => ordinal,
    };
    let accelerated = if cuda_is_available() {
        Some(Device::new_cuda(ordinal))
    } else if metal_is_available() {
        Some(Device::new_metal(ordinal))
    } else {
        None
    };
    match accelerated {
        Some(Ok(device)) => device,
        Some(Err(err)) => {
            warn!(ordinal, error = %err, "accelerator present but unusable, running on CPU");
            Device::Cpu
        }
        None => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            Device::Cpu
        }
    }
}

// Older CUDA architectures allocate BF16 fine but reject BF16 GEMMs.
fn supports_bf16(device: &Device) -> bool {
    Tensor::ones((2, 2), DType::BF16, device)
        .and_then(|t| t.matmul(&t))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_policy_prefers_lowest_supported_mode() {
        assert_eq!(precision_for(Accelerator::Cuda, true), Precision::Bf16);
        assert_eq!(precision_for(Accelerator::Cuda, false), Precision::F16);
        assert_eq!(precision_for(Accelerator::Metal, true), Precision::F16);
        assert_eq!(precision_for(Accelerator::Cpu, true), Precision::F32);
    }

    #[test]
    fn forced_cpu_resolves_to_full_precision() {
        let session = SessionConfig::resolve(DeviceMap::ForceCpu);
        assert_eq!(session.accelerator(), Accelerator::Cpu);
        assert_eq!(session.dtype(), DType::F32);
    }
}
