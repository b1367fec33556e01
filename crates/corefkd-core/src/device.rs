use std::str::FromStr;

use candle_core::Device;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};

/// A requested compute device, as written on the command line.
///
/// Accepts `cpu`, `cuda`, `cuda:N`, `gpu` (alias for `cuda:0`) and `metal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal,
}

impl FromStr for DeviceSpec {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            "metal" | "mps" => Ok(Self::Metal),
            other => {
                let id = other
                    .strip_prefix("cuda:")
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or_else(|| CoreError::DeviceUnavailable(format!(
                        "unrecognised device '{s}', expected cpu, cuda, cuda:N or metal"
                    )))?;
                Ok(Self::Cuda(id))
            }
        }
    }
}

/// Selects the best available compute device.
///
/// With `prefer_gpu`, tries CUDA device `cuda_device_id` and then Metal,
/// whichever backends were compiled in. Falls back to CPU on any error.
pub fn select_device(prefer_gpu: bool, cuda_device_id: usize) -> CoreResult<Device> {
    if !prefer_gpu {
        info!("Using CPU device");
        return Ok(Device::Cpu);
    }
    let device = try_cuda(cuda_device_id).or_else(try_metal);
    Ok(device.unwrap_or_else(|| cpu_fallback("an accelerator")))
}

/// Resolve a [`DeviceSpec`] to a concrete device, falling back to CPU.
///
/// Unlike [`select_device`], only the backend named by the variant is tried:
/// `metal` never lands on CUDA and `cuda:N` never lands on Metal.
pub fn select_device_spec(spec: DeviceSpec) -> CoreResult<Device> {
    let device = match spec {
        DeviceSpec::Cpu => None,
        DeviceSpec::Cuda(id) => try_cuda(id).or_else(|| Some(cpu_fallback("CUDA"))),
        DeviceSpec::Metal => try_metal().or_else(|| Some(cpu_fallback("Metal"))),
    };
    Ok(device.unwrap_or_else(|| {
        info!("Using CPU device");
        Device::Cpu
    }))
}

#[cfg(feature = "cuda")]
fn try_cuda(cuda_device_id: usize) -> Option<Device> {
    match Device::new_cuda(cuda_device_id) {
        Ok(dev) => {
            info!(cuda_device_id, "Using CUDA device");
            Some(dev)
        }
        Err(e) => {
            warn!(cuda_device_id, error = %e, "CUDA unavailable");
            None
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn try_cuda(cuda_device_id: usize) -> Option<Device> {
    debug!(cuda_device_id, "Built without the `cuda` feature");
    None
}

#[cfg(feature = "metal")]
fn try_metal() -> Option<Device> {
    match Device::new_metal(0) {
        Ok(dev) => {
            info!("Using Metal device");
            Some(dev)
        }
        Err(e) => {
            warn!(error = %e, "Metal unavailable");
            None
        }
    }
}

#[cfg(not(feature = "metal"))]
fn try_metal() -> Option<Device> {
    debug!("Built without the `metal` feature");
    None
}

fn cpu_fallback(requested: &str) -> Device {
    if cfg!(any(feature = "cuda", feature = "metal")) {
        warn!(requested, "Falling back to CPU");
    } else {
        warn!(
            requested,
            "--device requested an accelerator but this binary was not compiled with GPU support. \
             Rebuild with `cargo install --path crates/corefkd-cli --features cuda`."
        );
    }
    info!("Using CPU device");
    Device::Cpu
}

/// Seed the device RNG used by random tensor initialisation.
///
/// Accelerator backends accept a seed; the CPU backend does not, in which case
/// this is a no-op and host-side RNGs carry determinism.
pub fn seed_device(device: &Device, seed: u64) {
    match device.set_seed(seed) {
        Ok(()) => debug!(seed, device = device_name(device), "Device RNG seeded"),
        Err(e) => debug!(seed, device = device_name(device), error = %e, "Device RNG not seedable"),
    }
}

/// Returns a human-readable description of a device.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_device_no_gpu_returns_cpu() {
        let device = select_device(false, 0).unwrap();
        assert!(
            matches!(device, Device::Cpu),
            "prefer_gpu=false must always return CPU"
        );
    }

    #[test]
    fn test_select_device_gpu_false_when_no_cuda_feature() {
        #[cfg(not(any(feature = "cuda", feature = "metal")))]
        {
            let device = select_device(true, 0).unwrap();
            assert!(matches!(device, Device::Cpu));
        }
    }

    #[test]
    fn test_device_name_cpu() {
        assert_eq!(device_name(&Device::Cpu), "CPU");
    }

    #[test]
    fn test_parse_device_specs() {
        assert_eq!("cpu".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cpu);
        assert_eq!("CUDA".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cuda(0));
        assert_eq!("cuda:3".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cuda(3));
        assert_eq!("metal".parse::<DeviceSpec>().unwrap(), DeviceSpec::Metal);
        assert!("tpu".parse::<DeviceSpec>().is_err());
        assert!("cuda:x".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn test_cpu_spec_selects_cpu() {
        let device = select_device_spec(DeviceSpec::Cpu).unwrap();
        assert!(matches!(device, Device::Cpu));
    }

    #[test]
    fn test_accelerator_specs_fall_back_to_cpu_without_features() {
        #[cfg(not(feature = "cuda"))]
        assert!(matches!(
            select_device_spec(DeviceSpec::Cuda(1)).unwrap(),
            Device::Cpu
        ));
        #[cfg(not(feature = "metal"))]
        assert!(matches!(
            select_device_spec(DeviceSpec::Metal).unwrap(),
            Device::Cpu
        ));
    }

    #[test]
    fn test_metal_spec_does_not_try_cuda() {
        // Without the metal feature a metal request must end on CPU even if
        // a CUDA device happens to be available.
        #[cfg(not(feature = "metal"))]
        assert!(!matches!(
            select_device_spec(DeviceSpec::Metal).unwrap(),
            Device::Cuda(_)
        ));
    }

    #[test]
    fn test_seed_cpu_device_is_noop() {
        // Must not panic even though the CPU backend rejects seeding.
        seed_device(&Device::Cpu, 42);
    }
}
