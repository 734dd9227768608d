use std::sync::RwLock;

use error_stack::Report;
use nvml_wrapper::Nvml;
use tracing::info;
use tracing::warn;

use crate::domain::inventory::DeviceDescription;
use crate::domain::inventory::DeviceError;
use crate::domain::inventory::DeviceQuery;

/// NVML backed device enumeration.
///
/// The handle sits behind a lock so it can be swapped out when a scan round
/// fails and the library has to be reinitialized.
pub struct NvmlDevices {
    nvml: RwLock<Nvml>,
}

fn init_nvml() -> Result<Nvml, Report<DeviceError>> {
    match Nvml::init() {
        Ok(nvml) => {
            info!("NVML initialized successfully");
            Ok(nvml)
        }
        Err(_) => {
            warn!("Standard NVML init failed, trying with explicit library path");
            let nvml = Nvml::builder()
                .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                .init()
                .map_err(|e| DeviceError::LibraryUnavailable {
                    message: e.to_string(),
                })?;
            info!("NVML initialized with explicit library path");
            Ok(nvml)
        }
    }
}

/// Maps the NVML brand variant name to the driver's `BRAND_*` constant.
fn brand_label(variant: &str) -> String {
    let label = match variant {
        "Unknown" => "BRAND_UNKNOWN",
        "Quadro" => "BRAND_QUADRO",
        "Tesla" => "BRAND_TESLA",
        "NVS" => "BRAND_NVS",
        "GRID" => "BRAND_GRID",
        "GeForce" => "BRAND_GEFORCE",
        "Titan" => "BRAND_TITAN",
        "VApps" => "BRAND_NVIDIA_VAPPS",
        "VPC" => "BRAND_NVIDIA_VPC",
        "VCS" => "BRAND_NVIDIA_VCS",
        "VWS" => "BRAND_NVIDIA_VWS",
        "CloudGaming" => "BRAND_NVIDIA_CLOUD_GAMING",
        "QuadroRTX" => "BRAND_QUADRO_RTX",
        "NvidiaRTX" => "BRAND_NVIDIA_RTX",
        "Nvidia" => "BRAND_NVIDIA",
        "GeForceRTX" => "BRAND_GEFORCE_RTX",
        "TitanRTX" => "BRAND_TITAN_RTX",
        other => return format!("BRAND_{}", other.to_uppercase()),
    };
    label.to_string()
}

fn clean_bus_id(raw: &str) -> String {
    raw.chars().filter(|c| *c != '\0').collect()
}

impl NvmlDevices {
    /// # Errors
    ///
    /// - [`DeviceError::LibraryUnavailable`] if NVML cannot be loaded
    pub fn new() -> Result<Self, Report<DeviceError>> {
        Ok(Self {
            nvml: RwLock::new(init_nvml()?),
        })
    }

    fn with_nvml<T>(
        &self,
        f: impl FnOnce(&Nvml) -> Result<T, Report<DeviceError>>,
    ) -> Result<T, Report<DeviceError>> {
        let nvml = self.nvml.read().map_err(|e| DeviceError::LibraryUnavailable {
            message: format!("NVML lock poisoned: {e}"),
        })?;
        f(&nvml)
    }
}

impl DeviceQuery for NvmlDevices {
    fn device_count(&self) -> Result<u32, Report<DeviceError>> {
        self.with_nvml(|nvml| {
            nvml.device_count()
                .map_err(|e| Report::new(DeviceError::EnumerationFailed {
                    message: e.to_string(),
                }))
        })
    }

    fn uuid_by_index(&self, index: u32) -> Result<String, Report<DeviceError>> {
        self.with_nvml(|nvml| {
            nvml.device_by_index(index)
                .and_then(|device| device.uuid())
                .map_err(|e| Report::new(DeviceError::EnumerationFailed {
                    message: format!("device {index}: {e}"),
                }))
        })
    }

    fn describe(&self, device_id: &str) -> Result<DeviceDescription, Report<DeviceError>> {
        let failed = |e: nvml_wrapper::error::NvmlError| {
            Report::new(DeviceError::QueryFailed {
                device_id: device_id.to_string(),
                message: e.to_string(),
            })
        };

        self.with_nvml(|nvml| {
            let device = nvml.device_by_uuid(device_id).map_err(failed)?;
            let brand = device.brand().map_err(failed)?;
            let model = device.name().map_err(failed)?;
            let pci = device.pci_info().map_err(failed)?;
            Ok(DeviceDescription {
                brand: brand_label(&format!("{brand:?}")),
                model,
                bus_id: clean_bus_id(&pci.bus_id),
            })
        })
    }

    fn reinitialize(&self) -> Result<(), Report<DeviceError>> {
        let fresh = init_nvml()?;
        let mut nvml = self.nvml.write().map_err(|e| DeviceError::LibraryUnavailable {
            message: format!("NVML lock poisoned: {e}"),
        })?;
        *nvml = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn brand_variants_map_to_driver_constants() {
        assert_eq!(brand_label("Tesla"), "BRAND_TESLA");
        assert_eq!(brand_label("CloudGaming"), "BRAND_NVIDIA_CLOUD_GAMING");
        assert_eq!(brand_label("GeForceRTX"), "BRAND_GEFORCE_RTX");
    }

    #[test]
    fn unknown_brand_variant_is_uppercased() {
        assert_eq!(brand_label("Quantum"), "BRAND_QUANTUM");
    }

    #[test]
    fn bus_id_drops_nul_padding() {
        assert_eq!(clean_bus_id("00000000:3B:00.0\0\0\0"), "00000000:3B:00.0");
    }
}
