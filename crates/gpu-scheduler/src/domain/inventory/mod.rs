//! Device inventory discovery.
//!
//! [`DeviceCache`] resolves device ids into [`GpuDevice`] metadata with a TTL,
//! [`InventoryScanner`] enumerates local devices periodically and emits a
//! [`NodeInventory`] whenever the model grouping changes.

pub(crate) mod cache;
mod scanner;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use api_types::GpuDevice;
use api_types::NodeInventory;
use error_stack::Report;

pub use cache::DeviceCache;
pub use scanner::InventoryScanner;

/// Errors raised while querying the accelerator library.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("accelerator library is not available: {message}")]
    LibraryUnavailable { message: String },
    #[error("failed to enumerate devices: {message}")]
    EnumerationFailed { message: String },
    #[error("failed to query device {device_id}: {message}")]
    QueryFailed { device_id: String, message: String },
}

/// Native metadata of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub brand: String,
    pub model: String,
    pub bus_id: String,
}

/// Access to the accelerator library.
pub trait DeviceQuery: Send + Sync {
    fn device_count(&self) -> Result<u32, Report<DeviceError>>;

    fn uuid_by_index(&self, index: u32) -> Result<String, Report<DeviceError>>;

    fn describe(&self, device_id: &str) -> Result<DeviceDescription, Report<DeviceError>>;

    /// Drops and recreates the library handle.
    fn reinitialize(&self) -> Result<(), Report<DeviceError>>;
}

/// Lowercases and trims a model name so that annotation values and driver
/// names compare equal.
pub fn normalize_model(model: &str) -> String {
    model.trim().to_lowercase()
}

/// Groups devices by normalized model.
pub fn build_model_index<'a>(
    devices: impl IntoIterator<Item = &'a GpuDevice>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut index: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for device in devices {
        index
            .entry(normalize_model(&device.model))
            .or_default()
            .insert(device.device_id.clone());
    }
    index
}

/// Builds a full inventory for `node_name` out of resolved devices.
pub fn build_inventory(node_name: &str, devices: Vec<GpuDevice>) -> NodeInventory {
    let models = build_model_index(&devices);
    NodeInventory {
        node_name: node_name.to_string(),
        devices: devices
            .into_iter()
            .map(|d| (d.device_id.clone(), d))
            .collect(),
        models,
        report_time: None,
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn device(id: &str, model: &str) -> GpuDevice {
        GpuDevice {
            device_id: id.to_string(),
            model: model.to_string(),
            node_name: "n1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn normalize_model_lowercases_and_trims() {
        assert_eq!(normalize_model("  NVIDIA A100-SXM4-80GB \n"), "nvidia a100-sxm4-80gb");
    }

    #[test]
    fn model_index_groups_devices_by_normalized_model() {
        let devices = vec![
            device("d1", "Tesla T4"),
            device("d2", " tesla t4"),
            device("d3", "A100"),
        ];

        let index = build_model_index(&devices);

        assert_eq!(index.len(), 2);
        assert_eq!(
            index["tesla t4"],
            BTreeSet::from(["d1".to_string(), "d2".to_string()])
        );
        assert_eq!(index["a100"], BTreeSet::from(["d3".to_string()]));
    }

    #[test]
    fn build_inventory_keys_devices_by_id() {
        let inventory = build_inventory("n1", vec![device("d1", "A100")]);

        assert_eq!(inventory.node_name, "n1");
        assert_eq!(inventory.devices["d1"].model, "A100");
        assert!(inventory.report_time.is_none());
    }
}
