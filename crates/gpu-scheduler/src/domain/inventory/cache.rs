use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use api_types::GpuDevice;
use error_stack::Report;

use super::DeviceError;
use super::DeviceQuery;

#[derive(Debug, Clone)]
struct CachedDevice {
    device: GpuDevice,
    observed_at: Instant,
}

/// TTL cache of resolved device metadata.
///
/// Many resolvers may read concurrently; a miss or an expired entry is
/// refreshed from the accelerator library and written back.
pub struct DeviceCache {
    node_name: String,
    ttl: Duration,
    query: Arc<dyn DeviceQuery>,
    entries: RwLock<HashMap<String, CachedDevice>>,
}

impl DeviceCache {
    pub fn new(node_name: impl Into<String>, ttl: Duration, query: Arc<dyn DeviceQuery>) -> Self {
        Self {
            node_name: node_name.into(),
            ttl,
            query,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub(crate) fn query(&self) -> &Arc<dyn DeviceQuery> {
        &self.query
    }

    /// Resolves `device_id` into its metadata.
    ///
    /// On failure the caller may fall back to [`GpuDevice::unresolved`], the
    /// failed lookup is not cached.
    pub fn resolve(&self, device_id: &str) -> Result<GpuDevice, Report<DeviceError>> {
        if let Some(device) = self.cached(device_id) {
            return Ok(device);
        }

        let description = self.query.describe(device_id)?;
        let device = GpuDevice {
            device_id: device_id.to_string(),
            brand: description.brand,
            model: description.model,
            bus_id: description.bus_id,
            node_name: self.node_name.clone(),
        };

        match self.entries.write() {
            Ok(mut entries) => {
                entries.insert(
                    device_id.to_string(),
                    CachedDevice {
                        device: device.clone(),
                        observed_at: Instant::now(),
                    },
                );
            }
            Err(e) => tracing::error!("device cache lock poisoned: {e}"),
        }

        tracing::debug!(device_id, model = %device.model, "refreshed device metadata");
        Ok(device)
    }

    /// Like [`DeviceCache::resolve`] but logs the failure and returns a
    /// record carrying only the id and node.
    pub fn resolve_lossy(&self, device_id: &str) -> GpuDevice {
        self.resolve(device_id).unwrap_or_else(|e| {
            tracing::warn!(device_id, "failed to resolve device: {e:?}");
            GpuDevice::unresolved(device_id, &self.node_name)
        })
    }

    fn cached(&self, device_id: &str) -> Option<GpuDevice> {
        let entries = self.entries.read().ok()?;
        entries
            .get(device_id)
            .filter(|entry| entry.observed_at.elapsed() < self.ttl)
            .map(|entry| entry.device.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use similar_asserts::assert_eq;

    use super::super::DeviceDescription;
    use super::*;

    /// In-memory accelerator library.
    #[derive(Default)]
    pub(crate) struct FakeDevices {
        pub devices: Mutex<Vec<(String, DeviceDescription)>>,
        pub describe_calls: AtomicUsize,
        pub reinit_calls: AtomicUsize,
        pub fail_enumeration: Mutex<bool>,
        /// Ids whose description query fails.
        pub fail_describe: Mutex<Vec<String>>,
    }

    impl FakeDevices {
        pub(crate) fn with(devices: &[(&str, &str)]) -> Self {
            let fake = Self::default();
            fake.set(devices);
            fake
        }

        pub(crate) fn set(&self, devices: &[(&str, &str)]) {
            *self.devices.lock().unwrap() = devices
                .iter()
                .enumerate()
                .map(|(i, (id, model))| {
                    (
                        id.to_string(),
                        DeviceDescription {
                            brand: "BRAND_TESLA".to_string(),
                            model: model.to_string(),
                            bus_id: format!("00000000:{i:02}:00.0"),
                        },
                    )
                })
                .collect();
        }
    }

    impl DeviceQuery for FakeDevices {
        fn device_count(&self) -> Result<u32, Report<DeviceError>> {
            Ok(self.devices.lock().unwrap().len() as u32)
        }

        fn uuid_by_index(&self, index: u32) -> Result<String, Report<DeviceError>> {
            if *self.fail_enumeration.lock().unwrap() {
                return Err(Report::new(DeviceError::EnumerationFailed {
                    message: "handle lost".to_string(),
                }));
            }
            self.devices
                .lock()
                .unwrap()
                .get(index as usize)
                .map(|(id, _)| id.clone())
                .ok_or_else(|| {
                    Report::new(DeviceError::EnumerationFailed {
                        message: format!("no device at index {index}"),
                    })
                })
        }

        fn describe(&self, device_id: &str) -> Result<DeviceDescription, Report<DeviceError>> {
            self.describe_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_describe.lock().unwrap().iter().any(|id| id == device_id) {
                return Err(Report::new(DeviceError::QueryFailed {
                    device_id: device_id.to_string(),
                    message: "invalid handle".to_string(),
                }));
            }
            self.devices
                .lock()
                .unwrap()
                .iter()
                .find(|(id, _)| id == device_id)
                .map(|(_, description)| description.clone())
                .ok_or_else(|| {
                    Report::new(DeviceError::QueryFailed {
                        device_id: device_id.to_string(),
                        message: "invalid handle".to_string(),
                    })
                })
        }

        fn reinitialize(&self) -> Result<(), Report<DeviceError>> {
            self.reinit_calls.fetch_add(1, Ordering::SeqCst);
            *self.fail_enumeration.lock().unwrap() = false;
            Ok(())
        }
    }

    #[test]
    fn second_resolution_within_ttl_skips_native_query() {
        let fake = Arc::new(FakeDevices::with(&[("GPU-1", "Tesla T4")]));
        let cache = DeviceCache::new("n1", Duration::from_secs(60), fake.clone());

        let first = cache.resolve("GPU-1").unwrap();
        let second = cache.resolve("GPU-1").unwrap();

        assert_eq!(first, second);
        assert_eq!(fake.describe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.node_name, "n1");
        assert_eq!(first.model, "Tesla T4");
    }

    #[test]
    fn expired_entry_is_queried_again() {
        let fake = Arc::new(FakeDevices::with(&[("GPU-1", "Tesla T4")]));
        let cache = DeviceCache::new("n1", Duration::ZERO, fake.clone());

        cache.resolve("GPU-1").unwrap();
        cache.resolve("GPU-1").unwrap();

        assert_eq!(fake.describe_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_resolution_returns_partial_record_and_is_not_cached() {
        let fake = Arc::new(FakeDevices::with(&[]));
        let cache = DeviceCache::new("n1", Duration::from_secs(60), fake.clone());

        assert!(cache.resolve("GPU-missing").is_err(), "unknown device should fail");
        let partial = cache.resolve_lossy("GPU-missing");

        assert_eq!(partial, GpuDevice::unresolved("GPU-missing", "n1"));
        assert_eq!(fake.describe_calls.load(Ordering::SeqCst), 2);
    }
}
