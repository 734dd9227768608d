use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use api_types::NodeInventory;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::build_inventory;
use super::DeviceCache;

/// Periodically enumerates local devices and reports model-set changes.
pub struct InventoryScanner {
    cache: Arc<DeviceCache>,
    interval: Duration,
    last_models: Option<BTreeMap<String, BTreeSet<String>>>,
}

impl InventoryScanner {
    pub fn new(cache: Arc<DeviceCache>, interval: Duration) -> Self {
        Self {
            cache,
            interval,
            last_models: None,
        }
    }

    /// Runs one discovery round.
    ///
    /// Returns the new inventory only when its model grouping differs from
    /// the previous successful round. An enumeration failure aborts the round
    /// and reinitializes the library handle for the next one.
    ///
    /// Calls into the accelerator library block, see [`InventoryScanner::run`].
    pub fn scan_once(&mut self) -> Option<NodeInventory> {
        let query = self.cache.query();

        let count = match query.device_count() {
            Ok(count) => count,
            Err(e) => {
                warn!("failed to count devices, reinitializing: {e:?}");
                self.reinitialize();
                return None;
            }
        };

        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device_id = match query.uuid_by_index(index) {
                Ok(id) => id,
                Err(e) => {
                    warn!(index, "failed to get device by index, reinitializing: {e:?}");
                    self.reinitialize();
                    return None;
                }
            };
            // an unresolved device has no model, it rejoins once a later round resolves it
            match self.cache.resolve(&device_id) {
                Ok(device) => devices.push(device),
                Err(e) => warn!(%device_id, "leaving unresolved device out of the inventory: {e:?}"),
            }
        }

        let inventory = build_inventory(self.cache.node_name(), devices);
        if self.last_models.as_ref() == Some(&inventory.models) {
            return None;
        }

        info!(
            node_name = %inventory.node_name,
            models = ?inventory.models,
            "device model set changed"
        );
        self.last_models = Some(inventory.models.clone());
        Some(inventory)
    }

    fn reinitialize(&self) {
        if let Err(e) = self.cache.query().reinitialize() {
            warn!("failed to reinitialize accelerator library: {e:?}");
        }
    }

    /// Scans on every tick until cancelled. Each round runs on the blocking
    /// pool since NVML calls can stall on a wedged driver.
    #[tracing::instrument(skip_all)]
    pub async fn run(
        self,
        updates: mpsc::Sender<NodeInventory>,
        cancellation_token: CancellationToken,
    ) {
        info!(node_name = %self.cache.node_name(), "Starting inventory scanner");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut scanner = self;

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Inventory scanner shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    let round = tokio::task::spawn_blocking(move || {
                        let inventory = scanner.scan_once();
                        (scanner, inventory)
                    })
                    .await;
                    let inventory = match round {
                        Ok((returned, inventory)) => {
                            scanner = returned;
                            inventory
                        }
                        Err(e) => {
                            error!("inventory scan round panicked, stopping scanner: {e}");
                            break;
                        }
                    };
                    if let Some(inventory) = inventory {
                        if updates.send(inventory).await.is_err() {
                            warn!("inventory receiver closed, stopping scanner");
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use similar_asserts::assert_eq;

    use super::super::cache::tests::FakeDevices;
    use super::*;

    fn scanner(fake: Arc<FakeDevices>) -> InventoryScanner {
        let cache = Arc::new(DeviceCache::new("n1", Duration::from_secs(60), fake));
        InventoryScanner::new(cache, Duration::from_millis(10))
    }

    #[test]
    fn first_round_emits_inventory() {
        let fake = Arc::new(FakeDevices::with(&[("GPU-1", "A100"), ("GPU-2", "a100 ")]));
        let mut scanner = scanner(fake);

        let inventory = scanner.scan_once().expect("first round should emit");

        assert_eq!(inventory.devices.len(), 2);
        assert_eq!(
            inventory.models["a100"],
            BTreeSet::from(["GPU-1".to_string(), "GPU-2".to_string()])
        );
    }

    #[test]
    fn unchanged_model_set_is_suppressed() {
        let fake = Arc::new(FakeDevices::with(&[("GPU-1", "A100")]));
        let mut scanner = scanner(fake);

        assert!(scanner.scan_once().is_some());
        assert!(scanner.scan_once().is_none(), "identical round should not emit");
    }

    #[test]
    fn model_set_change_is_emitted() {
        let fake = Arc::new(FakeDevices::with(&[("GPU-1", "A100")]));
        let mut scanner = scanner(fake.clone());
        scanner.scan_once();

        fake.set(&[("GPU-1", "A100"), ("GPU-2", "Tesla T4")]);
        let inventory = scanner.scan_once().expect("new device should emit");

        assert_eq!(inventory.models.len(), 2);
    }

    #[test]
    fn enumeration_failure_aborts_round_and_reinitializes() {
        let fake = Arc::new(FakeDevices::with(&[("GPU-1", "A100")]));
        *fake.fail_enumeration.lock().unwrap() = true;
        let mut scanner = scanner(fake.clone());

        assert!(scanner.scan_once().is_none(), "failed round should not emit");
        assert_eq!(fake.reinit_calls.load(Ordering::SeqCst), 1);

        assert!(
            scanner.scan_once().is_some(),
            "round after reinit should emit the inventory"
        );
    }

    #[test]
    fn unresolved_device_is_left_out_of_the_model_index() {
        let fake = Arc::new(FakeDevices::with(&[("GPU-1", "A100"), ("GPU-2", "A100")]));
        fake.fail_describe.lock().unwrap().push("GPU-2".to_string());
        let mut scanner = scanner(fake.clone());

        let inventory = scanner.scan_once().expect("first round should emit");

        assert_eq!(inventory.devices.keys().map(String::as_str).collect::<Vec<_>>(), vec!["GPU-1"]);
        assert_eq!(
            inventory.models,
            BTreeMap::from([("a100".to_string(), BTreeSet::from(["GPU-1".to_string()]))])
        );
        assert!(!inventory.models.contains_key(""), "no empty model group");

        fake.fail_describe.lock().unwrap().clear();
        let recovered = scanner
            .scan_once()
            .expect("resolving the device later changes the model set");
        assert_eq!(recovered.models["a100"].len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn run_publishes_until_cancelled() {
        let fake = Arc::new(FakeDevices::with(&[("GPU-1", "A100")]));
        let scanner = scanner(fake);
        let (tx, mut rx) = mpsc::channel(4);
        let token = CancellationToken::new();

        let handle = tokio::spawn(scanner.run(tx, token.clone()));
        let inventory = rx.recv().await.expect("scanner should publish");
        token.cancel();
        handle.await.unwrap();

        assert_eq!(inventory.node_name, "n1");
    }
}
