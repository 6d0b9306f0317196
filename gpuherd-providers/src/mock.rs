use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::{inventory, CloudProvider};

/// In-memory provider for tests: a scripted fleet, scripted utilization, and
/// a record of every terminate request the engine issued.
#[derive(Default)]
pub struct MockProvider {
    fleet: Mutex<Vec<inventory::DiscoveredInstance>>,
    utilization: Mutex<HashMap<String, Vec<i64>>>,
    offerings: Mutex<Vec<inventory::TypeOffering>>,
    utilization_failures: Mutex<HashSet<String>>,
    listing_down: Mutex<bool>,
    reject_terminations: Mutex<bool>,
    terminated: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_instance(&self, instance: inventory::DiscoveredInstance) {
        self.fleet.lock().unwrap().push(instance);
    }

    pub fn remove_instance(&self, id: &str) {
        self.fleet.lock().unwrap().retain(|i| i.id != id);
    }

    pub fn set_utilization(&self, id: &str, per_gpu: Vec<i64>) {
        self.utilization
            .lock()
            .unwrap()
            .insert(id.to_string(), per_gpu);
    }

    /// Make utilization reads for one instance fail, as a downed probe would.
    pub fn fail_utilization_for(&self, id: &str) {
        self.utilization_failures
            .lock()
            .unwrap()
            .insert(id.to_string());
    }

    /// Make `list_instances` fail entirely (provider outage).
    pub fn set_listing_down(&self, down: bool) {
        *self.listing_down.lock().unwrap() = down;
    }

    /// Make the provider accept terminate calls but terminate nothing.
    pub fn set_reject_terminations(&self, reject: bool) {
        *self.reject_terminations.lock().unwrap() = reject;
    }

    pub fn set_offerings(&self, offerings: Vec<inventory::TypeOffering>) {
        *self.offerings.lock().unwrap() = offerings;
    }

    pub fn terminated_ids(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn list_instances(&self) -> Result<Vec<inventory::DiscoveredInstance>> {
        if *self.listing_down.lock().unwrap() {
            anyhow::bail!("mock provider listing is down");
        }
        Ok(self.fleet.lock().unwrap().clone())
    }

    async fn list_instance_types(&self) -> Result<Vec<inventory::TypeOffering>> {
        Ok(self.offerings.lock().unwrap().clone())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<Vec<String>> {
        self.terminated
            .lock()
            .unwrap()
            .extend(instance_ids.iter().cloned());

        if *self.reject_terminations.lock().unwrap() {
            return Ok(vec![]);
        }

        self.fleet
            .lock()
            .unwrap()
            .retain(|i| !instance_ids.contains(&i.id));
        Ok(instance_ids.to_vec())
    }

    async fn gpu_utilization(&self, instance: &inventory::DiscoveredInstance) -> Result<Vec<i64>> {
        if self
            .utilization_failures
            .lock()
            .unwrap()
            .contains(&instance.id)
        {
            anyhow::bail!("mock utilization probe failed for {}", instance.id);
        }
        Ok(self
            .utilization
            .lock()
            .unwrap()
            .get(&instance.id)
            .cloned()
            .unwrap_or_else(|| vec![0; instance.gpu_count.max(1) as usize]))
    }
}
