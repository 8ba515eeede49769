//! Slot ownership routing and the atomic ownership flip.
//!
//! Topology discovery and gossip live outside this crate; the router only
//! tracks which node owns each of the 16384 slots, answers routing checks
//! for the frontend, and performs the single mutation the migration core
//! needs: atomically reassigning one slot to the destination node after a
//! successful migration.

use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::slot::{SlotId, HASH_SLOTS, MAX_SLOT};

/// Owner record for one slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotOwner {
    pub node_id: String,
    /// `host:port` answered in MOVED redirects.
    pub endpoint: String,
}

pub struct ClusterRouter {
    my_node_id: String,
    owners: RwLock<Vec<Arc<SlotOwner>>>,
}

impl ClusterRouter {
    pub fn new(my_node_id: impl Into<String>, my_endpoint: impl Into<String>) -> Self {
        let my_node_id = my_node_id.into();
        let me = Arc::new(SlotOwner {
            node_id: my_node_id.clone(),
            endpoint: my_endpoint.into(),
        });
        Self {
            my_node_id,
            owners: RwLock::new(vec![me; usize::from(HASH_SLOTS)]),
        }
    }

    pub fn my_node_id(&self) -> &str {
        &self.my_node_id
    }

    pub fn owns_slot(&self, slot: SlotId) -> bool {
        let owners = self.owners.read().expect("router lock poisoned");
        owners[usize::from(slot)].node_id == self.my_node_id
    }

    pub fn owner(&self, slot: SlotId) -> Arc<SlotOwner> {
        let owners = self.owners.read().expect("router lock poisoned");
        Arc::clone(&owners[usize::from(slot)])
    }

    /// Atomically flips ownership of `slot` to the destination node.
    /// Observable to routing checks only once this returns.
    pub fn set_slot_migrated(
        &self,
        slot: SlotId,
        node_id: &str,
        endpoint: &str,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(slot <= MAX_SLOT, "slot {slot} out of range");
        anyhow::ensure!(!node_id.is_empty(), "destination node id is empty");
        anyhow::ensure!(
            endpoint.contains(':'),
            "destination endpoint {endpoint:?} is not host:port"
        );
        let mut owners = self.owners.write().expect("router lock poisoned");
        owners[usize::from(slot)] = Arc::new(SlotOwner {
            node_id: node_id.to_string(),
            endpoint: endpoint.to_string(),
        });
        Ok(())
    }

    /// JSON dump of the local ownership view.
    pub fn state_json(&self) -> anyhow::Result<String> {
        let owners = self.owners.read().expect("router lock poisoned");
        let mut owned_ranges: Vec<SlotRangeDump> = Vec::new();
        let mut owned_slots = 0usize;
        for (slot, owner) in owners.iter().enumerate() {
            if owner.node_id != self.my_node_id {
                continue;
            }
            owned_slots += 1;
            let slot = slot as u16;
            match owned_ranges.last_mut() {
                Some(range) if range.end + 1 == slot => range.end = slot,
                _ => owned_ranges.push(SlotRangeDump {
                    start: slot,
                    end: slot,
                }),
            }
        }
        let dump = ClusterStateDump {
            node_id: &self.my_node_id,
            owned_slots,
            owned_ranges,
        };
        Ok(serde_json::to_string(&dump)?)
    }
}

#[derive(Serialize)]
struct ClusterStateDump<'a> {
    node_id: &'a str,
    owned_slots: usize,
    owned_ranges: Vec<SlotRangeDump>,
}

#[derive(Serialize)]
struct SlotRangeDump {
    start: u16,
    end: u16,
}

/// MOVED redirect line for a slot owned elsewhere.
pub fn format_moved(slot: SlotId, endpoint: &str) -> String {
    format!("MOVED {slot} {endpoint}")
}
