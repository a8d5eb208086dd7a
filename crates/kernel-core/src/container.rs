//! Storage blocks with an inventory, an escrow reservation table and items owed
//! to agents that were offline when a payout happened.

use std::collections::BTreeMap;

use contracts::ItemStack;
use serde::{Deserialize, Serialize};

use crate::spatial::{positional_id, Vec3i};

/// Block types that carry a container when placed.
pub const CONTAINER_BLOCKS: [&str; 3] = ["CHEST", "FURNACE", "CONTRACT_TERMINAL"];

pub fn is_container_block(name: &str) -> bool {
    CONTAINER_BLOCKS.contains(&name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub kind: String,
    pub pos: Vec3i,
    #[serde(default)]
    pub inventory: BTreeMap<String, i32>,
    #[serde(default)]
    pub reserved: BTreeMap<String, i32>,
    #[serde(default)]
    pub owed: BTreeMap<String, BTreeMap<String, i32>>,
}

impl Container {
    pub fn new(kind: impl Into<String>, pos: Vec3i) -> Self {
        Self {
            kind: kind.into(),
            pos,
            ..Self::default()
        }
    }

    pub fn id(&self) -> String {
        positional_id(&self.kind, self.pos)
    }

    pub fn count(&self, item: &str) -> i32 {
        self.inventory.get(item).copied().unwrap_or(0)
    }

    pub fn reserved_count(&self, item: &str) -> i32 {
        self.reserved.get(item).copied().unwrap_or(0)
    }

    /// Inventory not held in escrow.
    pub fn available(&self, item: &str) -> i32 {
        self.count(item) - self.reserved_count(item)
    }

    pub fn has_available(&self, req: &BTreeMap<String, i32>) -> bool {
        req.iter().all(|(item, n)| self.available(item) >= *n)
    }

    pub fn add(&mut self, item: &str, n: i32) {
        if n == 0 || item.is_empty() {
            return;
        }
        let entry = self.inventory.entry(item.to_string()).or_insert(0);
        *entry += n;
        if *entry <= 0 {
            self.inventory.remove(item);
        }
    }

    /// Removes unreserved stock only.
    pub fn take_available(&mut self, item: &str, n: i32) -> bool {
        if n <= 0 || self.available(item) < n {
            return false;
        }
        self.add(item, -n);
        true
    }

    pub fn reserve(&mut self, item: &str, n: i32) {
        if n <= 0 {
            return;
        }
        *self.reserved.entry(item.to_string()).or_insert(0) += n;
    }

    pub fn unreserve(&mut self, item: &str, n: i32) {
        if n <= 0 {
            return;
        }
        if let Some(entry) = self.reserved.get_mut(item) {
            *entry -= n;
            if *entry <= 0 {
                self.reserved.remove(item);
            }
        }
    }

    /// Releases escrow and removes the stock in one step.
    pub fn release_reserved(&mut self, item: &str, n: i32) {
        self.unreserve(item, n);
        self.add(item, -n);
    }

    pub fn add_owed(&mut self, agent_id: &str, item: &str, n: i32) {
        if n <= 0 {
            return;
        }
        *self
            .owed
            .entry(agent_id.to_string())
            .or_default()
            .entry(item.to_string())
            .or_insert(0) += n;
    }

    pub fn claim_owed(&mut self, agent_id: &str) -> BTreeMap<String, i32> {
        self.owed.remove(agent_id).unwrap_or_default()
    }

    pub fn inventory_list(&self) -> Vec<ItemStack> {
        self.inventory
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(item, n)| ItemStack {
                item: item.clone(),
                count: *n,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inventory.values().all(|n| *n <= 0) && self.owed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn reserved_stock_is_not_available() {
        let mut chest = Container::new("CHEST", Vec3i::new(1, 0, 2));
        assert_eq!(chest.id(), "CHEST@1,0,2");
        chest.add("COAL", 5);
        chest.reserve("COAL", 3);
        assert_eq!(chest.available("COAL"), 2);
        assert!(!chest.take_available("COAL", 3));
        assert!(chest.take_available("COAL", 2));
        chest.release_reserved("COAL", 3);
        assert_eq!(chest.count("COAL"), 0);
        assert!(chest.reserved.is_empty());
    }

    #[test]
    fn owed_items_are_claimed_once() {
        let mut terminal = Container::new("CONTRACT_TERMINAL", Vec3i::default());
        terminal.add_owed("A1", "PLANK", 2);
        terminal.add_owed("A1", "PLANK", 1);
        assert_eq!(terminal.claim_owed("A1").get("PLANK"), Some(&3));
        assert!(terminal.claim_owed("A1").is_empty());
    }

    proptest! {
        #[test]
        fn escrow_never_exceeds_inventory(ops in prop::collection::vec((0u8..4, 1i32..5), 1..40)) {
            let mut chest = Container::new("CHEST", Vec3i::default());
            for (op, n) in ops {
                match op {
                    0 => chest.add("IRON_INGOT", n),
                    1 => { chest.take_available("IRON_INGOT", n); }
                    2 => if chest.available("IRON_INGOT") >= n { chest.reserve("IRON_INGOT", n) },
                    _ => {
                        let held = chest.reserved_count("IRON_INGOT").min(n);
                        chest.release_reserved("IRON_INGOT", held);
                    }
                }
                prop_assert!(chest.count("IRON_INGOT") >= chest.reserved_count("IRON_INGOT"));
                prop_assert!(chest.reserved_count("IRON_INGOT") >= 0);
            }
        }
    }
}
