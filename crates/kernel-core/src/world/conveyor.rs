use std::collections::{BTreeSet, VecDeque};

use super::*;
use crate::spatial::CARDINALS;

/// Upper bound on wire cells visited when tracing a powered network.
const WIRE_SEARCH_BUDGET: usize = 1024;

impl World {
    /// Two deterministic passes: move item entities riding belts, then pull
    /// one unit onto each empty belt from the container behind it.
    pub(super) fn system_conveyors(&mut self, now: u64) {
        if self.conveyors.is_empty() {
            return;
        }
        let Some(conveyor_id) = self.catalogs.block_id("CONVEYOR") else {
            return;
        };

        // -- pass 1: ride ------------------------------------------------------
        let riders = self
            .items
            .values()
            .filter(|e| !e.item.is_empty() && e.count > 0)
            .map(|e| e.entity_id.clone())
            .collect::<Vec<_>>();
        for entity_id in riders {
            let Some(entity) = self.items.get(&entity_id) else {
                continue;
            };
            let from = entity.pos;
            if self.block_id_at(from) != conveyor_id {
                continue;
            }
            let Some(meta) = self.conveyors.get(&from).copied() else {
                continue;
            };
            if (meta.dx == 0 && meta.dz == 0) || !self.conveyor_enabled(from) {
                continue;
            }
            let to = from.offset(i32::from(meta.dx), i32::from(meta.dz));

            if let Some(container) = self.containers.get_mut(&to) {
                let (item, count) = (entity.item.clone(), entity.count);
                container.add(&item, count);
                let details = json!({
                    "entity_id": entity_id,
                    "from": from.to_array(),
                    "container_id": container.id(),
                    "item": item,
                    "count": count,
                });
                self.audit(now, "WORLD", "CONVEYOR_INSERT", to, 0, 0, "CONVEYOR", Some(details));
                self.remove_item_entity(now, "WORLD", &entity_id, "CONVEYOR_INSERT");
                continue;
            }

            let ahead = self.block_id_at(to);
            if self.catalogs.is_solid(ahead) && ahead != conveyor_id {
                continue;
            }
            self.move_item_entity(now, &entity_id, to, "CONVEYOR_MOVE");
        }

        // -- pass 2: pull ------------------------------------------------------
        let belts = self
            .conveyors
            .iter()
            .filter(|(pos, _)| self.block_id_at(**pos) == conveyor_id)
            .map(|(pos, meta)| (*pos, *meta))
            .collect::<Vec<_>>();
        for (pos, meta) in belts {
            if (meta.dx == 0 && meta.dz == 0) || !self.conveyor_enabled(pos) {
                continue;
            }
            if self.items_on(pos).any(|e| !e.item.is_empty() && e.count > 0) {
                continue;
            }
            let back = pos.offset(-i32::from(meta.dx), -i32::from(meta.dz));
            let Some(container) = self.containers.get_mut(&back) else {
                continue;
            };
            let Some(item) = pick_available_item(container) else {
                continue;
            };
            container.take_available(&item, 1);
            self.spawn_item_entity(now, "WORLD", pos, &item, 1, "CONVEYOR_PULL");
            self.audit(
                now,
                "WORLD",
                "CONVEYOR_PULL",
                pos,
                0,
                0,
                "CONVEYOR",
                Some(json!({"from": back.to_array(), "item": item, "count": 1})),
            );
        }
    }

    /// A belt runs unless it is gated. Adjacent switches and sensors gate it
    /// directly (any one ON enables); otherwise adjacent wire must reach an ON
    /// switch or sensor. Ungated belts are always enabled.
    pub(super) fn conveyor_enabled(&self, pos: Vec3i) -> bool {
        let mut gated = false;
        let mut wires = Vec::new();
        for (dx, dz) in CARDINALS {
            let p = pos.offset(dx, dz);
            match self.block_name_at(p).as_str() {
                "SWITCH" => {
                    gated = true;
                    if self.switch_on(p) {
                        return true;
                    }
                }
                "SENSOR" => {
                    gated = true;
                    if self.sensor_on(p) {
                        return true;
                    }
                }
                "WIRE" => wires.push(p),
                _ => {}
            }
        }
        if gated {
            return false;
        }
        if wires.is_empty() {
            return true;
        }
        self.wire_powered(wires)
    }

    fn switch_on(&self, pos: Vec3i) -> bool {
        self.switches.get(&pos).copied().unwrap_or(false)
    }

    /// A sensor reads ON when a non-empty container or a live item stack sits
    /// on its own cell or one of its four neighbours.
    pub(super) fn sensor_on(&self, pos: Vec3i) -> bool {
        std::iter::once((0, 0)).chain(CARDINALS).any(|(dx, dz)| {
            let p = pos.offset(dx, dz);
            self.containers.get(&p).is_some_and(|c| !c.is_empty())
                || self.items_on(p).any(|e| e.count > 0)
        })
    }

    fn wire_powered(&self, starts: Vec<Vec3i>) -> bool {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();
        for p in starts {
            if visited.insert(p) {
                queue.push_back(p);
            }
        }
        while let Some(p) = queue.pop_front() {
            if visited.len() > WIRE_SEARCH_BUDGET {
                break;
            }
            for (dx, dz) in CARDINALS {
                let n = p.offset(dx, dz);
                match self.block_name_at(n).as_str() {
                    "SWITCH" if self.switch_on(n) => return true,
                    "SENSOR" if self.sensor_on(n) => return true,
                    "WIRE" if visited.insert(n) => queue.push_back(n),
                    _ => {}
                }
            }
        }
        false
    }
}

/// Smallest item name with a positive unreserved count.
fn pick_available_item(container: &Container) -> Option<String> {
    container
        .inventory
        .iter()
        .filter(|(item, n)| !item.is_empty() && **n > 0 && container.available(item) > 0)
        .map(|(item, _)| item.clone())
        .next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_smallest_unreserved_item() {
        let mut chest = Container::new("CHEST", Vec3i::new(0, 0, 0));
        chest.add("IRON_ORE", 2);
        chest.add("COAL", 1);
        chest.reserve("COAL", 1);
        assert_eq!(pick_available_item(&chest).as_deref(), Some("IRON_ORE"));
        chest.unreserve("COAL", 1);
        assert_eq!(pick_available_item(&chest).as_deref(), Some("COAL"));
    }

    #[test]
    fn empty_container_offers_nothing() {
        let chest = Container::new("CHEST", Vec3i::new(0, 0, 0));
        assert_eq!(pick_available_item(&chest), None);
    }
}
