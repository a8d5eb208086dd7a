//! Block-backed fixtures (containers, boards, signs, conveyors, switches,
//! claim totems) and dropped item entities.

use super::*;
use crate::container::is_container_block;
use crate::economy::{ITEM_CLEANUP_EVERY_TICKS, ITEM_ENTITY_TTL_TICKS};
use crate::spatial::{positional_id, yaw_to_dir};

impl World {
    // -- fixtures --------------------------------------------------------------

    /// Creates the runtime record backing a freshly placed block.
    pub(super) fn on_block_placed(&mut self, pos: Vec3i, block: &str, yaw: i32) {
        if is_container_block(block) {
            self.containers
                .entry(pos)
                .or_insert_with(|| Container::new(block, pos));
            return;
        }
        match block {
            "CONVEYOR" => {
                let (dx, dz) = yaw_to_dir(yaw);
                self.conveyors.insert(pos, ConveyorMeta::from_dir(dx, dz));
            }
            "SWITCH" => {
                self.switches.entry(pos).or_insert(false);
            }
            _ => {}
        }
    }

    /// Drops the runtime record of a block that is about to be removed.
    pub(super) fn on_block_removed(&mut self, now: u64, actor: &str, pos: Vec3i, block: &str, reason: &str) {
        match block {
            "BULLETIN_BOARD" => {
                self.boards.remove(&positional_id("BULLETIN_BOARD", pos));
            }
            "SIGN" => {
                if self.signs.remove(&pos).is_some() {
                    let details = json!({"sign_id": positional_id("SIGN", pos)});
                    self.audit(now, actor, "SIGN_REMOVE", pos, 0, 0, reason, Some(details));
                }
            }
            "CONVEYOR" => {
                if self.conveyors.remove(&pos).is_some() {
                    let details = json!({"conveyor_id": positional_id("CONVEYOR", pos)});
                    self.audit(now, actor, "CONVEYOR_REMOVE", pos, 0, 0, reason, Some(details));
                }
            }
            "SWITCH" => {
                if self.switches.remove(&pos).is_some() {
                    let details = json!({"switch_id": positional_id("SWITCH", pos)});
                    self.audit(now, actor, "SWITCH_REMOVE", pos, 0, 0, reason, Some(details));
                }
            }
            "CLAIM_TOTEM" => {
                let land_id = self
                    .claims
                    .values()
                    .find(|land| land.anchor == pos)
                    .map(|land| land.land_id.clone());
                if let Some(land_id) = land_id {
                    self.claims.remove(&land_id);
                    self.audit(
                        now,
                        actor,
                        "CLAIM_REMOVE",
                        pos,
                        0,
                        0,
                        reason,
                        Some(json!({"land_id": land_id})),
                    );
                }
            }
            _ => {
                if is_container_block(block) {
                    self.containers.remove(&pos);
                }
            }
        }
    }

    /// Any block named `block` within `dist` cells on the ground plane.
    pub(super) fn near_block(&self, pos: Vec3i, block: &str, dist: i32) -> bool {
        let Some(id) = self.catalogs.block_id(block) else {
            return false;
        };
        (-dist..=dist).any(|dz| (-dist..=dist).any(|dx| self.chunks.get(pos.offset(dx, dz)) == id))
    }

    // -- item entities ---------------------------------------------------------

    /// Drops `count` of `item` at `pos`, merging into an existing stack of the
    /// same item on that cell. Returns the entity id.
    pub(super) fn spawn_item_entity(&mut self, now: u64, actor: &str, pos: Vec3i, item: &str, count: i32, reason: &str) -> Option<String> {
        if item.is_empty() || count <= 0 {
            return None;
        }
        let expires = now + ITEM_ENTITY_TTL_TICKS;
        let existing = self
            .items_on(pos)
            .find(|e| e.item == item && e.count > 0)
            .map(|e| e.entity_id.clone());
        let existing = existing.and_then(|id| self.items.get_mut(&id));
        let (entity_id, merged) = match existing {
            Some(e) => {
                e.count += count;
                e.expires_tick = e.expires_tick.max(expires);
                (e.entity_id.clone(), true)
            }
            None => {
                self.counters.item += 1;
                let entity_id = format!("IT{:06}", self.counters.item);
                self.items.insert(
                    entity_id.clone(),
                    ItemEntity {
                        entity_id: entity_id.clone(),
                        pos,
                        item: item.to_string(),
                        count,
                        created_tick: now,
                        expires_tick: expires,
                    },
                );
                self.items_at.entry(pos).or_default().insert(entity_id.clone());
                (entity_id, false)
            }
        };
        self.audit(
            now,
            actor,
            "ITEM_SPAWN",
            pos,
            0,
            0,
            reason,
            Some(json!({"entity_id": entity_id, "item": item, "count": count, "merged": merged})),
        );
        Some(entity_id)
    }

    pub(super) fn remove_item_entity(&mut self, now: u64, actor: &str, entity_id: &str, reason: &str) -> Option<ItemEntity> {
        let entity = self.items.remove(entity_id)?;
        self.unindex_item(entity.pos, entity_id);
        self.audit(
            now,
            actor,
            "ITEM_DESPAWN",
            entity.pos,
            0,
            0,
            reason,
            Some(json!({"entity_id": entity.entity_id, "item": entity.item, "count": entity.count})),
        );
        Some(entity)
    }

    pub(super) fn move_item_entity(&mut self, now: u64, entity_id: &str, to: Vec3i, reason: &str) {
        let Some(entity) = self.items.get_mut(entity_id) else {
            return;
        };
        let from = entity.pos;
        if from == to {
            return;
        }
        entity.pos = to;
        let details = json!({
            "entity_id": entity.entity_id,
            "to": to.to_array(),
            "item": entity.item,
            "count": entity.count,
        });
        self.unindex_item(from, entity_id);
        self.items_at.entry(to).or_default().insert(entity_id.to_string());
        self.audit(now, "WORLD", "ITEM_MOVE", from, 0, 0, reason, Some(details));
    }

    /// Removes expired stacks every `ITEM_CLEANUP_EVERY_TICKS` ticks.
    pub(super) fn cleanup_item_entities(&mut self, now: u64) {
        if now % ITEM_CLEANUP_EVERY_TICKS != 0 {
            return;
        }
        let expired = self
            .items
            .values()
            .filter(|e| e.count <= 0 || e.item.is_empty() || (e.expires_tick != 0 && now >= e.expires_tick))
            .map(|e| e.entity_id.clone())
            .collect::<Vec<_>>();
        for entity_id in expired {
            self.remove_item_entity(now, "WORLD", &entity_id, "EXPIRE");
        }
    }

    /// Item entity ids on `pos`, in id order.
    pub(super) fn item_ids_at(&self, pos: Vec3i) -> Vec<String> {
        self.items_at
            .get(&pos)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Item entities on `pos`, in id order.
    pub(super) fn items_on(&self, pos: Vec3i) -> impl Iterator<Item = &ItemEntity> + '_ {
        self.items_at
            .get(&pos)
            .into_iter()
            .flatten()
            .filter_map(|id| self.items.get(id))
    }

    fn unindex_item(&mut self, pos: Vec3i, entity_id: &str) {
        if let Some(ids) = self.items_at.get_mut(&pos) {
            ids.remove(entity_id);
            if ids.is_empty() {
                self.items_at.remove(&pos);
            }
        }
    }

    /// Rebuilds the per-cell index from `items`.
    pub(super) fn reindex_items(&mut self) {
        self.items_at.clear();
        for entity in self.items.values() {
            self.items_at
                .entry(entity.pos)
                .or_default()
                .insert(entity.entity_id.clone());
        }
    }
}
