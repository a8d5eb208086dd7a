//! Hunger, weather and event hazards, stamina recovery and respawn.

use std::collections::BTreeMap;

use super::*;
use crate::agent::{MAX_HP, MAX_STAMINA_MILLI};
use crate::economy::encode_item_pairs;

const HUNGER_EVERY_TICKS: u64 = 200;
const HAZARD_EVERY_TICKS: u64 = 50;
const TORCH_WARMTH_RADIUS: i32 = 3;
const RESPAWN_HUNGER: i32 = 10;

fn is_night(time_of_day: f64) -> bool {
    !(0.25..=0.75).contains(&time_of_day)
}

/// Milli-stamina regained this tick.
fn stamina_recovery(weather: Weather, hunger: i32, hazard: Option<&str>) -> i32 {
    let mut rec = match weather {
        Weather::Clear => 2,
        Weather::Storm | Weather::Cold => 1,
    };
    if hunger == 0 {
        rec = 0;
    } else if hunger < 5 {
        rec = rec.min(1);
    }
    match hazard {
        Some("BLIGHT_ZONE") => 0,
        Some("FLOOD_WARNING") => rec.min(1),
        _ => rec,
    }
}

/// Roughly 30% of every stack, at least one item overall when the inventory
/// is not empty.
fn inventory_loss(inventory: &BTreeMap<String, i32>) -> BTreeMap<String, i32> {
    let mut lost = inventory
        .iter()
        .filter(|(item, n)| !item.is_empty() && **n > 0)
        .map(|(item, n)| (item.clone(), n * 3 / 10))
        .filter(|(_, d)| *d > 0)
        .collect::<BTreeMap<_, _>>();
    if lost.is_empty() {
        if let Some((item, _)) = inventory.iter().find(|(item, n)| !item.is_empty() && **n > 0) {
            lost.insert(item.clone(), 1);
        }
    }
    lost
}

fn damage(agent: &mut Agent, now: u64, kind: &str) {
    agent.hp -= 1;
    agent.add_event(event(now, "DAMAGE", json!({"kind": kind, "hp": agent.hp})));
}

impl World {
    pub(super) fn system_survival(&mut self, now: u64) {
        let weather = self.weather;
        let blight = |world: &World, pos: Vec3i| world.event_covering(pos, now) == Some("BLIGHT_ZONE");

        if now % HUNGER_EVERY_TICKS == 0 {
            for agent_id in self.agent_ids() {
                let in_blight = self.agents.get(&agent_id).is_some_and(|a| blight(self, a.pos));
                let Some(agent) = self.agents.get_mut(&agent_id) else {
                    continue;
                };
                if agent.hunger > 0 {
                    agent.hunger -= if in_blight { 2 } else { 1 };
                    agent.hunger = agent.hunger.max(0);
                } else if agent.hp > 0 {
                    damage(agent, now, "STARVATION");
                }
            }
        }

        if weather == Weather::Cold && now % HAZARD_EVERY_TICKS == 0 && is_night(self.time_of_day(now)) {
            for agent_id in self.agent_ids() {
                let sheltered = self
                    .agents
                    .get(&agent_id)
                    .is_some_and(|a| a.hp <= 0 || self.near_block(a.pos, "TORCH", TORCH_WARMTH_RADIUS));
                if sheltered {
                    continue;
                }
                if let Some(agent) = self.agents.get_mut(&agent_id) {
                    damage(agent, now, "COLD");
                }
            }
        }

        let in_bandit_camp = |world: &World, agent: &Agent| {
            agent.hp > 0 && world.event_covering(agent.pos, now) == Some("BANDIT_CAMP")
        };
        let campers = self.agents.values().filter(|a| in_bandit_camp(self, a)).count();

        for agent_id in self.agent_ids() {
            self.with_agent(&agent_id, |world, agent| {
                let hazard = world.event_covering(agent.pos, now);
                let rec = stamina_recovery(weather, agent.hunger, hazard);
                // Bandits only pick on loners.
                if campers == 1 && now % HAZARD_EVERY_TICKS == 0 && in_bandit_camp(&*world, &*agent) {
                    damage(agent, now, "BANDIT");
                }
                if rec > 0 && agent.stamina_milli < MAX_STAMINA_MILLI {
                    agent.stamina_milli = (agent.stamina_milli + rec).min(MAX_STAMINA_MILLI);
                }
                if agent.hp <= 0 {
                    world.respawn(agent, now, "DOWNED");
                }
            });
        }

        self.cleanup_item_entities(now);
    }

    /// Drops part of the inventory where the agent fell and moves it back to
    /// its spawn point with fresh vitals.
    pub(super) fn respawn(&mut self, agent: &mut Agent, now: u64, reason: &str) {
        agent.move_task = None;
        agent.work_task = None;

        let drop_pos = agent.pos;
        let lost = inventory_loss(&agent.inventory);
        for (item, n) in &lost {
            agent.take_item(item, *n);
            self.spawn_item_entity(now, &agent.id, drop_pos, item, *n, "RESPAWN_DROP");
        }

        agent.pos = self.spawn_pos_for(agent_number(&agent.id));
        agent.yaw = 0;
        agent.hp = MAX_HP;
        agent.hunger = RESPAWN_HUNGER;
        agent.stamina_milli = MAX_STAMINA_MILLI;

        tracing::debug!(world_id = %self.cfg.world_id, agent_id = %agent.id, tick = now, reason, "agent respawned");
        let mut ev = event(
            now,
            "RESPAWN",
            json!({"reason": reason, "pos": agent.pos.to_array(), "drop_pos": drop_pos.to_array()}),
        );
        if !lost.is_empty() {
            ev.insert("lost".to_string(), encode_item_pairs(&lost));
        }
        agent.add_event(ev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn night_is_the_outer_quarters_of_the_day() {
        assert!(is_night(0.1));
        assert!(is_night(0.9));
        assert!(!is_night(0.5));
        assert!(!is_night(0.25));
    }

    #[test]
    fn recovery_depends_on_weather_hunger_and_hazard() {
        assert_eq!(stamina_recovery(Weather::Clear, 20, None), 2);
        assert_eq!(stamina_recovery(Weather::Storm, 20, None), 1);
        assert_eq!(stamina_recovery(Weather::Clear, 3, None), 1);
        assert_eq!(stamina_recovery(Weather::Clear, 0, None), 0);
        assert_eq!(stamina_recovery(Weather::Clear, 20, Some("BLIGHT_ZONE")), 0);
        assert_eq!(stamina_recovery(Weather::Clear, 20, Some("FLOOD_WARNING")), 1);
        assert_eq!(stamina_recovery(Weather::Clear, 20, Some("MARKET_WEEK")), 2);
    }

    #[test]
    fn loss_takes_thirty_percent_of_each_stack() {
        let inv = BTreeMap::from([("COAL".to_string(), 10), ("PLANK".to_string(), 4), ("TORCH".to_string(), 1)]);
        let lost = inventory_loss(&inv);
        assert_eq!(lost, BTreeMap::from([("COAL".to_string(), 3), ("PLANK".to_string(), 1)]));
    }

    #[test]
    fn loss_takes_at_least_one_item() {
        let inv = BTreeMap::from([("BREAD".to_string(), 2), ("APPLE".to_string(), 1)]);
        assert_eq!(inventory_loss(&inv), BTreeMap::from([("APPLE".to_string(), 1)]));
        assert!(inventory_loss(&BTreeMap::new()).is_empty());
    }
}
