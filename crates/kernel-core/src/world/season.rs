//! Season rollover and admin reset. Both rebuild terrain from the next seed and
//! clear world-scoped state; agents keep identity, org membership, reputation
//! and memory.

use super::*;
use crate::agent::{Equipment, FunScore, MAX_HP, MAX_STAMINA_MILLI};

const SEASON_HUNGER: i32 = 20;

impl World {
    /// 1-based index of the season containing `now`.
    pub fn season_index(&self, now: u64) -> u64 {
        match self.cfg.season_length_ticks {
            0 => 1,
            season => now / season + 1,
        }
    }

    /// Warns every agent `reset_notice_ticks` before the next rollover.
    pub(super) fn maybe_reset_notice(&mut self, now: u64) {
        let notice = self.cfg.reset_notice_ticks;
        let season = self.cfg.season_length_ticks;
        if notice == 0 || season == 0 || (now + notice) % season != 0 {
            return;
        }
        let reset_tick = now + notice;
        for agent in self.agents.values_mut() {
            agent.add_event(event(
                now,
                "WORLD_RESET_NOTICE",
                json!({"world_id": self.cfg.world_id, "reset_tick": reset_tick, "in_ticks": notice}),
            ));
        }
    }

    pub(super) fn season_rollover(&mut self, now: u64) {
        let season = self.season_index(now);
        self.reset_for_new_season(now, now, season, "SEASON_ROLLOVER");
    }

    /// Resets the world at the current tick boundary and returns the state it
    /// had just before, for archiving. The WORLD_RESET audit goes out with the
    /// next tick's batch and carries that tick.
    pub fn admin_reset(&mut self) -> SnapshotV1 {
        let archived = self.export_snapshot();
        let now = self.tick;
        let season = self.season_index(now) + 1;
        self.reset_for_new_season(now, now + 1, season, "ADMIN_RESET");
        tracing::info!(world_id = %self.cfg.world_id, tick = now, seed = self.cfg.seed, "world reset by admin");
        archived
    }

    fn reset_for_new_season(&mut self, now: u64, audit_tick: u64, season: u64, reason: &str) {
        let archive_tick = now.saturating_sub(1);
        self.reset_total += 1;
        self.cfg.seed += 1;
        self.chunks = ChunkStore::new(self.cfg.gen_params(), &self.catalogs);

        self.weather = Weather::Clear;
        self.weather_until_tick = 0;
        self.active_event = None;
        self.claims.clear();
        self.containers.clear();
        self.items.clear();
        self.items_at.clear();
        self.trades.clear();
        self.boards.clear();
        self.signs.clear();
        self.conveyors.clear();
        self.switches.clear();
        self.contracts.clear();
        self.laws.clear();
        self.structures.clear();
        self.stats = DirectorStats {
            window_start_tick: now,
            ..DirectorStats::default()
        };
        for client in self.clients.values_mut() {
            client.last_voxels = None;
        }

        // Orgs survive; their treasury in this world does not.
        let world_id = self.cfg.world_id.clone();
        for org in self.orgs.values_mut() {
            org.treasury_by_world.insert(world_id.clone(), BTreeMap::new());
            org.treasury.clear();
        }

        for agent_id in self.agent_ids() {
            self.with_agent(&agent_id, |world, agent| {
                world.reset_agent_for_season(agent, now);
                agent.add_event(event(
                    now,
                    "SEASON_ROLLOVER",
                    json!({"season": season, "archive_tick": archive_tick, "seed": world.cfg.seed}),
                ));
                agent.add_event(event(
                    now,
                    "WORLD_RESET_DONE",
                    json!({"world_id": world.cfg.world_id, "reset_tick": now}),
                ));
            });
        }

        let details = json!({
            "world_id": self.cfg.world_id,
            "archive_tick": archive_tick,
            "season": season,
            "new_seed": self.cfg.seed,
        });
        self.audit(audit_tick, "SYSTEM", "WORLD_RESET", Vec3i::default(), 0, 0, reason, Some(details));
        tracing::info!(world_id = %self.cfg.world_id, tick = now, season, reason, "world reset for new season");
    }

    fn reset_agent_for_season(&self, agent: &mut Agent, now: u64) {
        agent.move_task = None;
        agent.work_task = None;
        agent.hp = MAX_HP;
        agent.hunger = SEASON_HUNGER;
        agent.stamina_milli = MAX_STAMINA_MILLI;
        agent.yaw = 0;
        agent.inventory = self.cfg.starter_items.clone();
        agent.equipment = Equipment::default();
        agent.events.clear();
        agent.pending_memory.clear();
        agent.rate_windows.clear();
        agent.fun_decay.clear();
        agent.seen_biomes.clear();
        agent.seen_recipes.clear();
        agent.seen_events.clear();
        agent.fun = FunScore::default();
        agent.pos = self.spawn_pos_for(agent_number(&agent.id));
        self.fun_on_biome(agent, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world(season: u64, notice: u64) -> World {
        let cfg = WorldConfig {
            world_id: "MINE_L1".to_string(),
            seed: 5,
            day_ticks: 10,
            season_length_ticks: season,
            reset_notice_ticks: notice,
            ..WorldConfig::default()
        };
        let catalogs = Arc::new(Catalogs::builtin(&cfg));
        World::new(cfg, catalogs).expect("world")
    }

    fn has_event(world: &World, id: &str, kind: &str) -> bool {
        world
            .agent(id)
            .is_some_and(|a| a.events.iter().any(|e| e.get("type") == Some(&json!(kind))))
    }

    #[test]
    fn rollover_reseeds_and_restores_starter_state() {
        let mut w = world(3, 0);
        let id = w.join(JoinRequest::default()).agent_id;
        if let Some(agent) = w.agent_mut(&id) {
            agent.add_item("DIAMOND", 4);
            agent.rep_trade = 700;
            agent.memory_save("home", "north", 0, 0);
        }
        w.step(Vec::new());
        w.step(Vec::new());
        assert_eq!(w.config().seed, 5);
        w.step(Vec::new());

        assert_eq!(w.config().seed, 6);
        assert_eq!(w.reset_total(), 1);
        let agent = w.agent(&id).expect("agent");
        assert_eq!(agent.count("DIAMOND"), 0);
        assert_eq!(agent.count("PLANK"), 20);
        assert_eq!(agent.rep_trade, 700);
        assert!(agent.memory.contains_key("home"));
    }

    #[test]
    fn rollover_tells_agents_and_audits() {
        let mut w = world(3, 0);
        let id = w.join(JoinRequest::default()).agent_id;
        w.step(Vec::new());
        w.step(Vec::new());
        let out = w.step(Vec::new());
        assert!(out
            .audits
            .iter()
            .any(|a| a.action == "WORLD_RESET" && a.reason == "SEASON_ROLLOVER"));
        // Observations drained the events; the history keeps them.
        let (history, _) = w.events_since(&id, 0, 100).expect("agent");
        assert!(history
            .iter()
            .any(|(_, e)| e.get("type") == Some(&json!("SEASON_ROLLOVER")) && e.get("season") == Some(&json!(2))));
    }

    #[test]
    fn reset_notice_precedes_the_boundary() {
        let mut w = world(10, 4);
        let id = w.join(JoinRequest::default()).agent_id;
        w.maybe_reset_notice(5);
        assert!(!has_event(&w, &id, "WORLD_RESET_NOTICE"));
        w.maybe_reset_notice(6);
        assert!(has_event(&w, &id, "WORLD_RESET_NOTICE"));
    }

    #[test]
    fn admin_reset_returns_the_prior_state() {
        let mut w = world(100, 0);
        w.join(JoinRequest::default());
        w.step(Vec::new());
        let before = w.state_digest();
        let archived = w.admin_reset();
        assert_eq!(archived.tick(), 1);
        assert_eq!(w.tick(), 1);
        assert_eq!(w.reset_total(), 1);
        assert_ne!(w.state_digest(), before);
        let restored = World::from_snapshot(archived, Arc::clone(w.catalogs())).expect("restore");
        assert_eq!(restored.state_digest(), before);
    }

    #[test]
    fn admin_reset_audit_carries_the_tick_it_is_flushed_with() {
        let mut w = world(100, 0);
        w.join(JoinRequest::default());
        w.step(Vec::new());
        w.admin_reset();
        let out = w.step(Vec::new());
        assert_eq!(out.tick, 2);
        let reset = out
            .audits
            .iter()
            .find(|a| a.action == "WORLD_RESET")
            .expect("reset audit");
        assert_eq!(reset.reason, "ADMIN_RESET");
        assert!(out.audits.iter().all(|a| a.tick == out.tick));
        assert_eq!(
            reset.details.as_ref().and_then(|d| d.get("archive_tick")),
            Some(&json!(0))
        );
    }

    #[test]
    fn org_treasury_is_cleared_but_membership_kept() {
        let mut w = world(100, 0);
        let id = w.join(JoinRequest::default()).agent_id;
        let mut org = Organization::new("ORG000001".to_string(), crate::orgs::KIND_GUILD, "Guild".to_string(), 0);
        org.members.insert(id.clone(), crate::orgs::ROLE_LEADER.to_string());
        org.treasury_for("MINE_L1").insert("COAL".to_string(), 9);
        w.orgs.insert(org.org_id.clone(), org);
        w.admin_reset();
        let org = w.org("ORG000001").expect("org");
        assert!(org.is_member(&id));
        assert!(org.treasury_by_world.get("MINE_L1").is_some_and(|t| t.is_empty()));
    }
}
