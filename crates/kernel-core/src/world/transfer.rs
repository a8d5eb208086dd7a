//! Cross-world agent moves and org metadata exchange. Worlds never share agent
//! structs: the source world serializes an [`AgentTransfer`] and the target
//! rebuilds the agent from it at a tick boundary.

use std::collections::BTreeSet;
use std::fmt;

use contracts::AgentTransfer;

use super::*;
use crate::agent::{Equipment, FunScore, MemoryEntry};
use crate::orgs::{KIND_GUILD, ROLE_MEMBER};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    MissingAgentId,
    AgentNotFound(String),
    AgentAlreadyPresent(String),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingAgentId => write!(f, "missing agent id"),
            Self::AgentNotFound(id) => write!(f, "agent {id} not found"),
            Self::AgentAlreadyPresent(id) => write!(f, "agent {id} already present"),
        }
    }
}

impl std::error::Error for TransferError {}

impl World {
    /// Removes `agent_id` from this world and returns its transfer record.
    /// Tasks are cancelled and open trades involving the agent are dropped.
    pub fn transfer_out(&mut self, agent_id: &str, to_world: &str) -> Result<AgentTransfer, TransferError> {
        let agent = self
            .agents
            .remove(agent_id)
            .ok_or_else(|| TransferError::AgentNotFound(agent_id.to_string()))?;
        if self.clients.remove(agent_id).is_some() {
            self.pending_leaves.push(agent_id.to_string());
        }
        self.trades
            .retain(|_, trade| trade.from != agent.id && trade.to != agent.id);

        let org = (!agent.org_id.is_empty())
            .then(|| self.orgs.get(&agent.org_id))
            .flatten()
            .map(|org| {
                let mut meta = org.to_transfer();
                meta.members.retain(|id, role| !id.is_empty() && !role.is_empty());
                meta
            });
        let inventory = agent
            .inventory
            .iter()
            .filter(|(item, n)| !item.is_empty() && **n > 0)
            .map(|(item, n)| (item.clone(), *n))
            .collect();

        tracing::info!(
            world_id = %self.cfg.world_id,
            agent_id = %agent.id,
            to_world,
            tick = self.tick,
            "agent transferred out"
        );
        Ok(AgentTransfer {
            id: agent.id.clone(),
            name: agent.name.clone(),
            org_id: agent.org_id.clone(),
            org,
            from_world_id: self.cfg.world_id.clone(),
            current_world_id: to_world.to_string(),
            from_entry_id: String::new(),
            to_entry_id: String::new(),
            switch_cooldown_until_tick: agent.switch_cooldown_until_tick,
            pos: agent.pos.to_array(),
            yaw: agent.yaw,
            hp: agent.hp,
            hunger: agent.hunger,
            stamina_milli: agent.stamina_milli,
            rep_trade: agent.rep_trade,
            rep_build: agent.rep_build,
            rep_social: agent.rep_social,
            rep_law: agent.rep_law,
            fun: agent.fun.to_array(),
            inventory,
            main_hand: agent.equipment.main_hand.clone(),
            armor: agent.equipment.armor.clone(),
            memory: agent.memory_for_transfer(),
            resume_token: agent.resume_token.clone(),
        })
    }

    /// Materializes a transferred agent. `entry` overrides the carried position
    /// (the target entry point); the agent is attached as a session when
    /// `attach` is set.
    pub fn transfer_in(
        &mut self,
        t: AgentTransfer,
        entry: Option<Vec3i>,
        attach: Option<bool>,
    ) -> Result<JoinOutcome, TransferError> {
        if t.id.is_empty() {
            return Err(TransferError::MissingAgentId);
        }
        if self.agents.contains_key(&t.id) {
            return Err(TransferError::AgentAlreadyPresent(t.id));
        }
        let now = self.tick;
        let pos = match entry {
            Some(entry) => {
                let catalogs = &self.catalogs;
                self.chunks
                    .find_spawn_air(entry, 8, |block| catalogs.is_solid(block))
            }
            None => Vec3i::flat(t.pos),
        };

        let mut agent = Agent::new(t.id.clone(), t.name.clone(), pos);
        agent.current_world_id = self.cfg.world_id.clone();
        agent.switch_cooldown_until_tick = t.switch_cooldown_until_tick;
        agent.yaw = t.yaw;
        agent.hp = t.hp;
        agent.hunger = t.hunger;
        agent.stamina_milli = t.stamina_milli;
        agent.rep_trade = t.rep_trade;
        agent.rep_build = t.rep_build;
        agent.rep_social = t.rep_social;
        agent.rep_law = t.rep_law;
        agent.fun = FunScore::from_array(t.fun);
        agent.equipment = Equipment {
            main_hand: t.main_hand.clone(),
            armor: t.armor.clone(),
        };
        for (item, n) in &t.inventory {
            if !item.is_empty() && *n > 0 {
                agent.add_item(item, *n);
            }
        }
        agent.memory = t
            .memory
            .iter()
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, entry)| {
                (
                    key.clone(),
                    MemoryEntry {
                        value: entry.value.clone(),
                        expiry_tick: entry.expiry_tick,
                    },
                )
            })
            .collect();
        agent.resume_token = t.resume_token.clone();
        agent.clamp();

        agent.org_id = if t.org_id.is_empty() {
            t.org.as_ref().map(|org| org.org_id.clone()).unwrap_or_default()
        } else {
            t.org_id.clone()
        };
        if !agent.org_id.is_empty() {
            self.adopt_org(&agent.id, &agent.org_id, t.org.as_ref());
        }

        if !t.from_world_id.is_empty() {
            let mut ev = event(
                now,
                "WORLD_SWITCH",
                json!({
                    "from": t.from_world_id,
                    "to": self.cfg.world_id,
                    "agent_id": agent.id,
                    "world_id": self.cfg.world_id,
                }),
            );
            if !t.from_entry_id.is_empty() {
                ev.insert("from_entry_id".to_string(), json!(t.from_entry_id));
            }
            if !t.to_entry_id.is_empty() {
                ev.insert("to_entry_id".to_string(), json!(t.to_entry_id));
            }
            agent.add_event(ev);
        }
        if let Some(ev) = self.active_event_notice(now) {
            agent.add_event(ev);
        }

        self.counters.agent = self.counters.agent.max(agent_number(&agent.id));
        let outcome = JoinOutcome {
            agent_id: agent.id.clone(),
            resume_token: agent.resume_token.clone(),
            resumed: true,
            pos,
        };
        if let Some(delta_voxels) = attach {
            self.clients.insert(
                agent.id.clone(),
                ClientState {
                    delta_voxels,
                    last_voxels: None,
                },
            );
        }
        tracing::info!(
            world_id = %self.cfg.world_id,
            agent_id = %agent.id,
            from_world = %t.from_world_id,
            tick = now,
            "agent transferred in"
        );
        self.agents.insert(agent.id.clone(), agent);
        Ok(outcome)
    }

    /// Ensures the org exists locally, folds in carried metadata and lists the
    /// arriving agent as a member.
    fn adopt_org(&mut self, agent_id: &str, org_id: &str, meta: Option<&OrgTransfer>) {
        let world_id = self.cfg.world_id.clone();
        let org = match meta.filter(|m| m.org_id == org_id) {
            Some(meta) => {
                let org = self
                    .orgs
                    .entry(org_id.to_string())
                    .or_insert_with(|| Organization::from_transfer(meta));
                if !org.apply_meta(meta, false) {
                    org.members.extend(
                        meta.members
                            .iter()
                            .filter(|(id, role)| !id.is_empty() && !role.is_empty())
                            .map(|(id, role)| (id.clone(), role.clone())),
                    );
                }
                org
            }
            None => self.orgs.entry(org_id.to_string()).or_insert_with(|| {
                Organization::new(org_id.to_string(), KIND_GUILD, org_id.to_string(), 0)
            }),
        };
        org.members
            .entry(agent_id.to_string())
            .or_insert_with(|| ROLE_MEMBER.to_string());
        org.treasury_for(&world_id);
        self.counters.org = self.counters.org.max(agent_number(org_id));
    }

    // -- org metadata ------------------------------------------------------------

    /// This world's org metadata for manager-side reconciliation.
    pub fn org_snapshot(&self) -> OrgSnapshot {
        OrgSnapshot {
            world_id: self.cfg.world_id.clone(),
            orgs: self.orgs.values().map(Organization::to_transfer).collect(),
        }
    }

    /// Applies a merged org set: metadata is upserted by `meta_version`
    /// (members replaced by the authoritative list), then every agent's
    /// `org_id` is normalized so membership is globally consistent.
    pub fn apply_org_meta(&mut self, orgs: &[OrgTransfer]) {
        let world_id = self.cfg.world_id.clone();
        for meta in orgs.iter().filter(|m| !m.org_id.is_empty()) {
            let org = self
                .orgs
                .entry(meta.org_id.clone())
                .or_insert_with(|| Organization::from_transfer(meta));
            org.apply_meta(meta, true);
            org.treasury_for(&world_id);
            self.counters.org = self.counters.org.max(agent_number(&meta.org_id));
        }

        let mut owner_by_agent = BTreeMap::new();
        for org in self.orgs.values() {
            for agent_id in org.members.keys() {
                owner_by_agent
                    .entry(agent_id.clone())
                    .or_insert_with(|| org.org_id.clone());
            }
        }
        let listed = self.orgs.keys().cloned().collect::<BTreeSet<_>>();
        for agent in self.agents.values_mut() {
            match owner_by_agent.get(&agent.id) {
                Some(org_id) => agent.org_id = org_id.clone(),
                None => {
                    if !agent.org_id.is_empty() {
                        let stale = !listed.contains(&agent.org_id)
                            || self
                                .orgs
                                .get(&agent.org_id)
                                .is_some_and(|org| !org.is_member(&agent.id));
                        if stale {
                            agent.org_id.clear();
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orgs::{KIND_CITY, ROLE_LEADER};

    fn world(id: &str) -> World {
        let cfg = WorldConfig {
            world_id: id.to_string(),
            seed: 11,
            ..WorldConfig::default()
        };
        let catalogs = Arc::new(Catalogs::builtin(&cfg));
        World::new(cfg, catalogs).expect("world")
    }

    #[test]
    fn agent_moves_between_worlds_with_state() {
        let mut overworld = world("OVERWORLD");
        let mut mine = world("MINE_L1");
        let joined = overworld.join(JoinRequest {
            name: "a".to_string(),
            new_token: "tok-1".to_string(),
            ..JoinRequest::default()
        });
        let id = joined.agent_id;
        if let Some(agent) = overworld.agent_mut(&id) {
            agent.inventory.clear();
            agent.add_item("COAL", 3);
            agent.inventory.insert("JUNK".to_string(), 0);
            agent.memory_save("plan", "dig", 0, 0);
            agent.rep_trade = 640;
        }

        let record = overworld.transfer_out(&id, "MINE_L1").expect("out");
        assert!(overworld.agent(&id).is_none());
        assert_eq!(record.inventory, BTreeMap::from([("COAL".to_string(), 3)]));
        assert_eq!(record.resume_token, "tok-1");

        let entry = Vec3i::new(0, 0, 0);
        let outcome = mine.transfer_in(record, Some(entry), Some(true)).expect("in");
        assert_eq!(outcome.agent_id, id);
        let agent = mine.agent(&id).expect("arrived");
        assert_eq!(agent.current_world_id, "MINE_L1");
        assert_eq!(agent.count("COAL"), 3);
        assert_eq!(agent.rep_trade, 640);
        assert!(agent.memory.contains_key("plan"));
        assert_eq!(mine.agent_for_token("tok-1"), Some(id.as_str()));
        assert!(agent.events.iter().any(|e| {
            e.get("type") == Some(&json!("WORLD_SWITCH"))
                && e.get("from") == Some(&json!("OVERWORLD"))
                && e.get("to") == Some(&json!("MINE_L1"))
        }));
        assert_eq!(mine.client_count(), 1);
    }

    #[test]
    fn id_collision_is_rejected() {
        let mut a = world("OVERWORLD");
        let mut b = world("MINE_L1");
        let id = a.join(JoinRequest::default()).agent_id;
        b.join(JoinRequest::default());
        let record = a.transfer_out(&id, "MINE_L1").expect("out");
        assert_eq!(
            b.transfer_in(record, None, None),
            Err(TransferError::AgentAlreadyPresent(id))
        );
    }

    #[test]
    fn unknown_agent_cannot_leave() {
        let mut a = world("OVERWORLD");
        assert_eq!(
            a.transfer_out("A99", "MINE_L1"),
            Err(TransferError::AgentNotFound("A99".to_string()))
        );
    }

    #[test]
    fn carried_org_is_upserted_with_membership() {
        let mut a = world("OVERWORLD");
        let mut b = world("MINE_L1");
        let id = a.join(JoinRequest::default()).agent_id;
        let mut org = Organization::new("ORG000004".to_string(), KIND_CITY, "Harbor".to_string(), 2);
        org.members.insert(id.clone(), ROLE_LEADER.to_string());
        a.orgs.insert(org.org_id.clone(), org);
        if let Some(agent) = a.agent_mut(&id) {
            agent.org_id = "ORG000004".to_string();
        }
        let record = a.transfer_out(&id, "MINE_L1").expect("out");
        b.transfer_in(record, None, None).expect("in");
        let org = b.org("ORG000004").expect("org");
        assert_eq!(org.name, "Harbor");
        assert!(org.is_admin(&id));
        assert!(org.treasury_by_world.contains_key("MINE_L1"));
        assert_eq!(b.counters.org, 4);
    }

    #[test]
    fn reconciliation_clears_stale_membership() {
        let mut w = world("OVERWORLD");
        let a1 = w.join(JoinRequest::default()).agent_id;
        let a2 = w.join(JoinRequest::default()).agent_id;
        let mut org = Organization::new("ORG000001".to_string(), KIND_CITY, "Town".to_string(), 1);
        org.members.insert(a1.clone(), ROLE_LEADER.to_string());
        org.members.insert(a2.clone(), ROLE_MEMBER.to_string());
        w.orgs.insert(org.org_id.clone(), org.clone());
        for id in [&a1, &a2] {
            if let Some(agent) = w.agent_mut(id) {
                agent.org_id = "ORG000001".to_string();
            }
        }

        let mut merged = org.to_transfer();
        merged.meta_version = 2;
        merged.members.remove(&a2);
        w.apply_org_meta(&[merged]);

        assert_eq!(w.agent(&a1).map(|a| a.org_id.as_str()), Some("ORG000001"));
        assert_eq!(w.agent(&a2).map(|a| a.org_id.as_str()), Some(""));
        assert_eq!(w.org("ORG000001").map(|o| o.meta_version), Some(2));
    }
}
