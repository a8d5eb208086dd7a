//! Land administration, organizations, laws and the per-tick governance
//! passes (claim maintenance, law lifecycle, contract deadlines).

use contracts::InstantReq;

use super::*;
use crate::claims::{upgrade_cost, STAGE_UNPROTECTED, UPGRADE_RADII};
use crate::economy::{encode_item_pairs, ContractState};
use crate::laws::{activate, canonical_params, normalize_choice, LawStatus};
use crate::orgs::{normalize_org_kind, ROLE_LEADER, ROLE_MEMBER};

const MAX_ORG_NAME: usize = 40;

impl World {
    // ---------------------------------------------------------------------------
    // Land administration
    // ---------------------------------------------------------------------------

    fn is_land_admin(&self, agent_id: &str, land: &LandClaim) -> bool {
        land.owner == agent_id
            || self
                .orgs
                .get(&land.owner)
                .is_some_and(|org| org.is_admin(agent_id))
    }

    fn admin_land(&self, agent: &Agent, land_id: &str) -> Result<(), Rejection> {
        let land = self
            .claims
            .get(land_id)
            .ok_or((ErrorCode::InvalidTarget, "land not found"))?;
        if !self.is_land_admin(&agent.id, land) {
            return Err((ErrorCode::NoPermission, "not land admin"));
        }
        Ok(())
    }

    fn reply(agent: &mut Agent, now: u64, ref_id: &str, outcome: Result<(), Rejection>) {
        match outcome {
            Ok(()) => agent.add_event(ok_result(now, ref_id, "ok")),
            Err((code, message)) => agent.add_event(fail_result(now, ref_id, code, message)),
        }
    }

    pub(super) fn instant_set_permissions(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        let outcome = self.set_permissions(agent, now, inst);
        Self::reply(agent, now, &inst.id, outcome);
    }

    fn set_permissions(&mut self, agent: &Agent, now: u64, inst: &InstantReq) -> Result<(), Rejection> {
        if inst.land_id.is_empty() || inst.policy.is_empty() {
            return Err((ErrorCode::BadRequest, "missing land_id/policy"));
        }
        self.admin_land(agent, &inst.land_id)?;
        let land = self
            .claims
            .get_mut(&inst.land_id)
            .ok_or((ErrorCode::InvalidTarget, "land not found"))?;
        land.flags.apply_policy(&inst.policy);
        let anchor = land.anchor;
        self.audit(
            now,
            &agent.id,
            "LAND_POLICY",
            anchor,
            0,
            0,
            "SET_PERMISSIONS",
            Some(json!({"land_id": inst.land_id, "policy": inst.policy})),
        );
        Ok(())
    }

    pub(super) fn instant_upgrade_claim(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        match self.upgrade_claim(agent, now, inst) {
            Ok(()) => {
                let mut ev = ok_result(now, &inst.id, "");
                ev.insert("land_id".to_string(), json!(inst.land_id));
                ev.insert("radius".to_string(), json!(inst.radius));
                agent.add_event(ev);
            }
            Err((code, message)) => agent.add_event(fail_result(now, &inst.id, code, message)),
        }
    }

    fn upgrade_claim(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) -> Result<(), Rejection> {
        if inst.land_id.is_empty() || inst.radius <= 0 {
            return Err((ErrorCode::BadRequest, "missing land_id/radius"));
        }
        self.admin_land(agent, &inst.land_id)?;
        let land = self
            .claims
            .get(&inst.land_id)
            .ok_or((ErrorCode::InvalidTarget, "land not found"))?;
        if land.maintenance_stage >= 1 {
            return Err((ErrorCode::NoPermission, "land maintenance stage disallows expansion"));
        }
        if !UPGRADE_RADII.contains(&inst.radius) {
            return Err((ErrorCode::BadRequest, "radius must be 64 or 128"));
        }
        if inst.radius <= land.radius {
            return Err((ErrorCode::BadRequest, "radius must increase"));
        }
        if self.block_name_at(land.anchor) != "CLAIM_TOTEM" {
            return Err((ErrorCode::InvalidTarget, "claim totem missing"));
        }
        let cost = upgrade_cost(land.radius, inst.radius);
        if cost.is_empty() {
            return Err((ErrorCode::BadRequest, "no upgrade needed"));
        }
        if !agent.has_items(&cost) {
            return Err((ErrorCode::NoResource, "missing upgrade materials"));
        }
        let overlaps = self
            .claims
            .values()
            .any(|other| other.land_id != land.land_id && land.overlaps(other, inst.radius));
        if overlaps {
            return Err((ErrorCode::Conflict, "claim overlaps existing land"));
        }

        let (anchor, from) = (land.anchor, land.radius);
        for (item, n) in &cost {
            agent.take_item(item, *n);
        }
        if let Some(land) = self.claims.get_mut(&inst.land_id) {
            land.radius = inst.radius;
        }
        self.audit(
            now,
            &agent.id,
            "CLAIM_UPGRADE",
            anchor,
            0,
            0,
            "UPGRADE_CLAIM",
            Some(json!({
                "land_id": inst.land_id,
                "from_radius": from,
                "to_radius": inst.radius,
                "cost": encode_item_pairs(&cost),
            })),
        );
        Ok(())
    }

    pub(super) fn instant_add_member(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        let outcome = self.edit_members(agent, now, inst, true);
        Self::reply(agent, now, &inst.id, outcome);
    }

    pub(super) fn instant_remove_member(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        let outcome = self.edit_members(agent, now, inst, false);
        Self::reply(agent, now, &inst.id, outcome);
    }

    fn edit_members(&mut self, agent: &Agent, now: u64, inst: &InstantReq, add: bool) -> Result<(), Rejection> {
        if inst.land_id.is_empty() || inst.member_id.is_empty() {
            return Err((ErrorCode::BadRequest, "missing land_id/member_id"));
        }
        self.admin_land(agent, &inst.land_id)?;
        let land = self
            .claims
            .get_mut(&inst.land_id)
            .ok_or((ErrorCode::InvalidTarget, "land not found"))?;
        if add {
            land.members.insert(inst.member_id.clone());
        } else {
            land.members.remove(&inst.member_id);
        }
        let anchor = land.anchor;
        let (action, reason) = if add {
            ("LAND_MEMBER_ADD", "ADD_MEMBER")
        } else {
            ("LAND_MEMBER_REMOVE", "REMOVE_MEMBER")
        };
        self.audit(
            now,
            &agent.id,
            action,
            anchor,
            0,
            0,
            reason,
            Some(json!({"land_id": inst.land_id, "member_id": inst.member_id})),
        );
        Ok(())
    }

    pub(super) fn instant_deed_land(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        let outcome = self.deed_land(agent, now, inst);
        Self::reply(agent, now, &inst.id, outcome);
    }

    fn deed_land(&mut self, agent: &Agent, now: u64, inst: &InstantReq) -> Result<(), Rejection> {
        if inst.land_id.is_empty() || inst.new_owner.is_empty() {
            return Err((ErrorCode::BadRequest, "missing land_id/new_owner"));
        }
        self.admin_land(agent, &inst.land_id)?;
        let known = inst.new_owner == agent.id
            || self.agents.contains_key(&inst.new_owner)
            || self.orgs.contains_key(&inst.new_owner);
        if !known {
            return Err((ErrorCode::InvalidTarget, "new owner not found"));
        }
        let land = self
            .claims
            .get_mut(&inst.land_id)
            .ok_or((ErrorCode::InvalidTarget, "land not found"))?;
        let previous = std::mem::replace(&mut land.owner, inst.new_owner.clone());
        let anchor = land.anchor;
        self.audit(
            now,
            &agent.id,
            "LAND_DEED",
            anchor,
            0,
            0,
            "DEED_LAND",
            Some(json!({"land_id": inst.land_id, "from": previous, "to": inst.new_owner})),
        );
        Ok(())
    }

    // ---------------------------------------------------------------------------
    // Organizations
    // ---------------------------------------------------------------------------

    pub(super) fn instant_create_org(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        let Some(kind) = normalize_org_kind(&inst.org_kind) else {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::BadRequest, "bad org_kind"));
            return;
        };
        let name = inst.org_name.trim();
        if name.is_empty() || name.chars().count() > MAX_ORG_NAME {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::BadRequest, "bad org_name"));
            return;
        }
        if !agent.org_id.is_empty() {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::Conflict, "already in org"));
            return;
        }
        self.counters.org += 1;
        let org_id = format!("ORG{:06}", self.counters.org);
        let mut org = Organization::new(org_id.clone(), kind, name.to_string(), now);
        org.members.insert(agent.id.clone(), ROLE_LEADER.to_string());
        self.orgs.insert(org_id.clone(), org);
        agent.org_id = org_id.clone();
        let pos = agent.pos;
        self.audit(
            now,
            &agent.id,
            "ORG_CREATE",
            pos,
            0,
            0,
            "CREATE_ORG",
            Some(json!({"org_id": org_id, "kind": kind, "name": name})),
        );
        let mut ev = ok_result(now, &inst.id, "");
        ev.insert("org_id".to_string(), json!(org_id));
        agent.add_event(ev);
    }

    pub(super) fn instant_join_org(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        let outcome = self.join_org(agent, now, inst);
        Self::reply(agent, now, &inst.id, outcome);
    }

    fn join_org(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) -> Result<(), Rejection> {
        if inst.org_id.is_empty() {
            return Err((ErrorCode::BadRequest, "missing org_id"));
        }
        let org = self
            .orgs
            .get_mut(&inst.org_id)
            .ok_or((ErrorCode::InvalidTarget, "org not found"))?;
        if !agent.org_id.is_empty() {
            return Err((ErrorCode::Conflict, "already in org"));
        }
        org.members.insert(agent.id.clone(), ROLE_MEMBER.to_string());
        org.bump_meta();
        agent.org_id = inst.org_id.clone();
        let pos = agent.pos;
        self.audit(
            now,
            &agent.id,
            "ORG_JOIN",
            pos,
            0,
            0,
            "JOIN_ORG",
            Some(json!({"org_id": inst.org_id})),
        );
        Ok(())
    }

    pub(super) fn instant_org_deposit(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        let outcome = self.org_transfer(agent, now, inst, true);
        Self::reply(agent, now, &inst.id, outcome);
    }

    pub(super) fn instant_org_withdraw(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        let outcome = self.org_transfer(agent, now, inst, false);
        Self::reply(agent, now, &inst.id, outcome);
    }

    fn org_transfer(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq, deposit: bool) -> Result<(), Rejection> {
        if inst.org_id.is_empty() || inst.item_id.is_empty() || inst.count <= 0 {
            return Err((ErrorCode::BadRequest, "missing org_id/item_id/count"));
        }
        let world_id = self.cfg.world_id.clone();
        let org = self
            .orgs
            .get_mut(&inst.org_id)
            .ok_or((ErrorCode::InvalidTarget, "org not found"))?;
        let (item, n) = (inst.item_id.as_str(), inst.count);
        if deposit {
            if !org.is_member(&agent.id) {
                return Err((ErrorCode::NoPermission, "not org member"));
            }
            if !agent.take_item(item, n) {
                return Err((ErrorCode::NoResource, "missing items"));
            }
            *org.treasury_for(&world_id).entry(item.to_string()).or_insert(0) += n;
        } else {
            if !org.is_admin(&agent.id) {
                return Err((ErrorCode::NoPermission, "not org admin"));
            }
            let treasury = org.treasury_for(&world_id);
            let have = treasury.get(item).copied().unwrap_or(0);
            if have < n {
                org.sync_legacy(&world_id);
                return Err((ErrorCode::NoResource, "treasury lacks items"));
            }
            if have == n {
                treasury.remove(item);
            } else {
                treasury.insert(item.to_string(), have - n);
            }
            agent.add_item(item, n);
        }
        org.sync_legacy(&world_id);
        let pos = agent.pos;
        let (action, reason) = if deposit {
            ("ORG_DEPOSIT", "ORG_DEPOSIT")
        } else {
            ("ORG_WITHDRAW", "ORG_WITHDRAW")
        };
        self.audit(
            now,
            &agent.id,
            action,
            pos,
            0,
            0,
            reason,
            Some(json!({"org_id": inst.org_id, "item": item, "count": n})),
        );
        Ok(())
    }

    pub(super) fn instant_leave_org(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        if agent.org_id.is_empty() {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::Blocked, "not in org"));
            return;
        }
        let org_id = std::mem::take(&mut agent.org_id);
        let mut disbanded = false;
        if let Some(org) = self.orgs.get_mut(&org_id) {
            let role = org.members.remove(&agent.id);
            org.bump_meta();
            if org.members.is_empty() {
                disbanded = true;
            } else if role.as_deref() == Some(ROLE_LEADER) {
                if let Some(role) = org.members.values_mut().next() {
                    *role = ROLE_LEADER.to_string();
                }
                org.bump_meta();
            }
        }
        if disbanded {
            self.orgs.remove(&org_id);
        }
        let pos = agent.pos;
        self.audit(
            now,
            &agent.id,
            "ORG_LEAVE",
            pos,
            0,
            0,
            "LEAVE_ORG",
            Some(json!({"org_id": org_id, "disbanded": disbanded})),
        );
        agent.add_event(ok_result(now, &inst.id, "ok"));
    }

    // ---------------------------------------------------------------------------
    // Laws
    // ---------------------------------------------------------------------------

    fn law_event(now: u64, law: &Law, kind: &str, message: &str, claim_type: &str) -> Event {
        let mut ev = event(
            now,
            "LAW",
            json!({
                "kind": kind,
                "law_id": law.law_id,
                "land_id": law.land_id,
                "template_id": law.template_id,
                "title": law.title,
                "status": law.status.as_str(),
            }),
        );
        if !message.is_empty() {
            ev.insert("message".to_string(), json!(message));
        }
        if !claim_type.is_empty() {
            ev.insert("claim_type".to_string(), json!(claim_type));
        }
        ev
    }

    pub(super) fn instant_propose_law(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        match self.propose_law(agent, now, inst) {
            Ok(law_id) => {
                let mut ev = ok_result(now, &inst.id, "");
                ev.insert("law_id".to_string(), json!(law_id));
                agent.add_event(ev);
            }
            Err((code, message)) => agent.add_event(fail_result(now, &inst.id, code, &message)),
        }
    }

    fn propose_law(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) -> Result<String, (ErrorCode, String)> {
        let reject = |code: ErrorCode, message: &str| (code, message.to_string());
        if !self.cfg.flags.allow_laws {
            return Err(reject(ErrorCode::NoPermission, "laws disabled in this world"));
        }
        if inst.land_id.is_empty() || inst.template_id.is_empty() {
            return Err(reject(ErrorCode::BadRequest, "missing land_id/template_id"));
        }
        let land = self
            .claims
            .get(&inst.land_id)
            .ok_or_else(|| reject(ErrorCode::InvalidTarget, "land not found"))?;
        if !self.is_land_member(&agent.id, land) {
            return Err(reject(ErrorCode::NoPermission, "not eligible"));
        }
        let claim_type = land.claim_type.clone();
        let template = self
            .catalogs
            .law_templates
            .get(&inst.template_id)
            .ok_or_else(|| reject(ErrorCode::InvalidTarget, "unknown law template"))?;
        let catalogs = &self.catalogs;
        let params = canonical_params(&inst.template_id, &inst.params, |item| catalogs.items.contains_key(item))
            .map_err(|err| {
                if err == "unsupported template" {
                    (ErrorCode::InvalidTarget, err)
                } else {
                    (ErrorCode::BadRequest, err)
                }
            })?;
        let title = match inst.title.trim() {
            "" => template.title.clone(),
            title => title.to_string(),
        };

        self.counters.law += 1;
        let law_id = format!("LAW{:06}", self.counters.law);
        let notice_ends_tick = now + self.cfg.law_notice_ticks;
        let law = Law {
            law_id: law_id.clone(),
            land_id: inst.land_id.clone(),
            template_id: inst.template_id.clone(),
            title,
            params,
            proposed_by: agent.id.clone(),
            proposed_tick: now,
            notice_ends_tick,
            vote_ends_tick: notice_ends_tick + self.cfg.law_vote_ticks,
            status: LawStatus::Notice,
            votes: Default::default(),
        };
        let ev = Self::law_event(now, &law, "PROPOSED", "", &claim_type);
        self.broadcast_with(agent, ev);
        let pos = agent.pos;
        self.audit(
            now,
            &agent.id,
            "LAW_PROPOSE",
            pos,
            0,
            0,
            "PROPOSE_LAW",
            Some(json!({"law_id": law_id, "land_id": law.land_id, "template_id": law.template_id, "params": law.params})),
        );
        self.laws.insert(law_id.clone(), law);

        if self.event_running(now) == Some("CIVIC_VOTE") {
            self.fun_on_event_participation(agent, "CIVIC_VOTE", now);
            self.award(agent, now, "NARRATIVE", "civic_vote_propose", "narrative:civic_vote_propose", 6);
            agent.add_event(event(
                now,
                "EVENT_GOAL",
                json!({"event_id": "CIVIC_VOTE", "kind": "PROPOSE_LAW", "law_id": law_id}),
            ));
        }
        Ok(law_id)
    }

    pub(super) fn instant_vote(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        let outcome = self.cast_vote(agent, now, inst);
        Self::reply(agent, now, &inst.id, outcome);
    }

    fn cast_vote(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) -> Result<(), Rejection> {
        if inst.law_id.is_empty() || inst.choice.is_empty() {
            return Err((ErrorCode::BadRequest, "missing law_id/choice"));
        }
        let law = self
            .laws
            .get(&inst.law_id)
            .ok_or((ErrorCode::InvalidTarget, "law not found"))?;
        if law.status != LawStatus::Voting {
            return Err((ErrorCode::Blocked, "law not in voting"));
        }
        let land = self
            .claims
            .get(&law.land_id)
            .ok_or((ErrorCode::InvalidTarget, "land not found"))?;
        if !self.is_land_member(&agent.id, land) {
            return Err((ErrorCode::NoPermission, "not eligible to vote"));
        }
        let choice = normalize_choice(&inst.choice).ok_or((ErrorCode::BadRequest, "bad choice"))?;
        if let Some(law) = self.laws.get_mut(&inst.law_id) {
            law.votes.insert(agent.id.clone(), choice.to_string());
        }
        self.fun_on_vote(agent, now);
        let pos = agent.pos;
        self.audit(
            now,
            &agent.id,
            "LAW_VOTE",
            pos,
            0,
            0,
            "VOTE",
            Some(json!({"law_id": inst.law_id, "choice": choice})),
        );
        if self.event_running(now) == Some("CIVIC_VOTE") {
            agent.add_event(event(
                now,
                "EVENT_GOAL",
                json!({"event_id": "CIVIC_VOTE", "kind": "VOTE", "law_id": inst.law_id}),
            ));
        }
        Ok(())
    }

    pub(super) fn tick_laws(&mut self, now: u64) {
        let ids = self.laws.keys().cloned().collect::<Vec<_>>();
        for law_id in ids {
            let Some((status, notice_ends, vote_ends)) = self
                .laws
                .get(&law_id)
                .map(|law| (law.status, law.notice_ends_tick, law.vote_ends_tick))
            else {
                continue;
            };
            match status {
                LawStatus::Notice if now >= notice_ends => {
                    let Some(law) = self.laws.get_mut(&law_id) else {
                        continue;
                    };
                    law.status = LawStatus::Voting;
                    let ev = Self::law_event(now, law, "VOTING", "", "");
                    self.broadcast(ev);
                }
                LawStatus::Voting if now >= vote_ends => self.close_vote(now, &law_id),
                _ => {}
            }
        }
    }

    fn close_vote(&mut self, now: u64, law_id: &str) {
        let Some(law) = self.laws.get(law_id).cloned() else {
            return;
        };
        let (yes, no) = law.tally();
        let details = json!({"law_id": law.law_id, "land_id": law.land_id, "yes": yes, "no": no});
        let anchor = self.claims.get(&law.land_id).map(|l| l.anchor).unwrap_or_default();
        let (status, reason, message) = if yes > no {
            let activated = match self.claims.get_mut(&law.land_id) {
                Some(land) => activate(&law, land),
                None => Err("land not found".to_string()),
            };
            match activated {
                Ok(()) => (LawStatus::Active, "VOTE_PASSED", String::new()),
                Err(err) => (LawStatus::Rejected, "ACTIVATE_FAILED", err),
            }
        } else {
            (LawStatus::Rejected, "VOTE_FAILED", "vote failed".to_string())
        };
        if status == LawStatus::Active {
            self.with_agent(&law.proposed_by, |world, proposer| world.fun_on_law_active(proposer, now));
        }
        let Some(live) = self.laws.get_mut(law_id) else {
            return;
        };
        live.status = status;
        let kind = status.as_str();
        let ev = Self::law_event(now, live, kind, &message, "");
        let action = if status == LawStatus::Active {
            "LAW_ACTIVE"
        } else {
            "LAW_REJECTED"
        };
        self.audit(now, "WORLD", action, anchor, 0, 0, reason, Some(details));
        self.broadcast(ev);
    }

    // ---------------------------------------------------------------------------
    // Claim maintenance
    // ---------------------------------------------------------------------------

    pub(super) fn tick_claims_maintenance(&mut self, now: u64) {
        let day = self.cfg.day_ticks;
        if day == 0 {
            return;
        }
        let ids = self.claims.keys().cloned().collect::<Vec<_>>();
        for land_id in ids {
            let Some(land) = self.claims.get_mut(&land_id) else {
                continue;
            };
            if land.maintenance_due_tick == 0 {
                land.maintenance_due_tick = now + day;
                continue;
            }
            if now < land.maintenance_due_tick {
                continue;
            }
            let owner = land.owner.clone();
            let paid = self.pay_maintenance(&owner);
            let Some(land) = self.claims.get_mut(&land_id) else {
                continue;
            };
            land.maintenance_stage = if paid {
                0
            } else {
                (land.maintenance_stage + 1).min(STAGE_UNPROTECTED)
            };
            land.maintenance_due_tick = now + day;
            let (stage, next_due) = (land.maintenance_stage, land.maintenance_due_tick);
            if let Some(agent) = self.agents.get_mut(&owner) {
                agent.add_event(event(
                    now,
                    "MAINTENANCE",
                    json!({
                        "land_id": land_id,
                        "status": if paid { "PAID" } else { "LATE" },
                        "stage": stage,
                        "next_due_tick": next_due,
                    }),
                ));
            }
        }
    }

    fn pay_maintenance(&mut self, owner: &str) -> bool {
        let cost = self.cfg.maintenance_cost.clone();
        if cost.is_empty() {
            return true;
        }
        let world_id = self.cfg.world_id.clone();
        if let Some(org) = self.orgs.get_mut(owner) {
            let treasury = org.treasury_for(&world_id);
            let affordable = cost
                .iter()
                .all(|(item, n)| treasury.get(item).copied().unwrap_or(0) >= *n);
            if affordable {
                for (item, n) in &cost {
                    if let Some(have) = treasury.get_mut(item) {
                        *have -= n;
                    }
                }
                treasury.retain(|_, n| *n > 0);
            }
            org.sync_legacy(&world_id);
            return affordable;
        }
        match self.agents.get_mut(owner) {
            Some(agent) if agent.has_items(&cost) => {
                for (item, n) in &cost {
                    agent.take_item(item, *n);
                }
                true
            }
            _ => false,
        }
    }

    // ---------------------------------------------------------------------------
    // Contract deadlines and auto-completion
    // ---------------------------------------------------------------------------

    pub(super) fn tick_contracts(&mut self, now: u64) {
        let ids = self
            .contracts
            .iter()
            .filter(|(_, c)| c.state.is_live())
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for contract_id in ids {
            let Some(contract) = self.contracts.get(&contract_id).cloned() else {
                continue;
            };
            if !self.containers.contains_key(&contract.terminal_pos) {
                self.set_contract_state(&contract_id, ContractState::Failed);
                continue;
            }
            let details = json!({
                "contract_id": contract.contract_id,
                "kind": contract.kind,
                "poster": contract.poster,
                "acceptor": contract.acceptor,
                "reward": encode_item_pairs(&contract.reward),
                "deposit": encode_item_pairs(&contract.deposit),
            });
            let pos = contract.terminal_pos;

            if contract.state == ContractState::Open {
                if now > contract.deadline_tick {
                    let refund = self.release_escrow(&contract, false);
                    self.pay_or_owe(&contract.poster, pos, &refund);
                    self.set_contract_state(&contract_id, ContractState::Failed);
                    self.audit(now, "WORLD", "CONTRACT_EXPIRE", pos, 0, 0, "CONTRACT_TIMEOUT", Some(details));
                }
                continue;
            }

            if now > contract.deadline_tick {
                let escrow = self.release_escrow(&contract, false);
                self.pay_or_owe(&contract.poster, pos, &escrow);
                self.set_contract_state(&contract_id, ContractState::Failed);
                if let Some(acceptor) = self.agents.get_mut(&contract.acceptor) {
                    acceptor.adjust_rep_trade(-12);
                    acceptor.adjust_rep_law(-8);
                }
                self.audit(now, "WORLD", "CONTRACT_FAIL", pos, 0, 0, "CONTRACT_TIMEOUT", Some(details));
                continue;
            }

            if self.contract_requirements_met(&contract) {
                let escrow = self.release_escrow(&contract, contract.kind != "BUILD");
                self.pay_or_owe(&contract.acceptor, pos, &escrow);
                self.set_contract_state(&contract_id, ContractState::Completed);
                let kind = contract.kind.clone();
                self.with_agent(&contract.acceptor, |world, acceptor| {
                    world.contract_credit(acceptor, now, &kind)
                });
                self.audit(
                    now,
                    &contract.acceptor,
                    "CONTRACT_COMPLETE",
                    pos,
                    0,
                    0,
                    "AUTO_COMPLETE",
                    Some(details),
                );
            }
        }
    }

    fn set_contract_state(&mut self, contract_id: &str, state: ContractState) {
        if let Some(contract) = self.contracts.get_mut(contract_id) {
            contract.state = state;
        }
    }
}
