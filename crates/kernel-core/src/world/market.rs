//! Direct trades between agents and escrowed contracts at terminals.

use std::collections::BTreeMap;

use contracts::InstantReq;

use super::*;
use crate::catalogs::normalize_rotation;
use crate::economy::{
    calc_tax, encode_item_pairs, mutual_benefit, normalize_contract_kind, parse_item_pairs,
    scaled_deposit, stacks_to_map, ContractState,
};
use crate::spatial::manhattan;

impl World {
    // ---------------------------------------------------------------------------
    // Trades
    // ---------------------------------------------------------------------------

    fn trade_enabled(&self, agent: &mut Agent, now: u64, ref_id: &str) -> bool {
        if !self.cfg.flags.allow_trade {
            agent.add_event(fail_result(now, ref_id, ErrorCode::NoPermission, "trade disabled in this world"));
            return false;
        }
        true
    }

    pub(super) fn instant_offer_trade(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        if !self.trade_enabled(agent, now, &inst.id) {
            return;
        }
        if self.rate_limited(agent, now, &inst.id, "OFFER_TRADE", "too many OFFER_TRADE") {
            return;
        }
        if !self.permissions_for(&agent.id, agent.pos).1.can_trade {
            self.deny(agent, now, &inst.id, ErrorCode::NoPermission, "trade not allowed here");
            return;
        }
        if inst.to.is_empty() {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::BadRequest, "missing to"));
            return;
        }
        if !self.agents.contains_key(&inst.to) {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::InvalidTarget, "target not found"));
            return;
        }
        let offer = match parse_item_pairs(&inst.offer) {
            Ok(offer) if !offer.is_empty() => offer,
            _ => {
                agent.add_event(fail_result(now, &inst.id, ErrorCode::BadRequest, "bad offer"));
                return;
            }
        };
        let request = match parse_item_pairs(&inst.request) {
            Ok(request) if !request.is_empty() => request,
            _ => {
                agent.add_event(fail_result(now, &inst.id, ErrorCode::BadRequest, "bad request"));
                return;
            }
        };

        self.counters.trade += 1;
        let trade_id = format!("TR{:06}", self.counters.trade);
        let offer_ev = event(
            now,
            "TRADE_OFFER",
            json!({
                "trade_id": trade_id,
                "from": agent.id,
                "offer": encode_item_pairs(&offer),
                "request": encode_item_pairs(&request),
            }),
        );
        if let Some(target) = self.agents.get_mut(&inst.to) {
            target.add_event(offer_ev);
        }
        self.trades.insert(
            trade_id.clone(),
            Trade {
                trade_id: trade_id.clone(),
                from: agent.id.clone(),
                to: inst.to.clone(),
                offer,
                request,
                created_tick: now,
            },
        );
        let mut ev = ok_result(now, &inst.id, "");
        ev.insert("trade_id".to_string(), json!(trade_id));
        agent.add_event(ev);
    }

    /// Looks up a pending trade addressed to `agent`.
    fn trade_for(&self, agent: &Agent, trade_id: &str) -> Result<Trade, Rejection> {
        if trade_id.is_empty() {
            return Err((ErrorCode::BadRequest, "missing trade_id"));
        }
        let trade = self
            .trades
            .get(trade_id)
            .ok_or((ErrorCode::InvalidTarget, "trade not found"))?;
        if trade.to != agent.id {
            return Err((ErrorCode::NoPermission, "not your trade"));
        }
        Ok(trade.clone())
    }

    pub(super) fn instant_accept_trade(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        if !self.trade_enabled(agent, now, &inst.id) {
            return;
        }
        let trade = match self.trade_for(agent, &inst.trade_id) {
            Ok(trade) => trade,
            Err((code, message)) => {
                agent.add_event(fail_result(now, &inst.id, code, message));
                return;
            }
        };
        let Some(mut from) = self.agents.remove(&trade.from) else {
            self.trades.remove(&trade.trade_id);
            agent.add_event(fail_result(now, &inst.id, ErrorCode::InvalidTarget, "trader offline"));
            return;
        };
        let outcome = self.settle_trade(now, &trade, &mut from, agent);
        self.agents.insert(from.id.clone(), from);
        match outcome {
            Ok(()) => agent.add_event(ok_result(now, &inst.id, "ok")),
            Err((code, message)) => agent.add_event(fail_result(now, &inst.id, code, message)),
        }
    }

    fn settle_trade(&mut self, now: u64, trade: &Trade, from: &mut Agent, to: &mut Agent) -> Result<(), Rejection> {
        let (land_from, perms_from) = self.permissions_for(&from.id, from.pos);
        let (land_to, perms_to) = self.permissions_for(&to.id, to.pos);
        if !perms_from.can_trade || !perms_to.can_trade {
            return Err((ErrorCode::NoPermission, "trade not allowed here"));
        }
        if !from.has_items(&trade.offer) || !to.has_items(&trade.request) {
            return Err((ErrorCode::NoResource, "missing items"));
        }

        let land_id = land_from.map(|l| l.land_id.clone()).unwrap_or_default();
        let tax_to = land_from.map(|l| l.owner.clone()).unwrap_or_default();
        let mut rate = match (land_from, land_to) {
            (Some(a), Some(b)) if a.land_id == b.land_id && a.market_tax > 0.0 => a.market_tax,
            _ => 0.0,
        };
        let market_week = self.event_running(now) == Some("MARKET_WEEK");
        if rate > 0.0 && market_week {
            rate *= 0.5;
        }

        let tax_offer = calc_tax(&trade.offer, rate);
        let tax_request = calc_tax(&trade.request, rate);
        for (item, n) in &trade.offer {
            let tax = tax_offer.get(item).copied().unwrap_or(0);
            from.take_item(item, *n);
            to.add_item(item, n - tax);
        }
        for (item, n) in &trade.request {
            let tax = tax_request.get(item).copied().unwrap_or(0);
            to.take_item(item, *n);
            from.add_item(item, n - tax);
        }
        if !tax_to.is_empty() {
            for (item, tax) in tax_offer.iter().chain(tax_request.iter()) {
                if tax_to == from.id {
                    from.add_item(item, *tax);
                } else if tax_to == to.id {
                    to.add_item(item, *tax);
                } else {
                    self.credit_owner(&tax_to, item, *tax);
                }
            }
        }
        self.trades.remove(&trade.trade_id);

        let (mutual, value_offer, value_request) = mutual_benefit(&trade.offer, &trade.request);
        self.audit(
            now,
            &to.id,
            "TRADE",
            Vec3i::default(),
            0,
            0,
            "ACCEPT_TRADE",
            Some(json!({
                "trade_id": trade.trade_id,
                "from": trade.from,
                "to": trade.to,
                "offer": encode_item_pairs(&trade.offer),
                "request": encode_item_pairs(&trade.request),
                "value_offer": value_offer,
                "value_request": value_request,
                "mutual_benefit": mutual,
                "tax_rate": rate,
                "tax_paid_off": encode_item_pairs(&tax_offer),
                "tax_paid_req": encode_item_pairs(&tax_request),
                "land_id": land_id,
                "tax_to": tax_to,
            })),
        );

        for party in [&mut *from, &mut *to] {
            party.adjust_rep_trade(2);
            if mutual {
                party.rep_social += 1;
                party.clamp();
            }
        }
        self.stats.trades += 1;
        if mutual {
            for party in [&mut *from, &mut *to] {
                self.fun_on_trade(party, now);
                if market_week {
                    self.fun_on_event_participation(party, "MARKET_WEEK", now);
                    self.award(party, now, "NARRATIVE", "market_week_trade", "narrative:market_week_trade", 5);
                    party.add_event(event(
                        now,
                        "EVENT_GOAL",
                        json!({"event_id": "MARKET_WEEK", "kind": "TRADE"}),
                    ));
                }
            }
        }
        from.add_event(event(
            now,
            "TRADE_DONE",
            json!({"trade_id": trade.trade_id, "with": to.id}),
        ));
        to.add_event(event(
            now,
            "TRADE_DONE",
            json!({"trade_id": trade.trade_id, "with": from.id}),
        ));
        Ok(())
    }

    pub(super) fn instant_decline_trade(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        if !self.trade_enabled(agent, now, &inst.id) {
            return;
        }
        let trade = match self.trade_for(agent, &inst.trade_id) {
            Ok(trade) => trade,
            Err((code, message)) => {
                agent.add_event(fail_result(now, &inst.id, code, message));
                return;
            }
        };
        self.trades.remove(&trade.trade_id);
        if let Some(from) = self.agents.get_mut(&trade.from) {
            from.add_event(event(
                now,
                "TRADE_DECLINED",
                json!({"trade_id": trade.trade_id, "by": agent.id}),
            ));
        }
        agent.add_event(ok_result(now, &inst.id, "declined"));
    }

    // ---------------------------------------------------------------------------
    // Contracts
    // ---------------------------------------------------------------------------

    pub(super) fn instant_post_contract(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        match self.post_contract(agent, now, inst) {
            Ok(contract_id) => {
                let mut ev = ok_result(now, &inst.id, "");
                ev.insert("contract_id".to_string(), json!(contract_id));
                agent.add_event(ev);
            }
            Err((code, message)) => agent.add_event(fail_result(now, &inst.id, code, message)),
        }
    }

    fn post_contract(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) -> Result<String, Rejection> {
        let pos = self
            .terminal_at(&inst.terminal_id)
            .ok_or((ErrorCode::InvalidTarget, "contract terminal not found"))?;
        if manhattan(agent.pos, pos) > INTERACT_RANGE {
            return Err((ErrorCode::Blocked, "too far"));
        }
        let kind = normalize_contract_kind(&inst.contract_kind).ok_or((ErrorCode::BadRequest, "bad contract_kind"))?;
        let reward = stacks_to_map(&inst.reward);
        if reward.is_empty() {
            return Err((ErrorCode::BadRequest, "missing reward"));
        }
        let requirements = stacks_to_map(&inst.requirements);
        if kind != "BUILD" && requirements.is_empty() {
            return Err((ErrorCode::BadRequest, "missing requirements"));
        }
        let deadline_tick = if inst.deadline_tick > 0 {
            inst.deadline_tick
        } else if inst.duration_ticks > 0 {
            now + inst.duration_ticks
        } else {
            now + self.cfg.day_ticks
        };
        let (blueprint_id, anchor, rotation) = if kind == "BUILD" {
            if inst.blueprint_id.is_empty() {
                return Err((ErrorCode::BadRequest, "missing blueprint_id"));
            }
            if !self.catalogs.blueprints.contains_key(&inst.blueprint_id) {
                return Err((ErrorCode::InvalidTarget, "unknown blueprint"));
            }
            let rotation = normalize_rotation(inst.rotation).ok_or((ErrorCode::BadRequest, "bad rotation"))?;
            (inst.blueprint_id.clone(), Vec3i::flat(inst.anchor), rotation)
        } else {
            (String::new(), Vec3i::default(), 0)
        };
        if !agent.has_items(&reward) {
            return Err((ErrorCode::NoResource, "insufficient reward items"));
        }

        let terminal = self
            .containers
            .get_mut(&pos)
            .ok_or((ErrorCode::InvalidTarget, "contract terminal not found"))?;
        for (item, n) in &reward {
            agent.take_item(item, *n);
            terminal.add(item, *n);
            terminal.reserve(item, *n);
        }
        self.counters.contract += 1;
        let contract_id = format!("C{:06}", self.counters.contract);
        let contract = Contract {
            contract_id: contract_id.clone(),
            terminal_pos: pos,
            poster: agent.id.clone(),
            acceptor: String::new(),
            kind: kind.to_string(),
            requirements,
            reward,
            deposit: stacks_to_map(&inst.deposit),
            blueprint_id,
            anchor,
            rotation,
            created_tick: now,
            deadline_tick,
            state: ContractState::Open,
        };
        self.audit(
            now,
            &agent.id,
            "CONTRACT_POST",
            pos,
            0,
            0,
            "POST_CONTRACT",
            Some(contract.summary()),
        );
        self.contracts.insert(contract_id.clone(), contract);
        Ok(contract_id)
    }

    /// Shared checks for accept and submit. Returns a copy of the contract.
    fn contract_at_terminal(&self, agent: &Agent, now: u64, inst: &InstantReq) -> Result<Contract, Rejection> {
        if inst.contract_id.is_empty() || inst.terminal_id.is_empty() {
            return Err((ErrorCode::BadRequest, "missing contract_id/terminal_id"));
        }
        let contract = self
            .contracts
            .get(&inst.contract_id)
            .ok_or((ErrorCode::InvalidTarget, "contract not found"))?;
        if self.terminal_at(&inst.terminal_id) != Some(contract.terminal_pos) {
            return Err((ErrorCode::BadRequest, "terminal mismatch"));
        }
        if manhattan(agent.pos, contract.terminal_pos) > INTERACT_RANGE {
            return Err((ErrorCode::Blocked, "too far"));
        }
        if now > contract.deadline_tick {
            return Err((ErrorCode::Conflict, "contract expired"));
        }
        Ok(contract.clone())
    }

    pub(super) fn instant_accept_contract(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        match self.accept_contract(agent, now, inst) {
            Ok(()) => agent.add_event(ok_result(now, &inst.id, "accepted")),
            Err((code, message)) => agent.add_event(fail_result(now, &inst.id, code, message)),
        }
    }

    fn accept_contract(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) -> Result<(), Rejection> {
        if let Some(contract) = self.contracts.get(&inst.contract_id) {
            if contract.state != ContractState::Open {
                return Err((ErrorCode::Conflict, "contract not open"));
            }
        }
        let contract = self.contract_at_terminal(agent, now, inst)?;
        let deposit = scaled_deposit(&contract.deposit, agent.rep_trade);
        if !agent.has_items(&deposit) {
            return Err((ErrorCode::NoResource, "insufficient deposit"));
        }
        let terminal = self
            .containers
            .get_mut(&contract.terminal_pos)
            .ok_or((ErrorCode::InvalidTarget, "terminal not found"))?;
        for (item, n) in &deposit {
            agent.take_item(item, *n);
            terminal.add(item, *n);
            terminal.reserve(item, *n);
        }
        if let Some(live) = self.contracts.get_mut(&contract.contract_id) {
            live.deposit = deposit;
            live.acceptor = agent.id.clone();
            live.state = ContractState::Accepted;
        }
        self.audit(
            now,
            &agent.id,
            "CONTRACT_ACCEPT",
            contract.terminal_pos,
            0,
            0,
            "ACCEPT_CONTRACT",
            Some(json!({"contract_id": contract.contract_id})),
        );
        Ok(())
    }

    pub(super) fn instant_submit_contract(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        match self.submit_contract(agent, now, inst) {
            Ok(()) => agent.add_event(ok_result(now, &inst.id, "completed")),
            Err((code, message)) => agent.add_event(fail_result(now, &inst.id, code, message)),
        }
    }

    fn submit_contract(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) -> Result<(), Rejection> {
        if let Some(contract) = self.contracts.get(&inst.contract_id) {
            if contract.acceptor != agent.id || contract.state != ContractState::Accepted {
                return Err((ErrorCode::NoPermission, "not acceptor"));
            }
        }
        let contract = self.contract_at_terminal(agent, now, inst)?;
        if !self.contract_requirements_met(&contract) {
            return Err((ErrorCode::Blocked, "requirements not met"));
        }
        let escrow = self.release_escrow(&contract, contract.kind != "BUILD");
        for (item, n) in &escrow {
            agent.add_item(item, *n);
        }
        if let Some(live) = self.contracts.get_mut(&contract.contract_id) {
            live.state = ContractState::Completed;
        }
        self.contract_credit(agent, now, &contract.kind);
        self.audit(
            now,
            &agent.id,
            "CONTRACT_COMPLETE",
            contract.terminal_pos,
            0,
            0,
            "SUBMIT_CONTRACT",
            Some(json!({"contract_id": contract.contract_id, "kind": contract.kind})),
        );
        Ok(())
    }

    pub(super) fn contract_requirements_met(&self, contract: &Contract) -> bool {
        if contract.kind == "BUILD" {
            return self
                .catalogs
                .blueprints
                .get(&contract.blueprint_id)
                .is_some_and(|bp| {
                    self.blueprint_placed(&contract.blueprint_id, contract.anchor, contract.rotation)
                        && self.structure_stable(bp, contract.anchor, contract.rotation)
                });
        }
        self.containers
            .get(&contract.terminal_pos)
            .is_some_and(|terminal| terminal.has_available(&contract.requirements))
    }

    /// Releases reward and deposit from escrow and returns them. With `deliver`,
    /// the delivered requirements move to the poster's owed ledger.
    pub(super) fn release_escrow(&mut self, contract: &Contract, deliver: bool) -> BTreeMap<String, i32> {
        let mut escrow = contract.reward.clone();
        for (item, n) in &contract.deposit {
            *escrow.entry(item.clone()).or_insert(0) += n;
        }
        let Some(terminal) = self.containers.get_mut(&contract.terminal_pos) else {
            return BTreeMap::new();
        };
        if deliver {
            for (item, n) in &contract.requirements {
                if terminal.take_available(item, *n) {
                    terminal.add_owed(&contract.poster, item, *n);
                }
            }
        }
        for (item, n) in &escrow {
            terminal.release_reserved(item, *n);
        }
        escrow
    }

    /// Gives items to an agent present in this world, or records them as owed
    /// at the terminal.
    pub(super) fn pay_or_owe(&mut self, agent_id: &str, terminal_pos: Vec3i, items: &BTreeMap<String, i32>) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            for (item, n) in items {
                agent.add_item(item, *n);
            }
        } else if let Some(terminal) = self.containers.get_mut(&terminal_pos) {
            for (item, n) in items {
                terminal.add_owed(agent_id, item, *n);
            }
        }
    }

    pub(super) fn contract_credit(&mut self, agent: &mut Agent, now: u64, kind: &str) {
        if kind == "BUILD" {
            agent.rep_build += 6;
        } else {
            agent.rep_trade += 6;
            agent.rep_social += 2;
        }
        agent.clamp();
        self.stats.trades += 1;
        self.fun_on_contract_complete(agent, now, kind);
    }
}
