//! Instant handlers that touch only the acting agent and nearby fixtures:
//! chat, food, memory, boards, signs, switches and owed-item claims.

use contracts::InstantReq;

use super::*;
use crate::agent::RateDecision;
use crate::economy::{
    normalize_search_limit, resolve_board_id, validate_post, BoardPost, MAX_SIGN_TEXT,
};
use crate::spatial::{manhattan, parse_positional_id, positional_id};

/// Manhattan reach of LOCAL chat.
const LOCAL_CHAT_RANGE: i32 = 32;

impl World {
    /// Counts one `kind` action; emits E_RATE_LIMIT with the cooldown and
    /// returns true when the window is exhausted.
    pub(super) fn rate_limited(&self, agent: &mut Agent, now: u64, ref_id: &str, kind: &str, message: &str) -> bool {
        let Some(limit) = self.cfg.rate_limits.for_kind(kind) else {
            return false;
        };
        match agent.rate_limit_allow(kind, now, limit.window_ticks, limit.max) {
            RateDecision::Allowed => false,
            RateDecision::Limited {
                cooldown_ticks,
                until_tick,
            } => {
                let mut ev = fail_result(now, ref_id, ErrorCode::RateLimit, message);
                ev.insert("cooldown_ticks".to_string(), json!(cooldown_ticks));
                ev.insert("cooldown_until_tick".to_string(), json!(until_tick));
                agent.add_event(ev);
                true
            }
        }
    }

    // -- chat ------------------------------------------------------------------

    pub(super) fn instant_say(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        if inst.text.trim().is_empty() {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::BadRequest, "missing text"));
            return;
        }
        let channel = match inst.channel.trim() {
            "" => "LOCAL".to_string(),
            raw => raw.to_ascii_uppercase(),
        };
        match channel.as_str() {
            "LOCAL" => {
                if self.rate_limited(agent, now, &inst.id, "SAY", "too many SAY") {
                    return;
                }
            }
            "CITY" => {
                let member = self
                    .orgs
                    .get(&agent.org_id)
                    .is_some_and(|org| org.is_member(&agent.id));
                if !member {
                    agent.add_event(fail_result(now, &inst.id, ErrorCode::NoPermission, "not in org"));
                    return;
                }
                if self.rate_limited(agent, now, &inst.id, "SAY", "too many SAY") {
                    return;
                }
            }
            "MARKET" => {
                if !self.cfg.flags.allow_trade {
                    agent.add_event(fail_result(
                        now,
                        &inst.id,
                        ErrorCode::NoPermission,
                        "market disabled in this world",
                    ));
                    return;
                }
                if !self.permissions_for(&agent.id, agent.pos).1.can_trade {
                    agent.add_event(fail_result(
                        now,
                        &inst.id,
                        ErrorCode::NoPermission,
                        "market chat not allowed here",
                    ));
                    return;
                }
                if self.rate_limited(agent, now, &inst.id, "SAY_MARKET", "too many SAY (MARKET)") {
                    return;
                }
            }
            _ => {
                agent.add_event(fail_result(now, &inst.id, ErrorCode::BadRequest, "invalid channel"));
                return;
            }
        }

        let chat = event(
            now,
            "CHAT",
            json!({"from": agent.id, "channel": channel, "text": inst.text}),
        );
        agent.add_event(chat.clone());
        let origin = agent.pos;
        let org_id = agent.org_id.clone();
        for other in self.agents.values_mut() {
            let hears = match channel.as_str() {
                "LOCAL" => manhattan(origin, other.pos) <= LOCAL_CHAT_RANGE,
                "CITY" => other.org_id == org_id,
                _ => true,
            };
            if hears {
                other.add_event(chat.clone());
            }
        }
        agent.add_event(ok_result(now, &inst.id, "ok"));
    }

    pub(super) fn instant_whisper(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        if self.rate_limited(agent, now, &inst.id, "WHISPER", "too many WHISPER") {
            return;
        }
        if inst.to.is_empty() || inst.text.trim().is_empty() {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::BadRequest, "missing to/text"));
            return;
        }
        let chat = event(
            now,
            "CHAT",
            json!({"from": agent.id, "channel": "WHISPER", "text": inst.text}),
        );
        match self.agents.get_mut(&inst.to) {
            Some(target) => target.add_event(chat),
            None if inst.to == agent.id => agent.add_event(chat),
            None => {
                agent.add_event(fail_result(now, &inst.id, ErrorCode::InvalidTarget, "target not found"));
                return;
            }
        }
        agent.add_event(ok_result(now, &inst.id, "ok"));
    }

    // -- vitals and memory -----------------------------------------------------

    pub(super) fn instant_eat(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        if inst.item_id.is_empty() {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::BadRequest, "missing item_id"));
            return;
        }
        let count = if inst.count <= 0 { 1 } else { inst.count };
        let Some(def) = self.catalogs.items.get(&inst.item_id) else {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::InvalidTarget, "unknown item"));
            return;
        };
        if def.kind != "FOOD" || def.edible_hunger <= 0 {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::BadRequest, "item not edible"));
            return;
        }
        let value = def.edible_hunger;
        if !agent.take_item(&inst.item_id, count) {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::NoResource, "missing food"));
            return;
        }
        for _ in 0..count {
            agent.hp += value;
            agent.hunger += (2 * value).max(1);
            agent.stamina_milli += 50 * value;
            agent.clamp();
        }
        agent.add_event(ok_result(now, &inst.id, "ok"));
    }

    pub(super) fn instant_save_memory(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        if inst.key.is_empty() {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::BadRequest, "missing key"));
            return;
        }
        if agent.memory_over_budget(&inst.key, &inst.value) {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::NoResource, "memory budget exceeded"));
            return;
        }
        agent.memory_save(&inst.key, &inst.value, inst.ttl_ticks, now);
        agent.add_event(ok_result(now, &inst.id, "ok"));
    }

    pub(super) fn instant_load_memory(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        let kvs = agent.memory_load(&inst.prefix, inst.limit, now);
        let n = kvs.len();
        agent.pending_memory = kvs;
        agent.add_event(ok_result(now, &inst.id, &format!("loaded {n} keys")));
    }

    // -- boards ----------------------------------------------------------------

    /// Checks reach and posting rights for a physical board. Returns the
    /// canonical board id.
    fn physical_board(&self, agent: &Agent, kind: &str, pos: Vec3i) -> Result<String, (ErrorCode, &'static str)> {
        if kind != "BULLETIN_BOARD" {
            return Err((ErrorCode::BadRequest, "invalid board target"));
        }
        if self.block_name_at(pos) != "BULLETIN_BOARD" {
            return Err((ErrorCode::InvalidTarget, "bulletin board not found"));
        }
        if manhattan(agent.pos, pos) > INTERACT_RANGE {
            return Err((ErrorCode::Blocked, "too far"));
        }
        if let Some(land) = self.land_at(pos) {
            if !self.is_land_member(&agent.id, land) && !land.flags.allow_trade {
                return Err((ErrorCode::NoPermission, "posting not allowed here"));
            }
        }
        Ok(positional_id("BULLETIN_BOARD", pos))
    }

    pub(super) fn instant_post_board(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        if self.rate_limited(agent, now, &inst.id, "POST_BOARD", "too many POST_BOARD") {
            return;
        }
        let mut board_id = resolve_board_id(&inst.board_id, &inst.target_id);
        if let Err(message) = validate_post(&board_id, &inst.title, &inst.body) {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::BadRequest, message));
            return;
        }
        let mut pos = agent.pos;
        if let Some((kind, board_pos)) = parse_positional_id(&board_id) {
            match self.physical_board(agent, kind, board_pos) {
                Ok(canonical) => {
                    board_id = canonical;
                    pos = board_pos;
                }
                Err((code, message)) => {
                    agent.add_event(fail_result(now, &inst.id, code, message));
                    return;
                }
            }
        }

        self.counters.post += 1;
        let post_id = format!("P{:06}", self.counters.post);
        let title = inst.title.trim().to_string();
        self.boards
            .entry(board_id.clone())
            .or_insert_with(|| Board {
                board_id: board_id.clone(),
                posts: Vec::new(),
            })
            .posts
            .push(BoardPost {
                post_id: post_id.clone(),
                author: agent.id.clone(),
                title: title.clone(),
                body: inst.body.clone(),
                tick: now,
            });
        self.audit(
            now,
            &agent.id,
            "BOARD_POST",
            pos,
            0,
            0,
            "POST_BOARD",
            Some(json!({"board_id": board_id, "post_id": post_id, "title": title})),
        );
        let mut ev = ok_result(now, &inst.id, "ok");
        ev.insert("post_id".to_string(), json!(post_id));
        agent.add_event(ev);
    }

    pub(super) fn instant_search_board(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        let mut board_id = resolve_board_id(&inst.board_id, &inst.target_id);
        if board_id.is_empty() {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::BadRequest, "missing board_id"));
            return;
        }
        let query = inst.text.trim();
        if query.is_empty() {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::BadRequest, "missing text"));
            return;
        }
        let physical = parse_positional_id(&board_id).map(|(kind, pos)| (kind.to_string(), pos));
        if let Some((kind, pos)) = &physical {
            match self.physical_board(agent, kind, *pos) {
                Ok(canonical) => board_id = canonical,
                Err((code, message)) => {
                    agent.add_event(fail_result(now, &inst.id, code, message));
                    return;
                }
            }
        }
        let limit = normalize_search_limit(inst.limit);
        let (total, results) = match self.boards.get(&board_id) {
            Some(board) => (board.posts.len(), board.search(query, limit)),
            None if physical.is_some() => (0, Vec::new()),
            None => {
                agent.add_event(fail_result(now, &inst.id, ErrorCode::InvalidTarget, "board not found"));
                return;
            }
        };
        agent.add_event(event(
            now,
            "BOARD_SEARCH",
            json!({"board_id": board_id, "query": query, "total_posts": total, "results": results}),
        ));
        agent.add_event(ok_result(now, &inst.id, "ok"));
    }

    // -- signs and switches ----------------------------------------------------

    /// Resolves a positional fixture id of `kind` within reach.
    fn fixture_in_reach(
        &self,
        agent: &Agent,
        target_id: &str,
        kind: &str,
        invalid: &'static str,
        missing: &'static str,
    ) -> Result<Vec3i, (ErrorCode, &'static str)> {
        if target_id.is_empty() {
            return Err((ErrorCode::BadRequest, "missing target_id"));
        }
        let pos = match parse_positional_id(target_id) {
            Some((k, pos)) if k == kind => pos,
            _ => return Err((ErrorCode::BadRequest, invalid)),
        };
        if self.block_name_at(pos) != kind {
            return Err((ErrorCode::InvalidTarget, missing));
        }
        if manhattan(agent.pos, pos) > INTERACT_RANGE {
            return Err((ErrorCode::Blocked, "too far"));
        }
        Ok(pos)
    }

    pub(super) fn instant_set_sign(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        let pos = match self.fixture_in_reach(agent, &inst.target_id, "SIGN", "invalid sign target", "sign not found") {
            Ok(pos) => pos,
            Err((code, message)) => {
                agent.add_event(fail_result(now, &inst.id, code, message));
                return;
            }
        };
        if inst.text.len() > MAX_SIGN_TEXT {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::BadRequest, "text too large"));
            return;
        }
        if !self.can_build_at(&agent.id, pos, now) {
            agent.adjust_rep_law(-1);
            self.deny(agent, now, &inst.id, ErrorCode::NoPermission, "sign edit denied");
            return;
        }
        self.signs.insert(
            pos,
            Sign {
                pos,
                text: inst.text.clone(),
                updated_tick: now,
                updated_by: agent.id.clone(),
            },
        );
        let sign_id = positional_id("SIGN", pos);
        self.audit(
            now,
            &agent.id,
            "SIGN_SET",
            pos,
            0,
            0,
            "SET_SIGN",
            Some(json!({"sign_id": sign_id, "text": inst.text})),
        );
        agent.add_event(ok_result(now, &inst.id, "ok"));
    }

    pub(super) fn instant_toggle_switch(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        let pos = match self.fixture_in_reach(agent, &inst.target_id, "SWITCH", "invalid switch target", "switch not found") {
            Ok(pos) => pos,
            Err((code, message)) => {
                agent.add_event(fail_result(now, &inst.id, code, message));
                return;
            }
        };
        if !self.can_build_at(&agent.id, pos, now) {
            agent.adjust_rep_law(-1);
            self.deny(agent, now, &inst.id, ErrorCode::NoPermission, "switch toggle denied");
            return;
        }
        let on = !self.switches.get(&pos).copied().unwrap_or(false);
        self.switches.insert(pos, on);
        let switch_id = positional_id("SWITCH", pos);
        self.audit(
            now,
            &agent.id,
            "SWITCH_TOGGLE",
            pos,
            0,
            0,
            "TOGGLE_SWITCH",
            Some(json!({"switch_id": switch_id, "on": on})),
        );
        agent.add_event(event(
            now,
            "SWITCH",
            json!({"switch_id": switch_id, "pos": pos.to_array(), "on": on}),
        ));
        agent.add_event(ok_result(now, &inst.id, "ok"));
    }

    // -- owed items ------------------------------------------------------------

    pub(super) fn instant_claim_owed(&mut self, agent: &mut Agent, now: u64, inst: &InstantReq) {
        if inst.terminal_id.is_empty() {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::BadRequest, "missing terminal_id"));
            return;
        }
        let Some(pos) = self.terminal_at(&inst.terminal_id) else {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::InvalidTarget, "terminal not found"));
            return;
        };
        if manhattan(agent.pos, pos) > INTERACT_RANGE {
            agent.add_event(fail_result(now, &inst.id, ErrorCode::Blocked, "too far"));
            return;
        }
        let owed = self
            .containers
            .get_mut(&pos)
            .map(|terminal| terminal.claim_owed(&agent.id))
            .unwrap_or_default();
        if owed.is_empty() {
            agent.add_event(ok_result(now, &inst.id, "nothing owed"));
            return;
        }
        for (item, n) in &owed {
            agent.add_item(item, *n);
        }
        agent.add_event(ok_result(now, &inst.id, "claimed"));
    }

    /// Position of the contract terminal named by a `CONTRACT_TERMINAL@x,y,z` id.
    pub(super) fn terminal_at(&self, terminal_id: &str) -> Option<Vec3i> {
        let (kind, pos) = parse_positional_id(terminal_id)?;
        if kind != "CONTRACT_TERMINAL" {
            return None;
        }
        self.containers
            .get(&pos)
            .filter(|c| c.kind == "CONTRACT_TERMINAL")
            .map(|_| pos)
    }
}
