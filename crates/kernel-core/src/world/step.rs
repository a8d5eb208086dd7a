use contracts::{InstantReq, TaskReq};

use super::*;
use crate::{Phase, PHASE_ORDER};

/// ACTs older than this many ticks are rejected as stale.
const MAX_ACT_AGE: u64 = 2;

type InstantHandler = fn(&mut World, &mut Agent, u64, &InstantReq);
type TaskHandler = fn(&mut World, &mut Agent, u64, &TaskReq);

impl World {
    /// Advances the world by exactly one tick. `actions` are applied in delivery
    /// order; joins, leaves and transfers must already have been applied at the
    /// preceding tick boundary.
    pub fn step(&mut self, actions: Vec<ActionEnvelope>) -> StepOutput {
        let now = self.tick + 1;
        let season = self.cfg.season_length_ticks;
        let season_archive = (season > 0 && now % season == 0).then(|| {
            let archived = self.export_snapshot();
            self.season_rollover(now);
            archived
        });
        self.maybe_reset_notice(now);

        for phase in PHASE_ORDER {
            match phase {
                Phase::Actions => {
                    for envelope in &actions {
                        self.apply_act(now, envelope);
                    }
                }
                Phase::Movement => self.system_movement(now),
                Phase::Work => self.system_work(now),
                Phase::Conveyors => self.system_conveyors(now),
                Phase::Survival => self.system_survival(now),
                Phase::Governance => {
                    self.tick_claims_maintenance(now);
                    self.tick_laws(now);
                    self.tick_contracts(now);
                }
                Phase::Director => {
                    self.system_director(now);
                    self.system_fun(now);
                }
            }
        }

        let observations = self.build_observations(now);
        self.tick = now;
        let digest = self.state_digest();
        let log = TickLogEntry {
            tick: now,
            joins: std::mem::take(&mut self.pending_joins),
            leaves: std::mem::take(&mut self.pending_leaves),
            actions,
            digest,
        };
        let audits = std::mem::take(&mut self.audits);
        let every = self.cfg.snapshot_every_ticks;
        let snapshot = (every > 0 && now % every == 0).then(|| self.export_snapshot());
        StepOutput {
            tick: now,
            log,
            audits,
            observations,
            snapshot,
            season_archive,
        }
    }

    // ---------------------------------------------------------------------------
    // ACT application
    // ---------------------------------------------------------------------------

    pub(super) fn apply_act(&mut self, now: u64, envelope: &ActionEnvelope) {
        let Some(mut agent) = self.agents.remove(&envelope.agent_id) else {
            tracing::debug!(world_id = %self.cfg.world_id, agent_id = %envelope.agent_id, "act for unknown agent dropped");
            return;
        };
        let act = &envelope.act;
        if act.tick + MAX_ACT_AGE < now || act.tick > now {
            agent.add_event(fail_result(now, "ACT", ErrorCode::Stale, "act tick out of range"));
        } else {
            for task_id in &act.cancel {
                self.cancel_task(&mut agent, now, task_id);
            }
            for inst in &act.instants {
                match instant_handler(inst.kind.as_str()) {
                    Some(handler) => handler(self, &mut agent, now, inst),
                    None if inst.kind == "SWITCH_WORLD" => {}
                    None => agent.add_event(fail_result(
                        now,
                        &inst.id,
                        ErrorCode::BadRequest,
                        "unknown instant type",
                    )),
                }
            }
            for req in &act.tasks {
                match task_handler(req.kind.as_str()) {
                    Some(handler) => handler(self, &mut agent, now, req),
                    None => agent.add_event(fail_result(
                        now,
                        &req.id,
                        ErrorCode::BadRequest,
                        "unknown task type",
                    )),
                }
            }
        }
        self.agents.insert(agent.id.clone(), agent);
    }

    fn cancel_task(&mut self, agent: &mut Agent, now: u64, task_id: &str) {
        if agent.move_task.as_ref().is_some_and(|t| t.task_id == task_id) {
            agent.move_task = None;
            agent.add_event(ok_result(now, task_id, "canceled"));
            return;
        }
        if agent.work_task.as_ref().is_some_and(|t| t.task_id == task_id) {
            agent.work_task = None;
            agent.add_event(ok_result(now, task_id, "canceled"));
            return;
        }
        agent.add_event(fail_result(now, task_id, ErrorCode::InvalidTarget, "task not found"));
    }
}

// ---------------------------------------------------------------------------
// Dispatch tables
// ---------------------------------------------------------------------------

/// SWITCH_WORLD is resolved by the world manager before an ACT reaches the world.
fn instant_handler(kind: &str) -> Option<InstantHandler> {
    let handler: InstantHandler = match kind {
        "SAY" => World::instant_say,
        "WHISPER" => World::instant_whisper,
        "EAT" => World::instant_eat,
        "SAVE_MEMORY" => World::instant_save_memory,
        "LOAD_MEMORY" => World::instant_load_memory,
        "POST_BOARD" => World::instant_post_board,
        "SEARCH_BOARD" => World::instant_search_board,
        "SET_SIGN" => World::instant_set_sign,
        "TOGGLE_SWITCH" => World::instant_toggle_switch,
        "CLAIM_OWED" => World::instant_claim_owed,
        "OFFER_TRADE" => World::instant_offer_trade,
        "ACCEPT_TRADE" => World::instant_accept_trade,
        "DECLINE_TRADE" => World::instant_decline_trade,
        "POST_CONTRACT" => World::instant_post_contract,
        "ACCEPT_CONTRACT" => World::instant_accept_contract,
        "SUBMIT_CONTRACT" => World::instant_submit_contract,
        "SET_PERMISSIONS" => World::instant_set_permissions,
        "UPGRADE_CLAIM" => World::instant_upgrade_claim,
        "ADD_MEMBER" => World::instant_add_member,
        "REMOVE_MEMBER" => World::instant_remove_member,
        "DEED_LAND" => World::instant_deed_land,
        "CREATE_ORG" => World::instant_create_org,
        "JOIN_ORG" => World::instant_join_org,
        "ORG_DEPOSIT" => World::instant_org_deposit,
        "ORG_WITHDRAW" => World::instant_org_withdraw,
        "LEAVE_ORG" => World::instant_leave_org,
        "PROPOSE_LAW" => World::instant_propose_law,
        "VOTE" => World::instant_vote,
        _ => return None,
    };
    Some(handler)
}

fn task_handler(kind: &str) -> Option<TaskHandler> {
    let handler: TaskHandler = match kind {
        "STOP" => World::task_stop,
        "MOVE_TO" => World::task_move_to,
        "FOLLOW" => World::task_follow,
        "MINE" => World::task_mine,
        "GATHER" => World::task_gather,
        "PLACE" => World::task_place,
        "OPEN" => World::task_open,
        "TRANSFER" => World::task_transfer,
        "CRAFT" => World::task_craft,
        "SMELT" => World::task_smelt,
        "BUILD_BLUEPRINT" => World::task_build_blueprint,
        "CLAIM_LAND" => World::task_claim_land,
        _ => return None,
    };
    Some(handler)
}
