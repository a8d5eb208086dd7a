use contracts::{InstantReq, TaskReq};

use super::*;

fn config(seed: i64) -> WorldConfig {
    WorldConfig {
        world_id: "OVERWORLD".to_string(),
        seed,
        snapshot_every_ticks: 5,
        ..WorldConfig::default()
    }
}

fn new_world(seed: i64) -> World {
    let cfg = config(seed);
    let catalogs = Arc::new(Catalogs::builtin(&cfg));
    World::new(cfg, catalogs).expect("world")
}

fn act(agent_id: &str, tick: u64) -> ActMsg {
    ActMsg {
        msg_type: "ACT".to_string(),
        protocol_version: "1.1".to_string(),
        tick,
        agent_id: agent_id.to_string(),
        ..ActMsg::default()
    }
}

fn envelope(act: ActMsg) -> ActionEnvelope {
    ActionEnvelope {
        agent_id: act.agent_id.clone(),
        act,
    }
}

fn say(id: &str, text: &str) -> InstantReq {
    InstantReq {
        id: id.to_string(),
        kind: "SAY".to_string(),
        text: text.to_string(),
        ..InstantReq::default()
    }
}

fn obs_events<'a>(out: &'a StepOutput, agent_id: &str) -> Vec<&'a Event> {
    out.observations
        .iter()
        .filter(|obs| obs.agent_id == agent_id)
        .flat_map(|obs| obs.events.iter())
        .collect()
}

fn result_for<'a>(events: &[&'a Event], ref_id: &str) -> Option<&'a Event> {
    events.iter().copied().find(|e| {
        e.get("type") == Some(&json!("ACTION_RESULT")) && e.get("ref") == Some(&json!(ref_id))
    })
}

#[test]
fn new_world_rejects_a_second_layer() {
    let mut cfg = config(1);
    cfg.height = 2;
    let catalogs = Arc::new(Catalogs::builtin(&config(1)));
    assert!(World::new(cfg, catalogs).is_err());
}

#[test]
fn identical_inputs_give_identical_digests() {
    let run = || {
        let mut world = new_world(42);
        let a = world.join(JoinRequest::default()).agent_id;
        let b = world.join(JoinRequest::default()).agent_id;
        let mut digests = Vec::new();
        for tick in 1..=12 {
            let mut msg = act(&a, tick - 1);
            if tick % 3 == 0 {
                msg.instants.push(say(&format!("I{tick}"), "hello"));
            }
            let mut other = act(&b, tick - 1);
            if tick == 2 {
                other.tasks.push(TaskReq {
                    id: "K1".to_string(),
                    kind: "MOVE_TO".to_string(),
                    target: [6, 0, -6],
                    ..TaskReq::default()
                });
            }
            let out = world.step(vec![envelope(msg), envelope(other)]);
            digests.push(out.log.digest);
        }
        digests
    };
    assert_eq!(run(), run());
}

#[test]
fn different_seeds_diverge() {
    let mut a = new_world(1);
    let mut b = new_world(2);
    a.join(JoinRequest::default());
    b.join(JoinRequest::default());
    assert_ne!(a.step(Vec::new()).log.digest, b.step(Vec::new()).log.digest);
}

#[test]
fn tick_log_records_joins_leaves_and_actions() {
    let mut world = new_world(3);
    let id = world
        .join(JoinRequest {
            name: "scout".to_string(),
            ..JoinRequest::default()
        })
        .agent_id;
    let out = world.step(vec![envelope(act(&id, 0))]);
    assert_eq!(out.tick, 1);
    assert_eq!(out.log.joins, vec![JoinLog { agent_id: id.clone(), name: "scout".to_string() }]);
    assert_eq!(out.log.actions.len(), 1);
    assert_eq!(out.log.digest.len(), 64);

    world.leave(&id);
    let out = world.step(Vec::new());
    assert_eq!(out.log.leaves, vec![id.clone()]);
    assert!(out.log.joins.is_empty());
    // Detached agents stay in the world.
    assert!(world.agent(&id).is_some());
    assert!(out.observations.is_empty());
}

#[test]
fn snapshots_follow_the_cadence() {
    let mut world = new_world(4);
    let ticks = (1..=10)
        .filter_map(|_| world.step(Vec::new()).snapshot.map(|snap| snap.tick()))
        .collect::<Vec<_>>();
    assert_eq!(ticks, vec![5, 10]);
}

#[test]
fn stale_and_future_acts_are_rejected() {
    let mut world = new_world(5);
    let id = world.join(JoinRequest::default()).agent_id;
    for _ in 0..5 {
        world.step(Vec::new());
    }
    let mut stale = act(&id, 1);
    stale.instants.push(say("S1", "late"));
    let out = world.step(vec![envelope(stale)]);
    let events = obs_events(&out, &id);
    let result = result_for(&events, "ACT").expect("stale result");
    assert_eq!(result.get("code"), Some(&json!("E_STALE")));
    assert!(result_for(&events, "S1").is_none());

    let future = act(&id, 99);
    let out = world.step(vec![envelope(future)]);
    let events = obs_events(&out, &id);
    assert!(result_for(&events, "ACT").is_some());
}

#[test]
fn unknown_request_types_are_bad_requests() {
    let mut world = new_world(6);
    let id = world.join(JoinRequest::default()).agent_id;
    let mut msg = act(&id, 0);
    msg.instants.push(InstantReq {
        id: "I1".to_string(),
        kind: "DANCE".to_string(),
        ..InstantReq::default()
    });
    msg.tasks.push(TaskReq {
        id: "K1".to_string(),
        kind: "FLY".to_string(),
        ..TaskReq::default()
    });
    let out = world.step(vec![envelope(msg)]);
    let events = obs_events(&out, &id);
    for ref_id in ["I1", "K1"] {
        let result = result_for(&events, ref_id).expect("result");
        assert_eq!(result.get("code"), Some(&json!("E_BAD_REQUEST")));
    }
}

#[test]
fn switch_world_is_left_to_the_manager() {
    let mut world = new_world(7);
    let id = world.join(JoinRequest::default()).agent_id;
    let mut msg = act(&id, 0);
    msg.instants.push(InstantReq {
        id: "W1".to_string(),
        kind: "SWITCH_WORLD".to_string(),
        target_world_id: "MINE_L1".to_string(),
        ..InstantReq::default()
    });
    let out = world.step(vec![envelope(msg)]);
    assert!(result_for(&obs_events(&out, &id), "W1").is_none());
}

#[test]
fn cancel_clears_a_running_task() {
    let mut world = new_world(8);
    let id = world.join(JoinRequest::default()).agent_id;
    let mut msg = act(&id, 0);
    msg.tasks.push(TaskReq {
        id: "K1".to_string(),
        kind: "MOVE_TO".to_string(),
        target: [200, 0, 200],
        ..TaskReq::default()
    });
    world.step(vec![envelope(msg)]);
    let task_id = world
        .agent(&id)
        .and_then(|a| a.move_task.as_ref())
        .map(|t| t.task_id.clone())
        .expect("task started");

    let mut msg = act(&id, 1);
    msg.cancel = vec![task_id.clone(), "T999999".to_string()];
    let out = world.step(vec![envelope(msg)]);
    let events = obs_events(&out, &id);
    assert_eq!(result_for(&events, &task_id).and_then(|e| e.get("ok")), Some(&json!(true)));
    assert_eq!(
        result_for(&events, "T999999").and_then(|e| e.get("code")),
        Some(&json!("E_INVALID_TARGET"))
    );
    assert!(world.agent(&id).is_some_and(|a| a.move_task.is_none()));
}

#[test]
fn second_movement_task_conflicts() {
    let mut world = new_world(9);
    let id = world.join(JoinRequest::default()).agent_id;
    let mut msg = act(&id, 0);
    for task_ref in ["K1", "K2"] {
        msg.tasks.push(TaskReq {
            id: task_ref.to_string(),
            kind: "MOVE_TO".to_string(),
            target: [100, 0, 100],
            ..TaskReq::default()
        });
    }
    let out = world.step(vec![envelope(msg)]);
    let events = obs_events(&out, &id);
    assert_eq!(result_for(&events, "K1").and_then(|e| e.get("ok")), Some(&json!(true)));
    assert_eq!(
        result_for(&events, "K2").and_then(|e| e.get("code")),
        Some(&json!("E_CONFLICT"))
    );
}

#[test]
fn move_to_walks_a_cleared_path() {
    let mut world = new_world(10);
    let id = world.join(JoinRequest::default()).agent_id;
    let start = world.agent(&id).map(|a| a.pos).expect("agent");
    for dx in 0..=4 {
        world.set_block_named(start.offset(dx, 0), "AIR");
    }
    let mut msg = act(&id, 0);
    msg.tasks.push(TaskReq {
        id: "K1".to_string(),
        kind: "MOVE_TO".to_string(),
        target: start.offset(4, 0).to_array(),
        ..TaskReq::default()
    });
    let mut done = false;
    let mut actions = vec![envelope(msg)];
    for _ in 0..10 {
        let out = world.step(std::mem::take(&mut actions));
        done |= obs_events(&out, &id)
            .iter()
            .any(|e| e.get("type") == Some(&json!("TASK_DONE")));
    }
    assert!(done);
    assert_eq!(world.agent(&id).map(|a| a.pos), Some(start.offset(4, 0)));
}

#[test]
fn local_chat_reaches_nearby_agents() {
    let mut world = new_world(11);
    let a = world.join(JoinRequest::default()).agent_id;
    let b = world.join(JoinRequest::default()).agent_id;
    let mut msg = act(&a, 0);
    msg.instants.push(say("I1", "over here"));
    let out = world.step(vec![envelope(msg)]);
    let heard = obs_events(&out, &b)
        .iter()
        .any(|e| e.get("type") == Some(&json!("CHAT")) && e.get("text") == Some(&json!("over here")));
    assert!(heard);
}

#[test]
fn resume_token_reattaches_the_same_agent() {
    let mut world = new_world(12);
    let first = world.join(JoinRequest {
        new_token: "t1".to_string(),
        ..JoinRequest::default()
    });
    world.leave(&first.agent_id);
    let again = world.join(JoinRequest {
        resume_token: Some("t1".to_string()),
        new_token: "t2".to_string(),
        ..JoinRequest::default()
    });
    assert!(again.resumed);
    assert_eq!(again.agent_id, first.agent_id);
    assert_eq!(world.agent_for_token("t2"), Some(first.agent_id.as_str()));
    assert_eq!(world.agent_for_token("t1"), None);

    let fresh = world.join(JoinRequest {
        resume_token: Some("bogus".to_string()),
        ..JoinRequest::default()
    });
    assert!(!fresh.resumed);
    assert_ne!(fresh.agent_id, first.agent_id);
}

#[test]
fn actions_for_unknown_agents_are_dropped() {
    let mut world = new_world(13);
    let out = world.step(vec![envelope(act("A404", 0))]);
    assert_eq!(out.tick, 1);
    assert_eq!(world.agent_count(), 0);
}

/// Runs `ticks` empty steps (after `first`) and gathers the agent's OBS events.
fn run_collecting(world: &mut World, agent_id: &str, first: Vec<ActionEnvelope>, ticks: usize) -> Vec<Event> {
    let mut actions = first;
    let mut events = Vec::new();
    for _ in 0..ticks {
        let out = world.step(std::mem::take(&mut actions));
        events.extend(obs_events(&out, agent_id).into_iter().cloned());
    }
    events
}

fn typed<'a>(events: &'a [Event], kind: &str) -> Option<&'a Event> {
    events.iter().find(|e| e.get("type") == Some(&json!(kind)))
}

/// A city owning a radius-2 claim three cells east of the agent, with a clear
/// corridor leading into it. Returns the agent id and its start cell.
fn city_gate(seed: i64, rep_law: i32, member: bool) -> (World, String, Vec3i) {
    let mut world = new_world(seed);
    let id = world.join(JoinRequest::default()).agent_id;
    let start = world.agent(&id).map(|a| a.pos).expect("agent");
    for dx in 1..=6 {
        world.set_block_named(start.offset(dx, 0), "AIR");
    }
    let mut city = Organization::new("ORG000009".to_string(), crate::orgs::KIND_CITY, "Harbor".to_string(), 0);
    if member {
        city.members.insert(id.clone(), crate::orgs::ROLE_MEMBER.to_string());
    }
    world.orgs.insert(city.org_id.clone(), city);
    let land = LandClaim::new(
        "LAND_ORG000009_001".to_string(),
        "ORG000009".to_string(),
        crate::claims::CLAIM_TYPE_CITY_CORE,
        start.offset(5, 0),
        2,
    );
    world.claims.insert(land.land_id.clone(), land);
    if let Some(agent) = world.agent_mut(&id) {
        agent.rep_law = rep_law;
    }
    (world, id, start)
}

fn walk_east(id: &str, start: Vec3i) -> ActionEnvelope {
    let mut msg = act(id, 0);
    msg.tasks.push(TaskReq {
        id: "K1".to_string(),
        kind: "MOVE_TO".to_string(),
        target: start.offset(6, 0).to_array(),
        ..TaskReq::default()
    });
    envelope(msg)
}

#[test]
fn wanted_outsider_is_stopped_at_the_city_core() {
    let (mut world, id, start) = city_gate(21, 150, false);
    let events = run_collecting(&mut world, &id, vec![walk_east(&id, start)], 30);
    let fail = typed(&events, "TASK_FAIL").expect("entry refused");
    assert_eq!(fail.get("code"), Some(&json!("E_NO_PERMISSION")));
    assert!(typed(&events, "TASK_DONE").is_none());
    assert_eq!(world.agent(&id).map(|a| a.pos), Some(start.offset(2, 0)));
}

#[test]
fn members_and_reputable_visitors_enter_the_city_core() {
    for (seed, rep_law, member) in [(22, 150, true), (23, 500, false)] {
        let (mut world, id, start) = city_gate(seed, rep_law, member);
        let events = run_collecting(&mut world, &id, vec![walk_east(&id, start)], 30);
        assert!(typed(&events, "TASK_FAIL").is_none(), "seed {seed}");
        assert!(typed(&events, "TASK_DONE").is_some(), "seed {seed}");
        assert_eq!(world.agent(&id).map(|a| a.pos), Some(start.offset(6, 0)));
    }
}

#[test]
fn mining_stone_leaves_air_and_drops_the_block() {
    let mut world = new_world(24);
    let id = world.join(JoinRequest::default()).agent_id;
    let start = world.agent(&id).map(|a| a.pos).expect("agent");
    let target = start.offset(1, 0);
    world.set_block_named(target, "STONE");

    let mut msg = act(&id, 0);
    msg.tasks.push(TaskReq {
        id: "K1".to_string(),
        kind: "MINE".to_string(),
        block_pos: target.to_array(),
        ..TaskReq::default()
    });
    let events = run_collecting(&mut world, &id, vec![envelope(msg)], 30);
    let done = typed(&events, "TASK_DONE").expect("mined");
    assert_eq!(done.get("kind"), Some(&json!("MINE")));
    assert_eq!(world.block_at(target), "AIR");
    let drops = world
        .item_entities()
        .filter(|e| e.pos == target)
        .map(|e| (e.item.as_str(), e.count))
        .collect::<Vec<_>>();
    assert_eq!(drops, vec![("STONE", 1)]);
}

#[test]
fn say_flood_hits_the_rate_limit() {
    let mut world = new_world(25);
    let id = world.join(JoinRequest::default()).agent_id;
    let mut msg = act(&id, 0);
    for n in 1..=6 {
        msg.instants.push(say(&format!("S{n}"), "spam"));
    }
    let out = world.step(vec![envelope(msg)]);
    let events = obs_events(&out, &id);
    for n in 1..=5 {
        let code = result_for(&events, &format!("S{n}")).and_then(|e| e.get("code"));
        assert_ne!(code, Some(&json!("E_RATE_LIMIT")), "S{n}");
    }
    let limited = result_for(&events, "S6").expect("limited");
    assert_eq!(limited.get("code"), Some(&json!("E_RATE_LIMIT")));
    let cooldown = limited.get("cooldown_ticks").and_then(Value::as_u64).expect("cooldown");
    assert!(cooldown > 0);
}

/// An eastbound belt with a chest behind it, on cleared ground.
fn belt_line(world: &mut World, belt: Vec3i) -> Vec3i {
    for dz in -2..=2 {
        for dx in -2..=3 {
            world.set_block_named(belt.offset(dx, dz), "AIR");
        }
    }
    let chest_pos = belt.offset(-1, 0);
    world.set_block_named(belt, "CONVEYOR");
    world.conveyors.insert(belt, ConveyorMeta::from_dir(1, 0));
    world.set_block_named(chest_pos, "CHEST");
    let mut chest = Container::new("CHEST", chest_pos);
    chest.add("COAL", 2);
    world.containers.insert(chest_pos, chest);
    chest_pos
}

fn stacks_at(world: &World, pos: Vec3i) -> i32 {
    world
        .item_entities()
        .filter(|e| e.pos == pos)
        .map(|e| e.count)
        .sum()
}

#[test]
fn belt_pulls_from_the_chest_and_carries_items_forward() {
    let mut world = new_world(26);
    let belt = Vec3i::new(40, 0, 40);
    let chest_pos = belt_line(&mut world, belt);

    world.step(Vec::new());
    assert_eq!(stacks_at(&world, belt), 1);
    assert_eq!(world.container(chest_pos).map(|c| c.count("COAL")), Some(1));

    world.step(Vec::new());
    assert_eq!(stacks_at(&world, belt.offset(1, 0)), 1);
    assert_eq!(stacks_at(&world, belt), 1);
    assert_eq!(world.container(chest_pos).map(|c| c.count("COAL")), Some(0));
}

#[test]
fn switch_and_sensor_gate_the_belt() {
    let mut world = new_world(27);
    let belt = Vec3i::new(40, 0, 40);
    let chest_pos = belt_line(&mut world, belt);
    let switch = belt.offset(0, -1);
    world.set_block_named(switch, "SWITCH");

    world.step(Vec::new());
    assert_eq!(stacks_at(&world, belt), 0);
    assert_eq!(world.container(chest_pos).map(|c| c.count("COAL")), Some(2));

    world.switches.insert(switch, true);
    world.step(Vec::new());
    assert_eq!(stacks_at(&world, belt), 1);

    let mut world = new_world(28);
    let chest_pos = belt_line(&mut world, belt);
    let sensor = belt.offset(0, 1);
    world.set_block_named(sensor, "SENSOR");
    world.step(Vec::new());
    assert_eq!(stacks_at(&world, belt), 0);

    world.spawn_item_entity(world.tick(), "WORLD", sensor.offset(0, 1), "STONE", 1, "TEST");
    assert!(world.sensor_on(sensor));
    world.step(Vec::new());
    assert_eq!(stacks_at(&world, belt), 1);
    assert_eq!(world.container(chest_pos).map(|c| c.count("COAL")), Some(1));
}

#[test]
fn item_cell_index_follows_spawns_moves_and_restores() {
    let mut world = new_world(29);
    let a = Vec3i::new(30, 0, 30);
    let b = a.offset(1, 0);
    let first = world.spawn_item_entity(0, "WORLD", a, "COAL", 1, "TEST").expect("spawn");
    let merged = world.spawn_item_entity(0, "WORLD", a, "COAL", 2, "TEST").expect("merge");
    assert_eq!(first, merged);
    let other = world.spawn_item_entity(0, "WORLD", a, "STONE", 1, "TEST").expect("spawn");
    assert_eq!(world.item_ids_at(a), vec![first.clone(), other.clone()]);

    world.move_item_entity(0, &first, b, "TEST");
    assert_eq!(world.item_ids_at(a), vec![other.clone()]);
    assert_eq!(world.item_ids_at(b), vec![first.clone()]);

    world.remove_item_entity(0, "WORLD", &other, "TEST");
    assert!(world.item_ids_at(a).is_empty());
    assert!(world.items_at.get(&a).is_none());

    let restored = World::from_snapshot(world.export_snapshot(), Arc::clone(world.catalogs())).expect("restore");
    assert_eq!(restored.item_ids_at(b), vec![first]);
    assert_eq!(restored.items_on(b).map(|e| e.count).sum::<i32>(), 3);
}
