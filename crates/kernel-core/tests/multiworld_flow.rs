use std::sync::Arc;

use contracts::{ActMsg, InstantReq};
use kernel_core::orgs::merge_org_snapshots;
use kernel_core::{ActionEnvelope, Catalogs, JoinRequest, Vec3i, World, WorldConfig};
use serde_json::json;

fn world(id: &str, seed: i64) -> World {
    let cfg = WorldConfig {
        world_id: id.to_string(),
        seed,
        ..WorldConfig::default()
    };
    let catalogs = Arc::new(Catalogs::builtin(&cfg));
    World::new(cfg, catalogs).expect("world")
}

fn create_org(world: &mut World, agent_id: &str, name: &str) {
    let act = ActMsg {
        msg_type: "ACT".to_string(),
        protocol_version: "1.1".to_string(),
        tick: world.tick(),
        agent_id: agent_id.to_string(),
        instants: vec![InstantReq {
            id: "I1".to_string(),
            kind: "CREATE_ORG".to_string(),
            org_kind: "GUILD".to_string(),
            org_name: name.to_string(),
            ..InstantReq::default()
        }],
        ..ActMsg::default()
    };
    world.step(vec![ActionEnvelope {
        agent_id: agent_id.to_string(),
        act,
    }]);
}

#[test]
fn agent_round_trips_between_two_worlds() {
    let mut overworld = world("OVERWORLD", 1);
    let mut mine = world("MINE_L1", 2);
    let id = overworld
        .join(JoinRequest {
            new_token: "tok".to_string(),
            ..JoinRequest::default()
        })
        .agent_id;
    overworld.step(Vec::new());
    let coal = overworld.agent(&id).map(|a| a.count("COAL")).expect("agent");

    let record = overworld.transfer_out(&id, "MINE_L1").expect("leave overworld");
    mine.transfer_in(record, Some(Vec3i::new(0, 0, 0)), Some(false))
        .expect("enter mine");
    let out = mine.step(Vec::new());
    let obs = out
        .observations
        .iter()
        .find(|obs| obs.agent_id == id)
        .expect("observed in the mine");
    assert_eq!(obs.world_id, "MINE_L1");
    assert!(obs
        .events
        .iter()
        .any(|e| e.get("type") == Some(&json!("WORLD_SWITCH"))));

    let record = mine.transfer_out(&id, "OVERWORLD").expect("leave mine");
    overworld.transfer_in(record, None, None).expect("back home");
    assert_eq!(overworld.agent(&id).map(|a| a.count("COAL")), Some(coal));
    assert_eq!(mine.agent_count(), 0);
}

#[test]
fn org_metadata_converges_across_worlds() {
    let mut overworld = world("OVERWORLD", 1);
    let mut mine = world("MINE_L1", 2);
    let founder = overworld.join(JoinRequest::default()).agent_id;
    create_org(&mut overworld, &founder, "Lanterns");
    let org_id = overworld
        .agent(&founder)
        .map(|a| a.org_id.clone())
        .expect("founder");
    assert!(!org_id.is_empty());

    let merged = merge_org_snapshots(&[overworld.org_snapshot().orgs, mine.org_snapshot().orgs]);
    mine.apply_org_meta(&merged);
    overworld.apply_org_meta(&merged);

    let remote = mine.org(&org_id).expect("org replicated");
    assert_eq!(remote.name, "Lanterns");
    assert!(remote.is_admin(&founder));

    // A new org in the mine must not reuse the replicated id.
    let local = mine
        .join(JoinRequest {
            agent_id: Some("A2".to_string()),
            ..JoinRequest::default()
        })
        .agent_id;
    assert_eq!(local, "A2");
    create_org(&mut mine, &local, "Diggers");
    let local_org = mine.agent(&local).map(|a| a.org_id.clone()).expect("agent");
    assert!(!local_org.is_empty());
    assert_ne!(local_org, org_id);
}
