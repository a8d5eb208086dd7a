use super::*;

use crate::config::MultiWorldConfig;
use crate::manager::ManagerOptions;
use contracts::{InstantReq, PROTOCOL_VERSION_1_0};
use serde_json::Value;

fn manager() -> Arc<WorldManager> {
    WorldManager::start(
        MultiWorldConfig::default(),
        ManagerOptions {
            seed: 7,
            ..ManagerOptions::default()
        },
    )
    .expect("manager")
}

async fn session(manager: &WorldManager, version: &'static str) -> Session {
    attach(manager, version, "").await.0
}

/// Joins (or resumes with `resume_token`) and returns the session plus the
/// token for the next resume.
async fn attach(manager: &WorldManager, version: &'static str, resume_token: &str) -> (Session, String) {
    let outbound = Outbound::new(16);
    let session_id = mint_id("sess_", 16);
    let joined = manager
        .join(JoinParams {
            name: "tester".to_string(),
            delta_voxels: false,
            resume_token: resume_token.to_string(),
            world_preference: String::new(),
            session_id: session_id.clone(),
            protocol_version: version.to_string(),
            outbound: outbound.clone(),
        })
        .await
        .expect("join");
    let session = Session {
        agent_id: joined.agent_id,
        session_id,
        protocol_version: version,
        outbound,
        acks: AckCache::default(),
    };
    (session, joined.resume_token)
}

/// Next queued frame of `kind`, skipping OBS.
async fn next_frame(outbound: &Outbound, kind: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = outbound.recv().await.expect("open outbound");
            let value: Value = serde_json::from_str(&frame.text).expect("json frame");
            if value.get("type").and_then(Value::as_str) == Some(kind) {
                return value;
            }
        }
    })
    .await
    .expect("frame in time")
}

fn act_text(act_id: &str, expected_world: &str) -> String {
    let act = ActMsg {
        msg_type: MSG_ACT.to_string(),
        protocol_version: PROTOCOL_VERSION_1_1.to_string(),
        act_id: act_id.to_string(),
        based_on_obs_id: "obs-1".to_string(),
        expected_world_id: expected_world.to_string(),
        instants: vec![InstantReq {
            id: "I1".to_string(),
            kind: "SAY".to_string(),
            channel: "LOCAL".to_string(),
            text: "hello".to_string(),
            ..InstantReq::default()
        }],
        ..ActMsg::default()
    };
    serde_json::to_string(&act).expect("encode")
}

#[test]
fn act_validation_depends_on_session_version() {
    let mut act = ActMsg {
        protocol_version: PROTOCOL_VERSION_1_1.to_string(),
        ..ActMsg::default()
    };
    assert_eq!(validate_act(&act, PROTOCOL_VERSION_1_0), Ok(()));
    assert_eq!(validate_act(&act, PROTOCOL_VERSION_1_1), Err("missing act_id"));

    act.act_id = "a1".to_string();
    assert_eq!(validate_act(&act, PROTOCOL_VERSION_1_1), Err("missing based_on_obs_id"));

    act.based_on_obs_id = "o1".to_string();
    assert_eq!(validate_act(&act, PROTOCOL_VERSION_1_1), Ok(()));

    act.cancel.push("T1".to_string());
    assert_eq!(
        validate_act(&act, PROTOCOL_VERSION_1_1),
        Err("expected_world_id required for mutating ACT")
    );

    act.protocol_version = "2.0".to_string();
    assert_eq!(validate_act(&act, PROTOCOL_VERSION_1_0), Err("unsupported protocol_version"));
}

#[test]
fn ack_cache_starts_over_when_full() {
    let mut cache = AckCache::default();
    let ack = |id: usize| AckMsg {
        msg_type: MSG_ACK.to_string(),
        protocol_version: PROTOCOL_VERSION_1_1.to_string(),
        ack_for: format!("act-{id}"),
        accepted: true,
        code: String::new(),
        message: String::new(),
        server_tick: id as u64,
        world_id: "OVERWORLD".to_string(),
    };
    for id in 0..ACK_CACHE_CAPACITY {
        cache.remember(ack(id));
    }
    assert_eq!(cache.len(), ACK_CACHE_CAPACITY);
    cache.remember(ack(5));
    assert_eq!(cache.len(), ACK_CACHE_CAPACITY);

    cache.remember(ack(ACK_CACHE_CAPACITY));
    assert_eq!(cache.len(), 1);
    assert!(cache.get("act-0").is_none());
    assert_eq!(
        cache.get(&format!("act-{ACK_CACHE_CAPACITY}")).map(|a| a.server_tick),
        Some(ACK_CACHE_CAPACITY as u64)
    );
}

#[test]
fn event_batch_limits_are_clamped() {
    assert_eq!(event_batch_limit(0), DEFAULT_EVENT_BATCH_LIMIT);
    assert_eq!(event_batch_limit(25), 25);
    assert_eq!(event_batch_limit(50_000), MAX_EVENT_BATCH_LIMIT);
}

#[test]
fn admin_requires_loopback_peer() {
    assert!(require_loopback("127.0.0.1:9000".parse().expect("addr")).is_ok());
    assert!(require_loopback("[::1]:9000".parse().expect("addr")).is_ok());
    let remote = require_loopback("10.1.2.3:9000".parse().expect("addr")).expect_err("remote");
    assert_eq!(remote.status, StatusCode::FORBIDDEN);
}

#[test]
fn raw_act_id_survives_bad_payloads() {
    assert_eq!(raw_act_id(r#"{"type":"ACT","act_id":"x9","tick":"soon"}"#), "x9");
    assert_eq!(raw_act_id("not json"), "");
}

#[tokio::test]
async fn retried_act_gets_the_same_ack() {
    let manager = manager();
    let mut session = session(&manager, PROTOCOL_VERSION_1_1).await;

    session.handle_text(&manager, &act_text("act-1", "OVERWORLD")).await;
    let first = next_frame(&session.outbound, MSG_ACK).await;
    assert_eq!(first.get("ack_for"), Some(&json!("act-1")));
    assert_eq!(first.get("accepted"), Some(&json!(true)));
    assert_eq!(first.get("world_id"), Some(&json!("OVERWORLD")));

    tokio::time::sleep(Duration::from_millis(450)).await;
    session.handle_text(&manager, &act_text("act-1", "OVERWORLD")).await;
    let retry = next_frame(&session.outbound, MSG_ACK).await;
    assert_eq!(retry, first);

    session.handle_text(&manager, &act_text("", "OVERWORLD")).await;
    let missing = next_frame(&session.outbound, MSG_ACK).await;
    assert_eq!(missing.get("accepted"), Some(&json!(false)));
    assert_eq!(missing.get("code"), Some(&json!("E_PROTO_BAD_REQUEST")));
    assert_eq!(missing.get("message"), Some(&json!("missing act_id")));
    manager.shutdown().await;
}

#[tokio::test]
async fn act_retried_after_resume_is_not_applied_twice() {
    let manager = manager();
    let (mut first, token) = attach(&manager, PROTOCOL_VERSION_1_1, "").await;
    first.handle_text(&manager, &act_text("act-r", "OVERWORLD")).await;
    let original = next_frame(&first.outbound, MSG_ACK).await;
    assert_eq!(original.get("accepted"), Some(&json!(true)));

    tokio::time::sleep(Duration::from_millis(450)).await;
    let (mut second, _) = attach(&manager, PROTOCOL_VERSION_1_1, &token).await;
    assert_eq!(second.agent_id, first.agent_id);
    assert_eq!(second.acks.len(), 0);
    second.handle_text(&manager, &act_text("act-r", "OVERWORLD")).await;
    let retry = next_frame(&second.outbound, MSG_ACK).await;
    assert_eq!(retry, original);
    assert_eq!(second.acks.len(), 1);

    second.handle_text(&manager, &act_text("act-s", "OVERWORLD")).await;
    let fresh = next_frame(&second.outbound, MSG_ACK).await;
    assert_eq!(fresh.get("ack_for"), Some(&json!("act-s")));
    assert!(
        fresh.get("server_tick").and_then(Value::as_u64)
            > original.get("server_tick").and_then(Value::as_u64)
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn event_batch_returns_the_agent_history() {
    let manager = manager();
    let mut session = session(&manager, PROTOCOL_VERSION_1_1).await;

    session.handle_text(&manager, &act_text("act-2", "CITY_HUB")).await;
    let ack = next_frame(&session.outbound, MSG_ACK).await;
    assert_eq!(ack.get("accepted"), Some(&json!(true)));

    let req = json!({
        "type": MSG_EVENT_BATCH_REQ,
        "protocol_version": PROTOCOL_VERSION_1_1,
        "req_id": "r1",
        "since_cursor": 0,
    });
    session.handle_text(&manager, &req.to_string()).await;
    let batch = next_frame(&session.outbound, MSG_EVENT_BATCH).await;
    assert_eq!(batch.get("req_id"), Some(&json!("r1")));
    assert_eq!(batch.get("world_id"), Some(&json!("OVERWORLD")));
    let events = batch.get("events").and_then(Value::as_array).expect("events");
    assert!(events.iter().any(|item| {
        item.pointer("/event/type") == Some(&json!("ACTION_RESULT"))
            && item.pointer("/event/code") == Some(&json!("E_WORLD_BUSY"))
    }));
    assert!(batch.get("next_cursor").and_then(Value::as_u64).unwrap_or(0) > 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn legacy_sessions_get_no_acks_or_batches() {
    let manager = manager();
    let mut session = session(&manager, PROTOCOL_VERSION_1_0).await;
    let mut act: Value = serde_json::from_str(&act_text("", "")).expect("act");
    act["protocol_version"] = json!(PROTOCOL_VERSION_1_0);
    session.handle_text(&manager, &act.to_string()).await;
    session
        .handle_text(&manager, r#"{"type":"EVENT_BATCH_REQ","protocol_version":"1.0","req_id":"r"}"#)
        .await;
    assert_eq!(session.acks.len(), 0);

    let quiet = tokio::time::timeout(Duration::from_millis(600), async {
        loop {
            let frame = session.outbound.recv().await.expect("open outbound");
            let value: Value = serde_json::from_str(&frame.text).expect("json");
            if value.get("type").and_then(Value::as_str) != Some(contracts::MSG_OBS) {
                return value;
            }
        }
    })
    .await;
    assert!(quiet.is_err());
    manager.shutdown().await;
}

#[tokio::test]
async fn admin_endpoints_answer_over_http() {
    let manager = manager();
    let app = router(AppState::new(Arc::clone(&manager)));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    });
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let health = client.get(format!("{base}/healthz")).send().await.expect("healthz");
    assert_eq!(health.status(), reqwest::StatusCode::OK);
    assert_eq!(health.text().await.expect("body"), "ok");

    let state: Value = client
        .get(format!("{base}/admin/v1/worlds/state"))
        .send()
        .await
        .expect("state")
        .json()
        .await
        .expect("state json");
    assert_eq!(state.get("default_world_id"), Some(&json!("OVERWORLD")));
    assert_eq!(state.get("worlds").and_then(Value::as_array).map(Vec::len), Some(5));

    let denied = client
        .post(format!("{base}/admin/v1/worlds/OVERWORLD/reset"))
        .send()
        .await
        .expect("reset");
    assert_eq!(denied.status(), reqwest::StatusCode::FORBIDDEN);
    let body: Value = denied.json().await.expect("error json");
    assert_eq!(body.get("ok"), Some(&json!(false)));

    let reset = client
        .post(format!("{base}/admin/v1/worlds/MINE_L1/reset"))
        .send()
        .await
        .expect("reset");
    assert_eq!(reset.status(), reqwest::StatusCode::OK);

    let missing = client
        .post(format!("{base}/admin/v1/worlds/NOWHERE/reset"))
        .send()
        .await
        .expect("reset");
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let wrong_method = client
        .get(format!("{base}/admin/v1/worlds/MINE_L1/reset"))
        .send()
        .await
        .expect("reset");
    assert_eq!(wrong_method.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

    let no_target = client
        .post(format!("{base}/admin/v1/agents/A1/move_world"))
        .send()
        .await
        .expect("move");
    assert_eq!(no_target.status(), reqwest::StatusCode::BAD_REQUEST);

    let unknown = client
        .post(format!("{base}/admin/v1/agents/A404/move_world?target_world=CITY_HUB"))
        .send()
        .await
        .expect("move");
    assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);

    server.abort();
    manager.shutdown().await;
}
