#[derive(Debug, Default, Deserialize)]
struct MoveWorldQuery {
    #[serde(default)]
    target_world: String,
}

async fn worlds_state(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Result<Response, HttpApiError> {
    require_loopback(peer)?;
    Ok(Json(state.manager.state()).into_response())
}

async fn reset_world(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(world_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, HttpApiError> {
    require_loopback(peer)?;
    let report = state.manager.reset_world(&world_id).await?;
    Ok(Json(json!({ "ok": true, "reset": report })).into_response())
}

async fn move_agent_world(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(agent_id): Path<String>,
    Query(query): Query<MoveWorldQuery>,
    State(state): State<AppState>,
) -> Result<Response, HttpApiError> {
    require_loopback(peer)?;
    if query.target_world.trim().is_empty() {
        return Err(HttpApiError::bad_request("missing target_world"));
    }
    state
        .manager
        .move_agent_world(&agent_id, &query.target_world)
        .await?;
    Ok(Json(json!({
        "ok": true,
        "agent_id": agent_id,
        "world_id": query.target_world.trim(),
    }))
    .into_response())
}
