fn require_loopback(peer: SocketAddr) -> Result<(), HttpApiError> {
    if peer.ip().is_loopback() {
        Ok(())
    } else {
        Err(HttpApiError::forbidden("admin endpoints are loopback-only"))
    }
}

fn event_batch_limit(requested: usize) -> usize {
    match requested {
        0 => DEFAULT_EVENT_BATCH_LIMIT,
        n => n.min(MAX_EVENT_BATCH_LIMIT),
    }
}

/// Reads `act_id` from a frame that did not decode as an ACT.
fn raw_act_id(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("act_id").and_then(|id| id.as_str()).map(str::to_string))
        .unwrap_or_default()
}

/// Checks an ACT against the session's negotiated version.
fn validate_act(act: &ActMsg, session_version: &str) -> Result<(), &'static str> {
    if !is_supported_protocol_version(&act.protocol_version) {
        return Err("unsupported protocol_version");
    }
    if session_version != PROTOCOL_VERSION_1_1 {
        return Ok(());
    }
    if act.act_id.trim().is_empty() {
        return Err("missing act_id");
    }
    if act.based_on_obs_id.trim().is_empty() {
        return Err("missing based_on_obs_id");
    }
    if act.is_mutating() && act.expected_world_id.trim().is_empty() {
        return Err("expected_world_id required for mutating ACT");
    }
    Ok(())
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if socket.send(Message::Close(Some(frame))).await.is_err() {
        tracing::debug!(reason, "close frame not delivered");
    }
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, message: &T) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload.into())).await
}
