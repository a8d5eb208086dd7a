async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, state))
}

async fn run_session(mut socket: WebSocket, state: AppState) {
    let Some(mut session) = handshake(&mut socket, &state.manager).await else {
        return;
    };
    tracing::info!(
        agent_id = %session.agent_id,
        session_id = %session.session_id,
        version = session.protocol_version,
        "session started"
    );

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        session.handle_text(&state.manager, text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        break;
                    }
                    _ => {}
                }
            }
            frame = session.outbound.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                if socket.send(Message::Text(frame.text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    session.outbound.close();
    state
        .manager
        .leave(&session.agent_id, &session.session_id)
        .await;
    tracing::info!(agent_id = %session.agent_id, session_id = %session.session_id, "session ended");
}

/// HELLO, join or resume, then WELCOME and the catalogs.
async fn handshake(socket: &mut WebSocket, manager: &Arc<WorldManager>) -> Option<Session> {
    let text = match tokio::time::timeout(HELLO_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(_))) => {
            close_with(socket, close_code::POLICY, "expected HELLO").await;
            return None;
        }
        _ => return None,
    };
    let base = serde_json::from_str::<BaseMessage>(text.as_str()).ok();
    if base.as_ref().map(|b| b.msg_type.as_str()) != Some(MSG_HELLO) {
        close_with(socket, close_code::POLICY, "expected HELLO").await;
        return None;
    }
    let Ok(hello) = serde_json::from_str::<HelloMsg>(text.as_str()) else {
        close_with(socket, close_code::POLICY, "bad HELLO").await;
        return None;
    };
    let Some(version) = select_protocol_version(&hello.supported_versions, &hello.protocol_version)
    else {
        close_with(socket, close_code::POLICY, "bad protocol_version").await;
        return None;
    };

    let name = match hello.agent_name.trim() {
        "" => "agent".to_string(),
        name => name.to_string(),
    };
    let outbound = Outbound::new(hello.capabilities.max_queue);
    let session_id = mint_id("sess_", 16);
    let joined = manager
        .join(JoinParams {
            name,
            delta_voxels: hello.capabilities.delta_voxels,
            resume_token: hello.auth.map(|a| a.token).unwrap_or_default(),
            world_preference: hello.world_preference,
            session_id: session_id.clone(),
            protocol_version: version.to_string(),
            outbound: outbound.clone(),
        })
        .await;
    let joined = match joined {
        Ok(joined) => joined,
        Err(err) => {
            tracing::warn!(error = %err, "join failed");
            close_with(socket, close_code::ERROR, "join failed").await;
            return None;
        }
    };

    let welcome = WelcomeMsg {
        msg_type: MSG_WELCOME.to_string(),
        protocol_version: version.to_string(),
        selected_version: version.to_string(),
        agent_id: joined.agent_id.clone(),
        session_id: session_id.clone(),
        resume_token: joined.resume_token.clone(),
        current_world_id: joined.world.world_id().to_string(),
        world_params: joined.world.params().clone(),
        world_manifest: manager.manifest().to_vec(),
        catalogs: joined.world.catalogs().digests(),
        server_capabilities: ServerCapabilities {
            ack: true,
            event_batch: true,
            idempotency: true,
        },
    };
    let mut sent = send_json(socket, &welcome).await.is_ok();
    for catalog in joined.world.catalogs().messages(version) {
        if !sent {
            break;
        }
        sent = send_json(socket, &catalog).await.is_ok();
    }
    if !sent {
        outbound.close();
        manager.leave(&joined.agent_id, &session_id).await;
        return None;
    }

    Some(Session {
        agent_id: joined.agent_id,
        session_id,
        protocol_version: version,
        outbound,
        acks: AckCache::default(),
    })
}

impl Session {
    async fn handle_text(&mut self, manager: &WorldManager, text: &str) {
        let Ok(base) = serde_json::from_str::<BaseMessage>(text) else {
            return;
        };
        match base.msg_type.as_str() {
            MSG_ACT => self.handle_act(manager, text).await,
            MSG_EVENT_BATCH_REQ if self.protocol_version == PROTOCOL_VERSION_1_1 => {
                if let Ok(req) = serde_json::from_str::<EventBatchReq>(text) {
                    self.handle_event_batch(manager, req).await;
                }
            }
            _ => {}
        }
    }

    async fn handle_act(&mut self, manager: &WorldManager, text: &str) {
        let act = match serde_json::from_str::<ActMsg>(text) {
            Ok(act) => act,
            Err(_) => {
                let ack = self.ack(manager, raw_act_id(text), Err("bad ACT payload"));
                self.send_ack(ack).await;
                return;
            }
        };
        if let Err(reason) = validate_act(&act, self.protocol_version) {
            let ack = self.ack(manager, act.act_id.clone(), Err(reason));
            self.send_ack(ack).await;
            return;
        }
        if self.protocol_version == PROTOCOL_VERSION_1_1 {
            if let Some(cached) = self.acks.get(&act.act_id).cloned() {
                self.send_ack(cached).await;
                return;
            }
            let mut ack = self.ack(manager, act.act_id.clone(), Ok(()));
            if let Some((remembered, duplicate)) = self.world_ack(manager, &act, ack.clone()).await {
                if duplicate {
                    self.acks.remember(remembered.clone());
                    self.send_ack(remembered).await;
                    return;
                }
                ack = remembered;
            }
            self.acks.remember(ack.clone());
            self.send_ack(ack).await;
        }
        if let Err(err) = manager.route_act(&self.agent_id, act).await {
            tracing::debug!(agent_id = %self.agent_id, error = %err, "ACT not routed");
        }
    }

    async fn handle_event_batch(&mut self, manager: &WorldManager, req: EventBatchReq) {
        if req.req_id.is_empty() {
            return;
        }
        let world_id = manager.agent_world(&self.agent_id).unwrap_or_default();
        let mut batch = EventBatchMsg {
            msg_type: MSG_EVENT_BATCH.to_string(),
            protocol_version: self.protocol_version.to_string(),
            req_id: req.req_id,
            events: Vec::new(),
            next_cursor: req.since_cursor,
            world_id: world_id.clone(),
        };
        if let Some(handle) = manager.world(&world_id) {
            let limit = event_batch_limit(req.limit);
            match handle.events_since(&self.agent_id, req.since_cursor, limit).await {
                Ok(Some((events, next))) => {
                    batch.events = events
                        .into_iter()
                        .map(|(cursor, event)| CursorEvent { cursor, event })
                        .collect();
                    batch.next_cursor = next;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(agent_id = %self.agent_id, error = %err, "event batch unavailable");
                }
            }
        }
        match serde_json::to_string(&batch) {
            Ok(text) => {
                if !self.outbound.push_reliable(text, RELIABLE_ENQUEUE_TIMEOUT).await {
                    tracing::debug!(agent_id = %self.agent_id, "event batch dropped");
                }
            }
            Err(err) => tracing::warn!(error = %err, "event batch not encoded"),
        }
    }

    /// Checks `act_id` against the target world so a retry from another
    /// session of the same agent is not applied twice. `None` when the world
    /// could not answer; the ACT then goes through unchecked.
    async fn world_ack(
        &self,
        manager: &WorldManager,
        act: &ActMsg,
        proposed: AckMsg,
    ) -> Option<(AckMsg, bool)> {
        let world_id = match act.expected_world_id.trim() {
            "" => manager.agent_world(&self.agent_id)?,
            id => id.to_string(),
        };
        let handle = manager.world(&world_id)?;
        match handle.check_or_remember_ack(&self.agent_id, proposed).await {
            Ok(result) => Some(result),
            Err(err) => {
                tracing::debug!(agent_id = %self.agent_id, world_id = %world_id, error = %err, "ACT dedupe unavailable");
                None
            }
        }
    }

    /// ACK stamped with the agent's current world and that world's tick.
    fn ack(&self, manager: &WorldManager, act_id: String, outcome: Result<(), &str>) -> AckMsg {
        let world_id = manager.agent_world(&self.agent_id).unwrap_or_default();
        let server_tick = manager.world(&world_id).map_or(0, |w| w.tick());
        let (accepted, code, message) = match outcome {
            Ok(()) => (true, String::new(), String::new()),
            Err(reason) => (
                false,
                ErrorCode::ProtoBadRequest.as_str().to_string(),
                reason.to_string(),
            ),
        };
        AckMsg {
            msg_type: MSG_ACK.to_string(),
            protocol_version: self.protocol_version.to_string(),
            ack_for: act_id,
            accepted,
            code,
            message,
            server_tick,
            world_id,
        }
    }

    /// ACKs exist only on 1.1 sessions.
    async fn send_ack(&self, ack: AckMsg) {
        if self.protocol_version != PROTOCOL_VERSION_1_1 {
            return;
        }
        match serde_json::to_string(&ack) {
            Ok(text) => {
                if !self.outbound.push_reliable(text, ACK_ENQUEUE_TIMEOUT).await {
                    tracing::debug!(agent_id = %self.agent_id, act_id = %ack.ack_for, "ACK dropped");
                }
            }
            Err(err) => tracing::warn!(error = %err, "ACK not encoded"),
        }
    }
}
