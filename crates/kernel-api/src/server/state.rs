#[derive(Clone)]
struct AppState {
    manager: Arc<WorldManager>,
}

impl AppState {
    fn new(manager: Arc<WorldManager>) -> Self {
        Self { manager }
    }
}

/// Last ACK per `act_id`. Replaced wholesale once it outgrows its capacity.
#[derive(Debug, Default)]
struct AckCache {
    acks: HashMap<String, AckMsg>,
}

impl AckCache {
    fn get(&self, act_id: &str) -> Option<&AckMsg> {
        self.acks.get(act_id)
    }

    fn remember(&mut self, ack: AckMsg) {
        let act_id = ack.ack_for.clone();
        if self.acks.len() >= ACK_CACHE_CAPACITY && !self.acks.contains_key(&act_id) {
            self.acks.clear();
        }
        self.acks.insert(act_id, ack);
    }

    fn len(&self) -> usize {
        self.acks.len()
    }
}

/// One attached websocket client after a successful HELLO.
struct Session {
    agent_id: String,
    session_id: String,
    protocol_version: &'static str,
    outbound: Outbound,
    acks: AckCache,
}
