//! Agent state: vitals, reputation, inventory, task slots, event log, rate windows,
//! fun-score decay windows and private memory.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use contracts::{Event, ItemStack, MemoryKv, MemoryEntryTransfer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::spatial::Vec3i;

pub const MAX_HP: i32 = 20;
pub const MAX_HUNGER: i32 = 20;
pub const MAX_STAMINA_MILLI: i32 = 1000;
pub const MAX_REP: i32 = 1000;

/// Pending events kept for an agent that is not draining OBS.
const MAX_PENDING_EVENTS: usize = 512;
/// Delivered events retained for EVENT_BATCH replay.
const MAX_EVENT_HISTORY: usize = 1024;
/// Combined key+value bytes an agent may keep in memory.
pub const MEMORY_BUDGET_BYTES: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    MoveTo,
    Follow,
    Mine,
    Gather,
    Place,
    Open,
    Transfer,
    Craft,
    Smelt,
    BuildBlueprint,
}

impl TaskKind {
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "MOVE_TO" => Self::MoveTo,
            "FOLLOW" => Self::Follow,
            "MINE" => Self::Mine,
            "GATHER" => Self::Gather,
            "PLACE" => Self::Place,
            "OPEN" => Self::Open,
            "TRANSFER" => Self::Transfer,
            "CRAFT" => Self::Craft,
            "SMELT" => Self::Smelt,
            "BUILD_BLUEPRINT" => Self::BuildBlueprint,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MoveTo => "MOVE_TO",
            Self::Follow => "FOLLOW",
            Self::Mine => "MINE",
            Self::Gather => "GATHER",
            Self::Place => "PLACE",
            Self::Open => "OPEN",
            Self::Transfer => "TRANSFER",
            Self::Craft => "CRAFT",
            Self::Smelt => "SMELT",
            Self::BuildBlueprint => "BUILD_BLUEPRINT",
        }
    }

    pub fn is_movement(self) -> bool {
        matches!(self, Self::MoveTo | Self::Follow)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementTask {
    pub task_id: String,
    pub kind: TaskKind,
    pub target: Vec3i,
    pub tolerance: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_id: String,
    #[serde(default)]
    pub distance: f64,
    pub start_pos: Vec3i,
    pub started_tick: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkTask {
    pub task_id: String,
    pub kind: Option<TaskKind>,
    #[serde(default)]
    pub block_pos: Vec3i,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recipe_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub item_id: String,
    #[serde(default)]
    pub count: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub blueprint_id: String,
    #[serde(default)]
    pub anchor: Vec3i,
    #[serde(default)]
    pub rotation: u8,
    #[serde(default)]
    pub build_index: usize,
    /// Set once BUILD_BLUEPRINT has validated its footprint and charged materials.
    #[serde(default)]
    pub charged: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src_container: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dst_container: String,
    pub started_tick: u64,
    #[serde(default)]
    pub work_ticks: u32,
}

impl WorkTask {
    pub fn kind_str(&self) -> &'static str {
        self.kind.map(TaskKind::as_str).unwrap_or("UNKNOWN")
    }
}

// ---------------------------------------------------------------------------
// Supporting records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equipment {
    pub main_hand: String,
    pub armor: [String; 4],
}

impl Default for Equipment {
    fn default() -> Self {
        Self {
            main_hand: "NONE".to_string(),
            armor: std::array::from_fn(|_| "NONE".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunScore {
    pub novelty: i64,
    pub creation: i64,
    pub social: i64,
    pub influence: i64,
    pub narrative: i64,
    pub risk_rescue: i64,
}

impl FunScore {
    pub fn to_array(self) -> [i64; 6] {
        [
            self.novelty,
            self.creation,
            self.social,
            self.influence,
            self.narrative,
            self.risk_rescue,
        ]
    }

    pub fn from_array(raw: [i64; 6]) -> Self {
        Self {
            novelty: raw[0],
            creation: raw[1],
            social: raw[2],
            influence: raw[3],
            narrative: raw[4],
            risk_rescue: raw[5],
        }
    }

    /// Adds to a dimension by wire name and returns the new total.
    pub fn add(&mut self, dim: &str, delta: i64) -> Option<i64> {
        let slot = match dim {
            "NOVELTY" => &mut self.novelty,
            "CREATION" => &mut self.creation,
            "SOCIAL" => &mut self.social,
            "INFLUENCE" => &mut self.influence,
            "NARRATIVE" => &mut self.narrative,
            "RISK_RESCUE" => &mut self.risk_rescue,
            _ => return None,
        };
        *slot += delta;
        Some(*slot)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountWindow {
    pub start_tick: u64,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub value: String,
    #[serde(default)]
    pub expiry_tick: u64,
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { cooldown_ticks: u64, until_tick: u64 },
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub org_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_world_id: String,
    #[serde(default)]
    pub switch_cooldown_until_tick: u64,

    pub pos: Vec3i,
    pub yaw: i32,
    pub hp: i32,
    pub hunger: i32,
    pub stamina_milli: i32,

    pub rep_trade: i32,
    pub rep_build: i32,
    pub rep_social: i32,
    pub rep_law: i32,

    #[serde(default)]
    pub fun: FunScore,
    #[serde(default)]
    pub inventory: BTreeMap<String, i32>,
    #[serde(default)]
    pub equipment: Equipment,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_task: Option<MovementTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_task: Option<WorkTask>,

    /// Events not yet drained into an OBS.
    #[serde(default)]
    pub events: Vec<Event>,
    /// Number of events ever appended for this agent.
    #[serde(default)]
    pub event_cursor: u64,
    #[serde(skip)]
    pub event_history: VecDeque<(u64, Event)>,

    #[serde(default)]
    pub rate_windows: BTreeMap<String, CountWindow>,
    #[serde(default)]
    pub fun_decay: BTreeMap<String, CountWindow>,
    #[serde(default)]
    pub seen_biomes: BTreeSet<String>,
    #[serde(default)]
    pub seen_recipes: BTreeSet<String>,
    #[serde(default)]
    pub seen_events: BTreeSet<String>,

    #[serde(default)]
    pub memory: BTreeMap<String, MemoryEntry>,
    #[serde(skip)]
    pub pending_memory: Vec<MemoryKv>,

    #[serde(skip)]
    pub resume_token: String,
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>, pos: Vec3i) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            org_id: String::new(),
            current_world_id: String::new(),
            switch_cooldown_until_tick: 0,
            pos,
            yaw: 0,
            hp: MAX_HP,
            hunger: MAX_HUNGER,
            stamina_milli: MAX_STAMINA_MILLI,
            rep_trade: 500,
            rep_build: 500,
            rep_social: 500,
            rep_law: 500,
            fun: FunScore::default(),
            inventory: BTreeMap::new(),
            equipment: Equipment::default(),
            move_task: None,
            work_task: None,
            events: Vec::new(),
            event_cursor: 0,
            event_history: VecDeque::new(),
            rate_windows: BTreeMap::new(),
            fun_decay: BTreeMap::new(),
            seen_biomes: BTreeSet::new(),
            seen_recipes: BTreeSet::new(),
            seen_events: BTreeSet::new(),
            memory: BTreeMap::new(),
            pending_memory: Vec::new(),
            resume_token: String::new(),
        }
    }

    /// Clamps vitals and reputations into their documented ranges.
    pub fn clamp(&mut self) {
        self.hp = self.hp.clamp(0, MAX_HP);
        self.hunger = self.hunger.clamp(0, MAX_HUNGER);
        self.stamina_milli = self.stamina_milli.clamp(0, MAX_STAMINA_MILLI);
        for rep in [
            &mut self.rep_trade,
            &mut self.rep_build,
            &mut self.rep_social,
            &mut self.rep_law,
        ] {
            *rep = (*rep).clamp(0, MAX_REP);
        }
    }

    pub fn count(&self, item: &str) -> i32 {
        self.inventory.get(item).copied().unwrap_or(0)
    }

    pub fn has_items(&self, items: &BTreeMap<String, i32>) -> bool {
        items.iter().all(|(item, n)| self.count(item) >= *n)
    }

    pub fn add_item(&mut self, item: &str, n: i32) {
        if n == 0 || item.is_empty() {
            return;
        }
        let entry = self.inventory.entry(item.to_string()).or_insert(0);
        *entry += n;
        if *entry <= 0 {
            self.inventory.remove(item);
        }
    }

    /// Removes `n` of `item` if present; returns false and changes nothing otherwise.
    pub fn take_item(&mut self, item: &str, n: i32) -> bool {
        if n < 0 || self.count(item) < n {
            return false;
        }
        self.add_item(item, -n);
        true
    }

    pub fn inventory_list(&self) -> Vec<ItemStack> {
        self.inventory
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(item, count)| ItemStack {
                item: item.clone(),
                count: *count,
            })
            .collect()
    }

    pub fn adjust_rep_law(&mut self, delta: i32) {
        self.rep_law = (self.rep_law + delta).clamp(0, MAX_REP);
    }

    pub fn adjust_rep_trade(&mut self, delta: i32) {
        self.rep_trade = (self.rep_trade + delta).clamp(0, MAX_REP);
    }

    // -- events --------------------------------------------------------------

    pub fn add_event(&mut self, event: Event) {
        self.event_cursor += 1;
        self.event_history.push_back((self.event_cursor, event.clone()));
        while self.event_history.len() > MAX_EVENT_HISTORY {
            self.event_history.pop_front();
        }
        self.events.push(event);
        if self.events.len() > MAX_PENDING_EVENTS {
            let overflow = self.events.len() - MAX_PENDING_EVENTS;
            self.events.drain(..overflow);
        }
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Retained events with cursor greater than `since`, oldest first.
    pub fn events_since(&self, since: u64, limit: usize) -> (Vec<(u64, Event)>, u64) {
        let batch = self
            .event_history
            .iter()
            .filter(|(cursor, _)| *cursor > since)
            .take(limit)
            .cloned()
            .collect::<Vec<_>>();
        let next = batch.last().map(|(cursor, _)| *cursor).unwrap_or(since);
        (batch, next)
    }

    // -- rate limits ---------------------------------------------------------

    /// Counts one action of `kind` against a fixed window. Rejected attempts are
    /// not counted.
    pub fn rate_limit_allow(&mut self, kind: &str, now: u64, window: u64, max: u32) -> RateDecision {
        if window == 0 || max == 0 {
            return RateDecision::Allowed;
        }
        let slot = self
            .rate_windows
            .entry(kind.to_string())
            .or_insert(CountWindow {
                start_tick: now,
                count: 0,
            });
        if now.saturating_sub(slot.start_tick) >= window {
            slot.start_tick = now;
            slot.count = 0;
        }
        if slot.count < max {
            slot.count += 1;
            return RateDecision::Allowed;
        }
        let until_tick = slot.start_tick + window;
        RateDecision::Limited {
            cooldown_ticks: until_tick.saturating_sub(now),
            until_tick,
        }
    }

    // -- memory --------------------------------------------------------------

    /// True when storing `key=value` would exceed the memory budget.
    pub fn memory_over_budget(&self, key: &str, value: &str) -> bool {
        let others = self
            .memory
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, entry)| k.len() + entry.value.len())
            .sum::<usize>();
        others + key.len() + value.len() > MEMORY_BUDGET_BYTES
    }

    pub fn memory_save(&mut self, key: &str, value: &str, ttl_ticks: i64, now: u64) {
        let expiry_tick = if ttl_ticks > 0 {
            now + ttl_ticks as u64
        } else {
            0
        };
        self.memory.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expiry_tick,
            },
        );
    }

    /// Live entries under `prefix` in key order; expired entries are pruned.
    pub fn memory_load(&mut self, prefix: &str, limit: i32, now: u64) -> Vec<MemoryKv> {
        let limit = if limit <= 0 || limit > 256 { 64 } else { limit as usize };
        self.memory
            .retain(|_, entry| entry.expiry_tick == 0 || now < entry.expiry_tick);
        self.memory
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .take(limit)
            .map(|(key, entry)| MemoryKv {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect()
    }

    pub fn memory_for_transfer(&self) -> BTreeMap<String, MemoryEntryTransfer> {
        self.memory
            .iter()
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, entry)| {
                (
                    key.clone(),
                    MemoryEntryTransfer {
                        value: entry.value.clone(),
                        expiry_tick: entry.expiry_tick,
                    },
                )
            })
            .collect()
    }

    /// Status tags surfaced in OBS.
    pub fn status(&self) -> Vec<String> {
        let mut status = Vec::new();
        if self.hunger == 0 {
            status.push("STARVING".to_string());
        } else if self.hunger <= 5 {
            status.push("HUNGRY".to_string());
        }
        if self.stamina_milli < 200 {
            status.push("TIRED".to_string());
        }
        if self.hp <= 5 {
            status.push("WOUNDED".to_string());
        }
        status
    }
}

/// Builds an event with `t` and `type` set, plus extra fields.
pub fn event(now: u64, kind: &str, fields: Value) -> Event {
    let mut out = Event::new();
    out.insert("t".to_string(), json!(now));
    out.insert("type".to_string(), json!(kind));
    if let Value::Object(extra) = fields {
        out.extend(extra);
    }
    out
}
