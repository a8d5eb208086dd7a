//! Economy records: trades, contracts, boards and signs, dropped item entities,
//! conveyors, registered structures, plus item-pair and tax helpers.

use std::collections::BTreeMap;

use contracts::ItemStack;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::spatial::Vec3i;

/// Lifetime of a dropped item entity.
pub const ITEM_ENTITY_TTL_TICKS: u64 = 6000;
/// Cadence of expired item cleanup.
pub const ITEM_CLEANUP_EVERY_TICKS: u64 = 50;

pub const MAX_POST_TITLE: usize = 80;
pub const MAX_POST_BODY: usize = 2000;
pub const MAX_SIGN_TEXT: usize = 200;

/// Trades whose valuations are within 2x of each other count as mutual benefit.
const TRADE_FAIR_MIN_PCT: i64 = 50;

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub from: String,
    pub to: String,
    pub offer: BTreeMap<String, i32>,
    pub request: BTreeMap<String, i32>,
    pub created_tick: u64,
}

/// Coarse valuation used only to gate reputation and fun credit.
pub fn item_trade_value(item: &str) -> i64 {
    match item {
        "LOG" | "COAL" => 2,
        "IRON_ORE" | "COPPER_ORE" | "BREAD" => 3,
        "COPPER_INGOT" => 4,
        "IRON_INGOT" | "COOKED_FISH" => 5,
        "CRYSTAL_SHARD" => 20,
        "CLAIM_TOTEM" => 26,
        "BATTERY" => 30,
        "CONVEYOR" => 36,
        "SENSOR" => 52,
        "CONTRACT_TERMINAL" => 80,
        _ => 1,
    }
}

pub fn trade_value(items: &BTreeMap<String, i32>) -> i64 {
    items
        .iter()
        .filter(|(item, n)| !item.is_empty() && **n > 0)
        .map(|(item, n)| item_trade_value(item) * i64::from(*n))
        .sum()
}

/// Returns (mutual_benefit, offer_value, request_value).
pub fn mutual_benefit(offer: &BTreeMap<String, i32>, request: &BTreeMap<String, i32>) -> (bool, i64, i64) {
    let offer_value = trade_value(offer);
    let request_value = trade_value(request);
    if offer_value <= 0 || request_value <= 0 {
        return (false, offer_value, request_value);
    }
    let lo = offer_value.min(request_value);
    let hi = offer_value.max(request_value);
    (lo * 100 >= hi * TRADE_FAIR_MIN_PCT, offer_value, request_value)
}

/// Floor tax per item; items taxed to zero are omitted.
pub fn calc_tax(items: &BTreeMap<String, i32>, rate: f64) -> BTreeMap<String, i32> {
    if rate <= 0.0 {
        return BTreeMap::new();
    }
    let rate = rate.min(1.0);
    items
        .iter()
        .filter(|(_, n)| **n > 0)
        .filter_map(|(item, n)| {
            let tax = ((f64::from(*n) * rate) as i32).clamp(0, *n);
            (tax > 0).then(|| (item.clone(), tax))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Item pairs
// ---------------------------------------------------------------------------

/// Parses `[[item, count], ...]`; counts must be positive and duplicates sum.
pub fn parse_item_pairs(pairs: &[(String, i32)]) -> Result<BTreeMap<String, i32>, String> {
    let mut out = BTreeMap::new();
    for (item, n) in pairs {
        if item.is_empty() {
            return Err("item id must be string".to_string());
        }
        if *n <= 0 {
            return Err("count must be > 0".to_string());
        }
        *out.entry(item.clone()).or_insert(0) += *n;
    }
    Ok(out)
}

pub fn stacks_to_map(stacks: &[ItemStack]) -> BTreeMap<String, i32> {
    let mut out = BTreeMap::new();
    for stack in stacks {
        if stack.item.is_empty() || stack.count <= 0 {
            continue;
        }
        *out.entry(stack.item.clone()).or_insert(0) += stack.count;
    }
    out
}

/// `[[item, count], ...]` in item order, positive counts only.
pub fn encode_item_pairs(items: &BTreeMap<String, i32>) -> Value {
    Value::Array(
        items
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(item, n)| json!([item, n]))
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractState {
    Open,
    Accepted,
    Completed,
    Failed,
}

impl ContractState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Accepted => "ACCEPTED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, Self::Open | Self::Accepted)
    }
}

pub fn normalize_contract_kind(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "GATHER" => Some("GATHER"),
        "DELIVER" => Some("DELIVER"),
        "BUILD" => Some("BUILD"),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub contract_id: String,
    pub terminal_pos: Vec3i,
    pub poster: String,
    #[serde(default)]
    pub acceptor: String,
    pub kind: String,
    #[serde(default)]
    pub requirements: BTreeMap<String, i32>,
    #[serde(default)]
    pub reward: BTreeMap<String, i32>,
    #[serde(default)]
    pub deposit: BTreeMap<String, i32>,
    #[serde(default)]
    pub blueprint_id: String,
    #[serde(default)]
    pub anchor: Vec3i,
    #[serde(default)]
    pub rotation: u8,
    pub created_tick: u64,
    pub deadline_tick: u64,
    pub state: ContractState,
}

impl Contract {
    pub fn summary(&self) -> Value {
        json!({
            "contract_id": self.contract_id,
            "state": self.state.as_str(),
            "kind": self.kind,
            "poster": self.poster,
            "acceptor": self.acceptor,
            "deadline_tick": self.deadline_tick,
        })
    }
}

/// Deposit scaled by the acceptor's trade reputation: full below 300, halved
/// at 800 and above, linear in between. At least 1 of each item is kept.
pub fn scaled_deposit(base: &BTreeMap<String, i32>, rep_trade: i32) -> BTreeMap<String, i32> {
    let permille = if rep_trade <= 300 {
        1000
    } else if rep_trade >= 800 {
        500
    } else {
        1000 - (rep_trade - 300)
    };
    base.iter()
        .filter(|(_, n)| **n > 0)
        .map(|(item, n)| (item.clone(), (n * permille / 1000).max(1)))
        .collect()
}

// ---------------------------------------------------------------------------
// Boards and signs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardPost {
    pub post_id: String,
    pub author: String,
    pub title: String,
    pub body: String,
    pub tick: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub board_id: String,
    #[serde(default)]
    pub posts: Vec<BoardPost>,
}

impl Board {
    /// Newest-first case-insensitive substring matches over title and body.
    pub fn search(&self, query: &str, limit: usize) -> Vec<Value> {
        let needle = query.to_lowercase();
        self.posts
            .iter()
            .rev()
            .filter(|post| {
                post.title.to_lowercase().contains(&needle) || post.body.to_lowercase().contains(&needle)
            })
            .take(limit)
            .map(|post| {
                json!({
                    "post_id": post.post_id,
                    "author": post.author,
                    "title": post.title,
                    "summary": truncate(&post.body, 120),
                    "tick": post.tick,
                })
            })
            .collect()
    }
}

pub fn resolve_board_id(board_id: &str, target_id: &str) -> String {
    let board_id = board_id.trim();
    if board_id.is_empty() {
        target_id.trim().to_string()
    } else {
        board_id.to_string()
    }
}

pub fn validate_post(board_id: &str, title: &str, body: &str) -> Result<(), &'static str> {
    if board_id.is_empty() {
        return Err("missing board_id");
    }
    if title.trim().is_empty() || title.len() > MAX_POST_TITLE {
        return Err("bad title");
    }
    if body.len() > MAX_POST_BODY {
        return Err("body too large");
    }
    Ok(())
}

pub fn normalize_search_limit(limit: i32) -> usize {
    match limit {
        l if l <= 0 => 20,
        l if l > 50 => 50,
        l => l as usize,
    }
}

/// Byte-truncation that never splits a UTF-8 character.
pub fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sign {
    pub pos: Vec3i,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub updated_tick: u64,
    #[serde(default)]
    pub updated_by: String,
}

// ---------------------------------------------------------------------------
// Entities and machines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemEntity {
    pub entity_id: String,
    pub pos: Vec3i,
    pub item: String,
    pub count: i32,
    pub created_tick: u64,
    pub expires_tick: u64,
}

/// Belt direction; exactly one axis is non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConveyorMeta {
    pub dx: i8,
    pub dz: i8,
}

impl ConveyorMeta {
    /// Cardinal direction from a yaw-derived vector; diagonal input keeps the
    /// dominant axis, zero falls back to +z.
    pub fn from_dir(dx: i32, dz: i32) -> Self {
        let (dx, dz) = (dx.clamp(-1, 1), dz.clamp(-1, 1));
        match (dx, dz) {
            (0, 0) => Self { dx: 0, dz: 1 },
            (x, 0) => Self { dx: x as i8, dz: 0 },
            (_, z) => Self { dx: 0, dz: z as i8 },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    pub structure_id: String,
    pub blueprint_id: String,
    pub builder_id: String,
    pub anchor: Vec3i,
    pub rotation: u8,
    pub min: Vec3i,
    pub max: Vec3i,
    pub completed_tick: u64,
    pub award_due_tick: u64,
    #[serde(default)]
    pub awarded: bool,
    /// Agent id to last tick seen inside the footprint.
    #[serde(default)]
    pub used_by: BTreeMap<String, u64>,
    #[serde(default)]
    pub last_influence_day: u64,
}

impl Structure {
    pub fn contains(&self, pos: Vec3i) -> bool {
        pos.x >= self.min.x && pos.x <= self.max.x && pos.z >= self.min.z && pos.z <= self.max.z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(pairs: &[(&str, i32)]) -> BTreeMap<String, i32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn mutual_benefit_requires_values_within_two_x() {
        let (ok, offer, request) = mutual_benefit(&items(&[("IRON_INGOT", 2)]), &items(&[("COAL", 5)]));
        assert!(ok);
        assert_eq!((offer, request), (10, 10));
        let (ok, _, _) = mutual_benefit(&items(&[("CRYSTAL_SHARD", 1)]), &items(&[("PLANK", 1)]));
        assert!(!ok);
    }

    #[test]
    fn tax_floors_and_skips_zero() {
        let tax = calc_tax(&items(&[("PLANK", 10), ("COAL", 1)]), 0.25);
        assert_eq!(tax, items(&[("PLANK", 2)]));
        assert!(calc_tax(&items(&[("PLANK", 10)]), 0.0).is_empty());
    }

    #[test]
    fn item_pairs_reject_non_positive_counts() {
        let pairs = vec![("PLANK".to_string(), 2), ("PLANK".to_string(), 1)];
        assert_eq!(parse_item_pairs(&pairs).expect("pairs"), items(&[("PLANK", 3)]));
        assert!(parse_item_pairs(&[("COAL".to_string(), 0)]).is_err());
        assert_eq!(encode_item_pairs(&items(&[("A", 1), ("B", 0)])), json!([["A", 1]]));
    }

    #[test]
    fn deposit_scales_with_reputation() {
        let base = items(&[("IRON_INGOT", 4)]);
        assert_eq!(scaled_deposit(&base, 100)["IRON_INGOT"], 4);
        assert_eq!(scaled_deposit(&base, 900)["IRON_INGOT"], 2);
        assert_eq!(scaled_deposit(&items(&[("COAL", 1)]), 900)["COAL"], 1);
    }

    #[test]
    fn board_search_is_newest_first() {
        let board = Board {
            board_id: "GLOBAL".into(),
            posts: (1..=3)
                .map(|i| BoardPost {
                    post_id: format!("P{i:06}"),
                    author: "A1".into(),
                    title: format!("Iron sale {i}"),
                    body: "cheap".into(),
                    tick: i,
                })
                .collect(),
        };
        let hits = board.search("IRON", 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0]["post_id"], "P000003");
    }

    #[test]
    fn conveyor_direction_is_cardinal() {
        assert_eq!(ConveyorMeta::from_dir(1, 1), ConveyorMeta { dx: 1, dz: 0 });
        assert_eq!(ConveyorMeta::from_dir(0, -3), ConveyorMeta { dx: 0, dz: -1 });
        assert_eq!(ConveyorMeta::from_dir(0, 0), ConveyorMeta { dx: 0, dz: 1 });
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
