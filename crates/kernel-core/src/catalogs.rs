//! Built-in catalogs. Loaded once per process and shared read-only between worlds.
//!
//! Every catalog is published to clients as a CATALOG message whose digest is the
//! SHA-256 of the canonical JSON payload.

use std::collections::BTreeMap;

use contracts::{CatalogDigests, CatalogMsg, DigestRef, MSG_CATALOG};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::WorldConfig;

pub const AIR: u16 = 0;

pub const CATALOG_ORDER: [&str; 7] = [
    "block_palette",
    "item_palette",
    "tuning",
    "recipes",
    "blueprints",
    "law_templates",
    "events",
];

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDef {
    pub id: String,
    pub solid: bool,
    /// Item produced when mined; `None` for blocks that drop nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop: Option<String>,
    /// Tool family that speeds up mining this block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDef {
    pub id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_as: Option<String>,
    #[serde(default)]
    pub edible_hunger: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_family: Option<String>,
    #[serde(default)]
    pub tool_tier: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeDef {
    pub recipe_id: String,
    pub station: String,
    pub inputs: BTreeMap<String, i32>,
    pub outputs: BTreeMap<String, i32>,
    pub tier: u8,
    pub time_ticks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueprintBlock {
    pub pos: [i32; 3],
    pub block: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueprintDef {
    pub id: String,
    pub blocks: Vec<BlueprintBlock>,
    pub cost: BTreeMap<String, i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LawTemplate {
    pub id: String,
    pub title: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDef {
    pub id: String,
    pub title: String,
    pub duration_ticks: u64,
    pub radius: i32,
}

/// Rotates a blueprint offset by `steps` quarter turns around the vertical axis.
pub fn rotate_offset(offset: [i32; 3], steps: u8) -> [i32; 3] {
    let [dx, dy, dz] = offset;
    match steps % 4 {
        0 => [dx, dy, dz],
        1 => [-dz, dy, dx],
        2 => [-dx, dy, -dz],
        _ => [dz, dy, -dx],
    }
}

/// Accepts quarter-turn counts (0..3) or degrees (0/90/180/270).
pub fn normalize_rotation(rotation: i32) -> Option<u8> {
    match rotation {
        0..=3 => Some(rotation as u8),
        90 => Some(1),
        180 => Some(2),
        270 => Some(3),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Catalog set
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Catalogs {
    pub blocks: Vec<BlockDef>,
    pub block_index: BTreeMap<String, u16>,
    pub items: BTreeMap<String, ItemDef>,
    pub recipes: BTreeMap<String, RecipeDef>,
    /// Primary smelting input to recipe id.
    pub smelt_by_input: BTreeMap<String, String>,
    pub blueprints: BTreeMap<String, BlueprintDef>,
    pub law_templates: BTreeMap<String, LawTemplate>,
    pub events: BTreeMap<String, EventDef>,
    tuning: Value,
    payloads: BTreeMap<&'static str, (String, Value)>,
}

impl Catalogs {
    pub fn builtin(cfg: &WorldConfig) -> Self {
        let blocks = builtin_blocks();
        let block_index = blocks
            .iter()
            .enumerate()
            .map(|(index, def)| (def.id.clone(), index as u16))
            .collect::<BTreeMap<_, _>>();
        let items = builtin_items()
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect::<BTreeMap<_, _>>();
        let recipes = builtin_recipes()
            .into_iter()
            .map(|recipe| (recipe.recipe_id.clone(), recipe))
            .collect::<BTreeMap<_, _>>();
        let smelt_by_input = recipes
            .values()
            .filter(|recipe| recipe.station == "FURNACE")
            .filter_map(|recipe| {
                recipe
                    .inputs
                    .keys()
                    .find(|item| item.as_str() != "COAL")
                    .map(|item| (item.clone(), recipe.recipe_id.clone()))
            })
            .collect::<BTreeMap<_, _>>();
        let blueprints = builtin_blueprints()
            .into_iter()
            .map(|bp| (bp.id.clone(), bp))
            .collect::<BTreeMap<_, _>>();
        let law_templates = builtin_law_templates()
            .into_iter()
            .map(|law| (law.id.clone(), law))
            .collect::<BTreeMap<_, _>>();
        let events = builtin_events()
            .into_iter()
            .map(|event| (event.id.clone(), event))
            .collect::<BTreeMap<_, _>>();
        let tuning = tuning_payload(cfg);

        let mut catalogs = Self {
            blocks,
            block_index,
            items,
            recipes,
            smelt_by_input,
            blueprints,
            law_templates,
            events,
            tuning,
            payloads: BTreeMap::new(),
        };
        catalogs.payloads = catalogs.build_payloads();
        catalogs
    }

    fn build_payloads(&self) -> BTreeMap<&'static str, (String, Value)> {
        let mut out = BTreeMap::new();
        let entries: [(&'static str, Value); 7] = [
            (
                "block_palette",
                json!({"blocks": self.blocks.iter().map(|b| b.id.clone()).collect::<Vec<_>>()}),
            ),
            (
                "item_palette",
                json!({"items": self.items.values().collect::<Vec<_>>()}),
            ),
            ("tuning", self.tuning.clone()),
            (
                "recipes",
                json!({"recipes": self.recipes.values().collect::<Vec<_>>()}),
            ),
            (
                "blueprints",
                json!({"blueprints": self.blueprints.values().collect::<Vec<_>>()}),
            ),
            (
                "law_templates",
                json!({"templates": self.law_templates.values().collect::<Vec<_>>()}),
            ),
            (
                "events",
                json!({"events": self.events.values().collect::<Vec<_>>()}),
            ),
        ];
        for (name, data) in entries {
            out.insert(name, (digest_value(&data), data));
        }
        out
    }

    pub fn block_id(&self, name: &str) -> Option<u16> {
        self.block_index.get(name).copied()
    }

    pub fn block_name(&self, id: u16) -> &str {
        self.blocks
            .get(usize::from(id))
            .map(|def| def.id.as_str())
            .unwrap_or("AIR")
    }

    pub fn block_def(&self, id: u16) -> Option<&BlockDef> {
        self.blocks.get(usize::from(id))
    }

    pub fn is_solid(&self, id: u16) -> bool {
        self.block_def(id).map(|def| def.solid).unwrap_or(false)
    }

    /// Block placed by an item: explicit `place_as`, else a block with the same id.
    pub fn place_block_for(&self, item: &str) -> Option<u16> {
        let def = self.items.get(item)?;
        let name = def.place_as.as_deref().unwrap_or(def.id.as_str());
        self.block_id(name).filter(|id| *id != AIR)
    }

    pub fn digest(&self, name: &str) -> String {
        self.payloads
            .get(name)
            .map(|(digest, _)| digest.clone())
            .unwrap_or_default()
    }

    pub fn digests(&self) -> CatalogDigests {
        CatalogDigests {
            block_palette: DigestRef {
                digest: self.digest("block_palette"),
                count: self.blocks.len(),
            },
            item_palette: DigestRef {
                digest: self.digest("item_palette"),
                count: self.items.len(),
            },
            tuning_digest: self.digest("tuning"),
            recipes_digest: self.digest("recipes"),
            blueprints_digest: self.digest("blueprints"),
            law_templates_digest: self.digest("law_templates"),
            events_digest: self.digest("events"),
        }
    }

    /// One CATALOG message per catalog, in handshake order.
    pub fn messages(&self, protocol_version: &str) -> Vec<CatalogMsg> {
        CATALOG_ORDER
            .iter()
            .filter_map(|name| {
                let (digest, data) = self.payloads.get(name)?;
                Some(CatalogMsg {
                    msg_type: MSG_CATALOG.to_string(),
                    protocol_version: protocol_version.to_string(),
                    name: (*name).to_string(),
                    digest: digest.clone(),
                    part: 1,
                    total_parts: 1,
                    data: data.clone(),
                })
            })
            .collect()
    }
}

pub fn digest_value(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

fn tuning_payload(cfg: &WorldConfig) -> Value {
    json!({
        "obs_radius": cfg.obs_radius,
        "day_ticks": cfg.day_ticks,
        "season_length_ticks": cfg.season_length_ticks,
        "rate_limits": cfg.rate_limits,
        "law_notice_ticks": cfg.law_notice_ticks,
        "law_vote_ticks": cfg.law_vote_ticks,
        "blueprint_auto_pull_range": cfg.blueprint_auto_pull_range,
        "blueprint_blocks_per_tick": cfg.blueprint_blocks_per_tick,
        "access_pass_core_radius": cfg.access_pass_core_radius,
        "maintenance_cost": cfg.maintenance_cost,
        "fun_decay_window_ticks": cfg.fun_decay_window_ticks,
        "fun_decay_base": cfg.fun_decay_base,
        "structure_survival_ticks": cfg.structure_survival_ticks,
    })
}

// ---------------------------------------------------------------------------
// Built-in data
// ---------------------------------------------------------------------------

fn block(id: &str, solid: bool, drop: Option<&str>, tool: Option<&str>) -> BlockDef {
    BlockDef {
        id: id.to_string(),
        solid,
        drop: drop.map(str::to_string),
        tool: tool.map(str::to_string),
    }
}

fn builtin_blocks() -> Vec<BlockDef> {
    vec![
        block("AIR", false, None, None),
        block("DIRT", true, Some("DIRT"), Some("SHOVEL")),
        block("GRASS", true, Some("DIRT"), Some("SHOVEL")),
        block("SAND", true, Some("SAND"), Some("SHOVEL")),
        block("GRAVEL", true, Some("GRAVEL"), Some("SHOVEL")),
        block("STONE", true, Some("STONE"), Some("PICKAXE")),
        block("LOG", true, Some("LOG"), Some("AXE")),
        block("PLANK", true, Some("PLANK"), Some("AXE")),
        block("COAL_ORE", true, Some("COAL"), Some("PICKAXE")),
        block("IRON_ORE", true, Some("IRON_ORE"), Some("PICKAXE")),
        block("COPPER_ORE", true, Some("COPPER_ORE"), Some("PICKAXE")),
        block("CRYSTAL_ORE", true, Some("CRYSTAL_SHARD"), Some("PICKAXE")),
        block("BRICK", true, Some("BRICK"), Some("PICKAXE")),
        block("GLASS", true, Some("GLASS"), None),
        block("WATER", false, None, None),
        block("TORCH", false, Some("TORCH"), None),
        block("CHEST", true, Some("CHEST"), Some("AXE")),
        block("FURNACE", true, Some("FURNACE"), Some("PICKAXE")),
        block("CRAFTING_BENCH", true, Some("CRAFTING_BENCH"), Some("AXE")),
        block("CONTRACT_TERMINAL", true, Some("CONTRACT_TERMINAL"), Some("PICKAXE")),
        block("BULLETIN_BOARD", true, Some("BULLETIN_BOARD"), Some("AXE")),
        block("SIGN", true, Some("SIGN"), Some("AXE")),
        block("CONVEYOR", true, Some("CONVEYOR"), Some("PICKAXE")),
        block("SWITCH", true, Some("SWITCH"), None),
        block("SENSOR", true, Some("SENSOR"), None),
        block("WIRE", false, Some("WIRE"), None),
        block("CLAIM_TOTEM", true, None, None),
    ]
}

fn item(id: &str, kind: &str) -> ItemDef {
    ItemDef {
        id: id.to_string(),
        kind: kind.to_string(),
        place_as: None,
        edible_hunger: 0,
        tool_family: None,
        tool_tier: 0,
    }
}

fn food(id: &str, hunger: i32) -> ItemDef {
    ItemDef {
        edible_hunger: hunger,
        ..item(id, "FOOD")
    }
}

fn tool(id: &str, family: &str, tier: u8) -> ItemDef {
    ItemDef {
        tool_family: Some(family.to_string()),
        tool_tier: tier,
        ..item(id, "TOOL")
    }
}

fn builtin_items() -> Vec<ItemDef> {
    let mut items = Vec::new();
    for id in [
        "DIRT",
        "SAND",
        "GRAVEL",
        "STONE",
        "LOG",
        "PLANK",
        "BRICK",
        "GLASS",
        "TORCH",
        "CHEST",
        "FURNACE",
        "CRAFTING_BENCH",
        "CONTRACT_TERMINAL",
        "BULLETIN_BOARD",
        "SIGN",
        "CONVEYOR",
        "SWITCH",
        "SENSOR",
        "WIRE",
    ] {
        items.push(item(id, "BLOCK"));
    }
    for id in [
        "COAL",
        "IRON_ORE",
        "COPPER_ORE",
        "CRYSTAL_SHARD",
        "IRON_INGOT",
        "COPPER_INGOT",
        "STICK",
        "BATTERY",
    ] {
        items.push(item(id, "MATERIAL"));
    }
    items.push(food("BERRIES", 2));
    items.push(food("BREAD", 5));
    items.push(food("COOKED_FISH", 6));
    items.push(tool("WOOD_PICKAXE", "PICKAXE", 1));
    items.push(tool("STONE_PICKAXE", "PICKAXE", 2));
    items.push(tool("IRON_PICKAXE", "PICKAXE", 3));
    items.push(tool("WOOD_AXE", "AXE", 1));
    items.push(tool("STONE_AXE", "AXE", 2));
    items.push(tool("IRON_AXE", "AXE", 3));
    items.push(tool("WOOD_SHOVEL", "SHOVEL", 1));
    items.push(tool("STONE_SHOVEL", "SHOVEL", 2));
    items
}

fn recipe(
    id: &str,
    station: &str,
    inputs: &[(&str, i32)],
    outputs: &[(&str, i32)],
    tier: u8,
    time_ticks: u32,
) -> RecipeDef {
    RecipeDef {
        recipe_id: id.to_string(),
        station: station.to_string(),
        inputs: inputs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect(),
        outputs: outputs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect(),
        tier,
        time_ticks,
    }
}

fn builtin_recipes() -> Vec<RecipeDef> {
    vec![
        recipe("plank", "HAND", &[("LOG", 1)], &[("PLANK", 4)], 1, 2),
        recipe("stick", "HAND", &[("PLANK", 2)], &[("STICK", 4)], 1, 1),
        recipe("torch", "HAND", &[("STICK", 1), ("COAL", 1)], &[("TORCH", 4)], 1, 1),
        recipe("sign", "HAND", &[("PLANK", 2), ("STICK", 1)], &[("SIGN", 2)], 1, 2),
        recipe("switch", "HAND", &[("STONE", 1), ("STICK", 1)], &[("SWITCH", 1)], 2, 2),
        recipe("crafting_bench", "HAND", &[("PLANK", 4)], &[("CRAFTING_BENCH", 1)], 1, 3),
        recipe("chest", "CRAFTING_BENCH", &[("PLANK", 8)], &[("CHEST", 1)], 1, 3),
        recipe("furnace", "CRAFTING_BENCH", &[("STONE", 8)], &[("FURNACE", 1)], 2, 4),
        recipe("wood_pickaxe", "CRAFTING_BENCH", &[("PLANK", 3), ("STICK", 2)], &[("WOOD_PICKAXE", 1)], 1, 3),
        recipe("stone_pickaxe", "CRAFTING_BENCH", &[("STONE", 3), ("STICK", 2)], &[("STONE_PICKAXE", 1)], 2, 3),
        recipe("iron_pickaxe", "CRAFTING_BENCH", &[("IRON_INGOT", 3), ("STICK", 2)], &[("IRON_PICKAXE", 1)], 3, 4),
        recipe("wood_axe", "CRAFTING_BENCH", &[("PLANK", 3), ("STICK", 2)], &[("WOOD_AXE", 1)], 1, 3),
        recipe("stone_axe", "CRAFTING_BENCH", &[("STONE", 3), ("STICK", 2)], &[("STONE_AXE", 1)], 2, 3),
        recipe("iron_axe", "CRAFTING_BENCH", &[("IRON_INGOT", 3), ("STICK", 2)], &[("IRON_AXE", 1)], 3, 4),
        recipe("wood_shovel", "CRAFTING_BENCH", &[("PLANK", 1), ("STICK", 2)], &[("WOOD_SHOVEL", 1)], 1, 2),
        recipe("stone_shovel", "CRAFTING_BENCH", &[("STONE", 1), ("STICK", 2)], &[("STONE_SHOVEL", 1)], 2, 2),
        recipe("bulletin_board", "CRAFTING_BENCH", &[("PLANK", 6), ("STICK", 2)], &[("BULLETIN_BOARD", 1)], 2, 3),
        recipe("contract_terminal", "CRAFTING_BENCH", &[("IRON_INGOT", 2), ("PLANK", 4)], &[("CONTRACT_TERMINAL", 1)], 3, 4),
        recipe("conveyor", "CRAFTING_BENCH", &[("IRON_INGOT", 1), ("PLANK", 2)], &[("CONVEYOR", 4)], 2, 3),
        recipe("wire", "CRAFTING_BENCH", &[("COPPER_INGOT", 1)], &[("WIRE", 4)], 2, 2),
        recipe("sensor", "CRAFTING_BENCH", &[("COPPER_INGOT", 1), ("CRYSTAL_SHARD", 1)], &[("SENSOR", 1)], 3, 3),
        recipe("battery", "CRAFTING_BENCH", &[("COPPER_INGOT", 2), ("COAL", 2), ("CRYSTAL_SHARD", 1)], &[("BATTERY", 1)], 3, 4),
        recipe("bread", "HAND", &[("BERRIES", 3)], &[("BREAD", 1)], 1, 2),
        recipe("iron_ingot", "FURNACE", &[("IRON_ORE", 1), ("COAL", 1)], &[("IRON_INGOT", 1)], 2, 4),
        recipe("copper_ingot", "FURNACE", &[("COPPER_ORE", 1), ("COAL", 1)], &[("COPPER_INGOT", 1)], 2, 4),
        recipe("glass", "FURNACE", &[("SAND", 1), ("COAL", 1)], &[("GLASS", 1)], 1, 3),
        recipe("brick", "FURNACE", &[("GRAVEL", 2), ("COAL", 1)], &[("BRICK", 2)], 1, 3),
    ]
}

fn blueprint(id: &str, blocks: &[([i32; 3], &str)]) -> BlueprintDef {
    let mut cost = BTreeMap::new();
    for (_, name) in blocks {
        *cost.entry((*name).to_string()).or_insert(0) += 1;
    }
    BlueprintDef {
        id: id.to_string(),
        blocks: blocks
            .iter()
            .map(|(pos, name)| BlueprintBlock {
                pos: *pos,
                block: (*name).to_string(),
            })
            .collect(),
        cost,
    }
}

fn builtin_blueprints() -> Vec<BlueprintDef> {
    vec![
        blueprint(
            "wall_line",
            &[([0, 0, 0], "STONE"), ([1, 0, 0], "STONE"), ([2, 0, 0], "STONE")],
        ),
        blueprint("light_post", &[([0, 0, 0], "TORCH")]),
        blueprint(
            "storage_hut",
            &[
                ([-1, 0, -1], "PLANK"),
                ([0, 0, -1], "PLANK"),
                ([1, 0, -1], "PLANK"),
                ([-1, 0, 0], "PLANK"),
                ([0, 0, 0], "CHEST"),
                ([1, 0, 0], "PLANK"),
                ([-1, 0, 1], "PLANK"),
                ([1, 0, 1], "PLANK"),
            ],
        ),
        blueprint(
            "workshop",
            &[
                ([0, 0, 0], "CRAFTING_BENCH"),
                ([1, 0, 0], "FURNACE"),
                ([-1, 0, 0], "TORCH"),
            ],
        ),
        blueprint(
            "market_stall",
            &[
                ([0, 0, 0], "BULLETIN_BOARD"),
                ([1, 0, 0], "PLANK"),
                ([-1, 0, 0], "PLANK"),
                ([0, 0, 1], "CHEST"),
            ],
        ),
    ]
}

fn builtin_law_templates() -> Vec<LawTemplate> {
    let template = |id: &str, title: &str, params: &[&str]| LawTemplate {
        id: id.to_string(),
        title: title.to_string(),
        params: params.iter().map(|p| (*p).to_string()).collect(),
    };
    vec![
        template("MARKET_TAX", "Market tax", &["market_tax"]),
        template("CURFEW_NO_BUILD", "Curfew: no building", &["start_time", "end_time"]),
        template(
            "FINE_BREAK_PER_BLOCK",
            "Fine for breaking blocks",
            &["fine_item", "fine_per_block"],
        ),
        template(
            "ACCESS_PASS_CORE",
            "Access pass for the core",
            &["ticket_item", "ticket_cost"],
        ),
    ]
}

fn builtin_events() -> Vec<EventDef> {
    let event = |id: &str, title: &str, duration_ticks: u64, radius: i32| EventDef {
        id: id.to_string(),
        title: title.to_string(),
        duration_ticks,
        radius,
    };
    vec![
        event("CRYSTAL_RIFT", "A crystal rift opens", 3000, 24),
        event("DEEP_VEIN", "A deep ore vein is exposed", 3000, 24),
        event("RUINS_GATE", "Ancient ruins surface", 3000, 16),
        event("MARKET_WEEK", "Market week: taxes halved", 6000, 0),
        event("BLUEPRINT_FAIR", "Blueprint fair", 3000, 0),
        event("BUILDER_EXPO", "Builder expo", 3000, 0),
        event("CIVIC_VOTE", "Civic vote", 3000, 0),
        event("FLOOD_WARNING", "Flood warning", 1500, 32),
        event("BLIGHT_ZONE", "Blight zone", 1500, 24),
        event("BANDIT_CAMP", "Bandit camp", 1500, 16),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalogs() -> Catalogs {
        let mut cfg = WorldConfig::default();
        cfg.apply_defaults();
        Catalogs::builtin(&cfg)
    }

    #[test]
    fn air_is_palette_zero_and_not_solid() {
        let cats = catalogs();
        assert_eq!(cats.block_id("AIR"), Some(AIR));
        assert!(!cats.is_solid(AIR));
        assert!(cats.is_solid(cats.block_id("STONE").expect("stone")));
    }

    #[test]
    fn digests_are_stable_and_distinct() {
        let a = catalogs();
        let b = catalogs();
        assert_eq!(a.digests(), b.digests());
        let digests = a.digests();
        assert_eq!(digests.block_palette.digest.len(), 64);
        assert_ne!(digests.recipes_digest, digests.blueprints_digest);
    }

    #[test]
    fn catalog_messages_follow_handshake_order() {
        let cats = catalogs();
        let names = cats
            .messages("1.1")
            .into_iter()
            .map(|msg| msg.name)
            .collect::<Vec<_>>();
        assert_eq!(names, CATALOG_ORDER.to_vec());
    }

    #[test]
    fn smelting_is_indexed_by_primary_input() {
        let cats = catalogs();
        assert_eq!(
            cats.smelt_by_input.get("IRON_ORE").map(String::as_str),
            Some("iron_ingot")
        );
        assert!(!cats.smelt_by_input.contains_key("COAL"));
    }

    #[test]
    fn rotation_quarter_turns() {
        assert_eq!(rotate_offset([1, 0, 0], 1), [0, 0, 1]);
        assert_eq!(rotate_offset([1, 0, 0], 2), [-1, 0, 0]);
        assert_eq!(normalize_rotation(270), Some(3));
        assert_eq!(normalize_rotation(45), None);
    }
}
