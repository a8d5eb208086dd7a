//! Law lifecycle: NOTICE -> VOTING -> ACTIVE | REJECTED, parameter
//! canonicalisation per template and activation effects on the target claim.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::claims::LandClaim;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LawStatus {
    Notice,
    Voting,
    Active,
    Rejected,
}

impl LawStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notice => "NOTICE",
            Self::Voting => "VOTING",
            Self::Active => "ACTIVE",
            Self::Rejected => "REJECTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Law {
    pub law_id: String,
    pub land_id: String,
    pub template_id: String,
    pub title: String,
    /// Canonical string form of every parameter.
    pub params: BTreeMap<String, String>,
    pub proposed_by: String,
    pub proposed_tick: u64,
    pub notice_ends_tick: u64,
    pub vote_ends_tick: u64,
    pub status: LawStatus,
    #[serde(default)]
    pub votes: BTreeMap<String, String>,
}

impl Law {
    pub fn tally(&self) -> (u32, u32) {
        count_votes(&self.votes)
    }
}

pub fn count_votes(votes: &BTreeMap<String, String>) -> (u32, u32) {
    votes.values().fold((0, 0), |(yes, no), choice| {
        match normalize_choice(choice) {
            Some("YES") => (yes + 1, no),
            Some("NO") => (yes, no + 1),
            _ => (yes, no),
        }
    })
}

pub fn normalize_choice(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "YES" | "Y" | "1" | "TRUE" => Some("YES"),
        "NO" | "N" | "0" | "FALSE" => Some("NO"),
        "ABSTAIN" => Some("ABSTAIN"),
        _ => None,
    }
}

fn param_float(params: &BTreeMap<String, Value>, key: &str) -> Result<f64, String> {
    match params.get(key) {
        None => Err(format!("missing {key}")),
        Some(value) => value.as_f64().ok_or_else(|| format!("{key} must be number")),
    }
}

fn param_string(params: &BTreeMap<String, Value>, key: &str) -> Result<String, String> {
    match params.get(key).and_then(Value::as_str).map(str::trim) {
        Some(raw) if !raw.is_empty() => Ok(raw.to_string()),
        Some(_) => Err(format!("{key} must be string")),
        None if params.contains_key(key) => Err(format!("{key} must be string")),
        None => Err(format!("missing {key}")),
    }
}

/// Validates and clamps proposal parameters into their canonical string form.
/// `item_known` resolves item ids for templates that reference one.
pub fn canonical_params(
    template_id: &str,
    params: &BTreeMap<String, Value>,
    item_known: impl Fn(&str) -> bool,
) -> Result<BTreeMap<String, String>, String> {
    let mut out = BTreeMap::new();
    match template_id {
        "MARKET_TAX" => {
            let tax = param_float(params, "market_tax")?.clamp(0.0, 0.25);
            out.insert("market_tax".to_string(), tax.to_string());
        }
        "CURFEW_NO_BUILD" => {
            let start = param_float(params, "start_time")?.clamp(0.0, 1.0);
            let end = param_float(params, "end_time")?.clamp(0.0, 1.0);
            out.insert("start_time".to_string(), start.to_string());
            out.insert("end_time".to_string(), end.to_string());
        }
        "FINE_BREAK_PER_BLOCK" => {
            let item = param_string(params, "fine_item")?;
            if !item_known(&item) {
                return Err("unknown fine_item".to_string());
            }
            let n = (param_float(params, "fine_per_block")? as i64).clamp(0, 100);
            out.insert("fine_item".to_string(), item);
            out.insert("fine_per_block".to_string(), n.to_string());
        }
        "ACCESS_PASS_CORE" => {
            let item = param_string(params, "ticket_item")?;
            if !item_known(&item) {
                return Err("unknown ticket_item".to_string());
            }
            let n = (param_float(params, "ticket_cost")? as i64).clamp(0, 64);
            out.insert("ticket_item".to_string(), item);
            out.insert("ticket_cost".to_string(), n.to_string());
        }
        _ => return Err("unsupported template".to_string()),
    }
    Ok(out)
}

fn parsed<T: std::str::FromStr>(law: &Law, key: &str) -> Result<T, String> {
    let raw = law.params.get(key).map(|v| v.trim()).unwrap_or("");
    if raw.is_empty() {
        return Err(format!("missing {key}"));
    }
    raw.parse::<T>().map_err(|_| format!("bad {key}"))
}

/// Applies an adopted law to its claim. An error rejects the law.
pub fn activate(law: &Law, land: &mut LandClaim) -> Result<(), String> {
    match law.template_id.as_str() {
        "MARKET_TAX" => {
            land.market_tax = parsed::<f64>(law, "market_tax")?.clamp(0.0, 0.25);
        }
        "CURFEW_NO_BUILD" => {
            let start = parsed::<f64>(law, "start_time")?.clamp(0.0, 1.0);
            let end = parsed::<f64>(law, "end_time")?.clamp(0.0, 1.0);
            land.curfew_enabled = start != end;
            land.curfew_start = if land.curfew_enabled { start } else { 0.0 };
            land.curfew_end = if land.curfew_enabled { end } else { 0.0 };
        }
        "FINE_BREAK_PER_BLOCK" => {
            let item = law.params.get("fine_item").map(|v| v.trim()).unwrap_or("");
            if item.is_empty() {
                land.fine_break_enabled = false;
                land.fine_break_item.clear();
                land.fine_break_per_block = 0;
                return Err("missing fine_item/fine_per_block".to_string());
            }
            let n = parsed::<i32>(law, "fine_per_block")?.clamp(0, 100);
            land.fine_break_enabled = n > 0;
            land.fine_break_item = if n > 0 { item.to_string() } else { String::new() };
            land.fine_break_per_block = n;
        }
        "ACCESS_PASS_CORE" => {
            let item = law.params.get("ticket_item").map(|v| v.trim()).unwrap_or("");
            if item.is_empty() {
                land.access_pass_enabled = false;
                land.access_ticket_item.clear();
                land.access_ticket_cost = 0;
                return Err("missing ticket_item/ticket_cost".to_string());
            }
            let n = parsed::<i32>(law, "ticket_cost")?.clamp(0, 64);
            land.access_pass_enabled = n > 0;
            land.access_ticket_item = if n > 0 { item.to_string() } else { String::new() };
            land.access_ticket_cost = n;
        }
        _ => return Err("unsupported template".to_string()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::CLAIM_TYPE_DEFAULT;
    use crate::spatial::Vec3i;
    use serde_json::json;

    fn law(template: &str, params: &[(&str, &str)]) -> Law {
        Law {
            law_id: "LAW000001".into(),
            land_id: "LAND_A1_001".into(),
            template_id: template.into(),
            title: template.into(),
            params: params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            proposed_by: "A1".into(),
            proposed_tick: 1,
            notice_ends_tick: 10,
            vote_ends_tick: 20,
            status: LawStatus::Voting,
            votes: BTreeMap::new(),
        }
    }

    fn land() -> LandClaim {
        LandClaim::new("LAND_A1_001".into(), "A1".into(), CLAIM_TYPE_DEFAULT, Vec3i::default(), 32)
    }

    #[test]
    fn params_are_clamped_and_canonical() {
        let params = BTreeMap::from([("market_tax".to_string(), json!(0.9))]);
        let canon = canonical_params("MARKET_TAX", &params, |_| true).expect("canonical");
        assert_eq!(canon["market_tax"], "0.25");

        let params = BTreeMap::from([
            ("ticket_item".to_string(), json!("COAL")),
            ("ticket_cost".to_string(), json!(500)),
        ]);
        let canon = canonical_params("ACCESS_PASS_CORE", &params, |_| true).expect("canonical");
        assert_eq!(canon["ticket_cost"], "64");
        assert!(canonical_params("ACCESS_PASS_CORE", &params, |_| false).is_err());
        assert!(canonical_params("NOPE", &params, |_| true).is_err());
    }

    #[test]
    fn votes_count_normalised_choices() {
        let votes = BTreeMap::from([
            ("A1".to_string(), "yes".to_string()),
            ("A2".to_string(), "N".to_string()),
            ("A3".to_string(), "TRUE".to_string()),
            ("A4".to_string(), "ABSTAIN".to_string()),
        ]);
        assert_eq!(count_votes(&votes), (2, 1));
    }

    #[test]
    fn curfew_with_equal_bounds_disables() {
        let mut land = land();
        activate(&law("CURFEW_NO_BUILD", &[("start_time", "0.5"), ("end_time", "0.5")]), &mut land)
            .expect("activate");
        assert!(!land.curfew_enabled);
        activate(&law("CURFEW_NO_BUILD", &[("start_time", "0.8"), ("end_time", "0.2")]), &mut land)
            .expect("activate");
        assert!(land.curfew_enabled);
        assert!(land.curfew_active(0.9));
    }

    #[test]
    fn fine_and_access_pass_apply_to_land() {
        let mut land = land();
        activate(&law("FINE_BREAK_PER_BLOCK", &[("fine_item", "COAL"), ("fine_per_block", "3")]), &mut land)
            .expect("activate");
        assert!(land.fine_break_enabled);
        assert_eq!(land.fine_break_per_block, 3);
        activate(&law("ACCESS_PASS_CORE", &[("ticket_item", "COAL"), ("ticket_cost", "0")]), &mut land)
            .expect("activate");
        assert!(!land.access_pass_enabled);
        assert!(activate(&law("MARKET_TAX", &[]), &mut land).is_err());
    }
}
