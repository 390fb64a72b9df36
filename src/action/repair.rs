/// Best-effort recovery of malformed click/drag calls.
///
/// Only consulted after the strict grammar rejected a candidate. Both
/// heuristics trust the last integer pairs in the text.
use std::sync::OnceLock;

use regex::Regex;

fn pair_pattern() -> &'static Regex {
    static PAIR: OnceLock<Regex> = OnceLock::new();
    PAIR.get_or_init(|| Regex::new(r"(\d+)\s*,\s*(\d+)").expect("static regex"))
}

fn pairs(text: &str) -> Vec<(String, String)> {
    pair_pattern()
        .captures_iter(text)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

/// `click(start_box='=x(50,60)')` becomes `click(start_box='(50,60)')`.
pub fn repair_click(candidate: &str) -> Option<String> {
    let found = pairs(candidate);
    let (x, y) = found.last()?;
    Some(format!("click(start_box='({x},{y})')"))
}

/// Needs at least two pairs; the last two become start and end.
pub fn repair_drag(candidate: &str) -> Option<String> {
    let found = pairs(candidate);
    if found.len() < 2 {
        return None;
    }
    let (x1, y1) = &found[found.len() - 2];
    let (x2, y2) = &found[found.len() - 1];
    Some(format!("drag(start_box='({x1},{y1})', end_box='({x2},{y2})')"))
}

/// Picks the heuristic by the call prefix found in the text. Returns `None`
/// when nothing applies or the repair would not change the text.
pub fn repair(candidate: &str) -> Option<String> {
    let fixed = if candidate.contains("click(start_box") {
        repair_click(candidate)
    } else if candidate.contains("drag(start_box") {
        repair_drag(candidate)
    } else {
        None
    }?;

    if fixed == candidate {
        return None;
    }
    tracing::warn!(before = %candidate, after = %fixed, "repaired malformed action");
    Some(fixed)
}
