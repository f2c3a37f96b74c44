//! `[MOVEMENT:N]` status tag detection.

use regex::Regex;

/// Render the tag an agent should emit to pick rule `position` (1-based).
pub fn status_tag(movement: &str, position: usize) -> String {
    format!("[{}:{}]", movement.to_uppercase(), position)
}

/// Find the rule selected by a status tag in `content`.
///
/// Matching ignores ASCII case. Tags whose number is not a valid 1-based rule
/// position are ignored; when several valid tags appear the last one wins.
/// Returns the zero-based rule index.
pub fn detect_tag(movement: &str, content: &str, rule_count: usize) -> Option<usize> {
    if content.is_empty() || rule_count == 0 {
        return None;
    }
    let pattern = format!(r"(?i)\[{}:(\d+)\]", regex::escape(&movement.to_uppercase()));
    let re = Regex::new(&pattern).ok()?;
    re.captures_iter(content)
        .filter_map(|caps| caps[1].parse::<usize>().ok())
        .filter(|position| (1..=rule_count).contains(position))
        .last()
        .map(|position| position - 1)
}
