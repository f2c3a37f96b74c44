//! Classification of raw rule condition strings.
//!
//! Accepted forms:
//! - `ai("text")` → [`RuleCondition::Ai`]
//! - `all("a", "b")` / `any("a")` → [`RuleCondition::Aggregate`]
//! - anything else → [`RuleCondition::Tag`]

use std::sync::LazyLock;

use regex::Regex;

use crate::core::piece::{AggregateKind, RuleCondition};
use crate::error::ConfigError;

static CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^(ai|all|any)\s*\((.*)\)$").expect("valid call regex"));
static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).expect("valid quoted regex"));

/// Parse a raw condition into its classified form.
pub fn parse_condition(raw: &str) -> Result<RuleCondition, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid(raw, "condition is empty"));
    }

    let Some(caps) = CALL_RE.captures(trimmed) else {
        return Ok(RuleCondition::tag(trimmed));
    };
    let function = &caps[1];
    let args = parse_args(raw, &caps[2])?;

    match function {
        "ai" => {
            let [text] = <[String; 1]>::try_from(args)
                .map_err(|_| invalid(raw, "ai() takes exactly one argument"))?;
            Ok(RuleCondition::ai(text))
        }
        "all" | "any" => {
            let aggregate = if function == "all" {
                AggregateKind::All
            } else {
                AggregateKind::Any
            };
            Ok(RuleCondition::Aggregate {
                aggregate,
                conditions: args,
            })
        }
        _ => unreachable!("regex only matches ai|all|any"),
    }
}

/// Split `"a", "b"` into unescaped strings, rejecting anything that is not a
/// comma-separated list of quoted literals.
fn parse_args(raw: &str, inner: &str) -> Result<Vec<String>, ConfigError> {
    let mut args = Vec::new();
    let mut cursor = 0;
    for caps in QUOTED_RE.captures_iter(inner) {
        let whole = caps.get(0).expect("group 0 always present");
        let between = inner[cursor..whole.start()].trim();
        let expected_separator = if args.is_empty() { "" } else { "," };
        if between != expected_separator {
            return Err(invalid(raw, "arguments must be comma-separated quoted strings"));
        }
        let text = caps[1].replace("\\\"", "\"").replace("\\\\", "\\");
        if text.trim().is_empty() {
            return Err(invalid(raw, "arguments must be non-empty"));
        }
        args.push(text);
        cursor = whole.end();
    }
    if !inner[cursor..].trim().is_empty() {
        return Err(invalid(raw, "arguments must be comma-separated quoted strings"));
    }
    if args.is_empty() {
        return Err(invalid(raw, "expected at least one quoted argument"));
    }
    Ok(args)
}

fn invalid(raw: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidCondition {
        condition: raw.to_string(),
        reason: reason.to_string(),
    }
}
