//! `all(...)` / `any(...)` evaluation over sub-movement matches.

use serde::{Deserialize, Serialize};

use crate::core::piece::AggregateKind;

/// The condition a sub-movement's own rules matched, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubMatch {
    pub movement: String,
    pub condition: Option<String>,
}

impl SubMatch {
    pub fn new(movement: impl Into<String>, condition: Option<&str>) -> Self {
        Self {
            movement: movement.into(),
            condition: condition.map(str::to_string),
        }
    }
}

/// Evaluate an aggregate condition.
///
/// With a single condition every sub-movement is compared against it. With
/// several, conditions pair with sub-movements by position and a count
/// mismatch is false. Zero sub-movements is always false.
///
/// - `all`: every sub-movement needs a recorded match equal to its condition.
/// - `any`: some sub-movement's recorded match equals its condition;
///   sub-movements without a match are skipped.
pub fn evaluate_aggregate(kind: AggregateKind, conditions: &[String], subs: &[SubMatch]) -> bool {
    if subs.is_empty() || conditions.is_empty() {
        return false;
    }
    if conditions.len() > 1 && conditions.len() != subs.len() {
        return false;
    }
    let expected = |position: usize| {
        if conditions.len() == 1 {
            conditions[0].as_str()
        } else {
            conditions[position].as_str()
        }
    };
    let matches = |(position, sub): (usize, &SubMatch)| {
        sub.condition.as_deref() == Some(expected(position))
    };

    match kind {
        AggregateKind::All => subs.iter().enumerate().all(matches),
        AggregateKind::Any => subs
            .iter()
            .enumerate()
            .filter(|(_, sub)| sub.condition.is_some())
            .any(matches),
    }
}
