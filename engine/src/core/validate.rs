//! Fail-fast structural checks on a piece graph.

use std::collections::HashSet;

use crate::core::piece::{Movement, MovementKind, PieceConfig, Rule, Transition};
use crate::error::ConfigError;

/// Check a piece before any agent runs:
/// - `max_iterations > 0`
/// - movement names unique (sub-movements included)
/// - initial movement exists
/// - agent movements carry a persona; parallel containers hold at least one
///   agent movement and nothing else
/// - top-level rules carry a target naming a top-level movement or a terminal
/// - loop monitors reference existing movements and route their judge validly
pub fn validate_piece(config: &PieceConfig) -> Result<(), ConfigError> {
    if config.max_iterations == 0 {
        return Err(ConfigError::ZeroMaxIterations);
    }

    let mut seen = HashSet::new();
    for movement in &config.movements {
        if !seen.insert(movement.name.as_str()) {
            return Err(ConfigError::DuplicateMovement(movement.name.clone()));
        }
        for sub in movement.sub_movements() {
            if !seen.insert(sub.name.as_str()) {
                return Err(ConfigError::DuplicateMovement(sub.name.clone()));
            }
        }
    }

    if config.movement(&config.initial_movement).is_none() {
        return Err(ConfigError::UnknownInitialMovement(
            config.initial_movement.clone(),
        ));
    }

    let targets: HashSet<&str> = config.movements.iter().map(|m| m.name.as_str()).collect();
    for movement in &config.movements {
        validate_movement(movement, &targets)?;
    }

    for (index, monitor) in config.loop_monitors.iter().enumerate() {
        let monitor_error = |reason: String| ConfigError::InvalidLoopMonitor { index, reason };
        if monitor.cycle.is_empty() {
            return Err(monitor_error("cycle must name at least one movement".to_string()));
        }
        if let Some(unknown) = monitor.cycle.iter().find(|name| !targets.contains(name.as_str())) {
            return Err(monitor_error(format!("cycle names unknown movement `{unknown}`")));
        }
        if monitor.threshold == 0 {
            return Err(monitor_error("threshold must be > 0".to_string()));
        }
        if monitor.judge.persona.trim().is_empty() {
            return Err(monitor_error("judge persona must be non-empty".to_string()));
        }
        if monitor.judge.rules.is_empty() {
            return Err(monitor_error("judge needs at least one rule".to_string()));
        }
        validate_rules("loop_judge", &monitor.judge.rules, &targets, true)?;
    }

    if let Some(persona) = &config.answer_persona
        && persona.trim().is_empty()
    {
        return Err(ConfigError::EmptyAnswerPersona);
    }

    Ok(())
}

fn validate_movement(movement: &Movement, targets: &HashSet<&str>) -> Result<(), ConfigError> {
    match &movement.kind {
        MovementKind::Agent(step) => {
            if step.persona.trim().is_empty() {
                return Err(ConfigError::MissingPersona(movement.name.clone()));
            }
        }
        MovementKind::Parallel { movements } => {
            if movements.is_empty() {
                return Err(ConfigError::EmptyParallel(movement.name.clone()));
            }
            for sub in movements {
                let MovementKind::Agent(step) = &sub.kind else {
                    return Err(ConfigError::NestedParallel {
                        parent: movement.name.clone(),
                        child: sub.name.clone(),
                    });
                };
                if step.persona.trim().is_empty() {
                    return Err(ConfigError::MissingPersona(sub.name.clone()));
                }
                validate_rules(&sub.name, &sub.rules, targets, false)?;
            }
        }
    }
    validate_rules(&movement.name, &movement.rules, targets, true)
}

fn validate_rules(
    movement: &str,
    rules: &[Rule],
    targets: &HashSet<&str>,
    require_target: bool,
) -> Result<(), ConfigError> {
    for (position, rule) in rules.iter().enumerate() {
        match &rule.next {
            None if require_target => {
                return Err(ConfigError::MissingTarget {
                    movement: movement.to_string(),
                    rule: position + 1,
                });
            }
            Some(Transition::Movement(target)) if !targets.contains(target.as_str()) => {
                return Err(ConfigError::UnknownTarget {
                    movement: movement.to_string(),
                    rule: position + 1,
                    target: target.clone(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}
