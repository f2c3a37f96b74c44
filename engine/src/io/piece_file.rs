//! Piece definitions stored as TOML.
//!
//! The file format is deliberately flat: a movement with a `parallel` array is a
//! container, anything else is an agent movement. Conditions are parsed here so
//! the engine only ever sees classified rules.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::core::condition::parse_condition;
use crate::core::piece::{
    AgentStep, LoopMonitor, LoopMonitorJudge, Movement, MovementKind, PermissionMode, PieceConfig,
    ReportFile, Rule, Transition,
};
use crate::error::ConfigError;

const DEFAULT_MAX_ITERATIONS: u32 = 10;

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPiece {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    initial_movement: Option<String>,
    #[serde(default = "default_max_iterations")]
    max_iterations: u32,
    #[serde(default)]
    answer_persona: Option<String>,
    movements: Vec<RawMovement>,
    #[serde(default)]
    loop_monitors: Vec<RawLoopMonitor>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMovement {
    name: String,
    #[serde(default)]
    persona: Option<String>,
    #[serde(default)]
    instruction: String,
    #[serde(default)]
    rules: Vec<RawRule>,
    #[serde(default)]
    report: Vec<RawReport>,
    #[serde(default)]
    parallel: Option<Vec<RawMovement>>,
    #[serde(default = "default_true")]
    pass_previous_response: bool,
    #[serde(default)]
    allowed_tools: Vec<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    permission_mode: Option<PermissionMode>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    condition: String,
    #[serde(default)]
    next: Option<String>,
}

/// `report = ["plan.md"]` or `report = [{ name = "plan.md", format = "..." }]`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawReport {
    Name(String),
    File(ReportFile),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLoopMonitor {
    cycle: Vec<String>,
    threshold: u32,
    judge: RawLoopJudge,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLoopJudge {
    persona: String,
    #[serde(default)]
    instruction: String,
    rules: Vec<RawRule>,
}

/// Parse a piece definition from TOML text. Structural validation happens
/// when the engine is constructed.
pub fn parse_piece(contents: &str) -> Result<PieceConfig> {
    let raw: RawPiece = toml::from_str(contents).context("parse piece toml")?;
    let piece = normalize(raw)?;
    debug!(piece = %piece.name, movements = piece.movements.len(), "parsed piece");
    Ok(piece)
}

/// Load and parse a piece file.
pub fn load_piece(path: &Path) -> Result<PieceConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_piece(&contents).with_context(|| format!("load piece {}", path.display()))
}

fn normalize(raw: RawPiece) -> Result<PieceConfig, ConfigError> {
    let initial_movement = match raw.initial_movement {
        Some(name) => name,
        None => raw
            .movements
            .first()
            .map(|m| m.name.clone())
            .unwrap_or_default(),
    };
    let movements = raw
        .movements
        .into_iter()
        .map(normalize_movement)
        .collect::<Result<Vec<_>, _>>()?;
    let loop_monitors = raw
        .loop_monitors
        .into_iter()
        .map(|monitor| {
            Ok(LoopMonitor {
                cycle: monitor.cycle,
                threshold: monitor.threshold,
                judge: LoopMonitorJudge {
                    persona: monitor.judge.persona,
                    instruction: monitor.judge.instruction,
                    rules: normalize_rules(monitor.judge.rules)?,
                },
            })
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    Ok(PieceConfig {
        name: raw.name,
        description: raw.description,
        movements,
        initial_movement,
        max_iterations: raw.max_iterations,
        loop_monitors,
        answer_persona: raw.answer_persona,
    })
}

fn normalize_movement(raw: RawMovement) -> Result<Movement, ConfigError> {
    let rules = normalize_rules(raw.rules)?;
    let kind = match raw.parallel {
        Some(subs) => {
            if raw.persona.is_some() {
                return Err(ConfigError::PersonaOnParallel(raw.name));
            }
            let movements = subs
                .into_iter()
                .map(normalize_movement)
                .collect::<Result<Vec<_>, _>>()?;
            MovementKind::Parallel { movements }
        }
        None => {
            let Some(persona) = raw.persona else {
                return Err(ConfigError::MissingPersona(raw.name));
            };
            MovementKind::Agent(AgentStep {
                persona,
                instruction: raw.instruction,
                report: raw
                    .report
                    .into_iter()
                    .map(|report| match report {
                        RawReport::Name(name) => ReportFile { name, format: None },
                        RawReport::File(file) => file,
                    })
                    .collect(),
                allowed_tools: raw.allowed_tools,
                model: raw.model,
                permission_mode: raw.permission_mode,
            })
        }
    };

    Ok(Movement {
        name: raw.name,
        rules,
        pass_previous_response: raw.pass_previous_response,
        kind,
    })
}

fn normalize_rules(raw: Vec<RawRule>) -> Result<Vec<Rule>, ConfigError> {
    raw.into_iter()
        .map(|rule| {
            Ok(Rule {
                condition: parse_condition(&rule.condition)?,
                next: rule.next.as_deref().map(Transition::parse),
            })
        })
        .collect()
}
