//! Engine configuration, usually `piece.toml` next to the piece files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::loop_detector::LoopThresholds;

/// Engine configuration (TOML).
///
/// Missing fields default to values suitable for a local agent CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Persona used to judge `ai()` conditions and fallbacks.
    pub judge_persona: String,

    /// Directory handed to movements with report directives.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_dir: Option<PathBuf>,

    pub loop_detection: LoopThresholds,

    pub agent: AgentCommandConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentCommandConfig {
    /// Agent CLI to spawn per call (e.g. `["piece-agent", "--json"]`).
    pub command: Vec<String>,

    /// Wall-clock budget for a single agent call.
    pub timeout_secs: u64,

    /// Truncate agent stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            command: vec!["piece-agent".to_string()],
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            judge_persona: "judge".to_string(),
            report_dir: None,
            loop_detection: LoopThresholds::default(),
            agent: AgentCommandConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.judge_persona.trim().is_empty() {
            return Err(anyhow!("judge_persona must be non-empty"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        let thresholds = &self.loop_detection;
        if thresholds.warn_threshold > 0
            && thresholds.abort_threshold > 0
            && thresholds.warn_threshold > thresholds.abort_threshold
        {
            return Err(anyhow!(
                "loop_detection.warn_threshold must not exceed abort_threshold"
            ));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.loop_detection.warn_threshold, 5);
        assert_eq!(cfg.loop_detection.abort_threshold, 10);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("piece.toml");
        let cfg = EngineConfig {
            report_dir: Some(PathBuf::from("reports")),
            ..EngineConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("piece.toml");
        fs::write(
            &path,
            concat!(
                "[agent]\ncommand = [\"my-agent\", \"--json\"]\n\n",
                "[loop_detection]\nabort_threshold = 3\nwarn_threshold = 2\n",
            ),
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.agent.command, vec!["my-agent", "--json"]);
        assert_eq!(cfg.agent.timeout_secs, 30 * 60);
        assert_eq!(cfg.loop_detection.abort_threshold, 3);
        assert_eq!(cfg.judge_persona, "judge");
    }

    #[test]
    fn rejects_empty_command() {
        let mut cfg = EngineConfig::default();
        cfg.agent.command = vec![" ".to_string()];
        assert!(cfg.validate().is_err());
    }
}
