//! Agent invoker backed by an external command.
//!
//! Each call spawns `agent.command` with the instruction on stdin. Call options
//! travel as `PIECE_*` environment variables and the command prints a single
//! JSON reply (see `schemas/agent_reply.schema.json`) on stdout.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use jsonschema::{Draft, Validator};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::io::config::AgentCommandConfig;
use crate::io::invoker::{AgentInvoker, AgentReply, CallOptions};
use crate::io::process::run_command;

const AGENT_REPLY_SCHEMA: &str = include_str!("../../schemas/agent_reply.schema.json");

pub const ENV_PERSONA: &str = "PIECE_PERSONA";
pub const ENV_SESSION_ID: &str = "PIECE_SESSION_ID";
pub const ENV_ALLOWED_TOOLS: &str = "PIECE_ALLOWED_TOOLS";
pub const ENV_MODEL: &str = "PIECE_MODEL";
pub const ENV_PERMISSION_MODE: &str = "PIECE_PERMISSION_MODE";

/// Spawns the configured agent CLI once per call.
pub struct CommandInvoker {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    validator: Validator,
}

impl CommandInvoker {
    pub fn new(config: &AgentCommandConfig) -> Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent.command must be a non-empty array"))?;
        let schema: Value =
            serde_json::from_str(AGENT_REPLY_SCHEMA).context("parse agent reply schema")?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .context("compile agent reply schema")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            validator,
        })
    }

    fn command(&self, persona: &str, options: &CallOptions) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&options.cwd)
            .env(ENV_PERSONA, persona)
            .env(ENV_ALLOWED_TOOLS, options.allowed_tools.join(","));
        match &options.session_id {
            Some(session) => cmd.env(ENV_SESSION_ID, session),
            None => cmd.env_remove(ENV_SESSION_ID),
        };
        match &options.model {
            Some(model) => cmd.env(ENV_MODEL, model),
            None => cmd.env_remove(ENV_MODEL),
        };
        match options.permission_mode {
            Some(mode) => cmd.env(ENV_PERMISSION_MODE, mode.as_str()),
            None => cmd.env_remove(ENV_PERMISSION_MODE),
        };
        cmd
    }

    /// Parse stdout as the reply. Progress lines before the reply are tolerated:
    /// when the whole output is not JSON, the last non-empty line is used.
    fn parse_reply(&self, stdout: &str) -> Result<AgentReply> {
        let trimmed = stdout.trim();
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(whole_err) => {
                let last = trimmed
                    .lines()
                    .rev()
                    .find(|line| !line.trim().is_empty())
                    .ok_or_else(|| anyhow!("agent printed no reply"))?;
                serde_json::from_str(last)
                    .map_err(|_| whole_err)
                    .context("parse agent reply json")?
            }
        };

        let messages: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            bail!("agent reply schema validation failed:\n- {}", messages.join("\n- "));
        }
        serde_json::from_value(value).context("decode agent reply")
    }
}

#[async_trait]
impl AgentInvoker for CommandInvoker {
    #[instrument(
        skip_all,
        fields(
            persona = %persona,
            resume = options.session_id.is_some(),
            timeout_secs = self.timeout.as_secs()
        )
    )]
    async fn call(
        &self,
        persona: &str,
        instruction: &str,
        options: &CallOptions,
    ) -> Result<AgentReply> {
        info!(program = %self.program, cwd = %options.cwd.display(), "starting agent command");
        let cmd = self.command(persona, options);
        let output = run_command(
            cmd,
            instruction.as_bytes(),
            self.timeout,
            self.output_limit_bytes,
            options.on_stream.clone(),
        )
        .await
        .with_context(|| format!("run agent command `{}`", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(exit_code = ?output.status.code(), "agent command failed");
            bail!(
                "agent command exited with status {:?}: {}{}",
                output.status.code(),
                stderr.trim(),
                output.stderr_truncated_notice("agent")
            );
        }
        if output.stdout_truncated > 0 {
            bail!(
                "agent reply exceeded output limit{}",
                output.stdout_truncated_notice("agent")
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply = self.parse_reply(&stdout)?;
        debug!(status = reply.status.as_str(), session = ?reply.session_id, "parsed agent reply");
        Ok(reply)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::piece::PermissionMode;
    use crate::core::types::AgentStatus;

    fn invoker(script: &str) -> CommandInvoker {
        CommandInvoker::new(&AgentCommandConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs: 5,
            output_limit_bytes: 64 * 1024,
        })
        .expect("invoker")
    }

    fn options() -> CallOptions {
        CallOptions {
            cwd: std::env::temp_dir(),
            ..CallOptions::default()
        }
    }

    #[tokio::test]
    async fn passes_options_through_environment() {
        let invoker = invoker(
            concat!(
                r#"cat >/dev/null; printf '{"status":"done","content":"%s|%s|%s|%s","#,
                r#""session_id":"s-1"}' "$PIECE_PERSONA" "$PIECE_SESSION_ID" "#,
                r#""$PIECE_ALLOWED_TOOLS" "$PIECE_PERMISSION_MODE""#,
            ),
        );
        let opts = CallOptions {
            session_id: Some("s-0".to_string()),
            allowed_tools: vec!["Read".to_string(), "Write".to_string()],
            permission_mode: Some(PermissionMode::AcceptEdits),
            ..options()
        };
        let reply = invoker.call("coder", "do it", &opts).await.expect("call");
        assert_eq!(reply.status, AgentStatus::Done);
        assert_eq!(reply.content, "coder|s-0|Read,Write|accept_edits");
        assert_eq!(reply.session_id.as_deref(), Some("s-1"));
    }

    #[tokio::test]
    async fn instruction_arrives_on_stdin() {
        let invoker = invoker(
            r#"body=$(cat); printf '{"status":"blocked","content":"%s"}' "$body""#,
        );
        let reply = invoker.call("p", "need input", &options()).await.expect("call");
        assert_eq!(reply.status, AgentStatus::Blocked);
        assert_eq!(reply.content, "need input");
        assert!(reply.session_id.is_none());
    }

    #[tokio::test]
    async fn tolerates_progress_lines_before_reply() {
        let invoker = invoker(
            r#"cat >/dev/null; echo "thinking..."; echo '{"status":"done","content":"ok"}'"#,
        );
        let reply = invoker.call("p", "x", &options()).await.expect("call");
        assert_eq!(reply.content, "ok");
    }

    #[tokio::test]
    async fn rejects_reply_violating_schema() {
        let invoker = invoker(r#"cat >/dev/null; echo '{"status":"finished","content":"ok"}'"#);
        let err = invoker.call("p", "x", &options()).await.unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let invoker = invoker("cat >/dev/null; echo boom >&2; exit 3");
        let err = invoker.call("p", "x", &options()).await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("Some(3)"));
        assert!(message.contains("boom"));
    }
}
