//! Invoker abstractions for agent and judge calls.
//!
//! [`AgentInvoker`] decouples movement execution from the actual agent backend
//! (see [`crate::io::command::CommandInvoker`]). [`JudgeInvoker`] picks among
//! rule conditions when deterministic detection fails. Tests use scripted
//! implementations that return queued replies without spawning processes.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::piece::PermissionMode;
use crate::core::types::AgentStatus;

/// Receives streamed output chunks while an agent runs.
pub type StreamCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Tool name withheld from the execution phase when a report is configured.
pub const WRITE_TOOL: &str = "Write";
/// Tool name withheld from the execution phase when a report is configured.
pub const EDIT_TOOL: &str = "Edit";

/// Per-call options forwarded to the invoker.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub cwd: PathBuf,
    /// Session to resume; `None` starts a new conversation.
    pub session_id: Option<String>,
    pub allowed_tools: Vec<String>,
    pub model: Option<String>,
    pub permission_mode: Option<PermissionMode>,
    pub on_stream: Option<StreamCallback>,
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("cwd", &self.cwd)
            .field("session_id", &self.session_id)
            .field("allowed_tools", &self.allowed_tools)
            .field("model", &self.model)
            .field("permission_mode", &self.permission_mode)
            .field("on_stream", &self.on_stream.is_some())
            .finish()
    }
}

/// What an agent call returns. Only status and session handle are load-bearing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReply {
    pub status: AgentStatus,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AgentReply {
    pub fn done(content: impl Into<String>, session_id: Option<&str>) -> Self {
        Self {
            status: AgentStatus::Done,
            content: content.into(),
            session_id: session_id.map(str::to_string),
        }
    }
}

/// Abstraction over agent backends.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Run `persona` on `instruction`. Retries and timeouts are the implementor's concern.
    async fn call(&self, persona: &str, instruction: &str, options: &CallOptions)
    -> Result<AgentReply>;
}

/// A condition offered to the judge, tagged with the caller's own index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeCondition {
    pub index: usize,
    pub text: String,
}

/// Picks the condition that best describes `content`.
#[async_trait]
pub trait JudgeInvoker: Send + Sync {
    /// Returns the `index` of the chosen condition, or `None` when none applies.
    async fn evaluate(&self, content: &str, conditions: &[JudgeCondition])
    -> Result<Option<usize>>;
}
