//! Judge implementation that asks an agent persona to pick a condition.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::core::tags::detect_tag;
use crate::core::types::AgentStatus;
use crate::io::invoker::{AgentInvoker, CallOptions, JudgeCondition, JudgeInvoker};
use crate::io::prompt::PromptBuilder;

/// Tag namespace the judge answers in (`[JUDGE:N]`).
const JUDGE_TAG: &str = "JUDGE";

/// Asks a dedicated persona, in a fresh session with no tools, to choose a condition.
pub struct AgentJudge {
    invoker: Arc<dyn AgentInvoker>,
    persona: String,
    cwd: PathBuf,
    prompts: Arc<PromptBuilder>,
}

impl AgentJudge {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        persona: impl Into<String>,
        cwd: impl Into<PathBuf>,
        prompts: Arc<PromptBuilder>,
    ) -> Self {
        Self {
            invoker,
            persona: persona.into(),
            cwd: cwd.into(),
            prompts,
        }
    }
}

#[async_trait]
impl JudgeInvoker for AgentJudge {
    #[instrument(skip_all, fields(persona = %self.persona, conditions = conditions.len()))]
    async fn evaluate(
        &self,
        content: &str,
        conditions: &[JudgeCondition],
    ) -> Result<Option<usize>> {
        if conditions.is_empty() {
            return Ok(None);
        }
        let instruction = self.prompts.render_judge(content, conditions)?;
        let options = CallOptions {
            cwd: self.cwd.clone(),
            ..CallOptions::default()
        };
        let reply = self
            .invoker
            .call(&self.persona, &instruction, &options)
            .await?;
        if reply.status != AgentStatus::Done {
            warn!(status = reply.status.as_str(), "judge did not finish");
            return Ok(None);
        }
        let picked = detect_tag(JUDGE_TAG, &reply.content, conditions.len())
            .map(|position| conditions[position].index);
        debug!(?picked, "judge decided");
        Ok(picked)
    }
}
