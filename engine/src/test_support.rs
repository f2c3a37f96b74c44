//! Test-only helpers: scripted invokers and piece builders.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::core::condition::parse_condition;
use crate::core::piece::{
    AgentStep, Movement, MovementKind, PieceConfig, ReportFile, Rule, Transition,
};
use crate::core::types::AgentStatus;
use crate::io::invoker::{AgentInvoker, AgentReply, CallOptions, JudgeCondition, JudgeInvoker};

/// One recorded agent call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub persona: String,
    pub instruction: String,
    pub options: CallOptions,
}

/// Agent invoker that answers from per-persona reply queues.
///
/// Calls for a persona with an empty queue fail, so a test notices any call it
/// did not expect.
#[derive(Default)]
pub struct ScriptedInvoker {
    replies: Mutex<HashMap<String, VecDeque<Result<AgentReply, String>>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for `persona`.
    pub fn reply(self, persona: &str, reply: AgentReply) -> Self {
        self.push(persona, Ok(reply));
        self
    }

    /// Queue a `done` reply for `persona`.
    pub fn reply_done(self, persona: &str, content: &str, session_id: Option<&str>) -> Self {
        self.reply(persona, AgentReply::done(content, session_id))
    }

    /// Queue a reply with an explicit status.
    pub fn reply_status(
        self,
        persona: &str,
        status: AgentStatus,
        content: &str,
        session_id: Option<&str>,
    ) -> Self {
        self.reply(
            persona,
            AgentReply {
                status,
                content: content.to_string(),
                session_id: session_id.map(str::to_string),
            },
        )
    }

    /// Queue an invoker failure for `persona`.
    pub fn fail(self, persona: &str, message: &str) -> Self {
        self.push(persona, Err(message.to_string()));
        self
    }

    fn push(&self, persona: &str, reply: Result<AgentReply, String>) {
        self.replies
            .lock()
            .expect("replies lock")
            .entry(persona.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn calls_for(&self, persona: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.persona == persona)
            .collect()
    }

    /// Replies queued but never consumed.
    pub fn remaining(&self) -> usize {
        self.replies
            .lock()
            .expect("replies lock")
            .values()
            .map(VecDeque::len)
            .sum()
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn call(
        &self,
        persona: &str,
        instruction: &str,
        options: &CallOptions,
    ) -> Result<AgentReply> {
        self.calls.lock().expect("calls lock").push(RecordedCall {
            persona: persona.to_string(),
            instruction: instruction.to_string(),
            options: options.clone(),
        });
        let next = self
            .replies
            .lock()
            .expect("replies lock")
            .get_mut(persona)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted reply for persona `{persona}`")),
        }
    }
}

/// One recorded judge call.
#[derive(Debug, Clone)]
pub struct JudgeCall {
    pub content: String,
    pub conditions: Vec<JudgeCondition>,
}

/// Judge that returns queued decisions in order. An empty queue answers `None`.
#[derive(Default)]
pub struct ScriptedJudge {
    decisions: Mutex<VecDeque<Option<usize>>>,
    calls: Mutex<Vec<JudgeCall>>,
}

impl ScriptedJudge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a decision, expressed as the chosen condition's `index`.
    pub fn decide(self, decision: Option<usize>) -> Self {
        self.decisions
            .lock()
            .expect("decisions lock")
            .push_back(decision);
        self
    }

    pub fn calls(&self) -> Vec<JudgeCall> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl JudgeInvoker for ScriptedJudge {
    async fn evaluate(
        &self,
        content: &str,
        conditions: &[JudgeCondition],
    ) -> Result<Option<usize>> {
        self.calls.lock().expect("calls lock").push(JudgeCall {
            content: content.to_string(),
            conditions: conditions.to_vec(),
        });
        Ok(self
            .decisions
            .lock()
            .expect("decisions lock")
            .pop_front()
            .flatten())
    }
}

/// Rule from a raw condition string and target (`COMPLETE`/`ABORT` allowed).
pub fn rule(condition: &str, next: &str) -> Rule {
    Rule {
        condition: parse_condition(condition).expect("valid condition"),
        next: Some(Transition::parse(next)),
    }
}

/// Rule without a target, as used on sub-movements.
pub fn sub_rule(condition: &str) -> Rule {
    Rule {
        condition: parse_condition(condition).expect("valid condition"),
        next: None,
    }
}

/// Agent movement with a plain instruction and deterministic defaults.
pub fn agent_movement(name: &str, persona: &str, rules: Vec<Rule>) -> Movement {
    Movement {
        name: name.to_string(),
        rules,
        pass_previous_response: true,
        kind: MovementKind::Agent(AgentStep {
            persona: persona.to_string(),
            instruction: format!("Run {name}."),
            report: Vec::new(),
            allowed_tools: vec![
                "Read".to_string(),
                "Edit".to_string(),
                "Write".to_string(),
            ],
            model: None,
            permission_mode: None,
        }),
    }
}

/// Agent movement with a report directive.
pub fn reporting_movement(name: &str, persona: &str, report: &str, rules: Vec<Rule>) -> Movement {
    let mut movement = agent_movement(name, persona, rules);
    if let MovementKind::Agent(step) = &mut movement.kind {
        step.report.push(ReportFile {
            name: report.to_string(),
            format: None,
        });
    }
    movement
}

pub fn parallel_movement(name: &str, subs: Vec<Movement>, rules: Vec<Rule>) -> Movement {
    Movement {
        name: name.to_string(),
        rules,
        pass_previous_response: true,
        kind: MovementKind::Parallel { movements: subs },
    }
}

/// Piece starting at `initial` with `max_iterations = 10`.
pub fn piece(initial: &str, movements: Vec<Movement>) -> PieceConfig {
    PieceConfig {
        name: "test-piece".to_string(),
        description: None,
        movements,
        initial_movement: initial.to_string(),
        max_iterations: 10,
        loop_monitors: Vec::new(),
        answer_persona: None,
    }
}
