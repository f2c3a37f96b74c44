//! The piece state machine.
//!
//! [`PieceEngine`] owns the [`PieceState`] and is the only writer. Each
//! iteration checks the iteration budget and the loop detector, runs one
//! movement (agent or parallel), then follows the matched rule. Failures while
//! a movement runs abort the piece; only host failures escape `run()`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument, warn};

use crate::core::cycle::{CycleDetector, CycleTrigger};
use crate::core::loop_detector::{LoopCheck, LoopDetector, LoopThresholds};
use crate::core::piece::{Movement, PieceConfig, Transition};
use crate::core::state::PieceState;
use crate::core::types::{AgentResponse, AgentStatus, PieceStatus};
use crate::core::validate::validate_piece;
use crate::error::{ConfigError, EngineError};
use crate::events::{EngineHooks, EventSink, NoopHooks, PieceEvent};
use crate::io::invoker::{AgentInvoker, CallOptions, JudgeInvoker, StreamCallback};
use crate::io::prompt::{InstructionContext, PromptBuilder};
use crate::parallel::ParallelRunner;
use crate::rules::{RuleEvaluator, RuleInput};
use crate::step::{StepExecutor, StepRequest};

/// Tag namespace of loop monitor judges (`[LOOP_JUDGE:N]`).
pub const LOOP_JUDGE: &str = "loop_judge";

/// Host-supplied wiring for a run.
pub struct EngineOptions {
    /// Working directory handed to every agent call.
    pub cwd: PathBuf,
    pub report_dir: Option<PathBuf>,
    pub loop_thresholds: LoopThresholds,
    /// Persona session handles carried over from an earlier run.
    pub initial_sessions: HashMap<String, String>,
    pub events: Option<UnboundedSender<PieceEvent>>,
    pub hooks: Arc<dyn EngineHooks>,
    pub on_stream: Option<StreamCallback>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cwd: PathBuf::from("."),
            report_dir: None,
            loop_thresholds: LoopThresholds::default(),
            initial_sessions: HashMap::new(),
            events: None,
            hooks: Arc::new(NoopHooks),
            on_stream: None,
        }
    }
}

/// Final result of [`PieceEngine::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceOutcome {
    pub status: PieceStatus,
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub state: PieceState,
}

/// What one call to [`PieceEngine::run_single_iteration`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationOutcome {
    pub movement: String,
    /// `None` when the iteration stopped before running the movement.
    pub response: Option<AgentResponse>,
    pub next: Option<Transition>,
    pub status: PieceStatus,
}

pub struct PieceEngine {
    config: PieceConfig,
    task: String,
    state: PieceState,
    max_iterations: u32,
    invoker: Arc<dyn AgentInvoker>,
    steps: StepExecutor,
    parallel: ParallelRunner,
    prompts: Arc<PromptBuilder>,
    loop_detector: LoopDetector,
    cycles: CycleDetector,
    cwd: PathBuf,
    report_dir: Option<PathBuf>,
    events: EventSink,
    hooks: Arc<dyn EngineHooks>,
    on_stream: Option<StreamCallback>,
}

impl PieceEngine {
    /// Validate `config` and prepare a run. Nothing is invoked on failure.
    pub fn new(
        config: PieceConfig,
        task: impl Into<String>,
        invoker: Arc<dyn AgentInvoker>,
        judge: Arc<dyn JudgeInvoker>,
        options: EngineOptions,
    ) -> Result<Self, ConfigError> {
        validate_piece(&config)?;
        let prompts = Arc::new(PromptBuilder::new());
        let steps = StepExecutor::new(
            Arc::clone(&invoker),
            RuleEvaluator::new(judge),
            Arc::clone(&prompts),
        );
        let state = PieceState::new(
            config.name.as_str(),
            config.initial_movement.as_str(),
            options.initial_sessions,
        );
        Ok(Self {
            max_iterations: config.max_iterations,
            loop_detector: LoopDetector::new(options.loop_thresholds),
            cycles: CycleDetector::new(&config.loop_monitors),
            parallel: ParallelRunner::new(steps.clone()),
            steps,
            prompts,
            invoker,
            state,
            task: task.into(),
            config,
            cwd: options.cwd,
            report_dir: options.report_dir,
            events: options.events.map(EventSink::new).unwrap_or_default(),
            hooks: options.hooks,
            on_stream: options.on_stream,
        })
    }

    pub fn state(&self) -> &PieceState {
        &self.state
    }

    pub fn config(&self) -> &PieceConfig {
        &self.config
    }

    /// Run until the piece completes or aborts.
    #[instrument(skip_all, fields(piece = %self.config.name))]
    pub async fn run(&mut self) -> Result<PieceOutcome, EngineError> {
        info!(initial = %self.state.current_movement, "piece started");
        while self.state.is_running() {
            self.run_single_iteration().await?;
        }
        info!(
            status = self.state.status.as_str(),
            iterations = self.state.iteration,
            "piece finished"
        );
        Ok(PieceOutcome {
            status: self.state.status,
            iterations: self.state.iteration,
            reason: self.state.abort_reason.clone(),
            state: self.state.clone(),
        })
    }

    /// Run at most one movement and apply its transition.
    pub async fn run_single_iteration(&mut self) -> Result<IterationOutcome, EngineError> {
        let name = self.state.current_movement.clone();
        if !self.state.is_running() {
            return Ok(self.stopped(name));
        }

        if self.state.iteration >= self.max_iterations && !self.extend_iterations().await {
            return Ok(self.stopped(name));
        }

        let movement = self
            .config
            .movement(&name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownMovement(name.clone()))?;

        match self.loop_detector.check(&name) {
            LoopCheck::Ok => {}
            LoopCheck::Warn { count } => {
                warn!(movement = %name, count, "movement repeating");
                self.events.emit(PieceEvent::LoopWarning {
                    movement: name.clone(),
                    count,
                });
            }
            LoopCheck::Abort { count } => {
                self.events.emit(PieceEvent::LoopDetected {
                    movement: name.clone(),
                    count,
                });
                self.abort(format!(
                    "Loop detected: movement `{name}` entered {count} times in a row"
                ));
                return Ok(self.stopped(name));
            }
        }

        self.state.iteration += 1;
        let movement_iteration = self.state.bump_movement_iteration(&name);
        info!(
            movement = %name,
            iteration = self.state.iteration,
            movement_iteration,
            "movement started"
        );
        self.events.emit(PieceEvent::MovementStart {
            movement: name.clone(),
            iteration: self.state.iteration,
            movement_iteration,
        });

        let result = if movement.is_parallel() {
            self.execute_parallel(&movement).await?
        } else {
            self.execute_agent(&movement, movement_iteration).await
        };
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(movement = %name, error = %err, "movement failed");
                self.abort(err.to_string());
                return Ok(self.stopped(name));
            }
        };

        self.state.record_output(&name, response.clone());
        self.state.history.push(name.clone());

        let next = match response.status {
            AgentStatus::Done => self.resolve_transition(&movement, &response).await,
            AgentStatus::Blocked => {
                self.handle_blocked(&movement, &response).await;
                None
            }
            AgentStatus::Interrupted | AgentStatus::Error => {
                self.abort(format!(
                    "Movement `{name}` ended with status {}",
                    response.status.as_str()
                ));
                None
            }
        };

        Ok(IterationOutcome {
            movement: name,
            response: Some(response),
            next,
            status: self.state.status,
        })
    }

    /// Ask the host for more iterations. Returns false after aborting.
    async fn extend_iterations(&mut self) -> bool {
        let iteration = self.state.iteration;
        self.events.emit(PieceEvent::IterationLimitReached {
            iteration,
            max_iterations: self.max_iterations,
        });
        match self
            .hooks
            .on_iteration_limit(iteration, self.max_iterations)
            .await
        {
            Some(extra) if extra > 0 => {
                self.max_iterations = self.max_iterations.saturating_add(extra);
                info!(extra, max_iterations = self.max_iterations, "iteration limit extended");
                true
            }
            _ => {
                self.abort(format!("Reached max iterations ({})", self.max_iterations));
                false
            }
        }
    }

    fn instruction_context(
        &self,
        movement: &Movement,
        movement_iteration: u32,
    ) -> InstructionContext {
        InstructionContext {
            task: self.task.clone(),
            iteration: self.state.iteration,
            max_iterations: self.max_iterations,
            movement: movement.name.clone(),
            movement_iteration,
            previous_response: movement
                .pass_previous_response
                .then(|| self.state.previous_response().map(|r| r.content.clone()))
                .flatten(),
            user_inputs: self.state.user_inputs.clone(),
            report_dir: self
                .report_dir
                .as_ref()
                .map(|dir| dir.display().to_string()),
        }
    }

    async fn execute_agent(
        &mut self,
        movement: &Movement,
        movement_iteration: u32,
    ) -> Result<AgentResponse, EngineError> {
        let persona = movement
            .agent()
            .map(|step| step.persona.clone())
            .ok_or_else(|| EngineError::UnknownMovement(movement.name.clone()))?;
        let request = StepRequest {
            context: self.instruction_context(movement, movement_iteration),
            cwd: self.cwd.clone(),
            session_id: self.state.persona_sessions.get(&persona).cloned(),
            on_stream: self.on_stream.clone(),
        };
        match self.steps.execute(movement, request).await {
            Ok(response) => {
                if let Some(session) = &response.session_id {
                    self.update_session(&persona, session).await;
                }
                Ok(response)
            }
            Err(failure) => {
                if let Some(partial) = failure.partial {
                    if let Some(session) = &partial.session_id {
                        self.update_session(&persona, session).await;
                    }
                    self.state.record_output(&movement.name, partial);
                }
                Err(failure.error)
            }
        }
    }

    /// Outer `Err` is a host failure; inner `Err` aborts the piece.
    async fn execute_parallel(
        &mut self,
        movement: &Movement,
    ) -> Result<Result<AgentResponse, EngineError>, EngineError> {
        let mut requests = Vec::new();
        for sub in movement.sub_movements() {
            let sub_iteration = self.state.bump_movement_iteration(&sub.name);
            requests.push(StepRequest {
                context: self.instruction_context(sub, sub_iteration),
                cwd: self.cwd.clone(),
                session_id: None,
                on_stream: self.on_stream.clone(),
            });
        }

        let outcome = self.parallel.run(movement, requests).await?;
        for (name, response) in outcome.subs {
            if let Some(session) = &response.session_id {
                self.update_session(&response.persona, session).await;
            }
            self.state.record_output(&name, response);
        }
        Ok(outcome.result)
    }

    async fn update_session(&mut self, persona: &str, session_id: &str) {
        if !self.state.update_session(persona, session_id) {
            return;
        }
        debug!(persona, session_id, "session updated");
        self.hooks.on_session_update(persona, session_id).await;
        self.events.emit(PieceEvent::SessionUpdated {
            persona: persona.to_string(),
            session_id: session_id.to_string(),
        });
    }

    /// Follow the matched rule (or a loop judge's override) for a finished movement.
    async fn resolve_transition(
        &mut self,
        movement: &Movement,
        response: &AgentResponse,
    ) -> Option<Transition> {
        let matched = response
            .rule_match()
            .and_then(|matched| movement.rules.get(matched.index))
            .and_then(|rule| rule.next.clone());
        let Some(mut next) = matched else {
            let err = EngineError::RuleResolution {
                movement: movement.name.clone(),
            };
            self.abort(err.to_string());
            return None;
        };

        if let Some(trigger) = self.cycles.record(&movement.name) {
            match self.run_loop_judge(trigger, response).await {
                Ok(redirect) => {
                    info!(from = %next, to = %redirect, "loop judge redirected");
                    next = redirect;
                }
                Err(err) => {
                    self.abort(err.to_string());
                    return None;
                }
            }
        }

        self.events.emit(PieceEvent::MovementComplete {
            movement: movement.name.clone(),
            response: response.clone(),
            next: Some(next.to_string()),
        });
        match &next {
            Transition::Complete => {
                self.state.complete();
                info!(iterations = self.state.iteration, "piece completed");
                self.events.emit(PieceEvent::PieceComplete {
                    iterations: self.state.iteration,
                });
            }
            Transition::Abort => {
                self.abort(format!("Movement `{}` routed to ABORT", movement.name));
            }
            Transition::Movement(target) => {
                debug!(from = %movement.name, to = %target, "transition");
                self.state.current_movement = target.clone();
            }
        }
        Some(next)
    }

    async fn run_loop_judge(
        &mut self,
        trigger: CycleTrigger,
        last: &AgentResponse,
    ) -> Result<Transition, EngineError> {
        let monitor = self.config.loop_monitors[trigger.monitor].clone();
        warn!(
            cycle = ?monitor.cycle,
            occurrences = trigger.occurrences,
            "cycle threshold reached"
        );
        self.events.emit(PieceEvent::CycleDetected {
            cycle: monitor.cycle.clone(),
            occurrences: trigger.occurrences,
        });

        let context = InstructionContext {
            task: self.task.clone(),
            iteration: self.state.iteration,
            max_iterations: self.max_iterations,
            movement: LOOP_JUDGE.to_string(),
            movement_iteration: trigger.occurrences,
            previous_response: Some(last.content.clone()),
            user_inputs: self.state.user_inputs.clone(),
            report_dir: None,
        };
        let instruction = self
            .prompts
            .render_loop_judge(
                LOOP_JUDGE,
                &monitor.judge.instruction,
                &context,
                &monitor.cycle,
                trigger.occurrences,
                &monitor.judge.rules,
            )
            .map_err(|err| EngineError::execution(LOOP_JUDGE, err))?;
        let persona = monitor.judge.persona.as_str();
        let options = CallOptions {
            cwd: self.cwd.clone(),
            session_id: self.state.persona_sessions.get(persona).cloned(),
            ..CallOptions::default()
        };
        let reply = self
            .invoker
            .call(persona, &instruction, &options)
            .await
            .map_err(|err| EngineError::execution(LOOP_JUDGE, err))?;
        if let Some(session) = &reply.session_id {
            self.update_session(persona, session).await;
        }
        if reply.status != AgentStatus::Done {
            return Err(EngineError::execution(
                LOOP_JUDGE,
                anyhow!("judge ended with status {}", reply.status.as_str()),
            ));
        }

        let matched = self
            .steps
            .rules()
            .evaluate(RuleInput {
                movement: LOOP_JUDGE,
                rules: &monitor.judge.rules,
                phase1: &reply.content,
                phase3: "",
                sub_matches: None,
            })
            .await?;
        monitor.judge.rules[matched.index]
            .next
            .clone()
            .ok_or_else(|| EngineError::RuleResolution {
                movement: LOOP_JUDGE.to_string(),
            })
    }

    /// Try the answer persona, then the host. Supplied input re-runs the movement.
    async fn handle_blocked(&mut self, movement: &Movement, response: &AgentResponse) {
        info!(movement = %movement.name, "movement blocked");
        self.events.emit(PieceEvent::MovementBlocked {
            movement: movement.name.clone(),
            response: response.clone(),
        });

        let mut input = self.ask_answer_persona(movement, response).await;
        if input.is_none() {
            input = self.hooks.on_user_input(&movement.name, response).await;
        }
        match input {
            Some(input) => {
                debug!(movement = %movement.name, "user input supplied");
                self.state.user_inputs.push(input);
            }
            None => self.abort(format!(
                "Movement `{}` is blocked and no user input was provided",
                movement.name
            )),
        }
    }

    async fn ask_answer_persona(
        &mut self,
        movement: &Movement,
        response: &AgentResponse,
    ) -> Option<String> {
        let persona = self.config.answer_persona.clone()?;
        let instruction = match self
            .prompts
            .render_answer(&self.task, &movement.name, &response.content)
        {
            Ok(instruction) => instruction,
            Err(err) => {
                warn!(error = %err, "render answer prompt failed");
                return None;
            }
        };
        let options = CallOptions {
            cwd: self.cwd.clone(),
            session_id: self.state.persona_sessions.get(&persona).cloned(),
            ..CallOptions::default()
        };
        let reply = match self.invoker.call(&persona, &instruction, &options).await {
            Ok(reply) => reply,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(persona = %persona, error = %message, "answer persona failed");
                return None;
            }
        };
        if let Some(session) = &reply.session_id {
            self.update_session(&persona, session).await;
        }
        (reply.status == AgentStatus::Done && !reply.content.trim().is_empty())
            .then_some(reply.content)
    }

    fn abort(&mut self, reason: String) {
        warn!(reason = %reason, "piece aborted");
        self.events.emit(PieceEvent::PieceAbort {
            iterations: self.state.iteration,
            reason: reason.clone(),
        });
        self.state.abort(reason);
    }

    fn stopped(&self, movement: String) -> IterationOutcome {
        IterationOutcome {
            movement,
            response: None,
            next: None,
            status: self.state.status,
        }
    }
}
