//! Agent orchestrator
//!
//! Drives a plan step by step under step/token/wall budgets. The run is
//! an explicit durable state machine: pause/resume/cancel are plain
//! state mutations observed by the loop at its between-step gates, so no
//! continuations are ever captured and no in-flight step is aborted.
//!
//! Per-run mutations are serialized behind one async mutex; the lock is
//! never held across LLM, retrieval, or tool I/O. Runs for different
//! users (or the same user) progress independently.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::planner::Planner;
use super::types::*;
use crate::audit::{AuditEntry, AuditLog};
use crate::datasets::DatasetRegistry;
use crate::session::SessionStore;
use crate::tools::{ToolInvocation, ToolRegistry};
use crate::types::{
    AgentError, AnalysisResult, CorrelationId, DatasetId, ResultId, RunId, RuntimeError, UserId,
};
use crate::vector::{NoteManager, NoteScope};

/// Outcome of driving one step of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A step executed; more remain.
    Advanced,
    /// The final step executed and the run completed.
    Finished,
    /// The loop must exit: paused, cancelled, failed, or budget-stopped.
    Stopped,
}

struct RunState {
    run: AgentRun,
    steps: Vec<AgentStep>,
}

struct RunHandle {
    state: tokio::sync::Mutex<RunState>,
}

/// Bounded, resumable plan executor.
pub struct AgentOrchestrator {
    runs: DashMap<RunId, Arc<RunHandle>>,
    planner: Planner,
    registry: Arc<ToolRegistry>,
    notes: Arc<NoteManager>,
    sessions: Arc<SessionStore>,
    datasets: Arc<DatasetRegistry>,
    audit: Arc<AuditLog>,
}

impl AgentOrchestrator {
    pub fn new(
        planner: Planner,
        registry: Arc<ToolRegistry>,
        notes: Arc<NoteManager>,
        sessions: Arc<SessionStore>,
        datasets: Arc<DatasetRegistry>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            runs: DashMap::new(),
            planner,
            registry,
            notes,
            sessions,
            datasets,
            audit,
        }
    }

    /// Start a run: plan, persist, and begin executing on a worker.
    pub async fn start(
        self: &Arc<Self>,
        user: UserId,
        dataset_id: DatasetId,
        goal: &str,
        budget: Option<Budget>,
    ) -> Result<AgentRun, RuntimeError> {
        let run = self.prepare(user, dataset_id, goal, budget).await?;
        self.spawn_driver(run.id);
        Ok(run)
    }

    /// Plan and persist a run without spawning the driver. Callers then
    /// drive it with [`Self::step_once`] or [`Self::drive`]. Used by
    /// embedders that schedule work themselves.
    pub async fn prepare(
        self: &Arc<Self>,
        user: UserId,
        dataset_id: DatasetId,
        goal: &str,
        budget: Option<Budget>,
    ) -> Result<AgentRun, RuntimeError> {
        let dataset = self.datasets.get_owned(dataset_id, user)?;
        let correlation_id = CorrelationId::new();

        let session = match self.sessions.find_active_for_dataset(user, dataset_id) {
            Some(session) => session,
            None => {
                self.sessions
                    .create(
                        user,
                        dataset_id,
                        Some(format!("Agent Session - {}", dataset.name)),
                        None,
                    )
                    .await?
            }
        };

        // The run is visible in `planning` while the plan is generated.
        let run_id = RunId::new();
        let placeholder = AgentRun {
            id: run_id,
            owner: user,
            session: session.id,
            dataset: dataset_id,
            goal: goal.to_string(),
            plan: super::planner::fallback_plan(None),
            status: RunStatus::Planning,
            current_step: 0,
            total_steps: 0,
            budget: budget.unwrap_or_default(),
            usage: RunUsage::default(),
            progress_percentage: 0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            correlation_id,
        };
        let handle = Arc::new(RunHandle {
            state: tokio::sync::Mutex::new(RunState {
                run: placeholder,
                steps: Vec::new(),
            }),
        });
        self.runs.insert(run_id, Arc::clone(&handle));

        let (plan, _plan_tokens) = self.planner.generate(&dataset, goal, user).await;

        let run = {
            let mut state = handle.state.lock().await;
            state.run.plan = plan;
            state.run.total_steps = state.run.plan.steps.len() as u32;
            // planning → running happens automatically once the plan exists.
            state.run.status = RunStatus::Running;
            state.run.clone()
        };

        self.sessions.record_run(session.id, user, run_id).await?;
        self.audit.record(
            AuditEntry::action(
                user,
                "start_agent",
                "agent_run",
                format!("started agent run for goal: {}", goal),
            )
            .with_resource(run_id.to_string())
            .with_correlation(correlation_id),
        );
        tracing::info!(run = %run_id, goal, "agent run started");
        Ok(run)
    }

    fn spawn_driver(self: &Arc<Self>, run_id: RunId) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.drive(run_id).await;
        });
    }

    /// Drive a run until it pauses, stops, or completes.
    pub async fn drive(self: &Arc<Self>, run_id: RunId) {
        loop {
            match self.step_once(run_id).await {
                Ok(StepOutcome::Advanced) => {}
                Ok(StepOutcome::Finished) | Ok(StepOutcome::Stopped) => break,
                Err(e) => {
                    tracing::error!(run = %run_id, error = %e, "run driver aborted");
                    break;
                }
            }
        }
    }

    /// Execute at most one step of the run: budget gate, state gate,
    /// retrieval, dispatch, accounting, progress.
    pub async fn step_once(&self, run_id: RunId) -> Result<StepOutcome, AgentError> {
        let handle = self
            .runs
            .get(&run_id)
            .map(|h| Arc::clone(&h))
            .ok_or(AgentError::NotFound(run_id))?;

        // ── Gates and step extraction, under the run lock ────────────
        let prepared = {
            let mut state = handle.state.lock().await;

            // State gate: paused exits the loop without advancing;
            // terminal states exit outright.
            match state.run.status {
                RunStatus::Running => {}
                RunStatus::Paused | RunStatus::Planning => return Ok(StepOutcome::Stopped),
                _ => return Ok(StepOutcome::Stopped),
            }

            // Budget gate: all three limits, checked before the step.
            let elapsed = (Utc::now() - state.run.started_at)
                .to_std()
                .unwrap_or_default();
            let limit = if state.run.current_step >= state.run.budget.max_steps {
                Some("max_steps limit reached")
            } else if state.run.usage.tokens >= state.run.budget.max_tokens {
                Some("max_tokens limit reached")
            } else if elapsed.as_secs() >= state.run.budget.max_wall_seconds {
                Some("max_wall_seconds limit reached")
            } else {
                None
            };
            if let Some(reason) = limit {
                state.run.status = RunStatus::Cancelled;
                state.run.error = Some(reason.to_string());
                state.run.finished_at = Some(Utc::now());
                let entry = AuditEntry::action(
                    state.run.owner,
                    "budget_cancel",
                    "agent_run",
                    format!("run cancelled: {}", reason),
                )
                .with_resource(run_id.to_string())
                .with_correlation(state.run.correlation_id);
                self.audit.record(entry);
                tracing::info!(run = %run_id, reason, "run cancelled at budget gate");
                return Ok(StepOutcome::Stopped);
            }

            if state.run.current_step >= state.run.total_steps {
                return Ok(self.finish(&mut state, run_id));
            }

            let plan_step = state.run.plan.steps[state.run.current_step as usize].clone();
            let index = state.run.current_step + 1;
            let step = AgentStep {
                run: run_id,
                index,
                thought: plan_step.description.clone(),
                tool_name: plan_step.tool_name.clone(),
                parameters: plan_step.parameters.clone(),
                status: StepStatus::Running,
                observation: serde_json::Value::Null,
                confidence: 0.0,
                tokens_used: 0,
                wall_ms: 0,
                started_at: Some(Utc::now()),
                finished_at: None,
                retries: 0,
                max_retries: 0,
                error: None,
            };
            state.steps.push(step);

            let remaining_wall = Duration::from_secs(state.run.budget.max_wall_seconds)
                .saturating_sub(elapsed);
            (
                plan_step,
                state.run.owner,
                state.run.session,
                state.run.dataset,
                state.run.correlation_id,
                remaining_wall,
            )
        };
        let (plan_step, owner, session_id, dataset_id, correlation_id, remaining_wall) = prepared;

        // ── Retrieval and dispatch, outside the lock ─────────────────
        let step_started = std::time::Instant::now();
        let dataset = self.datasets.get(dataset_id);
        let context = self
            .step_context(&plan_step, dataset.as_ref(), owner)
            .await;

        let dispatch = if plan_step.tool_name == "human_feedback" {
            Ok(DispatchResult {
                observation: json!({ "feedback": "feedback incorporated" }),
                confidence: 1.0,
                tokens_used: 0,
            })
        } else {
            self.dispatch_tool(
                &plan_step,
                owner,
                session_id,
                dataset.clone(),
                correlation_id,
                remaining_wall,
                context,
            )
            .await
        };
        let wall_ms = step_started.elapsed().as_millis() as u64;

        // ── Record the step and account usage, atomically ────────────
        let mut state = handle.state.lock().await;
        let index = state
            .steps
            .last()
            .map(|s| s.index)
            .unwrap_or(state.run.current_step + 1);

        let (step_status, critical_failure) = match &dispatch {
            Ok(result) => {
                if let Some(step) = state.steps.last_mut() {
                    step.status = StepStatus::Completed;
                    step.observation = result.observation.clone();
                    step.confidence = result.confidence;
                    step.tokens_used = result.tokens_used;
                    step.wall_ms = wall_ms;
                    step.finished_at = Some(Utc::now());
                }
                (StepStatus::Completed, false)
            }
            Err((error, critical)) => {
                if let Some(step) = state.steps.last_mut() {
                    step.status = StepStatus::Failed;
                    step.error = Some(error.clone());
                    step.wall_ms = wall_ms;
                    step.finished_at = Some(Utc::now());
                }
                (StepStatus::Failed, *critical)
            }
        };

        let tokens_used = dispatch.as_ref().map(|r| r.tokens_used).unwrap_or_default();
        state.run.usage.tokens += tokens_used;
        state.run.usage.wall_ms += wall_ms;
        state.run.current_step += 1;
        state.run.progress_percentage = if state.run.total_steps == 0 {
            100
        } else {
            ((state.run.current_step as f64 / state.run.total_steps as f64) * 100.0).round() as u8
        };

        self.audit.record(
            AuditEntry {
                success: step_status == StepStatus::Completed,
                ..AuditEntry::action(
                    owner,
                    "agent_step",
                    "agent_step",
                    format!("step {} ({})", index, plan_step.tool_name),
                )
            }
            .with_resource(run_id.to_string())
            .with_correlation(correlation_id),
        );

        if critical_failure {
            let error = dispatch.err().map(|(e, _)| e).unwrap_or_default();
            state.run.status = RunStatus::Failed;
            state.run.error = Some(error.clone());
            state.run.finished_at = Some(Utc::now());
            self.audit.record(
                AuditEntry::action(
                    owner,
                    "fail_agent",
                    "agent_run",
                    format!("critical step failed: {}", error),
                )
                .with_resource(run_id.to_string())
                .with_correlation(correlation_id)
                .failed(),
            );
            tracing::warn!(run = %run_id, step = index, "critical step failure");
            return Ok(StepOutcome::Stopped);
        }

        if state.run.current_step >= state.run.total_steps
            && state.run.status == RunStatus::Running
        {
            return Ok(self.finish(&mut state, run_id));
        }
        Ok(StepOutcome::Advanced)
    }

    fn finish(&self, state: &mut RunState, run_id: RunId) -> StepOutcome {
        state.run.status = RunStatus::Completed;
        state.run.finished_at = Some(Utc::now());
        state.run.progress_percentage = 100;
        self.audit.record(
            AuditEntry::action(
                state.run.owner,
                "complete_agent",
                "agent_run",
                "agent run completed",
            )
            .with_resource(run_id.to_string())
            .with_correlation(state.run.correlation_id),
        );
        tracing::info!(run = %run_id, "agent run completed");
        StepOutcome::Finished
    }

    /// Step-local retrieval keyed by tool name, step description, and
    /// dataset name. Best-effort: failures only lose context.
    async fn step_context(
        &self,
        plan_step: &PlanStep,
        dataset: Option<&crate::types::Dataset>,
        owner: UserId,
    ) -> Option<String> {
        let mut queries = vec![plan_step.tool_name.clone()];
        if !plan_step.description.is_empty() {
            queries.push(plan_step.description.clone());
        }
        if let Some(dataset) = dataset {
            queries.push(format!("{} {}", plan_step.tool_name, dataset.name));
        }

        let mut parts = Vec::new();
        for query in queries {
            let hits = match dataset {
                Some(dataset) => {
                    self.notes
                        .search_text(
                            &query,
                            NoteScope::Dataset,
                            Some(dataset.id),
                            Some(owner),
                            2,
                            0.6,
                        )
                        .await
                }
                None => {
                    self.notes
                        .search_text(&query, NoteScope::Global, None, Some(owner), 2, 0.6)
                        .await
                }
            };
            if let Ok(hits) = hits {
                for hit in hits {
                    parts.push(format!("- {}: {}", hit.note.title, hit.note.text));
                }
            }
        }
        if parts.is_empty() {
            None
        } else {
            parts.truncate(5);
            Some(parts.join("\n"))
        }
    }

    /// Dispatch one tool invocation. The error carries whether the tool
    /// was handler-declared critical.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_tool(
        &self,
        plan_step: &PlanStep,
        owner: UserId,
        session_id: crate::types::SessionId,
        dataset: Option<crate::types::Dataset>,
        correlation_id: CorrelationId,
        remaining_wall: Duration,
        context: Option<String>,
    ) -> Result<DispatchResult, (String, bool)> {
        let critical = self
            .registry
            .lookup(&plan_step.tool_name)
            .map(|spec| spec.critical)
            .unwrap_or(false);

        let invocation = ToolInvocation {
            tool: plan_step.tool_name.clone(),
            parameters: plan_step.parameters.clone(),
            caller: owner,
            dataset: dataset.clone(),
            session: Some(session_id),
            correlation_id: Some(correlation_id),
            context,
        };

        match self.registry.invoke(invocation, Some(remaining_wall)).await {
            Ok(output) => {
                let result = AnalysisResult {
                    id: ResultId::new(),
                    owner,
                    session: session_id,
                    tool_name: plan_step.tool_name.clone(),
                    output_type: output.output_type,
                    data: output.data.clone(),
                    wall_ms: 0,
                    created_at: Utc::now(),
                };
                let result_id = result.id;
                if let Err(e) = self.sessions.append_result(result.clone()).await {
                    tracing::warn!(error = %e, "failed to store analysis result");
                }
                if let Some(dataset) = &dataset {
                    if let Err(e) = self.notes.index_analysis_result(&result, dataset).await {
                        tracing::debug!(error = %e, "analysis result not indexed");
                    }
                }
                Ok(DispatchResult {
                    observation: json!({
                        "result_id": result_id.to_string(),
                        "summary": output.summary,
                        "output_type": output.output_type,
                    }),
                    confidence: 0.8,
                    tokens_used: output.tokens_used,
                })
            }
            Err(e) => Err((e.to_string(), critical)),
        }
    }

    // ── External control ────────────────────────────────────────────

    /// Pause a running run. Takes effect between steps; no in-flight
    /// step is aborted. Returns false (no-op) from any other state.
    pub async fn pause(&self, run_id: RunId, user: UserId) -> Result<bool, AgentError> {
        let handle = self.handle_for(run_id, user).await?;
        let mut state = handle.state.lock().await;
        if state.run.status != RunStatus::Running {
            return Ok(false);
        }
        state.run.status = RunStatus::Paused;
        self.audit.record(
            AuditEntry::action(user, "pause_agent", "agent_run", "agent run paused")
                .with_resource(run_id.to_string())
                .with_correlation(state.run.correlation_id),
        );
        tracing::info!(run = %run_id, "agent run paused");
        Ok(true)
    }

    /// Resume a paused run and re-enter the loop.
    pub async fn resume(self: &Arc<Self>, run_id: RunId, user: UserId) -> Result<bool, AgentError> {
        let handle = self.handle_for(run_id, user).await?;
        {
            let mut state = handle.state.lock().await;
            if state.run.status != RunStatus::Paused {
                return Ok(false);
            }
            state.run.status = RunStatus::Running;
            self.audit.record(
                AuditEntry::action(user, "resume_agent", "agent_run", "agent run resumed")
                    .with_resource(run_id.to_string())
                    .with_correlation(state.run.correlation_id),
            );
        }
        tracing::info!(run = %run_id, "agent run resumed");
        self.spawn_driver(run_id);
        Ok(true)
    }

    /// Cancel a running or paused run. The loop observes the state at
    /// its next gate. Cancelling a terminal run is a no-op false.
    pub async fn cancel(&self, run_id: RunId, user: UserId) -> Result<bool, AgentError> {
        let handle = self.handle_for(run_id, user).await?;
        let mut state = handle.state.lock().await;
        if !matches!(state.run.status, RunStatus::Running | RunStatus::Paused) {
            return Ok(false);
        }
        state.run.status = RunStatus::Cancelled;
        state.run.finished_at = Some(Utc::now());
        self.audit.record(
            AuditEntry::action(user, "cancel_agent", "agent_run", "agent run cancelled")
                .with_resource(run_id.to_string())
                .with_correlation(state.run.correlation_id),
        );
        tracing::info!(run = %run_id, "agent run cancelled");
        Ok(true)
    }

    /// Record human feedback and splice a synthesized feedback step in
    /// as the next step to execute. Valid from any non-terminal state.
    pub async fn feedback(
        &self,
        run_id: RunId,
        user: UserId,
        text: &str,
        step_index: Option<u32>,
    ) -> Result<bool, AgentError> {
        let handle = self.handle_for(run_id, user).await?;
        let mut state = handle.state.lock().await;
        if state.run.status.is_terminal() {
            return Ok(false);
        }

        let at_step = step_index.unwrap_or(state.run.current_step);
        state.run.plan.human_feedback.push(FeedbackNote {
            step_index: at_step,
            text: text.to_string(),
            at: Utc::now(),
        });

        // With a step in flight, splice after it: inserting at the
        // in-flight position would shift the plan under the executing
        // step and replay it.
        let in_flight = state
            .steps
            .last()
            .map_or(false, |s| s.status == StepStatus::Running);
        let insert_at = (state.run.current_step as usize + usize::from(in_flight))
            .min(state.run.plan.steps.len());
        state.run.plan.steps.insert(
            insert_at,
            PlanStep {
                index: 0,
                tool_name: "human_feedback".to_string(),
                description: text.to_string(),
                parameters: json!({ "feedback": text }),
                expected_output: "feedback incorporated".to_string(),
            },
        );
        for (i, step) in state.run.plan.steps.iter_mut().enumerate() {
            step.index = i as u32 + 1;
        }
        state.run.total_steps = state.run.plan.steps.len() as u32;

        self.audit.record(
            AuditEntry::action(
                user,
                "provide_feedback",
                "agent_run",
                format!("human feedback: {:.100}", text),
            )
            .with_resource(run_id.to_string())
            .with_correlation(state.run.correlation_id),
        );
        Ok(true)
    }

    // ── Introspection ───────────────────────────────────────────────

    /// Full snapshot: run, tail of steps, remaining wall, next action.
    pub async fn status(&self, run_id: RunId, user: UserId) -> Result<RunSnapshot, AgentError> {
        let handle = self.handle_for(run_id, user).await?;
        let state = handle.state.lock().await;

        let recent_steps: Vec<AgentStep> = state
            .steps
            .iter()
            .rev()
            .take(5)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let wall_seconds_remaining = if state.run.status == RunStatus::Running {
            let elapsed = (Utc::now() - state.run.started_at)
                .to_std()
                .unwrap_or_default()
                .as_secs();
            Some(state.run.budget.max_wall_seconds.saturating_sub(elapsed))
        } else {
            None
        };

        let next_action = if state.run.status != RunStatus::Running {
            format!("run is {}", state.run.status)
        } else if (state.run.current_step as usize) < state.run.plan.steps.len() {
            let next = &state.run.plan.steps[state.run.current_step as usize];
            format!("next: {}", if next.description.is_empty() {
                next.tool_name.clone()
            } else {
                next.description.clone()
            })
        } else {
            "all steps completed".to_string()
        };

        Ok(RunSnapshot {
            run: state.run.clone(),
            recent_steps,
            wall_seconds_remaining,
            next_action,
        })
    }

    /// All persisted steps of a run, in index order.
    pub async fn steps(&self, run_id: RunId, user: UserId) -> Result<Vec<AgentStep>, AgentError> {
        let handle = self.handle_for(run_id, user).await?;
        let state = handle.state.lock().await;
        Ok(state.steps.clone())
    }

    /// Runs owned by `user`, most recent first.
    pub async fn list(
        &self,
        user: UserId,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Vec<AgentRun> {
        let mut runs = Vec::new();
        for entry in self.runs.iter() {
            let state = entry.value().state.lock().await;
            if state.run.owner == user && status.map_or(true, |s| state.run.status == s) {
                runs.push(state.run.clone());
            }
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        runs
    }

    async fn handle_for(&self, run_id: RunId, user: UserId) -> Result<Arc<RunHandle>, AgentError> {
        let handle = self
            .runs
            .get(&run_id)
            .map(|h| Arc::clone(&h))
            .ok_or(AgentError::NotFound(run_id))?;
        let owner = handle.state.lock().await.run.owner;
        if owner != user {
            return Err(AgentError::NotFound(run_id));
        }
        Ok(handle)
    }
}

struct DispatchResult {
    observation: serde_json::Value,
    confidence: f32,
    tokens_used: u64,
}
