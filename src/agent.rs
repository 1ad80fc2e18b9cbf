use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::action::{parse_action_output, ActionKind, ActionRecord};
use crate::command::synthesize;
use crate::config::AgentConfig;
use crate::coords::{map_box, AbsoluteBox, CoordinateError};
use crate::device::{execute_commands, DeviceChannel, ExecutionReport, Screenshot};
use crate::error::AgentError;
use crate::lookup::{BoundedLookup, ExperienceLearner, KnowledgeRetriever, RetrievalResult, TaskOutcome};
use crate::retry::RetryGuard;
use crate::store::{PendingStep, StepRecord, TaskHistory, TaskStatus, TaskStore};
use crate::verdict::{parse_verdict, CompletionVerdict};

// ========================= Core Types =========================

/// What the planner sees when choosing the next micro-task.
#[derive(Clone, Debug)]
pub struct PlanRequest<'a> {
    pub task: &'a str,
    pub app_name: Option<&'a str>,
    pub history_summary: &'a str,
    /// Retrieved experiences and facts, for the refining pass.
    pub guidance: Option<&'a str>,
    /// The first-pass micro-task, for the refining pass.
    pub draft: Option<&'a str>,
}

/// The step being judged by a [`StepEvaluator`] or [`LoadingDetector`].
#[derive(Clone, Debug)]
pub struct StepContext<'a> {
    pub task: &'a str,
    pub micro_task: &'a str,
    pub action: &'a ActionRecord,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEvaluation {
    pub success: bool,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    AwaitingScreen,
    Planning,
    Acting,
    AwaitingPostScreen,
    Evaluating,
    Deciding,
    Done,
    Failed,
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingScreen => "awaiting_screen",
            Self::Planning => "planning",
            Self::Acting => "acting",
            Self::AwaitingPostScreen => "awaiting_post_screen",
            Self::Evaluating => "evaluating",
            Self::Deciding => "deciding",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    /// Execution failed and the continuation policy chose to stop.
    Stopped,
    /// The abort handle was raised. The task stays resumable.
    Aborted,
    /// `max_steps` reached in this run. The task stays resumable.
    StepBudgetExhausted,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub task_id: String,
    pub task_dir: PathBuf,
    pub status: RunStatus,
    pub exit_reason: String,
    /// Steps executed by this run.
    pub steps_executed: usize,
    /// Steps recorded for the task, including earlier runs.
    pub total_steps: usize,
    pub last_verdict: Option<CompletionVerdict>,
    pub error: Option<String>,
    pub elapsed_ms: u128,
}

// ========================= Pluggable Subsystems =========================

/// Vision-grounding model: instruction plus screen in, action text out.
#[async_trait]
pub trait GroundingModel: Send + Sync {
    async fn ground(&self, instruction: &str, screen: &Screenshot) -> anyhow::Result<String>;
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// Next micro-task in natural language. May be empty.
    async fn plan(&self, request: &PlanRequest<'_>, screen: &Screenshot) -> anyhow::Result<String>;
}

#[async_trait]
pub trait StepEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        step: &StepContext<'_>,
        before: &Screenshot,
        after: &Screenshot,
    ) -> anyhow::Result<StepEvaluation>;
}

#[async_trait]
pub trait CompletionJudge: Send + Sync {
    /// Raw answer, expected to carry a `{completed, reason, confidence}` JSON object.
    async fn judge(
        &self,
        task: &str,
        recent: &[StepRecord],
        step_count: usize,
        screen: &Screenshot,
    ) -> anyhow::Result<String>;
}

#[async_trait]
pub trait LoadingDetector: Send + Sync {
    /// `true` when `after` still shows skeletons, spinners or blank regions.
    async fn still_loading(
        &self,
        step: &StepContext<'_>,
        before: &Screenshot,
        after: &Screenshot,
    ) -> anyhow::Result<bool>;
}

/// Decides whether the task goes on after a failed command sequence.
pub trait ContinuationPolicy: Send + Sync {
    fn should_continue(&self, step: usize, report: &ExecutionReport) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysContinue;

impl ContinuationPolicy for AlwaysContinue {
    fn should_continue(&self, _step: usize, _report: &ExecutionReport) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StopOnFailure;

impl ContinuationPolicy for StopOnFailure {
    fn should_continue(&self, _step: usize, report: &ExecutionReport) -> bool {
        report.success
    }
}

// ========================= Agent Core =========================

enum StepOutcome {
    Continue(Option<CompletionVerdict>),
    Done(String, Option<CompletionVerdict>),
    Stopped(String),
}

pub struct Agent<D, G, P, J>
where
    D: DeviceChannel,
    G: GroundingModel,
    P: Planner,
    J: CompletionJudge,
{
    device: D,
    grounding: G,
    planner: P,
    judge: J,
    cfg: AgentConfig,
    guard: RetryGuard,
    evaluator: Option<Arc<dyn StepEvaluator>>,
    loading: Option<Arc<dyn LoadingDetector>>,
    lookup: Option<BoundedLookup>,
    learner: Option<Arc<dyn ExperienceLearner>>,
    policy: Arc<dyn ContinuationPolicy>,
    abort: Arc<AtomicBool>,
}

impl<D, G, P, J> Agent<D, G, P, J>
where
    D: DeviceChannel,
    G: GroundingModel,
    P: Planner,
    J: CompletionJudge,
{
    pub fn new(device: D, grounding: G, planner: P, judge: J, cfg: AgentConfig) -> Self {
        Self {
            device,
            grounding,
            planner,
            judge,
            guard: RetryGuard::new(cfg.retry),
            cfg,
            evaluator: None,
            loading: None,
            lookup: None,
            learner: None,
            policy: Arc::new(AlwaysContinue),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_evaluator(mut self, evaluator: impl StepEvaluator + 'static) -> Self {
        self.evaluator = Some(Arc::new(evaluator));
        self
    }

    pub fn with_loading_detector(mut self, detector: impl LoadingDetector + 'static) -> Self {
        self.loading = Some(Arc::new(detector));
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        self.lookup = Some(BoundedLookup::new(
            retriever,
            self.cfg.lookup_timeout,
            self.cfg.lookup_top_n,
        ));
        self
    }

    pub fn with_learner(mut self, learner: Arc<dyn ExperienceLearner>) -> Self {
        self.learner = Some(learner);
        self
    }

    pub fn with_policy(mut self, policy: impl ContinuationPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Raising the flag stops the run before its next step.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    /// Starts a new task in a fresh task directory.
    pub async fn run(&self, task: &str, app_name: Option<&str>) -> Result<RunReport, AgentError> {
        if self.cfg.device_id.trim().is_empty() {
            return Err(AgentError::Config("device_id is empty".into()));
        }
        let store = TaskStore::create(&self.cfg.artifacts_dir, &self.cfg.device_id, task, app_name).await?;
        info!(task_id = %store.info().task_id, task, device = %self.cfg.device_id, "task started");
        self.drive(store, TaskHistory::default()).await
    }

    /// Continues a task from its directory, at step `len(history) + 1`.
    pub async fn resume(&self, task_dir: &Path) -> Result<RunReport, AgentError> {
        let (mut store, history) = TaskStore::open(task_dir).await?;
        if store.info().status == TaskStatus::Completed {
            info!(task_id = %store.info().task_id, "task already completed, nothing to resume");
            return Ok(RunReport {
                task_id: store.info().task_id.clone(),
                task_dir: store.dir().to_path_buf(),
                status: RunStatus::Completed,
                exit_reason: store.info().exit_reason.clone().unwrap_or_default(),
                steps_executed: 0,
                total_steps: history.len(),
                last_verdict: None,
                error: None,
                elapsed_ms: 0,
            });
        }
        store.mark_in_progress().await?;
        info!(task_id = %store.info().task_id, next_step = history.len() + 1, "task resumed");
        self.drive(store, history).await
    }

    async fn drive(&self, mut store: TaskStore, mut history: TaskHistory) -> Result<RunReport, AgentError> {
        let started = Instant::now();
        let task = store.info().global_task.clone();
        let app_name = store.info().app_name.clone();
        let mut executed = 0usize;
        let mut last_verdict: Option<CompletionVerdict> = None;

        let (status, exit_reason, error) = loop {
            if self.abort.load(Ordering::SeqCst) {
                info!(task_id = %store.info().task_id, "abort requested");
                store.record_exit("aborted").await?;
                break (RunStatus::Aborted, "aborted by operator".to_string(), None);
            }
            if self.cfg.max_steps.is_some_and(|max| executed >= max) {
                info!(task_id = %store.info().task_id, executed, "step budget exhausted");
                store.record_exit("step budget exhausted").await?;
                break (RunStatus::StepBudgetExhausted, "step budget exhausted".to_string(), None);
            }

            let step = history.len() + 1;
            let outcome = self
                .run_step(step, &task, app_name.as_deref(), &mut store, &mut history)
                .await;
            executed += 1;

            match outcome {
                Ok(StepOutcome::Continue(verdict)) => {
                    if verdict.is_some() {
                        last_verdict = verdict;
                    }
                }
                Ok(StepOutcome::Done(reason, verdict)) => {
                    if verdict.is_some() {
                        last_verdict = verdict;
                    }
                    self.enter(step, StepState::Done);
                    store.mark_completed(&reason).await?;
                    break (RunStatus::Completed, reason, None);
                }
                Ok(StepOutcome::Stopped(reason)) => {
                    store.mark_failed(&reason, false).await?;
                    break (RunStatus::Stopped, reason, None);
                }
                Err(err) => {
                    self.enter(step, StepState::Failed);
                    warn!(step, error = %err, "step failed, ending task");
                    let reason = err.to_string();
                    store.mark_failed(&reason, err.is_remote()).await?;
                    break (RunStatus::Failed, "failed".to_string(), Some(reason));
                }
            }
        };

        self.learn_from_task(&mut store, &history, status).await?;
        self.finish(store, &history, status, exit_reason, error, executed, last_verdict, started)
    }

    /// Hands a completed or failed task to the learner. Learning failures are
    /// logged and leave the run outcome unchanged.
    async fn learn_from_task(
        &self,
        store: &mut TaskStore,
        history: &TaskHistory,
        status: RunStatus,
    ) -> Result<(), AgentError> {
        let Some(learner) = self.learner.as_ref().filter(|_| self.cfg.learn_from_tasks) else {
            return Ok(());
        };
        let success = match status {
            RunStatus::Completed => true,
            RunStatus::Failed | RunStatus::Stopped => false,
            RunStatus::Aborted | RunStatus::StepBudgetExhausted => return Ok(()),
        };
        if history.is_empty() {
            return Ok(());
        }

        let info = store.info();
        let outcome = TaskOutcome {
            task: &info.global_task,
            history,
            success,
            task_id: &info.task_id,
            app_name: info.app_name.as_deref(),
        };
        let learned = self.guard.guard("learn", || learner.learn(&outcome)).await;
        match learned {
            Ok(experience_id) => {
                info!(task_id = %store.info().task_id, experience_id = %experience_id, success, "experience learned");
                store.record_learning(&experience_id).await
            }
            Err(err) => {
                warn!(task_id = %store.info().task_id, error = %err, "experience learning failed");
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        store: TaskStore,
        history: &TaskHistory,
        status: RunStatus,
        exit_reason: String,
        error: Option<String>,
        executed: usize,
        last_verdict: Option<CompletionVerdict>,
        started: Instant,
    ) -> Result<RunReport, AgentError> {
        let report = RunReport {
            task_id: store.info().task_id.clone(),
            task_dir: store.dir().to_path_buf(),
            status,
            exit_reason,
            steps_executed: executed,
            total_steps: history.len(),
            last_verdict,
            error,
            elapsed_ms: started.elapsed().as_millis(),
        };
        info!(task_id = %report.task_id, status = ?report.status, steps = report.steps_executed, "run finished");
        Ok(report)
    }

    fn enter(&self, step: usize, state: StepState) {
        debug!(step, state = %state, "step state");
    }

    async fn run_step(
        &self,
        step: usize,
        task: &str,
        app_name: Option<&str>,
        store: &mut TaskStore,
        history: &mut TaskHistory,
    ) -> Result<StepOutcome, AgentError> {
        let device_id = self.cfg.device_id.as_str();

        self.enter(step, StepState::AwaitingScreen);
        let before = self.capture().await?;
        let before_path = store.save_screenshot(step, "before", &before).await?;

        self.enter(step, StepState::Planning);
        let (micro_task, retrieval) = self.plan_micro_task(task, app_name, history, &before).await?;
        info!(step, micro_task = %micro_task, "micro-task planned");

        let mut pending = PendingStep::begin(step, &store.info().task_id, &micro_task);
        pending.set_before_screenshot(Some(before_path));
        pending.set_retrieval(retrieval);

        let raw = self
            .guard
            .guard("ground", || self.grounding.ground(&micro_task, &before))
            .await
            .map_err(|e| AgentError::from_guard("ground", e))?;
        let parsed = parse_action_output(&raw);
        if parsed.is_degraded() {
            warn!(step, issues = ?parsed.issues, "action answer only partially understood");
        }
        let action = parsed.record.clone();
        info!(step, action = action.action.as_str(), thought = %action.thought, "action decided");
        pending.set_decision(raw, parsed);

        self.enter(step, StepState::Acting);
        let (start_abs, end_abs, coord_err) = map_geometry(&action, before.size());
        if let Some(err) = &coord_err {
            warn!(step, error = %err, "box dropped");
        }
        let sequence = synthesize(&action, start_abs.as_ref(), end_abs.as_ref(), device_id);
        let report = execute_commands(&self.device, &sequence).await;
        pending.set_geometry(start_abs, end_abs, coord_err);
        pending.record_execution(&sequence, &report);
        info!(step, commands = sequence.len(), success = report.success, "commands executed");

        if !report.success && !self.policy.should_continue(step, &report) {
            let reason = format!(
                "stopped after command failure: {}",
                report.failure.as_deref().unwrap_or("unknown")
            );
            pending.record_evaluation(false, reason.clone());
            store.append_step(history, pending.seal()).await?;
            return Ok(StepOutcome::Stopped(reason));
        }

        self.enter(step, StepState::AwaitingPostScreen);
        let context = StepContext {
            task,
            micro_task: &micro_task,
            action: &action,
        };
        let after = self.post_action_screen(step, &context, &before).await;
        if let Some(after) = &after {
            let path = store.save_screenshot(step, "after", after).await?;
            pending.set_after_screenshot(Some(path));
        }

        self.enter(step, StepState::Evaluating);
        let (eval_success, eval_reason) = match (&self.evaluator, &after) {
            (Some(evaluator), Some(after)) => match evaluator.evaluate(&context, &before, after).await {
                Ok(eval) => (eval.success, eval.reason),
                Err(err) => {
                    warn!(step, error = %format!("{err:#}"), "step evaluation failed");
                    (pending.execution_success(), format!("evaluation failed: {err:#}"))
                }
            },
            (Some(_), None) => (pending.execution_success(), "no post-action screen to evaluate".to_string()),
            (None, _) => (pending.execution_success(), "execution result".to_string()),
        };
        info!(step, success = eval_success, reason = %eval_reason, "step evaluated");
        pending.record_evaluation(eval_success, eval_reason);
        store.append_step(history, pending.seal()).await?;

        self.enter(step, StepState::Deciding);
        if action.action == ActionKind::Finished {
            let reason = action
                .content
                .clone()
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| "grounding model reported the task finished".to_string());
            return Ok(StepOutcome::Done(reason, None));
        }

        let screen = after.as_ref().unwrap_or(&before);
        let recent = history.tail(self.cfg.history_tail);
        let answer = self
            .guard
            .guard("judge", || self.judge.judge(task, recent, step, screen))
            .await
            .map_err(|e| AgentError::from_guard("judge", e))?;
        let verdict = parse_verdict(&answer);
        info!(
            step,
            completed = verdict.completed,
            confidence = verdict.confidence,
            reason = %verdict.reason,
            "completion verdict"
        );
        if verdict.is_satisfied(self.cfg.completion_threshold) {
            let reason = verdict.reason.clone();
            return Ok(StepOutcome::Done(reason, Some(verdict)));
        }
        Ok(StepOutcome::Continue(Some(verdict)))
    }

    async fn capture(&self) -> Result<Screenshot, AgentError> {
        self.device
            .capture_screen(&self.cfg.device_id)
            .await
            .map_err(|e| match e {
                AgentError::Capture(_) => e,
                other => AgentError::Capture(other.to_string()),
            })
    }

    /// Two-pass planning: a draft micro-task, then a refinement with retrieved experience.
    async fn plan_micro_task(
        &self,
        task: &str,
        app_name: Option<&str>,
        history: &TaskHistory,
        screen: &Screenshot,
    ) -> Result<(String, RetrievalResult), AgentError> {
        let summary = history_summary(history);
        let request = PlanRequest {
            task,
            app_name,
            history_summary: &summary,
            guidance: None,
            draft: None,
        };
        let draft = self
            .guard
            .guard("plan", || self.planner.plan(&request, screen))
            .await
            .map_err(|e| AgentError::from_guard("plan", e))?;
        let mut micro_task = draft.trim().to_string();
        let mut retrieval = RetrievalResult::default();

        if let (true, Some(lookup)) = (self.cfg.use_experience, &self.lookup) {
            let query = format!("{micro_task} {task}");
            retrieval = lookup.lookup(query.trim()).await;
            if !retrieval.is_empty() {
                let guidance = retrieval.guidance();
                let refine = PlanRequest {
                    guidance: Some(&guidance),
                    draft: Some(&micro_task),
                    ..request.clone()
                };
                let refined = self
                    .guard
                    .guard("plan", || self.planner.plan(&refine, screen))
                    .await
                    .map_err(|e| AgentError::from_guard("plan", e))?;
                if !refined.trim().is_empty() {
                    micro_task = refined.trim().to_string();
                }
            }
        }

        if micro_task.is_empty() {
            micro_task = format!("Execute task: {task}");
        }
        Ok((micro_task, retrieval))
    }

    /// Waits for the UI to settle, then captures. Re-captures once if the
    /// screen still shows loading content.
    async fn post_action_screen(
        &self,
        step: usize,
        context: &StepContext<'_>,
        before: &Screenshot,
    ) -> Option<Screenshot> {
        tokio::time::sleep(self.cfg.settle_delay()).await;
        let after = match self.capture().await {
            Ok(shot) => shot,
            Err(err) => {
                warn!(step, error = %err, "post-action capture failed");
                return None;
            }
        };

        let Some(detector) = &self.loading else {
            return Some(after);
        };
        match detector.still_loading(context, before, &after).await {
            Ok(true) => {
                info!(step, wait_secs = self.cfg.reload_settle.as_secs_f64(), "content still loading, re-capturing");
                tokio::time::sleep(self.cfg.reload_settle).await;
                match self.capture().await {
                    Ok(reloaded) => Some(reloaded),
                    Err(err) => {
                        warn!(step, error = %err, "re-capture failed, keeping first screen");
                        Some(after)
                    }
                }
            }
            Ok(false) => Some(after),
            Err(err) => {
                warn!(step, error = %format!("{err:#}"), "loading check failed, assuming loaded");
                Some(after)
            }
        }
    }
}

// ========================= Defaults & Helpers =========================

fn map_geometry(
    action: &ActionRecord,
    size: (u32, u32),
) -> (Option<AbsoluteBox>, Option<AbsoluteBox>, Option<CoordinateError>) {
    let mut error = None;
    let mut map = |raw: Option<[u32; 4]>| {
        raw.and_then(|b| match map_box(&b, size) {
            Ok(abs) => Some(abs),
            Err(err) => {
                error = Some(err);
                None
            }
        })
    };
    let start = map(action.start_box);
    let end = map(action.end_box);
    (start, end, error)
}

/// One line per recorded step, for the planner prompt.
pub fn history_summary(history: &TaskHistory) -> String {
    if history.is_empty() {
        return "No steps taken yet.".to_string();
    }
    let mut out = String::new();
    for record in history.records() {
        let outcome = match (record.execution_success, record.evaluation_success) {
            (true, true) => "succeeded",
            (true, false) => "executed, not effective",
            (false, _) => "execution failed",
        };
        let _ = writeln!(
            out,
            "Step {}: {} -> {} ({outcome}; {})",
            record.step,
            record.micro_task,
            record.action.action.as_str(),
            record.evaluation_reason
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::parse_action_output;

    #[test]
    fn geometry_keeps_valid_boxes() {
        let action = parse_action_output(
            "Action: drag(start_box='[100,200,300,400]', end_box='[500,500,600,600]')",
        )
        .record;
        let (start, end, err) = map_geometry(&action, (1080, 1920));
        assert_eq!(start.unwrap().coords(), [108, 384, 324, 768]);
        assert_eq!(end.unwrap().midpoint(), (594, 1056));
        assert!(err.is_none());
    }

    #[test]
    fn geometry_reports_bad_screen_size() {
        let action = parse_action_output("Action: click(start_box='[1,2,3,4]')").record;
        let (start, _, err) = map_geometry(&action, (0, 1920));
        assert!(start.is_none());
        assert!(matches!(err, Some(CoordinateError::InvalidSize { .. })));
    }

    #[test]
    fn stop_on_failure_policy() {
        let failed = ExecutionReport { success: false, ..Default::default() };
        assert!(AlwaysContinue.should_continue(1, &failed));
        assert!(!StopOnFailure.should_continue(1, &failed));
    }

    #[test]
    fn empty_history_summary() {
        assert_eq!(history_summary(&TaskHistory::default()), "No steps taken yet.");
    }
}
