use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::action::{ActionRecord, ParseDegraded, ParsedAction};
use crate::command::{CommandSequence, DeviceCommand};
use crate::coords::{AbsoluteBox, CoordinateError};
use crate::device::{ExecutionReport, Screenshot};
use crate::error::AgentError;
use crate::lookup::RetrievalResult;

pub const HISTORY_FILE: &str = "history.jsonl";
pub const TASK_INFO_FILE: &str = "task_info.json";
pub const FAILURE_MARKER: &str = "TASK_FAILED.txt";
const IMG_DIR: &str = "img";

// ========================= Records =========================

/// One finished step as written to `history.jsonl`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based.
    pub step: usize,
    pub task_id: String,
    pub micro_task: String,
    /// Paths relative to the task directory.
    pub before_screenshot: Option<String>,
    pub after_screenshot: Option<String>,
    pub raw_answer: String,
    pub action: ActionRecord,
    #[serde(default)]
    pub parse_issues: Vec<ParseDegraded>,
    pub start_abs: Option<AbsoluteBox>,
    pub end_abs: Option<AbsoluteBox>,
    pub coordinate_error: Option<CoordinateError>,
    #[serde(default)]
    pub commands: Vec<DeviceCommand>,
    pub execution_success: bool,
    pub execution_error: Option<String>,
    pub evaluation_success: bool,
    pub evaluation_reason: String,
    #[serde(default)]
    pub retrieval: RetrievalResult,
    pub timestamp: DateTime<Utc>,
}

/// A step under construction. Sealed into a [`StepRecord`] once evaluated.
#[derive(Debug)]
pub struct PendingStep {
    draft: StepRecord,
}

impl PendingStep {
    pub fn begin(step: usize, task_id: &str, micro_task: &str) -> Self {
        Self {
            draft: StepRecord {
                step,
                task_id: task_id.to_string(),
                micro_task: micro_task.to_string(),
                before_screenshot: None,
                after_screenshot: None,
                raw_answer: String::new(),
                action: ActionRecord::default(),
                parse_issues: Vec::new(),
                start_abs: None,
                end_abs: None,
                coordinate_error: None,
                commands: Vec::new(),
                execution_success: false,
                execution_error: None,
                evaluation_success: false,
                evaluation_reason: String::new(),
                retrieval: RetrievalResult::default(),
                timestamp: Utc::now(),
            },
        }
    }

    pub fn execution_success(&self) -> bool {
        self.draft.execution_success
    }

    pub fn set_before_screenshot(&mut self, path: Option<String>) {
        self.draft.before_screenshot = path;
    }

    pub fn set_after_screenshot(&mut self, path: Option<String>) {
        self.draft.after_screenshot = path;
    }

    pub fn set_retrieval(&mut self, retrieval: RetrievalResult) {
        self.draft.retrieval = retrieval;
    }

    pub fn set_decision(&mut self, raw_answer: String, parsed: ParsedAction) {
        self.draft.raw_answer = raw_answer;
        self.draft.action = parsed.record;
        self.draft.parse_issues = parsed.issues;
    }

    pub fn set_geometry(
        &mut self,
        start: Option<AbsoluteBox>,
        end: Option<AbsoluteBox>,
        error: Option<CoordinateError>,
    ) {
        self.draft.start_abs = start;
        self.draft.end_abs = end;
        self.draft.coordinate_error = error;
    }

    /// Recorded once, after the sequence ran.
    pub fn record_execution(&mut self, sequence: &CommandSequence, report: &ExecutionReport) {
        self.draft.commands = sequence.commands().to_vec();
        self.draft.execution_success = report.success;
        self.draft.execution_error = report.failure.clone();
    }

    /// Recorded once, after the step was evaluated.
    pub fn record_evaluation(&mut self, success: bool, reason: impl Into<String>) {
        self.draft.evaluation_success = success;
        self.draft.evaluation_reason = reason.into();
    }

    pub fn seal(self) -> StepRecord {
        self.draft
    }
}

/// Ordered, append-only step log of one task.
#[derive(Clone, Debug, Default)]
pub struct TaskHistory {
    records: Vec<StepRecord>,
}

impl TaskHistory {
    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The most recent `n` records, oldest first.
    pub fn tail(&self, n: usize) -> &[StepRecord] {
        &self.records[self.records.len().saturating_sub(n)..]
    }

    pub(crate) fn push(&mut self, record: StepRecord) {
        self.records.push(record);
    }
}

// ========================= Task Info =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub global_task: String,
    pub app_name: Option<String>,
    pub device_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub exit_reason: Option<String>,
    pub steps_executed: usize,
    /// Experience the finished task was learned into.
    #[serde(default)]
    pub experience_id: Option<String>,
}

// ========================= Task Store =========================

/// Files of one task: `<artifacts>/device_<id>/task_<id>/`.
#[derive(Debug)]
pub struct TaskStore {
    dir: PathBuf,
    info: TaskInfo,
}

fn safe_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn storage(context: &str, path: &Path, err: impl std::fmt::Display) -> AgentError {
    AgentError::Storage(format!("{context} {}: {err}", path.display()))
}

impl TaskStore {
    pub async fn create(
        artifacts_dir: &Path,
        device_id: &str,
        global_task: &str,
        app_name: Option<&str>,
    ) -> Result<Self, AgentError> {
        let now = Utc::now();
        let task_id = format!("{}_{}", now.format("%Y%m%d_%H%M%S"), nanoid!(6));
        let dir = artifacts_dir
            .join(format!("device_{}", safe_component(device_id)))
            .join(format!("task_{task_id}"));
        async_fs::create_dir_all(dir.join(IMG_DIR))
            .await
            .map_err(|e| storage("create", &dir, e))?;

        let store = Self {
            dir,
            info: TaskInfo {
                task_id,
                global_task: global_task.to_string(),
                app_name: app_name.map(str::to_string),
                device_id: device_id.to_string(),
                status: TaskStatus::InProgress,
                created_at: now,
                updated_at: now,
                completed_at: None,
                failed_at: None,
                failure_reason: None,
                exit_reason: None,
                steps_executed: 0,
                experience_id: None,
            },
        };
        store.write_info().await?;
        info!(task_id = %store.info.task_id, dir = %store.dir.display(), "task directory created");
        Ok(store)
    }

    /// Reopens an existing task directory together with its recorded history.
    pub async fn open(task_dir: &Path) -> Result<(Self, TaskHistory), AgentError> {
        let info_path = task_dir.join(TASK_INFO_FILE);
        let raw = async_fs::read_to_string(&info_path)
            .await
            .map_err(|e| storage("read", &info_path, e))?;
        let info: TaskInfo = serde_json::from_str(&raw).map_err(|e| storage("parse", &info_path, e))?;

        let mut history = TaskHistory::default();
        let history_path = task_dir.join(HISTORY_FILE);
        match async_fs::read_to_string(&history_path).await {
            Ok(content) => {
                for (n, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<StepRecord>(line) {
                        Ok(record) => history.push(record),
                        Err(err) => warn!(line = n + 1, error = %err, "skipping unreadable history line"),
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(storage("read", &history_path, err)),
        }

        async_fs::create_dir_all(task_dir.join(IMG_DIR)).await?;
        info!(task_id = %info.task_id, steps = history.len(), "task directory reopened");
        Ok((
            Self {
                dir: task_dir.to_path_buf(),
                info,
            },
            history,
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    /// Writes `img/step_NN_<label>.png` and returns its task-relative path.
    pub async fn save_screenshot(
        &self,
        step: usize,
        label: &str,
        shot: &Screenshot,
    ) -> Result<String, AgentError> {
        let relative = format!("{IMG_DIR}/step_{step:02}_{label}.png");
        let path = self.dir.join(&relative);
        async_fs::write(&path, &shot.png)
            .await
            .map_err(|e| storage("write", &path, e))?;
        Ok(relative)
    }

    /// Persists the record as `step_NN.json` and one `history.jsonl` line.
    pub async fn append_step(
        &mut self,
        history: &mut TaskHistory,
        record: StepRecord,
    ) -> Result<(), AgentError> {
        let step_path = self.dir.join(format!("step_{:02}.json", record.step));
        let pretty = serde_json::to_vec_pretty(&record)?;
        async_fs::write(&step_path, pretty)
            .await
            .map_err(|e| storage("write", &step_path, e))?;

        let history_path = self.dir.join(HISTORY_FILE);
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = async_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&history_path)
            .await
            .map_err(|e| storage("open", &history_path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| storage("append", &history_path, e))?;
        file.flush().await?;

        self.info.steps_executed = self.info.steps_executed.max(record.step);
        self.info.updated_at = Utc::now();
        history.push(record);
        self.write_info().await
    }

    pub async fn mark_in_progress(&mut self) -> Result<(), AgentError> {
        self.info.status = TaskStatus::InProgress;
        self.info.updated_at = Utc::now();
        self.write_info().await
    }

    /// Leaves the task resumable, recording why the run stopped.
    pub async fn record_exit(&mut self, exit_reason: &str) -> Result<(), AgentError> {
        self.info.exit_reason = Some(exit_reason.to_string());
        self.info.updated_at = Utc::now();
        self.write_info().await
    }

    pub async fn mark_completed(&mut self, exit_reason: &str) -> Result<(), AgentError> {
        let now = Utc::now();
        self.info.status = TaskStatus::Completed;
        self.info.completed_at = Some(now);
        self.info.updated_at = now;
        self.info.exit_reason = Some(exit_reason.to_string());
        self.write_info().await
    }

    pub async fn record_learning(&mut self, experience_id: &str) -> Result<(), AgentError> {
        self.info.experience_id = Some(experience_id.to_string());
        self.info.updated_at = Utc::now();
        self.write_info().await
    }

    /// With `write_marker`, also drops a human-readable `TASK_FAILED.txt`.
    pub async fn mark_failed(&mut self, reason: &str, write_marker: bool) -> Result<(), AgentError> {
        let now = Utc::now();
        self.info.status = TaskStatus::Failed;
        self.info.failed_at = Some(now);
        self.info.updated_at = now;
        self.info.failure_reason = Some(reason.to_string());
        self.info.exit_reason = Some("failed".to_string());
        self.write_info().await?;

        if write_marker {
            let marker = self.dir.join(FAILURE_MARKER);
            let body = format!(
                "task failed\ntime: {}\ntask_id: {}\ntask: {}\nsteps: {}\nreason: {}\n",
                now.to_rfc3339(),
                self.info.task_id,
                self.info.global_task,
                self.info.steps_executed,
                reason
            );
            async_fs::write(&marker, body)
                .await
                .map_err(|e| storage("write", &marker, e))?;
            warn!(task_id = %self.info.task_id, reason, "task marked failed");
        }
        Ok(())
    }

    async fn write_info(&self) -> Result<(), AgentError> {
        let path = self.dir.join(TASK_INFO_FILE);
        let body = serde_json::to_vec_pretty(&self.info)?;
        async_fs::write(&path, body)
            .await
            .map_err(|e| storage("write", &path, e))
    }
}
