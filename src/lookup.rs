//! Time-boxed retrieval of past experiences and facts.
//!
//! The lookup runs as a detached tokio task. Once the deadline passes the
//! caller moves on with an empty result; the task is not aborted and whatever
//! it eventually returns is dropped together with its `JoinHandle`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::store::TaskHistory;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperienceRecord {
    pub task_description: String,
    pub keywords: Vec<String>,
    pub action_steps: Vec<String>,
    pub success: bool,
    pub app_name: Option<String>,
    pub source_task_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    pub content: String,
    pub keywords: Vec<String>,
    pub source: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub experiences: Vec<ExperienceRecord>,
    pub facts: Vec<FactRecord>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.experiences.is_empty() && self.facts.is_empty()
    }

    /// Planner-facing summary of the retrieved knowledge.
    pub fn guidance(&self) -> String {
        let mut out = String::new();
        if !self.experiences.is_empty() {
            out.push_str("Relevant past experiences:\n");
            for (i, exp) in self.experiences.iter().enumerate() {
                let outcome = if exp.success { "succeeded" } else { "failed" };
                let _ = writeln!(out, "{}. {} ({outcome})", i + 1, exp.task_description);
                if let Some(app) = &exp.app_name {
                    let _ = writeln!(out, "   app: {app}");
                }
                for (n, step) in exp.action_steps.iter().enumerate() {
                    let _ = writeln!(out, "   step {}: {step}", n + 1);
                }
            }
        }
        if !self.facts.is_empty() {
            out.push_str("Relevant facts:\n");
            for fact in &self.facts {
                let _ = writeln!(out, "- {}", fact.content);
            }
        }
        out
    }
}

/// Source of experiences and facts, e.g. a vector store.
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync + 'static {
    async fn retrieve(&self, query: &str, top_n: usize) -> anyhow::Result<RetrievalResult>;
}

/// A finished task, handed back to the knowledge store.
#[derive(Clone, Copy, Debug)]
pub struct TaskOutcome<'a> {
    pub task: &'a str,
    pub history: &'a TaskHistory,
    pub success: bool,
    pub task_id: &'a str,
    pub app_name: Option<&'a str>,
}

/// Write side of the knowledge store: turns a finished task into an
/// experience, or updates a similar one already stored.
#[async_trait]
pub trait ExperienceLearner: Send + Sync {
    /// Identifier of the stored or updated experience.
    async fn learn(&self, outcome: &TaskOutcome<'_>) -> anyhow::Result<String>;
}

#[derive(Clone)]
pub struct BoundedLookup {
    retriever: Arc<dyn KnowledgeRetriever>,
    timeout: Duration,
    top_n: usize,
}

impl BoundedLookup {
    pub fn new(retriever: Arc<dyn KnowledgeRetriever>, timeout: Duration, top_n: usize) -> Self {
        Self { retriever, timeout, top_n }
    }

    /// Best effort: timeouts, errors and panics all yield an empty result.
    pub async fn lookup(&self, query: &str) -> RetrievalResult {
        let retriever = Arc::clone(&self.retriever);
        let query_owned = query.to_string();
        let top_n = self.top_n;
        let handle = tokio::spawn(async move { retriever.retrieve(&query_owned, top_n).await });

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(Ok(result))) => {
                debug!(
                    experiences = result.experiences.len(),
                    facts = result.facts.len(),
                    "knowledge lookup finished"
                );
                result
            }
            Ok(Ok(Err(err))) => {
                warn!(error = %format!("{err:#}"), "knowledge lookup failed");
                RetrievalResult::default()
            }
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "knowledge lookup task panicked");
                RetrievalResult::default()
            }
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs_f64(), query, "knowledge lookup timed out");
                RetrievalResult::default()
            }
        }
    }
}
