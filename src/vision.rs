//! Model-backed implementations of the agent's collaborator traits.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent::{
    CompletionJudge, GroundingModel, LoadingDetector, PlanRequest, Planner, StepContext,
    StepEvaluation, StepEvaluator,
};
use crate::client::ChatClient;
use crate::device::Screenshot;
use crate::store::StepRecord;

const GROUNDING_SYSTEM_PROMPT: &str = r#"You are a GUI agent operating an Android phone. You are given an instruction and a screenshot. Perform the next action.
## Output Format
```
Thought: ...
Action: ...
```
## Action Space
click(start_box='[x1, y1, x2, y2]')
left_double(start_box='[x1, y1, x2, y2]')
right_single(start_box='[x1, y1, x2, y2]') # long press
drag(start_box='[x1, y1, x2, y2]', end_box='[x3, y3, x4, y4]')
hotkey(key='') # enter, back, home, menu, escape, delete
type(content='') # end with "\n" to submit
scroll(start_box='[x1, y1, x2, y2]', direction='down or up or right or left')
wait() # sleep 5s and look again
finished(content='xxx') # escape \', \" and \n inside content
## Rules
- Coordinates are normalized to 0-1000 on both axes.
- Type directly into a focused field; tap a field first only when it is not focused.
- Write a short plan in `Thought` and name the target element of the next action.
## User Instruction"#;

/// UI-TARS style grounding over a chat endpoint.
#[derive(Clone)]
pub struct GroundingClient {
    chat: ChatClient,
    extra_instructions: Option<String>,
}

impl GroundingClient {
    pub fn new(chat: ChatClient) -> Self {
        Self { chat, extra_instructions: None }
    }

    pub fn with_instructions(mut self, extra: impl Into<String>) -> Self {
        self.extra_instructions = Some(extra.into());
        self
    }

    fn system_prompt(&self) -> String {
        match &self.extra_instructions {
            Some(extra) => format!("{GROUNDING_SYSTEM_PROMPT}\n\n## Additional Instructions\n{extra}"),
            None => GROUNDING_SYSTEM_PROMPT.to_string(),
        }
    }
}

#[async_trait]
impl GroundingModel for GroundingClient {
    async fn ground(&self, instruction: &str, screen: &Screenshot) -> Result<String> {
        self.chat
            .complete(Some(&self.system_prompt()), instruction, &[screen])
            .await
            .context("grounding request failed")
    }
}

/// General vision assistant used for planning and for judging outcomes.
#[derive(Clone)]
pub struct VisionAssistant {
    chat: ChatClient,
}

impl VisionAssistant {
    pub fn new(chat: ChatClient) -> Self {
        Self { chat }
    }
}

/// First `{...}` span of a reply, parsed as an object.
fn json_object(reply: &str) -> Result<serde_json::Map<String, Value>> {
    let start = reply.find('{').ok_or_else(|| anyhow!("no JSON object in reply: {reply}"))?;
    let end = reply.rfind('}').ok_or_else(|| anyhow!("no JSON object in reply: {reply}"))?;
    if end < start {
        return Err(anyhow!("no JSON object in reply: {reply}"));
    }
    match serde_json::from_str::<Value>(&reply[start..=end]).context("malformed JSON in reply")? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("expected a JSON object, got {other}")),
    }
}

fn flag(map: &serde_json::Map<String, Value>, key: &str) -> Option<bool> {
    match map.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn reason(map: &serde_json::Map<String, Value>) -> String {
    map.get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn describe_action(step: &StepContext<'_>) -> String {
    serde_json::to_string(step.action).unwrap_or_else(|_| step.action.action.as_str().to_string())
}

#[async_trait]
impl Planner for VisionAssistant {
    async fn plan(&self, request: &PlanRequest<'_>, screen: &Screenshot) -> Result<String> {
        let mut prompt = format!(
            "You plan the next step of a task on an Android phone.\n\nTask: {}\n",
            request.task
        );
        if let Some(app) = request.app_name {
            prompt.push_str(&format!("App: {app}\n"));
        }
        prompt.push_str(&format!("\nSteps so far:\n{}\n", request.history_summary));
        if let Some(guidance) = request.guidance {
            prompt.push_str(&format!("\n{guidance}\n"));
        }
        if let Some(draft) = request.draft {
            prompt.push_str(&format!(
                "\nYour first draft for the next step was: {draft}\nImprove it using the experiences above if they apply.\n"
            ));
        }
        prompt.push_str(
            "\nLook at the screenshot and reply with ONE short instruction for the next UI action only, \
             naming the element to act on. No explanations.",
        );
        self.chat.complete(None, &prompt, &[screen]).await.context("planning request failed")
    }
}

#[async_trait]
impl StepEvaluator for VisionAssistant {
    async fn evaluate(
        &self,
        step: &StepContext<'_>,
        before: &Screenshot,
        after: &Screenshot,
    ) -> Result<StepEvaluation> {
        let prompt = format!(
            "You judge whether one UI step on an Android phone succeeded.\n\n\
             Task: {}\nStep: {}\nAction: {}\n\n\
             The first image was taken before the action, the second after it. \
             The step succeeded only if the screen changed the way the step intends. \
             For text input, success means the text is visible in the field. \
             No change, an unrelated change or an error page means failure.\n\n\
             Reply with JSON only: {{\"success\": true/false, \"reason\": \"...\"}}",
            step.task,
            step.micro_task,
            describe_action(step)
        );
        let reply = self
            .chat
            .complete(None, &prompt, &[before, after])
            .await
            .context("evaluation request failed")?;
        let map = json_object(&reply)?;
        let success = flag(&map, "success").ok_or_else(|| anyhow!("evaluation without success flag: {reply}"))?;
        Ok(StepEvaluation {
            success,
            reason: reason(&map),
        })
    }
}

#[async_trait]
impl LoadingDetector for VisionAssistant {
    async fn still_loading(
        &self,
        step: &StepContext<'_>,
        before: &Screenshot,
        after: &Screenshot,
    ) -> Result<bool> {
        let prompt = format!(
            "You check whether a phone screen finished loading after an action.\n\n\
             Action: {}\n\n\
             The first image was taken before the action, the second after it. \
             Does the second image still show unloaded content such as skeleton screens, \
             spinners, blank regions or a \"loading\" label?\n\n\
             Reply with JSON only: {{\"unloaded\": true/false, \"reason\": \"...\"}}",
            describe_action(step)
        );
        let reply = self
            .chat
            .complete(None, &prompt, &[before, after])
            .await
            .context("loading check failed")?;
        let map = json_object(&reply)?;
        flag(&map, "unloaded").ok_or_else(|| anyhow!("loading check without unloaded flag: {reply}"))
    }
}

#[async_trait]
impl CompletionJudge for VisionAssistant {
    async fn judge(
        &self,
        task: &str,
        recent: &[StepRecord],
        step_count: usize,
        screen: &Screenshot,
    ) -> Result<String> {
        let summary: Vec<Value> = recent
            .iter()
            .map(|r| {
                json!({
                    "step": r.step,
                    "micro_task": r.micro_task,
                    "action": r.action.action.as_str(),
                    "thought": r.action.thought,
                    "success": r.evaluation_success,
                    "reason": r.evaluation_reason,
                })
            })
            .collect();
        let history = serde_json::to_string_pretty(&summary).unwrap_or_default();
        let prompt = format!(
            "You decide whether a task on an Android phone is complete.\n\n\
             Task: {task}\nSteps taken: {step_count}\nRecent steps:\n{history}\n\n\
             Look at the current screenshot. The task is complete only when every part of it \
             has been carried out; reaching the home screen alone does not count unless the task \
             ends there.\n\n\
             Reply with JSON only: {{\"completed\": true/false, \"reason\": \"...\", \"confidence\": 0.0-1.0}}"
        );
        self.chat
            .complete(None, &prompt, &[screen])
            .await
            .context("completion check failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_object_from_prose() {
        let map = json_object("Sure! {\"success\": \"true\", \"reason\": \"text visible\"} Done.").unwrap();
        assert_eq!(flag(&map, "success"), Some(true));
        assert_eq!(reason(&map), "text visible");
    }

    #[test]
    fn rejects_replies_without_object() {
        assert!(json_object("looks fine to me").is_err());
        assert!(json_object("} oops {").is_err());
        assert!(json_object("[1, 2]").is_err());
    }
}
