use serde::{Deserialize, Serialize};

use crate::{
    command::{CommandBuilder, CommandSpec},
    executors::{AgentTask, CodingAgentExecutor, ExecutorError},
    logs::{self, ExecutionLogEntry, LogSource},
};

fn base_command() -> &'static str {
    "npx -y @anthropic-ai/claude-code@latest"
}

/// Adapter for the Claude Code CLI. Prompts are fed on stdin; output arrives
/// as `stream-json` lines, one JSON object per event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClaudeCode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_command_override: Option<String>,
}

impl ClaudeCode {
    fn command_builder(&self, plan: bool) -> CommandBuilder {
        let mut params: Vec<&'static str> = vec!["-p"];
        if plan {
            params.push("--permission-mode=plan");
        } else {
            params.push("--dangerously-skip-permissions");
        }
        params.extend_from_slice(&["--verbose", "--output-format=stream-json"]);

        let base = self
            .base_command_override
            .clone()
            .unwrap_or_else(|| base_command().to_string());
        CommandBuilder::new(base).params(params)
    }
}

impl CodingAgentExecutor for ClaudeCode {
    fn planning_command(&self, task: &AgentTask) -> Result<CommandSpec, ExecutorError> {
        let prompt = format!(
            "Create an implementation plan for the following task. Respond with \
             the plan as markdown only.\n\n{}",
            task.to_prompt()
        );
        Ok(CommandSpec::new(self.command_builder(true).build()).stdin(prompt))
    }

    fn implementation_command(&self, task: &AgentTask) -> Result<CommandSpec, ExecutorError> {
        task.worktree_path()?;
        let plan = task.plan_content()?;
        let prompt = format!(
            "{}\n\nFollow this approved plan:\n\n{}",
            task.to_prompt(),
            plan
        );
        Ok(CommandSpec::new(self.command_builder(false).build()).stdin(prompt))
    }

    fn parse_output_to_logs(
        &self,
        chunk: &str,
        source: LogSource,
        start_line: i64,
    ) -> Vec<ExecutionLogEntry> {
        logs::chunk_to_entries(chunk, source, start_line)
    }

    fn parse_output_to_plan(&self, final_output: &str) -> Result<String, ExecutorError> {
        // stream-json ends with a result event carrying the final text; fall
        // back to the raw output when the stream was not JSON after all.
        for line in final_output.lines().rev() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(line)
                && let Some(result) = value.get("result").and_then(|r| r.as_str())
            {
                let plan = result.trim();
                if plan.is_empty() {
                    return Err(ExecutorError::EmptyPlan);
                }
                return Ok(plan.to_string());
            }
        }
        let plan = final_output.trim();
        if plan.is_empty() {
            return Err(ExecutorError::EmptyPlan);
        }
        Ok(plan.to_string())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn task(worktree: Option<&str>, plan: Option<&str>) -> AgentTask {
        AgentTask {
            id: Uuid::new_v4(),
            title: "Add retry logic".into(),
            description: Some("Wrap the client in retries".into()),
            worktree_path: worktree.map(String::from),
            plan_content: plan.map(String::from),
        }
    }

    #[test]
    fn planning_uses_plan_mode_and_stdin_prompt() {
        let spec = ClaudeCode::default()
            .planning_command(&task(None, None))
            .unwrap();
        assert!(spec.command.contains("--permission-mode=plan"));
        assert!(spec.stdin.unwrap().contains("Add retry logic"));
    }

    #[test]
    fn implementation_needs_a_plan() {
        let err = ClaudeCode::default()
            .implementation_command(&task(Some("/tmp/wt"), None))
            .unwrap_err();
        assert!(matches!(err, ExecutorError::MissingPlan));
    }

    #[test]
    fn plan_extracted_from_stream_json_result() {
        let output = concat!(
            "{\"type\":\"system\",\"subtype\":\"init\"}\n",
            "{\"type\":\"assistant\",\"message\":{}}\n",
            "{\"type\":\"result\",\"result\":\"## Plan\\n1. do it\"}\n",
        );
        let plan = ClaudeCode::default().parse_output_to_plan(output).unwrap();
        assert_eq!(plan, "## Plan\n1. do it");
    }

    #[test]
    fn plain_output_falls_back_to_raw_text() {
        let plan = ClaudeCode::default()
            .parse_output_to_plan("## Plan\njust text\n")
            .unwrap();
        assert_eq!(plan, "## Plan\njust text");
        assert!(matches!(
            ClaudeCode::default().parse_output_to_plan("  \n"),
            Err(ExecutorError::EmptyPlan)
        ));
    }
}
