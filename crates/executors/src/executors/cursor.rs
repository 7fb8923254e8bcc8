use serde::{Deserialize, Serialize};

use crate::{
    command::{CommandBuilder, CommandSpec},
    executors::{AgentTask, CodingAgentExecutor, ExecutorError},
    logs::{self, ExecutionLogEntry, LogSource},
};

/// Adapter for the Cursor agent CLI. Plain-text output, prompt on stdin.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CursorAgent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl CursorAgent {
    fn command_builder(&self) -> CommandBuilder {
        let mut builder = CommandBuilder::new("cursor-agent").params(["--print"]);
        if let Some(model) = &self.model {
            builder = builder.extend_params(["--model".to_string(), model.clone()]);
        }
        builder
    }
}

impl CodingAgentExecutor for CursorAgent {
    fn planning_command(&self, task: &AgentTask) -> Result<CommandSpec, ExecutorError> {
        let prompt = format!(
            "Produce a markdown implementation plan for this task. Do not \
             modify any files.\n\n{}",
            task.to_prompt()
        );
        Ok(CommandSpec::new(self.command_builder().build()).stdin(prompt))
    }

    fn implementation_command(&self, task: &AgentTask) -> Result<CommandSpec, ExecutorError> {
        task.worktree_path()?;
        let plan = task.plan_content()?;
        let prompt = format!("{}\n\nApproved plan:\n\n{}", task.to_prompt(), plan);
        Ok(CommandSpec::new(self.command_builder().build()).stdin(prompt))
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
        let plan = final_output.trim();
        if plan.is_empty() {
            return Err(ExecutorError::EmptyPlan);
        }
        Ok(plan.to_string())
    }
}
