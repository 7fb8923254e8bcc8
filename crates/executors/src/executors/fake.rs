use serde::{Deserialize, Serialize};

use crate::{
    command::CommandSpec,
    executors::{AgentTask, CodingAgentExecutor, ExecutorError},
    logs::{self, ExecutionLogEntry, LogSource},
};

/// Marker in a task description that makes the fake agent exit non-zero.
pub const FAIL_MARKER: &str = "FAKE_FAIL";

/// Deterministic echo agent for tests: prints a fixed script (with the
/// progress keywords the estimator looks for) and a canned plan, without
/// touching the network or the worktree.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FakeCode {}

impl FakeCode {
    fn wants_failure(task: &AgentTask) -> bool {
        task.description
            .as_deref()
            .is_some_and(|d| d.contains(FAIL_MARKER))
    }

    fn script(task: &AgentTask, body: &str) -> String {
        let mut script = format!(
            "echo 'Starting work on task {}'\n\
             echo 'Processing task context'\n\
             {body}\n",
            task.id
        );
        if Self::wants_failure(task) {
            script.push_str("echo 'fake agent failure' >&2\nexit 1\n");
        } else {
            script.push_str("echo 'Done'\n");
        }
        script
    }
}

impl CodingAgentExecutor for FakeCode {
    fn planning_command(&self, task: &AgentTask) -> Result<CommandSpec, ExecutorError> {
        let body = format!(
            "printf '%s\\n' '## Plan' '' '1. Inspect {}' '2. Apply the change' '3. Add tests'",
            task.title.replace('\'', "")
        );
        Ok(CommandSpec::new(Self::script(task, &body)))
    }

    fn implementation_command(&self, task: &AgentTask) -> Result<CommandSpec, ExecutorError> {
        task.worktree_path()?;
        task.plan_content()?;
        Ok(CommandSpec::new(Self::script(
            task,
            "echo 'Applying plan to worktree'",
        )))
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
        // Keep only the plan body, dropping the scripted progress lines.
        let plan: Vec<&str> = final_output
            .lines()
            .skip_while(|line| !line.starts_with("## "))
            .take_while(|line| *line != "Done")
            .collect();
        if plan.is_empty() {
            return Err(ExecutorError::EmptyPlan);
        }
        Ok(plan.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn task(description: Option<&str>) -> AgentTask {
        AgentTask {
            id: Uuid::new_v4(),
            title: "Fix login".into(),
            description: description.map(String::from),
            worktree_path: Some("/tmp/wt".into()),
            plan_content: Some("## Plan".into()),
        }
    }

    #[test]
    fn planning_script_is_deterministic_and_contains_plan() {
        let spec = FakeCode::default().planning_command(&task(None)).unwrap();
        assert!(spec.command.contains("## Plan"));
        assert!(spec.command.ends_with("echo 'Done'\n"));
        assert!(spec.stdin.is_none());
    }

    #[test]
    fn fail_marker_makes_script_exit_nonzero() {
        let spec = FakeCode::default()
            .planning_command(&task(Some("break it FAKE_FAIL")))
            .unwrap();
        assert!(spec.command.contains("exit 1"));
    }

    #[test]
    fn plan_parsed_from_scripted_output() {
        let output = "Starting work on task x\nProcessing task context\n## Plan\n\n1. Inspect\nDone\n";
        let plan = FakeCode::default().parse_output_to_plan(output).unwrap();
        assert!(plan.starts_with("## Plan"));
        assert!(!plan.contains("Done"));
    }
}
