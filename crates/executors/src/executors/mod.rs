use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use sqlx::Type;
use strum_macros::{Display, EnumDiscriminants, EnumString, VariantNames};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    command::CommandSpec,
    executors::{claude::ClaudeCode, cursor::CursorAgent, fake::FakeCode},
    logs::{ExecutionLogEntry, LogSource},
};

pub mod claude;
pub mod cursor;
pub mod fake;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Unknown AI type: {0}")]
    UnknownAiType(String),
    #[error("Task has no worktree path")]
    MissingWorktreePath,
    #[error("Task has no plan attached")]
    MissingPlan,
    #[error("Executor produced no plan content")]
    EmptyPlan,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The task fields an adapter is allowed to see. Adapters are pure over this
/// struct: the same input always yields the same command.
#[derive(Debug, Clone)]
pub struct AgentTask {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub worktree_path: Option<String>,
    pub plan_content: Option<String>,
}

impl AgentTask {
    pub fn to_prompt(&self) -> String {
        if let Some(description) = &self.description {
            format!("Title: {}\n\nDescription:\n{}", &self.title, description)
        } else {
            self.title.clone()
        }
    }

    fn worktree_path(&self) -> Result<&str, ExecutorError> {
        self.worktree_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or(ExecutorError::MissingWorktreePath)
    }

    fn plan_content(&self) -> Result<&str, ExecutorError> {
        self.plan_content
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or(ExecutorError::MissingPlan)
    }
}

#[enum_dispatch]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Display, EnumDiscriminants, VariantNames)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
#[strum_discriminants(
    name(AiType),
    derive(EnumString, Hash, strum_macros::Display, Serialize, Deserialize, Type),
    strum(serialize_all = "kebab-case"),
    serde(rename_all = "kebab-case"),
    sqlx(type_name = "TEXT", rename_all = "kebab-case")
)]
pub enum CodingAgent {
    ClaudeCode,
    CursorAgent,
    FakeCode,
}

impl CodingAgent {
    /// Resolve the adapter for a stored `AiType` tag.
    pub fn from_ai_type(ai_type: AiType) -> Self {
        match ai_type {
            AiType::ClaudeCode => Self::ClaudeCode(ClaudeCode::default()),
            AiType::CursorAgent => Self::CursorAgent(CursorAgent::default()),
            AiType::FakeCode => Self::FakeCode(FakeCode::default()),
        }
    }

    /// Resolve from a raw tag; the unknown tag is a recoverable error.
    pub fn from_tag(tag: &str) -> Result<Self, ExecutorError> {
        let ai_type: AiType = tag
            .parse()
            .map_err(|_| ExecutorError::UnknownAiType(tag.to_string()))?;
        Ok(Self::from_ai_type(ai_type))
    }
}

/// Pluggable strategy that turns a task into a supervised command and parses
/// the streamed output back into structured records.
#[enum_dispatch(CodingAgent)]
pub trait CodingAgentExecutor {
    /// Command and stdin for a planning run in the task's worktree.
    fn planning_command(&self, task: &AgentTask) -> Result<CommandSpec, ExecutorError>;

    /// Command and stdin for an implementation run. Requires a worktree and a
    /// plan on the task.
    fn implementation_command(&self, task: &AgentTask) -> Result<CommandSpec, ExecutorError>;

    /// Parse a streamed output chunk into line-numbered log entries.
    /// `start_line` is the next free line number for the execution.
    fn parse_output_to_logs(
        &self,
        chunk: &str,
        source: LogSource,
        start_line: i64,
    ) -> Vec<ExecutionLogEntry>;

    /// Extract the plan markdown from the full output of a planning run.
    fn parse_output_to_plan(&self, final_output: &str) -> Result<String, ExecutorError>;
}
