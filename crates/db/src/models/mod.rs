pub mod execution;
pub mod execution_log;
pub mod job;
pub mod plan;
pub mod project;
pub mod pull_request;
pub mod task;
