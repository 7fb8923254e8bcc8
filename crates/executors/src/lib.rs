pub mod command;
pub mod executors;
pub mod logs;
