use std::{sync::Arc, time::Duration};

use anyhow::Error as AnyhowError;
use server::routes;
use services::services::{
    broker::Broker,
    execution::ExecutionEngine,
    git::GitService,
    github::{GitHubService, GitHubServiceError},
    hub::Hub,
    jobs::{
        JOB_PR_STATUS_SYNC, JOB_WORKTREE_CLEANUP, JobProcessor, ProcessorConfig, QUEUE_MONITORING,
    },
    notify::NotificationService,
    process_manager::ProcessManager,
    queue::{EnqueueOptions, JobQueue, QueueConfig},
    worktree::WorktreeManager,
};
use sqlx::Error as SqlxError;
use strip_ansi_escapes::strip;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Debug, Error)]
enum DevflowError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    GitHub(#[from] GitHubServiceError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

#[tokio::main]
async fn main() -> Result<(), DevflowError> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,server={level},services={level},db={level},executors={level},utils={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string).expect("Failed to create tracing filter");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let database_path =
        std::env::var("DEVFLOW_DB").unwrap_or_else(|_| "devflow.sqlite".to_string());
    let db = db::DBService::new(&format!("sqlite://{database_path}")).await?;

    let hub = Hub::new();
    hub.spawn_stale_sweeper(Duration::from_secs(30));

    // The broker is optional; without it, notifications stay in-process.
    let broker = match std::env::var("REDIS_URL") {
        Ok(url) => match Broker::connect(&url).await {
            Ok(broker) => {
                broker.spawn_subscriber(hub.clone());
                Some(Arc::new(broker))
            }
            Err(e) => {
                tracing::warn!("Broker unavailable, running single-process: {e}");
                None
            }
        },
        Err(_) => None,
    };

    let source = format!("devflow-{}", uuid::Uuid::new_v4().simple());
    let notifier = NotificationService::new(hub.clone(), broker, &source);

    let engine = ExecutionEngine::new(ProcessManager::new());
    let github_token = std::env::var("GITHUB_TOKEN").ok();
    let base_branch =
        std::env::var("GITHUB_BASE_BRANCH").unwrap_or_else(|_| "main".to_string());
    let github = Arc::new(GitHubService::new(github_token.as_deref(), &base_branch)?);

    let mut processor_config = ProcessorConfig::default();
    if let Ok(days) = std::env::var("DEVFLOW_WORKTREE_RETENTION_DAYS")
        && let Ok(days) = days.trim().parse::<i64>()
    {
        processor_config.worktree_retention = chrono::Duration::days(days);
    }

    let processor = JobProcessor::new(
        db.clone(),
        engine,
        notifier,
        Arc::new(GitService::new()),
        github.clone(),
        github,
        Arc::new(WorktreeManager::new()),
        processor_config,
    );
    processor
        .recover_orphan_executions()
        .await
        .map_err(|e| AnyhowError::msg(e.to_string()))?;

    let queue = JobQueue::new(db.clone(), QueueConfig::default());
    processor.register_handlers(&queue).await;
    queue.start();
    queue.register_periodic(
        JOB_PR_STATUS_SYNC,
        Duration::from_secs(30),
        EnqueueOptions {
            queue: QUEUE_MONITORING.to_string(),
            ..Default::default()
        },
    );
    queue.register_periodic(
        JOB_WORKTREE_CLEANUP,
        Duration::from_secs(3600),
        EnqueueOptions::default(),
    );

    let app_router = routes::router(hub);

    let port = std::env::var("BACKEND_PORT")
        .or_else(|_| std::env::var("PORT"))
        .ok()
        .and_then(|s| {
            // remove any ANSI codes, then turn into String
            let cleaned =
                String::from_utf8(strip(s.as_bytes())).expect("UTF-8 after stripping ANSI");
            cleaned.trim().parse::<u16>().ok()
        })
        .unwrap_or_else(|| {
            tracing::info!("No PORT environment variable set, using port 0 for auto-assignment");
            0
        });

    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    let actual_port = listener.local_addr()?.port();

    tracing::info!("Server running on http://{host}:{actual_port}");

    axum::serve(listener, app_router).await?;
    Ok(())
}
