use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use db::models::{plan::Plan, pull_request::PrStatus, task::Task};
use octocrab::{Octocrab, OctocrabBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum GitHubServiceError {
    #[error(transparent)]
    Client(octocrab::Error),
    #[error("Repository error: {0}")]
    Repository(String),
    #[error("Pull request error: {0}")]
    PullRequest(String),
    #[error("Branch error: {0}")]
    Branch(String),
    #[error("GitHub token is invalid or expired.")]
    TokenInvalid,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
}

impl From<octocrab::Error> for GitHubServiceError {
    fn from(err: octocrab::Error) -> Self {
        match &err {
            octocrab::Error::GitHub { source, .. } => {
                let status = source.status_code.as_u16();
                let msg = source.message.to_ascii_lowercase();
                if status == 401 || msg.contains("bad credentials") || msg.contains("token expired")
                {
                    GitHubServiceError::TokenInvalid
                } else if status == 403 {
                    GitHubServiceError::InsufficientPermissions
                } else {
                    GitHubServiceError::Client(err)
                }
            }
            _ => GitHubServiceError::Client(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitHubRepoInfo {
    pub owner: String,
    pub repo_name: String,
}

impl GitHubRepoInfo {
    /// Parse an "owner/repo" slug.
    pub fn from_slug(repository: &str) -> Result<Self, GitHubServiceError> {
        let mut parts = repository.splitn(2, '/');
        match (parts.next(), parts.next()) {
            (Some(owner), Some(repo_name)) if !owner.is_empty() && !repo_name.is_empty() => {
                Ok(Self {
                    owner: owner.to_string(),
                    repo_name: repo_name.to_string(),
                })
            }
            _ => Err(GitHubServiceError::Repository(format!(
                "Not an owner/repo slug: {repository}"
            ))),
        }
    }
}

/// Current state of a PR as reported by GitHub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePrStatus {
    pub number: i64,
    pub url: String,
    pub status: PrStatus,
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merge_commit_sha: Option<String>,
    pub merged_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedPr {
    pub repository: String,
    pub number: i64,
    pub url: String,
}

/// Read side consumed by the PR status sync job.
#[async_trait]
pub trait GithubPrClient: Send + Sync {
    async fn get_pull_request(
        &self,
        repository: &str,
        number: i64,
    ) -> Result<RemotePrStatus, GitHubServiceError>;
}

/// Write side consumed by the implementation workflow.
#[async_trait]
pub trait PrCreator: Send + Sync {
    async fn create_from_implementation(
        &self,
        repository: &str,
        task: &Task,
        plan: Option<&Plan>,
    ) -> Result<CreatedPr, GitHubServiceError>;
}

#[derive(Clone)]
pub struct GitHubService {
    client: Octocrab,
    base_branch: String,
}

fn retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(3)
        .with_jitter()
}

impl GitHubService {
    pub fn new(github_token: Option<&str>, base_branch: &str) -> Result<Self, GitHubServiceError> {
        let builder = OctocrabBuilder::new();
        let client = match github_token {
            Some(token) if !token.is_empty() => builder.personal_token(token.to_string()).build(),
            _ => builder.build(),
        }?;
        Ok(Self {
            client,
            base_branch: base_branch.to_string(),
        })
    }

    async fn get_pr_internal(
        &self,
        repo_info: &GitHubRepoInfo,
        number: i64,
    ) -> Result<RemotePrStatus, GitHubServiceError> {
        let pr = self
            .client
            .pulls(&repo_info.owner, &repo_info.repo_name)
            .get(number as u64)
            .await
            .map_err(|e| {
                GitHubServiceError::PullRequest(format!("Failed to get PR #{number}: {e}"))
            })?;

        let status = match pr.state {
            Some(octocrab::models::IssueState::Open) => PrStatus::Open,
            Some(octocrab::models::IssueState::Closed) => {
                if pr.merged_at.is_some() {
                    PrStatus::Merged
                } else {
                    PrStatus::Closed
                }
            }
            _ => PrStatus::Open,
        };

        Ok(RemotePrStatus {
            number: pr.number as i64,
            url: pr.html_url.map(|url| url.to_string()).unwrap_or_default(),
            status,
            merged_at: pr.merged_at,
            closed_at: pr.closed_at,
            merge_commit_sha: pr.merge_commit_sha.clone(),
            merged_by: pr.merged_by.map(|user| user.login),
        })
    }

    async fn create_pr_internal(
        &self,
        repo_info: &GitHubRepoInfo,
        head_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<CreatedPr, GitHubServiceError> {
        // Surface a missing head branch as its own error; it usually means
        // the push failed earlier in the workflow.
        self.client
            .repos(&repo_info.owner, &repo_info.repo_name)
            .get_ref(&octocrab::params::repos::Reference::Branch(
                head_branch.to_string(),
            ))
            .await
            .map_err(|e| {
                GitHubServiceError::Branch(format!(
                    "Head branch '{head_branch}' does not exist. Make sure the branch was pushed successfully: {e}"
                ))
            })?;

        let pr = self
            .client
            .pulls(&repo_info.owner, &repo_info.repo_name)
            .create(title, head_branch, &self.base_branch)
            .body(body)
            .send()
            .await?;

        let created = CreatedPr {
            repository: format!("{}/{}", repo_info.owner, repo_info.repo_name),
            number: pr.number as i64,
            url: pr.html_url.map(|url| url.to_string()).unwrap_or_default(),
        };
        info!(
            "Created GitHub PR #{} for branch {} in {}",
            created.number, head_branch, created.repository
        );
        Ok(created)
    }
}

#[async_trait]
impl GithubPrClient for GitHubService {
    async fn get_pull_request(
        &self,
        repository: &str,
        number: i64,
    ) -> Result<RemotePrStatus, GitHubServiceError> {
        let repo_info = GitHubRepoInfo::from_slug(repository)?;
        (|| async { self.get_pr_internal(&repo_info, number).await })
            .retry(&retry_policy())
            .when(|e| !matches!(e, GitHubServiceError::TokenInvalid))
            .notify(|err: &GitHubServiceError, dur: Duration| {
                tracing::warn!(
                    "GitHub API call failed, retrying after {:.2}s: {}",
                    dur.as_secs_f64(),
                    err
                );
            })
            .await
    }
}

#[async_trait]
impl PrCreator for GitHubService {
    async fn create_from_implementation(
        &self,
        repository: &str,
        task: &Task,
        plan: Option<&Plan>,
    ) -> Result<CreatedPr, GitHubServiceError> {
        let repo_info = GitHubRepoInfo::from_slug(repository)?;
        let head_branch = task.branch_name.as_deref().ok_or_else(|| {
            GitHubServiceError::Branch(format!("Task {} has no branch name", task.id))
        })?;

        let title = format!("Implement task: {}", task.title);
        let mut body = task.description.clone().unwrap_or_default();
        if let Some(plan) = plan {
            body.push_str("\n\n---\n\n");
            body.push_str(&plan.content);
        }

        (|| async {
            self.create_pr_internal(&repo_info, head_branch, &title, &body)
                .await
        })
        .retry(&retry_policy())
        .when(|e| !matches!(e, GitHubServiceError::TokenInvalid))
        .notify(|err: &GitHubServiceError, dur: Duration| {
            tracing::warn!(
                "GitHub API call failed, retrying after {:.2}s: {}",
                dur.as_secs_f64(),
                err
            );
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_parsing_rejects_malformed_input() {
        let info = GitHubRepoInfo::from_slug("acme/widget").unwrap();
        assert_eq!(info.owner, "acme");
        assert_eq!(info.repo_name, "widget");
        assert!(GitHubRepoInfo::from_slug("widget").is_err());
        assert!(GitHubRepoInfo::from_slug("/widget").is_err());
    }
}
