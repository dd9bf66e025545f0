//! GitHub REST implementation of [`RepositoryHost`] via reqwest.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use super::{CommittedFile, NewRepository, RepoFile, RepoHandle, RepositoryHost};
use crate::config::HostConfig;
use crate::error::RepoError;

/// Talks to the GitHub REST API.
pub struct GitHubHost {
    client: reqwest::Client,
    api_url: String,
    token: String,
    admin_token: Option<String>,
}

#[derive(Deserialize)]
struct GhOwner {
    login: String,
}

#[derive(Deserialize)]
struct GhRepo {
    name: String,
    owner: GhOwner,
    html_url: String,
    private: bool,
    #[serde(default = "default_branch")]
    default_branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

impl From<GhRepo> for RepoHandle {
    fn from(repo: GhRepo) -> Self {
        RepoHandle {
            owner: repo.owner.login,
            name: repo.name,
            html_url: repo.html_url,
            private: repo.private,
            default_branch: repo.default_branch,
        }
    }
}

#[derive(Deserialize)]
struct GhContentSha {
    sha: String,
}

#[derive(Deserialize)]
struct GhPutContent {
    content: GhContentSha,
}

#[derive(Deserialize)]
struct GhRefObject {
    sha: String,
}

#[derive(Deserialize)]
struct GhRef {
    object: GhRefObject,
}

#[derive(Deserialize)]
struct GhOrganisation {
    avatar_url: String,
}

impl GitHubHost {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            admin_token: config.admin_token.clone(),
        }
    }

    fn request(&self, method: Method, path: &str, token: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "tablepub")
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        full_name: &str,
    ) -> Result<reqwest::Response, RepoError> {
        let resp = builder.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(status_error(status, &body, full_name))
    }

    async fn existing_sha(
        &self,
        repo: &RepoHandle,
        file: &RepoFile,
        branch: &str,
    ) -> Result<Option<String>, RepoError> {
        let path = format!(
            "/repos/{}/contents/{}?ref={}",
            repo.full_name(),
            file.path,
            branch
        );
        let result = self
            .send(self.request(Method::GET, &path, &self.token), &repo.full_name())
            .await;
        match result {
            Ok(resp) => {
                let content: GhContentSha = decode(resp).await?;
                Ok(Some(content.sha))
            }
            Err(RepoError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn branch_head(&self, repo: &RepoHandle, branch: &str) -> Result<String, RepoError> {
        let path = format!("/repos/{}/git/ref/heads/{}", repo.full_name(), branch);
        let resp = self
            .send(self.request(Method::GET, &path, &self.token), &repo.full_name())
            .await?;
        let head: GhRef = decode(resp).await?;
        Ok(head.object.sha)
    }
}

/// Body of a create-reference call pointing `branch` at `sha`.
fn new_branch_body(branch: &str, sha: &str) -> serde_json::Value {
    serde_json::json!({
        "ref": format!("refs/heads/{branch}"),
        "sha": sha,
    })
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, RepoError> {
    let text = resp.text().await?;
    serde_json::from_str(&text).map_err(|e| RepoError::Decode {
        message: e.to_string(),
    })
}

/// Map a non-success response to the matching error kind.
fn status_error(status: StatusCode, body: &str, full_name: &str) -> RepoError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect());
    match status {
        StatusCode::NOT_FOUND => RepoError::NotFound {
            full_name: full_name.to_string(),
        },
        StatusCode::UNPROCESSABLE_ENTITY if message.contains("already exists") => {
            RepoError::AlreadyExists {
                full_name: full_name.to_string(),
            }
        }
        _ => RepoError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl RepositoryHost for GitHubHost {
    async fn repository_exists(&self, owner: &str, name: &str) -> Result<bool, RepoError> {
        match self.fetch_repository(owner, name).await {
            Ok(_) => Ok(true),
            Err(RepoError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_repository(&self, request: &NewRepository) -> Result<RepoHandle, RepoError> {
        let full_name = format!("{}/{}", request.owner, request.name);
        let path = if request.organisation {
            format!("/orgs/{}/repos", request.owner)
        } else {
            "/user/repos".to_string()
        };
        let body = serde_json::json!({
            "name": request.name,
            "description": request.description,
            "homepage": request.homepage,
            "private": request.private,
            "auto_init": true,
        });
        info!(repo = %full_name, private = request.private, "Creating repository");
        let resp = self
            .send(
                self.request(Method::POST, &path, &self.token).json(&body),
                &full_name,
            )
            .await?;
        let repo: GhRepo = decode(resp).await?;
        Ok(repo.into())
    }

    async fn fetch_repository(&self, owner: &str, name: &str) -> Result<RepoHandle, RepoError> {
        let full_name = format!("{owner}/{name}");
        let resp = self
            .send(
                self.request(Method::GET, &format!("/repos/{full_name}"), &self.token),
                &full_name,
            )
            .await?;
        let repo: GhRepo = decode(resp).await?;
        Ok(repo.into())
    }

    async fn push_files(
        &self,
        repo: &RepoHandle,
        files: &[RepoFile],
        message: &str,
    ) -> Result<Vec<CommittedFile>, RepoError> {
        let engine = base64::engine::general_purpose::STANDARD;
        let mut committed = Vec::with_capacity(files.len());
        for file in files {
            let branch = file.branch.as_deref().unwrap_or(&repo.default_branch);
            let sha = self.existing_sha(repo, file, branch).await?;
            let mut body = serde_json::json!({
                "message": message,
                "content": engine.encode(&file.content),
                "branch": branch,
            });
            if let Some(sha) = sha {
                body["sha"] = serde_json::Value::String(sha);
            }
            let path = format!("/repos/{}/contents/{}", repo.full_name(), file.path);
            let resp = self
                .send(
                    self.request(Method::PUT, &path, &self.token).json(&body),
                    &repo.full_name(),
                )
                .await?;
            let put: GhPutContent = decode(resp).await?;
            debug!(path = %file.path, branch, sha = %put.content.sha, "Committed file");
            committed.push(CommittedFile {
                path: file.path.clone(),
                sha: put.content.sha,
            });
        }
        Ok(committed)
    }

    async fn ensure_branch(&self, repo: &RepoHandle, branch: &str) -> Result<(), RepoError> {
        match self.branch_head(repo, branch).await {
            Ok(_) => return Ok(()),
            Err(RepoError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        let base = self.branch_head(repo, &repo.default_branch).await?;
        info!(repo = %repo.full_name(), branch, base = %base, "Creating branch");
        let path = format!("/repos/{}/git/refs", repo.full_name());
        let result = self
            .send(
                self.request(Method::POST, &path, &self.token)
                    .json(&new_branch_body(branch, &base)),
                &repo.full_name(),
            )
            .await;
        match result {
            // Lost a race with another writer creating the same branch.
            Ok(_) | Err(RepoError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn make_public(&self, repo: &RepoHandle) -> Result<(), RepoError> {
        info!(repo = %repo.full_name(), "Making repository public");
        let body = serde_json::json!({ "private": false });
        self.send(
            self.request(
                Method::PATCH,
                &format!("/repos/{}", repo.full_name()),
                &self.token,
            )
            .json(&body),
            &repo.full_name(),
        )
        .await?;
        Ok(())
    }

    async fn delete_repository(&self, owner: &str, name: &str) -> Result<(), RepoError> {
        let full_name = format!("{owner}/{name}");
        info!(repo = %full_name, "Deleting repository");
        self.send(
            self.request(Method::DELETE, &format!("/repos/{full_name}"), &self.token),
            &full_name,
        )
        .await?;
        Ok(())
    }

    async fn organisation_avatar(&self, organisation: &str) -> Result<String, RepoError> {
        let token = self.admin_token.as_deref().unwrap_or(&self.token);
        let resp = self
            .send(
                self.request(Method::GET, &format!("/orgs/{organisation}"), token),
                organisation,
            )
            .await?;
        let org: GhOrganisation = decode(resp).await?;
        Ok(org.avatar_url)
    }
}
