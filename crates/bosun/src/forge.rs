//! Hosting-service facade.
//!
//! Talks to a GitHub-style REST API for repository metadata, pull requests
//! and file contents. The access token is the one injected into sandboxes
//! for pushing session branches.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const DEFAULT_WEB_BASE: &str = "https://github.com";
const USER_AGENT: &str = concat!("bosun/", env!("CARGO_PKG_VERSION"));

/// Authentication probe result.
#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A repository as reported by the hosting service.
#[derive(Debug, Clone, Deserialize)]
pub struct ForgeRepo {
    pub name: String,
    pub full_name: String,
    pub default_branch: String,
    #[serde(default)]
    pub private: bool,
}

/// A pull request for a session branch.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub html_url: String,
    pub state: String,
}

/// Filters for listing repositories.
#[derive(Debug, Clone, Default)]
pub struct RepoQuery {
    pub limit: Option<u32>,
    pub owner: Option<String>,
    pub visibility: Option<String>,
}

/// Web URLs for a repository and an optional branch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgeUrls {
    pub repo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compare: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_pr: Option<String>,
}

/// Options for [`ForgeApi::urls_for`].
#[derive(Debug, Clone, Default)]
pub struct UrlOpts {
    pub branch: Option<String>,
    pub base_branch: Option<String>,
}

/// Hosting-service operations the control plane needs.
#[async_trait]
pub trait ForgeApi: Send + Sync {
    async fn check_auth(&self) -> Result<AuthStatus>;
    async fn get_access_token(&self) -> Result<String>;
    async fn list_repos(&self, query: &RepoQuery) -> Result<Vec<ForgeRepo>>;
    async fn get_repo(&self, owner: &str, name: &str) -> Result<Option<ForgeRepo>>;
    async fn find_prs_for_branch(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> Result<Vec<PullRequest>>;
    async fn get_file(
        &self,
        owner: &str,
        name: &str,
        path: &str,
        reference: Option<&str>,
    ) -> Result<Option<String>>;
    fn urls_for(&self, owner: &str, name: &str, opts: &UrlOpts) -> ForgeUrls;
}

/// GitHub REST client.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    api_base: String,
    web_base: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            web_base: DEFAULT_WEB_BASE.to_string(),
            token: std::env::var("GITHUB_TOKEN").ok(),
        }
    }

    pub fn with_base(mut self, api_base: impl Into<String>, web_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.web_base = web_base.into();
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .get(format!("{}{}", self.api_base, path))
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }
        req
    }
}

impl Default for GitHubClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[async_trait]
impl ForgeApi for GitHubClient {
    async fn check_auth(&self) -> Result<AuthStatus> {
        if self.token.is_none() {
            return Ok(AuthStatus {
                ok: false,
                user: None,
                error: Some("no access token configured".to_string()),
            });
        }

        let response = self
            .request("/user")
            .send()
            .await
            .context("probing hosting-service auth")?;

        if !response.status().is_success() {
            return Ok(AuthStatus {
                ok: false,
                user: None,
                error: Some(format!("auth probe returned {}", response.status())),
            });
        }

        let user: UserResponse = response.json().await.context("parsing auth probe")?;
        Ok(AuthStatus {
            ok: true,
            user: Some(user.login),
            error: None,
        })
    }

    async fn get_access_token(&self) -> Result<String> {
        self.token
            .clone()
            .context("no hosting-service access token configured (set GITHUB_TOKEN)")
    }

    async fn list_repos(&self, query: &RepoQuery) -> Result<Vec<ForgeRepo>> {
        let mut path = match &query.owner {
            Some(owner) => format!("/users/{}/repos?per_page={}", owner, query.limit.unwrap_or(100)),
            None => format!("/user/repos?per_page={}", query.limit.unwrap_or(100)),
        };
        if let Some(ref visibility) = query.visibility {
            path.push_str(&format!("&visibility={}", visibility));
        }

        let repos: Vec<ForgeRepo> = self
            .request(&path)
            .send()
            .await
            .context("listing repos")?
            .error_for_status()
            .context("listing repos")?
            .json()
            .await
            .context("parsing repo list")?;

        Ok(repos)
    }

    async fn get_repo(&self, owner: &str, name: &str) -> Result<Option<ForgeRepo>> {
        let response = self
            .request(&format!("/repos/{}/{}", owner, name))
            .send()
            .await
            .context("fetching repo")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let repo: ForgeRepo = response
            .error_for_status()
            .context("fetching repo")?
            .json()
            .await
            .context("parsing repo")?;
        Ok(Some(repo))
    }

    async fn find_prs_for_branch(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> Result<Vec<PullRequest>> {
        let path = format!(
            "/repos/{}/{}/pulls?head={}:{}&state=all",
            owner, name, owner, branch
        );
        let prs: Vec<PullRequest> = self
            .request(&path)
            .send()
            .await
            .context("listing pull requests")?
            .error_for_status()
            .context("listing pull requests")?
            .json()
            .await
            .context("parsing pull requests")?;

        Ok(prs)
    }

    async fn get_file(
        &self,
        owner: &str,
        name: &str,
        path: &str,
        reference: Option<&str>,
    ) -> Result<Option<String>> {
        let mut api_path = format!("/repos/{}/{}/contents/{}", owner, name, path);
        if let Some(reference) = reference {
            api_path.push_str(&format!("?ref={}", reference));
        }

        let response = self
            .request(&api_path)
            .send()
            .await
            .context("fetching file contents")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let contents: ContentsResponse = response
            .error_for_status()
            .context("fetching file contents")?
            .json()
            .await
            .context("parsing file contents")?;

        match (contents.content, contents.encoding.as_deref()) {
            (Some(content), Some("base64")) => {
                let stripped: String = content.chars().filter(|c| !c.is_whitespace()).collect();
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(stripped)
                    .context("decoding file contents")?;
                Ok(Some(String::from_utf8_lossy(&bytes).to_string()))
            }
            (Some(content), _) => Ok(Some(content)),
            (None, _) => Ok(None),
        }
    }

    fn urls_for(&self, owner: &str, name: &str, opts: &UrlOpts) -> ForgeUrls {
        let repo = format!("{}/{}/{}", self.web_base, owner, name);
        let branch = opts
            .branch
            .as_ref()
            .map(|b| format!("{}/tree/{}", repo, b));
        let compare = match (&opts.base_branch, &opts.branch) {
            (Some(base), Some(head)) => Some(format!("{}/compare/{}...{}", repo, base, head)),
            _ => None,
        };
        let new_pr = opts
            .branch
            .as_ref()
            .map(|b| format!("{}/pull/new/{}", repo, b));

        ForgeUrls {
            repo,
            branch,
            compare,
            new_pr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_for_branch() {
        let client = GitHubClient::new().with_token(None);
        let urls = client.urls_for(
            "acme",
            "webapp",
            &UrlOpts {
                branch: Some("agent/webapp/0a1b2c3d".to_string()),
                base_branch: Some("main".to_string()),
            },
        );
        assert_eq!(urls.repo, "https://github.com/acme/webapp");
        assert_eq!(
            urls.compare.as_deref(),
            Some("https://github.com/acme/webapp/compare/main...agent/webapp/0a1b2c3d")
        );
        assert_eq!(
            urls.new_pr.as_deref(),
            Some("https://github.com/acme/webapp/pull/new/agent/webapp/0a1b2c3d")
        );
    }
}
