//! Repository workspace boundary.
//!
//! Checkout and update of working copies is an external concern; the engine
//! only needs a path to a working copy and, when provisioning a container,
//! a PAT for the repository. Both are reached through the [`Workspace`]
//! trait so tests can substitute fixtures.

use crate::{
    error::{Error, Result},
    storage::Storage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ─── Repository specification ────────────────────────────────────────────────

/// A GitHub-style `owner/repo` identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSpec {
    pub owner: String,
    pub name: String,
}

impl RepoSpec {
    /// Parse `owner/repo`, tolerating a full `https://github.com/` URL and a
    /// trailing `.git`. Anything else is a credential error, reported with
    /// no partial state mutation.
    pub fn parse(spec: &str) -> Result<Self> {
        let trimmed = spec
            .trim()
            .strip_prefix("https://github.com/")
            .unwrap_or(spec.trim());
        let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
        let mut parts = trimmed.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => {
                let valid = |s: &str| {
                    s.chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
                };
                if valid(owner) && valid(name) {
                    Ok(Self {
                        owner: owner.to_string(),
                        name: name.to_string(),
                    })
                } else {
                    Err(Error::Credential(format!(
                        "repository spec contains invalid characters: {spec:?}"
                    )))
                }
            }
            _ => Err(Error::Credential(format!(
                "expected owner/repo, got {spec:?}"
            ))),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// A working copy the engine may hand to a session.
#[derive(Debug, Clone)]
pub struct Checkout {
    pub spec: RepoSpec,
    pub path: PathBuf,
    pub was_updated: bool,
    pub default_branch: Option<String>,
}

// ─── PAT records ──────────────────────────────────────────────────────────────

/// Repository credential record, one per repository full name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatRecord {
    pub repository_full_name: String,
    pub token: String,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl PatRecord {
    /// First 7 and last 4 characters, for listings. The full token is never
    /// rendered back to the chat interface. Counted in characters, not
    /// bytes, so a multibyte token cannot split a character.
    pub fn masked_token(&self) -> String {
        let count = self.token.chars().count();
        if count <= 11 {
            return "***".to_string();
        }
        let head: String = self.token.chars().take(7).collect();
        let tail: String = self.token.chars().skip(count - 4).collect();
        format!("{head}...{tail}")
    }
}

// ─── Workspace boundary ───────────────────────────────────────────────────────

#[async_trait]
pub trait Workspace: Send + Sync {
    /// Resolve a repository spec to a local working copy.
    async fn ensure_repository(&self, spec: &RepoSpec) -> Result<Checkout>;

    /// PAT for a repository, if one is registered. Consumed read-only when
    /// provisioning a container; injected into the provisioning tool's
    /// environment, never logged.
    async fn repository_pat(&self, full_name: &str) -> Result<Option<String>>;
}

/// Storage-backed workspace over a base directory of existing checkouts at
/// `<base>/<owner>/<repo>`. Clone/update is outside the engine; a missing
/// working copy is surfaced as a one-line error.
pub struct LocalWorkspace {
    base_dir: PathBuf,
    storage: Storage,
}

impl LocalWorkspace {
    pub fn new(base_dir: impl Into<PathBuf>, storage: Storage) -> Self {
        Self {
            base_dir: base_dir.into(),
            storage,
        }
    }

    pub fn repo_dir(&self, spec: &RepoSpec) -> PathBuf {
        self.base_dir.join(&spec.owner).join(&spec.name)
    }

    pub async fn save_pat(
        &self,
        full_name: &str,
        token: &str,
        description: Option<&str>,
    ) -> Result<()> {
        self.storage.upsert_pat(full_name, token, description).await
    }

    pub async fn list_pats(&self) -> Result<Vec<PatRecord>> {
        Ok(self
            .storage
            .list_pats()
            .await?
            .into_iter()
            .map(|row| PatRecord {
                repository_full_name: row.repo_full_name,
                token: row.token,
                description: row.description,
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
            .collect())
    }

    pub async fn delete_pat(&self, full_name: &str) -> Result<()> {
        self.storage.delete_pat(full_name).await
    }
}

#[async_trait]
impl Workspace for LocalWorkspace {
    async fn ensure_repository(&self, spec: &RepoSpec) -> Result<Checkout> {
        let path = self.repo_dir(spec);
        if !path.is_dir() {
            return Err(Error::Configuration(format!(
                "no working copy for {} at {}",
                spec.full_name(),
                path.display()
            )));
        }
        Ok(Checkout {
            spec: spec.clone(),
            path,
            was_updated: false,
            default_branch: None,
        })
    }

    async fn repository_pat(&self, full_name: &str) -> Result<Option<String>> {
        Ok(self.storage.get_pat(full_name).await?.map(|row| row.token))
    }
}

/// Convenience for binding a session directly to a path (console mode and
/// tests), bypassing the owner/repo directory layout.
pub fn checkout_at(path: impl Into<PathBuf>, spec: RepoSpec) -> Checkout {
    Checkout {
        spec,
        path: path.into(),
        was_updated: false,
        default_branch: None,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
